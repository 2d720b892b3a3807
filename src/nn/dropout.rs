//! Inverted dropout.

use crate::core::{Error, Mode, Result};
use ndarray::Array1;
use rand::Rng;

/// Zeroes elements with probability `p` during training and rescales the
/// survivors by `1 / (1 - p)`. Identity at inference.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self { p })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    /// Draw a scaling mask of `len` entries, each `0` or `1 / (1 - p)`.
    ///
    /// `None` when dropout is the identity for `mode`.
    pub fn mask<R: Rng + ?Sized>(
        &self,
        len: usize,
        mode: Mode,
        rng: &mut R,
    ) -> Option<Array1<f32>> {
        if !mode.is_training() || self.p == 0.0 {
            return None;
        }
        let scale = 1.0 / (1.0 - self.p);
        Some(
            (0..len)
                .map(|_| if rng.gen::<f32>() < self.p { 0.0 } else { scale })
                .collect(),
        )
    }

    pub fn apply<R: Rng + ?Sized>(&self, x: Array1<f32>, mode: Mode, rng: &mut R) -> Array1<f32> {
        match self.mask(x.len(), mode, rng) {
            Some(mask) => x * mask,
            None => x,
        }
    }
}
