//! Parameter initializers.

use crate::core::{Error, Matrix, Result};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

/// Nonlinearities with a recommended initialization gain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Nonlinearity {
    Linear,
    Relu,
    LeakyRelu(f32),
    Tanh,
    Sigmoid,
}

/// Recommended gain for a nonlinearity.
pub fn calculate_gain(nonlinearity: Nonlinearity) -> f32 {
    match nonlinearity {
        Nonlinearity::Linear | Nonlinearity::Sigmoid => 1.0,
        Nonlinearity::Relu => 2.0_f32.sqrt(),
        Nonlinearity::LeakyRelu(slope) => (2.0 / (1.0 + slope * slope)).sqrt(),
        Nonlinearity::Tanh => 5.0 / 3.0,
    }
}

/// Xavier/Glorot normal init for a `fan_out × fan_in` weight matrix.
pub fn xavier_normal<R: Rng + ?Sized>(
    fan_out: usize,
    fan_in: usize,
    gain: f32,
    rng: &mut R,
) -> Result<Matrix> {
    let std = gain * (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    let normal = Normal::new(0.0, std).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    Ok(Array2::from_shape_fn((fan_out, fan_in), |_| normal.sample(rng)))
}

/// Uniform init in `±1/sqrt(fan_in)`, the default for linear layers.
pub fn fan_in_uniform<R: Rng + ?Sized>(fan_out: usize, fan_in: usize, rng: &mut R) -> Matrix {
    let uniform = fan_in_distribution(fan_in);
    Array2::from_shape_fn((fan_out, fan_in), |_| uniform.sample(rng))
}

/// Bias vector counterpart of [`fan_in_uniform`].
pub fn fan_in_uniform_bias<R: Rng + ?Sized>(len: usize, fan_in: usize, rng: &mut R) -> Array1<f32> {
    let uniform = fan_in_distribution(fan_in);
    Array1::from_shape_fn(len, |_| uniform.sample(rng))
}

fn fan_in_distribution(fan_in: usize) -> Uniform<f32> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Uniform::new_inclusive(-bound, bound)
}
