//! Fully connected layer.

use crate::core::{Error, Matrix, Result};
use crate::nn::init::{fan_in_uniform, fan_in_uniform_bias, xavier_normal};
use ndarray::{Array1, Axis};
use rand::Rng;

/// Affine map `y = x Wᵀ + b` applied row-wise.
#[derive(Clone, Debug)]
pub struct Linear {
    /// `out_dim × in_dim`
    pub weight: Matrix,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    /// Create with the default fan-in uniform initialization.
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, bias: bool, rng: &mut R) -> Self {
        Self {
            weight: fan_in_uniform(out_dim, in_dim, rng),
            bias: bias.then(|| fan_in_uniform_bias(out_dim, in_dim, rng)),
        }
    }

    /// Re-initialize the weight with Xavier normal; the bias keeps its value.
    pub fn reset_xavier_normal<R: Rng + ?Sized>(&mut self, gain: f32, rng: &mut R) -> Result<()> {
        self.weight = xavier_normal(self.out_dim(), self.in_dim(), gain, rng)?;
        Ok(())
    }

    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        if x.ncols() != self.in_dim() {
            return Err(Error::shape(
                "linear input",
                &[x.nrows(), self.in_dim()],
                x.shape(),
            ));
        }
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += b;
        }
        Ok(y)
    }

    /// A layer of the same shape with every value zero, used to accumulate
    /// gradients.
    pub fn zeros_like(&self) -> Self {
        Self {
            weight: Matrix::zeros(self.weight.raw_dim()),
            bias: self.bias.as_ref().map(|b| Array1::zeros(b.len())),
        }
    }

    /// Backward pass of [`forward`](Self::forward) at input `x`.
    ///
    /// Adds `dW` and `db` into `grad` and returns the gradient w.r.t. `x`.
    pub fn backward(&self, x: &Matrix, grad_out: &Matrix, grad: &mut Linear) -> Result<Matrix> {
        if x.ncols() != self.in_dim() {
            return Err(Error::shape(
                "linear input",
                &[x.nrows(), self.in_dim()],
                x.shape(),
            ));
        }
        if grad_out.dim() != (x.nrows(), self.out_dim()) {
            return Err(Error::shape(
                "linear output gradient",
                &[x.nrows(), self.out_dim()],
                grad_out.shape(),
            ));
        }
        if grad.weight.dim() != self.weight.dim() {
            return Err(Error::shape(
                "linear weight gradient",
                self.weight.shape(),
                grad.weight.shape(),
            ));
        }

        grad.weight += &grad_out.t().dot(x);
        if let Some(b) = grad.bias.as_mut() {
            *b += &grad_out.sum_axis(Axis(0));
        }
        Ok(grad_out.dot(&self.weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_forward_known_weights() {
        let layer = Linear {
            weight: array![[1.0, 0.0, 2.0], [0.0, 1.0, -1.0]],
            bias: Some(array![0.5, -0.5]),
        };
        let x = array![[1.0, 2.0, 3.0]];
        let y = layer.forward(&x).unwrap();
        assert_eq!(y, array![[7.5, -1.5]]);
    }

    #[test]
    fn test_forward_rejects_bad_width() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(4, 2, true, &mut rng);
        assert!(layer.forward(&Matrix::zeros((3, 5))).is_err());
    }

    #[test]
    fn test_no_bias() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(4, 2, false, &mut rng);
        assert!(layer.bias.is_none());
        assert_eq!((layer.in_dim(), layer.out_dim()), (4, 2));
    }

    #[test]
    fn test_backward_known_weights() {
        let layer = Linear {
            weight: array![[1.0, 0.0, 2.0], [0.0, 1.0, -1.0]],
            bias: Some(array![0.5, -0.5]),
        };
        let x = array![[1.0, 2.0, 3.0], [0.0, 1.0, 0.0]];
        let dy = array![[1.0, 0.0], [2.0, -1.0]];
        let mut grad = layer.zeros_like();
        let dx = layer.backward(&x, &dy, &mut grad).unwrap();

        assert_eq!(dx, array![[1.0, 0.0, 2.0], [2.0, -1.0, 5.0]]);
        assert_eq!(grad.weight, array![[1.0, 4.0, 3.0], [0.0, -1.0, 0.0]]);
        assert_eq!(grad.bias, Some(array![3.0, -1.0]));

        // a second call accumulates
        layer.backward(&x, &dy, &mut grad).unwrap();
        assert_eq!(grad.bias, Some(array![6.0, -2.0]));
    }

    #[test]
    fn test_backward_shape_checked() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(3, 2, true, &mut rng);
        let mut grad = layer.zeros_like();
        let x = Matrix::zeros((4, 3));
        assert!(layer.backward(&x, &Matrix::zeros((4, 3)), &mut grad).is_err());
        assert!(layer.backward(&x, &Matrix::zeros((4, 2)), &mut grad).is_ok());
    }
}
