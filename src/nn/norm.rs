//! Layer and batch normalization over node feature matrices.

use crate::core::{Error, Matrix, Mode, Result};
use ndarray::{Array1, Axis};
use std::sync::RwLock;

const DEFAULT_EPS: f32 = 1e-5;
const DEFAULT_MOMENTUM: f32 = 0.1;

/// Normalizes each row (node) over its features.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps: DEFAULT_EPS,
        }
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        self.forward_cached(x).map(|(out, _)| out)
    }

    /// Forward pass that also returns what [`backward`](Self::backward) needs.
    pub fn forward_cached(&self, x: &Matrix) -> Result<(Matrix, NormCache)> {
        check_width("layer norm input", x, self.dim())?;
        let mean = x
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(x.nrows()));
        let inv_std = x.var_axis(Axis(1), 0.0).mapv(|v| 1.0 / (v + self.eps).sqrt());
        let normalized = (x - &mean.insert_axis(Axis(1))) * &inv_std.view().insert_axis(Axis(1));
        let out = &normalized * &self.gamma + &self.beta;
        let cache = NormCache {
            normalized,
            inv_std,
            stats_axis: Axis(1),
            batch_stats: true,
        };
        Ok((out, cache))
    }

    pub fn backward(&self, cache: &NormCache, grad_out: &Matrix) -> Result<(Matrix, NormGrads)> {
        cache.backward(&self.gamma, grad_out)
    }
}

/// Intermediate values of a normalization forward pass.
#[derive(Clone, Debug)]
pub struct NormCache {
    normalized: Matrix,
    inv_std: Array1<f32>,
    /// Axis the statistics are reduced over
    stats_axis: Axis,
    /// Whether the statistics came from the input itself
    batch_stats: bool,
}

/// Gradients of a normalization's scale and shift.
#[derive(Clone, Debug, PartialEq)]
pub struct NormGrads {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

impl NormGrads {
    pub fn zeros(dim: usize) -> Self {
        Self {
            gamma: Array1::zeros(dim),
            beta: Array1::zeros(dim),
        }
    }
}

impl NormCache {
    fn backward(&self, gamma: &Array1<f32>, grad_out: &Matrix) -> Result<(Matrix, NormGrads)> {
        if grad_out.shape() != self.normalized.shape() {
            return Err(Error::shape(
                "normalization output gradient",
                self.normalized.shape(),
                grad_out.shape(),
            ));
        }
        let grads = NormGrads {
            gamma: (grad_out * &self.normalized).sum_axis(Axis(0)),
            beta: grad_out.sum_axis(Axis(0)),
        };

        let axis = self.stats_axis;
        let grad_norm = grad_out * gamma;
        let inv_std = self.inv_std.view().insert_axis(axis);
        if !self.batch_stats {
            return Ok((grad_norm * &inv_std, grads));
        }

        // dx = inv_std / n · (n·dx̂ - Σdx̂ - x̂·Σ(dx̂·x̂))
        let n = grad_norm.len_of(axis) as f32;
        let sum = grad_norm.sum_axis(axis).insert_axis(axis);
        let dot = (&grad_norm * &self.normalized)
            .sum_axis(axis)
            .insert_axis(axis);
        let centered = &grad_norm * n - &sum - &(&self.normalized * &dot);
        Ok((centered * &inv_std / n, grads))
    }
}

/// Running statistics tracked by [`BatchNorm1d`].
#[derive(Clone, Debug, PartialEq)]
pub struct RunningStats {
    pub mean: Array1<f32>,
    pub var: Array1<f32>,
}

/// Normalizes each feature column over the nodes of the batch.
///
/// Training-mode calls normalize with the batch statistics and fold them into
/// the running statistics; inference uses the running statistics only.
#[derive(Debug)]
pub struct BatchNorm1d {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    running: RwLock<RunningStats>,
    momentum: f32,
    eps: f32,
}

impl BatchNorm1d {
    pub fn new(dim: usize) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            running: RwLock::new(RunningStats {
                mean: Array1::zeros(dim),
                var: Array1::ones(dim),
            }),
            momentum: DEFAULT_MOMENTUM,
            eps: DEFAULT_EPS,
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    /// Snapshot of the running statistics.
    pub fn running_stats(&self) -> RunningStats {
        self.running
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_running_stats(&mut self, stats: RunningStats) -> Result<()> {
        if stats.mean.len() != self.dim() || stats.var.len() != self.dim() {
            return Err(Error::shape(
                "batch norm running stats",
                &[self.dim()],
                &[stats.mean.len().max(stats.var.len())],
            ));
        }
        *self
            .running
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = stats;
        Ok(())
    }

    pub fn forward(&self, x: &Matrix, mode: Mode) -> Result<Matrix> {
        self.forward_cached(x, mode).map(|(out, _)| out)
    }

    /// Forward pass that also returns what [`backward`](Self::backward) needs.
    pub fn forward_cached(&self, x: &Matrix, mode: Mode) -> Result<(Matrix, NormCache)> {
        check_width("batch norm input", x, self.dim())?;
        let n = x.nrows();
        let batch_stats = mode.is_training() && n > 0;

        let (mean, var) = if batch_stats {
            let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(self.dim()));
            let var = x.var_axis(Axis(0), 0.0);
            let unbiased = if n > 1 {
                &var * (n as f32 / (n - 1) as f32)
            } else {
                var.clone()
            };

            let mut running = self
                .running
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let m = self.momentum;
            running.mean = &running.mean * (1.0 - m) + &mean * m;
            running.var = &running.var * (1.0 - m) + &unbiased * m;
            (mean, var)
        } else {
            let stats = self.running_stats();
            (stats.mean, stats.var)
        };

        let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let normalized = (x - &mean) * &inv_std;
        let out = &normalized * &self.gamma + &self.beta;
        let cache = NormCache {
            normalized,
            inv_std,
            stats_axis: Axis(0),
            batch_stats,
        };
        Ok((out, cache))
    }

    pub fn backward(&self, cache: &NormCache, grad_out: &Matrix) -> Result<(Matrix, NormGrads)> {
        cache.backward(&self.gamma, grad_out)
    }
}

impl Clone for BatchNorm1d {
    fn clone(&self) -> Self {
        Self {
            gamma: self.gamma.clone(),
            beta: self.beta.clone(),
            running: RwLock::new(self.running_stats()),
            momentum: self.momentum,
            eps: self.eps,
        }
    }
}

fn check_width(what: &str, x: &Matrix, dim: usize) -> Result<()> {
    if x.ncols() != dim {
        return Err(Error::shape(what, &[x.nrows(), dim], x.shape()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_layer_norm_rows_zero_mean() {
        let ln = LayerNorm::new(4);
        let x = array![[1.0, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 14.0]];
        let y = ln.forward(&x).unwrap();
        for row in y.rows() {
            assert!(row.sum().abs() < 1e-5);
            let var = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_width_checked() {
        let ln = LayerNorm::new(3);
        assert!(ln.forward(&Matrix::zeros((2, 4))).is_err());
    }

    #[test]
    fn test_batch_norm_training_normalizes_columns() {
        let bn = BatchNorm1d::new(2);
        let x = array![[1.0, 10.0], [3.0, 30.0]];
        let y = bn.forward(&x, Mode::Training).unwrap();
        assert!((y[[0, 0]] + 1.0).abs() < 1e-3);
        assert!((y[[1, 1]] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_batch_norm_updates_running_stats() {
        let bn = BatchNorm1d::new(1);
        let x = array![[1.0], [3.0]];
        bn.forward(&x, Mode::Training).unwrap();
        let stats = bn.running_stats();
        // mean 2, unbiased var 2
        assert!((stats.mean[0] - 0.2).abs() < 1e-6);
        assert!((stats.var[0] - (0.9 + 0.2)).abs() < 1e-6);
    }

    #[test]
    fn test_batch_norm_inference_uses_running_stats() {
        let bn = BatchNorm1d::new(2);
        let x = array![[1.0, -1.0]];
        let y = bn.forward(&x, Mode::Inference).unwrap();
        assert!((y[[0, 0]] - 1.0).abs() < 1e-4);
        assert_eq!(bn.running_stats().mean, array![0.0, 0.0]);
    }

    #[test]
    fn test_batch_norm_clone_copies_stats() {
        let bn = BatchNorm1d::new(1);
        bn.forward(&array![[2.0], [4.0]], Mode::Training).unwrap();
        let copy = bn.clone();
        assert_eq!(copy.running_stats(), bn.running_stats());
    }

    fn weighted_sum(y: &Matrix, r: &Matrix) -> f32 {
        (y * r).sum()
    }

    fn assert_input_grad_matches<F>(x: &Matrix, r: &Matrix, analytic: &Matrix, f: F)
    where
        F: Fn(&Matrix) -> Matrix,
    {
        let eps = 1e-2;
        for idx in 0..x.len() {
            let (i, j) = (idx / x.ncols(), idx % x.ncols());
            let mut plus = x.clone();
            plus[[i, j]] += eps;
            let mut minus = x.clone();
            minus[[i, j]] -= eps;
            let numeric =
                (weighted_sum(&f(&plus), r) - weighted_sum(&f(&minus), r)) / (2.0 * eps);
            let a = analytic[[i, j]];
            assert!((numeric - a).abs() < 1e-2 + 2e-2 * a.abs(), "{} vs {}", numeric, a);
        }
    }

    #[test]
    fn test_layer_norm_backward() {
        let mut ln = LayerNorm::new(3);
        ln.gamma = array![1.5, -0.5, 2.0];
        ln.beta = array![0.1, 0.2, 0.3];
        let x = array![[0.3, -1.2, 0.8], [2.0, 0.5, -0.4]];
        let r = array![[1.0, 0.5, -2.0], [0.3, -1.0, 0.7]];

        let (y, cache) = ln.forward_cached(&x).unwrap();
        assert_eq!(y, ln.forward(&x).unwrap());
        let (dx, grads) = ln.backward(&cache, &r).unwrap();

        for (b, e) in grads.beta.iter().zip([1.3, -0.5, -1.3]) {
            assert!((b - e).abs() < 1e-6);
        }
        assert_input_grad_matches(&x, &r, &dx, |x| ln.forward(x).unwrap());
    }

    #[test]
    fn test_batch_norm_backward_training() {
        let mut bn = BatchNorm1d::new(2);
        bn.gamma = array![0.7, 1.3];
        let x = array![[0.5, -1.0], [1.5, 0.25], [-0.75, 2.0]];
        let r = array![[1.0, -0.5], [0.2, 0.4], [-1.0, 1.5]];

        let (_, cache) = bn.forward_cached(&x, Mode::Training).unwrap();
        let (dx, _) = bn.backward(&cache, &r).unwrap();
        assert_input_grad_matches(&x, &r, &dx, |x| bn.forward(x, Mode::Training).unwrap());
    }

    #[test]
    fn test_batch_norm_backward_inference_is_affine() {
        let bn = BatchNorm1d::new(2);
        let x = array![[0.5, -1.0], [1.5, 0.25]];
        let r = array![[1.0, -0.5], [0.2, 0.4]];
        let (_, cache) = bn.forward_cached(&x, Mode::Inference).unwrap();
        let (dx, grads) = bn.backward(&cache, &r).unwrap();

        let scale = 1.0 / (1.0f32 + 1e-5).sqrt();
        for (d, g) in dx.iter().zip(r.iter()) {
            assert!((d - g * scale).abs() < 1e-6);
        }
        for (b, e) in grads.beta.iter().zip([1.2, -0.1]) {
            assert!((b - e).abs() < 1e-6);
        }
    }
}
