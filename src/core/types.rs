//! Common types used across diffgat modules.

use crate::core::error::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dense row-major node feature matrix (`num_nodes × width`).
pub type Matrix = Array2<f32>;

/// Execution mode of a forward pass.
///
/// Training mode enables dropout on the normalized edge weights and makes
/// batch normalization use (and update) batch statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Training,
    #[default]
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

/// Element-wise activation functions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Exponential linear unit with alpha = 1
    #[default]
    Elu,
    Relu,
    /// Leaky ReLU with the given negative slope
    LeakyRelu(f32),
    Tanh,
    Sigmoid,
}

impl Activation {
    /// Apply to a single value.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp_m1()
                }
            }
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu(slope) => leaky_relu(x, slope),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// Apply to every element of a matrix.
    pub fn apply_matrix(self, m: &Matrix) -> Matrix {
        m.mapv(|x| self.apply(x))
    }

    /// Derivative at the pre-activation value `x`.
    pub fn derivative(self, x: f32) -> f32 {
        match self {
            Activation::Elu => {
                if x > 0.0 {
                    1.0
                } else {
                    x.exp()
                }
            }
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu(slope) => {
                if x >= 0.0 {
                    1.0
                } else {
                    slope
                }
            }
            Activation::Tanh => 1.0 - x.tanh().powi(2),
            Activation::Sigmoid => {
                let s = self.apply(x);
                s * (1.0 - s)
            }
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "elu" => Ok(Activation::Elu),
            "relu" => Ok(Activation::Relu),
            "leaky_relu" | "leakyrelu" => Ok(Activation::LeakyRelu(DEFAULT_NEGATIVE_SLOPE)),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(Error::UnknownActivation(other.to_string())),
        }
    }
}

/// Default negative slope for leaky ReLU on attention logits.
pub const DEFAULT_NEGATIVE_SLOPE: f32 = 0.01;

/// Leaky rectified linear unit.
#[inline]
pub fn leaky_relu(x: f32, slope: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        slope * x
    }
}

/// How a multi-head layer combines its heads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    /// Concatenate head outputs and project back with `Wo`.
    #[default]
    #[serde(rename = "cat", alias = "concat")]
    Concat,
    /// Element-wise mean of head outputs.
    #[serde(rename = "mean", alias = "avg", alias = "average")]
    Mean,
}

impl FromStr for MergeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cat" | "concat" => Ok(MergeMode::Concat),
            "mean" | "avg" | "average" => Ok(MergeMode::Mean),
            other => Err(Error::UnknownMergeMode(other.to_string())),
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMode::Concat => write!(f, "cat"),
            MergeMode::Mean => write!(f, "mean"),
        }
    }
}

/// Which value a single diffusion head returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadOutput {
    /// Return the raw diffusion accumulator. The batch-norm, activation and
    /// residual branches run on the last hop but do not reach the output.
    #[default]
    Diffused,
    /// Route the accumulator through batch-norm, activation and residual.
    Connected,
}
