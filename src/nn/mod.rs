//! Neural network building blocks shared by the diffusion layers.

pub mod dropout;
pub mod init;
pub mod linear;
pub mod norm;

pub use dropout::Dropout;
pub use init::{calculate_gain, Nonlinearity};
pub use linear::Linear;
pub use norm::{BatchNorm1d, LayerNorm, NormCache, NormGrads, RunningStats};
