//! Diffusion Graph Attention Module
//!
//! Provides the node embedding model for knowledge-graph question answering:
//! - Edge attention over `[source ‖ relation ‖ destination]`
//! - Attention diffusion with learned PPR-style hop weights
//! - Single-head, multi-head and stacked network layers
//! - Recorded forward passes and backward gradients
//! - Named parameter snapshots for an external training loop

pub mod attention;
pub mod config;
pub mod diffusion;
pub mod layer;
pub mod multihead;
pub mod network;
pub mod params;
pub mod sparse;

pub use attention::{AttentionWeight, EdgeAttention};
pub use config::{HeadConfig, LayerConfig, NetworkConfig};
pub use diffusion::{
    ppr_coefficients, Diffusion, DiffusionGrads, DiffusionKernel, DiffusionTape, PropagationTrace,
};
pub use layer::{HeadGrads, HeadTape, ResidualMap, SingleHeadGatLayer};
pub use multihead::{GatLayer, LayerGrads, LayerTape};
pub use network::{GatNet, Gradients, NetworkTape};
pub use params::{ParameterSet, Parameterized, Tensor};
pub use sparse::{edge_softmax, edge_softmax_backward, scatter_sum, scatter_sum_backward};
