//! # diffgat - Diffusion Graph Attention for Temporal KGQA
//!
//! Node embedding model for knowledge-graph question answering:
//! - **Graph**: immutable relational multigraph with relation embeddings
//! - **GNN**: edge attention + attention diffusion heads, multi-head layers
//!   and the stacked network
//! - **NN**: linear, normalization and dropout building blocks
//!
//! ## Quick Start
//!
//! ```rust
//! use diffgat::core::Mode;
//! use diffgat::gnn::{GatNet, NetworkConfig};
//! use diffgat::graph::{uniform_relation_table, GraphBuilder};
//! use ndarray::Array2;
//!
//! let graph = GraphBuilder::new(3)
//!     .relation_embeddings(uniform_relation_table(1, 8, 0.1))
//!     .add_edge(0, 0, 1)
//!     .add_edge(1, 0, 2)
//!     .build()
//!     .unwrap();
//!
//! let net = GatNet::new(NetworkConfig {
//!     num_feats: 8,
//!     num_hidden: 8,
//!     num_classes: 8,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let embeddings = net
//!     .forward(&graph, &Array2::ones((3, 8)), Mode::Inference)
//!     .unwrap();
//! assert_eq!(embeddings.shape(), &[3, 8]);
//! ```

pub mod core;
pub mod gnn;
pub mod graph;
pub mod monitoring;
pub mod nn;

#[cfg(feature = "python")]
pub mod python;

pub use crate::core::error::{Error, Result};
