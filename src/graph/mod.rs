//! Relational multigraph consumed by the diffusion layers.
//!
//! - `multigraph`: the immutable edge store with a by-destination index
//! - `builder`: construction from edges, per-relation adjacency and triplets

pub mod builder;
pub mod multigraph;

pub use builder::{uniform_relation_table, GraphBuilder};
pub use multigraph::{Edge, RelationalGraph};
