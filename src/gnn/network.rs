//! Stacked diffusion attention network.

use crate::core::{Error, Matrix, Mode, Result};
use crate::gnn::config::NetworkConfig;
use crate::gnn::multihead::{GatLayer, LayerTape};
use crate::gnn::params::ParameterSet;
use crate::graph::RelationalGraph;
use rand::Rng;
use tracing::{debug, info};

/// Node embedding model: `num_layers` multi-head layers applied in order.
#[derive(Clone, Debug)]
pub struct GatNet {
    config: NetworkConfig,
    pub(crate) layers: Vec<GatLayer>,
}

/// Recorded forward pass of every layer.
#[derive(Clone, Debug, Default)]
pub struct NetworkTape {
    layers: Vec<LayerTape>,
}

/// Result of [`GatNet::backward`].
#[derive(Clone, Debug)]
pub struct Gradients {
    /// Named like [`GatNet::parameters`], without the batch-norm running
    /// statistics
    pub params: ParameterSet,
    /// Gradient w.r.t. the input node features
    pub features: Matrix,
    /// Gradient w.r.t. the graph's relation embedding table
    pub relation_embeddings: Matrix,
}

impl GatNet {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let layers = config
            .layer_configs()
            .into_iter()
            .map(|layer| GatLayer::with_rng(layer, rng))
            .collect::<Result<Vec<_>>>()?;

        info!(
            layers = layers.len(),
            heads = config.num_heads,
            k = config.k,
            alpha = config.alpha,
            merge = %config.merge,
            num_feats = config.num_feats,
            num_classes = config.num_classes,
            "built diffusion attention network"
        );
        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn layers(&self) -> &[GatLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [GatLayer] {
        &mut self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Output width of the final layer.
    pub fn out_dim(&self) -> usize {
        self.layers.last().map_or(0, GatLayer::out_dim)
    }

    /// Embed every node of `graph` starting from `features`.
    pub fn forward(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
    ) -> Result<Matrix> {
        self.forward_with_rng(graph, features, mode, &mut rand::thread_rng())
    }

    /// Forward pass with training dropout drawn from `rng`; the same seed
    /// gives the same output.
    pub fn forward_with_rng<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
    ) -> Result<Matrix> {
        self.check_graph(graph)?;
        let mut h = features.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward_with_rng(graph, &h, mode, rng)?;
            debug!(layer = i, width = h.ncols(), "layer done");
        }
        Ok(h)
    }

    /// Forward pass that keeps what [`backward`](Self::backward) needs.
    pub fn forward_recorded<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
    ) -> Result<(Matrix, NetworkTape)> {
        self.check_graph(graph)?;
        let mut tape = NetworkTape::default();
        let mut h = features.clone();
        for layer in &self.layers {
            let (out, layer_tape) = layer.forward_recorded(graph, &h, mode, rng)?;
            tape.layers.push(layer_tape);
            h = out;
        }
        Ok((h, tape))
    }

    /// Gradients of `Σ grad_output ⊙ output` for a pass recorded on `graph`.
    pub fn backward(
        &self,
        graph: &RelationalGraph,
        tape: &NetworkTape,
        grad_output: &Matrix,
    ) -> Result<Gradients> {
        if tape.layers.len() != self.layers.len() {
            return Err(Error::TapeMismatch(format!(
                "{} layers recorded, network has {}",
                tape.layers.len(),
                self.layers.len()
            )));
        }
        let mut relation_embeddings = Matrix::zeros(graph.relation_embeddings().raw_dim());
        let mut grad = grad_output.clone();
        let mut layer_grads = Vec::with_capacity(self.layers.len());
        for (layer, layer_tape) in self.layers.iter().zip(&tape.layers).rev() {
            let (grads, dx) = layer.backward(graph, layer_tape, &grad, &mut relation_embeddings)?;
            layer_grads.push(grads);
            grad = dx;
        }

        let mut params = ParameterSet::new();
        for (i, grads) in layer_grads.iter().rev().enumerate() {
            grads.export(&format!("layers.{}", i), &mut params);
        }
        debug!(tensors = params.len(), "backward done");
        Ok(Gradients {
            params,
            features: grad,
            relation_embeddings,
        })
    }

    /// Forward pass using the features attached to the graph.
    pub fn forward_attached(&self, graph: &RelationalGraph, mode: Mode) -> Result<Matrix> {
        let features = graph.node_features().ok_or_else(|| {
            Error::InvalidConfig("graph carries no node features".to_string())
        })?;
        self.forward(graph, features, mode)
    }

    fn check_graph(&self, graph: &RelationalGraph) -> Result<()> {
        if self.config.num_rels != 0 && graph.num_relations() != self.config.num_rels {
            return Err(Error::InvalidConfig(format!(
                "network expects {} relations, graph has {}",
                self.config.num_rels,
                graph.num_relations()
            )));
        }
        Ok(())
    }
}
