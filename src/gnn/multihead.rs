//! Multi-head diffusion attention layer.

use crate::core::{Error, Matrix, MergeMode, Mode, Result};
use crate::gnn::config::LayerConfig;
use crate::gnn::layer::{HeadGrads, HeadTape, SingleHeadGatLayer};
use crate::graph::RelationalGraph;
use crate::nn::Linear;
use ndarray::{concatenate, s, Axis};
use rand::Rng;
use tracing::debug;

/// Independent heads run on the same input, merged by concatenation plus
/// the `Wo` projection or by averaging.
#[derive(Clone, Debug)]
pub struct GatLayer {
    pub(crate) heads: Vec<SingleHeadGatLayer>,
    /// `num_heads·out_dim → out_dim`, used by [`MergeMode::Concat`]
    pub(crate) wo: Linear,
    merge: MergeMode,
}

/// Recorded forward pass of every head plus the merge input.
#[derive(Clone, Debug, Default)]
pub struct LayerTape {
    heads: Vec<HeadTape>,
    head_outputs: Vec<Matrix>,
}

/// Gradients of a multi-head layer. `wo` stays zero under mean merging.
#[derive(Clone, Debug)]
pub struct LayerGrads {
    pub wo: Linear,
    pub heads: Vec<HeadGrads>,
}

impl GatLayer {
    pub fn new(config: LayerConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: LayerConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let out_dim = config.head.out_dim;
        let wo = Linear::new(config.num_heads * out_dim, out_dim, true, rng);
        let heads = (0..config.num_heads)
            .map(|_| SingleHeadGatLayer::with_rng(config.head.clone(), rng))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            heads,
            wo,
            merge: config.merge,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn heads(&self) -> &[SingleHeadGatLayer] {
        &self.heads
    }

    pub fn heads_mut(&mut self) -> &mut [SingleHeadGatLayer] {
        &mut self.heads
    }

    pub fn merge(&self) -> MergeMode {
        self.merge
    }

    pub fn set_merge(&mut self, merge: MergeMode) {
        self.merge = merge;
    }

    pub fn in_dim(&self) -> usize {
        self.heads[0].in_dim()
    }

    pub fn out_dim(&self) -> usize {
        self.heads[0].out_dim()
    }

    /// Per-head outputs, each `num_nodes × out_dim`.
    pub fn forward_heads(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
    ) -> Result<Vec<Matrix>> {
        let mut rng = rand::thread_rng();
        self.heads
            .iter()
            .map(|head| head.forward_with_rng(graph, features, mode, &mut rng))
            .collect()
    }

    /// Combine head outputs according to the merge mode.
    pub fn merge_heads(&self, head_outs: &[Matrix]) -> Result<Matrix> {
        if head_outs.len() != self.heads.len() {
            return Err(Error::shape(
                "head outputs",
                &[self.heads.len()],
                &[head_outs.len()],
            ));
        }
        match self.merge {
            MergeMode::Concat => self.wo.forward(&concat_heads(head_outs)?),
            MergeMode::Mean => {
                let mut sum = head_outs[0].clone();
                for h in &head_outs[1..] {
                    sum += h;
                }
                Ok(sum / head_outs.len() as f32)
            }
        }
    }

    pub fn forward(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
    ) -> Result<Matrix> {
        self.forward_with_rng(graph, features, mode, &mut rand::thread_rng())
    }

    /// Forward pass with dropout masks drawn from `rng`, head by head.
    pub fn forward_with_rng<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
    ) -> Result<Matrix> {
        let head_outs = self
            .heads
            .iter()
            .map(|head| head.forward_with_rng(graph, features, mode, &mut *rng))
            .collect::<Result<Vec<_>>>()?;
        debug!(heads = head_outs.len(), merge = %self.merge, "merging heads");
        self.merge_heads(&head_outs)
    }

    pub fn forward_recorded<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        mode: Mode,
        rng: &mut R,
    ) -> Result<(Matrix, LayerTape)> {
        let mut tape = LayerTape::default();
        for head in &self.heads {
            let (out, head_tape) = head.forward_recorded(graph, features, mode, rng)?;
            tape.heads.push(head_tape);
            tape.head_outputs.push(out);
        }
        let out = self.merge_heads(&tape.head_outputs)?;
        Ok((out, tape))
    }

    /// Gradients of a recorded pass. Returns them with the gradient w.r.t.
    /// the layer input; relation gradients are added into `grad_relations`.
    pub fn backward(
        &self,
        graph: &RelationalGraph,
        tape: &LayerTape,
        grad_output: &Matrix,
        grad_relations: &mut Matrix,
    ) -> Result<(LayerGrads, Matrix)> {
        if tape.heads.len() != self.heads.len() {
            return Err(Error::TapeMismatch(format!(
                "{} heads recorded, layer has {}",
                tape.heads.len(),
                self.heads.len()
            )));
        }
        let mut wo = self.wo.zeros_like();
        let d = self.out_dim();
        let head_grads: Vec<Matrix> = match self.merge {
            MergeMode::Concat => {
                let cat = concat_heads(&tape.head_outputs)?;
                let grad_cat = self.wo.backward(&cat, grad_output, &mut wo)?;
                (0..self.heads.len())
                    .map(|i| grad_cat.slice(s![.., i * d..(i + 1) * d]).to_owned())
                    .collect()
            }
            MergeMode::Mean => {
                let share = grad_output / self.heads.len() as f32;
                vec![share; self.heads.len()]
            }
        };

        let mut heads = Vec::with_capacity(self.heads.len());
        let mut grad_features: Option<Matrix> = None;
        for ((head, head_tape), grad) in self.heads.iter().zip(&tape.heads).zip(&head_grads) {
            let (grads, dx) = head.backward(graph, head_tape, grad, grad_relations)?;
            heads.push(grads);
            match grad_features.as_mut() {
                Some(acc) => *acc += &dx,
                None => grad_features = Some(dx),
            }
        }
        let grad_features = grad_features
            .ok_or_else(|| Error::InvalidConfig("layer has no heads".to_string()))?;
        Ok((LayerGrads { wo, heads }, grad_features))
    }
}

fn concat_heads(head_outs: &[Matrix]) -> Result<Matrix> {
    let views: Vec<_> = head_outs.iter().map(|h| h.view()).collect();
    concatenate(Axis(1), &views)
        .map_err(|e| Error::DimensionMismatch(format!("cannot concatenate heads: {}", e)))
}
