//! Attention diffusion.
//!
//! Truncated personalized-PageRank propagation where every hop re-scores the
//! edges with attention, and the hops are mixed by learned coefficients
//! `temp` instead of a fixed geometric decay:
//!
//! ```text
//! acc = temp[0]·X
//! for k in 0..K:  X = A_k(X) · X ;  acc += temp[k+1]·X
//! ```
//!
//! where `A_k(X)` is the destination-normalized attention matrix computed
//! from the current features.

use crate::core::{leaky_relu, Error, Matrix, Mode, Result};
use crate::gnn::attention::{AttentionWeight, EdgeAttention};
use crate::gnn::sparse::{edge_softmax, edge_softmax_backward, scatter_sum, scatter_sum_backward};
use crate::graph::RelationalGraph;
use crate::nn::{Dropout, Linear};
use ndarray::Array1;
use rand::Rng;
use tracing::{trace, warn};

/// PPR initialisation: `alpha·(1-alpha)^k` for `k < K`, `(1-alpha)^K` last.
pub fn ppr_coefficients(k: usize, alpha: f32) -> Array1<f32> {
    let mut temp: Array1<f32> = (0..=k).map(|i| alpha * (1.0 - alpha).powi(i as i32)).collect();
    temp[k] = (1.0 - alpha).powi(k as i32);
    temp
}

/// Hop count, mixing coefficients and edge dropout of one head.
#[derive(Clone, Debug)]
pub struct DiffusionKernel {
    k: usize,
    alpha: f32,
    /// Learned hop weights, length `k + 1`
    pub temp: Array1<f32>,
    dropout: Dropout,
}

/// Output of one propagation pass.
#[derive(Clone, Debug)]
pub struct Diffusion {
    /// `Σ_k temp[k] · X_k`
    pub accumulated: Matrix,
    /// Features after the final hop (the input when `K = 0`)
    pub last_hop: Matrix,
}

/// Normalized edge weights recorded at every hop.
#[derive(Clone, Debug, Default)]
pub struct PropagationTrace {
    /// One vector per hop, indexed by edge id
    pub hops: Vec<Array1<f32>>,
}

impl PropagationTrace {
    /// Flatten into per-edge records.
    pub fn weights(&self, graph: &RelationalGraph) -> Vec<AttentionWeight> {
        self.hops
            .iter()
            .enumerate()
            .flat_map(|(hop, w)| {
                graph.edges().map(move |e| AttentionWeight {
                    src: e.src,
                    relation: e.relation,
                    dst: e.dst,
                    hop,
                    weight: w[e.id],
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
struct HopRecord {
    input: Matrix,
    preactivations: Array1<f32>,
    weights: Array1<f32>,
    mask: Option<Array1<f32>>,
}

impl HopRecord {
    fn dropped_weights(&self) -> Array1<f32> {
        match &self.mask {
            Some(mask) => &self.weights * mask,
            None => self.weights.clone(),
        }
    }
}

/// Values of a propagation pass kept for [`DiffusionKernel::backward`].
#[derive(Clone, Debug, Default)]
pub struct DiffusionTape {
    hops: Vec<HopRecord>,
    output: Matrix,
}

impl DiffusionTape {
    pub fn num_hops(&self) -> usize {
        self.hops.len()
    }

    /// Edge weights actually used at every hop, after dropout.
    pub fn trace(&self) -> PropagationTrace {
        PropagationTrace {
            hops: self.hops.iter().map(HopRecord::dropped_weights).collect(),
        }
    }
}

/// Gradients of one propagation pass.
#[derive(Clone, Debug)]
pub struct DiffusionGrads {
    pub temp: Array1<f32>,
    /// Gradient w.r.t. the propagated input features
    pub features: Matrix,
}

impl DiffusionKernel {
    pub fn new(k: usize, alpha: f32) -> Self {
        Self {
            k,
            alpha,
            temp: ppr_coefficients(k, alpha),
            dropout: Dropout::default(),
        }
    }

    /// Drop normalized edge weights with `dropout` during training.
    pub fn with_dropout(mut self, dropout: Dropout) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn dropout(&self) -> Dropout {
        self.dropout
    }

    /// Restore `temp` to the PPR decay.
    pub fn reset(&mut self) {
        self.temp = ppr_coefficients(self.k, self.alpha);
    }

    /// Run `K` attention-weighted hops from `features`.
    ///
    /// Dropout masks are drawn from `rng`. When `tape` is given it is
    /// overwritten with what [`backward`](Self::backward) needs.
    pub fn propagate<R: Rng + ?Sized>(
        &self,
        graph: &RelationalGraph,
        features: Matrix,
        attention: &EdgeAttention,
        mode: Mode,
        rng: &mut R,
        mut tape: Option<&mut DiffusionTape>,
    ) -> Result<Diffusion> {
        if self.temp.len() != self.k + 1 {
            return Err(Error::shape("diffusion temp", &[self.k + 1], &[self.temp.len()]));
        }
        if features.nrows() != graph.num_nodes() {
            return Err(Error::shape(
                "diffusion input",
                &[graph.num_nodes(), features.ncols()],
                features.shape(),
            ));
        }
        if let Some(tape) = tape.as_deref_mut() {
            tape.hops.clear();
        }

        let slope = attention.negative_slope();
        let mut accumulated = &features * self.temp[0];
        let mut current = features;

        for hop in 0..self.k {
            let preactivations = attention.edge_preactivations(graph, &current)?;
            if preactivations.iter().any(|v| !v.is_finite()) {
                warn!(hop, "non-finite attention logits");
            }
            let logits = preactivations.mapv(|a| leaky_relu(a, slope));
            let weights = edge_softmax(graph, &logits)?;
            let mask = self.dropout.mask(weights.len(), mode, rng);
            let dropped = match &mask {
                Some(mask) => &weights * mask,
                None => weights.clone(),
            };

            let next = scatter_sum(graph, &current, &dropped)?;
            accumulated.scaled_add(self.temp[hop + 1], &next);
            let input = std::mem::replace(&mut current, next);

            trace!(hop, gamma = self.temp[hop + 1], "diffusion hop");
            if let Some(tape) = tape.as_deref_mut() {
                tape.hops.push(HopRecord {
                    input,
                    preactivations,
                    weights,
                    mask,
                });
            }
        }

        if let Some(tape) = tape {
            tape.output = current.clone();
        }
        Ok(Diffusion {
            accumulated,
            last_hop: current,
        })
    }

    /// Backward pass of [`propagate`](Self::propagate) for the gradient of
    /// the accumulated output.
    ///
    /// Scorer gradients are added into `grad_attention` and relation
    /// embedding gradients into `grad_relations`.
    pub fn backward(
        &self,
        graph: &RelationalGraph,
        attention: &EdgeAttention,
        tape: &DiffusionTape,
        grad_accumulated: &Matrix,
        grad_attention: &mut Linear,
        grad_relations: &mut Matrix,
    ) -> Result<DiffusionGrads> {
        if tape.hops.len() != self.k || self.temp.len() != self.k + 1 {
            return Err(Error::TapeMismatch(format!(
                "{} hops recorded, kernel runs {}",
                tape.hops.len(),
                self.k
            )));
        }
        if grad_accumulated.shape() != tape.output.shape() {
            return Err(Error::shape(
                "diffusion output gradient",
                tape.output.shape(),
                grad_accumulated.shape(),
            ));
        }

        let mut temp = Array1::zeros(self.k + 1);
        temp[self.k] = (grad_accumulated * &tape.output).sum();
        // gradient w.r.t. X_{k+1}, starting from the last hop
        let mut grad = grad_accumulated * self.temp[self.k];

        for (hop, record) in tape.hops.iter().enumerate().rev() {
            temp[hop] = (grad_accumulated * &record.input).sum();

            let dropped = record.dropped_weights();
            let (mut grad_input, grad_dropped) =
                scatter_sum_backward(graph, &record.input, &dropped, &grad)?;
            let grad_weights = match &record.mask {
                Some(mask) => grad_dropped * mask,
                None => grad_dropped,
            };
            let grad_logits = edge_softmax_backward(graph, &record.weights, &grad_weights)?;
            grad_input += &attention.backward(
                graph,
                &record.input,
                &record.preactivations,
                &grad_logits,
                grad_attention,
                grad_relations,
            )?;
            grad_input.scaled_add(self.temp[hop], grad_accumulated);
            grad = grad_input;
        }

        Ok(DiffusionGrads {
            temp,
            features: grad,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{uniform_relation_table, GraphBuilder};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ppr_coefficients() {
        let temp = ppr_coefficients(3, 0.1);
        let expected = [0.1, 0.09, 0.081, 0.729];
        for (t, e) in temp.iter().zip(expected) {
            assert!((t - e).abs() < 1e-6);
        }
        // the truncated series still sums to one at initialisation
        assert!((temp.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ppr_coefficients_k_zero() {
        assert_eq!(ppr_coefficients(0, 0.3), array![1.0]);
    }

    #[test]
    fn test_k_zero_scales_features() {
        let mut rng = StdRng::seed_from_u64(0);
        let att = EdgeAttention::new(2, &mut rng).unwrap();
        let g = GraphBuilder::new(2)
            .relation_embeddings(uniform_relation_table(1, 2, 1.0))
            .add_edge(0, 0, 1)
            .build()
            .unwrap();
        let mut kernel = DiffusionKernel::new(0, 0.5);
        kernel.temp[0] = 0.75;
        let x = array![[1.0, 2.0], [3.0, 4.0]];

        let out = kernel
            .propagate(&g, x.clone(), &att, Mode::Inference, &mut rng, None)
            .unwrap();
        assert_eq!(out.accumulated, &x * 0.75);
        assert_eq!(out.last_hop, x);
    }

    #[test]
    fn test_trace_records_each_hop() {
        let mut rng = StdRng::seed_from_u64(5);
        let att = EdgeAttention::new(2, &mut rng).unwrap();
        let g = GraphBuilder::new(3)
            .relation_embeddings(uniform_relation_table(1, 2, 0.5))
            .add_edge(0, 0, 2)
            .add_edge(1, 0, 2)
            .add_edge(2, 0, 0)
            .build()
            .unwrap();
        let kernel = DiffusionKernel::new(3, 0.2);
        let mut tape = DiffusionTape::default();
        kernel
            .propagate(
                &g,
                array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
                &att,
                Mode::Inference,
                &mut rng,
                Some(&mut tape),
            )
            .unwrap();
        let trace = tape.trace();

        assert_eq!(trace.hops.len(), 3);
        for hop in &trace.hops {
            assert!((hop[0] + hop[1] - 1.0).abs() < 1e-6);
            assert!((hop[2] - 1.0).abs() < 1e-6);
        }
        assert_eq!(trace.weights(&g).len(), 9);
    }

    #[test]
    fn test_temp_length_checked() {
        let mut rng = StdRng::seed_from_u64(0);
        let att = EdgeAttention::new(2, &mut rng).unwrap();
        let g = GraphBuilder::new(1)
            .relation_embeddings(uniform_relation_table(1, 2, 1.0))
            .build()
            .unwrap();
        let mut kernel = DiffusionKernel::new(2, 0.5);
        kernel.temp = array![1.0];
        let x = Matrix::zeros((1, 2));
        let res = kernel.propagate(&g, x, &att, Mode::Inference, &mut rng, None);
        assert!(res.is_err());
    }

    #[test]
    fn test_reset_restores_decay() {
        let mut kernel = DiffusionKernel::new(2, 0.5);
        kernel.temp.fill(9.0);
        kernel.reset();
        assert_eq!(kernel.temp, array![0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_backward_k_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        let att = EdgeAttention::new(2, &mut rng).unwrap();
        let g = GraphBuilder::new(2)
            .relation_embeddings(uniform_relation_table(1, 2, 1.0))
            .add_edge(0, 0, 1)
            .build()
            .unwrap();
        let mut kernel = DiffusionKernel::new(0, 0.5);
        kernel.temp[0] = 0.5;
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let mut tape = DiffusionTape::default();
        kernel
            .propagate(&g, x, &att, Mode::Inference, &mut rng, Some(&mut tape))
            .unwrap();

        let upstream = array![[1.0, 0.0], [0.0, -1.0]];
        let mut grad_att = att.fc.zeros_like();
        let mut grad_rel = Matrix::zeros((1, 2));
        let grads = kernel
            .backward(&g, &att, &tape, &upstream, &mut grad_att, &mut grad_rel)
            .unwrap();
        assert_eq!(grads.temp, array![-3.0]);
        assert_eq!(grads.features, &upstream * 0.5);
        assert!(grad_att.weight.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_backward_rejects_foreign_tape() {
        let mut rng = StdRng::seed_from_u64(0);
        let att = EdgeAttention::new(2, &mut rng).unwrap();
        let g = GraphBuilder::new(1)
            .relation_embeddings(uniform_relation_table(1, 2, 1.0))
            .build()
            .unwrap();
        let mut tape = DiffusionTape::default();
        DiffusionKernel::new(1, 0.5)
            .propagate(&g, Matrix::zeros((1, 2)), &att, Mode::Inference, &mut rng, Some(&mut tape))
            .unwrap();

        let mut grad_att = att.fc.zeros_like();
        let mut grad_rel = Matrix::zeros((1, 2));
        let res = DiffusionKernel::new(2, 0.5).backward(
            &g,
            &att,
            &tape,
            &Matrix::zeros((1, 2)),
            &mut grad_att,
            &mut grad_rel,
        );
        assert!(matches!(res, Err(Error::TapeMismatch(_))));
    }

    #[test]
    fn test_training_dropout_follows_rng() {
        let mut rng = StdRng::seed_from_u64(4);
        let att = EdgeAttention::new(2, &mut rng).unwrap();
        let g = GraphBuilder::new(3)
            .relation_embeddings(uniform_relation_table(1, 2, 0.5))
            .extend_edges([(0, 0, 2), (1, 0, 2), (2, 0, 0), (0, 0, 1), (2, 0, 1)])
            .build()
            .unwrap();
        let kernel = DiffusionKernel::new(2, 0.2).with_dropout(Dropout::new(0.5).unwrap());
        let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];

        let run = |seed: u64, mode: Mode| {
            let mut tape = DiffusionTape::default();
            let mut rng = StdRng::seed_from_u64(seed);
            kernel
                .propagate(&g, x.clone(), &att, mode, &mut rng, Some(&mut tape))
                .unwrap();
            tape.trace().hops
        };
        assert_eq!(run(11, Mode::Training), run(11, Mode::Training));

        // first hop sees the undropped input, so kept weights are scaled by 1/(1-p)
        let kept = &run(11, Mode::Training)[0];
        let full = &run(11, Mode::Inference)[0];
        for (k, f) in kept.iter().zip(full) {
            assert!(*k == 0.0 || (k - 2.0 * f).abs() < 1e-6);
        }
    }
}
