//! Edge attention scoring.
//!
//! Each edge gets a logit from `[h_src ‖ e_rel ‖ h_dst]` through a learned
//! affine map followed by leaky ReLU.

use crate::core::{leaky_relu, Error, Matrix, Result, DEFAULT_NEGATIVE_SLOPE};
use crate::graph::RelationalGraph;
use crate::nn::{calculate_gain, Linear, Nonlinearity};
use ndarray::{s, Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Attention scorer shared by every hop of one head.
#[derive(Clone, Debug)]
pub struct EdgeAttention {
    /// `1 × 3·dim` map over the concatenated edge triple
    pub fc: Linear,
    negative_slope: f32,
}

impl EdgeAttention {
    /// Create a scorer for `dim`-wide node features and relation embeddings.
    pub fn new<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Result<Self> {
        let mut fc = Linear::new(3 * dim, 1, true, rng);
        fc.reset_xavier_normal(calculate_gain(Nonlinearity::Relu), rng)?;
        Ok(Self {
            fc,
            negative_slope: DEFAULT_NEGATIVE_SLOPE,
        })
    }

    /// Feature width this scorer expects.
    pub fn dim(&self) -> usize {
        self.fc.in_dim() / 3
    }

    fn bias(&self) -> f32 {
        self.fc.bias.as_ref().map_or(0.0, |b| b[0])
    }

    /// Logit for a single `(src, relation, dst)` triple.
    pub fn score(
        &self,
        src: ArrayView1<'_, f32>,
        relation: ArrayView1<'_, f32>,
        dst: ArrayView1<'_, f32>,
    ) -> f32 {
        let d = self.dim();
        let w = self.fc.weight.row(0);
        let a = w.slice(s![..d]).dot(&src)
            + w.slice(s![d..2 * d]).dot(&relation)
            + w.slice(s![2 * d..]).dot(&dst)
            + self.bias();
        leaky_relu(a, self.negative_slope)
    }

    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }

    /// Logits for every edge of `graph` given the current node features.
    pub fn edge_logits(&self, graph: &RelationalGraph, features: &Matrix) -> Result<Array1<f32>> {
        let slope = self.negative_slope;
        Ok(self
            .edge_preactivations(graph, features)?
            .mapv(|a| leaky_relu(a, slope)))
    }

    /// Affine scores of every edge before the leaky ReLU.
    ///
    /// The affine map splits over the concatenation, so node and relation
    /// terms are computed once per node and relation and then gathered.
    pub fn edge_preactivations(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
    ) -> Result<Array1<f32>> {
        let d = self.dim();
        self.check_inputs(graph, features)?;

        let w = self.fc.weight.row(0);
        let src_terms = features.dot(&w.slice(s![..d]));
        let rel_terms = graph.relation_embeddings().dot(&w.slice(s![d..2 * d]));
        let dst_terms = features.dot(&w.slice(s![2 * d..]));
        let bias = self.bias();

        Ok(graph
            .edges()
            .map(|e| src_terms[e.src] + rel_terms[e.relation] + dst_terms[e.dst] + bias)
            .collect())
    }

    /// Backward pass of [`edge_logits`](Self::edge_logits).
    ///
    /// Adds the scorer gradient into `grad` and the relation embedding
    /// gradient into `grad_relations`; returns the node feature gradient.
    pub fn backward(
        &self,
        graph: &RelationalGraph,
        features: &Matrix,
        preactivations: &Array1<f32>,
        grad_logits: &Array1<f32>,
        grad: &mut Linear,
        grad_relations: &mut Matrix,
    ) -> Result<Matrix> {
        let d = self.dim();
        self.check_inputs(graph, features)?;
        for len in [preactivations.len(), grad_logits.len()] {
            if len != graph.num_edges() {
                return Err(Error::shape("edge values", &[graph.num_edges()], &[len]));
            }
        }
        if grad_relations.dim() != graph.relation_embeddings().dim() {
            return Err(Error::shape(
                "relation embedding gradient",
                graph.relation_embeddings().shape(),
                grad_relations.shape(),
            ));
        }

        let w = self.fc.weight.row(0);
        let (w_src, w_rel, w_dst) = (w.slice(s![..d]), w.slice(s![d..2 * d]), w.slice(s![2 * d..]));
        let mut grad_features = Matrix::zeros(features.raw_dim());
        let mut grad_bias = 0.0;

        for e in graph.edges() {
            let slope = if preactivations[e.id] >= 0.0 {
                1.0
            } else {
                self.negative_slope
            };
            let da = grad_logits[e.id] * slope;
            if da == 0.0 {
                continue;
            }
            grad_bias += da;

            let mut grad_w = grad.weight.row_mut(0);
            grad_w.slice_mut(s![..d]).scaled_add(da, &features.row(e.src));
            grad_w
                .slice_mut(s![d..2 * d])
                .scaled_add(da, &graph.relation_embeddings().row(e.relation));
            grad_w.slice_mut(s![2 * d..]).scaled_add(da, &features.row(e.dst));

            grad_relations.row_mut(e.relation).scaled_add(da, &w_rel);
            grad_features.row_mut(e.src).scaled_add(da, &w_src);
            grad_features.row_mut(e.dst).scaled_add(da, &w_dst);
        }
        if let Some(b) = grad.bias.as_mut() {
            b[0] += grad_bias;
        }
        Ok(grad_features)
    }

    fn check_inputs(&self, graph: &RelationalGraph, features: &Matrix) -> Result<()> {
        let d = self.dim();
        if features.ncols() != d || features.nrows() != graph.num_nodes() {
            return Err(Error::shape(
                "attention node features",
                &[graph.num_nodes(), d],
                features.shape(),
            ));
        }
        if graph.relation_dim() != d {
            return Err(Error::RelationWidthMismatch {
                expected: d,
                actual: graph.relation_dim(),
            });
        }
        Ok(())
    }
}

/// Normalized attention weight of one edge, for inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttentionWeight {
    pub src: usize,
    pub relation: usize,
    pub dst: usize,
    /// Propagation step (0-based)
    pub hop: usize,
    pub weight: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{uniform_relation_table, GraphBuilder};
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_attention_creation() {
        let mut rng = StdRng::seed_from_u64(0);
        let att = EdgeAttention::new(8, &mut rng).unwrap();
        assert_eq!(att.dim(), 8);
        assert_eq!(att.fc.weight.shape(), &[1, 24]);
    }

    #[test]
    fn test_score_matches_concatenation() {
        let att = EdgeAttention {
            fc: Linear {
                weight: array![[1.0, 0.0, 2.0, 0.0, -1.0, 1.0]],
                bias: Some(array![0.5]),
            },
            negative_slope: 0.01,
        };
        let src = array![1.0, 2.0];
        let rel = array![3.0, 4.0];
        let dst = array![5.0, 6.0];
        // 1 + 6 - 5 + 6 + 0.5
        assert!((att.score(src.view(), rel.view(), dst.view()) - 8.5).abs() < 1e-6);

        let neg_dst = array![50.0, 0.0];
        // 1 + 6 - 50 + 0.5 = -42.5
        let s = att.score(src.view(), rel.view(), neg_dst.view());
        assert!((s + 0.425).abs() < 1e-5);
    }

    #[test]
    fn test_edge_logits_agree_with_score() {
        let mut rng = StdRng::seed_from_u64(11);
        let att = EdgeAttention::new(3, &mut rng).unwrap();
        let mut table = Array2::zeros((2, 3));
        table.row_mut(1).assign(&array![0.3, -0.2, 0.9]);
        let g = GraphBuilder::new(3)
            .relation_embeddings(table)
            .add_edge(0, 0, 1)
            .add_edge(2, 1, 1)
            .add_edge(1, 1, 0)
            .build()
            .unwrap();
        let x = array![[0.1, 0.2, 0.3], [-0.4, 0.5, 0.6], [0.7, -0.8, 0.9]];

        let logits = att.edge_logits(&g, &x).unwrap();
        for e in g.edges() {
            let rel = g.edge_embedding(e.id).unwrap();
            let expected = att.score(x.row(e.src), rel, x.row(e.dst));
            assert!((logits[e.id] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_edge_logits_relation_width_mismatch() {
        let mut rng = StdRng::seed_from_u64(0);
        let att = EdgeAttention::new(4, &mut rng).unwrap();
        let g = GraphBuilder::new(2)
            .relation_embeddings(uniform_relation_table(1, 3, 1.0))
            .add_edge(0, 0, 1)
            .build()
            .unwrap();
        let err = att.edge_logits(&g, &Matrix::zeros((2, 4))).unwrap_err();
        assert!(matches!(
            err,
            Error::RelationWidthMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let g = GraphBuilder::new(3)
            .relation_embeddings(array![[0.2, -0.1], [0.5, 0.3]])
            .add_edge(0, 0, 1)
            .add_edge(2, 1, 1)
            .add_edge(1, 1, 0)
            .add_edge(1, 0, 2)
            .build()
            .unwrap();
        let x = array![[0.1, -0.4], [0.6, 0.2], [-0.3, 0.5]];
        let upstream = array![1.0, -0.5, 2.0, 0.75];
        let loss = |a: &EdgeAttention, x: &Matrix| a.edge_logits(&g, x).unwrap().dot(&upstream);
        let eps = 1e-2;

        // one bias per side of the leaky ReLU kink
        for (bias, slope) in [(3.0, 1.0), (-3.0, 0.01)] {
            let mut att = EdgeAttention::new(2, &mut StdRng::seed_from_u64(17)).unwrap();
            att.fc.weight *= 0.3;
            att.fc.bias = Some(array![bias]);

            let pre = att.edge_preactivations(&g, &x).unwrap();
            assert!(pre.iter().all(|&a| a.signum() == bias.signum()));
            let mut grad = att.fc.zeros_like();
            let mut grad_relations = Matrix::zeros((2, 2));
            let dx = att
                .backward(&g, &x, &pre, &upstream, &mut grad, &mut grad_relations)
                .unwrap();

            for j in 0..6 {
                let mut plus = att.clone();
                plus.fc.weight[[0, j]] += eps;
                let mut minus = att.clone();
                minus.fc.weight[[0, j]] -= eps;
                let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
                assert!((numeric - grad.weight[[0, j]]).abs() < 1e-3);
            }
            for i in 0..3 {
                for j in 0..2 {
                    let mut plus = x.clone();
                    plus[[i, j]] += eps;
                    let mut minus = x.clone();
                    minus[[i, j]] -= eps;
                    let numeric = (loss(&att, &plus) - loss(&att, &minus)) / (2.0 * eps);
                    assert!((numeric - dx[[i, j]]).abs() < 1e-3);
                }
            }
            let grad_bias = grad.bias.as_ref().unwrap()[0];
            assert!((grad_bias - slope * upstream.sum()).abs() < 1e-5);
        }
    }
}
