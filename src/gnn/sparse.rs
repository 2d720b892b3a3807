//! Sparse graph primitives: softmax grouped by destination and weighted
//! scatter-sum of source features into destinations.

use crate::core::{Error, Matrix, Result};
use crate::graph::RelationalGraph;
use ndarray::{Array1, Array2, Zip};

/// Softmax of edge logits over the incoming edges of each destination node.
///
/// The per-destination maximum is subtracted before exponentiation.
pub fn edge_softmax(graph: &RelationalGraph, logits: &Array1<f32>) -> Result<Array1<f32>> {
    check_edge_len(graph, logits.len())?;

    let mut weights = Array1::zeros(logits.len());
    for node in 0..graph.num_nodes() {
        let incoming = graph.in_edges(node);
        if incoming.is_empty() {
            continue;
        }

        let max = incoming
            .iter()
            .map(|&e| logits[e])
            .fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for &e in incoming {
            let v = (logits[e] - max).exp();
            weights[e] = v;
            sum += v;
        }
        if sum > 0.0 {
            for &e in incoming {
                weights[e] /= sum;
            }
        }
    }
    Ok(weights)
}

/// `out[v] = Σ_{e: src→v} weight[e] · features[src]`.
///
/// Nodes without incoming edges get an all-zero row.
pub fn scatter_sum(
    graph: &RelationalGraph,
    features: &Matrix,
    weights: &Array1<f32>,
) -> Result<Matrix> {
    check_edge_len(graph, weights.len())?;
    if features.nrows() != graph.num_nodes() {
        return Err(Error::shape(
            "aggregated features",
            &[graph.num_nodes(), features.ncols()],
            features.shape(),
        ));
    }

    let src = graph.sources();
    let mut out = Array2::zeros(features.raw_dim());
    for (node, mut row) in out.rows_mut().into_iter().enumerate() {
        for &e in graph.in_edges(node) {
            let w = weights[e];
            Zip::from(&mut row)
                .and(features.row(src[e]))
                .for_each(|o, &x| *o += w * x);
        }
    }
    Ok(out)
}

/// Backward pass of [`edge_softmax`] given its output `weights`.
///
/// Within each destination group `dz_e = w_e · (dw_e - Σ_e' w_e' dw_e')`.
pub fn edge_softmax_backward(
    graph: &RelationalGraph,
    weights: &Array1<f32>,
    grad_weights: &Array1<f32>,
) -> Result<Array1<f32>> {
    check_edge_len(graph, weights.len())?;
    check_edge_len(graph, grad_weights.len())?;

    let mut grad_logits = Array1::zeros(weights.len());
    for node in 0..graph.num_nodes() {
        let incoming = graph.in_edges(node);
        let dot: f32 = incoming.iter().map(|&e| weights[e] * grad_weights[e]).sum();
        for &e in incoming {
            grad_logits[e] = weights[e] * (grad_weights[e] - dot);
        }
    }
    Ok(grad_logits)
}

/// Backward pass of [`scatter_sum`]: gradients w.r.t. the source features
/// and the edge weights.
pub fn scatter_sum_backward(
    graph: &RelationalGraph,
    features: &Matrix,
    weights: &Array1<f32>,
    grad_out: &Matrix,
) -> Result<(Matrix, Array1<f32>)> {
    check_edge_len(graph, weights.len())?;
    if grad_out.shape() != features.shape() || features.nrows() != graph.num_nodes() {
        return Err(Error::shape(
            "aggregation gradient",
            &[graph.num_nodes(), features.ncols()],
            grad_out.shape(),
        ));
    }

    let mut grad_features = Array2::zeros(features.raw_dim());
    let mut grad_weights = Array1::zeros(weights.len());
    for e in graph.edges() {
        let upstream = grad_out.row(e.dst);
        grad_weights[e.id] = upstream.dot(&features.row(e.src));
        grad_features
            .row_mut(e.src)
            .scaled_add(weights[e.id], &upstream);
    }
    Ok((grad_features, grad_weights))
}

fn check_edge_len(graph: &RelationalGraph, len: usize) -> Result<()> {
    if len != graph.num_edges() {
        return Err(Error::shape("edge values", &[graph.num_edges()], &[len]));
    }
    Ok(())
}
