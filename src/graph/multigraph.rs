//! Immutable relational multigraph.
//!
//! Edges are stored as parallel source/relation/destination arrays plus an
//! index of incoming edges grouped by destination node, which is what the
//! grouped softmax and the scatter aggregation walk over.

use crate::core::{Error, Matrix, Result};
use ndarray::ArrayView1;
use tracing::{debug, warn};

/// A single directed, typed edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    /// Position of the edge in the graph's edge arrays
    pub id: usize,
    /// Source node
    pub src: usize,
    /// Relation type id (row in the relation embedding table)
    pub relation: usize,
    /// Destination node
    pub dst: usize,
}

/// Directed multigraph over entities with typed, embedded edges.
///
/// Structure never changes after construction, so one graph can be shared
/// read-only by every head, layer and concurrent forward pass.
#[derive(Clone, Debug)]
pub struct RelationalGraph {
    num_nodes: usize,
    src: Vec<usize>,
    relation: Vec<usize>,
    dst: Vec<usize>,
    /// `in_offsets[v]..in_offsets[v + 1]` indexes `in_edges` for node `v`
    in_offsets: Vec<usize>,
    in_edges: Vec<usize>,
    relation_embeddings: Matrix,
    node_features: Option<Matrix>,
}

impl RelationalGraph {
    /// Create a graph from `(src, relation, dst)` edges.
    pub fn new(
        num_nodes: usize,
        edges: &[(usize, usize, usize)],
        relation_embeddings: Matrix,
        node_features: Option<Matrix>,
    ) -> Result<Self> {
        let num_relations = relation_embeddings.nrows();
        let mut src = Vec::with_capacity(edges.len());
        let mut relation = Vec::with_capacity(edges.len());
        let mut dst = Vec::with_capacity(edges.len());

        for &(s, r, d) in edges {
            for node in [s, d] {
                if node >= num_nodes {
                    return Err(Error::NodeOutOfRange {
                        index: node,
                        num_nodes,
                    });
                }
            }
            if r >= num_relations {
                return Err(Error::RelationOutOfRange {
                    index: r,
                    num_relations,
                });
            }
            src.push(s);
            relation.push(r);
            dst.push(d);
        }

        if let Some(features) = &node_features {
            if features.nrows() != num_nodes {
                return Err(Error::shape(
                    "node features",
                    &[num_nodes, features.ncols()],
                    features.shape(),
                ));
            }
        }

        // Counting sort of edge ids by destination.
        let mut in_offsets = vec![0usize; num_nodes + 1];
        for &d in &dst {
            in_offsets[d + 1] += 1;
        }
        for v in 0..num_nodes {
            in_offsets[v + 1] += in_offsets[v];
        }
        let mut cursor = in_offsets.clone();
        let mut in_edges = vec![0usize; dst.len()];
        for (e, &d) in dst.iter().enumerate() {
            in_edges[cursor[d]] = e;
            cursor[d] += 1;
        }

        if dst.is_empty() && num_nodes > 0 {
            warn!(num_nodes, "graph has no edges, diffusion will only rescale features");
        }
        debug!(
            num_nodes,
            num_edges = dst.len(),
            num_relations,
            relation_dim = relation_embeddings.ncols(),
            "built relational graph"
        );

        Ok(Self {
            num_nodes,
            src,
            relation,
            dst,
            in_offsets,
            in_edges,
            relation_embeddings,
            node_features,
        })
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of edges (parallel edges counted separately).
    pub fn num_edges(&self) -> usize {
        self.dst.len()
    }

    /// Number of rows in the relation embedding table.
    pub fn num_relations(&self) -> usize {
        self.relation_embeddings.nrows()
    }

    /// Width of every relation embedding.
    pub fn relation_dim(&self) -> usize {
        self.relation_embeddings.ncols()
    }

    pub fn relation_embeddings(&self) -> &Matrix {
        &self.relation_embeddings
    }

    /// Embedding carried by edge `edge_id`, `None` past the last edge.
    pub fn edge_embedding(&self, edge_id: usize) -> Option<ArrayView1<'_, f32>> {
        let rel = *self.relation.get(edge_id)?;
        Some(self.relation_embeddings.row(rel))
    }

    /// Features attached at construction time, if any.
    pub fn node_features(&self) -> Option<&Matrix> {
        self.node_features.as_ref()
    }

    pub fn sources(&self) -> &[usize] {
        &self.src
    }

    pub fn destinations(&self) -> &[usize] {
        &self.dst
    }

    pub fn relations(&self) -> &[usize] {
        &self.relation
    }

    /// Look up one edge by id.
    pub fn edge(&self, id: usize) -> Option<Edge> {
        Some(Edge {
            id,
            src: *self.src.get(id)?,
            relation: self.relation[id],
            dst: self.dst[id],
        })
    }

    /// Iterate over all edges in id order.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.src
            .iter()
            .zip(&self.relation)
            .zip(&self.dst)
            .enumerate()
            .map(|(id, ((&src, &relation), &dst))| Edge {
                id,
                src,
                relation,
                dst,
            })
    }

    /// Ids of the edges whose destination is `node`; empty for nodes
    /// outside the graph.
    pub fn in_edges(&self, node: usize) -> &[usize] {
        match (self.in_offsets.get(node), self.in_offsets.get(node + 1)) {
            (Some(&start), Some(&end)) => &self.in_edges[start..end],
            _ => &[],
        }
    }

    pub fn in_degree(&self, node: usize) -> usize {
        self.in_edges(node).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn table(rows: usize, dim: usize) -> Matrix {
        Array2::ones((rows, dim))
    }

    #[test]
    fn test_in_edges_grouped_by_destination() {
        let edges = [(0, 0, 1), (2, 1, 1), (1, 0, 2), (0, 1, 1)];
        let g = RelationalGraph::new(3, &edges, table(2, 4), None).unwrap();

        assert_eq!(g.num_edges(), 4);
        assert_eq!(g.in_edges(0), &[] as &[usize]);
        assert_eq!(g.in_edges(1), &[0, 1, 3]);
        assert_eq!(g.in_edges(2), &[2]);
        assert_eq!(g.in_degree(1), 3);
    }

    #[test]
    fn test_parallel_edges_kept() {
        let edges = [(0, 0, 1), (0, 1, 1)];
        let g = RelationalGraph::new(2, &edges, table(2, 2), None).unwrap();
        assert_eq!(g.in_degree(1), 2);
        assert_eq!(g.edge(1).unwrap().relation, 1);
    }

    #[test]
    fn test_out_of_range_lookups() {
        let g = RelationalGraph::new(2, &[(0, 0, 1)], table(1, 2), None).unwrap();
        assert!(g.edge(1).is_none());
        assert!(g.edge_embedding(1).is_none());
        assert!(g.in_edges(2).is_empty());
        assert_eq!(g.in_degree(7), 0);
        assert_eq!(g.edges().count(), 1);
    }

    #[test]
    fn test_node_out_of_range() {
        let err = RelationalGraph::new(2, &[(0, 0, 5)], table(1, 2), None).unwrap_err();
        assert!(matches!(err, Error::NodeOutOfRange { index: 5, .. }));
    }

    #[test]
    fn test_relation_out_of_range() {
        let err = RelationalGraph::new(2, &[(0, 3, 1)], table(1, 2), None).unwrap_err();
        assert!(matches!(err, Error::RelationOutOfRange { index: 3, .. }));
    }

    #[test]
    fn test_feature_rows_checked() {
        let features = Array2::zeros((3, 4));
        let err = RelationalGraph::new(2, &[], table(1, 4), Some(features)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_edge_embedding_lookup() {
        let mut t = Array2::zeros((2, 3));
        t.row_mut(1).fill(7.0);
        let g = RelationalGraph::new(2, &[(0, 1, 1)], t, None).unwrap();
        assert_eq!(g.edge_embedding(0).unwrap().to_vec(), vec![7.0, 7.0, 7.0]);
    }
}
