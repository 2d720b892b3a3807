//! Graph construction from edges, adjacency lists and KG triplets.

use crate::core::{Error, Matrix, Result};
use crate::graph::multigraph::RelationalGraph;
use ndarray::Array2;

/// Incremental builder for [`RelationalGraph`].
#[derive(Clone, Debug, Default)]
pub struct GraphBuilder {
    num_nodes: usize,
    edges: Vec<(usize, usize, usize)>,
    relation_embeddings: Option<Matrix>,
    node_features: Option<Matrix>,
}

impl GraphBuilder {
    /// Start a graph over `num_nodes` nodes.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            ..Default::default()
        }
    }

    /// Set the `R × E` relation embedding table.
    pub fn relation_embeddings(mut self, table: Matrix) -> Self {
        self.relation_embeddings = Some(table);
        self
    }

    /// Attach per-node input features.
    pub fn node_features(mut self, features: Matrix) -> Self {
        self.node_features = Some(features);
        self
    }

    /// Add a directed edge `src -relation-> dst`.
    pub fn add_edge(mut self, src: usize, relation: usize, dst: usize) -> Self {
        self.edges.push((src, relation, dst));
        self
    }

    /// Add many edges at once.
    pub fn extend_edges<I>(mut self, edges: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize, usize)>,
    {
        self.edges.extend(edges);
        self
    }

    pub fn build(self) -> Result<RelationalGraph> {
        let table = self.relation_embeddings.ok_or_else(|| {
            Error::InvalidConfig("relation embedding table is required".to_string())
        })?;
        RelationalGraph::new(self.num_nodes, &self.edges, table, self.node_features)
    }
}

impl RelationalGraph {
    /// Build from one `(src, dst)` list per relation; the list index is the
    /// relation id.
    pub fn from_adjacency(
        num_nodes: usize,
        adjacency: &[Vec<(usize, usize)>],
        relation_embeddings: Matrix,
    ) -> Result<Self> {
        let edges: Vec<(usize, usize, usize)> = adjacency
            .iter()
            .enumerate()
            .flat_map(|(rel, pairs)| pairs.iter().map(move |&(s, d)| (s, rel, d)))
            .collect();
        RelationalGraph::new(num_nodes, &edges, relation_embeddings, None)
    }

    /// Build from `(subject, relation, object)` triplets.
    ///
    /// Repeated triplets collapse into a single edge. With `add_transpose`
    /// every relation `r` also gets an inverse relation `r + num_relations`
    /// whose edges run object → subject, so the embedding table must have
    /// `2 * num_relations` rows.
    pub fn from_triplets(
        num_nodes: usize,
        num_relations: usize,
        triplets: &[(usize, usize, usize)],
        relation_embeddings: Matrix,
        add_transpose: bool,
    ) -> Result<Self> {
        let mut adjacency: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_relations];
        for &(sub, rel, obj) in triplets {
            let pairs = adjacency
                .get_mut(rel)
                .ok_or(Error::RelationOutOfRange {
                    index: rel,
                    num_relations,
                })?;
            pairs.push((sub, obj));
        }
        for pairs in &mut adjacency {
            pairs.sort_unstable();
            pairs.dedup();
        }

        if add_transpose {
            let inverse: Vec<Vec<(usize, usize)>> = adjacency
                .iter()
                .map(|pairs| pairs.iter().map(|&(s, d)| (d, s)).collect())
                .collect();
            adjacency.extend(inverse);
        }

        if relation_embeddings.nrows() < adjacency.len() {
            return Err(Error::InvalidConfig(format!(
                "relation table has {} rows but {} relations are used",
                relation_embeddings.nrows(),
                adjacency.len()
            )));
        }

        RelationalGraph::from_adjacency(num_nodes, &adjacency, relation_embeddings)
    }
}

/// A relation table where every relation shares the same embedding.
pub fn uniform_relation_table(num_relations: usize, dim: usize, value: f32) -> Matrix {
    Array2::from_elem((num_relations, dim), value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_table() {
        let err = GraphBuilder::new(2).add_edge(0, 0, 1).build().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_ring() {
        let g = GraphBuilder::new(4)
            .relation_embeddings(uniform_relation_table(1, 4, 1.0))
            .extend_edges((0..4).map(|i| (i, 0, (i + 1) % 4)))
            .build()
            .unwrap();
        assert_eq!(g.num_edges(), 4);
        for v in 0..4 {
            assert_eq!(g.in_degree(v), 1);
        }
    }

    #[test]
    fn test_from_adjacency_assigns_relation_ids() {
        let adjacency = vec![vec![(0, 1)], vec![(1, 2), (2, 0)]];
        let g = RelationalGraph::from_adjacency(3, &adjacency, uniform_relation_table(2, 2, 0.5))
            .unwrap();
        let rels: Vec<usize> = g.edges().map(|e| e.relation).collect();
        assert_eq!(rels, vec![0, 1, 1]);
    }

    #[test]
    fn test_from_triplets_with_transpose() {
        let triplets = [(0, 0, 1), (1, 1, 2)];
        let g = RelationalGraph::from_triplets(
            3,
            2,
            &triplets,
            uniform_relation_table(4, 3, 1.0),
            true,
        )
        .unwrap();

        assert_eq!(g.num_edges(), 4);
        let inverse: Vec<(usize, usize, usize)> = g
            .edges()
            .filter(|e| e.relation >= 2)
            .map(|e| (e.src, e.relation, e.dst))
            .collect();
        assert_eq!(inverse, vec![(1, 2, 0), (2, 3, 1)]);
    }

    #[test]
    fn test_from_triplets_repeated_triplet_is_one_edge() {
        let triplets = [(0, 0, 1), (0, 0, 1), (1, 0, 0)];
        let g = RelationalGraph::from_triplets(
            2,
            1,
            &triplets,
            uniform_relation_table(1, 2, 1.0),
            false,
        )
        .unwrap();
        assert_eq!(g.num_edges(), 2);
        assert_eq!(g.in_degree(1), 1);

        let transposed = RelationalGraph::from_triplets(
            2,
            1,
            &triplets,
            uniform_relation_table(2, 2, 1.0),
            true,
        )
        .unwrap();
        assert_eq!(transposed.num_edges(), 4);
        assert_eq!(transposed.in_degree(1), 2);
    }

    #[test]
    fn test_from_triplets_table_too_small() {
        let err = RelationalGraph::from_triplets(
            2,
            1,
            &[(0, 0, 1)],
            uniform_relation_table(1, 3, 1.0),
            true,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_from_triplets_unknown_relation() {
        let err = RelationalGraph::from_triplets(
            2,
            1,
            &[(0, 4, 1)],
            uniform_relation_table(1, 3, 1.0),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::RelationOutOfRange { index: 4, .. }));
    }
}
