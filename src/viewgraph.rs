//! View graph data model: views, pairwise rotations, and global rotations.

use itertools::Itertools;
use nalgebra::Vector3;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::graph_cut::compute_normalized_min_graph_cut;
use crate::union_find::DisjointSetForest;

/// Identifier of a camera/image in the view graph.
pub type ViewId = u32;

/// Global rotation (Rodrigues vector) of every view.
pub type GlobalRotationMap = HashMap<ViewId, Vector3<f64>>;

/// Relative rotation measurements keyed by view pair.
pub type RelativeRotations = HashMap<ViewPair, PairwiseRotation>;

/// Unordered pair of views stored with `first < second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewPair {
    pub first: ViewId,
    pub second: ViewId,
}

impl ViewPair {
    /// Panics unless `first < second`.
    pub fn new(first: ViewId, second: ViewId) -> Self {
        assert!(
            first < second,
            "view pair ({}, {}) is not ordered",
            first,
            second
        );
        ViewPair { first, second }
    }
}

/// Rotation of the second view relative to the first, `R_ij = R_j * R_i^T`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseRotation {
    /// Rodrigues vector of `R_ij`.
    pub rotation: Vector3<f64>,
    /// Confidence of the measurement, e.g. the number of verified matches. Used as the edge
    /// weight when partitioning.
    pub visibility_score: u32,
}

impl PairwiseRotation {
    pub fn new(rotation: Vector3<f64>) -> Self {
        PairwiseRotation {
            rotation,
            visibility_score: 1,
        }
    }

    pub fn with_score(rotation: Vector3<f64>, visibility_score: u32) -> Self {
        PairwiseRotation {
            rotation,
            visibility_score,
        }
    }
}

/// Map every view to a dense index in ascending view id order. Index 0 is the gauge view whose
/// rotation is held constant during refinement.
pub fn view_id_to_ascent_index<'a, I>(view_ids: I) -> HashMap<ViewId, usize>
where
    I: IntoIterator<Item = &'a ViewId>,
{
    view_ids
        .into_iter()
        .copied()
        .sorted()
        .dedup()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect()
}

/// Undirected graph of views with a relative rotation on every edge.
#[derive(Debug, Clone, Default)]
pub struct ViewGraph {
    edges: RelativeRotations,
}

impl ViewGraph {
    pub fn new() -> Self {
        ViewGraph::default()
    }

    pub fn from_edges(edges: RelativeRotations) -> Self {
        ViewGraph { edges }
    }

    /// Add a measurement of `R_ab = R_b * R_a^T`. The pair is stored in ascending order, so for
    /// `a > b` the inverse rotation is stored. Replaces an existing measurement on the same pair.
    pub fn add_edge(&mut self, a: ViewId, b: ViewId, rotation: PairwiseRotation) {
        if a < b {
            self.edges.insert(ViewPair::new(a, b), rotation);
        } else {
            let inverse = PairwiseRotation {
                rotation: -rotation.rotation,
                visibility_score: rotation.visibility_score,
            };
            self.edges.insert(ViewPair::new(b, a), inverse);
        }
    }

    pub fn remove_edge(&mut self, pair: &ViewPair) -> Option<PairwiseRotation> {
        self.edges.remove(pair)
    }

    pub fn edge(&self, pair: &ViewPair) -> Option<&PairwiseRotation> {
        self.edges.get(pair)
    }

    pub fn edges(&self) -> &RelativeRotations {
        &self.edges
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Views that appear in at least one edge, in ascending order.
    pub fn view_ids(&self) -> BTreeSet<ViewId> {
        self.edges
            .keys()
            .flat_map(|pair| vec![pair.first, pair.second])
            .collect()
    }

    pub fn num_views(&self) -> usize {
        self.view_ids().len()
    }

    /// Identity rotation for every view in the graph.
    pub fn identity_rotations(&self) -> GlobalRotationMap {
        self.view_ids()
            .into_iter()
            .map(|id| (id, Vector3::zeros()))
            .collect()
    }

    /// Edges with both endpoints in `views`.
    pub fn subgraph(&self, views: &HashSet<ViewId>) -> Self {
        let edges = self
            .edges
            .iter()
            .filter(|(pair, _)| views.contains(&pair.first) && views.contains(&pair.second))
            .map(|(pair, rotation)| (*pair, rotation.clone()))
            .collect();
        ViewGraph { edges }
    }

    /// Connected components as sets of view ids.
    pub fn connected_components(&self) -> Vec<HashSet<ViewId>> {
        let mut forest =
            DisjointSetForest::with_nodes(self.view_ids().into_iter().map(|id| id as usize));
        for pair in self.edges.keys() {
            // both endpoints were registered above
            let _ = forest.union(pair.first as usize, pair.second as usize);
        }
        forest
            .components()
            .into_iter()
            .map(|(_, members)| members.into_iter().map(|id| id as ViewId).collect())
            .collect()
    }

    /// Restrict the graph to its largest connected component. Ties are broken towards the
    /// component holding the smallest view id.
    pub fn largest_connected_component(&self) -> Self {
        let components = self.connected_components();
        match components.into_iter().max_by(|a, b| {
            a.len().cmp(&b.len()).then_with(|| {
                let min_a = a.iter().min();
                let min_b = b.iter().min();
                min_b.cmp(&min_a)
            })
        }) {
            Some(component) => self.subgraph(&component),
            None => ViewGraph::new(),
        }
    }

    /// Balanced partition of the views into `num_parts` parts using visibility scores as edge
    /// weights. Returns the part label of every view.
    pub fn partition(&self, num_parts: usize) -> HashMap<ViewId, usize> {
        let (edges, weights): (Vec<_>, Vec<_>) = self
            .edges
            .iter()
            .sorted_by_key(|(pair, _)| **pair)
            .map(|(pair, rotation)| {
                (
                    (pair.first, pair.second),
                    rotation.visibility_score.max(1),
                )
            })
            .unzip();
        compute_normalized_min_graph_cut(&edges, &weights, num_parts)
    }
}

impl std::fmt::Display for ViewGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "View graph with {} views and {} edges",
            self.num_views(),
            self.num_edges()
        )
    }
}

#[cfg(test)]
fn chain(ids: &[ViewId]) -> ViewGraph {
    let mut graph = ViewGraph::new();
    for (a, b) in ids.iter().tuple_windows() {
        graph.add_edge(*a, *b, PairwiseRotation::new(Vector3::new(0.0, 0.0, 0.1)));
    }
    graph
}

#[test]
fn test_add_edge_orders_pair() {
    let mut graph = ViewGraph::new();
    let r = Vector3::new(0.1, 0.2, 0.3);
    graph.add_edge(7, 3, PairwiseRotation::new(r));
    let stored = graph.edge(&ViewPair::new(3, 7)).unwrap();
    assert_eq!(stored.rotation, -r);
}

#[test]
#[should_panic]
fn test_unordered_view_pair_panics() {
    ViewPair::new(4, 2);
}

#[test]
fn test_ascent_index() {
    let ids = vec![42, 7, 19, 7];
    let index = view_id_to_ascent_index(&ids);
    assert_eq!(index.len(), 3);
    assert_eq!(index[&7], 0);
    assert_eq!(index[&19], 1);
    assert_eq!(index[&42], 2);
}

#[test]
fn test_largest_connected_component() {
    let mut graph = chain(&[1, 2, 3, 4]);
    for (a, b) in chain(&[10, 11]).edges() {
        graph.add_edge(a.first, a.second, b.clone());
    }
    assert_eq!(graph.connected_components().len(), 2);

    let lcc = graph.largest_connected_component();
    assert_eq!(lcc.num_views(), 4);
    assert_eq!(lcc.num_edges(), 3);
    assert!(lcc.view_ids().contains(&1));
    assert!(!lcc.view_ids().contains(&10));
}
