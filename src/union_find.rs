//! Disjoint-set forest over dense or arbitrary node ids.

use disjoint_sets::UnionFind;
use std::collections::{HashMap, HashSet};

use crate::{Error, Result};

/// Tracks connected components of a growing edge set.
///
/// Nodes are either the dense range `0..n` ([DisjointSetForest::new]) or an arbitrary set of ids
/// ([DisjointSetForest::init_with_nodes]). Roots are reported as node ids, never as internal
/// slots. Union is by rank and lookups compress paths.
#[derive(Debug, Clone)]
pub struct DisjointSetForest {
    forest: UnionFind<usize>,
    // Both empty when nodes are the dense range.
    node_to_slot: HashMap<usize, usize>,
    slot_to_node: Vec<usize>,
}

impl Default for DisjointSetForest {
    fn default() -> Self {
        DisjointSetForest::new(0)
    }
}

impl DisjointSetForest {
    /// Forest of `n` singleton sets `{0}, ..., {n - 1}`.
    pub fn new(n: usize) -> Self {
        DisjointSetForest {
            forest: UnionFind::new(n),
            node_to_slot: HashMap::new(),
            slot_to_node: Vec::new(),
        }
    }

    /// Reset to `n` singleton sets over `0..n`.
    pub fn init(&mut self, n: usize) {
        *self = DisjointSetForest::new(n);
    }

    /// Reset to singleton sets keyed by `nodes`. Duplicate ids are registered once.
    pub fn init_with_nodes<I: IntoIterator<Item = usize>>(&mut self, nodes: I) {
        let mut node_to_slot = HashMap::new();
        let mut slot_to_node = Vec::new();
        for node in nodes {
            node_to_slot.entry(node).or_insert_with(|| {
                slot_to_node.push(node);
                slot_to_node.len() - 1
            });
        }
        self.forest = UnionFind::new(slot_to_node.len());
        self.node_to_slot = node_to_slot;
        self.slot_to_node = slot_to_node;
    }

    /// Build a forest directly from an arbitrary node set.
    pub fn with_nodes<I: IntoIterator<Item = usize>>(nodes: I) -> Self {
        let mut forest = DisjointSetForest::default();
        forest.init_with_nodes(nodes);
        forest
    }

    pub fn len(&self) -> usize {
        self.forest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forest.len() == 0
    }

    fn is_dense(&self) -> bool {
        self.slot_to_node.is_empty()
    }

    fn slot(&self, node: usize) -> Result<usize> {
        if self.is_dense() {
            if node < self.forest.len() {
                Ok(node)
            } else {
                Err(Error::UnknownNode(node))
            }
        } else {
            self.node_to_slot
                .get(&node)
                .copied()
                .ok_or(Error::UnknownNode(node))
        }
    }

    fn node(&self, slot: usize) -> usize {
        if self.is_dense() {
            slot
        } else {
            self.slot_to_node[slot]
        }
    }

    /// Representative node of the set containing `x`.
    pub fn find_root(&self, x: usize) -> Result<usize> {
        let slot = self.slot(x)?;
        Ok(self.node(self.forest.find(slot)))
    }

    /// Merge the sets containing `a` and `b`. Returns false if they were already merged.
    pub fn union(&mut self, a: usize, b: usize) -> Result<bool> {
        let sa = self.slot(a)?;
        let sb = self.slot(b)?;
        Ok(self.forest.union(sa, sb))
    }

    /// Whether `a` and `b` are in the same set.
    pub fn connected(&self, a: usize, b: usize) -> Result<bool> {
        Ok(self.forest.equiv(self.slot(a)?, self.slot(b)?))
    }

    /// Distinct roots of the current sets.
    pub fn connected_components(&self) -> HashSet<usize> {
        self.forest
            .to_vec()
            .into_iter()
            .map(|root| self.node(root))
            .collect()
    }

    /// Members of every set, keyed by the set's root.
    pub fn components(&self) -> HashMap<usize, Vec<usize>> {
        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for (slot, root) in self.forest.to_vec().into_iter().enumerate() {
            components
                .entry(self.node(root))
                .or_default()
                .push(self.node(slot));
        }
        components
    }
}

#[cfg(test)]
const TEST_UNIONS: [(usize, usize); 6] = [(0, 2), (4, 5), (3, 9), (5, 7), (6, 7), (1, 4)];

#[test]
fn test_init() {
    let forest = DisjointSetForest::new(100);
    for i in 0..100 {
        assert_eq!(forest.find_root(i).unwrap(), i);
    }
    assert_eq!(forest.connected_components().len(), 100);
}

#[test]
fn test_find_root() {
    let mut forest = DisjointSetForest::new(10);
    for &(a, b) in TEST_UNIONS.iter() {
        forest.union(a, b).unwrap();
    }

    let root = |x| forest.find_root(x).unwrap();
    assert_eq!(root(0), root(2));
    assert_eq!(root(3), root(9));
    assert_eq!(root(1), root(4));
    assert_eq!(root(1), root(5));
    assert_eq!(root(1), root(6));
    assert_eq!(root(1), root(7));
    assert_eq!(root(8), 8);
    assert_ne!(root(0), root(1));
    assert_ne!(root(3), root(1));
}

#[test]
fn test_union_is_idempotent() {
    let mut forest = DisjointSetForest::new(4);
    assert!(forest.union(0, 1).unwrap());
    assert!(!forest.union(1, 0).unwrap());
    assert!(!forest.union(0, 0).unwrap());
    assert_eq!(forest.connected_components().len(), 3);
}

#[test]
fn test_init_with_nodes() {
    let mut forest = DisjointSetForest::new(10);
    forest.init_with_nodes(vec![2, 5, 8, 9, 12, 13, 15, 17, 20, 21]);

    let unions = [(2, 8), (12, 13), (9, 21), (13, 17), (15, 17), (5, 12)];
    for &(a, b) in unions.iter() {
        forest.union(a, b).unwrap();
    }

    let root = |x| forest.find_root(x).unwrap();
    assert_eq!(root(2), root(8));
    assert_eq!(root(9), root(21));
    assert_eq!(root(5), root(12));
    assert_eq!(root(5), root(13));
    assert_eq!(root(5), root(15));
    assert_eq!(root(5), root(17));
    assert_eq!(root(20), 20);
    assert_eq!(forest.connected_components().len(), 4);
    assert!(forest.connected_components().contains(&root(17)));
}

#[test]
fn test_unknown_node() {
    let mut forest = DisjointSetForest::with_nodes(vec![3, 7]);
    assert!(forest.find_root(4).is_err());
    assert!(forest.union(3, 4).is_err());
    let dense = DisjointSetForest::new(3);
    assert!(dense.find_root(3).is_err());
}

#[test]
fn test_connected_components() {
    let mut forest = DisjointSetForest::new(10);
    for &(a, b) in TEST_UNIONS.iter() {
        forest.union(a, b).unwrap();
    }
    assert_eq!(forest.connected_components().len(), 4);

    let components = forest.components();
    let mut sizes = components.values().map(|c| c.len()).collect::<Vec<_>>();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2, 2, 5]);
}

#[test]
fn test_init_resets_forest() {
    let mut forest = DisjointSetForest::with_nodes(vec![4, 8, 15]);
    forest.union(4, 15).unwrap();

    forest.init(10);
    for &(a, b) in TEST_UNIONS.iter() {
        forest.union(a, b).unwrap();
    }
    forest.init(6);
    assert_eq!(forest.len(), 6);
    assert_eq!(forest.connected_components().len(), 6);
    for i in 0..6 {
        assert_eq!(forest.find_root(i).unwrap(), i);
    }
    assert!(!forest.connected(0, 2).unwrap());
    assert!(forest.find_root(15).is_err());
}
