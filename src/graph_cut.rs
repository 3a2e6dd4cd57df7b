//! Balanced k-way minimum cut of a weighted undirected graph.
//!
//! The partitioner is multilevel: the graph is repeatedly coarsened by collapsing heavy edges,
//! the coarsest graph is split by greedy graph growing, and the labels are projected back level
//! by level. After each projection part weights are brought back under the balance limit and a
//! greedy boundary pass moves vertices that reduce the cut.

use itertools::Itertools;
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::hash::Hash;

/// Weighted undirected graph in compressed adjacency form. Every edge is stored in both
/// directions, so `adjncy.len()` is twice the number of edges.
#[derive(Debug, Clone)]
struct Graph {
    xadj: Vec<usize>,
    adjncy: Vec<usize>,
    adjwgt: Vec<u64>,
    vwgt: Vec<u64>,
}

impl Graph {
    fn from_adjacency(adjacency: Vec<HashMap<usize, u64>>, vwgt: Vec<u64>) -> Graph {
        let mut xadj = Vec::with_capacity(adjacency.len() + 1);
        let mut adjncy = Vec::new();
        let mut adjwgt = Vec::new();
        xadj.push(0);
        for neighbors in adjacency {
            for (u, w) in neighbors.into_iter().sorted() {
                adjncy.push(u);
                adjwgt.push(w);
            }
            xadj.push(adjncy.len());
        }
        Graph {
            xadj,
            adjncy,
            adjwgt,
            vwgt,
        }
    }

    fn num_vertices(&self) -> usize {
        self.vwgt.len()
    }

    fn degree(&self, v: usize) -> usize {
        self.xadj[v + 1] - self.xadj[v]
    }

    fn neighbors(&self, v: usize) -> impl Iterator<Item = (usize, u64)> + '_ {
        let range = self.xadj[v]..self.xadj[v + 1];
        self.adjncy[range.clone()]
            .iter()
            .copied()
            .zip(self.adjwgt[range].iter().copied())
    }

    fn total_vertex_weight(&self) -> u64 {
        self.vwgt.iter().sum()
    }
}

fn dense_index<T: Copy + Eq + Hash>(id: T, index_of: &mut HashMap<T, usize>, ids: &mut Vec<T>) -> usize {
    *index_of.entry(id).or_insert_with(|| {
        ids.push(id);
        ids.len() - 1
    })
}

/// Total weight of edges whose endpoints carry different labels.
fn edge_cut(g: &Graph, labels: &[usize]) -> u64 {
    let twice: u64 = (0..g.num_vertices())
        .flat_map(move |v| g.neighbors(v).map(move |(u, w)| (v, u, w)))
        .filter(|&(v, u, _)| labels[v] != labels[u])
        .map(|(_, _, w)| w)
        .sum();
    twice / 2
}

/// Sum over parts of `cut(part) / volume(part)`.
fn normalized_cut(g: &Graph, labels: &[usize], num_parts: usize) -> f64 {
    let mut cut = vec![0u64; num_parts];
    let mut volume = vec![0u64; num_parts];
    for v in 0..g.num_vertices() {
        for (u, w) in g.neighbors(v) {
            volume[labels[v]] += w;
            if labels[u] != labels[v] {
                cut[labels[v]] += w;
            }
        }
    }
    cut.iter()
        .zip(volume.iter())
        .filter(|(_, &vol)| vol > 0)
        .map(|(&c, &vol)| c as f64 / vol as f64)
        .sum()
}

fn part_weights(g: &Graph, labels: &[usize], num_parts: usize) -> Vec<u64> {
    let mut weights = vec![0; num_parts];
    for (v, &p) in labels.iter().enumerate() {
        weights[p] += g.vwgt[v];
    }
    weights
}

/// Edge weight from `v` into every part.
fn connections(g: &Graph, labels: &[usize], v: usize, num_parts: usize) -> Vec<u64> {
    let mut conn = vec![0; num_parts];
    for (u, w) in g.neighbors(v) {
        conn[labels[u]] += w;
    }
    conn
}

/// Heavy edge matching. Vertices are visited by ascending degree and matched with the unmatched
/// neighbor behind the heaviest edge. Returns the coarse graph and the fine to coarse map.
fn coarsen(g: &Graph, max_vertex_weight: u64) -> (Graph, Vec<usize>) {
    let n = g.num_vertices();
    let order = (0..n).sorted_by_key(|&v| g.degree(v)).collect::<Vec<_>>();
    let mut matched = vec![false; n];
    let mut cmap = vec![0; n];
    let mut num_coarse = 0;
    for v in order {
        if matched[v] {
            continue;
        }
        let mate = g
            .neighbors(v)
            .filter(|&(u, _)| {
                u != v && !matched[u] && g.vwgt[u] + g.vwgt[v] <= max_vertex_weight
            })
            .max_by_key(|&(u, w)| (w, Reverse(u)))
            .map(|(u, _)| u)
            .unwrap_or(v);
        matched[v] = true;
        matched[mate] = true;
        cmap[v] = num_coarse;
        cmap[mate] = num_coarse;
        num_coarse += 1;
    }

    let mut vwgt = vec![0; num_coarse];
    let mut adjacency = vec![HashMap::new(); num_coarse];
    for v in 0..n {
        let cv = cmap[v];
        vwgt[cv] += g.vwgt[v];
        for (u, w) in g.neighbors(v) {
            let cu = cmap[u];
            if cu != cv {
                *adjacency[cv].entry(cu).or_insert(0) += w;
            }
        }
    }
    (Graph::from_adjacency(adjacency, vwgt), cmap)
}

/// Greedy graph growing: each part but the last grows from a seed by absorbing the frontier
/// vertex most strongly connected to it until it reaches its share of the remaining weight.
/// The last part takes whatever is left.
fn grow_initial_partition(g: &Graph, num_parts: usize) -> Vec<usize> {
    let n = g.num_vertices();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut remaining = g.total_vertex_weight();
    for part in 0..num_parts - 1 {
        let target = remaining as f64 / (num_parts - part) as f64;
        let mut weight = 0u64;
        let mut frontier: HashMap<usize, u64> = HashMap::new();
        while (weight as f64) < target {
            let next = frontier
                .iter()
                .max_by_key(|&(&v, &c)| (c, Reverse(v)))
                .map(|(&v, _)| v)
                .or_else(|| (0..n).find(|&v| labels[v].is_none()));
            let Some(v) = next else { break };
            let w = g.vwgt[v] as f64;
            // stop when taking v would overshoot further than stopping short
            if weight > 0 && weight as f64 + w - target > target - weight as f64 {
                break;
            }
            labels[v] = Some(part);
            weight += g.vwgt[v];
            frontier.remove(&v);
            for (u, ew) in g.neighbors(v) {
                if labels[u].is_none() {
                    *frontier.entry(u).or_insert(0) += ew;
                }
            }
        }
        remaining -= weight;
    }
    labels
        .into_iter()
        .map(|l| l.unwrap_or(num_parts - 1))
        .collect()
}

/// Move vertices out of parts heavier than `max_part_weight`, choosing the move with the best
/// cut gain each time.
fn enforce_balance(g: &Graph, labels: &mut [usize], num_parts: usize, max_part_weight: u64) {
    let mut weights = part_weights(g, labels, num_parts);
    for _ in 0..g.num_vertices() {
        let Some(from) = (0..num_parts)
            .filter(|&p| weights[p] > max_part_weight)
            .max_by_key(|&p| (weights[p], Reverse(p)))
        else {
            return;
        };

        let mut best: Option<(i64, usize, usize)> = None;
        for v in (0..g.num_vertices()).filter(|&v| labels[v] == from) {
            let conn = connections(g, labels, v, num_parts);
            for to in 0..num_parts {
                if to == from || weights[to] + g.vwgt[v] > max_part_weight {
                    continue;
                }
                let gain = conn[to] as i64 - conn[from] as i64;
                if best.map_or(true, |(best_gain, _, _)| gain > best_gain) {
                    best = Some((gain, v, to));
                }
            }
        }
        // coarse vertices may be too heavy to fit anywhere
        let Some((_, v, to)) = best else { return };
        labels[v] = to;
        weights[from] -= g.vwgt[v];
        weights[to] += g.vwgt[v];
    }
}

/// Greedy boundary refinement. A vertex moves when that strictly lowers the cut, or leaves it
/// unchanged while evening out the two part weights. Moves never overfill a part or empty one,
/// so the cut is non-increasing. Returns the number of moves made.
fn refine(
    g: &Graph,
    labels: &mut [usize],
    num_parts: usize,
    max_part_weight: u64,
    max_passes: usize,
) -> usize {
    let mut weights = part_weights(g, labels, num_parts);
    let mut sizes = vec![0usize; num_parts];
    for &p in labels.iter() {
        sizes[p] += 1;
    }

    let mut total_moves = 0;
    for pass in 0..max_passes {
        let mut moves = 0;
        for v in 0..g.num_vertices() {
            let from = labels[v];
            if sizes[from] <= 1 {
                continue;
            }
            let conn = connections(g, labels, v, num_parts);
            let on_boundary = conn
                .iter()
                .enumerate()
                .any(|(p, &c)| p != from && c > 0);
            if !on_boundary {
                continue;
            }

            let w = g.vwgt[v];
            let mut best: Option<(i64, usize)> = None;
            for to in 0..num_parts {
                if to == from || weights[to] + w > max_part_weight {
                    continue;
                }
                let gain = conn[to] as i64 - conn[from] as i64;
                let evens_out = weights[to] + w < weights[from];
                if gain < 0 || (gain == 0 && !evens_out) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_gain, best_to)) => {
                        gain > best_gain || (gain == best_gain && weights[to] < weights[best_to])
                    }
                };
                if better {
                    best = Some((gain, to));
                }
            }

            if let Some((_, to)) = best {
                labels[v] = to;
                weights[from] -= w;
                weights[to] += w;
                sizes[from] -= 1;
                sizes[to] += 1;
                moves += 1;
            }
        }
        debug!("refinement pass {}: {} moves", pass, moves);
        total_moves += moves;
        if moves == 0 {
            break;
        }
    }
    total_moves
}

fn multilevel_partition(graph: &Graph, num_parts: usize) -> Vec<usize> {
    let n = graph.num_vertices();
    let total = graph.total_vertex_weight();
    let k = num_parts as u64;
    let coarsen_to =
        ((n as f64 / (40.0 * (num_parts as f64).log2())) as usize).max(20 * num_parts);
    let max_vertex_weight = ((1.5 * total as f64 / coarsen_to as f64).ceil() as u64).max(1);
    // ceil(1.05 * total / k) in integers
    let max_part_weight = (105 * total + 100 * k - 1) / (100 * k);
    let max_passes = ((n as f64).log2() as usize + num_parts).max(4);

    // each level holds the coarse graph and the map from the next finer level into it
    let mut levels: Vec<(Graph, Vec<usize>)> = Vec::new();
    loop {
        let current = levels.last().map(|(g, _)| g).unwrap_or(graph);
        if current.num_vertices() <= coarsen_to {
            break;
        }
        let (coarse, cmap) = coarsen(current, max_vertex_weight);
        if coarse.num_vertices() as f64 > 0.95 * current.num_vertices() as f64 {
            break;
        }
        levels.push((coarse, cmap));
    }
    debug!(
        "coarsened {} vertices in {} levels (target {})",
        n,
        levels.len(),
        coarsen_to
    );

    let coarsest = levels.last().map(|(g, _)| g).unwrap_or(graph);
    let mut labels = grow_initial_partition(coarsest, num_parts);
    enforce_balance(coarsest, &mut labels, num_parts, max_part_weight);
    refine(coarsest, &mut labels, num_parts, max_part_weight, max_passes);

    for level in (0..levels.len()).rev() {
        let finer = if level == 0 {
            graph
        } else {
            &levels[level - 1].0
        };
        labels = levels[level].1.iter().map(|&c| labels[c]).collect();
        enforce_balance(finer, &mut labels, num_parts, max_part_weight);
        refine(finer, &mut labels, num_parts, max_part_weight, max_passes);
    }
    labels
}

/// Partition a weighted undirected graph into `num_parts` parts of roughly equal size while
/// minimizing the total weight of cut edges.
///
/// Vertices are the ids appearing in `edges`; `weights[i]` is the weight of `edges[i]`.
/// Parallel edges are merged by summing their weights and self loops are ignored. Every vertex
/// gets a label in `0..num_parts` and no part holds more than `ceil(1.05 * V / num_parts)`
/// vertices.
///
/// Panics if `edges` and `weights` differ in length, if `num_parts < 2` or if a weight is zero.
pub fn compute_normalized_min_graph_cut<T>(
    edges: &[(T, T)],
    weights: &[u32],
    num_parts: usize,
) -> HashMap<T, usize>
where
    T: Copy + Eq + Hash,
{
    assert_eq!(
        edges.len(),
        weights.len(),
        "every edge needs exactly one weight"
    );
    assert!(num_parts >= 2, "need at least two parts, got {}", num_parts);
    assert!(
        weights.iter().all(|&w| w > 0),
        "edge weights must be positive"
    );

    let mut index_of = HashMap::new();
    let mut ids = Vec::new();
    let mut adjacency: Vec<HashMap<usize, u64>> = Vec::new();
    let mut self_loops = 0;
    for (&(a, b), &w) in edges.iter().zip(weights) {
        let ia = dense_index(a, &mut index_of, &mut ids);
        let ib = dense_index(b, &mut index_of, &mut ids);
        adjacency.resize_with(ids.len(), HashMap::new);
        if ia == ib {
            self_loops += 1;
            continue;
        }
        *adjacency[ia].entry(ib).or_insert(0) += w as u64;
        *adjacency[ib].entry(ia).or_insert(0) += w as u64;
    }
    if self_loops > 0 {
        warn!("ignoring {} self loops in the partitioning graph", self_loops);
    }
    if ids.is_empty() {
        return HashMap::new();
    }

    let graph = Graph::from_adjacency(adjacency, vec![1; ids.len()]);
    let labels = multilevel_partition(&graph, num_parts);

    let weights = part_weights(&graph, &labels, num_parts);
    let ideal = graph.total_vertex_weight() as f64 / num_parts as f64;
    let heaviest = weights.iter().copied().max().unwrap_or(0);
    info!(
        "Partitioned {} vertices into {} parts: edge cut {}, normalized cut {:.4}, balance {:.3} (part sizes {:?})",
        ids.len(),
        num_parts,
        edge_cut(&graph, &labels),
        normalized_cut(&graph, &labels, num_parts),
        heaviest as f64 / ideal,
        weights
    );

    ids.into_iter().zip(labels).collect()
}

#[cfg(test)]
fn two_cliques() -> Vec<(u64, u64)> {
    let mut edges = Vec::new();
    for offset in [100, 200].iter() {
        for (a, b) in (0..10).tuple_combinations() {
            edges.push((offset + a, offset + b));
        }
    }
    edges.push((105, 203));
    edges
}

#[cfg(test)]
fn random_graph(n: usize, seed: u64) -> Vec<(usize, usize)> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let mut edges = (0..n - 1).map(|i| (i, i + 1)).collect::<Vec<_>>();
    for _ in 0..3 * n {
        let a = rng.gen_range(0..n);
        let b = rng.gen_range(0..n);
        if a != b {
            edges.push((a, b));
        }
    }
    edges
}

#[test]
fn test_two_cliques_split_at_bridge() {
    let edges = two_cliques();
    let weights = vec![1; edges.len()];
    let labels = compute_normalized_min_graph_cut(&edges, &weights, 2);
    assert_eq!(labels.len(), 20);
    for a in 100..110 {
        assert_eq!(labels[&a], labels[&100]);
    }
    for b in 200..210 {
        assert_eq!(labels[&b], labels[&200]);
    }
    assert_ne!(labels[&100], labels[&200]);
}

#[test]
fn test_balance_and_coverage() {
    let n = 200;
    let k = 4;
    let edges = random_graph(n, 7);
    let weights = (0..edges.len()).map(|i| 1 + (i % 3) as u32).collect::<Vec<_>>();
    let labels = compute_normalized_min_graph_cut(&edges, &weights, k);

    assert_eq!(labels.len(), n);
    let mut sizes = vec![0; k];
    for (_, &p) in labels.iter() {
        assert!(p < k);
        sizes[p] += 1;
    }
    let limit = (105 * n + 100 * k - 1) / (100 * k);
    assert!(sizes.iter().all(|&s| s > 0 && s <= limit), "{:?}", sizes);
}

#[test]
fn test_parallel_edges_are_coalesced() {
    let edges = vec![(1, 2), (2, 1), (1, 2), (3, 3), (2, 3)];
    let weights = vec![1, 2, 3, 4, 1];
    let mut index_of = HashMap::new();
    let mut ids = Vec::new();
    let mut adjacency: Vec<HashMap<usize, u64>> = Vec::new();
    for (&(a, b), &w) in edges.iter().zip(&weights) {
        let ia = dense_index(a, &mut index_of, &mut ids);
        let ib = dense_index(b, &mut index_of, &mut ids);
        adjacency.resize_with(ids.len(), HashMap::new);
        if ia != ib {
            *adjacency[ia].entry(ib).or_insert(0) += w as u64;
            *adjacency[ib].entry(ia).or_insert(0) += w as u64;
        }
    }
    let g = Graph::from_adjacency(adjacency, vec![1; ids.len()]);
    assert_eq!(g.num_vertices(), 3);
    assert_eq!(g.adjncy.len(), 4);
    assert_eq!(g.neighbors(0).collect::<Vec<_>>(), vec![(1, 6)]);

    let labels = compute_normalized_min_graph_cut(&edges, &weights, 2);
    assert_eq!(labels.len(), 3);
}

#[test]
fn test_refinement_never_increases_cut() {
    let n = 120;
    let num_parts = 3;
    let edges = random_graph(n, 3);
    let mut adjacency = vec![HashMap::new(); n];
    for &(a, b) in edges.iter() {
        *adjacency[a].entry(b).or_insert(0) += 1;
        *adjacency[b].entry(a).or_insert(0) += 1;
    }
    let g = Graph::from_adjacency(adjacency, vec![1; n]);
    let mut labels = (0..n).map(|v| v % num_parts).collect::<Vec<_>>();
    let before = edge_cut(&g, &labels);
    let max_part_weight = (105 * n as u64 + 299) / 300;
    let moves = refine(&g, &mut labels, num_parts, max_part_weight, 10);
    let after = edge_cut(&g, &labels);
    assert!(moves > 0);
    assert!(after < before, "{} -> {}", before, after);
    assert!(part_weights(&g, &labels, num_parts)
        .iter()
        .all(|&w| w <= max_part_weight));
}

#[test]
fn test_coarsening_preserves_weight() {
    let edges = random_graph(300, 11);
    let mut adjacency = vec![HashMap::new(); 300];
    for &(a, b) in edges.iter() {
        *adjacency[a].entry(b).or_insert(0) += 1;
        *adjacency[b].entry(a).or_insert(0) += 1;
    }
    let g = Graph::from_adjacency(adjacency, vec![1; 300]);
    let (coarse, cmap) = coarsen(&g, 4);
    assert!(coarse.num_vertices() < g.num_vertices());
    assert_eq!(coarse.total_vertex_weight(), 300);
    assert!(cmap.iter().all(|&c| c < coarse.num_vertices()));
    assert!(coarse.vwgt.iter().all(|&w| w <= 4));
}

#[test]
#[should_panic]
fn test_mismatched_weights_panic() {
    compute_normalized_min_graph_cut(&[(0, 1), (1, 2)], &[1], 2);
}
