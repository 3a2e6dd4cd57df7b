//! Full rotation averaging pipeline: global initialization by the SDP relaxation, optional
//! robust L1 refinement, then IRLS.
//!
//! Large view graphs can be split into clusters first. Every cluster is initialized by its own
//! relaxation, which runs in parallel, and the clusters are then rotated into a common frame
//! using the edges between them.

use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::{info, warn};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::irls::{IrlsRefinerOptions, IrlsRotationLocalRefiner, IrlsSummary};
use crate::l1_rotation::{L1RotationGlobalRefiner, L1RotationOptions, L1RotationSummary};
use crate::lagrange_dual::LagrangeDualRotationEstimator;
use crate::rotation::{chordal_mean, from_rodrigues, to_rodrigues};
use crate::sdp::{SdpSolverOptions, SdpSummary};
use crate::viewgraph::{view_id_to_ascent_index, GlobalRotationMap, ViewGraph, ViewId};
use crate::{Error, Result};

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    let style = match ProgressStyle::default_bar().template("{msg} [{bar:40}] {percent}% ({eta})")
    {
        Ok(style) => style.progress_chars("#-"),
        Err(_) => ProgressStyle::default_bar(),
    };
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

#[derive(Debug, Clone, Default)]
pub struct HybridRotationOptions {
    pub sdp: SdpSolverOptions,
    pub irls: IrlsRefinerOptions,
    /// Run the L1 refiner between initialization and IRLS.
    pub l1: Option<L1RotationOptions>,
    /// Split the view graph into clusters of roughly this many views before initialization.
    pub max_views_per_cluster: Option<usize>,
    pub compute_error_bound: bool,
    /// Show progress bars.
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RotationEstimatorSummary {
    /// One entry per cluster that needed a relaxation solve.
    pub sdp_summaries: Vec<SdpSummary>,
    pub num_clusters: usize,
    pub l1: Option<L1RotationSummary>,
    pub irls: IrlsSummary,
    pub error_bound: Option<f64>,
    /// Views outside the largest connected component. Their rotations are not touched.
    pub unused_views: Vec<ViewId>,
    pub elapsed: Duration,
}

pub struct HybridRotationEstimator {
    options: HybridRotationOptions,
}

impl HybridRotationEstimator {
    pub fn new(options: HybridRotationOptions) -> Self {
        HybridRotationEstimator { options }
    }

    pub fn options(&self) -> &HybridRotationOptions {
        &self.options
    }

    /// Estimate the rotations of the largest connected component of `view_graph`.
    ///
    /// Rotations already in `rotations` are ignored by the initialization but kept for views
    /// outside the component. Views of the component that are missing get an entry.
    pub fn estimate_rotations(
        &self,
        view_graph: &ViewGraph,
        rotations: &mut GlobalRotationMap,
    ) -> Result<RotationEstimatorSummary> {
        let start = Instant::now();
        let component = view_graph.largest_connected_component();
        if component.num_edges() == 0 {
            return Err(Error::EmptyProblem("view graph has no edges".into()));
        }
        let views = component.view_ids();
        let mut summary = RotationEstimatorSummary {
            unused_views: view_graph
                .view_ids()
                .into_iter()
                .filter(|id| !views.contains(id))
                .collect(),
            ..Default::default()
        };
        if !summary.unused_views.is_empty() {
            warn!(
                "{} views are outside the largest connected component and are skipped",
                summary.unused_views.len()
            );
        }
        info!("Estimating rotations of {}", component);

        let mut estimate = match self.options.max_views_per_cluster {
            Some(max_views) if max_views > 0 && views.len() > max_views => {
                let num_parts = ((views.len() + max_views - 1) / max_views).max(2);
                self.clustered_initialization(&component, num_parts, &mut summary)?
            }
            _ => {
                let (estimate, sdp) = solve_cluster(&component, &self.options.sdp)?;
                summary.num_clusters = 1;
                summary.sdp_summaries.extend(sdp);
                estimate
            }
        };

        let view_id_to_index = view_id_to_ascent_index(views.iter());
        let mut l1_step = None;
        if let Some(l1_options) = &self.options.l1 {
            let mut refiner = L1RotationGlobalRefiner::new(
                views.len(),
                component.num_edges(),
                l1_options.clone(),
            );
            refiner.set_view_id_to_index(view_id_to_index.clone());
            summary.l1 = Some(refiner.solve(component.edges(), &mut estimate)?);
            l1_step = Some(refiner.tangent_space_step().clone());
        }

        let mut irls = IrlsRotationLocalRefiner::new(
            views.len(),
            component.num_edges(),
            self.options.irls.clone(),
        );
        if let Some(step) = l1_step {
            irls.set_init_tangent_space_step(step);
        }
        irls.set_view_id_to_index(view_id_to_index.clone());
        summary.irls = irls.solve_irls(component.edges(), &mut estimate)?;

        if self.options.compute_error_bound {
            let mut estimator =
                LagrangeDualRotationEstimator::new(views.len(), 3, self.options.sdp.clone());
            estimator.set_view_id_to_index(view_id_to_index);
            summary.error_bound = Some(estimator.compute_error_bound(component.edges()));
        }

        rotations.extend(estimate);
        summary.elapsed = start.elapsed();
        info!(
            "Estimated {} rotations from {} clusters in {:.3} s",
            views.len(),
            summary.num_clusters,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    /// Partition the component, solve every cluster independently and rotate all clusters into
    /// the frame of the largest one.
    fn clustered_initialization(
        &self,
        component: &ViewGraph,
        num_parts: usize,
        summary: &mut RotationEstimatorSummary,
    ) -> Result<GlobalRotationMap> {
        let labels = component.partition(num_parts);
        let mut clusters = labels
            .iter()
            .map(|(&id, &part)| (part, id))
            .into_group_map()
            .into_iter()
            .sorted_by_key(|(part, _)| *part)
            .flat_map(|(_, members)| {
                let members = members.into_iter().collect::<HashSet<_>>();
                let part = component.subgraph(&members);
                let mut components = part.connected_components();
                // views of the part without an edge inside it
                let covered = components.iter().flatten().copied().collect::<HashSet<_>>();
                components.extend(
                    members
                        .difference(&covered)
                        .map(|&id| std::iter::once(id).collect::<HashSet<_>>()),
                );
                components
            })
            .collect::<Vec<_>>();
        clusters.sort_by_key(|c| (std::cmp::Reverse(c.len()), c.iter().min().copied()));
        info!(
            "Split {} views into {} clusters, largest has {} views",
            labels.len(),
            clusters.len(),
            clusters.first().map_or(0, |c| c.len())
        );

        let pb = progress_bar(
            clusters.len() as u64,
            "Initializing clusters",
            self.options.verbose,
        );
        let solved = clusters
            .par_iter()
            .progress_with(pb.clone())
            .map(|members| {
                if members.len() == 1 {
                    let rotations: GlobalRotationMap =
                        members.iter().map(|&id| (id, Vector3::zeros())).collect();
                    return Ok((rotations, None));
                }
                solve_cluster(&component.subgraph(members), &self.options.sdp)
            })
            .collect::<Result<Vec<_>>>()?;
        pb.finish_and_clear();

        summary.num_clusters = clusters.len();
        let mut cluster_rotations = Vec::with_capacity(solved.len());
        for (rotations, sdp) in solved {
            cluster_rotations.push(rotations);
            summary.sdp_summaries.extend(sdp);
        }
        Ok(align_clusters(component, &cluster_rotations))
    }
}

fn solve_cluster(
    graph: &ViewGraph,
    options: &SdpSolverOptions,
) -> Result<(GlobalRotationMap, Option<SdpSummary>)> {
    let mut rotations = graph.identity_rotations();
    let mut estimator = LagrangeDualRotationEstimator::new(rotations.len(), 3, options.clone());
    estimator.estimate_rotations(graph.edges(), &mut rotations)?;
    Ok((rotations, Some(estimator.summary().clone())))
}

/// Bring every cluster into the frame of the first one.
///
/// Each cluster is only known up to a rotation `G` applied on the right, `R_i = R_i^c G`. Going
/// through the clusters in breadth first order from the first, `G` of the next cluster is the
/// chordal mean of the predictions `R_i^c^T R_ij^T R_j` (or `R_i^c^T R_ij R_j` for the other edge
/// direction) over all edges to already aligned views.
fn align_clusters(component: &ViewGraph, clusters: &[GlobalRotationMap]) -> GlobalRotationMap {
    let cluster_of: HashMap<ViewId, usize> = clusters
        .iter()
        .enumerate()
        .flat_map(|(c, rotations)| rotations.keys().map(move |&id| (id, c)))
        .collect();
    let mut cluster_edges: HashMap<(usize, usize), Vec<_>> = HashMap::new();
    for (pair, measurement) in component.edges() {
        let (Some(&ca), Some(&cb)) = (cluster_of.get(&pair.first), cluster_of.get(&pair.second))
        else {
            continue;
        };
        if ca != cb {
            let r = from_rodrigues(&measurement.rotation);
            // (view in the cluster, view outside, rotation taking the outside view to it)
            cluster_edges
                .entry((ca, cb))
                .or_default()
                .push((pair.first, pair.second, r.transpose()));
            cluster_edges
                .entry((cb, ca))
                .or_default()
                .push((pair.second, pair.first, r));
        }
    }
    let mut neighbors = vec![Vec::new(); clusters.len()];
    for &(a, b) in cluster_edges.keys().sorted() {
        neighbors[a].push(b);
    }

    let mut aligned: GlobalRotationMap = GlobalRotationMap::new();
    let mut visited = vec![false; clusters.len()];
    let mut queue = VecDeque::new();
    if let Some(first) = clusters.first() {
        aligned.extend(first.iter().map(|(&id, r)| (id, *r)));
        visited[0] = true;
        queue.push_back(0);
    }
    while let Some(current) = queue.pop_front() {
        for &next in &neighbors[current] {
            if visited[next] {
                continue;
            }
            let predictions: Vec<Matrix3<f64>> = neighbors[next]
                .iter()
                .filter(|&&other| visited[other])
                .flat_map(|&other| cluster_edges[&(next, other)].iter())
                .map(|(inside, outside, r)| {
                    from_rodrigues(&clusters[next][inside]).transpose()
                        * r
                        * from_rodrigues(&aligned[outside])
                })
                .collect();
            let gauge = chordal_mean(&predictions);
            aligned.extend(
                clusters[next]
                    .iter()
                    .map(|(&id, r)| (id, to_rodrigues(&(from_rodrigues(r) * gauge)))),
            );
            visited[next] = true;
            queue.push_back(next);
        }
    }
    if visited.iter().any(|v| !v) {
        warn!("some clusters have no edge to the others and keep their own frame");
        for (c, rotations) in clusters.iter().enumerate() {
            if !visited[c] {
                aligned.extend(rotations.iter().map(|(&id, r)| (id, *r)));
            }
        }
    }
    aligned
}

#[cfg(test)]
use crate::synthetic::{rotation_errors, synthetic_view_graph, SyntheticOptions};
#[cfg(test)]
use crate::viewgraph::PairwiseRotation;
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[test]
fn test_noise_free_single_cluster() {
    let mut rng = StdRng::seed_from_u64(3);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 15,
            edge_probability: 0.4,
            ..Default::default()
        },
    );
    let estimator = HybridRotationEstimator::new(HybridRotationOptions::default());
    let mut rotations = GlobalRotationMap::new();
    let summary = estimator
        .estimate_rotations(&problem.view_graph, &mut rotations)
        .unwrap();
    assert_eq!(summary.num_clusters, 1);
    assert_eq!(summary.sdp_summaries.len(), 1);
    assert!(summary.unused_views.is_empty());
    assert_eq!(rotations.len(), 15);
    let errors = rotation_errors(&rotations, &problem.ground_truth);
    assert!(errors.values().all(|&e| e < 1e-3));
}

#[test]
fn test_clusters_are_aligned() {
    let mut rng = StdRng::seed_from_u64(8);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 40,
            edge_probability: 0.2,
            ..Default::default()
        },
    );
    let options = HybridRotationOptions {
        max_views_per_cluster: Some(10),
        irls: IrlsRefinerOptions {
            max_num_irls_iterations: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut rotations = GlobalRotationMap::new();
    let summary = HybridRotationEstimator::new(options)
        .estimate_rotations(&problem.view_graph, &mut rotations)
        .unwrap();
    assert!(summary.num_clusters >= 4);
    // no refinement ran, so the alignment alone has to be exact
    let errors = rotation_errors(&rotations, &problem.ground_truth);
    assert!(errors.values().all(|&e| e < 1e-3), "{:?}", errors);
}

#[test]
fn test_views_outside_component_are_untouched() {
    let mut graph = ViewGraph::new();
    graph.add_edge(0, 1, PairwiseRotation::new(Vector3::new(0.0, 0.0, 0.3)));
    graph.add_edge(1, 2, PairwiseRotation::new(Vector3::new(0.2, 0.0, 0.0)));
    graph.add_edge(7, 8, PairwiseRotation::new(Vector3::new(0.0, 0.1, 0.0)));
    let mut rotations = GlobalRotationMap::new();
    rotations.insert(8, Vector3::new(1.0, 0.0, 0.0));
    let summary = HybridRotationEstimator::new(HybridRotationOptions {
        compute_error_bound: true,
        ..Default::default()
    })
    .estimate_rotations(&graph, &mut rotations)
    .unwrap();
    assert_eq!(summary.unused_views, vec![7, 8]);
    assert_eq!(rotations[&8], Vector3::new(1.0, 0.0, 0.0));
    assert!(!rotations.contains_key(&7));
    assert_eq!(rotations.len(), 4);
    assert!(summary.error_bound.is_some());
}

#[test]
fn test_graph_without_edges_is_rejected() {
    let estimator = HybridRotationEstimator::new(HybridRotationOptions::default());
    let mut rotations = GlobalRotationMap::new();
    assert!(estimator
        .estimate_rotations(&ViewGraph::new(), &mut rotations)
        .is_err());
}
