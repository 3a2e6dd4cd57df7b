//! Global rotation estimation through the Lagrangian dual of rotation synchronization.
//!
//! The relative rotations are stacked into the symmetric block matrix `W` with
//! `W_ij = R_ij^T` and `W_ji = R_ij`. Maximizing `tr(W Y)` over positive semidefinite `Y` with
//! identity diagonal blocks is a convex relaxation of rotation averaging, and for moderate noise
//! it is tight: the solution has rank three and `Y_ij = R_i R_j^T`. Rotations are read off the
//! first block row of `Y`.

use itertools::Itertools;
use log::{error, info, warn};
use nalgebra::{DMatrix, Matrix3, SymmetricEigen};

use crate::rotation::{from_rodrigues, project_to_rotation, to_rodrigues};
use crate::sdp::{create_sdp_solver, BlockSparseMatrix, SdpSolverOptions, SdpSummary};
use crate::viewgraph::{view_id_to_ascent_index, GlobalRotationMap, RelativeRotations, ViewId};
use crate::{Error, Result};
use std::collections::HashMap;

const MAX_EIGEN_ITERATIONS: usize = 10_000;

pub struct LagrangeDualRotationEstimator {
    options: SdpSolverOptions,
    num_views: usize,
    dim: usize,
    view_id_to_index: HashMap<ViewId, usize>,
    summary: SdpSummary,
    solution: DMatrix<f64>,
    error_bound: f64,
}

impl LagrangeDualRotationEstimator {
    pub fn new(num_views: usize, dim: usize, options: SdpSolverOptions) -> Self {
        LagrangeDualRotationEstimator {
            options,
            num_views,
            dim,
            view_id_to_index: HashMap::new(),
            summary: SdpSummary::default(),
            solution: DMatrix::zeros(0, 0),
            error_bound: 0.0,
        }
    }

    /// Use a precomputed view index instead of ordering the views by id.
    pub fn set_view_id_to_index(&mut self, view_id_to_index: HashMap<ViewId, usize>) {
        self.view_id_to_index = view_id_to_index;
    }

    pub fn set_options(&mut self, options: SdpSolverOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &SdpSolverOptions {
        &self.options
    }

    /// Diagnostics of the last SDP solve.
    pub fn summary(&self) -> &SdpSummary {
        &self.summary
    }

    /// Bound computed by the last [LagrangeDualRotationEstimator::compute_error_bound] call.
    pub fn error_bound(&self) -> f64 {
        self.error_bound
    }

    /// Dense relaxation solution `Y` of the last solve.
    pub fn solution(&self) -> &DMatrix<f64> {
        &self.solution
    }

    /// Estimate a rotation for every view in `rotations` from the relative rotations in `pairs`.
    ///
    /// Only the keys of `rotations` are read. The view with the smallest index ends up with the
    /// identity rotation. On error the contents of `rotations` must not be used.
    pub fn estimate_rotations(
        &mut self,
        pairs: &RelativeRotations,
        rotations: &mut GlobalRotationMap,
    ) -> Result<()> {
        if pairs.is_empty() || self.num_views == 0 {
            error!(
                "cannot estimate rotations from {} relative rotations over {} views",
                pairs.len(),
                self.num_views
            );
            return Err(Error::EmptyProblem(format!(
                "{} relative rotations, {} views",
                pairs.len(),
                self.num_views
            )));
        }
        if self.view_id_to_index.is_empty() {
            self.view_id_to_index = view_id_to_ascent_index(rotations.keys());
        }

        let (relative_graph, adjacency) = self.fill_in_relative_graph(pairs)?;
        let mut solver = create_sdp_solver(self.num_views, self.dim, &self.options);
        let (y, summary) = solver.solve(&-&relative_graph, &adjacency)?;
        self.solution = y;
        self.summary = summary;

        self.retrieve_rotations(rotations)?;
        info!(
            "LagrangeDual ({}) converged in {} iterations, total time {:.3} ms",
            self.options.solver_type,
            self.summary.total_iterations_num,
            self.summary.total_time_ms()
        );
        Ok(())
    }

    fn index_of(&self, view_id: ViewId) -> Result<usize> {
        match self.view_id_to_index.get(&view_id) {
            Some(&i) if i < self.num_views => Ok(i),
            _ => Err(Error::UnknownView(view_id)),
        }
    }

    /// Block matrix `W` with `W_ij = R_ij^T`, `W_ji = R_ij`, and the neighbors of every view.
    pub fn fill_in_relative_graph(
        &self,
        pairs: &RelativeRotations,
    ) -> Result<(BlockSparseMatrix, Vec<Vec<usize>>)> {
        if self.dim != 3 {
            return Err(Error::UnsupportedDimension(self.dim));
        }
        let mut relative_graph = BlockSparseMatrix::new(self.num_views, self.dim);
        let mut adjacency = vec![Vec::new(); self.num_views];
        for (pair, measurement) in pairs.iter().sorted_by_key(|(pair, _)| **pair) {
            let i = self.index_of(pair.first)?;
            let j = self.index_of(pair.second)?;
            let r_ij = from_rodrigues(&measurement.rotation);
            relative_graph.insert(i, j, to_dynamic(&r_ij.transpose()));
            relative_graph.insert(j, i, to_dynamic(&r_ij));
            adjacency[i].push(j);
            adjacency[j].push(i);
        }
        Ok((relative_graph, adjacency))
    }

    /// Round the relaxation solution to rotations. Block `Y_0i^T` is flipped if its determinant
    /// is negative and then projected onto SO(3). This rounding is exact when the relaxation is
    /// tight and an approximation otherwise.
    pub fn retrieve_rotations(&self, rotations: &mut GlobalRotationMap) -> Result<()> {
        if self.dim != 3 {
            return Err(Error::UnsupportedDimension(self.dim));
        }
        let y = &self.solution;
        if y.nrows() < 3 || y.ncols() < 3 * self.num_views {
            return Err(Error::InvalidMatrix(
                "no relaxation solution to retrieve rotations from".into(),
            ));
        }
        for (&view_id, rotation) in rotations.iter_mut() {
            let i = self.index_of(view_id)?;
            let block = y.view((0, 3 * i), (3, 3)).transpose();
            let mut r = Matrix3::from_iterator(block.iter().cloned());
            if r.determinant() < 0.0 {
                r = -r;
            }
            *rotation = to_rodrigues(&project_to_rotation(&r));
        }
        Ok(())
    }

    /// Worst case angular error of the estimate implied by the spectrum of the view graph,
    /// `2 asin(sqrt(1/4 + λ2 / (2 d_max)) - 1/2)` with `λ2` the algebraic connectivity and
    /// `d_max` the largest degree. The bound is also stored for [Self::error_bound].
    pub fn compute_error_bound(&mut self, pairs: &RelativeRotations) -> f64 {
        if self.view_id_to_index.is_empty() {
            self.view_id_to_index =
                view_id_to_ascent_index(pairs.keys().flat_map(|p| [&p.first, &p.second]));
        }
        let n = self.view_id_to_index.len().max(self.num_views);
        let mut laplacian = DMatrix::zeros(n, n);
        for pair in pairs.keys() {
            let (Some(&i), Some(&j)) = (
                self.view_id_to_index.get(&pair.first),
                self.view_id_to_index.get(&pair.second),
            ) else {
                warn!("skipping pair ({}, {}) without view index", pair.first, pair.second);
                continue;
            };
            if i >= n || j >= n {
                warn!("skipping pair ({}, {}) with out of range index", pair.first, pair.second);
                continue;
            }
            laplacian[(i, j)] -= 1.0;
            laplacian[(j, i)] -= 1.0;
            laplacian[(i, i)] += 1.0;
            laplacian[(j, j)] += 1.0;
        }
        let max_degree = laplacian.diagonal().iter().cloned().fold(0.0, f64::max);

        let lambda2 = if n < 2 || max_degree == 0.0 {
            0.0
        } else {
            match SymmetricEigen::try_new(laplacian, f64::EPSILON, MAX_EIGEN_ITERATIONS) {
                Some(eig) => {
                    let mut sorted = eig.eigenvalues.iter().cloned().sorted_by(|a, b| a.total_cmp(b));
                    sorted.nth(1).unwrap_or(0.0).max(0.0)
                }
                None => {
                    warn!("computing the eigenvalues of the graph laplacian failed");
                    0.0
                }
            }
        };

        self.error_bound = if max_degree > 0.0 {
            2.0 * ((0.25 + lambda2 / (2.0 * max_degree)).sqrt() - 0.5).asin()
        } else {
            0.0
        };
        self.error_bound
    }
}

fn to_dynamic(m: &Matrix3<f64>) -> DMatrix<f64> {
    DMatrix::from_iterator(3, 3, m.iter().cloned())
}

#[cfg(test)]
use crate::rotation::multiply_rotations;
#[cfg(test)]
use crate::sdp::SdpSolverType;
#[cfg(test)]
use crate::synthetic::{rotation_errors, synthetic_view_graph, SyntheticOptions};
#[cfg(test)]
use crate::viewgraph::{PairwiseRotation, ViewPair};
#[cfg(test)]
use nalgebra::Vector3;
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
fn solve(
    pairs: &RelativeRotations,
    views: &GlobalRotationMap,
    solver_type: SdpSolverType,
) -> GlobalRotationMap {
    let options = SdpSolverOptions {
        solver_type,
        ..Default::default()
    };
    let mut estimator = LagrangeDualRotationEstimator::new(views.len(), 3, options);
    let mut rotations: GlobalRotationMap =
        views.keys().map(|&id| (id, Vector3::zeros())).collect();
    estimator.estimate_rotations(pairs, &mut rotations).unwrap();
    rotations
}

#[test]
fn test_consistent_graph_is_recovered() {
    let mut rng = StdRng::seed_from_u64(17);
    let options = SyntheticOptions {
        num_views: 20,
        edge_probability: 0.4,
        ..Default::default()
    };
    let problem = synthetic_view_graph(&mut rng, &options);
    for solver_type in [
        SdpSolverType::RbrBcm,
        SdpSolverType::RankDeficientBcm,
        SdpSolverType::RiemannianStaircase,
    ]
    .iter()
    {
        let rotations = solve(
            problem.view_graph.edges(),
            &problem.ground_truth,
            *solver_type,
        );
        let errors = rotation_errors(&rotations, &problem.ground_truth);
        let worst = errors.values().cloned().fold(0.0, f64::max);
        assert!(worst < 1e-3, "{}: {}", solver_type, worst);
    }
}

#[test]
fn test_gauge_view_is_identity() {
    let mut rng = StdRng::seed_from_u64(3);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 8,
            edge_probability: 0.5,
            ..Default::default()
        },
    );
    let rotations = solve(
        problem.view_graph.edges(),
        &problem.ground_truth,
        SdpSolverType::RbrBcm,
    );
    let gauge = problem.view_graph.view_ids().into_iter().min().unwrap();
    assert!(rotations[&gauge].norm() < 1e-3);
}

#[test]
fn test_global_rotation_does_not_change_estimate() {
    let mut rng = StdRng::seed_from_u64(5);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 10,
            edge_probability: 0.5,
            ..Default::default()
        },
    );
    // R_i -> R_i G leaves every R_ij = R_j R_i^T unchanged
    let g = Vector3::new(0.4, -1.1, 0.7);
    let rotated_truth: GlobalRotationMap = problem
        .ground_truth
        .iter()
        .map(|(&id, r)| (id, multiply_rotations(r, &g)))
        .collect();
    let mut rotated_pairs = RelativeRotations::new();
    for pair in problem.view_graph.edges().keys() {
        let ri = from_rodrigues(&rotated_truth[&pair.first]);
        let rj = from_rodrigues(&rotated_truth[&pair.second]);
        rotated_pairs.insert(
            *pair,
            PairwiseRotation::new(to_rodrigues(&(rj * ri.transpose()))),
        );
    }

    let original = solve(
        problem.view_graph.edges(),
        &problem.ground_truth,
        SdpSolverType::RbrBcm,
    );
    let rotated = solve(&rotated_pairs, &rotated_truth, SdpSolverType::RbrBcm);
    for (id, r) in original.iter() {
        assert!(crate::rotation::angular_distance(r, &rotated[id]) < 1e-6);
    }
    let errors = rotation_errors(&rotated, &rotated_truth);
    assert!(errors.values().all(|&e| e < 1e-3));
}

#[test]
fn test_empty_problem_is_rejected() {
    let mut estimator = LagrangeDualRotationEstimator::new(3, 3, SdpSolverOptions::default());
    let mut rotations = GlobalRotationMap::new();
    assert!(matches!(
        estimator.estimate_rotations(&RelativeRotations::new(), &mut rotations),
        Err(Error::EmptyProblem(_))
    ));
}

#[test]
fn test_unknown_view_is_rejected() {
    let mut pairs = RelativeRotations::new();
    pairs.insert(ViewPair::new(0, 9), PairwiseRotation::new(Vector3::zeros()));
    let mut rotations: GlobalRotationMap =
        [(0, Vector3::zeros()), (1, Vector3::zeros())].iter().cloned().collect();
    let mut estimator = LagrangeDualRotationEstimator::new(2, 3, SdpSolverOptions::default());
    assert!(matches!(
        estimator.estimate_rotations(&pairs, &mut rotations),
        Err(Error::UnknownView(9))
    ));
}

#[test]
fn test_error_bound_complete_graph() {
    let mut pairs = RelativeRotations::new();
    for a in 0..4 {
        for b in a + 1..4 {
            pairs.insert(ViewPair::new(a, b), PairwiseRotation::new(Vector3::zeros()));
        }
    }
    let mut estimator = LagrangeDualRotationEstimator::new(4, 3, SdpSolverOptions::default());
    let bound = estimator.compute_error_bound(&pairs);
    // K4 has algebraic connectivity 4 and degree 3
    let expected = 2.0 * ((0.25f64 + 4.0 / 6.0).sqrt() - 0.5).asin();
    assert!((bound - expected).abs() < 1e-9);
    assert_eq!(estimator.error_bound(), bound);
}

#[test]
fn test_error_bound_disconnected_graph() {
    let mut pairs = RelativeRotations::new();
    pairs.insert(ViewPair::new(0, 1), PairwiseRotation::new(Vector3::zeros()));
    pairs.insert(ViewPair::new(2, 3), PairwiseRotation::new(Vector3::zeros()));
    let mut estimator = LagrangeDualRotationEstimator::new(4, 3, SdpSolverOptions::default());
    assert!(estimator.compute_error_bound(&pairs).abs() < 1e-9);
}
