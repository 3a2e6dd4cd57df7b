//! Robust refinement of global rotations by iteratively reweighted least squares.
//!
//! Each iteration weights every edge by `σ / (e² + σ²)²`, where `e` is the norm of its
//! residual, solves the weighted normal equations `J^T W J δ = J^T W r` for the tangent step
//! and applies it to the rotations. Edges whose residual is large compared to `σ` have almost no
//! say in the step. The Jacobian never changes during a solve, so the sparse Cholesky pattern is
//! analyzed once and only the numeric factorization is redone per iteration.

use log::{debug, error, info};
use nalgebra::DVector;
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::sparse::{SparseCholeskyLlt, SparseMatrix};
use crate::tangent_space::{
    average_step_size, compute_residuals, setup_linear_system, sorted_edges,
    update_global_rotations,
};
use crate::viewgraph::{view_id_to_ascent_index, GlobalRotationMap, RelativeRotations, ViewId};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct IrlsRefinerOptions {
    pub max_num_irls_iterations: usize,
    /// Residual scale in radians beyond which edges are treated as outliers.
    pub irls_loss_parameter_sigma: f64,
    /// Stop once the mean norm of the per-view steps drops below this.
    pub irls_step_convergence_threshold: f64,
    /// Threads used for computing the edge weights.
    pub num_threads: usize,
}

impl Default for IrlsRefinerOptions {
    fn default() -> Self {
        IrlsRefinerOptions {
            max_num_irls_iterations: 100,
            irls_loss_parameter_sigma: 5f64.to_radians(),
            irls_step_convergence_threshold: 1e-3,
            num_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrlsSummary {
    pub num_iterations: usize,
    pub converged: bool,
    /// Squared norm of the stacked edge residuals after the last step.
    pub final_squared_residual: f64,
    pub elapsed: Duration,
}

/// `σ / (e² + σ²)²` for every residual block of three, repeated for each of its rows.
fn huber_like_weights(pool: &rayon::ThreadPool, residual: &DVector<f64>, sigma: f64) -> DVector<f64> {
    let weights: Vec<f64> = pool.install(|| {
        residual
            .as_slice()
            .par_chunks(3)
            .flat_map_iter(|e| {
                let tmp = e.iter().map(|v| v * v).sum::<f64>() + sigma * sigma;
                std::iter::repeat(sigma / (tmp * tmp)).take(3)
            })
            .collect()
    });
    DVector::from_vec(weights)
}

pub struct IrlsRotationLocalRefiner {
    options: IrlsRefinerOptions,
    view_id_to_index: HashMap<ViewId, usize>,
    sparse_matrix: Option<SparseMatrix>,
    tangent_space_step: DVector<f64>,
    tangent_space_residual: DVector<f64>,
}

impl IrlsRotationLocalRefiner {
    /// One rotation is held constant, so the step has `3 * (num_views - 1)` entries.
    pub fn new(num_views: usize, num_edges: usize, options: IrlsRefinerOptions) -> Self {
        IrlsRotationLocalRefiner {
            options,
            view_id_to_index: HashMap::new(),
            sparse_matrix: None,
            tangent_space_step: DVector::zeros(3 * num_views.saturating_sub(1)),
            tangent_space_residual: DVector::zeros(3 * num_edges),
        }
    }

    pub fn set_view_id_to_index(&mut self, view_id_to_index: HashMap<ViewId, usize>) {
        self.view_id_to_index = view_id_to_index;
    }

    /// Provide the Jacobian instead of building it from the relative rotations. Its rows must
    /// follow the ascending pair order of the edges.
    pub fn set_sparse_matrix(&mut self, sparse_matrix: SparseMatrix) {
        self.sparse_matrix = Some(sparse_matrix);
    }

    /// Step reported by [Self::tangent_space_step] until the first iteration replaces it, such
    /// as the last step of a preceding L1 refinement. A step whose length does not match the
    /// problem is reset to zeros by [Self::solve_irls].
    pub fn set_init_tangent_space_step(&mut self, step: DVector<f64>) {
        self.tangent_space_step = step;
    }

    pub fn tangent_space_step(&self) -> &DVector<f64> {
        &self.tangent_space_step
    }

    pub fn tangent_space_residual(&self) -> &DVector<f64> {
        &self.tangent_space_residual
    }

    pub fn options(&self) -> &IrlsRefinerOptions {
        &self.options
    }

    /// Refine `rotations` in place. Every view in `rotations` must appear in the view index and
    /// every view of `pairs` in `rotations`. Running out of iterations is reported in the
    /// summary; a failed factorization or solve is an error and leaves `rotations` partially
    /// updated.
    pub fn solve_irls(
        &mut self,
        pairs: &RelativeRotations,
        rotations: &mut GlobalRotationMap,
    ) -> Result<IrlsSummary> {
        if pairs.is_empty() || rotations.is_empty() {
            error!(
                "IRLS needs at least one relative rotation and one view, got {} and {}",
                pairs.len(),
                rotations.len()
            );
            return Err(Error::EmptyProblem("IRLS without edges or views".into()));
        }
        let start = Instant::now();

        if self.view_id_to_index.is_empty() {
            self.view_id_to_index = view_id_to_ascent_index(rotations.keys());
        }
        let edges = sorted_edges(pairs);
        let jacobian = match self.sparse_matrix.take() {
            Some(jacobian) => jacobian,
            None => setup_linear_system(&edges, rotations.len(), &self.view_id_to_index)?,
        };
        if jacobian.nrows() != 3 * edges.len() {
            return Err(Error::InvalidMatrix(format!(
                "Jacobian has {} rows for {} edges",
                jacobian.nrows(),
                edges.len()
            )));
        }
        let jacobian = self.sparse_matrix.insert(jacobian);
        if self.tangent_space_step.len() != jacobian.ncols() {
            self.tangent_space_step = DVector::zeros(jacobian.ncols());
        }

        if jacobian.ncols() == 0 {
            // only the gauge view, nothing to refine
            return Ok(IrlsSummary {
                converged: true,
                elapsed: start.elapsed(),
                ..Default::default()
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.num_threads.max(1))
            .build()?;

        let mut linear_solver = SparseCholeskyLlt::new();
        if let Err(e) = linear_solver.analyze_pattern(&jacobian.weighted_gram(None)?) {
            error!("Cholesky decomposition failed: {}", e);
            return Err(e);
        }

        compute_residuals(&edges, rotations, &mut self.tangent_space_residual)?;

        debug!("{:>12}{:>16}{:>16}", "Iter", "SqError", "Delta");
        let sigma = self.options.irls_loss_parameter_sigma;
        let mut summary = IrlsSummary::default();
        for iteration in 0..self.options.max_num_irls_iterations {
            let weights = huber_like_weights(&pool, &self.tangent_space_residual, sigma);

            if let Err(e) = linear_solver.factorize(&jacobian.weighted_gram(Some(&weights))?) {
                error!("Failed to factorize the least squares system: {}", e);
                return Err(e);
            }
            let rhs = jacobian.transpose_mul_vec(&weights.component_mul(&self.tangent_space_residual));
            self.tangent_space_step = match linear_solver.solve(&rhs) {
                Ok(step) => step,
                Err(e) => {
                    error!("Failed to solve the least squares system: {}", e);
                    return Err(e);
                }
            };

            update_global_rotations(&self.tangent_space_step, &self.view_id_to_index, rotations)?;
            compute_residuals(&edges, rotations, &mut self.tangent_space_residual)?;
            let avg_step_size = average_step_size(&self.tangent_space_step);

            summary.num_iterations = iteration + 1;
            summary.final_squared_residual = self.tangent_space_residual.norm_squared();
            debug!(
                "{:>12}{:>16.6e}{:>16.6e}",
                iteration, summary.final_squared_residual, avg_step_size
            );

            if avg_step_size < self.options.irls_step_convergence_threshold {
                summary.converged = true;
                break;
            }
        }
        summary.elapsed = start.elapsed();

        if summary.converged {
            info!("IRLS converged in {} iterations", summary.num_iterations);
        } else {
            info!(
                "IRLS stopped after {} iterations without converging",
                summary.num_iterations
            );
        }
        info!(
            "Total time [IRLS]: {:.3} ms",
            summary.elapsed.as_secs_f64() * 1000.0
        );
        Ok(summary)
    }
}

#[cfg(test)]
use crate::rotation::angular_distance;
#[cfg(test)]
use crate::synthetic::{
    perturb_rotation, random_rotation, rotation_errors, synthetic_view_graph,
    SyntheticOptions,
};
#[cfg(test)]
use crate::viewgraph::{PairwiseRotation, ViewGraph};
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
fn perturbed(truth: &GlobalRotationMap, rng: &mut StdRng, std: f64) -> GlobalRotationMap {
    let mut ids = truth.keys().copied().collect::<Vec<_>>();
    ids.sort();
    ids.into_iter()
        .map(|id| (id, perturb_rotation(rng, &truth[&id], std)))
        .collect()
}

#[cfg(test)]
fn refine(
    graph: &ViewGraph,
    init: &GlobalRotationMap,
    options: IrlsRefinerOptions,
) -> (GlobalRotationMap, IrlsSummary) {
    let mut rotations = init.clone();
    let mut refiner =
        IrlsRotationLocalRefiner::new(rotations.len(), graph.num_edges(), options);
    let summary = refiner.solve_irls(graph.edges(), &mut rotations).unwrap();
    (rotations, summary)
}

#[test]
fn test_consistent_graph_converges() {
    let mut rng = StdRng::seed_from_u64(21);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 20,
            edge_probability: 0.3,
            ..Default::default()
        },
    );
    let init = perturbed(&problem.ground_truth, &mut rng, 5f64.to_radians());
    let options = IrlsRefinerOptions {
        irls_step_convergence_threshold: 1e-8,
        ..Default::default()
    };
    let (rotations, summary) = refine(&problem.view_graph, &init, options);
    assert!(summary.converged);
    assert!(summary.num_iterations < 30);
    assert!(summary.final_squared_residual < 1e-12);
    let errors = rotation_errors(&rotations, &problem.ground_truth);
    assert!(errors.values().all(|&e| e < 1e-5), "{:?}", errors);
}

#[test]
fn test_single_outlier_has_little_influence() {
    let mut rng = StdRng::seed_from_u64(8);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 20,
            edge_probability: 0.4,
            ..Default::default()
        },
    );
    let init = perturbed(&problem.ground_truth, &mut rng, 3f64.to_radians());

    // corrupt one edge that is not part of the spanning chain
    let mut corrupted = problem.view_graph.clone();
    let pair = *corrupted
        .edges()
        .keys()
        .filter(|p| p.second != p.first + 1)
        .min()
        .unwrap();
    corrupted.add_edge(
        pair.first,
        pair.second,
        PairwiseRotation::new(random_rotation(&mut rng)),
    );

    let options = IrlsRefinerOptions {
        irls_step_convergence_threshold: 1e-6,
        ..Default::default()
    };
    let (clean, _) = refine(&problem.view_graph, &init, options.clone());
    let (robust, _) = refine(&corrupted, &init, options);
    for (id, r) in clean.iter() {
        assert!(
            angular_distance(r, &robust[id]) < 0.5f64.to_radians(),
            "view {} moved by {}",
            id,
            angular_distance(r, &robust[id])
        );
    }
}

#[test]
fn test_thread_count_does_not_change_result() {
    let mut rng = StdRng::seed_from_u64(2);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 15,
            edge_probability: 0.4,
            noise_std: 1f64.to_radians(),
            ..Default::default()
        },
    );
    let init = perturbed(&problem.ground_truth, &mut rng, 2f64.to_radians());
    let (single, _) = refine(&problem.view_graph, &init, IrlsRefinerOptions::default());
    let (multi, _) = refine(
        &problem.view_graph,
        &init,
        IrlsRefinerOptions {
            num_threads: 4,
            ..Default::default()
        },
    );
    for (id, r) in single.iter() {
        assert!((r - multi[id]).norm() < 1e-12);
    }
}

#[test]
fn test_empty_problem_is_rejected() {
    let mut refiner = IrlsRotationLocalRefiner::new(0, 0, IrlsRefinerOptions::default());
    let mut rotations = GlobalRotationMap::new();
    assert!(refiner
        .solve_irls(&RelativeRotations::new(), &mut rotations)
        .is_err());
}

#[test]
fn test_weights_decrease_with_residual() {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .build()
        .unwrap();
    let residual = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.1, 0.0, 0.0, 1.0, 1.0, 1.0]);
    let w = huber_like_weights(&pool, &residual, 0.1);
    assert_eq!(w.len(), 9);
    assert_eq!(w[0], w[2]);
    assert!((w[0] - 1000.0).abs() < 1e-9);
    assert!(w[3] < w[0] && w[6] < w[3]);
}

#[test]
fn test_view_without_edges_fails_factorization() {
    use nalgebra::Vector3;
    let mut pairs = RelativeRotations::new();
    pairs.insert(
        crate::viewgraph::ViewPair::new(0, 1),
        PairwiseRotation::new(Vector3::new(0.0, 0.2, 0.0)),
    );
    // view 2 has no column entries, so J^T W J is singular
    let mut rotations: GlobalRotationMap = (0..3).map(|id| (id, Vector3::zeros())).collect();
    let mut refiner = IrlsRotationLocalRefiner::new(3, 1, IrlsRefinerOptions::default());
    assert!(matches!(
        refiner.solve_irls(&pairs, &mut rotations),
        Err(Error::Factorization(_))
    ));
}

#[test]
fn test_initial_step_is_kept_without_iterations() {
    let mut rng = StdRng::seed_from_u64(4);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 6,
            edge_probability: 0.5,
            ..Default::default()
        },
    );
    let init = perturbed(&problem.ground_truth, &mut rng, 2f64.to_radians());
    let options = IrlsRefinerOptions {
        max_num_irls_iterations: 0,
        ..Default::default()
    };
    let step = DVector::from_fn(15, |i, _| 0.01 * i as f64);
    let mut refiner = IrlsRotationLocalRefiner::new(6, problem.view_graph.num_edges(), options);
    refiner.set_init_tangent_space_step(step.clone());
    let mut rotations = init.clone();
    let summary = refiner
        .solve_irls(problem.view_graph.edges(), &mut rotations)
        .unwrap();
    assert_eq!(summary.num_iterations, 0);
    assert_eq!(refiner.tangent_space_step(), &step);
    assert_eq!(rotations, init);

    // a step of the wrong size is replaced
    refiner.set_init_tangent_space_step(DVector::zeros(4));
    refiner
        .solve_irls(problem.view_graph.edges(), &mut rotations)
        .unwrap();
    assert_eq!(refiner.tangent_space_step(), &DVector::<f64>::zeros(15));
}
