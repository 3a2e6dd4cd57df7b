//! Robust global refinement of rotations with L1 steps in the tangent space.
//!
//! Each outer iteration solves `min ||J δ - r||_1` for the tangent step `δ` with the ADMM solver
//! and applies it. Since outliers only enter through the L1 norm, a few cheap iterations remove
//! most of their influence before the least squares refinement. The ADMM budget doubles with
//! every outer iteration as the steps get smaller.

use log::{debug, error, info};
use nalgebra::DVector;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::l1_solver::{L1Solver, L1SolverOptions};
use crate::tangent_space::{
    average_step_size, compute_residuals, setup_linear_system, sorted_edges,
    update_global_rotations,
};
use crate::viewgraph::{view_id_to_ascent_index, GlobalRotationMap, RelativeRotations, ViewId};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct L1RotationOptions {
    pub max_num_l1_iterations: usize,
    /// Stop once the mean norm of the per-view steps drops below this.
    pub l1_step_convergence_threshold: f64,
    /// ADMM iterations of the first outer iteration.
    pub initial_admm_iterations: usize,
}

impl Default for L1RotationOptions {
    fn default() -> Self {
        L1RotationOptions {
            max_num_l1_iterations: 5,
            l1_step_convergence_threshold: 1e-3,
            initial_admm_iterations: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct L1RotationSummary {
    pub num_iterations: usize,
    pub converged: bool,
    /// ADMM iterations summed over all outer iterations.
    pub admm_iterations: usize,
    pub elapsed: Duration,
}

pub struct L1RotationGlobalRefiner {
    options: L1RotationOptions,
    view_id_to_index: HashMap<ViewId, usize>,
    tangent_space_step: DVector<f64>,
    tangent_space_residual: DVector<f64>,
}

impl L1RotationGlobalRefiner {
    pub fn new(num_views: usize, num_edges: usize, options: L1RotationOptions) -> Self {
        L1RotationGlobalRefiner {
            options,
            view_id_to_index: HashMap::new(),
            tangent_space_step: DVector::zeros(3 * num_views.saturating_sub(1)),
            tangent_space_residual: DVector::zeros(3 * num_edges),
        }
    }

    pub fn set_view_id_to_index(&mut self, view_id_to_index: HashMap<ViewId, usize>) {
        self.view_id_to_index = view_id_to_index;
    }

    pub fn tangent_space_step(&self) -> &DVector<f64> {
        &self.tangent_space_step
    }

    /// Refine `rotations` in place, keeping the view with index 0 fixed.
    pub fn solve(
        &mut self,
        pairs: &RelativeRotations,
        rotations: &mut GlobalRotationMap,
    ) -> Result<L1RotationSummary> {
        if pairs.is_empty() || rotations.is_empty() {
            return Err(Error::EmptyProblem(
                "L1 refinement without edges or views".into(),
            ));
        }
        let start = Instant::now();
        if self.view_id_to_index.is_empty() {
            self.view_id_to_index = view_id_to_ascent_index(rotations.keys());
        }
        let edges = sorted_edges(pairs);
        let jacobian = setup_linear_system(&edges, rotations.len(), &self.view_id_to_index)?;
        let mut summary = L1RotationSummary::default();
        if jacobian.ncols() == 0 {
            summary.converged = true;
            return Ok(summary);
        }

        let solver_options = L1SolverOptions {
            max_num_iterations: self.options.initial_admm_iterations,
            ..Default::default()
        };
        let mut solver = L1Solver::new(solver_options, jacobian)?;

        for iteration in 0..self.options.max_num_l1_iterations {
            compute_residuals(&edges, rotations, &mut self.tangent_space_residual)?;
            self.tangent_space_step = DVector::zeros(3 * (rotations.len() - 1));
            let admm = match solver.solve(&self.tangent_space_residual, &mut self.tangent_space_step)
            {
                Ok(admm) => admm,
                Err(e) => {
                    error!("L1 rotation refinement failed: {}", e);
                    return Err(e);
                }
            };
            update_global_rotations(&self.tangent_space_step, &self.view_id_to_index, rotations)?;

            let avg_step_size = average_step_size(&self.tangent_space_step);
            summary.num_iterations = iteration + 1;
            summary.admm_iterations += admm.num_iterations;
            debug!(
                "L1 iteration {}: {} ADMM iterations, average step {:.6e}",
                iteration, admm.num_iterations, avg_step_size
            );
            if avg_step_size <= self.options.l1_step_convergence_threshold {
                summary.converged = true;
                break;
            }
            let budget = solver.options().max_num_iterations * 2;
            solver.set_max_iterations(budget);
        }
        summary.elapsed = start.elapsed();
        info!(
            "L1 rotation refinement: {} iterations ({} ADMM) in {:.3} ms",
            summary.num_iterations,
            summary.admm_iterations,
            summary.elapsed.as_secs_f64() * 1000.0
        );
        Ok(summary)
    }
}

#[cfg(test)]
use crate::synthetic::{
    perturb_rotation, rotation_errors, synthetic_view_graph, SyntheticOptions,
};
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[cfg(test)]
fn mean(errors: &HashMap<ViewId, f64>) -> f64 {
    errors.values().sum::<f64>() / errors.len() as f64
}

#[test]
fn test_reduces_error_of_perturbed_rotations() {
    let mut rng = StdRng::seed_from_u64(12);
    let problem = synthetic_view_graph(
        &mut rng,
        &SyntheticOptions {
            num_views: 20,
            edge_probability: 0.4,
            outlier_ratio: 0.1,
            ..Default::default()
        },
    );
    let mut ids = problem.ground_truth.keys().copied().collect::<Vec<_>>();
    ids.sort();
    let mut rotations: GlobalRotationMap = ids
        .into_iter()
        .map(|id| {
            let r = perturb_rotation(&mut rng, &problem.ground_truth[&id], 10f64.to_radians());
            (id, r)
        })
        .collect();
    let before = mean(&rotation_errors(&rotations, &problem.ground_truth));

    let options = L1RotationOptions {
        max_num_l1_iterations: 10,
        ..Default::default()
    };
    let mut refiner = L1RotationGlobalRefiner::new(
        rotations.len(),
        problem.view_graph.num_edges(),
        options,
    );
    let summary = refiner
        .solve(problem.view_graph.edges(), &mut rotations)
        .unwrap();
    let after = mean(&rotation_errors(&rotations, &problem.ground_truth));
    assert!(summary.num_iterations > 0);
    assert!(after < 0.5 * before, "{} -> {}", before, after);
}

#[test]
fn test_empty_problem_is_rejected() {
    let mut refiner = L1RotationGlobalRefiner::new(2, 0, L1RotationOptions::default());
    let mut rotations = GlobalRotationMap::new();
    assert!(refiner
        .solve(&RelativeRotations::new(), &mut rotations)
        .is_err());
}
