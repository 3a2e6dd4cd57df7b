//! Riemannian staircase: rank restricted minimization at increasing ranks.
//!
//! Starting from rank `dim + 1`, the factored problem is solved and the solution is checked
//! against the dual certificate. If the certificate has a negative eigenvalue the solution is a
//! saddle of the relaxation; the factor gains one row along the offending eigenvector and the
//! next rank is solved from there.

use log::{info, warn};
use nalgebra::DMatrix;
use std::time::Instant;

use super::rank_restricted::block_coordinate_descent;
use super::{
    certificate_min_eigen, certificate_scale, check_problem, project_to_stiefel, random_stiefel_blocks,
    BlockSparseMatrix, SdpSolver, SdpSolverOptions, SdpSummary,
};
use crate::Result;

/// Step length along the escape direction when the rank is raised.
const ESCAPE_STEP: f64 = 0.1;

/// Factor applied to the stopping tolerance when a solution narrowly fails the certificate.
const POLISH_FACTOR: f64 = 1e-3;

pub struct RiemannianStaircase {
    n: usize,
    dim: usize,
    options: SdpSolverOptions,
}

impl RiemannianStaircase {
    pub fn new(n: usize, dim: usize, options: SdpSolverOptions) -> Self {
        RiemannianStaircase { n, dim, options }
    }

    /// Append the row `step * v^T` to `x` and project every block back onto the Stiefel
    /// manifold.
    fn lift(&self, x: &DMatrix<f64>, direction: &nalgebra::DVector<f64>) -> DMatrix<f64> {
        let d = self.dim;
        let rank = x.nrows();
        let mut lifted = DMatrix::zeros(rank + 1, x.ncols());
        lifted.rows_mut(0, rank).copy_from(x);
        lifted
            .row_mut(rank)
            .copy_from(&(direction.transpose() * ESCAPE_STEP));
        for i in 0..self.n {
            let block = project_to_stiefel(&lifted.columns(i * d, d).clone_owned());
            lifted.columns_mut(i * d, d).copy_from(&block);
        }
        lifted
    }
}

impl SdpSolver for RiemannianStaircase {
    fn solve(
        &mut self,
        covariance: &BlockSparseMatrix,
        adjacency: &[Vec<usize>],
    ) -> Result<(DMatrix<f64>, SdpSummary)> {
        check_problem(self.n, self.dim, covariance, adjacency)?;
        let start = Instant::now();
        let max_rank = self.options.max_rank.max(self.dim + 1);
        let mut x = random_stiefel_blocks(self.dim + 1, self.n, self.dim, self.options.seed);
        let mut total_iterations = 0;
        let certificate_tolerance =
            self.options.certificate_tolerance * certificate_scale(covariance, adjacency);

        let (y, objective, certified) = loop {
            let (mut iterations, mut objective) = block_coordinate_descent(
                covariance,
                adjacency,
                &mut x,
                self.options.max_iterations,
                self.options.tolerance,
            )?;
            let mut y = x.transpose() * &x;
            let mut certificate = certificate_min_eigen(covariance, adjacency, &y);
            if matches!(certificate, Some((lambda_min, _)) if lambda_min < -certificate_tolerance)
            {
                // converge further at this rank before raising it
                let (more, polished) = block_coordinate_descent(
                    covariance,
                    adjacency,
                    &mut x,
                    self.options.max_iterations,
                    (self.options.tolerance * POLISH_FACTOR).max(f64::EPSILON),
                )?;
                iterations += more;
                objective = polished;
                y = x.transpose() * &x;
                certificate = certificate_min_eigen(covariance, adjacency, &y);
            }
            total_iterations += iterations;

            let Some((lambda_min, direction)) = certificate else {
                warn!(
                    "eigensolver did not converge while checking rank {} solution",
                    x.nrows()
                );
                break (y, objective, false);
            };
            info!(
                "staircase rank {}: {} iterations, objective {:.6e}, min certificate eigenvalue {:.3e}",
                x.nrows(),
                iterations,
                objective,
                lambda_min
            );
            if lambda_min >= -certificate_tolerance {
                break (y, objective, true);
            }
            if x.nrows() >= max_rank {
                warn!(
                    "reached maximum rank {} without a certificate of optimality",
                    max_rank
                );
                break (y, objective, false);
            }
            x = self.lift(&x, &direction);
        };

        let summary = SdpSummary {
            total_iterations_num: total_iterations,
            elapsed: start.elapsed(),
            objective,
            final_rank: x.nrows(),
            certified: Some(certified),
        };
        info!(
            "Riemannian staircase finished at rank {} after {} iterations in {:.3} ms",
            summary.final_rank,
            summary.total_iterations_num,
            summary.total_time_ms()
        );
        Ok((y, summary))
    }
}

#[cfg(test)]
use super::{consistent_problem, max_recovery_error};

#[test]
fn test_certifies_consistent_problem() {
    let (c, adjacency, truth) = consistent_problem(10, 6);
    let options = SdpSolverOptions {
        tolerance: 1e-15,
        ..Default::default()
    };
    let mut solver = RiemannianStaircase::new(10, 3, options);
    let (y, summary) = solver.solve(&c, &adjacency).unwrap();
    assert_eq!(summary.certified, Some(true));
    assert!(summary.final_rank >= 4 && summary.final_rank <= 10);
    assert!(max_recovery_error(&y, &truth) < 1e-3);
}

#[test]
fn test_lift_keeps_blocks_orthonormal() {
    let solver = RiemannianStaircase::new(3, 3, SdpSolverOptions::default());
    let x = random_stiefel_blocks(4, 3, 3, 1);
    let direction = nalgebra::DVector::from_fn(9, |i, _| (i as f64).sin());
    let lifted = solver.lift(&x, &direction);
    assert_eq!(lifted.shape(), (5, 9));
    for i in 0..3 {
        let block = lifted.columns(3 * i, 3);
        let gram = block.transpose() * block;
        assert!((gram - DMatrix::identity(3, 3)).norm() < 1e-10);
    }
}

#[test]
fn test_certifies_noisy_problem_with_outliers() {
    use super::RbrSdpSolver;
    use crate::lagrange_dual::LagrangeDualRotationEstimator;
    use crate::synthetic::{synthetic_view_graph, SyntheticOptions};
    use crate::viewgraph::view_id_to_ascent_index;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    for seed in [1, 5] {
        let problem = synthetic_view_graph(
            &mut StdRng::seed_from_u64(seed),
            &SyntheticOptions {
                num_views: 25,
                edge_probability: 0.3,
                noise_std: 10f64.to_radians(),
                outlier_ratio: 0.4,
            },
        );
        let mut estimator = LagrangeDualRotationEstimator::new(25, 3, SdpSolverOptions::default());
        estimator.set_view_id_to_index(view_id_to_ascent_index(problem.ground_truth.keys()));
        let (w, adjacency) = estimator
            .fill_in_relative_graph(problem.view_graph.edges())
            .unwrap();
        let c = -&w;

        let mut staircase = RiemannianStaircase::new(25, 3, SdpSolverOptions::default());
        let (_, summary) = staircase.solve(&c, &adjacency).unwrap();
        let mut rbr = RbrSdpSolver::new(25, 3, SdpSolverOptions::default());
        let (_, reference) = rbr.solve(&c, &adjacency).unwrap();

        assert_eq!(summary.certified, Some(true), "seed {}", seed);
        assert!(
            (summary.objective - reference.objective).abs() <= 1e-6 * reference.objective.abs(),
            "seed {}: {} vs {}",
            seed,
            summary.objective,
            reference.objective
        );
    }
}
