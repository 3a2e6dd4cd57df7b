//! Block coordinate minimization over a low rank factorization `Y = X^T X`.
//!
//! Each block `X_i` is a `rank x dim` matrix with orthonormal columns, so `Y_ii = I` holds by
//! construction. Minimizing `tr(C X^T X)` over one block with the others fixed is a Procrustes
//! problem whose solution is the polar factor of `sum_j X_j W_ji` with `W = -C`.

use log::{debug, info};
use nalgebra::DMatrix;
use std::time::Instant;

use super::{
    check_problem, project_to_stiefel, random_stiefel_blocks, BlockSparseMatrix, SdpSolver,
    SdpSolverOptions, SdpSummary,
};
use crate::Result;

/// `tr(C X^T X)` over the stored blocks of `C`.
pub(crate) fn factored_objective(covariance: &BlockSparseMatrix, x: &DMatrix<f64>) -> f64 {
    let d = covariance.dim();
    covariance
        .iter()
        .map(|(&(i, j), c)| {
            (c * x.columns(j * d, d).transpose() * x.columns(i * d, d)).trace()
        })
        .sum()
}

/// Sweep over all blocks of `x` until the relative objective change drops below `tolerance`.
/// Returns the number of sweeps and the final objective.
pub(crate) fn block_coordinate_descent(
    covariance: &BlockSparseMatrix,
    adjacency: &[Vec<usize>],
    x: &mut DMatrix<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<(usize, f64)> {
    let d = covariance.dim();
    let mut previous = factored_objective(covariance, x);
    let mut iterations = 0;
    for iteration in 0..max_iterations {
        for (i, neighbors) in adjacency.iter().enumerate() {
            if neighbors.is_empty() {
                continue;
            }
            let mut g = DMatrix::zeros(x.nrows(), d);
            for &j in neighbors {
                let c_ji = covariance.expect_block(j, i)?;
                g -= x.columns(j * d, d) * c_ji;
            }
            let block = project_to_stiefel(&g);
            x.columns_mut(i * d, d).copy_from(&block);
        }
        iterations = iteration + 1;

        let current = factored_objective(covariance, x);
        let change = (previous - current).abs() / current.abs().max(f64::MIN_POSITIVE);
        debug!(
            "rank {} {:>8}{:>20.10e}{:>16.6e}",
            x.nrows(),
            iteration,
            current,
            change
        );
        previous = current;
        if change < tolerance {
            break;
        }
    }
    Ok((iterations, previous))
}

pub struct RankRestrictedSdpSolver {
    n: usize,
    dim: usize,
    options: SdpSolverOptions,
}

impl RankRestrictedSdpSolver {
    pub fn new(n: usize, dim: usize, options: SdpSolverOptions) -> Self {
        RankRestrictedSdpSolver { n, dim, options }
    }

    /// Rank of the factorization. Never smaller than the block size.
    pub fn rank(&self) -> usize {
        self.options.rank.max(self.dim)
    }
}

impl SdpSolver for RankRestrictedSdpSolver {
    fn solve(
        &mut self,
        covariance: &BlockSparseMatrix,
        adjacency: &[Vec<usize>],
    ) -> Result<(DMatrix<f64>, SdpSummary)> {
        check_problem(self.n, self.dim, covariance, adjacency)?;
        let start = Instant::now();
        let rank = self.rank();
        let mut x = random_stiefel_blocks(rank, self.n, self.dim, self.options.seed);
        let (iterations, objective) = block_coordinate_descent(
            covariance,
            adjacency,
            &mut x,
            self.options.max_iterations,
            self.options.tolerance,
        )?;

        let summary = SdpSummary {
            total_iterations_num: iterations,
            elapsed: start.elapsed(),
            objective,
            final_rank: rank,
            certified: None,
        };
        info!(
            "Rank deficient BCM (rank {}) finished after {} iterations in {:.3} ms, objective {:.6e}",
            rank,
            summary.total_iterations_num,
            summary.total_time_ms(),
            summary.objective
        );
        Ok((x.transpose() * &x, summary))
    }
}

#[cfg(test)]
use super::{consistent_problem, max_recovery_error};

#[test]
fn test_recovers_consistent_rotations() {
    let (c, adjacency, truth) = consistent_problem(12, 4);
    let mut solver = RankRestrictedSdpSolver::new(12, 3, SdpSolverOptions::default());
    let (y, summary) = solver.solve(&c, &adjacency).unwrap();
    assert_eq!(summary.final_rank, 5);
    assert!(max_recovery_error(&y, &truth) < 1e-3);
    for i in 0..12 {
        let block = y.view((3 * i, 3 * i), (3, 3)).clone_owned();
        assert!((block - DMatrix::identity(3, 3)).norm() < 1e-9);
    }
}

#[test]
fn test_same_seed_same_solution() {
    let (c, adjacency, _) = consistent_problem(6, 9);
    let options = SdpSolverOptions {
        max_iterations: 5,
        seed: 42,
        ..Default::default()
    };
    let (y1, _) = RankRestrictedSdpSolver::new(6, 3, options.clone())
        .solve(&c, &adjacency)
        .unwrap();
    let (y2, _) = RankRestrictedSdpSolver::new(6, 3, options)
        .solve(&c, &adjacency)
        .unwrap();
    assert_eq!(y1, y2);
}

#[test]
fn test_rank_is_at_least_dim() {
    let options = SdpSolverOptions {
        rank: 2,
        ..Default::default()
    };
    assert_eq!(RankRestrictedSdpSolver::new(4, 3, options).rank(), 3);
}
