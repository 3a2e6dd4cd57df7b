//! Block-coordinate solvers for the semidefinite relaxation of rotation synchronization.
//!
//! Every solver minimizes `tr(C Y)` subject to `Y_ii = I` for all diagonal blocks and `Y ⪰ 0`,
//! where `C` is a symmetric block-sparse cost matrix. The strategy is picked with
//! [SdpSolverType] and built with [create_sdp_solver].

use log::warn;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub mod rank_restricted;
pub mod rbr;
pub mod staircase;

pub use rank_restricted::RankRestrictedSdpSolver;
pub use rbr::RbrSdpSolver;
pub use staircase::RiemannianStaircase;

const MAX_EIGEN_ITERATIONS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpSolverType {
    /// Row-by-row block coordinate minimization on the full matrix `Y`.
    RbrBcm,
    /// Block coordinate minimization on a fixed rank factorization `Y = X^T X`.
    RankDeficientBcm,
    /// Rank restricted minimization with the rank raised until optimality is certified.
    RiemannianStaircase,
}

impl Default for SdpSolverType {
    fn default() -> Self {
        SdpSolverType::RbrBcm
    }
}

impl FromStr for SdpSolverType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "rbr-bcm" => Ok(SdpSolverType::RbrBcm),
            "rank-deficient-bcm" => Ok(SdpSolverType::RankDeficientBcm),
            "riemannian-staircase" => Ok(SdpSolverType::RiemannianStaircase),
            _ => {
                warn!("SDP solver type `{}` is not supported", s);
                Err(Error::UnsupportedSolver(s.to_string()))
            }
        }
    }
}

impl fmt::Display for SdpSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdpSolverType::RbrBcm => "rbr-bcm",
            SdpSolverType::RankDeficientBcm => "rank-deficient-bcm",
            SdpSolverType::RiemannianStaircase => "riemannian-staircase",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct SdpSolverOptions {
    pub solver_type: SdpSolverType,
    /// Maximum number of sweeps over all blocks. The staircase applies it per rank.
    pub max_iterations: usize,
    /// Stop when the relative change of the objective over one sweep falls below this.
    pub tolerance: f64,
    /// Rank of the factorization used by [SdpSolverType::RankDeficientBcm].
    pub rank: usize,
    /// Highest rank the staircase may climb to.
    pub max_rank: usize,
    /// Smallest eigenvalue of the dual certificate still accepted as positive semidefinite,
    /// relative to the largest cost entry times the largest view degree.
    pub certificate_tolerance: f64,
    /// Seed for the random initialization of the rank restricted solvers.
    pub seed: u64,
}

impl Default for SdpSolverOptions {
    fn default() -> Self {
        SdpSolverOptions {
            solver_type: SdpSolverType::default(),
            max_iterations: 1000,
            tolerance: 1e-10,
            rank: 5,
            max_rank: 10,
            certificate_tolerance: 1e-6,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpSummary {
    pub total_iterations_num: usize,
    pub elapsed: Duration,
    /// `tr(C Y)` at the returned solution.
    pub objective: f64,
    /// Number of rows of the factor `X` in `Y = X^T X`, or the size of `Y` when it is not
    /// factored.
    pub final_rank: usize,
    /// Outcome of the dual optimality check, if the solver performed one.
    pub certified: Option<bool>,
}

impl SdpSummary {
    pub fn total_time_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Symmetric matrix made of `num_blocks x num_blocks` square blocks of size `dim`, only some of
/// which are stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSparseMatrix {
    num_blocks: usize,
    dim: usize,
    blocks: HashMap<(usize, usize), DMatrix<f64>>,
}

impl BlockSparseMatrix {
    pub fn new(num_blocks: usize, dim: usize) -> Self {
        BlockSparseMatrix {
            num_blocks,
            dim,
            blocks: HashMap::new(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Store block `(row, col)`, replacing what was there.
    pub fn insert(&mut self, row: usize, col: usize, block: DMatrix<f64>) {
        assert!(row < self.num_blocks && col < self.num_blocks);
        assert_eq!(block.shape(), (self.dim, self.dim));
        self.blocks.insert((row, col), block);
    }

    pub fn block(&self, row: usize, col: usize) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(row, col))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(usize, usize), &DMatrix<f64>)> {
        self.blocks.iter()
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let d = self.dim;
        let mut m = DMatrix::zeros(self.num_blocks * d, self.num_blocks * d);
        for (&(row, col), block) in self.blocks.iter() {
            m.view_mut((row * d, col * d), (d, d)).copy_from(block);
        }
        m
    }

    /// Block `(row, col)`, or an error if the adjacency refers to a block that is not stored.
    pub(crate) fn expect_block(&self, row: usize, col: usize) -> Result<&DMatrix<f64>> {
        self.block(row, col).ok_or_else(|| {
            Error::InvalidMatrix(format!("missing block ({}, {}) of cost matrix", row, col))
        })
    }
}

impl std::ops::Neg for &BlockSparseMatrix {
    type Output = BlockSparseMatrix;

    fn neg(self) -> BlockSparseMatrix {
        BlockSparseMatrix {
            num_blocks: self.num_blocks,
            dim: self.dim,
            blocks: self.blocks.iter().map(|(k, b)| (*k, -b)).collect(),
        }
    }
}

/// Interchangeable strategy for `min tr(C Y)  s.t.  Y_ii = I, Y ⪰ 0`.
///
/// `adjacency[i]` lists the block columns `j` for which `C_ij` is stored. The solver returns
/// the dense `Y`.
pub trait SdpSolver: Send {
    fn solve(
        &mut self,
        covariance: &BlockSparseMatrix,
        adjacency: &[Vec<usize>],
    ) -> Result<(DMatrix<f64>, SdpSummary)>;
}

/// Build the solver selected by `options.solver_type` for `n` blocks of size `dim`.
pub fn create_sdp_solver(n: usize, dim: usize, options: &SdpSolverOptions) -> Box<dyn SdpSolver> {
    match options.solver_type {
        SdpSolverType::RbrBcm => Box::new(RbrSdpSolver::new(n, dim, options.clone())),
        SdpSolverType::RankDeficientBcm => {
            Box::new(RankRestrictedSdpSolver::new(n, dim, options.clone()))
        }
        SdpSolverType::RiemannianStaircase => {
            Box::new(RiemannianStaircase::new(n, dim, options.clone()))
        }
    }
}

fn check_problem(
    n: usize,
    dim: usize,
    covariance: &BlockSparseMatrix,
    adjacency: &[Vec<usize>],
) -> Result<()> {
    if n == 0 {
        return Err(Error::EmptyProblem("SDP with zero blocks".into()));
    }
    if covariance.num_blocks() != n || covariance.dim() != dim || adjacency.len() != n {
        return Err(Error::InvalidMatrix(format!(
            "expected {} blocks of size {}, got a {}x{} block matrix with {} adjacency lists",
            n,
            dim,
            covariance.num_blocks(),
            covariance.dim(),
            adjacency.len()
        )));
    }
    Ok(())
}

/// `tr(C Y)` over the stored blocks of `C`.
pub(crate) fn objective(covariance: &BlockSparseMatrix, y: &DMatrix<f64>) -> f64 {
    let d = covariance.dim();
    covariance
        .iter()
        .map(|(&(i, j), c)| (c * y.view((j * d, i * d), (d, d))).trace())
        .sum()
}

/// `m^{-1/2}` for a symmetric positive semidefinite `m`. Directions with vanishing eigenvalues
/// are dropped.
pub(crate) fn inverse_sqrt_psd(m: &DMatrix<f64>) -> DMatrix<f64> {
    let eig = m.clone().symmetric_eigen();
    let largest = eig.eigenvalues.iter().cloned().fold(0.0, f64::max);
    let threshold = (largest * 1e-12).max(f64::MIN_POSITIVE);
    let scale = eig
        .eigenvalues
        .map(|l| if l > threshold { 1.0 / l.sqrt() } else { 0.0 });
    &eig.eigenvectors * DMatrix::from_diagonal(&scale) * eig.eigenvectors.transpose()
}

/// Closest matrix with orthonormal columns (polar factor `U V^T`).
pub(crate) fn project_to_stiefel(g: &DMatrix<f64>) -> DMatrix<f64> {
    let svd = g.clone().svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => u * v_t,
        _ => g.clone(),
    }
}

/// `rank x (n * dim)` matrix of Gaussian blocks, each projected onto the Stiefel manifold.
pub(crate) fn random_stiefel_blocks(rank: usize, n: usize, dim: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = DMatrix::from_fn(rank, n * dim, |_, _| rng.sample::<f64, _>(StandardNormal));
    for i in 0..n {
        let block = project_to_stiefel(&x.columns(i * dim, dim).clone_owned());
        x.columns_mut(i * dim, dim).copy_from(&block);
    }
    x
}

/// Smallest eigenpair of the dual certificate `S = C - Λ`, where `Λ` is block diagonal with
/// `Λ_ii = sym((C Y)_ii)`. `Y` is optimal when `S ⪰ 0`. Returns `None` if the eigensolver does
/// not converge.
/// Magnitude of the dual certificate: the largest cost entry times the largest view degree.
/// Certificate tolerances are relative to it.
pub(crate) fn certificate_scale(
    covariance: &BlockSparseMatrix,
    adjacency: &[Vec<usize>],
) -> f64 {
    let max_entry = covariance
        .iter()
        .map(|(_, block)| block.amax())
        .fold(0.0, f64::max);
    let max_degree = adjacency.iter().map(|n| n.len()).max().unwrap_or(0);
    let scale = max_entry * max_degree as f64;
    if scale > 0.0 {
        scale
    } else {
        1.0
    }
}

pub(crate) fn certificate_min_eigen(
    covariance: &BlockSparseMatrix,
    adjacency: &[Vec<usize>],
    y: &DMatrix<f64>,
) -> Option<(f64, DVector<f64>)> {
    let d = covariance.dim();
    let mut s = covariance.to_dense();
    for (i, neighbors) in adjacency.iter().enumerate() {
        let mut lambda = DMatrix::zeros(d, d);
        for &j in neighbors {
            if let Some(c) = covariance.block(i, j) {
                lambda += c * y.view((j * d, i * d), (d, d));
            }
        }
        let lambda = (&lambda + lambda.transpose()) * 0.5;
        let mut diagonal = s.view_mut((i * d, i * d), (d, d));
        diagonal -= &lambda;
    }
    let eig = SymmetricEigen::try_new(s, f64::EPSILON, MAX_EIGEN_ITERATIONS)?;
    let index = eig.eigenvalues.imin();
    Some((
        eig.eigenvalues[index],
        eig.eigenvectors.column(index).clone_owned(),
    ))
}

/// Cost matrix `-W` and adjacency of a consistent synthetic problem, plus the ground truth.
#[cfg(test)]
pub(crate) fn consistent_problem(
    n: usize,
    seed: u64,
) -> (BlockSparseMatrix, Vec<Vec<usize>>, Vec<nalgebra::Matrix3<f64>>) {
    use nalgebra::{Rotation3, Vector3};
    let mut rng = StdRng::seed_from_u64(seed);
    let truth = (0..n)
        .map(|_| {
            let aa = Vector3::from_fn(|_, _| rng.gen_range(-1.5..1.5));
            Rotation3::from_scaled_axis(aa).into_inner()
        })
        .collect::<Vec<_>>();

    let mut w = BlockSparseMatrix::new(n, 3);
    let mut adjacency = vec![Vec::new(); n];
    for i in 0..n {
        for j in i + 1..n {
            if j != i + 1 && rng.gen::<f64>() > 0.5 {
                continue;
            }
            let r_ij = truth[j] * truth[i].transpose();
            w.insert(i, j, DMatrix::from_iterator(3, 3, r_ij.transpose().iter().cloned()));
            w.insert(j, i, DMatrix::from_iterator(3, 3, r_ij.iter().cloned()));
            adjacency[i].push(j);
            adjacency[j].push(i);
        }
    }
    (-&w, adjacency, truth)
}

/// Largest angle between `R_0^T R_i` of the truth and block `Y_0i^T` of the solution.
#[cfg(test)]
pub(crate) fn max_recovery_error(y: &DMatrix<f64>, truth: &[nalgebra::Matrix3<f64>]) -> f64 {
    use nalgebra::{Matrix3, Rotation3};
    truth
        .iter()
        .enumerate()
        .map(|(i, r_i)| {
            let block = y.view((0, 3 * i), (3, 3)).transpose();
            let estimate = Matrix3::from_iterator(block.iter().cloned());
            let expected = r_i * truth[0].transpose();
            Rotation3::from_matrix(&(estimate.transpose() * expected)).angle()
        })
        .fold(0.0, f64::max)
}

#[test]
fn test_solver_type_from_str() {
    assert_eq!(
        "rbr-bcm".parse::<SdpSolverType>().unwrap(),
        SdpSolverType::RbrBcm
    );
    assert_eq!(
        "RANK_DEFICIENT_BCM".parse::<SdpSolverType>().unwrap(),
        SdpSolverType::RankDeficientBcm
    );
    assert_eq!(
        "riemannian-staircase".parse::<SdpSolverType>().unwrap(),
        SdpSolverType::RiemannianStaircase
    );
    assert!(matches!(
        "interior-point".parse::<SdpSolverType>(),
        Err(Error::UnsupportedSolver(_))
    ));
    for t in [
        SdpSolverType::RbrBcm,
        SdpSolverType::RankDeficientBcm,
        SdpSolverType::RiemannianStaircase,
    ]
    .iter()
    {
        assert_eq!(t.to_string().parse::<SdpSolverType>().unwrap(), *t);
    }
}

#[test]
fn test_inverse_sqrt() {
    let m = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 9.0]);
    let s = inverse_sqrt_psd(&m);
    assert!((s[(0, 0)] - 0.5).abs() < 1e-12);
    assert!((s[(1, 1)] - 1.0 / 3.0).abs() < 1e-12);

    let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
    let s = inverse_sqrt_psd(&singular);
    assert!(s.iter().all(|v| v.is_finite()));
}

#[test]
fn test_certificate_of_consistent_solution() {
    let (c, adjacency, truth) = consistent_problem(6, 3);
    let mut y = DMatrix::zeros(18, 18);
    for i in 0..6 {
        for j in 0..6 {
            let block = truth[i] * truth[j].transpose();
            y.view_mut((3 * i, 3 * j), (3, 3))
                .copy_from(&DMatrix::from_iterator(3, 3, block.iter().cloned()));
        }
    }
    let (lambda_min, _) = certificate_min_eigen(&c, &adjacency, &y).unwrap();
    assert!(lambda_min > -1e-9, "{}", lambda_min);
    assert!(lambda_min < 1e-9);
}

#[test]
fn test_certificate_scale() {
    let mut c = BlockSparseMatrix::new(3, 3);
    c.insert(0, 1, DMatrix::from_element(3, 3, -0.5));
    c.insert(1, 0, DMatrix::from_element(3, 3, -0.5));
    c.insert(1, 2, DMatrix::from_element(3, 3, 2.0));
    c.insert(2, 1, DMatrix::from_element(3, 3, 2.0));
    let adjacency = vec![vec![1], vec![0, 2], vec![1]];
    assert_eq!(certificate_scale(&c, &adjacency), 4.0);
    assert_eq!(
        certificate_scale(&BlockSparseMatrix::new(2, 3), &[vec![], vec![]]),
        1.0
    );
}
