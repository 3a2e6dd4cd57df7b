//! Robust rotation averaging for view graphs.
//!
//! Given pairwise relative rotations between cameras, estimate one global rotation per camera.
//! A semidefinite relaxation ([lagrange_dual]) supplies a global initialization, and an
//! iteratively reweighted least squares refiner ([irls]) removes the influence of outlier
//! measurements. Large view graphs can be split into clusters with [graph_cut] and solved
//! piecewise by [hybrid::HybridRotationEstimator].
//!
//! All rotations are stored as angle-axis (Rodrigues) vectors. A relative rotation `R_ij` on
//! the pair `(i, j)` satisfies `R_ij = R_j * R_i^T` for global rotations `R_i` and `R_j`.

extern crate disjoint_sets;
extern crate faer;
extern crate indicatif;
extern crate itertools;
extern crate log;
extern crate nalgebra;
extern crate rand;
extern crate rand_distr;
extern crate rayon;
extern crate thiserror;

pub mod graph_cut;
pub mod hybrid;
pub mod irls;
pub mod l1_rotation;
pub mod l1_solver;
pub mod lagrange_dual;
pub mod rotation;
pub mod sdp;
pub mod sparse;
pub mod synthetic;
pub mod tangent_space;
pub mod union_find;
pub mod viewgraph;

pub use graph_cut::compute_normalized_min_graph_cut;
pub use hybrid::{HybridRotationEstimator, HybridRotationOptions, RotationEstimatorSummary};
pub use irls::{IrlsRefinerOptions, IrlsRotationLocalRefiner, IrlsSummary};
pub use l1_rotation::{L1RotationGlobalRefiner, L1RotationOptions, L1RotationSummary};
pub use l1_solver::{L1Solver, L1SolverOptions, L1Summary};
pub use lagrange_dual::LagrangeDualRotationEstimator;
pub use sdp::{SdpSolverOptions, SdpSolverType, SdpSummary};
pub use union_find::DisjointSetForest;
pub use viewgraph::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty problem: {0}")]
    EmptyProblem(String),
    #[error("view {0} has no index in the problem")]
    UnknownView(ViewId),
    #[error("node {0} was never added to the forest")]
    UnknownNode(usize),
    #[error("cholesky factorization failed: {0}")]
    Factorization(String),
    #[error("linear solve failed: {0}")]
    LinearSolve(String),
    #[error("invalid sparse matrix: {0}")]
    InvalidMatrix(String),
    #[error("unsupported SDP solver type `{0}`")]
    UnsupportedSolver(String),
    #[error("rotations can only be retrieved for dimension 3, got {0}")]
    UnsupportedDimension(usize),
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;
