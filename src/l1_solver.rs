//! L1-norm linear regression with the alternating direction method of multipliers.
//!
//! Solves `min_x ||A x - b||_1` by splitting it into
//!
//! ```txt
//! min ||z||_1  s.t.  A x - z = b
//! ```
//!
//! and alternating between a least-squares update of `x`, a soft-threshold update of `z` and a
//! dual ascent step on the scaled multiplier `u` (Boyd et al., "Distributed Optimization and
//! Statistical Learning via the Alternating Direction Method of Multipliers", 2011). `A^T A` is
//! factorized once when the solver is built and reused by every iteration and every solve.

use log::{debug, error};
use nalgebra::{DMatrix, DVector};

use crate::sparse::{SparseCholeskyLlt, SparseMatrix};
use crate::Result;

#[derive(Debug, Clone)]
pub struct L1SolverOptions {
    pub max_num_iterations: usize,
    /// Augmented Lagrangian parameter.
    pub rho: f64,
    /// Over-relaxation parameter, typically between 1.0 and 1.8.
    pub alpha: f64,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
}

impl Default for L1SolverOptions {
    fn default() -> Self {
        L1SolverOptions {
            max_num_iterations: 1000,
            rho: 1.0,
            alpha: 1.0,
            absolute_tolerance: 1e-4,
            relative_tolerance: 1e-2,
        }
    }
}

/// Outcome of one [L1Solver::solve] call.
#[derive(Debug, Clone, PartialEq)]
pub struct L1Summary {
    pub num_iterations: usize,
    pub converged: bool,
    /// `||A x - z - b||` at the last iteration.
    pub primal_residual: f64,
    /// `||rho A^T (z - z_prev)||` at the last iteration.
    pub dual_residual: f64,
}

pub struct L1Solver {
    options: L1SolverOptions,
    a: SparseMatrix,
    linear_solver: SparseCholeskyLlt,
}

/// Soft thresholding `max(0, v - kappa) - max(0, -v - kappa)`, elementwise.
fn shrinkage(v: &DVector<f64>, kappa: f64) -> DVector<f64> {
    v.map(|x| (x - kappa).max(0.0) - (-x - kappa).max(0.0))
}

impl L1Solver {
    /// Factorizes `A^T A`. Fails if it is not positive definite, i.e. if `A` does not have full
    /// column rank.
    pub fn new(options: L1SolverOptions, a: SparseMatrix) -> Result<Self> {
        let mut linear_solver = SparseCholeskyLlt::new();
        let spd = a.weighted_gram(None)?;
        if let Err(e) = linear_solver.compute(&spd) {
            error!("L1 solver: could not factorize A^T A: {}", e);
            return Err(e);
        }
        Ok(L1Solver {
            options,
            a,
            linear_solver,
        })
    }

    pub fn from_dense(options: L1SolverOptions, a: &DMatrix<f64>) -> Result<Self> {
        L1Solver::new(options, SparseMatrix::from_dense(a)?)
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) {
        self.options.max_num_iterations = max_iterations;
    }

    pub fn options(&self) -> &L1SolverOptions {
        &self.options
    }

    /// Minimize `||A x - rhs||_1`, writing the minimizer to `solution`.
    ///
    /// A non-zero `solution` of length `A.ncols()` on entry is used as a warm start: the split
    /// variable starts at `A x - rhs` instead of zero. Running out of iterations is reported in
    /// the summary and is not an error. A failed linear solve aborts and leaves `solution`
    /// unspecified.
    pub fn solve(&self, rhs: &DVector<f64>, solution: &mut DVector<f64>) -> Result<L1Summary> {
        let rows = self.a.nrows();
        let cols = self.a.ncols();
        assert_eq!(rhs.len(), rows, "right hand side has the wrong size");

        let opts = &self.options;
        let mut z = if solution.len() == cols && solution.iter().any(|v| *v != 0.0) {
            self.a.mul_vec(solution) - rhs
        } else {
            DVector::zeros(rows)
        };
        let mut u: DVector<f64> = DVector::zeros(rows);
        if solution.len() != cols {
            *solution = DVector::zeros(cols);
        }

        let rhs_norm = rhs.norm();
        let primal_abs_tolerance_eps = (rows as f64).sqrt() * opts.absolute_tolerance;
        let dual_abs_tolerance_eps = (cols as f64).sqrt() * opts.absolute_tolerance;

        debug!(
            "{:>12}{:>16}{:>16}{:>16}{:>16}",
            "Iter", "R norm", "S norm", "Primal eps", "Dual eps"
        );

        let mut summary = L1Summary {
            num_iterations: 0,
            converged: false,
            primal_residual: f64::INFINITY,
            dual_residual: f64::INFINITY,
        };
        for i in 0..opts.max_num_iterations {
            // x-update
            let x = match self
                .linear_solver
                .solve(&self.a.transpose_mul_vec(&(rhs + &z - &u)))
            {
                Ok(x) => x,
                Err(e) => {
                    error!(
                        "L1 minimization failed: could not solve the Cholesky system: {}",
                        e
                    );
                    return Err(e);
                }
            };
            *solution = x;

            let a_times_x = self.a.mul_vec(solution);
            let ax_hat = &a_times_x * opts.alpha + (&z + rhs) * (1.0 - opts.alpha);

            // z-update
            let z_old = std::mem::replace(&mut z, shrinkage(&(&ax_hat - rhs + &u), 1.0 / opts.rho));

            // u-update
            u += &ax_hat - &z - rhs;

            let r_norm = (&a_times_x - &z - rhs).norm();
            let s_norm = (self.a.transpose_mul_vec(&(&z - &z_old)) * -opts.rho).norm();
            let max_norm = a_times_x.norm().max(z.norm()).max(rhs_norm);
            let primal_eps = primal_abs_tolerance_eps + opts.relative_tolerance * max_norm;
            let dual_eps = dual_abs_tolerance_eps
                + opts.relative_tolerance * (self.a.transpose_mul_vec(&u) * opts.rho).norm();

            debug!(
                "{:>12}{:>16.6e}{:>16.6e}{:>16.6e}{:>16.6e}",
                i, r_norm, s_norm, primal_eps, dual_eps
            );

            summary.num_iterations = i + 1;
            summary.primal_residual = r_norm;
            summary.dual_residual = s_norm;
            if r_norm < primal_eps && s_norm < dual_eps {
                summary.converged = true;
                break;
            }
        }
        Ok(summary)
    }
}

#[test]
fn test_shrinkage() {
    let v = DVector::from_vec(vec![3.0, -3.0, 0.5, -0.5, 1.0]);
    let s = shrinkage(&v, 1.0);
    assert_eq!(s, DVector::from_vec(vec![2.0, -2.0, 0.0, 0.0, 0.0]));
}

#[test]
fn test_identity_system_is_solved_exactly() {
    let a = DMatrix::identity(5, 5);
    let b = DVector::from_vec(vec![1.0, -2.0, 0.5, 4.0, -0.25]);
    let solver = L1Solver::from_dense(L1SolverOptions::default(), &a).unwrap();
    let mut x = DVector::zeros(5);
    let summary = solver.solve(&b, &mut x).unwrap();
    assert!(summary.converged);
    assert!((&x - &b).amax() < L1SolverOptions::default().absolute_tolerance);

    // warm start from the solution
    let summary = solver.solve(&b, &mut x).unwrap();
    assert!(summary.converged);
    assert!(summary.num_iterations <= 1);
    assert!((&x - &b).amax() < L1SolverOptions::default().absolute_tolerance);
}

#[test]
fn test_line_fit_ignores_outliers() {
    // y = 2 t + 1 with three gross outliers
    let n = 30;
    let mut a = DMatrix::zeros(n, 2);
    let mut b = DVector::zeros(n);
    for i in 0..n {
        let t = i as f64 / 3.0;
        a[(i, 0)] = t;
        a[(i, 1)] = 1.0;
        b[i] = 2.0 * t + 1.0;
    }
    b[3] += 40.0;
    b[11] -= 25.0;
    b[20] += 60.0;

    let options = L1SolverOptions {
        max_num_iterations: 20000,
        absolute_tolerance: 1e-9,
        relative_tolerance: 1e-7,
        ..Default::default()
    };
    let solver = L1Solver::from_dense(options, &a).unwrap();
    let mut x = DVector::zeros(2);
    solver.solve(&b, &mut x).unwrap();
    assert!((x[0] - 2.0).abs() < 1e-2, "slope {}", x[0]);
    assert!((x[1] - 1.0).abs() < 1e-2, "intercept {}", x[1]);

    // least squares would be pulled far off by the outliers
    let ls = (a.transpose() * &a)
        .cholesky()
        .unwrap()
        .solve(&(a.transpose() * &b));
    assert!((ls[1] - 1.0).abs() > 0.5);
}

#[test]
fn test_max_iterations_is_respected() {
    let a = DMatrix::from_row_slice(4, 1, &[1.0, 1.0, 1.0, 1.0]);
    let b = DVector::from_vec(vec![0.0, 1.0, 2.0, 10.0]);
    let mut solver = L1Solver::from_dense(L1SolverOptions::default(), &a).unwrap();
    solver.set_max_iterations(2);
    let mut x = DVector::zeros(1);
    let summary = solver.solve(&b, &mut x).unwrap();
    assert!(summary.num_iterations <= 2);
}

#[test]
fn test_rank_deficient_system_is_rejected() {
    // second column is twice the first, so A^T A is singular
    let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
    assert!(matches!(
        L1Solver::from_dense(L1SolverOptions::default(), &a),
        Err(crate::Error::Factorization(_))
    ));
}
