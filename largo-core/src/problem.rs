//! Problem oracle, sparse weighting block, settings and result types.
//!
//! The optimizer consumes a user problem through the [`OptProblem`] trait:
//! objective and dense inequality constraints with their gradients, the
//! variable bounds, and (optionally) a structured sparse equality block
//! `A_w x = b_w` described by a [`BandedWeights`] pattern.

use crate::linalg::vector::DistVec;
use thiserror::Error;

/// Oracle failures. Non-finite *values* are not errors: they are handled by
/// the line search, which rejects the trial point. These variants are for
/// hard failures where no value could be produced at all.
#[derive(Debug, Error)]
pub enum ProblemError {
    /// Objective/constraint evaluation could not be completed.
    #[error("objective/constraint evaluation failed: {0}")]
    Evaluation(String),

    /// Gradient evaluation could not be completed.
    #[error("gradient evaluation failed: {0}")]
    Gradient(String),
}

/// Process-local banded rows of the sparse equality ("weighting") block.
///
/// Row `j` has unit coefficients over the local variable range
/// `start + j*stride .. start + j*stride + width`. Rows never overlap
/// (`stride >= width`) and never cross rank boundaries, so the forward and
/// adjoint products are purely local and `A_w C^{-1} A_w^T` is diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandedWeights {
    /// Number of rows owned by this rank.
    pub num_con: usize,
    /// Local index of the first variable of the first row.
    pub start: usize,
    /// Number of variables per row.
    pub width: usize,
    /// Local index distance between consecutive row starts.
    pub stride: usize,
}

impl BandedWeights {
    /// Whether the pattern is well formed and fits within `n_local` entries.
    pub fn validate(&self, n_local: usize) -> bool {
        if self.num_con == 0 {
            return true;
        }
        self.width > 0
            && self.stride >= self.width
            && self.start + (self.num_con - 1) * self.stride + self.width <= n_local
    }

    #[inline]
    fn row_range(&self, j: usize) -> std::ops::Range<usize> {
        let lo = self.start + j * self.stride;
        lo..lo + self.width
    }

    /// `out = A_w x`. Purely local.
    pub fn apply(&self, x: &DistVec, out: &mut DistVec) {
        let xs = x.values();
        let os = out.values_mut();
        debug_assert_eq!(os.len(), self.num_con);
        for j in 0..self.num_con {
            os[j] = xs[self.row_range(j)].iter().sum();
        }
    }

    /// `out += alpha * A_w^T v`. Purely local.
    pub fn apply_transpose_add(&self, alpha: f64, v: &DistVec, out: &mut DistVec) {
        let vs = v.values();
        let os = out.values_mut();
        debug_assert_eq!(vs.len(), self.num_con);
        for j in 0..self.num_con {
            for o in &mut os[self.row_range(j)] {
                *o += alpha * vs[j];
            }
        }
    }

    /// `out = A_w^T v`. Purely local.
    pub fn apply_transpose(&self, v: &DistVec, out: &mut DistVec) {
        out.zero();
        self.apply_transpose_add(1.0, v, out);
    }

    /// Diagonal of `A_w C^{-1} A_w^T` for a positive diagonal `C`:
    /// row `j` gets the sum of `1/c_i` over its support. Purely local.
    pub fn schur_diag(&self, cvec: &DistVec, out: &mut DistVec) {
        let cs = cvec.values();
        let os = out.values_mut();
        debug_assert_eq!(os.len(), self.num_con);
        for j in 0..self.num_con {
            os[j] = cs[self.row_range(j)].iter().map(|c| 1.0 / c).sum();
        }
    }
}

/// User problem oracle.
///
/// All vector arguments follow the partitioning the optimizer was built
/// with. Scalar outputs (objective, constraint values) must be globally
/// reduced by the oracle itself so that every rank receives the same value;
/// constraint values are dense and replicated.
pub trait OptProblem {
    /// Number of dense inequality constraints `c(x) >= 0`.
    fn num_inequalities(&self) -> usize;

    /// Fill the starting point and the variable bounds. Infinite bounds are
    /// `f64::NEG_INFINITY` / `f64::INFINITY`.
    fn initial_point(&self, x: &mut DistVec, xl: &mut DistVec, xu: &mut DistVec);

    /// Evaluate the objective and the inequality constraints at `x`.
    fn eval_obj_con(&mut self, x: &DistVec, c: &mut [f64]) -> Result<f64, ProblemError>;

    /// Evaluate the objective gradient and the constraint gradients at `x`.
    fn eval_grad(&mut self, x: &DistVec, g: &mut DistVec, a: &mut [DistVec])
        -> Result<(), ProblemError>;

    /// Structure of the sparse equality block, if the problem has one.
    fn weight_pattern(&self) -> Option<BandedWeights> {
        None
    }

    /// Right-hand side of the sparse equality block. Defaults to all ones.
    fn weight_rhs(&self, bw: &mut DistVec) {
        bw.fill(1.0);
    }
}

/// Which compact quasi-Newton model supplies the Hessian approximation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QnKind {
    /// Damped limited-memory BFGS (positive definite).
    Bfgs,
    /// Limited-memory SR1 (possibly indefinite).
    Sr1,
}

/// Optimizer settings.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Cap on major iterations.
    pub max_major_iters: usize,

    /// Push the supplied starting point strictly inside the bounds.
    pub init_starting_point: bool,

    /// Stop when max(dual, primal, complementarity) residual drops below
    /// this and the barrier parameter is commensurately small.
    pub abs_res_tol: f64,

    /// Initial barrier parameter mu.
    pub barrier_param: f64,

    /// Monotone barrier decrease factor, in (0, 1).
    pub monotone_barrier_fraction: f64,

    /// Monotone barrier decrease exponent, >= 1.
    pub monotone_barrier_power: f64,

    /// Run the merit line search at all.
    pub use_line_search: bool,

    /// Backtrack on merit failure. When disabled, the fraction-to-boundary
    /// step is taken and the merit check is advisory.
    pub use_backtracking_alpha: bool,

    /// Cap on merit-function evaluations per line search.
    pub max_line_iters: usize,

    /// Armijo sufficient-decrease constant c1.
    pub armijio_constant: f64,

    /// Fraction of the penalty descent the merit derivative must provide.
    pub penalty_descent_fraction: f64,

    /// Fraction-to-boundary safety factor tau, in [0.95, 1).
    pub min_fraction_to_boundary: f64,

    /// Discard the quasi-Newton correction and run with B = b0*I.
    pub sequential_linear_method: bool,

    /// Quasi-Newton variant.
    pub qn_kind: QnKind,

    /// Maximum quasi-Newton subspace size (pairs retained).
    pub qn_subspace: usize,

    /// Write the checkpoint file every this many major iterations.
    pub write_output_frequency: usize,

    /// Verify the KKT step by substitution at this major iteration.
    pub major_iter_step_check: Option<usize>,

    /// Per-run iteration log (written by rank 0).
    pub output_file: Option<String>,

    /// Mirror the iteration log to stdout on rank 0.
    pub verbose: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        let verbose = std::env::var("LARGO_VERBOSE")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(false);

        Self {
            max_major_iters: 200,
            init_starting_point: true,
            abs_res_tol: 1e-6,
            barrier_param: 0.1,
            monotone_barrier_fraction: 0.25,
            monotone_barrier_power: 1.1,
            use_line_search: true,
            use_backtracking_alpha: true,
            max_line_iters: 10,
            armijio_constant: 1e-5,
            penalty_descent_fraction: 0.3,
            min_fraction_to_boundary: 0.95,
            sequential_linear_method: false,
            qn_kind: QnKind::Bfgs,
            qn_subspace: 10,
            write_output_frequency: 10,
            major_iter_step_check: None,
            output_file: None,
            verbose,
        }
    }
}

/// Final optimizer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// KKT residuals below tolerance at a small barrier parameter.
    Converged,

    /// Iteration cap reached before convergence.
    MaxIterations,

    /// Two consecutive line searches exhausted their iteration budget.
    LineSearchFailure,

    /// Unrecoverable numerical breakdown (singular reduced system or
    /// non-finite gradients).
    NumericalError,
}

/// One row of the major-iteration log.
#[derive(Debug, Clone, Copy)]
pub struct IterRecord {
    /// Major iteration index.
    pub iter: usize,
    /// Objective value at the iterate.
    pub fobj: f64,
    /// Barrier parameter.
    pub mu: f64,
    /// Merit penalty parameter.
    pub rho: f64,
    /// Step length accepted at the previous iteration.
    pub alpha: f64,
    /// Dual residual infinity norm.
    pub dual_res: f64,
    /// Primal residual infinity norm.
    pub primal_res: f64,
    /// Complementarity residual infinity norm.
    pub comp_res: f64,
    /// Average complementarity product.
    pub comp_avg: f64,
}

/// Evaluation counters and timings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveInfo {
    /// Objective/constraint evaluations.
    pub neval: usize,
    /// Gradient evaluations.
    pub ngeval: usize,
    /// Accepted quasi-Newton updates.
    pub qn_updates: usize,
    /// Updates that required Powell damping.
    pub qn_damped: usize,
    /// Wall-clock time of `optimize`.
    pub solve_time_ms: u64,
}

/// Result of an optimization run.
#[derive(Debug, Clone)]
pub struct SolveResult {
    /// Final status.
    pub status: SolveStatus,
    /// Objective at the final iterate.
    pub fobj: f64,
    /// Major iterations performed.
    pub iterations: usize,
    /// Final dual residual infinity norm.
    pub dual_res: f64,
    /// Final primal residual infinity norm.
    pub primal_res: f64,
    /// Final complementarity residual infinity norm.
    pub comp_res: f64,
    /// Final barrier parameter.
    pub barrier_mu: f64,
    /// Counters and timing.
    pub info: SolveInfo,
    /// Per-iteration log records.
    pub history: Vec<IterRecord>,
}
