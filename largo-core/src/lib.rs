//! Largo: a data-parallel interior-point optimizer for large-scale
//! constrained problems.
//!
//! The solver handles problems of the form
//!
//! ```text
//! minimize    f(x)
//! subject to  c(x) >= 0          (few dense nonlinear inequalities)
//!             A_w x = b_w        (structured sparse equality block)
//!             x_l <= x <= x_u    (variable bounds)
//! ```
//!
//! where the decision vector x is distributed across the ranks of a
//! communicator. Key pieces:
//!
//! - **Primal-dual interior point**: perturbed KKT residuals, monotone
//!   barrier decrease, fraction-to-the-boundary steps, merit line search
//!   with an adaptive l1 penalty.
//! - **Compact quasi-Newton Hessians**: damped limited-memory BFGS or
//!   limited-memory SR1 in the compact form
//!   `B = b0*I - Z diag(d0) M^{-1} diag(d0) Z^T`.
//! - **Woodbury KKT solve**: the bordered KKT system is reduced to a
//!   cheap diagonal solve plus a small dense capacitance system that
//!   exploits the compact form exactly; no sparse factorization of the
//!   KKT matrix is ever formed.
//! - **Bulk-synchronous parallelism**: all reductions are collective and
//!   deterministic, so the small replicated matrices are identical on
//!   every rank.
//!
//! # Example
//!
//! ```ignore
//! use largo_core::{InteriorPoint, OptProblem, SerialComm, SolverSettings};
//!
//! let comm = SerialComm::new();
//! let settings = SolverSettings::default();
//! let mut opt = InteriorPoint::new(comm, n_local, my_problem, settings)?;
//! let result = opt.optimize(Some("checkpoint.dat"))?;
//! println!("status {:?}, f = {}", result.status, result.fobj);
//! ```

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)] // KKT solves thread many coupled blocks

pub mod comm;
pub mod ipm;
pub mod linalg;
pub mod problem;
pub mod qn;

pub use comm::{CommRef, Communicator, ReduceOp, SerialComm, ThreadComm};
pub use ipm::{InteriorPoint, OptError};
pub use linalg::vector::DistVec;
pub use problem::{
    BandedWeights, IterRecord, OptProblem, ProblemError, QnKind, SolveInfo, SolveResult,
    SolveStatus, SolverSettings,
};
pub use qn::{CompactView, Lbfgs, Lsr1, QnUpdateKind, QuasiNewton};
