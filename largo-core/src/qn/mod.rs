//! Compact limited-memory quasi-Newton models.
//!
//! Both variants maintain the Hessian approximation in the compact form
//!
//! ```text
//! B = b0*I - Z * diag(d0) * M^{-1} * diag(d0) * Z^T
//! ```
//!
//! with small replicated matrices over the retained (s, y) history. The KKT
//! solver consumes a [`CompactView`] snapshot and never sees which variant
//! produced it.

pub mod lbfgs;
pub mod sr1;

pub use lbfgs::Lbfgs;
pub use sr1::Lsr1;

use crate::linalg::vector::DistVec;
use nalgebra::DMatrix;

/// What kind of update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QnUpdateKind {
    /// The pair was taken as supplied (or skipped as uninformative).
    Normal,
    /// The gradient difference was replaced by the Powell-damped vector.
    Damped,
}

/// Read-only snapshot of the compact factorization.
///
/// `z` holds borrowed column views into the model's own storage (the Z
/// ordering is a lookup, not an owner). A snapshot with `rank() == 0`
/// means the model currently acts as `b0*I`.
pub struct CompactView<'a> {
    /// Diagonal scaling b0 > 0.
    pub b0: f64,
    /// Diagonal gating d0, one entry per column of Z.
    pub d0: &'a [f64],
    /// The (unfactored) small matrix M, `rank() x rank()`.
    pub m_mat: &'a DMatrix<f64>,
    /// Columns of Z in order.
    pub z: Vec<&'a DistVec>,
}

impl CompactView<'_> {
    /// Rank of the low-rank correction (2m for BFGS, m for SR1).
    pub fn rank(&self) -> usize {
        self.z.len()
    }
}

/// Capability interface shared by the compact models.
pub trait QuasiNewton {
    /// Fold the pair (s, y) into the model. Collective.
    fn update(&mut self, s: &DistVec, y: &DistVec) -> QnUpdateKind;

    /// `y = B x`. Collective.
    fn mult(&self, x: &DistVec, y: &mut DistVec);

    /// `y += alpha * B x`. Collective.
    fn mult_add(&self, alpha: f64, x: &DistVec, y: &mut DistVec);

    /// Drop the retained history and restore b0 = 1.
    fn reset(&mut self);

    /// Snapshot of the compact factorization for the KKT solver.
    fn compact(&self) -> CompactView<'_>;

    /// Maximum number of retained pairs.
    fn max_subspace(&self) -> usize;

    /// Number of currently retained pairs.
    fn subspace_size(&self) -> usize;
}
