//! Small replicated dense factorizations.
//!
//! Every small matrix in the optimizer (the quasi-Newton M, the reduced
//! inequality system, the Woodbury capacitance) is replicated on all ranks
//! and factored with partial-pivoting LU. A singular factorization is a
//! recoverable condition for the callers, so it surfaces as a typed error
//! instead of a panic.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Dense factorization errors.
#[derive(Debug, Error)]
pub enum DenseError {
    /// The matrix has no LU factorization with nonzero pivots.
    #[error("LU factorization is singular (n = {n})")]
    Singular {
        /// Dimension of the system
        n: usize,
    },
}

/// LU factorization (partial pivoting) of a small square matrix.
pub struct LuFactor {
    lu: nalgebra::linalg::LU<f64, nalgebra::Dyn, nalgebra::Dyn>,
    n: usize,
}

impl LuFactor {
    /// Factor a square matrix. Fails if a pivot vanishes.
    pub fn factor(a: &DMatrix<f64>) -> Result<Self, DenseError> {
        let n = a.nrows();
        debug_assert_eq!(n, a.ncols(), "LU requires a square matrix");
        let lu = a.clone().lu();
        if n > 0 && !lu.is_invertible() {
            return Err(DenseError::Singular { n });
        }
        Ok(Self { lu, n })
    }

    /// Solve `A x = b` in place.
    pub fn solve_in_place(&self, b: &mut DVector<f64>) -> Result<(), DenseError> {
        debug_assert_eq!(b.len(), self.n);
        if self.lu.solve_mut(b) {
            Ok(())
        } else {
            Err(DenseError::Singular { n: self.n })
        }
    }

    /// Solve `A x = b` for a plain slice right-hand side.
    pub fn solve_slice(&self, b: &mut [f64]) -> Result<(), DenseError> {
        debug_assert_eq!(b.len(), self.n);
        if self.n == 0 {
            return Ok(());
        }
        let mut v = DVector::from_column_slice(b);
        self.solve_in_place(&mut v)?;
        b.copy_from_slice(v.as_slice());
        Ok(())
    }

    /// Dimension of the factored system.
    pub fn dim(&self) -> usize {
        self.n
    }
}
