//! Damped limited-memory BFGS in compact form.
//!
//! The factorization is
//!
//! ```text
//! B = b0*I - [b0*S  Y] * M^{-1} * [b0*S^T ; Y^T]
//! M = [ b0*S^T S    L  ]
//!     [   L^T      -D  ]
//! ```
//!
//! with L the strict lower triangle of S^T Y, D its diagonal, and
//! b0 = y^T y / y^T s. Powell damping replaces y when the curvature
//! condition y^T s > 0.2 * s^T B s fails, which keeps B positive definite.

use super::{CompactView, QnUpdateKind, QuasiNewton};
use crate::comm::CommRef;
use crate::linalg::dense::LuFactor;
use crate::linalg::vector::DistVec;
use nalgebra::DMatrix;

pub struct Lbfgs {
    msub_max: usize,
    msub: usize,
    b0: f64,

    s_vecs: Vec<DistVec>,
    y_vecs: Vec<DistVec>,

    // Scratch for B*s in the damping test.
    r: DistVec,

    // Replicated history matrices; the leading msub block is valid.
    b_ss: DMatrix<f64>,
    l_sy: DMatrix<f64>,
    d_sy: Vec<f64>,

    // Rebuilt per update: the 2m x 2m M, its factorization, and d0.
    m_mat: DMatrix<f64>,
    m_lu: Option<LuFactor>,
    d0: Vec<f64>,
}

impl Lbfgs {
    /// Create a model retaining up to `msub_max` pairs of `n_local`-sized
    /// columns. All column storage is allocated here.
    pub fn new(comm: &CommRef, n_local: usize, msub_max: usize) -> Self {
        Self {
            msub_max,
            msub: 0,
            b0: 1.0,
            s_vecs: (0..msub_max)
                .map(|_| DistVec::new(comm.clone(), n_local))
                .collect(),
            y_vecs: (0..msub_max)
                .map(|_| DistVec::new(comm.clone(), n_local))
                .collect(),
            r: DistVec::new(comm.clone(), n_local),
            b_ss: DMatrix::zeros(msub_max, msub_max),
            l_sy: DMatrix::zeros(msub_max, msub_max),
            d_sy: vec![0.0; msub_max],
            m_mat: DMatrix::zeros(0, 0),
            m_lu: None,
            d0: Vec::new(),
        }
    }

    /// Append the pair, evicting the oldest column FIFO when full, then
    /// recompute the new row/column of the history matrices with one
    /// batched reduction.
    fn push_pair(&mut self, s: &DistVec, y: &DistVec) {
        if self.msub < self.msub_max {
            self.s_vecs[self.msub].copy_from(s);
            self.y_vecs[self.msub].copy_from(y);
            self.msub += 1;
        } else {
            self.s_vecs.rotate_left(1);
            self.y_vecs.rotate_left(1);
            let m = self.msub;
            self.s_vecs[m - 1].copy_from(s);
            self.y_vecs[m - 1].copy_from(y);

            // Shift the retained history up-left by one.
            for i in 0..m - 1 {
                self.d_sy[i] = self.d_sy[i + 1];
            }
            for i in 0..m - 1 {
                for j in 0..m - 1 {
                    self.b_ss[(i, j)] = self.b_ss[(i + 1, j + 1)];
                }
            }
            for i in 0..m - 1 {
                for j in 0..i {
                    self.l_sy[(i, j)] = self.l_sy[(i + 1, j + 1)];
                }
            }
        }

        let m = self.msub;
        let mut vals = vec![0.0; 2 * m];
        {
            let svecs = &self.s_vecs[..m];
            let yvecs = &self.y_vecs[..m];
            let cols: Vec<&DistVec> = svecs.iter().chain(yvecs.iter()).collect();
            svecs[m - 1].mdot(&cols, &mut vals);
        }
        for i in 0..m {
            self.b_ss[(m - 1, i)] = vals[i];
            self.b_ss[(i, m - 1)] = vals[i];
        }
        self.d_sy[m - 1] = vals[2 * m - 1];
        for j in 0..m - 1 {
            self.l_sy[(m - 1, j)] = vals[m + j];
        }
    }

    /// Rebuild M from the history blocks, refactor it, and refresh d0.
    fn rebuild(&mut self) {
        let m = self.msub;
        let mut mm = DMatrix::zeros(2 * m, 2 * m);
        for i in 0..m {
            for j in 0..m {
                mm[(i, j)] = self.b0 * self.b_ss[(i, j)];
            }
        }
        for i in 0..m {
            for j in 0..i {
                mm[(i, m + j)] = self.l_sy[(i, j)];
                mm[(m + j, i)] = self.l_sy[(i, j)];
            }
        }
        for i in 0..m {
            mm[(m + i, m + i)] = -self.d_sy[i];
        }
        self.m_lu = LuFactor::factor(&mm).ok();
        self.m_mat = mm;

        self.d0 = (0..2 * m)
            .map(|i| if i < m { self.b0 } else { 1.0 })
            .collect();
    }

    fn z_columns(&self) -> Vec<&DistVec> {
        let m = self.msub;
        self.s_vecs[..m]
            .iter()
            .chain(self.y_vecs[..m].iter())
            .collect()
    }

    /// `y += coef * Z diag(d0) M^{-1} diag(d0) Z^T x`. Falls back to a
    /// no-op (leaving the b0*I part already applied by the caller) when M
    /// could not be factored.
    fn apply_low_rank(&self, coef: f64, x: &DistVec, y: &mut DistVec) {
        let m = self.msub;
        if m == 0 {
            return;
        }
        let Some(lu) = &self.m_lu else { return };

        let zcols = self.z_columns();
        let mut rz = vec![0.0; 2 * m];
        x.mdot(&zcols, &mut rz);
        for (r, d) in rz.iter_mut().zip(&self.d0) {
            *r *= d;
        }
        if lu.solve_slice(&mut rz).is_err() {
            return;
        }
        for (r, d) in rz.iter_mut().zip(&self.d0) {
            *r *= d;
        }
        for (j, zj) in zcols.iter().enumerate() {
            y.axpy(coef * rz[j], zj);
        }
    }
}

impl QuasiNewton for Lbfgs {
    fn update(&mut self, s: &DistVec, y: &DistVec) -> QnUpdateKind {
        if self.msub_max == 0 {
            return QnUpdateKind::Normal;
        }

        // Curvature and scaling of the incoming pair, one reduction.
        let mut gy = [0.0; 2];
        y.mdot(&[y, s], &mut gy);
        let (mut gamma, mut alpha) = (gy[0], gy[1]);

        // A vanishing gradient difference carries no curvature information.
        if !(gamma > 0.0) || !alpha.is_finite() {
            return QnUpdateKind::Normal;
        }

        if self.msub == 0 {
            self.b0 = gamma / alpha;
            if !(self.b0 > 0.0) || !self.b0.is_finite() {
                self.b0 = 1.0;
            }
        }

        // s^T B s with the previous approximation.
        let mut r = std::mem::replace(&mut self.r, DistVec::new(s.comm().clone(), 0));
        self.mult(s, &mut r);
        let beta = r.dot(s);

        let mut kind = QnUpdateKind::Normal;
        if alpha <= 0.2 * beta {
            // Powell damping: y' = theta*y + (1 - theta)*B*s keeps
            // s^T y' = 0.2 * s^T B s > 0.
            kind = QnUpdateKind::Damped;
            let theta = 0.8 * beta / (beta - alpha);
            r.scale(1.0 - theta);
            r.axpy(theta, y);

            let mut ga = [0.0; 2];
            r.mdot(&[&r, s], &mut ga);
            gamma = ga[0];
            alpha = ga[1];
        }

        if !(gamma > 0.0) || !(alpha > 0.0) || !gamma.is_finite() || !alpha.is_finite() {
            self.r = r;
            return QnUpdateKind::Normal;
        }

        self.b0 = gamma / alpha;

        if kind == QnUpdateKind::Damped {
            self.push_pair(s, &r);
        } else {
            self.push_pair(s, y);
        }
        self.rebuild();
        self.r = r;
        kind
    }

    fn mult(&self, x: &DistVec, y: &mut DistVec) {
        y.copy_from(x);
        y.scale(self.b0);
        self.apply_low_rank(-1.0, x, y);
    }

    fn mult_add(&self, alpha: f64, x: &DistVec, y: &mut DistVec) {
        y.axpy(alpha * self.b0, x);
        self.apply_low_rank(-alpha, x, y);
    }

    fn reset(&mut self) {
        self.msub = 0;
        self.b0 = 1.0;
        self.b_ss.fill(0.0);
        self.l_sy.fill(0.0);
        self.d_sy.fill(0.0);
        self.m_mat = DMatrix::zeros(0, 0);
        self.m_lu = None;
        self.d0.clear();
    }

    fn compact(&self) -> CompactView<'_> {
        if self.m_lu.is_none() {
            return CompactView {
                b0: self.b0,
                d0: &[],
                m_mat: &self.m_mat,
                z: Vec::new(),
            };
        }
        CompactView {
            b0: self.b0,
            d0: &self.d0,
            m_mat: &self.m_mat,
            z: self.z_columns(),
        }
    }

    fn max_subspace(&self) -> usize {
        self.msub_max
    }

    fn subspace_size(&self) -> usize {
        self.msub
    }
}
