//! Limited-memory SR1 in compact form.
//!
//! The factorization is
//!
//! ```text
//! B = b0*I - Z * M^{-1} * Z^T,   Z_i = y_i - b0*s_i
//! M = b0*S^T S - (D + L + L^T)
//! ```
//!
//! which matches the compact convention shared with the BFGS model
//! (d0 is all ones here). SR1 applies no damping: the pair is stored as
//! supplied, b0 is fixed by the first pair, and M may be indefinite or
//! singular. A singular M is tolerated by degrading the product to b0*I
//! until a later update produces a factorable M.

use super::{CompactView, QnUpdateKind, QuasiNewton};
use crate::comm::CommRef;
use crate::linalg::dense::LuFactor;
use crate::linalg::vector::DistVec;
use nalgebra::DMatrix;

pub struct Lsr1 {
    msub_max: usize,
    msub: usize,
    b0: f64,
    b0_set: bool,

    s_vecs: Vec<DistVec>,
    y_vecs: Vec<DistVec>,
    // Materialized Z columns, refreshed on every update.
    z_vecs: Vec<DistVec>,

    b_ss: DMatrix<f64>,
    l_sy: DMatrix<f64>,
    d_sy: Vec<f64>,

    m_mat: DMatrix<f64>,
    m_lu: Option<LuFactor>,
    d0: Vec<f64>,
}

impl Lsr1 {
    /// Create a model retaining up to `msub_max` pairs of `n_local`-sized
    /// columns.
    pub fn new(comm: &CommRef, n_local: usize, msub_max: usize) -> Self {
        Self {
            msub_max,
            msub: 0,
            b0: 1.0,
            b0_set: false,
            s_vecs: (0..msub_max)
                .map(|_| DistVec::new(comm.clone(), n_local))
                .collect(),
            y_vecs: (0..msub_max)
                .map(|_| DistVec::new(comm.clone(), n_local))
                .collect(),
            z_vecs: (0..msub_max)
                .map(|_| DistVec::new(comm.clone(), n_local))
                .collect(),
            b_ss: DMatrix::zeros(msub_max, msub_max),
            l_sy: DMatrix::zeros(msub_max, msub_max),
            d_sy: vec![0.0; msub_max],
            m_mat: DMatrix::zeros(0, 0),
            m_lu: None,
            d0: Vec::new(),
        }
    }

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

    fn rebuild(&mut self) {
        let m = self.msub;
        let mut mm = DMatrix::zeros(m, m);
        for i in 0..m {
            for j in 0..m {
                mm[(i, j)] = self.b0 * self.b_ss[(i, j)];
            }
        }
        for i in 0..m {
            for j in 0..i {
                mm[(i, j)] -= self.l_sy[(i, j)];
                mm[(j, i)] -= self.l_sy[(i, j)];
            }
        }
        for i in 0..m {
            mm[(i, i)] -= self.d_sy[i];
        }
        // M may legitimately be singular for SR1; the product then
        // degrades to b0*I until a later update refactors.
        self.m_lu = LuFactor::factor(&mm).ok();
        self.m_mat = mm;

        for i in 0..m {
            let (z, y, s) = (&mut self.z_vecs[i], &self.y_vecs[i], &self.s_vecs[i]);
            z.copy_from(y);
            z.axpy(-self.b0, s);
        }
        self.d0 = vec![1.0; m];
    }

    fn apply_low_rank(&self, coef: f64, x: &DistVec, y: &mut DistVec) {
        let m = self.msub;
        if m == 0 {
            return;
        }
        let Some(lu) = &self.m_lu else { return };

        let zcols: Vec<&DistVec> = self.z_vecs[..m].iter().collect();
        let mut rz = vec![0.0; m];
        x.mdot(&zcols, &mut rz);
        if lu.solve_slice(&mut rz).is_err() {
            return;
        }
        for (j, zj) in zcols.iter().enumerate() {
            y.axpy(coef * rz[j], zj);
        }
    }
}

impl QuasiNewton for Lsr1 {
    fn update(&mut self, s: &DistVec, y: &DistVec) -> QnUpdateKind {
        if self.msub_max == 0 {
            return QnUpdateKind::Normal;
        }

        let mut gy = [0.0; 2];
        y.mdot(&[y, s], &mut gy);
        let (gamma, alpha) = (gy[0], gy[1]);

        if !(gamma > 0.0) || !alpha.is_finite() {
            return QnUpdateKind::Normal;
        }

        // b0 is fixed by the first pair, whatever its sign: SR1 is the
        // variant that represents indefinite curvature.
        if !self.b0_set {
            self.b0 = gamma / alpha;
            self.b0_set = true;
        }

        self.push_pair(s, y);
        self.rebuild();
        QnUpdateKind::Normal
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
        self.b0_set = false;
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
            z: self.z_vecs[..self.msub].iter().collect(),
        }
    }

    fn max_subspace(&self) -> usize {
        self.msub_max
    }

    fn subspace_size(&self) -> usize {
        self.msub
    }
}
