//! KKT system solver.
//!
//! The bordered KKT matrix for the barrier subproblem is
//!
//! ```text
//! [  B   -A_w^T  -A^T   0   -I         I        ] [ px  ]   [ rx  ]
//! [  A_w   0      0     0    0         0        ] [ pzw ]   [ rw  ]
//! [  A     0      0    -I    0         0        ] [ pz  ] = [ rc  ]
//! [  0     0      S     Z    0         0        ] [ ps  ]   [ rs  ]
//! [  Z_l   0      0     0   (X-X_l)    0        ] [ pzl ]   [ rzl ]
//! [ -Z_u   0      0     0    0        (X_u-X)   ] [ pzu ]   [ rzu ]
//! ```
//!
//! with B the compact quasi-Newton approximation. The *diagonal* solve
//! replaces B by b0*I, which makes the x-x block the positive diagonal
//! C = b0 + Z_l/(X-X_l) + Z_u/(X_u-X): the bound and slack rows eliminate
//! symbolically, the weighting rows reduce to the diagonal
//! E = diag(A_w C^{-1} A_w^T) (their supports are disjoint), and what is
//! left is a dense m x m system over the inequality multipliers.
//!
//! The *full* solve folds the low-rank part of B back in through
//! Sherman-Morrison-Woodbury: with B = b0*I - U M^{-1} U^T and
//! U = Z diag(d0),
//!
//! ```text
//! K^{-1} = Kd^{-1} + Kd^{-1} U (M - U^T Kd^{-1} U)^{-1} U^T Kd^{-1}
//! ```
//!
//! so one diagonal solve per compact column (cached per iteration), one
//! small capacitance factorization, and one extra diagonal solve produce
//! the exact step for the compact B. The solver only ever sees the compact
//! snapshot; BFGS and SR1 are interchangeable here.

use crate::comm::CommRef;
use crate::ipm::workspace::IpmWorkspace;
use crate::linalg::dense::LuFactor;
use crate::linalg::vector::DistVec;
use crate::problem::BandedWeights;
use crate::qn::{CompactView, QuasiNewton};
use nalgebra::DMatrix;
use thiserror::Error;

/// KKT solve failures. Both are recoverable by the outer loop.
#[derive(Debug, Error)]
pub enum KktError {
    /// The dense reduced system over the inequality multipliers is singular.
    #[error("reduced inequality system is singular (m = {m})")]
    SingularReduced {
        /// Number of inequality constraints
        m: usize,
    },

    /// The Woodbury capacitance matrix is singular.
    #[error("capacitance matrix is singular (rank = {rank})")]
    SingularCapacitance {
        /// Rank of the low-rank correction
        rank: usize,
    },
}

/// Scratch vectors for the diagonal solves, allocated once.
pub struct KktScratch {
    pub xt1: DistVec,
    pub xt2: DistVec,
    pub xt3: DistVec,
    pub wt1: DistVec,
    pub zt: Vec<f64>,
    pub rz: Vec<f64>,
}

impl KktScratch {
    pub fn new(comm: &CommRef, n_local: usize, ncon: usize, nwcon: usize, qn_cap: usize) -> Self {
        Self {
            xt1: DistVec::new(comm.clone(), n_local),
            xt2: DistVec::new(comm.clone(), n_local),
            xt3: DistVec::new(comm.clone(), n_local),
            wt1: DistVec::new(comm.clone(), nwcon),
            zt: vec![0.0; ncon],
            rz: vec![0.0; qn_cap],
        }
    }
}

/// Factored state of the diagonal reduction plus the per-iteration
/// Woodbury cache.
pub struct KktSolver {
    ncon: usize,

    // Diagonal reduction, refreshed by `factor`.
    cvec: DistVec,
    inv_bl: DistVec,
    inv_bu: DistVec,
    cw: DistVec,
    dmat: DMatrix<f64>,
    dmat_lu: Option<LuFactor>,

    // Woodbury cache, refreshed by `factor_schur`.
    ew: Vec<DistVec>,
    ce_lu: Option<LuFactor>,
    schur_rank: usize,
}

impl KktSolver {
    pub fn new(comm: &CommRef, n_local: usize, ncon: usize, nwcon: usize, qn_cap: usize) -> Self {
        Self {
            ncon,
            cvec: DistVec::new(comm.clone(), n_local),
            inv_bl: DistVec::new(comm.clone(), n_local),
            inv_bu: DistVec::new(comm.clone(), n_local),
            cw: DistVec::new(comm.clone(), nwcon),
            dmat: DMatrix::zeros(ncon, ncon),
            dmat_lu: None,
            ew: (0..qn_cap)
                .map(|_| DistVec::new(comm.clone(), n_local))
                .collect(),
            ce_lu: None,
            schur_rank: 0,
        }
    }

    /// Assemble and factor the diagonal reduction at the current iterate.
    ///
    /// Builds C, the bound-gap inverses, the weighting Schur diagonal E and
    /// the dense reduced matrix
    /// `D = Z^{-1} S + A (C^{-1} - C^{-1} A_w^T E^{-1} A_w C^{-1}) A^T`,
    /// then LU-factors D. Collective (one batched reduction per
    /// inequality row).
    pub fn factor(
        &mut self,
        ws: &mut IpmWorkspace,
        b0: f64,
        w: Option<&BandedWeights>,
    ) -> Result<(), KktError> {
        let m = self.ncon;
        let IpmWorkspace {
            x,
            xl,
            xu,
            s,
            z,
            zl,
            zu,
            ac,
            scratch,
            ..
        } = ws;

        {
            let (xv, lv, uv) = (x.values(), xl.values(), xu.values());
            let (zlv, zuv) = (zl.values(), zu.values());
            let ibl = self.inv_bl.values_mut();
            for i in 0..xv.len() {
                ibl[i] = if lv[i].is_finite() {
                    1.0 / (xv[i] - lv[i])
                } else {
                    0.0
                };
            }
            let ibu = self.inv_bu.values_mut();
            for i in 0..xv.len() {
                ibu[i] = if uv[i].is_finite() {
                    1.0 / (uv[i] - xv[i])
                } else {
                    0.0
                };
            }
            let cv = self.cvec.values_mut();
            let (ibl, ibu) = (self.inv_bl.values(), self.inv_bu.values());
            for i in 0..xv.len() {
                cv[i] = b0 + zlv[i] * ibl[i] + zuv[i] * ibu[i];
            }
        }

        if let Some(w) = w {
            w.schur_diag(&self.cvec, &mut self.cw);
        }

        if m == 0 {
            self.dmat_lu = None;
            return Ok(());
        }

        let KktScratch {
            xt1, xt2, wt1, zt, ..
        } = scratch;
        let cols: Vec<&DistVec> = ac.iter().collect();
        for i in 0..m {
            // v_i = (C^{-1} - C^{-1} A_w^T E^{-1} A_w C^{-1}) a_i
            {
                let t = xt1.values_mut();
                let (av, cv) = (ac[i].values(), self.cvec.values());
                for k in 0..t.len() {
                    t[k] = av[k] / cv[k];
                }
            }
            if let Some(w) = w {
                w.apply(xt1, wt1);
                {
                    let tv = wt1.values_mut();
                    let cwv = self.cw.values();
                    for j in 0..tv.len() {
                        tv[j] /= cwv[j];
                    }
                }
                w.apply_transpose(wt1, xt2);
                {
                    let t = xt1.values_mut();
                    let (uv, cv) = (xt2.values(), self.cvec.values());
                    for k in 0..t.len() {
                        t[k] -= uv[k] / cv[k];
                    }
                }
            }
            xt1.mdot(&cols, &mut zt[..m]);
            for j in 0..m {
                self.dmat[(i, j)] = zt[j];
            }
        }
        for i in 0..m {
            self.dmat[(i, i)] += s[i] / z[i];
        }

        self.dmat_lu =
            Some(LuFactor::factor(&self.dmat).map_err(|_| KktError::SingularReduced { m })?);
        Ok(())
    }

    /// Cache the Woodbury columns for the compact snapshot and factor the
    /// capacitance matrix `C_e = M - D0 (Z^T E_w) D0`. Collective (two
    /// batched reductions per compact column).
    pub fn factor_schur(
        &mut self,
        ws: &mut IpmWorkspace,
        cm: &CompactView<'_>,
        w: Option<&BandedWeights>,
    ) -> Result<(), KktError> {
        let r = cm.rank();
        self.schur_rank = r;
        if r == 0 {
            self.ce_lu = None;
            return Ok(());
        }

        let mut ew = std::mem::take(&mut self.ew);
        let mut column_err = None;
        for j in 0..r {
            if let Err(e) = self.solve_diag_x(&mut ws.scratch, &ws.ac, w, cm.z[j], &mut ew[j]) {
                column_err = Some(e);
                break;
            }
        }
        self.ew = ew;
        if let Some(e) = column_err {
            return Err(e);
        }

        let mut ce = DMatrix::zeros(r, r);
        for j in 0..r {
            let rz = &mut ws.scratch.rz[..r];
            self.ew[j].mdot(&cm.z, rz);
            for i in 0..r {
                ce[(i, j)] = cm.m_mat[(i, j)] - cm.d0[i] * rz[i] * cm.d0[j];
            }
        }

        self.ce_lu =
            Some(LuFactor::factor(&ce).map_err(|_| KktError::SingularCapacitance { rank: r })?);
        Ok(())
    }

    /// Diagonal solve, full six-block right-hand side to full six-block
    /// solution. Collective (one batched reduction).
    #[allow(clippy::too_many_arguments)]
    pub fn solve_diag(
        &self,
        sc: &mut KktScratch,
        ac: &[DistVec],
        w: Option<&BandedWeights>,
        s: &[f64],
        z: &[f64],
        zl: &DistVec,
        zu: &DistVec,
        bx: &DistVec,
        bc: &[f64],
        bw: &DistVec,
        bs: &[f64],
        bzl: &DistVec,
        bzu: &DistVec,
        yx: &mut DistVec,
        yz: &mut [f64],
        yw: &mut DistVec,
        ys: &mut [f64],
        yzl: &mut DistVec,
        yzu: &mut DistVec,
    ) -> Result<(), KktError> {
        let m = self.ncon;
        let KktScratch {
            xt1, xt2, xt3, wt1, zt, ..
        } = sc;

        // Reduced right-hand side d = bx + (X-X_l)^{-1} bzl - (X_u-X)^{-1} bzu.
        xt1.copy_from(bx);
        {
            let d = xt1.values_mut();
            let (ibl, ibu) = (self.inv_bl.values(), self.inv_bu.values());
            let (blv, buv) = (bzl.values(), bzu.values());
            for i in 0..d.len() {
                d[i] += ibl[i] * blv[i] - ibu[i] * buv[i];
            }
        }

        // Base image h of d under the weighting-folded diagonal inverse.
        {
            let h = xt2.values_mut();
            let (dv, cv) = (xt1.values(), self.cvec.values());
            for i in 0..h.len() {
                h[i] = dv[i] / cv[i];
            }
        }
        if let Some(w) = w {
            w.apply(xt2, wt1);
            {
                let t = wt1.values_mut();
                let (bwv, cwv) = (bw.values(), self.cw.values());
                for j in 0..t.len() {
                    t[j] = (bwv[j] - t[j]) / cwv[j];
                }
            }
            w.apply_transpose(wt1, xt3);
            {
                let h = xt2.values_mut();
                let (uv, cv) = (xt3.values(), self.cvec.values());
                for i in 0..h.len() {
                    h[i] += uv[i] / cv[i];
                }
            }
        }

        // Dense solve for the inequality multipliers.
        if m > 0 {
            let cols: Vec<&DistVec> = ac.iter().collect();
            xt2.mdot(&cols, &mut zt[..m]);
            for i in 0..m {
                yz[i] = bc[i] + bs[i] / z[i] - zt[i];
            }
            let lu = self
                .dmat_lu
                .as_ref()
                .ok_or(KktError::SingularReduced { m })?;
            lu.solve_slice(&mut yz[..m])
                .map_err(|_| KktError::SingularReduced { m })?;
        }

        // Recover the weighting multipliers and the design-variable step:
        // yx = C^{-1}(d + A^T yz + A_w^T yw).
        for (i, a) in ac.iter().enumerate() {
            xt1.axpy(yz[i], a);
        }
        if let Some(w) = w {
            {
                let t = xt2.values_mut();
                let (dv, cv) = (xt1.values(), self.cvec.values());
                for i in 0..t.len() {
                    t[i] = dv[i] / cv[i];
                }
            }
            w.apply(xt2, wt1);
            {
                let ywv = yw.values_mut();
                let (bwv, cwv, tv) = (bw.values(), self.cw.values(), wt1.values());
                for j in 0..ywv.len() {
                    ywv[j] = (bwv[j] - tv[j]) / cwv[j];
                }
            }
            w.apply_transpose(yw, xt3);
            {
                let yxv = yx.values_mut();
                let (dv, uv, cv) = (xt1.values(), xt3.values(), self.cvec.values());
                for i in 0..yxv.len() {
                    yxv[i] = (dv[i] + uv[i]) / cv[i];
                }
            }
        } else {
            yw.zero();
            let yxv = yx.values_mut();
            let (dv, cv) = (xt1.values(), self.cvec.values());
            for i in 0..yxv.len() {
                yxv[i] = dv[i] / cv[i];
            }
        }

        // Back-substitute the slacks and the bound multipliers.
        for i in 0..m {
            ys[i] = (bs[i] - s[i] * yz[i]) / z[i];
        }
        {
            let (ylv, yuv) = (yzl.values_mut(), yzu.values_mut());
            let (ibl, ibu) = (self.inv_bl.values(), self.inv_bu.values());
            let (blv, buv) = (bzl.values(), bzu.values());
            let (zlv, zuv) = (zl.values(), zu.values());
            let yxv = yx.values();
            for i in 0..ylv.len() {
                ylv[i] = ibl[i] * (blv[i] - zlv[i] * yxv[i]);
                yuv[i] = ibu[i] * (buv[i] + zuv[i] * yxv[i]);
            }
        }
        Ok(())
    }

    /// Diagonal solve with an x-only right-hand side, returning only the
    /// x component. This is the Woodbury column solve. Collective.
    pub fn solve_diag_x(
        &self,
        sc: &mut KktScratch,
        ac: &[DistVec],
        w: Option<&BandedWeights>,
        bx: &DistVec,
        yx: &mut DistVec,
    ) -> Result<(), KktError> {
        let m = self.ncon;
        let KktScratch {
            xt1, xt2, xt3, wt1, zt, ..
        } = sc;

        {
            let h = xt2.values_mut();
            let (bv, cv) = (bx.values(), self.cvec.values());
            for i in 0..h.len() {
                h[i] = bv[i] / cv[i];
            }
        }
        if let Some(w) = w {
            w.apply(xt2, wt1);
            {
                let t = wt1.values_mut();
                let cwv = self.cw.values();
                for j in 0..t.len() {
                    t[j] = -t[j] / cwv[j];
                }
            }
            w.apply_transpose(wt1, xt3);
            {
                let h = xt2.values_mut();
                let (uv, cv) = (xt3.values(), self.cvec.values());
                for i in 0..h.len() {
                    h[i] += uv[i] / cv[i];
                }
            }
        }

        if m > 0 {
            let cols: Vec<&DistVec> = ac.iter().collect();
            xt2.mdot(&cols, &mut zt[..m]);
            for t in zt[..m].iter_mut() {
                *t = -*t;
            }
            let lu = self
                .dmat_lu
                .as_ref()
                .ok_or(KktError::SingularReduced { m })?;
            lu.solve_slice(&mut zt[..m])
                .map_err(|_| KktError::SingularReduced { m })?;
        }

        xt1.copy_from(bx);
        for (i, a) in ac.iter().enumerate() {
            xt1.axpy(zt[i], a);
        }
        if let Some(w) = w {
            {
                let t = xt2.values_mut();
                let (dv, cv) = (xt1.values(), self.cvec.values());
                for i in 0..t.len() {
                    t[i] = dv[i] / cv[i];
                }
            }
            w.apply(xt2, wt1);
            {
                let t = wt1.values_mut();
                let cwv = self.cw.values();
                for j in 0..t.len() {
                    t[j] = -t[j] / cwv[j];
                }
            }
            w.apply_transpose(wt1, xt3);
            {
                let yxv = yx.values_mut();
                let (dv, uv, cv) = (xt1.values(), xt3.values(), self.cvec.values());
                for i in 0..yxv.len() {
                    yxv[i] = (dv[i] + uv[i]) / cv[i];
                }
            }
        } else {
            let yxv = yx.values_mut();
            let (dv, cv) = (xt1.values(), self.cvec.values());
            for i in 0..yxv.len() {
                yxv[i] = dv[i] / cv[i];
            }
        }
        Ok(())
    }

    /// Solve the full KKT system for the Newton step: base diagonal solve,
    /// then the low-rank Woodbury correction when a compact snapshot is
    /// supplied. Requires `factor` (and `factor_schur` when `cm` is given)
    /// at the current iterate. Collective.
    pub fn compute_step(
        &self,
        ws: &mut IpmWorkspace,
        cm: Option<&CompactView<'_>>,
        w: Option<&BandedWeights>,
    ) -> Result<(), KktError> {
        let m = self.ncon;
        let IpmWorkspace {
            rx,
            rc,
            rw,
            rs,
            rzl,
            rzu,
            px,
            pz,
            pzw,
            ps,
            pzl,
            pzu,
            s,
            z,
            zl,
            zu,
            ac,
            dx2,
            dz2,
            dw2,
            ds2,
            dzl2,
            dzu2,
            ucorr,
            zero_x,
            zero_w,
            zero_m,
            scratch,
            ..
        } = ws;

        self.solve_diag(
            scratch, ac, w, s, z, zl, zu, rx, rc, rw, rs, rzl, rzu, px, pz, pzw, ps, pzl, pzu,
        )?;

        let Some(cm) = cm else { return Ok(()) };
        let r = cm.rank();
        if r == 0 {
            return Ok(());
        }
        debug_assert_eq!(r, self.schur_rank, "factor_schur out of date");
        let ce = self
            .ce_lu
            .as_ref()
            .ok_or(KktError::SingularCapacitance { rank: r })?;

        // gamma = C_e^{-1} D0 Z^T px0
        {
            let t = &mut scratch.rz[..r];
            px.mdot(&cm.z, t);
            for (ti, d) in t.iter_mut().zip(cm.d0) {
                *ti *= d;
            }
            ce.solve_slice(t)
                .map_err(|_| KktError::SingularCapacitance { rank: r })?;
        }

        // Fold U gamma back through the diagonal solve and accumulate.
        ucorr.zero();
        for j in 0..r {
            let coeff = cm.d0[j] * scratch.rz[j];
            ucorr.axpy(coeff, cm.z[j]);
        }
        self.solve_diag(
            scratch, ac, w, s, z, zl, zu, ucorr, zero_m, zero_w, zero_m, zero_x, zero_x, dx2, dz2,
            dw2, ds2, dzl2, dzu2,
        )?;

        px.axpy(1.0, dx2);
        pzw.axpy(1.0, dw2);
        pzl.axpy(1.0, dzl2);
        pzu.axpy(1.0, dzu2);
        for i in 0..m {
            pz[i] += dz2[i];
            ps[i] += ds2[i];
        }
        Ok(())
    }
}

/// Substitute the computed step into the six KKT equations, using the full
/// compact Hessian through `mult`, and return the residual infinity norm of
/// each block in order (dual, weighting, inequality, slack complementarity,
/// lower-bound complementarity, upper-bound complementarity). Collective.
pub fn check_kkt_step(
    ws: &mut IpmWorkspace,
    qn: &dyn QuasiNewton,
    w: Option<&BandedWeights>,
) -> [f64; 6] {
    let IpmWorkspace {
        x,
        xl,
        xu,
        s,
        z,
        zl,
        zu,
        ac,
        rx,
        rc,
        rw,
        rs,
        rzl,
        rzu,
        px,
        pz,
        pzw,
        ps,
        pzl,
        pzu,
        scratch,
        ..
    } = ws;
    let m = s.len();
    let KktScratch { xt1, wt1, zt, .. } = scratch;

    // B px - A^T pz - A_w^T pzw - pzl + pzu = rx
    qn.mult(px, xt1);
    for (i, a) in ac.iter().enumerate() {
        xt1.axpy(-pz[i], a);
    }
    if let Some(w) = w {
        w.apply_transpose_add(-1.0, pzw, xt1);
    }
    xt1.axpy(-1.0, pzl);
    xt1.axpy(1.0, pzu);
    xt1.axpy(-1.0, rx);
    let e_dual = xt1.max_abs();

    // A_w px = rw
    if let Some(w) = w {
        w.apply(px, wt1);
    } else {
        wt1.zero();
    }
    wt1.axpy(-1.0, rw);
    let e_weight = wt1.max_abs();

    // A px - ps = rc
    let e_con = if m > 0 {
        let cols: Vec<&DistVec> = ac.iter().collect();
        px.mdot(&cols, &mut zt[..m]);
        (0..m)
            .map(|i| (zt[i] - ps[i] - rc[i]).abs())
            .fold(0.0, f64::max)
    } else {
        0.0
    };

    // S pz + Z ps = rs
    let e_slack = (0..m)
        .map(|i| (s[i] * pz[i] + z[i] * ps[i] - rs[i]).abs())
        .fold(0.0, f64::max);

    // Z_l px + (X-X_l) pzl = rzl on finite lower bounds; pzl = 0 elsewhere.
    {
        let t = xt1.values_mut();
        let (xv, lv) = (x.values(), xl.values());
        let (zlv, pxv, plv, rlv) = (zl.values(), px.values(), pzl.values(), rzl.values());
        for i in 0..t.len() {
            t[i] = if lv[i].is_finite() {
                zlv[i] * pxv[i] + (xv[i] - lv[i]) * plv[i] - rlv[i]
            } else {
                plv[i]
            };
        }
    }
    let e_lower = xt1.max_abs();

    // -Z_u px + (X_u-X) pzu = rzu on finite upper bounds; pzu = 0 elsewhere.
    {
        let t = xt1.values_mut();
        let (xv, uv) = (x.values(), xu.values());
        let (zuv, pxv, puv, ruv) = (zu.values(), px.values(), pzu.values(), rzu.values());
        for i in 0..t.len() {
            t[i] = if uv[i].is_finite() {
                -zuv[i] * pxv[i] + (uv[i] - xv[i]) * puv[i] - ruv[i]
            } else {
                puv[i]
            };
        }
    }
    let e_upper = xt1.max_abs();

    [e_dual, e_weight, e_con, e_slack, e_lower, e_upper]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::qn::{Lbfgs, Lsr1, QuasiNewton};

    const N: usize = 8;
    const M: usize = 2;
    const NW: usize = 2;

    fn weights() -> BandedWeights {
        // rows cover local indices [0,1] and [3,4]
        BandedWeights {
            num_con: NW,
            start: 0,
            width: 2,
            stride: 3,
        }
    }

    /// An interior iterate with a mix of finite and infinite bounds and a
    /// deterministic, non-trivial right-hand side.
    fn setup_state(ws: &mut IpmWorkspace) {
        for i in 0..N {
            let t = i as f64;
            ws.x.values_mut()[i] = 0.5 + 0.1 * t;
            ws.xl.values_mut()[i] = if i % 2 == 0 { 0.0 } else { f64::NEG_INFINITY };
            ws.xu.values_mut()[i] = if i % 3 == 0 { 4.0 + t } else { f64::INFINITY };
            ws.zl.values_mut()[i] = if i % 2 == 0 { 0.3 + 0.05 * t } else { 0.0 };
            ws.zu.values_mut()[i] = if i % 3 == 0 { 0.2 + 0.02 * t } else { 0.0 };
            ws.rx.values_mut()[i] = (0.3 * t).sin();
            ws.rzl.values_mut()[i] = if i % 2 == 0 { 0.1 * (t + 1.0).cos() } else { 0.0 };
            ws.rzu.values_mut()[i] = if i % 3 == 0 { 0.05 * (t - 2.0).sin() } else { 0.0 };
        }
        for i in 0..M {
            ws.s[i] = 1.0 + 0.5 * i as f64;
            ws.z[i] = 0.7 + 0.2 * i as f64;
            ws.rc[i] = 0.4 - 0.3 * i as f64;
            ws.rs[i] = -0.2 + 0.25 * i as f64;
            for k in 0..N {
                ws.ac[i].values_mut()[k] = ((i + 2) as f64 * 0.17 * k as f64).cos();
            }
        }
        for j in 0..ws.nwcon {
            ws.rw.values_mut()[j] = 0.3 * (j as f64 + 1.0);
        }
    }

    fn trained_lbfgs(comm: &crate::comm::CommRef) -> Lbfgs {
        let mut qn = Lbfgs::new(comm, N, 3);
        let pairs = [
            ([1.0, 0.2, 0.0, 0.0, 0.1, 0.0, 0.0, 0.3], [1.4, 0.1, 0.0, 0.1, 0.0, 0.0, 0.1, 0.2]),
            ([0.0, 1.0, 0.1, 0.0, 0.0, 0.2, 0.0, 0.0], [0.1, 0.8, 0.2, 0.0, 0.1, 0.1, 0.0, 0.0]),
        ];
        for (sv, yv) in &pairs {
            let mut s = DistVec::new(comm.clone(), N);
            s.values_mut().copy_from_slice(sv);
            let mut y = DistVec::new(comm.clone(), N);
            y.values_mut().copy_from_slice(yv);
            qn.update(&s, &y);
        }
        qn
    }

    #[test]
    fn test_full_step_satisfies_kkt_equations_bfgs() {
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, N, M, NW, 6);
        setup_state(&mut ws);
        let w = weights();

        let qn = trained_lbfgs(&comm);
        let mut kkt = KktSolver::new(&comm, N, M, NW, 6);

        let b0 = qn.compact().b0;
        kkt.factor(&mut ws, b0, Some(&w)).unwrap();
        let cm = qn.compact();
        kkt.factor_schur(&mut ws, &cm, Some(&w)).unwrap();
        kkt.compute_step(&mut ws, Some(&cm), Some(&w)).unwrap();
        drop(cm);

        let errs = check_kkt_step(&mut ws, &qn, Some(&w));
        for (k, e) in errs.iter().enumerate() {
            assert!(*e < 1e-9, "block {k} residual too large: {e}");
        }
    }

    #[test]
    fn test_full_step_satisfies_kkt_equations_sr1() {
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, N, M, NW, 6);
        setup_state(&mut ws);
        let w = weights();

        let mut qn = Lsr1::new(&comm, N, 3);
        let pairs = [
            ([1.0, 0.0, 0.0, 0.2, 0.0, 0.0, 0.0, 0.0], [2.1, 0.1, 0.0, 0.3, 0.0, 0.1, 0.0, 0.0]),
            ([0.0, 0.0, 1.0, 0.0, 0.0, 0.4, 0.0, 0.1], [0.1, 0.0, 1.6, 0.0, 0.2, 0.5, 0.0, 0.0]),
        ];
        for (sv, yv) in &pairs {
            let mut s = DistVec::new(comm.clone(), N);
            s.values_mut().copy_from_slice(sv);
            let mut y = DistVec::new(comm.clone(), N);
            y.values_mut().copy_from_slice(yv);
            qn.update(&s, &y);
        }
        assert!(qn.compact().rank() > 0);

        let mut kkt = KktSolver::new(&comm, N, M, NW, 6);
        let b0 = qn.compact().b0;
        kkt.factor(&mut ws, b0, Some(&w)).unwrap();
        let cm = qn.compact();
        kkt.factor_schur(&mut ws, &cm, Some(&w)).unwrap();
        kkt.compute_step(&mut ws, Some(&cm), Some(&w)).unwrap();
        drop(cm);

        let errs = check_kkt_step(&mut ws, &qn, Some(&w));
        for (k, e) in errs.iter().enumerate() {
            assert!(*e < 1e-9, "block {k} residual too large: {e}");
        }
    }

    #[test]
    fn test_diagonal_step_without_weights() {
        // Sequential-linear mode (B = b0*I), no weighting block: the
        // diagonal solve alone must satisfy the KKT equations of a reset
        // quasi-Newton model.
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, N, M, 0, 4);
        setup_state(&mut ws);

        let qn = Lbfgs::new(&comm, N, 3); // empty model: B = I
        let mut kkt = KktSolver::new(&comm, N, M, 0, 4);
        kkt.factor(&mut ws, 1.0, None).unwrap();
        kkt.compute_step(&mut ws, None, None).unwrap();

        let errs = check_kkt_step(&mut ws, &qn, None);
        for (k, e) in errs.iter().enumerate() {
            assert!(*e < 1e-10, "block {k} residual too large: {e}");
        }
    }

    #[test]
    fn test_solve_overloads_consistent() {
        // With a bx-only right-hand side the full solve and the x-only
        // solve must produce the same x component.
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, N, M, NW, 4);
        setup_state(&mut ws);
        let w = weights();

        let mut kkt = KktSolver::new(&comm, N, M, NW, 4);
        kkt.factor(&mut ws, 0.8, Some(&w)).unwrap();

        let mut bx = DistVec::new(comm.clone(), N);
        for (i, v) in bx.values_mut().iter_mut().enumerate() {
            *v = (0.4 * i as f64).cos();
        }

        let mut yx_only = DistVec::new(comm.clone(), N);
        kkt.solve_diag_x(&mut ws.scratch, &ws.ac, Some(&w), &bx, &mut yx_only)
            .unwrap();

        let mut yz = vec![0.0; M];
        let mut ys = vec![0.0; M];
        let mut yx = DistVec::new(comm.clone(), N);
        let mut yw = DistVec::new(comm.clone(), NW);
        let mut yzl = DistVec::new(comm.clone(), N);
        let mut yzu = DistVec::new(comm.clone(), N);
        let zero_m = vec![0.0; M];
        let zero_x = DistVec::new(comm.clone(), N);
        let zero_w = DistVec::new(comm, NW);
        kkt.solve_diag(
            &mut ws.scratch,
            &ws.ac,
            Some(&w),
            &ws.s,
            &ws.z,
            &ws.zl,
            &ws.zu,
            &bx,
            &zero_m,
            &zero_w,
            &zero_m,
            &zero_x,
            &zero_x,
            &mut yx,
            &mut yz,
            &mut yw,
            &mut ys,
            &mut yzl,
            &mut yzu,
        )
        .unwrap();

        for (a, b) in yx.values().iter().zip(yx_only.values()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
