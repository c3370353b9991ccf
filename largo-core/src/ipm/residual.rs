//! KKT residual assembly.
//!
//! The residual blocks are stored *negated* so they double as the Newton
//! right-hand side: the step solves K p = r with the bordered matrix of
//! `ipm::kkt`. The three returned norms drive the stopping test and the
//! barrier update.

use crate::comm::ReduceOp;
use crate::ipm::workspace::IpmWorkspace;
use crate::problem::BandedWeights;

/// Infinity norms of the residual blocks.
#[derive(Debug, Clone, Copy)]
pub struct ResNorms {
    /// max(‖rx‖∞, ‖rw‖∞): dual feasibility plus weighting feasibility.
    pub dual: f64,
    /// ‖rc‖∞: inequality primal feasibility.
    pub primal: f64,
    /// max(‖rs‖∞, ‖rzl‖∞, ‖rzu‖∞): perturbed complementarity.
    pub comp: f64,
}

impl ResNorms {
    pub fn max(&self) -> f64 {
        self.dual.max(self.primal).max(self.comp)
    }
}

/// Assemble the negated KKT residuals at the current iterate for barrier
/// parameter `mu` and return their norms. Collective.
pub(crate) fn compute_kkt_res(
    ws: &mut IpmWorkspace,
    w: Option<&BandedWeights>,
    mu: f64,
) -> ResNorms {
    let IpmWorkspace {
        x,
        xl,
        xu,
        zl,
        zu,
        zw,
        s,
        z,
        c,
        g,
        ac,
        bw,
        rx,
        rzl,
        rzu,
        rw,
        rc,
        rs,
        ..
    } = ws;

    // rx = -(g - A^T z - A_w^T zw - zl + zu)
    rx.copy_from(g);
    rx.scale(-1.0);
    for (zi, a) in z.iter().zip(ac.iter()) {
        rx.axpy(*zi, a);
    }
    if let Some(w) = w {
        w.apply_transpose_add(1.0, zw, rx);
    }
    rx.axpy(1.0, zl);
    rx.axpy(-1.0, zu);

    // rw = -(A_w x - b_w)
    if let Some(w) = w {
        w.apply(x, rw);
        rw.scale(-1.0);
        rw.axpy(1.0, bw);
    } else {
        rw.zero();
    }

    // rc = -(c - s),  rs = mu e - S z
    for i in 0..s.len() {
        rc[i] = s[i] - c[i];
        rs[i] = mu - s[i] * z[i];
    }

    // Bound complementarity, gated by finite bounds.
    {
        let (xv, lv, uv) = (x.values(), xl.values(), xu.values());
        let (zlv, zuv) = (zl.values(), zu.values());
        let rlv = rzl.values_mut();
        for i in 0..xv.len() {
            rlv[i] = if lv[i].is_finite() {
                mu - (xv[i] - lv[i]) * zlv[i]
            } else {
                0.0
            };
        }
        let ruv = rzu.values_mut();
        for i in 0..xv.len() {
            ruv[i] = if uv[i].is_finite() {
                mu - (uv[i] - xv[i]) * zuv[i]
            } else {
                0.0
            };
        }
    }

    let dual = rx.max_abs().max(rw.max_abs());
    let primal = rc.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
    let comp = rs
        .iter()
        .fold(0.0_f64, |a, v| a.max(v.abs()))
        .max(rzl.max_abs())
        .max(rzu.max_abs());

    ResNorms { dual, primal, comp }
}

/// Average complementarity product over the inequality slacks and the
/// finite bounds. Collective.
pub(crate) fn compute_comp(ws: &IpmWorkspace) -> f64 {
    let (xv, lv, uv) = (ws.x.values(), ws.xl.values(), ws.xu.values());
    let (zlv, zuv) = (ws.zl.values(), ws.zu.values());

    let mut local = [0.0_f64; 2];
    for i in 0..xv.len() {
        if lv[i].is_finite() {
            local[0] += (xv[i] - lv[i]) * zlv[i];
            local[1] += 1.0;
        }
        if uv[i].is_finite() {
            local[0] += (uv[i] - xv[i]) * zuv[i];
            local[1] += 1.0;
        }
    }
    ws.x.comm().allreduce(&mut local, ReduceOp::Sum);

    let slack: f64 = ws.s.iter().zip(ws.z.iter()).map(|(s, z)| s * z).sum();
    let count = local[1] + ws.s.len() as f64;
    if count > 0.0 {
        (local[0] + slack) / count
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    #[test]
    fn test_unconstrained_residual_is_negated_gradient() {
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, 3, 0, 0, 0);
        ws.xl.fill(f64::NEG_INFINITY);
        ws.xu.fill(f64::INFINITY);
        ws.g.values_mut().copy_from_slice(&[1.0, -2.0, 0.5]);

        let norms = compute_kkt_res(&mut ws, None, 0.1);
        assert_eq!(ws.rx.values(), &[-1.0, 2.0, -0.5]);
        assert_eq!(norms.dual, 2.0);
        assert_eq!(norms.primal, 0.0);
        assert_eq!(norms.comp, 0.0);
    }

    #[test]
    fn test_complementarity_blocks_and_gating() {
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, 2, 1, 0, 0);
        // x0 has a finite lower bound, x1 is free.
        ws.x.values_mut().copy_from_slice(&[1.5, 4.0]);
        ws.xl.values_mut().copy_from_slice(&[1.0, f64::NEG_INFINITY]);
        ws.xu.fill(f64::INFINITY);
        ws.zl.values_mut().copy_from_slice(&[0.4, 0.0]);
        ws.s[0] = 2.0;
        ws.z[0] = 0.25;
        ws.c[0] = 1.0;

        let mu = 0.1;
        let norms = compute_kkt_res(&mut ws, None, mu);

        // rs = mu - s z = 0.1 - 0.5, rc = s - c = 1.0
        assert!((ws.rs[0] + 0.4).abs() < 1e-15);
        assert!((ws.rc[0] - 1.0).abs() < 1e-15);
        // rzl gated: finite bound perturbed, free bound exactly zero
        assert!((ws.rzl.values()[0] - (mu - 0.5 * 0.4)).abs() < 1e-15);
        assert_eq!(ws.rzl.values()[1], 0.0);
        assert!((norms.primal - 1.0).abs() < 1e-15);

        // average complementarity: (s z + (x0-l0) zl0) / 2
        let comp = compute_comp(&ws);
        assert!((comp - (0.5 + 0.2) / 2.0).abs() < 1e-15);
    }
}
