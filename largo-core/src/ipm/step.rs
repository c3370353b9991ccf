//! Fraction-to-boundary, merit function and line search.

use crate::comm::{CommRef, ReduceOp};
use crate::ipm::workspace::IpmWorkspace;
use crate::linalg::vector::DistVec;
use crate::problem::{BandedWeights, OptProblem, ProblemError, SolverSettings};

/// Largest primal and dual steps in (0, 1] that keep the iterate strictly
/// interior, already scaled by the fraction-to-boundary factor `tau`.
/// The ratio test makes the result invariant to positive scaling of the
/// direction. Collective (one reduction).
pub(crate) fn max_step(ws: &IpmWorkspace, tau: f64) -> (f64, f64) {
    let mut alpha = [1.0_f64, 1.0_f64];

    // Primal: bounds on x, positivity of s.
    {
        let (xv, lv, uv) = (ws.x.values(), ws.xl.values(), ws.xu.values());
        let pxv = ws.px.values();
        for i in 0..xv.len() {
            if pxv[i] < 0.0 && lv[i].is_finite() {
                alpha[0] = alpha[0].min(-tau * (xv[i] - lv[i]) / pxv[i]);
            } else if pxv[i] > 0.0 && uv[i].is_finite() {
                alpha[0] = alpha[0].min(tau * (uv[i] - xv[i]) / pxv[i]);
            }
        }
        for (s, ps) in ws.s.iter().zip(ws.ps.iter()) {
            if *ps < 0.0 {
                alpha[0] = alpha[0].min(-tau * s / ps);
            }
        }
    }

    // Dual: positivity of z, z_l, z_u; z_w is unrestricted.
    {
        for (z, pz) in ws.z.iter().zip(ws.pz.iter()) {
            if *pz < 0.0 {
                alpha[1] = alpha[1].min(-tau * z / pz);
            }
        }
        let (lv, uv) = (ws.xl.values(), ws.xu.values());
        let (zlv, zuv) = (ws.zl.values(), ws.zu.values());
        let (plv, puv) = (ws.pzl.values(), ws.pzu.values());
        for i in 0..zlv.len() {
            if lv[i].is_finite() && plv[i] < 0.0 {
                alpha[1] = alpha[1].min(-tau * zlv[i] / plv[i]);
            }
            if uv[i].is_finite() && puv[i] < 0.0 {
                alpha[1] = alpha[1].min(-tau * zuv[i] / puv[i]);
            }
        }
    }

    ws.x.comm().allreduce(&mut alpha, ReduceOp::Min);
    (alpha[0], alpha[1])
}

/// Evaluate the merit function
///
/// ```text
/// phi = f - mu*sum log(s) - mu*sum log(x-xl) - mu*sum log(xu-x)
///       + rho*( |A_w x - b_w|_1 + |c - s|_1 )
/// ```
///
/// at a candidate point. Returns +inf when the point is outside the strict
/// interior or the objective is not finite, which the line search treats
/// as a rejection. Collective (one batched reduction).
#[allow(clippy::too_many_arguments)]
pub(crate) fn eval_merit(
    comm: &CommRef,
    x: &DistVec,
    xl: &DistVec,
    xu: &DistVec,
    svals: &[f64],
    cvals: &[f64],
    fobj: f64,
    mu: f64,
    rho: f64,
    w: Option<&BandedWeights>,
    bw: &DistVec,
    wtmp: &mut DistVec,
) -> f64 {
    // Slack barrier (replicated).
    let mut bar_s = 0.0;
    for s in svals {
        if *s <= 0.0 {
            bar_s = f64::NAN;
            break;
        }
        bar_s += s.ln();
    }

    // Bound barrier and weighting infeasibility (one reduction; NaN marks
    // an interior violation and survives the sum).
    let mut local = [0.0_f64, 0.0_f64];
    {
        let (xv, lv, uv) = (x.values(), xl.values(), xu.values());
        for i in 0..xv.len() {
            if lv[i].is_finite() {
                let d = xv[i] - lv[i];
                local[0] += if d > 0.0 { d.ln() } else { f64::NAN };
            }
            if uv[i].is_finite() {
                let d = uv[i] - xv[i];
                local[0] += if d > 0.0 { d.ln() } else { f64::NAN };
            }
        }
    }
    if let Some(w) = w {
        w.apply(x, wtmp);
        for (t, b) in wtmp.values().iter().zip(bw.values()) {
            local[1] += (t - b).abs();
        }
    }
    comm.allreduce(&mut local, ReduceOp::Sum);

    let cs_l1: f64 = cvals
        .iter()
        .zip(svals.iter())
        .map(|(c, s)| (c - s).abs())
        .sum();

    let merit = fobj - mu * bar_s - mu * local[0] + rho * (local[1] + cs_l1);
    if merit.is_finite() {
        merit
    } else {
        f64::INFINITY
    }
}

/// Merit value and directional derivative along the scaled step at the
/// current iterate, growing the penalty parameter so the derivative
/// provides at least the `eta` fraction of the infeasibility descent:
/// the smallest rho with `Dphi <= -eta * rho * descent` is taken.
/// `alpha_x` is the primal fraction-to-boundary scaling already applied to
/// the step. Collective (one batched reduction).
pub(crate) fn merit_init_deriv(
    ws: &mut IpmWorkspace,
    mu: f64,
    eta: f64,
    alpha_x: f64,
    rho: &mut f64,
    w: Option<&BandedWeights>,
) -> (f64, f64) {
    // Batched local sums:
    //   [0] bound barrier  sum log(x-xl) + log(xu-x)
    //   [1] its derivative sum px/(x-xl) - px/(xu-x)
    //   [2] weighting infeasibility |A_w x - b_w|_1
    //   [3] g . px
    let mut local = [0.0_f64; 4];
    {
        let (xv, lv, uv) = (ws.x.values(), ws.xl.values(), ws.xu.values());
        let pxv = ws.px.values();
        for i in 0..xv.len() {
            if lv[i].is_finite() {
                let d = xv[i] - lv[i];
                local[0] += d.ln();
                local[1] += pxv[i] / d;
            }
            if uv[i].is_finite() {
                let d = uv[i] - xv[i];
                local[0] += d.ln();
                local[1] -= pxv[i] / d;
            }
        }
        local[3] = ws
            .g
            .values()
            .iter()
            .zip(pxv.iter())
            .map(|(g, p)| g * p)
            .sum();
    }
    if let Some(w) = w {
        w.apply(&ws.x, &mut ws.scratch.wt1);
        for (t, b) in ws.scratch.wt1.values().iter().zip(ws.bw.values()) {
            local[2] += (t - b).abs();
        }
    }
    ws.x.comm().allreduce(&mut local, ReduceOp::Sum);

    // Replicated parts.
    let mut bar_s = 0.0;
    let mut dbar_s = 0.0;
    for (s, ps) in ws.s.iter().zip(ws.ps.iter()) {
        bar_s += s.ln();
        dbar_s += ps / s;
    }
    let cs_l1: f64 = ws
        .c
        .iter()
        .zip(ws.s.iter())
        .map(|(c, s)| (c - s).abs())
        .sum();

    let infeas = local[2] + cs_l1;
    let dbar = local[3] - mu * dbar_s - mu * local[1];

    // The linearized infeasibility contracts at the rate alpha_x * infeas.
    let descent = alpha_x * infeas;
    if descent > 1e-14 && dbar > (1.0 - eta) * *rho * descent {
        *rho = dbar / ((1.0 - eta) * descent);
    }

    let m0 = ws.fobj - mu * bar_s - mu * local[0] + *rho * infeas;
    let dm0 = dbar - *rho * descent;
    (m0, dm0)
}

/// Outcome of one line search.
pub(crate) struct LineSearchResult {
    pub alpha: f64,
    pub failed: bool,
    pub nevals: usize,
}

/// Backtracking Armijo search along the pre-scaled step, committing the
/// accepted point (x, s, c, f) into the workspace. A non-finite trial
/// merit rejects the trial like an overshoot. With backtracking disabled
/// the first trial is taken and the merit check is advisory.
pub(crate) fn line_search<P: OptProblem>(
    problem: &mut P,
    ws: &mut IpmWorkspace,
    settings: &SolverSettings,
    mu: f64,
    rho: f64,
    m0: f64,
    dm0: f64,
    w: Option<&BandedWeights>,
) -> Result<LineSearchResult, ProblemError> {
    let c1 = settings.armijio_constant;
    let backtracking = settings.use_line_search && settings.use_backtracking_alpha;
    let max_iters = if backtracking {
        settings.max_line_iters.max(1)
    } else {
        1
    };

    let comm = ws.x.comm().clone();
    let mut alpha = 1.0;
    let mut accepted = false;
    let mut nevals = 0;
    let mut ftrial = ws.fobj;

    for iter in 0..max_iters {
        ws.xtrial.copy_from(&ws.x);
        ws.xtrial.axpy(alpha, &ws.px);
        for i in 0..ws.strial.len() {
            ws.strial[i] = ws.s[i] + alpha * ws.ps[i];
        }

        ftrial = problem.eval_obj_con(&ws.xtrial, &mut ws.ctrial)?;
        nevals += 1;

        let merit = eval_merit(
            &comm,
            &ws.xtrial,
            &ws.xl,
            &ws.xu,
            &ws.strial,
            &ws.ctrial,
            ftrial,
            mu,
            rho,
            w,
            &ws.bw,
            &mut ws.scratch.wt1,
        );

        if !backtracking || (merit.is_finite() && merit <= m0 + c1 * alpha * dm0) {
            accepted = true;
            break;
        }
        if iter + 1 < max_iters {
            alpha *= 0.5;
        }
    }

    // On exhaustion the last damped trial is taken anyway; the caller
    // decides whether repeated exhaustion is fatal.
    ws.x.copy_from(&ws.xtrial);
    ws.s.copy_from_slice(&ws.strial);
    ws.c.copy_from_slice(&ws.ctrial);
    ws.fobj = ftrial;

    Ok(LineSearchResult {
        alpha,
        failed: !accepted,
        nevals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    fn interior_ws(n: usize) -> IpmWorkspace {
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, n, 0, 0, 0);
        ws.xl.fill(0.0);
        ws.xu.fill(2.0);
        ws.x.fill(1.0);
        ws.zl.fill(0.5);
        ws.zu.fill(0.5);
        ws
    }

    #[test]
    fn test_max_step_interior_direction_is_one() {
        let mut ws = interior_ws(4);
        ws.px.fill(0.1);
        ws.pzl.fill(0.2);
        ws.pzu.fill(0.0);
        let (ax, az) = max_step(&ws, 0.95);
        assert_eq!(ax, 1.0);
        assert_eq!(az, 1.0);
    }

    #[test]
    fn test_max_step_ratio_and_scaling_invariance() {
        let mut ws = interior_ws(3);
        // x = 1, lower bound 0: a step of -2 hits the bound at alpha = 0.5.
        ws.px.values_mut().copy_from_slice(&[-2.0, 0.1, 0.1]);
        let tau = 0.95;
        let (ax, _) = max_step(&ws, tau);
        assert!((ax - tau * 0.5).abs() < 1e-14);

        // Scaling the direction by 4 scales the step back by 4.
        ws.px.scale(4.0);
        let (ax4, _) = max_step(&ws, tau);
        assert!((ax4 - ax / 4.0).abs() < 1e-14);
    }

    #[test]
    fn test_max_step_dual_blocks() {
        let mut ws = interior_ws(2);
        ws.px.fill(0.0);
        // zl = 0.5 with step -1: ratio 0.5
        ws.pzl.values_mut().copy_from_slice(&[-1.0, 0.0]);
        ws.pzu.fill(0.25);
        let (ax, az) = max_step(&ws, 1.0);
        assert_eq!(ax, 1.0);
        assert!((az - 0.5).abs() < 1e-14);
    }

    #[test]
    fn test_merit_rejects_exterior_point() {
        let comm = SerialComm::new();
        let ws = interior_ws(2);
        let mut wtmp = DistVec::new(comm.clone(), 0);

        // Outside the box: merit is +inf.
        let mut xbad = ws.x.clone();
        xbad.values_mut()[0] = -0.5;
        let merit = eval_merit(
            &comm, &xbad, &ws.xl, &ws.xu, &[], &[], 1.0, 0.1, 1.0, None, &ws.bw, &mut wtmp,
        );
        assert!(merit.is_infinite());

        // Interior point: finite, equals f - mu * sum of the gap logs.
        let merit = eval_merit(
            &comm, &ws.x, &ws.xl, &ws.xu, &[], &[], 1.0, 0.1, 1.0, None, &ws.bw, &mut wtmp,
        );
        assert!((merit - 1.0).abs() < 1e-14); // log(1) terms vanish
    }

    #[test]
    fn test_penalty_grows_to_descent_fraction() {
        let comm = SerialComm::new();
        let mut ws = IpmWorkspace::new(&comm, 2, 1, 0, 0);
        ws.xl.fill(f64::NEG_INFINITY);
        ws.xu.fill(f64::INFINITY);
        ws.x.fill(1.0);
        // Ascent direction for the objective with primal infeasibility:
        // rho must grow until the merit derivative turns negative enough.
        ws.g.values_mut().copy_from_slice(&[1.0, 1.0]);
        ws.px.values_mut().copy_from_slice(&[1.0, 1.0]);
        ws.s[0] = 1.0;
        ws.ps[0] = 0.0;
        ws.c[0] = 3.0; // |c - s| = 2
        ws.fobj = 0.0;

        let eta = 0.3;
        let mut rho = 0.0;
        let (_, dm0) = merit_init_deriv(&mut ws, 0.0, eta, 1.0, &mut rho, None);
        assert!(rho > 0.0);
        let infeas = 2.0;
        assert!(dm0 <= -eta * rho * infeas + 1e-12);
    }
}
