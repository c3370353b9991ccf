//! Interior-point driver.
//!
//! Primal-dual interior-point method for
//!
//! ```text
//! min  f(x)   s.t.  c(x) >= 0,   A_w x = b_w,   x_l <= x <= x_u
//! ```
//!
//! with a compact limited-memory quasi-Newton Hessian. Each major
//! iteration assembles the perturbed KKT residuals, solves the bordered
//! KKT system through the diagonal reduction plus the Woodbury correction,
//! limits the step with the fraction-to-boundary rule, runs a merit-based
//! line search, and folds the Lagrangian-corrected pair back into the
//! quasi-Newton model. Recoverable numerical failures (singular
//! capacitance, exhausted line search) reset the quasi-Newton memory and
//! continue; everything the caller needs to know lands in the returned
//! status.

pub mod kkt;
pub mod residual;
pub mod step;
pub mod workspace;

use crate::comm::{CommRef, ReduceOp};
use crate::ipm::kkt::{check_kkt_step, KktError, KktSolver};
use crate::ipm::residual::{compute_comp, compute_kkt_res, ResNorms};
use crate::ipm::step::{line_search, max_step, merit_init_deriv};
use crate::ipm::workspace::IpmWorkspace;
use crate::linalg::vector::VecIoError;
use crate::problem::{
    BandedWeights, IterRecord, OptProblem, ProblemError, QnKind, SolveInfo, SolveResult,
    SolveStatus, SolverSettings,
};
use crate::qn::{Lbfgs, Lsr1, QnUpdateKind, QuasiNewton};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;
use thiserror::Error;

/// Fatal optimizer errors. Recoverable conditions are absorbed into the
/// [`SolveStatus`] of [`InteriorPoint::optimize`] instead.
#[derive(Debug, Error)]
pub enum OptError {
    /// The starting point is not strictly interior.
    #[error("starting point violates strict interior requirements")]
    InteriorViolation,

    /// The weighting pattern does not fit the local variable slice.
    #[error("invalid weighting pattern for the local variable slice")]
    InvalidWeightPattern,

    /// The oracle failed hard (no values produced).
    #[error(transparent)]
    Problem(#[from] ProblemError),

    /// Solution file I/O failed.
    #[error("solution file I/O failed: {0}")]
    SolutionIo(#[from] VecIoError),

    /// The iteration output file could not be opened.
    #[error("output file could not be opened: {0}")]
    OutputFile(#[from] std::io::Error),
}

/// The parallel interior-point optimizer.
pub struct InteriorPoint<P: OptProblem> {
    comm: CommRef,
    problem: P,
    weights: Option<BandedWeights>,
    settings: SolverSettings,
    qn: Box<dyn QuasiNewton>,
    ws: IpmWorkspace,
    kkt: KktSolver,
    out: Option<BufWriter<File>>,

    mu: f64,
    rho: f64,
    neval: usize,
    ngeval: usize,
    qn_updates: usize,
    qn_damped: usize,
}

impl<P: OptProblem> InteriorPoint<P> {
    /// Create an optimizer for `n_local` locally owned variables.
    /// All vector storage is allocated here; `optimize` performs no
    /// vector-sized allocation.
    pub fn new(
        comm: CommRef,
        n_local: usize,
        problem: P,
        settings: SolverSettings,
    ) -> Result<Self, OptError> {
        let ncon = problem.num_inequalities();
        let weights = problem.weight_pattern();
        if let Some(w) = &weights {
            if !w.validate(n_local) {
                return Err(OptError::InvalidWeightPattern);
            }
        }
        let nwcon = weights.map_or(0, |w| w.num_con);

        let qn: Box<dyn QuasiNewton> = match settings.qn_kind {
            QnKind::Bfgs => Box::new(Lbfgs::new(&comm, n_local, settings.qn_subspace)),
            QnKind::Sr1 => Box::new(Lsr1::new(&comm, n_local, settings.qn_subspace)),
        };
        // BFGS exposes two compact columns per retained pair.
        let qn_cap = match settings.qn_kind {
            QnKind::Bfgs => 2 * settings.qn_subspace,
            QnKind::Sr1 => settings.qn_subspace,
        };

        let mut ws = IpmWorkspace::new(&comm, n_local, ncon, nwcon, qn_cap);
        if weights.is_some() {
            problem.weight_rhs(&mut ws.bw);
        }
        let kkt = KktSolver::new(&comm, n_local, ncon, nwcon, qn_cap);

        let out = match &settings.output_file {
            Some(path) if comm.rank() == 0 => Some(BufWriter::new(File::create(path)?)),
            _ => None,
        };

        Ok(Self {
            comm,
            problem,
            weights,
            settings,
            qn,
            ws,
            kkt,
            out,
            mu: 0.0,
            rho: 0.0,
            neval: 0,
            ngeval: 0,
            qn_updates: 0,
            qn_damped: 0,
        })
    }

    /// Final design variables.
    pub fn x(&self) -> &crate::linalg::vector::DistVec {
        &self.ws.x
    }

    /// Bound multipliers (lower, upper).
    pub fn bound_multipliers(
        &self,
    ) -> (
        &crate::linalg::vector::DistVec,
        &crate::linalg::vector::DistVec,
    ) {
        (&self.ws.zl, &self.ws.zu)
    }

    /// Inequality multipliers.
    pub fn ineq_multipliers(&self) -> &[f64] {
        &self.ws.z
    }

    /// Multipliers of the sparse weighting constraints.
    pub fn weight_multipliers(&self) -> &crate::linalg::vector::DistVec {
        &self.ws.zw
    }

    /// Objective value at the current iterate.
    pub fn objective(&self) -> f64 {
        self.ws.fobj
    }

    /// Write the design variables as fixed native-format records.
    /// Collective.
    pub fn write_solution_file(&self, path: &str) -> Result<(), OptError> {
        self.ws.x.write_to_file(path)?;
        Ok(())
    }

    /// Read the design variables back; requires the identical partitioning
    /// the file was written with. Collective.
    pub fn read_solution_file(&mut self, path: &str) -> Result<(), OptError> {
        self.ws.x.read_from_file(path)?;
        Ok(())
    }

    /// Run the optimization. `checkpoint` names a solution file that is
    /// rewritten every `write_output_frequency` major iterations and at
    /// exit. Collective.
    pub fn optimize(&mut self, checkpoint: Option<&str>) -> Result<SolveResult, OptError> {
        let start = Instant::now();
        self.initialize()?;

        let tol = self.settings.abs_res_tol;
        let max_iters = self.settings.max_major_iters;
        let tau = self.settings.min_fraction_to_boundary;
        let eta = self.settings.penalty_descent_fraction;
        let slp = self.settings.sequential_linear_method;
        let weights = self.weights;
        let w = weights.as_ref();

        let mut history: Vec<IterRecord> = Vec::new();
        let mut status = SolveStatus::MaxIterations;
        let mut iterations = max_iters;
        let mut last_alpha = 0.0;
        let mut ls_exhausted_streak = 0usize;
        let mut last_norms = ResNorms {
            dual: f64::INFINITY,
            primal: f64::INFINITY,
            comp: f64::INFINITY,
        };

        self.log_header();

        for k in 0..max_iters {
            // Residuals and norms at the current point and barrier.
            let mut norms = compute_kkt_res(&mut self.ws, w, self.mu);
            let comp_avg = compute_comp(&self.ws);
            last_norms = norms;

            let rec = IterRecord {
                iter: k,
                fobj: self.ws.fobj,
                mu: self.mu,
                rho: self.rho,
                alpha: last_alpha,
                dual_res: norms.dual,
                primal_res: norms.primal,
                comp_res: norms.comp,
                comp_avg,
            };
            self.log_line(&rec);
            history.push(rec);

            if let Some(path) = checkpoint {
                let freq = self.settings.write_output_frequency;
                if freq > 0 && k % freq == 0 && self.ws.x.write_to_file(path).is_err() {
                    self.log_note("checkpoint write failed");
                }
            }

            // Converged only once the barrier itself is small: the
            // complementarity blocks are perturbed by mu.
            if norms.max() <= tol && self.mu <= 0.1 * tol {
                status = SolveStatus::Converged;
                iterations = k;
                break;
            }

            // Monotone barrier decrease once the residuals at the current
            // barrier are resolved, then refresh the residuals.
            if k > 0 && norms.max() < 10.0 * self.mu {
                let mu = self.mu;
                self.mu = (self.settings.monotone_barrier_fraction * mu)
                    .min(mu.powf(self.settings.monotone_barrier_power));
                norms = compute_kkt_res(&mut self.ws, w, self.mu);
                last_norms = norms;
            }

            // Factor the diagonal reduction and solve for the Newton step,
            // folding in the quasi-Newton low rank via Woodbury. A singular
            // capacitance resets the memory and retries with B = b0*I.
            let b0 = self.qn.compact().b0;
            if self.kkt.factor(&mut self.ws, b0, w).is_err() {
                status = SolveStatus::NumericalError;
                iterations = k + 1;
                break;
            }

            let mut stepped = false;
            let mut numerical_failure = false;
            if !slp {
                let cm = self.qn.compact();
                if cm.rank() > 0 {
                    let solved = self
                        .kkt
                        .factor_schur(&mut self.ws, &cm, w)
                        .and_then(|()| self.kkt.compute_step(&mut self.ws, Some(&cm), w));
                    match solved {
                        Ok(()) => stepped = true,
                        Err(KktError::SingularCapacitance { .. }) => {}
                        Err(KktError::SingularReduced { .. }) => numerical_failure = true,
                    }
                }
            }
            if !stepped && !numerical_failure {
                if !slp && self.qn.subspace_size() > 0 {
                    self.log_note("singular capacitance: resetting quasi-Newton memory");
                    self.qn.reset();
                    if self.kkt.factor(&mut self.ws, 1.0, w).is_err() {
                        numerical_failure = true;
                    }
                }
                if !numerical_failure && self.kkt.compute_step(&mut self.ws, None, w).is_err() {
                    numerical_failure = true;
                }
            }
            if numerical_failure {
                status = SolveStatus::NumericalError;
                iterations = k + 1;
                break;
            }

            if self.settings.major_iter_step_check == Some(k) {
                let errs = check_kkt_step(&mut self.ws, &*self.qn, w);
                self.log_note(&format!(
                    "step check: dual {:9.2e} weight {:9.2e} con {:9.2e} slack {:9.2e} \
                     lower {:9.2e} upper {:9.2e}",
                    errs[0], errs[1], errs[2], errs[3], errs[4], errs[5]
                ));
            }

            // Fraction-to-boundary: scale the primal and dual step blocks.
            let (amax_x, amax_z) = max_step(&self.ws, tau);
            self.ws.px.scale(amax_x);
            for p in self.ws.ps.iter_mut() {
                *p *= amax_x;
            }
            self.ws.pzw.scale(amax_z);
            self.ws.pzl.scale(amax_z);
            self.ws.pzu.scale(amax_z);
            for p in self.ws.pz.iter_mut() {
                *p *= amax_z;
            }

            // Merit derivative and penalty update, then the line search.
            let (m0, dm0) = merit_init_deriv(&mut self.ws, self.mu, eta, amax_x, &mut self.rho, w);
            let ls = line_search(
                &mut self.problem,
                &mut self.ws,
                &self.settings,
                self.mu,
                self.rho,
                m0,
                dm0,
                w,
            )?;
            self.neval += ls.nevals;
            last_alpha = ls.alpha;

            // Dual step (z_w is unrestricted; the others were kept positive
            // by the fraction-to-boundary rule).
            {
                let ws = &mut self.ws;
                for i in 0..ws.z.len() {
                    ws.z[i] += ls.alpha * ws.pz[i];
                }
                let alpha = ls.alpha;
                ws.zw.axpy(alpha, &ws.pzw);
                ws.zl.axpy(alpha, &ws.pzl);
                ws.zu.axpy(alpha, &ws.pzu);
            }

            // Quasi-Newton pair with Lagrangian correction:
            // y = grad L(x+, z+) - grad L(x, z+) over the old/new gradients.
            {
                let ws = &mut self.ws;
                ws.s_qn.copy_from(&ws.px);
                ws.s_qn.scale(ls.alpha);
                ws.y_qn.copy_from(&ws.g);
                ws.y_qn.scale(-1.0);
                for (zi, a) in ws.z.iter().zip(ws.ac.iter()) {
                    ws.y_qn.axpy(*zi, a);
                }
            }
            self.problem
                .eval_grad(&self.ws.x, &mut self.ws.g, &mut self.ws.ac)?;
            self.ngeval += 1;
            if !self.ws.g.max_abs().is_finite() {
                status = SolveStatus::NumericalError;
                iterations = k + 1;
                break;
            }
            {
                let ws = &mut self.ws;
                ws.y_qn.axpy(1.0, &ws.g);
                for (zi, a) in ws.z.iter().zip(ws.ac.iter()) {
                    ws.y_qn.axpy(-*zi, a);
                }
            }

            if ls.failed {
                ls_exhausted_streak += 1;
                if ls_exhausted_streak >= 2 {
                    status = SolveStatus::LineSearchFailure;
                    iterations = k + 1;
                    break;
                }
                // Damped step taken anyway; start the curvature history over.
                self.log_note("line search exhausted: resetting quasi-Newton memory");
                self.qn.reset();
            } else {
                ls_exhausted_streak = 0;
                if !slp {
                    let kind = self.qn.update(&self.ws.s_qn, &self.ws.y_qn);
                    self.qn_updates += 1;
                    if kind == QnUpdateKind::Damped {
                        self.qn_damped += 1;
                    }
                }
            }
        }

        if let Some(path) = checkpoint {
            if self.ws.x.write_to_file(path).is_err() {
                self.log_note("final checkpoint write failed");
            }
        }
        self.log_note(&format!("status: {status:?}"));
        if let Some(out) = &mut self.out {
            let _ = out.flush();
        }

        Ok(SolveResult {
            status,
            fobj: self.ws.fobj,
            iterations,
            dual_res: last_norms.dual,
            primal_res: last_norms.primal,
            comp_res: last_norms.comp,
            barrier_mu: self.mu,
            info: SolveInfo {
                neval: self.neval,
                ngeval: self.ngeval,
                qn_updates: self.qn_updates,
                qn_damped: self.qn_damped,
                solve_time_ms: start.elapsed().as_millis() as u64,
            },
            history,
        })
    }

    /// Compare the oracle gradients against a forward difference along a
    /// fixed direction. Diagnostic output goes through the iteration log.
    /// Collective.
    pub fn check_gradients(&mut self, dh: f64) -> Result<(), OptError> {
        let m = self.ws.ncon;

        // Deterministic direction, independent of the partitioning.
        let counts = self.comm.allgather_usize(self.ws.n_local);
        let offset: usize = counts[..self.comm.rank()].iter().sum();
        for (i, p) in self.ws.px.values_mut().iter_mut().enumerate() {
            *p = (0.02 * (offset + i) as f64).cos();
        }

        let f0 = self.problem.eval_obj_con(&self.ws.x, &mut self.ws.c)?;
        self.problem
            .eval_grad(&self.ws.x, &mut self.ws.g, &mut self.ws.ac)?;
        let exact = self.ws.g.dot(&self.ws.px);
        let mut exact_con = vec![0.0; m];
        {
            let cols: Vec<&crate::linalg::vector::DistVec> = self.ws.ac.iter().collect();
            self.ws.px.mdot(&cols, &mut exact_con);
        }

        self.ws.xtrial.copy_from(&self.ws.x);
        self.ws.xtrial.axpy(dh, &self.ws.px);
        let f1 = self
            .problem
            .eval_obj_con(&self.ws.xtrial, &mut self.ws.ctrial)?;
        self.neval += 2;
        self.ngeval += 1;

        self.log_note(&format!(
            "gradient check: objective fd {:16.9e} exact {:16.9e} err {:9.2e}",
            (f1 - f0) / dh,
            exact,
            ((f1 - f0) / dh - exact).abs()
        ));
        for i in 0..m {
            let fd = (self.ws.ctrial[i] - self.ws.c[i]) / dh;
            self.log_note(&format!(
                "gradient check: con[{i}] fd {:16.9e} exact {:16.9e} err {:9.2e}",
                fd,
                exact_con[i],
                (fd - exact_con[i]).abs()
            ));
        }
        Ok(())
    }

    /// Starting point, interior push, dual initialization and the first
    /// oracle evaluations.
    fn initialize(&mut self) -> Result<(), OptError> {
        self.problem
            .initial_point(&mut self.ws.x, &mut self.ws.xl, &mut self.ws.xu);

        if self.settings.init_starting_point {
            let ws = &mut self.ws;
            let (lv, uv) = (ws.xl.values(), ws.xu.values());
            let xs = ws.x.values_mut();
            for i in 0..xs.len() {
                let (li, ui) = (lv[i], uv[i]);
                if li.is_finite() && ui.is_finite() {
                    let margin = 0.01 * (ui - li);
                    xs[i] = xs[i].clamp(li + margin, ui - margin);
                } else if li.is_finite() {
                    let margin = 0.01 * (1.0 + li.abs());
                    if xs[i] < li + margin {
                        xs[i] = li + margin;
                    }
                } else if ui.is_finite() {
                    let margin = 0.01 * (1.0 + ui.abs());
                    if xs[i] > ui - margin {
                        xs[i] = ui - margin;
                    }
                }
            }
        }

        if self.interior_violated() {
            return Err(OptError::InteriorViolation);
        }

        self.ws.fobj = self.problem.eval_obj_con(&self.ws.x, &mut self.ws.c)?;
        self.problem
            .eval_grad(&self.ws.x, &mut self.ws.g, &mut self.ws.ac)?;
        self.neval += 1;
        self.ngeval += 1;

        {
            let ws = &mut self.ws;
            for i in 0..ws.s.len() {
                ws.s[i] = ws.c[i].max(1.0);
                ws.z[i] = 1.0;
            }
            let (lv, uv) = (ws.xl.values(), ws.xu.values());
            let zlv = ws.zl.values_mut();
            for i in 0..lv.len() {
                zlv[i] = if lv[i].is_finite() { 1.0 } else { 0.0 };
            }
            let zuv = ws.zu.values_mut();
            for i in 0..uv.len() {
                zuv[i] = if uv[i].is_finite() { 1.0 } else { 0.0 };
            }
            ws.zw.zero();
        }

        self.mu = self.settings.barrier_param;
        self.rho = 0.0;
        Ok(())
    }

    /// Strict interior check on the starting point. Collective, so every
    /// rank agrees on the verdict.
    fn interior_violated(&self) -> bool {
        let mut flag = 0.0_f64;
        let (xv, lv, uv) = (
            self.ws.x.values(),
            self.ws.xl.values(),
            self.ws.xu.values(),
        );
        for i in 0..xv.len() {
            if !xv[i].is_finite()
                || (lv[i].is_finite() && xv[i] <= lv[i])
                || (uv[i].is_finite() && xv[i] >= uv[i])
            {
                flag = 1.0;
            }
        }
        self.comm.allreduce_scalar(flag, ReduceOp::Max) > 0.0
    }

    fn log_header(&mut self) {
        if self.comm.rank() != 0 {
            return;
        }
        let line = format!(
            "{:>4} {:>5} {:>5} {:>16} {:>9} {:>9} {:>7} {:>9} {:>9} {:>9}",
            "iter", "nobj", "ngrd", "fobj", "mu", "rho", "alpha", "dual", "primal", "comp"
        );
        if self.settings.verbose {
            println!("{line}");
        }
        if let Some(out) = &mut self.out {
            let _ = writeln!(out, "{line}");
        }
    }

    fn log_line(&mut self, rec: &IterRecord) {
        if self.comm.rank() != 0 {
            return;
        }
        let line = format!(
            "{:>4} {:>5} {:>5} {:>16.9e} {:>9.2e} {:>9.2e} {:>7.4} {:>9.2e} {:>9.2e} {:>9.2e}",
            rec.iter,
            self.neval,
            self.ngeval,
            rec.fobj,
            rec.mu,
            rec.rho,
            rec.alpha,
            rec.dual_res,
            rec.primal_res,
            rec.comp_res
        );
        if self.settings.verbose {
            println!("{line}");
        }
        if let Some(out) = &mut self.out {
            let _ = writeln!(out, "{line}");
        }
    }

    fn log_note(&mut self, note: &str) {
        if self.comm.rank() != 0 {
            return;
        }
        if self.settings.verbose {
            println!("{note}");
        }
        if let Some(out) = &mut self.out {
            let _ = writeln!(out, "{note}");
        }
    }
}
