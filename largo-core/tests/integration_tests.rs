//! End-to-end tests for the interior-point optimizer.
//!
//! These drive the full pipeline (residuals, Woodbury KKT solve,
//! fraction-to-boundary, merit line search, quasi-Newton updates) on small
//! convex problems with known solutions, in serial and across in-process
//! ranks.

use largo_core::{
    BandedWeights, CommRef, Communicator, DistVec, InteriorPoint, OptProblem, ProblemError,
    QnKind, ReduceOp, SolveResult, SolveStatus, SolverSettings, ThreadComm,
};
use std::sync::Arc;

/// Separable convex quadratic f(x) = 1/2 sum (x_i - t_i)^2 with an
/// optional uniform lower bound. Each rank owns a slice of the targets.
struct TargetQp {
    comm: CommRef,
    targets: Vec<f64>,
    lower: Option<f64>,
    start: f64,
}

impl OptProblem for TargetQp {
    fn num_inequalities(&self) -> usize {
        0
    }

    fn initial_point(&self, x: &mut DistVec, xl: &mut DistVec, xu: &mut DistVec) {
        x.fill(self.start);
        match self.lower {
            Some(l) => xl.fill(l),
            None => xl.fill(f64::NEG_INFINITY),
        }
        xu.fill(f64::INFINITY);
    }

    fn eval_obj_con(&mut self, x: &DistVec, _c: &mut [f64]) -> Result<f64, ProblemError> {
        let local: f64 = x
            .values()
            .iter()
            .zip(&self.targets)
            .map(|(x, t)| 0.5 * (x - t) * (x - t))
            .sum();
        Ok(self.comm.allreduce_scalar(local, ReduceOp::Sum))
    }

    fn eval_grad(
        &mut self,
        x: &DistVec,
        g: &mut DistVec,
        _a: &mut [DistVec],
    ) -> Result<(), ProblemError> {
        for (g, (x, t)) in g
            .values_mut()
            .iter_mut()
            .zip(x.values().iter().zip(&self.targets))
        {
            *g = x - t;
        }
        Ok(())
    }
}

/// min 1/2 ||x||^2  s.t.  x_0 + x_1 >= 1. Solution x = (1/2, 1/2), z = 1/2.
struct HalfspaceQp;

impl OptProblem for HalfspaceQp {
    fn num_inequalities(&self) -> usize {
        1
    }

    fn initial_point(&self, x: &mut DistVec, xl: &mut DistVec, xu: &mut DistVec) {
        x.fill(2.0);
        xl.fill(f64::NEG_INFINITY);
        xu.fill(f64::INFINITY);
    }

    fn eval_obj_con(&mut self, x: &DistVec, c: &mut [f64]) -> Result<f64, ProblemError> {
        let v = x.values();
        c[0] = v[0] + v[1] - 1.0;
        Ok(0.5 * (v[0] * v[0] + v[1] * v[1]))
    }

    fn eval_grad(
        &mut self,
        x: &DistVec,
        g: &mut DistVec,
        a: &mut [DistVec],
    ) -> Result<(), ProblemError> {
        g.copy_from(x);
        a[0].fill(1.0);
        Ok(())
    }
}

/// min 1/2 ||x - t||^2  s.t.  x_0 + x_1 = 1 (one banded weighting row).
/// With t = (2, 2, 1, -1): x = (1/2, 1/2, 1, -1), z_w = -3/2.
struct WeightedQp {
    targets: [f64; 4],
}

impl OptProblem for WeightedQp {
    fn num_inequalities(&self) -> usize {
        0
    }

    fn initial_point(&self, x: &mut DistVec, xl: &mut DistVec, xu: &mut DistVec) {
        x.fill(0.25);
        xl.fill(f64::NEG_INFINITY);
        xu.fill(f64::INFINITY);
    }

    fn eval_obj_con(&mut self, x: &DistVec, _c: &mut [f64]) -> Result<f64, ProblemError> {
        Ok(x.values()
            .iter()
            .zip(&self.targets)
            .map(|(x, t)| 0.5 * (x - t) * (x - t))
            .sum())
    }

    fn eval_grad(
        &mut self,
        x: &DistVec,
        g: &mut DistVec,
        _a: &mut [DistVec],
    ) -> Result<(), ProblemError> {
        for (g, (x, t)) in g
            .values_mut()
            .iter_mut()
            .zip(x.values().iter().zip(&self.targets))
        {
            *g = x - t;
        }
        Ok(())
    }

    fn weight_pattern(&self) -> Option<BandedWeights> {
        Some(BandedWeights {
            num_con: 1,
            start: 0,
            width: 2,
            stride: 2,
        })
    }
}

fn quiet_settings() -> SolverSettings {
    SolverSettings {
        verbose: false,
        ..Default::default()
    }
}

#[test]
fn test_1d_quadratic_converges_fast() {
    // f(x) = 1/2 (x - 3)^2 from x = 0 with mu0 = 0.1 and a tight
    // tolerance: at most 20 major iterations to x = 3.
    let comm = largo_core::SerialComm::new();
    let problem = TargetQp {
        comm: comm.clone(),
        targets: vec![3.0],
        lower: None,
        start: 0.0,
    };
    let settings = SolverSettings {
        abs_res_tol: 1e-8,
        barrier_param: 0.1,
        ..quiet_settings()
    };

    let mut opt = InteriorPoint::new(comm, 1, problem, settings).unwrap();
    let result = opt.optimize(None).unwrap();

    assert_eq!(result.status, SolveStatus::Converged);
    assert!(
        result.iterations <= 20,
        "took {} iterations",
        result.iterations
    );
    assert!((opt.x().values()[0] - 3.0).abs() < 1e-8);
    assert!(result.fobj.abs() < 1e-12);
}

#[test]
fn test_bound_constrained_multipliers() {
    // f = 1/2 x^T x - (1, -1)^T x with x >= 0: solution x = (1, 0) with
    // an active bound on x_1, so z_l[1] -> 1 and z_l[0] -> 0.
    let comm = largo_core::SerialComm::new();
    let problem = TargetQp {
        comm: comm.clone(),
        targets: vec![1.0, -1.0],
        lower: Some(0.0),
        start: 0.5,
    };
    let mut opt = InteriorPoint::new(comm, 2, problem, quiet_settings()).unwrap();
    let result = opt.optimize(None).unwrap();

    assert_eq!(result.status, SolveStatus::Converged);
    let x = opt.x().values();
    assert!((x[0] - 1.0).abs() < 1e-4, "x = {x:?}");
    assert!(x[1] >= 0.0 && x[1] < 1e-4, "x = {x:?}");

    let (zl, _zu) = opt.bound_multipliers();
    assert!(zl.values()[1] > 0.5, "z_l = {:?}", zl.values());
    assert!(zl.values()[0] < 1e-4, "z_l = {:?}", zl.values());
}

#[test]
fn test_dense_inequality_active_at_solution() {
    let comm = largo_core::SerialComm::new();
    let mut opt = InteriorPoint::new(comm, 2, HalfspaceQp, quiet_settings()).unwrap();
    let result = opt.optimize(None).unwrap();

    assert_eq!(result.status, SolveStatus::Converged);
    let x = opt.x().values();
    assert!((x[0] - 0.5).abs() < 1e-4, "x = {x:?}");
    assert!((x[1] - 0.5).abs() < 1e-4, "x = {x:?}");
    assert!((opt.ineq_multipliers()[0] - 0.5).abs() < 1e-3);
    assert!((result.fobj - 0.25).abs() < 1e-6);
}

#[test]
fn test_weighting_constraint_solution_and_multiplier() {
    let comm = largo_core::SerialComm::new();
    let problem = WeightedQp {
        targets: [2.0, 2.0, 1.0, -1.0],
    };
    let mut opt = InteriorPoint::new(comm, 4, problem, quiet_settings()).unwrap();
    let result = opt.optimize(None).unwrap();

    assert_eq!(result.status, SolveStatus::Converged);
    let x = opt.x().values();
    for (xi, want) in x.iter().zip(&[0.5, 0.5, 1.0, -1.0]) {
        assert!((xi - want).abs() < 1e-4, "x = {x:?}");
    }
    // Stationarity: x - t = A_w^T z_w, so z_w = x_0 - t_0 = -3/2.
    assert!((opt.weight_multipliers().values()[0] + 1.5).abs() < 1e-3);
    // The linear constraint is restored to machine precision by the step.
    let feas = x[0] + x[1] - 1.0;
    assert!(feas.abs() < 1e-8, "A_w x - b = {feas}");
}

#[test]
fn test_sequential_linear_mode() {
    // With B forced to b0*I the model Hessian happens to be exact for
    // this problem, so the run still converges.
    let comm = largo_core::SerialComm::new();
    let problem = TargetQp {
        comm: comm.clone(),
        targets: vec![3.0],
        lower: None,
        start: 0.0,
    };
    let settings = SolverSettings {
        sequential_linear_method: true,
        abs_res_tol: 1e-8,
        ..quiet_settings()
    };
    let mut opt = InteriorPoint::new(comm, 1, problem, settings).unwrap();
    let result = opt.optimize(None).unwrap();
    assert_eq!(result.status, SolveStatus::Converged);
    assert!((opt.x().values()[0] - 3.0).abs() < 1e-8);
}

#[test]
fn test_sr1_model_bound_qp() {
    let comm = largo_core::SerialComm::new();
    let problem = TargetQp {
        comm: comm.clone(),
        targets: vec![1.0, -1.0],
        lower: Some(0.0),
        start: 0.5,
    };
    let settings = SolverSettings {
        qn_kind: QnKind::Sr1,
        ..quiet_settings()
    };
    let mut opt = InteriorPoint::new(comm, 2, problem, settings).unwrap();
    let result = opt.optimize(None).unwrap();

    assert_eq!(result.status, SolveStatus::Converged);
    let x = opt.x().values();
    assert!((x[0] - 1.0).abs() < 1e-4);
    assert!(x[1].abs() < 1e-4);
}

#[test]
fn test_exterior_start_without_push_is_fatal() {
    let comm = largo_core::SerialComm::new();
    let problem = TargetQp {
        comm: comm.clone(),
        targets: vec![1.0],
        lower: Some(0.0),
        start: -2.0, // outside the bound
    };
    let settings = SolverSettings {
        init_starting_point: false,
        ..quiet_settings()
    };
    let mut opt = InteriorPoint::new(comm, 1, problem, settings).unwrap();
    assert!(matches!(
        opt.optimize(None),
        Err(largo_core::OptError::InteriorViolation)
    ));
}

/// Run the bound QP over `parts` ranks with the given partitioning and
/// return rank 0's result.
fn run_partitioned(parts: &[usize], targets: &[f64]) -> SolveResult {
    let comms = ThreadComm::split(parts.len());
    let mut offset = 0;
    let mut handles = Vec::new();
    for (comm, &n_local) in comms.into_iter().zip(parts.iter()) {
        let slice: Vec<f64> = targets[offset..offset + n_local].to_vec();
        offset += n_local;
        handles.push(std::thread::spawn(move || {
            let comm: CommRef = Arc::new(comm);
            let problem = TargetQp {
                comm: comm.clone(),
                targets: slice,
                lower: Some(0.0),
                start: 0.5,
            };
            let mut opt = InteriorPoint::new(comm, n_local, problem, quiet_settings()).unwrap();
            opt.optimize(None).unwrap()
        }));
    }
    let mut results: Vec<SolveResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.swap_remove(0)
}

#[test]
fn test_partitioning_invariance() {
    // The same problem under different partitionings must produce
    // objective histories that agree to tight tolerance.
    let targets = [1.0, -1.0, 2.0, -2.0];
    let serial = run_partitioned(&[4], &targets);
    let split_even = run_partitioned(&[2, 2], &targets);
    let split_skew = run_partitioned(&[1, 3], &targets);

    assert_eq!(serial.status, SolveStatus::Converged);
    assert_eq!(split_even.status, SolveStatus::Converged);
    assert_eq!(split_skew.status, SolveStatus::Converged);

    assert_eq!(serial.history.len(), split_even.history.len());
    assert_eq!(serial.history.len(), split_skew.history.len());
    for ((a, b), c) in serial
        .history
        .iter()
        .zip(split_even.history.iter())
        .zip(split_skew.history.iter())
    {
        assert!((a.fobj - b.fobj).abs() < 1e-10);
        assert!((a.fobj - c.fobj).abs() < 1e-10);
    }
}

#[test]
fn test_solution_file_round_trip_two_ranks() {
    // Collective write followed by a read on the same partitioning must be
    // bit-identical.
    let path = std::env::temp_dir().join("largo_roundtrip_two_ranks.dat");
    let path_str = path.to_str().unwrap().to_string();

    let handles: Vec<_> = ThreadComm::split(2)
        .into_iter()
        .map(|comm| {
            let path = path_str.clone();
            std::thread::spawn(move || {
                let rank = comm.rank();
                let comm: CommRef = Arc::new(comm);
                let n_local = 3 + rank; // uneven partitioning
                let mut v = DistVec::new(comm.clone(), n_local);
                for (i, val) in v.values_mut().iter_mut().enumerate() {
                    *val = (rank * 100 + i) as f64 * 0.1 - 2.0;
                }
                v.write_to_file(&path).unwrap();

                let mut w = DistVec::new(comm, n_local);
                w.read_from_file(&path).unwrap();
                for (a, b) in v.values().iter().zip(w.values()) {
                    assert_eq!(a.to_bits(), b.to_bits());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_checkpoint_written_during_optimize() {
    let path = std::env::temp_dir().join("largo_checkpoint_serial.dat");
    let path_str = path.to_str().unwrap().to_string();

    let comm = largo_core::SerialComm::new();
    let problem = TargetQp {
        comm: comm.clone(),
        targets: vec![3.0, -1.0],
        lower: None,
        start: 0.0,
    };
    let mut opt = InteriorPoint::new(comm, 2, problem, quiet_settings()).unwrap();
    let result = opt.optimize(Some(path_str.as_str())).unwrap();
    assert_eq!(result.status, SolveStatus::Converged);

    // The final checkpoint holds the converged variables.
    let comm2 = largo_core::SerialComm::new();
    let mut v = DistVec::new(comm2, 2);
    v.read_from_file(&path_str).unwrap();
    assert!((v.values()[0] - 3.0).abs() < 1e-6);
    assert!((v.values()[1] + 1.0).abs() < 1e-6);
    let _ = std::fs::remove_file(&path);
}
