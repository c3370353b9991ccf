//! Pre-allocated optimizer state.
//!
//! Every distributed vector the major iteration touches is allocated once
//! here: the primal-dual iterate, oracle outputs, step and residual blocks,
//! the Woodbury correction buffers and the trial point. Steady-state
//! operation performs no allocation of vector-sized storage.

use crate::comm::CommRef;
use crate::ipm::kkt::KktScratch;
use crate::linalg::vector::DistVec;

pub struct IpmWorkspace {
    pub n_local: usize,
    pub ncon: usize,
    pub nwcon: usize,

    // Primal-dual iterate. x, z_l, z_u are distributed; the inequality
    // slacks and multipliers are small, dense and replicated.
    pub x: DistVec,
    pub xl: DistVec,
    pub xu: DistVec,
    pub zl: DistVec,
    pub zu: DistVec,
    pub zw: DistVec,
    pub s: Vec<f64>,
    pub z: Vec<f64>,

    // Oracle outputs at the current iterate.
    pub fobj: f64,
    pub c: Vec<f64>,
    pub g: DistVec,
    pub ac: Vec<DistVec>,

    // Right-hand side of the sparse equality block.
    pub bw: DistVec,

    // Newton step.
    pub px: DistVec,
    pub pzl: DistVec,
    pub pzu: DistVec,
    pub pzw: DistVec,
    pub pz: Vec<f64>,
    pub ps: Vec<f64>,

    // Negated KKT residuals (the Newton right-hand side).
    pub rx: DistVec,
    pub rzl: DistVec,
    pub rzu: DistVec,
    pub rw: DistVec,
    pub rc: Vec<f64>,
    pub rs: Vec<f64>,

    // Second diagonal solve of the Woodbury correction.
    pub dx2: DistVec,
    pub dzl2: DistVec,
    pub dzu2: DistVec,
    pub dw2: DistVec,
    pub dz2: Vec<f64>,
    pub ds2: Vec<f64>,

    // U * gamma, the folded low-rank correction direction.
    pub ucorr: DistVec,

    // Zero right-hand sides for the x-only-RHS solves.
    pub zero_x: DistVec,
    pub zero_w: DistVec,
    pub zero_m: Vec<f64>,

    // Quasi-Newton pair with Lagrangian correction.
    pub s_qn: DistVec,
    pub y_qn: DistVec,

    // Line-search trial point.
    pub xtrial: DistVec,
    pub strial: Vec<f64>,
    pub ctrial: Vec<f64>,

    // Scratch shared with the KKT solver.
    pub scratch: KktScratch,
}

impl IpmWorkspace {
    /// Allocate all state for `n_local` local variables, `ncon` dense
    /// inequalities, `nwcon` local weighting rows and a compact subspace of
    /// at most `qn_cap` columns.
    pub fn new(comm: &CommRef, n_local: usize, ncon: usize, nwcon: usize, qn_cap: usize) -> Self {
        let xvec = || DistVec::new(comm.clone(), n_local);
        let wvec = || DistVec::new(comm.clone(), nwcon);

        Self {
            n_local,
            ncon,
            nwcon,

            x: xvec(),
            xl: xvec(),
            xu: xvec(),
            zl: xvec(),
            zu: xvec(),
            zw: wvec(),
            s: vec![0.0; ncon],
            z: vec![0.0; ncon],

            fobj: 0.0,
            c: vec![0.0; ncon],
            g: xvec(),
            ac: (0..ncon).map(|_| xvec()).collect(),

            bw: wvec(),

            px: xvec(),
            pzl: xvec(),
            pzu: xvec(),
            pzw: wvec(),
            pz: vec![0.0; ncon],
            ps: vec![0.0; ncon],

            rx: xvec(),
            rzl: xvec(),
            rzu: xvec(),
            rw: wvec(),
            rc: vec![0.0; ncon],
            rs: vec![0.0; ncon],

            dx2: xvec(),
            dzl2: xvec(),
            dzu2: xvec(),
            dw2: wvec(),
            dz2: vec![0.0; ncon],
            ds2: vec![0.0; ncon],

            ucorr: xvec(),

            zero_x: xvec(),
            zero_w: wvec(),
            zero_m: vec![0.0; ncon],

            s_qn: xvec(),
            y_qn: xvec(),

            xtrial: xvec(),
            strial: vec![0.0; ncon],
            ctrial: vec![0.0; ncon],

            scratch: KktScratch::new(comm, n_local, ncon, nwcon, qn_cap),
        }
    }
}
