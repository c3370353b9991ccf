//! In-process multi-rank communicator.
//!
//! Hosts N ranks as N threads of one process. Reductions gather every
//! contribution under a lock and fold them in rank order, so all ranks see
//! the same bits regardless of arrival order. This is the deterministic
//! reduction the replicated-matrix invariant relies on, and it makes
//! partitioning experiments reproducible in tests.

use super::{Communicator, ReduceOp};
use std::sync::{Arc, Condvar, Mutex};

/// One rank's handle into an in-process group.
pub struct ThreadComm {
    shared: Arc<Shared>,
    rank: usize,
}

struct Shared {
    size: usize,
    round: Mutex<Round>,
    cv: Condvar,
}

struct Round {
    generation: u64,
    arrived: usize,
    contrib: Vec<Vec<f64>>,
    result: Vec<f64>,
}

impl ThreadComm {
    /// Create a group of `size` ranks. Each returned handle must be moved to
    /// its own thread; collectives block until all ranks arrive.
    pub fn split(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "communicator group must have at least one rank");
        let shared = Arc::new(Shared {
            size,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                contrib: vec![Vec::new(); size],
                result: Vec::new(),
            }),
            cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                shared: shared.clone(),
                rank,
            })
            .collect()
    }

    /// Deposit this rank's contribution, have the last arrival fold all of
    /// them, and return the folded result to every rank.
    fn exchange<F>(&self, data: Vec<f64>, fold: F) -> Vec<f64>
    where
        F: FnOnce(&[Vec<f64>]) -> Vec<f64>,
    {
        let shared = &self.shared;
        let mut round = shared.round.lock().unwrap();
        round.contrib[self.rank] = data;
        round.arrived += 1;
        if round.arrived == shared.size {
            round.result = fold(&round.contrib);
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            shared.cv.notify_all();
            round.result.clone()
        } else {
            let generation = round.generation;
            while round.generation == generation {
                round = shared.cv.wait(round).unwrap();
            }
            round.result.clone()
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn allreduce(&self, buf: &mut [f64], op: ReduceOp) {
        let folded = self.exchange(buf.to_vec(), |contrib| {
            // Fold in rank order: identical bits on every rank.
            let mut acc = contrib[0].clone();
            for c in &contrib[1..] {
                debug_assert_eq!(c.len(), acc.len(), "mismatched allreduce lengths");
                for (a, &v) in acc.iter_mut().zip(c.iter()) {
                    *a = match op {
                        ReduceOp::Sum => *a + v,
                        ReduceOp::Max => a.max(v),
                        ReduceOp::Min => a.min(v),
                    };
                }
            }
            acc
        });
        buf.copy_from_slice(&folded);
    }

    fn allgather_usize(&self, value: usize) -> Vec<usize> {
        let gathered = self.exchange(vec![value as f64], |contrib| {
            contrib.iter().map(|c| c[0]).collect()
        });
        gathered.into_iter().map(|v| v as usize).collect()
    }

    fn barrier(&self) {
        self.exchange(Vec::new(), |_| Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ranks<F>(size: usize, f: F) -> Vec<Vec<f64>>
    where
        F: Fn(ThreadComm) -> Vec<f64> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = ThreadComm::split(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_allreduce_sum_identical_on_all_ranks() {
        let results = run_ranks(4, |comm| {
            let mut buf = [comm.rank() as f64 + 1.0, 0.25];
            comm.allreduce(&mut buf, ReduceOp::Sum);
            buf.to_vec()
        });
        for r in &results {
            assert_eq!(r[0], 10.0);
            assert_eq!(r[1], 1.0);
        }
    }

    #[test]
    fn test_allreduce_max_min() {
        let results = run_ranks(3, |comm| {
            let hi = comm.allreduce_scalar(-(comm.rank() as f64), ReduceOp::Max);
            let lo = comm.allreduce_scalar(-(comm.rank() as f64), ReduceOp::Min);
            vec![hi, lo]
        });
        for r in &results {
            assert_eq!(r[0], 0.0);
            assert_eq!(r[1], -2.0);
        }
    }

    #[test]
    fn test_allgather_ordered_by_rank() {
        let results = run_ranks(3, |comm| {
            comm.allgather_usize(10 * (comm.rank() + 1))
                .into_iter()
                .map(|v| v as f64)
                .collect()
        });
        for r in &results {
            assert_eq!(r, &vec![10.0, 20.0, 30.0]);
        }
    }

    #[test]
    fn test_repeated_collectives_do_not_lap() {
        // Many back-to-back rounds; a racy implementation would mix rounds up.
        let results = run_ranks(4, |comm| {
            let mut total = 0.0;
            for k in 0..200 {
                let v = (comm.rank() + k) as f64;
                total += comm.allreduce_scalar(v, ReduceOp::Sum);
            }
            vec![total]
        });
        let expected: f64 = (0..200).map(|k| (4 * k + 6) as f64).sum();
        for r in &results {
            assert_eq!(r[0], expected);
        }
    }
}
