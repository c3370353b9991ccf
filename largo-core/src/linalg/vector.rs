//! Data-parallel dense vector.
//!
//! A `DistVec` owns a contiguous slice of a globally ordered vector; the
//! partitioning is fixed at construction. Reductions (`dot`, `mdot`, norms)
//! are collective over the vector's communicator and return the global
//! value on every rank. Purely local operations (`axpy`, `scale`, ...)
//! never communicate.

use crate::comm::{CommRef, ReduceOp};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Collective file I/O errors. The failure flag is itself allreduced, so
/// every rank returns the same result and collective call sequences stay
/// matched.
#[derive(Debug, Error)]
pub enum VecIoError {
    /// Writing the solution records failed on at least one rank.
    #[error("collective file write failed on {failed} of {total} ranks")]
    WriteFailed {
        /// Number of ranks reporting a local I/O error
        failed: usize,
        /// Group size
        total: usize,
    },

    /// Reading the solution records failed on at least one rank.
    #[error("collective file read failed on {failed} of {total} ranks")]
    ReadFailed {
        /// Number of ranks reporting a local I/O error
        failed: usize,
        /// Group size
        total: usize,
    },
}

/// A dense vector distributed across the ranks of a communicator.
#[derive(Clone)]
pub struct DistVec {
    comm: CommRef,
    values: Vec<f64>,
}

impl DistVec {
    /// Create a zeroed vector with `n_local` entries on this rank.
    pub fn new(comm: CommRef, n_local: usize) -> Self {
        Self {
            comm,
            values: vec![0.0; n_local],
        }
    }

    /// Zeroed vector with the same communicator and partitioning as `self`.
    pub fn like(&self) -> Self {
        Self::new(self.comm.clone(), self.values.len())
    }

    /// The communicator this vector reduces over.
    pub fn comm(&self) -> &CommRef {
        &self.comm
    }

    /// Number of locally owned entries.
    pub fn local_len(&self) -> usize {
        self.values.len()
    }

    /// Total length across all ranks. Collective.
    pub fn global_len(&self) -> usize {
        self.comm.allgather_usize(self.values.len()).iter().sum()
    }

    /// Locally owned entries.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable locally owned entries.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Set every entry to zero.
    pub fn zero(&mut self) {
        self.values.fill(0.0);
    }

    /// Set every entry to `alpha`.
    pub fn fill(&mut self, alpha: f64) {
        self.values.fill(alpha);
    }

    /// Copy the entries of `other`.
    pub fn copy_from(&mut self, other: &DistVec) {
        assert_eq!(self.values.len(), other.values.len(), "size mismatch");
        self.values.copy_from_slice(&other.values);
    }

    /// Scale by `alpha`.
    pub fn scale(&mut self, alpha: f64) {
        for v in &mut self.values {
            *v *= alpha;
        }
    }

    /// `self += alpha * other`.
    pub fn axpy(&mut self, alpha: f64, other: &DistVec) {
        assert_eq!(self.values.len(), other.values.len(), "size mismatch");
        for (v, &o) in self.values.iter_mut().zip(other.values.iter()) {
            *v += alpha * o;
        }
    }

    /// Global dot product. Collective.
    pub fn dot(&self, other: &DistVec) -> f64 {
        assert_eq!(self.values.len(), other.values.len(), "size mismatch");
        let local: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        self.comm.allreduce_scalar(local, ReduceOp::Sum)
    }

    /// Global dot products against `vecs`, batched into one allreduce.
    /// Collective.
    pub fn mdot(&self, vecs: &[&DistVec], out: &mut [f64]) {
        assert_eq!(vecs.len(), out.len(), "size mismatch");
        for (o, v) in out.iter_mut().zip(vecs.iter()) {
            assert_eq!(self.values.len(), v.values.len(), "size mismatch");
            *o = self
                .values
                .iter()
                .zip(v.values.iter())
                .map(|(a, b)| a * b)
                .sum();
        }
        self.comm.allreduce(out, ReduceOp::Sum);
    }

    /// Global l2 norm. Collective.
    pub fn norm(&self) -> f64 {
        let local: f64 = self.values.iter().map(|v| v * v).sum();
        self.comm.allreduce_scalar(local, ReduceOp::Sum).sqrt()
    }

    /// Global l-infinity norm. Collective.
    pub fn max_abs(&self) -> f64 {
        let local = self.values.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
        self.comm.allreduce_scalar(local, ReduceOp::Max)
    }

    /// Byte offset of this rank's slice in the global record ordering.
    /// Collective.
    fn record_offset(&self) -> usize {
        let counts = self.comm.allgather_usize(self.values.len());
        counts[..self.comm.rank()].iter().sum()
    }

    /// Write the global vector to `path` as fixed-size native-endian f64
    /// records in global order, one slice per rank at its exclusive-scan
    /// offset. Collective.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), VecIoError> {
        let offset = self.record_offset();

        // Rank 0 creates (truncates) the file before anyone writes into it.
        let mut local_fail = 0.0;
        if self.comm.rank() == 0 && File::create(path.as_ref()).is_err() {
            local_fail = 1.0;
        }
        self.comm.barrier();

        if local_fail == 0.0 && self.write_records(path.as_ref(), offset).is_err() {
            local_fail = 1.0;
        }

        let failed = self.comm.allreduce_scalar(local_fail, ReduceOp::Sum) as usize;
        if failed > 0 {
            Err(VecIoError::WriteFailed {
                failed,
                total: self.comm.size(),
            })
        } else {
            Ok(())
        }
    }

    fn write_records(&self, path: &Path, offset: usize) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start((offset * 8) as u64))?;
        let mut buf = Vec::with_capacity(self.values.len() * 8);
        for v in &self.values {
            buf.extend_from_slice(&v.to_ne_bytes());
        }
        file.write_all(&buf)?;
        file.flush()
    }

    /// Read this rank's slice back from a file written by
    /// [`DistVec::write_to_file`]. Requires the identical partitioning.
    /// Collective.
    pub fn read_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), VecIoError> {
        let offset = self.record_offset();

        let local_fail = match self.read_records(path.as_ref(), offset) {
            Ok(()) => 0.0,
            Err(_) => 1.0,
        };

        let failed = self.comm.allreduce_scalar(local_fail, ReduceOp::Sum) as usize;
        if failed > 0 {
            Err(VecIoError::ReadFailed {
                failed,
                total: self.comm.size(),
            })
        } else {
            Ok(())
        }
    }

    fn read_records(&mut self, path: &Path, offset: usize) -> std::io::Result<()> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start((offset * 8) as u64))?;
        let mut buf = vec![0u8; self.values.len() * 8];
        file.read_exact(&mut buf)?;
        for (v, chunk) in self.values.iter_mut().zip(buf.chunks_exact(8)) {
            *v = f64::from_ne_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    fn vec_from(values: &[f64]) -> DistVec {
        let mut v = DistVec::new(SerialComm::new(), values.len());
        v.values_mut().copy_from_slice(values);
        v
    }

    #[test]
    fn test_basic_algebra() {
        let mut a = vec_from(&[1.0, 2.0, 3.0]);
        let b = vec_from(&[4.0, -1.0, 0.5]);

        a.axpy(2.0, &b);
        assert_eq!(a.values(), &[9.0, 0.0, 4.0]);

        a.scale(0.5);
        assert_eq!(a.values(), &[4.5, 0.0, 2.0]);

        a.fill(1.0);
        assert_eq!(a.dot(&b), 3.5);

        a.zero();
        assert_eq!(a.norm(), 0.0);
    }

    #[test]
    fn test_norms() {
        let v = vec_from(&[3.0, -4.0]);
        assert!((v.norm() - 5.0).abs() < 1e-15);
        assert_eq!(v.max_abs(), 4.0);
    }

    #[test]
    fn test_mdot_matches_individual_dots() {
        let x = vec_from(&[0.3, -1.7, 2.2, 0.9]);
        let a = vec_from(&[1.0, 0.0, -2.0, 4.0]);
        let b = vec_from(&[-0.5, 3.0, 1.0, 1.0]);
        let c = vec_from(&[2.0, 2.0, 2.0, 2.0]);

        let mut out = [0.0; 3];
        x.mdot(&[&a, &b, &c], &mut out);

        assert_eq!(out[0], x.dot(&a));
        assert_eq!(out[1], x.dot(&b));
        assert_eq!(out[2], x.dot(&c));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join("largo_vec_roundtrip_serial.dat");

        let v = vec_from(&[1.0, -2.5, 1e-300, f64::MAX, 0.0]);
        v.write_to_file(&path).unwrap();

        let mut w = DistVec::new(SerialComm::new(), 5);
        w.read_from_file(&path).unwrap();

        // Bit-identical round trip.
        for (a, b) in v.values().iter().zip(w.values()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_missing_file_is_error() {
        let mut v = DistVec::new(SerialComm::new(), 3);
        let err = v.read_from_file("/nonexistent/largo_missing.dat");
        assert!(matches!(err, Err(VecIoError::ReadFailed { .. })));
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_size_mismatch_is_fatal() {
        let mut a = DistVec::new(SerialComm::new(), 3);
        let b = DistVec::new(SerialComm::new(), 4);
        a.axpy(1.0, &b);
    }
}
