//! HMM transition matrices. Each matrix covers one phone topology: rows are
//! emitting states, columns include the non-emitting exit state. Raw
//! probabilities are floored, renormalized per row and kept as integer logs,
//! with illegal (backward) transitions pinned to log zero.
use super::S3Reader;
use crate::error::{Result, SttError};
use crate::logmath::{LogMath, LOG_ZERO};
use std::io::Read;
use std::sync::Arc;
use tracing::info;

pub struct Tmat {
    n_tmat: usize,
    n_emit_state: usize,
    /// `(n_tmat, n_emit_state, n_emit_state + 1)` flattened.
    tp: Vec<i32>,
}

impl Tmat {
    pub fn from_reader(rdr: impl Read, tmatfloor: f32, lmath: Arc<LogMath>) -> Result<Self> {
        let mut s3 = S3Reader::open(rdr, "tmat")?;
        let n_tmat = s3.u32()? as usize;
        let n_src = s3.u32()? as usize;
        let n_dst = s3.u32()? as usize;
        if n_dst != n_src + 1 {
            return Err(SttError::bad_format(
                "tmat",
                format!("{} destination states for {} source states", n_dst, n_src),
            ));
        }
        let values = s3.values()?;
        if values.len() != n_tmat * n_src * n_dst {
            return Err(SttError::bad_format("tmat", "payload does not match shape"));
        }
        let mut tp = vec![LOG_ZERO; n_tmat * n_src * n_dst];
        for t in 0..n_tmat {
            for i in 0..n_src {
                let row = &values[(t * n_src + i) * n_dst..(t * n_src + i + 1) * n_dst];
                // Left-to-right topology: only forward arcs may carry mass.
                let total: f32 = row[i..].iter().sum();
                if total <= 0.0 {
                    return Err(SttError::bad_format(
                        "tmat",
                        format!("matrix {} row {} has no probability mass", t, i),
                    ));
                }
                for (j, &p) in row.iter().enumerate().skip(i) {
                    let p = (p / total).max(tmatfloor);
                    tp[(t * n_src + i) * n_dst + j] = lmath.log(p as f64);
                }
            }
        }
        info!("{} transition matrices, {} emitting states", n_tmat, n_src);
        Ok(Self {
            n_tmat,
            n_emit_state: n_src,
            tp,
        })
    }

    /// Uniform Bakis topology (self loop, next, skip), handy for tests and
    /// model bootstrapping.
    pub fn bakis(n_tmat: usize, n_emit_state: usize, lmath: &LogMath) -> Self {
        let n_dst = n_emit_state + 1;
        let mut tp = vec![LOG_ZERO; n_tmat * n_emit_state * n_dst];
        for t in 0..n_tmat {
            for i in 0..n_emit_state {
                let targets: Vec<usize> = (i..=(i + 2).min(n_dst - 1)).collect();
                let p = 1.0 / targets.len() as f64;
                for &j in &targets {
                    tp[(t * n_emit_state + i) * n_dst + j] = lmath.log(p);
                }
            }
        }
        Self {
            n_tmat,
            n_emit_state,
            tp,
        }
    }

    pub fn n_tmat(&self) -> usize {
        self.n_tmat
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    #[inline(always)]
    pub fn tp(&self, tmat: i32, from: usize, to: usize) -> i32 {
        self.tp[(tmat as usize * self.n_emit_state + from) * (self.n_emit_state + 1) + to]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::write_s3;
    use std::io::Cursor;

    #[test]
    fn loads_and_normalizes() {
        let lmath = LogMath::shared_default();
        // One matrix, 3 emitting states. Rows deliberately unnormalized.
        let raw = [
            0.6, 0.3, 0.1, 0.0, //
            0.0, 1.2, 0.4, 0.4, //
            0.0, 0.0, 0.5, 0.5,
        ];
        let mut bytes = Vec::new();
        write_s3(&mut bytes, "tmat", &[1, 3, 4], &raw).unwrap();
        let tmat = Tmat::from_reader(Cursor::new(bytes), 1e-4, lmath.clone()).unwrap();
        assert_eq!(tmat.n_tmat(), 1);
        assert_eq!(tmat.n_emit_state(), 3);
        // Row 1 renormalized: 1.2/2.0 = 0.6 self loop.
        assert!((lmath.exp(tmat.tp(0, 1, 1)) - 0.6).abs() < 1e-3);
        // Backward transitions are impossible.
        assert_eq!(tmat.tp(0, 1, 0), LOG_ZERO);
        assert_eq!(tmat.tp(0, 2, 1), LOG_ZERO);
    }

    #[test]
    fn bakis_rows_sum_to_one() {
        let lmath = LogMath::shared_default();
        let tmat = Tmat::bakis(2, 5, &lmath);
        for i in 0..5 {
            let total: f64 = (0..6).map(|j| lmath.exp(tmat.tp(1, i, j))).sum();
            assert!((total - 1.0).abs() < 1e-2, "row {} sums to {}", i, total);
        }
    }

    #[test]
    fn empty_rows_are_rejected() {
        let raw = [0.0f32; 6];
        let mut bytes = Vec::new();
        write_s3(&mut bytes, "tmat", &[1, 2, 3], &raw).unwrap();
        assert!(matches!(
            Tmat::from_reader(Cursor::new(bytes), 1e-4, LogMath::shared_default()),
            Err(SttError::BadFormat { .. })
        ));
    }
}
