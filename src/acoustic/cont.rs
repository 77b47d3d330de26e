//! Continuous-density senone scoring: every senone owns its own small
//! Gaussian mixture over a single feature stream. Same contract as the
//! semi-continuous scorer, no shared codebook and no quantization beyond the
//! integer log domain.
use super::{AcousticScorer, Feature, S3Reader};
use crate::error::{Result, SttError};
use crate::logmath::{LogMath, LOG_ZERO};
use ndarray::Array2;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ContMgau {
    lmath: Arc<LogMath>,
    n_sen: usize,
    n_density: usize,
    veclen: usize,
    /// `(n_sen * n_density, veclen)`, row per mixture component.
    means: Array2<f32>,
    vars: Array2<f32>,
    dets: Vec<i32>,
    /// Integer log mixture weights, `(n_sen, n_density)`.
    mixw: Array2<i32>,
}

fn read_cont_gau(
    rdr: impl Read,
    what: &'static str,
) -> Result<(usize, usize, usize, Vec<f32>)> {
    let mut s3 = S3Reader::open(rdr, what)?;
    let n_sen = s3.u32()? as usize;
    let n_feat = s3.u32()? as usize;
    if n_feat != 1 {
        return Err(SttError::bad_format(
            what,
            format!("continuous models use one stream, file has {}", n_feat),
        ));
    }
    let n_density = s3.u32()? as usize;
    let veclen = s3.u32()? as usize;
    let values = s3.values()?;
    if values.len() != n_sen * n_density * veclen {
        return Err(SttError::bad_format(what, "payload does not match shape"));
    }
    Ok((n_sen, n_density, veclen, values))
}

impl ContMgau {
    pub fn from_readers(
        mean_rdr: impl Read,
        var_rdr: impl Read,
        mixw_rdr: impl Read,
        varfloor: f32,
        mixwfloor: f32,
        lmath: Arc<LogMath>,
    ) -> Result<Self> {
        let (n_sen, n_density, veclen, means) = read_cont_gau(mean_rdr, "mean")?;
        let (vn_sen, vn_density, v_veclen, raw_vars) = read_cont_gau(var_rdr, "var")?;
        if (n_sen, n_density, veclen) != (vn_sen, vn_density, v_veclen) {
            return Err(SttError::bad_format(
                "var",
                "mean and variance files disagree on shape",
            ));
        }

        let ln_base = lmath.base().ln();
        let rows = n_sen * n_density;
        let mut vars = Array2::<f32>::zeros((rows, veclen));
        let mut dets = vec![0i32; rows];
        let mut floored = 0usize;
        for r in 0..rows {
            let mut d = 0.0f64;
            for j in 0..veclen {
                let mut v = raw_vars[r * veclen + j];
                if v < varfloor {
                    v = varfloor;
                    floored += 1;
                }
                d += -0.5 * (2.0 * std::f64::consts::PI * v as f64).ln();
                vars[(r, j)] = (1.0 / (2.0 * v as f64 * ln_base)) as f32;
            }
            dets[r] = lmath.ln_to_log(d);
        }
        if floored > 0 {
            debug!("{} variance values floored", floored);
        }

        // Mixture weights, floored and renormalized, straight to logs.
        let mut s3 = S3Reader::open(mixw_rdr, "mixw")?;
        let mn_sen = s3.u32()? as usize;
        let mn_feat = s3.u32()? as usize;
        let mn_density = s3.u32()? as usize;
        if mn_sen != n_sen || mn_feat != 1 || mn_density != n_density {
            return Err(SttError::bad_format(
                "mixw",
                "mixture weights disagree with the Gaussian tables",
            ));
        }
        let raw_mixw = s3.values()?;
        if raw_mixw.len() != n_sen * n_density {
            return Err(SttError::bad_format("mixw", "truncated mixture weights"));
        }
        let mut mixw = Array2::<i32>::zeros((n_sen, n_density));
        for s in 0..n_sen {
            let row = &raw_mixw[s * n_density..(s + 1) * n_density];
            let total: f32 = row.iter().sum();
            if total <= 0.0 {
                warn!("Senone {} has zero mixture mass", s);
            }
            for (c, &w) in row.iter().enumerate() {
                let w = if total > 0.0 { w / total } else { 0.0 };
                mixw[(s, c)] = lmath.log(w.max(mixwfloor) as f64);
            }
        }

        info!(
            "Continuous model: {} senones, {} components, {} dims",
            n_sen, n_density, veclen
        );
        Ok(Self {
            lmath,
            n_sen,
            n_density,
            veclen,
            means: super::into_array2(means, rows, veclen, "mean")?,
            vars,
            dets,
            mixw,
        })
    }

    fn senone_score(&self, s: usize, x: &[f32]) -> i32 {
        let mut acc = LOG_ZERO;
        for c in 0..self.n_density {
            let r = s * self.n_density + c;
            let means = self.means.row(r);
            let vars = self.vars.row(r);
            let mut d = self.dets[r] as f32;
            for j in 0..self.veclen {
                let diff = x[j] - means[j];
                d -= diff * diff * vars[j];
            }
            let component = self.mixw[(s, c)].saturating_add(d as i32);
            acc = self.lmath.add(acc, component);
        }
        acc.min(0)
    }
}

impl AcousticScorer for ContMgau {
    fn n_senones(&self) -> usize {
        self.n_sen
    }

    fn frame_eval(
        &mut self,
        feat: &Feature,
        _frame_idx: i32,
        active: Option<&[i32]>,
        scores: &mut [i32],
    ) -> Result<()> {
        let x = feat
            .streams
            .first()
            .ok_or_else(|| SttError::bad_format("feature", "empty frame"))?;
        if feat.streams.len() != 1 || x.len() != self.veclen {
            return Err(SttError::bad_format(
                "feature",
                format!(
                    "continuous model wants a single {}-dim stream",
                    self.veclen
                ),
            ));
        }
        match active {
            Some(list) => {
                for &s in list {
                    scores[s as usize] = self.senone_score(s as usize, x);
                }
            }
            None => {
                for s in 0..self.n_sen {
                    scores[s] = self.senone_score(s, x);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::write_s3;
    use std::io::Cursor;

    /// Two senones with single-component mixtures at -1 and +1.
    fn tiny_cont() -> ContMgau {
        let mut mean_bytes = Vec::new();
        write_s3(
            &mut mean_bytes,
            "means",
            &[2, 1, 1, 2],
            &[-1.0, -1.0, 1.0, 1.0],
        )
        .unwrap();
        let mut var_bytes = Vec::new();
        write_s3(&mut var_bytes, "vars", &[2, 1, 1, 2], &[0.5, 0.5, 0.5, 0.5]).unwrap();
        let mut mixw_bytes = Vec::new();
        write_s3(&mut mixw_bytes, "mixw", &[2, 1, 1], &[1.0, 1.0]).unwrap();
        ContMgau::from_readers(
            Cursor::new(mean_bytes),
            Cursor::new(var_bytes),
            Cursor::new(mixw_bytes),
            1e-4,
            1e-7,
            LogMath::shared_default(),
        )
        .unwrap()
    }

    #[test]
    fn likelihood_tracks_distance() {
        let mut m = tiny_cont();
        let mut scores = vec![0i32; 2];
        m.frame_eval(
            &Feature::single(vec![-1.0, -1.0]),
            0,
            None,
            &mut scores,
        )
        .unwrap();
        assert!(scores[0] > scores[1]);
        m.frame_eval(&Feature::single(vec![1.0, 1.0]), 1, None, &mut scores)
            .unwrap();
        assert!(scores[1] > scores[0]);
        assert!(scores.iter().all(|&s| s <= 0));
    }

    #[test]
    fn wrong_dimensionality_is_rejected() {
        let mut m = tiny_cont();
        let mut scores = vec![0i32; 2];
        assert!(m
            .frame_eval(&Feature::single(vec![0.0]), 0, None, &mut scores)
            .is_err());
    }
}
