//! Semi-continuous senone scoring. One shared Gaussian codebook per feature
//! stream; every frame we find the top-N codewords per stream, normalize
//! their scores into 10-bit quantized weights, and mix them with the 8-bit
//! quantized senone weights through a table-driven log-add. The senone loop
//! has specialized forms for the common top-1/2/4 settings.
use super::kdtree::KdTree;
use super::{AcousticScorer, Feature, S3Reader};
use crate::error::{Result, SttError};
use crate::logmath::{LogAdd8, LogMath, SCALE_SHIFT};
use ndarray::Array2;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WORST_DIST: i32 = i32::MIN >> 2;
/// Normalized stream weights are floored here before the 10-bit quantize.
const WEIGHT_FLOOR: i32 = -99000;

#[derive(Debug, Clone, Copy)]
struct VqFeature {
    codeword: usize,
    dist: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ScorerParams {
    pub varfloor: f32,
    pub mixwfloor: f32,
    pub topn: usize,
    pub ds_ratio: usize,
}

impl Default for ScorerParams {
    fn default() -> Self {
        Self {
            varfloor: 1e-4,
            mixwfloor: 1e-7,
            topn: 4,
            ds_ratio: 1,
        }
    }
}

/// 8-bit quantized mixture weights, either owned or a read-only map of the
/// pre-quantized dump file.
enum MixwStore {
    /// Per feature stream, `n_density * n_sen` row-major.
    Owned(Vec<Vec<u8>>),
    #[cfg(feature = "mmap")]
    Mapped {
        map: memmap2::Mmap,
        offset: usize,
        feat_stride: usize,
        row_stride: usize,
    },
}

impl MixwStore {
    #[inline(always)]
    fn row(&self, feat: usize, codeword: usize, n_sen: usize) -> &[u8] {
        match self {
            MixwStore::Owned(feats) => {
                &feats[feat][codeword * n_sen..(codeword + 1) * n_sen]
            }
            #[cfg(feature = "mmap")]
            MixwStore::Mapped {
                map,
                offset,
                feat_stride,
                row_stride,
            } => {
                let start = offset + feat * feat_stride + codeword * row_stride;
                &map[start..start + n_sen]
            }
        }
    }
}

pub struct SemiMgau {
    lmath: Arc<LogMath>,
    add8: LogAdd8,
    n_feat: usize,
    n_density: usize,
    n_sen: usize,
    veclen: Vec<usize>,
    means: Vec<Array2<f32>>,
    /// Pre-scaled `1/(2σ²·ln b)` so a squared diff lands in log units.
    vars: Vec<Array2<f32>>,
    dets: Vec<Vec<i32>>,
    mixw: MixwStore,
    topn: usize,
    ds_ratio: usize,
    f: Vec<Vec<VqFeature>>,
    lastf: Vec<Vec<VqFeature>>,
    kdtrees: Option<Vec<KdTree>>,
    kd_maxbbi: Option<usize>,
}

/// Parse a Sphinx-3 Gaussian parameter file into per-stream tables.
fn read_gau(rdr: impl Read, what: &'static str) -> Result<(Vec<usize>, usize, Vec<Array2<f32>>)> {
    let mut s3 = S3Reader::open(rdr, what)?;
    let n_mgau = s3.u32()? as usize;
    if n_mgau != 1 {
        return Err(SttError::bad_format(
            what,
            format!("expected a single shared codebook, found {} densities", n_mgau),
        ));
    }
    let n_feat = s3.u32()? as usize;
    let n_density = s3.u32()? as usize;
    let mut veclen = Vec::with_capacity(n_feat);
    for _ in 0..n_feat {
        veclen.push(s3.u32()? as usize);
    }
    let values = s3.values()?;
    let expected: usize = veclen.iter().map(|&v| v * n_density).sum();
    if values.len() != expected {
        return Err(SttError::bad_format(
            what,
            format!("payload is {} floats, expected {}", values.len(), expected),
        ));
    }
    let mut tables = Vec::with_capacity(n_feat);
    let mut at = 0usize;
    for &len in &veclen {
        let chunk = values[at..at + n_density * len].to_vec();
        at += n_density * len;
        tables.push(super::into_array2(chunk, n_density, len, what)?);
    }
    Ok((veclen, n_density, tables))
}

impl SemiMgau {
    pub fn from_readers(
        mean_rdr: impl Read,
        var_rdr: impl Read,
        mixw_rdr: impl Read,
        n_sen: usize,
        params: ScorerParams,
        lmath: Arc<LogMath>,
    ) -> Result<Self> {
        let mut s = Self::from_gau_readers(mean_rdr, var_rdr, n_sen, params, lmath)?;
        s.load_mixw_float(mixw_rdr, params.mixwfloor)?;
        Ok(s)
    }

    /// Means and variances only; mixture weights come later from either a
    /// float file or a sendump.
    pub fn from_gau_readers(
        mean_rdr: impl Read,
        var_rdr: impl Read,
        n_sen: usize,
        params: ScorerParams,
        lmath: Arc<LogMath>,
    ) -> Result<Self> {
        let (veclen, n_density, means) = read_gau(mean_rdr, "mean")?;
        let (var_veclen, var_density, raw_vars) = read_gau(var_rdr, "var")?;
        if veclen != var_veclen || n_density != var_density {
            return Err(SttError::bad_format(
                "var",
                "mean and variance files disagree on shape",
            ));
        }
        if !(1..=16).contains(&params.topn) || params.topn > n_density {
            return Err(SttError::bad_format(
                "mean",
                format!("top-{} is not usable with {} codewords", params.topn, n_density),
            ));
        }

        let ln_base = lmath.base().ln();
        let n_feat = veclen.len();
        let mut vars = Vec::with_capacity(n_feat);
        let mut dets = Vec::with_capacity(n_feat);
        let mut floored = 0usize;
        for (feat, raw) in raw_vars.into_iter().enumerate() {
            let len = veclen[feat];
            let mut scaled = Array2::<f32>::zeros((n_density, len));
            let mut det = vec![0i32; n_density];
            for cw in 0..n_density {
                let mut d = 0.0f64;
                for j in 0..len {
                    let mut v = raw[(cw, j)];
                    if v < params.varfloor {
                        v = params.varfloor;
                        floored += 1;
                    }
                    d += -0.5 * ((2.0 * std::f64::consts::PI * v as f64).ln());
                    scaled[(cw, j)] = (1.0 / (2.0 * v as f64 * ln_base)) as f32;
                }
                det[cw] = lmath.ln_to_log(d);
            }
            vars.push(scaled);
            dets.push(det);
        }
        if floored > 0 {
            debug!("{} variance values floored", floored);
        }
        info!(
            "Semi-continuous codebook: {} streams, {} codewords, top-{}",
            n_feat, n_density, params.topn
        );

        let init = vec![
            VqFeature {
                codeword: 0,
                dist: WORST_DIST,
            };
            params.topn
        ];
        // Distinct initial codewords so the previous-frame seeding never
        // scores the same codeword twice.
        let mut f = vec![init; n_feat];
        for stream in f.iter_mut() {
            for (i, entry) in stream.iter_mut().enumerate() {
                entry.codeword = i;
            }
        }

        Ok(Self {
            add8: LogAdd8::new(&lmath),
            lmath,
            n_feat,
            n_density,
            n_sen,
            veclen,
            means,
            vars,
            dets,
            mixw: MixwStore::Owned(vec![Vec::new(); n_feat]),
            topn: params.topn,
            ds_ratio: params.ds_ratio.max(1),
            lastf: f.clone(),
            f,
            kdtrees: None,
            kd_maxbbi: None,
        })
    }

    /// Float mixture weights, floored, renormalized and quantized to 8 bits.
    pub fn load_mixw_float(&mut self, rdr: impl Read, mixwfloor: f32) -> Result<()> {
        let mut s3 = S3Reader::open(rdr, "mixw")?;
        let n_sen = s3.u32()? as usize;
        let n_feat = s3.u32()? as usize;
        let n_density = s3.u32()? as usize;
        if n_feat != self.n_feat || n_density != self.n_density || n_sen != self.n_sen {
            return Err(SttError::bad_format(
                "mixw",
                format!(
                    "mixture weight shape {}x{}x{} does not match model",
                    n_sen, n_feat, n_density
                ),
            ));
        }
        let values = s3.values()?;
        if values.len() != n_sen * n_feat * n_density {
            return Err(SttError::bad_format("mixw", "truncated mixture weights"));
        }
        let mut store = vec![vec![0u8; n_density * self.n_sen]; n_feat];
        for s in 0..n_sen {
            for feat in 0..n_feat {
                let base = (s * n_feat + feat) * n_density;
                let row = &values[base..base + n_density];
                let total: f32 = row.iter().sum();
                if total <= 0.0 {
                    warn!("Senone {} stream {} has zero mixture mass", s, feat);
                }
                for (cw, &w) in row.iter().enumerate() {
                    let w = if total > 0.0 { w / total } else { 0.0 };
                    let w = w.max(mixwfloor);
                    store[feat][cw * self.n_sen + s] = quantize_weight(self.lmath.log(w as f64))?;
                }
            }
        }
        self.mixw = MixwStore::Owned(store);
        Ok(())
    }

    /// Pre-quantized senone dump. Title and header strings, row/column
    /// counts, then one 8-bit row per (stream, codeword).
    pub fn load_sendump(&mut self, mut rdr: impl Read) -> Result<()> {
        let mut bytes = Vec::new();
        rdr.read_to_end(&mut bytes)?;
        let (offset, swap) = self.parse_sendump_header(&bytes)?;
        if swap {
            return Err(SttError::bad_format(
                "sendump",
                "byte-swapped dump files are not supported, regenerate natively",
            ));
        }
        let need = self.n_feat * self.n_density * self.n_sen;
        if bytes.len() - offset < need {
            return Err(SttError::bad_format("sendump", "truncated senone rows"));
        }
        let mut store = vec![vec![0u8; self.n_density * self.n_sen]; self.n_feat];
        let mut at = offset;
        for feats in store.iter_mut() {
            feats.copy_from_slice(&bytes[at..at + self.n_density * self.n_sen]);
            at += self.n_density * self.n_sen;
        }
        self.mixw = MixwStore::Owned(store);
        info!("Loaded senones from dump file");
        Ok(())
    }

    /// Validate the dump header; returns the row data offset and whether the
    /// file is byte-swapped.
    fn parse_sendump_header(&self, bytes: &[u8]) -> Result<(usize, bool)> {
        let mut pos = 0usize;
        let mut swap = false;
        let mut read_i32 = |pos: &mut usize, swap: bool| -> Result<i32> {
            if *pos + 4 > bytes.len() {
                return Err(SttError::bad_format("sendump", "truncated header"));
            }
            let v = i32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            Ok(if swap { v.swap_bytes() } else { v })
        };
        let mut n = read_i32(&mut pos, false)?;
        if !(1..1000).contains(&n) {
            n = n.swap_bytes();
            if !(1..1000).contains(&n) {
                return Err(SttError::bad_format("sendump", "title length out of range"));
            }
            swap = true;
        }
        pos += n as usize;
        // Header strings until a zero length.
        loop {
            let k = read_i32(&mut pos, swap)?;
            if k == 0 {
                break;
            }
            if k < 0 || pos + k as usize > bytes.len() {
                return Err(SttError::bad_format("sendump", "bad header string"));
            }
            pos += k as usize;
        }
        let rows = read_i32(&mut pos, swap)?;
        let cols = read_i32(&mut pos, swap)?;
        if rows as usize != self.n_density || cols as usize != self.n_sen {
            return Err(SttError::bad_format(
                "sendump",
                format!(
                    "dump is {}x{}, model wants {}x{}",
                    rows, cols, self.n_density, self.n_sen
                ),
            ));
        }
        Ok((pos, swap))
    }

    /// Memory-map the dump instead of copying it. Falls back to an error if
    /// the row data is not 4-byte aligned or the file needs a byte swap.
    #[cfg(feature = "mmap")]
    pub fn load_sendump_mmap(&mut self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { memmap2::Mmap::map(&file)? };
        let (offset, swap) = self.parse_sendump_header(&map)?;
        if swap || offset % 4 != 0 || self.n_sen % 4 != 0 {
            return Err(SttError::bad_format(
                "sendump",
                "dump not mappable (alignment or byte order), read it instead",
            ));
        }
        let feat_stride = self.n_density * self.n_sen;
        if map.len() - offset < self.n_feat * feat_stride {
            return Err(SttError::bad_format("sendump", "truncated senone rows"));
        }
        self.mixw = MixwStore::Mapped {
            map,
            offset,
            feat_stride,
            row_stride: self.n_sen,
        };
        info!("Memory-mapped senone dump");
        Ok(())
    }

    /// Write the quantized weights as a dump file.
    pub fn write_sendump(&self, mut w: impl Write) -> Result<()> {
        let title = b"senone probs, quantized 8 bit\0";
        w.write_all(&(title.len() as i32).to_le_bytes())?;
        w.write_all(title)?;
        let cluster = b"cluster_count 0\0";
        w.write_all(&(cluster.len() as i32).to_le_bytes())?;
        w.write_all(cluster)?;
        w.write_all(&0i32.to_le_bytes())?;
        w.write_all(&(self.n_density as i32).to_le_bytes())?;
        w.write_all(&(self.n_sen as i32).to_le_bytes())?;
        for feat in 0..self.n_feat {
            for cw in 0..self.n_density {
                w.write_all(self.mixw.row(feat, cw, self.n_sen))?;
            }
        }
        Ok(())
    }

    pub fn set_kdtrees(&mut self, trees: Vec<KdTree>, maxbbi: Option<usize>) -> Result<()> {
        if trees.len() != self.n_feat {
            return Err(SttError::bad_format(
                "kdtree",
                format!("{} trees for {} streams", trees.len(), self.n_feat),
            ));
        }
        self.kdtrees = Some(trees);
        self.kd_maxbbi = maxbbi;
        Ok(())
    }

    /// Gaussian log likelihood of one codeword, with early give-up once it
    /// falls under `worst`.
    #[inline]
    fn codeword_dist(&self, feat: usize, cw: usize, x: &[f32], worst: i32) -> Option<i32> {
        let means = self.means[feat].row(cw);
        let vars = self.vars[feat].row(cw);
        let mut d = self.dets[feat][cw] as f32;
        let worst = worst as f32;
        for j in 0..self.veclen[feat] {
            let diff = x[j] - means[j];
            d -= diff * diff * vars[j];
            if d < worst {
                return None;
            }
        }
        Some(d as i32)
    }

    /// Insert a scored codeword into the running top-N (sorted best first).
    fn topn_insert(topn: &mut [VqFeature], cw: usize, dist: i32) {
        if topn.iter().any(|e| e.codeword == cw) {
            return;
        }
        let n = topn.len();
        if dist < topn[n - 1].dist {
            return;
        }
        let mut i = n - 1;
        while i > 0 && dist > topn[i - 1].dist {
            topn[i] = topn[i - 1];
            i -= 1;
        }
        topn[i] = VqFeature {
            codeword: cw,
            dist,
        };
    }

    fn mgau_dist(&mut self, frame_idx: i32, feat: usize, x: &[f32]) {
        // Seed with the previous frame's winners and rescore them.
        let mut topn = self.lastf[feat].clone();
        for i in 0..topn.len() {
            let cw = topn[i].codeword;
            let d = self
                .codeword_dist(feat, cw, x, WORST_DIST)
                .unwrap_or(WORST_DIST);
            topn[i].dist = d;
            let mut j = i;
            let moved = topn[i];
            while j > 0 && moved.dist > topn[j - 1].dist {
                topn[j] = topn[j - 1];
                j -= 1;
            }
            topn[j] = moved;
        }

        // On downsampled frames the previous winners are reused as is.
        if frame_idx % self.ds_ratio as i32 == 0 {
            match &self.kdtrees {
                Some(trees) => {
                    let bbi: Vec<u32> = {
                        let leaf = trees[feat].query(x);
                        let cap = self.kd_maxbbi.unwrap_or(leaf.len());
                        leaf[..leaf.len().min(cap)].to_vec()
                    };
                    for cw in bbi {
                        let worst = topn[self.topn - 1].dist;
                        if let Some(d) = self.codeword_dist(feat, cw as usize, x, worst) {
                            Self::topn_insert(&mut topn, cw as usize, d);
                        }
                    }
                }
                None => {
                    for cw in 0..self.n_density {
                        let worst = topn[self.topn - 1].dist;
                        if let Some(d) = self.codeword_dist(feat, cw, x, worst) {
                            Self::topn_insert(&mut topn, cw, d);
                        }
                    }
                }
            }
            self.lastf[feat] = topn.clone();
        }
        self.f[feat] = topn;
    }

    /// Normalize the per-stream top-N into 10-bit quantized weights.
    fn stream_weights(&self) -> Vec<Vec<i32>> {
        let mut out = Vec::with_capacity(self.n_feat);
        for feat in 0..self.n_feat {
            let mut norm = self.f[feat][0].dist;
            for e in &self.f[feat][1..] {
                norm = self.lmath.add(norm, e.dist);
            }
            let ws: Vec<i32> = self.f[feat]
                .iter()
                .map(|e| {
                    let mut v = e.dist - norm;
                    if v > 0 {
                        v = 0;
                    }
                    v = v.max(WEIGHT_FLOOR);
                    (511 - v) >> SCALE_SHIFT
                })
                .collect();
            out.push(ws);
        }
        out
    }

    fn scores_topn(&self, weights: &[Vec<i32>], active: &[i32], scores: &mut [i32]) {
        for &s in active {
            scores[s as usize] = 0;
        }
        for feat in 0..self.n_feat {
            let rows: Vec<&[u8]> = self.f[feat]
                .iter()
                .map(|e| self.mixw.row(feat, e.codeword, self.n_sen))
                .collect();
            let ws = &weights[feat];
            match self.topn {
                1 => {
                    for &s in active {
                        let n = s as usize;
                        scores[n] -= ((rows[0][n] as i32 + ws[0]) << SCALE_SHIFT) as i32;
                    }
                }
                2 => {
                    for &s in active {
                        let n = s as usize;
                        let tmp = self
                            .add8
                            .add(rows[0][n] as i32 + ws[0], rows[1][n] as i32 + ws[1]);
                        scores[n] -= tmp << SCALE_SHIFT;
                    }
                }
                4 => {
                    for &s in active {
                        let n = s as usize;
                        let mut tmp = self
                            .add8
                            .add(rows[0][n] as i32 + ws[0], rows[1][n] as i32 + ws[1]);
                        tmp = self.add8.add(tmp, rows[2][n] as i32 + ws[2]);
                        tmp = self.add8.add(tmp, rows[3][n] as i32 + ws[3]);
                        scores[n] -= tmp << SCALE_SHIFT;
                    }
                }
                _ => {
                    for &s in active {
                        let n = s as usize;
                        let mut tmp = rows[0][n] as i32 + ws[0];
                        for k in 1..self.topn {
                            tmp = self.add8.add(tmp, rows[k][n] as i32 + ws[k]);
                        }
                        scores[n] -= tmp << SCALE_SHIFT;
                    }
                }
            }
        }
    }
}

/// `(511 - log) >> 10` with saturation, shared by the float loader and the
/// scoring loop's weight quantization.
fn quantize_weight(log_int: i32) -> Result<u8> {
    let q = (511 - log_int) >> SCALE_SHIFT;
    if q < 0 {
        return Err(SttError::out_of_range(
            "mixw",
            format!("quantized weight {} below zero", q),
        ));
    }
    Ok(q.min(255) as u8)
}

impl AcousticScorer for SemiMgau {
    fn n_senones(&self) -> usize {
        self.n_sen
    }

    fn begin_utt(&mut self) {
        for stream in self.lastf.iter_mut() {
            for (i, e) in stream.iter_mut().enumerate() {
                e.codeword = i;
                e.dist = WORST_DIST;
            }
        }
    }

    fn frame_eval(
        &mut self,
        feat: &Feature,
        frame_idx: i32,
        active: Option<&[i32]>,
        scores: &mut [i32],
    ) -> Result<()> {
        if feat.streams.len() != self.n_feat {
            return Err(SttError::bad_format(
                "feature",
                format!(
                    "frame has {} streams, model wants {}",
                    feat.streams.len(),
                    self.n_feat
                ),
            ));
        }
        for (i, stream) in feat.streams.iter().enumerate() {
            if stream.len() != self.veclen[i] {
                return Err(SttError::bad_format(
                    "feature",
                    format!(
                        "stream {} is {}-dimensional, model wants {}",
                        i,
                        stream.len(),
                        self.veclen[i]
                    ),
                ));
            }
            if stream.iter().all(|&v| v == 0.0) {
                debug!("Zero-energy frame at {}", frame_idx);
            }
        }
        for i in 0..self.n_feat {
            self.mgau_dist(frame_idx, i, &feat.streams[i]);
        }
        let weights = self.stream_weights();
        let all: Vec<i32>;
        let active = match active {
            Some(list) => list,
            None => {
                all = (0..self.n_sen as i32).collect();
                &all
            }
        };
        self.scores_topn(&weights, active, scores);
        Ok(())
    }
}
