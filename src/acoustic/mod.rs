//! Acoustic scoring: per-frame senone log likelihoods. Two evaluator
//! families implement the same contract, the semi-continuous top-N scorer
//! with its shared codebook and 8-bit quantized mixture weights, and the
//! plain continuous per-senone mixtures. Feature frames arrive from outside,
//! already split into streams; nothing in here computes MFCCs.
use crate::error::{Result, SttError};
use ndarray::Array2;
use std::io::{Read, Write};

pub mod cont;
pub mod kdtree;
pub mod semi;
pub mod tmat;

/// One frame of feature data, one vector per stream. The semi-continuous
/// models use the classic four streams (cep, dcep, pow, ddcep); continuous
/// models use a single concatenated vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub streams: Vec<Vec<f32>>,
}

impl Feature {
    pub fn single(vec: Vec<f32>) -> Self {
        Self { streams: vec![vec] }
    }
}

/// The scoring contract: fill `scores` (indexed by senone id, integer log
/// domain, non-positive) for the active senones. `None` means score
/// everything.
pub trait AcousticScorer {
    fn n_senones(&self) -> usize;

    fn frame_eval(
        &mut self,
        feat: &Feature,
        frame_idx: i32,
        active: Option<&[i32]>,
        scores: &mut [i32],
    ) -> Result<()>;

    /// Reset any cross-frame state at utterance start.
    fn begin_utt(&mut self) {}
}

const S3_MAGIC: u32 = 0x11223344;

/// A Sphinx-3 style parameter file: text header terminated by `endhdr`, a
/// byte-order magic, then 32-bit counts and a float payload with a length
/// prefix. Callers pull the counts they expect, then the payload.
pub(crate) struct S3Reader {
    bytes: Vec<u8>,
    pos: usize,
    swap: bool,
    what: &'static str,
}

impl S3Reader {
    pub(crate) fn open(mut rdr: impl Read, what: &'static str) -> Result<Self> {
        let mut bytes = Vec::new();
        rdr.read_to_end(&mut bytes)?;
        let mut pos = 0usize;
        let mut saw_s3 = false;
        loop {
            let nl = bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| SttError::bad_format(what, "no endhdr line"))?;
            let line = std::str::from_utf8(&bytes[pos..pos + nl])
                .map_err(|_| SttError::bad_format(what, "non-ASCII header"))?
                .trim()
                .to_string();
            pos += nl + 1;
            if !saw_s3 {
                if line != "s3" {
                    return Err(SttError::bad_format(what, "missing s3 header"));
                }
                saw_s3 = true;
                continue;
            }
            if line == "endhdr" {
                break;
            }
        }
        let mut rdr = Self {
            bytes,
            pos,
            swap: false,
            what,
        };
        let magic = rdr.u32()?;
        if magic != S3_MAGIC {
            if magic.swap_bytes() != S3_MAGIC {
                return Err(SttError::bad_format(what, "bad byte-order magic"));
            }
            rdr.swap = true;
        }
        Ok(rdr)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.bytes.len() {
            return Err(SttError::bad_format(self.what, "truncated counts"));
        }
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    /// Length-prefixed float payload.
    pub(crate) fn values(&mut self) -> Result<Vec<f32>> {
        let n = self.u32()? as usize;
        if self.pos + n * 4 > self.bytes.len() {
            return Err(SttError::bad_format(self.what, "truncated float payload"));
        }
        let mut values = Vec::with_capacity(n);
        for chunk in self.bytes[self.pos..self.pos + n * 4].chunks_exact(4) {
            let v = u32::from_le_bytes(chunk.try_into().unwrap());
            values.push(f32::from_bits(if self.swap { v.swap_bytes() } else { v }));
        }
        self.pos += n * 4;
        Ok(values)
    }
}

pub(crate) fn write_s3(
    mut w: impl Write,
    comment: &str,
    counts: &[u32],
    values: &[f32],
) -> Result<()> {
    writeln!(w, "s3")?;
    writeln!(w, "# {}", comment)?;
    writeln!(w, "version 1.0")?;
    writeln!(w, "endhdr")?;
    w.write_all(&S3_MAGIC.to_le_bytes())?;
    for c in counts {
        w.write_all(&c.to_le_bytes())?;
    }
    w.write_all(&(values.len() as u32).to_le_bytes())?;
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Reshape a flat parameter payload into per-row views.
pub(crate) fn into_array2(
    values: Vec<f32>,
    rows: usize,
    cols: usize,
    what: &'static str,
) -> Result<Array2<f32>> {
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|_| SttError::bad_format(what, "payload does not match declared shape"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn s3_round_trip() {
        let mut bytes = Vec::new();
        write_s3(&mut bytes, "test data", &[2, 3], &[1.0, -2.5, 0.25]).unwrap();
        let mut rdr = S3Reader::open(Cursor::new(bytes), "test").unwrap();
        assert_eq!(rdr.u32().unwrap(), 2);
        assert_eq!(rdr.u32().unwrap(), 3);
        assert_eq!(rdr.values().unwrap(), vec![1.0, -2.5, 0.25]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = b"s3\nendhdr\n\xde\xad\xbe\xef".to_vec();
        assert!(S3Reader::open(Cursor::new(bytes), "test").is_err());
    }

    #[test]
    fn missing_header_is_rejected() {
        let bytes = b"not a header\n".to_vec();
        assert!(S3Reader::open(Cursor::new(bytes), "test").is_err());
    }
}
