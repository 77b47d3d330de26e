//! Legacy binary dump format reader ("Darpa Trigram LM"). Kept for
//! back-compat only; the native trie binary is the preferred format. The
//! dump stores bigrams under their first word with 16-bit quantized
//! prob/backoff indices, and trigram segments addressed through a segment
//! base table, all of which gets unpacked into raw N-grams here and rebuilt
//! into the packed trie by the caller.
use crate::error::{Result, SttError};
use crate::lm::trie::RawNgram;
use crate::lm::RawLm;
use std::io::Read;
use tracing::info;

pub const DMP_HEADER: &str = "Darpa Trigram LM";
const BIGRAM_SEGMENT_SIZE: u32 = 9;
const LN_10: f32 = std::f32::consts::LN_10;

struct DmpCursor<R> {
    rdr: R,
    swap: bool,
}

impl<R: Read> DmpCursor<R> {
    fn i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.rdr.read_exact(&mut b)?;
        Ok(if self.swap {
            i32::from_be_bytes(b)
        } else {
            i32::from_le_bytes(b)
        })
    }

    fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.rdr.read_exact(&mut b)?;
        Ok(if self.swap {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.i32()? as u32))
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.rdr.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// log10 weight table with a leading count; returns natural logs.
fn read_weight_table<R: Read>(c: &mut DmpCursor<R>) -> Result<Vec<f32>> {
    let k = c.i32()?;
    if k < 0 {
        return Err(SttError::bad_format("dmp", "negative weight table size"));
    }
    let mut out = Vec::with_capacity(k as usize);
    for _ in 0..k {
        out.push(c.f32()? * LN_10);
    }
    Ok(out)
}

pub fn read(rdr: impl Read) -> Result<RawLm> {
    let mut c = DmpCursor { rdr, swap: false };

    let hdr_len = (DMP_HEADER.len() + 1) as i32;
    let k = c.i32()?;
    if k != hdr_len {
        if k.swap_bytes() != hdr_len {
            return Err(SttError::bad_format(
                "dmp",
                format!("wrong magic header size number {:#x}", k),
            ));
        }
        c.swap = true;
    }
    let hdr = c.bytes(hdr_len as usize)?;
    if &hdr[..DMP_HEADER.len()] != DMP_HEADER.as_bytes() {
        return Err(SttError::bad_format("dmp", "wrong header string"));
    }

    // Original LM filename, unused.
    let k = c.i32()?;
    c.bytes(k as usize)?;

    // Version (<= 0), timestamp and format description strings; an old
    // enough file has the unigram count in the version slot instead.
    let vn = c.i32()?;
    let ucount = if vn <= 0 {
        let _ts = c.i32()?;
        loop {
            let k = c.i32()?;
            if k == 0 {
                break;
            }
            c.bytes(k as usize)?;
        }
        c.i32()?
    } else {
        vn
    };
    let bcount = c.i32()?;
    let tcount = c.i32()?;
    if ucount < 0 || bcount < 0 || tcount < 0 {
        return Err(SttError::bad_format("dmp", "negative ngram count"));
    }
    info!("ngrams 1={}, 2={}, 3={}", ucount, bcount, tcount);
    let counts: Vec<u32> = if tcount > 0 {
        vec![ucount as u32, bcount as u32, tcount as u32]
    } else if bcount > 0 {
        vec![ucount as u32, bcount as u32]
    } else {
        vec![ucount as u32]
    };
    let order = counts.len();

    let mut unigrams = Vec::with_capacity(ucount as usize);
    let mut unigram_next = Vec::with_capacity(ucount as usize + 1);
    for _ in 0..=ucount {
        let _mapid = c.i32()?;
        let prob = c.f32()?;
        let bo = c.f32()?;
        let bigrams = c.i32()?;
        unigrams.push((prob * LN_10, bo * LN_10));
        unigram_next.push(bigrams as u32);
    }
    unigrams.truncate(ucount as usize);

    let mut raw: Vec<Vec<RawNgram>> = Vec::new();
    if order > 1 {
        // Bigram records: second word, prob index, backoff index and the
        // within-segment trigram offset.
        let mut bigrams = Vec::with_capacity(bcount as usize);
        let mut bigrams_next = Vec::with_capacity(bcount as usize + 1);
        let mut owner = 1usize;
        for j in 0..=bcount as usize {
            let wid = c.u16()?;
            while owner < ucount as usize && j as u32 == unigram_next[owner] {
                owner += 1;
            }
            let prob_idx = c.u16()?;
            let bo_idx = c.u16()?;
            bigrams_next.push(c.u16()?);
            if j != bcount as usize {
                bigrams.push((wid as u32, owner as u32 - 1, prob_idx, bo_idx));
            }
        }
        if owner < ucount as usize {
            return Err(SttError::bad_format(
                "dmp",
                format!("corrupted model, not enough unigrams {} {}", owner, ucount),
            ));
        }

        let mut trigrams = Vec::with_capacity(tcount as usize);
        for _ in 0..tcount {
            let wid = c.u16()?;
            let prob_idx = c.u16()?;
            trigrams.push((wid as u32, prob_idx));
        }

        let prob2 = read_weight_table(&mut c)?;
        let lookup = |table: &[f32], idx: u16, what| -> Result<f32> {
            table.get(idx as usize).copied().ok_or_else(|| {
                SttError::out_of_range("dmp", format!("{} index {} out of table", what, idx))
            })
        };

        if order > 2 {
            let bo2 = read_weight_table(&mut c)?;
            let prob3 = read_weight_table(&mut c)?;
            let tseg_len = c.i32()?;
            let mut tseg_base = Vec::with_capacity(tseg_len as usize);
            for _ in 0..tseg_len {
                tseg_base.push(c.i32()?);
            }

            let mut level2 = Vec::with_capacity(bcount as usize);
            for &(wid, owner, prob_idx, bo_idx) in &bigrams {
                level2.push(RawNgram {
                    words: vec![wid, owner],
                    prob: lookup(&prob2, prob_idx, "bigram prob")?,
                    backoff: lookup(&bo2, bo_idx, "bigram backoff")?,
                });
            }

            // Trigrams inherit their first two words from the owning bigram
            // through the segment base table.
            let mut level3 = Vec::with_capacity(tcount as usize);
            let mut tri_idx = 0usize;
            for j in 1..=bcount as usize {
                let seg = tseg_base
                    .get(j >> BIGRAM_SEGMENT_SIZE)
                    .copied()
                    .unwrap_or(0);
                let next = seg as u32 + bigrams_next[j] as u32;
                while (tri_idx as u32) < next && tri_idx < trigrams.len() {
                    let (wid, prob_idx) = trigrams[tri_idx];
                    let (w2, w1, _, _) = bigrams[j - 1];
                    level3.push(RawNgram {
                        words: vec![wid, w2, w1],
                        prob: lookup(&prob3, prob_idx, "trigram prob")?,
                        backoff: 0.0,
                    });
                    tri_idx += 1;
                }
            }
            if tri_idx < tcount as usize {
                return Err(SttError::bad_format(
                    "dmp",
                    "corrupted model, some trigrams have no corresponding bigram \
                     (convert this model to the trie binary format)",
                ));
            }
            raw.push(level2);
            raw.push(level3);
        } else {
            let mut level2 = Vec::with_capacity(bcount as usize);
            for &(wid, owner, prob_idx, _) in &bigrams {
                level2.push(RawNgram {
                    words: vec![wid, owner],
                    prob: lookup(&prob2, prob_idx, "bigram prob")?,
                    backoff: 0.0,
                });
            }
            raw.push(level2);
        }
    }

    // Word string blob, NUL separated.
    let blob_len = c.i32()?;
    let blob = c.bytes(blob_len as usize)?;
    let word_str: Vec<String> = blob
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    if word_str.len() != ucount as usize {
        return Err(SttError::bad_format(
            "dmp",
            format!(
                "word strings ({}) don't match unigram count ({})",
                word_str.len(),
                ucount
            ),
        ));
    }

    Ok(RawLm {
        counts,
        word_str,
        unigrams,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a tiny 3-gram dump in memory: 3 unigrams (a b c), bigrams
    /// (a b), (b c), one trigram (a b c).
    fn tiny_dmp() -> Vec<u8> {
        let mut out = Vec::new();
        let push_i32 = |out: &mut Vec<u8>, v: i32| out.extend_from_slice(&v.to_le_bytes());
        let push_u16 = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_le_bytes());
        let push_f32 = |out: &mut Vec<u8>, v: f32| out.extend_from_slice(&v.to_le_bytes());

        push_i32(&mut out, (DMP_HEADER.len() + 1) as i32);
        out.extend_from_slice(DMP_HEADER.as_bytes());
        out.push(0);
        push_i32(&mut out, 5);
        out.extend_from_slice(b"x.lm\0");
        push_i32(&mut out, -1); // version
        push_i32(&mut out, 0); // timestamp
        push_i32(&mut out, 4);
        out.extend_from_slice(b"fmt\0");
        push_i32(&mut out, 0); // end of description
        push_i32(&mut out, 3); // ucount
        push_i32(&mut out, 2); // bcount
        push_i32(&mut out, 1); // tcount

        // Unigrams: (mapid, prob, bo, first_bigram) x 4 (incl sentinel).
        for (prob, bo, next) in [
            (-0.5f32, -0.3f32, 0i32),
            (-0.7, -0.2, 1),
            (-0.9, 0.0, 2),
            (0.0, 0.0, 2),
        ] {
            push_i32(&mut out, 0);
            push_f32(&mut out, prob);
            push_f32(&mut out, bo);
            push_i32(&mut out, next);
        }
        // Bigrams (incl sentinel): wid, prob_idx, bo_idx, next.
        push_u16(&mut out, 1); // a -> b
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 2); // b -> c
        push_u16(&mut out, 1);
        push_u16(&mut out, 1);
        push_u16(&mut out, 1);
        push_u16(&mut out, 0); // sentinel
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 1);
        // Trigram: wid=c, prob_idx=0.
        push_u16(&mut out, 2);
        push_u16(&mut out, 0);
        // prob2 table.
        push_i32(&mut out, 2);
        push_f32(&mut out, -0.4);
        push_f32(&mut out, -0.6);
        // bo2 table.
        push_i32(&mut out, 2);
        push_f32(&mut out, -0.1);
        push_f32(&mut out, -0.2);
        // prob3 table.
        push_i32(&mut out, 1);
        push_f32(&mut out, -0.8);
        // tseg_base.
        push_i32(&mut out, 1);
        push_i32(&mut out, 0);
        // Word strings.
        push_i32(&mut out, 6);
        out.extend_from_slice(b"a\0b\0c\0");
        out
    }

    #[test]
    fn parse_tiny_dump() {
        let data = read(tiny_dmp().as_slice()).unwrap();
        assert_eq!(data.counts, vec![3, 2, 1]);
        assert_eq!(data.word_str, vec!["a", "b", "c"]);
        // Bigram (a b): trie order [b, a].
        assert_eq!(data.raw[0][0].words, vec![1, 0]);
        assert!((data.raw[0][0].prob - (-0.4 * LN_10)).abs() < 1e-4);
        // Trigram (a b c): trie order [c, b, a].
        assert_eq!(data.raw[1][0].words, vec![2, 1, 0]);
        assert!((data.raw[1][0].prob - (-0.8 * LN_10)).abs() < 1e-4);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = tiny_dmp();
        bytes[4] = b'X';
        assert!(matches!(
            read(bytes.as_slice()),
            Err(SttError::BadFormat { .. })
        ));
    }
}
