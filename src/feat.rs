//! Reading feature frames from disk. The decoder consumes frames, it never
//! computes them, so the inputs here are either the classic cepstra file
//! (count header plus raw floats) or this crate's multi-stream dump which
//! carries the stream layout in its header.
use crate::acoustic::Feature;
use crate::error::{Result, SttError};
use std::io::{Read, Write};

const FEAT_MAGIC: u32 = 0x46454154; // "FEAT"

/// Sphinx cepstra file: a 32-bit float count (byte order detected from
/// plausibility) followed by the values; frames are `ceplen` wide, one
/// stream.
pub fn read_mfc(mut rdr: impl Read, ceplen: usize) -> Result<Vec<Feature>> {
    let mut bytes = Vec::new();
    rdr.read_to_end(&mut bytes)?;
    if bytes.len() < 4 {
        return Err(SttError::bad_format("mfc", "truncated header"));
    }
    let mut count = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let expected = (bytes.len() - 4) / 4;
    let mut swap = false;
    if count as usize != expected {
        count = count.swap_bytes();
        if count as usize != expected {
            return Err(SttError::bad_format(
                "mfc",
                format!("count {} does not match payload {}", count, expected),
            ));
        }
        swap = true;
    }
    if count as usize % ceplen != 0 {
        return Err(SttError::bad_format(
            "mfc",
            format!("{} values do not divide into {}-dim frames", count, ceplen),
        ));
    }
    let mut values = Vec::with_capacity(count as usize);
    for chunk in bytes[4..4 + count as usize * 4].chunks_exact(4) {
        let v = u32::from_le_bytes(chunk.try_into().unwrap());
        values.push(f32::from_bits(if swap { v.swap_bytes() } else { v }));
    }
    Ok(values
        .chunks_exact(ceplen)
        .map(|c| Feature::single(c.to_vec()))
        .collect())
}

pub fn write_mfc(mut w: impl Write, frames: &[Feature]) -> Result<()> {
    let count: usize = frames.iter().map(|f| f.streams[0].len()).sum();
    w.write_all(&(count as i32).to_le_bytes())?;
    for f in frames {
        for v in &f.streams[0] {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Multi-stream frame dump: magic, stream count and widths, frame count,
/// then the float payload frame by frame.
pub fn read_feat(mut rdr: impl Read) -> Result<Vec<Feature>> {
    let mut buf = [0u8; 4];
    let mut u32_of = |rdr: &mut dyn Read| -> Result<u32> {
        rdr.read_exact(&mut buf)
            .map_err(|_| SttError::bad_format("feat", "truncated header"))?;
        Ok(u32::from_le_bytes(buf))
    };
    if u32_of(&mut rdr)? != FEAT_MAGIC {
        return Err(SttError::bad_format("feat", "bad magic"));
    }
    let n_streams = u32_of(&mut rdr)? as usize;
    if n_streams == 0 || n_streams > 16 {
        return Err(SttError::bad_format("feat", "implausible stream count"));
    }
    let mut widths = Vec::with_capacity(n_streams);
    for _ in 0..n_streams {
        widths.push(u32_of(&mut rdr)? as usize);
    }
    let n_frames = u32_of(&mut rdr)? as usize;
    let mut frames = Vec::with_capacity(n_frames);
    let mut fbuf = Vec::new();
    for _ in 0..n_frames {
        let mut streams = Vec::with_capacity(n_streams);
        for &w in &widths {
            fbuf.resize(w * 4, 0);
            rdr.read_exact(&mut fbuf)
                .map_err(|_| SttError::bad_format("feat", "truncated frames"))?;
            streams.push(
                fbuf.chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            );
        }
        frames.push(Feature { streams });
    }
    Ok(frames)
}

pub fn write_feat(mut w: impl Write, frames: &[Feature]) -> Result<()> {
    let first = frames
        .first()
        .ok_or_else(|| SttError::bad_format("feat", "no frames to write"))?;
    w.write_all(&FEAT_MAGIC.to_le_bytes())?;
    w.write_all(&(first.streams.len() as u32).to_le_bytes())?;
    for s in &first.streams {
        w.write_all(&(s.len() as u32).to_le_bytes())?;
    }
    w.write_all(&(frames.len() as u32).to_le_bytes())?;
    for f in frames {
        for s in &f.streams {
            for v in s {
                w.write_all(&v.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn mfc_round_trip() {
        let frames = vec![
            Feature::single(vec![1.0, 2.0, 3.0]),
            Feature::single(vec![-1.0, 0.5, 0.0]),
        ];
        let mut bytes = Vec::new();
        write_mfc(&mut bytes, &frames).unwrap();
        let back = read_mfc(Cursor::new(bytes), 3).unwrap();
        assert_eq!(back, frames);
    }

    #[test]
    fn mfc_rejects_bad_frame_width() {
        let frames = vec![Feature::single(vec![1.0, 2.0, 3.0])];
        let mut bytes = Vec::new();
        write_mfc(&mut bytes, &frames).unwrap();
        assert!(read_mfc(Cursor::new(bytes), 2).is_err());
    }

    #[test]
    fn feat_round_trip_multistream() {
        let frames = vec![
            Feature {
                streams: vec![vec![1.0, 2.0], vec![3.0], vec![4.0, 5.0, 6.0]],
            },
            Feature {
                streams: vec![vec![-1.0, -2.0], vec![-3.0], vec![0.0, 0.0, 1.0]],
            },
        ];
        let mut bytes = Vec::new();
        write_feat(&mut bytes, &frames).unwrap();
        let back = read_feat(Cursor::new(bytes)).unwrap();
        assert_eq!(back, frames);
    }
}
