//! 16-bit quantization of N-gram log probabilities and backoff weights.
//! Values are binned by equal mass over the sorted training values and each
//! bin stores its mean; encoding picks the nearest bin centre, decoding is a
//! table lookup. Unigrams are not quantized.
use crate::error::{Result, SttError};
use std::io::{Read, Write};

pub const PROB_BITS: u8 = 16;
pub const BO_BITS: u8 = 16;
const TABLE_LEN: usize = 1 << PROB_BITS as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Bins {
    centers: Vec<f32>,
}

impl Bins {
    fn zeroed() -> Self {
        Self {
            centers: vec![0.0; TABLE_LEN],
        }
    }

    /// Equal-mass binning: the i-th bin covers the i-th slice of the sorted
    /// value list and its centre is the slice mean. Empty slices inherit the
    /// previous centre.
    pub fn train(values: &mut [f32]) -> Self {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut centers = Vec::with_capacity(TABLE_LEN);
        let mut start = 0usize;
        for i in 0..TABLE_LEN {
            let finish = (values.len() as u64 * (i as u64 + 1) / TABLE_LEN as u64) as usize;
            if finish == start {
                let prev = centers.last().copied().unwrap_or(f32::NEG_INFINITY);
                centers.push(prev);
            } else {
                let sum: f32 = values[start..finish].iter().sum();
                centers.push(sum / (finish - start) as f32);
            }
            start = finish;
        }
        Self { centers }
    }

    pub fn encode(&self, value: f32) -> u32 {
        // First centre >= value.
        let above = self.centers.partition_point(|&c| c < value);
        if above == 0 {
            return 0;
        }
        if above == self.centers.len() {
            return (self.centers.len() - 1) as u32;
        }
        // Pick whichever neighbour is closer.
        let lower = self.centers[above - 1];
        let upper = self.centers[above];
        if value - lower < upper - value {
            (above - 1) as u32
        } else {
            above as u32
        }
    }

    pub fn decode(&self, idx: u32) -> f32 {
        self.centers[idx as usize]
    }
}

/// Quantizer tables for every packed trie level: a (prob, backoff) pair per
/// middle order and a prob-only table for the longest order.
#[derive(Debug, Clone, PartialEq)]
pub struct LmQuant {
    middles: Vec<(Bins, Bins)>,
    longest: Bins,
}

impl LmQuant {
    pub fn new(order: usize) -> Self {
        assert!(order >= 2);
        Self {
            middles: (0..order - 2).map(|_| (Bins::zeroed(), Bins::zeroed())).collect(),
            longest: Bins::zeroed(),
        }
    }

    /// Bits per packed middle entry (prob + backoff).
    pub fn middle_bits(&self) -> u8 {
        PROB_BITS + BO_BITS
    }

    pub fn longest_bits(&self) -> u8 {
        PROB_BITS
    }

    pub fn train_middle(&mut self, order: usize, probs: &mut [f32], backoffs: &mut [f32]) {
        let slot = &mut self.middles[order - 2];
        slot.0 = Bins::train(probs);
        slot.1 = Bins::train(backoffs);
    }

    pub fn train_longest(&mut self, probs: &mut [f32]) {
        self.longest = Bins::train(probs);
    }

    /// Packed middle value with backoff in the low bits, matching the packed
    /// entry layout `[word][bo][prob][next]`.
    pub fn encode_middle(&self, order: usize, prob: f32, backoff: f32) -> u64 {
        let slot = &self.middles[order - 2];
        ((slot.0.encode(prob) as u64) << BO_BITS) | slot.1.encode(backoff) as u64
    }

    pub fn decode_middle_prob(&self, order: usize, packed: u64) -> f32 {
        self.middles[order - 2]
            .0
            .decode(((packed >> BO_BITS) & 0xffff) as u32)
    }

    pub fn decode_middle_bo(&self, order: usize, packed: u64) -> f32 {
        self.middles[order - 2].1.decode((packed & 0xffff) as u32)
    }

    pub fn encode_longest(&self, prob: f32) -> u32 {
        self.longest.encode(prob)
    }

    pub fn decode_longest(&self, idx: u32) -> f32 {
        self.longest.decode(idx)
    }

    /// Resolution of a table, i.e. the largest gap between adjacent centres.
    /// Round-trip tests bound their error with this.
    pub fn longest_resolution(&self) -> f32 {
        self.longest
            .centers
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| d.is_finite())
            .fold(0.0f32, f32::max)
    }

    /// Serialized as a leading legacy type marker then the raw tables in
    /// level order.
    pub fn write(&self, mut w: impl Write) -> Result<()> {
        w.write_all(&1i32.to_le_bytes())?;
        for (probs, bos) in &self.middles {
            write_table(&mut w, &probs.centers)?;
            write_table(&mut w, &bos.centers)?;
        }
        write_table(&mut w, &self.longest.centers)?;
        Ok(())
    }

    pub fn read(mut r: impl Read, order: usize) -> Result<Self> {
        let mut marker = [0u8; 4];
        r.read_exact(&mut marker)?;
        let mut quant = Self::new(order);
        for i in 0..order - 2 {
            quant.middles[i].0.centers = read_table(&mut r)?;
            quant.middles[i].1.centers = read_table(&mut r)?;
        }
        quant.longest.centers = read_table(&mut r)?;
        Ok(quant)
    }
}

fn write_table(w: &mut impl Write, table: &[f32]) -> Result<()> {
    for v in table {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_table(r: &mut impl Read) -> Result<Vec<f32>> {
    let mut buf = vec![0u8; TABLE_LEN * 4];
    r.read_exact(&mut buf)
        .map_err(|_| SttError::bad_format("lm quantizer", "truncated quantizer table"))?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_is_near_identity() {
        let mut values: Vec<f32> = (0..1000).map(|i| -(i as f32) * 0.01).collect();
        let bins = Bins::train(&mut values.clone());
        for &v in values.iter().step_by(37) {
            let decoded = bins.decode(bins.encode(v));
            assert!((decoded - v).abs() < 0.02, "{} -> {}", v, decoded);
        }
    }

    #[test]
    fn encode_clamps_out_of_range() {
        let mut values = vec![-3.0f32, -2.0, -1.0];
        let bins = Bins::train(&mut values);
        assert_eq!(bins.decode(bins.encode(-100.0)), bins.decode(0));
        let top = bins.encode(5.0);
        assert!((bins.decode(top) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn middle_packing() {
        let mut quant = LmQuant::new(3);
        let mut probs = vec![-0.1f32, -0.5, -1.5, -2.5];
        let mut bos = vec![-0.2f32, -0.4, -0.9];
        quant.train_middle(2, &mut probs, &mut bos);
        let packed = quant.encode_middle(2, -1.5, -0.4);
        assert!((quant.decode_middle_prob(2, packed) + 1.5).abs() < 1e-3);
        assert!((quant.decode_middle_bo(2, packed) + 0.4).abs() < 1e-3);
    }

    #[test]
    fn serialization_round_trip() {
        let mut quant = LmQuant::new(3);
        let mut probs = vec![-0.1f32, -0.5, -1.5];
        let mut bos = vec![-0.2f32, -0.4];
        quant.train_middle(2, &mut probs, &mut bos);
        quant.train_longest(&mut vec![-0.3f32, -0.7, -2.0]);

        let mut bytes = Vec::new();
        quant.write(&mut bytes).unwrap();
        let back = LmQuant::read(bytes.as_slice(), 3).unwrap();
        assert_eq!(quant, back);
    }
}
