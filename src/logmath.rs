//! Integer log-domain arithmetic. All search scores are kept as `i32` logs in
//! a tiny base (1.0001 by default) so that products become additions and the
//! dynamic range of an utterance worth of acoustic scores still fits well
//! inside 32 bits. Adding two probabilities needs `log(b^a + b^c)` which we
//! do with a precomputed table of `log_b(1 + b^-d)` indexed by the score
//! difference, exactly the trick the search inner loops rely on.
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Logs more negative than this are treated as "probability zero". Chosen so
/// that sums of a few of them still don't wrap an `i32`.
pub const LOG_ZERO: i32 = i32::MIN >> 2;

/// Process-wide default table for the standard 1.0001 base. Model loads that
/// don't carry their own base share this one.
static DEFAULT: Lazy<Arc<LogMath>> = Lazy::new(|| Arc::new(LogMath::new(1.0001)));

pub struct LogMath {
    base: f64,
    log_of_base: f64,
    inv_log_of_base: f64,
    /// `add_table[d] = round(log_b(1 + b^-d))`, valid until the entry decays
    /// to zero.
    add_table: Vec<u16>,
}

impl LogMath {
    pub fn new(base: f64) -> Self {
        assert!(base > 1.0, "log base must be > 1");
        let log_of_base = base.ln();
        let inv_log_of_base = 1.0 / log_of_base;
        let mut add_table = Vec::new();
        let mut d = 0u32;
        loop {
            let v = (1.0 + base.powi(-(d as i32))).ln() * inv_log_of_base;
            let v = v.round() as u16;
            add_table.push(v);
            if v == 0 {
                break;
            }
            d += 1;
            // With very small bases the table is large (~100k entries for
            // 1.0001) but that is still only a couple hundred KB once.
            assert!(d < 1 << 24, "log base too close to 1");
        }
        Self {
            base,
            log_of_base,
            inv_log_of_base,
            add_table,
        }
    }

    pub fn shared_default() -> Arc<LogMath> {
        DEFAULT.clone()
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    /// Natural log → our integer log domain.
    pub fn ln_to_log(&self, ln: f64) -> i32 {
        let v = ln * self.inv_log_of_base;
        if v < LOG_ZERO as f64 {
            LOG_ZERO
        } else {
            v.round() as i32
        }
    }

    /// Linear probability → integer log.
    pub fn log(&self, p: f64) -> i32 {
        if p <= 0.0 {
            LOG_ZERO
        } else {
            self.ln_to_log(p.ln())
        }
    }

    pub fn log10_to_log(&self, log10: f64) -> i32 {
        self.ln_to_log(log10 * std::f64::consts::LN_10)
    }

    pub fn log_to_ln(&self, score: i32) -> f64 {
        score as f64 * self.log_of_base
    }

    pub fn log_to_log10(&self, score: i32) -> f64 {
        self.log_to_ln(score) / std::f64::consts::LN_10
    }

    pub fn exp(&self, score: i32) -> f64 {
        self.log_to_ln(score).exp()
    }

    /// `log_b(b^a + b^c)` via the add table.
    pub fn add(&self, a: i32, c: i32) -> i32 {
        let (hi, lo) = if a > c { (a, c) } else { (c, a) };
        if lo <= LOG_ZERO {
            return hi;
        }
        let d = (hi - lo) as usize;
        if d >= self.add_table.len() {
            hi
        } else {
            hi + self.add_table[d] as i32
        }
    }
}

impl std::fmt::Debug for LogMath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LogMath")
            .field("base", &self.base)
            .field("add_table_len", &self.add_table.len())
            .finish()
    }
}

/// The semi-continuous scorer works on 8-bit quantized, negated logs in units
/// of `1 << SCALE_SHIFT` raw log steps. Adding two of those probabilities is
/// a single lookup in this 64K table.
pub struct LogAdd8 {
    table: Vec<u8>,
}

pub const SCALE_SHIFT: u32 = 10;

impl LogAdd8 {
    pub fn new(lmath: &LogMath) -> Self {
        let mut table = vec![0u8; 256 * 256];
        for p1 in 0..256usize {
            for p2 in 0..256usize {
                let a = -((p1 as i32) << SCALE_SHIFT);
                let b = -((p2 as i32) << SCALE_SHIFT);
                let sum = lmath.add(a, b);
                let q = (-sum) >> SCALE_SHIFT;
                table[(p1 << 8) + p2] = q.clamp(0, 255) as u8;
            }
        }
        Self { table }
    }

    #[inline(always)]
    pub fn add(&self, p1: i32, p2: i32) -> i32 {
        self.table[(((p1 as usize) & 0xff) << 8) + ((p2 as usize) & 0xff)] as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_round_trips() {
        let lmath = LogMath::new(1.0001);
        for &p in &[1.0, 0.5, 0.1, 1e-5, 1e-20] {
            let s = lmath.log(p);
            assert!(s <= 0);
            let back = lmath.exp(s);
            assert!((back - p).abs() / p < 1e-3, "{} vs {}", back, p);
        }
        assert_eq!(lmath.log(0.0), LOG_ZERO);
        assert_eq!(lmath.log(1.0), 0);
    }

    #[test]
    fn add_is_log_sum() {
        let lmath = LogMath::new(1.0001);
        let a = lmath.log(0.25);
        let b = lmath.log(0.5);
        let sum = lmath.add(a, b);
        assert!((lmath.exp(sum) - 0.75).abs() < 1e-3);
        // Adding zero-probability is identity.
        assert_eq!(lmath.add(a, LOG_ZERO), a);
        // Symmetry.
        assert_eq!(lmath.add(a, b), lmath.add(b, a));
    }

    #[test]
    fn add8_matches_wide_add() {
        let lmath = LogMath::new(1.0001);
        let tbl = LogAdd8::new(&lmath);
        for (p1, p2) in [(0, 0), (10, 20), (100, 3), (255, 255), (0, 255)] {
            let wide = lmath.add(-(p1 << SCALE_SHIFT), -(p2 << SCALE_SHIFT));
            let narrow = -(tbl.add(p1, p2) << SCALE_SHIFT);
            assert!((wide - narrow).abs() <= 1 << SCALE_SHIFT);
        }
    }

    #[test]
    fn log10_conversion() {
        let lmath = LogMath::new(1.0001);
        let s = lmath.log10_to_log(-1.0);
        assert!((lmath.exp(s) - 0.1).abs() < 1e-4);
        assert!((lmath.log_to_log10(s) + 1.0).abs() < 1e-3);
    }
}
