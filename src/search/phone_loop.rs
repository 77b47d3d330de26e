//! Cheap context-independent phone loop. Runs alongside the main search and
//! provides a per-phone upper bound on how well the acoustics support each
//! base phone right now; the tree search adds that (weighted) as a lookahead
//! bias before pruning.
use super::hmm::{Hmm, WORST_SCORE};
use crate::acoustic::tmat::Tmat;
use crate::mdef::BinMdef;
use std::sync::Arc;

pub struct PhoneLoop {
    mdef: Arc<BinMdef>,
    tmat: Arc<Tmat>,
    hmms: Vec<Hmm>,
    penalties: Vec<i32>,
    pl_weight: f32,
    pl_beam: i32,
}

impl PhoneLoop {
    pub fn new(mdef: Arc<BinMdef>, tmat: Arc<Tmat>, pl_weight: f32, pl_beam: i32) -> Self {
        let hmms = (0..mdef.n_ciphone() as i32)
            .map(|ci| {
                let p = mdef.phone(ci);
                Hmm::new(p.ssid, p.tmat)
            })
            .collect();
        Self {
            penalties: vec![0; mdef.n_ciphone()],
            mdef,
            tmat,
            hmms,
            pl_weight,
            pl_beam,
        }
    }

    pub fn begin(&mut self) {
        for hmm in self.hmms.iter_mut() {
            hmm.clear();
            hmm.enter(0, 0, 0);
        }
        for p in self.penalties.iter_mut() {
            *p = 0;
        }
    }

    /// All CI senones, which is what the loop needs scored every frame.
    pub fn active_senones(&self, out: &mut Vec<i32>) {
        out.extend(0..self.mdef.n_ci_sen() as i32);
    }

    pub fn step(&mut self, frame: i32, senscr: &[i32]) {
        let n_emit = self.mdef.n_emit_state();
        let mut best = WORST_SCORE;
        let mut best_out = WORST_SCORE;
        for hmm in self.hmms.iter_mut() {
            let sseq = self.mdef.sseq(hmm.ssid);
            let s = hmm.eval(n_emit, &self.tmat, sseq, senscr);
            // Keep the loop HMMs continuously active; re-entry merges.
            hmm.frame = frame + 1;
            if s > best {
                best = s;
            }
            if hmm.out_score > best_out {
                best_out = hmm.out_score;
            }
        }
        for (ci, hmm) in self.hmms.iter_mut().enumerate() {
            let gap = if hmm.best_score <= WORST_SCORE {
                self.pl_beam
            } else {
                (hmm.best_score - best).max(self.pl_beam)
            };
            self.penalties[ci] = (gap as f64 * self.pl_weight as f64) as i32;
            // The loop re-seeds every phone from the frame's best exit.
            if best_out > WORST_SCORE {
                hmm.enter(best_out, 0, frame + 1);
            }
        }
    }

    /// Lookahead bias for a base phone; zero or negative.
    pub fn penalty(&self, ci: i32) -> i32 {
        self.penalties
            .get(ci as usize)
            .copied()
            .unwrap_or(self.pl_beam)
            .min(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmath::LogMath;
    use crate::mdef::tests::tiny_mdef;

    fn setup() -> PhoneLoop {
        let mdef = Arc::new(tiny_mdef());
        let lmath = LogMath::shared_default();
        let tmat = Arc::new(Tmat::bakis(mdef.n_tmat(), mdef.n_emit_state(), &lmath));
        PhoneLoop::new(mdef, tmat, 3.0, -100_000)
    }

    #[test]
    fn favoured_phone_gets_no_penalty() {
        let mut pl = setup();
        pl.begin();
        // Senone scores strongly favouring phone 0 (senones 0..3).
        let mut senscr = vec![-50_000i32; 32];
        senscr[0] = -10;
        senscr[1] = -10;
        senscr[2] = -10;
        pl.step(0, &senscr);
        assert_eq!(pl.penalty(0), 0);
        assert!(pl.penalty(1) < 0);
        // Penalties are floored by the phone-loop beam times the weight.
        assert!(pl.penalty(1) >= (-100_000f64 * 3.0) as i32);
    }

    #[test]
    fn unknown_phone_is_floored() {
        let pl = setup();
        assert!(pl.penalty(99) < 0);
    }
}
