//! A single active HMM instance inside the search: per-state Viterbi scores,
//! per-state history backpointers and the non-emitting exit state. The
//! update is the textbook max-over-predecessors recurrence with the allowed
//! predecessors (self, previous, skip) encoded in the transition matrix.
use crate::acoustic::tmat::Tmat;
use crate::logmath::LOG_ZERO;

/// Scores below this are dead; kept well above `i32::MIN` so sums of a score
/// and a transition cannot wrap.
pub const WORST_SCORE: i32 = LOG_ZERO;

/// Common topologies have 3 or 5 emitting states.
pub const MAX_HMM_STATES: usize = 5;

pub const NO_BP: i32 = -1;

#[derive(Debug, Clone, Copy)]
pub struct Hmm {
    pub ssid: i32,
    pub tmat_id: i32,
    pub scores: [i32; MAX_HMM_STATES],
    pub history: [i32; MAX_HMM_STATES],
    pub out_score: i32,
    pub out_history: i32,
    pub best_score: i32,
    /// Frame this instance last participated in; used as the activity stamp.
    pub frame: i32,
}

impl Hmm {
    pub fn new(ssid: i32, tmat_id: i32) -> Self {
        Self {
            ssid,
            tmat_id,
            scores: [WORST_SCORE; MAX_HMM_STATES],
            history: [NO_BP; MAX_HMM_STATES],
            out_score: WORST_SCORE,
            out_history: NO_BP,
            best_score: WORST_SCORE,
            frame: -1,
        }
    }

    pub fn clear(&mut self) {
        self.scores = [WORST_SCORE; MAX_HMM_STATES];
        self.history = [NO_BP; MAX_HMM_STATES];
        self.out_score = WORST_SCORE;
        self.out_history = NO_BP;
        self.best_score = WORST_SCORE;
        self.frame = -1;
    }

    pub fn is_active(&self, frame: i32) -> bool {
        self.frame == frame
    }

    /// Offer an entry score into the initial state; better offers win.
    pub fn enter(&mut self, score: i32, history: i32, frame: i32) {
        if score > self.scores[0] || !self.is_active(frame) {
            if !self.is_active(frame) {
                // Stale state from an earlier activation.
                self.clear();
            }
            if score > self.scores[0] {
                self.scores[0] = score;
                self.history[0] = history;
            }
            self.frame = frame;
        }
    }

    /// One frame of Viterbi update. Returns the best emitting-state score.
    pub fn eval(&mut self, n_emit: usize, tmat: &Tmat, sseq: &[u16], senscr: &[i32]) -> i32 {
        debug_assert!(n_emit <= MAX_HMM_STATES);
        let mut best = WORST_SCORE;
        // States descend so each update reads the previous frame's scores.
        for j in (0..n_emit).rev() {
            let mut score = WORST_SCORE;
            let mut hist = NO_BP;
            let lo = j.saturating_sub(2);
            for i in lo..=j {
                if self.scores[i] <= WORST_SCORE {
                    continue;
                }
                let tp = tmat.tp(self.tmat_id, i, j);
                if tp <= WORST_SCORE {
                    continue;
                }
                let cand = self.scores[i] + tp;
                if cand > score {
                    score = cand;
                    hist = self.history[i];
                }
            }
            if score > WORST_SCORE {
                score += senscr[sseq[j] as usize];
            }
            self.scores[j] = score.max(WORST_SCORE);
            self.history[j] = hist;
            if self.scores[j] > best {
                best = self.scores[j];
            }
        }
        // Exit through the non-emitting final state.
        self.out_score = WORST_SCORE;
        self.out_history = NO_BP;
        for i in n_emit.saturating_sub(2)..n_emit {
            if self.scores[i] <= WORST_SCORE {
                continue;
            }
            let tp = tmat.tp(self.tmat_id, i, n_emit);
            if tp <= WORST_SCORE {
                continue;
            }
            let cand = self.scores[i] + tp;
            if cand > self.out_score {
                self.out_score = cand;
                self.out_history = self.history[i];
            }
        }
        self.best_score = best;
        best
    }

    /// Shift all scores down, used when the frame best approaches the
    /// integer floor.
    pub fn renormalize(&mut self, norm: i32) {
        for s in self.scores.iter_mut() {
            if *s > WORST_SCORE {
                *s -= norm;
            }
        }
        if self.out_score > WORST_SCORE {
            self.out_score -= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmath::LogMath;

    fn scores(hmm: &Hmm, n: usize) -> Vec<i32> {
        hmm.scores[..n].to_vec()
    }

    #[test]
    fn entry_prefers_better_score() {
        let mut hmm = Hmm::new(0, 0);
        hmm.enter(-100, 3, 0);
        hmm.enter(-200, 4, 0);
        assert_eq!(hmm.scores[0], -100);
        assert_eq!(hmm.history[0], 3);
        hmm.enter(-50, 5, 0);
        assert_eq!(hmm.history[0], 5);
    }

    #[test]
    fn reentry_on_new_frame_clears_stale_state() {
        let mut hmm = Hmm::new(0, 0);
        hmm.enter(-100, 3, 0);
        hmm.scores[2] = -10;
        hmm.enter(-500, 9, 5);
        assert_eq!(hmm.scores[0], -500);
        assert_eq!(hmm.scores[2], WORST_SCORE);
        assert_eq!(hmm.history[0], 9);
    }

    #[test]
    fn scores_advance_through_states() {
        let lmath = LogMath::shared_default();
        let tmat = Tmat::bakis(1, 3, &lmath);
        let senscr = vec![-10i32; 16];
        let mut hmm = Hmm::new(0, 0);
        hmm.enter(0, 7, 0);
        let sseq = [0u16, 1, 2];

        let best = hmm.eval(3, &tmat, &sseq, &senscr);
        assert!(best > WORST_SCORE);
        // Only state 0 was seeded; states 1 and 2 can be reached via the
        // forward and skip arcs in a single step.
        let s = scores(&hmm, 3);
        assert!(s[0] > WORST_SCORE);
        assert!(s[1] > WORST_SCORE);
        assert!(s[2] > WORST_SCORE);
        assert!(s[0] >= s[1]);
        // The history backpointer rode along.
        assert_eq!(hmm.history[1], 7);
        assert!(hmm.out_score > WORST_SCORE);
        assert_eq!(hmm.out_history, 7);

        // Another frame strictly decreases the path scores.
        let prev = scores(&hmm, 3);
        hmm.eval(3, &tmat, &sseq, &senscr);
        for (now, before) in scores(&hmm, 3).iter().zip(&prev) {
            assert!(now < before);
        }
    }

    #[test]
    fn empty_hmm_stays_dead() {
        let lmath = LogMath::shared_default();
        let tmat = Tmat::bakis(1, 3, &lmath);
        let senscr = vec![-10i32; 16];
        let mut hmm = Hmm::new(0, 0);
        let best = hmm.eval(3, &tmat, &[0, 1, 2], &senscr);
        assert_eq!(best, WORST_SCORE);
        assert_eq!(hmm.out_score, WORST_SCORE);
    }

    #[test]
    fn renormalize_shifts_live_scores_only() {
        let lmath = LogMath::shared_default();
        let tmat = Tmat::bakis(1, 3, &lmath);
        let mut hmm = Hmm::new(0, 0);
        hmm.enter(-1000, 0, 0);
        hmm.eval(3, &tmat, &[0, 1, 2], &vec![-10i32; 16]);
        let before = hmm.scores;
        hmm.renormalize(-500);
        for (b, a) in before.iter().zip(hmm.scores.iter()) {
            if *b > WORST_SCORE {
                assert_eq!(*a, b + 500);
            } else {
                assert_eq!(*a, *b);
            }
        }
    }
}
