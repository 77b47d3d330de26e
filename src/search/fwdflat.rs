//! Second pass: flat-lexicon rescoring. Only words the first pass actually
//! saw (within a window of where it saw them) are instantiated, each as its
//! own HMM chain with no prefix sharing, and the pass re-decodes the stored
//! frames with tighter beams and usually a higher language weight.
use super::bptable::BpTable;
use super::hmm::{Hmm, NO_BP, WORST_SCORE};
use super::lm_history;
use crate::acoustic::tmat::Tmat;
use crate::acoustic::{AcousticScorer, Feature};
use crate::config::DecoderConfig;
use crate::dict::{Dict, SILENCE_WORD, START_WORD};
use crate::error::Result;
use crate::lm::NgramModel;
use crate::logmath::LogMath;
use crate::mdef::{BinMdef, WordPosition};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A word must have persisted this many end frames in the first pass.
const DEFAULT_EFWID: i32 = 4;
/// And is considered near a frame within this window of its segment.
const DEFAULT_SFWIN: i32 = 25;

const RENORM_THRESHOLD: i32 = WORST_SCORE / 2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FwdflatParams {
    pub beam: i32,
    pub wbeam: i32,
    pub lw: f32,
    pub orig_lw: f32,
    pub wip: f32,
    pub silpen: i32,
    pub fillpen: i32,
    pub efwid: i32,
    pub sfwin: i32,
}

impl FwdflatParams {
    pub fn from_config(config: &DecoderConfig, lmath: &LogMath) -> Self {
        Self {
            beam: lmath.log(config.fwdflatbeam),
            wbeam: lmath.log(config.fwdflatwbeam),
            lw: config.fwdflatlw,
            orig_lw: config.lw,
            wip: config.wip,
            silpen: lmath.log(config.silprob as f64) + lmath.log(config.wip as f64),
            fillpen: lmath.log(config.fillprob as f64) + lmath.log(config.wip as f64),
            efwid: DEFAULT_EFWID,
            sfwin: DEFAULT_SFWIN,
        }
    }
}

struct FlatWord {
    wid: i32,
    hmms: Vec<Hmm>,
    /// First-pass segments (sf, ef) gating when this word may start.
    segments: Vec<(i32, i32)>,
    active_frame: i32,
}

pub(crate) struct FwdflatPass {
    mdef: Arc<BinMdef>,
    tmat: Arc<Tmat>,
    dict: Arc<Dict>,
    params: FwdflatParams,
    words: Vec<FlatWord>,
    bpt: BpTable,
}

impl FwdflatPass {
    pub fn new(
        mdef: Arc<BinMdef>,
        tmat: Arc<Tmat>,
        dict: Arc<Dict>,
        params: FwdflatParams,
    ) -> Self {
        Self {
            mdef,
            tmat,
            dict,
            params,
            words: Vec::new(),
            bpt: BpTable::default(),
        }
    }

    /// Word set from the first pass: (word, start) groups whose end frames
    /// span at least `efwid` frames, fillers always.
    fn collect_words(&mut self, first: &BpTable) {
        let mut spans: HashMap<(i32, i32), (i32, i32)> = HashMap::new();
        for (_, e) in first.iter() {
            if !e.valid {
                continue;
            }
            spans
                .entry((e.wid, e.start_frame))
                .and_modify(|(fef, lef)| {
                    *fef = (*fef).min(e.frame);
                    *lef = (*lef).max(e.frame);
                })
                .or_insert((e.frame, e.frame));
        }
        let mut segments: HashMap<i32, Vec<(i32, i32)>> = HashMap::new();
        for ((wid, sf), (fef, lef)) in spans {
            if lef - fef + 1 >= self.params.efwid || self.dict.is_filler(wid) {
                segments.entry(wid).or_default().push((sf, lef));
            }
        }

        let sil = self.mdef.silence_ciphone().max(0);
        self.words.clear();
        for (wid, mut segs) in segments {
            segs.sort_unstable();
            let pron = self.dict.pronunciation(wid);
            if pron.is_empty() || self.dict.word_str(wid) == START_WORD {
                continue;
            }
            let mut hmms = Vec::with_capacity(pron.len());
            for (i, &ph) in pron.iter().enumerate() {
                let lc = if i == 0 { sil } else { pron[i - 1] };
                let (rc, wpos) = if pron.len() == 1 {
                    (sil, WordPosition::Single)
                } else if i == 0 {
                    (pron[1], WordPosition::Begin)
                } else if i + 1 < pron.len() {
                    (pron[i + 1], WordPosition::Internal)
                } else {
                    (sil, WordPosition::End)
                };
                let pid = self.mdef.phone_id_nearest(ph, lc, rc, wpos);
                let p = self.mdef.phone(pid);
                hmms.push(Hmm::new(p.ssid, p.tmat));
            }
            self.words.push(FlatWord {
                wid,
                hmms,
                segments: segs,
                active_frame: -1,
            });
        }
        info!("Flat pass rescoring {} words", self.words.len());
    }

    fn eligible(word: &FlatWord, frame: i32, sfwin: i32) -> bool {
        word.segments
            .iter()
            .any(|&(sf, ef)| sf - sfwin <= frame && frame <= ef + sfwin)
    }

    fn word_lscr(
        &self,
        lm: &mut NgramModel,
        lm_wid: &[i32],
        lm_start: Option<i32>,
        wid: i32,
        hist_bp: i32,
    ) -> i32 {
        if self.dict.is_filler(wid) {
            return if self.dict.word_str(wid) == SILENCE_WORD {
                self.params.silpen
            } else {
                self.params.fillpen
            };
        }
        let max = lm.order().saturating_sub(1);
        let mut hist = Vec::with_capacity(max);
        for w in lm_history(&self.bpt, &self.dict, hist_bp, max) {
            match lm_wid.get(w as usize) {
                Some(&id) if id >= 0 => hist.push(id),
                _ => break,
            }
        }
        if hist.len() < max {
            if let Some(s) = lm_start {
                hist.push(s);
            }
        }
        match lm_wid.get(wid as usize) {
            Some(&lw) if lw >= 0 => lm.score(lw as u32, &hist).0,
            _ => self.params.fillpen + self.params.wbeam,
        }
    }

    pub fn run(
        &mut self,
        lm: &mut NgramModel,
        lm_wid: &[i32],
        lm_start: Option<i32>,
        scorer: &mut dyn AcousticScorer,
        frames: &[Feature],
        first: &BpTable,
    ) -> Result<BpTable> {
        self.collect_words(first);
        self.bpt.clear();
        if self.words.is_empty() {
            return Ok(std::mem::take(&mut self.bpt));
        }
        lm.apply_weights(self.params.lw, self.params.wip);

        let n_emit = self.mdef.n_emit_state();
        let n_sen = self.mdef.n_sen();
        let mut senscr = vec![0i32; n_sen];
        let mut active_sen: Vec<i32> = Vec::new();
        scorer.begin_utt();

        for f in 0..frames.len() as i32 {
            // Seed words whose window opens at the utterance start.
            if f == 0 {
                for w in 0..self.words.len() {
                    if Self::eligible(&self.words[w], 0, self.params.sfwin) {
                        self.words[w].hmms[0].enter(0, NO_BP, 0);
                        self.words[w].active_frame = 0;
                    }
                }
            }

            active_sen.clear();
            for word in self.words.iter().filter(|w| w.active_frame == f) {
                for hmm in &word.hmms {
                    active_sen
                        .extend(self.mdef.sseq(hmm.ssid).iter().map(|&s| s as i32));
                }
            }
            if active_sen.is_empty() {
                continue;
            }
            active_sen.sort_unstable();
            active_sen.dedup();
            scorer.frame_eval(&frames[f as usize], f, Some(&active_sen), &mut senscr)?;

            // Evaluate chains front to back so in-word transitions land in
            // the next frame.
            let mut best = WORST_SCORE;
            for w in 0..self.words.len() {
                if self.words[w].active_frame != f {
                    continue;
                }
                let n_hmm = self.words[w].hmms.len();
                for h in 0..n_hmm {
                    let sseq = self.mdef.sseq(self.words[w].hmms[h].ssid);
                    let s = self.words[w].hmms[h].eval(n_emit, &self.tmat, sseq, &senscr);
                    // Stamp forward so later entries merge, not clear.
                    self.words[w].hmms[h].frame = f + 1;
                    if s > best {
                        best = s;
                    }
                }
            }
            if best <= WORST_SCORE {
                continue;
            }
            let thresh = best + self.params.beam;
            let word_thresh = best + self.params.wbeam;

            // Exits, survivors and in-word transitions.
            let mut exits: Vec<(i32, i32, i32)> = Vec::new();
            for w in 0..self.words.len() {
                if self.words[w].active_frame != f {
                    continue;
                }
                let n_hmm = self.words[w].hmms.len();
                let mut alive = false;
                for h in 0..n_hmm {
                    let (out_score, out_hist, best_score) = {
                        let hmm = &self.words[w].hmms[h];
                        (hmm.out_score, hmm.out_history, hmm.best_score)
                    };
                    if best_score > thresh {
                        alive = true;
                    }
                    if h + 1 < n_hmm && out_score > thresh {
                        self.words[w].hmms[h + 1].enter(out_score, out_hist, f + 1);
                        alive = true;
                    }
                    // Zero-length words would break the backpointer
                    // ordering; the exit has to wait a frame.
                    let starts_ok =
                        out_hist == NO_BP || self.bpt.get(out_hist).frame + 1 < f;
                    if h + 1 == n_hmm && starts_ok && out_score > word_thresh {
                        exits.push((self.words[w].wid, out_score, out_hist));
                    }
                }
                if alive {
                    self.words[w].active_frame = f + 1;
                }
            }

            // Best candidate per word, then BP entries.
            let mut by_word: HashMap<i32, (i32, i32)> = HashMap::new();
            for (wid, score, hist) in exits {
                let slot = by_word.entry(wid).or_insert((score, hist));
                if score > slot.0 {
                    *slot = (score, hist);
                }
            }
            let mut entered = Vec::new();
            for (wid, (out_score, out_hist)) in by_word {
                let lscr = self.word_lscr(lm, lm_wid, lm_start, wid, out_hist);
                let prev_score = if out_hist == NO_BP {
                    0
                } else {
                    self.bpt.get(out_hist).score
                };
                let total = out_score + lscr;
                let bp = self
                    .bpt
                    .enter(f, wid, total, out_score - prev_score, lscr, out_hist);
                entered.push((bp, total));
            }

            // Cross-word restarts into every eligible word.
            for (bp, total) in entered {
                for w in 0..self.words.len() {
                    if !Self::eligible(&self.words[w], f + 1, self.params.sfwin) {
                        continue;
                    }
                    self.words[w].hmms[0].enter(total, bp, f + 1);
                    self.words[w].active_frame = f + 1;
                }
            }

            if best < RENORM_THRESHOLD {
                debug!("Flat pass renormalizing at frame {}", f);
                for word in self.words.iter_mut().filter(|w| w.active_frame == f + 1) {
                    for hmm in word.hmms.iter_mut() {
                        hmm.renormalize(best);
                    }
                }
            }
        }

        lm.apply_weights(self.params.orig_lw, self.params.wip);
        Ok(std::mem::take(&mut self.bpt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::NgramModel;
    use crate::mdef::MdefBuilder;
    use crate::search::PlannedScorer;
    use std::io::Cursor;

    fn ci_mdef() -> BinMdef {
        let mut b = MdefBuilder::new(3);
        b.ciphone("AH", false, &[0, 1, 2], 0)
            .ciphone("F", false, &[3, 4, 5], 1)
            .ciphone("R", false, &[6, 7, 8], 2)
            .ciphone("SIL", true, &[9, 10, 11], 3);
        b.build().unwrap()
    }

    const TEST_ARPA: &str = "\
\\data\\
ngram 1=4

\\1-grams:
-0.5\t<s>
-0.5\t</s>
-0.5\tFAR
-0.9\tRAH

\\end\\
";

    fn favour(n_sen: usize, senones: &[usize]) -> Vec<i32> {
        let mut row = vec![-60_000i32; n_sen];
        for &s in senones {
            row[s] = -100;
        }
        row
    }

    #[test]
    fn rescoring_recovers_the_word() {
        let mdef = Arc::new(ci_mdef());
        let lmath = LogMath::shared_default();
        let tmat = Arc::new(Tmat::bakis(mdef.n_tmat(), 3, &lmath));
        let dict = Arc::new(
            Dict::from_reader(
                &mdef,
                Cursor::new("FAR  F AH R\nRAH  R AH\n".to_string()),
                None::<Cursor<String>>,
                false,
            )
            .unwrap(),
        );
        let mut lm = NgramModel::read_arpa(Cursor::new(TEST_ARPA), lmath.clone()).unwrap();
        let lm_wid: Vec<i32> = (0..dict.len() as i32)
            .map(|w| {
                lm.word_id(dict.word_str(dict.base_id(w)))
                    .map(|x| x as i32)
                    .unwrap_or(-1)
            })
            .collect();

        // First-pass table: FAR seen repeatedly from frame 0.
        let mut first = BpTable::default();
        let far = dict.word_id("FAR").unwrap();
        first.enter(4, far, -1000, -1000, 0, NO_BP);
        first.enter(5, far, -1100, -1100, 0, NO_BP);
        first.enter(6, far, -1150, -1150, 0, NO_BP);
        first.enter(7, far, -1200, -1200, 0, NO_BP);

        let config = DecoderConfig::default();
        let params = FwdflatParams::from_config(&config, &lmath);
        let mut pass = FwdflatPass::new(mdef.clone(), tmat, dict.clone(), params);

        let n = mdef.n_sen();
        let plan = vec![
            favour(n, &[3, 4, 5]),
            favour(n, &[3, 4, 5]),
            favour(n, &[0, 1, 2]),
            favour(n, &[0, 1, 2]),
            favour(n, &[6, 7, 8]),
            favour(n, &[6, 7, 8]),
        ];
        let frames: Vec<Feature> = plan.iter().map(|_| Feature::single(vec![0.0])).collect();
        let mut scorer = PlannedScorer { plan, n_sen: n };
        let out = pass
            .run(&mut lm, &lm_wid, None, &mut scorer, &frames, &first)
            .unwrap();
        assert!(!out.is_empty());
        let bp = out.best_exit(5, None).unwrap();
        assert_eq!(out.get(bp).wid, far);
        assert!(out.check_invariant());
    }

    #[test]
    fn words_below_persistence_are_skipped() {
        let mdef = Arc::new(ci_mdef());
        let lmath = LogMath::shared_default();
        let tmat = Arc::new(Tmat::bakis(mdef.n_tmat(), 3, &lmath));
        let dict = Arc::new(
            Dict::from_reader(
                &mdef,
                Cursor::new("FAR  F AH R\nRAH  R AH\n".to_string()),
                None::<Cursor<String>>,
                false,
            )
            .unwrap(),
        );
        let mut first = BpTable::default();
        // RAH ends only once: span of one frame, below the default width.
        first.enter(4, dict.word_id("RAH").unwrap(), -1000, -1000, 0, NO_BP);
        let config = DecoderConfig::default();
        let params = FwdflatParams::from_config(&config, &lmath);
        let mut pass = FwdflatPass::new(mdef, tmat, dict, params);
        pass.collect_words(&first);
        assert!(pass.words.iter().all(|w| {
            let name = pass.dict.word_str(w.wid);
            name != "RAH"
        }));
    }
}
