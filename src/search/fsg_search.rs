//! Frame-synchronous decoding against a finite-state grammar. Every
//! emitting FSG transition gets an HMM chain for the word's pronunciation
//! (one per alternate when enabled); chains are seeded from their source
//! state each frame, and completed words move scores across the grammar,
//! with epsilon closure collapsing the null hops.
use super::bptable::BpTable;
use super::hmm::{Hmm, NO_BP, WORST_SCORE};
use super::{hyp_string, seg_from_chain, Search, SegEntry};
use crate::acoustic::tmat::Tmat;
use crate::acoustic::{AcousticScorer, Feature};
use crate::config::DecoderConfig;
use crate::dict::{Dict, SILENCE_WORD};
use crate::error::Result;
use crate::lattice::Lattice;
use crate::logmath::LogMath;
use crate::mdef::{BinMdef, WordPosition};
use crate::fsg::model::FsgModel;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MIN_ENDFR: i32 = 3;
const RENORM_THRESHOLD: i32 = WORST_SCORE / 2;

struct TransInstance {
    from: i32,
    to: i32,
    /// Dictionary word (a specific pronunciation variant).
    dict_wid: i32,
    logp: i32,
    hmms: Vec<Hmm>,
    active_frame: i32,
}

pub struct FsgSearch {
    mdef: Arc<BinMdef>,
    tmat: Arc<Tmat>,
    dict: Arc<Dict>,
    fsg: FsgModel,
    use_alt_pron: bool,

    beam: i32,
    wbeam: i32,

    instances: Vec<TransInstance>,
    /// Instances indexed by source state.
    by_state: Vec<Vec<usize>>,
    state_score: Vec<i32>,
    state_hist: Vec<i32>,
    /// States from which the final state is reachable through nulls.
    reaches_final: Vec<bool>,

    bpt: BpTable,
    bp_state: Vec<i32>,
    frame: i32,
    lattice: Option<Lattice>,
    finished: bool,
    beam_exhausted_logged: bool,
}

impl FsgSearch {
    pub fn new(
        mdef: Arc<BinMdef>,
        tmat: Arc<Tmat>,
        dict: Arc<Dict>,
        mut fsg: FsgModel,
        lmath: Arc<LogMath>,
        config: &DecoderConfig,
    ) -> Result<Self> {
        if config.fsgusefiller && dict.word_id(SILENCE_WORD).is_some() {
            fsg.add_silence(SILENCE_WORD, None, config.silprob);
        }
        fsg.null_trans_closure();
        let mut search = Self {
            beam: lmath.log(config.beam),
            wbeam: lmath.log(config.wbeam),
            use_alt_pron: config.fsgusealtpron,
            instances: Vec::new(),
            by_state: Vec::new(),
            state_score: Vec::new(),
            state_hist: Vec::new(),
            reaches_final: Vec::new(),
            bpt: BpTable::default(),
            bp_state: Vec::new(),
            frame: 0,
            lattice: None,
            finished: false,
            beam_exhausted_logged: false,
            mdef,
            tmat,
            dict,
            fsg,
        };
        search.rebuild();
        Ok(search)
    }

    pub fn fsg(&self) -> &FsgModel {
        &self.fsg
    }

    fn rebuild(&mut self) {
        self.instances.clear();
        let n_state = self.fsg.n_state();
        self.by_state = vec![Vec::new(); n_state];
        self.state_score = vec![WORST_SCORE; n_state];
        self.state_hist = vec![NO_BP; n_state];

        let sil = self.mdef.silence_ciphone().max(0);
        let links: Vec<_> = (0..n_state as i32)
            .flat_map(|s| self.fsg.arcs(s).filter(|l| !l.is_epsilon()).copied())
            .collect::<Vec<_>>();
        for link in links {
            let name = self.fsg.word_str(link.wid).to_string();
            let Some(base) = self.dict.word_id(&name) else {
                warn!("FSG word {} is not in the dictionary", name);
                continue;
            };
            let variants: Vec<i32> = if self.use_alt_pron {
                self.dict.alts(base).collect()
            } else {
                vec![base]
            };
            for wid in variants {
                let pron = self.dict.pronunciation(wid).to_vec();
                if pron.is_empty() {
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
                let idx = self.instances.len();
                self.by_state[link.from_state as usize].push(idx);
                self.instances.push(TransInstance {
                    from: link.from_state,
                    to: link.to_state,
                    dict_wid: wid,
                    logp: link.logs2prob,
                    hmms,
                    active_frame: -1,
                });
            }
        }

        // Null reachability of the final state.
        self.reaches_final = (0..n_state as i32)
            .map(|s| {
                s == self.fsg.final_state
                    || self.fsg.null_trans(s, self.fsg.final_state).is_some()
            })
            .collect();
        info!(
            "FSG search: {} transition instances over {} states",
            self.instances.len(),
            n_state
        );
    }

    /// Relax state scores over the closed null transitions.
    fn null_propagate(&mut self) {
        let n_state = self.fsg.n_state() as i32;
        let mut updates = Vec::new();
        for s in 0..n_state {
            if self.state_score[s as usize] <= WORST_SCORE {
                continue;
            }
            for link in self.fsg.arcs(s).filter(|l| l.is_epsilon()) {
                let cand = self.state_score[s as usize] + link.logs2prob;
                if cand > self.state_score[link.to_state as usize] {
                    updates.push((link.to_state, cand, self.state_hist[s as usize]));
                }
            }
        }
        for (to, score, hist) in updates {
            if score > self.state_score[to as usize] {
                self.state_score[to as usize] = score;
                self.state_hist[to as usize] = hist;
            }
        }
    }
}

impl Search for FsgSearch {
    fn begin(&mut self) -> Result<()> {
        self.bpt.clear();
        self.bp_state.clear();
        self.frame = 0;
        self.lattice = None;
        self.finished = false;
        self.beam_exhausted_logged = false;
        for inst in self.instances.iter_mut() {
            for hmm in inst.hmms.iter_mut() {
                hmm.clear();
            }
            inst.active_frame = -1;
        }
        for s in self.state_score.iter_mut() {
            *s = WORST_SCORE;
        }
        for h in self.state_hist.iter_mut() {
            *h = NO_BP;
        }
        self.state_score[self.fsg.start_state as usize] = 0;
        self.null_propagate();
        Ok(())
    }

    fn active_senones(&self, out: &mut Vec<i32>) {
        for inst in self.instances.iter() {
            let viable_entry = self.state_score[inst.from as usize] > WORST_SCORE;
            if inst.active_frame == self.frame || viable_entry {
                for hmm in &inst.hmms {
                    out.extend(self.mdef.sseq(hmm.ssid).iter().map(|&s| s as i32));
                }
            }
        }
    }

    fn step(&mut self, frame: i32, senscr: &[i32]) -> Result<()> {
        // Seed chains from states reached at the end of the last frame.
        for s in 0..self.state_score.len() {
            if self.state_score[s] <= WORST_SCORE {
                continue;
            }
            for k in 0..self.by_state[s].len() {
                let i = self.by_state[s][k];
                let entry = self.state_score[s] + self.instances[i].logp;
                let hist = self.state_hist[s];
                let inst = &mut self.instances[i];
                inst.hmms[0].enter(entry, hist, frame);
                inst.active_frame = frame;
            }
        }

        // Evaluate.
        let n_emit = self.mdef.n_emit_state();
        let mut best = WORST_SCORE;
        for inst in self.instances.iter_mut() {
            if inst.active_frame != frame {
                continue;
            }
            for hmm in inst.hmms.iter_mut() {
                let sseq = self.mdef.sseq(hmm.ssid);
                let s = hmm.eval(n_emit, &self.tmat, sseq, senscr);
                // Stamp forward so later entries merge instead of clearing.
                hmm.frame = frame + 1;
                if s > best {
                    best = s;
                }
            }
        }
        if best <= WORST_SCORE {
            if !self.beam_exhausted_logged {
                warn!("No active grammar HMMs survived frame {}", frame);
                self.beam_exhausted_logged = true;
            }
            self.frame = frame + 1;
            for s in self.state_score.iter_mut() {
                *s = WORST_SCORE;
            }
            return Ok(());
        }
        let thresh = best + self.beam;
        let word_thresh = best + self.wbeam;

        // Exits move scores across the grammar; everything else carries
        // over within its chain.
        let mut arrivals: Vec<(usize, i32, i32)> = Vec::new();
        for i in 0..self.instances.len() {
            if self.instances[i].active_frame != frame {
                continue;
            }
            let n_hmm = self.instances[i].hmms.len();
            let mut alive = false;
            for h in 0..n_hmm {
                let (out_score, out_hist, best_score) = {
                    let hmm = &self.instances[i].hmms[h];
                    (hmm.out_score, hmm.out_history, hmm.best_score)
                };
                if best_score > thresh {
                    alive = true;
                }
                if h + 1 < n_hmm && out_score > thresh {
                    self.instances[i].hmms[h + 1].enter(out_score, out_hist, frame + 1);
                    alive = true;
                }
                // Zero-length words would break the backpointer ordering;
                // an arrival keyed to the previous frame has to wait.
                let starts_ok =
                    out_hist == NO_BP || self.bpt.get(out_hist).frame + 1 < frame;
                if h + 1 == n_hmm && starts_ok && out_score > word_thresh {
                    arrivals.push((i, out_score, out_hist));
                }
            }
            self.instances[i].active_frame = if alive { frame + 1 } else { frame };
        }

        // Next frame's state scores come only from this frame's arrivals.
        for s in self.state_score.iter_mut() {
            *s = WORST_SCORE;
        }
        for h in self.state_hist.iter_mut() {
            *h = NO_BP;
        }
        // Best arrival per (state, word) becomes a BP entry.
        let mut best_arrival: std::collections::HashMap<(i32, i32), (i32, i32)> =
            std::collections::HashMap::new();
        for (i, score, hist) in arrivals {
            let key = (self.instances[i].to, self.instances[i].dict_wid);
            let slot = best_arrival.entry(key).or_insert((score, hist));
            if score > slot.0 {
                *slot = (score, hist);
            }
        }
        for ((to, wid), (score, hist)) in best_arrival {
            let prev_score = if hist == NO_BP {
                0
            } else {
                self.bpt.get(hist).score
            };
            let bp = self
                .bpt
                .enter(frame, wid, score, score - prev_score, 0, hist);
            self.bp_state.push(to);
            debug_assert_eq!(self.bp_state.len(), self.bpt.len());
            if score > self.state_score[to as usize] {
                self.state_score[to as usize] = score;
                self.state_hist[to as usize] = bp;
            }
        }
        self.null_propagate();

        if best < RENORM_THRESHOLD {
            debug!("FSG search renormalizing at frame {}", frame);
            for inst in self.instances.iter_mut() {
                if inst.active_frame == frame + 1 {
                    for hmm in inst.hmms.iter_mut() {
                        hmm.renormalize(best);
                    }
                }
            }
            for s in self.state_score.iter_mut() {
                if *s > WORST_SCORE {
                    *s -= best;
                }
            }
        }
        self.frame = frame + 1;
        Ok(())
    }

    fn end(&mut self, _scorer: &mut dyn AcousticScorer, _frames: &[Feature]) -> Result<()> {
        self.finished = true;
        self.lattice = Lattice::from_bptable(&self.bpt, self.frame, MIN_ENDFR);
        Ok(())
    }

    fn hyp(&self) -> Option<(String, i32)> {
        // Best chain whose arrival state reaches the final state.
        let mut best: Option<(i32, i32)> = None;
        for (idx, e) in self.bpt.iter() {
            if !e.valid {
                continue;
            }
            if !self.reaches_final[self.bp_state[idx as usize] as usize] {
                continue;
            }
            // Only chains still alive at the end of decoding count.
            if self.finished && e.frame != self.frame - 1 {
                continue;
            }
            if best.map_or(true, |(_, s)| s < e.score) {
                best = Some((idx, e.score));
            }
        }
        match best {
            Some((bp, score)) => Some((hyp_string(&self.bpt, &self.dict, bp), score)),
            None if self.finished => Some((String::new(), 0)),
            None => None,
        }
    }

    fn seg(&self) -> Vec<SegEntry> {
        let mut best: Option<(i32, i32)> = None;
        for (idx, e) in self.bpt.iter() {
            if !e.valid || !self.reaches_final[self.bp_state[idx as usize] as usize] {
                continue;
            }
            if self.finished && e.frame != self.frame - 1 {
                continue;
            }
            if best.map_or(true, |(_, s)| s < e.score) {
                best = Some((idx, e.score));
            }
        }
        match best {
            Some((bp, _)) => seg_from_chain(&self.bpt, &self.dict, bp),
            None => Vec::new(),
        }
    }

    fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    fn nbest(&self, n: usize) -> Vec<(String, i32)> {
        let Some(lat) = &self.lattice else {
            return Vec::new();
        };
        lat.nbest(n, 1.0)
            .into_iter()
            .map(|(path, score)| {
                let words: Vec<&str> = path
                    .iter()
                    .map(|&i| lat.nodes[i].wid)
                    .filter(|&w| !self.dict.is_hidden(w))
                    .map(|w| self.dict.word_str(w))
                    .collect();
                (words.join(" "), score)
            })
            .collect()
    }

    fn reinit(&mut self, dict: Arc<Dict>) -> Result<()> {
        self.dict = dict;
        self.rebuild();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsg::model::FsgModel;
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

    /// Grammar: 0 --FAR--> 1 --RAH--> 2(final), with RAH optional.
    fn grammar(lmath: Arc<LogMath>) -> FsgModel {
        let mut fsg = FsgModel::new("test", lmath.clone(), 7.5, 3);
        fsg.start_state = 0;
        fsg.final_state = 2;
        let far = fsg.word_add("FAR");
        let rah = fsg.word_add("RAH");
        fsg.trans_add(0, 1, lmath.log(1.0), far);
        fsg.trans_add(1, 2, lmath.log(0.5), rah);
        fsg.null_trans_add(1, 2, lmath.log(0.5));
        fsg
    }

    fn search() -> FsgSearch {
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
        let fsg = grammar(lmath.clone());
        let config = DecoderConfig {
            fsgusefiller: false,
            ..Default::default()
        };
        FsgSearch::new(mdef, tmat, dict, fsg, lmath, &config).unwrap()
    }

    fn favour(n_sen: usize, senones: &[usize]) -> Vec<i32> {
        let mut row = vec![-60_000i32; n_sen];
        for &s in senones {
            row[s] = -100;
        }
        row
    }

    fn run(s: &mut FsgSearch, plan: Vec<Vec<i32>>) -> (String, i32) {
        let n_sen = s.mdef.n_sen();
        s.begin().unwrap();
        let mut senscr = vec![0i32; n_sen];
        let mut scorer = PlannedScorer {
            plan: plan.clone(),
            n_sen,
        };
        for (f, row) in plan.iter().enumerate() {
            senscr[..row.len()].copy_from_slice(row);
            s.step(f as i32, &senscr).unwrap();
        }
        s.end(&mut scorer, &[]).unwrap();
        s.hyp().unwrap()
    }

    #[test]
    fn single_word_path_through_null() {
        let mut s = search();
        let n = s.mdef.n_sen();
        // FAR alone reaches the final state through the epsilon.
        let plan = vec![
            favour(n, &[3, 4, 5]),
            favour(n, &[3, 4, 5]),
            favour(n, &[0, 1, 2]),
            favour(n, &[0, 1, 2]),
            favour(n, &[6, 7, 8]),
            favour(n, &[6, 7, 8]),
        ];
        let (hyp, _) = run(&mut s, plan);
        assert_eq!(hyp, "FAR");
    }

    #[test]
    fn two_word_path() {
        let mut s = search();
        let n = s.mdef.n_sen();
        // FAR then RAH.
        let plan = vec![
            favour(n, &[3, 4, 5]),
            favour(n, &[0, 1, 2]),
            favour(n, &[6, 7, 8]),
            favour(n, &[6, 7, 8]),
            favour(n, &[0, 1, 2]),
            favour(n, &[0, 1, 2]),
        ];
        let (hyp, _) = run(&mut s, plan);
        assert_eq!(hyp, "FAR RAH");
    }

    #[test]
    fn too_short_for_any_path_gives_empty_result() {
        let mut s = search();
        let n = s.mdef.n_sen();
        // Two frames cannot carry any grammar word to completion.
        let plan = vec![favour(n, &[6, 7, 8]), favour(n, &[0, 1, 2])];
        let (hyp, _) = run(&mut s, plan);
        assert_eq!(hyp, "");
    }

    #[test]
    fn words_missing_from_dict_are_skipped() {
        let mdef = Arc::new(ci_mdef());
        let lmath = LogMath::shared_default();
        let tmat = Arc::new(Tmat::bakis(mdef.n_tmat(), 3, &lmath));
        let dict = Arc::new(
            Dict::from_reader(
                &mdef,
                Cursor::new("FAR  F AH R\n".to_string()),
                None::<Cursor<String>>,
                false,
            )
            .unwrap(),
        );
        let fsg = grammar(lmath.clone());
        let config = DecoderConfig::default();
        let s = FsgSearch::new(mdef, tmat, dict, fsg, lmath, &config).unwrap();
        assert!(s.instances.iter().all(|i| {
            s.dict.word_str(i.dict_wid) != "RAH"
        }));
    }
}
