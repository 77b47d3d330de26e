//! First-pass Viterbi over the lexicon tree, plus the glue that runs the
//! optional flat-lexicon and bestpath rescoring passes at utterance end.
//! Words sharing pronunciation prefixes share HMM channels; word identity
//! only materializes at the leaves, where exits feed the backpointer table
//! and the N-gram score for the completed word is applied.
use super::bptable::BpTable;
use super::fwdflat::{FwdflatParams, FwdflatPass};
use super::hmm::{Hmm, NO_BP, WORST_SCORE};
use super::phone_loop::PhoneLoop;
use super::{hyp_string, lm_history, seg_from_chain, Search, SegEntry};
use crate::acoustic::tmat::Tmat;
use crate::acoustic::{AcousticScorer, Feature};
use crate::config::DecoderConfig;
use crate::dict::{Dict, NO_WORD, SILENCE_WORD, START_WORD};
use crate::error::Result;
use crate::lattice::Lattice;
use crate::lm::NgramModel;
use crate::logmath::LogMath;
use crate::mdef::{BinMdef, WordPosition};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frames a lattice node must persist before the DAG keeps it.
const MIN_ENDFR: i32 = 3;
/// Renormalize active scores once the best drops below this.
const RENORM_THRESHOLD: i32 = WORST_SCORE / 2;

#[derive(Debug, Clone)]
struct ChanNode {
    hmm: Hmm,
    ci: i32,
    children: Vec<u32>,
    /// Words whose pronunciation ends exactly here.
    words: Vec<i32>,
    /// Set for the dedicated single-phone word channels.
    single_word: i32,
    active_frame: i32,
}

pub struct NgramSearch {
    mdef: Arc<BinMdef>,
    tmat: Arc<Tmat>,
    dict: Arc<Dict>,
    lmath: Arc<LogMath>,
    lm: NgramModel,
    /// Dictionary word id → LM word id (or -1).
    lm_wid: Vec<i32>,
    lm_start: Option<i32>,

    beam: i32,
    pbeam: i32,
    wbeam: i32,
    lpbeam: i32,
    lponlybeam: i32,
    maxhmmpf: i32,
    maxwpf: i32,
    silpen: i32,
    fillpen: i32,
    do_fwdflat: bool,
    do_bestpath: bool,
    bestpath_ratio: f32,
    outlatbeam: i32,
    flat_params: FwdflatParams,

    nodes: Vec<ChanNode>,
    roots: Vec<u32>,
    active: Vec<u32>,

    pl: PhoneLoop,
    bpt: BpTable,
    flat_bpt: Option<BpTable>,
    frame: i32,
    renorm: i32,
    beam_exhausted_logged: bool,
    lattice: Option<Lattice>,
    bestpath_result: Option<(Vec<SegEntry>, i32)>,
    finished: bool,
}

impl NgramSearch {
    pub fn new(
        mdef: Arc<BinMdef>,
        tmat: Arc<Tmat>,
        dict: Arc<Dict>,
        mut lm: NgramModel,
        lmath: Arc<LogMath>,
        config: &DecoderConfig,
    ) -> Result<Self> {
        lm.apply_weights(config.lw, config.wip);
        let pl = PhoneLoop::new(
            mdef.clone(),
            tmat.clone(),
            config.pl_weight,
            lmath.log(config.pl_beam),
        );
        let mut search = Self {
            beam: lmath.log(config.beam),
            pbeam: lmath.log(config.pbeam),
            wbeam: lmath.log(config.wbeam),
            lpbeam: lmath.log(config.lpbeam),
            lponlybeam: lmath.log(config.lponlybeam),
            maxhmmpf: config.maxhmmpf,
            maxwpf: config.maxwpf,
            silpen: lmath.log(config.silprob as f64) + lmath.log(config.wip as f64),
            fillpen: lmath.log(config.fillprob as f64) + lmath.log(config.wip as f64),
            do_fwdflat: config.fwdflat,
            do_bestpath: config.bestpath,
            bestpath_ratio: config.bestpathlw / config.lw,
            outlatbeam: lmath.log(config.outlatbeam),
            flat_params: FwdflatParams::from_config(config, &lmath),
            lm_wid: Vec::new(),
            lm_start: None,
            nodes: Vec::new(),
            roots: Vec::new(),
            active: Vec::new(),
            pl,
            bpt: BpTable::default(),
            flat_bpt: None,
            frame: 0,
            renorm: 0,
            beam_exhausted_logged: false,
            lattice: None,
            bestpath_result: None,
            finished: false,
            mdef,
            tmat,
            dict,
            lmath,
            lm,
        };
        search.rebuild();
        Ok(search)
    }

    pub fn lm(&self) -> &NgramModel {
        &self.lm
    }

    /// Accept an OOV addition so the tree rebuild can map it.
    pub fn add_lm_word(&mut self, word: &str, weight: f32) -> u32 {
        self.lm.add_word(word, weight)
    }

    /// Compile the lexicon tree and the dictionary→LM word map.
    fn rebuild(&mut self) {
        self.nodes.clear();
        self.roots.clear();
        let sil = self.mdef.silence_ciphone().max(0);

        self.lm_start = self.lm.word_id(START_WORD).map(|w| w as i32);
        self.lm_wid = (0..self.dict.len() as i32)
            .map(|w| {
                let base = self.dict.base_id(w);
                self.lm
                    .word_id(self.dict.word_str(base))
                    .map(|id| id as i32)
                    .unwrap_or(NO_WORD)
            })
            .collect();

        // Interior nodes shared by pid under a parent; roots shared by pid.
        let mut root_index: HashMap<i32, u32> = HashMap::new();
        let mut child_index: HashMap<(u32, i32), u32> = HashMap::new();
        let dict = self.dict.clone();
        for (wid, word) in dict.iter() {
            let pron = &word.pronunciation;
            if pron.is_empty() {
                continue;
            }
            if word.name == START_WORD {
                // The start marker never competes as a real word.
                continue;
            }
            if pron.len() == 1 {
                let pid = self
                    .mdef
                    .phone_id_nearest(pron[0], sil, sil, WordPosition::Single);
                let id = self.new_node(pid, pron[0]);
                self.nodes[id as usize].single_word = wid;
                self.nodes[id as usize].words.push(wid);
                self.roots.push(id);
                continue;
            }
            let first_pid =
                self.mdef
                    .phone_id_nearest(pron[0], sil, pron[1], WordPosition::Begin);
            let root = match root_index.get(&first_pid) {
                Some(&id) => id,
                None => {
                    let id = self.new_node(first_pid, pron[0]);
                    root_index.insert(first_pid, id);
                    self.roots.push(id);
                    id
                }
            };
            let mut at = root;
            for i in 1..pron.len() {
                let (rc, wpos) = if i + 1 < pron.len() {
                    (pron[i + 1], WordPosition::Internal)
                } else {
                    (sil, WordPosition::End)
                };
                let pid = self.mdef.phone_id_nearest(pron[i], pron[i - 1], rc, wpos);
                at = match child_index.get(&(at, pid)) {
                    Some(&id) => id,
                    None => {
                        let id = self.new_node(pid, pron[i]);
                        self.nodes[at as usize].children.push(id);
                        child_index.insert((at, pid), id);
                        id
                    }
                };
            }
            self.nodes[at as usize].words.push(wid);
        }
        info!(
            "Lexicon tree: {} channels, {} roots over {} words",
            self.nodes.len(),
            self.roots.len(),
            self.dict.len()
        );
    }

    fn new_node(&mut self, pid: i32, ci: i32) -> u32 {
        let p = self.mdef.phone(pid);
        let id = self.nodes.len() as u32;
        self.nodes.push(ChanNode {
            hmm: Hmm::new(p.ssid, p.tmat),
            ci,
            children: Vec::new(),
            words: Vec::new(),
            single_word: NO_WORD,
            active_frame: -1,
        });
        id
    }

    /// LM history for a path ending at `bp`, in LM word ids with the start
    /// marker appended when the chain runs out.
    fn lm_hist(&self, bp: i32) -> Vec<i32> {
        let max = self.lm.order().saturating_sub(1);
        let dict_hist = lm_history(&self.bpt, &self.dict, bp, max);
        let mut hist = Vec::with_capacity(max);
        for w in dict_hist {
            match self.lm_wid.get(w as usize) {
                Some(&id) if id >= 0 => hist.push(id),
                _ => return hist,
            }
        }
        if hist.len() < max {
            if let Some(s) = self.lm_start {
                hist.push(s);
            }
        }
        hist
    }

    /// Language score for a completed word given its history BP.
    fn word_lscr(&mut self, wid: i32, hist_bp: i32) -> (i32, usize) {
        if self.dict.is_filler(wid) {
            let pen = if self.dict.word_str(wid) == SILENCE_WORD {
                self.silpen
            } else {
                self.fillpen
            };
            return (pen, 0);
        }
        let hist = self.lm_hist(hist_bp);
        match self.lm_wid.get(wid as usize) {
            Some(&lw) if lw >= 0 => self.lm.score(lw as u32, &hist),
            _ => (self.fillpen + self.wbeam, 0),
        }
    }

    fn enter_roots(&mut self, score: i32, hist: i32, frame: i32) {
        let mut active = std::mem::take(&mut self.active);
        for r in 0..self.roots.len() {
            let id = self.roots[r] as usize;
            let bias = self.pl.penalty(self.nodes[id].ci);
            let node = &mut self.nodes[id];
            node.hmm.enter(score + bias, hist, frame);
            if node.active_frame != frame {
                node.active_frame = frame;
                active.push(id as u32);
            }
        }
        self.active = active;
    }

    fn step_frame(&mut self, frame: i32, senscr: &[i32]) -> Result<()> {
        self.pl.step(frame, senscr);
        if frame == 0 {
            self.enter_roots(0, NO_BP, 0);
        }

        // Evaluate the active set.
        let n_emit = self.mdef.n_emit_state();
        let mut best = WORST_SCORE;
        let active = std::mem::take(&mut self.active);
        for &id in &active {
            let node = &mut self.nodes[id as usize];
            let sseq = self.mdef.sseq(node.hmm.ssid);
            let s = node.hmm.eval(n_emit, &self.tmat, sseq, senscr);
            // Stamp forward so a cross entry merges instead of clearing.
            node.hmm.frame = frame + 1;
            if s > best {
                best = s;
            }
        }

        if best <= WORST_SCORE {
            if !active.is_empty() && !self.beam_exhausted_logged {
                warn!("No active HMMs survived frame {}", frame);
                self.beam_exhausted_logged = true;
            }
            self.active = Vec::new();
            return Ok(());
        }

        // Histogram-style cap on the active set.
        let hmm_thresh = if self.maxhmmpf > 0 && active.len() > self.maxhmmpf as usize {
            let mut scores: Vec<i32> = active
                .iter()
                .map(|&id| self.nodes[id as usize].hmm.best_score)
                .collect();
            let k = scores.len() - self.maxhmmpf as usize;
            scores.select_nth_unstable(k - 1);
            scores[k - 1].max(best + self.beam)
        } else {
            best + self.beam
        };

        // Word exit candidates: word id -> (exit score, history).
        let mut exits: HashMap<i32, (i32, i32)> = HashMap::new();
        let word_thresh = best + self.wbeam;
        let lponly_thresh = best + self.lponlybeam;

        let mut next_active = Vec::new();
        for &id in &active {
            let (out_score, out_hist, best_score, words, single, children) = {
                let n = &self.nodes[id as usize];
                (
                    n.hmm.out_score,
                    n.hmm.out_history,
                    n.hmm.best_score,
                    n.words.clone(),
                    n.single_word,
                    n.children.clone(),
                )
            };

            // Survivors carry over to the next frame.
            if best_score > hmm_thresh {
                let node = &mut self.nodes[id as usize];
                if node.active_frame != frame + 1 {
                    node.active_frame = frame + 1;
                    next_active.push(id);
                }
            }

            // Within-word transitions.
            if out_score > WORST_SCORE {
                for &child in &children {
                    let is_last = self.nodes[child as usize].children.is_empty();
                    let thresh = if is_last {
                        best + self.lpbeam
                    } else {
                        best + self.pbeam
                    };
                    if out_score < thresh {
                        continue;
                    }
                    let bias = self.pl.penalty(self.nodes[child as usize].ci);
                    let node = &mut self.nodes[child as usize];
                    node.hmm.enter(out_score + bias, out_hist, frame + 1);
                    if node.active_frame != frame + 1 {
                        node.active_frame = frame + 1;
                        next_active.push(child);
                    }
                }
            }

            // Word completions. A word must end strictly after it starts,
            // so a history ending in the previous frame cannot exit yet.
            let thresh = if single != NO_WORD {
                lponly_thresh
            } else {
                word_thresh
            };
            let starts_ok = out_hist == NO_BP || self.bpt.get(out_hist).frame + 1 < frame;
            if starts_ok && out_score > WORST_SCORE && out_score > thresh {
                for &w in &words {
                    let slot = exits.entry(w).or_insert((out_score, out_hist));
                    if out_score > slot.0 {
                        *slot = (out_score, out_hist);
                    }
                }
            }
        }

        // Score candidates, cap the per-frame word exits and enter BPs.
        let mut scored: Vec<(i32, i32, i32, i32, usize)> = Vec::new();
        for (&w, &(out_score, out_hist)) in exits.iter() {
            let (lscr, n_used) = self.word_lscr(w, out_hist);
            scored.push((w, out_score, out_hist, lscr, n_used));
        }
        // Best first; ties go to the deeper LM context.
        scored.sort_by(|a, b| {
            let sa = a.1 + a.3;
            let sb = b.1 + b.3;
            sb.cmp(&sa).then(b.4.cmp(&a.4))
        });
        if self.maxwpf > 0 {
            scored.truncate(self.maxwpf as usize);
        }
        let mut entered = Vec::new();
        for (w, out_score, out_hist, lscr, _) in scored {
            let prev_score = if out_hist == NO_BP {
                0
            } else {
                self.bpt.get(out_hist).score
            };
            let total = out_score + lscr;
            let bp = self
                .bpt
                .enter(frame, w, total, out_score - prev_score, lscr, out_hist);
            entered.push((bp, total));
        }

        // Cross-word transitions from every word that just ended.
        self.active = next_active;
        for (bp, total) in entered {
            self.enter_roots(total, bp, frame + 1);
        }

        // Keep scores away from the integer floor.
        if best < RENORM_THRESHOLD {
            debug!("Renormalizing scores at frame {} (best {})", frame, best);
            self.renorm += best;
            let active = std::mem::take(&mut self.active);
            for &id in &active {
                self.nodes[id as usize].hmm.renormalize(best);
            }
            self.active = active;
        }
        Ok(())
    }

    /// Best exit for the utterance: the top-scoring entry in the last frame
    /// that produced any, searching backwards over trailing empty frames.
    fn final_bp(bpt: &BpTable, n_frames: i32) -> i32 {
        for f in (0..n_frames).rev() {
            if let Some(bp) = bpt.best_exit(f, None) {
                return bp;
            }
        }
        NO_BP
    }

    fn result_bpt(&self) -> &BpTable {
        self.flat_bpt.as_ref().unwrap_or(&self.bpt)
    }
}

impl Search for NgramSearch {
    fn begin(&mut self) -> Result<()> {
        self.bpt.clear();
        self.flat_bpt = None;
        self.active.clear();
        self.frame = 0;
        self.renorm = 0;
        self.beam_exhausted_logged = false;
        self.lattice = None;
        self.bestpath_result = None;
        self.finished = false;
        for node in self.nodes.iter_mut() {
            node.hmm.clear();
            node.active_frame = -1;
        }
        self.pl.begin();
        Ok(())
    }

    fn active_senones(&self, out: &mut Vec<i32>) {
        self.pl.active_senones(out);
        for &id in &self.active {
            let node = &self.nodes[id as usize];
            out.extend(self.mdef.sseq(node.hmm.ssid).iter().map(|&s| s as i32));
        }
        // Frame zero activates every root before scores exist.
        if self.frame == 0 {
            for &id in &self.roots {
                let node = &self.nodes[id as usize];
                out.extend(self.mdef.sseq(node.hmm.ssid).iter().map(|&s| s as i32));
            }
        }
    }

    fn step(&mut self, frame: i32, senscr: &[i32]) -> Result<()> {
        self.step_frame(frame, senscr)?;
        self.frame = frame + 1;
        Ok(())
    }

    fn end(&mut self, scorer: &mut dyn AcousticScorer, frames: &[Feature]) -> Result<()> {
        let n_frames = self.frame;
        self.finished = true;
        if self.renorm != 0 {
            debug!("Scores were renormalized by {} in total", self.renorm);
        }
        if n_frames == 0 || self.bpt.is_empty() {
            warn!("Utterance produced no word exits");
            return Ok(());
        }

        if self.do_fwdflat && !frames.is_empty() {
            let mut pass = FwdflatPass::new(
                self.mdef.clone(),
                self.tmat.clone(),
                self.dict.clone(),
                self.flat_params,
            );
            match pass.run(
                &mut self.lm,
                &self.lm_wid,
                self.lm_start,
                scorer,
                frames,
                &self.bpt,
            ) {
                Ok(bpt) if !bpt.is_empty() => self.flat_bpt = Some(bpt),
                Ok(_) => debug!("Flat pass found no word exits, keeping tree result"),
                Err(e) => warn!("Flat rescoring pass failed: {}", e),
            }
        }

        self.lattice = Lattice::from_bptable(self.result_bpt(), n_frames, MIN_ENDFR);
        if self.do_bestpath {
            if let Some(lat) = self.lattice.as_mut() {
                lat.posterior_prune(self.outlatbeam, &self.lmath);
            }
            if let Some(lat) = &self.lattice {
                let posteriors = lat.node_posteriors(&self.lmath);
                if let Some((path, score)) = lat.bestpath(self.bestpath_ratio) {
                    let mut seg = Vec::new();
                    for (i, &node) in path.iter().enumerate() {
                        let n = &lat.nodes[node];
                        let ef = path
                            .get(i + 1)
                            .map(|&nx| lat.nodes[nx].sf - 1)
                            .unwrap_or(n_frames - 1);
                        // Scores ride on the edge arriving at this node.
                        let (ascr, lscr) = if i == 0 {
                            (0, 0)
                        } else {
                            lat.edges
                                .iter()
                                .find(|e| e.from == path[i - 1] && e.to == node)
                                .map(|e| (e.ascr, e.lscr))
                                .unwrap_or((0, 0))
                        };
                        seg.push(SegEntry {
                            word: self.dict.word_str(n.wid).to_string(),
                            wid: n.wid,
                            sf: n.sf,
                            ef,
                            ascr,
                            lscr,
                            post: posteriors[node],
                        });
                    }
                    self.bestpath_result = Some((seg, score));
                }
            }
        }
        Ok(())
    }

    fn hyp(&self) -> Option<(String, i32)> {
        if let Some((seg, score)) = &self.bestpath_result {
            let words: Vec<&str> = seg
                .iter()
                .filter(|s| !self.dict.is_hidden(s.wid))
                .map(|s| s.word.as_str())
                .collect();
            return Some((words.join(" "), *score));
        }
        let bpt = self.result_bpt();
        let bp = Self::final_bp(bpt, self.frame);
        if bp == NO_BP {
            return if self.finished {
                // Always produce something after end_utt, even if empty.
                Some((String::new(), 0))
            } else {
                None
            };
        }
        Some((hyp_string(bpt, &self.dict, bp), bpt.get(bp).score))
    }

    fn seg(&self) -> Vec<SegEntry> {
        if let Some((seg, _)) = &self.bestpath_result {
            return seg.clone();
        }
        let bpt = self.result_bpt();
        let bp = Self::final_bp(bpt, self.frame);
        if bp == NO_BP {
            return Vec::new();
        }
        seg_from_chain(bpt, &self.dict, bp)
    }

    fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    fn nbest(&self, n: usize) -> Vec<(String, i32)> {
        let Some(lat) = &self.lattice else {
            return Vec::new();
        };
        lat.nbest(n, self.bestpath_ratio)
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
    use crate::lm::NgramModel;
    use crate::mdef::MdefBuilder;
    use crate::search::PlannedScorer;
    use std::io::Cursor;

    /// CI-only model: AH, F, R, SIL with 3 senones each.
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

    fn search() -> NgramSearch {
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
        let lm = NgramModel::read_arpa(Cursor::new(TEST_ARPA), lmath.clone()).unwrap();
        let config = DecoderConfig {
            fwdflat: false,
            bestpath: false,
            ..Default::default()
        };
        NgramSearch::new(mdef, tmat, dict, lm, lmath, &config).unwrap()
    }

    /// Score rows favouring one phone's senones.
    fn favour(n_sen: usize, senones: &[usize]) -> Vec<i32> {
        let mut row = vec![-60_000i32; n_sen];
        for &s in senones {
            row[s] = -100;
        }
        row
    }

    fn decode(search: &mut NgramSearch, plan: Vec<Vec<i32>>) -> (String, i32) {
        let n_sen = search.mdef.n_sen();
        search.begin().unwrap();
        let mut senscr = vec![0i32; n_sen];
        let mut scorer = PlannedScorer {
            plan: plan.clone(),
            n_sen,
        };
        let frames: Vec<Feature> = plan.iter().map(|_| Feature::single(vec![0.0])).collect();
        for (f, row) in plan.iter().enumerate() {
            senscr[..row.len()].copy_from_slice(row);
            search.step(f as i32, &senscr).unwrap();
        }
        search.end(&mut scorer, &frames).unwrap();
        search.hyp().unwrap()
    }

    #[test]
    fn tree_shares_prefixes() {
        let s = search();
        // FAR and RAH have different first phones plus fillers; at least
        // one root each, leaf channels carry the word ids.
        assert!(!s.roots.is_empty());
        let far = s.dict.word_id("FAR").unwrap();
        assert!(s.nodes.iter().any(|n| n.words.contains(&far)));
    }

    #[test]
    fn decodes_the_favoured_word() {
        let mut s = search();
        let n = s.mdef.n_sen();
        // F F AH AH R R: spells FAR.
        let plan = vec![
            favour(n, &[3, 4, 5]),
            favour(n, &[3, 4, 5]),
            favour(n, &[0, 1, 2]),
            favour(n, &[0, 1, 2]),
            favour(n, &[6, 7, 8]),
            favour(n, &[6, 7, 8]),
        ];
        let (hyp, _score) = decode(&mut s, plan);
        assert_eq!(hyp, "FAR");
    }

    #[test]
    fn decodes_the_other_word() {
        let mut s = search();
        let n = s.mdef.n_sen();
        // R R AH AH: spells RAH.
        let plan = vec![
            favour(n, &[6, 7, 8]),
            favour(n, &[6, 7, 8]),
            favour(n, &[0, 1, 2]),
            favour(n, &[0, 1, 2]),
        ];
        let (hyp, _) = decode(&mut s, plan);
        assert_eq!(hyp, "RAH");
    }

    #[test]
    fn bp_invariant_holds_after_decode() {
        let mut s = search();
        let n = s.mdef.n_sen();
        let plan = vec![
            favour(n, &[3, 4, 5]),
            favour(n, &[0, 1, 2]),
            favour(n, &[6, 7, 8]),
            favour(n, &[9, 10, 11]),
            favour(n, &[6, 7, 8]),
            favour(n, &[0, 1, 2]),
        ];
        decode(&mut s, plan);
        assert!(s.bpt.check_invariant());
    }

    #[test]
    fn empty_utterance_still_yields_a_hypothesis() {
        let mut s = search();
        let n_sen = s.mdef.n_sen();
        s.begin().unwrap();
        let mut scorer = PlannedScorer {
            plan: vec![vec![0; n_sen]],
            n_sen,
        };
        s.end(&mut scorer, &[]).unwrap();
        let (hyp, _) = s.hyp().unwrap();
        assert_eq!(hyp, "");
        assert!(s.seg().is_empty());
    }

    #[test]
    fn partial_results_while_running() {
        let mut s = search();
        let n = s.mdef.n_sen();
        s.begin().unwrap();
        let mut senscr;
        for (f, row) in [favour(n, &[6, 7, 8]), favour(n, &[0, 1, 2])]
            .into_iter()
            .enumerate()
        {
            senscr = row;
            s.step(f as i32, &senscr).unwrap();
        }
        // Mid-utterance results are allowed to exist (and to change later).
        let _ = s.hyp();
    }

    #[test]
    fn widening_the_beam_never_loses_the_winner() {
        let n;
        let plan;
        {
            let s = search();
            n = s.mdef.n_sen();
            plan = vec![
                favour(n, &[3, 4, 5]),
                favour(n, &[3, 4, 5]),
                favour(n, &[0, 1, 2]),
                favour(n, &[0, 1, 2]),
                favour(n, &[6, 7, 8]),
                favour(n, &[6, 7, 8]),
            ];
        }
        let mut tight = search();
        tight.beam = tight.lmath.log(1e-30);
        let (hyp_tight, _) = decode(&mut tight, plan.clone());
        let mut wide = search();
        wide.beam = wide.lmath.log(1e-60);
        let (hyp_wide, _) = decode(&mut wide, plan);
        assert_eq!(hyp_tight, "FAR");
        assert_eq!(hyp_wide, "FAR");
    }
}
