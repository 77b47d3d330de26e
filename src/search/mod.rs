//! The Viterbi searches. A search consumes per-frame senone scores and
//! maintains its own active HMM set and backpointer table; the decoder owns
//! the utterance lifecycle and hands every search the scores it asked for.
use crate::acoustic::{AcousticScorer, Feature};
use crate::dict::Dict;
use crate::error::Result;
use crate::lattice::Lattice;
use std::sync::Arc;

pub mod bptable;
pub mod fsg_search;
pub mod fwdflat;
pub mod fwdtree;
pub mod hmm;
pub mod phone_loop;

/// One word of a segmentation, frames inclusive. `post` is the log
/// posterior from the lattice when a rescoring pass computed one, zero
/// (certain) otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct SegEntry {
    pub word: String,
    pub wid: i32,
    pub sf: i32,
    pub ef: i32,
    pub ascr: i32,
    pub lscr: i32,
    pub post: i32,
}

pub trait Search {
    /// Prepare per-utterance state. Fails with `BadState` semantics handled
    /// by the decoder.
    fn begin(&mut self) -> Result<()>;

    /// Senones the next frame needs scored.
    fn active_senones(&self, out: &mut Vec<i32>);

    /// Advance one frame given the dense senone score array.
    fn step(&mut self, frame: i32, senscr: &[i32]) -> Result<()>;

    /// Finish the utterance; rescoring passes may re-decode the stored
    /// frames through the scorer.
    fn end(&mut self, scorer: &mut dyn AcousticScorer, frames: &[Feature]) -> Result<()>;

    /// Best hypothesis string and path score. Legal mid-utterance, in which
    /// case it is the current partial result.
    fn hyp(&self) -> Option<(String, i32)>;

    fn seg(&self) -> Vec<SegEntry>;

    fn lattice(&self) -> Option<&Lattice>;

    fn nbest(&self, n: usize) -> Vec<(String, i32)>;

    /// Pick up dictionary changes; called by the decoder before the next
    /// utterance when words were added.
    fn reinit(&mut self, dict: Arc<Dict>) -> Result<()>;
}

/// Collect the LM history (base word ids, fillers skipped) leading into a
/// backpointer, most recent first.
pub(crate) fn lm_history(
    bpt: &bptable::BpTable,
    dict: &Dict,
    mut bp: i32,
    max: usize,
) -> Vec<i32> {
    let mut hist = Vec::with_capacity(max);
    while bp != hmm::NO_BP && hist.len() < max {
        let e = bpt.get(bp);
        if !dict.is_filler(e.wid) {
            hist.push(dict.base_id(e.wid));
        }
        bp = e.prev;
    }
    hist
}

/// Render a hypothesis string from a BP chain, hiding fillers and sentence
/// markers.
pub(crate) fn hyp_string(bpt: &bptable::BpTable, dict: &Dict, bp: i32) -> String {
    let chain = bpt.backtrace(bp);
    let mut words = Vec::new();
    for idx in chain {
        let e = bpt.get(idx);
        if !dict.is_hidden(e.wid) {
            words.push(dict.word_str(e.wid).to_string());
        }
    }
    words.join(" ")
}

/// Segmentation from a BP chain, fillers included (callers filter).
pub(crate) fn seg_from_chain(bpt: &bptable::BpTable, dict: &Dict, bp: i32) -> Vec<SegEntry> {
    bpt.backtrace(bp)
        .into_iter()
        .map(|idx| {
            let e = bpt.get(idx);
            SegEntry {
                word: dict.word_str(e.wid).to_string(),
                wid: e.wid,
                sf: e.start_frame,
                ef: e.frame,
                ascr: e.ascr,
                lscr: e.lscr,
                post: 0,
            }
        })
        .collect()
}

/// Deterministic scorer for search tests: frame index selects a canned score
/// row, features are ignored.
#[cfg(test)]
pub(crate) struct PlannedScorer {
    pub plan: Vec<Vec<i32>>,
    pub n_sen: usize,
}

#[cfg(test)]
impl AcousticScorer for PlannedScorer {
    fn n_senones(&self) -> usize {
        self.n_sen
    }

    fn frame_eval(
        &mut self,
        _feat: &Feature,
        frame_idx: i32,
        _active: Option<&[i32]>,
        scores: &mut [i32],
    ) -> Result<()> {
        let row = &self.plan[(frame_idx as usize).min(self.plan.len() - 1)];
        scores[..row.len()].copy_from_slice(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdef::tests::tiny_mdef;
    use std::io::Cursor;

    fn test_dict() -> Dict {
        let mdef = tiny_mdef();
        Dict::from_reader(
            &mdef,
            Cursor::new("FAR  F AH R\nRAH  R AH\n".to_string()),
            None::<Cursor<String>>,
            false,
        )
        .unwrap()
    }

    #[test]
    fn history_skips_fillers() {
        let dict = test_dict();
        let far = dict.word_id("FAR").unwrap();
        let rah = dict.word_id("RAH").unwrap();
        let sil = dict.word_id("<sil>").unwrap();
        let mut bpt = bptable::BpTable::default();
        let a = bpt.enter(5, far, -10, -10, 0, hmm::NO_BP);
        let b = bpt.enter(8, sil, -20, -10, 0, a);
        let c = bpt.enter(12, rah, -40, -15, -5, b);
        let hist = lm_history(&bpt, &dict, c, 3);
        assert_eq!(hist, vec![rah, far]);
        assert_eq!(hyp_string(&bpt, &dict, c), "FAR RAH");
        let seg = seg_from_chain(&bpt, &dict, c);
        assert_eq!(seg.len(), 3);
        assert_eq!(seg[1].word, "<sil>");
        assert_eq!(seg[2].sf, 9);
        assert_eq!(seg[2].ef, 12);
    }
}
