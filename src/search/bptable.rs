//! The backpointer table: an append-only log of word arrivals, one entry per
//! (frame, word) that survived pruning. Every hypothesis, segmentation and
//! lattice is reconstructed from here. Entries refer to their predecessors
//! by index, so the table can grow freely without invalidating anything.
use super::hmm::NO_BP;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpEntry {
    /// Frame this word ends in.
    pub frame: i32,
    pub wid: i32,
    pub start_frame: i32,
    /// Total path score at the word's exit.
    pub score: i32,
    /// Acoustic part of this word's segment.
    pub ascr: i32,
    /// Language part applied at this word's exit.
    pub lscr: i32,
    pub prev: i32,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct BpTable {
    entries: Vec<BpEntry>,
    /// First entry index of each frame, one sentinel past the end.
    frame_start: Vec<u32>,
    cur_frame: i32,
}

impl BpTable {
    pub fn clear(&mut self) {
        self.entries.clear();
        self.frame_start.clear();
        self.cur_frame = -1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: i32) -> &BpEntry {
        &self.entries[idx as usize]
    }

    /// Append an entry for a word ending at `frame` with predecessor `prev`.
    /// A predecessor must end at least two frames earlier: the word starts
    /// at `prev.frame + 1` and must end strictly after it starts.
    pub fn enter(&mut self, frame: i32, wid: i32, score: i32, ascr: i32, lscr: i32, prev: i32) -> i32 {
        while self.cur_frame < frame {
            self.cur_frame += 1;
            self.frame_start.push(self.entries.len() as u32);
        }
        let start_frame = if prev == NO_BP {
            0
        } else {
            self.entries[prev as usize].frame + 1
        };
        debug_assert!(prev == NO_BP || self.entries[prev as usize].frame + 1 < frame);
        let idx = self.entries.len() as i32;
        self.entries.push(BpEntry {
            frame,
            wid,
            start_frame,
            score,
            ascr,
            lscr,
            prev,
            valid: true,
        });
        idx
    }

    /// Entries ending in `frame`.
    pub fn frame_entries(&self, frame: i32) -> &[BpEntry] {
        let (lo, hi) = self.frame_range(frame);
        &self.entries[lo..hi]
    }

    pub fn frame_range(&self, frame: i32) -> (usize, usize) {
        if frame < 0 || frame as usize >= self.frame_start.len() {
            return (0, 0);
        }
        let lo = self.frame_start[frame as usize] as usize;
        let hi = if (frame as usize) + 1 < self.frame_start.len() {
            self.frame_start[frame as usize + 1] as usize
        } else {
            self.entries.len()
        };
        (lo, hi)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &BpEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i as i32, e))
    }

    /// Best valid entry ending in `frame`, optionally restricted to a word.
    pub fn best_exit(&self, frame: i32, wid: Option<i32>) -> Option<i32> {
        let (lo, hi) = self.frame_range(frame);
        let mut best: Option<i32> = None;
        for idx in lo..hi {
            let e = &self.entries[idx];
            if !e.valid {
                continue;
            }
            if let Some(w) = wid {
                if e.wid != w {
                    continue;
                }
            }
            if best.map_or(true, |b| self.entries[b as usize].score < e.score) {
                best = Some(idx as i32);
            }
        }
        best
    }

    /// Walk the predecessor chain from `bp` back to the utterance start,
    /// returned in time order.
    pub fn backtrace(&self, bp: i32) -> Vec<i32> {
        let mut out = Vec::new();
        let mut at = bp;
        while at != NO_BP {
            out.push(at);
            let e = &self.entries[at as usize];
            if e.prev != NO_BP && self.entries[e.prev as usize].frame > e.start_frame {
                warn!(
                    "Corrupted backpointer chain at {} ({} > {})",
                    at, self.entries[e.prev as usize].frame, e.start_frame
                );
                break;
            }
            at = e.prev;
        }
        out.reverse();
        out
    }

    /// Debug check of the ordering invariant: with a predecessor present,
    /// `prev.frame <= start_frame < frame` holds strictly.
    #[cfg(test)]
    pub fn check_invariant(&self) -> bool {
        self.entries.iter().all(|e| {
            e.prev == NO_BP || {
                let p = &self.entries[e.prev as usize];
                p.frame <= e.start_frame && e.start_frame < e.frame
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_and_start_frames() {
        let mut bpt = BpTable::default();
        let a = bpt.enter(10, 1, -100, -100, 0, NO_BP);
        let b = bpt.enter(20, 2, -250, -120, -30, a);
        let c = bpt.enter(31, 3, -400, -110, -40, b);
        assert_eq!(bpt.get(a).start_frame, 0);
        assert_eq!(bpt.get(b).start_frame, 11);
        assert_eq!(bpt.get(c).start_frame, 21);
        assert_eq!(bpt.backtrace(c), vec![a, b, c]);
        assert!(bpt.check_invariant());
    }

    #[test]
    fn frame_indexing() {
        let mut bpt = BpTable::default();
        let a = bpt.enter(3, 1, -10, -10, 0, NO_BP);
        bpt.enter(5, 2, -30, -20, 0, a);
        bpt.enter(5, 3, -20, -10, 0, a);
        assert_eq!(bpt.frame_entries(3).len(), 1);
        assert_eq!(bpt.frame_entries(4).len(), 0);
        assert_eq!(bpt.frame_entries(5).len(), 2);
        assert_eq!(bpt.frame_entries(9).len(), 0);
        // Best exit in frame 5 is the higher scoring word 3.
        let best = bpt.best_exit(5, None).unwrap();
        assert_eq!(bpt.get(best).wid, 3);
        assert_eq!(bpt.best_exit(5, Some(2)).map(|b| bpt.get(b).wid), Some(2));
    }

    #[test]
    fn clear_resets_everything() {
        let mut bpt = BpTable::default();
        bpt.enter(0, 1, -1, -1, 0, NO_BP);
        bpt.clear();
        assert!(bpt.is_empty());
        assert_eq!(bpt.frame_entries(0).len(), 0);
        bpt.enter(2, 4, -5, -5, 0, NO_BP);
        assert_eq!(bpt.frame_entries(2).len(), 1);
    }
}
