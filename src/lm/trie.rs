//! Packed N-gram trie. Unigrams are a plain array; every higher order is a
//! bit-packed table of `(word, quantized prob [, quantized backoff]
//! [, first-child index])` entries. Children of an entry are the contiguous
//! range between its first-child index and the next entry's, with one
//! sentinel entry past the end closing the final range. The trie is keyed in
//! recency order: the unigram level is the *predicted* word and each level
//! below it is one more step back into the history, which is what makes the
//! backoff walk a straight descent.
use crate::error::{Result, SttError};
use crate::lm::bitarr::{self, BitMask};
use crate::lm::quant::LmQuant;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use tracing::info;

pub const MAX_NGRAM_ORDER: usize = 6;

/// One N-gram as pulled out of a model file, before packing. `words` is in
/// trie order: `words[0]` is the predicted word, the rest walk backwards
/// through the history.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNgram {
    pub words: Vec<u32>,
    pub prob: f32,
    pub backoff: f32,
}

impl RawNgram {
    /// Trie-order comparison: lexicographic on words, shorter first on ties.
    pub fn trie_cmp(a: &[u32], b: &[u32]) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Unigram {
    pub prob: f32,
    pub bo: f32,
    pub next: u32,
}

#[derive(Debug, Clone, Copy)]
struct NodeRange {
    begin: u32,
    end: u32,
}

/// Geometry of one packed middle level.
#[derive(Debug, Clone)]
struct Middle {
    word_mask: BitMask,
    quant_bits: u8,
    next_mask: BitMask,
    total_bits: u8,
    max_vocab: u32,
    insert_index: u32,
    /// Byte offset of this level inside `ngram_mem`.
    mem_offset: usize,
    mem_size: usize,
}

#[derive(Debug, Clone)]
struct Longest {
    word_mask: BitMask,
    quant_bits: u8,
    total_bits: u8,
    max_vocab: u32,
    insert_index: u32,
    mem_offset: usize,
    mem_size: usize,
}

/// Bytes needed for a packed level: one sentinel entry plus slack so the
/// 64-bit window reads can't run off the end.
fn base_size(entries: u32, max_vocab: u32, remaining_bits: u8) -> usize {
    let total_bits = bitarr::required_bits(max_vocab) as usize + remaining_bits as usize;
    ((1 + entries as usize) * total_bits + 7) / 8 + std::mem::size_of::<u64>()
}

fn middle_size(quant_bits: u8, entries: u32, max_vocab: u32, max_ptr: u32) -> usize {
    base_size(
        entries,
        max_vocab,
        quant_bits + bitarr::required_bits(max_ptr),
    )
}

fn longest_size(quant_bits: u8, entries: u32, max_vocab: u32) -> usize {
    base_size(entries, max_vocab, quant_bits)
}

pub struct LmTrie {
    pub(crate) order: usize,
    pub(crate) unigrams: Vec<Unigram>,
    pub(crate) quant: Option<LmQuant>,
    middles: Vec<Middle>,
    longest: Option<Longest>,
    ngram_mem: Vec<u8>,
    hist_cache: Vec<i32>,
    backoff_cache: Vec<f32>,
}

impl LmTrie {
    pub fn new(unigram_count: u32, order: usize) -> Self {
        assert!((1..=MAX_NGRAM_ORDER).contains(&order));
        Self {
            order,
            unigrams: vec![Unigram::default(); unigram_count as usize + 1],
            quant: (order > 1).then(|| LmQuant::new(order)),
            middles: Vec::new(),
            longest: None,
            ngram_mem: Vec::new(),
            hist_cache: vec![-1; order.max(2) - 1],
            backoff_cache: vec![0.0; order.max(2) - 1],
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn n_unigrams(&self) -> u32 {
        self.unigrams.len() as u32 - 1
    }

    /// Lay out the packed levels for the given (already blank-fixed) counts.
    fn alloc_levels(&mut self, counts: &[u32]) {
        let order = self.order;
        if order < 2 {
            return;
        }
        let quant = self.quant.as_ref().unwrap();
        let mut mem_size = 0usize;
        let mut offsets = Vec::new();
        for lvl in 0..order - 2 {
            offsets.push(mem_size);
            mem_size += middle_size(
                quant.middle_bits(),
                counts[lvl + 1],
                counts[0],
                counts[lvl + 2],
            );
        }
        let longest_offset = mem_size;
        mem_size += longest_size(quant.longest_bits(), counts[order - 1], counts[0]);
        self.ngram_mem = vec![0u8; mem_size];

        self.middles = (0..order - 2)
            .map(|lvl| {
                let next_mask = BitMask::from_max(counts[lvl + 2]);
                let word_mask = BitMask::from_max(counts[0]);
                Middle {
                    word_mask,
                    quant_bits: quant.middle_bits(),
                    next_mask,
                    total_bits: word_mask.bits + quant.middle_bits() + next_mask.bits,
                    max_vocab: counts[0],
                    insert_index: 0,
                    mem_offset: offsets[lvl],
                    mem_size: middle_size(
                        quant.middle_bits(),
                        counts[lvl + 1],
                        counts[0],
                        counts[lvl + 2],
                    ),
                }
            })
            .collect();
        let word_mask = BitMask::from_max(counts[0]);
        self.longest = Some(Longest {
            word_mask,
            quant_bits: quant.longest_bits(),
            total_bits: word_mask.bits + quant.longest_bits(),
            max_vocab: counts[0],
            insert_index: 0,
            mem_offset: longest_offset,
            mem_size: longest_size(quant.longest_bits(), counts[order - 1], counts[0]),
        });
    }

    fn path_prob(
        raw: &[Vec<RawNgram>],
        blanks: &[std::collections::HashMap<Vec<u32>, f32>],
        unigrams: &[Unigram],
        path: &[u32],
    ) -> f32 {
        if path.len() == 1 {
            return unigrams[path[0] as usize].prob;
        }
        let level = &raw[path.len() - 2];
        if let Ok(at) = level.binary_search_by(|e| RawNgram::trie_cmp(&e.words, path)) {
            return level[at].prob;
        }
        blanks[path.len() - 2][path]
    }

    fn ensure_prefix_inner(
        raw: &[Vec<RawNgram>],
        blanks: &mut Vec<std::collections::HashMap<Vec<u32>, f32>>,
        unigrams: &[Unigram],
        prefix: &[u32],
    ) {
        if prefix.len() < 2 {
            return;
        }
        let level = &raw[prefix.len() - 2];
        if level
            .binary_search_by(|e| RawNgram::trie_cmp(&e.words, prefix))
            .is_ok()
            || blanks[prefix.len() - 2].contains_key(prefix)
        {
            return;
        }
        Self::ensure_prefix_inner(raw, blanks, unigrams, &prefix[..prefix.len() - 1]);
        let prob = Self::path_prob(raw, blanks, unigrams, &prefix[..prefix.len() - 1])
            + unigrams[prefix[prefix.len() - 1] as usize].bo;
        blanks[prefix.len() - 2].insert(prefix.to_vec(), prob);
    }

    /// Build the packed levels from per-order raw lists. Returns the counts
    /// including synthesized blanks.
    pub fn build(&mut self, raw: &mut [Vec<RawNgram>], _counts: &[u32]) -> Result<Vec<u32>> {
        assert_eq!(raw.len(), self.order - 1);
        for level in raw.iter_mut() {
            level.sort_by(|a, b| RawNgram::trie_cmp(&a.words, &b.words));
        }
        // Blank insertion needs the unigram backoffs, which live on self.
        {
            use std::collections::HashMap;
            let mut blanks: Vec<HashMap<Vec<u32>, f32>> = vec![HashMap::new(); raw.len()];
            for order_idx in 1..raw.len() {
                let prefixes: Vec<Vec<u32>> = raw[order_idx]
                    .iter()
                    .map(|e| e.words[..e.words.len() - 1].to_vec())
                    .collect();
                for prefix in prefixes {
                    Self::ensure_prefix_inner(raw, &mut blanks, &self.unigrams, &prefix);
                }
            }
            for (order_idx, level_blanks) in blanks.into_iter().enumerate() {
                for (words, prob) in level_blanks {
                    raw[order_idx].push(RawNgram {
                        words,
                        prob,
                        backoff: 0.0,
                    });
                }
                raw[order_idx].sort_by(|a, b| RawNgram::trie_cmp(&a.words, &b.words));
            }
        }
        let fixed: Vec<u32> = std::iter::once(self.n_unigrams())
            .chain(raw.iter().map(|l| l.len() as u32))
            .collect();
        self.alloc_levels(&fixed);

        if fixed[0] >= 1 << 25 {
            return Err(SttError::out_of_range(
                "lm trie",
                "word indices over 2^25 are not supported",
            ));
        }
        for (lvl, &c) in fixed.iter().enumerate().skip(1) {
            if c + 1 >= 1 << 25 {
                return Err(SttError::out_of_range(
                    "lm trie",
                    format!("too many {}-grams for the packed index", lvl + 1),
                ));
            }
        }

        // Train the quantizers on the raw values.
        {
            let quant = self.quant.as_mut().unwrap();
            if self.order > 2 {
                info!("Training quantizer");
            }
            for order in 2..self.order {
                let level = &raw[order - 2];
                let mut probs: Vec<f32> = level.iter().map(|n| n.prob).collect();
                let mut bos: Vec<f32> = level.iter().map(|n| n.backoff).collect();
                quant.train_middle(order, &mut probs, &mut bos);
            }
            let mut probs: Vec<f32> = raw[self.order - 2].iter().map(|n| n.prob).collect();
            quant.train_longest(&mut probs);
        }

        info!("Building LM trie");
        let raw: &[Vec<RawNgram>] = raw;
        let mut heap = MergeHeap::new(raw);
        let mut unigram_idx = 0usize;
        loop {
            // Unigram entries interleave with the packed inserts so parents
            // always record the child level's current insert index.
            let next_is_unigram = match heap.peek_key() {
                Some(key) => RawNgram::trie_cmp(&[unigram_idx as u32], key) == Ordering::Less,
                None => true,
            };
            if next_is_unigram {
                self.unigrams[unigram_idx].next = if self.order == 2 {
                    self.longest.as_ref().unwrap().insert_index
                } else {
                    self.middles[0].insert_index
                };
                unigram_idx += 1;
                if unigram_idx == self.unigrams.len() {
                    break;
                }
                continue;
            }
            let (order_idx, pos) = heap.pop().unwrap();
            let entry = &raw[order_idx][pos];
            let order = entry.words.len();
            let (word, prob, backoff) = (entry.words[order - 1], entry.prob, entry.backoff);
            if order == self.order {
                self.longest_insert(word, prob);
            } else {
                self.middle_insert(order - 2, word, prob, backoff);
            }
            heap.advance(order_idx, pos);
        }

        // Close the last child range of every level with the sentinel entry.
        for lvl in 0..self.middles.len() {
            let next_end = if lvl + 1 < self.middles.len() {
                self.middles[lvl + 1].insert_index
            } else {
                self.longest.as_ref().unwrap().insert_index
            };
            self.middle_finish(lvl, next_end);
        }
        Ok(fixed)
    }

    fn middle_insert(&mut self, lvl: usize, word: u32, prob: f32, backoff: f32) {
        let packed = self.quant.as_ref().unwrap().encode_middle(lvl + 2, prob, backoff);
        let next = if lvl + 1 < self.middles.len() {
            self.middles[lvl + 1].insert_index
        } else {
            self.longest.as_ref().unwrap().insert_index
        };
        let m = &mut self.middles[lvl];
        debug_assert!(word <= m.word_mask.mask);
        let mem = &mut self.ngram_mem[m.mem_offset..m.mem_offset + m.mem_size];
        let mut off = m.insert_index as usize * m.total_bits as usize;
        bitarr::write_u25(mem, off, word);
        off += m.word_mask.bits as usize;
        bitarr::write_u57(mem, off, packed);
        off += m.quant_bits as usize;
        bitarr::write_u25(mem, off, next);
        m.insert_index += 1;
    }

    fn middle_finish(&mut self, lvl: usize, next_end: u32) {
        let m = &mut self.middles[lvl];
        let mem = &mut self.ngram_mem[m.mem_offset..m.mem_offset + m.mem_size];
        let off = (m.insert_index as usize + 1) * m.total_bits as usize
            - m.next_mask.bits as usize;
        bitarr::write_u25(mem, off, next_end);
    }

    fn longest_insert(&mut self, word: u32, prob: f32) {
        let idx = self.quant.as_ref().unwrap().encode_longest(prob);
        let l = self.longest.as_mut().unwrap();
        debug_assert!(word <= l.word_mask.mask);
        let mem = &mut self.ngram_mem[l.mem_offset..l.mem_offset + l.mem_size];
        let mut off = l.insert_index as usize * l.total_bits as usize;
        bitarr::write_u25(mem, off, word);
        off += l.word_mask.bits as usize;
        bitarr::write_u25(mem, off, idx);
        l.insert_index += 1;
    }

    fn unigram_find(&self, word: u32) -> (&Unigram, NodeRange) {
        let u = &self.unigrams[word as usize];
        let range = NodeRange {
            begin: u.next,
            end: self.unigrams[word as usize + 1].next,
        };
        (u, range)
    }

    /// Uniform-interpolation search for `word` inside a packed level's child
    /// range. Returns the entry index.
    fn uniform_find(
        mem: &[u8],
        total_bits: u8,
        word_mask: BitMask,
        range: NodeRange,
        max_vocab: u32,
        word: u32,
    ) -> Option<u32> {
        let mut before_it = range.begin.wrapping_sub(1);
        let mut before_v = 0u32;
        let mut after_it = range.end;
        let mut after_v = max_vocab;
        if word > after_v {
            return None;
        }
        while after_it.wrapping_sub(before_it) > 1 {
            let off = (word - before_v) as u64;
            let span = (after_v - before_v) as u64;
            let width = (after_it.wrapping_sub(before_it) - 1) as u64;
            let pivot = before_it
                .wrapping_add(1)
                .wrapping_add(((off * width) / (span + 1)) as u32);
            let mid = bitarr::read_u25(
                mem,
                pivot as usize * total_bits as usize,
                word_mask.mask,
            );
            match mid.cmp(&word) {
                Ordering::Less => {
                    before_it = pivot;
                    before_v = mid;
                }
                Ordering::Greater => {
                    after_it = pivot;
                    after_v = mid;
                }
                Ordering::Equal => return Some(pivot),
            }
        }
        None
    }

    /// Find `word` in middle level `lvl` under `range`; on success returns
    /// the packed (bo|prob) value and replaces `range` with the child range.
    fn middle_find(&self, lvl: usize, word: u32, range: &mut NodeRange) -> Option<u64> {
        let m = &self.middles[lvl];
        let mem = &self.ngram_mem[m.mem_offset..m.mem_offset + m.mem_size];
        let at = Self::uniform_find(mem, m.total_bits, m.word_mask, *range, m.max_vocab, word)?;
        let mut off = at as usize * m.total_bits as usize + m.word_mask.bits as usize;
        let packed = bitarr::read_u57(
            mem,
            off,
            (1u64 << m.quant_bits) - 1,
        );
        off += m.quant_bits as usize;
        range.begin = bitarr::read_u25(mem, off, m.next_mask.mask);
        range.end = bitarr::read_u25(mem, off + m.total_bits as usize, m.next_mask.mask);
        Some(packed)
    }

    fn longest_find(&self, word: u32, range: NodeRange) -> Option<f32> {
        let l = self.longest.as_ref()?;
        let mem = &self.ngram_mem[l.mem_offset..l.mem_offset + l.mem_size];
        let at = Self::uniform_find(mem, l.total_bits, l.word_mask, range, l.max_vocab, word)?;
        let off = at as usize * l.total_bits as usize + l.word_mask.bits as usize;
        let idx = bitarr::read_u25(mem, off, (1u32 << l.quant_bits) - 1);
        Some(self.quant.as_ref().unwrap().decode_longest(idx))
    }

    /// Longest-suffix probability with no cache: used when the history is
    /// shorter than order-1.
    fn nobo_score(&self, wid: u32, hist: &[i32], n_used: &mut usize) -> f32 {
        *n_used = 1;
        let (uni, mut node) = self.unigram_find(wid);
        let mut prob = uni.prob;
        if hist.is_empty() {
            return prob;
        }
        let mut independent_left = node.begin == node.end;
        let mut matched = 0usize;
        for (i, &h) in hist.iter().enumerate() {
            if independent_left || h < 0 {
                break;
            }
            if i == self.order - 1 {
                break;
            }
            if i == self.order - 2 {
                if let Some(p) = self.longest_find(h as u32, node) {
                    prob = p;
                    *n_used = self.order;
                    matched = i + 1;
                }
                break;
            }
            match self.middle_find(i, h as u32, &mut node) {
                Some(packed) => {
                    prob = self.quant.as_ref().unwrap().decode_middle_prob(i + 2, packed);
                    *n_used = i + 2;
                    matched = i + 1;
                    independent_left = node.begin == node.end;
                }
                None => break,
            }
        }
        if matched >= hist.len() {
            return prob;
        }
        prob + self.available_backoff(*n_used, hist)
    }

    /// Sum of backoff weights of the history prefixes from order `start` up:
    /// one descent from `hist[0]`, accumulating only the levels the found
    /// probability didn't already cover.
    fn available_backoff(&self, start: usize, hist: &[i32]) -> f32 {
        let mut backoff = 0.0f32;
        if hist.is_empty() || hist[0] < 0 {
            return backoff;
        }
        let (first, node) = self.unigram_find(hist[0] as u32);
        if start <= 1 {
            backoff += first.bo;
        }
        let mut node = node;
        for (lvl, &h) in hist.iter().enumerate().skip(1) {
            if h < 0 || lvl - 1 >= self.middles.len() {
                break;
            }
            match self.middle_find(lvl - 1, h as u32, &mut node) {
                Some(packed) => {
                    if lvl + 1 >= start {
                        backoff += self
                            .quant
                            .as_ref()
                            .unwrap()
                            .decode_middle_bo(lvl + 1, packed);
                    }
                }
                None => break,
            }
        }
        backoff
    }

    fn hist_score(&self, wid: u32, hist: &[i32], n_used: &mut usize) -> f32 {
        *n_used = 1;
        let (uni, mut node) = self.unigram_find(wid);
        let mut prob = uni.prob;
        if hist.is_empty() {
            return prob;
        }
        for i in 0..hist.len() - 1 {
            match self.middle_find(i, hist[i] as u32, &mut node) {
                Some(packed) => {
                    *n_used += 1;
                    prob = self.quant.as_ref().unwrap().decode_middle_prob(i + 2, packed);
                }
                None => {
                    for j in i..hist.len() {
                        prob += self.backoff_cache[j];
                    }
                    return prob;
                }
            }
        }
        match self.longest_find(hist[hist.len() - 1] as u32, node) {
            Some(p) => {
                *n_used += 1;
                p
            }
            None => prob + self.backoff_cache[hist.len() - 1],
        }
    }

    fn update_backoff(&mut self, hist: &[i32]) {
        for b in self.backoff_cache.iter_mut() {
            *b = 0.0;
        }
        if hist.is_empty() || hist[0] < 0 {
            return;
        }
        let (first, node) = self.unigram_find(hist[0] as u32);
        let first_bo = first.bo;
        let mut node = node;
        self.backoff_cache[0] = first_bo;
        for i in 1..hist.len() {
            let found = self.middle_find(i - 1, hist[i] as u32, &mut node);
            match found {
                Some(packed) => {
                    self.backoff_cache[i] = self
                        .quant
                        .as_ref()
                        .unwrap()
                        .decode_middle_bo(i + 1, packed);
                }
                None => break,
            }
        }
        self.hist_cache[..hist.len()].copy_from_slice(hist);
    }

    /// Backoff-smoothed log probability (natural log) and the number of
    /// history words actually used.
    pub fn score(&mut self, wid: u32, hist: &[i32]) -> (f32, usize) {
        let hist = &hist[..hist.len().min(self.order - 1)];
        let hist = match hist.iter().position(|&h| h < 0) {
            Some(cut) => &hist[..cut],
            None => hist,
        };
        let mut n_used = 0usize;
        if hist.len() < self.order - 1 {
            let prob = self.nobo_score(wid, hist, &mut n_used);
            (prob, n_used)
        } else {
            if self.hist_cache[..hist.len()] != *hist {
                self.update_backoff(hist);
            }
            let prob = self.hist_score(wid, hist, &mut n_used);
            (prob, n_used)
        }
    }

    /// Any unigram change invalidates the cached backoff walk.
    pub fn flush_cache(&mut self) {
        for h in self.hist_cache.iter_mut() {
            *h = -1;
        }
        for b in self.backoff_cache.iter_mut() {
            *b = 0.0;
        }
    }

    /// Walk the packed levels back into raw N-grams of the given order, words
    /// in ARPA order (oldest history first, predicted word last).
    pub fn extract_raw(&self, order: usize) -> Vec<RawNgram> {
        let mut out = Vec::new();
        let mut hist = vec![0u32; order];
        for w in 0..self.n_unigrams() {
            let (_, node) = self.unigram_find(w);
            hist[0] = w;
            self.extract_level(&mut out, node, &mut hist, 1, order);
        }
        out
    }

    fn extract_level(
        &self,
        out: &mut Vec<RawNgram>,
        range: NodeRange,
        hist: &mut [u32],
        n_hist: usize,
        order: usize,
    ) {
        if range.begin == range.end {
            return;
        }
        if n_hist < order - 1 {
            let m = &self.middles[n_hist - 1];
            let mem = &self.ngram_mem[m.mem_offset..m.mem_offset + m.mem_size];
            for ptr in range.begin..range.end {
                let mut off = ptr as usize * m.total_bits as usize;
                hist[n_hist] = bitarr::read_u25(mem, off, m.word_mask.mask);
                off += m.word_mask.bits as usize + m.quant_bits as usize;
                let child = NodeRange {
                    begin: bitarr::read_u25(mem, off, m.next_mask.mask),
                    end: bitarr::read_u25(mem, off + m.total_bits as usize, m.next_mask.mask),
                };
                self.extract_level(out, child, hist, n_hist + 1, order);
            }
        } else {
            for ptr in range.begin..range.end {
                let (word, prob, backoff) = if order == self.order {
                    let l = self.longest.as_ref().unwrap();
                    let mem = &self.ngram_mem[l.mem_offset..l.mem_offset + l.mem_size];
                    let mut off = ptr as usize * l.total_bits as usize;
                    let word = bitarr::read_u25(mem, off, l.word_mask.mask);
                    off += l.word_mask.bits as usize;
                    let idx = bitarr::read_u25(mem, off, (1u32 << l.quant_bits) - 1);
                    (word, self.quant.as_ref().unwrap().decode_longest(idx), 0.0)
                } else {
                    let m = &self.middles[n_hist - 1];
                    let mem = &self.ngram_mem[m.mem_offset..m.mem_offset + m.mem_size];
                    let mut off = ptr as usize * m.total_bits as usize;
                    let word = bitarr::read_u25(mem, off, m.word_mask.mask);
                    off += m.word_mask.bits as usize;
                    let packed = bitarr::read_u57(mem, off, (1u64 << m.quant_bits) - 1);
                    let quant = self.quant.as_ref().unwrap();
                    (
                        word,
                        quant.decode_middle_prob(n_hist + 1, packed),
                        quant.decode_middle_bo(n_hist + 1, packed),
                    )
                };
                hist[n_hist] = word;
                // ARPA order is the reverse of the descent path.
                let words: Vec<u32> = hist[..=n_hist].iter().rev().copied().collect();
                out.push(RawNgram {
                    words,
                    prob,
                    backoff,
                });
            }
        }
    }

    /// Serialize quantizer, unigram array and packed blob, in that order.
    pub fn write_bin(&self, mut w: impl Write) -> Result<()> {
        if let Some(quant) = &self.quant {
            quant.write(&mut w)?;
        }
        for u in &self.unigrams {
            w.write_all(&u.prob.to_le_bytes())?;
            w.write_all(&u.bo.to_le_bytes())?;
            w.write_all(&u.next.to_le_bytes())?;
        }
        w.write_all(&self.ngram_mem)?;
        Ok(())
    }

    pub fn read_bin(mut r: impl Read, counts: &[u32], order: usize) -> Result<Self> {
        let mut trie = Self::new(counts[0], order);
        if order > 1 {
            trie.quant = Some(LmQuant::read(&mut r, order)?);
        }
        let mut buf = [0u8; 12];
        for u in trie.unigrams.iter_mut() {
            r.read_exact(&mut buf)
                .map_err(|_| SttError::bad_format("lm trie", "truncated unigram array"))?;
            u.prob = f32::from_le_bytes(buf[0..4].try_into().unwrap());
            u.bo = f32::from_le_bytes(buf[4..8].try_into().unwrap());
            u.next = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        }
        if order > 1 {
            trie.alloc_levels(counts);
            r.read_exact(&mut trie.ngram_mem)
                .map_err(|_| SttError::bad_format("lm trie", "truncated ngram tables"))?;
            // Restore insert indices from the counts so sentinel math works.
            for (lvl, m) in trie.middles.iter_mut().enumerate() {
                m.insert_index = counts[lvl + 1];
            }
            if let Some(l) = trie.longest.as_mut() {
                l.insert_index = counts[order - 1];
            }
        }
        Ok(trie)
    }

    pub fn mem_bytes(&self) -> usize {
        self.ngram_mem.len()
    }
}

/// K-way merge over the sorted per-order lists, popping in trie order.
struct MergeHeap<'a> {
    raw: &'a [Vec<RawNgram>],
    heap: BinaryHeap<HeapItem<'a>>,
}

struct HeapItem<'a> {
    key: &'a [u32],
    order_idx: usize,
    pos: usize,
}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem<'_> {}

impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap max pop yields the smallest key.
        RawNgram::trie_cmp(other.key, self.key)
    }
}

impl<'a> MergeHeap<'a> {
    fn new(raw: &'a [Vec<RawNgram>]) -> Self {
        let mut heap = BinaryHeap::new();
        for (order_idx, level) in raw.iter().enumerate() {
            if let Some(first) = level.first() {
                heap.push(HeapItem {
                    key: &first.words,
                    order_idx,
                    pos: 0,
                });
            }
        }
        Self { raw, heap }
    }

    fn peek_key(&self) -> Option<&[u32]> {
        self.heap.peek().map(|i| i.key)
    }

    fn pop(&mut self) -> Option<(usize, usize)> {
        self.heap.pop().map(|i| (i.order_idx, i.pos))
    }

    fn advance(&mut self, order_idx: usize, pos: usize) {
        if let Some(next) = self.raw[order_idx].get(pos + 1) {
            self.heap.push(HeapItem {
                key: &next.words,
                order_idx,
                pos: pos + 1,
            });
        }
    }
}
