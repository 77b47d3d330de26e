//! Word-level finite-state grammars. States are integers, transitions either
//! emit a word, are pure epsilons, or are "tag" epsilons carrying a semantic
//! word id. Between any pair of states at most one null transition and one
//! emitting transition per word survive, always the best scoring one.
use crate::error::{Result, SttError};
use crate::logmath::LogMath;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NO_WID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsgLink {
    pub from_state: i32,
    pub to_state: i32,
    /// log(transition probability) * lw
    pub logs2prob: i32,
    /// Word id, or `NO_WID` for a pure epsilon.
    pub wid: i32,
}

impl FsgLink {
    pub fn is_epsilon(&self) -> bool {
        self.wid == NO_WID
    }
}

#[derive(Debug)]
pub struct FsgModel {
    name: String,
    lmath: Arc<LogMath>,
    vocab: Vec<String>,
    wid_map: HashMap<String, i32>,
    silwords: Vec<bool>,
    altwords: Vec<bool>,
    n_state: usize,
    pub start_state: i32,
    pub final_state: i32,
    lw: f32,
    /// Emitting transitions, per from-state, keyed by to-state.
    trans: Vec<HashMap<i32, Vec<FsgLink>>>,
    /// Null (epsilon/tag) transitions, per from-state, keyed by to-state.
    null_trans: Vec<HashMap<i32, FsgLink>>,
}

impl FsgModel {
    pub fn new(name: &str, lmath: Arc<LogMath>, lw: f32, n_state: usize) -> Self {
        Self {
            name: name.to_string(),
            lmath,
            vocab: Vec::new(),
            wid_map: HashMap::new(),
            silwords: Vec::new(),
            altwords: Vec::new(),
            n_state,
            start_state: 0,
            final_state: 0,
            lw,
            trans: vec![HashMap::new(); n_state],
            null_trans: vec![HashMap::new(); n_state],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    pub fn n_word(&self) -> usize {
        self.vocab.len()
    }

    pub fn lw(&self) -> f32 {
        self.lw
    }

    pub fn word_str(&self, wid: i32) -> &str {
        if wid == NO_WID {
            "(NULL)"
        } else {
            &self.vocab[wid as usize]
        }
    }

    pub fn word_id(&self, word: &str) -> Option<i32> {
        self.wid_map.get(word).copied()
    }

    pub fn word_add(&mut self, word: &str) -> i32 {
        if let Some(&id) = self.wid_map.get(word) {
            return id;
        }
        let id = self.vocab.len() as i32;
        self.vocab.push(word.to_string());
        self.wid_map.insert(word.to_string(), id);
        self.silwords.push(false);
        self.altwords.push(false);
        id
    }

    pub fn is_filler(&self, wid: i32) -> bool {
        wid >= 0 && self.silwords[wid as usize]
    }

    pub fn is_alt(&self, wid: i32) -> bool {
        wid >= 0 && self.altwords[wid as usize]
    }

    /// Add an emitting transition; a duplicate `(from, to, wid)` keeps only
    /// the better probability.
    pub fn trans_add(&mut self, from: i32, to: i32, logp: i32, wid: i32) {
        debug_assert!(wid >= 0);
        let links = self.trans[from as usize].entry(to).or_default();
        if let Some(existing) = links.iter_mut().find(|l| l.wid == wid) {
            if existing.logs2prob < logp {
                existing.logs2prob = logp;
            }
            return;
        }
        links.push(FsgLink {
            from_state: from,
            to_state: to,
            logs2prob: logp,
            wid,
        });
    }

    /// Add a null transition. Self-loop nulls are refused. Returns
    /// `Some(true)` if added, `Some(false)` if an existing one was upgraded,
    /// `None` if nothing changed.
    pub fn null_trans_add(&mut self, from: i32, to: i32, logp: i32) -> Option<bool> {
        self.tag_trans_add(from, to, logp, NO_WID)
    }

    /// A tag transition is a null transition with a semantic word id.
    pub fn tag_trans_add(&mut self, from: i32, to: i32, logp: i32, wid: i32) -> Option<bool> {
        if from == to {
            return None;
        }
        match self.null_trans[from as usize].get_mut(&to) {
            Some(existing) => {
                if existing.logs2prob < logp {
                    existing.logs2prob = logp;
                    Some(false)
                } else {
                    None
                }
            }
            None => {
                self.null_trans[from as usize].insert(
                    to,
                    FsgLink {
                        from_state: from,
                        to_state: to,
                        logs2prob: logp,
                        wid,
                    },
                );
                Some(true)
            }
        }
    }

    pub fn null_trans(&self, from: i32, to: i32) -> Option<&FsgLink> {
        self.null_trans[from as usize].get(&to)
    }

    pub fn trans(&self, from: i32, to: i32) -> &[FsgLink] {
        self.trans[from as usize]
            .get(&to)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All outgoing transitions from a state, emitting first then nulls.
    pub fn arcs(&self, from: i32) -> impl Iterator<Item = &FsgLink> {
        self.trans[from as usize]
            .values()
            .flatten()
            .chain(self.null_trans[from as usize].values())
    }

    /// Transitive closure of the null transitions: chains of epsilons
    /// collapse into direct links with summed log probabilities. Returns the
    /// resulting list of null links.
    pub fn null_trans_closure(&mut self) -> Vec<FsgLink> {
        let mut updated = true;
        while updated {
            updated = false;
            let mut additions = Vec::new();
            for from in 0..self.n_state as i32 {
                for link1 in self.null_trans[from as usize].values() {
                    for link2 in self.null_trans[link1.to_state as usize].values() {
                        additions.push((
                            from,
                            link2.to_state,
                            link1.logs2prob + link2.logs2prob,
                        ));
                    }
                }
            }
            for (from, to, logp) in additions {
                if self.tag_trans_add(from, to, logp, NO_WID) == Some(true) {
                    updated = true;
                }
            }
        }
        let links: Vec<FsgLink> = self
            .null_trans
            .iter()
            .flat_map(|m| m.values().copied())
            .collect();
        info!("{} null transitions added to null closure", links.len());
        links
    }

    /// Insert a filler self-loop at one state, or at every state when
    /// `state` is `None`.
    pub fn add_silence(&mut self, silword: &str, state: Option<i32>, silprob: f32) -> usize {
        let logsilp = self.lmath.log(silprob as f64);
        let wid = self.word_add(silword);
        self.silwords[wid as usize] = true;
        let states: Vec<i32> = match state {
            Some(s) => vec![s],
            None => (0..self.n_state as i32).collect(),
        };
        let mut n_trans = 0;
        for s in states {
            let links = self.trans[s as usize].entry(s).or_default();
            if !links.iter().any(|l| l.wid == wid) {
                links.push(FsgLink {
                    from_state: s,
                    to_state: s,
                    logs2prob: logsilp,
                    wid,
                });
                n_trans += 1;
            }
        }
        info!("Added {} silence word transitions", n_trans);
        n_trans
    }

    /// Mirror every transition of `baseword` for an alternate pronunciation
    /// entry.
    pub fn add_alt(&mut self, baseword: &str, altword: &str) -> usize {
        let Some(basewid) = self.word_id(baseword) else {
            return 0;
        };
        let altwid = self.word_add(altword);
        self.altwords[altwid as usize] = true;
        let mut n_alt = 0;
        for from in 0..self.n_state {
            let mirrored: Vec<FsgLink> = self.trans[from]
                .values()
                .flatten()
                .filter(|l| l.wid == basewid)
                .copied()
                .collect();
            for l in mirrored {
                self.trans_add(l.from_state, l.to_state, l.logs2prob, altwid);
                n_alt += 1;
            }
        }
        debug!("Added {} alternate word transitions for {}", n_alt, altword);
        n_alt
    }

    fn closure_of(&self, states: &[i32]) -> Vec<i32> {
        let mut seen = vec![false; self.n_state];
        let mut stack: Vec<i32> = states.to_vec();
        for &s in states {
            seen[s as usize] = true;
        }
        while let Some(s) = stack.pop() {
            for link in self.null_trans[s as usize].values() {
                if !seen[link.to_state as usize] {
                    seen[link.to_state as usize] = true;
                    stack.push(link.to_state);
                }
            }
        }
        seen.iter()
            .enumerate()
            .filter(|(_, &v)| v)
            .map(|(i, _)| i as i32)
            .collect()
    }

    /// True iff there is a path from start to final whose emitting
    /// transitions spell `words`. The reference semantics for grammar tests.
    pub fn accept(&self, words: &str) -> bool {
        let mut current = self.closure_of(&[self.start_state]);
        for word in words.split_whitespace() {
            let Some(wid) = self.word_id(word) else {
                return false;
            };
            let mut next = Vec::new();
            for &s in &current {
                for links in self.trans[s as usize].values() {
                    for l in links {
                        if l.wid == wid && !next.contains(&l.to_state) {
                            next.push(l.to_state);
                        }
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            current = self.closure_of(&next);
        }
        current.contains(&self.final_state)
    }

    /// Read the text format (`FSG_BEGIN` .. `FSG_END`).
    pub fn from_reader(rdr: impl BufRead, lmath: Arc<LogMath>, lw: f32) -> Result<Self> {
        let mut name = String::new();
        let mut lines = Vec::new();
        let mut n_state: Option<usize> = None;
        let mut started = false;
        for line in rdr.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("FSG_BEGIN") => {
                    started = true;
                    name = parts.next().unwrap_or("").to_string();
                }
                Some("NUM_STATES" | "N") => {
                    n_state = Some(parts.next().and_then(|s| s.parse().ok()).ok_or_else(
                        || SttError::bad_format("fsg", "bad NUM_STATES declaration"),
                    )?);
                }
                Some("FSG_END") => break,
                Some(_) if !started => {
                    return Err(SttError::bad_format("fsg", "missing FSG_BEGIN"));
                }
                Some(_) => lines.push(line.to_string()),
                None => {}
            }
        }
        if !started {
            return Err(SttError::bad_format("fsg", "missing FSG_BEGIN"));
        }
        let n_state =
            n_state.ok_or_else(|| SttError::bad_format("fsg", "missing NUM_STATES"))?;
        let mut fsg = FsgModel::new(&name, lmath, lw, n_state);

        for line in lines {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts[0] {
                "START_STATE" | "S" => {
                    fsg.start_state = parse_state(&parts, 1, n_state)?;
                }
                "FINAL_STATE" | "F" => {
                    fsg.final_state = parse_state(&parts, 1, n_state)?;
                }
                "TRANSITION" | "T" => {
                    let from = parse_state(&parts, 1, n_state)?;
                    let to = parse_state(&parts, 2, n_state)?;
                    let prob: f64 = parts
                        .get(3)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| SttError::bad_format("fsg", "bad transition prob"))?;
                    if prob > 1.0 {
                        return Err(SttError::bad_format(
                            "fsg",
                            format!("transition probability {} > 1", prob),
                        ));
                    }
                    let logp = fsg.lmath.log(prob);
                    match parts.get(4) {
                        Some(word) => {
                            let wid = fsg.word_add(word);
                            let scaled = (logp as f32 * lw) as i32;
                            fsg.trans_add(from, to, scaled, wid);
                        }
                        None => {
                            fsg.null_trans_add(from, to, logp);
                        }
                    }
                }
                other => {
                    warn!("Unknown FSG directive: {}", other);
                }
            }
        }
        Ok(fsg)
    }

    pub fn write(&self, mut w: impl Write) -> Result<()> {
        writeln!(w, "FSG_BEGIN {}", self.name)?;
        writeln!(w, "NUM_STATES {}", self.n_state)?;
        writeln!(w, "START_STATE {}", self.start_state)?;
        writeln!(w, "FINAL_STATE {}", self.final_state)?;
        for from in 0..self.n_state as i32 {
            for link in self.arcs(from) {
                let prob = if link.is_epsilon() {
                    self.lmath.exp(link.logs2prob)
                } else {
                    self.lmath.exp((link.logs2prob as f32 / self.lw) as i32)
                };
                if link.is_epsilon() {
                    writeln!(w, "TRANSITION {} {} {:.6}", link.from_state, link.to_state, prob)?;
                } else {
                    writeln!(
                        w,
                        "TRANSITION {} {} {:.6} {}",
                        link.from_state,
                        link.to_state,
                        prob,
                        self.word_str(link.wid)
                    )?;
                }
            }
        }
        writeln!(w, "FSG_END")?;
        Ok(())
    }
}

fn parse_state(parts: &[&str], idx: usize, n_state: usize) -> Result<i32> {
    let s: i32 = parts
        .get(idx)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SttError::bad_format("fsg", "bad state number"))?;
    if s < 0 || s as usize >= n_state {
        return Err(SttError::bad_format(
            "fsg",
            format!("state {} out of range [0,{})", s, n_state),
        ));
    }
    Ok(s)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// The classic goforward grammar in text form.
    pub(crate) const GOFORWARD_FSG: &str = "\
# Command grammar
FSG_BEGIN goforward
NUM_STATES 6
START_STATE 0
FINAL_STATE 5
TRANSITION 0 1 1.0 GO
TRANSITION 1 2 1.0 FORWARD
TRANSITION 2 3 0.5 TEN
TRANSITION 2 3 0.5 SIX
TRANSITION 3 4 0.5 METERS
TRANSITION 3 4 0.5 METER
TRANSITION 4 5 1.0
FSG_END
";

    pub(crate) fn goforward() -> FsgModel {
        let mut fsg =
            FsgModel::from_reader(Cursor::new(GOFORWARD_FSG), LogMath::shared_default(), 7.5)
                .unwrap();
        fsg.null_trans_closure();
        fsg
    }

    #[test]
    fn accepts_and_rejects() {
        let fsg = goforward();
        assert_eq!(fsg.name(), "goforward");
        assert!(fsg.accept("GO FORWARD TEN METERS"));
        assert!(fsg.accept("GO FORWARD TEN METER"));
        assert!(fsg.accept("GO FORWARD SIX METER"));
        assert!(!fsg.accept("GO FORWARD TEN"));
        assert!(!fsg.accept("GO FORWARD YOURSELF"));
        assert!(!fsg.accept(""));
    }

    #[test]
    fn duplicate_transition_keeps_best() {
        let lmath = LogMath::shared_default();
        let mut fsg = FsgModel::new("t", lmath.clone(), 1.0, 2);
        let w = fsg.word_add("hello");
        fsg.trans_add(0, 1, lmath.log(0.25), w);
        fsg.trans_add(0, 1, lmath.log(0.5), w);
        fsg.trans_add(0, 1, lmath.log(0.125), w);
        let links = fsg.trans(0, 1);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].logs2prob, lmath.log(0.5));
    }

    #[test]
    fn null_closure_collapses_chains() {
        let lmath = LogMath::shared_default();
        let mut fsg = FsgModel::new("t", lmath.clone(), 1.0, 4);
        fsg.start_state = 0;
        fsg.final_state = 3;
        fsg.null_trans_add(0, 1, 0);
        fsg.null_trans_add(1, 2, 0);
        fsg.null_trans_add(2, 3, 0);
        fsg.null_trans_closure();
        assert!(fsg.null_trans(0, 3).is_some());
        assert!(fsg.null_trans(0, 2).is_some());
        assert!(fsg.accept(""));
    }

    #[test]
    fn silence_insertion() {
        let mut fsg = goforward();
        let n = fsg.add_silence("<sil>", None, 0.005);
        assert_eq!(n, 6);
        let sil = fsg.word_id("<sil>").unwrap();
        assert!(fsg.is_filler(sil));
        // A silence self loop exists at every state.
        for s in 0..fsg.n_state() as i32 {
            assert!(fsg.trans(s, s).iter().any(|l| l.wid == sil));
        }
    }

    #[test]
    fn alternate_pronunciations_mirror_links() {
        let mut fsg = goforward();
        let n = fsg.add_alt("METERS", "METERS(2)");
        assert_eq!(n, 1);
        assert!(fsg.accept("GO FORWARD TEN METERS(2)"));
        let alt = fsg.word_id("METERS(2)").unwrap();
        assert!(fsg.is_alt(alt));
    }

    #[test]
    fn write_round_trip() {
        let fsg = goforward();
        let mut text = Vec::new();
        fsg.write(&mut text).unwrap();
        let back = FsgModel::from_reader(
            Cursor::new(String::from_utf8(text).unwrap()),
            LogMath::shared_default(),
            7.5,
        )
        .unwrap();
        assert_eq!(back.n_state(), fsg.n_state());
        assert!(back.accept("GO FORWARD SIX METERS"));
        assert!(!back.accept("FORWARD GO"));
    }

    #[test]
    fn bad_files_are_rejected() {
        let r = FsgModel::from_reader(
            Cursor::new("TRANSITION 0 1 1.0 X\n"),
            LogMath::shared_default(),
            1.0,
        );
        assert!(matches!(r, Err(SttError::BadFormat { .. })));
        let r = FsgModel::from_reader(
            Cursor::new("FSG_BEGIN x\nNUM_STATES 2\nTRANSITION 0 5 1.0 X\nFSG_END\n"),
            LogMath::shared_default(),
            1.0,
        );
        assert!(matches!(r, Err(SttError::BadFormat { .. })));
    }
}
