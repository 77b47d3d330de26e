//! The pronunciation lexicon. Maps word strings to phone-id sequences,
//! groups alternate pronunciations under a shared base form (`WORD(2)` style
//! entries), and tracks which words are fillers. Words can be added at
//! runtime; they are appended and take effect the next time the search
//! structures are rebuilt at utterance start.
use crate::error::{Result, SttError};
use crate::mdef::BinMdef;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{error, info, warn};

/// Matches alternate pronunciation entries such as `READ(2)`.
static ALT_PRON: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)\((\d+)\)$").unwrap());

pub const NO_WORD: i32 = -1;

/// Reserved word strings every dictionary carries.
pub const START_WORD: &str = "<s>";
pub const END_WORD: &str = "</s>";
pub const SILENCE_WORD: &str = "<sil>";

#[derive(Debug, Clone)]
pub struct DictWord {
    pub name: String,
    /// First pronunciation variant of the same surface form.
    pub base_id: i32,
    /// Next alternate pronunciation of the same base, or `NO_WORD`.
    pub alt_id: i32,
    pub pronunciation: Vec<i32>,
    pub filler: bool,
}

#[derive(Debug, Default, Clone)]
pub struct Dict {
    words: Vec<DictWord>,
    by_name: HashMap<String, i32>,
}

impl Dict {
    /// Load the main and (optionally) filler dictionaries. The fillers are
    /// the silence/noise words that every search can insert between real
    /// words. If no filler dictionary is given, `<sil>`, `<s>` and `</s>` are
    /// synthesized over the silence phone.
    pub fn load(
        mdef: &BinMdef,
        dict: impl AsRef<Path>,
        fdict: Option<&Path>,
        case_fold: bool,
    ) -> Result<Self> {
        let mut d = Dict::default();
        d.read_from(mdef, BufReader::new(File::open(dict)?), false, case_fold)?;
        match fdict {
            Some(path) => {
                d.read_from(mdef, BufReader::new(File::open(path)?), true, case_fold)?;
            }
            None => d.add_default_fillers(mdef)?,
        }
        info!("Dictionary holds {} words", d.len());
        Ok(d)
    }

    pub fn from_reader(
        mdef: &BinMdef,
        rdr: impl BufRead,
        filler_rdr: Option<impl BufRead>,
        case_fold: bool,
    ) -> Result<Self> {
        let mut d = Dict::default();
        d.read_from(mdef, rdr, false, case_fold)?;
        match filler_rdr {
            Some(rdr) => d.read_from(mdef, rdr, true, case_fold)?,
            None => d.add_default_fillers(mdef)?,
        }
        Ok(d)
    }

    fn add_default_fillers(&mut self, mdef: &BinMdef) -> Result<()> {
        let sil = mdef.silence_ciphone();
        if sil < 0 {
            warn!("Model has no silence phone, skipping default fillers");
            return Ok(());
        }
        for w in [SILENCE_WORD, START_WORD, END_WORD] {
            if self.word_id(w).is_none() {
                self.push_word(w.to_string(), vec![sil], true);
            }
        }
        Ok(())
    }

    fn read_from(
        &mut self,
        mdef: &BinMdef,
        rdr: impl BufRead,
        filler: bool,
        case_fold: bool,
    ) -> Result<()> {
        'outer: for (lineno, line) in rdr.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(";;") || line.starts_with("##") {
                continue;
            }
            let mut parts = line.split_ascii_whitespace();
            let raw_name = match parts.next() {
                Some(s) => s,
                None => continue,
            };
            // `WORD(2)` is an alternate pronunciation of `WORD`; the suffix
            // is only a marker and never part of the stored name.
            let name = match ALT_PRON.captures(raw_name) {
                Some(caps) => caps.get(1).unwrap().as_str(),
                None => raw_name,
            };
            let name = if case_fold {
                name.to_ascii_uppercase()
            } else {
                name.to_string()
            };

            let mut pron = Vec::new();
            for phone in parts {
                match mdef.ciphone_id(phone) {
                    Some(id) => pron.push(id),
                    None => {
                        error!(
                            "Line {}: phone {} not in model, skipping word {}",
                            lineno + 1,
                            phone,
                            name
                        );
                        continue 'outer;
                    }
                }
            }
            if pron.is_empty() {
                warn!("Line {}: no pronunciation for {}", lineno + 1, name);
                continue;
            }
            self.push_word(name, pron, filler);
        }
        Ok(())
    }

    /// Append a word, chaining it into its base form's alternate list.
    fn push_word(&mut self, name: String, pronunciation: Vec<i32>, filler: bool) -> i32 {
        let id = self.words.len() as i32;
        let base_id = match self.by_name.get(&name) {
            Some(&base) => {
                // Walk to the end of the alt chain.
                let mut at = base;
                while self.words[at as usize].alt_id != NO_WORD {
                    at = self.words[at as usize].alt_id;
                }
                self.words[at as usize].alt_id = id;
                base
            }
            None => {
                self.by_name.insert(name.clone(), id);
                id
            }
        };
        self.words.push(DictWord {
            name,
            base_id,
            alt_id: NO_WORD,
            pronunciation,
            filler,
        });
        id
    }

    /// Runtime word addition. Phones that the model doesn't know are an
    /// error; the dictionary is unchanged in that case.
    pub fn add_word(&mut self, mdef: &BinMdef, name: &str, phones: &str) -> Result<i32> {
        let mut pron = Vec::new();
        for p in phones.split_ascii_whitespace() {
            pron.push(
                mdef.ciphone_id(p)
                    .ok_or_else(|| SttError::UnknownSymbol(p.to_string()))?,
            );
        }
        if pron.is_empty() {
            return Err(SttError::UnknownSymbol(format!(
                "empty pronunciation for {}",
                name
            )));
        }
        Ok(self.push_word(name.to_string(), pron, false))
    }

    /// Merge another dictionary in, typically custom user words layered on
    /// top of the main lexicon so their provenance stays separate. Entries
    /// duplicating an existing pronunciation of the same word are skipped;
    /// anything else is appended, new pronunciations chaining onto their
    /// base form. Both sides carry already-normalized names, so whatever
    /// case folding they were built with is preserved.
    pub fn merge(&mut self, other: Dict) {
        for word in other.words {
            let duplicate = self.word_id(&word.name).is_some_and(|base| {
                self.alts(base)
                    .any(|alt| self.words[alt as usize].pronunciation == word.pronunciation)
            });
            if !duplicate {
                self.push_word(word.name, word.pronunciation, word.filler);
            }
        }
    }

    pub fn word_id(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub fn word(&self, id: i32) -> &DictWord {
        &self.words[id as usize]
    }

    pub fn word_str(&self, id: i32) -> &str {
        &self.words[id as usize].name
    }

    pub fn base_id(&self, id: i32) -> i32 {
        self.words[id as usize].base_id
    }

    pub fn pronunciation(&self, id: i32) -> &[i32] {
        &self.words[id as usize].pronunciation
    }

    pub fn is_filler(&self, id: i32) -> bool {
        self.words[id as usize].filler
    }

    /// `<s>`/`</s>`/`<sil>` and noise words never appear in output text.
    pub fn is_hidden(&self, id: i32) -> bool {
        let w = &self.words[id as usize];
        w.filler || w.name == START_WORD || w.name == END_WORD
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &DictWord)> {
        self.words.iter().enumerate().map(|(i, w)| (i as i32, w))
    }

    /// Every pronunciation variant of a base word, starting at the base.
    pub fn alts(&self, base: i32) -> AltIter<'_> {
        AltIter {
            dict: self,
            at: self.words[base as usize].base_id,
        }
    }

    /// Write the dictionary back out in text form.
    pub fn write(&self, mdef: &BinMdef, mut w: impl io::Write) -> Result<()> {
        let mut nth: HashMap<i32, usize> = HashMap::new();
        for word in &self.words {
            let n = nth.entry(word.base_id).or_insert(0);
            *n += 1;
            if *n == 1 {
                write!(w, "{}", word.name)?;
            } else {
                write!(w, "{}({})", word.name, n)?;
            }
            for &p in &word.pronunciation {
                write!(w, " {}", mdef.ciphone_str(p))?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

pub struct AltIter<'a> {
    dict: &'a Dict,
    at: i32,
}

impl<'a> Iterator for AltIter<'a> {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        if self.at == NO_WORD {
            return None;
        }
        let out = self.at;
        self.at = self.dict.words[out as usize].alt_id;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdef::tests::tiny_mdef;
    use std::io::Cursor;

    fn dict_from(main: &str, fillers: Option<&str>) -> Dict {
        let mdef = tiny_mdef();
        Dict::from_reader(
            &mdef,
            Cursor::new(main.to_string()),
            fillers.map(|f| Cursor::new(f.to_string())),
            false,
        )
        .unwrap()
    }

    #[test]
    fn basic_lookup() {
        let d = dict_from(";; comment\nFAR  F AH R\nRAH  R AH\n", None);
        let far = d.word_id("FAR").unwrap();
        assert_eq!(d.pronunciation(far), &[1, 0, 2]);
        assert_eq!(d.word_str(far), "FAR");
        assert!(!d.is_filler(far));
        assert_eq!(d.word_id("NOPE"), None);
        // Default fillers were synthesized.
        let sil = d.word_id("<sil>").unwrap();
        assert!(d.is_filler(sil));
        assert_eq!(d.pronunciation(sil), &[3]);
    }

    #[test]
    fn alternate_pronunciations_share_base() {
        let d = dict_from("FAR  F AH R\nFAR(2)  F R\n", None);
        let base = d.word_id("FAR").unwrap();
        let alts: Vec<i32> = d.alts(base).collect();
        assert_eq!(alts.len(), 2);
        assert_eq!(d.base_id(alts[1]), base);
        assert_eq!(d.word_str(alts[1]), "FAR");
        assert_eq!(d.pronunciation(alts[1]), &[1, 2]);
    }

    #[test]
    fn unknown_phone_skips_entry() {
        let d = dict_from("GOOD  F AH\nBAD  F ZZ\n", None);
        assert!(d.word_id("GOOD").is_some());
        assert_eq!(d.word_id("BAD"), None);
    }

    #[test]
    fn filler_dictionary() {
        let d = dict_from("FAR  F AH R\n", Some("<sil>  SIL\n++NOISE++  SIL\n"));
        assert!(d.is_filler(d.word_id("++NOISE++").unwrap()));
        assert!(d.is_hidden(d.word_id("<sil>").unwrap()));
        assert!(!d.is_hidden(d.word_id("FAR").unwrap()));
    }

    #[test]
    fn runtime_add_word() {
        let mdef = tiny_mdef();
        let mut d = dict_from("FAR  F AH R\n", None);
        let id = d.add_word(&mdef, "RAFF", "R AH F F").unwrap();
        assert_eq!(d.word_id("RAFF"), Some(id));
        assert_eq!(d.base_id(id), id);
        assert!(matches!(
            d.add_word(&mdef, "XYZ", "Q Q"),
            Err(SttError::UnknownSymbol(_))
        ));
        // A second variant chains onto the existing base.
        let alt = d.add_word(&mdef, "FAR", "F AH").unwrap();
        assert_eq!(d.base_id(alt), d.word_id("FAR").unwrap());
    }

    #[test]
    fn dictionary_merge() {
        let mut base = dict_from("FAR  F AH R\nRAH  R AH\n", None);
        let to_merge = dict_from("FAR  F AH R\nFAR(2)  F R\nRAF  R AH F\n", None);

        let n_base = base.len();
        assert_eq!(base.alts(base.word_id("FAR").unwrap()).count(), 1);
        assert_eq!(base.word_id("RAF"), None);

        base.merge(to_merge);
        // The duplicate FAR pronunciation (and the shared fillers) are
        // skipped; the alternate and the new word come in.
        assert_eq!(base.len(), n_base + 2);
        let far = base.word_id("FAR").unwrap();
        let alts: Vec<i32> = base.alts(far).collect();
        assert_eq!(alts.len(), 2);
        assert_eq!(base.pronunciation(alts[1]), &[1, 2]);
        let raf = base.word_id("RAF").unwrap();
        assert_eq!(base.pronunciation(raf), &[2, 0, 1]);
        assert_eq!(base.base_id(raf), raf);
        // RAH was identical on both sides.
        assert_eq!(base.alts(base.word_id("RAH").unwrap()).count(), 1);
    }

    #[test]
    fn case_folding() {
        let mdef = tiny_mdef();
        let d = Dict::from_reader(
            &mdef,
            Cursor::new("far  F AH R\n".to_string()),
            None::<Cursor<String>>,
            true,
        )
        .unwrap();
        assert!(d.word_id("FAR").is_some());
    }

    #[test]
    fn write_round_trip() {
        let mdef = tiny_mdef();
        let d = dict_from("FAR  F AH R\nFAR(2)  F R\nRAH  R AH\n", None);
        let mut out = Vec::new();
        d.write(&mdef, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("FAR F AH R"));
        assert!(text.contains("FAR(2) F R"));
    }
}
