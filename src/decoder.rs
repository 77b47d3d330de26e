//! The decoder proper: owns the loaded models, a named set of search
//! modules, and the per-utterance lifecycle. Feature frames go in one at a
//! time; hypotheses, segmentations, lattices and N-best lists come out, all
//! read-only against the active search's backpointer table.
use crate::acoustic::cont::ContMgau;
use crate::acoustic::semi::{ScorerParams, SemiMgau};
use crate::acoustic::tmat::Tmat;
use crate::acoustic::{AcousticScorer, Feature};
use crate::config::DecoderConfig;
use crate::dict::Dict;
use crate::error::{Result, SttError};
use crate::feat;
use crate::fsg::jsgf;
use crate::fsg::model::FsgModel;
use crate::lattice::Lattice;
use crate::lm::NgramModel;
use crate::logmath::LogMath;
use crate::mdef::BinMdef;
use crate::search::fsg_search::FsgSearch;
use crate::search::fwdtree::NgramSearch;
use crate::search::{Search, SegEntry};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_SEARCH: &str = "_default";

/// Utterance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UttState {
    Idle,
    Begun,
    Stopped,
    Ended,
}

impl UttState {
    fn name(self) -> &'static str {
        match self {
            UttState::Idle => "idle",
            UttState::Begun => "begun",
            UttState::Stopped => "stopped",
            UttState::Ended => "ended",
        }
    }
}

/// Concrete search modules behind one dispatch point.
pub enum AnySearch {
    Ngram(NgramSearch),
    Fsg(FsgSearch),
}

impl AnySearch {
    fn as_search(&mut self) -> &mut dyn Search {
        match self {
            AnySearch::Ngram(s) => s,
            AnySearch::Fsg(s) => s,
        }
    }

    fn as_search_ref(&self) -> &dyn Search {
        match self {
            AnySearch::Ngram(s) => s,
            AnySearch::Fsg(s) => s,
        }
    }

    pub fn lm(&self) -> Option<&NgramModel> {
        match self {
            AnySearch::Ngram(s) => Some(s.lm()),
            AnySearch::Fsg(_) => None,
        }
    }

    pub fn fsg(&self) -> Option<&FsgModel> {
        match self {
            AnySearch::Ngram(_) => None,
            AnySearch::Fsg(s) => Some(s.fsg()),
        }
    }
}

pub struct Decoder {
    config: DecoderConfig,
    lmath: Arc<LogMath>,
    mdef: Arc<BinMdef>,
    tmat: Arc<Tmat>,
    dict: Arc<Dict>,
    scorer: Box<dyn AcousticScorer>,
    searches: HashMap<String, AnySearch>,
    search_order: Vec<String>,
    active: Option<String>,
    state: UttState,
    frames: Vec<Feature>,
    buffered: Vec<Feature>,
    dict_dirty: bool,
    senscr: Vec<i32>,
    active_sen: Vec<i32>,
}

impl Decoder {
    /// Load everything named by the configuration from disk.
    pub fn new(config: DecoderConfig) -> Result<Self> {
        let lmath = Arc::new(LogMath::new(config.logbase));

        let mdef_path = config
            .model_file(&config.mdef, "mdef")
            .ok_or_else(|| SttError::bad_format("config", "no acoustic model directory"))?;
        info!("Reading model definition: {}", mdef_path.display());
        let mdef = Arc::new(BinMdef::read(BufReader::new(File::open(&mdef_path)?))?);

        let tmat_path = config
            .model_file(&config.tmat, "transition_matrices")
            .ok_or_else(|| SttError::bad_format("config", "no transition matrix file"))?;
        let tmat = Arc::new(Tmat::from_reader(
            BufReader::new(File::open(&tmat_path)?),
            config.tmatfloor,
            lmath.clone(),
        )?);

        let scorer = Self::load_scorer(&config, &mdef, lmath.clone())?;

        let dict_path = config
            .dict
            .clone()
            .ok_or_else(|| SttError::bad_format("config", "no dictionary"))?;
        let dict = Arc::new(Dict::load(
            &mdef,
            &dict_path,
            config.fdict.as_deref(),
            config.dictcase,
        )?);

        let mut decoder = Self::from_parts(config, lmath, mdef, tmat, dict, scorer);
        decoder.add_configured_searches()?;
        Ok(decoder)
    }

    /// Assemble a decoder from already-loaded pieces. Searches still need to
    /// be added.
    pub fn from_parts(
        config: DecoderConfig,
        lmath: Arc<LogMath>,
        mdef: Arc<BinMdef>,
        tmat: Arc<Tmat>,
        dict: Arc<Dict>,
        scorer: Box<dyn AcousticScorer>,
    ) -> Self {
        let n_sen = mdef.n_sen();
        Self {
            config,
            lmath,
            mdef,
            tmat,
            dict,
            scorer,
            searches: HashMap::new(),
            search_order: Vec::new(),
            active: None,
            state: UttState::Idle,
            frames: Vec::new(),
            buffered: Vec::new(),
            dict_dirty: false,
            senscr: vec![0; n_sen],
            active_sen: Vec::new(),
        }
    }

    fn load_scorer(
        config: &DecoderConfig,
        mdef: &BinMdef,
        lmath: Arc<LogMath>,
    ) -> Result<Box<dyn AcousticScorer>> {
        let mean = config
            .model_file(&config.mean, "means")
            .ok_or_else(|| SttError::bad_format("config", "no mean file"))?;
        let var = config
            .model_file(&config.var, "variances")
            .ok_or_else(|| SttError::bad_format("config", "no variance file"))?;
        // Semi-continuous models carry a single shared codebook; sniff the
        // header to pick the scorer family.
        let semi = {
            let mut s3 = crate::acoustic::S3Reader::open(
                BufReader::new(File::open(&mean)?),
                "mean",
            )?;
            s3.u32()? == 1
        };
        if semi {
            let params = ScorerParams {
                varfloor: config.varfloor,
                mixwfloor: config.mixwfloor,
                topn: config.topn,
                ds_ratio: config.ds,
            };
            let mut scorer = SemiMgau::from_gau_readers(
                BufReader::new(File::open(&mean)?),
                BufReader::new(File::open(&var)?),
                mdef.n_sen(),
                params,
                lmath,
            )?;
            let sendump = config.model_file(&config.sendump, "sendump");
            let mut loaded = false;
            if let Some(path) = &sendump {
                if path.is_file() {
                    #[cfg(feature = "mmap")]
                    if config.mmap {
                        match scorer.load_sendump_mmap(path) {
                            Ok(()) => loaded = true,
                            Err(e) => warn!("Falling back from mmap: {}", e),
                        }
                    }
                    if !loaded {
                        scorer.load_sendump(BufReader::new(File::open(path)?))?;
                        loaded = true;
                    }
                }
            }
            if !loaded {
                let mixw = config
                    .model_file(&config.mixw, "mixture_weights")
                    .ok_or_else(|| SttError::bad_format("config", "no mixture weights"))?;
                scorer.load_mixw_float(BufReader::new(File::open(&mixw)?), config.mixwfloor)?;
            }
            Ok(Box::new(scorer))
        } else {
            let mixw = config
                .model_file(&config.mixw, "mixture_weights")
                .ok_or_else(|| SttError::bad_format("config", "no mixture weights"))?;
            Ok(Box::new(ContMgau::from_readers(
                BufReader::new(File::open(&mean)?),
                BufReader::new(File::open(&var)?),
                BufReader::new(File::open(&mixw)?),
                config.varfloor,
                config.mixwfloor,
                lmath,
            )?))
        }
    }

    /// Default searches from the config: an FSG/JSGF wins over an LM.
    fn add_configured_searches(&mut self) -> Result<()> {
        if let Some(path) = self.config.fsg.clone() {
            let fsg = FsgModel::from_reader(
                BufReader::new(File::open(&path)?),
                self.lmath.clone(),
                self.config.lw,
            )?;
            self.add_fsg(DEFAULT_SEARCH, fsg)?;
            self.activate_search(DEFAULT_SEARCH)?;
        } else if let Some(path) = self.config.jsgf.clone() {
            let fsg = jsgf::read_file(
                &path,
                self.lmath.clone(),
                self.config.lw,
                self.config.toprule.as_deref(),
            )?;
            self.add_fsg(DEFAULT_SEARCH, fsg)?;
            self.activate_search(DEFAULT_SEARCH)?;
        } else if let Some(path) = self.config.lm.clone() {
            let lm = NgramModel::read(&path, self.lmath.clone())?;
            self.add_lm(DEFAULT_SEARCH, lm)?;
            self.activate_search(DEFAULT_SEARCH)?;
        } else if let Some(path) = self.config.lmctl.clone() {
            self.add_lmctl_file(&path)?;
            if let Some(name) = self.config.lmname.clone() {
                self.activate_search(&name)?;
            }
        }
        Ok(())
    }

    fn check_idle(&self, op: &'static str) -> Result<()> {
        if self.state == UttState::Begun || self.state == UttState::Stopped {
            return Err(SttError::BadState {
                state: self.state.name(),
                op,
            });
        }
        Ok(())
    }

    pub fn state(&self) -> UttState {
        self.state
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn logmath(&self) -> &Arc<LogMath> {
        &self.lmath
    }

    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    // --- Search set management -------------------------------------------

    fn insert_search(&mut self, name: &str, search: AnySearch) {
        if self.searches.insert(name.to_string(), search).is_some() {
            warn!("Replacing search {}", name);
            self.search_order.retain(|n| n != name);
        }
        self.search_order.push(name.to_string());
    }

    pub fn add_lm(&mut self, name: &str, lm: NgramModel) -> Result<()> {
        self.check_idle("add_lm")?;
        let search = NgramSearch::new(
            self.mdef.clone(),
            self.tmat.clone(),
            self.dict.clone(),
            lm,
            self.lmath.clone(),
            &self.config,
        )?;
        self.insert_search(name, AnySearch::Ngram(search));
        Ok(())
    }

    pub fn add_lm_file(&mut self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        let lm = NgramModel::read(path, self.lmath.clone())?;
        self.add_lm(name, lm)
    }

    /// Multi-LM control file: one `name path` pair per line.
    pub fn add_lmctl_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let base = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(file)) = (parts.next(), parts.next()) else {
                return Err(SttError::bad_format("lmctl", format!("bad line: {}", line)));
            };
            let lm_path = base.join(file);
            self.add_lm_file(name, &lm_path)?;
        }
        Ok(())
    }

    pub fn add_fsg(&mut self, name: &str, fsg: FsgModel) -> Result<()> {
        self.check_idle("add_fsg")?;
        let search = FsgSearch::new(
            self.mdef.clone(),
            self.tmat.clone(),
            self.dict.clone(),
            fsg,
            self.lmath.clone(),
            &self.config,
        )?;
        self.insert_search(name, AnySearch::Fsg(search));
        Ok(())
    }

    pub fn add_fsg_file(&mut self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        let fsg = FsgModel::from_reader(
            BufReader::new(File::open(path.as_ref())?),
            self.lmath.clone(),
            self.config.lw,
        )?;
        self.add_fsg(name, fsg)
    }

    pub fn add_jsgf_file(&mut self, name: &str, path: impl AsRef<Path>) -> Result<()> {
        let fsg = jsgf::read_file(
            path,
            self.lmath.clone(),
            self.config.lw,
            self.config.toprule.as_deref(),
        )?;
        self.add_fsg(name, fsg)
    }

    pub fn add_jsgf_string(&mut self, name: &str, text: &str) -> Result<()> {
        let fsg = jsgf::read_string(
            text,
            self.lmath.clone(),
            self.config.lw,
            self.config.toprule.as_deref(),
        )?;
        self.add_fsg(name, fsg)
    }

    pub fn remove_search(&mut self, name: &str) -> Result<()> {
        self.check_idle("remove_search")?;
        if self.searches.remove(name).is_none() {
            return Err(SttError::UnknownSymbol(format!("search {}", name)));
        }
        self.search_order.retain(|n| n != name);
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        Ok(())
    }

    /// Make a search current; takes effect at the next `start_utt`.
    pub fn activate_search(&mut self, name: &str) -> Result<()> {
        self.check_idle("activate_search")?;
        if !self.searches.contains_key(name) {
            return Err(SttError::UnknownSymbol(format!("search {}", name)));
        }
        self.active = Some(name.to_string());
        Ok(())
    }

    pub fn current_search(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Names in insertion order.
    pub fn search_names(&self) -> impl Iterator<Item = &str> {
        self.search_order.iter().map(|s| s.as_str())
    }

    pub fn get_search(&self, name: &str) -> Option<&AnySearch> {
        self.searches.get(name)
    }

    fn active_search(&mut self) -> Result<&mut AnySearch> {
        let name = self.active.clone().ok_or(SttError::BadState {
            state: "idle",
            op: "no search has been activated",
        })?;
        Ok(self.searches.get_mut(&name).expect("active search exists"))
    }

    // --- Dictionary updates ----------------------------------------------

    /// Add a word to the dictionary (and the LM of every N-gram search so it
    /// can be recognized). Takes effect at the next utterance start.
    pub fn add_word(&mut self, word: &str, phones: &str) -> Result<i32> {
        self.check_idle("add_word")?;
        let mut dict = (*self.dict).clone();
        let wid = dict.add_word(&self.mdef, word, phones)?;
        self.dict = Arc::new(dict);
        let uw_log = self.config.uw.max(f32::MIN_POSITIVE).ln();
        for search in self.searches.values_mut() {
            if let AnySearch::Ngram(s) = search {
                s.add_lm_word(word, uw_log);
            }
        }
        self.dict_dirty = true;
        Ok(wid)
    }

    pub fn lookup_word(&self, word: &str) -> Option<String> {
        let wid = self.dict.word_id(word)?;
        let phones: Vec<&str> = self
            .dict
            .pronunciation(wid)
            .iter()
            .map(|&p| self.mdef.ciphone_str(p))
            .collect();
        Some(phones.join(" "))
    }

    // --- Utterance lifecycle ---------------------------------------------

    pub fn start_utt(&mut self) -> Result<()> {
        self.check_idle("start_utt")?;
        if self.active.is_none() {
            return Err(SttError::BadState {
                state: self.state.name(),
                op: "start_utt without an active search",
            });
        }
        if self.dict_dirty {
            let dict = self.dict.clone();
            for search in self.searches.values_mut() {
                search.as_search().reinit(dict.clone())?;
            }
            self.dict_dirty = false;
        }
        self.frames.clear();
        self.buffered.clear();
        self.scorer.begin_utt();
        self.active_search()?.as_search().begin()?;
        self.state = UttState::Begun;
        Ok(())
    }

    /// Feed one feature frame. Frames arriving while stopped are buffered
    /// and scored on resume.
    pub fn process_frame(&mut self, feat: &Feature) -> Result<()> {
        match self.state {
            UttState::Stopped => {
                self.buffered.push(feat.clone());
                return Ok(());
            }
            UttState::Begun => {}
            other => {
                return Err(SttError::BadState {
                    state: other.name(),
                    op: "process_frame",
                })
            }
        }
        let frame = self.frames.len() as i32;
        let compallsen = self.config.compallsen;

        let mut active_sen = std::mem::take(&mut self.active_sen);
        let mut senscr = std::mem::take(&mut self.senscr);
        active_sen.clear();
        {
            let search = self.active_search()?;
            search.as_search_ref().active_senones(&mut active_sen);
        }
        active_sen.sort_unstable();
        active_sen.dedup();
        let active = if compallsen || active_sen.is_empty() {
            None
        } else {
            Some(active_sen.as_slice())
        };
        self.scorer.frame_eval(feat, frame, active, &mut senscr)?;
        let result = self.active_search()?.as_search().step(frame, &senscr);
        self.active_sen = active_sen;
        self.senscr = senscr;
        result?;
        self.frames.push(feat.clone());
        Ok(())
    }

    pub fn process_frames(&mut self, feats: &[Feature]) -> Result<usize> {
        for f in feats {
            self.process_frame(f)?;
        }
        Ok(feats.len())
    }

    /// Pause scoring; subsequent frames are buffered until `resume_utt`.
    pub fn stop_utt(&mut self) -> Result<()> {
        if self.state != UttState::Begun {
            return Err(SttError::BadState {
                state: self.state.name(),
                op: "stop_utt",
            });
        }
        self.state = UttState::Stopped;
        Ok(())
    }

    pub fn resume_utt(&mut self) -> Result<()> {
        if self.state != UttState::Stopped {
            return Err(SttError::BadState {
                state: self.state.name(),
                op: "resume_utt",
            });
        }
        self.state = UttState::Begun;
        let pending = std::mem::take(&mut self.buffered);
        for f in &pending {
            self.process_frame(f)?;
        }
        Ok(())
    }

    pub fn end_utt(&mut self) -> Result<()> {
        if self.state != UttState::Begun && self.state != UttState::Stopped {
            return Err(SttError::BadState {
                state: self.state.name(),
                op: "end_utt",
            });
        }
        if self.state == UttState::Stopped && !self.buffered.is_empty() {
            self.resume_utt()?;
        }
        let frames = std::mem::take(&mut self.frames);
        let scorer = &mut *self.scorer;
        let name = self.active.clone().expect("utterance without search");
        let search = self.searches.get_mut(&name).expect("active search exists");
        let result = search.as_search().end(scorer, &frames);
        self.frames = frames;
        // Ended behaves like idle for the next start; results stay readable.
        self.state = UttState::Ended;
        result
    }

    /// Truncate to the frames already processed and finalize.
    pub fn abort_utt(&mut self) -> Result<()> {
        self.buffered.clear();
        if self.state == UttState::Stopped {
            self.state = UttState::Begun;
        }
        self.end_utt()
    }

    pub fn n_frames(&self) -> i32 {
        self.frames.len() as i32
    }

    // --- Results ---------------------------------------------------------

    pub fn hyp(&self) -> Option<(String, i32)> {
        let name = self.active.as_deref()?;
        self.searches.get(name)?.as_search_ref().hyp()
    }

    pub fn seg(&self) -> Vec<SegEntry> {
        self.active
            .as_deref()
            .and_then(|n| self.searches.get(n))
            .map(|s| s.as_search_ref().seg())
            .unwrap_or_default()
    }

    pub fn lattice(&self) -> Option<&Lattice> {
        self.searches
            .get(self.active.as_deref()?)?
            .as_search_ref()
            .lattice()
    }

    pub fn nbest(&self, n: usize) -> Vec<(String, i32)> {
        self.active
            .as_deref()
            .and_then(|name| self.searches.get(name))
            .map(|s| s.as_search_ref().nbest(n))
            .unwrap_or_default()
    }

    /// Canonical hypseg line: utterance id, total/acoustic/language scores
    /// and per-word `word sf ef ascr lscr` fields.
    pub fn write_hypseg(&self, mut w: impl Write, uttid: &str) -> Result<()> {
        let seg = self.seg();
        let total: i32 = seg.iter().map(|s| s.ascr + s.lscr).sum();
        let ascr: i32 = seg.iter().map(|s| s.ascr).sum();
        let lscr: i32 = seg.iter().map(|s| s.lscr).sum();
        write!(w, "{} S 0 T {} A {} L {}", uttid, total, ascr, lscr)?;
        for s in &seg {
            write!(w, " {} {} {} {} {}", s.sf, s.ef, s.ascr, s.lscr, s.word)?;
        }
        writeln!(w)?;
        Ok(())
    }

    /// CTM lines at the given frame rate, hidden words skipped.
    pub fn write_ctm(&self, mut w: impl Write, uttid: &str, frate: f32) -> Result<()> {
        for s in self.seg() {
            if self.dict.is_hidden(s.wid) {
                continue;
            }
            writeln!(
                w,
                "{} 1 {:.2} {:.2} {}",
                uttid,
                s.sf as f32 / frate,
                (s.ef - s.sf + 1) as f32 / frate,
                s.word
            )?;
        }
        Ok(())
    }

    pub fn write_lattice(&self, w: impl Write) -> Result<()> {
        let Some(lat) = self.lattice() else {
            return Err(SttError::BadState {
                state: self.state.name(),
                op: "no lattice available",
            });
        };
        let dict = self.dict.clone();
        lat.write(w, move |wid| dict.word_str(wid).to_string())
    }

    /// Decode a whole feature file in one go and return the hypothesis.
    pub fn decode_feat_file(&mut self, path: impl AsRef<Path>) -> Result<Option<(String, i32)>> {
        let path = path.as_ref();
        let frames = match path.extension().and_then(|e| e.to_str()) {
            Some("mfc") => feat::read_mfc(
                BufReader::new(File::open(path)?),
                self.config.ceplen,
            )?,
            _ => feat::read_feat(BufReader::new(File::open(path)?))?,
        };
        self.start_utt()?;
        self.process_frames(&frames)?;
        self.end_utt()?;
        Ok(self.hyp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::Feature;
    use crate::error::Result as SttResult;
    use crate::mdef::MdefBuilder;
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

    /// Scorer keyed on the frame's first feature value: it names the phone
    /// whose senones win this frame.
    struct PhonePlanScorer {
        n_sen: usize,
    }

    impl AcousticScorer for PhonePlanScorer {
        fn n_senones(&self) -> usize {
            self.n_sen
        }

        fn frame_eval(
            &mut self,
            feat: &Feature,
            _frame_idx: i32,
            _active: Option<&[i32]>,
            scores: &mut [i32],
        ) -> SttResult<()> {
            let phone = feat.streams[0][0] as usize;
            for s in 0..self.n_sen {
                scores[s] = if s / 3 == phone { -100 } else { -60_000 };
            }
            Ok(())
        }
    }

    fn phone_frame(phone: i32) -> Feature {
        Feature::single(vec![phone as f32])
    }

    fn decoder() -> Decoder {
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
        let n_sen = mdef.n_sen();
        let config = DecoderConfig {
            fwdflat: false,
            bestpath: false,
            ..Default::default()
        };
        Decoder::from_parts(
            config,
            lmath,
            mdef,
            tmat,
            dict,
            Box::new(PhonePlanScorer { n_sen }),
        )
    }

    fn lm() -> NgramModel {
        NgramModel::read_arpa(Cursor::new(TEST_ARPA), LogMath::shared_default()).unwrap()
    }

    // Phones: AH=0, F=1, R=2 per the sorted CI order.
    const FAR_FRAMES: [i32; 6] = [1, 1, 0, 0, 2, 2];
    const RAH_FRAMES: [i32; 4] = [2, 2, 0, 0];

    fn run_utt(d: &mut Decoder, phones: &[i32]) -> (String, i32) {
        d.start_utt().unwrap();
        for &p in phones {
            d.process_frame(&phone_frame(p)).unwrap();
        }
        d.end_utt().unwrap();
        d.hyp().unwrap()
    }

    #[test]
    fn no_search_is_an_error() {
        let mut d = decoder();
        assert!(matches!(d.start_utt(), Err(SttError::BadState { .. })));
    }

    #[test]
    fn lm_decode_end_to_end() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        let (hyp, _) = run_utt(&mut d, &FAR_FRAMES);
        assert_eq!(hyp, "FAR");
        // Segmentation covers the utterance in order.
        let seg = d.seg();
        assert!(!seg.is_empty());
        assert!(seg.windows(2).all(|w| w[0].ef < w[1].sf + 1));
    }

    #[test]
    fn search_set_switching_across_utterances() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        let lmath = d.logmath().clone();
        let mut fsg = FsgModel::new("only-rah", lmath.clone(), 7.5, 2);
        fsg.start_state = 0;
        fsg.final_state = 1;
        let rah = fsg.word_add("RAH");
        fsg.trans_add(0, 1, lmath.log(1.0), rah);
        d.add_fsg("grammar", fsg).unwrap();

        d.activate_search("lm").unwrap();
        assert_eq!(d.current_search(), Some("lm"));
        let (hyp, _) = run_utt(&mut d, &FAR_FRAMES);
        assert_eq!(hyp, "FAR");

        d.activate_search("grammar").unwrap();
        let (hyp, _) = run_utt(&mut d, &RAH_FRAMES);
        assert_eq!(hyp, "RAH");

        // And back again: each utterance decodes under the search that was
        // active at its start.
        d.activate_search("lm").unwrap();
        let (hyp, _) = run_utt(&mut d, &FAR_FRAMES);
        assert_eq!(hyp, "FAR");
        let names: Vec<&str> = d.search_names().collect();
        assert_eq!(names, vec!["lm", "grammar"]);
    }

    #[test]
    fn state_machine_is_enforced() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        assert!(matches!(d.end_utt(), Err(SttError::BadState { .. })));
        d.start_utt().unwrap();
        assert!(matches!(d.start_utt(), Err(SttError::BadState { .. })));
        assert!(matches!(
            d.activate_search("lm"),
            Err(SttError::BadState { .. })
        ));
        assert!(matches!(d.add_word("X", "AH"), Err(SttError::BadState { .. })));
        d.end_utt().unwrap();
        assert_eq!(d.state(), UttState::Ended);
        // And a new utterance can begin from here.
        d.start_utt().unwrap();
        d.end_utt().unwrap();
    }

    #[test]
    fn stop_buffers_frames_until_resume() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        d.start_utt().unwrap();
        d.process_frame(&phone_frame(1)).unwrap();
        d.process_frame(&phone_frame(1)).unwrap();
        d.stop_utt().unwrap();
        for &p in &[0, 0, 2, 2] {
            d.process_frame(&phone_frame(p)).unwrap();
        }
        // Nothing scored while stopped.
        assert_eq!(d.n_frames(), 2);
        d.resume_utt().unwrap();
        assert_eq!(d.n_frames(), 6);
        d.end_utt().unwrap();
        assert_eq!(d.hyp().unwrap().0, "FAR");
    }

    #[test]
    fn abort_finalizes_the_prefix() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        d.start_utt().unwrap();
        for &p in &RAH_FRAMES {
            d.process_frame(&phone_frame(p)).unwrap();
        }
        d.stop_utt().unwrap();
        d.process_frame(&phone_frame(1)).unwrap();
        d.abort_utt().unwrap();
        assert_eq!(d.state(), UttState::Ended);
        // The buffered frame was discarded; the prefix still decodes.
        assert_eq!(d.n_frames(), 4);
        assert_eq!(d.hyp().unwrap().0, "RAH");
    }

    #[test]
    fn add_word_takes_effect_next_utterance() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        assert_eq!(d.lookup_word("RAF"), None);
        d.add_word("RAF", "R AH F").unwrap();
        assert_eq!(d.lookup_word("RAF"), Some("R AH F".to_string()));
        // R AH F frames decode to the new word.
        let (hyp, _) = run_utt(&mut d, &[2, 2, 0, 0, 1, 1]);
        assert_eq!(hyp, "RAF");
    }

    #[test]
    fn remove_search_clears_current() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        d.remove_search("lm").unwrap();
        assert_eq!(d.current_search(), None);
        assert!(matches!(
            d.remove_search("lm"),
            Err(SttError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn all_passes_pipeline() {
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
        let n_sen = mdef.n_sen();
        // Flat rescoring and bestpath enabled (the defaults).
        let config = DecoderConfig::default();
        let mut d = Decoder::from_parts(
            config,
            lmath,
            mdef,
            tmat,
            dict,
            Box::new(PhonePlanScorer { n_sen }),
        );
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        // A long tail of R frames lets FAR persist enough end frames for
        // the flat pass to pick it up.
        let (hyp, _) = run_utt(&mut d, &[1, 1, 0, 0, 2, 2, 2, 2, 2]);
        assert_eq!(hyp, "FAR");
        assert!(d.lattice().is_some());
        let nbest = d.nbest(3);
        assert!(!nbest.is_empty());
        assert_eq!(nbest[0].0, "FAR");
    }

    #[test]
    fn hypseg_and_ctm_render() {
        let mut d = decoder();
        d.add_lm("lm", lm()).unwrap();
        d.activate_search("lm").unwrap();
        run_utt(&mut d, &FAR_FRAMES);
        let mut hypseg = Vec::new();
        d.write_hypseg(&mut hypseg, "utt1").unwrap();
        let text = String::from_utf8(hypseg).unwrap();
        assert!(text.starts_with("utt1 S 0 T "));
        assert!(text.contains("FAR"));
        let mut ctm = Vec::new();
        d.write_ctm(&mut ctm, "utt1", 100.0).unwrap();
        let text = String::from_utf8(ctm).unwrap();
        assert!(text.contains("utt1 1 "));
        assert!(text.contains(" FAR"));
    }
}
