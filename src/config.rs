//! Typed decoder configuration. One field per recognized option with the
//! stock defaults; unknown keys simply don't exist. Beams are linear
//! probabilities here and converted into integer log thresholds where they
//! are used. The whole bag serializes, so a config can live in a JSON file
//! next to the models.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    // Acoustic model.
    /// Acoustic model directory; individual file options override the
    /// conventional names inside it.
    pub hmm: Option<PathBuf>,
    pub mdef: Option<PathBuf>,
    pub mean: Option<PathBuf>,
    pub var: Option<PathBuf>,
    pub mixw: Option<PathBuf>,
    pub tmat: Option<PathBuf>,
    pub sendump: Option<PathBuf>,
    /// Feature stream layout specifier.
    pub feat: String,
    pub ceplen: usize,
    pub varfloor: f32,
    pub mixwfloor: f32,
    pub tmatfloor: f32,
    pub mmap: bool,
    pub topn: usize,
    /// Frame downsampling ratio for the codebook sweep.
    pub ds: usize,
    pub logbase: f64,

    // Beams.
    pub beam: f64,
    pub wbeam: f64,
    pub pbeam: f64,
    pub lpbeam: f64,
    pub lponlybeam: f64,
    pub fwdflatbeam: f64,
    pub fwdflatwbeam: f64,
    pub pl_beam: f64,
    pub pl_pbeam: f64,
    pub pl_window: usize,
    pub pl_weight: f32,

    // Search enables and caps.
    pub fwdtree: bool,
    pub fwdflat: bool,
    pub bestpath: bool,
    pub compallsen: bool,
    pub maxhmmpf: i32,
    pub maxwpf: i32,
    pub latsize: usize,
    /// Posterior beam for pruning lattice edges after the bestpath pass.
    pub outlatbeam: f64,

    // Language model.
    pub lm: Option<PathBuf>,
    pub lmctl: Option<PathBuf>,
    pub lmname: Option<String>,
    pub lw: f32,
    pub fwdflatlw: f32,
    pub bestpathlw: f32,
    pub wip: f32,
    pub silprob: f32,
    pub fillprob: f32,
    /// Unigram interpolation weight.
    pub uw: f32,

    // Grammar.
    pub fsg: Option<PathBuf>,
    pub jsgf: Option<PathBuf>,
    pub toprule: Option<String>,
    pub fsgusealtpron: bool,
    pub fsgusefiller: bool,

    // Dictionary.
    pub dict: Option<PathBuf>,
    pub fdict: Option<PathBuf>,
    pub dictcase: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            hmm: None,
            mdef: None,
            mean: None,
            var: None,
            mixw: None,
            tmat: None,
            sendump: None,
            feat: "1s_c_d_dd".to_string(),
            ceplen: 13,
            varfloor: 1e-4,
            mixwfloor: 1e-7,
            tmatfloor: 1e-4,
            mmap: true,
            topn: 4,
            ds: 1,
            logbase: 1.0001,
            beam: 1e-48,
            wbeam: 7e-29,
            pbeam: 1e-48,
            lpbeam: 1e-40,
            lponlybeam: 7e-29,
            fwdflatbeam: 1e-64,
            fwdflatwbeam: 7e-29,
            pl_beam: 1e-10,
            pl_pbeam: 1e-10,
            pl_window: 5,
            pl_weight: 3.0,
            fwdtree: true,
            fwdflat: true,
            bestpath: true,
            compallsen: false,
            maxhmmpf: 30000,
            maxwpf: -1,
            latsize: 5000,
            outlatbeam: 1e-5,
            lm: None,
            lmctl: None,
            lmname: None,
            lw: 6.5,
            fwdflatlw: 8.5,
            bestpathlw: 9.5,
            wip: 0.65,
            silprob: 0.005,
            fillprob: 1e-8,
            uw: 1.0,
            fsg: None,
            jsgf: None,
            toprule: None,
            fsgusealtpron: true,
            fsgusefiller: true,
            dict: None,
            fdict: None,
            dictcase: false,
        }
    }
}

impl DecoderConfig {
    /// Resolve a model file: explicit option wins, otherwise the
    /// conventional name inside the `hmm` directory.
    pub fn model_file(&self, explicit: &Option<PathBuf>, name: &str) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(p.clone());
        }
        self.hmm.as_ref().map(|dir| dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let c = DecoderConfig::default();
        assert_eq!(c.ceplen, 13);
        assert_eq!(c.topn, 4);
        assert_eq!(c.feat, "1s_c_d_dd");
        assert!((c.lw - 6.5).abs() < f32::EPSILON);
        assert!((c.wip - 0.65).abs() < f32::EPSILON);
        assert_eq!(c.maxhmmpf, 30000);
        assert_eq!(c.maxwpf, -1);
        assert!(c.fwdtree && c.fwdflat && c.bestpath);
        assert!(!c.compallsen);
        assert!(c.mmap);
    }

    #[test]
    fn json_round_trip_with_partial_input() {
        let json = r#"{"lw": 9.5, "topn": 2, "dict": "/tmp/x.dict"}"#;
        let c: DecoderConfig = serde_json::from_str(json).unwrap();
        assert!((c.lw - 9.5).abs() < f32::EPSILON);
        assert_eq!(c.topn, 2);
        assert_eq!(c.dict, Some(PathBuf::from("/tmp/x.dict")));
        // Unspecified fields keep their defaults.
        assert_eq!(c.ceplen, 13);
        let text = serde_json::to_string(&c).unwrap();
        let back: DecoderConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.topn, 2);
    }

    #[test]
    fn model_file_resolution() {
        let mut c = DecoderConfig {
            hmm: Some(PathBuf::from("/models/en-us")),
            ..Default::default()
        };
        assert_eq!(
            c.model_file(&c.mdef, "mdef"),
            Some(PathBuf::from("/models/en-us/mdef"))
        );
        c.mdef = Some(PathBuf::from("/override/mdef.bin"));
        assert_eq!(
            c.model_file(&c.mdef, "mdef"),
            Some(PathBuf::from("/override/mdef.bin"))
        );
    }
}
