use clap::Parser;
use ndarray::Array2;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;
use xd_stt::config::DecoderConfig;
use xd_stt::decoder::Decoder;
use xd_stt::feat;

#[derive(Parser, Debug)]
pub struct Args {
    /// Feature file to decode (.mfc cepstra or .feat multi-stream dump)
    #[clap(long, short)]
    input: PathBuf,
    /// Acoustic model directory
    #[clap(long)]
    hmm: PathBuf,
    /// Pronunciation dictionary
    #[clap(long)]
    dict: PathBuf,
    /// Filler dictionary
    #[clap(long)]
    fdict: Option<PathBuf>,
    /// N-gram language model (ARPA, trie binary or legacy dump)
    #[clap(long)]
    lm: Option<PathBuf>,
    /// JSGF grammar instead of a language model
    #[clap(long)]
    jsgf: Option<PathBuf>,
    /// FSG file instead of a language model
    #[clap(long)]
    fsg: Option<PathBuf>,
    /// Grammar rule to compile when not using the first public rule
    #[clap(long)]
    toprule: Option<String>,
    /// Extra decoder options as JSON, overriding the defaults
    #[clap(long)]
    config: Option<PathBuf>,
    /// Write the word segmentation in hypseg form
    #[clap(long)]
    hypseg: Option<PathBuf>,
    /// Write the word segmentation in CTM form
    #[clap(long)]
    ctm: Option<PathBuf>,
    /// Write the word lattice
    #[clap(long)]
    lattice: Option<PathBuf>,
    /// Print this many N-best hypotheses after the 1-best
    #[clap(long, default_value_t = 0)]
    nbest: usize,
    /// Saves the input features for debugging purposes
    #[clap(long)]
    dump_features: Option<PathBuf>,
    /// Utterance id used in hypseg/CTM output
    #[clap(long, default_value = "utt")]
    uttid: String,
}

fn main() -> anyhow::Result<()> {
    xd_stt::setup_logging();
    let args = Args::parse();

    let mut config: DecoderConfig = match &args.config {
        Some(path) => serde_json::from_reader(File::open(path)?)?,
        None => DecoderConfig::default(),
    };
    config.hmm = Some(args.hmm.clone());
    config.dict = Some(args.dict.clone());
    config.fdict = args.fdict.clone();
    config.lm = args.lm.clone();
    config.jsgf = args.jsgf.clone();
    config.fsg = args.fsg.clone();
    config.toprule = args.toprule.clone();

    info!("Loading resources");
    let mut decoder = Decoder::new(config)?;

    if let Some(out) = &args.dump_features {
        let frames = match args.input.extension().and_then(|e| e.to_str()) {
            Some("mfc") => feat::read_mfc(File::open(&args.input)?, decoder.config().ceplen)?,
            _ => feat::read_feat(File::open(&args.input)?)?,
        };
        let dims = frames[0].streams[0].len();
        let mut mat = Array2::<f32>::zeros((frames.len(), dims));
        for (i, f) in frames.iter().enumerate() {
            for (j, v) in f.streams[0].iter().enumerate() {
                mat[(i, j)] = *v;
            }
        }
        ndarray_npy::write_npy(out, &mat)?;
    }

    match decoder.decode_feat_file(&args.input)? {
        Some((hyp, score)) => {
            info!("Decoded {} frames", decoder.n_frames());
            println!("{} ({})", hyp, score);
        }
        None => println!("(no hypothesis)"),
    }

    for (i, (hyp, score)) in decoder.nbest(args.nbest).into_iter().enumerate() {
        println!("nbest {}: {} ({})", i + 1, hyp, score);
    }
    if let Some(path) = &args.hypseg {
        decoder.write_hypseg(BufWriter::new(File::create(path)?), &args.uttid)?;
    }
    if let Some(path) = &args.ctm {
        decoder.write_ctm(BufWriter::new(File::create(path)?), &args.uttid, 100.0)?;
    }
    if let Some(path) = &args.lattice {
        decoder.write_lattice(BufWriter::new(File::create(path)?))?;
    }
    Ok(())
}
