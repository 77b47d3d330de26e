use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;
use xd_stt::lm::NgramModel;
use xd_stt::logmath::LogMath;

/// Convert language models between ARPA text and the trie binary format.
/// Legacy dump files can be read but only the two modern formats are
/// written.
#[derive(Parser, Debug)]
pub struct Args {
    /// Input model (format auto-detected)
    #[clap(long, short)]
    input: PathBuf,
    /// Output model
    #[clap(long, short)]
    output: PathBuf,
    /// Write ARPA text instead of the trie binary
    #[clap(long)]
    arpa: bool,
}

fn main() -> anyhow::Result<()> {
    xd_stt::setup_logging();
    let args = Args::parse();

    let lm = NgramModel::read(&args.input, LogMath::shared_default())?;
    info!(
        "Loaded a {}-gram model with {} words",
        lm.order(),
        lm.n_words()
    );
    let out = BufWriter::new(File::create(&args.output)?);
    if args.arpa {
        lm.write_arpa(out)?;
    } else {
        lm.write_trie_bin(out)?;
    }
    Ok(())
}
