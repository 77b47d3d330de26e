use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use xd_stt::fsg::jsgf;
use xd_stt::logmath::LogMath;

/// Convert a JSGF grammar into the finite state grammar format the decoder
/// consumes directly.
#[derive(Parser, Debug)]
pub struct Args {
    /// JSGF grammar file
    #[clap(long, short)]
    input: PathBuf,
    /// Output FSG file, stdout if omitted
    #[clap(long, short)]
    output: Option<PathBuf>,
    /// Rule to compile instead of the first public rule
    #[clap(long)]
    toprule: Option<String>,
}

fn main() -> anyhow::Result<()> {
    xd_stt::setup_logging();
    let args = Args::parse();

    let fsg = jsgf::read_file(
        &args.input,
        LogMath::shared_default(),
        1.0,
        args.toprule.as_deref(),
    )?;
    match &args.output {
        Some(path) => fsg.write(BufWriter::new(File::create(path)?))?,
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            fsg.write(&mut lock)?;
            lock.flush()?;
        }
    }
    Ok(())
}
