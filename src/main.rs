use std::io::{self, BufWriter, Write};
use std::process::ExitCode;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bitvec_witness::protocol::{self, Diagnostics};
use bitvec_witness::{
    ConvolutionEngine, ExtractorConfig, Randomness, extract, ordered_min_witness, prefix_min_witness, sample_witnesses,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// `count idx...` per position
    KWitness,
    /// The contributor that comes first in `order`, by peeling rank prefixes
    MinWitness,
    /// The contributor that comes first in `order`, by sqrt grouping
    OrderedMin,
    /// One contributor per position drawn uniformly at random
    Sample,
}

/// Reads an instance on stdin and prints witnesses for every output position.
#[derive(Parser, Debug)]
#[command(name = "bitvec_witness")]
#[command(version, about = "Weighted boolean convolution with witness recovery")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::KWitness)]
    mode: Mode,

    /// Seed for the label source; taken from the clock when absent
    #[arg(long)]
    seed: Option<u64>,

    /// Cap on isolation rounds
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Draw labels from a small-bias sample instead of the generator
    #[arg(long)]
    derandomize: bool,

    /// Bias of the small-bias sample
    #[arg(long, default_value_t = 1.0 / 256.0)]
    epsilon: f64,

    /// Print unresolved positions with a `?` instead of completing them by scanning
    #[arg(long)]
    no_fallback: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn clock_seed() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let start = Instant::now();
    let input = protocol::parse_input(io::stdin().lock()).context("invalid input")?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if cli.mode == Mode::OrderedMin {
        let mut engine = ConvolutionEngine::default();
        let witnesses = ordered_min_witness(&input.instance, &input.order, &mut engine)?;
        let kernel = engine.stats();
        protocol::write_min_witness(&mut out, &witnesses)?;
        out.flush()?;
        let diagnostics = Diagnostics {
            feasibility_time: kernel.elapsed,
            direct_blocks: kernel.direct_blocks,
            dense_blocks: kernel.dense_blocks,
            total_time: start.elapsed(),
            ..Diagnostics::default()
        };
        diagnostics.write_to(&mut io::stderr().lock())?;
        return Ok(());
    }

    let seed = cli.seed.unwrap_or_else(clock_seed);
    let randomness = if cli.derandomize {
        Randomness::Biased { seed, epsilon: cli.epsilon }
    } else {
        Randomness::Uniform { seed }
    };
    let config =
        ExtractorConfig { witnesses: input.witnesses, max_rounds: cli.max_rounds, ..ExtractorConfig::default() };
    info!(seed, ?randomness, ?config, mode = ?cli.mode, "extracting witnesses");

    if matches!(cli.mode, Mode::MinWitness | Mode::Sample) {
        let found = if cli.mode == Mode::Sample {
            sample_witnesses(&input.instance, config, randomness)?
        } else {
            prefix_min_witness(&input.instance, &input.order, config, randomness)?
        };
        if found.scanned > 0 {
            warn!(scanned = found.scanned, "round budget ran out; positions completed by exhaustive scan");
        }
        protocol::write_min_witness(&mut out, &found.witnesses)?;
        out.flush()?;
        let mut diagnostics = Diagnostics::from_extraction(&found.stats, 0);
        diagnostics.total_time = start.elapsed();
        diagnostics.write_to(&mut io::stderr().lock())?;
        return Ok(());
    }

    let mut extraction = extract(&input.instance, &input.order, config, randomness)?;
    let unresolved = extraction.table.unresolved_count();
    if unresolved > 0 && !cli.no_fallback {
        warn!(unresolved, "completing unresolved positions by exhaustive scan");
        extraction.complete_exhaustively(&input.instance, &input.order)?;
    }

    protocol::write_k_witness(&mut out, &extraction.table)?;
    out.flush()?;

    let mut diagnostics = Diagnostics::from_extraction(&extraction.stats, unresolved);
    diagnostics.total_time = start.elapsed();
    diagnostics.write_to(&mut io::stderr().lock())?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
