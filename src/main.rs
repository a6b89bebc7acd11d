//! Command line decoder.
//!
//! Loads a transducer and an optional weight matrix (both JSON), runs one
//! search and prints the best paths as a JSON transducer.
//!
//! ```bash
//! wfst-search --fst model.json --weights frames.json --algorithm as --numpaths 3
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use wfst_search::{
    telemetry, Algorithm, BacktrackMode, FeedOptions, FstSearch, SearchConfig, Transducer, Weights,
};

#[derive(Parser)]
#[command(name = "wfst-search")]
#[command(version)]
#[command(about = "Best-path search through weighted finite-state transducers")]
struct Cli {
    /// Transducer file (JSON)
    #[arg(long)]
    fst: PathBuf,

    /// Weight matrix file (JSON rows); omit for time-invariant search
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Decode this unit only; all units are composed otherwise
    #[arg(long)]
    unit: Option<usize>,

    /// Configuration file (TOML or YAML); defaults to wfst-search.toml/.yaml
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Write the result here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Search algorithm: tp, as or sdp
    #[arg(long, env = "WFST_ALGORITHM")]
    algorithm: Option<Algorithm>,

    /// Backtrack representation: t, os or lat
    #[arg(long)]
    backtrack: Option<BacktrackMode>,

    /// Number of best paths
    #[arg(long)]
    numpaths: Option<u32>,

    /// TP jobs: a power of two or "auto"
    #[arg(long)]
    jobs: Option<String>,

    /// Print search statistics to stderr
    #[arg(long)]
    stats: bool,
}

/// Largest power of two not above the number of CPUs.
fn auto_jobs() -> usize {
    let cpus = num_cpus::get().max(1);
    1 << (usize::BITS - 1 - cpus.leading_zeros())
}

fn parse_jobs(value: &str) -> anyhow::Result<usize> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(auto_jobs());
    }
    let jobs: usize = value.parse().with_context(|| format!("invalid job count '{}'", value))?;
    if !jobs.is_power_of_two() {
        bail!("job count {} is not a power of two", jobs);
    }
    Ok(jobs)
}

fn configure(cli: &Cli) -> anyhow::Result<SearchConfig> {
    let mut config = match &cli.config {
        Some(path) => SearchConfig::load_from(path)?,
        None => SearchConfig::load()?,
    };
    if let Some(algorithm) = cli.algorithm {
        config.algorithm = algorithm;
    }
    if let Some(backtrack) = cli.backtrack {
        config.backtrack = backtrack;
    }
    if let Some(numpaths) = cli.numpaths {
        config.numpaths = numpaths;
    }
    if let Some(jobs) = &cli.jobs {
        config.tp.jobs = parse_jobs(jobs)?;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = configure(&cli)?;
    telemetry::init_tracing(&config.logging)?;

    let fst = Transducer::from_json_file(&cli.fst)
        .with_context(|| format!("loading transducer {}", cli.fst.display()))?;
    let weights = match &cli.weights {
        Some(path) => {
            Weights::from_json_file(path).with_context(|| format!("loading weights {}", path.display()))?
        }
        None => Weights::empty(),
    };
    info!(
        algorithm = %config.algorithm,
        units = fst.units.len(),
        frames = weights.frames(),
        "Starting search"
    );

    let started = Instant::now();
    let mut search = FstSearch::new(config)?;
    search.load(&fst, cli.unit)?;
    search.isearch(&weights, FeedOptions::last())?;
    let stats = search.stats().clone();
    let result = search.backtrack()?;
    search.unload();

    if cli.stats {
        eprintln!(
            "expanded {} states, {} bytes, {:.3} ms",
            stats.expanded_states,
            stats.memory_bytes,
            started.elapsed().as_secs_f64() * 1000.0
        );
        for pool in &stats.pools {
            eprintln!(
                "  {:<16} used {:>8} max {:>8} bytes {:>10}",
                pool.name, pool.used, pool.used_max, pool.memory_bytes
            );
        }
    }

    let json = result.to_json()?;
    match &cli.output {
        Some(path) => std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}
