//! Artificial star test driver
//!
//! Generates synthetic stars from an observed catalog, runs the fitting tool
//! over every batch, matches detections back to the injected stars and
//! writes the completeness table.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use fakestar::completeness::MagnitudeBins;
use fakestar::pipeline::log_report;
use fakestar::wcs::{LinearWcs, WorldToPixel};
use fakestar::{ExternalTool, MatchSummary, Pipeline, ResumeMode, RunConfig, RunReport};
use log::info;
use shared::range_arg::RangeArg;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fakestar")]
#[command(about = "Artificial star tests: inject, fit, match and measure completeness")]
#[command(version)]
struct Args {
    /// Working directory holding the photometry and parameter profiles
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Run configuration (JSON); built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Settings that override the configuration file
#[derive(ClapArgs, Debug)]
struct Overrides {
    /// Run name (output folder)
    #[arg(short, long, global = true)]
    run: Option<String>,

    /// Number of parallel fitting processes
    #[arg(short = 'c', long, global = true)]
    workers: Option<usize>,

    /// Random seed for generation and batch shuffling
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Draw synthetic stars and write batch files
    Generate(GenerateArgs),
    /// Run the fitting tool over pending batches
    Run(RunArgs),
    /// Match tool outputs to injected stars
    Extract,
    /// Aggregate matched stars into a completeness table
    Complete(CompleteArgs),
    /// Every stage in sequence
    All {
        #[command(flatten)]
        generate: GenerateArgs,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        complete: CompleteArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct GenerateArgs {
    /// Observed reference catalog (CSV with chip, X, Y and <BAND>_VEGA columns)
    #[arg(long, default_value = "final/o.gst.csv")]
    reference: PathBuf,

    /// Number of synthetic stars
    #[arg(short, long)]
    n_stars: Option<usize>,

    /// Stars per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Linear WCS (JSON) used for sky-offset placement
    #[arg(long)]
    wcs: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Delete existing outputs and dispatch every batch
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Continue an interrupted run, dispatching only missing batches
    #[arg(long = "con", default_value_t = false, conflicts_with = "force")]
    resume: bool,

    /// Hide the progress bar
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

#[derive(ClapArgs, Debug)]
struct CompleteArgs {
    /// Explicit magnitude bins (format: start:stop:step)
    #[arg(long)]
    mags: Option<RangeArg>,

    /// Also report completeness per chip
    #[arg(long, default_value_t = false)]
    per_chip: bool,
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("loading run config {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(run) = &args.overrides.run {
        config.run_name = run.clone();
    }
    if let Some(workers) = args.overrides.workers {
        config.workers = workers;
    }
    if let Some(seed) = args.overrides.seed {
        config.seed = seed;
    }
    Ok(config)
}

fn generate(pipeline: &Pipeline, args: &GenerateArgs) -> Result<()> {
    let wcs = args
        .wcs
        .as_deref()
        .map(LinearWcs::load)
        .transpose()
        .context("loading WCS")?;
    let manifest = pipeline
        .generate_from(&args.reference, wcs.as_ref().map(|w| w as &dyn WorldToPixel))
        .with_context(|| format!("generating from {}", args.reference.display()))?;
    info!(
        "Run {} has {} batches over chips {:?}",
        manifest.run,
        manifest.batches.len(),
        manifest.chips()
    );
    Ok(())
}

fn run(pipeline: &Pipeline, dir: &Path, args: &RunArgs) -> Result<RunReport> {
    let mode = if args.force {
        ResumeMode::Restart
    } else if args.resume {
        ResumeMode::Resume
    } else {
        pipeline.config.resume
    };
    let tool = Arc::new(ExternalTool::new(pipeline.config.tool.program.clone(), dir));
    Ok(pipeline.dispatch(tool, mode, !args.quiet)?)
}

fn complete(pipeline: &Pipeline, summary: &MatchSummary, args: &CompleteArgs) -> Result<()> {
    let bins = match args.mags {
        Some(range) => MagnitudeBins::from(range),
        None => MagnitudeBins::EqualWidth(pipeline.config.n_bins),
    };
    let table = pipeline.complete(summary, &bins)?;
    for row in &table.rows {
        match row.completeness() {
            Some(c) => println!(
                "{:>6} {:7.3} {:7.3} {:6} {:6} {:6.3}",
                row.region.to_string(),
                row.mag_lo,
                row.mag_hi,
                row.injected,
                row.recovered,
                c
            ),
            None => println!(
                "{:>6} {:7.3} {:7.3} {:6} {:6}    nan",
                row.region.to_string(),
                row.mag_lo,
                row.mag_hi,
                row.injected,
                row.recovered
            ),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = load_config(&args)?;
    if let Command::Complete(c) | Command::All { complete: c, .. } = &args.command {
        config.per_chip |= c.per_chip;
    }
    if let Command::Generate(g) | Command::All { generate: g, .. } = &args.command {
        if let Some(n) = g.n_stars {
            config.n_stars = n;
        }
        if let Some(b) = g.batch_size {
            config.batch_size = b;
        }
    }
    let pipeline = Pipeline::new(&args.dir, config)?;

    match &args.command {
        Command::Generate(g) => generate(&pipeline, g),
        Command::Run(r) => {
            let report = run(&pipeline, &args.dir, r)?;
            log_report(Some(&report), None);
            Ok(())
        }
        Command::Extract => {
            let summary = pipeline.extract()?;
            log_report(None, Some(&summary));
            Ok(())
        }
        Command::Complete(c) => {
            let summary = pipeline.extract()?;
            complete(&pipeline, &summary, c)
        }
        Command::All {
            generate: g,
            run: r,
            complete: c,
        } => {
            generate(&pipeline, g)?;
            let report = run(&pipeline, &args.dir, r)?;
            let summary = pipeline.extract()?;
            let completed = complete(&pipeline, &summary, c);
            log_report(Some(&report), Some(&summary));
            completed
        }
    }
}
