//! `cdsstage`: stage every job of a jobs file into the local cache.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cdsstage::{
    CancelToken, Catalog, CdsClient, CredentialOverrides, Credentials, ErrorKind, JobFile, Outcome,
    Pipeline, PipelineConfig,
};

#[derive(Debug, Parser)]
#[command(name = "cdsstage", version, about = "Retrieve CDS datasets into a local cache")]
struct Args {
    /// Jobs file listing the dataset specifications to stage.
    #[arg(long, env = "CDSSTAGE_JOBS", default_value = "jobs.json")]
    jobs: PathBuf,

    /// Credentials file (`url:` / `key:` lines).
    #[arg(long, env = "CDSAPI_RC")]
    rc: Option<PathBuf>,

    /// Cache root; defaults to the platform cache directory.
    #[arg(long, env = "CDSSTAGE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Disable download progress bars.
    #[arg(long)]
    no_progress: bool,

    /// Stage every job again, replacing cached artifacts.
    #[arg(long, env = "CDSSTAGE_REFRESH")]
    refresh: bool,
}

#[derive(Debug, Default)]
struct Tally {
    staged: usize,
    cached: usize,
    skipped: usize,
    failed: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_env("CDSSTAGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Everything that can go wrong before the first request is a setup error.
    let (pipeline, specs) = match prepare(&args) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    let tally = stage_all(&pipeline, specs);
    info!(
        staged = tally.staged,
        cached = tally.cached,
        skipped = tally.skipped,
        failed = tally.failed,
        "run finished"
    );

    if tally.failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn prepare(args: &Args) -> Result<(Pipeline, Vec<cdsstage::DatasetSpec>)> {
    let overrides = CredentialOverrides {
        rc_file: args.rc.clone(),
        ..CredentialOverrides::default()
    };
    let credentials = Credentials::load(&overrides, |name| std::env::var(name).ok())
        .context("failed to load CDS credentials")?;

    let mut config = PipelineConfig::from_env().context("invalid CDSSTAGE_* settings")?;
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    config.stage.progress = !args.no_progress;

    let mut specs = JobFile::load(&args.jobs)
        .and_then(|file| file.expand())
        .with_context(|| format!("failed to read jobs from {}", args.jobs.display()))?;
    if args.refresh {
        specs.iter_mut().for_each(|spec| spec.refresh = true);
    }

    let client = CdsClient::new(&credentials).context("failed to create CDS client")?;
    let pipeline = Pipeline::new(Arc::new(client), Catalog::era5(), &config)
        .with_context(|| format!("failed to open cache at {}", config.cache_dir.display()))?;

    // Reject bad specifications up front rather than after the first downloads.
    for spec in &specs {
        pipeline
            .describe(spec)
            .with_context(|| format!("invalid job for dataset {}", spec.dataset))?;
    }

    let refreshing = specs.iter().filter(|spec| spec.refresh).count();
    info!(jobs = specs.len(), refreshing, cache = %pipeline.cache_dir().display(), "loaded jobs");
    Ok((pipeline, specs))
}

fn stage_all(pipeline: &Pipeline, specs: Vec<cdsstage::DatasetSpec>) -> Tally {
    let mut tally = Tally::default();
    for report in pipeline.run_all(specs, &CancelToken::new()) {
        match report.result {
            Ok(Outcome::CacheHit(artifact)) => {
                tally.cached += 1;
                info!(key = %artifact.key.short(), path = %artifact.path.display(), "already staged");
            }
            Ok(Outcome::Staged(artifact)) => {
                tally.staged += 1;
                info!(key = %artifact.key.short(), path = %artifact.path.display(), "staged");
            }
            Err(failure) if failure.kind() == ErrorKind::NotYetAvailable => {
                tally.skipped += 1;
                warn!(job = %failure.describe(), "data not available yet, skipping");
            }
            Err(failure) => {
                tally.failed += 1;
                error!(job = %failure.describe(), kind = %failure.kind(), error = %failure.error, "job failed");
            }
        }
    }
    tally
}
