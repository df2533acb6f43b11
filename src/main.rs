use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use starload::{fetch, warehouse, DuckStore, Pipeline, PipelineConfig, RelationalStore, RunOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const MAX_CONCURRENT_DOWNLOADS: usize = 3;

#[derive(Parser)]
#[command(author, version, about = "Stage delimited exports and build a star schema in DuckDB")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stage sources, then build dimensions and facts.
    Run {
        #[command(flatten)]
        target: Target,
        /// Reuse the staging relations already in the database.
        #[arg(long)]
        skip_staging: bool,
        /// Keep existing dimension and fact relations instead of dropping them first.
        #[arg(long)]
        keep_existing: bool,
        /// Write the run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Download the configured source archives.
    Fetch {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Check referential integrity of built facts.
    Verify {
        #[command(flatten)]
        target: Target,
    },
    /// Validate the pipeline definition without touching the database.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct Target {
    #[arg(short, long)]
    config: PathBuf,
    #[arg(long, env = "STARLOAD_DB", default_value = "starload.duckdb")]
    db: PathBuf,
}

fn load(config: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(config).with_context(|| format!("loading {}", config.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    match Cli::parse().command {
        Command::Run {
            target,
            skip_staging,
            keep_existing,
            report,
        } => {
            let config = load(&target.config)?;
            let options = RunOptions {
                stage: !skip_staging,
                drop_existing: !keep_existing,
            };
            info!(db = %target.db.display(), ?options, "starting run");

            // DuckDB work is synchronous; keep it off the async workers
            let db = target.db.clone();
            let run = tokio::task::spawn_blocking(move || -> Result<starload::RunReport> {
                let store = DuckStore::open(&db)?;
                Ok(Pipeline::new(&store, &config).run(options)?)
            })
            .await??;

            for line in run.failure_lines() {
                error!("{}", line);
                eprintln!("{}", line);
            }
            if let Some(path) = report {
                run.write_json(&path)
                    .with_context(|| format!("writing report {}", path.display()))?;
                info!(path = %path.display(), "wrote report");
            }
            println!("{}", run);
            if !run.succeeded() {
                bail!("{} step(s) failed", run.failures().count());
            }
        }

        Command::Fetch { config } => {
            let config = load(&config)?;
            if config.downloads.is_empty() {
                warn!("no downloads configured");
                return Ok(());
            }
            let client = Client::new();
            let results =
                fetch::download_all(&client, &config.downloads, MAX_CONCURRENT_DOWNLOADS).await;
            let mut failed = 0;
            for result in results {
                match result {
                    Ok(d) => info!(
                        path = %d.path.display(),
                        bytes = d.bytes,
                        extracted = d.extracted.len(),
                        "fetched"
                    ),
                    Err(e) => {
                        eprintln!("FAILED fetch {}", e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{} download(s) failed", failed);
            }
        }

        Command::Verify { target } => {
            let config = load(&target.config)?;
            let integrity = tokio::task::spawn_blocking(move || -> Result<_> {
                let store = DuckStore::open(&target.db)?;
                store.ping()?;
                Ok(warehouse::verify(&store, &config)?)
            })
            .await??;

            println!("{}", serde_json::to_string_pretty(&integrity)?);
            if !integrity.is_clean() {
                bail!("integrity check failed");
            }
        }

        Command::Check { config } => {
            let config = load(&config)?;
            println!(
                "ok: {} staging, {} dimensions, {} facts",
                config.staging.len(),
                config.dimensions.len(),
                config.facts.len()
            );
        }
    }
    Ok(())
}
