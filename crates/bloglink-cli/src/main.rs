use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bloglink_core::{Discovery, LinkKind, SiteId};
use bloglink_graph::{SampleSize, DEFAULT_SEED};
use bloglink_storage::LinkStore;
use bloglink_sync::{migrate_from_env, ExtractScope, Pipeline};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bloglink")]
#[command(about = "Blog link graph: ingest directories, crawl friend links, analyze paths")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    #[command(flatten)]
    Pipeline(PipelineCommand),
}

/// Commands that run against a connected [`Pipeline`].
#[derive(Debug, Subcommand)]
enum PipelineCommand {
    /// Pull every enabled source in sources.yaml into the site store.
    Ingest,
    /// Extract outbound links from sites not crawled yet.
    Extract {
        /// Revisit every site, not only pending ones.
        #[arg(long)]
        all: bool,
    },
    /// Judge queued external candidates.
    Classify {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Extract then classify.
    Crawl,
    /// Record one outbound link observed outside the extractor.
    Discover {
        site_id: SiteId,
        url: String,
        /// `homepage` or `friend_page`.
        kind: LinkKind,
        page: String,
    },
    /// Shortest-path length histogram over the link graph.
    Histogram {
        #[arg(long, conflicts_with = "sample_size")]
        sample_fraction: Option<f64>,
        #[arg(long)]
        sample_size: Option<usize>,
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,
    },
    /// Degree, component and clustering figures.
    Stats,
    /// Candidate counts per state.
    Queue,
    RetryFailed {
        #[arg(long)]
        limit: Option<usize>,
    },
    ReleaseStale,
    Sites {
        #[command(subcommand)]
        command: SiteCommands,
    },
    /// Run the cron jobs until Ctrl-C.
    Schedule,
}

#[derive(Debug, Subcommand)]
enum SiteCommands {
    Unreviewed {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    MarkReviewed {
        id: SiteId,
    },
    Delete {
        id: SiteId,
    },
    /// Sites with no outgoing edges.
    Pending,
}

fn init_tracing() -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("bloglink=info"),
    };
    let json = std::env::var("BLOGLINK_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

/// Flips to true on the first Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            let _ = tx.send(true);
        }
    });
    rx
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    match cli
        .command
        .unwrap_or(Commands::Pipeline(PipelineCommand::Crawl))
    {
        Commands::Migrate => migrate_from_env().await,
        Commands::Pipeline(command) => {
            let pipeline = Arc::new(Pipeline::from_env().await?);
            run_pipeline_command(pipeline, command).await
        }
    }
}

async fn run_pipeline_command(pipeline: Arc<Pipeline>, command: PipelineCommand) -> Result<()> {
    match command {
        PipelineCommand::Ingest => {
            let summary = pipeline.ingest().await?;
            println!(
                "ingest complete: run_id={} entries={} created={} unavailable_sources={}",
                summary.run_id,
                summary.entries(),
                summary.created(),
                summary.unavailable_sources()
            );
        }
        PipelineCommand::Extract { all } => {
            let scope = if all {
                ExtractScope::All
            } else {
                ExtractScope::Pending
            };
            let summary = pipeline.extract(scope).await?;
            println!(
                "extract complete: run_id={} sites={} skipped={} edges={} candidates={}",
                summary.run_id,
                summary.sites,
                summary.sites_skipped,
                summary.edges_created,
                summary.candidates_created
            );
        }
        PipelineCommand::Classify { workers, limit } => {
            let summary = pipeline.classify(workers, limit, shutdown_signal()).await?;
            let c = &summary.counts;
            println!(
                "classify complete: run_id={} claimed={} promoted={} linked={} rejected={} failed={}",
                summary.run_id, c.claimed, c.promoted, c.linked_existing, c.rejected, c.failed
            );
        }
        PipelineCommand::Crawl => {
            let summary = pipeline.crawl(shutdown_signal()).await?;
            print_json(&summary)?;
        }
        PipelineCommand::Discover {
            site_id,
            url,
            kind,
            page,
        } => {
            let discovery = Discovery::new(site_id, &url, kind, &page)
                .with_context(|| format!("normalizing {url}"))?;
            let outcome = pipeline.discover(&discovery).await?;
            println!("{outcome:?}");
        }
        PipelineCommand::Histogram {
            sample_fraction,
            sample_size,
            seed,
        } => {
            let sample = match (sample_fraction, sample_size) {
                (Some(fraction), _) => SampleSize::Fraction(fraction),
                (None, Some(count)) => SampleSize::Count(count),
                (None, None) => SampleSize::All,
            };
            let run = pipeline.analyze(sample, seed).await?;
            for (length, pairs) in &run.histogram.by_length {
                println!("{length}\t{pairs}");
            }
            println!("unreachable\t{}", run.histogram.unreachable);
            println!(
                "sources={} connectivity={:.4} report={}",
                run.sampled_sources,
                run.connectivity_ratio,
                run.report_dir.display()
            );
        }
        PipelineCommand::Stats => print_json(&pipeline.graph_stats().await?)?,
        PipelineCommand::Queue => print_json(&pipeline.queue_stats().await?)?,
        PipelineCommand::RetryFailed { limit } => {
            let reset = pipeline.retry_failed(limit).await?;
            println!("reset {reset} failed candidates");
        }
        PipelineCommand::ReleaseStale => {
            let released = pipeline.release_stale().await?;
            println!("released {released} stale claims");
        }
        PipelineCommand::Sites { command } => run_site_command(&pipeline, command).await?,
        PipelineCommand::Schedule => {
            let mut shutdown = shutdown_signal();
            let Some(mut sched) = pipeline.maybe_build_scheduler(shutdown.clone()).await? else {
                bail!("scheduler disabled; set BLOGLINK_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; Ctrl-C to stop");
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn run_site_command(pipeline: &Pipeline, command: SiteCommands) -> Result<()> {
    let store = pipeline.store();
    match command {
        SiteCommands::Unreviewed { limit } => {
            for site in store.list_unreviewed_sites(limit).await? {
                println!("{}\t{}\t{}", site.id, site.url, site.name);
            }
        }
        SiteCommands::MarkReviewed { id } => {
            if !store.mark_reviewed(id).await? {
                bail!("site {id} not found");
            }
            println!("site {id} marked reviewed");
        }
        SiteCommands::Delete { id } => {
            if !store.delete_site(id).await? {
                bail!("site {id} not found");
            }
            println!("site {id} deleted with its edges and candidates");
        }
        SiteCommands::Pending => {
            for site in store.sites_without_outbound_links().await? {
                println!("{}\t{}", site.id, site.url);
            }
        }
    }
    Ok(())
}
