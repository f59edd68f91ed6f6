use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bloglink_adapters::SourceRegistry;
use bloglink_core::Discovery;
use bloglink_graph::{
    clustering, network_properties, path_length_histogram, sample_sources, ClusteringSummary,
    LinkGraph, NetworkProperties, PathHistogram, SampleSize,
};
use bloglink_storage::{
    EvidenceStore, GraphSnapshot, HttpFetcher, LinkStore, PageFetcher,
    PgLinkStore, QueueStats,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::classify::{ClassifierPool, ClassifyOptions, ClassifySummary};
use crate::config::{ExtractionRules, PipelineConfig};
use crate::extract::{record_discovery, DiscoveryOutcome, ExtractScope, ExtractSummary, LinkExtractor};
use crate::ingest::{IngestPass, IngestSummary};
use crate::judge::{judge_from_config, BlogJudge};
use crate::report::{export_graph_parquet, write_run_report};

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub extract: ExtractSummary,
    pub classify: ClassifySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsRun {
    pub run_id: Uuid,
    pub seed: u64,
    pub sampled_sources: usize,
    pub histogram: PathHistogram,
    pub mean_length: Option<f64>,
    pub max_length: Option<u32>,
    pub connectivity_ratio: f64,
    pub properties: NetworkProperties,
    pub clustering: ClusteringSummary,
    pub report_dir: PathBuf,
    pub parquet_manifest: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub properties: NetworkProperties,
    pub clustering: ClusteringSummary,
}

/// The whole pipeline over one store, fetcher and judge.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn LinkStore>,
    http: Arc<dyn PageFetcher>,
    judge: Arc<dyn BlogJudge>,
    rules: Arc<ExtractionRules>,
    evidence: EvidenceStore,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn LinkStore>,
        http: Arc<dyn PageFetcher>,
        judge: Arc<dyn BlogJudge>,
        rules: ExtractionRules,
    ) -> Self {
        let evidence = EvidenceStore::new(config.evidence_dir.clone());
        Self {
            config,
            store,
            http,
            judge,
            rules: Arc::new(rules),
            evidence,
        }
    }

    /// Connect to Postgres and build the HTTP stack from the environment.
    /// Failing to reach the database here is fatal.
    pub async fn from_env() -> Result<Self> {
        let config = PipelineConfig::from_env();
        let max_connections = (config.classify_workers + config.extract_concurrency + 2) as u32;
        let store = PgLinkStore::connect(&config.database_url, max_connections)
            .await
            .context("connecting to the link store database")?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let judge = judge_from_config(&config.judge)?;
        let rules = ExtractionRules::load(&config.workspace_root)?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(http),
            Arc::from(judge),
            rules,
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LinkStore> {
        &self.store
    }

    pub async fn ingest(&self) -> Result<IngestSummary> {
        let registry = SourceRegistry::load(self.config.sources_path())?;
        let summary = IngestPass::new(self.store.clone(), self.http.clone())
            .run(registry.enabled())
            .await;

        let lines: Vec<String> = summary
            .sources
            .iter()
            .map(|s| match &s.unavailable {
                Some(reason) => format!("{}: unavailable ({reason})", s.source_id),
                None => format!(
                    "{}: {} entries, {} new, {} known, {} invalid, {} unreadable",
                    s.source_id, s.entries, s.created, s.existing, s.invalid, s.skipped
                ),
            })
            .collect();
        write_run_report(&self.config.reports_root(), summary.run_id, "Ingestion", &summary, &lines)
            .await?;
        Ok(summary)
    }

    pub async fn extract(&self, scope: ExtractScope) -> Result<ExtractSummary> {
        let extractor = LinkExtractor::new(
            self.store.clone(),
            self.http.clone(),
            self.rules.clone(),
            self.config.extract_concurrency,
        );
        let summary = extractor.run(scope).await.context("listing sites to extract")?;
        let lines = vec![
            format!("sites visited: {}", summary.sites),
            format!("sites skipped: {}", summary.sites_skipped),
            format!("friend pages found: {}", summary.friend_pages_found),
            format!("edges created: {}", summary.edges_created),
            format!("candidates queued: {}", summary.candidates_created),
        ];
        write_run_report(&self.config.reports_root(), summary.run_id, "Extraction", &summary, &lines)
            .await?;
        Ok(summary)
    }

    pub async fn classify(
        &self,
        workers: Option<usize>,
        limit: Option<usize>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ClassifySummary> {
        let pool = ClassifierPool::new(
            self.store.clone(),
            self.http.clone(),
            self.judge.clone(),
            ClassifyOptions {
                workers: workers.unwrap_or(self.config.classify_workers),
                stale_after: self.config.stale_claim_after,
                limit,
            },
        )
        .with_evidence(self.evidence.clone());
        let summary = pool.run(shutdown).await;
        let c = &summary.counts;
        let lines = vec![
            format!("judge: {}", summary.judge),
            format!("claimed: {}", c.claimed),
            format!("promoted to sites: {}", c.promoted),
            format!("linked to existing sites: {}", c.linked_existing),
            format!("rejected: {}", c.rejected),
            format!("failed: {}", c.failed),
            format!("stale outcomes dropped: {}", c.stale),
        ];
        write_run_report(&self.config.reports_root(), summary.run_id, "Classification", &summary, &lines)
            .await?;
        Ok(summary)
    }

    /// Extraction over pending sites followed by a classification pass.
    pub async fn crawl(&self, shutdown: watch::Receiver<bool>) -> Result<CrawlSummary> {
        let extract = self.extract(ExtractScope::Pending).await?;
        let classify = self.classify(None, None, shutdown).await?;
        Ok(CrawlSummary { extract, classify })
    }

    /// Entry point for links found outside the extractor (e.g. a browser rescan).
    pub async fn discover(&self, discovery: &Discovery) -> Result<DiscoveryOutcome> {
        record_discovery(self.store.as_ref(), discovery)
            .await
            .context("recording discovery")
    }

    pub async fn analyze(&self, sample: SampleSize, seed: u64) -> Result<AnalyticsRun> {
        let run_id = Uuid::new_v4();
        let (snapshot, graph) = self.load_graph().await?;
        let sources = sample_sources(&graph, sample, seed)?;
        let histogram = path_length_histogram(&graph, &sources);
        let properties = network_properties(&graph);
        let clustering = clustering(&graph);

        let mut lines = vec![
            format!("nodes: {}, edges: {}", properties.nodes, properties.edges),
            format!("sampled sources: {} (seed {seed})", sources.len()),
        ];
        lines.extend(
            histogram
                .by_length
                .iter()
                .map(|(len, pairs)| format!("length {len}: {pairs} pairs")),
        );
        lines.push(format!("unreachable: {} pairs", histogram.unreachable));
        lines.push(format!("connectivity ratio: {:.4}", histogram.connectivity_ratio()));
        lines.push(format!("average clustering: {:.4}", clustering.average_clustering));

        let mut run = AnalyticsRun {
            run_id,
            seed,
            sampled_sources: sources.len(),
            mean_length: histogram.mean_length(),
            max_length: histogram.max_length(),
            connectivity_ratio: histogram.connectivity_ratio(),
            histogram,
            properties,
            clustering,
            report_dir: PathBuf::new(),
            parquet_manifest: PathBuf::new(),
        };
        run.report_dir =
            write_run_report(&self.config.reports_root(), run_id, "Path lengths", &run, &lines).await?;
        run.parquet_manifest = export_graph_parquet(&run.report_dir, &snapshot, &run.histogram).await?;
        info!(%run_id, sampled = run.sampled_sources, unreachable = run.histogram.unreachable, "analytics finished");
        Ok(run)
    }

    /// Degree, component and clustering figures without a histogram run.
    pub async fn graph_stats(&self) -> Result<GraphStats> {
        let (_, graph) = self.load_graph().await?;
        Ok(GraphStats {
            properties: network_properties(&graph),
            clustering: clustering(&graph),
        })
    }

    async fn load_graph(&self) -> Result<(GraphSnapshot, LinkGraph)> {
        let snapshot = self
            .store
            .graph_snapshot()
            .await
            .context("reading graph snapshot")?;
        let graph = LinkGraph::from_relation(
            snapshot.sites.iter().map(|s| s.id),
            snapshot
                .edges
                .iter()
                .map(|e| (e.source_site_id, e.target_site_id)),
        );
        Ok((snapshot, graph))
    }

    pub async fn retry_failed(&self, limit: Option<usize>) -> Result<u64> {
        let reset = self.store.reset_failed(limit).await?;
        info!(reset, "failed candidates returned to the queue");
        Ok(reset)
    }

    pub async fn release_stale(&self) -> Result<u64> {
        let released = self
            .store
            .release_stale_claims(self.config.stale_claim_after)
            .await?;
        info!(released, "stale claims released");
        Ok(released)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.store.queue_stats().await?)
    }

    /// Cron jobs for ingestion, crawling and failed-candidate retry when the
    /// scheduler is enabled. The caller starts and shuts down the scheduler.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(self);
        let ingest = Job::new_async(self.config.ingest_cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.ingest().await {
                    error!(error = %err, "scheduled ingestion failed");
                }
            })
        })
        .with_context(|| format!("creating ingest job for cron {}", self.config.ingest_cron))?;
        sched.add(ingest).await.context("adding ingest job")?;

        let pipeline = Arc::clone(self);
        let crawl_shutdown = shutdown.clone();
        let crawl = Job::new_async(self.config.crawl_cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let shutdown = crawl_shutdown.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.crawl(shutdown).await {
                    error!(error = %err, "scheduled crawl failed");
                }
            })
        })
        .with_context(|| format!("creating crawl job for cron {}", self.config.crawl_cron))?;
        sched.add(crawl).await.context("adding crawl job")?;

        let pipeline = Arc::clone(self);
        let retry = Job::new_async(self.config.retry_failed_cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.retry_failed(None).await {
                    error!(error = %err, "scheduled failed-candidate retry failed");
                }
            })
        })
        .with_context(|| {
            format!("creating retry job for cron {}", self.config.retry_failed_cron)
        })?;
        sched.add(retry).await.context("adding retry job")?;

        Ok(Some(sched))
    }
}

/// Apply the schema migrations to `DATABASE_URL`.
pub async fn migrate_from_env() -> Result<()> {
    let config = PipelineConfig::from_env();
    let store = PgLinkStore::connect(&config.database_url, 2)
        .await
        .context("connecting to the link store database")?;
    store.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}
