//! Pipeline orchestration: ingestion, friend-link extraction, candidate
//! classification, graph analytics and the cron scheduler that drives them.

pub mod classify;
pub mod config;
pub mod extract;
pub mod features;
pub mod ingest;
pub mod judge;
pub mod pipeline;
pub mod report;

pub use classify::{ClassifierPool, ClassifyCounts, ClassifyOptions, ClassifySummary};
pub use config::{ExtractionRules, JudgeBackend, JudgeConfig, PipelineConfig};
pub use extract::{record_discovery, DiscoveryOutcome, ExtractScope, ExtractSummary, LinkExtractor};
pub use features::{fallback_site_name, summarize, SiteSummary};
pub use ingest::{IngestPass, IngestSummary, SourceOutcome};
pub use judge::{BlogJudge, FeatureJudge, JudgeError, LlmJudge, Verdict};
pub use pipeline::{migrate_from_env, AnalyticsRun, CrawlSummary, GraphStats, Pipeline};

pub const CRATE_NAME: &str = "bloglink-sync";
