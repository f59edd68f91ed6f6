use std::sync::Arc;

use bloglink_adapters::{adapter_for_source, pages, SourceAdapter, SourceConfig, SourceError};
use bloglink_core::{normalize, RawSiteEntry};
use bloglink_storage::{LinkStore, PageFetcher};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Per-source ingestion counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub pages: usize,
    pub entries: usize,
    pub created: usize,
    pub existing: usize,
    /// Entries whose URL could not be normalized.
    pub invalid: usize,
    /// Records the adapter could not read.
    pub skipped: usize,
    pub store_errors: usize,
    /// Set when the source was abandoned for this run.
    pub unavailable: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
}

impl IngestSummary {
    pub fn created(&self) -> usize {
        self.sources.iter().map(|s| s.created).sum()
    }

    pub fn entries(&self) -> usize {
        self.sources.iter().map(|s| s.entries).sum()
    }

    pub fn unavailable_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.unavailable.is_some()).count()
    }
}

/// Bulk ingestion from every configured source into the site store.
pub struct IngestPass {
    store: Arc<dyn LinkStore>,
    http: Arc<dyn PageFetcher>,
}

impl IngestPass {
    pub fn new(store: Arc<dyn LinkStore>, http: Arc<dyn PageFetcher>) -> Self {
        Self { store, http }
    }

    pub async fn run<'a>(&self, sources: impl IntoIterator<Item = &'a SourceConfig>) -> IngestSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut outcomes = Vec::new();
        for source in sources {
            let outcome = match adapter_for_source(source) {
                Ok(adapter) => {
                    let span = info_span!("ingest_source", %run_id, source_id = %source.source_id);
                    self.ingest_source(adapter.as_ref()).instrument(span).await
                }
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "source misconfigured; skipping");
                    SourceOutcome {
                        source_id: source.source_id.clone(),
                        unavailable: Some(err.to_string()),
                        ..Default::default()
                    }
                }
            };
            outcomes.push(outcome);
        }
        let summary = IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: outcomes,
        };
        info!(
            %run_id,
            entries = summary.entries(),
            created = summary.created(),
            unavailable = summary.unavailable_sources(),
            "ingestion finished"
        );
        summary
    }

    /// Walk one source page by page. A failing page ends the source for this
    /// run; sites already stored from earlier pages stay.
    pub async fn ingest_source(&self, adapter: &dyn SourceAdapter) -> SourceOutcome {
        let mut outcome = SourceOutcome {
            source_id: adapter.source_id().to_string(),
            ..Default::default()
        };
        let mut stream = pages(adapter, self.http.as_ref());
        while let Some(page) = stream.next().await {
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    let reason = match &err {
                        SourceError::Unavailable { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    warn!(source_id = %outcome.source_id, error = %err, "source unavailable; skipping for this run");
                    outcome.unavailable = Some(reason);
                    break;
                }
            };
            outcome.pages += 1;
            outcome.skipped += page.skipped;
            for entry in &page.entries {
                self.ingest_entry(entry, &mut outcome).await;
            }
        }
        info!(
            source_id = %outcome.source_id,
            pages = outcome.pages,
            entries = outcome.entries,
            created = outcome.created,
            "source ingested"
        );
        outcome
    }

    async fn ingest_entry(&self, entry: &RawSiteEntry, outcome: &mut SourceOutcome) {
        outcome.entries += 1;
        let url = match normalize(&entry.url) {
            Ok(url) => url,
            Err(err) => {
                debug!(url = %entry.url, error = %err, "dropping invalid url");
                outcome.invalid += 1;
                return;
            }
        };
        match self.store.upsert_site(&entry.name, &url).await {
            Ok(upsert) if upsert.created => outcome.created += 1,
            Ok(_) => outcome.existing += 1,
            Err(err) => {
                warn!(url = %url, error = %err, "storing site failed");
                outcome.store_errors += 1;
            }
        }
    }
}
