//! Persistence contract for sites, link edges and the external candidate queue.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bloglink_core::{
    CandidateId, CandidateState, ExternalCandidate, LinkEdge, LinkKind, NormalizeError, Site,
    SiteId, UnknownVariant,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    InvalidUrl(#[from] NormalizeError),
    #[error("corrupt row: {0}")]
    Decode(#[from] UnknownVariant),
    #[error("site {0} not found")]
    SiteNotFound(SiteId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteUpsert {
    pub id: SiteId,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateUpsert {
    pub id: CandidateId,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEdge {
    pub source_site_id: SiteId,
    pub target_site_id: SiteId,
    pub kind: LinkKind,
    pub page_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCandidate {
    pub url: String,
    pub domain: String,
    pub discovered_from_site_id: SiteId,
    pub discovered_on_page: String,
    pub kind: LinkKind,
}

/// A candidate held in `processing` by one worker. Only the holder of
/// `claim_token` can record its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedCandidate {
    pub candidate: ExternalCandidate,
    pub claim_token: Uuid,
}

/// Decision recorded for a claimed candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Judged a blog: upsert the site and link it from the discovering site.
    Promote { name: String, url: String },
    /// Target already known as a site: only add the edge.
    LinkExisting { site_id: SiteId },
    /// Judged not a blog.
    Reject,
    /// Transport or judgment failure; parked as `failed`.
    Fail { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Applied {
        site_id: Option<SiteId>,
        site_created: bool,
        edge_created: bool,
    },
    /// The claim was lost (reclaimed as stale, or the row is gone); nothing written.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub by_state: BTreeMap<String, u64>,
    pub oldest_processing_claim: Option<chrono::DateTime<chrono::Utc>>,
}

impl QueueStats {
    pub fn count(&self, state: CandidateState) -> u64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Read-only copy of the graph relations for analytics.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub sites: Vec<Site>,
    pub edges: Vec<LinkEdge>,
}

#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Idempotent on `url`. Never touches `reviewed` or the name of an existing row.
    async fn upsert_site(&self, name: &str, url: &str) -> Result<SiteUpsert, StoreError>;
    async fn find_site_by_url(&self, url: &str) -> Result<Option<SiteId>, StoreError>;
    /// Lowest id among sites on `domain`.
    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<SiteId>, StoreError>;
    async fn get_site(&self, id: SiteId) -> Result<Option<Site>, StoreError>;
    async fn list_sites(&self) -> Result<Vec<Site>, StoreError>;
    /// Sites with neither outgoing edges nor candidates discovered from them.
    async fn sites_pending_extraction(&self) -> Result<Vec<Site>, StoreError>;
    /// Sites with zero outgoing edges.
    async fn sites_without_outbound_links(&self) -> Result<Vec<Site>, StoreError>;
    async fn list_unreviewed_sites(&self, limit: usize) -> Result<Vec<Site>, StoreError>;
    async fn mark_reviewed(&self, id: SiteId) -> Result<bool, StoreError>;
    /// Removes the site with its edges (both directions) and the candidates it discovered.
    async fn delete_site(&self, id: SiteId) -> Result<bool, StoreError>;

    /// Returns `true` when a new edge row was written.
    async fn insert_edge(&self, edge: &NewEdge) -> Result<bool, StoreError>;
    /// Unique by domain; re-discovery only refreshes `last_seen_at`.
    async fn record_candidate(&self, candidate: &NewCandidate)
        -> Result<CandidateUpsert, StoreError>;
    async fn get_candidate(&self, id: CandidateId) -> Result<Option<ExternalCandidate>, StoreError>;
    async fn find_candidate_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<ExternalCandidate>, StoreError>;

    /// Atomically move the oldest `unprocessed` row (or a `processing` row
    /// claimed longer than `stale_after` ago) to `processing`.
    async fn claim_next_candidate(
        &self,
        worker: &str,
        stale_after: Duration,
    ) -> Result<Option<ClaimedCandidate>, StoreError>;
    /// Record the outcome if and only if `claim` is still held.
    async fn finish_claim(
        &self,
        claim: &ClaimedCandidate,
        resolution: &Resolution,
        evidence_sha256: Option<&str>,
    ) -> Result<FinishOutcome, StoreError>;
    async fn release_stale_claims(&self, stale_after: Duration) -> Result<u64, StoreError>;
    async fn reset_failed(&self, limit: Option<usize>) -> Result<u64, StoreError>;
    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;

    async fn graph_snapshot(&self) -> Result<GraphSnapshot, StoreError>;
}

/// Display name capped the way the `sites.name` column expects.
pub fn clamp_name(name: &str) -> String {
    let trimmed = name.trim();
    match trimmed.char_indices().nth(255) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

pub(crate) fn stale_cutoff(stale_after: Duration) -> chrono::DateTime<chrono::Utc> {
    let stale = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    chrono::Utc::now()
        .checked_sub_signed(stale)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}
