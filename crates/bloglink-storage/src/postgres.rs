//! PostgreSQL-backed [`LinkStore`].
//!
//! Cross-worker coordination happens entirely through the `state` and
//! `claim_token` columns of `external_candidates`: a claim is one
//! `UPDATE ... FOR UPDATE SKIP LOCKED` statement and every outcome is a
//! compare-and-swap on `(id, state = 'processing', claim_token)`.

use std::time::Duration;

use async_trait::async_trait;
use bloglink_core::{
    domain_of, CandidateId, CandidateState, ExternalCandidate, LinkEdge, Site, SiteId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{
    clamp_name, CandidateUpsert, ClaimedCandidate, FinishOutcome, GraphSnapshot, LinkStore,
    NewCandidate, NewEdge, QueueStats, Resolution, SiteUpsert, StoreError,
};

const CANDIDATE_COLUMNS: &str = "id, url, domain, discovered_from_site_id, discovered_on_page, \
     kind, state, claimed_by, claimed_at, attempts, last_error, verdict_is_blog, \
     evidence_sha256, created_at, last_seen_at, finished_at";

#[derive(Debug, sqlx::FromRow)]
struct SiteRow {
    id: i64,
    name: String,
    url: String,
    domain: String,
    reviewed: bool,
    created_at: DateTime<Utc>,
}

impl From<SiteRow> for Site {
    fn from(row: SiteRow) -> Self {
        Site {
            id: row.id,
            name: row.name,
            url: row.url,
            domain: row.domain,
            reviewed: row.reviewed,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EdgeRow {
    id: i64,
    source_site_id: i64,
    target_site_id: i64,
    kind: String,
    page_url: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EdgeRow> for LinkEdge {
    type Error = StoreError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        Ok(LinkEdge {
            id: row.id,
            source_site_id: row.source_site_id,
            target_site_id: row.target_site_id,
            kind: row.kind.parse()?,
            page_url: row.page_url,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    id: i64,
    url: String,
    domain: String,
    discovered_from_site_id: i64,
    discovered_on_page: String,
    kind: String,
    state: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    verdict_is_blog: Option<bool>,
    evidence_sha256: Option<String>,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<CandidateRow> for ExternalCandidate {
    type Error = StoreError;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        Ok(ExternalCandidate {
            id: row.id,
            url: row.url,
            domain: row.domain,
            discovered_from_site_id: row.discovered_from_site_id,
            discovered_on_page: row.discovered_on_page,
            kind: row.kind.parse()?,
            state: row.state.parse()?,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            attempts: row.attempts,
            last_error: row.last_error,
            verdict_is_blog: row.verdict_is_blog,
            evidence_sha256: row.evidence_sha256,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn upsert_site_in(
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
        url: &str,
    ) -> Result<SiteUpsert, StoreError> {
        let domain = domain_of(url)?;
        let (id, created): (i64, bool) = sqlx::query_as(
            "INSERT INTO sites (name, url, domain) VALUES ($1, $2, $3) \
             ON CONFLICT (url) DO UPDATE SET url = EXCLUDED.url \
             RETURNING id, (xmax = 0) AS created",
        )
        .bind(clamp_name(name))
        .bind(url)
        .bind(domain)
        .fetch_one(&mut **tx)
        .await?;
        Ok(SiteUpsert { id, created })
    }

    async fn insert_edge_in(
        tx: &mut Transaction<'_, Postgres>,
        edge: &NewEdge,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO link_edges (source_site_id, target_site_id, kind, page_url) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (source_site_id, target_site_id, kind, page_url) DO NOTHING",
        )
        .bind(edge.source_site_id)
        .bind(edge.target_site_id)
        .bind(edge.kind.as_str())
        .bind(&edge.page_url)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fetch_sites(&self, sql: &str) -> Result<Vec<Site>, StoreError> {
        let rows: Vec<SiteRow> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Site::from).collect())
    }
}

#[async_trait]
impl LinkStore for PgLinkStore {
    async fn upsert_site(&self, name: &str, url: &str) -> Result<SiteUpsert, StoreError> {
        let mut tx = self.pool.begin().await?;
        let upsert = Self::upsert_site_in(&mut tx, name, url).await?;
        tx.commit().await?;
        Ok(upsert)
    }

    async fn find_site_by_url(&self, url: &str) -> Result<Option<SiteId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM sites WHERE url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<SiteId>, StoreError> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM sites WHERE domain = $1 ORDER BY id LIMIT 1")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    async fn get_site(&self, id: SiteId) -> Result<Option<Site>, StoreError> {
        let row: Option<SiteRow> = sqlx::query_as(
            "SELECT id, name, url, domain, reviewed, created_at FROM sites WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Site::from))
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        self.fetch_sites("SELECT id, name, url, domain, reviewed, created_at FROM sites ORDER BY id")
            .await
    }

    async fn sites_pending_extraction(&self) -> Result<Vec<Site>, StoreError> {
        self.fetch_sites(
            "SELECT s.id, s.name, s.url, s.domain, s.reviewed, s.created_at FROM sites s \
             WHERE NOT EXISTS (SELECT 1 FROM link_edges e WHERE e.source_site_id = s.id) \
               AND NOT EXISTS (SELECT 1 FROM external_candidates c \
                               WHERE c.discovered_from_site_id = s.id) \
             ORDER BY s.id",
        )
        .await
    }

    async fn sites_without_outbound_links(&self) -> Result<Vec<Site>, StoreError> {
        self.fetch_sites(
            "SELECT s.id, s.name, s.url, s.domain, s.reviewed, s.created_at FROM sites s \
             LEFT JOIN link_edges e ON e.source_site_id = s.id \
             WHERE e.id IS NULL ORDER BY s.id",
        )
        .await
    }

    async fn list_unreviewed_sites(&self, limit: usize) -> Result<Vec<Site>, StoreError> {
        let rows: Vec<SiteRow> = sqlx::query_as(
            "SELECT id, name, url, domain, reviewed, created_at FROM sites \
             WHERE reviewed = FALSE ORDER BY id LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Site::from).collect())
    }

    async fn mark_reviewed(&self, id: SiteId) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sites SET reviewed = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_site(&self, id: SiteId) -> Result<bool, StoreError> {
        // Edges and discovered candidates go with the row via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM sites WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_edge(&self, edge: &NewEdge) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let created = Self::insert_edge_in(&mut tx, edge).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn record_candidate(
        &self,
        candidate: &NewCandidate,
    ) -> Result<CandidateUpsert, StoreError> {
        let (id, created): (i64, bool) = sqlx::query_as(
            "INSERT INTO external_candidates \
               (url, domain, discovered_from_site_id, discovered_on_page, kind) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (domain) DO UPDATE SET last_seen_at = now() \
             RETURNING id, (xmax = 0) AS created",
        )
        .bind(&candidate.url)
        .bind(&candidate.domain)
        .bind(candidate.discovered_from_site_id)
        .bind(&candidate.discovered_on_page)
        .bind(candidate.kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(CandidateUpsert { id, created })
    }

    async fn get_candidate(&self, id: CandidateId) -> Result<Option<ExternalCandidate>, StoreError> {
        let row: Option<CandidateRow> = sqlx::query_as(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM external_candidates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExternalCandidate::try_from).transpose()
    }

    async fn find_candidate_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<ExternalCandidate>, StoreError> {
        let row: Option<CandidateRow> = sqlx::query_as(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM external_candidates WHERE domain = $1"
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExternalCandidate::try_from).transpose()
    }

    async fn claim_next_candidate(
        &self,
        worker: &str,
        stale_after: Duration,
    ) -> Result<Option<ClaimedCandidate>, StoreError> {
        let claim_token = Uuid::new_v4();
        let row: Option<CandidateRow> = sqlx::query_as(&format!(
            "UPDATE external_candidates \
             SET state = 'processing', claim_token = $1, claimed_by = $2, \
                 claimed_at = now(), attempts = attempts + 1 \
             WHERE id = ( \
               SELECT id FROM external_candidates \
               WHERE state = 'unprocessed' \
                  OR (state = 'processing' AND claimed_at <= now() - make_interval(secs => $3)) \
               ORDER BY id LIMIT 1 \
               FOR UPDATE SKIP LOCKED) \
             RETURNING {CANDIDATE_COLUMNS}"
        ))
        .bind(claim_token)
        .bind(worker)
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let candidate = ExternalCandidate::try_from(row)?;
                debug!(candidate_id = candidate.id, worker, "claimed candidate");
                Ok(Some(ClaimedCandidate {
                    candidate,
                    claim_token,
                }))
            }
            None => Ok(None),
        }
    }

    async fn finish_claim(
        &self,
        claim: &ClaimedCandidate,
        resolution: &Resolution,
        evidence_sha256: Option<&str>,
    ) -> Result<FinishOutcome, StoreError> {
        let (next_state, verdict, error) = match resolution {
            Resolution::Promote { .. } | Resolution::LinkExisting { .. } => {
                (CandidateState::Processed, Some(true), None)
            }
            Resolution::Reject => (CandidateState::Processed, Some(false), None),
            Resolution::Fail { error } => (CandidateState::Failed, None, Some(error.as_str())),
        };

        let mut tx = self.pool.begin().await?;
        let swapped = sqlx::query(
            "UPDATE external_candidates \
             SET state = $3, verdict_is_blog = $4, last_error = $5, \
                 evidence_sha256 = COALESCE($6, evidence_sha256), \
                 finished_at = now(), claim_token = NULL \
             WHERE id = $1 AND state = 'processing' AND claim_token = $2",
        )
        .bind(claim.candidate.id)
        .bind(claim.claim_token)
        .bind(next_state.as_str())
        .bind(verdict)
        .bind(error)
        .bind(evidence_sha256)
        .execute(&mut *tx)
        .await?;

        if swapped.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(FinishOutcome::Stale);
        }

        let source = claim.candidate.discovered_from_site_id;
        let target = match resolution {
            Resolution::Promote { name, url } => Some(Self::upsert_site_in(&mut tx, name, url).await?),
            Resolution::LinkExisting { site_id } => Some(SiteUpsert {
                id: *site_id,
                created: false,
            }),
            Resolution::Reject | Resolution::Fail { .. } => None,
        };

        let mut edge_created = false;
        if let Some(target) = target {
            if target.id != source {
                edge_created = Self::insert_edge_in(
                    &mut tx,
                    &NewEdge {
                        source_site_id: source,
                        target_site_id: target.id,
                        kind: claim.candidate.kind,
                        page_url: claim.candidate.discovered_on_page.clone(),
                    },
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(FinishOutcome::Applied {
            site_id: target.map(|t| t.id),
            site_created: target.is_some_and(|t| t.created),
            edge_created,
        })
    }

    async fn release_stale_claims(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE external_candidates \
             SET state = 'unprocessed', claim_token = NULL, claimed_by = NULL, claimed_at = NULL \
             WHERE state = 'processing' AND claimed_at <= now() - make_interval(secs => $1)",
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_failed(&self, limit: Option<usize>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE external_candidates \
             SET state = 'unprocessed', claimed_by = NULL, claimed_at = NULL, finished_at = NULL \
             WHERE id IN (SELECT id FROM external_candidates WHERE state = 'failed' \
                          ORDER BY id LIMIT $1)",
        )
        .bind(limit.map(|l| l as i64))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM external_candidates GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(claimed_at) FROM external_candidates WHERE state = 'processing'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            by_state: counts
                .into_iter()
                .map(|(state, count)| (state, count.max(0) as u64))
                .collect(),
            oldest_processing_claim: oldest,
        })
    }

    async fn graph_snapshot(&self) -> Result<GraphSnapshot, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let sites: Vec<SiteRow> = sqlx::query_as(
            "SELECT id, name, url, domain, reviewed, created_at FROM sites ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;
        let edges: Vec<EdgeRow> = sqlx::query_as(
            "SELECT id, source_site_id, target_site_id, kind, page_url, created_at \
             FROM link_edges ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(GraphSnapshot {
            sites: sites.into_iter().map(Site::from).collect(),
            edges: edges
                .into_iter()
                .map(LinkEdge::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}
