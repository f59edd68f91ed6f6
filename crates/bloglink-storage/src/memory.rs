//! In-process [`LinkStore`] with the same claim semantics as the Postgres store.
//!
//! Used by tests and single-process dry runs; every operation takes one lock,
//! which gives the same atomicity a single SQL statement would.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bloglink_core::{
    domain_of, CandidateId, CandidateState, ExternalCandidate, LinkEdge, Site, SiteId,
};
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    clamp_name, stale_cutoff, CandidateUpsert, ClaimedCandidate, FinishOutcome, GraphSnapshot,
    LinkStore, NewCandidate, NewEdge, QueueStats, Resolution, SiteUpsert, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_site_id: SiteId,
    next_edge_id: i64,
    next_candidate_id: CandidateId,
    sites: BTreeMap<SiteId, Site>,
    edges: Vec<LinkEdge>,
    candidates: BTreeMap<CandidateId, (ExternalCandidate, Option<Uuid>)>,
}

impl MemoryState {
    fn upsert_site(&mut self, name: &str, url: &str) -> Result<SiteUpsert, StoreError> {
        if let Some(site) = self.sites.values().find(|s| s.url == url) {
            return Ok(SiteUpsert {
                id: site.id,
                created: false,
            });
        }
        let domain = domain_of(url)?;
        self.next_site_id += 1;
        let id = self.next_site_id;
        self.sites.insert(
            id,
            Site {
                id,
                name: clamp_name(name),
                url: url.to_string(),
                domain,
                reviewed: false,
                created_at: Utc::now(),
            },
        );
        Ok(SiteUpsert { id, created: true })
    }

    fn insert_edge(&mut self, edge: &NewEdge) -> Result<bool, StoreError> {
        for id in [edge.source_site_id, edge.target_site_id] {
            if !self.sites.contains_key(&id) {
                return Err(StoreError::SiteNotFound(id));
            }
        }
        let exists = self.edges.iter().any(|e| {
            e.source_site_id == edge.source_site_id
                && e.target_site_id == edge.target_site_id
                && e.kind == edge.kind
                && e.page_url == edge.page_url
        });
        if exists {
            return Ok(false);
        }
        self.next_edge_id += 1;
        self.edges.push(LinkEdge {
            id: self.next_edge_id,
            source_site_id: edge.source_site_id,
            target_site_id: edge.target_site_id,
            kind: edge.kind,
            page_url: edge.page_url.clone(),
            created_at: Utc::now(),
        });
        Ok(true)
    }

    fn holds_claim(&self, claim: &ClaimedCandidate) -> bool {
        matches!(
            self.candidates.get(&claim.candidate.id),
            Some((row, Some(token)))
                if row.state == CandidateState::Processing && *token == claim.claim_token
        )
    }
}

#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    state: Mutex<MemoryState>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite `claimed_at` for a row; lets tests age a claim.
    pub async fn backdate_claim(&self, id: CandidateId, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some((row, _)) = state.candidates.get_mut(&id) {
            if let Some(at) = row.claimed_at {
                let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
                row.claimed_at = Some(at - by);
            }
        }
    }

    pub async fn edges(&self) -> Vec<LinkEdge> {
        self.state.lock().await.edges.clone()
    }

    pub async fn candidates(&self) -> Vec<ExternalCandidate> {
        self.state
            .lock()
            .await
            .candidates
            .values()
            .map(|(row, _)| row.clone())
            .collect()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn upsert_site(&self, name: &str, url: &str) -> Result<SiteUpsert, StoreError> {
        self.state.lock().await.upsert_site(name, url)
    }

    async fn find_site_by_url(&self, url: &str) -> Result<Option<SiteId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sites.values().find(|s| s.url == url).map(|s| s.id))
    }

    async fn find_site_by_domain(&self, domain: &str) -> Result<Option<SiteId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .values()
            .find(|s| s.domain == domain)
            .map(|s| s.id))
    }

    async fn get_site(&self, id: SiteId) -> Result<Option<Site>, StoreError> {
        Ok(self.state.lock().await.sites.get(&id).cloned())
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StoreError> {
        Ok(self.state.lock().await.sites.values().cloned().collect())
    }

    async fn sites_pending_extraction(&self) -> Result<Vec<Site>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .values()
            .filter(|s| {
                !state.edges.iter().any(|e| e.source_site_id == s.id)
                    && !state
                        .candidates
                        .values()
                        .any(|(c, _)| c.discovered_from_site_id == s.id)
            })
            .cloned()
            .collect())
    }

    async fn sites_without_outbound_links(&self) -> Result<Vec<Site>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .values()
            .filter(|s| !state.edges.iter().any(|e| e.source_site_id == s.id))
            .cloned()
            .collect())
    }

    async fn list_unreviewed_sites(&self, limit: usize) -> Result<Vec<Site>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .values()
            .filter(|s| !s.reviewed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_reviewed(&self, id: SiteId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(match state.sites.get_mut(&id) {
            Some(site) => {
                site.reviewed = true;
                true
            }
            None => false,
        })
    }

    async fn delete_site(&self, id: SiteId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.sites.remove(&id).is_none() {
            return Ok(false);
        }
        state
            .edges
            .retain(|e| e.source_site_id != id && e.target_site_id != id);
        state
            .candidates
            .retain(|_, (c, _)| c.discovered_from_site_id != id);
        Ok(true)
    }

    async fn insert_edge(&self, edge: &NewEdge) -> Result<bool, StoreError> {
        self.state.lock().await.insert_edge(edge)
    }

    async fn record_candidate(
        &self,
        candidate: &NewCandidate,
    ) -> Result<CandidateUpsert, StoreError> {
        let mut state = self.state.lock().await;
        if !state.sites.contains_key(&candidate.discovered_from_site_id) {
            return Err(StoreError::SiteNotFound(candidate.discovered_from_site_id));
        }
        let now = Utc::now();
        if let Some((row, _)) = state
            .candidates
            .values_mut()
            .find(|(c, _)| c.domain == candidate.domain)
        {
            row.last_seen_at = now;
            return Ok(CandidateUpsert {
                id: row.id,
                created: false,
            });
        }
        state.next_candidate_id += 1;
        let id = state.next_candidate_id;
        state.candidates.insert(
            id,
            (
                ExternalCandidate {
                    id,
                    url: candidate.url.clone(),
                    domain: candidate.domain.clone(),
                    discovered_from_site_id: candidate.discovered_from_site_id,
                    discovered_on_page: candidate.discovered_on_page.clone(),
                    kind: candidate.kind,
                    state: CandidateState::Unprocessed,
                    claimed_by: None,
                    claimed_at: None,
                    attempts: 0,
                    last_error: None,
                    verdict_is_blog: None,
                    evidence_sha256: None,
                    created_at: now,
                    last_seen_at: now,
                    finished_at: None,
                },
                None,
            ),
        );
        Ok(CandidateUpsert { id, created: true })
    }

    async fn get_candidate(&self, id: CandidateId) -> Result<Option<ExternalCandidate>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.candidates.get(&id).map(|(row, _)| row.clone()))
    }

    async fn find_candidate_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<ExternalCandidate>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .candidates
            .values()
            .find(|(c, _)| c.domain == domain)
            .map(|(row, _)| row.clone()))
    }

    async fn claim_next_candidate(
        &self,
        worker: &str,
        stale_after: Duration,
    ) -> Result<Option<ClaimedCandidate>, StoreError> {
        let mut state = self.state.lock().await;
        let cutoff = stale_cutoff(stale_after);
        let next = state.candidates.values_mut().find(|(c, _)| match c.state {
            CandidateState::Unprocessed => true,
            CandidateState::Processing => c.claimed_at.is_some_and(|at| at <= cutoff),
            _ => false,
        });
        let Some((row, token)) = next else {
            return Ok(None);
        };
        let claim_token = Uuid::new_v4();
        row.state = CandidateState::Processing;
        row.claimed_by = Some(worker.to_string());
        row.claimed_at = Some(Utc::now());
        row.attempts += 1;
        *token = Some(claim_token);
        Ok(Some(ClaimedCandidate {
            candidate: row.clone(),
            claim_token,
        }))
    }

    async fn finish_claim(
        &self,
        claim: &ClaimedCandidate,
        resolution: &Resolution,
        evidence_sha256: Option<&str>,
    ) -> Result<FinishOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds_claim(claim) {
            return Ok(FinishOutcome::Stale);
        }

        let source = claim.candidate.discovered_from_site_id;
        let (site_id, site_created, edge_created, next_state, verdict, error) = match resolution {
            Resolution::Promote { name, url } => {
                let upsert = state.upsert_site(name, url)?;
                let edge_created = upsert.id != source
                    && state.insert_edge(&NewEdge {
                        source_site_id: source,
                        target_site_id: upsert.id,
                        kind: claim.candidate.kind,
                        page_url: claim.candidate.discovered_on_page.clone(),
                    })?;
                (
                    Some(upsert.id),
                    upsert.created,
                    edge_created,
                    CandidateState::Processed,
                    Some(true),
                    None,
                )
            }
            Resolution::LinkExisting { site_id } => {
                let edge_created = *site_id != source
                    && state.insert_edge(&NewEdge {
                        source_site_id: source,
                        target_site_id: *site_id,
                        kind: claim.candidate.kind,
                        page_url: claim.candidate.discovered_on_page.clone(),
                    })?;
                (
                    Some(*site_id),
                    false,
                    edge_created,
                    CandidateState::Processed,
                    Some(true),
                    None,
                )
            }
            Resolution::Reject => (None, false, false, CandidateState::Processed, Some(false), None),
            Resolution::Fail { error } => (
                None,
                false,
                false,
                CandidateState::Failed,
                None,
                Some(error.clone()),
            ),
        };

        if let Some((row, token)) = state.candidates.get_mut(&claim.candidate.id) {
            row.state = next_state;
            row.verdict_is_blog = verdict;
            row.last_error = error;
            if let Some(sha) = evidence_sha256 {
                row.evidence_sha256 = Some(sha.to_string());
            }
            row.finished_at = Some(Utc::now());
            *token = None;
        }

        Ok(FinishOutcome::Applied {
            site_id,
            site_created,
            edge_created,
        })
    }

    async fn release_stale_claims(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let cutoff = stale_cutoff(stale_after);
        let mut released = 0;
        for (row, token) in state.candidates.values_mut() {
            if row.state == CandidateState::Processing
                && row.claimed_at.is_some_and(|at| at <= cutoff)
            {
                row.state = CandidateState::Unprocessed;
                row.claimed_by = None;
                row.claimed_at = None;
                *token = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn reset_failed(&self, limit: Option<usize>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut reset = 0u64;
        for (row, _) in state.candidates.values_mut() {
            if limit.is_some_and(|l| reset as usize >= l) {
                break;
            }
            if row.state == CandidateState::Failed {
                row.state = CandidateState::Unprocessed;
                row.claimed_by = None;
                row.claimed_at = None;
                row.finished_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for (row, _) in state.candidates.values() {
            *stats.by_state.entry(row.state.to_string()).or_default() += 1;
            if row.state == CandidateState::Processing {
                stats.oldest_processing_claim = match (stats.oldest_processing_claim, row.claimed_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        Ok(stats)
    }

    async fn graph_snapshot(&self) -> Result<GraphSnapshot, StoreError> {
        let state = self.state.lock().await;
        Ok(GraphSnapshot {
            sites: state.sites.values().cloned().collect(),
            edges: state.edges.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloglink_core::LinkKind;

    async fn seeded() -> (MemoryLinkStore, SiteId) {
        let store = MemoryLinkStore::new();
        let a = store.upsert_site("A", "http://a.com/").await.unwrap();
        (store, a.id)
    }

    fn candidate(source: SiteId, domain: &str) -> NewCandidate {
        NewCandidate {
            url: format!("http://{domain}/"),
            domain: domain.to_string(),
            discovered_from_site_id: source,
            discovered_on_page: "http://a.com/".to_string(),
            kind: LinkKind::Homepage,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_keeps_reviewed_flag() {
        let (store, a) = seeded().await;
        assert!(store.mark_reviewed(a).await.unwrap());

        let again = store.upsert_site("A renamed", "http://a.com/").await.unwrap();
        assert_eq!(again, SiteUpsert { id: a, created: false });

        let site = store.get_site(a).await.unwrap().unwrap();
        assert!(site.reviewed);
        assert_eq!(site.name, "A");
        assert_eq!(site.domain, "a.com");
        assert_eq!(store.list_sites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn candidates_are_unique_by_domain() {
        let (store, a) = seeded().await;
        let first = store.record_candidate(&candidate(a, "b.com")).await.unwrap();
        let mut other_page = candidate(a, "b.com");
        other_page.url = "http://b.com/about".into();
        let second = store.record_candidate(&other_page).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.candidates().await.len(), 1);
        assert_eq!(store.candidates().await[0].url, "http://b.com/");
    }

    #[tokio::test]
    async fn duplicate_edges_collapse_but_distinct_pages_do_not() {
        let (store, a) = seeded().await;
        let b = store.upsert_site("B", "http://b.com/").await.unwrap().id;
        let edge = NewEdge {
            source_site_id: a,
            target_site_id: b,
            kind: LinkKind::Homepage,
            page_url: "http://a.com/".into(),
        };
        assert!(store.insert_edge(&edge).await.unwrap());
        assert!(!store.insert_edge(&edge).await.unwrap());
        let friend = NewEdge {
            kind: LinkKind::FriendPage,
            page_url: "http://a.com/links".into(),
            ..edge
        };
        assert!(store.insert_edge(&friend).await.unwrap());
        assert_eq!(store.edges().await.len(), 2);
    }

    #[tokio::test]
    async fn delete_site_cascades_to_edges_and_candidates() {
        let (store, a) = seeded().await;
        let b = store.upsert_site("B", "http://b.com/").await.unwrap().id;
        store
            .insert_edge(&NewEdge {
                source_site_id: b,
                target_site_id: a,
                kind: LinkKind::Homepage,
                page_url: "http://b.com/".into(),
            })
            .await
            .unwrap();
        store.record_candidate(&candidate(a, "c.com")).await.unwrap();

        assert!(store.delete_site(a).await.unwrap());
        assert!(!store.delete_site(a).await.unwrap());
        assert!(store.edges().await.is_empty());
        assert!(store.candidates().await.is_empty());
        assert_eq!(store.list_sites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_outcome_recorded_once() {
        let (store, a) = seeded().await;
        store.record_candidate(&candidate(a, "b.com")).await.unwrap();
        let hour = Duration::from_secs(3600);

        let claim = store.claim_next_candidate("w1", hour).await.unwrap().unwrap();
        assert_eq!(claim.candidate.state, CandidateState::Processing);
        assert!(claim.candidate.claimed_at.is_some());
        assert!(store.claim_next_candidate("w2", hour).await.unwrap().is_none());

        let first = store
            .finish_claim(&claim, &Resolution::Reject, Some("abc"))
            .await
            .unwrap();
        assert!(matches!(first, FinishOutcome::Applied { .. }));
        let second = store
            .finish_claim(&claim, &Resolution::Fail { error: "late".into() }, None)
            .await
            .unwrap();
        assert_eq!(second, FinishOutcome::Stale);

        let row = store.get_candidate(claim.candidate.id).await.unwrap().unwrap();
        assert_eq!(row.state, CandidateState::Processed);
        assert_eq!(row.verdict_is_blog, Some(false));
        assert_eq!(row.evidence_sha256.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimable_and_old_holder_is_rejected() {
        let (store, a) = seeded().await;
        store.record_candidate(&candidate(a, "b.com")).await.unwrap();
        let hour = Duration::from_secs(3600);

        let old = store.claim_next_candidate("w1", hour).await.unwrap().unwrap();
        store.backdate_claim(old.candidate.id, Duration::from_secs(7200)).await;

        let fresh = store.claim_next_candidate("w2", hour).await.unwrap().unwrap();
        assert_eq!(fresh.candidate.id, old.candidate.id);
        assert_eq!(fresh.candidate.attempts, 2);

        assert_eq!(
            store.finish_claim(&old, &Resolution::Reject, None).await.unwrap(),
            FinishOutcome::Stale
        );
        let promoted = store
            .finish_claim(
                &fresh,
                &Resolution::Promote {
                    name: "B".into(),
                    url: "http://b.com/".into(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            promoted,
            FinishOutcome::Applied { site_created: true, edge_created: true, .. }
        ));
        assert_eq!(store.edges().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_rows_reset_and_stale_rows_release() {
        let (store, a) = seeded().await;
        store.record_candidate(&candidate(a, "b.com")).await.unwrap();
        store.record_candidate(&candidate(a, "c.com")).await.unwrap();
        let hour = Duration::from_secs(3600);

        let b = store.claim_next_candidate("w1", hour).await.unwrap().unwrap();
        store
            .finish_claim(&b, &Resolution::Fail { error: "timeout".into() }, None)
            .await
            .unwrap();
        let c = store.claim_next_candidate("w1", hour).await.unwrap().unwrap();
        store.backdate_claim(c.candidate.id, Duration::from_secs(7200)).await;

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.count(CandidateState::Failed), 1);
        assert_eq!(stats.count(CandidateState::Processing), 1);
        assert!(stats.oldest_processing_claim.is_some());

        assert_eq!(store.release_stale_claims(hour).await.unwrap(), 1);
        assert_eq!(store.reset_failed(None).await.unwrap(), 1);
        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.count(CandidateState::Unprocessed), 2);
    }

    #[tokio::test]
    async fn pending_and_zero_outlink_site_listings() {
        let (store, a) = seeded().await;
        let b = store.upsert_site("B", "http://b.com/").await.unwrap().id;
        store.upsert_site("C", "http://c.com/").await.unwrap();
        store.record_candidate(&candidate(a, "d.com")).await.unwrap();
        store
            .insert_edge(&NewEdge {
                source_site_id: b,
                target_site_id: a,
                kind: LinkKind::FriendPage,
                page_url: "http://b.com/friends".into(),
            })
            .await
            .unwrap();

        let pending: Vec<_> = store
            .sites_pending_extraction()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(pending, vec!["C"]);

        let zero: Vec<_> = store
            .sites_without_outbound_links()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(zero, vec!["A", "C"]);
    }
}
