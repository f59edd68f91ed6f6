//! Classifier worker pool over the external candidate queue.
//!
//! Workers coordinate only through the store: each loop iteration claims one
//! candidate, decides it, and records the outcome against the claim token.
//! A worker whose claim went stale in the meantime gets `FinishOutcome::Stale`
//! and writes nothing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bloglink_core::homepage_of;
use bloglink_storage::store::clamp_name;
use bloglink_storage::{
    ClaimedCandidate, EvidenceStore, FinishOutcome, LinkStore, PageFetcher, Resolution,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::features::{fallback_site_name, summarize};
use crate::judge::BlogJudge;

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    pub workers: usize,
    pub stale_after: Duration,
    /// Stop after this many claims across all workers.
    pub limit: Option<usize>,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            stale_after: Duration::from_secs(3600),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyCounts {
    pub claimed: usize,
    pub promoted: usize,
    pub sites_created: usize,
    pub edges_created: usize,
    pub linked_existing: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Outcomes dropped because the claim had been taken over.
    pub stale: usize,
    pub store_errors: usize,
}

impl ClassifyCounts {
    fn merge(&mut self, other: &ClassifyCounts) {
        self.claimed += other.claimed;
        self.promoted += other.promoted;
        self.sites_created += other.sites_created;
        self.edges_created += other.edges_created;
        self.linked_existing += other.linked_existing;
        self.rejected += other.rejected;
        self.failed += other.failed;
        self.stale += other.stale;
        self.store_errors += other.store_errors;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifySummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workers: usize,
    pub judge: String,
    #[serde(flatten)]
    pub counts: ClassifyCounts,
}

#[derive(Clone)]
pub struct ClassifierPool {
    store: Arc<dyn LinkStore>,
    http: Arc<dyn PageFetcher>,
    judge: Arc<dyn BlogJudge>,
    evidence: Option<EvidenceStore>,
    options: ClassifyOptions,
}

impl ClassifierPool {
    pub fn new(
        store: Arc<dyn LinkStore>,
        http: Arc<dyn PageFetcher>,
        judge: Arc<dyn BlogJudge>,
        options: ClassifyOptions,
    ) -> Self {
        Self {
            store,
            http,
            judge,
            evidence: None,
            options,
        }
    }

    /// Keep fetched homepages as evidence next to the recorded hash.
    pub fn with_evidence(mut self, evidence: EvidenceStore) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Run workers until the queue is drained, the limit is reached, or
    /// `shutdown` flips to true. Workers always finish their current candidate.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> ClassifySummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let workers = self.options.workers.max(1);
        let taken = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();

        info!(%run_id, workers, judge = self.judge.name(), "classification pass starting");
        for index in 0..workers {
            let pool = self.clone();
            let worker = format!("{}-w{index}", &run_id.simple().to_string()[..8]);
            let shutdown = shutdown.clone();
            let taken = taken.clone();
            let span = info_span!("classifier_worker", worker = %worker);
            set.spawn(
                async move { pool.worker_loop(&worker, shutdown, taken).await }.instrument(span),
            );
        }

        let mut counts = ClassifyCounts::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(worker_counts) => counts.merge(&worker_counts),
                Err(err) => error!(error = %err, "classifier worker panicked"),
            }
        }

        let summary = ClassifySummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            workers,
            judge: self.judge.name().to_string(),
            counts,
        };
        info!(
            %run_id,
            claimed = summary.counts.claimed,
            promoted = summary.counts.promoted,
            rejected = summary.counts.rejected,
            failed = summary.counts.failed,
            stale = summary.counts.stale,
            "classification pass finished"
        );
        summary
    }

    async fn worker_loop(
        &self,
        worker: &str,
        shutdown: watch::Receiver<bool>,
        taken: Arc<AtomicUsize>,
    ) -> ClassifyCounts {
        let mut counts = ClassifyCounts::default();
        loop {
            if *shutdown.borrow() {
                debug!("shutdown requested");
                break;
            }
            if let Some(limit) = self.options.limit {
                if taken.fetch_add(1, Ordering::SeqCst) >= limit {
                    break;
                }
            }
            let claim = match self
                .store
                .claim_next_candidate(worker, self.options.stale_after)
                .await
            {
                Ok(Some(claim)) => claim,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "claiming candidate failed");
                    counts.store_errors += 1;
                    break;
                }
            };
            counts.claimed += 1;
            self.process(&claim, &mut counts).await;
        }
        counts
    }

    async fn process(&self, claim: &ClaimedCandidate, counts: &mut ClassifyCounts) {
        let candidate = &claim.candidate;
        let (resolution, evidence) = self.decide(claim).await;
        if let Resolution::Fail { error } = &resolution {
            warn!(candidate_id = candidate.id, url = %candidate.url, error = %error, "candidate failed");
        }

        match self
            .store
            .finish_claim(claim, &resolution, evidence.as_deref())
            .await
        {
            Ok(FinishOutcome::Stale) => {
                warn!(candidate_id = candidate.id, "claim was taken over; outcome dropped");
                counts.stale += 1;
            }
            Ok(FinishOutcome::Applied {
                site_id,
                site_created,
                edge_created,
            }) => {
                counts.sites_created += usize::from(site_created);
                counts.edges_created += usize::from(edge_created);
                match resolution {
                    Resolution::Promote { .. } => counts.promoted += 1,
                    Resolution::LinkExisting { .. } => counts.linked_existing += 1,
                    Resolution::Reject => counts.rejected += 1,
                    Resolution::Fail { .. } => counts.failed += 1,
                }
                debug!(candidate_id = candidate.id, ?site_id, "candidate finished");
            }
            Err(err) => {
                error!(candidate_id = candidate.id, error = %err, "recording outcome failed");
                counts.store_errors += 1;
            }
        }
    }

    /// Decide one candidate. Never errors: every failure becomes `Resolution::Fail`.
    async fn decide(&self, claim: &ClaimedCandidate) -> (Resolution, Option<String>) {
        let candidate = &claim.candidate;
        let fail = |error: String| (Resolution::Fail { error }, None);

        let homepage = match homepage_of(&candidate.url) {
            Ok(url) => url,
            Err(err) => return fail(err.to_string()),
        };

        let existing = match self.store.find_site_by_url(&homepage).await {
            Ok(Some(id)) => Ok(Some(id)),
            Ok(None) => self.store.find_site_by_domain(&candidate.domain).await,
            Err(err) => Err(err),
        };
        match existing {
            Ok(Some(site_id)) => return (Resolution::LinkExisting { site_id }, None),
            Ok(None) => {}
            Err(err) => return fail(err.to_string()),
        }

        let page = match self.http.fetch(&candidate.domain, &homepage).await {
            Ok(page) => page,
            Err(err) => return fail(err.to_string()),
        };
        if let Err(err) = page.ensure_page() {
            return fail(err.to_string());
        }

        let evidence = EvidenceStore::sha256_hex(&page.body);
        if let Some(store) = &self.evidence {
            if let Err(err) = store.store_page(&candidate.domain, &page.body).await {
                warn!(candidate_id = candidate.id, error = %err, "storing evidence failed");
            }
        }

        let summary = summarize(&page.text(), &page.final_url);
        match self.judge.judge(&summary).await {
            Ok(verdict) if verdict.is_blog => {
                let name = verdict
                    .name
                    .map(|n| clamp_name(&n))
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| fallback_site_name(summary.title.as_deref(), &homepage));
                (
                    Resolution::Promote {
                        name,
                        url: homepage,
                    },
                    Some(evidence),
                )
            }
            Ok(_) => (Resolution::Reject, Some(evidence)),
            Err(err) => (
                Resolution::Fail {
                    error: err.to_string(),
                },
                Some(evidence),
            ),
        }
    }
}
