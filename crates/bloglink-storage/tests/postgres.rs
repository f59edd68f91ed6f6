//! Runs against a live database when `DATABASE_URL` is set; each test works in
//! its own throwaway schema. Without `DATABASE_URL` every test returns early.

use std::str::FromStr;
use std::time::Duration;

use bloglink_core::{CandidateState, LinkKind, SiteId};
use bloglink_storage::{
    FinishOutcome, LinkStore, NewCandidate, PgLinkStore, Resolution,
};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use uuid::Uuid;

const HOUR: Duration = Duration::from_secs(3600);

struct TestDb {
    admin: PgPool,
    schema: String,
    store: PgLinkStore,
}

impl TestDb {
    async fn drop_schema(self) {
        self.store.pool().close().await;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("drop test schema");
    }
}

async fn test_db() -> Option<TestDb> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres store test");
        return None;
    };
    let admin = PgPool::connect(&database_url).await.expect("connect admin pool");
    let schema = format!("bloglink_test_{}", Uuid::new_v4().simple());
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .expect("create test schema");

    let options = PgConnectOptions::from_str(&database_url)
        .expect("parse DATABASE_URL")
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .expect("connect test pool");
    let store = PgLinkStore::from_pool(pool);
    store.migrate().await.expect("apply migrations");
    Some(TestDb {
        admin,
        schema,
        store,
    })
}

async fn seed_candidates(store: &PgLinkStore, domains: &[&str]) -> SiteId {
    let source = store
        .upsert_site("A", "http://a.com/")
        .await
        .expect("seed site")
        .id;
    for domain in domains {
        store
            .record_candidate(&NewCandidate {
                url: format!("https://{domain}/"),
                domain: domain.to_string(),
                discovered_from_site_id: source,
                discovered_on_page: "http://a.com/".to_string(),
                kind: LinkKind::Homepage,
            })
            .await
            .expect("seed candidate");
    }
    source
}

#[tokio::test]
async fn concurrent_claims_take_different_rows() {
    let Some(db) = test_db().await else { return };
    seed_candidates(&db.store, &["b.com", "c.com"]).await;

    let (first, second) = tokio::join!(
        db.store.claim_next_candidate("w1", HOUR),
        db.store.claim_next_candidate("w2", HOUR)
    );
    let first = first.unwrap().expect("first claim");
    let second = second.unwrap().expect("second claim");
    assert_ne!(first.candidate.id, second.candidate.id);
    assert_ne!(first.claim_token, second.claim_token);
    assert!(db.store.claim_next_candidate("w3", HOUR).await.unwrap().is_none());

    let stats = db.store.queue_stats().await.unwrap();
    assert_eq!(stats.count(CandidateState::Processing), 2);
    db.drop_schema().await;
}

#[tokio::test]
async fn finish_after_stale_release_is_rejected() {
    let Some(db) = test_db().await else { return };
    seed_candidates(&db.store, &["b.com"]).await;

    let abandoned = db.store.claim_next_candidate("w1", HOUR).await.unwrap().unwrap();
    assert_eq!(db.store.release_stale_claims(Duration::ZERO).await.unwrap(), 1);
    assert_eq!(
        db.store
            .finish_claim(&abandoned, &Resolution::Reject, None)
            .await
            .unwrap(),
        FinishOutcome::Stale
    );

    let retry = db.store.claim_next_candidate("w2", HOUR).await.unwrap().unwrap();
    assert_eq!(retry.candidate.id, abandoned.candidate.id);
    assert_eq!(retry.candidate.attempts, 2);
    assert!(matches!(
        db.store
            .finish_claim(&retry, &Resolution::Reject, Some("abc123"))
            .await
            .unwrap(),
        FinishOutcome::Applied { site_id: None, .. }
    ));

    let done = db.store.get_candidate(retry.candidate.id).await.unwrap().unwrap();
    assert_eq!(done.state, CandidateState::Processed);
    assert_eq!(done.verdict_is_blog, Some(false));
    assert_eq!(done.evidence_sha256.as_deref(), Some("abc123"));
    db.drop_schema().await;
}

#[tokio::test]
async fn stale_takeover_promotes_once() {
    let Some(db) = test_db().await else { return };
    let source = seed_candidates(&db.store, &["b.com"]).await;

    let ghost = db.store.claim_next_candidate("w1", HOUR).await.unwrap().unwrap();
    let taker = db
        .store
        .claim_next_candidate("w2", Duration::ZERO)
        .await
        .unwrap()
        .expect("stale row is reclaimable");
    assert_eq!(taker.candidate.id, ghost.candidate.id);

    let promote = Resolution::Promote {
        name: "Bee".to_string(),
        url: "https://b.com/".to_string(),
    };
    assert!(matches!(
        db.store.finish_claim(&taker, &promote, None).await.unwrap(),
        FinishOutcome::Applied {
            site_created: true,
            edge_created: true,
            ..
        }
    ));
    assert_eq!(
        db.store.finish_claim(&ghost, &promote, None).await.unwrap(),
        FinishOutcome::Stale
    );

    let snapshot = db.store.graph_snapshot().await.unwrap();
    assert_eq!(snapshot.sites.len(), 2);
    assert_eq!(snapshot.edges.len(), 1);
    assert_eq!(snapshot.edges[0].source_site_id, source);
    db.drop_schema().await;
}

#[tokio::test]
async fn upsert_keeps_reviewed_flag_and_name() {
    let Some(db) = test_db().await else { return };
    let first = db.store.upsert_site("Alpha", "http://a.com/").await.unwrap();
    assert!(first.created);
    assert!(db.store.mark_reviewed(first.id).await.unwrap());

    let again = db.store.upsert_site("Renamed", "http://a.com/").await.unwrap();
    assert_eq!(again.id, first.id);
    assert!(!again.created);

    let site = db.store.get_site(first.id).await.unwrap().unwrap();
    assert!(site.reviewed);
    assert_eq!(site.name, "Alpha");
    assert!(db.store.list_unreviewed_sites(10).await.unwrap().is_empty());
    db.drop_schema().await;
}
