use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bloglink_core::{CandidateState, Discovery, LinkKind};
use bloglink_graph::SampleSize;
use bloglink_storage::{
    FetchError, FetchedResponse, FinishOutcome, LinkStore, MemoryLinkStore, PageFetcher,
    Resolution,
};
use bloglink_sync::{
    BlogJudge, DiscoveryOutcome, ExtractScope, ExtractionRules, JudgeError, Pipeline,
    PipelineConfig, SiteSummary, Verdict,
};
use tokio::sync::watch;

#[derive(Default)]
struct ScriptedFetcher {
    pages: HashMap<String, FetchedResponse>,
}

impl ScriptedFetcher {
    fn html(mut self, url: &str, body: &str) -> Self {
        self.pages
            .insert(url.to_string(), FetchedResponse::html(url, body));
        self
    }

    fn json(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("application/json".to_string()),
                body: body.as_bytes().to_vec(),
            },
        );
        self
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, _scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

enum Script {
    Blog(&'static str),
    NotBlog,
    Down,
}

struct ScriptedJudge {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BlogJudge for ScriptedJudge {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn judge(&self, _summary: &SiteSummary) -> Result<Verdict, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Blog(name) => Ok(Verdict {
                is_blog: true,
                name: Some(name.to_string()),
            }),
            Script::NotBlog => Ok(Verdict {
                is_blog: false,
                name: None,
            }),
            Script::Down => Err(JudgeError::Unavailable("judge down".to_string())),
        }
    }
}

const BLOG_HTML: &str = r#"<html><head><title>Bee Blog</title></head>
<body><article><h2><a href="/posts/1">First post</a></h2><time>2024-01-01</time></article></body></html>"#;

fn config_for(root: &Path) -> PipelineConfig {
    let root = root.to_string_lossy().into_owned();
    let evidence = format!("{root}/evidence");
    PipelineConfig::from_lookup(move |key| match key {
        "BLOGLINK_WORKSPACE_ROOT" => Some(root.clone()),
        "BLOGLINK_EVIDENCE_DIR" => Some(evidence.clone()),
        _ => None,
    })
}

fn pipeline(
    root: &Path,
    store: &Arc<MemoryLinkStore>,
    http: ScriptedFetcher,
    judge: Arc<ScriptedJudge>,
) -> Pipeline {
    Pipeline::new(
        config_for(root),
        store.clone(),
        Arc::new(http),
        judge,
        ExtractionRules::default(),
    )
}

fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn ingesting_twice_keeps_one_site_per_url_and_skips_unavailable_sources() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("sources.yaml"),
        r#"
sources:
  - source_id: dir-a
    display_name: Directory A
    url: https://dir-a.example/api
    transport:
      kind: json_api
  - source_id: dir-down
    display_name: Directory that is down
    url: https://dir-down.example/api
    transport:
      kind: json_api
  - source_id: dir-b
    display_name: Directory B
    url: https://dir-b.example/api
    transport:
      kind: json_api
"#,
    )
    .unwrap();
    let http = ScriptedFetcher::default()
        .json(
            "https://dir-a.example/api",
            r#"{"data":[{"name":"Alpha","url":"https://a.com"},{"name":"Alpha again","url":"https://A.com/"}]}"#,
        )
        .json(
            "https://dir-b.example/api",
            r#"[{"title":"Alpha","link":"a.com"},{"title":"Gamma","link":"https://c.com/"}]"#,
        );
    let store = Arc::new(MemoryLinkStore::new());
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::NotBlog));

    let first = pipeline.ingest().await.unwrap();
    assert_eq!(first.created(), 2);
    assert_eq!(first.entries(), 4);
    assert_eq!(first.unavailable_sources(), 1);
    let down = first
        .sources
        .iter()
        .find(|s| s.source_id == "dir-down")
        .unwrap();
    assert!(down.unavailable.is_some());
    assert_eq!(down.entries, 0);
    assert!(dir
        .path()
        .join("reports")
        .join(first.run_id.to_string())
        .join("summary.json")
        .exists());

    let second = pipeline.ingest().await.unwrap();
    assert_eq!(second.created(), 0);
    let sites = store.list_sites().await.unwrap();
    let urls: Vec<&str> = sites.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(urls, vec!["https://a.com/", "https://c.com/"]);
}

#[tokio::test]
async fn outbound_link_becomes_site_and_edge_after_classification() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let http = ScriptedFetcher::default()
        .html("https://a.com/", r#"<body><a href="https://b.com">B</a></body>"#)
        .html("https://b.com/", BLOG_HTML);
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::Blog("Bee Blog")));

    let extract = pipeline.extract(ExtractScope::Pending).await.unwrap();
    assert_eq!(extract.sites, 1);
    assert_eq!(extract.candidates_created, 1);
    assert_eq!(extract.edges_created, 0);

    let classify = pipeline.classify(Some(2), None, no_shutdown()).await.unwrap();
    assert_eq!(classify.counts.claimed, 1);
    assert_eq!(classify.counts.promoted, 1);
    assert_eq!(classify.counts.sites_created, 1);

    let b = store.find_site_by_domain("b.com").await.unwrap().unwrap();
    assert_eq!(store.get_site(b).await.unwrap().unwrap().name, "Bee Blog");
    let edges = store.edges().await;
    assert_eq!(edges.len(), 1);
    assert_eq!((edges[0].source_site_id, edges[0].target_site_id), (a, b));
    assert_eq!(edges[0].kind, LinkKind::Homepage);
    assert_eq!(edges[0].page_url, "https://a.com/");

    let candidate = store.find_candidate_by_domain("b.com").await.unwrap().unwrap();
    assert_eq!(candidate.state, CandidateState::Processed);
    assert_eq!(candidate.verdict_is_blog, Some(true));
    assert!(candidate.evidence_sha256.is_some());

    // A second extraction of A now records an edge instead of a candidate.
    let again = pipeline.extract(ExtractScope::All).await.unwrap();
    assert_eq!(again.candidates_created, 0);
    assert_eq!(store.edges().await.len(), 1);
}

#[tokio::test]
async fn judge_failure_parks_candidate_without_touching_sites() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let http = ScriptedFetcher::default().html("https://b.com/", BLOG_HTML);
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::Down));
    pipeline
        .discover(&Discovery::new(a, "https://b.com/", LinkKind::Homepage, "https://a.com/").unwrap())
        .await
        .unwrap();

    let summary = pipeline.classify(None, None, no_shutdown()).await.unwrap();
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.counts.promoted, 0);
    assert_eq!(store.list_sites().await.unwrap().len(), 1);
    assert!(store.edges().await.is_empty());

    let candidate = store.find_candidate_by_domain("b.com").await.unwrap().unwrap();
    assert_eq!(candidate.state, CandidateState::Failed);
    assert!(candidate.last_error.unwrap().contains("judge down"));

    assert_eq!(pipeline.retry_failed(None).await.unwrap(), 1);
    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats.count(CandidateState::Unprocessed), 1);
    assert_eq!(stats.count(CandidateState::Failed), 0);
}

#[tokio::test]
async fn rejected_candidate_is_processed_without_a_site() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let http = ScriptedFetcher::default().html("https://shop.com/", "<p>buy things</p>");
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::NotBlog));
    pipeline
        .discover(&Discovery::new(a, "https://shop.com/cart", LinkKind::Homepage, "https://a.com/").unwrap())
        .await
        .unwrap();

    let summary = pipeline.classify(None, None, no_shutdown()).await.unwrap();
    assert_eq!(summary.counts.rejected, 1);
    let candidate = store.find_candidate_by_domain("shop.com").await.unwrap().unwrap();
    assert_eq!(candidate.state, CandidateState::Processed);
    assert_eq!(candidate.verdict_is_blog, Some(false));
    assert_eq!(store.list_sites().await.unwrap().len(), 1);
}

#[tokio::test]
async fn many_workers_judge_each_candidate_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let mut http = ScriptedFetcher::default();
    for i in 0..12 {
        let url = format!("https://blog{i}.com/");
        http = http.html(&url, BLOG_HTML);
        store
            .record_candidate(&bloglink_storage::NewCandidate {
                url: url.clone(),
                domain: format!("blog{i}.com"),
                discovered_from_site_id: a,
                discovered_on_page: "https://a.com/links".to_string(),
                kind: LinkKind::FriendPage,
            })
            .await
            .unwrap();
    }
    let judge = ScriptedJudge::new(Script::Blog("Friend"));
    let pipeline = pipeline(dir.path(), &store, http, judge.clone());

    let summary = pipeline.classify(Some(8), None, no_shutdown()).await.unwrap();
    assert_eq!(summary.workers, 8);
    assert_eq!(summary.counts.claimed, 12);
    assert_eq!(summary.counts.promoted, 12);
    assert_eq!(summary.counts.stale, 0);
    assert_eq!(judge.calls.load(Ordering::SeqCst), 12);
    assert!(store
        .candidates()
        .await
        .iter()
        .all(|c| c.state == CandidateState::Processed && c.attempts == 1));
    let edges = store.edges().await;
    assert_eq!(edges.len(), 12);
    assert!(edges.iter().all(|e| e.kind == LinkKind::FriendPage));
}

#[tokio::test]
async fn classify_limit_caps_claims() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let mut http = ScriptedFetcher::default();
    for i in 0..5 {
        let url = format!("https://blog{i}.com/");
        http = http.html(&url, BLOG_HTML);
        pipeline_discover(&store, a, &url).await;
    }
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::NotBlog));

    let summary = pipeline.classify(Some(3), Some(2), no_shutdown()).await.unwrap();
    assert_eq!(summary.counts.claimed, 2);
    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats.count(CandidateState::Unprocessed), 3);
}

async fn pipeline_discover(store: &MemoryLinkStore, from: i64, url: &str) {
    let discovery = Discovery::new(from, url, LinkKind::Homepage, "https://a.com/").unwrap();
    let outcome = bloglink_sync::record_discovery(store, &discovery).await.unwrap();
    assert!(matches!(outcome, DiscoveryOutcome::Candidate { created: true, .. }));
}

#[tokio::test]
async fn abandoned_claim_is_taken_over_and_old_holder_cannot_finish() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let http = ScriptedFetcher::default().html("https://b.com/", BLOG_HTML);
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::Blog("Bee")));
    let outcome = pipeline
        .discover(&Discovery::new(a, "https://b.com/", LinkKind::FriendPage, "https://a.com/links").unwrap())
        .await
        .unwrap();
    let DiscoveryOutcome::Candidate { id, created: true } = outcome else {
        panic!("expected a new candidate, got {outcome:?}");
    };

    let ghost = store
        .claim_next_candidate("ghost", Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    let fresh = pipeline.classify(Some(2), None, no_shutdown()).await.unwrap();
    assert_eq!(fresh.counts.claimed, 0);

    store.backdate_claim(id, Duration::from_secs(2 * 3600)).await;
    let reclaimed = pipeline.classify(Some(2), None, no_shutdown()).await.unwrap();
    assert_eq!(reclaimed.counts.claimed, 1);
    assert_eq!(reclaimed.counts.promoted, 1);

    let late = store
        .finish_claim(&ghost, &Resolution::Reject, None)
        .await
        .unwrap();
    assert_eq!(late, FinishOutcome::Stale);
    let candidate = store.get_candidate(id).await.unwrap().unwrap();
    assert_eq!(candidate.state, CandidateState::Processed);
    assert_eq!(candidate.verdict_is_blog, Some(true));
    assert_eq!(candidate.attempts, 2);
}

#[tokio::test]
async fn release_stale_returns_old_claims_to_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    pipeline_discover(&store, a, "https://b.com/").await;
    let pipeline = pipeline(
        dir.path(),
        &store,
        ScriptedFetcher::default(),
        ScriptedJudge::new(Script::NotBlog),
    );
    let claim = store
        .claim_next_candidate("ghost", Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(pipeline.release_stale().await.unwrap(), 0);
    store
        .backdate_claim(claim.candidate.id, Duration::from_secs(7200))
        .await;
    assert_eq!(pipeline.release_stale().await.unwrap(), 1);
    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats.count(CandidateState::Unprocessed), 1);
    assert_eq!(stats.oldest_processing_claim, None);
}

#[tokio::test]
async fn unreachable_friend_page_falls_back_to_homepage_links() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    store.upsert_site("Alpha", "https://a.com/").await.unwrap();
    let http = ScriptedFetcher::default().html(
        "https://a.com/",
        r#"<body><a href="/blogroll">友情链接</a><a href="https://b.com/">B</a></body>"#,
    );
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::NotBlog));

    let summary = pipeline.extract(ExtractScope::All).await.unwrap();
    assert_eq!(summary.sites_skipped, 0);
    assert_eq!(summary.friend_pages_found, 0);
    assert_eq!(summary.candidates_created, 1);
    let candidate = store.find_candidate_by_domain("b.com").await.unwrap().unwrap();
    assert_eq!(candidate.kind, LinkKind::Homepage);
}

#[tokio::test]
async fn friend_page_links_are_recorded_with_friend_page_kind() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let a = store.upsert_site("Alpha", "https://a.com/").await.unwrap().id;
    let c = store.upsert_site("Cee", "https://c.com/").await.unwrap().id;
    let http = ScriptedFetcher::default()
        .html("https://a.com/", r#"<body><a href="/blogroll">Blogroll</a></body>"#)
        .html(
            "https://a.com/blogroll",
            r#"<ul><li><a href="https://c.com/">Cee</a></li><li><a href="https://d.com/">Dee</a></li></ul>"#,
        );
    let pipeline = pipeline(dir.path(), &store, http, ScriptedJudge::new(Script::NotBlog));

    let summary = pipeline.extract(ExtractScope::All).await.unwrap();
    assert_eq!(summary.friend_pages_found, 1);
    // c.com has no homepage scripted, so only a.com contributes links.
    assert_eq!(summary.sites_skipped, 1);
    let edges = store.edges().await;
    assert_eq!(edges.len(), 1);
    assert_eq!((edges[0].source_site_id, edges[0].target_site_id), (a, c));
    assert_eq!(edges[0].kind, LinkKind::FriendPage);
    assert_eq!(edges[0].page_url, "https://a.com/blogroll");
    let candidate = store.find_candidate_by_domain("d.com").await.unwrap().unwrap();
    assert_eq!(candidate.kind, LinkKind::FriendPage);
}

#[tokio::test]
async fn analytics_counts_unreachable_pairs_and_exports_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryLinkStore::new());
    let mut ids = Vec::new();
    for domain in ["a.com", "b.com", "c.com"] {
        let url = format!("https://{domain}/");
        ids.push(store.upsert_site(domain, &url).await.unwrap().id);
    }
    for pair in ids.windows(2) {
        store
            .insert_edge(&bloglink_storage::NewEdge {
                source_site_id: pair[0],
                target_site_id: pair[1],
                kind: LinkKind::Homepage,
                page_url: "https://a.com/".to_string(),
            })
            .await
            .unwrap();
    }
    let pipeline = pipeline(
        dir.path(),
        &store,
        ScriptedFetcher::default(),
        ScriptedJudge::new(Script::NotBlog),
    );

    let run = pipeline.analyze(SampleSize::All, 42).await.unwrap();
    assert_eq!(run.sampled_sources, 3);
    assert_eq!(run.histogram.count(1), 2);
    assert_eq!(run.histogram.count(2), 1);
    assert_eq!(run.histogram.unreachable, 3);
    assert_eq!(run.max_length, Some(2));
    assert!((run.connectivity_ratio - 0.5).abs() < 1e-9);
    assert_eq!(run.properties.nodes, 3);
    assert_eq!(run.properties.edges, 2);
    assert!(run.report_dir.join("summary.json").exists());
    assert!(run.report_dir.join("brief.md").exists());
    assert!(run.parquet_manifest.exists());
    assert!(run
        .report_dir
        .join("snapshots")
        .join("path_histogram.parquet")
        .exists());

    let err = pipeline.analyze(SampleSize::Fraction(1.5), 42).await;
    assert!(err.is_err());
}
