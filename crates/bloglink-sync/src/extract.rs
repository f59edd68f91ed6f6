//! Friend-link extraction: homepage plus friend page, outbound anchors, and
//! the discovery entry point shared with external rescans.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use bloglink_core::{
    domain_of, homepage_of, normalize, normalize_with_base, CandidateId, Discovery, LinkKind, Site,
    SiteId,
};
use bloglink_storage::{
    FetchError, FetchedResponse, LinkStore, NewCandidate, NewEdge, PageFetcher, StoreError,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::config::ExtractionRules;

static REFRESH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\s*=\s*['"]?([^'"\s;]+)"#).expect("valid refresh regex")
});

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static css selector")
}

/// What recording one discovery did to the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The target is a known site; `created` is false when the edge already existed.
    Edge { target_site_id: SiteId, created: bool },
    /// The target is unknown and sits in the candidate queue.
    Candidate { id: CandidateId, created: bool },
    /// The target resolved to the discovering site itself.
    SelfLink,
}

/// Record an outbound link observed on a known site. A target matching a
/// site by exact URL, or failing that by domain, becomes an edge; anything
/// else is queued as an external candidate.
pub async fn record_discovery(
    store: &dyn LinkStore,
    discovery: &Discovery,
) -> Result<DiscoveryOutcome, StoreError> {
    let known = match store.find_site_by_url(&discovery.target_url).await? {
        Some(id) => Some(id),
        None => store.find_site_by_domain(&discovery.target_domain).await?,
    };

    if let Some(target_site_id) = known {
        if target_site_id == discovery.source_site_id {
            return Ok(DiscoveryOutcome::SelfLink);
        }
        let created = store
            .insert_edge(&NewEdge {
                source_site_id: discovery.source_site_id,
                target_site_id,
                kind: discovery.kind,
                page_url: discovery.page_url.clone(),
            })
            .await?;
        return Ok(DiscoveryOutcome::Edge {
            target_site_id,
            created,
        });
    }

    let upsert = store
        .record_candidate(&NewCandidate {
            url: discovery.target_url.clone(),
            domain: discovery.target_domain.clone(),
            discovered_from_site_id: discovery.source_site_id,
            discovered_on_page: discovery.page_url.clone(),
            kind: discovery.kind,
        })
        .await?;
    Ok(DiscoveryOutcome::Candidate {
        id: upsert.id,
        created: upsert.created,
    })
}

/// Canonical external links on a page. Same-domain links are dropped unless
/// they wrap an external URL in a redirect parameter; skip-listed domains
/// are dropped.
pub fn outbound_links(html: &str, page_url: &str, rules: &ExtractionRules) -> BTreeSet<String> {
    let mut links = BTreeSet::new();
    let Ok(own_domain) = domain_of(page_url) else {
        return links;
    };
    let document = Html::parse_document(html);
    for a in document.select(&sel("a[href]")) {
        let href = a.value().attr("href").unwrap_or_default().trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(url) = normalize_with_base(href, Some(page_url)) else {
            continue;
        };
        let Ok(domain) = domain_of(&url) else {
            continue;
        };
        if domain == own_domain {
            if let Some(wrapped) = unwrap_redirect(&url, rules) {
                if domain_of(&wrapped).is_ok_and(|d| d != own_domain && !rules.skips(&d)) {
                    links.insert(wrapped);
                }
            }
            continue;
        }
        if rules.skips(&domain) {
            continue;
        }
        links.insert(url);
    }
    links
}

/// External target hidden in a redirect query parameter such as `?url=`.
fn unwrap_redirect(url: &str, rules: &ExtractionRules) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    for param in &rules.redirect_params {
        for (key, value) in parsed.query_pairs() {
            if key.eq_ignore_ascii_case(param)
                && (value.starts_with("http://") || value.starts_with("https://"))
            {
                if let Ok(target) = normalize(&value) {
                    return Some(target);
                }
            }
        }
    }
    None
}

/// Target of a `<meta http-equiv="refresh">`, resolved against the page.
pub fn meta_refresh_target(html: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let content = document
        .select(&sel("meta[http-equiv][content]"))
        .find(|m| {
            m.value()
                .attr("http-equiv")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh"))
        })?
        .value()
        .attr("content")?
        .to_string();
    let target = REFRESH_URL.captures(&content)?.get(1)?.as_str();
    normalize_with_base(target, Some(page_url)).ok()
}

/// Friend-page URLs to try, in order: same-site anchors whose text or href
/// matches the friend vocabulary, then the fixed path list. Capped at
/// `max_friend_pages`.
pub fn friend_page_candidates(html: &str, page_url: &str, rules: &ExtractionRules) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let Ok(own_domain) = domain_of(page_url) else {
        return out;
    };
    let Ok(origin) = homepage_of(page_url) else {
        return out;
    };
    let page = normalize(page_url).unwrap_or_else(|_| page_url.to_string());
    let mut push = |url: String| {
        if url != page && url != origin && !out.contains(&url) {
            out.push(url);
        }
    };

    let document = Html::parse_document(html);
    for a in document.select(&sel("a[href]")) {
        let href = a.value().attr("href").unwrap_or_default().trim();
        let text = a.text().collect::<String>().trim().to_lowercase();
        let href_lower = href.to_lowercase();
        let matches = rules.friend_keywords.iter().any(|k| text.contains(&k.to_lowercase()))
            || rules
                .friend_href_keywords
                .iter()
                .any(|k| href_lower.contains(&k.to_lowercase()));
        if !matches {
            continue;
        }
        let Ok(url) = normalize_with_base(href, Some(page_url)) else {
            continue;
        };
        if domain_of(&url).is_ok_and(|d| d == own_domain) {
            push(url);
        }
    }
    for path in &rules.friend_paths {
        let path = format!("/{}", path.trim_start_matches('/'));
        if let Ok(url) = normalize_with_base(&path, Some(origin.as_str())) {
            push(url);
        }
    }

    out.truncate(rules.max_friend_pages);
    out
}

/// Which sites an extraction pass visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractScope {
    /// Sites with no edges and no candidates discovered from them.
    Pending,
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteExtraction {
    pub site_id: SiteId,
    pub friend_page: Option<String>,
    pub friend_pages_tried: usize,
    pub links: usize,
    pub edges_created: usize,
    pub edges_existing: usize,
    pub candidates_created: usize,
    pub candidates_seen: usize,
    pub store_errors: usize,
}

impl SiteExtraction {
    fn tally(&mut self, outcome: Result<DiscoveryOutcome, StoreError>) {
        match outcome {
            Ok(DiscoveryOutcome::Edge { created: true, .. }) => self.edges_created += 1,
            Ok(DiscoveryOutcome::Edge { created: false, .. }) => self.edges_existing += 1,
            Ok(DiscoveryOutcome::Candidate { created: true, .. }) => self.candidates_created += 1,
            Ok(DiscoveryOutcome::Candidate { created: false, .. }) => self.candidates_seen += 1,
            Ok(DiscoveryOutcome::SelfLink) => {}
            Err(err) => {
                warn!(site_id = self.site_id, error = %err, "recording discovery failed");
                self.store_errors += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scope: ExtractScope,
    pub sites: usize,
    pub sites_skipped: usize,
    pub friend_pages_found: usize,
    pub edges_created: usize,
    pub candidates_created: usize,
    pub candidates_seen: usize,
    pub store_errors: usize,
}

#[derive(Clone)]
pub struct LinkExtractor {
    store: Arc<dyn LinkStore>,
    http: Arc<dyn PageFetcher>,
    rules: Arc<ExtractionRules>,
    concurrency: usize,
}

impl LinkExtractor {
    pub fn new(
        store: Arc<dyn LinkStore>,
        http: Arc<dyn PageFetcher>,
        rules: Arc<ExtractionRules>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            http,
            rules,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(&self, scope: ExtractScope) -> Result<ExtractSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let sites = match scope {
            ExtractScope::Pending => self.store.sites_pending_extraction().await?,
            ExtractScope::All => self.store.list_sites().await?,
        };
        let span = info_span!("extract_pass", %run_id, sites = sites.len());

        let futures: Vec<_> = sites.iter().map(|site| self.extract_site(site)).collect();
        let results: Vec<Result<SiteExtraction, FetchError>> = stream::iter(futures)
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .instrument(span)
            .await;

        let mut summary = ExtractSummary {
            run_id,
            started_at,
            finished_at: started_at,
            scope,
            sites: sites.len(),
            sites_skipped: 0,
            friend_pages_found: 0,
            edges_created: 0,
            candidates_created: 0,
            candidates_seen: 0,
            store_errors: 0,
        };
        for result in results {
            match result {
                Ok(site) => {
                    summary.friend_pages_found += usize::from(site.friend_page.is_some());
                    summary.edges_created += site.edges_created;
                    summary.candidates_created += site.candidates_created;
                    summary.candidates_seen += site.candidates_seen;
                    summary.store_errors += site.store_errors;
                }
                Err(_) => summary.sites_skipped += 1,
            }
        }
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            sites = summary.sites,
            skipped = summary.sites_skipped,
            edges = summary.edges_created,
            candidates = summary.candidates_created,
            "extraction pass finished"
        );
        Ok(summary)
    }

    /// Fetch a page and follow one meta refresh on short pages.
    async fn fetch_page(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.http.fetch(scope, url).await?;
        response.ensure_page()?;
        if response.body.len() < self.rules.short_page_bytes {
            if let Some(target) = meta_refresh_target(&response.text(), &response.final_url) {
                if target != response.final_url {
                    debug!(from = %response.final_url, to = %target, "following meta refresh");
                    let followed = self.http.fetch(scope, &target).await?;
                    followed.ensure_page()?;
                    return Ok(followed);
                }
            }
        }
        Ok(response)
    }

    /// Homepage failure skips the site; friend-page failures only narrow it to
    /// homepage links.
    pub async fn extract_site(&self, site: &Site) -> Result<SiteExtraction, FetchError> {
        let mut report = SiteExtraction {
            site_id: site.id,
            ..Default::default()
        };
        let homepage = match self.fetch_page(&site.domain, &site.url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(site_id = site.id, url = %site.url, error = %err, "homepage fetch failed; skipping site");
                return Err(err);
            }
        };
        let home_html = homepage.text();
        let home_url = normalize(&homepage.final_url).unwrap_or_else(|_| site.url.clone());

        let links = outbound_links(&home_html, &home_url, &self.rules);
        report.links += links.len();
        self.record_all(site.id, &links, LinkKind::Homepage, &home_url, &mut report)
            .await;

        for candidate in friend_page_candidates(&home_html, &home_url, &self.rules) {
            report.friend_pages_tried += 1;
            let page = match self.fetch_page(&site.domain, &candidate).await {
                Ok(page) => page,
                Err(err) => {
                    debug!(site_id = site.id, url = %candidate, error = %err, "friend page unavailable");
                    continue;
                }
            };
            let page_url = normalize(&page.final_url).unwrap_or(candidate);
            let links = outbound_links(&page.text(), &page_url, &self.rules);
            if links.is_empty() {
                continue;
            }
            report.links += links.len();
            report.friend_page = Some(page_url.clone());
            self.record_all(site.id, &links, LinkKind::FriendPage, &page_url, &mut report)
                .await;
            if links.len() > self.rules.friend_page_min_links {
                break;
            }
        }

        debug!(
            site_id = site.id,
            links = report.links,
            edges = report.edges_created,
            candidates = report.candidates_created,
            "site extracted"
        );
        Ok(report)
    }

    async fn record_all(
        &self,
        site_id: SiteId,
        links: &BTreeSet<String>,
        kind: LinkKind,
        page_url: &str,
        report: &mut SiteExtraction,
    ) {
        for link in links {
            match Discovery::new(site_id, link, kind, page_url) {
                Ok(discovery) => report.tally(record_discovery(self.store.as_ref(), &discovery).await),
                Err(err) => debug!(url = %link, error = %err, "dropping invalid link"),
            }
        }
    }
}
