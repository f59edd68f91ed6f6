//! Source adapter contract and the four listing transports (JSON API, HTML
//! table, HTML member list, CSV export) that feed raw (name, URL) pairs into
//! ingestion.

use std::path::Path;

use async_trait::async_trait;
use bloglink_core::RawSiteEntry;
use bloglink_storage::PageFetcher;
use futures::stream::{self, BoxStream, StreamExt};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod csv_export;
mod html;
mod json_api;

pub use csv_export::CsvAdapter;
pub use html::{HtmlListAdapter, HtmlTableAdapter};
pub use json_api::JsonApiAdapter;

pub const CRATE_NAME: &str = "bloglink-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: String, reason: String },
    #[error("source {source_id} returned an unreadable page {url}: {reason}")]
    Parse {
        source_id: String,
        url: String,
        reason: String,
    },
    #[error("invalid configuration for source {source_id}: {reason}")]
    Config { source_id: String, reason: String },
    #[error("invalid css selector `{0}`")]
    Selector(String),
}

impl SourceError {
    fn parse(source_id: &str, url: &str, reason: impl Into<String>) -> Self {
        SourceError::Parse {
            source_id: source_id.to_string(),
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// One page of a listing to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub url: String,
    pub page: u32,
}

impl PageRequest {
    pub fn first(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            page: 1,
        }
    }
}

/// Entries found on one page, the number of records that could not be read,
/// and the page to fetch next when the listing continues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub entries: Vec<RawSiteEntry>,
    pub skipped: usize,
    pub next: Option<PageRequest>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn transport(&self) -> &'static str;
    fn first_page(&self) -> PageRequest;

    /// Parse a fetched page body. Individual unreadable records are counted in
    /// `skipped`; an error means the page as a whole is unusable.
    fn parse_page(&self, request: &PageRequest, body: &[u8]) -> Result<ParsedPage, SourceError>;

    async fn fetch_page(
        &self,
        http: &dyn PageFetcher,
        request: &PageRequest,
    ) -> Result<Vec<u8>, SourceError> {
        http.fetch(self.source_id(), &request.url)
            .await
            .map(|resp| resp.body)
            .map_err(|err| SourceError::Unavailable {
                source_id: self.source_id().to_string(),
                reason: err.to_string(),
            })
    }
}

/// Lazily walk a listing page by page. The stream ends after the last page or
/// at the first error.
pub fn pages<'a>(
    adapter: &'a dyn SourceAdapter,
    http: &'a dyn PageFetcher,
) -> BoxStream<'a, Result<ParsedPage, SourceError>> {
    stream::try_unfold(Some(adapter.first_page()), move |next| async move {
        let Some(request) = next else {
            return Ok::<_, SourceError>(None);
        };
        let body = adapter.fetch_page(http, &request).await?;
        let page = adapter.parse_page(&request, &body)?;
        debug!(
            source_id = adapter.source_id(),
            page = request.page,
            entries = page.entries.len(),
            skipped = page.skipped,
            "parsed listing page"
        );
        let following = page.next.clone();
        Ok(Some((page, following)))
    })
    .boxed()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    JsonApi(JsonApiOptions),
    HtmlTable(HtmlTableOptions),
    HtmlList(HtmlListOptions),
    Csv(CsvOptions),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonApiOptions {
    /// JSON pointers tried in order; the first one resolving to an array wins.
    pub items_pointers: Vec<String>,
    pub name_keys: Vec<String>,
    pub url_keys: Vec<String>,
    pub pagination: Pagination,
}

impl Default for JsonApiOptions {
    fn default() -> Self {
        Self {
            items_pointers: ["/data/data", "/data", "/sites", "/items", ""]
                .map(String::from)
                .to_vec(),
            name_keys: ["name", "title", "blogName"].map(String::from).to_vec(),
            url_keys: ["url", "link", "homepage"].map(String::from).to_vec(),
            pagination: Pagination::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum Pagination {
    #[default]
    None,
    /// Page N (N > 1) lives at `{url}/{N}`; continue while `more_flag` is true.
    PathSuffix {
        #[serde(default = "default_more_flag")]
        more_flag: String,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
    },
}

fn default_more_flag() -> String {
    "has_more_page".to_string()
}

fn default_max_pages() -> u32 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlTableOptions {
    pub exclude_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlListOptions {
    pub exclude_domains: Vec<String>,
    /// Containers tried in order; links are collected from the first match.
    pub container_selectors: Vec<String>,
}

impl Default for HtmlListOptions {
    fn default() -> Self {
        Self {
            exclude_domains: Vec::new(),
            container_selectors: ["main", "div.content", "#content", "body"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub name_columns: Vec<String>,
    pub url_columns: Vec<String>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            name_columns: ["Introduction", "name", "title"].map(String::from).to_vec(),
            url_columns: ["Address", "url", "link", "homepage"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Build the adapter for a configured source.
pub fn adapter_for_source(config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, SourceError> {
    if url::Url::parse(&config.url).is_err() {
        return Err(SourceError::Config {
            source_id: config.source_id.clone(),
            reason: format!("listing url `{}` is not absolute", config.url),
        });
    }
    let source_id = config.source_id.clone();
    let url = config.url.clone();
    Ok(match &config.transport {
        TransportConfig::JsonApi(options) => {
            Box::new(JsonApiAdapter::new(source_id, url, options.clone()))
        }
        TransportConfig::HtmlTable(options) => {
            Box::new(HtmlTableAdapter::new(source_id, url, options.clone()))
        }
        TransportConfig::HtmlList(options) => {
            Box::new(HtmlListAdapter::new(source_id, url, options.clone()))
        }
        TransportConfig::Csv(options) => Box::new(CsvAdapter::new(source_id, url, options.clone())),
    })
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Selector(format!("{css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

/// `domain` equals an excluded domain or is a subdomain of one.
fn is_excluded(domain: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|ex| {
        let ex = ex.trim().trim_start_matches("www.").to_ascii_lowercase();
        !ex.is_empty() && (domain == ex || domain.ends_with(&format!(".{ex}")))
    })
}
