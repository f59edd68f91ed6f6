use std::collections::HashSet;

use bloglink_core::{domain_of, RawSiteEntry};
use scraper::{ElementRef, Html};
use url::Url;

use crate::{
    element_text, is_excluded, selector, HtmlListOptions, HtmlTableOptions, PageRequest,
    ParsedPage, SourceAdapter, SourceError,
};

/// Resolve an href against the listing page, keeping only absolute http(s) URLs.
fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn host_domain(url: &Url) -> Option<String> {
    domain_of(url.as_str()).ok()
}

fn page_base(source_id: &str, request: &PageRequest) -> Result<Url, SourceError> {
    Url::parse(&request.url).map_err(|e| SourceError::parse(source_id, &request.url, e.to_string()))
}

fn looks_like_url(text: &str) -> bool {
    text.starts_with("http://") || text.starts_with("https://")
}

/// Blogroll pages laid out as a `<table>`: the first cell names the blog and
/// usually links to it.
#[derive(Debug, Clone)]
pub struct HtmlTableAdapter {
    source_id: String,
    url: String,
    options: HtmlTableOptions,
}

impl HtmlTableAdapter {
    pub fn new(source_id: String, url: String, options: HtmlTableOptions) -> Self {
        Self {
            source_id,
            url,
            options,
        }
    }

    fn row_link(&self, cells: &[ElementRef<'_>]) -> Result<Option<(Option<String>, String)>, SourceError> {
        let anchor = selector("a[href]")?;
        let Some(first) = cells.first() else {
            return Ok(None);
        };
        if let Some(a) = first.select(&anchor).next() {
            if let Some(href) = a.value().attr("href") {
                return Ok(Some((element_text(a), href.to_string())));
            }
        }
        let name = element_text(*first);
        for cell in &cells[1..] {
            if let Some(href) = cell.select(&anchor).next().and_then(|a| a.value().attr("href")) {
                return Ok(Some((name, href.to_string())));
            }
            if let Some(text) = element_text(*cell).filter(|t| looks_like_url(t)) {
                return Ok(Some((name, text)));
            }
        }
        Ok(None)
    }
}

impl SourceAdapter for HtmlTableAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn transport(&self) -> &'static str {
        "html_table"
    }

    fn first_page(&self) -> PageRequest {
        PageRequest::first(self.url.clone())
    }

    fn parse_page(&self, request: &PageRequest, body: &[u8]) -> Result<ParsedPage, SourceError> {
        let base = page_base(&self.source_id, request)?;
        let own_domain = host_domain(&base);
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);
        let table_sel = selector("table")?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("td")?;

        let Some(table) = document.select(&table_sel).next() else {
            return Err(SourceError::parse(&self.source_id, &request.url, "no <table> on page"));
        };

        let mut page = ParsedPage::default();
        for row in table.select(&row_sel) {
            let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
            if cells.is_empty() {
                // header row made of <th>
                continue;
            }
            let Some((name, href)) = self.row_link(&cells)? else {
                page.skipped += 1;
                continue;
            };
            let Some(url) = resolve_href(&base, &href) else {
                page.skipped += 1;
                continue;
            };
            let Some(domain) = host_domain(&url) else {
                page.skipped += 1;
                continue;
            };
            if own_domain.as_deref() == Some(domain.as_str())
                || is_excluded(&domain, &self.options.exclude_domains)
            {
                continue;
            }
            let Some(name) = name else {
                page.skipped += 1;
                continue;
            };
            page.entries.push(RawSiteEntry {
                name,
                url: url.to_string(),
            });
        }
        Ok(page)
    }
}

/// Member pages that are just a container full of outbound links.
#[derive(Debug, Clone)]
pub struct HtmlListAdapter {
    source_id: String,
    url: String,
    options: HtmlListOptions,
}

impl HtmlListAdapter {
    pub fn new(source_id: String, url: String, options: HtmlListOptions) -> Self {
        Self {
            source_id,
            url,
            options,
        }
    }
}

impl SourceAdapter for HtmlListAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn transport(&self) -> &'static str {
        "html_list"
    }

    fn first_page(&self) -> PageRequest {
        PageRequest::first(self.url.clone())
    }

    fn parse_page(&self, request: &PageRequest, body: &[u8]) -> Result<ParsedPage, SourceError> {
        let base = page_base(&self.source_id, request)?;
        let own_domain = host_domain(&base);
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);
        let anchor = selector("a[href]")?;

        let mut container = None;
        for css in &self.options.container_selectors {
            if let Some(found) = document.select(&selector(css)?).next() {
                container = Some(found);
                break;
            }
        }
        let container = container.unwrap_or_else(|| document.root_element());

        let mut page = ParsedPage::default();
        let mut seen = HashSet::new();
        for a in container.select(&anchor) {
            let Some(href) = a.value().attr("href") else {
                continue;
            };
            if !looks_like_url(href.trim()) {
                continue;
            }
            let Some(url) = resolve_href(&base, href) else {
                page.skipped += 1;
                continue;
            };
            let Some(domain) = host_domain(&url) else {
                page.skipped += 1;
                continue;
            };
            if own_domain.as_deref() == Some(domain.as_str())
                || is_excluded(&domain, &self.options.exclude_domains)
                || !seen.insert(url.to_string())
            {
                continue;
            }
            let name = element_text(a)
                .filter(|t| t.chars().count() >= 2)
                .unwrap_or_else(|| domain.clone());
            page.entries.push(RawSiteEntry {
                name,
                url: url.to_string(),
            });
        }
        Ok(page)
    }
}
