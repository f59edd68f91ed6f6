use bloglink_core::RawSiteEntry;
use serde_json::Value as JsonValue;

use crate::{JsonApiOptions, PageRequest, Pagination, ParsedPage, SourceAdapter, SourceError};

/// Directory APIs returning a JSON array of site objects, optionally paged.
#[derive(Debug, Clone)]
pub struct JsonApiAdapter {
    source_id: String,
    url: String,
    options: JsonApiOptions,
}

impl JsonApiAdapter {
    pub fn new(source_id: String, url: String, options: JsonApiOptions) -> Self {
        Self {
            source_id,
            url,
            options,
        }
    }

    fn next_page(&self, request: &PageRequest, doc: &JsonValue, item_count: usize) -> Option<PageRequest> {
        let Pagination::PathSuffix {
            more_flag,
            max_pages,
        } = &self.options.pagination
        else {
            return None;
        };
        let more = doc
            .get(more_flag)
            .or_else(|| doc.get("data").and_then(|d| d.get(more_flag)))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        if !more || item_count == 0 || request.page >= *max_pages {
            return None;
        }
        let page = request.page + 1;
        Some(PageRequest {
            url: format!("{}/{}", self.url.trim_end_matches('/'), page),
            page,
        })
    }
}

fn first_str(item: &JsonValue, keys: &[String]) -> Option<String> {
    keys.iter()
        .filter_map(|key| item.get(key.as_str()))
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

impl SourceAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn transport(&self) -> &'static str {
        "json_api"
    }

    fn first_page(&self) -> PageRequest {
        PageRequest::first(self.url.clone())
    }

    fn parse_page(&self, request: &PageRequest, body: &[u8]) -> Result<ParsedPage, SourceError> {
        let doc: JsonValue = serde_json::from_slice(body)
            .map_err(|e| SourceError::parse(&self.source_id, &request.url, e.to_string()))?;
        let items = self
            .options
            .items_pointers
            .iter()
            .find_map(|pointer| doc.pointer(pointer).and_then(JsonValue::as_array))
            .ok_or_else(|| {
                SourceError::parse(&self.source_id, &request.url, "no item array at configured pointers")
            })?;

        let mut page = ParsedPage::default();
        for item in items {
            match (
                first_str(item, &self.options.name_keys),
                first_str(item, &self.options.url_keys),
            ) {
                (Some(name), Some(url)) => page.entries.push(RawSiteEntry { name, url }),
                _ => page.skipped += 1,
            }
        }
        page.next = self.next_page(request, &doc, items.len());
        Ok(page)
    }
}
