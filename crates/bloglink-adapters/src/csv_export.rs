use bloglink_core::RawSiteEntry;

use crate::{CsvOptions, PageRequest, ParsedPage, SourceAdapter, SourceError};

/// A CSV export with a header row; columns are matched by trimmed,
/// case-insensitive name.
#[derive(Debug, Clone)]
pub struct CsvAdapter {
    source_id: String,
    url: String,
    options: CsvOptions,
}

impl CsvAdapter {
    pub fn new(source_id: String, url: String, options: CsvOptions) -> Self {
        Self {
            source_id,
            url,
            options,
        }
    }
}

fn column_index(headers: &[String], wanted: &[String]) -> Option<usize> {
    wanted.iter().find_map(|w| {
        let w = w.trim().to_lowercase();
        headers.iter().position(|h| *h == w)
    })
}

fn clean_value(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") || value.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(value.to_string())
    }
}

impl SourceAdapter for CsvAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn transport(&self) -> &'static str {
        "csv"
    }

    fn first_page(&self) -> PageRequest {
        PageRequest::first(self.url.clone())
    }

    fn parse_page(&self, request: &PageRequest, body: &[u8]) -> Result<ParsedPage, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(body);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| SourceError::parse(&self.source_id, &request.url, e.to_string()))?
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_lowercase())
            .collect();

        let url_idx = column_index(&headers, &self.options.url_columns).ok_or_else(|| {
            SourceError::parse(&self.source_id, &request.url, "no url column in header")
        })?;
        let name_idx = column_index(&headers, &self.options.name_columns);

        let mut page = ParsedPage::default();
        for record in reader.records() {
            let Ok(record) = record else {
                page.skipped += 1;
                continue;
            };
            let name = name_idx.and_then(|i| clean_value(record.get(i)));
            let url = clean_value(record.get(url_idx));
            match (name, url) {
                (Some(name), Some(url)) => page.entries.push(RawSiteEntry { name, url }),
                _ => page.skipped += 1,
            }
        }
        Ok(page)
    }
}
