// Golden snapshot tests: each configured source parses its recorded sample page
// into exactly the entries stored in `fixtures/<source>/sample/snapshot.json`.

use std::path::{Path, PathBuf};

use bloglink_adapters::{adapter_for_source, PageRequest, SourceRegistry};
use bloglink_core::RawSiteEntry;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct GoldenListing {
    entries: Vec<RawSiteEntry>,
    skipped: usize,
    next: Option<PageRequest>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn registry() -> SourceRegistry {
    SourceRegistry::load(workspace_root().join("sources.yaml")).expect("sources.yaml")
}

fn fixture_path(source_id: &str, file: &str) -> PathBuf {
    workspace_root()
        .join("fixtures")
        .join(source_id)
        .join("sample")
        .join(file)
}

fn assert_matches_snapshot(source_id: &str, page_file: &str) {
    let registry = registry();
    let config = registry.get(source_id).expect("source configured");
    let adapter = adapter_for_source(config).expect("adapter");
    let body = std::fs::read(fixture_path(source_id, page_file)).expect("fixture page");
    let parsed = adapter
        .parse_page(&adapter.first_page(), &body)
        .expect("parse page");

    let text = std::fs::read_to_string(fixture_path(source_id, "snapshot.json"))
        .expect("read snapshot");
    let expected: GoldenListing = serde_json::from_str(&text).expect("parse snapshot");
    let actual = GoldenListing {
        entries: parsed.entries,
        skipped: parsed.skipped,
        next: parsed.next,
    };
    assert_eq!(actual, expected);
}

#[test]
fn registry_lists_all_four_transports() {
    let registry = registry();
    let mut transports: Vec<_> = registry
        .enabled()
        .map(|c| adapter_for_source(c).expect("adapter").transport())
        .collect();
    transports.sort();
    transports.dedup();
    assert_eq!(transports, vec!["csv", "html_list", "html_table", "json_api"]);
}

#[test]
fn golden_snapshot_zhblogs_json_api() {
    assert_matches_snapshot("zhblogs", "page.json");
}

#[test]
fn golden_snapshot_bf_zzxworld_paged_json_api() {
    assert_matches_snapshot("bf-zzxworld", "page.json");
}

#[test]
fn golden_snapshot_alexsci_html_table() {
    assert_matches_snapshot("alexsci-blogroll", "page.html");
}

#[test]
fn golden_snapshot_foreverblog_member_list() {
    assert_matches_snapshot("foreverblog", "page.html");
}

#[test]
fn golden_snapshot_chinese_independent_blogs_csv() {
    assert_matches_snapshot("chinese-independent-blogs", "page.csv");
}
