//! Run reports (`summary.json`, `brief.md`) and parquet snapshots of the graph.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bloglink_graph::PathHistogram;
use bloglink_storage::GraphSnapshot;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `reports/<run_id>/summary.json` and `brief.md`; returns the run directory.
pub async fn write_run_report<T: Serialize>(
    reports_root: &Path,
    run_id: Uuid,
    title: &str,
    summary: &T,
    brief_lines: &[String],
) -> Result<PathBuf> {
    let dir = reports_root.join(run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let mut brief = format!("# {title}\n\n- Run ID: `{run_id}`\n");
    for line in brief_lines {
        brief.push_str("- ");
        brief.push_str(line);
        brief.push('\n');
    }
    fs::write(dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

/// Write sites, edges and the histogram as parquet under `<run_dir>/snapshots`
/// plus a manifest; returns the manifest path.
pub async fn export_graph_parquet(
    run_dir: &Path,
    snapshot: &GraphSnapshot,
    histogram: &PathHistogram,
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let sites_path = snapshot_dir.join("sites.parquet");
    let edges_path = snapshot_dir.join("link_edges.parquet");
    let histogram_path = snapshot_dir.join("path_histogram.parquet");

    write_sites_parquet(&sites_path, snapshot)?;
    write_edges_parquet(&edges_path, snapshot)?;
    write_histogram_parquet(&histogram_path, histogram)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("sites", run_dir, &sites_path)?,
            manifest_entry("link_edges", run_dir, &edges_path)?,
            manifest_entry("path_histogram", run_dir, &histogram_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_sites_parquet(path: &Path, snapshot: &GraphSnapshot) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("domain", DataType::Utf8, false),
        ArrowField::new("reviewed", DataType::Boolean, false),
    ]));
    let sites = &snapshot.sites;
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(sites.iter().map(|s| s.id).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                sites.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                sites.iter().map(|s| s.url.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                sites.iter().map(|s| s.domain.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                sites.iter().map(|s| s.reviewed).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building sites record batch")?;
    write_parquet(path, batch)
}

fn write_edges_parquet(path: &Path, snapshot: &GraphSnapshot) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("source_site_id", DataType::Int64, false),
        ArrowField::new("target_site_id", DataType::Int64, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("page_url", DataType::Utf8, false),
    ]));
    let edges = &snapshot.edges;
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(edges.iter().map(|e| e.id).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(
                edges.iter().map(|e| e.source_site_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                edges.iter().map(|e| e.target_site_id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                edges.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                edges.iter().map(|e| e.page_url.as_str()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building link_edges record batch")?;
    write_parquet(path, batch)
}

/// One row per finite length plus a final row with a null length for unreachable pairs.
fn write_histogram_parquet(path: &Path, histogram: &PathHistogram) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("length", DataType::Int64, true),
        ArrowField::new("pairs", DataType::UInt64, false),
    ]));
    let mut lengths: Vec<Option<i64>> = histogram
        .by_length
        .keys()
        .map(|&len| Some(i64::from(len)))
        .collect();
    let mut pairs: Vec<u64> = histogram.by_length.values().copied().collect();
    lengths.push(None);
    pairs.push(histogram.unreachable);

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(lengths)),
            Arc::new(UInt64Array::from(pairs)),
        ],
    )
    .context("building path_histogram record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
