use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bioetl_common::determinism::sha256_hex;
use bioetl_common::qc::{QcMetricsBundle, ThresholdViolation};
use bioetl_common::schema::Dataset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub schema_identifier: String,
    pub schema_version: String,
    pub metrics: QcMetricsBundle,
    pub violations: Vec<ThresholdViolation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub pipeline: String,
    pub entity: String,
    pub started_at: DateTime<Utc>,
    pub config_hash: String,
    pub schema_identifier: String,
    pub schema_version: String,
    pub row_count: usize,
    pub csv_sha256: String,
    pub migrations_applied: Vec<String>,
    pub pages_fetched: usize,
}

/// Where a finished run put its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub csv: PathBuf,
    pub quality_report: PathBuf,
    pub meta: PathBuf,
    pub rows: usize,
    pub csv_sha256: String,
}

/// Paths of the three output files for `stem` in `dir`.
pub fn output_paths(dir: &Path, stem: &str) -> (PathBuf, PathBuf, PathBuf) {
    (
        dir.join(format!("{stem}.csv")),
        dir.join(format!("{stem}_quality_report.json")),
        dir.join(format!("{stem}_meta.json")),
    )
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// CSV bytes for the dataset: header line, then one record per row, `\n` terminated.
pub fn render_csv(dataset: &Dataset) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(dataset.columns())?;
    for row in dataset.rows() {
        writer.write_record(row.iter().map(render_cell))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush csv buffer: {}", e.error()))
}

/// Write `bytes` to `path` through a temporary file in the same directory, so readers see
/// either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to move output into {}", path.display()))?;
    Ok(())
}

pub struct OutputWriter {
    dir: PathBuf,
    stem: String,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    pub fn paths(&self) -> (PathBuf, PathBuf, PathBuf) {
        output_paths(&self.dir, &self.stem)
    }

    /// Write the table, then the quality report, then the metadata record. `meta` receives
    /// the row count and CSV digest before it is written.
    pub fn write(
        &self,
        dataset: &Dataset,
        report: &QualityReport,
        mut meta: RunMetadata,
    ) -> Result<WriteResult> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create output directory {}", self.dir.display()))?;
        let (csv_path, report_path, meta_path) = self.paths();

        let csv = render_csv(dataset)?;
        let digest = sha256_hex(&csv);
        write_atomic(&csv_path, &csv)?;

        write_atomic(&report_path, &serde_json::to_vec_pretty(report)?)?;

        meta.row_count = dataset.len();
        meta.csv_sha256 = digest.clone();
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)?;

        info!(
            path = %csv_path.display(),
            rows = dataset.len(),
            sha256 = %digest,
            "output written"
        );
        Ok(WriteResult {
            csv: csv_path,
            quality_report: report_path,
            meta: meta_path,
            rows: dataset.len(),
            csv_sha256: digest,
        })
    }
}
