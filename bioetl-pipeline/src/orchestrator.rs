use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bioetl_common::client::{RequestClient, SharedHostState};
use bioetl_common::determinism::{append_hashes, canonicalize_dataset, sort_dataset, SortKey};
use bioetl_common::pagination::{PageRequest, Paginator, Record};
use bioetl_common::qc::{QcMetricsBundle, QualityChecker, ThresholdViolation};
use bioetl_common::schema::{
    parse_version, Dataset, SchemaRegistry, SchemaValidator, ValidatedDataset, ValidationSummary,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use metrics::counter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, SourceConfig};
use crate::error::{PipelineError, Progress, Stage};
use crate::output::{output_paths, OutputWriter, QualityReport, RunMetadata, WriteResult};
use crate::transform::{normalize_records, FieldMapping, Normalizer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedSource {
    pub name: String,
    pub url: String,
    pub pagination: String,
    pub page_size: usize,
    pub max_attempts: u32,
    pub rate_limit_calls: u32,
    pub rate_limit_period_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedSchema {
    pub identifier: String,
    pub declared_version: String,
    pub current_version: String,
    /// Migration steps the validate stage will apply, when a path exists.
    pub migrations: Vec<String>,
}

/// Everything a run would do, resolved without touching the network or the filesystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    pub pipeline: String,
    pub entity: String,
    pub config_hash: String,
    pub sources: Vec<PlannedSource>,
    pub schema: PlannedSchema,
    pub columns: Vec<String>,
    pub sort_by: Vec<SortKey>,
    pub limit: Option<usize>,
    pub sample: Option<usize>,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub schema: ValidationSummary,
    pub qc: QcMetricsBundle,
    pub violations: Vec<ThresholdViolation>,
    pub output: WriteResult,
}

/// Extract, transform, validate and write one entity.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<SchemaRegistry>,
    normalizer: Option<Arc<dyn Normalizer>>,
    checker: QualityChecker,
    shared: SharedHostState,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate `config` and build the schema registry from its manifest, if any.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::config)?;
        let registry = match &config.schema.manifest {
            Some(manifest) => manifest
                .clone()
                .into_registry()
                .map_err(PipelineError::config)?,
            None => SchemaRegistry::builder().build(),
        };
        let checker = QualityChecker::new(config.qc.clone());

        Ok(Self {
            config,
            registry: Arc::new(registry),
            normalizer: None,
            checker,
            shared: SharedHostState::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Use a registry assembled in code, for migrations a manifest cannot express.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_quality_checker(mut self, checker: QualityChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_shared_state(mut self, shared: SharedHostState) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn build_paginator(&self, source: &SourceConfig) -> anyhow::Result<Box<dyn Paginator>> {
        let profile = self
            .config
            .resolve_profile(source)
            .map_err(|e| anyhow!("source '{}': {e}", source.name))?;
        let client = RequestClient::with_shared_state(&source.base_url, profile, &self.shared)
            .with_context(|| format!("source '{}'", source.name))?;
        let paginator = source
            .pagination
            .build(Arc::new(client), &source.records_field)
            .with_context(|| format!("source '{}'", source.name))?;
        Ok(paginator)
    }

    /// Columns produced by the transform stage.
    fn normalizer(&self) -> anyhow::Result<Arc<dyn Normalizer>> {
        if let Some(normalizer) = &self.normalizer {
            return Ok(normalizer.clone());
        }
        if !self.config.transform.fields.is_empty() {
            return Ok(Arc::new(FieldMapping::new(
                self.config
                    .transform
                    .fields
                    .iter()
                    .map(|(column, path)| (column.clone(), path.clone())),
            )));
        }
        let schema = &self.config.schema;
        let declared = parse_version(&schema.declared_version)?;
        let descriptor = match self.registry.get(&schema.identifier, &declared) {
            Some(descriptor) => descriptor,
            None => self.registry.current(&schema.identifier)?,
        };
        Ok(Arc::new(FieldMapping::identity(descriptor.columns.iter().cloned())))
    }

    /// Resolve sources, profiles, schema versions and output locations. No request is sent
    /// and nothing is written.
    pub fn plan(&self) -> Result<RunPlan, PipelineError> {
        let config_hash = self.config.hash().map_err(PipelineError::config)?;

        let mut sources = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            self.build_paginator(source).map_err(PipelineError::config)?;
            let profile = self
                .config
                .resolve_profile(source)
                .map_err(|e| PipelineError::config(anyhow!(e)))?;
            sources.push(PlannedSource {
                name: source.name.clone(),
                url: format!(
                    "{}/{}",
                    source.base_url.trim_end_matches('/'),
                    source.path.trim_start_matches('/')
                ),
                pagination: source.pagination.kind().to_string(),
                page_size: source.page_size,
                max_attempts: profile.retry.max_attempts,
                rate_limit_calls: profile.rate_limit.max_calls,
                rate_limit_period_ms: profile.rate_limit.period.as_millis(),
            });
        }

        let schema = &self.config.schema;
        let declared = parse_version(&schema.declared_version).map_err(PipelineError::config)?;
        let current = self
            .registry
            .current(&schema.identifier)
            .map_err(PipelineError::config)?;
        let migrations = if declared == current.version || !schema.allow_migration {
            Vec::new()
        } else {
            self.registry
                .migration_path(&schema.identifier, &declared, &current.version)
                .map(|path| path.iter().map(|m| m.step_label()).collect())
                .unwrap_or_default()
        };
        let columns = self
            .normalizer()
            .map_err(PipelineError::config)?
            .columns();

        let (csv, report, meta) =
            output_paths(&self.config.output.dir, &self.config.output.file_stem);
        Ok(RunPlan {
            pipeline: self.config.run.name.clone(),
            entity: self.config.run.entity.clone(),
            config_hash,
            sources,
            schema: PlannedSchema {
                identifier: schema.identifier.clone(),
                declared_version: declared.to_string(),
                current_version: current.version.to_string(),
                migrations,
            },
            columns,
            sort_by: self.config.determinism.sort_by.clone(),
            limit: self.config.run.limit,
            sample: self.config.run.sample,
            outputs: vec![csv, report, meta],
        })
    }

    pub async fn run(&self) -> Result<PipelineRun, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let plan = self.plan()?;
        info!(
            run_id = %run_id,
            pipeline = %plan.pipeline,
            config_hash = %plan.config_hash,
            sources = plan.sources.len(),
            "pipeline run started"
        );

        let pages_fetched = AtomicUsize::new(0);
        let mut rows_validated = 0;
        let fail = |stage: Stage, rows_validated: usize, source: anyhow::Error| {
            PipelineError::new(
                stage,
                Progress {
                    pages_fetched: pages_fetched.load(Ordering::Relaxed),
                    rows_validated,
                },
                source,
            )
        };

        let records = self
            .extract(&pages_fetched)
            .await
            .map_err(|e| fail(Stage::Extract, rows_validated, e))?;
        info!(stage = %Stage::Extract, records = records.len(), pages = pages_fetched.load(Ordering::Relaxed), "stage complete");

        let dataset = self
            .transform(&records)
            .map_err(|e| fail(Stage::Transform, rows_validated, e))?;
        info!(stage = %Stage::Transform, rows = dataset.len(), "stage complete");

        let validated = self
            .validate(dataset)
            .map_err(|e| fail(Stage::Validate, rows_validated, e))?;
        rows_validated = validated.dataset.len();
        info!(stage = %Stage::Validate, rows = rows_validated, "stage complete");

        let meta = RunMetadata {
            run_id: run_id.to_string(),
            pipeline: plan.pipeline.clone(),
            entity: plan.entity.clone(),
            started_at,
            config_hash: plan.config_hash.clone(),
            schema_identifier: validated.summary.identifier.clone(),
            schema_version: validated.summary.final_version.to_string(),
            row_count: 0,
            csv_sha256: String::new(),
            migrations_applied: validated.summary.applied.clone(),
            pages_fetched: pages_fetched.load(Ordering::Relaxed),
        };
        let summary = validated.summary.clone();
        let (qc, violations, output) = self
            .write(validated, meta)
            .map_err(|e| fail(Stage::Write, rows_validated, e))?;
        info!(stage = %Stage::Write, rows = output.rows, "stage complete");

        Ok(PipelineRun {
            run_id,
            config_hash: plan.config_hash,
            started_at,
            finished_at: Utc::now(),
            pages_fetched: pages_fetched.load(Ordering::Relaxed),
            schema: summary,
            qc,
            violations,
            output,
        })
    }

    /// Walk every source, at most `max_concurrent_sources` at a time, and concatenate their
    /// records in declaration order.
    async fn extract(&self, pages_fetched: &AtomicUsize) -> anyhow::Result<Vec<Record>> {
        let mut batches = stream::iter(self.config.sources.iter().enumerate())
            .map(|(index, source)| async move {
                let records = self
                    .extract_source(source, pages_fetched)
                    .await
                    .with_context(|| format!("source '{}'", source.name))?;
                Ok::<_, anyhow::Error>((index, records))
            })
            .buffer_unordered(self.config.run.max_concurrent_sources)
            .try_collect::<Vec<_>>()
            .await?;
        batches.sort_by_key(|(index, _)| *index);
        Ok(batches
            .into_iter()
            .flat_map(|(_, records)| records)
            .collect())
    }

    async fn extract_source(
        &self,
        source: &SourceConfig,
        pages_fetched: &AtomicUsize,
    ) -> anyhow::Result<Vec<Record>> {
        let paginator = self.build_paginator(source)?;
        let mut request = PageRequest::new(&source.path, source.page_size)
            .with_params(source.query_params());
        if let Some(key) = &source.unique_key {
            request = request.with_unique_key(key);
        }

        let limit = self.config.run.limit;
        let mut records = Vec::new();
        let mut pages = paginator.pages(&request, &self.cancel);
        while let Some(page) = pages.next().await {
            let page = page?;
            pages_fetched.fetch_add(1, Ordering::Relaxed);
            records.extend(page.records);
            if let Some(limit) = limit {
                if records.len() >= limit {
                    records.truncate(limit);
                    break;
                }
            }
        }
        info!(source = %source.name, records = records.len(), "source extracted");
        Ok(records)
    }

    /// Normalize, canonicalize and sample. Validation sees the same cells that get written,
    /// so a blank required value is caught as null.
    fn transform(&self, records: &[Record]) -> anyhow::Result<Dataset> {
        let normalizer = self.normalizer()?;
        let dataset = normalize_records(normalizer.as_ref(), records)?;
        let dataset =
            canonicalize_dataset(dataset, &self.config.determinism.canonical_options());
        Ok(match self.config.run.sample {
            Some(n) => sample_rows(dataset, n, self.config.run.seed),
            None => dataset,
        })
    }

    fn validate(&self, dataset: Dataset) -> anyhow::Result<ValidatedDataset> {
        let schema = &self.config.schema;
        let declared = parse_version(&schema.declared_version)?;
        let validator = SchemaValidator::new(self.registry.clone())
            .with_migration(schema.allow_migration)
            .with_max_hops(schema.max_migration_hops);
        Ok(validator.validate(dataset, &schema.identifier, &declared)?)
    }

    /// Canonicalize again after migration, then sort, measure, hash and persist. Threshold
    /// failures stop the run before any file is touched.
    fn write(
        &self,
        validated: ValidatedDataset,
        meta: RunMetadata,
    ) -> anyhow::Result<(QcMetricsBundle, Vec<ThresholdViolation>, WriteResult)> {
        let options = self.config.determinism.canonical_options();
        let ValidatedDataset {
            dataset,
            descriptor,
            ..
        } = validated;

        let dataset = canonicalize_dataset(dataset, &options);
        let dataset = sort_dataset(dataset, &self.config.determinism.sort_by)?;

        let metrics = self.checker.compute(&dataset, &descriptor.business_key)?;
        let violations = self.checker.evaluate(&metrics);
        if self.checker.config().fail_on_threshold && !violations.is_empty() {
            let listed = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(anyhow!("quality thresholds exceeded: {listed}"));
        }
        if !violations.is_empty() {
            warn!(count = violations.len(), "writing output despite quality threshold violations");
        }

        let dataset = append_hashes(dataset, &descriptor, &options)?;
        let report = QualityReport {
            schema_identifier: descriptor.identifier.clone(),
            schema_version: descriptor.version.to_string(),
            metrics: metrics.clone(),
            violations: violations.clone(),
        };
        let writer = OutputWriter::new(&self.config.output.dir, &self.config.output.file_stem);
        let result = writer.write(&dataset, &report, meta)?;

        counter!("bioetl_rows_written_total", "pipeline" => self.config.run.name.clone())
            .increment(result.rows as u64);
        Ok((metrics, violations, result))
    }
}

/// Keep `n` rows chosen by a generator seeded with `seed`, in their original order.
pub fn sample_rows(dataset: Dataset, n: usize, seed: u64) -> Dataset {
    if n >= dataset.len() {
        return dataset;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices = rand::seq::index::sample(&mut rng, dataset.len(), n).into_vec();
    indices.sort_unstable();
    dataset.take_rows(&indices)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
run: { name: docs, entity: document }
sources:
  - name: primary
    base_url: http://127.0.0.1:9
    path: /documents
    page_size: 10
    records_field: items
    pagination: { type: page_number }
schema:
  identifier: doc
  declared_version: 1.0.0
  manifest:
    schemas:
      - { identifier: doc, version: 1.0.0, columns: [id, value_old] }
      - { identifier: doc, version: 2.0.0, columns: [id, value_new] }
    migrations:
      - identifier: doc
        from: 1.0.0
        to: 2.0.0
        steps:
          - rename: { from: value_old, to: value_new }
output: { dir: /nonexistent/bioetl, file_stem: docs }
"#;

    #[test]
    fn test_plan_resolves_without_side_effects() {
        let pipeline = Pipeline::new(parse_config(CONFIG, &[]).unwrap()).unwrap();
        let plan = pipeline.plan().unwrap();

        assert_eq!(plan.sources[0].url, "http://127.0.0.1:9/documents");
        assert_eq!(plan.sources[0].pagination, "page_number");
        assert_eq!(plan.schema.current_version, "2.0.0");
        assert_eq!(plan.schema.migrations, vec!["1.0.0->2.0.0"]);
        assert_eq!(plan.columns, vec!["id", "value_old"]);
        assert_eq!(
            plan.outputs[0],
            PathBuf::from("/nonexistent/bioetl/docs.csv")
        );
        assert!(!std::path::Path::new("/nonexistent/bioetl").exists());
    }

    #[test]
    fn test_plan_rejects_unknown_schema() {
        let config = parse_config(CONFIG, &["schema.identifier=assay".to_string()]).unwrap();
        let err = Pipeline::new(config).unwrap().plan().unwrap_err();
        assert_eq!(err.stage, Stage::Config);
        assert!(err.to_string().contains("no schema registered under 'assay'"));
    }

    #[test]
    fn test_sample_is_seeded_and_keeps_order() {
        let rows = (0..50).map(|i| vec![json!(i)]).collect();
        let dataset = Dataset::from_rows(vec!["id".to_string()], rows).unwrap();

        let a = sample_rows(dataset.clone(), 10, 7);
        let b = sample_rows(dataset.clone(), 10, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        let ids: Vec<i64> = a.rows().iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(sample_rows(dataset.clone(), 100, 7), dataset);
    }
}
