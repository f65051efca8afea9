use std::collections::HashSet;
use std::sync::Arc;

use semver::Version;
use serde::Serialize;
use tracing::info;

use super::dataset::Dataset;
use super::descriptor::SchemaDescriptor;
use super::registry::SchemaRegistry;
use crate::error::{SchemaError, ValidationError, ValidationFailure};

/// What validation did to get the dataset into shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub identifier: String,
    pub row_count: usize,
    pub declared_version: Version,
    pub final_version: Version,
    pub migrations_applied: usize,
    pub applied: Vec<String>,
}

/// A dataset known to conform to `descriptor`, in the descriptor's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDataset {
    pub dataset: Dataset,
    pub descriptor: SchemaDescriptor,
    pub summary: ValidationSummary,
}

pub fn parse_version(raw: &str) -> Result<Version, SchemaError> {
    Version::parse(raw.trim()).map_err(|_| SchemaError::InvalidVersion(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct SchemaValidator {
    registry: Arc<SchemaRegistry>,
    allow_migration: bool,
    max_hops: usize,
}

impl SchemaValidator {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            allow_migration: true,
            max_hops: 5,
        }
    }

    pub fn with_migration(mut self, allow: bool) -> Self {
        self.allow_migration = allow;
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Bring `dataset`, declared as `identifier@declared`, up to the current registered
    /// version and check it against that descriptor.
    pub fn validate(
        &self,
        dataset: Dataset,
        identifier: &str,
        declared: &Version,
    ) -> Result<ValidatedDataset, SchemaError> {
        let descriptor = self.registry.current(identifier)?;
        let current = &descriptor.version;

        let mut dataset = dataset;
        let mut applied = Vec::new();
        if declared != current {
            if !self.allow_migration {
                return Err(SchemaError::VersionMismatch {
                    identifier: identifier.to_string(),
                    declared: declared.clone(),
                    current: current.clone(),
                });
            }

            let chain = self.registry.migration_path(identifier, declared, current)?;
            if chain.len() > self.max_hops {
                return Err(SchemaError::MigrationTooLong {
                    identifier: identifier.to_string(),
                    from: declared.clone(),
                    to: current.clone(),
                    hops: chain.len(),
                    max_hops: self.max_hops,
                });
            }
            for step in chain {
                dataset = step.apply(dataset)?;
                applied.push(step.step_label());
            }
        }

        let dataset = conform(dataset, descriptor)?;
        info!(
            schema = %descriptor.key(),
            rows = dataset.len(),
            migrations = applied.len(),
            "dataset validated"
        );

        Ok(ValidatedDataset {
            summary: ValidationSummary {
                identifier: identifier.to_string(),
                row_count: dataset.len(),
                declared_version: declared.clone(),
                final_version: current.clone(),
                migrations_applied: applied.len(),
                applied,
            },
            dataset,
            descriptor: descriptor.clone(),
        })
    }
}

/// Structural checks first, per-column checks only once the shape is right.
fn conform(dataset: Dataset, descriptor: &SchemaDescriptor) -> Result<Dataset, ValidationError> {
    let rejected = |failures| ValidationError {
        identifier: descriptor.identifier.clone(),
        version: descriptor.version.clone(),
        failures,
    };

    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    for column in dataset.columns() {
        if !seen.insert(column.as_str()) {
            failures.push(ValidationFailure::DuplicateColumn(column.clone()));
        }
    }
    for column in &descriptor.columns {
        if !seen.contains(column.as_str()) {
            failures.push(ValidationFailure::MissingColumn(column.clone()));
        }
    }
    let expected: HashSet<&str> = descriptor.columns.iter().map(String::as_str).collect();
    for column in dataset.columns() {
        if !expected.contains(column.as_str()) {
            failures.push(ValidationFailure::UnexpectedColumn(column.clone()));
        }
    }
    if !failures.is_empty() {
        return Err(rejected(failures));
    }

    let dataset = dataset
        .select(&descriptor.columns)
        .map_err(|_| rejected(Vec::new()))?;

    for column in &descriptor.columns {
        if !descriptor.is_required(column) {
            continue;
        }
        let nulls = dataset
            .column_values(column)
            .map(|values| values.iter().filter(|v| v.is_null()).count())
            .unwrap_or_default();
        if nulls > 0 {
            failures.push(ValidationFailure::CheckFailed {
                column: column.clone(),
                check: "required".to_string(),
                failing_rows: nulls,
            });
        }
    }
    for check in &descriptor.checks {
        let values = dataset.column_values(&check.column).unwrap_or_default();
        let failing_rows = check.failing_rows(&values);
        if failing_rows > 0 {
            failures.push(ValidationFailure::CheckFailed {
                column: check.column.clone(),
                check: check.name().to_string(),
                failing_rows,
            });
        }
    }

    if failures.is_empty() {
        Ok(dataset)
    } else {
        Err(rejected(failures))
    }
}
