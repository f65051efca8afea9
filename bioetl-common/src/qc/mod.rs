//! # Quality control
//!
//! Descriptive diagnostics over a validated dataset. Every metric is a pure function of the
//! dataset it is handed; nothing here mutates rows.
pub mod metrics;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::QcError;
use crate::schema::{Dataset, ValidatedDataset};
pub use metrics::{
    categorical_distribution, correlation, duplicates, iqr_outliers, missingness,
    numeric_columns, outliers, CategoryCount, CorrelationMatrix, DuplicateStats, MissingStats,
    OutlierStats,
};

pub const DEFAULT_IQR_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_OUTLIER_MIN_COUNT: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QcThresholds {
    #[serde(default)]
    pub max_duplicate_ratio: Option<f64>,
    /// Applies to every column.
    #[serde(default)]
    pub max_missing_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QcConfig {
    #[serde(default)]
    pub categorical_columns: Vec<String>,
    #[serde(default = "default_iqr_multiplier")]
    pub iqr_multiplier: f64,
    #[serde(default = "default_outlier_min_count")]
    pub outlier_min_count: usize,
    #[serde(default)]
    pub thresholds: QcThresholds,
    #[serde(default)]
    pub fail_on_threshold: bool,
}

fn default_iqr_multiplier() -> f64 {
    DEFAULT_IQR_MULTIPLIER
}

fn default_outlier_min_count() -> usize {
    DEFAULT_OUTLIER_MIN_COUNT
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            categorical_columns: Vec::new(),
            iqr_multiplier: DEFAULT_IQR_MULTIPLIER,
            outlier_min_count: DEFAULT_OUTLIER_MIN_COUNT,
            thresholds: QcThresholds::default(),
            fail_on_threshold: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcMetricsBundle {
    pub row_count: usize,
    pub duplicates: DuplicateStats,
    pub missingness: Vec<MissingStats>,
    pub categorical: BTreeMap<String, Vec<CategoryCount>>,
    pub correlation: CorrelationMatrix,
    pub outliers: Vec<OutlierStats>,
    pub custom: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdViolation {
    pub metric: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub value: f64,
    pub limit: f64,
}

impl std::fmt::Display for ThresholdViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.column {
            Some(column) => write!(
                f,
                "{} of column '{column}' is {:.4}, above the limit {}",
                self.metric, self.value, self.limit
            ),
            None => write!(
                f,
                "{} is {:.4}, above the limit {}",
                self.metric, self.value, self.limit
            ),
        }
    }
}

impl QcThresholds {
    pub fn evaluate(&self, bundle: &QcMetricsBundle) -> Vec<ThresholdViolation> {
        let mut violations = Vec::new();
        if let Some(limit) = self.max_duplicate_ratio {
            if bundle.duplicates.ratio > limit {
                violations.push(ThresholdViolation {
                    metric: "duplicate_ratio".to_string(),
                    column: None,
                    value: bundle.duplicates.ratio,
                    limit,
                });
            }
        }
        if let Some(limit) = self.max_missing_ratio {
            for stats in bundle.missingness.iter().filter(|s| s.ratio > limit) {
                violations.push(ThresholdViolation {
                    metric: "missing_ratio".to_string(),
                    column: Some(stats.column.clone()),
                    value: stats.ratio,
                    limit,
                });
            }
        }
        violations
    }
}

pub type CustomMetricFn = dyn Fn(&Dataset) -> Result<Value, String> + Send + Sync;

/// Computes a [`QcMetricsBundle`] for each dataset it is handed, including any registered
/// custom metrics.
#[derive(Clone)]
pub struct QualityChecker {
    config: QcConfig,
    custom: Vec<(String, Arc<CustomMetricFn>)>,
}

impl std::fmt::Debug for QualityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityChecker")
            .field("config", &self.config)
            .field(
                "custom",
                &self.custom.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl QualityChecker {
    pub fn new(config: QcConfig) -> Self {
        Self {
            config,
            custom: Vec::new(),
        }
    }

    pub fn config(&self) -> &QcConfig {
        &self.config
    }

    /// Register a named metric. A later registration under the same name replaces the
    /// earlier one.
    pub fn with_custom_metric<F>(mut self, name: impl Into<String>, metric: F) -> Self
    where
        F: Fn(&Dataset) -> Result<Value, String> + Send + Sync + 'static,
    {
        let name = name.into();
        self.custom.retain(|(existing, _)| existing != &name);
        self.custom.push((name, Arc::new(metric)));
        self
    }

    /// Metrics for a dataset grouped by `business_key` for duplicate detection (whole rows
    /// when the key is empty).
    pub fn compute(
        &self,
        dataset: &Dataset,
        business_key: &[String],
    ) -> Result<QcMetricsBundle, QcError> {
        let duplicates = duplicates(dataset, business_key)?;

        let mut categorical = BTreeMap::new();
        for column in &self.config.categorical_columns {
            categorical.insert(column.clone(), categorical_distribution(dataset, column)?);
        }

        let mut custom = BTreeMap::new();
        for (name, metric) in &self.custom {
            let value = metric(dataset).map_err(|reason| QcError::CustomMetric {
                name: name.clone(),
                reason,
            })?;
            custom.insert(name.clone(), value);
        }

        let bundle = QcMetricsBundle {
            row_count: dataset.len(),
            duplicates,
            missingness: missingness(dataset),
            categorical,
            correlation: correlation(dataset),
            outliers: outliers(
                dataset,
                self.config.iqr_multiplier,
                self.config.outlier_min_count,
            ),
            custom,
        };
        info!(
            rows = bundle.row_count,
            duplicates = bundle.duplicates.count,
            outlier_columns = bundle.outliers.len(),
            "quality metrics computed"
        );
        Ok(bundle)
    }

    pub fn compute_validated(&self, validated: &ValidatedDataset) -> Result<QcMetricsBundle, QcError> {
        self.compute(&validated.dataset, &validated.descriptor.business_key)
    }

    pub fn evaluate(&self, bundle: &QcMetricsBundle) -> Vec<ThresholdViolation> {
        let violations = self.config.thresholds.evaluate(bundle);
        for violation in &violations {
            warn!(%violation, "quality threshold exceeded");
        }
        violations
    }
}
