use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use bioetl_common::client::profile::{ProfileOverrides, RequestProfile};
use bioetl_common::determinism::{config_hash, CanonicalOptions, SortKey, DEFAULT_FLOAT_PRECISION};
use bioetl_common::pagination::PaginationConfig;
use bioetl_common::qc::QcConfig;
use bioetl_common::schema::{parse_version, SchemaManifest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};

use crate::error::ConfigError;

/// Upper bound the upstream APIs accept for a single page.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub sources: Vec<SourceConfig>,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub determinism: DeterminismConfig,
    #[serde(default)]
    pub qc: QcConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub name: String,
    pub entity: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sample: Option<usize>,
}

fn default_max_concurrent_sources() -> usize {
    4
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default)]
    pub global: ProfileOverrides,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileOverrides>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: String,
    pub path: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub overrides: ProfileOverrides,
    pub page_size: usize,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub unique_key: Option<String>,
    pub records_field: String,
    pub pagination: PaginationConfig,
}

impl SourceConfig {
    /// Query parameters with scalar values rendered the way they go on the wire.
    pub fn query_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    pub identifier: String,
    pub declared_version: String,
    #[serde(default = "default_allow_migration")]
    pub allow_migration: bool,
    #[serde(default = "default_max_migration_hops")]
    pub max_migration_hops: usize,
    #[serde(default)]
    pub manifest: Option<SchemaManifest>,
}

fn default_allow_migration() -> bool {
    true
}

fn default_max_migration_hops() -> usize {
    5
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    /// Output column to dotted record path. Empty means columns are read from records as-is.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeterminismConfig {
    #[serde(default)]
    pub sort_by: Vec<SortKey>,
    #[serde(default = "default_float_precision")]
    pub float_precision: u32,
    #[serde(default)]
    pub date_columns: BTreeSet<String>,
}

fn default_float_precision() -> u32 {
    DEFAULT_FLOAT_PRECISION
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            sort_by: Vec::new(),
            float_precision: DEFAULT_FLOAT_PRECISION,
            date_columns: BTreeSet::new(),
        }
    }
}

impl DeterminismConfig {
    pub fn canonical_options(&self) -> CanonicalOptions {
        CanonicalOptions {
            float_precision: self.float_precision,
            date_columns: self.date_columns.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub file_stem: String,
}

impl PipelineConfig {
    /// The request profile for `source`, layered over its named profile and the global one.
    pub fn resolve_profile(&self, source: &SourceConfig) -> Result<RequestProfile, String> {
        let named = match &source.profile {
            Some(name) => Some(
                self.http
                    .profiles
                    .get(name)
                    .ok_or_else(|| format!("unknown profile '{name}'"))?,
            ),
            None => None,
        };
        RequestProfile::resolve(&self.http.global, named, &source.overrides)
    }

    /// Every range and consistency problem at once, each naming its field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.run.max_concurrent_sources == 0 {
            problems.push("run.max_concurrent_sources must be greater than 0".to_string());
        }
        if let Err(e) = RequestProfile::default().apply(&self.http.global) {
            problems.push(format!("http.global: {e}"));
        }
        for (name, profile) in &self.http.profiles {
            if let Err(e) = RequestProfile::default().apply(profile) {
                problems.push(format!("http.profiles.{name}: {e}"));
            }
        }

        if self.sources.is_empty() {
            problems.push("sources: at least one source is required".to_string());
        }
        let mut names = HashSet::new();
        for (i, source) in self.sources.iter().enumerate() {
            let at = format!("sources[{i}] ({})", source.name);
            if !names.insert(source.name.as_str()) {
                problems.push(format!("{at}: duplicate source name"));
            }
            if source.page_size == 0 || source.page_size > MAX_PAGE_SIZE {
                problems.push(format!(
                    "{at}.page_size: {} is outside 1..={MAX_PAGE_SIZE}",
                    source.page_size
                ));
            }
            if let Err(e) = self.resolve_profile(source) {
                problems.push(format!("{at}: {e}"));
            }
        }

        if let Err(e) = parse_version(&self.schema.declared_version) {
            problems.push(format!("schema.declared_version: {e}"));
        }
        for (i, key) in self.determinism.sort_by.iter().enumerate() {
            if key.column.trim().is_empty() {
                problems.push(format!("determinism.sort_by[{i}]: column name is empty"));
            }
        }
        if !(self.qc.iqr_multiplier > 0.0 && self.qc.iqr_multiplier.is_finite()) {
            problems.push(format!(
                "qc.iqr_multiplier: must be greater than 0, got {}",
                self.qc.iqr_multiplier
            ));
        }
        if self.output.file_stem.trim().is_empty() {
            problems.push("output.file_stem must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Fingerprint of the behaviour-relevant settings.
    pub fn hash(&self) -> anyhow::Result<String> {
        let tree = serde_json::to_value(self)?;
        Ok(config_hash(&tree)?)
    }
}

/// Read `path`, apply `key.path=value` overrides to the document tree, then deserialize and
/// validate.
pub fn load_config(path: &Path, overrides: &[String]) -> Result<PipelineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, overrides)
}

pub fn parse_config(raw: &str, overrides: &[String]) -> Result<PipelineConfig, ConfigError> {
    let mut tree: YamlValue = serde_yaml::from_str(raw)?;

    let problems: Vec<String> = overrides
        .iter()
        .filter_map(|o| apply_override(&mut tree, o).err())
        .collect();
    if !problems.is_empty() {
        return Err(ConfigError::Invalid(problems));
    }

    let config: PipelineConfig = serde_yaml::from_value(tree)?;
    config.validate()?;
    Ok(config)
}

/// Set `key.path=value` in the tree. The value is read as a YAML scalar, so `--set
/// run.seed=7` sets a number and `--set output.file_stem=7a` a string.
pub fn apply_override(tree: &mut YamlValue, raw: &str) -> Result<(), String> {
    let (path, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("--set {raw}: expected key.path=value"))?;
    let path = path.trim();
    if path.is_empty() || path.split('.').any(|s| s.trim().is_empty()) {
        return Err(format!("--set {raw}: '{path}' is not a valid key path"));
    }
    let value: YamlValue =
        serde_yaml::from_str(value).map_err(|e| format!("--set {raw}: invalid value: {e}"))?;

    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(format!("--set {raw}: empty key path"));
    };

    let mut node = tree;
    for segment in parents {
        node = child_mut(node, segment).map_err(|e| format!("--set {raw}: {e}"))?;
    }
    *child_mut(node, last).map_err(|e| format!("--set {raw}: {e}"))? = value;
    Ok(())
}

fn child_mut<'v>(node: &'v mut YamlValue, segment: &str) -> Result<&'v mut YamlValue, String> {
    if node.is_null() {
        *node = YamlValue::Mapping(Mapping::new());
    }
    match node {
        YamlValue::Mapping(map) => {
            let key = YamlValue::String(segment.to_string());
            if !map.contains_key(&key) {
                map.insert(key.clone(), YamlValue::Null);
            }
            map.get_mut(&key)
                .ok_or_else(|| format!("cannot descend into '{segment}'"))
        }
        YamlValue::Sequence(items) => {
            let len = items.len();
            let index = segment
                .parse::<usize>()
                .map_err(|_| format!("'{segment}' is not a list index"))?;
            items
                .get_mut(index)
                .ok_or_else(|| format!("index {index} is out of range for a list of {len}"))
        }
        _ => Err(format!("cannot descend into scalar at '{segment}'")),
    }
}
