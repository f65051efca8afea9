use std::collections::{BTreeSet, HashSet};

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    Integer,
    String,
    Bool,
}

impl ValueKind {
    fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueKind::Number, Value::Number(_)) => true,
            (ValueKind::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (ValueKind::String, Value::String(_)) => true,
            (ValueKind::Bool, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

/// Per-column rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum CheckKind {
    NotNull,
    Unique,
    OneOf {
        values: Vec<Value>,
    },
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Pattern {
        regex: String,
    },
    Kind {
        kind: ValueKind,
    },
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::NotNull => "not_null",
            CheckKind::Unique => "unique",
            CheckKind::OneOf { .. } => "one_of",
            CheckKind::Range { .. } => "range",
            CheckKind::Pattern { .. } => "pattern",
            CheckKind::Kind { .. } => "kind",
        }
    }
}

/// A configured check bound to its column, with any pattern compiled up front.
#[derive(Debug, Clone)]
pub struct ColumnCheck {
    pub column: String,
    pub kind: CheckKind,
    pattern: Option<Regex>,
}

impl PartialEq for ColumnCheck {
    fn eq(&self, other: &Self) -> bool {
        self.column == other.column && self.kind == other.kind
    }
}

impl ColumnCheck {
    pub fn new(column: impl Into<String>, kind: CheckKind) -> Result<Self, String> {
        let pattern = match &kind {
            CheckKind::Pattern { regex } => Some(
                Regex::new(regex).map_err(|e| format!("invalid pattern '{regex}': {e}"))?,
            ),
            CheckKind::Range {
                min: Some(min),
                max: Some(max),
            } if min > max => return Err(format!("range min {min} is above max {max}")),
            _ => None,
        };
        Ok(Self {
            column: column.into(),
            kind,
            pattern,
        })
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Number of rows violating the check. Nulls only ever fail `not_null`.
    pub fn failing_rows(&self, values: &[&Value]) -> usize {
        match &self.kind {
            CheckKind::NotNull => values.iter().filter(|v| v.is_null()).count(),
            CheckKind::Unique => {
                let mut seen = HashSet::new();
                values
                    .iter()
                    .filter(|v| !v.is_null())
                    .filter(|v| !seen.insert(v.to_string()))
                    .count()
            }
            CheckKind::OneOf { values: allowed } => values
                .iter()
                .filter(|v| !v.is_null() && !allowed.contains(v))
                .count(),
            CheckKind::Range { min, max } => values
                .iter()
                .filter(|v| !v.is_null())
                .filter(|v| match v.as_f64() {
                    Some(x) => min.is_some_and(|m| x < m) || max.is_some_and(|m| x > m),
                    None => true,
                })
                .count(),
            CheckKind::Pattern { .. } => values
                .iter()
                .filter(|v| !v.is_null())
                .filter(|v| match (v.as_str(), &self.pattern) {
                    (Some(s), Some(re)) => !re.is_match(s),
                    _ => true,
                })
                .count(),
            CheckKind::Kind { kind } => values
                .iter()
                .filter(|v| !v.is_null() && !kind.admits(v))
                .count(),
        }
    }
}

/// A named, versioned contract for a dataset.
///
/// Every descriptor column must be present in a conforming dataset, in order. Required
/// columns are additionally non-null in every row. Business-key and row-hash columns are
/// always required.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    pub identifier: String,
    pub version: Version,
    pub columns: Vec<String>,
    pub required: BTreeSet<String>,
    pub business_key: Vec<String>,
    pub row_hash: Vec<String>,
    pub checks: Vec<ColumnCheck>,
}

impl SchemaDescriptor {
    pub fn builder(identifier: impl Into<String>, version: Version) -> SchemaDescriptorBuilder {
        SchemaDescriptorBuilder {
            identifier: identifier.into(),
            version,
            columns: Vec::new(),
            required: None,
            business_key: Vec::new(),
            row_hash: None,
            checks: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}@{}", self.identifier, self.version)
    }

    pub fn is_required(&self, column: &str) -> bool {
        self.required.contains(column)
    }
}

pub struct SchemaDescriptorBuilder {
    identifier: String,
    version: Version,
    columns: Vec<String>,
    required: Option<Vec<String>>,
    business_key: Vec<String>,
    row_hash: Option<Vec<String>>,
    checks: Vec<(String, CheckKind)>,
}

fn owned<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl SchemaDescriptorBuilder {
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = owned(columns);
        self
    }

    /// Defaults to every column.
    pub fn required<I, S>(mut self, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = Some(owned(required));
        self
    }

    pub fn business_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.business_key = owned(key);
        self
    }

    /// Defaults to every required column.
    pub fn row_hash<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.row_hash = Some(owned(columns));
        self
    }

    pub fn check(mut self, column: impl Into<String>, kind: CheckKind) -> Self {
        self.checks.push((column.into(), kind));
        self
    }

    pub fn build(self) -> Result<SchemaDescriptor, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidDescriptor {
            identifier: self.identifier.clone(),
            version: self.version.clone(),
            reason,
        };

        if self.identifier.trim().is_empty() {
            return Err(invalid("identifier must not be empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("at least one column is required".to_string()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.as_str()) {
                return Err(invalid(format!("column '{column}' is listed twice")));
            }
        }

        let required: BTreeSet<String> = match &self.required {
            Some(required) => required.iter().cloned().collect(),
            None => self.columns.iter().cloned().collect(),
        };
        if let Some(stray) = required.iter().find(|c| !seen.contains(c.as_str())) {
            return Err(invalid(format!(
                "required column '{stray}' is not in the column list"
            )));
        }

        let row_hash = self.row_hash.clone().unwrap_or_else(|| {
            self.columns
                .iter()
                .filter(|c| required.contains(*c))
                .cloned()
                .collect()
        });
        for (role, columns) in [("business-key", &self.business_key), ("row-hash", &row_hash)] {
            if let Some(stray) = columns.iter().find(|c| !required.contains(*c)) {
                return Err(invalid(format!(
                    "{role} column '{stray}' must be a required column"
                )));
            }
        }

        let checks = self
            .checks
            .iter()
            .map(|(column, kind)| {
                if !seen.contains(column.as_str()) {
                    return Err(invalid(format!("check on unknown column '{column}'")));
                }
                ColumnCheck::new(column.clone(), kind.clone())
                    .map_err(|e| invalid(format!("check on '{column}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SchemaDescriptor {
            identifier: self.identifier.clone(),
            version: self.version.clone(),
            columns: self.columns.clone(),
            required,
            business_key: self.business_key.clone(),
            row_hash,
            checks,
        })
    }
}
