use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use unicode_normalization::UnicodeNormalization;

use crate::schema::Dataset;

pub const DEFAULT_FLOAT_PRECISION: u32 = 6;

// Largest integer an f64 holds exactly.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalOptions {
    #[serde(default = "default_precision")]
    pub float_precision: u32,
    /// Columns whose strings are read as dates or timestamps.
    #[serde(default)]
    pub date_columns: BTreeSet<String>,
}

fn default_precision() -> u32 {
    DEFAULT_FLOAT_PRECISION
}

impl Default for CanonicalOptions {
    fn default() -> Self {
        Self {
            float_precision: DEFAULT_FLOAT_PRECISION,
            date_columns: BTreeSet::new(),
        }
    }
}

/// Canonical form of a single value:
/// - floats rounded to `precision` decimals, integral results become integers
/// - strings NFC normalized and trimmed, the empty string becomes null
/// - object keys sorted, arrays canonicalized element-wise
pub fn canonicalize_value(value: &Value, precision: u32) -> Value {
    match value {
        Value::Null | Value::Bool(_) => value.clone(),
        Value::Number(n) => canonical_number(n, precision),
        Value::String(s) => canonical_string(s),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| canonicalize_value(item, precision))
                .collect(),
        ),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let sorted: Map<String, Value> = keys
                .into_iter()
                .map(|k| (k.clone(), canonicalize_value(&map[k], precision)))
                .collect();
            Value::Object(sorted)
        }
    }
}

fn canonical_number(n: &Number, precision: u32) -> Value {
    if n.is_i64() || n.is_u64() {
        return Value::Number(n.clone());
    }
    let Some(f) = n.as_f64() else {
        return Value::Null;
    };
    let factor = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
    let scaled = f * factor;
    // values too large to scale already have no digits past the precision
    let rounded = if scaled.is_finite() {
        scaled.round() / factor
    } else {
        f
    };
    if !rounded.is_finite() {
        return Value::Null;
    }
    if rounded.fract() == 0.0 && rounded.abs() < MAX_EXACT_INT {
        // also folds -0.0 into 0
        return Value::from(rounded as i64);
    }
    Number::from_f64(rounded).map_or(Value::Null, Value::Number)
}

fn canonical_string(s: &str) -> Value {
    let normalized: String = s.nfc().collect();
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        Value::Null
    } else {
        Value::String(trimmed.to_string())
    }
}

/// Read a date or timestamp in any of the accepted layouts and render it as `YYYY-MM-DD` or
/// `YYYY-MM-DDTHH:MM:SSZ` (UTC, fractional seconds dropped when zero). Anything else is left
/// in its canonical string form, with numbers rounded to `precision`.
pub fn canonicalize_date(value: &Value, precision: u32) -> Value {
    let canonical = canonicalize_value(value, precision);
    let Some(raw) = canonical.as_str() else {
        return canonical;
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Value::String(render_timestamp(dt.with_timezone(&Utc)));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Value::String(render_timestamp(naive.and_utc()));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Value::String(date.format("%Y-%m-%d").to_string());
        }
    }
    canonical
}

fn render_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Canonical form of a cell in `column`.
pub fn canonicalize_cell(column: &str, value: &Value, options: &CanonicalOptions) -> Value {
    if options.date_columns.contains(column) {
        canonicalize_date(value, options.float_precision)
    } else {
        canonicalize_value(value, options.float_precision)
    }
}

pub fn canonicalize_row(columns: &[String], row: &[Value], options: &CanonicalOptions) -> Vec<Value> {
    columns
        .iter()
        .zip(row)
        .map(|(column, value)| canonicalize_cell(column, value, options))
        .collect()
}

pub fn canonicalize_dataset(dataset: Dataset, options: &CanonicalOptions) -> Dataset {
    dataset.map_cells(|column, value| canonicalize_cell(column, value, options))
}
