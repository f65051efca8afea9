use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QcError;
use crate::schema::Dataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateStats {
    /// Columns the rows were grouped by. Empty means whole-row equality.
    pub key_columns: Vec<String>,
    /// Rows beyond the first in each group.
    pub count: usize,
    pub ratio: f64,
    /// Key values of every group with more than one row, in first-seen order.
    pub duplicated_keys: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingStats {
    pub column: String,
    pub missing: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    /// `None` where fewer than two paired values exist or a column is constant.
    pub values: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.columns.iter().position(|c| c == a)?;
        let j = self.columns.iter().position(|c| c == b)?;
        self.values[i][j]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierStats {
    pub column: String,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub lower: f64,
    pub upper: f64,
    pub flagged: usize,
}

pub(crate) fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn group_key(values: &[&Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Group rows by `key_columns` (or whole rows when empty) and count the surplus rows.
pub fn duplicates(dataset: &Dataset, key_columns: &[String]) -> Result<DuplicateStats, QcError> {
    let indices: Vec<usize> = if key_columns.is_empty() {
        (0..dataset.columns().len()).collect()
    } else {
        key_columns
            .iter()
            .map(|c| {
                dataset
                    .column_index(c)
                    .ok_or_else(|| QcError::UnknownColumn(c.clone()))
            })
            .collect::<Result<_, _>>()?
    };

    let mut groups: HashMap<String, usize> = HashMap::new();
    let mut first_seen: Vec<(String, Vec<Value>)> = Vec::new();
    for row in dataset.rows() {
        let values: Vec<&Value> = indices.iter().map(|&i| &row[i]).collect();
        let key = group_key(&values);
        let size = groups.entry(key.clone()).or_insert(0);
        if *size == 0 {
            first_seen.push((key, values.into_iter().cloned().collect()));
        }
        *size += 1;
    }

    let rows = dataset.len();
    let count = rows - groups.len();
    let duplicated_keys = first_seen
        .into_iter()
        .filter(|(key, _)| groups.get(key).is_some_and(|&n| n > 1))
        .map(|(_, values)| values)
        .collect();

    Ok(DuplicateStats {
        key_columns: key_columns.to_vec(),
        count,
        ratio: ratio(count, rows),
        duplicated_keys,
    })
}

/// Null or blank cells per column, in column order.
pub fn missingness(dataset: &Dataset) -> Vec<MissingStats> {
    dataset
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let missing = dataset
                .rows()
                .iter()
                .filter(|row| is_missing(&row[idx]))
                .count();
            MissingStats {
                column: column.clone(),
                missing,
                ratio: ratio(missing, dataset.len()),
            }
        })
        .collect()
}

fn category_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Frequencies of the non-null values of `column`, most frequent first, ties by value.
pub fn categorical_distribution(
    dataset: &Dataset,
    column: &str,
) -> Result<Vec<CategoryCount>, QcError> {
    let values = dataset
        .column_values(column)
        .ok_or_else(|| QcError::UnknownColumn(column.to_string()))?;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values.into_iter().filter(|v| !v.is_null()) {
        *counts.entry(category_label(value)).or_insert(0) += 1;
    }
    let mut distribution: Vec<CategoryCount> = counts
        .into_iter()
        .map(|(value, count)| CategoryCount { value, count })
        .collect();
    distribution.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    Ok(distribution)
}

/// Columns holding at least one number and nothing but numbers or nulls.
pub fn numeric_columns(dataset: &Dataset) -> Vec<String> {
    dataset
        .columns()
        .iter()
        .enumerate()
        .filter(|(idx, _)| {
            let mut seen_number = false;
            for row in dataset.rows() {
                match &row[*idx] {
                    Value::Null => {}
                    Value::Number(_) => seen_number = true,
                    _ => return false,
                }
            }
            seen_number
        })
        .map(|(_, column)| column.clone())
        .collect()
}

fn numbers(dataset: &Dataset, column: &str) -> Vec<Option<f64>> {
    dataset
        .column_values(column)
        .unwrap_or_default()
        .into_iter()
        .map(Value::as_f64)
        .collect()
}

fn pearson(xs: &[Option<f64>], ys: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    let r = cov / (var_x * var_y).sqrt();
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Pearson correlation between every pair of numeric columns, over the rows where both
/// values are present.
pub fn correlation(dataset: &Dataset) -> CorrelationMatrix {
    let columns = numeric_columns(dataset);
    let series: Vec<Vec<Option<f64>>> = columns.iter().map(|c| numbers(dataset, c)).collect();
    let values = series
        .iter()
        .map(|xs| series.iter().map(|ys| pearson(xs, ys)).collect())
        .collect();
    CorrelationMatrix { columns, values }
}

/// Quantile with linear interpolation between closest ranks. `sorted` must be ascending and
/// non-empty.
pub(crate) fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// IQR fences for one column. Columns with fewer than `min_count` values, or with no spread
/// between the quartiles, are skipped.
pub fn iqr_outliers(
    dataset: &Dataset,
    column: &str,
    multiplier: f64,
    min_count: usize,
) -> Option<OutlierStats> {
    let mut values: Vec<f64> = numbers(dataset, column).into_iter().flatten().collect();
    if values.is_empty() || values.len() < min_count {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let q1 = quantile(&values, 0.25);
    let q3 = quantile(&values, 0.75);
    let iqr = q3 - q1;
    if iqr <= 0.0 {
        return None;
    }
    let lower = q1 - multiplier * iqr;
    let upper = q3 + multiplier * iqr;
    let flagged = values.iter().filter(|&&v| v < lower || v > upper).count();

    Some(OutlierStats {
        column: column.to_string(),
        q1,
        q3,
        iqr,
        lower,
        upper,
        flagged,
    })
}

pub fn outliers(dataset: &Dataset, multiplier: f64, min_count: usize) -> Vec<OutlierStats> {
    numeric_columns(dataset)
        .iter()
        .filter_map(|column| iqr_outliers(dataset, column, multiplier, min_count))
        .collect()
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
