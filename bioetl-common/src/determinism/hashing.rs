use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::canonical::{canonicalize_cell, canonicalize_value, CanonicalOptions};
use crate::error::DeterminismError;
use crate::schema::{Dataset, SchemaDescriptor};

pub const HASH_ROW_COLUMN: &str = "hash_row";
pub const HASH_BUSINESS_KEY_COLUMN: &str = "hash_business_key";

// Whole keys that carry a credential, compared after lowercasing and `-` -> `_`.
const SECRET_KEYS: &[&str] = &["authorization", "proxy_authorization", "api_key", "apikey"];

// A key whose last `_`-separated word is one of these names a credential (`api_token`,
// `client_secret`), while `token_param` or `secret_field` only name where one goes.
const SECRET_WORDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "credential",
    "credentials",
];

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 over the canonical JSON of `{column: canonical value}` for the `subset` columns.
/// Keys are serialized in sorted order, so column order never affects the digest.
pub fn hash_columns(
    columns: &[String],
    row: &[Value],
    subset: &[String],
    options: &CanonicalOptions,
) -> Result<String, DeterminismError> {
    let mut canonical = BTreeMap::new();
    for column in subset {
        let idx = columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| DeterminismError::UnknownColumn(column.clone()))?;
        let value = row.get(idx).unwrap_or(&Value::Null);
        canonical.insert(column.as_str(), canonicalize_cell(column, value, options));
    }
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(sha256_hex(&bytes))
}

pub fn hash_row(
    descriptor: &SchemaDescriptor,
    columns: &[String],
    row: &[Value],
    options: &CanonicalOptions,
) -> Result<String, DeterminismError> {
    hash_columns(columns, row, &descriptor.row_hash, options)
}

/// Identity of the row from its business key alone. Without a business key the row hash
/// columns are used.
pub fn hash_business_key(
    descriptor: &SchemaDescriptor,
    columns: &[String],
    row: &[Value],
    options: &CanonicalOptions,
) -> Result<String, DeterminismError> {
    let key = if descriptor.business_key.is_empty() {
        &descriptor.row_hash
    } else {
        &descriptor.business_key
    };
    hash_columns(columns, row, key, options)
}

/// Append `hash_row` and `hash_business_key` to a validated dataset.
pub fn append_hashes(
    dataset: Dataset,
    descriptor: &SchemaDescriptor,
    options: &CanonicalOptions,
) -> Result<Dataset, DeterminismError> {
    for column in [HASH_ROW_COLUMN, HASH_BUSINESS_KEY_COLUMN] {
        if dataset.column_index(column).is_some() {
            return Err(DeterminismError::ColumnExists(column.to_string()));
        }
    }

    let columns = dataset.columns().to_vec();
    let mut row_hashes = Vec::with_capacity(dataset.len());
    let mut key_hashes = Vec::with_capacity(dataset.len());
    for row in dataset.rows() {
        row_hashes.push(Value::String(hash_row(descriptor, &columns, row, options)?));
        key_hashes.push(Value::String(hash_business_key(
            descriptor, &columns, row, options,
        )?));
    }

    let mut row_hashes = row_hashes.into_iter();
    let mut key_hashes = key_hashes.into_iter();
    dataset
        .add_column_with(HASH_ROW_COLUMN, |_| row_hashes.next().unwrap_or(Value::Null))
        .and_then(|d| {
            d.add_column_with(HASH_BUSINESS_KEY_COLUMN, |_| {
                key_hashes.next().unwrap_or(Value::Null)
            })
        })
        .map_err(|_| DeterminismError::ColumnExists(HASH_ROW_COLUMN.to_string()))
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase().replace('-', "_");
    if SECRET_KEYS.contains(&key.as_str()) || key.ends_with("_api_key") {
        return true;
    }
    key.rsplit('_')
        .next()
        .is_some_and(|word| SECRET_WORDS.contains(&word))
}

fn is_path_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "dir"
        || key.ends_with("_dir")
        || key.ends_with("_file")
        || key.ends_with("_path")
}

fn scrub(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_secret_key(k) && !is_path_key(k))
                .map(|(k, v)| (k.clone(), scrub(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(scrub).collect()),
        other => other.clone(),
    }
}

/// Fingerprint of a configuration tree. Credentials and filesystem locations are dropped
/// first and keys are sorted, so the digest only moves when behaviour-relevant settings do.
pub fn config_hash(config: &Value) -> Result<String, DeterminismError> {
    let canonical = canonicalize_value(&scrub(config), 12);
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(sha256_hex(&bytes))
}
