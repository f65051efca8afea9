use std::time::Duration;

use semver::Version;
use thiserror::Error;

/// Enumeration of errors surfaced by the resilient request client.
///
/// Rate limiting never shows up here: a caller waiting on the limiter simply blocks until a
/// token is available.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("circuit open for {host}, next probe allowed in {remaining:?} (last error: {last_error})")]
    CircuitOpen {
        host: String,
        remaining: Duration,
        last_error: String,
    },
    #[error("{method} {path} could not be completed after {attempts} attempts: {cause}")]
    TransientNetwork {
        method: String,
        path: String,
        attempts: u32,
        status: Option<u16>,
        cause: String,
    },
    #[error("{method} {path} failed with non-retryable status {status}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: Option<String>,
    },
    #[error("{method} {path} failed and cannot be retried: {cause}")]
    NonRetryable {
        method: String,
        path: String,
        cause: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to decode response body from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    /// The HTTP status attached to this error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::TransientNetwork { status, .. } => *status,
            RequestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Enumeration of errors raised while walking a paginated endpoint.
#[derive(Error, Debug)]
pub enum PaginationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request failed on page {page}: {source}")]
    Request {
        page: usize,
        #[source]
        source: RequestError,
    },
    #[error("invalid payload on page {page} of {path}: {reason}")]
    InvalidPayload {
        path: String,
        page: usize,
        reason: String,
    },
    #[error("pagination cancelled after {pages_fetched} pages")]
    Cancelled { pages_fetched: usize },
}

/// A single structural or per-column problem found while validating a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    MissingColumn(String),
    UnexpectedColumn(String),
    DuplicateColumn(String),
    CheckFailed {
        column: String,
        check: String,
        failing_rows: usize,
    },
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::MissingColumn(c) => write!(f, "missing column '{c}'"),
            ValidationFailure::UnexpectedColumn(c) => write!(f, "unexpected column '{c}'"),
            ValidationFailure::DuplicateColumn(c) => write!(f, "duplicate column '{c}'"),
            ValidationFailure::CheckFailed {
                column,
                check,
                failing_rows,
            } => write!(
                f,
                "check '{check}' failed on column '{column}' for {failing_rows} rows"
            ),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("dataset does not match {identifier}@{version}: {}", format_failures(.failures))]
pub struct ValidationError {
    pub identifier: String,
    pub version: Version,
    pub failures: Vec<ValidationFailure>,
}

impl ValidationError {
    /// Columns named by at least one failure, in first-seen order.
    pub fn failing_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = Vec::new();
        for failure in &self.failures {
            let column = match failure {
                ValidationFailure::MissingColumn(c)
                | ValidationFailure::UnexpectedColumn(c)
                | ValidationFailure::DuplicateColumn(c) => c.as_str(),
                ValidationFailure::CheckFailed { column, .. } => column.as_str(),
            };
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }
}

fn format_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Enumeration of errors related to schema registration, migration and validation.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("schema {identifier}@{version} is already registered")]
    DuplicateSchema { identifier: String, version: Version },
    #[error("schema {identifier}@{version} is invalid: {reason}")]
    InvalidDescriptor {
        identifier: String,
        version: Version,
        reason: String,
    },
    #[error("no schema registered under '{0}'")]
    UnknownSchema(String),
    #[error("invalid migration for '{identifier}': {reason}")]
    InvalidMigration { identifier: String, reason: String },
    #[error("'{0}' is not a valid schema version")]
    InvalidVersion(String),
    #[error("dataset declares {identifier}@{declared} but the current version is {current} and migration is disabled")]
    VersionMismatch {
        identifier: String,
        declared: Version,
        current: Version,
    },
    #[error("migrating {identifier} from {from} to {to} needs {hops} steps, more than the allowed {max_hops}")]
    MigrationTooLong {
        identifier: String,
        from: Version,
        to: Version,
        hops: usize,
        max_hops: usize,
    },
    #[error("no migration path for {identifier} from {from} to {to}")]
    NoMigrationPath {
        identifier: String,
        from: Version,
        to: Version,
    },
    #[error("migration of {identifier} from {from} to {to} failed: {reason}")]
    MigrationFailed {
        identifier: String,
        from: Version,
        to: Version,
        reason: String,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Errors raised while canonicalizing, hashing or ordering a dataset.
#[derive(Error, Debug)]
pub enum DeterminismError {
    #[error("column '{0}' is not part of the dataset")]
    UnknownColumn(String),
    #[error("column '{0}' already exists")]
    ColumnExists(String),
    #[error("failed to serialize canonical form: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised while computing quality metrics.
#[derive(Error, Debug)]
pub enum QcError {
    #[error("column '{0}' is not part of the dataset")]
    UnknownColumn(String),
    #[error("custom metric '{name}' failed: {reason}")]
    CustomMetric { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_failing_columns() {
        let err = ValidationError {
            identifier: "doc".to_string(),
            version: Version::new(1, 0, 0),
            failures: vec![
                ValidationFailure::MissingColumn("id".to_string()),
                ValidationFailure::CheckFailed {
                    column: "value".to_string(),
                    check: "not_null".to_string(),
                    failing_rows: 2,
                },
                ValidationFailure::DuplicateColumn("id".to_string()),
            ],
        };

        assert_eq!(err.failing_columns(), vec!["id", "value"]);
        let msg = err.to_string();
        assert!(msg.contains("doc@1.0.0"));
        assert!(msg.contains("missing column 'id'"));
        assert!(msg.contains("check 'not_null' failed on column 'value' for 2 rows"));
    }

    #[test]
    fn test_request_error_status() {
        let err = RequestError::Status {
            method: "GET".to_string(),
            path: "/x".to_string(),
            status: 404,
            body: None,
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(RequestError::Cancelled.status(), None);
    }
}
