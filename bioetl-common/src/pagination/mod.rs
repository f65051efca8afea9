//! # Pagination
//!
//! Four continuation protocols behind one [`Paginator`] trait. Every strategy yields pages
//! lazily through [`Paginator::pages`] and deduplicates records by the caller's unique key
//! for the lifetime of that single walk.
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use metrics::counter;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::RequestClient;
use crate::error::{PaginationError, RequestError};

pub mod cursor;
pub mod offset;
pub mod page_number;
pub mod token_exchange;

pub use cursor::{CursorObserver, CursorPaginator, LoggingObserver};
pub use offset::OffsetPaginator;
pub use page_number::PageNumberPaginator;
pub use token_exchange::TokenExchangePaginator;

pub type Record = Map<String, Value>;

pub type PageStream<'a> = BoxStream<'a, Result<PageResult, PaginationError>>;

/// What to walk: the endpoint, how many records per page and how to recognise repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub path: String,
    pub page_size: usize,
    pub params: Vec<(String, String)>,
    pub unique_key: Option<String>,
}

impl PageRequest {
    pub fn new(path: impl Into<String>, page_size: usize) -> Self {
        Self {
            path: path.into(),
            page_size,
            params: Vec::new(),
            unique_key: None,
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub(crate) fn check(&self) -> Result<(), PaginationError> {
        if self.page_size == 0 {
            return Err(PaginationError::InvalidArgument(format!(
                "page size for {} must be greater than 0",
                self.path
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub endpoint: String,
    pub status: u16,
    /// Zero-based position of this page in the walk.
    pub page_index: usize,
    pub records: Vec<Record>,
    pub raw: Value,
    pub params: Vec<(String, String)>,
}

#[async_trait]
pub trait Paginator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lazily walk the endpoint. Pages come out in fetch order and fetches are sequential.
    fn pages<'a>(&'a self, request: &'a PageRequest, cancel: &'a CancellationToken)
        -> PageStream<'a>;

    /// Walk every page and concatenate the records. Nothing is returned on failure or
    /// cancellation, partially collected pages are dropped.
    async fn collect(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, PaginationError> {
        let mut pages = self.pages(request, cancel);
        let mut records = Vec::new();
        while let Some(page) = pages.next().await {
            records.extend(page?.records);
        }
        Ok(records)
    }
}

/// Which continuation protocol a source speaks, as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationConfig {
    PageNumber {
        #[serde(default = "default_page_param")]
        page_param: String,
        #[serde(default = "default_size_param")]
        size_param: String,
        #[serde(default)]
        max_pages: Option<usize>,
    },
    Offset {
        #[serde(default = "default_offset_param")]
        offset_param: String,
        #[serde(default = "default_limit_param")]
        limit_param: String,
        #[serde(default)]
        total_field: Option<String>,
        #[serde(default)]
        hard_cap: Option<usize>,
        #[serde(default)]
        max_pages: Option<usize>,
    },
    Cursor {
        cursor_field: String,
        /// Query parameter carrying an opaque token. Without one the token is a link.
        #[serde(default)]
        token_param: Option<String>,
        #[serde(default)]
        size_param: Option<String>,
        #[serde(default)]
        max_pages: Option<usize>,
    },
    TokenExchange {
        init_path: String,
        #[serde(default = "default_init_method")]
        init_method: String,
        #[serde(default)]
        init_body: Option<Value>,
        #[serde(default = "default_state_field")]
        state_field: String,
        #[serde(default = "default_total_field")]
        total_field: String,
        #[serde(default = "default_state_field")]
        state_param: String,
        #[serde(default = "default_offset_param")]
        offset_param: String,
        #[serde(default = "default_limit_param")]
        limit_param: String,
        #[serde(default)]
        max_pages: Option<usize>,
    },
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_size_param() -> String {
    "page_size".to_string()
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

fn default_init_method() -> String {
    "POST".to_string()
}

fn default_state_field() -> String {
    "token".to_string()
}

fn default_total_field() -> String {
    "total".to_string()
}

impl PaginationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            PaginationConfig::PageNumber { .. } => "page_number",
            PaginationConfig::Offset { .. } => "offset",
            PaginationConfig::Cursor { .. } => "cursor",
            PaginationConfig::TokenExchange { .. } => "token_exchange",
        }
    }

    /// Build the strategy for a source whose records live under `records_field`.
    pub fn build(
        &self,
        client: Arc<RequestClient>,
        records_field: &str,
    ) -> Result<Box<dyn Paginator>, PaginationError> {
        let paginator: Box<dyn Paginator> = match self {
            PaginationConfig::PageNumber {
                page_param,
                size_param,
                max_pages,
            } => Box::new(
                PageNumberPaginator::new(client, records_field)
                    .with_params(page_param, size_param)
                    .with_max_pages(*max_pages),
            ),
            PaginationConfig::Offset {
                offset_param,
                limit_param,
                total_field,
                hard_cap,
                max_pages,
            } => Box::new(
                OffsetPaginator::new(client, records_field)
                    .with_params(offset_param, limit_param)
                    .with_total_field(total_field.clone())
                    .with_hard_cap(*hard_cap)
                    .with_max_pages(*max_pages),
            ),
            PaginationConfig::Cursor {
                cursor_field,
                token_param,
                size_param,
                max_pages,
            } => Box::new(
                CursorPaginator::new(client, records_field, cursor_field)
                    .with_token_param(token_param.clone())
                    .with_size_param(size_param.clone())
                    .with_max_pages(*max_pages),
            ),
            PaginationConfig::TokenExchange {
                init_path,
                init_method,
                init_body,
                state_field,
                total_field,
                state_param,
                offset_param,
                limit_param,
                max_pages,
            } => {
                let method = Method::from_bytes(init_method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| {
                        PaginationError::InvalidArgument(format!(
                            "'{init_method}' is not a valid HTTP method"
                        ))
                    })?;
                Box::new(
                    TokenExchangePaginator::new(client, records_field, init_path)
                        .with_init(method, init_body.clone())
                        .with_fields(state_field, total_field)
                        .with_params(state_param, offset_param, limit_param)
                        .with_max_pages(*max_pages),
                )
            }
        };
        Ok(paginator)
    }
}

/// Follow a dotted path (`page_meta.next`, `data.items`) into a JSON document. The empty path
/// is the document itself.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Pull the record array out of a page payload.
pub(crate) fn extract_records(payload: &Value, records_field: &str) -> Result<Vec<Record>, String> {
    let items = match lookup_path(payload, records_field) {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(format!(
                "field '{records_field}' is {} rather than an array",
                type_name(other)
            ))
        }
        None => return Err(format!("field '{records_field}' is missing")),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map.clone()),
            other => Err(format!(
                "record {i} under '{records_field}' is {} rather than an object",
                type_name(other)
            )),
        })
        .collect()
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Seen-set over unique key values, scoped to one walk.
#[derive(Debug, Default)]
pub(crate) struct Deduper {
    key: Option<String>,
    seen: HashSet<String>,
}

impl Deduper {
    pub(crate) fn new(key: Option<String>) -> Self {
        Self {
            key,
            seen: HashSet::new(),
        }
    }

    /// Drop records whose key was already seen. Records without the key are always kept.
    pub(crate) fn retain(&mut self, records: Vec<Record>) -> Vec<Record> {
        let Some(key) = &self.key else {
            return records;
        };
        records
            .into_iter()
            .filter(|record| match record.get(key) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => self.seen.insert(s.clone()),
                Some(other) => self.seen.insert(other.to_string()),
            })
            .collect()
    }
}

/// A fetched page before strategy-specific interpretation.
pub(crate) struct RawPage {
    pub endpoint: String,
    pub status: u16,
    pub payload: Value,
}

/// Fetch one page, mapping client errors onto the pagination taxonomy.
pub(crate) async fn fetch_page(
    client: &RequestClient,
    method: Method,
    path: &str,
    params: &[(String, String)],
    body: Option<&Value>,
    page: usize,
    cancel: &CancellationToken,
) -> Result<RawPage, PaginationError> {
    if cancel.is_cancelled() {
        return Err(PaginationError::Cancelled {
            pages_fetched: page,
        });
    }

    let response = client
        .request(method, path, params, body, cancel)
        .await
        .map_err(|e| request_error(page, e))?;
    let payload = response.json().map_err(|e| request_error(page, e))?;

    counter!("bioetl_pages_fetched_total", "host" => client.host().to_string()).increment(1);
    debug!(
        path = response.url.path(),
        page,
        status = response.status.as_u16(),
        "fetched page"
    );

    Ok(RawPage {
        endpoint: response.url.path().to_string(),
        status: response.status.as_u16(),
        payload,
    })
}

fn request_error(page: usize, source: RequestError) -> PaginationError {
    match source {
        RequestError::Cancelled => PaginationError::Cancelled {
            pages_fetched: page,
        },
        source => PaginationError::Request { page, source },
    }
}

pub(crate) fn invalid_payload(path: &str, page: usize, reason: impl Into<String>) -> PaginationError {
    PaginationError::InvalidPayload {
        path: path.to_string(),
        page,
        reason: reason.into(),
    }
}

pub(crate) fn with_param(
    params: &[(String, String)],
    extra: impl IntoIterator<Item = (String, String)>,
) -> Vec<(String, String)> {
    let mut all = params.to_vec();
    all.extend(extra);
    all
}
