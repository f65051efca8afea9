use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    extract_records, fetch_page, invalid_payload, lookup_path, type_name, with_param, Deduper,
    PageRequest, PageResult, PageStream, Paginator,
};
use crate::client::RequestClient;
use crate::error::PaginationError;

/// Hooks for the ways a cursor walk can end. Callbacks observe, they never change what the
/// paginator does next.
pub trait CursorObserver: Send + Sync {
    fn on_empty_page(&self, _path: &str, _page: usize) {}

    fn on_page_limit(&self, _path: &str, _pages: usize) {}

    fn on_invalid_payload(&self, _path: &str, _page: usize, _reason: &str) {}

    /// A page carried records but no continuation token, so it is taken as the last one.
    fn on_missing_token(&self, _path: &str, _page: usize, _records: usize) {}

    /// A page handed back a token the walk already followed. The walk stops after that page.
    fn on_repeated_token(&self, _path: &str, _page: usize, _token: &str) {}
}

/// Logs every termination reason.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl CursorObserver for LoggingObserver {
    fn on_empty_page(&self, path: &str, page: usize) {
        info!(path, page, "cursor walk ended on an empty page");
    }

    fn on_page_limit(&self, path: &str, pages: usize) {
        warn!(path, pages, "cursor walk stopped at the page limit");
    }

    fn on_invalid_payload(&self, path: &str, page: usize, reason: &str) {
        warn!(path, page, reason, "cursor walk received an invalid payload");
    }

    fn on_missing_token(&self, path: &str, page: usize, records: usize) {
        warn!(
            path,
            page, records, "page has records but no continuation token, treating it as final"
        );
    }

    fn on_repeated_token(&self, path: &str, page: usize, token: &str) {
        warn!(path, page, token, "continuation token was already followed, ending the walk");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Next {
    Start,
    Token(String),
}

/// Opaque continuation token read from each page. The token either goes back as a query
/// parameter or, without one configured, is a link that is followed verbatim.
pub struct CursorPaginator {
    client: Arc<RequestClient>,
    records_field: String,
    cursor_field: String,
    token_param: Option<String>,
    size_param: Option<String>,
    max_pages: Option<usize>,
    observer: Arc<dyn CursorObserver>,
}

impl CursorPaginator {
    pub fn new(
        client: Arc<RequestClient>,
        records_field: impl Into<String>,
        cursor_field: impl Into<String>,
    ) -> Self {
        Self {
            client,
            records_field: records_field.into(),
            cursor_field: cursor_field.into(),
            token_param: None,
            size_param: None,
            max_pages: None,
            observer: Arc::new(LoggingObserver),
        }
    }

    pub fn with_token_param(mut self, token_param: Option<String>) -> Self {
        self.token_param = token_param;
        self
    }

    pub fn with_size_param(mut self, size_param: Option<String>) -> Self {
        self.size_param = size_param;
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CursorObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn first_params(&self, request: &PageRequest) -> Vec<(String, String)> {
        match &self.size_param {
            Some(size_param) => with_param(
                &request.params,
                [(size_param.clone(), request.page_size.to_string())],
            ),
            None => request.params.clone(),
        }
    }

    /// Where to go for `next`, as a (path or absolute url, params) pair.
    fn target(
        &self,
        request: &PageRequest,
        next: &Next,
        page: usize,
    ) -> Result<(String, Vec<(String, String)>), PaginationError> {
        match (next, &self.token_param) {
            (Next::Start, _) => Ok((request.path.clone(), self.first_params(request))),
            (Next::Token(token), Some(param)) => Ok((
                request.path.clone(),
                with_param(&self.first_params(request), [(param.clone(), token.clone())]),
            )),
            (Next::Token(link), None) => {
                let url = self
                    .client
                    .resolve_link(link)
                    .map_err(|source| PaginationError::Request { page, source })?;
                Ok((url.to_string(), Vec::new()))
            }
        }
    }

    fn read_token(&self, payload: &Value) -> Result<Option<String>, String> {
        match lookup_path(payload, &self.cursor_field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(format!(
                "continuation field '{}' is {}",
                self.cursor_field,
                type_name(other)
            )),
        }
    }
}

struct WalkState {
    next: Next,
    index: usize,
    done: bool,
    seen_tokens: HashSet<String>,
    dedup: Deduper,
}

#[async_trait]
impl Paginator for CursorPaginator {
    fn name(&self) -> &'static str {
        "cursor"
    }

    fn pages<'a>(
        &'a self,
        request: &'a PageRequest,
        cancel: &'a CancellationToken,
    ) -> PageStream<'a> {
        if let Err(e) = request.check() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let state = WalkState {
            next: Next::Start,
            index: 0,
            done: false,
            seen_tokens: HashSet::new(),
            dedup: Deduper::new(request.unique_key.clone()),
        };

        stream::try_unfold(state, move |mut state| async move {
            if state.done {
                return Ok(None);
            }
            if self.max_pages.is_some_and(|max| state.index >= max) {
                self.observer.on_page_limit(&request.path, state.index);
                return Ok(None);
            }

            let (target, params) = self.target(request, &state.next, state.index)?;
            let raw = fetch_page(
                &self.client,
                Method::GET,
                &target,
                &params,
                None,
                state.index,
                cancel,
            )
            .await?;

            let parsed = extract_records(&raw.payload, &self.records_field)
                .and_then(|records| Ok((records, self.read_token(&raw.payload)?)));
            let (records, token) = match parsed {
                Ok(parsed) => parsed,
                Err(reason) => {
                    self.observer
                        .on_invalid_payload(&request.path, state.index, &reason);
                    return Err(invalid_payload(&request.path, state.index, reason));
                }
            };

            if records.is_empty() {
                self.observer.on_empty_page(&request.path, state.index);
                return Ok(None);
            }

            match token {
                Some(token) if state.seen_tokens.contains(&token) => {
                    self.observer
                        .on_repeated_token(&request.path, state.index, &token);
                    state.done = true;
                }
                Some(token) => {
                    state.seen_tokens.insert(token.clone());
                    state.next = Next::Token(token);
                }
                None => {
                    self.observer
                        .on_missing_token(&request.path, state.index, records.len());
                    state.done = true;
                }
            }

            let page = PageResult {
                endpoint: raw.endpoint,
                status: raw.status,
                page_index: state.index,
                records: state.dedup.retain(records),
                raw: raw.payload,
                params,
            };
            state.index += 1;
            Ok::<_, PaginationError>(Some((page, state)))
        })
        .boxed()
    }
}
