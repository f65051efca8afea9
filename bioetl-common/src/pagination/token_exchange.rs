use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    extract_records, fetch_page, invalid_payload, lookup_path, type_name, with_param, Deduper,
    PageRequest, PageResult, PageStream, Paginator,
};
use crate::client::RequestClient;
use crate::error::PaginationError;

/// Server side session established by the initial exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    token: String,
    total: u64,
}

/// One-time exchange that returns a session token and a record total, followed by fixed-size
/// chunks fetched by offset against that token.
pub struct TokenExchangePaginator {
    client: Arc<RequestClient>,
    records_field: String,
    init_path: String,
    init_method: Method,
    init_body: Option<Value>,
    state_field: String,
    total_field: String,
    state_param: String,
    offset_param: String,
    limit_param: String,
    max_pages: Option<usize>,
}

impl TokenExchangePaginator {
    pub fn new(
        client: Arc<RequestClient>,
        records_field: impl Into<String>,
        init_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            records_field: records_field.into(),
            init_path: init_path.into(),
            init_method: Method::POST,
            init_body: None,
            state_field: "token".to_string(),
            total_field: "total".to_string(),
            state_param: "token".to_string(),
            offset_param: "offset".to_string(),
            limit_param: "limit".to_string(),
            max_pages: None,
        }
    }

    pub fn with_init(mut self, method: Method, body: Option<Value>) -> Self {
        self.init_method = method;
        self.init_body = body;
        self
    }

    pub fn with_fields(mut self, state_field: &str, total_field: &str) -> Self {
        self.state_field = state_field.to_string();
        self.total_field = total_field.to_string();
        self
    }

    pub fn with_params(mut self, state_param: &str, offset_param: &str, limit_param: &str) -> Self {
        self.state_param = state_param.to_string();
        self.offset_param = offset_param.to_string();
        self.limit_param = limit_param.to_string();
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    async fn exchange(
        &self,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Session, PaginationError> {
        let raw = fetch_page(
            &self.client,
            self.init_method.clone(),
            &self.init_path,
            &request.params,
            self.init_body.as_ref(),
            0,
            cancel,
        )
        .await?;

        let token = match lookup_path(&raw.payload, &self.state_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            other => {
                return Err(invalid_payload(
                    &self.init_path,
                    0,
                    format!(
                        "session field '{}' is {}",
                        self.state_field,
                        other.map_or("missing", type_name)
                    ),
                ))
            }
        };
        let total = match lookup_path(&raw.payload, &self.total_field) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            invalid_payload(
                &self.init_path,
                0,
                format!("field '{}' does not hold a record count", self.total_field),
            )
        })?;

        debug!(path = %self.init_path, total, "session established");
        Ok(Session { token, total })
    }
}

struct WalkState {
    session: Option<Session>,
    offset: usize,
    index: usize,
    done: bool,
    dedup: Deduper,
}

#[async_trait]
impl Paginator for TokenExchangePaginator {
    fn name(&self) -> &'static str {
        "token_exchange"
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
            session: None,
            offset: 0,
            index: 0,
            done: false,
            dedup: Deduper::new(request.unique_key.clone()),
        };

        stream::try_unfold(state, move |mut state| async move {
            if state.done || self.max_pages.is_some_and(|max| state.index >= max) {
                return Ok(None);
            }

            let session = match state.session.take() {
                Some(session) => session,
                None => self.exchange(request, cancel).await?,
            };
            if session.total == 0 {
                return Ok(None);
            }

            let params = with_param(
                &request.params,
                [
                    (self.state_param.clone(), session.token.clone()),
                    (self.offset_param.clone(), state.offset.to_string()),
                    (self.limit_param.clone(), request.page_size.to_string()),
                ],
            );
            let raw = fetch_page(
                &self.client,
                Method::GET,
                &request.path,
                &params,
                None,
                state.index,
                cancel,
            )
            .await?;

            let records = extract_records(&raw.payload, &self.records_field)
                .map_err(|reason| invalid_payload(&request.path, state.index, reason))?;
            if records.is_empty() {
                return Ok(None);
            }

            state.offset += request.page_size;
            state.done = u64::try_from(state.offset).unwrap_or(u64::MAX) >= session.total;
            state.session = Some(session);

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
