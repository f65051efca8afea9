use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    extract_records, fetch_page, invalid_payload, lookup_path, with_param, Deduper, PageRequest,
    PageResult, PageStream, Paginator,
};
use crate::client::RequestClient;
use crate::error::PaginationError;

/// Offset/limit walk. Stops on an empty page, when the optional hard cap is reached (the
/// output is truncated to it) or once the offset passes the total the server reports.
pub struct OffsetPaginator {
    client: Arc<RequestClient>,
    records_field: String,
    offset_param: String,
    limit_param: String,
    total_field: Option<String>,
    hard_cap: Option<usize>,
    max_pages: Option<usize>,
}

impl OffsetPaginator {
    pub fn new(client: Arc<RequestClient>, records_field: impl Into<String>) -> Self {
        Self {
            client,
            records_field: records_field.into(),
            offset_param: "offset".to_string(),
            limit_param: "limit".to_string(),
            total_field: None,
            hard_cap: None,
            max_pages: None,
        }
    }

    pub fn with_params(mut self, offset_param: &str, limit_param: &str) -> Self {
        self.offset_param = offset_param.to_string();
        self.limit_param = limit_param.to_string();
        self
    }

    pub fn with_total_field(mut self, total_field: Option<String>) -> Self {
        self.total_field = total_field;
        self
    }

    pub fn with_hard_cap(mut self, hard_cap: Option<usize>) -> Self {
        self.hard_cap = hard_cap;
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }
}

struct WalkState {
    offset: usize,
    index: usize,
    collected: usize,
    done: bool,
    dedup: Deduper,
}

#[async_trait]
impl Paginator for OffsetPaginator {
    fn name(&self) -> &'static str {
        "offset"
    }

    fn pages<'a>(
        &'a self,
        request: &'a PageRequest,
        cancel: &'a CancellationToken,
    ) -> PageStream<'a> {
        if let Err(e) = request.check() {
            return stream::once(async move { Err(e) }).boxed();
        }
        if self.hard_cap == Some(0) {
            let e = PaginationError::InvalidArgument("hard cap must be greater than 0".to_string());
            return stream::once(async move { Err(e) }).boxed();
        }

        let state = WalkState {
            offset: 0,
            index: 0,
            collected: 0,
            done: false,
            dedup: Deduper::new(request.unique_key.clone()),
        };

        stream::try_unfold(state, move |mut state| async move {
            if state.done || self.max_pages.is_some_and(|max| state.index >= max) {
                return Ok(None);
            }

            let params = with_param(
                &request.params,
                [
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
            let mut records = state.dedup.retain(records);
            state.offset += request.page_size;

            if let Some(cap) = self.hard_cap {
                let room = cap.saturating_sub(state.collected);
                if records.len() >= room {
                    records.truncate(room);
                    state.done = true;
                    debug!(path = %request.path, cap, "hard cap reached");
                }
            }

            if let Some(field) = &self.total_field {
                let total = match lookup_path(&raw.payload, field) {
                    Some(Value::Number(n)) => n.as_u64(),
                    Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
                    _ => None,
                };
                let total = total.ok_or_else(|| {
                    invalid_payload(
                        &request.path,
                        state.index,
                        format!("field '{field}' does not hold a record count"),
                    )
                })?;
                if u64::try_from(state.offset).unwrap_or(u64::MAX) >= total {
                    state.done = true;
                }
            }

            state.collected += records.len();
            let page = PageResult {
                endpoint: raw.endpoint,
                status: raw.status,
                page_index: state.index,
                records,
                raw: raw.payload,
                params,
            };
            state.index += 1;
            Ok::<_, PaginationError>(Some((page, state)))
        })
        .boxed()
    }
}
