use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use super::{
    extract_records, fetch_page, invalid_payload, with_param, Deduper, PageRequest, PageResult,
    PageStream, Paginator,
};
use crate::client::RequestClient;
use crate::error::PaginationError;

/// 1-based page counter. A page holding fewer than `page_size` records after deduplication
/// is the last one.
pub struct PageNumberPaginator {
    client: Arc<RequestClient>,
    records_field: String,
    page_param: String,
    size_param: String,
    max_pages: Option<usize>,
}

impl PageNumberPaginator {
    pub fn new(client: Arc<RequestClient>, records_field: impl Into<String>) -> Self {
        Self {
            client,
            records_field: records_field.into(),
            page_param: "page".to_string(),
            size_param: "page_size".to_string(),
            max_pages: None,
        }
    }

    pub fn with_params(mut self, page_param: &str, size_param: &str) -> Self {
        self.page_param = page_param.to_string();
        self.size_param = size_param.to_string();
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }
}

struct WalkState {
    page: usize,
    done: bool,
    dedup: Deduper,
}

#[async_trait]
impl Paginator for PageNumberPaginator {
    fn name(&self) -> &'static str {
        "page_number"
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
            page: 1,
            done: false,
            dedup: Deduper::new(request.unique_key.clone()),
        };

        stream::try_unfold(state, move |mut state| async move {
            let index = state.page - 1;
            if state.done || self.max_pages.is_some_and(|max| index >= max) {
                return Ok(None);
            }

            let params = with_param(
                &request.params,
                [
                    (self.page_param.clone(), state.page.to_string()),
                    (self.size_param.clone(), request.page_size.to_string()),
                ],
            );
            let raw = fetch_page(
                &self.client,
                Method::GET,
                &request.path,
                &params,
                None,
                index,
                cancel,
            )
            .await?;

            let records = extract_records(&raw.payload, &self.records_field)
                .map_err(|reason| invalid_payload(&request.path, index, reason))?;
            let records = state.dedup.retain(records);

            state.done = records.len() < request.page_size;
            state.page += 1;
            if records.is_empty() {
                return Ok(None);
            }

            let page = PageResult {
                endpoint: raw.endpoint,
                status: raw.status,
                page_index: index,
                records,
                raw: raw.payload,
                params,
            };
            Ok::<_, PaginationError>(Some((page, state)))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use httpmock::{Method::GET, MockServer};
    use serde_json::json;

    use super::*;
    use crate::pagination::test_support::{ids, items, profile};

    fn paginator(server: &MockServer) -> PageNumberPaginator {
        let client = RequestClient::new(&server.base_url(), profile()).unwrap();
        PageNumberPaginator::new(Arc::new(client), "results")
    }

    fn serve_pages<'a>(
        server: &'a MockServer,
        pages: &[Vec<serde_json::Value>],
    ) -> Vec<httpmock::Mock<'a>> {
        pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let body = json!({ "results": page });
                server.mock(|when, then| {
                    when.method(GET)
                        .path("/targets")
                        .query_param("page", (i + 1).to_string());
                    then.status(200).json_body(body);
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_five_items_page_size_two() {
        let server = MockServer::start();
        let all = items(1..6);
        let mocks = serve_pages(
            &server,
            &[all[0..2].to_vec(), all[2..4].to_vec(), all[4..5].to_vec()],
        );

        let paginator = paginator(&server);
        let request = PageRequest::new("/targets", 2).with_unique_key("id");
        let cancel = CancellationToken::new();

        let pages: Vec<PageResult> = paginator.pages(&request, &cancel).try_collect().await.unwrap();
        let sizes: Vec<usize> = pages.iter().map(|p| p.records.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(
            pages.iter().map(|p| p.page_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(pages[1].endpoint, "/targets");
        assert!(pages[1]
            .params
            .contains(&("page_size".to_string(), "2".to_string())));

        let records = paginator.collect(&request, &cancel).await.unwrap();
        assert_eq!(ids(&records), vec![1, 2, 3, 4, 5]);
        for mock in mocks {
            mock.assert_hits(2);
        }
    }

    #[tokio::test]
    async fn test_exact_multiple_stops_on_empty_page_within_bound() {
        let server = MockServer::start();
        let all = items(1..7);
        let mocks = serve_pages(
            &server,
            &[
                all[0..3].to_vec(),
                all[3..6].to_vec(),
                Vec::new(),
                items(100..103),
            ],
        );

        let records = paginator(&server)
            .collect(&PageRequest::new("/targets", 3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&records), vec![1, 2, 3, 4, 5, 6]);
        // ceil(6 / 3) + 1 fetches, never the fourth page
        let fetches: usize = mocks.iter().map(|m| m.hits()).sum();
        assert_eq!(fetches, 3);
        assert_eq!(mocks[3].hits(), 0);
    }

    #[tokio::test]
    async fn test_repeats_across_pages_are_dropped_and_shrink_the_page() {
        let server = MockServer::start();
        let all = items(1..5);
        let mocks = serve_pages(
            &server,
            &[
                all[0..2].to_vec(),
                vec![all[1].clone(), all[2].clone()],
                all[3..4].to_vec(),
            ],
        );

        let request = PageRequest::new("/targets", 2).with_unique_key("id");
        let records = paginator(&server)
            .collect(&request, &CancellationToken::new())
            .await
            .unwrap();

        // the second page dedups down to one record and is treated as the last
        assert_eq!(ids(&records), vec![1, 2, 3]);
        assert_eq!(mocks[2].hits(), 0);
    }

    #[tokio::test]
    async fn test_max_pages_guard() {
        let server = MockServer::start();
        let mocks = serve_pages(&server, &[items(1..3), items(3..5), items(5..7)]);

        let records = paginator(&server)
            .with_max_pages(Some(2))
            .collect(&PageRequest::new("/targets", 2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(mocks[2].hits(), 0);
    }

    #[tokio::test]
    async fn test_zero_page_size_fails_without_fetching() {
        let server = MockServer::start();
        let mocks = serve_pages(&server, &[items(1..3)]);

        let err = paginator(&server)
            .collect(&PageRequest::new("/targets", 0), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PaginationError::InvalidArgument(_)));
        assert_eq!(mocks[0].hits(), 0);
    }

    #[tokio::test]
    async fn test_missing_records_field_is_invalid_payload() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/targets");
            then.status(200).json_body(json!({"data": []}));
        });

        let err = paginator(&server)
            .collect(&PageRequest::new("/targets", 2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PaginationError::InvalidPayload { page: 0, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_walk_returns_nothing() {
        let server = MockServer::start();
        let mocks = serve_pages(&server, &[items(1..3)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = paginator(&server)
            .collect(&PageRequest::new("/targets", 2), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaginationError::Cancelled { pages_fetched: 0 }
        ));
        assert_eq!(mocks[0].hits(), 0);
    }
}
