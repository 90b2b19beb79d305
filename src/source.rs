//! Upstream source access.
//!
//! The upstream API serves each entity as a paginated collection:
//! `GET {base}/{endpoint}?page=N&size=S` returning
//! `{ "items": [...], "pages": P, ... }`. [`SourceReader`] is the seam the
//! extractor paginates over; [`HttpSourceReader`] is the production
//! implementation. Tests substitute in-memory readers.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::model::EntityKind;

/// Errors raised while fetching a page. Both variants are fatal for the
/// extraction of that entity type; retry policy lives with the external
/// scheduler, not here.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The upstream endpoint could not be reached or answered non-2xx.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The response body was not the expected page payload.
    #[error("malformed page: {0}")]
    MalformedPage(String),
}

/// One page of raw records.
#[derive(Debug, Clone)]
pub struct Page {
    /// Records in upstream order.
    pub records: Vec<Value>,

    /// Total page count as reported by the endpoint, when it reports one.
    pub total_pages: Option<u32>,
}

/// Read access to one paginated upstream source.
///
/// Implementations must be `Send + Sync`; the extractor drives pagination and
/// never retries. Page numbering starts at 1, matching the upstream API.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetches a single page of raw records for the given entity type.
    ///
    /// # Errors
    ///
    /// [`SourceError::UpstreamUnavailable`] when the request itself fails or
    /// the endpoint answers non-2xx; [`SourceError::MalformedPage`] when the
    /// body cannot be interpreted as a page payload.
    async fn fetch_page(
        &self,
        entity: EntityKind,
        page: u32,
        page_size: u32,
    ) -> Result<Page, SourceError>;
}

#[async_trait]
impl<R: SourceReader + ?Sized> SourceReader for std::sync::Arc<R> {
    async fn fetch_page(
        &self,
        entity: EntityKind,
        page: u32,
        page_size: u32,
    ) -> Result<Page, SourceError> {
        (**self).fetch_page(entity, page, page_size).await
    }
}

/// HTTP implementation of [`SourceReader`] over `reqwest`.
pub struct HttpSourceReader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSourceReader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceReader for HttpSourceReader {
    async fn fetch_page(
        &self,
        entity: EntityKind,
        page: u32,
        page_size: u32,
    ) -> Result<Page, SourceError> {
        let url = format!(
            "{}/{}?page={}&size={}",
            self.base_url,
            entity.endpoint(),
            page,
            page_size
        );
        debug!(%url, "fetching page");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::UpstreamUnavailable(format!(
                "{} answered {}",
                url, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::MalformedPage(e.to_string()))?;

        let records = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SourceError::MalformedPage(format!(
                    "page {} for '{}' is missing the 'items' array",
                    page, entity
                ))
            })?
            .clone();

        let total_pages = body
            .get("pages")
            .and_then(Value::as_u64)
            .map(|p| p as u32);

        Ok(Page {
            records,
            total_pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_items_and_pages_hint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tracks"))
            .and(query_param("page", "1"))
            .and(query_param("size", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 1}, {"id": 2}],
                "total": 3,
                "page": 1,
                "size": 2,
                "pages": 2,
            })))
            .mount(&server)
            .await;

        let reader = HttpSourceReader::new(server.uri());
        let page = reader.fetch_page(EntityKind::Tracks, 1, 2).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_pages, Some(2));
    }

    #[tokio::test]
    async fn non_2xx_is_upstream_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reader = HttpSourceReader::new(server.uri());
        let err = reader
            .fetch_page(EntityKind::Users, 1, 100)
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_items_is_malformed_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pages": 1})))
            .mount(&server)
            .await;

        let reader = HttpSourceReader::new(server.uri());
        let err = reader
            .fetch_page(EntityKind::Users, 1, 100)
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::MalformedPage(_)));
    }

    #[tokio::test]
    async fn non_json_body_is_malformed_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/listen_history"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let reader = HttpSourceReader::new(server.uri());
        let err = reader
            .fetch_page(EntityKind::ListenHistory, 1, 100)
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::MalformedPage(_)));
    }
}
