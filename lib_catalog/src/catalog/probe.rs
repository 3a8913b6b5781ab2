//! # Catalog Probe
//!
//! The two network operations the scanner needs from the marketplace:
//! fetching the newest catalog entry (to derive the anchor) and fetching one
//! item by ID (to classify a candidate).
//!
//! [`CatalogProbe`] is the seam the scanner is generic over. The HTTP
//! implementation is a single client path parameterized by an
//! [`EgressProvider`], direct or proxied alike.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use thiserror::Error;

use crate::core::outcome::FailureClass;
use crate::core::session::SessionCredential;
use crate::retrieve::{EgressHandle, EgressProvider, RetrieveError};

use super::model::{CatalogPage, ItemEnvelope, ItemSummary, ListedItem};

/// HTTP-level result of an item fetch, before allow-set filtering.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Item(ListedItem),
    /// 404, or a success envelope whose status code is not 0.
    NotFound,
    /// 401.
    Unauthorized,
    /// 429.
    RateLimited,
    /// Transport failure, deadline, 5xx, unexpected status or bad payload.
    Unavailable(String),
}

/// Failures of the newest-item request.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("catalog request unauthorized")]
    Unauthorized,

    #[error("catalog request rate limited")]
    RateLimited,

    #[error("catalog request returned http {0}")]
    Status(u16),

    #[error("catalog returned no items")]
    Empty,

    #[error("catalog request failed: {0}")]
    Transport(String),
}

impl ProbeError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ProbeError::Unauthorized => FailureClass::Auth,
            ProbeError::RateLimited => FailureClass::RateLimited,
            ProbeError::Status(_) | ProbeError::Empty | ProbeError::Transport(_) => FailureClass::Transient,
        }
    }
}

pub trait CatalogProbe: Send + Sync + 'static {
    /// Requests the single newest catalog entry.
    fn fetch_anchor_candidate(
        &self,
        session: &SessionCredential,
    ) -> impl Future<Output = Result<ItemSummary, ProbeError>> + Send;

    /// Requests one item's detail and classifies the HTTP-level result.
    fn fetch_item(&self, id: u64, session: &SessionCredential) -> impl Future<Output = FetchOutcome> + Send;
}

pub const NEWEST_ITEM_PATH: &str = "api/v2/catalog/items?per_page=1&order=newest_first";

pub fn item_path(id: u64) -> String {
    format!("api/v2/items/{id}")
}

/// [`CatalogProbe`] over the marketplace's JSON API.
pub struct HttpCatalogProbe {
    egress: Arc<dyn EgressProvider>,
    headers: HeaderMap,
    failure_limit: u32,
    /// Consecutive transport failures per egress slot.
    failures: Mutex<HashMap<usize, u32>>,
}

impl HttpCatalogProbe {
    pub fn new(egress: Arc<dyn EgressProvider>, base_url: &Url, failure_limit: u32) -> Self {
        Self {
            egress,
            headers: catalog_headers(base_url),
            failure_limit,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn record_success(&self, handle: &EgressHandle) {
        self.failures
            .lock()
            .expect("failure counter lock poisoned")
            .remove(&handle.slot);
    }

    fn record_failure(&self, handle: &EgressHandle, err: &RetrieveError) {
        if !err.is_transport() {
            return;
        }
        let exhausted = {
            let mut failures = self.failures.lock().expect("failure counter lock poisoned");
            let count = failures.entry(handle.slot).or_insert(0);
            *count += 1;
            if *count >= self.failure_limit {
                failures.remove(&handle.slot);
                true
            } else {
                false
            }
        };
        if exhausted {
            self.egress.disable(handle);
        }
    }
}

impl CatalogProbe for HttpCatalogProbe {
    async fn fetch_anchor_candidate(&self, session: &SessionCredential) -> Result<ItemSummary, ProbeError> {
        let handle = self
            .egress
            .acquire()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let response = match handle
            .client
            .request::<CatalogPage, ()>(
                Method::GET,
                NEWEST_ITEM_PATH,
                Some(self.headers.clone()),
                Some(&session.cookie),
                None,
            )
            .await
        {
            Ok(response) => {
                self.record_success(&handle);
                response
            }
            Err(err) => {
                self.record_failure(&handle, &err);
                return Err(ProbeError::Transport(err.to_string()));
            }
        };

        match response.status {
            401 => Err(ProbeError::Unauthorized),
            429 => Err(ProbeError::RateLimited),
            _ if !response.success => Err(ProbeError::Status(response.status)),
            _ => response
                .data
                .and_then(|page| page.items.into_iter().next())
                .ok_or(ProbeError::Empty),
        }
    }

    async fn fetch_item(&self, id: u64, session: &SessionCredential) -> FetchOutcome {
        let handle = match self.egress.acquire() {
            Ok(handle) => handle,
            Err(err) => return FetchOutcome::Unavailable(err.to_string()),
        };

        let result = handle
            .client
            .request::<ItemEnvelope, ()>(
                Method::GET,
                &item_path(id),
                Some(self.headers.clone()),
                Some(&session.cookie),
                None,
            )
            .await;

        let response = match result {
            Ok(response) => {
                self.record_success(&handle);
                response
            }
            Err(err) => {
                self.record_failure(&handle, &err);
                tracing::trace!(item_id = id, egress = %handle.label, error = %err, "item fetch failed");
                return FetchOutcome::Unavailable(err.to_string());
            }
        };

        tracing::trace!(item_id = id, status = response.status, egress = %handle.label, "item fetched");
        match response.status {
            401 => FetchOutcome::Unauthorized,
            404 => FetchOutcome::NotFound,
            429 => FetchOutcome::RateLimited,
            status if !response.success => FetchOutcome::Unavailable(format!("http {status}")),
            _ => match response.data {
                Some(ItemEnvelope { code: 0, item: Some(item) }) => FetchOutcome::Item(item),
                _ => FetchOutcome::NotFound,
            },
        }
    }
}

/// Browser-mimic headers sent with every catalog request.
pub fn catalog_headers(base_url: &Url) -> HeaderMap {
    let origin = base_url.as_str().trim_end_matches('/').to_string();
    let catalog = format!("{origin}/catalog");

    let header_list = [
        ("cache-control", "no-cache"),
        ("referer", base_url.as_str()),
        ("origin", catalog.as_str()),
        ("platform", "Windows"),
        ("accept-language", "en-GB"),
        ("content-type", "application/json"),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in header_list {
        if let (Ok(h_name), Ok(h_value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(h_name, h_value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::{ClientOptions, DirectEgress, ProxyPool};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server: answers every connection from `route`, which
    /// maps the request path to `(status, body)`.
    async fn spawn_server(route: fn(&str) -> (u16, String)) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = route(&path);
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.flush().await;
                });
            }
        });

        Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap()
    }

    fn route(path: &str) -> (u16, String) {
        match path {
            "/api/v2/catalog/items?per_page=1&order=newest_first" => {
                (200, r#"{"items":[{"id":9000},{"id":8999}]}"#.to_string())
            }
            "/api/v2/items/1" => (401, "{}".to_string()),
            "/api/v2/items/2" => (404, "{}".to_string()),
            "/api/v2/items/3" => (429, "{}".to_string()),
            "/api/v2/items/4" => (503, "{}".to_string()),
            "/api/v2/items/5" => (200, r#"{"code":104,"message":"not found"}"#.to_string()),
            "/api/v2/items/6" => (
                200,
                format!(
                    r#"{{"code":0,"item":{{"id":6,"country_id":1,"size_id":2,"brand_id":3,"updated_at_ts":"{}"}}}}"#,
                    Utc::now().to_rfc3339()
                ),
            ),
            "/api/v2/items/7" => (200, "not json".to_string()),
            _ => (404, "{}".to_string()),
        }
    }

    fn session() -> SessionCredential {
        SessionCredential {
            cookie: "session=abc".into(),
            issued_at: Utc::now(),
            generation: 0,
        }
    }

    async fn direct_probe() -> HttpCatalogProbe {
        let base = spawn_server(route).await;
        let egress = DirectEgress::new(base.clone(), &ClientOptions::default()).unwrap();
        HttpCatalogProbe::new(Arc::new(egress), &base, 3)
    }

    #[tokio::test]
    async fn test_anchor_reads_first_item() {
        let probe = direct_probe().await;
        let summary = probe.fetch_anchor_candidate(&session()).await.unwrap();
        assert_eq!(summary.id, 9000);
    }

    #[tokio::test]
    async fn test_item_status_classification() {
        let probe = direct_probe().await;
        let s = session();
        assert!(matches!(probe.fetch_item(1, &s).await, FetchOutcome::Unauthorized));
        assert!(matches!(probe.fetch_item(2, &s).await, FetchOutcome::NotFound));
        assert!(matches!(probe.fetch_item(3, &s).await, FetchOutcome::RateLimited));
        assert!(matches!(probe.fetch_item(4, &s).await, FetchOutcome::Unavailable(_)));
        assert!(matches!(probe.fetch_item(5, &s).await, FetchOutcome::NotFound));
        assert!(matches!(probe.fetch_item(7, &s).await, FetchOutcome::Unavailable(_)));
        match probe.fetch_item(6, &s).await {
            FetchOutcome::Item(item) => {
                assert_eq!(item.id, 6);
                assert_eq!(item.brand_id, Some(3));
            }
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_disabled_after_limit() {
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        let options = ClientOptions {
            timeout: Duration::from_millis(300),
            ..ClientOptions::default()
        };
        // Nothing listens on these ports: every request is a transport failure.
        let pool = Arc::new(
            ProxyPool::new(base.clone(), &["http://127.0.0.1:1".to_string()], &options).unwrap(),
        );
        let probe = HttpCatalogProbe::new(pool.clone(), &base, 2);

        assert!(matches!(probe.fetch_item(1, &session()).await, FetchOutcome::Unavailable(_)));
        assert_eq!(pool.enabled_count(), 1);
        assert!(matches!(probe.fetch_item(1, &session()).await, FetchOutcome::Unavailable(_)));
        assert_eq!(pool.enabled_count(), 0);
        assert!(matches!(
            probe.fetch_anchor_candidate(&session()).await,
            Err(ProbeError::Transport(_))
        ));
    }

    #[test]
    fn test_catalog_headers_follow_base_url() {
        let headers = catalog_headers(&Url::parse("https://www.vinted.co.uk/").unwrap());
        assert_eq!(headers["origin"], "https://www.vinted.co.uk/catalog");
        assert_eq!(headers["referer"], "https://www.vinted.co.uk/");
        assert_eq!(headers["accept-language"], "en-GB");
    }
}
