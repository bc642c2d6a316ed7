//! REST transport for the upstream platform API.
//!
//! Every call is a single synchronous request/response exchange; no retry,
//! backoff, or caching. Responses arrive in a `{code, message, data}`
//! envelope; a non-success code surfaces verbatim as [`HubError::Api`] so
//! callers can special-case `NotFound` and pass everything else through.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.pipeform.dev";
const LIST_PAGE_LIMIT: usize = 100;

fn max_pages() -> usize {
    std::env::var("PIPEFORM_MAX_PAGES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1000)
}

/// Transport failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Upstream replied with a non-success envelope code.
    #[error("upstream {code}: {message}")]
    Api { code: String, message: String },
    /// Network failure or a response that was not the expected envelope.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// Cursor chain exceeded the page cap; treated as a protocol violation
    /// rather than truncating, since a truncated collection would make a
    /// reconciler revoke entries it never saw.
    #[error("pagination did not terminate after {0} pages")]
    PaginationOverflow(usize),
}

impl HubError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HubError::Api { code, .. } if code == "NotFound")
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Json,
}

/// One page of a listing call.
#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Json>,
    pub next_cursor: Option<String>,
}

/// Narrow seam the resource layer talks through; mockable in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<Json, HubError>;
    async fn post(&self, path: &str, body: &Json) -> Result<Json, HubError>;
    async fn patch(&self, path: &str, body: &Json) -> Result<Json, HubError>;
    async fn delete(&self, path: &str) -> Result<(), HubError>;
    async fn list_page(&self, path: &str, cursor: Option<&str>) -> Result<Page, HubError>;
}

/// Accumulate every item behind a cursor-paginated listing path.
///
/// Terminates when the upstream returns an empty cursor; an upstream that
/// never does is cut off after `PIPEFORM_MAX_PAGES` pages (default 1000).
pub async fn fetch_all(transport: &dyn Transport, path: &str) -> Result<Vec<Json>, HubError> {
    fetch_all_capped(transport, path, max_pages()).await
}

pub async fn fetch_all_capped(
    transport: &dyn Transport,
    path: &str,
    cap: usize,
) -> Result<Vec<Json>, HubError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    for page_no in 0..cap {
        let page = transport.list_page(path, cursor.as_deref()).await?;
        debug!(path, page_no, fetched = page.items.len(), "list page");
        items.extend(page.items);
        match page.next_cursor {
            Some(c) if !c.is_empty() => cursor = Some(c),
            _ => return Ok(items),
        }
    }
    warn!(path, cap, "cursor chain never terminated");
    Err(HubError::PaginationOverflow(cap))
}

/// Key/secret-authenticated client for the platform REST API.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, HubError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    /// Build a client from `PIPEFORM_API_KEY` / `PIPEFORM_API_SECRET`,
    /// with `PIPEFORM_API_BASE` overriding the default endpoint.
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        let api_key =
            std::env::var("PIPEFORM_API_KEY").context("PIPEFORM_API_KEY not set")?;
        let api_secret =
            std::env::var("PIPEFORM_API_SECRET").context("PIPEFORM_API_SECRET not set")?;
        let base_url =
            std::env::var("PIPEFORM_API_BASE").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(base_url, api_key, api_secret)?)
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Json>,
    ) -> Result<Json, HubError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        // Error statuses still carry the envelope; decode uniformly.
        let envelope: Envelope = resp.json().await?;
        if envelope.code.starts_with("Success") {
            Ok(envelope.data)
        } else {
            Err(HubError::Api {
                code: envelope.code,
                message: envelope.message,
            })
        }
    }
}

/// Query pairs for one listing call. Structured pairs so the HTTP layer
/// percent-encodes opaque cursors instead of splicing them into the URL raw.
fn list_query(cursor: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", LIST_PAGE_LIMIT.to_string())];
    if let Some(c) = cursor {
        query.push(("cursor", c.to_string()));
    }
    query
}

#[async_trait]
impl Transport for RestClient {
    async fn get(&self, path: &str) -> Result<Json, HubError> {
        self.call(reqwest::Method::GET, path, &[], None).await
    }

    async fn post(&self, path: &str, body: &Json) -> Result<Json, HubError> {
        self.call(reqwest::Method::POST, path, &[], Some(body)).await
    }

    async fn patch(&self, path: &str, body: &Json) -> Result<Json, HubError> {
        self.call(reqwest::Method::PATCH, path, &[], Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<(), HubError> {
        self.call(reqwest::Method::DELETE, path, &[], None)
            .await
            .map(|_| ())
    }

    async fn list_page(&self, path: &str, cursor: Option<&str>) -> Result<Page, HubError> {
        let data = self
            .call(reqwest::Method::GET, path, &list_query(cursor), None)
            .await?;
        let items = data
            .get("items")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();
        let next_cursor = data
            .get("next_cursor")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());
        Ok(Page { items, next_cursor })
    }
}

// ----------------- Mock implementation -----------------

/// In-memory transport for tests: canned responses per `METHOD path` route
/// plus a record of every call in arrival order.
#[derive(Default)]
pub struct MockTransport {
    responses: std::sync::Mutex<std::collections::HashMap<String, Json>>,
    failures: std::sync::Mutex<std::collections::HashMap<String, (String, String)>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` for a route such as `"GET /v1/connectors/c1"`.
    pub fn respond(&self, route: &str, data: Json) {
        self.responses
            .lock()
            .expect("mock lock")
            .insert(route.to_string(), data);
    }

    /// Fail a route with an upstream envelope code.
    pub fn fail(&self, route: &str, code: &str, message: &str) {
        self.failures
            .lock()
            .expect("mock lock")
            .insert(route.to_string(), (code.to_string(), message.to_string()));
    }

    /// Calls seen so far, formatted as `METHOD path`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock lock").clone()
    }

    fn dispatch(&self, method: &str, path: &str) -> Result<Json, HubError> {
        let route = format!("{method} {path}");
        self.calls.lock().expect("mock lock").push(route.clone());
        if let Some((code, message)) = self.failures.lock().expect("mock lock").get(&route) {
            return Err(HubError::Api {
                code: code.clone(),
                message: message.clone(),
            });
        }
        match self.responses.lock().expect("mock lock").get(&route) {
            Some(data) => Ok(data.clone()),
            None => Err(HubError::Api {
                code: "NotFound".to_string(),
                message: format!("no mock response for {route}"),
            }),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, path: &str) -> Result<Json, HubError> {
        self.dispatch("GET", path)
    }

    async fn post(&self, path: &str, _body: &Json) -> Result<Json, HubError> {
        self.dispatch("POST", path)
    }

    async fn patch(&self, path: &str, _body: &Json) -> Result<Json, HubError> {
        self.dispatch("PATCH", path)
    }

    async fn delete(&self, path: &str) -> Result<(), HubError> {
        self.dispatch("DELETE", path).map(|_| ())
    }

    async fn list_page(&self, path: &str, _cursor: Option<&str>) -> Result<Page, HubError> {
        let data = self.dispatch("LIST", path)?;
        let items = data.as_array().cloned().unwrap_or_default();
        Ok(Page {
            items,
            next_cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Stub that serves a fixed sequence of pages and counts invocations.
    struct PagedStub {
        pages: Vec<Page>,
        calls: Mutex<usize>,
    }

    impl PagedStub {
        fn new(pages: Vec<Page>) -> Self {
            Self {
                pages,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for PagedStub {
        async fn get(&self, _path: &str) -> Result<Json, HubError> {
            unimplemented!("stub only lists")
        }
        async fn post(&self, _path: &str, _body: &Json) -> Result<Json, HubError> {
            unimplemented!("stub only lists")
        }
        async fn patch(&self, _path: &str, _body: &Json) -> Result<Json, HubError> {
            unimplemented!("stub only lists")
        }
        async fn delete(&self, _path: &str) -> Result<(), HubError> {
            unimplemented!("stub only lists")
        }
        async fn list_page(&self, _path: &str, cursor: Option<&str>) -> Result<Page, HubError> {
            let mut calls = self.calls.lock().unwrap();
            let idx = match cursor {
                None => 0,
                Some(c) => c.parse::<usize>().unwrap(),
            };
            *calls += 1;
            let page = &self.pages[idx % self.pages.len()];
            Ok(Page {
                items: page.items.clone(),
                next_cursor: page.next_cursor.clone(),
            })
        }
    }

    fn page(items: Vec<Json>, next: Option<&str>) -> Page {
        Page {
            items,
            next_cursor: next.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn fetch_all_concatenates_pages_in_order() {
        let stub = PagedStub::new(vec![
            page(vec![json!(1), json!(2)], Some("1")),
            page(vec![json!(3)], Some("2")),
            page(vec![json!(4)], None),
        ]);
        let items = fetch_all(&stub, "/v1/things").await.unwrap();
        assert_eq!(items, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn empty_string_cursor_also_terminates() {
        let stub = PagedStub::new(vec![page(vec![json!("only")], Some(""))]);
        let items = fetch_all(&stub, "/v1/things").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn runaway_cursor_chain_is_a_hard_error() {
        // Always points back at itself.
        let stub = PagedStub::new(vec![page(vec![json!("x")], Some("0"))]);
        let err = fetch_all_capped(&stub, "/v1/things", 5).await.unwrap_err();
        assert!(matches!(err, HubError::PaginationOverflow(5)));
        assert_eq!(stub.calls(), 5);
    }

    #[test]
    fn cursors_become_structured_query_pairs() {
        // Opaque cursor tokens can contain URL metacharacters; they must
        // reach the encoder verbatim, not pre-spliced into the path.
        let query = list_query(Some("a+b&c=d"));
        assert_eq!(query[0], ("limit", LIST_PAGE_LIMIT.to_string()));
        assert_eq!(query[1], ("cursor", "a+b&c=d".to_string()));
        assert_eq!(list_query(None).len(), 1);
    }

    #[test]
    fn envelope_decodes_with_optional_parts() {
        let env: Envelope =
            serde_json::from_value(json!({"code": "Success", "data": {"id": "c1"}})).unwrap();
        assert_eq!(env.code, "Success");
        assert!(env.message.is_empty());
        assert_eq!(env.data["id"], "c1");

        let not_found: Envelope =
            serde_json::from_value(json!({"code": "NotFound", "message": "gone"})).unwrap();
        let err = HubError::Api {
            code: not_found.code,
            message: not_found.message,
        };
        assert!(err.is_not_found());
    }
}
