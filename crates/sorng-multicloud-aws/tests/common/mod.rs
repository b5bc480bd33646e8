//! Scripted transport shared by the integration tests.
//!
//! Routes are matched in registration order. Each route replays its
//! responses one per request and keeps repeating the last one. Requests
//! nothing matches get a non-retryable 400 so a missing route fails fast.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sorng_multicloud_aws::{
    AccessEnvironment, AdapterConfig, AwsResult, Credentials, Dispatcher, HttpMethod, HttpRequest,
    HttpResponse, Transport,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

type Matcher = Box<dyn Fn(&HttpRequest) -> bool + Send + Sync>;

struct Route {
    matcher: Matcher,
    responses: VecDeque<HttpResponse>,
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on<F>(&self, matcher: F, responses: Vec<HttpResponse>)
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                matcher: Box::new(matcher),
                responses: responses.into(),
            });
        }
    }

    /// Route by API name (query `Action` or JSON `X-Amz-Target`).
    pub fn on_api(&self, api: &str, responses: Vec<HttpResponse>) {
        let api = api.to_string();
        self.on(move |req| api_name(req).as_deref() == Some(api.as_str()), responses);
    }

    /// Route REST calls by verb and exact path.
    pub fn on_rest(&self, method: HttpMethod, path: &str, responses: Vec<HttpResponse>) {
        let path = path.to_string();
        self.on(
            move |req| req.method == method && request_path(req) == path,
            responses,
        );
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// One label per request: the API name, or `VERB /path` for REST.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|req| {
                api_name(req).unwrap_or_else(|| format!("{} {}", req.method, request_path(req)))
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> AwsResult<HttpResponse> {
        // Let concurrent callers interleave as they would on a real network.
        tokio::task::yield_now().await;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let mut routes = match self.routes.lock() {
            Ok(routes) => routes,
            Err(poisoned) => poisoned.into_inner(),
        };
        for route in routes.iter_mut() {
            if (route.matcher)(&request) {
                let response = if route.responses.len() > 1 {
                    route.responses.pop_front()
                } else {
                    route.responses.front().cloned()
                };
                if let Some(response) = response {
                    return Ok(response);
                }
            }
        }
        Ok(xml(
            400,
            &format!(
                "<ErrorResponse><Error><Code>UnscriptedRequest</Code><Message>{} {}</Message></Error></ErrorResponse>",
                request.method, request.url
            ),
        ))
    }
}

// ── Request inspection ──────────────────────────────────────────────────

fn query_pairs(text: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(text.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Every query and form parameter of a request.
pub fn params(req: &HttpRequest) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Ok(url) = url::Url::parse(&req.url) {
        out.extend(url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())));
    }
    let form = req
        .headers
        .get("content-type")
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if form {
        out.extend(query_pairs(&String::from_utf8_lossy(&req.body)));
    }
    out
}

pub fn api_name(req: &HttpRequest) -> Option<String> {
    if let Some(target) = req.headers.get("x-amz-target") {
        return target.rsplit('.').next().map(str::to_string);
    }
    params(req).get("Action").cloned()
}

pub fn request_path(req: &HttpRequest) -> String {
    url::Url::parse(&req.url)
        .map(|u| u.path().to_string())
        .unwrap_or_default()
}

pub fn json_body(req: &HttpRequest) -> Value {
    serde_json::from_slice(&req.body).unwrap_or(Value::Null)
}

// ── Responses ───────────────────────────────────────────────────────────

fn response(status: u16, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), content_type.to_string());
    headers.insert("x-amzn-requestid".to_string(), "req-test-1".to_string());
    HttpResponse {
        status,
        headers,
        body: body.into(),
    }
}

pub fn xml(status: u16, body: &str) -> HttpResponse {
    response(status, "text/xml", body.to_string())
}

pub fn json(status: u16, body: Value) -> HttpResponse {
    response(status, "application/x-amz-json-1.1", body.to_string())
}

pub fn empty(status: u16) -> HttpResponse {
    response(status, "text/plain", Bytes::new())
}

pub fn with_header(mut resp: HttpResponse, name: &str, value: &str) -> HttpResponse {
    resp.headers.insert(name.to_lowercase(), value.to_string());
    resp
}

/// Query-style error body.
pub fn query_error(status: u16, code: &str) -> HttpResponse {
    xml(
        status,
        &format!(
            "<ErrorResponse><Error><Type>Sender</Type><Code>{}</Code><Message>{}</Message></Error><RequestId>req-err</RequestId></ErrorResponse>",
            code, code
        ),
    )
}

/// JSON-RPC error body.
pub fn json_error(status: u16, code: &str) -> HttpResponse {
    json(status, serde_json::json!({ "__type": code, "message": code }))
}

// ── Dispatcher fixtures ─────────────────────────────────────────────────

pub fn config() -> AdapterConfig {
    let mut config = AdapterConfig::new(
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG", AccessEnvironment::Global)
            .with_owner_account("111111111111"),
    );
    config.default_region = Some("us-west-1".into());
    config.account_name = "acme".into();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub fn dispatcher(transport: &Arc<MockTransport>) -> Dispatcher {
    dispatcher_with(config(), transport)
}

pub fn dispatcher_with(config: AdapterConfig, transport: &Arc<MockTransport>) -> Dispatcher {
    let transport: Arc<dyn Transport> = transport.clone();
    match Dispatcher::new(config, transport) {
        Ok(dispatcher) => dispatcher,
        Err(e) => panic!("test configuration rejected: {}", e),
    }
}
