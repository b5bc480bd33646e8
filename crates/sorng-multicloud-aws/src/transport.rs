//! HTTP transport seam and per-call context.
//!
//! [`Transport`] is the only place bytes leave the process. The production
//! implementation wraps a pooled `reqwest::Client`; tests script responses.

use crate::error::{AwsError, AwsResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// HTTP verbs used by the dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the verb carries a body.
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built, signed request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Raw response. Header names are lowercased.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Provider request id from whichever header the service uses.
    pub fn request_id(&self) -> Option<String> {
        self.header("x-amzn-requestid")
            .or_else(|| self.header("x-amz-request-id"))
            .or_else(|| self.header("x-amz-id-2"))
            .map(str::to_string)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one HTTP request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> AwsResult<HttpResponse>;
}

/// `reqwest` backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            user_agent: "SortOfRemoteNG/1.0 multicloud-aws/0.1".to_string(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> AwsResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut req = self
            .http
            .request(method, &request.url)
            .header("user-agent", &self.user_agent);
        for (k, v) in &request.headers {
            // reqwest derives host from the URL
            if k != "host" {
                req = req.header(k.as_str(), v.as_str());
            }
        }
        if !request.body.is_empty() {
            req = req.body(request.body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_lowercase(),
                    v.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        let body = resp.bytes().await?;
        Ok(HttpResponse { status, headers, body })
    }
}

// ── Call context ────────────────────────────────────────────────────────

/// Cancellation and deadline carried on every dispatch.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every context derived from it.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl CallContext {
    /// No deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().deadline(Instant::now() + timeout)
    }

    /// A context plus the handle that cancels it.
    pub fn cancellable() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle(tx),
            Self {
                deadline: None,
                cancel: Some(rx),
            },
        )
    }

    /// Tighten the deadline. A later deadline than the current one is ignored.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < at => current,
            _ => at,
        });
        self
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Fail fast when the context is already done.
    pub fn check(&self, service: &str) -> AwsResult<()> {
        if self.is_cancelled() {
            return Err(AwsError::timeout(service, "call cancelled"));
        }
        if self.is_expired() {
            return Err(AwsError::timeout(service, "deadline exceeded"));
        }
        Ok(())
    }

    /// Drive `fut` unless the context is cancelled or its deadline passes
    /// first; either yields `Timeout`.
    pub async fn run<T, F>(&self, service: &str, fut: F) -> AwsResult<T>
    where
        F: Future<Output = AwsResult<T>>,
    {
        self.check(service)?;
        let deadline = self.deadline;
        let mut cancel = self.cancel.clone();

        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async move {
            match cancel.as_mut() {
                Some(rx) => loop {
                    if *rx.borrow() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone without cancelling
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(AwsError::timeout(service, "call cancelled")),
            _ = expired => Err(AwsError::timeout(service, "deadline exceeded")),
            result = fut => result,
        }
    }

    /// Sleep that ends early, with `Timeout`, when the context does.
    pub async fn sleep(&self, service: &str, duration: Duration) -> AwsResult<()> {
        self.run(service, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn method_heuristics() {
        assert!(HttpMethod::Put.has_body());
        assert!(!HttpMethod::Delete.has_body());
        assert!(HttpMethod::Head.is_read());
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    }

    #[test]
    fn response_request_id_headers() {
        let mut resp = HttpResponse::default();
        resp.headers.insert("x-amz-request-id".into(), "abc".into());
        assert_eq!(resp.request_id().as_deref(), Some("abc"));
        assert_eq!(resp.header("X-Amz-Request-Id"), Some("abc"));
    }

    #[tokio::test]
    async fn background_context_runs_to_completion() {
        let ctx = CallContext::background();
        let value = ctx.run("test", async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn cancelled_context_yields_timeout() {
        let (handle, ctx) = CallContext::cancellable();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                ctx.run("test", async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn expired_deadline_yields_timeout() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let err = ctx.sleep("test", Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(ctx.check("test").is_err());
    }

    #[test]
    fn deadline_only_tightens() {
        let now = Instant::now();
        let ctx = CallContext::background()
            .deadline(now + Duration::from_secs(10))
            .deadline(now + Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(10));
    }
}
