//! Outbound HTTP shared by acquisition and webhook dispatch.
//!
//! Every attempt passes through a [`Scheduler`] that spaces request starts
//! within a scope; transient failures are retried with exponential backoff.

use rand::Rng;
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::redirect::Policy;
use reqwest::Method;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{TransportCause, TransportError};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Minimum gap between request starts in one scope.
    pub request_delay: Duration,
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(2),
            max_retries: 3,
            timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            user_agent: format!("scout/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Per-scope record of the last request start.
///
/// A caller keeps the scope's slot locked while it sleeps, so callers queued
/// on the same scope start at least `min_interval` apart.
#[derive(Debug)]
pub struct Scheduler {
    min_interval: Duration,
    scopes: Mutex<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl Scheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Block until `scope` may start another request; returns the start time.
    pub fn acquire(&self, scope: &str) -> Instant {
        let slot = {
            let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(scopes.entry(scope.to_string()).or_default())
        };

        let mut last = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let ready = previous + self.min_interval;
            let now = Instant::now();
            if ready > now {
                debug!(scope, wait_ms = (ready - now).as_millis() as u64, "rate limit wait");
                thread::sleep(ready - now);
            }
        }
        let started = Instant::now();
        *last = Some(started);
        started
    }
}

pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

impl fmt::Debug for RequestBody {
    // Bodies carry passwords and webhook secrets; only the shape is printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Form(fields) => f
                .debug_tuple("Form")
                .field(&fields.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())
                .finish(),
            RequestBody::Json(value) => {
                let keys: Vec<&str> = value
                    .as_object()
                    .map(|obj| obj.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                f.debug_tuple("Json").field(&keys).finish()
            }
        }
    }
}

pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Form(fields),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field(
                "headers",
                &self.headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .field("body", &self.body)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

/// Blocking HTTP client with scoped rate limiting and retry.
///
/// Clones share one [`Scheduler`], spaced by `config.request_delay`.
#[derive(Clone)]
pub struct RateLimitedTransport {
    client: Client,
    config: TransportConfig,
    scheduler: Arc<Scheduler>,
}

impl RateLimitedTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = build_client(
            Client::builder()
                .timeout(config.timeout)
                .user_agent(config.user_agent.clone())
                .cookie_store(true),
        )?;
        let scheduler = Arc::new(Scheduler::new(config.request_delay));
        Ok(Self {
            client,
            config,
            scheduler,
        })
    }

    /// Copy that never follows redirects and, given a `host`, connects it
    /// only to `addrs`. Shares this transport's scheduler.
    ///
    /// Used for destinations whose addresses were already vetted, so the
    /// request cannot land anywhere the check did not see.
    pub fn pinned(&self, host: Option<&str>, addrs: &[SocketAddr]) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone())
            .redirect(Policy::none());
        if let Some(host) = host.filter(|_| !addrs.is_empty()) {
            builder = builder.resolve_to_addrs(host, addrs);
        }
        Ok(Self {
            client: build_client(builder)?,
            config: self.config.clone(),
            scheduler: Arc::clone(&self.scheduler),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Send with retries on transient failures.
    pub fn send(&self, scope: &str, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self.attempt(scope, request) {
                Ok((status, body)) => {
                    return Ok(TransportResponse {
                        status,
                        body,
                        attempts: attempt,
                    });
                }
                Err(cause) if cause.is_transient() && attempt < max_attempts => {
                    let backoff = self.retry_backoff(attempt);
                    warn!(
                        scope,
                        url = %request.url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %cause,
                        "retrying request"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(cause) => {
                    return Err(TransportError {
                        cause,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Single attempt, no retries.
    pub fn send_once(&self, scope: &str, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        self.attempt(scope, request)
            .map(|(status, body)| TransportResponse {
                status,
                body,
                attempts: 1,
            })
            .map_err(|cause| TransportError { cause, attempts: 1 })
    }

    fn attempt(&self, scope: &str, request: &OutboundRequest) -> Result<(u16, String), TransportCause> {
        self.scheduler.acquire(scope);
        debug!(scope, method = %request.method, url = %request.url, "sending request");

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };

        let response = builder.send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportCause::Status {
                status: status.as_u16(),
            });
        }
        let body = response.text().map_err(classify)?;
        debug!(scope, status = status.as_u16(), bytes = body.len(), "response received");
        Ok((status.as_u16(), body))
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = if base == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base / 4)
        };
        Duration::from_millis(exp + jitter)
    }
}

fn build_client(builder: ClientBuilder) -> Result<Client, TransportError> {
    builder.build().map_err(|e| TransportError {
        cause: TransportCause::InvalidRequest(format!("failed to build HTTP client: {e}")),
        attempts: 0,
    })
}

fn classify(err: reqwest::Error) -> TransportCause {
    if err.is_timeout() {
        TransportCause::Timeout
    } else if err.is_connect() {
        TransportCause::Connect(err.to_string())
    } else if err.is_builder() {
        TransportCause::InvalidRequest(err.to_string())
    } else {
        TransportCause::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(max_retries: u32) -> RateLimitedTransport {
        let config = TransportConfig {
            request_delay: Duration::ZERO,
            max_retries,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        };
        RateLimitedTransport::new(config).unwrap()
    }

    #[test]
    fn test_send_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/ok")
            .with_status(200)
            .with_body("hello")
            .expect(1)
            .create();

        let response = transport(3)
            .send("test", &OutboundRequest::get(format!("{}/ok", server.url())))
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "hello");
        assert_eq!(response.attempts, 1);
        mock.assert();
    }

    #[test]
    fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new();
        let mock = server.mock("GET", "/missing").with_status(404).expect(1).create();

        let err = transport(3)
            .send("test", &OutboundRequest::get(format!("{}/missing", server.url())))
            .unwrap_err();
        assert_eq!(err.cause, TransportCause::Status { status: 404 });
        assert_eq!(err.attempts, 1);
        mock.assert();
    }

    #[test]
    fn test_server_error_exhausts_retries() {
        let mut server = mockito::Server::new();
        let mock = server.mock("GET", "/flaky").with_status(503).expect(3).create();

        let err = transport(2)
            .send("test", &OutboundRequest::get(format!("{}/flaky", server.url())))
            .unwrap_err();
        assert_eq!(err.cause, TransportCause::Status { status: 503 });
        assert_eq!(err.attempts, 3);
        mock.assert();
    }

    #[test]
    fn test_send_once_does_not_retry() {
        let mut server = mockito::Server::new();
        let mock = server.mock("POST", "/login").with_status(500).expect(1).create();

        let request = OutboundRequest::post_form(
            format!("{}/login", server.url()),
            vec![("username".into(), "u".into()), ("password".into(), "p".into())],
        );
        let err = transport(3).send_once("auth", &request).unwrap_err();
        assert_eq!(err.attempts, 1);
        mock.assert();
    }

    #[test]
    fn test_json_body_and_headers_are_sent() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/hook")
            .match_header("x-source", "scout")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"a": 1})))
            .with_status(202)
            .with_body("queued")
            .create();

        let request = OutboundRequest::post_json(format!("{}/hook", server.url()), serde_json::json!({"a": 1}))
            .header("x-source", "scout");
        let response = transport(0).send("webhook", &request).unwrap();
        assert_eq!(response.status, 202);
        mock.assert();
    }

    #[test]
    fn test_debug_hides_body_values() {
        let request = OutboundRequest::post_form(
            "https://portal.example.com/login",
            vec![("password".into(), "hunter2".into())],
        )
        .header("authorization", "Bearer abc");
        let debug = format!("{:?}", request);
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("Bearer"));

        let json = OutboundRequest::post_json("https://x.example.com", serde_json::json!({"secret": "s3"}));
        assert!(!format!("{:?}", json).contains("s3\""));
    }

    #[test]
    fn test_scheduler_follows_request_delay() {
        let config = TransportConfig {
            request_delay: Duration::from_millis(750),
            ..Default::default()
        };
        let transport = RateLimitedTransport::new(config).unwrap();
        assert_eq!(transport.scheduler().min_interval(), Duration::from_millis(750));
        let copy = transport.clone();
        assert!(Arc::ptr_eq(transport.scheduler(), copy.scheduler()));
    }

    #[test]
    fn test_pinned_transport_does_not_follow_redirects() {
        let mut server = mockito::Server::new();
        let moved = server
            .mock("POST", "/hook")
            .with_status(302)
            .with_header("location", &format!("{}/internal", server.url()))
            .create();
        let internal = server.mock("GET", "/internal").expect(0).create();

        let base = transport(0);
        let pinned = base.pinned(None, &[]).unwrap();
        assert!(Arc::ptr_eq(base.scheduler(), pinned.scheduler()));
        let err = pinned
            .send(
                "webhook",
                &OutboundRequest::post_json(format!("{}/hook", server.url()), serde_json::json!({})),
            )
            .unwrap_err();
        assert_eq!(err.cause, TransportCause::Status { status: 302 });
        moved.assert();
        internal.assert();
    }

    #[test]
    fn test_pinned_transport_uses_given_addresses() {
        let mut server = mockito::Server::new();
        let hook = server.mock("POST", "/hook").with_status(200).with_body("ok").create();
        let local: SocketAddr = server.host_with_port().parse().unwrap();

        // Unresolvable name; only the pinned address makes this reachable
        let pinned = transport(0).pinned(Some("hooks.scout.invalid"), &[local]).unwrap();
        let response = pinned
            .send(
                "webhook",
                &OutboundRequest::post_json(
                    format!("http://hooks.scout.invalid:{}/hook", local.port()),
                    serde_json::json!({}),
                ),
            )
            .unwrap();
        assert_eq!(response.body, "ok");
        hook.assert();
    }

    #[test]
    fn test_scheduler_spaces_concurrent_callers() {
        let interval = Duration::from_millis(40);
        let scheduler = Arc::new(Scheduler::new(interval));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || scheduler.acquire("portal"))
            })
            .collect();
        let mut starts: Vec<Instant> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        starts.sort();

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[test]
    fn test_scheduler_scopes_are_independent() {
        let scheduler = Scheduler::new(Duration::from_secs(5));
        let begin = Instant::now();
        scheduler.acquire("portal");
        scheduler.acquire("webhook");
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
