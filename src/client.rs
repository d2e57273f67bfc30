use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{wait_for_tick, Clock};
use crate::config::LoadTestConfig;
use crate::error::Result;
use crate::log_store::CapturedRequest;
use crate::summary::Signature;

/// Headers the HTTP stack or the session cookie jar own. Never replayed.
const MANAGED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "cookie",
];

// =============================================================================
// Results
// =============================================================================

/// Outcome of one replayed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResult {
    pub method: String,
    pub url: String,
    /// `None` when no response was received.
    pub status_code: Option<u16>,
    /// Transport-level failure. Always the last result of its client.
    pub error: Option<String>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: String,
    pub response_time: Duration,
    /// Clock tick at which the request went out.
    pub dispatch_tick: u64,
}

impl RequestResult {
    fn new(request: &CapturedRequest, dispatch_tick: u64) -> Self {
        Self {
            method: request.method.clone(),
            url: request.url.clone(),
            status_code: None,
            error: None,
            response_headers: Vec::new(),
            response_body: String::new(),
            response_time: Duration::ZERO,
            dispatch_tick,
        }
    }

    pub fn signature(&self) -> Signature {
        Signature {
            status_code: self.status_code,
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Status line followed by one `Name: value` line per header.
    pub fn format_response_head(&self) -> String {
        let mut head = match self.status_code {
            Some(code) => {
                let reason = StatusCode::from_u16(code)
                    .ok()
                    .and_then(|status| status.canonical_reason())
                    .unwrap_or("");
                format!("HTTP {} {}", code, reason).trim_end().to_string()
            }
            None => "HTTP (no response)".to_string(),
        };
        for (name, value) in &self.response_headers {
            head.push_str("\r\n");
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
        }
        head
    }
}

/// Everything one virtual client produced, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResult {
    pub client_number: usize,
    /// Offset from test start at which the client was spawned.
    pub spawned_at: Duration,
    pub results: Vec<RequestResult>,
}

impl ClientResult {
    pub fn failed(&self) -> bool {
        self.results.last().is_some_and(RequestResult::is_error)
    }
}

// =============================================================================
// Virtual Client
// =============================================================================

/// One simulated user replaying the captured sequence with its own clock and
/// cookie jar.
pub struct VirtualClient {
    number: usize,
    spawned_at: Duration,
    clock: Arc<dyn Clock>,
    session: reqwest::Client,
    replay_headers: bool,
}

impl VirtualClient {
    pub fn new(
        number: usize,
        spawned_at: Duration,
        clock: Arc<dyn Clock>,
        config: &LoadTestConfig,
    ) -> Result<Self> {
        Ok(Self {
            number,
            spawned_at,
            clock,
            session: build_session(config)?,
            replay_headers: config.replay_headers,
        })
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// Replays `requests` in order, each no earlier than its recorded tick.
    /// Stops at the first transport failure.
    pub async fn run(self, requests: &[CapturedRequest]) -> ClientResult {
        self.clock.start();
        debug!("Client {} started", self.number);

        let mut results = Vec::with_capacity(requests.len());
        for (position, request) in requests.iter().enumerate() {
            if !wait_for_tick(self.clock.as_ref(), request.time).await {
                warn!(
                    "Client {} lost its clock before request {} was due",
                    self.number, position
                );
                break;
            }

            let result = self.dispatch(request).await;
            if let Some(error) = &result.error {
                warn!(
                    "Client {} request {} {} {} failed: {}",
                    self.number, position, result.method, result.url, error
                );
                results.push(result);
                break;
            }
            results.push(result);
        }

        self.clock.stop();
        debug!("Client {} finished after {} requests", self.number, results.len());

        ClientResult {
            client_number: self.number,
            spawned_at: self.spawned_at,
            results,
        }
    }

    async fn dispatch(&self, request: &CapturedRequest) -> RequestResult {
        let mut result = RequestResult::new(request, self.clock.current());
        debug!(
            "Client {} dispatching {} {} at tick {}",
            self.number, request.method, request.url, result.dispatch_tick
        );

        let start = Instant::now();
        if let Err(error) = self.send(request, &mut result).await {
            result.error = Some(error);
        }
        result.response_time = start.elapsed();
        result
    }

    async fn send(
        &self,
        request: &CapturedRequest,
        result: &mut RequestResult,
    ) -> std::result::Result<(), String> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("invalid method {:?}: {}", request.method, e))?;
        let url = Url::parse(&request.url).map_err(|e| format!("invalid URL: {}", e))?;

        let mut builder = self.session.request(method, url);
        if self.replay_headers {
            for (name, value) in replayable_headers(request) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        result.status_code = Some(response.status().as_u16());
        result.response_headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| format!("failed to read response body: {}", e))?;
            body.extend_from_slice(&chunk);
        }
        result.response_body = String::from_utf8_lossy(&body).into_owned();
        Ok(())
    }
}

fn build_session(config: &LoadTestConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().cookie_store(true);
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

fn is_replayable_header(name: &str) -> bool {
    !MANAGED_HEADERS
        .iter()
        .any(|managed| managed.eq_ignore_ascii_case(name))
}

fn replayable_headers(request: &CapturedRequest) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    for (name, values) in &request.header {
        if !is_replayable_header(name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Skipping invalid header name {:?}", name);
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(header_value) => headers.push((header_name.clone(), header_value)),
                Err(_) => debug!("Skipping invalid value for header {:?}", name),
            }
        }
    }
    headers
}
