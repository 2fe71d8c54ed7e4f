use std::pin::pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::{Client, Response, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::LoadTestConfig;
use crate::error::Result;

/// Outcome of one request attempt. Failed results carry no tokens and no TTFT.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestResult {
    pub latency_ms: f64,
    pub ttft_ms: Option<f64>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub success: bool,
    pub error: Option<String>,
    pub tokens_per_second: Option<f64>,
}

impl RequestResult {
    pub fn failure(latency_ms: f64, error: impl Into<String>) -> Self {
        Self {
            latency_ms,
            ttft_ms: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            success: false,
            error: Some(error.into()),
            tokens_per_second: None,
        }
    }
}

/// Performs a single request against the target. Implementations must never
/// fail: every problem is folded into a failed [`RequestResult`].
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self) -> RequestResult;
}

#[async_trait]
impl<T: RequestExecutor + ?Sized> RequestExecutor for std::sync::Arc<T> {
    async fn execute(&self) -> RequestResult {
        (**self).execute().await
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("{0}")]
    Transport(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("invalid response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for AttemptError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AttemptError::Timeout(error_chain(&err))
        } else {
            AttemptError::Transport(error_chain(&err))
        }
    }
}

impl From<EventStreamError<reqwest::Error>> for AttemptError {
    fn from(err: EventStreamError<reqwest::Error>) -> Self {
        match err {
            EventStreamError::Transport(err) => err.into(),
            other => AttemptError::Stream(other.to_string()),
        }
    }
}

/// Renders an error with every cause in its source chain, so connect, DNS
/// and TLS failures keep their underlying reason.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        // some layers already embed their cause in their own message
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Issues chat-completion requests over a shared, pooled HTTP client.
pub struct HttpExecutor {
    client: Client,
    url: Url,
    payload: Value,
    timeout: Duration,
    stream: bool,
}

impl HttpExecutor {
    pub fn new(config: &LoadTestConfig) -> Result<Self> {
        let client = Client::builder()
            .default_headers(config.headers()?)
            .pool_max_idle_per_host(config.concurrency().max(10))
            .connect_timeout(config.timeout())
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            url: config.url().clone(),
            payload: config.request_payload(),
            timeout: config.timeout(),
            stream: config.stream(),
        })
    }

    async fn single_attempt(
        &self,
        start: Instant,
    ) -> std::result::Result<RequestResult, AttemptError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&self.payload)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let latency = start.elapsed();

        if !status.is_success() {
            let snippet = String::from_utf8_lossy(&bytes);
            return Err(AttemptError::Status {
                status: status.as_u16(),
                detail: snippet.chars().take(200).collect(),
            });
        }

        let payload: Value =
            serde_json::from_slice(&bytes).map_err(|err| AttemptError::Body(err.to_string()))?;
        let usage = extract_usage(&payload);
        let completion_tokens = usage.completion_tokens.unwrap_or(0);

        let elapsed_secs = latency.as_secs_f64();
        let tokens_per_second = if elapsed_secs > 0.0 {
            completion_tokens as f64 / elapsed_secs
        } else {
            0.0
        };

        Ok(RequestResult {
            latency_ms: as_millis(latency),
            ttft_ms: None,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens,
            total_tokens: usage.total_tokens.unwrap_or(0),
            success: true,
            error: None,
            tokens_per_second: Some(tokens_per_second),
        })
    }

    async fn streaming_attempt(
        &self,
        start: Instant,
    ) -> std::result::Result<RequestResult, AttemptError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&self.payload)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        // events are read from the body whatever content type the server declares
        let mut events = pin!(response.bytes_stream().eventsource());
        let mut accumulator = StreamAccumulator::new(start);
        while let Some(event) = events.next().await {
            let event = event?;
            if accumulator.push(&event.data, Instant::now()) == StreamControl::Done {
                break;
            }
        }

        Ok(accumulator.finish(Instant::now()))
    }
}

async fn ensure_success(response: Response) -> std::result::Result<Response, AttemptError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let bytes = response.bytes().await?;
    let detail: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
    Err(AttemptError::Status {
        status: status.as_u16(),
        detail: if detail.is_empty() {
            status.canonical_reason().unwrap_or("unexpected status").to_string()
        } else {
            detail
        },
    })
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self) -> RequestResult {
        let start = Instant::now();
        let attempt = async {
            if self.stream {
                self.streaming_attempt(start).await
            } else {
                self.single_attempt(start).await
            }
        };

        let outcome = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AttemptError::Timeout(format!(
                "request exceeded {:.1}s",
                self.timeout.as_secs_f64()
            ))),
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                let message = err.to_string();
                debug!(error = %message, "request failed");
                RequestResult::failure(as_millis(start.elapsed()), message)
            }
        }
    }
}

/// Token counts as reported by the server. Fields missing from the response
/// stay `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReportedUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

pub fn extract_usage(payload: &Value) -> ReportedUsage {
    let usage = payload.get("usage");
    let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_u64);
    ReportedUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    }
}

/// Rough token count for a streamed chunk: one token per four characters, and
/// at least one per non-empty chunk. Only used when the server does not report
/// usage.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.chars().count() as u64 / 4).max(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Done,
}

/// Folds the `data` payloads of a chat-completion event stream into a
/// [`RequestResult`].
#[derive(Debug)]
pub struct StreamAccumulator {
    start: Instant,
    first_token_at: Option<Instant>,
    estimated_tokens: u64,
    reported: Option<ReportedUsage>,
}

impl StreamAccumulator {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            first_token_at: None,
            estimated_tokens: 0,
            reported: None,
        }
    }

    /// Feeds one event payload received at `now`. Payloads that are not valid
    /// JSON are skipped.
    pub fn push(&mut self, data: &str, now: Instant) -> StreamControl {
        let data = data.trim();
        if data == "[DONE]" {
            return StreamControl::Done;
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(error = %err, data, "skipping malformed stream event");
                return StreamControl::Continue;
            }
        };

        let content = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty());
        if let Some(content) = content {
            self.first_token_at.get_or_insert(now);
            self.estimated_tokens += estimate_tokens(content);
        }

        if chunk.get("usage").is_some_and(Value::is_object) {
            self.reported = Some(extract_usage(&chunk));
        }

        StreamControl::Continue
    }

    pub fn ttft_ms(&self) -> Option<f64> {
        self.first_token_at
            .map(|first| as_millis(first.duration_since(self.start)))
    }

    pub fn finish(self, end: Instant) -> RequestResult {
        let reported = self.reported.unwrap_or_default();
        let prompt_tokens = reported.prompt_tokens.unwrap_or(0);
        let completion_tokens = reported.completion_tokens.unwrap_or(self.estimated_tokens);

        let tokens_per_second = match self.first_token_at {
            Some(first) if completion_tokens > 0 => {
                let generation_secs = end.duration_since(first).as_secs_f64();
                if generation_secs > 0.0 {
                    completion_tokens as f64 / generation_secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        RequestResult {
            latency_ms: as_millis(end.duration_since(self.start)),
            ttft_ms: self.ttft_ms(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            success: true,
            error: None,
            tokens_per_second: Some(tokens_per_second),
        }
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
