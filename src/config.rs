use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{LoadTestError, Result};

/// Streaming runs need at least this much time per request.
pub const MIN_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on `max_tokens` when streaming.
pub const MAX_STREAM_TOKENS: u32 = 1000;

pub const DEFAULT_PROMPT: &str = "Explain the theory of relativity in simple terms.";

const PLACEHOLDER_API_KEY: &str = "dummy";

#[derive(Clone, Debug)]
pub struct LoadTestConfig {
    url: Url,
    api_key: Option<String>,
    timeout: Duration,
    model_name: String,
    max_tokens: u32,
    temperature: f64,
    total_requests: usize,
    concurrency: usize,
    warmup_count: usize,
    stream: bool,
    prompt: String,
}

impl LoadTestConfig {
    pub fn builder(url: impl Into<String>, model_name: impl Into<String>) -> LoadTestConfigBuilder {
        LoadTestConfigBuilder::new(url, model_name)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn total_requests(&self) -> usize {
        self.total_requests
    }

    /// Effective concurrency, never larger than `total_requests`.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn warmup_count(&self) -> usize {
        self.warmup_count
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Default headers attached to every request. Falls back to a placeholder
    /// bearer token when no key is configured, which local servers accept.
    pub fn headers(&self) -> Result<HeaderMap> {
        let token = self.api_key.as_deref().unwrap_or(PLACEHOLDER_API_KEY);
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            LoadTestError::Config("api_key contains characters not allowed in a header".into())
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Chat-completion body sent with every request.
    pub fn request_payload(&self) -> Value {
        let mut body = json!({
            "model": self.model_name,
            "messages": [
                {
                    "role": "user",
                    "content": self.prompt,
                }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        if self.stream {
            if let Some(map) = body.as_object_mut() {
                map.insert("stream".to_string(), json!(true));
            }
        }

        body
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            url: self.url.to_string(),
            model: self.model_name.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            total_requests: self.total_requests,
            concurrency: self.concurrency,
            warmup_count: self.warmup_count,
            stream: self.stream,
            timeout_secs: self.timeout.as_secs_f64(),
            api_key_set: self.api_key.is_some(),
        }
    }
}

/// Loggable view of a [`LoadTestConfig`]; the API key itself is left out.
#[derive(Clone, Debug, Serialize)]
pub struct ConfigSummary {
    pub url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub total_requests: usize,
    pub concurrency: usize,
    pub warmup_count: usize,
    pub stream: bool,
    pub timeout_secs: f64,
    pub api_key_set: bool,
}

#[derive(Clone, Debug)]
pub struct LoadTestConfigBuilder {
    url: String,
    model_name: String,
    api_key: Option<String>,
    timeout: Duration,
    max_tokens: u32,
    temperature: f64,
    total_requests: usize,
    concurrency: usize,
    warmup_count: usize,
    stream: bool,
    prompt: String,
}

impl LoadTestConfigBuilder {
    pub fn new(url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model_name: model_name.into(),
            api_key: None,
            timeout: Duration::from_secs(120),
            max_tokens: 128,
            temperature: 0.0,
            total_requests: 50,
            concurrency: 1,
            warmup_count: 5,
            stream: false,
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_total_requests(mut self, total_requests: usize) -> Self {
        self.total_requests = total_requests;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_warmup_count(mut self, warmup_count: usize) -> Self {
        self.warmup_count = warmup_count;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn build(self) -> Result<LoadTestConfig> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(invalid(format!(
                "url must start with http:// or https://, got {}",
                self.url
            )));
        }
        let url = Url::parse(&self.url)
            .map_err(|err| invalid(format!("invalid url {}: {}", self.url, err)))?;

        if self.model_name.trim().is_empty() {
            return Err(invalid("model_name must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than zero"));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens must be at least 1"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            )));
        }
        if self.total_requests == 0 {
            return Err(invalid("total_requests must be greater than zero"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be greater than zero"));
        }

        if self.stream {
            if self.timeout < MIN_STREAM_TIMEOUT {
                return Err(invalid(format!(
                    "streaming requires a timeout of at least {}s, got {}s",
                    MIN_STREAM_TIMEOUT.as_secs(),
                    self.timeout.as_secs_f64()
                )));
            }
            if self.max_tokens > MAX_STREAM_TOKENS {
                return Err(invalid(format!(
                    "streaming allows at most {} max_tokens, got {}",
                    MAX_STREAM_TOKENS, self.max_tokens
                )));
            }
        }

        Ok(LoadTestConfig {
            url,
            api_key: self.api_key,
            timeout: self.timeout,
            model_name: self.model_name,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            total_requests: self.total_requests,
            concurrency: self.concurrency.min(self.total_requests),
            warmup_count: self.warmup_count,
            stream: self.stream,
            prompt: self.prompt,
        })
    }
}

fn invalid(message: impl Into<String>) -> LoadTestError {
    LoadTestError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> LoadTestConfigBuilder {
        LoadTestConfig::builder("http://localhost:8000/v1/chat/completions", "test-model")
    }

    #[test]
    fn concurrency_is_clamped_to_total_requests() {
        let config = builder()
            .with_total_requests(10)
            .with_concurrency(50)
            .build()
            .unwrap();
        assert_eq!(config.concurrency(), 10);
        assert_eq!(config.total_requests(), 10);
    }

    #[test]
    fn concurrency_below_total_is_kept() {
        let config = builder()
            .with_total_requests(10)
            .with_concurrency(3)
            .build()
            .unwrap();
        assert_eq!(config.concurrency(), 3);
    }

    #[test]
    fn rejects_non_http_url() {
        let err = LoadTestConfig::builder("ftp://example.com", "m")
            .build()
            .unwrap_err();
        assert!(matches!(err, LoadTestError::Config(_)));
    }

    #[test]
    fn rejects_zero_counts_and_bad_ranges() {
        assert!(builder().with_total_requests(0).build().is_err());
        assert!(builder().with_concurrency(0).build().is_err());
        assert!(builder().with_max_tokens(0).build().is_err());
        assert!(builder().with_timeout(Duration::ZERO).build().is_err());
        assert!(builder().with_temperature(2.5).build().is_err());
        assert!(builder().with_temperature(-0.1).build().is_err());
        assert!(builder().with_temperature(f64::NAN).build().is_err());
        assert!(LoadTestConfig::builder("http://x", "  ").build().is_err());
    }

    #[test]
    fn streaming_enforces_timeout_and_token_cap() {
        let short = builder()
            .with_stream(true)
            .with_timeout(Duration::from_secs(10))
            .build();
        assert!(short.is_err());

        let too_many = builder()
            .with_stream(true)
            .with_max_tokens(MAX_STREAM_TOKENS + 1)
            .build();
        assert!(too_many.is_err());

        let ok = builder()
            .with_stream(true)
            .with_timeout(MIN_STREAM_TIMEOUT)
            .with_max_tokens(MAX_STREAM_TOKENS)
            .build();
        assert!(ok.is_ok());

        // the same limits do not apply without streaming
        assert!(builder()
            .with_timeout(Duration::from_secs(1))
            .with_max_tokens(4096)
            .build()
            .is_ok());
    }

    #[test]
    fn headers_use_placeholder_without_key() {
        let config = builder().build().unwrap();
        let headers = config.headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer dummy");
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        let config = builder()
            .with_api_key(Some("secret".into()))
            .build()
            .unwrap();
        assert_eq!(config.headers().unwrap()[AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn empty_api_key_counts_as_missing() {
        let config = builder().with_api_key(Some(String::new())).build().unwrap();
        assert_eq!(config.api_key(), None);
        assert!(!config.summary().api_key_set);
    }

    #[test]
    fn payload_includes_stream_flag_only_when_streaming() {
        let plain = builder().build().unwrap().request_payload();
        assert_eq!(plain["model"], "test-model");
        assert_eq!(plain["max_tokens"], 128);
        assert!(plain.get("stream").is_none());
        assert_eq!(plain["messages"][0]["role"], "user");

        let streaming = builder().with_stream(true).build().unwrap().request_payload();
        assert_eq!(streaming["stream"], true);
    }
}
