//! Load generator for OpenAI-compatible chat-completion endpoints.
//!
//! A run fires a warmup batch, then exactly `total_requests` requests with at
//! most `concurrency` in flight, and reduces the per-request outcomes into
//! latency, TTFT and throughput statistics.

mod config;
mod error;
mod executor;
mod report;
mod runner;

pub use config::{
    ConfigSummary, LoadTestConfig, LoadTestConfigBuilder, DEFAULT_PROMPT, MAX_STREAM_TOKENS,
    MIN_STREAM_TIMEOUT,
};
pub use error::{LoadTestError, Result};
pub use executor::{
    estimate_tokens, extract_usage, HttpExecutor, ReportedUsage, RequestExecutor, RequestResult,
    StreamAccumulator, StreamControl,
};
pub use report::{aggregate, log_results, percentile, LoadTestResults, ResultsSummary, TtftSummary};
pub use runner::{run_load_test, LoadGenerator, Phase, ProgressEvent};
