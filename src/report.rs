use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::LoadTestConfig;
use crate::executor::RequestResult;

/// Aggregated outcome of the measured phase of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadTestResults {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Sum of `total_tokens` over successful requests.
    pub total_tokens: u64,
    /// Wall time of the measured phase, warmup excluded.
    pub elapsed_time: Duration,
    pub latencies: Vec<f64>,
    pub ttft_latencies: Vec<f64>,
    pub generation_speeds: Vec<f64>,
    /// Error messages of failed requests.
    pub failures: Vec<String>,
}

impl LoadTestResults {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.successful_requests as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }

    pub fn tokens_per_second(&self) -> f64 {
        per_second(self.total_tokens, self.elapsed_time)
    }

    pub fn requests_per_second(&self) -> f64 {
        per_second(self.successful_requests, self.elapsed_time)
    }

    pub fn latency_percentile(&self, p: f64) -> f64 {
        percentile(&self.latencies, p)
    }

    pub fn ttft_percentile(&self, p: f64) -> f64 {
        percentile(&self.ttft_latencies, p)
    }

    pub fn avg_ttft_ms(&self) -> f64 {
        mean(&self.ttft_latencies)
    }

    pub fn avg_generation_speed(&self) -> f64 {
        mean(&self.generation_speeds)
    }

    pub fn summary(&self, config: &LoadTestConfig) -> ResultsSummary {
        let streaming_enabled = !self.ttft_latencies.is_empty();
        let ttft = streaming_enabled.then(|| TtftSummary {
            ttft_avg_ms: round_to(self.avg_ttft_ms(), 2),
            ttft_p50: round_to(self.ttft_percentile(50.0), 1),
            ttft_p95: round_to(self.ttft_percentile(95.0), 1),
            ttft_p99: round_to(self.ttft_percentile(99.0), 1),
        });

        ResultsSummary {
            tokens_per_second: round_to(self.tokens_per_second(), 2),
            requests_per_second: round_to(self.requests_per_second(), 2),
            latency_p50: round_to(self.latency_percentile(50.0), 1),
            latency_p95: round_to(self.latency_percentile(95.0), 1),
            latency_p99: round_to(self.latency_percentile(99.0), 1),
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate: round_to(self.success_rate(), 4),
            concurrency: config.concurrency(),
            total_tokens: self.total_tokens,
            elapsed_time: round_to(self.elapsed_time.as_secs_f64(), 2),
            streaming_enabled,
            ttft,
            avg_generation_speed_tps: (!self.generation_speeds.is_empty())
                .then(|| round_to(self.avg_generation_speed(), 2)),
        }
    }
}

/// Report-ready view of [`LoadTestResults`], rounded for display.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultsSummary {
    pub tokens_per_second: f64,
    pub requests_per_second: f64,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub concurrency: usize,
    pub total_tokens: u64,
    pub elapsed_time: f64,
    pub streaming_enabled: bool,
    #[serde(flatten)]
    pub ttft: Option<TtftSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_generation_speed_tps: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TtftSummary {
    pub ttft_avg_ms: f64,
    pub ttft_p50: f64,
    pub ttft_p95: f64,
    pub ttft_p99: f64,
}

/// Reduces per-request results into run totals. Token counts and latency
/// samples come from successful requests only.
pub fn aggregate(results: &[RequestResult], elapsed_time: Duration) -> LoadTestResults {
    let (successful, failed): (Vec<&RequestResult>, Vec<&RequestResult>) =
        results.iter().partition(|result| result.success);

    LoadTestResults {
        total_requests: results.len() as u64,
        successful_requests: successful.len() as u64,
        failed_requests: failed.len() as u64,
        total_tokens: successful.iter().map(|result| result.total_tokens).sum(),
        elapsed_time,
        latencies: successful.iter().map(|result| result.latency_ms).collect(),
        ttft_latencies: successful.iter().filter_map(|result| result.ttft_ms).collect(),
        generation_speeds: successful
            .iter()
            .filter_map(|result| result.tokens_per_second)
            .collect(),
        failures: failed
            .iter()
            .filter_map(|result| result.error.clone())
            .collect(),
    }
}

/// Nearest-rank percentile over an unsorted sample.
///
/// With `rank = p / 100 * n`: an integral, positive rank averages the values at
/// `rank - 1` and `rank` (only `rank - 1` when it is the last element); any
/// other rank selects `floor(rank)`, clamped to the last element. Returns 0 for
/// an empty sample.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let rank = p / 100.0 * n as f64;

    if rank > 0.0 && rank.fract() == 0.0 {
        let index = (rank as usize - 1).min(n - 1);
        if index + 1 < n {
            (sorted[index] + sorted[index + 1]) / 2.0
        } else {
            sorted[index]
        }
    } else {
        let index = (rank.max(0.0) as usize).min(n - 1);
        sorted[index]
    }
}

/// Emits the configuration and results of a run as structured log events.
pub fn log_results(results: &LoadTestResults, config: &LoadTestConfig) {
    let config_summary = config.summary();
    info!(
        phase = "results",
        url = %config_summary.url,
        model = %config_summary.model,
        max_tokens = config_summary.max_tokens,
        temperature = config_summary.temperature,
        total_requests = config_summary.total_requests,
        concurrency = config_summary.concurrency,
        warmup_count = config_summary.warmup_count,
        stream = config_summary.stream,
        timeout_secs = config_summary.timeout_secs,
        api_key_set = config_summary.api_key_set,
        "Load test configuration"
    );

    let summary = results.summary(config);
    info!(
        phase = "results",
        tokens_per_second = summary.tokens_per_second,
        requests_per_second = summary.requests_per_second,
        latency_p50 = summary.latency_p50,
        latency_p95 = summary.latency_p95,
        latency_p99 = summary.latency_p99,
        total_requests = summary.total_requests,
        successful_requests = summary.successful_requests,
        failed_requests = summary.failed_requests,
        success_rate = summary.success_rate,
        concurrency = summary.concurrency,
        total_tokens = summary.total_tokens,
        elapsed_time = summary.elapsed_time,
        streaming_enabled = summary.streaming_enabled,
        ttft_avg_ms = summary.ttft.as_ref().map(|t| t.ttft_avg_ms),
        ttft_p50 = summary.ttft.as_ref().map(|t| t.ttft_p50),
        ttft_p95 = summary.ttft.as_ref().map(|t| t.ttft_p95),
        ttft_p99 = summary.ttft.as_ref().map(|t| t.ttft_p99),
        avg_generation_speed_tps = summary.avg_generation_speed_tps,
        "Load test completed"
    );
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
