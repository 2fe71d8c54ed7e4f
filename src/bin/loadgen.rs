use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use llm_loadgen::{
    log_results, LoadGenerator, LoadTestConfig, LoadTestResults, Phase, ProgressEvent,
    DEFAULT_PROMPT,
};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "loadgen",
    about = "Load test an OpenAI-compatible chat completions endpoint"
)]
struct Args {
    /// Full endpoint URL; when omitted it is built from --host and --port
    #[arg(long, env = "VLLM_URL")]
    url: Option<String>,

    /// Inference server host
    #[arg(long, env = "VLLM_HOST", default_value = "localhost")]
    host: String,

    /// Inference server port
    #[arg(long, env = "VLLM_PORT", default_value_t = 8000)]
    port: u16,

    /// Bearer token for the endpoint
    #[arg(long, env = "VLLM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model identifier to embed in each request body
    #[arg(long, env = "MODEL_NAME", default_value = "mistralai/Mistral-7B-Instruct-v0.3")]
    model: String,

    /// Max tokens to generate per request
    #[arg(long, env = "MAX_MODEL_LEN", default_value_t = 128)]
    max_tokens: u32,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,

    /// Total measured requests
    #[arg(long, env = "LOAD_REQUESTS", default_value_t = 50)]
    requests: usize,

    /// Maximum requests in flight (capped at --requests)
    #[arg(long, env = "LOAD_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Uncounted requests fired before measuring
    #[arg(long, default_value_t = 5)]
    warmup: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 120.0)]
    timeout_secs: f64,

    /// Stream responses and measure time to first token
    #[arg(long)]
    stream: bool,

    /// User message sent with every request
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Write the JSON summary to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Disable the live status display
    #[arg(long)]
    no_status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let timeout = Duration::try_from_secs_f64(args.timeout_secs)
        .map_err(|_| anyhow!("timeout-secs must be a positive number of seconds"))?;
    let url = args
        .url
        .clone()
        .unwrap_or_else(|| resolve_endpoint(&args.host, args.port));

    let config = LoadTestConfig::builder(url, args.model.clone())
        .with_api_key(args.api_key.clone())
        .with_timeout(timeout)
        .with_max_tokens(args.max_tokens)
        .with_temperature(args.temperature)
        .with_total_requests(args.requests)
        .with_concurrency(args.concurrency)
        .with_warmup_count(args.warmup)
        .with_stream(args.stream)
        .with_prompt(args.prompt.clone())
        .build()?;

    let cancel = CancellationToken::new();
    tokio::spawn(watch_interrupts(cancel.clone()));

    let mut generator = LoadGenerator::new(config.clone())?;
    let tracker = if args.no_status {
        None
    } else {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        generator = generator.with_progress(status_tx);
        Some(tokio::spawn(track_status(status_rx, config.total_requests())))
    };

    let outcome = generator.run_until(cancel).await;
    if let Some(tracker) = tracker {
        tracker
            .await
            .map_err(|err| anyhow!("status tracker task failed: {}", err))?;
    }
    let results = outcome.context("load test did not complete")?;

    log_results(&results, &config);
    print_summary(&results, &config);

    if let Some(path) = &args.output {
        let summary = serde_json::to_string_pretty(&results.summary(&config))?;
        fs::write(path, summary)
            .await
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        println!("Results saved to: {}", path.display());
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Drain,
    ForceQuit,
}

/// First interrupt drains in-flight requests, a second one quits immediately.
fn on_interrupt(cancel: &CancellationToken) -> Interrupt {
    if cancel.is_cancelled() {
        Interrupt::ForceQuit
    } else {
        cancel.cancel();
        Interrupt::Drain
    }
}

async fn watch_interrupts(cancel: CancellationToken) {
    while tokio::signal::ctrl_c().await.is_ok() {
        match on_interrupt(&cancel) {
            Interrupt::Drain => {
                warn!("Interrupt received, letting in-flight requests finish (press Ctrl-C again to quit)");
            }
            Interrupt::ForceQuit => {
                warn!("Second interrupt received, exiting");
                std::process::exit(130);
            }
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_endpoint(host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}/v1/chat/completions", host, port)
    } else {
        format!("http://{}:{}/v1/chat/completions", host, port)
    }
}

struct StatusSnapshot {
    phase: Option<Phase>,
    completion_tokens: u64,
    successes: u64,
    failures: u64,
    planned: usize,
}

async fn track_status(mut updates: mpsc::UnboundedReceiver<ProgressEvent>, planned: usize) {
    let mut snapshot = StatusSnapshot {
        phase: None,
        completion_tokens: 0,
        successes: 0,
        failures: 0,
        planned,
    };
    let mut start = Instant::now();
    let mut rendered = false;

    while let Some(event) = updates.recv().await {
        match event {
            ProgressEvent::Phase(phase) => {
                snapshot.phase = Some(phase);
                if phase == Phase::LoadTest {
                    start = Instant::now();
                }
            }
            ProgressEvent::Request {
                success,
                completion_tokens,
            } => {
                if success {
                    snapshot.successes += 1;
                    snapshot.completion_tokens =
                        snapshot.completion_tokens.saturating_add(completion_tokens);
                } else {
                    snapshot.failures += 1;
                }
            }
        }

        render_status(&snapshot, start, true);
        rendered = true;
    }

    if rendered {
        render_status(&snapshot, start, false);
    }
}

fn render_status(snapshot: &StatusSnapshot, start: Instant, stay: bool) {
    let elapsed = start.elapsed().as_secs_f64();
    let throughput = if elapsed > 0.0 {
        snapshot.completion_tokens as f64 / elapsed
    } else {
        0.0
    };
    let completed = snapshot.successes + snapshot.failures;
    let phase = match snapshot.phase {
        Some(Phase::Warmup) => "warmup",
        Some(Phase::LoadTest) | None => "load test",
    };

    let phase_line = format!("Phase: {}", phase);
    let throughput_line = format!("Throughput: {:.2} tok/s", throughput);
    let requests_line = format!("Requests: {} / {}", completed, snapshot.planned);
    let failures_line = format!("Failures: {}", snapshot.failures);

    print!(
        "\r\x1b[2K{}\n\x1b[2K{}\n\x1b[2K{}\n\x1b[2K{}\n",
        phase_line, throughput_line, requests_line, failures_line
    );

    if stay {
        print!("\x1b[4A\r");
    }

    let _ = io::stdout().flush();
}

fn print_summary(results: &LoadTestResults, config: &LoadTestConfig) {
    let summary = results.summary(config);
    println!(
        "Total requests: {} (success {}, failure {}, rate {:.2}%)",
        summary.total_requests,
        summary.successful_requests,
        summary.failed_requests,
        summary.success_rate * 100.0
    );
    println!(
        "Throughput: {:.2} tok/s, {:.2} req/s over {:.2}s (concurrency {})",
        summary.tokens_per_second,
        summary.requests_per_second,
        summary.elapsed_time,
        summary.concurrency
    );
    println!(
        "Latency (ms): p50={:.1} p95={:.1} p99={:.1}",
        summary.latency_p50, summary.latency_p95, summary.latency_p99
    );

    if let Some(ttft) = &summary.ttft {
        println!(
            "TTFT (ms): avg={:.2} p50={:.1} p95={:.1} p99={:.1}",
            ttft.ttft_avg_ms, ttft.ttft_p50, ttft.ttft_p95, ttft.ttft_p99
        );
    }
    if let Some(speed) = summary.avg_generation_speed_tps {
        println!("Generation speed: {:.2} tok/s per request", speed);
    }

    if !results.failures.is_empty() {
        println!("Failures: {}", results.failures.len());
        for failure in &results.failures {
            println!("  {}", failure);
        }
    }
}
