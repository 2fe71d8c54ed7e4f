use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LoadTestConfig;
use crate::error::{LoadTestError, Result};
use crate::executor::{HttpExecutor, RequestExecutor, RequestResult};
use crate::report::{aggregate, LoadTestResults};

/// Runs a full load test against the configured endpoint over HTTP.
pub async fn run_load_test(config: LoadTestConfig) -> Result<LoadTestResults> {
    LoadGenerator::new(config)?.run().await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    LoadTest,
}

/// Live updates for status displays. Only measured requests are reported.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Phase(Phase),
    Request { success: bool, completion_tokens: u64 },
}

pub struct LoadGenerator<E: RequestExecutor> {
    config: LoadTestConfig,
    executor: Arc<E>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl LoadGenerator<HttpExecutor> {
    pub fn new(config: LoadTestConfig) -> Result<Self> {
        let executor = HttpExecutor::new(&config)?;
        Ok(Self::with_executor(config, executor))
    }
}

impl<E: RequestExecutor> LoadGenerator<E> {
    pub fn with_executor(config: LoadTestConfig, executor: E) -> Self {
        Self {
            config,
            executor: Arc::new(executor),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn run(self) -> Result<LoadTestResults> {
        self.run_until(CancellationToken::new()).await
    }

    /// Runs warmup and the measured phase. Once `cancel` fires no further
    /// requests are started; those already in flight finish before the run
    /// returns [`LoadTestError::Cancelled`].
    pub async fn run_until(self, cancel: CancellationToken) -> Result<LoadTestResults> {
        let outcome = self.run_phases(&cancel).await;
        if matches!(outcome, Err(LoadTestError::Cancelled)) {
            warn!(phase = "cleanup", "Load test was cancelled");
        }

        // every task holding a clone has been joined, so this releases the
        // connection pool
        drop(self.executor);
        debug!(phase = "cleanup", "HTTP client closed");

        outcome
    }

    async fn run_phases(&self, cancel: &CancellationToken) -> Result<LoadTestResults> {
        self.warmup().await;
        if cancel.is_cancelled() {
            return Err(LoadTestError::Cancelled);
        }

        info!(
            total_requests = self.config.total_requests(),
            concurrency = self.config.concurrency(),
            model = self.config.model_name(),
            stream = self.config.stream(),
            phase = "load_test",
            "Starting load test"
        );
        self.notify(ProgressEvent::Phase(Phase::LoadTest));

        let start = Instant::now();
        let (results, cancelled) = self.measured_phase(cancel).await;
        let elapsed = start.elapsed();

        if cancelled {
            return Err(LoadTestError::Cancelled);
        }
        Ok(aggregate(&results, elapsed))
    }

    async fn warmup(&self) {
        let warmup_count = self.config.warmup_count();
        if warmup_count == 0 {
            return;
        }

        info!(warmup_requests = warmup_count, phase = "warmup", "Starting warmup");
        self.notify(ProgressEvent::Phase(Phase::Warmup));

        let mut tasks = JoinSet::new();
        for _ in 0..warmup_count {
            let executor = Arc::clone(&self.executor);
            tasks.spawn(async move { executor.execute().await });
        }
        // outcomes, panics included, are irrelevant here
        while tasks.join_next().await.is_some() {}

        info!(phase = "warmup", "Warmup completed");
    }

    /// Dispatches `total_requests` requests through a semaphore sized to the
    /// configured concurrency. Returns the collected results and whether
    /// dispatch stopped early because of cancellation.
    async fn measured_phase(&self, cancel: &CancellationToken) -> (Vec<RequestResult>, bool) {
        let total_requests = self.config.total_requests();
        let gate = Arc::new(Semaphore::new(self.config.concurrency()));
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(total_requests);
        let mut dispatched = 0usize;
        let mut failed = 0u64;
        let mut cancelled = false;

        loop {
            let dispatching = !cancelled && dispatched < total_requests;
            if !dispatching && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if dispatching => {
                    cancelled = true;
                    info!(
                        dispatched,
                        in_flight = tasks.len(),
                        phase = "load_test",
                        "Cancellation requested, waiting for in-flight requests"
                    );
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let result = settle(joined);
                    if !result.success {
                        failed += 1;
                    }
                    self.notify(ProgressEvent::Request {
                        success: result.success,
                        completion_tokens: result.completion_tokens,
                    });
                    results.push(result);
                }
                permit = Arc::clone(&gate).acquire_owned(), if dispatching => {
                    let Ok(permit) = permit else {
                        // the gate is never closed, treat it as a stop signal
                        cancelled = true;
                        continue;
                    };
                    let executor = Arc::clone(&self.executor);
                    tasks.spawn(async move {
                        // released on every exit path, unwinding included
                        let _permit = permit;
                        executor.execute().await
                    });
                    dispatched += 1;
                }
            }
        }

        info!(
            completed_requests = results.len(),
            failed_requests = failed,
            phase = "load_test",
            "Load test batch completed"
        );

        (results, cancelled)
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

/// Converts a task that died without producing a result into a failed one.
fn settle(joined: std::result::Result<RequestResult, JoinError>) -> RequestResult {
    match joined {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, phase = "load_test", "Unexpected exception in task");
            RequestResult::failure(0.0, format!("task exception: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ok_result(completion_tokens: u64) -> RequestResult {
        RequestResult {
            latency_ms: 1.0,
            ttft_ms: None,
            prompt_tokens: 1,
            completion_tokens,
            total_tokens: completion_tokens + 1,
            success: true,
            error: None,
            tokens_per_second: Some(1.0),
        }
    }

    fn config(total_requests: usize, concurrency: usize, warmup_count: usize) -> LoadTestConfig {
        LoadTestConfig::builder("http://localhost:8000/v1/chat/completions", "test-model")
            .with_total_requests(total_requests)
            .with_concurrency(concurrency)
            .with_warmup_count(warmup_count)
            .build()
            .unwrap()
    }

    /// Counts calls and tracks the highest number of concurrent executions.
    #[derive(Default)]
    struct GaugedExecutor {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl GaugedExecutor {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RequestExecutor for GaugedExecutor {
        async fn execute(&self) -> RequestResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ok_result(4)
        }
    }

    /// Panics on every other call.
    #[derive(Default)]
    struct FlakyExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestExecutor for FlakyExecutor {
        async fn execute(&self) -> RequestResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 1 {
                panic!("executor blew up");
            }
            ok_result(2)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_requests_never_exceed_concurrency() {
        let executor = Arc::new(GaugedExecutor::with_delay(Duration::from_millis(5)));
        let generator = LoadGenerator::with_executor(config(20, 3, 0), Arc::clone(&executor));

        let results = generator.run().await.unwrap();

        assert_eq!(results.total_requests, 20);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 20);
        let max = executor.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "observed {} concurrent requests", max);
        assert!(max >= 1);
    }

    #[tokio::test]
    async fn issues_exactly_total_requests_for_any_concurrency() {
        for concurrency in [1, 2, 5, 10] {
            let executor = Arc::new(GaugedExecutor::default());
            let generator =
                LoadGenerator::with_executor(config(10, concurrency, 0), Arc::clone(&executor));
            let results = generator.run().await.unwrap();

            assert_eq!(executor.calls.load(Ordering::SeqCst), 10);
            assert_eq!(results.total_requests, 10);
            assert_eq!(
                results.successful_requests + results.failed_requests,
                results.total_requests
            );
            assert_eq!(results.total_tokens, 50);
        }
    }

    #[tokio::test]
    async fn warmup_requests_are_not_counted() {
        let executor = Arc::new(GaugedExecutor::default());
        let generator = LoadGenerator::with_executor(config(4, 2, 3), Arc::clone(&executor));

        let results = generator.run().await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 7);
        assert_eq!(results.total_requests, 4);
        assert_eq!(results.latencies.len(), 4);
    }

    #[tokio::test]
    async fn panicking_tasks_become_failed_results() {
        let generator = LoadGenerator::with_executor(config(6, 2, 0), FlakyExecutor::default());

        let results = generator.run().await.unwrap();

        assert_eq!(results.total_requests, 6);
        assert_eq!(results.successful_requests, 3);
        assert_eq!(results.failed_requests, 3);
        assert_eq!(results.total_tokens, 9);
        assert_eq!(results.failures.len(), 3);
        assert!(results
            .failures
            .iter()
            .all(|error| error.starts_with("task exception")));
    }

    #[tokio::test]
    async fn warmup_panics_are_discarded() {
        let generator = LoadGenerator::with_executor(config(2, 1, 2), FlakyExecutor::default());
        let results = generator.run().await.unwrap();
        assert_eq!(results.total_requests, 2);
    }

    #[tokio::test]
    async fn progress_reports_each_measured_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generator =
            LoadGenerator::with_executor(config(5, 2, 2), GaugedExecutor::default())
                .with_progress(tx);

        generator.run().await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first(), Some(&ProgressEvent::Phase(Phase::Warmup)));
        assert!(events.contains(&ProgressEvent::Phase(Phase::LoadTest)));
        let requests = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    ProgressEvent::Request {
                        success: true,
                        completion_tokens: 4
                    }
                )
            })
            .count();
        assert_eq!(requests, 5);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_reports_cancelled() {
        let executor = Arc::new(GaugedExecutor::with_delay(Duration::from_millis(20)));
        let generator = LoadGenerator::with_executor(config(1000, 2, 0), Arc::clone(&executor));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = generator.run_until(cancel).await;

        assert!(matches!(outcome, Err(LoadTestError::Cancelled)));
        let calls = executor.calls.load(Ordering::SeqCst);
        assert!(calls < 1000, "dispatched {} requests after cancel", calls);
        // dispatched requests were allowed to finish
        assert_eq!(executor.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_no_measured_requests() {
        let executor = Arc::new(GaugedExecutor::default());
        let generator = LoadGenerator::with_executor(config(10, 2, 1), Arc::clone(&executor));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = generator.run_until(cancel).await;

        assert!(matches!(outcome, Err(LoadTestError::Cancelled)));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
