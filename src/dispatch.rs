//! Detached report delivery.
//!
//! Reports go onto a bounded queue drained by a fixed pool of workers. The
//! caller only pays for a `try_send`; when the queue is full the report is
//! dropped and counted. Each delivery is capped by a timeout, failures are
//! logged and never retried.

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::report::Report;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Destination for reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver one report.
    async fn send(&self, report: &Report) -> Result<(), DispatchError>;

    /// Get the sink name.
    fn name(&self) -> &'static str;
}

/// Posts reports as JSON to an HTTP endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// Create a sink for `url`; `timeout` bounds the whole exchange.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReportSink for HttpSink {
    async fn send(&self, report: &Report) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Logs reports locally; used when no sink endpoint is configured.
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn send(&self, report: &Report) -> Result<(), DispatchError> {
        info!(
            trigger = %report.trigger,
            ip = %report.ip,
            device = %report.device.model,
            anomalies = ?report.anomalies,
            "Report logged (no sink configured)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Bounded fire-and-forget dispatcher.
pub struct EventDispatcher {
    tx: mpsc::Sender<Report>,
    counters: Arc<DispatchCounters>,
    sink_name: &'static str,
}

impl EventDispatcher {
    /// Start `workers` delivery tasks reading from a queue of `capacity`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        sink: Arc<dyn ReportSink>,
        workers: usize,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(DispatchCounters::default());
        let sink_name = sink.name();

        for worker_id in 0..workers.max(1) {
            tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&sink),
                Arc::clone(&counters),
                timeout,
            ));
        }

        Self {
            tx,
            counters,
            sink_name,
        }
    }

    /// Build from configuration: an HTTP sink when `sink_url` is set, the log
    /// sink otherwise.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, DispatchError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let sink: Arc<dyn ReportSink> = match config.sink_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(HttpSink::new(url.trim(), timeout)?),
            _ => Arc::new(LogSink),
        };

        Ok(Self::new(sink, config.workers, config.queue_capacity, timeout))
    }

    /// Queue a report without waiting for delivery.
    pub fn dispatch(&self, report: Report) -> Result<(), DispatchError> {
        match self.tx.try_send(report) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(report)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    trigger = %report.trigger,
                    ip = %report.ip,
                    "Dispatch queue full, report dropped"
                );
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Name of the configured sink.
    pub fn sink_name(&self) -> &'static str {
        self.sink_name
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Report>>>,
    sink: Arc<dyn ReportSink>,
    counters: Arc<DispatchCounters>,
    timeout: Duration,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(report) = next else {
            debug!(worker_id, "Dispatch queue closed, worker exiting");
            break;
        };

        match tokio::time::timeout(timeout, sink.send(&report)).await {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker_id,
                    trigger = %report.trigger,
                    sink = sink.name(),
                    "Report delivered"
                );
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, error = %e, sink = sink.name(), "Report delivery failed");
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let e = DispatchError::Timeout(timeout.as_millis() as u64);
                warn!(worker_id, error = %e, sink = sink.name(), "Report delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct RecordingSink {
        reports: std::sync::Mutex<Vec<Report>>,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn send(&self, report: &Report) -> Result<(), DispatchError> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct SlowSink;

    #[async_trait]
    impl ReportSink for SlowSink {
        async fn send(&self, _report: &Report) -> Result<(), DispatchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ReportSink for FailingSink {
        async fn send(&self, _report: &Report) -> Result<(), DispatchError> {
            Err(DispatchError::Status(503))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    async fn wait_for(dispatcher: &EventDispatcher, check: impl Fn(DispatchStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check(dispatcher.stats()) {
            assert!(Instant::now() < deadline, "timed out: {:?}", dispatcher.stats());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_reports_are_delivered() {
        let sink = Arc::new(RecordingSink {
            reports: std::sync::Mutex::new(vec![]),
        });
        let dispatcher = EventDispatcher::new(sink.clone(), 2, 16, Duration::from_secs(1));

        for i in 0..5 {
            dispatcher
                .dispatch(Report::new(format!("t{}", i), "1.2.3.4", "ua"))
                .unwrap();
        }

        wait_for(&dispatcher, |s| s.delivered == 5).await;
        assert_eq!(sink.reports.lock().unwrap().len(), 5);
        assert_eq!(dispatcher.stats().queued, 5);
        assert_eq!(dispatcher.sink_name(), "recording");
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_block_caller() {
        let dispatcher = EventDispatcher::new(Arc::new(SlowSink), 1, 16, Duration::from_millis(50));

        let start = Instant::now();
        dispatcher.dispatch(Report::new("t", "1.2.3.4", "ua")).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));

        wait_for(&dispatcher, |s| s.failed == 1).await;
        assert_eq!(dispatcher.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_sink_errors_are_counted() {
        let dispatcher = EventDispatcher::new(Arc::new(FailingSink), 1, 16, Duration::from_secs(1));
        dispatcher.dispatch(Report::new("t", "1.2.3.4", "ua")).unwrap();
        wait_for(&dispatcher, |s| s.failed == 1).await;
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let dispatcher = EventDispatcher::new(Arc::new(SlowSink), 1, 1, Duration::from_secs(30));

        assert!(dispatcher.dispatch(Report::new("a", "1.2.3.4", "ua")).is_ok());
        let result = dispatcher.dispatch(Report::new("b", "1.2.3.4", "ua"));

        assert!(matches!(result, Err(DispatchError::QueueFull)));
        assert_eq!(dispatcher.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_unreachable_http_sink() {
        let config = DispatchConfig {
            sink_url: Some("http://127.0.0.1:9/hook".to_string()),
            workers: 1,
            queue_capacity: 4,
            timeout_ms: 500,
        };
        let dispatcher = EventDispatcher::from_config(&config).unwrap();
        assert_eq!(dispatcher.sink_name(), "http");

        let start = Instant::now();
        dispatcher.dispatch(Report::new("t", "1.2.3.4", "ua")).unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));

        wait_for(&dispatcher, |s| s.failed == 1).await;
    }

    #[tokio::test]
    async fn test_log_sink_without_url() {
        let dispatcher = EventDispatcher::from_config(&DispatchConfig::default()).unwrap();
        assert_eq!(dispatcher.sink_name(), "log");

        dispatcher.dispatch(Report::new("t", "1.2.3.4", "ua")).unwrap();
        wait_for(&dispatcher, |s| s.delivered == 1).await;
    }
}
