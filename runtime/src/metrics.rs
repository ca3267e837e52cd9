//! Prometheus metrics for the publisher and consumer.
//!
//! Publishing and consumption are counted per topic and event type so a
//! dashboard can show throughput, retry pressure, and dead-letter volume.
//! [`MetricsServer`] serves them for scraping at `/metrics`:
//! - `events_published_total{topic,event_type}`
//! - `events_publish_errors_total{topic}`
//! - `events_consumed_total{event_type}`
//! - `events_malformed_total`, `events_unhandled_total{event_type}`
//! - `events_handler_retries_total{event_type}`
//! - `events_dead_lettered_total{event_type}`, `events_dead_letter_errors_total`
//! - `events_handler_duration_seconds{event_type}`
//!
//! # Example
//!
//! ```rust,no_run
//! use commerce_events_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serves GET http://0.0.0.0:9090/metrics
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the HTTP scrape endpoint serving it.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
    listener: Option<JoinHandle<()>>,
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is served on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handle: None,
            listener: None,
        }
    }

    /// Register metric descriptions, install the Prometheus recorder, and
    /// serve `GET /metrics` on `addr`.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a
    /// spawned task until the server is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if there is no runtime, or the exporter cannot be built
    /// (including when `addr` cannot be bound).
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs
    /// a warning and succeeds without a render handle or listener.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = {
            let _guard = runtime.enter();
            builder.build().map_err(|e| MetricsError::Build(e.to_string()))?
        };
        let handle = recorder.handle();

        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        self.listener = Some(runtime.spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(addr = %addr, error = ?e, "Metrics listener stopped");
            }
        }));
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics endpoint listening");
        Ok(())
    }

    /// Address the scrape endpoint is served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder. This is
    /// the same text the HTTP endpoint serves.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "events_published_total",
        "Total number of events published"
    );
    describe_counter!(
        "events_publish_errors_total",
        "Total number of failed publish attempts"
    );
    describe_counter!(
        "events_consumed_total",
        "Total number of events handled successfully"
    );
    describe_counter!(
        "events_malformed_total",
        "Total number of inbound messages dropped as unparseable"
    );
    describe_counter!(
        "events_unhandled_total",
        "Total number of inbound events with no registered handler"
    );
    describe_counter!(
        "events_handler_retries_total",
        "Total number of handler retries"
    );
    describe_counter!(
        "events_dead_lettered_total",
        "Total number of events sent to the dead-letter queue"
    );
    describe_counter!(
        "events_dead_letter_errors_total",
        "Total number of dead-letter sends that failed"
    );
    describe_histogram!(
        "events_handler_duration_seconds",
        "Time taken by one handler invocation"
    );
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record published events.
    pub fn record_published(topic: &str, event_type: &str, count: u64) {
        counter!(
            "events_published_total",
            "topic" => topic.to_string(),
            "event_type" => event_type.to_string()
        )
        .increment(count);
    }

    /// Record a failed publish.
    pub fn record_publish_error(topic: &str) {
        counter!("events_publish_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record an event sent to the dead-letter queue.
    pub fn record_dead_lettered(event_type: &str) {
        counter!("events_dead_lettered_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a dead-letter send that failed.
    pub fn record_dead_letter_error() {
        counter!("events_dead_letter_errors_total").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a successful handler invocation.
    pub fn record_handled(event_type: &str, duration: Duration) {
        counter!("events_consumed_total", "event_type" => event_type.to_string()).increment(1);
        Self::record_duration(event_type, duration);
    }

    /// Record how long one handler invocation took.
    pub fn record_duration(event_type: &str, duration: Duration) {
        histogram!(
            "events_handler_duration_seconds",
            "event_type" => event_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a dropped, unparseable message.
    pub fn record_malformed() {
        counter!("events_malformed_total").increment(1);
    }

    /// Record an event with no handler.
    pub fn record_unhandled(event_type: &str) {
        counter!("events_unhandled_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a scheduled handler retry.
    pub fn record_retry(event_type: &str) {
        counter!("events_handler_retries_total", "event_type" => event_type.to_string())
            .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test assertions
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_metrics_server_render_and_scrape() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Reserve a free port, then hand it to the server
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        PublisherMetrics::record_published("order-events", "OrderCreated", 1);
        ConsumerMetrics::record_handled("OrderCreated", Duration::from_millis(5));
        ConsumerMetrics::record_retry("OrderCreated");

        // Another test may have installed the recorder first
        let Some(rendered) = server.render() else {
            return;
        };
        assert!(rendered.contains("events_published_total"));
        assert!(rendered.contains("events_consumed_total"));
        assert!(rendered.contains("events_handler_retries_total"));

        let mut response = String::new();
        let scraped = tokio::time::timeout(Duration::from_secs(5), async {
            let mut stream = loop {
                match tokio::net::TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            };
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            stream.read_to_string(&mut response).await.unwrap();
        })
        .await;
        assert!(scraped.is_ok(), "metrics endpoint did not answer");
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("events_published_total"));
    }
}
