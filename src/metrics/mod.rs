//! Prometheus metrics for latency runs.
//!
//! Exposes probe counters and the RTT histogram on an HTTP endpoint. Enable with the
//! `metrics` feature flag.
//!
//! # Usage
//!
//! Start the metrics server:
//! ```bash
//! pubsub-latency --metrics --metrics-addr 127.0.0.1:9090
//! ```
//!
//! Fetch metrics:
//! ```bash
//! curl http://127.0.0.1:9090/metrics
//! ```

pub mod probe_metrics;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Error type for metrics initialization failures.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build the Prometheus recorder.
    #[error("Failed to build metrics recorder: {0}")]
    RecorderBuild(String),
    /// Failed to bind the HTTP server.
    #[error("Failed to bind metrics server: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handle to the running metrics server.
pub struct MetricsServer {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl MetricsServer {
    /// Address the server is bound to. Differs from the requested one when the
    /// requested port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the metrics server to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
pub async fn init(addr: SocketAddr) -> Result<MetricsServer, MetricsError> {
    // Broker round trips range from a millisecond to tens of seconds
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_seconds".to_string()),
            &[
                0.001, 0.002_5, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                30.0,
            ],
        )
        .map_err(|e| MetricsError::RecorderBuild(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::RecorderBuild(e.to_string()))?;

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let app = Router::new().route("/metrics", get(move || metrics_handler(handle.clone())));

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Metrics server listening on http://{}/metrics", local_addr);

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
            .ok();
    });

    Ok(MetricsServer { cancel, local_addr })
}

/// HTTP handler that renders Prometheus metrics.
async fn metrics_handler(handle: PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    async fn scrape(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    // The only test in this crate that installs the global recorder.
    #[tokio::test]
    async fn test_metrics_server_serves_counters() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let server = init(addr).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);

        probe_metrics::record_probe_sent();
        probe_metrics::record_rtt(0.012);

        let response = scrape(server.local_addr()).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("pubsub_latency_probes_sent_total"));
        assert!(response.contains("pubsub_latency_rtt_seconds_bucket"));

        server.shutdown();
    }
}
