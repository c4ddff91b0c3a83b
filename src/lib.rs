//! pubsub-latency - round-trip latency measurement over a publish/subscribe fabric.
//!
//! A probe publishes correlated request messages on a topic; a responder somewhere
//! behind the broker stamps each hop it passes and answers. The probe matches the
//! answers against its in-flight table, derives end-to-end and per-hop latencies,
//! evicts probes that never come back and summarizes the results.
//!
//! # Usage
//!
//! Measure against a responder reachable through the broker:
//! ```bash
//! pubsub-latency --broker 192.168.1.10 --topic latency -n 100 -i 1000
//! ```
//!
//! Answer probes of other participants:
//! ```bash
//! pubsub-latency --role responder --broker 192.168.1.10 --topic latency
//! ```
//!
//! Self-contained run through the in-process broker:
//! ```bash
//! pubsub-latency --transport loopback -n 20 -i 100 --timeout-ms 2000
//! ```

/// Command-line configuration and validation.
pub mod configuration;
/// Run state machine and event loop.
pub mod controller;
/// In-flight probe table.
pub mod correlation;
/// Probe emission within a message budget.
pub mod emitter;
/// Engine instance tying the measurement pieces together.
pub mod engine;
/// Wire messages exchanged on the topic.
pub mod messages;
/// Quality-of-service levels.
pub mod qos;
/// Eviction of probes that never got a response.
pub mod reaper;
/// Response matching and request answering.
pub mod reconciler;
/// Latency samples and the per-run sample log.
pub mod sample;
/// Probe identifier generation.
pub mod session;
/// Result persistence.
pub mod sink;
/// Stage labels, hop schema and per-hop deltas.
pub mod stages;
/// Summary statistics and report output.
pub mod stats;
/// Clock abstraction and timestamp helpers.
pub mod time;
/// Publish/subscribe transports.
pub mod transport;

/// Prometheus metrics support (requires "metrics" feature).
#[cfg(feature = "metrics")]
pub mod metrics;
