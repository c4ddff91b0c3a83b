//! Metrics for the probe lifecycle.
//!
//! Counters track emitted, completed and lost probes; RTT observations feed a
//! histogram in seconds.

use metrics::{counter, gauge, histogram};

/// Records that a probe was emitted.
pub fn record_probe_sent() {
    counter!("pubsub_latency_probes_sent_total").increment(1);
}

/// Records that a probe's response was matched.
pub fn record_probe_completed() {
    counter!("pubsub_latency_probes_completed_total").increment(1);
}

/// Records that a probe was evicted by the reaper.
pub fn record_probe_lost() {
    counter!("pubsub_latency_probes_lost_total").increment(1);
}

/// Records a round-trip time observation in seconds.
pub fn record_rtt(rtt_seconds: f64) {
    histogram!("pubsub_latency_rtt_seconds").record(rtt_seconds);
}

/// Records a payload that could not be decoded.
pub fn record_malformed_message() {
    counter!("pubsub_latency_malformed_messages_total").increment(1);
}

/// Records a failed publish of a probe or an answer.
pub fn record_publish_failure() {
    counter!("pubsub_latency_publish_failures_total").increment(1);
}

/// Updates the number of probes awaiting a response.
pub fn set_in_flight(count: usize) {
    gauge!("pubsub_latency_probes_in_flight").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_functions_callable() {
        // Without an installed recorder these are no-ops.
        record_probe_sent();
        record_probe_completed();
        record_probe_lost();
        record_rtt(0.012);
        record_malformed_message();
        record_publish_failure();
        set_in_flight(3);
    }
}
