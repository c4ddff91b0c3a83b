//! Latency samples and the append-only log a run accumulates them in.

use serde::Serialize;

use crate::stages::{HopDelta, StageSchema, StageTimestamps, RTT_TOTAL, STAGE_RECEIVED, STAGE_SENT};

/// Immutable record of one completed probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    pub id: String,
    pub stages: StageTimestamps,
    /// `T4 - T1` in milliseconds.
    pub total_rtt: i64,
    pub hops: Vec<HopDelta>,
    /// Responder that answered, when it identified itself.
    pub source_tag: Option<String>,
    /// Warm-up samples stay in the log but are excluded from statistics and export.
    pub warmup: bool,
}

impl LatencySample {
    /// Builds a sample from merged stage timestamps.
    ///
    /// Returns `None` if the send or receive stage is missing, or if the round trip
    /// does not fit in an `i64`.
    pub fn from_stages(
        id: &str,
        stages: StageTimestamps,
        schema: &StageSchema,
        source_tag: Option<String>,
    ) -> Option<LatencySample> {
        let sent = stages.get(STAGE_SENT)?;
        let received = stages.get(STAGE_RECEIVED)?;
        let total_rtt = received.checked_sub(sent)?;
        let hops = schema.per_hop_deltas(&stages);
        Some(LatencySample {
            id: id.to_string(),
            stages,
            total_rtt,
            hops,
            source_tag,
            warmup: false,
        })
    }

    /// Value of a metric for this sample, if the sample defines it.
    pub fn metric(&self, name: &str) -> Option<i64> {
        if name == RTT_TOTAL {
            return Some(self.total_rtt);
        }
        self.hops.iter().find(|h| h.metric == name).map(|h| h.millis)
    }
}

/// Append-only sequence of samples for one run.
///
/// The first `warmup_count` samples pushed are tagged as warm-up.
#[derive(Debug, Default)]
pub struct SampleLog {
    samples: Vec<LatencySample>,
    warmup_count: usize,
}

impl SampleLog {
    pub fn new(warmup_count: usize) -> Self {
        SampleLog {
            samples: Vec::new(),
            warmup_count,
        }
    }

    /// Appends a sample, tagging it as warm-up if it falls in the warm-up window.
    pub fn push(&mut self, mut sample: LatencySample) -> &LatencySample {
        sample.warmup = self.samples.len() < self.warmup_count;
        self.samples.push(sample);
        &self.samples[self.samples.len() - 1]
    }

    /// Every sample, warm-up included, in completion order.
    pub fn all(&self) -> &[LatencySample] {
        &self.samples
    }

    /// Samples after the warm-up window.
    pub fn measured(&self) -> &[LatencySample] {
        let start = self.warmup_count.min(self.samples.len());
        &self.samples[start..]
    }

    pub fn warmup_count(&self) -> usize {
        self.warmup_count
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<LatencySample> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, rtt: i64) -> LatencySample {
        LatencySample::from_stages(
            id,
            StageTimestamps::from([("T1", 0), ("T4", rtt)]),
            &StageSchema::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_from_stages() {
        let stages = StageTimestamps::from([("T1", 1000), ("T2", 1010), ("T3", 1020), ("T4", 1030)]);
        let s = LatencySample::from_stages("p1", stages, &StageSchema::default(), Some("edge".into()))
            .unwrap();
        assert_eq!(s.total_rtt, 30);
        assert_eq!(s.metric("RTT_Total"), Some(30));
        assert_eq!(s.metric("MQTT_to_WebSocket"), Some(10));
        assert_eq!(s.metric("Django_to_Frontend"), Some(10));
        assert_eq!(s.metric("Frontend_to_MQTT"), Some(10));
        assert_eq!(s.metric("WebSocket_Processing"), None);
        assert_eq!(s.hops.iter().map(|h| h.millis).sum::<i64>(), s.total_rtt);
    }

    #[test]
    fn test_sample_requires_send_and_receive_stage() {
        let schema = StageSchema::default();
        assert!(LatencySample::from_stages("x", StageTimestamps::from([("T1", 1)]), &schema, None)
            .is_none());
        assert!(LatencySample::from_stages("x", StageTimestamps::from([("T4", 1)]), &schema, None)
            .is_none());
        assert!(LatencySample::from_stages(
            "x",
            StageTimestamps::from([("T1", i64::MIN), ("T4", 1)]),
            &schema,
            None
        )
        .is_none());
    }

    #[test]
    fn test_warmup_tagging() {
        let mut log = SampleLog::new(5);
        for i in 0..10 {
            log.push(sample(&format!("p{}", i + 1), 10 + i));
        }
        assert_eq!(log.len(), 10);
        assert_eq!(log.all().iter().filter(|s| s.warmup).count(), 5);

        let measured = log.measured();
        assert_eq!(measured.len(), 5);
        assert_eq!(measured[0].id, "p6");
        assert_eq!(measured[4].id, "p10");
        assert!(measured.iter().all(|s| !s.warmup));
    }

    #[test]
    fn test_measured_shorter_than_warmup() {
        let mut log = SampleLog::new(5);
        log.push(sample("p1", 3));
        log.push(sample("p2", 4));
        assert!(log.measured().is_empty());
        assert_eq!(log.all().len(), 2);
    }
}
