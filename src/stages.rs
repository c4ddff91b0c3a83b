//! Stage timestamps and the schema used to turn them into per-hop latencies.
//!
//! Every hop a probe passes through may stamp its own labelled timestamp. The
//! engine does not need to know what a label means: a [`StageSchema`] lists the
//! expected labels in traversal order, and [`StageSchema::per_hop_deltas`] walks
//! whatever subset is present, producing consecutive differences.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Deserializer, Serialize};

/// Stage stamped by the emitter when the probe is created.
pub const STAGE_SENT: &str = "T1";
/// Stage stamped by the reconciler when the response arrives.
pub const STAGE_RECEIVED: &str = "T4";

/// Metric name for the end-to-end round trip.
pub const RTT_TOTAL: &str = "RTT_Total";

/// Sparse mapping from stage label to timestamp (milliseconds).
///
/// Serializes as a plain JSON object, e.g. `{"T1": 1000, "T2": 1010}`. Fractional
/// values are floored to whole milliseconds when deserialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StageTimestamps(BTreeMap<String, i64>);

impl StageTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mapping holding only the send stage.
    pub fn sent_at(send_time: i64) -> Self {
        let mut stamps = Self::new();
        stamps.set(STAGE_SENT, send_time);
        stamps
    }

    /// Sets (or overwrites) a stage.
    pub fn set(&mut self, label: &str, millis: i64) {
        self.0.insert(label.to_string(), millis);
    }

    pub fn get(&self, label: &str) -> Option<i64> {
        self.0.get(label).copied()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<'de> Deserialize<'de> for StageTimestamps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, serde_json::Number>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(label, value)| match whole_millis(&value) {
                Some(millis) => Ok((label, millis)),
                None => Err(de::Error::custom(format!(
                    "stage {} has out-of-range timestamp {}",
                    label, value
                ))),
            })
            .collect::<Result<BTreeMap<_, _>, D::Error>>()
            .map(StageTimestamps)
    }
}

/// Converts a JSON number to whole milliseconds, flooring fractions.
pub(crate) fn whole_millis(value: &serde_json::Number) -> Option<i64> {
    if let Some(millis) = value.as_i64() {
        return Some(millis);
    }
    let millis = value.as_f64()?.floor();
    // i64::MAX is not representable as f64; its nearest neighbour is 2^63.
    if millis.is_finite() && millis >= i64::MIN as f64 && millis < i64::MAX as f64 {
        Some(millis as i64)
    } else {
        None
    }
}

impl<const N: usize> From<[(&str, i64); N]> for StageTimestamps {
    fn from(stamps: [(&str, i64); N]) -> Self {
        StageTimestamps(
            stamps
                .into_iter()
                .map(|(label, millis)| (label.to_string(), millis))
                .collect(),
        )
    }
}

/// Latency between two consecutive present stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HopDelta {
    /// Metric name of this hop.
    pub metric: String,
    pub from: String,
    pub to: String,
    /// `to - from` in milliseconds. Negative values are kept as reported.
    pub millis: i64,
}

/// Ordered list of expected stage labels plus the metric names of known hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSchema {
    stages: Vec<String>,
    hop_names: Vec<(String, String, String)>,
}

impl StageSchema {
    /// Creates a schema from labels in traversal order. Hops get generated names.
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StageSchema {
            stages: stages.into_iter().map(Into::into).collect(),
            hop_names: Vec::new(),
        }
    }

    /// Names the hop between two labels.
    pub fn with_hop_name(mut self, from: &str, to: &str, metric: &str) -> Self {
        self.hop_names
            .push((from.to_string(), to.to_string(), metric.to_string()));
        self
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Metric name for the hop `from -> to`.
    ///
    /// Unnamed hops are called `<from>_to_<to>`.
    pub fn hop_metric(&self, from: &str, to: &str) -> String {
        self.hop_names
            .iter()
            .find(|(f, t, _)| f == from && t == to)
            .map(|(_, _, name)| name.clone())
            .unwrap_or_else(|| format!("{}_to_{}", from, to))
    }

    /// Every hop metric name the schema can produce, in traversal order.
    ///
    /// Named hops come first in declaration order, followed by generated names for
    /// consecutive declared stages that have no explicit name.
    pub fn hop_metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hop_names
            .iter()
            .map(|(_, _, name)| name.clone())
            .collect();
        for pair in self.stages.windows(2) {
            let name = self.hop_metric(&pair[0], &pair[1]);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// All metric names: the round trip followed by the hop metrics.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names = vec![RTT_TOTAL.to_string()];
        names.extend(self.hop_metric_names());
        names
    }

    /// Consecutive differences between the stages present in `stamps`.
    ///
    /// Labels not declared in the schema are ignored. When every declared stage is
    /// present the deltas sum to `last - first`. A hop whose difference does not
    /// fit in an `i64` is skipped.
    pub fn per_hop_deltas(&self, stamps: &StageTimestamps) -> Vec<HopDelta> {
        let present: Vec<(&str, i64)> = self
            .stages
            .iter()
            .filter_map(|label| stamps.get(label).map(|ts| (label.as_str(), ts)))
            .collect();

        present
            .windows(2)
            .filter_map(|pair| {
                let (from, from_ts) = pair[0];
                let (to, to_ts) = pair[1];
                let Some(millis) = to_ts.checked_sub(from_ts) else {
                    log::warn!(
                        "Skipping hop {} -> {}: timestamps {} and {} are too far apart",
                        from,
                        to,
                        from_ts,
                        to_ts
                    );
                    return None;
                };
                Some(HopDelta {
                    metric: self.hop_metric(from, to),
                    from: from.to_string(),
                    to: to.to_string(),
                    millis,
                })
            })
            .collect()
    }
}

impl Default for StageSchema {
    /// Client -> WebSocket bridge -> backend -> frontend -> client.
    fn default() -> Self {
        StageSchema::new([STAGE_SENT, "T2", "T2_5", "T3", STAGE_RECEIVED])
            .with_hop_name(STAGE_SENT, "T2", "MQTT_to_WebSocket")
            .with_hop_name("T2", "T2_5", "WebSocket_Processing")
            .with_hop_name("T2_5", "T3", "Django_Processing")
            .with_hop_name("T2", "T3", "Django_to_Frontend")
            .with_hop_name("T3", STAGE_RECEIVED, "Frontend_to_MQTT")
    }
}
