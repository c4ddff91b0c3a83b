//! Statistics computation and formatted output.
//!
//! Percentiles use the nearest-rank convention without interpolation: the sorted
//! values are indexed at `floor(n * p)`, clamped to the last element. The median
//! is taken the same way at `floor(n / 2)`, so for an even count it is the upper
//! of the two middle values. These conventions are kept exactly so that reports
//! stay comparable between runs and tools.

use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::sample::LatencySample;

/// Output format for statistics reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
    /// CSV output for spreadsheet import.
    Csv,
}

/// Summary statistics of one metric, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsRecord {
    pub count: usize,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub median: i64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub p95: i64,
    pub p99: i64,
}

impl StatisticsRecord {
    /// Computes statistics over `values`. Returns `None` when `values` is empty.
    pub fn from_values(values: &[i64]) -> Option<StatisticsRecord> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_unstable();

        let n = sorted.len();
        let sum: i128 = sorted.iter().map(|&v| v as i128).sum();
        let mean = sum as f64 / n as f64;
        let variance = sorted
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;

        Some(StatisticsRecord {
            count: n,
            min: sorted[0],
            max: sorted[n - 1],
            mean,
            median: sorted[(n / 2).min(n - 1)],
            std_dev: variance.sqrt(),
            p95: nearest_rank(&sorted, 0.95),
            p99: nearest_rank(&sorted, 0.99),
        })
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
pub fn nearest_rank(sorted: &[i64], p: f64) -> i64 {
    let idx = (sorted.len() as f64 * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Statistics per metric, in the order the metrics were requested.
///
/// Serializes as an object keyed by metric name, keeping that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    metrics: Vec<(String, StatisticsRecord)>,
}

impl Serialize for Statistics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.metrics.len()))?;
        for (name, record) in &self.metrics {
            map.serialize_entry(name, record)?;
        }
        map.end()
    }
}

impl Statistics {
    pub fn get(&self, metric: &str) -> Option<&StatisticsRecord> {
        self.metrics
            .iter()
            .find(|(name, _)| name == metric)
            .map(|(_, record)| record)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatisticsRecord)> {
        self.metrics.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Computes statistics for each metric over `samples`.
///
/// Samples that do not define a metric are skipped for that metric only. Metrics
/// without any value are omitted from the result.
pub fn compute<S: AsRef<str>>(samples: &[LatencySample], metric_names: &[S]) -> Statistics {
    let metrics = metric_names
        .iter()
        .filter_map(|name| {
            let name = name.as_ref();
            let values: Vec<i64> = samples.iter().filter_map(|s| s.metric(name)).collect();
            StatisticsRecord::from_values(&values).map(|record| (name.to_string(), record))
        })
        .collect();
    Statistics { metrics }
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub role: String,
    pub probes_sent: u32,
    pub probes_completed: usize,
    pub probes_lost: u64,
    pub probes_discarded: usize,
    pub warmup_excluded: usize,
    pub malformed_messages: u64,
    pub unknown_messages: u64,
    pub responses_sent: u64,
    pub metrics: Statistics,
}

impl StatsReport {
    /// Prints the report in the given format.
    pub fn print(&self, format: OutputFormat) {
        print!("{}", self.render(format));
    }

    /// Renders the report in the given format.
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
            OutputFormat::Csv => self.render_csv(),
        }
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("\n--- Latency Statistics ({}) ---\n", self.role));
        out.push_str(&format!("Probes sent: {}\n", self.probes_sent));
        out.push_str(&format!("Probes completed: {}\n", self.probes_completed));
        out.push_str(&format!("Probes lost: {}\n", self.probes_lost));
        if self.probes_discarded > 0 {
            out.push_str(&format!(
                "Probes in flight at shutdown: {}\n",
                self.probes_discarded
            ));
        }
        out.push_str(&format!("Warm-up excluded: {}\n", self.warmup_excluded));
        if self.malformed_messages > 0 {
            out.push_str(&format!("Malformed messages: {}\n", self.malformed_messages));
        }
        if self.unknown_messages > 0 {
            out.push_str(&format!("Unknown messages: {}\n", self.unknown_messages));
        }
        if self.responses_sent > 0 {
            out.push_str(&format!("Responses sent: {}\n", self.responses_sent));
        }
        for (name, r) in self.metrics.iter() {
            out.push_str(&format!(
                "{}: n={} min={} max={} mean={:.3} median={} std_dev={:.3} p95={} p99={} (ms)\n",
                name, r.count, r.min, r.max, r.mean, r.median, r.std_dev, r.p95, r.p99
            ));
        }
        out
    }

    fn render_json(&self) -> String {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            #[serde(rename = "type")]
            report_type: &'a str,
            #[serde(flatten)]
            stats: &'a StatsReport,
        }
        let output = JsonOutput {
            report_type: "summary",
            stats: self,
        };
        match serde_json::to_string(&output) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                log::error!("Cannot serialize statistics report: {}", e);
                String::new()
            }
        }
    }

    fn render_csv(&self) -> String {
        let mut out = String::from("metric,count,min,max,mean,median,std_dev,p95,p99\n");
        for (name, r) in self.metrics.iter() {
            out.push_str(&format!(
                "{},{},{},{},{:.3},{},{:.3},{},{}\n",
                name, r.count, r.min, r.max, r.mean, r.median, r.std_dev, r.p95, r.p99
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{StageSchema, StageTimestamps};

    fn rtt_sample(rtt: i64) -> LatencySample {
        LatencySample::from_stages(
            "s",
            StageTimestamps::from([("T1", 1000), ("T4", 1000 + rtt)]),
            &StageSchema::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_nearest_rank_convention() {
        let r = StatisticsRecord::from_values(&[40, 10, 30, 20]).unwrap();
        assert_eq!(r.median, 30);
        assert_eq!(r.p95, 40);
        assert_eq!(r.p99, 40);
        assert_eq!(r.min, 10);
        assert_eq!(r.max, 40);
        assert!((r.mean - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_value() {
        let r = StatisticsRecord::from_values(&[7]).unwrap();
        assert_eq!(r.count, 1);
        assert_eq!(r.median, 7);
        assert_eq!(r.p95, 7);
        assert_eq!(r.p99, 7);
        assert_eq!(r.std_dev, 0.0);
    }

    #[test]
    fn test_hundred_values() {
        let values: Vec<i64> = (1..=100).collect();
        let r = StatisticsRecord::from_values(&values).unwrap();
        // floor(100 * 0.95) = 95 -> 96, floor(100 * 0.99) = 99 -> 100
        assert_eq!(r.p95, 96);
        assert_eq!(r.p99, 100);
        assert_eq!(r.median, 51);
    }

    #[test]
    fn test_population_std_dev() {
        let r = StatisticsRecord::from_values(&[2, 4, 4, 4, 5, 5, 7, 9]).unwrap();
        assert!((r.mean - 5.0).abs() < 1e-9);
        assert!((r.std_dev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_values_reported() {
        let r = StatisticsRecord::from_values(&[-5, 3, -1]).unwrap();
        assert_eq!(r.min, -5);
        assert_eq!(r.max, 3);
        assert_eq!(r.median, -1);
    }

    #[test]
    fn test_empty_values() {
        assert!(StatisticsRecord::from_values(&[]).is_none());
    }

    #[test]
    fn test_compute_on_empty_samples_omits_metrics() {
        let stats = compute(&[], &StageSchema::default().metric_names());
        assert!(stats.is_empty());
    }

    #[test]
    fn test_compute_skips_missing_metrics() {
        let schema = StageSchema::default();
        let with_hop = LatencySample::from_stages(
            "a",
            StageTimestamps::from([("T1", 0), ("T2", 4), ("T2_5", 6), ("T3", 9), ("T4", 12)]),
            &schema,
            None,
        )
        .unwrap();
        let without_hop = rtt_sample(20);

        let stats = compute(&[with_hop, without_hop], &schema.metric_names());
        assert_eq!(stats.get("RTT_Total").unwrap().count, 2);
        assert_eq!(stats.get("WebSocket_Processing").unwrap().count, 1);
        assert_eq!(stats.get("WebSocket_Processing").unwrap().min, 2);
        // Only produced when T2_5 is absent and T2/T3 present
        assert!(stats.get("Django_to_Frontend").is_none());
        // Sample without T2 yields a T1 -> T4 hop, which is not a requested metric
        assert!(stats.get("T1_to_T4").is_none());
    }

    #[test]
    fn test_compute_preserves_requested_order() {
        let samples = vec![rtt_sample(5)];
        let stats = compute(&samples, &["T1_to_T4", "RTT_Total"]);
        let names: Vec<&str> = stats.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["T1_to_T4", "RTT_Total"]);
    }

    fn report() -> StatsReport {
        let samples: Vec<LatencySample> = [10, 20, 30, 40].iter().map(|&v| rtt_sample(v)).collect();
        StatsReport {
            role: "probe".to_string(),
            probes_sent: 5,
            probes_completed: 4,
            probes_lost: 1,
            probes_discarded: 0,
            warmup_excluded: 0,
            malformed_messages: 2,
            unknown_messages: 0,
            responses_sent: 0,
            metrics: compute(&samples, &["RTT_Total"]),
        }
    }

    #[test]
    fn test_report_text_format() {
        let text = report().render(OutputFormat::Text);
        assert!(text.contains("Probes lost: 1"));
        assert!(text.contains("Malformed messages: 2"));
        assert!(text.contains("RTT_Total: n=4 min=10 max=40"));
    }

    #[test]
    fn test_report_json_format() {
        let json = report().render(OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(json.trim()).unwrap();
        assert_eq!(value["type"], "summary");
        assert_eq!(value["probes_lost"], 1);
        assert_eq!(value["metrics"]["RTT_Total"]["count"], 4);
        assert_eq!(value["metrics"]["RTT_Total"]["median"], 30);
    }

    #[test]
    fn test_statistics_serialize_as_ordered_object() {
        let samples = vec![rtt_sample(5)];
        let stats = compute(&samples, &["T1_to_T4", "RTT_Total"]);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.starts_with(r#"{"T1_to_T4":{"count":1,"#));
        let rtt = json.find(r#""RTT_Total":{"count":1,"#).unwrap();
        assert!(rtt > json.find("T1_to_T4").unwrap());
    }

    #[test]
    fn test_report_csv_format() {
        let csv = report().render(OutputFormat::Csv);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "metric,count,min,max,mean,median,std_dev,p95,p99");
        assert_eq!(lines[1], "RTT_Total,4,10,40,25.000,30,11.180,40,40");
    }
}
