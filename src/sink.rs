//! Result sink: persists finished samples.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use thiserror::Error;

use crate::{sample::LatencySample, time::file_name_timestamp};

/// Columns of the CSV export, in order.
pub const CSV_HEADER: [&str; 12] = [
    "messageId",
    "T1",
    "T2",
    "T2_5",
    "T3",
    "T4",
    "RTT_Total",
    "MQTT_to_WebSocket",
    "WebSocket_Processing",
    "Django_Processing",
    "Django_to_Frontend",
    "Frontend_to_MQTT",
];

const STAGE_COLUMNS: [&str; 5] = ["T1", "T2", "T2_5", "T3", "T4"];
const METRIC_COLUMNS: [&str; 6] = [
    "RTT_Total",
    "MQTT_to_WebSocket",
    "WebSocket_Processing",
    "Django_Processing",
    "Django_to_Frontend",
    "Frontend_to_MQTT",
];

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Cannot write results to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Destination for a finished run's samples.
pub trait ResultSink: Send {
    /// Persists `samples` under the logical `name` and returns where they went.
    fn persist(&self, samples: &[LatencySample], name: &str) -> Result<PathBuf, SinkError>;
}

/// Writes samples as CSV files into a directory.
///
/// File names look like `latency_results_<name>_2024-05-01T10-00-00-000Z.csv`.
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        CsvSink { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(
            "latency_results_{}_{}.csv",
            name,
            file_name_timestamp(Utc::now())
        ))
    }
}

impl ResultSink for CsvSink {
    fn persist(&self, samples: &[LatencySample], name: &str) -> Result<PathBuf, SinkError> {
        let path = self.file_path(name);
        let io_err = |source| SinkError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut writer = BufWriter::new(File::create(&path).map_err(io_err)?);
        write_csv(&mut writer, samples).map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        log::info!("Wrote {} samples to {}", samples.len(), path.display());
        Ok(path)
    }
}

/// Writes the header and one row per sample. Absent values are empty cells.
pub fn write_csv<W: Write>(writer: &mut W, samples: &[LatencySample]) -> io::Result<()> {
    writeln!(writer, "{}", CSV_HEADER.join(","))?;
    for sample in samples {
        let mut cells = Vec::with_capacity(CSV_HEADER.len());
        cells.push(escape(&sample.id));
        cells.extend(STAGE_COLUMNS.iter().map(|s| fmt_opt(sample.stages.get(s))));
        cells.extend(METRIC_COLUMNS.iter().map(|m| fmt_opt(sample.metric(m))));
        writeln!(writer, "{}", cells.join(","))?;
    }
    Ok(())
}

fn fmt_opt(v: Option<i64>) -> String {
    v.map_or_else(String::new, |x| x.to_string())
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
