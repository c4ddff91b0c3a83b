use std::{fmt, net::IpAddr, path::PathBuf};

pub use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::{
    qos::QoS,
    stages::{STAGE_RECEIVED, STAGE_SENT},
    stats::OutputFormat,
};

/// Role this participant plays in the measurement topology.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum Role {
    /// Emits probes and reconciles responses; an external responder answers.
    #[default]
    Probe,
    /// Only answers other participants' probes. Runs until cancelled.
    Responder,
    /// Emits probes and answers other peers' probes.
    Peer,
}

impl Role {
    pub fn emits(self) -> bool {
        matches!(self, Role::Probe | Role::Peer)
    }

    pub fn responds(self) -> bool {
        matches!(self, Role::Responder | Role::Peer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Probe => write!(f, "probe"),
            Role::Responder => write!(f, "responder"),
            Role::Peer => write!(f, "peer"),
        }
    }
}

/// Transport used by the binary.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum TransportKind {
    /// Topic-framed UDP datagrams to the broker address.
    #[default]
    Udp,
    /// In-process broker with a built-in responder.
    Loopback,
}

/// Reasons a configuration is rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Topic must not be empty")]
    EmptyTopic,
    #[error("Topic {0} contains wildcards and cannot be published to")]
    WildcardTopic(String),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("Probe timeout ({timeout_ms} ms) must be larger than the emission interval ({interval_ms} ms)")]
    TimeoutTooShort { timeout_ms: u64, interval_ms: u64 },
    #[error("Payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("Responder stage {0} is reserved")]
    ReservedStage(String),
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Configuration {
    /// Broker (or remote peer) address
    #[arg(short = 'b', long, env = "MQTT_BROKER", default_value = "127.0.0.1")]
    pub broker: IpAddr,
    /// Broker port
    #[arg(short = 'p', long, env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,
    /// Local address to bind for
    #[arg(short, long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,
    /// Local port to bind for (0 picks any)
    #[arg(short = 'o', long, default_value_t = 0)]
    pub local_port: u16,
    /// Broker user name
    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,
    /// Broker password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Topic probes and responses are exchanged on
    #[arg(short, long, env = "MQTT_TOPIC", default_value = "latency")]
    pub topic: String,
    /// Quality of service for publishes and the subscription
    #[arg(short, long, value_enum, default_value_t = QoS::AtMostOnce)]
    pub qos: QoS,
    /// Total number of probes to emit
    #[arg(short = 'n', long, default_value_t = 100)]
    pub count: u32,
    /// Number of initial samples excluded from statistics and export
    #[arg(short, long, default_value_t = 5)]
    pub warmup: u32,
    /// Emission interval in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    pub interval_ms: u64,
    /// Reaper sweep interval in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub reap_interval_ms: u64,
    /// Time after which an unanswered probe is considered lost, in milliseconds
    #[arg(long, default_value_t = 30000)]
    pub timeout_ms: u64,
    /// Role of this participant
    #[arg(short, long, value_enum, default_value_t = Role::Probe)]
    pub role: Role,
    /// Stage label stamped when answering a request
    #[arg(long, default_value = "T2")]
    pub responder_stage: String,
    /// Tag identifying this participant in responses
    #[arg(long, default_value = "pubsub-latency")]
    pub source_tag: String,
    /// JSON payload carried by every probe
    #[arg(long, default_value = r#"{"1":1,"2":0}"#)]
    pub payload: String,
    /// Directory the CSV results are written to
    #[arg(short = 'd', long, default_value = ".")]
    pub output_dir: PathBuf,
    /// Format of the printed statistics report
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
    /// Transport to use
    #[arg(long, value_enum, default_value_t = TransportKind::Udp)]
    pub transport: TransportKind,
    /// Expose Prometheus metrics
    #[cfg(feature = "metrics")]
    #[arg(long)]
    pub metrics: bool,
    /// Address of the Prometheus metrics endpoint
    #[cfg(feature = "metrics")]
    #[arg(long, default_value = "127.0.0.1:9090")]
    pub metrics_addr: std::net::SocketAddr,
}

impl Configuration {
    /// Checks option combinations clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.topic.is_empty() {
            return Err(ConfigurationError::EmptyTopic);
        }
        if self.topic.contains(['+', '#']) {
            return Err(ConfigurationError::WildcardTopic(self.topic.clone()));
        }
        if self.interval_ms == 0 {
            return Err(ConfigurationError::ZeroValue("Emission interval"));
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigurationError::ZeroValue("Reaper interval"));
        }
        if self.role.emits() && self.count == 0 {
            return Err(ConfigurationError::ZeroValue("Message count"));
        }
        if self.timeout_ms <= self.interval_ms {
            return Err(ConfigurationError::TimeoutTooShort {
                timeout_ms: self.timeout_ms,
                interval_ms: self.interval_ms,
            });
        }
        self.payload_value()?;
        if self.responder_stage == STAGE_SENT || self.responder_stage == STAGE_RECEIVED {
            return Err(ConfigurationError::ReservedStage(
                self.responder_stage.clone(),
            ));
        }
        if self.role.emits() && self.warmup >= self.count {
            log::warn!(
                "Warm-up ({}) covers the whole budget ({}); statistics will be empty",
                self.warmup,
                self.count
            );
        }
        Ok(())
    }

    /// The probe payload parsed as JSON.
    pub fn payload_value(&self) -> Result<serde_json::Value, ConfigurationError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ConfigurationError::InvalidPayload(e.to_string()))
    }
}
