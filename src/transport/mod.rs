//! Publish/subscribe transport capability.
//!
//! The engine never talks to a broker directly. It consumes a [`Transport`] for the
//! connection lifecycle and inbound messages, and a [`Publisher`] handle for
//! fire-and-forget publishing. Reliability, retries and QoS delivery semantics
//! belong to the transport.
//!
//! Two implementations ship with the crate:
//! - [`udp::UdpTransport`]: topic-framed datagrams exchanged with a remote endpoint
//! - [`memory::MemoryBroker`]: an in-process broker used for loopback runs and tests

pub mod memory;
pub mod udp;

use async_trait::async_trait;
use thiserror::Error;

use crate::qos::QoS;

pub use memory::{MemoryBroker, MemoryPublisher, MemoryTransport};
pub use udp::{UdpPublisher, UdpTransport};

/// Transport-level failures. Logged by the engine, never fatal to a run.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Transport closed")]
    Closed,
}

/// A message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Fire-and-forget publishing handle.
///
/// `publish` must not wait for a network round trip: it hands the payload to the
/// transport and returns. `Ok` means the transport accepted the message, not that
/// it reached the broker.
pub trait Publisher {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError>;
}

impl<P: Publisher + ?Sized> Publisher for &P {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        (**self).publish(topic, payload, qos)
    }
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        (**self).publish(topic, payload, qos)
    }
}

/// Connection lifecycle and inbound side of a publish/subscribe transport.
#[async_trait]
pub trait Transport: Send {
    type Publisher: Publisher + Send;

    /// Establishes the connection and returns a publishing handle.
    async fn connect(&mut self) -> Result<Self::Publisher, TransportError>;

    /// Subscribes to `topic`; resolves on acknowledgment.
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Waits for the next inbound message on a subscribed topic.
    ///
    /// Must be cancel-safe: dropping the future loses no message already received.
    async fn recv(&mut self) -> Result<InboundMessage, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Returns `true` if `topic` matches the MQTT-style `filter` (`+` and `#` wildcards).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_exact_match() {
        assert!(topic_matches("latency/probe", "latency/probe"));
        assert!(!topic_matches("latency/probe", "latency/other"));
        assert!(!topic_matches("latency", "latency/probe"));
        assert!(!topic_matches("latency/probe", "latency"));
    }

    #[test]
    fn test_topic_wildcards() {
        assert!(topic_matches("latency/+", "latency/probe"));
        assert!(!topic_matches("latency/+", "latency/probe/deep"));
        assert!(topic_matches("latency/#", "latency/probe/deep"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("+/probe", "latency/probe"));
    }
}
