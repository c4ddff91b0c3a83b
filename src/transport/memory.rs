//! In-process broker.
//!
//! Every message published on the broker is delivered to every connected transport
//! subscribed to a matching topic, including the publisher itself, the way an MQTT
//! broker echoes messages back to the publishing client's own subscriptions.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{topic_matches, InboundMessage, Publisher, Transport, TransportError};
use crate::qos::QoS;

const DEFAULT_CAPACITY: usize = 1024;

/// Shared in-memory broker. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<InboundMessage>,
    fail_publishes: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a broker buffering at most `capacity` undelivered messages per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        MemoryBroker {
            tx,
            fail_publishes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a new client connection handle to this broker.
    ///
    /// The handle starts buffering broker traffic immediately, so messages published
    /// between creation and [`Transport::connect`] are delivered once connected.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            rx: Some(self.tx.subscribe()),
            connected: false,
            subscriptions: Vec::new(),
        }
    }

    /// Makes every subsequent publish fail (or succeed again).
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Relaxed);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishing handle of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
}

impl Publisher for MemoryPublisher {
    fn publish(&self, topic: &str, payload: &[u8], _qos: QoS) -> Result<(), TransportError> {
        if self.broker.fail_publishes.load(Ordering::Relaxed) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "broker rejected publish".to_string(),
            });
        }
        // No subscribers is not an error for a broker.
        let _ = self.broker.tx.send(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// One client connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    rx: Option<broadcast::Receiver<InboundMessage>>,
    connected: bool,
    subscriptions: Vec<String>,
}

#[async_trait]
impl Transport for MemoryTransport {
    type Publisher = MemoryPublisher;

    async fn connect(&mut self) -> Result<MemoryPublisher, TransportError> {
        if self.rx.is_none() {
            self.rx = Some(self.broker.tx.subscribe());
        }
        self.connected = true;
        Ok(MemoryPublisher {
            broker: self.broker.clone(),
        })
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        let rx = match self.rx.as_mut() {
            Some(rx) if self.connected => rx,
            _ => return Err(TransportError::NotConnected),
        };
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if self
                        .subscriptions
                        .iter()
                        .any(|filter| topic_matches(filter, &msg.topic))
                    {
                        return Ok(msg);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Memory transport lagged, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.rx = None;
        self.connected = false;
        self.subscriptions.clear();
        Ok(())
    }
}
