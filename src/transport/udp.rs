//! Topic-framed datagrams over UDP.
//!
//! Each datagram carries one message:
//!
//! ```text
//! +----------------+------------------+-------------------------+
//! | topic len (BE) | topic (UTF-8)    | payload                 |
//! |    2 octets    | topic len octets | rest of the datagram    |
//! +----------------+------------------+-------------------------+
//! ```
//!
//! Delivery is best-effort whatever QoS is requested. Credentials are accepted for
//! configuration compatibility but there is no authentication step on this wire.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{topic_matches, InboundMessage, Publisher, Transport, TransportError};
use crate::qos::QoS;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Encodes a topic and payload into a datagram.
pub fn encode_frame(topic: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let topic_len = u16::try_from(topic.len()).map_err(|_| TransportError::Publish {
        topic: topic.to_string(),
        reason: "topic too long".to_string(),
    })?;
    let total = 2 + topic.len() + payload.len();
    if total > MAX_DATAGRAM {
        return Err(TransportError::Publish {
            topic: topic.to_string(),
            reason: format!("frame of {} bytes exceeds datagram limit", total),
        });
    }

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&topic_len.to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes a datagram into a message. Returns `None` for truncated frames or
/// non-UTF-8 topics.
pub fn decode_frame(buf: &[u8]) -> Option<InboundMessage> {
    if buf.len() < 2 {
        return None;
    }
    let topic_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let topic_end = 2 + topic_len;
    if buf.len() < topic_end {
        return None;
    }
    let topic = std::str::from_utf8(&buf[2..topic_end]).ok()?;
    Some(InboundMessage {
        topic: topic.to_string(),
        payload: buf[topic_end..].to_vec(),
    })
}

/// Publishing handle sharing the transport's socket.
#[derive(Clone)]
pub struct UdpPublisher {
    socket: Arc<UdpSocket>,
}

impl Publisher for UdpPublisher {
    fn publish(&self, topic: &str, payload: &[u8], _qos: QoS) -> Result<(), TransportError> {
        let frame = encode_frame(topic, payload)?;
        self.socket
            .try_send(&frame)
            .map(|_| ())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// UDP transport exchanging frames with a single remote endpoint.
pub struct UdpTransport {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    subscriptions: Vec<String>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        UdpTransport {
            local_addr,
            remote_addr,
            socket: None,
            subscriptions: Vec::new(),
            recv_buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Address the socket is actually bound to (useful when binding port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    type Publisher = UdpPublisher;

    async fn connect(&mut self) -> Result<UdpPublisher, TransportError> {
        let socket = UdpSocket::bind(self.local_addr).await.map_err(|e| {
            TransportError::Connect(format!("cannot bind to {}: {}", self.local_addr, e))
        })?;
        socket.connect(self.remote_addr).await.map_err(|e| {
            TransportError::Connect(format!("cannot connect to {}: {}", self.remote_addr, e))
        })?;

        log::info!(
            "UDP transport {} -> {}",
            socket.local_addr().unwrap_or(self.local_addr),
            self.remote_addr
        );

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());
        Ok(UdpPublisher { socket })
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::NotConnected);
        }
        if qos != QoS::AtMostOnce {
            log::debug!("UDP transport delivers QoS {} subscriptions best-effort", qos);
        }
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        let socket = self.socket.clone().ok_or(TransportError::NotConnected)?;
        loop {
            let len = socket
                .recv(&mut self.recv_buf)
                .await
                .map_err(|e| TransportError::Receive(e.to_string()))?;

            match decode_frame(&self.recv_buf[..len]) {
                Some(msg)
                    if self
                        .subscriptions
                        .iter()
                        .any(|filter| topic_matches(filter, &msg.topic)) =>
                {
                    return Ok(msg)
                }
                Some(msg) => log::trace!("Ignoring datagram for topic {}", msg.topic),
                None => log::debug!("Dropping undecodable datagram of {} bytes", len),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        self.subscriptions.clear();
        Ok(())
    }
}
