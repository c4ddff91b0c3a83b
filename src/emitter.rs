//! Probe emitter.

use serde_json::Value;
use thiserror::Error;

use crate::{
    correlation::{CorrelationError, CorrelationTable},
    messages::LatencyRequest,
    qos::QoS,
    session::IdSource,
    stages::StageTimestamps,
    time::Clock,
    transport::{Publisher, TransportError},
};

/// Errors returned by [`ProbeEmitter::emit`].
#[derive(Error, Debug)]
pub enum EmitError {
    /// Every probe of the run's budget has already been emitted.
    #[error("Message budget of {0} probes exhausted")]
    BudgetExhausted(u32),
    #[error("Cannot encode probe {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    DuplicateId(#[from] CorrelationError),
    /// The probe stays registered; the reaper evicts it if nothing comes back.
    #[error("Probe {id} registered but publish failed: {source}")]
    PublishFailed {
        id: String,
        #[source]
        source: TransportError,
    },
}

/// Builds, registers and publishes probe requests within a fixed budget.
pub struct ProbeEmitter {
    topic: String,
    qos: QoS,
    budget: u32,
    emitted: u32,
}

impl ProbeEmitter {
    pub fn new(topic: &str, qos: QoS, budget: u32) -> Self {
        ProbeEmitter {
            topic: topic.to_string(),
            qos,
            budget,
            emitted: 0,
        }
    }

    /// Emits one probe carrying `payload` and returns its id.
    ///
    /// The probe is registered in `table` before it is published. A failed publish
    /// still consumes budget and leaves the registration in place, since the message
    /// may have reached the broker anyway.
    pub fn emit<P: Publisher + ?Sized>(
        &mut self,
        payload: &Value,
        table: &mut CorrelationTable,
        clock: &dyn Clock,
        ids: &dyn IdSource,
        publisher: &P,
    ) -> Result<String, EmitError> {
        if self.is_exhausted() {
            return Err(EmitError::BudgetExhausted(self.budget));
        }

        let send_time = clock.now_millis();
        let id = ids.next_id(send_time);
        let request = LatencyRequest {
            message_id: id.clone(),
            timestamp: send_time,
            timestamps: StageTimestamps::sent_at(send_time),
            data: payload.clone(),
        };
        let bytes = request.encode().map_err(|source| EmitError::Encode {
            id: id.clone(),
            source,
        })?;

        table.register(&id, send_time)?;
        self.emitted += 1;

        publisher
            .publish(&self.topic, &bytes, self.qos)
            .map_err(|source| EmitError::PublishFailed {
                id: id.clone(),
                source,
            })?;

        log::debug!(
            "Probe {} sent ({}/{}) on {}",
            id,
            self.emitted,
            self.budget,
            self.topic
        );
        Ok(id)
    }

    pub fn is_exhausted(&self) -> bool {
        self.emitted >= self.budget
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn remaining(&self) -> u32 {
        self.budget.saturating_sub(self.emitted)
    }
}
