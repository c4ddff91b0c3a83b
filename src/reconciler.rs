//! Response reconciler.
//!
//! Classifies every inbound payload, matches responses against the correlation
//! table and turns matches into latency samples. Optionally answers requests from
//! other participants (peer-echo topologies).

use crate::{
    correlation::CorrelationTable,
    messages::{LatencyRequest, LatencyResponse, Message, MessageError, LATENCY_RESPONSE},
    qos::QoS,
    sample::{LatencySample, SampleLog},
    stages::{StageSchema, STAGE_RECEIVED, STAGE_SENT},
    time::Clock,
    transport::{Publisher, TransportError},
};

/// What happened to one inbound message.
#[derive(Debug)]
pub enum Reconciliation {
    /// A response matched an outstanding probe and produced a sample.
    Completed { id: String, total_rtt: i64 },
    /// A response for a probe that is not outstanding (foreign, resolved or reaped).
    Unmatched { id: String },
    /// A request from another participant was answered.
    Answered { id: String },
    /// Answering a request failed at the transport.
    AnswerFailed { id: String, error: TransportError },
    /// A request this participant emitted itself.
    OwnRequest { id: String },
    /// A foreign request while the responder capability is disabled.
    RequestIgnored { id: String },
    /// Well-formed message of an unhandled type.
    UnknownType(Option<String>),
    /// Payload failed to decode or validate.
    Malformed(MessageError),
}

/// Settings of the responder capability.
#[derive(Debug, Clone)]
pub struct Responder {
    /// Stage label stamped on arrival of a request, e.g. `T2`.
    pub stage: String,
    pub source_tag: String,
    pub topic: String,
    pub qos: QoS,
}

/// Borrowed engine state the reconciler works on.
pub struct ReconcileContext<'a, P: Publisher + ?Sized> {
    pub table: &'a mut CorrelationTable,
    pub samples: &'a mut SampleLog,
    pub clock: &'a dyn Clock,
    pub publisher: &'a P,
}

pub struct Reconciler {
    schema: StageSchema,
    responder: Option<Responder>,
}

impl Reconciler {
    pub fn new(schema: StageSchema, responder: Option<Responder>) -> Self {
        Reconciler { schema, responder }
    }

    pub fn schema(&self) -> &StageSchema {
        &self.schema
    }

    pub fn responder(&self) -> Option<&Responder> {
        self.responder.as_ref()
    }

    /// Handles one raw inbound payload. Never fails: every outcome is reported.
    pub fn on_message<P: Publisher + ?Sized>(
        &self,
        raw: &[u8],
        ctx: &mut ReconcileContext<'_, P>,
    ) -> Reconciliation {
        match Message::decode(raw) {
            Ok(Message::Request(req)) => self.on_request(req, ctx),
            Ok(Message::Response(resp)) => self.on_response(resp, ctx),
            Ok(Message::Unknown(message_type)) => Reconciliation::UnknownType(message_type),
            Err(e) => Reconciliation::Malformed(e),
        }
    }

    fn on_request<P: Publisher + ?Sized>(
        &self,
        req: LatencyRequest,
        ctx: &mut ReconcileContext<'_, P>,
    ) -> Reconciliation {
        if ctx.table.contains(&req.message_id) {
            return Reconciliation::OwnRequest { id: req.message_id };
        }
        let Some(responder) = &self.responder else {
            return Reconciliation::RequestIgnored { id: req.message_id };
        };

        let arrival = ctx.clock.now_millis();
        let mut timestamps = req.timestamps;
        if !timestamps.contains(STAGE_SENT) {
            timestamps.set(STAGE_SENT, req.timestamp);
        }
        timestamps.set(&responder.stage, arrival);

        let response = LatencyResponse {
            original_message_id: req.message_id.clone(),
            timestamp: ctx.clock.now_millis(),
            timestamps,
            data: req.data,
            source_tag: Some(responder.source_tag.clone()),
        };
        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                return Reconciliation::AnswerFailed {
                    id: req.message_id.clone(),
                    error: TransportError::Publish {
                        topic: responder.topic.clone(),
                        reason: e.to_string(),
                    },
                }
            }
        };

        match ctx.publisher.publish(&responder.topic, &bytes, responder.qos) {
            Ok(()) => Reconciliation::Answered { id: req.message_id },
            Err(error) => Reconciliation::AnswerFailed {
                id: req.message_id,
                error,
            },
        }
    }

    fn on_response<P: Publisher + ?Sized>(
        &self,
        resp: LatencyResponse,
        ctx: &mut ReconcileContext<'_, P>,
    ) -> Reconciliation {
        let Some(send_time) = ctx.table.resolve(&resp.original_message_id) else {
            return Reconciliation::Unmatched {
                id: resp.original_message_id,
            };
        };

        let received = ctx.clock.now_millis();
        let mut stages = resp.timestamps;
        // The locally recorded send time is authoritative for T1.
        stages.set(STAGE_SENT, send_time);
        stages.set(STAGE_RECEIVED, received);

        let id = resp.original_message_id;
        let Some(sample) = LatencySample::from_stages(&id, stages, &self.schema, resp.source_tag)
        else {
            return Reconciliation::Malformed(MessageError::InvalidSchema {
                message_type: LATENCY_RESPONSE,
                reason: format!("round trip of {} cannot be computed", id),
            });
        };
        let total_rtt = sample.total_rtt;
        ctx.samples.push(sample);
        Reconciliation::Completed { id, total_rtt }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::{stages::StageTimestamps, time::ManualClock};

    #[derive(Default)]
    struct RecordingPublisher {
        sent: RefCell<Vec<(String, Vec<u8>)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, topic: &str, payload: &[u8], _qos: QoS) -> Result<(), TransportError> {
            self.sent
                .borrow_mut()
                .push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        table: CorrelationTable,
        samples: SampleLog,
        clock: ManualClock,
        publisher: RecordingPublisher,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                table: CorrelationTable::new(),
                samples: SampleLog::new(0),
                clock: ManualClock::new(0),
                publisher: RecordingPublisher::default(),
            }
        }

        fn handle(&mut self, reconciler: &Reconciler, raw: &[u8]) -> Reconciliation {
            let mut ctx = ReconcileContext {
                table: &mut self.table,
                samples: &mut self.samples,
                clock: &self.clock,
                publisher: &self.publisher,
            };
            reconciler.on_message(raw, &mut ctx)
        }
    }

    fn response(id: &str, stamps: StageTimestamps) -> Vec<u8> {
        LatencyResponse {
            original_message_id: id.to_string(),
            timestamp: 0,
            timestamps: stamps,
            data: json!({"1": 1}),
            source_tag: Some("server".to_string()),
        }
        .encode()
        .unwrap()
    }

    fn responder() -> Responder {
        Responder {
            stage: "T2".to_string(),
            source_tag: "peer-b".to_string(),
            topic: "latency".to_string(),
            qos: QoS::AtMostOnce,
        }
    }

    #[test]
    fn test_end_to_end_sample() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        fx.table.register("p1", 1000).unwrap();
        fx.clock.set(1030);

        let raw = response("p1", StageTimestamps::from([("T1", 1000), ("T2", 1010), ("T3", 1020)]));
        match fx.handle(&reconciler, &raw) {
            Reconciliation::Completed { id, total_rtt } => {
                assert_eq!(id, "p1");
                assert_eq!(total_rtt, 30);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let sample = &fx.samples.all()[0];
        assert_eq!(sample.stages.get("T4"), Some(1030));
        assert_eq!(sample.metric("MQTT_to_WebSocket"), Some(10));
        assert_eq!(sample.metric("Django_to_Frontend"), Some(10));
        assert_eq!(sample.metric("Frontend_to_MQTT"), Some(10));
        assert_eq!(sample.source_tag.as_deref(), Some("server"));
        assert!(fx.table.is_empty());
    }

    #[test]
    fn test_duplicate_response_is_noop() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        fx.table.register("p1", 0).unwrap();
        fx.clock.set(5);

        let raw = response("p1", StageTimestamps::new());
        assert!(matches!(
            fx.handle(&reconciler, &raw),
            Reconciliation::Completed { .. }
        ));
        assert!(matches!(
            fx.handle(&reconciler, &raw),
            Reconciliation::Unmatched { .. }
        ));
        assert_eq!(fx.samples.len(), 1);
    }

    #[test]
    fn test_unregistered_response_dropped() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        let raw = response("stranger", StageTimestamps::new());
        assert!(matches!(
            fx.handle(&reconciler, &raw),
            Reconciliation::Unmatched { id } if id == "stranger"
        ));
        assert!(fx.samples.is_empty());
    }

    #[test]
    fn test_local_send_time_overrides_carried_t1() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        fx.table.register("p1", 1000).unwrap();
        fx.clock.set(1050);

        let raw = response("p1", StageTimestamps::from([("T1", 900), ("T2", 1020)]));
        fx.handle(&reconciler, &raw);
        let sample = &fx.samples.all()[0];
        assert_eq!(sample.stages.get("T1"), Some(1000));
        assert_eq!(sample.total_rtt, 50);
    }

    #[test]
    fn test_clock_skew_produces_negative_hop() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        fx.table.register("p1", 1000).unwrap();
        fx.clock.set(1040);

        let raw = response("p1", StageTimestamps::from([("T2", 1060)]));
        fx.handle(&reconciler, &raw);
        let sample = &fx.samples.all()[0];
        assert_eq!(sample.metric("MQTT_to_WebSocket"), Some(60));
        assert_eq!(sample.metric("T2_to_T4"), Some(-20));
        assert_eq!(sample.total_rtt, 40);
    }

    #[test]
    fn test_extreme_stage_value_keeps_other_entries() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        fx.table.register("p1", 0).unwrap();
        fx.table.register("p2", 0).unwrap();
        fx.clock.set(25);

        let raw = br#"{"messageType":"latency_response","originalMessageId":"p1","timestamp":0,"timestamps":{"T2":-9223372036854775808}}"#;
        assert!(matches!(
            fx.handle(&reconciler, raw),
            Reconciliation::Completed { id, total_rtt: 25 } if id == "p1"
        ));

        let sample = &fx.samples.all()[0];
        assert_eq!(sample.metric("MQTT_to_WebSocket"), Some(i64::MIN));
        assert_eq!(sample.metric("T2_to_T4"), None);
        assert!(fx.table.contains("p2"));

        let raw = response("p2", StageTimestamps::from([("T2", 10)]));
        assert!(matches!(
            fx.handle(&reconciler, &raw),
            Reconciliation::Completed { id, .. } if id == "p2"
        ));
        assert_eq!(fx.samples.len(), 2);
    }

    #[test]
    fn test_sample_matches_stage_construction() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        fx.table.register("p1", 1000).unwrap();
        fx.clock.set(1042);

        let raw = response("p1", StageTimestamps::from([("T2", 1010), ("T2_5", 1013), ("T3", 1030)]));
        fx.handle(&reconciler, &raw);

        let expected = LatencySample::from_stages(
            "p1",
            StageTimestamps::from([("T1", 1000), ("T2", 1010), ("T2_5", 1013), ("T3", 1030), ("T4", 1042)]),
            &StageSchema::default(),
            Some("server".to_string()),
        )
        .unwrap();
        assert_eq!(fx.samples.all()[0], expected);
    }

    #[test]
    fn test_malformed_and_unknown() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        assert!(matches!(
            fx.handle(&reconciler, b"garbage"),
            Reconciliation::Malformed(_)
        ));
        assert!(matches!(
            fx.handle(&reconciler, br#"{"messageType":"ping"}"#),
            Reconciliation::UnknownType(Some(t)) if t == "ping"
        ));
    }

    #[test]
    fn test_responder_answers_foreign_request() {
        let reconciler = Reconciler::new(StageSchema::default(), Some(responder()));
        let mut fx = Fixture::new();
        fx.clock.set(1010);

        let req = LatencyRequest {
            message_id: "foreign".to_string(),
            timestamp: 1000,
            timestamps: StageTimestamps::sent_at(1000),
            data: json!({"k": "v"}),
        }
        .encode()
        .unwrap();

        assert!(matches!(
            fx.handle(&reconciler, &req),
            Reconciliation::Answered { id } if id == "foreign"
        ));

        let sent = fx.publisher.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "latency");
        match Message::decode(&sent[0].1).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.original_message_id, "foreign");
                assert_eq!(resp.timestamps.get("T1"), Some(1000));
                assert_eq!(resp.timestamps.get("T2"), Some(1010));
                assert_eq!(resp.data, json!({"k": "v"}));
                assert_eq!(resp.source_tag.as_deref(), Some("peer-b"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_own_request_not_answered() {
        let reconciler = Reconciler::new(StageSchema::default(), Some(responder()));
        let mut fx = Fixture::new();
        fx.table.register("mine", 0).unwrap();

        let req = LatencyRequest {
            message_id: "mine".to_string(),
            timestamp: 0,
            timestamps: StageTimestamps::sent_at(0),
            data: json!(null),
        }
        .encode()
        .unwrap();

        assert!(matches!(
            fx.handle(&reconciler, &req),
            Reconciliation::OwnRequest { .. }
        ));
        assert!(fx.publisher.sent.borrow().is_empty());
        // Registration is untouched
        assert!(fx.table.contains("mine"));
    }

    #[test]
    fn test_request_ignored_without_responder() {
        let reconciler = Reconciler::new(StageSchema::default(), None);
        let mut fx = Fixture::new();
        let req = LatencyRequest {
            message_id: "x".to_string(),
            timestamp: 0,
            timestamps: StageTimestamps::new(),
            data: json!(null),
        }
        .encode()
        .unwrap();
        assert!(matches!(
            fx.handle(&reconciler, &req),
            Reconciliation::RequestIgnored { .. }
        ));
        assert!(fx.publisher.sent.borrow().is_empty());
    }
}
