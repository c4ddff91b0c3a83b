//! The measurement engine.
//!
//! One [`Engine`] owns everything a run mutates: the correlation table, the sample
//! log, the emitter budget and the counters. Its methods are synchronous and are
//! meant to be driven from a single task, which makes "resolve, then delete" in the
//! reconciler atomic without any locking.

use serde_json::Value;

use crate::{
    configuration::{Configuration, ConfigurationError, Role},
    correlation::CorrelationTable,
    emitter::{EmitError, ProbeEmitter},
    reaper::{LostProbe, Reaper},
    reconciler::{ReconcileContext, Reconciler, Reconciliation, Responder},
    sample::{LatencySample, SampleLog},
    session::{IdSource, RandomIdSource},
    stages::StageSchema,
    stats::{self, Statistics, StatsReport},
    time::{Clock, SystemClock},
    transport::Publisher,
};

/// Diagnostic counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub publish_failures: u64,
    pub malformed_messages: u64,
    pub unknown_messages: u64,
    pub unmatched_responses: u64,
    pub responses_sent: u64,
    pub discarded_in_flight: usize,
}

pub struct Engine {
    role: Role,
    payload: Value,
    table: CorrelationTable,
    samples: SampleLog,
    emitter: ProbeEmitter,
    reconciler: Reconciler,
    reaper: Reaper,
    clock: Box<dyn Clock + Send>,
    ids: Box<dyn IdSource + Send>,
    counters: EngineCounters,
    #[cfg(feature = "metrics")]
    metrics_enabled: bool,
}

impl Engine {
    /// Creates an engine using the system clock and random probe ids.
    pub fn new(conf: &Configuration) -> Result<Engine, ConfigurationError> {
        Self::with_sources(conf, Box::new(SystemClock), Box::new(RandomIdSource))
    }

    /// Creates an engine with explicit clock and id sources.
    pub fn with_sources(
        conf: &Configuration,
        clock: Box<dyn Clock + Send>,
        ids: Box<dyn IdSource + Send>,
    ) -> Result<Engine, ConfigurationError> {
        let responder = conf.role.responds().then(|| Responder {
            stage: conf.responder_stage.clone(),
            source_tag: conf.source_tag.clone(),
            topic: conf.topic.clone(),
            qos: conf.qos,
        });
        let budget = if conf.role.emits() { conf.count } else { 0 };

        Ok(Engine {
            role: conf.role,
            payload: conf.payload_value()?,
            table: CorrelationTable::new(),
            samples: SampleLog::new(conf.warmup as usize),
            emitter: ProbeEmitter::new(&conf.topic, conf.qos, budget),
            reconciler: Reconciler::new(StageSchema::default(), responder),
            reaper: Reaper::new(i64::try_from(conf.timeout_ms).unwrap_or(i64::MAX)),
            clock,
            ids,
            counters: EngineCounters::default(),
            #[cfg(feature = "metrics")]
            metrics_enabled: conf.metrics,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Emits one probe with the configured payload.
    pub fn emit<P: Publisher + ?Sized>(&mut self, publisher: &P) -> Result<String, EmitError> {
        let result = self.emitter.emit(
            &self.payload,
            &mut self.table,
            self.clock.as_ref(),
            self.ids.as_ref(),
            publisher,
        );

        match &result {
            Err(EmitError::PublishFailed { id, source }) => {
                self.counters.publish_failures += 1;
                log::error!("Probe {} publish failed: {}", id, source);
            }
            Ok(_) | Err(EmitError::BudgetExhausted(_)) => {}
            Err(e) => log::error!("Cannot emit probe: {}", e),
        }

        #[cfg(feature = "metrics")]
        if self.metrics_enabled {
            let failed = matches!(result, Err(EmitError::PublishFailed { .. }));
            if result.is_ok() || failed {
                crate::metrics::probe_metrics::record_probe_sent();
            }
            if failed {
                crate::metrics::probe_metrics::record_publish_failure();
            }
        }
        result
    }

    /// Handles one inbound payload.
    pub fn on_message<P: Publisher + ?Sized>(
        &mut self,
        raw: &[u8],
        publisher: &P,
    ) -> Reconciliation {
        let mut ctx = ReconcileContext {
            table: &mut self.table,
            samples: &mut self.samples,
            clock: self.clock.as_ref(),
            publisher,
        };
        let outcome = self.reconciler.on_message(raw, &mut ctx);

        match &outcome {
            Reconciliation::Completed { id, total_rtt } => {
                #[cfg(feature = "metrics")]
                if self.metrics_enabled {
                    crate::metrics::probe_metrics::record_probe_completed();
                    crate::metrics::probe_metrics::record_rtt(*total_rtt as f64 / 1000.0);
                }
                log::info!("Probe {} completed, RTT {} ms", id, total_rtt);
            }
            Reconciliation::Unmatched { id } => {
                self.counters.unmatched_responses += 1;
                log::debug!("Dropping response for probe {} not outstanding", id);
            }
            Reconciliation::Answered { id } => {
                self.counters.responses_sent += 1;
                log::debug!("Answered probe {}", id);
            }
            Reconciliation::AnswerFailed { id, error } => {
                #[cfg(feature = "metrics")]
                if self.metrics_enabled {
                    crate::metrics::probe_metrics::record_publish_failure();
                }
                self.counters.publish_failures += 1;
                log::error!("Cannot answer probe {}: {}", id, error);
            }
            Reconciliation::OwnRequest { id } => {
                log::trace!("Ignoring own request {}", id);
            }
            Reconciliation::RequestIgnored { id } => {
                log::trace!("Ignoring request {} (not responding)", id);
            }
            Reconciliation::UnknownType(message_type) => {
                self.counters.unknown_messages += 1;
                log::info!(
                    "Received message of unknown type {}",
                    message_type.as_deref().unwrap_or("<none>")
                );
            }
            Reconciliation::Malformed(e) => {
                #[cfg(feature = "metrics")]
                if self.metrics_enabled {
                    crate::metrics::probe_metrics::record_malformed_message();
                }
                self.counters.malformed_messages += 1;
                log::warn!("{}", e);
            }
        }
        outcome
    }

    /// Evicts probes that outlived the timeout.
    pub fn reap(&mut self) -> Vec<LostProbe> {
        let now = self.clock.now_millis();
        let lost = self.reaper.sweep(&mut self.table, now);
        #[cfg(feature = "metrics")]
        if self.metrics_enabled {
            for _ in &lost {
                crate::metrics::probe_metrics::record_probe_lost();
            }
            crate::metrics::probe_metrics::set_in_flight(self.table.len());
        }
        lost
    }

    /// `true` once the whole budget was emitted and every probe reached a
    /// terminal state. Never true for a pure responder.
    pub fn is_budget_exhausted(&self) -> bool {
        self.role.emits() && self.emitter.is_exhausted() && self.table.is_empty()
    }

    /// `true` while the emitter still has budget left.
    pub fn wants_to_emit(&self) -> bool {
        self.role.emits() && !self.emitter.is_exhausted()
    }

    /// Drops every in-flight probe without producing samples.
    pub fn discard_in_flight(&mut self) -> usize {
        let discarded = self.table.clear();
        if discarded > 0 {
            log::info!("Discarding {} probes still in flight", discarded);
        }
        self.counters.discarded_in_flight += discarded;
        discarded
    }

    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Every sample, warm-up included.
    pub fn samples(&self) -> &[LatencySample] {
        self.samples.all()
    }

    /// Samples after the warm-up window.
    pub fn measured_samples(&self) -> &[LatencySample] {
        self.samples.measured()
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    pub fn probes_sent(&self) -> u32 {
        self.emitter.emitted()
    }

    pub fn probes_lost(&self) -> u64 {
        self.reaper.lost()
    }

    /// Statistics over the measured samples for every schema metric.
    pub fn statistics(&self) -> Statistics {
        stats::compute(
            self.samples.measured(),
            &self.reconciler.schema().metric_names(),
        )
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            role: self.role.to_string(),
            probes_sent: self.emitter.emitted(),
            probes_completed: self.samples.len(),
            probes_lost: self.reaper.lost(),
            probes_discarded: self.counters.discarded_in_flight,
            warmup_excluded: self.samples.len() - self.samples.measured().len(),
            malformed_messages: self.counters.malformed_messages,
            unknown_messages: self.counters.unknown_messages,
            responses_sent: self.counters.responses_sent,
            metrics: self.statistics(),
        }
    }

    pub fn into_samples(self) -> Vec<LatencySample> {
        self.samples.into_samples()
    }
}
