//! Run controller.
//!
//! Drives one [`Engine`] through `Idle -> Connecting -> Subscribing -> Running ->
//! Finalizing -> Terminated` on a single task. While running, a `tokio::select!`
//! loop multiplexes the emission timer, the reaper timer, inbound messages and
//! cancellation.

use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    configuration::{Configuration, ConfigurationError},
    engine::Engine,
    qos::QoS,
    sample::LatencySample,
    sink::ResultSink,
    stats::StatsReport,
    transport::{Transport, TransportError},
};

/// Delay between connect or subscribe attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Subscribing,
    Running,
    Finalizing,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::Subscribing => "subscribing",
            RunState::Running => "running",
            RunState::Finalizing => "finalizing",
            RunState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Outcome of a finished run.
#[derive(Debug)]
pub struct RunSummary {
    pub state: RunState,
    /// `true` if the run ended on cancellation rather than budget exhaustion.
    pub cancelled: bool,
    pub report: StatsReport,
    /// Every completed sample, warm-up included.
    pub samples: Vec<LatencySample>,
    /// Where the result sink stored the measured samples.
    pub output: Option<PathBuf>,
}

pub struct RunController<T: Transport> {
    engine: Engine,
    transport: T,
    sink: Option<Box<dyn ResultSink>>,
    cancel: CancellationToken,
    state: RunState,
    topic: String,
    qos: QoS,
    emit_interval: Duration,
    reap_interval: Duration,
    retry_delay: Duration,
}

impl<T: Transport> RunController<T> {
    /// Validates `conf` and builds a controller around a fresh engine.
    pub fn new(conf: &Configuration, transport: T) -> Result<Self, RunError> {
        conf.validate()?;
        let engine = Engine::new(conf)?;
        Self::with_engine(conf, engine, transport)
    }

    /// Builds a controller around an existing engine. `conf` supplies the topic and
    /// timer settings and is validated here as well.
    pub fn with_engine(
        conf: &Configuration,
        engine: Engine,
        transport: T,
    ) -> Result<Self, RunError> {
        conf.validate()?;
        Ok(RunController {
            engine,
            transport,
            sink: None,
            cancel: CancellationToken::new(),
            state: RunState::Idle,
            topic: conf.topic.clone(),
            qos: conf.qos,
            emit_interval: Duration::from_millis(conf.interval_ms),
            reap_interval: Duration::from_millis(conf.reap_interval_ms),
            retry_delay: RETRY_DELAY,
        })
    }

    /// Persists the measured samples to `sink` when the run finalizes.
    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Uses `token` to stop the run instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Token that finalizes the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs to completion: until the budget is exhausted or the token is cancelled.
    pub async fn run(mut self) -> RunSummary {
        self.transition(RunState::Connecting);
        let Some(publisher) = self.connect().await else {
            return self.finalize(true).await;
        };

        self.transition(RunState::Subscribing);
        if !self.subscribe().await {
            return self.finalize(true).await;
        }

        self.transition(RunState::Running);
        let cancelled = self.event_loop(&publisher).await;
        self.finalize(cancelled).await
    }

    fn transition(&mut self, next: RunState) {
        log::info!("Run state {} -> {}", self.state, next);
        self.state = next;
    }

    async fn connect(&mut self) -> Option<T::Publisher> {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.transport.connect() => match result {
                    Ok(publisher) => return Some(publisher),
                    Err(e) => log::error!("{}, retrying in {:?}", e, self.retry_delay),
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = time::sleep(self.retry_delay) => {}
            }
        }
    }

    async fn subscribe(&mut self) -> bool {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.transport.subscribe(&self.topic, self.qos) => match result {
                    Ok(()) => {
                        log::info!("Subscribed to {} with QoS {}", self.topic, self.qos);
                        return true;
                    }
                    Err(e) => log::error!("{}, retrying in {:?}", e, self.retry_delay),
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = time::sleep(self.retry_delay) => {}
            }
        }
    }

    /// Returns `true` if the loop ended on cancellation.
    async fn event_loop(&mut self, publisher: &T::Publisher) -> bool {
        let cancel = self.cancel.clone();

        let mut emit_timer = time::interval(self.emit_interval);
        emit_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reap_timer = time::interval_at(Instant::now() + self.reap_interval, self.reap_interval);
        reap_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut emitting = self.engine.wants_to_emit();
        let mut inbound_open = true;

        loop {
            if self.engine.is_budget_exhausted() {
                log::info!("All {} probes settled", self.engine.probes_sent());
                return false;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Run cancelled");
                    return true;
                }

                _ = emit_timer.tick(), if emitting => {
                    // Failures are logged and counted by the engine
                    let _ = self.engine.emit(publisher);
                    emitting = self.engine.wants_to_emit();
                    if !emitting {
                        log::info!(
                            "Message budget reached, waiting for {} probes in flight",
                            self.engine.in_flight()
                        );
                    }
                }

                _ = reap_timer.tick() => {
                    self.engine.reap();
                }

                result = self.transport.recv(), if inbound_open => match result {
                    Ok(msg) => {
                        self.engine.on_message(&msg.payload, publisher);
                    }
                    Err(TransportError::Closed) => {
                        log::error!("Inbound stream closed, remaining probes will time out");
                        inbound_open = false;
                    }
                    Err(e) => log::warn!("{}", e),
                },
            }
        }
    }

    async fn finalize(mut self, cancelled: bool) -> RunSummary {
        self.transition(RunState::Finalizing);
        self.engine.discard_in_flight();

        let report = self.engine.report();
        let role = self.engine.role();
        let output = match &self.sink {
            Some(sink) if role.emits() => {
                match sink.persist(self.engine.measured_samples(), &role.to_string()) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        log::error!("{}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        if let Err(e) = self.transport.disconnect().await {
            log::warn!("Disconnect failed: {}", e);
        }
        self.transition(RunState::Terminated);

        RunSummary {
            state: self.state,
            cancelled,
            report,
            samples: self.engine.into_samples(),
            output,
        }
    }
}
