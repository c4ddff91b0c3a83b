use std::{net::SocketAddr, process::ExitCode};

use pubsub_latency::{
    configuration::{Configuration, Parser, Role, TransportKind},
    controller::{RunController, RunSummary},
    sink::CsvSink,
    transport::{MemoryBroker, Transport, UdpTransport},
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Configuration is broken: {}", e);
        return ExitCode::FAILURE;
    }
    log::info!("Configuration valid. Starting up as {}...", conf.role);

    #[cfg(feature = "metrics")]
    let metrics_server = if conf.metrics {
        match pubsub_latency::metrics::init(conf.metrics_addr).await {
            Ok(server) => Some(server),
            Err(e) => {
                eprintln!("Cannot start metrics server: {}", e);
                None
            }
        }
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, finalizing run");
        }
        ctrl_c_cancel.cancel();
    });

    let summary = match conf.transport {
        TransportKind::Udp => {
            let local: SocketAddr = (conf.local_addr, conf.local_port).into();
            let remote: SocketAddr = (conf.broker, conf.port).into();
            if conf.username.is_some() {
                log::warn!("UDP transport does not authenticate, ignoring credentials");
            }
            run(&conf, UdpTransport::new(local, remote), cancel).await
        }
        TransportKind::Loopback => {
            let broker = MemoryBroker::new();
            let responder_cancel = cancel.child_token();
            let responder = if conf.role.emits() {
                Some(spawn_loopback_responder(&conf, &broker, responder_cancel.clone()))
            } else {
                None
            };

            let summary = run(&conf, broker.transport(), cancel).await;
            responder_cancel.cancel();
            if let Some(handle) = responder {
                handle.await.ok();
            }
            summary
        }
    };

    #[cfg(feature = "metrics")]
    if let Some(server) = metrics_server {
        server.shutdown();
    }

    match summary {
        Some(summary) => {
            summary.report.print(conf.output_format);
            ExitCode::SUCCESS
        }
        None => ExitCode::FAILURE,
    }
}

async fn run<T: Transport>(
    conf: &Configuration,
    transport: T,
    cancel: CancellationToken,
) -> Option<RunSummary> {
    match RunController::new(conf, transport) {
        Ok(controller) => Some(
            controller
                .with_sink(Box::new(CsvSink::new(&conf.output_dir)))
                .with_cancellation(cancel)
                .run()
                .await,
        ),
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    }
}

/// Starts an in-process responder on `broker` that answers until `cancel` fires.
fn spawn_loopback_responder(
    conf: &Configuration,
    broker: &MemoryBroker,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut responder_conf = conf.clone();
    responder_conf.role = Role::Responder;
    responder_conf.source_tag = format!("{}-loopback", conf.source_tag);
    let transport = broker.transport();

    tokio::spawn(async move {
        match RunController::new(&responder_conf, transport) {
            Ok(controller) => {
                let summary = controller.with_cancellation(cancel).run().await;
                log::debug!(
                    "Loopback responder answered {} probes",
                    summary.report.responses_sent
                );
            }
            Err(e) => log::error!("Cannot start loopback responder: {}", e),
        }
    })
}
