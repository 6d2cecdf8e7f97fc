mod config;
mod control;
mod error;
mod fleet;
mod mqtt;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control::Controller;
use crate::fleet::DeviceClass;
use crate::fleet::actuator::ActuatorPanel;
use crate::fleet::correlator::Correlator;
use crate::fleet::orchestrator::Orchestrator;
use crate::fleet::poller::{PollFlags, spawn_pollers};
use crate::fleet::registry::Registry;
use crate::fleet::router::ResponseRouter;
use crate::fleet::store::StateStore;
use crate::fleet::transport::Transport;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let registry = match Registry::new(config.devices.clone()) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("Invalid device list: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting fleet monitor (mqtt={}:{}, devices={}, cameras={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        registry.devices().len(),
        registry.all(DeviceClass::Camera).count(),
    );
    for device in registry.devices() {
        info!(
            "  Device: {} ({:?}) - {} capabilities",
            device.id,
            device.class,
            device.capabilities.len(),
        );
    }

    let shutdown = CancellationToken::new();
    let store = Arc::new(StateStore::new());
    let router = Arc::new(ResponseRouter::new(&registry, store.clone()));

    let (control_tx, mut control_rx) = mpsc::channel::<mqtt::client::ControlMessage>(100);

    // MQTT event loop: inbound responses and operator commands
    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let transport: Arc<dyn Transport> = Arc::new(mqtt_client.transport());
    let mqtt_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            mqtt_client.run(router, control_tx, shutdown).await;
        }
    });

    let correlator = Correlator::new(
        registry.clone(),
        store,
        transport.clone(),
        shutdown.clone(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        correlator.clone(),
        config.timing.refresh,
    ));
    info!("Worst-case refresh time: {:?}", orchestrator.worst_case());

    let flags = Arc::new(PollFlags::default());
    let poller_handles = spawn_pollers(
        registry.clone(),
        transport.clone(),
        flags.clone(),
        config.timing.poll,
        shutdown.clone(),
    );

    let controller = Arc::new(Controller::new(
        config.mqtt.topic_prefix.clone(),
        config.timing.read_timeout,
        config.timing.refresh.windows,
        correlator,
        orchestrator,
        flags,
        Arc::new(ActuatorPanel::new(registry, transport)),
    ));

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::process::exit(1);
        }
    };

    // Main loop: each command runs on its own task so a slow read never holds up the next
    loop {
        tokio::select! {
            Some(msg) = control_rx.recv() => {
                match control::parse_command(&msg.topic, &msg.payload, controller.prefix()) {
                    Some(command) => {
                        let controller = controller.clone();
                        tokio::spawn(async move {
                            if let Err(e) = controller.handle(command).await {
                                warn!("Command on {} failed: {}", msg.topic, e);
                            }
                        });
                    }
                    None => warn!("Unrecognised command: {} = {:?}", msg.topic, msg.payload),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    shutdown.cancel();
    for handle in poller_handles {
        let _ = handle.await;
    }
    let _ = mqtt_handle.await;
    info!("fleet monitor stopped");
}
