use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeFilter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::fleet::router::ResponseRouter;
use crate::fleet::transport::Transport;

/// A message that arrived on one of the operator command topics.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub topic: String,
    pub payload: String,
}

/// Outbound handle. Cloneable and usable from any task; never awaits the broker.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())?;
        Ok(())
    }
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));
        // Images from the cameras are well above the 10 KiB default.
        mqttopts.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        mqttopts.set_last_will(rumqttc::LastWill::new(
            config.status_topic(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config: config.clone(),
        }
    }

    pub fn transport(&self) -> MqttTransport {
        MqttTransport {
            client: self.client.clone(),
        }
    }

    /// Drive the connection. Response topics go straight to `router`; command
    /// topics are forwarded to `control_tx`. Resubscribes on every ConnAck.
    pub async fn run(
        mut self,
        router: Arc<ResponseRouter>,
        control_tx: mpsc::Sender<ControlMessage>,
        shutdown: CancellationToken,
    ) {
        let command_filter = self.config.command_filter();
        let command_prefix = command_filter.trim_end_matches('#').to_string();
        let filters: Vec<SubscribeFilter> = router
            .topics()
            .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtMostOnce))
            .chain(std::iter::once(SubscribeFilter::new(
                command_filter.clone(),
                QoS::AtLeastOnce,
            )))
            .collect();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            if let Err(e) = self.client.try_publish(
                                self.config.status_topic(),
                                QoS::AtLeastOnce,
                                true,
                                "online",
                            ) {
                                error!("Failed to publish online status: {}", e);
                            }
                            if let Err(e) = self.client.try_subscribe_many(filters.clone()) {
                                error!("Failed to subscribe: {}", e);
                            } else {
                                info!("Subscribed to {} topics", filters.len());
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            if publish.topic.starts_with(&command_prefix) {
                                let msg = ControlMessage {
                                    topic: publish.topic.clone(),
                                    payload: String::from_utf8_lossy(&publish.payload).to_string(),
                                };
                                if let Err(e) = control_tx.try_send(msg) {
                                    warn!("Dropping command on {}: {}", publish.topic, e);
                                }
                            } else if !router.on_message(&publish.topic, &publish.payload) {
                                debug!("Ignoring message on {}", publish.topic);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                                _ = shutdown.cancelled() => break,
                            }
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        self.disconnect().await;
    }

    /// Mark ourselves offline and let the event loop flush the disconnect.
    async fn disconnect(&mut self) {
        let _ = self.client.try_publish(self.config.status_topic(), QoS::AtLeastOnce, true, "offline");
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            warn!("Timed out flushing MQTT disconnect");
        }
        info!("Disconnected from MQTT broker");
    }
}
