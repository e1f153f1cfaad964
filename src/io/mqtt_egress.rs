//! MQTT publisher for spot status changes
//!
//! Optional bus subscriber that forwards every status change to a single
//! topic as `{"spot_id":N,"status":"…","ts":…}` at QoS 1.

use crate::domain::types::StatusChangeEvent;
use crate::infra::config::Config;
use crate::services::event_bus::{EventBus, Subscription};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct MqttPublisher {
    client: AsyncClient,
    sub: Subscription,
    bus: EventBus,
    topic: String,
}

impl MqttPublisher {
    /// Create the publisher and start its event loop.
    ///
    /// Must be called from within the tokio runtime.
    pub fn new(config: &Config, bus: EventBus) -> Self {
        let client_id = format!("cloudpark-{}-{}", config.site_id(), std::process::id());
        let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (config.mqtt_username(), config.mqtt_password()) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        tokio::spawn(drive_eventloop(eventloop));

        let sub = bus.subscribe("mqtt_egress");
        Self { client, sub, bus, topic: config.mqtt_topic().to_string() }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topic, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Some(event) = self.sub.try_recv() {
                            self.publish(&event).await;
                        }
                        return;
                    }
                }
                event = self.sub.recv() => match event {
                    Some(event) => self.publish(&event).await,
                    None => {
                        // Lagged behind a slow broker; later changes still flow
                        warn!("mqtt_egress_subscriber_dropped_resubscribing");
                        self.sub = self.bus.subscribe("mqtt_egress");
                    }
                },
            }
        }
    }

    async fn publish(&self, event: &StatusChangeEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(spot_id = %event.spot_id, error = %e, "mqtt_egress_encode_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(&self.topic, QoS::AtLeastOnce, false, payload).await {
            error!(spot_id = %event.spot_id, error = %e, "mqtt_egress_publish_failed");
        }
    }
}

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Poll the connection forever; rumqttc reconnects on the next poll after an error
async fn drive_eventloop(mut eventloop: EventLoop) {
    let mut delay = Duration::from_secs(1);
    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt_egress_connected");
                connected = true;
                delay = Duration::from_secs(1);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => debug!(pkid = ack.pkid, "mqtt_egress_acked"),
            Ok(_) => {}
            Err(e) => {
                if connected {
                    warn!(error = %e, "mqtt_egress_disconnected");
                    connected = false;
                } else {
                    debug!(error = %e, retry_ms = delay.as_millis() as u64, "mqtt_egress_connect_failed");
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }
}
