use log::{error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::Serialize;
use std::{fs::File, io::Read, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::{self, JoinHandle},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use super::models::InboundMessage;
use crate::shared::config::MqttConfig;
use crate::shared::errors::{AppError, AppResult};

#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
}

impl MqttClient {
    /// Connects and spawns the event loop. Inbound publishes are handed to
    /// the returned channel; a full channel holds the event loop back.
    pub fn new(
        config: &MqttConfig,
        cancel: CancellationToken,
    ) -> AppResult<(Self, mpsc::Receiver<InboundMessage>, JoinHandle<()>)> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive.into()));
        options.set_clean_session(false);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        if let (Some(ca_cert), Some(client_cert), Some(client_key)) =
            (&config.ca_cert, &config.client_cert, &config.client_key)
        {
            let tls_config = TlsConfiguration::Simple {
                ca: load_certificate(ca_cert)?,
                alpn: None,
                client_auth: Some((load_certificate(client_cert)?, load_certificate(client_key)?)),
            };
            options.set_transport(Transport::tls_with_config(tls_config));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 250);
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        let mqtt_client = MqttClient {
            client,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        };
        let resubscriber = mqtt_client.clone();

        let handle = task::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.clone(),
                        };
                        if tx.send(message).await.is_err() {
                            warn!("inbound channel closed, stopping mqtt event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connection established with broker.");
                        resubscriber.resubscribe().await;
                    }
                    Ok(_) => (),
                    Err(e) => {
                        error!("mqtt event loop error: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            if let Err(e) = resubscriber.client.try_disconnect() {
                warn!("mqtt disconnect failed: {}", e);
            }
            info!("mqtt event loop stopped");
        });

        Ok((mqtt_client, rx, handle))
    }

    pub async fn publish<T>(&self, topic: &str, payload: &T, qos: QoS) -> AppResult<()>
    where
        T: Serialize,
    {
        let payload_str =
            serde_json::to_string(payload).map_err(|e| AppError::from_json_err(e, "mqtt payload"))?;
        self.client
            .publish(topic, qos, false, payload_str)
            .await
            .map_err(|e| AppError::RetryableTransient(format!("publish to '{}': {}", topic, e)))?;
        log::debug!("published to '{}'", topic);
        Ok(())
    }

    /// Subscribes now and again after every reconnect.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> AppResult<()> {
        self.subscriptions.lock().await.push((topic.to_string(), qos));
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| AppError::RetryableTransient(format!("subscribe to '{}': {}", topic, e)))
    }

    async fn resubscribe(&self) {
        let topics = self.subscriptions.lock().await.clone();
        for (topic, qos) in topics {
            info!("Resubscribing to topic: {}", topic);
            if let Err(e) = self.client.subscribe(topic.clone(), qos).await {
                error!("Failed to subscribe to topic '{}': {}", topic, e);
            }
        }
    }
}

fn load_certificate(path: &str) -> AppResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| AppError::Configuration(format!("certificate {}: {}", path, e)))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|e| AppError::Configuration(format!("certificate {}: {}", path, e)))?;
    Ok(buffer)
}
