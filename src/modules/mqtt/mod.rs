//! Broker bridge: device readings in, commands out, command responses in.

mod handlers;
pub mod models;
mod mqtt_client;

pub use handlers::{commands, readings};
pub use mqtt_client::MqttClient;

use rumqttc::QoS;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use self::models::{InboundMessage, Topic};
use crate::{
    engine::TelemetryEngine,
    shared::{config::MqttConfig, errors::AppResult},
};

pub async fn start_mqtt(
    engine: Arc<TelemetryEngine>,
    config: MqttConfig,
    cancel: CancellationToken,
) -> AppResult<Vec<JoinHandle<()>>> {
    let (client, inbound, event_loop) = MqttClient::new(&config, cancel.clone())?;
    let prefix = config.topic_prefix.clone();

    client
        .subscribe(&Topic::readings_filter(&prefix), QoS::AtLeastOnce)
        .await?;
    client
        .subscribe(&Topic::responses_filter(&prefix), QoS::AtLeastOnce)
        .await?;
    log::info!("Mqtt started on {}:{}, prefix '{}'", config.broker, config.port, prefix);

    let dispatch_every = Duration::from_secs(engine.configs().lifecycle.command_dispatch_secs.max(1));
    let receiver = tokio::spawn(receive(Arc::clone(&engine), inbound, prefix.clone()));
    let dispatcher = tokio::spawn(dispatch(engine, client, prefix, dispatch_every, cancel));
    Ok(vec![event_loop, receiver, dispatcher])
}

/// Drains the inbound channel until the event loop drops its sender.
async fn receive(engine: Arc<TelemetryEngine>, mut inbound: mpsc::Receiver<InboundMessage>, prefix: String) {
    while let Some(message) = inbound.recv().await {
        match Topic::parse(&prefix, &message.topic) {
            Some(Topic::Readings { organization_id }) => {
                if let Err(e) = readings::handler(&engine, &organization_id, &message.payload).await {
                    log::warn!("readings from '{}' rejected: {}", message.topic, e);
                }
            }
            Some(Topic::CommandResponse {
                organization_id,
                command_id,
            }) => {
                if let Err(e) =
                    commands::handle_response(&engine, &organization_id, command_id, &message.payload).await
                {
                    log::warn!("response on '{}' ignored: {}", message.topic, e);
                }
            }
            None => log::debug!("no handler for topic '{}'", message.topic),
        }
    }
    log::info!("mqtt receiver stopped");
}

async fn dispatch(
    engine: Arc<TelemetryEngine>,
    client: MqttClient,
    prefix: String,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sent = commands::dispatch_pending(&engine, &client, &prefix).await;
        if sent > 0 {
            log::info!("dispatched {} command(s)", sent);
        }
    }
    log::info!("command dispatcher stopped");
}
