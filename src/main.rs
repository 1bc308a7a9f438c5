use std::sync::Arc;

use iot_telemetry::{
    logger,
    modules::{lifecycle::PolicyScheduler, mqtt},
    shared::{config::Configs, errors::AppResult},
    TelemetryEngine,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> AppResult<()> {
    let configs = Configs::from_env()?;
    logger::start_log(&configs.logging.level);

    let engine = Arc::new(TelemetryEngine::open(configs.clone()).await?);
    log::info!("Telemetry engine ready: {:?}", engine.capabilities());

    let cancel = CancellationToken::new();
    let mut workers = PolicyScheduler::new(Arc::clone(&engine), cancel.clone()).spawn();

    match configs.mqtt {
        Some(mqtt_config) => match mqtt::start_mqtt(Arc::clone(&engine), mqtt_config, cancel.clone()).await {
            Ok(handles) => workers.extend(handles),
            Err(e) => {
                log::error!("Failed to start mqtt: {}", e);
                cancel.cancel();
                futures::future::join_all(workers).await;
                return Err(e);
            }
        },
        None => log::warn!("No [mqtt] section configured, broker ingestion disabled"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    log::info!("Shutting down...");
    cancel.cancel();
    futures::future::join_all(workers).await;
    log::info!("Stopped");
    Ok(())
}
