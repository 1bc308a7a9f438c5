use rumqttc::QoS;

use crate::{
    engine::TelemetryEngine,
    modules::mqtt::{
        models::{CommandDispatch, CommandResponse, Topic},
        mqtt_client::MqttClient,
    },
    shared::{
        context::CallerContext,
        db::models::{Command, CommandId},
        errors::{AppError, AppResult},
    },
};

/// Marks every pending command executing and publishes it. Failed commands
/// with retries left go back to pending first. Returns how many were sent.
pub async fn dispatch_pending(engine: &TelemetryEngine, client: &MqttClient, prefix: &str) -> usize {
    let (mut pending, retryable) = engine.commands().dispatchable().await;

    for failed in retryable {
        let ctx = CallerContext::device(failed.organization_id.as_str());
        match engine.commands().retry(&ctx, failed.id).await {
            Ok(command) => pending.push(command),
            Err(e) => log::warn!("command {} not retried: {}", failed.id, e),
        }
    }

    let mut sent = 0;
    for command in pending {
        match dispatch(engine, client, prefix, &command).await {
            Ok(()) => sent += 1,
            Err(e) => log::error!("command {} dispatch failed: {}", command.id, e),
        }
    }
    sent
}

async fn dispatch(engine: &TelemetryEngine, client: &MqttClient, prefix: &str, command: &Command) -> AppResult<()> {
    let topic = Topic::command(prefix, &command.organization_id, command.sensor_id);
    let executing = begin(engine, command).await?;
    let published = client
        .publish(&topic, &CommandDispatch::from(&executing), QoS::AtLeastOnce)
        .await;
    settle(engine, &executing, published).await?;
    log::info!("command {} sent to '{}'", command.id, topic);
    Ok(())
}

/// Pending -> Executing, before anything goes on the wire, so a device that
/// answers at once finds the command executing.
async fn begin(engine: &TelemetryEngine, command: &Command) -> AppResult<Command> {
    let ctx = CallerContext::device(command.organization_id.as_str());
    engine.commands().execute(&ctx, command.id).await
}

/// A publish that did not go out fails the command. With retries left the
/// next dispatch tick picks it up again.
async fn settle(engine: &TelemetryEngine, command: &Command, published: AppResult<()>) -> AppResult<()> {
    let err = match published {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    let ctx = CallerContext::device(command.organization_id.as_str());
    if let Err(e) = engine
        .commands()
        .fail(&ctx, command.id, format!("publish failed: {}", err))
        .await
    {
        log::error!("command {} left executing after a failed publish: {}", command.id, e);
    }
    Err(err)
}

/// Completes or fails an executing command from the device's answer.
pub async fn handle_response(
    engine: &TelemetryEngine,
    organization_id: &str,
    command_id: CommandId,
    payload: &[u8],
) -> AppResult<Command> {
    let parsed: CommandResponse =
        serde_json::from_slice(payload).map_err(|e| AppError::from_json_err(e, "command response"))?;
    let ctx = CallerContext::device(organization_id);
    if parsed.success {
        engine.commands().complete(&ctx, command_id, parsed.response).await
    } else {
        let reason = parsed.error.unwrap_or_else(|| "device reported failure".to_string());
        engine.commands().fail(&ctx, command_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::Configs;
    use crate::shared::context::Role;
    use crate::shared::db::models::{
        CommandStatus, NewAsset, NewCommand, NewSensor, Protocol, SensorType, SubscriptionPlan,
    };
    use crate::shared::errors::ErrorType;

    async fn pending_command(max_retries: u32) -> (TelemetryEngine, CallerContext, Command) {
        let engine = TelemetryEngine::open(Configs::default()).await.unwrap();
        let org = engine
            .registry()
            .create_organization("acme", "u1", SubscriptionPlan::Free, 1)
            .await
            .unwrap();
        let ctx = CallerContext::new("u1", org.id, Role::Admin);
        let asset = engine
            .registry()
            .create_asset(
                &ctx,
                NewAsset {
                    name: "pump".to_string(),
                    type_: "pump".to_string(),
                    location: "basement".to_string(),
                    organization_id: None,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        let sensor = engine
            .registry()
            .create_sensor(
                &ctx,
                NewSensor {
                    asset_id: asset.id,
                    name: "valve".to_string(),
                    type_: SensorType::Flow,
                    unit: "l/min".to_string(),
                    threshold_low: None,
                    threshold_high: None,
                    min_value: None,
                    max_value: None,
                    sampling_interval_ms: 500,
                    protocol: Protocol::Mqtt,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        let command = engine
            .create_command(
                &ctx,
                NewCommand {
                    sensor_id: sensor.id,
                    command_type: "open_valve".to_string(),
                    payload: None,
                    max_retries,
                    metadata: Default::default(),
                },
            )
            .await
            .unwrap();
        (engine, ctx, command)
    }

    #[tokio::test]
    async fn response_right_after_begin_completes_the_command() {
        let (engine, ctx, command) = pending_command(1).await;
        let executing = begin(&engine, &command).await.unwrap();
        assert_eq!(executing.status, CommandStatus::Executing);

        let done = handle_response(&engine, &ctx.organization_id, command.id, br#"{"success": true}"#)
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
        settle(&engine, &executing, Ok(())).await.unwrap();
        assert_eq!(
            engine.commands().get(&ctx, command.id).await.unwrap().status,
            CommandStatus::Completed
        );
    }

    #[tokio::test]
    async fn failed_publish_fails_the_command_for_retry() {
        let (engine, ctx, command) = pending_command(2).await;
        let executing = begin(&engine, &command).await.unwrap();

        let err = settle(
            &engine,
            &executing,
            Err(AppError::RetryableTransient("broker unreachable".into())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorType::RetryableTransient);

        let failed = engine.commands().get(&ctx, command.id).await.unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert!(failed.error_message.unwrap().contains("broker unreachable"));
        let (pending, retryable) = engine.commands().dispatchable().await;
        assert!(pending.is_empty());
        assert_eq!(retryable.iter().map(|c| c.id).collect::<Vec<_>>(), vec![command.id]);
    }

    #[tokio::test]
    async fn a_command_is_only_begun_once() {
        let (engine, _, command) = pending_command(0).await;
        begin(&engine, &command).await.unwrap();
        let err = begin(&engine, &command).await.unwrap_err();
        assert_eq!(err.kind(), ErrorType::InvalidTransition);
    }
}
