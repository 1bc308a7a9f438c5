pub mod commands;
pub mod readings;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TelemetryEngine;
    use crate::shared::config::Configs;
    use crate::shared::context::{CallerContext, Role};
    use crate::shared::db::models::{
        CommandStatus, NewAsset, NewCommand, NewSensor, Protocol, Sensor, SensorType, SubscriptionPlan,
    };
    use crate::shared::errors::ErrorType;

    async fn fixture() -> (TelemetryEngine, CallerContext, Sensor) {
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
                    name: "flow".to_string(),
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
        (engine, ctx, sensor)
    }

    #[tokio::test]
    async fn device_payload_is_ingested_under_topic_organization() {
        let (engine, ctx, sensor) = fixture().await;
        let payload = format!(r#"{{"readings": [{{"sensor_id": {}, "value": 3.5}}]}}"#, sensor.id);
        let receipt = readings::handler(&engine, &ctx.organization_id, payload.as_bytes())
            .await
            .unwrap();
        assert_eq!(receipt.accepted, 1);

        let spoofed = format!(r#"{{"sensor_id": {}, "value": 1.0, "organization_id": "other"}}"#, sensor.id);
        let err = readings::handler(&engine, &ctx.organization_id, spoofed.as_bytes())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorType::TenantMismatch);

        let err = readings::handler(&engine, &ctx.organization_id, b"not json")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorType::Internal);
    }

    #[tokio::test]
    async fn responses_finish_executing_commands() {
        let (engine, ctx, sensor) = fixture().await;
        let new = |kind: &str| NewCommand {
            sensor_id: sensor.id,
            command_type: kind.to_string(),
            payload: None,
            max_retries: 1,
            metadata: Default::default(),
        };
        let ok = engine.create_command(&ctx, new("open_valve")).await.unwrap();
        let bad = engine.create_command(&ctx, new("close_valve")).await.unwrap();
        for id in [ok.id, bad.id] {
            engine.commands().execute(&ctx, id).await.unwrap();
        }

        let done = commands::handle_response(&engine, &ctx.organization_id, ok.id, br#"{"success": true, "response": "open"}"#)
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
        assert_eq!(done.response.as_deref(), Some("open"));

        let failed = commands::handle_response(&engine, &ctx.organization_id, bad.id, br#"{"success": false}"#)
            .await
            .unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("device reported failure"));

        // A device of another tenant cannot touch these commands.
        let err = commands::handle_response(&engine, "other", ok.id, br#"{"success": true}"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorType::NotFound);
    }
}
