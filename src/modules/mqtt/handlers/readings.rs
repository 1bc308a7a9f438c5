use crate::{
    engine::TelemetryEngine,
    modules::{ingest::IngestReceipt, mqtt::models::ReadingsPayload},
    shared::{
        context::CallerContext,
        errors::{AppError, AppResult},
    },
};

/// Ingests one device publish on behalf of the topic's organization.
pub async fn handler(engine: &TelemetryEngine, organization_id: &str, payload: &[u8]) -> AppResult<IngestReceipt> {
    let parsed: ReadingsPayload =
        serde_json::from_slice(payload).map_err(|e| AppError::from_json_err(e, "readings payload"))?;
    let ctx = CallerContext::device(organization_id);
    let receipt = engine.ingest_readings(&ctx, parsed.into_batch()).await?;
    log::debug!(
        "{} reading(s) from {} committed to {} chunk(s)",
        receipt.accepted,
        organization_id,
        receipt.chunks.len()
    );
    Ok(receipt)
}
