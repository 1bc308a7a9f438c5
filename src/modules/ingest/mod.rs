//! Write path for reading batches.
//!
//! A batch is validated in full before anything is written, then committed
//! to the store and the hypertable together. Either every row becomes visible
//! or none does.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::modules::hypertable::{ChunkId, Hypertable};
use crate::modules::registry::Registry;
use crate::shared::context::CallerContext;
use crate::shared::db::models::{AssetId, NewReading, Reading, ReadingId};
use crate::shared::db::IdSequence;
use crate::shared::errors::{AppError, AppResult, RowRejection};

/// Accepted timestamp window, relative to ingestion time.
#[derive(Debug, Clone, Copy)]
pub struct IngestWindow {
    pub retention_horizon: Duration,
    pub max_future_skew: Duration,
}

impl IngestWindow {
    fn admits(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let oldest = now
            .checked_sub_signed(self.retention_horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let newest = now
            .checked_add_signed(self.max_future_skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        timestamp >= oldest && timestamp <= newest
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestReceipt {
    pub accepted: usize,
    pub reading_ids: Vec<ReadingId>,
    pub chunks: Vec<ChunkId>,
}

/// A validated batch plus what the side-effect stages need to know about it.
#[derive(Debug)]
pub struct PreparedBatch {
    pub organization_id: String,
    pub rows: Vec<Reading>,
    pub assets_seen: HashMap<AssetId, DateTime<Utc>>,
}

#[derive(Debug)]
pub struct IngestionPath {
    ids: IdSequence,
    window: IngestWindow,
}

impl IngestionPath {
    pub fn new(window: IngestWindow) -> Self {
        IngestionPath {
            ids: IdSequence::new(),
            window,
        }
    }

    /// Keeps new reading ids clear of rows loaded from the store.
    pub fn observe_ids(&self, rows: &[Reading]) {
        for r in rows {
            self.ids.observe(r.id);
        }
    }

    /// Checks every row and stamps it with the caller's organization. The
    /// first offending row rejects the whole batch.
    pub async fn prepare(
        &self,
        ctx: &CallerContext,
        batch: Vec<NewReading>,
        registry: &Registry,
        now: DateTime<Utc>,
    ) -> AppResult<PreparedBatch> {
        let sensor_ids: BTreeSet<_> = batch.iter().map(|r| r.sensor_id).collect();
        let sensors = registry.sensors_in(&ctx.organization_id, sensor_ids).await;

        let mut checked = Vec::with_capacity(batch.len());
        let mut assets_seen: HashMap<AssetId, DateTime<Utc>> = HashMap::new();
        for (row, new) in batch.into_iter().enumerate() {
            let reject = |reason| AppError::RejectedRow { row, reason };

            if let Some(org) = new.organization_id.as_deref() {
                if ctx.check_payload(Some(org)).is_err() {
                    return Err(reject(RowRejection::TenantMismatch {
                        payload: org.to_string(),
                    }));
                }
            }
            let sensor = sensors
                .get(&new.sensor_id)
                .ok_or_else(|| reject(RowRejection::InvalidSensorReference(new.sensor_id)))?;
            if !new.value.is_finite() {
                return Err(reject(RowRejection::NonFiniteValue));
            }
            let timestamp = new.timestamp.unwrap_or(now);
            if !self.window.admits(timestamp, now) {
                return Err(reject(RowRejection::OutOfRangeTimestamp(timestamp)));
            }

            let seen = assets_seen.entry(sensor.asset_id).or_insert(timestamp);
            if *seen < timestamp {
                *seen = timestamp;
            }
            checked.push((new, timestamp));
        }

        let rows = checked
            .into_iter()
            .map(|(new, timestamp)| Reading {
                id: self.ids.next(),
                organization_id: ctx.organization_id.clone(),
                sensor_id: new.sensor_id,
                timestamp,
                value: new.value,
                protocol: new.protocol,
                quality: new.quality,
                notes: new.notes,
                metadata: new.metadata,
            })
            .collect();

        Ok(PreparedBatch {
            organization_id: ctx.organization_id.clone(),
            rows,
            assets_seen,
        })
    }

    /// Stores the batch and makes it visible.
    pub async fn commit(&self, table: &Hypertable, batch: &PreparedBatch) -> AppResult<IngestReceipt> {
        if batch.rows.is_empty() {
            return Ok(IngestReceipt {
                accepted: 0,
                reading_ids: Vec::new(),
                chunks: Vec::new(),
            });
        }
        let chunks = table.insert_batch(batch.rows.clone()).await?;
        log::debug!(
            "committed {} readings for {} into {} chunk(s)",
            batch.rows.len(),
            batch.organization_id,
            chunks.len()
        );
        Ok(IngestReceipt {
            accepted: batch.rows.len(),
            reading_ids: batch.rows.iter().map(|r| r.id).collect(),
            chunks: chunks.into_iter().collect(),
        })
    }
}
