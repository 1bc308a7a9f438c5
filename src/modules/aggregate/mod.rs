//! Hourly rollups of readings per `(organization, sensor, hour)`.
//!
//! Ingestion marks the buckets it touched; a refresh recomputes exactly those
//! buckets from the raw rows. Nothing is folded incrementally into a running
//! value, so a refreshed bucket always equals a full recomputation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{Mutex, RwLock};

use crate::modules::hypertable::Hypertable;
use crate::shared::db::models::{OrganizationId, Reading, SensorId};
use crate::shared::db::records::{to_db_time, HourlyRow};
use crate::shared::db::Persistence;
use crate::shared::errors::AppResult;

type BucketKey = (OrganizationId, SensorId, DateTime<Utc>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub organization_id: OrganizationId,
    pub sensor_id: SensorId,
    pub bucket: DateTime<Utc>,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub reading_count: u64,
}

impl AggregateBucket {
    /// `None` for an empty slice; buckets never exist without data.
    pub fn compute(
        organization_id: &str,
        sensor_id: SensorId,
        bucket: DateTime<Utc>,
        rows: &[Reading],
    ) -> Option<Self> {
        let first = rows.first()?;
        let mut sum = 0.0;
        let mut min = first.value;
        let mut max = first.value;
        for r in rows {
            sum += r.value;
            min = min.min(r.value);
            max = max.max(r.value);
        }
        Some(AggregateBucket {
            organization_id: organization_id.to_string(),
            sensor_id,
            bucket,
            avg_value: sum / rows.len() as f64,
            min_value: min,
            max_value: max,
            reading_count: rows.len() as u64,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub emptied: usize,
    pub expired: usize,
}

pub fn hour_bucket(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let secs = timestamp.timestamp().div_euclid(3600) * 3600;
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Default)]
pub struct ContinuousAggregate {
    buckets: RwLock<BTreeMap<BucketKey, AggregateBucket>>,
    invalidated: Mutex<BTreeSet<BucketKey>>,
    store: Persistence,
}

impl ContinuousAggregate {
    pub fn new() -> Self {
        ContinuousAggregate::default()
    }

    pub fn with_store(store: Persistence) -> Self {
        ContinuousAggregate {
            store,
            ..ContinuousAggregate::default()
        }
    }

    /// Loads the stored rollups. The invalidation set is not stored, so the
    /// caller invalidates the restored raw rows again.
    pub async fn restore(&self) -> AppResult<()> {
        let stored = self.store.load(|db| db.load_rollups()).await?;
        let mut buckets = self.buckets.write().await;
        for row in stored {
            let bucket = row.into_model()?;
            buckets.insert(
                (bucket.organization_id.clone(), bucket.sensor_id, bucket.bucket),
                bucket,
            );
        }
        log::info!("restored {} hourly rollup(s)", buckets.len());
        Ok(())
    }

    pub async fn invalidate(&self, rows: &[Reading]) {
        let mut pending = self.invalidated.lock().await;
        for r in rows {
            pending.insert((r.organization_id.clone(), r.sensor_id, hour_bucket(r.timestamp)));
        }
    }

    pub async fn pending(&self) -> usize {
        self.invalidated.lock().await.len()
    }

    /// Recomputes invalidated buckets. Buckets that ended before `cutoff` are
    /// no longer backed by raw rows and keep their last refreshed values.
    ///
    /// On failure the unprocessed keys are put back for the next refresh.
    pub async fn refresh(&self, table: &Hypertable, cutoff: DateTime<Utc>) -> AppResult<RefreshReport> {
        let keys = std::mem::take(&mut *self.invalidated.lock().await);
        let mut report = RefreshReport::default();
        let mut remaining = keys.into_iter();

        while let Some(key) = remaining.next() {
            let end = key.2 + Duration::hours(1);
            if end <= cutoff {
                report.expired += 1;
                continue;
            }

            if let Err(e) = self.recompute(table, &key, end, &mut report).await {
                let mut pending = self.invalidated.lock().await;
                pending.insert(key);
                pending.extend(remaining);
                return Err(e);
            }
        }
        Ok(report)
    }

    async fn recompute(
        &self,
        table: &Hypertable,
        key: &BucketKey,
        end: DateTime<Utc>,
        report: &mut RefreshReport,
    ) -> AppResult<()> {
        let (org, sensor, start) = key;
        let rows = table.query_sensor(org, *sensor, *start, end).await?;
        let mut buckets = self.buckets.write().await;
        match AggregateBucket::compute(org, *sensor, *start, &rows) {
            Some(bucket) => {
                let row = HourlyRow::from_model(&bucket);
                self.store.write(move |db| db.upsert_rollup(&row)).await?;
                buckets.insert(key.clone(), bucket);
                report.refreshed += 1;
            }
            None => {
                if buckets.contains_key(key) {
                    let (org, sensor, stamp) = (org.clone(), *sensor, to_db_time(*start));
                    self.store
                        .write(move |db| db.delete_rollup(&org, sensor, &stamp))
                        .await?;
                    buckets.remove(key);
                    report.emptied += 1;
                }
            }
        }
        Ok(())
    }

    /// Buckets overlapping `[from, to)`, oldest first.
    pub async fn query(
        &self,
        organization_id: &str,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<AggregateBucket> {
        if from >= to {
            return Vec::new();
        }
        let lower = (organization_id.to_string(), sensor_id, hour_bucket(from));
        let upper = (organization_id.to_string(), sensor_id, to);
        self.buckets
            .read()
            .await
            .range(lower..upper)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub async fn purge_organization(&self, organization_id: &str) -> AppResult<usize> {
        self.invalidated
            .lock()
            .await
            .retain(|(org, ..)| org != organization_id);
        let org = organization_id.to_string();
        self.store
            .write(move |db| db.delete_rollups(&org).map(|_| ()))
            .await?;
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|(org, ..), _| org != organization_id);
        Ok(before - buckets.len())
    }
}
