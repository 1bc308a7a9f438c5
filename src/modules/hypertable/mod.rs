//! The readings table: a logical table backed by many time/tenant chunks.
//!
//! Every chunk sits behind its own lock. Writers lock only the chunks their
//! batch touches, in `ChunkId` order, so batches from different tenant
//! partitions never wait on each other. Lifecycle transitions (drop,
//! compress) happen under a chunk's write lock, which keeps readers from ever
//! seeing a chunk halfway through one.

pub mod chunk;
pub mod columnar;

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub use chunk::{ChunkId, ChunkInfo, ChunkPolicy, ChunkState};
pub use columnar::CompressionStats;

use chunk::Chunk;
use crate::shared::db::models::{Reading, SensorId};
use crate::shared::db::records::{ChunkRow, PendingEvaluationRow, ReadingRow};
use crate::shared::db::schema::ReadingKey;
use crate::shared::db::Persistence;
use crate::shared::errors::{AppError, AppResult, RowRejection};

type ChunkHandle = Arc<RwLock<Chunk>>;

#[derive(Debug)]
pub struct Hypertable {
    policy: ChunkPolicy,
    chunks: RwLock<BTreeMap<ChunkId, ChunkHandle>>,
    // Per partition, the end of the newest chunk dropped. Nothing is written
    // below it again.
    dropped_through: RwLock<BTreeMap<u16, DateTime<Utc>>>,
    store: Persistence,
}

impl Hypertable {
    pub fn new(policy: ChunkPolicy) -> Self {
        Hypertable::with_store(policy, Persistence::default())
    }

    pub fn with_store(policy: ChunkPolicy, store: Persistence) -> Self {
        Hypertable {
            policy,
            chunks: RwLock::new(BTreeMap::new()),
            dropped_through: RwLock::new(BTreeMap::new()),
            store,
        }
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    /// Commits all rows or none. Row indexes in errors refer to `rows`.
    ///
    /// The store write happens under the chunk write locks, so a chunk can
    /// not be dropped between the check and the commit. Every committed row
    /// is also queued for alert evaluation in the same transaction.
    pub async fn insert_batch(&self, rows: Vec<Reading>) -> AppResult<BTreeSet<ChunkId>> {
        let mut by_chunk: BTreeMap<ChunkId, Vec<(usize, Reading)>> = BTreeMap::new();
        for (i, r) in rows.into_iter().enumerate() {
            by_chunk
                .entry(self.policy.assign(r.timestamp, &r.organization_id))
                .or_default()
                .push((i, r));
        }

        let handles = self.handles_for(by_chunk.keys().copied().collect()).await;
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.write_owned().await);
        }

        let dropped_through = self.dropped_through.read().await.clone();
        for (guard, (id, rows)) in guards.iter().zip(by_chunk.iter()) {
            let (_, end) = self.policy.range_of(id);
            let below_drop = dropped_through
                .get(&id.partition)
                .map_or(false, |through| end <= *through);
            if guard.is_dropped() || below_drop {
                let (row, r) = &rows[0];
                return Err(AppError::RejectedRow {
                    row: *row,
                    reason: RowRejection::OutOfRangeTimestamp(r.timestamp),
                });
            }
        }

        if self.store.is_durable() {
            let mut records = Vec::new();
            let mut touched = Vec::with_capacity(by_chunk.len());
            for (id, rows) in &by_chunk {
                touched.push(ChunkRow::new(*id, false));
                for (_, r) in rows {
                    records.push(ReadingRow::from_model(r, *id)?);
                }
            }
            let pending: Vec<PendingEvaluationRow> =
                records.iter().map(ReadingRow::pending_evaluation).collect();
            self.store
                .write(move |db| db.commit_readings(&records, &touched, &pending))
                .await?;
        }

        for guard in guards.iter_mut() {
            if guard.state() == ChunkState::Compressed {
                log::info!("late write into compressed chunk {}, decompressing", guard.id);
                guard.decompress()?;
            }
        }

        let touched = by_chunk.keys().copied().collect();
        for (guard, (_, rows)) in guards.iter_mut().zip(by_chunk.into_iter()) {
            for (_, r) in rows {
                guard.insert(r)?;
            }
        }
        Ok(touched)
    }

    async fn handles_for(&self, ids: Vec<ChunkId>) -> Vec<ChunkHandle> {
        {
            let map = self.chunks.read().await;
            let existing: Vec<ChunkHandle> = ids.iter().filter_map(|id| map.get(id).cloned()).collect();
            if existing.len() == ids.len() {
                return existing;
            }
        }

        let mut map = self.chunks.write().await;
        ids.iter()
            .map(|id| {
                map.entry(*id)
                    .or_insert_with(|| {
                        let (_, end) = self.policy.range_of(id);
                        log::debug!("creating chunk {}", id);
                        Arc::new(RwLock::new(Chunk::new(*id, end)))
                    })
                    .clone()
            })
            .collect()
    }

    /// Chunks of the organization's partition overlapping `[from, to)`, in time order.
    async fn candidates(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<ChunkHandle> {
        let partition = self.policy.partition_of(organization_id);
        let map = self.chunks.read().await;
        map.iter()
            .filter(|(id, _)| {
                let (start, end) = self.policy.range_of(id);
                id.partition == partition && start < to && end > from
            })
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub async fn query_sensor(
        &self,
        organization_id: &str,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        let mut out = Vec::new();
        for handle in self.candidates(organization_id, from, to).await {
            let chunk = handle.read().await;
            if chunk.is_dropped() {
                continue;
            }
            out.extend(chunk.scan_sensor(organization_id, sensor_id, from, to)?);
        }
        Ok(out)
    }

    pub async fn query_organization(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        let mut out = Vec::new();
        for handle in self.candidates(organization_id, from, to).await {
            let chunk = handle.read().await;
            if chunk.is_dropped() {
                continue;
            }
            out.extend(chunk.scan_organization(organization_id, from, to)?);
        }
        Ok(out)
    }

    /// Point lookup by physical key; the timestamp selects the chunk.
    pub async fn get(&self, organization_id: &str, key: &ReadingKey) -> AppResult<Option<Reading>> {
        let id = self.policy.assign(key.timestamp, organization_id);
        let handle = match self.chunks.read().await.get(&id) {
            Some(h) => h.clone(),
            None => return Ok(None),
        };
        let chunk = handle.read().await;
        if chunk.is_dropped() {
            return Ok(None);
        }
        chunk.get(key, organization_id)
    }

    pub async fn chunk_infos(&self) -> Vec<ChunkInfo> {
        let handles: Vec<ChunkHandle> = self.chunks.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(handles.len());
        for h in handles {
            let chunk = h.read().await;
            if !chunk.is_dropped() {
                infos.push(chunk.info());
            }
        }
        infos
    }

    pub async fn row_count(&self) -> usize {
        self.chunk_infos().await.iter().map(|c| c.row_count).sum()
    }

    /// Removes a whole chunk. `None` when it was already gone.
    pub async fn drop_chunk(&self, id: &ChunkId) -> AppResult<Option<usize>> {
        let handle = match self.chunks.read().await.get(id).cloned() {
            Some(h) => h,
            None => return Ok(None),
        };
        let rows = {
            let mut chunk = handle.write().await;
            if chunk.is_dropped() {
                return Ok(None);
            }
            let row = ChunkRow::new(*id, false);
            self.store
                .write(move |db| db.delete_chunk(row.chunk_start, row.chunk_partition).map(|_| ()))
                .await?;
            self.close_below(id).await;
            chunk.mark_dropped()
        };
        let mut map = self.chunks.write().await;
        if map.get(id).map_or(false, |h| Arc::ptr_eq(h, &handle)) {
            map.remove(id);
        }
        Ok(Some(rows))
    }

    async fn close_below(&self, id: &ChunkId) {
        let (_, end) = self.policy.range_of(id);
        let mut through = self.dropped_through.write().await;
        let mark = through.entry(id.partition).or_insert(end);
        if *mark < end {
            *mark = end;
        }
    }

    /// `None` when the chunk is gone, empty or already compressed.
    pub async fn compress_chunk(&self, id: &ChunkId) -> AppResult<Option<CompressionStats>> {
        let handle = match self.chunks.read().await.get(id).cloned() {
            Some(h) => h,
            None => return Ok(None),
        };
        let mut chunk = handle.write().await;
        if chunk.is_dropped() {
            return Ok(None);
        }
        let stats = chunk.compress()?;
        if stats.is_some() {
            let row = ChunkRow::new(*id, true);
            self.store.write(move |db| db.set_chunk_compressed(&row)).await?;
        }
        Ok(stats)
    }

    pub async fn decompress_chunk(&self, id: &ChunkId) -> AppResult<bool> {
        let handle = match self.chunks.read().await.get(id).cloned() {
            Some(h) => h,
            None => return Ok(false),
        };
        let mut chunk = handle.write().await;
        if chunk.is_dropped() || chunk.state() != ChunkState::Compressed {
            return Ok(false);
        }
        chunk.decompress()?;
        let row = ChunkRow::new(*id, false);
        self.store.write(move |db| db.set_chunk_compressed(&row)).await?;
        Ok(true)
    }

    /// Deletes every reading of a tenant. Used by organization deletion only.
    pub async fn purge_organization(&self, organization_id: &str) -> AppResult<usize> {
        let partition = self.policy.partition_of(organization_id);
        let handles: Vec<(ChunkId, ChunkHandle)> = self
            .chunks
            .read()
            .await
            .iter()
            .filter(|(id, _)| id.partition == partition)
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let mut guards = Vec::with_capacity(handles.len());
        for (id, h) in handles {
            guards.push((id, h.write_owned().await));
        }

        let org = organization_id.to_string();
        self.store
            .write(move |db| db.delete_organization_readings(&org).map(|_| ()))
            .await?;

        let mut removed = 0;
        let mut reopened = Vec::new();
        for (id, chunk) in guards.iter_mut() {
            if chunk.is_dropped() {
                continue;
            }
            let was = chunk.state();
            removed += chunk.remove_organization(organization_id)?;
            if was != chunk.state() {
                reopened.push(ChunkRow::new(*id, false));
            }
        }
        if !reopened.is_empty() {
            self.store
                .write(move |db| reopened.iter().try_for_each(|row| db.set_chunk_compressed(row)))
                .await?;
        }
        Ok(removed)
    }

    /// Loads the stored readings back into chunks. Chunks wholly before
    /// `cutoff` are deleted from the store instead. Returns the loaded rows.
    pub async fn restore(&self, cutoff: Option<DateTime<Utc>>) -> AppResult<Vec<Reading>> {
        let catalog = self.store.load(|db| db.load_chunks()).await?;
        let mut compressed = BTreeSet::new();
        let mut expired = Vec::new();
        for entry in catalog {
            let id = self.stored_chunk_id(entry.chunk_start, entry.chunk_partition)?;
            let (_, end) = self.policy.range_of(&id);
            if cutoff.map_or(false, |c| end <= c) {
                expired.push(id);
            } else if entry.compressed {
                compressed.insert(id);
            }
        }
        for id in expired {
            self.close_below(&id).await;
            let row = ChunkRow::new(id, false);
            self.store
                .write(move |db| {
                    let removed = db.delete_chunk(row.chunk_start, row.chunk_partition)?;
                    log::info!("dropped expired chunk {} from the store ({} rows)", id, removed);
                    Ok(())
                })
                .await?;
        }

        let stored = self.store.load(|db| db.load_readings()).await?;
        let mut by_chunk: BTreeMap<ChunkId, Vec<Reading>> = BTreeMap::new();
        for row in stored {
            let stored_id = self.stored_chunk_id(row.chunk_start, row.chunk_partition)?;
            let reading = row.into_model()?;
            let id = self.policy.assign(reading.timestamp, &reading.organization_id);
            if id != stored_id {
                return Err(AppError::Configuration(format!(
                    "reading {} is stored in chunk {} but now maps to {}; \
                     chunk interval or partition count changed",
                    reading.id, stored_id, id
                )));
            }
            by_chunk.entry(id).or_default().push(reading);
        }

        let mut restored = Vec::new();
        let mut map = self.chunks.write().await;
        for (id, rows) in by_chunk {
            let (_, end) = self.policy.range_of(&id);
            let mut chunk = Chunk::new(id, end);
            for r in &rows {
                chunk.insert(r.clone())?;
            }
            if compressed.contains(&id) {
                chunk.compress()?;
            }
            map.insert(id, Arc::new(RwLock::new(chunk)));
            restored.extend(rows);
        }
        log::info!("restored {} readings in {} chunks", restored.len(), map.len());
        Ok(restored)
    }

    fn stored_chunk_id(&self, start: i64, partition: i32) -> AppResult<ChunkId> {
        let range_start = Utc
            .timestamp_opt(start, 0)
            .single()
            .ok_or_else(|| AppError::Internal(format!("stored chunk start {}", start)))?;
        match u16::try_from(partition) {
            Ok(p) if p < self.policy.partitions() => Ok(ChunkId {
                range_start,
                partition: p,
            }),
            _ => Err(AppError::Configuration(format!(
                "stored partition {} does not fit {} partitions",
                partition,
                self.policy.partitions()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::db::models::{Protocol, ReadingQuality};
    use crate::shared::db::Store;
    use chrono::{Duration, TimeZone};

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, d, h, 0, 0).unwrap()
    }

    fn reading(id: i64, org: &str, sensor: SensorId, at: DateTime<Utc>, value: f64) -> Reading {
        Reading {
            id,
            organization_id: org.to_string(),
            sensor_id: sensor,
            timestamp: at,
            value,
            protocol: Protocol::Mqtt,
            quality: ReadingQuality::Good,
            notes: None,
            metadata: None,
        }
    }

    fn table() -> Hypertable {
        Hypertable::new(ChunkPolicy::new(Duration::days(1), 4))
    }

    #[tokio::test]
    async fn batch_spreads_over_day_chunks() {
        let t = table();
        let touched = t
            .insert_batch(vec![
                reading(1, "org-a", 1, day(1, 23), 1.0),
                reading(2, "org-a", 1, day(2, 0), 2.0),
                reading(3, "org-a", 1, day(2, 5), 3.0),
            ])
            .await
            .unwrap();
        assert_eq!(touched.len(), 2);
        assert_eq!(t.chunk_infos().await.len(), 2);

        let rows = t.query_sensor("org-a", 1, day(1, 0), day(3, 0)).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn other_tenants_never_see_rows() {
        let t = table();
        t.insert_batch(vec![reading(1, "org-a", 1, day(5, 1), 1.0)]).await.unwrap();
        assert!(t.query_sensor("org-b", 1, day(1, 0), day(30, 0)).await.unwrap().is_empty());
        assert!(t.query_organization("org-b", day(1, 0), day(30, 0)).await.unwrap().is_empty());
        let key = ReadingKey { id: 1, timestamp: day(5, 1) };
        assert!(t.get("org-b", &key).await.unwrap().is_none());
        assert!(t.get("org-a", &key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compression_is_invisible_to_readers() {
        let t = table();
        let rows: Vec<Reading> = (0..48)
            .map(|i| reading(i + 1, "org-a", i % 3, day(3, 0) + Duration::minutes(i * 30), i as f64 * 1.5))
            .collect();
        t.insert_batch(rows).await.unwrap();

        let before = t.query_organization("org-a", day(1, 0), day(10, 0)).await.unwrap();
        for info in t.chunk_infos().await {
            t.compress_chunk(&info.id).await.unwrap();
        }
        assert!(t.chunk_infos().await.iter().all(|c| c.state == ChunkState::Compressed));
        let after = t.query_organization("org-a", day(1, 0), day(10, 0)).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(
            t.query_sensor("org-a", 2, day(3, 0), day(4, 0)).await.unwrap().len(),
            16
        );
    }

    #[tokio::test]
    async fn writes_to_dropped_chunk_are_refused() {
        let t = table();
        t.insert_batch(vec![reading(1, "org-a", 1, day(1, 1), 1.0)]).await.unwrap();
        let id = t.policy().assign(day(1, 1), "org-a");
        let handle = t.chunks.read().await.get(&id).cloned().unwrap();

        assert_eq!(t.drop_chunk(&id).await.unwrap(), Some(1));
        assert_eq!(t.drop_chunk(&id).await.unwrap(), None);
        assert!(handle.read().await.is_dropped());
        assert_eq!(t.row_count().await, 0);

        let err = t
            .insert_batch(vec![reading(2, "org-a", 1, day(1, 2), 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::RejectedRow { row: 0, reason: RowRejection::OutOfRangeTimestamp(_) }
        ));
        assert!(t.get("org-a", &ReadingKey { id: 2, timestamp: day(1, 2) }).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_touches_only_one_tenant() {
        let t = table();
        t.insert_batch(vec![
            reading(1, "org-a", 1, day(1, 1), 1.0),
            reading(2, "org-a", 1, day(2, 1), 1.0),
        ])
        .await
        .unwrap();
        t.insert_batch(vec![reading(3, "org-b", 1, day(1, 1), 1.0)]).await.unwrap();
        let id = t.policy().assign(day(1, 1), "org-a");
        t.compress_chunk(&id).await.unwrap();

        assert_eq!(t.purge_organization("org-a").await.unwrap(), 2);
        assert_eq!(t.row_count().await, 1);
        assert_eq!(t.query_organization("org-b", day(1, 0), day(3, 0)).await.unwrap().len(), 1);
    }

    async fn durable(dir: &tempfile::TempDir) -> Hypertable {
        let path = dir.path().join("telemetry.db");
        let store = Store::open(path.to_str().unwrap(), 2).await.unwrap();
        Hypertable::with_store(ChunkPolicy::new(Duration::days(1), 4), Persistence::new(store))
    }

    #[tokio::test]
    async fn restore_brings_back_rows_and_chunk_state() {
        let dir = tempfile::tempdir().unwrap();
        let cold = {
            let t = durable(&dir).await;
            t.insert_batch(vec![
                reading(1, "org-a", 1, day(1, 1), 1.0),
                reading(2, "org-a", 1, day(2, 1), 2.0),
                reading(3, "org-b", 1, day(2, 2), 3.0),
            ])
            .await
            .unwrap();
            let id = t.policy().assign(day(1, 1), "org-a");
            t.compress_chunk(&id).await.unwrap().unwrap();
            id
        };

        let t = durable(&dir).await;
        assert_eq!(t.restore(None).await.unwrap().len(), 3);
        let infos = t.chunk_infos().await;
        assert_eq!(infos.iter().find(|c| c.id == cold).unwrap().state, ChunkState::Compressed);
        let rows = t.query_organization("org-a", day(1, 0), day(3, 0)).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn restore_shrinks_the_store_past_the_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = durable(&dir).await;
            t.insert_batch(vec![
                reading(1, "org-a", 1, day(1, 1), 1.0),
                reading(2, "org-a", 1, day(5, 1), 2.0),
            ])
            .await
            .unwrap();
        }
        {
            let t = durable(&dir).await;
            assert_eq!(t.restore(Some(day(3, 0))).await.unwrap().len(), 1);
            let err = t
                .insert_batch(vec![reading(3, "org-a", 1, day(1, 2), 1.0)])
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::RejectedRow { row: 0, .. }));
        }
        let t = durable(&dir).await;
        let rows = t.restore(None).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn drops_and_purges_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = durable(&dir).await;
            t.insert_batch(vec![
                reading(1, "org-a", 1, day(1, 1), 1.0),
                reading(2, "org-a", 1, day(2, 1), 1.0),
                reading(3, "org-b", 1, day(2, 1), 1.0),
            ])
            .await
            .unwrap();
            let id = t.policy().assign(day(1, 1), "org-a");
            assert_eq!(t.drop_chunk(&id).await.unwrap(), Some(1));
            t.purge_organization("org-b").await.unwrap();
        }
        let t = durable(&dir).await;
        let rows = t.restore(None).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn restore_refuses_a_changed_chunk_layout() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = durable(&dir).await;
            t.insert_batch(vec![reading(1, "org-a", 1, day(1, 1), 1.0)]).await.unwrap();
        }
        let path = dir.path().join("telemetry.db");
        let store = Store::open(path.to_str().unwrap(), 2).await.unwrap();
        let t = Hypertable::with_store(ChunkPolicy::new(Duration::hours(1), 4), Persistence::new(store));
        let err = t.restore(None).await.unwrap_err();
        assert_eq!(err.kind(), crate::shared::errors::ErrorType::Configuration);
    }
}
