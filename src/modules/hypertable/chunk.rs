use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use super::columnar::{CompressedChunk, CompressionStats};
use crate::shared::db::models::{Reading, SensorId};
use crate::shared::db::schema::{OrganizationTimeIndexKey, ReadingKey, SensorTimeIndexKey};
use crate::shared::errors::{AppError, AppResult};

/// Identity of a physical segment: its time slot and its tenant partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkId {
    pub range_start: DateTime<Utc>,
    pub partition: u16,
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "_hyper_readings_{}_p{}",
            self.range_start.timestamp(),
            self.partition
        )
    }
}

/// Pure mapping from `(timestamp, organization_id)` to a chunk.
#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    /// `None` disables time partitioning.
    interval: Option<Duration>,
    partitions: u16,
}

impl ChunkPolicy {
    pub fn new(interval: Duration, partitions: u16) -> Self {
        ChunkPolicy {
            interval: Some(interval),
            partitions: partitions.max(1),
        }
    }

    pub fn unbounded(partitions: u16) -> Self {
        ChunkPolicy {
            interval: None,
            partitions: partitions.max(1),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn partitions(&self) -> u16 {
        self.partitions
    }

    /// FNV-1a over the organization id; stable across processes and builds.
    pub fn partition_of(&self, organization_id: &str) -> u16 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in organization_id.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % self.partitions as u64) as u16
    }

    pub fn assign(&self, timestamp: DateTime<Utc>, organization_id: &str) -> ChunkId {
        ChunkId {
            range_start: self.slot_start(timestamp),
            partition: self.partition_of(organization_id),
        }
    }

    /// Chunk intervals are `[start, end)`.
    pub fn range_of(&self, id: &ChunkId) -> (DateTime<Utc>, DateTime<Utc>) {
        match self.interval {
            Some(interval) => {
                let end = id
                    .range_start
                    .checked_add_signed(interval)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (id.range_start, end)
            }
            None => (DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC),
        }
    }

    fn slot_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        match self.interval {
            Some(interval) => {
                let step = interval.num_seconds().max(1);
                // Sub-second parts are non-negative, so flooring whole seconds
                // floors the instant.
                let start = timestamp.timestamp().div_euclid(step) * step;
                Utc.timestamp_opt(start, 0)
                    .single()
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            }
            None => DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Uncompressed rows plus the two reading indexes.
#[derive(Debug, Default)]
pub struct RowStore {
    rows: HashMap<ReadingKey, Reading>,
    by_sensor: BTreeSet<SensorTimeIndexKey>,
    by_organization: BTreeSet<OrganizationTimeIndexKey>,
}

impl RowStore {
    pub fn from_rows(rows: Vec<Reading>) -> Self {
        let mut store = RowStore::default();
        for r in rows {
            store.insert(r);
        }
        store
    }

    /// Re-inserting the same `(id, timestamp)` replaces the row.
    pub fn insert(&mut self, reading: Reading) {
        self.by_sensor.insert((
            reading.organization_id.clone(),
            reading.sensor_id,
            reading.timestamp,
            reading.id,
        ));
        self.by_organization.insert((
            reading.organization_id.clone(),
            reading.timestamp,
            reading.id,
        ));
        self.rows.insert(reading.key(), reading);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &ReadingKey) -> Option<&Reading> {
        self.rows.get(key)
    }

    pub fn scan_sensor(
        &self,
        organization_id: &str,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Reading> {
        if from >= to {
            return Vec::new();
        }
        let org = organization_id.to_string();
        let lower = (org.clone(), sensor_id, from, i64::MIN);
        let upper = (org, sensor_id, to, i64::MIN);
        self.by_sensor
            .range(lower..upper)
            .filter_map(|(_, _, ts, id)| self.rows.get(&ReadingKey { id: *id, timestamp: *ts }))
            .cloned()
            .collect()
    }

    pub fn scan_organization(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Reading> {
        if from >= to {
            return Vec::new();
        }
        let org = organization_id.to_string();
        let lower = (org.clone(), from, i64::MIN);
        let upper = (org, to, i64::MIN);
        self.by_organization
            .range(lower..upper)
            .filter_map(|(_, ts, id)| self.rows.get(&ReadingKey { id: *id, timestamp: *ts }))
            .cloned()
            .collect()
    }

    pub fn remove_organization(&mut self, organization_id: &str) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, r| r.organization_id != organization_id);
        self.by_sensor.retain(|(org, ..)| org != organization_id);
        self.by_organization.retain(|(org, ..)| org != organization_id);
        before - self.rows.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkState {
    Open,
    Compressed,
}

#[derive(Debug)]
enum ChunkStorage {
    Rows(RowStore),
    Compressed(CompressedChunk),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub state: ChunkState,
    pub row_count: usize,
    pub compressed_bytes: Option<usize>,
}

#[derive(Debug)]
pub struct Chunk {
    pub id: ChunkId,
    pub range_end: DateTime<Utc>,
    storage: ChunkStorage,
    dropped: bool,
}

impl Chunk {
    pub fn new(id: ChunkId, range_end: DateTime<Utc>) -> Self {
        Chunk {
            id,
            range_end,
            storage: ChunkStorage::Rows(RowStore::default()),
            dropped: false,
        }
    }

    pub fn state(&self) -> ChunkState {
        match self.storage {
            ChunkStorage::Rows(_) => ChunkState::Open,
            ChunkStorage::Compressed(_) => ChunkState::Compressed,
        }
    }

    pub fn row_count(&self) -> usize {
        match &self.storage {
            ChunkStorage::Rows(rows) => rows.len(),
            ChunkStorage::Compressed(c) => c.row_count(),
        }
    }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            id: self.id,
            range_start: self.id.range_start,
            range_end: self.range_end,
            state: self.state(),
            row_count: self.row_count(),
            compressed_bytes: match &self.storage {
                ChunkStorage::Compressed(c) => Some(c.stats().compressed_bytes),
                ChunkStorage::Rows(_) => None,
            },
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Empties the chunk and refuses any writer still holding a handle to it.
    pub fn mark_dropped(&mut self) -> usize {
        let rows = self.row_count();
        self.storage = ChunkStorage::Rows(RowStore::default());
        self.dropped = true;
        rows
    }

    /// Only open chunks take rows; callers decompress first.
    pub fn insert(&mut self, reading: Reading) -> AppResult<()> {
        match &mut self.storage {
            ChunkStorage::Rows(rows) => {
                rows.insert(reading);
                Ok(())
            }
            ChunkStorage::Compressed(_) => Err(AppError::Internal(format!(
                "insert into compressed chunk {}",
                self.id
            ))),
        }
    }

    pub fn get(&self, key: &ReadingKey, organization_id: &str) -> AppResult<Option<Reading>> {
        let found = match &self.storage {
            ChunkStorage::Rows(rows) => rows.get(key).cloned(),
            ChunkStorage::Compressed(c) => c.find(organization_id, key)?,
        };
        Ok(found.filter(|r| r.organization_id == organization_id))
    }

    pub fn scan_sensor(
        &self,
        organization_id: &str,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        match &self.storage {
            ChunkStorage::Rows(rows) => Ok(rows.scan_sensor(organization_id, sensor_id, from, to)),
            ChunkStorage::Compressed(c) => c.scan_sensor(organization_id, sensor_id, from, to),
        }
    }

    pub fn scan_organization(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        match &self.storage {
            ChunkStorage::Rows(rows) => Ok(rows.scan_organization(organization_id, from, to)),
            ChunkStorage::Compressed(c) => c.scan_organization(organization_id, from, to),
        }
    }

    /// Returns `None` when already compressed or empty.
    pub fn compress(&mut self) -> AppResult<Option<CompressionStats>> {
        let rows = match &self.storage {
            ChunkStorage::Rows(rows) if !rows.is_empty() => rows,
            _ => return Ok(None),
        };
        // Built before the swap so a codec failure leaves the rows in place.
        let compressed = CompressedChunk::build(rows.rows.values())?;
        let stats = compressed.stats();
        self.storage = ChunkStorage::Compressed(compressed);
        Ok(Some(stats))
    }

    pub fn decompress(&mut self) -> AppResult<()> {
        if let ChunkStorage::Compressed(c) = &self.storage {
            let rows = c.decode_all()?;
            self.storage = ChunkStorage::Rows(RowStore::from_rows(rows));
        }
        Ok(())
    }

    pub fn remove_organization(&mut self, organization_id: &str) -> AppResult<usize> {
        if let ChunkStorage::Compressed(c) = &self.storage {
            if !c.has_organization(organization_id) {
                return Ok(0);
            }
            self.decompress()?;
        }
        match &mut self.storage {
            ChunkStorage::Rows(rows) => Ok(rows.remove_organization(organization_id)),
            ChunkStorage::Compressed(_) => Ok(0),
        }
    }
}
