//! Column-oriented encoding of a chunk, segmented by `(organization_id, sensor_id)`.
//!
//! Each segment stores its rows sorted by `(timestamp, id)` as fixed-width
//! columns (delta ids, delta seconds, nanos, XOR'd value bits, protocol and
//! quality codes) followed by a JSON block for the sparse text columns, and
//! the whole buffer is deflated. Decoding is lossless: values keep their exact
//! bit patterns.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::shared::db::models::{
    Metadata, OrganizationId, Protocol, Reading, ReadingQuality, SensorId,
};
use crate::shared::db::schema::ReadingKey;
use crate::shared::errors::{AppError, AppResult};

/// id + secs + value deltas (8 each), nanos (4), protocol and quality (1 each).
const FIXED_ROW_BYTES: usize = 8 + 8 + 4 + 8 + 1 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompressionStats {
    pub row_count: usize,
    pub segments: usize,
    pub uncompressed_bytes: usize,
    pub compressed_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SparseColumns {
    notes: Vec<Option<String>>,
    metadata: Vec<Option<Metadata>>,
}

#[derive(Debug, Clone)]
struct Segment {
    rows: usize,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    payload: Bytes,
}

impl Segment {
    fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.first < to && self.last >= from
    }
}

#[derive(Debug)]
pub struct CompressedChunk {
    segments: BTreeMap<(OrganizationId, SensorId), Segment>,
    stats: CompressionStats,
}

impl CompressedChunk {
    pub fn build<'a>(rows: impl Iterator<Item = &'a Reading>) -> AppResult<Self> {
        let mut grouped: BTreeMap<(OrganizationId, SensorId), Vec<&Reading>> = BTreeMap::new();
        for r in rows {
            grouped
                .entry((r.organization_id.clone(), r.sensor_id))
                .or_default()
                .push(r);
        }

        let mut segments = BTreeMap::new();
        let mut stats = CompressionStats {
            row_count: 0,
            segments: 0,
            uncompressed_bytes: 0,
            compressed_bytes: 0,
        };
        for (key, mut rows) in grouped {
            rows.sort_by_key(|r| (r.timestamp, r.id));
            let (payload, raw_len) = encode_segment(&rows)?;
            stats.row_count += rows.len();
            stats.segments += 1;
            stats.uncompressed_bytes += raw_len;
            stats.compressed_bytes += payload.len();
            segments.insert(
                key,
                Segment {
                    rows: rows.len(),
                    first: rows[0].timestamp,
                    last: rows[rows.len() - 1].timestamp,
                    payload,
                },
            );
        }
        Ok(CompressedChunk { segments, stats })
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    pub fn row_count(&self) -> usize {
        self.segments.values().map(|s| s.rows).sum()
    }

    pub fn has_organization(&self, organization_id: &str) -> bool {
        self.segments.keys().any(|(org, _)| org == organization_id)
    }

    pub fn scan_sensor(
        &self,
        organization_id: &str,
        sensor_id: SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        match self.segments.get(&(organization_id.to_string(), sensor_id)) {
            Some(seg) if seg.overlaps(from, to) => {
                let rows = decode_segment(organization_id, sensor_id, &seg.payload)?;
                Ok(rows
                    .into_iter()
                    .filter(|r| r.timestamp >= from && r.timestamp < to)
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    pub fn scan_organization(
        &self,
        organization_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<Reading>> {
        let mut out = Vec::new();
        for ((org, sensor), seg) in &self.segments {
            if org != organization_id || !seg.overlaps(from, to) {
                continue;
            }
            out.extend(
                decode_segment(org, *sensor, &seg.payload)?
                    .into_iter()
                    .filter(|r| r.timestamp >= from && r.timestamp < to),
            );
        }
        out.sort_by_key(|r| (r.timestamp, r.id));
        Ok(out)
    }

    pub fn find(&self, organization_id: &str, key: &ReadingKey) -> AppResult<Option<Reading>> {
        for ((org, sensor), seg) in &self.segments {
            if org != organization_id || key.timestamp < seg.first || key.timestamp > seg.last {
                continue;
            }
            let hit = decode_segment(org, *sensor, &seg.payload)?
                .into_iter()
                .find(|r| r.id == key.id && r.timestamp == key.timestamp);
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    pub fn decode_all(&self) -> AppResult<Vec<Reading>> {
        let mut out = Vec::with_capacity(self.row_count());
        for ((org, sensor), seg) in &self.segments {
            out.extend(decode_segment(org, *sensor, &seg.payload)?);
        }
        Ok(out)
    }
}

fn codec_err(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("columnar codec, {}: {}", context, err))
}

/// `rows` must be non-empty and sorted by `(timestamp, id)`.
fn encode_segment(rows: &[&Reading]) -> AppResult<(Bytes, usize)> {
    let mut buf = BytesMut::with_capacity(4 + rows.len() * FIXED_ROW_BYTES);
    buf.put_u32(rows.len() as u32);

    let mut prev_id = 0i64;
    for r in rows {
        buf.put_i64(r.id.wrapping_sub(prev_id));
        prev_id = r.id;
    }
    let mut prev_secs = 0i64;
    for r in rows {
        let secs = r.timestamp.timestamp();
        buf.put_i64(secs.wrapping_sub(prev_secs));
        prev_secs = secs;
    }
    for r in rows {
        buf.put_u32(r.timestamp.timestamp_subsec_nanos());
    }
    let mut prev_bits = 0u64;
    for r in rows {
        let bits = r.value.to_bits();
        buf.put_u64(bits ^ prev_bits);
        prev_bits = bits;
    }
    for r in rows {
        buf.put_u8(r.protocol.code());
    }
    for r in rows {
        buf.put_u8(r.quality.code());
    }

    let sparse = SparseColumns {
        notes: rows.iter().map(|r| r.notes.clone()).collect(),
        metadata: rows.iter().map(|r| r.metadata.clone()).collect(),
    };
    let sparse = serde_json::to_vec(&sparse).map_err(|e| codec_err("encoding text columns", e))?;
    buf.put_u32(sparse.len() as u32);
    buf.put_slice(&sparse);

    let raw_len = buf.len();
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw_len / 2), Compression::default());
    encoder
        .write_all(&buf)
        .map_err(|e| codec_err("deflating segment", e))?;
    let compressed = encoder
        .finish()
        .map_err(|e| codec_err("deflating segment", e))?;
    Ok((Bytes::from(compressed), raw_len))
}

fn decode_segment(
    organization_id: &str,
    sensor_id: SensorId,
    payload: &Bytes,
) -> AppResult<Vec<Reading>> {
    let mut raw = Vec::new();
    DeflateDecoder::new(payload.as_ref())
        .read_to_end(&mut raw)
        .map_err(|e| codec_err("inflating segment", e))?;
    let mut cur = Bytes::from(raw);

    if cur.remaining() < 4 {
        return Err(codec_err("reading header", "truncated"));
    }
    let n = cur.get_u32() as usize;
    if cur.remaining() < n * FIXED_ROW_BYTES + 4 {
        return Err(codec_err("reading columns", "truncated"));
    }

    let mut ids = Vec::with_capacity(n);
    let mut prev = 0i64;
    for _ in 0..n {
        prev = prev.wrapping_add(cur.get_i64());
        ids.push(prev);
    }
    let mut secs = Vec::with_capacity(n);
    let mut prev = 0i64;
    for _ in 0..n {
        prev = prev.wrapping_add(cur.get_i64());
        secs.push(prev);
    }
    let nanos: Vec<u32> = (0..n).map(|_| cur.get_u32()).collect();
    let mut values = Vec::with_capacity(n);
    let mut prev_bits = 0u64;
    for _ in 0..n {
        prev_bits ^= cur.get_u64();
        values.push(f64::from_bits(prev_bits));
    }
    let protocols: Vec<u8> = (0..n).map(|_| cur.get_u8()).collect();
    let qualities: Vec<u8> = (0..n).map(|_| cur.get_u8()).collect();

    let sparse_len = cur.get_u32() as usize;
    if cur.remaining() < sparse_len {
        return Err(codec_err("reading text columns", "truncated"));
    }
    let sparse: SparseColumns = serde_json::from_slice(&cur.copy_to_bytes(sparse_len))
        .map_err(|e| codec_err("decoding text columns", e))?;
    if sparse.notes.len() != n || sparse.metadata.len() != n {
        return Err(codec_err("decoding text columns", "row count mismatch"));
    }

    let mut rows = Vec::with_capacity(n);
    for (i, (notes, metadata)) in sparse.notes.into_iter().zip(sparse.metadata).enumerate() {
        let timestamp = Utc
            .timestamp_opt(secs[i], nanos[i])
            .single()
            .ok_or_else(|| codec_err("rebuilding timestamp", secs[i]))?;
        rows.push(Reading {
            id: ids[i],
            organization_id: organization_id.to_string(),
            sensor_id,
            timestamp,
            value: values[i],
            protocol: Protocol::from_code(protocols[i]),
            quality: ReadingQuality::from_code(qualities[i]),
            notes,
            metadata,
        });
    }
    Ok(rows)
}
