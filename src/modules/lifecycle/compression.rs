use chrono::{DateTime, Duration, Utc};

use super::{retention, PassBudget, PassReport};
use crate::modules::hypertable::{ChunkInfo, ChunkState, Hypertable};
use crate::shared::errors::{AppError, AppResult};

/// Cold enough to compress, not yet old enough to drop.
pub fn is_eligible(info: &ChunkInfo, now: DateTime<Utc>, after: Duration, horizon: Duration) -> bool {
    info.state == ChunkState::Open
        && info.row_count > 0
        && info.range_end <= retention::cutoff(now, after)
        && !retention::is_expired(info, now, horizon)
}

pub async fn run_pass(
    table: &Hypertable,
    now: DateTime<Utc>,
    after: Duration,
    horizon: Duration,
    budget: &PassBudget<'_>,
) -> AppResult<PassReport> {
    let eligible: Vec<ChunkInfo> = table
        .chunk_infos()
        .await
        .into_iter()
        .filter(|c| is_eligible(c, now, after, horizon))
        .collect();

    let mut report = PassReport::new("compression", eligible.len());
    for info in eligible {
        if !budget.proceed()? {
            report.cancelled = true;
            break;
        }
        let stats = table
            .compress_chunk(&info.id)
            .await
            .map_err(|e| AppError::PolicyFailure {
                policy: "compression",
                message: format!("chunk {}: {}", info.id, e),
            })?;
        if let Some(stats) = stats {
            log::info!(
                "compressed chunk {}: {} rows in {} segments, {} -> {} bytes",
                info.id,
                stats.row_count,
                stats.segments,
                stats.uncompressed_bytes,
                stats.compressed_bytes
            );
            report.processed += 1;
            report.rows += stats.row_count;
            report.bytes_before += stats.uncompressed_bytes;
            report.bytes_after += stats.compressed_bytes;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::hypertable::ChunkPolicy;
    use crate::shared::db::models::{Protocol, Reading, ReadingQuality};
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;

    fn reading(id: i64, ts: DateTime<Utc>, value: f64) -> Reading {
        Reading {
            id,
            organization_id: "org-a".to_string(),
            sensor_id: id % 2,
            timestamp: ts,
            value,
            protocol: Protocol::Mqtt,
            quality: ReadingQuality::Good,
            notes: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn only_the_cold_window_is_compressed() {
        let table = Hypertable::new(ChunkPolicy::new(Duration::days(1), 4));
        let now = Utc.with_ymd_and_hms(2025, 11, 19, 12, 0, 0).unwrap();
        table
            .insert_batch(vec![
                reading(1, now - Duration::hours(2), 1.0),
                reading(2, now - Duration::days(10), 2.0),
                reading(3, now - Duration::days(10) + Duration::minutes(1), 3.0),
                reading(4, now - Duration::days(45), 4.0),
            ])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let budget = PassBudget::new("compression", std::time::Duration::from_secs(60), &cancel);
        let report = run_pass(&table, now, Duration::days(7), Duration::days(30), &budget)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.rows, 2);

        let states: Vec<ChunkState> = table.chunk_infos().await.iter().map(|c| c.state).collect();
        assert_eq!(states.iter().filter(|s| **s == ChunkState::Compressed).count(), 1);

        let again = run_pass(&table, now, Duration::days(7), Duration::days(30), &budget)
            .await
            .unwrap();
        assert_eq!(again.processed, 0);
    }
}
