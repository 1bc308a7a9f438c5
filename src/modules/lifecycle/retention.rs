use chrono::{DateTime, Duration, Utc};

use super::{PassBudget, PassReport};
use crate::modules::hypertable::{ChunkInfo, Hypertable};
use crate::shared::errors::AppResult;

/// Instant before which data is past the horizon. Saturates at the start of
/// the calendar instead of overflowing.
pub fn cutoff(now: DateTime<Utc>, horizon: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(horizon).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A chunk may go only when its whole interval is older than the horizon.
pub fn is_expired(info: &ChunkInfo, now: DateTime<Utc>, horizon: Duration) -> bool {
    info.range_end <= cutoff(now, horizon)
}

pub async fn run_pass(
    table: &Hypertable,
    now: DateTime<Utc>,
    horizon: Duration,
    budget: &PassBudget<'_>,
) -> AppResult<PassReport> {
    let expired: Vec<ChunkInfo> = table
        .chunk_infos()
        .await
        .into_iter()
        .filter(|c| is_expired(c, now, horizon))
        .collect();

    let mut report = PassReport::new("retention", expired.len());
    for info in expired {
        if !budget.proceed()? {
            report.cancelled = true;
            break;
        }
        if let Some(rows) = table.drop_chunk(&info.id).await? {
            log::info!("retention dropped chunk {} ({} rows)", info.id, rows);
            report.processed += 1;
            report.rows += rows;
        }
    }
    Ok(report)
}
