//! Threshold alerts.
//!
//! Ingestion only pushes committed readings onto the evaluation outbox; it
//! never waits for evaluation. One evaluator drains the outbox, so every
//! reading is looked at once, and a reading can raise at most one alert.
//! The outbox is mirrored in the store in the same transaction as the
//! readings, so evaluation resumes after a restart where it stopped.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::modules::hypertable::Hypertable;
use crate::modules::registry::Registry;
use crate::shared::context::CallerContext;
use crate::shared::db::models::{
    Alert, AlertId, AlertSeverity, Metadata, OrganizationId, Reading, ReadingId, Sensor, UserId,
};
use crate::shared::db::records::{from_db_time, AlertRow};
use crate::shared::db::schema::{AlertIndexKey, ReadingKey};
use crate::shared::db::{IdSequence, Persistence};
use crate::shared::errors::{AppError, AppResult};

/// Readings committed but not yet checked against thresholds.
#[derive(Debug, Default)]
pub struct EvaluationOutbox {
    queue: Mutex<VecDeque<Reading>>,
    notify: Notify,
}

impl EvaluationOutbox {
    pub async fn push(&self, rows: impl IntoIterator<Item = Reading>) {
        self.queue.lock().await.extend(rows);
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Resolves once readings were pushed since the last drain.
    pub async fn ready(&self) {
        self.notify.notified().await
    }

    async fn take(&self, max: usize) -> Vec<Reading> {
        let mut queue = self.queue.lock().await;
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    /// Puts a batch back at the head, ahead of anything pushed since.
    async fn requeue(&self, rows: Vec<Reading>) {
        let mut queue = self.queue.lock().await;
        for r in rows.into_iter().rev() {
            queue.push_front(r);
        }
    }

    async fn discard_organization(&self, organization_id: &str) {
        self.queue
            .lock()
            .await
            .retain(|r| r.organization_id != organization_id);
    }
}

#[derive(Debug, Default)]
struct AlertTable {
    rows: HashMap<AlertId, Alert>,
    by_state: BTreeSet<AlertIndexKey>,
    by_reading: HashMap<(OrganizationId, ReadingId), AlertId>,
    reading_of: HashMap<AlertId, ReadingId>,
}

impl AlertTable {
    fn index_key(alert: &Alert) -> AlertIndexKey {
        (
            alert.organization_id.clone(),
            alert.acknowledged,
            alert.timestamp,
            alert.id,
        )
    }

    fn insert(&mut self, alert: Alert, reading_id: ReadingId) {
        self.by_state.insert(Self::index_key(&alert));
        self.by_reading
            .insert((alert.organization_id.clone(), reading_id), alert.id);
        self.reading_of.insert(alert.id, reading_id);
        self.rows.insert(alert.id, alert);
    }
}

const EVALUATION_BATCH: usize = 512;

#[derive(Debug, Default)]
pub struct AlertService {
    outbox: EvaluationOutbox,
    table: RwLock<AlertTable>,
    evaluator: Mutex<()>,
    ids: IdSequence,
    store: Persistence,
}

impl AlertService {
    pub fn new() -> Self {
        AlertService::default()
    }

    pub fn with_store(store: Persistence) -> Self {
        AlertService {
            store,
            ..AlertService::default()
        }
    }

    pub fn outbox(&self) -> &EvaluationOutbox {
        &self.outbox
    }

    /// Loads stored alerts and queues the readings still awaiting evaluation.
    /// Run after the hypertable is restored.
    pub async fn restore(&self, table: &Hypertable) -> AppResult<()> {
        let stored = self.store.load(|db| db.load_alerts()).await?;
        let alerts = stored.len();
        {
            let mut t = self.table.write().await;
            for row in stored {
                let (alert, reading_id) = row.into_model()?;
                self.ids.observe(alert.id);
                t.insert(alert, reading_id);
            }
        }

        let pending = self.store.load(|db| db.load_pending()).await?;
        let mut queued = Vec::with_capacity(pending.len());
        let mut vanished = Vec::new();
        for entry in pending {
            let key = ReadingKey {
                id: entry.reading_id,
                timestamp: from_db_time(&entry.timestamp)?,
            };
            match table.get(&entry.organization_id, &key).await? {
                Some(reading) => queued.push(reading),
                None => vanished.push((entry.organization_id, entry.reading_id)),
            }
        }
        if !vanished.is_empty() {
            self.store
                .write(move |db| db.record_evaluations(&[], &vanished))
                .await?;
        }
        log::info!(
            "restored {} alert(s), {} reading(s) awaiting evaluation",
            alerts,
            queued.len()
        );
        if !queued.is_empty() {
            self.outbox.push(queued).await;
        }
        Ok(())
    }

    /// Drains the outbox. Returns how many alerts were raised.
    ///
    /// Each batch is recorded in one store transaction before it becomes
    /// visible. A batch that fails to record goes back on the outbox and
    /// evaluation stops until the next push.
    pub async fn evaluate_pending(&self, registry: &Registry) -> usize {
        let _evaluator = self.evaluator.lock().await;
        let mut raised = 0;
        loop {
            let batch = self.outbox.take(EVALUATION_BATCH).await;
            if batch.is_empty() {
                break;
            }
            match self.evaluate_batch(registry, &batch).await {
                Ok(n) => raised += n,
                Err(e) => {
                    log::error!("threshold evaluation of {} reading(s) failed: {}", batch.len(), e);
                    self.outbox.requeue(batch).await;
                    break;
                }
            }
        }
        if raised > 0 {
            log::info!("threshold evaluation raised {} alert(s)", raised);
        }
        raised
    }

    async fn evaluate_batch(&self, registry: &Registry, batch: &[Reading]) -> AppResult<usize> {
        let mut by_org: HashMap<&str, Vec<&Reading>> = HashMap::new();
        for r in batch {
            by_org.entry(r.organization_id.as_str()).or_default().push(r);
        }

        let mut candidates: Vec<(Alert, ReadingId)> = Vec::new();
        let mut evaluated: Vec<(OrganizationId, ReadingId)> = Vec::with_capacity(batch.len());
        {
            let table = self.table.read().await;
            let mut seen = BTreeSet::new();
            for (org, rows) in by_org {
                let sensors = registry
                    .sensors_in(org, rows.iter().map(|r| r.sensor_id))
                    .await;
                for r in rows {
                    let key = (r.organization_id.clone(), r.id);
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                    evaluated.push(key.clone());
                    if table.by_reading.contains_key(&key) {
                        continue;
                    }
                    match sensors.get(&r.sensor_id) {
                        Some(sensor) => {
                            if let Some(alert) = self.assess(sensor, r) {
                                candidates.push((alert, r.id));
                            }
                        }
                        None => log::debug!(
                            "reading {} has no registered sensor {}, skipping evaluation",
                            r.id,
                            r.sensor_id
                        ),
                    }
                }
            }
        }

        let rows = candidates
            .iter()
            .map(|(alert, reading_id)| AlertRow::from_model(alert, *reading_id))
            .collect::<AppResult<Vec<_>>>()?;
        self.store
            .write(move |db| db.record_evaluations(&rows, &evaluated))
            .await?;

        let raised = candidates.len();
        let mut table = self.table.write().await;
        for (alert, reading_id) in candidates {
            log::warn!(
                "{:?} alert {} for sensor {} of {}: {}",
                alert.severity,
                alert.id,
                alert.sensor_id,
                alert.organization_id,
                alert.message
            );
            table.insert(alert, reading_id);
        }
        Ok(raised)
    }

    fn assess(&self, sensor: &Sensor, reading: &Reading) -> Option<Alert> {
        let bound = sensor.crossed_threshold(reading.value)?;
        let severity = if sensor.outside_physical_range(reading.value) {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let direction = if reading.value > bound { "above" } else { "below" };
        let mut metadata = Metadata::new();
        metadata.insert("reading_id".to_string(), reading.id.to_string());

        Some(Alert {
            id: self.ids.next(),
            organization_id: reading.organization_id.clone(),
            sensor_id: sensor.id,
            timestamp: reading.timestamp,
            severity,
            message: format!(
                "{} reading {} {} is {} threshold {}",
                sensor.name, reading.value, sensor.unit, direction, bound
            ),
            trigger_value: reading.value,
            threshold_value: Some(bound),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            notes: None,
            protocol: reading.protocol,
            metadata,
        })
    }

    /// Newest first, optionally filtered by acknowledgement.
    pub async fn list(
        &self,
        ctx: &CallerContext,
        organization_id: &str,
        acknowledged: Option<bool>,
    ) -> AppResult<Vec<Alert>> {
        ctx.check_organization(organization_id)?;
        let table = self.table.read().await;
        let states: &[bool] = match acknowledged {
            Some(true) => &[true],
            Some(false) => &[false],
            None => &[false, true],
        };

        let mut out = Vec::new();
        for state in states {
            let lower = (organization_id.to_string(), *state, DateTime::<Utc>::MIN_UTC, i64::MIN);
            let upper = (organization_id.to_string(), *state, DateTime::<Utc>::MAX_UTC, i64::MAX);
            out.extend(
                table
                    .by_state
                    .range(lower..=upper)
                    .filter_map(|(.., id)| table.rows.get(id))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        Ok(out)
    }

    pub async fn get(&self, ctx: &CallerContext, id: AlertId) -> AppResult<Alert> {
        let found = self.table.read().await.rows.get(&id).cloned();
        ctx.scope(found, |a| a.organization_id.as_str(), "alert", id)
    }

    /// Open -> Acknowledged. Acknowledging again returns the alert unchanged.
    pub async fn acknowledge(
        &self,
        ctx: &CallerContext,
        id: AlertId,
        actor: &UserId,
        notes: Option<String>,
    ) -> AppResult<Alert> {
        let mut table = self.table.write().await;
        let alert = match table.rows.get(&id) {
            Some(a) if ctx.owns(&a.organization_id) => a,
            _ => return Err(AppError::not_found("alert", id)),
        };
        if alert.acknowledged {
            return Ok(alert.clone());
        }

        let old_key = AlertTable::index_key(alert);
        let mut updated = alert.clone();
        updated.acknowledged = true;
        updated.acknowledged_at = Some(Utc::now());
        updated.acknowledged_by = Some(actor.clone());
        if notes.is_some() {
            updated.notes = notes;
        }
        let reading_id = table.reading_of.get(&id).copied().unwrap_or_default();
        let row = AlertRow::from_model(&updated, reading_id)?;
        self.store.write(move |db| db.upsert_alert(&row)).await?;

        table.rows.insert(id, updated.clone());
        table.by_state.remove(&old_key);
        table.by_state.insert(AlertTable::index_key(&updated));
        log::info!("alert {} acknowledged by {}", id, actor);
        Ok(updated)
    }

    /// Removes a tenant's alerts and its readings still awaiting evaluation.
    /// Waits for a running evaluation to finish first.
    pub async fn purge_organization(&self, organization_id: &str) -> AppResult<usize> {
        let _evaluator = self.evaluator.lock().await;
        self.outbox.discard_organization(organization_id).await;
        let org = organization_id.to_string();
        self.store
            .write(move |db| db.delete_alerts(&org).map(|_| ()))
            .await?;

        let mut table = self.table.write().await;
        let before = table.rows.len();
        table.rows.retain(|_, a| a.organization_id != organization_id);
        table.by_state.retain(|(org, ..)| org != organization_id);
        table.by_reading.retain(|(org, _), _| org != organization_id);
        let AlertTable { rows, reading_of, .. } = &mut *table;
        reading_of.retain(|id, _| rows.contains_key(id));
        Ok(before - table.rows.len())
    }
}
