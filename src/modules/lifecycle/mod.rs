//! Background lifecycle policies and the workers that drive them.
//!
//! Each policy is single-flight: a tick that arrives while the previous pass
//! is still running is coalesced, not queued. Passes only stop between
//! chunks, never in the middle of one.

pub mod compression;
pub mod retention;

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::TelemetryEngine;
use crate::shared::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PassOutcome<R = PassReport> {
    Completed(R),
    /// Another pass of the same policy was already running.
    Coalesced,
    /// The storage capabilities detected at startup exclude this policy.
    Unsupported,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub policy: &'static str,
    pub eligible: usize,
    pub processed: usize,
    pub rows: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
    /// Stopped early by shutdown; the rest is picked up by the next pass.
    pub cancelled: bool,
}

impl PassReport {
    pub fn new(policy: &'static str, eligible: usize) -> Self {
        PassReport {
            policy,
            eligible,
            ..PassReport::default()
        }
    }
}

/// Deadline and shutdown signal for one pass, consulted between chunks.
pub struct PassBudget<'a> {
    policy: &'static str,
    deadline: Instant,
    timeout: Duration,
    cancel: &'a CancellationToken,
}

impl<'a> PassBudget<'a> {
    pub fn new(policy: &'static str, timeout: Duration, cancel: &'a CancellationToken) -> Self {
        PassBudget {
            policy,
            deadline: Instant::now() + timeout,
            timeout,
            cancel,
        }
    }

    /// `Ok(false)` on shutdown, `PolicyFailure` once past the deadline.
    pub fn proceed(&self) -> AppResult<bool> {
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        if Instant::now() >= self.deadline {
            return Err(AppError::PolicyFailure {
                policy: self.policy,
                message: format!("pass exceeded {}s", self.timeout.as_secs()),
            });
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct SingleFlight(Mutex<()>);

impl SingleFlight {
    pub fn try_enter(&self) -> Option<MutexGuard<'_, ()>> {
        self.0.try_lock().ok()
    }

    /// Waits for a running pass to finish and keeps the next one out.
    pub async fn wait(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Owns the background workers: retention, compression, aggregate refresh
/// and alert evaluation.
pub struct PolicyScheduler {
    engine: Arc<TelemetryEngine>,
    cancel: CancellationToken,
}

impl PolicyScheduler {
    pub fn new(engine: Arc<TelemetryEngine>, cancel: CancellationToken) -> Self {
        PolicyScheduler { engine, cancel }
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let cfg = self.engine.configs().lifecycle.clone();
        let mut handles = Vec::new();

        let engine = Arc::clone(&self.engine);
        handles.push(tokio::spawn(periodic(
            "retention",
            Duration::from_secs(cfg.retention_schedule_secs),
            self.cancel.clone(),
            move |cancel| {
                let engine = Arc::clone(&engine);
                async move { engine.run_retention_pass_at(Utc::now(), &cancel).await }
            },
        )));

        let engine = Arc::clone(&self.engine);
        handles.push(tokio::spawn(periodic(
            "compression",
            Duration::from_secs(cfg.compression_schedule_secs),
            self.cancel.clone(),
            move |cancel| {
                let engine = Arc::clone(&engine);
                async move { engine.run_compression_pass_at(Utc::now(), &cancel).await }
            },
        )));

        let engine = Arc::clone(&self.engine);
        handles.push(tokio::spawn(periodic(
            "aggregate refresh",
            Duration::from_secs(cfg.aggregate_refresh_secs),
            self.cancel.clone(),
            move |_| {
                let engine = Arc::clone(&engine);
                async move { engine.refresh_aggregates_at(Utc::now()).await }
            },
        )));

        handles.push(tokio::spawn(evaluate_alerts(
            Arc::clone(&self.engine),
            self.cancel.clone(),
        )));
        handles
    }
}

async fn periodic<F, Fut, R>(policy: &'static str, period: Duration, cancel: CancellationToken, pass: F)
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = AppResult<PassOutcome<R>>>,
    R: std::fmt::Debug,
{
    let mut ticker = interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    log::info!("{} worker started, every {}s", policy, period.as_secs());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match pass(cancel.clone()).await {
            Ok(PassOutcome::Completed(report)) => log::debug!("{} pass finished: {:?}", policy, report),
            Ok(PassOutcome::Coalesced) => log::debug!("{} pass still running, tick coalesced", policy),
            Ok(PassOutcome::Unsupported) => {
                log::warn!("{} not supported by this storage, worker exiting", policy);
                break;
            }
            Err(e) => log::error!("{} pass failed, retrying next tick: {}", policy, e),
        }
    }
    log::info!("{} worker stopped", policy);
}

async fn evaluate_alerts(engine: Arc<TelemetryEngine>, cancel: CancellationToken) {
    log::info!("alert evaluator started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = engine.alerts().outbox().ready() => {}
        }
        engine.evaluate_alerts().await;
    }
    // Readings committed before shutdown still get evaluated.
    engine.evaluate_alerts().await;
    log::info!("alert evaluator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_refused_while_first_runs() {
        let flight = SingleFlight::default();
        let guard = flight.try_enter();
        assert!(guard.is_some());
        assert!(flight.try_enter().is_none());
        drop(guard);
        assert!(flight.try_enter().is_some());
    }

    #[tokio::test]
    async fn waiting_holds_passes_out() {
        let flight = SingleFlight::default();
        let held = flight.wait().await;
        assert!(flight.try_enter().is_none());
        drop(held);
        assert!(flight.try_enter().is_some());
    }

    #[tokio::test]
    async fn budget_reports_timeout_as_policy_failure() {
        let cancel = CancellationToken::new();
        let budget = PassBudget::new("retention", Duration::ZERO, &cancel);
        let err = budget.proceed().unwrap_err();
        assert_eq!(err.kind(), crate::shared::errors::ErrorType::PolicyFailure);

        let roomy = PassBudget::new("retention", Duration::from_secs(60), &cancel);
        assert!(roomy.proceed().unwrap());
        cancel.cancel();
        assert!(!roomy.proceed().unwrap());
    }
}
