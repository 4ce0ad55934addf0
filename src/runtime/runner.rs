//! The control loop: pulls admissible items from the scheduler, dispatches
//! them to idle workers, and feeds completions back so capacity is released.

use crate::admission::dimension::Dimension;
use crate::pool::manager::{CompletedCall, WorkerPool};
use crate::pool::protocol::CallRequest;
use crate::runtime::config::PollerConfig;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use crate::scheduler::head_hunter::HeadHunter;
use crate::scheduler::item::WorkItem;
use crate::store::WorkStore;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Owns the pieces of a polling run and drives them on a single task.
///
/// All scheduler and pool state is touched from this task only; workers and
/// their reader tasks are the only other moving parts.
pub struct Runner {
    config: PollerConfig,
    store: Arc<dyn WorkStore>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(config: PollerConfig, store: Arc<dyn WorkStore>) -> Self {
        Self {
            config,
            store,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Token that stops the run when cancelled. In-flight calls are given
    /// `shutdown_grace` to finish before workers are reaped.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Polls continuously, refilling the ready list from the store on the
    /// configured interval, until the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        self.drive(None).await
    }

    /// Polls exactly the given items once, then drains and returns.
    pub async fn run_explicit(&self, ids: &[i64]) -> Result<()> {
        self.drive(Some(ids)).await
    }

    /// Runs continuously and treats ctrl-c as a graceful shutdown request.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, draining in-flight calls");
                shutdown.cancel();
            }
        });
        self.run().await
    }

    async fn drive(&self, explicit: Option<&[i64]>) -> Result<()> {
        let fixed = explicit.is_some();
        let dimensions = vec![
            Dimension::by_source(self.config.per_source_limit()),
            Dimension::by_host(self.config.per_host_limit()),
        ];
        let mut scheduler = HeadHunter::new(
            self.store.clone(),
            dimensions,
            &self.config,
            self.telemetry.clone(),
        );
        if let Some(ids) = explicit {
            let selected = scheduler.refill(Some(ids)).await?;
            tracing::info!(requested = ids.len(), selected, "explicit work list loaded");
        }

        let mut pool = WorkerPool::spawn(
            self.config.worker_count(),
            self.config.worker_command(),
            self.telemetry.clone(),
        )?;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<i64>();
        pool.on_completion(self.config.fetch_op(), move |call: CompletedCall| {
            if let Some(kind) = call.outcome.error_kind() {
                tracing::warn!(slot = call.slot, %kind, op = %call.request.op, "call failed");
            }
            match call.request.kwargs.get("id").and_then(Value::as_i64) {
                Some(id) => {
                    // Receiver dropped means the run is already over.
                    let _ = done_tx.send(id);
                }
                None => tracing::error!(slot = call.slot, "completed call carries no item id"),
            }
        });

        let metrics_token = self.shutdown.child_token();
        let metrics = spawn_metrics_reporter(
            self.telemetry.clone(),
            self.store.clone(),
            metrics_token.clone(),
            self.config.metrics_interval(),
        );

        let mut in_flight: HashMap<i64, WorkItem> = HashMap::new();
        let op = self.config.fetch_op().to_string();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            while let Some(slot) = pool.find_available_worker() {
                let Some(item) = scheduler.find_work().await? else {
                    break;
                };
                let request = CallRequest::new(&op)
                    .kwarg("id", item.id())
                    .kwarg("source_id", item.source_id())
                    .kwarg("url", item.url());
                match pool.call(slot, request).await {
                    Ok(()) => {
                        in_flight.insert(item.id(), item);
                    }
                    Err(error) => {
                        tracing::error!(slot, error = format!("{error:#}"), "dispatch failed");
                        scheduler.completed(&item).await?;
                        break;
                    }
                }
            }

            if fixed && in_flight.is_empty() && !scheduler.have_work() {
                tracing::info!("explicit work list exhausted");
                break;
            }

            let wait = scheduler
                .next_refill_in()
                .map_or(self.config.poll_wait(), |r| r.min(self.config.poll_wait()));
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                polled = pool.poll(wait) => {
                    polled?;
                }
            }

            while let Ok(id) = done_rx.try_recv() {
                match in_flight.remove(&id) {
                    Some(item) => scheduler.completed(&item).await?,
                    None => tracing::warn!(item = id, "completion for an unknown item"),
                }
            }
        }

        if let Err(error) = pool.finish(self.config.shutdown_grace()).await {
            tracing::warn!(error = format!("{error:#}"), "pool did not drain cleanly");
        }
        while let Ok(id) = done_rx.try_recv() {
            if let Some(item) = in_flight.remove(&id) {
                scheduler.completed(&item).await?;
            }
        }
        // Anything still tracked never produced a completion; release the
        // rows so a later run can pick them up.
        for item in in_flight.values() {
            self.store.mark_not_in_flight(item.id()).await?;
        }

        metrics_token.cancel();
        let _ = metrics.await;
        tracing::info!(
            completed_ok = self.telemetry.completed_ok(),
            completed_err = self.telemetry.completed_err(),
            "run finished"
        );
        Ok(())
    }
}
