//! The worker pool: owns `N` subprocess workers, multiplexes their response
//! channels through one event stream, and keeps the pool at full strength by
//! respawning dead workers into their old slots.

use crate::pool::protocol::{CallOutcome, CallRequest, ErrorKind};
use crate::pool::worker::{PoolWorker, WorkerCommand, WorkerEvent, WorkerState};
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, ensure, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

/// A finished call as seen by a completion handler: the request exactly as
/// dispatched plus its outcome (which may be a pool-synthesized
/// `worker-died` failure).
#[derive(Debug)]
pub struct CompletedCall {
    pub slot: usize,
    pub request: CallRequest,
    pub outcome: CallOutcome,
}

type CompletionHandler = Box<dyn FnMut(CompletedCall) + Send>;

/// Fixed-size pool of subprocess workers.
///
/// All methods run on the single control task; the only concurrency here is
/// the worker processes themselves and their stdout reader tasks.
pub struct WorkerPool {
    size: usize,
    command: WorkerCommand,
    workers: BTreeMap<usize, PoolWorker>,
    active: usize,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    completions: HashMap<String, CompletionHandler>,
    telemetry: Arc<Telemetry>,
    draining: bool,
}

impl WorkerPool {
    /// Spawns `size` workers, slots `0..size`.
    pub fn spawn(size: usize, command: WorkerCommand, telemetry: Arc<Telemetry>) -> Result<Self> {
        let size = size.max(1);
        let (events_tx, events_rx) = mpsc::channel(size.saturating_mul(4).max(8));

        let mut workers = BTreeMap::new();
        for slot in 0..size {
            let worker = PoolWorker::spawn(slot, &command, events_tx.clone())?;
            workers.insert(slot, worker);
        }
        telemetry.record_pool_size(size);

        Ok(Self {
            size,
            command,
            workers,
            active: 0,
            events_tx,
            events_rx,
            completions: HashMap::new(),
            telemetry,
            draining: false,
        })
    }

    /// Registers the completion handler invoked for every finished call of
    /// the given operation, including synthesized worker-death failures.
    pub fn on_completion(
        &mut self,
        op: impl Into<String>,
        handler: impl FnMut(CompletedCall) + Send + 'static,
    ) {
        self.completions.insert(op.into(), Box::new(handler));
    }

    /// Lowest idle slot, if any. The worker stays in the pool.
    pub fn find_available_worker(&self) -> Option<usize> {
        self.workers
            .values()
            .find(|worker| worker.is_idle() && worker.stdin.is_some())
            .map(|worker| worker.slot)
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of live workers; equals `size()` except transiently while a
    /// dead worker awaits respawn inside `poll`.
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    /// Sends a request to an idle worker and marks it active.
    pub async fn call(&mut self, slot: usize, request: CallRequest) -> Result<()> {
        let max_frame_bytes = self.command.max_frame_bytes;
        let worker = self
            .workers
            .get_mut(&slot)
            .with_context(|| format!("no worker in slot {slot}"))?;
        ensure!(worker.is_idle(), "worker {slot} is not idle");
        let stdin = worker
            .stdin
            .as_mut()
            .with_context(|| format!("worker {slot} channel is closed"))?;

        crate::pool::protocol::write_frame(stdin, &request, max_frame_bytes)
            .await
            .with_context(|| format!("failed to send {:?} to worker {slot}", request.op))?;

        tracing::debug!(slot, op = %request.op, "dispatched call");
        worker.state = WorkerState::Active;
        worker.dispatched = Some(request);
        self.active += 1;
        self.telemetry.record_dispatch();
        Ok(())
    }

    /// Waits up to `wait` for worker activity, then processes everything
    /// that is immediately available. Returns how many events were handled.
    pub async fn poll(&mut self, wait: Duration) -> Result<usize> {
        let first = match timeout(wait, self.events_rx.recv()).await {
            Err(_) => return Ok(0),
            Ok(None) => bail!("worker event channel closed unexpectedly"),
            Ok(Some(event)) => event,
        };

        let mut handled = 1;
        self.handle_event(first).await?;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Polls until no worker is active, then shuts the pool down.
    pub async fn finish(&mut self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        while self.active > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out with {} calls still active", self.active);
            }
            self.poll(remaining).await?;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.close_all(remaining).await
    }

    /// Half-closes every worker's request channel and reaps them all.
    pub async fn close_all(&mut self, wait: Duration) -> Result<()> {
        self.draining = true;
        for worker in self.workers.values_mut() {
            worker.close_stdin();
        }

        let deadline = Instant::now() + wait;
        while !self.workers.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!(
                    "timed out waiting for {} workers to exit",
                    self.workers.len()
                );
            }
            self.poll(remaining).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Response { slot, response } => {
                let Some(worker) = self.workers.get_mut(&slot) else {
                    tracing::warn!(slot, "response from a worker no longer in the pool");
                    return Ok(());
                };
                if worker.state != WorkerState::Active {
                    // A worker writing frames nobody asked for must not
                    // drive completions or telemetry.
                    tracing::warn!(
                        slot,
                        op = %response.op,
                        "dropping unsolicited response from idle worker"
                    );
                    return Ok(());
                }
                worker.state = WorkerState::Idle;
                self.active -= 1;
                // Correlate against the request we actually dispatched; the
                // echoed fields are only a cross-check.
                let request = worker.dispatched.take().unwrap_or_else(|| CallRequest {
                    op: response.op.clone(),
                    args: response.args.clone(),
                    kwargs: response.kwargs.clone(),
                });

                self.record_outcome(&response.outcome);
                self.complete(CompletedCall {
                    slot,
                    request,
                    outcome: response.outcome,
                });
            }
            WorkerEvent::Eof { slot } => {
                let Some(mut worker) = self.workers.remove(&slot) else {
                    return Ok(());
                };
                let was_active = worker.state == WorkerState::Active;
                let dispatched = worker.dispatched.take();
                tracing::warn!(
                    slot,
                    pid = worker.pid,
                    was_active,
                    "worker channel reached end-of-stream"
                );
                worker.reap().await;

                if was_active {
                    self.active -= 1;
                    self.telemetry.record_worker_death();
                    // The in-flight request will never get a real response;
                    // synthesize the failure so capacity is released.
                    if let Some(request) = dispatched {
                        let outcome = CallOutcome::err(
                            ErrorKind::WorkerDied,
                            format!("worker {slot} died while executing {:?}", request.op),
                        );
                        self.record_outcome(&outcome);
                        self.complete(CompletedCall {
                            slot,
                            request,
                            outcome,
                        });
                    }
                } else if !self.draining {
                    self.telemetry.record_worker_death();
                }

                if !self.draining {
                    let replacement =
                        PoolWorker::spawn(slot, &self.command, self.events_tx.clone())
                            .with_context(|| format!("failed to respawn worker slot {slot}"))?;
                    self.workers.insert(slot, replacement);
                    self.telemetry.record_pool_size(self.workers.len());
                }
            }
        }
        Ok(())
    }

    fn record_outcome(&self, outcome: &CallOutcome) {
        match outcome.error_kind() {
            None => self.telemetry.record_completion_ok(),
            Some(ErrorKind::Timeout) => {
                self.telemetry.record_call_timeout();
                self.telemetry.record_completion_err();
            }
            Some(_) => self.telemetry.record_completion_err(),
        }
    }

    fn complete(&mut self, call: CompletedCall) {
        match self.completions.get_mut(&call.request.op) {
            Some(handler) => handler(call),
            None => {
                tracing::debug!(op = %call.request.op, "no completion handler registered");
            }
        }
    }
}
