use crate::store::WorkStore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls
/// back to `info`. Calling this function multiple times is harmless. Worker
/// processes call this themselves after spawn; logging handles are never
/// inherited from the parent.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    dispatched_calls: AtomicU64,
    completed_ok: AtomicU64,
    completed_err: AtomicU64,
    call_timeouts: AtomicU64,
    worker_deaths: AtomicU64,
    stalls: AtomicU64,
    refills: AtomicU64,
    pool_size: AtomicUsize,
    pool_transitions: AtomicU64,
}

impl Telemetry {
    pub fn record_dispatch(&self) {
        self.dispatched_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion_ok(&self) {
        self.completed_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion_err(&self) {
        self.completed_err.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_timeout(&self) {
        self.call_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_death(&self) {
        self.worker_deaths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refill(&self) {
        self.refills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_size(&self, workers: usize) {
        self.pool_size.store(workers, Ordering::Relaxed);
        self.pool_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatched_calls(&self) -> u64 {
        self.dispatched_calls.load(Ordering::Relaxed)
    }

    pub fn completed_ok(&self) -> u64 {
        self.completed_ok.load(Ordering::Relaxed)
    }

    pub fn completed_err(&self) -> u64 {
        self.completed_err.load(Ordering::Relaxed)
    }

    pub fn call_timeouts(&self) -> u64 {
        self.call_timeouts.load(Ordering::Relaxed)
    }

    pub fn worker_deaths(&self) -> u64 {
        self.worker_deaths.load(Ordering::Relaxed)
    }

    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn refills(&self) -> u64 {
        self.refills.load(Ordering::Relaxed)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    pub fn pool_transitions(&self) -> u64 {
        self.pool_transitions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            dispatched_calls: self.dispatched_calls(),
            completed_ok: self.completed_ok(),
            completed_err: self.completed_err(),
            call_timeouts: self.call_timeouts(),
            worker_deaths: self.worker_deaths(),
            stalls: self.stalls(),
            refills: self.refills(),
            pool_size: self.pool_size(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub dispatched_calls: u64,
    pub completed_ok: u64,
    pub completed_err: u64,
    pub call_timeouts: u64,
    pub worker_deaths: u64,
    pub stalls: u64,
    pub refills: u64,
    pub pool_size: usize,
}

/// Spawns a background task that periodically logs scheduler counters plus
/// the store's ready/in-flight gauges.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    store: Arc<dyn WorkStore>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "feedhive::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = telemetry.snapshot();
                    let ready = store.count_ready().await.unwrap_or_default();
                    let in_flight = store.count_in_flight().await.unwrap_or_default();

                    tracing::info!(
                        target: "feedhive::metrics",
                        dispatched = snapshot.dispatched_calls,
                        completed_ok = snapshot.completed_ok,
                        completed_err = snapshot.completed_err,
                        call_timeouts = snapshot.call_timeouts,
                        worker_deaths = snapshot.worker_deaths,
                        stalls = snapshot.stalls,
                        refills = snapshot.refills,
                        pool_size = snapshot.pool_size,
                        store_ready = ready,
                        store_in_flight = in_flight,
                        "runtime metrics snapshot"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{FeedRecord, MemoryWorkStore};
    use tokio::time::timeout;

    #[test]
    fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_dispatch();
        telemetry.record_dispatch();
        telemetry.record_completion_ok();
        telemetry.record_completion_err();
        telemetry.record_call_timeout();
        telemetry.record_worker_death();
        telemetry.record_stall();
        telemetry.record_refill();
        telemetry.record_pool_size(4);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.dispatched_calls, 2);
        assert_eq!(snapshot.completed_ok, 1);
        assert_eq!(snapshot.completed_err, 1);
        assert_eq!(snapshot.call_timeouts, 1);
        assert_eq!(snapshot.worker_deaths, 1);
        assert_eq!(snapshot.stalls, 1);
        assert_eq!(snapshot.refills, 1);
        assert_eq!(snapshot.pool_size, 4);
        assert_eq!(telemetry.pool_transitions(), 1);
    }

    #[tokio::test]
    async fn metrics_reporter_logs_until_shutdown() {
        let telemetry = Arc::new(Telemetry::default());
        let store = Arc::new(MemoryWorkStore::new());
        store.insert(FeedRecord::new(1, 1, "https://a.com/1")).await;

        let shutdown = CancellationToken::new();
        let handle = spawn_metrics_reporter(
            telemetry,
            store,
            shutdown.clone(),
            Duration::from_millis(10),
        );

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
