//! The head hunter: pulls due candidates from the store into a ready list
//! and yields the next item that is admissible on every dimension.

use crate::admission::dimension::Dimension;
use crate::admission::scoreboard::Scoreboard;
use crate::runtime::config::PollerConfig;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::item::WorkItem;
use crate::store::WorkStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillMode {
    /// Refilled from the store indefinitely.
    Continuous,
    /// Caller supplied an explicit finite id list; exhausts and stays empty.
    Fixed,
}

/// Single-threaded admission scheduler.
///
/// Owns one scoreboard per configured dimension and the ready list; all
/// state changes happen on the control task, so issue/complete pairs are
/// inherently serialized.
pub struct HeadHunter {
    store: Arc<dyn WorkStore>,
    dimensions: Vec<Dimension>,
    scoreboards: Vec<Scoreboard>,
    ready: Vec<WorkItem>,
    mode: RefillMode,
    next_refill_at: Option<Instant>,
    refill_interval: Duration,
    batch_cap: usize,
    rank_limit: usize,
    telemetry: Arc<Telemetry>,
}

impl HeadHunter {
    pub fn new(
        store: Arc<dyn WorkStore>,
        dimensions: Vec<Dimension>,
        config: &PollerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let scoreboards = dimensions.iter().map(Dimension::scoreboard).collect();
        let rank_limit = rank_limit(
            config.refill_interval(),
            config.per_item_min_interval(),
            config.per_source_limit(),
        );
        Self {
            store,
            dimensions,
            scoreboards,
            ready: Vec::new(),
            mode: RefillMode::Continuous,
            next_refill_at: None,
            refill_interval: config.refill_interval(),
            batch_cap: config.refill_batch_cap(),
            rank_limit,
            telemetry,
        }
    }

    /// Replaces the ready list from the store.
    ///
    /// With `explicit` ids the scheduler enters fixed mode: exactly those
    /// items (active, not in flight), and no further refilling once they
    /// are gone. Without, it selects due candidates with per-source rank
    /// limiting and schedules the next automatic refill.
    pub async fn refill(&mut self, explicit: Option<&[i64]>) -> Result<usize> {
        let rows = match explicit {
            Some(ids) => {
                self.mode = RefillMode::Fixed;
                self.store.select_explicit_work(ids).await?
            }
            None => {
                self.mode = RefillMode::Continuous;
                self.store
                    .select_ready_work(self.batch_cap, self.rank_limit)
                    .await?
            }
        };

        self.ready = rows
            .iter()
            .map(|row| WorkItem::from_row(row, &self.dimensions))
            .collect();
        self.next_refill_at = Some(Instant::now() + self.refill_interval);
        self.telemetry.record_refill();
        tracing::info!(
            candidates = self.ready.len(),
            fixed = self.mode == RefillMode::Fixed,
            "ready list refilled"
        );
        Ok(self.ready.len())
    }

    /// Next item admissible on every dimension, already issued on all of
    /// them and marked in-flight in the store; `None` when the list is
    /// empty (or exhausted, in fixed mode) or fully blocked (a stall).
    pub async fn find_work(&mut self) -> Result<Option<WorkItem>> {
        match self.mode {
            RefillMode::Fixed => {
                if self.ready.is_empty() {
                    return Ok(None);
                }
            }
            RefillMode::Continuous => {
                // A list older than the refill interval may contain rows
                // another refill would no longer select; drop it rather
                // than risk issuing stale entries.
                if let Some(due) = self.next_refill_at {
                    if Instant::now() >= due && !self.ready.is_empty() {
                        tracing::debug!(
                            discarded = self.ready.len(),
                            "ready list went stale before it emptied"
                        );
                        self.ready.clear();
                    }
                }
                if self.ready.is_empty() {
                    self.refill(None).await?;
                }
            }
        }

        let mut admitted = None;
        let mut blocked = 0usize;
        for (index, item) in self.ready.iter().enumerate() {
            let safe = self
                .scoreboards
                .iter()
                .zip(item.admission_keys())
                .all(|(board, key)| board.safe(key));
            if safe {
                admitted = Some(index);
                break;
            }
            blocked += 1;
        }

        let Some(index) = admitted else {
            if blocked > 0 {
                self.telemetry.record_stall();
                tracing::debug!(blocked, "no admissible work this cycle");
            }
            return Ok(None);
        };

        let item = self.ready.remove(index);
        for (board, key) in self.scoreboards.iter_mut().zip(item.admission_keys()) {
            board.issue(key);
        }
        self.store.mark_in_flight(item.id(), SystemTime::now()).await?;
        tracing::debug!(id = item.id(), source = item.source_id(), "issued work item");
        Ok(Some(item))
    }

    /// Releases capacity on every dimension for a previously issued item.
    /// Must be called exactly once per item returned by `find_work`.
    pub async fn completed(&mut self, item: &WorkItem) -> Result<()> {
        for (board, key) in self.scoreboards.iter_mut().zip(item.admission_keys()) {
            board.completed(key);
        }
        self.store.mark_not_in_flight(item.id()).await?;
        tracing::debug!(id = item.id(), "work item completed");
        Ok(())
    }

    /// Whether more work may ever come: always in continuous mode, only
    /// while the list is non-empty in fixed mode.
    pub fn have_work(&self) -> bool {
        match self.mode {
            RefillMode::Continuous => true,
            RefillMode::Fixed => !self.ready.is_empty(),
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Time until the next automatic refill is due; `None` in fixed mode
    /// or before the first refill.
    pub fn next_refill_in(&self) -> Option<Duration> {
        if self.mode == RefillMode::Fixed {
            return None;
        }
        self.next_refill_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    fn scoreboard(&self, index: usize) -> &Scoreboard {
        &self.scoreboards[index]
    }
}

/// How many rows one source may contribute to a single batch: the number of
/// refill windows that fit in an item's minimum polling interval, times the
/// per-source concurrency cap, never less than one.
fn rank_limit(
    refill_interval: Duration,
    per_item_min_interval: Duration,
    per_source_limit: usize,
) -> usize {
    let windows = refill_interval.as_secs() / per_item_min_interval.as_secs().max(1);
    ((windows as usize).saturating_mul(per_source_limit)).max(1)
}
