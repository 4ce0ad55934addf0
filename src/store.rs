//! Abstract interface to the persistent store holding candidate work.
//!
//! The scheduler only ever sees this seam; the exact schema lives with the
//! backend. The control process and every worker process must each open
//! their own connection to the real backend; connections are never shared
//! across a process boundary.

pub mod memory;

use anyhow::Result;
use futures::future::BoxFuture;
use std::time::SystemTime;

/// One candidate row as selected from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRow {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    /// Earliest wall-clock time this item is due again; `None` means due
    /// immediately and sorts before any concrete time.
    pub next_eligible_at: Option<SystemTime>,
}

/// Read/write surface the scheduler needs from the store.
///
/// Both selection methods return rows ordered by ascending
/// `next_eligible_at` with `None` first, ties broken by id. The count
/// methods feed observability gauges only, never control decisions.
pub trait WorkStore: Send + Sync {
    /// Active, enabled, not-in-flight, due rows; at most
    /// `per_partition_rank_limit` rows per source and `limit` rows total.
    fn select_ready_work<'a>(
        &'a self,
        limit: usize,
        per_partition_rank_limit: usize,
    ) -> BoxFuture<'a, Result<Vec<WorkRow>>>;

    /// Exactly the given ids, restricted to active rows not already in
    /// flight. Disabled rows are still eligible here: an explicit request
    /// overrides the enabled flag, not the in-flight guard.
    fn select_explicit_work<'a>(&'a self, ids: &'a [i64]) -> BoxFuture<'a, Result<Vec<WorkRow>>>;

    fn mark_in_flight<'a>(&'a self, id: i64, at: SystemTime) -> BoxFuture<'a, Result<()>>;

    fn mark_not_in_flight<'a>(&'a self, id: i64) -> BoxFuture<'a, Result<()>>;

    fn count_ready<'a>(&'a self) -> BoxFuture<'a, Result<u64>>;

    fn count_in_flight<'a>(&'a self) -> BoxFuture<'a, Result<u64>>;
}
