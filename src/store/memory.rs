//! In-memory `WorkStore` used by the test suites and as the reference
//! semantics a SQL backend should mirror.

use crate::store::{WorkRow, WorkStore};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::Mutex;

/// One stored feed record.
#[derive(Debug, Clone)]
pub struct FeedRecord {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub active: bool,
    pub enabled: bool,
    pub in_flight: bool,
    pub next_eligible_at: Option<SystemTime>,
}

impl FeedRecord {
    pub fn new(id: i64, source_id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            source_id,
            url: url.into(),
            active: true,
            enabled: true,
            in_flight: false,
            next_eligible_at: None,
        }
    }

    pub fn due_at(mut self, at: SystemTime) -> Self {
        self.next_eligible_at = Some(at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[derive(Default)]
pub struct MemoryWorkStore {
    records: Mutex<HashMap<i64, FeedRecord>>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: FeedRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    pub async fn record(&self, id: i64) -> Option<FeedRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) {
        if let Some(record) = self.records.lock().await.get_mut(&id) {
            record.enabled = enabled;
        }
    }

    async fn select(&self, mut keep: impl FnMut(&FeedRecord) -> bool) -> Vec<WorkRow> {
        let records = self.records.lock().await;
        let mut rows: Vec<WorkRow> = records
            .values()
            .filter(|record| record.active && !record.in_flight && keep(record))
            .map(|record| WorkRow {
                id: record.id,
                source_id: record.source_id,
                url: record.url.clone(),
                next_eligible_at: record.next_eligible_at,
            })
            .collect();
        // `None` due times sort first, then ascending due time, then id.
        rows.sort_by_key(|row| (row.next_eligible_at.is_some(), row.next_eligible_at, row.id));
        rows
    }
}

impl WorkStore for MemoryWorkStore {
    fn select_ready_work<'a>(
        &'a self,
        limit: usize,
        per_partition_rank_limit: usize,
    ) -> BoxFuture<'a, Result<Vec<WorkRow>>> {
        async move {
            let now = SystemTime::now();
            let rows = self
                .select(|record| {
                    record.enabled
                        && record
                            .next_eligible_at
                            .map_or(true, |due| due <= now)
                })
                .await;

            let mut ranks: HashMap<i64, usize> = HashMap::new();
            let mut selected = Vec::new();
            for row in rows {
                let rank = ranks.entry(row.source_id).or_insert(0);
                *rank += 1;
                if *rank > per_partition_rank_limit {
                    continue;
                }
                selected.push(row);
                if selected.len() >= limit {
                    break;
                }
            }
            Ok(selected)
        }
        .boxed()
    }

    fn select_explicit_work<'a>(&'a self, ids: &'a [i64]) -> BoxFuture<'a, Result<Vec<WorkRow>>> {
        async move {
            let rows = self.select(|record| ids.contains(&record.id)).await;
            Ok(rows)
        }
        .boxed()
    }

    fn mark_in_flight<'a>(&'a self, id: i64, _at: SystemTime) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(&id)
                .with_context(|| format!("mark_in_flight: unknown work id {id}"))?;
            record.in_flight = true;
            Ok(())
        }
        .boxed()
    }

    fn mark_not_in_flight<'a>(&'a self, id: i64) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(&id)
                .with_context(|| format!("mark_not_in_flight: unknown work id {id}"))?;
            record.in_flight = false;
            Ok(())
        }
        .boxed()
    }

    fn count_ready<'a>(&'a self) -> BoxFuture<'a, Result<u64>> {
        async move {
            let now = SystemTime::now();
            let records = self.records.lock().await;
            let count = records
                .values()
                .filter(|record| {
                    record.active
                        && record.enabled
                        && !record.in_flight
                        && record.next_eligible_at.map_or(true, |due| due <= now)
                })
                .count();
            Ok(count as u64)
        }
        .boxed()
    }

    fn count_in_flight<'a>(&'a self) -> BoxFuture<'a, Result<u64>> {
        async move {
            let records = self.records.lock().await;
            Ok(records.values().filter(|record| record.in_flight).count() as u64)
        }
        .boxed()
    }
}
