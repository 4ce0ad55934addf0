//! Work-admission scheduling: the ready list, refill policy, and the
//! all-dimensions admission check that decides which feed is polled next.

pub mod head_hunter;
pub mod item;
