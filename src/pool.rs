//! Subprocess worker pool: wire protocol, the child-side request harness,
//! parent-side worker handles, and the pool manager that multiplexes them.

pub mod harness;
pub mod manager;
pub mod protocol;
pub mod worker;
