//! Runtime glue: validated configuration, telemetry counters and the
//! metrics reporter, and the driving control loop.

pub mod config;
pub mod runner;
pub mod telemetry;
