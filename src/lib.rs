pub mod admission;
pub mod pool;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use admission::dimension::Dimension;
pub use admission::scoreboard::Scoreboard;
pub use pool::harness::{OpRegistry, WorkerHarness};
pub use pool::manager::{CompletedCall, WorkerPool};
pub use pool::protocol::{CallOutcome, CallRequest, CallResponse, ErrorKind};
pub use pool::worker::WorkerCommand;
pub use runtime::config::{PollerConfig, PollerConfigBuilder, PollerConfigParams};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::head_hunter::{HeadHunter, RefillMode};
pub use scheduler::item::WorkItem;
pub use store::memory::MemoryWorkStore;
pub use store::{WorkRow, WorkStore};
