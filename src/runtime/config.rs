use crate::pool::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::pool::worker::WorkerCommand;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_FETCH_OP: &str = "fetch_feed";
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_WAIT_SECS: u64 = 5;
const DEFAULT_REFILL_INTERVAL_SECS: u64 = 60;
const DEFAULT_REFILL_BATCH_CAP: usize = 500;
const DEFAULT_PER_ITEM_MIN_INTERVAL_SECS: u64 = 60;
const DEFAULT_PER_SOURCE_LIMIT: usize = 3;
const DEFAULT_PER_HOST_LIMIT: usize = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Runtime configuration for the polling core.
///
/// All instances must be constructed via [`PollerConfig::builder`] or
/// [`PollerConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    worker_program: String,
    worker_args: Vec<String>,
    worker_count: usize,
    fetch_op: String,
    call_timeout: Duration,
    poll_wait: Duration,
    refill_interval: Duration,
    refill_batch_cap: usize,
    per_item_min_interval: Duration,
    per_source_limit: usize,
    per_host_limit: usize,
    max_frame_bytes: usize,
    metrics_interval: Duration,
    shutdown_grace: Duration,
}

pub struct PollerConfigParams {
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub worker_count: usize,
    pub fetch_op: String,
    pub call_timeout: Duration,
    pub poll_wait: Duration,
    pub refill_interval: Duration,
    pub refill_batch_cap: usize,
    pub per_item_min_interval: Duration,
    pub per_source_limit: usize,
    pub per_host_limit: usize,
    pub max_frame_bytes: usize,
    pub metrics_interval: Duration,
    pub shutdown_grace: Duration,
}

impl PollerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> PollerConfigBuilder {
        PollerConfigBuilder::default()
    }

    pub fn new(params: PollerConfigParams) -> Result<Self> {
        let PollerConfigParams {
            worker_program,
            worker_args,
            worker_count,
            fetch_op,
            call_timeout,
            poll_wait,
            refill_interval,
            refill_batch_cap,
            per_item_min_interval,
            per_source_limit,
            per_host_limit,
            max_frame_bytes,
            metrics_interval,
            shutdown_grace,
        } = params;

        let config = Self {
            worker_program: worker_program.trim().to_owned(),
            worker_args,
            worker_count,
            fetch_op: fetch_op.trim().to_owned(),
            call_timeout,
            poll_wait,
            refill_interval,
            refill_batch_cap,
            per_item_min_interval,
            per_source_limit,
            per_host_limit,
            max_frame_bytes,
            metrics_interval,
            shutdown_grace,
        };

        config.validate()?;
        Ok(config)
    }

    /// Executable spawned for each worker slot.
    pub fn worker_program(&self) -> &str {
        &self.worker_program
    }

    /// Extra arguments passed to the worker executable.
    pub fn worker_args(&self) -> &[String] {
        &self.worker_args
    }

    /// Fixed pool size.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Operation dispatched for each issued work item.
    pub fn fetch_op(&self) -> &str {
        &self.fetch_op
    }

    /// Per-call deadline enforced inside each worker.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Default bound on one control-loop poll wait.
    pub fn poll_wait(&self) -> Duration {
        self.poll_wait
    }

    /// Interval between automatic ready-list refills.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Cap on the number of candidates pulled in one refill.
    pub fn refill_batch_cap(&self) -> usize {
        self.refill_batch_cap
    }

    /// Minimum polling interval any single item can have; feeds the
    /// per-source rank limit.
    pub fn per_item_min_interval(&self) -> Duration {
        self.per_item_min_interval
    }

    /// Concurrency cap per owning source.
    pub fn per_source_limit(&self) -> usize {
        self.per_source_limit
    }

    /// Concurrency cap per target host.
    pub fn per_host_limit(&self) -> usize {
        self.per_host_limit
    }

    /// Cap on one serialized IPC message, either direction.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// How long shutdown waits for in-flight calls before giving up.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Spawn description handed to the pool.
    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.worker_program.clone(),
            args: self.worker_args.clone(),
            call_timeout: self.call_timeout,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_program.is_empty() {
            bail!("worker_program cannot be empty");
        }
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }
        if self.fetch_op.is_empty() {
            bail!("fetch_op cannot be empty");
        }
        if self.call_timeout.is_zero() {
            bail!("call_timeout must be greater than 0");
        }
        if self.poll_wait.is_zero() {
            bail!("poll_wait must be greater than 0");
        }
        if self.refill_interval.is_zero() {
            bail!("refill_interval must be greater than 0");
        }
        if self.refill_batch_cap == 0 {
            bail!("refill_batch_cap must be greater than 0");
        }
        if self.per_item_min_interval.is_zero() {
            bail!("per_item_min_interval must be greater than 0");
        }
        if self.per_source_limit == 0 {
            bail!("per_source_limit must be greater than 0");
        }
        if self.per_host_limit == 0 {
            bail!("per_host_limit must be greater than 0");
        }
        if self.max_frame_bytes == 0 {
            bail!("max_frame_bytes must be greater than 0");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }
        if self.shutdown_grace.is_zero() {
            bail!("shutdown_grace must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PollerConfigBuilder {
    worker_program: Option<String>,
    worker_args: Option<Vec<String>>,
    worker_count: Option<usize>,
    fetch_op: Option<String>,
    call_timeout: Option<Duration>,
    poll_wait: Option<Duration>,
    refill_interval: Option<Duration>,
    refill_batch_cap: Option<usize>,
    per_item_min_interval: Option<Duration>,
    per_source_limit: Option<usize>,
    per_host_limit: Option<usize>,
    max_frame_bytes: Option<usize>,
    metrics_interval: Option<Duration>,
    shutdown_grace: Option<Duration>,
}

impl PollerConfigBuilder {
    pub fn worker_program(mut self, program: impl Into<String>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = Some(args);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn fetch_op(mut self, op: impl Into<String>) -> Self {
        self.fetch_op = Some(op.into());
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = Some(wait);
        self
    }

    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = Some(interval);
        self
    }

    pub fn refill_batch_cap(mut self, cap: usize) -> Self {
        self.refill_batch_cap = Some(cap);
        self
    }

    pub fn per_item_min_interval(mut self, interval: Duration) -> Self {
        self.per_item_min_interval = Some(interval);
        self
    }

    pub fn per_source_limit(mut self, limit: usize) -> Self {
        self.per_source_limit = Some(limit);
        self
    }

    pub fn per_host_limit(mut self, limit: usize) -> Self {
        self.per_host_limit = Some(limit);
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = Some(bytes);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn build(self) -> Result<PollerConfig> {
        let params = PollerConfigParams {
            worker_program: self.worker_program.context("worker_program is required")?,
            worker_args: self.worker_args.unwrap_or_default(),
            worker_count: self.worker_count.context("worker_count is required")?,
            fetch_op: self.fetch_op.unwrap_or_else(|| DEFAULT_FETCH_OP.to_owned()),
            call_timeout: self
                .call_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)),
            poll_wait: self
                .poll_wait
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLL_WAIT_SECS)),
            refill_interval: self
                .refill_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REFILL_INTERVAL_SECS)),
            refill_batch_cap: self.refill_batch_cap.unwrap_or(DEFAULT_REFILL_BATCH_CAP),
            per_item_min_interval: self
                .per_item_min_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PER_ITEM_MIN_INTERVAL_SECS)),
            per_source_limit: self.per_source_limit.unwrap_or(DEFAULT_PER_SOURCE_LIMIT),
            per_host_limit: self.per_host_limit.unwrap_or(DEFAULT_PER_HOST_LIMIT),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            shutdown_grace: self
                .shutdown_grace
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)),
        };

        PollerConfig::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> PollerConfigBuilder {
        PollerConfig::builder()
            .worker_program("feedhive-worker")
            .worker_count(4)
    }

    #[test]
    fn builder_produces_valid_config() {
        let config = base_builder().build().unwrap();
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.fetch_op(), DEFAULT_FETCH_OP);
        assert_eq!(
            config.call_timeout(),
            Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)
        );
        assert_eq!(
            config.refill_interval(),
            Duration::from_secs(DEFAULT_REFILL_INTERVAL_SECS)
        );
        assert_eq!(config.refill_batch_cap(), DEFAULT_REFILL_BATCH_CAP);
        assert_eq!(config.per_source_limit(), DEFAULT_PER_SOURCE_LIMIT);
        assert_eq!(config.per_host_limit(), DEFAULT_PER_HOST_LIMIT);
        assert_eq!(config.max_frame_bytes(), DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(
            config.metrics_interval(),
            telemetry::DEFAULT_METRICS_INTERVAL
        );
    }

    #[test]
    fn overrides_are_honoured() {
        let config = base_builder()
            .fetch_op("probe")
            .call_timeout(Duration::from_secs(3))
            .refill_interval(Duration::from_secs(15))
            .per_source_limit(1)
            .worker_args(vec!["--verbose".into()])
            .build()
            .unwrap();
        assert_eq!(config.fetch_op(), "probe");
        assert_eq!(config.call_timeout(), Duration::from_secs(3));
        assert_eq!(config.refill_interval(), Duration::from_secs(15));
        assert_eq!(config.per_source_limit(), 1);
        assert_eq!(config.worker_args(), ["--verbose".to_string()]);
    }

    #[test]
    fn worker_program_is_required() {
        let err = PollerConfig::builder().worker_count(1).build().unwrap_err();
        assert!(format!("{err}").contains("worker_program"));
    }

    #[test]
    fn worker_count_is_required() {
        let err = base_builder().worker_count(0).build().unwrap_err();
        assert!(format!("{err}").contains("worker_count"));

        let err = PollerConfig::builder()
            .worker_program("feedhive-worker")
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("worker_count"));
    }

    #[test]
    fn validation_catches_invalid_values() {
        let err = base_builder()
            .worker_program("   ")
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("worker_program"));

        let err = base_builder()
            .call_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("call_timeout"));

        let err = base_builder()
            .refill_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("refill_interval"));

        let err = base_builder().refill_batch_cap(0).build().unwrap_err();
        assert!(format!("{err}").contains("refill_batch_cap"));

        let err = base_builder()
            .per_item_min_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("per_item_min_interval"));

        let err = base_builder().per_host_limit(0).build().unwrap_err();
        assert!(format!("{err}").contains("per_host_limit"));

        let err = base_builder().max_frame_bytes(0).build().unwrap_err();
        assert!(format!("{err}").contains("max_frame_bytes"));
    }

    #[test]
    fn worker_command_carries_ipc_settings() {
        let config = base_builder()
            .call_timeout(Duration::from_millis(250))
            .max_frame_bytes(4096)
            .build()
            .unwrap();
        let command = config.worker_command();
        assert_eq!(command.program, "feedhive-worker");
        assert_eq!(command.call_timeout, Duration::from_millis(250));
        assert_eq!(command.max_frame_bytes, 4096);
    }
}
