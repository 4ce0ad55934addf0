//! Child-side worker loop.
//!
//! A worker process reads one request frame at a time from stdin, resolves
//! the operation against a closed registry, runs it under a deadline, and
//! writes the response envelope to stdout. Operation failures, timeouts,
//! unknown names, and handler panics all become ordinary error responses;
//! only an unserializable or unwritable response kills the process.

use crate::pool::protocol::{
    read_frame, write_frame, CallOutcome, CallRequest, CallResponse, ErrorKind,
    DEFAULT_MAX_FRAME_BYTES,
};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::time::timeout;

/// Environment variable carrying the per-call deadline in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "FEEDHIVE_CALL_TIMEOUT_MS";
/// Environment variable carrying the frame-size cap in bytes.
pub const MAX_FRAME_BYTES_ENV: &str = "FEEDHIVE_MAX_FRAME_BYTES";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type OpHandler =
    Arc<dyn Fn(Vec<Value>, Map<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Closed set of operations a worker will execute.
///
/// Names not present here are rejected with an `unknown-operation` error
/// response; there is no dynamic dispatch beyond this table.
#[derive(Default, Clone)]
pub struct OpRegistry {
    handlers: HashMap<String, OpHandler>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(
            name.into(),
            Arc::new(move |args, kwargs| handler(args, kwargs).boxed()),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    fn get(&self, name: &str) -> Option<&OpHandler> {
        self.handlers.get(name)
    }
}

/// Request/response loop run inside a worker process.
pub struct WorkerHarness {
    registry: OpRegistry,
    call_timeout: Duration,
    max_frame_bytes: usize,
}

impl WorkerHarness {
    pub fn new(registry: OpRegistry, call_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            registry,
            call_timeout,
            max_frame_bytes,
        }
    }

    /// Builds a harness configured from the environment variables the pool
    /// sets at spawn time, falling back to defaults when absent.
    pub fn from_env(registry: OpRegistry) -> Result<Self> {
        let call_timeout = match std::env::var(CALL_TIMEOUT_ENV) {
            Ok(raw) => Duration::from_millis(
                raw.parse::<u64>()
                    .with_context(|| format!("{CALL_TIMEOUT_ENV} must be an integer, got {raw:?}"))?,
            ),
            Err(_) => DEFAULT_CALL_TIMEOUT,
        };
        let max_frame_bytes = match std::env::var(MAX_FRAME_BYTES_ENV) {
            Ok(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("{MAX_FRAME_BYTES_ENV} must be an integer, got {raw:?}"))?,
            Err(_) => DEFAULT_MAX_FRAME_BYTES,
        };
        Ok(Self::new(registry, call_timeout, max_frame_bytes))
    }

    /// Serves requests over the process's own stdio until stdin closes.
    pub async fn run(self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();
        self.serve(BufReader::new(stdin), stdout).await
    }

    /// Serves requests over an arbitrary channel until end-of-stream.
    pub async fn serve<R, W>(self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!(
            ops = ?self.registry.names(),
            call_timeout_ms = self.call_timeout.as_millis() as u64,
            "worker harness ready"
        );

        loop {
            let request: Option<CallRequest> =
                read_frame(&mut reader, self.max_frame_bytes).await?;
            let Some(request) = request else {
                tracing::info!("request channel closed; worker exiting");
                break;
            };

            let response = self.execute(request).await;
            // A response we cannot serialize or deliver is a channel-level
            // failure; the pool will observe end-of-stream and replace us.
            write_frame(&mut writer, &response, self.max_frame_bytes)
                .await
                .context("failed to deliver response")?;
        }

        Ok(())
    }

    async fn execute(&self, request: CallRequest) -> CallResponse {
        let Some(handler) = self.registry.get(&request.op) else {
            tracing::warn!(op = %request.op, "rejected unregistered operation");
            return CallResponse::for_request(
                &request,
                CallOutcome::err(
                    ErrorKind::UnknownOperation,
                    format!("operation {:?} is not registered", request.op),
                ),
            );
        };

        let call = handler(request.args.clone(), request.kwargs.clone());
        let guarded = std::panic::AssertUnwindSafe(call).catch_unwind();

        let outcome = match timeout(self.call_timeout, guarded).await {
            Err(_) => {
                tracing::warn!(
                    op = %request.op,
                    deadline_ms = self.call_timeout.as_millis() as u64,
                    "operation exceeded its deadline"
                );
                CallOutcome::err(
                    ErrorKind::Timeout,
                    format!(
                        "operation {:?} exceeded its {}ms deadline",
                        request.op,
                        self.call_timeout.as_millis(),
                    ),
                )
            }
            Ok(Err(panic_payload)) => {
                let message = panic_message(panic_payload.as_ref());
                tracing::error!(op = %request.op, panic = %message, "operation panicked");
                CallOutcome::err(
                    ErrorKind::Application,
                    format!("operation {:?} panicked: {message}", request.op),
                )
            }
            Ok(Ok(Err(error))) => {
                tracing::debug!(op = %request.op, error = %error, "operation failed");
                CallOutcome::err(ErrorKind::Application, format!("{error:#}"))
            }
            Ok(Ok(Ok(value))) => CallOutcome::ok(value),
        };

        CallResponse::for_request(&request, outcome)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt, BufReader};

    fn test_registry() -> OpRegistry {
        let mut registry = OpRegistry::new();
        registry.register("ping", |args, _kwargs| async move {
            Ok(json!({ "pong": true, "echo": args }))
        });
        registry.register("sleep_ms", |args, _kwargs| async move {
            let millis = args
                .first()
                .and_then(Value::as_u64)
                .context("sleep_ms requires a millisecond count")?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!({ "slept_ms": millis }))
        });
        registry.register("raise", |_args, _kwargs| async move {
            anyhow::bail!("requested failure")
        });
        registry.register("blow_up", |_args, _kwargs| async move {
            panic!("handler exploded");
        });
        registry
    }

    async fn start_harness(
        call_timeout: Duration,
    ) -> (
        tokio::io::DuplexStream,
        BufReader<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (to_worker, worker_in) = duplex(64 * 1024);
        let (worker_out, from_worker) = duplex(64 * 1024);
        let harness = WorkerHarness::new(test_registry(), call_timeout, DEFAULT_MAX_FRAME_BYTES);
        let task =
            tokio::spawn(async move { harness.serve(BufReader::new(worker_in), worker_out).await });
        (to_worker, BufReader::new(from_worker), task)
    }

    async fn roundtrip(
        to_worker: &mut tokio::io::DuplexStream,
        from_worker: &mut BufReader<tokio::io::DuplexStream>,
        request: &CallRequest,
    ) -> CallResponse {
        write_frame(to_worker, request, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        read_frame(from_worker, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .expect("harness should respond")
    }

    #[tokio::test]
    async fn responds_and_echoes_the_request() {
        let (mut tx, mut rx, task) = start_harness(Duration::from_secs(1)).await;
        let request = CallRequest::new("ping").arg(3).kwarg("id", 12);

        let response = roundtrip(&mut tx, &mut rx, &request).await;
        assert_eq!(response.op, "ping");
        assert_eq!(response.kwargs["id"], 12);
        assert!(response.outcome.is_ok());

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_operations_are_rejected_not_fatal() {
        let (mut tx, mut rx, task) = start_harness(Duration::from_secs(1)).await;

        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("rm_rf")).await;
        assert_eq!(
            response.outcome.error_kind(),
            Some(ErrorKind::UnknownOperation)
        );

        // Still serving.
        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("ping")).await;
        assert!(response.outcome.is_ok());

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn operation_errors_leave_the_worker_usable() {
        let (mut tx, mut rx, task) = start_harness(Duration::from_secs(1)).await;

        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("raise")).await;
        assert_eq!(response.outcome.error_kind(), Some(ErrorKind::Application));
        match &response.outcome {
            CallOutcome::Err { error_message, .. } => {
                assert!(error_message.contains("requested failure"));
            }
            CallOutcome::Ok { .. } => panic!("expected an error outcome"),
        }

        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("ping")).await;
        assert!(response.outcome.is_ok());

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn deadline_cuts_off_a_slow_operation() {
        let (mut tx, mut rx, task) = start_harness(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        let response =
            roundtrip(&mut tx, &mut rx, &CallRequest::new("sleep_ms").arg(5_000)).await;
        let elapsed = started.elapsed();

        assert_eq!(response.outcome.error_kind(), Some(ErrorKind::Timeout));
        assert!(
            elapsed < Duration::from_millis(2_000),
            "timeout took {elapsed:?}, expected roughly the 50ms deadline"
        );

        // Back to idle and accepting work immediately.
        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("ping")).await;
        assert!(response.outcome.is_ok());

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_panics_become_application_errors() {
        let (mut tx, mut rx, task) = start_harness(Duration::from_secs(1)).await;

        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("blow_up")).await;
        assert_eq!(response.outcome.error_kind(), Some(ErrorKind::Application));
        match &response.outcome {
            CallOutcome::Err { error_message, .. } => {
                assert!(error_message.contains("handler exploded"));
            }
            CallOutcome::Ok { .. } => panic!("expected an error outcome"),
        }

        let response = roundtrip(&mut tx, &mut rx, &CallRequest::new("ping")).await;
        assert!(response.outcome.is_ok());

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn garbage_on_the_channel_is_fatal() {
        let (mut tx, _rx, task) = start_harness(Duration::from_secs(1)).await;
        tx.write_all(b"not json\n").await.unwrap();
        tx.flush().await.unwrap();

        let result = task.await.unwrap();
        assert!(result.is_err());
    }
}
