//! Parent-side view of one worker subprocess.
//!
//! Each worker is spawned with piped stdin/stdout; a dedicated task drains
//! its stdout and forwards decoded responses (or the end-of-stream marker)
//! into the pool's event channel. The write side stays with the pool so a
//! half-close signals shutdown to the child.

use crate::pool::harness::{CALL_TIMEOUT_ENV, MAX_FRAME_BYTES_ENV};
use crate::pool::protocol::{read_frame, CallRequest, CallResponse};
use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How a worker subprocess is launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Something a worker channel produced.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// One decoded response frame.
    Response { slot: usize, response: CallResponse },
    /// The channel reached end-of-stream; the worker is gone.
    Eof { slot: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Idle,
    Active,
}

pub(crate) struct PoolWorker {
    pub(crate) slot: usize,
    pub(crate) pid: u32,
    pub(crate) state: WorkerState,
    /// The request currently executing, kept for request → response
    /// correlation and for synthesizing a failure if the worker dies.
    pub(crate) dispatched: Option<CallRequest>,
    /// `None` once the write side has been half-closed for shutdown.
    pub(crate) stdin: Option<ChildStdin>,
    child: Child,
    reader: JoinHandle<()>,
}

impl PoolWorker {
    /// Spawns a fresh worker process into `slot` and starts its reader task.
    ///
    /// The child inherits nothing but its configuration environment; any
    /// connection it needs (store, HTTP) must be opened after spawn, inside
    /// the child.
    pub(crate) fn spawn(
        slot: usize,
        command: &WorkerCommand,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env(
                CALL_TIMEOUT_ENV,
                command.call_timeout.as_millis().to_string(),
            )
            .env(MAX_FRAME_BYTES_ENV, command.max_frame_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn worker {:?}", command.program))?;

        let stdin = child
            .stdin
            .take()
            .context("spawned worker has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("spawned worker has no stdout pipe")?;
        let pid = child.id().unwrap_or_default();

        let reader = tokio::spawn(read_responses(
            slot,
            stdout,
            command.max_frame_bytes,
            events,
        ));

        tracing::info!(slot, pid, "worker spawned");

        Ok(Self {
            slot,
            pid,
            state: WorkerState::Idle,
            dispatched: None,
            stdin: Some(stdin),
            child,
            reader,
        })
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Half-closes the request channel so the child drains and exits.
    pub(crate) fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Consumes the handle after end-of-stream, waiting briefly for the
    /// child to finish exiting before it is dropped (and force-killed).
    pub(crate) async fn reap(mut self) {
        self.reader.abort();
        self.close_stdin();
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(slot = self.slot, pid = self.pid, %status, "worker exited");
            }
            Ok(Err(err)) => {
                tracing::warn!(slot = self.slot, error = %err, "failed to reap worker");
            }
            Err(_) => {
                tracing::warn!(
                    slot = self.slot,
                    pid = self.pid,
                    "worker did not exit promptly; killing"
                );
            }
        }
    }
}

impl Drop for PoolWorker {
    fn drop(&mut self) {
        // Already-exited children make this a no-op; otherwise kill_on_drop
        // reaps the process in the background.
        let _ = self.child.start_kill();
        self.reader.abort();
    }
}

async fn read_responses(
    slot: usize,
    stdout: ChildStdout,
    max_frame_bytes: usize,
    events: mpsc::Sender<WorkerEvent>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame::<_, CallResponse>(&mut reader, max_frame_bytes).await {
            Ok(Some(response)) => {
                if events
                    .send(WorkerEvent::Response { slot, response })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send(WorkerEvent::Eof { slot }).await;
                return;
            }
            Err(err) => {
                // Undecodable output is indistinguishable from a dead peer.
                tracing::warn!(slot, error = %err, "worker channel corrupted; treating as dead");
                let _ = events.send(WorkerEvent::Eof { slot }).await;
                return;
            }
        }
    }
}
