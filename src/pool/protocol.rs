//! Wire contract between the pool and its worker processes.
//!
//! One JSON message per line in each direction over the child's stdio, both
//! directions bounded by a configurable frame size. Requests name an
//! operation plus positional and keyword arguments; responses echo all three
//! and carry either a result value or a structured error descriptor.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};

/// Default cap on a single serialized message.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Why a call failed, as carried in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The operation itself failed; the worker stays usable.
    Application,
    /// The operation exceeded its deadline; the worker stays usable.
    Timeout,
    /// The requested operation is not in the worker's registry.
    UnknownOperation,
    /// Synthesized by the pool when a worker dies mid-call; never sent by a
    /// worker itself.
    WorkerDied,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Application => "application",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnknownOperation => "unknown-operation",
            ErrorKind::WorkerDied => "worker-died",
        };
        f.write_str(name)
    }
}

/// One dispatched call: operation name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub op: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallRequest {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Success value or error descriptor inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallOutcome {
    Err {
        error_kind: ErrorKind,
        error_message: String,
    },
    Ok {
        result: Value,
    },
}

impl CallOutcome {
    pub fn ok(result: impl Into<Value>) -> Self {
        CallOutcome::Ok {
            result: result.into(),
        }
    }

    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        CallOutcome::Err {
            error_kind: kind,
            error_message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            CallOutcome::Err { error_kind, .. } => Some(*error_kind),
            CallOutcome::Ok { .. } => None,
        }
    }
}

/// Response envelope: the echoed request plus the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub op: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

impl CallResponse {
    pub fn for_request(request: &CallRequest, outcome: CallOutcome) -> Self {
        Self {
            op: request.op.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
            outcome,
        }
    }
}

/// Writes one newline-terminated JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message).context("failed to serialize frame")?;
    if frame.len() > max_frame_bytes {
        bail!(
            "outgoing frame of {} bytes exceeds the {} byte limit",
            frame.len(),
            max_frame_bytes,
        );
    }
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one newline-terminated JSON frame.
///
/// Returns `Ok(None)` on a clean end-of-stream. A frame larger than the cap
/// or an end-of-stream in the middle of a frame is an error; the peer is
/// considered gone.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<T>>
where
    R: AsyncRead + AsyncBufRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(max_frame_bytes as u64 + 1);
    let read = limited.read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max_frame_bytes {
            bail!(
                "incoming frame exceeds the {} byte limit",
                max_frame_bytes
            );
        }
        bail!("stream ended in the middle of a frame");
    }
    let message = serde_json::from_slice(&buf).context("failed to decode frame")?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, BufReader};

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut client, server) = duplex(4096);
        let mut reader = BufReader::new(server);

        let request = CallRequest::new("fetch_feed")
            .arg(7)
            .kwarg("url", "https://a.com/feed");
        write_frame(&mut client, &request, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();

        let decoded: CallRequest = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .expect("one frame was written");
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = BufReader::new(server);

        let frame: Option<CallRequest> = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_on_both_sides() {
        let big = CallRequest::new("ping").kwarg("blob", "x".repeat(256));
        let (mut client, server) = duplex(4096);
        let err = write_frame(&mut client, &big, 64).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");

        let mut reader = BufReader::new(server);
        write_frame(&mut client, &big, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        let err = read_frame::<_, CallRequest>(&mut reader, 64)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn outcome_serialization_is_distinguishable() {
        let ok = CallOutcome::ok(json!({"status": 200}));
        let err = CallOutcome::err(ErrorKind::Timeout, "deadline exceeded");

        let ok_json = serde_json::to_value(&ok).unwrap();
        let err_json = serde_json::to_value(&err).unwrap();
        assert!(ok_json.get("result").is_some());
        assert_eq!(err_json["error_kind"], "timeout");

        let back: CallOutcome = serde_json::from_value(err_json).unwrap();
        assert_eq!(back.error_kind(), Some(ErrorKind::Timeout));
        let back: CallOutcome = serde_json::from_value(ok_json).unwrap();
        assert!(back.is_ok());
    }

    #[test]
    fn response_echoes_the_request() {
        let request = CallRequest::new("sleep_ms").arg(10);
        let response = CallResponse::for_request(&request, CallOutcome::ok(Value::Null));
        assert_eq!(response.op, "sleep_ms");
        assert_eq!(response.args, request.args);
        assert!(response.outcome.is_ok());
    }
}
