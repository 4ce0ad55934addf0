//! The stock feedhive worker binary.
//!
//! Spawned by the pool with one request on stdin per line; each HTTP client
//! is built inside this process after spawn, nothing is inherited from the
//! parent beyond the configuration environment variables.

use anyhow::{bail, Context, Result};
use feedhive::pool::harness::{OpRegistry, WorkerHarness};
use feedhive::runtime::telemetry::init_tracing;
use serde_json::{json, Map, Value};
use std::time::Duration;

fn kwarg_str<'a>(kwargs: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    kwargs
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing or non-string kwarg {key:?}"))
}

async fn ping(_args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
    Ok(json!("pong"))
}

/// Sleeps for the requested number of milliseconds. Used to exercise the
/// per-call deadline.
async fn sleep_ms(args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
    let millis = args
        .first()
        .or_else(|| kwargs.get("ms"))
        .and_then(Value::as_u64)
        .context("sleep_ms needs a millisecond count")?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(json!(millis))
}

/// Always fails, with the caller-supplied message if one was given.
async fn raise(args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
    let message = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("raise was called");
    bail!("{message}");
}

/// Kills the process without writing a response. The pool sees a dead
/// worker and synthesizes a worker-died completion for the pending call.
async fn halt(_args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
    tracing::warn!("halt requested, exiting without a response");
    std::process::exit(1);
}

/// Fetches one feed URL and reports status plus body size.
async fn fetch_feed(_args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
    let id = kwargs
        .get("id")
        .and_then(Value::as_i64)
        .context("missing or non-integer kwarg \"id\"")?;
    let url = kwarg_str(&kwargs, "url")?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("feedhive/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .with_context(|| format!("failed to read body from {url}"))?;

    tracing::info!(item = id, %url, status, bytes = body.len(), "feed fetched");
    Ok(json!({
        "id": id,
        "status": status,
        "bytes": body.len(),
    }))
}

fn registry() -> OpRegistry {
    let mut registry = OpRegistry::new();
    registry.register("ping", ping);
    registry.register("sleep_ms", sleep_ms);
    registry.register("raise", raise);
    registry.register("halt", halt);
    registry.register("fetch_feed", fetch_feed);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    WorkerHarness::from_env(registry())?.run().await
}
