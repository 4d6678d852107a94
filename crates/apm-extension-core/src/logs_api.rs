//! Lambda Logs API subscription and listener.
//!
//! The extension subscribes to `platform` and `function` log streams and
//! receives batches of log events on a local HTTP listener. Two event kinds
//! matter here: `platform.runtimeDone`, which drives invocation
//! finalization, and `function` lines, which are wrapped into APM log
//! events and appended to the batch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LogsApiError {
    #[error("logs API subscription failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("logs API subscription returned status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
}

/// One event as delivered by the Logs API.
#[derive(Debug, Clone, Deserialize)]
pub struct LambdaLogEvent {
    #[serde(default)]
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub record: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeDoneRecord {
    request_id: String,
    status: String,
}

/// Events the listener forwards to the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogsEvent {
    RuntimeDone { request_id: String, status: String },
    FunctionLog { message: String },
}

/// Subscribes the extension to the Logs API, pointing deliveries at
/// `destination_uri`.
pub async fn subscribe(
    runtime_api: &str,
    extension_id: &str,
    destination_uri: &str,
) -> Result<(), LogsApiError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let body = json!({
        "schemaVersion": "2021-03-18",
        "types": ["platform", "function"],
        "buffering": { "maxItems": 100, "maxBytes": 262_144, "timeoutMs": 25 },
        "destination": { "protocol": "HTTP", "URI": destination_uri },
    });
    let response = client
        .put(format!("http://{runtime_api}/2020-08-15/logs"))
        .header("Lambda-Extension-Identifier", extension_id)
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(LogsApiError::UnexpectedStatus(response.status()));
    }
    Ok(())
}

/// Runs the log-event listener until the token cancels. Each delivery is a
/// JSON array of events; relevant ones are forwarded to `tx`.
pub async fn serve(
    listener: TcpListener,
    tx: mpsc::Sender<LogsEvent>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let router = Router::new().route("/", post(handle_logs)).with_state(tx);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn handle_logs(
    State(tx): State<mpsc::Sender<LogsEvent>>,
    Json(events): Json<Vec<LambdaLogEvent>>,
) -> StatusCode {
    for event in parse_events(events) {
        if tx.send(event).await.is_err() {
            // Controller is gone; the environment is shutting down.
            return StatusCode::OK;
        }
    }
    StatusCode::OK
}

/// Filters a Logs API delivery down to the events the controller acts on.
pub fn parse_events(events: Vec<LambdaLogEvent>) -> Vec<LogsEvent> {
    let mut out = Vec::new();
    for event in events {
        match event.kind.as_str() {
            "platform.runtimeDone" => {
                match serde_json::from_value::<RuntimeDoneRecord>(event.record.clone()) {
                    Ok(record) => out.push(LogsEvent::RuntimeDone {
                        request_id: record.request_id,
                        status: record.status,
                    }),
                    Err(err) => {
                        warn!(%err, "ignoring malformed platform.runtimeDone record")
                    }
                }
            }
            "function" => {
                let message = match event.record {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                out.push(LogsEvent::FunctionLog { message });
            }
            other => debug!(kind = other, "ignoring log event"),
        }
    }
    out
}

/// Wraps a function log line into a single-line APM `log` event, ready for
/// the batch buffer.
pub fn function_log_line(message: &str) -> Vec<u8> {
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64;
    json!({
        "log": {
            "timestamp": timestamp_us,
            "message": message.trim_end_matches('\n'),
        }
    })
    .to_string()
    .into_bytes()
}
