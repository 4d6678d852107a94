//! Agent-facing intake server.
//!
//! In-process APM agents talk to the extension exactly like they would talk
//! to an APM Server: ndjson event payloads on `/intake/v2/events`, plus a
//! handshake on `/register/transaction` that announces the root transaction
//! of the current invocation before any event is flushed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchError};
use crate::codec::{self, ApmData};
use crate::forwarder::{Forwarder, ForwarderError};

const MAX_INTAKE_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Signals the receiver publishes for the lifecycle controller, so
/// `runtimeDone` processing can wait out an agent flush that is still in
/// flight.
#[derive(Default)]
pub struct IntakeActivity {
    flushed: AtomicBool,
    notify: Notify,
}

impl IntakeActivity {
    /// Called when the agent marks a payload with `?flushed=true`: it has
    /// sent everything it will send for the current invocation.
    pub fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Clears the flushed flag at the start of a new invocation.
    pub fn begin_invocation(&self) {
        self.flushed.store(false, Ordering::Release);
    }

    /// Waits until the agent signalled its final flush, or until `grace`
    /// elapses. Returns true when the flush signal arrived.
    pub async fn wait_for_flush(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.flushed.load(Ordering::Acquire) {
                return true;
            }
            let notified = self.notify.notified();
            if self.flushed.load(Ordering::Acquire) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.flushed.load(Ordering::Acquire);
            }
        }
    }
}

#[derive(Clone)]
pub struct ReceiverState {
    pub forwarder: Forwarder,
    pub batch: Arc<Batch>,
    pub activity: Arc<IntakeActivity>,
}

pub fn router(state: ReceiverState, receiver_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/intake/v2/events", post(intake))
        .route("/register/transaction", post(register_transaction))
        .layer(TimeoutLayer::new(receiver_timeout))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_INTAKE_BODY_BYTES))
        .with_state(state)
}

/// Serves the intake API until the token cancels.
pub async fn serve(
    listener: TcpListener,
    state: ReceiverState,
    receiver_timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state, receiver_timeout))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health() -> Response {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") })).into_response()
}

async fn intake(
    State(state): State<ReceiverState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_encoding = content_encoding(&headers);
    if !codec::is_supported_encoding(&content_encoding) {
        return log_and_respond(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported content encoding: {content_encoding:?}"),
        );
    }

    if params.get("flushed").map(String::as_str) == Some("true") {
        state.activity.mark_flushed();
    }
    if body.is_empty() {
        // Flush signal or agent probe, nothing to forward.
        return StatusCode::ACCEPTED.into_response();
    }

    let receipt = match state
        .forwarder
        .enqueue(ApmData {
            data: body,
            content_encoding,
        })
        .await
    {
        Ok(receipt) => receipt,
        Err(err) => return log_and_respond(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    };

    // Answer with the batch's verdict, not the channel's: a full batch is a
    // retriable refusal, missing metadata and decode problems are the
    // agent's to fix.
    match receipt.wait().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(ForwarderError::Batch(err)) => {
            let status = batch_error_status(&err);
            log_and_respond(status, err.to_string())
        }
        Err(err) => log_and_respond(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

/// Status mapping for append failures: full batch is retriable, bad input
/// is the agent's fault.
fn batch_error_status(err: &BatchError) -> StatusCode {
    match err {
        BatchError::BatchFull => StatusCode::SERVICE_UNAVAILABLE,
        BatchError::Codec(codec::CodecError::InvalidEncoding(_)) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        BatchError::MetadataUnavailable
        | BatchError::UnknownInvocation(_)
        | BatchError::Codec(_) => StatusCode::BAD_REQUEST,
    }
}

async fn register_transaction(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = ApmData {
        data: body,
        content_encoding: content_encoding(&headers),
    };
    let raw = match payload.into_uncompressed() {
        Ok(raw) => raw,
        Err(codec::CodecError::InvalidEncoding(enc)) => {
            return log_and_respond(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported content encoding: {enc:?}"),
            );
        }
        Err(err) => {
            return log_and_respond(
                StatusCode::BAD_REQUEST,
                format!("failed to decode handshake body: {err}"),
            );
        }
    };

    let Some(handshake) = parse_handshake(&raw) else {
        return log_and_respond(
            StatusCode::BAD_REQUEST,
            "malformed transaction registration body".to_string(),
        );
    };

    // Capture metadata now: if the function dies before the agent flushes,
    // the proxy transaction still needs a metadata line to ship under.
    state.batch.capture_metadata(handshake.metadata).await;
    match state
        .batch
        .on_agent_init(&handshake.transaction_id, &handshake.trace_id)
        .await
    {
        Ok(()) => {
            debug!(
                transaction_id = %handshake.transaction_id,
                "agent announced root transaction"
            );
            StatusCode::ACCEPTED.into_response()
        }
        Err(err @ BatchError::UnknownInvocation(_)) => {
            log_and_respond(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err) => log_and_respond(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

struct Handshake<'a> {
    metadata: &'a [u8],
    transaction_id: String,
    trace_id: String,
}

/// Handshake bodies are two ndjson lines: metadata, then a partial
/// transaction carrying `transaction.id` and `transaction.trace_id`.
fn parse_handshake(raw: &[u8]) -> Option<Handshake<'_>> {
    let mut lines = raw.split(|b| *b == b'\n').filter(|l| !l.is_empty());
    let metadata = lines.next()?;
    let txn_line = lines.next()?;
    let value: serde_json::Value = serde_json::from_slice(txn_line).ok()?;
    let txn = value.get("transaction")?;
    let transaction_id = txn.get("id")?.as_str()?.to_string();
    let trace_id = txn.get("trace_id")?.as_str()?.to_string();
    Some(Handshake {
        metadata,
        transaction_id,
        trace_id,
    })
}

fn content_encoding(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Logs the message and wraps it in the JSON error body agents expect.
fn log_and_respond(status: StatusCode, message: String) -> Response {
    warn!("{message}");
    (status, Json(json!({ "message": message }))).into_response()
}
