//! Lifecycle controller.
//!
//! Wires the platform event loop, the agent receiver, the Logs API
//! listener and the send coordinator together, and drives batch
//! transitions on `INVOKE`, `runtimeDone` and `SHUTDOWN`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchError};
use crate::config::Config;
use crate::extension_api::{EventType, ExtensionApiError, ExtensionClient};
use crate::forwarder;
use crate::logs_api::{self, LogsApiError, LogsEvent};
use crate::receiver::{self, IntakeActivity, ReceiverState};

pub const EXTENSION_NAME: &str = "apm-lambda-extension";

/// How long `runtimeDone` processing waits for an agent flush that has not
/// arrived yet. Only invocations still missing their root transaction pay
/// this.
const RUNTIME_DONE_GRACE: Duration = Duration::from_millis(200);
/// Bound on waiting for server/worker tasks after the platform said
/// `SHUTDOWN`; the environment dies shortly after, so there is no point
/// waiting longer.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Slice of the shutdown deadline reserved for the task joins that follow
/// the final flush.
const SHUTDOWN_FLUSH_HEADROOM: Duration = Duration::from_millis(200);
/// Final-flush bound when the platform's deadline is absent or already in
/// the past.
const SHUTDOWN_FLUSH_FALLBACK: Duration = Duration::from_secs(2);
const LOGS_EVENT_BUFFER: usize = 64;
/// Backoff after a failed `next` poll so a broken runtime API does not spin
/// the loop.
const NEXT_EVENT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    ExtensionApi(#[from] ExtensionApiError),

    #[error(transparent)]
    LogsApi(#[from] LogsApiError),
}

/// Runs the extension until the platform requests shutdown.
pub async fn run(config: Config) -> Result<(), AppError> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let batch = Arc::new(Batch::new(config.batch_max_size, config.batch_max_age));
    let activity = Arc::new(IntakeActivity::default());

    let (forwarder, worker) = forwarder::new(Arc::clone(&config), Arc::clone(&batch));
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));

    let receiver_listener = TcpListener::bind(&config.receiver_addr)
        .await
        .map_err(|source| AppError::Bind {
            what: "agent receiver",
            addr: config.receiver_addr.clone(),
            source,
        })?;
    info!(addr = %config.receiver_addr, "agent receiver listening");
    let receiver_state = ReceiverState {
        forwarder: forwarder.clone(),
        batch: Arc::clone(&batch),
        activity: Arc::clone(&activity),
    };
    let receiver_timeout = config.receiver_timeout;
    let receiver_cancel = cancel.clone();
    let receiver_handle = tokio::spawn(async move {
        if let Err(err) =
            receiver::serve(receiver_listener, receiver_state, receiver_timeout, receiver_cancel)
                .await
        {
            error!(%err, "agent receiver server error");
        }
    });

    let logs_listener = TcpListener::bind(&config.logs_listener_addr)
        .await
        .map_err(|source| AppError::Bind {
            what: "logs",
            addr: config.logs_listener_addr.clone(),
            source,
        })?;
    let logs_port = logs_listener
        .local_addr()
        .map_err(|source| AppError::Bind {
            what: "logs",
            addr: config.logs_listener_addr.clone(),
            source,
        })?
        .port();
    let (logs_tx, mut logs_rx) = mpsc::channel(LOGS_EVENT_BUFFER);
    let logs_cancel = cancel.clone();
    let logs_handle = tokio::spawn(async move {
        if let Err(err) = logs_api::serve(logs_listener, logs_tx, logs_cancel).await {
            error!(%err, "logs listener server error");
        }
    });

    let client = ExtensionClient::register(&config.runtime_api, EXTENSION_NAME).await?;
    info!(extension_id = client.extension_id(), "registered with the extensions API");

    let destination = format!(
        "http://{}:{}",
        destination_host(&config.logs_listener_addr),
        logs_port
    );
    logs_api::subscribe(&config.runtime_api, client.extension_id(), &destination).await?;
    info!(%destination, "subscribed to the logs API");

    // The `next` long poll runs on its own task so that handling a logs
    // event can never cancel an in-flight poll and lose a platform event.
    // The task stops itself after forwarding SHUTDOWN; polling past that
    // point is invalid.
    let (platform_tx, mut platform_rx) = mpsc::channel(1);
    let poll_handle = tokio::spawn(async move {
        loop {
            match client.next_event().await {
                Ok(event) => {
                    let is_shutdown = event.event_type == EventType::Shutdown;
                    if platform_tx.send(event).await.is_err() || is_shutdown {
                        break;
                    }
                }
                Err(err) => {
                    error!(%err, "next-event poll failed");
                    if platform_tx.is_closed() {
                        break;
                    }
                    tokio::time::sleep(NEXT_EVENT_RETRY_DELAY).await;
                }
            }
        }
    });

    loop {
        tokio::select! {
            Some(event) = platform_rx.recv() => match event.event_type {
                EventType::Invoke => {
                    debug!(request_id = %event.request_id, "invocation started");
                    activity.begin_invocation();
                    batch
                        .register_invocation(
                            &event.request_id,
                            &event.invoked_function_arn,
                            event.deadline_ms,
                            SystemTime::now(),
                        )
                        .await;
                }
                EventType::Shutdown => {
                    let reason = event.shutdown_reason.unwrap_or_default();
                    // Without a runtimeDone for the open invocations the
                    // real outcome is unknowable; a platform-reported
                    // timeout is the only reliable signal.
                    let status = if reason == "timeout" { "timeout" } else { "failure" };
                    info!(%reason, status, "platform requested shutdown");
                    // The final flush must not outlive the platform's
                    // deadline; a stuck forwarder retry would otherwise
                    // wedge shutdown.
                    let bound = shutdown_flush_deadline(event.deadline_ms);
                    match tokio::time::timeout(bound, forwarder.shutdown(status)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(%err, "final flush failed"),
                        Err(_) => {
                            warn!("final flush did not finish before the shutdown deadline");
                        }
                    }
                    break;
                }
            },
            Some(event) = logs_rx.recv() => match event {
                LogsEvent::RuntimeDone { request_id, status } => {
                    debug!(%request_id, %status, "runtime done");
                    if batch.awaiting_agent_data(&request_id).await {
                        // The logs API can outrun the agent's last flush;
                        // give the receiver a bounded chance to observe it
                        // before a proxy transaction gets synthesized.
                        activity.wait_for_flush(RUNTIME_DONE_GRACE).await;
                    }
                    if let Err(err) = forwarder.runtime_done(&request_id, &status).await {
                        warn!(%err, %request_id, "failed to finalize invocation");
                    }
                }
                LogsEvent::FunctionLog { message } => {
                    let line = logs_api::function_log_line(&message);
                    match batch.add_lambda_data(&line).await {
                        Ok(()) => {}
                        Err(BatchError::MetadataUnavailable) => {
                            debug!("dropping function log, no metadata seen yet");
                        }
                        Err(err) => debug!(%err, "failed to append function log"),
                    }
                }
            },
            else => break,
        }
    }

    cancel.cancel();
    join_with_timeout("platform poll", poll_handle).await;
    join_with_timeout("send coordinator", worker_handle).await;
    join_with_timeout("agent receiver", receiver_handle).await;
    join_with_timeout("logs listener", logs_handle).await;

    let (agent_transactions, proxy_transactions) = batch.transaction_stats().await;
    info!(
        agent_transactions,
        proxy_transactions, "extension shutting down"
    );
    Ok(())
}

async fn join_with_timeout(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, task = name, "task failed during shutdown"),
        Err(_) => warn!(task = name, "task did not stop in time"),
    }
}

/// Time left until the platform's absolute shutdown deadline, minus the
/// headroom kept for the task joins. Falls back to a small constant when
/// the deadline is unset or already behind us.
fn shutdown_flush_deadline(deadline_ms: i64) -> Duration {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64;
    let remaining = deadline_ms.saturating_sub(now_ms);
    if remaining <= 0 {
        return SHUTDOWN_FLUSH_FALLBACK;
    }
    Duration::from_millis(remaining as u64)
        .saturating_sub(SHUTDOWN_FLUSH_HEADROOM)
        .max(SHUTDOWN_FLUSH_HEADROOM)
}

/// Host the platform should deliver log events to. A wildcard bind means
/// the listener is reachable through the sandbox hostname.
fn destination_host(bind_addr: &str) -> &str {
    match bind_addr.rsplit_once(':').map(|(host, _)| host) {
        Some("0.0.0.0") | Some("") | None => "sandbox.localdomain",
        Some(host) => host,
    }
}
