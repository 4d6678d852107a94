//! Send coordinator: owns the outbound APM Server client and the single
//! worker that appends agent payloads, finalizes invocations and ships
//! batches.
//!
//! The coordinator is a handle/worker pair around one bounded channel. The
//! handle side is cheap to clone and is what the receiver and the lifecycle
//! controller talk to. Because the channel is FIFO and the worker is the
//! sole consumer, a `runtime_done` command is always processed after every
//! agent payload enqueued before it, which keeps finalization from racing
//! the agent's last flush.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchError};
use crate::codec::ApmData;
use crate::config::{Config, SendStrategy};

/// How long `enqueue` may block once the channel is full before reporting
/// backpressure to the agent.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
const SEND_ATTEMPTS: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Cadence of age-maturity checks under the background strategy.
const MATURITY_CHECK_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("agent data channel is full")]
    QueueFull,

    #[error("send coordinator is not running")]
    WorkerGone,

    #[error(transparent)]
    Batch(#[from] BatchError),
}

#[derive(Debug, thiserror::Error)]
enum ShipError {
    #[error("APM Server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("APM Server returned status {0}")]
    Status(reqwest::StatusCode),
}

enum Command {
    AgentData {
        data: ApmData,
        done: oneshot::Sender<Result<(), BatchError>>,
    },
    RuntimeDone {
        request_id: String,
        status: String,
        done: oneshot::Sender<()>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        status: String,
        done: oneshot::Sender<()>,
    },
}

/// Creates the coordinator pair. Spawn [`ForwarderWorker::run`] on a task;
/// clone the [`Forwarder`] handle freely.
pub fn new(config: Arc<Config>, batch: Arc<Batch>) -> (Forwarder, ForwarderWorker) {
    let (tx, rx) = mpsc::channel(config.data_buffer_size);
    let client = reqwest::Client::builder()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());
    (
        Forwarder { tx },
        ForwarderWorker {
            rx,
            client,
            config,
            batch,
        },
    )
}

/// Outcome tracker for one enqueued payload: resolves once the worker has
/// run the append against the batch, so the receiver can answer the agent
/// with the real verdict rather than an optimistic ack.
#[derive(Debug)]
pub struct AppendReceipt(oneshot::Receiver<Result<(), BatchError>>);

impl AppendReceipt {
    pub async fn wait(self) -> Result<(), ForwarderError> {
        match self.0.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ForwarderError::Batch(err)),
            Err(_) => Err(ForwarderError::WorkerGone),
        }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<Command>,
}

impl Forwarder {
    /// Offers an agent payload to the worker. The channel offer is
    /// non-blocking in the common case; under backpressure it waits up to
    /// a small deadline and then reports [`ForwarderError::QueueFull`],
    /// which the receiver surfaces as a retriable 503. The batch itself is
    /// never touched on this path; the returned receipt carries the
    /// append's outcome.
    pub async fn enqueue(&self, data: ApmData) -> Result<AppendReceipt, ForwarderError> {
        let (done_tx, done_rx) = oneshot::channel();
        match self.tx.try_send(Command::AgentData { data, done: done_tx }) {
            Ok(()) => Ok(AppendReceipt(done_rx)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ForwarderError::WorkerGone),
            Err(mpsc::error::TrySendError::Full(command)) => {
                match tokio::time::timeout(ENQUEUE_TIMEOUT, self.tx.send(command)).await {
                    Ok(Ok(())) => Ok(AppendReceipt(done_rx)),
                    Ok(Err(_)) => Err(ForwarderError::WorkerGone),
                    Err(_) => Err(ForwarderError::QueueFull),
                }
            }
        }
    }

    /// Finalizes one invocation and ships the batch; resolves when the
    /// worker has processed everything enqueued before this call.
    pub async fn runtime_done(
        &self,
        request_id: &str,
        status: &str,
    ) -> Result<(), ForwarderError> {
        self.command(|done| Command::RuntimeDone {
            request_id: request_id.to_string(),
            status: status.to_string(),
            done,
        })
        .await
    }

    /// Forces a single ship iteration and waits for it to drain.
    pub async fn flush(&self) -> Result<(), ForwarderError> {
        self.command(|done| Command::Flush { done }).await
    }

    /// Finalizes every open invocation with `status`, performs the final
    /// ship, and stops the worker.
    pub async fn shutdown(&self, status: &str) -> Result<(), ForwarderError> {
        self.command(|done| Command::Shutdown {
            status: status.to_string(),
            done,
        })
        .await
    }

    async fn command(
        &self,
        build: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> Result<(), ForwarderError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(build(done_tx))
            .await
            .map_err(|_| ForwarderError::WorkerGone)?;
        done_rx.await.map_err(|_| ForwarderError::WorkerGone)
    }
}

pub struct ForwarderWorker {
    rx: mpsc::Receiver<Command>,
    client: reqwest::Client,
    config: Arc<Config>,
    batch: Arc<Batch>,
}

impl ForwarderWorker {
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut maturity = tokio::time::interval(MATURITY_CHECK_PERIOD);
        maturity.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let background = self.config.send_strategy == SendStrategy::Background;

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    None => {
                        self.ship("handles dropped").await;
                        break;
                    }
                    Some(Command::AgentData { data, done }) => {
                        let result = self.handle_agent_data(data).await;
                        if let Err(err) = &result {
                            warn!(%err, "failed to append agent payload");
                        }
                        let _ = done.send(result);
                        if background && self.batch.should_ship().await {
                            self.ship("batch ready").await;
                        }
                    }
                    Some(Command::RuntimeDone { request_id, status, done }) => {
                        if let Err(err) = self
                            .batch
                            .on_lambda_log_runtime_done(&request_id, &status)
                            .await
                        {
                            warn!(%err, %request_id, "failed to finalize invocation");
                        }
                        self.ship("runtime done").await;
                        let _ = done.send(());
                    }
                    Some(Command::Flush { done }) => {
                        self.ship("flush requested").await;
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown { status, done }) => {
                        if let Err(err) = self.batch.on_shutdown(&status).await {
                            warn!(%err, "failed to finalize invocations at shutdown");
                        }
                        self.ship("shutdown").await;
                        let _ = done.send(());
                        break;
                    }
                },
                _ = maturity.tick(), if background => {
                    if self.batch.should_ship().await {
                        self.ship("batch matured").await;
                    }
                }
                _ = cancel.cancelled() => {
                    self.ship("cancelled").await;
                    break;
                }
            }
        }
    }

    async fn handle_agent_data(&self, data: ApmData) -> Result<(), BatchError> {
        match self.batch.add_agent_data(data.clone()).await {
            Err(BatchError::BatchFull) => {
                // Make room and retry the payload once; a second BatchFull
                // goes back to the agent as a retriable refusal.
                self.ship("batch full").await;
                self.batch.add_agent_data(data).await
            }
            result => result,
        }
    }

    /// One ship iteration: snapshot, POST, reset on success. On any failure
    /// the buffer is retained and the next iteration retries the same
    /// bytes.
    async fn ship(&self, reason: &str) {
        // A reset batch still carries its metadata prefix; only entry
        // content is worth a request.
        if self.batch.count().await == 0 {
            return;
        }
        let data = self.batch.to_apm_data().await;
        match self.post(&data).await {
            Ok(()) => {
                debug!(reason, bytes = data.data.len(), "shipped batch to APM Server");
                self.batch.reset().await;
            }
            Err(err) => {
                warn!(reason, %err, "failed to ship batch, retaining buffer");
            }
        }
    }

    async fn post(&self, data: &ApmData) -> Result<(), ShipError> {
        let mut last_err = None;
        for attempt in 1..=SEND_ATTEMPTS {
            let mut request = self
                .client
                .post(self.config.intake_url())
                .header(CONTENT_TYPE, "application/x-ndjson")
                .timeout(self.config.forwarder_timeout)
                .body(data.data.clone());
            if let Some(key) = &self.config.api_key {
                request = request.header(AUTHORIZATION, format!("ApiKey {key}"));
            } else if let Some(token) = &self.config.secret_token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_err = Some(ShipError::Status(response.status())),
                Err(err) => last_err = Some(ShipError::Http(err)),
            }
            if attempt < SEND_ATTEMPTS {
                tokio::time::sleep(SEND_RETRY_BACKOFF * attempt).await;
            }
        }
        // last_err is always set after a failed loop.
        Err(last_err.unwrap_or(ShipError::Status(reqwest::StatusCode::BAD_GATEWAY)))
    }
}
