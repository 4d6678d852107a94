//! Invocation-correlation batching engine.
//!
//! The batch holds every invocation that has not yet shipped to the APM
//! Server and correlates it with the data collected from the agent and from
//! the Lambda Logs API. The outbound payload is accumulated in wire format
//! (ndjson with a leading metadata line) so shipping is a plain snapshot,
//! never a re-serialization.
//!
//! Mutations arrive from several tasks (platform loop, receiver, logs
//! listener, coordinator worker), so the state lives behind a single
//! readers-writer lock: readers for [`Batch::count`], [`Batch::should_ship`]
//! and [`Batch::to_apm_data`], writers for everything else.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::codec::{self, ApmData, CodecError};
use crate::invocation::Invocation;

/// Fraction of `max_size` at which the batch reports ready to ship, leaving
/// producers headroom between the ship decision and the next append.
const SHIP_THRESHOLD: f64 = 0.9;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("metadata is not yet available")]
    MetadataUnavailable,

    #[error("batch is full")]
    BatchFull,

    #[error("no invocation registered for request id {0:?}")]
    UnknownInvocation(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct Batch {
    max_size: usize,
    max_age: Duration,
    state: RwLock<BatchState>,
}

#[derive(Default)]
struct BatchState {
    /// Outbound wire-format buffer: one metadata object, then zero or more
    /// `\n`-prefixed events. Append-only between resets.
    buf: Vec<u8>,
    /// Length of the metadata prefix at the head of `buf`; zero until the
    /// first metadata line arrives, constant afterwards.
    metadata_bytes: usize,
    invocations: HashMap<String, Invocation>,
    /// Entries appended after the metadata prefix.
    count: usize,
    /// Instant of the first append since the last reset.
    age: Option<Instant>,
    /// Pivot for agent input, which carries no request id. The platform
    /// serializes invocations per extension, so the most recently
    /// registered request is the one the agent is talking about.
    currently_executing: Option<String>,
    /// Transactions delivered by the agent itself.
    agent_transactions: u64,
    /// Transactions synthesized at finalize time.
    proxy_transactions: u64,
}

impl Batch {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Batch {
            max_size,
            max_age,
            state: RwLock::new(BatchState::default()),
        }
    }

    /// Registers a new invocation and makes it the pivot for subsequent
    /// agent input.
    pub async fn register_invocation(
        &self,
        request_id: &str,
        function_arn: &str,
        deadline_ms: i64,
        timestamp: SystemTime,
    ) {
        let mut state = self.state.write().await;
        state.invocations.insert(
            request_id.to_string(),
            Invocation::new(
                request_id.to_string(),
                function_arn.to_string(),
                deadline_ms,
                timestamp,
            ),
        );
        state.currently_executing = Some(request_id.to_string());
    }

    /// Records the trace/transaction ids the agent announced for the
    /// currently executing invocation. These ids let the batch synthesize a
    /// stand-in transaction if the agent dies before flushing its own.
    pub async fn on_agent_init(
        &self,
        transaction_id: &str,
        trace_id: &str,
    ) -> Result<(), BatchError> {
        let mut state = self.state.write().await;
        let inv = current_invocation_mut(&mut state)?;
        inv.transaction_id = transaction_id.to_string();
        inv.trace_id = trace_id.to_string();
        Ok(())
    }

    /// Stores `line` as the batch metadata if none has been seen yet. The
    /// metadata line is identical for every payload an agent produces
    /// within one process, so the first one wins and survives resets.
    pub async fn capture_metadata(&self, line: &[u8]) {
        if line.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        if state.metadata_bytes == 0 {
            state.buf.extend_from_slice(line);
            state.metadata_bytes = line.len();
        }
    }

    /// Appends a decoded agent payload to the batch.
    ///
    /// The body is split on newlines; the first line is metadata, the rest
    /// are events, appended in arrival order. A transaction event matching
    /// the announced transaction id marks the invocation as observed; any
    /// further copy of it is discarded so exactly one authoritative record
    /// per transaction id ships.
    pub async fn add_agent_data(&self, data: ApmData) -> Result<(), BatchError> {
        let raw = data.into_uncompressed()?;
        if raw.is_empty() {
            return Ok(());
        }
        let mut lines = raw.split(|b| *b == b'\n');
        let metadata = lines.next().unwrap_or_default();

        let mut state = self.state.write().await;
        current_invocation_mut(&mut state)?;
        if state.metadata_bytes == 0 && !metadata.is_empty() {
            state.buf.extend_from_slice(metadata);
            state.metadata_bytes = metadata.len();
        }
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let inv = current_invocation_mut(&mut state)?;
            if !inv.transaction_id.is_empty()
                && codec::find_event_type(line) == Some(&b"transaction"[..])
                && transaction_id_matches(line, &inv.transaction_id)
            {
                if inv.transaction_observed {
                    // Agents occasionally flush the root transaction twice;
                    // the first copy is the authoritative one.
                    debug!(
                        transaction_id = %inv.transaction_id,
                        "dropping duplicate transaction event"
                    );
                    continue;
                }
                inv.transaction_observed = true;
                state.agent_transactions += 1;
            }
            self.append_entry(&mut state, line)?;
        }
        Ok(())
    }

    /// Appends a single pre-formatted event line (one the extension built
    /// itself, such as a wrapped function log). Requires that metadata has
    /// already been captured.
    pub async fn add_lambda_data(&self, line: &[u8]) -> Result<(), BatchError> {
        let mut state = self.state.write().await;
        self.append_entry(&mut state, line)
    }

    /// Finalizes one invocation after the platform reported its runtime
    /// done, appending a proxy transaction if the agent never delivered its
    /// own. The invocation is removed either way.
    pub async fn on_lambda_log_runtime_done(
        &self,
        request_id: &str,
        status: &str,
    ) -> Result<(), BatchError> {
        let mut state = self.state.write().await;
        self.finalize_invocation(&mut state, request_id, status)
    }

    /// Finalizes every remaining invocation with the given status. All
    /// invocations are finalized even when one fails; the first error is
    /// returned.
    pub async fn on_shutdown(&self, status: &str) -> Result<(), BatchError> {
        let mut state = self.state.write().await;
        let request_ids: Vec<String> = state.invocations.keys().cloned().collect();
        let mut first_err = None;
        for request_id in request_ids {
            if let Err(err) = self.finalize_invocation(&mut state, &request_id, status) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True when the invocation exists and still waits for the agent's root
    /// transaction. Used to decide whether finalization should grant the
    /// receiver a grace window.
    pub async fn awaiting_agent_data(&self, request_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .invocations
            .get(request_id)
            .is_some_and(Invocation::needs_proxy_transaction)
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.count
    }

    /// Ready to ship once the entry count crosses 90% of capacity, or once
    /// a non-empty batch is older than the configured maximum age.
    pub async fn should_ship(&self) -> bool {
        let state = self.state.read().await;
        state.count >= (self.max_size as f64 * SHIP_THRESHOLD) as usize
            || state.age.is_some_and(|age| age.elapsed() > self.max_age)
    }

    /// Clears the entries while keeping the metadata prefix, preparing the
    /// buffer for the next batch.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let metadata_bytes = state.metadata_bytes;
        state.buf.truncate(metadata_bytes);
        state.count = 0;
        state.age = None;
    }

    /// Snapshot of the current wire bytes.
    pub async fn to_apm_data(&self) -> ApmData {
        let state = self.state.read().await;
        ApmData::identity(Bytes::copy_from_slice(&state.buf))
    }

    /// Counts of agent-delivered vs. synthesized transactions, for the
    /// shutdown summary.
    pub async fn transaction_stats(&self) -> (u64, u64) {
        let state = self.state.read().await;
        (state.agent_transactions, state.proxy_transactions)
    }

    fn finalize_invocation(
        &self,
        state: &mut BatchState,
        request_id: &str,
        status: &str,
    ) -> Result<(), BatchError> {
        let inv = state
            .invocations
            .remove(request_id)
            .ok_or_else(|| BatchError::UnknownInvocation(request_id.to_string()))?;
        if let Some(proxy) = inv.finalize(status) {
            self.append_entry(state, &proxy)?;
            state.proxy_transactions += 1;
            debug!(request_id, status, "synthesized proxy transaction");
        }
        Ok(())
    }

    fn append_entry(&self, state: &mut BatchState, line: &[u8]) -> Result<(), BatchError> {
        if state.metadata_bytes == 0 {
            return Err(BatchError::MetadataUnavailable);
        }
        if state.count == self.max_size {
            return Err(BatchError::BatchFull);
        }
        state.buf.push(b'\n');
        state.buf.extend_from_slice(line);
        if state.count == 0 {
            state.age = Some(Instant::now());
        }
        state.count += 1;
        Ok(())
    }
}

fn current_invocation_mut(state: &mut BatchState) -> Result<&mut Invocation, BatchError> {
    let request_id = state
        .currently_executing
        .clone()
        .ok_or_else(|| BatchError::UnknownInvocation(String::new()))?;
    match state.invocations.get_mut(&request_id) {
        Some(inv) => Ok(inv),
        None => Err(BatchError::UnknownInvocation(request_id)),
    }
}

/// Targeted probe for `transaction.id` on a raw event line. Only runs for
/// lines the cheap event-type scan already classified as transactions.
fn transaction_id_matches(line: &[u8], transaction_id: &str) -> bool {
    serde_json::from_slice::<serde_json::Value>(line)
        .ok()
        .and_then(|v| {
            v.pointer("/transaction/id")
                .and_then(|id| id.as_str().map(|s| s == transaction_id))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:aws:lambda:us-west-2:123456789012:function:batch-test";
    const METADATA: &[u8] = br#"{"metadata":{"service":{"name":"test"}}}"#;

    fn batch() -> Batch {
        Batch::new(10, Duration::from_secs(30))
    }

    async fn register(batch: &Batch, request_id: &str) {
        batch
            .register_invocation(request_id, ARN, 1_700_000_000_000, SystemTime::now())
            .await;
    }

    fn agent_body(events: &[&str]) -> ApmData {
        let mut body = METADATA.to_vec();
        for event in events {
            body.push(b'\n');
            body.extend_from_slice(event.as_bytes());
        }
        ApmData::identity(body)
    }

    async fn buf_string(batch: &Batch) -> String {
        String::from_utf8(batch.to_apm_data().await.data.to_vec()).unwrap()
    }

    // S1: agent delivers its transaction, no proxy is synthesized.
    #[tokio::test]
    async fn happy_path_agent_transaction_ships_once() {
        let batch = batch();
        register(&batch, "R1").await;
        batch.on_agent_init("T1", "Tr1").await.unwrap();
        batch
            .add_agent_data(agent_body(&[r#"{"transaction":{"id":"T1"}}"#]))
            .await
            .unwrap();
        batch.on_lambda_log_runtime_done("R1", "success").await.unwrap();

        let expected = format!(
            "{}\n{}",
            String::from_utf8_lossy(METADATA),
            r#"{"transaction":{"id":"T1"}}"#
        );
        assert_eq!(buf_string(&batch).await, expected);
        assert_eq!(batch.count().await, 1);
        assert_eq!(batch.transaction_stats().await, (1, 0));
    }

    // S2: agent sent metadata only; finalize with timeout synthesizes a
    // transaction carrying the announced ids and the status as outcome.
    #[tokio::test]
    async fn timeout_without_agent_flush_synthesizes_proxy() {
        let batch = batch();
        register(&batch, "R2").await;
        batch.on_agent_init("T2", "Tr2").await.unwrap();
        batch.add_agent_data(agent_body(&[])).await.unwrap();
        batch.on_lambda_log_runtime_done("R2", "timeout").await.unwrap();

        let buf = buf_string(&batch).await;
        let last_line = buf.lines().last().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(last_line).unwrap();
        assert_eq!(parsed["transaction"]["id"], "T2");
        assert_eq!(parsed["transaction"]["trace_id"], "Tr2");
        assert_eq!(parsed["transaction"]["outcome"], "timeout");
        assert_eq!(batch.transaction_stats().await, (0, 1));
    }

    // S3: appends past capacity fail and leave the buffer untouched.
    #[tokio::test]
    async fn full_batch_refuses_appends() {
        let batch = Batch::new(2, Duration::from_secs(30));
        register(&batch, "R3").await;
        batch.capture_metadata(METADATA).await;
        batch.add_lambda_data(br#"{"log":{"message":"a"}}"#).await.unwrap();
        batch.add_lambda_data(br#"{"log":{"message":"b"}}"#).await.unwrap();

        let before = buf_string(&batch).await;
        let err = batch
            .add_lambda_data(br#"{"log":{"message":"c"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::BatchFull));
        assert_eq!(buf_string(&batch).await, before);
        assert_eq!(batch.count().await, 2);
    }

    // S4: a non-empty batch older than max age is mature.
    #[tokio::test]
    async fn maturity_triggers_ship() {
        let batch = Batch::new(100, Duration::from_millis(10));
        register(&batch, "R4").await;
        batch.capture_metadata(METADATA).await;
        batch.add_lambda_data(br#"{"log":{}}"#).await.unwrap();
        assert!(!batch.should_ship().await);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(batch.should_ship().await);
    }

    #[tokio::test]
    async fn empty_batch_never_matures() {
        let batch = Batch::new(100, Duration::from_millis(1));
        batch.capture_metadata(METADATA).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!batch.should_ship().await);
    }

    // S5: shutdown finalizes every open invocation; those with an announced
    // but unobserved transaction get a proxy.
    #[tokio::test]
    async fn shutdown_finalizes_all_invocations() {
        let batch = batch();
        register(&batch, "R4").await;
        batch.on_agent_init("T4", "Tr4").await.unwrap();
        batch.add_agent_data(agent_body(&[])).await.unwrap();
        register(&batch, "R5").await;

        batch.on_shutdown("failure").await.unwrap();

        let buf = buf_string(&batch).await;
        let proxies: Vec<&str> = buf.lines().skip(1).collect();
        assert_eq!(proxies.len(), 1, "only the announced invocation gets a proxy");
        let parsed: serde_json::Value = serde_json::from_str(proxies[0]).unwrap();
        assert_eq!(parsed["transaction"]["id"], "T4");
        assert_eq!(parsed["transaction"]["outcome"], "failure");

        // Both invocations are gone.
        assert!(!batch.awaiting_agent_data("R4").await);
        assert!(!batch.awaiting_agent_data("R5").await);
        batch
            .on_lambda_log_runtime_done("R4", "success")
            .await
            .unwrap_err();
    }

    // S6: unknown encodings are rejected without touching the batch.
    #[tokio::test]
    async fn unknown_encoding_leaves_batch_unchanged() {
        let batch = batch();
        register(&batch, "R6").await;
        let err = batch
            .add_agent_data(ApmData {
                data: Bytes::from_static(b"whatever"),
                content_encoding: "brotli".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::Codec(CodecError::InvalidEncoding(_))
        ));
        assert_eq!(batch.count().await, 0);
        assert!(batch.to_apm_data().await.is_empty());
    }

    // Property 1: the metadata prefix never changes once written.
    #[tokio::test]
    async fn metadata_is_immutable() {
        let batch = batch();
        register(&batch, "R1").await;
        batch
            .add_agent_data(agent_body(&[r#"{"span":{"id":"s1"}}"#]))
            .await
            .unwrap();

        let other_metadata = br#"{"metadata":{"service":{"name":"other"}}}"#;
        let mut body = other_metadata.to_vec();
        body.extend_from_slice(b"\n{\"span\":{\"id\":\"s2\"}}");
        batch.add_agent_data(ApmData::identity(body)).await.unwrap();

        let buf = buf_string(&batch).await;
        assert!(buf.starts_with(std::str::from_utf8(METADATA).unwrap()));
        assert!(buf.contains(r#"{"span":{"id":"s2"}}"#));
    }

    // Property 2: reset drops entries but keeps the metadata prefix.
    #[tokio::test]
    async fn reset_preserves_metadata() {
        let batch = batch();
        register(&batch, "R1").await;
        batch
            .add_agent_data(agent_body(&[r#"{"span":{}}"#, r#"{"error":{}}"#]))
            .await
            .unwrap();
        assert_eq!(batch.count().await, 2);

        batch.reset().await;

        assert_eq!(batch.count().await, 0);
        assert_eq!(
            buf_string(&batch).await.as_bytes(),
            METADATA,
            "buffer truncated to the metadata prefix"
        );

        // The next entry lands after the preserved metadata.
        batch.add_lambda_data(br#"{"log":{}}"#).await.unwrap();
        let expected = format!("{}\n{}", String::from_utf8_lossy(METADATA), r#"{"log":{}}"#);
        assert_eq!(buf_string(&batch).await, expected);
    }

    // Property 3: count threshold is 90% of capacity, rounded down.
    #[tokio::test]
    async fn ship_threshold_is_ninety_percent() {
        let batch = Batch::new(10, Duration::from_secs(30));
        register(&batch, "R1").await;
        batch.capture_metadata(METADATA).await;
        for i in 0..8 {
            batch
                .add_lambda_data(format!(r#"{{"log":{{"n":{i}}}}}"#).as_bytes())
                .await
                .unwrap();
        }
        assert!(!batch.should_ship().await);
        batch.add_lambda_data(br#"{"log":{"n":8}}"#).await.unwrap();
        assert!(batch.should_ship().await);
    }

    // Property 4: exactly one transaction per id, agent's copy wins and
    // duplicates are discarded.
    #[tokio::test]
    async fn duplicate_agent_transaction_is_dropped() {
        let batch = batch();
        register(&batch, "R1").await;
        batch.on_agent_init("T1", "Tr1").await.unwrap();
        batch
            .add_agent_data(agent_body(&[
                r#"{"transaction":{"id":"T1"}}"#,
                r#"{"transaction":{"id":"T1"}}"#,
            ]))
            .await
            .unwrap();
        batch.on_lambda_log_runtime_done("R1", "success").await.unwrap();

        let buf = buf_string(&batch).await;
        let copies = buf.matches(r#"{"transaction":{"id":"T1"}}"#).count();
        assert_eq!(copies, 1);
        assert_eq!(batch.count().await, 1);
    }

    #[tokio::test]
    async fn unrelated_transaction_is_kept() {
        let batch = batch();
        register(&batch, "R1").await;
        batch.on_agent_init("T1", "Tr1").await.unwrap();
        batch
            .add_agent_data(agent_body(&[r#"{"transaction":{"id":"other"}}"#]))
            .await
            .unwrap();
        batch.on_lambda_log_runtime_done("R1", "failure").await.unwrap();

        let buf = buf_string(&batch).await;
        assert!(buf.contains(r#"{"transaction":{"id":"other"}}"#));
        // The announced transaction was never observed, so a proxy ships too.
        assert!(buf.contains(r#""id":"T1""#));
        assert_eq!(batch.count().await, 2);
    }

    // Property 5: appended events split back into the original lines.
    #[tokio::test]
    async fn round_trip_preserves_lines() {
        let events = [
            r#"{"transaction":{"id":"t"}}"#,
            r#"{"span":{"id":"s"}}"#,
            r#"{"error":{"id":"e"}}"#,
        ];
        let batch = batch();
        register(&batch, "R1").await;
        batch.add_agent_data(agent_body(&events)).await.unwrap();

        let buf = buf_string(&batch).await;
        let lines: Vec<&str> = buf.split('\n').collect();
        assert_eq!(lines[0], std::str::from_utf8(METADATA).unwrap());
        assert_eq!(&lines[1..], &events);
    }

    #[tokio::test]
    async fn trailing_newline_does_not_consume_capacity() {
        let batch = batch();
        register(&batch, "R1").await;
        let mut body = METADATA.to_vec();
        body.extend_from_slice(b"\n{\"span\":{}}\n");
        batch.add_agent_data(ApmData::identity(body)).await.unwrap();
        assert_eq!(batch.count().await, 1);
    }

    #[tokio::test]
    async fn empty_body_is_a_noop() {
        let batch = batch();
        register(&batch, "R1").await;
        batch
            .add_agent_data(ApmData::identity(Vec::new()))
            .await
            .unwrap();
        assert_eq!(batch.count().await, 0);
        assert!(batch.to_apm_data().await.is_empty());
    }

    #[tokio::test]
    async fn agent_data_without_invocation_fails() {
        let batch = batch();
        let err = batch
            .add_agent_data(agent_body(&[r#"{"span":{}}"#]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::UnknownInvocation(_)));
    }

    #[tokio::test]
    async fn lambda_data_requires_metadata() {
        let batch = batch();
        let err = batch.add_lambda_data(br#"{"log":{}}"#).await.unwrap_err();
        assert!(matches!(err, BatchError::MetadataUnavailable));
    }

    #[tokio::test]
    async fn runtime_done_for_unknown_invocation_fails() {
        let batch = batch();
        let err = batch
            .on_lambda_log_runtime_done("nope", "success")
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::UnknownInvocation(id) if id == "nope"));
    }

    // The pivot follows the most recent registration: agent input arriving
    // after a second register is attributed to the later invocation.
    #[tokio::test]
    async fn pivot_moves_to_latest_registration() {
        let batch = batch();
        register(&batch, "first").await;
        register(&batch, "second").await;
        batch.on_agent_init("T-second", "Tr-second").await.unwrap();
        batch
            .add_agent_data(agent_body(&[r#"{"transaction":{"id":"T-second"}}"#]))
            .await
            .unwrap();

        assert!(!batch.awaiting_agent_data("second").await);
        // The first invocation never saw a handshake, so it finalizes clean.
        batch.on_lambda_log_runtime_done("first", "success").await.unwrap();
        assert_eq!(batch.count().await, 1);
    }
}
