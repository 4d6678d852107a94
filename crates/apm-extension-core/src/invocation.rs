//! Per-request invocation state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

/// State for one Lambda invocation while it is being correlated with agent
/// data. Created on the platform's `INVOKE` event, updated by the agent
/// handshake and intake payloads, destroyed when the invocation finalizes.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Opaque id the platform assigned to this invocation.
    pub request_id: String,
    /// ARN of the deployed function.
    pub function_arn: String,
    /// Absolute wall-clock deadline (ms since epoch) for the invocation.
    pub deadline_ms: i64,
    /// When the invocation was registered with the batch.
    pub timestamp: SystemTime,
    /// Trace id announced by the agent, empty until the handshake.
    pub trace_id: String,
    /// Root transaction id announced by the agent, empty until the handshake.
    pub transaction_id: String,
    /// True once the agent's own transaction event for `transaction_id`
    /// passed through the batch.
    pub transaction_observed: bool,
}

impl Invocation {
    pub fn new(
        request_id: String,
        function_arn: String,
        deadline_ms: i64,
        timestamp: SystemTime,
    ) -> Self {
        Invocation {
            request_id,
            function_arn,
            deadline_ms,
            timestamp,
            trace_id: String::new(),
            transaction_id: String::new(),
            transaction_observed: false,
        }
    }

    /// True when the agent announced a root transaction that has not been
    /// seen in any intake payload. Such an invocation must not finalize
    /// without a synthesized stand-in, or it would vanish from the APM UI.
    pub fn needs_proxy_transaction(&self) -> bool {
        !self.transaction_id.is_empty() && !self.transaction_observed
    }

    /// Builds the synthetic transaction event for an invocation whose agent
    /// never flushed its root transaction. Returns `None` when no stand-in
    /// is needed. The result is a single ndjson line, ready to append to
    /// the batch buffer.
    pub fn finalize(&self, status: &str) -> Option<Vec<u8>> {
        if !self.needs_proxy_transaction() {
            return None;
        }
        let duration_ms = self
            .timestamp
            .elapsed()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
            * 1_000.0;
        let timestamp_us = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64;
        let event = json!({
            "transaction": {
                "id": self.transaction_id,
                "trace_id": self.trace_id,
                "name": function_name_from_arn(&self.function_arn),
                "type": "request",
                "timestamp": timestamp_us,
                "duration": duration_ms,
                "result": status,
                "outcome": status,
                "sampled": true,
                "span_count": { "started": 0 },
                "faas": { "id": self.function_arn },
            }
        });
        Some(event.to_string().into_bytes())
    }
}

/// The function name segment of a Lambda ARN
/// (`arn:aws:lambda:region:account:function:NAME[:alias]`), or the whole
/// string when it does not look like one.
fn function_name_from_arn(arn: &str) -> &str {
    let parts: Vec<&str> = arn.splitn(8, ':').collect();
    match parts.as_slice() {
        [_, _, _, _, _, "function", name, ..] => name,
        _ => arn,
    }
}
