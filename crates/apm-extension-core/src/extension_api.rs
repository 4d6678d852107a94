//! Client for the Lambda Extensions API.
//!
//! The extension registers once at startup and then long-polls
//! `/event/next`; the platform answers with the next `INVOKE` or, at the
//! end of the environment's life, a single `SHUTDOWN`.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    #[error("extensions API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("extensions API returned status {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("register response is missing the Lambda-Extension-Identifier header")]
    MissingExtensionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Invoke,
    Shutdown,
}

/// Response of the `/event/next` long poll.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_type: EventType,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub deadline_ms: i64,
    #[serde(default)]
    pub shutdown_reason: Option<String>,
}

pub struct ExtensionClient {
    client: reqwest::Client,
    base_url: String,
    extension_id: String,
}

impl ExtensionClient {
    /// Registers the extension for `INVOKE` and `SHUTDOWN` events and
    /// captures the identifier the platform assigns.
    pub async fn register(runtime_api: &str, name: &str) -> Result<Self, ExtensionApiError> {
        // No total timeout on this client: `next_event` blocks for as long
        // as the execution environment stays frozen.
        let client = reqwest::Client::builder().build()?;
        let base_url = format!("http://{runtime_api}/2020-01-01/extension");

        let response = client
            .post(format!("{base_url}/register"))
            .header("Lambda-Extension-Name", name)
            .json(&serde_json::json!({ "events": ["INVOKE", "SHUTDOWN"] }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExtensionApiError::UnexpectedStatus(response.status()));
        }
        let extension_id = response
            .headers()
            .get("Lambda-Extension-Identifier")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(ExtensionApiError::MissingExtensionId)?;

        Ok(ExtensionClient {
            client,
            base_url,
            extension_id,
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Long-polls the platform for the next lifecycle event. Resolving this
    /// future is also what tells the platform the extension is done with
    /// the previous event.
    pub async fn next_event(&self) -> Result<NextEventResponse, ExtensionApiError> {
        let response = self
            .client
            .get(format!("{}/event/next", self.base_url))
            .header("Lambda-Extension-Identifier", &self.extension_id)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExtensionApiError::UnexpectedStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}
