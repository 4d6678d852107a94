//! Extension configuration, loaded from the Lambda environment.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_RECEIVER_ADDR: &str = "127.0.0.1:8200";
const DEFAULT_LOGS_LISTENER_ADDR: &str = "0.0.0.0:8205";
const DEFAULT_RECEIVER_TIMEOUT_SECS: u64 = 15;
const DEFAULT_FORWARDER_TIMEOUT_SECS: u64 = 3;
const DEFAULT_DATA_BUFFER_SIZE: usize = 100;
const DEFAULT_BATCH_MAX_SIZE: usize = 100;
const DEFAULT_BATCH_MAX_AGE_SECS: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// When the coordinator ships a batch.
///
/// `SyncFlush` ships exactly at lifecycle boundaries (`runtimeDone`,
/// shutdown); size-based triggers are advisory. `Background` additionally
/// ships whenever the batch reports ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendStrategy {
    #[default]
    SyncFlush,
    Background,
}

impl FromStr for SendStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "syncflush" => Ok(SendStrategy::SyncFlush),
            "background" => Ok(SendStrategy::Background),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for SendStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStrategy::SyncFlush => write!(f, "syncflush"),
            SendStrategy::Background => write!(f, "background"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the APM Server intake.
    pub apm_server_url: String,
    /// `Authorization: ApiKey ...` credential; wins over the secret token.
    pub api_key: Option<String>,
    /// `Authorization: Bearer ...` credential.
    pub secret_token: Option<String>,
    /// Bind address of the agent receiver.
    pub receiver_addr: String,
    /// Read+write timeout applied to receiver requests.
    pub receiver_timeout: Duration,
    /// Total request timeout for APM Server POSTs.
    pub forwarder_timeout: Duration,
    pub send_strategy: SendStrategy,
    /// Capacity of the coordinator's data channel.
    pub data_buffer_size: usize,
    /// Maximum entries per batch.
    pub batch_max_size: usize,
    /// Age at which a non-empty batch ships regardless of size.
    pub batch_max_age: Duration,
    /// Bind address of the Logs API listener.
    pub logs_listener_addr: String,
    pub log_level: String,
    /// `host:port` of the Lambda Runtime API, from the platform.
    pub runtime_api: String,
}

impl Config {
    /// Loads configuration from the environment. Fails when the APM Server
    /// URL or the runtime API endpoint are missing, or when a set variable
    /// does not parse.
    pub fn from_env() -> Result<Config, ConfigError> {
        let runtime_api = env::var("AWS_LAMBDA_RUNTIME_API")
            .map_err(|_| ConfigError::MissingVar("AWS_LAMBDA_RUNTIME_API"))?;
        let apm_server_url = env::var("ELASTIC_APM_LAMBDA_APM_SERVER")
            .map_err(|_| ConfigError::MissingVar("ELASTIC_APM_LAMBDA_APM_SERVER"))?
            .trim_end_matches('/')
            .to_string();

        let api_key = non_empty_var("ELASTIC_APM_API_KEY");
        let mut secret_token = non_empty_var("ELASTIC_APM_SECRET_TOKEN");
        if api_key.is_some() && secret_token.is_some() {
            warn!("both ELASTIC_APM_API_KEY and ELASTIC_APM_SECRET_TOKEN are set; using the API key");
            secret_token = None;
        }

        Ok(Config {
            apm_server_url,
            api_key,
            secret_token,
            receiver_addr: env::var("ELASTIC_APM_RECEIVER_ADDR")
                .unwrap_or_else(|_| DEFAULT_RECEIVER_ADDR.to_string()),
            receiver_timeout: Duration::from_secs(parse_var(
                "ELASTIC_APM_DATA_RECEIVER_TIMEOUT_SECONDS",
                DEFAULT_RECEIVER_TIMEOUT_SECS,
            )?),
            forwarder_timeout: Duration::from_secs(parse_var(
                "ELASTIC_APM_DATA_FORWARDER_TIMEOUT_SECONDS",
                DEFAULT_FORWARDER_TIMEOUT_SECS,
            )?),
            send_strategy: parse_var("ELASTIC_APM_SEND_STRATEGY", SendStrategy::default())?,
            data_buffer_size: parse_var(
                "ELASTIC_APM_AGENT_DATA_BUFFER_SIZE",
                DEFAULT_DATA_BUFFER_SIZE,
            )?,
            batch_max_size: parse_var("ELASTIC_APM_BATCH_MAX_SIZE", DEFAULT_BATCH_MAX_SIZE)?,
            batch_max_age: Duration::from_secs(parse_var(
                "ELASTIC_APM_BATCH_MAX_AGE_SECONDS",
                DEFAULT_BATCH_MAX_AGE_SECS,
            )?),
            logs_listener_addr: env::var("ELASTIC_APM_LOGS_LISTENER_ADDR")
                .unwrap_or_else(|_| DEFAULT_LOGS_LISTENER_ADDR.to_string()),
            log_level: env::var("ELASTIC_APM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            runtime_api,
        })
    }

    /// Intake endpoint on the configured APM Server.
    pub fn intake_url(&self) -> String {
        format!("{}/intake/v2/events", self.apm_server_url)
    }
}

fn non_empty_var(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            var,
            value: raw,
        }),
    }
}
