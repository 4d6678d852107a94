use apm_extension_core::{app, config::Config, logger};
use tracing::error;

/// Operational init failure: log and exit non-zero so the platform surfaces
/// the extension error.
fn fatal(message: &str, err: &dyn std::fmt::Display) -> ! {
    error!(%err, "{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    // The subscriber can only be installed once, so the level is read
    // straight from the environment before the rest of the config loads.
    let log_level =
        std::env::var("ELASTIC_APM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    logger::init(&log_level);

    let config = Config::from_env().unwrap_or_else(|err| fatal("configuration error", &err));

    if let Err(err) = app::run(config).await {
        fatal("extension failed", &err);
    }
}
