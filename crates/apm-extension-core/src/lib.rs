//! # APM Lambda Extension core
//!
//! Engine of an APM extension that runs as a sidecar companion to an AWS
//! Lambda function. It collects telemetry from the in-process APM agent and
//! from the Lambda Logs API, correlates both per invocation, and forwards
//! consolidated ndjson batches to an APM Server with lifecycle-correct
//! timing: data leaves the function before the platform freezes the
//! execution environment.
//!
//! ## Modules
//!
//! - [`batch`]: invocation-correlation batching engine
//! - [`invocation`]: per-request state and proxy-transaction synthesis
//! - [`codec`]: payload decompression and cheap event-type extraction
//! - [`forwarder`]: lifecycle-aware send coordinator
//! - [`receiver`]: HTTP intake for the in-process agent
//! - [`logs_api`]: Lambda Logs API subscription and listener
//! - [`extension_api`]: Lambda Extensions API client
//! - [`app`]: lifecycle controller wiring everything together

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod app;
pub mod batch;
pub mod codec;
pub mod config;
pub mod extension_api;
pub mod forwarder;
pub mod invocation;
pub mod logger;
pub mod logs_api;
pub mod receiver;
