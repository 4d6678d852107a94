//! Extension log formatting.
//!
//! Extension output lands in the function's CloudWatch log stream next to
//! user code output, so every line carries a fixed `APM_EXTENSION` marker
//! that operators can filter on:
//!
//! ```text
//! APM_EXTENSION | INFO | registered with the extensions API extension_id=...
//! ```
//!
//! The extension never opens tracing spans, so the formatter is a flat
//! single-line one: marker, level, then the event's message and fields.

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const LOG_MARKER: &str = "APM_EXTENSION";

/// Flat one-line formatter: `APM_EXTENSION | LEVEL | message fields`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{LOG_MARKER} | {} | ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. `level` accepts anything `EnvFilter`
/// understands (`info`, `debug`, a full directive string). Safe to call
/// more than once; later calls are no-ops.
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .event_format(Formatter)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
