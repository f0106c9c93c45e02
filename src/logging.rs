//! Structured logging for incstate
//!
//! Every cache decision is logged with structured fields so runs can be
//! diagnosed after the fact. Cache misses are explained at `debug`, with one
//! event per mismatched record field.
//!
//! # Log Format Conventions
//!
//! - `operation`: what was done ("execute", "state.list", "state.clean")
//! - `status`: the outcome ("up-to-date", "executed", "error")
//! - `key`: the cache key
//! - `state_file`: path of the record file of that key
//!
//! # Examples
//!
//! ```rust
//! use tracing::info;
//!
//! let key = "compile:app";
//! info!(
//!     operation = "execute",
//!     status = "up-to-date",
//!     key,
//!     "up-to-date"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Event formatter printing "incstate" plus the names of the enclosing spans
struct IncstateFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for IncstateFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(incstate)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(incstate): ", meta.level())?;
        }

        // run > execute > ...
        if let Some(scope) = ctx.event_scope() {
            let names: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !names.is_empty() {
                write!(writer, "[{}] ", names.join(" > "))?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// Same layout without colors, for CI
    Compact,
    /// JSON lines, for log aggregation
    Json,
}

impl LogFormat {
    /// Parse from `INCSTATE_LOG_FORMAT`, falling back to compact under `CI`
    pub fn from_env() -> Self {
        let ci = std::env::var("CI").is_ok();
        Self::parse(
            &std::env::var("INCSTATE_LOG_FORMAT").unwrap_or_default(),
            ci,
        )
    }

    fn parse(value: &str, ci: bool) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if ci => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (e.g. "debug", "incstate=trace")
/// - `INCSTATE_LOG_FORMAT`: "pretty", "compact" or "json"
/// - `CI`: if set, defaults to compact format
///
/// `default_level` applies when `RUST_LOG` is unset. Calling this more than
/// once keeps the first subscriber.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(IncstateFormatter { with_ansi: true })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(IncstateFormatter { with_ansi: false })
                    .with_writer(io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(io::stderr)
                    .json(),
            )
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}

/// Operation names for consistent logging
pub mod operations {
    pub const EXECUTE: &str = "execute";
    pub const STATE_LIST: &str = "state.list";
    pub const STATE_SHOW: &str = "state.show";
    pub const STATE_CLEAN: &str = "state.clean";
}

/// Status values for consistent logging
pub mod status {
    pub const UP_TO_DATE: &str = "up-to-date";
    pub const EXECUTED: &str = "executed";
    pub const ERROR: &str = "error";
}
