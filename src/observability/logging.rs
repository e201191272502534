//! tracing-subscriber setup for the CLI
//!
//! Output goes to stderr as compact text unless `LOG_FORMAT` asks for `json`
//! (CI log collectors) or `pretty`. Level comes from `-v` flags, then
//! `LOG_LEVEL`, then INFO. `LOG_SPANS=true` adds span open/close events and
//! `RUST_LOG` replaces the filter entirely.
//!
//! ```bash
//! LOG_FORMAT=json ./instrument-pubsub --endpoint broker.example.com --is-ci
//! LOG_LEVEL=DEBUG ./instrument-pubsub --endpoint localhost
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose chatter is capped at WARN unless RUST_LOG says otherwise
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc=warn", "rustls=warn", "tokio=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    Pretty,
    /// Single-line colored output, the default
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to compact
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }

    pub fn from_env() -> Self {
        env::var("LOG_FORMAT")
            .map(|value| Self::parse(&value))
            .unwrap_or(LogFormat::Compact)
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Map repeated `-v` flags onto a level; zero defers to `LOG_LEVEL`
pub fn level_from_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => env::var("LOG_LEVEL")
            .map(|value| parse_level(&value))
            .unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn spans_from_env() -> bool {
    env::var("LOG_SPANS")
        .map(|value| value.to_lowercase() == "true")
        .unwrap_or(false)
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(
    level: Level,
    format: LogFormat,
    include_spans: bool,
) -> Result<(), TryInitError> {
    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    }
}

/// Initialize logging from the verbosity flag and environment variables
pub fn init_default_logging(verbose: u8) -> Result<(), TryInitError> {
    init_logging(
        level_from_verbosity(verbose),
        LogFormat::from_env(),
        spans_from_env(),
    )
}

/// Span around a broker operation (connect, subscribe, publish)
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Span around a lifecycle coordinator transition
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {lifecycle_span, mqtt_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_compact() {
        assert_eq!(LogFormat::parse("invalid"), LogFormat::Compact);
        assert_eq!(LogFormat::parse(""), LogFormat::Compact);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Compact);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("DEBUG", Level::DEBUG),
            ("trace", Level::TRACE),
            ("invalid", Level::INFO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_from_verbosity(1), Level::DEBUG);
        assert_eq!(level_from_verbosity(2), Level::TRACE);
        assert_eq!(level_from_verbosity(5), Level::TRACE);
    }

    #[test]
    fn test_span_macros() {
        let span = mqtt_span!(topic = "test/topic");
        let _guard = span.enter();
        let lifecycle = lifecycle_span!(event = "resumed");
        let _lifecycle_guard = lifecycle.enter();
    }
}
