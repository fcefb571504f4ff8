use std::{io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::backhaul::config::LoggingConfig;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

fn parse_format(s: &str) -> LogFormat {
    match s.trim().to_ascii_lowercase().as_str() {
        "text" | "pretty" => LogFormat::Text,
        _ => LogFormat::Json,
    }
}

fn parse_target(s: &str) -> LogTarget {
    match s.trim() {
        "" | "stderr" => LogTarget::Stderr,
        "stdout" => LogTarget::Stdout,
        "discard" => LogTarget::Discard,
        path => LogTarget::File(PathBuf::from(path)),
    }
}

/// Level directive for the configured level; unknown values fall back to `info`.
fn level_directive(s: &str) -> &'static str {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let format = parse_format(&logging.format);
    let (writer, guard) = make_writer(parse_target(&logging.output))?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == LogFormat::Text)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Text => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(target: LogTarget) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match target {
        LogTarget::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
        LogTarget::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
        LogTarget::Discard => Ok(tracing_appender::non_blocking(io::sink())),
        LogTarget::File(p) => {
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_outputs_and_formats() {
        assert_eq!(parse_target(" stderr "), LogTarget::Stderr);
        assert_eq!(parse_target(""), LogTarget::Stderr);
        assert_eq!(parse_target("discard"), LogTarget::Discard);
        assert_eq!(
            parse_target("/var/log/backhaul.log"),
            LogTarget::File(PathBuf::from("/var/log/backhaul.log"))
        );
        assert_eq!(parse_format("TEXT"), LogFormat::Text);
        assert_eq!(parse_format("logfmt"), LogFormat::Json);
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_directive("Debug"), "debug");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("verbose"), "info");
    }
}
