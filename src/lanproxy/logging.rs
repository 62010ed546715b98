use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lanproxy::config;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;
    let json = logging.format.trim().eq_ignore_ascii_case("json");

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json && is_terminal(&logging.output))
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let layer = if json { layer.json().boxed() } else { layer.boxed() };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn is_terminal(output: &str) -> bool {
    use std::io::IsTerminal;
    match output.trim() {
        "stderr" => io::stderr().is_terminal(),
        "stdout" => io::stdout().is_terminal(),
        _ => false,
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive(" warning "), "warn");
        assert_eq!(level_directive("verbose"), "info");
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("lanproxy_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("client.log");
        let (_writer, _guard) = make_writer(path.to_str().unwrap()).unwrap();
        assert!(path.is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
