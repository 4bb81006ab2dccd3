//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and, when the log
//! directory is writable, to a JSON file per process.

use crate::config::ConfigManager;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console and JSON file logging under `./log`
pub fn init_structured_logging() {
    init_structured_logging_in(Path::new("log"));
}

/// Initialize console logging plus a JSON file in `log_dir`.
///
/// Only the first call in a process has any effect. An existing global
/// subscriber is left in place.
pub fn init_structured_logging_in(log_dir: &Path) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let pid = process::id();

        let log_path = prepare_log_file(log_dir, &environment, pid);
        let (file_writer, guard) = match log_path.as_ref().and_then(|path| path.file_name()) {
            Some(file_name) => {
                let appender = tracing_appender::rolling::never(log_dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (Some(writer), Some(guard))
            }
            None => (None, None),
        };

        let file_layer = file_writer.map(|writer| {
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(build_filter(&log_level))
        });

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(build_filter(&log_level)),
            )
            .with(file_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = log_path.as_ref().map(|path| path.display().to_string()),
            "Structured logging initialized"
        );

        // The writer thread must outlive every log call in the process
        if let Some(guard) = guard {
            std::mem::forget(guard);
        }
    });
}

/// `RUST_LOG` wins over the environment default
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn prepare_log_file(log_dir: &Path, environment: &str, pid: u32) -> Option<PathBuf> {
    if let Err(error) = fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {}: {error}; logging to console only",
            log_dir.display()
        );
        return None;
    }
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    Some(log_dir.join(format!("{environment}.{pid}.{timestamp}.log")))
}

fn get_environment() -> String {
    ConfigManager::detect_environment()
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log one resilience operation with its outcome
pub fn log_resilience_operation(
    component: &str,
    operation: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        component = %component,
        operation = %operation,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "RESILIENCE_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_log_file_name_carries_environment_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepare_log_file(dir.path(), "test", 42).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("test.42."));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_structured_logging_in(dir.path());
        init_structured_logging_in(dir.path());
        log_resilience_operation("batch", "flush", "ok", None);
    }
}
