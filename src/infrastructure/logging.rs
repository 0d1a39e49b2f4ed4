//! Process-wide tracing setup for the host
//!
//! Console output goes to stderr so the interactive prompt on stdout stays
//! readable. File output rolls over in `log_dir` as `<prefix>.<date>.log`.

use crate::domain::settings::LogSettings;
use anyhow::Context;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

const FALLBACK_LEVEL: &str = "info";
const LOG_FILE_SUFFIX: &str = "log";

/// Flushes the file writer when dropped; hold it for the life of the process
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` first, then the configured level. `None` in the second slot
/// means the configured level was accepted.
fn level_filter(settings: &LogSettings) -> (EnvFilter, Option<String>) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, None);
    }
    match EnvFilter::try_new(&settings.level) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(FALLBACK_LEVEL), Some(e.to_string())),
    }
}

fn output_layer<S, W>(settings: &LogSettings, writer: W, ansi: bool) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target)
}

/// Install the global subscriber. Fails if one is already set.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let (filter, rejected_level) = level_filter(settings);

    let console = settings
        .console_logging_enabled
        .then(|| output_layer(settings, std::io::stderr, settings.ansi_colors));

    let mut file_guard = None;
    let file = if settings.file_logging_enabled {
        std::fs::create_dir_all(&settings.log_dir)
            .with_context(|| format!("Cannot create log directory {}", settings.log_dir))?;
        let appender = RollingFileAppender::builder()
            .rotation(rotation(&settings.rotation))
            .filename_prefix(&settings.file_name_prefix)
            .filename_suffix(LOG_FILE_SUFFIX)
            .build(&settings.log_dir)
            .context("Cannot open rolling log file")?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        Some(output_layer(settings, writer, false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()?;

    if let Some(reason) = rejected_level {
        tracing::warn!(
            "Invalid log level '{}' ({}), using {}",
            settings.level,
            reason,
            FALLBACK_LEVEL
        );
    }
    tracing::info!(
        "Logging initialized (console: {}, file: {})",
        settings.console_logging_enabled,
        settings.file_logging_enabled
    );

    Ok(LoggingGuard { _file: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("HOURLY"), Rotation::HOURLY);
        assert_eq!(rotation("minutely"), Rotation::MINUTELY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_invalid_level_falls_back() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let settings = LogSettings {
            level: "bodynodes_host=loudest".to_string(),
            ..Default::default()
        };
        let (_, rejected) = level_filter(&settings);
        assert!(rejected.is_some());

        let settings = LogSettings {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert!(level_filter(&settings).1.is_none());
    }

    #[test]
    fn test_console_only_logger() {
        let settings = LogSettings {
            file_logging_enabled: false,
            ansi_colors: false,
            ..Default::default()
        };
        // Another test may already own the global subscriber
        if let Ok(guard) = init_logger(&settings) {
            drop(guard);
        }
        assert!(init_logger(&settings).is_err());
    }
}
