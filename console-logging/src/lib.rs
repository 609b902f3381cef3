//! Tracing subscriber setup for the cloud console.
//!
//! The console shares stdout with command results, so human-readable logs
//! are written to stderr and, optionally, to a daily-rolling file.

use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter, Layer};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log setting {key}: {value}")]
    InvalidSetting { key: &'static str, value: String },

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("A global subscriber is already installed")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn to_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn to_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" => Ok(LogOutput::Both),
            "none" => Ok(LogOutput::None),
            _ => Err(LoggingError::InvalidSetting {
                key: "output",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidSetting {
                key: "format",
                value: s.to_string(),
            }),
        }
    }
}

/// Logging section of the console configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file: env::temp_dir().join("cloud-console.log"),
        }
    }
}

impl LogSettings {
    /// Applies `CONSOLE_LOG_*` overrides on top of the configured values.
    pub fn with_env_overrides(mut self) -> Result<Self, LoggingError> {
        if let Ok(level) = env::var("CONSOLE_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(output) = env::var("CONSOLE_LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Ok(format) = env::var("CONSOLE_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Ok(file) = env::var("CONSOLE_LOG_FILE") {
            self.file = PathBuf::from(file);
        }
        Ok(self)
    }

    /// Builds the level filter. `RUST_LOG` takes precedence when set.
    pub fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.level)?,
        };
        Ok(filter.add_directive("tokio=warn".parse()?))
    }
}

/// Installs the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process when file
/// output is enabled; dropping it stops the background log writer.
pub fn init_subscriber(settings: &LogSettings) -> Result<Option<WorkerGuard>, LoggingError> {
    let env_filter = settings.env_filter()?;
    let is_json = settings.format == LogFormat::Json;

    let console_layer = settings.output.to_console().then(|| {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
        if is_json {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        }
    });

    let mut guard: Option<WorkerGuard> = None;
    let file_layer = if settings.output.to_file() {
        let log_dir = settings
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let log_filename = settings
            .file
            .file_name()
            .unwrap_or("cloud-console.log".as_ref());
        let appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);

        let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
        Some(if is_json {
            layer.json().boxed()
        } else {
            layer.boxed()
        })
    } else {
        None
    };

    registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(level = %settings.level, output = ?settings.output, "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_output_and_format_case_insensitively() {
        assert_eq!("BOTH".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn output_routing() {
        assert!(LogOutput::Both.to_console() && LogOutput::Both.to_file());
        assert!(!LogOutput::None.to_console() && !LogOutput::None.to_file());
        assert!(LogOutput::File.to_file() && !LogOutput::File.to_console());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: LogSettings = serde_yaml_ng::from_str("level: debug\n").unwrap();
        assert_eq!(settings.level, "debug");
        assert_eq!(settings.output, LogOutput::Console);
        assert_eq!(settings.format, LogFormat::Human);
    }
}
