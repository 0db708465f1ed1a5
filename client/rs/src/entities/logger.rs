use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// The logging verbosity level.
  pub level: LogLevel,
  /// How to handle logging to stdio.
  pub stdio: StdioLogMode,
  /// Whether to use pretty (multi-line) stdio logging.
  pub pretty: bool,
  /// Whether to include the module location in logs.
  pub location: bool,
  /// Whether to emit ansi colors in stdio logs.
  pub ansi: bool,
  /// Also write logs to this file. Empty disables the file
  /// sink. The federation proxy mirrors this file to shared
  /// storage.
  pub file: String,
  /// Export logs to an otlp collector at this endpoint.
  /// Empty disables otlp export.
  pub otlp_endpoint: String,
  /// Service name attached to otlp export.
  pub opentelemetry_service_name: String,
  /// Scope name attached to otlp export.
  pub opentelemetry_scope_name: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    LogConfig {
      level: LogLevel::Info,
      stdio: StdioLogMode::Standard,
      pretty: false,
      location: false,
      ansi: true,
      file: String::new(),
      otlp_endpoint: String::new(),
      opentelemetry_service_name: String::from("Armada"),
      opentelemetry_scope_name: String::from("armada.engine"),
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  #[default]
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(value: LogLevel) -> Self {
    match value {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

impl From<tracing::Level> for LogLevel {
  fn from(value: tracing::Level) -> Self {
    match value {
      tracing::Level::TRACE => LogLevel::Trace,
      tracing::Level::DEBUG => LogLevel::Debug,
      tracing::Level::INFO => LogLevel::Info,
      tracing::Level::WARN => LogLevel::Warn,
      tracing::Level::ERROR => LogLevel::Error,
    }
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
