use anyhow::Context;
use armada_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Layer, Registry, layer::SubscriberExt, registry::LookupSpan,
  util::SubscriberInitExt,
};

mod otel;

/// Initialize the global subscriber from a [LogConfig].
///
/// Composes up to three sinks: stdio (standard or json), an
/// optional append-only log file, and an optional otlp export
/// layer.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry = Registry::default()
    .with(LevelFilter::from(log_level))
    .with(stdio_layer(config))
    .with(file_layer(config)?);

  if config.otlp_endpoint.is_empty() {
    registry.try_init()
  } else {
    registry.with(otel::layer(config)).try_init()
  }
  .context("failed to init logger")
}

fn stdio_layer<S>(config: &LogConfig) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
  S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
  let layer = match config.stdio {
    StdioLogMode::None => return None,
    StdioLogMode::Json => {
      tracing_subscriber::fmt::layer().json().boxed()
    }
    StdioLogMode::Standard if config.pretty => {
      tracing_subscriber::fmt::layer()
        .pretty()
        .with_file(false)
        .with_line_number(false)
        .with_target(config.location)
        .with_ansi(config.ansi)
        .boxed()
    }
    StdioLogMode::Standard => tracing_subscriber::fmt::layer()
      .with_file(false)
      .with_line_number(false)
      .with_target(config.location)
      .with_ansi(config.ansi)
      .boxed(),
  };
  Some(layer)
}

fn file_layer<S>(
  config: &LogConfig,
) -> anyhow::Result<Option<Box<dyn Layer<S> + Send + Sync>>>
where
  S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
  if config.file.is_empty() {
    return Ok(None);
  }
  if let Some(parent) = std::path::Path::new(&config.file).parent() {
    std::fs::create_dir_all(parent).with_context(|| {
      format!("failed to create log directory for {}", config.file)
    })?;
  }
  let file = std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(&config.file)
    .with_context(|| {
      format!("failed to open log file {}", config.file)
    })?;
  Ok(Some(
    tracing_subscriber::fmt::layer()
      .with_writer(std::sync::Mutex::new(file))
      .with_ansi(false)
      .with_target(config.location)
      .boxed(),
  ))
}
