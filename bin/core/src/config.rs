use std::{path::Path, sync::OnceLock};

use armada_client::entities::{
  config::{CoreCliArgs, CoreConfig, CoreEnv},
  logger::LogLevel,
};
use clap::Parser;
use colored::Colorize;

pub fn core_args() -> &'static CoreCliArgs {
  static CORE_ARGS: OnceLock<CoreCliArgs> = OnceLock::new();
  CORE_ARGS.get_or_init(CoreCliArgs::parse)
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: CoreEnv = envy::from_env()
      .expect("failed to parse core environment");
    let args = core_args();

    let config_path = args
      .config_path
      .as_ref()
      .or(env.armada_config_paths.as_ref());

    let mut config = match config_path {
      Some(path) => load_config_file(path)
        .expect("failed to parse config file"),
      None => {
        println!(
          "{}: No config path found, using default config",
          "INFO".green(),
        );
        CoreConfig::default()
      }
    };

    if let Some(path) = &env.armada_root_directory {
      config.root_directory = path.clone();
    }
    config.logging.level = args
      .log_level
      .map(LogLevel::from)
      .or(env.armada_logging_level)
      .unwrap_or(config.logging.level);
    if let Some(endpoint) = env.armada_logging_otlp_endpoint {
      config.logging.otlp_endpoint = endpoint;
    }
    if let Some(interval) = env.armada_fed_action_polling_interval
    {
      config.federation_proxy.action_polling_interval = interval;
    }
    if let Some(interval) = env.armada_fed_discovery_interval {
      config.federation_proxy.federation_discovery_interval =
        interval;
    }
    if let Some(interval) = env.armada_fed_blackout_interval {
      config.federation_proxy.blackout_interval = interval;
    }
    if let Some(workers) = env.armada_fed_workers {
      config.federation_proxy.workers = workers;
    }

    if let Some(credentials_path) = args
      .credentials_path
      .as_ref()
      .or(env.armada_credentials_path.as_ref())
    {
      config.credentials = load_config_file(credentials_path)
        .expect("failed to parse credentials file");
    }

    config
  })
}

/// Loads yaml or json by file extension. Yaml is the default;
/// `.json` parses as json.
pub fn load_config_file<T: serde::de::DeserializeOwned>(
  path: &Path,
) -> anyhow::Result<T> {
  use anyhow::Context;
  let contents =
    std::fs::read_to_string(path).with_context(|| {
      format!("failed to read config file {}", path.display())
    })?;
  let is_json = path
    .extension()
    .map(|ext| ext.eq_ignore_ascii_case("json"))
    .unwrap_or(false);
  if is_json {
    serde_json::from_str(&contents).with_context(|| {
      format!("invalid json config at {}", path.display())
    })
  } else {
    serde_yaml_ng::from_str(&contents).with_context(|| {
      format!("invalid yaml config at {}", path.display())
    })
  }
}
