use std::sync::OnceLock;

use armada_client::entities::{
  config::{
    ReplicatorCliArgs, ReplicatorConfig, ReplicatorEnv,
  },
  logger::LogLevel,
};
use clap::Parser;
use colored::Colorize;

pub fn replicator_args() -> &'static ReplicatorCliArgs {
  static REPLICATOR_ARGS: OnceLock<ReplicatorCliArgs> =
    OnceLock::new();
  REPLICATOR_ARGS.get_or_init(ReplicatorCliArgs::parse)
}

pub fn replicator_config() -> &'static ReplicatorConfig {
  static REPLICATOR_CONFIG: OnceLock<ReplicatorConfig> =
    OnceLock::new();
  REPLICATOR_CONFIG.get_or_init(|| {
    let env: ReplicatorEnv = envy::from_env()
      .expect("failed to parse replicator environment");
    let args = replicator_args();

    let config_path = args
      .config_path
      .as_ref()
      .or(env.replicator_config_paths.as_ref());

    let mut config = match config_path {
      Some(path) => {
        let contents = std::fs::read_to_string(path)
          .expect("failed to read replicator config");
        let is_json = path
          .extension()
          .map(|ext| ext.eq_ignore_ascii_case("json"))
          .unwrap_or(false);
        if is_json {
          serde_json::from_str(&contents)
            .expect("invalid json replicator config")
        } else {
          serde_yaml_ng::from_str(&contents)
            .expect("invalid yaml replicator config")
        }
      }
      None => {
        println!(
          "{}: No config path found, using default config",
          "INFO".green(),
        );
        ReplicatorConfig::default()
      }
    };

    if let Some(pool_id) = env.replicator_pool_id {
      config.pool_id = pool_id;
    }
    if let Some(node_id) = env.replicator_node_id {
      config.node_id = node_id;
    }
    if let Some(port) = env.replicator_listen_port {
      config.listen_port = port;
    }
    if let Some(secret) = env.replicator_pool_secret {
      config.pool_secret = secret;
    }
    config.logging.level = args
      .log_level
      .map(LogLevel::from)
      .or(env.replicator_logging_level)
      .unwrap_or(config.logging.level);

    // The distribution plan arrives through start task
    // environment, see the image planner.
    if let Ok(images) = std::env::var("ARMADA_PRELOAD_IMAGES")
      && !images.is_empty()
    {
      config.images =
        images.split(',').map(str::to_string).collect();
    }
    if let Ok(concurrent) =
      std::env::var("ARMADA_CONCURRENT_SOURCE_DOWNLOADS")
      && let Ok(concurrent) = concurrent.parse()
    {
      config
        .data_replication
        .concurrent_source_downloads = concurrent;
    }
    if let Ok(compression) =
      std::env::var("ARMADA_P2P_COMPRESSION")
    {
      config.data_replication.peer_to_peer.compression =
        compression == "1";
    }

    config
  })
}

/// Images this node seeds, from the distribution plan
/// environment.
pub fn seed_images() -> Vec<String> {
  std::env::var("ARMADA_P2P_SEED_IMAGES")
    .ok()
    .filter(|value| !value.is_empty())
    .map(|value| {
      value.split(',').map(str::to_string).collect()
    })
    .unwrap_or_default()
}
