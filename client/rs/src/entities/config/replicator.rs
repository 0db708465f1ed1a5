//! # Configuring the Armada Replicator agent
//!
//! The replicator runs co-resident on every pool node. It is
//! configured the same way as core: cli args over environment
//! over config file.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::entities::{
  config::empty_or_redacted,
  image::DataReplication,
  logger::{LogConfig, LogLevel},
};

#[derive(Parser)]
#[command(name = "replicator", author, about, version)]
pub struct ReplicatorCliArgs {
  /// Path of the replicator config file (yaml or json).
  #[arg(long, short = 'c')]
  pub config_path: Option<PathBuf>,

  /// Configure the logging level: error, warn, info, debug, trace.
  /// If passed, overrides any other configured log level.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicatorEnv {
  #[serde(default, alias = "replicator_config_path")]
  pub replicator_config_paths: Option<PathBuf>,
  #[serde(default)]
  pub replicator_pool_id: Option<String>,
  #[serde(default)]
  pub replicator_node_id: Option<String>,
  #[serde(default)]
  pub replicator_listen_port: Option<u16>,
  #[serde(default)]
  pub replicator_pool_secret: Option<String>,
  #[serde(default)]
  pub replicator_logging_level: Option<LogLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
  /// Pool this node belongs to.
  pub pool_id: String,
  /// Platform id of this node.
  pub node_id: String,
  /// Port peers connect to for chunk transfer.
  pub listen_port: u16,
  /// Shared pool secret, the Noise PSK for peer channels.
  pub pool_secret: String,
  /// Directory for chunk archives and scratch space.
  pub work_directory: PathBuf,
  /// Local path of the metadata store mount. The tracker
  /// metadata lives under `pool-{pool_id}/images/`.
  pub metadata_directory: PathBuf,
  /// Images to fetch, in order. Injected from the pool
  /// preload set through start task environment.
  pub images: Vec<String>,
  /// Fixed chunk size in bytes.
  pub chunk_size: usize,
  /// Abort a chunk transfer making no progress for this
  /// many seconds and demote the peer.
  pub chunk_stall_timeout: u64,
  pub data_replication: DataReplication,
  pub logging: LogConfig,
}

impl Default for ReplicatorConfig {
  fn default() -> Self {
    ReplicatorConfig {
      pool_id: String::new(),
      node_id: String::new(),
      listen_port: 6881,
      pool_secret: String::new(),
      work_directory: PathBuf::from("/var/lib/armada/replicator"),
      metadata_directory: PathBuf::from("/mnt/armada-metadata"),
      images: Vec::new(),
      chunk_size: 4 * 1024 * 1024,
      chunk_stall_timeout: 60,
      data_replication: Default::default(),
      logging: Default::default(),
    }
  }
}

impl ReplicatorConfig {
  pub fn sanitized(&self) -> ReplicatorConfig {
    let mut config = self.clone();
    config.pool_secret = empty_or_redacted(&config.pool_secret);
    config
  }
}
