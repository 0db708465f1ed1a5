//! # Configuring the Armada Core engine
//!
//! The core configuration is passed in three ways:
//! 1. Command line args ([CoreCliArgs])
//! 2. Environment variables ([CoreEnv])
//! 3. Configuration file ([CoreConfig])
//!
//! Cli args take priority over environment variables, which take
//! priority over the configuration file.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::entities::{
  config::{
    CredentialsConfig, FederationProxyConfig, GlobalConfig,
    empty_or_redacted,
  },
  logger::{LogConfig, LogLevel},
};

#[derive(Parser)]
#[command(name = "core", author, about, version)]
pub struct CoreCliArgs {
  #[command(subcommand)]
  pub command: CoreCommand,

  /// Path of the engine config file (yaml or json).
  #[arg(long, short = 'c')]
  pub config_path: Option<PathBuf>,

  /// Path of the credentials file (yaml or json).
  #[arg(long)]
  pub credentials_path: Option<PathBuf>,

  /// Configure the logging level: error, warn, info, debug, trace.
  /// If passed, overrides any other configured log level.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum CoreCommand {
  /// Pool lifecycle operations. (alias: `p`)
  #[clap(alias = "p")]
  Pool {
    #[command(subcommand)]
    command: PoolCommand,
  },
  /// Job and task operations. (alias: `j`)
  #[clap(alias = "j")]
  Jobs {
    #[command(subcommand)]
    command: JobsCommand,
  },
  /// Federation proxy and action operations. (alias: `f`)
  #[clap(alias = "f")]
  Fed {
    #[command(subcommand)]
    command: FedCommand,
  },
  /// Stream task output to stdout.
  Log {
    /// Job to observe. Defaults to the last submitted job.
    #[arg(long)]
    job: Option<String>,
    /// Task to observe. Defaults to the first running task.
    #[arg(long)]
    task: Option<String>,
  },
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum PoolCommand {
  /// Allocate the pool described by the pool config file.
  Add { spec: PathBuf },
  /// Resize a pool to new node targets.
  Resize {
    id: String,
    #[arg(long, default_value_t = 0)]
    dedicated: u32,
    #[arg(long, default_value_t = 0)]
    preemptible: u32,
  },
  /// Delete a pool and everything on it.
  Del { id: String },
  /// Run pool-scope ingress for an existing pool.
  Ingress { spec: PathBuf },
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum JobsCommand {
  /// Expand, compile, and submit the jobs config file.
  Add { spec: PathBuf },
  /// Terminate a job and its tasks.
  Term { id: String },
  /// Delete a job.
  Del { id: String },
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum FedCommand {
  /// Run the federation proxy until terminated.
  Proxy { federation: String },
  /// Enqueue the jobs config file against a federation.
  Submit {
    federation: String,
    spec: PathBuf,
  },
  /// List per-action status for a federation.
  Actions { federation: String },
  /// Unconditionally remove an action from the queue.
  Zap {
    federation: String,
    unique_id: uuid::Uuid,
  },
}

/// # Core Environment Variables
///
/// Passed in `UPPER_SNAKE_CASE`. Overridden by the equivalent
/// cli args, overrides the equivalent config file entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreEnv {
  #[serde(default, alias = "armada_config_path")]
  pub armada_config_paths: Option<PathBuf>,
  #[serde(default)]
  pub armada_credentials_path: Option<PathBuf>,
  #[serde(default)]
  pub armada_root_directory: Option<PathBuf>,
  #[serde(default)]
  pub armada_logging_level: Option<LogLevel>,
  #[serde(default)]
  pub armada_logging_otlp_endpoint: Option<String>,
  #[serde(default)]
  pub armada_fed_action_polling_interval: Option<u64>,
  #[serde(default)]
  pub armada_fed_discovery_interval: Option<u64>,
  #[serde(default)]
  pub armada_fed_blackout_interval: Option<u64>,
  #[serde(default)]
  pub armada_fed_workers: Option<usize>,
}

/// Engine configuration file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
  /// Directory for engine-local files (retrieved logs,
  /// fan-out staging, key material).
  pub root_directory: PathBuf,
  pub logging: LogConfig,
  pub global: GlobalConfig,
  pub credentials: CredentialsConfig,
  pub federation_proxy: FederationProxyConfig,
  /// Print the full startup config multi-line.
  pub pretty_startup_config: bool,
}

impl Default for CoreConfig {
  fn default() -> Self {
    CoreConfig {
      root_directory: PathBuf::from("/var/lib/armada"),
      logging: Default::default(),
      global: Default::default(),
      credentials: Default::default(),
      federation_proxy: Default::default(),
      pretty_startup_config: false,
    }
  }
}

impl CoreConfig {
  /// Copy with secret material replaced, safe to log.
  pub fn sanitized(&self) -> CoreConfig {
    let mut config = self.clone();
    for account in config.credentials.platform_accounts.values_mut()
    {
      account.key = super::SecretValue::Plain(empty_or_redacted("x"));
    }
    for account in config.credentials.storage_accounts.values_mut() {
      account.key = super::SecretValue::Plain(empty_or_redacted("x"));
    }
    if let Some(identity) = &mut config.credentials.identity {
      identity.client_secret =
        super::SecretValue::Plain(empty_or_redacted("x"));
    }
    for secret in config.credentials.secrets.values_mut() {
      *secret = super::SecretValue::Plain(empty_or_redacted("x"));
    }
    config
  }
}
