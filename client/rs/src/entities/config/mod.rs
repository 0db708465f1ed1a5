use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::entities::{
  data::VolumeMount,
  image::{ContainerRegistry, DataReplication, PrivateMirror},
};

mod core;
mod replicator;

pub use self::core::*;
pub use self::replicator::*;

/// Replace a secret value with a marker for sanitized
/// startup config printing.
pub fn empty_or_redacted(value: &str) -> String {
  if value.is_empty() {
    String::new()
  } else {
    String::from("##############")
  }
}

/// Credentials document. Values are either plaintext, an
/// indirection into the secret vault, or sealed to the engine
/// decryption key.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct CredentialsConfig {
  /// Batch platform accounts by binding name.
  pub platform_accounts: IndexMap<String, PlatformAccount>,
  /// Object storage accounts by binding name.
  pub storage_accounts: IndexMap<String, StorageAccount>,
  /// Container registry logins.
  pub registries: Vec<ContainerRegistry>,
  /// Identity provider client credentials.
  pub identity: Option<IdentityCredential>,
  /// Free-form named secrets available to the engine.
  pub secrets: IndexMap<String, SecretValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformAccount {
  pub service_url: String,
  pub key: SecretValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAccount {
  pub endpoint: String,
  pub key: SecretValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCredential {
  pub tenant: String,
  pub client_id: String,
  pub client_secret: SecretValue,
}

/// The three ways a secret may be specified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretValue {
  /// Inline plaintext.
  Plain(String),
  /// Uri resolved through the secret vault capability.
  VaultRef { uri: String },
  /// Base64 Noise-N ciphertext sealed to the engine key
  /// identified by thumbprint.
  Sealed { thumbprint: String, data: String },
}

impl SecretValue {
  /// Marker used in sanitized config output.
  pub fn redacted(&self) -> &'static str {
    match self {
      SecretValue::Plain(_) => "<plain:redacted>",
      SecretValue::VaultRef { .. } => "<vault>",
      SecretValue::Sealed { .. } => "<sealed>",
    }
  }
}

/// Engine-wide settings shared by every action.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct GlobalConfig {
  /// Storage account binding holding engine metadata
  /// (federation queues, leases, replication maps, markers).
  pub metadata_storage: String,
  /// Encryption settings for sealed credentials.
  pub encryption: EncryptionConfig,
  /// Known registries, with an optional private mirror.
  pub registries: Vec<ContainerRegistry>,
  pub private_mirror: Option<PrivateMirror>,
  pub data_replication: DataReplication,
  /// Images preloaded on every pool unless overridden.
  pub docker_images: Vec<String>,
  pub singularity_images: Vec<String>,
  /// Volume definitions referenced by alias from pools.
  pub volumes: Vec<VolumeMount>,
}

#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct EncryptionConfig {
  /// Hex SHA-256 thumbprint of the engine public key.
  pub thumbprint: String,
  /// Path to the base64 X25519 private key file.
  pub private_key_path: String,
}

/// Federation proxy runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationProxyConfig {
  /// Seconds between federation membership refreshes.
  pub federation_discovery_interval: u64,
  /// Seconds between action queue polls.
  pub action_polling_interval: u64,
  /// Minimum seconds before re-selecting the same pool after a
  /// successful submission.
  pub blackout_interval: u64,
  /// Leader lease time-to-live in seconds.
  pub lease_ttl: u64,
  /// Bounded worker pool size for concurrent action groups.
  pub workers: usize,
  /// Trigger a scale evaluation on autoscale pools after each
  /// successful submission.
  pub evaluate_autoscale_after_success: bool,
  /// Mirror the proxy log file to shared storage at this
  /// `container/prefix`, empty disables mirroring.
  pub log_persistence_path: String,
}

impl Default for FederationProxyConfig {
  fn default() -> Self {
    FederationProxyConfig {
      federation_discovery_interval: 30,
      action_polling_interval: 5,
      blackout_interval: 15,
      lease_ttl: 30,
      workers: 4,
      evaluate_autoscale_after_success: false,
      log_persistence_path: String::new(),
    }
  }
}
