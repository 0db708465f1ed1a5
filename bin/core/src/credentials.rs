//! The credential store: turns the credentials document into an
//! in-memory map of `logical name -> secret`.
//!
//! Three source forms are supported. Plaintext is taken as is.
//! Vault references resolve through the [SecretVault] capability
//! with a bearer token from the [IdentityProvider]. Sealed
//! values are base64 one-way Noise ciphertexts decrypted with
//! the locally held key matching the configured thumbprint.
//!
//! Plaintext never leaves the store: values are absent from
//! Debug output and every known secret is scrubbed from command
//! logs through the exported replacer pairs.

use anyhow::Context;
use armada_client::{
  entities::config::{CredentialsConfig, SecretValue},
  error::EngineError,
};
use data_encoding::BASE64;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::platform::{IdentityProvider, OpContext, SecretVault};

const SEAL_PATTERN: &str = "Noise_N_25519_ChaChaPoly_BLAKE2s";

/// Identity scope used for vault access tokens.
const VAULT_SCOPE: &str = "vault";

pub struct CredentialStore {
  secrets: IndexMap<String, String>,
}

impl std::fmt::Debug for CredentialStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CredentialStore")
      .field("names", &self.secrets.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl CredentialStore {
  /// Resolves every secret in the credentials document.
  /// Decryption failures are fatal and abort the action.
  pub async fn resolve(
    ctx: &OpContext,
    config: &CredentialsConfig,
    vault: &impl SecretVault,
    identity: &impl IdentityProvider,
    keys: Option<&SealKeys>,
  ) -> Result<CredentialStore, EngineError> {
    let mut resolver = Resolver {
      ctx,
      vault,
      identity,
      keys,
      token: None,
    };
    let mut secrets = IndexMap::new();

    for (name, account) in &config.platform_accounts {
      secrets.insert(
        format!("platform:{name}"),
        resolver.resolve(&account.key).await?,
      );
    }
    for (name, account) in &config.storage_accounts {
      secrets.insert(
        format!("storage:{name}"),
        resolver.resolve(&account.key).await?,
      );
    }
    for registry in &config.registries {
      if let Some(value) =
        config.secrets.get(&registry.password_secret)
      {
        secrets.insert(
          format!("registry:{}", registry.domain),
          resolver.resolve(value).await?,
        );
      }
    }
    if let Some(identity_cred) = &config.identity {
      secrets.insert(
        "identity:client_secret".to_string(),
        resolver.resolve(&identity_cred.client_secret).await?,
      );
    }
    for (name, value) in &config.secrets {
      secrets
        .insert(name.clone(), resolver.resolve(value).await?);
    }

    Ok(CredentialStore { secrets })
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.secrets.get(name).map(String::as_str)
  }

  pub fn require(&self, name: &str) -> Result<&str, EngineError> {
    self.get(name).ok_or_else(|| {
      EngineError::validation(
        format!("credentials.{name}"),
        "secret is not defined",
      )
    })
  }

  /// `(secret value, replacement)` pairs for scrubbing logs.
  pub fn replacers(&self) -> Vec<(String, String)> {
    self
      .secrets
      .iter()
      .filter(|(_, value)| !value.is_empty())
      .map(|(name, value)| {
        (value.clone(), format!("<{name}:redacted>"))
      })
      .collect()
  }

  /// Scrub every known secret out of the text.
  pub fn scrub(&self, text: &str) -> String {
    svi::replace_in_string(text, &self.replacers())
  }
}

struct Resolver<'a, V, I> {
  ctx: &'a OpContext,
  vault: &'a V,
  identity: &'a I,
  keys: Option<&'a SealKeys>,
  token: Option<String>,
}

impl<V: SecretVault, I: IdentityProvider> Resolver<'_, V, I> {
  async fn resolve(
    &mut self,
    value: &SecretValue,
  ) -> Result<String, EngineError> {
    match value {
      SecretValue::Plain(value) => Ok(value.clone()),
      SecretValue::VaultRef { uri } => {
        let token = self.token().await?;
        let bytes = self
          .vault
          .get_secret(self.ctx, &token, uri)
          .await
          .map_err(EngineError::from)?;
        String::from_utf8(bytes).map_err(|_| {
          EngineError::Integrity(format!(
            "vault secret {uri} is not valid utf-8"
          ))
        })
      }
      SecretValue::Sealed { thumbprint, data } => {
        let keys = self.keys.ok_or_else(|| {
          EngineError::Integrity(
            "sealed secret present but no decryption key is configured"
              .into(),
          )
        })?;
        if *thumbprint != keys.thumbprint {
          return Err(EngineError::Integrity(format!(
            "sealed secret thumbprint {thumbprint} does not match the configured key {}",
            keys.thumbprint
          )));
        }
        keys.unseal(data).map_err(|e| {
          EngineError::Integrity(format!(
            "failed to decrypt sealed secret | {e:#}"
          ))
        })
      }
    }
  }

  async fn token(&mut self) -> Result<String, EngineError> {
    if let Some(token) = &self.token {
      return Ok(token.clone());
    }
    let (token, _expiry) = self
      .identity
      .token(self.ctx, VAULT_SCOPE)
      .await
      .map_err(EngineError::from)?;
    self.token = Some(token.clone());
    Ok(token)
  }
}

/// X25519 keypair used to unseal credentials. The thumbprint is
/// the hex SHA-256 of the public key, matching the identifier
/// callers put next to sealed values.
pub struct SealKeys {
  private: Vec<u8>,
  public: Vec<u8>,
  pub thumbprint: String,
}

impl SealKeys {
  pub fn new(private: Vec<u8>, public: Vec<u8>) -> SealKeys {
    let mut hasher = Sha256::new();
    hasher.update(&public);
    let thumbprint = hex::encode(hasher.finalize());
    SealKeys {
      private,
      public,
      thumbprint,
    }
  }

  pub fn generate() -> anyhow::Result<SealKeys> {
    let keypair = snow::Builder::new(
      SEAL_PATTERN.parse().context("invalid seal pattern")?,
    )
    .generate_keypair()
    .context("failed to generate seal keypair")?;
    Ok(SealKeys::new(keypair.private, keypair.public))
  }

  /// Loads a two line key file: base64 private key then base64
  /// public key.
  pub fn from_file(
    path: impl AsRef<std::path::Path>,
  ) -> anyhow::Result<SealKeys> {
    let path = path.as_ref();
    let contents =
      std::fs::read_to_string(path).with_context(|| {
        format!("failed to read key file {}", path.display())
      })?;
    let mut lines = contents.lines();
    let private = BASE64
      .decode(
        lines
          .next()
          .context("key file is missing the private key line")?
          .trim()
          .as_bytes(),
      )
      .context("invalid base64 private key")?;
    let public = BASE64
      .decode(
        lines
          .next()
          .context("key file is missing the public key line")?
          .trim()
          .as_bytes(),
      )
      .context("invalid base64 public key")?;
    Ok(SealKeys::new(private, public))
  }

  /// Seal a secret to this keypair's public key. Used by the
  /// operator tooling that prepares credential documents.
  pub fn seal(&self, plaintext: &str) -> anyhow::Result<String> {
    let mut initiator = snow::Builder::new(
      SEAL_PATTERN.parse().context("invalid seal pattern")?,
    )
    .remote_public_key(&self.public)
    .context("invalid recipient public key")?
    .build_initiator()
    .context("failed to build sealer")?;
    let mut buf = vec![0u8; plaintext.len() + 128];
    let len = initiator
      .write_message(plaintext.as_bytes(), &mut buf)
      .context("failed to seal secret")?;
    Ok(BASE64.encode(&buf[..len]))
  }

  fn unseal(&self, data: &str) -> anyhow::Result<String> {
    let ciphertext = BASE64
      .decode(data.as_bytes())
      .context("sealed value is not valid base64")?;
    let mut responder = snow::Builder::new(
      SEAL_PATTERN.parse().context("invalid seal pattern")?,
    )
    .local_private_key(&self.private)
    .context("invalid decryption private key")?
    .build_responder()
    .context("failed to build unsealer")?;
    let mut buf = vec![0u8; ciphertext.len()];
    let len = responder
      .read_message(&ciphertext, &mut buf)
      .context("ciphertext rejected")?;
    String::from_utf8(buf[..len].to_vec())
      .context("decrypted secret is not valid utf-8")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::memory::{MemoryIdentity, MemoryVault};
  use armada_client::entities::config::SecretValue;

  fn config_with(
    name: &str,
    value: SecretValue,
  ) -> CredentialsConfig {
    let mut config = CredentialsConfig::default();
    config.secrets.insert(name.to_string(), value);
    config
  }

  #[tokio::test]
  async fn plaintext_resolves_directly() {
    let ctx = OpContext::default();
    let store = CredentialStore::resolve(
      &ctx,
      &config_with("db", SecretValue::Plain("pass".into())),
      &MemoryVault::default(),
      &MemoryIdentity::default(),
      None,
    )
    .await
    .unwrap();
    assert_eq!(store.get("db"), Some("pass"));
  }

  #[tokio::test]
  async fn vault_reference_resolves_through_vault() {
    let ctx = OpContext::default();
    let vault = MemoryVault::default()
      .with_secret("https://vault/secrets/db", "vaulted");
    let store = CredentialStore::resolve(
      &ctx,
      &config_with(
        "db",
        SecretValue::VaultRef {
          uri: "https://vault/secrets/db".into(),
        },
      ),
      &vault,
      &MemoryIdentity::default(),
      None,
    )
    .await
    .unwrap();
    assert_eq!(store.get("db"), Some("vaulted"));
  }

  #[tokio::test]
  async fn sealed_secret_round_trip() {
    let ctx = OpContext::default();
    let keys = SealKeys::generate().unwrap();
    let sealed = keys.seal("wrapped-secret").unwrap();
    let store = CredentialStore::resolve(
      &ctx,
      &config_with(
        "db",
        SecretValue::Sealed {
          thumbprint: keys.thumbprint.clone(),
          data: sealed,
        },
      ),
      &MemoryVault::default(),
      &MemoryIdentity::default(),
      Some(&keys),
    )
    .await
    .unwrap();
    assert_eq!(store.get("db"), Some("wrapped-secret"));
  }

  #[tokio::test]
  async fn thumbprint_mismatch_is_integrity_failure() {
    let ctx = OpContext::default();
    let keys = SealKeys::generate().unwrap();
    let sealed = keys.seal("value").unwrap();
    let result = CredentialStore::resolve(
      &ctx,
      &config_with(
        "db",
        SecretValue::Sealed {
          thumbprint: "deadbeef".into(),
          data: sealed,
        },
      ),
      &MemoryVault::default(),
      &MemoryIdentity::default(),
      Some(&keys),
    )
    .await;
    assert!(matches!(result, Err(EngineError::Integrity(_))));
  }

  #[tokio::test]
  async fn corrupted_ciphertext_is_integrity_failure() {
    let ctx = OpContext::default();
    let keys = SealKeys::generate().unwrap();
    let result = CredentialStore::resolve(
      &ctx,
      &config_with(
        "db",
        SecretValue::Sealed {
          thumbprint: keys.thumbprint.clone(),
          data: BASE64.encode(b"garbage"),
        },
      ),
      &MemoryVault::default(),
      &MemoryIdentity::default(),
      Some(&keys),
    )
    .await;
    assert!(matches!(result, Err(EngineError::Integrity(_))));
  }

  #[tokio::test]
  async fn scrubbing_removes_known_secrets() {
    let ctx = OpContext::default();
    let store = CredentialStore::resolve(
      &ctx,
      &config_with("token", SecretValue::Plain("hunter2".into())),
      &MemoryVault::default(),
      &MemoryIdentity::default(),
      None,
    )
    .await
    .unwrap();
    let scrubbed =
      store.scrub("docker login -p hunter2 reg.io");
    assert!(!scrubbed.contains("hunter2"));
    assert!(scrubbed.contains("<token:redacted>"));
  }
}
