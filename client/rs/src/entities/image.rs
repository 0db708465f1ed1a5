use serde::{Deserialize, Serialize};

/// Fully qualified container image reference.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ImageRef {
  /// Registry domain, eg "myregistry.example.com".
  /// Empty means the public default registry.
  #[serde(default)]
  pub registry: String,
  pub repository: String,
  #[serde(default = "default_tag")]
  pub tag: String,
  /// Content digest, when pinned.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub digest: Option<String>,
  /// Thumbprint of the certificate able to decrypt an
  /// encrypted container.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub decryption_cert_thumbprint: Option<String>,
  /// Fingerprint of the image signing key.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub signing_key_fingerprint: Option<String>,
}

fn default_tag() -> String {
  String::from("latest")
}

impl Default for ImageRef {
  fn default() -> Self {
    ImageRef {
      registry: String::new(),
      repository: String::new(),
      tag: default_tag(),
      digest: None,
      decryption_cert_thumbprint: None,
      signing_key_fingerprint: None,
    }
  }
}

impl ImageRef {
  /// Parses `[registry/]repository[:tag][@digest]`.
  pub fn parse(reference: &str) -> anyhow::Result<ImageRef> {
    if reference.is_empty() {
      anyhow::bail!("image reference must not be empty");
    }
    let (rest, digest) = match reference.split_once('@') {
      Some((rest, digest)) => (rest, Some(digest.to_string())),
      None => (reference, None),
    };
    // A registry component contains '.' or ':' before the first '/'.
    let (registry, remainder) = match rest.split_once('/') {
      Some((first, remainder))
        if first.contains('.') || first.contains(':') =>
      {
        (first.to_string(), remainder)
      }
      _ => (String::new(), rest),
    };
    let (repository, tag) = match remainder.rsplit_once(':') {
      Some((repository, tag)) if !tag.contains('/') => {
        (repository.to_string(), tag.to_string())
      }
      _ => (remainder.to_string(), default_tag()),
    };
    if repository.is_empty() {
      anyhow::bail!("image reference {reference} has no repository");
    }
    Ok(ImageRef {
      registry,
      repository,
      tag,
      digest,
      decryption_cert_thumbprint: None,
      signing_key_fingerprint: None,
    })
  }

  /// The reference passed to the container runtime.
  pub fn reference(&self) -> String {
    let mut out = String::new();
    if !self.registry.is_empty() {
      out.push_str(&self.registry);
      out.push('/');
    }
    out.push_str(&self.repository);
    out.push(':');
    out.push_str(&self.tag);
    if let Some(digest) = &self.digest {
      out.push('@');
      out.push_str(digest);
    }
    out
  }
}

impl std::fmt::Display for ImageRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.reference())
  }
}

/// Container registry login target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRegistry {
  pub domain: String,
  pub username: String,
  /// Logical name of the password in the credential store.
  pub password_secret: String,
}

/// Pool image distribution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataReplication {
  pub peer_to_peer: PeerToPeer,
  /// Upper bound on concurrent pulls from the origin registry
  /// across the whole pool.
  pub concurrent_source_downloads: u32,
}

impl Default for DataReplication {
  fn default() -> Self {
    DataReplication {
      peer_to_peer: PeerToPeer::default(),
      concurrent_source_downloads: 10,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerToPeer {
  pub enabled: bool,
  /// Number of nodes designated as seeds pulling directly
  /// from the origin registry.
  pub direct_download_seed_bias: u32,
  /// Advisory: seeds compress chunk archives before announcing.
  pub compression: bool,
}

impl Default for PeerToPeer {
  fn default() -> Self {
    PeerToPeer {
      enabled: false,
      direct_download_seed_bias: 1,
      compression: true,
    }
  }
}

/// Optional private mirror all nodes can pull from instead of
/// the origin registry.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct PrivateMirror {
  pub domain: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_bare_repository() {
    let image = ImageRef::parse("busybox").unwrap();
    assert_eq!(image.registry, "");
    assert_eq!(image.repository, "busybox");
    assert_eq!(image.tag, "latest");
    assert_eq!(image.reference(), "busybox:latest");
  }

  #[test]
  fn parses_registry_tag_and_digest() {
    let image =
      ImageRef::parse("reg.example.com/team/app:1.2@sha256:abcd")
        .unwrap();
    assert_eq!(image.registry, "reg.example.com");
    assert_eq!(image.repository, "team/app");
    assert_eq!(image.tag, "1.2");
    assert_eq!(image.digest.as_deref(), Some("sha256:abcd"));
  }

  #[test]
  fn port_in_registry_is_not_a_tag() {
    let image = ImageRef::parse("localhost:5000/app").unwrap();
    assert_eq!(image.registry, "localhost:5000");
    assert_eq!(image.repository, "app");
    assert_eq!(image.tag, "latest");
  }
}
