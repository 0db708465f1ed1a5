use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod data;
pub mod factory;
pub mod federation;
pub mod image;
pub mod job;
pub mod logger;
pub mod pool;

/// Unix timestamp in milliseconds.
pub fn armada_timestamp() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

pub fn optional_string(string: &str) -> Option<String> {
  if string.is_empty() {
    None
  } else {
    Some(string.to_string())
  }
}

/// Ordered environment map. Order is preserved into the
/// `$TASK_WORKING_DIR/.env` manifest written on nodes.
pub type Environment = IndexMap<String, String>;

/// Renders an [Environment] into the newline separated
/// `KEY=VALUE` manifest format injected on compute nodes.
pub fn environment_manifest(env: &Environment) -> String {
  let mut out = String::new();
  for (key, value) in env {
    out.push_str(key);
    out.push('=');
    out.push_str(value);
    out.push('\n');
  }
  out
}

/// A file retrieved onto a node before a task or start task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFile {
  /// Node-relative destination path.
  pub path: String,
  /// Source url. The platform performs the download.
  pub url: String,
  /// Optional octal file mode, eg "0755".
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mode: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn environment_manifest_preserves_order() {
    let mut env = Environment::new();
    env.insert("B".to_string(), "2".to_string());
    env.insert("A".to_string(), "1".to_string());
    assert_eq!(environment_manifest(&env), "B=2\nA=1\n");
  }
}
