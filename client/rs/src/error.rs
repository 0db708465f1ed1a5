use serde::{Deserialize, Serialize};
use strum::Display;

/// Engine error taxonomy. Classification decides retry and
/// propagation behavior, see the variants.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// Configuration problem, surfaced with a path into the
  /// offending document. Never retried.
  #[error("validation error at {path} | {message}")]
  Validation { path: String, message: String },

  /// Authentication failure after the single token refresh.
  #[error("authentication failed | {0}")]
  Auth(String),

  /// Retried with bounded exponential backoff.
  #[error("transient platform error | {0}")]
  TransientPlatform(String),

  /// Quota / conflict / not-found. Surfaced; federation
  /// actions mark the pool ineligible and re-match.
  #[error("permanent platform error ({kind}) | {message}")]
  PermanentPlatform {
    kind: PermanentKind,
    message: String,
  },

  /// Chunk hash mismatch, fingerprint mismatch, or vault
  /// decryption failure. Fatal for the affected unit.
  #[error("integrity failure | {0}")]
  Integrity(String),

  /// Deadline exceeded. Transient when the underlying
  /// operation is idempotent, surfaced otherwise.
  #[error("operation timed out | {0}")]
  Timeout(String),
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermanentKind {
  QuotaExceeded,
  NotFound,
  Conflict,
}

impl EngineError {
  pub fn validation(
    path: impl std::fmt::Display,
    message: impl std::fmt::Display,
  ) -> EngineError {
    EngineError::Validation {
      path: path.to_string(),
      message: message.to_string(),
    }
  }

  /// Whether the engine may retry the failed operation.
  pub fn retryable(&self) -> bool {
    matches!(
      self,
      EngineError::TransientPlatform(_) | EngineError::Timeout(_)
    )
  }
}

/// Failure variants returned by compute platform adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
  #[error("transient | {0}")]
  Transient(String),
  #[error("quota exceeded | {0}")]
  QuotaExceeded(String),
  #[error("not found | {0}")]
  NotFound(String),
  #[error("conflict | {0}")]
  Conflict(String),
  #[error("auth | {0}")]
  Auth(String),
}

impl PlatformError {
  pub fn transient(&self) -> bool {
    matches!(self, PlatformError::Transient(_))
  }
}

impl From<PlatformError> for EngineError {
  fn from(value: PlatformError) -> Self {
    match value {
      PlatformError::Transient(message) => {
        EngineError::TransientPlatform(message)
      }
      PlatformError::QuotaExceeded(message) => {
        EngineError::PermanentPlatform {
          kind: PermanentKind::QuotaExceeded,
          message,
        }
      }
      PlatformError::NotFound(message) => {
        EngineError::PermanentPlatform {
          kind: PermanentKind::NotFound,
          message,
        }
      }
      PlatformError::Conflict(message) => {
        EngineError::PermanentPlatform {
          kind: PermanentKind::Conflict,
          message,
        }
      }
      PlatformError::Auth(message) => EngineError::Auth(message),
    }
  }
}
