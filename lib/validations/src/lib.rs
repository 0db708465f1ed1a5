//! Input validation for platform-bound identifiers.
//!
//! The batch platform restricts pool / job / task ids to a
//! conservative charset. Validating at the engine boundary keeps
//! bad ids from surfacing late as opaque platform conflicts.

use std::sync::OnceLock;

use anyhow::anyhow;
use regex::Regex;

/// Options to validate input strings to have certain properties.
#[derive(Default)]
pub struct StringValidator {
  /// Minimum length of string. `0` effectively skips the check.
  pub min_length: usize,
  /// Max length of string, or None for arbitrary length.
  pub max_length: Option<usize>,
  /// Pattern to validate the string contents against.
  pub matches: Option<StringValidatorMatches>,
}

impl StringValidator {
  pub fn validate(&self, input: &str) -> anyhow::Result<()> {
    let len = input.len();

    if len < self.min_length {
      return Err(anyhow!(
        "Input too short. Must be at least {} characters.",
        self.min_length
      ));
    }

    if let Some(max_length) = self.max_length
      && len > max_length
    {
      return Err(anyhow!(
        "Input too long. Must be at most {max_length} characters."
      ));
    }

    if input.chars().any(char::is_control) {
      return Err(anyhow!("Input contains control characters."));
    }

    if let Some(matches) = &self.matches {
      matches.validate(input)?
    }

    Ok(())
  }

  pub fn min_length(mut self, min_length: usize) -> StringValidator {
    self.min_length = min_length;
    self
  }

  pub fn max_length(
    mut self,
    max_length: impl Into<Option<usize>>,
  ) -> StringValidator {
    self.max_length = max_length.into();
    self
  }

  pub fn matches(
    mut self,
    matches: StringValidatorMatches,
  ) -> StringValidator {
    self.matches = Some(matches);
    self
  }
}

pub enum StringValidatorMatches {
  /// Platform entity id: letters, digits, dashes, underscores.
  PlatformId,
  /// Environment variable key.
  EnvKey,
}

impl StringValidatorMatches {
  pub fn validate(&self, input: &str) -> anyhow::Result<()> {
    match self {
      StringValidatorMatches::PlatformId => {
        static PLATFORM_ID: OnceLock<Regex> = OnceLock::new();
        let regex = PLATFORM_ID.get_or_init(|| {
          Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$")
            .expect("Invalid platform id regex")
        });
        if !regex.is_match(input) {
          return Err(anyhow!(
            "'{input}' is not a valid platform id. Ids use letters, digits, dashes and underscores, and start alphanumeric."
          ));
        }
        Ok(())
      }
      StringValidatorMatches::EnvKey => {
        static ENV_KEY: OnceLock<Regex> = OnceLock::new();
        let regex = ENV_KEY.get_or_init(|| {
          Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .expect("Invalid env key regex")
        });
        if !regex.is_match(input) {
          return Err(anyhow!(
            "'{input}' is not a valid environment key."
          ));
        }
        Ok(())
      }
    }
  }
}

/// Validates a pool / job / task id against the platform charset
/// and the 64 character platform limit.
pub fn platform_id(id: &str) -> anyhow::Result<()> {
  StringValidator::default()
    .min_length(1)
    .max_length(64)
    .matches(StringValidatorMatches::PlatformId)
    .validate(id)
}

/// Validates an environment variable key.
pub fn env_key(key: &str) -> anyhow::Result<()> {
  StringValidator::default()
    .min_length(1)
    .max_length(255)
    .matches(StringValidatorMatches::EnvKey)
    .validate(key)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn platform_ids() {
    assert!(platform_id("pool-a_1").is_ok());
    assert!(platform_id("dockertask-00042").is_ok());
    assert!(platform_id("").is_err());
    assert!(platform_id("-leading-dash").is_err());
    assert!(platform_id("has space").is_err());
    assert!(platform_id(&"x".repeat(65)).is_err());
  }

  #[test]
  fn env_keys() {
    assert!(env_key("TASK_RESULT").is_ok());
    assert!(env_key("_private").is_ok());
    assert!(env_key("1BAD").is_err());
    assert!(env_key("BAD-DASH").is_err());
  }
}
