use std::{
  io,
  os::unix::process::ExitStatusExt,
  process::{ExitStatus, Output},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CommandOutput {
  pub status: ExitStatus,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn from(output: io::Result<Output>) -> Self {
    match output {
      Ok(output) => Self {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
      },
      Err(e) => CommandOutput::from_err(e),
    }
  }

  pub fn from_err(e: io::Error) -> Self {
    Self {
      status: ExitStatus::from_raw(1),
      stdout: String::new(),
      stderr: format!("{e:#}"),
    }
  }

  pub fn success(&self) -> bool {
    self.status.success()
  }

  pub fn into_log(
    self,
    stage: &str,
    command: String,
    start_ts: i64,
  ) -> CommandLog {
    CommandLog {
      stage: stage.to_string(),
      command,
      success: self.success(),
      exit_code: self.status.code(),
      stdout: self.stdout,
      stderr: self.stderr,
      start_ts,
      end_ts: armada_client::entities::armada_timestamp(),
    }
  }
}

/// Captured result of one staged command, safe to persist once
/// sanitized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLog {
  pub stage: String,
  pub command: String,
  pub success: bool,
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl CommandLog {
  pub fn error(stage: &str, message: String) -> CommandLog {
    let ts = armada_client::entities::armada_timestamp();
    CommandLog {
      stage: stage.to_string(),
      command: String::new(),
      success: false,
      exit_code: None,
      stdout: String::new(),
      stderr: message,
      start_ts: ts,
      end_ts: ts,
    }
  }
}
