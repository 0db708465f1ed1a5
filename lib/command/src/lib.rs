use std::path::Path;

use armada_client::entities::armada_timestamp;
use tokio::process::Command;

mod output;

pub use output::*;

/// Run a command directly. Cannot include shell syntax.
pub async fn run_standard_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
) -> CommandLog {
  let command = command.into();
  let start_ts = armada_timestamp();
  let output = standard_output(&command, path).await;
  output.into_log(stage, command, start_ts)
}

/// Run a command wrapped in `sh -c`, allowing pipes and `&&`.
pub async fn run_shell_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl Into<String>,
) -> CommandLog {
  let command = command.into();
  let start_ts = armada_timestamp();
  let output = shell_output(&command, path).await;
  output.into_log(stage, command, start_ts)
}

/// Run a shell command and scrub every `(secret, replacement)`
/// pair out of the captured command line and output before it
/// can reach a log sink.
pub async fn run_sanitized_shell_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
  replacers: &[(String, String)],
) -> CommandLog {
  let mut log = run_shell_command(
    stage,
    path,
    command.as_ref().to_string(),
  )
  .await;
  log.command = svi::replace_in_string(&log.command, replacers);
  log.stdout = svi::replace_in_string(&log.stdout, replacers);
  log.stderr = svi::replace_in_string(&log.stderr, replacers);
  log
}

async fn standard_output(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let mut split = command.split_whitespace();
  let Some(program) = split.next() else {
    return CommandOutput::from_err(std::io::Error::other(
      "empty command",
    ));
  };
  let mut cmd = Command::new(program);
  cmd.args(split);
  if let Some(path) = path.into() {
    cmd.current_dir(path);
  }
  CommandOutput::from(cmd.output().await)
}

async fn shell_output(
  command: &str,
  path: impl Into<Option<&Path>>,
) -> CommandOutput {
  let mut cmd = Command::new("sh");
  cmd.arg("-c").arg(command);
  if let Some(path) = path.into() {
    cmd.current_dir(path);
  }
  CommandOutput::from(cmd.output().await)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_stdout_and_exit() {
    let log =
      run_shell_command("Echo", None, "printf armada").await;
    assert!(log.success);
    assert_eq!(log.stdout, "armada");
    assert_eq!(log.stage, "Echo");
  }

  #[tokio::test]
  async fn nonzero_exit_is_failure() {
    let log = run_shell_command("Fail", None, "exit 3").await;
    assert!(!log.success);
  }

  #[tokio::test]
  async fn sanitization_scrubs_secrets() {
    let replacers =
      vec![("hunter2".to_string(), "<registry_token>".to_string())];
    let log = run_sanitized_shell_command(
      "Login",
      None,
      "echo hunter2",
      &replacers,
    )
    .await;
    assert!(!log.command.contains("hunter2"));
    assert!(!log.stdout.contains("hunter2"));
    assert!(log.stdout.contains("<registry_token>"));
  }
}
