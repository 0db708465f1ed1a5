//! On-premises ingress: pushes client-local files into the
//! cluster's shared filesystem over one of four transports,
//! with per-node parallelism bounded by a semaphore.

use std::{path::Path, sync::Arc};

use armada_client::{
  entities::data::FanoutTransport, error::EngineError,
};
use command::{CommandLog, run_shell_command};
use tokio::sync::Semaphore;

use crate::platform::OpContext;

/// One reachable node endpoint for the secure transports.
#[derive(Debug, Clone)]
pub struct FanoutTarget {
  pub node_id: String,
  pub host: String,
  pub port: u16,
  pub user: String,
  pub key_path: String,
}

/// Pushes `local_path` to `remote_path` on the target nodes.
/// Single-node transports use only the first target (the shared
/// filesystem makes the data visible pool-wide); multi-node
/// transports fan out to every target concurrently, bounded by
/// `max_parallel`.
pub async fn run(
  ctx: &OpContext,
  transport: FanoutTransport,
  local_path: &Path,
  remote_path: &str,
  targets: &[FanoutTarget],
  max_parallel: usize,
) -> Result<Vec<CommandLog>, EngineError> {
  ctx.check("fanout")?;
  let Some(first) = targets.first() else {
    return Err(EngineError::validation(
      "ingress.fanout",
      "no reachable nodes to transfer to",
    ));
  };

  let targets: Vec<FanoutTarget> = if transport.multinode() {
    targets.to_vec()
  } else {
    vec![first.clone()]
  };

  let semaphore =
    Arc::new(Semaphore::new(max_parallel.max(1)));
  let mut handles = Vec::with_capacity(targets.len());
  for target in targets {
    let semaphore = semaphore.clone();
    let command =
      transfer_command(transport, local_path, remote_path, &target);
    let stage = format!("Fanout {} {}", transport, target.node_id);
    let cancel = ctx.cancel.clone();
    handles.push(tokio::spawn(async move {
      let _permit = semaphore
        .acquire()
        .await
        .expect("fanout semaphore never closes");
      if cancel.is_cancelled() {
        return CommandLog::error(
          &stage,
          "cancelled before transfer".to_string(),
        );
      }
      run_shell_command(&stage, None, command).await
    }));
  }

  let mut logs = Vec::with_capacity(handles.len());
  for handle in handles {
    let log = handle.await.map_err(|e| {
      EngineError::TransientPlatform(format!(
        "fanout worker panicked | {e}"
      ))
    })?;
    if !log.success {
      warn!(
        "fanout stage '{}' failed | {}",
        log.stage, log.stderr
      );
    }
    logs.push(log);
  }
  Ok(logs)
}

fn transfer_command(
  transport: FanoutTransport,
  local_path: &Path,
  remote_path: &str,
  target: &FanoutTarget,
) -> String {
  let local = local_path.display();
  let FanoutTarget {
    host,
    port,
    user,
    key_path,
    ..
  } = target;
  match transport {
    FanoutTransport::Scp | FanoutTransport::MultinodeScp => {
      format!(
        "scp -B -r -i '{key_path}' -P {port} '{local}' \
'{user}@{host}:{remote_path}'"
      )
    }
    FanoutTransport::RsyncSsh
    | FanoutTransport::MultinodeRsyncSsh => {
      format!(
        "rsync -az --delete -e 'ssh -i {key_path} -p {port}' \
'{local}/' '{user}@{host}:{remote_path}/'"
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn target(n: u32) -> FanoutTarget {
    FanoutTarget {
      node_id: format!("tvm-{n:06}"),
      host: format!("10.0.0.{n}"),
      port: 22,
      user: "armada".into(),
      key_path: "/keys/id_ed25519".into(),
    }
  }

  #[test]
  fn scp_command_shape() {
    let command = transfer_command(
      FanoutTransport::Scp,
      Path::new("/data/in"),
      "/shared/in",
      &target(1),
    );
    assert!(command.starts_with("scp"));
    assert!(command.contains("-P 22"));
    assert!(command.contains("armada@10.0.0.1:/shared/in"));
  }

  #[test]
  fn rsync_command_shape() {
    let command = transfer_command(
      FanoutTransport::MultinodeRsyncSsh,
      Path::new("/data/in"),
      "/shared/in",
      &target(2),
    );
    assert!(command.starts_with("rsync"));
    assert!(command.contains("ssh -i /keys/id_ed25519 -p 22"));
  }

  #[tokio::test]
  async fn empty_target_list_is_a_validation_error() {
    let result = run(
      &OpContext::default(),
      FanoutTransport::Scp,
      Path::new("/data"),
      "/shared",
      &[],
      4,
    )
    .await;
    assert!(matches!(
      result,
      Err(EngineError::Validation { .. })
    ));
  }
}
