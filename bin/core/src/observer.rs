//! Observation: stream task output, persist node startup
//! diagnostics on terminal failures, and mirror the federation
//! proxy log to shared storage.

use std::path::{Path, PathBuf};

use anyhow::Context;
use armada_client::error::EngineError;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
  platform::{ComputePlatform, FileSource, OpContext},
  storage::ObjectStore,
};

/// Streams a task's output file to the writer, polling the
/// platform until eof. Returns the byte count written.
pub async fn stream_task_output(
  ctx: &OpContext,
  platform: &impl ComputePlatform,
  job_id: &str,
  task_id: &str,
  file: &str,
  writer: &mut (impl AsyncWrite + Unpin),
) -> Result<u64, EngineError> {
  let source = FileSource::TaskFile {
    job_id: job_id.to_string(),
    task_id: task_id.to_string(),
    path: file.to_string(),
  };
  let mut offset = 0u64;
  loop {
    ctx.check("stream task output")?;
    let chunk = platform
      .stream_file(ctx, &source, offset)
      .await
      .map_err(EngineError::from)?;
    if !chunk.data.is_empty() {
      offset += chunk.data.len() as u64;
      writer.write_all(&chunk.data).await.map_err(|e| {
        EngineError::TransientPlatform(format!(
          "failed to write streamed output | {e}"
        ))
      })?;
    }
    if chunk.eof {
      writer.flush().await.ok();
      return Ok(offset);
    }
    tokio::select! {
      _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
      _ = ctx.cancel.cancelled() => {}
    }
  }
}

/// On a node's terminal failure, retrieves the start task
/// stdout / stderr and writes them under
/// `{root}/{pool_id}/{node_id}/startup/std{out,err}.txt`.
/// Returns the directory written.
pub async fn persist_startup_logs(
  ctx: &OpContext,
  platform: &impl ComputePlatform,
  root: &Path,
  pool_id: &str,
  node_id: &str,
) -> Result<PathBuf, EngineError> {
  let directory = root.join(pool_id).join(node_id).join("startup");
  tokio::fs::create_dir_all(&directory)
    .await
    .with_context(|| {
      format!("failed to create {}", directory.display())
    })
    .map_err(|e| {
      EngineError::TransientPlatform(format!("{e:#}"))
    })?;

  for name in ["stdout.txt", "stderr.txt"] {
    let source = FileSource::NodeFile {
      pool_id: pool_id.to_string(),
      node_id: node_id.to_string(),
      path: format!("startup/{name}"),
    };
    let data =
      match platform.stream_file(ctx, &source, 0).await {
        Ok(chunk) => chunk.data,
        Err(e) => {
          warn!(
            "could not retrieve startup {name} for {pool_id}/{node_id} | {e:#}"
          );
          continue;
        }
      };
    let path = directory.join(name);
    tokio::fs::write(&path, &data)
      .await
      .with_context(|| {
        format!("failed to write {}", path.display())
      })
      .map_err(|e| {
        EngineError::TransientPlatform(format!("{e:#}"))
      })?;
  }
  // Also ask the platform to bundle the node's full logs into
  // shared storage for later inspection.
  if let Err(e) = platform
    .upload_logs(
      ctx,
      pool_id,
      node_id,
      &format!("diagnostics/{pool_id}/{node_id}"),
    )
    .await
  {
    warn!(
      "platform log bundle upload for {pool_id}/{node_id} failed | {e:#}"
    );
  }
  info!(
    "startup logs for {pool_id}/{node_id} written to {}",
    directory.display()
  );
  Ok(directory)
}

/// Mirrors a local log file into shared storage on an interval
/// until cancelled. Used for federation proxy logs.
pub async fn mirror_log_file(
  ctx: &OpContext,
  store: &impl ObjectStore,
  file: &Path,
  destination: &str,
  interval: std::time::Duration,
) {
  loop {
    tokio::select! {
      _ = tokio::time::sleep(interval) => {}
      _ = ctx.cancel.cancelled() => return,
    }
    let data = match tokio::fs::read(file).await {
      Ok(data) => data,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        continue;
      }
      Err(e) => {
        warn!(
          "failed to read log file {} | {e}",
          file.display()
        );
        continue;
      }
    };
    if let Err(e) = store.put(ctx, destination, &data).await {
      warn!("failed to mirror log to {destination} | {e:#}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    platform::memory::MemoryPlatform, storage::dir::DirStore,
  };
  use armada_client::entities::pool::{PoolSpec, VmImage};

  #[tokio::test]
  async fn streams_task_output_to_writer() {
    let platform = MemoryPlatform::new();
    let ctx = OpContext::default();
    let spec = PoolSpec {
      id: "pool-a".into(),
      vm_image: VmImage::Custom {
        image_id: "img".into(),
      },
      vm_size: "s".into(),
      target_dedicated: 1,
      target_preemptible: 0,
      max_tasks_per_node: 1,
      inter_node_communication: false,
      subnet_id: None,
      accelerator: None,
      preload_images: vec![],
      volumes: vec![],
      ingress: vec![],
      start_task: Default::default(),
      native: false,
      windows: false,
      policies: Default::default(),
    };
    platform.create_pool(&ctx, &spec).await.unwrap();
    platform.add_job(&ctx, "pool-a", "job1").await.unwrap();
    platform
      .write_task_file(
        "job1",
        "t1",
        "stdout.txt",
        b"task says hello",
      )
      .await;

    let mut out = Vec::new();
    let written = stream_task_output(
      &ctx, &platform, "job1", "t1", "stdout.txt", &mut out,
    )
    .await
    .unwrap();
    assert_eq!(written, 15);
    assert_eq!(out, b"task says hello");
  }

  #[tokio::test]
  async fn persists_startup_logs_on_failure() {
    let platform = MemoryPlatform::new();
    let ctx = OpContext::default();
    let spec = PoolSpec {
      id: "pool-f".into(),
      vm_image: VmImage::Custom {
        image_id: "img".into(),
      },
      vm_size: "s".into(),
      target_dedicated: 1,
      target_preemptible: 0,
      max_tasks_per_node: 1,
      inter_node_communication: false,
      subnet_id: None,
      accelerator: None,
      preload_images: vec![],
      volumes: vec![],
      ingress: vec![],
      start_task: Default::default(),
      native: false,
      windows: false,
      policies: Default::default(),
    };
    platform.create_pool(&ctx, &spec).await.unwrap();
    platform
      .inject_start_task_failure("pool-f", "tvm-000000")
      .await;
    // Advance until the failure is recorded.
    for _ in 0..4 {
      platform.list_nodes(&ctx, "pool-f").await.unwrap();
    }

    let root = tempfile::tempdir().unwrap();
    let directory = persist_startup_logs(
      &ctx,
      &platform,
      root.path(),
      "pool-f",
      "tvm-000000",
    )
    .await
    .unwrap();
    let stderr = std::fs::read_to_string(
      directory.join("stderr.txt"),
    )
    .unwrap();
    assert_eq!(stderr, "start task failed");
  }

  #[tokio::test]
  async fn mirrors_log_file_until_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let log_dir = tempfile::tempdir().unwrap();
    let log_path = log_dir.path().join("proxy.log");
    std::fs::write(&log_path, b"line one\n").unwrap();

    let ctx = OpContext::default();
    let cancel = ctx.cancel.clone();
    let mirror = mirror_log_file(
      &ctx,
      &store,
      &log_path,
      "fed-logs/proxy.log",
      std::time::Duration::from_millis(10),
    );
    let stop = async {
      tokio::time::sleep(std::time::Duration::from_millis(50))
        .await;
      cancel.cancel();
    };
    tokio::join!(mirror, stop);

    let (data, _) = store
      .get(&OpContext::default(), "fed-logs/proxy.log")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(data, b"line one\n");
  }
}
