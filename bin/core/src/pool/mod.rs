//! Pool lifecycle control.
//!
//! Drives a pool through allocate -> prepare -> ready, enforces
//! the image preload barrier, applies the node recovery
//! policies, and serializes every operation on the same pool
//! behind a keyed lock. Long running operations publish
//! progress over a channel and honor cooperative cancellation:
//! a cancelled allocation that never reached ready issues a
//! compensating delete.

use std::collections::HashMap;
use std::time::Duration;

use armada_client::{
  entities::{
    image::{DataReplication, PrivateMirror},
    pool::{Node, NodeState, PoolSpec, PoolState},
  },
  error::EngineError,
};
use tokio::sync::mpsc;

use crate::{
  data,
  images::{self, DistributionPlan},
  platform::{ComputePlatform, OpContext, RetryPolicy, with_retry},
  state,
  storage::ObjectStore,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PoolProgress {
  State(PoolState),
  Nodes { settled: u32, total: u32 },
  ImagesVerified,
}

pub struct PoolController<'a, P, S> {
  platform: &'a P,
  store: &'a S,
  poll_interval: Duration,
  /// Where retrieved node startup logs land on terminal
  /// failures. None skips retrieval.
  diagnostics_dir: Option<std::path::PathBuf>,
}

impl<'a, P: ComputePlatform, S: ObjectStore>
  PoolController<'a, P, S>
{
  pub fn new(platform: &'a P, store: &'a S) -> Self {
    PoolController {
      platform,
      store,
      poll_interval: Duration::from_millis(1000),
      diagnostics_dir: None,
    }
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn with_diagnostics_dir(
    mut self,
    dir: impl Into<std::path::PathBuf>,
  ) -> Self {
    self.diagnostics_dir = Some(dir.into());
    self
  }

  /// Allocates the pool and blocks until it is ready (or the
  /// context is cancelled, in which case the partial pool is
  /// deleted).
  pub async fn allocate(
    &self,
    ctx: &OpContext,
    spec: &PoolSpec,
    replication: &DataReplication,
    mirror: Option<&PrivateMirror>,
    progress: Option<mpsc::Sender<PoolProgress>>,
  ) -> Result<DistributionPlan, EngineError> {
    spec.validate()?;
    let lock = state::pool_locks().get(&spec.id).await;
    let _guard = lock.lock().await;

    send(&progress, PoolProgress::State(PoolState::Allocating))
      .await;
    with_retry(
      ctx,
      RetryPolicy::default(),
      "create_pool",
      |_| self.platform.create_pool(ctx, spec),
    )
    .await?;

    // Interleave local-to-storage transfers with allocation.
    if spec.policies.transfer_files_on_pool_creation
      && !spec.ingress.is_empty()
    {
      let pending = data::plan_pool_ingress(
        ctx, self.store, &spec.id, &spec.ingress,
      )
      .await?;
      for (fp, _unit) in &pending {
        data::mark_pool_ingress_done(ctx, self.store, &spec.id, fp)
          .await?;
      }
    }

    send(&progress, PoolProgress::State(PoolState::Preparing))
      .await;
    let result = self
      .converge(ctx, spec, replication, mirror, &progress)
      .await;

    match result {
      Ok(plan) => {
        send(&progress, PoolProgress::State(PoolState::Ready))
          .await;
        Ok(plan)
      }
      Err(e) => {
        // Compensate: the pool never reached ready.
        if ctx.cancel.is_cancelled() {
          info!(
            "allocation of pool {} cancelled, deleting partial pool",
            spec.id
          );
          let cleanup = OpContext::default();
          if let Err(delete_err) = self
            .platform
            .delete_pool(&cleanup, &spec.id)
            .await
          {
            warn!(
              "failed to delete partial pool {} | {delete_err:#}",
              spec.id
            );
          }
        }
        Err(e)
      }
    }
  }

  /// Polls node states until the ready barrier releases,
  /// applying the reboot and unusable recovery policies.
  async fn converge(
    &self,
    ctx: &OpContext,
    spec: &PoolSpec,
    replication: &DataReplication,
    mirror: Option<&PrivateMirror>,
    progress: &Option<mpsc::Sender<PoolProgress>>,
  ) -> Result<DistributionPlan, EngineError> {
    let mut rebooted: HashMap<String, bool> = HashMap::new();
    let mut recovery_budget =
      spec.policies.unusable_recovery_budget;
    let mut images_verified = false;

    loop {
      ctx.check("pool converge")?;

      let nodes = with_retry(
        ctx,
        RetryPolicy::default(),
        "list_nodes",
        |_| self.platform.list_nodes(ctx, &spec.id),
      )
      .await?;

      self
        .apply_node_policies(
          ctx,
          spec,
          &nodes,
          &mut rebooted,
          &mut recovery_budget,
        )
        .await?;

      let settled = nodes
        .iter()
        .filter(|node| {
          matches!(
            node.state,
            NodeState::Idle | NodeState::Running
          )
        })
        .count() as u32;
      send(
        progress,
        PoolProgress::Nodes {
          settled,
          total: spec.target_nodes(),
        },
      )
      .await;

      let all_settled = settled == spec.target_nodes()
        && nodes.len() as u32 == spec.target_nodes();

      let barrier_released = if spec
        .policies
        .block_until_all_global_resources_loaded
      {
        images::all_images_present(spec, &nodes)
      } else {
        true
      };

      if all_settled && barrier_released {
        if !images_verified {
          images_verified = true;
          send(progress, PoolProgress::ImagesVerified).await;
        }
        return Ok(images::plan(
          spec,
          &nodes,
          replication,
          mirror,
        ));
      }

      tokio::select! {
        _ = tokio::time::sleep(self.poll_interval) => {}
        _ = ctx.cancel.cancelled() => {}
      }
    }
  }

  async fn apply_node_policies(
    &self,
    ctx: &OpContext,
    spec: &PoolSpec,
    nodes: &[Node],
    rebooted: &mut HashMap<String, bool>,
    recovery_budget: &mut u32,
  ) -> Result<(), EngineError> {
    for node in nodes {
      match node.state {
        NodeState::StartTaskFailed => {
          if spec.policies.reboot_on_start_task_failed
            && !rebooted.get(&node.id).copied().unwrap_or(false)
          {
            info!(
              "node {} start task failed, attempting single reboot",
              node.id
            );
            rebooted.insert(node.id.clone(), true);
            self
              .platform
              .reboot_node(ctx, &spec.id, &node.id)
              .await
              .map_err(EngineError::from)?;
          } else {
            if let Some(root) = &self.diagnostics_dir {
              let _ = crate::observer::persist_startup_logs(
                ctx,
                self.platform,
                root,
                &spec.id,
                &node.id,
              )
              .await;
            }
            return Err(EngineError::PermanentPlatform {
              kind:
                armada_client::error::PermanentKind::Conflict,
              message: format!(
                "node {} failed its start task (exit {:?}) after reboot",
                node.id, node.start_task_exit_code
              ),
            });
          }
        }
        NodeState::Unusable => {
          if spec.policies.attempt_recovery_on_unusable
            && *recovery_budget > 0
          {
            *recovery_budget -= 1;
            info!(
              "node {} unusable, deleting for replenishment ({} attempts left)",
              node.id, recovery_budget
            );
            self
              .platform
              .delete_nodes(
                ctx,
                &spec.id,
                &[node.id.clone()],
              )
              .await
              .map_err(EngineError::from)?;
          } else {
            return Err(EngineError::PermanentPlatform {
              kind:
                armada_client::error::PermanentKind::Conflict,
              message: format!(
                "node {} is unusable and recovery is exhausted",
                node.id
              ),
            });
          }
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// Resize to new targets. Shrinks pick victims highest node
  /// id first within each class; the resize-down policy rides
  /// along to the platform.
  pub async fn resize(
    &self,
    ctx: &OpContext,
    spec: &PoolSpec,
    dedicated: u32,
    preemptible: u32,
  ) -> Result<(), EngineError> {
    let lock = state::pool_locks().get(&spec.id).await;
    let _guard = lock.lock().await;

    let policy = spec.policies.resize_down;
    let nodes = with_retry(
      ctx,
      RetryPolicy::default(),
      "list_nodes",
      |_| self.platform.list_nodes(ctx, &spec.id),
    )
    .await?;

    let victims =
      shrink_victims(&nodes, dedicated, preemptible);
    if !victims.is_empty() {
      info!(
        "resizing pool {} down, victims: {victims:?} (policy {policy})",
        spec.id
      );
    }

    with_retry(
      ctx,
      RetryPolicy::default(),
      "resize_pool",
      |_| {
        self.platform.resize_pool(
          ctx,
          &spec.id,
          dedicated,
          preemptible,
          policy,
        )
      },
    )
    .await
  }

  pub async fn delete(
    &self,
    ctx: &OpContext,
    pool_id: &str,
  ) -> Result<(), EngineError> {
    let lock = state::pool_locks().get(&pool_id.to_string()).await;
    let _guard = lock.lock().await;
    with_retry(
      ctx,
      RetryPolicy::default(),
      "delete_pool",
      |_| self.platform.delete_pool(ctx, pool_id),
    )
    .await?;
    state::pool_locks().remove(&pool_id.to_string()).await;
    Ok(())
  }
}

/// Victims for a shrink, highest node id first within each
/// class, deterministic under chaos.
fn shrink_victims(
  nodes: &[Node],
  target_dedicated: u32,
  target_preemptible: u32,
) -> Vec<String> {
  let mut victims = Vec::new();
  for (dedicated, target) in [
    (true, target_dedicated),
    (false, target_preemptible),
  ] {
    let mut class: Vec<&Node> = nodes
      .iter()
      .filter(|node| node.dedicated == dedicated)
      .collect();
    class.sort_by(|a, b| b.id.cmp(&a.id));
    let excess =
      class.len().saturating_sub(target as usize);
    victims.extend(
      class[..excess].iter().map(|node| node.id.clone()),
    );
  }
  victims
}

async fn send(
  progress: &Option<mpsc::Sender<PoolProgress>>,
  event: PoolProgress,
) {
  if let Some(sender) = progress {
    let _ = sender.send(event).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    platform::memory::MemoryPlatform, storage::dir::DirStore,
  };
  use armada_client::entities::pool::VmImage;

  fn spec(id: &str, dedicated: u32) -> PoolSpec {
    PoolSpec {
      id: id.to_string(),
      vm_image: VmImage::Custom {
        image_id: "img".into(),
      },
      vm_size: "standard_d2s_v3".into(),
      target_dedicated: dedicated,
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
    }
  }

  fn controller<'a>(
    platform: &'a MemoryPlatform,
    store: &'a DirStore,
  ) -> PoolController<'a, MemoryPlatform, DirStore> {
    PoolController::new(platform, store)
      .with_poll_interval(Duration::from_millis(5))
  }

  #[tokio::test]
  async fn allocate_reaches_ready_without_preload() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();

    controller(&platform, &store)
      .allocate(
        &ctx,
        &spec("pool-ready", 2),
        &Default::default(),
        None,
        None,
      )
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn preload_barrier_holds_until_images_present() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let mut pool = spec("pool-barrier", 2);
    pool.preload_images = vec!["app:1".to_string()];

    let handle = {
      let ctx = ctx.clone();
      let platform = &platform;
      let store = &store;
      async move {
        controller(platform, store)
          .allocate(&ctx, &pool, &Default::default(), None, None)
          .await
      }
    };

    let marker = async {
      // Allow several poll rounds with the barrier held.
      tokio::time::sleep(Duration::from_millis(60)).await;
      platform
        .mark_image_present("pool-barrier", "app:1")
        .await;
    };

    let (result, _) = tokio::join!(handle, marker);
    result.unwrap();
  }

  #[tokio::test]
  async fn native_pool_waives_barrier() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let mut pool = spec("pool-native", 1);
    pool.preload_images = vec!["app:1".to_string()];
    pool.native = true;

    controller(&platform, &store)
      .allocate(&ctx, &pool, &Default::default(), None, None)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn start_task_failure_triggers_single_reboot() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let pool = spec("pool-reboot", 1);

    // Seed the pool, then inject a start task failure for the
    // first node before it settles.
    platform.create_pool(&ctx, &pool).await.unwrap();
    platform
      .inject_start_task_failure("pool-reboot", "tvm-000000")
      .await;

    let controller = controller(&platform, &store);
    let result = controller
      .converge(&ctx, &pool, &Default::default(), None, &None)
      .await;
    // Reboot clears the injected failure, pool converges.
    result.unwrap();
  }

  #[tokio::test]
  async fn unusable_node_recovery_deletes_and_replenishes() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let mut pool = spec("pool-unusable", 2);
    pool.policies.attempt_recovery_on_unusable = true;

    platform.create_pool(&ctx, &pool).await.unwrap();
    // Advance nodes to idle, then wedge one.
    for _ in 0..4 {
      platform.list_nodes(&ctx, "pool-unusable").await.unwrap();
    }
    platform
      .set_node_state(
        "pool-unusable",
        "tvm-000001",
        NodeState::Unusable,
      )
      .await;

    controller(&platform, &store)
      .converge(&ctx, &pool, &Default::default(), None, &None)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn cancelled_allocation_deletes_partial_pool() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let mut pool = spec("pool-cancel", 1);
    // Barrier never releases: image never marked present.
    pool.preload_images = vec!["app:1".to_string()];

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(40)).await;
      cancel.cancel();
    });

    let result = controller(&platform, &store)
      .allocate(&ctx, &pool, &Default::default(), None, None)
      .await;
    assert!(result.is_err());
    let observation = platform
      .observe_pool(&OpContext::default(), "pool-cancel")
      .await
      .unwrap();
    assert!(!observation.exists);
  }

  #[test]
  fn shrink_victims_highest_id_first() {
    let node = |id: &str, dedicated: bool| Node {
      id: id.to_string(),
      state: NodeState::Idle,
      dedicated,
      start_task_exit_code: None,
      start_task_stdout: None,
      start_task_stderr: None,
      images_present: vec![],
      address: None,
    };
    let nodes = vec![
      node("tvm-000000", true),
      node("tvm-000001", true),
      node("tvm-000002", true),
      node("tvm-000003", false),
    ];
    let victims = shrink_victims(&nodes, 1, 1);
    assert_eq!(
      victims,
      vec!["tvm-000002".to_string(), "tvm-000001".to_string()]
    );
  }
}
