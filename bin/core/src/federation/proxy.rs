//! The federation proxy: a long-running agent that owns the
//! action queue of one federation.
//!
//! Exactly one elected leader processes actions. Independent
//! `(job_id, unique_id)` groups run concurrently on a bounded
//! worker pool; inside a group processing is strictly serial,
//! preserving FIFO submission order. Blocked actions stay at
//! the head of their group (zap is the escape hatch), transient
//! failures requeue on the next poll.

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
  time::Duration,
};

use armada_client::{
  entities::{
    armada_timestamp,
    config::FederationProxyConfig,
    federation::{
      ActionKind, ActionStatus, FederatedAction, Federation,
      JobConstraints, PoolSnapshot,
    },
    job::{Job, JobTarget, TaskDescriptor},
  },
  error::EngineError,
};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::{
  factory,
  federation::{
    SnapshotSource, constraints,
    lease::LeaseKeeper,
    queue::{ActionQueue, QueuedAction},
    read_job_metadata, update_job_metadata,
  },
  fingerprint, graph,
  platform::{
    ComputePlatform, OpContext, RetryPolicy, with_retry,
  },
  storage::ObjectStore,
};

pub struct FederationProxy<P, S, N> {
  platform: Arc<P>,
  store: Arc<S>,
  snapshots: Arc<N>,
  pub federation: Federation,
  config: FederationProxyConfig,
  /// Pool id -> blackout expiry timestamp.
  blackout: Mutex<HashMap<String, i64>>,
  /// Groups currently owned by a worker.
  in_flight: Mutex<HashSet<String>>,
  workers: Arc<Semaphore>,
}

#[derive(Debug, PartialEq)]
enum Outcome {
  Done,
  Requeue,
  Blocked(String),
}

impl<P, S, N> FederationProxy<P, S, N>
where
  P: ComputePlatform,
  S: ObjectStore,
  N: SnapshotSource,
{
  pub fn new(
    platform: Arc<P>,
    store: Arc<S>,
    snapshots: Arc<N>,
    federation: Federation,
    config: FederationProxyConfig,
  ) -> Arc<Self> {
    let workers = config.workers.max(1);
    Arc::new(FederationProxy {
      platform,
      store,
      snapshots,
      federation,
      config,
      blackout: Default::default(),
      in_flight: Default::default(),
      workers: Arc::new(Semaphore::new(workers)),
    })
  }

  fn queue(&self) -> ActionQueue<'_, S> {
    ActionQueue::new(&*self.store, &self.federation.id)
  }

  /// Client-side enqueue: expands factories, compiles the task
  /// graph, and appends an immutable add_job action to the
  /// queue. The unique id deduplicates retries of the same
  /// logical submission.
  pub async fn enqueue_add_job(
    &self,
    ctx: &OpContext,
    job: Job,
    unique_id: Option<Uuid>,
  ) -> Result<Uuid, EngineError> {
    job.validate()?;
    match &job.target {
      JobTarget::Federation(fed)
        if *fed == self.federation.id => {}
      _ => {
        return Err(EngineError::validation(
          format!("job.{}.target", job.id),
          format!(
            "job does not target federation {}",
            self.federation.id
          ),
        ));
      }
    }

    let mut expanded = Vec::new();
    for task in &job.tasks {
      expanded.extend(
        factory::expand(ctx, &*self.store, &job.id, task)
          .await?,
      );
    }
    let compiled = graph::compile(&job.id, expanded)?;

    let unique_id = unique_id.unwrap_or_else(Uuid::new_v4);
    let action = FederatedAction {
      sequence: 0,
      unique_id,
      kind: ActionKind::AddJob {
        constraints: job.constraints.clone().unwrap_or_default(),
        tasks: compiled.tasks.clone(),
        job,
      },
      job_id: String::new(),
      target_group: String::new(),
      enqueued_at: 0,
    };
    // Fill derived fields (job id + group fingerprint).
    let (job_id, group) = match &action.kind {
      ActionKind::AddJob { job, tasks, .. } => (
        job.id.clone(),
        fingerprint::short(&fingerprint::task_group(tasks))
          .to_string(),
      ),
      _ => unreachable!(),
    };
    let action = FederatedAction {
      job_id,
      target_group: group,
      ..action
    };
    self.queue().enqueue(ctx, &action).await?;
    Ok(unique_id)
  }

  pub async fn enqueue_control(
    &self,
    ctx: &OpContext,
    job_id: &str,
    kind: ActionKind,
  ) -> Result<Uuid, EngineError> {
    let unique_id = Uuid::new_v4();
    let action = FederatedAction {
      sequence: 0,
      unique_id,
      target_group: format!("ctl-{job_id}"),
      job_id: job_id.to_string(),
      kind,
      enqueued_at: 0,
    };
    self.queue().enqueue(ctx, &action).await?;
    Ok(unique_id)
  }

  /// Leader loop: acquire the lease, poll the queue, dispatch
  /// group workers; on leadership loss fall back to following.
  pub async fn run(
    self: Arc<Self>,
    ctx: OpContext,
  ) -> Result<(), EngineError> {
    let lease = LeaseKeeper::new(
      self.store.clone(),
      self.federation.id.clone(),
      Duration::from_secs(self.config.lease_ttl.max(1)),
    );
    let discovery = Duration::from_secs(
      self.config.federation_discovery_interval.max(1),
    );
    let polling = Duration::from_secs(
      self.config.action_polling_interval.max(1),
    );

    info!(
      "federation proxy for {} starting as candidate {}",
      self.federation.id, lease.holder
    );
    loop {
      if ctx.cancel.is_cancelled() {
        return Ok(());
      }
      let Some(leadership) = lease.try_acquire(&ctx).await?
      else {
        tokio::select! {
          _ = tokio::time::sleep(discovery) => {}
          _ = ctx.cancel.cancelled() => {}
        }
        continue;
      };

      while !leadership.is_lost()
        && !ctx.cancel.is_cancelled()
      {
        if let Err(e) =
          self.clone().poll_once(&ctx, &leadership.lost).await
        {
          warn!("action poll failed | {e:#}");
        }
        tokio::select! {
          _ = tokio::time::sleep(polling) => {}
          _ = ctx.cancel.cancelled() => {}
          _ = leadership.lost.cancelled() => {}
        }
      }
      leadership.resign().await;
    }
  }

  /// One queue poll: dispatch a worker per pending group that
  /// is not already owned.
  pub async fn poll_once(
    self: Arc<Self>,
    ctx: &OpContext,
    leadership_lost: &tokio_util::sync::CancellationToken,
  ) -> Result<(), EngineError> {
    let groups = self.queue().pending_groups(ctx).await?;
    for (group, actions) in groups {
      {
        let mut in_flight = self.in_flight.lock().await;
        if !in_flight.insert(group.clone()) {
          continue;
        }
      }
      let proxy = self.clone();
      let ctx = ctx.child();
      let lost = leadership_lost.clone();
      tokio::spawn(async move {
        let _permit = proxy
          .workers
          .clone()
          .acquire_owned()
          .await
          .expect("worker semaphore never closes");
        proxy.process_group(&ctx, &lost, &actions).await;
        proxy.in_flight.lock().await.remove(&group);
      });
    }
    Ok(())
  }

  /// Strict FIFO within the group: stop at the first action
  /// that does not complete.
  async fn process_group(
    &self,
    ctx: &OpContext,
    leadership_lost: &tokio_util::sync::CancellationToken,
    actions: &[QueuedAction],
  ) {
    for entry in actions {
      if leadership_lost.is_cancelled()
        || ctx.cancel.is_cancelled()
      {
        return;
      }
      let outcome = self.process_action(ctx, entry).await;
      let queue = self.queue();
      match outcome {
        Ok(Outcome::Done) => {
          if let Err(e) = queue.remove(ctx, entry).await {
            warn!(
              "failed to remove completed action {} | {e:#}",
              entry.action.unique_id
            );
            return;
          }
        }
        Ok(Outcome::Requeue) => {
          debug!(
            "action {} requeued for the next poll",
            entry.action.unique_id
          );
          return;
        }
        Ok(Outcome::Blocked(reason)) => {
          warn!(
            "action {} blocked | {reason}",
            entry.action.unique_id
          );
          let _ = queue
            .write_status(
              ctx,
              &entry.action,
              ActionStatus::Blocked,
              None,
              Some(reason),
            )
            .await;
          return;
        }
        Err(e) => {
          warn!(
            "action {} failed | {e:#}",
            entry.action.unique_id
          );
          let _ = queue
            .write_status(
              ctx,
              &entry.action,
              ActionStatus::Failed,
              None,
              Some(format!("{e:#}")),
            )
            .await;
          return;
        }
      }
    }
  }

  async fn process_action(
    &self,
    ctx: &OpContext,
    entry: &QueuedAction,
  ) -> Result<Outcome, EngineError> {
    let action = &entry.action;
    self
      .queue()
      .write_status(
        ctx,
        action,
        ActionStatus::Running,
        None,
        None,
      )
      .await?;
    match &action.kind {
      ActionKind::AddJob {
        job,
        tasks,
        constraints,
      } => {
        self
          .process_add_job(ctx, action, job, tasks, constraints)
          .await
      }
      ActionKind::Terminate => {
        self.process_terminate(ctx, action, false).await
      }
      ActionKind::Delete => {
        self.process_terminate(ctx, action, true).await
      }
      ActionKind::Zap { target_unique_id } => {
        self.queue().zap(ctx, *target_unique_id).await?;
        self
          .queue()
          .write_status(
            ctx,
            action,
            ActionStatus::Succeeded,
            None,
            None,
          )
          .await?;
        Ok(Outcome::Done)
      }
    }
  }

  async fn process_add_job(
    &self,
    ctx: &OpContext,
    action: &FederatedAction,
    job: &Job,
    tasks: &[TaskDescriptor],
    constraints: &JobConstraints,
  ) -> Result<Outcome, EngineError> {
    let fed_id = &self.federation.id;
    let existing =
      read_job_metadata(ctx, &*self.store, fed_id, &action.job_id)
        .await?;

    // Idempotence: a unique id is applied at most once.
    if let Some(blob) = &existing
      && blob.applied.contains(&action.unique_id)
    {
      info!(
        "action {} already applied, skipping",
        action.unique_id
      );
      self
        .queue()
        .write_status(
          ctx,
          action,
          ActionStatus::Succeeded,
          blob.location.clone(),
          Some("already applied".to_string()),
        )
        .await?;
      return Ok(Outcome::Done);
    }

    // Collision handling.
    let in_flight = existing
      .as_ref()
      .map(|blob| blob.location.is_some())
      .unwrap_or(false);
    let mut tasks = tasks.to_vec();
    let mut new_platform_job = true;
    let mut forced_pool: Option<String> = None;
    if in_flight {
      if self.federation.unique_job_ids {
        return Ok(Outcome::Blocked(format!(
          "job id {} is already in flight and the federation requires unique job ids",
          action.job_id
        )));
      }
      // Same platform job: rewrite colliding task ids with a
      // suffix derived from the unique id and pin the pool.
      let simple = action.unique_id.simple().to_string();
      rewrite_task_ids(&mut tasks, &simple[..8]);
      new_platform_job = false;
      forced_pool =
        existing.as_ref().and_then(|blob| blob.location.clone());
    }

    // Constraint match over the latest snapshots.
    let snapshots = self.snapshots.snapshots(ctx).await?;
    let prior_location = existing.as_ref().and_then(|blob| {
      blob
        .group_locations
        .get(&action.target_group)
        .and_then(|pool_id| {
          snapshots
            .iter()
            .find(|snap| snap.pool_id == *pool_id)
            .map(|snap| snap.location.clone())
        })
    });
    let blackout = self.blackout.lock().await.clone();
    let (mut candidates, rejections) = constraints::select(
      constraints,
      &snapshots,
      prior_location.as_deref(),
      &blackout,
    );
    if let Some(pool_id) = &forced_pool {
      candidates.retain(|snap| snap.pool_id == *pool_id);
    }
    if candidates.is_empty() {
      let only_blackout = !rejections.is_empty()
        && rejections
          .iter()
          .all(|r| r.reason == "in blackout window");
      if only_blackout {
        return Ok(Outcome::Requeue);
      }
      let detail = rejections
        .iter()
        .map(|r| format!("{}: {}", r.pool_id, r.reason))
        .collect::<Vec<_>>()
        .join("; ");
      return Ok(Outcome::Blocked(format!(
        "no pool satisfies the constraints ({detail})"
      )));
    }

    // Try candidates in rank order; a permanent platform
    // failure marks the pool ineligible and re-matches.
    let mut last_error: Option<EngineError> = None;
    for pool in &candidates {
      match self
        .submit_to_pool(
          ctx,
          action,
          job,
          &mut tasks.clone(),
          constraints,
          pool,
          new_platform_job,
        )
        .await
      {
        Ok(()) => {
          self.record_success(ctx, action, pool).await?;
          return Ok(Outcome::Done);
        }
        Err(e) if e.retryable() => {
          return Ok(Outcome::Requeue);
        }
        Err(e) => {
          warn!(
            "pool {} ineligible for action {} | {e:#}",
            pool.pool_id, action.unique_id
          );
          last_error = Some(e);
        }
      }
    }
    Ok(Outcome::Blocked(format!(
      "every candidate pool failed | last: {}",
      last_error
        .map(|e| format!("{e}"))
        .unwrap_or_default()
    )))
  }

  #[allow(clippy::too_many_arguments)]
  async fn submit_to_pool(
    &self,
    ctx: &OpContext,
    action: &FederatedAction,
    _job: &Job,
    tasks: &mut [TaskDescriptor],
    constraints: &JobConstraints,
    pool: &PoolSnapshot,
    new_platform_job: bool,
  ) -> Result<(), EngineError> {
    constraints::condition_tasks(tasks, constraints, pool);

    if new_platform_job {
      let result = with_retry(
        ctx,
        RetryPolicy::default(),
        "add_job",
        |_| {
          self.platform.add_job(
            ctx,
            &pool.pool_id,
            &action.job_id,
          )
        },
      )
      .await;
      match result {
        Ok(()) => {}
        // Already created by a previous attempt of this same
        // action (crash between add_job and blob write).
        Err(EngineError::PermanentPlatform {
          kind: armada_client::error::PermanentKind::Conflict,
          ..
        }) => {}
        Err(e) => return Err(e),
      }
    }

    for batch in tasks.chunks(crate::platform::SUBMIT_BATCH_LIMIT)
    {
      with_retry(
        ctx,
        RetryPolicy::default(),
        "submit_tasks",
        |_| {
          self.platform.submit_tasks(
            ctx,
            &action.job_id,
            batch,
          )
        },
      )
      .await?;
    }
    Ok(())
  }

  async fn record_success(
    &self,
    ctx: &OpContext,
    action: &FederatedAction,
    pool: &PoolSnapshot,
  ) -> Result<(), EngineError> {
    let fed_id = &self.federation.id;
    let unique_id = action.unique_id;
    let pool_id = pool.pool_id.clone();
    let group = action.target_group.clone();
    update_job_metadata(
      ctx,
      &*self.store,
      fed_id,
      &action.job_id,
      move |blob| {
        if !blob.applied.contains(&unique_id) {
          blob.applied.push(unique_id);
        }
        blob.location = Some(pool_id.clone());
        blob
          .group_locations
          .insert(group.clone(), pool_id.clone());
        blob.platform_job_id = Some(action.job_id.clone());
      },
    )
    .await?;

    self
      .queue()
      .write_status(
        ctx,
        action,
        ActionStatus::Succeeded,
        Some(pool.pool_id.clone()),
        None,
      )
      .await?;

    // Blackout before this pool can be selected again.
    if self.config.blackout_interval > 0 {
      self.blackout.lock().await.insert(
        pool.pool_id.clone(),
        armada_timestamp()
          + (self.config.blackout_interval as i64) * 1000,
      );
    }

    if pool.autoscale
      && self.config.evaluate_autoscale_after_success
      && let Err(e) = self
        .platform
        .evaluate_autoscale(ctx, &pool.pool_id)
        .await
    {
      warn!(
        "autoscale evaluation on {} failed | {e:#}",
        pool.pool_id
      );
    }
    Ok(())
  }

  async fn process_terminate(
    &self,
    ctx: &OpContext,
    action: &FederatedAction,
    delete: bool,
  ) -> Result<Outcome, EngineError> {
    let fed_id = &self.federation.id;
    let Some(blob) =
      read_job_metadata(ctx, &*self.store, fed_id, &action.job_id)
        .await?
    else {
      return Ok(Outcome::Blocked(format!(
        "job {} is unknown to the federation",
        action.job_id
      )));
    };
    let platform_job = blob
      .platform_job_id
      .as_deref()
      .unwrap_or(&action.job_id);

    let result = if delete {
      self.platform.delete_job(ctx, platform_job).await
    } else {
      self.platform.terminate_job(ctx, platform_job).await
    };
    match result {
      Ok(()) => {}
      Err(e) if e.transient() => return Ok(Outcome::Requeue),
      Err(e) => {
        return Ok(Outcome::Blocked(format!(
          "platform rejected {}: {e}",
          if delete { "delete" } else { "terminate" },
        )));
      }
    }
    if delete {
      self
        .store
        .delete(
          ctx,
          &crate::storage::paths::fed_job(
            fed_id,
            &action.job_id,
          ),
        )
        .await
        .map_err(EngineError::from)?;
    }
    self
      .queue()
      .write_status(
        ctx,
        action,
        ActionStatus::Succeeded,
        blob.location,
        None,
      )
      .await?;
    Ok(Outcome::Done)
  }
}

fn rewrite_task_ids(tasks: &mut [TaskDescriptor], suffix: &str) {
  let renames: HashMap<String, String> = tasks
    .iter()
    .filter_map(|task| task.id.clone())
    .map(|id| {
      let renamed = format!("{id}-{suffix}");
      (id, renamed)
    })
    .collect();
  for task in tasks.iter_mut() {
    if let Some(id) = &task.id {
      task.id = Some(renames[id].clone());
    }
    for dep in task.depends_on.iter_mut() {
      if let Some(renamed) = renames.get(dep) {
        *dep = renamed.clone();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    federation::StaticSnapshots, platform::memory::MemoryPlatform,
    storage::dir::DirStore,
  };
  use armada_client::entities::{
    factory::TaskFactory, federation::AllocationState,
    image::ImageRef, pool::VmImage,
  };

  fn snapshot(pool_id: &str) -> PoolSnapshot {
    PoolSnapshot {
      pool_id: pool_id.to_string(),
      location: "regionA".to_string(),
      vm_size: "standard_d4s_v3".to_string(),
      cores_per_node: 4.0,
      memory_gb_per_node: 16.0,
      idle_nodes: 2,
      running_nodes: 0,
      low_priority_nodes: 0,
      active_tasks: 0,
      max_tasks_per_node: 2,
      autoscale: false,
      allocation_state: AllocationState::Steady,
      native: false,
      windows: false,
      gpu: false,
      infiniband: false,
      custom_image_arm_id: None,
      virtual_network_arm_id: None,
      registries: vec![],
      private_docker_hub_login: false,
      remaining_quota: 100,
    }
  }

  fn federation(unique: bool) -> Federation {
    Federation {
      id: "fed1".to_string(),
      members: vec![],
      unique_job_ids: unique,
      storage: "meta".to_string(),
    }
  }

  fn job(id: &str) -> Job {
    Job {
      id: id.to_string(),
      target: JobTarget::Federation("fed1".to_string()),
      environment: Default::default(),
      max_task_retries: 0,
      auto_complete: false,
      ingress: vec![],
      tasks: vec![TaskDescriptor {
        image: ImageRef::parse("busybox").unwrap(),
        command: "sleep {0}".to_string(),
        factory: Some(TaskFactory::Repeat { count: 3 }),
        ..Default::default()
      }],
      constraints: Some(JobConstraints::default()),
    }
  }

  async fn setup(
    unique: bool,
  ) -> (
    tempfile::TempDir,
    Arc<MemoryPlatform>,
    Arc<
      FederationProxy<MemoryPlatform, DirStore, StaticSnapshots>,
    >,
  ) {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MemoryPlatform::new());
    let store = Arc::new(DirStore::new(dir.path()));
    let snapshots =
      Arc::new(StaticSnapshots::new(vec![snapshot("pool-a")]));

    // The member pool exists on the platform.
    let ctx = OpContext::default();
    let spec = armada_client::entities::pool::PoolSpec {
      id: "pool-a".to_string(),
      vm_image: VmImage::Custom {
        image_id: "img".into(),
      },
      vm_size: "standard_d4s_v3".into(),
      target_dedicated: 2,
      target_preemptible: 0,
      max_tasks_per_node: 2,
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

    let proxy = FederationProxy::new(
      platform.clone(),
      store,
      snapshots,
      federation(unique),
      FederationProxyConfig {
        blackout_interval: 0,
        ..Default::default()
      },
    );
    (dir, platform, proxy)
  }

  async fn drain(
    proxy: &Arc<
      FederationProxy<MemoryPlatform, DirStore, StaticSnapshots>,
    >,
  ) {
    let ctx = OpContext::default();
    let lost = tokio_util::sync::CancellationToken::new();
    proxy.clone().poll_once(&ctx, &lost).await.unwrap();
    // Workers run on spawned tasks; give them a beat.
    for _ in 0..50 {
      tokio::time::sleep(Duration::from_millis(5)).await;
      if proxy.in_flight.lock().await.is_empty() {
        break;
      }
    }
  }

  #[tokio::test]
  async fn add_job_submits_expanded_tasks() {
    let (_dir, platform, proxy) = setup(true).await;
    let ctx = OpContext::default();
    proxy
      .enqueue_add_job(&ctx, job("job1"), None)
      .await
      .unwrap();
    drain(&proxy).await;

    assert!(platform.job_exists("job1").await);
    let tasks = platform.job_task_ids("job1").await;
    assert_eq!(
      tasks,
      vec![
        "dockertask-00000",
        "dockertask-00001",
        "dockertask-00002"
      ]
    );
    assert_eq!(
      platform.job_pool("job1").await.as_deref(),
      Some("pool-a")
    );
  }

  #[tokio::test]
  async fn same_unique_id_applies_once() {
    let (_dir, platform, proxy) = setup(true).await;
    let ctx = OpContext::default();
    let unique_id = Uuid::new_v4();
    proxy
      .enqueue_add_job(&ctx, job("job1"), Some(unique_id))
      .await
      .unwrap();
    proxy
      .enqueue_add_job(&ctx, job("job1"), Some(unique_id))
      .await
      .unwrap();
    drain(&proxy).await;
    drain(&proxy).await;

    // Exactly one platform submission of the three tasks.
    let log = platform.submission_log().await;
    assert_eq!(log.len(), 1);
  }

  #[tokio::test]
  async fn unique_ids_mode_blocks_collisions() {
    let (_dir, _platform, proxy) = setup(true).await;
    let ctx = OpContext::default();
    proxy
      .enqueue_add_job(&ctx, job("job1"), None)
      .await
      .unwrap();
    drain(&proxy).await;
    // Second submission of the same logical job id, distinct
    // unique id.
    proxy
      .enqueue_add_job(&ctx, job("job1"), None)
      .await
      .unwrap();
    drain(&proxy).await;

    let records = proxy
      .queue()
      .action_records(&ctx)
      .await
      .unwrap();
    assert!(records.iter().any(|record| {
      record.status == ActionStatus::Blocked
    }));
  }

  #[tokio::test]
  async fn collision_without_unique_mode_suffixes_task_ids() {
    let (_dir, platform, proxy) = setup(false).await;
    let ctx = OpContext::default();
    proxy
      .enqueue_add_job(&ctx, job("job1"), None)
      .await
      .unwrap();
    drain(&proxy).await;
    proxy
      .enqueue_add_job(&ctx, job("job1"), None)
      .await
      .unwrap();
    drain(&proxy).await;

    let tasks = platform.job_task_ids("job1").await;
    assert_eq!(tasks.len(), 6);
    // The second batch carries the unique id suffix.
    assert!(
      tasks[3].starts_with("dockertask-00000-")
        && tasks[3].len() > "dockertask-00000-".len()
    );
  }

  #[tokio::test]
  async fn terminate_resolves_through_job_metadata() {
    let (_dir, platform, proxy) = setup(false).await;
    let ctx = OpContext::default();
    proxy
      .enqueue_add_job(&ctx, job("job1"), None)
      .await
      .unwrap();
    drain(&proxy).await;
    assert!(platform.job_exists("job1").await);

    proxy
      .enqueue_control(&ctx, "job1", ActionKind::Terminate)
      .await
      .unwrap();
    drain(&proxy).await;

    let records =
      proxy.queue().action_records(&ctx).await.unwrap();
    let terminate = records
      .iter()
      .find(|record| record.kind == "terminate")
      .unwrap();
    assert_eq!(terminate.status, ActionStatus::Succeeded);
    assert_eq!(terminate.location.as_deref(), Some("pool-a"));
  }

  #[tokio::test]
  async fn no_matching_pool_blocks_action() {
    let (_dir, _platform, proxy) = setup(true).await;
    let ctx = OpContext::default();
    let mut bad_job = job("job1");
    bad_job.constraints = Some(JobConstraints {
      gpu: Some(true),
      ..Default::default()
    });
    proxy
      .enqueue_add_job(&ctx, bad_job, None)
      .await
      .unwrap();
    drain(&proxy).await;
    let records = proxy
      .queue()
      .action_records(&ctx)
      .await
      .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ActionStatus::Blocked);
  }
}
