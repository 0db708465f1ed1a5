//! In-memory compute platform. Backs the test suite and local
//! dry runs; real cloud bindings implement the same trait out
//! of tree.
//!
//! Nodes advance one lifecycle step on every `list_nodes` call,
//! so controller poll loops observe a realistic progression
//! without wall-clock coupling. Tests inject failures and mark
//! images through the helper methods.

use std::collections::{HashMap, HashSet};

use armada_client::{
  entities::{
    federation::AllocationState,
    job::TaskDescriptor,
    pool::{Node, NodeState, PoolSpec, ResizeDownPolicy},
  },
  error::PlatformError,
};
use tokio::sync::Mutex;

use crate::platform::{
  ComputePlatform, FileChunk, FileSource, OpContext,
  PoolObservation, SUBMIT_BATCH_LIMIT,
};

#[derive(Default)]
pub struct MemoryPlatform {
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  pools: HashMap<String, MemoryPool>,
  jobs: HashMap<String, MemoryJob>,
  /// Every submit_tasks call in order, for ordering assertions.
  submission_log: Vec<(String, Vec<String>)>,
  autoscale_evaluations: Vec<String>,
}

struct MemoryPool {
  spec: PoolSpec,
  nodes: Vec<Node>,
  next_node: u32,
  /// Node ids whose next start task attempt fails.
  fail_start_task: HashSet<String>,
  /// Replenish deleted nodes back up to target.
  replenish: bool,
}

struct MemoryJob {
  pool_id: String,
  tasks: Vec<TaskDescriptor>,
  terminated: bool,
  files: HashMap<(String, String), Vec<u8>>,
}

impl MemoryPool {
  fn spawn_node(&mut self, dedicated: bool) {
    let id = format!("tvm-{:06}", self.next_node);
    self.next_node += 1;
    self.nodes.push(Node {
      id,
      state: NodeState::Creating,
      dedicated,
      start_task_exit_code: None,
      start_task_stdout: None,
      start_task_stderr: None,
      images_present: Vec::new(),
      address: Some(format!(
        "10.0.0.{}:6881",
        self.next_node
      )),
    });
  }

  fn advance(&mut self) {
    let failures = std::mem::take(&mut self.fail_start_task);
    for node in &mut self.nodes {
      node.state = match node.state {
        NodeState::Creating => NodeState::Starting,
        NodeState::Starting => NodeState::WaitingForStartTask,
        NodeState::WaitingForStartTask => {
          if failures.contains(&node.id) {
            node.start_task_exit_code = Some(1);
            node.start_task_stderr =
              Some("start task failed".to_string());
            NodeState::StartTaskFailed
          } else {
            node.start_task_exit_code = Some(0);
            NodeState::Idle
          }
        }
        state => state,
      };
    }
    // Platform replenishment after node deletion.
    if self.replenish {
      let dedicated = self
        .nodes
        .iter()
        .filter(|node| node.dedicated)
        .count() as u32;
      let preemptible = self.nodes.len() as u32 - dedicated;
      for _ in dedicated..self.spec.target_dedicated {
        self.spawn_node(true);
      }
      for _ in preemptible..self.spec.target_preemptible {
        self.spawn_node(false);
      }
    }
  }

  fn allocation_state(&self) -> AllocationState {
    if self.nodes.iter().any(|node| node.state.transient())
      || self.nodes.len() as u32 != self.spec.target_nodes()
    {
      AllocationState::Resizing
    } else {
      AllocationState::Steady
    }
  }
}

impl MemoryPlatform {
  pub fn new() -> MemoryPlatform {
    Default::default()
  }

  /// Make the next start task attempt fail on the given node.
  pub async fn inject_start_task_failure(
    &self,
    pool_id: &str,
    node_id: &str,
  ) {
    let mut state = self.state.lock().await;
    if let Some(pool) = state.pools.get_mut(pool_id) {
      pool.fail_start_task.insert(node_id.to_string());
    }
  }

  pub async fn set_node_state(
    &self,
    pool_id: &str,
    node_id: &str,
    node_state: NodeState,
  ) {
    let mut state = self.state.lock().await;
    if let Some(pool) = state.pools.get_mut(pool_id)
      && let Some(node) =
        pool.nodes.iter_mut().find(|node| node.id == node_id)
    {
      node.state = node_state;
    }
  }

  /// Record an image as present on every node of the pool.
  pub async fn mark_image_present(
    &self,
    pool_id: &str,
    image: &str,
  ) {
    let mut state = self.state.lock().await;
    if let Some(pool) = state.pools.get_mut(pool_id) {
      for node in &mut pool.nodes {
        if !node.images_present.iter().any(|i| i == image) {
          node.images_present.push(image.to_string());
        }
      }
    }
  }

  pub async fn write_task_file(
    &self,
    job_id: &str,
    task_id: &str,
    path: &str,
    data: &[u8],
  ) {
    let mut state = self.state.lock().await;
    if let Some(job) = state.jobs.get_mut(job_id) {
      job
        .files
        .insert((task_id.to_string(), path.to_string()), data.to_vec());
    }
  }

  pub async fn submission_log(&self) -> Vec<(String, Vec<String>)> {
    self.state.lock().await.submission_log.clone()
  }

  pub async fn autoscale_evaluations(&self) -> Vec<String> {
    self.state.lock().await.autoscale_evaluations.clone()
  }

  pub async fn job_task_ids(&self, job_id: &str) -> Vec<String> {
    let state = self.state.lock().await;
    state
      .jobs
      .get(job_id)
      .map(|job| {
        job
          .tasks
          .iter()
          .filter_map(|task| task.id.clone())
          .collect()
      })
      .unwrap_or_default()
  }

  pub async fn job_pool(&self, job_id: &str) -> Option<String> {
    let state = self.state.lock().await;
    state.jobs.get(job_id).map(|job| job.pool_id.clone())
  }

  pub async fn job_exists(&self, job_id: &str) -> bool {
    self.state.lock().await.jobs.contains_key(job_id)
  }

  pub async fn job_terminated(&self, job_id: &str) -> bool {
    let state = self.state.lock().await;
    state
      .jobs
      .get(job_id)
      .map(|job| job.terminated)
      .unwrap_or(false)
  }
}

impl ComputePlatform for MemoryPlatform {
  async fn create_pool(
    &self,
    ctx: &OpContext,
    spec: &PoolSpec,
  ) -> Result<(), PlatformError> {
    if ctx.cancel.is_cancelled() {
      return Err(PlatformError::Transient("cancelled".into()));
    }
    let mut state = self.state.lock().await;
    if state.pools.contains_key(&spec.id) {
      return Err(PlatformError::Conflict(format!(
        "pool {} already exists",
        spec.id
      )));
    }
    let mut pool = MemoryPool {
      spec: spec.clone(),
      nodes: Vec::new(),
      next_node: 0,
      fail_start_task: HashSet::new(),
      replenish: false,
    };
    for _ in 0..spec.target_dedicated {
      pool.spawn_node(true);
    }
    for _ in 0..spec.target_preemptible {
      pool.spawn_node(false);
    }
    state.pools.insert(spec.id.clone(), pool);
    Ok(())
  }

  async fn resize_pool(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
    dedicated: u32,
    preemptible: u32,
    _policy: ResizeDownPolicy,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    let pool = state.pools.get_mut(pool_id).ok_or_else(|| {
      PlatformError::NotFound(format!("pool {pool_id}"))
    })?;
    pool.spec.target_dedicated = dedicated;
    pool.spec.target_preemptible = preemptible;
    // Grow immediately; shrink removes highest ids first.
    let current_dedicated = pool
      .nodes
      .iter()
      .filter(|node| node.dedicated)
      .count() as u32;
    for _ in current_dedicated..dedicated {
      pool.spawn_node(true);
    }
    let current_preemptible = pool
      .nodes
      .iter()
      .filter(|node| !node.dedicated)
      .count() as u32;
    for _ in current_preemptible..preemptible {
      pool.spawn_node(false);
    }
    shrink(&mut pool.nodes, true, dedicated);
    shrink(&mut pool.nodes, false, preemptible);
    Ok(())
  }

  async fn delete_pool(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    state.pools.remove(pool_id).ok_or_else(|| {
      PlatformError::NotFound(format!("pool {pool_id}"))
    })?;
    Ok(())
  }

  async fn observe_pool(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
  ) -> Result<PoolObservation, PlatformError> {
    let state = self.state.lock().await;
    let Some(pool) = state.pools.get(pool_id) else {
      return Ok(PoolObservation::default());
    };
    let dedicated = pool
      .nodes
      .iter()
      .filter(|node| node.dedicated)
      .count() as u32;
    Ok(PoolObservation {
      exists: true,
      allocation_state: pool.allocation_state(),
      current_dedicated: dedicated,
      current_preemptible: pool.nodes.len() as u32 - dedicated,
      autoscale_enabled: false,
    })
  }

  async fn list_nodes(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
  ) -> Result<Vec<Node>, PlatformError> {
    let mut state = self.state.lock().await;
    let pool = state.pools.get_mut(pool_id).ok_or_else(|| {
      PlatformError::NotFound(format!("pool {pool_id}"))
    })?;
    let nodes = pool.nodes.clone();
    pool.advance();
    Ok(nodes)
  }

  async fn reboot_node(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
    node_id: &str,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    let pool = state.pools.get_mut(pool_id).ok_or_else(|| {
      PlatformError::NotFound(format!("pool {pool_id}"))
    })?;
    let node = pool
      .nodes
      .iter_mut()
      .find(|node| node.id == node_id)
      .ok_or_else(|| {
        PlatformError::NotFound(format!("node {node_id}"))
      })?;
    node.state = NodeState::Starting;
    node.start_task_exit_code = None;
    Ok(())
  }

  async fn delete_nodes(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
    node_ids: &[String],
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    let pool = state.pools.get_mut(pool_id).ok_or_else(|| {
      PlatformError::NotFound(format!("pool {pool_id}"))
    })?;
    pool
      .nodes
      .retain(|node| !node_ids.contains(&node.id));
    pool.replenish = true;
    Ok(())
  }

  async fn add_job(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
    job_id: &str,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    if state.jobs.contains_key(job_id) {
      return Err(PlatformError::Conflict(format!(
        "job {job_id} already exists"
      )));
    }
    if !state.pools.contains_key(pool_id) {
      return Err(PlatformError::NotFound(format!(
        "pool {pool_id}"
      )));
    }
    state.jobs.insert(
      job_id.to_string(),
      MemoryJob {
        pool_id: pool_id.to_string(),
        tasks: Vec::new(),
        terminated: false,
        files: HashMap::new(),
      },
    );
    Ok(())
  }

  async fn submit_tasks(
    &self,
    _ctx: &OpContext,
    job_id: &str,
    tasks: &[TaskDescriptor],
  ) -> Result<(), PlatformError> {
    if tasks.len() > SUBMIT_BATCH_LIMIT {
      return Err(PlatformError::Conflict(format!(
        "batch of {} exceeds the {SUBMIT_BATCH_LIMIT} task limit",
        tasks.len()
      )));
    }
    let mut state = self.state.lock().await;
    let job = state.jobs.get_mut(job_id).ok_or_else(|| {
      PlatformError::NotFound(format!("job {job_id}"))
    })?;
    if job.terminated {
      return Err(PlatformError::Conflict(format!(
        "job {job_id} is terminated"
      )));
    }
    job.tasks.extend(tasks.iter().cloned());
    let ids = tasks
      .iter()
      .filter_map(|task| task.id.clone())
      .collect();
    state
      .submission_log
      .push((job_id.to_string(), ids));
    Ok(())
  }

  async fn terminate_tasks(
    &self,
    _ctx: &OpContext,
    job_id: &str,
    _task_ids: &[String],
  ) -> Result<(), PlatformError> {
    let state = self.state.lock().await;
    if !state.jobs.contains_key(job_id) {
      return Err(PlatformError::NotFound(format!(
        "job {job_id}"
      )));
    }
    Ok(())
  }

  async fn terminate_job(
    &self,
    _ctx: &OpContext,
    job_id: &str,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    let job = state.jobs.get_mut(job_id).ok_or_else(|| {
      PlatformError::NotFound(format!("job {job_id}"))
    })?;
    job.terminated = true;
    Ok(())
  }

  async fn delete_job(
    &self,
    _ctx: &OpContext,
    job_id: &str,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    state.jobs.remove(job_id).ok_or_else(|| {
      PlatformError::NotFound(format!("job {job_id}"))
    })?;
    Ok(())
  }

  async fn stream_file(
    &self,
    _ctx: &OpContext,
    source: &FileSource,
    offset: u64,
  ) -> Result<FileChunk, PlatformError> {
    let state = self.state.lock().await;
    let data = match source {
      FileSource::TaskFile {
        job_id,
        task_id,
        path,
      } => state
        .jobs
        .get(job_id)
        .and_then(|job| {
          job.files.get(&(task_id.clone(), path.clone()))
        })
        .cloned(),
      FileSource::NodeFile { pool_id, node_id, path } => {
        let pool = state.pools.get(pool_id);
        pool
          .and_then(|pool| {
            pool.nodes.iter().find(|node| &node.id == node_id)
          })
          .and_then(|node| match path.as_str() {
            "startup/stdout.txt" => {
              node.start_task_stdout.clone()
            }
            "startup/stderr.txt" => {
              node.start_task_stderr.clone()
            }
            _ => None,
          })
          .map(String::into_bytes)
      }
    };
    let data = data.ok_or_else(|| {
      PlatformError::NotFound("file not found".into())
    })?;
    let offset = offset as usize;
    if offset >= data.len() {
      return Ok(FileChunk {
        data: Vec::new(),
        eof: true,
      });
    }
    Ok(FileChunk {
      data: data[offset..].to_vec(),
      eof: true,
    })
  }

  async fn upload_logs(
    &self,
    _ctx: &OpContext,
    _pool_id: &str,
    _node_id: &str,
    _destination: &str,
  ) -> Result<(), PlatformError> {
    Ok(())
  }

  async fn evaluate_autoscale(
    &self,
    _ctx: &OpContext,
    pool_id: &str,
  ) -> Result<(), PlatformError> {
    let mut state = self.state.lock().await;
    state.autoscale_evaluations.push(pool_id.to_string());
    Ok(())
  }
}

/// Remove highest ids first within a node class until the
/// target is met.
fn shrink(nodes: &mut Vec<Node>, dedicated: bool, target: u32) {
  loop {
    let count =
      nodes.iter().filter(|n| n.dedicated == dedicated).count();
    if count as u32 <= target {
      return;
    }
    let victim = nodes
      .iter()
      .enumerate()
      .filter(|(_, n)| n.dedicated == dedicated)
      .max_by(|(_, a), (_, b)| a.id.cmp(&b.id))
      .map(|(i, _)| i);
    match victim {
      Some(index) => {
        nodes.remove(index);
      }
      None => return,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use armada_client::entities::pool::VmImage;

  #[tokio::test]
  async fn node_counts_partition_into_classes_and_transients() {
    let platform = MemoryPlatform::new();
    let ctx = OpContext::default();
    let spec = PoolSpec {
      id: "pool-inv".into(),
      vm_image: VmImage::Custom {
        image_id: "img".into(),
      },
      vm_size: "s".into(),
      target_dedicated: 2,
      target_preemptible: 1,
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

    // At every observation the nodes partition into dedicated,
    // preemptible, and transient (still allocating) counts that
    // sum to the node list length.
    for _ in 0..5 {
      let nodes =
        platform.list_nodes(&ctx, "pool-inv").await.unwrap();
      let transient = nodes
        .iter()
        .filter(|node| node.state.transient())
        .count();
      let dedicated = nodes
        .iter()
        .filter(|node| {
          node.dedicated && !node.state.transient()
        })
        .count();
      let preemptible = nodes
        .iter()
        .filter(|node| {
          !node.dedicated && !node.state.transient()
        })
        .count();
      assert_eq!(
        dedicated + preemptible + transient,
        nodes.len()
      );
    }
  }

  #[tokio::test]
  async fn oversized_batch_is_rejected() {
    let platform = MemoryPlatform::new();
    let ctx = OpContext::default();
    let spec = PoolSpec {
      id: "pool-b".into(),
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
    platform.add_job(&ctx, "pool-b", "job1").await.unwrap();
    let tasks: Vec<TaskDescriptor> = (0..101)
      .map(|i| TaskDescriptor {
        id: Some(format!("t{i}")),
        command: "echo".into(),
        ..Default::default()
      })
      .collect();
    assert!(
      platform
        .submit_tasks(&ctx, "job1", &tasks)
        .await
        .is_err()
    );
  }
}

/// Static in-memory secret vault.
#[derive(Default)]
pub struct MemoryVault {
  secrets: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryVault {
  pub fn with_secret(
    self,
    uri: impl Into<String>,
    value: impl Into<Vec<u8>>,
  ) -> Self {
    self
      .secrets
      .lock()
      .unwrap()
      .insert(uri.into(), value.into());
    self
  }
}

impl crate::platform::SecretVault for MemoryVault {
  async fn get_secret(
    &self,
    _ctx: &OpContext,
    token: &str,
    uri: &str,
  ) -> Result<Vec<u8>, PlatformError> {
    if token.is_empty() {
      return Err(PlatformError::Auth(
        "missing vault token".into(),
      ));
    }
    self
      .secrets
      .lock()
      .unwrap()
      .get(uri)
      .cloned()
      .ok_or_else(|| {
        PlatformError::NotFound(format!("secret {uri}"))
      })
  }
}

/// Identity provider issuing static tokens with a fixed expiry.
pub struct MemoryIdentity {
  pub expiry_ms: i64,
}

impl Default for MemoryIdentity {
  fn default() -> Self {
    MemoryIdentity {
      expiry_ms: 3_600_000,
    }
  }
}

impl crate::platform::IdentityProvider for MemoryIdentity {
  async fn token(
    &self,
    _ctx: &OpContext,
    scope: &str,
  ) -> Result<(String, i64), PlatformError> {
    Ok((
      format!("token-{scope}"),
      armada_client::entities::armada_timestamp() + self.expiry_ms,
    ))
  }
}
