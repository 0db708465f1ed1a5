//! Capability adapters around the external collaborators: the
//! batch compute platform, the secret vault, and the identity
//! provider. The engine only ever talks to these traits; the
//! real cloud bindings live outside this repository and the
//! in-memory implementations back tests and local dry runs.

use std::time::{Duration, Instant};

use armada_client::{
  entities::{
    federation::AllocationState,
    job::TaskDescriptor,
    pool::{Node, PoolSpec, ResizeDownPolicy},
  },
  error::{EngineError, PlatformError},
};
use rand::Rng;
use tokio_util::sync::CancellationToken;

pub mod memory;

/// Per-operation context: cooperative cancellation plus a hard
/// deadline, both passed through to every adapter call.
#[derive(Debug, Clone)]
pub struct OpContext {
  pub cancel: CancellationToken,
  pub deadline: Option<Instant>,
}

impl Default for OpContext {
  fn default() -> Self {
    OpContext {
      cancel: CancellationToken::new(),
      deadline: None,
    }
  }
}

impl OpContext {
  pub fn with_deadline(timeout: Duration) -> OpContext {
    OpContext {
      cancel: CancellationToken::new(),
      deadline: Some(Instant::now() + timeout),
    }
  }

  pub fn child(&self) -> OpContext {
    OpContext {
      cancel: self.cancel.child_token(),
      deadline: self.deadline,
    }
  }

  pub fn expired(&self) -> bool {
    self
      .deadline
      .map(|deadline| Instant::now() >= deadline)
      .unwrap_or(false)
  }

  /// Errors when the operation should stop: cancelled or past
  /// deadline.
  pub fn check(&self, label: &str) -> Result<(), EngineError> {
    if self.cancel.is_cancelled() {
      return Err(EngineError::TransientPlatform(format!(
        "{label} cancelled"
      )));
    }
    if self.expired() {
      return Err(EngineError::Timeout(label.to_string()));
    }
    Ok(())
  }
}

/// Observed pool-level allocation state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolObservation {
  pub exists: bool,
  pub allocation_state: AllocationState,
  pub current_dedicated: u32,
  pub current_preemptible: u32,
  pub autoscale_enabled: bool,
}

/// Source coordinates for node / task file retrieval.
#[derive(Debug, Clone)]
pub enum FileSource {
  TaskFile {
    job_id: String,
    task_id: String,
    path: String,
  },
  NodeFile {
    pool_id: String,
    node_id: String,
    path: String,
  },
}

#[derive(Debug, Clone, Default)]
pub struct FileChunk {
  pub data: Vec<u8>,
  pub eof: bool,
}

/// The batch compute platform capability. Implementations must
/// classify failures into the [PlatformError] variants, the
/// engine's retry behavior depends on it.
pub trait ComputePlatform: Send + Sync + 'static {
  fn create_pool(
    &self,
    ctx: &OpContext,
    spec: &PoolSpec,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn resize_pool(
    &self,
    ctx: &OpContext,
    pool_id: &str,
    dedicated: u32,
    preemptible: u32,
    policy: ResizeDownPolicy,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn delete_pool(
    &self,
    ctx: &OpContext,
    pool_id: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn observe_pool(
    &self,
    ctx: &OpContext,
    pool_id: &str,
  ) -> impl Future<Output = Result<PoolObservation, PlatformError>> + Send;

  fn list_nodes(
    &self,
    ctx: &OpContext,
    pool_id: &str,
  ) -> impl Future<Output = Result<Vec<Node>, PlatformError>> + Send;

  fn reboot_node(
    &self,
    ctx: &OpContext,
    pool_id: &str,
    node_id: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn delete_nodes(
    &self,
    ctx: &OpContext,
    pool_id: &str,
    node_ids: &[String],
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn add_job(
    &self,
    ctx: &OpContext,
    pool_id: &str,
    job_id: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  /// Submit one batch of at most [SUBMIT_BATCH_LIMIT] tasks.
  fn submit_tasks(
    &self,
    ctx: &OpContext,
    job_id: &str,
    tasks: &[TaskDescriptor],
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn terminate_tasks(
    &self,
    ctx: &OpContext,
    job_id: &str,
    task_ids: &[String],
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn terminate_job(
    &self,
    ctx: &OpContext,
    job_id: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  fn delete_job(
    &self,
    ctx: &OpContext,
    job_id: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  /// Read a range of a file on a node or task. The observer
  /// polls this to stream output.
  fn stream_file(
    &self,
    ctx: &OpContext,
    source: &FileSource,
    offset: u64,
  ) -> impl Future<Output = Result<FileChunk, PlatformError>> + Send;

  /// Ask the platform to bundle and upload node logs.
  fn upload_logs(
    &self,
    ctx: &OpContext,
    pool_id: &str,
    node_id: &str,
    destination: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;

  /// Trigger an immediate autoscale formula evaluation.
  fn evaluate_autoscale(
    &self,
    ctx: &OpContext,
    pool_id: &str,
  ) -> impl Future<Output = Result<(), PlatformError>> + Send;
}

/// Platform task submission batch limit.
pub const SUBMIT_BATCH_LIMIT: usize = 100;

/// External secret vault capability. Callers authenticate with
/// a bearer token from the [IdentityProvider].
pub trait SecretVault: Send + Sync + 'static {
  fn get_secret(
    &self,
    ctx: &OpContext,
    token: &str,
    uri: &str,
  ) -> impl Future<Output = Result<Vec<u8>, PlatformError>> + Send;
}

/// Identity provider capability. Tokens are cacheable until
/// expiry.
pub trait IdentityProvider: Send + Sync + 'static {
  fn token(
    &self,
    ctx: &OpContext,
    scope: &str,
  ) -> impl Future<Output = Result<(String, i64), PlatformError>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_millis(250),
      max_delay: Duration::from_secs(15),
    }
  }
}

impl RetryPolicy {
  fn delay(&self, attempt: u32) -> Duration {
    let exp = self
      .base_delay
      .saturating_mul(2u32.saturating_pow(attempt))
      .min(self.max_delay);
    let jitter = rand::rng().random_range(0..=exp.as_millis() / 2);
    exp + Duration::from_millis(jitter as u64)
  }
}

/// Drives a platform operation through the retry policy:
/// transient failures back off exponentially with jitter, auth
/// failures are retried exactly once (after the caller's token
/// cache is invalidated), everything else surfaces immediately.
pub async fn with_retry<T, F, Fut>(
  ctx: &OpContext,
  policy: RetryPolicy,
  label: &str,
  operation: F,
) -> Result<T, EngineError>
where
  F: Fn(u32) -> Fut,
  Fut: Future<Output = Result<T, PlatformError>>,
{
  let mut auth_retried = false;
  let mut attempt = 0;
  loop {
    ctx.check(label)?;
    match operation(attempt).await {
      Ok(value) => return Ok(value),
      Err(PlatformError::Transient(message)) => {
        attempt += 1;
        if attempt >= policy.max_attempts {
          return Err(EngineError::TransientPlatform(format!(
            "{label} failed after {attempt} attempts | {message}"
          )));
        }
        let delay = policy.delay(attempt);
        debug!(
          "{label} transient failure, retrying in {delay:?} | {message}"
        );
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = ctx.cancel.cancelled() => {}
        }
      }
      Err(PlatformError::Auth(message)) if !auth_retried => {
        auth_retried = true;
        debug!("{label} auth failure, refreshing once | {message}");
      }
      Err(e) => return Err(e.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[tokio::test]
  async fn retries_transient_until_success() {
    let calls = AtomicU32::new(0);
    let ctx = OpContext::default();
    let policy = RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(2),
    };
    let result = with_retry(&ctx, policy, "op", |_| async {
      if calls.fetch_add(1, Ordering::SeqCst) < 2 {
        Err(PlatformError::Transient("not yet".into()))
      } else {
        Ok(42)
      }
    })
    .await
    .unwrap();
    assert_eq!(result, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn auth_failure_retried_exactly_once() {
    let calls = AtomicU32::new(0);
    let ctx = OpContext::default();
    let result: Result<(), _> = with_retry(
      &ctx,
      RetryPolicy::default(),
      "op",
      |_| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(PlatformError::Auth("denied".into()))
      },
    )
    .await;
    assert!(matches!(result, Err(EngineError::Auth(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn permanent_failures_surface_immediately() {
    let calls = AtomicU32::new(0);
    let ctx = OpContext::default();
    let result: Result<(), _> = with_retry(
      &ctx,
      RetryPolicy::default(),
      "op",
      |_| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(PlatformError::QuotaExceeded("cores".into()))
      },
    )
    .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancelled_context_stops_retrying() {
    let ctx = OpContext::default();
    ctx.cancel.cancel();
    let result: Result<(), _> = with_retry(
      &ctx,
      RetryPolicy::default(),
      "op",
      |_| async { Err(PlatformError::Transient("x".into())) },
    )
    .await;
    assert!(result.is_err());
  }
}
