//! Federation: a logical scheduling target spanning pools in
//! multiple regions. The proxy consumes a durable action queue,
//! matches job constraints against member pool snapshots,
//! rewrites tasks for the selected pool, and submits through
//! the compute platform.

use std::collections::HashMap;

use armada_client::{
  entities::federation::PoolSnapshot, error::EngineError,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  platform::OpContext,
  storage::{ObjectStore, paths},
};

pub mod constraints;
pub mod lease;
pub mod proxy;
pub mod queue;

/// Per-job metadata blob under `fed-{fed}/jobs/{job}`. The only
/// cross-process mutable state, updated with etag optimistic
/// concurrency.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct JobMetadata {
  /// Unique ids already applied, the idempotence ledger.
  pub applied: Vec<Uuid>,
  /// Pool the job landed on.
  pub location: Option<String>,
  /// Pool per task group, for co-scheduling affinity.
  pub group_locations: HashMap<String, String>,
  /// Job id actually submitted to the platform (differs from
  /// the logical id after a collision suffix rewrite).
  pub platform_job_id: Option<String>,
}

/// Bounded CAS retries for metadata blob updates.
const BLOB_CONFLICT_RETRIES: u32 = 5;

pub async fn read_job_metadata(
  ctx: &OpContext,
  store: &impl ObjectStore,
  fed_id: &str,
  job_id: &str,
) -> Result<Option<JobMetadata>, EngineError> {
  let path = paths::fed_job(fed_id, job_id);
  let Some((data, _etag)) =
    store.get(ctx, &path).await.map_err(EngineError::from)?
  else {
    return Ok(None);
  };
  serde_json::from_slice(&data).map(Some).map_err(|e| {
    EngineError::Integrity(format!(
      "corrupt job metadata at {path} | {e}"
    ))
  })
}

/// Read-modify-write with etag if-match. Conflicts retry with
/// backoff up to the bound, then surface transient so the
/// action requeues.
pub async fn update_job_metadata(
  ctx: &OpContext,
  store: &impl ObjectStore,
  fed_id: &str,
  job_id: &str,
  mutate: impl Fn(&mut JobMetadata),
) -> Result<JobMetadata, EngineError> {
  let path = paths::fed_job(fed_id, job_id);
  for attempt in 0..BLOB_CONFLICT_RETRIES {
    ctx.check("update job metadata")?;
    let current =
      store.get(ctx, &path).await.map_err(EngineError::from)?;
    let (mut blob, etag) = match &current {
      Some((data, etag)) => (
        serde_json::from_slice::<JobMetadata>(data).map_err(
          |e| {
            EngineError::Integrity(format!(
              "corrupt job metadata at {path} | {e}"
            ))
          },
        )?,
        Some(etag.as_str()),
      ),
      None => (JobMetadata::default(), None),
    };
    mutate(&mut blob);
    let data = serde_json::to_vec(&blob)
      .expect("job metadata serializes");
    match store.put_if_match(ctx, &path, &data, etag).await {
      Ok(_) => return Ok(blob),
      Err(e) if matches!(e, armada_client::error::PlatformError::Conflict(_)) =>
      {
        debug!(
          "job metadata conflict on {path}, retry {attempt}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(
          25 * (attempt as u64 + 1),
        ))
        .await;
      }
      Err(e) => return Err(e.into()),
    }
  }
  Err(EngineError::TransientPlatform(format!(
    "job metadata update on {path} kept conflicting"
  )))
}

/// Provider of member pool snapshots for constraint matching.
/// The discovery loop refreshes these on its own interval.
pub trait SnapshotSource: Send + Sync + 'static {
  fn snapshots(
    &self,
    ctx: &OpContext,
  ) -> impl Future<Output = Result<Vec<PoolSnapshot>, EngineError>> + Send;
}

/// Fixed snapshot set, optionally overlaid with live node
/// counts from the platform by the caller. Serves tests and
/// deployments where pool facts come from configuration.
pub struct StaticSnapshots(
  pub arc_swap::ArcSwap<Vec<PoolSnapshot>>,
);

impl StaticSnapshots {
  pub fn new(snapshots: Vec<PoolSnapshot>) -> Self {
    StaticSnapshots(arc_swap::ArcSwap::new(
      std::sync::Arc::new(snapshots),
    ))
  }

  pub fn replace(&self, snapshots: Vec<PoolSnapshot>) {
    self
      .0
      .store(std::sync::Arc::new(snapshots));
  }
}

impl SnapshotSource for StaticSnapshots {
  async fn snapshots(
    &self,
    _ctx: &OpContext,
  ) -> Result<Vec<PoolSnapshot>, EngineError> {
    Ok(self.0.load().as_ref().clone())
  }
}
