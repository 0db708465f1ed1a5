//! Data movement planning at pool, job, and task scope.
//!
//! The planner never moves bytes between object storage and
//! nodes itself: it resolves ingress units into concrete
//! resource file lists (pre-signed urls the platform downloads
//! onto nodes) and egress units into upload command lines for
//! the task wrapper. What it owns is deduplication: pool scope
//! is idempotent against store markers, job scope transfers
//! once per `(job, node)` pair, task scope fires per instance.
//! On-premises fan-out is the exception and executes directly,
//! see [fanout].

use armada_client::{
  entities::{
    ResourceFile,
    data::{EgressUnit, IngressSource, IngressUnit},
  },
  error::EngineError,
};
use cache::CloneCache;

use crate::{
  fingerprint,
  platform::OpContext,
  storage::{ObjectStore, SasPerms, paths},
};

pub mod fanout;

/// Resolution outcome. `NoWork` means the scope instance has
/// already materialised this unit.
#[derive(Debug, Clone)]
pub enum Resolution {
  NoWork,
  Work(Vec<ResourceFile>),
}

/// Ledger of job-scope ingress fingerprints already landed per
/// `(job_id, node_id)`.
pub type JobIngressLedger =
  CloneCache<(String, String), Vec<String>>;

/// Default sas validity for resolved ingress urls.
const INGRESS_SAS_TTL_SECS: u64 = 24 * 3600;

/// Resolves one ingress unit into resource files. Object
/// storage sources enumerate matching objects; prior task
/// output sources resolve to the egress location of the
/// producing task.
pub async fn resolve_ingress(
  ctx: &OpContext,
  store: &impl ObjectStore,
  unit: &IngressUnit,
) -> Result<Vec<ResourceFile>, EngineError> {
  match &unit.source {
    IngressSource::ObjectStorage {
      remote_path,
      include,
      exclude,
      ..
    } => {
      let keys = store
        .list(ctx, remote_path, include, exclude)
        .await
        .map_err(EngineError::from)?;
      let mut files = Vec::with_capacity(keys.len());
      for key in keys {
        let url = store
          .sas_for(ctx, &key, SasPerms::Read, INGRESS_SAS_TTL_SECS)
          .await
          .map_err(EngineError::from)?;
        files.push(ResourceFile {
          path: destination_path(unit, &key),
          url,
          mode: None,
        });
      }
      Ok(files)
    }
    IngressSource::TaskOutput {
      job_id,
      task_id,
      include,
    } => {
      let prefix = task_output_prefix(job_id, task_id);
      let keys = store
        .list(ctx, &prefix, include, &[])
        .await
        .map_err(EngineError::from)?;
      let mut files = Vec::with_capacity(keys.len());
      for key in keys {
        let url = store
          .sas_for(ctx, &key, SasPerms::Read, INGRESS_SAS_TTL_SECS)
          .await
          .map_err(EngineError::from)?;
        files.push(ResourceFile {
          path: destination_path(unit, &key),
          url,
          mode: None,
        });
      }
      Ok(files)
    }
    IngressSource::LocalToShared { .. } => {
      Err(EngineError::validation(
        "ingress.source",
        "local-to-shared ingress runs through the fan-out transports, not resource files",
      ))
    }
  }
}

/// Canonical object-store prefix where a task's egress lands.
pub fn task_output_prefix(job_id: &str, task_id: &str) -> String {
  format!("job-output/{job_id}/{task_id}")
}

fn destination_path(unit: &IngressUnit, key: &str) -> String {
  let name = key.rsplit('/').next().unwrap_or(key);
  match &unit.destination {
    Some(destination) => {
      format!("{}/{name}", destination.trim_end_matches('/'))
    }
    None => name.to_string(),
  }
}

/// Pool-scope ingress: filters units whose idempotency marker
/// is already present. Run [mark_pool_ingress_done] after the
/// transfer lands.
pub async fn plan_pool_ingress(
  ctx: &OpContext,
  store: &impl ObjectStore,
  pool_id: &str,
  units: &[IngressUnit],
) -> Result<Vec<(String, IngressUnit)>, EngineError> {
  let mut pending = Vec::new();
  for unit in units {
    let fp = fingerprint::ingress_unit(unit);
    let marker =
      paths::pool_ingress_marker(pool_id, fingerprint::short(&fp));
    let exists = store
      .get(ctx, &marker)
      .await
      .map_err(EngineError::from)?
      .is_some();
    if exists {
      debug!(
        "pool {pool_id} ingress {} already done, skipping",
        fingerprint::short(&fp)
      );
      continue;
    }
    pending.push((fp, unit.clone()));
  }
  Ok(pending)
}

pub async fn mark_pool_ingress_done(
  ctx: &OpContext,
  store: &impl ObjectStore,
  pool_id: &str,
  fp: &str,
) -> Result<(), EngineError> {
  let marker =
    paths::pool_ingress_marker(pool_id, fingerprint::short(fp));
  store
    .put(
      ctx,
      &marker,
      armada_client::entities::armada_timestamp()
        .to_string()
        .as_bytes(),
    )
    .await
    .map_err(EngineError::from)?;
  Ok(())
}

/// Job-scope ingress: a node that already materialised the
/// job's input set for one task skips it for subsequent tasks
/// of the same job.
pub async fn plan_job_ingress(
  ledger: &JobIngressLedger,
  job_id: &str,
  node_id: &str,
  units: &[IngressUnit],
) -> Vec<IngressUnit> {
  let key = (job_id.to_string(), node_id.to_string());
  let landed = ledger.get(&key).await.unwrap_or_default();
  units
    .iter()
    .filter(|unit| {
      !landed.contains(&fingerprint::ingress_unit(unit))
    })
    .cloned()
    .collect()
}

pub async fn mark_job_ingress_done(
  ledger: &JobIngressLedger,
  job_id: &str,
  node_id: &str,
  units: &[IngressUnit],
) {
  let key = (job_id.to_string(), node_id.to_string());
  let mut landed = ledger.get(&key).await.unwrap_or_default();
  for unit in units {
    let fp = fingerprint::ingress_unit(unit);
    if !landed.contains(&fp) {
      landed.push(fp);
    }
  }
  ledger.insert(key, landed).await;
}

/// Upload command lines for one egress unit, embedded in the
/// task wrapper and executed only on task success. The upload
/// retries until the task's retention window expires.
pub async fn egress_commands(
  ctx: &OpContext,
  store: &impl ObjectStore,
  job_id: &str,
  task_id: &str,
  unit: &EgressUnit,
  retention_secs: i64,
) -> Result<Vec<String>, EngineError> {
  let destination = if unit.remote_path.is_empty() {
    task_output_prefix(job_id, task_id)
  } else {
    unit.remote_path.clone()
  };
  let url = store
    .sas_for(
      ctx,
      &destination,
      SasPerms::Write,
      retention_secs.max(0) as u64,
    )
    .await
    .map_err(EngineError::from)?;
  let source = unit.source.as_deref().unwrap_or(".");
  let include = if unit.include.is_empty() {
    "*".to_string()
  } else {
    unit.include.join(" ")
  };
  Ok(vec![format!(
    "armada-upload --source '{source}' --include '{include}' \
--destination '{url}' --retry-until-secs {retention_secs}",
  )])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::dir::DirStore;
  use armada_client::entities::data::IngressSource;

  fn unit(prefix: &str) -> IngressUnit {
    IngressUnit {
      source: IngressSource::ObjectStorage {
        account: "data".into(),
        remote_path: prefix.to_string(),
        include: vec![],
        exclude: vec![],
      },
      destination: None,
      extra_options: None,
    }
  }

  #[tokio::test]
  async fn pool_ingress_marker_makes_replan_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let units = vec![unit("input/")];

    let pending =
      plan_pool_ingress(&ctx, &store, "pool-a", &units)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    mark_pool_ingress_done(&ctx, &store, "pool-a", &pending[0].0)
      .await
      .unwrap();

    let pending =
      plan_pool_ingress(&ctx, &store, "pool-a", &units)
        .await
        .unwrap();
    assert!(pending.is_empty());
  }

  #[tokio::test]
  async fn job_ingress_dedupes_per_job_node_pair() {
    let ledger = JobIngressLedger::default();
    let units = vec![unit("input/")];

    let first =
      plan_job_ingress(&ledger, "job1", "tvm-0", &units).await;
    assert_eq!(first.len(), 1);
    mark_job_ingress_done(&ledger, "job1", "tvm-0", &first).await;

    // Same node, same job: nothing to do.
    let again =
      plan_job_ingress(&ledger, "job1", "tvm-0", &units).await;
    assert!(again.is_empty());

    // Different node still transfers.
    let other =
      plan_job_ingress(&ledger, "job1", "tvm-1", &units).await;
    assert_eq!(other.len(), 1);

    // Different job still transfers.
    let other_job =
      plan_job_ingress(&ledger, "job2", "tvm-0", &units).await;
    assert_eq!(other_job.len(), 1);
  }

  #[tokio::test]
  async fn ingress_resolves_to_resource_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    store.put(&ctx, "input/a.bin", b"a").await.unwrap();
    store.put(&ctx, "input/b.bin", b"b").await.unwrap();

    let mut ingress = unit("input/");
    ingress.destination = Some("data/in".to_string());
    let files =
      resolve_ingress(&ctx, &store, &ingress).await.unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].path, "data/in/a.bin");
    assert!(files[0].url.contains("perms=r"));
  }

  #[tokio::test]
  async fn task_output_ingress_reads_producer_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    store
      .put(&ctx, "job-output/job1/t1/result.bin", b"r")
      .await
      .unwrap();

    let ingress = IngressUnit {
      source: IngressSource::TaskOutput {
        job_id: "job1".into(),
        task_id: "t1".into(),
        include: vec![],
      },
      destination: None,
      extra_options: None,
    };
    let files =
      resolve_ingress(&ctx, &store, &ingress).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "result.bin");
  }
}
