//! Object storage capability and the engine-owned metadata
//! layout on top of it.
//!
//! All durable engine state (federation queues, leader leases,
//! job location blobs, replication maps, ingress markers) lives
//! in one object store, addressed by the path helpers in
//! [paths]. Mutations that need coordination use optimistic
//! concurrency through etag if-match writes.

use armada_client::error::PlatformError;

use crate::platform::OpContext;

pub mod dir;

/// Object store capability. Paths are `/` separated keys
/// relative to the engine's metadata root.
pub trait ObjectStore: Send + Sync + 'static {
  /// Unconditional write. Returns the new etag.
  fn put(
    &self,
    ctx: &OpContext,
    path: &str,
    data: &[u8],
  ) -> impl Future<Output = Result<String, PlatformError>> + Send;

  /// Conditional write: `Some(etag)` requires the current
  /// object to match, `None` requires the object to not exist.
  /// Mismatch fails with [PlatformError::Conflict].
  fn put_if_match(
    &self,
    ctx: &OpContext,
    path: &str,
    data: &[u8],
    etag: Option<&str>,
  ) -> impl Future<Output = Result<String, PlatformError>> + Send;

  /// Returns `(data, etag)`, or None when absent.
  fn get(
    &self,
    ctx: &OpContext,
    path: &str,
  ) -> impl Future<
    Output = Result<Option<(Vec<u8>, String)>, PlatformError>,
  > + Send;

  /// Returns whether the object existed.
  fn delete(
    &self,
    ctx: &OpContext,
    path: &str,
  ) -> impl Future<Output = Result<bool, PlatformError>> + Send;

  /// Lists keys under the prefix matching the include globs
  /// (all when empty) minus the exclude globs, sorted.
  fn list(
    &self,
    ctx: &OpContext,
    prefix: &str,
    include: &[String],
    exclude: &[String],
  ) -> impl Future<Output = Result<Vec<String>, PlatformError>> + Send;

  /// Produce a pre-signed url for out-of-band access.
  fn sas_for(
    &self,
    ctx: &OpContext,
    path: &str,
    perms: SasPerms,
    ttl_secs: u64,
  ) -> impl Future<Output = Result<String, PlatformError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasPerms {
  Read,
  Write,
  ReadWrite,
}

impl SasPerms {
  pub fn as_str(&self) -> &'static str {
    match self {
      SasPerms::Read => "r",
      SasPerms::Write => "w",
      SasPerms::ReadWrite => "rw",
    }
  }
}

/// Whether a key matches include globs (all when empty) minus
/// exclude globs. Shared by store listings and the data
/// movement planner.
pub fn globs_admit(
  key: &str,
  include: &[String],
  exclude: &[String],
) -> bool {
  let matches = |pattern: &String| {
    wildcard::Wildcard::new(pattern.as_bytes())
      .map(|w| w.is_match(key.as_bytes()))
      .unwrap_or(false)
  };
  let included =
    include.is_empty() || include.iter().any(matches);
  included && !exclude.iter().any(matches)
}

/// Engine-owned metadata key layout.
pub mod paths {
  /// Prefix of the federated action queue, partitioned by
  /// target group.
  pub fn fed_queue(fed_id: &str) -> String {
    format!("fed-{fed_id}/queue")
  }

  pub fn fed_queue_group(fed_id: &str, group: &str) -> String {
    format!("fed-{fed_id}/queue/{group}")
  }

  /// One queue entry. Zero padded sequence keeps store listing
  /// order equal to FIFO order.
  pub fn fed_queue_entry(
    fed_id: &str,
    group: &str,
    sequence: u64,
  ) -> String {
    format!("fed-{fed_id}/queue/{group}/{sequence:020}")
  }

  pub fn fed_leader_lease(fed_id: &str) -> String {
    format!("fed-{fed_id}/leases/leader")
  }

  pub fn fed_job(fed_id: &str, job_id: &str) -> String {
    format!("fed-{fed_id}/jobs/{job_id}")
  }

  pub fn fed_action(fed_id: &str, unique_id: &str) -> String {
    format!("fed-{fed_id}/actions/{unique_id}")
  }

  pub fn fed_actions(fed_id: &str) -> String {
    format!("fed-{fed_id}/actions")
  }

  /// Replication map and seed set for one image on one pool.
  pub fn pool_image(pool_id: &str, image_id: &str) -> String {
    format!("pool-{pool_id}/images/{image_id}")
  }

  pub fn pool_images(pool_id: &str) -> String {
    format!("pool-{pool_id}/images")
  }

  /// Idempotency marker for pool-scope ingress.
  pub fn pool_ingress_marker(
    pool_id: &str,
    marker: &str,
  ) -> String {
    format!("pool-{pool_id}/preload-ingress/{marker}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn glob_include_exclude() {
    let include = vec!["data/*.csv".to_string()];
    let exclude = vec!["data/skip*".to_string()];
    assert!(globs_admit("data/a.csv", &include, &exclude));
    assert!(!globs_admit("data/skip.csv", &include, &exclude));
    assert!(!globs_admit("data/a.txt", &include, &exclude));
    assert!(globs_admit("anything", &[], &[]));
  }

  #[test]
  fn queue_entry_paths_sort_fifo() {
    let early = paths::fed_queue_entry("f", "g", 7);
    let late = paths::fed_queue_entry("f", "g", 123);
    assert!(early < late);
  }
}
