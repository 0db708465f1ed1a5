//! Tracker client.
//!
//! The pool's metadata store is a shared filesystem mount on
//! every node. Per-image entries under
//! `pool-{pool_id}/images/` carry the chunk map, the holder
//! records, and the origin source claims. Updates serialize
//! behind a lock file so the semaphore-like source counter and
//! the holder maps stay consistent across nodes.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context;
use armada_client::entities::armada_timestamp;
use serde::{Deserialize, Serialize};

use crate::chunks::image_id;

/// A holder's view of one image.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct HolderRecord {
  /// Peer channel address, `host:port`.
  pub address: String,
  /// Chunk indexes held.
  pub chunks: Vec<u32>,
  /// Holds every chunk and serves them.
  pub seed: bool,
  /// Concurrent uploads in flight, for peer choice.
  pub active_uploads: u32,
  pub updated_at: i64,
}

#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct ImageEntry {
  pub image: String,
  pub chunk_hashes: Vec<String>,
  pub compressed: bool,
  pub holders: BTreeMap<String, HolderRecord>,
  /// Nodes pulling from the origin registry, bounded by the
  /// concurrent source download limit.
  pub source_claims: Vec<String>,
}

impl ImageEntry {
  pub fn chunk_count(&self) -> u32 {
    self.chunk_hashes.len() as u32
  }

  /// Peers holding the chunk, for rarest-first ordering.
  pub fn holders_of(&self, index: u32) -> Vec<&str> {
    self
      .holders
      .iter()
      .filter(|(_, holder)| holder.chunks.contains(&index))
      .map(|(node, _)| node.as_str())
      .collect()
  }
}

pub struct Tracker {
  root: PathBuf,
  pool_id: String,
}

const LOCK_STALE: Duration = Duration::from_secs(30);

impl Tracker {
  pub fn new(
    root: impl Into<PathBuf>,
    pool_id: impl Into<String>,
  ) -> Tracker {
    Tracker {
      root: root.into(),
      pool_id: pool_id.into(),
    }
  }

  fn images_dir(&self) -> PathBuf {
    self
      .root
      .join(format!("pool-{}", self.pool_id))
      .join("images")
  }

  fn entry_path(&self, image: &str) -> PathBuf {
    self.images_dir().join(format!("{}.json", image_id(image)))
  }

  /// Registers this node with the tracker under its pool id.
  pub async fn register_node(
    &self,
    node_id: &str,
    address: &str,
  ) -> anyhow::Result<()> {
    let dir = self
      .root
      .join(format!("pool-{}", self.pool_id))
      .join("nodes");
    tokio::fs::create_dir_all(&dir).await.with_context(|| {
      format!("failed to create {}", dir.display())
    })?;
    let path = dir.join(format!("{node_id}.json"));
    let record = serde_json::json!({
      "node_id": node_id,
      "address": address,
      "registered_at": armada_timestamp(),
    });
    write_atomic(&path, record.to_string().as_bytes()).await
  }

  /// Reads an image entry. A corrupt entry is an error the
  /// caller answers with a direct pull fallback.
  pub async fn read(
    &self,
    image: &str,
  ) -> anyhow::Result<Option<ImageEntry>> {
    let path = self.entry_path(image);
    let data = match tokio::fs::read(&path).await {
      Ok(data) => data,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Ok(None);
      }
      Err(e) => {
        return Err(e).with_context(|| {
          format!("failed to read {}", path.display())
        });
      }
    };
    serde_json::from_slice(&data).map(Some).with_context(|| {
      format!("corrupt tracker entry {}", path.display())
    })
  }

  /// Serialized read-modify-write of an image entry.
  pub async fn update(
    &self,
    image: &str,
    mutate: impl FnOnce(&mut ImageEntry),
  ) -> anyhow::Result<ImageEntry> {
    let dir = self.images_dir();
    tokio::fs::create_dir_all(&dir).await.with_context(|| {
      format!("failed to create {}", dir.display())
    })?;
    let path = self.entry_path(image);
    let _lock = FileLock::acquire(&path).await?;
    let mut entry = self
      .read(image)
      .await
      // Under the lock a corrupt entry is replaced outright.
      .unwrap_or_default()
      .unwrap_or_else(|| ImageEntry {
        image: image.to_string(),
        ..Default::default()
      });
    mutate(&mut entry);
    let data = serde_json::to_vec_pretty(&entry)
      .expect("image entry serializes");
    write_atomic(&path, &data).await?;
    Ok(entry)
  }

  /// Claims an origin download slot. The limit is the
  /// pool-wide concurrent source download bound.
  pub async fn try_claim_source(
    &self,
    image: &str,
    node_id: &str,
    limit: u32,
  ) -> anyhow::Result<bool> {
    let entry = self
      .update(image, |entry| {
        if entry.source_claims.len() < limit as usize
          && !entry
            .source_claims
            .iter()
            .any(|claim| claim == node_id)
        {
          entry.source_claims.push(node_id.to_string());
        }
      })
      .await?;
    Ok(
      entry
        .source_claims
        .iter()
        .any(|claim| claim == node_id),
    )
  }

  /// Releases an origin slot (pull finished or failed). A
  /// failed seed's slot is what a promoted follower reuses.
  pub async fn release_source(
    &self,
    image: &str,
    node_id: &str,
  ) -> anyhow::Result<()> {
    self
      .update(image, |entry| {
        entry.source_claims.retain(|claim| claim != node_id);
      })
      .await?;
    Ok(())
  }
}

async fn write_atomic(
  path: &Path,
  data: &[u8],
) -> anyhow::Result<()> {
  let tmp = path.with_extension("tmp");
  tokio::fs::write(&tmp, data).await.with_context(|| {
    format!("failed to write {}", tmp.display())
  })?;
  tokio::fs::rename(&tmp, path).await.with_context(|| {
    format!("failed to commit {}", path.display())
  })?;
  Ok(())
}

/// Exclusive lock file beside the entry. Stale locks (a peer
/// died mid update) are broken after [LOCK_STALE].
struct FileLock {
  path: PathBuf,
}

impl FileLock {
  async fn acquire(entry: &Path) -> anyhow::Result<FileLock> {
    let path = entry.with_extension("lock");
    loop {
      match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
      {
        Ok(_) => return Ok(FileLock { path }),
        Err(e)
          if e.kind() == std::io::ErrorKind::AlreadyExists =>
        {
          if let Ok(meta) = std::fs::metadata(&path)
            && let Ok(modified) = meta.modified()
            && modified.elapsed().unwrap_or_default()
              > LOCK_STALE
          {
            warn!(
              "breaking stale tracker lock {}",
              path.display()
            );
            let _ = std::fs::remove_file(&path);
            continue;
          }
          tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Err(e) => {
          return Err(e).with_context(|| {
            format!(
              "failed to acquire lock {}",
              path.display()
            )
          });
        }
      }
    }
  }
}

impl Drop for FileLock {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.path);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn entry_update_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Tracker::new(dir.path(), "pool-a");

    assert!(tracker.read("app:1").await.unwrap().is_none());
    tracker
      .update("app:1", |entry| {
        entry.chunk_hashes = vec!["h0".into(), "h1".into()];
        entry.holders.insert(
          "tvm-000000".to_string(),
          HolderRecord {
            address: "10.0.0.1:6881".into(),
            chunks: vec![0, 1],
            seed: true,
            active_uploads: 0,
            updated_at: armada_timestamp(),
          },
        );
      })
      .await
      .unwrap();

    let entry =
      tracker.read("app:1").await.unwrap().unwrap();
    assert_eq!(entry.chunk_count(), 2);
    assert_eq!(entry.holders_of(1), vec!["tvm-000000"]);
  }

  #[tokio::test]
  async fn source_claims_respect_limit() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Tracker::new(dir.path(), "pool-a");

    assert!(
      tracker
        .try_claim_source("app:1", "tvm-000000", 1)
        .await
        .unwrap()
    );
    assert!(
      !tracker
        .try_claim_source("app:1", "tvm-000001", 1)
        .await
        .unwrap()
    );
    // Releasing the slot lets a follower take over.
    tracker
      .release_source("app:1", "tvm-000000")
      .await
      .unwrap();
    assert!(
      tracker
        .try_claim_source("app:1", "tvm-000001", 1)
        .await
        .unwrap()
    );
  }

  #[tokio::test]
  async fn corrupt_entry_reads_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Tracker::new(dir.path(), "pool-a");
    let path = tracker.entry_path("app:1");
    tokio::fs::create_dir_all(path.parent().unwrap())
      .await
      .unwrap();
    tokio::fs::write(&path, b"{not json").await.unwrap();
    assert!(tracker.read("app:1").await.is_err());
  }
}
