//! Local-directory object store. Backs tests and single-host
//! deployments; cloud object storage bindings implement the
//! same trait out of tree.
//!
//! Etags are content hashes. Conditional writes are atomic
//! within one process (a store-wide async mutex), which is the
//! scope the dev adapter aims for.

use std::path::{Path, PathBuf};

use anyhow::Context;
use armada_client::error::PlatformError;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
  platform::OpContext,
  storage::{ObjectStore, SasPerms, globs_admit},
};

pub struct DirStore {
  root: PathBuf,
  write_lock: Mutex<()>,
}

impl DirStore {
  pub fn new(root: impl Into<PathBuf>) -> DirStore {
    DirStore {
      root: root.into(),
      write_lock: Mutex::new(()),
    }
  }

  fn resolve(&self, path: &str) -> Result<PathBuf, PlatformError> {
    if path.is_empty()
      || path.starts_with('/')
      || path.split('/').any(|part| part == "..")
    {
      return Err(PlatformError::NotFound(format!(
        "invalid store path {path}"
      )));
    }
    Ok(self.root.join(path))
  }

  async fn read(
    &self,
    file: &Path,
  ) -> anyhow::Result<Option<Vec<u8>>> {
    match tokio::fs::read(file).await {
      Ok(data) => Ok(Some(data)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Ok(None)
      }
      Err(e) => Err(e).with_context(|| {
        format!("failed to read {}", file.display())
      }),
    }
  }

  async fn write_atomic(
    &self,
    file: &Path,
    data: &[u8],
  ) -> anyhow::Result<()> {
    let parent = file
      .parent()
      .context("store path has no parent directory")?;
    tokio::fs::create_dir_all(parent).await.with_context(|| {
      format!("failed to create {}", parent.display())
    })?;
    let tmp = file.with_extension("tmp-write");
    tokio::fs::write(&tmp, data).await.with_context(|| {
      format!("failed to write {}", tmp.display())
    })?;
    tokio::fs::rename(&tmp, file).await.with_context(|| {
      format!("failed to commit {}", file.display())
    })?;
    Ok(())
  }
}

fn etag(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(&hasher.finalize()[..16])
}

fn transient(e: anyhow::Error) -> PlatformError {
  PlatformError::Transient(format!("{e:#}"))
}

impl ObjectStore for DirStore {
  async fn put(
    &self,
    _ctx: &OpContext,
    path: &str,
    data: &[u8],
  ) -> Result<String, PlatformError> {
    let file = self.resolve(path)?;
    let _guard = self.write_lock.lock().await;
    self.write_atomic(&file, data).await.map_err(transient)?;
    Ok(etag(data))
  }

  async fn put_if_match(
    &self,
    _ctx: &OpContext,
    path: &str,
    data: &[u8],
    expected: Option<&str>,
  ) -> Result<String, PlatformError> {
    let file = self.resolve(path)?;
    let _guard = self.write_lock.lock().await;
    let current = self
      .read(&file)
      .await
      .map_err(transient)?
      .map(|data| etag(&data));
    match (expected, current) {
      (None, Some(_)) => {
        return Err(PlatformError::Conflict(format!(
          "{path} already exists"
        )));
      }
      (Some(_), None) => {
        return Err(PlatformError::NotFound(format!(
          "{path} is gone"
        )));
      }
      (Some(expected), Some(current)) if expected != current => {
        return Err(PlatformError::Conflict(format!(
          "{path} etag mismatch"
        )));
      }
      _ => {}
    }
    self.write_atomic(&file, data).await.map_err(transient)?;
    Ok(etag(data))
  }

  async fn get(
    &self,
    _ctx: &OpContext,
    path: &str,
  ) -> Result<Option<(Vec<u8>, String)>, PlatformError> {
    let file = self.resolve(path)?;
    let data = self.read(&file).await.map_err(transient)?;
    Ok(data.map(|data| {
      let tag = etag(&data);
      (data, tag)
    }))
  }

  async fn delete(
    &self,
    _ctx: &OpContext,
    path: &str,
  ) -> Result<bool, PlatformError> {
    let file = self.resolve(path)?;
    let _guard = self.write_lock.lock().await;
    match tokio::fs::remove_file(&file).await {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Ok(false)
      }
      Err(e) => Err(PlatformError::Transient(format!(
        "failed to delete {path} | {e}"
      ))),
    }
  }

  async fn list(
    &self,
    _ctx: &OpContext,
    prefix: &str,
    include: &[String],
    exclude: &[String],
  ) -> Result<Vec<String>, PlatformError> {
    let mut keys = Vec::new();
    let mut stack = vec![self.root.clone()];
    while let Some(dir) = stack.pop() {
      let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
          continue;
        }
        Err(e) => {
          return Err(PlatformError::Transient(format!(
            "failed to list {} | {e}",
            dir.display()
          )));
        }
      };
      while let Some(entry) =
        entries.next_entry().await.map_err(|e| {
          PlatformError::Transient(format!("list failed | {e}"))
        })?
      {
        let path = entry.path();
        if path.is_dir() {
          stack.push(path);
          continue;
        }
        let Ok(relative) = path.strip_prefix(&self.root) else {
          continue;
        };
        let key = relative.to_string_lossy().replace('\\', "/");
        if key.ends_with(".tmp-write") {
          continue;
        }
        if !key.starts_with(prefix) {
          continue;
        }
        if globs_admit(&key, include, exclude) {
          keys.push(key);
        }
      }
    }
    keys.sort();
    Ok(keys)
  }

  async fn sas_for(
    &self,
    _ctx: &OpContext,
    path: &str,
    perms: SasPerms,
    ttl_secs: u64,
  ) -> Result<String, PlatformError> {
    let file = self.resolve(path)?;
    let expiry = armada_client::entities::armada_timestamp()
      + (ttl_secs as i64) * 1000;
    Ok(format!(
      "file://{}?perms={}&exp={expiry}",
      file.display(),
      perms.as_str()
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> (tempfile::TempDir, DirStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    (dir, store)
  }

  #[tokio::test]
  async fn put_get_roundtrip_with_etag() {
    let (_dir, store) = store();
    let ctx = OpContext::default();
    let tag = store.put(&ctx, "a/b", b"hello").await.unwrap();
    let (data, read_tag) =
      store.get(&ctx, "a/b").await.unwrap().unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(tag, read_tag);
  }

  #[tokio::test]
  async fn conditional_writes() {
    let (_dir, store) = store();
    let ctx = OpContext::default();
    // Create-only succeeds once.
    let tag = store
      .put_if_match(&ctx, "lease", b"v1", None)
      .await
      .unwrap();
    assert!(matches!(
      store.put_if_match(&ctx, "lease", b"v2", None).await,
      Err(PlatformError::Conflict(_))
    ));
    // If-match succeeds with the right etag, conflicts after.
    let tag2 = store
      .put_if_match(&ctx, "lease", b"v2", Some(&tag))
      .await
      .unwrap();
    assert!(matches!(
      store.put_if_match(&ctx, "lease", b"v3", Some(&tag)).await,
      Err(PlatformError::Conflict(_))
    ));
    store
      .put_if_match(&ctx, "lease", b"v3", Some(&tag2))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn list_is_sorted_and_glob_filtered() {
    let (_dir, store) = store();
    let ctx = OpContext::default();
    store.put(&ctx, "q/g1/002", b"b").await.unwrap();
    store.put(&ctx, "q/g1/001", b"a").await.unwrap();
    store.put(&ctx, "q/g2/001", b"c").await.unwrap();
    let keys =
      store.list(&ctx, "q/g1/", &[], &[]).await.unwrap();
    assert_eq!(keys, vec!["q/g1/001", "q/g1/002"]);
    let all = store
      .list(&ctx, "q/", &["q/*/001".to_string()], &[])
      .await
      .unwrap();
    assert_eq!(all, vec!["q/g1/001", "q/g2/001"]);
  }

  #[tokio::test]
  async fn invalid_paths_rejected() {
    let (_dir, store) = store();
    let ctx = OpContext::default();
    assert!(store.put(&ctx, "../escape", b"x").await.is_err());
    assert!(store.put(&ctx, "/abs", b"x").await.is_err());
  }
}
