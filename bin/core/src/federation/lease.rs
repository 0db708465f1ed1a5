//! Leader election through a lease record in metadata storage.
//!
//! One record per federation at `fed-{fed}/leases/leader`,
//! mutated only with etag if-match writes: acquiring means
//! creating the record or taking over an expired one, holding
//! means renewing before half-TTL. A failed renewal cancels the
//! leadership token and the proxy stops dequeueing immediately,
//! so lease expiry strictly precedes the next leader's first
//! dequeue.

use std::{sync::Arc, time::Duration};

use armada_client::{
  entities::armada_timestamp,
  error::{EngineError, PlatformError},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
  platform::OpContext,
  storage::{ObjectStore, paths},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
  holder: String,
  expires_at: i64,
}

pub struct LeaseKeeper<S> {
  store: Arc<S>,
  fed_id: String,
  /// Identity of this proxy instance.
  pub holder: String,
  ttl: Duration,
}

/// Held leadership. `lost` fires as soon as renewal fails or
/// the keeper observes another holder; all processing must
/// check it before dequeueing.
pub struct Leadership {
  pub lost: CancellationToken,
  renewal: tokio::task::JoinHandle<()>,
}

impl Leadership {
  pub fn is_lost(&self) -> bool {
    self.lost.is_cancelled()
  }

  pub async fn resign(self) {
    self.lost.cancel();
    self.renewal.abort();
    let _ = self.renewal.await;
  }
}

impl<S: ObjectStore> LeaseKeeper<S> {
  pub fn new(
    store: Arc<S>,
    fed_id: impl Into<String>,
    ttl: Duration,
  ) -> Self {
    LeaseKeeper {
      store,
      fed_id: fed_id.into(),
      holder: uuid::Uuid::new_v4().to_string(),
      ttl,
    }
  }

  fn path(&self) -> String {
    paths::fed_leader_lease(&self.fed_id)
  }

  /// One acquisition attempt. Returns leadership with a
  /// background renewal task on success, None when another
  /// holder's lease is live.
  pub async fn try_acquire(
    &self,
    ctx: &OpContext,
  ) -> Result<Option<Leadership>, EngineError> {
    let path = self.path();
    let now = armada_timestamp();
    let record = LeaseRecord {
      holder: self.holder.clone(),
      expires_at: now + self.ttl.as_millis() as i64,
    };
    let data =
      serde_json::to_vec(&record).expect("lease serializes");

    let current =
      self.store.get(ctx, &path).await.map_err(EngineError::from)?;
    let acquired = match current {
      None => {
        match self
          .store
          .put_if_match(ctx, &path, &data, None)
          .await
        {
          Ok(_) => true,
          Err(PlatformError::Conflict(_)) => false,
          Err(e) => return Err(e.into()),
        }
      }
      Some((existing, etag)) => {
        let existing: LeaseRecord =
          serde_json::from_slice(&existing).unwrap_or(
            // A corrupt lease is treated as expired.
            LeaseRecord {
              holder: String::new(),
              expires_at: 0,
            },
          );
        if existing.holder != self.holder
          && existing.expires_at > now
        {
          false
        } else {
          match self
            .store
            .put_if_match(ctx, &path, &data, Some(&etag))
            .await
          {
            Ok(_) => true,
            Err(PlatformError::Conflict(_)) => false,
            Err(e) => return Err(e.into()),
          }
        }
      }
    };

    if !acquired {
      return Ok(None);
    }
    info!(
      "acquired federation {} leadership as {}",
      self.fed_id, self.holder
    );
    Ok(Some(self.spawn_renewal()))
  }

  fn spawn_renewal(&self) -> Leadership {
    let lost = CancellationToken::new();
    let token = lost.clone();
    let store = self.store.clone();
    let path = self.path();
    let holder = self.holder.clone();
    let ttl = self.ttl;
    let renewal = tokio::spawn(async move {
      // Renew comfortably before half-TTL.
      let interval = ttl / 3;
      loop {
        tokio::select! {
          _ = tokio::time::sleep(interval) => {}
          _ = token.cancelled() => return,
        }
        let ctx = OpContext::default();
        let renewed =
          renew(&*store, &ctx, &path, &holder, ttl).await;
        if !renewed {
          warn!("leadership renewal failed, stopping processing");
          token.cancel();
          return;
        }
      }
    });
    Leadership { lost, renewal }
  }
}

async fn renew(
  store: &impl ObjectStore,
  ctx: &OpContext,
  path: &str,
  holder: &str,
  ttl: Duration,
) -> bool {
  let current = match store.get(ctx, path).await {
    Ok(Some(current)) => current,
    _ => return false,
  };
  let (data, etag) = current;
  let record: LeaseRecord = match serde_json::from_slice(&data) {
    Ok(record) => record,
    Err(_) => return false,
  };
  if record.holder != holder {
    return false;
  }
  let renewed = LeaseRecord {
    holder: holder.to_string(),
    expires_at: armada_timestamp() + ttl.as_millis() as i64,
  };
  let data =
    serde_json::to_vec(&renewed).expect("lease serializes");
  store
    .put_if_match(ctx, path, &data, Some(&etag))
    .await
    .is_ok()
}
