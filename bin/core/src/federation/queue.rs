//! The durable federated action queue.
//!
//! Entries live under `fed-{fed}/queue/{group}/{seq}` where the
//! group is the `(job_id, unique_id)` partition fingerprint and
//! the zero padded sequence makes store listing order the FIFO
//! order. Status records live beside the queue and survive
//! entry removal, backing `fed actions list`.

use armada_client::{
  entities::{
    armada_timestamp,
    federation::{ActionRecord, ActionStatus, FederatedAction},
  },
  error::{EngineError, PlatformError},
};
use uuid::Uuid;

use crate::{
  platform::OpContext,
  storage::{ObjectStore, paths},
};

pub struct ActionQueue<'a, S> {
  store: &'a S,
  fed_id: &'a str,
}

/// A queue entry joined with its store path (the removal
/// handle).
#[derive(Debug, Clone)]
pub struct QueuedAction {
  pub path: String,
  pub action: FederatedAction,
}

impl<'a, S: ObjectStore> ActionQueue<'a, S> {
  pub fn new(store: &'a S, fed_id: &'a str) -> Self {
    ActionQueue { store, fed_id }
  }

  /// Appends the action to its group partition. The sequence
  /// slot is claimed with a create-only write, retrying on
  /// enqueue races.
  pub async fn enqueue(
    &self,
    ctx: &OpContext,
    action: &FederatedAction,
  ) -> Result<u64, EngineError> {
    let group = &action.target_group;
    loop {
      ctx.check("enqueue action")?;
      let existing = self
        .store
        .list(
          ctx,
          &format!(
            "{}/",
            paths::fed_queue_group(self.fed_id, group)
          ),
          &[],
          &[],
        )
        .await
        .map_err(EngineError::from)?;
      let sequence = existing
        .last()
        .and_then(|path| {
          path.rsplit('/').next()?.parse::<u64>().ok()
        })
        .map(|last| last + 1)
        .unwrap_or(0);
      let mut action = action.clone();
      action.sequence = sequence;
      action.enqueued_at = armada_timestamp();
      let path =
        paths::fed_queue_entry(self.fed_id, group, sequence);
      let data = serde_json::to_vec(&action)
        .expect("action serializes");
      match self
        .store
        .put_if_match(ctx, &path, &data, None)
        .await
      {
        Ok(_) => {
          self
            .write_status(
              ctx,
              &action,
              ActionStatus::Queued,
              None,
              None,
            )
            .await?;
          return Ok(sequence);
        }
        Err(PlatformError::Conflict(_)) => {
          // Lost the slot to a concurrent enqueue, re-list.
          continue;
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  /// All pending actions grouped by partition, FIFO within each
  /// group. Cross-group order is unspecified.
  pub async fn pending_groups(
    &self,
    ctx: &OpContext,
  ) -> Result<Vec<(String, Vec<QueuedAction>)>, EngineError> {
    let prefix =
      format!("{}/", paths::fed_queue(self.fed_id));
    let keys = self
      .store
      .list(ctx, &prefix, &[], &[])
      .await
      .map_err(EngineError::from)?;
    let mut groups: Vec<(String, Vec<QueuedAction>)> = Vec::new();
    for key in keys {
      let Some(group) = key
        .strip_prefix(&prefix)
        .and_then(|rest| rest.split('/').next())
      else {
        continue;
      };
      let Some((data, _etag)) = self
        .store
        .get(ctx, &key)
        .await
        .map_err(EngineError::from)?
      else {
        // Removed between list and get.
        continue;
      };
      let action: FederatedAction =
        match serde_json::from_slice(&data) {
          Ok(action) => action,
          Err(e) => {
            warn!("corrupt queue entry at {key}, skipping | {e}");
            continue;
          }
        };
      match groups.iter_mut().find(|(g, _)| g == group) {
        Some((_, actions)) => actions.push(QueuedAction {
          path: key,
          action,
        }),
        None => groups.push((
          group.to_string(),
          vec![QueuedAction {
            path: key,
            action,
          }],
        )),
      }
    }
    Ok(groups)
  }

  pub async fn remove(
    &self,
    ctx: &OpContext,
    entry: &QueuedAction,
  ) -> Result<(), EngineError> {
    self
      .store
      .delete(ctx, &entry.path)
      .await
      .map_err(EngineError::from)?;
    Ok(())
  }

  /// Unconditionally removes every queue entry carrying the
  /// unique id. No compensating action.
  pub async fn zap(
    &self,
    ctx: &OpContext,
    unique_id: Uuid,
  ) -> Result<usize, EngineError> {
    let groups = self.pending_groups(ctx).await?;
    let mut removed = 0;
    for (_group, actions) in groups {
      for entry in actions {
        if entry.action.unique_id == unique_id {
          self.remove(ctx, &entry).await?;
          removed += 1;
        }
      }
    }
    self
      .store
      .delete(
        ctx,
        &paths::fed_action(
          self.fed_id,
          &unique_id.to_string(),
        ),
      )
      .await
      .map_err(EngineError::from)?;
    Ok(removed)
  }

  pub async fn write_status(
    &self,
    ctx: &OpContext,
    action: &FederatedAction,
    status: ActionStatus,
    location: Option<String>,
    detail: Option<String>,
  ) -> Result<(), EngineError> {
    let record = ActionRecord {
      unique_id: action.unique_id,
      job_id: action.job_id.clone(),
      kind: action.kind.name().to_string(),
      status,
      location,
      detail,
      updated_at: armada_timestamp(),
    };
    let path = paths::fed_action(
      self.fed_id,
      &action.unique_id.to_string(),
    );
    self
      .store
      .put(
        ctx,
        &path,
        &serde_json::to_vec(&record)
          .expect("action record serializes"),
      )
      .await
      .map_err(EngineError::from)?;
    Ok(())
  }

  /// All status records, for `fed actions list`.
  pub async fn action_records(
    &self,
    ctx: &OpContext,
  ) -> Result<Vec<ActionRecord>, EngineError> {
    let prefix =
      format!("{}/", paths::fed_actions(self.fed_id));
    let keys = self
      .store
      .list(ctx, &prefix, &[], &[])
      .await
      .map_err(EngineError::from)?;
    let mut records = Vec::with_capacity(keys.len());
    for key in keys {
      if let Some((data, _)) = self
        .store
        .get(ctx, &key)
        .await
        .map_err(EngineError::from)?
        && let Ok(record) = serde_json::from_slice(&data)
      {
        records.push(record);
      }
    }
    Ok(records)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::dir::DirStore;
  use armada_client::entities::federation::ActionKind;

  fn action(
    job_id: &str,
    unique_id: Uuid,
    group: &str,
  ) -> FederatedAction {
    FederatedAction {
      sequence: 0,
      unique_id,
      kind: ActionKind::Terminate,
      job_id: job_id.to_string(),
      target_group: group.to_string(),
      enqueued_at: 0,
    }
  }

  #[tokio::test]
  async fn fifo_within_group() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let queue = ActionQueue::new(&store, "fed1");
    let ctx = OpContext::default();

    let id = Uuid::new_v4();
    for _ in 0..3 {
      queue
        .enqueue(&ctx, &action("job1", id, "group-a"))
        .await
        .unwrap();
    }
    let groups = queue.pending_groups(&ctx).await.unwrap();
    assert_eq!(groups.len(), 1);
    let (_, actions) = &groups[0];
    let sequences: Vec<u64> =
      actions.iter().map(|a| a.action.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
  }

  #[tokio::test]
  async fn zap_removes_matching_entries_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let queue = ActionQueue::new(&store, "fed1");
    let ctx = OpContext::default();

    let keep = Uuid::new_v4();
    let zap = Uuid::new_v4();
    queue
      .enqueue(&ctx, &action("job1", keep, "group-a"))
      .await
      .unwrap();
    queue
      .enqueue(&ctx, &action("job1", zap, "group-b"))
      .await
      .unwrap();

    let removed = queue.zap(&ctx, zap).await.unwrap();
    assert_eq!(removed, 1);
    let groups = queue.pending_groups(&ctx).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].1[0].action.unique_id, keep);
  }
}
