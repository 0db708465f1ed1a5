use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::entities::job::{Job, TaskDescriptor};

/// A set of pools, possibly spanning regions, treated as one
/// logical scheduling target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Federation {
  pub id: String,
  pub members: Vec<FederationPool>,
  /// Reject actions whose job id is already in flight anywhere
  /// in the federation. When off, colliding job ids are
  /// rewritten with a unique-id derived suffix instead.
  #[serde(default)]
  pub unique_job_ids: bool,
  /// Storage account binding holding the queue and metadata.
  pub storage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationPool {
  pub pool_id: String,
  pub account_service_url: String,
  pub region: String,
}

/// A queued unit of federation work. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedAction {
  /// Monotonic sequence within the `(job_id, unique_id)` group.
  pub sequence: u64,
  pub unique_id: Uuid,
  pub kind: ActionKind,
  pub job_id: String,
  /// Fingerprint partitioning the queue.
  pub target_group: String,
  #[serde(default)]
  pub enqueued_at: i64,
}

impl FederatedAction {
  /// Queue partition key. Actions in the same group are
  /// processed strictly FIFO.
  pub fn group_key(&self) -> String {
    format!("{}:{}", self.job_id, self.unique_id)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
  AddJob {
    job: Job,
    /// Expanded task descriptors, serialized at enqueue time.
    tasks: Vec<TaskDescriptor>,
    constraints: JobConstraints,
  },
  Terminate,
  Delete,
  /// Unconditionally remove the target action from the queue.
  Zap { target_unique_id: Uuid },
}

impl ActionKind {
  pub fn name(&self) -> &'static str {
    match self {
      ActionKind::AddJob { .. } => "add_job",
      ActionKind::Terminate => "terminate",
      ActionKind::Delete => "delete",
      ActionKind::Zap { .. } => "zap",
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
  #[default]
  Queued,
  Running,
  Blocked,
  Failed,
  Succeeded,
}

/// Per-action status surfaced through `fed actions list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
  pub unique_id: Uuid,
  pub job_id: String,
  pub kind: String,
  pub status: ActionStatus,
  /// Pool the action landed on, once submitted.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
  pub updated_at: i64,
}

/// Constraint predicates evaluated over `(pool, pool state)`
/// during federated pool selection.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct JobConstraints {
  pub autoscale: AllowExclusive,
  pub low_priority_nodes: AllowExclusive,
  /// Require (or forbid) native container mode pools.
  pub native: Option<bool>,
  /// Require (or forbid) Windows pools.
  pub windows: Option<bool>,
  /// Require an exact pool region.
  pub location: Option<String>,
  pub container_registries: RegistryConstraint,
  pub max_active_task_backlog: Option<BacklogConstraint>,
  /// Exact custom image resource id match.
  pub custom_image_arm_id: Option<String>,
  /// Exact virtual network resource id match.
  pub virtual_network_arm_id: Option<String>,
  /// Exact VM size match.
  pub vm_size: Option<String>,
  pub cores: Option<ResourceConstraint>,
  /// Memory amount in GB.
  pub memory: Option<ResourceConstraint>,
  /// Force single-task-per-node behavior on the selected pool.
  pub exclusive: bool,
  pub gpu: Option<bool>,
  pub infiniband: Option<bool>,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AllowExclusive {
  /// No preference.
  #[default]
  Allow,
  /// Only pools with the property.
  Exclusive,
  /// Only pools without the property.
  Deny,
}

#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct RegistryConstraint {
  /// Require a private login for the public hub.
  pub private_docker_hub: bool,
  /// Registries that must be available on the pool.
  pub public: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacklogConstraint {
  /// Maximum `active_tasks / schedulable_slots` ratio.
  pub ratio: f64,
  /// Steady autoscale pools with zero schedulable slots bypass
  /// the ratio exclusion.
  #[serde(default)]
  pub autoscale_exempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraint {
  /// Minimum amount the pool VM must provide.
  pub amount: f64,
  /// Upper bound variance: the VM must not exceed
  /// `amount * (1 + variance)`. None disables the upper bound.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub schedulable_variance: Option<f64>,
}

impl ResourceConstraint {
  pub fn admits(&self, actual: f64) -> bool {
    if actual < self.amount {
      return false;
    }
    match self.schedulable_variance {
      Some(variance) => {
        actual <= self.amount * (1.0 + variance)
      }
      None => true,
    }
  }
}

/// Allocation activity of a pool as reported by the platform.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
  #[default]
  Steady,
  Resizing,
  Stopping,
}

/// Observed state of a member pool, the second half of the
/// constraint predicate input.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct PoolSnapshot {
  pub pool_id: String,
  pub location: String,
  pub vm_size: String,
  pub cores_per_node: f64,
  pub memory_gb_per_node: f64,
  pub idle_nodes: u32,
  pub running_nodes: u32,
  pub low_priority_nodes: u32,
  pub active_tasks: u64,
  pub max_tasks_per_node: u32,
  pub autoscale: bool,
  pub allocation_state: AllocationState,
  pub native: bool,
  pub windows: bool,
  pub gpu: bool,
  pub infiniband: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub custom_image_arm_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub virtual_network_arm_id: Option<String>,
  /// Registry domains with logins available on the pool.
  #[serde(default)]
  pub registries: Vec<String>,
  #[serde(default)]
  pub private_docker_hub_login: bool,
  /// Remaining node quota on the hosting account.
  #[serde(default)]
  pub remaining_quota: i64,
}

impl PoolSnapshot {
  /// `(idle + running) * max_tasks_per_node`, with the autoscale
  /// best-effort exception: a non-steady autoscale pool with no
  /// capacity counts as one slot.
  pub fn schedulable_slots(&self) -> u64 {
    let slots = (self.idle_nodes + self.running_nodes) as u64
      * self.max_tasks_per_node as u64;
    if slots == 0
      && self.autoscale
      && self.allocation_state != AllocationState::Steady
    {
      1
    } else {
      slots
    }
  }

  /// Backlog ratio used for ranking. Autoscale pools rank with
  /// at least one slot so an empty steady pool is best-effort
  /// preferred rather than division-by-zero excluded.
  pub fn backlog_ratio(&self) -> f64 {
    let slots = self.schedulable_slots();
    let slots = if slots == 0 && self.autoscale {
      1
    } else {
      slots
    };
    if slots == 0 {
      f64::INFINITY
    } else {
      self.active_tasks as f64 / slots as f64
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn steady_autoscale_pool_with_no_nodes_has_zero_slots() {
    let pool = PoolSnapshot {
      autoscale: true,
      allocation_state: AllocationState::Steady,
      max_tasks_per_node: 4,
      ..Default::default()
    };
    assert_eq!(pool.schedulable_slots(), 0);
  }

  #[test]
  fn resizing_autoscale_pool_counts_one_slot() {
    let pool = PoolSnapshot {
      autoscale: true,
      allocation_state: AllocationState::Resizing,
      max_tasks_per_node: 4,
      ..Default::default()
    };
    assert_eq!(pool.schedulable_slots(), 1);
  }

  #[test]
  fn resource_constraint_upper_bound() {
    let constraint = ResourceConstraint {
      amount: 3.0,
      schedulable_variance: Some(0.5),
    };
    assert!(!constraint.admits(2.0));
    assert!(constraint.admits(4.0));
    assert!(!constraint.admits(5.0));
  }
}
