use serde::{Deserialize, Serialize};
use strum::Display;

use crate::entities::{
  Environment, ResourceFile,
  data::{IngressUnit, VolumeMount},
};

/// Declarative specification of a homogeneous pool of compute nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
  /// Platform-unique pool id.
  pub id: String,
  /// Source of the node OS image.
  pub vm_image: VmImage,
  /// Platform VM size identifier, eg "standard_d2s_v3".
  pub vm_size: String,
  /// Target number of dedicated nodes.
  #[serde(default)]
  pub target_dedicated: u32,
  /// Target number of preemptible (low priority) nodes.
  #[serde(default)]
  pub target_preemptible: u32,
  /// Maximum concurrently scheduled tasks per node.
  #[serde(default = "default_max_tasks_per_node")]
  pub max_tasks_per_node: u32,
  /// Enable the platform inter-node communication fabric.
  /// Requires a single node class (dedicated xor preemptible).
  #[serde(default)]
  pub inter_node_communication: bool,
  /// Optional subnet resource reference to join.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subnet_id: Option<String>,
  /// Optional accelerator configuration.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accelerator: Option<AcceleratorSpec>,
  /// Container images that must be present on every node
  /// before the pool is considered ready. Order is the
  /// fetch order for the replicator.
  #[serde(default)]
  pub preload_images: Vec<String>,
  /// Volumes mounted on every node.
  #[serde(default)]
  pub volumes: Vec<VolumeMount>,
  /// Ingress performed once per node during pool start task.
  #[serde(default)]
  pub ingress: Vec<IngressUnit>,
  /// Additional start task configuration.
  #[serde(default)]
  pub start_task: StartTaskSpec,
  /// Run containers through the platform-native container
  /// runtime instead of the Armada task wrapper. Waives the
  /// image preload barrier and precludes task-level ingress.
  #[serde(default)]
  pub native: bool,
  /// Whether nodes run Windows. Only consulted by federation
  /// constraint matching.
  #[serde(default)]
  pub windows: bool,
  /// Pool behavior policies.
  #[serde(default)]
  pub policies: PoolPolicies,
}

fn default_max_tasks_per_node() -> u32 {
  1
}

impl PoolSpec {
  /// Structural invariants that cannot be encoded in the types.
  pub fn validate(&self) -> Result<(), crate::error::EngineError> {
    let fail = |path: &str, message: String| {
      Err(crate::error::EngineError::Validation {
        path: format!("pool.{path}"),
        message,
      })
    };
    if self.id.is_empty() {
      return fail("id", "pool id must not be empty".into());
    }
    validations::platform_id(&self.id).map_err(|e| {
      crate::error::EngineError::Validation {
        path: "pool.id".into(),
        message: format!("{e:#}"),
      }
    })?;
    if self.inter_node_communication
      && self.target_dedicated > 0
      && self.target_preemptible > 0
    {
      return fail(
        "inter_node_communication",
        "inter-node communication requires dedicated or preemptible nodes, not both".into(),
      );
    }
    if self.max_tasks_per_node == 0 {
      return fail(
        "max_tasks_per_node",
        "max_tasks_per_node must be at least 1".into(),
      );
    }
    if self.policies.transfer_files_on_pool_creation
      && self.policies.block_until_all_global_resources_loaded
      && self
        .ingress
        .iter()
        .any(|unit| unit.targets_shared_volume())
    {
      return fail(
        "policies",
        "transfer_files_on_pool_creation cannot be combined with the global resource barrier when ingress targets a shared volume".into(),
      );
    }
    Ok(())
  }

  /// Total nodes this pool converges towards.
  pub fn target_nodes(&self) -> u32 {
    self.target_dedicated + self.target_preemptible
  }
}

/// Node OS image source. Exactly one variant, enforcing the
/// platform-image xor custom-image invariant structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmImage {
  Platform {
    publisher: String,
    offer: String,
    sku: String,
    #[serde(default = "default_image_version")]
    version: String,
  },
  Custom {
    /// Full resource id of the custom image.
    image_id: String,
  },
}

fn default_image_version() -> String {
  String::from("latest")
}

#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct AcceleratorSpec {
  /// Url of the GPU driver package installed during start task.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gpu_driver_url: Option<String>,
  /// Enable infiniband / RDMA.
  #[serde(default)]
  pub infiniband: bool,
}

impl AcceleratorSpec {
  pub fn gpu(&self) -> bool {
    self.gpu_driver_url.is_some()
  }
}

#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(default)]
pub struct StartTaskSpec {
  /// Script run on each node before it can accept tasks.
  pub script: String,
  /// Files retrieved onto the node before the script runs.
  pub resource_files: Vec<ResourceFile>,
  /// Extra start task environment.
  pub environment: Environment,
  /// Optional node admin user provisioned during start task.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub admin_user: Option<NodeAdminUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAdminUser {
  pub name: String,
  /// Public key installed for the user.
  pub ssh_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolPolicies {
  /// Attempt a single reboot when a node enters start_task_failed.
  pub reboot_on_start_task_failed: bool,
  /// Delete unusable nodes and let the platform replenish them,
  /// up to a bounded retry budget.
  pub attempt_recovery_on_unusable: bool,
  /// Hold nodes from idle until every preload image and shared
  /// volume is verified present.
  pub block_until_all_global_resources_loaded: bool,
  /// Interleave local-to-object-storage transfers with allocation.
  pub transfer_files_on_pool_creation: bool,
  /// How to pick victims when resizing down.
  pub resize_down: ResizeDownPolicy,
  /// Bounded number of unusable-node recovery attempts.
  pub unusable_recovery_budget: u32,
}

impl Default for PoolPolicies {
  fn default() -> Self {
    PoolPolicies {
      reboot_on_start_task_failed: true,
      attempt_recovery_on_unusable: false,
      block_until_all_global_resources_loaded: true,
      transfer_files_on_pool_creation: false,
      resize_down: ResizeDownPolicy::default(),
      unusable_recovery_budget: 3,
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
pub enum ResizeDownPolicy {
  /// Wait for running tasks to complete before removing a node.
  #[default]
  TaskCompletion,
  /// Requeue running tasks elsewhere.
  Requeue,
  /// Terminate running tasks.
  Terminate,
  /// Terminate, but retain task data on the node disks.
  RetainedData,
}

/// Pool level lifecycle states.
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
pub enum PoolState {
  #[default]
  Absent,
  Allocating,
  Preparing,
  Ready,
  Resizing,
  Deleting,
}

/// Per-node observable states.
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
pub enum NodeState {
  #[default]
  Creating,
  Starting,
  WaitingForStartTask,
  StartTaskFailed,
  Idle,
  Running,
  Unusable,
  Preempted,
  Deallocated,
}

impl NodeState {
  /// Nodes counted as transient in the node-count invariant.
  pub fn transient(&self) -> bool {
    matches!(self, NodeState::Creating | NodeState::Starting)
  }

  pub fn terminal(&self) -> bool {
    matches!(self, NodeState::Deallocated)
  }
}

/// One compute instance inside a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id: String,
  pub state: NodeState,
  pub dedicated: bool,
  /// Exit code of the start task, recorded once it runs.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_task_exit_code: Option<i32>,
  /// Start task stdout, retrieved on failure.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_task_stdout: Option<String>,
  /// Start task stderr, retrieved on failure.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_task_stderr: Option<String>,
  /// Images verified present on this node.
  #[serde(default)]
  pub images_present: Vec<String>,
  /// Reachable peer address inside the pool subnet.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base_pool() -> PoolSpec {
    PoolSpec {
      id: "pool-a".to_string(),
      vm_image: VmImage::Platform {
        publisher: "canonical".into(),
        offer: "ubuntu".into(),
        sku: "24-04-lts".into(),
        version: "latest".into(),
      },
      vm_size: "standard_d2s_v3".into(),
      target_dedicated: 2,
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
    }
  }

  #[test]
  fn inter_node_comm_requires_single_node_class() {
    let mut pool = base_pool();
    pool.inter_node_communication = true;
    pool.target_preemptible = 1;
    assert!(pool.validate().is_err());
    pool.target_preemptible = 0;
    assert!(pool.validate().is_ok());
  }

  #[test]
  fn node_transient_states() {
    assert!(NodeState::Creating.transient());
    assert!(NodeState::Starting.transient());
    assert!(!NodeState::Idle.transient());
    assert!(NodeState::Deallocated.terminal());
  }
}
