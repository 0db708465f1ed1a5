use serde::{Deserialize, Serialize};
use strum::Display;

/// A volume made available to task containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMount {
  /// Host bind mount on the node.
  DataVolume {
    /// Mount alias referenced from task descriptors.
    alias: String,
    host_path: String,
    container_path: String,
  },
  /// Named filesystem driver shared across nodes.
  SharedDataVolume {
    alias: String,
    driver: SharedVolumeDriver,
    container_path: String,
  },
}

impl VolumeMount {
  pub fn alias(&self) -> &str {
    match self {
      VolumeMount::DataVolume { alias, .. } => alias,
      VolumeMount::SharedDataVolume { alias, .. } => alias,
    }
  }

  /// Canonical fields hashed into the mount alias fingerprint.
  pub fn fingerprint_parts(&self) -> (String, String, String) {
    match self {
      VolumeMount::DataVolume {
        host_path,
        container_path,
        ..
      } => (
        "bind".to_string(),
        host_path.clone(),
        container_path.clone(),
      ),
      VolumeMount::SharedDataVolume {
        driver,
        container_path,
        ..
      } => (
        driver.kind().to_string(),
        driver.target(),
        container_path.clone(),
      ),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedVolumeDriver {
  /// Object-storage backed file share.
  StorageShare {
    account: String,
    share: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<String>,
  },
  /// Externally provisioned network filesystem. The mount spec
  /// is produced by the remote-fs subsystem and consumed opaque.
  NetworkFs { mount_spec: String },
  /// Distributed filesystem co-located on the compute nodes.
  DistributedFs {
    volume_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<String>,
  },
}

impl SharedVolumeDriver {
  pub fn kind(&self) -> &'static str {
    match self {
      SharedVolumeDriver::StorageShare { .. } => "storage_share",
      SharedVolumeDriver::NetworkFs { .. } => "network_fs",
      SharedVolumeDriver::DistributedFs { .. } => "distributed_fs",
    }
  }

  pub fn target(&self) -> String {
    match self {
      SharedVolumeDriver::StorageShare { account, share, .. } => {
        format!("{account}/{share}")
      }
      SharedVolumeDriver::NetworkFs { mount_spec } => {
        mount_spec.clone()
      }
      SharedVolumeDriver::DistributedFs { volume_type, .. } => {
        volume_type.clone()
      }
    }
  }
}

/// One unit of inbound data movement. Scope is positional:
/// pool specs, jobs, and task descriptors each carry their own
/// ingress lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressUnit {
  pub source: IngressSource,
  /// Destination path on the node. Defaults to the task working
  /// directory for task scope.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub destination: Option<String>,
  /// Extra options passed through to the transfer driver.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub extra_options: Option<String>,
}

impl IngressUnit {
  pub fn targets_shared_volume(&self) -> bool {
    matches!(self.source, IngressSource::LocalToShared { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressSource {
  /// Download from object storage.
  ObjectStorage {
    /// Storage account binding name.
    account: String,
    /// `container/prefix` style remote path.
    remote_path: String,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
  },
  /// Outputs of a previously completed task.
  TaskOutput {
    job_id: String,
    task_id: String,
    #[serde(default)]
    include: Vec<String>,
  },
  /// Client-local files fanned out to a shared volume
  /// over one of the secure transports.
  LocalToShared {
    local_path: String,
    /// Alias of the shared volume to land in.
    volume: String,
    transport: FanoutTransport,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
  },
}

/// Transport used for on-premises to cluster fan-out.
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
#[serde(rename_all = "snake_case")]
pub enum FanoutTransport {
  /// Secure copy through a single node.
  #[default]
  Scp,
  /// Secure copy to every node.
  MultinodeScp,
  /// rsync over secure shell through a single node.
  RsyncSsh,
  /// rsync over secure shell to every node.
  MultinodeRsyncSsh,
}

impl FanoutTransport {
  pub fn multinode(&self) -> bool {
    matches!(
      self,
      FanoutTransport::MultinodeScp
        | FanoutTransport::MultinodeRsyncSsh
    )
  }
}

/// One unit of outbound data movement, run only after the owning
/// task succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressUnit {
  /// Storage account binding name.
  pub account: String,
  /// `container/prefix` destination in object storage.
  pub remote_path: String,
  /// Node-relative source path. Defaults to the task working dir.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  #[serde(default)]
  pub include: Vec<String>,
  #[serde(default)]
  pub exclude: Vec<String>,
}
