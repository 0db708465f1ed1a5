use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::entities::{
  Environment, ResourceFile,
  data::{EgressUnit, IngressUnit},
  factory::TaskFactory,
  image::ImageRef,
};

/// A job owns an ordered set of task descriptors and targets
/// either a concrete pool or a federation. The two targets are
/// mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub target: JobTarget,
  /// Environment applied to every task, overridable per task.
  #[serde(default)]
  pub environment: Environment,
  /// Default retry budget for tasks that do not set their own.
  #[serde(default)]
  pub max_task_retries: i32,
  /// Complete the job when its last task reaches a terminal
  /// state.
  #[serde(default)]
  pub auto_complete: bool,
  /// Ingress shared by every task of the job, deduplicated per
  /// `(job, node)` pair.
  #[serde(default)]
  pub ingress: Vec<IngressUnit>,
  pub tasks: Vec<TaskDescriptor>,
  /// Constraints consulted only when targeting a federation.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub constraints:
    Option<crate::entities::federation::JobConstraints>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTarget {
  Pool(String),
  Federation(String),
}

impl Job {
  pub fn validate(&self) -> Result<(), crate::error::EngineError> {
    let fail = |path: String, message: String| {
      Err(crate::error::EngineError::Validation { path, message })
    };
    validations::platform_id(&self.id).map_err(|e| {
      crate::error::EngineError::Validation {
        path: format!("job.{}.id", self.id),
        message: format!("{e:#}"),
      }
    })?;
    let factories = self
      .tasks
      .iter()
      .filter(|task| task.factory.is_some())
      .count();
    if factories > 1 {
      return fail(
        format!("job.{}.tasks", self.id),
        format!(
          "at most one task may carry a factory, found {factories}"
        ),
      );
    }
    if self.constraints.is_some()
      && matches!(self.target, JobTarget::Pool(_))
    {
      return fail(
        format!("job.{}.constraints", self.id),
        "constraints only apply to federation targets".into(),
      );
    }
    for task in &self.tasks {
      task.validate(&self.id)?;
    }
    Ok(())
  }
}

/// Immutable description of a single container invocation.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize, Builder,
)]
#[builder(default, setter(into))]
pub struct TaskDescriptor {
  /// Explicit id. Unset tasks receive `dockertask-NNNNN`
  /// auto names during graph compilation.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub image: ImageRef,
  /// Command template. Positional placeholders are bound
  /// during factory expansion.
  pub command: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entrypoint: Option<String>,
  #[serde(default)]
  pub environment: Environment,
  /// Container ports exposed on the node.
  #[serde(default)]
  pub ports: Vec<PortExposure>,
  /// Aliases of volume mounts from the pool spec.
  #[serde(default)]
  pub volume_aliases: Vec<String>,
  #[serde(default)]
  pub resource_files: Vec<ResourceFile>,
  /// Task-scope ingress, run before each instance.
  #[serde(default)]
  pub input_data: Vec<IngressUnit>,
  /// Egress, run only after the task succeeds.
  #[serde(default)]
  pub output_data: Vec<EgressUnit>,
  /// Raw options appended to the container invocation.
  #[serde(default)]
  pub run_options: Vec<String>,
  #[serde(default)]
  pub remove_after_exit: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shm_size: Option<String>,
  #[serde(default)]
  pub infiniband: bool,
  #[serde(default)]
  pub gpu: bool,
  /// Requires the whole node (max_tasks_per_node behavior of 1).
  #[serde(default)]
  pub exclusive: bool,
  /// Retention window for task artifacts, in seconds.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retention_time: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_task_retries: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub multi_instance: Option<MultiInstanceSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_identity: Option<UserIdentity>,
  /// Explicit predecessor task ids.
  #[serde(default)]
  pub depends_on: Vec<String>,
  /// Inclusive range of numerically named predecessors.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub depends_on_range: Option<(u64, u64)>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub factory: Option<TaskFactory>,
}

impl TaskDescriptor {
  pub fn validate(
    &self,
    job_id: &str,
  ) -> Result<(), crate::error::EngineError> {
    let path = |field: &str| {
      format!(
        "job.{job_id}.task.{}.{field}",
        self.id.as_deref().unwrap_or("<auto>")
      )
    };
    if let Some(id) = &self.id {
      validations::platform_id(id).map_err(|e| {
        crate::error::EngineError::Validation {
          path: path("id"),
          message: format!("{e:#}"),
        }
      })?;
    }
    if self.command.is_empty() {
      return Err(crate::error::EngineError::Validation {
        path: path("command"),
        message: "command must not be empty".into(),
      });
    }
    if let Some((from, to)) = self.depends_on_range
      && from > to
    {
      return Err(crate::error::EngineError::Validation {
        path: path("depends_on_range"),
        message: format!("range [{from},{to}] is inverted"),
      });
    }
    if let Some(multi) = &self.multi_instance {
      if multi.instances < 2 {
        return Err(crate::error::EngineError::Validation {
          path: path("multi_instance.instances"),
          message: "multi-instance tasks need at least 2 instances"
            .into(),
        });
      }
      if multi.coordination_command.is_empty() {
        return Err(crate::error::EngineError::Validation {
          path: path("multi_instance.coordination_command"),
          message: "coordination command must not be empty".into(),
        });
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortExposure {
  pub container: u16,
  pub host: u16,
  #[serde(default = "default_protocol")]
  pub protocol: String,
}

fn default_protocol() -> String {
  String::from("tcp")
}

/// Multi-instance coordination: the coordination command runs
/// daemonised on all N instances, then the application command
/// execs into the coordination container on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
  pub coordination_command: String,
  pub instances: u32,
  #[serde(default)]
  pub coordination_resource_files: Vec<ResourceFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
  pub username: String,
  #[serde(default)]
  pub elevated: bool,
}

/// Task lifecycle. Egress runs only after Succeeded.
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
pub enum TaskState {
  #[default]
  Expanded,
  Submitted,
  Queued,
  Running,
  Succeeded,
  Failed,
  Terminated,
}

impl TaskState {
  pub fn terminal(&self) -> bool {
    matches!(
      self,
      TaskState::Succeeded | TaskState::Failed | TaskState::Terminated
    )
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
pub enum JobState {
  #[default]
  New,
  Active,
  Completed,
  Terminated,
  Deleted,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entities::federation::JobConstraints;

  fn task(id: &str) -> TaskDescriptor {
    TaskDescriptor {
      id: Some(id.to_string()),
      image: ImageRef::parse("busybox").unwrap(),
      command: "echo hello".to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn at_most_one_factory_per_job() {
    let mut a = task("a");
    a.factory = Some(TaskFactory::Repeat { count: 2 });
    let mut b = task("b");
    b.factory = Some(TaskFactory::Repeat { count: 2 });
    let job = Job {
      id: "job1".to_string(),
      target: JobTarget::Pool("pool-a".to_string()),
      environment: Default::default(),
      max_task_retries: 0,
      auto_complete: false,
      ingress: vec![],
      tasks: vec![a, b],
      constraints: None,
    };
    assert!(job.validate().is_err());
  }

  #[test]
  fn constraints_require_federation_target() {
    let job = Job {
      id: "job1".to_string(),
      target: JobTarget::Pool("pool-a".to_string()),
      environment: Default::default(),
      max_task_retries: 0,
      auto_complete: false,
      ingress: vec![],
      tasks: vec![task("a")],
      constraints: Some(JobConstraints::default()),
    };
    assert!(job.validate().is_err());
  }

  #[test]
  fn inverted_range_rejected() {
    let mut t = task("x");
    t.depends_on_range = Some((7, 3));
    assert!(t.validate("job1").is_err());
  }
}
