//! Dependency graph compilation: auto-naming, multi-instance
//! splitting, dependency range resolution, and acyclicity
//! validation over the expanded task list.
//!
//! The platform enforces dependency edges at runtime; the
//! compiler's job is to hand it a plan that is provably a DAG
//! with globally unique ids.

use std::collections::{HashMap, HashSet, VecDeque};

use armada_client::{
  entities::job::TaskDescriptor, error::EngineError,
};

use crate::platform::SUBMIT_BATCH_LIMIT;

/// A validated submission plan: tasks in a topological order,
/// ready to chunk into platform batches.
#[derive(Debug, Clone)]
pub struct CompiledJob {
  pub tasks: Vec<TaskDescriptor>,
}

impl CompiledJob {
  /// Platform submission batches, at most 100 tasks each, in
  /// plan order.
  pub fn batches(&self) -> impl Iterator<Item = &[TaskDescriptor]> {
    self.tasks.chunks(SUBMIT_BATCH_LIMIT)
  }
}

/// Next free auto name in the `dockertask-NNNNN` sequence.
/// Zero padded to five digits through 99999, unpadded past it.
pub fn auto_name(
  existing: &HashSet<String>,
  next_index: &mut u64,
) -> String {
  loop {
    let index = *next_index;
    *next_index += 1;
    let name = if index <= 99_999 {
      format!("dockertask-{index:05}")
    } else {
      format!("dockertask-{index}")
    };
    if !existing.contains(&name) {
      return name;
    }
  }
}

pub fn compile(
  job_id: &str,
  expanded: Vec<TaskDescriptor>,
) -> Result<CompiledJob, EngineError> {
  let path = format!("job.{job_id}.tasks");

  // Assign auto names, tracking explicit ids for collisions.
  let mut existing: HashSet<String> = HashSet::new();
  for task in &expanded {
    if let Some(id) = &task.id
      && !existing.insert(id.clone())
    {
      return Err(EngineError::validation(
        &path,
        format!("duplicate task id {id}"),
      ));
    }
  }
  let mut next_index = 0u64;
  let mut tasks = Vec::with_capacity(expanded.len());
  for mut task in expanded {
    if task.id.is_none() {
      let name = auto_name(&existing, &mut next_index);
      existing.insert(name.clone());
      task.id = Some(name);
    }
    tasks.push(task);
  }

  // Split multi-instance tasks into coordination + application.
  let mut split = Vec::with_capacity(tasks.len());
  for mut task in tasks {
    let Some(multi) = task.multi_instance.take() else {
      split.push(task);
      continue;
    };
    let app_id = task.id.clone().expect("ids assigned above");
    let coord_id = format!("{app_id}-coord");
    if !existing.insert(coord_id.clone()) {
      return Err(EngineError::validation(
        &path,
        format!("coordination task id {coord_id} collides"),
      ));
    }
    let coordination = TaskDescriptor {
      id: Some(coord_id.clone()),
      command: multi.coordination_command.clone(),
      resource_files: multi.coordination_resource_files.clone(),
      multi_instance: Some(multi),
      depends_on: task.depends_on.clone(),
      depends_on_range: task.depends_on_range,
      input_data: Vec::new(),
      output_data: Vec::new(),
      ..task.clone()
    };
    task.depends_on = vec![coord_id.clone()];
    task.depends_on_range = None;
    // The wrapper execs the application command into the
    // daemonised coordination container.
    task.environment.insert(
      "ARMADA_COORDINATION_CONTAINER".to_string(),
      coord_id,
    );
    split.push(coordination);
    split.push(task);
  }
  let tasks = split;

  // Resolve dependency ranges into concrete edges.
  let ids: HashSet<String> = tasks
    .iter()
    .map(|task| task.id.clone().expect("ids assigned above"))
    .collect();
  let mut edges: HashMap<String, Vec<String>> = HashMap::new();
  for task in &tasks {
    let id = task.id.as_deref().expect("ids assigned above");
    let mut predecessors = task.depends_on.clone();
    if let Some((from, to)) = task.depends_on_range {
      for n in from..=to {
        predecessors.push(n.to_string());
      }
    }
    for predecessor in &predecessors {
      if !ids.contains(predecessor) {
        return Err(EngineError::validation(
          &path,
          format!(
            "task {id} depends on unknown task {predecessor}"
          ),
        ));
      }
    }
    edges.insert(id.to_string(), predecessors);
  }

  // Kahn's algorithm. Anything left over sits on a cycle.
  let mut indegree: HashMap<&str, usize> = HashMap::new();
  let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
  for (id, predecessors) in &edges {
    indegree.entry(id.as_str()).or_insert(0);
    for predecessor in predecessors {
      *indegree.entry(id.as_str()).or_insert(0) += 1;
      dependents
        .entry(predecessor.as_str())
        .or_default()
        .push(id.as_str());
    }
  }
  let mut queue: VecDeque<&str> = {
    let mut roots: Vec<&str> = indegree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(id, _)| *id)
      .collect();
    roots.sort();
    roots.into()
  };
  let mut order: HashMap<String, usize> = HashMap::new();
  while let Some(id) = queue.pop_front() {
    order.insert(id.to_string(), order.len());
    for &dependent in
      dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    {
      let degree = indegree
        .get_mut(dependent)
        .expect("all ids have an indegree entry");
      *degree -= 1;
      if *degree == 0 {
        queue.push_back(dependent);
      }
    }
  }
  if order.len() != edges.len() {
    let mut cyclic: Vec<&str> = edges
      .keys()
      .map(String::as_str)
      .filter(|id| !order.contains_key(*id))
      .collect();
    cyclic.sort();
    return Err(EngineError::validation(
      &path,
      format!(
        "dependency cycle involving tasks: {}",
        cyclic.join(", ")
      ),
    ));
  }

  let mut tasks = tasks;
  tasks.sort_by_key(|task| {
    order[task.id.as_deref().expect("ids assigned above")]
  });

  Ok(CompiledJob { tasks })
}

#[cfg(test)]
mod tests {
  use super::*;
  use armada_client::entities::{
    ResourceFile, job::MultiInstanceSpec,
  };

  fn task(id: Option<&str>) -> TaskDescriptor {
    TaskDescriptor {
      id: id.map(String::from),
      command: "echo".to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn auto_names_pad_to_five_then_unpad() {
    let existing = HashSet::new();
    let mut next = 0;
    assert_eq!(auto_name(&existing, &mut next), "dockertask-00000");
    let mut next = 99_999;
    assert_eq!(auto_name(&existing, &mut next), "dockertask-99999");
    assert_eq!(
      auto_name(&existing, &mut next),
      "dockertask-100000"
    );
  }

  #[test]
  fn auto_names_skip_taken_ids() {
    let existing =
      HashSet::from(["dockertask-00000".to_string()]);
    let mut next = 0;
    assert_eq!(auto_name(&existing, &mut next), "dockertask-00001");
  }

  #[test]
  fn dependency_range_resolves_inclusive() {
    let mut tasks: Vec<TaskDescriptor> =
      (1..=10).map(|n| task(Some(&n.to_string()))).collect();
    let mut x = task(Some("X"));
    x.depends_on_range = Some((3, 7));
    tasks.push(x);
    let compiled = compile("job1", tasks).unwrap();
    let position = |id: &str| {
      compiled
        .tasks
        .iter()
        .position(|t| t.id.as_deref() == Some(id))
        .unwrap()
    };
    for n in 3..=7 {
      assert!(position(&n.to_string()) < position("X"));
    }
  }

  #[test]
  fn singleton_range() {
    let mut tasks = vec![task(Some("4"))];
    let mut x = task(Some("X"));
    x.depends_on_range = Some((4, 4));
    tasks.push(x);
    let compiled = compile("job1", tasks).unwrap();
    assert_eq!(compiled.tasks.len(), 2);
    assert_eq!(compiled.tasks[0].id.as_deref(), Some("4"));
  }

  #[test]
  fn cycle_is_fatal_and_names_tasks() {
    let mut a = task(Some("a"));
    a.depends_on = vec!["b".to_string()];
    let mut b = task(Some("b"));
    b.depends_on = vec!["a".to_string()];
    let err = compile("job1", vec![a, b]).unwrap_err();
    let message = format!("{err}");
    assert!(message.contains("a"));
    assert!(message.contains("b"));
  }

  #[test]
  fn duplicate_ids_rejected() {
    let result =
      compile("job1", vec![task(Some("t")), task(Some("t"))]);
    assert!(result.is_err());
  }

  #[test]
  fn multi_instance_splits_into_two_tasks() {
    let mut app = task(Some("mpi"));
    app.multi_instance = Some(MultiInstanceSpec {
      coordination_command: "daemon --listen".to_string(),
      instances: 4,
      coordination_resource_files: vec![ResourceFile {
        path: "hosts".into(),
        url: "https://store/hosts".into(),
        mode: None,
      }],
    });
    let compiled = compile("job1", vec![app]).unwrap();
    assert_eq!(compiled.tasks.len(), 2);
    let coord = &compiled.tasks[0];
    let app = &compiled.tasks[1];
    assert_eq!(coord.id.as_deref(), Some("mpi-coord"));
    assert_eq!(coord.command, "daemon --listen");
    assert!(coord.multi_instance.is_some());
    assert_eq!(app.id.as_deref(), Some("mpi"));
    assert!(app.multi_instance.is_none());
    assert_eq!(app.depends_on, vec!["mpi-coord".to_string()]);
  }

  #[test]
  fn batches_cap_at_platform_limit() {
    let tasks: Vec<TaskDescriptor> =
      (0..250).map(|_| task(None)).collect();
    let compiled = compile("job1", tasks).unwrap();
    let sizes: Vec<usize> =
      compiled.batches().map(<[_]>::len).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
  }
}
