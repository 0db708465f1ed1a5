//! Task factory expansion: one task descriptor plus a factory
//! deterministically become a list of sibling descriptors with
//! positional parameters substituted into the command template.

use std::collections::HashMap;

use armada_client::{
  entities::{
    data::{IngressSource, IngressUnit},
    factory::TaskFactory,
    job::TaskDescriptor,
  },
  error::EngineError,
  parsers::CommandTemplate,
};

use crate::{
  platform::OpContext,
  storage::ObjectStore,
};

mod orderings;

use orderings::{combinations, permutations};

/// Expands the descriptor through its factory. Descriptors
/// without a factory pass through unchanged. File factories
/// consult the object store holding the referenced account's
/// data; every other kind is pure.
pub async fn expand(
  ctx: &OpContext,
  store: &impl ObjectStore,
  job_id: &str,
  descriptor: &TaskDescriptor,
) -> Result<Vec<TaskDescriptor>, EngineError> {
  let Some(factory) = &descriptor.factory else {
    return Ok(vec![descriptor.clone()]);
  };
  let path = format!("job.{job_id}.task_factory");
  if descriptor.id.is_some() {
    return Err(EngineError::validation(
      &path,
      "factory tasks are auto-named, remove the explicit id",
    ));
  }
  let template = CommandTemplate::parse(&descriptor.command)
    .map_err(|e| EngineError::validation(&path, format!("{e:#}")))?;

  let bindings = match factory {
    TaskFactory::Repeat { count } => repeat_bindings(
      *count,
      template.max_index(),
    ),
    TaskFactory::Product { ranges } => {
      for range in ranges {
        range.validate().map_err(|e| {
          EngineError::validation(&path, format!("{e:#}"))
        })?;
      }
      template.validate_arity(ranges.len()).map_err(|e| {
        EngineError::validation(&path, format!("{e:#}"))
      })?;
      product_bindings(ranges)
    }
    TaskFactory::Combinations {
      iterable,
      length,
      with_replacement,
    } => {
      if !*with_replacement && *length > iterable.len() {
        return Err(EngineError::validation(
          &path,
          format!(
            "combination length {length} exceeds iterable size {}",
            iterable.len()
          ),
        ));
      }
      template.validate_arity(*length).map_err(|e| {
        EngineError::validation(&path, format!("{e:#}"))
      })?;
      combinations(iterable.len(), *length, *with_replacement)
        .into_iter()
        .map(|indices| {
          indices
            .into_iter()
            .map(|i| iterable[i].clone())
            .collect()
        })
        .collect()
    }
    TaskFactory::Permutations { iterable, length } => {
      template.validate_arity(*length).map_err(|e| {
        EngineError::validation(&path, format!("{e:#}"))
      })?;
      permutations(iterable.len(), *length)
        .into_iter()
        .map(|indices| {
          indices
            .into_iter()
            .map(|i| iterable[i].clone())
            .collect()
        })
        .collect()
    }
    TaskFactory::Zip { iterables } => {
      template.validate_arity(iterables.len()).map_err(|e| {
        EngineError::validation(&path, format!("{e:#}"))
      })?;
      let shortest = iterables
        .iter()
        .map(Vec::len)
        .min()
        .unwrap_or(0);
      (0..shortest)
        .map(|row| {
          iterables
            .iter()
            .map(|iterable| iterable[row].clone())
            .collect()
        })
        .collect()
    }
    TaskFactory::File { .. } => {
      return expand_file_factory(
        ctx, store, &path, descriptor, factory, &template,
      )
      .await;
    }
  };

  bindings
    .into_iter()
    .map(|positional| {
      let command = template
        .render(&positional, &HashMap::new())
        .map_err(|e| {
          EngineError::validation(&path, format!("{e:#}"))
        })?;
      Ok(sibling(descriptor, command))
    })
    .collect()
}

/// Repeat carries no information in positional parameters:
/// placeholder `{k}` renders as the literal decimal k.
fn repeat_bindings(
  count: u64,
  max_index: Option<usize>,
) -> Vec<Vec<String>> {
  let positional: Vec<String> = match max_index {
    Some(max) => (0..=max).map(|i| i.to_string()).collect(),
    None => Vec::new(),
  };
  (0..count).map(|_| positional.clone()).collect()
}

/// Cartesian product, left-most range varying slowest.
fn product_bindings(
  ranges: &[armada_client::entities::factory::ParametricRange],
) -> Vec<Vec<String>> {
  let mut rows: Vec<Vec<String>> = vec![Vec::new()];
  for range in ranges {
    let values: Vec<i64> = range.iter().collect();
    let mut next =
      Vec::with_capacity(rows.len() * values.len());
    for row in &rows {
      for value in &values {
        let mut row = row.clone();
        row.push(value.to_string());
        next.push(row);
      }
    }
    rows = next;
  }
  if ranges.is_empty() { Vec::new() } else { rows }
}

async fn expand_file_factory(
  ctx: &OpContext,
  store: &impl ObjectStore,
  path: &str,
  descriptor: &TaskDescriptor,
  factory: &TaskFactory,
  template: &CommandTemplate,
) -> Result<Vec<TaskDescriptor>, EngineError> {
  let TaskFactory::File {
    account,
    remote_path,
    include,
    exclude,
    task_filepath,
  } = factory
  else {
    unreachable!("caller matched the file variant");
  };
  if template.max_index().is_some() {
    return Err(EngineError::validation(
      path,
      "file factories bind named placeholders only",
    ));
  }
  const FILE_ATTRS: [&str; 4] =
    ["file_path", "file_name", "file_stem", "file_ext"];
  if let Some(unknown) = template
    .named()
    .iter()
    .find(|name| !FILE_ATTRS.contains(&name.as_str()))
  {
    return Err(EngineError::validation(
      path,
      format!("unknown file attribute {{{unknown}}}"),
    ));
  }
  let filepath_template = task_filepath
    .as_deref()
    .map(CommandTemplate::parse)
    .transpose()
    .map_err(|e| {
      EngineError::validation(path, format!("{e:#}"))
    })?;

  let keys = store
    .list(ctx, remote_path, include, exclude)
    .await
    .map_err(EngineError::from)?;

  let mut tasks = Vec::with_capacity(keys.len());
  for key in keys {
    let named = file_attributes(&key);
    let command =
      template.render(&[], &named).map_err(|e| {
        EngineError::validation(path, format!("{e:#}"))
      })?;
    let destination = filepath_template
      .as_ref()
      .map(|t| t.render(&[], &named))
      .transpose()
      .map_err(|e| {
        EngineError::validation(path, format!("{e:#}"))
      })?;
    let mut task = sibling(descriptor, command);
    task.input_data.push(IngressUnit {
      source: IngressSource::ObjectStorage {
        account: account.clone(),
        remote_path: key,
        include: Vec::new(),
        exclude: Vec::new(),
      },
      destination,
      extra_options: None,
    });
    tasks.push(task);
  }
  Ok(tasks)
}

fn file_attributes(key: &str) -> HashMap<String, String> {
  let name = key.rsplit('/').next().unwrap_or(key);
  let (stem, ext) = match name.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => {
      (stem.to_string(), ext.to_string())
    }
    _ => (name.to_string(), String::new()),
  };
  HashMap::from([
    ("file_path".to_string(), key.to_string()),
    ("file_name".to_string(), name.to_string()),
    ("file_stem".to_string(), stem),
    ("file_ext".to_string(), ext),
  ])
}

fn sibling(
  descriptor: &TaskDescriptor,
  command: String,
) -> TaskDescriptor {
  let mut task = descriptor.clone();
  task.factory = None;
  task.id = None;
  task.command = command;
  task
}

#[cfg(test)]
mod tests {
  use super::*;
  use armada_client::entities::factory::ParametricRange;

  use crate::storage::dir::DirStore;

  fn base(command: &str, factory: TaskFactory) -> TaskDescriptor {
    TaskDescriptor {
      command: command.to_string(),
      factory: Some(factory),
      ..Default::default()
    }
  }

  async fn run(
    descriptor: &TaskDescriptor,
  ) -> Result<Vec<TaskDescriptor>, EngineError> {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    expand(&OpContext::default(), &store, "job1", descriptor)
      .await
  }

  #[tokio::test]
  async fn repeat_three_sleep() {
    let tasks = run(&base(
      "sleep {0}",
      TaskFactory::Repeat { count: 3 },
    ))
    .await
    .unwrap();
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
      assert_eq!(task.command, "sleep 0");
      assert!(task.id.is_none());
      assert!(task.factory.is_none());
    }
  }

  #[tokio::test]
  async fn repeat_zero_produces_no_tasks() {
    let tasks = run(&base(
      "sleep {0}",
      TaskFactory::Repeat { count: 0 },
    ))
    .await
    .unwrap();
    assert!(tasks.is_empty());
  }

  #[tokio::test]
  async fn product_sweep_order() {
    let tasks = run(&base(
      "echo {0} {1}",
      TaskFactory::Product {
        ranges: vec![
          ParametricRange {
            start: 0,
            stop: 3,
            step: 1,
          },
          ParametricRange {
            start: 100,
            stop: 97,
            step: -1,
          },
        ],
      },
    ))
    .await
    .unwrap();
    assert_eq!(tasks.len(), 9);
    assert_eq!(tasks[0].command, "echo 0 100");
    assert_eq!(tasks[1].command, "echo 0 99");
    assert_eq!(tasks[8].command, "echo 2 98");
  }

  #[tokio::test]
  async fn combinations_without_replacement() {
    let tasks = run(&base(
      "run {0} {1}",
      TaskFactory::Combinations {
        iterable: vec![
          "abc".to_string(),
          "012".to_string(),
          "def".to_string(),
        ],
        length: 2,
        with_replacement: false,
      },
    ))
    .await
    .unwrap();
    let commands: Vec<&str> =
      tasks.iter().map(|t| t.command.as_str()).collect();
    assert_eq!(
      commands,
      vec!["run abc 012", "run abc def", "run 012 def"]
    );
  }

  #[tokio::test]
  async fn zip_stops_at_shortest() {
    let tasks = run(&base(
      "pair {0} {1}",
      TaskFactory::Zip {
        iterables: vec![
          vec!["a".into(), "b".into(), "c".into()],
          vec!["1".into(), "2".into()],
        ],
      },
    ))
    .await
    .unwrap();
    let commands: Vec<&str> =
      tasks.iter().map(|t| t.command.as_str()).collect();
    assert_eq!(commands, vec!["pair a 1", "pair b 2"]);
  }

  #[tokio::test]
  async fn unused_parameter_is_a_validation_error() {
    let result = run(&base(
      "echo {0}",
      TaskFactory::Product {
        ranges: vec![
          ParametricRange {
            start: 0,
            stop: 2,
            step: 1,
          },
          ParametricRange {
            start: 0,
            stop: 2,
            step: 1,
          },
        ],
      },
    ))
    .await;
    assert!(matches!(
      result,
      Err(EngineError::Validation { .. })
    ));
  }

  #[tokio::test]
  async fn file_factory_binds_attributes_and_ingress() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    store
      .put(&ctx, "input/run1.csv", b"a")
      .await
      .unwrap();
    store
      .put(&ctx, "input/run2.csv", b"b")
      .await
      .unwrap();
    store
      .put(&ctx, "input/skip.txt", b"c")
      .await
      .unwrap();

    let descriptor = base(
      "process {file_name} from {file_path}",
      TaskFactory::File {
        account: "data".to_string(),
        remote_path: "input/".to_string(),
        include: vec!["*.csv".to_string()],
        exclude: vec![],
        task_filepath: Some("inputs/{file_stem}.{file_ext}".into()),
      },
    );
    let tasks =
      expand(&ctx, &store, "job1", &descriptor).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(
      tasks[0].command,
      "process run1.csv from input/run1.csv"
    );
    assert_eq!(tasks[0].input_data.len(), 1);
    assert_eq!(
      tasks[0].input_data[0].destination.as_deref(),
      Some("inputs/run1.csv")
    );
  }
}
