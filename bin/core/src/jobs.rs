//! Direct (pool-targeted) job submission, and synthesis of the
//! on-node execution contract: the task wrapper script, the
//! `.env` manifest, and the pool start task script.

use armada_client::{
  entities::{
    Environment, environment_manifest,
    job::{Job, JobTarget, TaskDescriptor},
    pool::PoolSpec,
  },
  error::EngineError,
};

use crate::{
  data, factory,
  graph::{self, CompiledJob},
  images::DistributionPlan,
  platform::{
    ComputePlatform, OpContext, RetryPolicy, with_retry,
  },
  state,
  storage::ObjectStore,
};

/// Expands, compiles, finalizes, and submits a job against its
/// target pool.
pub async fn submit_job(
  ctx: &OpContext,
  platform: &impl ComputePlatform,
  store: &impl ObjectStore,
  pool: &PoolSpec,
  job: &Job,
) -> Result<CompiledJob, EngineError> {
  job.validate()?;
  let JobTarget::Pool(pool_id) = &job.target else {
    return Err(EngineError::validation(
      format!("job.{}.target", job.id),
      "federated jobs go through the federation proxy",
    ));
  };
  if pool_id != &pool.id {
    return Err(EngineError::validation(
      format!("job.{}.target", job.id),
      format!("pool spec {} does not match target", pool.id),
    ));
  }
  if pool.native
    && job.tasks.iter().any(|task| !task.input_data.is_empty())
  {
    return Err(EngineError::validation(
      format!("job.{}.tasks", job.id),
      "native container mode precludes task-level data ingress",
    ));
  }

  let mut expanded = Vec::new();
  for task in &job.tasks {
    expanded.extend(
      factory::expand(ctx, store, &job.id, task).await?,
    );
  }
  let mut compiled = graph::compile(&job.id, expanded)?;

  let job_ingress: Vec<(String, &_)> = job
    .ingress
    .iter()
    .map(|unit| (crate::fingerprint::ingress_unit(unit), unit))
    .collect();
  for task in compiled.tasks.iter_mut() {
    finalize_task(ctx, store, job, &job_ingress, task).await?;
  }

  let lock = state::pool_locks().get(&pool.id).await;
  let _guard = lock.lock().await;
  with_retry(ctx, RetryPolicy::default(), "add_job", |_| {
    platform.add_job(ctx, &pool.id, &job.id)
  })
  .await?;
  for batch in compiled.batches() {
    with_retry(
      ctx,
      RetryPolicy::default(),
      "submit_tasks",
      |_| platform.submit_tasks(ctx, &job.id, batch),
    )
    .await?;
  }
  state::last_submitted_job()
    .store(std::sync::Arc::new(job.id.clone()));
  // A legal zero-task expansion (eg repeat 0) auto-completes
  // immediately when the job asks for it.
  if compiled.tasks.is_empty() && job.auto_complete {
    with_retry(
      ctx,
      RetryPolicy::default(),
      "terminate_job",
      |_| platform.terminate_job(ctx, &job.id),
    )
    .await?;
    info!("job {} auto-completed with no tasks", job.id);
  } else {
    info!(
      "job {} submitted with {} task(s)",
      job.id,
      compiled.tasks.len()
    );
  }
  Ok(compiled)
}

/// Resolves task-scope ingress into resource files and wraps
/// the command into the on-node execution contract.
async fn finalize_task(
  ctx: &OpContext,
  store: &impl ObjectStore,
  job: &Job,
  job_ingress: &[(
    String,
    &armada_client::entities::data::IngressUnit,
  )],
  task: &mut TaskDescriptor,
) -> Result<(), EngineError> {
  let task_id =
    task.id.clone().expect("compiled tasks are named");
  for unit in &task.input_data {
    let files = data::resolve_ingress(ctx, store, unit).await?;
    task.resource_files.extend(files);
  }
  let mut egress = Vec::new();
  for unit in &task.output_data {
    egress.extend(
      data::egress_commands(
        ctx,
        store,
        &job.id,
        &task_id,
        unit,
        task.retention_time.unwrap_or(7 * 24 * 3600),
      )
      .await?,
    );
  }

  // Job environment under task overrides.
  let mut environment = job.environment.clone();
  for (key, value) in &task.environment {
    environment.insert(key.clone(), value.clone());
  }
  task.environment = environment;

  task.command =
    task_wrapper(task, &task_id, &job.id, job_ingress, &egress);
  Ok(())
}

/// The task wrapper: write the env manifest, land job-scope
/// ingress once per `(job, node)` behind a marker, run the
/// container, capture the exit code, run the epilogue with
/// `TASK_RESULT`, then exit with the container's code. Egress
/// commands only run on success.
fn task_wrapper(
  task: &TaskDescriptor,
  task_id: &str,
  job_id: &str,
  job_ingress: &[(
    String,
    &armada_client::entities::data::IngressUnit,
  )],
  egress: &[String],
) -> String {
  let mut script = String::from("set -o pipefail\n");
  script.push_str("mkdir -p \"$TASK_WORKING_DIR\"\n");
  script.push_str(
    "cat > \"$TASK_WORKING_DIR/.env\" <<'ARMADA_ENV'\n",
  );
  script.push_str(&environment_manifest(&task.environment));
  script.push_str("ARMADA_ENV\n");

  // Job-scope ingress: the first task of this job on a node
  // lands the input set, siblings skip it.
  for (fp, _unit) in job_ingress {
    let short = crate::fingerprint::short(fp);
    script.push_str(&format!(
      "marker=\"$NODE_SHARED_DIR/.armada-job-{job_id}-{short}\"\n\
if [ ! -f \"$marker\" ]; then\n  \
armada-ingress --scope job --job {job_id} --unit {short}\n  \
touch \"$marker\"\nfi\n"
    ));
  }

  script.push_str(&container_invocation(task, task_id));
  script.push('\n');
  script.push_str("rc=$?\n");
  script.push_str("if [ $rc -eq 0 ]; then\n");
  script.push_str("  export TASK_RESULT=success\n");
  for command in egress {
    script.push_str("  ");
    script.push_str(command);
    script.push('\n');
  }
  script.push_str("else\n");
  script.push_str("  export TASK_RESULT=fail\n");
  script.push_str("fi\n");
  script.push_str("exit $rc\n");
  script
}

/// The container invocation. Multi-instance application tasks
/// exec into the daemonised coordination container instead of
/// starting their own.
fn container_invocation(
  task: &TaskDescriptor,
  task_id: &str,
) -> String {
  if let Some(coordination) =
    task.environment.get("ARMADA_COORDINATION_CONTAINER")
  {
    return format!(
      "docker exec {coordination} /bin/sh -c '{}'",
      task.command.replace('\'', r"'\''")
    );
  }

  let mut run = String::from("docker run");
  // Coordination halves daemonise and keep the container name
  // addressable for the application exec.
  if task.multi_instance.is_some() {
    run.push_str(" -d");
  }
  run.push_str(&format!(" --name {task_id}"));
  if task.remove_after_exit && task.multi_instance.is_none() {
    run.push_str(" --rm");
  }
  run.push_str(
    " --env-file \"$TASK_WORKING_DIR/.env\" -w \"$TASK_DIR\"",
  );
  run.push_str(
    " -v \"$TASK_DIR\":\"$TASK_DIR\" -v \"$NODE_SHARED_DIR\":\"$NODE_SHARED_DIR\"",
  );
  for alias in &task.volume_aliases {
    run.push_str(&format!(" --volumes-from {alias}"));
  }
  for port in &task.ports {
    run.push_str(&format!(
      " -p {}:{}/{}",
      port.host, port.container, port.protocol
    ));
  }
  if let Some(shm) = &task.shm_size {
    run.push_str(&format!(" --shm-size {shm}"));
  }
  if task.gpu {
    run.push_str(" --gpus all");
  }
  if task.infiniband {
    run.push_str(
      " --device /dev/infiniband --cap-add IPC_LOCK",
    );
  }
  if let Some(user) = &task.user_identity {
    run.push_str(&format!(" --user {}", user.username));
  }
  for option in &task.run_options {
    run.push(' ');
    run.push_str(option);
  }
  if let Some(entrypoint) = &task.entrypoint {
    run.push_str(&format!(" --entrypoint {entrypoint}"));
  }
  run.push(' ');
  run.push_str(&task.image.reference());
  run.push_str(" /bin/sh -c '");
  run.push_str(&task.command.replace('\'', r"'\''"));
  run.push('\'');
  run
}

/// The pool start task script: marker-guarded pool ingress,
/// registry logins (tokens arrive via environment, never inline),
/// and the replicator launch with the distribution plan
/// environment.
pub fn start_task_script(
  pool: &PoolSpec,
  plan: &DistributionPlan,
  node_id: &str,
  registry_domains: &[String],
) -> (String, Environment) {
  let mut script = String::from("set -e\n");
  script.push_str("mkdir -p \"$NODE_SHARED_DIR\"\n");

  for (index, domain) in registry_domains.iter().enumerate() {
    script.push_str(&format!(
      "echo \"$ARMADA_REGISTRY_TOKEN_{index}\" | \
docker login {domain} --username \"$ARMADA_REGISTRY_USER_{index}\" --password-stdin\n",
    ));
  }

  if !pool.ingress.is_empty() {
    script.push_str(
      "marker=\"$NODE_SHARED_DIR/.armada-pool-ingress\"\n",
    );
    script.push_str("if [ ! -f \"$marker\" ]; then\n");
    script.push_str("  armada-ingress --scope pool\n");
    script.push_str("  touch \"$marker\"\n");
    script.push_str("fi\n");
  }

  if !pool.native && !pool.preload_images.is_empty() {
    script.push_str("replicator &\n");
  }

  if !pool.start_task.script.is_empty() {
    script.push_str(&pool.start_task.script);
    if !pool.start_task.script.ends_with('\n') {
      script.push('\n');
    }
  }

  let mut environment = plan.start_task_environment(node_id);
  for (key, value) in &pool.start_task.environment {
    environment.insert(key.clone(), value.clone());
  }
  (script, environment)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    platform::memory::MemoryPlatform, storage::dir::DirStore,
  };
  use armada_client::entities::{
    factory::TaskFactory,
    image::ImageRef,
    job::MultiInstanceSpec,
    pool::VmImage,
  };

  fn pool(id: &str) -> PoolSpec {
    PoolSpec {
      id: id.to_string(),
      vm_image: VmImage::Custom {
        image_id: "img".into(),
      },
      vm_size: "standard_d2s_v3".into(),
      target_dedicated: 1,
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

  fn job(id: &str, pool_id: &str) -> Job {
    Job {
      id: id.to_string(),
      target: JobTarget::Pool(pool_id.to_string()),
      environment: Default::default(),
      max_task_retries: 0,
      auto_complete: true,
      ingress: vec![],
      tasks: vec![TaskDescriptor {
        image: ImageRef::parse("busybox").unwrap(),
        command: "sleep {0}".to_string(),
        factory: Some(TaskFactory::Repeat { count: 3 }),
        ..Default::default()
      }],
      constraints: None,
    }
  }

  #[tokio::test]
  async fn submits_expanded_and_wrapped_tasks() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let pool = pool("pool-a");
    platform.create_pool(&ctx, &pool).await.unwrap();

    let compiled = submit_job(
      &ctx,
      &platform,
      &store,
      &pool,
      &job("job1", "pool-a"),
    )
    .await
    .unwrap();
    assert_eq!(compiled.tasks.len(), 3);
    assert_eq!(
      platform.job_task_ids("job1").await,
      vec![
        "dockertask-00000",
        "dockertask-00001",
        "dockertask-00002"
      ]
    );
    let wrapper = &compiled.tasks[0].command;
    assert!(wrapper.contains("sleep 0"));
    assert!(wrapper.contains("TASK_RESULT=success"));
    assert!(wrapper.contains("exit $rc"));
  }

  #[tokio::test]
  async fn job_ingress_is_marker_guarded_in_wrapper() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let pool = pool("pool-j");
    platform.create_pool(&ctx, &pool).await.unwrap();

    let mut with_ingress = job("job-j", "pool-j");
    with_ingress.ingress.push(
      armada_client::entities::data::IngressUnit {
        source:
          armada_client::entities::data::IngressSource::ObjectStorage {
            account: "data".into(),
            remote_path: "shared/".into(),
            include: vec![],
            exclude: vec![],
          },
        destination: None,
        extra_options: None,
      },
    );
    let compiled = submit_job(
      &ctx, &platform, &store, &pool, &with_ingress,
    )
    .await
    .unwrap();
    let wrapper = &compiled.tasks[0].command;
    assert!(wrapper.contains(".armada-job-job-j-"));
    assert!(
      wrapper.contains("if [ ! -f \"$marker\" ]; then")
    );
  }

  #[tokio::test]
  async fn empty_expansion_auto_completes() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let pool = pool("pool-z");
    platform.create_pool(&ctx, &pool).await.unwrap();

    let mut zero = job("job-z", "pool-z");
    zero.tasks[0].factory =
      Some(TaskFactory::Repeat { count: 0 });
    let compiled =
      submit_job(&ctx, &platform, &store, &pool, &zero)
        .await
        .unwrap();
    assert!(compiled.tasks.is_empty());
    assert!(platform.job_exists("job-z").await);
    assert!(platform.job_terminated("job-z").await);
  }

  #[tokio::test]
  async fn native_pool_rejects_task_ingress() {
    let platform = MemoryPlatform::new();
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    let ctx = OpContext::default();
    let mut native = pool("pool-n");
    native.native = true;
    platform.create_pool(&ctx, &native).await.unwrap();

    let mut bad = job("job1", "pool-n");
    bad.tasks[0].factory = None;
    bad.tasks[0].input_data.push(
      armada_client::entities::data::IngressUnit {
        source:
          armada_client::entities::data::IngressSource::ObjectStorage {
            account: "data".into(),
            remote_path: "in/".into(),
            include: vec![],
            exclude: vec![],
          },
        destination: None,
        extra_options: None,
      },
    );
    let result =
      submit_job(&ctx, &platform, &store, &native, &bad).await;
    assert!(matches!(
      result,
      Err(EngineError::Validation { .. })
    ));
  }

  #[test]
  fn multi_instance_wrapper_execs_into_coordination() {
    let compiled = graph::compile(
      "job1",
      vec![TaskDescriptor {
        id: Some("mpi".to_string()),
        image: ImageRef::parse("busybox").unwrap(),
        command: "mpirun app".to_string(),
        multi_instance: Some(MultiInstanceSpec {
          coordination_command: "orted --daemonize"
            .to_string(),
          instances: 4,
          coordination_resource_files: vec![],
        }),
        ..Default::default()
      }],
    )
    .unwrap();
    let coordination = container_invocation(
      &compiled.tasks[0],
      compiled.tasks[0].id.as_deref().unwrap(),
    );
    assert!(coordination.starts_with("docker run -d"));
    assert!(coordination.contains("--name mpi-coord"));

    let application = container_invocation(
      &compiled.tasks[1],
      compiled.tasks[1].id.as_deref().unwrap(),
    );
    assert!(
      application.starts_with("docker exec mpi-coord")
    );
    assert!(application.contains("mpirun app"));
  }

  #[test]
  fn start_task_script_guards_ingress_with_marker() {
    let mut spec = pool("pool-a");
    spec.preload_images = vec!["app:1".to_string()];
    spec.ingress.push(
      armada_client::entities::data::IngressUnit {
        source:
          armada_client::entities::data::IngressSource::ObjectStorage {
            account: "data".into(),
            remote_path: "shared/".into(),
            include: vec![],
            exclude: vec![],
          },
        destination: None,
        extra_options: None,
      },
    );
    let plan = crate::images::plan(
      &spec,
      &[],
      &Default::default(),
      None,
    );
    let (script, env) = start_task_script(
      &spec,
      &plan,
      "tvm-000000",
      &["reg.example.com".to_string()],
    );
    assert!(script.contains("docker login reg.example.com"));
    assert!(script.contains("if [ ! -f \"$marker\" ]"));
    assert!(script.contains("replicator &"));
    assert!(env.contains_key("ARMADA_PRELOAD_IMAGES"));
  }
}
