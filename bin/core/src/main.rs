use std::sync::Arc;

use anyhow::Context;
use armada_client::entities::{
  config::{CoreCommand, FedCommand, JobsCommand, PoolCommand},
  job::Job,
  pool::PoolSpec,
};
use tracing::Instrument;

use crate::{
  config::{core_args, core_config, load_config_file},
  credentials::{CredentialStore, SealKeys},
  platform::{
    ComputePlatform, OpContext,
    memory::{MemoryIdentity, MemoryPlatform, MemoryVault},
  },
  storage::dir::DirStore,
};

#[macro_use]
extern crate tracing;

mod config;
mod credentials;
mod data;
mod factory;
mod federation;
mod fingerprint;
mod graph;
mod images;
mod jobs;
mod observer;
mod platform;
mod pool;
mod state;
mod storage;

async fn app() -> anyhow::Result<()> {
  let config = core_config();
  logger::init(&config.logging)?;

  let startup_span = info_span!("CoreStartup");
  async {
    info!(
      "Armada Core version: v{}",
      env!("CARGO_PKG_VERSION")
    );
    if config.pretty_startup_config {
      info!("{:#?}", config.sanitized());
    } else {
      info!("{:?}", config.sanitized());
    }

    let ctx = OpContext::default();
    let keys = if config
      .global
      .encryption
      .private_key_path
      .is_empty()
    {
      None
    } else {
      Some(
        SealKeys::from_file(
          &config.global.encryption.private_key_path,
        )
        .context("failed to load decryption keys")?,
      )
    };
    let store = CredentialStore::resolve(
      &ctx,
      &config.credentials,
      &MemoryVault::default(),
      &MemoryIdentity::default(),
      keys.as_ref(),
    )
    .await
    .context("failed to resolve credentials")?;
    state::init_credential_store(store);
    anyhow::Ok(())
  }
  .instrument(startup_span)
  .await?;

  // Local adapters: the in-memory compute platform and the
  // directory object store. Cloud bindings implement the same
  // capabilities out of tree and slot in here.
  let platform = Arc::new(MemoryPlatform::new());
  let store = Arc::new(DirStore::new(
    config.root_directory.join("metadata"),
  ));
  let ctx = OpContext::default();

  match &core_args().command {
    CoreCommand::Pool { command } => {
      run_pool_command(&ctx, &platform, &store, command).await
    }
    CoreCommand::Jobs { command } => {
      run_jobs_command(&ctx, &platform, &store, command).await
    }
    CoreCommand::Fed { command } => {
      run_fed_command(&ctx, platform, store, command).await
    }
    CoreCommand::Log { job, task } => {
      let job = job.clone().unwrap_or_else(|| {
        state::last_submitted_job().load().to_string()
      });
      let task = task.clone().unwrap_or_default();
      let mut stdout = tokio::io::stdout();
      observer::stream_task_output(
        &ctx,
        &*platform,
        &job,
        &task,
        "stdout.txt",
        &mut stdout,
      )
      .await?;
      Ok(())
    }
  }
}

async fn run_pool_command(
  ctx: &OpContext,
  platform: &Arc<MemoryPlatform>,
  store: &Arc<DirStore>,
  command: &PoolCommand,
) -> anyhow::Result<()> {
  let config = core_config();
  let controller =
    pool::PoolController::new(&**platform, &**store)
      .with_diagnostics_dir(config.root_directory.join("logs"));
  match command {
    PoolCommand::Add { spec } => {
      let spec: PoolSpec = load_config_file(spec)?;
      let plan = controller
        .allocate(
          ctx,
          &spec,
          &config.global.data_replication,
          config.global.private_mirror.as_ref(),
          None,
        )
        .await?;
      info!(
        "pool {} ready, {} image(s) planned",
        spec.id,
        plan.per_image.len()
      );
      // Persist the synthesized per-node start task artifacts.
      let registry_domains: Vec<String> = config
        .global
        .registries
        .iter()
        .map(|registry| registry.domain.clone())
        .collect();
      let artifacts = config
        .root_directory
        .join("pools")
        .join(&spec.id)
        .join("start-task");
      tokio::fs::create_dir_all(&artifacts).await?;
      for node in platform.list_nodes(ctx, &spec.id).await? {
        let (script, env) = jobs::start_task_script(
          &spec,
          &plan,
          &node.id,
          &registry_domains,
        );
        tokio::fs::write(
          artifacts.join(format!("{}.sh", node.id)),
          &script,
        )
        .await?;
        tokio::fs::write(
          artifacts.join(format!("{}.env", node.id)),
          armada_client::entities::environment_manifest(&env),
        )
        .await?;
      }
      Ok(())
    }
    PoolCommand::Resize {
      id,
      dedicated,
      preemptible,
    } => {
      let observation =
        platform.observe_pool(ctx, id).await?;
      if !observation.exists {
        anyhow::bail!("pool {id} does not exist");
      }
      let mut spec: PoolSpec = PoolSpec {
        id: id.clone(),
        ..placeholder_spec()
      };
      spec.target_dedicated = *dedicated;
      spec.target_preemptible = *preemptible;
      controller
        .resize(ctx, &spec, *dedicated, *preemptible)
        .await?;
      Ok(())
    }
    PoolCommand::Del { id } => {
      controller.delete(ctx, id).await?;
      info!("pool {id} deleted");
      Ok(())
    }
    PoolCommand::Ingress { spec } => {
      let spec: PoolSpec = load_config_file(spec)?;
      let pending = data::plan_pool_ingress(
        ctx, &**store, &spec.id, &spec.ingress,
      )
      .await?;
      if pending.is_empty() {
        info!("pool {} ingress: nothing to do", spec.id);
        return Ok(());
      }
      for (fp, unit) in &pending {
        if let armada_client::entities::data::IngressSource::LocalToShared {
          local_path,
          transport,
          ..
        } = &unit.source
        {
          // On-prem fan-out runs engine side over the secure
          // transports, bounded per node.
          let targets: Vec<data::fanout::FanoutTarget> =
            platform
              .list_nodes(ctx, &spec.id)
              .await?
              .into_iter()
              .filter_map(|node| {
                node.address.map(|address| {
                  data::fanout::FanoutTarget {
                    node_id: node.id,
                    host: address
                      .split(':')
                      .next()
                      .unwrap_or_default()
                      .to_string(),
                    port: 22,
                    user: "armada".to_string(),
                    key_path: config
                      .root_directory
                      .join("keys/id_ed25519")
                      .to_string_lossy()
                      .to_string(),
                  }
                })
              })
              .collect();
          let destination = unit
            .destination
            .clone()
            .unwrap_or_else(|| "/mnt/shared".to_string());
          data::fanout::run(
            ctx,
            *transport,
            std::path::Path::new(local_path),
            &destination,
            &targets,
            4,
          )
          .await?;
        } else {
          let files =
            data::resolve_ingress(ctx, &**store, unit).await?;
          info!(
            "pool {} ingress {} resolves {} file(s)",
            spec.id,
            fingerprint::short(fp),
            files.len()
          );
        }
        data::mark_pool_ingress_done(
          ctx, &**store, &spec.id, fp,
        )
        .await?;
      }
      Ok(())
    }
  }
}

async fn run_jobs_command(
  ctx: &OpContext,
  platform: &Arc<MemoryPlatform>,
  store: &Arc<DirStore>,
  command: &JobsCommand,
) -> anyhow::Result<()> {
  match command {
    JobsCommand::Add { spec } => {
      let submission: JobsFile = load_config_file(spec)?;
      for job in &submission.jobs {
        jobs::submit_job(
          ctx,
          &**platform,
          &**store,
          &submission.pool,
          job,
        )
        .await?;
      }
      Ok(())
    }
    JobsCommand::Term { id } => {
      platform.terminate_job(ctx, id).await?;
      info!("job {id} terminated");
      Ok(())
    }
    JobsCommand::Del { id } => {
      platform.delete_job(ctx, id).await?;
      info!("job {id} deleted");
      Ok(())
    }
  }
}

async fn run_fed_command(
  ctx: &OpContext,
  platform: Arc<MemoryPlatform>,
  store: Arc<DirStore>,
  command: &FedCommand,
) -> anyhow::Result<()> {
  let config = core_config();
  match command {
    FedCommand::Proxy { federation } => {
      let federation = armada_client::entities::federation::Federation {
        id: federation.clone(),
        members: vec![],
        unique_job_ids: false,
        storage: config.global.metadata_storage.clone(),
      };
      let snapshots = Arc::new(
        federation::StaticSnapshots::new(Vec::new()),
      );
      let proxy = federation::proxy::FederationProxy::new(
        platform,
        store.clone(),
        snapshots,
        federation,
        config.federation_proxy.clone(),
      );
      if !config
        .federation_proxy
        .log_persistence_path
        .is_empty()
        && !config.logging.file.is_empty()
      {
        let mirror_ctx = ctx.child();
        let file =
          std::path::PathBuf::from(&config.logging.file);
        let destination = config
          .federation_proxy
          .log_persistence_path
          .clone();
        let mirror_store = store.clone();
        tokio::spawn(async move {
          observer::mirror_log_file(
            &mirror_ctx,
            &*mirror_store,
            &file,
            &destination,
            std::time::Duration::from_secs(10),
          )
          .await;
        });
      }
      proxy.run(ctx.clone()).await?;
      Ok(())
    }
    FedCommand::Submit { federation, spec } => {
      let submission: FederatedJobsFile =
        load_config_file(spec)?;
      let federation = armada_client::entities::federation::Federation {
        id: federation.clone(),
        members: vec![],
        unique_job_ids: submission.unique_job_ids,
        storage: config.global.metadata_storage.clone(),
      };
      let snapshots = Arc::new(
        federation::StaticSnapshots::new(Vec::new()),
      );
      let proxy = federation::proxy::FederationProxy::new(
        platform,
        store,
        snapshots,
        federation,
        config.federation_proxy.clone(),
      );
      for job in submission.jobs {
        let unique_id = proxy
          .enqueue_add_job(ctx, job, None)
          .await?;
        info!("enqueued action {unique_id}");
      }
      Ok(())
    }
    FedCommand::Actions { federation } => {
      let queue = federation::queue::ActionQueue::new(
        &*store,
        federation,
      );
      let records = queue.action_records(ctx).await?;
      for record in records {
        println!(
          "{}\t{}\t{}\t{}\t{}",
          record.unique_id,
          record.job_id,
          record.kind,
          record.status,
          record.location.unwrap_or_default(),
        );
      }
      Ok(())
    }
    FedCommand::Zap {
      federation,
      unique_id,
    } => {
      let queue = federation::queue::ActionQueue::new(
        &*store,
        federation,
      );
      let removed = queue.zap(ctx, *unique_id).await?;
      info!("zapped {removed} queue entr(ies)");
      Ok(())
    }
  }
}

/// Jobs file: a pool spec plus the jobs that target it.
#[derive(serde::Deserialize)]
struct JobsFile {
  pool: PoolSpec,
  jobs: Vec<Job>,
}

#[derive(serde::Deserialize)]
struct FederatedJobsFile {
  #[serde(default)]
  unique_job_ids: bool,
  jobs: Vec<Job>,
}

fn placeholder_spec() -> PoolSpec {
  PoolSpec {
    id: String::new(),
    vm_image:
      armada_client::entities::pool::VmImage::Custom {
        image_id: String::new(),
      },
    vm_size: String::new(),
    target_dedicated: 0,
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("Received terminate signal, shutting down");
    },
  }

  Ok(())
}
