use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
  config::{replicator_args, replicator_config, seed_images},
  docker::DockerClient,
  fetch::{FetchOutcome, Fetcher},
  state::tracker,
};

#[macro_use]
extern crate tracing;

mod chunks;
mod config;
mod docker;
mod fetch;
mod peer;
mod state;
mod tracker;

async fn app(stop: CancellationToken) -> anyhow::Result<()> {
  // Touch args first so `--help` works before config loading.
  let _ = replicator_args();
  let config = replicator_config();
  logger::init(&config.logging)?;

  let startup_span = info_span!("ReplicatorStartup");
  let advertise = async {
    info!(
      "Armada Replicator version: v{}",
      env!("CARGO_PKG_VERSION")
    );
    info!("{:?}", config.sanitized());
    if config.pool_id.is_empty() || config.node_id.is_empty() {
      anyhow::bail!(
        "pool_id and node_id must be configured (REPLICATOR_POOL_ID / REPLICATOR_NODE_ID)"
      );
    }
    if config.pool_secret.is_empty() {
      anyhow::bail!("pool_secret must be configured");
    }
    let hostname = std::env::var("ARMADA_NODE_ADDRESS")
      .unwrap_or_else(|_| "127.0.0.1".to_string());
    let advertise =
      format!("{hostname}:{}", config.listen_port);

    tokio::fs::create_dir_all(&config.work_directory)
      .await
      .context("failed to create work directory")?;

    // Register with the tracker under the pool id.
    tracker()
      .register_node(&config.node_id, &advertise)
      .await
      .context("failed to register with tracker")?;
    anyhow::Ok(advertise)
  }
  .instrument(startup_span)
  .await?;

  let server = peer::serve(stop.clone()).await?;

  let docker = DockerClient::connect()?;
  let seeds = seed_images();
  let fetcher = Fetcher {
    tracker: tracker(),
    work: config.work_directory.clone(),
    node_id: config.node_id.clone(),
    advertise: advertise.clone(),
    pool_secret: config.pool_secret.clone(),
    stall_timeout: std::time::Duration::from_secs(
      config.chunk_stall_timeout.max(1),
    ),
    source_limit: config
      .data_replication
      .concurrent_source_downloads
      .max(1),
  };

  // Images replicate in preload order, one at a time: the
  // agent is cooperative and single minded.
  for image in &config.images {
    if stop.is_cancelled() {
      break;
    }
    let result = if seeds.iter().any(|seed| seed == image) {
      seed_image(&docker, image).await
    } else {
      match fetcher.follow(&stop, image).await? {
        FetchOutcome::Complete { archive } => {
          docker.load(&archive).await.with_context(|| {
            format!("failed to load {image}")
          })?;
          info!("image {image} loaded from peers");
          Ok(())
        }
        FetchOutcome::BecomeSeed => {
          info!(
            "no live seed for {image}, promoting with the freed origin slot"
          );
          seed_image(&docker, image).await
        }
        FetchOutcome::DirectPull => {
          let log = docker.pull(image).await;
          if log.success {
            Ok(())
          } else {
            Err(anyhow::anyhow!(
              "direct pull of {image} failed | {}",
              log.stderr
            ))
          }
        }
        FetchOutcome::Cancelled => break,
      }
    };
    if let Err(e) = result {
      error!("replication of {image} failed | {e:#}");
      return Err(e);
    }
  }

  info!("all images replicated, serving peers");
  server.await.ok();
  Ok(())
}

/// Seed flow: wait for an origin slot, pull, export, optionally
/// compress, split into chunks, and announce the full chunk set
/// to the tracker.
async fn seed_image(
  docker: &DockerClient,
  image: &str,
) -> anyhow::Result<()> {
  let config = replicator_config();
  let limit = config
    .data_replication
    .concurrent_source_downloads
    .max(1);

  while !tracker()
    .try_claim_source(image, &config.node_id, limit)
    .await?
  {
    debug!("waiting for an origin download slot for {image}");
    tokio::time::sleep(std::time::Duration::from_millis(500))
      .await;
  }

  let result = async {
    if !docker.image_present(image).await {
      let log = docker.pull(image).await;
      if !log.success {
        anyhow::bail!(
          "origin pull of {image} failed | {}",
          log.stderr
        );
      }
    }
    let dir =
      chunks::chunk_dir(&config.work_directory, image);
    tokio::fs::create_dir_all(&dir).await.with_context(
      || format!("failed to create {}", dir.display()),
    )?;
    let archive = dir.join("image.tar");
    docker.export(image, &archive).await?;
    let compress =
      config.data_replication.peer_to_peer.compression;
    let archive =
      chunks::maybe_compress(archive, compress).await?;
    let hashes = chunks::split(
      &config.work_directory,
      image,
      &archive,
      config.chunk_size,
    )
    .await?;

    let node_id = config.node_id.clone();
    let hostname = std::env::var("ARMADA_NODE_ADDRESS")
      .unwrap_or_else(|_| "127.0.0.1".to_string());
    let advertise =
      format!("{hostname}:{}", config.listen_port);
    let chunk_indexes: Vec<u32> =
      (0..hashes.len() as u32).collect();
    tracker()
      .update(image, move |entry| {
        entry.chunk_hashes = hashes;
        entry.compressed = compress;
        entry.holders.insert(
          node_id,
          crate::tracker::HolderRecord {
            address: advertise,
            chunks: chunk_indexes,
            seed: true,
            active_uploads: 0,
            updated_at:
              armada_client::entities::armada_timestamp(),
          },
        );
      })
      .await?;
    info!("image {image} seeded");
    anyhow::Ok(())
  }
  .await;

  // Free the origin slot either way; on failure a follower
  // reuses it for promotion.
  tracker()
    .release_source(image, &config.node_id)
    .await
    .ok();
  result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let stop = CancellationToken::new();
  let app = tokio::spawn(app(stop.clone()));

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("Draining in-flight transfers for shutdown");
      stop.cancel();
      state::reset_upload_counter();
    },
  }

  Ok(())
}
