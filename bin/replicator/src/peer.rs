//! Peer serving: answer chunk requests from followers over the
//! pool-secret authenticated channel.

use std::sync::atomic::Ordering;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use transport::SecureChannel;

use crate::{
  chunks,
  config::replicator_config,
  state::{active_uploads, tracker},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
  Chunk { image: String, index: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerResponse {
  /// Header; the chunk bytes follow as the next payload.
  Chunk {
    index: u32,
    hash: String,
    len: u64,
  },
  NotAvailable {
    reason: String,
  },
}

/// Accept loop. A stop request stops accepting immediately;
/// connections in flight drain their current chunk.
pub async fn serve(
  stop: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
  let config = replicator_config();
  let bind = format!("0.0.0.0:{}", config.listen_port);
  let listener = TcpListener::bind(&bind)
    .await
    .with_context(|| format!("failed to bind {bind}"))?;
  info!("peer server listening on {bind}");

  let handle = tokio::spawn(async move {
    loop {
      let accepted = tokio::select! {
        accepted = listener.accept() => accepted,
        _ = stop.cancelled() => return,
      };
      let (stream, remote) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
          warn!("accept failed | {e}");
          continue;
        }
      };
      let stop = stop.clone();
      tokio::spawn(async move {
        let channel = match SecureChannel::accept(
          stream,
          &replicator_config().pool_secret,
        )
        .await
        {
          Ok(channel) => channel,
          Err(e) => {
            warn!(
              "handshake with {remote} failed | {e:#}"
            );
            return;
          }
        };
        if let Err(e) = handle_peer(channel, stop).await {
          debug!("peer {remote} session ended | {e:#}");
        }
      });
    }
  });
  Ok(handle)
}

async fn handle_peer(
  mut channel: SecureChannel,
  stop: CancellationToken,
) -> anyhow::Result<()> {
  let config = replicator_config();
  loop {
    if stop.is_cancelled() {
      return Ok(());
    }
    let Some(request) =
      channel.recv::<PeerRequest>().await?
    else {
      return Ok(());
    };
    match request {
      PeerRequest::Chunk { image, index } => {
        let path = chunks::chunk_path(
          &config.work_directory,
          &image,
          index,
        );
        let data = match tokio::fs::read(&path).await {
          Ok(data) => data,
          Err(_) => {
            channel
              .send(&PeerResponse::NotAvailable {
                reason: format!(
                  "chunk {index} of {image} not held"
                ),
              })
              .await?;
            continue;
          }
        };
        active_uploads().fetch_add(1, Ordering::SeqCst);
        publish_upload_count(&image).await;
        let result = async {
          channel
            .send(&PeerResponse::Chunk {
              index,
              hash: chunks::chunk_hash(&data),
              len: data.len() as u64,
            })
            .await?;
          channel.send_payload(&data).await
        }
        .await;
        active_uploads().fetch_sub(1, Ordering::SeqCst);
        publish_upload_count(&image).await;
        result?;
      }
    }
  }
}

/// Publish this node's active upload count so followers can
/// prefer the least busy peer.
async fn publish_upload_count(image: &str) {
  let config = replicator_config();
  let count = active_uploads().load(Ordering::SeqCst);
  let node_id = config.node_id.clone();
  if let Err(e) = tracker()
    .update(image, move |entry| {
      if let Some(holder) = entry.holders.get_mut(&node_id) {
        holder.active_uploads = count;
        holder.updated_at =
          armada_client::entities::armada_timestamp();
      }
    })
    .await
  {
    debug!("failed to publish upload count | {e:#}");
  }
}
