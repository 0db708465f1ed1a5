//! Follower fetch logic.
//!
//! Within one image, chunks are acquired rarest-first (fewest
//! holders first) to spread replicas quickly. The serving peer
//! for a chunk is the one with the fewest active uploads; ties
//! break through a generator seeded from this node's id, so a
//! rerun makes the same choices. A chunk whose hash does not
//! verify is discarded and the peer dropped for the image;
//! three consecutive mismatches from one peer blacklist it for
//! the pool lifetime. A follower holding every chunk becomes a
//! seed.

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  path::PathBuf,
  time::Duration,
};

use anyhow::{Context, anyhow};
use rand::{Rng, SeedableRng, rngs::StdRng};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use transport::SecureChannel;

use crate::{
  chunks,
  peer::{PeerRequest, PeerResponse},
  state,
  tracker::{HolderRecord, Tracker},
};

#[derive(Debug, PartialEq)]
pub enum FetchOutcome {
  /// Every chunk verified and assembled; the archive is ready
  /// to load.
  Complete { archive: PathBuf },
  /// No live seed; this node claimed an origin download slot
  /// and should pull directly, then seed.
  BecomeSeed,
  /// Tracker metadata is corrupt; fall back to a direct pull
  /// for this image only.
  DirectPull,
  /// Stop requested; partial chunks were discarded.
  Cancelled,
}

pub struct Fetcher<'a> {
  pub tracker: &'a Tracker,
  pub work: PathBuf,
  pub node_id: String,
  /// Address other peers reach this node at.
  pub advertise: String,
  pub pool_secret: String,
  pub stall_timeout: Duration,
  pub source_limit: u32,
}

impl Fetcher<'_> {
  pub async fn follow(
    &self,
    stop: &CancellationToken,
    image: &str,
  ) -> anyhow::Result<FetchOutcome> {
    let mut held: BTreeSet<u32> = BTreeSet::new();
    let mut dropped: HashSet<String> = HashSet::new();
    let mut consecutive_mismatches: HashMap<String, u32> =
      HashMap::new();

    loop {
      if stop.is_cancelled() {
        self.discard_partial(image, &held).await;
        return Ok(FetchOutcome::Cancelled);
      }

      let entry = match self.tracker.read(image).await {
        Ok(entry) => entry,
        Err(e) => {
          warn!(
            "tracker entry for {image} is corrupt, direct pull | {e:#}"
          );
          return Ok(FetchOutcome::DirectPull);
        }
      };

      // No announced chunks yet: either the seed is still
      // pulling, or it failed and a follower takes over the
      // origin slot.
      let Some(entry) = entry.filter(|entry| {
        !entry.chunk_hashes.is_empty()
          && entry
            .holders
            .values()
            .any(|holder| !holder.chunks.is_empty())
      }) else {
        if self
          .tracker
          .try_claim_source(
            image,
            &self.node_id,
            self.source_limit,
          )
          .await?
        {
          return Ok(FetchOutcome::BecomeSeed);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        continue;
      };

      let needed: Vec<u32> = (0..entry.chunk_count())
        .filter(|index| !held.contains(index))
        .collect();
      if needed.is_empty() {
        let archive = chunks::assemble(
          &self.work,
          image,
          entry.chunk_count(),
          entry.compressed,
        )
        .await?;
        let archive = if entry.compressed {
          chunks::decompress(&archive).await?
        } else {
          archive
        };
        return Ok(FetchOutcome::Complete { archive });
      }

      // Rarest first.
      let target = needed
        .iter()
        .copied()
        .min_by_key(|index| {
          (entry.holders_of(*index).len(), *index)
        })
        .expect("needed is non-empty");

      let eligible: Vec<(&str, &HolderRecord)> = entry
        .holders
        .iter()
        .filter(|(node, holder)| {
          *node != &self.node_id
            && holder.chunks.contains(&target)
            && !holder.address.is_empty()
            && !dropped.contains(*node)
            && !state::is_blacklisted(node)
        })
        .map(|(node, holder)| (node.as_str(), holder))
        .collect();

      let Some((peer, holder)) =
        self.choose_peer(&eligible, target)
      else {
        // Every holder of the rarest chunk is gone. Take the
        // origin slot if one is free, else wait for progress.
        if self
          .tracker
          .try_claim_source(
            image,
            &self.node_id,
            self.source_limit,
          )
          .await?
        {
          return Ok(FetchOutcome::BecomeSeed);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        continue;
      };

      let transfer = tokio::time::timeout(
        self.stall_timeout,
        self.transfer_chunk(&holder.address, image, target),
      )
      .await;

      match transfer {
        Ok(Ok(data)) => {
          let expected =
            &entry.chunk_hashes[target as usize];
          let actual = chunks::chunk_hash(&data);
          if actual != *expected {
            warn!(
              "chunk {target} of {image} from {peer} failed verification, dropping peer for this image"
            );
            let strikes = consecutive_mismatches
              .entry(peer.to_string())
              .or_insert(0);
            *strikes += 1;
            if *strikes >= 3 {
              state::blacklist_peer(peer);
            }
            dropped.insert(peer.to_string());
            continue;
          }
          consecutive_mismatches.remove(peer);
          let path =
            chunks::chunk_path(&self.work, image, target);
          if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
          }
          tokio::fs::write(&path, &data)
            .await
            .with_context(|| {
              format!("failed to persist chunk {target}")
            })?;
          held.insert(target);
          self.announce_held(image, &held).await?;
        }
        Ok(Err(e)) => {
          debug!(
            "chunk {target} of {image} from {peer} failed, demoting | {e:#}"
          );
          dropped.insert(peer.to_string());
        }
        Err(_elapsed) => {
          warn!(
            "chunk {target} of {image} from {peer} stalled past {:?}, demoting",
            self.stall_timeout
          );
          dropped.insert(peer.to_string());
        }
      }
    }
  }

  /// Fewest active uploads wins; ties break deterministically
  /// from the node id and chunk index.
  fn choose_peer<'h>(
    &self,
    eligible: &[(&'h str, &'h HolderRecord)],
    target: u32,
  ) -> Option<(&'h str, &'h HolderRecord)> {
    let min_uploads = eligible
      .iter()
      .map(|(_, holder)| holder.active_uploads)
      .min()?;
    let ties: Vec<&(&str, &HolderRecord)> = eligible
      .iter()
      .filter(|(_, holder)| {
        holder.active_uploads == min_uploads
      })
      .collect();
    let mut seed_hasher = Sha256::new();
    seed_hasher.update(self.node_id.as_bytes());
    seed_hasher.update(target.to_be_bytes());
    let seed = u64::from_be_bytes(
      seed_hasher.finalize()[..8]
        .try_into()
        .expect("sha256 yields at least 8 bytes"),
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let pick = rng.random_range(0..ties.len());
    Some(*ties[pick])
  }

  async fn transfer_chunk(
    &self,
    address: &str,
    image: &str,
    index: u32,
  ) -> anyhow::Result<Vec<u8>> {
    let mut channel =
      SecureChannel::connect(address, &self.pool_secret)
        .await?;
    channel
      .send(&PeerRequest::Chunk {
        image: image.to_string(),
        index,
      })
      .await?;
    let response: PeerResponse = channel
      .recv()
      .await?
      .context("peer closed before responding")?;
    match response {
      PeerResponse::Chunk { len, .. } => {
        let data = channel
          .recv_payload()
          .await?
          .context("peer closed before sending chunk")?;
        if data.len() as u64 != len {
          return Err(anyhow!(
            "peer sent {} bytes, announced {len}",
            data.len()
          ));
        }
        Ok(data)
      }
      PeerResponse::NotAvailable { reason } => {
        Err(anyhow!("peer cannot serve chunk | {reason}"))
      }
    }
  }

  async fn announce_held(
    &self,
    image: &str,
    held: &BTreeSet<u32>,
  ) -> anyhow::Result<()> {
    let node_id = self.node_id.clone();
    let advertise = self.advertise.clone();
    let held: Vec<u32> = held.iter().copied().collect();
    self
      .tracker
      .update(image, move |entry| {
        let total = entry.chunk_hashes.len();
        let holder = entry
          .holders
          .entry(node_id)
          .or_insert_with(|| HolderRecord {
            address: advertise,
            ..Default::default()
          });
        holder.seed = held.len() == total;
        holder.chunks = held;
        holder.updated_at =
          armada_client::entities::armada_timestamp();
      })
      .await?;
    Ok(())
  }

  async fn discard_partial(
    &self,
    image: &str,
    held: &BTreeSet<u32>,
  ) {
    for index in held {
      let path =
        chunks::chunk_path(&self.work, image, *index);
      let _ = tokio::fs::remove_file(path).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  const SECRET: &str = "pool-secret";

  /// Minimal serving peer: answers chunk requests from its own
  /// chunk directory, optionally corrupting payloads.
  async fn spawn_peer(
    work: PathBuf,
    corrupt: bool,
  ) -> String {
    let listener =
      TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          return;
        };
        let work = work.clone();
        tokio::spawn(async move {
          let Ok(mut channel) =
            SecureChannel::accept(stream, SECRET).await
          else {
            return;
          };
          while let Ok(Some(PeerRequest::Chunk {
            image,
            index,
          })) = channel.recv::<PeerRequest>().await
          {
            let path =
              chunks::chunk_path(&work, &image, index);
            let mut data =
              tokio::fs::read(&path).await.unwrap();
            if corrupt {
              data[0] ^= 0xff;
            }
            channel
              .send(&PeerResponse::Chunk {
                index,
                hash: chunks::chunk_hash(&data),
                len: data.len() as u64,
              })
              .await
              .unwrap();
            channel.send_payload(&data).await.unwrap();
          }
        });
      }
    });
    addr
  }

  async fn seed_tracker_and_chunks(
    root: &std::path::Path,
    seed_work: &std::path::Path,
    image: &str,
    payload: &[u8],
    seed_addr: &str,
  ) -> (Tracker, Vec<String>) {
    let archive = seed_work.join("image.tar");
    tokio::fs::write(&archive, payload).await.unwrap();
    let hashes =
      chunks::split(seed_work, image, &archive, 1024)
        .await
        .unwrap();
    let tracker = Tracker::new(root, "pool-a");
    let chunk_indexes: Vec<u32> =
      (0..hashes.len() as u32).collect();
    let hashes_clone = hashes.clone();
    let seed_addr = seed_addr.to_string();
    tracker
      .update(image, move |entry| {
        entry.chunk_hashes = hashes_clone;
        entry.compressed = false;
        entry.holders.insert(
          "seed-node".to_string(),
          HolderRecord {
            address: seed_addr,
            chunks: chunk_indexes,
            seed: true,
            active_uploads: 0,
            updated_at: 0,
          },
        );
      })
      .await
      .unwrap();
    (tracker, hashes)
  }

  fn fetcher<'a>(
    tracker: &'a Tracker,
    work: PathBuf,
  ) -> Fetcher<'a> {
    Fetcher {
      tracker,
      work,
      node_id: "follower-node".to_string(),
      advertise: "127.0.0.1:9".to_string(),
      pool_secret: SECRET.to_string(),
      stall_timeout: Duration::from_secs(5),
      source_limit: 1,
    }
  }

  #[tokio::test]
  async fn follower_fetches_verifies_and_becomes_seed() {
    let meta = tempfile::tempdir().unwrap();
    let seed_work = tempfile::tempdir().unwrap();
    let follower_work = tempfile::tempdir().unwrap();
    let payload: Vec<u8> =
      (0..5_000).map(|i| (i % 241) as u8).collect();

    let seed_addr =
      spawn_peer(seed_work.path().to_path_buf(), false).await;
    let (tracker, _hashes) = seed_tracker_and_chunks(
      meta.path(),
      seed_work.path(),
      "app:1",
      &payload,
      &seed_addr,
    )
    .await;

    let fetcher = fetcher(
      &tracker,
      follower_work.path().to_path_buf(),
    );
    let stop = CancellationToken::new();
    let outcome =
      fetcher.follow(&stop, "app:1").await.unwrap();
    let FetchOutcome::Complete { archive } = outcome else {
      panic!("expected completion, got {outcome:?}");
    };
    let fetched = tokio::fs::read(&archive).await.unwrap();
    assert_eq!(fetched, payload);

    // Completion promotes the follower to seed in the tracker.
    let entry =
      tracker.read("app:1").await.unwrap().unwrap();
    assert!(entry.holders["follower-node"].seed);
  }

  #[tokio::test]
  async fn corrupt_chunks_drop_peer_then_claim_source() {
    let meta = tempfile::tempdir().unwrap();
    let seed_work = tempfile::tempdir().unwrap();
    let follower_work = tempfile::tempdir().unwrap();
    let payload = vec![9u8; 2_048];

    // The only peer always corrupts chunk payloads.
    let seed_addr =
      spawn_peer(seed_work.path().to_path_buf(), true).await;
    let (tracker, _) = seed_tracker_and_chunks(
      meta.path(),
      seed_work.path(),
      "app:1",
      &payload,
      &seed_addr,
    )
    .await;

    let fetcher = fetcher(
      &tracker,
      follower_work.path().to_path_buf(),
    );
    let stop = CancellationToken::new();
    // With its single peer dropped, the follower claims the
    // free origin slot and promotes itself.
    let outcome =
      fetcher.follow(&stop, "app:1").await.unwrap();
    assert_eq!(outcome, FetchOutcome::BecomeSeed);
  }

  #[tokio::test]
  async fn corrupt_tracker_falls_back_to_direct_pull() {
    let meta = tempfile::tempdir().unwrap();
    let follower_work = tempfile::tempdir().unwrap();
    let tracker = Tracker::new(meta.path(), "pool-a");
    // Corrupt entry on disk.
    let dir = meta.path().join("pool-pool-a").join("images");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("app_1.json"), b"{oops")
      .await
      .unwrap();

    let fetcher = fetcher(
      &tracker,
      follower_work.path().to_path_buf(),
    );
    let stop = CancellationToken::new();
    let outcome =
      fetcher.follow(&stop, "app:1").await.unwrap();
    assert_eq!(outcome, FetchOutcome::DirectPull);
  }

  #[tokio::test]
  async fn no_seed_claims_origin_slot() {
    let meta = tempfile::tempdir().unwrap();
    let follower_work = tempfile::tempdir().unwrap();
    let tracker = Tracker::new(meta.path(), "pool-a");

    let fetcher = fetcher(
      &tracker,
      follower_work.path().to_path_buf(),
    );
    let stop = CancellationToken::new();
    let outcome =
      fetcher.follow(&stop, "app:1").await.unwrap();
    assert_eq!(outcome, FetchOutcome::BecomeSeed);
  }
}
