//! Per-pool image distribution planning.
//!
//! Decides, for every image in the preload set, whether nodes
//! pull straight from the origin registry, from a private
//! mirror, or through the peer-to-peer replication protocol
//! with a designated seed set. The plan is exported to nodes
//! through start task environment, where the replicator agent
//! picks it up.

use armada_client::entities::{
  Environment,
  image::{DataReplication, PrivateMirror},
  pool::{Node, PoolSpec},
};
use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq)]
pub enum ImageStrategy {
  /// Every node pulls from the private mirror.
  Mirror { domain: String },
  /// Every node pulls from the origin registry, bounded by the
  /// concurrent source download counter.
  Direct,
  /// Seed nodes pull from origin and serve chunks to the rest.
  PeerToPeer {
    seeds: Vec<String>,
    compression: bool,
  },
}

#[derive(Debug, Clone)]
pub struct DistributionPlan {
  /// Strategy per image, in preload (fetch) order.
  pub per_image: IndexMap<String, ImageStrategy>,
  pub concurrent_source_downloads: u32,
}

/// Builds the distribution plan for a pool. Seed selection is
/// deterministic: nodes sort by id and each image's seed window
/// rotates through them so seeding load spreads across the
/// pool.
pub fn plan(
  pool: &PoolSpec,
  nodes: &[Node],
  replication: &DataReplication,
  mirror: Option<&PrivateMirror>,
) -> DistributionPlan {
  let mut node_ids: Vec<String> =
    nodes.iter().map(|node| node.id.clone()).collect();
  node_ids.sort();

  let p2p = &replication.peer_to_peer;
  let mut per_image = IndexMap::new();
  for (index, image) in pool.preload_images.iter().enumerate() {
    let strategy = if !p2p.enabled {
      match mirror {
        Some(mirror) => ImageStrategy::Mirror {
          domain: mirror.domain.clone(),
        },
        None => ImageStrategy::Direct,
      }
    } else {
      let seed_count = (p2p.direct_download_seed_bias as usize)
        .min(node_ids.len());
      if seed_count == 0 || node_ids.len() <= seed_count {
        ImageStrategy::Direct
      } else {
        let start =
          (index * seed_count) % node_ids.len();
        let seeds = (0..seed_count)
          .map(|offset| {
            node_ids[(start + offset) % node_ids.len()].clone()
          })
          .collect();
        ImageStrategy::PeerToPeer {
          seeds,
          compression: p2p.compression,
        }
      }
    };
    per_image.insert(image.clone(), strategy);
  }

  DistributionPlan {
    per_image,
    concurrent_source_downloads: replication
      .concurrent_source_downloads,
  }
}

impl DistributionPlan {
  /// Drop a failed seed. The image degrades to direct pull once
  /// no seed remains.
  pub fn degrade_seed(&mut self, image: &str, failed_seed: &str) {
    let Some(strategy) = self.per_image.get_mut(image) else {
      return;
    };
    if let ImageStrategy::PeerToPeer { seeds, .. } = strategy {
      seeds.retain(|seed| seed != failed_seed);
      if seeds.is_empty() {
        *strategy = ImageStrategy::Direct;
      }
    }
  }

  /// Environment exported into every node's start task. The
  /// replicator reads its role and bounds from here.
  pub fn start_task_environment(
    &self,
    node_id: &str,
  ) -> Environment {
    let mut env = Environment::new();
    env.insert(
      "ARMADA_CONCURRENT_SOURCE_DOWNLOADS".to_string(),
      self.concurrent_source_downloads.to_string(),
    );
    env.insert(
      "ARMADA_PRELOAD_IMAGES".to_string(),
      self
        .per_image
        .keys()
        .cloned()
        .collect::<Vec<_>>()
        .join(","),
    );
    let seed_images: Vec<&str> = self
      .per_image
      .iter()
      .filter_map(|(image, strategy)| match strategy {
        ImageStrategy::PeerToPeer { seeds, .. }
          if seeds.iter().any(|seed| seed == node_id) =>
        {
          Some(image.as_str())
        }
        _ => None,
      })
      .collect();
    env.insert(
      "ARMADA_P2P_SEED_IMAGES".to_string(),
      seed_images.join(","),
    );
    let compressed = self
      .per_image
      .values()
      .any(|strategy| matches!(
        strategy,
        ImageStrategy::PeerToPeer { compression: true, .. }
      ));
    env.insert(
      "ARMADA_P2P_COMPRESSION".to_string(),
      if compressed { "1" } else { "0" }.to_string(),
    );
    env
  }
}

/// Ready barrier predicate: every preload image present on
/// every node. Native pools waive the barrier.
pub fn all_images_present(
  pool: &PoolSpec,
  nodes: &[Node],
) -> bool {
  if pool.native {
    return true;
  }
  pool.preload_images.iter().all(|image| {
    nodes.iter().all(|node| {
      node.images_present.iter().any(|present| present == image)
    })
  })
}
