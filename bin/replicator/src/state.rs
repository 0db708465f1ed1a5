use std::sync::{
  OnceLock,
  atomic::{AtomicU32, Ordering},
};

use dashmap::DashSet;

use crate::{config::replicator_config, tracker::Tracker};

pub fn tracker() -> &'static Tracker {
  static TRACKER: OnceLock<Tracker> = OnceLock::new();
  TRACKER.get_or_init(|| {
    let config = replicator_config();
    Tracker::new(
      config.metadata_directory.clone(),
      config.pool_id.clone(),
    )
  })
}

/// Chunk uploads currently in flight from this node.
pub fn active_uploads() -> &'static AtomicU32 {
  static ACTIVE_UPLOADS: OnceLock<AtomicU32> = OnceLock::new();
  ACTIVE_UPLOADS.get_or_init(|| AtomicU32::new(0))
}

/// Peers banned for the pool lifetime after repeated chunk
/// hash mismatches.
pub fn blacklist() -> &'static DashSet<String> {
  static BLACKLIST: OnceLock<DashSet<String>> = OnceLock::new();
  BLACKLIST.get_or_init(DashSet::new)
}

pub fn is_blacklisted(node_id: &str) -> bool {
  blacklist().contains(node_id)
}

pub fn blacklist_peer(node_id: &str) {
  warn!("blacklisting peer {node_id} for the pool lifetime");
  blacklist().insert(node_id.to_string());
}

/// Drops stale upload counters at shutdown so a restart starts
/// clean.
pub fn reset_upload_counter() {
  active_uploads().store(0, Ordering::SeqCst);
}
