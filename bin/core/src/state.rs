use std::sync::OnceLock;

use arc_swap::ArcSwap;
use cache::KeyedLocks;

use crate::credentials::CredentialStore;

/// Operations on the same pool serialize behind these locks;
/// distinct pools proceed in parallel.
pub fn pool_locks() -> &'static KeyedLocks<String> {
  static POOL_LOCKS: OnceLock<KeyedLocks<String>> = OnceLock::new();
  POOL_LOCKS.get_or_init(Default::default)
}

/// Most recently submitted job id, the observer's default
/// streaming target.
pub fn last_submitted_job() -> &'static ArcSwap<String> {
  static LAST_JOB: OnceLock<ArcSwap<String>> = OnceLock::new();
  LAST_JOB.get_or_init(Default::default)
}

static CREDENTIAL_STORE: OnceLock<CredentialStore> =
  OnceLock::new();

/// Must be called in the startup sequence before any engine
/// operation needs secrets.
pub fn init_credential_store(store: CredentialStore) {
  if CREDENTIAL_STORE.set(store).is_err() {
    error!(
      "FATAL: credential store initialized more than once | Exiting..."
    );
    std::process::exit(1)
  }
}

pub fn credential_store() -> &'static CredentialStore {
  CREDENTIAL_STORE.get().unwrap_or_else(|| {
    error!(
      "FATAL: credential store accessed before initialized | Ensure init_credential_store() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}
