use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, RwLock};

/// Async map cache handing out clones of its values.
#[derive(Debug)]
pub struct CloneCache<K: PartialEq + Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: PartialEq + Eq + Hash, T: Clone> Default
  for CloneCache<K, T>
{
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone> CloneCache<K, T> {
  pub async fn get(&self, key: &K) -> Option<T> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn get_keys(&self) -> Vec<K> {
    let cache = self.0.read().await;
    cache.keys().cloned().collect()
  }

  pub async fn get_entries(&self) -> Vec<(K, T)> {
    let cache = self.0.read().await;
    cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  pub async fn insert<Key>(&self, key: Key, val: T) -> Option<T>
  where
    Key: Into<K>,
  {
    self.0.write().await.insert(key.into(), val)
  }

  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }

  pub async fn update<R>(
    &self,
    key: K,
    update: impl FnOnce(&mut T) -> R,
  ) -> Option<R> {
    let mut cache = self.0.write().await;
    cache.get_mut(&key).map(update)
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone + Default>
  CloneCache<K, T>
{
  pub async fn get_or_insert_default(&self, key: &K) -> T {
    let mut lock = self.0.write().await;
    match lock.get(key).cloned() {
      Some(item) => item,
      None => {
        let item: T = Default::default();
        lock.insert(key.clone(), item.clone());
        item
      }
    }
  }
}

/// Registry of per-key async mutexes. Used to serialize
/// operations on the same pool while distinct pools proceed in
/// parallel, and to enforce FIFO per federation action group.
#[derive(Default)]
pub struct KeyedLocks<K: PartialEq + Eq + Hash + Clone>(
  CloneCache<K, Arc<Mutex<()>>>,
);

impl<K: PartialEq + Eq + Hash + Clone> KeyedLocks<K> {
  /// Returns the lock for the key, creating it on first use.
  /// Hold the guard for the duration of the keyed operation.
  pub async fn get(&self, key: &K) -> Arc<Mutex<()>> {
    self.0.get_or_insert_default(key).await
  }

  /// Drop the lock entry. Outstanding guards stay valid, new
  /// callers get a fresh lock.
  pub async fn remove(&self, key: &K) {
    self.0.remove(key).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn clone_cache_insert_get_remove() {
    let cache: CloneCache<String, u64> = Default::default();
    assert_eq!(cache.get(&"a".to_string()).await, None);
    cache.insert("a".to_string(), 1).await;
    assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    cache
      .update("a".to_string(), |value| *value += 1)
      .await
      .unwrap();
    assert_eq!(cache.remove(&"a".to_string()).await, Some(2));
  }

  #[tokio::test]
  async fn keyed_locks_serialize_same_key() {
    let locks: Arc<KeyedLocks<String>> = Default::default();
    let counter = Arc::new(Mutex::new(0u32));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let locks = locks.clone();
      let counter = counter.clone();
      handles.push(tokio::spawn(async move {
        let lock = locks.get(&"pool".to_string()).await;
        let _guard = lock.lock().await;
        let mut count = counter.lock().await;
        *count += 1;
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(*counter.lock().await, 8);
  }
}
