use std::{collections::HashMap, hash::Hash};

use tokio::sync::RwLock;

/// Async map of cloneable values behind an RwLock.
/// Backs the in-memory state the server keeps between scans:
/// per-host scan locks, anomaly observation windows, failure counters.
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

impl<K: PartialEq + Eq + Hash + std::fmt::Debug + Clone, T: Clone>
  CloneCache<K, T>
{
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

  pub async fn retain(&self, keep: impl FnMut(&K, &mut T) -> bool) {
    self.0.write().await.retain(keep);
  }
}

impl<
  K: PartialEq + Eq + Hash + std::fmt::Debug + Clone,
  T: Clone + Default,
> CloneCache<K, T>
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

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn insert_get_remove() {
    let cache = CloneCache::<i64, String>::default();
    assert!(cache.get(&1).await.is_none());
    cache.insert(1, String::from("a")).await;
    assert_eq!(cache.get(&1).await.as_deref(), Some("a"));
    cache.remove(&1).await;
    assert!(cache.get(&1).await.is_none());
  }

  #[tokio::test]
  async fn retain_drops_entries() {
    let cache = CloneCache::<i64, i64>::default();
    for i in 0..5 {
      cache.insert(i, i * 10).await;
    }
    cache.retain(|k, _| *k % 2 == 0).await;
    let mut keys = cache.get_keys().await;
    keys.sort_unstable();
    assert_eq!(keys, vec![0, 2, 4]);
  }
}
