use super::{ObjectStoreError, ObjectStoreResult, PartitionableObjectStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory object store.
///
/// This is useful for testing or scenarios where persistence across restarts
/// is not required. Cloning shares the underlying partitions.
#[derive(Debug, Clone)]
pub struct InMemoryObjectStore<V> {
  partitions: Arc<RwLock<HashMap<String, HashMap<String, V>>>>,
}

impl<V> Default for InMemoryObjectStore<V> {
  fn default() -> Self {
    Self {
      partitions: Arc::new(RwLock::new(HashMap::new())),
    }
  }
}

impl<V> InMemoryObjectStore<V> {
  /// Creates an empty in-memory store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the number of entries in a partition.
  pub fn len(&self, partition: &str) -> usize {
    self
      .partitions
      .read()
      .map(|p| p.get(partition).map_or(0, HashMap::len))
      .unwrap_or(0)
  }

  /// Returns true if a partition holds no entries.
  pub fn is_empty(&self, partition: &str) -> bool {
    self.len(partition) == 0
  }
}

impl<V> PartitionableObjectStore<V> for InMemoryObjectStore<V>
where
  V: Clone + Send + Sync + std::fmt::Debug,
{
  fn store(&self, key: &str, value: V, partition: &str) -> ObjectStoreResult<()> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    let entries = partitions.entry(partition.to_string()).or_default();
    if entries.contains_key(key) {
      return Err(ObjectStoreError::already_exists(key, partition));
    }
    entries.insert(key.to_string(), value);
    Ok(())
  }

  fn update(&self, key: &str, value: V, partition: &str) -> ObjectStoreResult<()> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    match partitions.get_mut(partition).and_then(|p| p.get_mut(key)) {
      Some(slot) => {
        *slot = value;
        Ok(())
      }
      None => Err(ObjectStoreError::does_not_exist(key, partition)),
    }
  }

  fn retrieve(&self, key: &str, partition: &str) -> ObjectStoreResult<V> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    partitions
      .get(partition)
      .and_then(|p| p.get(key))
      .cloned()
      .ok_or_else(|| ObjectStoreError::does_not_exist(key, partition))
  }

  fn remove(&self, key: &str, partition: &str) -> ObjectStoreResult<V> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    partitions
      .get_mut(partition)
      .and_then(|p| p.remove(key))
      .ok_or_else(|| ObjectStoreError::does_not_exist(key, partition))
  }

  fn contains(&self, key: &str, partition: &str) -> ObjectStoreResult<bool> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    Ok(partitions.get(partition).is_some_and(|p| p.contains_key(key)))
  }

  fn all_keys(&self, partition: &str) -> ObjectStoreResult<Vec<String>> {
    let partitions = self
      .partitions
      .read()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    Ok(
      partitions
        .get(partition)
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn clear(&self, partition: &str) -> ObjectStoreResult<()> {
    let mut partitions = self
      .partitions
      .write()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    partitions.remove(partition);
    Ok(())
  }
}
