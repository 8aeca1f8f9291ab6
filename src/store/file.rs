use super::{ObjectStoreError, ObjectStoreResult, PartitionableObjectStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// File-based object store.
///
/// Each partition is persisted as `<base>/<partition>.json`, a JSON object
/// mapping keys to values. Partitions are loaded on first access and rewritten
/// after every mutation, so a restarted process sees every group that was in
/// flight when it stopped.
#[derive(Debug, Clone)]
pub struct FileObjectStore<V> {
  base_path: PathBuf,
  cache: Arc<RwLock<HashMap<String, HashMap<String, V>>>>,
}

impl<V> FileObjectStore<V>
where
  V: Serialize + DeserializeOwned + Clone,
{
  /// Creates a store rooted at `base_path`, creating the directory if needed.
  pub fn new<P: AsRef<Path>>(base_path: P) -> ObjectStoreResult<Self> {
    let base_path = base_path.as_ref().to_path_buf();
    fs::create_dir_all(&base_path)?;
    Ok(Self {
      base_path,
      cache: Arc::new(RwLock::new(HashMap::new())),
    })
  }

  /// Returns the directory holding the partition files.
  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn partition_path(&self, partition: &str) -> PathBuf {
    let safe_name =
      partition.replace(|c: char| !c.is_alphanumeric() && c != '_' && c != '-' && c != '.', "_");
    self.base_path.join(format!("{}.json", safe_name))
  }

  fn load_partition(&self, partition: &str) -> ObjectStoreResult<HashMap<String, V>> {
    let path = self.partition_path(partition);
    if !path.exists() {
      return Ok(HashMap::new());
    }
    let data = fs::read_to_string(&path)?;
    if data.trim().is_empty() {
      return Ok(HashMap::new());
    }
    serde_json::from_str(&data).map_err(|e| ObjectStoreError::Serialization(e.to_string()))
  }

  fn persist(&self, partition: &str, entries: &HashMap<String, V>) -> ObjectStoreResult<()> {
    let path = self.partition_path(partition);
    let data = serde_json::to_string_pretty(entries)
      .map_err(|e| ObjectStoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &path)?;
    trace!(partition, entries = entries.len(), "persisted partition");
    Ok(())
  }

  /// Runs `f` against the cached partition, loading it from disk first if needed.
  ///
  /// `f` works on a copy. The copy replaces the cached partition only once it
  /// has been written to disk, so a failed write leaves cache and file in
  /// agreement.
  fn with_partition_mut<R>(
    &self,
    partition: &str,
    f: impl FnOnce(&mut HashMap<String, V>) -> ObjectStoreResult<(R, bool)>,
  ) -> ObjectStoreResult<R> {
    let mut cache = self
      .cache
      .write()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    if !cache.contains_key(partition) {
      let loaded = self.load_partition(partition)?;
      cache.insert(partition.to_string(), loaded);
    }
    let mut entries = cache
      .get(partition)
      .cloned()
      .ok_or_else(|| ObjectStoreError::Lock(format!("partition '{}' vanished", partition)))?;
    let (result, dirty) = f(&mut entries)?;
    if dirty {
      self.persist(partition, &entries)?;
      cache.insert(partition.to_string(), entries);
    }
    Ok(result)
  }

  /// Runs a read-only `f` against the cached partition.
  fn with_partition<R>(
    &self,
    partition: &str,
    f: impl FnOnce(&HashMap<String, V>) -> ObjectStoreResult<R>,
  ) -> ObjectStoreResult<R> {
    {
      let cache = self
        .cache
        .read()
        .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
      if let Some(entries) = cache.get(partition) {
        return f(entries);
      }
    }
    let mut cache = self
      .cache
      .write()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    if !cache.contains_key(partition) {
      let loaded = self.load_partition(partition)?;
      cache.insert(partition.to_string(), loaded);
    }
    let entries = cache
      .get(partition)
      .ok_or_else(|| ObjectStoreError::Lock(format!("partition '{}' vanished", partition)))?;
    f(entries)
  }
}

impl<V> PartitionableObjectStore<V> for FileObjectStore<V>
where
  V: Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug,
{
  fn store(&self, key: &str, value: V, partition: &str) -> ObjectStoreResult<()> {
    self.with_partition_mut(partition, |entries| {
      if entries.contains_key(key) {
        return Err(ObjectStoreError::already_exists(key, partition));
      }
      entries.insert(key.to_string(), value);
      Ok(((), true))
    })
  }

  fn update(&self, key: &str, value: V, partition: &str) -> ObjectStoreResult<()> {
    self.with_partition_mut(partition, |entries| match entries.get_mut(key) {
      Some(slot) => {
        *slot = value;
        Ok(((), true))
      }
      None => Err(ObjectStoreError::does_not_exist(key, partition)),
    })
  }

  fn retrieve(&self, key: &str, partition: &str) -> ObjectStoreResult<V> {
    self.with_partition(partition, |entries| {
      entries
        .get(key)
        .cloned()
        .ok_or_else(|| ObjectStoreError::does_not_exist(key, partition))
    })
  }

  fn remove(&self, key: &str, partition: &str) -> ObjectStoreResult<V> {
    self.with_partition_mut(partition, |entries| {
      entries
        .remove(key)
        .map(|v| (v, true))
        .ok_or_else(|| ObjectStoreError::does_not_exist(key, partition))
    })
  }

  fn contains(&self, key: &str, partition: &str) -> ObjectStoreResult<bool> {
    self.with_partition(partition, |entries| Ok(entries.contains_key(key)))
  }

  fn all_keys(&self, partition: &str) -> ObjectStoreResult<Vec<String>> {
    self.with_partition(partition, |entries| Ok(entries.keys().cloned().collect()))
  }

  fn clear(&self, partition: &str) -> ObjectStoreResult<()> {
    self.with_partition_mut(partition, |entries| {
      let dirty = !entries.is_empty();
      entries.clear();
      Ok(((), dirty))
    })
  }
}
