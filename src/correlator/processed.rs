use crate::store::{ObjectStoreError, ObjectStoreResult, PartitionableObjectStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Record of a finalized group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedGroup {
  /// Finalized group id.
  pub group_id: String,
  /// When the group was aggregated or expired.
  pub processed_at: DateTime<Utc>,
}

/// Bounded FIFO of finalized group ids backed by an object store.
///
/// Eviction order is kept in memory and rebuilt from the stored timestamps the
/// first time the FIFO is touched, so a restarted node evicts in the same order.
#[derive(Debug)]
pub struct ProcessedGroups {
  store: Arc<dyn PartitionableObjectStore<ProcessedGroup>>,
  partition: String,
  capacity: usize,
  order: Mutex<Option<VecDeque<String>>>,
}

impl ProcessedGroups {
  /// Creates a FIFO over `partition` of `store` holding at most `capacity` ids.
  pub fn new(
    store: Arc<dyn PartitionableObjectStore<ProcessedGroup>>,
    partition: String,
    capacity: usize,
  ) -> Self {
    Self {
      store,
      partition,
      capacity: capacity.max(1),
      order: Mutex::new(None),
    }
  }

  /// Returns true if the group id was finalized and not yet evicted.
  pub fn contains(&self, group_id: &str) -> ObjectStoreResult<bool> {
    self.store.contains(group_id, &self.partition)
  }

  /// Records a finalized group id, evicting the oldest ids beyond capacity.
  pub fn add(&self, group_id: &str) -> ObjectStoreResult<()> {
    let mut order = self
      .order
      .lock()
      .map_err(|e| ObjectStoreError::Lock(e.to_string()))?;
    if order.is_none() {
      *order = Some(self.load_order()?);
    }
    let Some(order) = order.as_mut() else {
      return Err(ObjectStoreError::Lock("processed group order unavailable".to_string()));
    };

    let record = ProcessedGroup {
      group_id: group_id.to_string(),
      processed_at: Utc::now(),
    };
    match self.store.store(group_id, record.clone(), &self.partition) {
      Ok(()) => order.push_back(group_id.to_string()),
      Err(ObjectStoreError::AlreadyExists { .. }) => {
        self.store.update(group_id, record, &self.partition)?;
        order.retain(|id| id != group_id);
        order.push_back(group_id.to_string());
      }
      Err(e) => return Err(e),
    }

    while order.len() > self.capacity {
      if let Some(oldest) = order.pop_front() {
        debug!(group_id = %oldest, "evicting processed group");
        match self.store.remove(&oldest, &self.partition) {
          Ok(_) | Err(ObjectStoreError::DoesNotExist { .. }) => {}
          Err(e) => return Err(e),
        }
      }
    }
    Ok(())
  }

  /// Returns the number of ids currently remembered.
  pub fn len(&self) -> ObjectStoreResult<usize> {
    Ok(self.store.all_keys(&self.partition)?.len())
  }

  /// Returns true if no id is remembered.
  pub fn is_empty(&self) -> ObjectStoreResult<bool> {
    Ok(self.len()? == 0)
  }

  fn load_order(&self) -> ObjectStoreResult<VecDeque<String>> {
    let mut records = Vec::new();
    for key in self.store.all_keys(&self.partition)? {
      match self.store.retrieve(&key, &self.partition) {
        Ok(record) => records.push(record),
        Err(ObjectStoreError::DoesNotExist { .. }) => {}
        Err(e) => return Err(e),
      }
    }
    records.sort_by_key(|r| r.processed_at);
    Ok(records.into_iter().map(|r| r.group_id).collect())
  }
}
