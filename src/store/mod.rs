//! Partitioned key/value persistence for in-flight correlation state.
//!
//! The correlator never keeps groups only in memory: every create, update and
//! removal goes through a [`PartitionableObjectStore`]. Implementations must make
//! each single-key operation atomic; the correlator adds per-key locking on top
//! so that read-modify-write sequences on one group id are serialized.
//!
//! Two backends are provided:
//!
//! - [`InMemoryObjectStore`]: process-local, for tests and single-node use
//! - [`FileObjectStore`]: one JSON document per partition, survives restarts

mod file;
mod memory;


pub use file::FileObjectStore;
pub use memory::InMemoryObjectStore;

use std::io;
use thiserror::Error;

/// Error type for object store operations.
#[derive(Error, Debug)]
pub enum ObjectStoreError {
  /// No value is stored under the key.
  #[error("no object stored for key '{key}' in partition '{partition}'")]
  DoesNotExist {
    /// Requested key.
    key: String,
    /// Requested partition.
    partition: String,
  },
  /// A value is already stored under the key.
  #[error("an object is already stored for key '{key}' in partition '{partition}'")]
  AlreadyExists {
    /// Conflicting key.
    key: String,
    /// Partition of the key.
    partition: String,
  },
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(String),
  /// I/O error from a persistent backend.
  #[error("io error: {0}")]
  Io(#[from] io::Error),
  /// Lock acquisition failed.
  #[error("lock error: {0}")]
  Lock(String),
  /// The store is temporarily unavailable.
  #[error("object store unavailable: {0}")]
  Unavailable(String),
}

impl ObjectStoreError {
  /// Creates a [`ObjectStoreError::DoesNotExist`].
  pub fn does_not_exist(key: &str, partition: &str) -> Self {
    ObjectStoreError::DoesNotExist {
      key: key.to_string(),
      partition: partition.to_string(),
    }
  }

  /// Creates a [`ObjectStoreError::AlreadyExists`].
  pub fn already_exists(key: &str, partition: &str) -> Self {
    ObjectStoreError::AlreadyExists {
      key: key.to_string(),
      partition: partition.to_string(),
    }
  }

  /// Returns true if this error reports a missing key.
  pub fn is_does_not_exist(&self) -> bool {
    matches!(self, ObjectStoreError::DoesNotExist { .. })
  }
}

/// Result type for object store operations.
pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Trait for partitioned object store backends.
///
/// Keys are scoped by partition: the same key may exist independently in two
/// partitions. Operations are synchronous and expected to be fast.
pub trait PartitionableObjectStore<V>: Send + Sync + std::fmt::Debug {
  /// Stores a value under a key that must not exist yet.
  ///
  /// Fails with [`ObjectStoreError::AlreadyExists`] if the key is present.
  fn store(&self, key: &str, value: V, partition: &str) -> ObjectStoreResult<()>;

  /// Replaces the value stored under an existing key.
  ///
  /// Fails with [`ObjectStoreError::DoesNotExist`] if the key is absent.
  fn update(&self, key: &str, value: V, partition: &str) -> ObjectStoreResult<()>;

  /// Retrieves the value stored under a key.
  ///
  /// Fails with [`ObjectStoreError::DoesNotExist`] if the key is absent.
  fn retrieve(&self, key: &str, partition: &str) -> ObjectStoreResult<V>;

  /// Removes and returns the value stored under a key.
  ///
  /// Fails with [`ObjectStoreError::DoesNotExist`] if the key is absent.
  fn remove(&self, key: &str, partition: &str) -> ObjectStoreResult<V>;

  /// Returns true if a value is stored under the key.
  fn contains(&self, key: &str, partition: &str) -> ObjectStoreResult<bool>;

  /// Lists every key of a partition.
  fn all_keys(&self, partition: &str) -> ObjectStoreResult<Vec<String>>;

  /// Removes every key of a partition.
  fn clear(&self, partition: &str) -> ObjectStoreResult<()>;
}
