//! Cluster awareness for time-driven maintenance.
//!
//! In a clustered deployment only one node, the primary polling instance, runs
//! expiry sweeps. Everything else still correlates events but never expires
//! groups on its own.

use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether this node should run time-driven maintenance.
pub trait ClusterContext: Send + Sync + std::fmt::Debug {
  /// Returns true if this node is the primary polling instance.
  fn is_primary_polling_instance(&self) -> bool;
}

/// A node that is not part of a cluster and is therefore always primary.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneNode;

impl ClusterContext for StandaloneNode {
  fn is_primary_polling_instance(&self) -> bool {
    true
  }
}

/// Cluster membership whose primary status is flipped by an external
/// coordinator (e.g. a leader-election callback).
#[derive(Debug, Default)]
pub struct ClusterMembership {
  primary: AtomicBool,
}

impl ClusterMembership {
  /// Creates a membership with the given initial primary status.
  pub fn new(primary: bool) -> Self {
    Self {
      primary: AtomicBool::new(primary),
    }
  }

  /// Updates the primary status.
  pub fn set_primary(&self, primary: bool) {
    self.primary.store(primary, Ordering::SeqCst);
  }
}

impl ClusterContext for ClusterMembership {
  fn is_primary_polling_instance(&self) -> bool {
    self.primary.load(Ordering::SeqCst)
  }
}
