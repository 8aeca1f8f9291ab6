//! Explicit transaction scoping.
//!
//! A [`TransactionContext`] is created per execution scope and passed to the
//! code that needs it. At most one transaction is bound to a context at a
//! time. Every transition fires a
//! [`TransactionNotification`](crate::notification::TransactionNotification).
//!
//! ```rust
//! use eventweave::notification::NotificationDispatcher;
//! use eventweave::transaction::{execute_in_transaction, TransactionContext, TransactionError};
//!
//! # async fn example() -> Result<(), TransactionError> {
//! let context = TransactionContext::new(NotificationDispatcher::default());
//! let value = execute_in_transaction(&context, || async { Ok::<_, TransactionError>(42) }).await?;
//! assert_eq!(value, 42);
//! assert!(context.bound().await.is_none());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::notification::{NotificationDispatcher, TransactionNotification};

/// Unique identifier for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
  /// Returns the underlying ID value.
  pub const fn value(&self) -> u64 {
    self.0
  }
}

impl Display for TransactionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "tx:{}", self.0)
  }
}

/// Error type for transaction operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
  /// A transaction is already bound to the context.
  AlreadyBound(TransactionId),
  /// No transaction is bound to the context.
  NoTransaction,
  /// The transaction was marked rollback-only and has been rolled back.
  RollbackOnly(TransactionId),
}

impl Display for TransactionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TransactionError::AlreadyBound(id) => {
        write!(f, "Transaction {} is already bound to this context", id)
      }
      TransactionError::NoTransaction => write!(f, "No transaction bound to this context"),
      TransactionError::RollbackOnly(id) => {
        write!(f, "Transaction {} was marked rollback-only and rolled back", id)
      }
    }
  }
}

impl std::error::Error for TransactionError {}

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Debug)]
struct Transaction {
  id: TransactionId,
  started_at: Instant,
  rollback_only: bool,
  metadata: HashMap<String, String>,
}

/// Holds the transaction bound to one execution scope.
#[derive(Debug)]
pub struct TransactionContext {
  next_id: AtomicU64,
  bound: Mutex<Option<Transaction>>,
  notifications: NotificationDispatcher,
}

impl Default for TransactionContext {
  fn default() -> Self {
    Self::new(NotificationDispatcher::default())
  }
}

impl TransactionContext {
  /// Creates a context with no bound transaction.
  pub fn new(notifications: NotificationDispatcher) -> Self {
    Self {
      next_id: AtomicU64::new(1),
      bound: Mutex::new(None),
      notifications,
    }
  }

  /// Begins a transaction and binds it to this context.
  pub async fn begin(&self) -> TransactionResult<TransactionId> {
    let mut bound = self.bound.lock().await;
    if let Some(current) = bound.as_ref() {
      return Err(TransactionError::AlreadyBound(current.id));
    }
    let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    *bound = Some(Transaction {
      id,
      started_at: Instant::now(),
      rollback_only: false,
      metadata: HashMap::new(),
    });
    debug!(transaction = %id, "transaction began");
    self.notifications.fire(TransactionNotification::Began {
      transaction_id: id.value(),
    });
    Ok(id)
  }

  /// Returns the id of the bound transaction, if any.
  pub async fn bound(&self) -> Option<TransactionId> {
    self.bound.lock().await.as_ref().map(|t| t.id)
  }

  /// Returns how long the bound transaction has been running.
  pub async fn elapsed(&self) -> Option<Duration> {
    self.bound.lock().await.as_ref().map(|t| t.started_at.elapsed())
  }

  /// Marks the bound transaction so that `commit` rolls it back instead.
  pub async fn set_rollback_only(&self) -> TransactionResult<()> {
    let mut bound = self.bound.lock().await;
    let transaction = bound.as_mut().ok_or(TransactionError::NoTransaction)?;
    transaction.rollback_only = true;
    Ok(())
  }

  /// Returns true if the bound transaction is marked rollback-only.
  pub async fn is_rollback_only(&self) -> bool {
    self
      .bound
      .lock()
      .await
      .as_ref()
      .is_some_and(|t| t.rollback_only)
  }

  /// Sets custom metadata on the bound transaction.
  pub async fn set_metadata(
    &self,
    key: impl Into<String>,
    value: impl Into<String>,
  ) -> TransactionResult<()> {
    let mut bound = self.bound.lock().await;
    let transaction = bound.as_mut().ok_or(TransactionError::NoTransaction)?;
    transaction.metadata.insert(key.into(), value.into());
    Ok(())
  }

  /// Gets custom metadata from the bound transaction.
  pub async fn metadata(&self, key: &str) -> Option<String> {
    self
      .bound
      .lock()
      .await
      .as_ref()
      .and_then(|t| t.metadata.get(key).cloned())
  }

  /// Commits and unbinds the bound transaction.
  ///
  /// A rollback-only transaction is rolled back and
  /// [`TransactionError::RollbackOnly`] is returned.
  pub async fn commit(&self) -> TransactionResult<TransactionId> {
    let transaction = self
      .bound
      .lock()
      .await
      .take()
      .ok_or(TransactionError::NoTransaction)?;
    let id = transaction.id;
    if transaction.rollback_only {
      self.rolled_back(id);
      return Err(TransactionError::RollbackOnly(id));
    }
    debug!(transaction = %id, elapsed = ?transaction.started_at.elapsed(), "transaction committed");
    self.notifications.fire(TransactionNotification::Committed {
      transaction_id: id.value(),
    });
    Ok(id)
  }

  /// Rolls back and unbinds the bound transaction.
  pub async fn rollback(&self) -> TransactionResult<TransactionId> {
    let transaction = self
      .bound
      .lock()
      .await
      .take()
      .ok_or(TransactionError::NoTransaction)?;
    self.rolled_back(transaction.id);
    Ok(transaction.id)
  }

  fn rolled_back(&self, id: TransactionId) {
    debug!(transaction = %id, "transaction rolled back");
    self.notifications.fire(TransactionNotification::RolledBack {
      transaction_id: id.value(),
    });
  }
}

/// Runs `work` inside a transaction bound to `context`.
///
/// If a transaction is already bound, `work` joins it and the caller that
/// began it stays responsible for completing it. Otherwise a new transaction
/// is begun, committed when `work` succeeds and rolled back when it fails.
pub async fn execute_in_transaction<T, E, F, Fut>(
  context: &TransactionContext,
  work: F,
) -> Result<T, E>
where
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: From<TransactionError>,
{
  if context.bound().await.is_some() {
    return work().await;
  }
  context.begin().await?;
  match work().await {
    Ok(value) => {
      context.commit().await?;
      Ok(value)
    }
    Err(error) => {
      if let Err(e) = context.rollback().await {
        warn!(error = %e, "rollback after failed work did not complete");
      }
      Err(error)
    }
  }
}
