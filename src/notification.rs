//! Fire-and-forget lifecycle notifications.
//!
//! Correlators, requesters, retry templates and transaction contexts report
//! lifecycle transitions through a [`NotificationDispatcher`]. Delivery is
//! best-effort: firing never blocks and never fails, and a lagging listener
//! only loses its own backlog.

use futures::{Stream, StreamExt, future};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// Routing lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingNotification {
  /// A group completed and was aggregated.
  GroupAggregated {
    /// Aggregated group id.
    group_id: String,
    /// Number of members aggregated.
    members: usize,
  },
  /// A group expired before completing.
  CorrelationTimeout {
    /// Expired group id.
    group_id: String,
    /// Number of members received.
    members: usize,
  },
  /// An event arrived for a group that was already finalized.
  MissedAggregationGroup {
    /// Finalized group id.
    group_id: String,
  },
  /// A reply arrived with nobody waiting for it.
  MissedAsyncReply {
    /// Correlation id of the reply.
    correlation_id: String,
  },
  /// An async-reply wait timed out.
  AsyncReplyTimeout {
    /// Correlation id of the request.
    correlation_id: String,
  },
}

/// Transaction lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionNotification {
  /// A transaction was begun.
  Began {
    /// Transaction id.
    transaction_id: u64,
  },
  /// A transaction was committed.
  Committed {
    /// Transaction id.
    transaction_id: u64,
  },
  /// A transaction was rolled back.
  RolledBack {
    /// Transaction id.
    transaction_id: u64,
  },
}

/// Retry lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryNotification {
  /// An attempt failed and another one is scheduled.
  AttemptFailed {
    /// Attempt number, starting at 1.
    attempt: u32,
    /// Failure message.
    error: String,
  },
  /// The work succeeded after at least one failed attempt.
  Recovered {
    /// Number of attempts made.
    attempts: u32,
  },
  /// The policy gave up.
  Exhausted {
    /// Number of attempts made.
    attempts: u32,
  },
}

/// Any notification fired through the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
  /// Routing lifecycle.
  Routing(RoutingNotification),
  /// Transaction lifecycle.
  Transaction(TransactionNotification),
  /// Retry lifecycle.
  Retry(RetryNotification),
}

impl From<RoutingNotification> for Notification {
  fn from(n: RoutingNotification) -> Self {
    Notification::Routing(n)
  }
}

impl From<TransactionNotification> for Notification {
  fn from(n: TransactionNotification) -> Self {
    Notification::Transaction(n)
  }
}

impl From<RetryNotification> for Notification {
  fn from(n: RetryNotification) -> Self {
    Notification::Retry(n)
  }
}

/// Process-wide notification fan-out.
///
/// Cloning shares the same channel. Pass one dispatcher to every component of
/// an execution scope instead of reaching for global state.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
  sender: broadcast::Sender<Notification>,
}

impl Default for NotificationDispatcher {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

impl NotificationDispatcher {
  /// Creates a dispatcher buffering up to `capacity` notifications per listener.
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  /// Fires a notification. Dropped silently when nobody listens.
  pub fn fire(&self, notification: impl Into<Notification>) {
    let notification = notification.into();
    trace!(?notification, "firing notification");
    let _ = self.sender.send(notification);
  }

  /// Subscribes to every notification fired from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.sender.subscribe()
  }

  /// Subscribes as a stream. Notifications lost to lag are skipped.
  pub fn stream(&self) -> impl Stream<Item = Notification> + Send + 'static {
    BroadcastStream::new(self.subscribe()).filter_map(|received| {
      future::ready(match received {
        Ok(notification) => Some(notification),
        Err(e) => {
          warn!(error = %e, "notification stream lagged");
          None
        }
      })
    })
  }

  /// Returns the number of live subscriptions.
  pub fn listener_count(&self) -> usize {
    self.sender.receiver_count()
  }

  /// Registers an asynchronous listener running on its own task.
  ///
  /// The task ends when every dispatcher clone is dropped or the handle is
  /// aborted.
  pub fn register_listener<F, Fut>(&self, mut listener: F) -> JoinHandle<()>
  where
    F: FnMut(Notification) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut receiver = self.subscribe();
    tokio::spawn(async move {
      loop {
        match receiver.recv().await {
          Ok(notification) => listener(notification).await,
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "notification listener lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }
}
