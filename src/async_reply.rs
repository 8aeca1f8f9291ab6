//! # Asynchronous request-reply
//!
//! [`AsyncRequestReplyRequester`] turns a fire-and-forget dispatch plus a
//! correlated reply arriving later on a separate source into a single awaited
//! call.
//!
//! ## Protocol
//!
//! 1. The request's correlation id is reused, or the event id becomes the
//!    correlation id.
//! 2. A wait slot is registered under that id **before** the request is
//!    dispatched, so a fast reply cannot overtake its waiter.
//! 3. The request is dispatched to the listener on its own task. The
//!    listener's result is ignored unless it fails, in which case the failure
//!    is handed to the waiter.
//! 4. The caller waits for the reply, the timeout, or its cancellation token.
//!
//! ## Slot cleanup
//!
//! A slot is removed on every exit path, including the caller's future being
//! dropped. On timeout the slot is removed first and the receiver drained
//! afterwards: a reply that made it into the slot before removal wins over the
//! timeout, and a reply arriving after removal is reported as missed.

use crate::config::AsyncReplyConfig;
use crate::error::{ComponentInfo, RoutingError};
use crate::message::Event;
use crate::notification::{NotificationDispatcher, RoutingNotification};
use crate::processor::Processor;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type ReplySender = oneshot::Sender<Result<Event, RoutingError>>;

#[derive(Debug)]
struct PendingReply {
  waiter_id: u64,
  sender: ReplySender,
}

/// State shared between callers and the reply pump.
#[derive(Debug)]
struct Shared {
  component: ComponentInfo,
  notifications: NotificationDispatcher,
  pending: Mutex<HashMap<String, PendingReply>>,
  next_waiter: AtomicU64,
}

impl Shared {
  fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingReply>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn take(&self, correlation_id: &str, waiter_id: u64) -> Option<ReplySender> {
    let mut pending = self.lock_pending();
    match pending.get(correlation_id) {
      Some(slot) if slot.waiter_id == waiter_id => {
        pending.remove(correlation_id).map(|slot| slot.sender)
      }
      _ => None,
    }
  }

  fn deliver(&self, reply: Event) -> bool {
    let Some(correlation_id) = reply.correlation_id().map(str::to_string) else {
      warn!(event_id = %reply.id(), "reply without correlation id, dropping it");
      return false;
    };
    let slot = self.lock_pending().remove(&correlation_id);
    let delivered = match slot {
      Some(slot) => slot.sender.send(Ok(reply)).is_ok(),
      None => false,
    };
    if delivered {
      trace!(correlation_id = %correlation_id, "reply delivered");
    } else {
      debug!(
        correlation_id = %correlation_id,
        component = %self.component,
        "reply arrived with nobody waiting for it"
      );
      self
        .notifications
        .fire(RoutingNotification::MissedAsyncReply { correlation_id });
    }
    delivered
  }
}

#[derive(Debug)]
struct ReplyPump {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

/// Bridges an asynchronous dispatch with a correlated reply.
#[derive(Debug)]
pub struct AsyncRequestReplyRequester {
  shared: Arc<Shared>,
  listener: Arc<dyn Processor>,
  config: AsyncReplyConfig,
  pump: Mutex<Option<ReplyPump>>,
}

impl AsyncRequestReplyRequester {
  /// Creates a requester dispatching requests to `listener`.
  pub fn new(name: impl Into<String>, listener: Arc<dyn Processor>) -> Self {
    Self {
      shared: Arc::new(Shared {
        component: ComponentInfo::new(name, "AsyncRequestReplyRequester"),
        notifications: NotificationDispatcher::default(),
        pending: Mutex::new(HashMap::new()),
        next_waiter: AtomicU64::new(0),
      }),
      listener,
      config: AsyncReplyConfig::default(),
      pump: Mutex::new(None),
    }
  }

  /// Sets the configuration.
  pub fn with_config(mut self, config: AsyncReplyConfig) -> Self {
    self.config = config;
    self
  }

  /// Sets the reply timeout. A zero duration waits forever.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.config.timeout = (!timeout.is_zero()).then_some(timeout);
    self
  }

  /// Sets the notification dispatcher.
  ///
  /// Must be called before the requester is shared.
  pub fn with_notifications(mut self, notifications: NotificationDispatcher) -> Self {
    if let Some(shared) = Arc::get_mut(&mut self.shared) {
      shared.notifications = notifications;
    }
    self
  }

  /// Returns the component identity used in errors.
  pub fn component_info(&self) -> &ComponentInfo {
    &self.shared.component
  }

  /// Returns the number of requests waiting for a reply.
  pub fn pending_replies(&self) -> usize {
    self.shared.lock_pending().len()
  }

  /// Sends `event` and waits for its correlated reply.
  pub async fn process(&self, event: Event) -> Result<Event, RoutingError> {
    self.process_with_cancel(event, &CancellationToken::new()).await
  }

  /// Like [`process`](Self::process), giving up with
  /// [`RoutingError::Cancelled`] once `cancel` fires.
  pub async fn process_with_cancel(
    &self,
    mut event: Event,
    cancel: &CancellationToken,
  ) -> Result<Event, RoutingError> {
    let correlation_id = match event.correlation_id() {
      Some(id) => id.to_string(),
      None => {
        let id = event.id().to_string();
        event.set_correlation_id(id.clone());
        id
      }
    };

    let waiter_id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
    let (sender, mut receiver) = oneshot::channel();
    {
      let mut pending = self.shared.lock_pending();
      if pending.contains_key(&correlation_id) {
        return Err(RoutingError::routing(
          format!("a request with correlation id '{correlation_id}' is already waiting for a reply"),
          event,
          self.shared.component.clone(),
        ));
      }
      pending.insert(correlation_id.clone(), PendingReply { waiter_id, sender });
    }
    let shared = Arc::clone(&self.shared);
    let _slot = scopeguard::guard(correlation_id.clone(), move |id| {
      shared.take(&id, waiter_id);
    });

    self.dispatch(event, correlation_id.clone(), waiter_id);

    let expiry = async {
      match self.config.timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => future::pending().await,
      }
    };

    tokio::select! {
      biased;
      outcome = &mut receiver => {
        outcome.unwrap_or_else(|_| Err(RoutingError::Cancelled { correlation_id }))
      }
      _ = cancel.cancelled() => {
        self.shared.take(&correlation_id, waiter_id);
        match receiver.try_recv() {
          Ok(outcome) => outcome,
          Err(_) => {
            debug!(correlation_id = %correlation_id, "reply wait cancelled");
            Err(RoutingError::Cancelled { correlation_id })
          }
        }
      }
      _ = expiry => {
        self.shared.take(&correlation_id, waiter_id);
        match receiver.try_recv() {
          Ok(outcome) => outcome,
          Err(_) => self.timed_out(correlation_id),
        }
      }
    }
  }

  /// Hands a reply to its waiter. Returns `false` when nobody was waiting.
  pub fn deliver_reply(&self, reply: Event) -> bool {
    self.shared.deliver(reply)
  }

  /// Starts pumping replies from `replies` to their waiters.
  ///
  /// Returns `false` if a pump is already running. Must be called from within
  /// a tokio runtime.
  pub fn start<S>(&self, replies: S) -> bool
  where
    S: Stream<Item = Event> + Send + 'static,
  {
    let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
    if pump.as_ref().is_some_and(|p| !p.handle.is_finished()) {
      return false;
    }
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let shared = Arc::clone(&self.shared);
    let handle = tokio::spawn(async move {
      let mut replies = std::pin::pin!(replies);
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          next = replies.next() => match next {
            Some(reply) => {
              shared.deliver(reply);
            }
            None => {
              debug!(component = %shared.component, "reply source ended");
              break;
            }
          }
        }
      }
    });
    *pump = Some(ReplyPump { cancel, handle });
    true
  }

  /// Stops the reply pump and waits for it to finish.
  pub async fn stop(&self) {
    let pump = self
      .pump
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(pump) = pump {
      pump.cancel.cancel();
      if let Err(e) = pump.handle.await {
        warn!(error = %e, "reply pump ended abnormally");
      }
    }
  }

  fn dispatch(&self, event: Event, correlation_id: String, waiter_id: u64) {
    let listener = Arc::clone(&self.listener);
    let shared = Arc::clone(&self.shared);
    tokio::spawn(async move {
      if let Err(e) = listener.process(event).await {
        warn!(correlation_id = %correlation_id, error = %e, "request dispatch failed");
        if let Some(sender) = shared.take(&correlation_id, waiter_id) {
          let _ = sender.send(Err(e));
        }
      }
    });
  }

  fn timed_out(&self, correlation_id: String) -> Result<Event, RoutingError> {
    let timeout = self.config.timeout.unwrap_or_default();
    debug!(correlation_id = %correlation_id, ?timeout, "no reply before timeout");
    if self.config.notify_on_timeout {
      self.shared.notifications.fire(RoutingNotification::AsyncReplyTimeout {
        correlation_id: correlation_id.clone(),
      });
    }
    Err(RoutingError::ResponseTimeout {
      correlation_id,
      timeout,
    })
  }
}

impl Drop for AsyncRequestReplyRequester {
  fn drop(&mut self) {
    let pump = self.pump.get_mut().unwrap_or_else(PoisonError::into_inner);
    if let Some(pump) = pump.take() {
      pump.cancel.cancel();
    }
  }
}
