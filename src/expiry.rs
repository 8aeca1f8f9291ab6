//! Background expiry of timed-out groups.
//!
//! An [`ExpiryMonitor`] owns one tokio task that ticks at the correlator's
//! expiry interval and sweeps for timed-out groups. On every tick it asks the
//! correlator's [`ClusterContext`](crate::cluster::ClusterContext) whether this
//! node is the primary polling instance; secondary nodes skip the sweep, so a
//! node promoted to primary starts expiring groups on its next tick.

use crate::correlator::EventCorrelator;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Lifecycle state of an [`ExpiryMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
  /// No sweep task is running.
  Stopped,
  /// The sweep task is scheduled.
  Running,
}

#[derive(Debug)]
struct RunningTask {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

/// Periodically force-expires groups older than the correlator's timeout.
#[derive(Debug)]
pub struct ExpiryMonitor {
  correlator: Arc<EventCorrelator>,
  interval: Duration,
  task: Mutex<Option<RunningTask>>,
}

impl ExpiryMonitor {
  /// Creates a stopped monitor using the correlator's configured interval.
  pub fn new(correlator: Arc<EventCorrelator>) -> Self {
    let interval = correlator.config().expiry_interval;
    Self {
      correlator,
      interval,
      task: Mutex::new(None),
    }
  }

  /// Overrides the sweep interval. Takes effect on the next `start`.
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Returns the current state.
  pub fn state(&self) -> MonitorState {
    let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
    match task.as_ref() {
      Some(running) if !running.handle.is_finished() => MonitorState::Running,
      _ => MonitorState::Stopped,
    }
  }

  /// Schedules the sweep task. Returns `false` if it was already running.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start(&self) -> bool {
    let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
    if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
      return false;
    }
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(sweep_loop(
      Arc::clone(&self.correlator),
      self.interval,
      cancel.clone(),
    ));
    debug!(
      component = %self.correlator.component_info(),
      interval = ?self.interval,
      "expiry monitor started"
    );
    *task = Some(RunningTask { cancel, handle });
    true
  }

  /// Cancels the sweep task and waits for it to finish.
  ///
  /// A sweep in progress stops between groups; the group being expired when
  /// the token fires is expired completely.
  pub async fn stop(&self) {
    let running = self
      .task
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    let Some(running) = running else {
      return;
    };
    running.cancel.cancel();
    if let Err(e) = running.handle.await {
      warn!(error = %e, "expiry task ended abnormally");
    }
    debug!(component = %self.correlator.component_info(), "expiry monitor stopped");
  }
}

impl Drop for ExpiryMonitor {
  fn drop(&mut self) {
    let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
    if let Some(running) = task.take() {
      running.cancel.cancel();
    }
  }
}

async fn sweep_loop(
  correlator: Arc<EventCorrelator>,
  period: Duration,
  cancel: CancellationToken,
) {
  let mut interval = tokio::time::interval(period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = interval.tick() => {}
    }

    if !correlator.cluster().is_primary_polling_instance() {
      trace!("not the primary polling instance, skipping expiry sweep");
      continue;
    }

    match correlator.expire_timed_out_groups(&cancel).await {
      Ok(0) => {}
      Ok(expired) => debug!(expired, "expiry sweep finished"),
      Err(e) => warn!(error = %e, "expiry sweep failed"),
    }
  }
}
