//! # Event correlation and aggregation
//!
//! An [`EventCorrelator`] routes each incoming event into the group its
//! callback assigns it to, persists the group after every mutation, and hands
//! the group to the callback for aggregation once the callback says it is ready.
//!
//! ## Guarantees
//!
//! - **One group per id**: all mutations of a group id are serialized through a
//!   striped lock, and the store is the single source of truth for existence.
//! - **No leaked groups**: a group is removed from the store whether its
//!   aggregation succeeds, fails or panics.
//! - **No resurrection**: finalized ids are remembered in a bounded FIFO; late
//!   members for them are dropped with a notification.
//! - **No internal retry**: store failures surface as
//!   [`RoutingError::ObjectStore`] and the caller applies its own redelivery.
//!
//! ## Expiry
//!
//! [`EventCorrelator::expire_timed_out_groups`] scans the group partition and
//! force-expires groups older than the configured timeout. It is normally
//! driven by an [`ExpiryMonitor`](crate::expiry::ExpiryMonitor).

mod processed;

#[cfg(test)]
mod correlator_test;

pub use processed::{ProcessedGroup, ProcessedGroups};

use crate::callback::EventCorrelatorCallback;
use crate::cluster::{ClusterContext, StandaloneNode};
use crate::config::{ConfigError, CorrelatorConfig};
use crate::error::{ComponentInfo, RoutingError, StringError};
use crate::group::{EventGroup, GroupContext};
use crate::message::Event;
use crate::notification::{NotificationDispatcher, RoutingNotification};
use crate::processor::Processor;
use crate::store::{InMemoryObjectStore, ObjectStoreError, PartitionableObjectStore};
use chrono::Utc;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// How a group a caller is waiting on ended.
#[derive(Debug, Clone)]
enum GroupOutcome {
  Aggregated(Event),
  Expired { members: usize },
  Failed { members: usize, message: String },
}

type Waiters = HashMap<String, Vec<(u64, oneshot::Sender<GroupOutcome>)>>;

/// Builder for [`EventCorrelator`].
pub struct EventCorrelatorBuilder {
  callback: Arc<dyn EventCorrelatorCallback>,
  store: Arc<dyn PartitionableObjectStore<EventGroup>>,
  processed_store: Option<Arc<dyn PartitionableObjectStore<ProcessedGroup>>>,
  timeout_processor: Option<Arc<dyn Processor>>,
  cluster: Arc<dyn ClusterContext>,
  notifications: NotificationDispatcher,
  config: CorrelatorConfig,
}

impl EventCorrelatorBuilder {
  /// Sets the configuration.
  pub fn config(mut self, config: CorrelatorConfig) -> Self {
    self.config = config;
    self
  }

  /// Sets the processor receiving expired groups.
  pub fn timeout_processor(mut self, processor: Arc<dyn Processor>) -> Self {
    self.timeout_processor = Some(processor);
    self
  }

  /// Sets the store remembering finalized group ids.
  ///
  /// Defaults to a private in-memory store.
  pub fn processed_groups_store(
    mut self,
    store: Arc<dyn PartitionableObjectStore<ProcessedGroup>>,
  ) -> Self {
    self.processed_store = Some(store);
    self
  }

  /// Sets the cluster context gating expiry sweeps.
  pub fn cluster(mut self, cluster: Arc<dyn ClusterContext>) -> Self {
    self.cluster = cluster;
    self
  }

  /// Sets the notification dispatcher.
  pub fn notifications(mut self, notifications: NotificationDispatcher) -> Self {
    self.notifications = notifications;
    self
  }

  /// Validates the configuration and builds the correlator.
  pub fn build(self) -> Result<EventCorrelator, ConfigError> {
    self.config.validate()?;
    let component = ComponentInfo::new(self.config.prefix.clone(), "EventCorrelator");
    let processed_store = self
      .processed_store
      .unwrap_or_else(|| Arc::new(InMemoryObjectStore::<ProcessedGroup>::new()));
    let processed = ProcessedGroups::new(
      processed_store,
      self.config.processed_groups_partition(),
      self.config.max_processed_groups,
    );
    let stripes = (0..self.config.lock_stripes).map(|_| Mutex::new(())).collect();
    Ok(EventCorrelator {
      callback: self.callback,
      store: self.store,
      processed,
      timeout_processor: self.timeout_processor,
      cluster: self.cluster,
      notifications: self.notifications,
      groups_partition: self.config.event_groups_partition(),
      context: GroupContext::new(component.clone()),
      component,
      config: self.config,
      stripes,
      waiters: StdMutex::new(HashMap::new()),
      next_waiter: AtomicU64::new(0),
    })
  }
}

/// Stateful coordinator grouping correlated events.
pub struct EventCorrelator {
  callback: Arc<dyn EventCorrelatorCallback>,
  store: Arc<dyn PartitionableObjectStore<EventGroup>>,
  processed: ProcessedGroups,
  timeout_processor: Option<Arc<dyn Processor>>,
  cluster: Arc<dyn ClusterContext>,
  notifications: NotificationDispatcher,
  config: CorrelatorConfig,
  component: ComponentInfo,
  context: GroupContext,
  groups_partition: String,
  stripes: Vec<Mutex<()>>,
  waiters: StdMutex<Waiters>,
  next_waiter: AtomicU64,
}

impl std::fmt::Debug for EventCorrelator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventCorrelator")
      .field("component", &self.component)
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl EventCorrelator {
  /// Starts building a correlator over `store` using `callback` as policy.
  pub fn builder(
    callback: Arc<dyn EventCorrelatorCallback>,
    store: Arc<dyn PartitionableObjectStore<EventGroup>>,
  ) -> EventCorrelatorBuilder {
    EventCorrelatorBuilder {
      callback,
      store,
      processed_store: None,
      timeout_processor: None,
      cluster: Arc::new(StandaloneNode),
      notifications: NotificationDispatcher::default(),
      config: CorrelatorConfig::default(),
    }
  }

  /// Returns the configuration.
  pub fn config(&self) -> &CorrelatorConfig {
    &self.config
  }

  /// Returns the component identity used in errors.
  pub fn component_info(&self) -> &ComponentInfo {
    &self.component
  }

  /// Returns the cluster context.
  pub fn cluster(&self) -> &Arc<dyn ClusterContext> {
    &self.cluster
  }

  /// Returns the partition holding in-flight groups.
  pub fn groups_partition(&self) -> &str {
    &self.groups_partition
  }

  /// Returns the finalized-group FIFO.
  pub fn processed_groups(&self) -> &ProcessedGroups {
    &self.processed
  }

  /// Returns the number of in-flight groups in the store.
  pub fn count_of_event_groups(&self) -> Result<usize, RoutingError> {
    self
      .store
      .all_keys(&self.groups_partition)
      .map(|keys| keys.len())
      .map_err(|e| self.store_error(None, e))
  }

  /// Routes an event into its group.
  ///
  /// Returns the aggregate when the event completed its group, `None` when the
  /// event was absorbed into a still-incomplete group or dropped because the
  /// group was already finalized.
  pub async fn process(&self, event: Event) -> Result<Option<Event>, RoutingError> {
    let Some(group_id) = self.callback.group_id(&event) else {
      return Err(RoutingError::NoCorrelationId {
        event: Box::new(event),
        component: self.component.clone(),
      });
    };

    let _guard = self.stripe(&group_id).lock().await;

    if self
      .processed
      .contains(&group_id)
      .map_err(|e| self.store_error(Some(&event), e))?
    {
      debug!(
        group_id = %group_id,
        "event received for an already processed group, dropping it"
      );
      self
        .notifications
        .fire(RoutingNotification::MissedAggregationGroup {
          group_id: group_id.clone(),
        });
      return Ok(None);
    }

    let (mut group, is_new) = match self.store.retrieve(&group_id, &self.groups_partition) {
      Ok(group) => (group, false),
      Err(ObjectStoreError::DoesNotExist { .. }) => {
        (self.callback.create_event_group(&event, &group_id), true)
      }
      Err(e) => return Err(self.store_error(Some(&event), e)),
    };
    group.init_after_deserialization(&self.context);

    trace!(group_id = %group_id, members = group.size(), "adding event to group");
    let event_for_errors = event.clone();
    group.add_event(event);

    let persisted = if is_new {
      self
        .store
        .store(&group_id, group.clone(), &self.groups_partition)
    } else {
      self
        .store
        .update(&group_id, group.clone(), &self.groups_partition)
    };
    persisted.map_err(|e| self.store_error(Some(&event_for_errors), e))?;

    if !self.callback.should_aggregate_events(&group) {
      return Ok(None);
    }

    let members = group.size();
    let aggregated = {
      // Only fires if the callback panics; the normal path cleans up below.
      let _unwind_cleanup = scopeguard::guard_on_unwind(group_id.as_str(), |id| {
        if let Err(e) = self.finalize_group(id) {
          error!(group_id = %id, error = %e, "failed to clean up group after panic");
        }
      });
      self.callback.aggregate_events(&group)
    };
    let cleanup = self.finalize_group(&group_id);

    match aggregated {
      Ok(aggregate) => {
        cleanup.map_err(|e| self.store_error(Some(&event_for_errors), e))?;
        debug!(group_id = %group_id, members, "group aggregated");
        self.notifications.fire(RoutingNotification::GroupAggregated {
          group_id: group_id.clone(),
          members,
        });
        self.notify_waiters(&group_id, GroupOutcome::Aggregated(aggregate.clone()));
        Ok(Some(aggregate))
      }
      Err(source) => {
        if let Err(e) = cleanup {
          error!(group_id = %group_id, error = %e, "failed to remove group after aggregation failure");
        }
        warn!(group_id = %group_id, members, error = %source, "aggregation failed");
        self.notify_waiters(
          &group_id,
          GroupOutcome::Failed {
            members,
            message: source.to_string(),
          },
        );
        Err(RoutingError::Aggregation {
          group_id,
          members,
          component: self.component.clone(),
          source: Box::new(source),
        })
      }
    }
  }

  /// Expires a group regardless of its age.
  ///
  /// With `fail_on_timeout` the accumulated members are routed, in arrival
  /// order, to the timeout processor and anyone waiting on the group receives
  /// [`RoutingError::CorrelationTimeout`]. Otherwise the partial group is
  /// aggregated and the aggregate is routed instead. The group is removed and
  /// recorded as processed in every case. Expiring an unknown group is a no-op.
  pub async fn force_group_expiry(&self, group_id: &str) -> Result<(), RoutingError> {
    let _guard = self.stripe(group_id).lock().await;
    let mut group = match self.store.retrieve(group_id, &self.groups_partition) {
      Ok(group) => group,
      Err(ObjectStoreError::DoesNotExist { .. }) => {
        debug!(group_id, "group already gone, nothing to expire");
        return Ok(());
      }
      Err(e) => return Err(self.store_error(None, e)),
    };
    group.init_after_deserialization(&self.context);
    self.expire_locked(group).await
  }

  /// Force-expires every group older than the configured timeout.
  ///
  /// Stops between groups once `cancel` fires. Returns the number of groups
  /// expired and routed. A group whose routing fails is still removed; the
  /// failure is logged, left out of the count and does not stop the sweep.
  pub async fn expire_timed_out_groups(
    &self,
    cancel: &CancellationToken,
  ) -> Result<usize, RoutingError> {
    let Some(timeout) = self.config.timeout else {
      return Ok(0);
    };
    let keys = self
      .store
      .all_keys(&self.groups_partition)
      .map_err(|e| self.store_error(None, e))?;
    let now = Utc::now();
    let mut expired = 0;

    for group_id in keys {
      if cancel.is_cancelled() {
        debug!("expiry sweep cancelled");
        break;
      }
      let _guard = self.stripe(&group_id).lock().await;
      let mut group = match self.store.retrieve(&group_id, &self.groups_partition) {
        Ok(group) => group,
        Err(ObjectStoreError::DoesNotExist { .. }) => continue,
        Err(e) => return Err(self.store_error(None, e)),
      };
      group.init_after_deserialization(&self.context);
      if !group.is_expired(timeout, now) {
        continue;
      }
      debug!(group_id = %group_id, members = group.size(), "group timed out");
      match self.expire_locked(group).await {
        Ok(()) => expired += 1,
        Err(e) => warn!(group_id = %group_id, error = %e, "expiring group failed"),
      }
    }
    Ok(expired)
  }

  /// Waits until a group is aggregated or expires.
  ///
  /// Must be called before the group's last member arrives. `None` waits
  /// forever.
  pub async fn wait_for_group(
    &self,
    group_id: &str,
    timeout: Option<Duration>,
  ) -> Result<Event, RoutingError> {
    let (waiter_id, receiver) = {
      let _guard = self.stripe(group_id).lock().await;
      if self
        .processed
        .contains(group_id)
        .map_err(|e| self.store_error(None, e))?
      {
        return Err(RoutingError::GroupAlreadyProcessed {
          group_id: group_id.to_string(),
        });
      }
      let (sender, receiver) = oneshot::channel();
      let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
      self
        .lock_waiters()
        .entry(group_id.to_string())
        .or_default()
        .push((waiter_id, sender));
      (waiter_id, receiver)
    };

    let outcome = match timeout {
      Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
        Ok(outcome) => outcome,
        Err(_) => {
          self.remove_waiter(group_id, waiter_id);
          return Err(RoutingError::ResponseTimeout {
            correlation_id: group_id.to_string(),
            timeout,
          });
        }
      },
      None => receiver.await,
    };

    match outcome {
      Ok(GroupOutcome::Aggregated(event)) => Ok(event),
      Ok(GroupOutcome::Expired { members }) => Err(RoutingError::CorrelationTimeout {
        group_id: group_id.to_string(),
        members,
      }),
      Ok(GroupOutcome::Failed { members, message }) => Err(RoutingError::Aggregation {
        group_id: group_id.to_string(),
        members,
        component: self.component.clone(),
        source: Box::new(RoutingError::processing(
          self.component.clone(),
          StringError(message),
        )),
      }),
      Err(_) => Err(RoutingError::Cancelled {
        correlation_id: group_id.to_string(),
      }),
    }
  }

  /// Expires a group whose stripe lock the caller holds.
  async fn expire_locked(&self, group: EventGroup) -> Result<(), RoutingError> {
    let group_id = group.group_id().to_string();
    let members = group.size();

    let (routed, outcome) = if self.config.fail_on_timeout {
      let routed = self.route_to_timeout_processor(group.into_members()).await;
      (routed, GroupOutcome::Expired { members })
    } else {
      debug!(
        group_id = %group_id,
        members,
        expected = ?group.expected_size(),
        "group expired but fail_on_timeout is off, forwarding partial aggregate"
      );
      match self.callback.aggregate_events(&group) {
        Ok(aggregate) => {
          let routed = self.route_to_timeout_processor(vec![aggregate.clone()]).await;
          (routed, GroupOutcome::Aggregated(aggregate))
        }
        Err(source) => {
          let message = source.to_string();
          (
            Err(RoutingError::Aggregation {
              group_id: group_id.clone(),
              members,
              component: self.component.clone(),
              source: Box::new(source),
            }),
            GroupOutcome::Failed { members, message },
          )
        }
      }
    };

    let cleanup = self.finalize_group(&group_id);
    self
      .notifications
      .fire(RoutingNotification::CorrelationTimeout {
        group_id: group_id.clone(),
        members,
      });
    self.notify_waiters(&group_id, outcome);

    cleanup.map_err(|e| self.store_error(None, e))?;
    routed
  }

  async fn route_to_timeout_processor(&self, events: Vec<Event>) -> Result<(), RoutingError> {
    let Some(processor) = &self.timeout_processor else {
      warn!(
        dropped = events.len(),
        component = %self.component,
        "no timeout processor configured, dropping expired events"
      );
      return Ok(());
    };
    let mut first_error = None;
    for event in events {
      if let Err(e) = processor.process(event).await {
        warn!(error = %e, "timeout processor failed");
        first_error.get_or_insert(e);
      }
    }
    first_error.map_or(Ok(()), Err)
  }

  /// Removes a group from the active partition and records it as processed.
  fn finalize_group(&self, group_id: &str) -> Result<(), ObjectStoreError> {
    match self.store.remove(group_id, &self.groups_partition) {
      Ok(_) | Err(ObjectStoreError::DoesNotExist { .. }) => {}
      Err(e) => return Err(e),
    }
    self.processed.add(group_id)
  }

  fn stripe(&self, group_id: &str) -> &Mutex<()> {
    let mut hasher = DefaultHasher::new();
    group_id.hash(&mut hasher);
    let index = (hasher.finish() % self.stripes.len() as u64) as usize;
    &self.stripes[index]
  }

  fn lock_waiters(&self) -> std::sync::MutexGuard<'_, Waiters> {
    self
      .waiters
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }

  fn notify_waiters(&self, group_id: &str, outcome: GroupOutcome) {
    let waiting = self.lock_waiters().remove(group_id).unwrap_or_default();
    for (_, sender) in waiting {
      let _ = sender.send(outcome.clone());
    }
  }

  fn remove_waiter(&self, group_id: &str, waiter_id: u64) {
    let mut waiters = self.lock_waiters();
    if let Some(list) = waiters.get_mut(group_id) {
      list.retain(|(id, _)| *id != waiter_id);
      if list.is_empty() {
        waiters.remove(group_id);
      }
    }
  }

  fn store_error(&self, event: Option<&Event>, source: ObjectStoreError) -> RoutingError {
    RoutingError::ObjectStore {
      event: event.cloned().map(Box::new),
      component: self.component.clone(),
      source,
    }
  }
}
