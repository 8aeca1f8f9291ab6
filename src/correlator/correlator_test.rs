use crate::callback::{CollectionCorrelatorCallback, EventCorrelatorCallback};
use crate::config::CorrelatorConfig;
use crate::correlator::{EventCorrelator, ProcessedGroup, ProcessedGroups};
use crate::error::RoutingError;
use crate::group::EventGroup;
use crate::message::{Event, GroupCorrelation};
use crate::notification::{Notification, NotificationDispatcher, RoutingNotification};
use crate::processor::{Processor, processor_fn};
use crate::store::{
  FileObjectStore, InMemoryObjectStore, ObjectStoreError, ObjectStoreResult,
  PartitionableObjectStore,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use proptest::prelude::*;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const TEST_GROUP_ID: &str = "TEST_GROUP_ID";

fn part(group: &str, value: i64, seq: usize, size: usize) -> Event {
  Event::new(json!(value))
    .with_correlation_id(group)
    .with_group_correlation(GroupCorrelation::new(seq, size))
}

fn collecting_processor() -> (Arc<dyn Processor>, Arc<Mutex<Vec<Event>>>) {
  let received = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&received);
  let processor = processor_fn("timeout-handler", move |event: Event| {
    let sink = Arc::clone(&sink);
    async move {
      sink.lock().unwrap().push(event.clone());
      Ok(event)
    }
  });
  (processor, received)
}

fn drain(receiver: &mut broadcast::Receiver<Notification>) -> Vec<RoutingNotification> {
  let mut routed = Vec::new();
  while let Ok(notification) = receiver.try_recv() {
    if let Notification::Routing(n) = notification {
      routed.push(n);
    }
  }
  routed
}

fn correlator_with(
  callback: Arc<dyn EventCorrelatorCallback>,
  store: Arc<InMemoryObjectStore<EventGroup>>,
  config: CorrelatorConfig,
) -> EventCorrelator {
  EventCorrelator::builder(callback, store)
    .config(config)
    .build()
    .unwrap()
}

/// Callback that always fails to aggregate.
struct FailingCallback;

impl EventCorrelatorCallback for FailingCallback {
  fn create_event_group(&self, event: &Event, group_id: &str) -> EventGroup {
    EventGroup::new(group_id, event.group_correlation().and_then(|g| g.group_size))
  }

  fn should_aggregate_events(&self, group: &EventGroup) -> bool {
    group.is_complete()
  }

  fn aggregate_events(&self, group: &EventGroup) -> Result<Event, RoutingError> {
    Err(RoutingError::routing(
      "cannot aggregate",
      group.members()[0].clone(),
      crate::error::ComponentInfo::new("failing", "FailingCallback"),
    ))
  }
}

/// Callback that panics while aggregating.
struct PanickingCallback;

impl EventCorrelatorCallback for PanickingCallback {
  fn create_event_group(&self, _event: &Event, group_id: &str) -> EventGroup {
    EventGroup::new(group_id, Some(1))
  }

  fn should_aggregate_events(&self, _group: &EventGroup) -> bool {
    true
  }

  fn aggregate_events(&self, _group: &EventGroup) -> Result<Event, RoutingError> {
    panic!("aggregation blew up");
  }
}

/// Store whose every operation fails.
#[derive(Debug)]
struct UnavailableStore;

impl PartitionableObjectStore<EventGroup> for UnavailableStore {
  fn store(&self, _: &str, _: EventGroup, _: &str) -> ObjectStoreResult<()> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
  fn update(&self, _: &str, _: EventGroup, _: &str) -> ObjectStoreResult<()> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
  fn retrieve(&self, _: &str, _: &str) -> ObjectStoreResult<EventGroup> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
  fn remove(&self, _: &str, _: &str) -> ObjectStoreResult<EventGroup> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
  fn contains(&self, _: &str, _: &str) -> ObjectStoreResult<bool> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
  fn all_keys(&self, _: &str) -> ObjectStoreResult<Vec<String>> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
  fn clear(&self, _: &str) -> ObjectStoreResult<()> {
    Err(ObjectStoreError::Unavailable("down".to_string()))
  }
}

// ============================================================================
// Aggregation
// ============================================================================

#[tokio::test]
async fn test_incomplete_group_is_absorbed() {
  let store = Arc::new(InMemoryObjectStore::new());
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::clone(&store),
    CorrelatorConfig::new("agg"),
  );

  let result = correlator.process(part("g1", 1, 0, 3)).await.unwrap();
  assert!(result.is_none());
  assert_eq!(correlator.count_of_event_groups().unwrap(), 1);
  assert_eq!(store.retrieve("g1", "agg.eventGroups").unwrap().size(), 1);
}

#[tokio::test]
async fn test_complete_group_is_aggregated_and_removed() {
  let dispatcher = NotificationDispatcher::default();
  let mut notifications = dispatcher.subscribe();
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
  )
  .config(CorrelatorConfig::new("agg"))
  .notifications(dispatcher)
  .build()
  .unwrap();

  assert!(correlator.process(part("g1", 1, 0, 2)).await.unwrap().is_none());
  let aggregate = correlator
    .process(part("g1", 2, 1, 2))
    .await
    .unwrap()
    .expect("aggregate");

  assert_eq!(aggregate.payload(), &json!([1, 2]));
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
  assert!(correlator.processed_groups().contains("g1").unwrap());
  assert_eq!(
    drain(&mut notifications),
    vec![RoutingNotification::GroupAggregated {
      group_id: "g1".to_string(),
      members: 2
    }]
  );
}

#[tokio::test]
async fn test_missing_correlation_id_is_rejected() {
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );
  let err = correlator.process(Event::new(json!(1))).await.unwrap_err();
  assert!(matches!(err, RoutingError::NoCorrelationId { .. }));
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
}

#[tokio::test]
async fn test_groups_are_independent() {
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );
  correlator.process(part("a", 1, 0, 2)).await.unwrap();
  correlator.process(part("b", 10, 0, 2)).await.unwrap();
  let a = correlator.process(part("a", 2, 1, 2)).await.unwrap().unwrap();
  assert_eq!(a.payload(), &json!([1, 2]));
  assert_eq!(correlator.count_of_event_groups().unwrap(), 1);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_failed_aggregation_does_not_leak_group() {
  let correlator = correlator_with(
    Arc::new(FailingCallback),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );

  let err = correlator.process(part("g1", 1, 0, 1)).await.unwrap_err();
  match &err {
    RoutingError::Aggregation {
      group_id,
      members,
      source,
      ..
    } => {
      assert_eq!(group_id, "g1");
      assert_eq!(*members, 1);
      assert!(matches!(**source, RoutingError::Routing { .. }));
    }
    other => panic!("unexpected error: {other}"),
  }
  assert!(err.event().is_some());
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
  assert!(correlator.processed_groups().contains("g1").unwrap());
}

#[tokio::test]
async fn test_panicking_aggregation_does_not_leak_group() {
  let correlator = correlator_with(
    Arc::new(PanickingCallback),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );

  let outcome = AssertUnwindSafe(correlator.process(part("g1", 1, 0, 1)))
    .catch_unwind()
    .await;
  assert!(outcome.is_err());
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);

  // the stripe lock is released after the panic
  let late = correlator.process(part("g1", 2, 0, 1)).await.unwrap();
  assert!(late.is_none());
}

#[tokio::test]
async fn test_store_failure_surfaces_as_routing_error() {
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(UnavailableStore),
  )
  .build()
  .unwrap();

  let event = part("g1", 1, 0, 2);
  let err = correlator.process(event.clone()).await.unwrap_err();
  match err {
    RoutingError::ObjectStore {
      event: Some(failed),
      source: ObjectStoreError::Unavailable(_),
      ..
    } => assert_eq!(failed.id(), event.id()),
    other => panic!("unexpected error: {other}"),
  }
}

// ============================================================================
// Late members
// ============================================================================

#[tokio::test]
async fn test_late_member_does_not_resurrect_group() {
  let dispatcher = NotificationDispatcher::default();
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
  )
  .notifications(dispatcher.clone())
  .build()
  .unwrap();

  correlator.process(part("g1", 1, 0, 1)).await.unwrap().unwrap();
  let mut notifications = dispatcher.subscribe();

  let late = correlator.process(part("g1", 2, 0, 1)).await.unwrap();
  assert!(late.is_none());
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
  assert_eq!(
    drain(&mut notifications),
    vec![RoutingNotification::MissedAggregationGroup {
      group_id: "g1".to_string()
    }]
  );
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_members_produce_exactly_one_aggregate() {
  const MEMBERS: usize = 64;
  let correlator = Arc::new(correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg").with_lock_stripes(4),
  ));

  let mut tasks = Vec::new();
  for i in 0..MEMBERS {
    let correlator = Arc::clone(&correlator);
    tasks.push(tokio::spawn(async move {
      correlator
        .process(part(TEST_GROUP_ID, i as i64, i, MEMBERS))
        .await
    }));
  }

  let mut aggregates = Vec::new();
  for task in tasks {
    if let Some(aggregate) = task.await.unwrap().unwrap() {
      aggregates.push(aggregate);
    }
  }

  assert_eq!(aggregates.len(), 1);
  assert_eq!(aggregates[0].payload().as_array().unwrap().len(), MEMBERS);
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
}

// ============================================================================
// Forced expiry
// ============================================================================

#[tokio::test]
async fn test_force_expiry_routes_members_to_timeout_processor() {
  let (timeout_processor, received) = collecting_processor();
  let dispatcher = NotificationDispatcher::default();
  let mut notifications = dispatcher.subscribe();
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
  )
  .timeout_processor(timeout_processor)
  .notifications(dispatcher)
  .build()
  .unwrap();

  correlator.process(part("g1", 1, 0, 3)).await.unwrap();
  correlator.process(part("g1", 2, 1, 3)).await.unwrap();
  correlator.force_group_expiry("g1").await.unwrap();

  let payloads: Vec<_> = received
    .lock()
    .unwrap()
    .iter()
    .map(|e| e.payload().clone())
    .collect();
  assert_eq!(payloads, vec![json!(1), json!(2)]);
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
  assert!(correlator.processed_groups().contains("g1").unwrap());
  assert!(
    drain(&mut notifications).contains(&RoutingNotification::CorrelationTimeout {
      group_id: "g1".to_string(),
      members: 2
    })
  );
}

#[tokio::test]
async fn test_force_expiry_without_fail_on_timeout_aggregates_partial_group() {
  let (timeout_processor, received) = collecting_processor();
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
  )
  .config(CorrelatorConfig::new("agg").with_fail_on_timeout(false))
  .timeout_processor(timeout_processor)
  .build()
  .unwrap();

  correlator.process(part("g1", 1, 0, 3)).await.unwrap();
  correlator.process(part("g1", 2, 1, 3)).await.unwrap();
  correlator.force_group_expiry("g1").await.unwrap();

  let received = received.lock().unwrap();
  assert_eq!(received.len(), 1);
  assert_eq!(received[0].payload(), &json!([1, 2]));
}

#[tokio::test]
async fn test_force_expiry_of_unknown_group_is_noop() {
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );
  correlator.force_group_expiry("nope").await.unwrap();
  assert!(!correlator.processed_groups().contains("nope").unwrap());
}

#[tokio::test]
async fn test_force_expiry_without_timeout_processor_still_removes_group() {
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );
  correlator.process(part("g1", 1, 0, 2)).await.unwrap();
  correlator.force_group_expiry("g1").await.unwrap();
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_expires_only_timed_out_groups() {
  let store = Arc::new(InMemoryObjectStore::new());
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::clone(&store),
    CorrelatorConfig::new("agg").with_timeout(Duration::from_secs(5)),
  );

  let mut stale = EventGroup::with_created("old", Some(2), Utc::now() - ChronoDuration::seconds(60));
  stale.add_event(part("old", 1, 0, 2));
  store.store("old", stale, "agg.eventGroups").unwrap();
  correlator.process(part("fresh", 1, 0, 2)).await.unwrap();

  let expired = correlator
    .expire_timed_out_groups(&CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(expired, 1);
  assert!(!store.contains("old", "agg.eventGroups").unwrap());
  assert!(store.contains("fresh", "agg.eventGroups").unwrap());
}

#[tokio::test]
async fn test_sweep_honours_cancellation() {
  let store = Arc::new(InMemoryObjectStore::new());
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::clone(&store),
    CorrelatorConfig::new("agg").with_timeout(Duration::from_millis(1)),
  );
  let created = Utc::now() - ChronoDuration::seconds(60);
  for id in ["a", "b", "c"] {
    store
      .store(id, EventGroup::with_created(id, None, created), "agg.eventGroups")
      .unwrap();
  }

  let cancel = CancellationToken::new();
  cancel.cancel();
  let expired = correlator.expire_timed_out_groups(&cancel).await.unwrap();
  assert_eq!(expired, 0);
  assert_eq!(correlator.count_of_event_groups().unwrap(), 3);
}

#[tokio::test]
async fn test_sweep_without_timeout_does_nothing() {
  let store = Arc::new(InMemoryObjectStore::new());
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::clone(&store),
    CorrelatorConfig::new("agg"),
  );
  let created = Utc::now() - ChronoDuration::days(1);
  store
    .store("a", EventGroup::with_created("a", None, created), "agg.eventGroups")
    .unwrap();
  let expired = correlator
    .expire_timed_out_groups(&CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(expired, 0);
}

#[tokio::test]
async fn test_sweep_with_zero_timeout_does_nothing() {
  let store = Arc::new(InMemoryObjectStore::new());
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::clone(&store),
    CorrelatorConfig::new("agg").with_timeout(Duration::ZERO),
  );
  correlator.process(part("fresh", 1, 0, 2)).await.unwrap();

  let expired = correlator
    .expire_timed_out_groups(&CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(expired, 0);
  assert_eq!(correlator.count_of_event_groups().unwrap(), 1);
}

#[tokio::test]
async fn test_sweep_counts_only_routed_groups() {
  let store: Arc<InMemoryObjectStore<EventGroup>> = Arc::new(InMemoryObjectStore::new());
  let rejecting = processor_fn("rejecting", |_event: Event| async {
    Err::<Event, _>(RoutingError::processing(
      crate::error::ComponentInfo::new("rejecting", "ProcessorFn"),
      "downstream offline",
    ))
  });
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    store.clone(),
  )
  .config(CorrelatorConfig::new("agg").with_timeout(Duration::from_secs(5)))
  .timeout_processor(rejecting)
  .build()
  .unwrap();

  let mut stale = EventGroup::with_created("old", Some(2), Utc::now() - ChronoDuration::seconds(60));
  stale.add_event(part("old", 1, 0, 2));
  store.store("old", stale, "agg.eventGroups").unwrap();

  let expired = correlator
    .expire_timed_out_groups(&CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(expired, 0);
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);
  assert!(correlator.processed_groups().contains("old").unwrap());
}

// ============================================================================
// Waiting on groups
// ============================================================================

#[tokio::test]
async fn test_wait_for_group_receives_aggregate() {
  let correlator = Arc::new(correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  ));

  let waiter = {
    let correlator = Arc::clone(&correlator);
    tokio::spawn(async move {
      correlator
        .wait_for_group("g1", Some(Duration::from_secs(5)))
        .await
    })
  };
  tokio::task::yield_now().await;
  tokio::time::sleep(Duration::from_millis(20)).await;

  correlator.process(part("g1", 1, 0, 2)).await.unwrap();
  correlator.process(part("g1", 2, 1, 2)).await.unwrap();

  let aggregate = waiter.await.unwrap().unwrap();
  assert_eq!(aggregate.payload(), &json!([1, 2]));
}

#[tokio::test]
async fn test_wait_for_group_raises_correlation_timeout_on_expiry() {
  let correlator = Arc::new(correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  ));
  correlator.process(part("g1", 1, 0, 2)).await.unwrap();

  let waiter = {
    let correlator = Arc::clone(&correlator);
    tokio::spawn(async move { correlator.wait_for_group("g1", None).await })
  };
  tokio::time::sleep(Duration::from_millis(20)).await;
  correlator.force_group_expiry("g1").await.unwrap();

  let err = waiter.await.unwrap().unwrap_err();
  assert!(matches!(
    err,
    RoutingError::CorrelationTimeout { ref group_id, members: 1 } if group_id == "g1"
  ));
  assert!(err.is_timeout());
}

#[tokio::test]
async fn test_wait_for_group_keeps_aggregation_context() {
  let correlator = Arc::new(correlator_with(
    Arc::new(FailingCallback),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  ));
  let waiter = {
    let correlator = Arc::clone(&correlator);
    tokio::spawn(async move { correlator.wait_for_group("g1", None).await })
  };
  tokio::time::sleep(Duration::from_millis(20)).await;

  correlator.process(part("g1", 1, 0, 2)).await.unwrap();
  assert!(correlator.process(part("g1", 2, 1, 2)).await.is_err());

  let err = waiter.await.unwrap().unwrap_err();
  match &err {
    RoutingError::Aggregation {
      group_id,
      members,
      source,
      ..
    } => {
      assert_eq!(group_id, "g1");
      assert_eq!(*members, 2);
      assert!(source.to_string().contains("cannot aggregate"));
    }
    other => panic!("unexpected error: {other}"),
  }
}

#[tokio::test]
async fn test_wait_for_processed_group_fails_fast() {
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );
  correlator.process(part("g1", 1, 0, 1)).await.unwrap();
  let err = correlator.wait_for_group("g1", None).await.unwrap_err();
  assert!(matches!(err, RoutingError::GroupAlreadyProcessed { .. }));
}

#[tokio::test]
async fn test_wait_for_group_times_out() {
  let correlator = correlator_with(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
    CorrelatorConfig::new("agg"),
  );
  let err = correlator
    .wait_for_group("g1", Some(Duration::from_millis(10)))
    .await
    .unwrap_err();
  assert!(matches!(err, RoutingError::ResponseTimeout { .. }));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_group_survives_correlator_restart() {
  let dir = TempDir::new().unwrap();
  {
    let store = Arc::new(FileObjectStore::<EventGroup>::new(dir.path()).unwrap());
    let correlator = EventCorrelator::builder(Arc::new(CollectionCorrelatorCallback::new()), store)
      .build()
      .unwrap();
    correlator.process(part("g1", 1, 0, 2)).await.unwrap();
  }

  let store = Arc::new(FileObjectStore::<EventGroup>::new(dir.path()).unwrap());
  let correlator = EventCorrelator::builder(Arc::new(CollectionCorrelatorCallback::new()), store)
    .build()
    .unwrap();
  assert_eq!(correlator.count_of_event_groups().unwrap(), 1);
  let aggregate = correlator
    .process(part("g1", 2, 1, 2))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(aggregate.payload(), &json!([1, 2]));
}

#[tokio::test]
async fn test_redelivery_after_failed_write_adds_member_once() {
  let dir = TempDir::new().unwrap();
  let store = Arc::new(FileObjectStore::<EventGroup>::new(dir.path()).unwrap());
  let correlator = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    store.clone(),
  )
  .config(CorrelatorConfig::new("redeliver"))
  .build()
  .unwrap();

  let blocker = dir.path().join("redeliver.eventGroups.json.tmp");
  std::fs::create_dir(&blocker).unwrap();
  let event = part("g1", 1, 0, 3);
  let err = correlator.process(event.clone()).await.unwrap_err();
  assert!(matches!(err, RoutingError::ObjectStore { .. }));
  assert_eq!(correlator.count_of_event_groups().unwrap(), 0);

  std::fs::remove_dir(&blocker).unwrap();
  assert!(correlator.process(event).await.unwrap().is_none());
  let group = store.retrieve("g1", "redeliver.eventGroups").unwrap();
  assert_eq!(group.size(), 1);
}

#[tokio::test]
async fn test_processed_groups_survive_restart() {
  let processed: Arc<InMemoryObjectStore<ProcessedGroup>> = Arc::new(InMemoryObjectStore::new());
  let build = || {
    EventCorrelator::builder(
      Arc::new(CollectionCorrelatorCallback::new()),
      Arc::new(InMemoryObjectStore::new()),
    )
    .processed_groups_store(processed.clone())
    .build()
    .unwrap()
  };

  build().process(part("g1", 1, 0, 1)).await.unwrap().unwrap();
  let restarted = build();
  assert!(restarted.process(part("g1", 1, 0, 1)).await.unwrap().is_none());
}

#[test]
fn test_builder_rejects_invalid_config() {
  let result = EventCorrelator::builder(
    Arc::new(CollectionCorrelatorCallback::new()),
    Arc::new(InMemoryObjectStore::new()),
  )
  .config(CorrelatorConfig::new("agg").with_lock_stripes(0))
  .build();
  assert!(result.is_err());
}

// ============================================================================
// Processed groups FIFO
// ============================================================================

#[test]
fn test_processed_groups_evicts_oldest() {
  let store = Arc::new(InMemoryObjectStore::new());
  let processed = ProcessedGroups::new(store, "agg.processedGroups".to_string(), 2);
  processed.add("a").unwrap();
  processed.add("b").unwrap();
  processed.add("c").unwrap();
  assert!(!processed.contains("a").unwrap());
  assert!(processed.contains("b").unwrap());
  assert!(processed.contains("c").unwrap());
  assert_eq!(processed.len().unwrap(), 2);
}

#[test]
fn test_processed_groups_re_add_refreshes_position() {
  let store = Arc::new(InMemoryObjectStore::new());
  let processed = ProcessedGroups::new(store, "agg.processedGroups".to_string(), 2);
  processed.add("a").unwrap();
  processed.add("b").unwrap();
  processed.add("a").unwrap();
  processed.add("c").unwrap();
  assert!(processed.contains("a").unwrap());
  assert!(!processed.contains("b").unwrap());
}

proptest! {
  #[test]
  fn prop_processed_groups_bounded(
    ids in proptest::collection::vec("[a-f]{1,2}", 1..80),
    capacity in 1usize..10,
  ) {
    let store = Arc::new(InMemoryObjectStore::new());
    let processed = ProcessedGroups::new(store, "p".to_string(), capacity);
    for id in &ids {
      processed.add(id).unwrap();
    }
    prop_assert!(processed.len().unwrap() <= capacity);

    let mut recent: Vec<&String> = Vec::new();
    for id in ids.iter().rev() {
      if recent.len() == capacity {
        break;
      }
      if !recent.contains(&id) {
        recent.push(id);
      }
    }
    for id in recent {
      prop_assert!(processed.contains(id).unwrap());
    }
  }
}
