//! # Routing Error Test Suite
//!
//! Covers the routing error taxonomy: display formatting, source chains,
//! event access and the conversions other modules rely on.

use crate::error::{ComponentInfo, RoutingError, StringError};
use crate::message::Event;
use crate::store::ObjectStoreError;
use crate::transaction::{TransactionError, TransactionId};
use serde_json::json;
use std::error::Error;
use std::time::Duration;

fn component() -> ComponentInfo {
  ComponentInfo::new("aggregator", "EventCorrelator")
}

fn event() -> Event {
  Event::new(json!({"order": 1})).with_correlation_id("order-1")
}

// ============================================================================
// ComponentInfo Tests
// ============================================================================

#[test]
fn test_component_info_default() {
  let info = ComponentInfo::default();
  assert_eq!(info.name, "default");
  assert_eq!(info.type_name, "default");
}

#[test]
fn test_component_info_display() {
  assert_eq!(component().to_string(), "aggregator (EventCorrelator)");
}

#[test]
fn test_component_info_serde() {
  let json = serde_json::to_value(component()).unwrap();
  assert_eq!(json, json!({"name": "aggregator", "type_name": "EventCorrelator"}));
  let back: ComponentInfo = serde_json::from_value(json).unwrap();
  assert_eq!(back, component());
}

// ============================================================================
// StringError Tests
// ============================================================================

#[test]
fn test_string_error() {
  let error = StringError("boom".to_string());
  assert_eq!(error.to_string(), "boom");
  assert_eq!(error.clone(), error);
}

// ============================================================================
// RoutingError Tests
// ============================================================================

#[test]
fn test_routing_error_carries_event() {
  let error = RoutingError::routing("callback rejected group", event(), component());
  assert_eq!(
    error.to_string(),
    "routing failed in aggregator (EventCorrelator): callback rejected group"
  );
  assert_eq!(error.event().and_then(Event::correlation_id), Some("order-1"));
}

#[test]
fn test_no_correlation_id_names_event() {
  let event = Event::new(json!(null));
  let id = event.id().to_string();
  let error = RoutingError::NoCorrelationId {
    event: Box::new(event),
    component: component(),
  };
  assert!(error.to_string().contains(&id));
  assert!(error.event().is_some());
}

#[test]
fn test_object_store_source_chain() {
  let error = RoutingError::ObjectStore {
    event: None,
    component: component(),
    source: ObjectStoreError::Unavailable("disk detached".to_string()),
  };
  assert!(error.event().is_none());
  let source = error.source().unwrap();
  assert_eq!(source.to_string(), "object store unavailable: disk detached");
}

#[test]
fn test_aggregation_exposes_inner_event() {
  let inner = RoutingError::routing("bad member", event(), component());
  let error = RoutingError::Aggregation {
    group_id: "order-1".to_string(),
    members: 3,
    component: component(),
    source: Box::new(inner),
  };
  assert_eq!(
    error.to_string(),
    "aggregation of group 'order-1' (3 members) failed in aggregator (EventCorrelator)"
  );
  assert!(error.event().is_some());
  assert!(error.source().unwrap().to_string().contains("bad member"));
}

#[test]
fn test_timeouts() {
  let correlation = RoutingError::CorrelationTimeout {
    group_id: "g".to_string(),
    members: 1,
  };
  let response = RoutingError::ResponseTimeout {
    correlation_id: "c".to_string(),
    timeout: Duration::from_millis(5),
  };
  assert!(correlation.is_timeout());
  assert!(response.is_timeout());
  assert!(
    !RoutingError::Cancelled {
      correlation_id: "c".to_string()
    }
    .is_timeout()
  );
  assert!(response.to_string().contains("'c'"));
}

#[test]
fn test_processing_wraps_any_error() {
  let error = RoutingError::processing(component(), "listener offline");
  assert_eq!(
    error.to_string(),
    "processing failed in aggregator (EventCorrelator): listener offline"
  );
  let error = RoutingError::processing(component(), StringError("typed".to_string()));
  assert_eq!(error.source().unwrap().to_string(), "typed");
}

#[test]
fn test_transaction_errors_convert() {
  let error: RoutingError = TransactionError::NoTransaction.into();
  assert!(matches!(
    error,
    RoutingError::Transaction(TransactionError::NoTransaction)
  ));
  assert_eq!(error.to_string(), "No transaction bound to this context");
}

#[test]
fn test_transaction_error_display() {
  let context_error = TransactionError::AlreadyBound(transaction_id());
  assert!(context_error.to_string().contains("already bound"));
}

fn transaction_id() -> TransactionId {
  let runtime = tokio::runtime::Builder::new_current_thread()
    .build()
    .unwrap();
  runtime.block_on(async {
    let context = crate::transaction::TransactionContext::default();
    context.begin().await.unwrap()
  })
}

#[test]
fn test_group_already_processed() {
  let error = RoutingError::GroupAlreadyProcessed {
    group_id: "order-1".to_string(),
  };
  assert_eq!(error.to_string(), "group 'order-1' has already been processed");
  assert!(error.event().is_none());
}
