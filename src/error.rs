//! # Routing error taxonomy
//!
//! Every failure that escapes a correlator, requester or interceptor chain is a
//! [`RoutingError`]. Variants carry the [`ComponentInfo`] of the component that
//! failed and, where one exists, the event being routed, so the invoking flow
//! can decide on dead-lettering or redelivery.
//!
//! ## Taxonomy
//!
//! - **Routing**: aggregation-level failure raised by a correlator callback
//! - **NoCorrelationId**: an event reached a correlator without a correlation id
//! - **ObjectStore**: the backing store failed; never retried internally
//! - **Aggregation**: wraps a callback failure with the failing group's context
//! - **CorrelationTimeout**: a group did not complete before expiry
//! - **ResponseTimeout**: an async-reply wait exceeded its timeout
//! - **Processing**: a downstream processor failed
//! - **GroupAlreadyProcessed**: a wait targeted a finalized group
//! - **Transaction**: beginning or completing a transaction failed
//! - **Cancelled**: a wait was cancelled through its context token

use crate::message::Event;
use crate::store::ObjectStoreError;
use crate::transaction::TransactionError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used where a collaborator may fail with any error type.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Information about a routing component.
///
/// This struct provides identifying information about a component,
/// including its name and type, which is useful for logging and error reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
  /// The name of the component.
  pub name: String,
  /// The type name of the component.
  pub type_name: String,
}

impl Default for ComponentInfo {
  fn default() -> Self {
    Self {
      name: "default".to_string(),
      type_name: "default".to_string(),
    }
  }
}

impl ComponentInfo {
  /// Creates a new `ComponentInfo` with the given name and type name.
  pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      type_name: type_name.into(),
    }
  }
}

impl fmt::Display for ComponentInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.name, self.type_name)
  }
}

/// A simple error type that wraps a string message.
///
/// Used when a failure has to cross a boundary that only keeps its text, e.g.
/// when notifying several waiters of the same aggregation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringError(pub String);

impl fmt::Display for StringError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl Error for StringError {}

/// Error raised by routing components.
#[derive(Debug, Error)]
pub enum RoutingError {
  /// Aggregation-level failure carrying the event and failing component.
  #[error("routing failed in {component}: {message}")]
  Routing {
    /// Human-readable reason.
    message: String,
    /// Event being routed when the failure happened.
    event: Box<Event>,
    /// Component that failed.
    component: ComponentInfo,
  },

  /// The event has no usable correlation id.
  #[error("event {} has no correlation id, cannot be routed by {component}", .event.id())]
  NoCorrelationId {
    /// The uncorrelated event.
    event: Box<Event>,
    /// Component that rejected it.
    component: ComponentInfo,
  },

  /// The backing object store failed.
  #[error("object store failure in {component}: {source}")]
  ObjectStore {
    /// Event being routed, when the failure happened while routing one.
    event: Option<Box<Event>>,
    /// Component that owns the store partition.
    component: ComponentInfo,
    /// Underlying store error.
    #[source]
    source: ObjectStoreError,
  },

  /// Aggregating a group failed; the group has already been removed.
  #[error("aggregation of group '{group_id}' ({members} members) failed in {component}")]
  Aggregation {
    /// Id of the group whose aggregation failed.
    group_id: String,
    /// Number of members in the group.
    members: usize,
    /// Component that owns the group.
    component: ComponentInfo,
    /// Failure raised by the callback.
    #[source]
    source: Box<RoutingError>,
  },

  /// A correlation group expired before it completed.
  #[error("correlation timed out for group '{group_id}' with {members} members")]
  CorrelationTimeout {
    /// Expired group id.
    group_id: String,
    /// Number of members received before expiry.
    members: usize,
  },

  /// No reply arrived in time for an async request.
  #[error("response timed out after {timeout:?} waiting for reply to '{correlation_id}'")]
  ResponseTimeout {
    /// Correlation id of the request.
    correlation_id: String,
    /// Timeout that elapsed.
    timeout: Duration,
  },

  /// A processor failed.
  #[error("processing failed in {component}: {source}")]
  Processing {
    /// Failing processor.
    component: ComponentInfo,
    /// Underlying error.
    #[source]
    source: BoxError,
  },

  /// A wait was registered for a group that has already been finalized.
  #[error("group '{group_id}' has already been processed")]
  GroupAlreadyProcessed {
    /// Finalized group id.
    group_id: String,
  },

  /// Transaction demarcation failed.
  #[error(transparent)]
  Transaction(#[from] TransactionError),

  /// A pending wait was cancelled.
  #[error("wait for '{correlation_id}' was cancelled")]
  Cancelled {
    /// Correlation id of the cancelled wait.
    correlation_id: String,
  },
}

impl RoutingError {
  /// Creates a [`RoutingError::Routing`].
  pub fn routing(message: impl Into<String>, event: Event, component: ComponentInfo) -> Self {
    RoutingError::Routing {
      message: message.into(),
      event: Box::new(event),
      component,
    }
  }

  /// Creates a [`RoutingError::Processing`] from any error.
  pub fn processing<E>(component: ComponentInfo, source: E) -> Self
  where
    E: Into<BoxError>,
  {
    RoutingError::Processing {
      component,
      source: source.into(),
    }
  }

  /// Returns the event attached to this error, if any.
  pub fn event(&self) -> Option<&Event> {
    match self {
      RoutingError::Routing { event, .. } | RoutingError::NoCorrelationId { event, .. } => {
        Some(event)
      }
      RoutingError::ObjectStore { event, .. } => event.as_deref(),
      RoutingError::Aggregation { source, .. } => source.event(),
      _ => None,
    }
  }

  /// Returns true for either timeout variant.
  pub fn is_timeout(&self) -> bool {
    matches!(
      self,
      RoutingError::CorrelationTimeout { .. } | RoutingError::ResponseTimeout { .. }
    )
  }
}
