//! Event envelope types routed through correlators and requesters.
//!
//! An [`Event`] is the unit of work every component in this crate consumes and
//! produces. It carries a unique [`EventId`], an optional correlation id used to
//! group related events, optional [`GroupCorrelation`] sequencing information and
//! a JSON payload.
//!
//! # Example
//!
//! ```rust
//! use eventweave::message::{Event, GroupCorrelation};
//! use serde_json::json;
//!
//! let event = Event::new(json!({"order": 42}))
//!   .with_correlation_id("order-42")
//!   .with_group_correlation(GroupCorrelation::new(0, 3));
//!
//! assert_eq!(event.correlation_id(), Some("order-42"));
//! assert_eq!(event.group_correlation().and_then(|g| g.group_size), Some(3));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Correlation id value that producers use to mean "not correlated".
pub const NO_CORRELATION_ID: &str = "-1";

/// A unique identifier for events.
///
/// Ids are random 128-bit values rendered in the canonical UUIDv4 layout.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
  /// Generates a new random id.
  #[must_use]
  pub fn new_uuid() -> Self {
    let raw: u128 = rand::random();
    // Set version 4 and variant bits
    let uuid = (raw & !(0xF << 76) | (0x4 << 76)) & !(0x3 << 62) | (0x2 << 62);
    EventId(format!(
      "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
      (uuid >> 96) as u32,
      (uuid >> 80) as u16,
      (uuid >> 64) as u16,
      (uuid >> 48) as u16,
      (uuid & 0xFFFF_FFFF_FFFF) as u64
    ))
  }

  /// Creates an id from a caller-supplied string (e.g. a transport message id).
  #[must_use]
  pub fn new_custom(id: impl Into<String>) -> Self {
    EventId(id.into())
  }

  /// Returns the id as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for EventId {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Default for EventId {
  fn default() -> Self {
    EventId::new_uuid()
  }
}

/// Position of an event inside a logical group of events.
///
/// Splitters stamp each part with its sequence number and the total number of
/// parts, which aggregators use to decide completeness.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupCorrelation {
  /// Zero-based position within the group, when known.
  pub sequence: Option<usize>,
  /// Total number of events in the group, when known.
  pub group_size: Option<usize>,
}

impl GroupCorrelation {
  /// Creates a group correlation with both a sequence and a group size.
  pub const fn new(sequence: usize, group_size: usize) -> Self {
    Self {
      sequence: Some(sequence),
      group_size: Some(group_size),
    }
  }

  /// Creates a group correlation that only declares the group size.
  pub const fn of_size(group_size: usize) -> Self {
    Self {
      sequence: None,
      group_size: Some(group_size),
    }
  }
}

/// An event flowing through the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
  id: EventId,
  correlation_id: Option<String>,
  group_correlation: Option<GroupCorrelation>,
  payload: serde_json::Value,
  #[serde(default)]
  properties: BTreeMap<String, String>,
  created: DateTime<Utc>,
}

impl Event {
  /// Creates a new uncorrelated event carrying `payload`.
  pub fn new(payload: serde_json::Value) -> Self {
    Self {
      id: EventId::new_uuid(),
      correlation_id: None,
      group_correlation: None,
      payload,
      properties: BTreeMap::new(),
      created: Utc::now(),
    }
  }

  /// Replaces the event id.
  #[must_use]
  pub fn with_id(mut self, id: EventId) -> Self {
    self.id = id;
    self
  }

  /// Sets the correlation id.
  #[must_use]
  pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
    self.correlation_id = Some(correlation_id.into());
    self
  }

  /// Sets the group correlation.
  #[must_use]
  pub fn with_group_correlation(mut self, group_correlation: GroupCorrelation) -> Self {
    self.group_correlation = Some(group_correlation);
    self
  }

  /// Adds a string property.
  #[must_use]
  pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.properties.insert(key.into(), value.into());
    self
  }

  /// Replaces the payload.
  #[must_use]
  pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
    self.payload = payload;
    self
  }

  /// Returns the event id.
  pub fn id(&self) -> &EventId {
    &self.id
  }

  /// Returns the correlation id, ignoring the `"-1"` sentinel.
  pub fn correlation_id(&self) -> Option<&str> {
    self
      .correlation_id
      .as_deref()
      .filter(|id| *id != NO_CORRELATION_ID)
  }

  /// Returns the group correlation, if any.
  pub fn group_correlation(&self) -> Option<&GroupCorrelation> {
    self.group_correlation.as_ref()
  }

  /// Returns the payload.
  pub fn payload(&self) -> &serde_json::Value {
    &self.payload
  }

  /// Returns a property value.
  pub fn property(&self, key: &str) -> Option<&str> {
    self.properties.get(key).map(String::as_str)
  }

  /// Returns all properties.
  pub fn properties(&self) -> &BTreeMap<String, String> {
    &self.properties
  }

  /// Returns when the event was created.
  pub fn created(&self) -> DateTime<Utc> {
    self.created
  }

  /// Sets the correlation id in place.
  pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
    self.correlation_id = Some(correlation_id.into());
  }

  /// Sets the payload in place.
  pub fn set_payload(&mut self, payload: serde_json::Value) {
    self.payload = payload;
  }

  /// Sets a property in place.
  pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.properties.insert(key.into(), value.into());
  }
}
