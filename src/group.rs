//! In-progress aggregation batches.
//!
//! An [`EventGroup`] accumulates every event that shares a correlation id until
//! the owning correlator's callback decides it is complete, the group expires,
//! or it is force-expired. Groups are persisted through the object store between
//! every mutation, so anything not serializable (the lazily built collection
//! event, the owning component) is transient and re-linked by
//! [`EventGroup::init_after_deserialization`].

use crate::error::ComponentInfo;
use crate::message::{Event, GroupCorrelation};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Transient context a group is re-linked to after being loaded from a store.
#[derive(Debug, Clone)]
pub struct GroupContext {
  /// Component owning the group.
  pub component: ComponentInfo,
}

impl GroupContext {
  /// Creates a context for the given component.
  pub fn new(component: ComponentInfo) -> Self {
    Self { component }
  }
}

/// One in-progress aggregation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventGroup {
  group_id: String,
  members: Vec<Event>,
  created: DateTime<Utc>,
  expected_size: Option<usize>,
  #[serde(skip)]
  collection: OnceLock<Event>,
  #[serde(skip)]
  owner: Option<ComponentInfo>,
}

impl EventGroup {
  /// Creates an empty group.
  pub fn new(group_id: impl Into<String>, expected_size: Option<usize>) -> Self {
    Self::with_created(group_id, expected_size, Utc::now())
  }

  /// Creates an empty group with an explicit creation time.
  ///
  /// Used when restoring groups from another system and by expiry tests.
  pub fn with_created(
    group_id: impl Into<String>,
    expected_size: Option<usize>,
    created: DateTime<Utc>,
  ) -> Self {
    Self {
      group_id: group_id.into(),
      members: Vec::new(),
      created,
      expected_size,
      collection: OnceLock::new(),
      owner: None,
    }
  }

  /// Returns the correlation key of the group.
  pub fn group_id(&self) -> &str {
    &self.group_id
  }

  /// Returns the members in arrival order.
  pub fn members(&self) -> &[Event] {
    &self.members
  }

  /// Consumes the group and returns its members in arrival order.
  pub fn into_members(self) -> Vec<Event> {
    self.members
  }

  /// Returns the number of members received so far.
  pub fn size(&self) -> usize {
    self.members.len()
  }

  /// Returns true if no member has been added yet.
  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  /// Returns the number of members the group expects, if known.
  pub fn expected_size(&self) -> Option<usize> {
    self.expected_size
  }

  /// Returns when the group was created.
  pub fn created(&self) -> DateTime<Utc> {
    self.created
  }

  /// Returns the component the group was last linked to.
  pub fn owner(&self) -> Option<&ComponentInfo> {
    self.owner.as_ref()
  }

  /// Returns true once the expected number of members has arrived.
  ///
  /// Groups without an expected size are never complete on their own.
  pub fn is_complete(&self) -> bool {
    self
      .expected_size
      .is_some_and(|expected| self.members.len() >= expected)
  }

  /// Returns true if the group is older than `timeout` at `now`.
  pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
    match ChronoDuration::from_std(timeout) {
      Ok(timeout) => self.created + timeout < now,
      Err(_) => false,
    }
  }

  /// Appends a member.
  ///
  /// The first member carrying a group size fixes the expected size when the
  /// group was created without one.
  pub fn add_event(&mut self, event: Event) {
    if self.expected_size.is_none() {
      self.expected_size = event
        .group_correlation()
        .and_then(|g| g.group_size);
    }
    self.members.push(event);
    self.collection = OnceLock::new();
  }

  /// Re-links transient state after the group was loaded from a store.
  ///
  /// Idempotent: calling it on a freshly created group, or several times, has
  /// the same effect as calling it once.
  pub fn init_after_deserialization(&mut self, context: &GroupContext) {
    if self.owner.as_ref() != Some(&context.component) {
      self.owner = Some(context.component.clone());
    }
  }

  /// Returns the group as a single event.
  ///
  /// The payload is the array of member payloads in arrival order and the
  /// correlation id is the group id. Built on first use and cached until the
  /// next [`add_event`](Self::add_event).
  pub fn message_collection_event(&self) -> &Event {
    self.collection.get_or_init(|| {
      let payloads = self.members.iter().map(|m| m.payload().clone()).collect();
      let mut event = Event::new(serde_json::Value::Array(payloads))
        .with_correlation_id(self.group_id.clone());
      if let Some(expected) = self.expected_size {
        event = event.with_group_correlation(GroupCorrelation::of_size(expected));
      }
      event
    })
  }
}
