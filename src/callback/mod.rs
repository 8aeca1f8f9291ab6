//! Aggregation policies plugged into an [`EventCorrelator`](crate::correlator::EventCorrelator).
//!
//! The correlator owns group lifecycle and persistence; the callback decides
//! what a group is, when it is ready, and what it aggregates to. Callbacks must
//! be side-effect free outside the group they are handed: the correlator may
//! evaluate `should_aggregate_events` on a group reloaded from the store any
//! number of times.

mod collection;
mod resequence;


pub use collection::CollectionCorrelatorCallback;
pub use resequence::ResequenceCorrelatorCallback;

use crate::error::RoutingError;
use crate::group::EventGroup;
use crate::message::Event;

/// Router-specific aggregation policy.
pub trait EventCorrelatorCallback: Send + Sync {
  /// Computes the group key for an event.
  ///
  /// Defaults to the event's correlation id. Returning `None` makes the
  /// correlator reject the event with [`RoutingError::NoCorrelationId`].
  fn group_id(&self, event: &Event) -> Option<String> {
    event.correlation_id().map(str::to_owned)
  }

  /// Creates a fresh, empty group for the first event of a new group id.
  ///
  /// The event itself is added by the correlator afterwards.
  fn create_event_group(&self, event: &Event, group_id: &str) -> EventGroup;

  /// Decides whether the group is ready to be aggregated.
  ///
  /// Must be deterministic for the same group contents.
  fn should_aggregate_events(&self, group: &EventGroup) -> bool;

  /// Builds the single output event from every member of the group.
  fn aggregate_events(&self, group: &EventGroup) -> Result<Event, RoutingError>;
}
