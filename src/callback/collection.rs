use super::EventCorrelatorCallback;
use crate::error::RoutingError;
use crate::group::EventGroup;
use crate::message::Event;

/// Aggregates a group into one collection event once it is complete.
///
/// A group is complete when it reaches the size announced by its members'
/// [`GroupCorrelation`](crate::message::GroupCorrelation), or the fixed size
/// configured with [`with_fixed_size`](Self::with_fixed_size) when members do
/// not announce one.
#[derive(Debug, Clone, Default)]
pub struct CollectionCorrelatorCallback {
  fixed_size: Option<usize>,
}

impl CollectionCorrelatorCallback {
  /// Creates a callback relying on announced group sizes only.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the group size used when members do not announce one.
  pub fn with_fixed_size(mut self, size: usize) -> Self {
    self.fixed_size = Some(size);
    self
  }
}

impl EventCorrelatorCallback for CollectionCorrelatorCallback {
  fn create_event_group(&self, event: &Event, group_id: &str) -> EventGroup {
    let expected = event
      .group_correlation()
      .and_then(|g| g.group_size)
      .or(self.fixed_size);
    EventGroup::new(group_id, expected)
  }

  fn should_aggregate_events(&self, group: &EventGroup) -> bool {
    group.is_complete()
  }

  fn aggregate_events(&self, group: &EventGroup) -> Result<Event, RoutingError> {
    Ok(group.message_collection_event().clone())
  }
}
