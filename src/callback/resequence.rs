use super::EventCorrelatorCallback;
use crate::error::{ComponentInfo, RoutingError};
use crate::group::EventGroup;
use crate::message::{Event, GroupCorrelation};

/// Restores the original order of a group before aggregating it.
///
/// Completion follows the announced group size. The aggregate is a collection
/// event whose payload lists member payloads sorted by sequence number; a member
/// without a sequence number fails the aggregation.
#[derive(Debug, Clone)]
pub struct ResequenceCorrelatorCallback {
  component: ComponentInfo,
}

impl ResequenceCorrelatorCallback {
  /// Creates a resequencer callback reporting failures as `name`.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      component: ComponentInfo::new(name, "Resequencer"),
    }
  }
}

impl Default for ResequenceCorrelatorCallback {
  fn default() -> Self {
    Self::new("resequencer")
  }
}

impl EventCorrelatorCallback for ResequenceCorrelatorCallback {
  fn create_event_group(&self, event: &Event, group_id: &str) -> EventGroup {
    EventGroup::new(group_id, event.group_correlation().and_then(|g| g.group_size))
  }

  fn should_aggregate_events(&self, group: &EventGroup) -> bool {
    group.is_complete()
  }

  fn aggregate_events(&self, group: &EventGroup) -> Result<Event, RoutingError> {
    let mut ordered = Vec::with_capacity(group.size());
    for member in group.members() {
      let Some(sequence) = member.group_correlation().and_then(|g| g.sequence) else {
        return Err(RoutingError::routing(
          format!(
            "event {} in group '{}' has no sequence number",
            member.id(),
            group.group_id()
          ),
          member.clone(),
          self.component.clone(),
        ));
      };
      ordered.push((sequence, member));
    }
    ordered.sort_by_key(|(sequence, _)| *sequence);

    let payloads = ordered.iter().map(|(_, m)| m.payload().clone()).collect();
    let mut event =
      Event::new(serde_json::Value::Array(payloads)).with_correlation_id(group.group_id());
    if let Some(expected) = group.expected_size() {
      event = event.with_group_correlation(GroupCorrelation::of_size(expected));
    }
    Ok(event)
  }
}
