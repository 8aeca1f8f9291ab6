//! The processor capability shared by every routing component.
//!
//! Timeout handlers, async-reply listeners and intercepted components are all
//! [`Processor`]s. [`processor_fn`] adapts an async closure for the common case.

use crate::error::{ComponentInfo, RoutingError};
use crate::message::Event;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Something that processes an event and produces a result event.
#[async_trait]
pub trait Processor: Send + Sync {
  /// Processes an event.
  async fn process(&self, event: Event) -> Result<Event, RoutingError>;

  /// Identifies the processor in errors and logs.
  fn component_info(&self) -> ComponentInfo {
    ComponentInfo::new("processor", std::any::type_name::<Self>())
  }
}

impl std::fmt::Debug for dyn Processor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Processor({})", self.component_info())
  }
}

#[async_trait]
impl<P> Processor for Arc<P>
where
  P: Processor + ?Sized,
{
  async fn process(&self, event: Event) -> Result<Event, RoutingError> {
    (**self).process(event).await
  }

  fn component_info(&self) -> ComponentInfo {
    (**self).component_info()
  }
}

/// Wrapper that implements `Processor` for async closures.
struct ProcessorFn<F> {
  name: String,
  function: F,
}

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
  F: Fn(Event) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Event, RoutingError>> + Send,
{
  async fn process(&self, event: Event) -> Result<Event, RoutingError> {
    (self.function)(event).await
  }

  fn component_info(&self) -> ComponentInfo {
    ComponentInfo::new(self.name.clone(), "ProcessorFn")
  }
}

/// Creates a named `Processor` from an async closure.
pub fn processor_fn<F, Fut>(name: impl Into<String>, function: F) -> Arc<dyn Processor>
where
  F: Fn(Event) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Event, RoutingError>> + Send + 'static,
{
  Arc::new(ProcessorFn {
    name: name.into(),
    function,
  })
}
