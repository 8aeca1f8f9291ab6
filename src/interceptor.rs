//! # Processor interception
//!
//! Wraps a [`Processor`] with an ordered list of interceptors. The shape of
//! each interceptor is fixed when it is registered: an [`Interception::Hooks`]
//! only observes the call, an [`Interception::Around`] also decides whether
//! the call happens at all.
//!
//! ## Ordering
//!
//! 1. Every `before` runs in registration order. The first failure stops the
//!    chain; neither `around` nor the processor runs.
//! 2. `around` interceptors nest, the first registered outermost. Each one
//!    may [`proceed`](InterceptionAction::proceed),
//!    [`skip`](InterceptionAction::skip) or
//!    [`fail`](InterceptionAction::fail).
//! 3. Every `after` whose `before` was invoked runs in reverse order, seeing
//!    either the result or the failure. A failing `after` replaces the result
//!    handed to the remaining `after`s and to the caller.

use crate::error::{ComponentInfo, RoutingError};
use crate::message::Event;
use crate::processor::Processor;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::trace;

/// Observes processor invocations.
#[async_trait]
pub trait ProcessorInterceptor: Send + Sync {
  /// Runs before the processor. May modify the event.
  async fn before(&self, _component: &ComponentInfo, _event: &mut Event) -> Result<(), RoutingError> {
    Ok(())
  }

  /// Runs after the processor, or after an earlier stage failed.
  async fn after(
    &self,
    _component: &ComponentInfo,
    _result: Option<&Event>,
    _error: Option<&RoutingError>,
  ) -> Result<(), RoutingError> {
    Ok(())
  }
}

/// Interceptor that also wraps the invocation itself.
#[async_trait]
pub trait AroundInterceptor: ProcessorInterceptor {
  /// Decides how the invocation proceeds through `action`.
  async fn around(
    &self,
    component: &ComponentInfo,
    event: Event,
    action: InterceptionAction<'_>,
  ) -> Result<Event, RoutingError>;
}

/// Interception strategy of one registered interceptor.
#[derive(Clone)]
pub enum Interception {
  /// Before and after hooks only.
  Hooks(Arc<dyn ProcessorInterceptor>),
  /// Before, around and after.
  Around(Arc<dyn AroundInterceptor>),
}

impl std::fmt::Debug for Interception {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Interception::Hooks(_) => f.write_str("Interception::Hooks"),
      Interception::Around(_) => f.write_str("Interception::Around"),
    }
  }
}

impl Interception {
  /// Registers a hooks-only interceptor.
  pub fn hooks(interceptor: impl ProcessorInterceptor + 'static) -> Self {
    Interception::Hooks(Arc::new(interceptor))
  }

  /// Registers an around interceptor.
  pub fn around(interceptor: impl AroundInterceptor + 'static) -> Self {
    Interception::Around(Arc::new(interceptor))
  }

  async fn before(&self, component: &ComponentInfo, event: &mut Event) -> Result<(), RoutingError> {
    match self {
      Interception::Hooks(i) => i.before(component, event).await,
      Interception::Around(i) => i.before(component, event).await,
    }
  }

  async fn after(
    &self,
    component: &ComponentInfo,
    result: Option<&Event>,
    error: Option<&RoutingError>,
  ) -> Result<(), RoutingError> {
    match self {
      Interception::Hooks(i) => i.after(component, result, error).await,
      Interception::Around(i) => i.after(component, result, error).await,
    }
  }
}

/// Continuation handed to [`AroundInterceptor::around`].
pub struct InterceptionAction<'a> {
  component: &'a ComponentInfo,
  remaining: &'a [Arc<dyn AroundInterceptor>],
  processor: &'a dyn Processor,
}

impl<'a> InterceptionAction<'a> {
  /// Continues with the next around interceptor, or the processor.
  pub fn proceed(self, event: Event) -> BoxFuture<'a, Result<Event, RoutingError>> {
    Box::pin(async move {
      match self.remaining.split_first() {
        Some((next, rest)) => {
          let action = InterceptionAction {
            component: self.component,
            remaining: rest,
            processor: self.processor,
          };
          next.around(self.component, event, action).await
        }
        None => self.processor.process(event).await,
      }
    })
  }

  /// Skips the processor, returning `event` as the result.
  pub fn skip(self, event: Event) -> Result<Event, RoutingError> {
    trace!(component = %self.component, "processor skipped by interceptor");
    Ok(event)
  }

  /// Skips the processor, failing with `error`.
  pub fn fail(self, error: RoutingError) -> Result<Event, RoutingError> {
    Err(error)
  }
}

/// A processor wrapped by an interceptor chain.
pub struct InterceptedProcessor {
  processor: Arc<dyn Processor>,
  component: ComponentInfo,
  interceptors: Vec<Interception>,
  arounds: Vec<Arc<dyn AroundInterceptor>>,
}

impl InterceptedProcessor {
  /// Wraps `processor` with `interceptors`, first registered outermost.
  pub fn new(processor: Arc<dyn Processor>, interceptors: Vec<Interception>) -> Self {
    let arounds = interceptors
      .iter()
      .filter_map(|i| match i {
        Interception::Around(a) => Some(Arc::clone(a)),
        Interception::Hooks(_) => None,
      })
      .collect();
    Self {
      component: processor.component_info(),
      processor,
      interceptors,
      arounds,
    }
  }

  /// Returns the registered interceptors.
  pub fn interceptors(&self) -> &[Interception] {
    &self.interceptors
  }
}

#[async_trait]
impl Processor for InterceptedProcessor {
  async fn process(&self, mut event: Event) -> Result<Event, RoutingError> {
    let component = &self.component;
    let mut invoked = 0;
    let mut failure = None;
    for interceptor in &self.interceptors {
      invoked += 1;
      if let Err(e) = interceptor.before(component, &mut event).await {
        failure = Some(e);
        break;
      }
    }

    let mut result = match failure {
      Some(e) => Err(e),
      None => {
        let action = InterceptionAction {
          component,
          remaining: &self.arounds,
          processor: self.processor.as_ref(),
        };
        action.proceed(event).await
      }
    };

    for interceptor in self.interceptors[..invoked].iter().rev() {
      let outcome = match &result {
        Ok(event) => interceptor.after(component, Some(event), None).await,
        Err(error) => interceptor.after(component, None, Some(error)).await,
      };
      if let Err(e) = outcome {
        result = Err(e);
      }
    }
    result
  }

  fn component_info(&self) -> ComponentInfo {
    self.component.clone()
  }
}
