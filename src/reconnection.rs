//! # Reconnection policies
//!
//! A [`RetryPolicyTemplate`] runs connection work under a [`RetryPolicy`],
//! recording every attempt in a [`RetryContext`]. A [`ReconnectionConfig`]
//! pairs a template with the `fails_deployment` flag and decides whether the
//! template runs in the caller's task or in the background.
//!
//! Background retry is turned off for lazily initialized components and
//! whenever [`DISABLE_ASYNC_RETRY_ENV`] is set, which keeps test runs
//! deterministic.

use crate::error::BoxError;
use crate::message::Event;
use crate::notification::{NotificationDispatcher, RetryNotification};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable forcing blocking retry templates.
pub const DISABLE_ASYNC_RETRY_ENV: &str = "EVENTWEAVE_DISABLE_ASYNC_RETRY";

/// Reads [`DISABLE_ASYNC_RETRY_ENV`]; `true` or `1` disables background retry.
pub fn disable_async_from_env() -> bool {
  std::env::var(DISABLE_ASYNC_RETRY_ENV)
    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    .unwrap_or(false)
}

/// How failed work is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
  /// Fail on the first error.
  #[default]
  NoRetry,
  /// Retry up to `count` times, waiting `frequency` between attempts.
  Simple {
    /// Number of retries after the first attempt.
    count: u32,
    /// Delay between attempts.
    frequency: Duration,
  },
  /// Retry until the work succeeds or the template is cancelled.
  Forever {
    /// Delay between attempts.
    frequency: Duration,
  },
}

impl RetryPolicy {
  /// Returns the delay before the next attempt after `failures` failed
  /// attempts, or `None` when the policy gives up.
  pub fn next_delay(&self, failures: u32) -> Option<Duration> {
    match *self {
      RetryPolicy::NoRetry => None,
      RetryPolicy::Simple { count, frequency } => (failures <= count).then_some(frequency),
      RetryPolicy::Forever { frequency } => Some(frequency),
    }
  }
}

/// Record of one retried execution.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
  description: String,
  attempts: u32,
  return_messages: Vec<Event>,
  last_failure: Option<String>,
  ok: bool,
}

impl RetryContext {
  /// Creates an empty context.
  pub fn new(description: impl Into<String>) -> Self {
    Self {
      description: description.into(),
      ..Self::default()
    }
  }

  /// Describes the work being retried.
  pub fn description(&self) -> &str {
    &self.description
  }

  /// Number of attempts made.
  pub fn attempts(&self) -> u32 {
    self.attempts
  }

  /// Appends a message produced by the work.
  pub fn add_return_message(&mut self, message: Event) {
    self.return_messages.push(message);
  }

  /// Messages produced by the work, in the order they were added.
  pub fn return_messages(&self) -> &[Event] {
    &self.return_messages
  }

  /// Text of the most recent failure.
  pub fn last_failure(&self) -> Option<&str> {
    self.last_failure.as_deref()
  }

  /// True once the work has succeeded.
  pub fn is_ok(&self) -> bool {
    self.ok
  }

  fn set_ok(&mut self) {
    self.ok = true;
  }

  fn set_failed(&mut self, error: &BoxError) {
    self.ok = false;
    self.last_failure = Some(error.to_string());
  }
}

/// Error type for retried work.
#[derive(Debug, Error)]
pub enum RetryError {
  /// The policy gave up.
  #[error("'{}' failed after {attempts} attempt(s): {source}", .context.description())]
  Exhausted {
    /// Number of attempts made.
    attempts: u32,
    /// Record of the execution.
    context: Box<RetryContext>,
    /// Last failure.
    #[source]
    source: BoxError,
  },
  /// The template was cancelled while waiting between attempts.
  #[error("retry of '{description}' cancelled after {attempts} attempt(s)")]
  Cancelled {
    /// Work description.
    description: String,
    /// Number of attempts made.
    attempts: u32,
  },
  /// A background execution could not be joined.
  #[error("background retry task failed: {0}")]
  Join(String),
}

/// Outcome of [`RetryPolicyTemplate::run`].
#[derive(Debug)]
pub enum RetryExecution {
  /// The work ran in the caller's task.
  Completed(Result<RetryContext, RetryError>),
  /// The work runs in the background.
  Scheduled(JoinHandle<Result<RetryContext, RetryError>>),
}

impl RetryExecution {
  /// Waits for the execution to finish.
  pub async fn wait(self) -> Result<RetryContext, RetryError> {
    match self {
      RetryExecution::Completed(result) => result,
      RetryExecution::Scheduled(handle) => handle
        .await
        .map_err(|e| RetryError::Join(e.to_string()))?,
    }
  }
}

/// Runs work under a retry policy.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyTemplate {
  policy: RetryPolicy,
  asynchronous: bool,
  notifications: Option<NotificationDispatcher>,
  cancel: CancellationToken,
}

impl RetryPolicyTemplate {
  /// Creates a blocking template.
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      policy,
      ..Self::default()
    }
  }

  /// Runs [`run`](Self::run) in the background when `asynchronous`.
  pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
    self.asynchronous = asynchronous;
    self
  }

  /// Fires retry notifications through `notifications`.
  pub fn with_notifications(mut self, notifications: NotificationDispatcher) -> Self {
    self.notifications = Some(notifications);
    self
  }

  /// Stops waiting between attempts once `cancel` fires.
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Returns the policy.
  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// True if [`run`](Self::run) schedules work in the background.
  pub fn is_asynchronous(&self) -> bool {
    self.asynchronous
  }

  /// Returns a blocking copy of this template.
  pub fn blocking(&self) -> Self {
    Self {
      asynchronous: false,
      ..self.clone()
    }
  }

  /// Runs `work` until it succeeds or the policy gives up.
  ///
  /// A message returned by a successful attempt is recorded in the context.
  pub async fn execute<F, Fut, E>(
    &self,
    description: &str,
    mut work: F,
  ) -> Result<RetryContext, RetryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Event>, E>>,
    E: Into<BoxError>,
  {
    let mut context = RetryContext::new(description);
    loop {
      context.attempts += 1;
      let error: BoxError = match work().await {
        Ok(message) => {
          if let Some(message) = message {
            context.add_return_message(message);
          }
          context.set_ok();
          if context.attempts > 1 {
            info!(description, attempts = context.attempts, "work recovered");
            self.fire(RetryNotification::Recovered {
              attempts: context.attempts,
            });
          }
          return Ok(context);
        }
        Err(e) => e.into(),
      };
      context.set_failed(&error);

      let Some(delay) = self.policy.next_delay(context.attempts) else {
        warn!(description, attempts = context.attempts, error = %error, "giving up");
        self.fire(RetryNotification::Exhausted {
          attempts: context.attempts,
        });
        return Err(RetryError::Exhausted {
          attempts: context.attempts,
          context: Box::new(context),
          source: error,
        });
      };

      debug!(
        description,
        attempt = context.attempts,
        ?delay,
        error = %error,
        "attempt failed, retrying"
      );
      self.fire(RetryNotification::AttemptFailed {
        attempt: context.attempts,
        error: error.to_string(),
      });
      tokio::select! {
        _ = self.cancel.cancelled() => {
          return Err(RetryError::Cancelled {
            description: description.to_string(),
            attempts: context.attempts,
          });
        }
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }

  /// Runs [`execute`](Self::execute) on its own task.
  pub fn execute_async<F, Fut, E>(
    &self,
    description: impl Into<String>,
    work: F,
  ) -> JoinHandle<Result<RetryContext, RetryError>>
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Event>, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
  {
    let template = self.clone();
    let description = description.into();
    tokio::spawn(async move { template.execute(&description, work).await })
  }

  /// Runs `work` in the caller's task or in the background depending on
  /// [`is_asynchronous`](Self::is_asynchronous).
  pub async fn run<F, Fut, E>(&self, description: impl Into<String>, work: F) -> RetryExecution
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<Event>, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
  {
    if self.asynchronous {
      RetryExecution::Scheduled(self.execute_async(description, work))
    } else {
      RetryExecution::Completed(self.execute(&description.into(), work).await)
    }
  }

  fn fire(&self, notification: RetryNotification) {
    if let Some(notifications) = &self.notifications {
      notifications.fire(notification);
    }
  }
}

/// Reconnection settings of a connected component.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
  fails_deployment: bool,
  template: RetryPolicyTemplate,
}

impl Default for ReconnectionConfig {
  fn default() -> Self {
    Self::new(false, RetryPolicyTemplate::default())
  }
}

impl ReconnectionConfig {
  /// Creates a configuration.
  pub fn new(fails_deployment: bool, template: RetryPolicyTemplate) -> Self {
    Self {
      fails_deployment,
      template,
    }
  }

  /// True if a failed connectivity test blocks deployment.
  pub fn fails_deployment(&self) -> bool {
    self.fails_deployment
  }

  /// Returns the configured template as is.
  pub fn template(&self) -> &RetryPolicyTemplate {
    &self.template
  }

  /// Returns the template to use: blocking when the component initializes
  /// lazily or background retry is disabled, the configured one otherwise.
  pub fn resolve_template(&self, lazy_init: bool, disable_async: bool) -> RetryPolicyTemplate {
    if lazy_init || disable_async {
      self.template.blocking()
    } else {
      self.template.clone()
    }
  }

  /// Runs a connectivity test with the blocking template.
  ///
  /// When the test fails and the component does not fail deployment, the
  /// failure is logged and the returned context records it.
  pub async fn test_connectivity<F, Fut, E>(
    &self,
    description: &str,
    mut connect: F,
  ) -> Result<RetryContext, RetryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Into<BoxError>,
  {
    let result = self
      .template
      .blocking()
      .execute(description, || {
        let attempt = connect();
        async move { attempt.await.map(|()| None) }
      })
      .await;
    match result {
      Ok(context) => Ok(context),
      Err(RetryError::Exhausted { context, source, .. }) if !self.fails_deployment => {
        warn!(
          description,
          error = %source,
          "connectivity test failed, continuing because the component does not fail deployment"
        );
        Ok(*context)
      }
      Err(e) => Err(e),
    }
  }
}
