//! Recorders bridging imperative emitters and lazily subscribed streams.
//!
//! A [`FluxSinkRecorder`] hands out a stream immediately while signals may be
//! emitted before anyone polls it. Signals emitted before the stream is first
//! polled are buffered; on first poll they are replayed in order and the
//! recorder switches permanently to forwarding signals straight to the stream.
//! The switch happens under the same lock that emitters take, so no signal is
//! lost or duplicated across it.
//!
//! A [`MonoSinkRecorder`] does the same for a single terminal signal.

use futures::Stream;
use std::backtrace::Backtrace;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Environment variable enabling stack traces for signals dropped after
/// termination.
pub const PRINT_STACK_TRACES_ON_DROP_ENV: &str = "EVENTWEAVE_PRINT_STACK_TRACES_ON_DROP";

/// Reads [`PRINT_STACK_TRACES_ON_DROP_ENV`]; `true` or `1` enables it.
pub fn print_stack_traces_on_drop_from_env() -> bool {
  std::env::var(PRINT_STACK_TRACES_ON_DROP_ENV)
    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    .unwrap_or(false)
}

/// Failure observed by a recorder's subscriber.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError<E> {
  /// The publisher signalled an error.
  #[error("publisher failed: {0}")]
  Failed(E),
  /// The recorder was dropped without a terminal signal.
  #[error("recorder dropped without a terminal signal")]
  Dropped,
  /// The recorder already had a subscriber.
  #[error("recorder already has a subscriber")]
  AlreadySubscribed,
}

enum Signal<T, E> {
  Next(T),
  Error(E),
  Complete,
}

enum Delegate<T, E> {
  NotYetAccepted(Vec<Signal<T, E>>),
  Direct(mpsc::UnboundedSender<Result<T, E>>),
  Closed,
}

struct Recording<T, E> {
  delegate: Delegate<T, E>,
  attached: bool,
  terminated: bool,
  stack_traces: bool,
  attached_at: Option<Backtrace>,
  terminated_at: Option<Backtrace>,
}

impl<T, E> Recording<T, E> {
  fn capture(&self) -> Option<Backtrace> {
    self.stack_traces.then(Backtrace::force_capture)
  }

  fn report_dropped(&self, signal: &str) {
    if self.stack_traces {
      let terminated_at = self
        .terminated_at
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
      let attached_at = self
        .attached_at
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
      warn!(
        signal,
        %terminated_at,
        %attached_at,
        "signal emitted after the recorder terminated, dropping it"
      );
    } else {
      warn!(signal, "signal emitted after the recorder terminated, dropping it");
    }
  }

  fn emit(&mut self, signal: Signal<T, E>) {
    let terminal = !matches!(signal, Signal::Next(_));
    if terminal {
      self.terminated = true;
      self.terminated_at = self.capture();
    }
    match &mut self.delegate {
      Delegate::NotYetAccepted(buffered) => buffered.push(signal),
      Delegate::Direct(sender) => {
        let _ = match signal {
          Signal::Next(value) => sender.send(Ok(value)),
          Signal::Error(error) => sender.send(Err(error)),
          Signal::Complete => Ok(()),
        };
        if terminal {
          self.delegate = Delegate::Closed;
        }
      }
      Delegate::Closed => {}
    }
  }
}

/// Buffers `next`/`error`/`complete` signals until its stream is first polled.
pub struct FluxSinkRecorder<T, E> {
  recording: Arc<Mutex<Recording<T, E>>>,
}

impl<T, E> Default for FluxSinkRecorder<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T, E> std::fmt::Debug for FluxSinkRecorder<T, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let recording = self.lock();
    f.debug_struct("FluxSinkRecorder")
      .field("attached", &recording.attached)
      .field("terminated", &recording.terminated)
      .finish()
  }
}

impl<T, E> FluxSinkRecorder<T, E> {
  /// Creates a recorder; stack-trace diagnostics follow the environment.
  pub fn new() -> Self {
    Self::with_stack_traces_on_drop(print_stack_traces_on_drop_from_env())
  }

  /// Creates a recorder with explicit stack-trace diagnostics.
  pub fn with_stack_traces_on_drop(enabled: bool) -> Self {
    Self {
      recording: Arc::new(Mutex::new(Recording {
        delegate: Delegate::NotYetAccepted(Vec::new()),
        attached: false,
        terminated: false,
        stack_traces: enabled,
        attached_at: None,
        terminated_at: None,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Recording<T, E>> {
    self.recording.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Returns the stream of recorded signals.
  ///
  /// The stream attaches when first polled. Only one stream may attach; any
  /// other ends immediately.
  pub fn flux(&self) -> FluxStream<T, E> {
    FluxStream {
      recording: Arc::clone(&self.recording),
      receiver: None,
      done: false,
    }
  }

  /// Returns true once a stream has attached.
  pub fn is_attached(&self) -> bool {
    self.lock().attached
  }

  /// Emits a value.
  pub fn next(&self, value: T) {
    let mut recording = self.lock();
    if recording.terminated {
      recording.report_dropped("next");
      return;
    }
    recording.emit(Signal::Next(value));
  }

  /// Terminates the stream with an error.
  pub fn error(&self, error: E) {
    let mut recording = self.lock();
    if recording.terminated {
      recording.report_dropped("error");
      return;
    }
    recording.emit(Signal::Error(error));
  }

  /// Completes the stream.
  pub fn complete(&self) {
    let mut recording = self.lock();
    if recording.terminated {
      recording.report_dropped("complete");
      return;
    }
    recording.emit(Signal::Complete);
  }
}

/// Stream side of a [`FluxSinkRecorder`].
pub struct FluxStream<T, E> {
  recording: Arc<Mutex<Recording<T, E>>>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, E>>>,
  done: bool,
}

impl<T, E> Unpin for FluxStream<T, E> {}

impl<T, E> FluxStream<T, E> {
  /// Replays buffered signals and switches the recorder to direct mode.
  fn attach(&mut self) {
    let mut recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
    if recording.attached {
      warn!("recorder already has a subscriber, ending this stream");
      self.done = true;
      return;
    }
    recording.attached = true;
    recording.attached_at = recording.capture();

    let (sender, receiver) = mpsc::unbounded_channel();
    let buffered = match std::mem::replace(&mut recording.delegate, Delegate::Closed) {
      Delegate::NotYetAccepted(buffered) => buffered,
      _ => Vec::new(),
    };
    let mut terminated = false;
    for signal in buffered {
      match signal {
        Signal::Next(value) => {
          let _ = sender.send(Ok(value));
        }
        Signal::Error(error) => {
          let _ = sender.send(Err(error));
          terminated = true;
        }
        Signal::Complete => terminated = true,
      }
    }
    if !terminated {
      recording.delegate = Delegate::Direct(sender);
    }
    self.receiver = Some(receiver);
  }
}

impl<T, E> Stream for FluxStream<T, E> {
  type Item = Result<T, E>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.done {
      return Poll::Ready(None);
    }
    if this.receiver.is_none() {
      this.attach();
    }
    let Some(receiver) = this.receiver.as_mut() else {
      return Poll::Ready(None);
    };
    match receiver.poll_recv(cx) {
      Poll::Ready(None) => {
        this.done = true;
        Poll::Ready(None)
      }
      other => other,
    }
  }
}

/// Records a single terminal signal for a lazily awaited future.
pub struct MonoSinkRecorder<T, E> {
  sender: Mutex<Option<oneshot::Sender<Result<Option<T>, E>>>>,
  receiver: Mutex<Option<oneshot::Receiver<Result<Option<T>, E>>>>,
}

impl<T, E> Default for MonoSinkRecorder<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T, E> std::fmt::Debug for MonoSinkRecorder<T, E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let terminated = self
      .sender
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_none();
    f.debug_struct("MonoSinkRecorder")
      .field("terminated", &terminated)
      .finish()
  }
}

impl<T, E> MonoSinkRecorder<T, E> {
  /// Creates an empty recorder.
  pub fn new() -> Self {
    let (sender, receiver) = oneshot::channel();
    Self {
      sender: Mutex::new(Some(sender)),
      receiver: Mutex::new(Some(receiver)),
    }
  }

  /// Returns the future resolving to the recorded signal.
  ///
  /// Only the first call observes the signal; later calls resolve to
  /// [`SinkError::AlreadySubscribed`].
  pub fn mono(&self) -> impl Future<Output = Result<Option<T>, SinkError<E>>> + use<T, E> {
    let receiver = self
      .receiver
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    async move {
      let Some(receiver) = receiver else {
        return Err(SinkError::AlreadySubscribed);
      };
      match receiver.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(SinkError::Failed(error)),
        Err(_) => Err(SinkError::Dropped),
      }
    }
  }

  /// Completes with a value.
  pub fn success(&self, value: T) -> bool {
    self.signal(Ok(Some(value)), "success")
  }

  /// Completes without a value.
  pub fn empty(&self) -> bool {
    self.signal(Ok(None), "empty")
  }

  /// Completes with an error.
  pub fn error(&self, error: E) -> bool {
    self.signal(Err(error), "error")
  }

  fn signal(&self, outcome: Result<Option<T>, E>, name: &str) -> bool {
    let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    match sender {
      Some(sender) => {
        let _ = sender.send(outcome);
        true
      }
      None => {
        warn!(signal = name, "signal emitted after the recorder terminated, dropping it");
        false
      }
    }
  }
}
