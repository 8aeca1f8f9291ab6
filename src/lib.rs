//! # eventweave
//!
//! Event correlation, aggregation and asynchronous request-reply in pure Rust.
//!
//! eventweave groups independently arriving events by correlation id, persists
//! in-flight groups to a pluggable object store, aggregates them once complete
//! and expires the ones that never complete. Around that core it provides the
//! plumbing a routing engine needs: an awaited request-reply bridge, sink
//! recorders for lazily subscribed streams, processor interception, retry
//! templates and explicit transaction scoping.
//!
//! ## Key Features
//!
//! - **Correlation**: [`correlator::EventCorrelator`] with per-group atomicity,
//!   guaranteed cleanup on aggregation failure and late-member rejection
//! - **Persistence**: in-memory and file-backed [`store`] implementations
//! - **Cluster-aware expiry**: [`expiry::ExpiryMonitor`] only sweeps on the
//!   primary polling instance
//! - **Async-First**: built on Tokio, cancellation through
//!   `tokio_util::sync::CancellationToken`
//!
//! ## Quick Start
//!
//! ```rust
//! use eventweave::callback::CollectionCorrelatorCallback;
//! use eventweave::correlator::EventCorrelator;
//! use eventweave::message::{Event, GroupCorrelation};
//! use eventweave::store::InMemoryObjectStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let correlator = EventCorrelator::builder(
//!   Arc::new(CollectionCorrelatorCallback::new()),
//!   Arc::new(InMemoryObjectStore::new()),
//! )
//! .build()?;
//!
//! let first = Event::new(json!(1))
//!   .with_correlation_id("order-7")
//!   .with_group_correlation(GroupCorrelation::new(0, 2));
//! let second = Event::new(json!(2))
//!   .with_correlation_id("order-7")
//!   .with_group_correlation(GroupCorrelation::new(1, 2));
//!
//! assert!(correlator.process(first).await?.is_none());
//! let aggregate = correlator.process(second).await?.expect("group complete");
//! assert_eq!(aggregate.payload(), &json!([1, 2]));
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Asynchronous request-reply bridging.
pub mod async_reply;
/// Aggregation policies.
pub mod callback;
/// Cluster awareness.
pub mod cluster;
/// Engine configuration.
pub mod config;
/// Event correlation and aggregation.
pub mod correlator;
/// Routing error taxonomy.
pub mod error;
/// Background group expiry.
pub mod expiry;
/// In-progress aggregation batches.
pub mod group;
/// Processor interception.
pub mod interceptor;
/// Tracing subscriber installation.
pub mod logging;
/// Events and identifiers.
pub mod message;
/// Lifecycle notifications.
pub mod notification;
/// The processor capability.
pub mod processor;
/// Reconnection and retry policies.
pub mod reconnection;
/// Sink recorders for lazily subscribed streams.
pub mod sink_recorder;
/// Partitioned object stores.
pub mod store;
/// Explicit transaction scoping.
pub mod transaction;

#[cfg(test)]
mod error_test;

pub use callback::EventCorrelatorCallback;
pub use correlator::EventCorrelator;
pub use error::{ComponentInfo, RoutingError};
pub use message::{Event, EventId, GroupCorrelation};
pub use store::PartitionableObjectStore;
