//! Catch-up and live event stream subscriptions.
//!
//! Eventide turns a store-specific stream of events into reliable, ordered
//! and checkpointed delivery to one or more independent consumers, such as
//! projections and read models.
//!
//! # Core Concepts
//!
//! ## Positions
//!
//! Every event comes with a [`Position`]. Consumers tell where they want to
//! resume (`None` for the beginning) and the subscription starts the stream
//! from the lowest of those positions. See the [`position`] module.
//!
//! ## Notifications
//!
//! Store adapters implement [`EventStream`] and report what they discover
//! through a [`NotificationSink`]: replay started, events, live, dropped.
//! The sink feeds a small bounded [`queue`], so a fast producer waits for
//! slow consumers.
//!
//! ## Consumers
//!
//! A [`Consumer`] handles events, decides how to recover from its own
//! failures ([`ErrorResolution`]) and records progress on the cadence of its
//! [`CheckpointFrequency`]. [`Projection`] is a consumer routing events to
//! handlers by kind.
//!
//! ## Subscriptions
//!
//! A [`Subscription`] owns the stream handle, the queue and the consumers. A
//! single task calls consumers, one notification at a time, in registration
//! order.
//!
//! # Example
//!
//! ```rust,ignore
//! use eventide::{SubscriptionBuilder, Projection, CancellationToken};
//! use eventide_store::{MemoryCheckpoints, MemoryStore};
//!
//! let store = MemoryStore::<BankEvent>::new();
//! let checkpoints = MemoryCheckpoints::new();
//!
//! let subscription = SubscriptionBuilder::new(store.clone())
//!     .consumer(
//!         Projection::new("balances", checkpoints.clone())
//!             .handler("deposited", Deposited)
//!             .handler("withdrawn", Withdrawn),
//!     )
//!     .build();
//!
//! subscription.start(CancellationToken::new()).await?;
//! subscription.wait_for_completed().await?;
//! ```

#![forbid(unsafe_code)]

mod checkpoint;
pub mod context;
mod consumer;
mod error;
mod notification;
pub mod position;
pub mod projection;
pub mod queue;
mod retry;
mod stream;
mod subscription;

pub use checkpoint::CheckpointFrequency;
pub use consumer::{Consumer, ErrorResolution};
pub use context::{Context, Data};
pub use error::{Result, SharedError, Stage, SubscriptionError};
pub use notification::{DropReason, Notification, NotificationSink};
pub use position::Position;
pub use projection::{CheckpointStore, EventKind, Handler, Projection};
pub use queue::QueueError;
pub use retry::RetryPolicy;
pub use stream::{EventStream, StreamHandle};
pub use subscription::{Subscription, SubscriptionBuilder, SubscriptionState};
pub use tokio_util::sync::CancellationToken;
