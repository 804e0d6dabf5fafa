//! Notifications flowing from an external stream into a subscription.
//!
//! Store adapters never talk to consumers directly. They push
//! [`Notification`]s through a [`NotificationSink`], which feeds the bounded
//! queue drained by the subscription's processing task.

use parse_display::Display;

use crate::{
    position::Position,
    queue::{QueueError, QueueSender},
};

/// Why a subscription stopped.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(style = "snake_case")]
pub enum DropReason {
    /// Disposed or cancelled by its owner.
    Disposed,
    /// The external stream failed.
    StreamError,
    /// A consumer failed and the subscription was faulted.
    SubscriberError,
}

/// One unit of information produced by the external stream.
#[derive(Debug)]
pub enum Notification<E, P> {
    /// Replay of historical events started.
    CatchingUp,
    /// One event at a position, increasing across successive notifications.
    Event { event: E, position: P },
    /// Replay reached the tail of the stream.
    Live,
    /// The stream terminated. Nothing follows.
    Dropped {
        reason: DropReason,
        error: Option<anyhow::Error>,
    },
}

/// Ingress used by store adapters to publish notifications.
///
/// Every method suspends while the queue is full and fails once the
/// subscription is cancelled or finished. Adapters should stop producing on
/// the first error.
pub struct NotificationSink<E, P> {
    sender: QueueSender<Notification<E, P>>,
}

impl<E, P> Clone for NotificationSink<E, P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Send, P: Position> NotificationSink<E, P> {
    pub(crate) fn new(sender: QueueSender<Notification<E, P>>) -> Self {
        Self { sender }
    }

    pub async fn notify_catching_up(&self) -> Result<(), QueueError> {
        self.sender.enqueue(Notification::CatchingUp).await
    }

    pub async fn notify_event(&self, event: E, position: P) -> Result<(), QueueError> {
        self.sender
            .enqueue(Notification::Event { event, position })
            .await
    }

    pub async fn notify_live(&self) -> Result<(), QueueError> {
        self.sender.enqueue(Notification::Live).await
    }

    pub async fn notify_dropped(
        &self,
        reason: DropReason,
        error: Option<anyhow::Error>,
    ) -> Result<(), QueueError> {
        self.sender
            .enqueue(Notification::Dropped { reason, error })
            .await
    }

    /// Whether the subscription stopped accepting notifications.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
