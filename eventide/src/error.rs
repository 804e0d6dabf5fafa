use parse_display::Display;
use std::{fmt, ops::Deref, sync::Arc};

use crate::notification::DropReason;

/// An `anyhow::Error` that can be handed to every consumer and every waiter.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl Deref for SharedError {
    type Target = anyhow::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

/// Consumer callback that is not tied to a specific event.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(style = "snake_case")]
pub enum Stage {
    OnStarting,
    OnCatchingUp,
    OnLive,
    OnCheckpoint,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    #[error("consumer `{consumer}` failed to handle event at {position} >> {error}")]
    Handler {
        consumer: String,
        position: String,
        error: SharedError,
    },

    #[error("consumer `{consumer}` gave up on event at {position} after {attempts} attempts >> {error}")]
    RetryExhausted {
        consumer: String,
        position: String,
        attempts: usize,
        error: SharedError,
    },

    #[error("consumer `{consumer}` failed in {stage} >> {error}")]
    Lifecycle {
        consumer: String,
        stage: Stage,
        error: SharedError,
    },

    #[error("stream dropped ({reason}) >> {error}")]
    Stream { reason: DropReason, error: SharedError },

    #[error("subscription already started")]
    AlreadyStarted,

    #[error("processing task panicked")]
    Panicked,
}

impl SubscriptionError {
    /// The error raised by the consumer or the stream, if any.
    pub fn inner(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler { error, .. }
            | Self::RetryExhausted { error, .. }
            | Self::Lifecycle { error, .. }
            | Self::Stream { error, .. } => Some(error),
            Self::AlreadyStarted | Self::Panicked => None,
        }
    }

    /// Reason reported to consumers when this error ends a subscription.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            Self::Stream { reason, .. } => *reason,
            _ => DropReason::SubscriberError,
        }
    }

    pub(crate) fn lifecycle(consumer: &str, stage: Stage, error: anyhow::Error) -> Self {
        Self::Lifecycle {
            consumer: consumer.to_owned(),
            stage,
            error: error.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;
