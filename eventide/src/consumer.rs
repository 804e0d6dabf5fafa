//! The contract implemented by projections and read models.
//!
//! A [`Consumer`] is registered on a [`Subscription`](crate::Subscription)
//! together with other consumers. The subscription calls every consumer from
//! a single processing task, one callback at a time, in registration order.
//! This is why callbacks take `&mut self`: no other code touches the consumer
//! while the subscription owns it.
//!
//! # Lifecycle
//!
//! ```text
//! on_starting ─▶ on_catching_up ─▶ on_event* ─▶ on_live ─▶ on_event* ─▶ on_subscription_dropped
//!                                      │                      │
//!                                      └── on_event_error ────┴── on_checkpoint (per cadence)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! struct AccountBalances {
//!     balances: HashMap<String, i64>,
//!     checkpoints: PgPool,
//! }
//!
//! #[async_trait]
//! impl Consumer<AccountEvent, u64> for AccountBalances {
//!     async fn on_starting(&mut self) -> anyhow::Result<Option<u64>> {
//!         load_checkpoint(&self.checkpoints, "balances").await
//!     }
//!
//!     async fn on_event(&mut self, event: &AccountEvent, _position: &u64) -> anyhow::Result<()> {
//!         if let AccountEvent::Deposited { id, amount } = event {
//!             *self.balances.entry(id.to_owned()).or_default() += amount;
//!         }
//!
//!         Ok(())
//!     }
//!
//!     async fn on_checkpoint(&mut self, position: &u64) -> anyhow::Result<()> {
//!         save_checkpoint(&self.checkpoints, "balances", *position).await
//!     }
//! }
//! ```

use async_trait::async_trait;
use parse_display::Display;

use crate::{
    checkpoint::CheckpointFrequency, error::SubscriptionError, notification::DropReason,
    position::Position,
};

/// What to do after [`Consumer::on_event`] failed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(style = "snake_case")]
pub enum ErrorResolution {
    /// Fault the whole subscription with the handler error.
    Abort,
    /// Acknowledge the event as if it had been handled.
    Skip,
    /// Call the handler again with the same event.
    Retry,
}

#[async_trait]
pub trait Consumer<E, P>: Send
where
    E: Send + Sync,
    P: Position,
{
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Position to resume after, `None` to start from the beginning.
    ///
    /// Called once per start, before the stream is subscribed.
    async fn on_starting(&mut self) -> anyhow::Result<Option<P>>;

    /// Historical replay began. Not called when the stream starts live.
    async fn on_catching_up(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles an event positioned after this consumer's resume position.
    async fn on_event(&mut self, event: &E, position: &P) -> anyhow::Result<()>;

    /// Decides how to recover from a failed [`Consumer::on_event`].
    async fn on_event_error(
        &mut self,
        _event: &E,
        _position: &P,
        _error: &anyhow::Error,
    ) -> ErrorResolution {
        ErrorResolution::Abort
    }

    /// Replay reached the tail of the stream.
    async fn on_live(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Records progress up to and including `position`.
    async fn on_checkpoint(&mut self, _position: &P) -> anyhow::Result<()> {
        Ok(())
    }

    /// The subscription terminated, cleanly or not. Called once.
    async fn on_subscription_dropped(
        &mut self,
        _reason: DropReason,
        _error: Option<&SubscriptionError>,
    ) {
    }

    fn catch_up_checkpoint_frequency(&self) -> CheckpointFrequency {
        CheckpointFrequency::default()
    }

    fn live_checkpoint_frequency(&self) -> CheckpointFrequency {
        CheckpointFrequency::default()
    }
}
