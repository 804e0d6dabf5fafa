//! Projections routing events to handlers by kind.
//!
//! [`Projection`] is a ready-made [`Consumer`]: handlers are registered per
//! event kind when the projection is configured, and progress is kept in a
//! [`CheckpointStore`] under the projection key.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Deposited;
//!
//! #[async_trait]
//! impl Handler<BankEvent, u64> for Deposited {
//!     async fn handle(&self, context: &Context, event: &BankEvent, _: &u64) -> anyhow::Result<()> {
//!         let balances: Data<Balances> = context.extract();
//!         balances.credit(event)?;
//!
//!         Ok(())
//!     }
//! }
//!
//! let projection = Projection::new("balances", checkpoints)
//!     .data(Data::new(Balances::default()))
//!     .handler("deposited", Deposited)
//!     .skip("account-renamed")
//!     .safety_check();
//! ```

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

use crate::{
    checkpoint::CheckpointFrequency,
    consumer::{Consumer, ErrorResolution},
    context::Context,
    position::Position,
};

/// Events that name their own kind, used to pick a handler.
pub trait EventKind {
    fn kind(&self) -> &str;
}

#[async_trait]
pub trait Handler<E, P>: Send + Sync
where
    E: Send + Sync,
    P: Position,
{
    async fn handle(&self, context: &Context, event: &E, position: &P) -> anyhow::Result<()>;
}

/// Durable progress of projections, keyed by projection key.
#[async_trait]
pub trait CheckpointStore<P: Position>: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<P>>;

    async fn save(&self, key: &str, position: &P) -> anyhow::Result<()>;
}

struct SkipHandler;

#[async_trait]
impl<E, P> Handler<E, P> for SkipHandler
where
    E: Send + Sync,
    P: Position,
{
    async fn handle(&self, _context: &Context, _event: &E, _position: &P) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Projection<E, P>
where
    E: Send + Sync,
    P: Position,
{
    key: String,
    handlers: HashMap<String, Box<dyn Handler<E, P>>>,
    checkpoints: Arc<dyn CheckpointStore<P>>,
    context: Context,
    safety_disabled: bool,
    on_error: ErrorResolution,
    catch_up: CheckpointFrequency,
    live: CheckpointFrequency,
}

impl<E, P> Projection<E, P>
where
    E: EventKind + Send + Sync,
    P: Position,
{
    pub fn new<C: CheckpointStore<P> + 'static>(key: impl Into<String>, checkpoints: C) -> Self {
        Self {
            key: key.into(),
            handlers: HashMap::new(),
            checkpoints: Arc::new(checkpoints),
            context: Context::default(),
            safety_disabled: true,
            on_error: ErrorResolution::Abort,
            catch_up: CheckpointFrequency::default(),
            live: CheckpointFrequency::default(),
        }
    }

    /// Registers the handler of one event kind.
    ///
    /// # Panics
    ///
    /// Panics if a handler for the same kind is already registered.
    pub fn handler<H: Handler<E, P> + 'static>(mut self, kind: impl Into<String>, h: H) -> Self {
        let kind = kind.into();
        if self.handlers.insert(kind.to_owned(), Box::new(h)).is_some() {
            panic!("Cannot register event handler: kind {kind} already exists");
        }

        self
    }

    /// Acknowledges events of `kind` without doing anything.
    ///
    /// # Panics
    ///
    /// Panics if a handler for the same kind is already registered.
    pub fn skip(self, kind: impl Into<String>) -> Self {
        self.handler(kind, SkipHandler)
    }

    /// Adds shared data readable by handlers through their [`Context`].
    pub fn data<D: Send + Sync + 'static>(self, v: D) -> Self {
        self.context.insert(v);

        self
    }

    /// Fails on events without a handler instead of ignoring them.
    pub fn safety_check(mut self) -> Self {
        self.safety_disabled = false;

        self
    }

    /// Resolution applied when a handler fails. Default is abort.
    pub fn on_error(mut self, v: ErrorResolution) -> Self {
        self.on_error = v;

        self
    }

    pub fn catch_up_checkpoint(mut self, v: CheckpointFrequency) -> Self {
        self.catch_up = v;

        self
    }

    pub fn live_checkpoint(mut self, v: CheckpointFrequency) -> Self {
        self.live = v;

        self
    }
}

#[async_trait]
impl<E, P> Consumer<E, P> for Projection<E, P>
where
    E: EventKind + Send + Sync,
    P: Position,
{
    fn name(&self) -> &str {
        &self.key
    }

    async fn on_starting(&mut self) -> anyhow::Result<Option<P>> {
        let position = self.checkpoints.load(&self.key).await?;
        tracing::info!(projection = %self.key, position = ?position, "projection starting");

        Ok(position)
    }

    async fn on_event(&mut self, event: &E, position: &P) -> anyhow::Result<()> {
        let Some(handler) = self.handlers.get(event.kind()) else {
            if !self.safety_disabled {
                anyhow::bail!("no handler p={} k={}", self.key, event.kind());
            }

            tracing::trace!(projection = %self.key, kind = event.kind(), "no handler, ignored");

            return Ok(());
        };

        handler.handle(&self.context, event, position).await
    }

    async fn on_event_error(
        &mut self,
        event: &E,
        position: &P,
        error: &anyhow::Error,
    ) -> ErrorResolution {
        tracing::error!(
            projection = %self.key,
            kind = event.kind(),
            position = ?position,
            error = %error,
            resolution = %self.on_error,
            "failed to handle event"
        );

        self.on_error
    }

    async fn on_checkpoint(&mut self, position: &P) -> anyhow::Result<()> {
        self.checkpoints.save(&self.key, position).await
    }

    fn catch_up_checkpoint_frequency(&self) -> CheckpointFrequency {
        self.catch_up
    }

    fn live_checkpoint_frequency(&self) -> CheckpointFrequency {
        self.live
    }
}
