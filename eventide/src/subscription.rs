//! Catch-up and live subscriptions.
//!
//! A [`Subscription`] turns the notifications of one external stream into
//! ordered, checkpointed delivery to several [`Consumer`]s.
//!
//! # Key Types
//!
//! - [`SubscriptionBuilder`] - Registers consumers and options
//! - [`Subscription`] - Handle to start, await and dispose a subscription
//! - [`SubscriptionState`] - Lifecycle of a subscription
//!
//! # Starting
//!
//! [`Subscription::start`] asks every consumer where it wants to resume,
//! subscribes the stream from the lowest of those positions and spawns the
//! processing task. Consumers that are further ahead skip the events they
//! already processed.
//!
//! # Processing
//!
//! One task drains the notification queue and calls consumers sequentially,
//! in registration order. A fatal error of any consumer stops delivery to
//! all of them, so their checkpoints never diverge.
//!
//! # Example
//!
//! ```rust,ignore
//! let subscription = SubscriptionBuilder::new(store.clone())
//!     .consumer(balances)
//!     .consumer(statements)
//!     .retry(RetryPolicy::default().max_retries(3))
//!     .build();
//!
//! subscription.start(CancellationToken::new()).await?;
//!
//! // on shutdown
//! subscription.dispose().await?;
//! ```

use anyhow::anyhow;
use futures_util::FutureExt;
use parking_lot::Mutex;
use parse_display::Display;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    checkpoint::{CheckpointFrequency, Tracker},
    consumer::{Consumer, ErrorResolution},
    error::{Result, Stage, SubscriptionError},
    notification::{DropReason, Notification, NotificationSink},
    position::{is_after, min_position, Position},
    queue::{self, QueueReceiver},
    retry::RetryPolicy,
    stream::{EventStream, StreamHandle},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(style = "snake_case")]
pub enum SubscriptionState {
    NotStarted,
    /// Querying resume positions and subscribing.
    Starting,
    /// The stream accepted the subscription, no phase reported yet.
    Subscribed,
    CatchingUp,
    Live,
    Completed,
    Faulted,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Faulted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CatchingUp,
    Live,
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Handled,
    Cancelled,
}

struct Registration<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    consumer: Box<dyn Consumer<E, P>>,
    name: String,
    catch_up: CheckpointFrequency,
    live: CheckpointFrequency,
    start: Option<P>,
    acknowledged: Option<P>,
    tracker: Tracker,
}

impl<E, P> Registration<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    fn new(consumer: Box<dyn Consumer<E, P>>) -> Self {
        Self {
            name: consumer.name().to_owned(),
            catch_up: consumer.catch_up_checkpoint_frequency(),
            live: consumer.live_checkpoint_frequency(),
            consumer,
            start: None,
            acknowledged: None,
            tracker: Tracker::new(),
        }
    }

    fn frequency(&self, phase: Phase) -> CheckpointFrequency {
        match phase {
            Phase::CatchingUp => self.catch_up,
            Phase::Live => self.live,
        }
    }

    async fn checkpoint(&mut self) -> Result<()> {
        let Some(position) = self.acknowledged.as_ref() else {
            return Ok(());
        };

        if let Err(err) = self.consumer.on_checkpoint(position).await {
            tracing::error!(consumer = %self.name, position = ?position, error = %err, "checkpoint failed");

            return Err(SubscriptionError::lifecycle(
                &self.name,
                Stage::OnCheckpoint,
                err,
            ));
        }

        tracing::debug!(consumer = %self.name, position = ?position, pending = self.tracker.pending(), "checkpoint");
        self.tracker.reset();

        Ok(())
    }
}

/// Builder for a [`Subscription`].
///
/// Consumers are called in the order they are registered.
pub struct SubscriptionBuilder<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    stream: Arc<dyn EventStream<E, P>>,
    consumers: Vec<Box<dyn Consumer<E, P>>>,
    queue_capacity: usize,
    retry: RetryPolicy,
}

impl<E, P> SubscriptionBuilder<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    pub fn new<S: EventStream<E, P> + 'static>(stream: S) -> Self {
        Self {
            stream: Arc::new(stream),
            consumers: Vec::new(),
            queue_capacity: 1,
            retry: RetryPolicy::default(),
        }
    }

    pub fn consumer<C: Consumer<E, P> + 'static>(mut self, consumer: C) -> Self {
        self.consumers.push(Box::new(consumer));

        self
    }

    /// Number of notifications buffered ahead of the processing task.
    ///
    /// Default is 1, the producer waits for every notification to be taken.
    pub fn queue_capacity(mut self, v: usize) -> Self {
        self.queue_capacity = v.max(1);

        self
    }

    /// Bounds [`ErrorResolution::Retry`]. See [`RetryPolicy`].
    pub fn retry(mut self, v: RetryPolicy) -> Self {
        self.retry = v;

        self
    }

    pub fn build(self) -> Subscription<E, P> {
        let registrations = self
            .consumers
            .into_iter()
            .map(Registration::new)
            .collect::<Vec<_>>();

        let (state, _) = watch::channel(SubscriptionState::NotStarted);
        let (outcome, _) = watch::channel(None);

        Subscription {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                stream: self.stream,
                registrations: Mutex::new(Some(registrations)),
                queue_capacity: self.queue_capacity,
                retry: self.retry,
                cancel: CancellationToken::new(),
                handle: Mutex::new(HandleSlot::default()),
                state,
                outcome,
            }),
        }
    }
}

#[derive(Default)]
struct HandleSlot {
    handle: Option<Box<dyn StreamHandle>>,
    released: bool,
}

type Outcome = Option<Result<()>>;

struct Inner<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    id: Uuid,
    stream: Arc<dyn EventStream<E, P>>,
    registrations: Mutex<Option<Vec<Registration<E, P>>>>,
    queue_capacity: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    handle: Mutex<HandleSlot>,
    state: watch::Sender<SubscriptionState>,
    outcome: watch::Sender<Outcome>,
}

impl<E, P> Inner<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    fn take_registrations(&self) -> Option<Vec<Registration<E, P>>> {
        let registrations = self.registrations.lock().take()?;
        self.state.send_replace(SubscriptionState::Starting);

        Some(registrations)
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }

            *current = state;

            true
        });
    }

    fn attach(&self, mut handle: Box<dyn StreamHandle>) {
        let mut slot = self.handle.lock();

        if slot.released {
            drop(slot);
            handle.dispose();

            return;
        }

        slot.handle = Some(handle);
    }

    fn release(&self) {
        self.cancel.cancel();

        let handle = {
            let mut slot = self.handle.lock();
            slot.released = true;
            slot.handle.take()
        };

        if let Some(mut handle) = handle {
            handle.dispose();
            tracing::debug!(subscription = %self.id, "stream handle released");
        }
    }

    /// Terminal transition: releases the stream, notifies every consumer and
    /// publishes the outcome.
    async fn finish(&self, registrations: &mut [Registration<E, P>], outcome: Result<()>) -> Result<()> {
        self.release();

        let (reason, error) = match &outcome {
            Ok(()) => (DropReason::Disposed, None),
            Err(err) => (err.drop_reason(), Some(err)),
        };

        for registration in registrations.iter_mut() {
            registration
                .consumer
                .on_subscription_dropped(reason, error)
                .await;
        }

        match &outcome {
            Ok(()) => {
                tracing::info!(subscription = %self.id, "subscription completed");
                self.state.send_replace(SubscriptionState::Completed);
            }
            Err(err) => {
                tracing::error!(subscription = %self.id, error = %err, "subscription faulted");
                self.state.send_replace(SubscriptionState::Faulted);
            }
        }

        self.outcome.send_replace(Some(outcome.clone()));

        outcome
    }

    async fn query_start_positions(registrations: &mut [Registration<E, P>]) -> Result<()> {
        for registration in registrations.iter_mut() {
            match registration.consumer.on_starting().await {
                Ok(start) => {
                    tracing::debug!(consumer = %registration.name, start = ?start, "resume position");
                    registration.start = start;
                }
                Err(err) => {
                    return Err(SubscriptionError::lifecycle(
                        &registration.name,
                        Stage::OnStarting,
                        err,
                    ))
                }
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(subscription = %self.id))]
    async fn process(
        &self,
        registrations: &mut [Registration<E, P>],
        mut receiver: QueueReceiver<Notification<E, P>>,
    ) -> Result<()> {
        let mut phase = Phase::CatchingUp;

        loop {
            let deadline = registrations
                .iter()
                .filter_map(|registration| {
                    registration
                        .tracker
                        .deadline(&registration.frequency(phase))
                })
                .min();

            let dequeued = tokio::select! {
                biased;
                dequeued = receiver.dequeue() => dequeued,
                _ = sleep_until(deadline) => {
                    for registration in registrations.iter_mut() {
                        let frequency = registration.frequency(phase);
                        if registration.tracker.is_due(&frequency) {
                            registration.checkpoint().await?;
                        }
                    }

                    continue;
                }
            };

            let notification = match dequeued {
                Ok(Some(notification)) => notification,
                Ok(None) => {
                    tracing::debug!("notification queue completed");

                    return Ok(());
                }
                Err(_) => {
                    tracing::info!("subscription cancelled");

                    return Ok(());
                }
            };

            match notification {
                Notification::CatchingUp => {
                    tracing::info!("catching up");
                    phase = Phase::CatchingUp;
                    self.set_state(SubscriptionState::CatchingUp);

                    for registration in registrations.iter_mut() {
                        if let Err(err) = registration.consumer.on_catching_up().await {
                            return Err(SubscriptionError::lifecycle(
                                &registration.name,
                                Stage::OnCatchingUp,
                                err,
                            ));
                        }
                    }
                }
                Notification::Live => {
                    tracing::info!("live");
                    phase = Phase::Live;
                    self.set_state(SubscriptionState::Live);

                    for registration in registrations.iter_mut() {
                        if let Err(err) = registration.consumer.on_live().await {
                            return Err(SubscriptionError::lifecycle(
                                &registration.name,
                                Stage::OnLive,
                                err,
                            ));
                        }

                        // flush catch-up progress
                        if registration.tracker.pending() > 0 {
                            registration.checkpoint().await?;
                        }
                    }
                }
                Notification::Event { event, position } => {
                    for registration in registrations.iter_mut() {
                        let delivery = self
                            .deliver(registration, phase, &event, &position)
                            .await?;

                        if delivery == Delivery::Cancelled {
                            tracing::info!("subscription cancelled while retrying");

                            return Ok(());
                        }
                    }
                }
                Notification::Dropped { reason, error } => {
                    tracing::info!(%reason, "stream dropped");

                    return match reason {
                        DropReason::Disposed => Ok(()),
                        reason => Err(SubscriptionError::Stream {
                            reason,
                            error: error
                                .unwrap_or_else(|| anyhow!("stream dropped without error"))
                                .into(),
                        }),
                    };
                }
            }
        }
    }

    async fn deliver(
        &self,
        registration: &mut Registration<E, P>,
        phase: Phase,
        event: &E,
        position: &P,
    ) -> Result<Delivery> {
        if !is_after(position, registration.start.as_ref()) {
            tracing::trace!(consumer = %registration.name, position = ?position, "already processed, skip");

            return Ok(Delivery::Handled);
        }

        let mut backoff = None;
        let mut attempts = 0;

        loop {
            attempts += 1;

            let err = match registration.consumer.on_event(event, position).await {
                Ok(()) => break,
                Err(err) => err,
            };

            match registration
                .consumer
                .on_event_error(event, position, &err)
                .await
            {
                ErrorResolution::Abort => {
                    tracing::error!(consumer = %registration.name, position = ?position, error = %err, "failed to handle event");

                    return Err(SubscriptionError::Handler {
                        consumer: registration.name.to_owned(),
                        position: format!("{position:?}"),
                        error: err.into(),
                    });
                }
                ErrorResolution::Skip => {
                    tracing::warn!(consumer = %registration.name, position = ?position, error = %err, "event skipped");

                    break;
                }
                ErrorResolution::Retry => {
                    let Some(delay) = backoff.get_or_insert_with(|| self.retry.backoff()).next()
                    else {
                        tracing::error!(consumer = %registration.name, position = ?position, attempts, error = %err, "retries exhausted");

                        return Err(SubscriptionError::RetryExhausted {
                            consumer: registration.name.to_owned(),
                            position: format!("{position:?}"),
                            attempts,
                            error: err.into(),
                        });
                    };

                    tracing::warn!(consumer = %registration.name, position = ?position, attempts, delay = ?delay, error = %err, "retrying event");

                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Ok(Delivery::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }

                    if self.cancel.is_cancelled() {
                        return Ok(Delivery::Cancelled);
                    }
                }
            }
        }

        tracing::trace!(consumer = %registration.name, position = ?position, "event handled");

        registration.acknowledged = Some(position.clone());

        let frequency = registration.frequency(phase);
        if registration.tracker.acknowledge(&frequency) {
            registration.checkpoint().await?;
        }

        Ok(Delivery::Handled)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_outcome(receiver: &mut watch::Receiver<Outcome>) -> Result<()> {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(SubscriptionError::Panicked),
    }
}

/// Handle to a subscription.
///
/// Clones share the same subscription, so one task can await completion
/// while another disposes it.
pub struct Subscription<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    inner: Arc<Inner<E, P>>,
}

impl<E, P> Clone for Subscription<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, P> Subscription<E, P>
where
    E: Send + Sync + 'static,
    P: Position,
{
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SubscriptionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.inner.state.subscribe()
    }

    /// Starts the subscription.
    ///
    /// Returns once the stream accepted the subscription, or with the fault
    /// that ended processing first. Cancelling `cancel` disposes the
    /// subscription.
    #[tracing::instrument(skip_all, fields(subscription = %self.inner.id))]
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;

        let Some(mut registrations) = inner.take_registrations() else {
            return Err(SubscriptionError::AlreadyStarted);
        };

        if cancel.is_cancelled() {
            inner.cancel.cancel();
        } else {
            link(cancel, inner.cancel.clone());
        }

        if inner.cancel.is_cancelled() {
            tracing::info!("subscription disposed before start");

            return inner.finish(&mut registrations, Ok(())).await;
        }

        if let Err(err) = Inner::query_start_positions(&mut registrations).await {
            return inner.finish(&mut registrations, Err(err)).await;
        }

        let from = min_position(registrations.iter().map(|r| &r.start));

        tracing::info!(from = ?from, consumers = registrations.len(), "subscribing");

        let (sender, receiver) = queue::channel(inner.queue_capacity, inner.cancel.clone());
        let sink = NotificationSink::new(sender);
        let mut outcome = inner.outcome.subscribe();

        self.spawn_processing(registrations, receiver);

        let subscribed = tokio::select! {
            res = inner.stream.subscribe(from, sink.clone(), inner.cancel.clone()) => res,
            res = wait_outcome(&mut outcome) => return res,
        };

        let handle = match subscribed {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(error = %err, "failed to subscribe");

                // the processing task reports the fault to consumers
                let _ = sink.notify_dropped(DropReason::StreamError, Some(err)).await;

                return self.wait_for_completed().await;
            }
        };

        inner.attach(handle);

        // processing may have failed while the handshake was completing
        let outcome = inner.outcome.borrow().clone();
        if let Some(Err(err)) = outcome {
            return Err(err);
        }

        inner.state.send_if_modified(|state| {
            if *state != SubscriptionState::Starting {
                return false;
            }

            *state = SubscriptionState::Subscribed;

            true
        });

        tracing::info!("subscribed");

        Ok(())
    }

    fn spawn_processing(
        &self,
        mut registrations: Vec<Registration<E, P>>,
        receiver: QueueReceiver<Notification<E, P>>,
    ) {
        let inner = self.inner.clone();
        let span = tracing::Span::current();

        tokio::spawn(
            async move {
                let processed = AssertUnwindSafe(inner.process(&mut registrations, receiver))
                    .catch_unwind()
                    .await;

                let outcome = processed.unwrap_or_else(|_| {
                    tracing::error!("processing task panicked");

                    Err(SubscriptionError::Panicked)
                });

                let _ = inner.finish(&mut registrations, outcome).await;
            }
            .instrument(span),
        );
    }

    /// Waits for the subscription to complete, returning its fault if any.
    pub async fn wait_for_completed(&self) -> Result<()> {
        let mut outcome = self.inner.outcome.subscribe();

        wait_outcome(&mut outcome).await
    }

    /// Signals the subscription to stop without waiting.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Stops the subscription and waits until consumers were notified.
    ///
    /// Disposing twice is a no-op. Must not be awaited from a consumer
    /// callback, the processing task would wait on itself.
    pub async fn dispose(&self) -> Result<()> {
        self.inner.cancel.cancel();

        if let Some(mut registrations) = self.inner.take_registrations() {
            return self.inner.finish(&mut registrations, Ok(())).await;
        }

        self.wait_for_completed().await
    }
}

/// Cancels `internal` when `external` is cancelled.
fn link(external: CancellationToken, internal: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = external.cancelled() => internal.cancel(),
            _ = internal.cancelled() => {}
        }
    });
}
