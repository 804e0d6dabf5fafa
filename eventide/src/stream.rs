//! Contract implemented by store adapters.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{notification::NotificationSink, position::Position};

/// A source of events that can be subscribed to from a position.
///
/// Implementations replay events positioned strictly after `from` (every
/// event when `from` is `None`) and then keep forwarding new ones, reporting
/// through `sink`:
///
/// - `notify_catching_up` before replaying history, skipped when there is
///   nothing to replay,
/// - `notify_event` for every event, in increasing position order,
/// - `notify_live` once the tail is reached,
/// - `notify_dropped` when the feed ends for any reason other than
///   cancellation of `cancel`.
///
/// The sink applies backpressure, so adapters deliver from their own task
/// and stop as soon as a sink call fails.
#[async_trait]
pub trait EventStream<E, P>: Send + Sync
where
    E: Send + Sync + 'static,
    P: Position,
{
    async fn subscribe(
        &self,
        from: Option<P>,
        sink: NotificationSink<E, P>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn StreamHandle>>;
}

#[async_trait]
impl<E, P, S> EventStream<E, P> for Arc<S>
where
    E: Send + Sync + 'static,
    P: Position,
    S: EventStream<E, P> + ?Sized,
{
    async fn subscribe(
        &self,
        from: Option<P>,
        sink: NotificationSink<E, P>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn StreamHandle>> {
        (**self).subscribe(from, sink, cancel).await
    }
}

/// Resource keeping an external feed alive.
///
/// `dispose` stops the feed. It may be called more than once.
pub trait StreamHandle: Send + Sync {
    fn dispose(&mut self);
}

impl StreamHandle for CancellationToken {
    fn dispose(&mut self) {
        self.cancel();
    }
}

impl<T: Send + 'static> StreamHandle for JoinHandle<T> {
    fn dispose(&mut self) {
        self.abort();
    }
}
