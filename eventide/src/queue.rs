//! Bounded notification queue.
//!
//! The queue is the only synchronization point between the producer (the
//! external stream's own task) and the processing task of a subscription.
//! Its capacity is small, down to a single slot: a producer that
//! gets ahead of the consumers is suspended in [`QueueSender::enqueue`] until
//! the processing task catches up.
//!
//! Both sides observe the same [`CancellationToken`]. Once it is cancelled a
//! blocked `enqueue` or `dequeue` returns [`QueueError::Cancelled`] right
//! away.
//!
//! # Example
//!
//! ```rust,ignore
//! let (sender, mut receiver) = queue::channel(1, cancel.clone());
//!
//! tokio::spawn(async move {
//!     sender.enqueue(1).await?;
//!     sender.enqueue(2).await?;
//!     sender.complete();
//!     Ok::<_, QueueError>(())
//! });
//!
//! while let Some(item) = receiver.dequeue().await? {
//!     println!("{item}");
//! }
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue cancelled")]
    Cancelled,

    #[error("queue completed")]
    Completed,
}

/// Creates a queue holding at most `capacity` items (at least one).
pub fn channel<T>(capacity: usize, cancel: CancellationToken) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    (
        QueueSender {
            tx: Arc::new(Mutex::new(Some(tx))),
            cancel: cancel.clone(),
        },
        QueueReceiver { rx, cancel },
    )
}

/// Producer half. Clones share the same queue and the same completion.
pub struct QueueSender<T> {
    tx: Arc<Mutex<Option<mpsc::Sender<T>>>>,
    cancel: CancellationToken,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Adds an item, waiting for a free slot.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        // Clone out of the lock, never hold it across the await.
        let Some(tx) = self.tx.lock().clone() else {
            return Err(QueueError::Completed);
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
            res = tx.send(item) => res.map_err(|_| QueueError::Completed),
        }
    }

    /// No more items will be accepted. Buffered items are still delivered.
    pub fn complete(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }

        self.tx.lock().as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }
}

/// Consumer half, owned by a single processing task.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item.
    ///
    /// Returns `Ok(None)` once the queue is completed and drained.
    pub async fn dequeue(&mut self) -> Result<Option<T>, QueueError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
            item = self.rx.recv() => Ok(item),
        }
    }

    pub fn try_dequeue(&mut self) -> Option<T> {
        if self.cancel.is_cancelled() {
            return None;
        }

        self.rx.try_recv().ok()
    }
}
