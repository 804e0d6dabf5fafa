use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventide::{
    position::is_after, CancellationToken, CheckpointStore, DropReason, EventStream,
    NotificationSink, Position, QueueError, StreamHandle,
};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{Result, StoreError};

const LIVE_CAPACITY: usize = 1024;

/// Version of a stream as it was read.
///
/// Returned by [`MemoryStore::read_stream`] and passed back to
/// [`MemoryStore::append`], which fails if the stream changed in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamVersion(u64);

impl StreamVersion {
    /// Version of a stream without events.
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct Recorded<E> {
    stream_id: String,
    event: E,
}

#[derive(Debug)]
struct State<E> {
    log: Vec<Recorded<E>>,
    streams: HashMap<String, Vec<u64>>,
}

impl<E> Default for State<E> {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            streams: HashMap::new(),
        }
    }
}

/// Event store keeping every stream in memory.
///
/// Events get one global position, starting at 0, in append order. The store
/// is an [`EventStream`]: subscribers replay what they missed then follow new
/// appends.
pub struct MemoryStore<E> {
    state: Arc<RwLock<State<E>>>,
    live: broadcast::Sender<(u64, E)>,
}

impl<E> Clone for MemoryStore<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            live: self.live.clone(),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync + 'static> MemoryStore<E> {
    pub fn new() -> Self {
        Self::with_capacity(LIVE_CAPACITY)
    }

    /// Store whose subscribers may fall at most `capacity` events behind
    /// live appends before being dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));

        Self {
            state: Arc::default(),
            live,
        }
    }

    pub fn read_stream(&self, stream_id: &str) -> (Vec<E>, StreamVersion) {
        let state = self.state.read();

        let Some(positions) = state.streams.get(stream_id) else {
            return (vec![], StreamVersion::initial());
        };

        let events = positions
            .iter()
            .filter_map(|position| usize::try_from(*position).ok())
            .filter_map(|index| state.log.get(index))
            .map(|recorded| recorded.event.clone())
            .collect();

        (events, StreamVersion(positions.len() as u64))
    }

    /// Appends events to a stream and returns their positions.
    ///
    /// `original_version` must be the version returned when the stream was
    /// read, [`StreamVersion::initial`] for a new stream.
    pub fn append(
        &self,
        stream_id: &str,
        events: Vec<E>,
        original_version: StreamVersion,
    ) -> Result<Vec<u64>> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut state = self.state.write();
        let state = &mut *state;

        let stream = state.streams.entry(stream_id.to_owned()).or_default();
        let version = stream.len() as u64;

        if version != original_version.0 {
            return Err(StoreError::UnexpectedOriginalVersion {
                stream_id: stream_id.to_owned(),
                expected: original_version.0,
                actual: version,
            });
        }

        let mut positions = Vec::with_capacity(events.len());

        for event in events {
            let position = state.log.len() as u64;

            state.log.push(Recorded {
                stream_id: stream_id.to_owned(),
                event: event.clone(),
            });
            stream.push(position);
            positions.push(position);

            // no receiver is fine
            let _ = self.live.send((position, event));
        }

        tracing::trace!(stream_id, positions = ?positions, "events appended");

        Ok(positions)
    }

    /// Position of the last appended event.
    pub fn last_position(&self) -> Option<u64> {
        self.state.read().log.len().checked_sub(1).map(|len| len as u64)
    }

    /// Stream ids, in no particular order.
    pub fn stream_ids(&self) -> Vec<String> {
        self.state.read().streams.keys().cloned().collect()
    }

    fn history_after(&self, from: Option<u64>) -> (Vec<(u64, E)>, broadcast::Receiver<(u64, E)>) {
        let state = self.state.read();

        let history = state
            .log
            .iter()
            .enumerate()
            .map(|(index, recorded)| (index as u64, recorded))
            .filter(|(position, _)| is_after(position, from.as_ref()))
            .map(|(position, recorded)| {
                tracing::trace!(stream_id = %recorded.stream_id, position, "replay");

                (position, recorded.event.clone())
            })
            .collect();

        // appends publish under the write lock, nothing slips between both
        (history, self.live.subscribe())
    }
}

async fn feed<E: Clone + Send + Sync + 'static>(
    history: Vec<(u64, E)>,
    mut live: broadcast::Receiver<(u64, E)>,
    sink: NotificationSink<E, u64>,
    from: Option<u64>,
) -> std::result::Result<(), QueueError> {
    let mut last = from;

    if !history.is_empty() {
        sink.notify_catching_up().await?;

        for (position, event) in history {
            sink.notify_event(event, position).await?;
            last = Some(position);
        }
    }

    sink.notify_live().await?;

    loop {
        match live.recv().await {
            Ok((position, event)) => {
                if !is_after(&position, last.as_ref()) {
                    continue;
                }

                sink.notify_event(event, position).await?;
                last = Some(position);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "subscriber lagged behind live appends");

                return sink
                    .notify_dropped(
                        DropReason::StreamError,
                        Some(anyhow!("subscriber lagged, {skipped} events were lost")),
                    )
                    .await;
            }
            Err(RecvError::Closed) => {
                return sink
                    .notify_dropped(DropReason::StreamError, Some(anyhow!("event store closed")))
                    .await;
            }
        }
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + 'static> EventStream<E, u64> for MemoryStore<E> {
    async fn subscribe(
        &self,
        from: Option<u64>,
        sink: NotificationSink<E, u64>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn StreamHandle>> {
        let (history, live) = self.history_after(from);

        tracing::debug!(from = ?from, replay = history.len(), "memory subscription");

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = feed(history, live, sink, from) => {
                    if let Err(err) = res {
                        tracing::debug!(error = %err, "memory subscription stopped");
                    }
                }
            }
        });

        Ok(Box::new(task))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint<P> {
    pub position: P,
    pub updated_at: DateTime<Utc>,
}

/// [`CheckpointStore`] keeping checkpoints in memory.
#[derive(Debug, Clone)]
pub struct MemoryCheckpoints<P>(Arc<RwLock<HashMap<String, Checkpoint<P>>>>);

impl<P> Default for MemoryCheckpoints<P> {
    fn default() -> Self {
        Self(Arc::default())
    }
}

impl<P: Position> MemoryCheckpoints<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Checkpoint<P>> {
        self.0.read().get(key).cloned()
    }
}

#[async_trait]
impl<P: Position> CheckpointStore<P> for MemoryCheckpoints<P> {
    async fn load(&self, key: &str) -> anyhow::Result<Option<P>> {
        Ok(self.get(key).map(|checkpoint| checkpoint.position))
    }

    async fn save(&self, key: &str, position: &P) -> anyhow::Result<()> {
        self.0.write().insert(
            key.to_owned(),
            Checkpoint {
                position: position.clone(),
                updated_at: Utc::now(),
            },
        );

        Ok(())
    }
}
