use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// How often a consumer's checkpoint callback fires.
///
/// A checkpoint is due once `events` events were acknowledged since the last
/// one, or once `interval` elapsed since the last one with at least one event
/// pending. Both triggers are optional.
///
/// ```rust,ignore
/// // every 500 events, or every 10 seconds, whichever comes first
/// let frequency = CheckpointFrequency::every(500).or_interval(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFrequency {
    pub events: Option<u64>,
    pub interval: Option<Duration>,
}

impl Default for CheckpointFrequency {
    fn default() -> Self {
        Self {
            events: Some(100),
            interval: Some(Duration::from_secs(5)),
        }
    }
}

impl CheckpointFrequency {
    /// Checkpoint every `events` acknowledged events. Zero is read as one.
    pub fn every(events: u64) -> Self {
        Self {
            events: Some(events.max(1)),
            interval: None,
        }
    }

    /// Checkpoint when `interval` has elapsed since the last checkpoint.
    pub fn interval(interval: Duration) -> Self {
        Self {
            events: None,
            interval: Some(interval),
        }
    }

    /// Never checkpoint on cadence.
    pub fn never() -> Self {
        Self {
            events: None,
            interval: None,
        }
    }

    pub fn or_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);

        self
    }

    pub(crate) fn is_due(&self, pending: u64, elapsed: Duration) -> bool {
        if pending == 0 {
            return false;
        }

        if self.events.is_some_and(|events| pending >= events) {
            return true;
        }

        self.interval.is_some_and(|interval| elapsed >= interval)
    }
}

/// Progress of one consumer since its last checkpoint.
#[derive(Debug)]
pub(crate) struct Tracker {
    pending: u64,
    last: Instant,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self {
            pending: 0,
            last: Instant::now(),
        }
    }

    /// Counts one acknowledged event and returns whether a checkpoint is due.
    pub(crate) fn acknowledge(&mut self, frequency: &CheckpointFrequency) -> bool {
        self.pending += 1;

        frequency.is_due(self.pending, self.last.elapsed())
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending
    }

    /// Instant at which pending progress is due on interval, if any.
    pub(crate) fn deadline(&self, frequency: &CheckpointFrequency) -> Option<Instant> {
        if self.pending == 0 {
            return None;
        }

        frequency.interval.map(|interval| self.last + interval)
    }

    pub(crate) fn is_due(&self, frequency: &CheckpointFrequency) -> bool {
        frequency.is_due(self.pending, self.last.elapsed())
    }

    pub(crate) fn reset(&mut self) {
        self.pending = 0;
        self.last = Instant::now();
    }
}
