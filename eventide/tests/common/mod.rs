#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use eventide::{
    CancellationToken, CheckpointFrequency, Consumer, DropReason, ErrorResolution, EventKind,
    EventStream, NotificationSink, StreamHandle, Subscription, SubscriptionError,
    SubscriptionState,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    pub kind: String,
    pub seq: u64,
}

impl UserEvent {
    pub fn new(kind: impl Into<String>, seq: u64) -> Self {
        Self {
            kind: kind.into(),
            seq,
        }
    }
}

impl EventKind for UserEvent {
    fn kind(&self) -> &str {
        &self.kind
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("boom at {0}")]
pub struct Boom(pub u64);

#[derive(Debug, Clone)]
pub enum Step {
    CatchingUp,
    Event(u64),
    Live,
    Drop(DropReason, Option<&'static str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plays the script from a spawned task, the handshake completes at once.
    Spawned,
    /// Plays the script inside `subscribe`, the handshake never completes.
    Inline,
    /// `subscribe` fails.
    Failing,
}

/// Store adapter replaying a fixed script of notifications.
#[derive(Clone)]
pub struct ScriptedStream {
    steps: Vec<Step>,
    mode: Mode,
    pub from: Arc<Mutex<Vec<Option<u64>>>>,
    pub disposed: Arc<AtomicUsize>,
}

impl ScriptedStream {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            mode: Mode::Spawned,
            from: Arc::default(),
            disposed: Arc::default(),
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;

        self
    }

    pub fn subscribed_from(&self) -> Vec<Option<u64>> {
        self.from.lock().clone()
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

async fn play(steps: Vec<Step>, sink: NotificationSink<UserEvent, u64>) -> Result<()> {
    for step in steps {
        if sink.is_closed() {
            break;
        }

        match step {
            Step::CatchingUp => sink.notify_catching_up().await?,
            Step::Event(seq) => sink.notify_event(UserEvent::new("created", seq), seq).await?,
            Step::Live => sink.notify_live().await?,
            Step::Drop(reason, error) => {
                sink.notify_dropped(reason, error.map(|e| anyhow!(e))).await?
            }
        }
    }

    Ok(())
}

struct ScriptHandle {
    task: Option<tokio::task::JoinHandle<()>>,
    disposed: Arc<AtomicUsize>,
}

impl StreamHandle for ScriptHandle {
    fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStream<UserEvent, u64> for ScriptedStream {
    async fn subscribe(
        &self,
        from: Option<u64>,
        sink: NotificationSink<UserEvent, u64>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn StreamHandle>> {
        self.from.lock().push(from);

        match self.mode {
            Mode::Failing => Err(anyhow!("connection refused")),
            Mode::Inline => {
                let _ = play(self.steps.clone(), sink).await;

                std::future::pending().await
            }
            Mode::Spawned => {
                let steps = self.steps.clone();
                // the sink stays open until cancelled, like a live feed
                let task = tokio::spawn(async move {
                    let _ = play(steps, sink.clone()).await;
                    cancel.cancelled().await;
                    drop(sink);
                });

                Ok(Box::new(ScriptHandle {
                    task: Some(task),
                    disposed: self.disposed.clone(),
                }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Starting,
    CatchingUp,
    Event(u64),
    Error(u64),
    Live,
    Checkpoint(u64),
    Dropped(DropReason),
}

pub type Journal = Arc<Mutex<Vec<(String, Call)>>>;

/// Consumer recording every callback.
pub struct Recorder {
    name: String,
    start: Option<u64>,
    calls: Arc<Mutex<Vec<Call>>>,
    journal: Option<Journal>,
    failures: HashMap<u64, usize>,
    resolution: ErrorResolution,
    catch_up: CheckpointFrequency,
    live: CheckpointFrequency,
    fail_starting: bool,
    fail_catching_up: bool,
    fail_live: bool,
    fail_checkpoint: bool,
    panic_at: Option<u64>,
    fault: Arc<Mutex<Option<SubscriptionError>>>,
}

#[derive(Clone)]
pub struct Calls {
    calls: Arc<Mutex<Vec<Call>>>,
    fault: Arc<Mutex<Option<SubscriptionError>>>,
}

impl Calls {
    pub fn all(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Positions passed to `on_event`, attempts included.
    pub fn events(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Event(seq) => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Checkpoint(seq) => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, expected: &Call) -> usize {
        self.calls.lock().iter().filter(|call| *call == expected).count()
    }

    pub fn fault(&self) -> Option<SubscriptionError> {
        self.fault.lock().clone()
    }

    /// Waits until `expected` was recorded.
    pub async fn wait_for(&self, expected: Call) -> Result<()> {
        timeout(WAIT, async {
            while self.count(&expected) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        Ok(())
    }
}

impl Recorder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            start: None,
            calls: Arc::default(),
            journal: None,
            failures: HashMap::new(),
            resolution: ErrorResolution::Abort,
            catch_up: CheckpointFrequency::never(),
            live: CheckpointFrequency::never(),
            fail_starting: false,
            fail_catching_up: false,
            fail_live: false,
            fail_checkpoint: false,
            panic_at: None,
            fault: Arc::default(),
        }
    }

    pub fn start(mut self, position: u64) -> Self {
        self.start = Some(position);

        self
    }

    pub fn journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());

        self
    }

    /// Fails `times` times on the event at `position`.
    pub fn fail(mut self, position: u64, times: usize, resolution: ErrorResolution) -> Self {
        self.failures.insert(position, times);
        self.resolution = resolution;

        self
    }

    pub fn checkpoints(mut self, catch_up: CheckpointFrequency, live: CheckpointFrequency) -> Self {
        self.catch_up = catch_up;
        self.live = live;

        self
    }

    pub fn fail_starting(mut self) -> Self {
        self.fail_starting = true;

        self
    }

    pub fn fail_catching_up(mut self) -> Self {
        self.fail_catching_up = true;

        self
    }

    pub fn fail_checkpoint(mut self) -> Self {
        self.fail_checkpoint = true;

        self
    }

    /// Panics while handling the event at `position`.
    pub fn panic_at(mut self, position: u64) -> Self {
        self.panic_at = Some(position);

        self
    }

    pub fn fail_live(mut self) -> Self {
        self.fail_live = true;

        self
    }

    pub fn calls(&self) -> Calls {
        Calls {
            calls: self.calls.clone(),
            fault: self.fault.clone(),
        }
    }

    fn record(&self, call: Call) {
        if let Some(journal) = self.journal.as_ref() {
            journal.lock().push((self.name.to_owned(), call.clone()));
        }

        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Consumer<UserEvent, u64> for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_starting(&mut self) -> Result<Option<u64>> {
        self.record(Call::Starting);

        if self.fail_starting {
            return Err(anyhow!("checkpoint table missing"));
        }

        Ok(self.start)
    }

    async fn on_catching_up(&mut self) -> Result<()> {
        self.record(Call::CatchingUp);

        if self.fail_catching_up {
            return Err(anyhow!("replay not allowed"));
        }

        Ok(())
    }

    async fn on_event(&mut self, event: &UserEvent, position: &u64) -> Result<()> {
        assert_eq!(event.seq, *position);
        self.record(Call::Event(*position));

        if self.panic_at == Some(*position) {
            panic!("corrupted read model at {position}");
        }

        if let Some(remaining) = self.failures.get_mut(position) {
            if *remaining > 0 {
                *remaining -= 1;

                return Err(Boom(*position).into());
            }
        }

        Ok(())
    }

    async fn on_event_error(
        &mut self,
        _event: &UserEvent,
        position: &u64,
        _error: &anyhow::Error,
    ) -> ErrorResolution {
        self.record(Call::Error(*position));

        self.resolution
    }

    async fn on_live(&mut self) -> Result<()> {
        self.record(Call::Live);

        if self.fail_live {
            return Err(anyhow!("read model offline"));
        }

        Ok(())
    }

    async fn on_checkpoint(&mut self, position: &u64) -> Result<()> {
        self.record(Call::Checkpoint(*position));

        if self.fail_checkpoint {
            return Err(anyhow!("checkpoint store unavailable"));
        }

        Ok(())
    }

    async fn on_subscription_dropped(
        &mut self,
        reason: DropReason,
        error: Option<&SubscriptionError>,
    ) {
        *self.fault.lock() = error.cloned();
        self.record(Call::Dropped(reason));
    }

    fn catch_up_checkpoint_frequency(&self) -> CheckpointFrequency {
        self.catch_up
    }

    fn live_checkpoint_frequency(&self) -> CheckpointFrequency {
        self.live
    }
}

pub async fn wait_for_state(
    subscription: &Subscription<UserEvent, u64>,
    state: SubscriptionState,
) -> Result<()> {
    let mut states = subscription.watch_state();

    timeout(WAIT, states.wait_for(|s| *s == state)).await??;

    Ok(())
}

pub async fn wait_for_completed(
    subscription: &Subscription<UserEvent, u64>,
) -> Result<std::result::Result<(), SubscriptionError>> {
    Ok(timeout(WAIT, subscription.wait_for_completed()).await?)
}
