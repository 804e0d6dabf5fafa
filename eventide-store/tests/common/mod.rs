#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use eventide::{
    CheckpointFrequency, Consumer, Context, Data, DropReason, EventKind, Handler,
    SubscriptionError,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Notify, time::timeout};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankEvent {
    pub kind: &'static str,
    pub account: String,
    pub amount: i64,
}

impl EventKind for BankEvent {
    fn kind(&self) -> &str {
        self.kind
    }
}

pub fn deposited(account: &str, amount: i64) -> BankEvent {
    BankEvent {
        kind: "deposited",
        account: account.to_owned(),
        amount,
    }
}

pub fn withdrawn(account: &str, amount: i64) -> BankEvent {
    BankEvent {
        kind: "withdrawn",
        account: account.to_owned(),
        amount,
    }
}

pub fn renamed(account: &str) -> BankEvent {
    BankEvent {
        kind: "renamed",
        account: account.to_owned(),
        amount: 0,
    }
}

#[derive(Debug, Default)]
pub struct Balances {
    accounts: Mutex<HashMap<String, i64>>,
    handled: Mutex<Vec<u64>>,
}

impl Balances {
    pub fn balance(&self, account: &str) -> i64 {
        self.accounts.lock().get(account).copied().unwrap_or_default()
    }

    pub fn handled(&self) -> Vec<u64> {
        self.handled.lock().clone()
    }

    fn apply(&self, event: &BankEvent, position: u64, sign: i64) {
        *self.accounts.lock().entry(event.account.to_owned()).or_default() += sign * event.amount;
        self.handled.lock().push(position);
    }

    pub async fn wait_for(&self, position: u64) -> Result<()> {
        timeout(WAIT, async {
            while !self.handled.lock().contains(&position) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        Ok(())
    }
}

pub struct Deposited;

#[async_trait]
impl Handler<BankEvent, u64> for Deposited {
    async fn handle(&self, context: &Context, event: &BankEvent, position: &u64) -> Result<()> {
        let balances: Data<Balances> = context.extract();
        balances.apply(event, *position, 1);

        Ok(())
    }
}

pub struct Withdrawn;

#[async_trait]
impl Handler<BankEvent, u64> for Withdrawn {
    async fn handle(&self, context: &Context, event: &BankEvent, position: &u64) -> Result<()> {
        let balances: Data<Balances> = context.extract();

        if balances.balance(&event.account) < event.amount {
            anyhow::bail!("insufficient funds on {}", event.account);
        }

        balances.apply(event, *position, -1);

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    CatchingUp,
    Event(u64),
    Live,
    Dropped(DropReason),
}

/// Consumer recording the notifications it sees.
#[derive(Default)]
pub struct Collector {
    start: Option<u64>,
    seen: Arc<Mutex<Vec<Seen>>>,
    gate: Option<Arc<Notify>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(mut self, position: u64) -> Self {
        self.start = Some(position);

        self
    }

    /// Holds `on_live` until `gate` is notified.
    pub fn gate(mut self, gate: &Arc<Notify>) -> Self {
        self.gate = Some(gate.clone());

        self
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Seen>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Consumer<BankEvent, u64> for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    async fn on_starting(&mut self) -> Result<Option<u64>> {
        Ok(self.start)
    }

    async fn on_catching_up(&mut self) -> Result<()> {
        self.seen.lock().push(Seen::CatchingUp);

        Ok(())
    }

    async fn on_event(&mut self, _event: &BankEvent, position: &u64) -> Result<()> {
        self.seen.lock().push(Seen::Event(*position));

        Ok(())
    }

    async fn on_live(&mut self) -> Result<()> {
        self.seen.lock().push(Seen::Live);

        if let Some(gate) = self.gate.as_ref() {
            gate.notified().await;
        }

        Ok(())
    }

    async fn on_subscription_dropped(
        &mut self,
        reason: DropReason,
        _error: Option<&SubscriptionError>,
    ) {
        self.seen.lock().push(Seen::Dropped(reason));
    }

    fn live_checkpoint_frequency(&self) -> CheckpointFrequency {
        CheckpointFrequency::never()
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) -> Result<()> {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    Ok(())
}
