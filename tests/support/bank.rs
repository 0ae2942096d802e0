use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use dispatched::{Command, CommandHandler, DomainEvent, EventHandler, EventPublisher};

/// Payload of a `DepositMoney` command.
#[derive(Serialize, Deserialize)]
pub struct Deposit {
    pub account_id: String,
    pub amount: u64,
}

/// Credits an account: emits one `AccountCredited` event per deposit,
/// keyed by account so all of one account's events share a queue.
pub struct DepositHandler {
    publisher: EventPublisher,
    sequences: Mutex<HashMap<String, u64>>,
}

impl DepositHandler {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            sequences: Mutex::new(HashMap::new()),
        }
    }
}

impl CommandHandler for DepositHandler {
    fn handle(&self, command: &Command) -> Result<(), Box<dyn Error + Send + Sync>> {
        let deposit: Deposit = command.decode().map_err(|e| e.to_string())?;
        if deposit.amount == 0 {
            return Err("deposit amount must be positive".into());
        }

        let sequence = {
            let mut sequences = self.sequences.lock().unwrap();
            let next = sequences.entry(deposit.account_id.clone()).or_insert(0);
            *next += 1;
            *next
        };

        let event = DomainEvent::encode(
            &deposit.account_id,
            sequence,
            "AccountCredited",
            &deposit.amount,
        )
        .map_err(|e| e.to_string())?;
        self.publisher.publish(&event)?;
        Ok(())
    }
}

/// Read model built from `AccountCredited` events. Also records the order
/// in which events were applied, per account.
#[derive(Clone, Default)]
pub struct Balances {
    inner: Arc<Mutex<BalancesInner>>,
}

#[derive(Default)]
struct BalancesInner {
    totals: HashMap<String, u64>,
    applied: HashMap<String, Vec<u64>>,
}

impl Balances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, account_id: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.totals.get(account_id).copied().unwrap_or(0)
    }

    pub fn events_applied(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.applied.values().map(Vec::len).sum()
    }

    /// Sequences applied for one account, in application order.
    pub fn applied_sequences(&self, account_id: &str) -> Vec<u64> {
        let inner = self.inner.lock().unwrap();
        inner.applied.get(account_id).cloned().unwrap_or_default()
    }
}

impl EventHandler for Balances {
    fn apply(&self, event: &DomainEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        let amount: u64 = event.decode().map_err(|e| e.to_string())?;
        let mut inner = self.inner.lock().unwrap();
        *inner.totals.entry(event.aggregate_id.clone()).or_insert(0) += amount;
        inner
            .applied
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(event.sequence);
        Ok(())
    }
}
