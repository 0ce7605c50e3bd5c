//! Post-commit ledger notifications.
//!
//! Events are handed to a bounded channel and never awaited. A full or
//! closed channel drops the event with a warning; the ledger write that
//! produced it has already committed.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    StatementCreated {
        owner_id: Uuid,
        statement_id: Uuid,
        sub_meter_count: usize,
    },
    StatementUpdated {
        owner_id: Uuid,
        statement_id: Uuid,
        version: i32,
    },
    StatementDeleted {
        owner_id: Uuid,
        statement_id: Uuid,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StatementCreated { .. } => "statement_created",
            Self::StatementUpdated { .. } => "statement_updated",
            Self::StatementDeleted { .. } => "statement_deleted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEventPublisher {
    tx: mpsc::Sender<LedgerEvent>,
}

impl LedgerEventPublisher {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<LedgerEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event without waiting.
    pub fn publish(&self, event: LedgerEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(ev) => ("queue full", ev),
                mpsc::error::TrySendError::Closed(ev) => ("queue closed", ev),
            };
            tracing::warn!(event = event.name(), reason, "Dropping ledger event");
        }
    }
}

/// Drain `rx`, logging each event, until every publisher is dropped.
pub fn spawn_event_logger(mut rx: mpsc::Receiver<LedgerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => tracing::info!(event = event.name(), %payload, "Ledger event"),
                Err(e) => tracing::warn!(error = %e, "Failed to encode ledger event"),
            }
        }
        tracing::info!("Ledger event channel closed, logger exiting");
    })
}
