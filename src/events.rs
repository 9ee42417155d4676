//! Connection events.
//!
//! Observers receive events through unbounded tokio channels, so the
//! connection never blocks on a slow consumer and events can cross from the
//! worker task to the caller.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::driver::QueryState;
use crate::table::TableRef;

/// Something a connection wants its observers to know.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Informational transcript text.
    Message(String),
    Error(String),
    /// Rows of a result table are ready to be displayed.
    Fetched(TableRef),
    QueryStateChanged(QueryState),
    /// Database or server context changed (`host:port/database`).
    ContextChanged(String),
}

/// Fan-out of events to every subscriber.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver an event, dropping subscribers whose receiver is gone.
    pub fn emit(&self, event: ConnectionEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(ConnectionEvent::Message(text.into()));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(ConnectionEvent::Error(text.into()));
    }

    pub fn fetched(&self, index: usize, rows: usize) {
        self.emit(ConnectionEvent::Fetched(TableRef { index, rows }));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
