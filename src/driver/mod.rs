//! Connection driver.
//!
//! A connection is a cooperative state machine over one nonblocking socket.
//! It runs commands in two ways:
//!
//! | Call              | Blocks caller | Results                          |
//! |-------------------|---------------|----------------------------------|
//! | `execute`         | yes           | one table per row set, at once   |
//! | `execute_async`   | no            | tables grow as rows arrive       |
//!
//! The async path advances whenever the owner reports socket readiness
//! through `ready_read_socket` / `ready_write_socket`; [`offload::Session`]
//! does that on a tokio worker task.

mod cancel;
mod connection;
mod fetch;
pub mod handle;
#[cfg(unix)]
pub mod offload;
mod query;
pub mod socket;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

pub use cancel::{CancelHandle, send_cancel_request};
pub use connection::PgConnection;
pub use handle::{Notification, TxStatus};
pub use query::{completion_message, parse_affected_rows};

use crate::error::SqtError;
use crate::events::{ConnectionEvent, EventSink};
use crate::table::ResultSets;
use crate::types::{TypeMapper, Value};
use crate::watcher::SocketWatcher;

/// Rows appended between two "fetched" notifications.
pub const FETCH_BATCH_SIZE: usize = 100;

/// Reconnect attempts for a command that found its connection broken.
pub const RETRY_LIMIT: u32 = 1;

/// Lifecycle of the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryState {
    Inactive = 0,
    Running = 1,
    Cancelling = 2,
}

impl QueryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => QueryState::Running,
            2 => QueryState::Cancelling,
            _ => QueryState::Inactive,
        }
    }
}

/// Query state shared with [`CancelHandle`]s on other threads.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryStateCell(Arc<AtomicU8>);

impl QueryStateCell {
    pub(crate) fn get(&self) -> QueryState {
        QueryState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    pub(crate) fn swap(&self, state: QueryState) -> QueryState {
        QueryState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to` only if the current state is `from`.
    pub(crate) fn transition(&self, from: QueryState, to: QueryState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Step of the nonblocking protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncPhase {
    #[default]
    None,
    Connecting,
    SendingQuery,
    Flushing,
    WaitingForReadableResult,
}

/// A database connection as seen by the rest of the program.
pub trait DbConnection: Send {
    /// Blocking connect. Succeeds at once if already connected.
    fn open(&mut self) -> bool;

    /// Start a nonblocking connect.
    fn open_async(&mut self);

    /// Release the connection and clear results. Idempotent.
    fn close(&mut self);

    fn is_opened(&self) -> bool;

    /// Connected, no command in flight and no open transaction.
    fn is_idle(&self) -> bool;

    /// Run a command and wait for its complete result.
    fn execute(&mut self, query: &str, params: &[Value], row_limit: Option<u32>) -> bool;

    /// Send a command; results arrive through readiness callbacks.
    fn execute_async(&mut self, query: &str, params: Option<&[Value]>);

    fn cancel(&mut self);

    /// Handle that can cancel the running command from another thread.
    fn cancel_handle(&self) -> CancelHandle;

    fn ready_read_socket(&mut self);

    fn ready_write_socket(&mut self);

    fn query_state(&self) -> QueryState;

    fn async_phase(&self) -> AsyncPhase;

    /// `host:port/database`, empty when closed.
    fn context(&self) -> String;

    fn database(&self) -> &str;

    /// Select the database used by the next connect.
    fn set_database(&mut self, database: &str);

    fn dbms_name(&self) -> &'static str;

    fn dbms_version(&self) -> String;

    /// Server version as a single comparable number.
    fn dbms_comparable_version(&self) -> i32;

    fn dbms_info(&self) -> String;

    fn results(&self) -> ResultSets;

    fn events(&self) -> EventSink;

    fn subscribe(&self) -> UnboundedReceiver<ConnectionEvent> {
        self.events().subscribe()
    }

    fn type_mapper(&self) -> &dyn TypeMapper;

    /// Duration of the current command, or of the last one once finished.
    fn elapsed(&self) -> Duration;

    fn set_watcher(&mut self, watcher: Arc<dyn SocketWatcher>);

    /// An unopened connection with the same connection string and database.
    fn clone_connection(&self) -> Box<dyn DbConnection>;
}

/// Database server families the driver can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Postgres,
}

impl FromStr for Backend {
    type Err = SqtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Backend::Postgres),
            other => Err(SqtError::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Create an unopened connection for `backend`.
pub fn connect(backend: Backend, conn_str: &str, database: &str) -> Box<dyn DbConnection> {
    match backend {
        Backend::Postgres => Box::new(PgConnection::new(conn_str, database)),
    }
}

/// Human-readable duration for transcript messages.
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{} ms", millis)
    } else {
        format!("{:.3} s", elapsed.as_secs_f64())
    }
}
