//! PostgreSQL connection: lifecycle, socket watching and server info.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::handle::{CancelTarget, HandleStatus, PgHandle, PollingStatus, TxStatus};
use super::{AsyncPhase, CancelHandle, DbConnection, QueryState, QueryStateCell};
use crate::conninfo::{ConnectOptions, final_connection_string};
use crate::error::{SqtError, SqtResult};
use crate::events::{ConnectionEvent, EventSink};
use crate::table::ResultSets;
use crate::types::{PgTypeMapper, TypeMapper, Value};
use crate::watcher::{NullWatcher, SocketWatcher, WatchMode};

/// Server parameters listed by `dbms_info`, in display order.
const INFO_PARAMETERS: [&str; 10] = [
    "server_encoding",
    "client_encoding",
    "application_name",
    "is_superuser",
    "session_authorization",
    "DateStyle",
    "IntervalStyle",
    "TimeZone",
    "integer_datetimes",
    "standard_conforming_strings",
];

/// Row set currently being filled by the async fetch.
#[derive(Debug, Clone, Copy)]
pub(super) struct PartialTable {
    pub index: usize,
    pub rows: usize,
}

pub struct PgConnection {
    pub(super) conn_str: String,
    pub(super) database: String,
    pub(super) handle: Option<PgHandle>,
    pub(super) watcher: Arc<dyn SocketWatcher>,
    pub(super) mapper: Arc<dyn TypeMapper>,
    pub(super) state: QueryStateCell,
    pub(super) phase: AsyncPhase,
    pub(super) events: EventSink,
    pub(super) results: ResultSets,
    pub(super) partial: Option<PartialTable>,
    /// Command of the async path, kept for a resend after reconnect
    pub(super) query: String,
    pub(super) params: Option<Vec<Value>>,
    pub(super) tx_before_send: TxStatus,
    /// The last connection died inside a transaction
    pub(super) lost_in_transaction: bool,
    pub(super) retries: u32,
    pub(super) started: Option<Instant>,
    pub(super) elapsed: Duration,
    pub(super) cancel_target: Arc<Mutex<Option<CancelTarget>>>,
}

impl PgConnection {
    pub fn new(conn_str: &str, database: &str) -> Self {
        Self::with_watcher(conn_str, database, Arc::new(NullWatcher::new()))
    }

    pub fn with_watcher(conn_str: &str, database: &str, watcher: Arc<dyn SocketWatcher>) -> Self {
        Self {
            conn_str: conn_str.to_string(),
            database: database.to_string(),
            handle: None,
            watcher,
            mapper: Arc::new(PgTypeMapper),
            state: QueryStateCell::default(),
            phase: AsyncPhase::None,
            events: EventSink::new(),
            results: ResultSets::new(),
            partial: None,
            query: String::new(),
            params: None,
            tx_before_send: TxStatus::Unknown,
            lost_in_transaction: false,
            retries: 0,
            started: None,
            elapsed: Duration::ZERO,
            cancel_target: Arc::new(Mutex::new(None)),
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.conn_str
    }

    /// Options for the next connect, including application name and the
    /// selected database.
    pub fn connect_options(&self) -> SqtResult<ConnectOptions> {
        ConnectOptions::parse(&final_connection_string(&self.conn_str, &self.database)?)
    }

    /// Server parameter reported at startup or since.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.handle.as_ref().and_then(|h| h.parameter(name))
    }

    pub fn transaction_status(&self) -> TxStatus {
        self.handle
            .as_ref()
            .map(PgHandle::transaction_status)
            .unwrap_or(TxStatus::Unknown)
    }

    /// Ask the watcher for `mode`. Without a healthy socket nothing is
    /// watched.
    pub(super) fn watch(&self, mode: WatchMode) {
        let socket = self
            .handle
            .as_ref()
            .filter(|h| h.status() != HandleStatus::Bad)
            .and_then(PgHandle::socket_ref);
        match socket {
            Some(socket) => self.watcher.watch(Some(socket), mode),
            None => self.watcher.watch(None, WatchMode::NONE),
        }
    }

    pub(super) fn set_query_state(&self, state: QueryState) {
        if self.state.swap(state) != state {
            debug!("query state {:?}", state);
            self.events.emit(ConnectionEvent::QueryStateChanged(state));
        }
    }

    pub(super) fn is_busy(&self) -> bool {
        self.state.get() != QueryState::Inactive || self.phase != AsyncPhase::None
    }

    pub(super) fn start_timer(&mut self) {
        self.started = Some(Instant::now());
    }

    /// End the current command: no phase, timer stopped, state inactive.
    pub(super) fn finish_query(&mut self) {
        self.phase = AsyncPhase::None;
        if let Some(started) = self.started.take() {
            self.elapsed = started.elapsed();
        }
        self.set_query_state(QueryState::Inactive);
    }

    fn install_handle(&mut self, handle: PgHandle) {
        *self
            .cancel_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handle.cancel_target();
        self.lost_in_transaction = false;
        self.handle = Some(handle);
    }

    /// Drop the protocol handle. The watcher lets go of the socket first.
    pub(super) fn close_handle(&mut self) {
        self.watcher.watch(None, WatchMode::NONE);
        if let Some(handle) = self.handle.take() {
            debug!("closing connection {}", handle.id());
        }
        *self
            .cancel_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn on_connected(&mut self) {
        if self.database.is_empty() {
            if let Some(handle) = &self.handle {
                self.database = handle.options().database().to_string();
            }
        }
        self.drain_side_channel();
        self.events
            .emit(ConnectionEvent::ContextChanged(self.context_string()));
    }

    fn open_blocking(&mut self) -> SqtResult<()> {
        let opts = self.connect_options()?;
        let handle = PgHandle::connect_blocking(opts);
        if !handle.is_ok() {
            return Err(SqtError::connection(handle.error_message()));
        }
        self.install_handle(handle);
        self.on_connected();
        Ok(())
    }

    pub(super) fn open_inner(&mut self) -> SqtResult<()> {
        if self.handle.as_ref().is_some_and(PgHandle::is_ok) {
            return Ok(());
        }
        // a blocking open replaces any handshake still in progress
        let was_connecting = self.phase == AsyncPhase::Connecting;
        self.close_handle();
        if was_connecting {
            self.phase = AsyncPhase::None;
        }
        if let Err(e) = self.open_blocking() {
            if was_connecting {
                self.abandon_query();
            }
            return Err(e);
        }
        if was_connecting && self.state.get() == QueryState::Running {
            info!("connection restored, resending command");
            self.send_pending();
        } else {
            self.watch(WatchMode::READ);
        }
        Ok(())
    }

    pub fn open(&mut self) -> bool {
        match self.open_inner() {
            Ok(()) => true,
            Err(e) => {
                self.events.error(e.to_string());
                false
            }
        }
    }

    pub fn open_async(&mut self) {
        let tx = self.transaction_status();
        if self.phase != AsyncPhase::None || !matches!(tx, TxStatus::Idle | TxStatus::Unknown) {
            self.events.error(format!(
                "unable to open connection (transaction status {:?})",
                tx
            ));
            return;
        }
        if self.is_opened() {
            return;
        }
        self.close_handle();

        let handle = match self.connect_options() {
            Ok(opts) => PgHandle::connect_start(opts),
            Err(e) => {
                self.events.error(e.to_string());
                self.abandon_query();
                return;
            }
        };
        if handle.status() == HandleStatus::Bad {
            self.events.error(handle.error_message());
            self.abandon_query();
            return;
        }
        self.install_handle(handle);
        self.phase = AsyncPhase::Connecting;
        self.watch(WatchMode::WRITE);
    }

    /// A failed (re)connect ends any command waiting for it.
    fn abandon_query(&mut self) {
        if self.state.get() != QueryState::Inactive {
            self.finish_query();
        }
    }

    pub(super) fn async_connection_proceed(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            self.phase = AsyncPhase::None;
            self.abandon_query();
            return;
        };
        match handle.connect_poll() {
            PollingStatus::Reading => self.watch(WatchMode::READ),
            PollingStatus::Writing => self.watch(WatchMode::WRITE),
            PollingStatus::Failed => {
                let message = handle.error_message().to_string();
                self.close_handle();
                self.phase = AsyncPhase::None;
                self.events.error(message);
                self.abandon_query();
            }
            PollingStatus::Ok => {
                self.phase = AsyncPhase::None;
                *self
                    .cancel_target
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = handle.cancel_target();
                self.on_connected();
                self.events.message("connection established");
                if self.state.get() == QueryState::Running {
                    info!("connection restored, resending command");
                    self.send_pending();
                } else {
                    self.watch(WatchMode::READ);
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.close_handle();
        self.lost_in_transaction = false;
        self.results.clear();
        self.partial = None;
        self.phase = AsyncPhase::None;
        self.set_query_state(QueryState::Inactive);
    }

    pub fn is_opened(&self) -> bool {
        self.handle.as_ref().is_some_and(PgHandle::is_ok)
    }

    pub fn is_idle(&self) -> bool {
        self.is_opened() && !self.is_busy() && self.transaction_status() == TxStatus::Idle
    }

    pub fn ready_read_socket(&mut self) {
        match self.phase {
            AsyncPhase::Connecting => self.async_connection_proceed(),
            AsyncPhase::Flushing => {
                // the server may be waiting for us to read before it reads more
                let consumed = match self.handle.as_mut() {
                    Some(handle) => handle.consume_input(),
                    None => return,
                };
                match consumed {
                    Ok(()) => self.proceed_flush(),
                    Err(e) => self.fail_hard(e),
                }
            }
            AsyncPhase::WaitingForReadableResult => self.fetch(),
            AsyncPhase::SendingQuery => {}
            AsyncPhase::None => {
                if self.state.get() == QueryState::Inactive {
                    self.fetch();
                }
            }
        }
    }

    pub fn ready_write_socket(&mut self) {
        match self.phase {
            AsyncPhase::Connecting => self.async_connection_proceed(),
            AsyncPhase::Flushing => self.proceed_flush(),
            _ => self.watch(WatchMode::READ),
        }
    }

    fn context_string(&self) -> String {
        match &self.handle {
            Some(handle) if handle.is_ok() => {
                let opts = handle.options();
                format!("{}:{}/{}", opts.host, opts.port, self.database)
            }
            _ => String::new(),
        }
    }

    pub fn dbms_version(&self) -> String {
        self.parameter("server_version").unwrap_or_default().to_string()
    }

    pub fn dbms_comparable_version(&self) -> i32 {
        self.parameter("server_version_num")
            .and_then(|v| v.parse().ok())
            .or_else(|| self.parameter("server_version").and_then(comparable_version))
            .filter(|v| *v != 0)
            // unknown: behave as the newest server
            .unwrap_or(i32::MAX)
    }

    pub fn dbms_info(&self) -> String {
        if !self.is_opened() {
            return String::new();
        }
        let mut out = format!("PostgreSQL v.{}\n\n", self.dbms_version());
        for name in INFO_PARAMETERS {
            if let Some(value) = self.parameter(name) {
                out.push_str(&format!("{:<27}: {}\n", name, value));
            }
        }
        out
    }

    pub fn elapsed(&self) -> Duration {
        self.started
            .map(|started| started.elapsed())
            .unwrap_or(self.elapsed)
    }
}

/// `server_version` text to the `server_version_num` encoding:
/// 16.2 -> 160002, 9.6.3 -> 90603.
fn comparable_version(version: &str) -> Option<i32> {
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter(|p| !p.is_empty());
    let major: i32 = parts.next()?.parse().ok()?;
    let minor: i32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    if major >= 10 {
        Some(major * 10000 + minor)
    } else {
        let patch: i32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(major * 10000 + minor * 100 + patch)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl DbConnection for PgConnection {
    fn open(&mut self) -> bool {
        PgConnection::open(self)
    }

    fn open_async(&mut self) {
        PgConnection::open_async(self)
    }

    fn close(&mut self) {
        PgConnection::close(self)
    }

    fn is_opened(&self) -> bool {
        PgConnection::is_opened(self)
    }

    fn is_idle(&self) -> bool {
        PgConnection::is_idle(self)
    }

    fn execute(&mut self, query: &str, params: &[Value], row_limit: Option<u32>) -> bool {
        PgConnection::execute(self, query, params, row_limit)
    }

    fn execute_async(&mut self, query: &str, params: Option<&[Value]>) {
        PgConnection::execute_async(self, query, params)
    }

    fn cancel(&mut self) {
        self.cancel_handle().cancel();
    }

    fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(
            self.state.clone(),
            self.cancel_target.clone(),
            self.events.clone(),
        )
    }

    fn ready_read_socket(&mut self) {
        PgConnection::ready_read_socket(self)
    }

    fn ready_write_socket(&mut self) {
        PgConnection::ready_write_socket(self)
    }

    fn query_state(&self) -> QueryState {
        self.state.get()
    }

    fn async_phase(&self) -> AsyncPhase {
        self.phase
    }

    fn context(&self) -> String {
        self.context_string()
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn set_database(&mut self, database: &str) {
        if self.database != database {
            self.database = database.to_string();
            self.events
                .emit(ConnectionEvent::ContextChanged(self.context_string()));
        }
    }

    fn dbms_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn dbms_version(&self) -> String {
        PgConnection::dbms_version(self)
    }

    fn dbms_comparable_version(&self) -> i32 {
        PgConnection::dbms_comparable_version(self)
    }

    fn dbms_info(&self) -> String {
        PgConnection::dbms_info(self)
    }

    fn results(&self) -> ResultSets {
        self.results.clone()
    }

    fn events(&self) -> EventSink {
        self.events.clone()
    }

    fn type_mapper(&self) -> &dyn TypeMapper {
        self.mapper.as_ref()
    }

    fn elapsed(&self) -> Duration {
        PgConnection::elapsed(self)
    }

    fn set_watcher(&mut self, watcher: Arc<dyn SocketWatcher>) {
        let mode = self.watcher.mode();
        self.watcher.watch(None, WatchMode::NONE);
        self.watcher = watcher;
        self.watch(mode);
    }

    fn clone_connection(&self) -> Box<dyn DbConnection> {
        Box::new(PgConnection::new(&self.conn_str, &self.database))
    }
}
