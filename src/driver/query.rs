//! Sending commands: the blocking `execute` and the nonblocking send/flush
//! steps of `execute_async`.

use tracing::{debug, warn};

use super::connection::PgConnection;
use super::handle::FlushStatus;
use super::{AsyncPhase, QueryState, RETRY_LIMIT};
use crate::error::{SqtError, SqtResult};
use crate::params::ParamList;
use crate::protocol::{BackendMessage, ErrorFields, oid};
use crate::table::{DataColumn, DataRow, DataTable, TableState};
use crate::types::{TypeMapper, Value};
use crate::watcher::WatchMode;

/// SQLSTATE of "canceling statement due to user request".
pub(super) const QUERY_CANCELED: &str = "57014";

/// Everything a blocking command produced.
#[derive(Debug, Default)]
struct Response {
    tables: Vec<DataTable>,
    messages: Vec<String>,
    error: Option<ErrorFields>,
    /// First column-count mismatch, if any
    mismatch: Option<SqtError>,
}

/// Extract the row count from a CommandComplete tag.
pub fn parse_affected_rows(tag: &str) -> u64 {
    tag.split_whitespace()
        .last()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Transcript line for a command that returned no row set.
pub fn completion_message(tag: &str) -> String {
    match tag.split_whitespace().next().unwrap_or("") {
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "SELECT" | "MOVE" | "FETCH" | "COPY" => {
            format!("{} rows affected", parse_affected_rows(tag))
        }
        _ => "statement executed successfully".to_string(),
    }
}

/// Decode one DataRow against the columns of its table.
pub(super) fn decode_row(
    mapper: &dyn TypeMapper,
    columns: &[DataColumn],
    cells: Vec<Option<Vec<u8>>>,
) -> DataRow {
    cells
        .into_iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            None => Value::Null,
            Some(raw) => {
                let type_id = columns.get(i).map(|c| c.type_id).unwrap_or(oid::TEXT);
                mapper.decode(type_id, &raw)
            }
        })
        .collect()
}

impl PgConnection {
    pub fn execute(&mut self, query: &str, params: &[Value], row_limit: Option<u32>) -> bool {
        if self.is_busy() {
            self.events.error(SqtError::Busy.to_string());
            return false;
        }
        self.results.clear();
        self.partial = None;

        let query = match row_limit {
            Some(limit) => format!("{} limit {}", query, limit),
            None => query.to_string(),
        };
        let params = ParamList::from_values(params);

        // results are read inline; the watcher must not race us for them
        self.watch(WatchMode::NONE);
        self.start_timer();
        self.set_query_state(QueryState::Running);

        let mut attempts = 0;
        let outcome = loop {
            match self.exchange_blocking(&query, &params) {
                Err(e) if e.is_connection_loss() => {
                    let in_transaction = self.tx_before_send.in_transaction()
                        || std::mem::take(&mut self.lost_in_transaction);
                    self.close_handle();
                    if in_transaction || attempts >= RETRY_LIMIT {
                        if in_transaction {
                            warn!("connection lost inside a transaction, not retrying");
                        }
                        break Err(e);
                    }
                    attempts += 1;
                    warn!("connection lost ({}), reconnecting", e);
                    // reported even when the retry succeeds
                    self.events.error(e.to_string());
                    if let Err(e) = self.open_inner() {
                        break Err(e);
                    }
                    self.watch(WatchMode::NONE);
                }
                other => break other,
            }
        };
        self.drain_side_channel();

        let ok = match outcome {
            Ok(response) => self.publish_response(response),
            Err(e) => {
                self.events.error(e.to_string());
                false
            }
        };
        self.finish_query();
        self.watch(WatchMode::READ);
        ok
    }

    /// Send one command and read its whole response.
    fn exchange_blocking(&mut self, query: &str, params: &ParamList) -> SqtResult<Response> {
        self.tx_before_send = self.transaction_status();
        let mapper = self.mapper.clone();
        let handle = self
            .handle
            .as_mut()
            .filter(|h| h.is_ok())
            .ok_or_else(|| SqtError::connection("no connection to the server"))?;

        if params.is_empty() {
            handle.send_query(query)?;
        } else {
            handle.send_query_params(query, params)?;
        }
        handle.flush_blocking()?;

        let mut response = Response::default();
        let mut current: Option<DataTable> = None;
        loop {
            let Some(msg) = handle.next_message()? else {
                handle.read_blocking()?;
                continue;
            };
            match msg {
                BackendMessage::RowDescription(fields) => {
                    let columns = fields
                        .iter()
                        .map(|f| DataColumn::from_field(f, mapper.as_ref()))
                        .collect();
                    let mut table = DataTable::new();
                    table.define_columns(columns)?;
                    current = Some(table);
                }
                BackendMessage::DataRow(cells) => {
                    let Some(table) = current.as_mut() else {
                        return Err(SqtError::protocol("data row without row description"));
                    };
                    if table.state() == TableState::Failed {
                        continue;
                    }
                    let row = decode_row(mapper.as_ref(), table.columns(), cells);
                    if let Err(e) = table.append_row(row) {
                        response.mismatch.get_or_insert(e);
                    }
                }
                BackendMessage::CommandComplete(tag) => match current.take() {
                    Some(mut table) => {
                        table.complete();
                        response
                            .messages
                            .push(format!("{} rows fetched", table.row_count()));
                        response.tables.push(table);
                    }
                    None => response.messages.push(completion_message(&tag)),
                },
                BackendMessage::ErrorResponse(fields) => {
                    current = None;
                    response.error.get_or_insert(fields);
                }
                BackendMessage::ReadyForQuery(_) => break,
                other => debug!("ignoring {:?}", other),
            }
        }
        Ok(response)
    }

    /// Report a blocking response to observers. False on a failed command.
    fn publish_response(&mut self, response: Response) -> bool {
        if let Some(fields) = response.error {
            self.report_server_error(&fields);
            return false;
        }

        let mut tables = response.tables;
        if tables.is_empty() {
            let mut empty = DataTable::new();
            empty.complete();
            tables.push(empty);
        }
        for table in tables {
            let rows = table.row_count();
            let index = self.results.push(table);
            self.events.fetched(index, rows);
        }
        for message in response.messages {
            self.events.message(message);
        }

        match response.mismatch {
            Some(e) => {
                self.events.error(e.to_string());
                false
            }
            None => true,
        }
    }

    /// Server errors are user-visible errors, except the one a cancel
    /// request provokes.
    pub(super) fn report_server_error(&self, fields: &ErrorFields) {
        if fields.code == QUERY_CANCELED && self.state.get() == QueryState::Cancelling {
            self.events.message(fields.diagnostic());
        } else {
            self.events.error(fields.diagnostic());
        }
    }

    pub fn execute_async(&mut self, query: &str, params: Option<&[Value]>) {
        if self.is_busy() {
            self.events.error(SqtError::Busy.to_string());
            return;
        }
        self.query = query.to_string();
        self.params = params.map(<[Value]>::to_vec);
        self.results.clear();
        self.partial = None;
        self.retries = 0;
        self.start_timer();
        self.set_query_state(QueryState::Running);
        self.send_pending();
    }

    /// Send the recorded command without blocking.
    pub(super) fn send_pending(&mut self) {
        self.tx_before_send = self.transaction_status();
        let params = self
            .params
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(ParamList::from_values);

        self.phase = AsyncPhase::SendingQuery;
        let sent = match self.handle.as_mut().filter(|h| h.is_ok()) {
            None => Err(SqtError::connection("no connection to the server")),
            Some(handle) => match &params {
                Some(params) => handle.send_query_params(&self.query, params),
                None => handle.send_query(&self.query),
            },
        };

        match sent {
            Ok(()) => self.proceed_flush(),
            Err(e) if e.is_connection_loss() => self.reconnect_or_fail(e),
            Err(e) => {
                self.events.error(e.to_string());
                self.finish_query();
                self.watch(WatchMode::READ);
            }
        }
    }

    /// Push queued output; wait for write readiness while some remains.
    pub(super) fn proceed_flush(&mut self) {
        let flushed = match self.handle.as_mut() {
            Some(handle) => handle.flush(),
            None => Err(SqtError::connection("no connection to the server")),
        };
        match flushed {
            Ok(FlushStatus::Done) => {
                self.phase = AsyncPhase::WaitingForReadableResult;
                self.watch(WatchMode::READ);
            }
            Ok(FlushStatus::Pending) => {
                self.phase = AsyncPhase::Flushing;
                self.watch(WatchMode::READ | WatchMode::WRITE);
            }
            Err(e) => self.fail_hard(e),
        }
    }

    /// The connection broke while sending. Reconnect and resend, unless a
    /// transaction was open or the retry budget is spent.
    fn reconnect_or_fail(&mut self, e: SqtError) {
        let in_transaction = self.tx_before_send.in_transaction()
            || std::mem::take(&mut self.lost_in_transaction);
        self.close_handle();
        self.phase = AsyncPhase::None;

        if in_transaction || self.retries >= RETRY_LIMIT {
            self.events.error(e.to_string());
            self.finish_query();
            return;
        }
        self.retries += 1;
        warn!("connection lost ({}), reconnecting", e);
        self.events.error(e.to_string());
        // the resend happens once the handshake completes
        self.open_async();
    }

    /// Give up on the connection: report, release and end the command.
    pub(super) fn fail_hard(&mut self, e: SqtError) {
        if let Some(partial) = self.partial.take() {
            self.results.with_table_mut(partial.index, DataTable::fail);
        }
        if let Some(handle) = &self.handle {
            self.lost_in_transaction = handle.last_transaction_status().in_transaction();
        }
        self.close_handle();
        self.events.error(e.to_string());
        self.finish_query();
    }
}
