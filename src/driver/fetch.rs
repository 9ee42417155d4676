//! Reading results without blocking.

use tracing::debug;

use super::connection::{PartialTable, PgConnection};
use super::query::{completion_message, decode_row};
use super::{AsyncPhase, FETCH_BATCH_SIZE};
use crate::protocol::BackendMessage;
use crate::table::{DataColumn, DataTable, TableState};
use crate::watcher::WatchMode;

impl PgConnection {
    /// Drain every message the socket has ready and advance the command.
    pub(super) fn fetch(&mut self) {
        let consumed = match self.handle.as_mut() {
            Some(handle) => handle.consume_input(),
            None => return,
        };
        self.drain_side_channel();

        // whatever arrived before a hang-up is still delivered
        if self.phase == AsyncPhase::WaitingForReadableResult {
            self.fetch_results();
        } else {
            self.fetch_idle();
        }
        self.drain_side_channel();

        if let Err(e) = consumed {
            if self.handle.is_some() {
                self.fail_hard(e);
            }
        }
    }

    /// No command in flight: only asynchronous server traffic can be here.
    fn fetch_idle(&mut self) {
        loop {
            let next = match self.handle.as_mut() {
                Some(handle) => handle.next_message(),
                None => return,
            };
            match next {
                Ok(Some(BackendMessage::ErrorResponse(fields))) => {
                    self.events.error(fields.diagnostic());
                }
                Ok(Some(other)) => debug!("unexpected message while idle: {:?}", other),
                Ok(None) => return,
                Err(e) => {
                    self.fail_hard(e);
                    return;
                }
            }
        }
    }

    fn fetch_results(&mut self) {
        let mapper = self.mapper.clone();
        loop {
            let next = match self.handle.as_mut() {
                Some(handle) => handle.next_message(),
                None => return,
            };
            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(e) => {
                    self.fail_hard(e);
                    return;
                }
            };

            match msg {
                BackendMessage::RowDescription(fields) => {
                    let columns: Vec<DataColumn> = fields
                        .iter()
                        .map(|f| DataColumn::from_field(f, mapper.as_ref()))
                        .collect();
                    let mut table = DataTable::new();
                    if let Err(e) = table.define_columns(columns) {
                        self.events.error(e.to_string());
                    }
                    let index = self.results.push(table);
                    self.partial = Some(PartialTable { index, rows: 0 });
                }
                BackendMessage::DataRow(cells) => {
                    let Some(partial) = self.partial.as_mut() else {
                        debug!("data row without row description");
                        continue;
                    };
                    let appended = self.results.with_table_mut(partial.index, |table| {
                        if table.state() == TableState::Failed {
                            return None;
                        }
                        let row = decode_row(mapper.as_ref(), table.columns(), cells);
                        Some(table.append_row(row))
                    });
                    match appended.flatten() {
                        Some(Ok(())) => {
                            partial.rows += 1;
                            if partial.rows % FETCH_BATCH_SIZE == 0 {
                                self.events.fetched(partial.index, partial.rows);
                            }
                        }
                        // reported once; the table stays frozen
                        Some(Err(e)) => self.events.error(e.to_string()),
                        None => {}
                    }
                }
                BackendMessage::CommandComplete(tag) => match self.partial.take() {
                    Some(partial) => {
                        self.results
                            .with_table_mut(partial.index, DataTable::complete);
                        if partial.rows == 0 || partial.rows % FETCH_BATCH_SIZE != 0 {
                            self.events.fetched(partial.index, partial.rows);
                        }
                        self.events
                            .message(format!("{} rows fetched", partial.rows));
                    }
                    None => self.events.message(completion_message(&tag)),
                },
                BackendMessage::EmptyQueryResponse => {
                    self.events.message("empty query");
                }
                BackendMessage::ErrorResponse(fields) => {
                    if let Some(partial) = self.partial.take() {
                        self.results.with_table_mut(partial.index, DataTable::fail);
                        if partial.rows % FETCH_BATCH_SIZE != 0 {
                            self.events.fetched(partial.index, partial.rows);
                        }
                    }
                    self.report_server_error(&fields);
                }
                BackendMessage::ReadyForQuery(status) => {
                    debug!("ready for query ({:?})", status);
                    self.partial = None;
                    self.finish_query();
                    self.watch(WatchMode::READ);
                    return;
                }
                other => debug!("ignoring {:?}", other),
            }
        }
    }

    /// Report queued notices and notifications as transcript messages.
    pub(super) fn drain_side_channel(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        while let Some(notice) = handle.take_notice() {
            self.events.message(notice);
        }
        while let Some(n) = handle.take_notification() {
            self.events.message(format!(
                "notification received\nserver process id: {}\nchannel: {}\npayload: {}",
                n.process_id, n.channel, n.payload
            ));
        }
    }
}
