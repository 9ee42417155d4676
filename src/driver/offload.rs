//! Running async commands on a worker task.
//!
//! A [`Session`] owns a connection while it is idle. `execute_async` sends
//! the connection and the command to a worker task, which drives the
//! readiness callbacks until the command is over and sends the connection
//! back. Results and events are shared, so the caller can display rows while
//! the worker is still fetching.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{AsyncPhase, CancelHandle, DbConnection, QueryState, format_elapsed};
use crate::error::SqtError;
use crate::events::{ConnectionEvent, EventSink};
use crate::table::ResultSets;
use crate::types::Value;
use crate::watcher::{Readiness, ReactorWatcher, ReadinessSource};

type Connection = Box<dyn DbConnection>;

struct WorkerRequest {
    conn: Connection,
    query: String,
    params: Option<Vec<Value>>,
    reply: oneshot::Sender<Connection>,
}

enum Slot {
    Idle(Connection),
    Busy(oneshot::Receiver<Connection>),
    /// The worker dropped the connection.
    Gone,
}

pub struct Session {
    slot: Slot,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    events: EventSink,
    results: ResultSets,
    cancel: CancelHandle,
    source: Arc<ReadinessSource>,
    worker: JoinHandle<()>,
}

impl Session {
    /// Take over `conn` and start its worker on the current runtime.
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(mut conn: Connection) -> Self {
        let (watcher, source) = ReactorWatcher::new();
        conn.set_watcher(Arc::new(watcher));
        let source = Arc::new(source);

        let (requests, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx, source.clone()));
        Self {
            events: conn.events(),
            results: conn.results(),
            cancel: conn.cancel_handle(),
            slot: Slot::Idle(conn),
            requests,
            source,
            worker,
        }
    }

    /// The connection, unless a worker holds it.
    pub fn connection(&self) -> Option<&dyn DbConnection> {
        match &self.slot {
            Slot::Idle(conn) => Some(conn.as_ref()),
            _ => None,
        }
    }

    pub fn connection_mut(&mut self) -> Option<&mut (dyn DbConnection + 'static)> {
        match &mut self.slot {
            Slot::Idle(conn) => Some(conn.as_mut()),
            _ => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.slot, Slot::Busy(_))
    }

    fn unavailable(&self) -> bool {
        let message = match self.slot {
            Slot::Idle(_) => return false,
            Slot::Busy(_) => SqtError::Busy.to_string(),
            Slot::Gone => "connection is no longer available".to_string(),
        };
        self.events.error(message);
        true
    }

    /// Blocking connect on the caller's thread.
    pub fn open(&mut self) -> bool {
        if self.unavailable() {
            return false;
        }
        self.connection_mut().is_some_and(|conn| conn.open())
    }

    /// Blocking execute on the caller's thread.
    pub fn execute(&mut self, query: &str, params: &[Value], row_limit: Option<u32>) -> bool {
        if self.unavailable() {
            return false;
        }
        self.connection_mut()
            .is_some_and(|conn| conn.execute(query, params, row_limit))
    }

    /// Hand the connection to the worker and run `query` there.
    pub fn execute_async(&mut self, query: &str, params: Option<Vec<Value>>) -> bool {
        if self.unavailable() {
            return false;
        }
        let Slot::Idle(conn) = std::mem::replace(&mut self.slot, Slot::Gone) else {
            return false;
        };

        let (reply, rx) = oneshot::channel();
        let request = WorkerRequest {
            conn,
            query: query.to_string(),
            params,
            reply,
        };
        match self.requests.send(request) {
            Ok(()) => {
                self.slot = Slot::Busy(rx);
                true
            }
            Err(mpsc::error::SendError(request)) => {
                self.slot = Slot::Idle(request.conn);
                self.events.error("query worker is not running");
                false
            }
        }
    }

    /// Take the connection back if the worker is done with it.
    pub fn try_reclaim(&mut self) -> bool {
        let Slot::Busy(rx) = &mut self.slot else {
            return matches!(self.slot, Slot::Idle(_));
        };
        match rx.try_recv() {
            Ok(conn) => {
                self.reclaimed(conn);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.lost();
                false
            }
        }
    }

    /// Wait for the running command to finish. True once the connection is
    /// back in the session. Safe to drop mid-wait.
    pub async fn wait(&mut self) -> bool {
        let received = match &mut self.slot {
            Slot::Busy(rx) => rx.await,
            Slot::Idle(_) => return true,
            Slot::Gone => return false,
        };
        match received {
            Ok(conn) => {
                self.reclaimed(conn);
                true
            }
            Err(_) => {
                self.lost();
                false
            }
        }
    }

    fn reclaimed(&mut self, conn: Connection) {
        self.events
            .message(format!("done in {}", format_elapsed(conn.elapsed())));
        self.events
            .emit(ConnectionEvent::ContextChanged(conn.context()));
        self.slot = Slot::Idle(conn);
    }

    fn lost(&mut self) {
        self.slot = Slot::Gone;
        self.events.error("query worker stopped unexpectedly");
    }

    /// Cancel the command, wherever it runs.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Serve readiness of an idle connection once (notifications, server
    /// errors). Returns false when there is nothing to wait for.
    pub async fn process_idle(&mut self) -> bool {
        let Slot::Idle(conn) = &mut self.slot else {
            return false;
        };
        if self.source.mode().is_none() {
            return false;
        }
        match self.source.next().await {
            Readiness::Readable => conn.ready_read_socket(),
            Readiness::Writable => conn.ready_write_socket(),
        }
        true
    }

    /// Close the connection, cancelling and waiting out a running command.
    pub async fn close(&mut self) {
        if self.is_busy() {
            self.cancel();
            self.wait().await;
        }
        if let Some(conn) = self.connection_mut() {
            conn.close();
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn results(&self) -> ResultSets {
        self.results.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    source: Arc<ReadinessSource>,
) {
    while let Some(request) = requests.recv().await {
        let WorkerRequest {
            mut conn,
            query,
            params,
            reply,
        } = request;

        conn.execute_async(&query, params.as_deref());
        drive(conn.as_mut(), &source).await;

        if reply.send(conn).is_err() {
            debug!("session gone, dropping connection");
        }
    }
}

/// Dispatch readiness until the command is over.
async fn drive(conn: &mut dyn DbConnection, source: &ReadinessSource) {
    while conn.query_state() != QueryState::Inactive || conn.async_phase() != AsyncPhase::None {
        if source.mode().is_none() {
            // nothing would ever wake us
            warn!("command in flight without a watched socket, closing");
            conn.close();
            break;
        }
        match source.next().await {
            Readiness::Readable => conn.ready_read_socket(),
            Readiness::Writable => conn.ready_write_socket(),
        }
    }
}
