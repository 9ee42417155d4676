//! Query cancellation.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use super::handle::CancelTarget;
use super::socket::Socket;
use super::{QueryState, QueryStateCell};
use crate::events::{ConnectionEvent, EventSink};
use crate::protocol::encode_cancel_request;

/// How long to wait for the server to close the cancel socket.
const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Cancels the command of one connection from any thread.
///
/// The handle shares the connection's query state, so it keeps working
/// while a worker owns the connection itself.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    state: QueryStateCell,
    target: Arc<Mutex<Option<CancelTarget>>>,
    events: EventSink,
}

impl CancelHandle {
    pub(crate) fn new(
        state: QueryStateCell,
        target: Arc<Mutex<Option<CancelTarget>>>,
        events: EventSink,
    ) -> Self {
        Self {
            state,
            target,
            events,
        }
    }

    /// Ask the server to cancel the running command.
    ///
    /// Returns false when nothing was running or the request could not be
    /// delivered. The command itself ends through the normal result path.
    pub fn cancel(&self) -> bool {
        if !self
            .state
            .transition(QueryState::Running, QueryState::Cancelling)
        {
            debug!("cancel ignored: no command running");
            return false;
        }
        self.events
            .emit(ConnectionEvent::QueryStateChanged(QueryState::Cancelling));
        self.events.message("cancelling...");

        let target = self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(target) = target else {
            self.events
                .error("could not send cancel request: no backend key");
            return false;
        };
        match send_cancel_request(&target) {
            Ok(()) => {
                info!("cancel request sent for backend {}", target.process_id);
                true
            }
            Err(e) => {
                self.events
                    .error(format!("could not send cancel request: {}", e));
                false
            }
        }
    }
}

/// Send a CancelRequest on a fresh connection to the same server.
pub fn send_cancel_request(target: &CancelTarget) -> io::Result<()> {
    let mut socket = Socket::connect(&target.opts)?;
    socket.set_nonblocking(false)?;
    socket.write_all(&encode_cancel_request(
        target.process_id,
        target.secret_key,
    ))?;

    // The server closes the socket once the request is handled
    socket.set_read_timeout(Some(CANCEL_ACK_TIMEOUT))?;
    let mut buf = [0u8; 64];
    loop {
        match socket.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conninfo::ConnectOptions;
    use std::net::TcpListener;
    use std::thread;

    fn target_for(port: u16) -> CancelTarget {
        CancelTarget {
            opts: ConnectOptions::parse(&format!("host=127.0.0.1 port={}", port)).unwrap(),
            process_id: 4242,
            secret_key: 77,
        }
    }

    #[test]
    fn test_cancel_without_running_command() {
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let handle = CancelHandle::new(
            QueryStateCell::default(),
            Arc::new(Mutex::new(None)),
            events,
        );
        assert!(!handle.cancel());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_sends_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let state = QueryStateCell::default();
        state.swap(QueryState::Running);
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let handle = CancelHandle::new(
            state.clone(),
            Arc::new(Mutex::new(Some(target_for(port)))),
            events,
        );

        assert!(handle.cancel());
        assert_eq!(state.get(), QueryState::Cancelling);
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::QueryStateChanged(QueryState::Cancelling)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectionEvent::Message("cancelling...".into())
        );

        let request = server.join().unwrap();
        assert_eq!(request, encode_cancel_request(4242, 77));
    }
}
