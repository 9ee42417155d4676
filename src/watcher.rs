//! Socket readiness watching.
//!
//! A connection tells its [`SocketWatcher`] which readiness it currently
//! cares about; whoever drives the connection waits on the matching
//! readiness and calls `ready_read_socket` / `ready_write_socket`.
//!
//! Sockets are identified by a per-connection id rather than the descriptor
//! number, so a reconnect that happens to reuse the same descriptor is still
//! seen as a new socket.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::driver::socket::Socket;

/// Readiness a connection wants to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchMode(u8);

impl WatchMode {
    pub const NONE: WatchMode = WatchMode(0);
    pub const READ: WatchMode = WatchMode(1);
    pub const WRITE: WatchMode = WatchMode(2);

    pub fn contains(self, other: WatchMode) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        WatchMode(bits & 0b11)
    }
}

impl BitOr for WatchMode {
    type Output = WatchMode;

    fn bitor(self, rhs: WatchMode) -> WatchMode {
        WatchMode(self.0 | rhs.0)
    }
}

/// A socket plus the id of the connection attempt that opened it.
#[derive(Debug, Clone, Copy)]
pub struct SocketRef<'a> {
    pub id: u64,
    pub socket: &'a Socket,
}

/// Arranges readiness notifications for one connection.
pub trait SocketWatcher: Send + Sync {
    /// Watch `socket` for `mode`. `None` (or [`WatchMode::NONE`]) stops
    /// watching; a socket with a different id replaces the previous one.
    fn watch(&self, socket: Option<SocketRef<'_>>, mode: WatchMode);

    fn mode(&self) -> WatchMode;
}

/// Records the requested mode without watching anything. Used by callers
/// that only ever run blocking commands.
#[derive(Debug, Default)]
pub struct NullWatcher {
    mode: AtomicU8,
    socket_id: AtomicU64,
}

impl NullWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the socket last watched, 0 when none.
    pub fn socket_id(&self) -> u64 {
        self.socket_id.load(Ordering::Acquire)
    }
}

impl SocketWatcher for NullWatcher {
    fn watch(&self, socket: Option<SocketRef<'_>>, mode: WatchMode) {
        let (id, mode) = match socket {
            Some(s) => (s.id, mode),
            None => (0, WatchMode::NONE),
        };
        self.socket_id.store(id, Ordering::Release);
        self.mode.store(mode.bits(), Ordering::Release);
    }

    fn mode(&self) -> WatchMode {
        WatchMode::from_bits(self.mode.load(Ordering::Acquire))
    }
}

#[cfg(unix)]
pub use reactor::{Readiness, ReadinessSource, ReactorWatcher};

#[cfg(unix)]
mod reactor {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use tokio::io::unix::AsyncFd;
    use tokio::runtime::Handle;
    use tokio::sync::Notify;
    use tracing::{debug, warn};

    use super::{Socket, SocketRef, SocketWatcher, WatchMode};

    /// Which readiness fired.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Readiness {
        Readable,
        Writable,
    }

    #[derive(Default)]
    struct State {
        id: Option<u64>,
        fd: Option<Arc<AsyncFd<Socket>>>,
        mode: WatchMode,
    }

    #[derive(Default)]
    struct Shared {
        state: Mutex<State>,
        changed: Notify,
    }

    impl Shared {
        fn lock(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Watcher backed by the tokio reactor.
    ///
    /// The socket descriptor is duplicated and registered with the runtime
    /// captured at construction; the paired [`ReadinessSource`] yields the
    /// readiness events.
    pub struct ReactorWatcher {
        shared: Arc<Shared>,
        runtime: Handle,
    }

    /// Receiving half of a [`ReactorWatcher`].
    pub struct ReadinessSource {
        shared: Arc<Shared>,
    }

    impl ReactorWatcher {
        /// Create a watcher on the current runtime.
        ///
        /// Panics if called outside a tokio runtime.
        pub fn new() -> (Self, ReadinessSource) {
            Self::with_handle(Handle::current())
        }

        pub fn with_handle(runtime: Handle) -> (Self, ReadinessSource) {
            let shared = Arc::new(Shared::default());
            (
                Self {
                    shared: shared.clone(),
                    runtime,
                },
                ReadinessSource { shared },
            )
        }

        fn register(&self, socket: &Socket) -> std::io::Result<Arc<AsyncFd<Socket>>> {
            let _guard = self.runtime.enter();
            let clone = socket.try_clone()?;
            // SAFETY: the clone owns its descriptor and keeps it open until
            // the AsyncFd drops it.
            let fd = unsafe { AsyncFd::register(clone) }?;
            Ok(Arc::new(fd))
        }
    }

    impl SocketWatcher for ReactorWatcher {
        fn watch(&self, socket: Option<SocketRef<'_>>, mode: WatchMode) {
            let mut state = self.shared.lock();
            match socket {
                None => {
                    state.id = None;
                    state.fd = None;
                    state.mode = WatchMode::NONE;
                }
                Some(s) => {
                    if state.id != Some(s.id) {
                        // drop the old registration before taking the new one
                        state.fd = None;
                        state.id = Some(s.id);
                        match self.register(s.socket) {
                            Ok(fd) => state.fd = Some(fd),
                            Err(e) => warn!("cannot watch socket {}: {}", s.id, e),
                        }
                    }
                    state.mode = if state.fd.is_some() {
                        mode
                    } else {
                        WatchMode::NONE
                    };
                }
            }
            debug!("watch socket {:?} mode {:?}", state.id, state.mode);
            drop(state);
            self.shared.changed.notify_one();
        }

        fn mode(&self) -> WatchMode {
            self.shared.lock().mode
        }
    }

    impl ReadinessSource {
        /// Wait until the watched socket is ready for the watched mode.
        ///
        /// Readiness is cleared before returning, so the caller must drain
        /// the socket until it would block.
        pub async fn next(&self) -> Readiness {
            loop {
                let changed = self.shared.changed.notified();
                let (fd, mode) = {
                    let state = self.shared.lock();
                    (state.fd.clone(), state.mode)
                };

                let Some(fd) = fd.filter(|_| !mode.is_none()) else {
                    changed.await;
                    continue;
                };

                tokio::select! {
                    ready = fd.readable(), if mode.contains(WatchMode::READ) => {
                        if let Ok(mut guard) = ready {
                            guard.clear_ready();
                        }
                        return Readiness::Readable;
                    }
                    ready = fd.writable(), if mode.contains(WatchMode::WRITE) => {
                        if let Ok(mut guard) = ready {
                            guard.clear_ready();
                        }
                        return Readiness::Writable;
                    }
                    _ = changed => {}
                }
            }
        }

        /// Mode currently requested by the connection.
        pub fn mode(&self) -> WatchMode {
            self.shared.lock().mode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_mode_flags() {
        let both = WatchMode::READ | WatchMode::WRITE;
        assert!(both.contains(WatchMode::READ));
        assert!(both.contains(WatchMode::WRITE));
        assert!(!WatchMode::READ.contains(WatchMode::WRITE));
        assert!(!WatchMode::NONE.contains(WatchMode::NONE));
        assert!(WatchMode::NONE.is_none());
        assert_eq!(WatchMode::from_bits(both.bits()), both);
    }

    #[test]
    fn test_null_watcher_forgets_socket() {
        let watcher = NullWatcher::new();
        watcher.watch(None, WatchMode::READ);
        assert_eq!(watcher.mode(), WatchMode::NONE);
        assert_eq!(watcher.socket_id(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reactor_reports_readable() {
        use std::io::Write;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        let socket = Socket::Tcp(client);

        let (watcher, source) = ReactorWatcher::new();
        watcher.watch(
            Some(SocketRef {
                id: 1,
                socket: &socket,
            }),
            WatchMode::WRITE,
        );
        assert_eq!(source.next().await, Readiness::Writable);

        watcher.watch(
            Some(SocketRef {
                id: 1,
                socket: &socket,
            }),
            WatchMode::READ,
        );
        server.write_all(b"x").unwrap();
        assert_eq!(source.next().await, Readiness::Readable);

        watcher.watch(None, WatchMode::READ);
        assert_eq!(source.mode(), WatchMode::NONE);
    }
}
