//! Nonblocking protocol handle.
//!
//! `PgHandle` owns one socket and its buffers. Every method either completes
//! without blocking or reports that it needs the socket to become readable
//! or writable; the `*_blocking` variants wait by switching the socket to
//! blocking mode for one read or write.

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use tracing::{debug, info, warn};

use super::socket::Socket;
use crate::conninfo::ConnectOptions;
use crate::error::{SqtError, SqtResult};
use crate::params::ParamList;
use crate::protocol::{
    BackendMessage, FrontendMessage, SCRAM_SHA_256, ScramClient, TransactionStatus,
    frame_len, md5_password,
};
use crate::watcher::SocketRef;

const READ_CHUNK: usize = 16 * 1024;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Health of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// Startup handshake in progress.
    Started,
    Ok,
    Bad,
}

/// What the connect handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    Reading,
    Writing,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Done,
    /// Output remains queued; wait for write readiness.
    Pending,
}

/// Transaction status as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    /// A command was sent and its ReadyForQuery has not arrived yet.
    Active,
    InTrans,
    InError,
    Unknown,
}

impl TxStatus {
    /// True when a retry would silently drop transaction state.
    pub fn in_transaction(self) -> bool {
        matches!(self, TxStatus::InTrans | TxStatus::InError)
    }
}

/// A LISTEN/NOTIFY notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Where and how to send a CancelRequest.
#[derive(Debug, Clone)]
pub struct CancelTarget {
    pub opts: ConnectOptions,
    pub process_id: i32,
    pub secret_key: i32,
}

enum AuthStage {
    None,
    Scram(Box<ScramClient>),
}

pub struct PgHandle {
    opts: ConnectOptions,
    socket: Option<Socket>,
    id: u64,
    read_buf: BytesMut,
    write_buf: BytesMut,
    status: HandleStatus,
    auth: AuthStage,
    tx: TransactionStatus,
    /// Commands sent whose ReadyForQuery is outstanding
    pending_syncs: usize,
    params: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    notices: VecDeque<String>,
    notifications: VecDeque<Notification>,
    error: String,
}

impl PgHandle {
    fn empty(opts: ConnectOptions) -> Self {
        Self {
            opts,
            socket: None,
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            status: HandleStatus::Bad,
            auth: AuthStage::None,
            tx: TransactionStatus::Idle,
            pending_syncs: 0,
            params: HashMap::new(),
            backend_key: None,
            notices: VecDeque::new(),
            notifications: VecDeque::new(),
            error: String::new(),
        }
    }

    /// Start a connection: open the socket and queue the startup packet.
    ///
    /// Never fails outright; check [`PgHandle::status`] and
    /// [`PgHandle::error_message`].
    pub fn connect_start(opts: ConnectOptions) -> Self {
        let mut handle = Self::empty(opts);
        let socket = match Socket::connect(&handle.opts) {
            Ok(socket) => socket,
            Err(e) => {
                handle.error = format!(
                    "could not connect to server at \"{}\": {}",
                    handle.target(),
                    e
                );
                return handle;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            handle.error = format!("could not set socket to nonblocking mode: {}", e);
            return handle;
        }
        handle.socket = Some(socket);

        let startup = FrontendMessage::Startup {
            params: handle.opts.startup_params(),
        };
        match startup.encode_to(&mut handle.write_buf) {
            Ok(()) => handle.status = HandleStatus::Started,
            Err(e) => handle.fail(format!("invalid startup parameter: {}", e)),
        }
        debug!("connection {} started to {}", handle.id, handle.target());
        handle
    }

    /// Connect and wait for the handshake to finish.
    pub fn connect_blocking(opts: ConnectOptions) -> Self {
        let mut handle = Self::connect_start(opts);
        let timeout = handle.opts.connect_timeout;
        loop {
            let waited = match handle.connect_poll() {
                PollingStatus::Ok | PollingStatus::Failed => return handle,
                PollingStatus::Writing => handle.flush_blocking(),
                PollingStatus::Reading => handle.read_blocking_with_timeout(timeout),
            };
            if let Err(e) = waited {
                handle.fail(e.to_string());
                return handle;
            }
        }
    }

    /// Advance the startup handshake as far as possible without blocking.
    pub fn connect_poll(&mut self) -> PollingStatus {
        match self.status {
            HandleStatus::Ok => return PollingStatus::Ok,
            HandleStatus::Bad => return PollingStatus::Failed,
            HandleStatus::Started => {}
        }

        // buffered frames first: a server that rejects us usually says why
        // before it hangs up
        let consumed = self.consume_input();
        loop {
            let msg = match self.next_frame() {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e.to_string());
                    return PollingStatus::Failed;
                }
            };
            match self.handle_startup_message(msg) {
                Ok(true) if consumed.is_ok() => {
                    self.status = HandleStatus::Ok;
                    info!("connection {} established to {}", self.id, self.target());
                    return PollingStatus::Ok;
                }
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    self.fail(e.to_string());
                    return PollingStatus::Failed;
                }
            }
        }
        if let Err(e) = consumed {
            self.fail(e.to_string());
            return PollingStatus::Failed;
        }

        match self.flush() {
            Ok(FlushStatus::Pending) => PollingStatus::Writing,
            Ok(FlushStatus::Done) => PollingStatus::Reading,
            Err(e) => {
                self.fail(e.to_string());
                PollingStatus::Failed
            }
        }
    }

    /// Process one message of the startup phase. `Ok(true)` once the server
    /// is ready for queries.
    fn handle_startup_message(&mut self, msg: BackendMessage) -> SqtResult<bool> {
        match msg {
            BackendMessage::AuthenticationOk => {
                self.auth = AuthStage::None;
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?;
                self.queue(FrontendMessage::PasswordMessage(password))?;
            }
            BackendMessage::AuthenticationMD5Password(salt) => {
                let password = self.password()?;
                let answer = md5_password(&self.opts.user, &password, &salt);
                self.queue(FrontendMessage::PasswordMessage(answer))?;
            }
            BackendMessage::AuthenticationSASL(mechanisms) => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(SqtError::Auth(format!(
                        "none of the server's SASL authentication mechanisms are supported: {}",
                        mechanisms.join(", ")
                    )));
                }
                let client = ScramClient::new(&self.opts.user, &self.password()?);
                let data = client.client_first_message();
                self.auth = AuthStage::Scram(Box::new(client));
                self.queue(FrontendMessage::SASLInitialResponse {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data,
                })?;
            }
            BackendMessage::AuthenticationSASLContinue(server_first) => {
                let AuthStage::Scram(client) = &mut self.auth else {
                    return Err(SqtError::protocol("unexpected SASL continue"));
                };
                let data = client
                    .process_server_first(&server_first)
                    .map_err(SqtError::Auth)?;
                self.queue(FrontendMessage::SASLResponse(data))?;
            }
            BackendMessage::AuthenticationSASLFinal(server_final) => {
                let AuthStage::Scram(client) = &self.auth else {
                    return Err(SqtError::protocol("unexpected SASL final"));
                };
                client
                    .verify_server_final(&server_final)
                    .map_err(SqtError::Auth)?;
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_key = Some((process_id, secret_key));
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.params.insert(name, value);
            }
            BackendMessage::NoticeResponse(fields) => {
                self.notices.push_back(fields.diagnostic());
            }
            BackendMessage::ErrorResponse(fields) => {
                return Err(SqtError::connection(fields.diagnostic()));
            }
            BackendMessage::ReadyForQuery(status) => {
                self.tx = status;
                return Ok(true);
            }
            other => {
                return Err(SqtError::protocol(format!(
                    "unexpected message during startup: {:?}",
                    other
                )));
            }
        }
        Ok(false)
    }

    fn password(&self) -> SqtResult<String> {
        self.opts
            .password
            .clone()
            .ok_or_else(|| SqtError::Auth("no password supplied".to_string()))
    }

    fn queue(&mut self, msg: FrontendMessage) -> SqtResult<()> {
        msg.encode_to(&mut self.write_buf)
            .map_err(|e| SqtError::Protocol(e.to_string()))
    }

    /// Queue a simple query and try to send it.
    pub fn send_query(&mut self, sql: &str) -> SqtResult<()> {
        self.ensure_ok()?;
        self.queue(FrontendMessage::Query(sql.to_string()))?;
        self.sent_command()
    }

    /// Queue an unnamed-statement extended query
    /// (Parse, Bind, Describe, Execute, Sync) and try to send it.
    pub fn send_query_params(&mut self, sql: &str, params: &ParamList) -> SqtResult<()> {
        self.ensure_ok()?;
        let mark = self.write_buf.len();
        let batch = [
            FrontendMessage::Parse {
                name: String::new(),
                query: sql.to_string(),
            },
            FrontendMessage::Bind {
                portal: String::new(),
                statement: String::new(),
                params: params.values().to_vec(),
            },
            FrontendMessage::DescribePortal(String::new()),
            FrontendMessage::Execute {
                portal: String::new(),
                max_rows: 0,
            },
            FrontendMessage::Sync,
        ];
        for msg in batch {
            if let Err(e) = self.queue(msg) {
                self.write_buf.truncate(mark);
                return Err(e);
            }
        }
        self.sent_command()
    }

    fn sent_command(&mut self) -> SqtResult<()> {
        self.pending_syncs += 1;
        self.flush().map(|_| ())
    }

    fn ensure_ok(&self) -> SqtResult<()> {
        if self.status == HandleStatus::Ok && self.socket.is_some() {
            Ok(())
        } else {
            Err(SqtError::connection("no connection to the server"))
        }
    }

    /// Write as much queued output as the socket accepts.
    pub fn flush(&mut self) -> SqtResult<FlushStatus> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(SqtError::connection("no connection to the server"));
        };
        while !self.write_buf.is_empty() {
            match socket.write(&self.write_buf) {
                Ok(0) => {
                    return Err(self.lost("could not send data to server: connection closed"));
                }
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(FlushStatus::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.lost(format!("could not send data to server: {}", e))),
            }
        }
        Ok(FlushStatus::Done)
    }

    /// Send all queued output, blocking as needed.
    pub fn flush_blocking(&mut self) -> SqtResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(SqtError::connection("no connection to the server"));
        };
        let result = socket.blocking(|s| s.write_all(&self.write_buf));
        match result {
            Ok(()) => {
                self.write_buf.clear();
                Ok(())
            }
            Err(e) => Err(self.lost(format!("could not send data to server: {}", e))),
        }
    }

    /// Read everything the socket has without blocking.
    pub fn consume_input(&mut self) -> SqtResult<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(SqtError::connection("no connection to the server"));
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match socket.read(&mut chunk) {
                Ok(0) => {
                    return Err(self.lost("server closed the connection unexpectedly"));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(self.lost(format!("could not receive data from server: {}", e)));
                }
            }
        }
    }

    /// Wait for at least one chunk of input.
    pub fn read_blocking(&mut self) -> SqtResult<()> {
        self.read_blocking_with_timeout(None)
    }

    fn read_blocking_with_timeout(
        &mut self,
        timeout: Option<std::time::Duration>,
    ) -> SqtResult<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(SqtError::connection("no connection to the server"));
        };
        let mut chunk = [0u8; READ_CHUNK];
        let result = socket.blocking(|s| {
            s.set_read_timeout(timeout)?;
            let read = loop {
                match s.read(&mut chunk) {
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };
            s.set_read_timeout(None)?;
            read
        });
        match result {
            Ok(0) => Err(self.lost("server closed the connection unexpectedly")),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(self.lost("timeout expired"))
            }
            Err(e) => Err(self.lost(format!("could not receive data from server: {}", e))),
        }
    }

    /// Decode the next complete frame from the input buffer.
    fn next_frame(&mut self) -> SqtResult<Option<BackendMessage>> {
        let Some(len) = frame_len(&self.read_buf) else {
            return Ok(None);
        };
        let frame = self.read_buf.split_to(len);
        match BackendMessage::decode(&frame) {
            Ok((msg, _)) => Ok(Some(msg)),
            Err(e) => Err(self.lost(format!("protocol error: {}", e))),
        }
    }

    /// Next buffered message of a command response.
    ///
    /// Notices, notifications and parameter changes are absorbed into the
    /// handle's queues; COPY traffic the driver cannot serve is refused.
    pub fn next_message(&mut self) -> SqtResult<Option<BackendMessage>> {
        loop {
            let Some(msg) = self.next_frame()? else {
                return Ok(None);
            };
            match msg {
                BackendMessage::NoticeResponse(fields) => {
                    self.notices.push_back(fields.diagnostic());
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    self.notifications.push_back(Notification {
                        process_id,
                        channel,
                        payload,
                    });
                }
                BackendMessage::ParameterStatus { name, value } => {
                    debug!("parameter {} = {}", name, value);
                    self.params.insert(name, value);
                }
                BackendMessage::CopyInResponse => {
                    self.queue(FrontendMessage::CopyFail(
                        "COPY FROM STDIN is not supported".to_string(),
                    ))?;
                    self.flush()?;
                }
                BackendMessage::CopyOutResponse
                | BackendMessage::CopyData(_)
                | BackendMessage::CopyDone => {}
                BackendMessage::ReadyForQuery(status) => {
                    self.tx = status;
                    self.pending_syncs = self.pending_syncs.saturating_sub(1);
                    return Ok(Some(BackendMessage::ReadyForQuery(status)));
                }
                other => return Ok(Some(other)),
            }
        }
    }

    fn lost(&mut self, message: impl Into<String>) -> SqtError {
        let message = message.into();
        warn!("connection {}: {}", self.id, message);
        self.fail(message.clone());
        SqtError::Connection(message)
    }

    fn fail(&mut self, message: String) {
        self.status = HandleStatus::Bad;
        self.error = message;
    }

    pub fn status(&self) -> HandleStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == HandleStatus::Ok
    }

    pub fn transaction_status(&self) -> TxStatus {
        if self.status != HandleStatus::Ok {
            return TxStatus::Unknown;
        }
        if self.pending_syncs > 0 {
            return TxStatus::Active;
        }
        self.last_transaction_status()
    }

    /// Transaction status from the last ReadyForQuery, even after the link failed.
    pub fn last_transaction_status(&self) -> TxStatus {
        match self.tx {
            TransactionStatus::Idle => TxStatus::Idle,
            TransactionStatus::InBlock => TxStatus::InTrans,
            TransactionStatus::Failed => TxStatus::InError,
        }
    }

    pub fn error_message(&self) -> &str {
        &self.error
    }

    /// Server parameter reported through ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.opts
    }

    pub fn target(&self) -> String {
        self.opts
            .socket_path()
            .unwrap_or_else(|| self.opts.tcp_address())
    }

    pub fn take_notice(&mut self) -> Option<String> {
        self.notices.pop_front()
    }

    pub fn take_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    pub fn cancel_target(&self) -> Option<CancelTarget> {
        self.backend_key
            .map(|(process_id, secret_key)| CancelTarget {
                opts: self.opts.clone(),
                process_id,
                secret_key,
            })
    }

    /// The socket and its id, for the watcher.
    pub fn socket_ref(&self) -> Option<SocketRef<'_>> {
        self.socket.as_ref().map(|socket| SocketRef {
            id: self.id,
            socket,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PgHandle {
    fn drop(&mut self) {
        // Best-effort Terminate; the socket is nonblocking so this never waits
        if let Some(socket) = self.socket.as_mut() {
            if self.status == HandleStatus::Ok {
                let terminate: [u8; 5] = [b'X', 0, 0, 0, 4];
                let _ = socket.write(&terminate);
            }
            socket.shutdown();
        }
    }
}
