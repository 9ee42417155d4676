//! Socket abstraction for TCP and Unix-domain connections.
//!
//! The driver keeps sockets in nonblocking mode and only switches to
//! blocking mode for the duration of a single synchronous read or write.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::conninfo::ConnectOptions;

/// A PostgreSQL connection socket (TCP or Unix).
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    /// Unix domain socket connection
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    /// Open a blocking connection to the server named by `opts`.
    pub fn connect(opts: &ConnectOptions) -> io::Result<Self> {
        if let Some(path) = opts.socket_path() {
            return Self::connect_unix(&path);
        }

        let addr = opts.tcp_address();
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            let attempt = match opts.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&sock_addr, timeout),
                None => TcpStream::connect(sock_addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Socket::Tcp(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not translate host name \"{}\" to address", opts.host),
            )
        }))
    }

    #[cfg(unix)]
    fn connect_unix(path: &str) -> io::Result<Self> {
        UnixStream::connect(path).map(Socket::Unix)
    }

    #[cfg(not(unix))]
    fn connect_unix(_path: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix-domain sockets are not supported on this platform",
        ))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Socket::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    /// Duplicate the descriptor. Both handles refer to the same socket.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Socket::Tcp(s) => s.try_clone().map(Socket::Tcp),
            #[cfg(unix)]
            Socket::Unix(s) => s.try_clone().map(Socket::Unix),
        }
    }

    /// Shut the socket down for every holder of a duplicated descriptor.
    pub fn shutdown(&self) {
        let _ = match self {
            Socket::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Socket::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }

    /// Run `f` with the socket temporarily in blocking mode.
    pub fn blocking<T>(&mut self, f: impl FnOnce(&mut Self) -> io::Result<T>) -> io::Result<T> {
        self.set_nonblocking(false)?;
        let result = f(self);
        self.set_nonblocking(true)?;
        result
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Socket::Unix(s) => s.flush(),
        }
    }
}

#[cfg(unix)]
impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_tcp_and_blocking_toggle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let opts = ConnectOptions::parse(&format!("host=127.0.0.1 port={}", port)).unwrap();

        let mut socket = Socket::connect(&opts).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        socket.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 4];
        let err = socket.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        server.write_all(b"ping").unwrap();
        let n = socket.blocking(|s| s.read(&mut buf)).unwrap();
        assert_eq!(&buf[..n], &b"ping"[..n]);
        assert!(n > 0);
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let opts = ConnectOptions::parse(&format!("host=127.0.0.1 port={}", port)).unwrap();
        assert!(Socket::connect(&opts).is_err());
    }
}
