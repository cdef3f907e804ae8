//! Listening sockets for FastCGI: Unix domain sockets or TCP.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tracing::{info, warn};

use crate::connection::{Connection, FcgiConnection};

/// Listen backlog for TCP sockets.
pub const LISTEN_BACKLOG: u32 = 1024;

/// Source of accepted connections.
pub trait Listener: Send + 'static {
    type Conn: Connection;

    /// Wait for and accept a single connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Where to listen: `host:port` or `:port` selects TCP, anything else is a
/// Unix socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for ListenAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(port) = s.strip_prefix(':') {
            return format!("0.0.0.0:{port}").parse().map(Self::Tcp);
        }
        if s.contains('/') || !s.contains(':') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        s.parse().map(Self::Tcp)
    }
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Bound FastCGI listening socket. A Unix socket file is removed again
/// when the listener is dropped.
pub struct FcgiListener {
    inner: ListenerKind,
    max_conns: usize,
}

enum ListenerKind {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl FcgiListener {
    /// Bind a listening socket.
    ///
    /// An existing Unix socket file is replaced only when nothing answers on
    /// it. A live socket fails with `AddrInUse`, and any other kind of file
    /// fails with `AlreadyExists`.
    pub fn bind(address: &ListenAddress) -> io::Result<Self> {
        let inner = match address {
            ListenAddress::Unix(path) => {
                remove_stale_socket(path)?;
                ListenerKind::Unix(UnixListener::bind(path)?, path.clone())
            }
            ListenAddress::Tcp(addr) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(*addr)?;
                ListenerKind::Tcp(socket.listen(LISTEN_BACKLOG)?)
            }
        };
        info!("FastCGI listening on {address}");
        Ok(Self {
            inner,
            max_conns: 1,
        })
    }

    /// Capacity advertised to the web server through `FCGI_MAX_CONNS`.
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<ListenAddress> {
        match &self.inner {
            ListenerKind::Unix(l, _) => {
                let addr = l.local_addr()?;
                let path = addr
                    .as_pathname()
                    .map(PathBuf::from)
                    .unwrap_or_default();
                Ok(ListenAddress::Unix(path))
            }
            ListenerKind::Tcp(l) => Ok(ListenAddress::Tcp(l.local_addr()?)),
        }
    }
}

impl Listener for FcgiListener {
    type Conn = FcgiConnection<FcgiStream>;

    async fn accept(&mut self) -> io::Result<Self::Conn> {
        let stream = match &self.inner {
            ListenerKind::Unix(l, _) => FcgiStream::Unix(l.accept().await?.0),
            ListenerKind::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                FcgiStream::Tcp(stream)
            }
        };
        Ok(FcgiConnection::new(stream).with_max_conns(self.max_conns))
    }
}

impl Drop for FcgiListener {
    fn drop(&mut self) {
        let ListenerKind::Unix(_, path) = &self.inner else {
            return;
        };
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket file {}: {e}", path.display()),
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by another process", path.display()),
        )),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            info!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}

/// Accepted byte stream.
pub enum FcgiStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for FcgiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FcgiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
