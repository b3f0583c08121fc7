//! Byte stream underneath a connection.
//!
//! A [`Transport`] is a pair of boxed reader/writer halves plus, for
//! [`Target::Command`], the child process serving the other end. The first
//! I/O error or end of file poisons the transport: every later read or
//! write fails with `NotConnected` without touching the stream again.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::errors::{ConnectError, IoError};

/// How long `close()` waits for a spawned server to exit after its stdin
/// was closed before killing it.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where to find an NBD server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `host:port`
    Tcp(String),

    /// Path of a Unix domain socket
    Unix(PathBuf),

    /// Argument vector of a server to spawn. Its stdin and stdout become
    /// the stream; its stderr is inherited.
    Command(Vec<String>),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "tcp:{address}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Command(argv) => write!(f, "command:{}", argv.join(" ")),
        }
    }
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Transport {
    reader: Reader,
    writer: Writer,
    child: Option<Child>,
    poisoned: bool,
    released: bool,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .field("poisoned", &self.poisoned)
            .field("released", &self.released)
            .finish()
    }
}

impl Transport {
    /// Opens the OS resource named by `target`.
    pub async fn connect(target: &Target) -> Result<Self, ConnectError> {
        let unreachable = |source: io::Error| ConnectError::Unreachable {
            target: target.to_string(),
            source,
        };

        debug!(%target, "opening transport");

        match target {
            Target::Tcp(address) => {
                let stream = TcpStream::connect(address).await.map_err(unreachable)?;
                stream.set_nodelay(true).map_err(unreachable)?;
                Ok(Self::from_stream(stream))
            }
            #[cfg(unix)]
            Target::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unreachable)?;
                Ok(Self::from_stream(stream))
            }
            #[cfg(not(unix))]
            Target::Unix(_) => Err(unreachable(io::Error::new(
                io::ErrorKind::Unsupported,
                "Unix domain sockets are not available on this platform",
            ))),
            Target::Command(argv) => Self::spawn(argv).map_err(unreachable),
        }
    }

    fn spawn(argv: &[String]) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child has no stdout"))?;

        debug!(pid = child.id(), program = %program, "spawned server process");

        let mut transport = Self::from_parts(stdout, stdin);
        transport.child = Some(child);
        Ok(transport)
    }

    /// Wraps an already connected duplex stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }

    /// Wraps two unidirectional halves.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            poisoned: false,
            released: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.poisoned
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, IoError> {
        if self.poisoned {
            return Err(IoError::Closed);
        }
        let mut buffer = vec![0; n];
        if let Err(error) = AsyncReadExt::read_exact(self, &mut buffer).await {
            self.poisoned = true;
            return Err(error.into());
        }
        Ok(buffer)
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        if self.poisoned {
            return Err(IoError::Closed);
        }
        if let Err(error) = AsyncWriteExt::write_all(self, bytes).await {
            self.poisoned = true;
            return Err(error.into());
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), IoError> {
        if self.poisoned {
            return Err(IoError::Closed);
        }
        if let Err(error) = AsyncWriteExt::flush(self).await {
            self.poisoned = true;
            return Err(error.into());
        }
        Ok(())
    }

    /// Marks the stream unusable without releasing it. Used when a reply
    /// was abandoned half way and the read position is unknown.
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Releases the OS resource. Safe to call any number of times; only the
    /// first call does anything.
    ///
    /// For a spawned server the write half is closed first so that the
    /// server sees end of file and can exit on its own.
    pub async fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.poisoned = true;

        if let Err(error) = self.writer.shutdown().await {
            debug!(%error, "shutting down transport writer");
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "server process exited"),
                Ok(Err(error)) => warn!(%error, "waiting for server process"),
                Err(_) => {
                    warn!("server process did not exit, killing it");
                    if let Err(error) = child.kill().await {
                        warn!(%error, "killing server process");
                    }
                }
            }
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poisoned {
            return Poll::Ready(Err(closed_error()));
        }
        let wanted = buf.remaining();
        let filled = buf.filled().len();
        let result = ready!(Pin::new(&mut this.reader).poll_read(cx, buf));
        let eof = result.is_ok() && wanted > 0 && buf.filled().len() == filled;
        if result.is_err() || eof {
            this.poisoned = true;
        }
        Poll::Ready(result)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poisoned {
            return Poll::Ready(Err(closed_error()));
        }
        let result = ready!(Pin::new(&mut this.writer).poll_write(cx, buf));
        if result.is_err() {
            this.poisoned = true;
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poisoned {
            return Poll::Ready(Err(closed_error()));
        }
        let result = ready!(Pin::new(&mut this.writer).poll_flush(cx));
        if result.is_err() {
            this.poisoned = true;
        }
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
