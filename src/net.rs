//! Raw socket transport.
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::connection::Config;
#[cfg(not(unix))]
use crate::connection::ParseError;
use crate::error::Result;

/// The raw octet stream under a connection.
///
/// TCP with Nagle disabled, or a unix domain socket when the config names a
/// path. Both are full duplex; framing and buffering live in the connection.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    /// Open the transport the config points at.
    pub(crate) async fn connect(config: &Config) -> Result<Socket> {
        match &config.socket {
            Some(path) => Self::connect_path(path).await,
            None => Self::connect_tcp(&config.host, config.port).await,
        }
    }

    pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<Socket> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Socket::Tcp(stream))
    }

    pub(crate) async fn connect_path(path: &str) -> Result<Socket> {
        #[cfg(unix)]
        {
            Ok(Socket::Unix(UnixStream::connect(path).await?))
        }

        #[cfg(not(unix))]
        {
            let _ = path;
            Err(ParseError {
                reason: "unix domain sockets are not available on this platform".into(),
            }
            .into())
        }
    }
}

/// Forward an io trait method to whichever stream is inside.
macro_rules! with_stream {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match Pin::into_inner($self) {
            Socket::Tcp(stream) => Pin::new(stream).$method($($arg),*),
            #[cfg(unix)]
            Socket::Unix(stream) => Pin::new(stream).$method($($arg),*),
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        with_stream!(self, poll_read(cx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        with_stream!(self, poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_stream!(self, poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        with_stream!(self, poll_shutdown(cx))
    }
}
