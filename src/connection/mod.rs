//! Postgres connection: buffered transport, state machine, caches.
pub mod cancel;
pub mod config;
mod startup;

pub use cancel::CancelToken;
pub use config::{Config, ParseError, QueryMode};
pub use startup::{md5_password, AuthError, AuthHandler};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::net::Socket;
use crate::phase::{Phase, TransactionStatus};
use crate::protocol::{backend, frontend, BackendProtocol, DatabaseError, FrontendProtocol, ProtocolError};
use crate::statement::{StatementCache, StatementName};
use crate::types::TypeRegistry;

const DEFAULT_BUF_CAPACITY: usize = 1024;

type NoticeHandler = Box<dyn FnMut(DatabaseError) + Send>;

/// Postgres connection.
///
/// A connection is a single-threaded serial resource: responses correspond to
/// requests in strict FIFO order, and every operation holds `&mut self` for
/// its whole duration. The connection caches prepared statements
/// transparently, tracks the backend transaction status, delivers notices to
/// an optional observer, and recovers to the next `ReadyForQuery` after
/// statement-level errors.
pub struct Connection<S = Socket> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,

    pub(crate) phase: Phase,
    txn_status: TransactionStatus,
    params: HashMap<String, String>,
    key: Option<backend::BackendKeyData>,

    pub(crate) cache: StatementCache,
    pub(crate) pending_closes: Vec<StatementName>,
    /// `ReadyForQuery` messages owed to the wire before new work may start.
    pending_ready: usize,
    /// Whether the in-flight extended sequence still owes the server a Sync,
    /// i.e. it was flushed with `Flush` for portal rounds.
    pub(crate) needs_sync_on_error: bool,

    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) config: Config,
    notice: Option<NoticeHandler>,
}

impl Connection<Socket> {
    /// Connect and perform the startup exchange, with config from a url.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect and perform the startup exchange, with config from the
    /// environment.
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect and perform the startup exchange.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let socket = Socket::connect(&config).await?;
        Self::handshake(socket, config).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Perform the startup exchange over an already-established transport.
    ///
    /// The transport only needs to be a full-duplex octet stream; TLS, if
    /// any, is established by the caller beforehand.
    pub async fn handshake(io: S, config: Config) -> Result<Self> {
        // the effective promotion threshold follows the query-mode knob:
        // cache-everything names on first use, for-prepared only through
        // the explicit prepare call
        let threshold = match config.prefer_query_mode {
            QueryMode::ExtendedCacheEverything => 1,
            QueryMode::ExtendedForPrepared => 0,
            _ => config.prepare_threshold,
        };

        let mut me = Self {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            phase: Phase::Startup,
            txn_status: TransactionStatus::Idle,
            params: HashMap::new(),
            key: None,
            cache: StatementCache::new(config.statement_cache_capacity, threshold),
            pending_closes: Vec::new(),
            pending_ready: 0,
            needs_sync_on_error: false,
            registry: Arc::new(TypeRegistry::new()),
            config,
            notice: None,
        };

        startup::startup(&mut me)
            .await
            .map_err(|err| err.with_context("startup"))?;

        Ok(me)
    }

    /// Gracefully close the connection.
    pub async fn close(mut self) -> Result<()> {
        if self.phase != Phase::Closed {
            self.send(frontend::Terminate);
            self.flush().await?;
            self.phase = Phase::Closed;
        }
        self.io.shutdown().await?;
        Ok(())
    }

    /// Write all buffered messages to the transport.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let n = match self.io.write_buf(&mut self.write_buf).await {
                Ok(n) => n,
                Err(err) => {
                    self.phase = Phase::Closed;
                    return Err(err.into());
                }
            };
            if n == 0 {
                self.phase = Phase::Closed;
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
        }
        if let Err(err) = self.io.flush().await {
            self.phase = Phase::Closed;
            return Err(err.into());
        }
        Ok(())
    }

    /// Read one framed message: 1-byte kind, 4-byte self-inclusive length,
    /// payload. Enforces the configured maximum message size.
    pub(crate) async fn recv_raw(&mut self) -> Result<(u8, Bytes)> {
        loop {
            if self.read_buf.len() >= 5 {
                let mut header = &self.read_buf[..5];
                let msgtype = header.get_u8();
                let len = header.get_i32() as i64;

                if len < 4 || len as usize > self.config.max_message_size {
                    self.phase = Phase::Closed;
                    return Err(ProtocolError::message_size(len, self.config.max_message_size).into());
                }

                let total = 1 + len as usize;
                if self.read_buf.len() >= total {
                    self.read_buf.advance(5);
                    let body = self.read_buf.split_to(len as usize - 4).freeze();
                    log::trace!("(B) {}", backend::BackendMessage::message_name(msgtype));
                    return Ok((msgtype, body));
                }
                self.read_buf.reserve(total - self.read_buf.len());
            } else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            }

            match self.io.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    self.phase = Phase::Closed;
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                }
                Ok(_) => {}
                Err(err) => {
                    self.phase = Phase::Closed;
                    return Err(err.into());
                }
            }
        }
    }

    /// Receive the expected message.
    ///
    /// `NoticeResponse` goes to the observer, `ParameterStatus` updates the
    /// session parameter map; neither is ever returned. `ErrorResponse`
    /// arranges recovery to the next `ReadyForQuery` and comes back as
    /// [`Err`]. A passing `ReadyForQuery` updates the transaction status.
    pub(crate) async fn recv<B: BackendProtocol>(&mut self) -> Result<B> {
        loop {
            let (msgtype, body) = self.recv_raw().await?;
            match msgtype {
                backend::ErrorResponse::MSGTYPE => {
                    let err = DatabaseError::parse(body);
                    log::error!("{err}");
                    match self.phase {
                        Phase::Startup | Phase::Authenticating | Phase::Closed => {
                            self.phase = Phase::Closed;
                        }
                        Phase::ExtendedQuery if self.needs_sync_on_error => {
                            // the sequence was flushed without its Sync;
                            // provide the synchronization point now
                            self.send(frontend::Sync);
                            self.flush().await?;
                            self.needs_sync_on_error = false;
                            self.pending_ready += 1;
                            self.phase = Phase::PendingSync;
                        }
                        _ => {
                            self.pending_ready += 1;
                            self.phase = Phase::PendingSync;
                        }
                    }
                    return Err(err.into());
                }
                backend::NoticeResponse::MSGTYPE => {
                    let notice = DatabaseError::parse(body);
                    log::warn!("{notice}");
                    if let Some(handler) = &mut self.notice {
                        handler(notice);
                    }
                }
                backend::ParameterStatus::MSGTYPE => {
                    let status = backend::ParameterStatus::decode(msgtype, body)?;
                    log::trace!("parameter status {} = {}", status.name, status.value);
                    self.params
                        .insert(status.name.as_str().into(), status.value.as_str().into());
                }
                _ => {
                    if msgtype == backend::ReadyForQuery::MSGTYPE {
                        let rfq = backend::ReadyForQuery::decode(msgtype, body.clone())
                            .inspect_err(|_| self.phase = Phase::Closed)?;
                        self.txn_status = rfq.status;
                    }
                    return B::decode(msgtype, body).map_err(|err| {
                        self.phase = Phase::Closed;
                        err.into()
                    });
                }
            }
        }
    }

    /// Drain owed `ReadyForQuery` messages so a new cycle may begin.
    ///
    /// Called at the start of every operation: after a statement-level error
    /// the next successful operation completes within this one drain.
    pub(crate) async fn ensure_ready(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.flush().await?;
        }

        while self.pending_ready != 0 {
            let (msgtype, body) = self.recv_raw().await?;
            match msgtype {
                backend::ReadyForQuery::MSGTYPE => {
                    let rfq = backend::ReadyForQuery::decode(msgtype, body)
                        .inspect_err(|_| self.phase = Phase::Closed)?;
                    self.txn_status = rfq.status;
                    self.pending_ready -= 1;
                }
                backend::ErrorResponse::MSGTYPE => {
                    log::error!("{}", DatabaseError::parse(body));
                }
                backend::NoticeResponse::MSGTYPE => {
                    let notice = DatabaseError::parse(body);
                    log::warn!("{notice}");
                    if let Some(handler) = &mut self.notice {
                        handler(notice);
                    }
                }
                backend::ParameterStatus::MSGTYPE => {
                    let status = backend::ParameterStatus::decode(msgtype, body)?;
                    self.params
                        .insert(status.name.as_str().into(), status.value.as_str().into());
                }
                // ignore everything else until ReadyForQuery
                _ => {}
            }
        }

        if self.phase == Phase::PendingSync {
            self.phase = Phase::ReadyIdle;
        }
        Ok(())
    }

    /// Synchronize and verify the connection is idle before an operation.
    pub(crate) async fn start_operation(&mut self, operation: &'static str) -> Result<()> {
        self.ensure_ready().await?;
        self.phase.expect(Phase::ReadyIdle, operation)?;
        Ok(())
    }
}

impl<S> Connection<S> {
    /// Transaction status as of the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.txn_status
    }

    /// Server parameter status value, e.g. `server_version` or `TimeZone`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The session `TimeZone`, authoritative for the server's rendering of
    /// `timestamptz` text values.
    pub fn server_timezone(&self) -> Option<chrono_tz::Tz> {
        self.parameter("TimeZone")?.parse().ok()
    }

    /// Token for cancelling a query over a side channel.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        let key = self.key.as_ref()?;
        Some(CancelToken::new(key, &self.config))
    }

    /// The shared type registry of this connection.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Install an observer for `NoticeResponse` reports. Notices are never
    /// errors.
    pub fn set_notice_handler(&mut self, handler: impl FnMut(DatabaseError) + Send + 'static) {
        self.notice = Some(Box::new(handler));
    }

    /// Buffer a frontend message; nothing reaches the wire until
    /// [`flush`](Self::flush).
    pub(crate) fn send<F: FrontendProtocol + std::fmt::Debug>(&mut self, message: F) {
        log::trace!("(F) {message:?}");
        frontend::write(message, &mut self.write_buf);
    }

    pub(crate) fn send_startup(&mut self, startup: frontend::Startup) {
        log::trace!("(F) {startup:?}");
        startup.write(&mut self.write_buf);
    }

    /// Mark one more `ReadyForQuery` as owed, e.g. when a row stream is
    /// abandoned mid-result.
    pub(crate) fn ready_request(&mut self) {
        self.pending_ready += 1;
        if self.phase != Phase::Closed {
            self.phase = Phase::PendingSync;
        }
    }

    pub(crate) fn set_key(&mut self, key: backend::BackendKeyData) {
        self.key = Some(key);
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase)
            .field("transaction_status", &self.txn_status)
            .field("cached_statements", &self.cache.len())
            .field("pending_ready", &self.pending_ready)
            .finish_non_exhaustive()
    }
}
