//! COPY sub-protocol engine.
//!
//! Both directions run over the simple-query cycle: a `Query` carrying the
//! COPY statement, a `CopyInResponse`/`CopyOutResponse`, the data transfer,
//! and a final `CommandComplete` + `ReadyForQuery` carrying the handled row
//! count. While a copy is active no other traffic is permitted on the
//! connection; every facade here is a thin wrapper over one shared session
//! guarded by the connection phase.
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::Connection;
use crate::error::Result;
use crate::phase::{Phase, StateError};
use crate::protocol::{backend, frontend};

/// Lifecycle of one copy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Active,
    EndedOk,
    Cancelled,
    Failed,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Start `COPY ... FROM STDIN` and hand out the copy-in session.
    ///
    /// Fails cleanly, leaving the connection usable, when `sql` is not a
    /// copy-in statement.
    pub async fn copy_in(&mut self, sql: &str) -> Result<CopyIn<'_, S>> {
        self.start_operation("copy-in").await?;
        self.phase = Phase::SimpleQuery;

        self.send(frontend::Query { sql });
        self.flush().await?;

        use backend::BackendMessage::*;
        match self.recv().await? {
            CopyInResponse(_) => {
                self.phase = Phase::CopyIn;
                Ok(CopyIn { conn: self, state: CopyState::Active, rows: None })
            }
            CopyOutResponse(_) => Err(self.refuse_copy_out().await),
            ReadyForQuery(_) => {
                self.phase = Phase::ReadyIdle;
                Err(StateError::new("copy-in from a statement that returned no copy stream", Phase::ReadyIdle).into())
            }
            _ => {
                // an ordinary result set; drain it and refuse
                self.ready_request();
                self.ensure_ready().await?;
                Err(StateError::new("copy-in from a non-COPY statement", Phase::ReadyIdle).into())
            }
        }
    }

    /// Start `COPY ... TO STDOUT` and hand out the copy-out session.
    ///
    /// `COPY (SELECT ...) TO STDOUT` is a valid bulk-unload path; the final
    /// command-complete row count is reported either way.
    pub async fn copy_out(&mut self, sql: &str) -> Result<CopyOut<'_, S>> {
        self.start_operation("copy-out").await?;
        self.phase = Phase::SimpleQuery;

        self.send(frontend::Query { sql });
        self.flush().await?;

        use backend::BackendMessage::*;
        match self.recv().await? {
            CopyOutResponse(_) => {
                self.phase = Phase::CopyOut;
                Ok(CopyOut { conn: self, state: CopyState::Active, rows: None })
            }
            CopyInResponse(_) => Err(self.refuse_copy_in().await),
            ReadyForQuery(_) => {
                self.phase = Phase::ReadyIdle;
                Err(StateError::new("copy-out from a statement that returned no copy stream", Phase::ReadyIdle).into())
            }
            _ => {
                self.ready_request();
                self.ensure_ready().await?;
                Err(StateError::new("copy-out from a non-COPY statement", Phase::ReadyIdle).into())
            }
        }
    }
}

/// Active `COPY ... FROM STDIN` session: row-at-a-time writer facade.
///
/// Until the copy ends, only copy traffic may use the connection; the only
/// other allowed action is a side-channel cancel on a separate transport.
#[derive(Debug)]
pub struct CopyIn<'c, S> {
    conn: &'c mut Connection<S>,
    state: CopyState,
    rows: Option<u64>,
}

impl<'c, S: AsyncRead + AsyncWrite + Unpin> CopyIn<'c, S> {
    /// Whether neither end nor failure has been observed yet.
    pub fn is_active(&self) -> bool {
        matches!(self.state, CopyState::Active)
    }

    /// Server-reported row count, available after a successful end.
    pub fn handled_row_count(&self) -> Option<u64> {
        self.rows
    }

    fn ensure_active(&self, operation: &'static str) -> Result<(), StateError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StateError::new(operation, self.conn.phase))
        }
    }

    /// Ship one chunk of copy data. Frontends may divide the data stream
    /// arbitrarily; chunks need not align with rows.
    pub async fn write_to_copy(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_active("write to an ended copy")?;
        self.conn.send(frontend::CopyData { data });
        self.conn.flush().await.inspect_err(|_| self.state = CopyState::Failed)
    }

    /// End the copy normally and return the server-reported handled row
    /// count.
    pub async fn end_copy(&mut self) -> Result<u64> {
        self.ensure_active("end an ended copy")?;
        self.conn.send(frontend::CopyDone);
        if let Err(err) = self.conn.flush().await {
            self.state = CopyState::Failed;
            return Err(err);
        }

        use backend::BackendMessage::*;
        match self.conn.recv().await {
            Ok(CommandComplete(cmd)) => {
                let rows = cmd.rows_affected();
                self.conn.recv::<backend::ReadyForQuery>().await?;
                self.conn.phase = Phase::ReadyIdle;
                self.state = CopyState::EndedOk;
                self.rows = Some(rows);
                Ok(rows)
            }
            Ok(message) => {
                self.state = CopyState::Failed;
                self.conn.phase = Phase::Closed;
                Err(message.unexpected("copy-in end").into())
            }
            Err(err) => {
                self.state = CopyState::Failed;
                Err(err)
            }
        }
    }

    /// Abort the copy. The server discards the data and reports a
    /// query-canceled error, which is consumed here; the connection is
    /// synchronized and usable afterwards.
    pub async fn cancel_copy(&mut self) -> Result<()> {
        self.ensure_active("cancel an ended copy")?;
        self.conn.send(frontend::CopyFail { message: "copy cancelled by client" });
        if let Err(err) = self.conn.flush().await {
            self.state = CopyState::Failed;
            return Err(err);
        }

        match self.conn.recv::<backend::BackendMessage>().await {
            Err(err) if err.as_database().is_some() => {
                self.conn.ensure_ready().await?;
                self.state = CopyState::Cancelled;
                Ok(())
            }
            Err(err) => {
                self.state = CopyState::Failed;
                Err(err)
            }
            Ok(message) => {
                self.state = CopyState::Failed;
                self.conn.phase = Phase::Closed;
                Err(message.unexpected("copy-in cancel").into())
            }
        }
    }

    /// Pull facade: drain `reader` in fixed chunks until EOF, then end the
    /// copy. A reader error aborts the copy and leaves the target unchanged.
    pub async fn read_from(&mut self, mut reader: impl AsyncRead + Unpin) -> Result<u64> {
        let mut chunk = vec![0u8; self.conn.config.copy_buffer_size];
        loop {
            let read = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    // best effort: the server drops the partial data
                    let _ = self.cancel_copy().await;
                    return Err(err.into());
                }
            };
            self.write_to_copy(&chunk[..read]).await?;
        }
        self.end_copy().await
    }

    /// Byte-sink facade over this session.
    pub fn writer(self) -> CopyInWriter<'c, S> {
        let chunk = self.conn.config.copy_buffer_size;
        CopyInWriter { buf: BytesMut::with_capacity(chunk), chunk, closed: false, inner: self }
    }
}

impl<S> Drop for CopyIn<'_, S> {
    fn drop(&mut self) {
        // an abandoned active copy is failed, and its error + sync drained
        // before the next operation
        if matches!(self.state, CopyState::Active) && self.conn.phase == Phase::CopyIn {
            self.conn.send(frontend::CopyFail { message: "copy dropped by client" });
            self.conn.ready_request();
        }
    }
}

/// Write-only byte stream facade that chunks into CopyData messages.
///
/// Bytes accumulate until the configured chunk size triggers a flush.
/// [`finish`](Self::finish) ends the copy; any use afterwards fails with a
/// state error.
pub struct CopyInWriter<'c, S> {
    inner: CopyIn<'c, S>,
    buf: BytesMut,
    chunk: usize,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> CopyInWriter<'_, S> {
    pub fn is_active(&self) -> bool {
        !self.closed && self.inner.is_active()
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), StateError> {
        if self.closed {
            Err(StateError::new(operation, self.inner.conn.phase))
        } else {
            Ok(())
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open("write to a closed copy stream")?;
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk {
            self.flush_buffered().await?;
        }
        Ok(())
    }

    /// Force out buffered bytes as a CopyData message.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open("flush a closed copy stream")?;
        self.flush_buffered().await
    }

    async fn flush_buffered(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let data = self.buf.split();
            self.inner.write_to_copy(&data).await?;
        }
        Ok(())
    }

    /// Flush, end the copy and return the handled row count.
    pub async fn finish(&mut self) -> Result<u64> {
        self.ensure_open("finish a closed copy stream")?;
        self.flush_buffered().await?;
        self.closed = true;
        self.inner.end_copy().await
    }
}

/// Active `COPY ... TO STDOUT` session.
pub struct CopyOut<'c, S> {
    conn: &'c mut Connection<S>,
    state: CopyState,
    rows: Option<u64>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> CopyOut<'_, S> {
    pub fn is_active(&self) -> bool {
        matches!(self.state, CopyState::Active)
    }

    /// Server-reported row count, available once the stream is exhausted.
    pub fn handled_row_count(&self) -> Option<u64> {
        self.rows
    }

    /// The next CopyData payload, or `None` once the server has finished.
    ///
    /// Backend copy data corresponds to single data rows.
    pub async fn read_from_copy(&mut self) -> Result<Option<Bytes>> {
        if !self.is_active() {
            return Ok(None);
        }

        use backend::BackendMessage::*;
        match self.conn.recv().await {
            Ok(CopyData(data)) => Ok(Some(data.data)),
            Ok(CopyDone(_)) => match self.conn.recv().await {
                Ok(CommandComplete(cmd)) => {
                    self.rows = Some(cmd.rows_affected());
                    self.conn.recv::<backend::ReadyForQuery>().await?;
                    self.conn.phase = Phase::ReadyIdle;
                    self.state = CopyState::EndedOk;
                    Ok(None)
                }
                Ok(message) => {
                    self.state = CopyState::Failed;
                    self.conn.phase = Phase::Closed;
                    Err(message.unexpected("copy-out end").into())
                }
                Err(err) => {
                    self.state = CopyState::Failed;
                    Err(err)
                }
            },
            Ok(message) => {
                self.state = CopyState::Failed;
                self.conn.phase = Phase::Closed;
                Err(message.unexpected("copy-out data").into())
            }
            Err(err) => {
                self.state = CopyState::Failed;
                Err(err)
            }
        }
    }

    /// Push facade: drain the whole stream into `writer` and return the
    /// handled row count.
    pub async fn write_to(&mut self, mut writer: impl AsyncWrite + Unpin) -> Result<u64> {
        while let Some(data) = self.read_from_copy().await? {
            writer.write_all(&data).await?;
        }
        writer.flush().await?;
        Ok(self.rows.unwrap_or(0))
    }
}

impl<S> Drop for CopyOut<'_, S> {
    fn drop(&mut self) {
        // the server keeps streaming regardless; owe the drain to the next
        // operation
        if matches!(self.state, CopyState::Active) && self.conn.phase == Phase::CopyOut {
            self.conn.ready_request();
        }
    }
}
