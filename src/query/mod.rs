//! Simple and extended query pipelines.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html>
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::ByteStr;
use crate::connection::{Connection, QueryMode};
use crate::error::{Error, Result};
use crate::phase::{Phase, StateError};
use crate::protocol::{backend, frontend, Oid, PgFormat};
use crate::row::{Row, RowDescription};
use crate::statement::{PortalName, Prepared, StatementName};
use crate::types::PgValue;

/// Outcome of one statement in a simple-query cycle.
///
/// Multiple statements in one query string are legal; each yields its own
/// command-complete block.
#[derive(Debug)]
pub struct StatementResult {
    /// The command tag, e.g. `SELECT 4`.
    pub tag: ByteStr,
    /// Rows the command handled, where the tag carries a count.
    pub rows_affected: u64,
    /// The result shape, for statements that return rows.
    pub row_desc: Option<Arc<RowDescription>>,
    pub rows: Vec<Row>,
}

fn fingerprint(sql: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    hasher.finish()
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Run one simple `Query` cycle and collect every statement's results.
    ///
    /// COPY statements are refused here and leave the connection usable; the
    /// copy facades are the only path to the COPY sub-protocol.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<StatementResult>> {
        self.start_operation("simple query").await?;
        self.phase = Phase::SimpleQuery;

        self.send(frontend::Query { sql });
        self.flush().await?;

        let mut results = Vec::new();
        let mut desc: Option<Arc<RowDescription>> = None;
        let mut rows = Vec::new();

        loop {
            use backend::BackendMessage::*;
            match self.recv().await? {
                RowDescription(rd) => {
                    desc = Some(Arc::new(crate::row::RowDescription::parse(rd)?));
                    rows = Vec::new();
                }
                DataRow(dr) => {
                    let Some(desc) = desc.clone() else {
                        self.phase = Phase::Closed;
                        return Err(crate::protocol::ProtocolError::unexpected_phase(
                            backend::DataRow::MSGTYPE,
                            "simple query",
                        )
                        .into());
                    };
                    rows.push(Row::parse(dr, desc, self.registry().clone()).map_err(|err| {
                        self.phase = Phase::Closed;
                        Error::from(err)
                    })?);
                }
                CommandComplete(cmd) => {
                    results.push(StatementResult {
                        rows_affected: cmd.rows_affected(),
                        tag: cmd.tag,
                        row_desc: desc.take(),
                        rows: std::mem::take(&mut rows),
                    });
                }
                EmptyQueryResponse(_) => {
                    desc = None;
                    rows = Vec::new();
                }
                ReadyForQuery(_) => {
                    self.phase = Phase::ReadyIdle;
                    return Ok(results);
                }
                CopyInResponse(_) => return Err(self.refuse_copy_in().await),
                CopyOutResponse(_) => return Err(self.refuse_copy_out().await),
                message => {
                    self.phase = Phase::Closed;
                    return Err(message.unexpected("simple query").into());
                }
            }
        }
    }

    /// Execute a statement and report the handled row count.
    pub async fn execute(&mut self, sql: &str, params: &[PgValue]) -> Result<u64> {
        if self.config.prefer_query_mode == QueryMode::Simple && params.is_empty() {
            let results = self.simple_query(sql).await?;
            return Ok(results.iter().map(|r| r.rows_affected).sum());
        }

        let mut stream = self.fetch_raw(sql, params, 0).await?;
        while let Some(row) = stream.next().await {
            row?;
        }
        Ok(stream.rows_affected().unwrap_or(0))
    }

    /// Stream the rows of a statement. `max_row` 0 means all rows in one
    /// portal round; a non-zero limit executes through a held portal that is
    /// re-executed whenever the server suspends it.
    pub async fn fetch_raw(
        &mut self,
        sql: &str,
        params: &[PgValue],
        max_row: u32,
    ) -> Result<RowStream<'_, S>> {
        self.start_operation("extended query").await?;

        let sql = sql.trim();
        let sqlid = fingerprint(sql);

        let (declared, values) = encode_params(self, params)?;

        let (decision, evicted) = self.cache.acquire(sqlid, &declared);
        if let Some(victim) = evicted {
            self.pending_closes.push(victim);
        }

        // evicted statements close lazily, batched ahead of this sequence
        let closes: Vec<StatementName> = std::mem::take(&mut self.pending_closes);
        for name in &closes {
            self.send(frontend::Close { variant: b'S', name: name.as_str() });
        }

        let (stmt, parse, promoted) = match decision {
            Prepared::Cached(name) => (name, false, false),
            Prepared::Promote(name) => (name, true, true),
            Prepared::OneShot => (StatementName::unnamed(), true, false),
        };

        if parse {
            self.send(frontend::Parse {
                prepare_name: stmt.as_str(),
                sql,
                oids: &declared,
            });
        }

        // a row-limited execution holds a named portal across server
        // suspensions, so the Sync is withheld until the portal is done
        let held_portal = max_row > 0;
        let portal = if held_portal { PortalName::next() } else { PortalName::unnamed() };

        let result_formats = self.cached_result_formats(sqlid);

        self.send(frontend::Bind {
            portal_name: portal.as_str(),
            stmt_name: stmt.as_str(),
            params: &values,
            result_formats: &result_formats,
        });
        self.send(frontend::Describe { kind: b'P', name: portal.as_str() });
        self.send(frontend::Execute { portal_name: portal.as_str(), max_row: max_row as i32 });
        if held_portal {
            self.send(frontend::Flush);
            self.needs_sync_on_error = true;
        } else {
            self.send(frontend::Sync);
        }

        self.phase = Phase::ExtendedQuery;
        self.flush().await?;

        match self.await_portal(closes.len(), parse, sqlid).await {
            Ok(desc) => {
                let desc = Arc::new(desc);
                Ok(RowStream {
                    registry: self.registry().clone(),
                    desc,
                    portal: held_portal.then_some(portal),
                    max_row,
                    command: None,
                    finished: false,
                    conn: self,
                })
            }
            Err(err) => {
                if promoted || err.as_database().is_some_and(|db| db.code() == "26000") {
                    self.cache.forget(sqlid);
                }
                Err(err)
            }
        }
    }

    /// Collect every row of a statement.
    pub async fn fetch_all(&mut self, sql: &str, params: &[PgValue]) -> Result<Vec<Row>> {
        let mut stream = self.fetch_raw(sql, params, 0).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Fetch at most one row.
    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[PgValue],
    ) -> Result<Option<Row>> {
        let mut stream = self.fetch_raw(sql, params, 0).await?;
        let mut first = None;
        while let Some(row) = stream.next().await {
            let row = row?;
            first.get_or_insert(row);
        }
        Ok(first)
    }

    /// Explicitly promote a SQL text to a named server-side statement.
    ///
    /// Under [`QueryMode::ExtendedForPrepared`] only statements prepared this
    /// way execute against a server-side name.
    pub async fn prepare(&mut self, sql: &str) -> Result<()> {
        self.start_operation("prepare").await?;

        let sql = sql.trim();
        let sqlid = fingerprint(sql);
        if matches!(self.cache.get(sqlid), Some(entry) if entry.name.is_some()) {
            return Ok(());
        }

        let (name, evicted) = self.cache.force_promote(sqlid);
        if let Some(victim) = evicted {
            self.pending_closes.push(victim);
        }
        self.send(frontend::Parse { prepare_name: name.as_str(), sql, oids: &[] });
        self.send(frontend::Sync);
        self.phase = Phase::ExtendedQuery;
        self.flush().await?;

        match self.recv::<backend::ParseComplete>().await {
            Ok(_) => {
                self.recv::<backend::ReadyForQuery>().await?;
                self.phase = Phase::ReadyIdle;
                Ok(())
            }
            Err(err) => {
                self.cache.forget(sqlid);
                Err(err)
            }
        }
    }

    /// Consume the sequence prelude up to the portal's row description.
    async fn await_portal(
        &mut self,
        closes: usize,
        parse: bool,
        sqlid: u64,
    ) -> Result<RowDescription> {
        for _ in 0..closes {
            self.recv::<backend::CloseComplete>().await?;
        }
        if parse {
            self.recv::<backend::ParseComplete>().await?;
        }
        self.recv::<backend::BindComplete>().await?;

        use backend::BackendMessage::*;
        let desc = match self.recv().await? {
            RowDescription(rd) => crate::row::RowDescription::parse(rd)?,
            NoData(_) => crate::row::RowDescription::default(),
            message => {
                self.phase = Phase::Closed;
                return Err(message.unexpected("portal describe").into());
            }
        };

        if !desc.is_empty() {
            self.cache.set_row_desc(sqlid, desc.clone());
        }
        Ok(desc)
    }

    /// Per-column result formats under the binary-transfer policy, known
    /// only once the statement's shape has been described; the first
    /// execution of a statement receives text results.
    fn cached_result_formats(&mut self, sqlid: u64) -> Vec<PgFormat> {
        let config = &self.config;
        let registry = &self.registry;
        let Some(desc) = self.cache.get(sqlid).and_then(|e| e.row_desc.as_ref()) else {
            return Vec::new();
        };
        let formats: Vec<PgFormat> = desc
            .columns()
            .iter()
            .map(|column| {
                if config.binary_preferred(column.type_oid)
                    && registry.supports_binary(column.type_oid)
                {
                    PgFormat::Binary
                } else {
                    PgFormat::Text
                }
            })
            .collect();
        if formats.iter().all(|f| *f == PgFormat::Text) {
            Vec::new()
        } else {
            formats
        }
    }

    /// Abort an unsolicited copy-in with `CopyFail` and resynchronize.
    pub(crate) async fn refuse_copy_in(&mut self) -> Error {
        self.phase = Phase::CopyIn;
        self.send(frontend::CopyFail {
            message: "COPY commands are only supported through the copy facade",
        });
        self.ready_request();
        if let Err(err) = self.ensure_ready().await {
            return err;
        }
        StateError::new("execute COPY FROM STDIN through the statement facade", Phase::CopyIn)
            .into()
    }

    /// Drain an unsolicited copy-out stream entirely and resynchronize.
    pub(crate) async fn refuse_copy_out(&mut self) -> Error {
        self.phase = Phase::CopyOut;
        self.ready_request();
        if let Err(err) = self.ensure_ready().await {
            return err;
        }
        StateError::new("execute COPY TO STDOUT through the statement facade", Phase::CopyOut)
            .into()
    }
}

fn encode_params<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &Connection<S>,
    params: &[PgValue],
) -> Result<(Vec<Oid>, Vec<frontend::BindValue>)> {
    let mut declared = Vec::with_capacity(params.len());
    let mut values = Vec::with_capacity(params.len());

    for value in params {
        let oid = value.type_oid();
        declared.push(oid);

        if value.is_null() {
            values.push(frontend::BindValue { format: PgFormat::Text, value: None });
            continue;
        }

        let format = if conn.config.binary_preferred(oid) && conn.registry().supports_binary(oid) {
            PgFormat::Binary
        } else {
            PgFormat::Text
        };

        let mut buf = BytesMut::new();
        conn.registry().encode(value, format, &mut buf)?;
        values.push(frontend::BindValue { format, value: Some(buf.freeze()) });
    }

    Ok((declared, values))
}

/// Streaming result rows, decoded on demand against the portal's row
/// description. Nothing is buffered unless the caller collects.
pub struct RowStream<'c, S> {
    conn: &'c mut Connection<S>,
    registry: Arc<crate::types::TypeRegistry>,
    desc: Arc<RowDescription>,
    /// Held portal for row-limited execution; `None` when the Sync was
    /// batched with the Execute.
    portal: Option<PortalName>,
    max_row: u32,
    command: Option<backend::CommandComplete>,
    finished: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RowStream<'_, S> {
    /// The next row, or `None` once the result set is exhausted.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if self.finished {
            return None;
        }

        loop {
            use backend::BackendMessage::*;
            let message = match self.conn.recv().await {
                Ok(message) => message,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };

            match message {
                DataRow(dr) => {
                    return match Row::parse(dr, self.desc.clone(), self.registry.clone()) {
                        Ok(row) => Some(Ok(row)),
                        Err(err) => {
                            self.finished = true;
                            self.conn.phase = Phase::Closed;
                            Some(Err(err.into()))
                        }
                    };
                }
                PortalSuspended(_) => {
                    // the row-count limit was reached; run the portal again
                    let Some(portal) = &self.portal else {
                        self.finished = true;
                        self.conn.phase = Phase::Closed;
                        return Some(Err(
                            crate::protocol::ProtocolError::unexpected_phase(b's', "sync portal")
                                .into(),
                        ));
                    };
                    self.conn.send(frontend::Execute {
                        portal_name: portal.as_str(),
                        max_row: self.max_row as i32,
                    });
                    self.conn.send(frontend::Flush);
                    if let Err(err) = self.conn.flush().await {
                        self.finished = true;
                        return Some(Err(err));
                    }
                }
                CommandComplete(cmd) => {
                    self.command = Some(cmd);
                    if let Err(err) = self.finish().await {
                        return Some(Err(err));
                    }
                    return None;
                }
                EmptyQueryResponse(_) => {
                    if let Err(err) = self.finish().await {
                        return Some(Err(err));
                    }
                    return None;
                }
                message => {
                    self.finished = true;
                    self.conn.phase = Phase::Closed;
                    return Some(Err(message.unexpected("extended query rows").into()));
                }
            }
        }
    }

    /// Close a held portal and consume the synchronization point.
    async fn finish(&mut self) -> Result<()> {
        self.finished = true;

        if let Some(portal) = self.portal.take() {
            self.conn.send(frontend::Close { variant: b'P', name: portal.as_str() });
            self.conn.send(frontend::Sync);
            self.conn.needs_sync_on_error = false;
            self.conn.flush().await?;
            self.conn.recv::<backend::CloseComplete>().await?;
        }

        self.conn.recv::<backend::ReadyForQuery>().await?;
        self.conn.phase = Phase::ReadyIdle;
        Ok(())
    }

    /// Row count reported by the command, available after exhaustion.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command.as_ref().map(backend::CommandComplete::rows_affected)
    }

    /// The command tag, available after exhaustion.
    pub fn tag(&self) -> Option<&str> {
        self.command.as_ref().map(|c| c.tag.as_str())
    }

    pub fn row_description(&self) -> &RowDescription {
        &self.desc
    }
}

impl<S> Drop for RowStream<'_, S> {
    fn drop(&mut self) {
        // an abandoned stream leaves the cycle mid-flight; buffer the close
        // and owe its ReadyForQuery, drained before the next operation
        if !self.finished && self.conn.phase == Phase::ExtendedQuery {
            if let Some(portal) = self.portal.take() {
                self.conn.send(frontend::Close { variant: b'P', name: portal.as_str() });
                self.conn.send(frontend::Sync);
                self.conn.needs_sync_on_error = false;
            }
            self.conn.ready_request();
        }
    }
}
