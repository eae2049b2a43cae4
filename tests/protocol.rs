//! Protocol conversations against a scripted in-memory backend.
use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use pgcore::{
    connection::md5_password, Config, Connection, ErrorKind, PgValue, TransactionStatus,
};

/// Scripted server side of a duplex pipe.
struct MockBackend {
    io: DuplexStream,
}

impl MockBackend {
    fn new(io: DuplexStream) -> Self {
        Self { io }
    }

    /// Read the startup message (no tag byte) and return its parameters.
    async fn accept_startup(&mut self) -> HashMap<String, String> {
        let len = self.io.read_i32().await.unwrap();
        let mut body = vec![0u8; len as usize - 4];
        self.io.read_exact(&mut body).await.unwrap();

        let mut body = &body[..];
        assert_eq!(body.get_i32(), 196608, "protocol version 3.0");

        let mut params = HashMap::new();
        loop {
            let name = read_cstr(&mut body);
            if name.is_empty() {
                break;
            }
            let value = read_cstr(&mut body);
            params.insert(name, value);
        }
        params
    }

    /// AuthenticationOk, session parameters, backend key, ReadyForQuery.
    async fn finish_startup(&mut self) {
        self.auth(0, &[]).await;
        self.parameter_status("client_encoding", "UTF8").await;
        self.parameter_status("server_version", "16.3").await;
        self.parameter_status("TimeZone", "Europe/Paris").await;
        self.backend_key(1234, 5678).await;
        self.ready(b'I').await;
    }

    async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.io.read_u8().await.unwrap();
        let len = self.io.read_i32().await.unwrap();
        let mut body = vec![0u8; len as usize - 4];
        self.io.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    async fn expect(&mut self, expected: u8) -> Vec<u8> {
        let (tag, body) = self.read_message().await;
        assert_eq!(tag as char, expected as char, "unexpected frontend message");
        body
    }

    async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut buf = BytesMut::with_capacity(5 + body.len());
        buf.put_u8(tag);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
        self.io.write_all(&buf).await.unwrap();
    }

    async fn auth(&mut self, code: i32, extra: &[u8]) {
        let mut body = BytesMut::new();
        body.put_i32(code);
        body.put_slice(extra);
        self.send(b'R', &body).await;
    }

    async fn parameter_status(&mut self, name: &str, value: &str) {
        let mut body = BytesMut::new();
        put_cstr(&mut body, name);
        put_cstr(&mut body, value);
        self.send(b'S', &body).await;
    }

    async fn backend_key(&mut self, pid: i32, secret: i32) {
        let mut body = BytesMut::new();
        body.put_i32(pid);
        body.put_i32(secret);
        self.send(b'K', &body).await;
    }

    async fn ready(&mut self, status: u8) {
        self.send(b'Z', &[status]).await;
    }

    async fn row_description(&mut self, columns: &[(&str, u32, u16)]) {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for (name, oid, format) in columns {
            put_cstr(&mut body, name);
            body.put_u32(0);
            body.put_i16(0);
            body.put_u32(*oid);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_u16(*format);
        }
        self.send(b'T', &body).await;
    }

    async fn data_row(&mut self, fields: &[Option<&[u8]>]) {
        let mut body = BytesMut::new();
        body.put_i16(fields.len() as i16);
        for field in fields {
            match field {
                Some(data) => {
                    body.put_i32(data.len() as i32);
                    body.put_slice(data);
                }
                None => body.put_i32(-1),
            }
        }
        self.send(b'D', &body).await;
    }

    async fn command_complete(&mut self, tag: &str) {
        let mut body = BytesMut::new();
        put_cstr(&mut body, tag);
        self.send(b'C', &body).await;
    }

    async fn error_response(&mut self, code: &str, message: &str) {
        let mut body = BytesMut::new();
        body.put_u8(b'S');
        put_cstr(&mut body, "ERROR");
        body.put_u8(b'C');
        put_cstr(&mut body, code);
        body.put_u8(b'M');
        put_cstr(&mut body, message);
        body.put_u8(0);
        self.send(b'E', &body).await;
    }

    async fn copy_in_response(&mut self, columns: usize) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_i16(columns as i16);
        for _ in 0..columns {
            body.put_i16(0);
        }
        self.send(b'G', &body).await;
    }

    async fn copy_out_response(&mut self, columns: usize) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_i16(columns as i16);
        for _ in 0..columns {
            body.put_i16(0);
        }
        self.send(b'H', &body).await;
    }
}

fn read_cstr(body: &mut &[u8]) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap();
    let out = String::from_utf8(body[..end].to_vec()).unwrap();
    body.advance(end + 1);
    out
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Parse body: statement name, sql.
fn parse_names(body: &[u8]) -> (String, String) {
    let mut body = &body[..];
    let name = read_cstr(&mut body);
    let sql = read_cstr(&mut body);
    (name, sql)
}

/// Bind body: portal name, statement name.
fn bind_names(body: &[u8]) -> (String, String) {
    let mut body = &body[..];
    let portal = read_cstr(&mut body);
    let stmt = read_cstr(&mut body);
    (portal, stmt)
}

async fn connected(
    config: Config,
    script: impl FnOnce(MockBackend) -> tokio::task::JoinHandle<()>,
) -> (Connection<DuplexStream>, tokio::task::JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let handle = script(MockBackend::new(server));
    let conn = Connection::handshake(client, config).await.unwrap();
    (conn, handle)
}

// ===== startup =====

#[tokio::test]
async fn startup_handshake_records_session_state() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut backend = MockBackend::new(server);

    let handle = tokio::spawn(async move {
        let params = backend.accept_startup().await;
        assert_eq!(params["user"], "alice");
        assert_eq!(params["database"], "app");
        backend.finish_startup().await;
    });

    let conn = Connection::handshake(client, Config::default().user("alice").dbname("app"))
        .await
        .unwrap();
    handle.await.unwrap();

    assert_eq!(conn.parameter("server_version"), Some("16.3"));
    assert_eq!(conn.server_timezone(), Some(chrono_tz::Europe::Paris));
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    let token = conn.cancel_token().unwrap();
    assert_eq!(token.process_id(), 1234);
}

#[tokio::test]
async fn startup_md5_authentication() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut backend = MockBackend::new(server);
    let salt = [9, 8, 7, 6];

    let handle = tokio::spawn(async move {
        backend.accept_startup().await;
        backend.auth(5, &salt).await;

        let body = backend.expect(b'p').await;
        let mut body = &body[..];
        let password = read_cstr(&mut body);
        assert_eq!(password, md5_password("alice", "secret", &salt));

        backend.finish_startup().await;
    });

    Connection::handshake(client, Config::default().user("alice").password("secret"))
        .await
        .unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn startup_rejects_non_utf8_encoding() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut backend = MockBackend::new(server);

    let handle = tokio::spawn(async move {
        backend.accept_startup().await;
        backend.auth(0, &[]).await;
        backend.parameter_status("client_encoding", "LATIN1").await;
        backend.backend_key(1, 2).await;
        backend.ready(b'I').await;
    });

    let err = Connection::handshake(client, Config::default()).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnsupportedEncoding(enc) if enc == "LATIN1"));
    handle.await.unwrap();
}

#[tokio::test]
async fn startup_without_auth_handler_rejects_sasl() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut backend = MockBackend::new(server);

    let handle = tokio::spawn(async move {
        backend.accept_startup().await;
        backend.auth(10, b"SCRAM-SHA-256\0\0").await;
    });

    let err = Connection::handshake(client, Config::default()).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Auth(_)));
    handle.await.unwrap();
}

// ===== simple query =====

#[tokio::test]
async fn simple_query_streams_multiple_statements() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            let body = backend.expect(b'Q').await;
            let mut body = &body[..];
            assert_eq!(read_cstr(&mut body), "SELECT 1; SELECT 2");

            backend.row_description(&[("a", 23, 0)]).await;
            backend.data_row(&[Some(b"1")]).await;
            backend.command_complete("SELECT 1").await;
            backend.row_description(&[("b", 23, 0)]).await;
            backend.data_row(&[Some(b"2")]).await;
            backend.data_row(&[None]).await;
            backend.command_complete("SELECT 2").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let results = conn.simple_query("SELECT 1; SELECT 2").await.unwrap();
    handle.await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rows.len(), 1);
    assert_eq!(results[0].rows[0].get(0).unwrap(), PgValue::Int4(1));
    assert_eq!(results[0].rows_affected, 1);
    assert_eq!(results[1].rows.len(), 2);
    assert_eq!(results[1].rows[1].get(0).unwrap(), PgValue::Null);
    assert_eq!(results[1].tag.as_str(), "SELECT 2");
}

#[tokio::test]
async fn transaction_status_follows_ready_for_query() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.command_complete("BEGIN").await;
            backend.ready(b'T').await;

            backend.expect(b'Q').await;
            backend.error_response("22012", "division by zero").await;
            backend.ready(b'E').await;
        })
    })
    .await;

    conn.simple_query("BEGIN").await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::InBlock);

    let err = conn.simple_query("SELECT 1/0").await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("22012"));
    handle.await.unwrap();
}

// ===== extended query =====

#[tokio::test]
async fn extended_query_binds_parameters() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            let (name, sql) = parse_names(&backend.expect(b'P').await);
            assert_eq!(name, "", "one-shot below the prepare threshold");
            assert_eq!(sql, "SELECT $1, $2");
            backend.expect(b'B').await;
            backend.expect(b'D').await;
            backend.expect(b'E').await;
            backend.expect(b'S').await;

            backend.send(b'1', &[]).await; // ParseComplete
            backend.send(b'2', &[]).await; // BindComplete
            backend.row_description(&[("a", 25, 0), ("b", 23, 0)]).await;
            backend.data_row(&[Some(b"Foo"), Some(b"420")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let rows = conn
        .fetch_all(
            "SELECT $1, $2",
            &[PgValue::Text("Foo".into()), PgValue::Int4(420)],
        )
        .await
        .unwrap();
    handle.await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0).unwrap(), PgValue::Text("Foo".into()));
    assert_eq!(rows[0].get(1).unwrap(), PgValue::Int4(420));
}

#[tokio::test]
async fn prepare_threshold_promotes_exactly_once() {
    let config = Config::default().prepare_threshold(2);
    let (mut conn, handle) = connected(config, |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            // use 1: unnamed one-shot parse
            let (name, _) = parse_names(&backend.expect(b'P').await);
            assert_eq!(name, "");
            backend.expect(b'B').await;
            backend.expect(b'D').await;
            backend.expect(b'E').await;
            backend.expect(b'S').await;
            backend.send(b'1', &[]).await;
            backend.send(b'2', &[]).await;
            backend.row_description(&[("n", 23, 0)]).await;
            backend.data_row(&[Some(b"1")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;

            // use 2: the threshold is reached, a named Parse appears
            let (promoted, _) = parse_names(&backend.expect(b'P').await);
            assert_ne!(promoted, "", "promotion must name the statement");
            let (_, stmt) = bind_names(&backend.expect(b'B').await);
            assert_eq!(stmt, promoted);
            backend.expect(b'D').await;
            backend.expect(b'E').await;
            backend.expect(b'S').await;
            backend.send(b'1', &[]).await;
            backend.send(b'2', &[]).await;
            backend.row_description(&[("n", 23, 0)]).await;
            backend.data_row(&[Some(b"1")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;

            // use 3: no Parse at all, Bind goes straight to the name
            let (tag, body) = backend.read_message().await;
            assert_eq!(tag, b'B', "cached statement must skip Parse");
            let (_, stmt) = bind_names(&body);
            assert_eq!(stmt, promoted);
            backend.expect(b'D').await;
            backend.expect(b'E').await;
            backend.expect(b'S').await;
            backend.send(b'2', &[]).await;
            backend.row_description(&[("n", 23, 0)]).await;
            backend.data_row(&[Some(b"1")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    for _ in 0..3 {
        let rows = conn
            .fetch_all("SELECT $1", &[PgValue::Int4(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
    handle.await.unwrap();
}

#[tokio::test]
async fn statement_error_recovers_within_one_sync() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'P').await;
            backend.expect(b'B').await;
            backend.expect(b'D').await;
            backend.expect(b'E').await;
            backend.expect(b'S').await;
            backend.error_response("42601", "syntax error at or near \"nonsense\"").await;
            backend.ready(b'I').await;

            // the very next operation must work
            backend.expect(b'Q').await;
            backend.command_complete("SELECT 0").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let err = conn.execute("nonsense", &[]).await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42601"));
    assert!(!err.is_fatal());

    conn.simple_query("SELECT 1 WHERE false").await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn portal_suspension_re_executes() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'P').await;
            let (portal, _) = bind_names(&backend.expect(b'B').await);
            assert_ne!(portal, "", "row-limited execution holds a named portal");
            backend.expect(b'D').await;
            backend.expect(b'E').await;
            backend.expect(b'H').await; // Flush, Sync withheld

            backend.send(b'1', &[]).await;
            backend.send(b'2', &[]).await;
            backend.row_description(&[("n", 23, 0)]).await;
            backend.data_row(&[Some(b"1")]).await;
            backend.data_row(&[Some(b"2")]).await;
            backend.send(b's', &[]).await; // PortalSuspended

            backend.expect(b'E').await;
            backend.expect(b'H').await;
            backend.data_row(&[Some(b"3")]).await;
            backend.command_complete("SELECT 3").await;

            let body = backend.expect(b'C').await; // Close portal
            assert_eq!(body[0], b'P');
            backend.expect(b'S').await;
            backend.send(b'3', &[]).await; // CloseComplete
            backend.ready(b'I').await;
        })
    })
    .await;

    let mut stream = conn.fetch_raw("SELECT n FROM series", &[], 2).await.unwrap();
    let mut values = Vec::new();
    while let Some(row) = stream.next().await {
        values.push(row.unwrap().get(0).unwrap());
    }
    assert_eq!(
        values,
        vec![PgValue::Int4(1), PgValue::Int4(2), PgValue::Int4(3)],
    );
    assert_eq!(stream.rows_affected(), Some(3));
    drop(stream);
    handle.await.unwrap();
}

// ===== COPY =====

const COPY_ROWS: [&[u8]; 4] = [
    b"First Row\t1\t1.10\n",
    b"Second Row\t2\t-22.20\n",
    b"\\N\t\\N\t\\N\n",
    b"\t4\t444.40\n",
];

#[tokio::test]
async fn copy_in_round_trip_with_row_count() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            let body = backend.expect(b'Q').await;
            let mut body = &body[..];
            assert_eq!(read_cstr(&mut body), "COPY copytest FROM STDIN");
            backend.copy_in_response(3).await;

            let mut received = Vec::new();
            loop {
                let (tag, body) = backend.read_message().await;
                match tag {
                    b'd' => received.extend_from_slice(&body),
                    b'c' => break,
                    other => panic!("unexpected message {:?} during copy", other as char),
                }
            }
            let expected: Vec<u8> = COPY_ROWS.concat();
            assert_eq!(received, expected);
            backend.command_complete("COPY 4").await;
            backend.ready(b'I').await;

            // count query afterwards proves the connection is usable
            backend.expect(b'Q').await;
            backend.row_description(&[("count", 20, 0)]).await;
            backend.data_row(&[Some(b"4")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;

            // bulk unload reproduces the identical byte stream
            backend.expect(b'Q').await;
            backend.copy_out_response(3).await;
            for row in COPY_ROWS {
                backend.send(b'd', row).await;
            }
            backend.send(b'c', &[]).await;
            backend.command_complete("COPY 4").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let mut copy = conn.copy_in("COPY copytest FROM STDIN").await.unwrap();
    for row in COPY_ROWS {
        copy.write_to_copy(row).await.unwrap();
    }
    assert!(copy.is_active());
    let rows = copy.end_copy().await.unwrap();
    assert_eq!(rows, 4);
    assert_eq!(copy.handled_row_count(), Some(4));
    assert!(!copy.is_active());

    // cancelling a finished copy is an object-not-in-state error
    let err = copy.cancel_copy().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)));
    assert_eq!(err.sqlstate(), Some("55000"));
    drop(copy);

    let results = conn.simple_query("SELECT count(*) FROM copytest").await.unwrap();
    assert_eq!(results[0].rows[0].get(0).unwrap(), PgValue::Int8(4));

    let mut unload = conn.copy_out("COPY copytest TO STDOUT").await.unwrap();
    let mut bytes = Vec::new();
    while let Some(chunk) = unload.read_from_copy().await.unwrap() {
        bytes.extend_from_slice(&chunk);
    }
    assert_eq!(bytes, COPY_ROWS.concat());
    assert_eq!(unload.handled_row_count(), Some(4));
    drop(unload);

    handle.await.unwrap();
}

#[tokio::test]
async fn copy_in_writer_chunks_and_finishes() {
    let (mut conn, handle) = connected(Config::default().copy_buffer_size(8), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.copy_in_response(1).await;

            let mut received = Vec::new();
            loop {
                let (tag, body) = backend.read_message().await;
                match tag {
                    b'd' => received.extend_from_slice(&body),
                    b'c' => break,
                    other => panic!("unexpected message {:?} during copy", other as char),
                }
            }
            assert_eq!(received, b"abcdefghij\n");
            backend.command_complete("COPY 1").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let copy = conn.copy_in("COPY copytest FROM STDIN").await.unwrap();
    let mut writer = copy.writer();
    writer.write(b"abcde").await.unwrap();
    writer.write(b"fghij").await.unwrap(); // crosses the 8-byte trigger
    writer.write(b"\n").await.unwrap();
    let rows = writer.finish().await.unwrap();
    assert_eq!(rows, 1);

    // the stream is closed now
    let err = writer.flush().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)));
    drop(writer);
    handle.await.unwrap();
}

#[tokio::test]
async fn copy_in_pull_facade_reads_until_eof() {
    let (mut conn, handle) = connected(Config::default().copy_buffer_size(3), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.copy_in_response(1).await;

            let mut received = Vec::new();
            loop {
                let (tag, body) = backend.read_message().await;
                match tag {
                    b'd' => received.extend_from_slice(&body),
                    b'c' => break,
                    other => panic!("unexpected message {:?} during copy", other as char),
                }
            }
            assert_eq!(received, COPY_ROWS.concat());
            backend.command_complete("COPY 4").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let data: Vec<u8> = COPY_ROWS.concat();
    let mut copy = conn.copy_in("COPY copytest FROM STDIN").await.unwrap();
    let rows = copy.read_from(&data[..]).await.unwrap();
    assert_eq!(rows, 4);
    drop(copy);
    handle.await.unwrap();
}

#[tokio::test]
async fn copy_out_push_facade_writes_everything() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.copy_out_response(1).await;
            for chunk in [b"1\n".as_slice(), b"2\n", b"3\n"] {
                backend.send(b'd', chunk).await;
            }
            backend.send(b'c', &[]).await;
            backend.command_complete("COPY 1000").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let mut unload = conn
        .copy_out("COPY (SELECT generate_series(1,1000)) TO STDOUT")
        .await
        .unwrap();
    let mut sink = Vec::new();
    let rows = unload.write_to(&mut sink).await.unwrap();
    assert_eq!(rows, 1000);
    assert_eq!(sink, b"1\n2\n3\n");
    drop(unload);
    handle.await.unwrap();
}

#[tokio::test]
async fn copy_cancel_drains_the_error() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.copy_in_response(1).await;

            backend.expect(b'd').await;
            backend.expect(b'f').await; // CopyFail
            backend.error_response("57014", "COPY from stdin failed").await;
            backend.ready(b'I').await;

            backend.expect(b'Q').await;
            backend.command_complete("SELECT 0").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let mut copy = conn.copy_in("COPY copytest FROM STDIN").await.unwrap();
    copy.write_to_copy(b"partial\n").await.unwrap();
    copy.cancel_copy().await.unwrap();
    assert!(!copy.is_active());
    drop(copy);

    conn.simple_query("SELECT 1 WHERE false").await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn copy_statement_through_query_facade_is_refused() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.copy_in_response(3).await;
            backend.expect(b'f').await; // the engine aborts the copy itself
            backend.error_response("57014", "COPY from stdin failed").await;
            backend.ready(b'I').await;

            backend.expect(b'Q').await;
            backend.row_description(&[("count", 20, 0)]).await;
            backend.data_row(&[Some(b"0")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let err = conn.simple_query("COPY copytest FROM STDIN").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)));

    // the connection remains usable and the table unchanged
    let results = conn.simple_query("SELECT count(*) FROM copytest").await.unwrap();
    assert_eq!(results[0].rows[0].get(0).unwrap(), PgValue::Int8(0));
    handle.await.unwrap();
}

#[tokio::test]
async fn copy_out_through_query_facade_is_drained_and_refused() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.copy_out_response(1).await;
            backend.send(b'd', b"row\n").await;
            backend.send(b'c', &[]).await;
            backend.command_complete("COPY 1").await;
            backend.ready(b'I').await;

            backend.expect(b'Q').await;
            backend.command_complete("SELECT 0").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let err = conn.simple_query("COPY copytest TO STDOUT").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)));

    conn.simple_query("SELECT 1 WHERE false").await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn non_copy_statement_through_copy_facade_is_refused() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend.row_description(&[("one", 23, 0)]).await;
            backend.data_row(&[Some(b"1")]).await;
            backend.command_complete("SELECT 1").await;
            backend.ready(b'I').await;

            backend.expect(b'Q').await;
            backend.command_complete("SELECT 0").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let err = conn.copy_in("SELECT 1").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::State(_)));

    conn.simple_query("SELECT 1 WHERE false").await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn copy_syntax_error_surfaces_sqlstate_and_recovers() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            backend
                .error_response("42601", "syntax error at or near \"xxx\"")
                .await;
            backend.ready(b'E').await;

            backend.expect(b'Q').await;
            backend.command_complete("ROLLBACK").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let err = conn
        .copy_in("COPY copytest FROM STDIN with xxx (FORMAT CSV)")
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("42601"));

    conn.simple_query("ROLLBACK").await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    handle.await.unwrap();
}

// ===== failure modes =====

#[tokio::test]
async fn oversized_message_poisons_the_connection() {
    let (mut conn, handle) = connected(Config::default().max_message_size(64), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            // length field far beyond the configured bound
            let mut buf = BytesMut::new();
            buf.put_u8(b'D');
            buf.put_i32(1 << 20);
            backend.io.write_all(&buf).await.unwrap();
        })
    })
    .await;

    let err = conn.simple_query("SELECT repeat('x', 100000)").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
    assert!(err.is_fatal());

    // poisoned permanently: 08003-class state error on further use
    let err = conn.simple_query("SELECT 1 WHERE false").await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("08003"));
    handle.await.unwrap();
}

#[tokio::test]
async fn peer_disconnect_surfaces_transport_error() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;
            backend.expect(b'Q').await;
            // drop the transport mid-cycle
        })
    })
    .await;

    let err = conn.simple_query("SELECT pg_sleep(10)").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Io(_)));
    assert_eq!(err.sqlstate(), Some("08006"));
    handle.await.unwrap();
}

#[tokio::test]
async fn notices_reach_the_observer_and_are_not_errors() {
    let (mut conn, handle) = connected(Config::default(), |mut backend| {
        tokio::spawn(async move {
            backend.accept_startup().await;
            backend.finish_startup().await;

            backend.expect(b'Q').await;
            let mut body = BytesMut::new();
            body.put_u8(b'S');
            put_cstr(&mut body, "NOTICE");
            body.put_u8(b'C');
            put_cstr(&mut body, "00000");
            body.put_u8(b'M');
            put_cstr(&mut body, "table \"t\" does not exist, skipping");
            body.put_u8(0);
            backend.send(b'N', &body).await;
            backend.command_complete("DROP TABLE").await;
            backend.ready(b'I').await;
        })
    })
    .await;

    let notices = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = notices.clone();
    conn.set_notice_handler(move |notice| {
        sink.lock().unwrap().push(notice.message().to_owned());
    });

    conn.simple_query("DROP TABLE IF EXISTS t").await.unwrap();
    assert_eq!(
        notices.lock().unwrap().as_slice(),
        &["table \"t\" does not exist, skipping".to_owned()],
    );
    handle.await.unwrap();
}
