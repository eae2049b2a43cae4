//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use super::{Oid, PgFormat};
use crate::ext::{BufMutExt, StrExt, UsizeExt};

/// write a frontend message to `buf`
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "[BUG] Frontend Message body not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
///
/// Thus, [`Startup`] and [`CancelRequest`] do not implement [`FrontendProtocol`]
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of main body as oppose of actual postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    ///
    /// `buf` have the length returned from `size_hint`
    ///
    /// writing less or past length results in panic
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Additional run-time parameters applied at backend start, as session defaults.
    pub params: &'a [(String, String)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        // Int32(196608)
        // The protocol version number.
        // The most significant 16 bits are the major version number (3 for the protocol described here).
        // The least significant 16 bits are the minor version number (0 for the protocol described here).
        buf.put_i32(196608);

        // The protocol version number is followed by one or more pairs of parameter name and value strings.

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        for (name, value) in self.params {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length
        let len = (buf.len() - offset).to_i32();
        let mut written_buf = &mut buf[offset..];
        written_buf.put_i32(len);
    }
}

/// Cancel request, sent over a separately opened transport.
///
/// This message has no type byte; the magic code 80877102 takes the place
/// of the protocol version. No response is expected; the server simply
/// closes the side channel.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: i32,
    /// The secret key for the target backend.
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(80877102);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Identifies the message as a password response.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Authentication response carrying raw mechanism bytes, produced by an
/// authentication plugin (SASL and friends share the `p` type byte).
#[derive(Debug)]
pub struct AuthenticationResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for AuthenticationResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a simple query
#[derive(Debug)]
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
#[derive(Debug)]
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the
    /// query string, only the number that the frontend wants to prespecify types for.
    pub oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + (self.oids.len() as i32 * 4)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_i16(self.oids.len().to_u16() as i16);
        for oid in self.oids {
            buf.put_u32(*oid);
        }
    }
}

/// A parameter value carried by [`Bind`], already encoded for the wire.
#[derive(Debug, Clone)]
pub struct BindValue {
    /// The format the value bytes are encoded in.
    pub format: PgFormat,
    /// The encoded value; `None` binds SQL NULL (wire length -1).
    pub value: Option<bytes::Bytes>,
}

/// Identifies the message as a Bind command.
#[derive(Debug)]
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// The parameter values with their format codes.
    ///
    /// The number of values must match the number of parameters needed by the query.
    pub params: &'a [BindValue],
    /// The result-column format codes.
    ///
    /// Can be empty to indicate that the result columns should all use the default
    /// format (text); or one, in which case the specified format code is applied to all
    /// result columns (if any); or it can equal the actual number of result columns.
    pub result_formats: &'a [PgFormat],
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            // param format code count (i16) + codes (i16 each)
            + 2 + (self.params.len() as i32 * 2)
            // param count (i16)
            + 2
            // Int32 length + value bytes per parameter; -1 NULL carries no bytes
            + self.params.iter().fold(0i32, |acc, p| {
                acc + 4 + p.value.as_ref().map_or(0, |v| v.len().to_i32())
            })
            // result format code count (i16) + codes (i16 each)
            + 2 + (self.result_formats.len() as i32 * 2)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            buf.put_u16(param.format.format_code());
        }

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            // The length of the parameter value, in bytes (this count does not include
            // itself). As a special case, -1 indicates a NULL parameter value.
            match &param.value {
                Some(value) => {
                    buf.put_i32(value.len().to_i32());
                    buf.put_slice(value);
                }
                None => buf.put_i32(-1),
            }
        }

        buf.put_u16(self.result_formats.len().to_u16());
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as an Execute command
#[derive(Debug)]
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes "no limit".
    pub max_row: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_i32(self.max_row);
    }
}

/// Identifies the message as a Close command
#[derive(Debug)]
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// COPY data transfer, frontend to backend.
#[derive(Debug)]
pub struct CopyData<'a> {
    /// Data that forms part of a COPY data stream. Messages sent from the backend
    /// will always correspond to single data rows, but messages sent by frontends
    /// might divide the data stream arbitrarily.
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY-complete indicator.
#[derive(Debug)]
pub struct CopyDone;

impl FrontendProtocol for CopyDone {
    const MSGTYPE: u8 = b'c';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a COPY-failure indicator.
///
/// The backend responds with an ErrorResponse and discards the copied data.
#[derive(Debug)]
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> i32 {
        self.message.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.message);
    }
}

/// Identifies the message as a Sync command
#[derive(Debug)]
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Flush command
#[derive(Debug)]
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a termination
#[derive(Debug)]
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_write_matches_size_hint() {
        let mut buf = BytesMut::new();
        write(Query { sql: "SELECT 1" }, &mut buf);
        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len, buf.len() - 1);
        assert_eq!(&buf[5..], b"SELECT 1\0");
    }

    #[test]
    fn startup_has_no_type_byte_and_self_length() {
        let mut buf = BytesMut::new();
        Startup { user: "alice", database: Some("db"), params: &[] }.write(&mut buf);
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len());
        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, 196608);
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn cancel_request_is_sixteen_bytes() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 42, secret_key: 7 }.write(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..4], &16i32.to_be_bytes());
        assert_eq!(&buf[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&buf[8..12], &42i32.to_be_bytes());
        assert_eq!(&buf[12..16], &7i32.to_be_bytes());
    }

    #[test]
    fn bind_encodes_null_as_negative_length() {
        let mut buf = BytesMut::new();
        let params = [
            BindValue { format: PgFormat::Text, value: Some(bytes::Bytes::from_static(b"14")) },
            BindValue { format: PgFormat::Text, value: None },
        ];
        write(
            Bind { portal_name: "", stmt_name: "s1", params: &params, result_formats: &[] },
            &mut buf,
        );
        assert_eq!(buf[0], b'B');
        // portal "" nul, "s1" nul, 2 format codes, 2 values, no result formats
        let body = &buf[5..];
        assert_eq!(&body[..1], b"\0");
        assert_eq!(&body[1..4], b"s1\0");
        // formats: count 2, text text
        assert_eq!(&body[4..10], &[0, 2, 0, 0, 0, 0]);
        // values: count 2, len 2 "14", len -1
        assert_eq!(&body[10..12], &[0, 2]);
        assert_eq!(&body[12..16], &2i32.to_be_bytes());
        assert_eq!(&body[16..18], b"14");
        assert_eq!(&body[18..22], &(-1i32).to_be_bytes());
    }

    #[test]
    fn copy_messages() {
        let mut buf = BytesMut::new();
        write(CopyData { data: b"a\tb\n" }, &mut buf);
        assert_eq!(buf[0], b'd');
        assert_eq!(&buf[5..], b"a\tb\n");

        let mut buf = BytesMut::new();
        write(CopyDone, &mut buf);
        assert_eq!(&buf[..], &[b'c', 0, 0, 0, 4]);

        let mut buf = BytesMut::new();
        write(CopyFail { message: "abort" }, &mut buf);
        assert_eq!(buf[0], b'f');
        assert_eq!(&buf[5..], b"abort\0");
    }
}
