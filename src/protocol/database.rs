//! Decoded server error and notice reports.
use std::fmt;

use bytes::{Buf, Bytes};

use crate::common::ByteStr;

/// A decoded `ErrorResponse` or `NoticeResponse` report.
///
/// The wire body is one or more identified fields, each a code byte followed
/// by a nul-terminated string, ending with a zero byte. Unrecognized field
/// codes are silently ignored.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Default, Clone)]
pub struct DatabaseError {
    severity: Option<ByteStr>,
    severity_nonlocalized: Option<ByteStr>,
    code: Option<ByteStr>,
    message: Option<ByteStr>,
    detail: Option<ByteStr>,
    hint: Option<ByteStr>,
    position: Option<u32>,
    internal_position: Option<u32>,
    internal_query: Option<ByteStr>,
    where_: Option<ByteStr>,
    schema: Option<ByteStr>,
    table: Option<ByteStr>,
    column: Option<ByteStr>,
    datatype: Option<ByteStr>,
    constraint: Option<ByteStr>,
    file: Option<ByteStr>,
    line: Option<ByteStr>,
    routine: Option<ByteStr>,
}

impl DatabaseError {
    /// Decode the field list of an `ErrorResponse`/`NoticeResponse` body.
    ///
    /// Total: a malformed trailer never yields a partial error report; fields
    /// decoded so far are kept and the walk stops at the first violation.
    pub fn parse(mut body: Bytes) -> DatabaseError {
        let mut me = DatabaseError::default();

        while body.has_remaining() {
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let Ok(value) = ByteStr::read_nul(&mut body) else {
                break;
            };
            match field {
                b'S' => me.severity = Some(value),
                b'V' => me.severity_nonlocalized = Some(value),
                b'C' => me.code = Some(value),
                b'M' => me.message = Some(value),
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = value.parse().ok(),
                b'p' => me.internal_position = value.parse().ok(),
                b'q' => me.internal_query = Some(value),
                b'W' => me.where_ = Some(value),
                b's' => me.schema = Some(value),
                b't' => me.table = Some(value),
                b'c' => me.column = Some(value),
                b'd' => me.datatype = Some(value),
                b'n' => me.constraint = Some(value),
                b'F' => me.file = Some(value),
                b'L' => me.line = Some(value),
                b'R' => me.routine = Some(value),
                // frontends should silently ignore fields of unrecognized type
                _ => {}
            }
        }

        me
    }

    /// Severity: ERROR, FATAL, PANIC, or a localized translation, for errors;
    /// WARNING, NOTICE, DEBUG, INFO, or LOG for notices.
    pub fn severity(&self) -> &str {
        self.severity_nonlocalized
            .as_deref()
            .or(self.severity.as_deref())
            .unwrap_or("ERROR")
    }

    /// The SQLSTATE code for the error. Always present in server reports.
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or("")
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Secondary message carrying more detail, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Suggestion what to do about the problem, if any.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Error cursor position as an index into the original query string,
    /// measured in characters, first character being 1.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// Error cursor position within [`internal_query`](Self::internal_query).
    pub fn internal_position(&self) -> Option<u32> {
        self.internal_position
    }

    /// The text of a failed internally-generated command.
    pub fn internal_query(&self) -> Option<&str> {
        self.internal_query.as_deref()
    }

    /// Context in which the error occurred (call stack traceback).
    pub fn where_context(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn datatype(&self) -> Option<&str> {
        self.datatype.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// Source file, line and routine reported by the server, for bug reports.
    pub fn source_location(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.file.as_deref()?,
            self.line.as_deref()?,
            self.routine.as_deref()?,
        ))
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if !self.code().is_empty() {
            write!(f, " (SQLSTATE {})", self.code())?;
        }
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        if let Some(position) = self.position() {
            write!(f, "\nPOSITION: {position}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn body(fields: &[(u8, &str)]) -> Bytes {
        let mut buf = BytesMut::new();
        for (code, value) in fields {
            buf.put_u8(*code);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn parses_common_fields() {
        let err = DatabaseError::parse(body(&[
            (b'S', "ERROR"),
            (b'V', "ERROR"),
            (b'C', "42601"),
            (b'M', "syntax error at or near \"xxx\""),
            (b'P', "27"),
        ]));
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42601");
        assert_eq!(err.message(), "syntax error at or near \"xxx\"");
        assert_eq!(err.position(), Some(27));
        assert!(err.detail().is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let err = DatabaseError::parse(body(&[
            (b'C', "0A000"),
            (b'Z', "future field"),
            (b'M', "not supported"),
        ]));
        assert_eq!(err.code(), "0A000");
        assert_eq!(err.message(), "not supported");
    }

    #[test]
    fn display_carries_sqlstate() {
        let err = DatabaseError::parse(body(&[(b'C', "23505"), (b'M', "duplicate key")]));
        let text = err.to_string();
        assert!(text.contains("23505"));
        assert!(text.contains("duplicate key"));
    }
}
