//! Postgres row operation.
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::common::ByteStr;
use crate::protocol::{backend, Oid, PgFormat, ProtocolError};
use crate::types::{CodecError, PgValue, TypeRegistry};

/// One column of a [`RowDescription`].
#[derive(Debug, Clone)]
pub struct ColumnDesc {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub column_attr: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see `pg_type.typlen`). Negative values denote
    /// variable-width types.
    pub type_size: i16,
    /// The type modifier (see `pg_attribute.atttypmod`).
    pub type_modifier: i32,
    /// The format code being used for the field. In a RowDescription returned
    /// from the statement variant of Describe, the format code is not yet
    /// known and will always be zero.
    pub format: PgFormat,
}

/// Ordered column descriptors of a result set.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    columns: Vec<ColumnDesc>,
}

impl RowDescription {
    /// Parse the wire body of a RowDescription message.
    pub fn parse(msg: backend::RowDescription) -> Result<Self, ProtocolError> {
        let mut body = msg.body;
        let count = msg.field_len.max(0) as usize;
        let mut columns = Vec::with_capacity(count);

        for _ in 0..count {
            let name = ByteStr::read_nul(&mut body)?;
            if body.remaining() < 18 {
                return Err(ProtocolError::malformed("RowDescription field truncated"));
            }
            columns.push(ColumnDesc {
                name,
                table_oid: body.get_u32(),
                column_attr: body.get_i16(),
                type_oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: PgFormat::from_code(body.get_i16())?,
            });
        }

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of the column named `name`, if any.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == *name)
    }
}

/// One result row, decoded on demand against its [`RowDescription`].
pub struct Row {
    desc: Arc<RowDescription>,
    registry: Arc<TypeRegistry>,
    fields: Vec<Option<Bytes>>,
}

impl Row {
    /// Slice the length-prefixed fields of a DataRow body.
    pub(crate) fn parse(
        msg: backend::DataRow,
        desc: Arc<RowDescription>,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self, ProtocolError> {
        let mut body = msg.body;
        let count = msg.field_len.max(0) as usize;
        let mut fields = Vec::with_capacity(count);

        for _ in 0..count {
            if body.remaining() < 4 {
                return Err(ProtocolError::malformed("DataRow field truncated"));
            }
            let len = body.get_i32();
            if len < 0 {
                fields.push(None);
                continue;
            }
            let len = len as usize;
            if body.remaining() < len {
                return Err(ProtocolError::malformed("DataRow value truncated"));
            }
            fields.push(Some(body.split_to(len)));
        }

        Ok(Self { desc, registry, fields })
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        self.desc.columns()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Raw field bytes, `None` for NULL.
    pub fn raw(&self, index: usize) -> Result<Option<&Bytes>, DecodeError> {
        self.fields
            .get(index)
            .map(Option::as_ref)
            .ok_or_else(|| DecodeError::column_index(index, self.fields.len()))
    }

    /// Decode the field at `index` through the type registry.
    pub fn get(&self, index: usize) -> Result<PgValue, DecodeError> {
        let column = self
            .desc
            .columns()
            .get(index)
            .ok_or_else(|| DecodeError::column_index(index, self.fields.len()))?;
        match self.raw(index)? {
            None => Ok(PgValue::Null),
            Some(data) => self
                .registry
                .decode(column.type_oid, column.format, data)
                .map_err(DecodeError::Codec),
        }
    }

    /// Decode the field of the column named `name`.
    pub fn get_by_name(&self, name: &str) -> Result<PgValue, DecodeError> {
        let index = self
            .desc
            .position(name)
            .ok_or_else(|| DecodeError::ColumnNotFound(Cow::Owned(name.to_owned())))?;
        self.get(index)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (column, field) in self.desc.columns().iter().zip(&self.fields) {
            dbg.key(&column.name.as_str());
            match field {
                Some(data) => dbg.value(&String::from_utf8_lossy(data)),
                None => dbg.value(&"NULL"),
            };
        }
        dbg.finish()
    }
}

/// An error when accessing or decoding a row value.
#[derive(Debug)]
pub enum DecodeError {
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// A registered codec refused the field bytes.
    Codec(CodecError),
}

impl DecodeError {
    fn column_index(index: usize, len: usize) -> Self {
        Self::ColumnNotFound(Cow::Owned(format!("#{index} of {len}")))
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Failed to decode value, ")?;
        match self {
            DecodeError::ColumnNotFound(name) => write!(f, "column not found: {name}"),
            DecodeError::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl From<CodecError> for DecodeError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use crate::protocol::{oid, BackendProtocol};

    fn row_description(columns: &[(&str, Oid, u16)]) -> RowDescription {
        let mut body = BytesMut::new();
        for (name, oid, format) in columns {
            body.put_slice(name.as_bytes());
            body.put_u8(0);
            body.put_u32(0); // table oid
            body.put_i16(0); // attribute number
            body.put_u32(*oid);
            body.put_i16(-1); // type size
            body.put_i32(-1); // type modifier
            body.put_u16(*format);
        }
        let mut full = BytesMut::new();
        full.put_i16(columns.len() as i16);
        full.unsplit(body);
        let msg = backend::RowDescription::decode(b'T', full.freeze()).unwrap();
        RowDescription::parse(msg).unwrap()
    }

    fn data_row(fields: &[Option<&[u8]>]) -> backend::DataRow {
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
        backend::DataRow::decode(b'D', body.freeze()).unwrap()
    }

    #[test]
    fn decodes_fields_against_description() {
        let desc = Arc::new(row_description(&[
            ("s", oid::TEXT, 0),
            ("i", oid::INT4, 0),
            ("missing", oid::INT4, 0),
        ]));
        let registry = Arc::new(TypeRegistry::new());
        let row = Row::parse(
            data_row(&[Some(b"First Row"), Some(b"42"), None]),
            desc,
            registry,
        )
        .unwrap();

        assert_eq!(row.get(0).unwrap(), PgValue::Text("First Row".into()));
        assert_eq!(row.get(1).unwrap(), PgValue::Int4(42));
        assert_eq!(row.get(2).unwrap(), PgValue::Null);
        assert_eq!(row.get_by_name("i").unwrap(), PgValue::Int4(42));
        assert!(row.get_by_name("nope").is_err());
        assert!(row.get(3).is_err());
    }

    #[test]
    fn binary_format_column_decodes_binary() {
        let desc = Arc::new(row_description(&[("n", oid::INT8, 1)]));
        let registry = Arc::new(TypeRegistry::new());
        let wire = 7_000_000_000i64.to_be_bytes();
        let row = Row::parse(data_row(&[Some(&wire)]), desc, registry).unwrap();
        assert_eq!(row.get(0).unwrap(), PgValue::Int8(7_000_000_000));
    }

    #[test]
    fn codec_refusal_does_not_panic() {
        let desc = Arc::new(row_description(&[("i", oid::INT4, 1)]));
        let registry = Arc::new(TypeRegistry::new());
        let row = Row::parse(data_row(&[Some(b"xyz")]), desc, registry).unwrap();
        assert!(matches!(row.get(0), Err(DecodeError::Codec(_))));
    }
}
