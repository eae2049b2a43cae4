//! Type registry and value codecs.
//!
//! The registry is a table keyed by type oid; each entry carries up to four
//! codec functions, one per direction and format. It is consulted by
//! `(oid, format)`: a missing function falls back to surfacing the raw bytes
//! with their metadata, so unknown server types never fail a row by
//! themselves.
pub mod array;
pub mod datetime;
pub mod numeric;

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

pub use array::{ArrayDimension, PgArray};
pub use datetime::PgInterval;
pub use numeric::{NumericSign, PgNumeric};

use crate::protocol::{oid, Oid, PgFormat};

/// A registered codec refused bytes, or no codec fit.
///
/// Never fatal: the affected row or parameter fails, the connection is
/// undamaged.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{what}: expected {expected} bytes, got {got}")]
    Length { what: &'static str, expected: usize, got: usize },

    #[error("{what}: invalid value: {detail}")]
    Invalid { what: &'static str, detail: String },

    /// Specialization for the temporal engine.
    #[error("temporal decode: {0}")]
    Temporal(&'static str),

    #[error("cannot encode {value:?} value as oid {oid}")]
    TypeMismatch { value: &'static str, oid: Oid },
}

impl CodecError {
    pub(crate) fn length(what: &'static str, expected: usize, got: usize) -> Self {
        Self::Length { what, expected, got }
    }

    pub(crate) fn invalid(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Invalid { what, detail: detail.into() }
    }

    pub(crate) fn temporal(reason: &'static str) -> Self {
        Self::Temporal(reason)
    }

    fn mismatch(value: &PgValue, oid: Oid) -> Self {
        Self::TypeMismatch { value: value.kind_name(), oid }
    }
}

/// A host-level logical value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Numeric(PgNumeric),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Time of day with a fixed offset, seconds east of Greenwich.
    TimeTz { time: NaiveTime, offset_secs: i32 },
    /// Local wall-clock; becomes an instant only against a caller zone.
    Timestamp(NaiveDateTime),
    /// Absolute instant.
    TimestampTz(DateTime<Utc>),
    Interval(PgInterval),
    Array(PgArray),
    /// Bytes of a type with no registered codec, kept with their metadata.
    Raw { oid: Oid, format: PgFormat, data: Bytes },
}

impl PgValue {
    /// The oid this value binds as, used when declaring parameter types.
    /// `Null` and `Raw` with oid zero leave the type for the server to infer.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => 0,
            PgValue::Bool(_) => oid::BOOL,
            PgValue::Int2(_) => oid::INT2,
            PgValue::Int4(_) => oid::INT4,
            PgValue::Int8(_) => oid::INT8,
            PgValue::Float4(_) => oid::FLOAT4,
            PgValue::Float8(_) => oid::FLOAT8,
            PgValue::Text(_) => oid::TEXT,
            PgValue::Bytea(_) => oid::BYTEA,
            PgValue::Numeric(_) => oid::NUMERIC,
            PgValue::Date(_) => oid::DATE,
            PgValue::Time(_) => oid::TIME,
            PgValue::TimeTz { .. } => oid::TIMETZ,
            PgValue::Timestamp(_) => oid::TIMESTAMP,
            PgValue::TimestampTz(_) => oid::TIMESTAMPTZ,
            PgValue::Interval(_) => oid::INTERVAL,
            PgValue::Array(array) => match array.element_oid {
                oid::BOOL => oid::BOOL_ARRAY,
                oid::INT2 => oid::INT2_ARRAY,
                oid::INT4 => oid::INT4_ARRAY,
                oid::INT8 => oid::INT8_ARRAY,
                oid::TEXT => oid::TEXT_ARRAY,
                oid::FLOAT4 => oid::FLOAT4_ARRAY,
                oid::FLOAT8 => oid::FLOAT8_ARRAY,
                oid::NUMERIC => oid::NUMERIC_ARRAY,
                _ => 0,
            },
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    fn kind_name(&self) -> &'static str {
        match self {
            PgValue::Null => "null",
            PgValue::Bool(_) => "bool",
            PgValue::Int2(_) => "int2",
            PgValue::Int4(_) => "int4",
            PgValue::Int8(_) => "int8",
            PgValue::Float4(_) => "float4",
            PgValue::Float8(_) => "float8",
            PgValue::Text(_) => "text",
            PgValue::Bytea(_) => "bytea",
            PgValue::Numeric(_) => "numeric",
            PgValue::Date(_) => "date",
            PgValue::Time(_) => "time",
            PgValue::TimeTz { .. } => "timetz",
            PgValue::Timestamp(_) => "timestamp",
            PgValue::TimestampTz(_) => "timestamptz",
            PgValue::Interval(_) => "interval",
            PgValue::Array(_) => "array",
            PgValue::Raw { .. } => "raw",
        }
    }
}

type DecodeFn = fn(&[u8]) -> Result<PgValue, CodecError>;
type EncodeFn = fn(&PgValue, &mut BytesMut) -> Result<(), CodecError>;

/// Codec capability set for one type oid. Any function may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeCodec {
    pub decode_text: Option<DecodeFn>,
    pub encode_text: Option<EncodeFn>,
    pub decode_binary: Option<DecodeFn>,
    pub encode_binary: Option<EncodeFn>,
}

/// Codec table keyed by oid.
///
/// Immutable after the connection handshake; the adapter may share one
/// registry across connections.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    codecs: HashMap<Oid, TypeCodec>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// A registry with every built-in codec registered.
    pub fn new() -> Self {
        let mut me = Self { codecs: HashMap::new() };

        me.register(oid::BOOL, TypeCodec {
            decode_text: Some(scalar::bool_decode_text),
            encode_text: Some(scalar::bool_encode_text),
            decode_binary: Some(scalar::bool_decode_binary),
            encode_binary: Some(scalar::bool_encode_binary),
        });
        me.register(oid::INT2, TypeCodec {
            decode_text: Some(scalar::int2_decode_text),
            encode_text: Some(scalar::int_encode_text),
            decode_binary: Some(scalar::int2_decode_binary),
            encode_binary: Some(scalar::int2_encode_binary),
        });
        me.register(oid::INT4, TypeCodec {
            decode_text: Some(scalar::int4_decode_text),
            encode_text: Some(scalar::int_encode_text),
            decode_binary: Some(scalar::int4_decode_binary),
            encode_binary: Some(scalar::int4_encode_binary),
        });
        me.register(oid::INT8, TypeCodec {
            decode_text: Some(scalar::int8_decode_text),
            encode_text: Some(scalar::int_encode_text),
            decode_binary: Some(scalar::int8_decode_binary),
            encode_binary: Some(scalar::int8_encode_binary),
        });
        me.register(oid::FLOAT4, TypeCodec {
            decode_text: Some(scalar::float4_decode_text),
            encode_text: Some(scalar::float_encode_text),
            decode_binary: Some(scalar::float4_decode_binary),
            encode_binary: Some(scalar::float4_encode_binary),
        });
        me.register(oid::FLOAT8, TypeCodec {
            decode_text: Some(scalar::float8_decode_text),
            encode_text: Some(scalar::float_encode_text),
            decode_binary: Some(scalar::float8_decode_binary),
            encode_binary: Some(scalar::float8_encode_binary),
        });

        let text = TypeCodec {
            decode_text: Some(scalar::text_decode),
            encode_text: Some(scalar::text_encode),
            decode_binary: Some(scalar::text_decode),
            encode_binary: Some(scalar::text_encode),
        };
        for oid in [oid::TEXT, oid::VARCHAR, oid::BPCHAR, oid::NAME, oid::CHAR] {
            me.register(oid, text);
        }

        me.register(oid::BYTEA, TypeCodec {
            decode_text: Some(scalar::bytea_decode_text),
            encode_text: Some(scalar::bytea_encode_text),
            decode_binary: Some(scalar::bytea_decode_binary),
            encode_binary: Some(scalar::bytea_encode_binary),
        });
        me.register(oid::NUMERIC, TypeCodec {
            decode_text: Some(scalar::numeric_decode_text),
            encode_text: Some(scalar::numeric_encode_text),
            decode_binary: Some(scalar::numeric_decode_binary),
            encode_binary: Some(scalar::numeric_encode_binary),
        });

        me.register(oid::DATE, TypeCodec {
            decode_text: Some(temporal::date_decode_text),
            encode_text: Some(temporal::date_encode_text),
            decode_binary: Some(temporal::date_decode_binary),
            encode_binary: Some(temporal::date_encode_binary),
        });
        me.register(oid::TIME, TypeCodec {
            decode_text: Some(temporal::time_decode_text),
            encode_text: Some(temporal::time_encode_text),
            decode_binary: Some(temporal::time_decode_binary),
            encode_binary: Some(temporal::time_encode_binary),
        });
        me.register(oid::TIMETZ, TypeCodec {
            decode_text: Some(temporal::timetz_decode_text),
            encode_text: Some(temporal::timetz_encode_text),
            decode_binary: Some(temporal::timetz_decode_binary),
            encode_binary: Some(temporal::timetz_encode_binary),
        });
        me.register(oid::TIMESTAMP, TypeCodec {
            decode_text: Some(temporal::timestamp_decode_text),
            encode_text: Some(temporal::timestamp_encode_text),
            decode_binary: Some(temporal::timestamp_decode_binary),
            encode_binary: Some(temporal::timestamp_encode_binary),
        });
        me.register(oid::TIMESTAMPTZ, TypeCodec {
            decode_text: Some(temporal::timestamptz_decode_text),
            encode_text: Some(temporal::timestamptz_encode_text),
            decode_binary: Some(temporal::timestamptz_decode_binary),
            encode_binary: Some(temporal::timestamptz_encode_binary),
        });
        me.register(oid::INTERVAL, TypeCodec {
            decode_text: Some(temporal::interval_decode_text),
            encode_text: Some(temporal::interval_encode_text),
            decode_binary: Some(temporal::interval_decode_binary),
            encode_binary: Some(temporal::interval_encode_binary),
        });

        me
    }

    /// Register or replace the codec set for `oid`.
    pub fn register(&mut self, oid: Oid, codec: TypeCodec) {
        self.codecs.insert(oid, codec);
    }

    pub fn get(&self, oid: Oid) -> Option<&TypeCodec> {
        self.codecs.get(&oid)
    }

    /// Whether binary transfer is possible for `oid` in both directions.
    pub fn supports_binary(&self, oid: Oid) -> bool {
        if let Some(element) = oid::array_element(oid) {
            return self.supports_binary(element);
        }
        self.codecs
            .get(&oid)
            .is_some_and(|c| c.decode_binary.is_some() && c.encode_binary.is_some())
    }

    /// Decode a field by `(oid, format)`. A missing codec surfaces the raw
    /// bytes plus metadata; higher layers may refuse.
    pub fn decode(&self, oid: Oid, format: PgFormat, data: &Bytes) -> Result<PgValue, CodecError> {
        if format == PgFormat::Binary {
            if let Some(element_oid) = oid::array_element(oid) {
                if let Some(decode) = self.get(element_oid).and_then(|c| c.decode_binary) {
                    let array = array::decode_binary(data, |_, bytes| decode(bytes))?;
                    return Ok(PgValue::Array(array));
                }
            }
        }

        let codec = self.codecs.get(&oid);
        let decode = match format {
            PgFormat::Text => codec.and_then(|c| c.decode_text),
            PgFormat::Binary => codec.and_then(|c| c.decode_binary),
        };
        match decode {
            Some(decode) => decode(data),
            None => Ok(PgValue::Raw { oid, format, data: data.clone() }),
        }
    }

    /// Encode `value` in `format` into `buf`.
    pub fn encode(
        &self,
        value: &PgValue,
        format: PgFormat,
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if let PgValue::Raw { data, .. } = value {
            buf.put_slice(data);
            return Ok(());
        }
        if let PgValue::Array(array) = value {
            if format == PgFormat::Binary {
                let encode = self
                    .get(array.element_oid)
                    .and_then(|c| c.encode_binary)
                    .ok_or_else(|| CodecError::mismatch(value, array.element_oid))?;
                return array::encode_binary(array, buf, |value, buf| encode(value, buf));
            }
            return Err(CodecError::mismatch(value, value.type_oid()));
        }

        let oid = value.type_oid();
        let codec = self.codecs.get(&oid);
        let encode = match format {
            PgFormat::Text => codec.and_then(|c| c.encode_text),
            PgFormat::Binary => codec.and_then(|c| c.encode_binary),
        };
        let encode = encode.ok_or_else(|| CodecError::mismatch(value, oid))?;
        encode(value, buf)
    }
}

mod scalar {
    use super::*;

    fn utf8<'a>(data: &'a [u8], what: &'static str) -> Result<&'a str, CodecError> {
        std::str::from_utf8(data)
            .map_err(|e| CodecError::invalid(what, e.to_string()))
    }

    fn exact<const N: usize>(data: &[u8], what: &'static str) -> Result<[u8; N], CodecError> {
        data.try_into()
            .map_err(|_| CodecError::length(what, N, data.len()))
    }

    pub fn bool_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        match data {
            b"t" | b"true" | b"1" | b"yes" | b"on" => Ok(PgValue::Bool(true)),
            b"f" | b"false" | b"0" | b"no" | b"off" => Ok(PgValue::Bool(false)),
            other => Err(CodecError::invalid(
                "bool",
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    pub fn bool_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Bool(true) => buf.put_u8(b't'),
            PgValue::Bool(false) => buf.put_u8(b'f'),
            other => return Err(CodecError::mismatch(other, oid::BOOL)),
        }
        Ok(())
    }

    pub fn bool_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        let [byte] = exact::<1>(data, "bool")?;
        Ok(PgValue::Bool(byte != 0))
    }

    pub fn bool_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Bool(v) => buf.put_u8(*v as u8),
            other => return Err(CodecError::mismatch(other, oid::BOOL)),
        }
        Ok(())
    }

    macro_rules! int_codec {
        ($decode_text:ident, $decode_binary:ident, $encode_binary:ident, $ty:ty, $variant:ident, $oid:expr, $name:literal) => {
            pub fn $decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
                utf8(data, $name)?
                    .trim()
                    .parse::<$ty>()
                    .map(PgValue::$variant)
                    .map_err(|e| CodecError::invalid($name, e.to_string()))
            }

            pub fn $decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
                Ok(PgValue::$variant(<$ty>::from_be_bytes(exact(data, $name)?)))
            }

            pub fn $encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
                match value {
                    PgValue::$variant(v) => buf.put_slice(&v.to_be_bytes()),
                    other => return Err(CodecError::mismatch(other, $oid)),
                }
                Ok(())
            }
        };
    }

    int_codec!(int2_decode_text, int2_decode_binary, int2_encode_binary, i16, Int2, oid::INT2, "int2");
    int_codec!(int4_decode_text, int4_decode_binary, int4_encode_binary, i32, Int4, oid::INT4, "int4");
    int_codec!(int8_decode_text, int8_decode_binary, int8_encode_binary, i64, Int8, oid::INT8, "int8");

    pub fn int_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        let mut itoa = itoa::Buffer::new();
        let text = match value {
            PgValue::Int2(v) => itoa.format(*v),
            PgValue::Int4(v) => itoa.format(*v),
            PgValue::Int8(v) => itoa.format(*v),
            other => return Err(CodecError::mismatch(other, other.type_oid())),
        };
        buf.put_slice(text.as_bytes());
        Ok(())
    }

    macro_rules! float_codec {
        ($decode_text:ident, $decode_binary:ident, $encode_binary:ident, $ty:ty, $variant:ident, $oid:expr, $name:literal) => {
            pub fn $decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
                let text = utf8(data, $name)?.trim();
                let value = match text {
                    "NaN" => <$ty>::NAN,
                    "Infinity" => <$ty>::INFINITY,
                    "-Infinity" => <$ty>::NEG_INFINITY,
                    other => other
                        .parse()
                        .map_err(|_| CodecError::invalid($name, other.to_string()))?,
                };
                Ok(PgValue::$variant(value))
            }

            pub fn $decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
                Ok(PgValue::$variant(<$ty>::from_be_bytes(exact(data, $name)?)))
            }

            pub fn $encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
                match value {
                    PgValue::$variant(v) => buf.put_slice(&v.to_be_bytes()),
                    other => return Err(CodecError::mismatch(other, $oid)),
                }
                Ok(())
            }
        };
    }

    float_codec!(float4_decode_text, float4_decode_binary, float4_encode_binary, f32, Float4, oid::FLOAT4, "float4");
    float_codec!(float8_decode_text, float8_decode_binary, float8_encode_binary, f64, Float8, oid::FLOAT8, "float8");

    pub fn float_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        let text = match value {
            PgValue::Float4(v) if v.is_nan() => "NaN".to_string(),
            PgValue::Float4(v) if v.is_infinite() => {
                (if *v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
            }
            PgValue::Float4(v) => v.to_string(),
            PgValue::Float8(v) if v.is_nan() => "NaN".to_string(),
            PgValue::Float8(v) if v.is_infinite() => {
                (if *v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
            }
            PgValue::Float8(v) => v.to_string(),
            other => return Err(CodecError::mismatch(other, other.type_oid())),
        };
        buf.put_slice(text.as_bytes());
        Ok(())
    }

    pub fn text_decode(data: &[u8]) -> Result<PgValue, CodecError> {
        Ok(PgValue::Text(utf8(data, "text")?.to_owned()))
    }

    pub fn text_encode(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Text(v) => buf.put_slice(v.as_bytes()),
            other => return Err(CodecError::mismatch(other, oid::TEXT)),
        }
        Ok(())
    }

    /// The text decoder accepts both output forms: `\x` hex and the legacy
    /// octal-escape format. The encoder emits hex.
    pub fn bytea_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        if let Some(hex) = data.strip_prefix(b"\\x") {
            if hex.len() % 2 != 0 {
                return Err(CodecError::invalid("bytea", "odd hex digit count".to_string()));
            }
            let mut out = Vec::with_capacity(hex.len() / 2);
            for pair in hex.chunks_exact(2) {
                let hi = hex_digit(pair[0])?;
                let lo = hex_digit(pair[1])?;
                out.push(hi << 4 | lo);
            }
            return Ok(PgValue::Bytea(out));
        }

        // escape format: `\\` is a backslash, `\ooo` an octal byte
        let mut out = Vec::with_capacity(data.len());
        let mut bytes = data.iter().copied();
        while let Some(byte) = bytes.next() {
            if byte != b'\\' {
                out.push(byte);
                continue;
            }
            match bytes.next() {
                Some(b'\\') => out.push(b'\\'),
                Some(first @ b'0'..=b'3') => {
                    let (Some(second), Some(third)) = (bytes.next(), bytes.next()) else {
                        return Err(CodecError::invalid("bytea", "truncated octal escape".to_string()));
                    };
                    if !(b'0'..=b'7').contains(&second) || !(b'0'..=b'7').contains(&third) {
                        return Err(CodecError::invalid("bytea", "bad octal escape".to_string()));
                    }
                    out.push((first - b'0') << 6 | (second - b'0') << 3 | (third - b'0'));
                }
                _ => return Err(CodecError::invalid("bytea", "bad escape".to_string())),
            }
        }
        Ok(PgValue::Bytea(out))
    }

    fn hex_digit(byte: u8) -> Result<u8, CodecError> {
        match byte {
            b'0'..=b'9' => Ok(byte - b'0'),
            b'a'..=b'f' => Ok(byte - b'a' + 10),
            b'A'..=b'F' => Ok(byte - b'A' + 10),
            _ => Err(CodecError::invalid("bytea", format!("hex digit {:?}", byte as char))),
        }
    }

    pub fn bytea_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        match value {
            PgValue::Bytea(v) => {
                buf.reserve(2 + v.len() * 2);
                buf.put_slice(b"\\x");
                for byte in v {
                    buf.put_u8(HEX[(byte >> 4) as usize]);
                    buf.put_u8(HEX[(byte & 0xf) as usize]);
                }
            }
            other => return Err(CodecError::mismatch(other, oid::BYTEA)),
        }
        Ok(())
    }

    pub fn bytea_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        Ok(PgValue::Bytea(data.to_vec()))
    }

    pub fn bytea_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Bytea(v) => buf.put_slice(v),
            other => return Err(CodecError::mismatch(other, oid::BYTEA)),
        }
        Ok(())
    }

    pub fn numeric_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        utf8(data, "numeric")?.parse().map(PgValue::Numeric)
    }

    pub fn numeric_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Numeric(v) => buf.put_slice(v.to_string().as_bytes()),
            other => return Err(CodecError::mismatch(other, oid::NUMERIC)),
        }
        Ok(())
    }

    pub fn numeric_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        PgNumeric::decode_binary(data).map(PgValue::Numeric)
    }

    pub fn numeric_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Numeric(v) => {
                v.encode_binary(buf);
                Ok(())
            }
            other => Err(CodecError::mismatch(other, oid::NUMERIC)),
        }
    }
}

mod temporal {
    use super::datetime;
    use super::*;

    fn utf8<'a>(data: &'a [u8], what: &'static str) -> Result<&'a str, CodecError> {
        std::str::from_utf8(data)
            .map_err(|e| CodecError::invalid(what, e.to_string()))
    }

    fn be_i32(data: &[u8], what: &'static str) -> Result<i32, CodecError> {
        let array: [u8; 4] = data
            .try_into()
            .map_err(|_| CodecError::length(what, 4, data.len()))?;
        Ok(i32::from_be_bytes(array))
    }

    fn be_i64(data: &[u8], what: &'static str) -> Result<i64, CodecError> {
        let array: [u8; 8] = data
            .try_into()
            .map_err(|_| CodecError::length(what, 8, data.len()))?;
        Ok(i64::from_be_bytes(array))
    }

    pub fn date_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::date_from_wire(be_i32(data, "date")?).map(PgValue::Date)
    }

    pub fn date_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Date(v) => buf.put_i32(datetime::date_to_wire(v)),
            other => return Err(CodecError::mismatch(other, oid::DATE)),
        }
        Ok(())
    }

    pub fn date_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::parse_date(utf8(data, "date")?).map(PgValue::Date)
    }

    pub fn date_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Date(v) => buf.put_slice(datetime::format_date(v).as_bytes()),
            other => return Err(CodecError::mismatch(other, oid::DATE)),
        }
        Ok(())
    }

    pub fn time_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::time_from_wire(be_i64(data, "time")?).map(PgValue::Time)
    }

    pub fn time_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Time(v) => buf.put_i64(datetime::time_to_wire(v)),
            other => return Err(CodecError::mismatch(other, oid::TIME)),
        }
        Ok(())
    }

    pub fn time_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::parse_time(utf8(data, "time")?).map(PgValue::Time)
    }

    pub fn time_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Time(v) => buf.put_slice(datetime::format_time(v).as_bytes()),
            other => return Err(CodecError::mismatch(other, oid::TIME)),
        }
        Ok(())
    }

    /// The wire zone field counts seconds west of Greenwich, the sign
    /// convention opposite of the tz database; the host value keeps seconds
    /// east.
    pub fn timetz_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        if data.len() != 12 {
            return Err(CodecError::length("timetz", 12, data.len()));
        }
        let time = datetime::time_from_wire(be_i64(&data[..8], "timetz")?)?;
        let west = be_i32(&data[8..], "timetz")?;
        Ok(PgValue::TimeTz { time, offset_secs: -west })
    }

    pub fn timetz_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::TimeTz { time, offset_secs } => {
                buf.put_i64(datetime::time_to_wire(time));
                buf.put_i32(-offset_secs);
            }
            other => return Err(CodecError::mismatch(other, oid::TIMETZ)),
        }
        Ok(())
    }

    pub fn timetz_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        let text = utf8(data, "timetz")?;
        let bad = || CodecError::invalid("timetz", text.to_string());
        let split = text.rfind(['+', '-']).ok_or_else(bad)?;
        let (time, offset) = text.split_at(split);
        Ok(PgValue::TimeTz {
            time: datetime::parse_time(time)?,
            offset_secs: datetime::parse_offset(offset).ok_or_else(bad)?,
        })
    }

    pub fn timetz_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::TimeTz { time, offset_secs } => {
                let sign = if *offset_secs < 0 { '-' } else { '+' };
                let abs = offset_secs.unsigned_abs();
                let mut text = format!(
                    "{}{}{:02}:{:02}",
                    datetime::format_time(time),
                    sign,
                    abs / 3600,
                    abs % 3600 / 60,
                );
                if abs % 60 != 0 {
                    text.push_str(&format!(":{:02}", abs % 60));
                }
                buf.put_slice(text.as_bytes());
            }
            other => return Err(CodecError::mismatch(other, oid::TIMETZ)),
        }
        Ok(())
    }

    pub fn timestamp_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::timestamp_from_wire(be_i64(data, "timestamp")?).map(PgValue::Timestamp)
    }

    pub fn timestamp_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Timestamp(v) => buf.put_i64(datetime::timestamp_to_wire(v)),
            other => return Err(CodecError::mismatch(other, oid::TIMESTAMP)),
        }
        Ok(())
    }

    pub fn timestamp_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::parse_timestamp(utf8(data, "timestamp")?).map(PgValue::Timestamp)
    }

    pub fn timestamp_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Timestamp(v) => buf.put_slice(datetime::format_timestamp(v).as_bytes()),
            other => return Err(CodecError::mismatch(other, oid::TIMESTAMP)),
        }
        Ok(())
    }

    pub fn timestamptz_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::timestamptz_from_wire(be_i64(data, "timestamptz")?).map(PgValue::TimestampTz)
    }

    pub fn timestamptz_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::TimestampTz(v) => buf.put_i64(datetime::timestamptz_to_wire(v)),
            other => return Err(CodecError::mismatch(other, oid::TIMESTAMPTZ)),
        }
        Ok(())
    }

    pub fn timestamptz_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        datetime::parse_timestamptz(utf8(data, "timestamptz")?).map(PgValue::TimestampTz)
    }

    pub fn timestamptz_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::TimestampTz(v) => {
                buf.put_slice(datetime::format_timestamptz(v).as_bytes())
            }
            other => return Err(CodecError::mismatch(other, oid::TIMESTAMPTZ)),
        }
        Ok(())
    }

    pub fn interval_decode_binary(data: &[u8]) -> Result<PgValue, CodecError> {
        PgInterval::decode_binary(data).map(PgValue::Interval)
    }

    pub fn interval_encode_binary(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Interval(v) => {
                v.encode_binary(buf);
                Ok(())
            }
            other => Err(CodecError::mismatch(other, oid::INTERVAL)),
        }
    }

    pub fn interval_decode_text(data: &[u8]) -> Result<PgValue, CodecError> {
        utf8(data, "interval")?.parse().map(PgValue::Interval)
    }

    pub fn interval_encode_text(value: &PgValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        match value {
            PgValue::Interval(v) => buf.put_slice(v.to_string().as_bytes()),
            other => return Err(CodecError::mismatch(other, oid::INTERVAL)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        TypeRegistry::new()
    }

    fn roundtrip(value: PgValue, format: PgFormat) {
        let reg = registry();
        let mut buf = BytesMut::new();
        reg.encode(&value, format, &mut buf).unwrap();
        let decoded = reg.decode(value.type_oid(), format, &buf.freeze()).unwrap();
        assert_eq!(decoded, value, "{format:?} round trip");
    }

    #[test]
    fn scalar_round_trips_both_formats() {
        for format in [PgFormat::Text, PgFormat::Binary] {
            roundtrip(PgValue::Bool(true), format);
            roundtrip(PgValue::Bool(false), format);
            roundtrip(PgValue::Int2(-300), format);
            roundtrip(PgValue::Int4(2_000_000_000), format);
            roundtrip(PgValue::Int8(-9_000_000_000_000), format);
            roundtrip(PgValue::Text("héllo".to_owned()), format);
            roundtrip(PgValue::Bytea(vec![0, 1, 2, 0xff, b'\\']), format);
            roundtrip(PgValue::Numeric("-22.20".parse().unwrap()), format);
        }
    }

    #[test]
    fn bool_text_wire_form() {
        let reg = registry();
        let mut buf = BytesMut::new();
        reg.encode(&PgValue::Bool(true), PgFormat::Text, &mut buf).unwrap();
        assert_eq!(&buf[..], b"t");
        assert_eq!(
            reg.decode(oid::BOOL, PgFormat::Text, &Bytes::from_static(b"f")).unwrap(),
            PgValue::Bool(false),
        );
        assert_eq!(
            reg.decode(oid::BOOL, PgFormat::Binary, &Bytes::from_static(&[1])).unwrap(),
            PgValue::Bool(true),
        );
    }

    #[test]
    fn bytea_text_accepts_hex_and_escape() {
        let reg = registry();
        let hex = Bytes::from_static(b"\\x00ff41");
        assert_eq!(
            reg.decode(oid::BYTEA, PgFormat::Text, &hex).unwrap(),
            PgValue::Bytea(vec![0, 0xff, 0x41]),
        );
        let escape = Bytes::from_static(b"A\\000\\\\B");
        assert_eq!(
            reg.decode(oid::BYTEA, PgFormat::Text, &escape).unwrap(),
            PgValue::Bytea(vec![b'A', 0, b'\\', b'B']),
        );

        let mut buf = BytesMut::new();
        reg.encode(&PgValue::Bytea(vec![0, 0xff]), PgFormat::Text, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\\x00ff");
    }

    #[test]
    fn unknown_oid_surfaces_raw_with_metadata() {
        let reg = registry();
        let data = Bytes::from_static(b"\x01\x02");
        let value = reg.decode(9999, PgFormat::Binary, &data).unwrap();
        match value {
            PgValue::Raw { oid, format, data } => {
                assert_eq!(oid, 9999);
                assert_eq!(format, PgFormat::Binary);
                assert_eq!(&data[..], &[1, 2]);
            }
            other => panic!("expected raw value, got {other:?}"),
        }
    }

    #[test]
    fn int_array_binary_round_trip() {
        let reg = registry();
        let array = PgArray::new(
            oid::INT4,
            vec![Some(PgValue::Int4(1)), None, Some(PgValue::Int4(-3))],
        );
        let value = PgValue::Array(array);
        let mut buf = BytesMut::new();
        reg.encode(&value, PgFormat::Binary, &mut buf).unwrap();
        let decoded = reg.decode(oid::INT4_ARRAY, PgFormat::Binary, &buf.freeze()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn numeric_binary_wire_is_stable() {
        // decode(encode(v)) == v and encode(decode(wire)) == wire
        let reg = registry();
        let n: PgNumeric = "100000000000000000000000000000000".parse().unwrap();
        let wire = n.encode_binary_bytes();
        let decoded = reg.decode(oid::NUMERIC, PgFormat::Binary, &wire).unwrap();
        let mut again = BytesMut::new();
        reg.encode(&decoded, PgFormat::Binary, &mut again).unwrap();
        assert_eq!(again.freeze(), wire);
    }

    #[test]
    fn codec_refusal_reports_mismatch() {
        let reg = registry();
        let mut buf = BytesMut::new();

        // an int4 array carrying a text element cannot encode
        let array = PgArray::new(oid::INT4, vec![Some(PgValue::Text("x".into()))]);
        let err = reg.encode(&PgValue::Array(array), PgFormat::Binary, &mut buf);
        assert!(matches!(err, Err(CodecError::TypeMismatch { .. })));

        // two bytes are not an int4
        assert!(reg
            .decode(oid::INT4, PgFormat::Binary, &Bytes::from_static(b"xy"))
            .is_err());
    }

    #[test]
    fn supports_binary_covers_registered_types_and_arrays() {
        let reg = registry();
        assert!(reg.supports_binary(oid::NUMERIC));
        assert!(reg.supports_binary(oid::INT4_ARRAY));
        assert!(!reg.supports_binary(9999));
    }
}
