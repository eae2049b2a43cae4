//! Array binary wire format.
use bytes::{Buf, BufMut, BytesMut};

use super::{CodecError, PgValue};
use crate::ext::UsizeExt;
use crate::protocol::Oid;

/// One array dimension: element count and lower bound index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDimension {
    pub len: i32,
    pub lower_bound: i32,
}

/// A decoded array value.
///
/// Elements are stored flattened in row-major order, `None` for NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct PgArray {
    pub element_oid: Oid,
    pub dims: Vec<ArrayDimension>,
    pub elements: Vec<Option<PgValue>>,
}

impl PgArray {
    /// One-dimensional array with lower bound 1, the common case.
    pub fn new(element_oid: Oid, elements: Vec<Option<PgValue>>) -> Self {
        let dims = vec![ArrayDimension { len: elements.len() as i32, lower_bound: 1 }];
        Self { element_oid, dims, elements }
    }
}

/// Decode the binary form: header `(ndim, hasnull, element oid)`, one
/// `(len, lower bound)` pair per dimension, then length-prefixed elements
/// with -1 marking NULL.
pub fn decode_binary(
    mut data: &[u8],
    decode_element: impl Fn(Oid, &[u8]) -> Result<PgValue, CodecError>,
) -> Result<PgArray, CodecError> {
    if data.remaining() < 12 {
        return Err(CodecError::length("array", 12, data.remaining()));
    }
    let ndim = data.get_i32();
    let _hasnull = data.get_i32();
    let element_oid = data.get_u32();

    if !(0..=6).contains(&ndim) {
        return Err(CodecError::invalid("array", format!("{ndim} dimensions")));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    let mut count: usize = if ndim == 0 { 0 } else { 1 };
    for _ in 0..ndim {
        if data.remaining() < 8 {
            return Err(CodecError::length("array dimension", 8, data.remaining()));
        }
        let dim = ArrayDimension { len: data.get_i32(), lower_bound: data.get_i32() };
        if dim.len < 0 {
            return Err(CodecError::invalid("array", format!("dimension size {}", dim.len)));
        }
        count = count.saturating_mul(dim.len as usize);
        dims.push(dim);
    }

    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        if data.remaining() < 4 {
            return Err(CodecError::length("array element", 4, data.remaining()));
        }
        let len = data.get_i32();
        if len < 0 {
            elements.push(None);
            continue;
        }
        let len = len as usize;
        if data.remaining() < len {
            return Err(CodecError::length("array element", len, data.remaining()));
        }
        elements.push(Some(decode_element(element_oid, &data[..len])?));
        data.advance(len);
    }

    Ok(PgArray { element_oid, dims, elements })
}

/// Encode the binary form; the inverse of [`decode_binary`].
pub fn encode_binary(
    array: &PgArray,
    buf: &mut BytesMut,
    encode_element: impl Fn(&PgValue, &mut BytesMut) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
    let hasnull = array.elements.iter().any(Option::is_none);

    buf.put_i32(array.dims.len().to_i32());
    buf.put_i32(hasnull as i32);
    buf.put_u32(array.element_oid);
    for dim in &array.dims {
        buf.put_i32(dim.len);
        buf.put_i32(dim.lower_bound);
    }

    let mut scratch = BytesMut::new();
    for element in &array.elements {
        match element {
            None => buf.put_i32(-1),
            Some(value) => {
                scratch.clear();
                encode_element(value, &mut scratch)?;
                buf.put_i32(scratch.len().to_i32());
                buf.put_slice(&scratch);
            }
        }
    }

    Ok(())
}
