//! Shared small utilities.
use bytes::{Buf, Bytes};

use crate::protocol::ProtocolError;

/// An immutable UTF-8 string backed by [`Bytes`], cloneable without copying.
///
/// Wire strings (column names, command tags, error fields, parameter
/// statuses) are sliced straight out of the receive buffer, so they share
/// the message allocation instead of each owning a `String`.
#[derive(Clone, Default)]
pub struct ByteStr {
    bytes: Bytes,
}

impl ByteStr {
    /// Split a nul-terminated protocol string off the front of `buf`,
    /// consuming the terminator.
    ///
    /// Fails when the terminator is missing or the bytes are not UTF-8;
    /// either way the message is malformed and the caller gives up on it.
    pub(crate) fn read_nul(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let end = buf
            .iter()
            .position(|b| *b == b'\0')
            .ok_or_else(ProtocolError::missing_nul)?;
        let bytes = buf.split_to(end);
        buf.advance(1); // nul
        std::str::from_utf8(&bytes).map_err(ProtocolError::non_utf8)?;
        Ok(Self { bytes })
    }

    /// Build a `ByteStr` by copying a str slice.
    pub fn copy_from_str(string: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(string.as_bytes()) }
    }

    /// Build a `ByteStr` pointing directly at a static str, without
    /// allocating or copying.
    pub const fn from_static(string: &'static str) -> Self {
        Self { bytes: Bytes::from_static(string.as_bytes()) }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: every constructor validated the bytes as UTF-8
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl PartialEq<str> for ByteStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for ByteStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl From<&'static str> for ByteStr {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self { bytes: Bytes::from(value.into_bytes()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_nul_splits_and_validates() {
        let mut buf = Bytes::from_static(b"TimeZone\0UTC\0");
        assert_eq!(ByteStr::read_nul(&mut buf).unwrap(), "TimeZone");
        assert_eq!(ByteStr::read_nul(&mut buf).unwrap(), "UTC");
        assert!(buf.is_empty());
    }

    #[test]
    fn read_nul_rejects_malformed_strings() {
        let mut buf = Bytes::from_static(b"no terminator");
        assert!(ByteStr::read_nul(&mut buf).is_err());

        let mut buf = Bytes::from_static(&[0xff, 0xfe, 0x00]);
        assert!(ByteStr::read_nul(&mut buf).is_err());
    }
}
