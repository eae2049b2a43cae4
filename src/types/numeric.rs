//! Arbitrary-precision numeric, in the server's base-10000 representation.
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::CodecError;

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

/// Numeric sign marker, as transmitted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericSign {
    Positive,
    Negative,
    NaN,
}

/// A numeric value holding the wire representation verbatim.
///
/// The binary form is `(ndigits, weight, sign, dscale, digit[ndigits])` where
/// each digit is a base-10000 group. Keeping exactly these fields makes the
/// decode/encode round trip reproduce identical byte sequences, digit for
/// digit, which a normalized big-decimal representation cannot guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNumeric {
    /// Sign marker.
    pub sign: NumericSign,
    /// Weight of the first digit group, in base-10000 units; 0 is the ones group.
    pub weight: i16,
    /// Display scale: the number of decimal fraction digits.
    pub dscale: u16,
    /// Base-10000 digit groups, most significant first. Each in `0..10000`.
    pub digits: Vec<i16>,
}

impl PgNumeric {
    /// Zero with display scale 0.
    pub fn zero() -> Self {
        Self { sign: NumericSign::Positive, weight: 0, dscale: 0, digits: Vec::new() }
    }

    pub fn nan() -> Self {
        Self { sign: NumericSign::NaN, weight: 0, dscale: 0, digits: Vec::new() }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.sign, NumericSign::NaN)
    }

    /// Decode the binary wire form.
    pub fn decode_binary(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.remaining() < 8 {
            return Err(CodecError::length("numeric", 8, data.remaining()));
        }
        let ndigits = data.get_i16();
        let weight = data.get_i16();
        let sign = match data.get_u16() {
            SIGN_POSITIVE => NumericSign::Positive,
            SIGN_NEGATIVE => NumericSign::Negative,
            SIGN_NAN => NumericSign::NaN,
            other => return Err(CodecError::invalid("numeric", format!("sign 0x{other:04x}"))),
        };
        let dscale = data.get_u16();

        if ndigits < 0 || data.remaining() < ndigits as usize * 2 {
            return Err(CodecError::invalid("numeric", format!("digit count {ndigits}")));
        }
        let mut digits = Vec::with_capacity(ndigits as usize);
        for _ in 0..ndigits {
            let digit = data.get_i16();
            if !(0..10000).contains(&digit) {
                return Err(CodecError::invalid("numeric", format!("digit group {digit}")));
            }
            digits.push(digit);
        }

        Ok(Self { sign, weight, dscale, digits })
    }

    /// Encode the binary wire form. Reproduces the decoded bytes exactly.
    pub fn encode_binary(&self, buf: &mut BytesMut) {
        buf.put_i16(self.digits.len() as i16);
        buf.put_i16(self.weight);
        buf.put_u16(match self.sign {
            NumericSign::Positive => SIGN_POSITIVE,
            NumericSign::Negative => SIGN_NEGATIVE,
            NumericSign::NaN => SIGN_NAN,
        });
        buf.put_u16(self.dscale);
        for digit in &self.digits {
            buf.put_i16(*digit);
        }
    }

    pub fn encode_binary_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.digits.len() * 2);
        self.encode_binary(&mut buf);
        buf.freeze()
    }

    /// Digit group at base-10000 position `pos`; `digits[0]` sits at
    /// position `weight`, positions outside the stored groups are zero.
    fn group_at(&self, pos: i32) -> i16 {
        let index = self.weight as i32 - pos;
        if index < 0 || index as usize >= self.digits.len() {
            0
        } else {
            self.digits[index as usize]
        }
    }
}

impl fmt::Display for PgNumeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nan() {
            return f.write_str("NaN");
        }
        if matches!(self.sign, NumericSign::Negative) {
            f.write_str("-")?;
        }

        // integer part, group by group from `weight` down to the ones group
        if self.weight < 0 {
            f.write_str("0")?;
        } else {
            for pos in (0..=self.weight as i32).rev() {
                let group = self.group_at(pos);
                if pos == self.weight as i32 {
                    write!(f, "{group}")?;
                } else {
                    write!(f, "{group:04}")?;
                }
            }
        }

        // fraction: exactly dscale digits
        if self.dscale > 0 {
            let mut fraction = String::with_capacity(self.dscale as usize + 4);
            let mut pos = -1;
            while fraction.len() < self.dscale as usize {
                use fmt::Write;
                write!(fraction, "{:04}", self.group_at(pos))?;
                pos -= 1;
            }
            fraction.truncate(self.dscale as usize);
            write!(f, ".{fraction}")?;
        }

        Ok(())
    }
}

impl FromStr for PgNumeric {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("nan") {
            return Ok(Self::nan());
        }

        let (sign, rest) = match s.as_bytes().first() {
            Some(b'-') => (NumericSign::Negative, &s[1..]),
            Some(b'+') => (NumericSign::Positive, &s[1..]),
            _ => (NumericSign::Positive, s),
        };
        if rest.is_empty() {
            return Err(CodecError::invalid("numeric", "empty literal".to_string()));
        }

        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
            || (int_part.is_empty() && frac_part.is_empty())
        {
            return Err(CodecError::invalid("numeric", format!("literal {s:?}")));
        }

        let dscale = u16::try_from(frac_part.len())
            .map_err(|_| CodecError::invalid("numeric", "scale too large".to_string()))?;

        let int_digits = int_part.trim_start_matches('0');

        // align the integer digits to base-10000 groups from the right, the
        // fraction digits from the left
        let mut decimal = String::with_capacity(int_digits.len() + frac_part.len() + 6);
        let lead = int_digits.len() % 4;
        if lead != 0 {
            decimal.extend(std::iter::repeat('0').take(4 - lead));
        }
        decimal.push_str(int_digits);
        let int_groups = decimal.len() / 4;
        decimal.push_str(frac_part);
        while decimal.len() % 4 != 0 {
            decimal.push('0');
        }

        let mut digits: Vec<i16> = decimal
            .as_bytes()
            .chunks(4)
            .map(|group| {
                group
                    .iter()
                    .fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
            })
            .collect();

        let mut weight = int_groups as i32 - 1;

        // canonical form: no leading or trailing zero groups
        while digits.first() == Some(&0) {
            digits.remove(0);
            weight -= 1;
        }
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            return Ok(Self { sign: NumericSign::Positive, weight: 0, dscale, digits });
        }

        let weight = i16::try_from(weight)
            .map_err(|_| CodecError::invalid("numeric", "weight out of range".to_string()))?;

        Ok(Self { sign, weight, dscale, digits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_text(s: &str) {
        let n: PgNumeric = s.parse().unwrap();
        assert_eq!(n.to_string(), s, "text round trip of {s}");
    }

    #[test]
    fn text_round_trips() {
        roundtrip_text("0");
        roundtrip_text("1");
        roundtrip_text("-1");
        roundtrip_text("42");
        roundtrip_text("9999");
        roundtrip_text("10000");
        roundtrip_text("1.10");
        roundtrip_text("-22.20");
        roundtrip_text("444.40");
        roundtrip_text("0.001");
        roundtrip_text("0.00001");
        roundtrip_text("12345678.90123");
        roundtrip_text("NaN");
    }

    #[test]
    fn powers_of_ten_round_trip() {
        // 1, 10, 100, ... 10^31, both signs, as in large-value transfers
        for sign in ["", "-"] {
            for zeros in 0..32 {
                let mut s = String::from(sign);
                s.push('1');
                s.extend(std::iter::repeat('0').take(zeros));
                roundtrip_text(&s);
            }
        }
    }

    #[test]
    fn binary_round_trip_is_byte_identical() {
        for s in ["100000000000000000000000000000000", "-1", "1.10", "0.00001", "NaN"] {
            let n: PgNumeric = s.parse().unwrap();
            let wire = n.encode_binary_bytes();
            let decoded = PgNumeric::decode_binary(&wire).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(decoded.encode_binary_bytes(), wire, "byte identical for {s}");
        }
    }

    #[test]
    fn ten_to_thirty_two_has_single_digit_group() {
        let n: PgNumeric = "100000000000000000000000000000000".parse().unwrap();
        assert_eq!(n.digits, vec![1]);
        assert_eq!(n.weight, 8);
        assert_eq!(n.dscale, 0);
        assert_eq!(n.to_string(), "100000000000000000000000000000000");
    }

    #[test]
    fn copy_test_numerics() {
        // numeric(5,2) literals as they appear in the bulk-load fixture
        let n: PgNumeric = "1.10".parse().unwrap();
        assert_eq!(n.to_string(), "1.10");
        let n: PgNumeric = "-22.20".parse().unwrap();
        assert_eq!(n.to_string(), "-22.20");
        assert_eq!(n.sign, NumericSign::Negative);
        let n: PgNumeric = "444.40".parse().unwrap();
        assert_eq!(n.to_string(), "444.40");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<PgNumeric>().is_err());
        assert!("abc".parse::<PgNumeric>().is_err());
        assert!("1.2.3".parse::<PgNumeric>().is_err());
        assert!(PgNumeric::decode_binary(&[0, 0, 0]).is_err());
    }

    #[test]
    fn rejects_bad_sign_word() {
        // ndigits=0, weight=0, sign=0x1234, dscale=0
        let bad = [0u8, 0, 0, 0, 0x12, 0x34, 0, 0];
        assert!(PgNumeric::decode_binary(&bad).is_err());
    }
}
