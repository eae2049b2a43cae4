//! Calendar-aware temporal conversions.
//!
//! Wire forms use the server epoch 2000-01-01: `timestamp`/`timestamptz` are
//! microseconds since 2000-01-01 00:00:00 UTC, `date` is days since
//! 2000-01-01, `time` is microseconds since midnight.
//!
//! Instants and local wall-clock values are kept apart deliberately:
//! `timestamptz` materializes as [`DateTime<Utc>`] (an absolute instant, any
//! caller-supplied calendar is irrelevant), while `timestamp`, `date` and
//! `time` materialize as naive values that only become instants against an
//! explicit caller-supplied zone. The zone database behind [`chrono_tz::Tz`]
//! carries sub-minute historical offsets; nothing here rounds them.
use std::fmt;

use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};

use super::CodecError;

/// Microseconds between the unix epoch and 2000-01-01 00:00:00 UTC.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
}

// ===== wire <-> host values =====

/// `timestamptz` wire value to the absolute instant it denotes.
pub fn timestamptz_from_wire(micros: i64) -> Result<DateTime<Utc>, CodecError> {
    micros
        .checked_add(PG_EPOCH_UNIX_MICROS)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .ok_or_else(|| CodecError::temporal("timestamptz microseconds out of range"))
}

pub fn timestamptz_to_wire(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

/// `timestamp` wire value to the local wall-clock it denotes.
pub fn timestamp_from_wire(micros: i64) -> Result<NaiveDateTime, CodecError> {
    pg_epoch_date()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .checked_add_signed(Duration::microseconds(micros))
        .ok_or_else(|| CodecError::temporal("timestamp microseconds out of range"))
}

pub fn timestamp_to_wire(local: &NaiveDateTime) -> i64 {
    (*local - pg_epoch_date().and_hms_opt(0, 0, 0).unwrap()).num_microseconds()
        .expect("in-range timestamp")
}

/// `date` wire value (days since 2000-01-01) to the local date it denotes.
pub fn date_from_wire(days: i32) -> Result<NaiveDate, CodecError> {
    pg_epoch_date()
        .checked_add_signed(Duration::days(days as i64))
        .ok_or_else(|| CodecError::temporal("date days out of range"))
}

pub fn date_to_wire(date: &NaiveDate) -> i32 {
    (*date - pg_epoch_date()).num_days() as i32
}

/// `time` wire value (microseconds since midnight) to the local time it denotes.
pub fn time_from_wire(micros: i64) -> Result<NaiveTime, CodecError> {
    if !(0..=86_400_000_000).contains(&micros) {
        return Err(CodecError::temporal("time microseconds out of range"));
    }
    let secs = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1000) as u32;
    // 24:00:00 is a valid postgres time; clamp to the last representable tick
    NaiveTime::from_num_seconds_from_midnight_opt(secs.min(86_399), nanos)
        .ok_or_else(|| CodecError::temporal("time microseconds out of range"))
}

pub fn time_to_wire(time: &NaiveTime) -> i64 {
    (*time - NaiveTime::from_hms_opt(0, 0, 0).unwrap())
        .num_microseconds()
        .expect("in-range time")
}

// ===== local values <-> instants, against an explicit zone =====

/// Resolve a local wall-clock in `zone` to the instant it denotes.
///
/// Ambiguous wall-clocks (DST fold) resolve to the earlier instant; a
/// wall-clock inside a DST gap resolves as if read one hour later, matching
/// the server's forward-shift behavior.
pub fn timestamp_as_instant<Z: TimeZone>(
    local: NaiveDateTime,
    zone: &Z,
) -> Result<DateTime<Utc>, CodecError> {
    let resolved = match zone.from_local_datetime(&local) {
        LocalResult::Single(at) => at,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let shifted = local
                .checked_add_signed(Duration::hours(1))
                .ok_or_else(|| CodecError::temporal("timestamp out of range"))?;
            match zone.from_local_datetime(&shifted) {
                LocalResult::Single(at) | LocalResult::Ambiguous(at, _) => at,
                LocalResult::None => {
                    return Err(CodecError::temporal("local time does not exist in zone"));
                }
            }
        }
    };
    Ok(resolved.with_timezone(&Utc))
}

/// Project an instant onto the wall-clock of `zone`.
pub fn instant_as_timestamp<Z: TimeZone>(at: &DateTime<Utc>, zone: &Z) -> NaiveDateTime {
    at.with_timezone(zone).naive_local()
}

/// The instant of midnight of `date` in `zone`.
pub fn date_as_instant<Z: TimeZone>(date: NaiveDate, zone: &Z) -> Result<DateTime<Utc>, CodecError> {
    timestamp_as_instant(date.and_time(NaiveTime::MIN), zone)
}

/// The instant of `time` on the unix epoch day in `zone`.
pub fn time_as_instant<Z: TimeZone>(time: NaiveTime, zone: &Z) -> Result<DateTime<Utc>, CodecError> {
    let anchor = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap().and_time(time);
    timestamp_as_instant(anchor, zone)
}

/// UTC offset of `zone` at `local`, in seconds east of Greenwich, exact to
/// the second.
pub fn zone_offset_seconds<Z: TimeZone>(local: NaiveDateTime, zone: &Z) -> Result<i32, CodecError> {
    let at = timestamp_as_instant(local, zone)?;
    Ok(zone.offset_from_utc_datetime(&at.naive_utc()).fix().local_minus_utc())
}

// ===== text forms =====

pub fn format_timestamp(local: &NaiveDateTime) -> String {
    local.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, CodecError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| CodecError::invalid("timestamp", format!("literal {text:?}")))
}

/// Render an instant the way the server does, in UTC with an explicit offset.
pub fn format_timestamptz(at: &DateTime<Utc>) -> String {
    format!("{}+00", at.naive_utc().format("%Y-%m-%d %H:%M:%S%.f"))
}

/// Parse the server's `timestamptz` text output: a wall-clock followed by
/// the session-zone offset `[+-]HH[:MM[:SS]]`.
pub fn parse_timestamptz(text: &str) -> Result<DateTime<Utc>, CodecError> {
    let bad = || CodecError::invalid("timestamptz", format!("literal {text:?}"));

    // the offset sign comes after the time part; skip the date's dashes
    let time_start = 11.min(text.len());
    let split = text[time_start..]
        .rfind(['+', '-'])
        .map(|i| time_start + i)
        .ok_or_else(bad)?;
    let (local, offset) = text.split_at(split);

    let local = parse_timestamp(local.trim_end())?;
    let offset_secs = parse_offset(offset).ok_or_else(bad)?;

    let resolved = local
        .checked_sub_signed(Duration::seconds(offset_secs as i64))
        .ok_or_else(bad)?;
    Ok(Utc.from_utc_datetime(&resolved))
}

/// `[+-]HH[:MM[:SS]]` or `[+-]HHMM`, seconds east of Greenwich.
pub(crate) fn parse_offset(text: &str) -> Option<i32> {
    let (sign, digits) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };

    let mut parts = [0i32; 3];
    if digits.contains(':') {
        for (slot, part) in parts.iter_mut().zip(digits.split(':')) {
            *slot = part.parse().ok()?;
        }
    } else {
        match digits.len() {
            2 => parts[0] = digits.parse().ok()?,
            4 => {
                parts[0] = digits[..2].parse().ok()?;
                parts[1] = digits[2..].parse().ok()?;
            }
            _ => return None,
        }
    }

    Some(sign * (parts[0] * 3600 + parts[1] * 60 + parts[2]))
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date(text: &str) -> Result<NaiveDate, CodecError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| CodecError::invalid("date", format!("literal {text:?}")))
}

pub fn format_time(time: &NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

pub fn parse_time(text: &str) -> Result<NaiveTime, CodecError> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .map_err(|_| CodecError::invalid("time", format!("literal {text:?}")))
}

// ===== interval =====

/// A time interval in the server's three-component form.
///
/// Months, days and microseconds do not reduce into each other; the server
/// keeps them separate because month and day lengths vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgInterval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl PgInterval {
    /// Binary wire form: microseconds, days, months.
    pub fn decode_binary(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 16 {
            return Err(CodecError::length("interval", 16, data.len()));
        }
        use bytes::Buf;
        let mut data = data;
        Ok(Self {
            micros: data.get_i64(),
            days: data.get_i32(),
            months: data.get_i32(),
        })
    }

    pub fn encode_binary(&self, buf: &mut bytes::BytesMut) {
        use bytes::BufMut;
        buf.put_i64(self.micros);
        buf.put_i32(self.days);
        buf.put_i32(self.months);
    }
}

impl fmt::Display for PgInterval {
    /// The server's `postgres` interval output style.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let years = self.months / 12;
        let months = self.months % 12;
        let mut wrote = false;

        if years != 0 {
            write!(f, "{years} year{}", if years.abs() == 1 { "" } else { "s" })?;
            wrote = true;
        }
        if months != 0 {
            write!(f, "{}{months} mon{}", sep(wrote), if months.abs() == 1 { "" } else { "s" })?;
            wrote = true;
        }
        if self.days != 0 {
            write!(f, "{}{} day{}", sep(wrote), self.days, if self.days.abs() == 1 { "" } else { "s" })?;
            wrote = true;
        }
        if self.micros != 0 || !wrote {
            let neg = self.micros < 0;
            let micros = self.micros.unsigned_abs();
            let secs = micros / 1_000_000;
            let sub = micros % 1_000_000;
            write!(
                f,
                "{}{}{:02}:{:02}:{:02}",
                sep(wrote),
                if neg { "-" } else { "" },
                secs / 3600,
                secs % 3600 / 60,
                secs % 60,
            )?;
            if sub != 0 {
                let printed = format!("{sub:06}");
                write!(f, ".{}", printed.trim_end_matches('0'))?;
            }
        }
        Ok(())
    }
}

fn sep(wrote: bool) -> &'static str {
    if wrote { " " } else { "" }
}

impl std::str::FromStr for PgInterval {
    type Err = CodecError;

    /// Parses the server's `postgres` output style: any of
    /// `N year(s) N mon(s) N day(s)` followed by an optional `[-]HH:MM:SS[.f]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CodecError::invalid("interval", format!("literal {s:?}"));
        let mut out = PgInterval::default();
        let mut words = s.split_whitespace().peekable();

        while let Some(word) = words.next() {
            if word.contains(':') {
                // clock part is always last
                if words.peek().is_some() {
                    return Err(bad());
                }
                let (neg, clock) = match word.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, word),
                };
                let mut it = clock.split(':');
                let hours: i64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
                let minutes: i64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
                let seconds: f64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
                if it.next().is_some() {
                    return Err(bad());
                }
                let mut micros =
                    hours * 3_600_000_000 + minutes * 60_000_000 + (seconds * 1e6).round() as i64;
                if neg {
                    micros = -micros;
                }
                out.micros = micros;
            } else {
                let count: i32 = word.parse().map_err(|_| bad())?;
                match words.next().ok_or_else(bad)? {
                    "year" | "years" => out.months += count * 12,
                    "mon" | "mons" => out.months += count,
                    "day" | "days" => out.days += count,
                    _ => return Err(bad()),
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike};

    fn east(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    #[test]
    fn timestamptz_is_an_absolute_instant() {
        // 2005-01-01 12:00:00 UTC
        let micros = (1_104_580_800 - 946_684_800) * 1_000_000;
        let at = timestamptz_from_wire(micros).unwrap();
        assert_eq!(at.timestamp_millis(), 1_104_580_800_000);

        // materializing through any calendar must not shift the instant
        for zone in [east(0), east(3), east(-5), east(13)] {
            let local = instant_as_timestamp(&at, &zone);
            let back = timestamp_as_instant(local, &zone).unwrap();
            assert_eq!(back.timestamp_millis(), 1_104_580_800_000);
        }

        assert_eq!(timestamptz_to_wire(&at), micros);
    }

    #[test]
    fn timestamp_wallclock_depends_on_zone() {
        let local = NaiveDate::from_ymd_opt(2005, 1, 1)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        let cases = [
            (east(0), 1_104_591_600_000i64),
            (east(1), 1_104_588_000_000),
            (east(3), 1_104_580_800_000),
            (east(-5), 1_104_609_600_000),
            (east(13), 1_104_544_800_000),
        ];
        for (zone, millis) in cases {
            let at = timestamp_as_instant(local, &zone).unwrap();
            assert_eq!(at.timestamp_millis(), millis, "zone {zone}");
        }
    }

    #[test]
    fn paris_1920_has_no_offset_and_1900_a_subminute_one() {
        let paris = chrono_tz::Europe::Paris;

        // '1920-01-01' interpreted in Europe/Paris: GMT at the time
        let local = NaiveDate::from_ymd_opt(1920, 1, 1)
            .unwrap()
            .and_time(NaiveTime::MIN);
        let at = timestamp_as_instant(local, &paris).unwrap();
        assert_eq!(at.timestamp_millis(), -1_577_923_200_000);

        // Paris Mean Time, +00:09:21, not rounded to a whole minute
        let local = NaiveDate::from_ymd_opt(1900, 1, 1)
            .unwrap()
            .and_time(NaiveTime::MIN);
        assert_eq!(zone_offset_seconds(local, &paris).unwrap(), 9 * 60 + 21);
    }

    #[test]
    fn pre_epoch_wire_values() {
        let at = timestamptz_from_wire(-1_000_000).unwrap();
        assert_eq!(at.timestamp_micros(), 946_684_800_000_000 - 1_000_000);

        let date = date_from_wire(-36_524).unwrap(); // 1900-01-01
        assert_eq!(date, NaiveDate::from_ymd_opt(1900, 1, 1).unwrap());
        assert_eq!(date_to_wire(&date), -36_524);
    }

    #[test]
    fn date_and_time_wire_round_trip() {
        let date = NaiveDate::from_ymd_opt(2005, 1, 1).unwrap();
        assert_eq!(date_to_wire(&date), 1827);
        assert_eq!(date_from_wire(1827).unwrap(), date);

        let time = NaiveTime::from_hms_micro_opt(15, 30, 1, 250).unwrap();
        let wire = time_to_wire(&time);
        assert_eq!(time_from_wire(wire).unwrap(), time);
        assert!(time_from_wire(-1).is_err());
        assert!(time_from_wire(86_400_000_001).is_err());
    }

    #[test]
    fn timestamp_text_forms() {
        let local = NaiveDate::from_ymd_opt(2005, 1, 1)
            .unwrap()
            .and_hms_micro_opt(15, 0, 0, 123_456)
            .unwrap();
        let text = format_timestamp(&local);
        assert_eq!(text, "2005-01-01 15:00:00.123456");
        assert_eq!(parse_timestamp(&text).unwrap(), local);
        assert_eq!(
            parse_timestamp("2005-01-01 15:00:00").unwrap(),
            local.with_nanosecond(0).unwrap(),
        );
    }

    #[test]
    fn timestamptz_text_accepts_short_offsets() {
        // server output with TimeZone GMT-3 (posix sign: +03:00 east)
        let at = parse_timestamptz("2005-01-01 15:00:00+03").unwrap();
        assert_eq!(at.timestamp_millis(), 1_104_580_800_000);

        let at = parse_timestamptz("2005-01-01 07:00:00-05:00").unwrap();
        assert_eq!(at.timestamp_millis(), 1_104_580_800_000);

        let at = parse_timestamptz("2005-01-01 12:00:00+00").unwrap();
        assert_eq!(format_timestamptz(&at), "2005-01-01 12:00:00+00");
    }

    #[test]
    fn interval_round_trip() {
        let iv = PgInterval { months: 14, days: 3, micros: 4_005_000_000 };
        assert_eq!(iv.to_string(), "1 year 2 mons 3 days 01:06:45");
        assert_eq!("1 year 2 mons 3 days 01:06:45".parse::<PgInterval>().unwrap(), iv);

        let mut buf = bytes::BytesMut::new();
        iv.encode_binary(&mut buf);
        assert_eq!(PgInterval::decode_binary(&buf).unwrap(), iv);

        assert_eq!(PgInterval::default().to_string(), "00:00:00");
        assert_eq!("00:00:00".parse::<PgInterval>().unwrap(), PgInterval::default());
    }
}
