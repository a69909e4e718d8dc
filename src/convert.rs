//! The scalar conversion matrix: raw column text (or buffer bytes) to a
//! typed target, dispatched on the server-reported wire type tag.
//!
//! Numeric text is parsed with strtol-family semantics: leading whitespace,
//! an optional sign, then the longest digit prefix; trailing junk is
//! ignored. Calendar text is positional (`Y-M-D`, `[-]H:M:S`,
//! `Y-M-D H:M:S`) and converts to epoch seconds with a per-type base: year
//! 1000 for date/time/datetime, 1970 for timestamp. Blob bytes become a
//! most-significant-byte-first window of at most the target's width.

use crate::consts::ColumnType;
use crate::error::{Error, Result};
use crate::temporal::{Date, DateTime, Time};

/// A scalar target of the conversion matrix.
pub trait FromWire: Sized + Default {
    /// Name reported by conversion errors.
    const NAME: &'static str;
    /// Byte width, bounding binary-blob windows.
    const WIDTH: usize;

    fn from_i64(v: i64) -> Self;
    fn from_u64(v: u64) -> Self;
    fn from_f64(v: f64) -> Self;

    /// Integer text parse matching the target's signedness.
    fn parse_int(text: &[u8]) -> Self {
        Self::from_i64(atoi_i64(text))
    }
}

macro_rules! impl_from_wire_signed {
    ($($t:ty => $w:expr),*) => {$(
        impl FromWire for $t {
            const NAME: &'static str = stringify!($t);
            const WIDTH: usize = $w;
            fn from_i64(v: i64) -> Self { v as $t }
            fn from_u64(v: u64) -> Self { v as $t }
            fn from_f64(v: f64) -> Self { v as $t }
        }
    )*};
}

macro_rules! impl_from_wire_unsigned {
    ($($t:ty => $w:expr),*) => {$(
        impl FromWire for $t {
            const NAME: &'static str = stringify!($t);
            const WIDTH: usize = $w;
            fn from_i64(v: i64) -> Self { v as $t }
            fn from_u64(v: u64) -> Self { v as $t }
            fn from_f64(v: f64) -> Self { v as $t }
            fn parse_int(text: &[u8]) -> Self { atoi_u64(text) as $t }
        }
    )*};
}

impl_from_wire_signed!(i8 => 1, i16 => 2, i32 => 4, i64 => 8);
impl_from_wire_unsigned!(u8 => 1, u16 => 2, u32 => 4, u64 => 8);

impl FromWire for f32 {
    const NAME: &'static str = "f32";
    const WIDTH: usize = 4;
    fn from_i64(v: i64) -> Self {
        v as f32
    }
    fn from_u64(v: u64) -> Self {
        v as f32
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl FromWire for f64 {
    const NAME: &'static str = "f64";
    const WIDTH: usize = 8;
    fn from_i64(v: i64) -> Self {
        v as f64
    }
    fn from_u64(v: u64) -> Self {
        v as f64
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl FromWire for bool {
    const NAME: &'static str = "bool";
    const WIDTH: usize = 1;
    fn from_i64(v: i64) -> Self {
        v != 0
    }
    fn from_u64(v: u64) -> Self {
        v != 0
    }
    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

/// Converts one raw cell to `T`. `None` and empty input are the target's
/// zero for every tag; a tag with no defined conversion is an error naming
/// both sides.
pub fn convert<T: FromWire>(raw: Option<&[u8]>, tag: ColumnType) -> Result<T> {
    use ColumnType::*;
    let bytes = match raw {
        Some(b) if !b.is_empty() => b,
        _ => return Ok(T::default()),
    };
    Ok(match tag {
        MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_LONG | MYSQL_TYPE_LONGLONG
        | MYSQL_TYPE_INT24 | MYSQL_TYPE_YEAR | MYSQL_TYPE_BIT => T::parse_int(bytes),
        MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE | MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => {
            T::from_f64(atof(bytes))
        }
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE | MYSQL_TYPE_TIME | MYSQL_TYPE_DATETIME
        | MYSQL_TYPE_TIMESTAMP => T::from_i64(calendar_to_epoch(bytes, tag)),
        MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB
        | MYSQL_TYPE_BLOB => T::from_u64(blob_window(bytes, T::WIDTH)),
        MYSQL_TYPE_NULL | MYSQL_TYPE_GEOMETRY => T::default(),
        MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING | MYSQL_TYPE_ENUM
        | MYSQL_TYPE_SET | MYSQL_TYPE_JSON => {
            return Err(Error::Conversion {
                from: tag,
                to: T::NAME,
            })
        }
    })
}

/// Signed decimal prefix parse, saturating at the i64 range.
pub(crate) fn atoi_i64(b: &[u8]) -> i64 {
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut neg = false;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        neg = b[i] == b'-';
        i += 1;
    }
    let mut acc: i64 = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        let d = i64::from(b[i] - b'0');
        acc = match acc.checked_mul(10).and_then(|a| a.checked_add(d)) {
            Some(v) => v,
            None => return if neg { i64::MIN } else { i64::MAX },
        };
        i += 1;
    }
    if neg {
        -acc
    } else {
        acc
    }
}

/// Unsigned decimal prefix parse with strtoull semantics: overflow pins at
/// the maximum, a leading minus negates in unsigned arithmetic.
pub(crate) fn atoi_u64(b: &[u8]) -> u64 {
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut neg = false;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        neg = b[i] == b'-';
        i += 1;
    }
    let mut acc: u64 = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        let d = u64::from(b[i] - b'0');
        acc = match acc.checked_mul(10).and_then(|a| a.checked_add(d)) {
            Some(v) => v,
            None => return u64::MAX,
        };
        i += 1;
    }
    if neg {
        acc.wrapping_neg()
    } else {
        acc
    }
}

/// Longest valid float prefix, 0.0 when no digit is found.
pub(crate) fn atof(b: &[u8]) -> f64 {
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    let start = i;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    let mut saw_digit = false;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        saw_digit = true;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            saw_digit = true;
        }
    }
    if saw_digit && i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        let mark = i;
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        let mut exp_digit = false;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            exp_digit = true;
        }
        if !exp_digit {
            i = mark;
        }
    }
    if !saw_digit {
        return 0.0;
    }
    std::str::from_utf8(&b[start..i])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Reads `N` positional integers; the sign applies to the first field only,
/// later `-` bytes are separators. Mirrors `sscanf("%d-%d-%d ...")`.
fn scan_ints<const N: usize>(b: &[u8]) -> [i64; N] {
    let mut out = [0i64; N];
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut neg_first = false;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        neg_first = b[i] == b'-';
        i += 1;
    }
    for (k, slot) in out.iter_mut().enumerate() {
        while i < b.len() && !b[i].is_ascii_digit() {
            i += 1;
        }
        if i >= b.len() {
            break;
        }
        let mut acc: i64 = 0;
        while i < b.len() && b[i].is_ascii_digit() {
            acc = acc.saturating_mul(10).saturating_add(i64::from(b[i] - b'0'));
            i += 1;
        }
        *slot = if k == 0 && neg_first { -acc } else { acc };
    }
    out
}

fn leading_minus(b: &[u8]) -> bool {
    b.iter()
        .copied()
        .find(|c| !c.is_ascii_whitespace())
        == Some(b'-')
}

pub(crate) fn parse_date_text(b: &[u8]) -> Date {
    let [y, m, d] = scan_ints::<3>(b);
    Date {
        year: y.clamp(0, 9999) as u16,
        month: m.clamp(0, 255) as u8,
        day: d.clamp(0, 255) as u8,
    }
}

pub(crate) fn parse_time_text(b: &[u8]) -> Time {
    let [h, m, s] = scan_ints::<3>(b);
    Time {
        negative: h < 0 || leading_minus(b),
        hours: h.unsigned_abs().min(u64::from(u32::MAX)) as u32,
        minutes: m.clamp(0, 255) as u8,
        seconds: s.clamp(0, 255) as u8,
        micros: 0,
    }
}

pub(crate) fn parse_datetime_text(b: &[u8]) -> DateTime {
    let [y, mo, d, h, mi, s] = scan_ints::<6>(b);
    DateTime {
        year: y.clamp(0, 9999) as u16,
        month: mo.clamp(0, 255) as u8,
        day: d.clamp(0, 255) as u8,
        hour: h.clamp(0, 255) as u8,
        minute: mi.clamp(0, 255) as u8,
        second: s.clamp(0, 255) as u8,
        micros: 0,
    }
}

pub(crate) const SECS_PER_DAY: i64 = 86_400;

/// Days since 1970-01-01 in the proleptic Gregorian calendar
/// (Howard Hinnant's civil-days algorithm).
const fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y / 400 } else { (y - 399) / 400 };
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

const DAYS_EPOCH_1000: i64 = days_from_civil(1000, 1, 1);

fn civil_days(year: u16, month: u8, day: u8) -> i64 {
    days_from_civil(i64::from(year), i64::from(month.clamp(1, 12)), i64::from(day))
}

/// Date to epoch seconds. The base is 1000-01-01 unless `timestamp_base`;
/// the all-zero sentinel is 0 under either base.
pub(crate) fn date_to_epoch(d: &Date, timestamp_base: bool) -> i64 {
    if d.is_zero() {
        return 0;
    }
    let base = if timestamp_base { 0 } else { DAYS_EPOCH_1000 };
    (civil_days(d.year, d.month, d.day) - base) * SECS_PER_DAY
}

pub(crate) fn datetime_to_epoch(dt: &DateTime, timestamp_base: bool) -> i64 {
    if dt.is_zero() {
        return 0;
    }
    let base = if timestamp_base { 0 } else { DAYS_EPOCH_1000 };
    (civil_days(dt.year, dt.month, dt.day) - base) * SECS_PER_DAY
        + i64::from(dt.hour) * 3600
        + i64::from(dt.minute) * 60
        + i64::from(dt.second)
}

fn calendar_to_epoch(b: &[u8], tag: ColumnType) -> i64 {
    use ColumnType::*;
    match tag {
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => date_to_epoch(&parse_date_text(b), false),
        MYSQL_TYPE_TIME => parse_time_text(b).total_seconds(),
        MYSQL_TYPE_DATETIME => datetime_to_epoch(&parse_datetime_text(b), false),
        MYSQL_TYPE_TIMESTAMP => datetime_to_epoch(&parse_datetime_text(b), true),
        _ => 0,
    }
}

/// MSB-first window over at most `width` (and at most eight) leading bytes.
pub(crate) fn blob_window(b: &[u8], width: usize) -> u64 {
    let take = b.len().min(width).min(8);
    let mut acc = 0u64;
    for &byte in &b[..take] {
        acc = (acc << 8) | u64::from(byte);
    }
    acc
}
