//! MJD/BCD timestamps used by ARIB SI tables.
//!
//! Start times are 16-bit MJD followed by 6 BCD digits (hhmmss) in JST.
//! Durations are 6 BCD digits. All-ones fields mean "undefined".

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Timelike};
use tunerd_model::Timestamp;

/// JST offset from UTC in seconds.
pub const JST_OFFSET_SECS: i32 = 9 * 3600;

/// MJD of 1970-01-01.
const MJD_UNIX_EPOCH: i64 = 40587;

const MS_PER_DAY: i64 = 86_400_000;

/// Decode one BCD byte, `None` if a nibble is not a decimal digit.
pub fn bcd(byte: u8) -> Option<u8> {
    let hi = byte >> 4;
    let lo = byte & 0x0F;
    if hi > 9 || lo > 9 {
        return None;
    }
    Some(hi * 10 + lo)
}

/// Decode a 40-bit MJD+BCD JST time into epoch milliseconds.
///
/// Returns `None` for the undefined sentinel (all 0xFF) or invalid digits.
pub fn decode_start_time(data: &[u8]) -> Option<Timestamp> {
    if data.len() < 5 || data[..5].iter().all(|&b| b == 0xFF) {
        return None;
    }
    let mjd = u16::from_be_bytes([data[0], data[1]]) as i64;
    let hour = bcd(data[2])? as i64;
    let minute = bcd(data[3])? as i64;
    let second = bcd(data[4])? as i64;
    if hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    let days = mjd - MJD_UNIX_EPOCH;
    let secs_of_day = hour * 3600 + minute * 60 + second;
    Some(days * MS_PER_DAY + secs_of_day * 1000 - JST_OFFSET_SECS as i64 * 1000)
}

/// Decode a 24-bit BCD duration (hhmmss) into milliseconds.
///
/// Returns `None` for the undefined sentinel (all 0xFF).
pub fn decode_duration(data: &[u8]) -> Option<i64> {
    if data.len() < 3 || data[..3].iter().all(|&b| b == 0xFF) {
        return None;
    }
    let hour = bcd(data[0])? as i64;
    let minute = bcd(data[1])? as i64;
    let second = bcd(data[2])? as i64;
    Some((hour * 3600 + minute * 60 + second) * 1000)
}

/// Decode a 16-bit MJD date (series expiry) as JST midnight in epoch milliseconds.
pub fn decode_mjd_date(mjd: u16) -> Timestamp {
    (mjd as i64 - MJD_UNIX_EPOCH) * MS_PER_DAY - JST_OFFSET_SECS as i64 * 1000
}

/// Encode epoch milliseconds as MJD+BCD JST (inverse of [`decode_start_time`]).
pub fn encode_start_time(ts: Timestamp) -> [u8; 5] {
    let jst = ts + JST_OFFSET_SECS as i64 * 1000;
    let days = jst.div_euclid(MS_PER_DAY);
    let secs = jst.rem_euclid(MS_PER_DAY) / 1000;
    let mjd = (days + MJD_UNIX_EPOCH) as u16;
    let to_bcd = |v: i64| (((v / 10) << 4) | (v % 10)) as u8;
    let [m0, m1] = mjd.to_be_bytes();
    [
        m0,
        m1,
        to_bcd(secs / 3600),
        to_bcd(secs / 60 % 60),
        to_bcd(secs % 60),
    ]
}

/// Convert epoch milliseconds into a JST date-time.
pub fn to_jst(ts: Timestamp) -> Option<DateTime<FixedOffset>> {
    let jst = FixedOffset::east_opt(JST_OFFSET_SECS)?;
    jst.timestamp_millis_opt(ts).single()
}

/// Index of the 3-hour EIT schedule segment containing `ts` (JST).
pub fn jst_segment_of_day(ts: Timestamp) -> u8 {
    to_jst(ts).map(|t| (t.hour() / 3) as u8).unwrap_or(0)
}

/// JST calendar date of `ts`.
pub fn jst_date(ts: Timestamp) -> Option<NaiveDate> {
    to_jst(ts).map(|t| t.date_naive())
}
