//! MS-DOS packed date and time, as stored in ZIP headers
//!
//! Time: hours (5 bits) | minutes (6 bits) | seconds / 2 (5 bits)
//! Date: years since 1980 (7 bits) | month (4 bits) | day (5 bits)

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// The earliest moment DOS can express
fn dos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Unpacks a DOS (time, date) pair.
///
/// Garbage fields (month 13, hour 25, ...) come back as the DOS epoch
/// instead of an error; nobody should lose a file over a bad timestamp.
pub fn parse_msdos(time: u16, date: u16) -> NaiveDateTime {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    // Leap seconds don't exist in DOS land; 58 is as high as it counts.
    NaiveDate::from_ymd_opt(years, months, days)
        .and_then(|d| d.and_hms_opt(hours, minutes, seconds.min(59)))
        .unwrap_or_else(dos_epoch)
}

/// Packs a timestamp into a DOS (time, date) pair,
/// clamping it to the years DOS can represent (1980 through 2107).
pub fn to_msdos(when: &NaiveDateTime) -> (u16, u16) {
    if when.year() < 1980 {
        return to_msdos(&dos_epoch());
    }
    let years = (when.year() - 1980).min(127) as u16;

    let time = ((when.hour() as u16) << 11)
        | ((when.minute() as u16) << 5)
        | (when.second() as u16 / 2);
    let date = (years << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    (time, date)
}

#[cfg(test)]
mod test {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn known_timestamp() {
        // 2020-05-17 13:37:42
        let when = at(2020, 5, 17, 13, 37, 42);
        let (time, date) = to_msdos(&when);
        assert_eq!(time, (13 << 11) | (37 << 5) | 21);
        assert_eq!(date, (40 << 9) | (5 << 5) | 17);
        assert_eq!(parse_msdos(time, date), when);
    }

    #[test]
    fn odd_seconds_round_down() {
        let (time, date) = to_msdos(&at(1999, 12, 31, 23, 59, 59));
        assert_eq!(parse_msdos(time, date), at(1999, 12, 31, 23, 59, 58));
    }

    #[test]
    fn too_early_clamps_to_epoch() {
        let (time, date) = to_msdos(&at(1970, 1, 1, 12, 0, 0));
        assert_eq!((time, date), (0, (1 << 5) | 1));
        assert_eq!(parse_msdos(time, date), dos_epoch());
    }

    #[test]
    fn garbage_parses_as_epoch() {
        // Month zero, day zero
        assert_eq!(parse_msdos(0, 0), dos_epoch());
    }
}
