//! CP56Time2a time tag.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Iec60870Error, Result};

/// CP56Time2a timestamp (7 bytes).
///
/// ```text
/// byte 0-1: milliseconds (0-59999, LE)
/// byte 2:   IV | res | minutes (6 bit)
/// byte 3:   SU | res | hours (5 bit)
/// byte 4:   day of week (3 bit) | day of month (5 bit)
/// byte 5:   month (4 bit)
/// byte 6:   year (7 bit, years since 2000)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cp56Time2a {
    /// Milliseconds within the minute (0-59999)
    pub milliseconds: u16,
    /// Minutes (0-59)
    pub minutes: u8,
    /// Hours (0-23)
    pub hours: u8,
    /// Day of month (1-31)
    pub day: u8,
    /// Day of week (1-7, 1=Monday, 0=unused)
    pub day_of_week: u8,
    /// Month (1-12)
    pub month: u8,
    /// Year (0-99, years since 2000)
    pub year: u8,
    /// Invalid flag
    pub invalid: bool,
    /// Summer time flag
    pub summer_time: bool,
}

impl Cp56Time2a {
    /// Encoded size in bytes.
    pub const LEN: usize = 7;

    /// Parse from 7 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(Iec60870Error::malformed("CP56Time2a too short"));
        }

        Ok(Self {
            milliseconds: u16::from_le_bytes([bytes[0], bytes[1]]),
            minutes: bytes[2] & 0x3F,
            invalid: (bytes[2] & 0x80) != 0,
            hours: bytes[3] & 0x1F,
            summer_time: (bytes[3] & 0x80) != 0,
            day: bytes[4] & 0x1F,
            day_of_week: (bytes[4] >> 5) & 0x07,
            month: bytes[5] & 0x0F,
            year: bytes[6] & 0x7F,
        })
    }

    /// Encode to 7 bytes.
    pub fn to_bytes(&self) -> [u8; 7] {
        let ms = self.milliseconds.to_le_bytes();
        [
            ms[0],
            ms[1],
            (self.minutes & 0x3F) | if self.invalid { 0x80 } else { 0 },
            (self.hours & 0x1F) | if self.summer_time { 0x80 } else { 0 },
            (self.day & 0x1F) | ((self.day_of_week & 0x07) << 5),
            self.month & 0x0F,
            self.year & 0x7F,
        ]
    }

    /// Build a time tag from a UTC date time.
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        // Leap seconds report nanoseconds >= 1e9
        let millis = (dt.nanosecond() / 1_000_000).min(999);
        Self {
            milliseconds: (dt.second() * 1000 + millis) as u16,
            minutes: dt.minute() as u8,
            hours: dt.hour() as u8,
            day: dt.day() as u8,
            day_of_week: dt.weekday().number_from_monday() as u8,
            month: dt.month() as u8,
            year: (dt.year().rem_euclid(100)) as u8,
            invalid: false,
            summer_time: false,
        }
    }

    /// Current wall clock time.
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    /// Convert to a UTC date time, `None` if the fields do not form a valid date.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let naive = NaiveDate::from_ymd_opt(2000 + self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_milli_opt(
                self.hours as u32,
                self.minutes as u32,
                (self.milliseconds / 1000) as u32,
                (self.milliseconds % 1000) as u32,
            )?;
        Some(Utc.from_utc_datetime(&naive))
    }
}

impl std::fmt::Display for Cp56Time2a {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "20{:02}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            self.year,
            self.month,
            self.day,
            self.hours,
            self.minutes,
            self.milliseconds / 1000,
            self.milliseconds % 1000
        )?;
        if self.invalid {
            f.write_str(" IV")?;
        }
        Ok(())
    }
}
