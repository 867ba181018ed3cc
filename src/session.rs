//! Market clock
//!
//! All decisions take an explicit `now: DateTime<Utc>`; this module converts
//! it to exchange-local (Asia/Kolkata) wall time.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Asia::Kolkata;
use chrono_tz::Tz;
use std::fmt;

pub const MARKET_TZ: Tz = Kolkata;

const MARKET_OPEN: (u32, u32) = (9, 15);
const MARKET_CLOSE: (u32, u32) = (15, 30);

pub fn local(now: DateTime<Utc>) -> DateTime<Tz> {
    now.with_timezone(&MARKET_TZ)
}

pub fn local_time(now: DateTime<Utc>) -> NaiveTime {
    local(now).time()
}

/// Trading date (exchange-local calendar date)
pub fn trading_date(now: DateTime<Utc>) -> NaiveDate {
    local(now).date_naive()
}

/// Build a UTC instant from an exchange-local date and time
pub fn at_local(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    MARKET_TZ
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

pub fn is_market_open(now: DateTime<Utc>) -> bool {
    let t = local_time(now);
    let open = hm(MARKET_OPEN.0, MARKET_OPEN.1);
    let close = hm(MARKET_CLOSE.0, MARKET_CLOSE.1);
    t >= open && t < close
}

/// True once local time has reached `cutoff`
pub fn is_past_cutoff(now: DateTime<Utc>, cutoff: NaiveTime) -> bool {
    local_time(now) >= cutoff
}

/// Parse `HH:MM` (or `H:MM`)
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    NaiveTime::from_hms_opt(h, m, 0)
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// Half-open local time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `"HH:MM-HH:MM"`; `None` when malformed or empty
    pub fn parse(s: &str) -> Option<Self> {
        let (a, b) = s.trim().split_once('-')?;
        let start = parse_hhmm(a)?;
        let end = parse_hhmm(b)?;
        if end <= start {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        let t = t.with_nanosecond(0).unwrap_or(t);
        t >= self.start && t < self.end
    }

    pub fn contains_instant(&self, now: DateTime<Utc>) -> bool {
        self.contains(local_time(now))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}
