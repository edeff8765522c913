//! Conversion utilities
//!
//! Database timestamps are 32-bit and compared as unsigned, so they keep working past 2038.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Convert a database timestamp to a [`DateTime<Utc>`]
pub(crate) fn ts_to_dt(ts: u32) -> Result<Option<DateTime<Utc>>> {
    if ts == 0 {
        return Ok(None);
    }
    DateTime::from_timestamp(ts.into(), 0)
        .map(Some)
        .ok_or(Error::TimestampConversion)
}

/// Convert a [`DateTime<Utc>`] to a database timestamp
pub(crate) fn dt_to_ts(dt: Option<DateTime<Utc>>) -> Result<u32> {
    if let Some(dt) = dt {
        dt.timestamp().try_into().map_err(Error::DateTimeConversion)
    } else {
        Ok(0)
    }
}

/// Convert a database delta to a [`Duration`]
pub(crate) fn delta_to_dur(delta: u32) -> Option<Duration> {
    if delta == 0 {
        None
    } else {
        Some(Duration::from_secs(delta.into()))
    }
}

/// Convert a [`Duration`] to a database delta
pub(crate) fn dur_to_delta(dur: Option<Duration>) -> Result<u32> {
    if let Some(dur) = dur {
        dur.as_secs().try_into().map_err(Error::DurationConversion)
    } else {
        Ok(0)
    }
}

/// Current time as a database timestamp
pub(crate) fn now_ts() -> u32 {
    // Truncation is intended: timestamps wrap in 2106
    Utc::now().timestamp() as u32
}

/// Current time as seconds and microseconds
pub(crate) fn now_timeval() -> (u32, u32) {
    let now = Utc::now();
    (now.timestamp() as u32, now.timestamp_subsec_micros())
}

/// `a` is strictly later than `b`
pub(crate) fn ts_after(a: u32, b: u32) -> bool {
    a > b
}

/// Add a delta to a timestamp
pub(crate) fn ts_incr(ts: u32, delta: u32) -> u32 {
    ts.wrapping_add(delta)
}

/// Signed difference between two timestamps
pub(crate) fn ts_delta(a: u32, b: u32) -> i64 {
    i64::from(a) - i64::from(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timestamp_is_none() -> Result<()> {
        assert_eq!(ts_to_dt(0)?, None);
        assert_eq!(dt_to_ts(None)?, 0);
        Ok(())
    }

    #[test]
    fn timestamp_past_2038() -> Result<()> {
        let ts = 0x8000_0010;
        let dt = ts_to_dt(ts)?;
        assert_eq!(dt_to_ts(dt)?, ts);
        assert!(ts_after(ts, 0x7fff_ffff));
        Ok(())
    }

    #[test]
    fn durations() -> Result<()> {
        assert_eq!(delta_to_dur(0), None);
        assert_eq!(delta_to_dur(60), Some(Duration::from_secs(60)));
        assert_eq!(dur_to_delta(Some(Duration::from_secs(3600)))?, 3600);
        Ok(())
    }
}
