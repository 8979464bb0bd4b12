//! FILETIME-shaped timestamps.
//!
//! The host driver expects 64-bit timestamps counted in 100-nanosecond
//! intervals since 1601-01-01 UTC. Remote stores report modification times as
//! [`chrono`] instants; the conversions live here.

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_DELTA_SECS: i64 = 11_644_473_600;

/// Intervals per second.
const INTERVALS_PER_SEC: i64 = 10_000_000;

/// Converts an instant to a FILETIME-shaped timestamp. Instants before 1601
/// clamp to zero.
pub fn filetime_from(instant: DateTime<Utc>) -> u64 {
    let secs = instant.timestamp() + EPOCH_DELTA_SECS;
    if secs < 0 {
        return 0;
    }
    let intervals = secs * INTERVALS_PER_SEC + i64::from(instant.timestamp_subsec_nanos() / 100);
    intervals as u64
}

/// The current instant as a FILETIME-shaped timestamp.
pub fn filetime_now() -> u64 {
    filetime_from(Utc::now())
}

/// Converts a FILETIME-shaped timestamp back to an instant.
pub fn datetime_from(filetime: u64) -> DateTime<Utc> {
    let secs = (filetime / INTERVALS_PER_SEC as u64) as i64 - EPOCH_DELTA_SECS;
    let nanos = (filetime % INTERVALS_PER_SEC as u64) as u32 * 100;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unix_epoch_maps_to_known_value() {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap();
        assert_eq!(filetime_from(epoch), 116_444_736_000_000_000);
    }

    #[test]
    fn round_trips_at_second_precision() {
        let instant = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).single().unwrap();
        assert_eq!(datetime_from(filetime_from(instant)), instant);
    }

    #[test]
    fn pre_1601_clamps_to_zero() {
        let ancient = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(filetime_from(ancient), 0);
    }
}
