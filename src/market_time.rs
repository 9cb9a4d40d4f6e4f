// =============================================================================
// Market Time — US/Eastern session clock helpers
// =============================================================================
//
// All business-logic timestamps use America/New_York regardless of machine
// locale. The regular session runs 09:30–16:00 ET; the engine stops opening
// new positions at the entry cutoff (default 15:30) and flattens everything
// at the EOD exit time (default 15:58).
//
// Timeline:
//   09:30 – entry_cutoff : normal trading
//   entry_cutoff – eod   : no new entries, open trades keep running
//   eod – 16:00          : all positions closed, all working orders cancelled
// =============================================================================

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;

/// Parse an "HH:MM" config string into a `NaiveTime`.
///
/// Returns `None` on malformed input so callers can fall back to their
/// defaults with a warning rather than aborting.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Convert a UTC instant into Eastern wall-clock time.
pub fn to_eastern(ts: DateTime<Utc>) -> DateTime<chrono_tz::Tz> {
    New_York.from_utc_datetime(&ts.naive_utc())
}

/// Minutes since midnight in Eastern time for the given instant.
fn eastern_minutes(ts: DateTime<Utc>) -> u32 {
    let et = to_eastern(ts);
    et.hour() * 60 + et.minute()
}

/// True once the Eastern wall clock has reached `cutoff` (inclusive).
///
/// An entry submitted exactly at the cutoff minute is rejected.
pub fn at_or_past(ts: DateTime<Utc>, cutoff: NaiveTime) -> bool {
    eastern_minutes(ts) >= cutoff.hour() * 60 + cutoff.minute()
}

/// Bucket an instant to its Eastern minute, formatted `YYYYMMDDHHMM`.
///
/// Used to make client order ids deterministic within one bar: two
/// submission attempts in the same minute hash to the same id.
pub fn minute_bucket(ts: DateTime<Utc>) -> String {
    to_eastern(ts).format("%Y%m%d%H%M").to_string()
}

/// The Eastern trading date (`YYYY-MM-DD`) for daily counters.
pub fn trading_date(ts: DateTime<Utc>) -> String {
    to_eastern(ts).format("%Y-%m-%d").to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parse_hhmm_valid_and_invalid() {
        assert_eq!(parse_hhmm("15:30"), NaiveTime::from_hms_opt(15, 30, 0));
        assert_eq!(parse_hhmm("9:05"), NaiveTime::from_hms_opt(9, 5, 0));
        assert!(parse_hhmm("").is_none());
        assert!(parse_hhmm("25:00").is_none());
        assert!(parse_hhmm("15-30").is_none());
        assert!(parse_hhmm("15:xx").is_none());
    }

    #[test]
    fn cutoff_boundary_is_inclusive() {
        // 2026-03-16 is after the US DST switch: ET = UTC-4.
        // 19:30 UTC == 15:30 ET.
        let cutoff = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        assert!(!at_or_past(utc(2026, 3, 16, 19, 29), cutoff));
        assert!(at_or_past(utc(2026, 3, 16, 19, 30), cutoff));
        assert!(at_or_past(utc(2026, 3, 16, 19, 31), cutoff));
    }

    #[test]
    fn cutoff_respects_winter_offset() {
        // 2026-01-12: ET = UTC-5, so 20:30 UTC == 15:30 ET.
        let cutoff = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        assert!(!at_or_past(utc(2026, 1, 12, 19, 30), cutoff));
        assert!(at_or_past(utc(2026, 1, 12, 20, 30), cutoff));
    }

    #[test]
    fn eod_exit_boundary() {
        let eod = NaiveTime::from_hms_opt(15, 58, 0).unwrap();
        assert!(!at_or_past(utc(2026, 3, 16, 19, 57), eod));
        assert!(at_or_past(utc(2026, 3, 16, 19, 58), eod));
    }

    #[test]
    fn minute_bucket_is_stable_within_a_minute() {
        let a = Utc.with_ymd_and_hms(2026, 3, 16, 14, 5, 3).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 16, 14, 5, 57).unwrap();
        assert_eq!(minute_bucket(a), minute_bucket(b));

        let c = Utc.with_ymd_and_hms(2026, 3, 16, 14, 6, 0).unwrap();
        assert_ne!(minute_bucket(a), minute_bucket(c));
    }

    #[test]
    fn minute_bucket_uses_eastern_wall_clock() {
        // 19:30 UTC on a DST date is 15:30 ET.
        let ts = utc(2026, 3, 16, 19, 30);
        assert_eq!(minute_bucket(ts), "202603161530");
    }

    #[test]
    fn trading_date_rolls_at_eastern_midnight() {
        // 03:00 UTC is still the previous day in New York (23:00 ET).
        let ts = utc(2026, 3, 17, 3, 0);
        assert_eq!(trading_date(ts), "2026-03-16");
    }
}
