#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kira-time** – UTC discipline and timezone-aware window math.
//!
//! Every timestamp the kernel persists is ISO-8601 UTC; local times never
//! touch disk. This crate owns the formatting/parsing rules and the
//! day/week/month window calculations, which are performed in a configured
//! IANA zone and returned as UTC instants. A local "day" may be 23, 24 or 25
//! hours long across DST transitions and the window math has to honour that.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat,
    TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced by timestamp parsing and window computation.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// The string does not name a known IANA timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    /// The string is not a parseable ISO-8601 timestamp.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Default IANA zone when configuration does not supply one.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Brussels;

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, TimeError> {
    name.parse::<Tz>()
        .map_err(|_| TimeError::InvalidTimezone(name.to_string()))
}

//─────────────────────────────
//  Formatting & parsing
//─────────────────────────────

/// Current instant in UTC.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Format an instant as ISO-8601 UTC with a numeric `+00:00` offset.
pub fn format_utc_iso8601(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parse an ISO-8601 timestamp and normalise it to UTC.
///
/// Accepts `Z` and numeric offsets; a naive timestamp is taken as UTC, which
/// matches how the vault treats historical files written before the UTC
/// discipline was enforced.
pub fn parse_utc_iso8601(value: &str) -> Result<DateTime<Utc>, TimeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date.and_time(NaiveTime::MIN);
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(TimeError::InvalidTimestamp(value.to_string()))
}

/// Whether a persisted timestamp string satisfies the UTC discipline
/// (parses, and carries a `Z` or `+00:00` suffix).
pub fn is_utc_iso8601(value: &str) -> bool {
    (value.ends_with('Z') || value.ends_with("+00:00")) && parse_utc_iso8601(value).is_ok()
}

/// Format an instant for embedding in an entity ID: `YYYYMMDD-HHmm` in the
/// given local zone.
pub fn format_datetime_for_id(dt: DateTime<Utc>, tz: Tz) -> String {
    dt.with_timezone(&tz).format("%Y%m%d-%H%M").to_string()
}

/// Parse the `YYYYMMDD-HHmm` ID timestamp back into a UTC instant, treating
/// the digits as local wall-clock time in `tz`.
pub fn parse_id_timestamp(value: &str, tz: Tz) -> Result<DateTime<Utc>, TimeError> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%d-%H%M")
        .map_err(|_| TimeError::InvalidTimestamp(value.to_string()))?;
    Ok(resolve_local(naive, tz))
}

//─────────────────────────────
//  Window calculations
//─────────────────────────────

/// A half-open `[start, end)` window expressed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcWindow {
    /// Inclusive start of the window.
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
}

impl UtcWindow {
    /// Window length.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Whether an instant falls inside the window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// Resolve a naive local wall-clock time in `tz` to a UTC instant.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier offset;
/// nonexistent local times (DST spring-forward) roll forward until a valid
/// wall-clock time is found.
fn resolve_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _later) => earlier.with_timezone(&Utc),
        LocalResult::None => {
            // Skipped by a DST transition; the gap is at most a few hours.
            let mut probe = naive;
            for _ in 0..6 {
                probe += Duration::hours(1);
                if let LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    return dt.with_timezone(&Utc);
                }
            }
            // Transitions larger than six hours do not exist in the tz db.
            Utc.from_utc_datetime(&naive)
        }
    }
}

fn local_midnight_utc(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    resolve_local(date.and_time(NaiveTime::MIN), tz)
}

/// UTC boundaries of a local calendar day.
pub fn day_window_utc(date: NaiveDate, tz: Tz) -> UtcWindow {
    let start = local_midnight_utc(date, tz);
    let end = local_midnight_utc(date + Duration::days(1), tz);
    UtcWindow { start, end }
}

/// First day of the week containing `date`, for a configurable week start.
pub fn week_start(date: NaiveDate, start_on: Weekday) -> NaiveDate {
    let offset = (7 + date.weekday().num_days_from_monday() as i64
        - start_on.num_days_from_monday() as i64)
        % 7;
    date - Duration::days(offset)
}

/// UTC boundaries of the local week containing `date`.
pub fn week_window_utc(date: NaiveDate, tz: Tz, start_on: Weekday) -> UtcWindow {
    let first = week_start(date, start_on);
    let start = local_midnight_utc(first, tz);
    let end = local_midnight_utc(first + Duration::days(7), tz);
    UtcWindow { start, end }
}

/// UTC boundaries of the local calendar month containing `date`.
pub fn month_window_utc(date: NaiveDate, tz: Tz) -> UtcWindow {
    let first = date.with_day(1).unwrap_or(date);
    let next_month = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .unwrap_or(first);
    UtcWindow {
        start: local_midnight_utc(first, tz),
        end: local_midnight_utc(next_month, tz),
    }
}
