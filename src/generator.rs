//! Expands weekly patterns into concrete slot candidates.
//!
//! Pure and deterministic: the same patterns, window, duration and `now`
//! always yield the same candidates in the same order. Nothing here touches
//! stored slots; merging candidates into the slot store happens in
//! `engine::slots`.

use std::collections::HashSet;

use chrono::{Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

/// Half-open calendar window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// `today + 0 .. today + days`.
    pub fn rolling(today: NaiveDate, days: u32) -> Self {
        Self {
            start: today,
            end: today + Duration::days(days as i64),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d < self.end)
    }
}

/// One slot the patterns say should exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCandidate {
    pub pattern_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub span: Span,
}

impl SlotCandidate {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            date: self.date,
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternErrorKind {
    #[error("unknown timezone {0}")]
    UnknownTimezone(String),
    #[error("invalid day of week {0}")]
    InvalidDay(u8),
    #[error("start {start} is not before end {end}")]
    MalformedRange { start: NaiveTime, end: NaiveTime },
}

/// A pattern that could not be expanded. Other patterns are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pattern {pattern_id}: {kind}")]
pub struct PatternError {
    pub pattern_id: Ulid,
    pub kind: PatternErrorKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generated {
    /// Sorted by natural key, at most one per key.
    pub candidates: Vec<SlotCandidate>,
    pub errors: Vec<PatternError>,
    /// Local start times that do not exist (DST gap) and were skipped.
    pub skipped_nonexistent: usize,
}

/// Today's calendar date in `tz` at instant `now`.
pub fn today_in(tz: Tz, now: Ms) -> NaiveDate {
    tz.timestamp_millis_opt(now)
        .earliest()
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

/// Expand every active pattern over `window`, subdividing each pattern's
/// range into `duration_ms`-long sessions. A trailing remainder shorter than
/// one session is dropped, as is any candidate starting at or before `now`.
pub fn generate(
    patterns: &[AvailabilityPattern],
    window: &DateWindow,
    duration_ms: Ms,
    now: Ms,
) -> Generated {
    let mut out = Generated::default();
    if duration_ms <= 0 {
        return out;
    }
    let step = Duration::milliseconds(duration_ms);
    let mut seen: HashSet<SlotKey> = HashSet::new();

    for pattern in patterns.iter().filter(|p| p.is_active) {
        let tz = match check_pattern(pattern) {
            Ok(tz) => tz,
            Err(kind) => {
                out.errors.push(PatternError { pattern_id: pattern.id, kind });
                continue;
            }
        };
        let weekday = weekday_from_index(pattern.day_of_week);

        for date in window.days().filter(|d| Some(d.weekday()) == weekday) {
            let mut local_start = date.and_time(pattern.start_time);
            let range_end = date.and_time(pattern.end_time);

            while local_start + step <= range_end {
                let start_time = local_start.time();
                let next = local_start + step;
                let instant = match tz.from_local_datetime(&local_start) {
                    LocalResult::Single(dt) => Some(dt),
                    LocalResult::Ambiguous(earliest, _) => Some(earliest),
                    LocalResult::None => None,
                };
                match instant {
                    None => out.skipped_nonexistent += 1,
                    Some(dt) => {
                        let start = dt.timestamp_millis();
                        let key = SlotKey { date, start_time };
                        if start > now && seen.insert(key) {
                            out.candidates.push(SlotCandidate {
                                pattern_id: pattern.id,
                                date,
                                start_time,
                                end_time: next.time(),
                                timezone: pattern.timezone.clone(),
                                span: Span::new(start, start + duration_ms),
                            });
                        }
                    }
                }
                local_start = next;
            }
        }
    }

    out.candidates.sort_by_key(|c| c.key());
    out
}

fn check_pattern(pattern: &AvailabilityPattern) -> Result<Tz, PatternErrorKind> {
    if pattern.day_of_week > 6 {
        return Err(PatternErrorKind::InvalidDay(pattern.day_of_week));
    }
    if pattern.start_time >= pattern.end_time {
        return Err(PatternErrorKind::MalformedRange {
            start: pattern.start_time,
            end: pattern.end_time,
        });
    }
    parse_timezone(&pattern.timezone)
        .ok_or_else(|| PatternErrorKind::UnknownTimezone(pattern.timezone.clone()))
}
