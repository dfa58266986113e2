use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::ValidationError;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionType {
    Personal,
    Webinar,
}

impl SessionType {
    pub const ALL: [SessionType; 2] = [SessionType::Personal, SessionType::Webinar];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Personal => "personal",
            SessionType::Webinar => "webinar",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personal" => Ok(SessionType::Personal),
            "webinar" => Ok(SessionType::Webinar),
            other => Err(ValidationError::UnknownSessionType(other.to_string())),
        }
    }
}

/// Everything slot-related is partitioned by provider and session type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub provider_id: Ulid,
    pub session_type: SessionType,
}

impl Scope {
    pub fn new(provider_id: Ulid, session_type: SessionType) -> Self {
        Self { provider_id, session_type }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.session_type)
    }
}

// ── Wall-clock helpers ───────────────────────────────────────────

/// Day-of-week index: 0 = Sunday … 6 = Saturday.
pub fn weekday_from_index(day: u8) -> Option<Weekday> {
    match day {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

pub fn weekday_index(weekday: Weekday) -> u8 {
    weekday.num_days_from_sunday() as u8
}

/// Parse `HH:MM` (seconds tolerated) into a wall-clock time.
pub fn parse_wall_time(s: &str) -> Result<NaiveTime, ValidationError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| ValidationError::MalformedTime(s.to_string()))
}

pub fn format_wall_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

// ── Patterns ─────────────────────────────────────────────────────

/// A recurring weekly availability rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPattern {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub session_type: SessionType,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub is_active: bool,
}

impl AvailabilityPattern {
    pub fn scope(&self) -> Scope {
        Scope::new(self.provider_id, self.session_type)
    }

    pub fn weekday(&self) -> Option<Weekday> {
        weekday_from_index(self.day_of_week)
    }

    /// Same day and intersecting wall-clock ranges. Activity is not considered.
    pub fn overlaps(&self, other: &AvailabilityPattern) -> bool {
        self.day_of_week == other.day_of_week
            && self.start_time < other.end_time
            && other.start_time < self.end_time
    }
}

/// One row of a pattern submission. `id: None` creates a new pattern,
/// `timezone: None` falls back to the provider's timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternDraft {
    pub id: Option<Ulid>,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: Option<String>,
    pub is_active: bool,
}

// ── Slots ────────────────────────────────────────────────────────

/// Natural key of a slot within its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Open,
    Held,
    Booked,
    Expired,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Open => "open",
            SlotState::Held => "held",
            SlotState::Booked => "booked",
            SlotState::Expired => "expired",
        }
    }
}

/// Stored reservation state. Hold expiry is not applied here; see
/// [`Slot::effective_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Open,
    Held { holder_token: String, expires_at: Ms },
    Booked { booking_id: Ulid },
    Expired,
}

impl SlotStatus {
    pub fn state(&self) -> SlotState {
        match self {
            SlotStatus::Open => SlotState::Open,
            SlotStatus::Held { .. } => SlotState::Held,
            SlotStatus::Booked { .. } => SlotState::Booked,
            SlotStatus::Expired => SlotState::Expired,
        }
    }
}

/// A concrete, dated, bookable instance derived from a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub scope: Scope,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    /// Concrete instants of the session.
    pub span: Span,
    pub status: SlotStatus,
    pub generated_from: Ulid,
}

impl Slot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            date: self.date,
            start_time: self.start_time,
        }
    }

    /// State as readers must see it at `now`: a lapsed hold is open again,
    /// and anything not booked whose start has passed is expired.
    pub fn effective_state(&self, now: Ms) -> SlotState {
        match &self.status {
            SlotStatus::Booked { .. } => SlotState::Booked,
            SlotStatus::Expired => SlotState::Expired,
            _ if self.span.start <= now => SlotState::Expired,
            SlotStatus::Held { expires_at, .. } if *expires_at > now => SlotState::Held,
            SlotStatus::Held { .. } | SlotStatus::Open => SlotState::Open,
        }
    }

    pub fn booking_id(&self) -> Option<Ulid> {
        match &self.status {
            SlotStatus::Booked { booking_id } => Some(*booking_id),
            _ => None,
        }
    }
}

/// A granted soft reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub slot_id: Ulid,
    pub holder_token: String,
    pub expires_at: Ms,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// `None` for a manual booking the provider schedules out-of-band.
    pub slot_id: Option<Ulid>,
    pub scope: Scope,
    pub contact: ContactDetails,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_manual(&self) -> bool {
        self.slot_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub slug: String,
    pub timezone: String,
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderRegistered {
        id: Ulid,
        slug: String,
        timezone: String,
    },
    /// The complete pattern set of a scope; one record per upsert.
    PatternsReplaced {
        scope: Scope,
        patterns: Vec<AvailabilityPattern>,
    },
    /// Insert or replace by natural key.
    SlotsUpserted {
        scope: Scope,
        slots: Vec<Slot>,
    },
    SlotsExpired {
        scope: Scope,
        slot_ids: Vec<Ulid>,
    },
    SlotsPurged {
        scope: Scope,
        slot_ids: Vec<Ulid>,
    },
    HoldPlaced {
        scope: Scope,
        slot_id: Ulid,
        holder_token: String,
        expires_at: Ms,
    },
    HoldReleased {
        scope: Scope,
        slot_id: Ulid,
    },
    /// Slot becomes BOOKED and the booking row is created in the same record.
    BookingConfirmed {
        scope: Scope,
        booking: Booking,
    },
    /// A booking row with no slot transition (manual bookings, compaction).
    BookingRecorded {
        booking: Booking,
    },
    /// Removes the booking row; a slot-bound booking reopens its slot.
    BookingCancelled {
        scope: Scope,
        booking_id: Ulid,
        slot_id: Option<Ulid>,
    },
}

impl Event {
    /// The scope whose state this event mutates, if it touches slot state.
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Event::PatternsReplaced { scope, .. }
            | Event::SlotsUpserted { scope, .. }
            | Event::SlotsExpired { scope, .. }
            | Event::SlotsPurged { scope, .. }
            | Event::HoldPlaced { scope, .. }
            | Event::HoldReleased { scope, .. }
            | Event::BookingConfirmed { scope, .. } => Some(*scope),
            Event::BookingCancelled { scope, slot_id, .. } => slot_id.map(|_| *scope),
            Event::ProviderRegistered { .. } | Event::BookingRecorded { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A bookable time as offered to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
    pub starts_at: Ms,
    pub ends_at: Ms,
}

impl From<&Slot> for SlotView {
    fn from(slot: &Slot) -> Self {
        Self {
            slot_id: slot.id,
            date: slot.date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            timezone: slot.timezone.clone(),
            starts_at: slot.span.start,
            ends_at: slot.span.end,
        }
    }
}

/// A slot with its state as of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: Slot,
    pub state: SlotState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_at(start: Ms, status: SlotStatus) -> Slot {
        Slot {
            id: Ulid::new(),
            scope: Scope::new(Ulid::new(), SessionType::Personal),
            date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            timezone: "UTC".into(),
            span: Span::new(start, start + 3_600_000),
            status,
            generated_from: Ulid::new(),
        }
    }

    fn pattern(day: u8, start: &str, end: &str) -> AvailabilityPattern {
        AvailabilityPattern {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            session_type: SessionType::Personal,
            day_of_week: day,
            start_time: parse_wall_time(start).unwrap(),
            end_time: parse_wall_time(end).unwrap(),
            timezone: "UTC".into(),
            is_active: true,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(!s.contains_instant(200)); // half-open
        assert!(s.overlaps(&Span::new(150, 250)));
        assert!(!s.overlaps(&Span::new(200, 300)));
    }

    #[test]
    fn session_type_parse() {
        assert_eq!("PERSONAL".parse::<SessionType>().unwrap(), SessionType::Personal);
        assert_eq!(" webinar ".parse::<SessionType>().unwrap(), SessionType::Webinar);
        assert!(matches!(
            "group".parse::<SessionType>(),
            Err(ValidationError::UnknownSessionType(_))
        ));
    }

    #[test]
    fn wall_time_parsing() {
        assert_eq!(parse_wall_time("09:30").unwrap(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(parse_wall_time("17:00:00").unwrap(), NaiveTime::from_hms_opt(17, 0, 0).unwrap());
        assert!(parse_wall_time("25:00").is_err());
        assert!(parse_wall_time("9h").is_err());
        assert_eq!(format_wall_time(NaiveTime::from_hms_opt(8, 5, 0).unwrap()), "08:05");
    }

    #[test]
    fn weekday_indexing_starts_on_sunday() {
        assert_eq!(weekday_from_index(0), Some(Weekday::Sun));
        assert_eq!(weekday_from_index(1), Some(Weekday::Mon));
        assert_eq!(weekday_from_index(6), Some(Weekday::Sat));
        assert_eq!(weekday_from_index(7), None);
        assert_eq!(weekday_index(Weekday::Wed), 3);
    }

    #[test]
    fn pattern_overlap_rules() {
        let a = pattern(1, "09:00", "12:00");
        assert!(a.overlaps(&pattern(1, "11:00", "13:00")));
        assert!(!a.overlaps(&pattern(1, "12:00", "13:00"))); // adjacent
        assert!(!a.overlaps(&pattern(2, "09:00", "12:00"))); // other day
    }

    #[test]
    fn effective_state_open_and_past() {
        let slot = slot_at(10_000, SlotStatus::Open);
        assert_eq!(slot.effective_state(5_000), SlotState::Open);
        assert_eq!(slot.effective_state(10_000), SlotState::Expired);
    }

    #[test]
    fn effective_state_lapsed_hold_reads_open() {
        let slot = slot_at(
            100_000,
            SlotStatus::Held { holder_token: "t".into(), expires_at: 50_000 },
        );
        assert_eq!(slot.effective_state(40_000), SlotState::Held);
        assert_eq!(slot.effective_state(50_000), SlotState::Open);
        assert_eq!(slot.effective_state(100_000), SlotState::Expired);
    }

    #[test]
    fn effective_state_booked_survives_start() {
        let booking_id = Ulid::new();
        let slot = slot_at(10_000, SlotStatus::Booked { booking_id });
        assert_eq!(slot.effective_state(20_000), SlotState::Booked);
        assert_eq!(slot.booking_id(), Some(booking_id));
    }

    #[test]
    fn event_scope_extraction() {
        let scope = Scope::new(Ulid::new(), SessionType::Webinar);
        let e = Event::HoldReleased { scope, slot_id: Ulid::new() };
        assert_eq!(e.scope(), Some(scope));
        let e = Event::BookingCancelled { scope, booking_id: Ulid::new(), slot_id: None };
        assert_eq!(e.scope(), None);
        let e = Event::BookingCancelled { scope, booking_id: Ulid::new(), slot_id: Some(Ulid::new()) };
        assert_eq!(e.scope(), Some(scope));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let slot = slot_at(1_000, SlotStatus::Open);
        let event = Event::SlotsUpserted { scope: slot.scope, slots: vec![slot] };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
