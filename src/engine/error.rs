use chrono::NaiveTime;
use ulid::Ulid;

fn hm(t: &NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Rejected input. Never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error(
        "patterns overlap on day {day}: {}-{} and {}-{}",
        hm(.first_start),
        hm(.first_end),
        hm(.second_start),
        hm(.second_end)
    )]
    Overlap {
        day: u8,
        first_start: NaiveTime,
        first_end: NaiveTime,
        second_start: NaiveTime,
        second_end: NaiveTime,
    },
    #[error("malformed time range on day {day}: {} is not before {}", hm(.start), hm(.end))]
    MalformedRange {
        day: u8,
        start: NaiveTime,
        end: NaiveTime,
    },
    #[error("malformed time: {0} (expected HH:MM)")]
    MalformedTime(String),
    #[error("invalid day of week: {0} (expected 0-6, 0 = Sunday)")]
    InvalidDay(u8),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("unknown session type: {0}")]
    UnknownSessionType(String),
    #[error("duplicate pattern id in submission: {0}")]
    DuplicatePattern(Ulid),
    #[error("pattern {0} belongs to another provider or session type")]
    ForeignPattern(Ulid),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("slot unavailable: {0}")]
    SlotUnavailable(Ulid),
    #[error("hold expired on slot {0}")]
    HoldExpired(Ulid),
    #[error("slot {0} is held by another party")]
    HoldMismatch(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Expected outcomes of competing for the same slot. Callers re-fetch and
    /// re-offer rather than treating these as faults.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            EngineError::SlotUnavailable(_) | EngineError::HoldExpired(_) | EngineError::HoldMismatch(_)
        )
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::HoldMismatch(_) => "hold_mismatch",
            EngineError::NotFound(_) => "not_found",
            EngineError::UnknownProvider(_) => "unknown_provider",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
