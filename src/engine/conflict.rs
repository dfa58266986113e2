use crate::limits::*;
use crate::model::*;

use super::{EngineError, ValidationError};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// OPEN → HELD. The current holder may re-hold to extend its own hold.
pub(crate) fn check_holdable(slot: &Slot, holder_token: &str, now: Ms) -> Result<(), EngineError> {
    match slot.effective_state(now) {
        SlotState::Open => Ok(()),
        SlotState::Held if held_by(slot, holder_token) => Ok(()),
        _ => Err(EngineError::SlotUnavailable(slot.id)),
    }
}

/// HELD (by `holder_token`, not lapsed) → BOOKED.
pub(crate) fn check_confirmable(slot: &Slot, holder_token: &str, now: Ms) -> Result<(), EngineError> {
    match slot.effective_state(now) {
        SlotState::Held if held_by(slot, holder_token) => Ok(()),
        SlotState::Held => Err(EngineError::HoldMismatch(slot.id)),
        SlotState::Open => Err(EngineError::HoldExpired(slot.id)),
        SlotState::Booked | SlotState::Expired => Err(EngineError::SlotUnavailable(slot.id)),
    }
}

/// OPEN → BOOKED in one step.
pub(crate) fn check_bookable(slot: &Slot, now: Ms) -> Result<(), EngineError> {
    match slot.effective_state(now) {
        SlotState::Open => Ok(()),
        _ => Err(EngineError::SlotUnavailable(slot.id)),
    }
}

/// HELD → OPEN by the holder. A lapsed hold may still be released by its
/// holder; it reads as open either way.
pub(crate) fn check_releasable(slot: &Slot, holder_token: &str, now: Ms) -> Result<(), EngineError> {
    match (&slot.status, slot.effective_state(now)) {
        (SlotStatus::Held { .. }, _) if held_by(slot, holder_token) => Ok(()),
        (_, SlotState::Held) => Err(EngineError::HoldMismatch(slot.id)),
        (_, SlotState::Booked) => Err(EngineError::SlotUnavailable(slot.id)),
        _ => Err(EngineError::HoldExpired(slot.id)),
    }
}

fn held_by(slot: &Slot, holder_token: &str) -> bool {
    matches!(&slot.status, SlotStatus::Held { holder_token: t, .. } if t == holder_token)
}

pub(crate) fn validate_holder_token(token: &str) -> Result<(), EngineError> {
    if token.trim().is_empty() {
        return Err(ValidationError::MissingField("holder_token").into());
    }
    if token.len() > MAX_HOLDER_TOKEN_LEN {
        return Err(EngineError::LimitExceeded("holder token too long"));
    }
    Ok(())
}

/// Bound a requested hold TTL. `None` takes the default.
pub(crate) fn resolve_hold_ttl(requested: Option<Ms>, default: Ms, max: Ms) -> Result<Ms, EngineError> {
    let ttl = requested.unwrap_or(default);
    if ttl <= 0 {
        return Err(ValidationError::InvalidField {
            field: "ttl_ms",
            reason: "must be positive".into(),
        }
        .into());
    }
    if ttl > max {
        return Err(EngineError::LimitExceeded("hold ttl too long"));
    }
    Ok(ttl)
}

pub(crate) fn validate_contact(contact: &ContactDetails) -> Result<(), EngineError> {
    let name = contact.name.trim();
    let email = contact.email.trim();
    if name.is_empty() {
        return Err(ValidationError::MissingField("client_name").into());
    }
    if email.is_empty() {
        return Err(ValidationError::MissingField("client_email").into());
    }
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(ValidationError::InvalidField {
            field: "client_email",
            reason: format!("{email:?} is not an email address"),
        }
        .into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("client name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("client email too long"));
    }
    if contact.phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN) {
        return Err(EngineError::LimitExceeded("client phone too long"));
    }
    if contact.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("client notes too long"));
    }
    Ok(())
}
