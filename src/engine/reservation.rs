use dashmap::DashSet;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{
    check_bookable, check_confirmable, check_holdable, check_releasable, now_ms, resolve_hold_ttl,
    validate_contact, validate_holder_token,
};
use super::{Engine, EngineError};

fn count_conflict(err: &EngineError) {
    if err.is_race() {
        metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL, "reason" => err.label())
            .increment(1);
    }
}

/// Keeps a booking id reserved until dropped. Held across the commit so a
/// concurrent booking with the same id, in any scope, is refused.
struct BookingIdClaim<'a> {
    claims: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for BookingIdClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

impl Engine {
    /// OPEN → HELD for `ttl_ms` (default TTL when `None`). The holder may
    /// call again to extend its own hold.
    pub async fn hold_slot(&self, slot_id: Ulid, holder_token: &str, ttl_ms: Option<Ms>) -> Result<Hold, EngineError> {
        validate_holder_token(holder_token)?;
        let ttl = resolve_hold_ttl(ttl_ms, self.settings.default_hold_ttl_ms, self.settings.max_hold_ttl_ms)?;

        let mut guard = self.resolve_slot_write(&slot_id).await?;
        let now = now_ms();
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        check_holdable(slot, holder_token, now).inspect_err(count_conflict)?;

        let expires_at = now + ttl;
        let event = Event::HoldPlaced {
            scope: guard.scope,
            slot_id,
            holder_token: holder_token.to_string(),
            expires_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::HOLDS_PLACED_TOTAL).increment(1);
        debug!("hold on slot {slot_id} until {expires_at}");
        Ok(Hold { slot_id, holder_token: holder_token.to_string(), expires_at })
    }

    /// HELD → OPEN by the holder, or EXPIRED if its pattern is gone.
    pub async fn release_hold(&self, slot_id: Ulid, holder_token: &str) -> Result<(), EngineError> {
        let mut guard = self.resolve_slot_write(&slot_id).await?;
        let now = now_ms();
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        check_releasable(slot, holder_token, now)?;

        let event = Event::HoldReleased { scope: guard.scope, slot_id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.retire_if_orphaned(&mut guard, slot_id, now).await?;
        debug!("hold on slot {slot_id} released");
        Ok(())
    }

    /// HELD (by `holder_token`) → BOOKED, creating the booking in the same
    /// record.
    pub async fn confirm_booking(
        &self,
        slot_id: Ulid,
        holder_token: &str,
        contact: ContactDetails,
        booking_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        validate_contact(&contact)?;
        let mut guard = self.resolve_slot_write(&slot_id).await?;
        let now = now_ms();
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        check_confirmable(slot, holder_token, now).inspect_err(count_conflict)?;

        let (booking, claim) = self.new_booking(booking_id, Some(slot_id), guard.scope, contact, now)?;
        let event = Event::BookingConfirmed { scope: guard.scope, booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(claim);
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "kind" => "confirmed").increment(1);
        info!("booking {} confirmed on slot {slot_id}", booking.id);
        self.dispatch_booking(booking.clone());
        Ok(booking)
    }

    /// OPEN → BOOKED in one atomic step, for callers that skip the hold.
    pub async fn book_directly(
        &self,
        slot_id: Ulid,
        contact: ContactDetails,
        booking_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        validate_contact(&contact)?;
        let mut guard = self.resolve_slot_write(&slot_id).await?;
        let now = now_ms();
        let slot = guard.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        check_bookable(slot, now).inspect_err(count_conflict)?;

        let (booking, claim) = self.new_booking(booking_id, Some(slot_id), guard.scope, contact, now)?;
        let event = Event::BookingConfirmed { scope: guard.scope, booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(claim);
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "kind" => "direct").increment(1);
        info!("booking {} made directly on slot {slot_id}", booking.id);
        self.dispatch_booking(booking.clone());
        Ok(booking)
    }

    /// Contact-only booking with no slot, for the provider to schedule by hand.
    pub async fn create_manual_booking(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        contact: ContactDetails,
        booking_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        validate_contact(&contact)?;
        self.require_provider(&provider_id)?;

        let directory = self.directory_lock.lock().await;
        let scope = Scope::new(provider_id, session_type);
        let (booking, claim) = self.new_booking(booking_id, None, scope, contact, now_ms())?;
        let event = Event::BookingRecorded { booking: booking.clone() };
        self.persist_shared(&event).await?;
        drop(claim);
        drop(directory);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "kind" => "manual").increment(1);
        info!("manual booking {} recorded for {scope}", booking.id);
        self.dispatch_booking(booking.clone());
        Ok(booking)
    }

    /// BOOKED → OPEN (EXPIRED if its pattern is gone) and the booking row is
    /// removed. A manual booking is simply removed.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.get_booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;

        match booking.slot_id {
            Some(slot_id) => {
                let mut guard = self.resolve_slot_write(&slot_id).await?;
                // Re-check under the lock: a concurrent cancel may have won.
                if !self.bookings.contains_key(&booking_id) {
                    return Err(EngineError::NotFound(booking_id));
                }
                let event = Event::BookingCancelled { scope: guard.scope, booking_id, slot_id: Some(slot_id) };
                self.persist_and_apply(&mut guard, &event).await?;
                self.retire_if_orphaned(&mut guard, slot_id, now_ms()).await?;
            }
            None => {
                let _directory = self.directory_lock.lock().await;
                if !self.bookings.contains_key(&booking_id) {
                    return Err(EngineError::NotFound(booking_id));
                }
                let event = Event::BookingCancelled { scope: booking.scope, booking_id, slot_id: None };
                self.persist_shared(&event).await?;
            }
        }
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {booking_id} cancelled");
        Ok(booking)
    }

    fn new_booking(
        &self,
        id: Option<Ulid>,
        slot_id: Option<Ulid>,
        scope: Scope,
        contact: ContactDetails,
        now: Ms,
    ) -> Result<(Booking, BookingIdClaim<'_>), EngineError> {
        let id = id.unwrap_or_else(Ulid::new);
        // Claim first, then check: a committed id is in `bookings` before
        // its claim is released.
        if !self.booking_claims.insert(id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }
        let claim = BookingIdClaim { claims: &self.booking_claims, id };
        if self.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }
        let contact = ContactDetails {
            name: contact.name.trim().to_string(),
            email: contact.email.trim().to_string(),
            phone: contact.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
            notes: contact.notes.filter(|n| !n.trim().is_empty()),
        };
        Ok((Booking { id, slot_id, scope, contact, created_at: now }, claim))
    }
}
