use chrono::NaiveDate;
use ulid::Ulid;

use crate::config::SessionSettings;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, GenerationReport};

impl Engine {
    /// Calendar days with at least one OPEN slot, ascending. A scope with no
    /// patterns simply has none.
    pub async fn list_available_dates(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        self.require_provider(&provider_id)?;
        let Some(rs) = self.get_scope(&Scope::new(provider_id, session_type)) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        let now = now_ms();
        let mut dates: Vec<NaiveDate> = guard
            .slots()
            .filter(|s| s.effective_state(now) == SlotState::Open)
            .map(|s| s.date)
            .collect();
        // Slots iterate in key order, so equal dates are adjacent.
        dates.dedup();
        Ok(dates)
    }

    /// OPEN slots on `date`, by start time.
    pub async fn list_available_times(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        date: NaiveDate,
    ) -> Result<Vec<SlotView>, EngineError> {
        self.require_provider(&provider_id)?;
        let Some(rs) = self.get_scope(&Scope::new(provider_id, session_type)) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        let now = now_ms();
        Ok(guard
            .slots_on(date)
            .filter(|s| s.effective_state(now) == SlotState::Open)
            .map(SlotView::from)
            .collect())
    }

    /// Every stored slot of the scope with its state as of now, optionally
    /// limited to one day.
    pub async fn list_slots(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        date: Option<NaiveDate>,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        self.require_provider(&provider_id)?;
        let Some(rs) = self.get_scope(&Scope::new(provider_id, session_type)) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        let now = now_ms();
        let info = |s: &Slot| SlotInfo { slot: s.clone(), state: s.effective_state(now) };
        Ok(match date {
            Some(date) => guard.slots_on(date).map(info).collect(),
            None => guard.slots().map(info).collect(),
        })
    }

    pub async fn slot_info(&self, slot_id: Ulid) -> Option<SlotInfo> {
        let scope = self.scope_for_slot(&slot_id)?;
        let rs = self.get_scope(&scope)?;
        let guard = rs.read().await;
        let slot = guard.slot(&slot_id)?;
        Some(SlotInfo { slot: slot.clone(), state: slot.effective_state(now_ms()) })
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    /// A provider's bookings across session types, oldest first.
    pub fn list_bookings(&self, provider_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.require_provider(&provider_id)?;
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| b.scope.provider_id == provider_id)
            .map(|b| b.value().clone())
            .collect();
        bookings.sort_by_key(|b| (b.created_at, b.id));
        Ok(bookings)
    }

    /// Warnings and counts from the scope's last generation run.
    pub async fn last_generation_report(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<Option<GenerationReport>, EngineError> {
        self.require_provider(&provider_id)?;
        let Some(rs) = self.get_scope(&Scope::new(provider_id, session_type)) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        Ok(guard.last_report.clone())
    }

    pub fn session_types(&self) -> Vec<(SessionType, SessionSettings)> {
        SessionType::ALL.iter().map(|st| (*st, *self.settings.session(*st))).collect()
    }
}
