use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::GenerationReport;

/// Everything stored for one (provider, session type) scope.
///
/// Slots are ordered by natural key, so a day's slots are a contiguous range
/// and at most one slot exists per `(date, start_time)`.
#[derive(Debug)]
pub struct ScopeState {
    pub scope: Scope,
    pub patterns: Vec<AvailabilityPattern>,
    slots: BTreeMap<SlotKey, Slot>,
    by_id: HashMap<Ulid, SlotKey>,
    /// Outcome of the most recent generation run. Not persisted.
    pub last_report: Option<GenerationReport>,
}

impl ScopeState {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            patterns: Vec::new(),
            slots: BTreeMap::new(),
            by_id: HashMap::new(),
            last_report: None,
        }
    }

    pub fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.by_id.get(id).and_then(|key| self.slots.get(key))
    }

    pub fn slot_by_key(&self, key: &SlotKey) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn slots_on(&self, date: NaiveDate) -> impl Iterator<Item = &Slot> {
        let from = SlotKey { date, start_time: NaiveTime::MIN };
        self.slots.range(from..).map(|(_, s)| s).take_while(move |s| s.date == date)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn active_patterns(&self) -> impl Iterator<Item = &AvailabilityPattern> {
        self.patterns.iter().filter(|p| p.is_active)
    }

    /// Apply an event to this scope (no locking, caller holds the lock).
    /// Events for other scopes and unscoped events are ignored.
    pub fn apply(&mut self, event: &Event) {
        if event.scope() != Some(self.scope) {
            return;
        }
        match event {
            Event::PatternsReplaced { patterns, .. } => {
                self.patterns = patterns.clone();
            }
            Event::SlotsUpserted { slots, .. } => {
                for slot in slots {
                    self.upsert(slot.clone());
                }
            }
            Event::SlotsExpired { slot_ids, .. } => {
                for id in slot_ids {
                    self.set_status(id, SlotStatus::Expired);
                }
            }
            Event::SlotsPurged { slot_ids, .. } => {
                for id in slot_ids {
                    if let Some(key) = self.by_id.remove(id) {
                        self.slots.remove(&key);
                    }
                }
            }
            Event::HoldPlaced { slot_id, holder_token, expires_at, .. } => {
                self.set_status(
                    slot_id,
                    SlotStatus::Held {
                        holder_token: holder_token.clone(),
                        expires_at: *expires_at,
                    },
                );
            }
            Event::HoldReleased { slot_id, .. } => {
                if matches!(self.slot(slot_id).map(|s| &s.status), Some(SlotStatus::Held { .. })) {
                    self.set_status(slot_id, SlotStatus::Open);
                }
            }
            Event::BookingConfirmed { booking, .. } => {
                if let Some(slot_id) = booking.slot_id {
                    self.set_status(&slot_id, SlotStatus::Booked { booking_id: booking.id });
                }
            }
            Event::BookingCancelled { slot_id: Some(slot_id), booking_id, .. } => {
                if self.slot(slot_id).and_then(Slot::booking_id) == Some(*booking_id) {
                    self.set_status(slot_id, SlotStatus::Open);
                }
            }
            Event::BookingCancelled { slot_id: None, .. }
            | Event::ProviderRegistered { .. }
            | Event::BookingRecorded { .. } => {}
        }
    }

    fn upsert(&mut self, slot: Slot) {
        let key = slot.key();
        if let Some(previous) = self.slots.get(&key)
            && previous.id != slot.id
        {
            self.by_id.remove(&previous.id);
        }
        self.by_id.insert(slot.id, key);
        self.slots.insert(key, slot);
    }

    fn set_status(&mut self, id: &Ulid, status: SlotStatus) {
        if let Some(key) = self.by_id.get(id)
            && let Some(slot) = self.slots.get_mut(key)
        {
            slot.status = status;
        }
    }
}
