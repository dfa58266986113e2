use std::collections::HashSet;

use chrono_tz::Tz;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::generator::{self, DateWindow, PatternError};
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, ScopeState};

/// What one generation run did to a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub window: Option<DateWindow>,
    /// New OPEN slots.
    pub created: usize,
    /// OPEN/EXPIRED slots reopened or updated in place.
    pub refreshed: usize,
    /// Candidates that collided with a HELD/BOOKED slot and were left alone.
    pub skipped: usize,
    /// OPEN slots marked EXPIRED (past, or no longer produced by a pattern).
    pub expired: usize,
    /// Local start times that fell into a DST gap.
    pub skipped_nonexistent: usize,
    pub errors: Vec<PatternError>,
    pub at: Ms,
}

impl GenerationReport {
    /// Some patterns failed to expand; the rest were committed.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Events that bring `rs` in line with `patterns` over `window`. Fails
/// with `LimitExceeded` before anything is planned past the slot cap.
pub(super) fn plan_generation(
    rs: &ScopeState,
    patterns: &[AvailabilityPattern],
    window: &DateWindow,
    duration_ms: Ms,
    now: Ms,
) -> Result<(Vec<Event>, GenerationReport), EngineError> {
    let generated = generator::generate(patterns, window, duration_ms, now);
    let mut report = GenerationReport {
        window: Some(*window),
        skipped_nonexistent: generated.skipped_nonexistent,
        at: now,
        ..Default::default()
    };

    let mut upserts = Vec::new();
    let mut produced = HashSet::new();
    for candidate in &generated.candidates {
        produced.insert(candidate.key());
        match rs.slot_by_key(&candidate.key()) {
            None => {
                report.created += 1;
                upserts.push(Slot {
                    id: Ulid::new(),
                    scope: rs.scope,
                    date: candidate.date,
                    start_time: candidate.start_time,
                    end_time: candidate.end_time,
                    timezone: candidate.timezone.clone(),
                    span: candidate.span,
                    status: SlotStatus::Open,
                    generated_from: candidate.pattern_id,
                });
            }
            Some(existing) => match existing.effective_state(now) {
                SlotState::Held | SlotState::Booked => report.skipped += 1,
                SlotState::Open | SlotState::Expired => {
                    let refreshed = Slot {
                        end_time: candidate.end_time,
                        timezone: candidate.timezone.clone(),
                        span: candidate.span,
                        generated_from: candidate.pattern_id,
                        status: match existing.status {
                            SlotStatus::Expired => SlotStatus::Open,
                            ref other => other.clone(),
                        },
                        ..existing.clone()
                    };
                    if refreshed != *existing {
                        report.refreshed += 1;
                        upserts.push(refreshed);
                    }
                }
            },
        }
    }

    if rs.slot_count() + report.created > MAX_SLOTS_PER_SCOPE {
        return Err(EngineError::LimitExceeded("too many slots in scope"));
    }

    // Slots of a pattern that failed this run are left as they are.
    let failed: HashSet<Ulid> = generated.errors.iter().map(|e| e.pattern_id).collect();
    let stale: Vec<Ulid> = rs
        .slots()
        // Stored OPEN, or a hold that has lapsed.
        .filter(|s| {
            matches!(s.status, SlotStatus::Open | SlotStatus::Held { .. })
                && s.effective_state(now) != SlotState::Held
        })
        .filter(|s| {
            s.span.start <= now
                || (window.contains(s.date)
                    && !produced.contains(&s.key())
                    && !failed.contains(&s.generated_from))
        })
        .map(|s| s.id)
        .collect();
    report.expired = stale.len();
    report.errors = generated.errors;

    let mut events = Vec::new();
    if !upserts.is_empty() {
        events.push(Event::SlotsUpserted { scope: rs.scope, slots: upserts });
    }
    if !stale.is_empty() {
        events.push(Event::SlotsExpired { scope: rs.scope, slot_ids: stale });
    }
    Ok((events, report))
}

/// No active pattern of the scope still produces `slot`. A slot whose
/// pattern fails to expand is not orphaned.
pub(super) fn is_orphaned(rs: &ScopeState, slot: &Slot, duration_ms: Ms, now: Ms) -> bool {
    let day = DateWindow::new(slot.date, slot.date);
    let generated = generator::generate(&rs.patterns, &day, duration_ms, now);
    if generated.errors.iter().any(|e| e.pattern_id == slot.generated_from) {
        return false;
    }
    let key = slot.key();
    !generated.candidates.iter().any(|c| c.key() == key)
}

impl Engine {
    /// Mark a slot that just became OPEN as EXPIRED when its pattern has
    /// since been deactivated, removed or reshaped.
    pub(super) async fn retire_if_orphaned(
        &self,
        rs: &mut ScopeState,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let duration_ms = self.settings.session(rs.scope.session_type).duration_ms;
        let state: &ScopeState = rs;
        let orphaned = state
            .slot(&slot_id)
            .is_some_and(|s| s.effective_state(now) == SlotState::Open && is_orphaned(state, s, duration_ms, now));
        if !orphaned {
            return Ok(false);
        }
        let event = Event::SlotsExpired { scope: rs.scope, slot_ids: vec![slot_id] };
        self.persist_and_apply(rs, &event).await?;
        metrics::counter!(crate::observability::SLOTS_EXPIRED_TOTAL).increment(1);
        debug!("slot {slot_id} retired, no active pattern produces it");
        Ok(true)
    }

    /// Rolling window for a provider: today (in the provider's timezone)
    /// plus the configured horizon.
    pub fn horizon_for(&self, provider_id: &Ulid, now: Ms) -> Result<DateWindow, EngineError> {
        let provider = self.require_provider(provider_id)?;
        let tz = generator::parse_timezone(&provider.timezone).unwrap_or(Tz::UTC);
        Ok(DateWindow::rolling(generator::today_in(tz, now), self.settings.horizon_days))
    }

    /// Generate into an already locked scope and record the report.
    pub(super) async fn materialize_locked(
        &self,
        rs: &mut ScopeState,
        window: &DateWindow,
        now: Ms,
    ) -> Result<GenerationReport, EngineError> {
        let duration_ms = self.settings.session(rs.scope.session_type).duration_ms;
        let (events, report) = plan_generation(rs, &rs.patterns, window, duration_ms, now)?;
        for event in &events {
            self.persist_and_apply(rs, event).await?;
        }

        metrics::counter!(crate::observability::SLOTS_GENERATED_TOTAL).increment(report.created as u64);
        metrics::counter!(crate::observability::SLOTS_EXPIRED_TOTAL).increment(report.expired as u64);
        if report.is_partial() {
            metrics::counter!(crate::observability::GENERATION_PATTERN_ERRORS_TOTAL)
                .increment(report.errors.len() as u64);
            for error in &report.errors {
                warn!("generation for {}: {error}", rs.scope);
            }
        }
        if !events.is_empty() {
            info!(
                "generated {}: {} created, {} refreshed, {} expired, {} skipped",
                rs.scope, report.created, report.refreshed, report.expired, report.skipped
            );
        }
        rs.last_report = Some(report.clone());
        Ok(report)
    }

    /// Materialize slots for `scope` over an explicit window.
    pub async fn materialize(&self, scope: Scope, window: DateWindow) -> Result<GenerationReport, EngineError> {
        let rs = self.scope_state(scope).await?;
        let mut guard = rs.write().await;
        self.materialize_locked(&mut guard, &window, now_ms()).await
    }

    /// On-demand regeneration of the rolling horizon.
    pub async fn regenerate(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<GenerationReport, EngineError> {
        let now = now_ms();
        let window = self.horizon_for(&provider_id, now)?;
        let rs = self.scope_state(Scope::new(provider_id, session_type)).await?;
        let mut guard = rs.write().await;
        self.materialize_locked(&mut guard, &window, now).await
    }

    /// Roll every known scope's horizon forward. Errors are logged per scope.
    pub async fn regenerate_all(&self) -> usize {
        let mut created = 0;
        for scope in self.scope_keys() {
            match self.regenerate(scope.provider_id, scope.session_type).await {
                Ok(report) => created += report.created,
                Err(e) => warn!("scheduled generation for {scope} failed: {e}"),
            }
        }
        created
    }

    /// Holds whose TTL has lapsed at `now`, as `(scope, slot_id)`.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Scope, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.scopes.iter() {
            // Skip scopes that are busy; the next sweep picks them up.
            let Ok(guard) = entry.value().try_read() else { continue };
            for slot in guard.slots() {
                if let SlotStatus::Held { expires_at, .. } = slot.status
                    && expires_at <= now
                {
                    expired.push((*entry.key(), slot.id));
                }
            }
        }
        expired
    }

    /// Write back a lapsed hold as OPEN. Reads already treat it as open; this
    /// makes the stored state match. No-op if the hold was renewed or consumed.
    pub async fn reap_hold(&self, slot_id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.resolve_slot_write(&slot_id).await?;
        let now = now_ms();
        let lapsed = matches!(
            guard.slot(&slot_id).map(|s| &s.status),
            Some(SlotStatus::Held { expires_at, .. }) if *expires_at <= now
        );
        if !lapsed {
            return Ok(false);
        }
        let event = Event::HoldReleased { scope: guard.scope, slot_id };
        self.persist_and_apply(&mut guard, &event).await?;
        self.retire_if_orphaned(&mut guard, slot_id, now).await?;
        metrics::counter!(crate::observability::HOLDS_LAPSED_TOTAL).increment(1);
        debug!("hold on slot {slot_id} lapsed");
        Ok(true)
    }

    /// Mark OPEN/HELD slots whose start has passed as EXPIRED, and drop
    /// unbooked past slots older than the retention period. Returns
    /// `(expired, purged)`.
    pub async fn sweep_past_slots(&self, now: Ms) -> Result<(usize, usize), EngineError> {
        let cutoff = now.saturating_sub(self.settings.slot_retention_ms);
        let mut expired_total = 0;
        let mut purged_total = 0;
        for scope in self.scope_keys() {
            let Some(rs) = self.get_scope(&scope) else { continue };
            let mut guard = rs.write().await;
            let expired: Vec<Ulid> = guard
                .slots()
                .filter(|s| matches!(s.status, SlotStatus::Open | SlotStatus::Held { .. }))
                .filter(|s| s.span.start <= now)
                .map(|s| s.id)
                .collect();
            let purged: Vec<Ulid> = guard
                .slots()
                .filter(|s| s.booking_id().is_none() && s.span.end <= cutoff)
                .map(|s| s.id)
                .collect();

            if !expired.is_empty() {
                expired_total += expired.len();
                let event = Event::SlotsExpired { scope, slot_ids: expired };
                self.persist_and_apply(&mut guard, &event).await?;
            }
            if !purged.is_empty() {
                purged_total += purged.len();
                let event = Event::SlotsPurged { scope, slot_ids: purged };
                self.persist_and_apply(&mut guard, &event).await?;
            }
        }
        metrics::counter!(crate::observability::SLOTS_EXPIRED_TOTAL).increment(expired_total as u64);
        metrics::counter!(crate::observability::SLOTS_PURGED_TOTAL).increment(purged_total as u64);
        Ok((expired_total, purged_total))
    }
}
