//! Client-side booking flow: contact details, slot choice, review, submit.
//!
//! The wizard is a plain state machine driven by the caller. Anything that
//! talks to the server goes through [`BookingBackend`], so the same flow runs
//! against the in-process engine, a wire client, or a fake in tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{StalenessCursor, StalenessEvent, StalenessHub};

// ── Backend ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("availability fetch failed: {0}")]
pub struct AvailabilityFetchError(pub String);

impl From<EngineError> for AvailabilityFetchError {
    fn from(e: EngineError) -> Self {
        Self(e.to_string())
    }
}

#[async_trait]
pub trait BookingBackend: Send + Sync {
    async fn available_dates(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<Vec<NaiveDate>, AvailabilityFetchError>;

    async fn available_times(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        date: NaiveDate,
    ) -> Result<Vec<SlotView>, AvailabilityFetchError>;

    async fn hold_slot(&self, slot_id: Ulid, holder_token: &str, ttl_ms: Option<Ms>) -> Result<Hold, EngineError>;

    async fn confirm_booking(
        &self,
        slot_id: Ulid,
        holder_token: &str,
        contact: ContactDetails,
    ) -> Result<Booking, EngineError>;

    async fn book_directly(&self, slot_id: Ulid, contact: ContactDetails) -> Result<Booking, EngineError>;

    async fn create_manual_booking(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        contact: ContactDetails,
    ) -> Result<Booking, EngineError>;

    /// Newest staleness stamp published for the scope, 0 if none.
    fn staleness_stamp(&self, provider_id: Ulid, session_type: SessionType) -> Ms;
}

#[async_trait]
impl BookingBackend for Engine {
    async fn available_dates(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
    ) -> Result<Vec<NaiveDate>, AvailabilityFetchError> {
        Ok(self.list_available_dates(provider_id, session_type).await?)
    }

    async fn available_times(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        date: NaiveDate,
    ) -> Result<Vec<SlotView>, AvailabilityFetchError> {
        Ok(self.list_available_times(provider_id, session_type, date).await?)
    }

    async fn hold_slot(&self, slot_id: Ulid, holder_token: &str, ttl_ms: Option<Ms>) -> Result<Hold, EngineError> {
        Engine::hold_slot(self, slot_id, holder_token, ttl_ms).await
    }

    async fn confirm_booking(
        &self,
        slot_id: Ulid,
        holder_token: &str,
        contact: ContactDetails,
    ) -> Result<Booking, EngineError> {
        Engine::confirm_booking(self, slot_id, holder_token, contact, None).await
    }

    async fn book_directly(&self, slot_id: Ulid, contact: ContactDetails) -> Result<Booking, EngineError> {
        Engine::book_directly(self, slot_id, contact, None).await
    }

    async fn create_manual_booking(
        &self,
        provider_id: Ulid,
        session_type: SessionType,
        contact: ContactDetails,
    ) -> Result<Booking, EngineError> {
        Engine::create_manual_booking(self, provider_id, session_type, contact, None).await
    }

    fn staleness_stamp(&self, provider_id: Ulid, session_type: SessionType) -> Ms {
        self.notify.last_event(Scope::new(provider_id, session_type)).unwrap_or(0)
    }
}

/// One successful availability fetch: the open dates, and the open times of
/// the date on display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub dates: Vec<NaiveDate>,
    pub date: Option<NaiveDate>,
    pub times: Vec<SlotView>,
    /// Hub stamp read before the first read. Every later change to the
    /// scope is stamped strictly above it, whatever the clock says.
    pub fetched_at: Ms,
}

impl AvailabilitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn find(&self, slot_id: Ulid) -> Option<&SlotView> {
        self.times.iter().find(|t| t.slot_id == slot_id)
    }
}

/// Fetch dates, then the times of `date` (or of the first open date when
/// `date` is absent or has nothing open).
pub async fn load_availability<B: BookingBackend + ?Sized>(
    backend: &B,
    provider_id: Ulid,
    session_type: SessionType,
    date: Option<NaiveDate>,
) -> Result<AvailabilitySnapshot, AvailabilityFetchError> {
    let fetched_at = backend.staleness_stamp(provider_id, session_type);
    let dates = backend.available_dates(provider_id, session_type).await?;
    let date = match date {
        Some(d) if dates.contains(&d) => Some(d),
        _ => dates.first().copied(),
    };
    let times = match date {
        Some(d) => backend.available_times(provider_id, session_type, d).await?,
        None => Vec::new(),
    };
    Ok(AvailabilitySnapshot { dates, date, times, fetched_at })
}

// ── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardStep {
    CollectingContact,
    SelectingSlot,
    ReviewingAndConfirming,
    Submitted,
}

/// Identifies one availability fetch. Only the latest ticket may land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityView {
    NotLoaded,
    Loading { ticket: FetchTicket },
    Loaded(AvailabilitySnapshot),
    Empty,
    /// The last good snapshot, if any, is kept for display as stale data.
    Errored { error: AvailabilityFetchError, cached: Option<AvailabilitySnapshot> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub slot: SlotView,
    pub hold: Option<Hold>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardNotice {
    /// Someone else got the slot first; pick another.
    SlotTaken(Ulid),
    /// Submission failed for a reason worth retrying.
    SubmitFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WizardError {
    #[error("{0} is required")]
    MissingContact(&'static str),
    #[error("not allowed while {0:?}")]
    WrongStep(WizardStep),
    #[error("no slot selected")]
    NoSlotSelected,
    #[error("slot {0} is not in the loaded availability")]
    UnknownSlot(Ulid),
    #[error("slot {0} was taken by someone else")]
    SlotTaken(Ulid),
    #[error(transparent)]
    Backend(#[from] EngineError),
}

pub struct BookingWizard {
    provider_id: Ulid,
    session_type: SessionType,
    holder_token: String,
    hold_ttl_ms: Option<Ms>,
    step: WizardStep,
    contact: ContactDetails,
    availability: AvailabilityView,
    last_good: Option<AvailabilitySnapshot>,
    next_ticket: u64,
    selection: Option<Selection>,
    manual: bool,
    notice: Option<WizardNotice>,
    booking: Option<Booking>,
    cursor: Option<StalenessCursor>,
    stale: bool,
}

impl BookingWizard {
    pub fn new(provider_id: Ulid, session_type: SessionType) -> Self {
        Self {
            provider_id,
            session_type,
            holder_token: Ulid::new().to_string(),
            hold_ttl_ms: None,
            step: WizardStep::CollectingContact,
            contact: ContactDetails::default(),
            availability: AvailabilityView::NotLoaded,
            last_good: None,
            next_ticket: 0,
            selection: None,
            manual: false,
            notice: None,
            booking: None,
            cursor: None,
            stale: false,
        }
    }

    /// Hold the slot on selection for `ttl_ms`, then confirm it on submit.
    pub fn with_hold_on_select(mut self, ttl_ms: Ms) -> Self {
        self.hold_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.provider_id, self.session_type)
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    pub fn contact(&self) -> &ContactDetails {
        &self.contact
    }

    pub fn availability(&self) -> &AvailabilityView {
        &self.availability
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn notice(&self) -> Option<&WizardNotice> {
        self.notice.as_ref()
    }

    pub fn booking(&self) -> Option<&Booking> {
        self.booking.as_ref()
    }

    pub fn holder_token(&self) -> &str {
        &self.holder_token
    }

    /// Snapshot to display: the loaded one, or the cached one behind an error.
    pub fn shown_availability(&self) -> Option<&AvailabilitySnapshot> {
        match &self.availability {
            AvailabilityView::Loaded(snapshot) => Some(snapshot),
            AvailabilityView::Errored { cached, .. } => cached.as_ref(),
            _ => None,
        }
    }

    // ── Contact ──

    pub fn set_contact(&mut self, contact: ContactDetails) -> Result<(), WizardError> {
        self.ensure_not_submitted()?;
        self.contact = contact;
        Ok(())
    }

    /// CollectingContact → SelectingSlot once name and email are present.
    pub fn submit_contact(&mut self) -> Result<(), WizardError> {
        self.ensure_step(WizardStep::CollectingContact)?;
        if self.contact.name.trim().is_empty() {
            return Err(WizardError::MissingContact("name"));
        }
        let email = self.contact.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(WizardError::MissingContact("email"));
        }
        self.step = WizardStep::SelectingSlot;
        Ok(())
    }

    // ── Availability ──

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.next_ticket += 1;
        let ticket = FetchTicket(self.next_ticket);
        self.availability = AvailabilityView::Loading { ticket };
        ticket
    }

    /// Land a fetch result. Returns false when `ticket` was superseded or
    /// cancelled, in which case nothing changes.
    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<AvailabilitySnapshot, AvailabilityFetchError>,
    ) -> bool {
        if self.availability != (AvailabilityView::Loading { ticket }) {
            debug!("dropping availability result for superseded ticket {}", ticket.0);
            return false;
        }
        self.availability = match result {
            Ok(snapshot) => {
                self.stale = false;
                if let Some(cursor) = self.cursor.as_mut() {
                    cursor.refreshed(snapshot.fetched_at);
                }
                self.last_good = Some(snapshot.clone());
                if snapshot.is_empty() {
                    AvailabilityView::Empty
                } else {
                    AvailabilityView::Loaded(snapshot)
                }
            }
            Err(error) => {
                warn!("availability for {}: {error}", self.scope());
                AvailabilityView::Errored { error, cached: self.last_good.clone() }
            }
        };
        true
    }

    /// Stop waiting for the in-flight fetch. Server-side holds are untouched.
    pub fn cancel_fetch(&mut self) {
        if matches!(self.availability, AvailabilityView::Loading { .. }) {
            self.availability = match &self.last_good {
                Some(s) if s.is_empty() => AvailabilityView::Empty,
                Some(s) => AvailabilityView::Loaded(s.clone()),
                None => AvailabilityView::NotLoaded,
            };
        }
    }

    /// Fetch and land in one go. Also serves as retry after an error; the
    /// step never changes.
    pub async fn fetch_availability<B: BookingBackend + ?Sized>(
        &mut self,
        backend: &B,
        date: Option<NaiveDate>,
    ) -> &AvailabilityView {
        let ticket = self.begin_fetch();
        let result = load_availability(backend, self.provider_id, self.session_type, date).await;
        self.complete_fetch(ticket, result);
        &self.availability
    }

    // ── Slot choice ──

    /// Pick a slot from the shown availability. With hold-on-select, a hold
    /// is placed first and a race sends the wizard back to choosing.
    pub async fn select_slot<B: BookingBackend + ?Sized>(
        &mut self,
        backend: &B,
        slot_id: Ulid,
    ) -> Result<(), WizardError> {
        self.ensure_step(WizardStep::SelectingSlot)?;
        let slot = self
            .shown_availability()
            .and_then(|s| s.find(slot_id))
            .cloned()
            .ok_or(WizardError::UnknownSlot(slot_id))?;

        let hold = match self.hold_ttl_ms {
            Some(ttl) => match backend.hold_slot(slot_id, &self.holder_token, Some(ttl)).await {
                Ok(hold) => Some(hold),
                Err(e) if e.is_race() => {
                    self.slot_taken(slot_id);
                    return Err(WizardError::SlotTaken(slot_id));
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        self.selection = Some(Selection { slot, hold });
        self.manual = false;
        self.notice = None;
        Ok(())
    }

    /// SelectingSlot → Review. Without a selection this is the manual path,
    /// allowed whenever there is nothing to pick from.
    pub fn proceed_to_review(&mut self) -> Result<(), WizardError> {
        self.ensure_step(WizardStep::SelectingSlot)?;
        if self.selection.is_none() && !self.manual {
            match &self.availability {
                AvailabilityView::Loaded(_) => return Err(WizardError::NoSlotSelected),
                AvailabilityView::Loading { .. } => {
                    self.cancel_fetch();
                    self.manual = true;
                }
                _ => self.manual = true,
            }
        }
        self.step = WizardStep::ReviewingAndConfirming;
        Ok(())
    }

    /// Give up on picking a slot and ask the provider to schedule by hand.
    pub fn use_manual_booking(&mut self) -> Result<(), WizardError> {
        self.ensure_not_submitted()?;
        self.manual = true;
        // Any hold is left to lapse on its own.
        self.selection = None;
        if self.step == WizardStep::SelectingSlot {
            self.cancel_fetch();
            self.step = WizardStep::ReviewingAndConfirming;
        }
        Ok(())
    }

    pub fn back(&mut self) -> Result<(), WizardError> {
        self.step = match self.step {
            WizardStep::ReviewingAndConfirming => WizardStep::SelectingSlot,
            WizardStep::SelectingSlot => WizardStep::CollectingContact,
            other => return Err(WizardError::WrongStep(other)),
        };
        Ok(())
    }

    // ── Submit ──

    /// Make the booking. Once it succeeds, later calls return the same
    /// booking without contacting the backend again.
    pub async fn submit<B: BookingBackend + ?Sized>(&mut self, backend: &B) -> Result<Booking, WizardError> {
        if let Some(booking) = &self.booking {
            return Ok(booking.clone());
        }
        self.ensure_step(WizardStep::ReviewingAndConfirming)?;

        let contact = self.contact.clone();
        let result = match (&self.selection, self.manual) {
            (Some(sel), false) => match &sel.hold {
                Some(hold) => backend.confirm_booking(hold.slot_id, &self.holder_token, contact).await,
                None => backend.book_directly(sel.slot.slot_id, contact).await,
            },
            _ => {
                backend
                    .create_manual_booking(self.provider_id, self.session_type, contact)
                    .await
            }
        };

        match result {
            Ok(booking) => {
                debug!("wizard submitted booking {}", booking.id);
                self.step = WizardStep::Submitted;
                self.notice = None;
                self.booking = Some(booking.clone());
                Ok(booking)
            }
            Err(e) if e.is_race() => {
                let slot_id = self.selection.as_ref().map_or_else(Ulid::nil, |s| s.slot.slot_id);
                self.slot_taken(slot_id);
                self.step = WizardStep::SelectingSlot;
                Err(WizardError::SlotTaken(slot_id))
            }
            Err(e) => {
                self.notice = Some(WizardNotice::SubmitFailed(e.to_string()));
                Err(e.into())
            }
        }
    }

    // ── Staleness ──

    /// Track server-side changes for this wizard's scope.
    pub fn watch_staleness(&mut self, hub: &StalenessHub) {
        let cached_at = self.last_good.as_ref().map_or(0, |s| s.fetched_at);
        self.cursor = Some(StalenessCursor::new(self.scope(), cached_at));
        if hub.is_stale(self.scope(), cached_at) && self.last_good.is_some() {
            self.stale = true;
        }
    }

    /// Feed a live event; marks the availability stale when it applies.
    pub fn observe(&mut self, event: &StalenessEvent) {
        if self.cursor.as_ref().is_some_and(|c| c.observe(event)) {
            self.stale = true;
        }
    }

    pub fn needs_refresh(&self, hub: &StalenessHub) -> bool {
        self.stale || (self.last_good.is_some() && self.cursor.as_ref().is_some_and(|c| c.needs_refetch(hub)))
    }

    fn slot_taken(&mut self, slot_id: Ulid) {
        self.selection = None;
        self.stale = true;
        self.notice = Some(WizardNotice::SlotTaken(slot_id));
    }

    fn ensure_step(&self, step: WizardStep) -> Result<(), WizardError> {
        if self.step == step { Ok(()) } else { Err(WizardError::WrongStep(self.step)) }
    }

    fn ensure_not_submitted(&self) -> Result<(), WizardError> {
        if self.step == WizardStep::Submitted {
            Err(WizardError::WrongStep(WizardStep::Submitted))
        } else {
            Ok(())
        }
    }
}
