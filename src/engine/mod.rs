mod conflict;
mod error;
mod patterns;
mod queries;
mod reservation;
mod slots;
mod store;
#[cfg(test)]
mod tests;

pub use conflict::now_ms;
pub use error::{EngineError, ValidationError};
pub use patterns::PatternUpsert;
pub use slots::GenerationReport;
pub use store::ScopeState;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::EngineSettings;
use crate::dispatch::{BookingDispatcher, LogDispatcher};
use crate::model::*;
use crate::notify::{StalenessHub, StalenessKind};
use crate::wal::Wal;

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before compaction or stats.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// The booking engine of one tenant: pattern store, slot store and
/// reservation service over a shared WAL.
pub struct Engine {
    scopes: DashMap<Scope, SharedScopeState>,
    providers: DashMap<Ulid, ProviderInfo>,
    slugs: DashMap<String, Ulid>,
    /// Reverse lookups: slot / pattern id → owning scope.
    slot_index: DashMap<Ulid, Scope>,
    pattern_index: DashMap<Ulid, Scope>,
    bookings: DashMap<Ulid, Booking>,
    /// Booking ids between their uniqueness check and their commit.
    booking_claims: DashSet<Ulid>,
    /// Serializes writes that are not covered by a scope lock (provider
    /// registration, manual bookings), scope creation and compaction.
    directory_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<StalenessHub>,
    dispatcher: Arc<dyn BookingDispatcher>,
    pub settings: EngineSettings,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<StalenessHub>, settings: EngineSettings) -> io::Result<Self> {
        Self::with_dispatcher(wal_path, notify, settings, Arc::new(LogDispatcher))
    }

    /// Replays the log at `wal_path`, then starts its writer task. Must be
    /// called inside a tokio runtime.
    pub fn with_dispatcher(
        wal_path: PathBuf,
        notify: Arc<StalenessHub>,
        settings: EngineSettings,
        dispatcher: Arc<dyn BookingDispatcher>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!("{}: discarded torn tail after {} events", wal_path.display(), replay.events.len());
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            scopes: DashMap::new(),
            providers: DashMap::new(),
            slugs: DashMap::new(),
            slot_index: DashMap::new(),
            pattern_index: DashMap::new(),
            bookings: DashMap::new(),
            booking_claims: DashSet::new(),
            directory_lock: Mutex::new(()),
            wal_tx,
            notify,
            dispatcher,
            settings,
        };

        // Sole owner during replay: rebuild scopes as plain values and wrap
        // them in locks once the log is consumed.
        let mut scopes: HashMap<Scope, ScopeState> = HashMap::new();
        for event in &replay.events {
            engine.apply_shared(event);
            if let Some(scope) = event.scope() {
                scopes.entry(scope).or_insert_with(|| ScopeState::new(scope)).apply(event);
            }
        }
        for (scope, state) in scopes {
            engine.scopes.insert(scope, Arc::new(RwLock::new(state)));
        }

        if !replay.events.is_empty() {
            info!(
                "replayed {} events: {} providers, {} scopes, {} bookings",
                replay.events.len(),
                engine.providers.len(),
                engine.scopes.len(),
                engine.bookings.len()
            );
        }
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Update the cross-scope lookup tables for an event.
    fn apply_shared(&self, event: &Event) {
        match event {
            Event::ProviderRegistered { id, slug, timezone } => {
                self.providers.insert(
                    *id,
                    ProviderInfo { id: *id, slug: slug.clone(), timezone: timezone.clone() },
                );
                self.slugs.insert(slug.clone(), *id);
            }
            Event::PatternsReplaced { scope, patterns } => {
                for pattern in patterns {
                    self.pattern_index.insert(pattern.id, *scope);
                }
            }
            Event::SlotsUpserted { scope, slots } => {
                for slot in slots {
                    self.slot_index.insert(slot.id, *scope);
                }
            }
            Event::SlotsPurged { slot_ids, .. } => {
                for id in slot_ids {
                    self.slot_index.remove(id);
                }
            }
            Event::BookingConfirmed { booking, .. } | Event::BookingRecorded { booking } => {
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingCancelled { booking_id, .. } => {
                self.bookings.remove(booking_id);
            }
            Event::SlotsExpired { .. }
            | Event::HoldPlaced { .. }
            | Event::HoldReleased { .. } => {}
        }
    }

    /// WAL-append + apply + publish, with the scope's write lock held by the
    /// caller for the whole check-then-commit sequence.
    pub(super) async fn persist_and_apply(&self, rs: &mut ScopeState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        rs.apply(event);
        self.apply_shared(event);
        let kind = match event {
            Event::PatternsReplaced { .. } => StalenessKind::PatternsChanged,
            _ => StalenessKind::SlotsChanged,
        };
        self.notify.publish(kind, rs.scope);
        Ok(())
    }

    /// WAL-append + apply for events that touch no scope. Caller holds
    /// `directory_lock`.
    async fn persist_shared(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_shared(event);
        Ok(())
    }

    pub fn provider(&self, id: &Ulid) -> Option<ProviderInfo> {
        self.providers.get(id).map(|p| p.value().clone())
    }

    pub(super) fn require_provider(&self, id: &Ulid) -> Result<ProviderInfo, EngineError> {
        self.provider(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn get_scope(&self, scope: &Scope) -> Option<SharedScopeState> {
        self.scopes.get(scope).map(|e| e.value().clone())
    }

    /// Scope state for a registered provider, created empty on first use.
    /// New scopes appear under the directory lock so a running compaction
    /// either sees them or finishes before they take their first write.
    pub(super) async fn scope_state(&self, scope: Scope) -> Result<SharedScopeState, EngineError> {
        self.require_provider(&scope.provider_id)?;
        if let Some(rs) = self.get_scope(&scope) {
            return Ok(rs);
        }
        let _directory = self.directory_lock.lock().await;
        Ok(self
            .scopes
            .entry(scope)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeState::new(scope))))
            .value()
            .clone())
    }

    pub fn scope_keys(&self) -> Vec<Scope> {
        self.scopes.iter().map(|e| *e.key()).collect()
    }

    pub fn scope_for_slot(&self, slot_id: &Ulid) -> Option<Scope> {
        self.slot_index.get(slot_id).map(|e| *e.value())
    }

    /// Lookup slot → scope, acquire the scope's write lock.
    pub(super) async fn resolve_slot_write(
        &self,
        slot_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ScopeState>, EngineError> {
        let scope = self.scope_for_slot(slot_id).ok_or(EngineError::NotFound(*slot_id))?;
        let rs = self.get_scope(&scope).ok_or(EngineError::NotFound(*slot_id))?;
        let guard = rs.write_owned().await;
        if guard.slot(slot_id).is_none() {
            // Purged while we waited for the lock.
            return Err(EngineError::NotFound(*slot_id));
        }
        Ok(guard)
    }

    /// Fire-and-forget confirmation; a failed notification never touches the
    /// booking.
    pub(super) fn dispatch_booking(&self, booking: Booking) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.booking_created(&booking).await {
                warn!(booking_id = %booking.id, "booking notification failed: {e}");
            }
        });
    }

    /// Rewrite the WAL as the minimal event set reproducing current state.
    ///
    /// Holds the directory lock and every scope's read lock until the new log
    /// is in place, so no append can land in the old file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory_lock.lock().await;
        let mut scopes: Vec<(Scope, SharedScopeState)> =
            self.scopes.iter().map(|e| (*e.key(), e.value().clone())).collect();
        scopes.sort_by_key(|(scope, _)| *scope);

        let mut guards = Vec::with_capacity(scopes.len());
        for (_, rs) in &scopes {
            guards.push(rs.clone().read_owned().await);
        }

        let mut events: Vec<Event> = self
            .providers
            .iter()
            .map(|p| Event::ProviderRegistered {
                id: p.id,
                slug: p.slug.clone(),
                timezone: p.timezone.clone(),
            })
            .collect();
        for guard in &guards {
            if !guard.patterns.is_empty() {
                events.push(Event::PatternsReplaced { scope: guard.scope, patterns: guard.patterns.clone() });
            }
            let slots: Vec<Slot> = guard.slots().cloned().collect();
            if !slots.is_empty() {
                events.push(Event::SlotsUpserted { scope: guard.scope, slots });
            }
        }
        // Slot statuses already carry the BOOKED state; bookings only need rows.
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingRecorded { booking }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::AppendsSinceCompact { response: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
