use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::model::{Ms, Scope};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessKind {
    PatternsChanged,
    SlotsChanged,
}

impl StalenessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StalenessKind::PatternsChanged => "patterns_changed",
            StalenessKind::SlotsChanged => "slots_changed",
        }
    }
}

/// Previously fetched data for `scope` may no longer match server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessEvent {
    pub kind: StalenessKind,
    pub scope: Scope,
    /// Strictly increasing per scope.
    pub at: Ms,
}

/// Last event stamps for a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStamps {
    pub patterns_changed_at: Option<Ms>,
    pub slots_changed_at: Option<Ms>,
}

impl ScopeStamps {
    pub fn latest(&self) -> Option<Ms> {
        self.patterns_changed_at.max(self.slots_changed_at)
    }
}

/// Best-effort, at-most-once fan-out of staleness events per scope.
///
/// Publishing never blocks and never fails; a subscriber that misses events
/// detects it by comparing timestamps against [`StalenessHub::last_event`].
pub struct StalenessHub {
    channels: DashMap<Scope, broadcast::Sender<StalenessEvent>>,
    stamps: DashMap<Scope, ScopeStamps>,
}

impl Default for StalenessHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StalenessHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            stamps: DashMap::new(),
        }
    }

    /// Stamp and broadcast. No-op for delivery if nobody is listening; the
    /// stamp is always recorded.
    pub fn publish(&self, kind: StalenessKind, scope: Scope) -> StalenessEvent {
        let at = {
            let mut stamps = self.stamps.entry(scope).or_default();
            let at = crate::engine::now_ms().max(stamps.latest().map_or(0, |l| l + 1));
            match kind {
                StalenessKind::PatternsChanged => stamps.patterns_changed_at = Some(at),
                StalenessKind::SlotsChanged => stamps.slots_changed_at = Some(at),
            }
            at
        };
        let event = StalenessEvent { kind, scope, at };
        metrics::counter!(crate::observability::STALENESS_EVENTS_TOTAL, "kind" => kind.as_str())
            .increment(1);
        if let Some(sender) = self.channels.get(&scope) {
            let _ = sender.send(event);
        }
        event
    }

    /// Raw receiver for a scope. Creates the channel if needed.
    pub fn subscribe(&self, scope: Scope) -> broadcast::Receiver<StalenessEvent> {
        let sender = self
            .channels
            .entry(scope)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Run `handler` for every event on `scope` until the returned
    /// subscription is dropped or unsubscribed. Must be called inside a
    /// tokio runtime.
    pub fn watch<F>(&self, scope: Scope, handler: F) -> Subscription
    where
        F: Fn(StalenessEvent) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe(scope);
        let last_seen = Arc::new(AtomicI64::new(self.last_event(scope).unwrap_or(0)));
        let seen = last_seen.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        seen.fetch_max(event.at, Ordering::AcqRel);
                        handler(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Missed events collapse into one catch-up notice.
                        tracing::debug!("staleness subscriber for {scope} lagged by {skipped}");
                        let at = seen.load(Ordering::Acquire) + 1;
                        seen.fetch_max(at, Ordering::AcqRel);
                        handler(StalenessEvent {
                            kind: StalenessKind::SlotsChanged,
                            scope,
                            at,
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { scope, last_seen, task }
    }

    pub fn stamps(&self, scope: Scope) -> ScopeStamps {
        self.stamps.get(&scope).map(|s| *s).unwrap_or_default()
    }

    pub fn last_event(&self, scope: Scope) -> Option<Ms> {
        self.stamps(scope).latest()
    }

    /// True if anything was published for `scope` after `cached_at`.
    pub fn is_stale(&self, scope: Scope, cached_at: Ms) -> bool {
        self.last_event(scope).is_some_and(|last| last > cached_at)
    }

    /// Drop the channel for a scope; live subscribers see it close.
    pub fn remove(&self, scope: &Scope) {
        self.channels.remove(scope);
    }
}

/// Live registration returned by [`StalenessHub::watch`].
pub struct Subscription {
    scope: Scope,
    last_seen: Arc<AtomicI64>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Timestamp of the newest event this subscriber has seen.
    pub fn last_seen(&self) -> Ms {
        self.last_seen.load(Ordering::Acquire)
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What a reader remembers about its cached copy of a scope's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessCursor {
    pub scope: Scope,
    /// When the cached data was fetched (or the newest event seen since).
    pub cached_at: Ms,
}

impl StalenessCursor {
    pub fn new(scope: Scope, cached_at: Ms) -> Self {
        Self { scope, cached_at }
    }

    /// Catch up on (re)subscription: compare against the hub's last stamp.
    pub fn needs_refetch(&self, hub: &StalenessHub) -> bool {
        hub.is_stale(self.scope, self.cached_at)
    }

    pub fn observe(&self, event: &StalenessEvent) -> bool {
        event.scope == self.scope && event.at > self.cached_at
    }

    pub fn refreshed(&mut self, at: Ms) {
        self.cached_at = self.cached_at.max(at);
    }
}
