use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};

/// Periodically write back lapsed holds as OPEN and retire past slots.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                reap_once(&engine).await;
            }
            _ = cancel.cancelled() => {
                debug!("reaper shutting down");
                break;
            }
        }
    }
}

/// One reaper pass. Returns the number of holds written back.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = now_ms();
    let mut reaped = 0;
    for (scope, slot_id) in engine.collect_expired_holds(now) {
        match engine.reap_hold(slot_id).await {
            Ok(true) => reaped += 1,
            Ok(false) => {}
            // May already have been confirmed, extended or purged.
            Err(e) => debug!("reaper skip {slot_id} in {scope}: {e}"),
        }
    }
    match engine.sweep_past_slots(now).await {
        Ok((0, 0)) => {}
        Ok((expired, purged)) => info!("swept past slots: {expired} expired, {purged} purged"),
        Err(e) => warn!("slot sweep failed: {e}"),
    }
    reaped
}

/// Periodically roll every scope's generation window forward.
pub async fn run_generator(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let created = engine.regenerate_all().await;
                if created > 0 {
                    info!("scheduled generation created {created} slots");
                }
            }
            _ = cancel.cancelled() => {
                debug!("generator shutting down");
                break;
            }
        }
    }
}

/// Rewrite the WAL as a snapshot once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!("compacted WAL after {appends} appends"),
                    Err(e) => warn!("WAL compaction failed: {e}"),
                }
            }
            _ = cancel.cancelled() => {
                debug!("compactor shutting down");
                break;
            }
        }
    }
}
