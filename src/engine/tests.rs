use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;

use super::slots::plan_generation;
use super::*;
use crate::config::SessionSettings;
use crate::dispatch::DispatchError;
use crate::generator::{DateWindow, PatternErrorKind, today_in};
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotkeeper_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(StalenessHub::new()), EngineSettings::default()).unwrap()
}

async fn provider(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .register_provider(id, &format!("p-{}", id.to_string().to_lowercase()), "UTC")
        .await
        .unwrap();
    id
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn draft(day: u8, start: NaiveTime, end: NaiveTime) -> PatternDraft {
    PatternDraft {
        id: None,
        day_of_week: day,
        start_time: start,
        end_time: end,
        timezone: None,
        is_active: true,
    }
}

fn contact(name: &str) -> ContactDetails {
    ContactDetails {
        name: name.into(),
        email: format!("{}@example.com", name.to_lowercase()),
        phone: None,
        notes: None,
    }
}

/// A Monday at least two days out, inside the default horizon.
fn upcoming_monday() -> NaiveDate {
    let mut d = today_in(Tz::UTC, now_ms()) + chrono::Duration::days(2);
    while d.weekday() != Weekday::Mon {
        d += chrono::Duration::days(1);
    }
    d
}

/// Provider with Monday 09:00-17:00 PERSONAL, slots generated.
async fn monday_provider(engine: &Engine) -> Ulid {
    let pid = provider(engine).await;
    engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(9, 0), t(17, 0))])
        .await
        .unwrap();
    pid
}

async fn slot_at(engine: &Engine, pid: Ulid, date: NaiveDate, start: NaiveTime) -> Ulid {
    engine
        .list_slots(pid, SessionType::Personal, Some(date))
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.slot.start_time == start)
        .map(|s| s.slot.id)
        .unwrap()
}

// ── Providers ────────────────────────────────────────────

#[tokio::test]
async fn provider_register_and_resolve() {
    let engine = engine_at(test_wal_path("provider_register.wal"));
    let id = Ulid::new();
    engine.register_provider(id, "dr-jane", "Europe/Berlin").await.unwrap();

    let info = engine.resolve_provider("dr-jane").unwrap();
    assert_eq!(info.id, id);
    assert_eq!(info.timezone, "Europe/Berlin");
    assert!(matches!(engine.resolve_provider("nobody"), Err(EngineError::UnknownProvider(_))));
}

#[tokio::test]
async fn provider_duplicate_slug_rejected() {
    let engine = engine_at(test_wal_path("provider_dup_slug.wal"));
    engine.register_provider(Ulid::new(), "taken", "UTC").await.unwrap();
    let result = engine.register_provider(Ulid::new(), "taken", "UTC").await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn provider_unknown_timezone_rejected() {
    let engine = engine_at(test_wal_path("provider_bad_tz.wal"));
    let result = engine.register_provider(Ulid::new(), "lost", "Mars/Olympus").await;
    assert!(matches!(
        result,
        Err(EngineError::Validation(ValidationError::UnknownTimezone(_)))
    ));
}

// ── Pattern store ────────────────────────────────────────

#[tokio::test]
async fn upsert_non_overlapping_succeeds() {
    let engine = engine_at(test_wal_path("upsert_ok.wal"));
    let pid = provider(&engine).await;
    let scope = Scope::new(pid, SessionType::Personal);

    let result = engine
        .upsert_patterns(
            pid,
            SessionType::Personal,
            vec![
                draft(1, t(9, 0), t(12, 0)),
                draft(1, t(13, 0), t(17, 0)),
                draft(3, t(9, 0), t(17, 0)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result.patterns.len(), 3);
    assert!(result.patterns.iter().all(|p| p.timezone == "UTC"));
    assert!(!result.report.is_partial());
    assert!(result.report.created > 0);

    let listed = engine.list_patterns(pid, SessionType::Personal).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert!(engine.notify.stamps(scope).patterns_changed_at.is_some());
}

#[tokio::test]
async fn upsert_overlap_commits_nothing() {
    let engine = engine_at(test_wal_path("upsert_overlap.wal"));
    let pid = provider(&engine).await;
    let scope = Scope::new(pid, SessionType::Personal);

    let result = engine
        .upsert_patterns(
            pid,
            SessionType::Personal,
            vec![
                draft(2, t(8, 0), t(10, 0)),
                draft(1, t(9, 0), t(12, 0)),
                draft(1, t(11, 0), t(13, 0)),
            ],
        )
        .await;
    match result {
        Err(EngineError::Validation(ValidationError::Overlap { day, first_start, second_start, .. })) => {
            assert_eq!(day, 1);
            assert_eq!(first_start, t(9, 0));
            assert_eq!(second_start, t(11, 0));
        }
        other => panic!("expected overlap, got {other:?}"),
    }

    assert!(engine.list_patterns(pid, SessionType::Personal).await.unwrap().is_empty());
    assert!(engine.list_slots(pid, SessionType::Personal, None).await.unwrap().is_empty());
    assert_eq!(engine.notify.last_event(scope), None);
    assert_eq!(engine.wal_appends_since_compact().await, 1); // provider only
}

#[tokio::test]
async fn upsert_rejects_malformed_range_and_day() {
    let engine = engine_at(test_wal_path("upsert_malformed.wal"));
    let pid = provider(&engine).await;

    let result = engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(12, 0), t(9, 0))])
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Validation(ValidationError::MalformedRange { .. }))
    ));

    let result = engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(7, t(9, 0), t(12, 0))])
        .await;
    assert!(matches!(result, Err(EngineError::Validation(ValidationError::InvalidDay(7)))));
}

#[tokio::test]
async fn upsert_for_unknown_provider_fails() {
    let engine = engine_at(test_wal_path("upsert_unknown_provider.wal"));
    let result = engine
        .upsert_patterns(Ulid::new(), SessionType::Personal, vec![draft(1, t(9, 0), t(12, 0))])
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn upsert_deactivates_missing_patterns() {
    let engine = engine_at(test_wal_path("upsert_deactivate.wal"));
    let pid = provider(&engine).await;
    let first = engine
        .upsert_patterns(
            pid,
            SessionType::Personal,
            vec![draft(1, t(9, 0), t(12, 0)), draft(2, t(9, 0), t(12, 0))],
        )
        .await
        .unwrap();
    let keep = first.patterns.iter().find(|p| p.day_of_week == 1).unwrap().clone();

    let second = engine
        .upsert_patterns(
            pid,
            SessionType::Personal,
            vec![PatternDraft { id: Some(keep.id), ..draft(1, t(9, 0), t(11, 0)) }],
        )
        .await
        .unwrap();

    assert_eq!(second.patterns.len(), 2);
    let kept = second.patterns.iter().find(|p| p.id == keep.id).unwrap();
    assert!(kept.is_active);
    assert_eq!(kept.end_time, t(11, 0));
    let dropped = second.patterns.iter().find(|p| p.id != keep.id).unwrap();
    assert!(!dropped.is_active);
    assert!(second.report.expired > 0);
}

#[tokio::test]
async fn upsert_rejects_pattern_from_other_scope() {
    let engine = engine_at(test_wal_path("upsert_foreign.wal"));
    let pid = provider(&engine).await;
    let personal = engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(9, 0), t(12, 0))])
        .await
        .unwrap();
    let foreign_id = personal.patterns[0].id;

    let result = engine
        .upsert_patterns(
            pid,
            SessionType::Webinar,
            vec![PatternDraft { id: Some(foreign_id), ..draft(1, t(9, 0), t(12, 0)) }],
        )
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Validation(ValidationError::ForeignPattern(id))) if id == foreign_id
    ));
}

// ── Slot generation ──────────────────────────────────────

#[tokio::test]
async fn monday_example_eight_slots_then_seven() {
    let engine = engine_at(test_wal_path("monday_example.wal"));
    let pid = monday_provider(&engine).await;
    let monday = upcoming_monday();

    let times = engine.list_available_times(pid, SessionType::Personal, monday).await.unwrap();
    let starts: Vec<NaiveTime> = times.iter().map(|s| s.start_time).collect();
    assert_eq!(starts, (9..17).map(|h| t(h, 0)).collect::<Vec<_>>());
    assert!(times.iter().all(|s| s.ends_at - s.starts_at == H));

    let ten = slot_at(&engine, pid, monday, t(10, 0)).await;
    engine.book_directly(ten, contact("Ada"), None).await.unwrap();

    let times = engine.list_available_times(pid, SessionType::Personal, monday).await.unwrap();
    assert_eq!(times.len(), 7);
    assert!(times.iter().all(|s| s.start_time != t(10, 0)));
}

#[tokio::test]
async fn regeneration_is_idempotent() {
    let engine = engine_at(test_wal_path("regen_idempotent.wal"));
    let pid = monday_provider(&engine).await;

    let before = engine.list_slots(pid, SessionType::Personal, None).await.unwrap();
    let report = engine.regenerate(pid, SessionType::Personal).await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.refreshed, 0);
    assert_eq!(report.expired, 0);

    let after = engine.list_slots(pid, SessionType::Personal, None).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn regeneration_never_touches_held_or_booked() {
    let engine = engine_at(test_wal_path("regen_held_booked.wal"));
    let pid = monday_provider(&engine).await;
    let monday = upcoming_monday();
    let nine = slot_at(&engine, pid, monday, t(9, 0)).await;
    let ten = slot_at(&engine, pid, monday, t(10, 0)).await;

    engine.hold_slot(nine, "tab-a", None).await.unwrap();
    let booking = engine.book_directly(ten, contact("Bo"), None).await.unwrap();

    // Shrink the pattern so both slots fall outside it.
    engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(14, 0), t(17, 0))])
        .await
        .unwrap();

    let nine_info = engine.slot_info(nine).await.unwrap();
    assert_eq!(nine_info.state, SlotState::Held);
    let ten_info = engine.slot_info(ten).await.unwrap();
    assert_eq!(ten_info.state, SlotState::Booked);
    assert_eq!(ten_info.slot.booking_id(), Some(booking.id));

    // The 11:00 slot was OPEN and is no longer produced.
    let eleven = engine
        .list_slots(pid, SessionType::Personal, Some(monday))
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.slot.start_time == t(11, 0))
        .unwrap();
    assert_eq!(eleven.state, SlotState::Expired);
}

#[tokio::test]
async fn reactivated_pattern_reopens_expired_slots() {
    let engine = engine_at(test_wal_path("regen_reopen.wal"));
    let pid = monday_provider(&engine).await;
    let monday = upcoming_monday();
    let nine = slot_at(&engine, pid, monday, t(9, 0)).await;

    engine.deactivate_patterns(pid, SessionType::Personal).await.unwrap();
    assert_eq!(engine.slot_info(nine).await.unwrap().state, SlotState::Expired);
    assert!(engine.list_available_dates(pid, SessionType::Personal).await.unwrap().is_empty());

    engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(9, 0), t(17, 0))])
        .await
        .unwrap();
    let info = engine.slot_info(nine).await.unwrap();
    assert_eq!(info.state, SlotState::Open);
    assert_eq!(info.slot.id, nine);
}

#[tokio::test]
async fn webinar_without_patterns_has_no_dates() {
    let engine = engine_at(test_wal_path("webinar_empty.wal"));
    let pid = monday_provider(&engine).await;
    assert!(!engine.list_available_dates(pid, SessionType::Personal).await.unwrap().is_empty());
    assert!(engine.list_available_dates(pid, SessionType::Webinar).await.unwrap().is_empty());
}

#[tokio::test]
async fn webinar_uses_its_own_duration() {
    let engine = engine_at(test_wal_path("webinar_duration.wal"));
    let pid = provider(&engine).await;
    engine
        .upsert_patterns(pid, SessionType::Webinar, vec![draft(1, t(9, 0), t(13, 0))])
        .await
        .unwrap();
    let times = engine
        .list_available_times(pid, SessionType::Webinar, upcoming_monday())
        .await
        .unwrap();
    // 90 minute sessions: 09:00, 10:30; the 12:00 remainder is too short.
    let starts: Vec<NaiveTime> = times.iter().map(|s| s.start_time).collect();
    assert_eq!(starts, vec![t(9, 0), t(10, 30)]);
    assert_eq!(times[0].ends_at - times[0].starts_at, 90 * M);
}

#[tokio::test]
async fn partial_generation_failure_commits_the_rest() {
    let scope = Scope::new(Ulid::new(), SessionType::Personal);
    let mut rs = ScopeState::new(scope);
    let good = AvailabilityPattern {
        id: Ulid::new(),
        provider_id: scope.provider_id,
        session_type: scope.session_type,
        day_of_week: 1,
        start_time: t(9, 0),
        end_time: t(11, 0),
        timezone: "UTC".into(),
        is_active: true,
    };
    let broken = AvailabilityPattern {
        id: Ulid::new(),
        day_of_week: 2,
        timezone: "Not/AZone".into(),
        ..good.clone()
    };
    rs.apply(&Event::PatternsReplaced { scope, patterns: vec![good, broken.clone()] });

    let monday = upcoming_monday();
    let window = DateWindow::new(monday, monday + chrono::Duration::days(2));
    let (events, report) = plan_generation(&rs, &rs.patterns, &window, H, now_ms()).unwrap();

    assert!(report.is_partial());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].pattern_id, broken.id);
    assert!(matches!(report.errors[0].kind, PatternErrorKind::UnknownTimezone(_)));
    assert_eq!(report.created, 2);
    assert!(matches!(&events[0], Event::SlotsUpserted { slots, .. } if slots.len() == 2));
}

#[tokio::test]
async fn oversized_pattern_set_is_refused_before_commit() {
    let settings = EngineSettings {
        personal: SessionSettings { duration_ms: M, price_cents: 0 },
        ..EngineSettings::default()
    };
    let path = test_wal_path("upsert_slot_cap.wal");
    let engine = Engine::new(path.clone(), Arc::new(StalenessHub::new()), settings.clone()).unwrap();
    let pid = monday_provider(&engine).await;
    let before = engine.list_patterns(pid, SessionType::Personal).await.unwrap();

    // Every day 08:00-20:00 in one-minute sessions overflows the scope.
    let every_day = (0..7).map(|day| draft(day, t(8, 0), t(20, 0))).collect();
    assert!(matches!(
        engine.upsert_patterns(pid, SessionType::Personal, every_day).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(engine.list_patterns(pid, SessionType::Personal).await.unwrap(), before);
    assert!(engine.regenerate(pid, SessionType::Personal).await.is_ok());
    drop(engine);

    // Nothing of the refused set reached the log either.
    let reopened = Engine::new(path, Arc::new(StalenessHub::new()), settings).unwrap();
    assert_eq!(reopened.list_patterns(pid, SessionType::Personal).await.unwrap(), before);
    assert!(reopened.regenerate(pid, SessionType::Personal).await.is_ok());
}

#[tokio::test]
async fn generation_report_is_kept() {
    let engine = engine_at(test_wal_path("generation_report.wal"));
    let pid = monday_provider(&engine).await;
    let report = engine
        .last_generation_report(pid, SessionType::Personal)
        .await
        .unwrap()
        .unwrap();
    assert!(report.created >= 8);
    assert!(report.window.is_some());
    assert_eq!(engine.last_generation_report(pid, SessionType::Webinar).await.unwrap(), None);
}

// ── Reservation service ──────────────────────────────────

#[tokio::test]
async fn concurrent_book_directly_exactly_one_wins() {
    let engine = Arc::new(engine_at(test_wal_path("concurrent_direct.wal")));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.book_directly(slot, contact(&format!("Client{i}")), None).await })
        })
        .collect();

    let mut wins = 0;
    let mut losses = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SlotUnavailable(id)) => {
                assert_eq!(id, slot);
                losses += 1;
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(losses, 7);
    assert_eq!(engine.list_bookings(pid).unwrap().len(), 1);
}

#[tokio::test]
async fn confirm_and_direct_race_one_wins() {
    let engine = Arc::new(engine_at(test_wal_path("confirm_vs_direct.wal")));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    engine.hold_slot(slot, "holder", None).await.unwrap();

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.confirm_booking(slot, "holder", contact("Holder"), None).await })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.book_directly(slot, contact("Other"), None).await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.is_ok());
    assert!(matches!(b, Err(EngineError::SlotUnavailable(_))));
}

#[tokio::test]
async fn hold_then_confirm() {
    let engine = engine_at(test_wal_path("hold_confirm.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;

    let hold = engine.hold_slot(slot, "tab-1", Some(5 * M)).await.unwrap();
    assert_eq!(hold.slot_id, slot);
    assert!(hold.expires_at > now_ms());
    assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Held);

    let booking = engine.confirm_booking(slot, "tab-1", contact("Ada"), None).await.unwrap();
    assert_eq!(booking.slot_id, Some(slot));
    assert_eq!(engine.get_booking(&booking.id), Some(booking.clone()));
    let info = engine.slot_info(slot).await.unwrap();
    assert_eq!(info.state, SlotState::Booked);
    assert_eq!(info.slot.booking_id(), Some(booking.id));
}

#[tokio::test]
async fn held_slot_is_unavailable_to_others() {
    let engine = engine_at(test_wal_path("hold_conflict.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    engine.hold_slot(slot, "tab-a", None).await.unwrap();

    assert!(matches!(
        engine.hold_slot(slot, "tab-b", None).await,
        Err(EngineError::SlotUnavailable(_))
    ));
    assert!(matches!(
        engine.confirm_booking(slot, "tab-b", contact("Eve"), None).await,
        Err(EngineError::HoldMismatch(_))
    ));
    assert!(matches!(
        engine.book_directly(slot, contact("Eve"), None).await,
        Err(EngineError::SlotUnavailable(_))
    ));
    assert!(matches!(
        engine.release_hold(slot, "tab-b").await,
        Err(EngineError::HoldMismatch(_))
    ));
}

#[tokio::test]
async fn holder_can_extend_its_hold() {
    let engine = engine_at(test_wal_path("hold_extend.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    let first = engine.hold_slot(slot, "tab-a", Some(M)).await.unwrap();
    let second = engine.hold_slot(slot, "tab-a", Some(5 * M)).await.unwrap();
    assert!(second.expires_at > first.expires_at);
}

#[tokio::test]
async fn hold_ttl_is_bounded() {
    let engine = engine_at(test_wal_path("hold_ttl_bound.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    assert!(matches!(
        engine.hold_slot(slot, "tab", Some(MAX_HOLD_TTL_MS + 1)).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.hold_slot(slot, "tab", Some(0)).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.hold_slot(slot, "  ", None).await,
        Err(EngineError::Validation(ValidationError::MissingField("holder_token")))
    ));
}

#[tokio::test]
async fn lapsed_hold_reads_open_and_is_bookable() {
    let engine = engine_at(test_wal_path("hold_lapse.wal"));
    let pid = monday_provider(&engine).await;
    let monday = upcoming_monday();
    let slot = slot_at(&engine, pid, monday, t(9, 0)).await;

    engine.hold_slot(slot, "abandoned", Some(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Open);
    let times = engine.list_available_times(pid, SessionType::Personal, monday).await.unwrap();
    assert!(times.iter().any(|s| s.slot_id == slot));

    assert!(matches!(
        engine.confirm_booking(slot, "abandoned", contact("Late"), None).await,
        Err(EngineError::HoldExpired(_))
    ));
    engine.book_directly(slot, contact("Next"), None).await.unwrap();
    assert!(matches!(
        engine.confirm_booking(slot, "abandoned", contact("Late"), None).await,
        Err(EngineError::SlotUnavailable(_))
    ));
}

#[tokio::test]
async fn release_hold_reopens() {
    let engine = engine_at(test_wal_path("hold_release.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    engine.hold_slot(slot, "tab", None).await.unwrap();
    engine.release_hold(slot, "tab").await.unwrap();
    assert_eq!(engine.slot_info(slot).await.unwrap().slot.status, SlotStatus::Open);
    assert!(matches!(engine.release_hold(slot, "tab").await, Err(EngineError::HoldExpired(_))));
}

#[tokio::test]
async fn slots_of_a_dropped_pattern_do_not_reopen() {
    let engine = engine_at(test_wal_path("orphan_reopen.wal"));
    let pid = monday_provider(&engine).await;
    let monday = upcoming_monday();
    let held = slot_at(&engine, pid, monday, t(9, 0)).await;
    let lapsed = slot_at(&engine, pid, monday, t(10, 0)).await;
    let lapsing = slot_at(&engine, pid, monday, t(11, 0)).await;
    let booked = slot_at(&engine, pid, monday, t(12, 0)).await;
    engine.hold_slot(held, "tab", None).await.unwrap();
    engine.hold_slot(lapsed, "gone", Some(1)).await.unwrap();
    let booking = engine.book_directly(booked, contact("Ada"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.hold_slot(lapsing, "later", Some(200)).await.unwrap();

    // Monday moves to Tuesday while the slots are taken.
    let moved = engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(2, t(9, 0), t(17, 0))])
        .await
        .unwrap();
    assert!(moved.report.expired > 0);
    assert_eq!(engine.slot_info(lapsed).await.unwrap().state, SlotState::Expired);
    assert_eq!(engine.slot_info(held).await.unwrap().state, SlotState::Held);

    engine.release_hold(held, "tab").await.unwrap();
    engine.cancel_booking(booking.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.reap_hold(lapsing).await.unwrap());

    for slot in [held, lapsed, lapsing, booked] {
        assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Expired);
        assert!(matches!(
            engine.book_directly(slot, contact("Bo"), None).await,
            Err(EngineError::SlotUnavailable(_))
        ));
    }
    let times = engine.list_available_times(pid, SessionType::Personal, monday).await.unwrap();
    assert!(times.is_empty());
}

#[tokio::test]
async fn released_slot_of_a_live_pattern_reopens() {
    let engine = engine_at(test_wal_path("orphan_live.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    let booking = engine.book_directly(slot, contact("Ada"), None).await.unwrap();

    // Same Monday hours under a fresh pattern id still produce the slot.
    engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(9, 0), t(17, 0))])
        .await
        .unwrap();
    engine.cancel_booking(booking.id).await.unwrap();
    assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Open);
}

#[tokio::test]
async fn reaper_writes_back_lapsed_holds() {
    let engine = engine_at(test_wal_path("reap_holds.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    engine.hold_slot(slot, "gone", Some(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let expired = engine.collect_expired_holds(now_ms());
    assert_eq!(expired, vec![(Scope::new(pid, SessionType::Personal), slot)]);
    assert!(engine.reap_hold(slot).await.unwrap());
    assert!(!engine.reap_hold(slot).await.unwrap());
    assert!(engine.collect_expired_holds(now_ms()).is_empty());
}

#[tokio::test]
async fn unknown_slot_is_not_found() {
    let engine = engine_at(test_wal_path("unknown_slot.wal"));
    let missing = Ulid::new();
    assert!(matches!(
        engine.book_directly(missing, contact("Ada"), None).await,
        Err(EngineError::NotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn contact_is_validated_before_booking() {
    let engine = engine_at(test_wal_path("contact_validation.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;

    let no_email = ContactDetails { email: String::new(), ..contact("Ada") };
    assert!(matches!(
        engine.book_directly(slot, no_email, None).await,
        Err(EngineError::Validation(ValidationError::MissingField("client_email")))
    ));
    let bad_email = ContactDetails { email: "ada.example.com".into(), ..contact("Ada") };
    assert!(matches!(
        engine.book_directly(slot, bad_email, None).await,
        Err(EngineError::Validation(ValidationError::InvalidField { field: "client_email", .. }))
    ));
    assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Open);
}

#[tokio::test]
async fn manual_booking_has_no_slot() {
    let engine = engine_at(test_wal_path("manual_booking.wal"));
    let pid = provider(&engine).await;
    let booking = engine
        .create_manual_booking(pid, SessionType::Webinar, contact("Lead"), None)
        .await
        .unwrap();
    assert!(booking.is_manual());
    assert_eq!(engine.list_bookings(pid).unwrap(), vec![booking.clone()]);

    engine.cancel_booking(booking.id).await.unwrap();
    assert!(engine.list_bookings(pid).unwrap().is_empty());
    assert!(matches!(engine.cancel_booking(booking.id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn cancel_reopens_slot() {
    let engine = engine_at(test_wal_path("cancel_reopens.wal"));
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
    let booking = engine.book_directly(slot, contact("Ada"), None).await.unwrap();

    let cancelled = engine.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled.id, booking.id);
    assert_eq!(engine.get_booking(&booking.id), None);
    assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Open);
    engine.book_directly(slot, contact("Bo"), None).await.unwrap();
}

#[tokio::test]
async fn client_supplied_booking_id_is_unique() {
    let engine = engine_at(test_wal_path("booking_id_unique.wal"));
    let pid = monday_provider(&engine).await;
    let monday = upcoming_monday();
    let nine = slot_at(&engine, pid, monday, t(9, 0)).await;
    let ten = slot_at(&engine, pid, monday, t(10, 0)).await;
    let id = Ulid::new();

    let booking = engine.book_directly(nine, contact("Ada"), Some(id)).await.unwrap();
    assert_eq!(booking.id, id);
    assert!(matches!(
        engine.book_directly(ten, contact("Ada"), Some(id)).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(engine.slot_info(ten).await.unwrap().state, SlotState::Open);
}

#[tokio::test]
async fn same_booking_id_across_scopes_commits_once() {
    let engine = engine_at(test_wal_path("booking_id_race.wal"));
    let p = monday_provider(&engine).await;
    let q = monday_provider(&engine).await;
    let monday = upcoming_monday();
    let p_slot = slot_at(&engine, p, monday, t(9, 0)).await;
    let q_slot = slot_at(&engine, q, monday, t(9, 0)).await;
    let id = Ulid::new();

    let (on_p, on_q, manual) = tokio::join!(
        engine.book_directly(p_slot, contact("Ada"), Some(id)),
        engine.book_directly(q_slot, contact("Bo"), Some(id)),
        engine.create_manual_booking(q, SessionType::Webinar, contact("Cy"), Some(id)),
    );
    let results = [on_p.is_ok(), on_q.is_ok(), manual.is_ok()];
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1, "{results:?}");
    for err in [on_p.err(), on_q.err(), manual.err()].into_iter().flatten() {
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }
    assert!(engine.get_booking(&id).is_some());

    assert!(engine.booking_claims.is_empty());
}

// ── Staleness ────────────────────────────────────────────

#[tokio::test]
async fn booking_publishes_for_its_scope_only() {
    let engine = engine_at(test_wal_path("staleness_scope.wal"));
    let p = monday_provider(&engine).await;
    let q = monday_provider(&engine).await;
    let p_scope = Scope::new(p, SessionType::Personal);
    let q_scope = Scope::new(q, SessionType::Personal);

    let mut rx_p = engine.notify.subscribe(p_scope);
    let mut rx_q = engine.notify.subscribe(q_scope);

    let slot = slot_at(&engine, p, upcoming_monday(), t(9, 0)).await;
    engine.book_directly(slot, contact("Ada"), None).await.unwrap();

    let event = rx_p.recv().await.unwrap();
    assert_eq!(event.scope, p_scope);
    assert_eq!(event.kind, crate::notify::StalenessKind::SlotsChanged);
    assert!(rx_q.try_recv().is_err());
}

#[tokio::test]
async fn pattern_upsert_publishes_patterns_changed() {
    let engine = engine_at(test_wal_path("staleness_patterns.wal"));
    let pid = provider(&engine).await;
    let scope = Scope::new(pid, SessionType::Personal);
    let mut rx = engine.notify.subscribe(scope);

    engine
        .upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(9, 0), t(10, 0))])
        .await
        .unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind, crate::notify::StalenessKind::PatternsChanged);
}

// ── Dispatch ─────────────────────────────────────────────

struct Recording {
    seen: StdMutex<Vec<Ulid>>,
    fail: bool,
}

#[async_trait]
impl BookingDispatcher for Recording {
    async fn booking_created(&self, booking: &Booking) -> Result<(), DispatchError> {
        self.seen.lock().unwrap().push(booking.id);
        if self.fail {
            return Err(DispatchError::Transport("smtp down".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn dispatch_once_per_booking_and_failure_keeps_booking() {
    let recorder = Arc::new(Recording { seen: StdMutex::new(Vec::new()), fail: true });
    let engine = Engine::with_dispatcher(
        test_wal_path("dispatch.wal"),
        Arc::new(StalenessHub::new()),
        EngineSettings::default(),
        recorder.clone(),
    )
    .unwrap();
    let pid = monday_provider(&engine).await;
    let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;

    let direct = engine.book_directly(slot, contact("Ada"), None).await.unwrap();
    let manual = engine
        .create_manual_booking(pid, SessionType::Personal, contact("Lead"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut seen = recorder.seen.lock().unwrap().clone();
    seen.sort();
    let mut expected = vec![direct.id, manual.id];
    expected.sort();
    assert_eq!(seen, expected);
    assert!(engine.get_booking(&direct.id).is_some());
    assert!(engine.get_booking(&manual.id).is_some());
}

// ── Maintenance ──────────────────────────────────────────

#[tokio::test]
async fn sweep_expires_and_purges_past_slots() {
    let engine = engine_at(test_wal_path("sweep_past.wal"));
    let pid = provider(&engine).await;
    let scope = Scope::new(pid, SessionType::Personal);
    let now = now_ms();

    let past_slot = |day: u32, start: Ms| Slot {
        id: Ulid::new(),
        scope,
        date: NaiveDate::from_ymd_opt(2020, 1, day).unwrap(),
        start_time: NaiveTime::from_num_seconds_from_midnight_opt(((start / 1000) % 86_400) as u32, 0).unwrap(),
        end_time: t(23, 59),
        timezone: "UTC".into(),
        span: Span::new(start, start + H),
        status: SlotStatus::Open,
        generated_from: Ulid::new(),
    };
    let recent = past_slot(6, now - 2 * H);
    let ancient = past_slot(5, now - engine.settings.slot_retention_ms - 2 * H);
    {
        let rs = engine.scope_state(scope).await.unwrap();
        let mut guard = rs.write().await;
        let event = Event::SlotsUpserted { scope, slots: vec![recent.clone(), ancient.clone()] };
        engine.persist_and_apply(&mut guard, &event).await.unwrap();
    }

    let (expired, purged) = engine.sweep_past_slots(now).await.unwrap();
    assert_eq!(expired, 2);
    assert_eq!(purged, 1);

    let slots = engine.list_slots(pid, SessionType::Personal, None).await.unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].slot.id, recent.id);
    assert_eq!(slots[0].slot.status, SlotStatus::Expired);
    assert!(engine.scope_for_slot(&ancient.id).is_none());
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay_state.wal");
    let (pid, booking, held) = {
        let engine = engine_at(path.clone());
        let pid = monday_provider(&engine).await;
        let monday = upcoming_monday();
        let nine = slot_at(&engine, pid, monday, t(9, 0)).await;
        let ten = slot_at(&engine, pid, monday, t(10, 0)).await;
        let booking = engine.book_directly(nine, contact("Ada"), None).await.unwrap();
        engine.hold_slot(ten, "tab", Some(10 * M)).await.unwrap();
        (pid, booking, ten)
    };

    let engine = engine_at(path);
    assert!(engine.provider(&pid).is_some());
    assert_eq!(engine.list_patterns(pid, SessionType::Personal).await.unwrap().len(), 1);
    assert_eq!(engine.get_booking(&booking.id), Some(booking.clone()));
    let slot = booking.slot_id.unwrap();
    assert_eq!(engine.slot_info(slot).await.unwrap().state, SlotState::Booked);
    assert_eq!(engine.slot_info(held).await.unwrap().state, SlotState::Held);
    assert!(matches!(
        engine.book_directly(slot, contact("Bo"), None).await,
        Err(EngineError::SlotUnavailable(_))
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction_state.wal");
    let (pid, booking, manual) = {
        let engine = engine_at(path.clone());
        let pid = monday_provider(&engine).await;
        let slot = slot_at(&engine, pid, upcoming_monday(), t(9, 0)).await;
        let booking = engine.book_directly(slot, contact("Ada"), None).await.unwrap();
        let manual = engine
            .create_manual_booking(pid, SessionType::Webinar, contact("Lead"), None)
            .await
            .unwrap();
        for _ in 0..3 {
            engine.regenerate(pid, SessionType::Personal).await.unwrap();
        }
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (pid, booking, manual)
    };

    let engine = engine_at(path);
    let slot = booking.slot_id.unwrap();
    assert_eq!(engine.slot_info(slot).await.unwrap().slot.booking_id(), Some(booking.id));
    assert_eq!(engine.list_bookings(pid).unwrap().len(), 2);
    assert_eq!(engine.get_booking(&manual.id), Some(manual));
    let open = engine
        .list_available_times(pid, SessionType::Personal, upcoming_monday())
        .await
        .unwrap();
    assert_eq!(open.len(), 7);
}

#[tokio::test]
async fn scope_created_during_compaction_survives_restart() {
    let path = test_wal_path("compaction_new_scope.wal");
    let pids = {
        let engine = Arc::new(engine_at(path.clone()));
        let first = monday_provider(&engine).await;
        let scope = Scope::new(first, SessionType::Webinar);

        // A new scope waits for a compaction holding the directory.
        let directory = engine.directory_lock.lock().await;
        let creating = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .upsert_patterns(first, SessionType::Webinar, vec![draft(3, t(9, 0), t(12, 0))])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.get_scope(&scope).is_none());
        drop(directory);
        creating.await.unwrap().unwrap();

        let mut pids = vec![first];
        for _ in 0..10 {
            let pid = provider(&engine).await;
            let (compacted, upserted) = tokio::join!(
                engine.compact_wal(),
                engine.upsert_patterns(pid, SessionType::Personal, vec![draft(1, t(9, 0), t(17, 0))]),
            );
            compacted.unwrap();
            upserted.unwrap();
            pids.push(pid);
        }
        engine.compact_wal().await.unwrap();
        pids
    };

    let engine = engine_at(path);
    assert_eq!(engine.list_patterns(pids[0], SessionType::Webinar).await.unwrap().len(), 1);
    for pid in pids {
        assert_eq!(engine.list_patterns(pid, SessionType::Personal).await.unwrap().len(), 1);
        let open = engine
            .list_available_times(pid, SessionType::Personal, upcoming_monday())
            .await
            .unwrap();
        assert_eq!(open.len(), 8);
    }
}
