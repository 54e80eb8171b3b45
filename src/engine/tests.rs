use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use super::*;
use crate::model::*;
use crate::notify::NotifyHub;

const H: Ms = 3_600_000; // 1 hour in ms
const DAY0: Ms = 1_764_892_800_000; // 2025-12-05T00:00:00Z
const DAY1: Ms = DAY0 + 24 * H;

fn at(hour: Ms) -> Ms {
    DAY0 + hour * H
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("amenityd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn test_engine(name: &str) -> Arc<Engine> {
    let path = test_wal_path(name);
    Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap())
}

fn admin() -> Session {
    Session {
        user: "warden".into(),
        role: Role::Admin,
    }
}

fn resident(user: &str) -> Session {
    Session {
        user: user.into(),
        role: Role::Resident,
    }
}

fn request(facility_id: Ulid, title: &str, start: Ms, end: Ms, created_by: &str) -> BookingRequest {
    BookingRequest {
        facility_id,
        title: title.into(),
        start,
        end,
        note: None,
        created_by: created_by.into(),
    }
}

async fn hall(engine: &Engine) -> Ulid {
    engine
        .create_facility("Community Hall".into(), Some("Ground floor".into()), &admin())
        .await
        .unwrap()
        .id
}

// ── Facilities ───────────────────────────────────────────

#[tokio::test]
async fn facility_create_and_list() {
    let engine = test_engine("facility_list.wal");
    let id = hall(&engine).await;

    let facilities = engine.list_facilities().await;
    assert_eq!(facilities.len(), 1);
    assert_eq!(facilities[0].id, id);
    assert_eq!(facilities[0].name, "Community Hall");
    assert_eq!(facilities[0].booking_count, 0);
}

#[tokio::test]
async fn facility_create_requires_admin() {
    let engine = test_engine("facility_admin_only.wal");
    let result = engine
        .create_facility("Gym".into(), None, &resident("alice"))
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
    assert!(engine.list_facilities().await.is_empty());
}

#[tokio::test]
async fn facility_empty_name_rejected() {
    let engine = test_engine("facility_empty_name.wal");
    let result = engine.create_facility("".into(), None, &admin()).await;
    assert!(matches!(
        result,
        Err(EngineError::Validation { field: "name", .. })
    ));
}

// ── Booking creation ─────────────────────────────────────

#[tokio::test]
async fn booking_created_as_pending() {
    let engine = test_engine("booking_pending.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.facility_id, fid);
    assert_eq!(booking.created_by, "alice");
    assert_eq!(booking.span, Span::new(at(10), at(12)));

    let fetched = engine.get_booking(&booking.id).await.unwrap();
    assert_eq!(fetched, booking);
}

#[tokio::test]
async fn booking_unknown_facility_rejected() {
    let engine = test_engine("booking_no_facility.wal");
    let result = engine
        .create_booking(request(Ulid::new(), "Yoga class", at(10), at(12), "alice"))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn booking_short_title_rejected() {
    let engine = test_engine("booking_short_title.wal");
    let fid = hall(&engine).await;
    let result = engine
        .create_booking(request(fid, "Yo", at(10), at(12), "alice"))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Validation { field: "title", .. })
    ));
}

#[tokio::test]
async fn booking_end_must_be_after_start() {
    let engine = test_engine("booking_inverted.wal");
    let fid = hall(&engine).await;

    let zero_length = engine
        .create_booking(request(fid, "Standup", at(10), at(10), "alice"))
        .await;
    assert!(matches!(
        zero_length,
        Err(EngineError::Validation { field: "endTime", .. })
    ));

    let inverted = engine
        .create_booking(request(fid, "Standup", at(12), at(10), "alice"))
        .await;
    assert!(matches!(
        inverted,
        Err(EngineError::Validation { field: "endTime", .. })
    ));
}

// ── Conflict detection ───────────────────────────────────

#[tokio::test]
async fn overlapping_booking_rejected_with_conflict_list() {
    let engine = test_engine("conflict_listed.wal");
    let fid = hall(&engine).await;

    let existing = engine
        .create_booking(request(fid, "Birthday party", at(10), at(12), "alice"))
        .await
        .unwrap();
    engine
        .approve_booking(existing.id, None, &admin())
        .await
        .unwrap();

    // 11:00–13:00 overlaps the approved 10:00–12:00 booking
    let result = engine
        .create_booking(request(fid, "Band practice", at(11), at(13), "bob"))
        .await;
    match result {
        Err(EngineError::Conflict(conflicts)) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].id, existing.id);
            assert_eq!(conflicts[0].title, "Birthday party");
            assert_eq!(conflicts[0].span, Span::new(at(10), at(12)));
            assert_eq!(conflicts[0].status, BookingStatus::Approved);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn touching_booking_admitted() {
    let engine = test_engine("conflict_touching.wal");
    let fid = hall(&engine).await;

    let existing = engine
        .create_booking(request(fid, "Birthday party", at(10), at(12), "alice"))
        .await
        .unwrap();
    engine
        .approve_booking(existing.id, None, &admin())
        .await
        .unwrap();

    // 12:00–13:00 touches but does not overlap
    let booking = engine
        .create_booking(request(fid, "Band practice", at(12), at(13), "bob"))
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
}

#[tokio::test]
async fn pending_bookings_also_block() {
    let engine = test_engine("conflict_pending.wal");
    let fid = hall(&engine).await;

    engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();

    let result = engine
        .create_booking(request(fid, "Pilates", at(11), at(13), "bob"))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn conflicts_scoped_to_facility() {
    let engine = test_engine("conflict_scoped.wal");
    let fid_a = hall(&engine).await;
    let fid_b = engine
        .create_facility("Tennis Court".into(), None, &admin())
        .await
        .unwrap()
        .id;

    engine
        .create_booking(request(fid_a, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();

    // Same interval on a different facility is fine
    let booking = engine
        .create_booking(request(fid_b, "Doubles", at(10), at(12), "bob"))
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
}

#[tokio::test]
async fn all_overlapping_actives_reported() {
    let engine = test_engine("conflict_multi.wal");
    let fid = hall(&engine).await;

    engine
        .create_booking(request(fid, "Morning slot", at(9), at(11), "alice"))
        .await
        .unwrap();
    engine
        .create_booking(request(fid, "Midday slot", at(11), at(13), "bob"))
        .await
        .unwrap();

    let result = engine
        .create_booking(request(fid, "Long event", at(10), at(12), "carol"))
        .await;
    match result {
        Err(EngineError::Conflict(conflicts)) => assert_eq!(conflicts.len(), 2),
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_creates_admit_exactly_one() {
    let engine = test_engine("conflict_concurrent.wal");
    let fid = hall(&engine).await;

    let (a, b) = tokio::join!(
        engine.create_booking(request(fid, "First come", at(10), at(12), "alice")),
        engine.create_booking(request(fid, "First served", at(11), at(13), "bob")),
    );
    // The facility write lock serializes check-then-insert: exactly one wins
    assert_eq!(a.is_ok() as usize + b.is_ok() as usize, 1);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn approve_records_reason_and_blocks_reversal() {
    let engine = test_engine("approve_reason.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();
    let approved = engine
        .approve_booking(booking.id, Some("Approved, enjoy".into()), &admin())
        .await
        .unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);
    assert_eq!(approved.review_reason.as_deref(), Some("Approved, enjoy"));
    assert_eq!(approved.reviewed_by.as_deref(), Some("warden"));

    // A subsequent reject attempt fails and mutates nothing
    let result = engine.reject_booking(booking.id, None, &admin()).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Approved,
            to: BookingStatus::Rejected,
        })
    ));
    let fetched = engine.get_booking(&booking.id).await.unwrap();
    assert_eq!(fetched.status, BookingStatus::Approved);
    assert_eq!(fetched.review_reason.as_deref(), Some("Approved, enjoy"));
}

#[tokio::test]
async fn reject_is_terminal() {
    let engine = test_engine("reject_terminal.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();
    engine
        .reject_booking(booking.id, Some("double-booked hall".into()), &admin())
        .await
        .unwrap();

    let result = engine.approve_booking(booking.id, None, &admin()).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Rejected,
            to: BookingStatus::Approved,
        })
    ));
    let fetched = engine.get_booking(&booking.id).await.unwrap();
    assert_eq!(fetched.status, BookingStatus::Rejected);
}

#[tokio::test]
async fn review_requires_admin() {
    let engine = test_engine("review_admin_only.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();

    let result = engine
        .approve_booking(booking.id, None, &resident("alice"))
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
    let fetched = engine.get_booking(&booking.id).await.unwrap();
    assert_eq!(fetched.status, BookingStatus::Pending);
}

#[tokio::test]
async fn rejected_booking_frees_the_slot() {
    let engine = test_engine("rejected_frees.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();
    engine
        .reject_booking(booking.id, None, &admin())
        .await
        .unwrap();

    // Terminal bookings never conflict
    let second = engine
        .create_booking(request(fid, "Pilates", at(10), at(12), "bob"))
        .await
        .unwrap();
    assert_eq!(second.status, BookingStatus::Pending);
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let engine = test_engine("cancel_frees.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();
    engine
        .approve_booking(booking.id, None, &admin())
        .await
        .unwrap();
    engine
        .cancel_booking(booking.id, &resident("alice"))
        .await
        .unwrap();

    let second = engine
        .create_booking(request(fid, "Pilates", at(10), at(12), "bob"))
        .await
        .unwrap();
    assert_eq!(second.status, BookingStatus::Pending);
}

#[tokio::test]
async fn cancel_by_stranger_forbidden() {
    let engine = test_engine("cancel_stranger.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();

    let result = engine.cancel_booking(booking.id, &resident("mallory")).await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
    let fetched = engine.get_booking(&booking.id).await.unwrap();
    assert_eq!(fetched.status, BookingStatus::Pending);

    // Admins may cancel anyone's booking
    engine.cancel_booking(booking.id, &admin()).await.unwrap();
    let fetched = engine.get_booking(&booking.id).await.unwrap();
    assert_eq!(fetched.status, BookingStatus::Cancelled);
    assert_eq!(fetched.cancelled_by.as_deref(), Some("warden"));
}

#[tokio::test]
async fn cancel_terminal_fails() {
    let engine = test_engine("cancel_terminal.wal");
    let fid = hall(&engine).await;

    let booking = engine
        .create_booking(request(fid, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();
    engine
        .cancel_booking(booking.id, &resident("alice"))
        .await
        .unwrap();

    let result = engine.cancel_booking(booking.id, &resident("alice")).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Cancelled,
            to: BookingStatus::Cancelled,
        })
    ));
}

#[tokio::test]
async fn unknown_booking_not_found() {
    let engine = test_engine("booking_not_found.wal");
    let id = Ulid::new();
    assert!(matches!(
        engine.get_booking(&id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.approve_booking(id, None, &admin()).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.cancel_booking(id, &admin()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_bookings_filters_compose() {
    let engine = test_engine("list_filters.wal");
    let fid_a = hall(&engine).await;
    let fid_b = engine
        .create_facility("Tennis Court".into(), None, &admin())
        .await
        .unwrap()
        .id;

    let a1 = engine
        .create_booking(request(fid_a, "Yoga class", at(10), at(12), "alice"))
        .await
        .unwrap();
    let a2 = engine
        .create_booking(request(fid_a, "Night do", DAY1 + 20 * H, DAY1 + 22 * H, "bob"))
        .await
        .unwrap();
    let b1 = engine
        .create_booking(request(fid_b, "Doubles", at(10), at(12), "carol"))
        .await
        .unwrap();
    engine.approve_booking(a1.id, None, &admin()).await.unwrap();

    let all = engine.list_bookings(BookingFilter::default()).await.unwrap();
    assert_eq!(all.total, 3);

    let on_a = engine
        .list_bookings(BookingFilter {
            facility_id: Some(fid_a),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(on_a.total, 2);

    let approved = engine
        .list_bookings(BookingFilter {
            status: Some(BookingStatus::Approved),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(approved.total, 1);
    assert_eq!(approved.bookings[0].id, a1.id);

    // Window covering only day 0 drops the day-1 booking
    let windowed = engine
        .list_bookings(BookingFilter {
            window: Some(Span::new(DAY0, DAY1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(windowed.total, 2);
    assert!(windowed.bookings.iter().all(|b| b.id != a2.id));
    assert!(windowed.bookings.iter().any(|b| b.id == b1.id));
}

#[tokio::test]
async fn list_bookings_unknown_facility() {
    let engine = test_engine("list_unknown_facility.wal");
    let result = engine
        .list_bookings(BookingFilter {
            facility_id: Some(Ulid::new()),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn list_bookings_sorted_by_start() {
    let engine = test_engine("list_sorted.wal");
    let fid = hall(&engine).await;

    engine
        .create_booking(request(fid, "Afternoon", at(14), at(15), "alice"))
        .await
        .unwrap();
    engine
        .create_booking(request(fid, "Morning", at(9), at(10), "bob"))
        .await
        .unwrap();

    let page = engine.list_bookings(BookingFilter::default()).await.unwrap();
    assert_eq!(page.bookings[0].title, "Morning");
    assert_eq!(page.bookings[1].title, "Afternoon");
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_full_state() {
    let path = test_wal_path("replay_full.wal");

    let (fid, approved_id, rejected_id, cancelled_id, pending_id) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let fid = hall(&engine).await;

        let approved = engine
            .create_booking(request(fid, "Yoga class", at(8), at(9), "alice"))
            .await
            .unwrap();
        engine
            .approve_booking(approved.id, Some("fine by me".into()), &admin())
            .await
            .unwrap();

        let rejected = engine
            .create_booking(request(fid, "Loud band", at(10), at(11), "bob"))
            .await
            .unwrap();
        engine
            .reject_booking(rejected.id, Some("too loud".into()), &admin())
            .await
            .unwrap();

        let cancelled = engine
            .create_booking(request(fid, "Book club", at(12), at(13), "carol"))
            .await
            .unwrap();
        engine
            .cancel_booking(cancelled.id, &resident("carol"))
            .await
            .unwrap();

        let pending = engine
            .create_booking(request(fid, "Chess night", at(14), at(15), "dave"))
            .await
            .unwrap();

        (fid, approved.id, rejected.id, cancelled.id, pending.id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();

    let facilities = engine.list_facilities().await;
    assert_eq!(facilities.len(), 1);
    assert_eq!(facilities[0].id, fid);
    assert_eq!(facilities[0].booking_count, 4);

    let approved = engine.get_booking(&approved_id).await.unwrap();
    assert_eq!(approved.status, BookingStatus::Approved);
    assert_eq!(approved.review_reason.as_deref(), Some("fine by me"));
    assert_eq!(approved.reviewed_by.as_deref(), Some("warden"));

    let rejected = engine.get_booking(&rejected_id).await.unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);
    assert_eq!(rejected.review_reason.as_deref(), Some("too loud"));

    let cancelled = engine.get_booking(&cancelled_id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by.as_deref(), Some("carol"));

    let pending = engine.get_booking(&pending_id).await.unwrap();
    assert_eq!(pending.status, BookingStatus::Pending);
    assert_eq!(pending.created_by, "dave");

    // Replayed terminal bookings still don't block the slot
    let replacement = engine
        .create_booking(request(fid, "Quiet band", at(10), at(11), "erin"))
        .await
        .unwrap();
    assert_eq!(replacement.status, BookingStatus::Pending);

    // And the replayed approved booking still does
    let clash = engine
        .create_booking(request(fid, "Stretching", at(8), at(9), "erin"))
        .await;
    assert!(matches!(clash, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn compaction_survives_replay_after_more_appends() {
    let path = test_wal_path("compact_then_append.wal");
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    let fid = hall(&engine).await;

    let first = engine
        .create_booking(request(fid, "Yoga class", at(8), at(9), "alice"))
        .await
        .unwrap();
    engine.compact_wal().await.unwrap();

    // Appends after compaction land in the rewritten log
    let second = engine
        .create_booking(request(fid, "Pilates", at(9), at(10), "bob"))
        .await
        .unwrap();

    let replayed = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert!(replayed.get_booking(&first.id).await.is_ok());
    assert!(replayed.get_booking(&second.id).await.is_ok());
}
