use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::join_all;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;
use ulid::Ulid;

use bunkbook::clock::FixedClock;
use bunkbook::config::EnginePolicy;
use bunkbook::engine::{Engine, EngineError};
use bunkbook::model::{DateSet, Event, GuestInfo, RoomCategory};
use bunkbook::notify::NotifyHub;

// ── Test infrastructure ──────────────────────────────────────

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn nights(list: &[&str]) -> DateSet {
    list.iter().map(|s| d(s)).collect()
}

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bunkbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("bunkbook.wal")
}

fn open(path: PathBuf) -> Arc<Engine> {
    Arc::new(
        Engine::new(
            path,
            Arc::new(NotifyHub::new()),
            EnginePolicy::default(),
            Arc::new(FixedClock::on(d("2024-05-01"))),
        )
        .unwrap(),
    )
}

async fn guests(engine: &Engine, count: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("guest-{i}");
        engine.register_guest(GuestInfo::named(&name)).await.unwrap();
        names.push(name);
    }
    names
}

/// Wait for an event with timeout.
async fn recv_event(rx: &mut broadcast::Receiver<Event>, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().and_then(Result::ok)
}

// ── Races ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_suite_bookings_admit_exactly_one() {
    let engine = open(wal_path());
    engine
        .create_room(101, RoomCategory::Suite, dec!(150.00))
        .await
        .unwrap();
    let names = guests(&engine, 2).await;

    let tasks = names.into_iter().map(|name| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .create_reservation(101, &name, nights(&["2024-06-01", "2024-06-02"]))
                .await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|h| h.unwrap()).collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let unavailable = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::Unavailable { room_number: 101, .. })))
        .count();
    assert_eq!((ok, unavailable), (1, 1), "{results:?}");
    assert_eq!(engine.room_occupancy(101).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dorm_bookings_fill_each_bed_once() {
    const BEDS: usize = 4;
    const CONTENDERS: usize = 12;

    let engine = open(wal_path());
    engine
        .create_room(7, RoomCategory::SharedDorm, dec!(40.00))
        .await
        .unwrap();
    for _ in 0..BEDS {
        engine.add_bed(7).await.unwrap();
    }
    let names = guests(&engine, CONTENDERS).await;

    let tasks = names.into_iter().map(|name| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .create_reservation(7, &name, nights(&["2024-07-01", "2024-07-02"]))
                .await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|h| h.unwrap()).collect();

    let booked: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(booked.len(), BEDS);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, EngineError::Unavailable { .. })));

    let mut beds: Vec<_> = booked.iter().map(|r| r.occupancy[0].unit).collect();
    beds.sort();
    beds.dedup();
    assert_eq!(beds.len(), BEDS, "a bed was handed out twice");

    let report = engine
        .check_availability(7, d("2024-07-01"), d("2024-07-03"))
        .await
        .unwrap();
    assert!(!report.available);
    assert_eq!(report.remaining_capacity, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_cancel_and_check_in_never_both_win() {
    let engine = open(wal_path());
    engine
        .create_room(101, RoomCategory::Suite, dec!(150.00))
        .await
        .unwrap();
    let names = guests(&engine, 1).await;

    for _ in 0..10 {
        let r = engine
            .create_reservation(101, &names[0], nights(&["2024-05-01"]))
            .await
            .unwrap();
        let (cancel, check_in) = tokio::join!(
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.cancel(r.id).await }
            }),
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.check_in(r.id).await }
            }),
        );
        let (cancel, check_in) = (cancel.unwrap(), check_in.unwrap());
        assert!(cancel.is_ok() != check_in.is_ok(), "cancel={cancel:?} check_in={check_in:?}");
        engine.delete(r.id).await.unwrap();
    }
    assert_eq!(engine.reservation_count(), 0);
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_history_survives_restart_and_compaction() {
    let path = wal_path();
    let engine = open(path.clone());
    engine
        .create_room(7, RoomCategory::SharedDorm, dec!(40.00))
        .await
        .unwrap();
    engine.add_bed(7).await.unwrap();
    engine.add_bed(7).await.unwrap();
    let names = guests(&engine, 8).await;

    // eight guests, one night each across four nights: two per night
    let tasks = names.iter().enumerate().map(|(i, name)| {
        let engine = engine.clone();
        let name = name.clone();
        let night = d("2024-08-01") + chrono::Days::new((i / 2) as u64);
        tokio::spawn(async move { engine.create_reservation(7, &name, [night].into()).await })
    });
    for h in join_all(tasks).await {
        h.unwrap().unwrap();
    }
    let before = engine.room_occupancy(7).await.unwrap();
    drop(engine);

    let engine = open(path.clone());
    assert_eq!(engine.reservation_count(), 8);
    assert_eq!(engine.room_occupancy(7).await.unwrap(), before);

    engine.compact_wal().await.unwrap();
    drop(engine);

    let engine = open(path);
    assert_eq!(engine.reservation_count(), 8);
    assert_eq!(engine.room_occupancy(7).await.unwrap(), before);
    let full = engine.bed_availability(&nights(&["2024-08-03"])).await.unwrap();
    assert_eq!(full[0].available_beds, 0);
}

// ── Notifications ────────────────────────────────────────────

#[tokio::test]
async fn room_subscribers_receive_committed_events() {
    let engine = open(wal_path());
    let room = engine
        .create_room(101, RoomCategory::Suite, dec!(150.00))
        .await
        .unwrap();
    let other = engine
        .create_room(102, RoomCategory::Suite, dec!(150.00))
        .await
        .unwrap();
    guests(&engine, 1).await;

    let mut rx = engine.subscribe(room.id);
    let mut other_rx = engine.subscribe(other.id);

    let r = engine
        .create_reservation(101, "guest-0", nights(&["2024-06-01"]))
        .await
        .unwrap();
    let event = recv_event(&mut rx, Duration::from_secs(2))
        .await
        .expect("no event for booked room");

    let payload = serde_json::to_value(&event).unwrap();
    let created = &payload["ReservationCreated"];
    assert_eq!(created["reservation"]["id"], serde_json::json!(r.id.to_string()));
    assert_eq!(created["reservation"]["pricing"]["base_price"], serde_json::json!("150.00"));

    assert!(recv_event(&mut other_rx, Duration::from_millis(100)).await.is_none());
}
