mod support;

use arena_core::{EventKind, RangeKey};
use support::{make_event, make_stop_event, setup_db, ts_today};

#[test]
fn rollups_aggregate_stop_events_per_agent() {
    let mut test_db = setup_db();
    let db = &mut test_db.db;

    db.insert_event(&make_stop_event(&ts_today("10:00:00"), "scout", 100, 50))
        .expect("insert");
    db.insert_event(&make_stop_event(&ts_today("11:00:00"), "scout", 300, 150))
        .expect("insert");
    db.insert_event(&make_stop_event(&ts_today("12:00:00"), "builder", 10, 5))
        .expect("insert");
    db.insert_event(&make_event(EventKind::Start, &ts_today("12:30:00"), "scout"))
        .expect("start ignored by rollups");

    let rollups = db.agent_rollups(RangeKey::Today).expect("rollups");
    assert_eq!(rollups.len(), 2);

    let scout = rollups.iter().find(|r| r.agent == "scout").expect("scout");
    assert_eq!(scout.invocations, 2);
    assert_eq!(scout.total_input_tokens, 400);
    assert_eq!(scout.total_output_tokens, 200);
    assert!((scout.avg_duration_seconds - 2.5).abs() < 1e-9);
    assert_eq!(scout.last_used.as_deref(), Some(ts_today("11:00:00").as_str()));
}

#[test]
fn rollups_respect_date_range() {
    let mut test_db = setup_db();
    let db = &mut test_db.db;

    db.insert_event(&make_stop_event("2020-01-01T10:00:00Z", "scout", 100, 50))
        .expect("old event");
    db.insert_event(&make_stop_event(&ts_today("10:00:00"), "scout", 10, 5))
        .expect("today event");

    let today = db.agent_rollups(RangeKey::Today).expect("today");
    assert_eq!(today[0].invocations, 1);
    assert_eq!(today[0].total_input_tokens, 10);

    let all = db.agent_rollups(RangeKey::All).expect("all");
    assert_eq!(all[0].invocations, 2);
    assert_eq!(all[0].total_input_tokens, 110);
}

#[test]
fn active_agents_pair_starts_with_stops_by_agent_id() {
    let mut test_db = setup_db();
    let db = &mut test_db.db;

    let mut open = make_event(EventKind::Start, &ts_today("10:00:00"), "scout");
    open.agent_id = "run-1".to_string();
    db.insert_event(&open).expect("open start");

    let mut closed_start = make_event(EventKind::Start, &ts_today("10:01:00"), "builder");
    closed_start.agent_id = "run-2".to_string();
    db.insert_event(&closed_start).expect("closed start");
    let mut closed_stop = make_stop_event(&ts_today("10:02:00"), "builder", 10, 5);
    closed_stop.agent_id = "run-2".to_string();
    db.insert_event(&closed_stop).expect("closed stop");

    // No agent_id: cannot be paired, never counts as active.
    db.insert_event(&make_event(EventKind::Start, &ts_today("10:03:00"), "ghost"))
        .expect("anonymous start");

    let active = db.active_agents().expect("active");
    assert_eq!(active, vec!["scout".to_string()]);
}

#[test]
fn totals_cover_the_whole_fleet() {
    let mut test_db = setup_db();
    let db = &mut test_db.db;

    let mut cached = make_stop_event(&ts_today("10:00:00"), "scout", 100, 50);
    cached.cache_read = 1_000;
    cached.cache_create = 200;
    db.insert_event(&cached).expect("insert");
    db.insert_event(&make_stop_event(&ts_today("11:00:00"), "builder", 30, 20))
        .expect("insert");

    let totals = db.totals(RangeKey::Today).expect("totals");
    assert_eq!(totals.total_invocations, 2);
    assert_eq!(totals.total_input_tokens, 130);
    assert_eq!(totals.total_output_tokens, 70);
    assert_eq!(totals.total_cache_tokens, 1_200);
}

#[test]
fn recent_events_are_newest_first_and_capped() {
    let mut test_db = setup_db();
    let db = &mut test_db.db;

    for minute in 0..5 {
        let ts = ts_today(&format!("10:{minute:02}:00"));
        db.insert_event(&make_stop_event(&ts, "scout", minute as u64, 0))
            .expect("insert");
    }

    let events = db.recent_events(RangeKey::Today, 3).expect("events");
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].ts, ts_today("10:04:00"));
    assert_eq!(events[2].ts, ts_today("10:02:00"));
}

#[test]
fn missing_budget_row_reads_as_none() {
    let test_db = setup_db();
    assert!(
        test_db
            .db
            .budget_for_date("2026-01-01")
            .expect("budget")
            .is_none()
    );
}
