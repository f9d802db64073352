use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use tempfile::TempDir;

use arena_core::RangeKey;
use arena_db::Db;
use arena_sync::{backfill_context_window, reconcile};

struct Fixture {
    _dir: TempDir,
    db: Db,
    events_path: PathBuf,
}

fn setup() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let db_path = dir.path().join("arena.sqlite");
    let events_path = dir.path().join("events.jsonl");
    let mut db = Db::open(&db_path).expect("open db");
    db.migrate().expect("migrate");
    Fixture {
        _dir: dir,
        db,
        events_path,
    }
}

fn append(path: &PathBuf, lines: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open events file");
    file.write_all(lines.as_bytes()).expect("append");
}

fn stop_line(ts: &str, agent: &str, output: u64) -> String {
    format!(
        "{{\"ts\":\"{ts}\",\"event\":\"stop\",\"agent\":\"{agent}\",\"output_tokens\":{output}}}\n"
    )
}

#[test]
fn replay_applies_new_lines_and_advances_cursor() {
    let mut fx = setup();
    append(
        &fx.events_path,
        &format!(
            "{}{}",
            stop_line("2026-02-18T10:00:00Z", "scout", 10),
            stop_line("2026-02-18T10:01:00Z", "builder", 20)
        ),
    );

    let (stats, applied) = reconcile(&mut fx.db, &fx.events_path).expect("reconcile");
    assert_eq!(stats.lines_seen, 2);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.skipped, 0);
    assert_eq!(applied.len(), 2);
    assert_eq!(fx.db.line_cursor().expect("cursor"), 2);

    let totals = fx.db.totals(RangeKey::All).expect("totals");
    assert_eq!(totals.total_invocations, 2);
    assert_eq!(totals.total_output_tokens, 30);
}

#[test]
fn replay_is_idempotent() {
    let mut fx = setup();
    append(&fx.events_path, &stop_line("2026-02-18T10:00:00Z", "scout", 10));

    reconcile(&mut fx.db, &fx.events_path).expect("first");
    let (stats, applied) = reconcile(&mut fx.db, &fx.events_path).expect("second");
    assert_eq!(stats.lines_seen, 0);
    assert_eq!(stats.applied, 0);
    assert!(applied.is_empty());

    let totals = fx.db.totals(RangeKey::All).expect("totals");
    assert_eq!(totals.total_invocations, 1);
}

#[test]
fn stale_cursor_replay_reaches_same_final_state() {
    let mut fx = setup();
    append(
        &fx.events_path,
        &format!(
            "{}{}",
            stop_line("2026-02-18T10:00:00Z", "scout", 10),
            stop_line("2026-02-18T10:01:00Z", "scout", 20)
        ),
    );
    reconcile(&mut fx.db, &fx.events_path).expect("first pass");

    // Simulate a crash that lost the cursor write but kept the events: a
    // fresh store replaying the whole file lands on the same aggregates.
    let dir = tempfile::tempdir().expect("temp dir");
    let mut fresh = Db::open(dir.path().join("fresh.sqlite")).expect("open");
    fresh.migrate().expect("migrate");
    reconcile(&mut fresh, &fx.events_path).expect("full replay");

    let a = fx.db.totals(RangeKey::All).expect("totals");
    let b = fresh.totals(RangeKey::All).expect("totals");
    assert_eq!(a, b);
}

#[test]
fn malformed_lines_are_skipped_but_counted() {
    let mut fx = setup();
    append(
        &fx.events_path,
        &format!(
            "not json\n{}{{\"event\":\"stop\"}}\n{}",
            stop_line("2026-02-18T10:00:00Z", "scout", 10),
            stop_line("2026-02-18T10:01:00Z", "builder", 20)
        ),
    );

    let (stats, applied) = reconcile(&mut fx.db, &fx.events_path).expect("reconcile");
    assert_eq!(stats.lines_seen, 4);
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.skipped, 2);
    assert_eq!(applied.len(), 2);
    // The cursor moves past bad lines so they are never re-parsed.
    assert_eq!(fx.db.line_cursor().expect("cursor"), 4);
}

#[test]
fn trailing_partial_line_waits_for_completion() {
    let mut fx = setup();
    append(&fx.events_path, &stop_line("2026-02-18T10:00:00Z", "scout", 10));
    append(
        &fx.events_path,
        "{\"ts\":\"2026-02-18T10:01:00Z\",\"event\":\"st",
    );

    let (stats, _) = reconcile(&mut fx.db, &fx.events_path).expect("first");
    assert_eq!(stats.lines_seen, 1);
    assert_eq!(fx.db.line_cursor().expect("cursor"), 1);

    append(&fx.events_path, "op\",\"agent\":\"builder\"}\n");
    let (stats, applied) = reconcile(&mut fx.db, &fx.events_path).expect("second");
    assert_eq!(stats.lines_seen, 1);
    assert_eq!(stats.applied, 1);
    assert_eq!(applied[0].agent, "builder");
}

#[test]
fn missing_file_is_an_empty_pass() {
    let mut fx = setup();
    let (stats, applied) = reconcile(&mut fx.db, &fx.events_path).expect("reconcile");
    assert_eq!(stats, arena_sync::SyncStats::default());
    assert!(applied.is_empty());
}

#[tokio::test]
async fn applied_events_broadcast_uniformly_across_sources() {
    let hub = arena_hub::Hub::new();
    let (_id, mut rx) = hub.connect().await;

    let stop: arena_core::Event = serde_json::from_str(
        "{\"ts\":\"2026-02-18T10:00:00Z\",\"event\":\"stop\",\"agent\":\"scout\"}",
    )
    .expect("parse stop");
    let skill: arena_core::Event = serde_json::from_str(
        "{\"ts\":\"2026-02-18T10:01:00Z\",\"event\":\"skill_invoke\",\"agent\":\"scout\",\"skill_name\":\"review\"}",
    )
    .expect("parse skill");

    arena_sync::broadcast_applied(&hub, &[stop, skill]).await;

    let kinds: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|message| {
            let value: serde_json::Value = serde_json::from_str(&message).expect("json");
            value["type"].as_str().expect("type").to_string()
        })
        .collect();
    // Every event goes out as `event`; named skill invocations also as
    // `skill_event`.
    assert_eq!(kinds, vec!["event", "event", "skill_event"]);
}

#[test]
fn backfill_restores_newest_context_snapshot() {
    let mut fx = setup();
    let lines = concat!(
        "{\"ts\":\"2026-02-18T09:00:00Z\",\"event\":\"stop\",\"agent\":\"orchestrator\",",
        "\"context_used\":10000,\"context_max\":200000,\"context_remaining\":190000,",
        "\"model_id\":\"model-a\"}\n",
        "{\"ts\":\"2026-02-18T10:00:00Z\",\"event\":\"stop\",\"agent\":\"scout\",",
        "\"context_used\":99,\"context_max\":200000}\n",
        "{\"ts\":\"2026-02-18T11:00:00Z\",\"event\":\"stop\",\"agent\":\"orchestrator\",",
        "\"context_used\":50000,\"context_max\":200000,\"context_remaining\":150000,",
        "\"model_id\":\"model-b\"}\n",
    );
    fs::write(&fx.events_path, lines).expect("write events");

    backfill_context_window(&mut fx.db, &fx.events_path).expect("backfill");

    let state = fx
        .db
        .context_window_state()
        .expect("state")
        .expect("window");
    assert_eq!(state.context_used, 50_000);
    assert_eq!(state.model_id, "model-b");
}

#[test]
fn backfill_keeps_an_existing_snapshot() {
    let mut fx = setup();
    fs::write(
        &fx.events_path,
        concat!(
            "{\"ts\":\"2026-02-18T09:00:00Z\",\"event\":\"stop\",\"agent\":\"orchestrator\",",
            "\"context_used\":10000,\"context_max\":200000,\"model_id\":\"model-old\"}\n",
        ),
    )
    .expect("write events");

    // A live snapshot already recorded through the insert path wins.
    let live = serde_json::from_str::<arena_core::Event>(concat!(
        "{\"ts\":\"2026-02-18T12:00:00Z\",\"event\":\"stop\",\"agent\":\"orchestrator\",",
        "\"context_used\":60000,\"context_max\":200000,\"model_id\":\"model-live\"}"
    ))
    .expect("parse");
    fx.db.insert_event(&live).expect("insert");

    backfill_context_window(&mut fx.db, &fx.events_path).expect("backfill");

    let state = fx
        .db
        .context_window_state()
        .expect("state")
        .expect("window");
    assert_eq!(state.model_id, "model-live");
}
