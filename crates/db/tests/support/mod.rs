#![allow(dead_code)]

use std::path::PathBuf;

use arena_core::{ContextBreakdown, Event, EventKind};
use arena_db::Db;
use chrono::Utc;
use tempfile::TempDir;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
    pub path: PathBuf,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.sqlite");
    let mut db = Db::open(&path).expect("open db");
    db.migrate().expect("migrate db");
    TestDb {
        _dir: dir,
        db,
        path,
    }
}

/// Timestamp on today's UTC date, so range=today queries see the event.
pub fn ts_today(suffix: &str) -> String {
    format!("{}T{suffix}Z", Utc::now().format("%Y-%m-%d"))
}

pub fn make_event(kind: EventKind, ts: &str, agent: &str) -> Event {
    Event {
        ts: ts.to_string(),
        kind,
        agent: agent.to_string(),
        skill_name: String::new(),
        agent_id: String::new(),
        raw_type: String::new(),
        duration_s: 0.0,
        input_tokens: 0,
        output_tokens: 0,
        cache_read: 0,
        cache_create: 0,
        context_used: 0,
        context_max: 0,
        context_remaining: 0,
        model_id: String::new(),
        context_breakdown: None,
    }
}

pub fn make_stop_event(ts: &str, agent: &str, input: u64, output: u64) -> Event {
    Event {
        input_tokens: input,
        output_tokens: output,
        duration_s: 2.5,
        ..make_event(EventKind::Stop, ts, agent)
    }
}

pub fn make_skill_event(ts: &str, skill: &str) -> Event {
    Event {
        skill_name: skill.to_string(),
        ..make_event(EventKind::SkillInvoke, ts, "scout")
    }
}

pub fn make_context_stop(ts: &str, agent: &str, used: u64, max: u64) -> Event {
    Event {
        context_used: used,
        context_max: max,
        context_remaining: max.saturating_sub(used),
        model_id: "model-x".to_string(),
        context_breakdown: Some(ContextBreakdown {
            system_prompt: 100,
            messages: used.saturating_sub(100),
            ..ContextBreakdown::default()
        }),
        ..make_event(EventKind::Stop, ts, agent)
    }
}
