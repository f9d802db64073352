use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use arena_brain::BrainClient;
use arena_core::{AgentSummary, RangeKey, fleet_maxima, level_for, rpg_stats_for};
use arena_db::Db;
use arena_hub::Hub;

use crate::config::{BudgetConfig, RosterEntry};

/// Shared handler state. The database is opened per request; everything else
/// is immutable after startup.
#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub roster: Arc<BTreeMap<String, RosterEntry>>,
    pub budget: BudgetConfig,
    pub hub: Arc<Hub>,
    pub brain: Arc<BrainClient>,
}

/// Merges the static roster with range-filtered rollups, all-time levels,
/// liveness, and derived RPG stats into the per-agent view.
pub fn build_agents_state(
    db: &Db,
    state: &AppState,
    range: RangeKey,
) -> arena_db::Result<BTreeMap<String, AgentSummary>> {
    let mut agents: BTreeMap<String, AgentSummary> = state
        .roster
        .iter()
        .map(|(name, entry)| {
            (
                name.clone(),
                AgentSummary {
                    success_rate: entry.success_rate,
                    ..AgentSummary::default()
                },
            )
        })
        .collect();

    for rollup in db.agent_rollups(range)? {
        let summary = agents.entry(rollup.agent.clone()).or_default();
        summary.invocations = rollup.invocations;
        summary.total_input_tokens = rollup.total_input_tokens;
        summary.total_output_tokens = rollup.total_output_tokens;
        summary.total_cache_read_tokens = rollup.total_cache_read_tokens;
        summary.total_cache_create_tokens = rollup.total_cache_create_tokens;
        summary.avg_duration_seconds = rollup.avg_duration_seconds;
        summary.last_used = rollup.last_used;
    }

    // Levels track all-time counts regardless of the requested range.
    for level in db.agent_levels()? {
        let summary = agents.entry(level.agent.clone()).or_default();
        summary.level = Some(level_for(level.total_invocations));
    }

    for agent in db.active_agents()? {
        agents.entry(agent).or_default().active = true;
    }

    let (max_output, max_duration) = fleet_maxima(&agents);
    for summary in agents.values_mut() {
        if summary.level.is_none() {
            summary.level = Some(level_for(0));
        }
        summary.rpg_stats = Some(rpg_stats_for(summary, max_output, max_duration));
    }
    Ok(agents)
}

/// Today's consumption against the configured ceiling.
pub fn build_budget_state(db: &Db, budget: &BudgetConfig) -> arena_db::Result<Value> {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let entry = db.budget_for_date(&today)?.unwrap_or_default();
    let consumed = entry.consumed();
    Ok(json!({
        "date": today,
        "consumed": consumed,
        "ceiling": budget.daily_token_budget,
        "ratio": consumed as f64 / budget.daily_token_budget.max(1) as f64,
        "warning_threshold": budget.warning_threshold,
        "critical_threshold": budget.critical_threshold,
        "status": budget.status_for(consumed),
        "breakdown": entry,
    }))
}

/// The full dashboard snapshot: what a WebSocket subscriber receives on
/// connect and what `/api/state` serves.
pub fn build_state(db: &Db, state: &AppState, range: RangeKey) -> arena_db::Result<Value> {
    Ok(json!({
        "range": range.as_str(),
        "agents": build_agents_state(db, state, range)?,
        "budget": build_budget_state(db, &state.budget)?,
        "totals": db.totals(range)?,
        "recent_events": db.recent_events(range, 50)?,
        "context_window": db.context_window_state()?,
        "skill_heatmap": db.skill_heatmap(range)?,
    }))
}
