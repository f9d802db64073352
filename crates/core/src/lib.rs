use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Agent name whose `stop` events carry context-window telemetry.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Stop,
    SkillInvoke,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::SkillInvoke => "skill_invoke",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "start" => Ok(EventKind::Start),
            "stop" => Ok(EventKind::Stop),
            "skill_invoke" => Ok(EventKind::SkillInvoke),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// One lifecycle event as emitted by the agent hook, either over the push
/// endpoint or as a line of the append-only events file. Identity for
/// deduplication is (ts, agent, kind, input_tokens, output_tokens,
/// cache_read, cache_create); `agent_id` and `raw_type` are carried but not
/// part of the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: String,
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub agent: String,
    #[serde(default)]
    pub skill_name: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub raw_type: String,
    #[serde(default)]
    pub duration_s: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_create: u64,
    #[serde(default)]
    pub context_used: u64,
    #[serde(default)]
    pub context_max: u64,
    #[serde(default)]
    pub context_remaining: u64,
    #[serde(default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_breakdown: Option<ContextBreakdown>,
}

impl Event {
    /// Calendar date (UTC) the event's aggregate effects are attributed to.
    pub fn session_date(&self) -> String {
        session_date_of(&self.ts)
    }

    /// True when this orchestrator stop carries usable context telemetry.
    pub fn carries_context(&self) -> bool {
        self.kind == EventKind::Stop && self.agent == ORCHESTRATOR_AGENT && self.context_max > 0
    }
}

/// First 10 chars of the ISO-8601 timestamp, falling back to the current UTC
/// date for timestamps too short to contain one.
pub fn session_date_of(ts: &str) -> String {
    match ts.get(..10) {
        Some(date) => date.to_string(),
        None => Utc::now().format("%Y-%m-%d").to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBreakdown {
    #[serde(default)]
    pub system_prompt: u64,
    #[serde(default)]
    pub system_tools: u64,
    #[serde(default)]
    pub mcp_tools: u64,
    #[serde(default)]
    pub custom_agents: u64,
    #[serde(default)]
    pub rules: u64,
    #[serde(default)]
    pub project_doc: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub skills: u64,
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub autocompact_buffer: u64,
    #[serde(default)]
    pub free_space: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextWindowState {
    pub context_used: u64,
    pub context_max: u64,
    pub context_remaining: u64,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ContextBreakdown>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBudgetEntry {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read: u64,
    pub total_cache_create: u64,
}

impl DailyBudgetEntry {
    pub fn consumed(&self) -> u64 {
        self.total_input_tokens
            + self.total_output_tokens
            + self.total_cache_read
            + self.total_cache_create
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_invocations: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillHeatmap {
    pub skills: BTreeMap<String, u64>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLevelRow {
    pub agent: String,
    pub total_invocations: u64,
    pub level_name: String,
    pub level_tier: u32,
    pub updated_at: String,
}

/// Per-agent stop-event aggregates over a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRollup {
    pub agent: String,
    pub invocations: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_create_tokens: u64,
    pub avg_duration_seconds: f64,
    pub last_used: Option<String>,
}

/// The merged per-agent view served to subscribers: range-filtered stats,
/// all-time level, liveness, and derived RPG stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub invocations: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_create_tokens: u64,
    pub avg_duration_seconds: f64,
    pub success_rate: f64,
    pub last_used: Option<String>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LevelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpg_stats: Option<RpgStats>,
}

impl Default for AgentSummary {
    fn default() -> Self {
        Self {
            invocations: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cache_read_tokens: 0,
            total_cache_create_tokens: 0,
            avg_duration_seconds: 0.0,
            success_rate: 1.0,
            last_used: None,
            active: false,
            level: None,
            rpg_stats: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Date range filtering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeKey {
    #[default]
    Today,
    Week,
    All,
}

impl RangeKey {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "today" => Some(RangeKey::Today),
            "week" => Some(RangeKey::Week),
            "all" => Some(RangeKey::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeKey::Today => "today",
            RangeKey::Week => "week",
            RangeKey::All => "all",
        }
    }

    /// Inclusive session-date bounds for SQL filtering. `Week` starts on
    /// Monday 00:00 UTC of the current week.
    pub fn session_date_bounds(&self, now: DateTime<Utc>) -> (String, String) {
        let today = now.format("%Y-%m-%d").to_string();
        match self {
            RangeKey::Today => (today.clone(), today),
            RangeKey::Week => {
                let monday =
                    now.date_naive() - Duration::days(now.weekday().num_days_from_monday() as i64);
                (monday.format("%Y-%m-%d").to_string(), "9999-12-31".to_string())
            }
            RangeKey::All => ("0000-01-01".to_string(), "9999-12-31".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Leveling engine
// ---------------------------------------------------------------------------

pub const LEVEL_THRESHOLDS: &[(u64, &str, u32)] = &[
    (0, "Trainee", 0),
    (5, "Novice", 1),
    (15, "Adept", 2),
    (30, "Expert", 3),
    (50, "Master", 4),
    (100, "Legend", 5),
    (200, "Mythic", 6),
];

const EVOLUTION_STAGES: &[&str] = &[
    "In-Training",
    "In-Training",
    "Rookie",
    "Champion",
    "Ultimate",
    "Mega",
    "Mega",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub name: String,
    pub tier: u32,
    pub evolution: String,
    pub next_at: u64,
    pub progress: f64,
}

/// Maps a cumulative invocation count onto the fixed level table. The level
/// is the highest threshold not exceeding the count; progress toward the next
/// threshold is clamped to 1.0 at the top of the table and rounded to three
/// decimals.
pub fn level_for(invocations: u64) -> LevelInfo {
    let mut name = LEVEL_THRESHOLDS[0].1;
    let mut tier = LEVEL_THRESHOLDS[0].2;
    let mut current_threshold = LEVEL_THRESHOLDS[0].0;
    for (threshold, level_name, level_tier) in LEVEL_THRESHOLDS {
        if invocations >= *threshold {
            name = level_name;
            tier = *level_tier;
            current_threshold = *threshold;
        }
    }

    let next_threshold = LEVEL_THRESHOLDS
        .iter()
        .map(|(threshold, _, _)| *threshold)
        .find(|threshold| *threshold > invocations);

    let progress = match next_threshold {
        Some(next) => {
            let span = next - current_threshold;
            if span > 0 {
                (invocations - current_threshold) as f64 / span as f64
            } else {
                1.0
            }
        }
        None => 1.0,
    };

    let evolution = EVOLUTION_STAGES
        .get(tier as usize)
        .copied()
        .unwrap_or("In-Training");

    LevelInfo {
        name: name.to_string(),
        tier,
        evolution: evolution.to_string(),
        next_at: next_threshold.unwrap_or(current_threshold),
        progress: (progress * 1000.0).round() / 1000.0,
    }
}

// ---------------------------------------------------------------------------
// RPG stat derivation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpgStats {
    #[serde(rename = "STR")]
    pub strength: i64,
    #[serde(rename = "INT")]
    pub intellect: i64,
    #[serde(rename = "SPD")]
    pub speed: i64,
    #[serde(rename = "VIT")]
    pub vitality: i64,
}

/// Largest output-token total and slowest average duration across the fleet,
/// both floored at 1 so stat normalization never divides by zero.
pub fn fleet_maxima(agents: &BTreeMap<String, AgentSummary>) -> (u64, f64) {
    let max_output = agents
        .values()
        .map(|agent| agent.total_output_tokens)
        .max()
        .unwrap_or(1)
        .max(1);
    let max_duration = agents
        .values()
        .map(|agent| agent.avg_duration_seconds)
        .fold(0.0_f64, f64::max);
    (max_output, if max_duration > 0.0 { max_duration } else { 1.0 })
}

/// STR/INT/SPD/VIT derived from real aggregates. Normalization is relative to
/// the query-time fleet maxima, so values shift as new agents and data arrive.
pub fn rpg_stats_for(agent: &AgentSummary, max_output: u64, max_duration: f64) -> RpgStats {
    let strength = (agent.total_output_tokens as f64 / max_output as f64 * 100.0).round() as i64;

    let cache_denominator = agent.total_input_tokens
        + agent.total_cache_read_tokens
        + agent.total_cache_create_tokens;
    let intellect = if cache_denominator > 0 {
        (agent.total_cache_read_tokens as f64 / cache_denominator as f64 * 100.0).round() as i64
    } else {
        0
    };

    let duration_pct = (agent.avg_duration_seconds / max_duration * 100.0).min(100.0);
    let speed = (100.0 - duration_pct).round() as i64;

    let vitality = (agent.success_rate * 100.0).round() as i64;

    RpgStats {
        strength,
        intellect,
        speed,
        vitality,
    }
}
