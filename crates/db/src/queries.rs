use std::str::FromStr;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use arena_core::{
    AgentLevelRow, AgentRollup, ContextBreakdown, ContextWindowState, DailyBudgetEntry, Event,
    EventKind, RangeKey, SkillHeatmap, Totals,
};

use crate::Db;
use crate::error::{DbError, Result};

impl Db {
    /// Per-agent stop-event aggregates within the range.
    pub fn agent_rollups(&self, range: RangeKey) -> Result<Vec<AgentRollup>> {
        let (start, end) = range.session_date_bounds(Utc::now());
        let mut stmt = self.conn.prepare(
            r#"
            SELECT agent,
                   COUNT(*),
                   COALESCE(SUM(input_tokens), 0),
                   COALESCE(SUM(output_tokens), 0),
                   COALESCE(SUM(cache_read), 0),
                   COALESCE(SUM(cache_create), 0),
                   COALESCE(AVG(duration_s), 0),
                   MAX(ts)
            FROM event
            WHERE kind = 'stop' AND session_date >= ?1 AND session_date <= ?2
            GROUP BY agent
            ORDER BY agent
            "#,
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(AgentRollup {
                agent: row.get(0)?,
                invocations: row.get::<_, i64>(1)? as u64,
                total_input_tokens: row.get::<_, i64>(2)? as u64,
                total_output_tokens: row.get::<_, i64>(3)? as u64,
                total_cache_read_tokens: row.get::<_, i64>(4)? as u64,
                total_cache_create_tokens: row.get::<_, i64>(5)? as u64,
                avg_duration_seconds: row.get(6)?,
                last_used: row.get(7)?,
            })
        })?;
        let mut rollups = Vec::new();
        for row in rows {
            rollups.push(row?);
        }
        Ok(rollups)
    }

    /// All-time cumulative level rows.
    pub fn agent_levels(&self) -> Result<Vec<AgentLevelRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT agent, total_invocations, level_name, level_tier, updated_at
            FROM agent_level
            ORDER BY agent
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AgentLevelRow {
                agent: row.get(0)?,
                total_invocations: row.get::<_, i64>(1)? as u64,
                level_name: row.get(2)?,
                level_tier: row.get::<_, i64>(3)? as u32,
                updated_at: row.get(4)?,
            })
        })?;
        let mut levels = Vec::new();
        for row in rows {
            levels.push(row?);
        }
        Ok(levels)
    }

    /// Agents with an open invocation: a start whose agent_id has no matching
    /// stop yet. Events without an agent_id cannot be paired and are excluded
    /// from liveness entirely.
    pub fn active_agents(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT s.agent FROM event s
            WHERE s.kind = 'start'
              AND s.agent_id != ''
              AND NOT EXISTS (
                SELECT 1 FROM event t
                WHERE t.kind = 'stop' AND t.agent = s.agent AND t.agent_id = s.agent_id
              )
            ORDER BY s.agent
            "#,
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    /// Fleet-wide stop-event totals within the range.
    pub fn totals(&self, range: RangeKey) -> Result<Totals> {
        let (start, end) = range.session_date_bounds(Utc::now());
        let totals = self.conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(input_tokens), 0),
                   COALESCE(SUM(output_tokens), 0),
                   COALESCE(SUM(cache_read) + SUM(cache_create), 0)
            FROM event
            WHERE kind = 'stop' AND session_date >= ?1 AND session_date <= ?2
            "#,
            params![start, end],
            |row| {
                Ok(Totals {
                    total_invocations: row.get::<_, i64>(0)? as u64,
                    total_input_tokens: row.get::<_, i64>(1)? as u64,
                    total_output_tokens: row.get::<_, i64>(2)? as u64,
                    total_cache_tokens: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(totals)
    }

    /// Newest-first events within the range, capped at `limit`.
    pub fn recent_events(&self, range: RangeKey, limit: u32) -> Result<Vec<Event>> {
        let (start, end) = range.session_date_bounds(Utc::now());
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ts, kind, agent, agent_id, raw_type, duration_s,
                   input_tokens, output_tokens, cache_read, cache_create
            FROM event
            WHERE session_date >= ?1 AND session_date <= ?2
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![start, end, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (
                ts,
                kind,
                agent,
                agent_id,
                raw_type,
                duration_s,
                input_tokens,
                output_tokens,
                cache_read,
                cache_create,
            ) = row?;
            let kind = EventKind::from_str(&kind).map_err(DbError::InvalidKind)?;
            events.push(Event {
                ts,
                kind,
                agent,
                skill_name: String::new(),
                agent_id,
                raw_type,
                duration_s,
                input_tokens: input_tokens as u64,
                output_tokens: output_tokens as u64,
                cache_read: cache_read as u64,
                cache_create: cache_create as u64,
                context_used: 0,
                context_max: 0,
                context_remaining: 0,
                model_id: String::new(),
                context_breakdown: None,
            });
        }
        Ok(events)
    }

    pub fn budget_for_date(&self, date: &str) -> Result<Option<DailyBudgetEntry>> {
        let entry = self
            .conn
            .query_row(
                r#"
                SELECT total_input_tokens, total_output_tokens,
                       total_cache_read, total_cache_create
                FROM daily_budget WHERE date = ?1
                "#,
                params![date],
                |row| {
                    Ok(DailyBudgetEntry {
                        total_input_tokens: row.get::<_, i64>(0)? as u64,
                        total_output_tokens: row.get::<_, i64>(1)? as u64,
                        total_cache_read: row.get::<_, i64>(2)? as u64,
                        total_cache_create: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Skill invocation counts within the range, plus the overall total.
    pub fn skill_heatmap(&self, range: RangeKey) -> Result<SkillHeatmap> {
        let (start, end) = range.session_date_bounds(Utc::now());
        let mut stmt = self.conn.prepare(
            r#"
            SELECT skill_name, COUNT(*)
            FROM skill_invocation
            WHERE session_date >= ?1 AND session_date <= ?2
            GROUP BY skill_name
            "#,
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut heatmap = SkillHeatmap::default();
        for row in rows {
            let (skill, count) = row?;
            heatmap.total += count;
            heatmap.skills.insert(skill, count);
        }
        Ok(heatmap)
    }

    /// The latest orchestrator context snapshot, if one was ever recorded.
    pub fn context_window_state(&self) -> Result<Option<ContextWindowState>> {
        let window = self
            .conn
            .query_row(
                r#"
                SELECT context_used, context_max, context_remaining, model_id
                FROM context_window WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(ContextWindowState {
                        context_used: row.get::<_, i64>(0)? as u64,
                        context_max: row.get::<_, i64>(1)? as u64,
                        context_remaining: row.get::<_, i64>(2)? as u64,
                        model_id: row.get(3)?,
                        breakdown: None,
                    })
                },
            )
            .optional()?;

        let Some(mut window) = window else {
            return Ok(None);
        };

        window.breakdown = self
            .conn
            .query_row(
                r#"
                SELECT system_prompt, system_tools, mcp_tools, custom_agents, rules,
                       project_doc, memory, skills, messages, autocompact_buffer, free_space
                FROM context_breakdown WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(ContextBreakdown {
                        system_prompt: row.get::<_, i64>(0)? as u64,
                        system_tools: row.get::<_, i64>(1)? as u64,
                        mcp_tools: row.get::<_, i64>(2)? as u64,
                        custom_agents: row.get::<_, i64>(3)? as u64,
                        rules: row.get::<_, i64>(4)? as u64,
                        project_doc: row.get::<_, i64>(5)? as u64,
                        memory: row.get::<_, i64>(6)? as u64,
                        skills: row.get::<_, i64>(7)? as u64,
                        messages: row.get::<_, i64>(8)? as u64,
                        autocompact_buffer: row.get::<_, i64>(9)? as u64,
                        free_space: row.get::<_, i64>(10)? as u64,
                    })
                },
            )
            .optional()?;

        Ok(Some(window))
    }
}
