use chrono::Utc;
use rusqlite::{OptionalExtension, Transaction, params};

use arena_core::{Event, EventKind, level_for};

use crate::Db;
use crate::error::Result;

/// Result of an insert attempt against the dedup identity
/// (ts, agent, kind, input, output, cache_read, cache_create).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New event; all aggregate effects were applied in the same transaction.
    Applied,
    /// Identity already present; nothing was touched.
    Duplicate,
}

impl InsertOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, InsertOutcome::Applied)
    }
}

impl Db {
    /// Inserts one event and applies its aggregate effects as a single
    /// transaction. Duplicate identities are a silent no-op so replays from
    /// the events file cannot double-count.
    pub fn insert_event(&mut self, event: &Event) -> Result<InsertOutcome> {
        let session_date = event.session_date();
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let rows = tx.execute(
            r#"
            INSERT OR IGNORE INTO event (
              ts, kind, agent, agent_id, raw_type, duration_s,
              input_tokens, output_tokens, cache_read, cache_create, session_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                event.ts,
                event.kind.as_str(),
                event.agent,
                event.agent_id,
                event.raw_type,
                event.duration_s,
                event.input_tokens as i64,
                event.output_tokens as i64,
                event.cache_read as i64,
                event.cache_create as i64,
                session_date,
            ],
        )?;
        if rows == 0 {
            tx.commit()?;
            return Ok(InsertOutcome::Duplicate);
        }

        match event.kind {
            EventKind::Stop => {
                apply_budget(&tx, &session_date, event)?;
                apply_level(&tx, &event.agent, &now)?;
                if event.carries_context() {
                    write_context_window(&tx, event, &now)?;
                }
            }
            EventKind::SkillInvoke => {
                if !event.skill_name.is_empty() {
                    tx.execute(
                        r#"
                        INSERT OR IGNORE INTO skill_invocation (ts, skill_name, session_date)
                        VALUES (?1, ?2, ?3)
                        "#,
                        params![event.ts, event.skill_name, session_date],
                    )?;
                }
            }
            EventKind::Start => {}
        }

        tx.commit()?;
        Ok(InsertOutcome::Applied)
    }

    /// Seeds one agent's level row from the bootstrap metrics snapshot.
    /// Take-if-absent: a count already tracked at runtime is never reset.
    pub fn seed_agent_level(&mut self, agent: &str, invocations: u64) -> Result<()> {
        let level = level_for(invocations);
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO agent_level
              (agent, total_invocations, level_name, level_tier, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![agent, invocations as i64, level.name, level.tier, now],
        )?;
        Ok(())
    }

    /// Replaces the context-window singleton (and its breakdown, when the
    /// event carries one) from an orchestrator stop event. Used by the
    /// insert path and by the one-time file backfill.
    pub fn replace_context_window(&mut self, event: &Event) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        write_context_window(&tx, event, &now)?;
        tx.commit()?;
        Ok(())
    }

    /// Count of event-file lines already replayed into the store.
    pub fn line_cursor(&self) -> Result<u64> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = 'events_line_count'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|value| value.parse().ok()).unwrap_or(0))
    }

    /// Advances the line cursor. Never moves backwards: the cursor counts
    /// lines already applied, and replaying them again is a no-op anyway.
    pub fn set_line_cursor(&mut self, lines: u64) -> Result<()> {
        let current = self.line_cursor()?;
        let next = lines.max(current);
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES ('events_line_count', ?1)",
            params![next.to_string()],
        )?;
        Ok(())
    }
}

fn apply_budget(tx: &Transaction<'_>, session_date: &str, event: &Event) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO daily_budget
          (date, total_input_tokens, total_output_tokens, total_cache_read, total_cache_create)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(date) DO UPDATE SET
          total_input_tokens = total_input_tokens + excluded.total_input_tokens,
          total_output_tokens = total_output_tokens + excluded.total_output_tokens,
          total_cache_read = total_cache_read + excluded.total_cache_read,
          total_cache_create = total_cache_create + excluded.total_cache_create
        "#,
        params![
            session_date,
            event.input_tokens as i64,
            event.output_tokens as i64,
            event.cache_read as i64,
            event.cache_create as i64,
        ],
    )?;
    Ok(())
}

fn apply_level(tx: &Transaction<'_>, agent: &str, now: &str) -> Result<()> {
    let current: Option<i64> = tx
        .query_row(
            "SELECT total_invocations FROM agent_level WHERE agent = ?1",
            params![agent],
            |row| row.get(0),
        )
        .optional()?;
    let new_count = current.unwrap_or(0) as u64 + 1;
    let level = level_for(new_count);
    tx.execute(
        r#"
        INSERT OR REPLACE INTO agent_level
          (agent, total_invocations, level_name, level_tier, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![agent, new_count as i64, level.name, level.tier, now],
    )?;
    Ok(())
}

fn write_context_window(tx: &Transaction<'_>, event: &Event, now: &str) -> Result<()> {
    tx.execute(
        r#"
        INSERT OR REPLACE INTO context_window
          (id, context_used, context_max, context_remaining, model_id, updated_at)
        VALUES (1, ?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            event.context_used as i64,
            event.context_max as i64,
            event.context_remaining as i64,
            event.model_id,
            now,
        ],
    )?;
    if let Some(breakdown) = &event.context_breakdown {
        tx.execute(
            r#"
            INSERT OR REPLACE INTO context_breakdown
              (id, system_prompt, system_tools, mcp_tools, custom_agents, rules,
               project_doc, memory, skills, messages, autocompact_buffer, free_space,
               updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                breakdown.system_prompt as i64,
                breakdown.system_tools as i64,
                breakdown.mcp_tools as i64,
                breakdown.custom_agents as i64,
                breakdown.rules as i64,
                breakdown.project_doc as i64,
                breakdown.memory as i64,
                breakdown.skills as i64,
                breakdown.messages as i64,
                breakdown.autocompact_buffer as i64,
                breakdown.free_space as i64,
                now,
            ],
        )?;
    }
    Ok(())
}
