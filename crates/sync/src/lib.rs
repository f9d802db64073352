//! Reconciles the append-only events file into the store.
//!
//! The events file is the durable source of truth written by the agent hook.
//! The store keeps a line cursor (count of file lines already applied) so a
//! replay after restart or crash picks up exactly where it left off; the
//! dedup identity in the store makes overlapping replays harmless.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use arena_core::{Event, EventKind};
use arena_db::Db;
use arena_hub::Hub;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("events file error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] arena_db::DbError),
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Counters from one reconcile pass, for logging and the sync-status report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Complete lines examined this pass.
    pub lines_seen: u64,
    /// Events newly applied to the store.
    pub applied: u64,
    /// Lines that were malformed or duplicates of stored events.
    pub skipped: u64,
}

/// Fallback rescan cadence when no file notification arrives.
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Replays events-file lines past the stored cursor. Returns the pass
/// counters and the newly applied events, in file order, for broadcasting.
///
/// Only complete lines (terminated by a newline) are processed; a trailing
/// partial line is left for the next pass so a half-written record is never
/// parsed or skipped past. Malformed complete lines are counted and skipped,
/// and the cursor advances over them.
pub fn reconcile(db: &mut Db, events_path: &Path) -> Result<(SyncStats, Vec<Event>)> {
    let content = match fs::read_to_string(events_path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok((SyncStats::default(), Vec::new()));
        }
        Err(err) => return Err(err.into()),
    };

    let complete = match content.rfind('\n') {
        Some(pos) => &content[..=pos],
        None => return Ok((SyncStats::default(), Vec::new())),
    };

    let cursor = db.line_cursor()?;
    let mut stats = SyncStats::default();
    let mut applied = Vec::new();

    for line in complete.lines().skip(cursor as usize) {
        stats.lines_seen += 1;
        let line = line.trim();
        if line.is_empty() {
            stats.skipped += 1;
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => {
                if db.insert_event(&event)?.is_applied() {
                    stats.applied += 1;
                    applied.push(event);
                } else {
                    stats.skipped += 1;
                }
            }
            Err(err) => {
                warn!(event = "sync_bad_line", error = %err);
                stats.skipped += 1;
            }
        }
    }

    db.set_line_cursor(cursor + stats.lines_seen)?;
    if stats.applied > 0 {
        info!(
            event = "sync_pass",
            applied = stats.applied,
            skipped = stats.skipped
        );
    }
    Ok((stats, applied))
}

/// One-time startup repair: if the store has no context-window snapshot,
/// scan the events file backwards for the newest event carrying context
/// telemetry and restore the singleton from it.
pub fn backfill_context_window(db: &mut Db, events_path: &Path) -> Result<()> {
    if db.context_window_state()?.is_some() {
        return Ok(());
    }
    let content = match fs::read_to_string(events_path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let Some(complete) = content.rfind('\n').map(|pos| &content[..=pos]) else {
        return Ok(());
    };

    for line in complete.lines().rev() {
        let Ok(event) = serde_json::from_str::<Event>(line.trim()) else {
            continue;
        };
        if event.carries_context() {
            db.replace_context_window(&event)?;
            info!(event = "context_backfill", ts = %event.ts);
            return Ok(());
        }
    }
    Ok(())
}

/// Watches the events file and reconciles on change, with a periodic rescan
/// as a safety net. Runs until the shutdown signal flips.
pub async fn watch_loop(
    db_path: PathBuf,
    events_path: PathBuf,
    hub: Arc<Hub>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (notify_tx, mut notify_rx) = mpsc::channel::<()>(8);
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = notify_tx.blocking_send(());
        }
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(event = "watch_setup_failed", error = %err);
            return;
        }
    };

    // Watch the parent directory: the events file may not exist yet, and
    // some editors replace files wholesale.
    let watch_target = events_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| events_path.clone());
    if let Err(err) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
        warn!(event = "watch_failed", path = %watch_target.display(), error = %err);
    }

    let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
    rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(event = "watch_shutdown");
                return;
            }
            notification = notify_rx.recv() => {
                if notification.is_none() {
                    return;
                }
                // Coalesce bursts of notifications into one pass.
                while notify_rx.try_recv().is_ok() {}
                run_pass(&db_path, &events_path, &hub).await;
            }
            _ = rescan.tick() => {
                run_pass(&db_path, &events_path, &hub).await;
            }
        }
    }
}

async fn run_pass(db_path: &Path, events_path: &Path, hub: &Hub) {
    let db_path = db_path.to_path_buf();
    let events_path = events_path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> Result<(SyncStats, Vec<Event>)> {
        let mut db = Db::open(&db_path)?;
        reconcile(&mut db, &events_path)
    })
    .await;

    let applied = match result {
        Ok(Ok((_stats, applied))) => applied,
        Ok(Err(err)) => {
            warn!(event = "sync_pass_failed", error = %err);
            return;
        }
        Err(err) => {
            warn!(event = "sync_task_panicked", error = %err);
            return;
        }
    };

    broadcast_applied(hub, &applied).await;
}

/// Publishes newly applied events to subscribers. Both ingestion paths (the
/// push endpoint and the file watcher) use this, so an event reaches viewers
/// the same way no matter how it arrived: every event as `event`, and skill
/// invocations with a name additionally as `skill_event`.
pub async fn broadcast_applied(hub: &Hub, events: &[Event]) {
    for event in events {
        let Ok(payload) = serde_json::to_value(event) else {
            continue;
        };
        hub.broadcast("event", payload.clone()).await;
        if event.kind == EventKind::SkillInvoke && !event.skill_name.is_empty() {
            hub.broadcast("skill_event", payload).await;
        }
    }
}
