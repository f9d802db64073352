//! Five-cycle polling loop against the brain.
//!
//! A single 5-second tick drives all cycles; each cycle fires when its own
//! interval has elapsed. Cycles are independent: one unavailable endpoint
//! skips its broadcast for the tick and never stalls the others.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info};

use arena_hub::Hub;

use crate::{BrainClient, BrainData, knowledge_stats};

const TICK: Duration = Duration::from_secs(5);

/// Most instances to expand with agents and log per cycle.
const INSTANCE_DETAIL_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cycle {
    Health,
    Instances,
    Projects,
    Events,
    Tasks,
}

impl Cycle {
    const ALL: [Cycle; 5] = [
        Cycle::Health,
        Cycle::Instances,
        Cycle::Projects,
        Cycle::Events,
        Cycle::Tasks,
    ];

    fn interval(&self) -> Duration {
        let secs = match self {
            Cycle::Health => 60,
            Cycle::Instances => 30,
            Cycle::Projects => 120,
            Cycle::Events => 15,
            Cycle::Tasks => 60,
        };
        Duration::from_secs(secs)
    }
}

/// Tracks when each cycle last ran. Every cycle is due on the first tick so
/// a fresh process populates the dashboard immediately.
#[derive(Default)]
pub struct PollScheduler {
    last_run: HashMap<Cycle, Instant>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn due(&mut self, now: Instant) -> Vec<Cycle> {
        let mut due = Vec::new();
        for cycle in Cycle::ALL {
            let ready = match self.last_run.get(&cycle) {
                Some(last) => now.duration_since(*last) >= cycle.interval(),
                None => true,
            };
            if ready {
                self.last_run.insert(cycle, now);
                due.push(cycle);
            }
        }
        due
    }
}

/// Runs the poll loop until the shutdown signal flips. With no brain
/// configured the loop broadcasts one offline sync status, then idles.
pub async fn poll_loop(
    client: Arc<BrainClient>,
    hub: Arc<Hub>,
    knowledge_db: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scheduler = PollScheduler::new();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    if !client.is_configured() {
        hub.broadcast("sync_status", client.sync_status(BrainData::Unavailable))
            .await;
        info!(event = "brain_disabled");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(event = "poll_shutdown");
                return;
            }
            _ = ticker.tick() => {}
        }
        if !client.is_configured() {
            continue;
        }
        for cycle in scheduler.due(Instant::now()) {
            match cycle {
                Cycle::Health => run_health(&client, &hub, knowledge_db.as_deref()).await,
                Cycle::Instances => run_instances(&client, &hub).await,
                Cycle::Projects => run_projects(&client, &hub).await,
                Cycle::Events => run_events(&client, &hub).await,
                Cycle::Tasks => run_tasks(&client, &hub).await,
            }
        }
    }
}

async fn run_health(client: &BrainClient, hub: &Hub, knowledge_db: Option<&std::path::Path>) {
    let health = client.get("/health", &[]).await.into_value();
    let stats = client.get("/api/brain-stats", &[]).await.into_value();
    if let Some(merged) = merge_health(health, stats) {
        hub.broadcast("brain_health", merged).await;
    }

    let upstream = client.get("/api/sync-status", &[]).await;
    hub.broadcast("sync_status", client.sync_status(upstream)).await;

    if let Some(path) = knowledge_db {
        hub.broadcast("brain_knowledge", knowledge_stats(path)).await;
    }
}

/// Flattens the health and stats documents into one; present as long as at
/// least one endpoint answered.
fn merge_health(health: Option<Value>, stats: Option<Value>) -> Option<Value> {
    if health.is_none() && stats.is_none() {
        return None;
    }
    let mut merged = serde_json::Map::new();
    if let Some(Value::Object(fields)) = health {
        merged.extend(fields);
    }
    if let Some(Value::Object(fields)) = stats {
        merged.extend(fields);
    }
    Some(Value::Object(merged))
}

/// Only instances actively working a brief are worth the extra requests.
fn wants_detail(instance: &Value) -> bool {
    instance["status"] == "active"
        && !instance["current_brief"]
            .as_str()
            .unwrap_or_default()
            .is_empty()
}

async fn run_instances(client: &BrainClient, hub: &Hub) {
    let listing = client
        .get("/api/instances", &[("include_stale", "false".to_string())])
        .await;
    let BrainData::Available(payload) = listing else {
        return;
    };
    hub.broadcast("brain_instances", payload.clone()).await;

    let instances = payload["instances"].as_array().cloned().unwrap_or_default();
    let active = instances
        .iter()
        .filter(|instance| wants_detail(instance))
        .take(INSTANCE_DETAIL_LIMIT);

    for instance in active {
        let Some(id) = instance["id"].as_str() else {
            continue;
        };
        let agents = client
            .get(&format!("/api/instances/{id}/agents"), &[])
            .await
            .into_value();
        let log = client
            .get(
                &format!("/api/instances/{id}/log"),
                &[("limit", "20".to_string())],
            )
            .await
            .into_value();
        if agents.is_none() && log.is_none() {
            continue;
        }
        hub.broadcast(
            "instance_agent_event",
            json!({
                "instance_id": id,
                "brief": instance["current_brief"],
                "agents": agents,
                "log": log,
            }),
        )
        .await;
    }
}

async fn run_projects(client: &BrainClient, hub: &Hub) {
    if let BrainData::Available(projects) = client.get("/api/projects", &[]).await {
        hub.broadcast("brain_projects", projects).await;
    }
    if let BrainData::Available(briefs) = client.get("/api/briefs", &[]).await {
        hub.broadcast("brain_briefs", briefs).await;
    }
    if let BrainData::Available(sessions) = client
        .get("/api/sessions", &[("days", "7".to_string())])
        .await
    {
        hub.broadcast("brain_sessions", sessions).await;
    }
}

async fn run_events(client: &BrainClient, hub: &Hub) {
    if let BrainData::Available(events) = client
        .get("/api/events", &[("limit", "50".to_string())])
        .await
    {
        hub.broadcast("brain_events", events).await;
    }
}

async fn run_tasks(client: &BrainClient, hub: &Hub) {
    if let BrainData::Available(tasks) = client
        .get("/api/tasks", &[("limit", "100".to_string())])
        .await
    {
        hub.broadcast("brain_tasks", tasks).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cycle_is_due_on_first_tick() {
        let mut scheduler = PollScheduler::new();
        let due = scheduler.due(Instant::now());
        assert_eq!(due.len(), Cycle::ALL.len());
    }

    #[test]
    fn cycles_respect_their_intervals() {
        let mut scheduler = PollScheduler::new();
        let start = Instant::now();
        scheduler.due(start);

        // 20s later only the 15s cycle has come due again.
        let due = scheduler.due(start + Duration::from_secs(20));
        assert!(due.contains(&Cycle::Events));
        assert!(!due.contains(&Cycle::Health));
        assert!(!due.contains(&Cycle::Instances));

        // 35s after start the 30s cycle fires; events fired 15s ago at t=20.
        let due = scheduler.due(start + Duration::from_secs(35));
        assert!(due.contains(&Cycle::Instances));
        assert!(due.contains(&Cycle::Events));
        assert!(!due.contains(&Cycle::Projects));

        let due = scheduler.due(start + Duration::from_secs(125));
        assert!(due.contains(&Cycle::Projects));
        assert!(due.contains(&Cycle::Health));
        assert!(due.contains(&Cycle::Tasks));
    }

    #[test]
    fn health_and_stats_merge_flat_when_either_answers() {
        let merged = merge_health(
            Some(json!({"status": "ok", "uptime_s": 12})),
            Some(json!({"briefs": 4})),
        )
        .expect("merged");
        assert_eq!(merged["status"], "ok");
        assert_eq!(merged["uptime_s"], 12);
        assert_eq!(merged["briefs"], 4);

        // One side down still produces a broadcastable document.
        let merged = merge_health(None, Some(json!({"briefs": 4}))).expect("stats only");
        assert_eq!(merged["briefs"], 4);
        let merged = merge_health(Some(json!({"status": "ok"})), None).expect("health only");
        assert_eq!(merged["status"], "ok");

        assert!(merge_health(None, None).is_none());
    }

    #[test]
    fn detail_fetches_require_an_active_instance_with_a_brief() {
        assert!(wants_detail(&json!({
            "status": "active", "current_brief": "ship-it"
        })));
        assert!(!wants_detail(&json!({
            "status": "stale", "current_brief": "ship-it"
        })));
        assert!(!wants_detail(&json!({
            "status": "active", "current_brief": ""
        })));
        assert!(!wants_detail(&json!({ "status": "active" })));
    }

    #[test]
    fn firing_resets_the_cycle_clock() {
        let mut scheduler = PollScheduler::new();
        let start = Instant::now();
        scheduler.due(start);
        scheduler.due(start + Duration::from_secs(15));

        // Only 14s since the events cycle last fired.
        let due = scheduler.due(start + Duration::from_secs(29));
        assert!(!due.contains(&Cycle::Events));
    }
}
