//! Client for the optional upstream "brain" service.
//!
//! The brain is a remote coordination service the dashboard mirrors read-only
//! views from. It may be absent, unreachable, or misconfigured at any time;
//! every fetch collapses those cases into [`BrainData::Unavailable`] so
//! callers render an offline placeholder instead of erroring.

mod poller;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

pub use poller::{PollScheduler, Cycle, poll_loop};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BrainError {
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrainConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    remote_brain: Option<BrainConfig>,
}

impl BrainConfig {
    /// Loads from the JSON config file, then lets BRAIN_URL / BRAIN_API_KEY
    /// environment variables override. Returns None when no URL is
    /// configured anywhere.
    pub fn load(config_path: &Path) -> Option<Self> {
        let mut config = std::fs::read_to_string(config_path)
            .ok()
            .and_then(|content| serde_json::from_str::<ConfigFile>(&content).ok())
            .and_then(|file| file.remote_brain);

        if let Ok(url) = std::env::var("BRAIN_URL") {
            if !url.is_empty() {
                let api_key = config.as_ref().and_then(|c| c.api_key.clone());
                config = Some(BrainConfig { url, api_key });
            }
        }
        if let Ok(key) = std::env::var("BRAIN_API_KEY") {
            if let Some(config) = config.as_mut() {
                if !key.is_empty() {
                    config.api_key = Some(key);
                }
            }
        }
        config.filter(|c| !c.url.is_empty())
    }
}

/// Outcome of one upstream fetch. Absence of the brain is a normal state,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum BrainData {
    Available(Value),
    Unavailable,
}

impl BrainData {
    pub fn into_value(self) -> Option<Value> {
        match self {
            BrainData::Available(value) => Some(value),
            BrainData::Unavailable => None,
        }
    }
}

pub struct BrainClient {
    http: reqwest::Client,
    config: Option<BrainConfig>,
}

impl BrainClient {
    pub fn new(config: Option<BrainConfig>) -> Result<Self, BrainError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.url.as_str())
    }

    /// Fetches a JSON document from the brain. `path` must be an absolute
    /// path on the brain's API; traversal segments are rejected outright.
    pub async fn get(&self, path: &str, params: &[(&str, String)]) -> BrainData {
        let Some(config) = &self.config else {
            return BrainData::Unavailable;
        };
        if !path.starts_with('/') || path.contains("..") {
            warn!(event = "brain_bad_path", path);
            return BrainData::Unavailable;
        }

        let url = format!("{}{}", config.url.trim_end_matches('/'), path);
        let mut request = self.http.get(&url).query(params);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(event = "brain_unreachable", path, error = %err);
                return BrainData::Unavailable;
            }
        };
        if !response.status().is_success() {
            warn!(event = "brain_bad_status", path, status = %response.status());
            return BrainData::Unavailable;
        }
        match response.json::<Value>().await {
            Ok(value) => BrainData::Available(value),
            Err(err) => {
                warn!(event = "brain_bad_body", path, error = %err);
                BrainData::Unavailable
            }
        }
    }

    /// The sync-status envelope broadcast to subscribers and served over the
    /// status endpoint: the upstream report wrapped with an online/offline
    /// verdict.
    pub fn sync_status(&self, upstream: BrainData) -> Value {
        match upstream {
            BrainData::Available(report) => json!({
                "status": "online",
                "configured": self.is_configured(),
                "url": self.url(),
                "upstream": report,
            }),
            BrainData::Unavailable => json!({
                "status": "offline",
                "configured": self.is_configured(),
                "url": self.url(),
            }),
        }
    }
}

/// Summarizes the local knowledge store for the dashboard. Any failure
/// (missing file, foreign schema) yields `{"available": false}` so the
/// panel degrades instead of the poll cycle failing.
pub fn knowledge_stats(db_path: &Path) -> Value {
    match read_knowledge(db_path) {
        Ok(stats) => stats,
        Err(err) => {
            debug!(event = "knowledge_unavailable", error = %err);
            json!({ "available": false })
        }
    }
}

fn read_knowledge(db_path: &Path) -> rusqlite::Result<Value> {
    let conn = rusqlite::Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;

    let learnings: i64 = conn.query_row("SELECT COUNT(*) FROM learnings", [], |r| r.get(0))?;
    let errors: i64 = conn.query_row("SELECT COUNT(*) FROM errors", [], |r| r.get(0))?;
    let categories: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT category) FROM learnings",
        [],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT created_at, category, content FROM learnings ORDER BY created_at DESC LIMIT 10",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(json!({
            "created_at": row.get::<_, String>(0)?,
            "category": row.get::<_, String>(1)?,
            "content": row.get::<_, String>(2)?,
        }))
    })?;
    let mut recent = Vec::new();
    for row in rows {
        recent.push(row?);
    }

    Ok(json!({
        "available": true,
        "learnings_count": learnings,
        "errors_count": errors,
        "categories": categories,
        "recent": recent,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_is_always_unavailable() {
        let client = BrainClient::new(None).expect("client");
        assert_eq!(client.get("/health", &[]).await, BrainData::Unavailable);
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn unreachable_brain_is_unavailable() {
        let client = BrainClient::new(Some(BrainConfig {
            url: "http://127.0.0.1:9".to_string(),
            api_key: None,
        }))
        .expect("client");
        assert_eq!(client.get("/health", &[]).await, BrainData::Unavailable);
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let client = BrainClient::new(Some(BrainConfig {
            url: "http://127.0.0.1:9".to_string(),
            api_key: None,
        }))
        .expect("client");
        assert_eq!(
            client.get("/../secrets", &[]).await,
            BrainData::Unavailable
        );
        assert_eq!(client.get("health", &[]).await, BrainData::Unavailable);
    }

    #[test]
    fn sync_status_wraps_upstream_report() {
        let client = BrainClient::new(None).expect("client");
        let status = client.sync_status(BrainData::Unavailable);
        assert_eq!(status["status"], "offline");
        assert_eq!(status["configured"], false);
        assert_eq!(status["url"], Value::Null);

        let status = client.sync_status(BrainData::Available(json!({"lag_s": 3})));
        assert_eq!(status["status"], "online");
        assert_eq!(status["upstream"]["lag_s"], 3);
    }

    #[test]
    fn knowledge_stats_degrade_without_a_store() {
        let stats = knowledge_stats(Path::new("/nonexistent/knowledge.sqlite"));
        assert_eq!(stats["available"], false);
    }

    #[test]
    fn knowledge_stats_read_counts_and_recents() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("knowledge.sqlite");
        let conn = rusqlite::Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE learnings (id INTEGER PRIMARY KEY, created_at TEXT, category TEXT, content TEXT);
             CREATE TABLE errors (id INTEGER PRIMARY KEY, created_at TEXT, detail TEXT);
             INSERT INTO learnings (created_at, category, content)
               VALUES ('2026-02-18T10:00:00Z', 'routing', 'prefer cached paths'),
                      ('2026-02-18T11:00:00Z', 'routing', 'retry with backoff'),
                      ('2026-02-18T12:00:00Z', 'planning', 'split large briefs');
             INSERT INTO errors (created_at, detail) VALUES ('2026-02-18T10:30:00Z', 'timeout');",
        )
        .expect("seed");
        drop(conn);

        let stats = knowledge_stats(&path);
        assert_eq!(stats["available"], true);
        assert_eq!(stats["learnings_count"], 3);
        assert_eq!(stats["errors_count"], 1);
        assert_eq!(stats["categories"], 2);
        assert_eq!(stats["recent"][0]["category"], "planning");
    }
}
