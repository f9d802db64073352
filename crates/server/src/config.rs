use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Resolved locations of everything the server reads and writes. All files
/// live under one data directory so a single env var relocates the lot.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub events_path: PathBuf,
    pub metrics_path: PathBuf,
    pub budget_path: PathBuf,
    pub brain_config_path: PathBuf,
    pub knowledge_db_path: PathBuf,
}

impl Paths {
    /// Priority: explicit CLI argument, then ARENA_DATA_DIR, then the
    /// current directory.
    pub fn resolve(data_dir: Option<PathBuf>) -> Self {
        let data_dir = data_dir
            .or_else(|| std::env::var_os("ARENA_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: data_dir.join("arena.sqlite"),
            events_path: data_dir.join("events.jsonl"),
            metrics_path: data_dir.join("agent-metrics.json"),
            budget_path: data_dir.join("budget.json"),
            brain_config_path: data_dir.join("config.json"),
            knowledge_db_path: data_dir.join("knowledge.sqlite"),
            data_dir,
        }
    }
}

/// Daily token ceiling and alert thresholds, from budget.json when present.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_ceiling")]
    pub daily_token_budget: u64,
    #[serde(default = "default_warn")]
    pub warning_threshold: f64,
    #[serde(default = "default_crit")]
    pub critical_threshold: f64,
}

fn default_ceiling() -> u64 {
    1_000_000
}

fn default_warn() -> f64 {
    0.75
}

fn default_crit() -> f64 {
    0.90
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_token_budget: default_ceiling(),
            warning_threshold: default_warn(),
            critical_threshold: default_crit(),
        }
    }
}

impl BudgetConfig {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    warn!(event = "budget_config_invalid", error = %err);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn status_for(&self, consumed: u64) -> &'static str {
        let fraction = consumed as f64 / self.daily_token_budget.max(1) as f64;
        if fraction >= self.critical_threshold {
            "critical"
        } else if fraction >= self.warning_threshold {
            "warning"
        } else {
            "ok"
        }
    }
}

/// Baseline per-agent stats shipped alongside the agent definitions. Used to
/// seed levels at startup and to supply success rates the event stream does
/// not carry.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RosterEntry {
    #[serde(default)]
    pub invocations: u64,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
}

fn default_success_rate() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct MetricsFile {
    #[serde(default)]
    agents: BTreeMap<String, RosterEntry>,
}

pub fn load_roster(path: &Path) -> BTreeMap<String, RosterEntry> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<MetricsFile>(&content) {
            Ok(file) => file.agents,
            Err(err) => {
                warn!(event = "roster_invalid", error = %err);
                BTreeMap::new()
            }
        },
        Err(_) => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_defaults_apply_without_a_file() {
        let config = BudgetConfig::load(Path::new("/nonexistent/budget.json"));
        assert_eq!(config.daily_token_budget, 1_000_000);
        assert_eq!(config.status_for(0), "ok");
        assert_eq!(config.status_for(750_000), "warning");
        assert_eq!(config.status_for(900_000), "critical");
    }

    #[test]
    fn budget_file_keys_are_honored() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("budget.json");
        std::fs::write(
            &path,
            r#"{"daily_token_budget": 500000, "warning_threshold": 0.5, "critical_threshold": 0.8}"#,
        )
        .expect("write");

        let config = BudgetConfig::load(&path);
        assert_eq!(config.daily_token_budget, 500_000);
        assert!((config.warning_threshold - 0.5).abs() < 1e-9);
        assert!((config.critical_threshold - 0.8).abs() < 1e-9);
        assert_eq!(config.status_for(250_000), "warning");
        assert_eq!(config.status_for(400_000), "critical");
    }

    #[test]
    fn roster_parses_agents_with_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("agent-metrics.json");
        std::fs::write(
            &path,
            r#"{"agents": {"scout": {"invocations": 12, "success_rate": 0.95}, "builder": {}}}"#,
        )
        .expect("write");

        let roster = load_roster(&path);
        assert_eq!(roster["scout"].invocations, 12);
        assert!((roster["builder"].success_rate - 1.0).abs() < 1e-9);
        assert_eq!(roster["builder"].invocations, 0);
    }
}
