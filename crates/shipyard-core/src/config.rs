use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 4;
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Top-level config (shipyard.toml + SHIPYARD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipyardConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runners: RunnersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Background job runners: one poll cadence shared by every worker group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnersConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub groups: Vec<WorkerGroupConfig>,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            groups: Vec::new(),
        }
    }
}

impl RunnersConfig {
    /// Never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Groups as the pool should see them.
    ///
    /// With nothing configured a single catch-all group of size 1 is used,
    /// and every size is raised to at least 1.
    pub fn effective_groups(&self) -> Vec<WorkerGroupConfig> {
        if self.groups.is_empty() {
            return vec![WorkerGroupConfig {
                name: DEFAULT_GROUP_NAME.to_string(),
                size: 1,
                messages: Vec::new(),
            }];
        }

        self.groups
            .iter()
            .cloned()
            .map(|mut g| {
                g.size = g.size.max(1);
                g
            })
            .collect()
    }
}

/// A named worker group with a fixed concurrency limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerGroupConfig {
    pub name: String,
    #[serde(default = "default_group_size")]
    pub size: usize,
    /// Message names handled by this group. Empty means "everything no other
    /// group claims".
    #[serde(default)]
    pub messages: Vec<String>,
}

impl WorkerGroupConfig {
    pub fn is_catch_all(&self) -> bool {
        self.messages.is_empty()
    }
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_group_size() -> usize {
    1
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shipyard/shipyard.db", home)
}

impl ShipyardConfig {
    /// Load config from a TOML file with SHIPYARD_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SHIPYARD_RUNNERS__POLL_INTERVAL_SECS=2`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ShipyardConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SHIPYARD_").split("__"))
            .extract()
            .map_err(|e| crate::error::ShipyardError::Config(e.to_string()))?;

        tracing::debug!(path = %path, groups = config.runners.groups.len(), "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shipyard/shipyard.toml", home)
}
