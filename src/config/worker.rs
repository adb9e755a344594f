//! Worker configuration file.
//!
//! ```toml
//! priority = ["github.enrich", "github.raw"]
//! finish = false
//! max_users = 1
//! batch_size = 1            # or "unlimited"
//! idle_interval_ms = 5000
//! heartbeat_ms = 10000
//! stale_job_secs = 60
//!
//! [[handler]]
//! kind = "github.raw"
//! command = "hooks/github-raw"
//! follow_up = "github.enrich"
//!
//! [[handler]]
//! kind = "github.enrich"
//! command = "hooks/github-enrich"
//! args = ["--verbose"]
//! needs_token = false
//! ```

use crate::engine::LoopConfig;
use crate::error::{Error, Result};
use crate::handler::HandlerConfig;
use crate::model::IntentionKind;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Kinds in priority order, highest first.
    pub priority: Vec<IntentionKind>,
    #[serde(default)]
    pub finish: bool,
    #[serde(default = "default_max_users")]
    pub max_users: usize,
    #[serde(default)]
    batch_size: Option<BatchSize>,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Silence after which another worker's job counts as orphaned.
    #[serde(default)]
    pub stale_job_secs: Option<u64>,
    #[serde(default, rename = "handler")]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BatchSize {
    Count(usize),
    Keyword(String),
}

fn default_max_users() -> usize {
    1
}

fn default_idle_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

impl WorkerConfig {
    /// Read and validate a worker config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad worker config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.priority.is_empty() {
            return Err(Error::Config("priority list is empty".to_string()));
        }
        if self.max_users == 0 {
            return Err(Error::Config("max_users must be at least 1".to_string()));
        }
        if self.heartbeat_ms == 0 {
            return Err(Error::Config("heartbeat_ms must be at least 1".to_string()));
        }
        self.batch_size()?;
        Ok(())
    }

    /// Intentions per job; `None` means no limit.
    pub fn batch_size(&self) -> Result<Option<usize>> {
        match &self.batch_size {
            None => Ok(Some(crate::sched::batcher::DEFAULT_BATCH_SIZE)),
            Some(BatchSize::Count(0)) => {
                Err(Error::Config("batch_size must be at least 1".to_string()))
            }
            Some(BatchSize::Count(n)) => Ok(Some(*n)),
            Some(BatchSize::Keyword(k)) if k == "unlimited" => Ok(None),
            Some(BatchSize::Keyword(k)) => Err(Error::Config(format!("bad batch_size: {k}"))),
        }
    }

    /// Loop parameters, with `finish` forced on when `finish_override` is set.
    pub fn loop_config(&self, finish_override: bool) -> Result<LoopConfig> {
        Ok(LoopConfig {
            finish: self.finish || finish_override,
            max_users: self.max_users,
            batch_size: self.batch_size()?,
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            stale_after: self.stale_job_secs.map(Duration::from_secs),
        })
    }
}
