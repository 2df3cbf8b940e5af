use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TrackerError};
use crate::tracker::{SchedulerConfig, TrackInterval};

pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

/// Runtime configuration, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub database_path: PathBuf,
    pub fetch_timeout_secs: u64,
    /// Period given to jobs created without an explicit interval.
    pub default_interval_secs: u64,
    pub sheets_api_base: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            fetch_timeout_secs: 5,
            default_interval_secs: 30,
            sheets_api_base: DEFAULT_SHEETS_API_BASE.to_string(),
            api_key: None,
            access_token: None,
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sheet-tracker")
        .join("tracker.db")
}

impl TrackerConfig {
    /// Defaults when `path` is `None`; a named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let config: TrackerConfig = serde_json::from_str(&content).map_err(|e| {
            TrackerError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fetch_timeout_secs == 0 {
            return Err(TrackerError::Configuration(
                "fetch_timeout_secs must be at least 1".into(),
            ));
        }
        self.default_interval().as_duration()?;
        Ok(())
    }

    pub fn default_interval(&self) -> TrackInterval {
        TrackInterval::Period {
            seconds: self.default_interval_secs,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}
