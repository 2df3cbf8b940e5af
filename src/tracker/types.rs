use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::TrackerError;
use crate::sheet::{CellRange, SheetSource};

/// Stable identifier of a tracked range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The user a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How often a job is polled.
///
/// Only fixed periods can be scheduled. Kinds this build does not know
/// deserialize to `Unsupported` and are rejected when the job is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackInterval {
    Period { seconds: u64 },
    #[serde(other)]
    Unsupported,
}

impl TrackInterval {
    pub fn period(duration: Duration) -> Self {
        TrackInterval::Period {
            seconds: duration.as_secs(),
        }
    }

    /// The sleep between two cycles.
    pub fn as_duration(&self) -> Result<Duration, TrackerError> {
        match self {
            TrackInterval::Period { seconds: 0 } => Err(TrackerError::Configuration(
                "Polling period must be at least one second".into(),
            )),
            TrackInterval::Period { seconds } => Ok(Duration::from_secs(*seconds)),
            TrackInterval::Unsupported => Err(TrackerError::Configuration(
                "Unsupported track interval kind".into(),
            )),
        }
    }
}

impl fmt::Display for TrackInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackInterval::Period { seconds } => {
                let (d, h, m, s) = (seconds / 86_400, seconds / 3600 % 24, seconds / 60 % 60, seconds % 60);
                let parts: Vec<String> = [(d, "d"), (h, "h"), (m, "m"), (s, "s")]
                    .iter()
                    .filter(|(n, _)| *n > 0)
                    .map(|(n, unit)| format!("{}{}", n, unit))
                    .collect();
                if parts.is_empty() {
                    write!(f, "0s")
                } else {
                    write!(f, "{}", parts.join(" "))
                }
            }
            TrackInterval::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Where a job's notifications go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub chat_id: i64,
    #[serde(default)]
    pub name: String,
}

impl DeliveryTarget {
    /// Deliver straight to the owner.
    pub fn private(owner: OwnerId) -> Self {
        DeliveryTarget {
            chat_id: owner.0,
            name: "private".into(),
        }
    }
}

/// A range under continuous observation.
///
/// Jobs are replaced wholesale when reconfigured; the `with_*` methods
/// build the replacement and leave the running task untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source: SheetSource,
    pub range: CellRange,
    pub interval: TrackInterval,
    pub enabled: bool,
    pub target: DeliveryTarget,
    pub owner: OwnerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Remote range descriptor passed to the fetcher.
    pub fn range_descriptor(&self) -> String {
        self.source.a1_range(&self.range)
    }

    pub fn with_enabled(&self, enabled: bool) -> Job {
        Job {
            enabled,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_interval(&self, interval: TrackInterval) -> Job {
        Job {
            interval,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_target(&self, target: DeliveryTarget) -> Job {
        Job {
            target,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Input for creating a job; the range is still raw text at this point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub source: SheetSource,
    pub range: String,
    pub interval: TrackInterval,
    pub owner: OwnerId,
    pub target: Option<DeliveryTarget>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewJob {
    /// Validate the input and turn it into a job with a fresh id.
    pub fn into_job(self) -> Result<Job, TrackerError> {
        let range = CellRange::parse(&self.range)?;
        self.interval.as_duration()?;

        // Unqualified ranges are read from the first sheet, which need not be this one
        if self.source.sheet_id != 0 && self.source.sheet_name.is_empty() {
            return Err(TrackerError::Configuration(format!(
                "Sheet {} needs a name to build its range",
                self.source.sheet_id
            )));
        }

        let now = Utc::now();
        Ok(Job {
            id: JobId::generate(),
            source: self.source,
            range,
            target: self.target.unwrap_or_else(|| DeliveryTarget::private(self.owner)),
            interval: self.interval,
            enabled: self.enabled,
            owner: self.owner,
            created_at: now,
            updated_at: now,
        })
    }
}
