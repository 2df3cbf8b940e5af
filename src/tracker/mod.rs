//! Tracking engine: per-job poll loops, their persistence and delivery.

pub mod types;
pub mod store;
pub mod storage;
pub mod sink;
pub mod scheduler;
pub mod registry;

pub use types::{DeliveryTarget, Job, JobId, NewJob, OwnerId, TrackInterval};
pub use store::{JobStore, SnapshotStore};
pub use sink::{ChannelSink, LogSink, Notification, NotificationSink};
pub use scheduler::{Scheduler, SchedulerConfig, DEFAULT_FETCH_TIMEOUT};
pub use registry::JobRegistry;
