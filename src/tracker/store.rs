use crate::database::DbError;
use crate::sheet::Snapshot;

use super::types::{Job, JobId, OwnerId};

/// Durable snapshot history, one baseline per job.
///
/// Calls are synchronous so a cycle's read-diff-write section has no
/// suspension point that cancellation could split.
pub trait SnapshotStore: Send + Sync {
    /// Most recently saved snapshot of `job`, `None` before its first cycle.
    fn latest(&self, job: &JobId) -> Result<Option<Snapshot>, DbError>;

    /// Append `snapshot`; the next `latest` for its job returns it.
    fn save(&self, snapshot: &Snapshot) -> Result<(), DbError>;
}

/// Where job records come from and go to.
pub trait JobStore: Send + Sync {
    fn load_jobs(&self) -> Result<Vec<Job>, DbError>;

    fn load_job(&self, id: &JobId) -> Result<Option<Job>, DbError>;

    fn owner_jobs(&self, owner: OwnerId) -> Result<Vec<Job>, DbError>;

    /// Insert or replace the whole record.
    fn store_job(&self, job: &Job) -> Result<(), DbError>;

    /// Erase the record and its snapshot history.
    fn erase_job(&self, id: &JobId) -> Result<(), DbError>;
}
