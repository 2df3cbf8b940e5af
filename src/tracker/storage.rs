use chrono::{DateTime, Utc};
use rusqlite::Row;
use std::collections::BTreeMap;

use crate::database::{Database, DbError};
use crate::sheet::{Cell, CellRange, Offset, SheetSource, Snapshot};

use super::store::{JobStore, SnapshotStore};
use super::types::{DeliveryTarget, Job, JobId, OwnerId, TrackInterval};

const JOB_COLUMNS: &str = "id, spreadsheet_id, sheet_id, sheet_name, cell_range, interval, enabled,
     target, owner, created_at, updated_at";

const SNAPSHOT_COLUMNS: &str = "id, job_id, origin_row, origin_column, grid, notes, captured_at";

impl Database {
    /// Create the job and snapshot tables
    pub fn create_tracker_tables(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                spreadsheet_id TEXT NOT NULL,
                sheet_id INTEGER NOT NULL,
                sheet_name TEXT NOT NULL DEFAULT '',
                cell_range TEXT NOT NULL,
                interval TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                target TEXT NOT NULL,
                owner INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner)", [])?;

        // Append-only; `seq` is the insertion order and decides which snapshot is latest
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                job_id TEXT NOT NULL,
                origin_row INTEGER NOT NULL,
                origin_column INTEGER NOT NULL,
                grid TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT '[]',
                captured_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_job_seq ON snapshots(job_id, seq DESC)",
            [],
        )?;

        Ok(())
    }

    // ==================== Snapshot Methods ====================

    /// Append a snapshot to its job's history
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), DbError> {
        let grid = serde_json::to_string(&snapshot.grid)?;
        let notes = notes_to_json(&snapshot.notes)?;

        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;
        conn.execute(
            "INSERT INTO snapshots (id, job_id, origin_row, origin_column, grid, notes, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                snapshot.id,
                snapshot.job.as_str(),
                snapshot.origin.row,
                snapshot.origin.column,
                grid,
                notes,
                snapshot.captured_at.timestamp_millis(),
            ],
        )?;

        Ok(())
    }

    /// Most recently saved snapshot of a job.
    ///
    /// Ordered by insertion, not by `captured_at`, so a clock stepping
    /// backwards cannot resurrect an older baseline.
    pub fn latest_snapshot(&self, job: &JobId) -> Result<Option<Snapshot>, DbError> {
        Ok(self.snapshot_history(job, 1)?.into_iter().next())
    }

    /// Snapshots of a job, newest first
    pub fn snapshot_history(&self, job: &JobId, limit: u32) -> Result<Vec<Snapshot>, DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM snapshots
             WHERE job_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
            SNAPSHOT_COLUMNS
        ))?;

        let rows = stmt.query_map(rusqlite::params![job.as_str(), limit], |row| {
            Ok(RawSnapshot {
                id: row.get(0)?,
                job_id: row.get(1)?,
                origin_row: row.get(2)?,
                origin_column: row.get(3)?,
                grid: row.get(4)?,
                notes: row.get(5)?,
                captured_at: row.get(6)?,
            })
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?.decode()?);
        }

        Ok(snapshots)
    }

    // ==================== Job Methods ====================

    /// Insert or replace a job record
    pub fn save_job(&self, job: &Job) -> Result<(), DbError> {
        let interval = serde_json::to_string(&job.interval)?;
        let target = serde_json::to_string(&job.target)?;

        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;
        conn.execute(
            "INSERT OR REPLACE INTO jobs (id, spreadsheet_id, sheet_id, sheet_name, cell_range, interval, enabled,
                                          target, owner, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                job.id.as_str(),
                job.source.spreadsheet_id,
                job.source.sheet_id,
                job.source.sheet_name,
                job.range.to_string(),
                interval,
                job.enabled as i32,
                target,
                job.owner.0,
                job.created_at.timestamp_millis(),
                job.updated_at.timestamp_millis(),
            ],
        )?;

        Ok(())
    }

    /// Get a job by ID
    pub fn get_job(&self, id: &JobId) -> Result<Option<Job>, DbError> {
        let mut jobs = self.query_jobs("WHERE id = ?1", rusqlite::params![id.as_str()])?;
        Ok(jobs.pop())
    }

    /// All jobs, oldest first
    pub fn list_jobs(&self) -> Result<Vec<Job>, DbError> {
        self.query_jobs("", [])
    }

    /// Jobs of one owner, oldest first
    pub fn list_owner_jobs(&self, owner: OwnerId) -> Result<Vec<Job>, DbError> {
        self.query_jobs("WHERE owner = ?1", rusqlite::params![owner.0])
    }

    /// Delete a job and its snapshot history
    pub fn delete_job(&self, id: &JobId) -> Result<bool, DbError> {
        let mut conn = self.conn.lock().map_err(|_| DbError::Lock)?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM snapshots WHERE job_id = ?1", [id.as_str()])?;
        let deleted = tx.execute("DELETE FROM jobs WHERE id = ?1", [id.as_str()])?;
        tx.commit()?;

        Ok(deleted > 0)
    }

    fn query_jobs(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<Job>, DbError> {
        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs {} ORDER BY created_at ASC, id ASC",
            JOB_COLUMNS, filter
        ))?;

        let rows = stmt.query_map(params, RawJob::from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.decode()?);
        }

        Ok(jobs)
    }
}

impl SnapshotStore for Database {
    fn latest(&self, job: &JobId) -> Result<Option<Snapshot>, DbError> {
        self.latest_snapshot(job)
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), DbError> {
        self.save_snapshot(snapshot)
    }
}

impl JobStore for Database {
    fn load_jobs(&self) -> Result<Vec<Job>, DbError> {
        self.list_jobs()
    }

    fn load_job(&self, id: &JobId) -> Result<Option<Job>, DbError> {
        self.get_job(id)
    }

    fn owner_jobs(&self, owner: OwnerId) -> Result<Vec<Job>, DbError> {
        self.list_owner_jobs(owner)
    }

    fn store_job(&self, job: &Job) -> Result<(), DbError> {
        self.save_job(job)
    }

    fn erase_job(&self, id: &JobId) -> Result<(), DbError> {
        self.delete_job(id).map(|_| ())
    }
}

/// Column values as read, before JSON decoding
struct RawSnapshot {
    id: String,
    job_id: String,
    origin_row: u32,
    origin_column: u32,
    grid: String,
    notes: String,
    captured_at: i64,
}

impl RawSnapshot {
    fn decode(self) -> Result<Snapshot, DbError> {
        Ok(Snapshot {
            id: self.id,
            job: JobId::from(self.job_id),
            origin: Cell::new(self.origin_row, self.origin_column),
            grid: serde_json::from_str(&self.grid)?,
            notes: notes_from_json(&self.notes)?,
            captured_at: from_millis(self.captured_at),
        })
    }
}

struct RawJob {
    id: String,
    spreadsheet_id: String,
    sheet_id: i64,
    sheet_name: String,
    cell_range: String,
    interval: String,
    enabled: i32,
    target: String,
    owner: i64,
    created_at: i64,
    updated_at: i64,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawJob {
            id: row.get(0)?,
            spreadsheet_id: row.get(1)?,
            sheet_id: row.get(2)?,
            sheet_name: row.get(3)?,
            cell_range: row.get(4)?,
            interval: row.get(5)?,
            enabled: row.get(6)?,
            target: row.get(7)?,
            owner: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Job, DbError> {
        let interval: TrackInterval = serde_json::from_str(&self.interval)?;
        let target: DeliveryTarget = serde_json::from_str(&self.target)?;
        // Stored ranges were validated on the way in
        let range: CellRange = serde_json::from_value(serde_json::Value::String(self.cell_range))?;

        Ok(Job {
            id: JobId::from(self.id),
            source: SheetSource {
                spreadsheet_id: self.spreadsheet_id,
                sheet_id: self.sheet_id,
                sheet_name: self.sheet_name,
            },
            range,
            interval,
            enabled: self.enabled != 0,
            target,
            owner: OwnerId(self.owner),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn notes_to_json(notes: &BTreeMap<Offset, String>) -> Result<String, DbError> {
    let entries: Vec<(u32, u32, &str)> = notes
        .iter()
        .map(|(offset, note)| (offset.row, offset.column, note.as_str()))
        .collect();
    Ok(serde_json::to_string(&entries)?)
}

fn notes_from_json(json: &str) -> Result<BTreeMap<Offset, String>, DbError> {
    let entries: Vec<(u32, u32, String)> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|(row, column, note)| (Offset::new(row, column), note))
        .collect())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(id: &str, owner: i64) -> Job {
        let now = from_millis(Utc::now().timestamp_millis());
        Job {
            id: JobId::from(id),
            source: SheetSource {
                spreadsheet_id: "doc".into(),
                sheet_id: 3,
                sheet_name: "Data".into(),
            },
            range: CellRange::parse("A1:C10").unwrap(),
            interval: TrackInterval::Period { seconds: 30 },
            enabled: true,
            target: DeliveryTarget::private(OwnerId(owner)),
            owner: OwnerId(owner),
            created_at: now,
            updated_at: now,
        }
    }

    fn snapshot(job: &str, text: &str, at: DateTime<Utc>) -> Snapshot {
        let mut notes = BTreeMap::new();
        notes.insert(Offset::new(0, 1), format!("note for {}", text));
        Snapshot::new(
            JobId::from(job),
            Cell::new(1, 1),
            vec![vec![text.to_string(), String::new()]],
            notes,
            from_millis(at.timestamp_millis()),
        )
    }

    #[test]
    fn test_latest_snapshot_is_last_saved_even_if_clock_went_back() {
        let db = Database::open_in_memory().unwrap();
        let job_id = JobId::from("j1");
        let now = Utc::now();

        assert!(db.latest_snapshot(&job_id).unwrap().is_none());

        let before_step = snapshot("j1", "before", now);
        let after_step = snapshot("j1", "after", now - Duration::seconds(30));
        db.save_snapshot(&before_step).unwrap();
        db.save_snapshot(&after_step).unwrap();

        let latest = db.latest_snapshot(&job_id).unwrap().unwrap();
        assert_eq!(latest, after_step);

        let history = db.snapshot_history(&job_id, 10).unwrap();
        assert_eq!(history, vec![after_step, before_step]);
    }

    #[test]
    fn test_same_millisecond_prefers_later_insert() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.save_snapshot(&snapshot("j1", "a", now)).unwrap();
        db.save_snapshot(&snapshot("j1", "b", now)).unwrap();

        let latest = db.latest_snapshot(&JobId::from("j1")).unwrap().unwrap();
        assert_eq!(latest.grid[0][0], "b");
    }

    #[test]
    fn test_histories_are_per_job() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.save_snapshot(&snapshot("j1", "one", now)).unwrap();
        db.save_snapshot(&snapshot("j2", "two", now)).unwrap();

        assert_eq!(db.latest_snapshot(&JobId::from("j1")).unwrap().unwrap().grid[0][0], "one");
        assert_eq!(db.latest_snapshot(&JobId::from("j2")).unwrap().unwrap().grid[0][0], "two");

        assert_eq!(db.snapshot_history(&JobId::from("j1"), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_job_round_trip_and_replace() {
        let db = Database::open_in_memory().unwrap();
        let original = job("j1", 1);
        db.save_job(&original).unwrap();

        assert_eq!(db.get_job(&original.id).unwrap(), Some(original.clone()));

        let replaced = original.with_interval(TrackInterval::Period { seconds: 300 });
        let replaced = Job {
            updated_at: from_millis(replaced.updated_at.timestamp_millis()),
            ..replaced
        };
        db.save_job(&replaced).unwrap();

        let loaded = db.get_job(&original.id).unwrap().unwrap();
        assert_eq!(loaded.interval, TrackInterval::Period { seconds: 300 });
        assert_eq!(db.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_owner_jobs_and_delete() {
        let db = Database::open_in_memory().unwrap();
        db.save_job(&job("a", 1)).unwrap();
        db.save_job(&job("b", 2)).unwrap();
        db.save_job(&job("c", 1)).unwrap();
        db.save_snapshot(&snapshot("a", "x", Utc::now())).unwrap();

        assert_eq!(db.list_owner_jobs(OwnerId(1)).unwrap().len(), 2);

        assert!(db.delete_job(&JobId::from("a")).unwrap());
        assert!(!db.delete_job(&JobId::from("a")).unwrap());
        assert!(db.latest_snapshot(&JobId::from("a")).unwrap().is_none());
        assert_eq!(db.list_owner_jobs(OwnerId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_interval_survives_storage() {
        let db = Database::open_in_memory().unwrap();
        let j = job("j1", 1);
        db.save_job(&j).unwrap();

        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE jobs SET interval = '{\"kind\":\"weekly\",\"day\":\"mon\"}' WHERE id = 'j1'",
                [],
            )
            .unwrap();
        }

        let loaded = db.get_job(&j.id).unwrap().unwrap();
        assert_eq!(loaded.interval, TrackInterval::Unsupported);
    }
}
