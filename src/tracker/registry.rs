use std::sync::Arc;

use crate::error::{Result, TrackerError};

use super::scheduler::Scheduler;
use super::store::JobStore;
use super::types::{DeliveryTarget, Job, JobId, NewJob, OwnerId, TrackInterval};

/// Job lifecycle on top of the scheduler.
///
/// Keeps the stored job records and the running loops in agreement. Every
/// change is stop, persist, then start again when enabled. A detached
/// registry only edits the records; whichever process runs the loops picks
/// them up on its next resume.
pub struct JobRegistry {
    jobs: Arc<dyn JobStore>,
    scheduler: Option<Arc<Scheduler>>,
}

impl JobRegistry {
    pub fn new(jobs: Arc<dyn JobStore>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            jobs,
            scheduler: Some(scheduler),
        }
    }

    /// Registry that never starts or stops a loop.
    pub fn detached(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs, scheduler: None }
    }

    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Start every enabled stored job. Returns how many were started.
    ///
    /// A job that cannot be scheduled is logged and skipped.
    pub fn resume(&self) -> Result<usize> {
        let Some(scheduler) = &self.scheduler else {
            return Ok(0);
        };
        let mut started = 0;

        for job in self.jobs.load_jobs()?.into_iter().filter(|job| job.enabled) {
            match scheduler.add_job(&job) {
                Ok(()) => started += 1,
                Err(TrackerError::DuplicateJob(_)) => {}
                Err(e) => {
                    tracing::warn!(job = %job.id, error = %e, "Skipping job on resume");
                }
            }
        }

        tracing::info!(started, "Resumed tracking");
        Ok(started)
    }

    pub fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = new_job.into_job()?;

        self.jobs.store_job(&job)?;
        self.start(&job)?;

        tracing::info!(job = %job.id, owner = %job.owner, range = %job.range, "Job created");
        Ok(job)
    }

    pub async fn set_enabled(&self, id: &JobId, enabled: bool) -> Result<Job> {
        let job = self.get_job(id)?;
        self.replace(job.with_enabled(enabled)).await
    }

    pub async fn set_interval(&self, id: &JobId, interval: TrackInterval) -> Result<Job> {
        let job = self.get_job(id)?;
        self.replace(job.with_interval(interval)).await
    }

    pub async fn set_target(&self, id: &JobId, target: DeliveryTarget) -> Result<Job> {
        let job = self.get_job(id)?;
        self.replace(job.with_target(target)).await
    }

    /// Stop the job, then erase it together with its snapshot history.
    pub async fn delete_job(&self, id: &JobId) -> Result<()> {
        self.get_job(id)?;

        self.stop(id).await;
        self.jobs.erase_job(id)?;

        tracing::info!(job = %id, "Job deleted");
        Ok(())
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .load_job(id)?
            .ok_or_else(|| TrackerError::JobNotFound(id.clone()))
    }

    /// All jobs, or only those of `owner`.
    pub fn list_jobs(&self, owner: Option<OwnerId>) -> Result<Vec<Job>> {
        let jobs = match owner {
            Some(owner) => self.jobs.owner_jobs(owner)?,
            None => self.jobs.load_jobs()?,
        };
        Ok(jobs)
    }

    pub async fn shutdown(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }
    }

    async fn replace(&self, job: Job) -> Result<Job> {
        // Reject before touching the running loop
        job.interval.as_duration()?;

        self.stop(&job.id).await;
        self.jobs.store_job(&job)?;
        self.start(&job)?;

        tracing::info!(job = %job.id, enabled = job.enabled, interval = %job.interval, "Job updated");
        Ok(job)
    }

    fn start(&self, job: &Job) -> Result<()> {
        match &self.scheduler {
            Some(scheduler) if job.enabled => scheduler.add_job(job),
            _ => Ok(()),
        }
    }

    async fn stop(&self, id: &JobId) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.remove_job(id).await;
        }
    }
}
