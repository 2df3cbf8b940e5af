use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TrackerError};
use crate::sheet::{changes_since, FetchError, RemoteFetch, Snapshot};

use super::sink::NotificationSink;
use super::store::SnapshotStore;
use super::types::{Job, JobId};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard upper bound on a single fetch.
    pub fetch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Live entry for one job. It stays in the table until its task has
/// exited, so a stopping job still counts as tracked.
struct JobHandle {
    generation: u64,
    cancel: CancellationToken,
    /// Closed when the task ends; the task owns the sender.
    stopped: watch::Receiver<()>,
}

/// Runs one independent poll loop per tracked job.
///
/// At most one loop exists per job id. Reconfiguring a job means removing
/// its loop and adding a new one; there is no in-place update.
pub struct Scheduler {
    fetcher: Arc<dyn RemoteFetch>,
    store: Arc<dyn SnapshotStore>,
    sink: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
    generations: AtomicU64,
}

impl Scheduler {
    pub fn new(
        fetcher: Arc<dyn RemoteFetch>,
        store: Arc<dyn SnapshotStore>,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            sink,
            config,
            jobs: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Start polling `job`. Returns as soon as the loop is spawned.
    ///
    /// Fails with `DuplicateJob` while a loop for the same id exists,
    /// including one that is still stopping. Must be called from within a
    /// tokio runtime.
    pub fn add_job(&self, job: &Job) -> Result<()> {
        let period = job.interval.as_duration()?;

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(TrackerError::DuplicateJob(job.id.clone()));
        }

        let cancel = CancellationToken::new();
        let (stopped_tx, stopped) = watch::channel(());
        let worker = JobWorker {
            job: job.clone(),
            period,
            fetch_timeout: self.config.fetch_timeout,
            fetcher: Arc::clone(&self.fetcher),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            // Dropped on exit, panics included
            let _stopped = stopped_tx;
            worker.run(token).await;
        });

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        jobs.insert(
            job.id.clone(),
            JobHandle {
                generation,
                cancel,
                stopped,
            },
        );
        tracing::info!(job = %job.id, interval = %job.interval, "Tracking started");

        Ok(())
    }

    /// Stop polling `id`; no-op when it is not tracked.
    ///
    /// Waits for the loop to exit, so once this returns the job makes no
    /// further store writes or deliveries. An in-flight fetch is dropped.
    /// Concurrent callers for the same id all wait for the same exit.
    pub async fn remove_job(&self, id: &JobId) {
        let (generation, cancel, mut stopped) = {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match jobs.get(id) {
                Some(handle) => (handle.generation, handle.cancel.clone(), handle.stopped.clone()),
                None => return,
            }
        };

        cancel.cancel();
        // Nothing is ever sent, so this only returns once the sender is gone
        let _ = stopped.changed().await;

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.get(id).is_some_and(|handle| handle.generation == generation) {
            jobs.remove(id);
            tracing::info!(job = %id, "Tracking stopped");
        }
    }

    pub fn is_tracking(&self, id: &JobId) -> bool {
        self.jobs.lock().map(|jobs| jobs.contains_key(id)).unwrap_or(false)
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .jobs
            .lock()
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Stop every loop.
    pub async fn shutdown(&self) {
        for id in self.tracked_jobs() {
            self.remove_job(&id).await;
        }
    }
}

/// Everything one poll loop needs; owned by its task.
struct JobWorker {
    job: Job,
    period: Duration,
    fetch_timeout: Duration,
    fetcher: Arc<dyn RemoteFetch>,
    store: Arc<dyn SnapshotStore>,
    sink: Arc<dyn NotificationSink>,
}

impl JobWorker {
    async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                result = self.run_cycle() => {
                    match result {
                        Ok(()) => {}
                        Err(TrackerError::InvariantViolation(e)) => {
                            tracing::error!(job = %self.job.id, error = %e, "Cycle aborted");
                        }
                        Err(e) => {
                            tracing::warn!(job = %self.job.id, error = %e, "Cycle failed");
                        }
                    }
                }
            }

            // Measured from the end of the cycle
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                () = tokio::time::sleep(self.period) => {}
            }
        }

        tracing::debug!(job = %self.job.id, "Tracking task exiting");
    }

    /// Fetch, diff, deliver, save.
    ///
    /// The fetch is the only suspension point; everything after it runs to
    /// completion once started.
    async fn run_cycle(&self) -> Result<()> {
        let ranges = [self.job.range_descriptor()];

        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch_ranges(&self.job.source.spreadsheet_id, &ranges),
        )
        .await
        .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;

        let sheet_id = self.job.source.sheet_id;
        let range = fetched
            .into_iter()
            .find(|range| range.sheet_id == sheet_id)
            .ok_or_else(|| FetchError::Malformed(format!("no sheet with id {} returned for {}", sheet_id, ranges[0])))?;

        let snapshot = Snapshot::from_cells(self.job.id.clone(), range.origin, range.rows, Utc::now());

        let baseline = match self.store.latest(&self.job.id)? {
            Some(previous) if previous.origin != snapshot.origin => {
                tracing::info!(
                    job = %self.job.id,
                    old = %previous.origin,
                    new = %snapshot.origin,
                    "Range origin moved, starting a new history"
                );
                None
            }
            previous => previous,
        };

        let events = match &baseline {
            Some(previous) if previous.checksum() == snapshot.checksum() => Vec::new(),
            _ => changes_since(baseline.as_ref(), &snapshot)?,
        };

        tracing::debug!(job = %self.job.id, events = events.len(), "Cycle complete");

        for event in events {
            self.sink.deliver(&self.job, event);
        }
        self.store.save(&snapshot)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DbError;
    use crate::sheet::{Cell, CellData, CellRange, DataEvent, FetchedRange, SheetSource};
    use crate::tracker::{DeliveryTarget, OwnerId, TrackInterval};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Replays scripted responses, then blocks forever.
    struct ScriptedFetch {
        responses: Mutex<VecDeque<std::result::Result<FetchedRange, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetch {
        fn new(responses: Vec<std::result::Result<FetchedRange, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteFetch for ScriptedFetch {
        async fn fetch_ranges(
            &self,
            _document: &str,
            _ranges: &[String],
        ) -> std::result::Result<Vec<FetchedRange>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(response) => response.map(|range| vec![range]),
                None => std::future::pending().await,
            }
        }
    }

    /// Blocks inside the fetch until released.
    struct GatedFetch {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteFetch for GatedFetch {
        async fn fetch_ranges(
            &self,
            _document: &str,
            _ranges: &[String],
        ) -> std::result::Result<Vec<FetchedRange>, FetchError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![grid(&[&["late"]])])
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        snapshots: Mutex<Vec<Snapshot>>,
    }

    impl MemoryStore {
        fn saved(&self) -> usize {
            self.snapshots.lock().unwrap().len()
        }
    }

    impl SnapshotStore for MemoryStore {
        fn latest(&self, job: &JobId) -> std::result::Result<Option<Snapshot>, DbError> {
            Ok(self
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|s| &s.job == job)
                .cloned())
        }

        fn save(&self, snapshot: &Snapshot) -> std::result::Result<(), DbError> {
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(JobId, DataEvent)>>,
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|(_, e)| e.kind()).collect()
        }
    }

    impl NotificationSink for RecordingSink {
        fn deliver(&self, job: &Job, event: DataEvent) {
            self.events.lock().unwrap().push((job.id.clone(), event));
        }
    }

    fn grid(rows: &[&[&str]]) -> FetchedRange {
        FetchedRange {
            sheet_id: 0,
            origin: Cell::new(1, 1),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|text| CellData::text(*text)).collect())
                .collect(),
        }
    }

    fn job(id: &str) -> Job {
        Job {
            id: JobId::from(id),
            source: SheetSource {
                spreadsheet_id: "doc".into(),
                sheet_id: 0,
                sheet_name: "Sheet1".into(),
            },
            range: CellRange::parse("A1:C3").unwrap(),
            interval: TrackInterval::Period { seconds: 1 },
            enabled: true,
            target: DeliveryTarget::private(OwnerId(1)),
            owner: OwnerId(1),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn scheduler(
        fetcher: Arc<dyn RemoteFetch>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    ) -> Scheduler {
        Scheduler::new(fetcher, store, sink, SchedulerConfig::default())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(ScriptedFetch::new(vec![]), store, sink);

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        assert!(matches!(scheduler.add_job(&job), Err(TrackerError::DuplicateJob(id)) if id == job.id));
        assert_eq!(scheduler.tracked_jobs(), vec![job.id.clone()]);

        scheduler.remove_job(&job.id).await;
        scheduler.add_job(&job).unwrap();
        scheduler.shutdown().await;
        assert!(scheduler.tracked_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(ScriptedFetch::new(vec![]), store, sink);

        scheduler.remove_job(&JobId::from("missing")).await;

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        scheduler.remove_job(&job.id).await;
        scheduler.remove_job(&job.id).await;
        assert!(!scheduler.is_tracking(&job.id));
    }

    #[tokio::test]
    async fn test_unsupported_interval_never_starts() {
        let fetch = ScriptedFetch::new(vec![]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(fetch.clone(), store, sink);

        let mut job = job("j1");
        job.interval = TrackInterval::Unsupported;

        assert!(matches!(scheduler.add_job(&job), Err(TrackerError::Configuration(_))));
        assert!(!scheduler.is_tracking(&job.id));
        tokio::task::yield_now().await;
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_then_changes() {
        let fetch = ScriptedFetch::new(vec![
            Ok(grid(&[&["a", "", ""]])),
            Ok(grid(&[&["a", "b", ""]])),
            Ok(grid(&[&["a", "b", ""]])),
        ]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(fetch.clone(), store.clone(), sink.clone());

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        wait_until(|| store.saved() == 3).await;
        scheduler.remove_job(&job.id).await;

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0].1, DataEvent::InitialLoad { .. }));
        assert_eq!(
            events[1].1,
            DataEvent::AddText {
                cell: Cell::new(1, 2),
                text: "b".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_is_contained() {
        let fetch = ScriptedFetch::new(vec![
            Err(FetchError::Malformed("garbage".into())),
            Err(FetchError::Status {
                status: 503,
                body: String::new(),
            }),
            Ok(grid(&[&["x"]])),
        ]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(fetch.clone(), store.clone(), sink.clone());

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        wait_until(|| store.saved() == 1).await;

        assert_eq!(fetch.calls(), 3);
        assert_eq!(sink.kinds(), vec!["initial_load"]);
        assert!(scheduler.is_tracking(&job.id));
        scheduler.remove_job(&job.id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out_and_retries() {
        // First call never answers
        let fetch = ScriptedFetch::new(vec![]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(fetch.clone(), store.clone(), sink.clone());

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        wait_until(|| fetch.calls() >= 2).await;

        assert_eq!(store.saved(), 0);
        assert!(sink.kinds().is_empty());
        scheduler.remove_job(&job.id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_moved_origin_starts_fresh_history() {
        let mut moved = grid(&[&["a"]]);
        moved.origin = Cell::new(2, 1);

        let fetch = ScriptedFetch::new(vec![Ok(moved)]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());

        let job = job("j1");
        store
            .save(&Snapshot::from_cells(job.id.clone(), Cell::new(1, 1), vec![vec![CellData::text("a")]], Utc::now()))
            .unwrap();

        let scheduler = scheduler(fetch, store.clone(), sink.clone());
        scheduler.add_job(&job).unwrap();
        wait_until(|| store.saved() == 2).await;
        scheduler.remove_job(&job.id).await;

        assert_eq!(sink.kinds(), vec!["initial_load"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_are_isolated() {
        let failing = ScriptedFetch::new(vec![Err(FetchError::Malformed("bad".into()))]);
        let working = ScriptedFetch::new(vec![Ok(grid(&[&["ok"]]))]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());

        let broken = scheduler(failing, store.clone(), sink.clone());
        let healthy = scheduler(working, store.clone(), sink.clone());

        broken.add_job(&job("broken")).unwrap();
        healthy.add_job(&job("healthy")).unwrap();
        wait_until(|| store.saved() == 1).await;

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, JobId::from("healthy"));

        broken.shutdown().await;
        healthy.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_abandons_blocked_fetch() {
        let fetch = Arc::new(GatedFetch {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            fetch.clone(),
            store.clone(),
            sink.clone(),
            SchedulerConfig {
                fetch_timeout: Duration::from_secs(60),
            },
        );

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        fetch.entered.notified().await;

        tokio::time::timeout(Duration::from_secs(1), scheduler.remove_job(&job.id))
            .await
            .expect("remove_job should not wait for the fetch");

        fetch.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.saved(), 0);
        assert!(sink.kinds().is_empty());
    }

    /// Answers immediately, every time.
    struct InstantFetch;

    #[async_trait]
    impl RemoteFetch for InstantFetch {
        async fn fetch_ranges(
            &self,
            _document: &str,
            _ranges: &[String],
        ) -> std::result::Result<Vec<FetchedRange>, FetchError> {
            Ok(vec![grid(&[&["a"]])])
        }
    }

    /// Takes three seconds per fetch and records when each one started.
    #[derive(Default)]
    struct SlowFetch {
        starts: Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl RemoteFetch for SlowFetch {
        async fn fetch_ranges(
            &self,
            _document: &str,
            _ranges: &[String],
        ) -> std::result::Result<Vec<FetchedRange>, FetchError> {
            self.starts.lock().unwrap().push(tokio::time::Instant::now());
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(vec![grid(&[&["a"]])])
        }
    }

    /// Blocks its thread inside every delivery.
    #[derive(Default)]
    struct SlowSink {
        entered: std::sync::atomic::AtomicBool,
        delivered: AtomicUsize,
    }

    impl NotificationSink for SlowSink {
        fn deliver(&self, _job: &Job, _event: DataEvent) {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_removals_wait_for_the_same_exit() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(SlowSink::default());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(InstantFetch),
            store.clone(),
            sink.clone(),
            SchedulerConfig::default(),
        ));

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        wait_until(|| sink.entered.load(Ordering::SeqCst)).await;

        let first = {
            let scheduler = Arc::clone(&scheduler);
            let id = job.id.clone();
            tokio::spawn(async move { scheduler.remove_job(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Still stopping: the id stays taken
        assert!(scheduler.is_tracking(&job.id));
        assert!(matches!(scheduler.add_job(&job), Err(TrackerError::DuplicateJob(_))));

        scheduler.remove_job(&job.id).await;
        let saved_at_return = store.saved();
        assert_eq!(saved_at_return, 1);
        assert!(!scheduler.is_tracking(&job.id));

        first.await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.saved(), saved_at_return);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);

        scheduler.add_job(&job).unwrap();
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_starts_when_the_cycle_ends() {
        let fetch = Arc::new(SlowFetch::default());
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(fetch.clone(), store, sink);

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        wait_until(|| fetch.starts.lock().unwrap().len() >= 3).await;
        scheduler.remove_job(&job.id).await;

        let starts = fetch.starts.lock().unwrap().clone();
        for pair in starts.windows(2) {
            // three seconds of fetching plus the one second period
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(4), "cycles started {:?} apart", gap);
            assert!(gap < Duration::from_millis(4050), "cycles started {:?} apart", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_from_another_sheet_is_rejected() {
        let mut other_sheet = grid(&[&["wrong"]]);
        other_sheet.sheet_id = 17;

        let fetch = ScriptedFetch::new(vec![Ok(other_sheet), Ok(grid(&[&["right"]]))]);
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(fetch.clone(), store.clone(), sink.clone());

        let job = job("j1");
        scheduler.add_job(&job).unwrap();
        wait_until(|| store.saved() == 1).await;
        scheduler.remove_job(&job.id).await;

        assert_eq!(fetch.calls(), 2);
        assert_eq!(sink.kinds(), vec!["initial_load"]);
        let saved = store.latest(&job.id).unwrap().unwrap();
        assert_eq!(saved.grid, vec![vec!["right".to_string()]]);
    }
}
