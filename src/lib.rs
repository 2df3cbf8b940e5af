pub mod config;
pub mod database;
pub mod error;
pub mod sheet;
pub mod tracker;

pub use config::TrackerConfig;
pub use database::{Database, DbError};
pub use error::{Result, TrackerError};

use sheet::SheetsClient;
use std::sync::Arc;
use tracker::{JobRegistry, LogSink, NotificationSink, Scheduler};

/// Wire the database, the Sheets client and a scheduler delivering to `sink`.
pub fn open_registry(config: &TrackerConfig, sink: Arc<dyn NotificationSink>) -> Result<JobRegistry> {
    let db = Arc::new(Database::open(&config.database_path)?);

    let client = SheetsClient::new(
        config.sheets_api_base.clone(),
        config.api_key.clone(),
        config.access_token.clone(),
    )?;

    let scheduler = Scheduler::new(Arc::new(client), db.clone(), sink, config.scheduler_config());

    Ok(JobRegistry::new(db, Arc::new(scheduler)))
}

/// Registry over the configured database that edits job records without
/// running any loops.
pub fn open_detached_registry(config: &TrackerConfig) -> Result<JobRegistry> {
    let db = Arc::new(Database::open(&config.database_path)?);
    Ok(JobRegistry::detached(db))
}

/// Track every enabled job until Ctrl-C, logging each change.
pub async fn run(config: TrackerConfig) -> Result<()> {
    tracing::info!(database = %config.database_path.display(), "Starting sheet tracker");

    let registry = open_registry(&config, Arc::new(LogSink))?;
    registry.resume()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down");
    registry.shutdown().await;

    Ok(())
}
