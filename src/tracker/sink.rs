use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::sheet::{DataEvent, SheetSource};

use super::types::{DeliveryTarget, Job, JobId, OwnerId};

/// One event addressed to the owner of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub job_id: JobId,
    pub owner: OwnerId,
    pub target: DeliveryTarget,
    pub source: SheetSource,
    pub event: DataEvent,
}

impl Notification {
    pub fn new(job: &Job, event: DataEvent) -> Self {
        Notification {
            job_id: job.id.clone(),
            owner: job.owner,
            target: job.target.clone(),
            source: job.source.clone(),
            event,
        }
    }

    /// Link to the changed cell, or to the sheet for range-wide events.
    pub fn link(&self) -> String {
        match self.event.cell() {
            Some(cell) => self.source.url_to(cell),
            None => self.source.sheet_url(),
        }
    }
}

/// Consumer of emitted events.
///
/// Called once per event, in emission order, from the job's own task.
/// Must not block for long: a slow sink delays that job's next cycle.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, job: &Job, event: DataEvent);
}

/// Forwards notifications to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }

    /// Same as [`ChannelSink::new`] with the receiving half as a stream.
    pub fn with_stream() -> (Self, UnboundedReceiverStream<Notification>) {
        let (sink, rx) = Self::new();
        (sink, UnboundedReceiverStream::new(rx))
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, job: &Job, event: DataEvent) {
        if self.tx.send(Notification::new(job, event)).is_err() {
            tracing::debug!(job = %job.id, "Notification receiver dropped");
        }
    }
}

/// Writes every event to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, job: &Job, event: DataEvent) {
        let notification = Notification::new(job, event);
        let link = notification.link();

        match &notification.event {
            DataEvent::InitialLoad { snapshot } => {
                let (rows, columns) = snapshot.dimensions();
                tracing::info!(job = %job.id, rows, columns, link = %link, "Initial load");
            }
            DataEvent::DimensionsChanged { old, new } => {
                tracing::info!(job = %job.id, ?old, ?new, link = %link, "Dimensions changed");
            }
            DataEvent::AddText { cell, text } => {
                tracing::info!(job = %job.id, %cell, text = %text, link = %link, "Text added");
            }
            DataEvent::ModifyText { cell, old, new } => {
                tracing::info!(job = %job.id, %cell, old = %old, new = %new, link = %link, "Text modified");
            }
            DataEvent::RemoveText { cell, text } => {
                tracing::info!(job = %job.id, %cell, text = %text, link = %link, "Text removed");
            }
            DataEvent::AddNote { cell, note } => {
                tracing::info!(job = %job.id, %cell, note = %note, link = %link, "Note added");
            }
            DataEvent::ModifyNote { cell, old, new } => {
                tracing::info!(job = %job.id, %cell, old = %old, new = %new, link = %link, "Note modified");
            }
            DataEvent::RemoveNote { cell, note } => {
                tracing::info!(job = %job.id, %cell, note = %note, link = %link, "Note removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::{Cell, CellRange};
    use crate::tracker::TrackInterval;
    use chrono::Utc;
    use tokio_stream::StreamExt;

    fn job() -> Job {
        Job {
            id: JobId::from("j1"),
            source: SheetSource {
                spreadsheet_id: "doc".into(),
                sheet_id: 5,
                sheet_name: "Sheet1".into(),
            },
            range: CellRange::parse("A1:C3").unwrap(),
            interval: TrackInterval::Period { seconds: 30 },
            enabled: true,
            target: DeliveryTarget { chat_id: -42, name: "team".into() },
            owner: OwnerId(9),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        let job = job();

        sink.deliver(&job, DataEvent::DimensionsChanged { old: (1, 1), new: (2, 1) });
        sink.deliver(&job, DataEvent::AddText { cell: Cell::new(2, 1), text: "x".into() });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.job_id, job.id);
        assert_eq!(first.target.chat_id, -42);
        assert_eq!(first.event.kind(), "dimensions_changed");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.event.cell(), Some(Cell::new(2, 1)));
    }

    #[tokio::test]
    async fn test_channel_sink_stream() {
        let (sink, mut stream) = ChannelSink::with_stream();
        sink.deliver(&job(), DataEvent::RemoveNote { cell: Cell::new(1, 1), note: "n".into() });
        drop(sink);

        let notification = stream.next().await.unwrap();
        assert_eq!(notification.event.kind(), "remove_note");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_delivery_after_receiver_dropped_is_silent() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.deliver(&job(), DataEvent::AddNote { cell: Cell::new(1, 1), note: "n".into() });
    }

    #[test]
    fn test_link_points_at_cell() {
        let job = job();
        let cell_event = Notification::new(&job, DataEvent::AddText { cell: Cell::new(2, 2), text: "b".into() });
        assert_eq!(cell_event.link(), job.source.url_to(Cell::new(2, 2)));

        let range_event = Notification::new(&job, DataEvent::DimensionsChanged { old: (1, 1), new: (1, 2) });
        assert_eq!(range_event.link(), job.source.sheet_url());
    }
}
