use serde::{Deserialize, Serialize};

use super::snapshot::Snapshot;
use super::types::Cell;

/// A change observed in a tracked range.
///
/// Cell-addressed variants always carry the absolute address
/// (snapshot origin plus local offset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataEvent {
    /// First capture of a job; there is nothing to compare against.
    InitialLoad { snapshot: Box<Snapshot> },
    DimensionsChanged { old: (usize, usize), new: (usize, usize) },
    AddText { cell: Cell, text: String },
    ModifyText { cell: Cell, old: String, new: String },
    RemoveText { cell: Cell, text: String },
    AddNote { cell: Cell, note: String },
    ModifyNote { cell: Cell, old: String, new: String },
    RemoveNote { cell: Cell, note: String },
}

impl DataEvent {
    /// The affected cell, for cell-addressed events.
    pub fn cell(&self) -> Option<Cell> {
        match self {
            DataEvent::InitialLoad { .. } | DataEvent::DimensionsChanged { .. } => None,
            DataEvent::AddText { cell, .. }
            | DataEvent::ModifyText { cell, .. }
            | DataEvent::RemoveText { cell, .. }
            | DataEvent::AddNote { cell, .. }
            | DataEvent::ModifyNote { cell, .. }
            | DataEvent::RemoveNote { cell, .. } => Some(*cell),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DataEvent::InitialLoad { .. } => "initial_load",
            DataEvent::DimensionsChanged { .. } => "dimensions_changed",
            DataEvent::AddText { .. } => "add_text",
            DataEvent::ModifyText { .. } => "modify_text",
            DataEvent::RemoveText { .. } => "remove_text",
            DataEvent::AddNote { .. } => "add_note",
            DataEvent::ModifyNote { .. } => "modify_note",
            DataEvent::RemoveNote { .. } => "remove_note",
        }
    }
}
