//! Diff engine: turns two captures of the same range into an ordered
//! list of [`DataEvent`]s.
//!
//! Output order is fixed:
//! 1. at most one `DimensionsChanged`
//! 2. text events for the overlapping region, row-major
//! 3. note events: modified, then removed, then added, each row-major

use thiserror::Error;

use super::event::DataEvent;
use super::snapshot::Snapshot;
use super::types::{Cell, Offset};

/// The two snapshots are anchored at different cells and cannot be compared.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot compare snapshots anchored at {old} and {new}")]
pub struct OriginMismatch {
    pub old: Cell,
    pub new: Cell,
}

/// Compare `old` against `new`.
pub fn compare(old: &Snapshot, new: &Snapshot) -> Result<Vec<DataEvent>, OriginMismatch> {
    if old.origin != new.origin {
        return Err(OriginMismatch {
            old: old.origin,
            new: new.origin,
        });
    }

    let mut events = Vec::new();

    let old_dim = old.dimensions();
    let new_dim = new.dimensions();
    if old_dim != new_dim {
        events.push(DataEvent::DimensionsChanged {
            old: old_dim,
            new: new_dim,
        });
    }

    for (i, (old_row, new_row)) in old.grid.iter().zip(&new.grid).enumerate() {
        for (j, (old_text, new_text)) in old_row.iter().zip(new_row).enumerate() {
            if old_text == new_text {
                continue;
            }

            let cell = new.cell_at(Offset::new(i as u32, j as u32));
            let event = if old_text.is_empty() {
                DataEvent::AddText {
                    cell,
                    text: new_text.clone(),
                }
            } else if new_text.is_empty() {
                DataEvent::RemoveText {
                    cell,
                    text: old_text.clone(),
                }
            } else {
                DataEvent::ModifyText {
                    cell,
                    old: old_text.clone(),
                    new: new_text.clone(),
                }
            };
            events.push(event);
        }
    }

    for (offset, old_note) in &old.notes {
        if let Some(new_note) = new.notes.get(offset) {
            if old_note != new_note {
                events.push(DataEvent::ModifyNote {
                    cell: new.cell_at(*offset),
                    old: old_note.clone(),
                    new: new_note.clone(),
                });
            }
        }
    }

    for (offset, old_note) in &old.notes {
        if !new.notes.contains_key(offset) {
            events.push(DataEvent::RemoveNote {
                cell: new.cell_at(*offset),
                note: old_note.clone(),
            });
        }
    }

    for (offset, new_note) in &new.notes {
        if !old.notes.contains_key(offset) {
            events.push(DataEvent::AddNote {
                cell: new.cell_at(*offset),
                note: new_note.clone(),
            });
        }
    }

    Ok(events)
}

/// Events for a fresh capture given the job's baseline, if any.
///
/// Without a baseline the result is a single `InitialLoad`.
pub fn changes_since(baseline: Option<&Snapshot>, new: &Snapshot) -> Result<Vec<DataEvent>, OriginMismatch> {
    match baseline {
        Some(old) => compare(old, new),
        None => Ok(vec![DataEvent::InitialLoad {
            snapshot: Box::new(new.clone()),
        }]),
    }
}
