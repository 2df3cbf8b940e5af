use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::types::{Cell, Offset};
use crate::tracker::JobId;

/// One fetched cell: its displayed text and an optional note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellData {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CellData {
    pub fn text(text: impl Into<String>) -> Self {
        CellData {
            text: text.into(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Immutable capture of a tracked range at one point in time.
///
/// `origin` is the absolute address of the grid's top-left cell and stays
/// fixed for the whole history of a job. Rows may differ in length. Notes
/// are kept sparsely, keyed by local offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub job: JobId,
    pub origin: Cell,
    pub grid: Vec<Vec<String>>,
    #[serde(with = "note_entries")]
    pub notes: BTreeMap<Offset, String>,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        job: JobId,
        origin: Cell,
        grid: Vec<Vec<String>>,
        notes: BTreeMap<Offset, String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            job,
            origin,
            grid,
            notes,
            captured_at,
        }
    }

    /// Split fetched cells into the text grid and the sparse note map.
    pub fn from_cells(job: JobId, origin: Cell, rows: Vec<Vec<CellData>>, captured_at: DateTime<Utc>) -> Self {
        let mut notes = BTreeMap::new();

        let grid = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                row.into_iter()
                    .enumerate()
                    .map(|(j, cell)| {
                        if let Some(note) = cell.note {
                            notes.insert(Offset::new(i as u32, j as u32), note);
                        }
                        cell.text
                    })
                    .collect()
            })
            .collect();

        Snapshot::new(job, origin, grid, notes, captured_at)
    }

    /// `(rows, columns)`; the column count is the longest row.
    pub fn dimensions(&self) -> (usize, usize) {
        let columns = self.grid.iter().map(Vec::len).max().unwrap_or(0);
        (self.grid.len(), columns)
    }

    /// Absolute address of a local offset.
    pub fn cell_at(&self, offset: Offset) -> Cell {
        self.origin + offset
    }

    /// SHA-256 over origin, grid and notes. Equal checksums mean equal content.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.origin.row.to_le_bytes());
        hasher.update(self.origin.column.to_le_bytes());

        for row in &self.grid {
            hasher.update((row.len() as u64).to_le_bytes());
            for text in row {
                hasher.update((text.len() as u64).to_le_bytes());
                hasher.update(text.as_bytes());
            }
        }

        hasher.update([0xff]);
        for (offset, note) in &self.notes {
            hasher.update(offset.row.to_le_bytes());
            hasher.update(offset.column.to_le_bytes());
            hasher.update((note.len() as u64).to_le_bytes());
            hasher.update(note.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

/// Notes serialize as a list of entries since JSON object keys must be strings.
pub(crate) mod note_entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    use crate::sheet::Offset;

    #[derive(Serialize, Deserialize)]
    struct NoteEntry {
        row: u32,
        column: u32,
        note: String,
    }

    pub fn serialize<S: Serializer>(notes: &BTreeMap<Offset, String>, serializer: S) -> Result<S::Ok, S::Error> {
        notes
            .iter()
            .map(|(offset, note)| NoteEntry {
                row: offset.row,
                column: offset.column,
                note: note.clone(),
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<Offset, String>, D::Error> {
        let entries = Vec::<NoteEntry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|e| (Offset::new(e.row, e.column), e.note))
            .collect())
    }
}
