//! Tracked-range domain: addressing, snapshots, change events, the diff
//! engine and the remote fetch seam.

pub mod types;
pub mod snapshot;
pub mod event;
pub mod compare;
pub mod api;

// Re-export commonly used types and functions
pub use types::*;
pub use snapshot::{CellData, Snapshot};
pub use event::DataEvent;
pub use compare::{changes_since, compare, OriginMismatch};
pub use api::{FetchError, FetchedRange, RemoteFetch, SheetsClient};
