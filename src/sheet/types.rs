use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::collections::HashMap;
use std::fmt;
use std::ops::Add;
use std::sync::OnceLock;

use crate::error::TrackerError;

const ROW_PATTERN: &str = r"[1-9][0-9]*";
const COLUMN_PATTERN: &str = r"[A-Z]+";

/// A cell position, 1-based on both axes (`Cell::new(2, 2)` is `B2`).
///
/// Inside span ranges an axis may be `0`, meaning the whole row or column;
/// such cells render without that part (`Cell::new(3, 0)` is `3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub row: u32,
    pub column: u32,
}

/// A 0-based position inside a captured grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub row: u32,
    pub column: u32,
}

impl Offset {
    pub fn new(row: u32, column: u32) -> Self {
        Offset { row, column }
    }
}

impl Cell {
    /// Marker for an unbounded axis inside a span range.
    pub const OPEN: u32 = 0;

    pub fn new(row: u32, column: u32) -> Self {
        Cell { row, column }
    }

    /// Parse an `A1`-style address.
    pub fn parse(value: &str) -> Result<Self, TrackerError> {
        let captures = cell_regex()
            .captures(value)
            .ok_or_else(|| TrackerError::Configuration(format!("Invalid cell address: {}", value)))?;

        Ok(Cell {
            row: parse_row(&captures[2])?,
            column: letters_to_column(&captures[1])?,
        })
    }
}

impl Add<Offset> for Cell {
    type Output = Cell;

    /// Saturates at the last addressable row/column.
    fn add(self, offset: Offset) -> Cell {
        Cell {
            row: self.row.saturating_add(offset.row),
            column: self.column.saturating_add(offset.column),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.column != Cell::OPEN {
            write!(f, "{}", column_to_letters(self.column))?;
        }
        if self.row != Cell::OPEN {
            write!(f, "{}", self.row)?;
        }
        Ok(())
    }
}

/// Convert a 1-based column index to letters (1 -> A, 26 -> Z, 27 -> AA)
pub fn column_to_letters(column: u32) -> String {
    let mut result = String::new();
    let mut n = column;

    while n > 0 {
        n -= 1;
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }

    result
}

/// Convert column letters to a 1-based column index
pub fn letters_to_column(letters: &str) -> Result<u32, TrackerError> {
    letters.bytes().try_fold(0u32, |acc, b| {
        if !b.is_ascii_uppercase() {
            return Err(TrackerError::Configuration(format!("Invalid column: {}", letters)));
        }
        acc.checked_mul(26)
            .and_then(|v| v.checked_add(u32::from(b - b'A') + 1))
            .ok_or_else(|| TrackerError::Configuration(format!("Column out of range: {}", letters)))
    })
}

fn parse_row(value: &str) -> Result<u32, TrackerError> {
    value
        .parse()
        .map_err(|_| TrackerError::Configuration(format!("Row out of range: {}", value)))
}

fn cell_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(&format!("^({})({})$", COLUMN_PATTERN, ROW_PATTERN)).expect("valid cell pattern")
    })
}

fn range_regex() -> &'static Regex {
    static RANGE: OnceLock<Regex> = OnceLock::new();
    RANGE.get_or_init(|| {
        let cell = format!("{}{}", COLUMN_PATTERN, ROW_PATTERN);
        let alternatives = [
            format!("{cell}:{cell}"),
            format!("{ROW_PATTERN}:{ROW_PATTERN}"),
            format!("{COLUMN_PATTERN}:{COLUMN_PATTERN}"),
            cell.clone(),
            ROW_PATTERN.to_string(),
            COLUMN_PATTERN.to_string(),
        ];
        Regex::new(&format!("^(?:{})$", alternatives.join("|"))).expect("valid range pattern")
    })
}

/// A rectangle of cells, normalized so `from` is the top-left corner and
/// `to` the bottom-right one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellRange {
    from: Cell,
    to: Cell,
}

impl CellRange {
    pub fn new(a: Cell, b: Cell) -> Self {
        CellRange {
            from: Cell::new(min(a.row, b.row), min(a.column, b.column)),
            to: Cell::new(max(a.row, b.row), max(a.column, b.column)),
        }
    }

    pub fn from(&self) -> Cell {
        self.from
    }

    pub fn to(&self) -> Cell {
        self.to
    }

    pub fn is_range(value: &str) -> bool {
        range_regex().is_match(value)
    }

    /// Parse `A1`, `A1:B26`, `2:5`, `A:C`, `2` or `C`.
    pub fn parse(value: &str) -> Result<Self, TrackerError> {
        let value = value.trim();
        if !Self::is_range(value) {
            return Err(TrackerError::Configuration(format!("Invalid range: {}", value)));
        }

        match value.split_once(':') {
            Some((left, right)) => Ok(CellRange::new(parse_bound(left)?, parse_bound(right)?)),
            None => {
                let cell = parse_bound(value)?;
                Ok(CellRange::new(cell, cell))
            }
        }
    }
}

/// One side of a range: a full cell, a bare row, or a bare column.
fn parse_bound(value: &str) -> Result<Cell, TrackerError> {
    if cell_regex().is_match(value) {
        Cell::parse(value)
    } else if value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(Cell::new(parse_row(value)?, Cell::OPEN))
    } else {
        Ok(Cell::new(Cell::OPEN, letters_to_column(value)?))
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from, self.to)
    }
}

impl TryFrom<String> for CellRange {
    type Error = TrackerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CellRange::parse(&value)
    }
}

impl From<CellRange> for String {
    fn from(range: CellRange) -> Self {
        range.to_string()
    }
}

/// A single sheet (tab) inside a remote spreadsheet document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSource {
    pub spreadsheet_id: String,
    pub sheet_id: i64,
    #[serde(default)]
    pub sheet_name: String,
}

impl SheetSource {
    pub fn url(&self) -> String {
        format!("https://docs.google.com/spreadsheets/d/{}", self.spreadsheet_id)
    }

    pub fn sheet_url(&self) -> String {
        format!("{}#gid={}", self.url(), self.sheet_id)
    }

    /// Link that opens the sheet with `target` (a cell or range) selected.
    pub fn url_to(&self, target: impl fmt::Display) -> String {
        format!("{}&range={}", self.sheet_url(), target)
    }

    /// Remote range descriptor such as `Sheet1!A1:B2` or `'My sheet'!A:C`.
    pub fn a1_range(&self, range: &CellRange) -> String {
        if self.sheet_name.is_empty() {
            return range.to_string();
        }

        let plain = self
            .sheet_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

        if plain {
            format!("{}!{}", self.sheet_name, range)
        } else {
            format!("'{}'!{}", self.sheet_name.replace('\'', "''"), range)
        }
    }
}

/// Spreadsheet id and fragment arguments extracted from a document URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetUrl {
    pub id: String,
    pub arguments: HashMap<String, String>,
}

impl SheetUrl {
    /// Match docs.google.com spreadsheet URLs, with or without scheme,
    /// `www.`, `/edit`, query string and `#` arguments.
    pub fn parse(url: &str) -> Option<Self> {
        static URL: OnceLock<Regex> = OnceLock::new();
        let pattern = URL.get_or_init(|| {
            Regex::new(
                r"^(?:https?://)?(?:www\.)?docs\.google\.com/spreadsheets/d/([a-zA-Z0-9_-]+)(?:/edit)?(?:\?[^#]*)?(?:#(.*))?$",
            )
            .expect("valid url pattern")
        });

        let captures = pattern.captures(url.trim())?;
        let id = captures[1].to_string();

        let arguments = captures
            .get(2)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split('&')
                    .map(|part| match part.split_once('=') {
                        Some((key, value)) => (key.to_string(), value.to_string()),
                        None => (part.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(SheetUrl { id, arguments })
    }

    /// The `gid` argument, i.e. the numeric sheet id, if present.
    pub fn sheet_id(&self) -> Option<i64> {
        self.arguments.get("gid").and_then(|gid| gid.parse().ok())
    }

    /// The `range` argument, if present and well formed.
    pub fn range(&self) -> Option<CellRange> {
        self.arguments.get("range").and_then(|r| CellRange::parse(r).ok())
    }
}
