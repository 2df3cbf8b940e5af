use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use super::snapshot::CellData;
use super::types::Cell;

const GRID_FIELDS: &str =
    "sheets(properties(sheetId,title),data(startRow,startColumn,rowData(values(formattedValue,note))))";

/// A failed fetch. Always transient from the tracker's point of view: the
/// cycle is dropped and the next one retries.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Content of one requested range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRange {
    /// Numeric id of the sheet the range was read from.
    pub sheet_id: i64,
    /// Absolute address of the first returned cell.
    pub origin: Cell,
    pub rows: Vec<Vec<CellData>>,
}

/// Retrieves current range content from the remote document service.
///
/// Implementations are shared by every running job and must tolerate
/// concurrent calls. They do not need their own deadline: the scheduler
/// bounds every call and drops the future on timeout or cancellation.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    async fn fetch_ranges(&self, document: &str, ranges: &[String]) -> Result<Vec<FetchedRange>, FetchError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpreadsheetResponse {
    #[serde(default)]
    sheets: Vec<SheetResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetResponse {
    #[serde(default)]
    properties: SheetPropertiesResponse,
    #[serde(default)]
    data: Vec<GridDataResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetPropertiesResponse {
    #[serde(default)]
    sheet_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridDataResponse {
    #[serde(default)]
    start_row: u32,
    #[serde(default)]
    start_column: u32,
    #[serde(default)]
    row_data: Vec<RowDataResponse>,
}

#[derive(Debug, Deserialize)]
struct RowDataResponse {
    #[serde(default)]
    values: Vec<CellResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CellResponse {
    formatted_value: Option<String>,
    note: Option<String>,
}

impl GridDataResponse {
    fn into_range(self, sheet_id: i64) -> Result<FetchedRange, FetchError> {
        // Offsets are 0-based on the wire
        let origin = match (self.start_row.checked_add(1), self.start_column.checked_add(1)) {
            (Some(row), Some(column)) => Cell::new(row, column),
            _ => {
                return Err(FetchError::Malformed(format!(
                    "grid offset out of range: row {}, column {}",
                    self.start_row, self.start_column
                )))
            }
        };

        let rows = self
            .row_data
            .into_iter()
            .map(|row| {
                row.values
                    .into_iter()
                    .map(|cell| CellData {
                        text: cell.formatted_value.unwrap_or_default(),
                        note: cell.note,
                    })
                    .collect()
            })
            .collect();

        Ok(FetchedRange { sheet_id, origin, rows })
    }
}

/// Google Sheets v4 client.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl SheetsClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, access_token: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            access_token,
        })
    }

    fn spreadsheet_url(&self, document: &str) -> String {
        format!("{}/v4/spreadsheets/{}", self.base_url, document)
    }
}

#[async_trait]
impl RemoteFetch for SheetsClient {
    async fn fetch_ranges(&self, document: &str, ranges: &[String]) -> Result<Vec<FetchedRange>, FetchError> {
        let mut query: Vec<(&str, &str)> = ranges.iter().map(|r| ("ranges", r.as_str())).collect();
        query.push(("includeGridData", "true"));
        query.push(("fields", GRID_FIELDS));
        if let Some(ref key) = self.api_key {
            query.push(("key", key.as_str()));
        }

        let mut request = self.client.get(self.spreadsheet_url(document)).query(&query);

        if let Some(ref token) = self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        parse_spreadsheet(&body)
    }
}

/// Flatten every grid of every returned sheet, in response order.
fn parse_spreadsheet(body: &str) -> Result<Vec<FetchedRange>, FetchError> {
    let spreadsheet: SpreadsheetResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let mut ranges = Vec::new();
    for sheet in spreadsheet.sheets {
        let sheet_id = sheet.properties.sheet_id;
        for grid in sheet.data {
            ranges.push(grid.into_range(sheet_id)?);
        }
    }

    if ranges.is_empty() {
        return Err(FetchError::Malformed("response contains no grid data".into()));
    }

    Ok(ranges)
}
