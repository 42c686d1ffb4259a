//! Raw price-list tables and the readers that produce them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "quote-source";

/// A single cell as read from the source, before any normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum RawCell {
    Text(String),
    Number(f64),
    #[default]
    Empty,
}

impl RawCell {
    /// Text form of the cell. Blank text counts as absent and whole numbers
    /// render without a fractional part.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(text) => text_or_none(text),
            Self::Number(value) => Some(format_number(*value)),
            Self::Empty => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_text().is_none()
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// The first worksheet of a price list as a plain grid, header rows included.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawTable {
    #[serde(default)]
    pub sheet: Option<String>,
    pub rows: Vec<Vec<RawCell>>,
}

impl RawTable {
    pub fn new(rows: Vec<Vec<RawCell>>) -> Self {
        Self { sheet: None, rows }
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn cell(&self, row: usize, col: usize) -> &RawCell {
        const EMPTY: &RawCell = &RawCell::Empty;
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .unwrap_or(EMPTY)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Anything that can hand over a raw price-list grid.
pub trait TableSource: Send + Sync {
    fn source_id(&self) -> String;
    fn read_table(&self) -> Result<RawTable, SourceError>;
}

/// Reads the first worksheet of an Excel/ODS workbook.
#[derive(Debug, Clone)]
pub struct XlsxSource {
    path: PathBuf,
}

impl XlsxSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSource for XlsxSource {
    fn source_id(&self) -> String {
        self.path.display().to_string()
    }

    fn read_table(&self) -> Result<RawTable, SourceError> {
        let mut workbook = open_workbook_auto(&self.path)
            .with_context(|| format!("opening workbook {}", self.path.display()))?;
        let sheet = workbook.sheet_names().first().cloned();
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| SourceError::Message(format!("{} has no worksheets", self.path.display())))?
            .with_context(|| format!("reading first worksheet of {}", self.path.display()))?;

        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_from_data).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        debug!(path = %self.path.display(), rows = rows.len(), "read worksheet");
        Ok(RawTable { sheet, rows })
    }
}

fn cell_from_data(data: &Data) -> RawCell {
    match data {
        Data::Empty | Data::Error(_) => RawCell::Empty,
        Data::String(text) => RawCell::Text(text.clone()),
        Data::Float(value) => RawCell::Number(*value),
        Data::Int(value) => RawCell::Number(*value as f64),
        other => RawCell::Text(other.to_string()),
    }
}

/// Reads a JSON grid fixture (`{"sheet": ..., "rows": [[...], ...]}`).
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TableSource for FixtureSource {
    fn source_id(&self) -> String {
        self.path.display().to_string()
    }

    fn read_table(&self) -> Result<RawTable, SourceError> {
        Ok(load_raw_fixture(&self.path)?)
    }
}

pub fn load_raw_fixture(path: impl AsRef<Path>) -> Result<RawTable> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Picks a reader from the file extension.
pub fn source_for_path(path: impl AsRef<Path>) -> Result<Box<dyn TableSource>, SourceError> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(Box::new(XlsxSource::new(path))),
        "json" => Ok(Box::new(FixtureSource::new(path))),
        _ => Err(SourceError::Anyhow(anyhow!(
            "unsupported price list format for {}",
            path.display()
        ))),
    }
}
