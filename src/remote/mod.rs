//! Remote tabular mirror
//!
//! The mirror is a spreadsheet-like service addressed by a target id holding
//! named sheets. The sync executor only ever needs four calls, captured by
//! [`RemoteMirror`].

#[cfg(feature = "sheets")]
pub mod auth;
mod memory;
#[cfg(feature = "sheets")]
mod sheets;

pub use memory::{MemoryMirror, MirrorCall, WriteRecord};
#[cfg(feature = "sheets")]
pub use sheets::SheetsClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::CellValue;

/// What the mirror reports about a target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_id: String,
    pub title: Option<String>,
    pub sheets: Vec<String>,
}

impl TargetInfo {
    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheets.iter().any(|s| s == name)
    }
}

/// A cell range on one sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A1Range {
    /// Every cell of the sheet
    Whole,
    /// `A1` through the given row/column count
    Block { rows: usize, cols: usize },
}

impl A1Range {
    /// Smallest block covering the given rows
    pub fn covering(rows: &[Vec<CellValue>]) -> Self {
        let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
        A1Range::Block {
            rows: rows.len().max(1),
            cols: cols.max(1),
        }
    }

    /// Range in A1 notation qualified by sheet name, e.g. `'Runs'!A1:C4`
    pub fn qualified(&self, sheet: &str) -> String {
        let sheet = quote_sheet(sheet);
        match self {
            A1Range::Whole => sheet,
            A1Range::Block { rows, cols } => {
                format!("{}!A1:{}{}", sheet, column_letter(*cols), rows)
            }
        }
    }
}

/// Sheet names are always quoted; embedded quotes are doubled
fn quote_sheet(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

/// 1-based column index to letters: 1 → A, 26 → Z, 27 → AA
pub fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Calls the sync executor makes against the remote mirror.
///
/// Implementations report failures as [`crate::MirrorError::Remote`] with a
/// kind so callers can tell retryable from permanent errors. Creating a sheet
/// that already exists must fail with `AlreadyExists`.
#[async_trait]
pub trait RemoteMirror: Send + Sync {
    async fn get_target(&self, target_id: &str) -> Result<TargetInfo>;

    async fn create_sheet(&self, target_id: &str, name: &str) -> Result<()>;

    async fn clear_range(&self, target_id: &str, sheet: &str, range: A1Range) -> Result<()>;

    async fn write_range(
        &self,
        target_id: &str,
        sheet: &str,
        range: A1Range,
        rows: &[Vec<CellValue>],
    ) -> Result<()>;
}
