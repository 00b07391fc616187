//! Units of work and the builder that turns chunk descriptors into them.
//!
//! Every unit is a self-contained value: it can be serialized, shipped to a
//! worker, and rebuilt from the same descriptor with an identical result.

use crate::domains::export::planner::{ChunkBounds, ChunkDescriptor};
use crate::domains::export::source::{RowCollection, SerializedQuery, SheetSource};
use crate::domains::export::types::{ExportError, ExportResult, Row, WriterFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

/// Handle to the staging artifact shared by every unit of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempFile {
    pub id: Uuid,
    pub path: PathBuf,
}

/// Serializable view of an export, carried by the chain head and the
/// before-writing hook unit instead of the live definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub title: Option<String>,
    pub sheet_titles: Vec<String>,
    pub before_writing: Option<String>,
}

/// A single step of an export chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "unit")]
pub enum WorkUnit {
    AppendRows {
        sheet_index: usize,
        /// Position of the chunk within its sheet
        chunk: usize,
        temp_file: TempFile,
        format: WriterFormat,
        rows: Vec<Row>,
    },
    AppendQueryPage {
        sheet_index: usize,
        chunk: usize,
        temp_file: TempFile,
        format: WriterFormat,
        query: SerializedQuery,
    },
    CloseSheet {
        sheet_index: usize,
        temp_file: TempFile,
        format: WriterFormat,
    },
    PreFinalizeHook {
        export: ExportSnapshot,
        temp_file: TempFile,
        format: WriterFormat,
    },
    Finalize {
        temp_file: TempFile,
        format: WriterFormat,
        destination: String,
        disk: String,
    },
}

impl WorkUnit {
    /// Short name used in logs and failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            WorkUnit::AppendRows { .. } => "append_rows",
            WorkUnit::AppendQueryPage { .. } => "append_query_page",
            WorkUnit::CloseSheet { .. } => "close_sheet",
            WorkUnit::PreFinalizeHook { .. } => "pre_finalize_hook",
            WorkUnit::Finalize { .. } => "finalize",
        }
    }

    pub fn sheet_index(&self) -> Option<usize> {
        match self {
            WorkUnit::AppendRows { sheet_index, .. }
            | WorkUnit::AppendQueryPage { sheet_index, .. }
            | WorkUnit::CloseSheet { sheet_index, .. } => Some(*sheet_index),
            WorkUnit::PreFinalizeHook { .. } | WorkUnit::Finalize { .. } => None,
        }
    }

    pub fn is_data_unit(&self) -> bool {
        matches!(
            self,
            WorkUnit::AppendRows { .. } | WorkUnit::AppendQueryPage { .. }
        )
    }

    pub fn temp_file(&self) -> &TempFile {
        match self {
            WorkUnit::AppendRows { temp_file, .. }
            | WorkUnit::AppendQueryPage { temp_file, .. }
            | WorkUnit::CloseSheet { temp_file, .. }
            | WorkUnit::PreFinalizeHook { temp_file, .. }
            | WorkUnit::Finalize { temp_file, .. } => temp_file,
        }
    }

    /// Canonical serialized form of the unit.
    pub fn to_bytes(&self) -> ExportResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Hex SHA-256 of the canonical form. Equal units have equal fingerprints,
    /// which lets the writer recognise a redelivered append. Data units carry
    /// their chunk position, so two chunks with equal rows never collide.
    pub fn fingerprint(&self) -> ExportResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes()?);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Build the data unit for one chunk of a sheet.
///
/// Rows are normalized here so that a row which cannot be made transportable
/// fails now, attributed to its sheet and chunk.
pub fn build_unit(
    descriptor: &ChunkDescriptor,
    source: SheetSource<'_>,
    temp_file: &TempFile,
    format: WriterFormat,
) -> ExportResult<WorkUnit> {
    match (descriptor.bounds, source) {
        (ChunkBounds::Rows { start, end }, SheetSource::InMemory(rows)) => Ok(WorkUnit::AppendRows {
            sheet_index: descriptor.sheet_index,
            chunk: descriptor.ordinal,
            temp_file: temp_file.clone(),
            format,
            rows: normalize_rows(descriptor, rows, start, end)?,
        }),
        (ChunkBounds::Page(page), SheetSource::Queryable(query)) => {
            let paged = query.for_page(page.number, page.size);
            // Prove the page survives a serialization boundary before dispatch
            serde_json::to_vec(&paged).map_err(|e| ExportError::Serialization {
                sheet_index: descriptor.sheet_index,
                chunk: descriptor.ordinal,
                message: e.to_string(),
            })?;
            Ok(WorkUnit::AppendQueryPage {
                sheet_index: descriptor.sheet_index,
                chunk: descriptor.ordinal,
                temp_file: temp_file.clone(),
                format,
                query: paged,
            })
        }
        (bounds, _) => Err(ExportError::InvalidConfig(format!(
            "chunk {:?} of sheet {} does not match the sheet's source",
            bounds, descriptor.sheet_index
        ))),
    }
}

fn normalize_rows(
    descriptor: &ChunkDescriptor,
    rows: &RowCollection,
    start: usize,
    end: usize,
) -> ExportResult<Vec<Row>> {
    rows.slice(start..end)
        .iter()
        .enumerate()
        .map(|(offset, row)| {
            row.to_row().map_err(|message| ExportError::Serialization {
                sheet_index: descriptor.sheet_index,
                chunk: descriptor.ordinal,
                message: format!("row {}: {}", start + offset, message),
            })
        })
        .collect()
}
