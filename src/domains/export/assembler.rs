//! Assembly of an export into its ordered chain of units.
//!
//! Per sheet, in declaration order: the sheet's data units followed by its
//! close unit. After the last sheet come the optional before-writing hook unit
//! and the finalize unit. [`ExportChain::validate`] checks that shape.

use crate::domains::export::planner::ChunkPlanner;
use crate::domains::export::repository::QuerySource;
use crate::domains::export::source::ExportDefinition;
use crate::domains::export::types::{ChunkSize, ExportConfig, ExportError, ExportResult, WriterFormat};
use crate::domains::export::units::{build_unit, ExportSnapshot, TempFile, WorkUnit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Payload executed before the first unit: prepares the staging artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub export: ExportSnapshot,
    pub temp_file: TempFile,
    pub format: WriterFormat,
}

/// Head payload plus the strictly ordered units of one export.
///
/// Positions reported by the execution substrate count the head as 0 and
/// `units[i]` as `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportChain {
    pub id: Uuid,
    pub head: ChainHead,
    pub units: Vec<WorkUnit>,
}

impl ExportChain {
    /// Number of steps including the head
    pub fn step_count(&self) -> usize {
        self.units.len() + 1
    }

    pub fn sheet_count(&self) -> usize {
        self.head.export.sheet_titles.len()
    }

    /// Check the ordering invariants of the chain.
    pub fn validate(&self) -> ExportResult<()> {
        let sheets = self.sheet_count();
        let mut next_sheet = 0usize;
        let mut seen_hook = false;

        let (last, body) = self
            .units
            .split_last()
            .ok_or_else(|| ExportError::InvalidConfig("chain has no units".to_string()))?;
        if !matches!(last, WorkUnit::Finalize { .. }) {
            return Err(ExportError::InvalidConfig(
                "chain must end with a finalize unit".to_string(),
            ));
        }

        for (i, unit) in body.iter().enumerate() {
            if unit.temp_file() != &self.head.temp_file {
                return Err(ExportError::InvalidConfig(format!(
                    "unit {} targets a different staging artifact",
                    i
                )));
            }
            if seen_hook {
                return Err(ExportError::InvalidConfig(
                    "before-writing hook must immediately precede finalize".to_string(),
                ));
            }
            match unit {
                WorkUnit::AppendRows { sheet_index, .. } | WorkUnit::AppendQueryPage { sheet_index, .. } => {
                    if *sheet_index != next_sheet {
                        return Err(ExportError::InvalidConfig(format!(
                            "data unit for sheet {} found while sheet {} is open",
                            sheet_index, next_sheet
                        )));
                    }
                }
                WorkUnit::CloseSheet { sheet_index, .. } => {
                    if *sheet_index != next_sheet {
                        return Err(ExportError::InvalidConfig(format!(
                            "sheet {} closed out of order",
                            sheet_index
                        )));
                    }
                    next_sheet += 1;
                }
                WorkUnit::PreFinalizeHook { .. } => seen_hook = true,
                WorkUnit::Finalize { .. } => {
                    return Err(ExportError::InvalidConfig(
                        "finalize unit must be last".to_string(),
                    ));
                }
            }
        }

        if next_sheet != sheets {
            return Err(ExportError::InvalidConfig(format!(
                "{} of {} sheets closed",
                next_sheet, sheets
            )));
        }
        if seen_hook != self.head.export.before_writing.is_some() {
            return Err(ExportError::InvalidConfig(
                "hook unit does not match the export's before-writing declaration".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the finalize unit should put the result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTarget {
    pub destination: String,
    pub disk: String,
}

impl ChainTarget {
    pub fn new(destination: impl Into<String>, disk: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            disk: disk.into(),
        }
    }
}

/// Builds [`ExportChain`]s from export definitions.
pub struct SheetPipelineAssembler {
    query_source: Arc<dyn QuerySource>,
    chunk_size: ChunkSize,
    empty_query_emits_page: bool,
}

impl SheetPipelineAssembler {
    pub fn new(query_source: Arc<dyn QuerySource>, config: &ExportConfig) -> Self {
        Self {
            query_source,
            chunk_size: config.chunk_size,
            empty_query_emits_page: config.empty_query_emits_page,
        }
    }

    /// Same assembler with a per-call chunk size
    pub fn with_chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Snapshot of the parts of an export that travel with the chain
    pub fn snapshot(export: &ExportDefinition) -> ExportResult<ExportSnapshot> {
        Ok(ExportSnapshot {
            title: export.title.clone(),
            sheet_titles: export.sheet_titles()?,
            before_writing: export.before_writing.clone(),
        })
    }

    /// Assemble the full chain. Any configuration or serialization error is
    /// returned here, before anything is dispatched.
    pub async fn assemble(
        &self,
        export: &ExportDefinition,
        temp_file: &TempFile,
        format: WriterFormat,
        target: &ChainTarget,
    ) -> ExportResult<ExportChain> {
        let sheets = export.sheets();
        if sheets.len() > 1 && !format.supports_multiple_sheets() {
            return Err(ExportError::InvalidConfig(format!(
                "{} output cannot hold {} sheets",
                format.file_extension(),
                sheets.len()
            )));
        }

        // Resolve every sheet first so a bad definition never costs a count query
        let sources = sheets
            .iter()
            .enumerate()
            .map(|(index, sheet)| sheet.resolve(index))
            .collect::<ExportResult<Vec<_>>>()?;
        let export_snapshot = Self::snapshot(export)?;

        let planner = ChunkPlanner::new(
            self.query_source.as_ref(),
            self.chunk_size,
            self.empty_query_emits_page,
        );

        let mut units = Vec::new();
        for (sheet_index, source) in sources.into_iter().enumerate() {
            let descriptors = planner.plan(sheet_index, source).await?;
            log::debug!(
                "Sheet {} planned into {} chunks of at most {} rows",
                sheet_index,
                descriptors.len(),
                self.chunk_size.get()
            );
            for descriptor in &descriptors {
                units.push(build_unit(descriptor, source, temp_file, format)?);
            }
            units.push(WorkUnit::CloseSheet {
                sheet_index,
                temp_file: temp_file.clone(),
                format,
            });
        }

        if export.declares_before_writing() {
            units.push(WorkUnit::PreFinalizeHook {
                export: export_snapshot.clone(),
                temp_file: temp_file.clone(),
                format,
            });
        }

        units.push(WorkUnit::Finalize {
            temp_file: temp_file.clone(),
            format,
            destination: target.destination.clone(),
            disk: target.disk.clone(),
        });

        let chain = ExportChain {
            id: temp_file.id,
            head: ChainHead {
                export: export_snapshot,
                temp_file: temp_file.clone(),
                format,
            },
            units,
        };
        chain.validate()?;

        log::info!(
            "Assembled export chain {} with {} units over {} sheets",
            chain.id,
            chain.units.len(),
            chain.sheet_count()
        );
        Ok(chain)
    }
}
