use crate::domains::export::types::*;
use crate::domains::export::units::{ExportSnapshot, TempFile};
use crate::domains::export::writers::{csv_writer, xlsx_writer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Spreadsheet writer used by the units of a chain.
///
/// Every operation addresses the staging artifact through its [`TempFile`]
/// handle, so consecutive units may run on different workers.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    /// Allocate a fresh staging artifact. One handle per call.
    async fn create_temp_file(&self) -> ExportResult<TempFile>;

    /// (Re)initialize the artifact with the export's sheet list
    async fn open(&self, temp_file: &TempFile, export: &ExportSnapshot) -> ExportResult<()>;

    /// Append rows to a sheet. `unit_key` identifies the delivering unit so
    /// that a redelivered append is not written twice.
    async fn append_rows(
        &self,
        temp_file: &TempFile,
        sheet_index: usize,
        unit_key: &str,
        rows: &[Row],
    ) -> ExportResult<()>;

    async fn close_sheet(&self, temp_file: &TempFile, sheet_index: usize) -> ExportResult<()>;

    /// Record a document property (title, author, ...)
    async fn set_property(&self, temp_file: &TempFile, key: &str, value: &str) -> ExportResult<()>;

    /// Render the artifact into `format`. Fails unless every sheet is closed.
    async fn render(&self, temp_file: &TempFile, format: WriterFormat) -> ExportResult<RenderedFile>;

    /// Remove the artifact and anything rendered from it
    async fn discard(&self, temp_file: &TempFile) -> ExportResult<()>;
}

/// A completed output file, ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub format: WriterFormat,
    pub rows_written: usize,
}

/// One line of the staging artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "record")]
pub enum StagedRecord {
    Open {
        title: Option<String>,
        sheet_titles: Vec<String>,
    },
    Rows {
        sheet_index: usize,
        unit_key: String,
        rows: Vec<Row>,
    },
    CloseSheet {
        sheet_index: usize,
    },
    Property {
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedSheet {
    pub title: String,
    pub rows: Vec<Row>,
    pub closed: bool,
}

/// In-memory view of a staging artifact, as replayed from disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedWorkbook {
    pub title: Option<String>,
    pub sheets: Vec<StagedSheet>,
    pub properties: BTreeMap<String, String>,
}

impl StagedWorkbook {
    /// Replay staged records in order.
    ///
    /// Duplicate appends (same unit key) are skipped. A line that does not
    /// decode is a torn write from a worker that died mid-append; the retried
    /// unit wrote a complete copy, so the torn line is skipped.
    pub fn replay(contents: &str) -> ExportResult<Self> {
        let mut workbook: Option<StagedWorkbook> = None;
        let mut seen_units = HashSet::new();
        let lines = contents.lines().filter(|l| !l.trim().is_empty());

        for (i, line) in lines.enumerate() {
            let record: StagedRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Skipping torn staging record {}: {}", i, e);
                    continue;
                }
            };

            match record {
                StagedRecord::Open { title, sheet_titles } => {
                    workbook = Some(StagedWorkbook {
                        title,
                        sheets: sheet_titles
                            .into_iter()
                            .map(|title| StagedSheet {
                                title,
                                ..Default::default()
                            })
                            .collect(),
                        properties: BTreeMap::new(),
                    });
                    seen_units.clear();
                }
                StagedRecord::Rows {
                    sheet_index,
                    unit_key,
                    rows,
                } => {
                    let book = Self::opened(&mut workbook)?;
                    if !seen_units.insert(unit_key.clone()) {
                        log::debug!("Skipping redelivered append {}", unit_key);
                        continue;
                    }
                    let sheet = book.sheet_mut(sheet_index)?;
                    if sheet.closed {
                        return Err(ExportError::Render(format!(
                            "rows appended to sheet {} after it was closed",
                            sheet_index
                        )));
                    }
                    sheet.rows.extend(rows);
                }
                StagedRecord::CloseSheet { sheet_index } => {
                    Self::opened(&mut workbook)?.sheet_mut(sheet_index)?.closed = true;
                }
                StagedRecord::Property { key, value } => {
                    Self::opened(&mut workbook)?.properties.insert(key, value);
                }
            }
        }

        workbook.ok_or_else(|| ExportError::Render("staging artifact was never opened".to_string()))
    }

    fn opened(workbook: &mut Option<StagedWorkbook>) -> ExportResult<&mut StagedWorkbook> {
        workbook
            .as_mut()
            .ok_or_else(|| ExportError::Render("staging artifact was never opened".to_string()))
    }

    fn sheet_mut(&mut self, sheet_index: usize) -> ExportResult<&mut StagedSheet> {
        let count = self.sheets.len();
        self.sheets.get_mut(sheet_index).ok_or_else(|| {
            ExportError::Render(format!(
                "sheet {} is out of range ({} sheets)",
                sheet_index, count
            ))
        })
    }

    /// Error unless every sheet has been closed
    pub fn ensure_complete(&self) -> ExportResult<()> {
        match self.sheets.iter().position(|s| !s.closed) {
            Some(index) => Err(ExportError::Render(format!("sheet {} was never closed", index))),
            None => Ok(()),
        }
    }

    pub fn total_rows(&self) -> usize {
        self.sheets.iter().map(|s| s.rows.len()).sum()
    }
}

/// File-backed writer that stages units as JSON lines and renders on demand.
pub struct StagingWriter {
    root: PathBuf,
}

impl StagingWriter {
    /// Creates a writer staging under `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn rendered_path(temp_file: &TempFile, format: WriterFormat) -> PathBuf {
        temp_file
            .path
            .with_extension(format!("rendered.{}", format.file_extension()))
    }

    async fn append_record(&self, temp_file: &TempFile, record: &StagedRecord) -> ExportResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&temp_file.path)
            .await
            .map_err(|e| ExportError::Io(format!("{}: {}", temp_file.path.display(), e)))?;

        // Terminate a torn line left by an interrupted append
        let len = file.metadata().await?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.insert(0, b'\n');
            }
        }
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load(&self, temp_file: &TempFile) -> ExportResult<StagedWorkbook> {
        let bytes = tokio::fs::read(&temp_file.path)
            .await
            .map_err(|e| ExportError::Io(format!("{}: {}", temp_file.path.display(), e)))?;
        // A torn write may split a multi-byte character
        StagedWorkbook::replay(&String::from_utf8_lossy(&bytes))
    }
}

#[async_trait]
impl SheetWriter for StagingWriter {
    async fn create_temp_file(&self) -> ExportResult<TempFile> {
        let id = Uuid::new_v4();
        let path = self.root.join(format!("{}.staging.jsonl", id));
        tokio::fs::File::create(&path).await?;
        log::debug!("Created staging artifact {}", path.display());
        Ok(TempFile { id, path })
    }

    async fn open(&self, temp_file: &TempFile, export: &ExportSnapshot) -> ExportResult<()> {
        let record = StagedRecord::Open {
            title: export.title.clone(),
            sheet_titles: export.sheet_titles.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        // Truncates: a retried head starts from a clean artifact
        tokio::fs::write(&temp_file.path, line).await?;
        Ok(())
    }

    async fn append_rows(
        &self,
        temp_file: &TempFile,
        sheet_index: usize,
        unit_key: &str,
        rows: &[Row],
    ) -> ExportResult<()> {
        self.append_record(
            temp_file,
            &StagedRecord::Rows {
                sheet_index,
                unit_key: unit_key.to_string(),
                rows: rows.to_vec(),
            },
        )
        .await
    }

    async fn close_sheet(&self, temp_file: &TempFile, sheet_index: usize) -> ExportResult<()> {
        self.append_record(temp_file, &StagedRecord::CloseSheet { sheet_index })
            .await
    }

    async fn set_property(&self, temp_file: &TempFile, key: &str, value: &str) -> ExportResult<()> {
        self.append_record(
            temp_file,
            &StagedRecord::Property {
                key: key.to_string(),
                value: value.to_string(),
            },
        )
        .await
    }

    async fn render(&self, temp_file: &TempFile, format: WriterFormat) -> ExportResult<RenderedFile> {
        let workbook = self.load(temp_file).await?;
        workbook.ensure_complete()?;

        let out_path = Self::rendered_path(temp_file, format);
        let rows_written = workbook.total_rows();
        let target = out_path.clone();

        tokio::task::spawn_blocking(move || match format {
            WriterFormat::Csv {
                delimiter,
                quote_char,
            } => csv_writer::render_csv(&workbook, delimiter, quote_char, &target),
            WriterFormat::Xlsx => xlsx_writer::render_xlsx(&workbook, &target),
        })
        .await
        .map_err(|e| ExportError::Render(format!("render task failed: {}", e)))??;

        log::debug!(
            "Rendered {} rows from {} into {}",
            rows_written,
            temp_file.path.display(),
            out_path.display()
        );

        Ok(RenderedFile {
            path: out_path,
            format,
            rows_written,
        })
    }

    async fn discard(&self, temp_file: &TempFile) -> ExportResult<()> {
        let mut targets = vec![temp_file.path.clone()];
        targets.push(Self::rendered_path(temp_file, WriterFormat::Xlsx));
        targets.push(Self::rendered_path(temp_file, WriterFormat::csv()));

        for path in targets {
            match tokio::fs::remove_file(&path).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
