use crate::domains::export::assembler::{ChainHead, ExportChain};
use crate::domains::export::hooks::{HookContext, HookRegistry};
use crate::domains::export::queue_manager::UnitProcessor;
use crate::domains::export::repository::QuerySource;
use crate::domains::export::storage::StorageTarget;
use crate::domains::export::types::{ExportError, ExportResult};
use crate::domains::export::units::WorkUnit;
use crate::domains::export::writer::SheetWriter;
use async_trait::async_trait;
use std::sync::Arc;

/// Executes chain steps against the writer, query source, storage and hooks.
pub struct ExportUnitExecutor {
    writer: Arc<dyn SheetWriter>,
    query_source: Arc<dyn QuerySource>,
    storage: Arc<dyn StorageTarget>,
    hooks: Arc<HookRegistry>,
}

impl ExportUnitExecutor {
    pub fn new(
        writer: Arc<dyn SheetWriter>,
        query_source: Arc<dyn QuerySource>,
        storage: Arc<dyn StorageTarget>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            writer,
            query_source,
            storage,
            hooks,
        }
    }
}

#[async_trait]
impl UnitProcessor for ExportUnitExecutor {
    async fn process_head(&self, head: &ChainHead) -> ExportResult<()> {
        self.writer.open(&head.temp_file, &head.export).await
    }

    async fn process_unit(&self, unit: &WorkUnit) -> ExportResult<()> {
        match unit {
            WorkUnit::AppendRows {
                sheet_index,
                temp_file,
                rows,
                ..
            } => {
                let key = unit.fingerprint()?;
                self.writer
                    .append_rows(temp_file, *sheet_index, &key, rows)
                    .await
            }
            WorkUnit::AppendQueryPage {
                sheet_index,
                temp_file,
                query,
                ..
            } => {
                let key = unit.fingerprint()?;
                let rows = self.query_source.fetch_page(query).await?;
                log::debug!(
                    "Sheet {} page {:?}: {} rows",
                    sheet_index,
                    query.page.map(|p| p.number),
                    rows.len()
                );
                self.writer
                    .append_rows(temp_file, *sheet_index, &key, &rows)
                    .await
            }
            WorkUnit::CloseSheet {
                sheet_index,
                temp_file,
                ..
            } => self.writer.close_sheet(temp_file, *sheet_index).await,
            WorkUnit::PreFinalizeHook {
                export,
                temp_file,
                format,
            } => {
                let name = export.before_writing.as_deref().ok_or_else(|| {
                    ExportError::InvalidConfig("hook unit for an export without a hook".to_string())
                })?;
                let hook = self.hooks.get(name)?;
                let ctx = HookContext::new(self.writer.as_ref(), temp_file, *format, export);
                hook.before_writing(&ctx)
                    .await
                    .map_err(|e| ExportError::HookFailed {
                        name: name.to_string(),
                        message: e.to_string(),
                    })
            }
            WorkUnit::Finalize {
                temp_file,
                format,
                destination,
                disk,
            } => {
                if !self.storage.has_disk(disk) {
                    return Err(ExportError::InvalidConfig(format!("unknown disk '{}'", disk)));
                }
                let rendered = self.writer.render(temp_file, *format).await?;
                self.storage.store(&rendered, destination, disk).await?;
                // The staging artifact is consumed; nothing may reference it now
                if let Err(e) = self.writer.discard(temp_file).await {
                    log::warn!("Failed to discard staging artifact {}: {}", temp_file.path.display(), e);
                }
                Ok(())
            }
        }
    }

    async fn chain_abandoned(&self, chain: &ExportChain) {
        log::warn!(
            "Export chain {} abandoned; staging artifact kept at {}",
            chain.id,
            chain.head.temp_file.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::repository::tests::seeded_pool;
    use crate::domains::export::repository::SqliteQuerySource;
    use crate::domains::export::source::SerializedQuery;
    use crate::domains::export::storage::LocalDiskStorage;
    use crate::domains::export::types::WriterFormat;
    use crate::domains::export::units::{ExportSnapshot, TempFile};
    use crate::domains::export::writer::{StagedWorkbook, StagingWriter};
    use tempfile::TempDir;

    struct Fixture {
        _staging: TempDir,
        disk: TempDir,
        writer: Arc<StagingWriter>,
        executor: ExportUnitExecutor,
    }

    async fn fixture(hooks: HookRegistry) -> Fixture {
        let staging = TempDir::new().unwrap();
        let disk = TempDir::new().unwrap();
        let writer = Arc::new(StagingWriter::new(staging.path()).unwrap());
        let storage = Arc::new(LocalDiskStorage::new("local", disk.path()).unwrap());
        let source = Arc::new(SqliteQuerySource::new(seeded_pool(5).await));
        let executor = ExportUnitExecutor::new(writer.clone(), source, storage, Arc::new(hooks));
        Fixture {
            _staging: staging,
            disk,
            writer,
            executor,
        }
    }

    fn head(temp_file: &TempFile, before_writing: Option<&str>) -> ChainHead {
        ChainHead {
            export: ExportSnapshot {
                title: None,
                sheet_titles: vec!["Orders".to_string()],
                before_writing: before_writing.map(str::to_string),
            },
            temp_file: temp_file.clone(),
            format: WriterFormat::csv(),
        }
    }

    async fn staged(temp_file: &TempFile) -> StagedWorkbook {
        let contents = tokio::fs::read_to_string(&temp_file.path).await.unwrap();
        StagedWorkbook::replay(&contents).unwrap()
    }

    #[tokio::test]
    async fn test_query_page_is_fetched_at_execution() {
        let fx = fixture(HookRegistry::new()).await;
        let temp = fx.writer.create_temp_file().await.unwrap();
        fx.executor.process_head(&head(&temp, None)).await.unwrap();

        let unit = WorkUnit::AppendQueryPage {
            sheet_index: 0,
            chunk: 1,
            temp_file: temp.clone(),
            format: WriterFormat::csv(),
            query: SerializedQuery::table("orders").select(["id"]).for_page(2, 2),
        };
        fx.executor.process_unit(&unit).await.unwrap();
        // redelivery of the same unit
        fx.executor.process_unit(&unit).await.unwrap();

        let book = staged(&temp).await;
        assert_eq!(
            book.sheets[0].rows,
            vec![vec![serde_json::json!(3)], vec![serde_json::json!(4)]]
        );
    }

    #[tokio::test]
    async fn test_missing_hook_fails_the_unit() {
        let fx = fixture(HookRegistry::new()).await;
        let temp = fx.writer.create_temp_file().await.unwrap();
        let head = head(&temp, Some("stamp"));
        fx.executor.process_head(&head).await.unwrap();

        let unit = WorkUnit::PreFinalizeHook {
            export: head.export.clone(),
            temp_file: temp.clone(),
            format: WriterFormat::csv(),
        };
        let err = fx.executor.process_unit(&unit).await.unwrap_err();
        assert_eq!(err, ExportError::HookNotRegistered("stamp".to_string()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_finalize_stores_and_discards() {
        let fx = fixture(HookRegistry::new()).await;
        let temp = fx.writer.create_temp_file().await.unwrap();
        fx.executor.process_head(&head(&temp, None)).await.unwrap();

        let close = WorkUnit::CloseSheet {
            sheet_index: 0,
            temp_file: temp.clone(),
            format: WriterFormat::csv(),
        };
        let finalize = WorkUnit::Finalize {
            temp_file: temp.clone(),
            format: WriterFormat::csv(),
            destination: "exports/orders.csv".to_string(),
            disk: "local".to_string(),
        };

        // finalize before the sheet is closed must not produce output
        assert!(fx.executor.process_unit(&finalize).await.is_err());
        assert!(!fx.disk.path().join("exports/orders.csv").exists());

        fx.executor.process_unit(&close).await.unwrap();
        fx.executor.process_unit(&finalize).await.unwrap();
        assert!(fx.disk.path().join("exports/orders.csv").exists());
        assert!(!temp.path.exists());
    }

    #[tokio::test]
    async fn test_finalize_rejects_unknown_disk() {
        let fx = fixture(HookRegistry::new()).await;
        let temp = fx.writer.create_temp_file().await.unwrap();
        let finalize = WorkUnit::Finalize {
            temp_file: temp.clone(),
            format: WriterFormat::Xlsx,
            destination: "out.xlsx".to_string(),
            disk: "s3".to_string(),
        };
        assert!(matches!(
            fx.executor.process_unit(&finalize).await,
            Err(ExportError::InvalidConfig(_))
        ));
    }
}
