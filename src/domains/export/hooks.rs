use crate::domains::export::types::{ExportError, ExportResult, WriterFormat};
use crate::domains::export::units::{ExportSnapshot, TempFile};
use crate::domains::export::writer::SheetWriter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What a before-writing hook may see and touch
pub struct HookContext<'a> {
    writer: &'a dyn SheetWriter,
    temp_file: &'a TempFile,
    pub format: WriterFormat,
    pub export: &'a ExportSnapshot,
}

impl<'a> HookContext<'a> {
    pub fn new(
        writer: &'a dyn SheetWriter,
        temp_file: &'a TempFile,
        format: WriterFormat,
        export: &'a ExportSnapshot,
    ) -> Self {
        Self {
            writer,
            temp_file,
            format,
            export,
        }
    }

    /// Set a document property on the output (title, author, company, ...)
    pub async fn set_property(&self, key: &str, value: &str) -> ExportResult<()> {
        self.writer.set_property(self.temp_file, key, value).await
    }
}

/// Runs once every sheet is closed, immediately before the file is stored.
#[async_trait]
pub trait BeforeWritingHook: Send + Sync {
    async fn before_writing(&self, ctx: &HookContext<'_>) -> ExportResult<()>;
}

/// Hooks by name. Exports refer to hooks by name so units stay serializable.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, Arc<dyn BeforeWritingHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `name`, replacing any previous registration
    pub fn register(&self, name: impl Into<String>, hook: Arc<dyn BeforeWritingHook>) {
        let name = name.into();
        match self.hooks.write() {
            Ok(mut hooks) => {
                if hooks.insert(name.clone(), hook).is_some() {
                    log::warn!("Replacing before-writing hook '{}'", name);
                }
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name, hook);
            }
        }
    }

    pub fn get(&self, name: &str) -> ExportResult<Arc<dyn BeforeWritingHook>> {
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks
            .get(name)
            .cloned()
            .ok_or_else(|| ExportError::HookNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }
}

/// Hook that sets a fixed list of document properties
pub struct DocumentProperties {
    properties: Vec<(String, String)>,
}

impl DocumentProperties {
    pub fn new<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl BeforeWritingHook for DocumentProperties {
    async fn before_writing(&self, ctx: &HookContext<'_>) -> ExportResult<()> {
        for (key, value) in &self.properties {
            ctx.set_property(key, value).await?;
        }
        Ok(())
    }
}
