use crate::domains::export::assembler::ExportChain;
use crate::domains::export::queue_manager::{ChainHandle, ChainQueue};
use crate::domains::export::source::ExportDefinition;
use crate::domains::export::types::{ExportError, ExportResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Something that runs a chain's steps strictly in order, retrying each step
/// under its own policy and halting the chain on a terminal failure.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    async fn submit_chain(&self, chain: ExportChain) -> ExportResult<ChainHandle>;
}

#[async_trait]
impl ExecutionSubstrate for ChainQueue {
    async fn submit_chain(&self, chain: ExportChain) -> ExportResult<ChainHandle> {
        self.enqueue(chain).await
    }
}

/// Hands assembled chains to an execution substrate.
pub struct JobChainDispatcher {
    substrate: Arc<dyn ExecutionSubstrate>,
}

impl JobChainDispatcher {
    pub fn new(substrate: Arc<dyn ExecutionSubstrate>) -> Self {
        Self { substrate }
    }

    /// Submit `chain` as one sequential job. The returned handle represents the
    /// whole chain; it may be awaited or dropped.
    pub async fn dispatch(&self, export: &ExportDefinition, chain: ExportChain) -> ExportResult<ChainHandle> {
        chain.validate()?;
        if chain.head.export.before_writing != export.before_writing {
            return Err(ExportError::InvalidConfig(format!(
                "chain {} was assembled from a different export",
                chain.id
            )));
        }

        let id = chain.id;
        let steps = chain.step_count();
        let handle = self.substrate.submit_chain(chain).await?;
        log::info!("Dispatched export chain {} ({} steps)", id, steps);
        Ok(handle)
    }
}
