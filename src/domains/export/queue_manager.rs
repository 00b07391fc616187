use crate::domains::export::assembler::{ChainHead, ExportChain};
use crate::domains::export::types::*;
use crate::domains::export::units::WorkUnit;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

/// Chains accepted but not yet started, beyond which `enqueue` refuses work
pub const DEFAULT_QUEUE_LIMIT: usize = 100;

/// Executes the steps of a chain. Called for one step at a time, never
/// concurrently for the same chain.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    async fn process_head(&self, head: &ChainHead) -> ExportResult<()>;

    async fn process_unit(&self, unit: &WorkUnit) -> ExportResult<()>;

    /// Called once when a chain stops before finalize (failure or cancel)
    async fn chain_abandoned(&self, _chain: &ExportChain) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainStatus {
    Queued,
    /// Executing step `position` (0 is the head)
    Running { position: usize },
    Completed,
    Failed(ExportError),
    Cancelled,
}

impl ChainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChainStatus::Completed | ChainStatus::Failed(_) | ChainStatus::Cancelled
        )
    }
}

/// Attempts and backoff for a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            max_attempts: config.unit_max_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }

    /// Linear backoff before attempt `attempt + 1`
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExportConfig::default())
    }
}

/// Handle for tracking a dispatched chain
#[derive(Debug, Clone)]
pub struct ChainHandle {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    status_receiver: watch::Receiver<ChainStatus>,
    status_sender: Arc<watch::Sender<ChainStatus>>,
    cancelled: Arc<AtomicBool>,
}

impl ChainHandle {
    pub fn status(&self) -> ChainStatus {
        self.status_receiver.borrow().clone()
    }

    /// Wait until the chain completes, fails or is cancelled.
    pub async fn wait_for_completion(&mut self) -> ExportResult<()> {
        loop {
            match &*self.status_receiver.borrow_and_update() {
                ChainStatus::Completed => return Ok(()),
                ChainStatus::Failed(err) => return Err(err.clone()),
                ChainStatus::Cancelled => return Err(ExportError::Cancelled),
                _ => {}
            }
            self.status_receiver
                .changed()
                .await
                .map_err(|_| ExportError::ChannelClosed)?;
        }
    }

    /// Stop the chain. A queued chain never runs any step; a running chain
    /// stops before its next step. Completed steps are not rolled back.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let cancelled_now = self.status_sender.send_if_modified(|status| {
            if matches!(status, ChainStatus::Queued) {
                *status = ChainStatus::Cancelled;
                true
            } else {
                false
            }
        });
        if cancelled_now {
            log::warn!("Export chain {} cancelled before start", self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct QueuedChain {
    chain: ExportChain,
    status: Arc<watch::Sender<ChainStatus>>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub total_capacity: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// In-process execution substrate: runs up to `max_concurrent` chains at a
/// time, each strictly step by step.
pub struct ChainQueue {
    queue: Arc<Mutex<VecDeque<QueuedChain>>>,
    active_chains: Arc<AtomicUsize>,
    max_concurrent: usize,
    queue_limit: usize,
    semaphore: Arc<Semaphore>,
    processor_running: Arc<Mutex<bool>>,
    processor: Weak<dyn UnitProcessor>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
}

impl ChainQueue {
    pub fn new(processor: Weak<dyn UnitProcessor>, config: &ExportConfig) -> Self {
        let max_concurrent = config.max_concurrent_chains.max(1);
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            active_chains: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            processor_running: Arc::new(Mutex::new(false)),
            processor,
            retry: RetryPolicy::from_config(config),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Accept a chain for execution
    pub async fn enqueue(&self, chain: ExportChain) -> ExportResult<ChainHandle> {
        let (tx, rx) = watch::channel(ChainStatus::Queued);
        let status = Arc::new(tx);
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = chain.id;

        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.queue_limit {
                return Err(ExportError::QueueFull);
            }
            queue.push_back(QueuedChain {
                chain,
                status: status.clone(),
                cancelled: cancelled.clone(),
            });
        }
        log::info!("Export chain {} queued", id);

        self.ensure_processor_running().await;

        Ok(ChainHandle {
            id,
            submitted_at: Utc::now(),
            status_receiver: rx,
            status_sender: status,
            cancelled,
        })
    }

    /// Ensure the dispatch loop is running. The loop exits once the queue is
    /// empty; checking emptiness under the same lock as this flag means a chain
    /// enqueued concurrently always finds a live loop or starts a new one.
    async fn ensure_processor_running(&self) {
        let mut running = self.processor_running.lock().await;
        if *running {
            return;
        }
        *running = true;

        let queue = self.queue.clone();
        let active = self.active_chains.clone();
        let semaphore = self.semaphore.clone();
        let processor = self.processor.clone();
        let processor_running = self.processor_running.clone();
        let retry = self.retry;
        let counters = self.counters.clone();

        tokio::spawn(async move {
            loop {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let next = {
                    let mut running = processor_running.lock().await;
                    let next = queue.lock().await.pop_front();
                    if next.is_none() {
                        *running = false;
                    }
                    next
                };
                let Some(queued) = next else {
                    return;
                };

                if queued.cancelled.load(Ordering::SeqCst) {
                    // Status was already set by the handle
                    counters.cancelled.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let Some(processor) = processor.upgrade() else {
                    log::error!("Unit processor was dropped, stopping queue processing");
                    queued
                        .status
                        .send_replace(ChainStatus::Failed(ExportError::ChannelClosed));
                    break;
                };

                active.fetch_add(1, Ordering::Relaxed);
                let active = active.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    let final_status = run_chain(processor.as_ref(), &queued, retry).await;
                    match &final_status {
                        ChainStatus::Completed => counters.completed.fetch_add(1, Ordering::Relaxed),
                        ChainStatus::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
                        _ => counters.failed.fetch_add(1, Ordering::Relaxed),
                    };
                    queued.status.send_replace(final_status);
                    active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }

            *processor_running.lock().await = false;
        });
    }

    pub async fn stats(&self) -> QueueStats {
        let queued = self.queue.lock().await.len();
        QueueStats {
            queued,
            active: self.active_chains.load(Ordering::Relaxed),
            total_capacity: self.max_concurrent,
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Cancel a chain that is still waiting in the queue. Running chains are
    /// stopped through their [`ChainHandle`].
    pub async fn cancel_chain(&self, chain_id: Uuid) -> ExportResult<()> {
        let queue = self.queue.lock().await;
        match queue.iter().find(|q| q.chain.id == chain_id) {
            Some(queued) => {
                queued.cancelled.store(true, Ordering::SeqCst);
                queued.status.send_replace(ChainStatus::Cancelled);
                Ok(())
            }
            None => Err(ExportError::InvalidConfig(format!(
                "chain {} is not queued",
                chain_id
            ))),
        }
    }
}

/// Run every step of a chain in order and return its terminal status
async fn run_chain(processor: &dyn UnitProcessor, queued: &QueuedChain, retry: RetryPolicy) -> ChainStatus {
    let chain = &queued.chain;
    log::info!("Export chain {} started ({} steps)", chain.id, chain.step_count());

    for position in 0..chain.step_count() {
        if !begin_step(queued, position) {
            log::warn!("Export chain {} cancelled at step {}", chain.id, position);
            processor.chain_abandoned(chain).await;
            return ChainStatus::Cancelled;
        }

        let (kind, result) = match position {
            0 => (
                "head",
                with_retry(retry, chain.id, position, || processor.process_head(&chain.head)).await,
            ),
            p => {
                let unit = &chain.units[p - 1];
                log::debug!("Chain {} step {}: {}", chain.id, p, unit.kind());
                (
                    unit.kind(),
                    with_retry(retry, chain.id, position, || processor.process_unit(unit)).await,
                )
            }
        };

        if let Err(e) = result {
            log::error!(
                "Export chain {} halted at step {} ({}): {}",
                chain.id,
                position,
                kind,
                e
            );
            processor.chain_abandoned(chain).await;
            return ChainStatus::Failed(ExportError::UnitFailed {
                position,
                unit: kind.to_string(),
                message: e.to_string(),
            });
        }
    }

    log::info!("Export chain {} completed", chain.id);
    ChainStatus::Completed
}

/// Mark `position` as running unless the chain was cancelled. The head only
/// starts from `Queued`, so a cancel racing with the start either lands first
/// and nothing runs, or finds the chain running and stops it at the next step.
fn begin_step(queued: &QueuedChain, position: usize) -> bool {
    if queued.cancelled.load(Ordering::SeqCst) {
        return false;
    }
    if position == 0 {
        return queued.status.send_if_modified(|status| {
            if matches!(status, ChainStatus::Queued) {
                *status = ChainStatus::Running { position };
                true
            } else {
                false
            }
        });
    }
    queued.status.send_replace(ChainStatus::Running { position });
    true
}

async fn with_retry<F, Fut>(retry: RetryPolicy, chain_id: Uuid, position: usize, mut step: F) -> ExportResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ExportResult<()>>,
{
    let mut attempt = 1;
    loop {
        match step().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retry.max_attempts && e.is_retryable() => {
                log::warn!(
                    "Chain {} step {} attempt {}/{} failed: {}; retrying",
                    chain_id,
                    position,
                    attempt,
                    retry.max_attempts,
                    e
                );
                tokio::time::sleep(retry.delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::units::{ExportSnapshot, TempFile};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    /// Records executed steps; can fail or block on chosen steps.
    #[derive(Default)]
    struct ScriptedProcessor {
        log: StdMutex<Vec<String>>,
        /// remaining failures per unit kind
        failures: StdMutex<Vec<(String, u32, ExportError)>>,
        /// close units wait for a permit here
        gate: Option<Arc<Semaphore>>,
        abandoned: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn fail(self, kind: &str, times: u32, err: ExportError) -> Self {
            self.failures.lock().unwrap().push((kind.to_string(), times, err));
            self
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn scripted_failure(&self, kind: &str) -> Option<ExportError> {
            let mut failures = self.failures.lock().unwrap();
            for (k, remaining, err) in failures.iter_mut() {
                if k == kind && *remaining > 0 {
                    *remaining -= 1;
                    return Some(err.clone());
                }
            }
            None
        }
    }

    #[async_trait]
    impl UnitProcessor for ScriptedProcessor {
        async fn process_head(&self, _head: &ChainHead) -> ExportResult<()> {
            self.log.lock().unwrap().push("head".to_string());
            Ok(())
        }

        async fn process_unit(&self, unit: &WorkUnit) -> ExportResult<()> {
            if let (Some(gate), WorkUnit::CloseSheet { .. }) = (&self.gate, unit) {
                gate.acquire().await.unwrap().forget();
            }
            let entry = match unit.sheet_index() {
                Some(i) => format!("{}:{}", unit.kind(), i),
                None => unit.kind().to_string(),
            };
            self.log.lock().unwrap().push(entry);
            match self.scripted_failure(unit.kind()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn chain_abandoned(&self, _chain: &ExportChain) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chain() -> ExportChain {
        let temp_file = TempFile {
            id: Uuid::new_v4(),
            path: PathBuf::from("/tmp/queue.staging.jsonl"),
        };
        let format = WriterFormat::Xlsx;
        let rows = |sheet_index, chunk| WorkUnit::AppendRows {
            sheet_index,
            chunk,
            temp_file: temp_file.clone(),
            format,
            rows: vec![vec![serde_json::json!(sheet_index)]],
        };
        let close = |sheet_index| WorkUnit::CloseSheet {
            sheet_index,
            temp_file: temp_file.clone(),
            format,
        };
        ExportChain {
            id: temp_file.id,
            head: ChainHead {
                export: ExportSnapshot {
                    title: None,
                    sheet_titles: vec!["A".to_string(), "B".to_string()],
                    before_writing: None,
                },
                temp_file: temp_file.clone(),
                format,
            },
            units: vec![
                rows(0, 0),
                rows(0, 1),
                close(0),
                rows(1, 0),
                close(1),
                WorkUnit::Finalize {
                    temp_file: temp_file.clone(),
                    format,
                    destination: "out.xlsx".to_string(),
                    disk: "local".to_string(),
                },
            ],
        }
    }

    fn config(max_concurrent_chains: usize) -> ExportConfig {
        ExportConfig {
            max_concurrent_chains,
            unit_max_attempts: 3,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn queue_for(processor: &Arc<ScriptedProcessor>, max_concurrent_chains: usize) -> ChainQueue {
        let processor: Arc<dyn UnitProcessor> = processor.clone();
        ChainQueue::new(Arc::downgrade(&processor), &config(max_concurrent_chains))
    }

    #[tokio::test]
    async fn test_steps_run_in_chain_order() {
        let processor = Arc::new(ScriptedProcessor::default());
        let queue = queue_for(&processor, 2);

        let mut handle = queue.enqueue(chain()).await.unwrap();
        handle.wait_for_completion().await.unwrap();

        assert_eq!(
            processor.entries(),
            vec![
                "head",
                "append_rows:0",
                "append_rows:0",
                "close_sheet:0",
                "append_rows:1",
                "close_sheet:1",
                "finalize"
            ]
        );
        assert_eq!(handle.status(), ChainStatus::Completed);
        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let processor = Arc::new(
            ScriptedProcessor::default().fail("close_sheet", 2, ExportError::Io("disk busy".to_string())),
        );
        let queue = queue_for(&processor, 1);

        let mut handle = queue.enqueue(chain()).await.unwrap();
        handle.wait_for_completion().await.unwrap();

        let closes = processor
            .entries()
            .iter()
            .filter(|e| e.starts_with("close_sheet"))
            .count();
        // two failed attempts of sheet 0, then one success each
        assert_eq!(closes, 4);
        assert_eq!(processor.entries().last().map(String::as_str), Some("finalize"));
    }

    #[tokio::test]
    async fn test_terminal_failure_halts_before_finalize() {
        let processor = Arc::new(
            ScriptedProcessor::default().fail("close_sheet", 1, ExportError::Render("bad sheet".to_string())),
        );
        let queue = queue_for(&processor, 1);

        let mut handle = queue.enqueue(chain()).await.unwrap();
        let err = handle.wait_for_completion().await.unwrap_err();

        match err {
            ExportError::UnitFailed { position, unit, .. } => {
                assert_eq!(position, 3);
                assert_eq!(unit, "close_sheet");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!processor.entries().iter().any(|e| e == "finalize"));
        assert_eq!(processor.abandoned.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_chain() {
        let processor = Arc::new(
            ScriptedProcessor::default().fail("finalize", 5, ExportError::Storage("offline".to_string())),
        );
        let queue = queue_for(&processor, 1);

        let mut handle = queue.enqueue(chain()).await.unwrap();
        assert!(matches!(
            handle.wait_for_completion().await,
            Err(ExportError::UnitFailed { position: 6, .. })
        ));
        let finalizes = processor.entries().iter().filter(|e| *e == "finalize").count();
        assert_eq!(finalizes, 3);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let gate = Arc::new(Semaphore::new(0));
        let blocker = Arc::new(ScriptedProcessor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = queue_for(&blocker, 1);

        // occupies the only slot until the gate opens
        let mut first = queue.enqueue(chain()).await.unwrap();
        let mut second = queue.enqueue(chain()).await.unwrap();
        second.cancel();
        assert_eq!(second.status(), ChainStatus::Cancelled);

        gate.add_permits(2);
        first.wait_for_completion().await.unwrap();
        assert!(matches!(second.wait_for_completion().await, Err(ExportError::Cancelled)));

        // only the first chain's head ever ran
        let heads = blocker.entries().iter().filter(|e| *e == "head").count();
        assert_eq!(heads, 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_chain_stops_remaining_steps() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(ScriptedProcessor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = queue_for(&processor, 1);

        let mut handle = queue.enqueue(chain()).await.unwrap();
        // wait until the chain is parked on its first close
        while handle.status() != (ChainStatus::Running { position: 3 }) {
            tokio::task::yield_now().await;
        }
        handle.cancel();
        gate.add_permits(1);

        assert!(matches!(handle.wait_for_completion().await, Err(ExportError::Cancelled)));
        let entries = processor.entries();
        assert_eq!(entries.last().map(String::as_str), Some("close_sheet:0"));
        assert!(!entries.iter().any(|e| e == "finalize"));
        assert_eq!(processor.abandoned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(ScriptedProcessor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = queue_for(&processor, 1).with_queue_limit(1);

        let running = queue.enqueue(chain()).await.unwrap();
        while running.status() == ChainStatus::Queued {
            tokio::task::yield_now().await;
        }
        let _waiting = queue.enqueue(chain()).await.unwrap();
        assert!(matches!(queue.enqueue(chain()).await, Err(ExportError::QueueFull)));
    }

    #[tokio::test]
    async fn test_cancel_racing_with_start_runs_nothing() {
        let processor = ScriptedProcessor::default();
        let (tx, _rx) = watch::channel(ChainStatus::Queued);
        let queued = QueuedChain {
            chain: chain(),
            status: Arc::new(tx),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        // the cancel landed after the flag was read but before the head started
        queued.status.send_replace(ChainStatus::Cancelled);

        let status = run_chain(&processor, &queued, RetryPolicy::default()).await;
        assert_eq!(status, ChainStatus::Cancelled);
        assert_eq!(*queued.status.borrow(), ChainStatus::Cancelled);
        assert!(processor.entries().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_chain_by_id() {
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(ScriptedProcessor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = queue_for(&processor, 1);

        let mut running = queue.enqueue(chain()).await.unwrap();
        while running.status() == ChainStatus::Queued {
            tokio::task::yield_now().await;
        }
        let mut waiting = queue.enqueue(chain()).await.unwrap();

        queue.cancel_chain(waiting.id).await.unwrap();
        assert!(waiting.is_cancelled());
        // only queued chains can be cancelled by id
        assert!(queue.cancel_chain(running.id).await.is_err());
        assert!(queue.cancel_chain(Uuid::new_v4()).await.is_err());

        gate.add_permits(2);
        running.wait_for_completion().await.unwrap();
        assert!(matches!(waiting.wait_for_completion().await, Err(ExportError::Cancelled)));
        assert_eq!(processor.entries().iter().filter(|e| *e == "head").count(), 1);
    }
}
