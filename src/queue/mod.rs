//! Batch job queue: persisted items grouped by queue id, their status
//! transitions, and the aggregate status derived from them.
//!
//! The queue itself never touches the rate limiter or the backend; the
//! [`worker::Worker`] loop that consumes pending items does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::error::{CoreError, CoreResult};
use crate::legacy::LegacyMigrator;
use crate::model::{AspectRatio, BatchQueueItem, GenerationResult, ItemStatus, OutputSize};
use crate::store::{SortOrder, Store, Table};
use crate::util::{new_record_id, now_millis};

pub mod worker;
#[cfg(test)]
mod tests;

pub use worker::{StopReason, Worker, WorkerSummary};

/// Settings shared by every item of one enqueue call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub style: String,
    pub palette: String,
    pub size: OutputSize,
    pub aspect_ratio: AspectRatio,
    pub filters: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Idle,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub complete: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn from_items(items: &[BatchQueueItem]) -> Self {
        let mut stats = Self {
            total: items.len(),
            ..Self::default()
        };
        for item in items {
            match item.status {
                ItemStatus::Pending => stats.pending += 1,
                ItemStatus::Processing => stats.processing += 1,
                ItemStatus::Complete => stats.complete += 1,
                ItemStatus::Failed => stats.failed += 1,
                ItemStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// True while anything is left for a worker to do or finish.
    pub fn is_active(&self) -> bool {
        self.pending > 0 || self.processing > 0
    }
}

/// `running` if any item is processing, `complete` once every item is
/// terminal (an empty queue included), otherwise `idle`.
pub fn derive_queue_status(items: &[BatchQueueItem]) -> QueueStatus {
    if items
        .iter()
        .any(|item| item.status == ItemStatus::Processing)
    {
        QueueStatus::Running
    } else if items.iter().all(|item| item.status.is_terminal()) {
        QueueStatus::Complete
    } else {
        QueueStatus::Idle
    }
}

/// Point-in-time view of one queue, produced by a single read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub queue_id: String,
    pub status: QueueStatus,
    pub stats: QueueStats,
    pub items: Vec<BatchQueueItem>,
}

impl QueueSnapshot {
    fn from_items(queue_id: &str, items: Vec<BatchQueueItem>) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            status: derive_queue_status(&items),
            stats: QueueStats::from_items(&items),
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub queue_id: String,
    pub status: QueueStatus,
    pub stats: QueueStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub queue_id: String,
    pub items: Vec<BatchQueueItem>,
}

/// Fields merged into a stored item by [`BatchQueue::update_item`]; `None`
/// leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub topic: Option<String>,
    pub style: Option<String>,
    pub palette: Option<String>,
    pub size: Option<OutputSize>,
    pub aspect_ratio: Option<AspectRatio>,
    pub filters: Option<Vec<String>>,
    pub status: Option<ItemStatus>,
    pub completed_at: Option<i64>,
    pub result: Option<GenerationResult>,
    pub error: Option<String>,
}

impl ItemPatch {
    fn apply(self, item: &mut BatchQueueItem) {
        if let Some(topic) = self.topic {
            item.topic = topic;
        }
        if let Some(style) = self.style {
            item.style = style;
        }
        if let Some(palette) = self.palette {
            item.palette = palette;
        }
        if let Some(size) = self.size {
            item.size = size;
        }
        if let Some(aspect_ratio) = self.aspect_ratio {
            item.aspect_ratio = aspect_ratio;
        }
        if let Some(filters) = self.filters {
            item.filters = Some(filters);
        }
        if let Some(status) = self.status {
            item.status = status;
        }
        if let Some(completed_at) = self.completed_at {
            item.completed_at = Some(completed_at);
        }
        if let Some(result) = self.result {
            item.result = Some(result);
        }
        if let Some(error) = self.error {
            item.error = Some(error);
        }
    }
}

#[derive(Debug, Default)]
struct QueueControl {
    paused: AtomicBool,
    worker_active: AtomicBool,
}

/// Holds a queue's `worker_active` flag; clears it on drop, unwinding included.
#[derive(Debug)]
pub(crate) struct ActiveWorker {
    control: Arc<QueueControl>,
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.control.worker_active.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct BatchQueue {
    store: Store,
    config: BatchConfig,
    migrator: Option<Arc<LegacyMigrator>>,
    controls: Arc<Mutex<HashMap<String, Arc<QueueControl>>>>,
}

impl BatchQueue {
    pub fn new(store: Store, config: BatchConfig) -> Self {
        Self {
            store,
            config,
            migrator: None,
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_migrator(mut self, migrator: Arc<LegacyMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    fn ensure_migrated(&self) {
        if let Some(migrator) = &self.migrator {
            migrator.ensure_migrated();
        }
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<String, Arc<QueueControl>>> {
        self.controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn control(&self, queue_id: &str) -> Arc<QueueControl> {
        Arc::clone(self.controls().entry(queue_id.to_string()).or_default())
    }

    /// Lookup without registering the queue; unknown queues read as idle.
    fn existing_control(&self, queue_id: &str) -> Option<Arc<QueueControl>> {
        self.controls().get(queue_id).map(Arc::clone)
    }

    fn has_active_worker(&self, queue_id: &str) -> bool {
        self.existing_control(queue_id)
            .is_some_and(|control| control.worker_active.load(Ordering::SeqCst))
    }

    pub(crate) fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Creates a new queue holding one pending item per non-blank topic.
    pub fn enqueue(&self, topics: &[String], options: &EnqueueOptions) -> CoreResult<Enqueued> {
        let queue_id = new_record_id();
        let items = self.create_items(&queue_id, topics, options)?;
        info!(queue_id = %queue_id, items = items.len(), "enqueued batch");
        Ok(Enqueued { queue_id, items })
    }

    /// Persists one pending item per topic under `queue_id` in a single
    /// transaction.
    pub fn create_items(
        &self,
        queue_id: &str,
        topics: &[String],
        options: &EnqueueOptions,
    ) -> CoreResult<Vec<BatchQueueItem>> {
        self.ensure_migrated();

        let topics: Vec<&str> = topics
            .iter()
            .map(|topic| topic.trim())
            .filter(|topic| !topic.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(CoreError::Validation("at least one topic is required".to_string()));
        }
        if topics.len() > self.config.max_topics {
            return Err(CoreError::Validation(format!(
                "{} topics exceed the batch limit of {}",
                topics.len(),
                self.config.max_topics
            )));
        }

        let now = now_millis();
        let items: Vec<BatchQueueItem> = topics
            .into_iter()
            .enumerate()
            .map(|(position, topic)| BatchQueueItem {
                id: new_record_id(),
                queue_id: queue_id.to_string(),
                topic: topic.to_string(),
                style: options.style.clone(),
                palette: options.palette.clone(),
                size: options.size,
                aspect_ratio: options.aspect_ratio,
                filters: options.filters.clone(),
                status: ItemStatus::Pending,
                // offset by position so items keep their enqueue order
                created_at: now + position as i64,
                completed_at: None,
                result: None,
                error: None,
            })
            .collect();

        self.store.put_all(&items)?;
        Ok(items)
    }

    pub fn get_item(&self, id: &str) -> CoreResult<BatchQueueItem> {
        self.ensure_migrated();
        self.store
            .get::<BatchQueueItem>(id)?
            .ok_or_else(|| CoreError::ItemNotFound {
                table: Table::BatchItems.name(),
                id: id.to_string(),
            })
    }

    /// Items of one queue in enqueue order.
    pub fn list_items(&self, queue_id: &str) -> CoreResult<Vec<BatchQueueItem>> {
        self.ensure_migrated();
        self.store.scan_scope(queue_id, SortOrder::Ascending)
    }

    pub fn list_queues(&self) -> CoreResult<Vec<QueueSummary>> {
        self.ensure_migrated();
        self.store
            .scopes(Table::BatchItems)?
            .into_iter()
            .map(|queue_id| {
                let items: Vec<BatchQueueItem> =
                    self.store.scan_scope(&queue_id, SortOrder::Ascending)?;
                Ok(QueueSummary {
                    status: derive_queue_status(&items),
                    stats: QueueStats::from_items(&items),
                    queue_id,
                })
            })
            .collect()
    }

    pub fn snapshot(&self, queue_id: &str) -> CoreResult<QueueSnapshot> {
        let items = self.list_items(queue_id)?;
        Ok(QueueSnapshot::from_items(queue_id, items))
    }

    pub fn stats(&self, queue_id: &str) -> CoreResult<QueueStats> {
        Ok(QueueStats::from_items(&self.list_items(queue_id)?))
    }

    /// Merges `patch` into the stored item. Never creates a missing item.
    pub fn update_item(&self, id: &str, patch: ItemPatch) -> CoreResult<BatchQueueItem> {
        self.ensure_migrated();
        self.store
            .update(id, |item: &mut BatchQueueItem| {
                patch.apply(item);
                Ok(())
            })
    }

    /// Returns a failed or cancelled item to `pending` with its outcome cleared.
    pub fn retry(&self, id: &str) -> CoreResult<BatchQueueItem> {
        self.ensure_migrated();
        self.store.update(id, |item: &mut BatchQueueItem| {
            if !matches!(item.status, ItemStatus::Failed | ItemStatus::Cancelled) {
                return Err(invalid_transition(item, "retry"));
            }
            item.status = ItemStatus::Pending;
            item.error = None;
            item.result = None;
            item.completed_at = None;
            Ok(())
        })
    }

    /// Marks a pending or processing item cancelled. An in-flight backend
    /// call is not interrupted; the worker discards its result.
    pub fn cancel(&self, id: &str) -> CoreResult<BatchQueueItem> {
        self.ensure_migrated();
        self.store.update(id, |item: &mut BatchQueueItem| {
            if !matches!(item.status, ItemStatus::Pending | ItemStatus::Processing) {
                return Err(invalid_transition(item, "cancel"));
            }
            item.status = ItemStatus::Cancelled;
            item.completed_at = Some(now_millis());
            Ok(())
        })
    }

    /// Deletes the queue's complete and cancelled items.
    pub fn clear_finished(&self, queue_id: &str) -> CoreResult<usize> {
        let finished: Vec<String> = self
            .list_items(queue_id)?
            .into_iter()
            .filter(|item| matches!(item.status, ItemStatus::Complete | ItemStatus::Cancelled))
            .map(|item| item.id)
            .collect();
        let removed = self.store.delete_all(Table::BatchItems, &finished)?;
        info!(queue_id = %queue_id, removed, "cleared finished batch items");
        Ok(removed)
    }

    /// Resets items stranded in `processing` by a worker that no longer
    /// exists. Queues with a live worker in this process are skipped.
    pub fn recover_interrupted(&self) -> CoreResult<usize> {
        self.ensure_migrated();
        let stranded: Vec<BatchQueueItem> = self
            .store
            .scan_all::<BatchQueueItem>(SortOrder::Ascending)?
            .into_iter()
            .filter(|item| item.status == ItemStatus::Processing)
            .filter(|item| !self.has_active_worker(&item.queue_id))
            .collect();

        let mut recovered = 0usize;
        for item in stranded {
            let result = self.store.update(&item.id, |item: &mut BatchQueueItem| {
                if item.status == ItemStatus::Processing {
                    item.status = ItemStatus::Pending;
                }
                Ok(())
            });
            match result {
                Ok(_) => recovered += 1,
                Err(err) => warn!(id = %item.id, error = %err, "failed to recover batch item"),
            }
        }
        if recovered > 0 {
            info!(recovered, "returned interrupted batch items to pending");
        }
        Ok(recovered)
    }

    /// Asks the queue's worker to stop before its next item.
    pub fn pause(&self, queue_id: &str) {
        self.control(queue_id).paused.store(true, Ordering::SeqCst);
        info!(queue_id = %queue_id, "batch paused");
    }

    pub fn is_paused(&self, queue_id: &str) -> bool {
        self.existing_control(queue_id)
            .is_some_and(|control| control.paused.load(Ordering::SeqCst))
    }

    /// Clears the pause flag and runs `worker` over the queue on its own thread.
    pub fn start(
        &self,
        queue_id: &str,
        worker: Worker,
    ) -> thread::JoinHandle<CoreResult<WorkerSummary>> {
        self.control(queue_id).paused.store(false, Ordering::SeqCst);
        let queue_id = queue_id.to_string();
        thread::spawn(move || worker.run(&queue_id))
    }

    /// Marks a worker active on the queue until the returned guard drops;
    /// `None` when one already is.
    pub(crate) fn begin_worker(&self, queue_id: &str) -> Option<ActiveWorker> {
        let control = self.control(queue_id);
        control
            .worker_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(ActiveWorker { control })
    }

    /// Moves the oldest pending item of the queue to `processing`. Items
    /// claimed by someone else between the scan and the update are skipped.
    pub(crate) fn claim_next(&self, queue_id: &str) -> CoreResult<Option<BatchQueueItem>> {
        let pending: Vec<String> = self
            .list_items(queue_id)?
            .into_iter()
            .filter(|item| item.status == ItemStatus::Pending)
            .map(|item| item.id)
            .collect();

        for id in pending {
            let claimed = self.store.update(&id, |item: &mut BatchQueueItem| {
                if item.status != ItemStatus::Pending {
                    return Err(invalid_transition(item, "claim"));
                }
                item.status = ItemStatus::Processing;
                Ok(())
            });
            match claimed {
                Ok(item) => return Ok(Some(item)),
                Err(CoreError::InvalidTransition { .. } | CoreError::ItemNotFound { .. }) => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Writes a worker's outcome back if the item is still `processing`.
    /// Returns `None` when the item was cancelled or removed meanwhile.
    pub(crate) fn finish_item(
        &self,
        id: &str,
        outcome: Result<GenerationResult, String>,
    ) -> CoreResult<Option<BatchQueueItem>> {
        let mut applied = false;
        let updated = self.store.update(id, |item: &mut BatchQueueItem| {
            if item.status != ItemStatus::Processing {
                return Ok(());
            }
            applied = true;
            item.completed_at = Some(now_millis());
            match outcome {
                Ok(result) => {
                    item.status = ItemStatus::Complete;
                    item.result = Some(result);
                    item.error = None;
                }
                Err(message) => {
                    item.status = ItemStatus::Failed;
                    item.error = Some(message);
                }
            }
            Ok(())
        });

        match updated {
            Ok(item) if applied => Ok(Some(item)),
            Ok(_) | Err(CoreError::ItemNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Puts a claimed item back to `pending` when the worker stops before
    /// dispatching it.
    pub(crate) fn release_item(&self, id: &str) -> CoreResult<()> {
        let released = self.store.update(id, |item: &mut BatchQueueItem| {
            if item.status == ItemStatus::Processing {
                item.status = ItemStatus::Pending;
            }
            Ok(())
        });
        match released {
            Ok(_) | Err(CoreError::ItemNotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn item_status(&self, id: &str) -> CoreResult<Option<ItemStatus>> {
        Ok(self
            .store
            .get::<BatchQueueItem>(id)?
            .map(|item| item.status))
    }
}

fn invalid_transition(item: &BatchQueueItem, action: &'static str) -> CoreError {
    CoreError::InvalidTransition {
        id: item.id.clone(),
        status: item.status.to_string(),
        action,
    }
}
