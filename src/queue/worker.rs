//! The loop that drains a queue's pending items through the generation
//! backend under the shared rate limiter.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::BatchQueue;
use crate::backend::{AnalyzeRequest, GenerationBackend, RenderRequest};
use crate::compress::Compressor;
use crate::error::{CoreError, CoreResult, UpstreamError};
use crate::history::VersionHistory;
use crate::model::{BatchQueueItem, GenerationResult, ItemStatus};
use crate::rate_limit::RateLimiter;

const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No pending items were left.
    Drained,
    Paused,
    /// An item failed and `stop_on_error` was set.
    StoppedOnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
    pub discarded: usize,
    pub stop_reason: StopReason,
}

enum Attempt {
    Generated(GenerationResult),
    Failed(UpstreamError),
    /// Paused while waiting for admission.
    Paused,
    /// Cancelled or removed while it was being worked on.
    Cancelled,
}

pub struct Worker {
    queue: BatchQueue,
    backend: Arc<dyn GenerationBackend>,
    limiter: Arc<RateLimiter>,
    compressor: Compressor,
    history: Option<VersionHistory>,
    stop_on_error: bool,
    wait_slice: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("stop_on_error", &self.stop_on_error)
            .field("wait_slice", &self.wait_slice)
            .finish()
    }
}

impl Worker {
    pub fn new(
        queue: BatchQueue,
        backend: Arc<dyn GenerationBackend>,
        limiter: Arc<RateLimiter>,
        compressor: Compressor,
    ) -> Self {
        Self {
            queue,
            backend,
            limiter,
            compressor,
            history: None,
            stop_on_error: false,
            wait_slice: DEFAULT_WAIT_SLICE,
        }
    }

    /// Completed items are also saved as versions when the batch config allows it.
    pub fn with_history(mut self, history: VersionHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// Upper bound on one sleep while waiting for the rate limiter, so a
    /// pause is noticed promptly.
    pub fn wait_slice(mut self, wait_slice: Duration) -> Self {
        self.wait_slice = wait_slice;
        self
    }

    /// Processes pending items one at a time until the queue drains, the
    /// queue is paused, or (with `stop_on_error`) an item fails.
    pub fn run(&self, queue_id: &str) -> CoreResult<WorkerSummary> {
        let Some(_active) = self.queue.begin_worker(queue_id) else {
            return Err(CoreError::Validation(format!(
                "queue {queue_id} already has an active worker"
            )));
        };
        let summary = self.drain(queue_id);

        if let Ok(summary) = &summary {
            info!(
                queue_id = %queue_id,
                completed = summary.completed,
                failed = summary.failed,
                discarded = summary.discarded,
                stop_reason = ?summary.stop_reason,
                "batch worker stopped"
            );
        }
        summary
    }

    fn drain(&self, queue_id: &str) -> CoreResult<WorkerSummary> {
        let mut summary = WorkerSummary {
            completed: 0,
            failed: 0,
            discarded: 0,
            stop_reason: StopReason::Drained,
        };

        loop {
            if self.queue.is_paused(queue_id) {
                summary.stop_reason = StopReason::Paused;
                return Ok(summary);
            }
            let Some(item) = self.queue.claim_next(queue_id)? else {
                return Ok(summary);
            };
            debug!(id = %item.id, topic = %item.topic, "processing batch item");

            match self.process(queue_id, &item, &mut summary) {
                Ok(true) => {
                    summary.stop_reason = StopReason::StoppedOnError;
                    return Ok(summary);
                }
                Ok(false) => {}
                Err(err) => {
                    if let Err(release_err) = self.queue.release_item(&item.id) {
                        warn!(id = %item.id, error = %release_err, "failed to release batch item");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Takes one claimed item to its outcome. Returns true when the worker
    /// should stop because the item ended up `failed` under `stop_on_error`.
    fn process(
        &self,
        queue_id: &str,
        item: &BatchQueueItem,
        summary: &mut WorkerSummary,
    ) -> CoreResult<bool> {
        let outcome = match self.attempt(queue_id, item)? {
            Attempt::Generated(result) => Ok(result),
            Attempt::Failed(err) => Err(err.to_string()),
            Attempt::Paused => {
                self.queue.release_item(&item.id)?;
                return Ok(false);
            }
            Attempt::Cancelled => {
                summary.discarded += 1;
                debug!(id = %item.id, "batch item cancelled before dispatch");
                return Ok(false);
            }
        };

        match self.queue.finish_item(&item.id, outcome)? {
            Some(finished) if finished.status == ItemStatus::Complete => {
                summary.completed += 1;
                self.save_to_history(&finished);
                Ok(false)
            }
            Some(finished) => {
                summary.failed += 1;
                warn!(
                    id = %finished.id,
                    topic = %finished.topic,
                    error = finished.error.as_deref().unwrap_or_default(),
                    "batch item failed"
                );
                Ok(finished.status == ItemStatus::Failed && self.stop_on_error)
            }
            None => {
                summary.discarded += 1;
                debug!(id = %item.id, "discarded result of cancelled batch item");
                Ok(false)
            }
        }
    }

    fn attempt(&self, queue_id: &str, item: &BatchQueueItem) -> CoreResult<Attempt> {
        if let Some(stopped) = self.admit(queue_id, &item.id)? {
            return Ok(stopped);
        }
        let analysis = match self.backend.analyze(&AnalyzeRequest::for_item(item)) {
            Ok(analysis) => analysis,
            Err(err) => return Ok(self.upstream_failure(err)),
        };

        if !self.still_processing(&item.id)? {
            return Ok(Attempt::Cancelled);
        }
        if let Some(stopped) = self.admit(queue_id, &item.id)? {
            return Ok(stopped);
        }
        let render = RenderRequest {
            visual_plan: analysis.visual_plan.clone(),
            size: item.size,
            aspect_ratio: item.aspect_ratio,
        };
        let image = match self.backend.render(&render) {
            Ok(image) => image,
            Err(err) => return Ok(self.upstream_failure(err)),
        };

        Ok(Attempt::Generated(GenerationResult {
            image: self.compressor.compress(&image),
            analysis,
        }))
    }

    /// Waits for an admission slot, then makes sure the item was not
    /// cancelled during the wait. `None` means go ahead.
    fn admit(&self, queue_id: &str, id: &str) -> CoreResult<Option<Attempt>> {
        if !self.acquire(queue_id)? {
            return Ok(Some(Attempt::Paused));
        }
        if !self.still_processing(id)? {
            return Ok(Some(Attempt::Cancelled));
        }
        Ok(None)
    }

    fn still_processing(&self, id: &str) -> CoreResult<bool> {
        Ok(self.queue.item_status(id)? == Some(ItemStatus::Processing))
    }

    fn upstream_failure(&self, err: UpstreamError) -> Attempt {
        if err.is_throttled() {
            self.limiter.activate_cooldown();
        }
        Attempt::Failed(err)
    }

    /// Waits for an admission slot. Returns false if the queue was paused
    /// while waiting.
    fn acquire(&self, queue_id: &str) -> CoreResult<bool> {
        loop {
            match self.limiter.try_acquire() {
                Ok(()) => return Ok(true),
                Err(CoreError::RateLimited { retry_after }) => {
                    if self.queue.is_paused(queue_id) {
                        return Ok(false);
                    }
                    debug!(
                        queue_id = %queue_id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "waiting for rate limiter"
                    );
                    let wait = retry_after
                        .min(self.wait_slice)
                        .max(Duration::from_millis(1));
                    thread::sleep(wait);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn save_to_history(&self, item: &BatchQueueItem) {
        if !self.queue.config().save_to_history {
            return;
        }
        let (Some(history), Some(result)) = (&self.history, &item.result) else {
            return;
        };
        if let Err(err) = history.save_version(item.request(), result.clone()) {
            warn!(id = %item.id, error = %err, "failed to save batch result to history");
        }
    }
}
