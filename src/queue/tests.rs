use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::backend::{AnalyzeRequest, GenerationBackend, RenderRequest};
use crate::compress::Compressor;
use tempfile::tempdir;

use crate::config::{CompressionConfig, CoreConfig, EvictionMode, RateLimitConfig, StorageConfig};
use crate::error::UpstreamError;
use crate::history::VersionHistory;
use crate::model::{Analysis, ImagePayload};
use crate::rate_limit::{ManualClock, RateLimiter};

/// Backend whose analyze calls succeed or fail per topic.
#[derive(Default)]
struct ScriptedBackend {
    failures: Mutex<HashMap<String, UpstreamError>>,
    calls: Mutex<VecDeque<String>>,
}

impl ScriptedBackend {
    fn failing(topic: &str, err: UpstreamError) -> Self {
        let backend = Self::default();
        backend
            .failures
            .lock()
            .expect("failures")
            .insert(topic.to_string(), err);
        backend
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").iter().cloned().collect()
    }
}

impl GenerationBackend for ScriptedBackend {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<Analysis, UpstreamError> {
        self.calls
            .lock()
            .expect("calls")
            .push_back(format!("analyze:{}", request.topic));
        if let Some(err) = self.failures.lock().expect("failures").get(&request.topic) {
            return Err(err.clone());
        }
        Ok(Analysis {
            title: request.topic.clone(),
            summary: format!("about {}", request.topic),
            key_points: vec![],
            visual_plan: format!("plan for {}", request.topic),
            citations: None,
        })
    }

    fn render(&self, request: &RenderRequest) -> Result<ImagePayload, UpstreamError> {
        self.calls
            .lock()
            .expect("calls")
            .push_back(format!("render:{}", request.visual_plan));
        Ok(ImagePayload::new("image/png", vec![1, 2, 3]))
    }
}

/// Cancels the item behind a topic through the queue while that topic is
/// being analyzed, then answers like `inner`.
struct CancellingBackend {
    inner: ScriptedBackend,
    queue: BatchQueue,
    targets: HashMap<String, String>,
}

impl CancellingBackend {
    fn new(inner: ScriptedBackend, queue: &BatchQueue, items: &[BatchQueueItem], topic: &str) -> Self {
        let targets = items
            .iter()
            .filter(|item| item.topic == topic)
            .map(|item| (item.topic.clone(), item.id.clone()))
            .collect();
        Self {
            inner,
            queue: queue.clone(),
            targets,
        }
    }
}

impl GenerationBackend for CancellingBackend {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<Analysis, UpstreamError> {
        if let Some(id) = self.targets.get(&request.topic) {
            self.queue.cancel(id).expect("cancel in flight");
        }
        self.inner.analyze(request)
    }

    fn render(&self, request: &RenderRequest) -> Result<ImagePayload, UpstreamError> {
        self.inner.render(request)
    }
}

struct CrashingBackend;

impl GenerationBackend for CrashingBackend {
    fn analyze(&self, _request: &AnalyzeRequest) -> Result<Analysis, UpstreamError> {
        panic!("backend crashed");
    }

    fn render(&self, _request: &RenderRequest) -> Result<ImagePayload, UpstreamError> {
        panic!("backend crashed");
    }
}

/// Renders an image too large for a small store to hold.
struct OversizedBackend(ScriptedBackend);

impl GenerationBackend for OversizedBackend {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<Analysis, UpstreamError> {
        self.0.analyze(request)
    }

    fn render(&self, _request: &RenderRequest) -> Result<ImagePayload, UpstreamError> {
        Ok(ImagePayload::new("image/png", vec![0u8; 512 * 1024]))
    }
}

fn store() -> Store {
    Store::open_in_memory(&CoreConfig::default().storage).expect("store")
}

fn queue(store: &Store) -> BatchQueue {
    BatchQueue::new(store.clone(), BatchConfig::default())
}

fn options() -> EnqueueOptions {
    EnqueueOptions {
        style: "flat".to_string(),
        palette: "mono".to_string(),
        ..EnqueueOptions::default()
    }
}

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn limiter(max_requests: usize) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests,
        window_ms: 60_000,
        cooldown_ms: 60_000,
    }))
}

fn worker(
    queue: &BatchQueue,
    backend: Arc<dyn GenerationBackend>,
    limiter: Arc<RateLimiter>,
) -> Worker {
    Worker::new(
        queue.clone(),
        backend,
        limiter,
        Compressor::new(CompressionConfig::default()),
    )
    .wait_slice(Duration::from_millis(5))
}

fn item_with(status: ItemStatus) -> BatchQueueItem {
    BatchQueueItem {
        id: new_record_id(),
        queue_id: "q".to_string(),
        topic: "t".to_string(),
        style: "s".to_string(),
        palette: "p".to_string(),
        size: OutputSize::OneK,
        aspect_ratio: AspectRatio::Square,
        filters: None,
        status,
        created_at: 0,
        completed_at: None,
        result: None,
        error: None,
    }
}

#[test]
fn status_derivation_follows_item_states() {
    let mut items = vec![
        item_with(ItemStatus::Complete),
        item_with(ItemStatus::Complete),
        item_with(ItemStatus::Failed),
        item_with(ItemStatus::Pending),
        item_with(ItemStatus::Pending),
    ];
    assert_eq!(derive_queue_status(&items), QueueStatus::Idle);

    items[3].status = ItemStatus::Processing;
    items[4].status = ItemStatus::Processing;
    assert_eq!(derive_queue_status(&items), QueueStatus::Running);

    items[3].status = ItemStatus::Complete;
    items[4].status = ItemStatus::Cancelled;
    assert_eq!(derive_queue_status(&items), QueueStatus::Complete);
}

#[test]
fn enqueue_trims_topics_and_enforces_limits() {
    let store = store();
    let queue = queue(&store);

    let enqueued = queue
        .enqueue(&topics(&["  tides ", "", "moons"]), &options())
        .expect("enqueue");
    let listed: Vec<String> = queue
        .list_items(&enqueued.queue_id)
        .expect("list")
        .into_iter()
        .map(|item| item.topic)
        .collect();
    assert_eq!(listed, vec!["tides", "moons"]);

    assert!(matches!(
        queue.enqueue(&topics(&[" ", ""]), &options()),
        Err(CoreError::Validation(_))
    ));

    let small = BatchQueue::new(
        store.clone(),
        BatchConfig {
            max_topics: 2,
            ..BatchConfig::default()
        },
    );
    assert!(matches!(
        small.enqueue(&topics(&["a", "b", "c"]), &options()),
        Err(CoreError::Validation(_))
    ));
}

#[test]
fn retry_resets_failed_item() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["comets"]), &options()).expect("enqueue");
    let id = enqueued.items[0].id.clone();

    queue
        .update_item(
            &id,
            ItemPatch {
                status: Some(ItemStatus::Failed),
                error: Some("boom".to_string()),
                completed_at: Some(42),
                ..ItemPatch::default()
            },
        )
        .expect("mark failed");

    let retried = queue.retry(&id).expect("retry");
    assert_eq!(retried.status, ItemStatus::Pending);
    assert_eq!(retried.error, None);
    assert_eq!(retried.completed_at, None);
    assert_eq!(retried.result, None);

    let err = queue.retry(&id).expect_err("pending cannot be retried");
    assert!(matches!(err, CoreError::InvalidTransition { action: "retry", .. }));
}

#[test]
fn cancel_only_applies_to_unfinished_items() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["rivers"]), &options()).expect("enqueue");
    let id = enqueued.items[0].id.clone();

    let cancelled = queue.cancel(&id).expect("cancel");
    assert_eq!(cancelled.status, ItemStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    assert!(matches!(
        queue.cancel(&id),
        Err(CoreError::InvalidTransition { action: "cancel", .. })
    ));
}

#[test]
fn update_of_missing_item_never_creates_it() {
    let store = store();
    let queue = queue(&store);
    let err = queue
        .update_item("missing", ItemPatch::default())
        .expect_err("missing item");
    assert!(matches!(err, CoreError::ItemNotFound { .. }));
    assert_eq!(store.count(Table::BatchItems).expect("count"), 0);
}

#[test]
fn stop_on_error_leaves_remaining_items_pending() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue
        .enqueue(&topics(&["first", "second", "third"]), &options())
        .expect("enqueue");

    let backend = Arc::new(ScriptedBackend::failing(
        "second",
        UpstreamError::InvalidInput("unsupported topic".to_string()),
    ));
    let summary = worker(&queue, backend.clone(), limiter(10))
        .stop_on_error(true)
        .run(&enqueued.queue_id)
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::StoppedOnError);
    assert_eq!(
        queue.stats(&enqueued.queue_id).expect("stats"),
        QueueStats {
            total: 3,
            pending: 1,
            processing: 0,
            complete: 1,
            failed: 1,
            cancelled: 0,
        }
    );

    let items = queue.list_items(&enqueued.queue_id).expect("items");
    assert_eq!(items[0].status, ItemStatus::Complete);
    assert!(items[0].result.is_some());
    assert_eq!(items[1].status, ItemStatus::Failed);
    assert!(items[1].error.as_deref().unwrap_or_default().contains("unsupported topic"));
    assert_eq!(items[2].status, ItemStatus::Pending);
    assert!(!backend.calls().iter().any(|call| call.ends_with("third")));
}

#[test]
fn failures_do_not_stop_siblings_by_default() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue
        .enqueue(&topics(&["a", "b", "c"]), &options())
        .expect("enqueue");

    let backend = Arc::new(ScriptedBackend::failing(
        "b",
        UpstreamError::Blocked("policy".to_string()),
    ));
    let summary = worker(&queue, backend, limiter(10))
        .run(&enqueued.queue_id)
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::Drained);
    assert_eq!((summary.completed, summary.failed), (2, 1));
    let snapshot = queue.snapshot(&enqueued.queue_id).expect("snapshot");
    assert_eq!(snapshot.status, QueueStatus::Complete);
}

#[test]
fn throttled_backend_triggers_cooldown() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["busy"]), &options()).expect("enqueue");

    let limiter = Arc::new(RateLimiter::with_clock(
        RateLimitConfig {
            max_requests: 10,
            window_ms: 1_000,
            cooldown_ms: 30_000,
        },
        Arc::new(ManualClock::new(0)),
    ));
    let backend = Arc::new(ScriptedBackend::failing(
        "busy",
        UpstreamError::Throttled("quota".to_string()),
    ));
    worker(&queue, backend, limiter.clone())
        .run(&enqueued.queue_id)
        .expect("run");

    assert!(!limiter.can_make_request());
    assert_eq!(limiter.time_until_reset(), 30_000);
    assert_eq!(queue.stats(&enqueued.queue_id).expect("stats").failed, 1);
}

#[test]
fn pause_while_waiting_for_admission_releases_item() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["slow"]), &options()).expect("enqueue");

    let limiter = limiter(1);
    limiter.record_request();
    let backend = Arc::new(ScriptedBackend::default());

    let handle = queue.start(&enqueued.queue_id, worker(&queue, backend.clone(), limiter));
    std::thread::sleep(Duration::from_millis(30));
    queue.pause(&enqueued.queue_id);
    let summary = handle.join().expect("worker thread").expect("run");

    assert_eq!(summary.stop_reason, StopReason::Paused);
    assert!(backend.calls().is_empty());
    let stats = queue.stats(&enqueued.queue_id).expect("stats");
    assert_eq!((stats.pending, stats.processing), (1, 0));
}

#[test]
fn completed_items_are_saved_to_history() {
    let mut config = CoreConfig::default();
    config.storage.eviction = EvictionMode::Inline;
    let store = Store::open_in_memory(&config.storage).expect("store");
    let queue = queue(&store);
    let history = VersionHistory::new(store.clone(), &config);
    let enqueued = queue
        .enqueue(&topics(&["auroras", "geysers"]), &options())
        .expect("enqueue");

    worker(&queue, Arc::new(ScriptedBackend::default()), limiter(10))
        .with_history(history.clone())
        .run(&enqueued.queue_id)
        .expect("run");

    let versions = history.list_versions().expect("versions");
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().any(|version| version.request.topic == "auroras"));
}

#[test]
fn clear_finished_and_recover_interrupted() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue
        .enqueue(&topics(&["a", "b", "c"]), &options())
        .expect("enqueue");
    let ids: Vec<String> = enqueued.items.iter().map(|item| item.id.clone()).collect();

    queue.cancel(&ids[0]).expect("cancel");
    queue
        .update_item(
            &ids[1],
            ItemPatch {
                status: Some(ItemStatus::Processing),
                ..ItemPatch::default()
            },
        )
        .expect("processing");

    assert_eq!(queue.recover_interrupted().expect("recover"), 1);
    assert_eq!(queue.get_item(&ids[1]).expect("item").status, ItemStatus::Pending);

    assert_eq!(queue.clear_finished(&enqueued.queue_id).expect("clear"), 1);
    assert_eq!(queue.list_items(&enqueued.queue_id).expect("items").len(), 2);

    let queues = queue.list_queues().expect("queues");
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].stats.pending, 2);
}

#[test]
fn cancel_between_phases_discards_the_item() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue
        .enqueue(&topics(&["first", "second", "third"]), &options())
        .expect("enqueue");

    let backend = Arc::new(CancellingBackend::new(
        ScriptedBackend::default(),
        &queue,
        &enqueued.items,
        "second",
    ));
    let summary = worker(&queue, backend.clone(), limiter(10))
        .run(&enqueued.queue_id)
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::Drained);
    assert_eq!((summary.completed, summary.failed, summary.discarded), (2, 0, 1));
    let calls = backend.inner.calls();
    assert!(calls.contains(&"analyze:second".to_string()));
    assert!(!calls.contains(&"render:plan for second".to_string()));

    let cancelled = queue.get_item(&enqueued.items[1].id).expect("item");
    assert_eq!(cancelled.status, ItemStatus::Cancelled);
    assert!(cancelled.result.is_none());

    let retried = queue.retry(&cancelled.id).expect("retry cancelled");
    assert_eq!(retried.status, ItemStatus::Pending);
    assert_eq!(retried.completed_at, None);

    let rerun = worker(&queue, Arc::new(ScriptedBackend::default()), limiter(10))
        .run(&enqueued.queue_id)
        .expect("rerun");
    assert_eq!(rerun.completed, 1);
    let snapshot = queue.snapshot(&enqueued.queue_id).expect("snapshot");
    assert_eq!(snapshot.stats.complete, 3);
    assert_eq!(snapshot.status, QueueStatus::Complete);
}

#[test]
fn cancelled_failure_does_not_stop_on_error() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue
        .enqueue(&topics(&["first", "second", "third"]), &options())
        .expect("enqueue");

    let backend = Arc::new(CancellingBackend::new(
        ScriptedBackend::failing("first", UpstreamError::Unavailable("down".to_string())),
        &queue,
        &enqueued.items,
        "first",
    ));
    let summary = worker(&queue, backend, limiter(10))
        .stop_on_error(true)
        .run(&enqueued.queue_id)
        .expect("run");

    assert_eq!(summary.stop_reason, StopReason::Drained);
    assert_eq!((summary.completed, summary.failed, summary.discarded), (2, 0, 1));
    assert_eq!(
        queue.stats(&enqueued.queue_id).expect("stats"),
        QueueStats {
            total: 3,
            pending: 0,
            processing: 0,
            complete: 2,
            failed: 0,
            cancelled: 1,
        }
    );
}

#[test]
fn cancel_while_waiting_for_admission_skips_the_call() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["late"]), &options()).expect("enqueue");
    let id = enqueued.items[0].id.clone();

    let clock = Arc::new(ManualClock::new(0));
    let limiter = Arc::new(RateLimiter::with_clock(
        RateLimitConfig {
            max_requests: 1,
            window_ms: 1_000,
            cooldown_ms: 1_000,
        },
        clock.clone(),
    ));
    limiter.record_request();
    let backend = Arc::new(ScriptedBackend::default());

    let handle = queue.start(&enqueued.queue_id, worker(&queue, backend.clone(), limiter));
    for _ in 0..400 {
        if queue.get_item(&id).expect("item").status == ItemStatus::Processing {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    queue.cancel(&id).expect("cancel");
    clock.advance(1_000);
    let summary = handle.join().expect("worker thread").expect("run");

    assert_eq!(summary.stop_reason, StopReason::Drained);
    assert_eq!((summary.completed, summary.discarded), (0, 1));
    assert!(backend.calls().is_empty());
    assert_eq!(queue.get_item(&id).expect("item").status, ItemStatus::Cancelled);
}

#[test]
fn panicking_worker_releases_the_queue() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["fragile"]), &options()).expect("enqueue");

    let handle = queue.start(
        &enqueued.queue_id,
        worker(&queue, Arc::new(CrashingBackend), limiter(10)),
    );
    assert!(handle.join().is_err());
    assert_eq!(queue.stats(&enqueued.queue_id).expect("stats").processing, 1);

    assert_eq!(queue.recover_interrupted().expect("recover"), 1);
    let summary = worker(&queue, Arc::new(ScriptedBackend::default()), limiter(10))
        .run(&enqueued.queue_id)
        .expect("rerun after crash");
    assert_eq!(summary.completed, 1);
    assert!(!queue.stats(&enqueued.queue_id).expect("stats").is_active());
}

#[test]
fn store_error_after_claim_returns_item_to_pending() {
    let dir = tempdir().expect("tempdir");
    let config = StorageConfig {
        quota_bytes: 32 * 4096,
        ..StorageConfig::default()
    };
    let store = Store::open(&dir.path().join("small.sqlite"), &config).expect("store");
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["huge"]), &options()).expect("enqueue");

    let err = worker(
        &queue,
        Arc::new(OversizedBackend(ScriptedBackend::default())),
        limiter(10),
    )
    .run(&enqueued.queue_id)
    .expect_err("result does not fit");
    assert!(matches!(err, CoreError::WriteFailed(_)));

    let item = queue.get_item(&enqueued.items[0].id).expect("item");
    assert_eq!(item.status, ItemStatus::Pending);
    assert!(item.result.is_none());
}

#[test]
fn status_reads_do_not_register_queues() {
    let store = store();
    let queue = queue(&store);
    let enqueued = queue.enqueue(&topics(&["stuck"]), &options()).expect("enqueue");
    queue
        .update_item(
            &enqueued.items[0].id,
            ItemPatch {
                status: Some(ItemStatus::Processing),
                ..ItemPatch::default()
            },
        )
        .expect("processing");

    for n in 0..5 {
        assert!(!queue.is_paused(&format!("never-started-{n}")));
    }
    assert_eq!(queue.recover_interrupted().expect("recover"), 1);
    assert!(queue.controls().is_empty());

    queue.pause(&enqueued.queue_id);
    assert!(queue.is_paused(&enqueued.queue_id));
    assert_eq!(queue.controls().len(), 1);
}
