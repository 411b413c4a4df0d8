use std::sync::Arc;

use anyhow::{Result, anyhow};
use infographic_store::backend::CommandBackend;
use infographic_store::compress::Compressor;
use infographic_store::poller::AdaptivePoller;
use infographic_store::queue::{EnqueueOptions, Worker};
use infographic_store::rate_limit::RateLimiter;
use infographic_store::util::write_json_stdout;
use serde_json::json;
use tracing::info;

use super::Context;
use crate::cli::{BatchCommand, EnqueueArgs, RunArgs};

pub fn run(context: &Context, command: BatchCommand) -> Result<()> {
    let queue = context.queue();

    match command {
        BatchCommand::Enqueue(args) => enqueue(context, args),
        BatchCommand::List => write_json_stdout(&queue.list_queues()?),
        BatchCommand::Stats { queue_id } => write_json_stdout(&queue.stats(&queue_id)?),
        BatchCommand::Show { queue_id } => write_json_stdout(&queue.snapshot(&queue_id)?),
        BatchCommand::Retry { item_id } => write_json_stdout(&queue.retry(&item_id)?),
        BatchCommand::Cancel { item_id } => write_json_stdout(&queue.cancel(&item_id)?),
        BatchCommand::Run(args) => run_queue(context, args),
        BatchCommand::Clear { queue_id } => {
            let removed = queue.clear_finished(&queue_id)?;
            write_json_stdout(&json!({ "queueId": queue_id, "removed": removed }))
        }
    }
}

fn enqueue(context: &Context, args: EnqueueArgs) -> Result<()> {
    let options = EnqueueOptions {
        style: args.style,
        palette: args.palette,
        size: args.size,
        aspect_ratio: args.aspect_ratio,
        filters: (!args.filters.is_empty()).then_some(args.filters),
    };
    let enqueued = context.queue().enqueue(&args.topics, &options)?;
    write_json_stdout(&enqueued)
}

fn run_queue(context: &Context, args: RunArgs) -> Result<()> {
    let queue = context.queue();
    queue.recover_interrupted()?;

    let backend = Arc::new(CommandBackend::new(args.backend_cmd, args.backend_args));
    let limiter = Arc::new(RateLimiter::new(context.config.rate_limit.clone()));
    let mut worker = Worker::new(
        queue.clone(),
        backend,
        limiter,
        Compressor::new(context.config.compression.clone()),
    )
    .stop_on_error(args.stop_on_error);
    if !args.no_history {
        worker = worker.with_history(context.history());
    }

    let poll_queue = queue.clone();
    let poll_id = args.queue_id.clone();
    let poller = AdaptivePoller::new(context.config.poller.clone()).spawn(
        move || poll_queue.snapshot(&poll_id),
        |snapshot| {
            info!(
                queue_id = %snapshot.queue_id,
                status = ?snapshot.status,
                pending = snapshot.stats.pending,
                processing = snapshot.stats.processing,
                complete = snapshot.stats.complete,
                failed = snapshot.stats.failed,
                "batch progress"
            );
        },
    );

    let summary = queue
        .start(&args.queue_id, worker)
        .join()
        .map_err(|_| anyhow!("batch worker thread panicked"))??;
    poller.cancel();
    let _ = poller.join();

    let snapshot = queue.snapshot(&args.queue_id)?;
    write_json_stdout(&json!({ "summary": summary, "snapshot": snapshot }))
}
