//! Watches an active queue at a widening interval until it settles.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::PollerConfig;
use crate::error::CoreResult;
use crate::queue::QueueSnapshot;

/// Short polls first, then medium, then long forever.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    config: PollerConfig,
}

impl PollSchedule {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    /// Delay before poll number `completed + 1`.
    pub fn interval_for(&self, completed: u32) -> Duration {
        if completed < self.config.short_polls {
            self.config.short_interval()
        } else if completed < self.config.short_polls + self.config.medium_polls {
            self.config.medium_interval()
        } else {
            self.config.long_interval()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEnd {
    /// The queue had nothing pending or processing.
    Settled,
    Cancelled,
}

#[derive(Debug)]
pub struct PollerHandle {
    cancel: Sender<()>,
    handle: JoinHandle<PollEnd>,
}

impl PollerHandle {
    /// Stops further polls. A poll already in flight finishes first.
    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }

    pub fn join(self) -> thread::Result<PollEnd> {
        self.handle.join()
    }
}

#[derive(Debug, Clone)]
pub struct AdaptivePoller {
    schedule: PollSchedule,
}

impl AdaptivePoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            schedule: PollSchedule::new(config),
        }
    }

    /// Calls `fetch` right away and then on the schedule, handing every
    /// snapshot to `observe`. Fetch errors are logged and polling goes on.
    pub fn spawn<F, O>(&self, mut fetch: F, mut observe: O) -> PollerHandle
    where
        F: FnMut() -> CoreResult<QueueSnapshot> + Send + 'static,
        O: FnMut(&QueueSnapshot) + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let schedule = self.schedule.clone();

        let handle = thread::spawn(move || {
            let mut completed = 0u32;
            loop {
                match fetch() {
                    Ok(snapshot) => {
                        observe(&snapshot);
                        if !snapshot.stats.is_active() {
                            debug!(queue_id = %snapshot.queue_id, polls = completed + 1, "queue settled");
                            return PollEnd::Settled;
                        }
                    }
                    Err(err) => warn!(error = %err, "queue poll failed"),
                }
                let wait = schedule.interval_for(completed);
                completed = completed.saturating_add(1);

                match cancelled.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return PollEnd::Cancelled,
                }
            }
        });

        PollerHandle { cancel, handle }
    }
}
