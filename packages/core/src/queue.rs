//! In-process execution substrate.
//!
//! [`LocalTaskQueue`] keeps a de-duplicated pending list and a periodic
//! table keyed by [`Task`]. [`run_worker`] drains it with bounded
//! concurrency until the shutdown future resolves, then waits for in-flight
//! tasks to finish.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::pipeline::engine::TaskOutcome;
use crate::pipeline::ScanPipeline;
use crate::scheduler::{QueueError, Task, TaskQueue};

#[derive(Debug, Clone, Copy)]
struct Periodic {
    every: Duration,
    next_due: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    periodic: HashMap<Task, Periodic>,
    running: HashSet<Task>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct LocalTaskQueue {
    state: Mutex<QueueState>,
}

impl LocalTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move due periodic tasks onto the pending list, then hand out up to
    /// `limit` pending tasks that are not already running.
    pub fn take_ready(&self, now: Instant, limit: usize) -> Vec<Task> {
        let mut state = self.lock();
        let QueueState {
            pending,
            periodic,
            running,
            ..
        } = &mut *state;

        for (task, entry) in periodic.iter_mut() {
            if entry.next_due <= now {
                entry.next_due = now + entry.every;
                if !pending.contains(task) {
                    pending.push_back(task.clone());
                }
            }
        }

        let mut ready = Vec::new();
        let mut deferred = VecDeque::with_capacity(pending.len());
        while let Some(task) = pending.pop_front() {
            if ready.len() < limit && !running.contains(&task) {
                running.insert(task.clone());
                ready.push(task);
            } else {
                deferred.push_back(task);
            }
        }
        *pending = deferred;
        ready
    }

    /// Mark a task handed out by [`LocalTaskQueue::take_ready`] as finished.
    pub fn complete(&self, task: &Task) {
        self.lock().running.remove(task);
    }

    /// Refuse further enqueues. Periodic entries stay but are no longer used.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn periodic_len(&self) -> usize {
        self.lock().periodic.len()
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if !state.pending.contains(&task) {
            state.pending.push_back(task);
        }
        Ok(())
    }

    async fn schedule_periodic(&self, task: Task, every: Duration) -> Result<(), QueueError> {
        if every.is_zero() {
            return Err(QueueError::InvalidSchedule {
                task: task.to_string(),
                reason: "interval must be positive".to_string(),
            });
        }
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let next_due = Instant::now() + every;
        state.periodic.insert(task, Periodic { every, next_due });
        Ok(())
    }

    async fn purge_pending(&self) -> Result<usize, QueueError> {
        let mut state = self.lock();
        let purged = state.pending.len();
        state.pending.clear();
        Ok(purged)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Tasks allowed to run at the same time.
    pub concurrency: usize,
    /// How often the queue is checked for ready tasks.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Drain `queue` through `pipeline` until `shutdown` resolves.
pub async fn run_worker<F>(
    queue: Arc<LocalTaskQueue>,
    pipeline: Arc<ScanPipeline>,
    config: WorkerConfig,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let concurrency = config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut poll = interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    tracing::info!("Worker started (concurrency: {})", concurrency);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                dispatch_ready(&queue, &pipeline, &semaphore, &mut in_flight);
            }

            Some(joined) = in_flight.join_next() => {
                if let Err(err) = joined {
                    tracing::error!("Worker task aborted: {}", err);
                }
            }

            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received. Stopping worker.");
                break;
            }
        }
    }

    queue.close();
    tracing::info!("Waiting for {} in-flight tasks", in_flight.len());
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            tracing::error!("Worker task aborted: {}", err);
        }
    }
    tracing::info!("Worker stopped cleanly");
}

/// Clears a task's running mark however its future ends.
struct RunningGuard {
    queue: Arc<LocalTaskQueue>,
    task: Task,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.queue.complete(&self.task);
    }
}

fn dispatch_ready(
    queue: &Arc<LocalTaskQueue>,
    pipeline: &Arc<ScanPipeline>,
    semaphore: &Arc<Semaphore>,
    in_flight: &mut JoinSet<()>,
) {
    let available = semaphore.available_permits();
    if available == 0 {
        return;
    }

    for task in queue.take_ready(Instant::now(), available) {
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            // Not reachable while this loop is the only acquirer; put it back.
            queue.complete(&task);
            break;
        };
        let running = RunningGuard {
            queue: queue.clone(),
            task: task.clone(),
        };
        let pipeline = pipeline.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            let _running = running;

            // Run the body on its own task so an adapter panic surfaces here
            // as a JoinError instead of unwinding through this future.
            let job = {
                let pipeline = pipeline.clone();
                let task = task.clone();
                tokio::spawn(async move { pipeline.execute(&task).await })
            };

            match job.await {
                Ok(Ok(TaskOutcome::Scanned(report))) => tracing::debug!(
                    "{} done: {} revisions, {} findings",
                    task,
                    report.revisions_created(),
                    report.findings_recorded
                ),
                Ok(Ok(TaskOutcome::Audited(report))) => {
                    tracing::debug!("{} done: {} findings", task, report.findings_recorded)
                }
                Ok(Ok(TaskOutcome::Expired(removed))) => {
                    tracing::debug!("{} done: {} records removed", task, removed)
                }
                Ok(Err(err)) => tracing::warn!("{} failed: {}", task, err.detail()),
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    pipeline.record_panic(&task, &message).await;
                }
                Err(join_err) => tracing::warn!("{} was cancelled: {}", task, join_err),
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
