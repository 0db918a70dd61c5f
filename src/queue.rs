//! Priority Request Queue
//!
//! Bounded, concurrency-limited admission of calls.
//!
//! # Design
//!
//! - One `VecDeque` kept sorted: higher priority first, then ascending id
//! - Insertion position found by binary search (`partition_point`)
//! - Registration is synchronous; dispatch happens on a pump task, so a burst
//!   of enqueues made in one go is ordered by priority before anything starts
//! - At most `concurrency` tasks run; each completion re-pumps the queue
//! - `clear`/`destroy` reject tasks that have not started; running tasks finish

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    /// Maximum tasks running at once
    pub concurrency: usize,
    /// Maximum waiting tasks (0 = unbounded)
    pub max_queue_length: usize,
    /// Priority used when a call does not set one
    pub default_priority: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 6,
            max_queue_length: 0,
            default_priority: 0,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub concurrency: usize,
    pub paused: bool,
    pub enqueued: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub rejected: u64,
    pub overflowed: u64,
}

/// Started with `Ok(())`, rejected with `Err(error)`
type Job = Box<dyn FnOnce(std::result::Result<(), Error>) -> Option<BoxFuture<'static, ()>> + Send>;

struct QueuedTask {
    id: u64,
    priority: i32,
    job: Job,
}

struct QueueState {
    tasks: VecDeque<QueuedTask>,
    running: usize,
    concurrency: usize,
    paused: bool,
    destroyed: bool,
    stats: QueueStats,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

/// Concurrency-limited priority queue
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let state = QueueState {
            tasks: VecDeque::new(),
            running: 0,
            concurrency: config.concurrency.max(1),
            paused: false,
            destroyed: false,
            stats: QueueStats::default(),
        };
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(state),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Check if the queue gates calls at all
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Priority applied when the caller gives none
    pub fn default_priority(&self) -> i32 {
        self.inner.config.default_priority
    }

    /// Queue `f` at `priority`.
    ///
    /// Registration (and overflow rejection) happens before this returns;
    /// the returned future settles with `f`'s result.
    pub fn enqueue<T, F, Fut>(&self, priority: i32, f: F) -> BoxFuture<'static, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.register(priority, f) {
            Ok(rx) => async move {
                rx.await
                    .unwrap_or_else(|_| Err(Error::Internal("queued task dropped".into())))
            }
            .boxed(),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    }

    fn register<T, F, Fut>(&self, priority: i32, f: F) -> Result<oneshot::Receiver<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |start| match start {
            Ok(()) => Some(
                async move {
                    let _ = tx.send(f().await);
                }
                .boxed(),
            ),
            Err(e) => {
                let _ = tx.send(Err(e));
                None
            }
        });

        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(Error::EngineDestroyed);
            }
            let max = self.inner.config.max_queue_length;
            if max > 0 && state.tasks.len() >= max {
                state.stats.overflowed += 1;
                warn!(max_length = max, "Request queue full");
                return Err(Error::QueueOverflow { max_length: max });
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let pos = state.tasks.partition_point(|t| t.priority >= priority);
            state.tasks.insert(pos, QueuedTask { id, priority, job });
            state.stats.enqueued += 1;
            trace!(id, priority, position = pos, "Queued task");
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.pump() });
        Ok(rx)
    }

    /// Stop dispatching; queued tasks wait until `resume`
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Resume dispatching
    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.pump();
    }

    /// Change the concurrency limit
    pub fn set_concurrency(&self, concurrency: usize) {
        self.inner.state.lock().concurrency = concurrency.max(1);
        self.inner.pump();
    }

    /// Reject every task that has not started with `QueueCleared`
    pub fn clear(&self) -> usize {
        self.inner.reject_all(|| Error::QueueCleared, false)
    }

    /// Reject waiting tasks with `EngineDestroyed` and refuse new ones
    pub fn destroy(&self) -> usize {
        self.inner.reject_all(|| Error::EngineDestroyed, true)
    }

    /// Tasks waiting to start
    pub fn size(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Tasks currently running
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            queued: state.tasks.len(),
            running: state.running,
            concurrency: state.concurrency,
            paused: state.paused,
            ..state.stats.clone()
        }
    }
}

impl QueueInner {
    fn pump(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if state.paused || state.destroyed || state.running >= state.concurrency {
                    return;
                }
                let Some(task) = state.tasks.pop_front() else {
                    return;
                };
                state.running += 1;
                state.stats.dispatched += 1;
                task
            };
            trace!(id = task.id, priority = task.priority, "Dispatching task");

            let Some(run) = (task.job)(Ok(())) else {
                continue;
            };
            let inner = self.clone();
            tokio::spawn(async move {
                run.await;
                {
                    let mut state = inner.state.lock();
                    state.running -= 1;
                    state.stats.completed += 1;
                }
                inner.pump();
            });
        }
    }

    fn reject_all(&self, error: impl Fn() -> Error, destroy: bool) -> usize {
        let drained: Vec<QueuedTask> = {
            let mut state = self.state.lock();
            if destroy {
                state.destroyed = true;
            }
            let drained: Vec<QueuedTask> = state.tasks.drain(..).collect();
            state.stats.rejected += drained.len() as u64;
            drained
        };
        let count = drained.len();
        for task in drained {
            (task.job)(Err(error()));
        }
        if count > 0 {
            debug!(count, "Rejected queued tasks");
        }
        count
    }
}

// =============================================================================
// Tests
// =============================================================================
