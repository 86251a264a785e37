//! Repeating task scheduling for window resets.
//!
//! The gate never spawns timers on its own; it asks a [`Scheduler`] for a
//! repeating task and keeps the returned [`ScheduledTask`] as the
//! cancellation handle.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

use crate::error::{CallgateError, Result};

/// Body of a repeating task. Returning `ControlFlow::Break` stops the repetition.
pub type RepeatingTask = Box<dyn FnMut() -> ControlFlow<()> + Send + 'static>;

/// Something that can run a callback every `period`.
pub trait Scheduler: Send + Sync {
    /// Schedule `task` to run every `period`, first after one full `period`.
    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> ScheduledTask;
}

/// Cancellation handle for a repeating task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    fn new(stop: oneshot::Sender<()>, join: Option<JoinHandle<()>>) -> Self {
        Self {
            stop: Some(stop),
            join,
        }
    }

    /// Stop the task. Calling this more than once has no further effect.
    pub fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The receiver is gone if the task already stopped itself.
            let _ = stop.send(());
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_none()
    }

    /// Whether the background task has exited.
    ///
    /// Always `true` for tasks without a backing tokio task once cancelled.
    pub fn is_finished(&self) -> bool {
        match &self.join {
            Some(join) => join.is_finished(),
            None => self.is_cancelled(),
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Scheduler backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Use the runtime the caller is currently running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| CallgateError::Runtime(e.to_string()))?;
        Ok(Self { handle })
    }

    /// Use an explicit runtime handle.
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, period: Duration, mut task: RepeatingTask) -> ScheduledTask {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join = self.handle.spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if task().is_break() {
                            break;
                        }
                    }
                }
            }

            trace!(period_ms = period.as_millis() as u64, "Repeating task stopped");
        });

        ScheduledTask::new(stop_tx, Some(join))
    }
}

struct ManualEntry {
    task: RepeatingTask,
    stop: oneshot::Receiver<()>,
}

/// Scheduler whose tasks only run when [`tick`](ManualScheduler::tick) is called.
///
/// Useful when the caller drives window boundaries itself, and in tests
/// that need resets at exact points.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualScheduler {
    /// Create a scheduler with no tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every live task once. Returns how many tasks ran.
    pub fn tick(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut ran = 0;

        entries.retain_mut(|entry| {
            if !matches!(entry.stop.try_recv(), Err(TryRecvError::Empty)) {
                return false;
            }
            ran += 1;
            (entry.task)().is_continue()
        });

        ran
    }

    /// Number of tasks that have not been cancelled or stopped.
    pub fn active(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain_mut(|entry| matches!(entry.stop.try_recv(), Err(TryRecvError::Empty)));
        entries.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, _period: Duration, task: RepeatingTask) -> ScheduledTask {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        self.entries.lock().push(ManualEntry {
            task,
            stop: stop_rx,
        });
        ScheduledTask::new(stop_tx, None)
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("tasks", &self.entries.lock().len())
            .finish()
    }
}
