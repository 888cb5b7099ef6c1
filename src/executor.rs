//! Background task execution.
//!
//! Tasks run on dedicated threads and sleep on a channel: a message wakes
//! them early, channel closure or an explicit shutdown message stops them,
//! and a receive timeout provides the periodic schedule.

use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::config::EngineConfig;
use crate::stats::EngineStats;
use std::sync::Arc;

enum TaskSignal {
    Wake,
    Shutdown,
}

/// Handle for waking a background task ahead of its schedule.
#[derive(Clone)]
pub struct TaskWaker {
    tx: Sender<TaskSignal>,
}

impl TaskWaker {
    /// Wake the task now. Waking a stopped task is a no-op.
    pub fn wake(&self) {
        let _ = self.tx.send(TaskSignal::Wake);
    }
}

struct RunningTask {
    name: String,
    tx: Sender<TaskSignal>,
    join: Option<thread::JoinHandle<()>>,
}

/// Owner of all background threads for one bucket.
#[derive(Default)]
pub struct TaskExecutor {
    tasks: Mutex<Vec<RunningTask>>,
}

impl TaskExecutor {
    /// Executor with no tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that runs `job` every `interval`, or sooner when woken.
    pub fn spawn_periodic<F>(&self, name: &str, interval: Duration, mut job: F) -> TaskWaker
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = unbounded::<TaskSignal>();
        let task_name = name.to_string();
        let join = thread::Builder::new()
            .name(task_name.clone())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(TaskSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(TaskSignal::Wake) | Err(RecvTimeoutError::Timeout) => job(),
                }
            })
            .ok();
        let waker = TaskWaker { tx: tx.clone() };
        self.tasks.lock().push(RunningTask {
            name: task_name,
            tx,
            join,
        });
        waker
    }

    /// Spawn a task that waits to be woken, runs `job`, and waits again.
    /// The task never runs on a timer.
    pub fn spawn_on_demand<F>(&self, name: &str, job: F) -> TaskWaker
    where
        F: FnMut() + Send + 'static,
    {
        // A very long interval turns the periodic loop into wake-only.
        self.spawn_periodic(name, Duration::from_secs(60 * 60 * 24), job)
    }

    /// Run `job` once on a background thread.
    pub fn spawn_once<F>(&self, name: &str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, _rx) = unbounded::<TaskSignal>();
        let task_name = name.to_string();
        let join = thread::Builder::new()
            .name(task_name.clone())
            .spawn(job)
            .ok();
        self.tasks.lock().push(RunningTask {
            name: task_name,
            tx,
            join,
        });
    }

    /// Stop every task and join its thread.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.iter() {
            let _ = task.tx.send(TaskSignal::Shutdown);
        }
        for task in tasks.iter_mut() {
            trace!(name = %task.name, "joining background task");
            if let Some(join) = task.join.take() {
                let _ = join.join();
            }
        }
        tasks.clear();
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Explicit runtime wiring passed through constructors; tests build a fresh
/// context per case.
#[derive(Clone)]
pub struct RuntimeContext {
    /// Resolved engine configuration.
    pub config: EngineConfig,
    /// Shared counters.
    pub stats: Arc<EngineStats>,
    /// Background task executor.
    pub executor: Arc<TaskExecutor>,
}

impl RuntimeContext {
    /// Context with the given configuration and fresh stats/executor.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            stats: EngineStats::new(),
            executor: Arc::new(TaskExecutor::new()),
        }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
