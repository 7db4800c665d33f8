use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::config::WorkerConfig;
use crate::error::{NodeError, Result};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

type IdleFn = Arc<dyn Fn() + Send + Sync + 'static>;

// How often a worker without idle work checks for shutdown.
const STOP_POLL: Duration = Duration::from_millis(50);

struct Shared {
    jobs: Sender<Job>,
    queued: Receiver<Job>,
    idle: Mutex<Option<IdleFn>>,
    stop: AtomicBool,
    idle_interval: Duration,
}

/// Background thread draining a bounded FIFO of jobs.
///
/// Used to move blocking pipe work off the dispatch task. When an idle
/// callback is installed it runs after every wait, at least once per
/// `idle_interval`.
pub struct Worker {
    name: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(config: WorkerConfig) -> Result<Self> {
        let (jobs, queued) = crossbeam_channel::bounded(config.queue_depth.max(1));
        let shared = Arc::new(Shared {
            jobs,
            queued,
            idle: Mutex::new(None),
            stop: AtomicBool::new(false),
            idle_interval: config.idle_interval,
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || worker_main(&shared))?
        };
        Ok(Self {
            name: config.name,
            shared,
            thread: Some(thread),
        })
    }

    /// Queue a job without blocking.
    pub fn run<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.jobs.try_send(Box::new(job)).map_err(|_| {
            tracing::warn!(worker = %self.name, "worker queue full, job dropped");
            NodeError::WorkerQueueFull
        })
    }

    /// Install the periodic idle callback.
    pub fn set_idle<F>(&self, idle: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.idle_slot() = Some(Arc::new(idle));
    }

    pub fn clear_idle(&self) {
        *self.idle_slot() = None;
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queued.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn idle_slot(&self) -> std::sync::MutexGuard<'_, Option<IdleFn>> {
        self.shared
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn worker_main(shared: &Shared) {
    while !shared.stop.load(Ordering::Acquire) {
        let idle = shared
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let wait = if idle.is_some() {
            shared.idle_interval
        } else {
            STOP_POLL
        };
        if let Ok(job) = shared.queued.recv_timeout(wait) {
            job();
        }
        if let Some(idle) = idle {
            idle();
        }
    }
    // Jobs queued before shutdown still run.
    while let Ok(job) = shared.queued.try_recv() {
        job();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            // A job may hold the last reference to its own worker.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
