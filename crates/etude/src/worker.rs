// src/worker.rs
use crate::error::{EtudeError, EtudeResult};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A task never runs under this lock, so poisoning cannot leave the
        // queue half-updated.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed set of worker threads draining one FIFO task queue.
///
/// Shutdown is explicit: new submissions are refused, workers finish every
/// task already queued, then all threads are joined.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). With `pin` set, worker `i` is
    /// pinned to core `i % cores`.
    pub fn new(size: usize, pin: bool) -> EtudeResult<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::with_capacity(size * 2),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let worker_shared = shared.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    worker_loop(i, &worker_shared);
                });

            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    let mut pool = Self { shared, handles };
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }

        Ok(Self { shared, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queue `task` and wake one idle worker.
    pub fn submit<F>(&self, task: F) -> EtudeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(EtudeError::PoolClosed);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Tasks queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Refuse new work, let workers drain the queue, and join them.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.lock().closed = true;
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread exited by panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        if let Some(task) = queue.tasks.pop_front() {
            drop(queue);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(worker = id, "task panicked");
            }
            queue = shared.lock();
        } else if queue.closed {
            break;
        } else {
            queue = shared
                .available
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}
