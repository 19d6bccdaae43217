//! Single-worker FIFO executor.
//!
//! Every decoder call made by the engine goes through a [`TaskQueue`] so that the real-time
//! render thread never blocks on decoding. The worker thread is spawned lazily on the first
//! submission and sleeps on a counting semaphore between items.
//!
//! ## Shutdown
//! [`TaskQueue::shutdown`] marks the queue cancelled under the same mutex as the pending items,
//! wakes the worker and joins it once the backlog has drained. Called from a task on the worker
//! itself, it returns at once and the worker drains the backlog after that task. Synchronous
//! callers whose item can no longer run are released with [`QueueError::Cancelled`].

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use thiserror::Error;

use crate::error::{EngineError, codes};
use crate::sync::{AtomicFlag, Semaphore, lock};

/// Unit of work executed on the queue thread.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue has been shut down")]
    Cancelled,
    #[error("task panicked before producing a result")]
    Panicked,
    #[error("failed to spawn task queue worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        EngineError::precondition(codes::QUEUE_CANCELLED, err.to_string())
    }
}

#[derive(Default)]
struct Completion {
    done: Semaphore,
    executed: AtomicFlag,
}

struct QueuedTask {
    work: Task,
    completion: Option<Arc<Completion>>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<QueuedTask>,
    cancelled: bool,
    worker: Option<ThreadId>,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    wake: Semaphore,
}

/// FIFO task executor backed by one named background thread.
pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                wake: Semaphore::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue `work` and return immediately.
    pub fn run_async<F>(&self, work: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.submit(QueuedTask {
            work: Box::new(work),
            completion: None,
        })
    }

    /// Enqueue `work` and block until it has executed.
    ///
    /// Errors returned by `work` are logged by the worker, not returned here; use
    /// [`TaskQueue::call`] when the caller needs the outcome. Called from the worker thread
    /// itself, `work` runs inline.
    pub fn run_sync<F>(&self, work: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_worker_thread() {
            execute(
                &self.shared.name,
                QueuedTask {
                    work: Box::new(work),
                    completion: None,
                },
            );
            return Ok(());
        }

        let completion = Arc::new(Completion::default());
        self.submit(QueuedTask {
            work: Box::new(work),
            completion: Some(completion.clone()),
        })?;
        completion.done.wait();
        if completion.executed.get() {
            Ok(())
        } else {
            Err(QueueError::Cancelled)
        }
    }

    /// Run `work` on the queue thread and hand its return value back to the caller.
    pub fn call<R, F>(&self, work: F) -> Result<R, QueueError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let slot_task = slot.clone();
        self.run_sync(move || {
            let value = work();
            *lock(&slot_task) = Some(value);
            Ok(())
        })?;
        let value = lock(&slot).take();
        value.ok_or(QueueError::Panicked)
    }

    /// Block until everything queued before this call has executed.
    pub fn flush(&self) -> Result<(), QueueError> {
        self.run_sync(|| Ok(()))
    }

    pub fn is_worker_thread(&self) -> bool {
        lock(&self.shared.state).worker == Some(thread::current().id())
    }

    /// Stop the worker after the backlog drains and release any remaining synchronous waiters.
    ///
    /// Idempotent. On the worker thread itself this only marks the queue cancelled; the worker
    /// keeps running queued items and exits once the queue is empty.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            if !state.cancelled {
                tracing::debug!(
                    queue = %self.shared.name,
                    pending = state.tasks.len(),
                    "task queue shutting down"
                );
            }
            state.cancelled = true;
        }
        self.shared.wake.signal();
        if self.is_worker_thread() {
            return;
        }

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(queue = %self.shared.name, "task queue worker exited by panic");
            }
        }

        let leftovers: Vec<QueuedTask> = lock(&self.shared.state).tasks.drain(..).collect();
        for task in leftovers {
            if let Some(completion) = task.completion {
                completion.done.signal();
            }
        }
    }

    fn submit(&self, task: QueuedTask) -> Result<(), QueueError> {
        if lock(&self.shared.state).cancelled {
            return Err(QueueError::Cancelled);
        }
        self.ensure_worker()?;
        {
            let mut state = lock(&self.shared.state);
            if state.cancelled {
                return Err(QueueError::Cancelled);
            }
            state.tasks.push_back(task);
        }
        self.shared.wake.signal();
        Ok(())
    }

    fn ensure_worker(&self) -> Result<(), QueueError> {
        let mut worker = lock(&self.worker);
        if worker.is_none() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(self.shared.name.clone())
                .spawn(move || run_worker(&shared))?;
            *worker = Some(handle);
        }
        Ok(())
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Next {
    Run(QueuedTask),
    Sleep,
    Exit,
}

fn run_worker(shared: &Shared) {
    lock(&shared.state).worker = Some(thread::current().id());
    tracing::debug!(queue = %shared.name, "task queue worker started");

    loop {
        let next = {
            let mut state = lock(&shared.state);
            match state.tasks.pop_front() {
                Some(task) => Next::Run(task),
                None if state.cancelled => Next::Exit,
                None => Next::Sleep,
            }
        };
        match next {
            Next::Run(task) => execute(&shared.name, task),
            Next::Sleep => shared.wake.wait(),
            Next::Exit => break,
        }
    }

    tracing::debug!(queue = %shared.name, "task queue worker stopped");
}

fn execute(queue: &str, task: QueuedTask) {
    let QueuedTask { work, completion } = task;
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(queue = %queue, "task failed: {err:#}"),
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            tracing::error!(queue = %queue, panic = %panic, "task panicked");
        }
    }
    if let Some(completion) = completion {
        completion.executed.set(true);
        completion.done.signal();
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Barrier, mpsc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn async_tasks_run_in_submission_order() {
        let queue = TaskQueue::new("test-fifo");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = seen.clone();
            queue
                .run_async(move || {
                    seen.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        queue.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn run_sync_returns_after_work_executes() {
        let queue = TaskQueue::new("test-sync");
        let ran = Arc::new(AtomicFlag::new(false));
        let ran_task = ran.clone();
        queue
            .run_sync(move || {
                thread::sleep(Duration::from_millis(20));
                ran_task.set(true);
                Ok(())
            })
            .unwrap();
        assert!(ran.get());
    }

    #[test]
    fn run_sync_waits_behind_earlier_async_items() {
        let queue = TaskQueue::new("test-sync-order");
        let gate = Arc::new(Barrier::new(2));
        let count = Arc::new(AtomicUsize::new(0));

        let gate_task = gate.clone();
        let count_task = count.clone();
        queue
            .run_async(move || {
                gate_task.wait();
                count_task.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        gate.wait();
        let count_sync = count.clone();
        let observed = queue
            .call(move || count_sync.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(observed, 1);
    }

    #[test]
    fn worker_survives_errors_and_panics() {
        let queue = TaskQueue::new("test-survive");
        queue.run_async(|| Err(anyhow::anyhow!("boom"))).unwrap();
        queue.run_async(|| panic!("task panic")).unwrap();
        let value = queue.call(|| 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn call_reports_panicked_work() {
        let queue = TaskQueue::new("test-call-panic");
        let result: Result<u32, _> = queue.call(|| panic!("no value"));
        assert!(matches!(result, Err(QueueError::Panicked)));
        assert_eq!(queue.call(|| 1).unwrap(), 1);
    }

    #[test]
    fn run_sync_from_worker_runs_inline() {
        let queue = Arc::new(TaskQueue::new("test-inline"));
        let queue_task = queue.clone();
        let nested = queue
            .call(move || {
                let hit = Arc::new(AtomicFlag::new(false));
                let hit_inner = hit.clone();
                queue_task
                    .run_sync(move || {
                        hit_inner.set(true);
                        Ok(())
                    })
                    .map(|_| hit.get())
            })
            .unwrap();
        assert!(nested.unwrap());
    }

    #[test]
    fn shutdown_drains_backlog_then_rejects_submissions() {
        let queue = TaskQueue::new("test-shutdown");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = count.clone();
            queue
                .run_async(move || {
                    thread::sleep(Duration::from_millis(2));
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        queue.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 8);
        assert!(matches!(queue.run_async(|| Ok(())), Err(QueueError::Cancelled)));
        assert!(matches!(queue.run_sync(|| Ok(())), Err(QueueError::Cancelled)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let queue = TaskQueue::new("test-idempotent");
        queue.flush().unwrap();
        queue.shutdown();
        queue.shutdown();
        assert!(lock(&queue.shared.state).tasks.is_empty());
    }

    #[test]
    fn shutdown_from_a_task_still_runs_waiting_callers() {
        let queue = Arc::new(TaskQueue::new("test-shutdown-inside"));
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        queue
            .run_async(move || {
                let _ = started_tx.send(());
                let _ = go_rx.recv();
                Ok(())
            })
            .unwrap();
        started_rx.recv().unwrap();

        let queue_task = queue.clone();
        queue
            .run_async(move || {
                queue_task.shutdown();
                Ok(())
            })
            .unwrap();

        let ran = Arc::new(AtomicFlag::new(false));
        let ran_task = ran.clone();
        let queue_caller = queue.clone();
        let caller = thread::spawn(move || {
            queue_caller.run_sync(move || {
                ran_task.set(true);
                Ok(())
            })
        });
        while lock(&queue.shared.state).tasks.len() < 2 {
            thread::yield_now();
        }

        go_tx.send(()).unwrap();
        assert!(caller.join().unwrap().is_ok());
        assert!(ran.get());
        assert!(matches!(queue.run_async(|| Ok(())), Err(QueueError::Cancelled)));
    }

    #[test]
    fn queue_error_maps_to_precondition() {
        let err: EngineError = QueueError::Cancelled.into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);
        assert_eq!(err.code(), codes::QUEUE_CANCELLED);
    }
}
