// Worker - a named, single-threaded task execution context
//
// Each Worker owns one OS thread and a FIFO queue. Tasks posted from any
// thread are executed one at a time, strictly in submission order, which
// makes the Worker the unit of thread affinity for slots and services.
//
// Shutdown policy: run-to-completion. `stop()` closes the queue, lets the
// thread drain every task already accepted, then joins it.

pub mod registry;

pub use registry::WorkerRegistry;

use crate::error::{CoreError, CoreResult};
use crate::metrics::WorkerMetrics;
use crate::models::WorkerId;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Owned execution context with a dedicated thread and a FIFO task queue
///
/// `Worker` is a cheap, cloneable handle; all clones refer to the same
/// thread. The thread stops when [`stop()`](Self::stop) is called or when the
/// last handle is dropped.
///
/// # Example
/// ```ignore
/// let worker = Worker::new("io")?;
/// let handle = worker.post(|| 6 * 7);
/// assert_eq!(handle.wait()?, 42);
/// worker.stop();
/// ```
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    id: WorkerId,
    name: String,

    /// Queue sender; `None` once the worker is stopped
    task_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,

    /// Join handle of the worker thread; taken by the first `stop()`
    thread: Mutex<Option<JoinHandle<()>>>,

    thread_id: ThreadId,
    running: AtomicBool,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    /// Spawn a new worker thread named `worker-<name>`
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Task>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || {
                tracing::debug!("Worker '{}' thread started", thread_name);

                // Returns None once every sender is gone and the queue is empty,
                // so tasks accepted before stop() still run.
                while let Some(task) = task_rx.blocking_recv() {
                    task();
                }

                tracing::debug!("Worker '{}' thread terminated", thread_name);
            })?;

        let thread_id = handle.thread().id();
        tracing::info!("Worker '{}' started", name);

        Ok(Self {
            inner: Arc::new(WorkerInner {
                id: WorkerId::next(),
                name,
                task_tx: Mutex::new(Some(task_tx)),
                thread: Mutex::new(Some(handle)),
                thread_id,
                running: AtomicBool::new(true),
                metrics: Arc::new(WorkerMetrics::new()),
            }),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the worker still accepts tasks
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether the calling thread is this worker's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.inner.metrics
    }

    /// Enqueue a task and return a handle to its result
    ///
    /// Never blocks. Posting to a stopped worker is a documented no-op: the
    /// task is dropped unexecuted and the returned handle resolves to
    /// [`CoreError::WorkerStopped`].
    ///
    /// A panic inside the task is caught, logged and reported through the
    /// handle as [`CoreError::TaskPanicked`]; the worker keeps running.
    pub fn post<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let worker_name = self.inner.name.clone();
        let metrics = Arc::clone(&self.inner.metrics);

        let job: Task = Box::new(move || {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));

            let result = match outcome {
                Ok(value) => {
                    metrics.record_completed(started.elapsed());
                    Ok(value)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!("Task on worker '{}' panicked: {}", worker_name, message);
                    metrics.record_panicked();
                    Err(CoreError::TaskPanicked {
                        worker: worker_name,
                        message,
                    })
                }
            };

            // The caller may have dropped the handle; that is fine.
            let _ = result_tx.send(result);
        });

        let sender = self.inner.task_tx.lock();
        let accepted = match sender.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        drop(sender);

        if accepted {
            self.inner.metrics.record_posted();
            TaskHandle::pending(result_rx, self.inner.name.clone())
        } else {
            self.inner.metrics.record_rejected();
            tracing::debug!("Dropped task posted to stopped worker '{}'", self.inner.name);
            TaskHandle::rejected(self.inner.name.clone())
        }
    }

    /// Run a task on this worker and block until it finishes
    ///
    /// When called from the worker's own thread the task runs inline, since
    /// waiting on its own queue would deadlock. Otherwise it is posted and
    /// the calling thread blocks. Inside a multi-threaded tokio runtime the
    /// wait goes through `block_in_place`; inside a current-thread runtime
    /// the task is not posted and [`CoreError::BlockingInRuntime`] is
    /// returned.
    pub fn post_and_wait<F, R>(&self, task: F) -> CoreResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }
        blocking_context(&self.inner.name)?;
        self.post(task).wait()
    }

    /// Stop accepting tasks, drain the queue and join the thread
    ///
    /// Idempotent. Called from the worker's own thread, the queue is closed
    /// but the join is skipped.
    pub fn stop(&self) {
        self.inner.shutdown();
    }
}

impl WorkerInner {
    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender closes the queue; the thread drains and exits.
        let sender = self.task_tx.lock().take();
        drop(sender);

        if thread::current().id() == self.thread_id {
            tracing::warn!(
                "Worker '{}' stopped from its own thread, not joining",
                self.name
            );
            return;
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Worker '{}' thread terminated abnormally", self.name);
            }
        }

        tracing::info!("Worker '{}' stopped", self.name);
        self.metrics.log_summary(&self.name);
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Worker {}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Handle to the eventual result of a posted task
///
/// Dropping the handle does not cancel the task.
#[must_use = "dropping a TaskHandle detaches the task; call wait() or join() to observe its result"]
pub struct TaskHandle<R> {
    state: HandleState<R>,
    worker: String,
}

enum HandleState<R> {
    Pending(oneshot::Receiver<CoreResult<R>>),
    Ready(CoreResult<R>),
}

impl<R> TaskHandle<R> {
    fn pending(rx: oneshot::Receiver<CoreResult<R>>, worker: String) -> Self {
        Self {
            state: HandleState::Pending(rx),
            worker,
        }
    }

    fn rejected(worker: String) -> Self {
        Self {
            state: HandleState::Ready(Err(CoreError::WorkerStopped(worker.clone()))),
            worker,
        }
    }

    /// A handle that is already resolved, used for inline execution
    pub fn ready(value: R) -> Self {
        Self {
            state: HandleState::Ready(Ok(value)),
            worker: String::from("inline"),
        }
    }

    /// Name of the worker the task was posted to (`inline` for ready handles)
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Block the current thread until the task has run
    ///
    /// Deadlocks if called from a task running on the same worker; use
    /// [`Worker::post_and_wait`] there instead. In async code prefer
    /// [`join()`](Self::join): a multi-threaded runtime worker is moved out
    /// of the way with `block_in_place`, but a current-thread runtime cannot
    /// block and gets [`CoreError::BlockingInRuntime`].
    pub fn wait(self) -> CoreResult<R> {
        let rx = match self.state {
            HandleState::Ready(result) => return result,
            HandleState::Pending(rx) => rx,
        };

        let received = if blocking_context(&self.worker)? {
            tokio::task::block_in_place(|| rx.blocking_recv())
        } else {
            rx.blocking_recv()
        };
        received.unwrap_or_else(|_| Err(CoreError::WorkerStopped(self.worker)))
    }

    /// Await the task's result
    pub async fn join(self) -> CoreResult<R> {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| Err(CoreError::WorkerStopped(self.worker))),
        }
    }
}

/// Whether the calling thread runs inside a tokio runtime
///
/// Fails when that runtime is single-threaded, where blocking would stall
/// every task it drives.
fn blocking_context(worker: &str) -> CoreResult<bool> {
    match Handle::try_current() {
        Err(_) => Ok(false),
        Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => Ok(true),
        Ok(_) => Err(CoreError::BlockingInRuntime(worker.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_post_and_wait_result() {
        let worker = Worker::new("compute").unwrap();
        let handle = worker.post(|| 6 * 7);
        assert_eq!(handle.wait().unwrap(), 42);
        worker.stop();
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let worker = Worker::new("fifo").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            let _ = worker.post(move || log.lock().push(i));
        }
        worker.stop();

        let log = log.lock();
        assert_eq!(*log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_tasks_never_overlap() {
        let worker = Worker::new("serial").unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            let _ = worker.post(move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        worker.stop();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_drains_pending_tasks() {
        let worker = Worker::new("drain").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        {
            let gate = Arc::clone(&gate);
            let _ = worker.post(move || {
                let _guard = gate.lock();
            });
        }
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let _ = worker.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(held);

        worker.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(worker.metrics().pending(), 0);
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let worker = Worker::new("stopped").unwrap();
        worker.stop();
        assert!(!worker.is_running());

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let handle = worker.post(move || ran_clone.store(true, Ordering::SeqCst));

        assert!(matches!(handle.wait(), Err(CoreError::WorkerStopped(_))));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(worker.metrics().posts_rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let worker = Worker::new("twice").unwrap();
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_panicking_task_is_reported_and_worker_survives() {
        let worker = Worker::new("fragile").unwrap();

        let handle = worker.post(|| -> u32 { panic!("boom") });
        match handle.wait() {
            Err(CoreError::TaskPanicked { worker, message }) => {
                assert_eq!(worker, "fragile");
                assert_eq!(message, "boom");
            }
            other => panic!("expected TaskPanicked, got {:?}", other.map(|_| ())),
        }

        assert_eq!(worker.post(|| 1).wait().unwrap(), 1);
        worker.stop();
        assert_eq!(worker.metrics().tasks_panicked.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_post_and_wait_inline_on_own_thread() {
        let worker = Worker::new("reentrant").unwrap();
        let inner = worker.clone();

        let value = worker
            .post_and_wait(move || {
                assert!(inner.is_current());
                inner.post_and_wait(|| 5).unwrap()
            })
            .unwrap();

        assert_eq!(value, 5);
        worker.stop();
    }

    #[test]
    fn test_is_current() {
        let worker = Worker::new("current").unwrap();
        assert!(!worker.is_current());

        let own = worker.clone();
        assert!(worker.post(move || own.is_current()).wait().unwrap());
        worker.stop();
    }

    #[test]
    fn test_drop_last_handle_stops_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let worker = Worker::new("scoped").unwrap();
            let counter = Arc::clone(&counter);
            let _ = worker.post(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ready_handle() {
        let handle = TaskHandle::ready("done");
        assert_eq!(handle.worker(), "inline");
        assert_eq!(handle.wait().unwrap(), "done");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_inside_multi_thread_runtime() {
        let worker = Worker::new("mt-wait").unwrap();
        assert_eq!(worker.post(|| 2 * 21).wait().unwrap(), 42);
        assert_eq!(worker.post_and_wait(|| "posted").unwrap(), "posted");
        tokio::task::spawn_blocking(move || worker.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_and_wait_refused_on_current_thread_runtime() {
        let worker = Worker::new("ct-wait").unwrap();
        let err = worker.post_and_wait(|| 1).unwrap_err();
        assert!(matches!(err, CoreError::BlockingInRuntime(ref name) if name == "ct-wait"));
        assert_eq!(worker.metrics().posted(), 0);

        // join is the way to wait here
        assert_eq!(worker.post(|| 1).join().await.unwrap(), 1);
        tokio::task::spawn_blocking(move || worker.stop()).await.unwrap();
    }

    #[test]
    fn test_join_from_async_context() {
        let worker = Worker::new("async").unwrap();
        let handle = worker.post(|| String::from("joined"));
        let value = tokio_test::block_on(handle.join()).unwrap();
        assert_eq!(value, "joined");
        worker.stop();
    }
}
