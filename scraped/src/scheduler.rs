//! Time-ordered task scheduling for the scraping daemon
//!
//! This module holds the task queue and the driver loop that together run
//! every piece of deferred work in the daemon: scrape attempts and the
//! per-site day planners. The queue keeps tasks sorted by firing time; the
//! driver sleeps until the earliest task is due, dispatches everything due
//! onto fresh tokio tasks, and re-arms. Task bodies may enqueue new tasks
//! through [`Scheduler::add`]; the planners re-enqueue themselves this way.
// The driver performs no I/O of its own beyond timer waits, so a slow scrape
// can never delay other due tasks. Cancellation stops dispatch; in-flight
// task bodies are never interrupted and must bound themselves with their own
// timeouts.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// The boxed future a task body produces.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A unit of deferred work: a callable and the wall-clock instant to run it
/// at. Immutable after creation.
pub struct Task {
    when: DateTime<Utc>,
    run: Box<dyn FnOnce(DateTime<Utc>) -> TaskFuture + Send>,
}

impl Task {
    /// Create a task that calls `run` with the firing time at `when`.
    pub fn new<F>(when: DateTime<Utc>, run: F) -> Self
    where
        F: FnOnce(DateTime<Utc>) -> TaskFuture + Send + 'static,
    {
        Self {
            when,
            run: Box::new(run),
        }
    }

    /// The time at which the task is to be performed.
    pub fn when(&self) -> DateTime<Utc> {
        self.when
    }
}

/// Concurrent-safe queue of tasks ordered ascending by firing time.
pub struct TaskQueue {
    queue: Mutex<Vec<Task>>,
    /// Count of dispatched-but-not-yet-returned task bodies.
    running: Arc<AtomicI64>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            running: Arc::new(AtomicI64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.queue.lock().expect("task queue mutex poisoned")
    }

    /// Insert a task, keeping ascending firing-time order. Tasks with equal
    /// firing times retain insertion order.
    pub fn append(&self, task: Task) {
        let mut queue = self.lock();
        let index = queue.partition_point(|queued| queued.when <= task.when);
        queue.insert(index, task);
    }

    /// The earliest firing time in the queue, or `now` when the queue is
    /// empty. Callers must use [`len`](Self::len) to disambiguate emptiness.
    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.lock().first().map(|task| task.when).unwrap_or(now)
    }

    /// Number of tasks currently queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of task bodies currently running.
    pub fn running(&self) -> i64 {
        self.running.load(Ordering::SeqCst)
    }

    /// Remove and return the prefix of tasks due at `now`, without invoking
    /// any of them.
    fn drain_due(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut queue = self.lock();
        let end = queue.partition_point(|task| task.when <= now);
        queue.drain(..end).collect()
    }

    /// Dispatch every task due at `now`, each on its own tokio task, and
    /// return how many were dispatched. The queue lock is not held while
    /// task bodies run, so a slow task cannot block enqueueing.
    pub fn dispatch_due(&self, now: DateTime<Utc>) -> usize {
        let due = self.drain_due(now);
        let count = due.len();
        for task in due {
            let running = Arc::clone(&self.running);
            running.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                (task.run)(task.when).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        count
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler behavior knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum time to wait for in-flight task bodies after cancellation.
    /// Zero means do not wait.
    pub wait_timeout_on_cancel: Duration,
    /// Terminate the driver when the queue is empty at a firing boundary.
    /// The daemon leaves this off; tests and one-shot runs turn it on.
    pub stop_on_empty_queue: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wait_timeout_on_cancel: Duration::ZERO,
            stop_on_empty_queue: false,
        }
    }
}

/// How long the driver parks between wake-ups while the queue is empty.
/// `add` interrupts the park, so the exact value only bounds idle wake-ups.
const EMPTY_QUEUE_PARK: Duration = Duration::from_secs(3600);

/// The scheduler: a task queue plus the single driver loop that drains it.
///
/// Cheap to clone; clones share the same queue and driver, which is how task
/// bodies get a handle to enqueue follow-up work.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: TaskQueue,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    /// Poked by `add` so the driver re-evaluates the earliest firing time.
    rearm: Notify,
    started: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                queue: TaskQueue::new(),
                config,
                clock,
                rearm: Notify::new(),
                started: AtomicBool::new(false),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Enqueue a task and re-arm the driver. Safe to call from inside task
    /// bodies.
    pub fn add(&self, task: Task) {
        debug!(when = %task.when(), "queueing task");
        self.inner.queue.append(task);
        self.inner.rearm.notify_one();
    }

    /// Number of tasks currently queued.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Earliest queued firing time, or `now` when the queue is empty.
    pub fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.inner.queue.next_due(now)
    }

    /// Number of task bodies currently running.
    pub fn running(&self) -> i64 {
        self.inner.queue.running()
    }

    /// Launch the driver loop. Idempotent within one scheduler instance;
    /// repeated calls are ignored.
    ///
    /// Cancellation arrives on the broadcast channel: the driver stops
    /// dispatching, waits up to `wait_timeout_on_cancel` for in-flight task
    /// bodies, and exits. A closed channel counts as cancellation.
    pub fn start(&self, cancel: broadcast::Receiver<()>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("scheduler already started, ignoring start()");
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(drive(inner, cancel));
    }

    /// Block until the driver has exited.
    pub async fn wait(&self) {
        let mut done = self.inner.done_rx.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn drive(inner: Arc<SchedulerInner>, mut cancel: broadcast::Receiver<()>) {
    info!("scheduler driver started");

    loop {
        let now = inner.clock.now();
        let queued = inner.queue.len();

        if queued == 0 && inner.config.stop_on_empty_queue {
            debug!("queue empty, stopping driver");
            break;
        }

        // Sleep until the earliest task is due (a past-due task yields a
        // zero sleep), or park while idle.
        let sleep = if queued == 0 {
            EMPTY_QUEUE_PARK
        } else {
            let next = inner.queue.next_due(now);
            (next - now).to_std().unwrap_or(Duration::ZERO)
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {
                let dispatched = inner.queue.dispatch_due(inner.clock.now());
                if dispatched > 0 {
                    debug!(
                        dispatched,
                        queued = inner.queue.len(),
                        running = inner.queue.running(),
                        "dispatched due tasks"
                    );
                }
            }
            _ = inner.rearm.notified() => {
                // a task was added; recompute the earliest firing time
            }
            _ = cancel.recv() => {
                info!("scheduler cancelled");
                wait_for_running(&inner).await;
                break;
            }
        }
    }

    let _ = inner.done_tx.send(true);
    info!("scheduler driver stopped");
}

/// After cancellation, wait up to the configured timeout for the running
/// task counter to drop to zero, polling every 100 ms.
async fn wait_for_running(inner: &SchedulerInner) {
    let timeout = inner.config.wait_timeout_on_cancel;
    let in_flight = inner.queue.running();
    if in_flight == 0 {
        return;
    }
    if timeout.is_zero() {
        warn!(
            in_flight,
            "not waiting for in-flight tasks (no shutdown wait configured)"
        );
        return;
    }

    info!(
        in_flight,
        "waiting up to {:?} for in-flight tasks to complete", timeout
    );
    let deadline = Instant::now() + timeout;
    let mut check = tokio::time::interval(Duration::from_millis(100));

    loop {
        check.tick().await;

        let still_running = inner.queue.running();
        if still_running == 0 {
            info!("all in-flight tasks completed");
            break;
        }
        if Instant::now() >= deadline {
            warn!(still_running, "shutdown wait timeout reached");
            break;
        }
    }
}
