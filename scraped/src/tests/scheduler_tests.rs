//! Tests for the task queue and scheduler driver

use crate::clock::SystemClock;
use crate::scheduler::{Scheduler, SchedulerConfig, Task, TaskQueue};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::Duration;

fn test_scheduler(config: SchedulerConfig) -> Scheduler {
    Scheduler::new(config, Arc::new(SystemClock))
}

/// A task whose body just bumps a counter.
fn counting_task(when: DateTime<Utc>, counter: Arc<AtomicUsize>) -> Task {
    Task::new(when, move |_fired| {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    })
}

/// A task whose body records a label, for observing dispatch order.
fn labeled_task(when: DateTime<Utc>, label: u32, order: Arc<Mutex<Vec<u32>>>) -> Task {
    Task::new(when, move |_fired| {
        Box::pin(async move {
            order.lock().unwrap().push(label);
        })
    })
}

#[test]
fn test_queue_keeps_ascending_order() {
    let queue = TaskQueue::new();
    let base = Utc::now();
    let counter = Arc::new(AtomicUsize::new(0));

    queue.append(counting_task(base + ChronoDuration::seconds(3), counter.clone()));
    queue.append(counting_task(base + ChronoDuration::seconds(1), counter.clone()));
    queue.append(counting_task(base + ChronoDuration::seconds(2), counter.clone()));

    assert_eq!(queue.len(), 3);
    // the earliest insertion wins regardless of insertion order
    assert_eq!(queue.next_due(base), base + ChronoDuration::seconds(1));
}

#[test]
fn test_queue_next_due_on_empty_returns_now() {
    let queue = TaskQueue::new();
    let now = Utc::now();
    assert_eq!(queue.len(), 0);
    assert!(queue.is_empty());
    assert_eq!(queue.next_due(now), now);
}

#[tokio::test]
async fn test_queue_dispatches_only_due_prefix() {
    let queue = TaskQueue::new();
    let base = Utc::now();
    let counter = Arc::new(AtomicUsize::new(0));

    queue.append(counting_task(base + ChronoDuration::seconds(1), counter.clone()));
    queue.append(counting_task(base + ChronoDuration::seconds(2), counter.clone()));
    queue.append(counting_task(base + ChronoDuration::seconds(30), counter.clone()));

    let dispatched = queue.dispatch_due(base + ChronoDuration::seconds(2));
    assert_eq!(dispatched, 2);
    assert_eq!(queue.len(), 1);

    // give the spawned bodies a moment to run
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(queue.running(), 0);
}

#[tokio::test]
async fn test_queue_ties_dispatch_in_insertion_order() {
    let queue = TaskQueue::new();
    let when = Utc::now();
    let order = Arc::new(Mutex::new(Vec::new()));

    queue.append(labeled_task(when, 1, order.clone()));
    queue.append(labeled_task(when, 2, order.clone()));
    queue.append(labeled_task(when, 3, order.clone()));

    // on the current-thread test runtime, bodies run in spawn order
    queue.dispatch_due(when);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_single_task_fires_on_time() {
    let scheduler = test_scheduler(SchedulerConfig::default());
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.add(counting_task(
        Utc::now() + ChronoDuration::milliseconds(300),
        counter.clone(),
    ));
    scheduler.start(cancel_rx);

    // not due yet
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.queue_len(), 0);
    assert_eq!(scheduler.running(), 0);
}

#[tokio::test]
async fn test_dispatch_order_follows_firing_times() {
    let scheduler = test_scheduler(SchedulerConfig::default());
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let base = Utc::now();

    // inserted out of order on purpose
    scheduler.add(labeled_task(base + ChronoDuration::milliseconds(450), 3, order.clone()));
    scheduler.add(labeled_task(base + ChronoDuration::milliseconds(150), 1, order.clone()));
    scheduler.add(labeled_task(base + ChronoDuration::milliseconds(300), 2, order.clone()));
    scheduler.start(cancel_rx);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_in_flight_task() {
    let scheduler = test_scheduler(SchedulerConfig {
        wait_timeout_on_cancel: Duration::from_secs(5),
        stop_on_empty_queue: false,
    });
    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    let counter = Arc::new(AtomicUsize::new(0));

    // a slow task: dispatched at +100ms, runs for 600ms
    let slow_counter = counter.clone();
    scheduler.add(Task::new(
        Utc::now() + ChronoDuration::milliseconds(100),
        move |_fired| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                slow_counter.fetch_add(1, Ordering::SeqCst);
            })
        },
    ));
    scheduler.start(cancel_rx);

    // cancel while the body is still running
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(scheduler.running(), 1);
    cancel_tx.send(()).unwrap();

    let waited = tokio::time::Instant::now();
    scheduler.wait().await;
    // wait() returns only after the in-flight body finished
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.running(), 0);
    assert!(waited.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_cancel_without_wait_timeout_returns_immediately() {
    let scheduler = test_scheduler(SchedulerConfig::default());
    let (cancel_tx, cancel_rx) = broadcast::channel(1);

    scheduler.add(Task::new(Utc::now(), move |_fired| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
    }));
    scheduler.start(cancel_rx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_tx.send(()).unwrap();

    // zero wait timeout: done is signaled although the body still runs
    tokio::time::timeout(Duration::from_millis(500), scheduler.wait())
        .await
        .expect("wait() should return promptly with a zero shutdown wait");
}

#[tokio::test]
async fn test_stop_on_empty_queue_after_draining() {
    let scheduler = test_scheduler(SchedulerConfig {
        wait_timeout_on_cancel: Duration::ZERO,
        stop_on_empty_queue: true,
    });
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.add(counting_task(
        Utc::now() + ChronoDuration::milliseconds(50),
        counter.clone(),
    ));
    scheduler.start(cancel_rx);

    tokio::time::timeout(Duration::from_secs(2), scheduler.wait())
        .await
        .expect("driver should stop once the queue drains");
    // the driver does not wait for bodies when stopping on an empty queue
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_on_empty_queue_terminates_promptly_when_idle() {
    let scheduler = test_scheduler(SchedulerConfig {
        wait_timeout_on_cancel: Duration::ZERO,
        stop_on_empty_queue: true,
    });
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    scheduler.start(cancel_rx);

    tokio::time::timeout(Duration::from_millis(500), scheduler.wait())
        .await
        .expect("driver should stop immediately on an empty queue");
}

#[tokio::test]
async fn test_past_due_task_dispatches_at_next_wake() {
    let scheduler = test_scheduler(SchedulerConfig::default());
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.start(cancel_rx);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // firing time long past; add() re-arms the parked driver
    scheduler.add(counting_task(
        Utc::now() - ChronoDuration::seconds(10),
        counter.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_body_can_enqueue_follow_up() {
    let scheduler = test_scheduler(SchedulerConfig::default());
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let counter = Arc::new(AtomicUsize::new(0));

    // the first task enqueues a second one through the scheduler handle,
    // the way planners re-enqueue themselves
    let chained = scheduler.clone();
    let chained_counter = counter.clone();
    scheduler.add(Task::new(Utc::now(), move |fired| {
        Box::pin(async move {
            chained_counter.fetch_add(1, Ordering::SeqCst);
            chained.add(counting_task(
                fired + ChronoDuration::milliseconds(100),
                chained_counter.clone(),
            ));
        })
    }));
    scheduler.start(cancel_rx);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let scheduler = test_scheduler(SchedulerConfig::default());
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let (_cancel_tx2, cancel_rx2) = broadcast::channel(1);
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.start(cancel_rx);
    // the second start is ignored; the queue keeps draining normally
    scheduler.start(cancel_rx2);

    scheduler.add(counting_task(Utc::now(), counter.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
