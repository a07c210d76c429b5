use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

/// Processes tasks popped from a [`TaskQueue`].
///
/// Workers receive a queue handle so they can enqueue follow-up work.
/// A worker error is routed to `on_error` with ownership of the failed task;
/// the queue never retries on its own.
#[async_trait]
pub trait TaskWorker: Send + Sync + Sized + 'static {
    type Task: Send + 'static;

    async fn work(&self, task: &Self::Task, queue: &TaskQueue<Self>) -> anyhow::Result<()>;

    async fn on_error(&self, error: anyhow::Error, task: Self::Task, queue: &TaskQueue<Self>);

    /// Called when the finishing task left the queue fully drained: it was
    /// the last one in flight and nothing is queued. The queue decides this
    /// from the in-flight decrement itself, so exactly one task observes the
    /// drain even when several finish at the same instant.
    async fn on_drained(&self, queue: &TaskQueue<Self>) {
        let _ = queue;
    }
}

struct QueueEntry<T> {
    priority: u64,
    seq: u64,
    task: T,
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for QueueEntry<T> {}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueEntry<T> {
    // Highest priority first; FIFO within a priority level.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

struct QueueInner<W: TaskWorker> {
    worker: W,
    heap: Mutex<BinaryHeap<QueueEntry<W::Task>>>,
    seq: AtomicU64,
    in_flight: AtomicUsize,
    paused: AtomicBool,
    semaphore: Arc<Semaphore>,
    idle: Notify,
}

/// Priority task queue with a bounded number of concurrently running tasks.
///
/// Created paused; call [`TaskQueue::start`] to begin dispatching. Tasks may
/// be added at any time, including from inside a running worker. Cheap to
/// clone; clones share the queue.
pub struct TaskQueue<W: TaskWorker> {
    inner: Arc<QueueInner<W>>,
}

impl<W: TaskWorker> Clone for TaskQueue<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: TaskWorker> TaskQueue<W> {
    pub fn new(worker: W, concurrency: usize) -> Self {
        assert!(concurrency > 0, "queue concurrency must be at least 1");
        Self {
            inner: Arc::new(QueueInner {
                worker,
                heap: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                paused: AtomicBool::new(true),
                semaphore: Arc::new(Semaphore::new(concurrency)),
                idle: Notify::new(),
            }),
        }
    }

    /// Insert a task. Dispatch happens immediately if the queue is running
    /// and a concurrency slot is free.
    pub fn add_task(&self, task: W::Task, priority: u64) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.heap.lock().push(QueueEntry {
            priority,
            seq,
            task,
        });
        if !self.inner.paused.load(Ordering::Acquire) {
            self.pump();
        }
    }

    pub fn start(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.pump();
    }

    /// Stop dispatching queued tasks. In-flight tasks run to completion.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Drop every queued (not yet started) task.
    pub fn clear(&self) {
        self.inner.heap.lock().clear();
        self.notify_if_idle();
    }

    /// Number of queued tasks, excluding in-flight ones.
    pub fn size(&self) -> usize {
        self.inner.heap.lock().len()
    }

    /// Number of in-flight tasks.
    pub fn pending(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once the queue holds no queued and no in-flight tasks.
    pub async fn on_idle(&self) {
        tokio::task::yield_now().await;
        loop {
            if self.size() == 0 && self.pending() == 0 {
                return;
            }
            let notified = self.inner.idle.notified();
            if self.size() == 0 && self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn notify_if_idle(&self) {
        if self.size() == 0 && self.pending() == 0 {
            self.inner.idle.notify_waiters();
        }
    }

    /// Dispatch queued tasks into free concurrency slots.
    fn pump(&self) {
        loop {
            if self.inner.paused.load(Ordering::Acquire) {
                return;
            }
            let Ok(permit) = self.inner.semaphore.clone().try_acquire_owned() else {
                return;
            };
            let Some(entry) = self.inner.heap.lock().pop() else {
                drop(permit);
                self.notify_if_idle();
                return;
            };
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            let queue = self.clone();
            tokio::spawn(async move {
                if let Err(error) = queue.inner.worker.work(&entry.task, &queue).await {
                    queue.inner.worker.on_error(error, entry.task, &queue).await;
                }
                let was_last_in_flight =
                    queue.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
                // The slot must be free before re-pumping, or a queue at full
                // concurrency would never dispatch its successor.
                drop(permit);
                if was_last_in_flight && queue.size() == 0 {
                    queue.inner.worker.on_drained(&queue).await;
                }
                queue.notify_if_idle();
                queue.pump();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::time::Duration;

    struct RecordingWorker {
        order: Arc<Mutex<Vec<u64>>>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
        drains: Arc<AtomicUsize>,
        fail_once_for: Option<u64>,
        failed: Arc<AtomicBool>,
    }

    impl RecordingWorker {
        fn new() -> Self {
            Self {
                order: Arc::new(Mutex::new(Vec::new())),
                running: Arc::new(AtomicUsize::new(0)),
                max_running: Arc::new(AtomicUsize::new(0)),
                drains: Arc::new(AtomicUsize::new(0)),
                fail_once_for: None,
                failed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl TaskWorker for RecordingWorker {
        type Task = u64;

        async fn work(&self, task: &u64, _queue: &TaskQueue<Self>) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;

            if self.fail_once_for == Some(*task) && !self.failed.swap(true, Ordering::SeqCst) {
                self.running.fetch_sub(1, Ordering::SeqCst);
                bail!("injected failure for task {task}");
            }

            self.order.lock().push(*task);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_error(&self, _error: anyhow::Error, task: u64, queue: &TaskQueue<Self>) {
            queue.add_task(task, u64::MAX - task);
        }

        async fn on_drained(&self, _queue: &TaskQueue<Self>) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_in_priority_order_with_fifo_ties() {
        let worker = RecordingWorker::new();
        let order = worker.order.clone();
        let queue = TaskQueue::new(worker, 1);

        queue.add_task(30, u64::MAX - 30);
        queue.add_task(10, u64::MAX - 10);
        queue.add_task(20, u64::MAX - 20);
        // Same priority as an existing task: FIFO among equals.
        queue.add_task(11, u64::MAX - 10);

        queue.start();
        queue.on_idle().await;

        assert_eq!(*order.lock(), vec![10, 11, 20, 30]);
    }

    #[tokio::test]
    async fn respects_the_concurrency_cap() {
        let worker = RecordingWorker::new();
        let max_running = worker.max_running.clone();
        let drains = worker.drains.clone();
        let queue = TaskQueue::new(worker, 3);

        for task in 0..24 {
            queue.add_task(task, u64::MAX - task);
        }
        queue.start();
        queue.on_idle().await;

        assert!(max_running.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.pending(), 0);
        // Many tasks finish close together, but only the one that drove the
        // in-flight count to zero observes the drain.
        assert_eq!(drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drain_is_observed_exactly_once_across_threads() {
        let worker = RecordingWorker::new();
        let drains = worker.drains.clone();
        let queue = TaskQueue::new(worker, 8);

        for task in 0..64 {
            queue.add_task(task, u64::MAX - task);
        }
        queue.start();
        queue.on_idle().await;
        // Give the drain callback of the final task a chance to run.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_added_while_running_are_dispatched() {
        let worker = RecordingWorker::new();
        let order = worker.order.clone();
        let queue = TaskQueue::new(worker, 2);
        queue.start();

        queue.add_task(1, u64::MAX - 1);
        queue.add_task(2, u64::MAX - 2);
        queue.on_idle().await;
        queue.add_task(3, u64::MAX - 3);
        queue.on_idle().await;

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_tasks_are_retried_via_on_error() {
        let mut worker = RecordingWorker::new();
        worker.fail_once_for = Some(20);
        let order = worker.order.clone();
        let queue = TaskQueue::new(worker, 1);

        queue.add_task(10, u64::MAX - 10);
        queue.add_task(20, u64::MAX - 20);
        queue.add_task(30, u64::MAX - 30);
        queue.start();
        queue.on_idle().await;

        // The retry re-enters at its original priority, ahead of task 30.
        assert_eq!(*order.lock(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn pause_and_clear_drop_queued_tasks() {
        let worker = RecordingWorker::new();
        let order = worker.order.clone();
        let queue = TaskQueue::new(worker, 1);

        queue.add_task(1, u64::MAX - 1);
        queue.add_task(2, u64::MAX - 2);
        queue.pause();
        queue.clear();
        assert_eq!(queue.size(), 0);

        queue.start();
        queue.on_idle().await;
        assert_eq!(*order.lock(), Vec::<u64>::new());
    }
}
