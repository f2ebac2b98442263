// src/core/shared/mod.rs

//! The shared-snapshot channel: many readers, one rare writer.
//!
//! Each worker holds its own `SharedData<T, U>` instance. Readers call
//! `reader_ready()` (or hold a `ReadGuard`) at the top and bottom of each
//! logical unit of work and never block or synchronize. Updates are pushed
//! into a bounded per-worker queue; a single Collector thread drains every
//! queue, folds the updates into a master copy and publishes a fresh
//! immutable snapshot to every worker with one pointer store each. Old
//! snapshots are reclaimed through the `Arc` refcount once all workers have
//! observed the flip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::info;

/// Process-wide flag: when set, writers and the Collector stop blocking so
/// teardown can proceed.
static NO_BLOCKING: AtomicBool = AtomicBool::new(false);

/// Flips the process into non-blocking shutdown mode.
pub fn initiate_shutdown() {
    NO_BLOCKING.store(true, Ordering::SeqCst);
}

pub fn is_shutting_down() -> bool {
    NO_BLOCKING.load(Ordering::SeqCst)
}

/// Wakeup shared between all `SharedData` instances of one Collector.
#[derive(Default)]
pub struct CollectorSignal {
    updates_pending: Mutex<bool>,
    cond: Condvar,
}

impl CollectorSignal {
    fn raise(&self) {
        let mut pending = self.updates_pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Blocks until updates are pending, the timeout elapses or shutdown
    /// starts. Returns whether updates were pending.
    pub fn wait_for_updates(&self, timeout: Duration) -> bool {
        let mut pending = self.updates_pending.lock();
        if !*pending && !is_shutting_down() {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut pending)
    }
}

struct UpdateQueue<U> {
    queue: Mutex<Vec<U>>,
    room: Condvar,
}

/// One worker's view of a shared snapshot plus its private update queue.
pub struct SharedData<T, U> {
    /// The latest published snapshot; written only by the Collector.
    fresh: ArcSwap<T>,
    /// The snapshot this worker last observed.
    current: Mutex<Arc<T>>,
    updates: UpdateQueue<U>,
    max_updates: usize,
    signal: Arc<CollectorSignal>,
}

impl<T, U> SharedData<T, U> {
    pub fn new(initial: Arc<T>, max_updates: usize, signal: Arc<CollectorSignal>) -> Self {
        SharedData {
            fresh: ArcSwap::new(initial.clone()),
            current: Mutex::new(initial),
            updates: UpdateQueue {
                queue: Mutex::new(Vec::new()),
                room: Condvar::new(),
            },
            max_updates,
            signal,
        }
    }

    /// Unconditionally copies the fresh pointer into the current one and
    /// returns it. Call at the top and bottom of each unit of work.
    pub fn reader_ready(&self) -> Arc<T> {
        let fresh = self.fresh.load_full();
        *self.current.lock() = fresh.clone();
        fresh
    }

    /// Submits an update toward the Collector. Blocks briefly if the worker
    /// outruns the Collector; the queue bound should be tuned so this never
    /// happens in normal operation.
    pub fn send_update(&self, update: U) {
        let mut queue = self.updates.queue.lock();
        while queue.len() >= self.max_updates && !is_shutting_down() {
            self.updates.room.wait(&mut queue);
        }
        queue.push(update);
        drop(queue);
        self.signal.raise();
    }

    /// Collector side: swaps out all queued updates in submission order.
    fn drain_updates(&self) -> Vec<U> {
        let mut queue = self.updates.queue.lock();
        let drained = std::mem::take(&mut *queue);
        drop(queue);
        if !drained.is_empty() {
            self.updates.room.notify_all();
        }
        drained
    }

    /// Collector side: publishes a new snapshot for this worker.
    fn publish(&self, snapshot: Arc<T>) {
        self.fresh.store(snapshot);
    }
}

/// RAII reader guard: refreshes the snapshot on construction and drop.
pub struct ReadGuard<'a, T, U> {
    shared: &'a SharedData<T, U>,
    data: Arc<T>,
}

impl<'a, T, U> ReadGuard<'a, T, U> {
    pub fn new(shared: &'a SharedData<T, U>) -> Self {
        let data = shared.reader_ready();
        ReadGuard { shared, data }
    }
}

impl<T, U> std::ops::Deref for ReadGuard<'_, T, U> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T, U> Drop for ReadGuard<'_, T, U> {
    fn drop(&mut self) {
        self.shared.reader_ready();
    }
}

/// The single writer thread that folds worker updates into the master copy
/// and republishes it.
pub struct Collector<T, U, F> {
    workers: Vec<Arc<SharedData<T, U>>>,
    master: T,
    fold: F,
    signal: Arc<CollectorSignal>,
    wait_timeout: Duration,
}

impl<T, U, F> Collector<T, U, F>
where
    T: Clone + Send + Sync + 'static,
    U: Send + 'static,
    F: FnMut(&mut T, U) + Send + 'static,
{
    pub fn new(
        initial: T,
        worker_count: usize,
        max_updates: usize,
        fold: F,
    ) -> (Self, Vec<Arc<SharedData<T, U>>>) {
        let signal = Arc::new(CollectorSignal::default());
        let snapshot = Arc::new(initial.clone());
        let workers: Vec<_> = (0..worker_count)
            .map(|_| Arc::new(SharedData::new(snapshot.clone(), max_updates, signal.clone())))
            .collect();
        let collector = Collector {
            workers: workers.clone(),
            master: initial,
            fold,
            signal,
            wait_timeout: Duration::from_millis(200),
        };
        (collector, workers)
    }

    /// Drains every worker queue once and republishes if anything changed.
    /// Within a single worker, updates are folded in submission order;
    /// ordering across workers is this Collector's choice.
    pub fn collect_once(&mut self) -> bool {
        let mut changed = false;
        for worker in &self.workers {
            for update in worker.drain_updates() {
                (self.fold)(&mut self.master, update);
                changed = true;
            }
        }
        if changed {
            let snapshot = Arc::new(self.master.clone());
            for worker in &self.workers {
                worker.publish(snapshot.clone());
            }
        }
        changed
    }

    /// Runs until shutdown. One final collection pass happens after the
    /// shutdown flag is observed so no queued update is lost.
    pub fn run(mut self) {
        loop {
            self.signal.wait_for_updates(self.wait_timeout);
            self.collect_once();
            if is_shutting_down() {
                self.collect_once();
                info!("shared-data collector stopping");
                return;
            }
        }
    }

    /// Spawns the collector on its own OS thread.
    pub fn spawn(self, name: &str) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
            .expect("spawning collector thread")
    }
}
