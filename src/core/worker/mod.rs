// src/core/worker/mod.rs

//! Workers: single-threaded cooperative event loops.
//!
//! One worker is one OS thread running a current-thread runtime with a
//! local task set. A descriptor, a session and all of that session's
//! per-filter and per-router state are pinned to one worker for their
//! lifetime; inter-worker effects go through the message inbox. Workers
//! have a lifecycle so the pool can be resized at runtime: a surplus
//! worker drains (accepts no new sessions) until its sessions close, then
//! goes dormant; it can be revived by a later resize.

pub mod descriptor;
pub mod messaging;
pub mod pool;

pub use descriptor::{CallbackReason, DcbRole, DcbState, Descriptor, TlsState};
pub use messaging::{Inbox, InboxSender, WorkerMessage};
pub use pool::{Parked, PersistentPool, SessionImprint};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strum_macros::Display;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::monitor::{ClusterSnapshot, ClusterUpdate};
use crate::core::session::backend::BackendEndpoint;
use crate::core::shared::SharedData;
use crate::core::users::UserDatabase;

pub type WorkerId = usize;

/// Runtime lifecycle of a worker.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycle {
    /// Accepting new sessions.
    Active,
    /// Accepting no new sessions, waiting for existing ones to close.
    Draining,
    /// No sessions, parked; can be revived by a resize.
    Dormant,
}

/// State shared between a worker and its pool-side handle.
pub struct WorkerShared {
    pub id: WorkerId,
    lifecycle: Mutex<WorkerLifecycle>,
    session_count: AtomicUsize,
}

impl WorkerShared {
    pub fn lifecycle(&self) -> WorkerLifecycle {
        *self.lifecycle.lock()
    }

    pub fn set_lifecycle(&self, state: WorkerLifecycle) {
        *self.lifecycle.lock() = state;
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }
}

/// A live session registered on a worker.
pub struct SessionHandle {
    pub user: String,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Worker-local context available to everything running on the worker's
/// thread: sessions, the persistent pool and the shared snapshot views.
pub struct WorkerContext {
    pub id: WorkerId,
    pub shared: Arc<WorkerShared>,
    pub pool: RefCell<PersistentPool<BackendEndpoint>>,
    pub sessions: RefCell<HashMap<u64, SessionHandle>>,
    pub users: Arc<SharedData<UserDatabase, UserDatabase>>,
    pub servers: Arc<SharedData<ClusterSnapshot, ClusterUpdate>>,
    next_dcb_id: AtomicU64,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Rc<WorkerContext>>> = const { RefCell::new(None) };
}

/// The worker context of the current thread. Panics when called off a
/// worker thread; that is an invariant violation, not an error.
pub fn context() -> Rc<WorkerContext> {
    CURRENT_WORKER.with(|c| {
        c.borrow()
            .clone()
            .expect("called off a worker thread")
    })
}

impl WorkerContext {
    pub fn next_dcb_id(&self) -> u64 {
        self.next_dcb_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a session; bumps the lifecycle-visible count.
    pub fn register_session(&self, id: u64, handle: SessionHandle) {
        self.sessions.borrow_mut().insert(id, handle);
        self.shared.session_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes a session; a draining worker with no sessions left goes
    /// dormant.
    pub fn unregister_session(&self, id: u64) {
        if self.sessions.borrow_mut().remove(&id).is_some() {
            let left = self.shared.session_count.fetch_sub(1, Ordering::Relaxed) - 1;
            if left == 0 && self.shared.lifecycle() == WorkerLifecycle::Draining {
                info!(worker = self.id, "drained, going dormant");
                self.shared.set_lifecycle(WorkerLifecycle::Dormant);
            }
        }
    }

    fn kill_session(&self, id: u64) {
        if let Some(handle) = self.sessions.borrow().get(&id) {
            let _ = handle.shutdown_tx.send(());
        }
    }

    fn kill_user(&self, user: &str) {
        for handle in self.sessions.borrow().values() {
            if handle.user == user {
                let _ = handle.shutdown_tx.send(());
            }
        }
    }

    fn kill_all(&self) {
        for handle in self.sessions.borrow().values() {
            let _ = handle.shutdown_tx.send(());
        }
    }
}

/// One worker: the inbox-driven event loop.
pub struct Worker {
    ctx: Rc<WorkerContext>,
    inbox: Inbox,
}

impl Worker {
    /// The cooperative loop: drain the inbox, dispatch in arrival order,
    /// run the idle tick. Returns when a Shutdown message arrives.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                messages = self.inbox.recv() => {
                    for msg in messages {
                        match msg {
                            WorkerMessage::KillSession(id) => self.ctx.kill_session(id),
                            WorkerMessage::KillUser(user) => self.ctx.kill_user(&user),
                            WorkerMessage::Task(task) => task(),
                            WorkerMessage::Shutdown => {
                                info!(worker = self.ctx.id, "worker shutting down");
                                self.ctx.kill_all();
                                return;
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    let evicted = self.ctx.pool.borrow_mut().evict_expired();
                    if evicted > 0 {
                        debug!(worker = self.ctx.id, evicted, "evicted expired pooled connections");
                    }
                }
            }
        }
    }
}

/// The pool-side handle to a worker thread.
pub struct WorkerHandle {
    pub shared: Arc<WorkerShared>,
    sender: InboxSender,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn sender(&self) -> &InboxSender {
        &self.sender
    }

    pub fn post(&self, msg: WorkerMessage) -> Result<(), (crate::core::SqlGateError, WorkerMessage)> {
        self.sender.post(msg)
    }

    /// Joins the worker thread after a Shutdown has been posted.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(worker = self.shared.id, "worker thread panicked");
        }
    }
}

/// Everything needed to bring up one worker thread.
pub struct WorkerSeed {
    pub id: WorkerId,
    pub inbox_capacity: usize,
    pub pool_ttl: Duration,
    pub pool_max_per_key: usize,
    pub users: Arc<SharedData<UserDatabase, UserDatabase>>,
    pub servers: Arc<SharedData<ClusterSnapshot, ClusterUpdate>>,
}

/// Spawns a worker OS thread running a current-thread runtime and a local
/// task set.
pub fn spawn_worker(seed: WorkerSeed) -> WorkerHandle {
    let (inbox, sender) = Inbox::new(seed.inbox_capacity);
    let shared = Arc::new(WorkerShared {
        id: seed.id,
        lifecycle: Mutex::new(WorkerLifecycle::Active),
        session_count: AtomicUsize::new(0),
    });
    let thread_shared = shared.clone();
    let thread = std::thread::Builder::new()
        .name(format!("worker-{}", seed.id))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("building worker runtime");
            let ctx = Rc::new(WorkerContext {
                id: seed.id,
                shared: thread_shared,
                pool: RefCell::new(PersistentPool::new(seed.pool_ttl, seed.pool_max_per_key)),
                sessions: RefCell::new(HashMap::new()),
                users: seed.users,
                servers: seed.servers,
                next_dcb_id: AtomicU64::new(1),
            });
            CURRENT_WORKER.with(|c| *c.borrow_mut() = Some(ctx.clone()));
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, Worker { ctx, inbox }.run());
            CURRENT_WORKER.with(|c| *c.borrow_mut() = None);
        })
        .expect("spawning worker thread");
    WorkerHandle {
        shared,
        sender,
        thread: Some(thread),
    }
}

/// The fixed-slot worker pool. Slots are pre-provisioned up to a maximum so
/// resizing never has to re-wire the shared-data channels.
pub struct WorkerPool {
    workers: RwLock<Vec<WorkerHandle>>,
    seeds: Mutex<Vec<WorkerSeed>>,
    next_assign: AtomicUsize,
}

impl WorkerPool {
    /// Builds the pool: the first `initial` seeds are spawned immediately,
    /// the rest stay available for later growth.
    pub fn new(mut seeds: Vec<WorkerSeed>, initial: usize) -> Self {
        let mut workers = Vec::new();
        let spawn_now: Vec<_> = seeds.drain(..initial.min(seeds.len())).collect();
        for seed in spawn_now {
            workers.push(spawn_worker(seed));
        }
        WorkerPool {
            workers: RwLock::new(workers),
            seeds: Mutex::new(seeds),
            next_assign: AtomicUsize::new(0),
        }
    }

    /// Number of workers currently accepting sessions.
    pub fn active_count(&self) -> usize {
        self.workers
            .read()
            .iter()
            .filter(|w| w.shared.lifecycle() == WorkerLifecycle::Active)
            .count()
    }

    /// Picks an Active worker round-robin and returns its sender.
    pub fn assign(&self) -> Option<(WorkerId, InboxSender)> {
        let workers = self.workers.read();
        let active: Vec<_> = workers
            .iter()
            .filter(|w| w.shared.lifecycle() == WorkerLifecycle::Active)
            .collect();
        if active.is_empty() {
            return None;
        }
        let pick = self.next_assign.fetch_add(1, Ordering::Relaxed) % active.len();
        let worker = active[pick];
        Some((worker.id(), worker.sender().clone()))
    }

    /// Posts to the worker owning the given id.
    pub fn post_to(
        &self,
        id: WorkerId,
        msg: WorkerMessage,
    ) -> Result<(), crate::core::SqlGateError> {
        let workers = self.workers.read();
        let worker = workers
            .iter()
            .find(|w| w.id() == id)
            .ok_or_else(|| crate::core::SqlGateError::Internal(format!("no worker {id}")))?;
        worker.post(msg).map_err(|(e, _)| e)
    }

    /// Posts one message to every live worker.
    pub fn broadcast(&self, make: impl Fn() -> WorkerMessage) {
        for worker in self.workers.read().iter() {
            if worker.post(make()).is_err() {
                warn!(worker = worker.id(), "broadcast dropped: inbox full");
            }
        }
    }

    /// Resizes to `target` active workers. Shrinking marks surplus workers
    /// Draining; they finish their sessions and go Dormant, and no session
    /// migrates. Growing revives Dormant workers first, then spawns fresh
    /// ones from the remaining seeds.
    pub fn resize(&self, target: usize) -> Result<(), crate::core::SqlGateError> {
        let mut workers = self.workers.write();
        let active: Vec<usize> = workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.shared.lifecycle() == WorkerLifecycle::Active)
            .map(|(i, _)| i)
            .collect();

        if target < active.len() {
            for &idx in active.iter().rev().take(active.len() - target) {
                let worker = &workers[idx];
                info!(worker = worker.id(), "draining worker");
                if worker.shared.session_count() == 0 {
                    worker.shared.set_lifecycle(WorkerLifecycle::Dormant);
                } else {
                    worker.shared.set_lifecycle(WorkerLifecycle::Draining);
                }
            }
            return Ok(());
        }

        let mut needed = target - active.len();
        for worker in workers.iter() {
            if needed == 0 {
                break;
            }
            if worker.shared.lifecycle() == WorkerLifecycle::Dormant {
                info!(worker = worker.id(), "reviving dormant worker");
                worker.shared.set_lifecycle(WorkerLifecycle::Active);
                needed -= 1;
            }
        }
        let mut seeds = self.seeds.lock();
        while needed > 0 {
            let Some(seed) = seeds.pop() else {
                return Err(crate::core::SqlGateError::Config(
                    "worker pool at its provisioned maximum".into(),
                ));
            };
            info!(worker = seed.id, "spawning additional worker");
            workers.push(spawn_worker(seed));
            needed -= 1;
        }
        Ok(())
    }

    /// Posts Shutdown everywhere and joins all threads.
    pub fn shutdown(&self) {
        self.broadcast(|| WorkerMessage::Shutdown);
        for worker in self.workers.write().iter_mut() {
            worker.join();
        }
    }

    /// Snapshot of worker states for the admin surface.
    pub fn describe(&self) -> Vec<(WorkerId, WorkerLifecycle, usize)> {
        self.workers
            .read()
            .iter()
            .map(|w| (w.id(), w.shared.lifecycle(), w.shared.session_count()))
            .collect()
    }
}
