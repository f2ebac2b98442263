// src/core/worker/messaging.rs

//! Inter-worker message passing.
//!
//! Each worker exposes a bounded inbox backed by an async wakeup. Senders
//! post from any thread; the worker drains the inbox by swapping the queue
//! with a local vector under a short mutex and dispatches messages in
//! arrival order. A full inbox is retried with exponential backoff and a
//! one-time operator warning.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::core::SqlGateError;

/// Messages a worker can receive.
pub enum WorkerMessage {
    /// Close the session with this id.
    KillSession(u64),
    /// Close every session authenticated as this user.
    KillUser(String),
    /// Run a closure on the worker thread, inside its local task set.
    Task(Box<dyn FnOnce() + Send>),
    /// Stop accepting work and wind down.
    Shutdown,
}

impl std::fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerMessage::KillSession(id) => write!(f, "KillSession({id})"),
            WorkerMessage::KillUser(user) => write!(f, "KillUser({user})"),
            WorkerMessage::Task(_) => write!(f, "Task"),
            WorkerMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct InboxShared {
    queue: Mutex<Vec<WorkerMessage>>,
    capacity: usize,
    notify: Notify,
}

/// The receiving half, owned by the worker.
pub struct Inbox {
    shared: Arc<InboxShared>,
}

/// The sending half; cheap to clone and share across threads.
#[derive(Clone)]
pub struct InboxSender {
    shared: Arc<InboxShared>,
}

static FULL_INBOX_WARNED: OnceCell<()> = OnceCell::new();

impl Inbox {
    pub fn new(capacity: usize) -> (Inbox, InboxSender) {
        let shared = Arc::new(InboxShared {
            queue: Mutex::new(Vec::new()),
            capacity,
            notify: Notify::new(),
        });
        (
            Inbox {
                shared: shared.clone(),
            },
            InboxSender { shared },
        )
    }

    /// Swaps out all queued messages, in arrival order.
    pub fn drain(&self) -> Vec<WorkerMessage> {
        std::mem::take(&mut *self.shared.queue.lock())
    }

    /// Waits until at least one message is queued, then drains.
    pub async fn recv(&self) -> Vec<WorkerMessage> {
        loop {
            let drained = self.drain();
            if !drained.is_empty() {
                return drained;
            }
            self.shared.notify.notified().await;
        }
    }
}

impl InboxSender {
    /// Posts one message. Fails with `QueueFull` when the inbox is at
    /// capacity; the message is handed back to the caller.
    pub fn post(&self, msg: WorkerMessage) -> Result<(), (SqlGateError, WorkerMessage)> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                return Err((SqlGateError::QueueFull, msg));
            }
            queue.push(msg);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Posts with exponential backoff on a full inbox. The first time any
    /// inbox fills up, a single operator warning is logged.
    pub async fn post_with_backoff(&self, msg: WorkerMessage) -> Result<(), SqlGateError> {
        let mut msg = msg;
        let mut delay = Duration::from_micros(100);
        let mut attempts = 0u32;
        loop {
            match self.post(msg) {
                Ok(()) => return Ok(()),
                Err((_, back)) => {
                    msg = back;
                    attempts += 1;
                    if attempts == 1 {
                        FULL_INBOX_WARNED.get_or_init(|| {
                            warn!(
                                "a worker inbox filled up; the worker is not keeping up \
                                 with cross-worker traffic"
                            );
                        });
                    }
                    if attempts > 16 {
                        return Err(SqlGateError::QueueFull);
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(50));
                }
            }
        }
    }

    /// Number of queued messages, for diagnostics.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}
