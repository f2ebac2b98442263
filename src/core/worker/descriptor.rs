// src/core/worker/descriptor.rs

//! The Descriptor (DCB): a poll-registered endpoint owned by exactly one
//! worker.
//!
//! A descriptor composes the pieces the original god-object carried in one
//! struct: a role, a lifecycle state, the wire buffers (read, write and the
//! pre-auth delay queue), TLS state, statistics, keyed callbacks and the
//! write-queue watermarks. It is touched only by its owning worker; cross-
//! worker effects go through the worker's message inbox.

use std::net::SocketAddr;
use std::time::Instant;

use strum_macros::Display;
use tracing::debug;

use crate::core::buffer::BufChain;
use crate::core::worker::WorkerId;

/// What this endpoint is.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DcbRole {
    Listener,
    ClientHandler,
    BackendHandler,
    Internal,
}

/// Lifecycle of a descriptor.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DcbState {
    Alloc,
    Polling,
    NoPolling,
    Listening,
    Disconnected,
}

/// TLS progress on the endpoint.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsState {
    #[default]
    Unknown,
    Required,
    Established,
    Failed,
}

/// Why a callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReason {
    HighWater,
    LowWater,
    Error,
    Hangup,
    Close,
}

/// Token returned by `add_callback`, usable for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackToken(u64);

type CallbackFn = Box<dyn FnMut(&mut Descriptor) + Send>;

struct CallbackEntry {
    reason: CallbackReason,
    token: CallbackToken,
    func: CallbackFn,
}

/// Plain counters kept per descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DcbStats {
    pub n_reads: u64,
    pub n_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub n_high_water: u64,
    pub n_low_water: u64,
}

/// A connection endpoint pinned to one worker.
pub struct Descriptor {
    id: u64,
    role: DcbRole,
    state: DcbState,
    owner: WorkerId,
    remote: Option<SocketAddr>,
    user: Option<String>,
    session_id: Option<u64>,

    read_queue: BufChain,
    write_queue: BufChain,
    delay_queue: BufChain,

    tls: TlsState,
    stats: DcbStats,
    last_read: Instant,

    high_water: usize,
    low_water: usize,
    above_high_water: bool,

    callbacks: Vec<CallbackEntry>,
    next_token: u64,
    fired_error: bool,
    fired_hangup: bool,
    fired_close: bool,
}

impl Descriptor {
    pub fn new(id: u64, role: DcbRole, owner: WorkerId) -> Self {
        Descriptor {
            id,
            role,
            state: DcbState::Alloc,
            owner,
            remote: None,
            user: None,
            session_id: None,
            read_queue: BufChain::new(),
            write_queue: BufChain::new(),
            delay_queue: BufChain::new(),
            tls: TlsState::Unknown,
            stats: DcbStats::default(),
            last_read: Instant::now(),
            high_water: 0,
            low_water: 0,
            above_high_water: false,
            callbacks: Vec::new(),
            next_token: 0,
            fired_error: false,
            fired_hangup: false,
            fired_close: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> DcbRole {
        self.role
    }

    pub fn state(&self) -> DcbState {
        self.state
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        self.remote = Some(remote);
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_user(&mut self, user: String) {
        self.user = Some(user);
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn set_session_id(&mut self, id: u64) {
        self.session_id = Some(id);
    }

    pub fn tls(&self) -> TlsState {
        self.tls
    }

    pub fn set_tls(&mut self, tls: TlsState) {
        self.tls = tls;
    }

    pub fn stats(&self) -> &DcbStats {
        &self.stats
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn set_watermarks(&mut self, low: usize, high: usize) {
        debug_assert!(low <= high);
        self.low_water = low;
        self.high_water = high;
    }

    // --- state machine ---

    /// `Alloc -> Polling` (or `Listening` for listeners) on successful
    /// registration with the owning worker's poller.
    pub fn register(&mut self) {
        debug_assert_eq!(self.state, DcbState::Alloc);
        self.state = if self.role == DcbRole::Listener {
            DcbState::Listening
        } else {
            DcbState::Polling
        };
    }

    /// `Polling -> NoPolling`: stop reading, e.g. on backpressure.
    pub fn pause(&mut self) {
        if self.state == DcbState::Polling {
            self.state = DcbState::NoPolling;
        }
    }

    /// `NoPolling -> Polling`.
    pub fn resume(&mut self) {
        if self.state == DcbState::NoPolling {
            self.state = DcbState::Polling;
        }
    }

    pub fn is_polling(&self) -> bool {
        self.state == DcbState::Polling
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, DcbState::Disconnected)
    }

    /// Moves the descriptor toward `Disconnected`, delivering the Close
    /// callback exactly once before resources are released.
    pub fn close(&mut self) {
        if self.state == DcbState::Disconnected {
            return;
        }
        debug!(dcb = self.id, role = %self.role, "closing descriptor");
        self.state = DcbState::Disconnected;
        if !self.fired_close {
            self.fired_close = true;
            self.fire(CallbackReason::Close);
        }
    }

    // --- queues ---

    pub fn read_queue(&mut self) -> &mut BufChain {
        &mut self.read_queue
    }

    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub fn delay_queue(&mut self) -> &mut BufChain {
        &mut self.delay_queue
    }

    /// Records incoming bytes into the read queue.
    pub fn buffer_read(&mut self, data: BufChain) {
        self.stats.n_reads += 1;
        self.stats.bytes_read += data.len() as u64;
        self.last_read = Instant::now();
        self.read_queue.append(data);
    }

    /// Queues outgoing bytes. A crossing of the high watermark fires the
    /// HighWater callback exactly once; producers are expected to stop
    /// pushing until LowWater fires.
    pub fn enqueue_write(&mut self, data: BufChain) {
        self.stats.n_writes += 1;
        self.write_queue.append(data);
        if self.high_water > 0
            && !self.above_high_water
            && self.write_queue.len() > self.high_water
        {
            self.above_high_water = true;
            self.stats.n_high_water += 1;
            self.fire(CallbackReason::HighWater);
        }
    }

    /// Takes up to `max` queued bytes for writing to the socket. A crossing
    /// below the low watermark fires the LowWater callback exactly once.
    pub fn dequeue_write(&mut self, max: usize) -> BufChain {
        let out = self.write_queue.split_front(max.min(self.write_queue.len()));
        self.stats.bytes_written += out.len() as u64;
        if self.above_high_water && self.write_queue.len() < self.low_water {
            self.above_high_water = false;
            self.stats.n_low_water += 1;
            self.fire(CallbackReason::LowWater);
        }
        out
    }

    /// True while producers should hold off because of backpressure.
    pub fn throttled(&self) -> bool {
        self.above_high_water
    }

    // --- callbacks ---

    /// Registers a callback. Callbacks fire in registration order and are
    /// keyed by `(reason, token)`.
    pub fn add_callback(
        &mut self,
        reason: CallbackReason,
        func: impl FnMut(&mut Descriptor) + Send + 'static,
    ) -> CallbackToken {
        let token = CallbackToken(self.next_token);
        self.next_token += 1;
        self.callbacks.push(CallbackEntry {
            reason,
            token,
            func: Box::new(func),
        });
        token
    }

    pub fn remove_callback(&mut self, reason: CallbackReason, token: CallbackToken) -> bool {
        let before = self.callbacks.len();
        self.callbacks
            .retain(|cb| !(cb.reason == reason && cb.token == token));
        self.callbacks.len() != before
    }

    /// Delivers the Error callbacks once per descriptor lifetime.
    pub fn on_error(&mut self) {
        if !self.fired_error {
            self.fired_error = true;
            self.fire(CallbackReason::Error);
        }
    }

    /// Delivers the Hangup callbacks once per descriptor lifetime.
    pub fn on_hangup(&mut self) {
        if !self.fired_hangup {
            self.fired_hangup = true;
            self.fire(CallbackReason::Hangup);
        }
    }

    fn fire(&mut self, reason: CallbackReason) {
        // Callbacks receive `&mut self`, so they are moved out for the
        // duration of the delivery.
        let mut fired = std::mem::take(&mut self.callbacks);
        for cb in fired.iter_mut().filter(|cb| cb.reason == reason) {
            (cb.func)(self);
        }
        // Callbacks registered during delivery stay behind the original
        // ones.
        let added = std::mem::take(&mut self.callbacks);
        fired.extend(added);
        self.callbacks = fired;
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("remote", &self.remote)
            .field("user", &self.user)
            .field("write_queue_len", &self.write_queue.len())
            .finish()
    }
}
