//! Priority-ordered exclusive resource gate.
//!
//! [`PriorityArbiter::acquire`] never blocks: it enqueues a request and
//! returns a [`LockRequest`] handle. The resource is granted to the head of
//! the waiting queue (highest priority, then arrival order) whenever it is
//! free. A later high-priority request never preempts a granted holder; it
//! only moves ahead of requests still waiting.
//!
//! State, waiters and grant bookkeeping share one `parking_lot::Mutex`, and
//! waiters sleep on a `parking_lot::Condvar` with bounded timeouts.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::core::error::TaskResult;
use crate::core::operation::PendingOperation;

/// Identifier of one acquisition request.
pub type RequestId = u64;

/// Lifecycle of a [`LockRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the resource.
    Pending,
    /// Currently holding the resource.
    Granted,
    /// Released (or withdrawn before being granted).
    Released,
}

/// Waiting entry ordered by priority (highest first) and FIFO within priority.
#[derive(Debug)]
struct Waiter {
    id: RequestId,
    priority: i32,
    seq: u64,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.priority.cmp(&other.priority) {
            // FIFO within same priority: earlier seq wins (reversed for max-heap)
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

#[derive(Default)]
struct ArbiterState {
    holder: Option<RequestId>,
    waiting: BinaryHeap<Waiter>,
    signals: HashMap<RequestId, Sender<()>>,
    next_id: u64,
    grants: u64,
}

impl ArbiterState {
    fn state_of(&self, id: RequestId) -> RequestState {
        if self.holder == Some(id) {
            RequestState::Granted
        } else if self.signals.contains_key(&id) {
            RequestState::Pending
        } else {
            RequestState::Released
        }
    }

    // Hand the free resource to the head of the queue.
    fn grant_next(&mut self, name: &str) -> bool {
        if self.holder.is_some() {
            return false;
        }
        let Some(next) = self.waiting.pop() else {
            return false;
        };
        self.holder = Some(next.id);
        self.grants += 1;
        if let Some(signal) = self.signals.remove(&next.id) {
            let _ = signal.try_send(());
        }
        debug!(resource = name, request = next.id, priority = next.priority, "lock granted");
        true
    }
}

struct ArbiterShared {
    name: String,
    state: Mutex<ArbiterState>,
    granted: Condvar,
}

impl ArbiterShared {
    fn release(&self, id: RequestId) {
        let mut state = self.state.lock();
        if state.holder == Some(id) {
            state.holder = None;
            debug!(resource = %self.name, request = id, "lock released");
            if state.grant_next(&self.name) {
                self.granted.notify_all();
            }
        } else if state.signals.remove(&id).is_some() {
            state.waiting.retain(|w| w.id != id);
            debug!(resource = %self.name, request = id, "pending lock request withdrawn");
        }
    }
}

/// Exclusive gate for a resource shared by all workers and an operator.
///
/// Cloning yields another handle to the same gate.
#[derive(Clone)]
pub struct PriorityArbiter {
    shared: Arc<ArbiterShared>,
}

impl PriorityArbiter {
    /// New, unlocked gate. `name` appears in logs and timeout reports.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(ArbiterShared {
                name: name.into(),
                state: Mutex::new(ArbiterState::default()),
                granted: Condvar::new(),
            }),
        }
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a request without blocking. The grant happens as soon as the
    /// resource is free and this request heads the queue, possibly before
    /// this call returns.
    #[must_use = "dropping the request releases it immediately"]
    pub fn acquire(&self, priority: i32) -> LockRequest {
        let (tx, rx) = bounded(1);
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.waiting.push(Waiter {
            id,
            priority,
            seq: id,
        });
        state.signals.insert(id, tx);
        debug!(resource = %self.shared.name, request = id, priority, "lock requested");
        if state.grant_next(&self.shared.name) {
            self.shared.granted.notify_all();
        }
        drop(state);

        LockRequest {
            id,
            priority,
            shared: Arc::clone(&self.shared),
            finished: rx,
        }
    }

    /// Request currently holding the resource.
    #[must_use]
    pub fn holder(&self) -> Option<RequestId> {
        self.shared.state.lock().holder
    }

    /// Whether some request holds the resource.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Number of requests still waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    /// Total grants handed out since creation.
    #[must_use]
    pub fn grant_count(&self) -> u64 {
        self.shared.state.lock().grants
    }
}

impl std::fmt::Debug for PriorityArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PriorityArbiter")
            .field("name", &self.shared.name)
            .field("holder", &state.holder)
            .field("pending", &state.waiting.len())
            .finish()
    }
}

/// Handle to one acquisition request.
///
/// Releasing is idempotent; dropping the handle releases it (or withdraws it
/// if still pending).
pub struct LockRequest {
    id: RequestId,
    priority: i32,
    shared: Arc<ArbiterShared>,
    finished: Receiver<()>,
}

impl LockRequest {
    /// Request identifier.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Priority the request was made with.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.shared.state.lock().state_of(self.id)
    }

    /// Whether this request holds the resource.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.state() == RequestState::Granted
    }

    /// Block up to `timeout` for the grant. Returns true if granted.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        let id = self.id;
        self.shared.granted.wait_while_for(
            &mut state,
            |s| s.state_of(id) == RequestState::Pending,
            timeout,
        );
        state.state_of(id) == RequestState::Granted
    }

    /// Completion signal: receives exactly one message when the request is
    /// granted. Never fires for a request withdrawn while pending.
    #[must_use]
    pub const fn finished(&self) -> &Receiver<()> {
        &self.finished
    }

    /// Free the resource (or withdraw the pending request) and grant the
    /// next waiter. Safe to call repeatedly.
    pub fn release(&self) {
        self.shared.release(self.id);
    }
}

impl std::fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRequest")
            .field("resource", &self.shared.name)
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Drop for LockRequest {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

impl PendingOperation for &LockRequest {
    fn describe(&self) -> String {
        format!("lock request {} on {}", self.id, self.shared.name)
    }

    fn wait_for(&mut self, timeout: Duration) -> TaskResult<bool> {
        Ok(self.wait(timeout))
    }
}

/// Operator override: an elevated-priority request toggled on and off.
///
/// Engaging jumps ahead of queued worker requests but waits for the current
/// holder to release.
pub struct OperatorLock {
    arbiter: PriorityArbiter,
    priority: i32,
    request: Mutex<Option<LockRequest>>,
}

impl OperatorLock {
    /// Override for `arbiter` at `priority`.
    #[must_use]
    pub fn new(arbiter: PriorityArbiter, priority: i32) -> Self {
        Self {
            arbiter,
            priority,
            request: Mutex::new(None),
        }
    }

    /// Request the resource, replacing any previous request. Returns the
    /// grant signal.
    pub fn engage(&self) -> Receiver<()> {
        let mut slot = self.request.lock();
        if let Some(old) = slot.take() {
            old.release();
        }
        let request = self.arbiter.acquire(self.priority);
        let signal = request.finished().clone();
        *slot = Some(request);
        signal
    }

    /// Release (or withdraw) the operator request.
    pub fn disengage(&self) {
        if let Some(request) = self.request.lock().take() {
            request.release();
        }
    }

    /// Whether a request is outstanding.
    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.request.lock().is_some()
    }

    /// Whether the operator currently holds the resource.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.request
            .lock()
            .as_ref()
            .is_some_and(LockRequest::is_granted)
    }
}
