//! Suspension state
//!
//! A [`SuspensionState`] coordinates one async call chain across any number
//! of suspend/resume cycles. It owns the chain of outstanding tasklets,
//! hands out the resumption callback, records the final value or exception,
//! and notifies whoever observes completion.
//!
//! ```text
//!  Fresh ──capture──► Suspended ──resume──► Resuming ──► Completed
//!                        │   ▲                 │
//!              abort     │   └──nested suspend─┘
//!                        ▼
//!                     Aborted ──capture──► Suspended
//! ```
//!
//! A resumption keeps its state alive, so a suspended chain runs to
//! completion even when nobody holds its future any more.

use crate::replay;
use crate::runtime::Shared;
use crate::tasklet::TaskletId;
use crate::value::{Exception, FromReturnValue, ReturnKind, ReturnValue};
use crate::{SuspendError, SuspendResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Unique identifier for a suspension state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StateId(u64);

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

impl StateId {
    fn next() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle phase of a suspension state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No tasklets captured yet
    Fresh,
    /// Tasklets captured, resumption handed to an awaited operation
    Suspended,
    /// Resumption fired, replay in progress
    Resuming,
    /// The last capture was discarded before it committed
    Aborted,
    /// The chain returned or raised
    Completed,
}

/// Mutable chain bookkeeping, guarded by the state's chain lock
#[derive(Debug)]
pub(crate) struct ChainState {
    /// Next tasklet to replay
    pub head: Option<TaskletId>,

    /// Head before the latest capture; abort unwinds back to it
    pub prior_head: Option<TaskletId>,

    pub phase: Phase,

    /// Phase before the latest capture; a cancelled capture restores it
    pub prior_phase: Phase,

    /// True until the first resumption
    pub initial_entry: bool,

    /// A capture is waiting to commit or abort
    pub suspend_active: bool,

    /// Resumption fired from inside its own registration
    pub abort_requested: bool,
}

/// Non-generic half of a suspension state
pub(crate) struct StateCore {
    id: StateId,
    shared: Arc<Shared>,
    chain: Mutex<ChainState>,

    /// Held for the whole of a replay pass
    replay_gate: Mutex<()>,

    /// Signalled when a pending capture commits or aborts
    settled_capture: Condvar,
}

impl StateCore {
    #[inline]
    pub fn id(&self) -> StateId {
        self.id
    }

    #[inline]
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[inline]
    pub fn chain(&self) -> &Mutex<ChainState> {
        &self.chain
    }

    #[inline]
    pub fn replay_gate(&self) -> &Mutex<()> {
        &self.replay_gate
    }

    /// Block until no capture is waiting to commit or abort
    pub fn await_commit(&self, chain: &mut MutexGuard<'_, ChainState>) {
        while chain.suspend_active {
            self.settled_capture.wait(chain);
        }
    }

    pub fn notify_commit(&self) {
        self.settled_capture.notify_all();
    }

    pub fn phase(&self) -> Phase {
        self.chain.lock().phase
    }
}

impl Drop for StateCore {
    fn drop(&mut self) {
        let head = self.chain.get_mut().head.take();
        if head.is_none() {
            return;
        }

        let freed = replay::free_chain(&self.shared, head, None);
        warn!(state = %self.id, freed, "suspension state dropped with tasklets outstanding");
    }
}

/// Object-safe view of a suspension state used by the frame stack and
/// the replay loop
pub(crate) trait SuspendTarget: Send + Sync {
    fn core(&self) -> &StateCore;

    /// Representation of the result slot
    fn slot_kind(&self) -> ReturnKind;

    /// Record the chain's final outcome
    fn finish(&self, outcome: Result<ReturnValue, Exception>);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// ============================================================================
// Resumption callback
// ============================================================================

/// Callback that resumes a suspended call chain
///
/// Every resumption of a chain resumes the same state, and holds it
/// strongly: the operation that stores it keeps the suspended chain alive
/// until it fires or is dropped.
#[derive(Clone)]
pub struct Resumption {
    target: Arc<dyn SuspendTarget>,
    id: StateId,
}

impl Resumption {
    pub(crate) fn new(target: Arc<dyn SuspendTarget>) -> Self {
        let id = target.core().id();
        Self { target, id }
    }

    /// Resume the chain on the calling worker
    ///
    /// Called synchronously from inside the registration that received it,
    /// this cancels the pending suspension instead of replaying.
    pub fn resume(&self) {
        replay::resume(self.target.clone());
    }

    /// Id of the state this callback resumes
    pub fn state_id(&self) -> StateId {
        self.id
    }
}

impl fmt::Debug for Resumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resumption").field(&self.id).finish()
    }
}

// ============================================================================
// Typed state
// ============================================================================

type Observer = Box<dyn FnOnce() + Send>;

struct Settled<T> {
    /// Result slot or stored exception; written once
    outcome: Option<Result<T, Exception>>,
    observers: Vec<Observer>,
    waker: Option<Waker>,
}

/// Coordination record for one async call chain producing `T`
pub struct SuspensionState<T> {
    core: StateCore,

    /// Set once, before the outcome is published
    completed: AtomicBool,

    settled: Mutex<Settled<T>>,
    settled_cv: Condvar,
}

impl<T: FromReturnValue> SuspensionState<T> {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        let id = StateId::next();
        debug!(state = %id, "suspension state created");

        Arc::new(SuspensionState {
            core: StateCore {
                id,
                shared,
                chain: Mutex::new(ChainState {
                    head: None,
                    prior_head: None,
                    phase: Phase::Fresh,
                    prior_phase: Phase::Fresh,
                    initial_entry: true,
                    suspend_active: false,
                    abort_requested: false,
                }),
                replay_gate: Mutex::new(()),
                settled_capture: Condvar::new(),
            },
            completed: AtomicBool::new(false),
            settled: Mutex::new(Settled {
                outcome: None,
                observers: Vec::new(),
                waker: None,
            }),
            settled_cv: Condvar::new(),
        })
    }

    /// The resumption callback of this chain
    pub fn resumption(self: &Arc<Self>) -> Resumption {
        Resumption::new(self.clone())
    }
}

impl<T> SuspensionState<T> {
    /// Unique id
    pub fn id(&self) -> StateId {
        self.core.id
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    /// Whether the chain has returned or raised
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether this chain has never been resumed
    pub fn is_initial_entry(&self) -> bool {
        self.core.chain.lock().initial_entry
    }

    /// Number of tasklets still waiting to replay
    pub fn pending_tasklets(&self) -> usize {
        let head = self.core.chain.lock().head;
        let arena = self.core.shared.arena.lock();
        arena.chain(head, None).count()
    }

    /// Publish the outcome and notify observers
    ///
    /// # Errors
    ///
    /// Returns `SuspendError::AlreadyCompleted` on a second completion.
    pub(crate) fn complete(&self, outcome: Result<T, Exception>) -> SuspendResult<()> {
        let failed = outcome.is_err();
        let (observers, waker) = {
            let mut settled = self.settled.lock();
            if self.completed.load(Ordering::Acquire) {
                return Err(SuspendError::AlreadyCompleted);
            }
            self.completed.store(true, Ordering::Release);
            settled.outcome = Some(outcome);
            (std::mem::take(&mut settled.observers), settled.waker.take())
        };

        self.core.chain.lock().phase = Phase::Completed;
        self.settled_cv.notify_all();
        debug!(state = %self.core.id, failed, "suspension completed");

        for observer in observers {
            observer();
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Run `observer` once the chain completes (immediately if it has)
    pub fn register_completion<F>(&self, observer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut settled = self.settled.lock();
            if settled.outcome.is_none() {
                settled.observers.push(Box::new(observer));
                return;
            }
        }
        observer();
    }

    pub(crate) fn set_waker(&self, waker: &Waker) -> bool {
        let mut settled = self.settled.lock();
        if settled.outcome.is_some() {
            return false;
        }
        settled.waker = Some(waker.clone());
        true
    }
}

impl<T: Clone> SuspensionState<T> {
    /// The chain's result, or the exception it raised
    ///
    /// # Errors
    ///
    /// Re-raises the stored exception (same identity on every call), or
    /// `SuspendError::NotReady` before completion.
    pub fn result(&self) -> Result<T, Exception> {
        let settled = self.settled.lock();
        Self::read(&settled.outcome).unwrap_or_else(|| {
            error!(state = %self.core.id, "suspension result read before completion");
            Err(SuspendError::NotReady.into())
        })
    }

    /// Block until the chain completes
    pub fn wait(&self) -> Result<T, Exception> {
        let mut settled = self.settled.lock();
        loop {
            if let Some(result) = Self::read(&settled.outcome) {
                return result;
            }
            self.settled_cv.wait(&mut settled);
        }
    }

    /// Block until the chain completes or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Exception>> {
        let deadline = Instant::now() + timeout;
        let mut settled = self.settled.lock();
        loop {
            if let Some(result) = Self::read(&settled.outcome) {
                return Some(result);
            }
            if self.settled_cv.wait_until(&mut settled, deadline).timed_out() {
                return Self::read(&settled.outcome);
            }
        }
    }

    fn read(outcome: &Option<Result<T, Exception>>) -> Option<Result<T, Exception>> {
        match outcome {
            Some(Ok(value)) => Some(Ok(value.clone())),
            Some(Err(exception)) => Some(Err(exception.clone())),
            None => None,
        }
    }
}

impl<T: FromReturnValue> SuspendTarget for SuspensionState<T> {
    fn core(&self) -> &StateCore {
        &self.core
    }

    fn slot_kind(&self) -> ReturnKind {
        T::KIND
    }

    fn finish(&self, outcome: Result<ReturnValue, Exception>) {
        let outcome = outcome.and_then(|ret| T::from_return(ret).map_err(Exception::from));
        if let Err(e) = self.complete(outcome) {
            error!(state = %self.core.id, error = %e, "failed to complete suspension");
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> fmt::Debug for SuspensionState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspensionState")
            .field("id", &self.core.id)
            .field("phase", &self.core.phase())
            .field("completed", &self.is_complete())
            .finish()
    }
}
