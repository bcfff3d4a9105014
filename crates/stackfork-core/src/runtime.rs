//! Suspend, resume and abort orchestration
//!
//! [`Suspender::run`] opens a suspension context around an async call chain.
//! Inside it, a suspend point calls [`suspend_on`] with the operation it is
//! waiting for:
//!
//! 1. If the operation already completed, nothing is captured.
//! 2. Otherwise the frames above the context boundary are captured into
//!    tasklets and the chain's [`Resumption`] is registered with the
//!    operation.
//! 3. If registration raises, the capture is discarded and the exception is
//!    re-raised unchanged.
//! 4. If the operation completed inside registration and fired the
//!    resumption synchronously, the capture is discarded and the chain
//!    continues in place.
//! 5. Otherwise the chain unwinds with [`Unwind::Suspend`]; `run` hands the
//!    caller a [`SuspendFuture`] and the tasklets replay when the operation
//!    completes.

use crate::backend::NativeBackend;
use crate::frame::{self, SuspensionFrame};
use crate::future::SuspendFuture;
use crate::options::SuspendOptions;
use crate::replay::{self, Discard};
use crate::state::{Phase, Resumption, SuspendTarget, SuspensionState};
use crate::tasklet::{ArenaStats, TaskletArena, TaskletId};
use crate::value::{Exception, FromReturnValue, Native, ReturnValue, Unwind};
use crate::{SuspendError, SuspendResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// An operation a call chain can suspend on
pub trait Awaiter {
    /// Value the operation produces
    type Output;

    /// Whether the operation has finished
    fn is_completed(&self) -> bool;

    /// Arrange for `resumption` to run when the operation finishes
    ///
    /// May invoke `resumption` before returning if the operation finishes
    /// during registration.
    fn on_completed(&self, resumption: Resumption) -> Result<(), Exception>;

    /// The operation's value, or the exception it failed with
    fn result(&self) -> Result<Self::Output, Exception>;
}

/// Outcome of running an async call chain
#[derive(Debug)]
pub enum Completion<T> {
    /// The chain returned without staying suspended
    Ready(T),
    /// The chain suspended; the future resolves when it finishes
    Pending(SuspendFuture<T>),
}

impl<T> Completion<T> {
    /// Whether the chain returned in place
    pub fn is_ready(&self) -> bool {
        matches!(self, Completion::Ready(_))
    }

    /// The future of a suspended chain
    pub fn into_future(self) -> Option<SuspendFuture<T>> {
        match self {
            Completion::Pending(future) => Some(future),
            Completion::Ready(_) => None,
        }
    }
}

/// State shared by every suspension a runtime creates
pub(crate) struct Shared {
    pub backend: Arc<dyn NativeBackend>,
    pub arena: Mutex<TaskletArena>,
    pub options: SuspendOptions,
}

/// Handle to a suspension runtime
///
/// Cheap to clone; every clone shares the backend and the tasklet arena.
#[derive(Clone)]
pub struct Suspender {
    shared: Arc<Shared>,
}

impl Suspender {
    /// Create a runtime with default options
    pub fn new<B: NativeBackend>(backend: B) -> Self {
        Self::build(Arc::new(backend), SuspendOptions::default())
    }

    /// Create a runtime with explicit options
    ///
    /// # Errors
    ///
    /// Returns `SuspendError::InvalidOptions` if the options fail validation.
    pub fn with_options<B: NativeBackend>(backend: B, options: SuspendOptions) -> SuspendResult<Self> {
        options.validate()?;
        Ok(Self::build(Arc::new(backend), options))
    }

    /// Create a runtime around a backend that is shared elsewhere
    pub fn from_shared_backend(
        backend: Arc<dyn NativeBackend>,
        options: SuspendOptions,
    ) -> SuspendResult<Self> {
        options.validate()?;
        Ok(Self::build(backend, options))
    }

    fn build(backend: Arc<dyn NativeBackend>, options: SuspendOptions) -> Self {
        let arena =
            TaskletArena::with_capacity(options.initial_arena_capacity, options.max_live_tasklets);
        Self {
            shared: Arc::new(Shared {
                backend,
                arena: Mutex::new(arena),
                options,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Runtime options
    pub fn options(&self) -> &SuspendOptions {
        &self.shared.options
    }

    /// Number of outstanding tasklets
    pub fn live_tasklets(&self) -> usize {
        self.shared.arena.lock().live_count()
    }

    /// Allocation counters of the tasklet arena
    pub fn arena_stats(&self) -> ArenaStats {
        self.shared.arena.lock().stats()
    }

    /// Snapshot of the live-set, most recently allocated first
    pub fn live_set(&self) -> Vec<TaskletId> {
        self.shared.arena.lock().live().collect()
    }

    /// Run an async call chain
    ///
    /// `body` is native code that may reach suspend points. Its suspension
    /// frame is popped before this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the exception `body` raised while running in place.
    pub fn run<T, F>(&self, body: F) -> Result<Completion<T>, Exception>
    where
        T: FromReturnValue,
        F: FnOnce() -> Native<ReturnValue>,
    {
        let shared = self.shared.clone();
        let marker = self.shared.backend.marker();
        let guard = frame::push_frame(SuspensionFrame::lazy(marker, move || {
            let state: Arc<dyn SuspendTarget> = SuspensionState::<T>::new(shared);
            state
        }));

        let outcome = body();
        let state = frame::take_current_state();
        drop(guard);

        match outcome {
            Ok(ret) => Ok(Completion::Ready(T::from_return(ret)?)),
            Err(Unwind::Throw(exception)) => Err(exception),
            Err(Unwind::Suspend) => {
                let state = state.ok_or_else(|| {
                    error!("call chain unwound for suspension without a suspension state");
                    Exception::from(SuspendError::NoActiveSuspension)
                })?;
                let state = state
                    .into_any()
                    .downcast::<SuspensionState<T>>()
                    .map_err(|_| {
                        Exception::msg("suspension state does not match the chain's result type")
                    })?;
                Ok(Completion::Pending(SuspendFuture::new(state)))
            }
        }
    }
}

impl std::fmt::Debug for Suspender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suspender")
            .field("options", &self.shared.options)
            .field("live_tasklets", &self.live_tasklets())
            .finish()
    }
}

// ============================================================================
// Suspend point protocol
// ============================================================================

/// Capture the current chain and return its resumption callback
///
/// Creates the frame's suspension state on first use. The capture is
/// pending until [`suspend_if_not_aborted`] or [`abort_suspend`] runs.
///
/// # Errors
///
/// Returns `SuspendError::NoActiveSuspension` outside a suspension frame and
/// `SuspendError::OutOfMemory` if the tasklets cannot be allocated.
pub fn get_or_create_resumption() -> SuspendResult<Resumption> {
    let target = frame::current_state()?;
    let until = frame::current_marker()?;
    let core = target.core();

    let captured = replay::capture_from(core, until, target.slot_kind())?;
    replay::splice_capture(core, captured)?;

    Ok(Resumption::new(target))
}

/// Discard the pending capture of the current frame's state
///
/// Used when registration fails; the state is left `Aborted`.
pub fn abort_suspend() -> SuspendResult<()> {
    let target = frame::current_state_if_created().ok_or(SuspendError::NoActiveSuspension)?;
    replay::discard_from(target.core(), Discard::Rejected)
}

/// Commit the pending capture, unless its resumption already fired
///
/// Returns `Ok(())` when the suspension was cancelled and the chain
/// continues in place, and `Err(Unwind::Suspend)` when the chain must
/// unwind to its suspension frame.
pub fn suspend_if_not_aborted() -> Native<()> {
    let target = frame::current_state_if_created().ok_or(SuspendError::NoActiveSuspension)?;
    let core = target.core();

    let abort = {
        let mut chain = core.chain().lock();
        if !chain.abort_requested {
            chain.suspend_active = false;
        }
        chain.abort_requested
    };

    if abort {
        debug!(state = %core.id(), "operation completed during registration, continuing in place");
        replay::discard_from(core, Discard::Cancelled)?;
        return Ok(());
    }

    core.notify_commit();
    debug!(state = %core.id(), "suspension committed");
    Err(Unwind::Suspend)
}

/// Suspend the current call chain until `awaiter` completes
///
/// Continues in place (`Ok`) when no suspension is needed or the
/// suspension was cancelled; the caller then reads `awaiter.result()`.
///
/// # Errors
///
/// `Unwind::Suspend` when the chain must unwind; `Unwind::Throw` with the
/// registration failure (unchanged) or a capture error.
pub fn suspend_on<A: Awaiter + ?Sized>(awaiter: &A) -> Native<()> {
    if awaiter.is_completed() {
        return Ok(());
    }

    let resumption = get_or_create_resumption()?;
    if let Err(exception) = awaiter.on_completed(resumption) {
        debug!(error = %exception, "registration failed, aborting suspension");
        abort_suspend()?;
        return Err(Unwind::Throw(exception));
    }

    suspend_if_not_aborted()
}

/// Phase of the current frame's suspension state, if it has one
pub fn current_phase() -> Option<Phase> {
    frame::current_state_if_created().map(|target| target.core().phase())
}
