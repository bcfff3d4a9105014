//! Capture, splice, replay and discard of tasklet chains
//!
//! A state's outstanding chain is a singly linked list of tasklets in replay
//! order. Each capture reifies the frames between the capture point and the
//! suspension frame boundary and splices them in front of whatever is left
//! of the chain, so the most recently captured frames replay first:
//!
//! ```text
//! after 1st capture      head ─► c1 ─► b1 ─► a1
//! replaying c1 suspends  head ─► e2 ─► d2 ─► b1 ─► a1     prior_head = b1
//! abort                  head ─► b1 ─► a1                 (e2, d2 freed)
//! ```
//!
//! Lock order is chain, then arena. Neither lock is held while a backend
//! primitive runs native code.

use crate::backend::{CaptureRequest, CapturedChain, NativeBackend, StackMarker};
use crate::frame::{self, SuspensionFrame};
use crate::runtime::Shared;
use crate::state::{Phase, StateCore, SuspendTarget};
use crate::tasklet::{FrameImage, TaskletId};
use crate::value::{Exception, ReturnKind, ReturnValue, Unwind};
use crate::{SuspendError, SuspendResult};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

// ============================================================================
// Capture
// ============================================================================

/// Reify the frames between the capture point and `until`
pub(crate) fn capture_from(
    core: &StateCore,
    until: StackMarker,
    slot_kind: ReturnKind,
) -> SuspendResult<CapturedChain> {
    let shared = core.shared();
    let initial_entry = core.chain().lock().initial_entry;
    let request = CaptureRequest {
        from: shared.backend.marker(),
        until,
        slot_kind,
        initial_entry,
    };

    let captured = {
        let mut arena = shared.arena.lock();
        shared.backend.capture(&mut arena, &request)
    };

    match &captured {
        Ok(chain) => debug!(
            state = %core.id(),
            tasklets = chain.len,
            from = request.from.depth(),
            until = request.until.depth(),
            initial_entry,
            "frames captured"
        ),
        Err(e) => debug!(state = %core.id(), error = %e, "capture failed"),
    }
    captured
}

/// Put a fresh capture in front of the state's outstanding chain
///
/// The capture stays pending (`suspend_active`) until it commits or aborts.
pub(crate) fn splice_capture(core: &StateCore, captured: CapturedChain) -> SuspendResult<()> {
    let mut chain = core.chain().lock();

    let linked = core.shared().arena.lock().link(captured.tail, chain.head);
    if let Err(e) = linked {
        error!(state = %core.id(), error = %e, "captured chain lost its tail");
        drop(chain);
        free_chain(core.shared(), Some(captured.head), None);
        return Err(e);
    }

    chain.prior_head = chain.head;
    chain.prior_phase = chain.phase;
    chain.head = Some(captured.head);
    chain.phase = Phase::Suspended;
    chain.suspend_active = true;
    chain.abort_requested = false;

    debug!(state = %core.id(), tasklets = captured.len, "capture spliced");
    Ok(())
}

/// Why a pending capture is dropped
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Discard {
    /// The awaited operation refused the resumption
    Rejected,
    /// The resumption fired during registration; the chain keeps running
    Cancelled,
}

/// Drop the pending capture without replaying it
///
/// Frees every tasklet from the head up to the prior head and makes the
/// prior head current again. A cancelled capture also gets its prior
/// phase back (`Fresh` on first entry, `Resuming` inside a replay pass).
///
/// # Errors
///
/// Returns `SuspendError::NoActiveSuspension` if no capture is pending.
pub(crate) fn discard_from(core: &StateCore, reason: Discard) -> SuspendResult<()> {
    let (head, end) = {
        let mut chain = core.chain().lock();
        if !chain.suspend_active {
            error!(state = %core.id(), "abort without a pending capture");
            return Err(SuspendError::NoActiveSuspension);
        }
        let head = chain.head;
        chain.head = chain.prior_head;
        chain.phase = match reason {
            Discard::Rejected => Phase::Aborted,
            Discard::Cancelled => chain.prior_phase,
        };
        chain.suspend_active = false;
        chain.abort_requested = false;
        (head, chain.prior_head)
    };
    core.notify_commit();

    let freed = free_chain(core.shared(), head, end);
    debug!(state = %core.id(), freed, ?reason, "capture discarded");
    Ok(())
}

/// Free the tasklets from `head` up to `end` (exclusive) without replay
///
/// Returns how many were freed.
pub(crate) fn free_chain(
    shared: &Shared,
    head: Option<TaskletId>,
    end: Option<TaskletId>,
) -> usize {
    let images: Vec<Option<FrameImage>> = {
        let mut arena = shared.arena.lock();
        let ids: Vec<TaskletId> = arena.chain(head, end).collect();
        ids.into_iter()
            .filter_map(|id| match arena.free(id) {
                Ok(image) => Some(image),
                Err(e) => {
                    error!(tasklet = ?id, error = %e, "failed to free tasklet");
                    None
                }
            })
            .collect()
    };

    let freed = images.len();
    // Released outside the arena lock: an image may own the last reference
    // to another state.
    for image in images.into_iter().flatten() {
        shared.backend.release(image);
    }
    freed
}

// ============================================================================
// Resumption
// ============================================================================

/// Entry point of a fired resumption
pub(crate) fn resume(target: Arc<dyn SuspendTarget>) {
    let core = target.core();

    if frame::drives_state(core.id()) {
        let mut chain = core.chain().lock();
        if chain.suspend_active {
            chain.abort_requested = true;
            debug!(state = %core.id(), "resumption fired during registration");
        } else {
            warn!(state = %core.id(), "resumption fired while its chain is running");
        }
        return;
    }

    replay_all(&target);
}

/// Replay the state's chain until it completes or suspends again
fn replay_all(target: &Arc<dyn SuspendTarget>) {
    if let Some(outcome) = replay_pass(target) {
        target.finish(outcome);
    }
}

/// One replay pass; `None` if the chain suspended again or was not resumable
fn replay_pass(target: &Arc<dyn SuspendTarget>) -> Option<Result<ReturnValue, Exception>> {
    let core = target.core();
    let shared = core.shared();
    let _gate = core.replay_gate().lock();

    {
        let mut chain = core.chain().lock();
        core.await_commit(&mut chain);
        if chain.phase != Phase::Suspended {
            warn!(state = %core.id(), phase = ?chain.phase, "resumption fired for a chain that is not suspended");
            return None;
        }
        chain.phase = Phase::Resuming;
        chain.initial_entry = false;
    }
    debug!(state = %core.id(), "replay started");

    let _frame = frame::push_frame(SuspensionFrame::with_state(
        shared.backend.marker(),
        target.clone(),
    ));

    let mut headroom = Headroom::new(shared.options.max_replay_stack);
    let mut ret = ReturnValue::None;

    let raised = loop {
        let Some(step) = pop_head(core) else {
            debug!(state = %core.id(), "replay finished");
            return Some(Ok(ret));
        };
        let step = match step {
            Ok(step) => step,
            Err(e) => break Exception::from(e),
        };
        trace!(
            state = %core.id(),
            tasklet = ?step.id,
            kind = ?step.kind,
            stack = step.max_stack_needed,
            "replaying tasklet"
        );

        let replayed = Replayed {
            shared: shared.as_ref(),
            id: step.id,
        };
        let outcome = match headroom.ensure(shared.backend.as_ref(), step.max_stack_needed) {
            Ok(()) => run_native(|| {
                resume_step(shared.backend.as_ref(), step.kind, step.image, &mut ret)
            }),
            Err(e) => {
                shared.backend.release(step.image);
                Err(e.into())
            }
        };
        drop(replayed);

        match outcome {
            Ok(value) => ret = value,
            Err(Unwind::Suspend) => {
                debug!(state = %core.id(), "chain suspended again during replay");
                return None;
            }
            Err(Unwind::Throw(exception)) => break exception,
        }
    };

    // The rest of the chain will never run.
    let rest = core.chain().lock().head.take();
    let discarded = free_chain(shared, rest, None);
    debug!(state = %core.id(), discarded, error = %raised, "replay raised");
    Some(Err(raised))
}

struct Step {
    id: TaskletId,
    kind: ReturnKind,
    max_stack_needed: usize,
    image: FrameImage,
}

/// Advance the head past its tasklet and take the tasklet's image
fn pop_head(core: &StateCore) -> Option<SuspendResult<Step>> {
    let mut chain = core.chain().lock();
    let id = chain.head?;
    let mut arena = core.shared().arena.lock();

    let Some(tasklet) = arena.get(id) else {
        error!(state = %core.id(), tasklet = ?id, "chain head refers to a freed tasklet");
        chain.head = None;
        return Some(Err(SuspendError::StaleTasklet(id)));
    };
    let (next, kind, max_stack_needed) = (
        tasklet.next_in_stack(),
        tasklet.return_kind(),
        tasklet.max_stack_needed(),
    );
    chain.head = next;

    match arena.take_image(id) {
        Ok(image) => Some(Ok(Step {
            id,
            kind,
            max_stack_needed,
            image,
        })),
        Err(e) => {
            error!(state = %core.id(), tasklet = ?id, error = %e, "chain head has no frame image");
            if let Err(e) = arena.free(id) {
                error!(state = %core.id(), tasklet = ?id, error = %e, "failed to free tasklet");
            }
            Some(Err(e))
        }
    }
}

/// Frees a replayed tasklet when dropped, unwinding included
struct Replayed<'a> {
    shared: &'a Shared,
    id: TaskletId,
}

impl Drop for Replayed<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.shared.arena.lock().free(self.id) {
            error!(tasklet = ?self.id, error = %e, "replayed tasklet already freed");
        }
    }
}

/// Run a resume primitive, turning a panic in native code into the
/// chain's exception
fn run_native<F>(step: F) -> Result<ReturnValue, Unwind>
where
    F: FnOnce() -> Result<ReturnValue, Unwind>,
{
    panic::catch_unwind(AssertUnwindSafe(step)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(message = %message, "native code panicked during replay");
        Err(SuspendError::NativePanic(message).into())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Run one tasklet with the resume primitive its return kind selects
fn resume_step(
    backend: &dyn NativeBackend,
    kind: ReturnKind,
    image: FrameImage,
    ret: &mut ReturnValue,
) -> Result<ReturnValue, Unwind> {
    match kind {
        ReturnKind::Reference => backend
            .resume_with_reference(image, ret)
            .map(ReturnValue::Reference),
        ReturnKind::Scalar => backend
            .resume_with_scalar(image, ret)
            .map(ReturnValue::Scalar),
        ReturnKind::Void => backend
            .resume_with_scalar(image, ret)
            .map(|_| ReturnValue::None),
        ReturnKind::Indirect => {
            backend.release(image);
            Err(SuspendError::UnsupportedReturn(kind).into())
        }
    }
}

/// Stack headroom reserved during one replay pass; never shrinks
#[derive(Debug)]
struct Headroom {
    reserved: usize,
    limit: usize,
}

impl Headroom {
    fn new(limit: usize) -> Self {
        Self { reserved: 0, limit }
    }

    fn ensure(&mut self, backend: &dyn NativeBackend, needed: usize) -> SuspendResult<()> {
        if needed <= self.reserved {
            return Ok(());
        }
        if needed > self.limit {
            return Err(SuspendError::StackExhausted {
                requested: needed,
                limit: self.limit,
            });
        }

        backend.reserve_stack(needed - self.reserved)?;
        trace!(from = self.reserved, to = needed, "replay headroom grown");
        self.reserved = needed;
        Ok(())
    }
}
