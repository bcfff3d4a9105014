//! Shadow-stack backend
//!
//! A portable [`NativeBackend`] for code that keeps its own record of
//! the frames it is running. Each frame is entered with [`call`], which
//! registers the frame's continuation (`rest`, the work left once the callee
//! returns) on a per-thread shadow stack. A capture clones the continuations
//! between two shadow depths into tasklets; replaying a tasklet runs its
//! continuation with the carried return value.
//!
//! ```text
//! call(outer, || call(inner, || await_op(op), inner_rest), outer_rest)
//!
//! shadow stack   [outer_rest, inner_rest, await_rest]   capture ─► await ─► inner ─► outer
//! ```
//!
//! Work done by a frame after a suspend point must live in its continuation;
//! plain code following a suspending call is not replayed.

use super::{CaptureRequest, CapturedChain, NativeBackend, StackMarker};
use crate::defaults::DEFAULT_SHADOW_FRAME_STACK;
use crate::runtime::{self, Awaiter};
use crate::tasklet::{FrameImage, TaskletArena, TaskletId};
use crate::value::{FromReturnValue, HeapRef, IntoReturnValue, Native, ReturnKind, ReturnValue};
use crate::{SuspendError, SuspendResult};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{error, trace};

/// Work a frame does once its callee returns
pub type Continuation = Arc<dyn Fn(ReturnValue) -> Native<ReturnValue> + Send + Sync>;

thread_local! {
    static SHADOW: RefCell<Vec<ShadowFrame>> = const { RefCell::new(Vec::new()) };
}

/// Static description of a shadow frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    kind: ReturnKind,
    max_stack: usize,
}

impl FrameSpec {
    /// Frame returning `kind` that needs `max_stack` bytes to replay
    pub fn new(kind: ReturnKind, max_stack: usize) -> Self {
        Self { kind, max_stack }
    }

    /// Frame returning a scalar
    pub fn scalar(max_stack: usize) -> Self {
        Self::new(ReturnKind::Scalar, max_stack)
    }

    /// Frame returning a heap reference
    pub fn reference(max_stack: usize) -> Self {
        Self::new(ReturnKind::Reference, max_stack)
    }

    /// Frame returning nothing
    pub fn void(max_stack: usize) -> Self {
        Self::new(ReturnKind::Void, max_stack)
    }

    /// Return kind
    pub fn kind(&self) -> ReturnKind {
        self.kind
    }

    /// Stack bytes needed to replay the frame
    pub fn max_stack(&self) -> usize {
        self.max_stack
    }
}

struct ShadowFrame {
    spec: FrameSpec,
    rest: Continuation,
}

/// Frame image produced by [`ShadowBackend::capture`]
struct ShadowImage {
    rest: Continuation,
}

struct ShadowGuard {
    depth: usize,
}

impl Drop for ShadowGuard {
    fn drop(&mut self) {
        let popped = SHADOW.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth, "shadow frames popped out of order");
            stack.pop()
        });
        drop(popped);
    }
}

fn push(frame: ShadowFrame) -> ShadowGuard {
    let depth = SHADOW.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(frame);
        stack.len()
    });
    ShadowGuard { depth }
}

/// Number of shadow frames live on this thread
pub fn depth() -> usize {
    SHADOW.with(|stack| stack.borrow().len())
}

/// Enter a frame: run `callee`, then `rest` with its return value
///
/// While `callee` runs, the frame's continuation is on the shadow stack and
/// is captured by any suspension below it. If `callee` suspends, `rest` is
/// not run here; it runs when the captured tasklet replays.
pub fn call<C, R>(spec: FrameSpec, callee: C, rest: R) -> Native<ReturnValue>
where
    C: FnOnce() -> Native<ReturnValue>,
    R: Fn(ReturnValue) -> Native<ReturnValue> + Send + Sync + 'static,
{
    let rest: Continuation = Arc::new(rest);
    let value = {
        let _frame = push(ShadowFrame {
            spec,
            rest: rest.clone(),
        });
        callee()?
    };
    rest(value)
}

/// Suspend point: wait for `awaiter` and return its value
///
/// Runs in place when the operation has already completed (or completes
/// during registration); otherwise unwinds with `Unwind::Suspend` and
/// yields the value when the chain is replayed.
pub fn await_op<A>(awaiter: A) -> Native<A::Output>
where
    A: Awaiter + Send + Sync + 'static,
    A::Output: FromReturnValue + IntoReturnValue,
{
    let spec = FrameSpec::new(<A::Output as FromReturnValue>::KIND, DEFAULT_SHADOW_FRAME_STACK);
    await_with(spec, awaiter)
}

/// [`await_op`] with an explicit frame description
pub fn await_with<A>(spec: FrameSpec, awaiter: A) -> Native<A::Output>
where
    A: Awaiter + Send + Sync + 'static,
    A::Output: FromReturnValue + IntoReturnValue,
{
    let awaiter = Arc::new(awaiter);
    let pending = awaiter.clone();

    let value = call(
        spec,
        move || {
            runtime::suspend_on(pending.as_ref())?;
            Ok(ReturnValue::None)
        },
        move |_| Ok(awaiter.result()?.into_return()),
    )?;
    Ok(<A::Output as FromReturnValue>::from_return(value)?)
}

// ============================================================================
// Backend
// ============================================================================

/// Backend over the per-thread shadow stack
///
/// Clones share the reservation ledger.
#[derive(Debug, Clone, Default)]
pub struct ShadowBackend {
    reservations: Arc<Mutex<Vec<usize>>>,
}

impl ShadowBackend {
    /// Create a backend with an empty reservation ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Headroom requests made by replay passes, in order
    pub fn reservations(&self) -> Vec<usize> {
        self.reservations.lock().clone()
    }

    /// Total bytes requested across all passes
    pub fn reserved_total(&self) -> usize {
        self.reservations.lock().iter().sum()
    }

    fn unpack(image: FrameImage) -> SuspendResult<Continuation> {
        image
            .downcast::<ShadowImage>()
            .map(|image| image.rest)
            .map_err(|_| SuspendError::ForeignImage)
    }
}

impl NativeBackend for ShadowBackend {
    fn marker(&self) -> StackMarker {
        StackMarker::new(depth())
    }

    fn capture(
        &self,
        arena: &mut TaskletArena,
        request: &CaptureRequest,
    ) -> SuspendResult<CapturedChain> {
        let (from, until) = (request.from.depth(), request.until.depth());
        let empty = SuspendError::EmptyCapture { from, until };

        let frames: Vec<(FrameSpec, Continuation)> = SHADOW.with(|stack| {
            let stack = stack.borrow();
            stack
                .get(until..from)
                .map(|frames| {
                    frames
                        .iter()
                        .map(|frame| (frame.spec, frame.rest.clone()))
                        .collect()
                })
                .unwrap_or_default()
        });
        if frames.is_empty() {
            return Err(empty);
        }

        // Innermost frame first; the outermost one fills the result slot on
        // the initial entry.
        let mut ids: Vec<TaskletId> = Vec::with_capacity(frames.len());
        for (index, (spec, rest)) in frames.into_iter().enumerate().rev() {
            let kind = if index == 0 && request.initial_entry {
                request.slot_kind
            } else {
                spec.kind
            };

            match arena.alloc(Box::new(ShadowImage { rest }), spec.max_stack, kind) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        if let Err(e) = arena.free(id) {
                            error!(tasklet = ?id, error = %e, "failed to free partial capture");
                        }
                    }
                    return Err(e);
                }
            }
        }

        for pair in ids.windows(2) {
            arena.link(pair[0], Some(pair[1]))?;
        }

        match (ids.first(), ids.last()) {
            (Some(&head), Some(&tail)) => Ok(CapturedChain {
                head,
                tail,
                len: ids.len(),
            }),
            _ => Err(empty),
        }
    }

    fn resume_with_reference(&self, image: FrameImage, ret: &mut ReturnValue) -> Native<HeapRef> {
        let rest = Self::unpack(image)?;
        match rest(ret.take())? {
            ReturnValue::Reference(r) => Ok(r),
            other => Err(SuspendError::ReturnMismatch {
                expected: ReturnKind::Reference,
                actual: other.kind(),
            }
            .into()),
        }
    }

    fn resume_with_scalar(&self, image: FrameImage, ret: &mut ReturnValue) -> Native<usize> {
        let rest = Self::unpack(image)?;
        match rest(ret.take())? {
            ReturnValue::Scalar(v) => Ok(v),
            ReturnValue::None => Ok(0),
            other => Err(SuspendError::ReturnMismatch {
                expected: ReturnKind::Scalar,
                actual: other.kind(),
            }
            .into()),
        }
    }

    fn reserve_stack(&self, additional: usize) -> SuspendResult<()> {
        trace!(additional, "shadow stack reservation");
        self.reservations.lock().push(additional);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Unwind;

    fn scalar_rest(add: usize) -> impl Fn(ReturnValue) -> Native<ReturnValue> + Send + Sync {
        move |v| Ok(ReturnValue::Scalar(v.as_scalar().unwrap_or(0) + add))
    }

    #[test]
    fn test_call_runs_rest_in_place() {
        let value = call(
            FrameSpec::scalar(0),
            || Ok(ReturnValue::Scalar(40)),
            scalar_rest(2),
        )
        .unwrap();
        assert_eq!(value.as_scalar(), Some(42));
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_suspend_skips_rest() {
        let outcome = call(
            FrameSpec::scalar(0),
            || Err(Unwind::Suspend),
            |_| panic!("continuation must not run in place"),
        );
        assert!(matches!(outcome, Err(Unwind::Suspend)));
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_capture_innermost_first() {
        let backend = ShadowBackend::new();
        let mut arena = TaskletArena::new(8);

        let chain = call(
            FrameSpec::reference(512),
            || {
                call(
                    FrameSpec::scalar(64),
                    || {
                        let request = CaptureRequest {
                            from: backend.marker(),
                            until: StackMarker::new(0),
                            slot_kind: ReturnKind::Scalar,
                            initial_entry: true,
                        };
                        let chain = backend.capture(&mut arena, &request).unwrap();
                        Ok(ReturnValue::Scalar(chain.len))
                    },
                    |v| Ok(v),
                )
            },
            |v| Ok(v),
        )
        .unwrap();
        assert_eq!(chain.as_scalar(), Some(2));

        let ids: Vec<TaskletId> = arena.live().collect();
        // Live-set is newest first: the outermost frame was allocated last.
        let outer = arena.get(ids[0]).unwrap();
        let inner = arena.get(ids[1]).unwrap();
        assert_eq!(inner.max_stack_needed(), 64);
        assert_eq!(inner.next_in_stack(), Some(ids[0]));
        assert_eq!(outer.max_stack_needed(), 512);
        assert_eq!(outer.return_kind(), ReturnKind::Scalar);
        assert_eq!(outer.next_in_stack(), None);
    }

    #[test]
    fn test_capture_without_frames() {
        let backend = ShadowBackend::new();
        let mut arena = TaskletArena::new(8);
        let request = CaptureRequest {
            from: backend.marker(),
            until: backend.marker(),
            slot_kind: ReturnKind::Void,
            initial_entry: true,
        };
        assert!(matches!(
            backend.capture(&mut arena, &request),
            Err(SuspendError::EmptyCapture { from: 0, until: 0 })
        ));
    }

    #[test]
    fn test_failed_capture_frees_partial_chain() {
        let backend = ShadowBackend::new();
        let mut arena = TaskletArena::new(1);

        let outcome = call(
            FrameSpec::scalar(0),
            || {
                call(
                    FrameSpec::scalar(0),
                    || {
                        let request = CaptureRequest {
                            from: backend.marker(),
                            until: StackMarker::new(0),
                            slot_kind: ReturnKind::Scalar,
                            initial_entry: false,
                        };
                        backend.capture(&mut arena, &request)?;
                        Ok(ReturnValue::None)
                    },
                    |v| Ok(v),
                )
            },
            |v| Ok(v),
        );

        let exception = outcome.unwrap_err().exception().cloned().unwrap();
        assert!(matches!(
            exception.as_suspend_error(),
            Some(SuspendError::OutOfMemory { .. })
        ));
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn test_foreign_image_rejected() {
        let backend = ShadowBackend::new();
        let mut ret = ReturnValue::None;
        let err = backend
            .resume_with_scalar(Box::new(5u8), &mut ret)
            .unwrap_err();
        assert!(matches!(
            err.exception().and_then(|e| e.as_suspend_error()),
            Some(SuspendError::ForeignImage)
        ));
    }
}
