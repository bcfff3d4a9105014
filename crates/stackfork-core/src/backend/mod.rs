//! Native backend interface
//!
//! The core never walks or rewrites a physical stack itself. A backend
//! supplies the primitives that do:
//! - `capture`: reify every frame between two stack markers into tasklets
//! - `resume_with_reference` / `resume_with_scalar`: splice one tasklet back
//!   onto the stack and run it until it returns, raises, or suspends again
//! - `reserve_stack`: grow stack headroom before a replay step
//! - `release`: free a frame image that will never be replayed
//!
//! [`shadow::ShadowBackend`] implements these for code that keeps its
//! continuations on a shadow stack.

pub mod shadow;

use crate::tasklet::{FrameImage, TaskletArena, TaskletId};
use crate::value::{HeapRef, Native, ReturnKind, ReturnValue};
use crate::SuspendResult;

/// Position on a worker's stack
///
/// Markers order frames: a frame above a marker was entered after the
/// marker was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackMarker(usize);

impl StackMarker {
    /// Create a marker at the given depth
    pub fn new(depth: usize) -> Self {
        StackMarker(depth)
    }

    /// Depth of the marker
    pub fn depth(self) -> usize {
        self.0
    }
}

/// Arguments to the capture primitive
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    /// Capture point (innermost frame to reify)
    pub from: StackMarker,

    /// Suspension frame boundary (frames at or below are not captured)
    pub until: StackMarker,

    /// Representation of the state's result slot
    pub slot_kind: ReturnKind,

    /// Whether the chain has never been resumed; if so the outermost
    /// captured frame returns into the result slot
    pub initial_entry: bool,
}

/// Tasklet chain produced by one capture, linked in replay order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedChain {
    /// Innermost frame (replays first)
    pub head: TaskletId,

    /// Outermost frame (replays last)
    pub tail: TaskletId,

    /// Number of tasklets in the chain
    pub len: usize,
}

/// Platform primitives used by the suspension runtime
pub trait NativeBackend: Send + Sync + 'static {
    /// Marker for the current position on this worker's stack
    fn marker(&self) -> StackMarker;

    /// Reify the frames between `request.until` and `request.from`
    ///
    /// On failure no tasklets allocated by this call may remain live.
    fn capture(
        &self,
        arena: &mut TaskletArena,
        request: &CaptureRequest,
    ) -> SuspendResult<CapturedChain>;

    /// Replay a frame whose return value is a heap reference
    ///
    /// `ret` carries the callee's return value in and is consumed.
    fn resume_with_reference(&self, image: FrameImage, ret: &mut ReturnValue) -> Native<HeapRef>;

    /// Replay a frame whose return value is a scalar (or nothing)
    fn resume_with_scalar(&self, image: FrameImage, ret: &mut ReturnValue) -> Native<usize>;

    /// Make `additional` more bytes of stack available to the replay pass
    fn reserve_stack(&self, additional: usize) -> SuspendResult<()> {
        let _ = additional;
        Ok(())
    }

    /// Dispose of a frame image that is being discarded without replay
    fn release(&self, image: FrameImage) {
        drop(image);
    }
}
