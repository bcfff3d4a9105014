//! Suspension frame stack
//!
//! Each worker keeps a stack of [`SuspensionFrame`]s, one per suspension
//! context it is currently running inside. A frame is pushed when an async
//! call chain starts (or a replay pass begins) and popped when control
//! returns to its caller, whether by return, raise, suspension or panic.
//!
//! Only the owning worker touches its stack. A state resumed on another
//! worker gets a fresh frame there.

use crate::backend::StackMarker;
use crate::state::{StateId, SuspendTarget};
use crate::{SuspendError, SuspendResult};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

thread_local! {
    static FRAMES: RefCell<Vec<SuspensionFrame>> = const { RefCell::new(Vec::new()) };
}

type StateFactory = Box<dyn FnOnce() -> Arc<dyn SuspendTarget>>;

enum StateSlot {
    Created(Arc<dyn SuspendTarget>),
    Lazy(StateFactory),
    /// Factory is running
    Creating,
}

/// One suspension context on a worker's frame stack
pub struct SuspensionFrame {
    /// Stack position of the frame boundary
    marker: StackMarker,

    state: StateSlot,
}

impl SuspensionFrame {
    /// Frame whose state is created the first time the chain suspends
    pub(crate) fn lazy<F>(marker: StackMarker, factory: F) -> Self
    where
        F: FnOnce() -> Arc<dyn SuspendTarget> + 'static,
    {
        Self {
            marker,
            state: StateSlot::Lazy(Box::new(factory)),
        }
    }

    /// Frame driving an existing state (replay)
    pub(crate) fn with_state(marker: StackMarker, state: Arc<dyn SuspendTarget>) -> Self {
        Self {
            marker,
            state: StateSlot::Created(state),
        }
    }

    /// Stack position of the frame boundary
    pub fn marker(&self) -> StackMarker {
        self.marker
    }

    /// Whether the suspension state has been created
    pub fn has_state(&self) -> bool {
        matches!(self.state, StateSlot::Created(_))
    }

    /// Id of the suspension state, if created
    pub fn state_id(&self) -> Option<StateId> {
        match &self.state {
            StateSlot::Created(state) => Some(state.core().id()),
            _ => None,
        }
    }

    pub(crate) fn state(&self) -> Option<&Arc<dyn SuspendTarget>> {
        match &self.state {
            StateSlot::Created(state) => Some(state),
            _ => None,
        }
    }
}

impl fmt::Debug for SuspensionFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspensionFrame")
            .field("marker", &self.marker)
            .field("state", &self.state_id())
            .finish()
    }
}

/// Pops its frame when dropped
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    depth: usize,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let popped = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            debug_assert_eq!(frames.len(), self.depth, "suspension frames popped out of order");
            frames.pop()
        });
        // Dropped outside the borrow: releasing a state may free tasklets.
        drop(popped);
    }
}

/// Push a frame; it stays current until the guard drops
pub fn push_frame(frame: SuspensionFrame) -> FrameGuard {
    let depth = FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        frames.push(frame);
        frames.len()
    });
    FrameGuard { depth }
}

/// Pop the current frame without a guard
///
/// # Errors
///
/// Returns `SuspendError::NoActiveSuspension` if the stack is empty.
pub fn pop_frame() -> SuspendResult<SuspensionFrame> {
    FRAMES
        .with(|frames| frames.borrow_mut().pop())
        .ok_or(SuspendError::NoActiveSuspension)
}

/// Whether this worker is inside any suspension frame
#[inline]
pub fn has_current_frame() -> bool {
    FRAMES.with(|frames| !frames.borrow().is_empty())
}

/// Number of nested suspension frames on this worker
#[inline]
pub fn depth() -> usize {
    FRAMES.with(|frames| frames.borrow().len())
}

/// Run `f` against the current frame
///
/// # Errors
///
/// Returns `SuspendError::NoActiveSuspension` outside any frame.
pub fn with_current_frame<R>(f: impl FnOnce(&SuspensionFrame) -> R) -> SuspendResult<R> {
    FRAMES.with(|frames| {
        let frames = frames.borrow();
        frames.last().map(f).ok_or(SuspendError::NoActiveSuspension)
    })
}

/// Stack marker of the current frame
pub fn current_marker() -> SuspendResult<StackMarker> {
    with_current_frame(SuspensionFrame::marker)
}

/// Whether any frame on this worker drives the state `id`
pub(crate) fn drives_state(id: StateId) -> bool {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .iter()
            .any(|frame| frame.state_id() == Some(id))
    })
}

/// State of the current frame, created on first use
pub(crate) fn current_state() -> SuspendResult<Arc<dyn SuspendTarget>> {
    let factory = FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let frame = frames.last_mut().ok_or(SuspendError::NoActiveSuspension)?;
        match std::mem::replace(&mut frame.state, StateSlot::Creating) {
            StateSlot::Created(state) => {
                frame.state = StateSlot::Created(state.clone());
                Ok(Err(state))
            }
            StateSlot::Lazy(factory) => Ok(Ok(factory)),
            StateSlot::Creating => Err(SuspendError::NoActiveSuspension),
        }
    })?;

    let factory = match factory {
        Ok(factory) => factory,
        Err(existing) => return Ok(existing),
    };

    // Run the factory outside the borrow, then install the state.
    let state = factory();
    FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            frame.state = StateSlot::Created(state.clone());
        }
    });
    Ok(state)
}

/// State of the current frame if it has been created
pub(crate) fn current_state_if_created() -> Option<Arc<dyn SuspendTarget>> {
    with_current_frame(|frame| frame.state().cloned())
        .ok()
        .flatten()
}

/// Take the state out of the frame a guard is about to pop
pub(crate) fn take_current_state() -> Option<Arc<dyn SuspendTarget>> {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let frame = frames.last_mut()?;
        match std::mem::replace(&mut frame.state, StateSlot::Creating) {
            StateSlot::Created(state) => Some(state),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_frame_outside_context() {
        assert!(!has_current_frame());
        assert!(matches!(
            current_marker(),
            Err(SuspendError::NoActiveSuspension)
        ));
        assert!(matches!(
            current_state(),
            Err(SuspendError::NoActiveSuspension)
        ));
        assert!(matches!(pop_frame(), Err(SuspendError::NoActiveSuspension)));
    }

    #[test]
    fn test_frames_nest_strictly() {
        let outer = push_frame(SuspensionFrame::lazy(StackMarker::new(0), || {
            unreachable!("state never requested")
        }));
        assert_eq!(depth(), 1);
        {
            let _inner = push_frame(SuspensionFrame::lazy(StackMarker::new(3), || {
                unreachable!("state never requested")
            }));
            assert_eq!(depth(), 2);
            assert_eq!(current_marker().unwrap(), StackMarker::new(3));
        }
        assert_eq!(depth(), 1);
        assert_eq!(current_marker().unwrap(), StackMarker::new(0));
        drop(outer);
        assert!(!has_current_frame());
    }

    #[test]
    fn test_guard_pops_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = push_frame(SuspensionFrame::lazy(StackMarker::new(1), || {
                unreachable!("state never requested")
            }));
            panic!("native code raised");
        });
        assert!(result.is_err());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_manual_pop() {
        let frame = SuspensionFrame::lazy(StackMarker::new(5), || unreachable!());
        std::mem::forget(push_frame(frame));
        let popped = pop_frame().unwrap();
        assert_eq!(popped.marker(), StackMarker::new(5));
        assert!(!popped.has_state());
    }
}
