//! Future bridge
//!
//! A [`SuspendFuture`] is the caller's handle on a suspended call chain. It
//! can be polled, blocked on, observed with a callback, or awaited from
//! inside another suspension context (it implements [`Awaiter`]).

use crate::runtime::Awaiter;
use crate::state::{Phase, Resumption, StateId, SuspensionState};
use crate::value::Exception;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Handle on the eventual result of a suspended call chain
pub struct SuspendFuture<T> {
    state: Arc<SuspensionState<T>>,
}

impl<T> SuspendFuture<T> {
    pub(crate) fn new(state: Arc<SuspensionState<T>>) -> Self {
        Self { state }
    }

    /// Whether the chain has returned or raised
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Run `callback` once the chain completes (inline if it already has)
    pub fn register_completion<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.register_completion(callback);
    }

    /// Lifecycle phase of the underlying state
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Id of the underlying state
    pub fn state_id(&self) -> StateId {
        self.state.id()
    }

    /// Tasklets still waiting to replay
    pub fn pending_tasklets(&self) -> usize {
        self.state.pending_tasklets()
    }
}

impl<T: Clone> SuspendFuture<T> {
    /// The chain's value, or the exception it raised
    ///
    /// # Errors
    ///
    /// Re-raises the stored exception (the same object on every call), or
    /// fails with `SuspendError::NotReady` before completion.
    pub fn get_result(&self) -> Result<T, Exception> {
        self.state.result()
    }

    /// Block the calling thread until the chain completes
    pub fn wait(&self) -> Result<T, Exception> {
        self.state.wait()
    }

    /// Block until the chain completes or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Exception>> {
        self.state.wait_timeout(timeout)
    }
}

impl<T> Clone for SuspendFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for SuspendFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SuspendFuture").field(&self.state).finish()
    }
}

impl<T: Clone> Future for SuspendFuture<T> {
    type Output = Result<T, Exception>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.set_waker(cx.waker()) {
            return Poll::Pending;
        }
        Poll::Ready(self.state.result())
    }
}

impl<T: Clone> Awaiter for SuspendFuture<T> {
    type Output = T;

    fn is_completed(&self) -> bool {
        self.is_complete()
    }

    fn on_completed(&self, resumption: Resumption) -> Result<(), Exception> {
        self.register_completion(move || resumption.resume());
        Ok(())
    }

    fn result(&self) -> Result<T, Exception> {
        self.get_result()
    }
}
