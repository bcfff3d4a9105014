//! Single-value operation a call chain can suspend on

use crate::runtime::Awaiter;
use crate::state::Resumption;
use crate::value::Exception;
use crate::{SuspendError, SuspendResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What happens when a resumption registers
enum Registration<T> {
    /// Store the resumption until completion
    Accept,
    /// Raise from registration
    Reject(Exception),
    /// Complete with the value and fire the resumption before returning
    CompleteWith(T),
}

struct Inner<T> {
    outcome: Option<Result<T, Exception>>,
    waiter: Option<Resumption>,
    registration: Registration<T>,
}

/// An operation that completes once, from any thread
///
/// Clones share the same operation.
pub struct Oneshot<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Oneshot<T> {
    fn with(outcome: Option<Result<T, Exception>>, registration: Registration<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                outcome,
                waiter: None,
                registration,
            })),
        }
    }

    /// Pending operation
    pub fn new() -> Self {
        Self::with(None, Registration::Accept)
    }

    /// Operation that has already completed with `value`
    pub fn ready(value: T) -> Self {
        Self::with(Some(Ok(value)), Registration::Accept)
    }

    /// Pending operation whose registration raises `exception`
    pub fn reject_registration(exception: Exception) -> Self {
        Self::with(None, Registration::Reject(exception))
    }

    /// Pending operation that completes with `value` while a resumption
    /// registers, firing it before registration returns
    pub fn complete_on_register(value: T) -> Self {
        Self::with(None, Registration::CompleteWith(value))
    }

    /// Complete with a value and fire the registered resumption
    ///
    /// # Errors
    ///
    /// Returns `SuspendError::AlreadyCompleted` if the operation has
    /// already completed.
    pub fn complete(&self, value: T) -> SuspendResult<()> {
        self.settle(Ok(value))
    }

    /// Complete with an exception and fire the registered resumption
    pub fn fail(&self, exception: Exception) -> SuspendResult<()> {
        self.settle(Err(exception))
    }

    /// Whether a resumption is waiting on this operation
    pub fn has_waiter(&self) -> bool {
        self.inner.lock().waiter.is_some()
    }

    fn settle(&self, outcome: Result<T, Exception>) -> SuspendResult<()> {
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return Err(SuspendError::AlreadyCompleted);
            }
            inner.outcome = Some(outcome);
            inner.waiter.take()
        };

        if let Some(resumption) = waiter {
            debug!(state = %resumption.state_id(), "oneshot completed, resuming waiter");
            resumption.resume();
        }
        Ok(())
    }
}

impl<T> Default for Oneshot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Oneshot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Oneshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Oneshot")
            .field("completed", &inner.outcome.is_some())
            .field("waiter", &inner.waiter)
            .finish()
    }
}

impl<T: Clone> Awaiter for Oneshot<T> {
    type Output = T;

    fn is_completed(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    fn on_completed(&self, resumption: Resumption) -> Result<(), Exception> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.registration, Registration::Accept) {
            Registration::Accept => {
                inner.waiter = Some(resumption);
                Ok(())
            }
            Registration::Reject(exception) => {
                inner.registration = Registration::Reject(exception.clone());
                Err(exception)
            }
            Registration::CompleteWith(value) => {
                inner.outcome = Some(Ok(value));
                drop(inner);
                resumption.resume();
                Ok(())
            }
        }
    }

    fn result(&self) -> Result<T, Exception> {
        match &self.inner.lock().outcome {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(exception)) => Err(exception.clone()),
            None => Err(SuspendError::NotReady.into()),
        }
    }
}
