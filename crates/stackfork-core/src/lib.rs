//! Stackfork Core Runtime
//!
//! Suspends an in-progress call chain without a compiler-generated state
//! machine and resumes it later, possibly on another worker:
//! - Suspension frame stack (per-thread nesting of suspension contexts)
//! - Tasklets (captured call frames, owned by a handle-based arena)
//! - Suspension state (capture, replay, exception propagation, completion)
//! - Future bridge for external schedulers
//!
//! The platform half (walking and splicing physical frames) sits behind
//! [`NativeBackend`]. [`ShadowBackend`] is a portable implementation for
//! code that registers its continuations on a shadow stack.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod defaults;
pub mod frame;
pub mod future;
pub mod oneshot;
pub mod options;
pub mod replay;
pub mod runtime;
pub mod state;
pub mod tasklet;
pub mod value;

pub use backend::shadow::{self, FrameSpec, ShadowBackend};
pub use backend::{CaptureRequest, CapturedChain, NativeBackend, StackMarker};
pub use future::SuspendFuture;
pub use oneshot::Oneshot;
pub use options::SuspendOptions;
pub use runtime::{suspend_on, Awaiter, Completion, Suspender};
pub use state::{Phase, Resumption, StateId, SuspensionState};
pub use tasklet::{ArenaStats, FrameImage, Tasklet, TaskletArena, TaskletId};
pub use value::{
    Exception, FromReturnValue, HeapRef, IntoReturnValue, Native, ReturnKind, ReturnValue,
    Unwind,
};

/// Suspension runtime errors
#[derive(Debug, thiserror::Error)]
pub enum SuspendError {
    /// The capture primitive could not allocate tasklets
    #[error("Out of memory: tasklet arena is full ({live} live, limit {limit})")]
    OutOfMemory {
        /// Tasklets outstanding at the time of the failure
        live: usize,
        /// Configured arena limit
        limit: usize,
    },

    /// A frame accessor was used outside any suspension frame
    #[error("No active suspension frame on this worker")]
    NoActiveSuspension,

    /// The result of a suspension was read before it completed
    #[error("Suspension result requested before completion")]
    NotReady,

    /// A suspension state was completed twice
    #[error("Suspension state already completed")]
    AlreadyCompleted,

    /// A tasklet handle no longer refers to a live tasklet
    #[error("Tasklet {0:?} is not live")]
    StaleTasklet(TaskletId),

    /// A tasklet carries a return kind replay cannot handle
    #[error("Unsupported tasklet return kind: {0:?}")]
    UnsupportedReturn(ReturnKind),

    /// A return value did not have the expected representation
    #[error("Return value mismatch: expected {expected:?}, got {actual:?}")]
    ReturnMismatch {
        /// Representation required by the receiver
        expected: ReturnKind,
        /// Representation actually produced
        actual: ReturnKind,
    },

    /// A replay pass needs more stack headroom than allowed
    #[error("Replay needs {requested} bytes of stack, limit is {limit}")]
    StackExhausted {
        /// Bytes the tasklet asked for
        requested: usize,
        /// Configured per-pass limit
        limit: usize,
    },

    /// No frames lie between the capture point and the suspension frame
    #[error("Nothing to capture between stack markers {from} and {until}")]
    EmptyCapture {
        /// Depth at the capture point
        from: usize,
        /// Depth of the suspension frame boundary
        until: usize,
    },

    /// Native code panicked while a tasklet was replaying
    #[error("Native code panicked during replay: {0}")]
    NativePanic(String),

    /// A frame image was not produced by this backend
    #[error("Frame image was not produced by this backend")]
    ForeignImage,

    /// Options failed validation
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Options file could not be read
    #[error("Failed to read options: {0}")]
    OptionsIo(#[from] std::io::Error),

    /// Options file could not be parsed
    #[error("Failed to parse options: {0}")]
    OptionsParse(#[from] toml::de::Error),
}

/// Suspension runtime result
pub type SuspendResult<T> = Result<T, SuspendError>;
