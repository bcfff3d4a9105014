//! Runtime options (stackfork.toml)
//!
//! Options may be built in code or read from a TOML document. Missing keys
//! fall back to the values in [`crate::defaults`].

use crate::defaults::{
    DEFAULT_INITIAL_ARENA_CAPACITY, DEFAULT_MAX_LIVE_TASKLETS, DEFAULT_MAX_REPLAY_STACK,
};
use crate::{SuspendError, SuspendResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Suspension runtime options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SuspendOptions {
    /// Maximum tasklets outstanding at once; capture beyond it is out of memory
    pub max_live_tasklets: usize,

    /// Maximum stack headroom one replay pass may reserve, in bytes
    pub max_replay_stack: usize,

    /// Tasklet slots reserved up front
    pub initial_arena_capacity: usize,
}

impl Default for SuspendOptions {
    fn default() -> Self {
        Self {
            max_live_tasklets: DEFAULT_MAX_LIVE_TASKLETS,
            max_replay_stack: DEFAULT_MAX_REPLAY_STACK,
            initial_arena_capacity: DEFAULT_INITIAL_ARENA_CAPACITY,
        }
    }
}

impl SuspendOptions {
    /// Parse options from a file
    pub fn from_file(path: &Path) -> SuspendResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse options from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> SuspendResult<Self> {
        let options: SuspendOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Set the live tasklet limit
    ///
    /// The initial arena capacity is lowered to fit under it.
    pub fn with_max_live_tasklets(mut self, limit: usize) -> Self {
        self.max_live_tasklets = limit;
        self.initial_arena_capacity = self.initial_arena_capacity.min(limit);
        self
    }

    /// Set the per-pass replay stack limit
    pub fn with_max_replay_stack(mut self, bytes: usize) -> Self {
        self.max_replay_stack = bytes;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> SuspendResult<()> {
        if self.max_live_tasklets == 0 {
            return Err(SuspendError::InvalidOptions(
                "max_live_tasklets must be at least 1".to_string(),
            ));
        }

        if self.initial_arena_capacity > self.max_live_tasklets {
            return Err(SuspendError::InvalidOptions(format!(
                "initial_arena_capacity ({}) exceeds max_live_tasklets ({})",
                self.initial_arena_capacity, self.max_live_tasklets
            )));
        }

        Ok(())
    }
}
