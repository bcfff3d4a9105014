//! Default constants for suspension runtime configuration.

/// Default upper bound on outstanding tasklets across one runtime.
pub const DEFAULT_MAX_LIVE_TASKLETS: usize = 64 * 1024;

/// Default stack headroom a single replay pass may reserve (8 MiB).
pub const DEFAULT_MAX_REPLAY_STACK: usize = 8 * 1024 * 1024;

/// Default number of tasklet slots preallocated by the arena.
pub const DEFAULT_INITIAL_ARENA_CAPACITY: usize = 64;

/// Stack bytes a shadow frame declares when its caller does not say.
pub const DEFAULT_SHADOW_FRAME_STACK: usize = 256;
