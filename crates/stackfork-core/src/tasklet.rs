//! Tasklets and the arena that owns them
//!
//! A tasklet is the heap-resident image of one captured call frame. Tasklets
//! are addressed by [`TaskletId`] handles into a [`TaskletArena`]; the arena
//! threads two linkages through them:
//!
//! ```text
//! replay order   head ─► t3 ─► t2 ─► t1 ─► (remaining chain) ─► None
//! live-set       live_head ◄─► t1 ◄─► t2 ◄─► t3 ◄─► ...   (every outstanding tasklet)
//! ```
//!
//! Freeing a handle twice is reported as [`SuspendError::StaleTasklet`]
//! instead of corrupting the live-set.

use crate::value::ReturnKind;
use crate::{SuspendError, SuspendResult};
use slotmap::SlotMap;
use std::any::Any;

slotmap::new_key_type! {
    /// Handle of a tasklet in a [`TaskletArena`]
    pub struct TaskletId;
}

/// Opaque captured frame state produced by a backend's capture primitive
pub type FrameImage = Box<dyn Any + Send>;

/// One captured call frame plus bookkeeping
pub struct Tasklet {
    /// Frame that resumes after this one returns
    next_in_stack: Option<TaskletId>,

    /// Live-set neighbours
    live_prev: Option<TaskletId>,
    live_next: Option<TaskletId>,

    /// Extra native stack bytes needed to replay this frame
    max_stack_needed: usize,

    /// How this frame's return value is carried forward
    return_kind: ReturnKind,

    /// Captured frame state; taken out when the frame is replayed
    image: Option<FrameImage>,
}

impl Tasklet {
    /// Next tasklet in replay order
    #[inline]
    pub fn next_in_stack(&self) -> Option<TaskletId> {
        self.next_in_stack
    }

    /// Extra stack bytes needed to replay this frame
    #[inline]
    pub fn max_stack_needed(&self) -> usize {
        self.max_stack_needed
    }

    /// Return value tag
    #[inline]
    pub fn return_kind(&self) -> ReturnKind {
        self.return_kind
    }

    /// Whether the frame image is still present
    #[inline]
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

impl std::fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasklet")
            .field("next_in_stack", &self.next_in_stack)
            .field("max_stack_needed", &self.max_stack_needed)
            .field("return_kind", &self.return_kind)
            .field("has_image", &self.image.is_some())
            .finish()
    }
}

/// Allocation counters for leak auditing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Tasklets allocated since creation
    pub allocated: u64,
    /// Tasklets freed since creation
    pub freed: u64,
    /// Tasklets currently outstanding
    pub live: usize,
    /// Highest number of tasklets outstanding at once
    pub peak_live: usize,
}

/// Owning arena for tasklets
pub struct TaskletArena {
    slots: SlotMap<TaskletId, Tasklet>,

    /// Most recently allocated live tasklet
    live_head: Option<TaskletId>,

    /// Maximum live tasklets
    limit: usize,

    stats: ArenaStats,
}

impl TaskletArena {
    /// Create an arena holding at most `limit` live tasklets
    pub fn new(limit: usize) -> Self {
        Self::with_capacity(0, limit)
    }

    /// Create an arena with `capacity` slots reserved up front
    pub fn with_capacity(capacity: usize, limit: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            live_head: None,
            limit,
            stats: ArenaStats::default(),
        }
    }

    /// Allocate a tasklet for a captured frame
    ///
    /// The new tasklet is unlinked in replay order and becomes the head of
    /// the live-set.
    ///
    /// # Errors
    ///
    /// Returns `SuspendError::OutOfMemory` when the live limit is reached.
    pub fn alloc(
        &mut self,
        image: FrameImage,
        max_stack_needed: usize,
        return_kind: ReturnKind,
    ) -> SuspendResult<TaskletId> {
        if self.slots.len() >= self.limit {
            return Err(SuspendError::OutOfMemory {
                live: self.slots.len(),
                limit: self.limit,
            });
        }

        let old_head = self.live_head;
        let id = self.slots.insert(Tasklet {
            next_in_stack: None,
            live_prev: None,
            live_next: old_head,
            max_stack_needed,
            return_kind,
            image: Some(image),
        });

        if let Some(old) = old_head {
            self.slots[old].live_prev = Some(id);
        }
        self.live_head = Some(id);

        self.stats.allocated += 1;
        self.stats.live = self.slots.len();
        self.stats.peak_live = self.stats.peak_live.max(self.stats.live);
        Ok(id)
    }

    /// Set the replay successor of `id`
    pub fn link(&mut self, id: TaskletId, next: Option<TaskletId>) -> SuspendResult<()> {
        let tasklet = self
            .slots
            .get_mut(id)
            .ok_or(SuspendError::StaleTasklet(id))?;
        tasklet.next_in_stack = next;
        Ok(())
    }

    /// Look up a live tasklet
    #[inline]
    pub fn get(&self, id: TaskletId) -> Option<&Tasklet> {
        self.slots.get(id)
    }

    /// Whether `id` refers to a live tasklet
    #[inline]
    pub fn contains(&self, id: TaskletId) -> bool {
        self.slots.contains_key(id)
    }

    /// Move the frame image out for replay, leaving the tasklet allocated
    pub(crate) fn take_image(&mut self, id: TaskletId) -> SuspendResult<FrameImage> {
        self.slots
            .get_mut(id)
            .and_then(|t| t.image.take())
            .ok_or(SuspendError::StaleTasklet(id))
    }

    /// Free a tasklet, returning its image if it was never replayed
    ///
    /// # Errors
    ///
    /// Returns `SuspendError::StaleTasklet` if `id` was already freed.
    pub fn free(&mut self, id: TaskletId) -> SuspendResult<Option<FrameImage>> {
        let tasklet = self
            .slots
            .remove(id)
            .ok_or(SuspendError::StaleTasklet(id))?;

        match tasklet.live_prev {
            Some(prev) => self.slots[prev].live_next = tasklet.live_next,
            None => self.live_head = tasklet.live_next,
        }
        if let Some(next) = tasklet.live_next {
            self.slots[next].live_prev = tasklet.live_prev;
        }

        self.stats.freed += 1;
        self.stats.live = self.slots.len();
        Ok(tasklet.image)
    }

    /// Number of outstanding tasklets
    #[inline]
    pub fn live_count(&self) -> usize {
        self.slots.len()
    }

    /// Outstanding tasklets, most recently allocated first
    pub fn live(&self) -> LiveSet<'_> {
        LiveSet {
            arena: self,
            cursor: self.live_head,
        }
    }

    /// Walk a replay chain from `head`, stopping at `end` (exclusive)
    pub fn chain(&self, head: Option<TaskletId>, end: Option<TaskletId>) -> Chain<'_> {
        Chain {
            arena: self,
            cursor: head,
            end,
        }
    }

    /// Allocation counters
    #[inline]
    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Live tasklet limit
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Iterator over the live-set
pub struct LiveSet<'a> {
    arena: &'a TaskletArena,
    cursor: Option<TaskletId>,
}

impl Iterator for LiveSet<'_> {
    type Item = TaskletId;

    fn next(&mut self) -> Option<TaskletId> {
        let id = self.cursor?;
        self.cursor = self.arena.slots.get(id).and_then(|t| t.live_next);
        Some(id)
    }
}

/// Iterator over a replay chain
pub struct Chain<'a> {
    arena: &'a TaskletArena,
    cursor: Option<TaskletId>,
    end: Option<TaskletId>,
}

impl Iterator for Chain<'_> {
    type Item = TaskletId;

    fn next(&mut self) -> Option<TaskletId> {
        let id = self.cursor?;
        if Some(id) == self.end {
            return None;
        }
        self.cursor = self.arena.slots.get(id).and_then(|t| t.next_in_stack);
        Some(id)
    }
}
