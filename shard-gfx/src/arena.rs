//! Per-frame bump allocators backing the render graph's node storage.
//!
//! Two flavors, both fixed-capacity at startup and reset wholesale once per
//! frame: the *arena* holds POD node data (no drop glue needed, cheapest to
//! reset), the *scope* additionally owns values that run destructors on reset
//! (transient RAII wrappers around Vulkan image/view handles). They are kept
//! as two independently-sized `bumpalo::Bump` instances rather than one, so a
//! caller can budget `frame_arena_size` and `frame_scope_size` separately as
//! named in the configuration.

use bumpalo::Bump;

pub struct FrameArena {
    bump: Bump,
}

impl FrameArena {
    pub fn with_capacity(bytes: u64) -> Self {
        FrameArena {
            bump: Bump::with_capacity(bytes as usize),
        }
    }

    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.bump.alloc(value)
    }

    pub fn alloc_slice_copy<T: Copy>(&self, values: &[T]) -> &mut [T] {
        self.bump.alloc_slice_copy(values)
    }

    /// Wholesale reset; invalidates every reference previously handed out.
    /// Callers must not retain borrows across a frame boundary.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

/// Like [`FrameArena`] but intended for values whose `Drop` impls matter
/// (e.g. transient-image RAII wrappers that must enqueue a deferred destroy).
/// `Bump::reset` runs drop glue for everything allocated through the typed
/// `alloc` API, so this is functionally the arena with a documented contract
/// rather than a different data structure.
pub struct FrameScope {
    bump: Bump,
}

impl FrameScope {
    pub fn with_capacity(bytes: u64) -> Self {
        FrameScope {
            bump: Bump::with_capacity(bytes as usize),
        }
    }

    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.bump.alloc(value)
    }

    pub fn reset(&mut self) {
        self.bump.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reset_reclaims_capacity() {
        let mut arena = FrameArena::with_capacity(1024);
        arena.alloc_slice_copy(&[1u32, 2, 3, 4]);
        let used_before = arena.allocated_bytes();
        assert!(used_before > 0);
        arena.reset();
        // after reset, bumpalo keeps the chunk but the logical cursor is back
        // to zero; re-allocating the same amount should not grow the arena.
        arena.alloc_slice_copy(&[1u32, 2, 3, 4]);
        assert_eq!(arena.allocated_bytes(), used_before);
    }

    #[test]
    fn scope_runs_drop_glue_on_reset() {
        use std::cell::Cell;
        use std::rc::Rc;

        let dropped = Rc::new(Cell::new(false));
        struct MarkOnDrop(Rc<Cell<bool>>);
        impl Drop for MarkOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let mut scope = FrameScope::with_capacity(1024);
        scope.alloc(MarkOnDrop(dropped.clone()));
        assert!(!dropped.get());
        scope.reset();
        assert!(dropped.get());
    }
}
