//! Block-pooled bump allocation for per-submission transient state.
//!
//! An [`ArenaBlockPool`] recycles uniformly sized raw blocks between
//! submissions so steady-state queue traffic allocates from the global
//! allocator only while warming up. Each in-flight submission owns one
//! [`Arena`] that bumps through pool blocks; dropping the arena returns the
//! blocks and invalidates every pointer it ever handed out.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{TaskError, TaskResult};

/// Alignment of every block base address. Allocations requesting a larger
/// alignment are rejected rather than padded.
const BLOCK_ALIGN: usize = 16;

/// One raw allocation, either pool-sized or a dedicated oversize block.
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
    pooled: bool,
}

// The block exclusively owns its allocation; the pointer is never aliased
// by another Block.
unsafe impl Send for Block {}

impl Block {
    fn allocate(size: usize, pooled: bool) -> TaskResult<Block> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN)
            .map_err(|err| TaskError::invalid_argument(format!("bad block layout: {err}")))?;
        // SAFETY: the layout has non-zero size (callers allocate at least one
        // byte) and a valid power-of-two alignment.
        let ptr = unsafe { alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Block { ptr, layout, pooled }),
            None => Err(TaskError::resource_exhausted(format!(
                "failed to allocate a {size} byte arena block"
            ))),
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr/layout are the exact pair returned by `alloc`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Shared pool of recycled arena blocks.
///
/// The pool is unbounded; callers that want to bound steady-state memory can
/// call [`ArenaBlockPool::trim`] at quiescent points.
pub struct ArenaBlockPool {
    block_size: usize,
    free: Mutex<Vec<Block>>,
}

impl ArenaBlockPool {
    /// Default block size, sized to hold the transient state of a typical
    /// submission without a second block.
    pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

    pub fn new(block_size: usize) -> ArenaBlockPool {
        assert!(block_size > 0, "block size must be non-zero");
        ArenaBlockPool {
            block_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently cached for reuse.
    pub fn cached_block_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Frees all cached blocks back to the global allocator.
    pub fn trim(&self) {
        self.free.lock().clear();
    }

    fn acquire(&self) -> TaskResult<Block> {
        if let Some(block) = self.free.lock().pop() {
            return Ok(block);
        }
        Block::allocate(self.block_size, true)
    }

    fn release(&self, block: Block) {
        debug_assert!(block.pooled);
        self.free.lock().push(block);
    }
}

impl Default for ArenaBlockPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE)
    }
}

struct CurrentBlock {
    block: Block,
    offset: usize,
}

#[derive(Default)]
struct ArenaInner {
    current: Option<CurrentBlock>,
    retired: Vec<Block>,
}

/// Bump allocator over pool blocks, owned by exactly one submission.
///
/// Pointers returned by [`Arena::allocate`] stay valid until the arena is
/// dropped; the arena itself never reads or writes the memory it hands out.
/// Allocations larger than the pool's block size get a dedicated exact-size
/// block that bypasses the pool on both acquire and release.
pub struct Arena {
    pool: Arc<ArenaBlockPool>,
    inner: Mutex<ArenaInner>,
}

impl Arena {
    pub fn new(pool: Arc<ArenaBlockPool>) -> Arena {
        Arena {
            pool,
            inner: Mutex::new(ArenaInner::default()),
        }
    }

    /// Allocates `layout` bytes, valid until the arena is dropped.
    pub fn allocate(&self, layout: Layout) -> TaskResult<NonNull<u8>> {
        if layout.align() > BLOCK_ALIGN {
            return Err(TaskError::invalid_argument(format!(
                "arena allocations are at most {BLOCK_ALIGN} byte aligned, requested {}",
                layout.align()
            )));
        }
        let size = layout.size();
        let mut inner = self.inner.lock();

        if let Some(current) = inner.current.as_mut() {
            let offset = align_up(current.offset, layout.align());
            if offset + size <= self.pool.block_size() {
                current.offset = offset + size;
                // SAFETY: offset + size fits in the block, so the sum cannot
                // leave the allocation.
                return Ok(unsafe {
                    NonNull::new_unchecked(current.block.ptr.as_ptr().add(offset))
                });
            }
        }

        if size > self.pool.block_size() {
            let block = Block::allocate(size, false)?;
            let ptr = block.ptr;
            inner.retired.push(block);
            return Ok(ptr);
        }

        let block = self.pool.acquire()?;
        let ptr = block.ptr;
        if let Some(previous) = inner.current.replace(CurrentBlock {
            block,
            offset: size,
        }) {
            inner.retired.push(previous.block);
        }
        Ok(ptr)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(current) = inner.current.take() {
            inner.retired.push(current.block);
        }
        for block in inner.retired.drain(..) {
            if block.pooled {
                self.pool.release(block);
            }
            // Oversize blocks fall out of scope and free directly.
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
