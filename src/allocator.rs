use std::{
    alloc::{AllocError, Allocator, Layout},
    cell::UnsafeCell,
    ptr::NonNull,
};

use crate::{
    dedicated_full_run,
    defs::{
        PageReleaseMode, BRACKET_QUANTUM_SIZE, DEFAULT_PAGE_RELEASE_THRESHOLD,
        NUM_THREAD_LOCAL_SIZE_BRACKETS, PAGE_SIZE,
    },
    mmap::Mmap,
    round_up, RosHeap, Run,
};

/// A handle to a shared heap implementing the standard [`Allocator`] trait.
/// Each OS thread gets its own run cache, bound lazily on first touch.
#[derive(Clone, Copy)]
pub struct RosHeapAllocator {
    inner: *mut Inner,
}

struct ThreadCaches {
    runs: [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
}

unsafe impl Send for ThreadCaches {}

impl Default for ThreadCaches {
    fn default() -> Self {
        Self {
            runs: [dedicated_full_run(); NUM_THREAD_LOCAL_SIZE_BRACKETS],
        }
    }
}

struct Inner {
    heap: *mut RosHeap,
    map: Mmap,
    tls: thread_local::ThreadLocal<UnsafeCell<ThreadCaches>>,
}

unsafe impl Send for RosHeapAllocator {}
unsafe impl Sync for RosHeapAllocator {}

impl RosHeapAllocator {
    pub fn new(capacity: usize) -> Self {
        let capacity = round_up(capacity as u64, PAGE_SIZE as u64) as usize;
        let map = Mmap::new(capacity);
        let heap = RosHeap::new(
            map.start(),
            capacity,
            capacity,
            PageReleaseMode::SizeAndEnd,
            DEFAULT_PAGE_RELEASE_THRESHOLD,
        );
        Self {
            inner: Box::into_raw(Box::new(Inner {
                heap,
                map,
                tls: thread_local::ThreadLocal::new(),
            })),
        }
    }

    /// Tears the allocator down. All handles (this is a `Copy` type) become
    /// dangling; every allocation made from it is gone with the mapping.
    pub fn dispose(alloc: Self) {
        unsafe {
            let mut inner = Box::from_raw(alloc.inner);
            let heap = inner.heap;
            let map = std::mem::replace(&mut inner.map, Mmap::uninit());
            drop(inner);
            drop(Box::from_raw(heap));
            drop(map);
        }
    }

    unsafe fn get_tls(&self) -> &mut ThreadCaches {
        let inner = &mut *self.inner;
        &mut *inner
            .tls
            .get_or(|| UnsafeCell::new(ThreadCaches::default()))
            .get()
    }

    unsafe fn alloc_impl(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let inner = &mut *self.inner;
        let mut bytes_allocated = 0;
        let mut usable_size = 0;
        let mut bytes_tl_bulk_allocated = 0;
        let ptr = (*inner.heap).alloc::<true>(
            &mut self.get_tls().runs,
            size,
            &mut bytes_allocated,
            &mut usable_size,
            &mut bytes_tl_bulk_allocated,
        );
        let ptr = NonNull::new(ptr).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, usable_size))
    }

    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let inner = &*self.inner;
        (*inner.heap).usable_size(ptr)
    }

    pub unsafe fn block_start(&self, ptr: *const u8) -> *mut u8 {
        let inner = &*self.inner;
        (*inner.heap).block_start(ptr)
    }

    /// Returns the calling thread's cached runs to the shared pools.
    pub unsafe fn revoke_current_thread(&self) {
        let inner = &mut *self.inner;
        (*inner.heap).revoke_thread_local_runs(&mut self.get_tls().runs);
    }

    pub unsafe fn trim(&self) -> bool {
        let inner = &mut *self.inner;
        (*inner.heap).trim()
    }
}

unsafe impl Allocator for RosHeapAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > PAGE_SIZE {
            return Err(AllocError);
        }
        // Slots are only quantum aligned; over-aligned requests round the size
        // up to an alignment multiple, which lands them in a bracket (or page
        // count) whose slot boundaries satisfy the alignment.
        let size = if layout.align() <= BRACKET_QUANTUM_SIZE {
            layout.size().max(1)
        } else {
            round_up(
                layout.size().max(layout.align()) as u64,
                layout.align() as u64,
            ) as usize
        };
        unsafe { self.alloc_impl(size) }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        let inner = &mut *self.inner;
        (*inner.heap).free(&self.get_tls().runs, ptr.as_ptr());
    }
}
