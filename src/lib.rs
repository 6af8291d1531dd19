#![cfg_attr(feature = "allocator-api", feature(allocator_api))]
#![allow(clippy::identity_op, clippy::missing_safety_doc)]

//! A segregated-fit, runs-of-slots heap allocator.
//!
//! The allocator owns one contiguous, page-aligned reservation and serves it
//! through three regimes: thread-local runs for small sizes, shared runs for
//! medium sizes, and page-granular blocks above [`LARGE_SIZE_THRESHOLD`].
//! A byte-per-page map classifies any address in O(1), free pages coalesce in
//! an address-sorted run set, and each run accounts for its slots with three
//! cooperating bit maps (alloc, bulk free, thread-local free) so a garbage
//! collector can free objects in bulk with one lock acquisition per run.

#[cfg(feature = "allocator-api")]
pub mod allocator;
pub mod defs;
pub mod mmap;
pub mod run;

pub use defs::*;
pub use run::{FreePageRun, Run};

use mmap::Mmap;
use parking_lot::{lock_api::RawMutex, lock_api::RawRwLock, RawMutex as Lock, RawRwLock as RwLock};
use std::{
    collections::{BTreeSet, HashSet},
    hash::{BuildHasherDefault, Hasher},
    mem::size_of,
    ops::Bound,
    ptr::null_mut,
    sync::atomic::{AtomicBool, Ordering},
};

use indexmap::IndexSet;

static mut DEDICATED_FULL_RUN_STORAGE: [usize; PAGE_SIZE / size_of::<usize>()] =
    [0; PAGE_SIZE / size_of::<usize>()];
static mut DEDICATED_FULL_RUN: *mut Run = null_mut();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

unsafe fn initialize() {
    let run = core::ptr::addr_of_mut!(DEDICATED_FULL_RUN_STORAGE).cast::<Run>();
    if cfg!(debug_assertions) {
        (*run).magic_num = MAGIC_NUM;
    }
    (*run).size_bracket_idx = 0;
    (*run).is_thread_local = 1;
    (*run).top_slot_idx = NUM_OF_SLOTS[0] as u32;
    // With every alloc bit set the dedicated run can never satisfy a slot
    // claim, so the fast paths treat it as a permanently full run and fall
    // through to the refill path without a null check.
    let num_vecs = (NUM_OF_SLOTS[0] + 31) / 32;
    let mut v = 0;
    while v < num_vecs {
        (*run).alloc_bit_map().add(v).write(u32::MAX);
        v += 1;
    }
    DEDICATED_FULL_RUN = run;
}

/// Returns the dedicated always-full run that stands in for "no run" in
/// thread caches and `current_runs`.
#[inline]
pub fn dedicated_full_run() -> *mut Run {
    unsafe { DEDICATED_FULL_RUN }
}

#[inline(always)]
pub const fn round_down(x: u64, n: u64) -> u64 {
    let x = x as i64;
    let n = n as i64;
    (x & -n) as u64
}

#[inline(always)]
pub const fn round_up(x: u64, n: u64) -> u64 {
    round_down(x.wrapping_add(n).wrapping_sub(1), n)
}

#[derive(Clone, Copy, Debug, Default)]
struct PtrHasher(u64);

impl Hasher for PtrHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 = (self.0 << 8) ^ (byte as u64);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.0 ^= value;
    }

    fn write_usize(&mut self, value: usize) {
        self.0 ^= value as u64;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type BuildNoopHasher = BuildHasherDefault<PtrHasher>;

/// The runs-of-slots heap.
///
/// Locking discipline, in acquisition order:
/// 1. `bulk_free_lock` — reader/writer roles are inverted on purpose:
///    [`RosHeap::bulk_free`] holds the *writer* side while it scatters marks
///    into the scratch bit maps of many runs, so that no drain can observe a
///    half-written map; every drain (and every single free) holds the *reader*
///    side, because drainers already serialize against one another through the
///    bracket locks.
/// 2. `size_bracket_locks[i]` — one mutex per bracket, guarding
///    `current_runs[i]`, `non_full_runs[i]`, `full_runs[i]` and every shared
///    run of that bracket.
/// 3. `lock` — the page lock, guarding the page map, the free-page-run set,
///    the size side table and the footprint.
///
/// The thread-local allocation fast path takes none of them.
pub struct RosHeap {
    pub(crate) base: *mut u8,
    pub(crate) footprint: usize,
    capacity: usize,
    max_capacity: usize,

    /// Runs of a bracket with at least one free slot, address sorted so
    /// refills prefer low addresses. Guarded by the bracket lock.
    non_full_runs: [*mut BTreeSet<*mut Run>; NUM_OF_SIZE_BRACKETS],
    /// Runs with no free slot. Only maintained in debug builds; the release
    /// build lets full runs float until a free brings them back.
    full_runs: [*mut HashSet<*mut Run, BuildNoopHasher>; NUM_OF_SIZE_BRACKETS],
    current_runs: [*mut Run; NUM_OF_SIZE_BRACKETS],
    size_bracket_locks: [*mut Lock; NUM_OF_SIZE_BRACKETS],

    /// Free page runs, sorted by address and always maximally coalesced.
    free_page_runs: BTreeSet<*mut FreePageRun>,
    page_map: *mut u8,
    page_map_size: usize,
    max_page_map_size: usize,
    page_map_mem_map: Mmap,
    /// Byte sizes of the free page runs, indexed by page map index. Kept out
    /// of the free pages themselves so their backing can be released.
    pub(crate) free_page_run_size_map: Vec<usize>,

    pub lock: Lock,
    bulk_free_lock: RwLock,

    pub(crate) page_release_mode: PageReleaseMode,
    pub(crate) page_release_size_threshold: usize,

    morecore: Option<extern "C" fn(heap: *mut RosHeap, increment: isize, data: *mut u8)>,
    morecore_data: *mut u8,
}

impl Drop for RosHeap {
    fn drop(&mut self) {
        unsafe {
            for i in 0..NUM_OF_SIZE_BRACKETS {
                drop(Box::from_raw(self.full_runs[i]));
                drop(Box::from_raw(self.non_full_runs[i]));
                drop(Box::from_raw(self.size_bracket_locks[i]));
            }
        }
    }
}

impl RosHeap {
    /// Creates a heap over `[base, base + capacity)`. The region must be
    /// mapped, writable and page aligned; the heap only bookkeeps it.
    /// `capacity` may later be raised toward `max_capacity` with
    /// [`RosHeap::set_footprint_limit`].
    pub fn new(
        base: *mut u8,
        capacity: usize,
        max_capacity: usize,
        page_release_mode: PageReleaseMode,
        page_release_size_threshold: usize,
    ) -> *mut Self {
        assert!(!base.is_null());
        assert_eq!(base as usize % PAGE_SIZE, 0);
        assert_eq!(capacity % PAGE_SIZE, 0);
        assert_eq!(max_capacity % PAGE_SIZE, 0);
        assert!(capacity <= max_capacity);

        let mut this = Self {
            base,
            capacity,
            max_capacity,
            footprint: capacity,
            bulk_free_lock: RwLock::INIT,
            lock: Lock::INIT,
            size_bracket_locks: [null_mut(); NUM_OF_SIZE_BRACKETS],
            page_release_mode,
            page_release_size_threshold,
            free_page_run_size_map: Vec::new(),
            free_page_runs: BTreeSet::new(),
            full_runs: [null_mut(); NUM_OF_SIZE_BRACKETS],
            current_runs: [null_mut(); NUM_OF_SIZE_BRACKETS],
            non_full_runs: [null_mut(); NUM_OF_SIZE_BRACKETS],
            page_map: null_mut(),
            page_map_mem_map: Mmap::uninit(),
            page_map_size: 0,
            max_page_map_size: 0,
            morecore: None,
            morecore_data: null_mut(),
        };

        if INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            unsafe {
                initialize();
            }
        }
        while dedicated_full_run().is_null() {
            std::hint::spin_loop();
        }

        unsafe {
            for i in 0..NUM_OF_SIZE_BRACKETS {
                this.size_bracket_locks[i] = Box::into_raw(Box::new(Lock::INIT));
                this.current_runs[i] = dedicated_full_run();
                this.non_full_runs[i] = Box::into_raw(Box::new(BTreeSet::new()));
                this.full_runs[i] = Box::into_raw(Box::new(HashSet::with_hasher(Default::default())));
            }

            let num_of_pages = this.footprint / PAGE_SIZE;
            let max_num_of_pages = max_capacity / PAGE_SIZE;

            this.page_map_mem_map =
                Mmap::new(round_up(max_num_of_pages as u64, PAGE_SIZE as u64) as usize);
            this.page_map = this.page_map_mem_map.start();
            this.page_map_size = num_of_pages;
            this.max_page_map_size = max_num_of_pages;
            this.free_page_run_size_map.resize(num_of_pages, 0);

            let free_pages = this.base.cast::<FreePageRun>();
            if cfg!(debug_assertions) {
                (*free_pages).magic_num = MAGIC_NUM_FREE;
            }
            (*free_pages).set_byte_size(&mut this, capacity);
            (*free_pages).release_pages(&mut this);
            this.free_page_runs.insert(free_pages);
        }

        Box::into_raw(Box::new(this))
    }

    /// Installs a callback invoked after the footprint grows or shrinks, with
    /// the signed byte increment. Embedding runtimes use it to mirror the
    /// committed range; the heap itself does not require one since the whole
    /// reservation is mapped up front.
    pub fn set_morecore(
        &mut self,
        morecore: extern "C" fn(*mut Self, isize, *mut u8),
        data: *mut u8,
    ) {
        self.morecore = Some(morecore);
        self.morecore_data = data;
    }

    pub fn footprint(&self) -> usize {
        self.lock.lock();
        let f = self.footprint;
        unsafe {
            self.lock.unlock();
        }
        f
    }

    pub fn footprint_limit(&self) -> usize {
        self.lock.lock();
        let f = self.capacity;
        unsafe {
            self.lock.unlock();
        }
        f
    }

    /// Raises the footprint limit. Shrinking below the current capacity is
    /// ignored; the limit never exceeds `max_capacity`.
    pub fn set_footprint_limit(&mut self, new_capacity: usize) {
        self.lock.lock();
        if self.capacity < new_capacity {
            debug_assert!(new_capacity <= self.max_capacity);
            self.capacity = new_capacity;
        }
        unsafe {
            self.lock.unlock();
        }
    }

    pub fn begin(&self) -> *mut u8 {
        self.base
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.base.add(self.capacity) }
    }

    /// Start address of the allocation containing `ptr`: the slot base for
    /// run-backed memory, the first page for a large object, null for free
    /// pages.
    pub fn block_start(&self, ptr: *const u8) -> *mut u8 {
        unsafe {
            let mut pm_idx = self.round_down_to_page_map_index(ptr);
            self.lock.lock();
            let res = match self.page_map.add(pm_idx).cast::<PageMapKind>().read() {
                PageMapKind::Empty | PageMapKind::Released => null_mut(),
                PageMapKind::LargeObject => self.base.add(pm_idx * PAGE_SIZE),
                PageMapKind::LargeObjectPart => {
                    while self.page_map.add(pm_idx).cast::<PageMapKind>().read()
                        != PageMapKind::LargeObject
                    {
                        pm_idx -= 1;
                    }
                    self.base.add(pm_idx * PAGE_SIZE)
                }
                PageMapKind::Run | PageMapKind::RunPart => {
                    while self.page_map.add(pm_idx).cast::<PageMapKind>().read()
                        != PageMapKind::Run
                    {
                        pm_idx -= 1;
                    }
                    let run = self.base.add(pm_idx * PAGE_SIZE).cast::<Run>();
                    (*run).slot_from_ptr(ptr)
                }
            };
            self.lock.unlock();
            res
        }
    }

    /// Size of the allocated block containing `ptr`: the bracket size for a
    /// run slot, the page-rounded size for a large object.
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe {
            let mut pm_idx = self.round_down_to_page_map_index(ptr);
            self.lock.lock();
            let res = match self.page_map.add(pm_idx).cast::<PageMapKind>().read() {
                PageMapKind::Released | PageMapKind::Empty | PageMapKind::LargeObjectPart => {
                    unreachable!("unallocated memory: pm_idx={}, ptr={:p}", pm_idx, ptr);
                }
                PageMapKind::LargeObject => {
                    let mut num_pages = 1;
                    let mut idx = pm_idx + 1;
                    let end = self.page_map_size;
                    while idx < end
                        && self.page_map.add(idx).cast::<PageMapKind>().read()
                            == PageMapKind::LargeObjectPart
                    {
                        num_pages += 1;
                        idx += 1;
                    }
                    num_pages * PAGE_SIZE
                }
                PageMapKind::Run | PageMapKind::RunPart => {
                    while self.page_map.add(pm_idx).cast::<PageMapKind>().read()
                        != PageMapKind::Run
                    {
                        pm_idx -= 1;
                    }
                    let run = self.base.add(pm_idx * PAGE_SIZE).cast::<Run>();
                    Self::index_to_bracket_size((*run).size_bracket_idx as usize)
                }
            };
            self.lock.unlock();
            res
        }
    }

    /// Tries to shrink the footprint by the free page run at its end, handing
    /// the physical range back to the kernel. Returns whether anything was
    /// trimmed.
    pub unsafe fn trim(&mut self) -> bool {
        self.lock.lock();
        if let Some(&last_free_page_run) = self.free_page_runs.last() {
            if (*last_free_page_run).end(self) == self.base.add(self.footprint) {
                let decrement = (*last_free_page_run).byte_size(self);
                self.free_page_runs.remove(&last_free_page_run);
                self.release_page_range(
                    last_free_page_run.cast(),
                    (last_free_page_run as usize + decrement) as *mut u8,
                );
                let new_footprint = self.footprint - decrement;
                let new_num_of_pages = new_footprint / PAGE_SIZE;
                self.page_map_size = new_num_of_pages;
                self.free_page_run_size_map.resize(new_num_of_pages, 0);
                if let Some(morecore) = self.morecore {
                    morecore(self, -(decrement as isize), self.morecore_data);
                }
                self.footprint = new_footprint;
                #[cfg(feature = "trace")]
                log::info!("RosHeap::trim() : footprint reduced by {} bytes", decrement);
                self.lock.unlock();
                return true;
            }
        }
        self.lock.unlock();
        false
    }

    /// Carves `num_pages` pages out of the free page run set, first fit in
    /// address order, growing the footprint within the capacity if no run
    /// fits. Returns null when the request cannot be satisfied. The page lock
    /// must be held.
    pub unsafe fn alloc_pages(&mut self, num_pages: usize, kind: PageMapKind) -> *mut u8 {
        debug_assert!(self.lock.is_locked());
        let req_byte_size = num_pages * PAGE_SIZE;
        let mut res: *mut FreePageRun = null_mut();

        let mut chosen: *mut FreePageRun = null_mut();
        for &fpr in self.free_page_runs.iter() {
            debug_assert!((*fpr).is_free());
            if (*fpr).byte_size(self) >= req_byte_size {
                chosen = fpr;
                break;
            }
        }
        if !chosen.is_null() {
            let fpr_byte_size = (*chosen).byte_size(self);
            self.free_page_runs.remove(&chosen);
            #[cfg(feature = "trace")]
            log::info!(
                "RosHeap::alloc_pages() : Erased run {:p} from free_page_runs",
                chosen
            );
            if req_byte_size < fpr_byte_size {
                let remainder = chosen.cast::<u8>().add(req_byte_size).cast::<FreePageRun>();
                if cfg!(debug_assertions) {
                    (*remainder).magic_num = MAGIC_NUM_FREE;
                }
                (*remainder).set_byte_size(self, fpr_byte_size - req_byte_size);
                self.free_page_runs.insert(remainder);
                (*chosen).set_byte_size(self, req_byte_size);
            }
            res = chosen;
        }

        if res.is_null() && self.capacity > self.footprint {
            // No fit; grow the committed suffix. A trailing free run extends
            // in place instead of leaving an uncoalesced neighbor behind.
            let mut last_free_page_run: *mut FreePageRun = null_mut();
            let mut last_free_page_run_size = 0;
            if let Some(&last) = self.free_page_runs.last() {
                if (*last).end(self) == self.base.add(self.footprint) {
                    last_free_page_run = last;
                    last_free_page_run_size = (*last).byte_size(self);
                }
            }
            if self.capacity - self.footprint + last_free_page_run_size >= req_byte_size {
                let increment = (2 * MB)
                    .max(req_byte_size - last_free_page_run_size)
                    .min(self.capacity - self.footprint);
                let new_footprint = self.footprint + increment;
                let new_num_of_pages = new_footprint / PAGE_SIZE;
                debug_assert!(new_num_of_pages <= self.max_page_map_size);
                // Newly exposed pages start out free.
                core::ptr::write_bytes(
                    self.page_map.add(self.page_map_size),
                    PageMapKind::Released as u8,
                    new_num_of_pages - self.page_map_size,
                );
                self.page_map_size = new_num_of_pages;
                self.free_page_run_size_map.resize(new_num_of_pages, 0);
                if let Some(morecore) = self.morecore {
                    morecore(self, increment as isize, self.morecore_data);
                }
                if !last_free_page_run.is_null() {
                    (*last_free_page_run).set_byte_size(self, last_free_page_run_size + increment);
                } else {
                    let new_free_page_run = self.base.add(self.footprint).cast::<FreePageRun>();
                    if cfg!(debug_assertions) {
                        (*new_free_page_run).magic_num = MAGIC_NUM_FREE;
                    }
                    (*new_free_page_run).set_byte_size(self, increment);
                    self.free_page_runs.insert(new_free_page_run);
                }
                self.footprint = new_footprint;

                debug_assert!(!self.free_page_runs.is_empty());
                let fpr = *self.free_page_runs.last().unwrap_unchecked();
                let fpr_byte_size = (*fpr).byte_size(self);
                debug_assert!(fpr_byte_size >= req_byte_size);
                self.free_page_runs.remove(&fpr);
                if req_byte_size < fpr_byte_size {
                    let remainder = fpr.cast::<u8>().add(req_byte_size).cast::<FreePageRun>();
                    if cfg!(debug_assertions) {
                        (*remainder).magic_num = MAGIC_NUM_FREE;
                    }
                    (*remainder).set_byte_size(self, fpr_byte_size - req_byte_size);
                    self.free_page_runs.insert(remainder);
                    (*fpr).set_byte_size(self, req_byte_size);
                }
                res = fpr;
            }
        }

        if !res.is_null() {
            let page_map_idx = self.to_page_map_index(res.cast());
            let mut i = 0;
            while i < num_pages {
                debug_assert!(self.is_free_page(page_map_idx + i));
                i += 1;
            }
            match kind {
                PageMapKind::Run => {
                    self.page_map
                        .add(page_map_idx)
                        .write(PageMapKind::Run as u8);
                    for i in 1..num_pages {
                        self.page_map
                            .add(page_map_idx + i)
                            .write(PageMapKind::RunPart as u8);
                    }
                }
                PageMapKind::LargeObject => {
                    self.page_map
                        .add(page_map_idx)
                        .write(PageMapKind::LargeObject as u8);
                    for i in 1..num_pages {
                        self.page_map
                            .add(page_map_idx + i)
                            .write(PageMapKind::LargeObjectPart as u8);
                    }
                }
                _ => unreachable!("cannot allocate pages of kind {:?}", kind),
            }
            if cfg!(debug_assertions) {
                // Wipe the free-page-run magic byte.
                core::ptr::write_bytes(res.cast::<u8>(), 0, PAGE_SIZE);
            }
            return res.cast();
        }
        null_mut()
    }

    /// Returns the pages of the run or large object starting at `ptr` to the
    /// free set, coalescing with both address neighbors and applying the page
    /// release policy. The page lock must be held. Returns the freed byte
    /// count.
    pub unsafe fn free_pages(&mut self, ptr: *mut u8, already_zero: bool) -> usize {
        debug_assert!(self.lock.is_locked());
        let pm_idx = self.to_page_map_index(ptr);
        let pm_type = self.page_map.add(pm_idx).read();
        let pm_part_type = match pm_type {
            x if x == PageMapKind::Run as u8 => PageMapKind::RunPart as u8,
            x if x == PageMapKind::LargeObject as u8 => PageMapKind::LargeObjectPart as u8,
            _ => unreachable!("freeing unallocated pages at {:p}", ptr),
        };

        let mut num_pages = 1;
        self.page_map.add(pm_idx).write(PageMapKind::Empty as u8);
        let mut idx = pm_idx + 1;
        let end = self.page_map_size;
        while idx < end && self.page_map.add(idx).read() == pm_part_type {
            self.page_map.add(idx).write(PageMapKind::Empty as u8);
            num_pages += 1;
            idx += 1;
        }

        let byte_size = num_pages * PAGE_SIZE;
        if !already_zero && self.page_release_mode != PageReleaseMode::All {
            core::ptr::write_bytes(ptr, 0, byte_size);
        }

        let mut fpr = ptr.cast::<FreePageRun>();
        if cfg!(debug_assertions) {
            (*fpr).magic_num = MAGIC_NUM_FREE;
        }
        (*fpr).set_byte_size(self, byte_size);
        debug_assert!(!self.free_page_runs.contains(&fpr));

        // The set is maximally coalesced, so at most one successor and one
        // predecessor can be adjacent.
        let succ = self
            .free_page_runs
            .range((Bound::Excluded(fpr), Bound::Unbounded))
            .next()
            .copied();
        if let Some(higher) = succ {
            debug_assert!((*higher).is_free());
            if (*fpr).end(self) == (*higher).begin() {
                self.free_page_runs.remove(&higher);
                let merged = (*fpr).byte_size(self) + (*higher).byte_size(self);
                if cfg!(debug_assertions) {
                    (*higher).magic_num = 0;
                }
                (*fpr).set_byte_size(self, merged);
            }
        }
        let pred = self.free_page_runs.range(..fpr).next_back().copied();
        if let Some(lower) = pred {
            debug_assert!((*lower).is_free());
            if (*lower).end(self) == (*fpr).begin() {
                self.free_page_runs.remove(&lower);
                let merged = (*lower).byte_size(self) + (*fpr).byte_size(self);
                if cfg!(debug_assertions) {
                    (*fpr).magic_num = 0;
                }
                (*lower).set_byte_size(self, merged);
                fpr = lower;
            }
        }

        (*fpr).release_pages(self);
        self.free_page_runs.insert(fpr);
        #[cfg(feature = "trace")]
        log::info!(
            "RosHeap::free_pages() : Inserted run {:p} ({} bytes) into free_page_runs",
            fpr,
            (*fpr).byte_size(self)
        );
        byte_size
    }

    unsafe fn alloc_large_object(
        &mut self,
        size: usize,
        bytes_allocated: &mut usize,
        usable_size: &mut usize,
        bytes_tl_bulk_allocated: &mut usize,
    ) -> *mut u8 {
        let num_pages = round_up(size as u64, PAGE_SIZE as u64) as usize / PAGE_SIZE;
        self.lock.lock();
        let r = self.alloc_pages(num_pages, PageMapKind::LargeObject);
        self.lock.unlock();
        if !r.is_null() {
            let total_bytes = num_pages * PAGE_SIZE;
            *bytes_allocated = total_bytes;
            *usable_size = total_bytes;
            *bytes_tl_bulk_allocated = total_bytes;
        }
        r
    }

    unsafe fn alloc_run(&mut self, idx: usize) -> *mut Run {
        self.lock.lock();
        let new_run = self.alloc_pages(NUM_OF_PAGES[idx], PageMapKind::Run).cast::<Run>();
        self.lock.unlock();
        if !new_run.is_null() {
            if cfg!(debug_assertions) {
                (*new_run).magic_num = MAGIC_NUM;
            }
            (*new_run).size_bracket_idx = idx as u8;
            (*new_run).clear_bit_maps();
            (*new_run).top_slot_idx = 0;
        }
        new_run
    }

    /// Next run for bracket `idx`: the lowest-address non-full run if any,
    /// otherwise a fresh one from the page allocator. Called with the bracket
    /// lock held.
    pub unsafe fn refill_run(&mut self, idx: usize) -> *mut Run {
        let non_full_runs = self.non_full_runs[idx];
        if let Some(&run) = (*non_full_runs).first() {
            (*non_full_runs).remove(&run);
            return run;
        }
        self.alloc_run(idx)
    }

    /// Claims a slot from `current_runs[idx]`, retiring an exhausted current
    /// run and installing a refill. Called with the bracket lock held.
    unsafe fn alloc_from_current_run_unlocked(&mut self, idx: usize) -> *mut u8 {
        let mut current_run = self.current_runs[idx];
        let mut slot_addr = (*current_run).alloc_slot();
        if !slot_addr.is_null() {
            return slot_addr;
        }
        if cfg!(debug_assertions) && current_run != dedicated_full_run() {
            (*self.full_runs[idx]).insert(current_run);
        }
        current_run = self.refill_run(idx);
        if current_run.is_null() {
            self.current_runs[idx] = dedicated_full_run();
            return null_mut();
        }
        (*current_run).is_thread_local = 0;
        self.current_runs[idx] = current_run;
        slot_addr = (*current_run).alloc_slot();
        debug_assert!(!slot_addr.is_null());
        slot_addr
    }

    /// The thread-local small-size path plus the shared medium-size path.
    unsafe fn alloc_from_run(
        &mut self,
        tls_runs: &mut [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
        size: usize,
        bytes_allocated: &mut usize,
        usable_size: &mut usize,
        bytes_tl_bulk_allocated: &mut usize,
    ) -> *mut u8 {
        let (idx, bracket_size) = Self::size_to_index_and_bracket_size(size);
        let mut slot_addr;
        if idx < NUM_THREAD_LOCAL_SIZE_BRACKETS {
            let mut thread_local_run = tls_runs[idx];
            slot_addr = (*thread_local_run).alloc_slot();
            if slot_addr.is_null() {
                // The cached run looks exhausted. Drain the marks a GC may
                // have left on it, and only if that yields nothing retire it
                // and refill from the shared pools.
                self.bulk_free_lock.lock_shared();
                (**self.size_bracket_locks.get_unchecked(idx)).lock();
                let mut is_all_free_after_merge = false;
                let merged = thread_local_run != dedicated_full_run()
                    && (*thread_local_run)
                        .merge_thread_local_free_bit_map_to_alloc_bit_map(
                            &mut is_all_free_after_merge,
                        );
                if merged {
                    debug_assert!(!(*thread_local_run).is_full());
                    debug_assert_eq!(
                        is_all_free_after_merge,
                        (*thread_local_run).is_all_free()
                    );
                } else {
                    if thread_local_run != dedicated_full_run() {
                        debug_assert!((*thread_local_run).is_full());
                        (*thread_local_run).is_thread_local = 0;
                        if cfg!(debug_assertions) {
                            (*self.full_runs[idx]).insert(thread_local_run);
                        }
                    }
                    thread_local_run = self.refill_run(idx);
                    if thread_local_run.is_null() {
                        tls_runs[idx] = dedicated_full_run();
                        (**self.size_bracket_locks.get_unchecked(idx)).unlock();
                        self.bulk_free_lock.unlock_shared();
                        return null_mut();
                    }
                    debug_assert!(!(*self.non_full_runs[idx]).contains(&thread_local_run));
                    (*thread_local_run).is_thread_local = 1;
                    tls_runs[idx] = thread_local_run;
                }
                *bytes_tl_bulk_allocated =
                    (*thread_local_run).number_of_free_slots() * bracket_size;
                slot_addr = (*thread_local_run).alloc_slot();
                debug_assert!(!slot_addr.is_null());
                (**self.size_bracket_locks.get_unchecked(idx)).unlock();
                self.bulk_free_lock.unlock_shared();
            } else {
                *bytes_tl_bulk_allocated = 0;
            }
            *bytes_allocated = bracket_size;
            *usable_size = bracket_size;
        } else {
            (**self.size_bracket_locks.get_unchecked(idx)).lock();
            slot_addr = self.alloc_from_current_run_unlocked(idx);
            (**self.size_bracket_locks.get_unchecked(idx)).unlock();
            if !slot_addr.is_null() {
                *bytes_allocated = bracket_size;
                *usable_size = bracket_size;
                *bytes_tl_bulk_allocated = bracket_size;
            }
        }
        slot_addr
    }

    unsafe fn alloc_from_run_thread_unsafe(
        &mut self,
        size: usize,
        bytes_allocated: &mut usize,
        usable_size: &mut usize,
        bytes_tl_bulk_allocated: &mut usize,
    ) -> *mut u8 {
        let (idx, bracket_size) = Self::size_to_index_and_bracket_size(size);
        let slot_addr = self.alloc_from_current_run_unlocked(idx);
        if !slot_addr.is_null() {
            *bytes_allocated = bracket_size;
            *usable_size = bracket_size;
            *bytes_tl_bulk_allocated = bracket_size;
        }
        slot_addr
    }

    /// Allocates `size` bytes through the shared current runs, taking the
    /// bracket lock even for small sizes. Useful for threads with no cache.
    pub unsafe fn alloc_global(
        &mut self,
        size: usize,
        bytes_allocated: &mut usize,
        usable_size: &mut usize,
        bytes_tl_bulk_allocated: &mut usize,
    ) -> *mut u8 {
        *bytes_allocated = 0;
        *usable_size = 0;
        *bytes_tl_bulk_allocated = 0;
        if size > LARGE_SIZE_THRESHOLD {
            return self.alloc_large_object(
                size,
                bytes_allocated,
                usable_size,
                bytes_tl_bulk_allocated,
            );
        }
        let (idx, bracket_size) = Self::size_to_index_and_bracket_size(size);
        (**self.size_bracket_locks.get_unchecked(idx)).lock();
        let slot_addr = self.alloc_from_current_run_unlocked(idx);
        (**self.size_bracket_locks.get_unchecked(idx)).unlock();
        if !slot_addr.is_null() {
            *bytes_allocated = bracket_size;
            *usable_size = bracket_size;
            *bytes_tl_bulk_allocated = bracket_size;
        }
        slot_addr
    }

    /// Allocates `size` bytes. On failure returns null with all out-params
    /// zero; exhausted runs refill transparently, so null means the capacity
    /// is spent.
    ///
    /// # Safety
    /// - `tls_runs` must be filled with [`dedicated_full_run`] or with runs
    ///   this heap populated through earlier calls, and must belong to the
    ///   calling thread.
    /// - With `THREAD_SAFE == false` the caller guarantees no other thread
    ///   uses the heap concurrently.
    #[inline(always)]
    pub unsafe fn alloc<const THREAD_SAFE: bool>(
        &mut self,
        tls_runs: &mut [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
        size: usize,
        bytes_allocated: &mut usize,
        usable_size: &mut usize,
        bytes_tl_bulk_allocated: &mut usize,
    ) -> *mut u8 {
        *bytes_allocated = 0;
        *usable_size = 0;
        *bytes_tl_bulk_allocated = 0;
        if size > LARGE_SIZE_THRESHOLD {
            return self.alloc_large_object(
                size,
                bytes_allocated,
                usable_size,
                bytes_tl_bulk_allocated,
            );
        }
        let m = if THREAD_SAFE {
            self.alloc_from_run(
                tls_runs,
                size,
                bytes_allocated,
                usable_size,
                bytes_tl_bulk_allocated,
            )
        } else {
            self.alloc_from_run_thread_unsafe(
                size,
                bytes_allocated,
                usable_size,
                bytes_tl_bulk_allocated,
            )
        };
        if cfg!(debug_assertions) && !m.is_null() {
            let mut i = 0;
            while i < *usable_size {
                debug_assert_eq!(m.add(i).read(), 0, "allocation at {:p} is not zeroed", m);
                i += 1;
            }
        }
        m
    }

    /// Frees a slot of a shared run (or leaves a mark on a thread-local run
    /// owned by some other thread) under the bracket lock, handling the
    /// full -> non-full and non-full -> empty pool transitions.
    unsafe fn free_from_run(&mut self, ptr: *mut u8, run: *mut Run) -> usize {
        debug_assert!(run != dedicated_full_run());
        let idx = (*run).size_bracket_idx as usize;
        let bracket_size = *BRACKET_SIZES.get_unchecked(idx);
        (*self.size_bracket_locks[idx]).lock();
        if (*run).is_thread_local != 0 {
            // Some other thread owns this run; record the free for the owner
            // to drain on its next refill or revoke.
            (*run).mark_thread_local_free_bit_map(ptr);
            (*self.size_bracket_locks[idx]).unlock();
            return bracket_size;
        }
        (*run).free_slot(ptr);
        let non_full_runs = self.non_full_runs[idx];
        if (*run).is_all_free() {
            (*non_full_runs).remove(&run);
            if cfg!(debug_assertions) {
                (*self.full_runs[idx]).remove(&run);
            }
            if run == self.current_runs[idx] {
                self.current_runs[idx] = dedicated_full_run();
            }
            (*run).zero_header();
            self.lock.lock();
            self.free_pages(run.cast(), true);
            self.lock.unlock();
        } else if run != self.current_runs[idx] {
            // Not completely free. If it was full (hence in no set), make it
            // visible to refills again.
            if !(*non_full_runs).contains(&run) {
                if cfg!(debug_assertions) {
                    (*self.full_runs[idx]).remove(&run);
                }
                (*non_full_runs).insert(run);
                debug_assert!(!(*run).is_full());
            }
        }
        (*self.size_bracket_locks[idx]).unlock();
        bracket_size
    }

    unsafe fn free_internal(
        &mut self,
        tls_runs: &[*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
        ptr: *mut u8,
    ) -> usize {
        let mut pm_idx = self.round_down_to_page_map_index(ptr);
        let run;
        {
            self.lock.lock();
            match self.page_map.add(pm_idx).cast::<PageMapKind>().read() {
                PageMapKind::LargeObject => {
                    let bytes = self.free_pages(ptr, false);
                    self.lock.unlock();
                    return bytes;
                }
                PageMapKind::LargeObjectPart => {
                    unreachable!("freeing a large object part at {:p}", ptr);
                }
                PageMapKind::RunPart => {
                    // Find the beginning of the run.
                    while {
                        pm_idx -= 1;
                        self.page_map.add(pm_idx).cast::<PageMapKind>().read() != PageMapKind::Run
                    } {}
                    run = self.base.add(pm_idx * PAGE_SIZE).cast::<Run>();
                }
                PageMapKind::Run => {
                    run = self.base.add(pm_idx * PAGE_SIZE).cast::<Run>();
                }
                _ => unreachable!("freeing unallocated memory at {:p}", ptr),
            }
            self.lock.unlock();
        }
        let idx = (*run).size_bracket_idx as usize;
        if idx < NUM_THREAD_LOCAL_SIZE_BRACKETS && tls_runs[idx] == run {
            // Freeing into the caller's own cached run only touches the alloc
            // bit map, which the owner mutates without a lock.
            debug_assert_eq!((*run).is_thread_local, 1);
            (*run).free_slot(ptr);
            return *BRACKET_SIZES.get_unchecked(idx);
        }
        self.free_from_run(ptr, run)
    }

    /// Deallocates the memory referenced by `ptr`. `tls_runs` is the calling
    /// thread's cache handle (it may be all [`dedicated_full_run`] for a
    /// cacheless thread). Returns the freed byte count.
    ///
    /// # Safety
    /// `ptr` must have been returned by this heap and not freed since.
    ///
    /// # Panics
    /// Panics if `ptr` points at unallocated pages of the managed region.
    pub unsafe fn free(
        &mut self,
        tls_runs: &[*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
        ptr: *mut u8,
    ) -> usize {
        self.bulk_free_lock.lock_shared();
        let bytes = self.free_internal(tls_runs, ptr);
        self.bulk_free_lock.unlock_shared();
        bytes
    }

    /// Frees many pointers with one bracket-lock acquisition per affected
    /// run: marks every slot in the runs' scratch bit maps first, then drains
    /// run by run. Observationally equivalent to freeing them one by one.
    pub unsafe fn bulk_free(&mut self, pointers: &[*mut u8]) -> usize {
        let mut freed_bytes = 0;
        self.bulk_free_lock.lock_exclusive();
        let mut runs: IndexSet<*mut Run, BuildNoopHasher> =
            IndexSet::with_hasher(BuildNoopHasher::default());
        for ptr in pointers.iter().copied() {
            let pm_idx = self.round_down_to_page_map_index(ptr);
            self.lock.lock();
            let page_map_entry = self.page_map.add(pm_idx).cast::<PageMapKind>().read();
            let run: *mut Run = match page_map_entry {
                PageMapKind::Run => self.base.add(pm_idx * PAGE_SIZE).cast(),
                PageMapKind::RunPart => {
                    let mut pi = pm_idx;
                    // Find the beginning of the run.
                    while {
                        pi -= 1;
                        self.page_map.add(pi).cast::<PageMapKind>().read() != PageMapKind::Run
                    } {}
                    self.base.add(pi * PAGE_SIZE).cast()
                }
                PageMapKind::LargeObject => {
                    freed_bytes += self.free_pages(ptr, false);
                    self.lock.unlock();
                    continue;
                }
                _ => unreachable!("unexpected page map entry {:?} at {:p}", page_map_entry, ptr),
            };
            self.lock.unlock();
            freed_bytes += (*run).mark_bulk_free_bit_map(ptr);
            if (*run).to_be_bulk_freed == 0 {
                (*run).to_be_bulk_freed = 1;
                runs.insert(run);
            }
        }

        // Drain each affected run with one bracket-lock acquisition.
        for run in runs {
            let idx = (*run).size_bracket_idx as usize;
            (**self.size_bracket_locks.get_unchecked(idx)).lock();
            (*run).to_be_bulk_freed = 0;
            if (*run).is_thread_local != 0 {
                // The owner drains the combined marks on its next touch.
                (*run).union_bulk_free_bit_map_to_thread_local_free_bit_map();
            } else {
                let run_was_full = (*run).is_full();
                (*run).merge_bulk_free_bit_map_into_alloc_bit_map();
                let non_full_runs = self.non_full_runs[idx];
                if (*run).is_all_free() {
                    let run_was_current = run == *self.current_runs.get_unchecked(idx);
                    if run_was_full {
                        if cfg!(debug_assertions) {
                            debug_assert!((*self.full_runs[idx]).remove(&run));
                        }
                    } else {
                        (*non_full_runs).remove(&run);
                    }
                    if !run_was_current {
                        (*run).zero_header();
                        self.lock.lock();
                        self.free_pages(run.cast(), true);
                        self.lock.unlock();
                    }
                } else if run == *self.current_runs.get_unchecked(idx) {
                    debug_assert!(!(*non_full_runs).contains(&run));
                } else if run_was_full {
                    if cfg!(debug_assertions) {
                        debug_assert!((*self.full_runs[idx]).remove(&run));
                    }
                    (*non_full_runs).insert(run);
                } else {
                    debug_assert!((*non_full_runs).contains(&run));
                }
            }
            (**self.size_bracket_locks.get_unchecked(idx)).unlock();
        }
        self.bulk_free_lock.unlock_exclusive();
        freed_bytes
    }

    /// Reclassifies a run detached from a thread cache or from the current
    /// runs. Called with the bracket lock held.
    unsafe fn revoke_run(&mut self, idx: usize, run: *mut Run) {
        debug_assert!(run != dedicated_full_run());
        debug_assert_eq!((*run).is_thread_local, 0);
        if (*run).is_full() {
            if cfg!(debug_assertions) {
                (*self.full_runs[idx]).insert(run);
            }
        } else if (*run).is_all_free() {
            (*run).zero_header();
            self.lock.lock();
            self.free_pages(run.cast(), true);
            self.lock.unlock();
        } else {
            (*self.non_full_runs[idx]).insert(run);
        }
    }

    /// Retires the shared current runs of the small brackets, so a quiescent
    /// heap holds no half-used current run for them.
    pub unsafe fn revoke_thread_unsafe_current_runs(&mut self) {
        for idx in 0..NUM_THREAD_LOCAL_SIZE_BRACKETS {
            (*self.size_bracket_locks[idx]).lock();
            if self.current_runs[idx] != dedicated_full_run() {
                let current_run = self.current_runs[idx];
                self.current_runs[idx] = dedicated_full_run();
                self.revoke_run(idx, current_run);
            }
            (*self.size_bracket_locks[idx]).unlock();
        }
    }

    /// Detaches every cached run of one thread, drains both scratch bit maps
    /// (a bulk free may have raced and left marks behind), and reclassifies
    /// the runs into the shared pools. The thread must be quiescent. Returns
    /// the number of free bytes in the revoked runs.
    pub unsafe fn revoke_thread_local_runs(
        &mut self,
        tls_runs: &mut [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
    ) -> usize {
        self.bulk_free_lock.lock_shared();
        let mut free_bytes = 0;
        for idx in 0..NUM_THREAD_LOCAL_SIZE_BRACKETS {
            (*self.size_bracket_locks[idx]).lock();
            let thread_local_run = tls_runs[idx];
            if thread_local_run != dedicated_full_run() {
                tls_runs[idx] = dedicated_full_run();
                let num_free_slots = (*thread_local_run).number_of_free_slots();
                free_bytes += num_free_slots * BRACKET_SIZES[idx];
                let mut dont_care = false;
                (*thread_local_run)
                    .merge_thread_local_free_bit_map_to_alloc_bit_map(&mut dont_care);
                (*thread_local_run).is_thread_local = 0;
                (*thread_local_run).merge_bulk_free_bit_map_into_alloc_bit_map();
                debug_assert!((*thread_local_run).is_bulk_free_bit_map_clean());
                debug_assert!((*thread_local_run).is_thread_local_free_bit_map_clean());
                self.revoke_run(idx, thread_local_run);
            }
            (*self.size_bracket_locks[idx]).unlock();
        }
        self.bulk_free_lock.unlock_shared();
        free_bytes
    }

    /// Revokes the caches of every thread, then the shared current runs.
    pub unsafe fn revoke_all_thread_local_runs<'a>(
        &mut self,
        all_tls_runs: impl Iterator<Item = &'a mut [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS]>,
    ) -> usize {
        let mut free_bytes = 0;
        for tls_runs in all_tls_runs {
            free_bytes += self.revoke_thread_local_runs(tls_runs);
        }
        self.revoke_thread_unsafe_current_runs();
        free_bytes
    }

    /// Walks the page map and applies `handler(start, end, used_bytes)` to
    /// every slot of every run, once per large object, and once per free page
    /// run (with `used_bytes == 0`). The handler must not call back into the
    /// heap; the page lock is held for the duration of the walk.
    pub unsafe fn inspect_all<F: FnMut(*mut u8, *mut u8, usize)>(&self, handler: &mut F) {
        self.lock.lock();
        let mut i = 0;
        while i < self.page_map_size {
            match self.page_map.add(i).cast::<PageMapKind>().read() {
                PageMapKind::Released | PageMapKind::Empty => {
                    let fpr = self.base.add(i * PAGE_SIZE).cast::<FreePageRun>();
                    debug_assert!(self.free_page_runs.contains(&fpr));
                    let fpr_size = (*fpr).byte_size(self);
                    debug_assert_eq!(fpr_size % PAGE_SIZE, 0);
                    let start = fpr.cast::<u8>();
                    handler(start, start.add(fpr_size), 0);
                    i += fpr_size / PAGE_SIZE;
                }
                PageMapKind::LargeObject => {
                    let mut num_pages = 1;
                    let mut idx = i + 1;
                    while idx < self.page_map_size
                        && self.page_map.add(idx).cast::<PageMapKind>().read()
                            == PageMapKind::LargeObjectPart
                    {
                        num_pages += 1;
                        idx += 1;
                    }
                    let start = self.base.add(i * PAGE_SIZE);
                    let bytes = num_pages * PAGE_SIZE;
                    handler(start, start.add(bytes), bytes);
                    i += num_pages;
                }
                PageMapKind::LargeObjectPart => {
                    unreachable!("large object part with no preceding start at page {}", i)
                }
                PageMapKind::Run => {
                    let run = self.base.add(i * PAGE_SIZE).cast::<Run>();
                    debug_assert_eq!((*run).magic_num, MAGIC_NUM);
                    (*run).inspect_all_slots(handler);
                    i += NUM_OF_PAGES[(*run).size_bracket_idx as usize];
                }
                PageMapKind::RunPart => {
                    unreachable!("run part with no preceding run start at page {}", i)
                }
            }
        }
        self.lock.unlock();
    }

    /// One character per page of the managed region, for debugging.
    pub fn dump_page_map(&self) -> String {
        let mut out = String::with_capacity(self.page_map_size);
        self.lock.lock();
        unsafe {
            for i in 0..self.page_map_size {
                out.push(match self.page_map.add(i).cast::<PageMapKind>().read() {
                    PageMapKind::Released => 'r',
                    PageMapKind::Empty => 'e',
                    PageMapKind::Run => 'R',
                    PageMapKind::RunPart => 'p',
                    PageMapKind::LargeObject => 'L',
                    PageMapKind::LargeObjectPart => 'l',
                });
            }
            self.lock.unlock();
        }
        out
    }

    #[inline]
    fn is_free_page(&self, idx: usize) -> bool {
        unsafe {
            let pm_type = self.page_map.add(idx).read();
            pm_type == PageMapKind::Released as u8 || pm_type == PageMapKind::Empty as u8
        }
    }

    /// Marks the range as physically released: the kernel may reclaim the
    /// backing, and refaults read zero. In debug builds the first page is
    /// kept resident for the free-page-run magic byte.
    pub(crate) unsafe fn release_page_range(&mut self, mut start: *mut u8, end: *mut u8) -> usize {
        if cfg!(debug_assertions) {
            start = start.add(PAGE_SIZE);
            if start >= end {
                return 0;
            }
        }
        mmap::dont_need(start, end as usize - start as usize);
        let mut pm_idx = self.to_page_map_index(start);
        let mut reclaimed_bytes = 0;
        let max_idx = pm_idx + (end as usize - start as usize) / PAGE_SIZE;
        while pm_idx < max_idx {
            debug_assert!(self.is_free_page(pm_idx));
            if self.page_map.add(pm_idx).read() == PageMapKind::Empty as u8 {
                reclaimed_bytes += PAGE_SIZE;
                self.page_map.add(pm_idx).write(PageMapKind::Released as u8);
            }
            pm_idx += 1;
        }
        reclaimed_bytes
    }

    #[inline]
    pub const fn index_to_bracket_size(idx: usize) -> usize {
        BRACKET_SIZES[idx]
    }

    #[inline]
    pub const fn bracket_size_to_index(size: usize) -> usize {
        if size == 1 * KB {
            NUM_OF_SIZE_BRACKETS - 2
        } else if size == 2 * KB {
            NUM_OF_SIZE_BRACKETS - 1
        } else {
            size / BRACKET_QUANTUM_SIZE - 1
        }
    }

    #[inline]
    pub const fn is_size_for_thread_local(size: usize) -> bool {
        size <= MAX_THREAD_LOCAL_BRACKET_SIZE
    }

    /// Rounds a small/medium request up to its bracket size.
    #[inline]
    pub const fn round_to_bracket_size(size: usize) -> usize {
        debug_assert!(size > 0 && size <= LARGE_SIZE_THRESHOLD);
        if size <= MAX_QUANTUM_BRACKET_SIZE {
            round_up(size as u64, BRACKET_QUANTUM_SIZE as u64) as usize
        } else if size <= 1 * KB {
            1 * KB
        } else {
            2 * KB
        }
    }

    #[inline]
    pub const fn size_to_index(size: usize) -> usize {
        debug_assert!(size > 0 && size <= LARGE_SIZE_THRESHOLD);
        if size <= MAX_QUANTUM_BRACKET_SIZE {
            round_up(size as u64, BRACKET_QUANTUM_SIZE as u64) as usize / BRACKET_QUANTUM_SIZE - 1
        } else if size <= 1 * KB {
            NUM_OF_SIZE_BRACKETS - 2
        } else {
            NUM_OF_SIZE_BRACKETS - 1
        }
    }

    #[inline]
    pub const fn size_to_index_and_bracket_size(size: usize) -> (usize, usize) {
        (Self::size_to_index(size), Self::round_to_bracket_size(size))
    }

    /// Bytes a request of `size` would actually occupy: the bracket size for
    /// small/medium requests, the page-rounded size for large ones.
    #[inline]
    pub const fn usable_size_for(size: usize) -> usize {
        if size > LARGE_SIZE_THRESHOLD {
            round_up(size as u64, PAGE_SIZE as u64) as usize
        } else {
            Self::round_to_bracket_size(size)
        }
    }

    #[inline]
    pub fn to_page_map_index(&self, addr: *const u8) -> usize {
        let byte_offset = addr as usize - self.base as usize;
        debug_assert_eq!(byte_offset % PAGE_SIZE, 0);
        byte_offset / PAGE_SIZE
    }

    #[inline]
    pub fn round_down_to_page_map_index(&self, addr: *const u8) -> usize {
        debug_assert!(addr as usize >= self.base as usize);
        debug_assert!((addr as usize) < self.base as usize + self.capacity);
        (addr as usize - self.base as usize) / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHeap {
        heap: *mut RosHeap,
        _map: Mmap,
    }

    unsafe impl Send for TestHeap {}
    unsafe impl Sync for TestHeap {}

    impl TestHeap {
        fn new(capacity: usize, mode: PageReleaseMode, threshold: usize) -> Self {
            let map = Mmap::new(capacity);
            let heap = RosHeap::new(map.start(), capacity, capacity, mode, threshold);
            Self { heap, _map: map }
        }

        fn with_mode(mode: PageReleaseMode) -> Self {
            Self::new(16 * MB, mode, DEFAULT_PAGE_RELEASE_THRESHOLD)
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            unsafe {
                drop(Box::from_raw(self.heap));
            }
        }
    }

    fn fresh_tls() -> [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS] {
        [dedicated_full_run(); NUM_THREAD_LOCAL_SIZE_BRACKETS]
    }

    unsafe fn alloc(
        heap: *mut RosHeap,
        tls: &mut [*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS],
        size: usize,
    ) -> (*mut u8, usize) {
        let mut bytes_allocated = 0;
        let mut usable_size = 0;
        let mut bytes_tl_bulk_allocated = 0;
        let ptr = (*heap).alloc::<true>(
            tls,
            size,
            &mut bytes_allocated,
            &mut usable_size,
            &mut bytes_tl_bulk_allocated,
        );
        assert_eq!(bytes_allocated, usable_size);
        (ptr, bytes_allocated)
    }

    unsafe fn used_bytes(heap: *mut RosHeap) -> usize {
        let mut used = 0;
        (*heap).inspect_all(&mut |_start, _end, used_bytes| used += used_bytes);
        used
    }

    #[test]
    fn small_allocations_stay_in_one_bracket() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let mut ptrs = Vec::new();
            let mut run_pages = std::collections::HashSet::new();
            for _ in 0..1000 {
                let (p, allocated) = alloc(t.heap, &mut tls, 24);
                assert!(!p.is_null());
                assert_eq!(allocated, 32);
                assert_eq!((*t.heap).usable_size(p), 32);
                assert_eq!(p as usize % 16, 0);
                run_pages.insert((*t.heap).round_down_to_page_map_index(p));
                ptrs.push(p);
            }
            let max_runs = (1000 + NUM_OF_SLOTS[1] - 1) / NUM_OF_SLOTS[1];
            assert!(run_pages.len() <= max_runs);

            for p in ptrs {
                (*t.heap).free(&tls, p);
            }
            (*t.heap).revoke_thread_local_runs(&mut tls);

            assert!((*(*t.heap).non_full_runs[1]).is_empty());
            assert!((*(*t.heap).full_runs[1]).is_empty());
            assert_eq!((*t.heap).free_page_runs.len(), 1);
            let fpr = *(*t.heap).free_page_runs.first().unwrap();
            assert_eq!((*fpr).byte_size(&*t.heap), (*t.heap).footprint());
            assert_eq!(used_bytes(t.heap), 0);
        }
    }

    #[test]
    fn large_allocation_is_page_granular() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let (p, allocated) = alloc(t.heap, &mut tls, 10000);
            assert!(!p.is_null());
            let expected_pages = (10000 + PAGE_SIZE - 1) / PAGE_SIZE;
            assert_eq!(allocated, expected_pages * PAGE_SIZE);
            assert_eq!((*t.heap).usable_size(p), expected_pages * PAGE_SIZE);
            assert_eq!(p as usize % PAGE_SIZE, 0);

            let pm_idx = (*t.heap).to_page_map_index(p);
            assert_eq!(
                (*t.heap).page_map.add(pm_idx).read(),
                PageMapKind::LargeObject as u8
            );
            for i in 1..expected_pages {
                assert_eq!(
                    (*t.heap).page_map.add(pm_idx + i).read(),
                    PageMapKind::LargeObjectPart as u8
                );
            }

            (*t.heap).free(&tls, p);
            assert_eq!((*t.heap).free_page_runs.len(), 1);
            assert_eq!(used_bytes(t.heap), 0);
        }
    }

    #[test]
    fn bulk_free_marks_survive_until_revoke() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let ptrs: Vec<*mut u8> = (0..5).map(|_| alloc(t.heap, &mut tls, 16).0).collect();
            let run = tls[0];
            assert!(run != dedicated_full_run());
            assert_eq!((*run).is_thread_local, 1);

            (*t.heap).bulk_free(&[ptrs[0], ptrs[2], ptrs[4]]);
            // The marks sit in the thread-local free bit map; the alloc bit
            // map still shows all five slots live.
            assert!(!(*run).is_thread_local_free_bit_map_clean());
            assert_eq!((*run).number_of_free_slots(), NUM_OF_SLOTS[0] - 5);

            (*t.heap).revoke_thread_local_runs(&mut tls);
            assert_eq!(tls[0], dedicated_full_run());
            assert_eq!((*run).is_thread_local, 0);
            assert_eq!((*run).number_of_free_slots(), NUM_OF_SLOTS[0] - 2);
            assert!((*run).is_thread_local_free_bit_map_clean());
            assert!((*run).is_bulk_free_bit_map_clean());
            assert!((*(*t.heap).non_full_runs[0]).contains(&run));
        }
    }

    #[test]
    fn freed_slot_is_reused_before_the_bump_cursor_moves() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let ptrs: Vec<*mut u8> = (0..4).map(|_| alloc(t.heap, &mut tls, 16).0).collect();
            for w in ptrs.windows(2) {
                assert_eq!(w[1] as usize, w[0] as usize + 16);
            }
            (*t.heap).free(&tls, ptrs[1]);
            let (reused, _) = alloc(t.heap, &mut tls, 16);
            assert_eq!(reused, ptrs[1]);
            let (next, _) = alloc(t.heap, &mut tls, 16);
            assert_eq!(next as usize, ptrs[3] as usize + 16);
        }
    }

    #[test]
    fn freed_ranges_coalesce_and_trim_shrinks_the_footprint() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let region = 8 * PAGE_SIZE;
            let ptrs: Vec<*mut u8> = (0..5).map(|_| alloc(t.heap, &mut tls, region).0).collect();
            for w in ptrs.windows(2) {
                assert_eq!(w[1] as usize, w[0] as usize + region);
            }

            // Free every other region, then the gaps.
            (*t.heap).free(&tls, ptrs[0]);
            (*t.heap).free(&tls, ptrs[2]);
            (*t.heap).free(&tls, ptrs[4]);
            (*t.heap).free(&tls, ptrs[1]);
            (*t.heap).free(&tls, ptrs[3]);

            assert_eq!((*t.heap).free_page_runs.len(), 1);
            let fpr = *(*t.heap).free_page_runs.first().unwrap();
            assert_eq!((*fpr).byte_size(&*t.heap), (*t.heap).footprint());

            assert!((*t.heap).trim());
            assert_eq!((*t.heap).footprint(), 0);
            assert!((*t.heap).free_page_runs.is_empty());

            // The footprint grows again on demand.
            let (p, _) = alloc(t.heap, &mut tls, PAGE_SIZE);
            assert!(!p.is_null());
            assert!((*t.heap).footprint() >= PAGE_SIZE);
            (*t.heap).free(&tls, p);
        }
    }

    #[test]
    fn size_release_policy_honors_the_threshold() {
        let capacity = 8 * MB + PAGE_SIZE;
        let t = TestHeap::new(capacity, PageReleaseMode::Size, 4 * MB);
        let mut tls = fresh_tls();
        unsafe {
            let (small, _) = alloc(t.heap, &mut tls, 3 * MB);
            let (_guard, _) = alloc(t.heap, &mut tls, PAGE_SIZE);
            let (big, _) = alloc(t.heap, &mut tls, 5 * MB);
            assert!(!small.is_null() && !big.is_null());

            // A 3 MiB free run stays resident.
            (*t.heap).free(&tls, small);
            let small_idx = (*t.heap).to_page_map_index(small);
            assert_eq!(
                (*t.heap).page_map.add(small_idx + 1).read(),
                PageMapKind::Empty as u8
            );

            // A 5 MiB free run is released.
            (*t.heap).free(&tls, big);
            let big_idx = (*t.heap).to_page_map_index(big);
            assert_eq!(
                (*t.heap).page_map.add(big_idx + 1).read(),
                PageMapKind::Released as u8
            );
        }
    }

    #[test]
    fn bulk_free_is_equivalent_to_individual_frees() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let sizes = [16, 24, 176, 512, 2048];
            let mut ptrs = Vec::new();
            for i in 0..40 {
                let (p, _) = alloc(t.heap, &mut tls, sizes[i % sizes.len()]);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            (*t.heap).bulk_free(&ptrs);
            (*t.heap).revoke_thread_local_runs(&mut tls);
            (*t.heap).revoke_thread_unsafe_current_runs();

            assert_eq!(used_bytes(t.heap), 0);
            for idx in [0, 1, 10] {
                assert!((*(*t.heap).non_full_runs[idx]).is_empty());
            }
        }
    }

    #[test]
    fn shared_brackets_allocate_under_the_bracket_lock() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            // Bracket above the thread-local range.
            let (p, allocated) = alloc(t.heap, &mut tls, 300);
            assert_eq!(allocated, 304);
            assert_eq!((*t.heap).usable_size(p), 304);
            // The cache is untouched by the shared path.
            assert!(tls.iter().all(|&r| r == dedicated_full_run()));
            (*t.heap).free(&tls, p);
            assert_eq!(used_bytes(t.heap), 0);
        }
    }

    #[test]
    fn thread_unsafe_allocation_uses_the_current_runs() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let mut bytes_allocated = 0;
            let mut usable_size = 0;
            let mut bytes_tl_bulk_allocated = 0;
            let p = (*t.heap).alloc::<false>(
                &mut tls,
                40,
                &mut bytes_allocated,
                &mut usable_size,
                &mut bytes_tl_bulk_allocated,
            );
            assert!(!p.is_null());
            assert_eq!(bytes_allocated, 48);
            assert!(tls.iter().all(|&r| r == dedicated_full_run()));
            (*t.heap).free(&tls, p);
        }
    }

    #[test]
    fn block_start_finds_the_allocation_base() {
        let t = TestHeap::with_mode(PageReleaseMode::None);
        let mut tls = fresh_tls();
        unsafe {
            let (p, _) = alloc(t.heap, &mut tls, 64);
            assert_eq!((*t.heap).block_start(p.add(17)), p);
            let (large, _) = alloc(t.heap, &mut tls, 3 * PAGE_SIZE + 100);
            assert_eq!((*t.heap).block_start(large.add(2 * PAGE_SIZE + 5)), large);
            (*t.heap).free(&tls, p);
            (*t.heap).free(&tls, large);
        }
    }

    #[test]
    fn usable_size_for_requests() {
        assert_eq!(RosHeap::usable_size_for(1), 16);
        assert_eq!(RosHeap::usable_size_for(16), 16);
        assert_eq!(RosHeap::usable_size_for(17), 32);
        assert_eq!(RosHeap::usable_size_for(512), 512);
        assert_eq!(RosHeap::usable_size_for(513), 1024);
        assert_eq!(RosHeap::usable_size_for(1025), 2048);
        assert_eq!(
            RosHeap::usable_size_for(10000),
            round_up(10000, PAGE_SIZE as u64) as usize
        );
    }

    #[test]
    fn size_bracket_mapping_round_trips() {
        for idx in 0..NUM_OF_SIZE_BRACKETS {
            let size = RosHeap::index_to_bracket_size(idx);
            assert_eq!(RosHeap::bracket_size_to_index(size), idx);
            assert_eq!(RosHeap::size_to_index(size), idx);
            assert_eq!(RosHeap::round_to_bracket_size(size), size);
        }
        assert!(RosHeap::is_size_for_thread_local(176));
        assert!(!RosHeap::is_size_for_thread_local(177));
    }

    #[test]
    fn out_of_memory_returns_null_with_zeroed_sizes() {
        let t = TestHeap::new(4 * PAGE_SIZE, PageReleaseMode::None, DEFAULT_PAGE_RELEASE_THRESHOLD);
        let mut tls = fresh_tls();
        unsafe {
            let mut bytes_allocated = 1;
            let mut usable_size = 1;
            let mut bytes_tl_bulk_allocated = 1;
            let p = (*t.heap).alloc::<true>(
                &mut tls,
                8 * PAGE_SIZE,
                &mut bytes_allocated,
                &mut usable_size,
                &mut bytes_tl_bulk_allocated,
            );
            assert!(p.is_null());
            assert_eq!(bytes_allocated, 0);
            assert_eq!(usable_size, 0);
            assert_eq!(bytes_tl_bulk_allocated, 0);
        }
    }

    #[test]
    fn page_map_dump_reflects_the_layout() {
        let t = TestHeap::new(8 * PAGE_SIZE, PageReleaseMode::None, DEFAULT_PAGE_RELEASE_THRESHOLD);
        let mut tls = fresh_tls();
        unsafe {
            let (p, _) = alloc(t.heap, &mut tls, 3 * PAGE_SIZE);
            let dump = (*t.heap).dump_page_map();
            assert!(dump.starts_with("Lll"));
            (*t.heap).free(&tls, p);
        }
    }

    #[test]
    fn concurrent_allocation_and_free_settle_to_empty() {
        let t = TestHeap::new(64 * MB, PageReleaseMode::None, DEFAULT_PAGE_RELEASE_THRESHOLD);
        std::thread::scope(|s| {
            for worker in 0..4 {
                let t = &t;
                s.spawn(move || unsafe {
                    let mut tls = fresh_tls();
                    let mut live = Vec::new();
                    let sizes = [16, 24, 96, 176, 512, 2048, 4096];
                    for i in 0..2000 {
                        let size = sizes[(i + worker) % sizes.len()];
                        let (p, allocated) = alloc(t.heap, &mut tls, size);
                        assert!(!p.is_null());
                        assert!(allocated >= size);
                        live.push(p);
                        if i % 3 == 0 {
                            let victim = live.swap_remove(live.len() / 2);
                            (*t.heap).free(&tls, victim);
                        }
                    }
                    for p in live {
                        (*t.heap).free(&tls, p);
                    }
                    (*t.heap).revoke_thread_local_runs(&mut tls);
                });
            }
        });
        unsafe {
            (*t.heap).revoke_thread_unsafe_current_runs();
            assert_eq!(used_bytes(t.heap), 0);
        }
    }
}
