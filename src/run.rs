use core::mem::size_of;
use core::ptr::null_mut;

use crate::defs::*;
use crate::RosHeap;

/// Header of a run of free pages. Only the magic byte lives in the pages
/// themselves; the byte size is kept in the allocator's side table so the
/// backing pages can be handed back to the kernel while the run is free.
#[repr(C)]
pub struct FreePageRun {
    pub magic_num: u8,
}

impl FreePageRun {
    pub fn is_free(&self) -> bool {
        !cfg!(debug_assertions) || self.magic_num == MAGIC_NUM_FREE
    }

    pub fn begin(&self) -> *mut u8 {
        self as *const Self as *mut u8
    }

    #[inline]
    pub unsafe fn byte_size(&self, heap: &RosHeap) -> usize {
        let fpr_base = self as *const Self as *mut u8;
        let pm_idx = heap.to_page_map_index(fpr_base);
        let byte_size = *heap.free_page_run_size_map.get_unchecked(pm_idx);
        debug_assert_eq!(byte_size % PAGE_SIZE, 0);
        byte_size
    }

    pub unsafe fn set_byte_size(&self, heap: &mut RosHeap, byte_size: usize) {
        debug_assert_eq!(byte_size % PAGE_SIZE, 0);
        let fpr_base = self as *const Self as *mut u8;
        let pm_idx = heap.to_page_map_index(fpr_base);
        heap.free_page_run_size_map[pm_idx] = byte_size;
    }

    pub unsafe fn end(&self, heap: &RosHeap) -> *mut u8 {
        let fpr_base = self as *const Self as *mut u8;
        fpr_base.add(self.byte_size(heap))
    }

    pub unsafe fn is_larger_than_page_release_threshold(&self, heap: &RosHeap) -> bool {
        self.byte_size(heap) >= heap.page_release_size_threshold
    }

    pub unsafe fn is_at_end_of_space(&self, heap: &RosHeap) -> bool {
        self as *const Self as usize + self.byte_size(heap) == heap.base as usize + heap.footprint
    }

    pub unsafe fn should_release_pages(&self, heap: &RosHeap) -> bool {
        match heap.page_release_mode {
            PageReleaseMode::None => false,
            PageReleaseMode::End => self.is_at_end_of_space(heap),
            PageReleaseMode::Size => self.is_larger_than_page_release_threshold(heap),
            PageReleaseMode::SizeAndEnd => {
                self.is_larger_than_page_release_threshold(heap) && self.is_at_end_of_space(heap)
            }
            PageReleaseMode::All => true,
        }
    }

    pub unsafe fn release_pages(&self, heap: &mut RosHeap) {
        let start = self as *const Self as *mut u8;
        let byte_size = self.byte_size(heap);
        if self.should_release_pages(heap) {
            heap.release_page_range(start, (start as usize + byte_size) as _);
        }
    }
}

// Represents a run of memory slots of the same size.
//
// A run's memory layout:
//
// +-------------------+
// | magic_num         |
// +-------------------+
// | size_bracket_idx  |
// +-------------------+
// | is_thread_local   |
// +-------------------+
// | to_be_bulk_freed  |
// +-------------------+
// | top_slot_idx      |
// +-------------------+
// |                   |
// | alloc bit map     |
// |                   |
// +-------------------+
// |                   |
// | bulk free bit map |
// |                   |
// +-------------------+
// |                   |
// | thread-local free |
// | bit map           |
// |                   |
// +-------------------+
// | padding due to    |
// | alignment         |
// +-------------------+
// | slot 0            |
// +-------------------+
// | slot 1            |
// +-------------------+
// | slot 2            |
// +-------------------+
// ...
// +-------------------+
// | last slot         |
// +-------------------+
//
// The alloc bit map is authoritative: a set bit is a live slot. The bulk free
// bit map is scratch space the GC fills without the bracket lock; it is later
// drained into the alloc bit map with one lock acquisition per run. The
// thread-local free bit map plays the same role for runs owned by a thread:
// the owner drains it the next time the run looks exhausted, or on revoke.
#[repr(C)]
pub struct Run {
    pub magic_num: u8,
    pub size_bracket_idx: u8,
    pub is_thread_local: u8,
    pub to_be_bulk_freed: u8,
    /// Cursor of the bump index mode. While no slot of the run has ever been
    /// freed, allocation takes `top_slot_idx` and advances it. The first free
    /// clamps the cursor to the slot count and allocation scans the alloc bit
    /// map from then on.
    pub top_slot_idx: u32,
}

const _: () = assert!(size_of::<Run>() == 8);

impl Run {
    /// Byte size of the header part before the bit maps.
    pub const fn fixed_header_size() -> usize {
        size_of::<Self>()
    }

    #[inline]
    fn num_vecs(&self) -> usize {
        (NUM_OF_SLOTS[self.size_bracket_idx as usize] + 31) / 32
    }

    #[inline]
    pub fn alloc_bit_map(&self) -> *mut u32 {
        (self as *const Self as usize + Self::fixed_header_size()) as *mut u32
    }

    #[inline]
    pub fn bulk_free_bit_map(&self) -> *mut u32 {
        (self as *const Self as usize + BULK_FREE_BIT_MAP_OFFSETS[self.size_bracket_idx as usize])
            as *mut u32
    }

    #[inline]
    pub fn thread_local_free_bit_map(&self) -> *mut u32 {
        (self as *const Self as usize
            + THREAD_LOCAL_FREE_BIT_MAP_OFFSETS[self.size_bracket_idx as usize])
            as *mut u32
    }

    #[inline]
    pub fn first_slot(&self) -> *mut u8 {
        (self as *const Self as usize + HEADER_SIZES[self.size_bracket_idx as usize]) as *mut u8
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        (self as *const Self as usize + PAGE_SIZE * NUM_OF_PAGES[self.size_bracket_idx as usize])
            as *mut u8
    }

    #[inline]
    pub unsafe fn slot_address(&self, slot_idx: usize) -> *mut u8 {
        debug_assert!(slot_idx < NUM_OF_SLOTS[self.size_bracket_idx as usize]);
        self.first_slot()
            .add(slot_idx * BRACKET_SIZES[self.size_bracket_idx as usize])
    }

    /// Slot index of `ptr`, which must be the base address of a slot.
    #[inline]
    pub unsafe fn slot_index(&self, ptr: *const u8) -> usize {
        let idx = self.size_bracket_idx as usize;
        let bracket_size = *BRACKET_SIZES.get_unchecked(idx);
        let offset_from_slot_base = ptr as usize - self.first_slot() as usize;
        debug_assert_eq!(offset_from_slot_base % bracket_size, 0);
        let slot_idx = offset_from_slot_base / bracket_size;
        debug_assert!(slot_idx < NUM_OF_SLOTS[idx]);
        slot_idx
    }

    /// Base address of the slot containing `ptr`, which may point anywhere
    /// inside the slot.
    #[inline]
    pub unsafe fn slot_from_ptr(&self, ptr: *const u8) -> *mut u8 {
        let idx = self.size_bracket_idx as usize;
        let bracket_size = *BRACKET_SIZES.get_unchecked(idx);
        let offset_from_slot_base = ptr as usize - self.first_slot() as usize;
        let slot_idx = offset_from_slot_base / bracket_size;
        debug_assert!(slot_idx < NUM_OF_SLOTS[idx]);
        self.first_slot().add(slot_idx * bracket_size)
    }

    /// Claims a slot: bump index mode while it lasts, then lowest clear bit of
    /// the alloc bit map. Returns null when the run has no free slot.
    #[inline]
    pub unsafe fn alloc_slot(&mut self) -> *mut u8 {
        let idx = self.size_bracket_idx as usize;
        let num_slots = NUM_OF_SLOTS[idx];
        debug_assert!(self.top_slot_idx as usize <= num_slots);
        if (self.top_slot_idx as usize) < num_slots {
            let slot_idx = self.top_slot_idx as usize;
            self.top_slot_idx += 1;
            let vec = self.alloc_bit_map().add(slot_idx >> 5);
            let mask = 1u32 << (slot_idx & 31);
            debug_assert_eq!(vec.read() & mask, 0);
            vec.write(vec.read() | mask);
            let slot_addr = self.slot_address(slot_idx);
            #[cfg(feature = "trace")]
            log::info!(
                "RosHeap::Run::alloc_slot() : {:p}, bracket_size={}, slot_idx={}",
                slot_addr,
                BRACKET_SIZES[idx],
                slot_idx
            );
            return slot_addr;
        }
        let num_vecs = self.num_vecs();
        let mut v = 0;
        while v < num_vecs {
            let vecp = self.alloc_bit_map().add(v);
            let free_bits = !vecp.read();
            if free_bits != 0 {
                let bit = free_bits.trailing_zeros() as usize;
                let slot_idx = v * 32 + bit;
                if slot_idx >= num_slots {
                    // Only the padding bits of the last word are clear.
                    break;
                }
                vecp.write(vecp.read() | (1u32 << bit));
                let slot_addr = self.slot_address(slot_idx);
                #[cfg(feature = "trace")]
                log::info!(
                    "RosHeap::Run::alloc_slot() : {:p}, bracket_size={}, slot_idx={}",
                    slot_addr,
                    BRACKET_SIZES[idx],
                    slot_idx
                );
                return slot_addr;
            }
            v += 1;
        }
        null_mut()
    }

    /// Frees a slot: clears its alloc bit and zeroes its memory. Used in a
    /// non-bulk free while the caller holds whatever serializes this run
    /// (bracket lock for shared runs, ownership for thread-local ones).
    #[inline]
    pub unsafe fn free_slot(&mut self, ptr: *mut u8) {
        let idx = self.size_bracket_idx as usize;
        let num_slots = NUM_OF_SLOTS[idx];
        let bracket_size = *BRACKET_SIZES.get_unchecked(idx);
        let slot_idx = self.slot_index(ptr);
        let vec = self.alloc_bit_map().add(slot_idx >> 5);
        let mask = 1u32 << (slot_idx & 31);
        debug_assert_ne!(vec.read() & mask, 0, "double free of {:p}", ptr);
        vec.write(vec.read() & !mask);
        // The first free ends bump index mode for good.
        self.top_slot_idx = num_slots as u32;
        core::ptr::write_bytes(ptr, 0, bracket_size);
    }

    /// The common part of the two scratch-map marking operations. The slot
    /// must still be live in the alloc bit map; its memory is dead and gets
    /// zeroed here so reuse hands out clean slots.
    #[inline]
    unsafe fn mark_free_bit_map_shared(
        &mut self,
        ptr: *mut u8,
        free_bit_map_base: *mut u32,
    ) -> usize {
        let idx = self.size_bracket_idx as usize;
        let bracket_size = *BRACKET_SIZES.get_unchecked(idx);
        let slot_idx = self.slot_index(ptr);
        let vec = free_bit_map_base.add(slot_idx >> 5);
        let mask = 1u32 << (slot_idx & 31);
        debug_assert_eq!(vec.read() & mask, 0, "slot {:p} marked twice", ptr);
        debug_assert_ne!(
            self.alloc_bit_map().add(slot_idx >> 5).read() & mask,
            0,
            "marking a slot that is not allocated: {:p}",
            ptr
        );
        vec.write(vec.read() | mask);
        core::ptr::write_bytes(ptr, 0, bracket_size);
        bracket_size
    }

    /// Marks the slot to free in the bulk free bit map. Called by the GC with
    /// the bulk free lock held exclusively; no bracket lock needed.
    #[inline]
    pub unsafe fn mark_bulk_free_bit_map(&mut self, ptr: *mut u8) -> usize {
        self.mark_free_bit_map_shared(ptr, self.bulk_free_bit_map())
    }

    /// Marks the slot to free in the thread-local free bit map, leaving the
    /// drain to the owning thread.
    #[inline]
    pub unsafe fn mark_thread_local_free_bit_map(&mut self, ptr: *mut u8) -> usize {
        debug_assert_eq!(self.is_thread_local, 1);
        self.mark_free_bit_map_shared(ptr, self.thread_local_free_bit_map())
    }

    /// Frees the slots recorded in the thread-local free bit map. Returns
    /// whether anything was freed and reports through `is_all_free_after_out`
    /// whether the run ended up entirely free. Used when a thread-local run
    /// looks exhausted and on revoke.
    pub unsafe fn merge_thread_local_free_bit_map_to_alloc_bit_map(
        &mut self,
        is_all_free_after_out: &mut bool,
    ) -> bool {
        debug_assert_eq!(self.is_thread_local, 1);
        let num_slots = NUM_OF_SLOTS[self.size_bracket_idx as usize];
        let num_vecs = self.num_vecs();
        let mut changed = false;
        let mut all_free = true;
        let mut v = 0;
        while v < num_vecs {
            let tl_vec = self.thread_local_free_bit_map().add(v);
            let alloc_vec = self.alloc_bit_map().add(v);
            let tl_bits = tl_vec.read();
            if tl_bits != 0 {
                debug_assert_eq!(alloc_vec.read() & tl_bits, tl_bits);
                alloc_vec.write(alloc_vec.read() & !tl_bits);
                tl_vec.write(0);
                changed = true;
            }
            if alloc_vec.read() != 0 {
                all_free = false;
            }
            v += 1;
        }
        if changed {
            self.top_slot_idx = num_slots as u32;
        }
        *is_all_free_after_out = all_free;
        changed
    }

    /// Frees the slots recorded in the bulk free bit map. Used in a bulk free
    /// on shared runs, with the run's bracket lock held.
    pub unsafe fn merge_bulk_free_bit_map_into_alloc_bit_map(&mut self) {
        let num_slots = NUM_OF_SLOTS[self.size_bracket_idx as usize];
        let num_vecs = self.num_vecs();
        let mut freed_any = false;
        let mut v = 0;
        while v < num_vecs {
            let bulk_vec = self.bulk_free_bit_map().add(v);
            let alloc_vec = self.alloc_bit_map().add(v);
            let bulk_bits = bulk_vec.read();
            if bulk_bits != 0 {
                debug_assert_eq!(alloc_vec.read() & bulk_bits, bulk_bits);
                alloc_vec.write(alloc_vec.read() & !bulk_bits);
                bulk_vec.write(0);
                freed_any = true;
            }
            v += 1;
        }
        if freed_any {
            self.top_slot_idx = num_slots as u32;
        }
    }

    /// Moves bulk free marks onto the thread-local free bit map. Used in a
    /// bulk free when the run turns out to be thread-local: the owner drains
    /// the combined marks later, without the GC synchronizing with it.
    pub unsafe fn union_bulk_free_bit_map_to_thread_local_free_bit_map(&mut self) {
        debug_assert_eq!(self.is_thread_local, 1);
        let num_vecs = self.num_vecs();
        let mut v = 0;
        while v < num_vecs {
            let bulk_vec = self.bulk_free_bit_map().add(v);
            let tl_vec = self.thread_local_free_bit_map().add(v);
            let bulk_bits = bulk_vec.read();
            if bulk_bits != 0 {
                debug_assert_eq!(tl_vec.read() & bulk_bits, 0);
                tl_vec.write(tl_vec.read() | bulk_bits);
                bulk_vec.write(0);
            }
            v += 1;
        }
    }

    /// True if no slot of the run is in use. Bits beyond the slot count are
    /// never set, so a plain word scan suffices.
    #[inline]
    pub unsafe fn is_all_free(&self) -> bool {
        let num_vecs = self.num_vecs();
        let mut v = 0;
        while v < num_vecs {
            if self.alloc_bit_map().add(v).read() != 0 {
                return false;
            }
            v += 1;
        }
        true
    }

    /// True if every slot of the run is in use.
    #[inline]
    pub unsafe fn is_full(&self) -> bool {
        let num_slots = NUM_OF_SLOTS[self.size_bracket_idx as usize];
        let num_vecs = self.num_vecs();
        let mut v = 0;
        while v < num_vecs {
            let remain = num_slots - v * 32;
            let mask = if remain >= 32 {
                u32::MAX
            } else {
                (1u32 << remain) - 1
            };
            if self.alloc_bit_map().add(v).read() & mask != mask {
                return false;
            }
            v += 1;
        }
        true
    }

    #[inline]
    pub unsafe fn number_of_free_slots(&self) -> usize {
        let num_slots = NUM_OF_SLOTS[self.size_bracket_idx as usize];
        let num_vecs = self.num_vecs();
        let mut free_slots = 0;
        let mut v = 0;
        while v < num_vecs {
            let remain = num_slots - v * 32;
            let mask = if remain >= 32 {
                u32::MAX
            } else {
                (1u32 << remain) - 1
            };
            free_slots += (!self.alloc_bit_map().add(v).read() & mask).count_ones() as usize;
            v += 1;
        }
        free_slots
    }

    #[inline]
    pub unsafe fn is_bulk_free_bit_map_clean(&self) -> bool {
        let num_vecs = self.num_vecs();
        let mut v = 0;
        while v < num_vecs {
            if self.bulk_free_bit_map().add(v).read() != 0 {
                return false;
            }
            v += 1;
        }
        true
    }

    #[inline]
    pub unsafe fn is_thread_local_free_bit_map_clean(&self) -> bool {
        let num_vecs = self.num_vecs();
        let mut v = 0;
        while v < num_vecs {
            if self.thread_local_free_bit_map().add(v).read() != 0 {
                return false;
            }
            v += 1;
        }
        true
    }

    /// Zeroes all three bit maps. They are laid out back to back, so this is
    /// one contiguous wipe.
    pub unsafe fn clear_bit_maps(&mut self) {
        let idx = self.size_bracket_idx as usize;
        let bit_map_size = self.num_vecs() * size_of::<u32>();
        debug_assert_eq!(
            BULK_FREE_BIT_MAP_OFFSETS[idx],
            Self::fixed_header_size() + bit_map_size
        );
        core::ptr::write_bytes(self.alloc_bit_map().cast::<u8>(), 0, 3 * bit_map_size);
    }

    /// Zeroes the header (including bit maps and padding) before the run's
    /// pages go back to the page allocator. The slots themselves were zeroed
    /// as they were freed; the debug build verifies the whole run reads zero.
    pub unsafe fn zero_header(&mut self) {
        let idx = self.size_bracket_idx as usize;
        core::ptr::write_bytes(self as *mut Self as *mut u8, 0, HEADER_SIZES[idx]);
        if cfg!(debug_assertions) {
            let size = NUM_OF_PAGES[idx] * PAGE_SIZE;
            let word_ptr = self as *mut Self as *mut usize;
            let mut i = 0;
            while i < size / size_of::<usize>() {
                assert_eq!(word_ptr.add(i).read(), 0);
                i += 1;
            }
        }
    }

    /// Applies `handler(start, end, used_bytes)` to every slot in order;
    /// `used_bytes` is zero for free slots.
    pub unsafe fn inspect_all_slots<F: FnMut(*mut u8, *mut u8, usize)>(&self, handler: &mut F) {
        let idx = self.size_bracket_idx as usize;
        let num_slots = NUM_OF_SLOTS[idx];
        let bracket_size = BRACKET_SIZES[idx];
        let mut slot_idx = 0;
        while slot_idx < num_slots {
            let start = self.slot_address(slot_idx);
            let end = start.add(bracket_size);
            let vec = self.alloc_bit_map().add(slot_idx >> 5).read();
            if vec & (1u32 << (slot_idx & 31)) != 0 {
                handler(start, end, bracket_size);
            } else {
                handler(start, end, 0);
            }
            slot_idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;

    fn new_run(idx: usize) -> (Mmap, *mut Run) {
        let map = Mmap::new(NUM_OF_PAGES[idx] * PAGE_SIZE);
        let run = map.start().cast::<Run>();
        unsafe {
            (*run).magic_num = MAGIC_NUM;
            (*run).size_bracket_idx = idx as u8;
            (*run).clear_bit_maps();
            (*run).top_slot_idx = 0;
        }
        (map, run)
    }

    #[test]
    fn bump_mode_hands_out_sequential_slots() {
        let (_map, run) = new_run(0);
        unsafe {
            let first = (*run).alloc_slot();
            assert_eq!(first, (*run).first_slot());
            for i in 1..8 {
                let slot = (*run).alloc_slot();
                assert_eq!(slot as usize, first as usize + i * BRACKET_SIZES[0]);
            }
            assert_eq!((*run).top_slot_idx, 8);
            assert_eq!((*run).number_of_free_slots(), NUM_OF_SLOTS[0] - 8);
        }
    }

    #[test]
    fn free_switches_the_run_to_scan_mode() {
        let (_map, run) = new_run(0);
        unsafe {
            let p: Vec<*mut u8> = (0..4).map(|_| (*run).alloc_slot()).collect();
            (*run).free_slot(p[1]);
            // The freed slot is reused before any fresh one.
            assert_eq!((*run).alloc_slot(), p[1]);
            let next = (*run).alloc_slot();
            assert_eq!(next as usize, p[3] as usize + BRACKET_SIZES[0]);
        }
    }

    #[test]
    fn exhausted_run_returns_null() {
        let idx = NUM_OF_SIZE_BRACKETS - 1;
        let (_map, run) = new_run(idx);
        unsafe {
            for _ in 0..NUM_OF_SLOTS[idx] {
                assert!(!(*run).alloc_slot().is_null());
            }
            assert!((*run).is_full());
            assert!((*run).alloc_slot().is_null());
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected() {
        let (_map, run) = new_run(2);
        unsafe {
            let p = (*run).alloc_slot();
            (*run).free_slot(p);
            (*run).free_slot(p);
        }
    }

    #[test]
    fn thread_local_marks_drain_into_the_alloc_bit_map() {
        let (_map, run) = new_run(3);
        unsafe {
            (*run).is_thread_local = 1;
            let p: Vec<*mut u8> = (0..5).map(|_| (*run).alloc_slot()).collect();
            (*run).mark_thread_local_free_bit_map(p[0]);
            (*run).mark_thread_local_free_bit_map(p[4]);
            assert_eq!((*run).number_of_free_slots(), NUM_OF_SLOTS[3] - 5);

            let mut all_free = false;
            assert!((*run).merge_thread_local_free_bit_map_to_alloc_bit_map(&mut all_free));
            assert!(!all_free);
            assert!((*run).is_thread_local_free_bit_map_clean());
            assert_eq!((*run).number_of_free_slots(), NUM_OF_SLOTS[3] - 3);

            // Nothing left to drain.
            assert!(!(*run).merge_thread_local_free_bit_map_to_alloc_bit_map(&mut all_free));
        }
    }

    #[test]
    fn bulk_marks_drain_or_defer_depending_on_ownership() {
        let (_map, run) = new_run(1);
        unsafe {
            let p: Vec<*mut u8> = (0..3).map(|_| (*run).alloc_slot()).collect();
            (*run).is_thread_local = 1;
            (*run).mark_bulk_free_bit_map(p[1]);
            (*run).union_bulk_free_bit_map_to_thread_local_free_bit_map();
            assert!((*run).is_bulk_free_bit_map_clean());
            assert!(!(*run).is_thread_local_free_bit_map_clean());

            let mut all_free = false;
            (*run).merge_thread_local_free_bit_map_to_alloc_bit_map(&mut all_free);
            (*run).is_thread_local = 0;

            (*run).mark_bulk_free_bit_map(p[0]);
            (*run).mark_bulk_free_bit_map(p[2]);
            (*run).merge_bulk_free_bit_map_into_alloc_bit_map();
            assert!((*run).is_bulk_free_bit_map_clean());
            assert!((*run).is_all_free());
        }
    }

    #[test]
    fn inspect_reports_used_and_free_slots() {
        let (_map, run) = new_run(0);
        unsafe {
            for _ in 0..10 {
                (*run).alloc_slot();
            }
            let mut used = 0;
            let mut slots = 0;
            (*run).inspect_all_slots(&mut |_start, _end, used_bytes| {
                used += used_bytes;
                slots += 1;
            });
            assert_eq!(slots, NUM_OF_SLOTS[0]);
            assert_eq!(used, 10 * BRACKET_SIZES[0]);
        }
    }
}
