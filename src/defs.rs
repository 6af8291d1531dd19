use core::mem::size_of;

use crate::round_up;

/// Different page release modes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum PageReleaseMode {
    /// Release no empty pages
    None,
    /// Release empty pages at the end of the space
    End,
    /// Release empty pages that are larger than the threshold
    Size,
    /// Release empty pages that are larger than the threshold or at the end of the space
    SizeAndEnd,
    /// Release all empty pages
    All,
}

/// Per-page classifier for the managed region. `Released` is an `Empty` page
/// whose physical backing has been handed back to the kernel; every free-page
/// query treats the two identically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum PageMapKind {
    Released,
    Empty,
    Run,
    RunPart,
    LargeObject,
    LargeObjectPart,
}

pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = 1024 * MB;

pub const DEFAULT_PAGE_RELEASE_THRESHOLD: usize = 4 * MB;

/// Magic byte stored in the first byte of a run (debug builds).
pub const MAGIC_NUM: u8 = 42;
/// Magic byte stored in the first byte of a free page run (debug builds).
pub const MAGIC_NUM_FREE: u8 = 43;

/// Total number of size brackets: 32 quantum-spaced ones plus 1 KB and 2 KB.
pub const NUM_OF_SIZE_BRACKETS: usize = 34;
/// The number of smaller size brackets that are 16 bytes apart.
pub const NUM_OF_QUANTUM_SIZE_BRACKETS: usize = 32;
pub const BRACKET_QUANTUM_SIZE: usize = 16;
pub const BRACKET_QUANTUM_SIZE_SHIFT: usize = 4;
/// Largest quantum-spaced bracket size (512 bytes).
pub const MAX_QUANTUM_BRACKET_SIZE: usize = NUM_OF_QUANTUM_SIZE_BRACKETS * BRACKET_QUANTUM_SIZE;

/// Brackets with an index below this use per-thread runs; the rest share
/// `current_runs` under the bracket locks.
pub const NUM_THREAD_LOCAL_SIZE_BRACKETS: usize = 11;
/// Largest size served out of a thread-local run.
pub const MAX_THREAD_LOCAL_BRACKET_SIZE: usize =
    NUM_THREAD_LOCAL_SIZE_BRACKETS * BRACKET_QUANTUM_SIZE;

/// Requests above this many bytes bypass the runs and get whole pages.
pub const LARGE_SIZE_THRESHOLD: usize = 2 * KB;

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))] {
        pub const PAGE_SIZE: usize = 16 * KB;
    } else {
        pub const PAGE_SIZE: usize = 4 * KB;
    }
}

/// Per-bracket run geometry, derived once at compile time. For a candidate
/// slot count `s` the header is the fixed part followed by three bit maps of
/// `ceil(s/32)` words each (alloc, bulk free, thread-local free), padded up to
/// the bracket size; the largest `s` whose header and slots fit in the run
/// wins. The `run_size % bracket_size` remainder is folded into the header so
/// the last slot ends exactly at the run end.
struct BracketGeometry {
    bracket_sizes: [usize; NUM_OF_SIZE_BRACKETS],
    num_of_pages: [usize; NUM_OF_SIZE_BRACKETS],
    num_of_slots: [usize; NUM_OF_SIZE_BRACKETS],
    header_sizes: [usize; NUM_OF_SIZE_BRACKETS],
    bulk_free_bit_map_offsets: [usize; NUM_OF_SIZE_BRACKETS],
    thread_local_free_bit_map_offsets: [usize; NUM_OF_SIZE_BRACKETS],
}

const fn compute_bracket_geometry() -> BracketGeometry {
    let mut g = BracketGeometry {
        bracket_sizes: [0; NUM_OF_SIZE_BRACKETS],
        num_of_pages: [0; NUM_OF_SIZE_BRACKETS],
        num_of_slots: [0; NUM_OF_SIZE_BRACKETS],
        header_sizes: [0; NUM_OF_SIZE_BRACKETS],
        bulk_free_bit_map_offsets: [0; NUM_OF_SIZE_BRACKETS],
        thread_local_free_bit_map_offsets: [0; NUM_OF_SIZE_BRACKETS],
    };
    let fixed_header_size = round_up(
        crate::run::Run::fixed_header_size() as u64,
        size_of::<u64>() as u64,
    ) as usize;
    let mut i = 0;
    while i < NUM_OF_SIZE_BRACKETS {
        g.bracket_sizes[i] = if i < NUM_OF_QUANTUM_SIZE_BRACKETS {
            BRACKET_QUANTUM_SIZE * (i + 1)
        } else if i == NUM_OF_SIZE_BRACKETS - 2 {
            1 * KB
        } else {
            2 * KB
        };
        g.num_of_pages[i] = if i < NUM_OF_QUANTUM_SIZE_BRACKETS {
            1
        } else if i == NUM_OF_SIZE_BRACKETS - 2 {
            2
        } else {
            4
        };

        let bracket_size = g.bracket_sizes[i];
        let run_size = PAGE_SIZE * g.num_of_pages[i];
        let max_num_of_slots = run_size / bracket_size;

        let mut s = max_num_of_slots as isize;
        while s >= 0 {
            let slots = s as usize;
            let bit_map_size = (round_up(slots as u64, 32) as usize / 32) * size_of::<u32>();
            let bulk_free_bit_map_offset = fixed_header_size + bit_map_size;
            let thread_local_free_bit_map_offset = bulk_free_bit_map_offset + bit_map_size;
            let unaligned_header_size = thread_local_free_bit_map_offset + bit_map_size;
            let header_size = if unaligned_header_size % bracket_size == 0 {
                unaligned_header_size
            } else {
                unaligned_header_size + (bracket_size - unaligned_header_size % bracket_size)
            };
            if slots * bracket_size + header_size <= run_size {
                g.num_of_slots[i] = slots;
                g.header_sizes[i] = header_size + run_size % bracket_size;
                g.bulk_free_bit_map_offsets[i] = bulk_free_bit_map_offset;
                g.thread_local_free_bit_map_offsets[i] = thread_local_free_bit_map_offset;
                break;
            }
            s -= 1;
        }
        i += 1;
    }
    g
}

const GEOMETRY: BracketGeometry = compute_bracket_geometry();

/// The sizes (the slot sizes, in bytes) of the size brackets.
pub const BRACKET_SIZES: [usize; NUM_OF_SIZE_BRACKETS] = GEOMETRY.bracket_sizes;
/// The numbers of pages that are used for runs for each size bracket.
pub const NUM_OF_PAGES: [usize; NUM_OF_SIZE_BRACKETS] = GEOMETRY.num_of_pages;
/// The numbers of slots of the runs for each size bracket.
pub const NUM_OF_SLOTS: [usize; NUM_OF_SIZE_BRACKETS] = GEOMETRY.num_of_slots;
/// The header sizes in bytes of the runs for each size bracket, including the
/// three bit maps and the padding in front of the first slot.
pub const HEADER_SIZES: [usize; NUM_OF_SIZE_BRACKETS] = GEOMETRY.header_sizes;
/// The byte offsets of the bulk free bit maps of the runs for each size bracket.
pub const BULK_FREE_BIT_MAP_OFFSETS: [usize; NUM_OF_SIZE_BRACKETS] =
    GEOMETRY.bulk_free_bit_map_offsets;
/// The byte offsets of the thread-local free bit maps of the runs for each
/// size bracket.
pub const THREAD_LOCAL_FREE_BIT_MAP_OFFSETS: [usize; NUM_OF_SIZE_BRACKETS] =
    GEOMETRY.thread_local_free_bit_map_offsets;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Run;

    #[test]
    fn bracket_sizes_follow_the_quantum() {
        for i in 0..NUM_OF_QUANTUM_SIZE_BRACKETS {
            assert_eq!(BRACKET_SIZES[i], BRACKET_QUANTUM_SIZE * (i + 1));
        }
        assert_eq!(BRACKET_SIZES[NUM_OF_SIZE_BRACKETS - 2], 1 * KB);
        assert_eq!(BRACKET_SIZES[NUM_OF_SIZE_BRACKETS - 1], 2 * KB);
        assert_eq!(
            BRACKET_SIZES[NUM_OF_QUANTUM_SIZE_BRACKETS - 1],
            MAX_QUANTUM_BRACKET_SIZE
        );
        assert_eq!(MAX_THREAD_LOCAL_BRACKET_SIZE, 176);
    }

    #[test]
    fn run_geometry_is_consistent() {
        let fixed = round_up(Run::fixed_header_size() as u64, 8) as usize;
        for i in 0..NUM_OF_SIZE_BRACKETS {
            let bracket_size = BRACKET_SIZES[i];
            let run_size = NUM_OF_PAGES[i] * PAGE_SIZE;
            let num_slots = NUM_OF_SLOTS[i];
            let header_size = HEADER_SIZES[i];
            assert!(num_slots > 1, "bracket {} has {} slots", i, num_slots);
            assert!(header_size + num_slots * bracket_size <= run_size);

            let bit_map_size = ((num_slots + 31) / 32) * size_of::<u32>();
            assert_eq!(BULK_FREE_BIT_MAP_OFFSETS[i], fixed + bit_map_size);
            assert_eq!(
                THREAD_LOCAL_FREE_BIT_MAP_OFFSETS[i],
                fixed + 2 * bit_map_size
            );
            assert!(header_size >= THREAD_LOCAL_FREE_BIT_MAP_OFFSETS[i] + bit_map_size);

            // Slots must stay quantum-aligned relative to the page-aligned run.
            assert_eq!(header_size % BRACKET_QUANTUM_SIZE, 0);
        }
    }

    #[test]
    fn slots_end_at_the_run_end_for_dividing_brackets() {
        for i in 0..NUM_OF_SIZE_BRACKETS {
            let run_size = NUM_OF_PAGES[i] * PAGE_SIZE;
            if run_size % BRACKET_SIZES[i] == 0 {
                assert_eq!(
                    HEADER_SIZES[i] + NUM_OF_SLOTS[i] * BRACKET_SIZES[i],
                    run_size,
                    "bracket {}",
                    i
                );
            }
        }
    }
}
