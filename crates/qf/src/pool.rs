//! Fixed-block memory pools.
//!
//! A pool partitions its storage into equally sized blocks and threads the
//! unused ones onto a free list of indices. `get` and `put` are O(1) and run
//! inside the global critical section, so both are safe from interrupt
//! context.
//!
//! Each block carries a small header next to the free-list link: whether the
//! block is in use, its generation, and the reference count of the event that
//! occupies it. The generation is bumped on every `put`, which turns a
//! use-after-free into a detectable stale handle.

use core::cell::{RefCell, RefMut};

use critical_section::{CriticalSection, Mutex as CsMutex};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::assert::{q_error, q_require};
use crate::sync::Mutex;

const MODULE: &str = "qf_pool";

/// A block handed out by [`BlockPool::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pool: u8,
    index: u16,
    generation: u16,
}

impl Block {
    /// Id of the pool that handed the block out.
    pub const fn pool_id(&self) -> u8 {
        self.pool
    }

    /// Position of the block inside its pool, `0..total`.
    pub const fn index(&self) -> u16 {
        self.index
    }

    pub const fn generation(&self) -> u16 {
        self.generation
    }
}

#[derive(Debug)]
pub(crate) struct BlockHeader {
    generation: u16,
    in_use: bool,
    next_free: Option<u16>,
    pub(crate) ref_count: u8,
}

impl BlockHeader {
    fn holds(&self, block: Block) -> bool {
        self.in_use && self.generation == block.generation
    }
}

struct PoolState {
    headers: Box<[BlockHeader]>,
    free_head: Option<u16>,
    n_free: u16,
    n_min: u16,
}

enum Take {
    Granted(Block),
    Exhausted,
    Corrupt,
}

enum Give {
    Returned,
    Foreign,
    NotLive,
}

/// Usage snapshot of one pool.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_id: u8,
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    /// Lowest number of free blocks ever observed (low-water mark).
    pub min_free_blocks: usize,
}

impl PoolStats {
    pub const fn used_blocks(&self) -> usize {
        self.total_blocks - self.free_blocks
    }

    pub const fn is_exhausted(&self) -> bool {
        self.free_blocks == 0
    }

    /// Utilization as a percentage (0-100).
    pub fn utilization(&self) -> u8 {
        if self.total_blocks == 0 {
            0
        } else {
            ((self.used_blocks() * 100) / self.total_blocks) as u8
        }
    }
}

/// Pool of `total` blocks of `block_size` bytes each.
pub struct BlockPool {
    id: u8,
    block_size: usize,
    n_total: u16,
    state: CsMutex<RefCell<PoolState>>,
    blocks: Box<[Mutex<Box<[u8]>>]>,
}

impl BlockPool {
    /// Creates pool `id` (1-based, 0 denotes static events) holding
    /// `block_count` blocks of `block_size` bytes, all initially free.
    pub fn new(id: u8, block_size: usize, block_count: usize) -> Self {
        q_require!(MODULE, 100, id != 0, "pool id 0 is reserved for static events");
        q_require!(MODULE, 101, block_size > 0, "block size must be non-zero");
        q_require!(
            MODULE,
            102,
            block_count > 0 && block_count <= u16::MAX as usize,
            "block count {block_count} out of range"
        );

        let n_total = block_count as u16;
        let headers = (0..n_total)
            .map(|index| BlockHeader {
                generation: 0,
                in_use: false,
                next_free: (index + 1 < n_total).then_some(index + 1),
                ref_count: 0,
            })
            .collect();
        let blocks = (0..block_count)
            .map(|_| Mutex::new(vec![0u8; block_size].into_boxed_slice()))
            .collect();

        Self {
            id,
            block_size,
            n_total,
            state: CsMutex::new(RefCell::new(PoolState {
                headers,
                free_head: Some(0),
                n_free: n_total,
                n_min: n_total,
            })),
            blocks,
        }
    }

    /// Partitions `total_size` bytes of storage into `total_size / block_size`
    /// blocks.
    pub fn partition(id: u8, total_size: usize, block_size: usize) -> Self {
        q_require!(MODULE, 103, block_size > 0, "block size must be non-zero");
        Self::new(id, block_size, total_size / block_size)
    }

    pub const fn id(&self) -> u8 {
        self.id
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn total(&self) -> usize {
        self.n_total as usize
    }

    /// Takes a block if more than `margin` blocks are free.
    ///
    /// `None` is ordinary backpressure, not an error.
    pub fn get(&self, margin: usize) -> Option<Block> {
        let outcome = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if usize::from(state.n_free) <= margin {
                return Take::Exhausted;
            }
            let Some(index) = state.free_head else {
                return Take::Corrupt;
            };
            let header = &mut state.headers[usize::from(index)];
            header.in_use = true;
            header.ref_count = 0;
            let next = header.next_free.take();
            let block = Block {
                pool: self.id,
                index,
                generation: header.generation,
            };

            state.free_head = next;
            state.n_free -= 1;
            if state.n_min > state.n_free {
                state.n_min = state.n_free;
            }
            Take::Granted(block)
        });

        match outcome {
            Take::Granted(block) => Some(block),
            Take::Exhausted => None,
            Take::Corrupt => q_error!(
                MODULE,
                110,
                "pool {} counts free blocks but its free list is empty",
                self.id
            ),
        }
    }

    /// Returns a block to the free list.
    ///
    /// Halts on a block handed out by another pool or one that is not
    /// currently handed out (double free or stale handle). A live block
    /// implies the pool is not full.
    pub fn put(&self, block: Block) {
        let outcome = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if !self.owns(block) {
                return Give::Foreign;
            }
            let free_head = state.free_head;
            let header = &mut state.headers[usize::from(block.index)];
            if !header.holds(block) {
                return Give::NotLive;
            }
            header.in_use = false;
            header.ref_count = 0;
            header.generation = header.generation.wrapping_add(1);
            header.next_free = free_head;

            state.free_head = Some(block.index);
            state.n_free += 1;
            Give::Returned
        });

        match outcome {
            Give::Returned => {}
            Give::Foreign => self.foreign(block),
            Give::NotLive => q_error!(
                MODULE,
                122,
                "block #{} of pool {} is not in use (double free or stale handle)",
                block.index,
                self.id
            ),
        }
    }

    pub fn free(&self) -> usize {
        critical_section::with(|cs| usize::from(self.state.borrow_ref(cs).n_free))
    }

    pub fn min_free(&self) -> usize {
        critical_section::with(|cs| usize::from(self.state.borrow_ref(cs).n_min))
    }

    pub fn stats(&self) -> PoolStats {
        critical_section::with(|cs| {
            let state = self.state.borrow_ref(cs);
            PoolStats {
                pool_id: self.id,
                block_size: self.block_size,
                total_blocks: self.total(),
                free_blocks: usize::from(state.n_free),
                min_free_blocks: usize::from(state.n_min),
            }
        })
    }

    /// Returns `true` while `block` is handed out by this pool under this
    /// generation.
    pub fn is_live(&self, block: Block) -> bool {
        if !self.owns(block) {
            return false;
        }
        critical_section::with(|cs| {
            self.state
                .borrow_ref(cs)
                .headers
                .get(usize::from(block.index))
                .is_some_and(|header| header.holds(block))
        })
    }

    /// Reads the bytes of a live block.
    pub fn with_block<R>(&self, block: Block, f: impl FnOnce(&[u8]) -> R) -> R {
        self.require_live(block);
        let data = self.blocks[usize::from(block.index)].lock();
        f(&data)
    }

    /// Writes the bytes of a live block.
    pub fn with_block_mut<R>(&self, block: Block, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.require_live(block);
        let mut data = self.blocks[usize::from(block.index)].lock();
        f(&mut data)
    }

    /// Header of a live block, borrowed under an already-held critical
    /// section. `None` if the handle is foreign or stale.
    pub(crate) fn header_mut<'cs>(
        &'cs self,
        cs: CriticalSection<'cs>,
        block: Block,
    ) -> Option<RefMut<'cs, BlockHeader>> {
        if !self.owns(block) {
            return None;
        }
        let state = self.state.borrow_ref_mut(cs);
        let live = state
            .headers
            .get(usize::from(block.index))
            .is_some_and(|header| header.holds(block));
        if !live {
            return None;
        }
        Some(RefMut::map(state, |state| {
            &mut state.headers[usize::from(block.index)]
        }))
    }

    fn owns(&self, block: Block) -> bool {
        block.pool == self.id && block.index < self.n_total
    }

    #[cold]
    fn foreign(&self, block: Block) -> ! {
        q_error!(
            MODULE,
            120,
            "block #{} of pool {} does not belong to pool {}",
            block.index,
            block.pool,
            self.id
        )
    }

    fn require_live(&self, block: Block) {
        if !self.owns(block) {
            self.foreign(block);
        }
        q_require!(
            MODULE,
            130,
            self.is_live(block),
            "block #{} of pool {} accessed after it was recycled",
            block.index,
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_fully_free() {
        let pool = BlockPool::new(1, 16, 4);
        let stats = pool.stats();
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.min_free_blocks, 4);
        assert_eq!(stats.utilization(), 0);
    }

    #[test]
    fn partition_divides_storage() {
        let pool = BlockPool::partition(2, 100, 16);
        assert_eq!(pool.total(), 6);
        assert_eq!(pool.block_size(), 16);
    }

    #[test]
    fn get_hands_out_distinct_blocks_within_bounds() {
        let pool = BlockPool::new(1, 8, 5);
        let mut seen = Vec::new();
        while let Some(block) = pool.get(0) {
            assert!(usize::from(block.index()) < pool.total());
            assert!(!seen.contains(&block.index()));
            seen.push(block.index());
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(pool.free(), 0);
        assert_eq!(pool.min_free(), 0);
    }

    #[test]
    fn margin_keeps_spare_blocks() {
        let pool = BlockPool::new(1, 8, 4);
        assert!(pool.get(2).is_some());
        assert!(pool.get(2).is_some());
        // two left, margin of two must be preserved
        assert!(pool.get(2).is_none());
        assert_eq!(pool.free(), 2);
        assert!(pool.get(1).is_some());
        assert!(pool.get(0).is_some());
        assert!(pool.get(0).is_none());
    }

    #[test]
    fn put_restores_free_count_and_keeps_watermark() {
        let pool = BlockPool::new(1, 8, 3);
        let a = pool.get(0).unwrap();
        let b = pool.get(0).unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.free(), 3);
        assert_eq!(pool.min_free(), 1);
    }

    #[test]
    fn recycled_block_gets_new_generation() {
        let pool = BlockPool::new(1, 8, 1);
        let first = pool.get(0).unwrap();
        pool.put(first);
        let second = pool.get(0).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(!pool.is_live(first));
        assert!(pool.is_live(second));
    }

    #[test]
    fn block_bytes_round_trip() {
        let pool = BlockPool::new(1, 4, 2);
        let block = pool.get(0).unwrap();
        pool.with_block_mut(block, |bytes| bytes.copy_from_slice(&[1, 2, 3, 4]));
        let sum: u32 = pool.with_block(block, |bytes| bytes.iter().map(|&b| u32::from(b)).sum());
        assert_eq!(sum, 10);
    }

    #[test]
    #[should_panic(expected = "qf_pool:122")]
    fn double_free_is_fatal() {
        let pool = BlockPool::new(1, 8, 2);
        let block = pool.get(0).unwrap();
        pool.put(block);
        pool.put(block);
    }

    #[test]
    #[should_panic(expected = "qf_pool:122")]
    fn double_free_into_full_pool_is_reported_as_double_free() {
        let pool = BlockPool::new(1, 8, 1);
        let block = pool.get(0).unwrap();
        pool.put(block);
        pool.put(block);
    }

    #[test]
    #[should_panic(expected = "qf_pool:120")]
    fn out_of_range_block_is_fatal() {
        let big = BlockPool::new(2, 8, 8);
        let mut last = None;
        while let Some(block) = big.get(0) {
            last = Some(block);
        }
        let pool = BlockPool::new(2, 8, 2);
        let _held = pool.get(0).unwrap();
        pool.put(last.unwrap());
    }

    #[test]
    fn foreign_block_with_matching_slot_is_rejected() {
        let mine = BlockPool::new(1, 8, 2);
        let other = BlockPool::new(2, 8, 2);
        let held = mine.get(0).unwrap();
        let foreign = other.get(0).unwrap();
        assert_eq!(held.index(), foreign.index());
        assert_eq!(held.generation(), foreign.generation());
        assert!(!mine.is_live(foreign));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mine.put(foreign)));
        assert!(result.is_err());
        assert!(mine.is_live(held));
        assert_eq!(mine.free(), 1);
    }

    #[test]
    #[should_panic(expected = "qf_pool:120")]
    fn reading_a_foreign_block_is_fatal() {
        let mine = BlockPool::new(1, 8, 2);
        let other = BlockPool::new(2, 8, 2);
        let _held = mine.get(0).unwrap();
        let foreign = other.get(0).unwrap();
        mine.with_block(foreign, |_| ());
    }

    #[test]
    #[should_panic(expected = "qf_pool:130")]
    fn reading_recycled_block_is_fatal() {
        let pool = BlockPool::new(1, 8, 1);
        let block = pool.get(0).unwrap();
        pool.put(block);
        pool.with_block(block, |_| ());
    }

    #[test]
    #[should_panic(expected = "qf_pool:101")]
    fn zero_block_size_is_rejected() {
        let _ = BlockPool::new(1, 0, 4);
    }
}
