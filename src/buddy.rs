//! The buddy allocator.
//!
//! Free memory is tracked as runs of `2^order` contiguous blocks, one free
//! list per order. The lists are intrusive:
//! the first word of a free run's first block holds the index of the next
//! free run of the same order, so no memory beyond the arena is needed.
//!
//! Runs are identified by block index (relative to the first usable block),
//! never by address, and a run's buddy is found with `start ^ (1 << order)`.

use core::fmt;
use core::ptr::NonNull;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// Number of free lists; runs never exceed `2^(ORDER_COUNT - 1)` blocks.
pub const ORDER_COUNT: usize = 32;

/// Terminates a free list.
const NIL: usize = usize::MAX;

/// Floor of log2, for `n > 0`.
pub(crate) fn floor_log2(n: usize) -> usize {
    debug_assert!(n > 0);
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

/// The usable part of a backing region: `blocks` blocks of [`BLOCK_SIZE`]
/// bytes starting at `base`.
#[derive(Copy, Clone, Debug)]
pub struct Arena {
    base: NonNull<u8>,
    blocks: usize,
}

// The arena only hands out the memory it was given; which thread touches it
// is up to whoever holds the lock around the `BuddyAllocator`.
unsafe impl Send for Arena {}

impl Arena {
    /// Wrap `blocks` blocks of memory starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be word-aligned and point to `blocks * BLOCK_SIZE` bytes
    /// of writable memory that nothing else reads or writes for as long as
    /// the arena (or anything built on it) is in use.
    pub unsafe fn new(base: NonNull<u8>, blocks: usize) -> Arena {
        Arena { base, blocks }
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Address of the first byte of `run`.
    pub fn run_ptr(&self, run: Run) -> NonNull<u8> {
        debug_assert!(run.end() <= self.blocks);
        // Within the region handed to `Arena::new`, so never null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(run.start * BLOCK_SIZE)) }
    }

    /// The block index of `ptr`, if it lies inside the arena.
    pub fn block_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        let block = offset / BLOCK_SIZE;
        if block < self.blocks {
            Some(block)
        } else {
            None
        }
    }

    // Read the free-list link stored in the first word of block `index`.
    //
    // Safety: block `index` must be the head of a free run.
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn link(&self, index: usize) -> usize {
        let word = self.base.as_ptr().add(index * BLOCK_SIZE) as *const usize;
        word.read()
    }

    // Safety: block `index` must be the head of a run nobody else uses.
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn set_link(&self, index: usize, next: usize) {
        let word = self.base.as_ptr().add(index * BLOCK_SIZE) as *mut usize;
        word.write(next);
    }
}

/// `2^order` contiguous blocks starting at block index `start`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Run {
    pub start: usize,
    pub order: usize,
}

impl Run {
    pub const fn new(start: usize, order: usize) -> Run {
        Run { start, order }
    }

    pub const fn blocks(&self) -> usize {
        1 << self.order
    }

    pub const fn bytes(&self) -> usize {
        self.blocks() * BLOCK_SIZE
    }

    /// One past the last block of the run.
    pub const fn end(&self) -> usize {
        self.start + self.blocks()
    }

    /// The run this one merges with into `order + 1`.
    pub const fn buddy(&self) -> Run {
        Run {
            start: self.start ^ (1 << self.order),
            order: self.order,
        }
    }

    fn overlaps(&self, other: &Run) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end())
    }
}

/// Validity contains a count of every invalid state found in the free lists.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Free runs claiming the same block. This indicates corruption.
    pub overlaps: usize,
    /// Free runs that are misaligned, out of bounds, or on the wrong list.
    pub misplaced: usize,
    /// Pairs of buddies that are both free but were not coalesced.
    pub unmerged: usize,
    /// Whether the free-block counter disagrees with the lists.
    pub miscounted: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.misplaced == 0 && self.unmerged == 0 && !self.miscounted
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    /// Number of free runs, over all orders.
    pub runs: usize,
    /// Number of free blocks, over all orders.
    pub free_blocks: usize,
    /// The largest order with a free run, if any.
    pub largest_order: Option<usize>,
}

/// A copy of the allocator's counters and consistency checks, taken in one
/// go so callers never hold the allocator itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub usable_blocks: usize,
    pub free_blocks: usize,
    pub max_order: usize,
    pub stats: Stats,
    pub validity: Validity,
}

/// A power-of-two block allocator over an [`Arena`].
///
/// The allocator has no lock of its own; [`Kmem`](crate::Kmem) keeps it
/// behind a `spin::Mutex` and every mutation happens under that lock.
pub struct BuddyAllocator {
    arena: Arena,
    heads: [usize; ORDER_COUNT],
    max_order: usize,
    free_blocks: usize,
}

impl BuddyAllocator {
    /// Take ownership of every block of `arena`, splitting it greedily into
    /// the largest power-of-two runs that fit, largest first.
    pub fn new(arena: Arena) -> BuddyAllocator {
        let usable = arena.blocks();
        let max_order = if usable == 0 {
            0
        } else {
            floor_log2(usable).min(ORDER_COUNT - 1)
        };

        let mut buddy = BuddyAllocator {
            arena,
            heads: [NIL; ORDER_COUNT],
            max_order,
            free_blocks: 0,
        };

        let mut start = 0;
        let mut remaining = usable;
        while remaining > 0 {
            let order = floor_log2(remaining).min(max_order);
            buddy.push(Run::new(start, order));
            start += 1 << order;
            remaining -= 1 << order;
        }

        debug!(
            "Buddy allocator over {} blocks at {:?}, max order {}",
            usable,
            arena.base(),
            max_order
        );
        buddy
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn usable_blocks(&self) -> usize {
        self.arena.blocks()
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Take a run of exactly `2^order` blocks, splitting a larger one if
    /// needed. Upper halves of split runs go back on the free lists.
    pub fn acquire(&mut self, order: usize) -> Result<Run> {
        if order > self.max_order {
            return Err(Error::OutOfMemory { order });
        }

        let found = (order..=self.max_order)
            .find(|&o| self.heads[o] != NIL)
            .ok_or(Error::OutOfMemory { order })?;
        let start = self.pop(found).ok_or(Error::OutOfMemory { order })?;

        let mut current = found;
        while current > order {
            current -= 1;
            self.push(Run::new(start + (1 << current), current));
        }

        let run = Run::new(start, order);
        trace!("acquire({}) -> {} (split from order {})", order, run, found);
        Ok(run)
    }

    /// Give `run` back, merging it with its buddy for as long as the buddy is
    /// free too.
    pub fn release(&mut self, run: Run) -> Result<()> {
        self.check(run)?;
        if self.runs().any(|free| free.overlaps(&run)) {
            return Err(Error::InvalidArgument("run is already free"));
        }

        let mut merged = run;
        while merged.order < self.max_order {
            let buddy = merged.buddy();
            if buddy.end() > self.arena.blocks() || !self.remove(buddy) {
                break;
            }
            merged = Run::new(merged.start.min(buddy.start), merged.order + 1);
        }

        trace!("release({}) -> merged into {}", run, merged);
        self.push(merged);
        Ok(())
    }

    /// Iterate over the start indices of the free runs of `order`, head first.
    pub fn free_runs(&self, order: usize) -> FreeRuns<'_> {
        let next = if order < ORDER_COUNT {
            self.heads[order]
        } else {
            NIL
        };
        FreeRuns { buddy: self, next }
    }

    /// Every free run, lowest order first.
    pub fn runs(&self) -> impl Iterator<Item = Run> + '_ {
        (0..=self.max_order)
            .flat_map(move |order| self.free_runs(order).map(move |start| Run::new(start, order)))
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for run in self.runs() {
            stats.runs += 1;
            stats.free_blocks += run.blocks();
            stats.largest_order = stats.largest_order.max(Some(run.order));
        }
        stats
    }

    pub fn report(&self) -> Report {
        Report {
            usable_blocks: self.usable_blocks(),
            free_blocks: self.free_blocks,
            max_order: self.max_order,
            stats: self.stats(),
            validity: self.validate(),
        }
    }

    /// Copy free runs, lowest order first, into `out`. Returns the total
    /// number of free runs, which may exceed `out.len()`.
    pub fn copy_runs(&self, out: &mut [Run]) -> usize {
        let mut total = 0;
        for run in self.runs() {
            if let Some(slot) = out.get_mut(total) {
                *slot = run;
            }
            total += 1;
        }
        total
    }

    /// Check the free lists for corruption.
    ///
    /// This is quadratic in the number of free runs, and meant for tests and
    /// debugging.
    pub fn validate(&self) -> Validity {
        let mut validity = Validity::default();
        let mut counted = 0;

        for (i, run) in self.runs().enumerate() {
            counted += run.blocks();

            if self.check(run).is_err() {
                validity.misplaced += 1;
            }

            validity.overlaps += self.runs().skip(i + 1).filter(|r| r.overlaps(&run)).count();

            let buddy = run.buddy();
            if run.order < self.max_order
                && buddy.start > run.start
                && self.free_runs(run.order).any(|start| start == buddy.start)
            {
                validity.unmerged += 1;
            }
        }

        validity.miscounted = counted != self.free_blocks;
        validity
    }

    fn check(&self, run: Run) -> Result<()> {
        if run.order > self.max_order {
            return Err(Error::InvalidArgument("run order above the maximum order"));
        }
        if run.start % run.blocks() != 0 {
            return Err(Error::InvalidArgument("run start is not aligned to its order"));
        }
        if run.end() > self.arena.blocks() {
            return Err(Error::InvalidArgument("run extends past the arena"));
        }
        Ok(())
    }

    fn push(&mut self, run: Run) {
        unsafe { self.arena.set_link(run.start, self.heads[run.order]) };
        self.heads[run.order] = run.start;
        self.free_blocks += run.blocks();
    }

    fn pop(&mut self, order: usize) -> Option<usize> {
        let head = self.heads[order];
        if head == NIL {
            return None;
        }
        self.heads[order] = unsafe { self.arena.link(head) };
        self.free_blocks -= 1 << order;
        Some(head)
    }

    // Unlink `run` from its free list, if it is there.
    fn remove(&mut self, run: Run) -> bool {
        let mut previous = NIL;
        let mut current = self.heads[run.order];

        while current != NIL {
            let next = unsafe { self.arena.link(current) };
            if current == run.start {
                if previous == NIL {
                    self.heads[run.order] = next;
                } else {
                    unsafe { self.arena.set_link(previous, next) };
                }
                self.free_blocks -= run.blocks();
                return true;
            }
            previous = current;
            current = next;
        }

        false
    }
}

pub struct FreeRuns<'a> {
    buddy: &'a BuddyAllocator,
    next: usize,
}

impl<'a> Iterator for FreeRuns<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == NIL {
            return None;
        }
        let current = self.next;
        self.next = unsafe { self.buddy.arena.link(current) };
        Some(current)
    }
}

impl fmt::Display for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuddyAllocator(")?;
        let mut start = true;
        for order in 0..=self.max_order {
            if self.heads[order] == NIL {
                continue;
            }
            if !start {
                write!(f, "; ")?;
            } else {
                start = false;
            }
            write!(f, "{}:", order)?;
            for run in self.free_runs(order) {
                write!(f, " {}", Run::new(run, order))?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::TestRegion;

    use test_log::test;

    fn shape(buddy: &BuddyAllocator) -> Vec<Vec<usize>> {
        (0..ORDER_COUNT)
            .map(|order| {
                let mut starts: Vec<usize> = buddy.free_runs(order).collect();
                starts.sort_unstable();
                starts
            })
            .collect()
    }

    fn buddy_over(region: &TestRegion) -> BuddyAllocator {
        BuddyAllocator::new(unsafe { Arena::new(region.ptr(), region.blocks()) })
    }

    #[test]
    fn init_covers_every_usable_block_exactly_once() {
        for blocks in (1..=130).chain([255, 256, 257, 999, 1000, 1023]) {
            let region = TestRegion::new(blocks);
            let buddy = buddy_over(&region);

            let mut covered = vec![false; blocks];
            for run in buddy.runs() {
                for block in run.start..run.end() {
                    assert!(!covered[block], "block {} covered twice", block);
                    covered[block] = true;
                }
            }
            assert!(covered.iter().all(|&c| c), "{} blocks not covered", blocks);
            assert_eq!(buddy.free_blocks(), blocks);
            assert!(buddy.validate().is_valid());

            // One run per set bit of the block count.
            assert_eq!(buddy.stats().runs, blocks.count_ones() as usize);
            assert_eq!(buddy.max_order(), floor_log2(blocks));
        }
    }

    #[test]
    fn acquire_then_release_restores_the_shape() {
        let region = TestRegion::new(999);
        let mut buddy = buddy_over(&region);

        for order in 0..=buddy.max_order() {
            let before = shape(&buddy);
            let run = buddy.acquire(order).unwrap();
            assert_eq!(run.order, order);
            assert_eq!(run.start % run.blocks(), 0);
            assert_eq!(buddy.free_blocks(), 999 - run.blocks());
            assert!(buddy.validate().is_valid());

            buddy.release(run).unwrap();
            assert_eq!(shape(&buddy), before, "order {}", order);
        }
    }

    #[test]
    fn released_buddies_coalesce() {
        let region = TestRegion::new(16);
        let mut buddy = buddy_over(&region);
        let whole = buddy.acquire(4).unwrap();
        assert_eq!(buddy.free_blocks(), 0);

        // Hand the halves back by hand: two free runs of order 3 must merge.
        buddy.release(Run::new(0, 3)).unwrap();
        assert_eq!(shape(&buddy)[3], vec![0]);
        buddy.release(Run::new(8, 3)).unwrap();
        assert!(shape(&buddy)[3].is_empty());
        assert_eq!(shape(&buddy)[4], vec![whole.start]);
    }

    #[test]
    fn split_pushes_upper_halves() {
        let region = TestRegion::new(8);
        let mut buddy = buddy_over(&region);

        let run = buddy.acquire(0).unwrap();
        assert_eq!(run, Run::new(0, 0));
        let shape = shape(&buddy);
        assert_eq!(shape[0], vec![1]);
        assert_eq!(shape[1], vec![2]);
        assert_eq!(shape[2], vec![4]);
        assert!(shape[3].is_empty());
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let region = TestRegion::new(6);
        let mut buddy = buddy_over(&region);

        assert_eq!(buddy.acquire(3), Err(Error::OutOfMemory { order: 3 }));
        let a = buddy.acquire(2).unwrap();
        assert_eq!(buddy.acquire(2), Err(Error::OutOfMemory { order: 2 }));
        let b = buddy.acquire(1).unwrap();
        assert_eq!(buddy.acquire(0), Err(Error::OutOfMemory { order: 0 }));

        buddy.release(b).unwrap();
        buddy.release(a).unwrap();
        assert_eq!(buddy.free_blocks(), 6);
        assert!(buddy.validate().is_valid());
    }

    #[test]
    fn malformed_releases_are_rejected() {
        let region = TestRegion::new(8);
        let mut buddy = buddy_over(&region);
        let run = buddy.acquire(1).unwrap();

        assert!(matches!(
            buddy.release(Run::new(1, 1)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            buddy.release(Run::new(8, 0)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            buddy.release(Run::new(0, 4)),
            Err(Error::InvalidArgument(_))
        ));

        buddy.release(run).unwrap();
        assert!(matches!(buddy.release(run), Err(Error::InvalidArgument(_))));
        assert!(buddy.validate().is_valid());
    }

    #[test]
    fn report_and_copied_runs_match_the_lists() {
        let region = TestRegion::new(13);
        let mut buddy = buddy_over(&region);
        let run = buddy.acquire(1).unwrap();

        let report = buddy.report();
        assert_eq!(report.usable_blocks, 13);
        assert_eq!(report.free_blocks, 11);
        assert_eq!(report.max_order, 3);
        assert!(bool::from(report.validity));

        let mut runs = [Run::new(0, 0); 2];
        let total = buddy.copy_runs(&mut runs);
        assert_eq!(total, report.stats.runs);
        assert!(total > runs.len());
        let all: Vec<Run> = buddy.runs().collect();
        assert_eq!(&runs[..], &all[..2]);

        buddy.release(run).unwrap();
        assert_eq!(buddy.report().free_blocks, 13);
    }

    #[test]
    fn display_lists_runs_by_order() {
        let region = TestRegion::new(5);
        let buddy = buddy_over(&region);
        assert_eq!(format!("{}", buddy), "BuddyAllocator(0: 4..5; 2: 0..4)");
    }
}
