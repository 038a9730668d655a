//! Descriptor ring and descriptor set allocator
//!
//! The ring is `count` sets of `depth` descriptors laid out back to back in
//! one coherent region. Three rotating indices walk it:
//!
//! ```text
//!   cidx ──► oldest set still owed completion credit
//!   sw_cidx ► next closed set to hand to the engine
//!   pidx ──► next set to fill
//!
//!   avail_sets + sets_ready + in_flight_sets == count
//! ```
//!
//! A set is filled (possibly by several requests), closed, chained with the
//! other ready sets into one hardware submission, and returned to the
//! available pool only once every descriptor in it has been credited.

use crate::error::{DmaError, Result};
use crate::hw::{DmaAllocator, DmaRegion};
use std::sync::Arc;
use xdma_chip::desc::{flags, Descriptor, DESC_SIZE, DESC_WORDS};
use xdma_chip::regs::MAX_EXTRA_ADJACENT;

/// Boundary the optional adjacent clamp keeps prefetch blocks inside
const ADJACENT_PAGE: u64 = 4096;

/// Descriptor slots addressed by index
#[derive(Debug)]
pub struct DescriptorArena {
    region: Arc<dyn DmaRegion>,
    slots: u32,
}

impl DescriptorArena {
    /// Allocate room for `slots` descriptors and link them in order
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocator cannot supply the region.
    pub fn new(allocator: &dyn DmaAllocator, slots: u32) -> Result<Self> {
        let region = allocator.alloc_coherent(slots as usize * DESC_SIZE)?;
        let arena = Self { region, slots };
        arena.initialize();
        Ok(arena)
    }

    /// Number of slots
    pub const fn slots(&self) -> u32 {
        self.slots
    }

    /// Bus address of a slot
    pub fn bus_addr(&self, slot: u32) -> u64 {
        self.region.bus_addr() + u64::from(slot) * DESC_SIZE as u64
    }

    /// Stamp every slot with the magic tag and a link to its successor
    pub fn initialize(&self) {
        for slot in 0..self.slots {
            let mut d = Descriptor::new(0, 0, 0);
            if slot + 1 < self.slots {
                d.next_addr = self.bus_addr(slot + 1);
            }
            self.write(slot, &d);
        }
    }

    /// Write a whole descriptor
    pub fn write(&self, slot: u32, desc: &Descriptor) {
        self.region.write_words(Self::offset(slot), &desc.to_words());
    }

    /// Read a whole descriptor
    pub fn read(&self, slot: u32) -> Descriptor {
        let mut w = [0u32; DESC_WORDS];
        self.region.read_words(Self::offset(slot), &mut w);
        Descriptor::from_words(w)
    }

    fn update(&self, slot: u32, f: impl FnOnce(&mut Descriptor)) {
        let mut d = self.read(slot);
        f(&mut d);
        self.write(slot, &d);
    }

    fn offset(slot: u32) -> usize {
        slot as usize * DESC_SIZE
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DescSet {
    /// Descriptors placed and not yet credited
    fill: u32,
    /// Terminal bits stamped
    capped: bool,
}

/// Ready sets linked into one hardware submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    /// Index of the first set
    pub first_set: u32,
    /// Bus address of the first descriptor
    pub first_bus: u64,
    /// Descriptors in the first set
    pub first_count: u32,
    /// Descriptors across the chain
    pub total: u32,
    /// Sets in the chain
    pub sets: u32,
}

/// Ring of descriptor sets
#[derive(Debug)]
pub struct Ring {
    arena: DescriptorArena,
    sets: Vec<DescSet>,
    depth: u32,
    pidx: u32,
    cidx: u32,
    sw_cidx: u32,
    avail_sets: u32,
    sets_ready: u32,
    in_flight_sets: u32,
    page_clamp: bool,
}

impl Ring {
    /// Ring over `arena` split into sets of `depth`
    pub fn new(arena: DescriptorArena, depth: u32, page_clamp: bool) -> Self {
        let count = arena.slots() / depth;
        Self {
            arena,
            sets: vec![DescSet::default(); count as usize],
            depth,
            pidx: 0,
            cidx: 0,
            sw_cidx: 0,
            avail_sets: count,
            sets_ready: 0,
            in_flight_sets: 0,
            page_clamp,
        }
    }

    /// Number of sets
    #[allow(clippy::cast_possible_truncation)]
    pub fn count(&self) -> u32 {
        self.sets.len() as u32
    }

    /// Descriptors per set
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// The set at `pidx`, if it can be filled
    ///
    /// Does not advance `pidx`; the set stays open until [`Ring::close_set`].
    ///
    /// # Errors
    ///
    /// Returns `Busy` when every set is ready or awaiting completion.
    pub fn acquire_open_set(&self) -> Result<u32> {
        if self.avail_sets == 0 {
            return Err(DmaError::busy("no descriptor set available"));
        }
        let s = self.sets[self.pidx as usize];
        if s.capped {
            return Err(DmaError::busy("descriptor set at pidx still capped"));
        }
        Ok(self.pidx)
    }

    /// Free slots left in a set
    pub fn remaining(&self, set: u32) -> u32 {
        self.depth - self.sets[set as usize].fill
    }

    /// Descriptors currently resident in a set
    pub fn fill(&self, set: u32) -> u32 {
        self.sets[set as usize].fill
    }

    /// Place a descriptor at the next free slot of `set`, linked to the
    /// slot after it. Returns the slot index.
    pub fn place(&mut self, set: u32, mut desc: Descriptor) -> u32 {
        let s = &mut self.sets[set as usize];
        debug_assert!(!s.capped && s.fill < self.depth);
        let slot = set * self.depth + s.fill;
        s.fill += 1;
        desc.next_addr = if slot + 1 < self.arena.slots() {
            self.arena.bus_addr(slot + 1)
        } else {
            0
        };
        self.arena.write(slot, &desc);
        slot
    }

    /// Flag the descriptor at `slot` as the end of a transfer
    pub fn mark_eop(&self, slot: u32) {
        self.arena.update(slot, |d| d.set_flags(flags::EOP));
    }

    /// Cap a filled set: terminal STOP+COMPLETED, adjacent counts, unused
    /// slots invalidated. Advances `pidx` and moves the set to ready.
    pub fn close_set(&mut self, set: u32) {
        let fill = self.sets[set as usize].fill;
        if fill == 0 || self.sets[set as usize].capped {
            return;
        }
        let base = set * self.depth;
        for i in 0..fill {
            let slot = base + i;
            let extra = self.extra_adjacent(slot, fill - i - 1);
            self.arena.update(slot, |d| d.set_extra_adjacent(extra));
        }
        self.arena.update(base + fill - 1, Descriptor::terminate);
        for i in fill..self.depth {
            self.arena.update(base + i, |d| d.control = 0);
        }

        self.sets[set as usize].capped = true;
        self.pidx = self.next(self.pidx);
        self.avail_sets -= 1;
        self.sets_ready += 1;
        tracing::debug!(
            "closed set {set} ({fill} desc), pidx={} avail={} ready={}",
            self.pidx,
            self.avail_sets,
            self.sets_ready
        );
    }

    /// Link up to `max_sets` ready sets, oldest first, into one chain
    ///
    /// Earlier sets lose their terminal bits so the engine runs straight
    /// through; the last set keeps STOP+COMPLETED.
    pub fn chain_ready_sets(&mut self, max_sets: u32) -> Option<Chain> {
        if self.sets_ready == 0 || max_sets == 0 {
            return None;
        }
        let first_set = self.sw_cidx;
        let first_count = self.sets[first_set as usize].fill;
        let mut chain = Chain {
            first_set,
            first_bus: self.arena.bus_addr(first_set * self.depth),
            first_count,
            total: first_count,
            sets: 1,
        };
        let mut prev = first_set;
        self.take_ready();

        while self.sets_ready > 0 && chain.sets < max_sets {
            let next = self.sw_cidx;
            let last_slot = prev * self.depth + self.sets[prev as usize].fill - 1;
            let next_bus = self.arena.bus_addr(next * self.depth);
            self.arena.update(last_slot, |d| d.link_to(next_bus));
            chain.total += self.sets[next as usize].fill;
            chain.sets += 1;
            prev = next;
            self.take_ready();
        }
        self.in_flight_sets += chain.sets;
        Some(chain)
    }

    /// Undo a chain the engine refused to start
    pub fn requeue(&mut self, chain: &Chain) {
        self.sw_cidx = chain.first_set;
        self.sets_ready += chain.sets;
        self.in_flight_sets -= chain.sets;
    }

    /// Credit `n` completed descriptors against the oldest in-flight sets
    ///
    /// Returns the count that could not be attributed to any in-flight set.
    pub fn free_completed(&mut self, n: u32) -> u32 {
        let mut left = n;
        while left > 0 && self.in_flight_sets > 0 {
            let s = &mut self.sets[self.cidx as usize];
            let credit = left.min(s.fill);
            if credit == 0 {
                break;
            }
            s.fill -= credit;
            left -= credit;
            if s.fill == 0 {
                s.capped = false;
                self.cidx = self.next(self.cidx);
                self.avail_sets += 1;
                self.in_flight_sets -= 1;
                tracing::debug!("freed set, cidx={} avail={}", self.cidx, self.avail_sets);
            }
        }
        left
    }

    /// Drop every set back to available and re-link the arena
    pub fn reset(&mut self) {
        self.sets.iter_mut().for_each(|s| *s = DescSet::default());
        self.pidx = 0;
        self.cidx = 0;
        self.sw_cidx = 0;
        self.avail_sets = self.count();
        self.sets_ready = 0;
        self.in_flight_sets = 0;
        self.arena.initialize();
    }

    /// Value for the first-descriptor-adjacent register of a chain
    pub fn first_adjacent(&self, chain: &Chain) -> u32 {
        let mut extra = chain
            .first_count
            .saturating_sub(1)
            .min(self.depth - 1)
            .min(MAX_EXTRA_ADJACENT);
        if self.page_clamp {
            extra = extra.min(Self::page_room(chain.first_bus));
        }
        extra
    }

    /// Extra adjacent count for `slot` with `following` descriptors after
    /// it in the same set
    fn extra_adjacent(&self, slot: u32, following: u32) -> u32 {
        let mut extra = following
            .saturating_sub(1)
            .min(self.depth - 1)
            .min(MAX_EXTRA_ADJACENT);
        if self.page_clamp && following > 0 {
            extra = extra.min(Self::page_room(self.arena.bus_addr(slot + 1)));
        }
        extra
    }

    /// Descriptors after the one at `bus` that fit in its page
    #[allow(clippy::cast_possible_truncation)]
    fn page_room(bus: u64) -> u32 {
        let left = ADJACENT_PAGE - bus % ADJACENT_PAGE;
        (left / DESC_SIZE as u64).saturating_sub(1) as u32
    }

    fn take_ready(&mut self) {
        self.sw_cidx = self.next(self.sw_cidx);
        self.sets_ready -= 1;
    }

    fn next(&self, idx: u32) -> u32 {
        (idx + 1) % self.count()
    }

    /// Read back a descriptor
    pub fn descriptor(&self, slot: u32) -> Descriptor {
        self.arena.read(slot)
    }

    /// Slot index of `offset` within `set`
    pub const fn slot(&self, set: u32, offset: u32) -> u32 {
        set * self.depth + offset
    }

    /// Sets free for filling (the open set included)
    pub const fn avail_sets(&self) -> u32 {
        self.avail_sets
    }

    /// Closed sets awaiting submission
    pub const fn sets_ready(&self) -> u32 {
        self.sets_ready
    }

    /// Sets handed to the engine and not yet fully credited
    pub const fn in_flight_sets(&self) -> u32 {
        self.in_flight_sets
    }

    /// Producer, consumer and submission indices
    pub const fn indices(&self) -> (u32, u32, u32) {
        (self.pidx, self.cidx, self.sw_cidx)
    }

    /// `avail + ready + in_flight == count`
    pub fn is_consistent(&self) -> bool {
        self.avail_sets + self.sets_ready + self.in_flight_sets == self.count()
    }
}
