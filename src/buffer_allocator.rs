//! `BufferAllocator` (spec §4.3): a best-fit, single-threaded slot allocator
//! over one linear byte range.
//!
//! Ported from a reference buffer allocator that kept a doubly-linked list
//! of slots in offset order, a multimap from free size to slot, and a
//! hashmap from offset to slot, all three updated together on every
//! mutation. This port keeps the same three views but replaces the
//! pointer-linked list with index links into a `Vec` arena, the multimap
//! with a `BTreeMap<size, BTreeSet<index>>` (`lower_bound` becomes
//! `range(size..).next()`), and the offset hashmap with an `FxHashMap`
//! (spec §9 "Manager pointers vs indices").

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Opaque identifier for an allocated slot. Encodes the slot's offset:
/// `id = offset / slot_size + 1`. Zero means "unallocated"; `u32::MAX`
/// means "the previous allocate call said REALLOCATION_REQUIRED".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(u32);

impl AllocationId {
    pub const UNALLOCATED: AllocationId = AllocationId(0);
    pub const REALLOCATION_REQUIRED: AllocationId = AllocationId(u32::MAX);

    #[must_use]
    pub fn is_allocated(self) -> bool {
        self.0 != 0 && self.0 != u32::MAX
    }
}

/// Outcome of [`BufferAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Allocated { id: AllocationId, offset: u32 },
    ReallocationRequired,
}

#[derive(Debug, Clone)]
struct Slot {
    offset: u32,
    size: u32,
    is_allocated: bool,
    gpu_use_count: u32,
    pending_free: bool,
    prev: Option<u32>,
    next: Option<u32>,
    /// The size key this slot is currently registered under in
    /// `free_by_size`, if any. `None` means either allocated, or free but
    /// not yet re-admitted by `release_free_slots`.
    registered_size: Option<u32>,
}

pub struct BufferAllocator {
    slot_size: u32,
    total_size: u32,
    slots: Vec<Slot>,
    free_by_size: BTreeMap<u32, BTreeSet<u32>>,
    offset_to_slot: FxHashMap<u32, u32>,
    head: Option<u32>,
}

impl BufferAllocator {
    /// `total_size` and `slot_size` must both be non-zero; `slot_size` must
    /// be a power of two, and `total_size` a multiple of it.
    #[must_use]
    pub fn new(total_size: u32, slot_size: u32) -> Self {
        debug_assert!(slot_size.is_power_of_two());
        debug_assert_eq!(total_size % slot_size, 0);
        let mut allocator = Self {
            slot_size,
            total_size: 0,
            slots: Vec::new(),
            free_by_size: BTreeMap::new(),
            offset_to_slot: FxHashMap::default(),
            head: None,
        };
        allocator.reset(total_size);
        allocator
    }

    #[must_use]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    #[must_use]
    pub fn align_up(&self, size: u32) -> u32 {
        (size + self.slot_size - 1) & !(self.slot_size - 1)
    }

    #[must_use]
    pub fn calculate_id_by_offset(&self, offset: u32) -> AllocationId {
        AllocationId(offset / self.slot_size + 1)
    }

    #[must_use]
    pub fn get_allocation_offset(&self, id: AllocationId) -> u32 {
        debug_assert!(id.is_allocated());
        (id.0 - 1) * self.slot_size
    }

    fn is_free(&self, index: u32) -> bool {
        let slot = &self.slots[index as usize];
        !slot.is_allocated && slot.gpu_use_count == 0
    }

    fn remove_from_free_by_size(&mut self, index: u32) {
        if let Some(size) = self.slots[index as usize].registered_size.take() {
            if let Some(set) = self.free_by_size.get_mut(&size) {
                set.remove(&index);
                if set.is_empty() {
                    self.free_by_size.remove(&size);
                }
            }
        }
    }

    fn insert_into_free_by_size(&mut self, index: u32, size: u32) {
        self.free_by_size.entry(size).or_default().insert(index);
        self.slots[index as usize].registered_size = Some(size);
    }

    /// Best-fit allocation of `size` bytes, rounded up to `slot_size`.
    pub fn allocate(&mut self, size: u32) -> AllocationOutcome {
        let size = self.align_up(size);
        let Some((&best_size, set)) = self.free_by_size.range(size..).next() else {
            return AllocationOutcome::ReallocationRequired;
        };
        let index = *set.iter().next().expect("free-size bucket is never empty");
        self.remove_from_free_by_size(index);

        self.slots[index as usize].is_allocated = true;
        self.slots[index as usize].gpu_use_count = 0;
        self.slots[index as usize].pending_free = false;

        if best_size > size {
            let remainder_offset = self.slots[index as usize].offset + size;
            let remainder_size = best_size - size;
            self.slots[index as usize].size = size;

            let remainder_index = self.slots.len() as u32;
            let old_next = self.slots[index as usize].next;
            self.slots.push(Slot {
                offset: remainder_offset,
                size: remainder_size,
                is_allocated: false,
                gpu_use_count: 0,
                pending_free: false,
                prev: Some(index),
                next: old_next,
                registered_size: None,
            });
            if let Some(next) = old_next {
                self.slots[next as usize].prev = Some(remainder_index);
            }
            self.slots[index as usize].next = Some(remainder_index);
            self.offset_to_slot.insert(remainder_offset, remainder_index);
            self.insert_into_free_by_size(remainder_index, remainder_size);
        }

        let offset = self.slots[index as usize].offset;
        AllocationOutcome::Allocated {
            id: self.calculate_id_by_offset(offset),
            offset,
        }
    }

    fn index_for(&self, id: AllocationId) -> u32 {
        let offset = self.get_allocation_offset(id);
        *self
            .offset_to_slot
            .get(&offset)
            .expect("AllocationId must refer to a live slot")
    }

    /// Marks the slot as no longer logically allocated. It is not re-admitted
    /// to the free list until [`BufferAllocator::release_free_slots`] runs.
    pub fn retire(&mut self, id: AllocationId) {
        let index = self.index_for(id);
        let slot = &mut self.slots[index as usize];
        slot.is_allocated = false;
        if slot.gpu_use_count == 0 {
            slot.pending_free = true;
        }
    }

    pub fn acquire_gpu(&mut self, id: AllocationId) {
        let index = self.index_for(id);
        self.slots[index as usize].gpu_use_count += 1;
    }

    pub fn release_gpu(&mut self, id: AllocationId) {
        let index = self.index_for(id);
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.gpu_use_count > 0);
        slot.gpu_use_count -= 1;
        if slot.gpu_use_count == 0 && !slot.is_allocated {
            slot.pending_free = true;
        }
    }

    #[must_use]
    pub fn gpu_in_flight(&self, id: AllocationId) -> bool {
        self.slots[self.index_for(id) as usize].gpu_use_count > 0
    }

    /// Sweeps the offset-ordered slot list once, coalescing every run of
    /// adjacent free slots into the first slot of the run and re-admitting
    /// it to the free-by-size index.
    pub fn release_free_slots(&mut self) {
        let mut current = self.head;
        while let Some(index) = current {
            let next_after_index = self.slots[index as usize].next;
            if self.is_free(index) {
                let run_start = index;
                let mut run_end = index;
                let mut merged_size = self.slots[index as usize].size;
                let mut scan = self.slots[index as usize].next;
                while let Some(n) = scan {
                    if self.is_free(n) {
                        merged_size += self.slots[n as usize].size;
                        run_end = n;
                        scan = self.slots[n as usize].next;
                    } else {
                        break;
                    }
                }

                if run_end != run_start {
                    let mut node = self.slots[run_start as usize].next;
                    loop {
                        let n = node.expect("run_end must be reachable from run_start");
                        let next_node = self.slots[n as usize].next;
                        self.remove_from_free_by_size(n);
                        self.offset_to_slot.remove(&self.slots[n as usize].offset);
                        let is_last = n == run_end;
                        node = next_node;
                        if is_last {
                            break;
                        }
                    }
                    let after = self.slots[run_end as usize].next;
                    self.slots[run_start as usize].next = after;
                    if let Some(a) = after {
                        self.slots[a as usize].prev = Some(run_start);
                    }
                    self.slots[run_start as usize].size = merged_size;
                }

                self.remove_from_free_by_size(run_start);
                let size = self.slots[run_start as usize].size;
                self.insert_into_free_by_size(run_start, size);
                self.slots[run_start as usize].pending_free = false;
                current = self.slots[run_start as usize].next;
            } else {
                current = next_after_index;
            }
        }
    }

    /// Rebuilds the allocator as a single free slot spanning
    /// `[0, new_total_size)`. `new_total_size` must be a multiple of
    /// `slot_size`.
    pub fn reset(&mut self, new_total_size: u32) {
        debug_assert_eq!(new_total_size % self.slot_size, 0);
        self.slots.clear();
        self.free_by_size.clear();
        self.offset_to_slot.clear();
        self.total_size = new_total_size;

        self.slots.push(Slot {
            offset: 0,
            size: new_total_size,
            is_allocated: false,
            gpu_use_count: 0,
            pending_free: false,
            prev: None,
            next: None,
            registered_size: None,
        });
        self.head = Some(0);
        self.offset_to_slot.insert(0, 0);
        self.insert_into_free_by_size(0, new_total_size);
    }

    /// Iterates slots in offset order, yielding `(offset, size, is_free)`.
    /// Used by tests to check the coalescing invariant.
    pub fn iter_offset_order(&self) -> impl Iterator<Item = (u32, u32, bool)> + '_ {
        let mut current = self.head;
        std::iter::from_fn(move || {
            let index = current?;
            let slot = &self.slots[index as usize];
            current = slot.next;
            Some((slot.offset, slot.size, !slot.is_allocated && slot.gpu_use_count == 0))
        })
    }
}
