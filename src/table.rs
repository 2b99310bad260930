//  Copyright 2025 flowbin contributors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use crate::distinct::DistinctCounter;
use crate::field::FieldList;

const EMPTY: u32 = u32::MAX;

/// Result of a [`BinTable::lookup_or_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// The key was present; the index addresses its bin.
    Existing(usize),
    /// A bin was created for the key. Its value image is zeroed, not
    /// initialized, and its counter sidecar is empty.
    New(usize),
}

/// In-memory bin store for the random-order pipeline.
///
/// Open addressing over a slot array of dense indices; the packed key and
/// value images live in two flat slabs in insertion order, with the
/// distinct counters in a sidecar vector indexed the same way. Capacity is
/// fixed at construction: a full table is the signal to spill, not to grow.
///
/// Keys are compared for identity by their packed octets. Field packing is
/// canonical (equal values produce equal octets), so this agrees with the
/// key field list's compare.
pub(crate) struct BinTable {
    hasher: ahash::RandomState,
    slots: Vec<u32>,
    key_width: usize,
    value_width: usize,
    capacity: usize,
    keys: Vec<u8>,
    values: Vec<u8>,
    counters: Vec<Box<[DistinctCounter]>>,
}

impl BinTable {
    /// Create a table for at most `capacity` bins of the given image widths.
    /// The slot array is sized for a 0.75 load factor at full capacity.
    pub fn new(key_width: usize, value_width: usize, capacity: usize) -> Self {
        let slot_count = (capacity * 4 / 3 + 1).next_power_of_two().max(8);
        Self {
            hasher: ahash::RandomState::new(),
            slots: vec![EMPTY; slot_count],
            key_width,
            value_width,
            capacity,
            keys: Vec::new(),
            values: Vec::new(),
            counters: Vec::new(),
        }
    }

    /// Number of live bins.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the table holds no bins.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Find the bin for `key`, creating one when absent. Returns `None` when
    /// a bin would be needed but the table is at capacity.
    pub fn lookup_or_insert(&mut self, key: &[u8]) -> Option<Slot> {
        debug_assert_eq!(key.len(), self.key_width);
        let mask = self.slots.len() - 1;
        let mut slot = (self.hasher.hash_one(key) as usize) & mask;
        loop {
            match self.slots[slot] {
                EMPTY => {
                    if self.len() == self.capacity {
                        return None;
                    }
                    let dense = self.len();
                    self.slots[slot] = dense as u32;
                    self.keys.extend_from_slice(key);
                    self.values.resize(self.values.len() + self.value_width, 0);
                    self.counters.push(Vec::new().into_boxed_slice());
                    return Some(Slot::New(dense));
                }
                dense => {
                    let dense = dense as usize;
                    if self.key_at(dense) == key {
                        return Some(Slot::Existing(dense));
                    }
                    slot = (slot + 1) & mask;
                }
            }
        }
    }

    /// Packed key image of bin `index`.
    pub fn key_at(&self, index: usize) -> &[u8] {
        &self.keys[index * self.key_width..(index + 1) * self.key_width]
    }

    /// Packed value image of bin `index`.
    pub fn value_at(&self, index: usize) -> &[u8] {
        &self.values[index * self.value_width..(index + 1) * self.value_width]
    }

    /// Mutable packed value image of bin `index`.
    pub fn value_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.values[index * self.value_width..(index + 1) * self.value_width]
    }

    /// Distinct counters of bin `index`.
    pub fn counters_at(&self, index: usize) -> &[DistinctCounter] {
        &self.counters[index]
    }

    /// Mutable distinct counters of bin `index`.
    pub fn counters_mut(&mut self, index: usize) -> &mut [DistinctCounter] {
        &mut self.counters[index]
    }

    /// Attach the counter sidecar of a freshly created bin.
    pub fn set_counters(&mut self, index: usize, counters: Box<[DistinctCounter]>) {
        self.counters[index] = counters;
    }

    /// Bin indices in insertion order.
    pub fn iter_insertion(&self) -> impl Iterator<Item = usize> {
        0..self.len()
    }

    /// Bin indices ordered by the key field list's compare.
    pub fn sorted_indices(&self, key_list: &FieldList) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        order.sort_unstable_by(|&a, &b| {
            key_list.compare(self.key_at(a as usize), self.key_at(b as usize))
        });
        order
    }

    /// Drop every bin. Dropping the counters returns their budget; the slot
    /// array is reused.
    pub fn reset(&mut self) {
        self.slots.fill(EMPTY);
        self.keys.clear();
        self.values.clear();
        self.counters.clear();
    }
}
