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

use std::sync::Arc;

use crate::error::Result;
use crate::utils::{read_be_u128, write_be_u128, MemBudget};

/// 256-entry bitmap for one-octet fields.
pub mod bitmap;
/// Open hash of values beyond the small-list capacity.
pub mod hashset;
/// Sorted contiguous array for small cardinalities.
pub mod small;

use self::bitmap::Bitmap256;
use self::hashset::ValueHash;
use self::small::{SmallInsert, SmallList};

/// A small list escalates to a hash once it holds this many values.
pub const SMALL_LIST_MAX: usize = 32;

/// Estimated footprint of a freshly created counter.
const BASE_FOOTPRINT: usize = 128 + SMALL_LIST_MAX * 16;
/// Estimated footprint of an empty hash representation.
const HASH_BASE_FOOTPRINT: usize = 1024;
/// Estimated per-value footprint inside the hash representation.
const HASH_ENTRY_FOOTPRINT: usize = 48;

/// Outcome of one [`DistinctCounter::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctInsert {
    /// The value was not present before.
    Added,
    /// The value was already counted.
    AlreadyPresent,
    /// The memory budget refused the insert; the counter is unchanged. The
    /// pipeline is expected to spill and retry.
    OutOfMemory,
}

/// Which representation a counter currently uses. Transitions are strictly
/// forward: `Bitmap` is terminal, `SortedSmallList` escalates to `HashSet`,
/// and nothing downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// 256-bit bitmap, one-octet fields only.
    Bitmap,
    /// Sorted contiguous array of up to [`SMALL_LIST_MAX`] values.
    SortedSmallList,
    /// Open hash for anything larger.
    HashSet,
}

#[derive(Debug)]
enum Repr {
    Bitmap(Bitmap256),
    Small(SmallList),
    Hash(ValueHash),
}

/// Exact count of the unique values of one field inside one bin.
///
/// Values are handled as their big-endian numeric image, so enumeration in
/// numeric order is enumeration in bytewise order. Every counter charges its
/// footprint against the engine's [`MemBudget`] and refunds it on drop.
#[derive(Debug)]
pub struct DistinctCounter {
    width: usize,
    repr: Repr,
    budget: Arc<MemBudget>,
    charged: usize,
}

impl DistinctCounter {
    /// Create a counter for values of `width` octets. Returns `None` when the
    /// budget cannot fund the base footprint.
    pub fn try_new(width: usize, budget: Arc<MemBudget>) -> Option<Self> {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8 | 16));
        if !budget.try_charge(BASE_FOOTPRINT) {
            return None;
        }
        let repr = if width == 1 {
            Repr::Bitmap(Bitmap256::new())
        } else {
            Repr::Small(SmallList::new())
        };
        Some(Self {
            width,
            repr,
            budget,
            charged: BASE_FOOTPRINT,
        })
    }

    /// Width of the counted values in octets.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of unique values inserted so far.
    pub fn count(&self) -> u64 {
        match &self.repr {
            Repr::Bitmap(b) => b.count(),
            Repr::Small(s) => s.count(),
            Repr::Hash(h) => h.count(),
        }
    }

    /// Current representation.
    pub fn representation(&self) -> Representation {
        match &self.repr {
            Repr::Bitmap(_) => Representation::Bitmap,
            Repr::Small(_) => Representation::SortedSmallList,
            Repr::Hash(_) => Representation::HashSet,
        }
    }

    /// Insert one packed value (`width` octets).
    pub fn insert(&mut self, value: &[u8]) -> DistinctInsert {
        debug_assert_eq!(value.len(), self.width);
        let v = read_be_u128(value);
        match &mut self.repr {
            Repr::Bitmap(b) => {
                if b.insert(v as u8) {
                    DistinctInsert::Added
                } else {
                    DistinctInsert::AlreadyPresent
                }
            }
            Repr::Small(s) => match s.insert(v) {
                SmallInsert::Added => DistinctInsert::Added,
                SmallInsert::AlreadyPresent => DistinctInsert::AlreadyPresent,
                SmallInsert::Full => self.escalate(v),
            },
            Repr::Hash(h) => {
                if h.contains(v) {
                    return DistinctInsert::AlreadyPresent;
                }
                if !self.budget.try_charge(HASH_ENTRY_FOOTPRINT) {
                    return DistinctInsert::OutOfMemory;
                }
                self.charged += HASH_ENTRY_FOOTPRINT;
                h.insert(v);
                DistinctInsert::Added
            }
        }
    }

    /// Move the small list into a hash and insert the value that overflowed
    /// it. Contents carry over bit-exact; on a refused charge nothing moves.
    fn escalate(&mut self, pending: u128) -> DistinctInsert {
        let small = match &mut self.repr {
            Repr::Small(s) => s,
            _ => unreachable!("escalation outside the small representation"),
        };
        let cost = HASH_BASE_FOOTPRINT + (small.count() as usize + 1) * HASH_ENTRY_FOOTPRINT;
        if !self.budget.try_charge(cost) {
            return DistinctInsert::OutOfMemory;
        }
        self.charged += cost;
        let mut hash = ValueHash::with_capacity(SMALL_LIST_MAX * 2);
        for v in small.values() {
            hash.insert(*v);
        }
        hash.insert(pending);
        self.repr = Repr::Hash(hash);
        DistinctInsert::Added
    }

    /// Visit every distinct value in ascending bytewise order. The callback
    /// receives the packed `width`-octet image.
    pub fn for_each_sorted<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut buf = [0u8; 16];
        let width = self.width;
        let mut emit = |v: u128| -> Result<()> {
            write_be_u128(&mut buf[..width], v);
            f(&buf[..width])
        };
        match &self.repr {
            Repr::Bitmap(b) => b.for_each(|byte| emit(u128::from(byte))),
            Repr::Small(s) => {
                for v in s.values() {
                    emit(*v)?;
                }
                Ok(())
            }
            Repr::Hash(h) => {
                let mut values = h.values();
                values.sort_unstable();
                for v in values {
                    emit(v)?;
                }
                Ok(())
            }
        }
    }

    /// Empty the counter. The hash representation swaps in fresh backing
    /// storage so the released memory returns to the budget immediately.
    pub fn reset(&mut self) {
        match &mut self.repr {
            Repr::Bitmap(b) => b.reset(),
            Repr::Small(s) => s.reset(),
            Repr::Hash(h) => {
                let released = self.charged - BASE_FOOTPRINT;
                self.budget.refund(released);
                self.charged = BASE_FOOTPRINT;
                *h = ValueHash::with_capacity(0);
            }
        }
    }
}

impl Drop for DistinctCounter {
    fn drop(&mut self) {
        self.budget.refund(self.charged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(width: usize) -> DistinctCounter {
        DistinctCounter::try_new(width, Arc::new(MemBudget::unlimited())).unwrap()
    }

    fn be(v: u64, width: usize) -> Vec<u8> {
        let mut buf = vec![0u8; width];
        crate::utils::write_be_uint(&mut buf, v);
        buf
    }

    #[test]
    fn one_octet_fields_use_the_terminal_bitmap() {
        let mut c = counter(1);
        assert_eq!(c.representation(), Representation::Bitmap);
        for b in 0..=255u64 {
            assert_eq!(c.insert(&be(b, 1)), DistinctInsert::Added);
        }
        for b in 0..=255u64 {
            assert_eq!(c.insert(&be(b, 1)), DistinctInsert::AlreadyPresent);
        }
        assert_eq!(c.count(), 256);
        assert_eq!(c.representation(), Representation::Bitmap);
    }

    #[test]
    fn escalates_on_the_thirty_third_value() {
        let mut c = counter(4);
        for v in 0..32u64 {
            assert_eq!(c.insert(&be(v, 4)), DistinctInsert::Added);
            assert_eq!(c.representation(), Representation::SortedSmallList);
        }
        assert_eq!(c.insert(&be(32, 4)), DistinctInsert::Added);
        assert_eq!(c.representation(), Representation::HashSet);
        assert_eq!(c.count(), 33);
    }

    #[test]
    fn escalation_preserves_membership() {
        let mut c = counter(4);
        for v in 0..40u64 {
            c.insert(&be(v * 7, 4));
        }
        assert_eq!(c.count(), 40);
        for v in 0..40u64 {
            assert_eq!(c.insert(&be(v * 7, 4)), DistinctInsert::AlreadyPresent);
        }
    }

    #[test]
    fn enumerates_in_ascending_order_across_representations() {
        for n in [5u64, 40] {
            let mut c = counter(4);
            // Insert in descending order to make sorting observable.
            for v in (0..n).rev() {
                c.insert(&be(v * 3, 4));
            }
            let mut seen = Vec::new();
            c.for_each_sorted(|bytes| {
                seen.push(crate::utils::read_be_uint(bytes));
                Ok(())
            })
            .unwrap();
            let expected: Vec<u64> = (0..n).map(|v| v * 3).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn full_width_values_round_trip() {
        // 16-octet values exercise the entire u128 image.
        let mut c = counter(16);
        let hi = [0xffu8; 16];
        let mut lo = [0xffu8; 16];
        lo[0] = 0x00;
        assert_eq!(c.insert(&hi), DistinctInsert::Added);
        assert_eq!(c.insert(&lo), DistinctInsert::Added);
        assert_eq!(c.insert(&hi), DistinctInsert::AlreadyPresent);
        let mut seen = Vec::new();
        c.for_each_sorted(|bytes| {
            seen.push(bytes.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![lo.to_vec(), hi.to_vec()]);
    }

    #[test]
    fn refused_budget_reports_out_of_memory_and_keeps_state() {
        let budget = Arc::new(MemBudget::new(BASE_FOOTPRINT + HASH_BASE_FOOTPRINT));
        let mut c = DistinctCounter::try_new(8, budget).unwrap();
        for v in 0..32u64 {
            assert_eq!(c.insert(&be(v, 8)), DistinctInsert::Added);
        }
        // Escalation cannot be funded.
        assert_eq!(c.insert(&be(32, 8)), DistinctInsert::OutOfMemory);
        assert_eq!(c.count(), 32);
        assert_eq!(c.representation(), Representation::SortedSmallList);
        // Known values still answer normally.
        assert_eq!(c.insert(&be(5, 8)), DistinctInsert::AlreadyPresent);
    }

    #[test]
    fn reset_releases_hash_budget() {
        let budget = Arc::new(MemBudget::unlimited());
        let mut c = DistinctCounter::try_new(4, Arc::clone(&budget)).unwrap();
        for v in 0..100u64 {
            c.insert(&be(v, 4));
        }
        let charged_before = budget.used();
        c.reset();
        assert!(budget.used() < charged_before);
        assert_eq!(c.count(), 0);
        assert_eq!(c.insert(&be(1, 4)), DistinctInsert::Added);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn dropping_refunds_the_budget() {
        let budget = Arc::new(MemBudget::unlimited());
        {
            let mut c = DistinctCounter::try_new(4, Arc::clone(&budget)).unwrap();
            for v in 0..100u64 {
                c.insert(&be(v, 4));
            }
            assert!(budget.used() > 0);
        }
        assert_eq!(budget.used(), 0);
    }
}
