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

use std::collections::HashSet;

/// Hash membership set for cardinalities beyond the small list. Values are
/// already the big-endian numeric image, so `ahash` over `u128` is enough;
/// ordering happens once, at enumeration.
#[derive(Debug)]
pub struct ValueHash {
    set: HashSet<u128, ahash::RandomState>,
}

impl ValueHash {
    /// Create a set sized for `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity_and_hasher(capacity, ahash::RandomState::new()),
        }
    }

    /// Membership test.
    pub fn contains(&self, value: u128) -> bool {
        self.set.contains(&value)
    }

    /// Insert without a membership check; callers test first so the budget
    /// charge can precede the insert.
    pub fn insert(&mut self, value: u128) {
        self.set.insert(value);
    }

    /// Number of members.
    pub fn count(&self) -> u64 {
        self.set.len() as u64
    }

    /// Members in arbitrary order; the counter sorts on enumeration.
    pub fn values(&self) -> Vec<u128> {
        self.set.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let mut h = ValueHash::with_capacity(4);
        assert!(!h.contains(7));
        h.insert(7);
        assert!(h.contains(7));
        h.insert(7);
        assert_eq!(h.count(), 1);
    }
}
