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

use super::SMALL_LIST_MAX;

/// Outcome of a [`SmallList::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallInsert {
    /// Inserted in place.
    Added,
    /// Already a member.
    AlreadyPresent,
    /// The list is at capacity and the value is new; escalate.
    Full,
}

/// Sorted contiguous array of up to [`SMALL_LIST_MAX`] values. Keeping it
/// sorted makes membership a binary search and enumeration free.
#[derive(Debug)]
pub struct SmallList {
    values: Vec<u128>,
}

impl SmallList {
    /// Create an empty list with its full capacity reserved up front.
    pub fn new() -> Self {
        Self {
            values: Vec::with_capacity(SMALL_LIST_MAX),
        }
    }

    /// Insert `value`, keeping the array sorted.
    pub fn insert(&mut self, value: u128) -> SmallInsert {
        match self.values.binary_search(&value) {
            Ok(_) => SmallInsert::AlreadyPresent,
            Err(pos) => {
                if self.values.len() == SMALL_LIST_MAX {
                    return SmallInsert::Full;
                }
                self.values.insert(pos, value);
                SmallInsert::Added
            }
        }
    }

    /// Number of members.
    pub fn count(&self) -> u64 {
        self.values.len() as u64
    }

    /// Members in ascending order.
    pub fn values(&self) -> &[u128] {
        &self.values
    }

    /// Remove all members.
    pub fn reset(&mut self) {
        self.values.clear();
    }
}

impl Default for SmallList {
    fn default() -> Self {
        Self::new()
    }
}
