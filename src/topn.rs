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

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::{Result, UniqError};
use crate::field::{FieldHandle, FieldId, FieldList};
use crate::uniq::BinRow;
use crate::utils::read_be_uint;

/// Ranking direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Keep the bins with the greatest designated aggregate.
    Top,
    /// Keep the bins with the smallest designated aggregate.
    Bottom,
}

/// How many bins to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopnLimit {
    /// Exactly this many bins.
    Count(usize),
    /// Every bin whose aggregate is at least (top) or at most (bottom) the
    /// threshold.
    Threshold(u64),
    /// Threshold computed at emit time as this percentage of the global sum
    /// of the designated aggregate.
    Percentage(u32),
}

/// The designated aggregate driving the ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankBy {
    /// A named field of the value list, read as a big-endian unsigned.
    Value(FieldId),
    /// The distinct count of a named distinct field.
    Distinct(FieldId),
}

enum RankSource {
    Value(FieldHandle),
    Distinct(usize),
}

/// Heap entry. `Ord` is strength: the greater entry deserves its slot more,
/// direction included, with earlier arrival winning ties. The heap stores
/// `Reverse` entries so its root is always the weakest survivor.
struct Ranked {
    rank: u64,
    seq: u64,
    direction: Direction,
    row: BinRow,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_rank = match self.direction {
            Direction::Top => self.rank.cmp(&other.rank),
            Direction::Bottom => other.rank.cmp(&self.rank),
        };
        by_rank.then(other.seq.cmp(&self.seq))
    }
}

/// Selects the K most extreme bins by one designated aggregate.
///
/// Consumes a pipeline's iterator and keeps a bounded heap
/// ([`TopnLimit::Count`]) or a growable one with a fixed-size fallback under
/// memory pressure ([`TopnLimit::Threshold`], [`TopnLimit::Percentage`]).
/// Emission order is strongest first; ties fall back to arrival order, so a
/// given input order always produces the same output.
pub struct TopNSelector {
    source: RankSource,
    direction: Direction,
    limit: TopnLimit,
    heap_cap: Option<usize>,
    capped: bool,
    heap: BinaryHeap<Reverse<Ranked>>,
    seq: u64,
    total: u64,
}

impl TopNSelector {
    /// Build a selector. `presorted` states whether the feeding pipeline is
    /// the presorted one, which the percentage limit cannot be combined
    /// with (the global sum is not available there). `heap_cap` bounds the
    /// growable modes; when the cap is hit the selector degrades to a
    /// fixed-size heap and says so in a diagnostic.
    pub fn new(
        value_list: &FieldList,
        distinct_list: &FieldList,
        rank_by: RankBy,
        direction: Direction,
        limit: TopnLimit,
        presorted: bool,
        heap_cap: Option<usize>,
    ) -> Result<Self> {
        let source = match rank_by {
            RankBy::Value(FieldId::Caller) | RankBy::Distinct(FieldId::Caller) => {
                return Err(UniqError::config(
                    "ranking by caller fields is unsupported".to_string(),
                ))
            }
            RankBy::Value(id) => RankSource::Value(value_list.find(id).ok_or_else(|| {
                UniqError::config(format!("ranking field {id:?} is not in the value list"))
            })?),
            RankBy::Distinct(id) => RankSource::Distinct(
                distinct_list
                    .find(id)
                    .ok_or_else(|| {
                        UniqError::config(format!(
                            "ranking field {id:?} is not in the distinct list"
                        ))
                    })?
                    .index,
            ),
        };
        if let TopnLimit::Percentage(p) = limit {
            if presorted {
                return Err(UniqError::config(
                    "percentage limit cannot be combined with presorted input".to_string(),
                ));
            }
            if p == 0 || p > 100 {
                return Err(UniqError::config(format!(
                    "percentage limit {p} is outside 1..=100"
                )));
            }
            let supported = matches!(
                rank_by,
                RankBy::Value(FieldId::RecordCount)
                    | RankBy::Value(FieldId::SumBytes)
                    | RankBy::Value(FieldId::SumPackets)
                    | RankBy::Distinct(_)
            );
            if !supported {
                return Err(UniqError::config(
                    "percentage limit is unsupported for this ranking field".to_string(),
                ));
            }
        }
        Ok(Self {
            source,
            direction,
            limit,
            heap_cap,
            capped: false,
            heap: BinaryHeap::new(),
            seq: 0,
            total: 0,
        })
    }

    fn rank_of(&self, row: &BinRow) -> u64 {
        match &self.source {
            RankSource::Value(handle) => {
                read_be_uint(&row.value[handle.offset..handle.offset + handle.width])
            }
            RankSource::Distinct(index) => row.distinct_counts[*index],
        }
    }

    fn meets(&self, rank: u64, threshold: u64) -> bool {
        match self.direction {
            Direction::Top => rank >= threshold,
            Direction::Bottom => rank <= threshold,
        }
    }

    fn push_bounded(&mut self, entry: Ranked, k: usize) {
        if k == 0 {
            return;
        }
        if self.heap.len() < k {
            self.heap.push(Reverse(entry));
            return;
        }
        if let Some(Reverse(weakest)) = self.heap.peek() {
            if entry > *weakest {
                self.heap.pop();
                self.heap.push(Reverse(entry));
            }
        }
    }

    fn push_growable(&mut self, entry: Ranked) {
        if !self.capped {
            if let Some(cap) = self.heap_cap {
                if self.heap.len() >= cap {
                    self.capped = true;
                    tracing::warn!(
                        fill = self.heap.len(),
                        "ranked-bin heap cannot grow, continuing at fixed size"
                    );
                }
            }
        }
        if self.capped {
            let k = self.heap.len();
            self.push_bounded(entry, k);
        } else {
            self.heap.push(Reverse(entry));
        }
    }

    /// Offer one bin.
    pub fn push(&mut self, row: BinRow) {
        let rank = self.rank_of(&row);
        let seq = self.seq;
        self.seq += 1;
        self.total = self.total.saturating_add(rank);
        let entry = Ranked {
            rank,
            seq,
            direction: self.direction,
            row,
        };
        match self.limit {
            TopnLimit::Count(k) => self.push_bounded(entry, k),
            TopnLimit::Threshold(t) => {
                if self.meets(rank, t) {
                    self.push_growable(entry);
                }
            }
            TopnLimit::Percentage(_) => self.push_growable(entry),
        }
    }

    /// Offer every bin of a pipeline iterator.
    pub fn consume<I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<BinRow>>,
    {
        for row in rows {
            self.push(row?);
        }
        Ok(())
    }

    /// Emit the selected bins, strongest first.
    pub fn finish(self) -> Vec<BinRow> {
        let mut entries: Vec<Ranked> = self.heap.into_iter().map(|Reverse(e)| e).collect();
        if let TopnLimit::Percentage(p) = self.limit {
            let threshold = (u128::from(self.total) * u128::from(p) / 100) as u64;
            let direction = self.direction;
            entries.retain(|e| match direction {
                Direction::Top => e.rank >= threshold,
                Direction::Bottom => e.rank <= threshold,
            });
        }
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.row).collect()
    }
}
