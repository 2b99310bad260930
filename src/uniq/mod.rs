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

use crate::error::{Result, UniqError};
use crate::field::{FieldList, FieldRole};
use crate::merge::MergeIter;
use crate::record::Sink;
use crate::table::BinTable;
use crate::temp::RunLayout;

/// Aggregation of records arriving in arbitrary order.
pub mod random;
/// Aggregation of record streams already sorted by the key.
pub mod sorted;

/// One aggregated bin: the packed key and value images plus the distinct
/// cardinality of each declared distinct field, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinRow {
    /// Packed key image.
    pub key: Vec<u8>,
    /// Packed value image.
    pub value: Vec<u8>,
    /// Distinct cardinalities.
    pub distinct_counts: Vec<u64>,
}

/// The three compiled field lists a pipeline runs with.
#[derive(Debug, Clone)]
pub(crate) struct FieldBundle {
    pub key: Arc<FieldList>,
    pub value: Arc<FieldList>,
    pub distinct: Arc<FieldList>,
}

impl FieldBundle {
    pub fn new(key: FieldList, value: FieldList, distinct: FieldList) -> Result<Self> {
        if key.role() != FieldRole::Key
            || value.role() != FieldRole::Value
            || distinct.role() != FieldRole::Distinct
        {
            return Err(UniqError::config(
                "field lists passed in the wrong role positions".to_string(),
            ));
        }
        if key.is_empty() {
            return Err(UniqError::config(
                "at least one key field is required".to_string(),
            ));
        }
        if let Some(dup) = key.overlap_with(&distinct) {
            return Err(UniqError::config(format!(
                "distinct field {dup} duplicates a key field"
            )));
        }
        Ok(Self {
            key: Arc::new(key),
            value: Arc::new(value),
            distinct: Arc::new(distinct),
        })
    }

    pub fn has_distinct(&self) -> bool {
        !self.distinct.is_empty()
    }

    pub fn layout(&self) -> RunLayout {
        RunLayout {
            key_width: self.key.width(),
            value_width: self.value.width(),
            distinct_widths: self.distinct.entry_widths(),
        }
    }
}

/// Iterator over a pipeline's aggregated bins.
///
/// Borrowed from the engine that produced it; bins come out key-ascending
/// whenever sorted output was requested, any spill occurred, or the input
/// was presorted. Otherwise the order is the hash table's insertion order,
/// which is an observable convenience and not a guarantee.
pub struct UniqIter<'a> {
    inner: IterInner<'a>,
}

enum IterInner<'a> {
    Mem {
        table: &'a BinTable,
        order: Vec<u32>,
        pos: usize,
    },
    Merge(MergeIter),
    Failed,
}

impl<'a> UniqIter<'a> {
    pub(crate) fn mem(table: &'a BinTable, order: Vec<u32>) -> Self {
        Self {
            inner: IterInner::Mem {
                table,
                order,
                pos: 0,
            },
        }
    }

    pub(crate) fn merge(iter: MergeIter) -> Self {
        Self {
            inner: IterInner::Merge(iter),
        }
    }

    /// Drain the iterator into a sink.
    pub fn forward(self, sink: &mut impl Sink) -> Result<()> {
        for row in self {
            let row = row?;
            sink.emit(&row.key, &row.value, &row.distinct_counts)
                .map_err(UniqError::Sink)?;
        }
        Ok(())
    }
}

impl Iterator for UniqIter<'_> {
    type Item = Result<BinRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            IterInner::Mem { table, order, pos } => {
                let idx = *order.get(*pos)? as usize;
                *pos += 1;
                let counts = table.counters_at(idx).iter().map(|c| c.count()).collect();
                Some(Ok(BinRow {
                    key: table.key_at(idx).to_vec(),
                    value: table.value_at(idx).to_vec(),
                    distinct_counts: counts,
                }))
            }
            IterInner::Merge(m) => match m.next_row() {
                Ok(row) => row.map(Ok),
                Err(e) => {
                    self.inner = IterInner::Failed;
                    Some(Err(e))
                }
            },
            IterInner::Failed => None,
        }
    }
}
