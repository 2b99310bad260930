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

use std::io::{BufWriter, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::config::UniqConfig;
use crate::distinct::{DistinctCounter, DistinctInsert};
use crate::error::{Result, UniqError};
use crate::field::FieldList;
use crate::merge::{build_merge_iter, count_distinct_files, MergeConfig};
use crate::record::FlowRecord;
use crate::table::{BinTable, Slot};
use crate::temp::{Run, RunWriter, TempFileContext};
use crate::uniq::{FieldBundle, UniqIter};
use crate::utils::MemBudget;

/// Cross-bin distinct counting for the first distinct field. Owns its own
/// spill files: a refused insert drains the counter to disk, resets it and
/// retries, and the spilled generations are unified by a k-way merge at
/// output time.
struct TotalDistinct {
    width: usize,
    counter: DistinctCounter,
    files: Vec<NamedTempFile>,
}

impl TotalDistinct {
    fn new(width: usize, budget: Arc<MemBudget>) -> Result<Self> {
        let counter = DistinctCounter::try_new(width, budget)
            .ok_or(UniqError::ResourceExhausted("allocating the total-distinct counter"))?;
        Ok(Self {
            width,
            counter,
            files: Vec::new(),
        })
    }

    fn insert(&mut self, value: &[u8], temp: &mut TempFileContext) -> Result<()> {
        match self.counter.insert(value) {
            DistinctInsert::Added | DistinctInsert::AlreadyPresent => Ok(()),
            DistinctInsert::OutOfMemory => {
                self.spill(temp)?;
                match self.counter.insert(value) {
                    DistinctInsert::OutOfMemory => Err(UniqError::ResourceExhausted(
                        "total-distinct insert after spilling",
                    )),
                    _ => Ok(()),
                }
            }
        }
    }

    fn spill(&mut self, temp: &mut TempFileContext) -> Result<()> {
        let file = temp.create_values_file()?;
        let mut writer = BufWriter::new(file.as_file().try_clone()?);
        self.counter
            .for_each_sorted(|bytes| writer.write_all(bytes).map_err(UniqError::from))?;
        writer.flush()?;
        tracing::debug!(
            values = self.counter.count(),
            generation = self.files.len(),
            "total-distinct counter spilled"
        );
        self.files.push(file);
        self.counter.reset();
        Ok(())
    }

    fn finish(&mut self, temp: &mut TempFileContext, fan_in: usize) -> Result<u64> {
        if self.files.is_empty() {
            return Ok(self.counter.count());
        }
        if self.counter.count() > 0 {
            self.spill(temp)?;
        }
        let files = std::mem::take(&mut self.files);
        count_distinct_files(temp, files, self.width, fan_in)
    }

    fn teardown(&mut self) {
        self.files.clear();
        self.counter.reset();
    }
}

/// Aggregation pipeline for records arriving in arbitrary order.
///
/// Records accumulate in an in-memory bin table. Whenever anything runs out
/// of room — the table itself, a distinct counter, the total-distinct
/// counter — the table is sorted, streamed to a temporary run and emptied,
/// and the insert is retried exactly once. Output is a merging iterator over
/// the in-memory table and every run written along the way.
///
/// ```
/// use flowbin::{FieldId, FieldList, FieldRole, FlowRecord, RandomUniq, UniqConfig};
///
/// # fn main() -> flowbin::Result<()> {
/// let mut key = FieldList::new(FieldRole::Key);
/// key.add_field(FieldId::SrcAddr)?;
/// let mut value = FieldList::new(FieldRole::Value);
/// value.add_field(FieldId::SumBytes)?;
/// let distinct = FieldList::new(FieldRole::Distinct);
///
/// let mut uniq = RandomUniq::new(UniqConfig::default(), key, value, distinct)?;
/// uniq.add(&FlowRecord { bytes: 100, ..FlowRecord::default() })?;
/// uniq.prepare_for_output()?;
/// for row in uniq.iter()? {
///     let row = row?;
///     assert_eq!(row.value, 100u64.to_be_bytes());
/// }
/// # Ok(())
/// # }
/// ```
pub struct RandomUniq {
    config: UniqConfig,
    bundle: FieldBundle,
    budget: Arc<MemBudget>,
    table: BinTable,
    temp: TempFileContext,
    runs: Vec<Run>,
    total: Option<TotalDistinct>,
    total_count: Option<u64>,
    prepared: bool,
    key_buf: Vec<u8>,
    contrib_buf: Vec<u8>,
}

impl RandomUniq {
    /// Build a pipeline over the given field selection. Surfaces every
    /// configuration problem here, before the first record.
    pub fn new(
        config: UniqConfig,
        key: FieldList,
        value: FieldList,
        distinct: FieldList,
    ) -> Result<Self> {
        config.validate()?;
        let bundle = FieldBundle::new(key, value, distinct)?;
        if config.total_distinct && !bundle.has_distinct() {
            return Err(UniqError::config(
                "total_distinct requires at least one distinct field".to_string(),
            ));
        }
        let budget = Arc::new(MemBudget::new(config.distinct_mem_bytes));
        let table = BinTable::new(
            bundle.key.width(),
            bundle.value.width(),
            config.bin_capacity,
        );
        let temp = TempFileContext::new(config.temp_dir.clone());
        let total = match config.total_distinct {
            true => {
                let width = bundle.distinct.entry_widths()[0];
                Some(TotalDistinct::new(width, Arc::clone(&budget))?)
            }
            false => None,
        };
        let key_buf = vec![0; bundle.key.width()];
        let contrib_buf = vec![0; bundle.value.width()];
        Ok(Self {
            config,
            bundle,
            budget,
            table,
            temp,
            runs: Vec::new(),
            total,
            total_count: None,
            prepared: false,
            key_buf,
            contrib_buf,
        })
    }

    /// Fold one record into its bin. On memory pressure the table spills and
    /// the insert retries once; a second refusal is an error.
    pub fn add(&mut self, record: &FlowRecord) -> Result<()> {
        if self.prepared {
            return Err(UniqError::config(
                "add called after prepare_for_output".to_string(),
            ));
        }
        if !self.try_add(record)? {
            self.spill()?;
            if !self.try_add(record)? {
                return Err(UniqError::ResourceExhausted("inserting a bin after spilling"));
            }
        }
        if self.total.is_some() {
            let mut buf = [0u8; 16];
            let width = self.bundle.distinct.entry_widths()[0];
            self.bundle.distinct.pack_entry(0, record, &mut buf[..width])?;
            if let Some(total) = &mut self.total {
                total.insert(&buf[..width], &mut self.temp)?;
            }
        }
        Ok(())
    }

    /// One insert attempt. `Ok(false)` means some allocation was refused and
    /// the caller should spill and retry; the record's value contribution
    /// has not been merged in that case. Distinct bytes may already have
    /// entered some counters, which is harmless: spilled distinct values are
    /// unified by union, so the retry cannot double-count them.
    fn try_add(&mut self, record: &FlowRecord) -> Result<bool> {
        self.bundle.key.pack(record, &mut self.key_buf)?;
        let slot = match self.table.lookup_or_insert(&self.key_buf) {
            None => return Ok(false),
            Some(slot) => slot,
        };
        let idx = match slot {
            Slot::New(idx) => {
                self.bundle.value.initialize(self.table.value_mut(idx));
                if self.bundle.has_distinct() {
                    let widths = self.bundle.distinct.entry_widths();
                    let mut counters = Vec::with_capacity(widths.len());
                    for width in widths {
                        match DistinctCounter::try_new(width, Arc::clone(&self.budget)) {
                            Some(counter) => counters.push(counter),
                            None => {
                                // The half-built bin stays behind as a merge
                                // identity; the spilled union absorbs it.
                                self.table.set_counters(idx, counters.into_boxed_slice());
                                return Ok(false);
                            }
                        }
                    }
                    self.table.set_counters(idx, counters.into_boxed_slice());
                }
                idx
            }
            Slot::Existing(idx) => idx,
        };

        // Distinct bytes first, value contribution second: a refused counter
        // insert must leave the value image untouched or the retry would
        // double-count the record.
        if self.bundle.has_distinct() {
            let mut buf = [0u8; 16];
            for (field, width) in self.bundle.distinct.entry_widths().into_iter().enumerate() {
                self.bundle.distinct.pack_entry(field, record, &mut buf[..width])?;
                if self.table.counters_mut(idx)[field].insert(&buf[..width])
                    == DistinctInsert::OutOfMemory
                {
                    return Ok(false);
                }
            }
        }
        self.bundle.value.pack(record, &mut self.contrib_buf)?;
        self.bundle
            .value
            .merge(self.table.value_mut(idx), &self.contrib_buf)?;
        Ok(true)
    }

    /// Sort the table by key, stream it to a fresh run, and empty it.
    fn spill(&mut self) -> Result<()> {
        let order = self.table.sorted_indices(&self.bundle.key);
        let run = self.temp.create_run(self.bundle.has_distinct())?;
        let mut writer = RunWriter::create(&run)?;
        let n_distinct = self.bundle.distinct.len();
        let mut counts = Vec::with_capacity(n_distinct);
        for &idx in &order {
            let idx = idx as usize;
            let counters = self.table.counters_at(idx);
            counts.clear();
            for field in 0..n_distinct {
                counts.push(counters.get(field).map(|c| c.count()).unwrap_or(0));
            }
            writer.write_bin(self.table.key_at(idx), self.table.value_at(idx), &counts)?;
            for counter in counters {
                counter.for_each_sorted(|bytes| {
                    writer.write_distinct_value(bytes).map_err(UniqError::from)
                })?;
            }
        }
        writer.finish()?;
        if self.config.debug {
            tracing::info!(
                bins = self.table.len(),
                run = run.seq,
                runs = self.runs.len() + 1,
                budget = self.budget.used(),
                "bin table spilled to temp run"
            );
        } else {
            tracing::debug!(
                bins = self.table.len(),
                run = run.seq,
                "bin table spilled to temp run"
            );
        }
        self.runs.push(run);
        self.table.reset();
        Ok(())
    }

    /// Close the input side. If anything spilled, the in-memory remainder is
    /// flushed too so output is purely a merge of runs; the total-distinct
    /// count is resolved here as well.
    pub fn prepare_for_output(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.prepared = true;
        if !self.runs.is_empty() && !self.table.is_empty() {
            self.spill()?;
        }
        let fan_in = self.config.merge_fan_in;
        if let Some(total) = &mut self.total {
            self.total_count = Some(total.finish(&mut self.temp, fan_in)?);
        }
        if self.config.debug {
            tracing::info!(
                bins = self.table.len(),
                runs = self.runs.len(),
                "input side closed"
            );
        }
        Ok(())
    }

    /// Iterate the aggregated bins. Valid after [`RandomUniq::prepare_for_output`];
    /// when runs exist they are consumed, so the merge-backed iteration
    /// happens once.
    pub fn iter(&mut self) -> Result<UniqIter<'_>> {
        if !self.prepared {
            return Err(UniqError::config(
                "iter called before prepare_for_output".to_string(),
            ));
        }
        if self.runs.is_empty() {
            let order = match self.config.sort_output {
                true => self.table.sorted_indices(&self.bundle.key),
                false => self.table.iter_insertion().map(|i| i as u32).collect(),
            };
            return Ok(UniqIter::mem(&self.table, order));
        }
        let runs = std::mem::take(&mut self.runs);
        let cfg = MergeConfig {
            key_list: Arc::clone(&self.bundle.key),
            value_list: Arc::clone(&self.bundle.value),
            layout: self.bundle.layout(),
            fan_in: self.config.merge_fan_in,
        };
        let merge = build_merge_iter(&mut self.temp, runs, cfg)?;
        Ok(UniqIter::merge(merge))
    }

    /// Distinct values of the first distinct field across all bins. Valid
    /// after [`RandomUniq::prepare_for_output`] on a pipeline configured
    /// with `total_distinct`.
    pub fn total_distinct_count(&self) -> Result<u64> {
        self.total_count.ok_or_else(|| {
            UniqError::config(
                "total distinct count unavailable: enable total_distinct and call prepare_for_output"
                    .to_string(),
            )
        })
    }

    /// Release every run, counter and table slot. Idempotent; dropping the
    /// pipeline does the same thing, so this exists for callers that want
    /// the disk space back before the value goes out of scope.
    pub fn teardown(&mut self) {
        self.runs.clear();
        self.table.reset();
        if let Some(total) = &mut self.total {
            total.teardown();
        }
        self.prepared = true;
    }

    #[cfg(test)]
    pub(crate) fn spill_count(&self) -> usize {
        self.runs.len()
    }
}
