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
use std::sync::Arc;

use crate::config::UniqConfig;
use crate::distinct::{DistinctCounter, DistinctInsert};
use crate::error::{Result, UniqError};
use crate::field::{FieldList, MAX_LIST_OCTETS};
use crate::merge::{build_merge_iter, MergeConfig, MergeIter};
use crate::record::{FlowRecord, RecordSource};
use crate::temp::{Run, RunWriter, TempFileContext};
use crate::uniq::{BinRow, FieldBundle};
use crate::utils::MemBudget;

/// Heap entry: one source's current record with its packed key. Same shape
/// as the run-merge heads, but over live record streams instead of runs.
struct StreamHead {
    key: Vec<u8>,
    record: FlowRecord,
    source: usize,
    key_list: Arc<FieldList>,
}

impl PartialEq for StreamHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for StreamHead {}

impl PartialOrd for StreamHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_list
            .compare(&self.key, &other.key)
            .then(self.source.cmp(&other.source))
    }
}

/// The running accumulator for the bin currently being assembled.
struct CurrentBin {
    key: Vec<u8>,
    value: Vec<u8>,
    counters: Vec<DistinctCounter>,
}

/// Aggregation pipeline for input already sorted by the key field list.
///
/// The caller hands over any number of record streams, each individually in
/// ascending key order; a heap merges them into one logical stream and bins
/// complete one at a time, so only a single accumulator lives in memory.
/// Streams beyond the merge fan-in are first aggregated batchwise into
/// temporary runs and unified by the cascading run merge.
pub struct SortedUniq {
    config: UniqConfig,
    bundle: FieldBundle,
    budget: Arc<MemBudget>,
    temp: TempFileContext,
}

impl SortedUniq {
    /// Build a pipeline over the given field selection.
    pub fn new(
        config: UniqConfig,
        key: FieldList,
        value: FieldList,
        distinct: FieldList,
    ) -> Result<Self> {
        config.validate()?;
        if config.total_distinct {
            return Err(UniqError::config(
                "total_distinct is not available with presorted input".to_string(),
            ));
        }
        let bundle = FieldBundle::new(key, value, distinct)?;
        let budget = Arc::new(MemBudget::new(config.distinct_mem_bytes));
        let temp = TempFileContext::new(config.temp_dir.clone());
        Ok(Self {
            config,
            bundle,
            budget,
            temp,
        })
    }

    /// Consume the presorted streams and iterate the aggregated bins, in
    /// key order. Each source must yield keys ascending under the key field
    /// list's compare; that is the caller's contract.
    pub fn process(
        &mut self,
        sources: Vec<Box<dyn RecordSource>>,
    ) -> Result<SortedIter<'_>> {
        if self.config.debug {
            tracing::info!(sources = sources.len(), "presorted aggregation started");
        }
        if sources.len() > self.config.merge_fan_in {
            tracing::debug!(
                sources = sources.len(),
                fan_in = self.config.merge_fan_in,
                "presorted input exceeds fan-in, aggregating batchwise"
            );
            let runs = self.batch_prepass(sources)?;
            let cfg = self.merge_config();
            let merge = build_merge_iter(&mut self.temp, runs, cfg)?;
            return Ok(SortedIter {
                owner: self,
                state: SortedState::Drain(merge),
            });
        }
        let mut sources = sources;
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for source in 0..sources.len() {
            refill(&self.bundle, &mut sources, source, &mut heap)?;
        }
        Ok(SortedIter {
            owner: self,
            state: SortedState::Stream(StreamState {
                sources,
                heap,
                current: None,
                run: None,
            }),
        })
    }

    fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            key_list: Arc::clone(&self.bundle.key),
            value_list: Arc::clone(&self.bundle.value),
            layout: self.bundle.layout(),
            fan_in: self.config.merge_fan_in,
        }
    }

    /// Aggregate the streams a fan-in's worth at a time, one temporary run
    /// per batch.
    fn batch_prepass(&mut self, mut sources: Vec<Box<dyn RecordSource>>) -> Result<Vec<Run>> {
        let fan_in = self.config.merge_fan_in;
        let mut runs = Vec::new();
        while !sources.is_empty() {
            let take = fan_in.min(sources.len());
            let batch: Vec<Box<dyn RecordSource>> = sources.drain(..take).collect();
            runs.push(self.aggregate_batch(batch)?);
        }
        Ok(runs)
    }

    fn aggregate_batch(&mut self, mut batch: Vec<Box<dyn RecordSource>>) -> Result<Run> {
        let run = self.temp.create_run(self.bundle.has_distinct())?;
        let writer = RunWriter::create(&run)?;
        let mut run_slot = Some((run, writer));

        let mut heap = BinaryHeap::with_capacity(batch.len());
        for source in 0..batch.len() {
            refill(&self.bundle, &mut batch, source, &mut heap)?;
        }

        let mut current: Option<CurrentBin> = None;
        while let Some(Reverse(head)) = heap.pop() {
            let StreamHead {
                key,
                record,
                source,
                ..
            } = head;
            refill(&self.bundle, &mut batch, source, &mut heap)?;

            let same = matches!(
                &current,
                Some(bin) if self.bundle.key.compare(&bin.key, &key) == Ordering::Equal
            );
            if same {
                let Some(bin) = current.as_mut() else {
                    unreachable!("current bin vanished");
                };
                fold_record(&self.bundle, &mut self.temp, &mut run_slot, bin, &record)?;
            } else {
                if let Some(done) = current.take() {
                    let Some((_, writer)) = run_slot.as_mut() else {
                        unreachable!("batch run writer vanished");
                    };
                    write_bin(writer, &done)?;
                }
                let mut bin = new_bin(&self.bundle, &self.budget, key)?;
                fold_record(&self.bundle, &mut self.temp, &mut run_slot, &mut bin, &record)?;
                current = Some(bin);
            }
        }
        let Some((run, mut writer)) = run_slot.take() else {
            unreachable!("batch run writer vanished");
        };
        if let Some(done) = current.take() {
            write_bin(&mut writer, &done)?;
        }
        writer.finish()?;
        Ok(run)
    }
}

struct StreamState {
    sources: Vec<Box<dyn RecordSource>>,
    heap: BinaryHeap<Reverse<StreamHead>>,
    current: Option<CurrentBin>,
    /// Engaged on the first mid-bin memory refusal; from then on completed
    /// bins accumulate on disk and the tail of the output comes from the
    /// run merge.
    run: Option<(Run, RunWriter)>,
}

enum SortedState {
    Stream(StreamState),
    Drain(MergeIter),
    Done,
}

enum Action {
    Yield(BinRow),
    Continue,
    Finish,
}

/// Iterator over the presorted pipeline's bins, borrowed from the engine.
pub struct SortedIter<'a> {
    owner: &'a mut SortedUniq,
    state: SortedState,
}

impl SortedIter<'_> {
    /// Drain the iterator into a sink.
    pub fn forward(self, sink: &mut impl crate::record::Sink) -> Result<()> {
        for row in self {
            let row = row?;
            sink.emit(&row.key, &row.value, &row.distinct_counts)
                .map_err(UniqError::Sink)?;
        }
        Ok(())
    }

    fn next_impl(&mut self) -> Result<Option<BinRow>> {
        loop {
            let action = match &mut self.state {
                SortedState::Done => return Ok(None),
                SortedState::Drain(m) => return m.next_row(),
                SortedState::Stream(st) => {
                    let owner = &mut *self.owner;
                    match st.heap.pop() {
                        None => Action::Finish,
                        Some(Reverse(head)) => {
                            let StreamHead {
                                key,
                                record,
                                source,
                                ..
                            } = head;
                            refill(&owner.bundle, &mut st.sources, source, &mut st.heap)?;

                            let same = matches!(
                                &st.current,
                                Some(bin)
                                    if owner.bundle.key.compare(&bin.key, &key)
                                        == Ordering::Equal
                            );
                            if same {
                                let Some(bin) = st.current.as_mut() else {
                                    unreachable!("current bin vanished");
                                };
                                fold_record(
                                    &owner.bundle,
                                    &mut owner.temp,
                                    &mut st.run,
                                    bin,
                                    &record,
                                )?;
                                Action::Continue
                            } else {
                                debug_assert!(
                                    st.current.as_ref().map_or(true, |bin| {
                                        owner.bundle.key.compare(&key, &bin.key)
                                            != Ordering::Less
                                    }),
                                    "presorted input out of order"
                                );
                                // Retire the completed bin first: dropping
                                // its counters returns their budget before
                                // the next bin allocates its own.
                                let pending = match st.current.take() {
                                    None => None,
                                    Some(done) => match st.run.as_mut() {
                                        Some((_, writer)) => {
                                            write_bin(writer, &done)?;
                                            None
                                        }
                                        None => Some(bin_to_row(done)),
                                    },
                                };
                                let mut bin = new_bin(&owner.bundle, &owner.budget, key)?;
                                fold_record(
                                    &owner.bundle,
                                    &mut owner.temp,
                                    &mut st.run,
                                    &mut bin,
                                    &record,
                                )?;
                                st.current = Some(bin);
                                match pending {
                                    Some(row) => Action::Yield(row),
                                    None => Action::Continue,
                                }
                            }
                        }
                    }
                }
            };
            match action {
                Action::Yield(row) => return Ok(Some(row)),
                Action::Continue => continue,
                Action::Finish => {
                    let state = std::mem::replace(&mut self.state, SortedState::Done);
                    let SortedState::Stream(st) = state else {
                        unreachable!("finish outside the streaming state");
                    };
                    match st.run {
                        None => return Ok(st.current.map(bin_to_row)),
                        Some((run, mut writer)) => {
                            if let Some(done) = st.current {
                                write_bin(&mut writer, &done)?;
                            }
                            writer.finish()?;
                            let cfg = self.owner.merge_config();
                            let merge =
                                build_merge_iter(&mut self.owner.temp, vec![run], cfg)?;
                            self.state = SortedState::Drain(merge);
                        }
                    }
                }
            }
        }
    }
}

impl Iterator for SortedIter<'_> {
    type Item = Result<BinRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_impl() {
            Ok(row) => row.map(Ok),
            Err(e) => {
                self.state = SortedState::Done;
                Some(Err(e))
            }
        }
    }
}

/// Pull the next record of `source` onto the heap, packing its key.
fn refill(
    bundle: &FieldBundle,
    sources: &mut [Box<dyn RecordSource>],
    source: usize,
    heap: &mut BinaryHeap<Reverse<StreamHead>>,
) -> Result<()> {
    if let Some(record) = sources[source]
        .next_record()
        .map_err(UniqError::RecordIo)?
    {
        let mut key = vec![0u8; bundle.key.width()];
        bundle.key.pack(&record, &mut key)?;
        heap.push(Reverse(StreamHead {
            key,
            record,
            source,
            key_list: Arc::clone(&bundle.key),
        }));
    }
    Ok(())
}

fn new_bin(bundle: &FieldBundle, budget: &Arc<MemBudget>, key: Vec<u8>) -> Result<CurrentBin> {
    let mut value = vec![0u8; bundle.value.width()];
    bundle.value.initialize(&mut value);
    let mut counters = Vec::with_capacity(bundle.distinct.len());
    for width in bundle.distinct.entry_widths() {
        counters.push(
            DistinctCounter::try_new(width, Arc::clone(budget)).ok_or(
                UniqError::ResourceExhausted("allocating counters for a presorted bin"),
            )?,
        );
    }
    Ok(CurrentBin {
        key,
        value,
        counters,
    })
}

/// Fold one record into the current bin: distinct bytes first, then the
/// value contribution. A refused counter insert flushes the bin as a
/// partial segment to the temp run (engaging the run if this is the first
/// refusal), resets the accumulator, and retries once.
fn fold_record(
    bundle: &FieldBundle,
    temp: &mut TempFileContext,
    run_slot: &mut Option<(Run, RunWriter)>,
    bin: &mut CurrentBin,
    record: &FlowRecord,
) -> Result<()> {
    if bundle.has_distinct() {
        let mut buf = [0u8; 16];
        for (field, width) in bundle.distinct.entry_widths().into_iter().enumerate() {
            bundle.distinct.pack_entry(field, record, &mut buf[..width])?;
            if bin.counters[field].insert(&buf[..width]) == DistinctInsert::OutOfMemory {
                let writer = ensure_run(bundle, temp, run_slot)?;
                write_bin(writer, bin)?;
                reset_bin(bundle, bin);
                if bin.counters[field].insert(&buf[..width]) == DistinctInsert::OutOfMemory {
                    return Err(UniqError::ResourceExhausted(
                        "distinct insert after flushing the current bin",
                    ));
                }
            }
        }
    }
    let mut contrib = [0u8; MAX_LIST_OCTETS];
    let width = bundle.value.width();
    bundle.value.pack(record, &mut contrib[..width])?;
    bundle.value.merge(&mut bin.value, &contrib[..width])?;
    Ok(())
}

fn ensure_run<'a>(
    bundle: &FieldBundle,
    temp: &mut TempFileContext,
    run_slot: &'a mut Option<(Run, RunWriter)>,
) -> Result<&'a mut RunWriter> {
    if run_slot.is_none() {
        tracing::debug!("presorted pipeline switched to temp-run output");
        let run = temp.create_run(bundle.has_distinct())?;
        let writer = RunWriter::create(&run)?;
        *run_slot = Some((run, writer));
    }
    match run_slot.as_mut() {
        Some((_, writer)) => Ok(writer),
        None => unreachable!("run writer just engaged"),
    }
}

/// Write the accumulator as one run segment: counts, images, payload.
fn write_bin(writer: &mut RunWriter, bin: &CurrentBin) -> Result<()> {
    let counts: Vec<u64> = bin.counters.iter().map(|c| c.count()).collect();
    writer.write_bin(&bin.key, &bin.value, &counts)?;
    for counter in &bin.counters {
        counter.for_each_sorted(|bytes| {
            writer.write_distinct_value(bytes).map_err(UniqError::from)
        })?;
    }
    Ok(())
}

fn reset_bin(bundle: &FieldBundle, bin: &mut CurrentBin) {
    bundle.value.initialize(&mut bin.value);
    for counter in &mut bin.counters {
        counter.reset();
    }
}

fn bin_to_row(bin: CurrentBin) -> BinRow {
    let distinct_counts = bin.counters.iter().map(|c| c.count()).collect();
    BinRow {
        key: bin.key,
        value: bin.value,
        distinct_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldId, FieldRole};
    use crate::record::VecSource;
    use crate::utils::read_be_uint;

    fn lists(distinct: &[FieldId]) -> (FieldList, FieldList, FieldList) {
        let mut key = FieldList::new(FieldRole::Key);
        key.add_field(FieldId::SrcAddr).unwrap();
        let mut value = FieldList::new(FieldRole::Value);
        value.add_field(FieldId::SumBytes).unwrap();
        value.add_field(FieldId::SumPackets).unwrap();
        let mut d = FieldList::new(FieldRole::Distinct);
        for id in distinct {
            d.add_field(*id).unwrap();
        }
        (key, value, d)
    }

    fn rec(src: &str, dst: &str, bytes: u64, packets: u64) -> FlowRecord {
        FlowRecord {
            src_addr: src.parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
            bytes,
            packets,
            ..FlowRecord::default()
        }
    }

    fn sources(groups: Vec<Vec<FlowRecord>>) -> Vec<Box<dyn RecordSource>> {
        groups
            .into_iter()
            .map(|g| Box::new(VecSource::new(g)) as Box<dyn RecordSource>)
            .collect()
    }

    fn drain(iter: SortedIter<'_>) -> Vec<(Vec<u8>, u64, u64, Vec<u64>)> {
        iter.map(|row| {
            let row = row.unwrap();
            (
                row.key.clone(),
                read_be_uint(&row.value[..8]),
                read_be_uint(&row.value[8..16]),
                row.distinct_counts,
            )
        })
        .collect()
    }

    #[test]
    fn single_presorted_stream_aggregates_adjacent_keys() {
        let (key, value, distinct) = lists(&[]);
        let mut uniq = SortedUniq::new(UniqConfig::default(), key, value, distinct).unwrap();
        let input = vec![
            rec("10.0.0.1", "10.0.0.2", 100, 1),
            rec("10.0.0.1", "10.0.0.3", 200, 2),
            rec("10.0.0.1", "10.0.0.2", 50, 1),
            rec("10.0.0.4", "10.0.0.2", 10, 1),
        ];
        let rows = drain(uniq.process(sources(vec![input])).unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].1, rows[0].2), (350, 4));
        assert_eq!((rows[1].1, rows[1].2), (10, 1));
        assert!(rows[0].0 < rows[1].0);
    }

    #[test]
    fn multiple_streams_interleave_by_key() {
        let (key, value, distinct) = lists(&[FieldId::DstAddr]);
        let mut uniq = SortedUniq::new(UniqConfig::default(), key, value, distinct).unwrap();
        let a = vec![
            rec("10.0.0.1", "10.1.0.1", 10, 1),
            rec("10.0.0.3", "10.1.0.2", 30, 1),
        ];
        let b = vec![
            rec("10.0.0.1", "10.1.0.2", 1, 1),
            rec("10.0.0.2", "10.1.0.1", 20, 1),
            rec("10.0.0.3", "10.1.0.2", 3, 1),
        ];
        let rows = drain(uniq.process(sources(vec![a, b])).unwrap());
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].1, rows[0].3.clone()), (11, vec![2]));
        assert_eq!((rows[1].1, rows[1].3.clone()), (20, vec![1]));
        assert_eq!((rows[2].1, rows[2].3.clone()), (33, vec![1]));
    }

    #[test]
    fn mid_bin_memory_refusal_flushes_and_recovers() {
        let (key, value, distinct) = lists(&[FieldId::DstAddr]);
        let config = UniqConfig {
            // Room for one small list but never for a hash escalation, so
            // every 33rd distinct value flushes a partial segment.
            distinct_mem_bytes: 1_024,
            ..UniqConfig::default()
        };
        let mut uniq = SortedUniq::new(config, key, value, distinct).unwrap();
        let mut input = Vec::new();
        for i in 0..100u32 {
            input.push(rec(
                "10.0.0.1",
                &format!("10.1.{}.{}", i / 200, i % 200 + 1),
                1,
                1,
            ));
        }
        input.push(rec("10.0.0.9", "10.1.0.1", 5, 1));
        let rows = drain(uniq.process(sources(vec![input])).unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].1, rows[0].2), (100, 100));
        assert_eq!(rows[0].3, vec![100]);
        assert_eq!((rows[1].1, rows[1].3.clone()), (5, vec![1]));
    }

    #[test]
    fn output_stays_sorted_across_the_switch_to_run_mode() {
        // Early bins fit in memory and are emitted directly; a later bin
        // overflows its counter and drags the tail of the output through a
        // temp run. The observable sequence must stay one ascending,
        // exactly-aggregated stream.
        let (key, value, distinct) = lists(&[FieldId::DstAddr]);
        let config = UniqConfig {
            distinct_mem_bytes: 1_024,
            ..UniqConfig::default()
        };
        let mut uniq = SortedUniq::new(config, key, value, distinct).unwrap();

        let mut input = Vec::new();
        // Two small bins first.
        for i in 1..=2u8 {
            input.push(rec(&format!("10.0.0.{i}"), "10.1.0.1", 1, 1));
            input.push(rec(&format!("10.0.0.{i}"), "10.1.0.2", 1, 1));
        }
        // A bin with enough distinct values to refuse escalation.
        for d in 1..=80u8 {
            input.push(rec("10.0.0.3", &format!("10.1.1.{d}"), 1, 1));
        }
        // More bins after the switch.
        for i in 4..=5u8 {
            input.push(rec(&format!("10.0.0.{i}"), "10.1.0.1", 2, 1));
        }

        let rows = drain(uniq.process(sources(vec![input])).unwrap());
        assert_eq!(rows.len(), 5);
        let key_list = {
            let mut list = FieldList::new(crate::field::FieldRole::Key);
            list.add_field(FieldId::SrcAddr).unwrap();
            list
        };
        for pair in rows.windows(2) {
            assert_eq!(
                key_list.compare(&pair[0].0, &pair[1].0),
                Ordering::Less
            );
        }
        assert_eq!(rows[0].3, vec![2]);
        assert_eq!(rows[1].3, vec![2]);
        assert_eq!((rows[2].1, rows[2].2, rows[2].3.clone()), (80, 80, vec![80]));
        assert_eq!((rows[3].1, rows[3].3.clone()), (2, vec![1]));
        assert_eq!((rows[4].1, rows[4].3.clone()), (2, vec![1]));
    }

    #[test]
    fn streams_beyond_the_fan_in_run_batchwise() {
        let (key, value, distinct) = lists(&[FieldId::DstAddr]);
        let config = UniqConfig {
            merge_fan_in: 2,
            ..UniqConfig::default()
        };
        let mut uniq = SortedUniq::new(config, key, value, distinct).unwrap();
        let mut groups = Vec::new();
        for s in 0..3u8 {
            groups.push(vec![
                rec("10.0.0.1", &format!("10.1.0.{}", s + 1), 10, 1),
                rec("10.0.0.2", "10.1.0.1", 1, 1),
            ]);
        }
        let rows = drain(uniq.process(sources(groups)).unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].1, rows[0].3.clone()), (30, vec![3]));
        assert_eq!((rows[1].1, rows[1].3.clone()), (3, vec![1]));
    }

    #[test]
    fn total_distinct_is_rejected_for_presorted_input() {
        let (key, value, distinct) = lists(&[FieldId::DstAddr]);
        let config = UniqConfig {
            total_distinct: true,
            ..UniqConfig::default()
        };
        assert!(matches!(
            SortedUniq::new(config, key, value, distinct),
            Err(UniqError::InvalidConfiguration(_))
        ));
    }
}
