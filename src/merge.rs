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
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::error::{Result, UniqError};
use crate::field::FieldList;
use crate::temp::{
    is_handle_exhaustion, read_or_eof, Run, RunLayout, RunReader, RunWriter, TempFileContext,
};
use crate::uniq::BinRow;
use crate::utils::{read_be_u128, write_be_u128};

/// Default merge fan-in: how many runs one pass may hold open.
pub const MAX_MERGE_FILES: usize = 1024;

/// Everything a merge pass needs to interpret run bytes.
#[derive(Clone)]
pub(crate) struct MergeConfig {
    pub key_list: Arc<FieldList>,
    pub value_list: Arc<FieldList>,
    pub layout: RunLayout,
    pub fan_in: usize,
}

/// Heap entry: one run's current key. The comparator travels inside the
/// entry so the standard max-heap can order entries by the key field list;
/// `Reverse` turns it into the min-heap the merge wants. Ties break on the
/// reader index, which keeps pass output deterministic.
struct RunHead {
    key: Vec<u8>,
    reader: usize,
    key_list: Arc<FieldList>,
}

impl PartialEq for RunHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunHead {}

impl PartialOrd for RunHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunHead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_list
            .compare(&self.key, &other.key)
            .then(self.reader.cmp(&other.reader))
    }
}

/// One merged bin plus, per distinct field, its merged unique values in
/// ascending order. Intermediate passes write the values back out; the
/// final pass only needs the counts already in the row.
pub(crate) struct MergedBin {
    pub row: BinRow,
    pub distinct_values: Vec<Vec<u128>>,
}

/// The shared merge loop: a min-heap of run readers, collapsing every run
/// segment that shares the minimum key into one output bin.
struct MergeCore {
    cfg: MergeConfig,
    readers: Vec<RunReader>,
    heap: BinaryHeap<Reverse<RunHead>>,
}

impl MergeCore {
    fn new(cfg: MergeConfig, mut readers: Vec<RunReader>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (idx, reader) in readers.iter_mut().enumerate() {
            if reader.advance()? {
                heap.push(Reverse(RunHead {
                    key: reader.key().to_vec(),
                    reader: idx,
                    key_list: Arc::clone(&cfg.key_list),
                }));
            }
        }
        Ok(Self { cfg, readers, heap })
    }

    /// Fold one segment (the current record of `reader`) into the
    /// accumulators, then advance the reader and put it back on the heap.
    fn fold_segment(
        &mut self,
        reader: usize,
        first: bool,
        value_acc: &mut [u8],
        sets: &mut [Vec<u128>],
    ) -> Result<()> {
        {
            let r = &mut self.readers[reader];
            if first {
                // A lone segment needs no merge; its bytes pass through.
                value_acc.copy_from_slice(r.value());
            } else {
                self.cfg.value_list.merge(value_acc, r.value())?;
            }
            let mut buf = [0u8; 16];
            for (field, width) in self.cfg.layout.distinct_widths.iter().enumerate() {
                let n = r.counts()[field];
                for _ in 0..n {
                    r.read_distinct_value(field, &mut buf[..*width])?;
                    sets[field].push(read_be_u128(&buf[..*width]));
                }
            }
        }
        let prev_key = self.readers[reader].key().to_vec();
        if self.readers[reader].advance()? {
            debug_assert!(
                self.cfg
                    .key_list
                    .compare(self.readers[reader].key(), &prev_key)
                    != Ordering::Less,
                "run {} keys out of order",
                self.readers[reader].seq()
            );
            self.heap.push(Reverse(RunHead {
                key: self.readers[reader].key().to_vec(),
                reader,
                key_list: Arc::clone(&self.cfg.key_list),
            }));
        }
        Ok(())
    }

    /// Produce the next merged bin, or `None` when every run is drained.
    fn next_merged(&mut self) -> Result<Option<MergedBin>> {
        let Some(Reverse(head)) = self.heap.pop() else {
            return Ok(None);
        };
        let key = head.key;
        let mut value_acc = vec![0u8; self.cfg.layout.value_width];
        let mut sets: Vec<Vec<u128>> =
            vec![Vec::new(); self.cfg.layout.distinct_widths.len()];

        let mut reader = head.reader;
        let mut first = true;
        loop {
            self.fold_segment(reader, first, &mut value_acc, &mut sets)?;
            first = false;
            // Active set: every segment whose key equals the minimum. A run
            // may surface again immediately (the presorted pipeline flushes
            // one logical bin in several pieces), so the heap is re-checked
            // after each fold rather than snapshotted up front.
            match self.heap.peek() {
                Some(Reverse(h)) if self.cfg.key_list.compare(&h.key, &key) == Ordering::Equal => {
                    let Some(Reverse(h)) = self.heap.pop() else {
                        unreachable!("peeked entry vanished");
                    };
                    reader = h.reader;
                }
                _ => break,
            }
        }

        let mut counts = Vec::with_capacity(sets.len());
        for set in sets.iter_mut() {
            set.sort_unstable();
            set.dedup();
            counts.push(set.len() as u64);
        }
        Ok(Some(MergedBin {
            row: BinRow {
                key,
                value: value_acc,
                distinct_counts: counts,
            },
            distinct_values: sets,
        }))
    }
}

/// Open run readers from the front of `runs`, up to the fan-in, stopping
/// early when the OS runs out of file handles with at least two open (two
/// is the minimum that still makes progress).
fn open_prefix(runs: &mut Vec<Run>, cfg: &MergeConfig) -> Result<(Vec<RunReader>, Vec<Run>)> {
    let mut readers = Vec::new();
    while readers.len() < runs.len() && readers.len() < cfg.fan_in {
        match RunReader::open(&runs[readers.len()], &cfg.layout) {
            Ok(r) => readers.push(r),
            Err(e) if is_handle_exhaustion(&e) => {
                if readers.len() >= 2 {
                    tracing::warn!(
                        open = readers.len(),
                        "file handles exhausted, merging with reduced fan-in"
                    );
                    break;
                }
                return Err(UniqError::ResourceExhausted("opening temp runs to merge"));
            }
            Err(e) => return Err(e.into()),
        }
    }
    let opened: Vec<Run> = runs.drain(..readers.len()).collect();
    Ok((readers, opened))
}

/// Collapse `runs` down to one final merging iterator, inserting
/// intermediate passes whenever more runs exist than one pass can open.
pub(crate) fn build_merge_iter(
    ctx: &mut TempFileContext,
    mut runs: Vec<Run>,
    cfg: MergeConfig,
) -> Result<MergeIter> {
    let mut pass = 0u32;
    loop {
        let (readers, opened) = open_prefix(&mut runs, &cfg)?;
        if runs.is_empty() {
            tracing::debug!(pass, runs = opened.len(), "final merge pass");
            let core = MergeCore::new(cfg, readers)?;
            return Ok(MergeIter {
                core,
                _runs: opened,
            });
        }

        pass += 1;
        tracing::debug!(
            pass,
            merging = opened.len(),
            remaining = runs.len(),
            "intermediate merge pass"
        );
        let out = ctx.create_run(cfg.layout.has_distinct())?;
        let mut writer = RunWriter::create(&out)?;
        let mut core = MergeCore::new(cfg.clone(), readers)?;
        let mut buf = [0u8; 16];
        while let Some(merged) = core.next_merged()? {
            writer.write_bin(&merged.row.key, &merged.row.value, &merged.row.distinct_counts)?;
            for (field, values) in merged.distinct_values.iter().enumerate() {
                let width = cfg.layout.distinct_widths[field];
                for v in values {
                    write_be_u128(&mut buf[..width], *v);
                    writer.write_distinct_value(&buf[..width])?;
                }
            }
        }
        writer.finish()?;
        // The absorbed runs delete themselves here.
        drop(core);
        drop(opened);
        runs.push(out);
    }
}

/// Merging iterator over the final generation of runs. Owns the run files;
/// they are deleted when the iterator is dropped.
pub(crate) struct MergeIter {
    core: MergeCore,
    _runs: Vec<Run>,
}

impl MergeIter {
    pub fn next_row(&mut self) -> Result<Option<BinRow>> {
        Ok(self.core.next_merged()?.map(|m| m.row))
    }
}

/// Streaming reader over one spilled file of sorted unique values.
struct ValueStream {
    reader: BufReader<File>,
    width: usize,
}

impl ValueStream {
    fn open(file: &NamedTempFile, width: usize) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(file.reopen()?),
            width,
        })
    }

    fn next_value(&mut self) -> Result<Option<u128>> {
        let mut buf = [0u8; 16];
        let width = self.width;
        if !read_or_eof(&mut self.reader, &mut buf[..width])? {
            return Ok(None);
        }
        Ok(Some(read_be_u128(&buf[..width])))
    }
}

/// K-way merge over sorted unique value files: counts the union, optionally
/// re-emitting it. Used by the total-distinct protocol, whose working sets
/// are far too large to union in memory.
fn merge_value_streams(
    mut streams: Vec<ValueStream>,
    mut emit: impl FnMut(u128) -> Result<()>,
) -> Result<u64> {
    let mut heap: BinaryHeap<Reverse<(u128, usize)>> = BinaryHeap::with_capacity(streams.len());
    for (idx, s) in streams.iter_mut().enumerate() {
        if let Some(v) = s.next_value()? {
            heap.push(Reverse((v, idx)));
        }
    }
    let mut unique = 0u64;
    let mut last: Option<u128> = None;
    while let Some(Reverse((v, idx))) = heap.pop() {
        if last != Some(v) {
            emit(v)?;
            last = Some(v);
            unique += 1;
        }
        if let Some(next) = streams[idx].next_value()? {
            heap.push(Reverse((next, idx)));
        }
    }
    Ok(unique)
}

/// Count the distinct values across a set of spilled value files, cascading
/// through intermediate files while more exist than the fan-in allows.
pub(crate) fn count_distinct_files(
    ctx: &mut TempFileContext,
    mut files: Vec<NamedTempFile>,
    width: usize,
    fan_in: usize,
) -> Result<u64> {
    while files.len() > fan_in {
        let batch: Vec<NamedTempFile> = files.drain(..fan_in).collect();
        let mut streams = Vec::with_capacity(batch.len());
        for f in &batch {
            streams.push(ValueStream::open(f, width)?);
        }
        let out = ctx.create_values_file()?;
        let mut writer = BufWriter::new(out.as_file().try_clone()?);
        let mut buf = [0u8; 16];
        merge_value_streams(streams, |v| {
            write_be_u128(&mut buf[..width], v);
            writer.write_all(&buf[..width]).map_err(UniqError::from)
        })?;
        writer.flush().map_err(UniqError::from)?;
        tracing::debug!(
            merged = batch.len(),
            remaining = files.len(),
            "total-distinct intermediate pass"
        );
        drop(batch);
        files.push(out);
    }

    let mut streams = Vec::with_capacity(files.len());
    for f in &files {
        streams.push(ValueStream::open(f, width)?);
    }
    merge_value_streams(streams, |_| Ok(()))
}
