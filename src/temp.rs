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

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use tempfile::NamedTempFile;

use crate::error::{Result, UniqError};

/// Factory for this instance's temporary files.
///
/// Names carry the process id plus a per-instance sequence number so several
/// engines can share one spool directory. Files are created with
/// [`tempfile::Builder`] and delete themselves on drop, which is what makes
/// teardown run on every exit path.
#[derive(Debug)]
pub(crate) struct TempFileContext {
    dir: Option<PathBuf>,
    next_seq: u64,
}

impl TempFileContext {
    /// Create a context spooling into `dir`, or the system temp directory.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, next_seq: 0 }
    }

    fn create_file(&mut self) -> io::Result<(u64, NamedTempFile)> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let prefix = format!("flowbin-{}-{:06}-", std::process::id(), seq);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }?;
        tracing::debug!(seq, path = ?file.path(), "opened temp file");
        Ok((seq, file))
    }

    /// Create a run, with its paired distinct-payload file when distinct
    /// fields are declared. The pair lives and dies together; the even main
    /// sequence number is a diagnostic artefact, not a lookup mechanism.
    pub fn create_run(&mut self, with_distinct: bool) -> io::Result<Run> {
        if with_distinct && self.next_seq % 2 == 1 {
            self.next_seq += 1;
        }
        let (seq, main) = self.create_file()?;
        let distinct = match with_distinct {
            true => Some(self.create_file()?.1),
            false => None,
        };
        Ok(Run { seq, main, distinct })
    }

    /// Create a bare value file, used by the total-distinct counter's own
    /// spill protocol.
    pub fn create_values_file(&mut self) -> io::Result<NamedTempFile> {
        Ok(self.create_file()?.1)
    }
}

/// One sorted temporary run: the main file of `(key, value, counts)` records
/// and, when distinct fields exist, the paired payload file of their sorted
/// unique values. Dropping a run deletes both files.
#[derive(Debug)]
pub(crate) struct Run {
    pub seq: u64,
    pub main: NamedTempFile,
    pub distinct: Option<NamedTempFile>,
}

/// Fixed byte layout of the records in a run.
#[derive(Debug, Clone)]
pub(crate) struct RunLayout {
    pub key_width: usize,
    pub value_width: usize,
    pub distinct_widths: Vec<usize>,
}

impl RunLayout {
    pub fn has_distinct(&self) -> bool {
        !self.distinct_widths.is_empty()
    }
}

/// Buffered writer over a run's file pair.
pub(crate) struct RunWriter {
    main: BufWriter<File>,
    distinct: Option<BufWriter<File>>,
}

impl RunWriter {
    pub fn create(run: &Run) -> io::Result<Self> {
        let main = BufWriter::new(run.main.as_file().try_clone()?);
        let distinct = match &run.distinct {
            Some(file) => Some(BufWriter::new(file.as_file().try_clone()?)),
            None => None,
        };
        Ok(Self { main, distinct })
    }

    /// Append one bin record: key image, value image, then one native-order
    /// `u64` count per distinct field. Payload values follow separately via
    /// [`RunWriter::write_distinct_value`], in the same bin/field order.
    pub fn write_bin(&mut self, key: &[u8], value: &[u8], counts: &[u64]) -> io::Result<()> {
        self.main.write_all(key)?;
        self.main.write_all(value)?;
        for count in counts {
            self.main.write_all(&count.to_ne_bytes())?;
        }
        Ok(())
    }

    /// Append one distinct value to the paired payload file.
    pub fn write_distinct_value(&mut self, value: &[u8]) -> io::Result<()> {
        match &mut self.distinct {
            Some(w) => w.write_all(value),
            None => unreachable!("distinct payload written without a paired file"),
        }
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.main.flush()?;
        if let Some(d) = &mut self.distinct {
            d.flush()?;
        }
        Ok(())
    }
}

/// Positioned reader over a run's file pair. `advance` loads the next bin
/// record; the distinct payload for the current bin is then consumed value
/// by value, which keeps the payload reader aligned with the main reader.
pub(crate) struct RunReader {
    seq: u64,
    main: BufReader<File>,
    distinct: Option<BufReader<File>>,
    layout: RunLayout,
    key: Vec<u8>,
    value: Vec<u8>,
    counts: Vec<u64>,
}

impl RunReader {
    pub fn open(run: &Run, layout: &RunLayout) -> io::Result<Self> {
        let main = BufReader::new(run.main.reopen()?);
        let distinct = match &run.distinct {
            Some(file) => Some(BufReader::new(file.reopen()?)),
            None => None,
        };
        Ok(Self {
            seq: run.seq,
            main,
            distinct,
            layout: layout.clone(),
            key: vec![0; layout.key_width],
            value: vec![0; layout.value_width],
            counts: vec![0; layout.distinct_widths.len()],
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Load the next bin record. `Ok(false)` at a clean end of file; an end
    /// of file inside a record is a corrupt run.
    pub fn advance(&mut self) -> Result<bool> {
        let key_len = self.key.len();
        if !read_or_eof(&mut self.main, &mut self.key[..key_len])
            .map_err(|e| corrupt_read(self.seq, "key", e))?
        {
            return Ok(false);
        }
        self.main
            .read_exact(&mut self.value)
            .map_err(|e| corrupt_read(self.seq, "value", e))?;
        let mut count_buf = [0u8; 8];
        for slot in self.counts.iter_mut() {
            self.main
                .read_exact(&mut count_buf)
                .map_err(|e| corrupt_read(self.seq, "distinct count", e))?;
            *slot = u64::from_ne_bytes(count_buf);
        }
        Ok(true)
    }

    /// Read the next payload value for distinct field `field`, into `out`
    /// (that field's width).
    pub fn read_distinct_value(&mut self, field: usize, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.layout.distinct_widths[field]);
        let seq = self.seq;
        match &mut self.distinct {
            Some(r) => r
                .read_exact(out)
                .map_err(|e| corrupt_read(seq, "distinct payload", e)),
            None => unreachable!("distinct payload read without a paired file"),
        }
    }
}

fn corrupt_read(seq: u64, what: &str, err: io::Error) -> UniqError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        UniqError::corrupt(format!("run {seq}: short read in {what}"))
    } else {
        UniqError::TempFileIo(err)
    }
}

/// Fill `buf` completely, or report a clean end of file when no bytes were
/// available at all. A partial fill is an `UnexpectedEof` error.
pub(crate) fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of file inside a record",
            ));
        }
        filled += n;
    }
    Ok(true)
}

/// Whether an open failure means the process ran out of file handles, the
/// recoverable case that shrinks the merge fan-in, as opposed to a fatal
/// I/O error.
pub(crate) fn is_handle_exhaustion(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        // EMFILE / ENFILE.
        matches!(err.raw_os_error(), Some(23) | Some(24))
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
