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

use std::io;

use thiserror::Error;

/// Errors surfaced by the aggregation engine.
///
/// Counter overflow is not represented here: additive merges saturate and
/// emit a warning instead of failing. Recoverable memory pressure is handled
/// internally by the spill paths; [`UniqError::ResourceExhausted`] only
/// appears when the recovery path itself ran out of room.
#[derive(Debug, Error)]
pub enum UniqError {
    /// The field selection or option set is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Memory or file handles ran out and a retry after recovery failed too.
    #[error("resource exhausted while {0}")]
    ResourceExhausted(&'static str),

    /// A temporary run did not read back the way it was written.
    #[error("corrupt temp run: {0}")]
    CorruptTempFile(String),

    /// The caller's record provider failed.
    #[error("record provider error")]
    RecordIo(#[source] anyhow::Error),

    /// The caller's sink refused a bin.
    #[error("sink error")]
    Sink(#[source] anyhow::Error),

    /// A caller-supplied field callback failed.
    #[error("caller field {ident:?} failed")]
    CallerField {
        /// Identity of the offending plug-in field.
        ident: String,
        /// The callback's own error.
        #[source]
        source: anyhow::Error,
    },

    /// Temp-file I/O failed. Write failures are fatal: once a spill cannot
    /// complete there is no remaining budget to recover with.
    #[error("temp file I/O")]
    TempFileIo(#[from] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UniqError>;

impl UniqError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        UniqError::CorruptTempFile(detail.into())
    }

    pub(crate) fn config(detail: impl Into<String>) -> Self {
        UniqError::InvalidConfiguration(detail.into())
    }
}
