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

//! A streaming `GROUP BY` / top-N aggregation engine for flow records.
//!
//! Records are summarized into bins keyed by a caller-selected tuple of
//! fields, with additive and temporal aggregates plus exact distinct counts
//! per bin. Two pipelines cover the two input regimes:
//!
//! - [`RandomUniq`] aggregates records arriving in arbitrary order through
//!   an in-memory bin table, degrading to external-memory merge sort when
//!   the working set outgrows its budgets.
//! - [`SortedUniq`] aggregates streams already sorted by the key, one bin
//!   at a time.
//!
//! [`TopNSelector`] sits on either pipeline's iterator and keeps the K most
//! extreme bins by a designated aggregate.
//!
//! The engine is single-threaded and synchronous. It reads records only
//! through [`RecordSource`] and hands packed bins to the caller (or a
//! [`Sink`]); decoding flow file formats and rendering output are the
//! embedder's business.

#![warn(missing_docs)]

/// Engine configuration.
pub mod config;
/// Adaptive exact distinct counting.
pub mod distinct;
/// Error taxonomy.
pub mod error;
/// Field identifiers, plug-in fields, and packed field lists.
pub mod field;
/// Flow records and the collaborator traits around the engine.
pub mod record;
/// Top-N / bottom-N selection over aggregated bins.
pub mod topn;
/// The two aggregation pipelines.
pub mod uniq;
/// Memory budgeting and byte-order helpers.
pub mod utils;

mod merge;
mod table;
mod temp;

pub use config::UniqConfig;
pub use distinct::{DistinctCounter, DistinctInsert, Representation};
pub use error::{Result, UniqError};
pub use field::{
    allowed, bytes_per_packet, CallerField, FieldHandle, FieldId, FieldList, FieldRole,
    MAX_LIST_FIELDS, MAX_LIST_OCTETS,
};
pub use merge::MAX_MERGE_FILES;
pub use record::{FlowRecord, RecordSource, Sink, VecSink, VecSource};
pub use topn::{Direction, RankBy, TopNSelector, TopnLimit};
pub use uniq::random::RandomUniq;
pub use uniq::sorted::{SortedIter, SortedUniq};
pub use uniq::{BinRow, UniqIter};
pub use utils::MemBudget;
