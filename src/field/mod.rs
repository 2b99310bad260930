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

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::error::UniqError;
use crate::record::FlowRecord;

/// The role a field list plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Bin identity; pack order is the output sort order.
    Key,
    /// Per-bin aggregates merged record by record.
    Value,
    /// Fields whose per-bin cardinality is counted.
    Distinct,
}

/// Closed enumeration of the fields the engine knows how to pack.
///
/// Record fields are key- and distinct-capable; the derived aggregates are
/// value-capable. [`FieldId::Caller`] is the sentinel for plug-in fields,
/// which carry their own callbacks (see [`CallerField`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldId {
    /// Source address, 16 octets.
    SrcAddr,
    /// Destination address, 16 octets.
    DstAddr,
    /// Next-hop address, 16 octets.
    NextHop,
    /// Source port, 2 octets.
    SrcPort,
    /// Destination port, 2 octets.
    DstPort,
    /// IP protocol, 1 octet.
    Proto,
    /// Cumulative TCP flags, 1 octet.
    TcpFlags,
    /// Sensor id, 2 octets.
    Sensor,
    /// Input interface index, 4 octets.
    Input,
    /// Output interface index, 4 octets.
    Output,
    /// Application id, 2 octets.
    Application,
    /// Number of records in the bin, 4 octets, saturating.
    RecordCount,
    /// Sum of byte counters, 8 octets, saturating.
    SumBytes,
    /// Sum of packet counters, 8 octets, saturating.
    SumPackets,
    /// Earliest start time in milliseconds, 8 octets, initialized all-ones.
    MinStartTime,
    /// Latest end time in milliseconds, 8 octets.
    MaxEndTime,
    /// Sum of flow durations in whole seconds, 4 octets, saturating.
    SumElapsedSec,
    /// Sum of flow durations in milliseconds, 8 octets, saturating.
    SumElapsedMs,
    /// Sentinel for caller-supplied plug-in fields.
    Caller,
}

impl FieldId {
    /// Packed width in octets for the built-in identifiers. `None` for
    /// [`FieldId::Caller`], whose width comes from its callbacks.
    pub fn fixed_width(self) -> Option<usize> {
        use FieldId::*;
        match self {
            SrcAddr | DstAddr | NextHop => Some(16),
            SrcPort | DstPort | Sensor | Application => Some(2),
            Proto | TcpFlags => Some(1),
            Input | Output | RecordCount | SumElapsedSec => Some(4),
            SumBytes | SumPackets | MinStartTime | MaxEndTime | SumElapsedMs => Some(8),
            Caller => None,
        }
    }

    /// Canonical lowercase name, the spelling embedders use in switch
    /// values and config files.
    pub fn name(self) -> &'static str {
        use FieldId::*;
        match self {
            SrcAddr => "saddr",
            DstAddr => "daddr",
            NextHop => "nhip",
            SrcPort => "sport",
            DstPort => "dport",
            Proto => "proto",
            TcpFlags => "flags",
            Sensor => "sensor",
            Input => "input",
            Output => "output",
            Application => "application",
            RecordCount => "records",
            SumBytes => "bytes",
            SumPackets => "packets",
            MinStartTime => "stime",
            MaxEndTime => "etime",
            SumElapsedSec => "dur",
            SumElapsedMs => "dur-msec",
            Caller => "caller",
        }
    }

    /// All built-in identifiers, in declaration order.
    pub fn all() -> &'static [FieldId] {
        use FieldId::*;
        &[
            SrcAddr,
            DstAddr,
            NextHop,
            SrcPort,
            DstPort,
            Proto,
            TcpFlags,
            Sensor,
            Input,
            Output,
            Application,
            RecordCount,
            SumBytes,
            SumPackets,
            MinStartTime,
            MaxEndTime,
            SumElapsedSec,
            SumElapsedMs,
            Caller,
        ]
    }

    /// Whether this identifier names a record field rather than an aggregate.
    pub fn is_record_field(self) -> bool {
        use FieldId::*;
        matches!(
            self,
            SrcAddr
                | DstAddr
                | NextHop
                | SrcPort
                | DstPort
                | Proto
                | TcpFlags
                | Sensor
                | Input
                | Output
                | Application
        )
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FieldId {
    type Err = UniqError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        FieldId::all()
            .iter()
            .find(|id| id.name() == s)
            .copied()
            .ok_or_else(|| UniqError::InvalidConfiguration(format!("unknown field {s:?}")))
    }
}

/// The constant (role, id) allowance table, expressed as a pure function.
pub fn allowed(role: FieldRole, id: FieldId) -> bool {
    match role {
        FieldRole::Key | FieldRole::Distinct => id.is_record_field() || id == FieldId::Caller,
        FieldRole::Value => !id.is_record_field(),
    }
}

/// A caller-supplied plug-in field.
///
/// Packed bytes must be canonical: two record values are the same field value
/// exactly when their packed octets are equal, and `compare` must order byte
/// images consistently with that equality. `merge` is only invoked for value
/// roles and must treat the image produced by `initial` as its identity.
pub trait CallerField {
    /// Stable identity, used for duplicate detection across roles.
    fn ident(&self) -> &str;

    /// Packed width in octets; one of 1, 2, 4, 8 or 16.
    fn width(&self) -> usize;

    /// Write the record's value for this field into `out` (`width` octets).
    fn pack(&self, record: &FlowRecord, out: &mut [u8]) -> Result<()>;

    /// Fill `out` with the merge identity. The default is all zeroes.
    fn initial(&self, out: &mut [u8]) {
        out.fill(0);
    }

    /// Fold `src` into `acc`, both `width` octets.
    fn merge(&self, acc: &mut [u8], src: &[u8]) -> Result<()>;

    /// Order two packed images.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Mean packet size for a bin. Defined as zero for an empty packet counter;
/// integer division otherwise.
pub fn bytes_per_packet(bytes: u64, packets: u64) -> u64 {
    if packets == 0 {
        0
    } else {
        bytes / packets
    }
}

/// Packed field lists and their entry handles.
pub mod list;
/// Per-kind pack/merge/compare operations.
pub(crate) mod ops;

pub use self::list::{FieldHandle, FieldList, MAX_LIST_FIELDS, MAX_LIST_OCTETS};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowance_table() {
        assert!(allowed(FieldRole::Key, FieldId::SrcAddr));
        assert!(allowed(FieldRole::Key, FieldId::Caller));
        assert!(!allowed(FieldRole::Key, FieldId::SumBytes));
        assert!(allowed(FieldRole::Value, FieldId::SumBytes));
        assert!(allowed(FieldRole::Value, FieldId::Caller));
        assert!(!allowed(FieldRole::Value, FieldId::DstPort));
        assert!(allowed(FieldRole::Distinct, FieldId::DstAddr));
        assert!(!allowed(FieldRole::Distinct, FieldId::RecordCount));
    }

    #[test]
    fn widths() {
        assert_eq!(FieldId::SrcAddr.fixed_width(), Some(16));
        assert_eq!(FieldId::Proto.fixed_width(), Some(1));
        assert_eq!(FieldId::SrcPort.fixed_width(), Some(2));
        assert_eq!(FieldId::Input.fixed_width(), Some(4));
        assert_eq!(FieldId::SumBytes.fixed_width(), Some(8));
        assert_eq!(FieldId::Caller.fixed_width(), None);
    }

    #[test]
    fn names_round_trip() {
        for id in FieldId::all() {
            assert_eq!(id.name().parse::<FieldId>().unwrap(), *id);
        }
        assert!("no-such-field".parse::<FieldId>().is_err());
        assert_eq!(FieldId::SumBytes.to_string(), "bytes");
    }

    #[test]
    fn bytes_per_packet_guards_empty_bins() {
        assert_eq!(bytes_per_packet(1500, 0), 0);
        assert_eq!(bytes_per_packet(1500, 3), 500);
        assert_eq!(bytes_per_packet(100, 3), 33);
    }
}
