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
use std::net::IpAddr;
use std::sync::Arc;

use paste::paste;

use crate::error::{Result, UniqError};
use crate::field::{CallerField, FieldId};
use crate::record::{addr_octets, FlowRecord};
use crate::utils::{read_be_uint, write_be_uint};

macro_rules! additive {
    ($( $type:ident, )*) => {
        paste! {
            $(
                /// Big-endian saturating add of one counter width. Returns
                /// whether the accumulator saturated.
                fn [<saturating_add_ $type>](acc: &mut [u8], src: &[u8]) -> bool {
                    const W: usize = std::mem::size_of::<$type>();
                    let mut a = [0u8; W];
                    a.copy_from_slice(&acc[..W]);
                    let mut s = [0u8; W];
                    s.copy_from_slice(&src[..W]);
                    let lhs = <$type>::from_be_bytes(a);
                    let rhs = <$type>::from_be_bytes(s);
                    let (sum, saturated) = match lhs.checked_add(rhs) {
                        Some(sum) => (sum, false),
                        None => (<$type>::MAX, true),
                    };
                    acc[..W].copy_from_slice(&sum.to_be_bytes());
                    saturated
                }
            )*
        }
    };
}

macro_rules! for_all_counter_widths {
    ($macro:ident) => {
        $macro! {
            u8,
            u16,
            u32,
            u64,
        }
    };
}

for_all_counter_widths! { additive }

/// Width-dispatched saturating add for the built-in additive counters.
pub(crate) fn saturating_add(width: usize, acc: &mut [u8], src: &[u8]) -> bool {
    match width {
        1 => saturating_add_u8(acc, src),
        2 => saturating_add_u16(acc, src),
        4 => saturating_add_u32(acc, src),
        8 => saturating_add_u64(acc, src),
        w => unreachable!("additive counter width {w}"),
    }
}

/// Compiled per-field operations.
///
/// Built-in kinds are tagged variants so the hot pack/merge paths stay
/// monomorphic; plug-in fields go through the [`CallerField`] catch-all.
#[derive(Clone)]
pub(crate) enum FieldKind {
    /// 16-octet address, bytewise order.
    Addr(fn(&FlowRecord) -> IpAddr),
    /// Big-endian unsigned scalar read straight off the record.
    Uint {
        /// Packed octets.
        width: usize,
        /// Record accessor.
        get: fn(&FlowRecord) -> u64,
    },
    /// Additive counter; merges saturate.
    Sum {
        /// Packed octets.
        width: usize,
        /// Per-record contribution.
        get: fn(&FlowRecord) -> u64,
    },
    /// Pointwise minimum of an 8-octet timestamp, initialized all-ones.
    TimeMin(fn(&FlowRecord) -> u64),
    /// Pointwise maximum of an 8-octet timestamp.
    TimeMax(fn(&FlowRecord) -> u64),
    /// Caller-supplied callbacks.
    Caller(Arc<dyn CallerField>),
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Addr(_) => f.write_str("Addr"),
            FieldKind::Uint { width, .. } => write!(f, "Uint({width})"),
            FieldKind::Sum { width, .. } => write!(f, "Sum({width})"),
            FieldKind::TimeMin(_) => f.write_str("TimeMin"),
            FieldKind::TimeMax(_) => f.write_str("TimeMax"),
            FieldKind::Caller(c) => write!(f, "Caller({:?})", c.ident()),
        }
    }
}

impl FieldKind {
    /// Operations for a built-in identifier. `None` for [`FieldId::Caller`],
    /// whose operations come from the plug-in itself.
    pub(crate) fn for_id(id: FieldId) -> Option<FieldKind> {
        use FieldId::*;
        let kind = match id {
            SrcAddr => FieldKind::Addr(|r| r.src_addr),
            DstAddr => FieldKind::Addr(|r| r.dst_addr),
            NextHop => FieldKind::Addr(|r| r.next_hop),
            SrcPort => FieldKind::Uint {
                width: 2,
                get: |r| u64::from(r.src_port),
            },
            DstPort => FieldKind::Uint {
                width: 2,
                get: |r| u64::from(r.dst_port),
            },
            Proto => FieldKind::Uint {
                width: 1,
                get: |r| u64::from(r.proto),
            },
            TcpFlags => FieldKind::Uint {
                width: 1,
                get: |r| u64::from(r.tcp_flags),
            },
            Sensor => FieldKind::Uint {
                width: 2,
                get: |r| u64::from(r.sensor),
            },
            Input => FieldKind::Uint {
                width: 4,
                get: |r| u64::from(r.input),
            },
            Output => FieldKind::Uint {
                width: 4,
                get: |r| u64::from(r.output),
            },
            Application => FieldKind::Uint {
                width: 2,
                get: |r| u64::from(r.application),
            },
            RecordCount => FieldKind::Sum {
                width: 4,
                get: |_| 1,
            },
            SumBytes => FieldKind::Sum {
                width: 8,
                get: |r| r.bytes,
            },
            SumPackets => FieldKind::Sum {
                width: 8,
                get: |r| r.packets,
            },
            MinStartTime => FieldKind::TimeMin(|r| r.start_time_ms),
            // Latest end time is the millisecond end time on every path.
            MaxEndTime => FieldKind::TimeMax(|r| r.end_time_ms),
            SumElapsedSec => FieldKind::Sum {
                width: 4,
                get: |r| r.elapsed_secs(),
            },
            SumElapsedMs => FieldKind::Sum {
                width: 8,
                get: |r| r.elapsed_ms(),
            },
            Caller => return None,
        };
        Some(kind)
    }

    /// Packed width in octets.
    pub(crate) fn width(&self) -> usize {
        match self {
            FieldKind::Addr(_) => 16,
            FieldKind::Uint { width, .. } | FieldKind::Sum { width, .. } => *width,
            FieldKind::TimeMin(_) | FieldKind::TimeMax(_) => 8,
            FieldKind::Caller(c) => c.width(),
        }
    }

    /// Write the record's value for this field into `out`.
    pub(crate) fn pack(&self, record: &FlowRecord, out: &mut [u8]) -> Result<()> {
        match self {
            FieldKind::Addr(get) => out.copy_from_slice(&addr_octets(get(record))),
            FieldKind::Uint { get, .. } | FieldKind::Sum { get, .. } => {
                write_be_uint(out, get(record));
            }
            FieldKind::TimeMin(get) | FieldKind::TimeMax(get) => {
                write_be_uint(out, get(record));
            }
            FieldKind::Caller(c) => {
                c.pack(record, out).map_err(|source| UniqError::CallerField {
                    ident: c.ident().to_string(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Fill `out` with the merge identity.
    pub(crate) fn initialize(&self, out: &mut [u8]) {
        match self {
            FieldKind::TimeMin(_) => out.fill(0xff),
            FieldKind::Caller(c) => c.initial(out),
            _ => out.fill(0),
        }
    }

    /// Fold `src` into `acc`. Returns whether an additive counter saturated.
    /// Bytewise kinds do not merge; folding them is a no-op.
    pub(crate) fn merge(&self, acc: &mut [u8], src: &[u8]) -> Result<bool> {
        match self {
            FieldKind::Addr(_) | FieldKind::Uint { .. } => Ok(false),
            FieldKind::Sum { width, .. } => Ok(saturating_add(*width, acc, src)),
            FieldKind::TimeMin(_) => {
                if read_be_uint(src) < read_be_uint(acc) {
                    acc.copy_from_slice(src);
                }
                Ok(false)
            }
            FieldKind::TimeMax(_) => {
                if read_be_uint(src) > read_be_uint(acc) {
                    acc.copy_from_slice(src);
                }
                Ok(false)
            }
            FieldKind::Caller(c) => {
                c.merge(acc, src).map_err(|source| UniqError::CallerField {
                    ident: c.ident().to_string(),
                    source,
                })?;
                Ok(false)
            }
        }
    }

    /// Order two packed images. Scalars are packed big-endian, so the byte
    /// order of the built-in kinds is their numeric order.
    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            FieldKind::Caller(c) => c.compare(a, b),
            _ => a.cmp(b),
        }
    }

    /// The plug-in identity, for duplicate detection across roles.
    pub(crate) fn caller_ident(&self) -> Option<&str> {
        match self {
            FieldKind::Caller(c) => Some(c.ident()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_add_clamps_and_reports() {
        let mut acc = 0xffff_ffff_ffff_fff0u64.to_be_bytes().to_vec();
        let src = 0x20u64.to_be_bytes();
        assert!(saturating_add(8, &mut acc, &src));
        assert_eq!(acc, u64::MAX.to_be_bytes());

        let mut acc = 1u32.to_be_bytes().to_vec();
        let src = 2u32.to_be_bytes();
        assert!(!saturating_add(4, &mut acc, &src));
        assert_eq!(acc, 3u32.to_be_bytes());
    }

    #[test]
    fn record_count_contributes_one_per_record() {
        let kind = FieldKind::for_id(FieldId::RecordCount).unwrap();
        let mut out = vec![0u8; kind.width()];
        kind.pack(&FlowRecord::default(), &mut out).unwrap();
        assert_eq!(read_be_uint(&out), 1);
    }

    #[test]
    fn min_start_time_initializes_all_ones_and_merges_min() {
        let kind = FieldKind::for_id(FieldId::MinStartTime).unwrap();
        let mut acc = vec![0u8; 8];
        kind.initialize(&mut acc);
        assert_eq!(acc, vec![0xff; 8]);

        let rec = FlowRecord {
            start_time_ms: 42,
            ..FlowRecord::default()
        };
        let mut contrib = vec![0u8; 8];
        kind.pack(&rec, &mut contrib).unwrap();
        kind.merge(&mut acc, &contrib).unwrap();
        assert_eq!(read_be_uint(&acc), 42);

        let later = 99u64.to_be_bytes();
        kind.merge(&mut acc, &later).unwrap();
        assert_eq!(read_be_uint(&acc), 42);
    }

    #[test]
    fn max_end_time_merges_millisecond_end() {
        let kind = FieldKind::for_id(FieldId::MaxEndTime).unwrap();
        let rec = FlowRecord {
            start_time_ms: 1_000,
            end_time_ms: 2_500,
            ..FlowRecord::default()
        };
        let mut acc = vec![0u8; 8];
        kind.initialize(&mut acc);
        let mut contrib = vec![0u8; 8];
        kind.pack(&rec, &mut contrib).unwrap();
        kind.merge(&mut acc, &contrib).unwrap();
        assert_eq!(read_be_uint(&acc), 2_500);
    }

    #[test]
    fn addresses_pack_and_order_bytewise() {
        let kind = FieldKind::for_id(FieldId::SrcAddr).unwrap();
        assert_eq!(kind.width(), 16);
        let v6 = FlowRecord {
            src_addr: "2001:db8::1".parse().unwrap(),
            ..FlowRecord::default()
        };
        let v4 = FlowRecord {
            src_addr: "10.0.0.1".parse().unwrap(),
            ..FlowRecord::default()
        };
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        kind.pack(&v6, &mut a).unwrap();
        kind.pack(&v4, &mut b).unwrap();
        // The v4-mapped range (::ffff:0:0/96) sorts below 2001::/16.
        assert_eq!(kind.compare(&b, &a), Ordering::Less);
    }

    #[test]
    fn scalar_compare_matches_numeric_order() {
        let kind = FieldKind::for_id(FieldId::SrcPort).unwrap();
        let rec_lo = FlowRecord {
            src_port: 0x00ff,
            ..FlowRecord::default()
        };
        let rec_hi = FlowRecord {
            src_port: 0x0100,
            ..FlowRecord::default()
        };
        let mut lo = vec![0u8; 2];
        let mut hi = vec![0u8; 2];
        kind.pack(&rec_lo, &mut lo).unwrap();
        kind.pack(&rec_hi, &mut hi).unwrap();
        assert_eq!(kind.compare(&lo, &hi), Ordering::Less);
    }
}
