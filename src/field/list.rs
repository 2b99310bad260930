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
use std::sync::Arc;

use itertools::iproduct;

use crate::error::{Result, UniqError};
use crate::field::ops::FieldKind;
use crate::field::{allowed, CallerField, FieldId, FieldRole};
use crate::record::FlowRecord;

/// Maximum entries per list.
pub const MAX_LIST_FIELDS: usize = 64;
/// Maximum packed octets per list.
pub const MAX_LIST_OCTETS: usize = 128;

/// One compiled entry of a [`FieldList`].
#[derive(Debug, Clone)]
pub(crate) struct FieldEntry {
    pub(crate) id: FieldId,
    pub(crate) kind: FieldKind,
    pub(crate) offset: usize,
    pub(crate) width: usize,
}

/// Handle to one entry, carrying its slice position in the packed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHandle {
    /// Entry index in declaration order.
    pub index: usize,
    /// Byte offset into the packed image.
    pub offset: usize,
    /// Width in octets.
    pub width: usize,
}

/// An ordered tuple of fields compiled into a packed binary layout.
///
/// Offsets are the running sum of prior widths; there is no padding and no
/// alignment, so all reads and writes go through byte copies. Once handed to
/// a pipeline the list is immutable.
#[derive(Debug, Clone)]
pub struct FieldList {
    role: FieldRole,
    entries: Vec<FieldEntry>,
    width: usize,
}

impl FieldList {
    /// Create an empty list for `role`.
    pub fn new(role: FieldRole) -> Self {
        Self {
            role,
            entries: Vec::new(),
            width: 0,
        }
    }

    /// Append a built-in field. Fails when the identifier is not allowed in
    /// this role or a capacity limit would be exceeded.
    pub fn add_field(&mut self, id: FieldId) -> Result<FieldHandle> {
        let kind = FieldKind::for_id(id).ok_or_else(|| {
            UniqError::config("caller fields are added with add_caller_field".to_string())
        })?;
        if !allowed(self.role, id) {
            return Err(UniqError::config(format!(
                "field {id:?} is not usable in role {:?}",
                self.role
            )));
        }
        self.push_entry(id, kind)
    }

    /// Append a caller-supplied plug-in field.
    pub fn add_caller_field(&mut self, field: Arc<dyn CallerField>) -> Result<FieldHandle> {
        let width = field.width();
        if !matches!(width, 1 | 2 | 4 | 8 | 16) {
            return Err(UniqError::config(format!(
                "caller field {:?} has unsupported width {width}",
                field.ident()
            )));
        }
        self.push_entry(FieldId::Caller, FieldKind::Caller(field))
    }

    fn push_entry(&mut self, id: FieldId, kind: FieldKind) -> Result<FieldHandle> {
        let width = kind.width();
        if self.entries.len() == MAX_LIST_FIELDS {
            return Err(UniqError::config(format!(
                "field list exceeds {MAX_LIST_FIELDS} entries"
            )));
        }
        if self.width + width > MAX_LIST_OCTETS {
            return Err(UniqError::config(format!(
                "field list exceeds {MAX_LIST_OCTETS} octets"
            )));
        }
        let handle = FieldHandle {
            index: self.entries.len(),
            offset: self.width,
            width,
        };
        self.entries.push(FieldEntry {
            id,
            kind,
            offset: self.width,
            width,
        });
        self.width += width;
        Ok(handle)
    }

    /// Role this list was built for.
    pub fn role(&self) -> FieldRole {
        self.role
    }

    /// Total packed width in octets.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handle for the entry at `index`.
    pub fn handle(&self, index: usize) -> Option<FieldHandle> {
        self.entries.get(index).map(|e| FieldHandle {
            index,
            offset: e.offset,
            width: e.width,
        })
    }

    /// Handle for the first entry with identifier `id`.
    pub fn find(&self, id: FieldId) -> Option<FieldHandle> {
        self.entries
            .iter()
            .position(|e| e.id == id)
            .and_then(|index| self.handle(index))
    }

    /// Pack the record's value for every entry into `out`, which must be
    /// exactly [`FieldList::width`] octets.
    pub fn pack(&self, record: &FlowRecord, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.width);
        for entry in &self.entries {
            entry
                .kind
                .pack(record, &mut out[entry.offset..entry.offset + entry.width])?;
        }
        Ok(())
    }

    /// Pack a single entry's value into `out` (`entry.width` octets).
    pub(crate) fn pack_entry(&self, index: usize, record: &FlowRecord, out: &mut [u8]) -> Result<()> {
        let entry = &self.entries[index];
        entry.kind.pack(record, out)
    }

    /// Fill `out` with every entry's merge identity.
    pub fn initialize(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.width);
        for entry in &self.entries {
            entry
                .kind
                .initialize(&mut out[entry.offset..entry.offset + entry.width]);
        }
    }

    /// Fold `src` into `acc` entry by entry. Saturation of an additive
    /// counter is diagnosed, once per occurrence, and is not an error.
    pub fn merge(&self, acc: &mut [u8], src: &[u8]) -> Result<()> {
        debug_assert_eq!(acc.len(), self.width);
        debug_assert_eq!(src.len(), self.width);
        for entry in &self.entries {
            let range = entry.offset..entry.offset + entry.width;
            let overflowed = entry
                .kind
                .merge(&mut acc[range.clone()], &src[range])?;
            if overflowed {
                tracing::warn!(field = ?entry.id, "counter overflow, saturating to maximum");
            }
        }
        Ok(())
    }

    /// Order two packed images entry by entry, in pack order.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        for entry in &self.entries {
            let range = entry.offset..entry.offset + entry.width;
            match entry.kind.compare(&a[range.clone()], &b[range]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Borrow the entry's slice out of a packed image.
    pub fn extract<'a>(&self, buf: &'a [u8], handle: FieldHandle) -> &'a [u8] {
        &buf[handle.offset..handle.offset + handle.width]
    }

    /// Widths of all entries in declaration order.
    pub(crate) fn entry_widths(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.width).collect()
    }

    /// Identifiers shared between this list and `other`. Plug-in entries
    /// collide on their `ident`, regardless of which `Arc` carries them.
    pub(crate) fn overlap_with(&self, other: &FieldList) -> Option<String> {
        for (a, b) in iproduct!(&self.entries, &other.entries) {
            if a.id == FieldId::Caller || b.id == FieldId::Caller {
                if let (Some(ia), Some(ib)) = (a.kind.caller_ident(), b.kind.caller_ident()) {
                    if ia == ib {
                        return Some(format!("caller field {ia:?}"));
                    }
                }
            } else if a.id == b.id {
                return Some(format!("{:?}", a.id));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::read_be_uint;

    fn sample() -> FlowRecord {
        FlowRecord {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            src_port: 1234,
            dst_port: 80,
            proto: 6,
            packets: 3,
            bytes: 600,
            start_time_ms: 10_000,
            end_time_ms: 12_000,
            ..FlowRecord::default()
        }
    }

    #[test]
    fn offsets_are_prefix_sums() {
        let mut list = FieldList::new(FieldRole::Key);
        let a = list.add_field(FieldId::SrcAddr).unwrap();
        let b = list.add_field(FieldId::Proto).unwrap();
        let c = list.add_field(FieldId::DstPort).unwrap();
        assert_eq!((a.offset, a.width), (0, 16));
        assert_eq!((b.offset, b.width), (16, 1));
        assert_eq!((c.offset, c.width), (17, 2));
        assert_eq!(list.width(), 19);
    }

    #[test]
    fn octet_capacity_is_enforced() {
        let mut list = FieldList::new(FieldRole::Key);
        for _ in 0..8 {
            list.add_field(FieldId::SrcAddr).unwrap();
        }
        // 8 addresses fill all 128 octets.
        assert_eq!(list.width(), MAX_LIST_OCTETS);
        assert!(matches!(
            list.add_field(FieldId::Proto),
            Err(UniqError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn role_allowance_is_enforced() {
        let mut list = FieldList::new(FieldRole::Value);
        assert!(list.add_field(FieldId::SrcAddr).is_err());
        assert!(list.add_field(FieldId::SumBytes).is_ok());
    }

    #[test]
    fn pack_merge_extract_round_trip() {
        let mut value = FieldList::new(FieldRole::Value);
        let bytes_h = value.add_field(FieldId::SumBytes).unwrap();
        let packets_h = value.add_field(FieldId::SumPackets).unwrap();
        let records_h = value.add_field(FieldId::RecordCount).unwrap();

        let mut acc = vec![0u8; value.width()];
        value.initialize(&mut acc);
        let mut contrib = vec![0u8; value.width()];

        for _ in 0..2 {
            value.pack(&sample(), &mut contrib).unwrap();
            value.merge(&mut acc, &contrib).unwrap();
        }

        assert_eq!(read_be_uint(value.extract(&acc, bytes_h)), 1_200);
        assert_eq!(read_be_uint(value.extract(&acc, packets_h)), 6);
        assert_eq!(read_be_uint(value.extract(&acc, records_h)), 2);
    }

    #[test]
    fn compare_orders_by_pack_order() {
        let mut key = FieldList::new(FieldRole::Key);
        key.add_field(FieldId::Proto).unwrap();
        key.add_field(FieldId::SrcPort).unwrap();

        let lo = [6u8, 0xff, 0xff];
        let hi = [17u8, 0x00, 0x00];
        assert_eq!(key.compare(&lo, &hi), Ordering::Less);

        let a = [6u8, 0x01, 0x00];
        let b = [6u8, 0x01, 0x00];
        assert_eq!(key.compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn key_distinct_overlap_is_detected() {
        let mut key = FieldList::new(FieldRole::Key);
        key.add_field(FieldId::SrcAddr).unwrap();
        let mut distinct = FieldList::new(FieldRole::Distinct);
        distinct.add_field(FieldId::DstAddr).unwrap();
        assert!(key.overlap_with(&distinct).is_none());
        distinct.add_field(FieldId::SrcAddr).unwrap();
        assert!(key.overlap_with(&distinct).is_some());
    }
}
