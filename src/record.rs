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

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;

/// One flow record, the fixed shape the engine aggregates.
///
/// The engine never interprets records directly; it reads them only through
/// the field lists built by the caller. Timestamps are milliseconds since the
/// epoch. IPv4 addresses occupy the IPv4-mapped range of the 16-octet packed
/// representation so v4 and v6 flows share one key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    /// Source address.
    pub src_addr: IpAddr,
    /// Destination address.
    pub dst_addr: IpAddr,
    /// Next-hop router address.
    pub next_hop: IpAddr,
    /// Source port, or type/code for ICMP.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// IP protocol number.
    pub proto: u8,
    /// Cumulative OR of TCP flags seen on the flow.
    pub tcp_flags: u8,
    /// Packet count.
    pub packets: u64,
    /// Byte count.
    pub bytes: u64,
    /// Flow start, milliseconds since epoch.
    pub start_time_ms: u64,
    /// Flow end, milliseconds since epoch.
    pub end_time_ms: u64,
    /// Sensor that collected the flow.
    pub sensor: u16,
    /// SNMP input interface index.
    pub input: u32,
    /// SNMP output interface index.
    pub output: u32,
    /// Application id assigned by the collector.
    pub application: u16,
}

impl Default for FlowRecord {
    fn default() -> Self {
        let zero = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            src_addr: zero,
            dst_addr: zero,
            next_hop: zero,
            src_port: 0,
            dst_port: 0,
            proto: 0,
            tcp_flags: 0,
            packets: 0,
            bytes: 0,
            start_time_ms: 0,
            end_time_ms: 0,
            sensor: 0,
            input: 0,
            output: 0,
            application: 0,
        }
    }
}

impl FlowRecord {
    /// Flow duration in milliseconds. A flow whose end precedes its start is
    /// treated as instantaneous.
    pub fn elapsed_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }

    /// Flow duration in whole seconds.
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_ms() / 1000
    }
}

/// The 16-octet packed form of an address. IPv4 maps into `::ffff:a.b.c.d`.
pub(crate) fn addr_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// A lazy sequence of flow records.
///
/// This is the engine's only view of its input. Decoding on-disk flow formats
/// lives behind this trait on the caller's side; the engine sees records,
/// an explicit end-of-stream (`Ok(None)`), and an explicit error channel.
///
/// [`crate::SortedUniq`] additionally requires that each source yields
/// records in ascending key order under the configured key field list.
pub trait RecordSource {
    /// Produce the next record, `Ok(None)` at end of stream.
    fn next_record(&mut self) -> Result<Option<FlowRecord>>;
}

/// A source over an in-memory collection, for embedders and tests.
#[derive(Debug)]
pub struct VecSource {
    records: std::vec::IntoIter<FlowRecord>,
}

impl VecSource {
    /// Wrap a vector of records.
    pub fn new(records: Vec<FlowRecord>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl RecordSource for VecSource {
    fn next_record(&mut self) -> Result<Option<FlowRecord>> {
        Ok(self.records.next())
    }
}

/// Receiver for aggregated bins.
///
/// The engine hands over raw packed images; decoding them to text, tables, or
/// anything else is the sink's business. `value` is aligned to the value
/// field list's layout and `distinct_counts` carries one count per declared
/// distinct field, in declaration order.
pub trait Sink {
    /// Receive one aggregated bin.
    fn emit(&mut self, key: &[u8], value: &[u8], distinct_counts: &[u64]) -> Result<()>;
}

/// A sink that collects emitted bins into memory, for embedders and tests.
#[derive(Debug, Default)]
pub struct VecSink {
    /// The collected `(key, value, distinct_counts)` triples.
    pub rows: Vec<(Vec<u8>, Vec<u8>, Vec<u64>)>,
}

impl VecSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for VecSink {
    fn emit(&mut self, key: &[u8], value: &[u8], distinct_counts: &[u64]) -> Result<()> {
        self.rows
            .push((key.to_vec(), value.to_vec(), distinct_counts.to_vec()));
        Ok(())
    }
}
