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

//! Property-level checks: aggregation identity, distinct exactness across
//! memory pressure, saturation, and the equivalence of the percentage and
//! threshold limit modes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flowbin::{
    BinRow, Direction, FieldId, FieldList, FieldRole, FlowRecord, RandomUniq, RankBy,
    TopNSelector, TopnLimit, UniqConfig,
};

fn be(buf: &[u8]) -> u64 {
    buf.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn full_value_list() -> FieldList {
    let mut value = FieldList::new(FieldRole::Value);
    value.add_field(FieldId::SumBytes).unwrap();
    value.add_field(FieldId::SumPackets).unwrap();
    value.add_field(FieldId::RecordCount).unwrap();
    value.add_field(FieldId::MinStartTime).unwrap();
    value.add_field(FieldId::MaxEndTime).unwrap();
    value.add_field(FieldId::SumElapsedSec).unwrap();
    value.add_field(FieldId::SumElapsedMs).unwrap();
    value
}

fn random_record(rng: &mut StdRng) -> FlowRecord {
    let start = rng.gen_range(1_000_000u64..2_000_000);
    FlowRecord {
        src_addr: format!("10.0.0.{}", rng.gen_range(1..=12u8)).parse().unwrap(),
        dst_addr: format!("10.1.0.{}", rng.gen_range(1..=25u8)).parse().unwrap(),
        src_port: rng.gen_range(1024..=1040),
        dst_port: rng.gen_range(1..=6) * 1000,
        proto: if rng.gen_bool(0.8) { 6 } else { 17 },
        bytes: rng.gen_range(40..200_000),
        packets: rng.gen_range(1..200),
        start_time_ms: start,
        end_time_ms: start + rng.gen_range(0..120_000),
        ..FlowRecord::default()
    }
}

/// Replay the value field list by hand: initialize once, merge every
/// contribution. The pipeline must produce bit-identical value images no
/// matter how records were ordered or how often the table spilled.
fn replayed_value_image(value_list: &FieldList, records: &[&FlowRecord]) -> Vec<u8> {
    let mut acc = vec![0u8; value_list.width()];
    value_list.initialize(&mut acc);
    let mut contrib = vec![0u8; value_list.width()];
    for r in records {
        value_list.pack(r, &mut contrib).unwrap();
        value_list.merge(&mut acc, &contrib).unwrap();
    }
    acc
}

fn aggregate(records: &[FlowRecord], config: UniqConfig) -> Vec<BinRow> {
    let mut key = FieldList::new(FieldRole::Key);
    key.add_field(FieldId::SrcAddr).unwrap();
    key.add_field(FieldId::Proto).unwrap();
    let mut distinct = FieldList::new(FieldRole::Distinct);
    distinct.add_field(FieldId::DstAddr).unwrap();
    distinct.add_field(FieldId::DstPort).unwrap();

    let mut uniq = RandomUniq::new(config, key, full_value_list(), distinct).unwrap();
    for r in records {
        uniq.add(r).unwrap();
    }
    uniq.prepare_for_output().unwrap();
    let mut rows: Vec<BinRow> = uniq.iter().unwrap().collect::<flowbin::Result<_>>().unwrap();
    rows.sort_by(|a, b| a.key.cmp(&b.key));
    rows
}

#[test]
fn value_images_match_a_field_list_replay_regardless_of_spills() {
    let mut rng = StdRng::seed_from_u64(1);
    let records: Vec<FlowRecord> = (0..600).map(|_| random_record(&mut rng)).collect();

    let value_list = full_value_list();
    let mut key_list = FieldList::new(FieldRole::Key);
    key_list.add_field(FieldId::SrcAddr).unwrap();
    key_list.add_field(FieldId::Proto).unwrap();

    let in_memory = aggregate(&records, UniqConfig::default());
    let spilled = aggregate(
        &records,
        UniqConfig {
            bin_capacity: 3,
            distinct_mem_bytes: 8 * 1024,
            ..UniqConfig::default()
        },
    );
    assert_eq!(in_memory, spilled);

    for row in &in_memory {
        let members: Vec<&FlowRecord> = records
            .iter()
            .filter(|r| {
                let mut key = vec![0u8; key_list.width()];
                key_list.pack(r, &mut key).unwrap();
                key == row.key
            })
            .collect();
        assert!(!members.is_empty());
        assert_eq!(row.value, replayed_value_image(&value_list, &members));
    }
}

#[test]
fn multiple_distinct_fields_stay_exact_under_memory_pressure() {
    let mut rng = StdRng::seed_from_u64(2);
    let records: Vec<FlowRecord> = (0..600).map(|_| random_record(&mut rng)).collect();

    let mut key_list = FieldList::new(FieldRole::Key);
    key_list.add_field(FieldId::SrcAddr).unwrap();
    key_list.add_field(FieldId::Proto).unwrap();
    let mut dst_list = FieldList::new(FieldRole::Distinct);
    dst_list.add_field(FieldId::DstAddr).unwrap();
    let mut port_list = FieldList::new(FieldRole::Distinct);
    port_list.add_field(FieldId::DstPort).unwrap();

    for config in [
        UniqConfig::default(),
        UniqConfig {
            bin_capacity: 2,
            distinct_mem_bytes: 4 * 1024,
            ..UniqConfig::default()
        },
    ] {
        let rows = aggregate(&records, config);
        for row in &rows {
            let mut dsts = std::collections::BTreeSet::new();
            let mut ports = std::collections::BTreeSet::new();
            for r in &records {
                let mut key = vec![0u8; key_list.width()];
                key_list.pack(r, &mut key).unwrap();
                if key != row.key {
                    continue;
                }
                let mut dst = vec![0u8; 16];
                dst_list.pack(r, &mut dst).unwrap();
                dsts.insert(dst);
                let mut port = vec![0u8; 2];
                port_list.pack(r, &mut port).unwrap();
                ports.insert(port);
            }
            assert_eq!(row.distinct_counts, vec![dsts.len() as u64, ports.len() as u64]);
        }
    }
}

#[test]
fn additive_merges_saturate_instead_of_wrapping() {
    let mut key = FieldList::new(FieldRole::Key);
    key.add_field(FieldId::SrcAddr).unwrap();
    let mut value = FieldList::new(FieldRole::Value);
    value.add_field(FieldId::SumBytes).unwrap();
    let distinct = FieldList::new(FieldRole::Distinct);

    let mut uniq = RandomUniq::new(UniqConfig::default(), key, value, distinct).unwrap();
    for bytes in [u64::MAX - 10, 100] {
        uniq.add(&FlowRecord {
            src_addr: "10.0.0.1".parse().unwrap(),
            bytes,
            packets: 1,
            ..FlowRecord::default()
        })
        .unwrap();
    }
    uniq.prepare_for_output().unwrap();
    let rows: Vec<BinRow> = uniq.iter().unwrap().collect::<flowbin::Result<_>>().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(be(&rows[0].value), u64::MAX);
}

#[test]
fn temporal_aggregates_track_extremes() {
    let mut key = FieldList::new(FieldRole::Key);
    key.add_field(FieldId::SrcAddr).unwrap();
    let mut value = FieldList::new(FieldRole::Value);
    let min_h = value.add_field(FieldId::MinStartTime).unwrap();
    let max_h = value.add_field(FieldId::MaxEndTime).unwrap();
    let value_list = value.clone();
    let distinct = FieldList::new(FieldRole::Distinct);

    let mut uniq = RandomUniq::new(UniqConfig::default(), key, value, distinct).unwrap();
    for (start, end) in [(5_000u64, 9_000u64), (2_000, 3_000), (6_000, 12_000)] {
        uniq.add(&FlowRecord {
            src_addr: "10.0.0.1".parse().unwrap(),
            start_time_ms: start,
            end_time_ms: end,
            packets: 1,
            bytes: 1,
            ..FlowRecord::default()
        })
        .unwrap();
    }
    uniq.prepare_for_output().unwrap();
    let rows: Vec<BinRow> = uniq.iter().unwrap().collect::<flowbin::Result<_>>().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(be(value_list.extract(&rows[0].value, min_h)), 2_000);
    assert_eq!(be(value_list.extract(&rows[0].value, max_h)), 12_000);
}

#[test]
fn percentage_equals_threshold_at_the_computed_cut() {
    let mut rng = StdRng::seed_from_u64(3);
    let value_list = {
        let mut list = FieldList::new(FieldRole::Value);
        list.add_field(FieldId::SumBytes).unwrap();
        list
    };
    let distinct_list = FieldList::new(FieldRole::Distinct);

    let rows: Vec<BinRow> = (0..64)
        .map(|i| BinRow {
            key: vec![i as u8],
            value: rng.gen_range(0u64..10_000).to_be_bytes().to_vec(),
            distinct_counts: Vec::new(),
        })
        .collect();
    let total: u64 = rows.iter().map(|r| be(&r.value)).sum();

    for pct in [1u32, 3, 10, 50, 100] {
        let mut by_pct = TopNSelector::new(
            &value_list,
            &distinct_list,
            RankBy::Value(FieldId::SumBytes),
            Direction::Top,
            TopnLimit::Percentage(pct),
            false,
            None,
        )
        .unwrap();
        for row in &rows {
            by_pct.push(row.clone());
        }

        let cut = (u128::from(total) * u128::from(pct) / 100) as u64;
        let mut by_threshold = TopNSelector::new(
            &value_list,
            &distinct_list,
            RankBy::Value(FieldId::SumBytes),
            Direction::Top,
            TopnLimit::Threshold(cut),
            false,
            None,
        )
        .unwrap();
        for row in &rows {
            by_threshold.push(row.clone());
        }

        assert_eq!(by_pct.finish(), by_threshold.finish(), "pct {pct}");
    }
}
