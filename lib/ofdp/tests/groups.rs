// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The group table and its interplay with flow entries.

use ofdp_test_utils as common;

use common::*;

fn bucket(ports: &[u32]) -> Bucket {
    Bucket::new(ActionGroup::new(
        ports.iter().map(|p| Action::output(*p)).collect(),
    ))
}

fn to_group(priority: u16, port: u16, group: u32) -> FlowEntry {
    let mut e = entry(priority, &[Match::tcp_dst(port)])
        .with_instructions(apply(vec![Action::group(group)]));
    e.set_notify_removal(true);
    e
}

fn refs(pl: &Pipeline, id: u32) -> u32 {
    pl.group_stats(id).unwrap()[0].ref_count
}

#[test]
fn all_group_replicates_per_bucket() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();

    let buckets = vec![bucket(&[10]), bucket(&[11]), bucket(&[12])];
    pl.add_group(GroupType::All, 1, buckets).unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 2, 80));
    assert_eq!(dp.outputs(), vec![10, 11, 12]);
    assert_eq!(dp.num_replicas(), 3);

    // The original is left over and dropped.
    assert_eq!(dp.drops(), vec![TestPkt::new(1)]);
    dp.assert_disposed_once(1);

    let st = &pl.group_stats(1).unwrap()[0];
    assert_eq!(st.packet_count, 1);
    assert_eq!(st.byte_count, 60);
    assert_eq!(st.buckets.len(), 3);
    assert!(st.buckets.iter().all(|b| b.packet_count == 1));
}

#[test]
fn bucket_rewrites_stay_in_their_bucket() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();

    let rewrite = Bucket::new(ActionGroup::new(vec![
        Action::set_field(SetField::TcpDst(8080)),
        Action::output(7),
    ]));
    pl.add_group(GroupType::All, 1, vec![rewrite, bucket(&[PORT_IN_PORT])])
        .unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(1), tcp4(5, 2, 80));
    assert_eq!(dp.outputs(), vec![7, 5]);
    assert_eq!(dp.modifies().len(), 1);
    dp.assert_disposed_once(1);
}

#[test]
fn failed_replicate_skips_bucket() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();
    dp.fail_replicate(true);

    pl.add_group(GroupType::All, 1, vec![bucket(&[10]), bucket(&[11])])
        .unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 2, 80));
    assert!(dp.outputs().is_empty());
    assert_eq!(dp.drops(), vec![TestPkt::new(1)]);
}

#[test]
fn indirect_group_uses_the_packet() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();

    pl.add_group(GroupType::Indirect, 2, vec![bucket(&[20])]).unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 2), false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 2, 80));
    assert_eq!(dp.outputs(), vec![20]);
    assert_eq!(dp.num_replicas(), 0);
    assert!(dp.drops().is_empty());
    dp.assert_disposed_once(1);
}

#[test]
fn select_group_accepted_but_inert() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();

    let buckets = vec![
        Bucket::weighted(1, ActionGroup::new(vec![Action::output(1)])),
        Bucket::weighted(3, ActionGroup::new(vec![Action::output(2)])),
    ];
    pl.add_group(GroupType::Select, 3, buckets).unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 3), false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 2, 80));
    assert!(dp.outputs().is_empty());
    assert_eq!(dp.drops().len(), 1);
}

#[test]
fn group_validation() {
    let (pl, _t0, _ev) = pipeline(1);

    assert!(matches!(
        pl.add_group(GroupType::Indirect, 1, vec![bucket(&[1]), bucket(&[2])]),
        Err(OfdpError::InvalidGroupType { id: 1, .. })
    ));
    assert!(matches!(
        pl.add_group(
            GroupType::All,
            1,
            vec![Bucket::weighted(2, ActionGroup::new(vec![]))]
        ),
        Err(OfdpError::InvalidGroupType { .. })
    ));
    assert!(matches!(
        pl.add_group(GroupType::Select, 1, vec![bucket(&[1])]),
        Err(OfdpError::InvalidGroupType { .. })
    ));
    let mixed = vec![
        Bucket::weighted(1, ActionGroup::new(vec![Action::output(1)])),
        Bucket::weighted(0, ActionGroup::new(vec![Action::output(2)])),
    ];
    assert!(matches!(
        pl.add_group(GroupType::Select, 3, mixed),
        Err(OfdpError::InvalidGroupType { id: 3, .. })
    ));
    assert!(pl.groups().get(3).is_none());
    assert!(matches!(
        pl.add_group(GroupType::All, GROUP_ALL, vec![]),
        Err(OfdpError::InvalidArgument(_))
    ));
    assert!(matches!(
        pl.add_group(GroupType::All, 1, vec![bucket(&[PORT_TABLE])]),
        Err(OfdpError::InvalidArgument(_))
    ));

    pl.add_group(GroupType::All, 1, vec![]).unwrap();
    assert!(matches!(
        pl.add_group(GroupType::All, 1, vec![]),
        Err(OfdpError::GroupExists(1))
    ));
    assert!(matches!(
        pl.modify_group(GroupType::All, 9, vec![]),
        Err(OfdpError::UnknownGroup(9))
    ));
    assert!(matches!(pl.group_stats(9), Err(OfdpError::UnknownGroup(9))));
}

#[test]
fn flows_hold_references() {
    let (pl, _t0, _ev) = pipeline(1);
    pl.add_group(GroupType::Indirect, 1, vec![bucket(&[1])]).unwrap();
    pl.add_group(GroupType::Indirect, 2, vec![bucket(&[2])]).unwrap();

    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();
    pl.add_flow_entry(0, to_group(1, 81, 1), false, false).unwrap();
    assert_eq!(refs(&pl, 1), 2);

    // Moving an entry to another group moves its reference.
    let tmpl = entry(1, &[Match::tcp_dst(81)])
        .with_instructions(apply(vec![Action::group(2)]));
    pl.modify_flow_entry(0, tmpl, Strictness::Strict, false).unwrap();
    assert_eq!(refs(&pl, 1), 1);
    assert_eq!(refs(&pl, 2), 1);

    let tmpl = entry(0, &[]);
    pl.remove_flow_entry(0, &tmpl, Strictness::NonStrict, PORT_ANY, 2)
        .unwrap();
    assert_eq!(refs(&pl, 2), 0);
    assert_eq!(refs(&pl, 1), 1);
}

#[test]
fn delete_cascades_to_flows() {
    let (pl, _t0, ev) = pipeline(2);
    let dp = MockDatapath::new();

    pl.add_group(GroupType::All, 1, vec![bucket(&[10]), bucket(&[11])])
        .unwrap();
    pl.add_group(GroupType::Indirect, 2, vec![bucket(&[20])]).unwrap();

    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();
    pl.add_flow_entry(1, to_group(1, 81, 1), false, false).unwrap();
    pl.add_flow_entry(1, to_group(1, 82, 2), false, false).unwrap();
    let unrelated = entry(1, &[Match::tcp_dst(83)])
        .with_instructions(output_to(3));
    pl.add_flow_entry(0, unrelated, false, false).unwrap();

    pl.delete_group(1).unwrap();

    assert_eq!(pl.table(0).unwrap().len(), 1);
    assert_eq!(pl.table(1).unwrap().len(), 1);
    let removed = ev.removed();
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|r| r.reason == FlowRemoveReason::GroupDelete));
    assert!(pl.groups().get(1).is_none());
    assert_eq!(refs(&pl, 2), 1);
    for table in pl.tables() {
        assert!(table.find_entry_referencing_group(1).is_none());
    }

    // Traffic of the deleted flows now misses.
    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 2, 80));
    assert_eq!(dp.packet_ins(), vec![(0, PacketInReason::NoMatch)]);

    // Deleting what is not there is fine.
    pl.delete_group(1).unwrap();
}

#[test]
fn delete_all_groups() {
    let (pl, _t0, ev) = pipeline(1);
    pl.add_group(GroupType::Indirect, 1, vec![bucket(&[1])]).unwrap();
    pl.add_group(GroupType::Indirect, 2, vec![bucket(&[2])]).unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();
    pl.add_flow_entry(0, to_group(1, 81, 2), false, false).unwrap();

    pl.delete_group(GROUP_ALL).unwrap();
    assert_eq!(pl.groups().len(), 0);
    assert!(pl.table(0).unwrap().is_empty());
    assert_eq!(ev.removed().len(), 2);
    assert!(pl.group_stats(GROUP_ALL).unwrap().is_empty());
}

#[test]
fn modify_group_keeps_counters() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();

    pl.add_group(GroupType::Indirect, 1, vec![bucket(&[1])]).unwrap();
    pl.add_flow_entry(0, to_group(1, 80, 1), false, false).unwrap();
    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 2, 80));

    pl.modify_group(GroupType::All, 1, vec![bucket(&[2]), bucket(&[3])])
        .unwrap();
    pl.process_packet(&dp, TestPkt::new(2), tcp4(1, 2, 80));
    assert_eq!(dp.outputs(), vec![1, 2, 3]);

    let st = &pl.group_stats(1).unwrap()[0];
    assert_eq!(st.packet_count, 2);
    assert_eq!(st.ref_count, 1);
    assert!(st.buckets.iter().all(|b| b.packet_count == 1));

    let desc = pl.group_desc();
    assert_eq!(desc.len(), 1);
    assert_eq!(desc[0].group_type, GroupType::All);
    assert_eq!(desc[0].buckets.len(), 2);
}
