// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow table maintenance through the pipeline: insertion order,
//! overlap and replacement, modify and delete selection, and flow
//! statistics.

use ofdp_test_utils as common;

use common::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

const STRICT: Strictness = Strictness::Strict;
const NON_STRICT: Strictness = Strictness::NonStrict;

fn tcp_dst_entry(priority: u16, port: u16) -> FlowEntry {
    entry(
        priority,
        &[
            Match::eth_type(ETHER_TYPE_IPV4),
            Match::ip_proto(IP_PROTO_TCP),
            Match::tcp_dst(port),
        ],
    )
    .with_instructions(output_to(u32::from(port)))
}

#[test]
fn insertion_keeps_match_order() {
    let (pl, _t0, _ev) = pipeline(1);
    let mut rng = StdRng::seed_from_u64(0x0f_0f);
    let fields = [
        Match::eth_type(ETHER_TYPE_IPV4),
        Match::ip_proto(IP_PROTO_UDP),
        Match::udp_dst(53),
        Match::in_port(1),
        Match::vlan_pcp(3),
    ];

    for _ in 0..200 {
        let n = rng.random_range(0..=fields.len());
        let prio = rng.random_range(0..=u16::MAX);
        let e = entry(prio, &fields[..n]);
        pl.add_flow_entry(0, e, false, false).unwrap();
    }

    let keys = pl.table(0).unwrap().sort_keys();
    assert!(!keys.is_empty());
    for pair in keys.windows(2) {
        assert!(pair[0] >= pair[1], "{:?} before {:?}", pair[0], pair[1]);
    }
}

#[test]
fn more_matches_beat_higher_priority() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();

    let broad = entry(1000, &[Match::eth_type(ETHER_TYPE_IPV4)])
        .with_instructions(output_to(1));
    let narrow = tcp_dst_entry(10, 80);
    pl.add_flow_entry(0, broad, false, false).unwrap();
    pl.add_flow_entry(0, narrow, false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(1), tcp4(7, 0x0a00_0002, 80));
    pl.process_packet(&dp, TestPkt::new(2), tcp4(7, 0x0a00_0002, 22));
    assert_eq!(dp.outputs(), vec![80, 1]);
    dp.assert_disposed_once(2);
}

#[test]
fn overlap_check_rejects() {
    let (pl, _t0, _ev) = pipeline(1);

    let a = entry(100, &[Match::ipv4_dst(0x0a00_0000, 0xff00_0000)]);
    pl.add_flow_entry(0, a, true, false).unwrap();

    // Same priority and a packet could hit both.
    let b = entry(100, &[Match::ipv4_dst(0x0a01_0000, 0xffff_0000)]);
    assert!(matches!(
        pl.add_flow_entry(0, b, true, false),
        Err(OfdpError::Overlap)
    ));

    // Disjoint prefixes never overlap.
    let c = entry(100, &[Match::ipv4_dst(0x0b00_0000, 0xff00_0000)]);
    pl.add_flow_entry(0, c, true, false).unwrap();

    // Other priorities never overlap.
    let d = entry(99, &[Match::ipv4_dst(0x0a01_0000, 0xffff_0000)]);
    pl.add_flow_entry(0, d, true, false).unwrap();

    assert_eq!(pl.table(0).unwrap().len(), 3);
}

#[test]
fn identical_add_replaces_and_keeps_counters() {
    let (pl, _t0, ev) = pipeline(1);
    let dp = MockDatapath::new();

    let mut first = tcp_dst_entry(50, 443);
    first.set_notify_removal(true);
    pl.add_flow_entry(0, first, false, false).unwrap();

    for i in 0..3 {
        pl.process_packet(&dp, TestPkt::new(i), tcp4(1, 0x0a00_0002, 443));
    }

    let second = tcp_dst_entry(50, 443)
        .with_instructions(output_to(9));
    let second = pl.add_flow_entry(0, second, false, false).unwrap();
    assert_eq!(pl.table(0).unwrap().len(), 1);
    assert_eq!(second.stats().packets(), 3);
    assert_eq!(second.stats().bytes(), 180);

    // The replaced entry goes away silently.
    assert!(ev.removed().is_empty());

    pl.process_packet(&dp, TestPkt::new(3), tcp4(1, 0x0a00_0002, 443));
    assert_eq!(dp.outputs().last(), Some(&9));

    let third = tcp_dst_entry(50, 443);
    let third = pl.add_flow_entry(0, third, false, true).unwrap();
    assert_eq!(third.stats().packets(), 0);
    assert_eq!(pl.table(0).unwrap().len(), 1);
}

#[test]
fn table_full() {
    let cfg =
        PipelineConfig { max_entries: 2, ..PipelineConfig::with_tables(1) };
    let (pl, _t0, _ev) = pipeline_with(cfg);

    pl.add_flow_entry(0, tcp_dst_entry(1, 1), false, false).unwrap();
    pl.add_flow_entry(0, tcp_dst_entry(1, 2), false, false).unwrap();
    assert!(matches!(
        pl.add_flow_entry(0, tcp_dst_entry(1, 3), false, false),
        Err(OfdpError::TableFull { table: 0, max: 2 })
    ));
}

#[test]
fn non_strict_delete_selects_contained_entries() {
    let (pl, _t0, ev) = pipeline(1);

    for (prio, port) in [(10, 80), (20, 443), (30, 22)] {
        let mut e = tcp_dst_entry(prio, port);
        e.set_notify_removal(true);
        pl.add_flow_entry(0, e, false, false).unwrap();
    }
    let mut udp = entry(5, &[Match::ip_proto(IP_PROTO_UDP)]);
    udp.set_notify_removal(true);
    pl.add_flow_entry(0, udp, false, false).unwrap();

    // Every TCP entry is within "TCP", the UDP one is not.
    let tmpl = entry(0, &[Match::ip_proto(IP_PROTO_TCP)]);
    let n = pl
        .remove_flow_entry(0, &tmpl, NON_STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(pl.table(0).unwrap().len(), 1);

    let removed = ev.removed();
    assert_eq!(removed.len(), 3);
    assert!(removed.iter().all(|r| r.reason == FlowRemoveReason::Delete));
}

#[test]
fn containment_is_one_way() {
    let (pl, _t0, _ev) = pipeline(1);

    // A /16 entry is not inside a /24 request.
    let wide = entry(10, &[Match::ipv4_dst(0x0a01_0000, 0xffff_0000)]);
    pl.add_flow_entry(0, wide, false, false).unwrap();

    let narrow = entry(0, &[Match::ipv4_dst(0x0a01_0100, 0xffff_ff00)]);
    let n = pl
        .remove_flow_entry(0, &narrow, NON_STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 0);

    // The other way around it is.
    let wider = entry(0, &[Match::ipv4_dst(0x0a00_0000, 0xff00_0000)]);
    let n = pl
        .remove_flow_entry(0, &wider, NON_STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 1);
}

#[test]
fn delete_filters_on_out_port() {
    let (pl, _t0, _ev) = pipeline(1);
    pl.add_flow_entry(0, tcp_dst_entry(10, 80), false, false).unwrap();
    pl.add_flow_entry(0, tcp_dst_entry(10, 443), false, false).unwrap();

    let all = FlowEntry::new(0);
    let n = pl
        .remove_flow_entry(0, &all, NON_STRICT, 443, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 1);

    let left = pl.flow_stats(0, &FlowStatsQuery::default()).unwrap();
    assert_eq!(left.len(), 1);
    assert!(left[0].instructions.has_output(80));
}

#[test]
fn strict_delete_needs_exact_entry() {
    let (pl, _t0, _ev) = pipeline(2);
    pl.add_flow_entry(1, tcp_dst_entry(10, 80), false, false).unwrap();

    let wrong_prio = tcp_dst_entry(11, 80);
    let n = pl
        .remove_flow_entry(1, &wrong_prio, STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 0);

    let subset = entry(10, &[Match::tcp_dst(80)]);
    let n = pl
        .remove_flow_entry(1, &subset, STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 0);

    let exact = tcp_dst_entry(10, 80);
    let n = pl
        .remove_flow_entry(TABLE_ALL, &exact, STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 1);
    assert!(pl.table(1).unwrap().is_empty());
}

#[test]
fn strict_modify_and_delete_select_alike() {
    let (pl, _t0, ev) = pipeline(1);
    let dp = MockDatapath::new();

    // Same match and priority, told apart only by their cookies.
    for cookie in [1, 2] {
        let mut e = tcp_dst_entry(10, 80);
        e.set_cookie(cookie, u64::MAX);
        pl.add_flow_entry(0, e, false, false).unwrap();
    }
    assert_eq!(pl.table(0).unwrap().len(), 2);

    // A zero cookie mask lets a strict template take both.
    let tmpl = tcp_dst_entry(10, 80).with_instructions(output_to(42));
    assert_eq!(pl.modify_flow_entry(0, tmpl, STRICT, false).unwrap(), 2);
    assert_eq!(ev.num_modified(), 2);

    pl.process_packet(&dp, TestPkt::new(0), tcp4(1, 0x0a00_0002, 80));
    assert_eq!(dp.outputs(), vec![42]);

    let tmpl = tcp_dst_entry(10, 80);
    let n = pl
        .remove_flow_entry(0, &tmpl, STRICT, PORT_ANY, GROUP_ANY)
        .unwrap();
    assert_eq!(n, 2);
    assert!(pl.table(0).unwrap().is_empty());
}

#[test]
fn modify_swaps_instructions() {
    let (pl, _t0, ev) = pipeline(1);
    let dp = MockDatapath::new();
    pl.add_flow_entry(0, tcp_dst_entry(10, 80), false, false).unwrap();
    pl.add_flow_entry(0, tcp_dst_entry(10, 443), false, false).unwrap();

    pl.process_packet(&dp, TestPkt::new(0), tcp4(1, 0x0a00_0002, 80));

    let tmpl = entry(0, &[Match::eth_type(ETHER_TYPE_IPV4)])
        .with_instructions(output_to(42));
    let n = pl.modify_flow_entry(0, tmpl, NON_STRICT, false).unwrap();
    assert_eq!(n, 2);
    assert_eq!(ev.num_modified(), 2);

    pl.process_packet(&dp, TestPkt::new(1), tcp4(1, 0x0a00_0002, 80));
    pl.process_packet(&dp, TestPkt::new(2), tcp4(1, 0x0a00_0002, 443));
    assert_eq!(dp.outputs(), vec![80, 42, 42]);

    // Counters survive unless asked otherwise.
    let q = FlowStatsQuery {
        matches: vec![Match::tcp_dst(80)],
        ..Default::default()
    };
    let recs = pl.flow_stats(0, &q).unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].packet_count, 2);

    let tmpl = tcp_dst_entry(10, 80).with_instructions(output_to(43));
    pl.modify_flow_entry(0, tmpl, STRICT, true).unwrap();
    let recs = pl.flow_stats(0, &q).unwrap();
    assert_eq!(recs[0].packet_count, 0);
    assert!(recs[0].instructions.has_output(43));
}

#[test]
fn modify_selecting_nothing_is_fine() {
    let (pl, _t0, _ev) = pipeline(1);
    let tmpl = entry(0, &[Match::tcp_dst(1)]).with_instructions(output_to(2));
    let n = pl.modify_flow_entry(0, tmpl, NON_STRICT, false).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn flow_stats_select_by_cookie() {
    let (pl, _t0, _ev) = pipeline(2);
    for (table, cookie) in [(0, 0x1_00), (0, 0x1_01), (1, 0x2_00)] {
        let mut e = entry(1, &[Match::tcp_dst(cookie as u16)]);
        e.set_cookie(cookie, u64::MAX);
        pl.add_flow_entry(table, e, false, false).unwrap();
    }

    let q = FlowStatsQuery {
        cookie: 0x1_00,
        cookie_mask: 0xf_00,
        ..Default::default()
    };
    let recs = pl.flow_stats(TABLE_ALL, &q).unwrap();
    assert_eq!(recs.len(), 2);
    assert!(recs.iter().all(|r| r.table_id == 0));

    let all = FlowStatsQuery::default();
    let agg = pl.aggregate_stats(TABLE_ALL, &all).unwrap();
    assert_eq!(agg.flow_count, 3);

    assert!(matches!(
        pl.flow_stats(7, &q),
        Err(OfdpError::BadTableId(7))
    ));
}

#[test]
fn aggregate_counts_hits() {
    let (pl, _t0, _ev) = pipeline(1);
    let dp = MockDatapath::new();
    pl.add_flow_entry(0, tcp_dst_entry(10, 80), false, false).unwrap();
    pl.add_flow_entry(0, tcp_dst_entry(10, 443), false, false).unwrap();

    for i in 0..4 {
        let port = if i % 2 == 0 { 80 } else { 443 };
        pl.process_packet(&dp, TestPkt::new(i), tcp4(1, 0x0a00_0002, port));
    }

    let agg = pl.aggregate_stats(0, &FlowStatsQuery::default()).unwrap();
    assert_eq!(agg.flow_count, 2);
    assert_eq!(agg.packet_count, 4);
    assert_eq!(agg.byte_count, 240);
}

#[test]
fn validation_against_table_config() {
    let mut cfg = PipelineConfig::with_tables(2);
    cfg.tables.insert(
        1,
        TableConfig {
            match_fields: ofdp::api::MatchField::EthType.bit()
                | ofdp::api::MatchField::IpProto.bit(),
            ..Default::default()
        },
    );
    let (pl, _t0, _ev) = pipeline_with(cfg);

    let e = entry(1, &[Match::tcp_dst(80)]);
    assert!(matches!(
        pl.add_flow_entry(1, e, false, false),
        Err(OfdpError::InvalidArgument(_))
    ));

    // Goto must move forward and stay in range.
    let back = InstructionGroup::new().goto_table(0);
    let e = entry(1, &[]).with_instructions(back);
    assert!(matches!(
        pl.add_flow_entry(0, e, false, false),
        Err(OfdpError::BadTableId(0))
    ));
    let past = InstructionGroup::new().goto_table(2);
    let e = entry(1, &[]).with_instructions(past);
    assert!(matches!(
        pl.add_flow_entry(0, e, false, false),
        Err(OfdpError::BadTableId(2))
    ));

    let e = entry(1, &[]).with_instructions(apply(vec![Action::group(5)]));
    assert!(matches!(
        pl.add_flow_entry(0, e, false, false),
        Err(OfdpError::UnknownGroup(5))
    ));

    assert!(matches!(
        pl.add_flow_entry(9, FlowEntry::new(1), false, false),
        Err(OfdpError::BadTableId(9))
    ));
}

#[test]
fn duplicate_match_field_rejected() {
    let mut e = FlowEntry::new(1);
    e.add_match(Match::tcp_dst(80)).unwrap();
    assert!(matches!(
        e.add_match(Match::tcp_dst(81)),
        Err(OfdpError::InvalidArgument(_))
    ));
}

#[test]
fn fresh_entry_reads_back() {
    let (pl, t0, _ev) = pipeline(1);
    let e = tcp_dst_entry(7, 8443);
    let matches = e.matches().to_vec();
    pl.add_flow_entry_at(0, e, false, false, t0).unwrap();

    let recs = pl
        .flow_stats_at(0, &FlowStatsQuery::default(), at(t0, 2))
        .unwrap();
    assert_eq!(recs.len(), 1);
    let rec = &recs[0];
    assert_eq!(rec.priority, 7);
    assert_eq!((rec.packet_count, rec.byte_count), (0, 0));
    assert_eq!(rec.duration, Duration::from_secs(2));
    assert_eq!(rec.matches.len(), matches.len());
    assert!(
        rec.matches.iter().zip(&matches).all(|(a, b)| a.equals(b)),
        "{:?} != {matches:?}",
        rec.matches
    );
}

#[test]
fn empty_table_lookup() {
    let (pl, _t0, _ev) = pipeline(1);
    let table = pl.table(0).unwrap();

    assert!(table.find_best_match(&tcp4(1, 2, 80)).is_none());
    let ts = table.stats();
    assert_eq!((ts.lookup_count, ts.matched_count), (1, 0));
    assert_eq!(ts.active_count, 0);
}

#[test]
fn stale_handle_removal() {
    let (pl, _t0, _ev) = pipeline(2);
    let e = pl.add_flow_entry(0, tcp_dst_entry(1, 80), false, false).unwrap();

    // Wrong table.
    assert!(matches!(
        pl.table(1).unwrap().remove_specific(&e, FlowRemoveReason::Delete),
        Err(OfdpError::InvalidArgument(_))
    ));

    let table = pl.table(0).unwrap();
    table.remove_specific(&e, FlowRemoveReason::Delete).unwrap();
    assert!(e.is_detached());
    assert!(matches!(
        table.remove_specific(&e, FlowRemoveReason::Delete),
        Err(OfdpError::NotFound)
    ));
}
