// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

use slog::Drain;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

// Let's make our lives easier and pub use a bunch of stuff.
pub use ofdp::api::FlowRemoveReason;
pub use ofdp::api::GROUP_ALL;
pub use ofdp::api::GROUP_ANY;
pub use ofdp::api::GroupType;
pub use ofdp::api::OfdpError;
pub use ofdp::api::PORT_ALL;
pub use ofdp::api::PORT_ANY;
pub use ofdp::api::PORT_CONTROLLER;
pub use ofdp::api::PORT_FLOOD;
pub use ofdp::api::PORT_IN_PORT;
pub use ofdp::api::PORT_TABLE;
pub use ofdp::api::PacketInReason;
pub use ofdp::api::Strictness;
pub use ofdp::api::TABLE_ALL;
pub use ofdp::api::TableMissConfig;
pub use ofdp::config::PipelineConfig;
pub use ofdp::config::TableConfig;
pub use ofdp::ddi::time::Moment;
pub use ofdp::engine::Datapath;
pub use ofdp::engine::Pipeline;
pub use ofdp::engine::action::Action;
pub use ofdp::engine::action::ActionGroup;
pub use ofdp::engine::action::SetField;
pub use ofdp::engine::action::WriteActions;
pub use ofdp::engine::flow_entry::FlowEntry;
pub use ofdp::engine::flow_match::Match;
pub use ofdp::engine::flow_table::FlowTable;
pub use ofdp::engine::group_table::Bucket;
pub use ofdp::engine::instruction::InstructionGroup;
pub use ofdp::engine::packet::ETHER_TYPE_IPV4;
pub use ofdp::engine::packet::IP_PROTO_TCP;
pub use ofdp::engine::packet::IP_PROTO_UDP;
pub use ofdp::engine::packet::PacketMatches;
pub use ofdp::engine::stat::FlowStatsQuery;
pub use ofdp::provider::FlowEventProvider;
pub use ofdp::provider::Providers;
pub use ofdp::provider::SlogLog;
pub use std::sync::Arc;
pub use std::time::Duration;

/// A stand-in for a packet buffer. Replicas share the id of their
/// original and get a fresh `copy` number; originals are copy 0.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct TestPkt {
    pub id: u32,
    pub copy: u32,
}

impl TestPkt {
    pub fn new(id: u32) -> Self {
        Self { id, copy: 0 }
    }

    pub fn is_original(&self) -> bool {
        self.copy == 0
    }
}

/// Everything the engine asked the datapath to do, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DpEvent {
    Output { pkt: TestPkt, port: u32 },
    PacketIn { pkt: TestPkt, table_id: u8, reason: PacketInReason },
    Drop { pkt: TestPkt },
    Modify { pkt: TestPkt, action: String },
}

/// A datapath which records every call instead of touching packets.
#[derive(Debug, Default)]
pub struct MockDatapath {
    events: Mutex<Vec<DpEvent>>,
    next_copy: AtomicU32,
    replicas: AtomicU32,
    fail_replicate: AtomicBool,
}

impl MockDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following replicate fail, as if out of buffers.
    pub fn fail_replicate(&self, fail: bool) {
        self.fail_replicate.store(fail, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<DpEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn num_replicas(&self) -> u32 {
        self.replicas.load(Ordering::Relaxed)
    }

    /// Ports output to, in order.
    pub fn outputs(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DpEvent::Output { port, .. } => Some(port),
                _ => None,
            })
            .collect()
    }

    pub fn packet_ins(&self) -> Vec<(u8, PacketInReason)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DpEvent::PacketIn { table_id, reason, .. } => {
                    Some((table_id, reason))
                }
                _ => None,
            })
            .collect()
    }

    pub fn drops(&self) -> Vec<TestPkt> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DpEvent::Drop { pkt } => Some(pkt),
                _ => None,
            })
            .collect()
    }

    pub fn modifies(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DpEvent::Modify { action, .. } => Some(action),
                _ => None,
            })
            .collect()
    }

    /// How many times each packet handle was given up.
    pub fn disposals(&self) -> BTreeMap<TestPkt, usize> {
        let mut out = BTreeMap::new();
        for e in self.events() {
            let pkt = match e {
                DpEvent::Output { pkt, .. }
                | DpEvent::PacketIn { pkt, .. }
                | DpEvent::Drop { pkt } => pkt,
                DpEvent::Modify { .. } => continue,
            };
            *out.entry(pkt).or_insert(0) += 1;
        }
        out
    }

    /// Every original and every replica was disposed of exactly once.
    pub fn assert_disposed_once(&self, originals: u32) {
        let disposals = self.disposals();
        for (pkt, n) in &disposals {
            assert_eq!(*n, 1, "{pkt:?} disposed of {n} times");
        }
        let orig = disposals.keys().filter(|p| p.is_original()).count();
        assert_eq!(orig, originals as usize, "originals disposed");
        assert_eq!(
            disposals.len() - orig,
            self.num_replicas() as usize,
            "replicas disposed"
        );
    }

    fn record(&self, ev: DpEvent) {
        self.events.lock().unwrap().push(ev);
    }
}

impl Datapath for MockDatapath {
    type Packet = TestPkt;

    fn replicate(&self, pkt: &TestPkt) -> Option<TestPkt> {
        if self.fail_replicate.load(Ordering::Relaxed) {
            return None;
        }

        self.replicas.fetch_add(1, Ordering::Relaxed);
        let copy = self.next_copy.fetch_add(1, Ordering::Relaxed) + 1;
        Some(TestPkt { id: pkt.id, copy })
    }

    fn output(&self, pkt: TestPkt, port: u32) {
        self.record(DpEvent::Output { pkt, port });
    }

    fn packet_in(
        &self,
        pkt: TestPkt,
        table_id: u8,
        reason: PacketInReason,
        _matches: &PacketMatches,
    ) {
        self.record(DpEvent::PacketIn { pkt, table_id, reason });
    }

    fn drop_packet(&self, pkt: TestPkt) {
        self.record(DpEvent::Drop { pkt });
    }

    fn modify(&self, pkt: &mut TestPkt, action: &Action) {
        self.record(DpEvent::Modify { pkt: *pkt, action: action.to_string() });
    }
}

/// A flow removal notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Removed {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub reason: FlowRemoveReason,
}

/// Flow lifecycle events, as seen by the controller side.
#[derive(Clone, Debug, Default)]
pub struct RecordingEvents {
    pub added: Arc<AtomicU32>,
    pub modified: Arc<AtomicU32>,
    pub removed: Arc<Mutex<Vec<Removed>>>,
}

impl RecordingEvents {
    pub fn removed(&self) -> Vec<Removed> {
        self.removed.lock().unwrap().clone()
    }

    pub fn num_added(&self) -> u32 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn num_modified(&self) -> u32 {
        self.modified.load(Ordering::Relaxed)
    }
}

impl FlowEventProvider for RecordingEvents {
    fn flow_added(&self, _table_id: u8, _entry: &FlowEntry) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    fn flow_modified(&self, _table_id: u8, _entry: &FlowEntry) {
        self.modified.fetch_add(1, Ordering::Relaxed);
    }

    fn flow_removed(
        &self,
        table_id: u8,
        entry: &FlowEntry,
        reason: FlowRemoveReason,
    ) {
        self.removed.lock().unwrap().push(Removed {
            table_id,
            priority: entry.priority(),
            cookie: entry.cookie(),
            reason,
        });
    }
}

/// A logger for tests, writing through the test harness's captured
/// stdout.
pub fn test_logger() -> slog::Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "ofdp-test"))
}

/// Providers logging through slog and recording flow events.
pub fn providers() -> (Providers, RecordingEvents) {
    let events = RecordingEvents::default();
    let providers = Providers {
        log: Box::new(SlogLog::new(test_logger())),
        events: Box::new(events.clone()),
    };
    (providers, events)
}

/// A pipeline with `num_tables` default tables, its epoch and its
/// flow event recorder.
pub fn pipeline(num_tables: u8) -> (Pipeline, Moment, RecordingEvents) {
    pipeline_with(PipelineConfig::with_tables(num_tables))
}

pub fn pipeline_with(
    cfg: PipelineConfig,
) -> (Pipeline, Moment, RecordingEvents) {
    let (providers, events) = providers();
    let t0 = Moment::now();
    let pl = Pipeline::new_at(&cfg, providers, t0).unwrap();
    (pl, t0, events)
}

/// `t0 + secs`.
pub fn at(t0: Moment, secs: u64) -> Moment {
    t0 + Duration::from_secs(secs)
}

/// A TCP/IPv4 packet arriving on `port_in`.
pub fn tcp4(port_in: u32, dst: u32, dport: u16) -> PacketMatches {
    PacketMatches {
        pkt_size: 60,
        port_in,
        phy_port_in: port_in,
        eth_type: ETHER_TYPE_IPV4,
        ip_proto: IP_PROTO_TCP,
        ipv4_src: 0x0a00_0001,
        ipv4_dst: dst,
        tcp_src: 33333,
        tcp_dst: dport,
        ..Default::default()
    }
}

/// A flow entry with the given matches.
pub fn entry(priority: u16, matches: &[Match]) -> FlowEntry {
    let mut e = FlowEntry::new(priority);
    for m in matches {
        e.add_match(*m).unwrap();
    }
    e
}

/// Instructions applying `actions` immediately.
pub fn apply(actions: Vec<Action>) -> InstructionGroup {
    InstructionGroup::new().apply_actions(ActionGroup::new(actions))
}

/// Instructions outputting to `port` immediately.
pub fn output_to(port: u32) -> InstructionGroup {
    apply(vec![Action::output(port)])
}
