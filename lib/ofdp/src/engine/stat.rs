// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Counters kept as flows, tables, groups and ports are used.
//!
//! Packet-path updates are plain relaxed atomic adds; readers take a
//! snapshot converted into the serializable `api` types. A snapshot
//! taken while packets are in flight may be off by those packets,
//! which OpenFlow statistics tolerate.

use super::flow_match::Match;
use super::instruction::InstructionGroup;
use crate::api::AggregateStats;
use crate::api::BucketStats;
use crate::api::FlowStatsDump;
use crate::api::PortStats;
use crate::api::QueueStats;
use crate::api::TableStats;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Moment;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;

/// A packet and byte count pair.
#[derive(Debug, Default)]
pub struct PacketCounter {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl PacketCounter {
    #[inline]
    pub fn hit(&self, pkt_size: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(pkt_size, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn copy_from(&self, other: &Self) {
        self.packets.store(other.packets(), Ordering::Relaxed);
        self.bytes.store(other.bytes(), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Counters of a single flow entry.
#[derive(Debug)]
pub struct FlowStats {
    counter: PacketCounter,
    installed: KMutex<Moment>,
}

impl FlowStats {
    pub fn new(installed: Moment) -> Self {
        Self {
            counter: PacketCounter::default(),
            installed: KMutex::new(installed),
        }
    }

    #[inline]
    pub fn hit(&self, pkt_size: u64) {
        self.counter.hit(pkt_size);
    }

    pub fn packets(&self) -> u64 {
        self.counter.packets()
    }

    pub fn bytes(&self) -> u64 {
        self.counter.bytes()
    }

    pub fn installed(&self) -> Moment {
        *self.installed.lock()
    }

    pub(crate) fn set_installed(&self, when: Moment) {
        *self.installed.lock() = when;
    }

    /// Carry the counters and install time of an entry being
    /// replaced over to its replacement.
    pub(crate) fn copy_from(&self, other: &Self) {
        self.counter.copy_from(&other.counter);
        self.set_installed(other.installed());
    }

    pub(crate) fn reset(&self, now: Moment) {
        self.counter.reset();
        self.set_installed(now);
    }
}

/// Lookup counters of one flow table.
#[derive(Debug, Default)]
pub struct TableCounters {
    lookups: AtomicU64,
    matched: AtomicU64,
}

impl TableCounters {
    #[inline]
    pub(crate) fn lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, table_id: u8, active_count: u32) -> TableStats {
        TableStats {
            table_id,
            active_count,
            lookup_count: self.lookups.load(Ordering::Relaxed),
            matched_count: self.matched.load(Ordering::Relaxed),
        }
    }
}

/// Counters of a switch port. The engine counts receives as packets
/// enter the pipeline; transmits are counted by the platform, which
/// is the only one to know whether an output succeeded.
#[derive(Debug, Default)]
pub struct PortCounters {
    pub rx: PacketCounter,
    pub tx: PacketCounter,
}

impl PortCounters {
    pub fn snapshot(&self, port_no: u32) -> PortStats {
        PortStats {
            port_no,
            rx_packets: self.rx.packets(),
            tx_packets: self.tx.packets(),
            rx_bytes: self.rx.bytes(),
            tx_bytes: self.tx.bytes(),
        }
    }
}

/// Counters of one queue of a port, maintained by the platform.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub tx: PacketCounter,
    pub errors: AtomicU64,
}

impl QueueCounters {
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, port_no: u32, queue_id: u32) -> QueueStats {
        QueueStats {
            port_no,
            queue_id,
            tx_bytes: self.tx.bytes(),
            tx_packets: self.tx.packets(),
            tx_errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Counters of a group: traffic through it and the number of flow
/// entries referencing it.
#[derive(Debug, Default)]
pub struct GroupCounters {
    pub(crate) counter: PacketCounter,
    refs: AtomicU32,
}

impl GroupCounters {
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ref_dec(&self) {
        // Saturate rather than wrap should accounting ever go wrong.
        let _ = self.refs.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    pub fn packets(&self) -> u64 {
        self.counter.packets()
    }

    pub fn bytes(&self) -> u64 {
        self.counter.bytes()
    }
}

impl From<&PacketCounter> for BucketStats {
    fn from(val: &PacketCounter) -> Self {
        BucketStats { packet_count: val.packets(), byte_count: val.bytes() }
    }
}

/// What a flow stats request selects on.
#[derive(Clone, Debug)]
pub struct FlowStatsQuery {
    pub matches: Vec<Match>,
    pub cookie: u64,
    pub cookie_mask: u64,
    pub out_port: u32,
    pub out_group: u32,
}

impl Default for FlowStatsQuery {
    /// Every flow.
    fn default() -> Self {
        Self {
            matches: vec![],
            cookie: 0,
            cookie_mask: 0,
            out_port: crate::api::PORT_ANY,
            out_group: crate::api::GROUP_ANY,
        }
    }
}

/// One flow entry as seen by a flow stats request.
#[derive(Clone, Debug)]
pub struct FlowStatsRecord {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub duration: Duration,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
    pub matches: Vec<Match>,
    pub instructions: InstructionGroup,
}

impl From<&FlowStatsRecord> for FlowStatsDump {
    fn from(val: &FlowStatsRecord) -> Self {
        let secs = val.duration.as_secs();
        FlowStatsDump {
            table_id: val.table_id,
            priority: val.priority,
            cookie: val.cookie,
            duration_sec: u32::try_from(secs).unwrap_or(u32::MAX),
            duration_nsec: val.duration.subsec_nanos(),
            idle_timeout: val.idle_timeout,
            hard_timeout: val.hard_timeout,
            packet_count: val.packet_count,
            byte_count: val.byte_count,
            matches: val.matches.iter().map(|m| m.to_string()).collect(),
            instructions: val.instructions.describe(),
        }
    }
}

/// Sum the counters of a set of flow stats records.
pub fn aggregate<'a, I>(records: I) -> AggregateStats
where
    I: IntoIterator<Item = &'a FlowStatsRecord>,
{
    records.into_iter().fold(AggregateStats::default(), |mut acc, r| {
        acc.packet_count += r.packet_count;
        acc.byte_count += r.byte_count;
        acc.flow_count += 1;
        acc
    })
}
