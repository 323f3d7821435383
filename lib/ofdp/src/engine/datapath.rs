// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The boundary between the engine and the platform that owns the
//! actual packet bytes.

use super::action::Action;
use super::packet::PacketMatches;
use crate::api::PacketInReason;

/// The packet primitives a hosting platform supplies.
///
/// The engine decides what happens to a packet; the platform makes
/// it happen. A packet handle passed by value to [`output`],
/// [`packet_in`] or [`drop_packet`] is gone as far as the engine is
/// concerned.
///
/// [`output`]: Datapath::output
/// [`packet_in`]: Datapath::packet_in
/// [`drop_packet`]: Datapath::drop_packet
pub trait Datapath {
    type Packet;

    /// Duplicate a packet so that it can be sent more than once.
    /// Returns `None` if the platform cannot allocate the copy; the
    /// output using it is then skipped.
    fn replicate(&self, pkt: &Self::Packet) -> Option<Self::Packet>;

    /// Transmit on `port`. Besides physical and logical ports this
    /// receives `FLOOD`, `ALL` and `LOCAL`, which the platform maps
    /// to its own meta ports.
    fn output(&self, pkt: Self::Packet, port: u32);

    /// Hand the packet to the controller.
    fn packet_in(
        &self,
        pkt: Self::Packet,
        table_id: u8,
        reason: PacketInReason,
        matches: &PacketMatches,
    );

    fn drop_packet(&self, pkt: Self::Packet);

    /// Apply a header rewrite: any action other than output, group
    /// and experimenter.
    fn modify(&self, pkt: &mut Self::Packet, action: &Action);

    /// Re-extract fields after a push or pop changed the header
    /// stack. The engine already tracks the obvious consequences
    /// (VLAN presence, the new ethertype).
    fn refresh_matches(&self, _pkt: &Self::Packet, _m: &mut PacketMatches) {}
}
