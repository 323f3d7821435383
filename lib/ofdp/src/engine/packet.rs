// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The header-field snapshot of a packet, and the per-packet state
//! carried through the pipeline.

use super::action::SetField;
use super::action::WriteActions;
use crate::api::MatchField;
use crate::api::VLAN_VID_PRESENT;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_IPV6: u16 = 0x86dd;
pub const ETHER_TYPE_MPLS: u16 = 0x8847;
pub const ETHER_TYPE_MPLS_MCAST: u16 = 0x8848;
pub const ETHER_TYPE_PPPOE_DISC: u16 = 0x8863;
pub const ETHER_TYPE_PPPOE_SESS: u16 = 0x8864;

pub const PPP_PROTO_IPV4: u16 = 0x0021;
pub const PPP_PROTO_IPV6: u16 = 0x0057;

pub const IP_PROTO_ICMPV4: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ICMPV6: u8 = 58;
pub const IP_PROTO_SCTP: u8 = 132;

pub const ICMPV6_ND_SOLICIT: u8 = 135;
pub const ICMPV6_ND_ADVERT: u8 = 136;

/// Every header field a flow entry can match on, extracted once per
/// packet by the platform before the first table lookup.
///
/// All values are host-order unsigned integers. Fields of headers
/// that are not present are left zero; the matching code consults
/// the protocol fields (`eth_type`, `ip_proto`, ...) before trusting
/// any of them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PacketMatches {
    /// Size of the whole frame, used for byte counters.
    pub pkt_size: u64,

    pub port_in: u32,
    pub phy_port_in: u32,
    pub metadata: u64,

    pub eth_dst: u64,
    pub eth_src: u64,
    /// The innermost ethertype, past any VLAN tags.
    pub eth_type: u16,

    pub has_vlan: bool,
    pub vlan_vid: u16,
    pub vlan_pcp: u8,

    pub mpls_label: u32,
    pub mpls_tc: u8,

    pub pppoe_code: u8,
    pub pppoe_type: u8,
    pub pppoe_sid: u16,
    pub ppp_proto: u16,

    pub arp_op: u16,
    pub arp_sha: u64,
    pub arp_spa: u32,
    pub arp_tha: u64,
    pub arp_tpa: u32,

    pub ip_proto: u8,
    pub ip_dscp: u8,
    pub ip_ecn: u8,

    pub ipv4_src: u32,
    pub ipv4_dst: u32,

    pub ipv6_src: u128,
    pub ipv6_dst: u128,
    pub ipv6_flabel: u32,
    pub ipv6_nd_target: u128,
    pub ipv6_nd_sll: u64,
    pub ipv6_nd_tll: u64,

    pub tcp_src: u16,
    pub tcp_dst: u16,
    pub udp_src: u16,
    pub udp_dst: u16,
    pub sctp_src: u16,
    pub sctp_dst: u16,

    pub icmpv4_type: u8,
    pub icmpv4_code: u8,
    pub icmpv6_type: u8,
    pub icmpv6_code: u8,
}

impl PacketMatches {
    pub fn is_ipv4(&self) -> bool {
        self.eth_type == ETHER_TYPE_IPV4
            || (self.eth_type == ETHER_TYPE_PPPOE_SESS
                && self.ppp_proto == PPP_PROTO_IPV4)
    }

    pub fn is_ipv6(&self) -> bool {
        self.eth_type == ETHER_TYPE_IPV6
            || (self.eth_type == ETHER_TYPE_PPPOE_SESS
                && self.ppp_proto == PPP_PROTO_IPV6)
    }

    fn is_ip(&self) -> bool {
        self.is_ipv4() || self.is_ipv6()
    }

    fn is_l4(&self, proto: u8) -> bool {
        self.is_ip() && self.ip_proto == proto
    }

    fn is_icmpv6(&self) -> bool {
        self.is_ipv6() && self.ip_proto == IP_PROTO_ICMPV6
    }

    fn is_mpls(&self) -> bool {
        self.eth_type == ETHER_TYPE_MPLS
            || self.eth_type == ETHER_TYPE_MPLS_MCAST
    }

    fn is_pppoe(&self) -> bool {
        self.eth_type == ETHER_TYPE_PPPOE_DISC
            || self.eth_type == ETHER_TYPE_PPPOE_SESS
    }

    /// The value of `field` in this packet, or `None` when the
    /// headers the field lives in are not present.
    ///
    /// A missing prerequisite makes any match on the field fail: it
    /// is never treated as "don't care".
    pub fn field_value(&self, field: MatchField) -> Option<u128> {
        use MatchField::*;

        let present = match field {
            InPort | Metadata | EthDst | EthSrc | EthType | VlanVid => true,
            InPhyPort => self.phy_port_in != 0,
            VlanPcp => self.has_vlan,
            IpDscp | IpEcn | IpProto => self.is_ip(),
            Ipv4Src | Ipv4Dst => self.is_ipv4(),
            TcpSrc | TcpDst => self.is_l4(IP_PROTO_TCP),
            UdpSrc | UdpDst => self.is_l4(IP_PROTO_UDP),
            SctpSrc | SctpDst => self.is_l4(IP_PROTO_SCTP),
            Icmpv4Type | Icmpv4Code => {
                self.is_ipv4() && self.ip_proto == IP_PROTO_ICMPV4
            }
            ArpOp | ArpSpa | ArpTpa | ArpSha | ArpTha => {
                self.eth_type == ETHER_TYPE_ARP
            }
            Ipv6Src | Ipv6Dst | Ipv6Flabel => self.is_ipv6(),
            Icmpv6Type | Icmpv6Code => self.is_icmpv6(),
            Ipv6NdTarget => {
                self.is_icmpv6()
                    && (self.icmpv6_type == ICMPV6_ND_SOLICIT
                        || self.icmpv6_type == ICMPV6_ND_ADVERT)
            }
            Ipv6NdSll => {
                self.is_icmpv6()
                    && self.icmpv6_type == ICMPV6_ND_SOLICIT
                    && self.ipv6_nd_sll != 0
            }
            Ipv6NdTll => {
                self.is_icmpv6()
                    && self.icmpv6_type == ICMPV6_ND_ADVERT
                    && self.ipv6_nd_tll != 0
            }
            MplsLabel | MplsTc => self.is_mpls(),
            PppoeCode | PppoeType | PppoeSid => self.is_pppoe(),
            PppProt => self.eth_type == ETHER_TYPE_PPPOE_SESS,
        };

        if !present {
            return None;
        }

        let val = match field {
            InPort => u128::from(self.port_in),
            InPhyPort => u128::from(self.phy_port_in),
            Metadata => u128::from(self.metadata),
            EthDst => u128::from(self.eth_dst),
            EthSrc => u128::from(self.eth_src),
            EthType => u128::from(self.eth_type),
            VlanVid => {
                if self.has_vlan {
                    u128::from(self.vlan_vid | VLAN_VID_PRESENT)
                } else {
                    0
                }
            }
            VlanPcp => u128::from(self.vlan_pcp),
            IpDscp => u128::from(self.ip_dscp),
            IpEcn => u128::from(self.ip_ecn),
            IpProto => u128::from(self.ip_proto),
            Ipv4Src => u128::from(self.ipv4_src),
            Ipv4Dst => u128::from(self.ipv4_dst),
            TcpSrc => u128::from(self.tcp_src),
            TcpDst => u128::from(self.tcp_dst),
            UdpSrc => u128::from(self.udp_src),
            UdpDst => u128::from(self.udp_dst),
            SctpSrc => u128::from(self.sctp_src),
            SctpDst => u128::from(self.sctp_dst),
            Icmpv4Type => u128::from(self.icmpv4_type),
            Icmpv4Code => u128::from(self.icmpv4_code),
            ArpOp => u128::from(self.arp_op),
            ArpSpa => u128::from(self.arp_spa),
            ArpTpa => u128::from(self.arp_tpa),
            ArpSha => u128::from(self.arp_sha),
            ArpTha => u128::from(self.arp_tha),
            Ipv6Src => self.ipv6_src,
            Ipv6Dst => self.ipv6_dst,
            Ipv6Flabel => u128::from(self.ipv6_flabel),
            Icmpv6Type => u128::from(self.icmpv6_type),
            Icmpv6Code => u128::from(self.icmpv6_code),
            Ipv6NdTarget => self.ipv6_nd_target,
            Ipv6NdSll => u128::from(self.ipv6_nd_sll),
            Ipv6NdTll => u128::from(self.ipv6_nd_tll),
            MplsLabel => u128::from(self.mpls_label),
            MplsTc => u128::from(self.mpls_tc),
            PppoeCode => u128::from(self.pppoe_code),
            PppoeType => u128::from(self.pppoe_type),
            PppoeSid => u128::from(self.pppoe_sid),
            PppProt => u128::from(self.ppp_proto),
        };

        Some(val & field.width_mask())
    }

    /// Mirror a set-field action into the snapshot so that later
    /// tables and actions see the rewritten value.
    pub fn apply_set_field(&mut self, sf: &SetField) {
        match *sf {
            SetField::EthDst(v) => self.eth_dst = v,
            SetField::EthSrc(v) => self.eth_src = v,
            SetField::EthType(v) => self.eth_type = v,
            SetField::VlanVid(v) => self.vlan_vid = v & !VLAN_VID_PRESENT,
            SetField::VlanPcp(v) => self.vlan_pcp = v,
            SetField::IpDscp(v) => self.ip_dscp = v,
            SetField::IpEcn(v) => self.ip_ecn = v,
            SetField::IpProto(v) => self.ip_proto = v,
            SetField::Ipv4Src(v) => self.ipv4_src = v,
            SetField::Ipv4Dst(v) => self.ipv4_dst = v,
            SetField::TcpSrc(v) => self.tcp_src = v,
            SetField::TcpDst(v) => self.tcp_dst = v,
            SetField::UdpSrc(v) => self.udp_src = v,
            SetField::UdpDst(v) => self.udp_dst = v,
            SetField::Icmpv4Type(v) => self.icmpv4_type = v,
            SetField::Icmpv4Code(v) => self.icmpv4_code = v,
            SetField::MplsLabel(v) => self.mpls_label = v,
            SetField::MplsTc(v) => self.mpls_tc = v,
            SetField::PppoeCode(v) => self.pppoe_code = v,
            SetField::PppoeType(v) => self.pppoe_type = v,
            SetField::PppoeSid(v) => self.pppoe_sid = v,
            SetField::PppProto(v) => self.ppp_proto = v,
        }
    }
}

/// A packet on its way through the pipeline: the platform's packet
/// handle, its field snapshot and the action set accumulated by
/// write-actions instructions.
///
/// The handle is given up by value to whichever output, packet-in or
/// drop finally disposes of it, so a packet can never be sent twice.
/// Once that has happened `packet()` returns `None` and any remaining
/// actions only ever work on duplicates.
#[derive(Debug)]
pub struct PacketCtx<P> {
    pub(crate) pkt: Option<P>,
    pub matches: PacketMatches,
    pub write_actions: WriteActions,
}

impl<P> PacketCtx<P> {
    pub fn new(pkt: P, matches: PacketMatches) -> Self {
        Self { pkt: Some(pkt), matches, write_actions: WriteActions::default() }
    }

    /// The packet, unless it has already been disposed of.
    pub fn packet(&self) -> Option<&P> {
        self.pkt.as_ref()
    }

    /// Has this packet been handed to an output, the controller or
    /// been dropped?
    pub fn is_disposed(&self) -> bool {
        self.pkt.is_none()
    }

    pub(crate) fn take_packet(&mut self) -> Option<P> {
        self.pkt.take()
    }
}
