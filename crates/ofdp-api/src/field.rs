// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The catalogue of header fields a flow entry may match on.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// A matchable header field, numbered as the OXM basic class (plus
/// the PPPoE/PPP extension fields).
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(u8)]
pub enum MatchField {
    InPort = 0,
    InPhyPort = 1,
    Metadata = 2,
    EthDst = 3,
    EthSrc = 4,
    EthType = 5,
    VlanVid = 6,
    VlanPcp = 7,
    IpDscp = 8,
    IpEcn = 9,
    IpProto = 10,
    Ipv4Src = 11,
    Ipv4Dst = 12,
    TcpSrc = 13,
    TcpDst = 14,
    UdpSrc = 15,
    UdpDst = 16,
    SctpSrc = 17,
    SctpDst = 18,
    Icmpv4Type = 19,
    Icmpv4Code = 20,
    ArpOp = 21,
    ArpSpa = 22,
    ArpTpa = 23,
    ArpSha = 24,
    ArpTha = 25,
    Ipv6Src = 26,
    Ipv6Dst = 27,
    Ipv6Flabel = 28,
    Icmpv6Type = 29,
    Icmpv6Code = 30,
    Ipv6NdTarget = 31,
    Ipv6NdSll = 32,
    Ipv6NdTll = 33,
    MplsLabel = 34,
    MplsTc = 35,
    PppoeCode = 36,
    PppoeType = 37,
    PppoeSid = 38,
    PppProt = 39,
}

/// The 48-bit mask of an Ethernet address.
pub const ETH_ADDR_MASK: u128 = 0xffff_ffff_ffff;

/// The `OFPVID_PRESENT` bit of a VLAN-VID match value.
pub const VLAN_VID_PRESENT: u16 = 0x1000;

impl MatchField {
    pub const COUNT: usize = 40;

    pub const ALL: [MatchField; Self::COUNT] = [
        Self::InPort,
        Self::InPhyPort,
        Self::Metadata,
        Self::EthDst,
        Self::EthSrc,
        Self::EthType,
        Self::VlanVid,
        Self::VlanPcp,
        Self::IpDscp,
        Self::IpEcn,
        Self::IpProto,
        Self::Ipv4Src,
        Self::Ipv4Dst,
        Self::TcpSrc,
        Self::TcpDst,
        Self::UdpSrc,
        Self::UdpDst,
        Self::SctpSrc,
        Self::SctpDst,
        Self::Icmpv4Type,
        Self::Icmpv4Code,
        Self::ArpOp,
        Self::ArpSpa,
        Self::ArpTpa,
        Self::ArpSha,
        Self::ArpTha,
        Self::Ipv6Src,
        Self::Ipv6Dst,
        Self::Ipv6Flabel,
        Self::Icmpv6Type,
        Self::Icmpv6Code,
        Self::Ipv6NdTarget,
        Self::Ipv6NdSll,
        Self::Ipv6NdTll,
        Self::MplsLabel,
        Self::MplsTc,
        Self::PppoeCode,
        Self::PppoeType,
        Self::PppoeSid,
        Self::PppProt,
    ];

    /// The bits of a `u128` that are meaningful for this field.
    pub const fn width_mask(&self) -> u128 {
        use MatchField::*;

        match self {
            InPort | InPhyPort | Ipv4Src | Ipv4Dst | ArpSpa | ArpTpa => {
                0xffff_ffff
            }
            Metadata => 0xffff_ffff_ffff_ffff,
            EthDst | EthSrc | ArpSha | ArpTha | Ipv6NdSll | Ipv6NdTll => {
                ETH_ADDR_MASK
            }
            EthType | TcpSrc | TcpDst | UdpSrc | UdpDst | SctpSrc
            | SctpDst | ArpOp | PppoeSid | PppProt => 0xffff,
            // 12-bit VID plus the OFPVID_PRESENT bit.
            VlanVid => 0x1fff,
            VlanPcp | MplsTc => 0x07,
            IpDscp => 0x3f,
            IpEcn => 0x03,
            IpProto | Icmpv4Type | Icmpv4Code | Icmpv6Type | Icmpv6Code
            | PppoeCode | PppoeType => 0xff,
            Ipv6Src | Ipv6Dst | Ipv6NdTarget => u128::MAX,
            Ipv6Flabel | MplsLabel => 0x000f_ffff,
        }
    }

    /// Can a user supply an arbitrary mask for this field? Fields
    /// that cannot are always matched exactly.
    pub const fn is_maskable(&self) -> bool {
        use MatchField::*;

        matches!(
            self,
            Metadata
                | EthDst
                | EthSrc
                | VlanVid
                | Ipv4Src
                | Ipv4Dst
                | ArpSpa
                | ArpTpa
                | ArpSha
                | ArpTha
                | Ipv6Src
                | Ipv6Dst
                | Ipv6Flabel
        )
    }

    /// This field's bit in a capability bitmap.
    pub const fn bit(&self) -> u64 {
        1 << (*self as u8)
    }

    /// A bitmap with every field set.
    pub const fn all_bits() -> u64 {
        (1 << Self::COUNT) - 1
    }

    pub fn from_u8(val: u8) -> Option<Self> {
        Self::ALL.get(usize::from(val)).copied()
    }
}

impl Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use MatchField::*;

        let s = match self {
            InPort => "IN_PORT",
            InPhyPort => "IN_PHY_PORT",
            Metadata => "METADATA",
            EthDst => "ETH_DST",
            EthSrc => "ETH_SRC",
            EthType => "ETH_TYPE",
            VlanVid => "VLAN_VID",
            VlanPcp => "VLAN_PCP",
            IpDscp => "IP_DSCP",
            IpEcn => "IP_ECN",
            IpProto => "IP_PROTO",
            Ipv4Src => "IPV4_SRC",
            Ipv4Dst => "IPV4_DST",
            TcpSrc => "TCP_SRC",
            TcpDst => "TCP_DST",
            UdpSrc => "UDP_SRC",
            UdpDst => "UDP_DST",
            SctpSrc => "SCTP_SRC",
            SctpDst => "SCTP_DST",
            Icmpv4Type => "ICMPV4_TYPE",
            Icmpv4Code => "ICMPV4_CODE",
            ArpOp => "ARP_OP",
            ArpSpa => "ARP_SPA",
            ArpTpa => "ARP_TPA",
            ArpSha => "ARP_SHA",
            ArpTha => "ARP_THA",
            Ipv6Src => "IPV6_SRC",
            Ipv6Dst => "IPV6_DST",
            Ipv6Flabel => "IPV6_FLABEL",
            Icmpv6Type => "ICMPV6_TYPE",
            Icmpv6Code => "ICMPV6_CODE",
            Ipv6NdTarget => "IPV6_ND_TARGET",
            Ipv6NdSll => "IPV6_ND_SLL",
            Ipv6NdTll => "IPV6_ND_TLL",
            MplsLabel => "MPLS_LABEL",
            MplsTc => "MPLS_TC",
            PppoeCode => "PPPOE_CODE",
            PppoeType => "PPPOE_TYPE",
            PppoeSid => "PPPOE_SID",
            PppProt => "PPP_PROT",
        };

        write!(f, "{s}")
    }
}
