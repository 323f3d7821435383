// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Ternary field matches.
//!
//! A [`Match`] constrains one header field to a `(value, mask)` pair:
//! a packet satisfies it when `(field & mask) == (value & mask)`.
//! Masked-out bits are "don't care". Values are stored already
//! reduced to the field's width and to the mask, so two matches that
//! accept the same packets compare equal.

use super::packet::PacketMatches;
use crate::api::MatchField;
use core::fmt;
use core::fmt::Display;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Match {
    field: MatchField,
    value: u128,
    mask: u128,
}

impl Match {
    /// Match `field` exactly against `value`.
    pub fn exact(field: MatchField, value: u128) -> Self {
        let mask = field.width_mask();
        Self { field, value: value & mask, mask }
    }

    /// Match `field` against `value` under `mask`.
    ///
    /// Fields which do not support arbitrary masks are matched
    /// exactly regardless of `mask`.
    pub fn masked(field: MatchField, value: u128, mask: u128) -> Self {
        if !field.is_maskable() {
            return Self::exact(field, value);
        }

        let mask = mask & field.width_mask();
        Self { field, value: value & mask, mask }
    }

    pub fn in_port(port: u32) -> Self {
        Self::exact(MatchField::InPort, port.into())
    }

    pub fn in_phy_port(port: u32) -> Self {
        Self::exact(MatchField::InPhyPort, port.into())
    }

    pub fn metadata(value: u64, mask: u64) -> Self {
        Self::masked(MatchField::Metadata, value.into(), mask.into())
    }

    pub fn eth_dst(mac: u64, mask: u64) -> Self {
        Self::masked(MatchField::EthDst, mac.into(), mask.into())
    }

    pub fn eth_src(mac: u64, mask: u64) -> Self {
        Self::masked(MatchField::EthSrc, mac.into(), mask.into())
    }

    pub fn eth_type(ether_type: u16) -> Self {
        Self::exact(MatchField::EthType, ether_type.into())
    }

    pub fn vlan_vid(vid: u16, mask: u16) -> Self {
        Self::masked(MatchField::VlanVid, vid.into(), mask.into())
    }

    pub fn vlan_pcp(pcp: u8) -> Self {
        Self::exact(MatchField::VlanPcp, pcp.into())
    }

    pub fn ip_proto(proto: u8) -> Self {
        Self::exact(MatchField::IpProto, proto.into())
    }

    pub fn ipv4_src(addr: u32, mask: u32) -> Self {
        Self::masked(MatchField::Ipv4Src, addr.into(), mask.into())
    }

    pub fn ipv4_dst(addr: u32, mask: u32) -> Self {
        Self::masked(MatchField::Ipv4Dst, addr.into(), mask.into())
    }

    pub fn ipv6_src(addr: u128, mask: u128) -> Self {
        Self::masked(MatchField::Ipv6Src, addr, mask)
    }

    pub fn ipv6_dst(addr: u128, mask: u128) -> Self {
        Self::masked(MatchField::Ipv6Dst, addr, mask)
    }

    pub fn tcp_src(port: u16) -> Self {
        Self::exact(MatchField::TcpSrc, port.into())
    }

    pub fn tcp_dst(port: u16) -> Self {
        Self::exact(MatchField::TcpDst, port.into())
    }

    pub fn udp_src(port: u16) -> Self {
        Self::exact(MatchField::UdpSrc, port.into())
    }

    pub fn udp_dst(port: u16) -> Self {
        Self::exact(MatchField::UdpDst, port.into())
    }

    pub fn field(&self) -> MatchField {
        self.field
    }

    pub fn value(&self) -> u128 {
        self.value
    }

    pub fn mask(&self) -> u128 {
        self.mask
    }

    /// Does this match accept every value of its field?
    pub fn is_wildcard(&self) -> bool {
        self.mask == 0
    }

    /// Does the packet satisfy this match? A packet that lacks the
    /// headers this field lives in never does.
    pub fn check(&self, pkt: &PacketMatches) -> bool {
        match pkt.field_value(self.field) {
            Some(val) => self.check_value(val),
            None => false,
        }
    }

    /// Does a raw field value satisfy this match?
    pub fn check_value(&self, val: u128) -> bool {
        (val & self.mask) == self.value
    }

    /// Do both matches constrain the same field in the same way?
    pub fn equals(&self, other: &Self) -> bool {
        self.field == other.field
            && self.mask == other.mask
            && self.value == other.value
    }

    /// Is every value accepted by `self` also accepted by `sup`?
    ///
    /// This holds when `sup` cares about no bit that `self` ignores,
    /// and both agree on the bits `sup` cares about.
    pub fn is_submatch_of(&self, sup: &Self) -> bool {
        if self.field != sup.field {
            return false;
        }

        if (sup.mask & !self.mask) != 0 {
            return false;
        }

        (self.value & sup.mask) == sup.value
    }

    /// Is there at least one value accepted by both matches?
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.field != other.field {
            return false;
        }

        ((self.value ^ other.value) & self.mask & other.mask) == 0
    }

    /// The most specific prefix match that accepts everything both
    /// `self` and `other` accept, if it is no more general than
    /// either of them requires and not a complete wildcard.
    ///
    /// Index-building matching algorithms use this to group entries;
    /// the linear algorithm has no need for it.
    pub fn alike(&self, other: &Self) -> Option<Self> {
        if self.field != other.field {
            return None;
        }

        let width = self.field.width_mask();
        let same = !(self.value ^ other.value) & width;
        let mut mask = width;

        while mask != 0 && (same & mask) != mask {
            mask = (mask << 1) & width;
        }

        if mask == 0 || self.mask < mask || other.mask < mask {
            return None;
        }

        Some(Self { field: self.field, value: self.value & mask, mask })
    }
}

impl Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.mask == self.field.width_mask() {
            write!(f, "{}={:#x}", self.field, self.value)
        } else {
            write!(f, "{}={:#x}/{:#x}", self.field, self.value, self.mask)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::packet::ETHER_TYPE_IPV4;
    use crate::engine::packet::IP_PROTO_UDP;

    #[test]
    fn construction_truncates_to_width() {
        let m = Match::exact(MatchField::VlanPcp, 0xff);
        assert_eq!(m.value(), 0x07);

        let m = Match::eth_dst(0xffff_0011_2233_4455, u64::MAX);
        assert_eq!(m.value(), 0x0011_2233_4455);
        assert_eq!(m.mask(), 0xffff_ffff_ffff);

        // Not maskable: the mask is ignored.
        let m = Match::masked(MatchField::TcpDst, 80, 0xff00);
        assert_eq!(m.mask(), 0xffff);
        assert_eq!(m.value(), 80);
    }

    #[test]
    fn masked_value_normalized() {
        let a = Match::ipv4_dst(0x0a00_0001, 0xff00_0000);
        let b = Match::ipv4_dst(0x0aff_ffff, 0xff00_0000);
        assert!(a.equals(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn check_against_packet() {
        let pkt = PacketMatches {
            eth_type: ETHER_TYPE_IPV4,
            ip_proto: IP_PROTO_UDP,
            ipv4_dst: 0x0a01_0203,
            udp_dst: 53,
            ..Default::default()
        };

        assert!(Match::ipv4_dst(0x0a00_0000, 0xff00_0000).check(&pkt));
        assert!(!Match::ipv4_dst(0x0b00_0000, 0xff00_0000).check(&pkt));
        assert!(Match::udp_dst(53).check(&pkt));
        assert!(!Match::tcp_dst(53).check(&pkt));
    }

    #[test]
    fn submatch() {
        let net8 = Match::ipv4_src(0x0a00_0000, 0xff00_0000);
        let net16 = Match::ipv4_src(0x0a01_0000, 0xffff_0000);
        let other = Match::ipv4_src(0x0b01_0000, 0xffff_0000);

        assert!(net16.is_submatch_of(&net8));
        assert!(!net8.is_submatch_of(&net16));
        assert!(!other.is_submatch_of(&net8));
        assert!(net8.is_submatch_of(&net8));
        assert!(!net8.is_submatch_of(&Match::ipv4_dst(0x0a00_0000, 0)));
    }

    #[test]
    fn overlap() {
        let net8 = Match::ipv4_src(0x0a00_0000, 0xff00_0000);
        let net16 = Match::ipv4_src(0x0a01_0000, 0xffff_0000);
        let other = Match::ipv4_src(0x0b01_0000, 0xffff_0000);

        assert!(net8.overlaps(&net16));
        assert!(net16.overlaps(&net8));
        assert!(!net8.overlaps(&other));
        assert!(!Match::tcp_dst(80).overlaps(&Match::tcp_dst(443)));
    }

    #[test]
    fn alike() {
        let a = Match::ipv4_src(0x0a01_0001, u32::MAX);
        let b = Match::ipv4_src(0x0a01_0002, u32::MAX);
        let common = a.alike(&b).unwrap();
        assert_eq!(common.mask(), 0xffff_fffc);
        assert_eq!(common.value(), 0x0a01_0000);

        // Needs to be more general than b allows.
        let c = Match::ipv4_src(0x0a01_0000, 0xffff_ff00);
        let d = Match::ipv4_src(0x0a02_0000, 0xffff_ff00);
        assert!(c.alike(&d).is_some());
        let e = Match::ipv4_src(0x0a00_0000, 0xff00_0000);
        assert!(a.alike(&e).is_none());

        // Nothing in common.
        let f = Match::ipv4_src(0x8a01_0001, u32::MAX);
        assert!(a.alike(&f).is_none());
    }
}
