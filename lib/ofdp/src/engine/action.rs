// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet actions, the lists and sets they are grouped in, and their
//! execution against a packet.
//!
//! An [`ActionGroup`] is the ordered list carried by an apply-actions
//! instruction or a group bucket: it runs immediately and the same
//! kind of action may appear more than once. [`WriteActions`] is the
//! action set: one slot per [`ActionKind`], later writes overwrite
//! earlier ones, and the set runs once in canonical kind order when
//! the packet leaves the pipeline.

use super::datapath::Datapath;
use super::group_table::Group;
use super::packet::PacketCtx;
use super::packet::PacketMatches;
use crate::api::MatchField;
use crate::api::PORT_ALL;
use crate::api::PORT_CONTROLLER;
use crate::api::PORT_FLOOD;
use crate::api::PORT_IN_PORT;
use crate::api::PORT_LOCAL;
use crate::api::PORT_MAX;
use crate::api::PORT_NORMAL;
use crate::api::PacketInReason;
use crate::api::port_name;
use core::fmt;
use core::fmt::Display;
use std::sync::Arc;

/// A header field rewrite. Values are masked to the field width on
/// construction through [`Action::set_field`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetField {
    EthDst(u64),
    EthSrc(u64),
    EthType(u16),
    VlanVid(u16),
    VlanPcp(u8),
    IpDscp(u8),
    IpEcn(u8),
    IpProto(u8),
    Ipv4Src(u32),
    Ipv4Dst(u32),
    TcpSrc(u16),
    TcpDst(u16),
    UdpSrc(u16),
    UdpDst(u16),
    Icmpv4Type(u8),
    Icmpv4Code(u8),
    MplsLabel(u32),
    MplsTc(u8),
    PppoeCode(u8),
    PppoeType(u8),
    PppoeSid(u16),
    PppProto(u16),
}

impl SetField {
    /// The field this action rewrites.
    pub fn field(&self) -> MatchField {
        match self {
            Self::EthDst(_) => MatchField::EthDst,
            Self::EthSrc(_) => MatchField::EthSrc,
            Self::EthType(_) => MatchField::EthType,
            Self::VlanVid(_) => MatchField::VlanVid,
            Self::VlanPcp(_) => MatchField::VlanPcp,
            Self::IpDscp(_) => MatchField::IpDscp,
            Self::IpEcn(_) => MatchField::IpEcn,
            Self::IpProto(_) => MatchField::IpProto,
            Self::Ipv4Src(_) => MatchField::Ipv4Src,
            Self::Ipv4Dst(_) => MatchField::Ipv4Dst,
            Self::TcpSrc(_) => MatchField::TcpSrc,
            Self::TcpDst(_) => MatchField::TcpDst,
            Self::UdpSrc(_) => MatchField::UdpSrc,
            Self::UdpDst(_) => MatchField::UdpDst,
            Self::Icmpv4Type(_) => MatchField::Icmpv4Type,
            Self::Icmpv4Code(_) => MatchField::Icmpv4Code,
            Self::MplsLabel(_) => MatchField::MplsLabel,
            Self::MplsTc(_) => MatchField::MplsTc,
            Self::PppoeCode(_) => MatchField::PppoeCode,
            Self::PppoeType(_) => MatchField::PppoeType,
            Self::PppoeSid(_) => MatchField::PppoeSid,
            Self::PppProto(_) => MatchField::PppProt,
        }
    }

    fn value(&self) -> u128 {
        match *self {
            Self::EthDst(v) | Self::EthSrc(v) => v.into(),
            Self::EthType(v)
            | Self::VlanVid(v)
            | Self::TcpSrc(v)
            | Self::TcpDst(v)
            | Self::UdpSrc(v)
            | Self::UdpDst(v)
            | Self::PppoeSid(v)
            | Self::PppProto(v) => v.into(),
            Self::VlanPcp(v)
            | Self::IpDscp(v)
            | Self::IpEcn(v)
            | Self::IpProto(v)
            | Self::Icmpv4Type(v)
            | Self::Icmpv4Code(v)
            | Self::MplsTc(v)
            | Self::PppoeCode(v)
            | Self::PppoeType(v) => v.into(),
            Self::Ipv4Src(v) | Self::Ipv4Dst(v) | Self::MplsLabel(v) => {
                v.into()
            }
        }
    }

    fn masked(self) -> Self {
        const ETH: u64 = 0xffff_ffff_ffff;

        match self {
            Self::EthDst(v) => Self::EthDst(v & ETH),
            Self::EthSrc(v) => Self::EthSrc(v & ETH),
            Self::VlanVid(v) => Self::VlanVid(v & 0x1fff),
            Self::VlanPcp(v) => Self::VlanPcp(v & 0x07),
            Self::IpDscp(v) => Self::IpDscp(v & 0x3f),
            Self::IpEcn(v) => Self::IpEcn(v & 0x03),
            Self::MplsLabel(v) => Self::MplsLabel(v & 0x000f_ffff),
            Self::MplsTc(v) => Self::MplsTc(v & 0x07),
            other => other,
        }
    }

    fn kind(&self) -> ActionKind {
        use ActionKind as K;

        match self {
            Self::EthDst(_) => K::SetEthDst,
            Self::EthSrc(_) => K::SetEthSrc,
            Self::EthType(_) => K::SetEthType,
            Self::VlanVid(_) => K::SetVlanVid,
            Self::VlanPcp(_) => K::SetVlanPcp,
            Self::IpDscp(_) => K::SetIpDscp,
            Self::IpEcn(_) => K::SetIpEcn,
            Self::IpProto(_) => K::SetIpProto,
            Self::Ipv4Src(_) => K::SetIpv4Src,
            Self::Ipv4Dst(_) => K::SetIpv4Dst,
            Self::TcpSrc(_) => K::SetTcpSrc,
            Self::TcpDst(_) => K::SetTcpDst,
            Self::UdpSrc(_) => K::SetUdpSrc,
            Self::UdpDst(_) => K::SetUdpDst,
            Self::Icmpv4Type(_) => K::SetIcmpv4Type,
            Self::Icmpv4Code(_) => K::SetIcmpv4Code,
            Self::MplsLabel(_) => K::SetMplsLabel,
            Self::MplsTc(_) => K::SetMplsTc,
            Self::PppoeCode(_) => K::SetPppoeCode,
            Self::PppoeType(_) => K::SetPppoeType,
            Self::PppoeSid(_) => K::SetPppoeSid,
            Self::PppProto(_) => K::SetPppProto,
        }
    }
}

impl Display for SetField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:={:#x}", self.field(), self.value())
    }
}

/// The kind of an action. The declaration order is the canonical
/// order in which an action set executes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum ActionKind {
    CopyTtlIn,
    PopVlan,
    PopMpls,
    PopPppoe,
    PushPppoe,
    PushMpls,
    PushVlan,
    CopyTtlOut,
    DecNwTtl,
    DecMplsTtl,
    SetMplsTtl,
    SetNwTtl,
    SetQueue,
    SetEthDst,
    SetEthSrc,
    SetEthType,
    SetVlanVid,
    SetVlanPcp,
    SetIpDscp,
    SetIpEcn,
    SetIpProto,
    SetIpv4Src,
    SetIpv4Dst,
    SetTcpSrc,
    SetTcpDst,
    SetUdpSrc,
    SetUdpDst,
    SetIcmpv4Type,
    SetIcmpv4Code,
    SetMplsLabel,
    SetMplsTc,
    SetPppoeCode,
    SetPppoeType,
    SetPppoeSid,
    SetPppProto,
    Group,
    Experimenter,
    Output,
}

impl ActionKind {
    pub const COUNT: usize = ActionKind::Output as usize + 1;

    /// This kind's bit in a capability bitmap.
    pub const fn bit(&self) -> u64 {
        1 << (*self as u8)
    }

    pub const fn all_bits() -> u64 {
        (1 << Self::COUNT) - 1
    }
}

/// A reference from an action to a group.
///
/// The handle is resolved when the owning flow entry is installed;
/// until then only the id is known.
#[derive(Clone, Debug)]
pub struct GroupAction {
    id: u32,
    group: Option<Arc<Group>>,
}

impl GroupAction {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn group(&self) -> Option<&Arc<Group>> {
        self.group.as_ref()
    }

    pub(crate) fn resolve(&mut self, group: Arc<Group>) {
        self.group = Some(group);
    }
}

#[derive(Clone, Debug)]
pub enum Action {
    CopyTtlIn,
    PopVlan,
    /// Pop the outer MPLS label; the value is the new ethertype.
    PopMpls(u16),
    PopPppoe(u16),
    PushPppoe(u16),
    PushMpls(u16),
    PushVlan(u16),
    CopyTtlOut,
    DecNwTtl,
    DecMplsTtl,
    SetMplsTtl(u8),
    SetNwTtl(u8),
    SetQueue(u32),
    SetField(SetField),
    Group(GroupAction),
    Experimenter(u32),
    Output(u32),
}

impl Action {
    pub fn set_field(sf: SetField) -> Self {
        Self::SetField(sf.masked())
    }

    pub fn group(id: u32) -> Self {
        Self::Group(GroupAction { id, group: None })
    }

    pub fn output(port: u32) -> Self {
        Self::Output(port)
    }

    pub fn kind(&self) -> ActionKind {
        use ActionKind as K;

        match self {
            Self::CopyTtlIn => K::CopyTtlIn,
            Self::PopVlan => K::PopVlan,
            Self::PopMpls(_) => K::PopMpls,
            Self::PopPppoe(_) => K::PopPppoe,
            Self::PushPppoe(_) => K::PushPppoe,
            Self::PushMpls(_) => K::PushMpls,
            Self::PushVlan(_) => K::PushVlan,
            Self::CopyTtlOut => K::CopyTtlOut,
            Self::DecNwTtl => K::DecNwTtl,
            Self::DecMplsTtl => K::DecMplsTtl,
            Self::SetMplsTtl(_) => K::SetMplsTtl,
            Self::SetNwTtl(_) => K::SetNwTtl,
            Self::SetQueue(_) => K::SetQueue,
            Self::SetField(sf) => sf.kind(),
            Self::Group(_) => K::Group,
            Self::Experimenter(_) => K::Experimenter,
            Self::Output(_) => K::Output,
        }
    }

    /// Does this action send the packet somewhere? Group actions
    /// count, as they fan out to outputs.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_) | Self::Group(_))
    }

    pub fn outputs_to(&self, port: u32) -> bool {
        matches!(self, Self::Output(p) if *p == port)
    }

    pub fn uses_group(&self, id: u32) -> bool {
        matches!(self, Self::Group(ga) if ga.id == id)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CopyTtlIn => write!(f, "COPY_TTL_IN"),
            Self::PopVlan => write!(f, "POP_VLAN"),
            Self::PopMpls(et) => write!(f, "POP_MPLS({et:#06x})"),
            Self::PopPppoe(et) => write!(f, "POP_PPPOE({et:#06x})"),
            Self::PushPppoe(et) => write!(f, "PUSH_PPPOE({et:#06x})"),
            Self::PushMpls(et) => write!(f, "PUSH_MPLS({et:#06x})"),
            Self::PushVlan(et) => write!(f, "PUSH_VLAN({et:#06x})"),
            Self::CopyTtlOut => write!(f, "COPY_TTL_OUT"),
            Self::DecNwTtl => write!(f, "DEC_NW_TTL"),
            Self::DecMplsTtl => write!(f, "DEC_MPLS_TTL"),
            Self::SetMplsTtl(ttl) => write!(f, "SET_MPLS_TTL({ttl})"),
            Self::SetNwTtl(ttl) => write!(f, "SET_NW_TTL({ttl})"),
            Self::SetQueue(q) => write!(f, "SET_QUEUE({q})"),
            Self::SetField(sf) => write!(f, "SET_FIELD({sf})"),
            Self::Group(ga) => write!(f, "GROUP({})", ga.id),
            Self::Experimenter(id) => write!(f, "EXPERIMENTER({id:#x})"),
            Self::Output(port) => write!(f, "OUTPUT({})", port_name(*port)),
        }
    }
}

/// An ordered list of actions, executed immediately.
#[derive(Clone, Debug, Default)]
pub struct ActionGroup {
    actions: Vec<Action>,
    num_outputs: u32,
}

impl ActionGroup {
    pub fn new(actions: Vec<Action>) -> Self {
        let num_outputs = actions.iter().filter(|a| a.is_output()).count();
        Self { actions, num_outputs: num_outputs as u32 }
    }

    pub fn push(&mut self, action: Action) {
        if action.is_output() {
            self.num_outputs += 1;
        }
        self.actions.push(action);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Action> {
        self.actions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn num_outputs(&self) -> u32 {
        self.num_outputs
    }

    pub fn has_output(&self, port: u32) -> bool {
        self.actions.iter().any(|a| a.outputs_to(port))
    }

    pub fn has_group(&self, id: u32) -> bool {
        self.actions.iter().any(|a| a.uses_group(id))
    }
}

impl FromIterator<Action> for ActionGroup {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// The action set: at most one action of each kind.
#[derive(Clone, Debug)]
pub struct WriteActions {
    slots: [Option<Action>; ActionKind::COUNT],
}

impl Default for WriteActions {
    fn default() -> Self {
        Self { slots: [const { None }; ActionKind::COUNT] }
    }
}

impl WriteActions {
    pub fn new(actions: Vec<Action>) -> Self {
        let mut wa = Self::default();
        for a in actions {
            wa.set(a);
        }
        wa
    }

    /// Store `action` in its kind's slot, replacing what was there.
    pub fn set(&mut self, action: Action) {
        let idx = action.kind() as usize;
        self.slots[idx] = Some(action);
    }

    /// Copy every present slot of `other` over this set.
    pub fn merge(&mut self, other: &WriteActions) {
        for (dst, src) in self.slots.iter_mut().zip(other.slots.iter()) {
            if let Some(a) = src {
                *dst = Some(a.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// The present actions, in canonical execution order.
    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.slots.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Action> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    pub fn num_outputs(&self) -> u32 {
        self.iter().filter(|a| a.is_output()).count() as u32
    }

    pub fn has_output(&self, port: u32) -> bool {
        self.slots[ActionKind::Output as usize]
            .as_ref()
            .is_some_and(|a| a.outputs_to(port))
    }

    pub fn has_group(&self, id: u32) -> bool {
        self.slots[ActionKind::Group as usize]
            .as_ref()
            .is_some_and(|a| a.uses_group(id))
    }
}

/// Run a list of actions against the packet.
///
/// When `replicate` is set every output works on a duplicate and the
/// original stays with the caller; otherwise the first output
/// consumes the packet.
pub(crate) fn process_actions<'a, D, I>(
    dp: &D,
    ctx: &mut PacketCtx<D::Packet>,
    table_id: u8,
    actions: I,
    replicate: bool,
) where
    D: Datapath,
    I: IntoIterator<Item = &'a Action>,
{
    for action in actions {
        process_action(dp, ctx, table_id, action, replicate);
    }
}

fn process_action<D: Datapath>(
    dp: &D,
    ctx: &mut PacketCtx<D::Packet>,
    table_id: u8,
    action: &Action,
    replicate: bool,
) {
    match action {
        Action::Output(port) => {
            if !is_deliverable(*port) {
                return;
            }

            let Some(pkt) = take_or_replicate(dp, ctx, replicate) else {
                return;
            };
            output(dp, pkt, &ctx.matches, table_id, *port);
        }

        Action::Group(ga) => {
            if let Some(group) = ga.group() {
                group.process(dp, ctx, table_id, replicate);
            }
        }

        Action::Experimenter(_) => {}

        action => {
            let Some(pkt) = ctx.pkt.as_mut() else {
                return;
            };

            dp.modify(pkt, action);
            update_matches(&mut ctx.matches, action);
            if matches!(
                action.kind(),
                ActionKind::PopVlan
                    | ActionKind::PopMpls
                    | ActionKind::PopPppoe
                    | ActionKind::PushPppoe
                    | ActionKind::PushMpls
                    | ActionKind::PushVlan
            ) {
                dp.refresh_matches(pkt, &mut ctx.matches);
            }
        }
    }
}

/// TABLE, ANY and anything past MAX have no meaning inside an action
/// list: outputs to them are ignored.
fn is_deliverable(port: u32) -> bool {
    port < PORT_MAX
        || matches!(
            port,
            PORT_IN_PORT
                | PORT_FLOOD
                | PORT_ALL
                | PORT_LOCAL
                | PORT_CONTROLLER
                | PORT_NORMAL
        )
}

fn take_or_replicate<D: Datapath>(
    dp: &D,
    ctx: &mut PacketCtx<D::Packet>,
    replicate: bool,
) -> Option<D::Packet> {
    if replicate {
        ctx.pkt.as_ref().and_then(|pkt| dp.replicate(pkt))
    } else {
        ctx.pkt.take()
    }
}

/// Keep the snapshot in step with header rewrites.
fn update_matches(matches: &mut PacketMatches, action: &Action) {
    match action {
        Action::SetField(sf) => matches.apply_set_field(sf),
        Action::PopVlan => {
            matches.has_vlan = false;
            matches.vlan_vid = 0;
            matches.vlan_pcp = 0;
        }
        Action::PushVlan(_) => matches.has_vlan = true,
        Action::PopMpls(et) | Action::PopPppoe(et) => matches.eth_type = *et,
        Action::PushMpls(et) | Action::PushPppoe(et) => {
            matches.eth_type = *et
        }
        _ => {}
    }
}

/// Send a packet to `port`, resolving the reserved ports.
pub(crate) fn output<D: Datapath>(
    dp: &D,
    pkt: D::Packet,
    matches: &PacketMatches,
    table_id: u8,
    port: u32,
) {
    match port {
        PORT_CONTROLLER | PORT_NORMAL => {
            dp.packet_in(pkt, table_id, PacketInReason::Action, matches);
        }

        PORT_IN_PORT => dp.output(pkt, matches.port_in),

        PORT_FLOOD | PORT_ALL | PORT_LOCAL => dp.output(pkt, port),

        p if p < PORT_MAX => dp.output(pkt, p),

        _ => dp.drop_packet(pkt),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_field_masks_width() {
        let a = Action::set_field(SetField::VlanPcp(0xff));
        assert!(matches!(a, Action::SetField(SetField::VlanPcp(0x07))));

        let a = Action::set_field(SetField::MplsLabel(0xfff_ffff));
        assert!(matches!(a, Action::SetField(SetField::MplsLabel(0xf_ffff))));

        let a = Action::set_field(SetField::EthDst(u64::MAX));
        assert!(matches!(
            a,
            Action::SetField(SetField::EthDst(0xffff_ffff_ffff))
        ));
    }

    #[test]
    fn write_actions_canonical_order() {
        let wa = WriteActions::new(vec![
            Action::output(3),
            Action::set_field(SetField::TcpDst(80)),
            Action::DecNwTtl,
            Action::PopVlan,
        ]);

        let kinds: Vec<_> = wa.iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::PopVlan,
                ActionKind::DecNwTtl,
                ActionKind::SetTcpDst,
                ActionKind::Output,
            ]
        );
        assert_eq!(wa.num_outputs(), 1);
        assert!(wa.has_output(3));
        assert!(!wa.has_output(4));
    }

    #[test]
    fn write_actions_overwrite_and_merge() {
        let mut pkt_set = WriteActions::new(vec![Action::output(1)]);
        let entry_set = WriteActions::new(vec![
            Action::output(2),
            Action::output(5),
            Action::group(7),
        ]);
        assert_eq!(entry_set.len(), 2);
        assert!(entry_set.has_output(5));

        pkt_set.merge(&entry_set);
        assert!(pkt_set.has_output(5));
        assert!(pkt_set.has_group(7));
        assert_eq!(pkt_set.num_outputs(), 2);

        pkt_set.clear();
        assert!(pkt_set.is_empty());
    }

    #[test]
    fn action_group_counts_outputs() {
        let mut ag: ActionGroup = [
            Action::set_field(SetField::Ipv4Dst(1)),
            Action::output(1),
            Action::output(1),
        ]
        .into_iter()
        .collect();
        assert_eq!(ag.num_outputs(), 2);

        ag.push(Action::group(4));
        assert_eq!(ag.num_outputs(), 3);
        assert!(ag.has_group(4));
        assert!(ag.has_output(1));
        assert!(!ag.has_output(2));
        assert_eq!(ag.len(), 4);
    }
}
