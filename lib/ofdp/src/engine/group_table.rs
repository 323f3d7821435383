// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The group table.
//!
//! Flow entries hold `Arc<Group>` handles resolved when the entry is
//! added, so executing a group never touches the table itself. A
//! deleted group is flagged detached and leaves the map; it is freed
//! once the last entry referencing it is gone.

use super::action::Action;
use super::action::ActionGroup;
use super::action::process_actions;
use super::datapath::Datapath;
use super::packet::PacketCtx;
use super::stat::GroupCounters;
use super::stat::PacketCounter;
use crate::api::BucketDesc;
use crate::api::GROUP_ALL;
use crate::api::GROUP_ANY;
use crate::api::GroupDesc;
use crate::api::GroupStats;
use crate::api::GroupType;
use crate::api::OfdpError;
use crate::api::PORT_TABLE;
use crate::api::is_valid_group_id;
use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockReadGuard;
use crate::ddi::sync::KRwLockWriteGuard;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct Bucket {
    weight: u16,
    watch_port: u32,
    watch_group: u32,
    actions: ActionGroup,
    stats: PacketCounter,
}

impl Bucket {
    pub fn new(actions: ActionGroup) -> Self {
        Self::weighted(0, actions)
    }

    pub fn weighted(weight: u16, actions: ActionGroup) -> Self {
        Self {
            weight,
            watch_port: crate::api::PORT_ANY,
            watch_group: GROUP_ANY,
            actions,
            stats: PacketCounter::default(),
        }
    }

    pub fn watch(mut self, port: u32, group: u32) -> Self {
        self.watch_port = port;
        self.watch_group = group;
        self
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn actions(&self) -> &ActionGroup {
        &self.actions
    }

    pub fn stats(&self) -> &PacketCounter {
        &self.stats
    }

    fn desc(&self) -> BucketDesc {
        BucketDesc {
            weight: self.weight,
            watch_port: self.watch_port,
            watch_group: self.watch_group,
            actions: self.actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn run<D: Datapath>(
        &self,
        dp: &D,
        ctx: &mut PacketCtx<D::Packet>,
        table_id: u8,
        replicate: bool,
    ) {
        self.stats.hit(ctx.matches.pkt_size);
        let replicate = replicate || self.actions.num_outputs() > 1;
        process_actions(dp, ctx, table_id, self.actions.iter(), replicate);
    }
}

#[derive(Debug)]
struct GroupState {
    kind: GroupType,
    buckets: Vec<Bucket>,
}

#[derive(Debug)]
pub struct Group {
    id: u32,
    state: KRwLock<GroupState>,
    stats: GroupCounters,
    detached: AtomicBool,
}

/// Check a group-mod's buckets against its type.
fn validate(id: u32, kind: GroupType, buckets: &[Bucket]) -> crate::Result<()> {
    if !is_valid_group_id(id) {
        return Err(OfdpError::InvalidArgument(format!(
            "bad group id {id:#x}"
        )));
    }

    for bucket in buckets {
        for action in bucket.actions.iter() {
            match action {
                Action::Group(_) => {
                    return Err(OfdpError::InvalidArgument(format!(
                        "group {id}: chaining groups is not supported"
                    )));
                }
                Action::Output(PORT_TABLE) => {
                    return Err(OfdpError::InvalidArgument(format!(
                        "group {id}: output to TABLE in a bucket"
                    )));
                }
                _ => {}
            }
        }
    }

    let weighted = buckets.iter().any(|b| b.weight != 0);
    let all_weighted = buckets.iter().all(|b| b.weight != 0);
    let bad = |reason: &str| {
        Err(OfdpError::InvalidGroupType { id, reason: reason.to_string() })
    };

    match kind {
        GroupType::All if weighted => bad("ALL buckets carry no weight"),
        GroupType::Indirect if buckets.len() != 1 => {
            bad("INDIRECT takes exactly one bucket")
        }
        GroupType::Indirect if weighted => {
            bad("INDIRECT buckets carry no weight")
        }
        GroupType::Select if !all_weighted => {
            bad("every SELECT bucket needs a weight")
        }
        _ => Ok(()),
    }
}

impl Group {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> GroupType {
        self.state.read().kind
    }

    pub fn num_buckets(&self) -> usize {
        self.state.read().buckets.len()
    }

    pub fn stats(&self) -> &GroupCounters {
        &self.stats
    }

    /// Has this group been deleted from its table?
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> GroupStats {
        let state = self.state.read();
        GroupStats {
            group_id: self.id,
            ref_count: self.stats.ref_count(),
            packet_count: self.stats.packets(),
            byte_count: self.stats.bytes(),
            buckets: state.buckets.iter().map(|b| (&b.stats).into()).collect(),
        }
    }

    pub fn desc(&self) -> GroupDesc {
        let state = self.state.read();
        GroupDesc {
            group_id: self.id,
            group_type: state.kind,
            buckets: state.buckets.iter().map(Bucket::desc).collect(),
        }
    }

    /// Run the packet through the group.
    ///
    /// ALL with several buckets gives each bucket its own duplicate of
    /// the packet and a private copy of its fields, so one bucket's
    /// rewrites never leak into another's. A single bucket works on
    /// the packet itself, like any action list. SELECT and fast
    /// failover groups are accepted but not executed.
    pub(crate) fn process<D: Datapath>(
        &self,
        dp: &D,
        ctx: &mut PacketCtx<D::Packet>,
        table_id: u8,
        replicate: bool,
    ) {
        if self.is_detached() {
            return;
        }

        let state = self.state.read();
        self.stats.counter.hit(ctx.matches.pkt_size);

        match state.kind {
            GroupType::All if state.buckets.len() > 1 => {
                for bucket in &state.buckets {
                    let Some(dup) = ctx.packet().and_then(|p| dp.replicate(p))
                    else {
                        continue;
                    };

                    let mut bctx = PacketCtx::new(dup, ctx.matches.clone());
                    bucket.run(dp, &mut bctx, table_id, false);
                    if let Some(left) = bctx.take_packet() {
                        dp.drop_packet(left);
                    }
                }
            }

            GroupType::All | GroupType::Indirect => {
                if let Some(bucket) = state.buckets.first() {
                    bucket.run(dp, ctx, table_id, replicate);
                }
            }

            GroupType::Select | GroupType::FastFailover => {}
        }
    }
}

/// All groups of a pipeline, by id.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: KRwLock<BTreeMap<u32, Arc<Group>>>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn get(&self, id: u32) -> Option<Arc<Group>> {
        self.groups.read().get(&id).cloned()
    }

    /// Hold the table shared: while held no group can be deleted.
    pub(crate) fn read(
        &self,
    ) -> KRwLockReadGuard<'_, BTreeMap<u32, Arc<Group>>> {
        self.groups.read()
    }

    pub(crate) fn write(
        &self,
    ) -> KRwLockWriteGuard<'_, BTreeMap<u32, Arc<Group>>> {
        self.groups.write()
    }

    pub fn add(
        &self,
        kind: GroupType,
        id: u32,
        buckets: Vec<Bucket>,
    ) -> crate::Result<Arc<Group>> {
        validate(id, kind, &buckets)?;

        let mut groups = self.groups.write();
        if groups.contains_key(&id) {
            return Err(OfdpError::GroupExists(id));
        }

        let group = Arc::new(Group {
            id,
            state: KRwLock::new(GroupState { kind, buckets }),
            stats: GroupCounters::default(),
            detached: AtomicBool::new(false),
        });
        groups.insert(id, Arc::clone(&group));
        Ok(group)
    }

    /// Replace a group's type and buckets. Bucket counters start
    /// over; the group counters and references are kept.
    pub fn modify(
        &self,
        kind: GroupType,
        id: u32,
        buckets: Vec<Bucket>,
    ) -> crate::Result<()> {
        validate(id, kind, &buckets)?;

        let groups = self.groups.read();
        let group = groups.get(&id).ok_or(OfdpError::UnknownGroup(id))?;
        *group.state.write() = GroupState { kind, buckets };
        Ok(())
    }

    /// Take the groups `id` names out of `groups` and flag them
    /// detached. Unknown ids select nothing.
    pub(crate) fn detach(
        groups: &mut BTreeMap<u32, Arc<Group>>,
        id: u32,
    ) -> Vec<Arc<Group>> {
        let taken: Vec<Arc<Group>> = if id == GROUP_ALL {
            core::mem::take(groups).into_values().collect()
        } else {
            groups.remove(&id).into_iter().collect()
        };

        for group in &taken {
            group.detached.store(true, Ordering::Release);
        }

        taken
    }

    /// Stats of one group, or of all of them for `GROUP_ALL`.
    pub fn stats(&self, id: u32) -> crate::Result<Vec<GroupStats>> {
        let groups = self.groups.read();
        if id == GROUP_ALL {
            return Ok(groups.values().map(|g| g.snapshot()).collect());
        }

        let group = groups.get(&id).ok_or(OfdpError::UnknownGroup(id))?;
        Ok(vec![group.snapshot()])
    }

    pub fn desc(&self) -> Vec<GroupDesc> {
        self.groups.read().values().map(|g| g.desc()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn out(port: u32) -> ActionGroup {
        ActionGroup::new(vec![Action::output(port)])
    }

    #[test]
    fn validation() {
        let gt = GroupTable::new();

        let err = gt.add(GroupType::Indirect, 1, vec![]).unwrap_err();
        assert!(matches!(err, OfdpError::InvalidGroupType { id: 1, .. }));

        let err = gt
            .add(GroupType::All, 1, vec![Bucket::weighted(3, out(1))])
            .unwrap_err();
        assert!(matches!(err, OfdpError::InvalidGroupType { .. }));

        let err = gt
            .add(
                GroupType::All,
                1,
                vec![Bucket::new(ActionGroup::new(vec![Action::group(2)]))],
            )
            .unwrap_err();
        assert!(matches!(err, OfdpError::InvalidArgument(_)));

        let err = gt
            .add(GroupType::All, 1, vec![Bucket::new(out(PORT_TABLE))])
            .unwrap_err();
        assert!(matches!(err, OfdpError::InvalidArgument(_)));

        let err = gt.add(GroupType::All, GROUP_ALL, vec![]).unwrap_err();
        assert!(matches!(err, OfdpError::InvalidArgument(_)));

        gt.add(GroupType::Select, 2, vec![Bucket::weighted(1, out(1))])
            .unwrap();
        assert_eq!(gt.len(), 1);
    }

    #[test]
    fn exists_and_unknown() {
        let gt = GroupTable::new();
        gt.add(GroupType::All, 7, vec![Bucket::new(out(1))]).unwrap();
        assert_eq!(
            gt.add(GroupType::All, 7, vec![]).unwrap_err(),
            OfdpError::GroupExists(7)
        );
        assert_eq!(
            gt.modify(GroupType::All, 8, vec![]).unwrap_err(),
            OfdpError::UnknownGroup(8)
        );
        gt.modify(GroupType::Indirect, 7, vec![Bucket::new(out(2))]).unwrap();
        assert_eq!(gt.get(7).unwrap().kind(), GroupType::Indirect);
        assert_eq!(gt.stats(8).unwrap_err(), OfdpError::UnknownGroup(8));
    }

    #[test]
    fn detach_all() {
        let gt = GroupTable::new();
        let a = gt.add(GroupType::All, 1, vec![]).unwrap();
        let b = gt.add(GroupType::All, 2, vec![]).unwrap();

        let taken = GroupTable::detach(&mut gt.write(), 99);
        assert!(taken.is_empty());

        let taken = GroupTable::detach(&mut gt.write(), GROUP_ALL);
        assert_eq!(taken.len(), 2);
        assert!(a.is_detached() && b.is_detached());
        assert_eq!(gt.len(), 0);
    }
}
