// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The OpenFlow pipeline: the flow tables, the group table and the
//! port counters of one logical switch.
//!
//! Lock order is the group table first, then a flow table's writer,
//! then its entry list, then an entry's instructions. Packets only
//! take the last two, and never the group table: group handles are
//! resolved when a flow entry is installed.

use super::action::Action;
use super::action::ActionGroup;
use super::action::process_actions;
use super::datapath::Datapath;
use super::flow_entry::FlowEntry;
use super::flow_table::FlowTable;
use super::group_table::Bucket;
use super::group_table::Group;
use super::group_table::GroupTable;
use super::instruction::process_instructions;
use super::instruction::process_write_actions;
use super::packet::PacketCtx;
use super::packet::PacketMatches;
use super::stat::FlowStatsQuery;
use super::stat::FlowStatsRecord;
use super::stat::PortCounters;
use super::stat::QueueCounters;
use super::stat::aggregate;
use crate::api::AggregateStats;
use crate::api::Capabilities;
use crate::api::FlowRemoveReason;
use crate::api::GroupDesc;
use crate::api::GroupStats;
use crate::api::GroupType;
use crate::api::MatchField;
use crate::api::OfdpError;
use crate::api::PORT_ANY;
use crate::api::PacketInReason;
use crate::api::PortStats;
use crate::api::QUEUE_ALL;
use crate::api::QueueStats;
use crate::api::Strictness;
use crate::api::TABLE_ALL;
use crate::api::TableMissConfig;
use crate::api::TableStats;
use crate::config::PipelineConfig;
use crate::config::TableConfig;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use crate::provider::Providers;
use core::sync::atomic::AtomicU16;
use core::sync::atomic::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where a packet goes after a table hit.
enum Step {
    Goto(u8),
    Done,
}

pub struct Pipeline {
    tables: Vec<FlowTable>,
    groups: GroupTable,
    ports: KRwLock<BTreeMap<u32, Arc<PortCounters>>>,
    queues: KRwLock<BTreeMap<(u32, u32), Arc<QueueCounters>>>,
    capabilities: Capabilities,
    miss_send_len: AtomicU16,
    providers: Arc<Providers>,
    epoch: Moment,
}

fn check_actions<'a, I>(
    table_id: u8,
    what: &str,
    actions: I,
    kinds: u64,
    setfields: u64,
) -> crate::Result<()>
where
    I: IntoIterator<Item = &'a Action>,
{
    for action in actions {
        if action.kind().bit() & kinds == 0 {
            return Err(OfdpError::InvalidArgument(format!(
                "table {table_id} does not support {action} in {what}"
            )));
        }

        if let Action::SetField(sf) = action {
            if sf.field().bit() & setfields == 0 {
                return Err(OfdpError::InvalidArgument(format!(
                    "table {table_id} cannot rewrite {} in {what}",
                    sf.field()
                )));
            }
        }
    }

    Ok(())
}

impl Pipeline {
    pub fn new(
        cfg: &PipelineConfig,
        providers: Providers,
    ) -> crate::Result<Self> {
        Self::new_at(cfg, providers, Moment::now())
    }

    /// Build a pipeline whose timers count from `epoch`.
    pub fn new_at(
        cfg: &PipelineConfig,
        providers: Providers,
        epoch: Moment,
    ) -> crate::Result<Self> {
        cfg.validate()?;
        let providers = Arc::new(providers);

        let tables = (0..cfg.num_tables)
            .map(|id| {
                FlowTable::new(
                    id,
                    cfg.table_config(id),
                    cfg.max_entries,
                    cfg.tick_ms,
                    Arc::clone(&providers),
                    epoch,
                )
            })
            .collect();

        Ok(Self {
            tables,
            groups: GroupTable::new(),
            ports: KRwLock::new(BTreeMap::new()),
            queues: KRwLock::new(BTreeMap::new()),
            capabilities: Capabilities::DEFAULT,
            miss_send_len: AtomicU16::new(cfg.miss_send_len),
            providers,
            epoch,
        })
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn tables(&self) -> &[FlowTable] {
        &self.tables
    }

    pub fn table(&self, id: u8) -> crate::Result<&FlowTable> {
        self.tables.get(usize::from(id)).ok_or(OfdpError::BadTableId(id))
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn epoch(&self) -> Moment {
        self.epoch
    }

    /// Bytes of a packet sent to the controller on a table miss. The
    /// platform truncates; the engine only carries the setting.
    pub fn miss_send_len(&self) -> u16 {
        self.miss_send_len.load(Ordering::Relaxed)
    }

    pub fn set_miss_send_len(&self, len: u16) {
        self.miss_send_len.store(len, Ordering::Relaxed);
    }

    pub fn set_table_miss(
        &self,
        table_id: u8,
        miss: TableMissConfig,
    ) -> crate::Result<()> {
        if table_id == TABLE_ALL {
            return self
                .tables
                .iter()
                .try_for_each(|t| t.set_miss_config(miss));
        }

        self.table(table_id)?.set_miss_config(miss)
    }

    pub fn process_packet<D: Datapath>(
        &self,
        dp: &D,
        pkt: D::Packet,
        matches: PacketMatches,
    ) {
        self.process_packet_at(dp, pkt, matches, Moment::now())
    }

    /// Run a packet through the tables, starting at table 0.
    ///
    /// The packet is disposed of exactly once: by an output, by a
    /// packet-in, or dropped when nothing else claimed it.
    pub fn process_packet_at<D: Datapath>(
        &self,
        dp: &D,
        pkt: D::Packet,
        matches: PacketMatches,
        now: Moment,
    ) {
        if let Some(port) = self.ports.read().get(&matches.port_in) {
            port.rx.hit(matches.pkt_size);
        }

        let mut ctx = PacketCtx::new(pkt, matches);
        let mut cur = 0;

        while let Some(table) = self.tables.get(cur) {
            let table_id = table.id();
            let step = table.process_best_match(&mut ctx, |ctx, entry, inst| {
                entry.stats().hit(ctx.matches.pkt_size);
                table.touch(entry, now);

                match process_instructions(dp, ctx, table_id, inst) {
                    Some(next)
                        if usize::from(next) > cur
                            && usize::from(next) < self.tables.len() =>
                    {
                        Step::Goto(next)
                    }
                    _ => {
                        process_write_actions(dp, ctx, table_id, false);
                        Step::Done
                    }
                }
            });

            match step {
                Some(Step::Goto(next)) => cur = usize::from(next),
                Some(Step::Done) => break,
                None => {
                    let miss = table.miss_config();
                    table_miss_probe(table_id, miss);
                    match miss {
                        TableMissConfig::Continue => cur += 1,
                        TableMissConfig::Controller => {
                            if let Some(pkt) = ctx.take_packet() {
                                dp.packet_in(
                                    pkt,
                                    table_id,
                                    PacketInReason::NoMatch,
                                    &ctx.matches,
                                );
                            }
                            break;
                        }
                        TableMissConfig::Drop => break,
                    }
                }
            }
        }

        if let Some(pkt) = ctx.take_packet() {
            dp.drop_packet(pkt);
        }
    }

    /// Run a controller supplied action list on a packet.
    ///
    /// Group references are resolved first; an unknown group fails
    /// the request and the packet is dropped.
    pub fn process_packet_out<D: Datapath>(
        &self,
        dp: &D,
        pkt: D::Packet,
        matches: PacketMatches,
        mut actions: ActionGroup,
    ) -> crate::Result<()> {
        let resolved = {
            let groups = self.groups.read();
            actions.iter_mut().try_for_each(|action| match action {
                Action::Group(ga) => {
                    let group = groups
                        .get(&ga.id())
                        .ok_or(OfdpError::UnknownGroup(ga.id()))?;
                    ga.resolve(Arc::clone(group));
                    Ok(())
                }
                _ => Ok(()),
            })
        };

        if let Err(e) = resolved {
            dp.drop_packet(pkt);
            return Err(e);
        }

        let mut ctx = PacketCtx::new(pkt, matches);
        let replicate = actions.num_outputs() > 1;
        process_actions(dp, &mut ctx, 0, actions.iter(), replicate);

        if let Some(pkt) = ctx.take_packet() {
            dp.drop_packet(pkt);
        }

        Ok(())
    }

    /// Check an entry against what its table supports and resolve its
    /// group references. The caller holds the group table.
    fn prepare_entry(
        &self,
        table: &FlowTable,
        entry: &mut FlowEntry,
        groups: &BTreeMap<u32, Arc<Group>>,
    ) -> crate::Result<()> {
        let id = table.id();
        let cfg: &TableConfig = table.config();

        for m in entry.matches() {
            let field = m.field();
            if field.bit() & cfg.match_fields == 0 {
                return Err(OfdpError::InvalidArgument(format!(
                    "table {id} cannot match on {field}"
                )));
            }

            let partial = !m.is_wildcard() && m.mask() != field.width_mask();
            if partial && field.bit() & cfg.wildcards == 0 {
                return Err(OfdpError::InvalidArgument(format!(
                    "table {id} cannot mask {field}"
                )));
            }

            if field == MatchField::Metadata
                && (m.mask() as u64) & !cfg.metadata_match != 0
            {
                return Err(OfdpError::InvalidArgument(format!(
                    "table {id} cannot match metadata bits {:#x}",
                    m.mask()
                )));
            }
        }

        let inst = entry.instructions_mut();
        if !cfg.instructions.contains(inst.kinds()) {
            return Err(OfdpError::InvalidArgument(format!(
                "table {id} does not support instructions {:?}",
                inst.kinds().difference(cfg.instructions)
            )));
        }

        if let Some(next) = inst.next_table() {
            if next <= id || usize::from(next) >= self.tables.len() {
                return Err(OfdpError::BadTableId(next));
            }
        }

        if let Some(md) = inst.metadata() {
            if md.mask & !cfg.metadata_write != 0 {
                return Err(OfdpError::InvalidArgument(format!(
                    "table {id} cannot write metadata bits {:#x}",
                    md.mask
                )));
            }
        }

        if let Some(apply) = inst.apply() {
            check_actions(
                id,
                "apply-actions",
                apply.iter(),
                cfg.apply_actions,
                cfg.apply_setfields,
            )?;
        }

        if let Some(write) = inst.write() {
            check_actions(
                id,
                "write-actions",
                write.iter(),
                cfg.write_actions,
                cfg.write_setfields,
            )?;
        }

        for ga in inst.group_actions_mut() {
            let group =
                groups.get(&ga.id()).ok_or(OfdpError::UnknownGroup(ga.id()))?;
            ga.resolve(Arc::clone(group));
        }

        Ok(())
    }

    pub fn add_flow_entry(
        &self,
        table_id: u8,
        entry: FlowEntry,
        check_overlap: bool,
        reset_counts: bool,
    ) -> crate::Result<Arc<FlowEntry>> {
        self.add_flow_entry_at(
            table_id,
            entry,
            check_overlap,
            reset_counts,
            Moment::now(),
        )
    }

    pub fn add_flow_entry_at(
        &self,
        table_id: u8,
        mut entry: FlowEntry,
        check_overlap: bool,
        reset_counts: bool,
        now: Moment,
    ) -> crate::Result<Arc<FlowEntry>> {
        let table = self.table(table_id)?;

        // Held until the entry is linked so that its groups cannot be
        // deleted underneath it.
        let groups = self.groups.read();
        self.prepare_entry(table, &mut entry, &groups)?;
        entry.stats().reset(now);
        table.add_at(entry, check_overlap, reset_counts, now)
    }

    /// Replace the instructions of the entries `template` selects in
    /// one table. Returns the number of entries modified.
    pub fn modify_flow_entry(
        &self,
        table_id: u8,
        mut template: FlowEntry,
        strict: Strictness,
        reset_counts: bool,
    ) -> crate::Result<usize> {
        let table = self.table(table_id)?;
        let groups = self.groups.read();
        self.prepare_entry(table, &mut template, &groups)?;
        table.modify(template, strict, reset_counts)
    }

    /// Delete the entries `template` selects, in one table or in all
    /// of them for `TABLE_ALL`. Returns the number of entries removed.
    pub fn remove_flow_entry(
        &self,
        table_id: u8,
        template: &FlowEntry,
        strict: Strictness,
        out_port: u32,
        out_group: u32,
    ) -> crate::Result<usize> {
        let reason = FlowRemoveReason::Delete;
        if table_id == TABLE_ALL {
            let mut removed = 0;
            for table in &self.tables {
                removed += table.remove(
                    template, strict, out_port, out_group, reason,
                )?;
            }
            return Ok(removed);
        }

        self.table(table_id)?
            .remove(template, strict, out_port, out_group, reason)
    }

    pub fn add_group(
        &self,
        kind: GroupType,
        id: u32,
        buckets: Vec<Bucket>,
    ) -> crate::Result<()> {
        self.groups.add(kind, id, buckets).map(|_| ())
    }

    pub fn modify_group(
        &self,
        kind: GroupType,
        id: u32,
        buckets: Vec<Bucket>,
    ) -> crate::Result<()> {
        self.groups.modify(kind, id, buckets)
    }

    /// Delete a group, or every group for `GROUP_ALL`, together with
    /// every flow entry referencing it. Deleting an unknown group is
    /// not an error.
    pub fn delete_group(&self, id: u32) -> crate::Result<()> {
        let mut groups = self.groups.write();
        let victims = GroupTable::detach(&mut groups, id);

        for group in victims {
            let mut removed = 0u64;
            for table in &self.tables {
                while let Some(entry) =
                    table.find_entry_referencing_group(group.id())
                {
                    match table
                        .remove_specific(&entry, FlowRemoveReason::GroupDelete)
                    {
                        Ok(()) => removed += 1,
                        // Raced with another removal; scan again.
                        Err(OfdpError::NotFound) => {}
                        Err(e) => {
                            // The scan would return it again.
                            self.providers.log.log(
                                LogLevel::Warn,
                                &format!(
                                    "{}: failed to remove {entry:?} for \
                                     group {}: {e}",
                                    table.name(),
                                    group.id()
                                ),
                            );
                            break;
                        }
                    }
                }
            }

            group_delete_probe(group.id(), removed);
            self.providers.log.log(
                LogLevel::Note,
                &format!(
                    "deleted group {} and {removed} referencing flows",
                    group.id()
                ),
            );
        }

        Ok(())
    }

    pub fn sweep_timers(&self) -> usize {
        self.sweep_timers_at(Moment::now())
    }

    /// Expire due flow entries in every table.
    pub fn sweep_timers_at(&self, now: Moment) -> usize {
        self.tables.iter().map(|t| t.sweep_at(now)).sum()
    }

    fn selected_tables(&self, table_id: u8) -> crate::Result<&[FlowTable]> {
        if table_id == TABLE_ALL {
            return Ok(&self.tables);
        }

        let idx = usize::from(table_id);
        self.table(table_id)?;
        Ok(&self.tables[idx..=idx])
    }

    pub fn flow_stats(
        &self,
        table_id: u8,
        query: &FlowStatsQuery,
    ) -> crate::Result<Vec<FlowStatsRecord>> {
        self.flow_stats_at(table_id, query, Moment::now())
    }

    /// Snapshots of the entries `query` selects, table by table in
    /// match order.
    pub fn flow_stats_at(
        &self,
        table_id: u8,
        query: &FlowStatsQuery,
        now: Moment,
    ) -> crate::Result<Vec<FlowStatsRecord>> {
        let tmpl = FlowEntry::from_query(query)?;
        let mut out = vec![];
        for table in self.selected_tables(table_id)? {
            out.extend(table.flow_stats_at(
                &tmpl,
                query.out_port,
                query.out_group,
                now,
            ));
        }
        Ok(out)
    }

    pub fn aggregate_stats(
        &self,
        table_id: u8,
        query: &FlowStatsQuery,
    ) -> crate::Result<AggregateStats> {
        Ok(aggregate(&self.flow_stats(table_id, query)?))
    }

    pub fn table_stats(&self) -> Vec<TableStats> {
        self.tables.iter().map(|t| t.stats()).collect()
    }

    pub fn group_stats(&self, id: u32) -> crate::Result<Vec<GroupStats>> {
        self.groups.stats(id)
    }

    pub fn group_desc(&self) -> Vec<GroupDesc> {
        self.groups.desc()
    }

    /// Start counting traffic on `port`. Returns the counters, which
    /// the platform bumps on transmit.
    pub fn register_port(&self, port: u32) -> Arc<PortCounters> {
        Arc::clone(self.ports.write().entry(port).or_default())
    }

    pub fn unregister_port(&self, port: u32) {
        self.ports.write().remove(&port);
        self.queues.write().retain(|(p, _), _| *p != port);
    }

    /// Stats of one port, or every port for `PORT_ANY`.
    pub fn port_stats(&self, port: u32) -> Vec<PortStats> {
        self.ports
            .read()
            .iter()
            .filter(|(p, _)| port == PORT_ANY || **p == port)
            .map(|(p, c)| c.snapshot(*p))
            .collect()
    }

    pub fn register_queue(&self, port: u32, queue: u32) -> Arc<QueueCounters> {
        Arc::clone(self.queues.write().entry((port, queue)).or_default())
    }

    pub fn queue_stats(&self, port: u32, queue: u32) -> Vec<QueueStats> {
        self.queues
            .read()
            .iter()
            .filter(|((p, q), _)| {
                (port == PORT_ANY || *p == port)
                    && (queue == QUEUE_ALL || *q == queue)
            })
            .map(|((p, q), c)| c.snapshot(*p, *q))
            .collect()
    }
}

fn table_miss_probe(table: u8, miss: TableMissConfig) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let miss_s = miss.to_string();
            crate::ofdp_provider::table__miss!(|| (table, miss_s.as_str()));
        } else {
            let (_, _) = (table, miss);
        }
    }
}

fn group_delete_probe(group: u32, flows_removed: u64) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            crate::ofdp_provider::group__delete!(|| (group, flows_removed));
        } else {
            let (_, _) = (group, flows_removed);
        }
    }
}
