// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow tables.
//!
//! A table keeps its entries in an [`EntryList`]: an arena of slots
//! chained in match order, most matches first and higher priority
//! first among equals. Two locks protect a table:
//!
//! * the writer mutex, held by every add, modify, remove and timer
//!   sweep for its whole duration, and owning the table's timers;
//! * the entry list lock, taken shared by packet lookups and stats
//!   scans, and exclusively only for the instant a writer links or
//!   unlinks a slot.
//!
//! A packet which found its entry keeps that entry's instruction
//! lock (shared) while executing, after letting go of the list. A
//! removal therefore unlinks first and then waits on the entry lock,
//! so that no packet is still running the instructions of an entry
//! once it is gone.

use super::flow_entry::FlowEntry;
use super::instruction::InstructionGroup;
use super::matching::MatchingAlgorithm;
use super::packet::PacketCtx;
use super::packet::PacketMatches;
use super::stat::FlowStatsRecord;
use super::stat::TableCounters;
use super::timer::TimerKind;
use super::timer::TimerWheel;
use crate::api::AggregateStats;
use crate::api::FlowRemoveReason;
use crate::api::OfdpError;
use crate::api::Strictness;
use crate::api::TableMissConfig;
use crate::api::TableStats;
use crate::config::TableConfig;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockReadGuard;
use crate::ddi::sync::KRwLockWriteGuard;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use crate::provider::Providers;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug)]
struct Node {
    entry: Arc<FlowEntry>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// The ordered entries of one table.
///
/// Slots are stable for as long as an entry stays linked, which is
/// what an entry's back-reference records.
#[derive(Debug, Default)]
pub struct EntryList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl EntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, slot: usize) -> Option<&Arc<FlowEntry>> {
        self.nodes.get(slot)?.as_ref().map(|n| &n.entry)
    }

    /// Entries in match order, with their slots.
    pub fn iter(&self) -> Iter<'_> {
        Iter { list: self, cur: self.head }
    }

    /// Entries in match order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<FlowEntry>> {
        self.iter().map(|(_, e)| e)
    }

    /// Link `entry` in front of the entry at slot `before`, or at the
    /// tail. Returns the entry's slot.
    pub fn insert_before(
        &mut self,
        before: Option<usize>,
        entry: Arc<FlowEntry>,
    ) -> usize {
        let prev = match before {
            Some(b) => self.node(b).and_then(|n| n.prev),
            None => self.tail,
        };

        let node = Node { entry, prev, next: before };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match prev {
            Some(p) => self.set_next(p, Some(slot)),
            None => self.head = Some(slot),
        }

        match before {
            Some(b) => self.set_prev(b, Some(slot)),
            None => self.tail = Some(slot),
        }

        self.len += 1;
        slot
    }

    /// Unlink the entry at `slot`, freeing the slot.
    pub fn unlink(&mut self, slot: usize) -> Option<Arc<FlowEntry>> {
        let node = self.nodes.get_mut(slot)?.take()?;

        match node.prev {
            Some(p) => self.set_next(p, node.next),
            None => self.head = node.next,
        }

        match node.next {
            Some(n) => self.set_prev(n, node.prev),
            None => self.tail = node.prev,
        }

        self.free.push(slot);
        self.len -= 1;
        Some(node.entry)
    }

    /// Do the neighbours of `slot` point back at it?
    pub fn is_linked(&self, slot: usize) -> bool {
        let Some(node) = self.node(slot) else {
            return false;
        };

        let prev_ok = match node.prev {
            Some(p) => self.node(p).is_some_and(|n| n.next == Some(slot)),
            None => self.head == Some(slot),
        };

        let next_ok = match node.next {
            Some(n) => self.node(n).is_some_and(|n| n.prev == Some(slot)),
            None => self.tail == Some(slot),
        };

        prev_ok && next_ok
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot)?.as_ref()
    }

    fn set_next(&mut self, slot: usize, next: Option<usize>) {
        if let Some(Some(n)) = self.nodes.get_mut(slot) {
            n.next = next;
        }
    }

    fn set_prev(&mut self, slot: usize, prev: Option<usize>) {
        if let Some(Some(n)) = self.nodes.get_mut(slot) {
            n.prev = prev;
        }
    }
}

pub struct Iter<'a> {
    list: &'a EntryList,
    cur: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, &'a Arc<FlowEntry>);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cur?;
        let node = self.list.node(slot)?;
        self.cur = node.next;
        Some((slot, &node.entry))
    }
}

/// State owned by whoever holds a table's writer lock.
#[derive(Debug)]
pub struct TableWriter {
    timers: TimerWheel,
}

impl TableWriter {
    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }
}

pub struct FlowTable {
    id: u8,
    name: String,
    max_entries: u32,
    config: TableConfig,
    miss: AtomicU8,
    writer: KMutex<TableWriter>,
    entries: KRwLock<EntryList>,
    stats: TableCounters,
    alg: Box<dyn MatchingAlgorithm>,
    providers: Arc<Providers>,
    epoch: Moment,
}

impl core::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlowTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .field("algorithm", &self.alg.name())
            .finish()
    }
}

fn miss_from_u8(val: u8) -> TableMissConfig {
    match val {
        x if x == TableMissConfig::Continue as u8 => TableMissConfig::Continue,
        x if x == TableMissConfig::Drop as u8 => TableMissConfig::Drop,
        _ => TableMissConfig::Controller,
    }
}

impl FlowTable {
    pub fn new(
        id: u8,
        config: TableConfig,
        max_entries: u32,
        tick_ms: u64,
        providers: Arc<Providers>,
        epoch: Moment,
    ) -> Self {
        let name = config.name.clone().unwrap_or_else(|| format!("table{id}"));
        let max_entries = config.max_entries.unwrap_or(max_entries);

        Self {
            id,
            name,
            max_entries,
            miss: AtomicU8::new(config.miss as u8),
            alg: config.algorithm.build(),
            config,
            writer: KMutex::new(TableWriter {
                timers: TimerWheel::new(epoch, tick_ms),
            }),
            entries: KRwLock::new(EntryList::new()),
            stats: TableCounters::default(),
            providers,
            epoch,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &'static str {
        self.alg.name()
    }

    /// The moment timer deadlines are counted from.
    pub fn epoch(&self) -> Moment {
        self.epoch
    }

    pub fn miss_config(&self) -> TableMissConfig {
        miss_from_u8(self.miss.load(Ordering::Relaxed))
    }

    pub fn set_miss_config(&self, miss: TableMissConfig) -> crate::Result<()> {
        if !self.config.miss_caps.allows(miss) {
            return Err(OfdpError::InvalidArgument(format!(
                "table {} does not support miss behaviour {miss}",
                self.id
            )));
        }

        self.miss.store(miss as u8, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_timers(&self) -> usize {
        self.writer.lock().timers.len()
    }

    /// Shared access to the entries, for matching algorithms and
    /// stats scans.
    pub fn entries(&self) -> KRwLockReadGuard<'_, EntryList> {
        self.entries.read()
    }

    /// Exclusive access to the entries. Only a writer may relink.
    pub fn entries_mut(
        &self,
        _w: &mut TableWriter,
    ) -> KRwLockWriteGuard<'_, EntryList> {
        self.entries.write()
    }

    pub fn add(
        &self,
        entry: FlowEntry,
        check_overlap: bool,
        reset_counts: bool,
    ) -> crate::Result<Arc<FlowEntry>> {
        self.add_at(entry, check_overlap, reset_counts, Moment::now())
    }

    /// Insert `entry`, arming its timers from `now`.
    pub fn add_at(
        &self,
        entry: FlowEntry,
        check_overlap: bool,
        reset_counts: bool,
        now: Moment,
    ) -> crate::Result<Arc<FlowEntry>> {
        let mut w = self.writer.lock();
        let entry = self.alg.add(
            self,
            &mut w,
            entry,
            check_overlap,
            reset_counts,
            now,
        )?;

        entry.instructions().hold_groups();
        w.timers.add(&entry, now);
        self.providers.events.flow_added(self.id, &entry);
        flow_add_probe(self.id, &entry);
        Ok(entry)
    }

    pub fn modify(
        &self,
        template: FlowEntry,
        strict: Strictness,
        reset_counts: bool,
    ) -> crate::Result<usize> {
        self.modify_at(template, strict, reset_counts, Moment::now())
    }

    /// Replace the instructions of the entries `template` selects.
    /// Selecting nothing is not an error.
    pub fn modify_at(
        &self,
        template: FlowEntry,
        strict: Strictness,
        reset_counts: bool,
        now: Moment,
    ) -> crate::Result<usize> {
        let mut w = self.writer.lock();
        let modified =
            self.alg.modify(self, &mut w, template, strict, reset_counts, now)?;

        for entry in &modified {
            self.providers.events.flow_modified(self.id, entry);
        }

        Ok(modified.len())
    }

    /// Remove the entries `template` selects, returning how many.
    pub fn remove(
        &self,
        template: &FlowEntry,
        strict: Strictness,
        out_port: u32,
        out_group: u32,
        reason: FlowRemoveReason,
    ) -> crate::Result<usize> {
        let mut w = self.writer.lock();
        self.alg.remove(
            self, &mut w, template, strict, out_port, out_group, reason,
        )
    }

    /// Remove exactly `entry`, which must be linked in this table.
    pub fn remove_specific(
        &self,
        entry: &Arc<FlowEntry>,
        reason: FlowRemoveReason,
    ) -> crate::Result<()> {
        let mut w = self.writer.lock();
        self.detach(&mut w, entry, reason)
    }

    /// Unlink `entry` and tear it down. This is the one way entries
    /// leave a table, whatever the algorithm.
    ///
    /// Fails with `NotFound` if the entry is in no table, and with
    /// `InvalidArgument` if its back-reference does not describe a
    /// consistent position in this table.
    pub fn detach(
        &self,
        w: &mut TableWriter,
        entry: &Arc<FlowEntry>,
        reason: FlowRemoveReason,
    ) -> crate::Result<()> {
        {
            let mut list = self.entries_mut(w);
            let Some((table_id, slot)) = entry.location() else {
                return Err(OfdpError::NotFound);
            };

            if table_id != self.id {
                return Err(OfdpError::InvalidArgument(format!(
                    "entry belongs to table {table_id}, not {}",
                    self.id
                )));
            }

            let linked = list.get(slot).is_some_and(|e| Arc::ptr_eq(e, entry));
            if !linked || !list.is_linked(slot) {
                return Err(OfdpError::InvalidArgument(format!(
                    "entry back-reference {slot} is stale"
                )));
            }

            list.unlink(slot);
            entry.set_detached();
        }

        w.timers.remove(entry);

        // Wait out packets still executing this entry.
        drop(entry.instructions_write());

        if entry.notify_removal() && reason != FlowRemoveReason::NoReason {
            self.providers.events.flow_removed(self.id, entry, reason);
        }

        entry.instructions().release_groups();
        flow_remove_probe(self.id, entry, reason);
        Ok(())
    }

    /// Count a lookup and return the best matching entry, if any.
    pub fn find_best_match(
        &self,
        pkt: &PacketMatches,
    ) -> Option<Arc<FlowEntry>> {
        self.stats.lookup();
        let found = self.alg.find_best_match(&self.entries.read(), pkt)?;
        self.stats.matched();
        Some(found)
    }

    /// Look up the packet and, on a hit, run `f` with the entry's
    /// instructions held shared.
    ///
    /// The list lock is let go before `f` runs, so `f` may take its
    /// time: writers only ever wait for it when removing or modifying
    /// this very entry.
    pub fn process_best_match<P, R, F>(
        &self,
        ctx: &mut PacketCtx<P>,
        f: F,
    ) -> Option<R>
    where
        F: FnOnce(&mut PacketCtx<P>, &Arc<FlowEntry>, &InstructionGroup) -> R,
    {
        self.stats.lookup();
        let list = self.entries.read();
        let entry = self.alg.find_best_match(&list, &ctx.matches)?;
        let inst = entry.instructions();
        drop(list);

        self.stats.matched();
        Some(f(ctx, &entry, &inst))
    }

    pub fn find_entry_referencing_group(
        &self,
        group_id: u32,
    ) -> Option<Arc<FlowEntry>> {
        self.alg.find_entry_referencing_group(&self.entries.read(), group_id)
    }

    /// Record a hit on `entry` for idle expiration.
    pub fn touch(&self, entry: &FlowEntry, now: Moment) {
        if entry.idle_timeout() > 0 {
            entry.touch(now.delta_as_millis(self.epoch));
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Moment::now())
    }

    /// Expire every entry whose timer is due at `now`, returning how
    /// many were removed.
    pub fn sweep_at(&self, now: Moment) -> usize {
        let mut w = self.writer.lock();
        let expired = w.timers.expire(now);
        let now_ms = w.timers.now_ms(now);
        let mut removed = 0;

        for exp in expired {
            flow_expired_probe(self.id, exp.kind, exp.deadline, now_ms);
            match self.detach(&mut w, &exp.entry, exp.kind.reason()) {
                Ok(()) => removed += 1,
                Err(e) => self.providers.log.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: failed to expire {:?}: {e}",
                        self.name, exp.entry
                    ),
                ),
            }
        }

        removed
    }

    pub fn flow_stats_at(
        &self,
        query: &FlowEntry,
        out_port: u32,
        out_group: u32,
        now: Moment,
    ) -> Vec<FlowStatsRecord> {
        self.alg.flow_stats(
            &self.entries.read(),
            self.id,
            query,
            out_port,
            out_group,
            now,
        )
    }

    pub fn aggregate_stats(
        &self,
        query: &FlowEntry,
        out_port: u32,
        out_group: u32,
    ) -> AggregateStats {
        let list = self.entries.read();
        self.alg.aggregate_stats(&list, query, out_port, out_group)
    }

    pub fn stats(&self) -> TableStats {
        let active = u32::try_from(self.len()).unwrap_or(u32::MAX);
        self.stats.snapshot(self.id, active)
    }

    /// Every entry, in match order.
    pub fn dump_at(&self, now: Moment) -> Vec<FlowStatsRecord> {
        self.entries.read().entries().map(|e| e.record(self.id, now)).collect()
    }

    /// The `(num_matches, priority)` keys of the entries, in list
    /// order.
    #[cfg(any(feature = "test-help", test))]
    pub fn sort_keys(&self) -> Vec<(usize, u16)> {
        self.entries.read().entries().map(|e| e.sort_key()).collect()
    }
}

fn flow_add_probe(table: u8, entry: &FlowEntry) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let num_matches = entry.num_matches() as u32;
            crate::ofdp_provider::flow__add!(|| (
                table,
                entry.priority(),
                num_matches,
                entry.cookie()
            ));
        } else {
            let (_, _) = (table, entry);
        }
    }
}

fn flow_remove_probe(table: u8, entry: &FlowEntry, reason: FlowRemoveReason) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let reason_s = reason.to_string();
            crate::ofdp_provider::flow__remove!(|| (
                table,
                entry.priority(),
                reason_s.as_str()
            ));
        } else {
            let (_, _, _) = (table, entry, reason);
        }
    }
}

fn flow_expired_probe(table: u8, kind: TimerKind, deadline: u64, now: u64) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let kind_s = kind.to_string();
            crate::ofdp_provider::flow__expired!(|| (
                table,
                kind_s.as_str(),
                deadline,
                now
            ));
        } else {
            let (_, _, _, _) = (table, kind, deadline, now);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(prio: u16) -> Arc<FlowEntry> {
        Arc::new(FlowEntry::new(prio))
    }

    fn prios(list: &EntryList) -> Vec<u16> {
        list.entries().map(|e| e.priority()).collect()
    }

    #[test]
    fn insert_and_unlink() {
        let mut list = EntryList::new();
        let a = list.insert_before(None, entry(1));
        let b = list.insert_before(Some(a), entry(2));
        let c = list.insert_before(None, entry(3));
        assert_eq!(prios(&list), vec![2, 1, 3]);
        assert_eq!(list.len(), 3);
        assert!([a, b, c].iter().all(|s| list.is_linked(*s)));

        assert_eq!(list.unlink(a).map(|e| e.priority()), Some(1));
        assert_eq!(prios(&list), vec![2, 3]);
        assert!(!list.is_linked(a));
        assert!(list.unlink(a).is_none());

        // Freed slots are reused.
        let d = list.insert_before(Some(b), entry(4));
        assert_eq!(d, a);
        assert_eq!(prios(&list), vec![4, 2, 3]);

        list.unlink(d);
        list.unlink(b);
        list.unlink(c);
        assert!(list.is_empty());
        assert_eq!(prios(&list), Vec::<u16>::new());
    }
}
