// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow entries and the predicates used to select them.
//!
//! An entry is built detached, handed to a table by value, and from
//! then on shared as an `Arc<FlowEntry>`. Its match-set, priority,
//! cookie and timeouts never change after insertion; only the
//! instructions (behind their own lock) and the counters do.

use super::flow_match::Match;
use super::instruction::InstructionGroup;
use super::packet::PacketMatches;
use super::stat::FlowStats;
use super::stat::FlowStatsQuery;
use super::stat::FlowStatsRecord;
use crate::api::GROUP_ANY;
use crate::api::OfdpError;
use crate::api::PORT_ANY;
use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockReadGuard;
use crate::ddi::sync::KRwLockWriteGuard;
use crate::ddi::time::Moment;
use core::fmt;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

/// Location of an entry that is in no table.
const DETACHED: u64 = u64::MAX;

pub struct FlowEntry {
    priority: u16,
    matches: Vec<Match>,
    cookie: u64,
    cookie_mask: u64,
    idle_timeout: u16,
    hard_timeout: u16,
    notify_removal: bool,
    instructions: KRwLock<InstructionGroup>,
    stats: FlowStats,

    /// `(table << 32) | slot` while linked into a table.
    location: AtomicU64,

    /// Milliseconds since the owning table's epoch at which a packet
    /// last hit this entry.
    last_touched: AtomicU64,
}

impl fmt::Debug for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowEntry")
            .field("priority", &self.priority)
            .field("matches", &self.matches)
            .field("cookie", &self.cookie)
            .field("idle_timeout", &self.idle_timeout)
            .field("hard_timeout", &self.hard_timeout)
            .field("location", &self.location())
            .finish()
    }
}

impl FlowEntry {
    pub fn new(priority: u16) -> Self {
        Self::new_at(priority, Moment::now())
    }

    pub fn new_at(priority: u16, now: Moment) -> Self {
        Self {
            priority,
            matches: vec![],
            cookie: 0,
            cookie_mask: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            notify_removal: false,
            instructions: KRwLock::new(InstructionGroup::new()),
            stats: FlowStats::new(now),
            location: AtomicU64::new(DETACHED),
            last_touched: AtomicU64::new(0),
        }
    }

    /// A template entry selecting what a flow stats request asks for.
    pub fn from_query(query: &FlowStatsQuery) -> crate::Result<Self> {
        let mut entry = Self::new(0);
        entry.set_cookie(query.cookie, query.cookie_mask);
        for m in &query.matches {
            entry.add_match(*m)?;
        }
        Ok(entry)
    }

    /// Add a match to the entry. Each field may be constrained at
    /// most once.
    pub fn add_match(&mut self, m: Match) -> crate::Result<()> {
        if self.matches.iter().any(|e| e.field() == m.field()) {
            return Err(OfdpError::InvalidArgument(format!(
                "duplicate match on {}",
                m.field()
            )));
        }

        self.matches.push(m);
        Ok(())
    }

    pub fn with_match(mut self, m: Match) -> crate::Result<Self> {
        self.add_match(m)?;
        Ok(self)
    }

    pub fn set_cookie(&mut self, cookie: u64, mask: u64) {
        self.cookie = cookie;
        self.cookie_mask = mask;
    }

    pub fn set_timeouts(&mut self, idle: u16, hard: u16) {
        self.idle_timeout = idle;
        self.hard_timeout = hard;
    }

    pub fn set_notify_removal(&mut self, notify: bool) {
        self.notify_removal = notify;
    }

    pub fn set_instructions(&mut self, inst: InstructionGroup) {
        *self.instructions.get_mut() = inst;
    }

    pub fn with_instructions(mut self, inst: InstructionGroup) -> Self {
        self.set_instructions(inst);
        self
    }

    pub(crate) fn instructions_mut(&mut self) -> &mut InstructionGroup {
        self.instructions.get_mut()
    }

    pub(crate) fn into_instructions(self) -> InstructionGroup {
        self.instructions.into_inner()
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn num_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn idle_timeout(&self) -> u16 {
        self.idle_timeout
    }

    pub fn hard_timeout(&self) -> u16 {
        self.hard_timeout
    }

    pub fn notify_removal(&self) -> bool {
        self.notify_removal
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Shared access to the instructions. Packets hold this while
    /// executing; a modify waits for them to finish.
    pub fn instructions(&self) -> KRwLockReadGuard<'_, InstructionGroup> {
        self.instructions.read()
    }

    pub(crate) fn instructions_write(
        &self,
    ) -> KRwLockWriteGuard<'_, InstructionGroup> {
        self.instructions.write()
    }

    /// The key tables are sorted by: more matches first, then higher
    /// priority.
    pub fn sort_key(&self) -> (usize, u16) {
        (self.matches.len(), self.priority)
    }

    /// The table and slot this entry is linked at, if any.
    pub fn location(&self) -> Option<(u8, usize)> {
        match self.location.load(Ordering::Acquire) {
            DETACHED => None,
            loc => Some(((loc >> 32) as u8, (loc & 0xffff_ffff) as usize)),
        }
    }

    pub fn is_detached(&self) -> bool {
        self.location().is_none()
    }

    pub(crate) fn set_location(&self, table_id: u8, slot: usize) {
        let loc = (u64::from(table_id) << 32) | (slot as u64 & 0xffff_ffff);
        self.location.store(loc, Ordering::Release);
    }

    pub(crate) fn set_detached(&self) {
        self.location.store(DETACHED, Ordering::Release);
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_touched.store(now_ms, Ordering::Relaxed);
    }

    pub(crate) fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }

    /// Does the packet satisfy every match of this entry?
    pub fn matches_packet(&self, pkt: &PacketMatches) -> bool {
        self.matches.iter().all(|m| m.check(pkt))
    }

    fn find_match(&self, m: &Match) -> Option<&Match> {
        self.matches.iter().find(|e| e.field() == m.field())
    }

    /// Does this entry output to `out_port` and use `out_group`?
    /// `ANY` turns the respective filter off.
    pub fn passes_filters(&self, out_port: u32, out_group: u32) -> bool {
        if out_port == PORT_ANY && out_group == GROUP_ANY {
            return true;
        }

        let inst = self.instructions.read();
        (out_port == PORT_ANY || inst.has_output(out_port))
            && (out_group == GROUP_ANY || inst.has_group(out_group))
    }

    /// Could a single packet satisfy both `self` and `other`?
    ///
    /// Fields constrained by only one of the two never prevent an
    /// overlap. The cookie, when checked, is compared under `other`'s
    /// mask, and the output filters apply to `other`.
    pub fn check_overlap(
        &self,
        other: &FlowEntry,
        check_priority: bool,
        check_cookie: bool,
        out_port: u32,
        out_group: u32,
    ) -> bool {
        if check_priority && self.priority != other.priority {
            return false;
        }

        if check_cookie
            && (self.cookie & other.cookie_mask)
                != (other.cookie & other.cookie_mask)
        {
            return false;
        }

        for m in &self.matches {
            if let Some(om) = other.find_match(m) {
                if !m.overlaps(om) {
                    return false;
                }
            }
        }

        other.passes_filters(out_port, out_group)
    }

    /// Is every packet `subset` accepts also accepted by `self`?
    ///
    /// This is how non-strict modify, delete and stats requests
    /// select entries: `self` is the request, `subset` a candidate.
    /// The cookie is compared under `self`'s mask and the output
    /// filters apply to `subset`.
    pub fn check_contained(
        &self,
        subset: &FlowEntry,
        check_priority: bool,
        check_cookie: bool,
        out_port: u32,
        out_group: u32,
    ) -> bool {
        if check_priority && self.priority != subset.priority {
            return false;
        }

        if check_cookie
            && (subset.cookie & self.cookie_mask)
                != (self.cookie & self.cookie_mask)
        {
            return false;
        }

        for m in &self.matches {
            match subset.find_match(m) {
                Some(sm) if sm.is_submatch_of(m) => {}
                Some(_) => return false,
                None if m.is_wildcard() => {}
                None => return false,
            }
        }

        subset.passes_filters(out_port, out_group)
    }

    /// Does `self` have exactly the priority and match-set of
    /// `other`, and a cookie equal under `other`'s mask?
    ///
    /// The output filters apply to `self`.
    pub fn check_equal(
        &self,
        other: &FlowEntry,
        out_port: u32,
        out_group: u32,
    ) -> bool {
        if self.priority != other.priority {
            return false;
        }

        if (self.cookie & other.cookie_mask)
            != (other.cookie & other.cookie_mask)
        {
            return false;
        }

        if self.matches.len() != other.matches.len() {
            return false;
        }

        let same = self.matches.iter().all(|m| {
            other.find_match(m).is_some_and(|om| m.equals(om))
        });

        same && self.passes_filters(out_port, out_group)
    }

    /// Does any instruction of this entry use group `id`?
    pub fn references_group(&self, id: u32) -> bool {
        self.instructions.read().has_group(id)
    }

    /// Replace the instructions, optionally resetting the counters.
    ///
    /// Waits for packets executing the old instructions to finish.
    /// Group references move from the old instructions to the new.
    pub(crate) fn update(
        &self,
        inst: InstructionGroup,
        reset_counts: bool,
        now: Moment,
    ) {
        inst.hold_groups();
        let old = {
            let mut cur = self.instructions.write();
            core::mem::replace(&mut *cur, inst)
        };
        old.release_groups();

        if reset_counts {
            self.stats.reset(now);
        }
    }

    /// A statistics snapshot of this entry.
    pub fn record(&self, table_id: u8, now: Moment) -> FlowStatsRecord {
        FlowStatsRecord {
            table_id,
            priority: self.priority,
            cookie: self.cookie,
            duration: now.delta(self.stats.installed()),
            idle_timeout: self.idle_timeout,
            hard_timeout: self.hard_timeout,
            packet_count: self.stats.packets(),
            byte_count: self.stats.bytes(),
            matches: self.matches.clone(),
            instructions: self.instructions.read().clone(),
        }
    }
}
