// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The linear matching algorithm: a scan of the ordered entry list.

use super::MatchingAlgorithm;
use crate::api::AggregateStats;
use crate::api::FlowRemoveReason;
use crate::api::GROUP_ANY;
use crate::api::OfdpError;
use crate::api::PORT_ANY;
use crate::api::Strictness;
use crate::ddi::time::Moment;
use crate::engine::flow_entry::FlowEntry;
use crate::engine::flow_table::EntryList;
use crate::engine::flow_table::FlowTable;
use crate::engine::flow_table::TableWriter;
use crate::engine::packet::PacketMatches;
use crate::engine::stat::FlowStatsRecord;
use crate::engine::stat::aggregate;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default)]
pub struct LoopMatch;

/// Entries `template` selects for a modify or delete.
fn select(
    entries: &EntryList,
    template: &FlowEntry,
    strict: Strictness,
    out_port: u32,
    out_group: u32,
) -> Vec<Arc<FlowEntry>> {
    match strict {
        Strictness::Strict => entries
            .entries()
            .filter(|e| e.check_equal(template, out_port, out_group))
            .cloned()
            .collect(),

        Strictness::NonStrict => entries
            .entries()
            .filter(|e| {
                template.check_contained(e, false, true, out_port, out_group)
            })
            .cloned()
            .collect(),
    }
}

impl MatchingAlgorithm for LoopMatch {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn add(
        &self,
        table: &FlowTable,
        w: &mut TableWriter,
        entry: FlowEntry,
        check_overlap: bool,
        reset_counts: bool,
        _now: Moment,
    ) -> crate::Result<Arc<FlowEntry>> {
        let replaced = {
            let list = table.entries();
            if list.len() >= table.max_entries() as usize {
                return Err(OfdpError::TableFull {
                    table: table.id(),
                    max: table.max_entries(),
                });
            }

            if check_overlap {
                let clash = list.entries().any(|e| {
                    e.check_overlap(&entry, true, false, PORT_ANY, GROUP_ANY)
                });
                if clash {
                    return Err(OfdpError::Overlap);
                }
                None
            } else {
                list.entries()
                    .find(|e| e.check_equal(&entry, PORT_ANY, GROUP_ANY))
                    .cloned()
            }
        };

        if let Some(old) = replaced {
            if !reset_counts {
                entry.stats().copy_from(old.stats());
            }
            table.detach(w, &old, FlowRemoveReason::NoReason)?;
        }

        let entry = Arc::new(entry);
        let key = entry.sort_key();
        let mut list = table.entries_mut(w);
        let before = list
            .iter()
            .find(|(_, e)| e.sort_key() <= key)
            .map(|(slot, _)| slot);
        let slot = list.insert_before(before, Arc::clone(&entry));
        entry.set_location(table.id(), slot);
        Ok(entry)
    }

    fn modify(
        &self,
        table: &FlowTable,
        _w: &mut TableWriter,
        template: FlowEntry,
        strict: Strictness,
        reset_counts: bool,
        now: Moment,
    ) -> crate::Result<Vec<Arc<FlowEntry>>> {
        // Strict or not, every selected entry is updated, the same set
        // a remove with this template would take out.
        let targets =
            select(&table.entries(), &template, strict, PORT_ANY, GROUP_ANY);

        let inst = template.into_instructions();
        for target in &targets {
            target.update(inst.clone(), reset_counts, now);
        }

        Ok(targets)
    }

    fn remove(
        &self,
        table: &FlowTable,
        w: &mut TableWriter,
        template: &FlowEntry,
        strict: Strictness,
        out_port: u32,
        out_group: u32,
        reason: FlowRemoveReason,
    ) -> crate::Result<usize> {
        let victims =
            select(&table.entries(), template, strict, out_port, out_group);

        for victim in &victims {
            table.detach(w, victim, reason)?;
        }

        Ok(victims.len())
    }

    fn find_best_match(
        &self,
        entries: &EntryList,
        pkt: &PacketMatches,
    ) -> Option<Arc<FlowEntry>> {
        entries.entries().find(|e| e.matches_packet(pkt)).cloned()
    }

    fn find_entry_referencing_group(
        &self,
        entries: &EntryList,
        group_id: u32,
    ) -> Option<Arc<FlowEntry>> {
        entries.entries().find(|e| e.references_group(group_id)).cloned()
    }

    fn flow_stats(
        &self,
        entries: &EntryList,
        table_id: u8,
        query: &FlowEntry,
        out_port: u32,
        out_group: u32,
        now: Moment,
    ) -> Vec<FlowStatsRecord> {
        entries
            .entries()
            .filter(|e| {
                query.check_contained(e, false, true, out_port, out_group)
            })
            .map(|e| e.record(table_id, now))
            .collect()
    }

    fn aggregate_stats(
        &self,
        entries: &EntryList,
        query: &FlowEntry,
        out_port: u32,
        out_group: u32,
    ) -> AggregateStats {
        let now = Moment::now();
        let records =
            self.flow_stats(entries, 0, query, out_port, out_group, now);
        aggregate(&records)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TableConfig;
    use crate::engine::flow_match::Match;
    use crate::provider::Providers;

    fn table(max: u32) -> FlowTable {
        FlowTable::new(
            0,
            TableConfig::default(),
            max,
            1000,
            Arc::new(Providers::println()),
            Moment::now(),
        )
    }

    fn entry(prio: u16, matches: &[Match]) -> FlowEntry {
        let mut e = FlowEntry::new(prio);
        for m in matches {
            e.add_match(*m).unwrap();
        }
        e
    }

    #[test]
    fn ordered_by_matches_then_priority() {
        let t = table(16);
        t.add(entry(5, &[Match::tcp_dst(1)]), false, false).unwrap();
        t.add(entry(9, &[]), false, false).unwrap();
        t.add(entry(1, &[Match::tcp_dst(2), Match::ip_proto(6)]), false, false)
            .unwrap();
        t.add(entry(7, &[Match::tcp_dst(3)]), false, false).unwrap();
        t.add(entry(7, &[Match::tcp_dst(4)]), false, false).unwrap();

        assert_eq!(t.sort_keys(), vec![(2, 1), (1, 7), (1, 7), (1, 5), (0, 9)]);
    }

    #[test]
    fn table_full() {
        let t = table(1);
        t.add(entry(1, &[Match::tcp_dst(1)]), false, false).unwrap();
        let err = t.add(entry(1, &[Match::tcp_dst(2)]), false, false);
        assert_eq!(err.unwrap_err(), OfdpError::TableFull { table: 0, max: 1 });
    }

    #[test]
    fn strict_modify_selects_exact_match() {
        let t = table(16);
        let a = t.add(entry(3, &[Match::tcp_dst(80)]), false, false).unwrap();
        let b = t.add(entry(3, &[Match::tcp_dst(81)]), false, false).unwrap();

        let tmpl = entry(3, &[Match::tcp_dst(80)]).with_instructions(
            crate::engine::instruction::InstructionGroup::new().goto_table(1),
        );
        assert_eq!(t.modify(tmpl, Strictness::Strict, false).unwrap(), 1);
        assert_eq!(a.instructions().next_table(), Some(1));
        assert_eq!(b.instructions().next_table(), None);

        // Nothing selected is fine.
        let tmpl = entry(3, &[Match::tcp_dst(99)]);
        assert_eq!(t.modify(tmpl, Strictness::Strict, false).unwrap(), 0);
    }

    #[test]
    fn remove_specific_twice() {
        let t = table(16);
        let a = t.add(entry(3, &[]), false, false).unwrap();
        t.remove_specific(&a, FlowRemoveReason::Delete).unwrap();
        assert!(a.is_detached());
        assert_eq!(
            t.remove_specific(&a, FlowRemoveReason::Delete),
            Err(OfdpError::NotFound)
        );
        assert!(t.is_empty());
    }
}
