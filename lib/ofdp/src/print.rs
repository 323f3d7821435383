// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print statistics in a human-friendly manner.
//!
//! A place to hang printing routines shared by switch daemons,
//! debugging tools and integration tests.

use crate::api::FlowStatsDump;
use crate::api::GroupDesc;
use crate::api::GroupStats;
use crate::api::TableStats;
use itertools::Itertools;
use std::collections::VecDeque;
use std::io::Write;
use tabwriter::TabWriter;

/// Print flow entries.
pub fn print_flows(flows: &[FlowStatsDump]) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), flows)
}

/// Print flow entries into a given writer.
pub fn print_flows_into(
    writer: &mut impl Write,
    flows: &[FlowStatsDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "TABLE\tPRI\tCOOKIE\tPKTS\tBYTES\tMATCHES\tINSTRUCTIONS")?;
    write_hr(&mut t)?;

    for flow in flows {
        print_flow(&mut t, flow)?;
    }
    t.flush()
}

fn print_flow(t: &mut impl Write, flow: &FlowStatsDump) -> std::io::Result<()> {
    let mut matches = flow.matches.iter().collect::<VecDeque<_>>();
    let first = match matches.pop_front() {
        Some(m) => m.as_str(),
        None => "*",
    };

    writeln!(
        t,
        "{}\t{}\t{:#x}\t{}\t{}\t{first}\t{}",
        flow.table_id,
        flow.priority,
        flow.cookie,
        flow.packet_count,
        flow.byte_count,
        flow.instructions.iter().join(" "),
    )?;

    // One match per line keeps wide match-sets readable.
    while let Some(m) = matches.pop_front() {
        writeln!(t, "\t\t\t\t\t{m}\t")?;
    }

    Ok(())
}

/// Print table counters.
pub fn print_tables(tables: &[TableStats]) -> std::io::Result<()> {
    print_tables_into(&mut std::io::stdout(), tables)
}

/// Print table counters into a given writer.
pub fn print_tables_into(
    writer: &mut impl Write,
    tables: &[TableStats],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "TABLE\tACTIVE\tLOOKUPS\tMATCHED")?;

    for ts in tables {
        writeln!(
            t,
            "{}\t{}\t{}\t{}",
            ts.table_id, ts.active_count, ts.lookup_count, ts.matched_count,
        )?;
    }
    t.flush()
}

/// Print groups, merging descriptions with their counters.
pub fn print_groups(
    descs: &[GroupDesc],
    stats: &[GroupStats],
) -> std::io::Result<()> {
    print_groups_into(&mut std::io::stdout(), descs, stats)
}

/// Print groups into a given writer.
pub fn print_groups_into(
    writer: &mut impl Write,
    descs: &[GroupDesc],
    stats: &[GroupStats],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "GROUP\tTYPE\tREFS\tPKTS\tBYTES\tBUCKET\tACTIONS")?;
    write_hr(&mut t)?;

    for desc in descs {
        let st = stats.iter().find(|s| s.group_id == desc.group_id);
        let (refs, pkts, bytes) = st
            .map(|s| (s.ref_count, s.packet_count, s.byte_count))
            .unwrap_or_default();

        writeln!(
            t,
            "{}\t{}\t{refs}\t{pkts}\t{bytes}\t\t",
            desc.group_id, desc.group_type
        )?;

        for (i, bucket) in desc.buckets.iter().enumerate() {
            writeln!(t, "\t\t\t\t\t{i}\t{}", bucket.actions.iter().join(","))?;
        }
    }
    t.flush()
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
