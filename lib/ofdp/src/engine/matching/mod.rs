// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Matching algorithms.
//!
//! A flow table delegates entry selection to a [`MatchingAlgorithm`].
//! The table owns the storage, the locks and the timers; the algorithm
//! decides where entries go, which entries an operation selects, and
//! which entry a packet hits. Mutating operations are handed the
//! table's [`TableWriter`], which proves the writer lock is held.

use super::flow_entry::FlowEntry;
use super::flow_table::EntryList;
use super::flow_table::FlowTable;
use super::flow_table::TableWriter;
use super::packet::PacketMatches;
use super::stat::FlowStatsRecord;
use crate::api::AggregateStats;
use crate::api::FlowRemoveReason;
use crate::api::Strictness;
use crate::ddi::time::Moment;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

pub mod loop_match;

pub use loop_match::LoopMatch;

pub trait MatchingAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert `entry` in its ordered position.
    ///
    /// With `check_overlap` an existing entry of equal priority that
    /// could match the same packet fails the insert with `Overlap`.
    /// Otherwise an identical existing entry is replaced, its
    /// counters carried over unless `reset_counts` is set.
    fn add(
        &self,
        table: &FlowTable,
        w: &mut TableWriter,
        entry: FlowEntry,
        check_overlap: bool,
        reset_counts: bool,
        now: Moment,
    ) -> crate::Result<Arc<FlowEntry>>;

    /// Replace the instructions of the entries `template` selects.
    /// Returns the entries modified.
    fn modify(
        &self,
        table: &FlowTable,
        w: &mut TableWriter,
        template: FlowEntry,
        strict: Strictness,
        reset_counts: bool,
        now: Moment,
    ) -> crate::Result<Vec<Arc<FlowEntry>>>;

    /// Remove the entries `template` selects, returning how many.
    fn remove(
        &self,
        table: &FlowTable,
        w: &mut TableWriter,
        template: &FlowEntry,
        strict: Strictness,
        out_port: u32,
        out_group: u32,
        reason: FlowRemoveReason,
    ) -> crate::Result<usize>;

    /// The highest ranked entry the packet satisfies.
    fn find_best_match(
        &self,
        entries: &EntryList,
        pkt: &PacketMatches,
    ) -> Option<Arc<FlowEntry>>;

    fn find_entry_referencing_group(
        &self,
        entries: &EntryList,
        group_id: u32,
    ) -> Option<Arc<FlowEntry>>;

    /// Snapshots of the entries the (non-strict) `query` contains.
    fn flow_stats(
        &self,
        entries: &EntryList,
        table_id: u8,
        query: &FlowEntry,
        out_port: u32,
        out_group: u32,
        now: Moment,
    ) -> Vec<FlowStatsRecord>;

    fn aggregate_stats(
        &self,
        entries: &EntryList,
        query: &FlowEntry,
        out_port: u32,
        out_group: u32,
    ) -> AggregateStats;
}

/// The algorithms a table can be configured with.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchingAlgorithmKind {
    /// Linear scan of the priority-ordered entry list.
    #[default]
    Loop,
}

impl MatchingAlgorithmKind {
    pub fn build(&self) -> Box<dyn MatchingAlgorithm> {
        match self {
            Self::Loop => Box::new(LoopMatch),
        }
    }
}

impl Display for MatchingAlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Loop => "loop",
        };
        write!(f, "{s}")
    }
}
