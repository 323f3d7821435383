// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Pipeline configuration.
//!
//! Both structures deserialize from any serde format; every field has
//! a default so a configuration only names what it changes.

use crate::api::InstructionCaps;
use crate::api::MAX_FLOW_TABLES;
use crate::api::MatchField;
use crate::api::OfdpError;
use crate::api::TableMissCaps;
use crate::api::TableMissConfig;
use crate::engine::action::ActionKind;
use crate::engine::matching::MatchingAlgorithmKind;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_NUM_TABLES: u8 = 8;
pub const DEFAULT_MAX_ENTRIES: u32 = u32::MAX;
pub const DEFAULT_TICK_MS: u64 = 1000;

/// What a single table accepts and does.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: Option<String>,
    pub miss: TableMissConfig,
    pub algorithm: MatchingAlgorithmKind,
    /// Overrides the pipeline-wide entry limit.
    pub max_entries: Option<u32>,
    /// `MatchField` bits the table matches on.
    pub match_fields: u64,
    /// `MatchField` bits the table may match with a partial mask.
    pub wildcards: u64,
    /// `ActionKind` bits allowed in apply-actions.
    pub apply_actions: u64,
    pub write_actions: u64,
    /// `MatchField` bits set-field actions may rewrite.
    pub apply_setfields: u64,
    pub write_setfields: u64,
    pub metadata_match: u64,
    pub metadata_write: u64,
    pub instructions: InstructionCaps,
    pub miss_caps: TableMissCaps,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: None,
            miss: TableMissConfig::default(),
            algorithm: MatchingAlgorithmKind::default(),
            max_entries: None,
            match_fields: MatchField::all_bits(),
            wildcards: MatchField::all_bits(),
            apply_actions: ActionKind::all_bits(),
            write_actions: ActionKind::all_bits(),
            apply_setfields: MatchField::all_bits(),
            write_setfields: MatchField::all_bits(),
            metadata_match: u64::MAX,
            metadata_write: u64::MAX,
            instructions: InstructionCaps::all(),
            miss_caps: TableMissCaps::all(),
        }
    }
}

impl TableConfig {
    pub fn validate(&self, id: u8) -> crate::Result<()> {
        if !self.miss_caps.allows(self.miss) {
            return Err(OfdpError::InvalidArgument(format!(
                "table {id}: miss behaviour {} is not in its capabilities",
                self.miss
            )));
        }

        if self.max_entries == Some(0) {
            return Err(OfdpError::InvalidArgument(format!(
                "table {id}: max_entries must be non-zero"
            )));
        }

        Ok(())
    }
}

/// How to build a pipeline.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub num_tables: u8,
    /// Entry limit of each table.
    pub max_entries: u32,
    /// Granularity of flow expiration.
    pub tick_ms: u64,
    pub miss_send_len: u16,
    /// Configuration of every table without an override.
    pub table: TableConfig,
    /// Per-table overrides, by table id.
    pub tables: BTreeMap<u8, TableConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_tables: DEFAULT_NUM_TABLES,
            max_entries: DEFAULT_MAX_ENTRIES,
            tick_ms: DEFAULT_TICK_MS,
            miss_send_len: crate::api::DEFAULT_MISS_SEND_LEN,
            table: TableConfig::default(),
            tables: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn with_tables(num_tables: u8) -> Self {
        Self { num_tables, ..Default::default() }
    }

    /// The configuration table `id` is built with.
    pub fn table_config(&self, id: u8) -> TableConfig {
        self.tables.get(&id).cloned().unwrap_or_else(|| self.table.clone())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.num_tables == 0 || self.num_tables > MAX_FLOW_TABLES {
            return Err(OfdpError::InvalidArgument(format!(
                "num_tables must be within 1..={MAX_FLOW_TABLES}, got {}",
                self.num_tables
            )));
        }

        if self.max_entries == 0 {
            return Err(OfdpError::InvalidArgument(
                "max_entries must be non-zero".to_string(),
            ));
        }

        if self.tick_ms == 0 {
            return Err(OfdpError::InvalidArgument(
                "tick_ms must be non-zero".to_string(),
            ));
        }

        if let Some(id) = self.tables.keys().find(|id| **id >= self.num_tables)
        {
            return Err(OfdpError::InvalidArgument(format!(
                "override for table {id} beyond num_tables {}",
                self.num_tables
            )));
        }

        for id in 0..self.num_tables {
            self.table_config(id).validate(id)?;
        }

        Ok(())
    }
}
