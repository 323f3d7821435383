// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Errors returned by the forwarding engine.
//!
//! The engine never produces wire-format errors itself: the message
//! layer maps each of these onto the matching OpenFlow error type and
//! code.

use alloc::string::String;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum OfdpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("flow entry overlaps an existing entry")]
    Overlap,

    #[error("table {table} is full ({max} entries)")]
    TableFull { table: u8, max: u32 },

    #[error("no such table: {0}")]
    BadTableId(u8),

    #[error("unknown group: {0}")]
    UnknownGroup(u32),

    #[error("group {0} already exists")]
    GroupExists(u32),

    #[error("invalid group {id}: {reason}")]
    InvalidGroupType { id: u32, reason: String },

    #[error("flow entry not found")]
    NotFound,

    #[error("unsupported protocol version")]
    BadVersion,

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl OfdpError {
    /// A short, stable name for logging and probes.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Overlap => "overlap",
            Self::TableFull { .. } => "table-full",
            Self::BadTableId(_) => "bad-table-id",
            Self::UnknownGroup(_) => "unknown-group",
            Self::GroupExists(_) => "group-exists",
            Self::InvalidGroupType { .. } => "invalid-group-type",
            Self::NotFound => "not-found",
            Self::BadVersion => "bad-version",
            Self::NotImplemented(_) => "not-implemented",
        }
    }
}
