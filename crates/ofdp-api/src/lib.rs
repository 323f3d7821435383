// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod error;
pub mod field;
pub mod group;
pub mod port;
pub mod stat;

pub use error::*;
pub use field::*;
pub use group::*;
pub use port::*;
pub use stat::*;

/// The OpenFlow wire version whose semantics this engine implements.
pub const OFP_VERSION: u8 = 0x03;

/// The number of tables a pipeline may hold. Table ids are a `u8` on
/// the wire and `0xff` is reserved to mean "all tables".
pub const MAX_FLOW_TABLES: u8 = 0xfe;

/// Table id meaning every table in a stats request.
pub const TABLE_ALL: u8 = 0xff;

/// Default number of bytes of a packet sent to the controller on a
/// table miss.
pub const DEFAULT_MISS_SEND_LEN: u16 = 128;

/// Why a flow entry left its table.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum FlowRemoveReason {
    IdleTimeout = 0,
    HardTimeout = 1,
    Delete = 2,
    GroupDelete = 3,
    /// Internal removal (e.g. replacement by an identical entry);
    /// never reported to the controller.
    NoReason = 0xff,
}

impl Display for FlowRemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::HardTimeout => "HARD_TIMEOUT",
            Self::Delete => "DELETE",
            Self::GroupDelete => "GROUP_DELETE",
            Self::NoReason => "NO_REASON",
        };

        write!(f, "{s}")
    }
}

/// Why a packet was handed to the controller.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum PacketInReason {
    NoMatch = 0,
    Action = 1,
    InvalidTtl = 2,
}

/// What a table does with a packet that matches none of its entries.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[repr(u8)]
pub enum TableMissConfig {
    #[default]
    Controller = 0,
    Continue = 1 << 0,
    Drop = 1 << 1,
}

impl Display for TableMissConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Controller => "CONTROLLER",
            Self::Continue => "CONTINUE",
            Self::Drop => "DROP",
        };

        write!(f, "{s}")
    }
}

/// Whether a modify/delete selects entries by exact match-set and
/// priority, or by containment.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Strictness {
    NonStrict,
    Strict,
}

bitflags::bitflags! {
    /// Datapath capabilities advertised in a features reply.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct Capabilities: u32 {
        const FLOW_STATS = 1 << 0;
        const TABLE_STATS = 1 << 1;
        const PORT_STATS = 1 << 2;
        const GROUP_STATS = 1 << 3;
        const IP_REASM = 1 << 5;
        const QUEUE_STATS = 1 << 6;
        const PORT_BLOCKED = 1 << 8;
    }
}

impl Capabilities {
    pub const DEFAULT: Self = Self::FLOW_STATS
        .union(Self::TABLE_STATS)
        .union(Self::PORT_STATS)
        .union(Self::GROUP_STATS)
        .union(Self::QUEUE_STATS);
}

bitflags::bitflags! {
    /// Instruction kinds a table accepts.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub struct InstructionCaps: u32 {
        const GOTO_TABLE = 1 << 1;
        const WRITE_METADATA = 1 << 2;
        const WRITE_ACTIONS = 1 << 3;
        const APPLY_ACTIONS = 1 << 4;
        const CLEAR_ACTIONS = 1 << 5;
        const EXPERIMENTER = 1 << 15;
    }
}

impl Default for InstructionCaps {
    fn default() -> Self {
        Self::all()
    }
}

bitflags::bitflags! {
    /// Table-miss behaviours a table may be configured with.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub struct TableMissCaps: u32 {
        const CONTROLLER = 1 << 0;
        const CONTINUE = 1 << 1;
        const DROP = 1 << 2;
    }
}

impl Default for TableMissCaps {
    fn default() -> Self {
        Self::all()
    }
}

impl TableMissCaps {
    pub fn allows(&self, cfg: TableMissConfig) -> bool {
        match cfg {
            TableMissConfig::Controller => self.contains(Self::CONTROLLER),
            TableMissConfig::Continue => self.contains(Self::CONTINUE),
            TableMissConfig::Drop => self.contains(Self::DROP),
        }
    }
}
