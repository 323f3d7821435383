// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Highest usable group id.
pub const GROUP_MAX: u32 = 0xffff_ff00;

/// Every group, in a delete or stats request.
pub const GROUP_ALL: u32 = 0xffff_fffc;

/// Wildcard group used in filters; disables the group restriction.
pub const GROUP_ANY: u32 = 0xffff_ffff;

/// How a group fans a packet out to its buckets.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum GroupType {
    /// Execute every bucket.
    All = 0,
    /// Execute one weighted bucket.
    Select = 1,
    /// Execute the single bucket.
    Indirect = 2,
    /// Execute the first live bucket.
    FastFailover = 3,
}

impl Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::All => "ALL",
            Self::Select => "SELECT",
            Self::Indirect => "INDIRECT",
            Self::FastFailover => "FF",
        };

        write!(f, "{s}")
    }
}

/// Is `id` a group id a group-mod may create?
pub fn is_valid_group_id(id: u32) -> bool {
    id <= GROUP_MAX
}
