// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Reserved port numbers.

use alloc::string::String;
use alloc::string::ToString;

/// Highest number usable for a physical or logical port.
pub const PORT_MAX: u32 = 0xffff_ff00;

/// Send the packet back out its ingress port.
pub const PORT_IN_PORT: u32 = 0xffff_fff8;

/// Submit the packet to the first flow table. Only valid in a
/// packet-out action list.
pub const PORT_TABLE: u32 = 0xffff_fff9;

/// Hand the packet to the traditional (non-OpenFlow) pipeline.
pub const PORT_NORMAL: u32 = 0xffff_fffa;

/// Flood along the spanning tree, excluding the ingress port.
pub const PORT_FLOOD: u32 = 0xffff_fffb;

/// Every port except the ingress port.
pub const PORT_ALL: u32 = 0xffff_fffc;

/// Send to the controller as a packet-in.
pub const PORT_CONTROLLER: u32 = 0xffff_fffd;

/// The local networking stack.
pub const PORT_LOCAL: u32 = 0xffff_fffe;

/// Wildcard port used in requests; in filters it disables the
/// output-port restriction.
pub const PORT_ANY: u32 = 0xffff_ffff;

/// Wildcard queue id for queue stats requests.
pub const QUEUE_ALL: u32 = 0xffff_ffff;

/// A human readable name for a port number.
pub fn port_name(port: u32) -> String {
    match port {
        PORT_IN_PORT => "IN_PORT".to_string(),
        PORT_TABLE => "TABLE".to_string(),
        PORT_NORMAL => "NORMAL".to_string(),
        PORT_FLOOD => "FLOOD".to_string(),
        PORT_ALL => "ALL".to_string(),
        PORT_CONTROLLER => "CONTROLLER".to_string(),
        PORT_LOCAL => "LOCAL".to_string(),
        PORT_ANY => "ANY".to_string(),
        p => p.to_string(),
    }
}
