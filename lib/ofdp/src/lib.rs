// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The data-plane forwarding engine of an OpenFlow 1.2 software
//! switch.
//!
//! Given a snapshot of a packet's header fields ([`PacketMatches`]),
//! the [`Pipeline`] walks its flow tables, executes the instructions
//! of the best matching entry of each table, fans out through the
//! group table and keeps the per-flow, per-table, per-group and
//! per-port counters needed by statistics requests. Flow entries
//! expire through a per-table timer wheel swept by the caller.
//!
//! Everything that touches actual packet bytes lives behind the
//! [`Datapath`] trait; everything that reports back to the control
//! plane lives behind the [`provider`] traits.
//!
//! [`PacketMatches`]: engine::packet::PacketMatches
//! [`Pipeline`]: engine::pipeline::Pipeline
//! [`Datapath`]: engine::datapath::Datapath

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[macro_use]
extern crate cfg_if;

pub use ofdp_api as api;

pub mod config;
pub mod ddi;
pub mod engine;
#[cfg(any(feature = "std", test))]
pub mod print;
pub mod provider;

pub type Result<T> = core::result::Result<T, api::OfdpError>;

// ================================================================
// DTrace USDT Provider
//
// Allowing us to use USDT to trace flow lifecycle and table misses
// when running in std/test.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod ofdp_provider {
    fn flow__add(table: u8, priority: u16, num_matches: u32, cookie: u64) {}
    fn flow__remove(table: u8, priority: u16, reason: &str) {}
    fn flow__expired(table: u8, kind: &str, deadline: u64, now: u64) {}
    fn table__miss(table: u8, miss: &str) {}
    fn group__delete(group: u32, flows_removed: u64) {}
}
