// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers allow the engine to report to whatever hosts it without
//! knowing what that host is. Logging and flow lifecycle
//! notifications are both providers: a switch daemon turns the flow
//! notifications into flow-removed messages for the controller, while
//! a unit test just records them.
//!
//! If a concern doesn't serve an obvious purpose with at least two
//! obvious implementations, then it probably doesn't need to be a
//! provider.

use crate::api::FlowRemoveReason;
use crate::engine::flow_entry::FlowEntry;
use core::fmt;
use core::fmt::Display;

/// The set of all host-specific providers required by a pipeline.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
    pub events: Box<dyn FlowEventProvider>,
}

impl Providers {
    /// Log to stdout and discard flow events.
    pub fn println() -> Self {
        Self { log: Box::new(PrintlnLog), events: Box::new(NoopEvents) }
    }
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
///
/// For example, in a unit test this could map to `println!`. In a
/// switch daemon it would map to its `slog` root logger.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Forward to a `slog` logger.
pub struct SlogLog {
    logger: slog::Logger,
}

impl SlogLog {
    pub fn new(logger: slog::Logger) -> Self {
        Self { logger }
    }
}

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Note => slog::info!(self.logger, "{}", msg),
            LogLevel::Warn => slog::warn!(self.logger, "{}", msg),
            LogLevel::Error => slog::error!(self.logger, "{}", msg),
        }
    }
}

/// Notifications of flow entry lifecycle events.
///
/// These are called with the table's writer lock held, so an
/// implementation must not call back into the same table.
pub trait FlowEventProvider: Send + Sync {
    fn flow_added(&self, _table_id: u8, _entry: &FlowEntry) {}

    fn flow_modified(&self, _table_id: u8, _entry: &FlowEntry) {}

    /// Only called for entries which asked to be notified of their
    /// removal, and never with [`FlowRemoveReason::NoReason`].
    fn flow_removed(
        &self,
        _table_id: u8,
        _entry: &FlowEntry,
        _reason: FlowRemoveReason,
    ) {
    }
}

#[derive(Clone, Copy)]
pub struct NoopEvents;

impl FlowEventProvider for NoopEvents {}
