// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow entry expiration.
//!
//! Every table keeps its own wheel of deadlines, expressed in
//! milliseconds since the table's epoch and rounded up to the tick.
//! A deadline slot holds the entries due then. An idle timer is not
//! moved on every packet: hits only record the time of last use, and
//! a due idle timer is re-armed from that time when it fires too
//! early.

use super::flow_entry::FlowEntry;
use crate::api::FlowRemoveReason;
use crate::ddi::time::MILLIS;
use crate::ddi::time::Moment;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerKind {
    Idle,
    Hard,
}

impl TimerKind {
    pub fn reason(&self) -> FlowRemoveReason {
        match self {
            Self::Idle => FlowRemoveReason::IdleTimeout,
            Self::Hard => FlowRemoveReason::HardTimeout,
        }
    }
}

impl Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Hard => "hard",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
struct TimerRecord {
    entry: Arc<FlowEntry>,
    kind: TimerKind,
}

/// The deadlines one entry is currently linked at.
#[derive(Clone, Copy, Debug, Default)]
struct Armed {
    idle: Option<u64>,
    hard: Option<u64>,
}

/// An entry whose timer fired.
#[derive(Debug)]
pub struct Expired {
    pub entry: Arc<FlowEntry>,
    pub kind: TimerKind,
    pub deadline: u64,
}

#[derive(Debug)]
pub struct TimerWheel {
    epoch: Moment,
    tick_ms: u64,
    slots: BTreeMap<u64, Vec<TimerRecord>>,
    // Keyed by entry address; every entry here is kept alive by the
    // records in `slots`.
    armed: BTreeMap<usize, Armed>,
}

fn key(entry: &Arc<FlowEntry>) -> usize {
    Arc::as_ptr(entry) as usize
}

impl TimerWheel {
    pub fn new(epoch: Moment, tick_ms: u64) -> Self {
        Self {
            epoch,
            tick_ms: tick_ms.max(1),
            slots: BTreeMap::new(),
            armed: BTreeMap::new(),
        }
    }

    pub fn epoch(&self) -> Moment {
        self.epoch
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Milliseconds from the epoch to `now`.
    pub fn now_ms(&self, now: Moment) -> u64 {
        now.delta_as_millis(self.epoch)
    }

    /// The slot a timeout of `timeout_s` seconds counted from
    /// `base_ms` falls into.
    pub fn deadline(&self, base_ms: u64, timeout_s: u16) -> u64 {
        let due = base_ms + u64::from(timeout_s) * MILLIS;
        due.div_ceil(self.tick_ms) * self.tick_ms
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.slots.values().map(Vec::len).sum()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.keys().next().copied()
    }

    fn link(&mut self, entry: &Arc<FlowEntry>, kind: TimerKind, at: u64) {
        self.slots
            .entry(at)
            .or_default()
            .push(TimerRecord { entry: Arc::clone(entry), kind });

        let armed = self.armed.entry(key(entry)).or_default();
        match kind {
            TimerKind::Idle => armed.idle = Some(at),
            TimerKind::Hard => armed.hard = Some(at),
        }
    }

    fn unlink(&mut self, entry: &Arc<FlowEntry>, at: u64) {
        if let Some(records) = self.slots.get_mut(&at) {
            records.retain(|r| !Arc::ptr_eq(&r.entry, entry));
            if records.is_empty() {
                self.slots.remove(&at);
            }
        }
    }

    /// Arm the timers of a freshly inserted entry. Its last-use time
    /// starts at `now`.
    pub fn add(&mut self, entry: &Arc<FlowEntry>, now: Moment) {
        let now_ms = self.now_ms(now);
        entry.touch(now_ms);

        if entry.idle_timeout() > 0 {
            let at = self.deadline(now_ms, entry.idle_timeout());
            self.link(entry, TimerKind::Idle, at);
        }

        if entry.hard_timeout() > 0 {
            let at = self.deadline(now_ms, entry.hard_timeout());
            self.link(entry, TimerKind::Hard, at);
        }
    }

    /// Disarm every timer of `entry`.
    pub fn remove(&mut self, entry: &Arc<FlowEntry>) {
        let Some(armed) = self.armed.remove(&key(entry)) else {
            return;
        };

        if let Some(at) = armed.idle {
            self.unlink(entry, at);
        }

        if let Some(at) = armed.hard {
            self.unlink(entry, at);
        }
    }

    /// Collect the entries whose timers are due at `now`.
    ///
    /// Idle timers of entries used since they were armed are re-armed
    /// instead. Expired entries keep whatever other timer they have
    /// armed; removing the entry disarms it.
    pub fn expire(&mut self, now: Moment) -> Vec<Expired> {
        let now_ms = self.now_ms(now);
        let mut expired: Vec<Expired> = vec![];

        while let Some(slot) = self.slots.first_entry() {
            if *slot.key() > now_ms {
                break;
            }

            let (deadline, records) = slot.remove_entry();
            for rec in records {
                let k = key(&rec.entry);
                if let Some(armed) = self.armed.get_mut(&k) {
                    match rec.kind {
                        TimerKind::Idle => armed.idle = None,
                        TimerKind::Hard => armed.hard = None,
                    }
                }

                if rec.kind == TimerKind::Idle {
                    let at = self.deadline(
                        rec.entry.last_touched(),
                        rec.entry.idle_timeout(),
                    );
                    if at > now_ms {
                        self.link(&rec.entry, TimerKind::Idle, at);
                        continue;
                    }
                }

                if expired.iter().any(|e| Arc::ptr_eq(&e.entry, &rec.entry))
                {
                    continue;
                }

                expired.push(Expired {
                    entry: rec.entry,
                    kind: rec.kind,
                    deadline,
                });
            }
        }

        expired
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::time::Duration;

    fn entry(idle: u16, hard: u16) -> Arc<FlowEntry> {
        let mut e = FlowEntry::new(1);
        e.set_timeouts(idle, hard);
        Arc::new(e)
    }

    fn secs(t0: Moment, s: u64) -> Moment {
        t0 + Duration::from_secs(s)
    }

    fn millis(t0: Moment, ms: u64) -> Moment {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn deadlines_round_up_to_tick() {
        let w = TimerWheel::new(Moment::now(), 1000);
        assert_eq!(w.deadline(0, 5), 5000);
        assert_eq!(w.deadline(1, 5), 6000);
        assert_eq!(w.deadline(4000, 5), 9000);

        let w = TimerWheel::new(Moment::now(), 300);
        assert_eq!(w.deadline(0, 1), 1200);
    }

    #[test]
    fn hard_timeout() {
        let t0 = Moment::now();
        let mut w = TimerWheel::new(t0, 1000);
        let e = entry(0, 3);
        w.add(&e, t0);
        assert_eq!(w.len(), 1);

        assert!(w.expire(secs(t0, 2)).is_empty());
        let exp = w.expire(secs(t0, 3));
        assert_eq!(exp.len(), 1);
        assert_eq!(exp[0].kind, TimerKind::Hard);
        assert!(Arc::ptr_eq(&exp[0].entry, &e));
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn idle_rearms_after_touch() {
        let t0 = Moment::now();
        let mut w = TimerWheel::new(t0, 1000);
        let e = entry(5, 0);
        w.add(&e, t0);

        e.touch(w.now_ms(secs(t0, 4)));
        assert!(w.expire(secs(t0, 6)).is_empty());
        assert_eq!(w.next_deadline(), Some(9000));

        let exp = w.expire(secs(t0, 10));
        assert_eq!(exp.len(), 1);
        assert_eq!(exp[0].kind, TimerKind::Idle);
    }

    #[test]
    fn both_due_expires_once() {
        let t0 = Moment::now();
        let mut w = TimerWheel::new(t0, 1000);
        let e = entry(2, 2);
        w.add(&e, t0);

        let exp = w.expire(secs(t0, 2));
        assert_eq!(exp.len(), 1);
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn remove_disarms() {
        let t0 = Moment::now();
        let mut w = TimerWheel::new(t0, 1000);
        let a = entry(2, 10);
        let b = entry(2, 0);
        w.add(&a, millis(t0, 10));
        w.add(&b, millis(t0, 20));
        assert_eq!(w.len(), 3);

        w.remove(&a);
        assert_eq!(w.len(), 1);
        let exp = w.expire(secs(t0, 20));
        assert_eq!(exp.len(), 1);
        assert!(Arc::ptr_eq(&exp[0].entry, &b));
    }
}
