// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow entry instructions.

use super::action::ActionGroup;
use super::action::GroupAction;
use super::action::WriteActions;
use super::action::process_actions;
use super::datapath::Datapath;
use super::packet::PacketCtx;
use crate::api::InstructionCaps;
use core::fmt;
use core::fmt::Display;

/// The value/mask pair of a write-metadata instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteMetadata {
    pub metadata: u64,
    pub mask: u64,
}

/// The instructions of one flow entry: one optional slot per
/// instruction kind. Slots run in declaration order: apply, clear,
/// write, write-metadata, experimenter, goto-table.
#[derive(Clone, Debug, Default)]
pub struct InstructionGroup {
    apply: Option<ActionGroup>,
    clear: bool,
    write: Option<WriteActions>,
    write_metadata: Option<WriteMetadata>,
    experimenter: Option<u32>,
    goto_table: Option<u8>,
    has_multiple_outputs: bool,
}

impl InstructionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_actions(mut self, actions: ActionGroup) -> Self {
        self.apply = Some(actions);
        self.recount();
        self
    }

    pub fn clear_actions(mut self) -> Self {
        self.clear = true;
        self
    }

    pub fn write_actions(mut self, actions: WriteActions) -> Self {
        self.write = Some(actions);
        self.recount();
        self
    }

    pub fn write_metadata(mut self, metadata: u64, mask: u64) -> Self {
        self.write_metadata = Some(WriteMetadata { metadata, mask });
        self
    }

    pub fn experimenter(mut self, id: u32) -> Self {
        self.experimenter = Some(id);
        self
    }

    pub fn goto_table(mut self, table_id: u8) -> Self {
        self.goto_table = Some(table_id);
        self
    }

    fn recount(&mut self) {
        let apply = self.apply.as_ref().map_or(0, |a| a.num_outputs());
        let write = self.write.as_ref().map_or(0, |w| w.num_outputs());
        self.has_multiple_outputs = apply + write > 1;
    }

    pub fn apply(&self) -> Option<&ActionGroup> {
        self.apply.as_ref()
    }

    pub fn write(&self) -> Option<&WriteActions> {
        self.write.as_ref()
    }

    pub fn clears(&self) -> bool {
        self.clear
    }

    pub fn metadata(&self) -> Option<WriteMetadata> {
        self.write_metadata
    }

    pub fn next_table(&self) -> Option<u8> {
        self.goto_table
    }

    /// Do the apply and write actions together output more than
    /// once? If so every output works on a duplicate.
    pub fn has_multiple_outputs(&self) -> bool {
        self.has_multiple_outputs
    }

    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }

    /// The instruction kinds present, for checking against a table's
    /// capabilities.
    pub fn kinds(&self) -> InstructionCaps {
        let mut caps = InstructionCaps::empty();
        caps.set(InstructionCaps::APPLY_ACTIONS, self.apply.is_some());
        caps.set(InstructionCaps::CLEAR_ACTIONS, self.clear);
        caps.set(InstructionCaps::WRITE_ACTIONS, self.write.is_some());
        caps.set(
            InstructionCaps::WRITE_METADATA,
            self.write_metadata.is_some(),
        );
        caps.set(InstructionCaps::EXPERIMENTER, self.experimenter.is_some());
        caps.set(InstructionCaps::GOTO_TABLE, self.goto_table.is_some());
        caps
    }

    /// Does any apply or write action output to `port`?
    pub fn has_output(&self, port: u32) -> bool {
        self.apply.as_ref().is_some_and(|a| a.has_output(port))
            || self.write.as_ref().is_some_and(|w| w.has_output(port))
    }

    /// Does any apply or write action use group `id`?
    pub fn has_group(&self, id: u32) -> bool {
        self.apply.as_ref().is_some_and(|a| a.has_group(id))
            || self.write.as_ref().is_some_and(|w| w.has_group(id))
    }

    pub(crate) fn group_actions_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut GroupAction> {
        let apply = self.apply.iter_mut().flat_map(|a| a.iter_mut());
        let write = self.write.iter_mut().flat_map(|w| w.iter_mut());
        apply.chain(write).filter_map(|a| match a {
            super::action::Action::Group(ga) => Some(ga),
            _ => None,
        })
    }

    fn group_actions(&self) -> impl Iterator<Item = &GroupAction> {
        let apply = self.apply.iter().flat_map(|a| a.iter());
        let write = self.write.iter().flat_map(|w| w.iter());
        apply.chain(write).filter_map(|a| match a {
            super::action::Action::Group(ga) => Some(ga),
            _ => None,
        })
    }

    /// Count one more reference on every group these instructions
    /// use.
    pub(crate) fn hold_groups(&self) {
        for ga in self.group_actions() {
            if let Some(g) = ga.group() {
                g.stats().ref_inc();
            }
        }
    }

    pub(crate) fn release_groups(&self) {
        for ga in self.group_actions() {
            if let Some(g) = ga.group() {
                g.stats().ref_dec();
            }
        }
    }

    /// One line per instruction, for dumps.
    pub fn describe(&self) -> Vec<String> {
        use itertools::Itertools;

        let mut out = vec![];
        if let Some(apply) = &self.apply {
            out.push(format!("APPLY[{}]", apply.iter().join(",")));
        }
        if self.clear {
            out.push("CLEAR".to_string());
        }
        if let Some(write) = &self.write {
            out.push(format!("WRITE[{}]", write.iter().join(",")));
        }
        if let Some(md) = self.write_metadata {
            out.push(format!("METADATA({:#x}/{:#x})", md.metadata, md.mask));
        }
        if let Some(id) = self.experimenter {
            out.push(format!("EXPERIMENTER({id:#x})"));
        }
        if let Some(t) = self.goto_table {
            out.push(format!("GOTO({t})"));
        }
        out
    }
}

impl Display for InstructionGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.describe().join(" "))
    }
}

/// Run an entry's instructions against the packet, returning the
/// table to continue in, if any.
///
/// Apply-actions run immediately. Write-actions are only merged into
/// the packet's action set; the caller runs that set once the packet
/// leaves the pipeline.
pub(crate) fn process_instructions<D: Datapath>(
    dp: &D,
    ctx: &mut PacketCtx<D::Packet>,
    table_id: u8,
    inst: &InstructionGroup,
) -> Option<u8> {
    if let Some(apply) = &inst.apply {
        // Outputs already sitting in the action set, and the tables
        // after a goto, still need the original packet once we are
        // done here.
        let replicate = inst.has_multiple_outputs
            || inst.goto_table.is_some()
            || ctx.write_actions.num_outputs() > 0;
        process_actions(dp, ctx, table_id, apply.iter(), replicate);
    }

    if inst.clear {
        ctx.write_actions.clear();
    }

    if let Some(write) = &inst.write {
        ctx.write_actions.merge(write);
    }

    if let Some(md) = inst.write_metadata {
        ctx.matches.metadata =
            (ctx.matches.metadata & !md.mask) | (md.metadata & md.mask);
    }

    inst.goto_table
}

/// Run the packet's accumulated action set.
pub(crate) fn process_write_actions<D: Datapath>(
    dp: &D,
    ctx: &mut PacketCtx<D::Packet>,
    table_id: u8,
    replicate: bool,
) {
    let set = core::mem::take(&mut ctx.write_actions);
    let replicate = replicate || set.num_outputs() > 1;
    process_actions(dp, ctx, table_id, set.iter(), replicate);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::action::Action;

    #[test]
    fn multiple_outputs_across_apply_and_write() {
        let ig = InstructionGroup::new()
            .apply_actions(ActionGroup::new(vec![Action::output(1)]));
        assert!(!ig.has_multiple_outputs());

        let ig = ig.write_actions(WriteActions::new(vec![Action::output(2)]));
        assert!(ig.has_multiple_outputs());
        assert!(ig.has_output(1));
        assert!(ig.has_output(2));
        assert!(!ig.has_output(3));
    }

    #[test]
    fn kinds_reflect_slots() {
        let ig = InstructionGroup::new().clear_actions().goto_table(3);
        assert_eq!(
            ig.kinds(),
            InstructionCaps::CLEAR_ACTIONS | InstructionCaps::GOTO_TABLE
        );
        assert_eq!(ig.next_table(), Some(3));
        assert!(InstructionGroup::new().is_empty());
    }

    #[test]
    fn describe() {
        let ig = InstructionGroup::new()
            .apply_actions(ActionGroup::new(vec![
                Action::DecNwTtl,
                Action::output(4),
            ]))
            .write_metadata(0x10, 0xf0)
            .goto_table(1);
        assert_eq!(
            ig.describe(),
            vec![
                "APPLY[DEC_NW_TTL,OUTPUT(4)]".to_string(),
                "METADATA(0x10/0xf0)".to_string(),
                "GOTO(1)".to_string(),
            ]
        );
    }
}
