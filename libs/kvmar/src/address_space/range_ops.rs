// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::num::NonZeroUsize;
use core::ops::Range;

use smallvec::SmallVec;

use super::tree::Inner;
use crate::address_range::AddressRangeExt;
use crate::node::{Node, NodeRef, RegionState};
use crate::{Error, Mmu, MmuFlags, VirtualAddress};

impl<M: Mmu> Inner<M> {
    /// Unmaps `base..base + size` from the live region `region`.
    ///
    /// With `can_destroy_regions` unset any sub-region in the range is an error, which is what
    /// overwriting a range with a new mapping wants.
    pub(super) fn unmap(
        &mut self,
        region: NodeRef,
        base: VirtualAddress,
        size: usize,
        can_destroy_regions: bool,
    ) -> crate::Result<()> {
        let (node, state) = self.alive_region(region)?;
        let target = Range::<VirtualAddress>::checked_from_start_len(base, size)
            .ok_or(Error::InvalidArgument)?;
        if target.is_empty() || !node.range.contains_range(&target) {
            return Err(Error::InvalidArgument);
        }

        if state.children.is_empty() {
            return Ok(());
        }

        if let Some(image) = self.system_image
            && self.get(image).range.overlaps(&target)
        {
            return Err(Error::AccessDenied);
        }

        let affected = self.children_overlapping(state, &target);

        // validate everything before touching anything
        for child in &affected {
            let n = self.get(*child);
            let is_region = n.as_region().is_some();
            if is_region && (!can_destroy_regions || !target.contains_range(&n.range)) {
                return Err(Error::InvalidArgument);
            }
        }

        for child in affected {
            if target.contains_range(&self.get(child).range) {
                self.destroy_node(child);
            } else {
                self.narrow_mapping(child, &target)?;
            }
        }

        Ok(())
    }

    /// Changes the permissions of the mappings in `base..base + size` of the live region `region`.
    pub(super) fn protect(
        &mut self,
        region: NodeRef,
        base: VirtualAddress,
        size: usize,
        new_flags: MmuFlags,
    ) -> crate::Result<()> {
        let (node, state) = self.alive_region(region)?;
        let target = Range::<VirtualAddress>::checked_from_start_len(base, size)
            .ok_or(Error::InvalidArgument)?;
        if target.is_empty() || !node.range.contains_range(&target) {
            return Err(Error::InvalidArgument);
        }

        if state.children.is_empty() {
            return Err(Error::NotFound);
        }

        let begin = Self::child_containing(state, &self.nodes, base).ok_or(Error::NotFound)?;
        let affected: SmallVec<[NodeRef; 8]> = state
            .children
            .range(self.get(begin).range.start..target.end)
            .map(|(_, child)| *child)
            .collect();

        // the range has to be covered by mappings without holes
        let mut last_mapped = self.get(begin).range.start;
        for child in &affected {
            let n = self.get(*child);
            if n.as_region().is_some() {
                return Err(Error::InvalidArgument);
            }
            if n.range.start != last_mapped {
                return Err(Error::NotFound);
            }
            if !new_flags.is_allowed_by(n.flags) || self.system_image == Some(*child) {
                return Err(Error::AccessDenied);
            }
            last_mapped = n.range.end;
        }
        if last_mapped < target.end {
            return Err(Error::NotFound);
        }

        for child in affected {
            self.protect_mapping(child, &target, new_flags)?;
        }

        Ok(())
    }

    /// Collects the direct children of `state` that overlap `target`, in address order.
    fn children_overlapping(
        &self,
        state: &RegionState,
        target: &Range<VirtualAddress>,
    ) -> SmallVec<[NodeRef; 8]> {
        // a child starting before the range may still reach into it
        let first = state
            .children
            .range(..=target.start)
            .next_back()
            .filter(|(_, child)| self.get(**child).range.end > target.start)
            .map_or(target.start, |(base, _)| *base);

        state
            .children
            .range(first..target.end)
            .map(|(_, child)| *child)
            .collect()
    }

    /// Splits the live mapping `node` at `at`, leaving `node` with the lower half.
    ///
    /// Returns the new mapping covering `at..end`. Translations are not touched, they simply belong
    /// to the new mapping afterwards.
    fn split_mapping(&mut self, node: NodeRef, at: VirtualAddress) -> crate::Result<NodeRef> {
        let generation = self.bump_generation();

        let n = self.get(node);
        debug_assert!(n.range.start < at && at < n.range.end);
        debug_assert!(at.is_aligned_to(crate::PAGE_SIZE));

        let mut mapping = n.as_mapping().expect("only mappings are split").clone();
        mapping.object_offset += at.offset_from_unsigned(n.range.start) as u64;
        let tail = Node::new_mapping(
            generation,
            at..n.range.end,
            n.flags,
            &n.name,
            n.parent.expect("mappings always have a parent"),
            mapping,
        );

        let tail = self.alloc_node(tail)?;
        self.get_mut(node).range.end = at;
        self.activate(tail);

        log::trace!("split mapping {node:?} at {at}");
        Ok(tail)
    }

    /// Removes the part of the mapping `node` that overlaps `target`, which must not cover all of
    /// it.
    fn narrow_mapping(
        &mut self,
        node: NodeRef,
        target: &Range<VirtualAddress>,
    ) -> crate::Result<()> {
        let range = self.get(node).range.clone();
        let overlap = range.clone().intersect(target.clone());
        debug_assert!(!overlap.is_empty() && overlap != range);

        if overlap.end < range.end && overlap.start > range.start {
            // a hole in the middle, unmap the head of the upper half
            self.split_mapping(node, overlap.end)?;
        }

        let len = NonZeroUsize::new(overlap.len()).expect("overlap is not empty");
        self.mmu.unmap(overlap.start, len);

        let n = self.get_mut(node);
        if overlap.start == range.start {
            n.range.start = overlap.end;
            n.as_mapping_mut()
                .expect("only mappings are narrowed")
                .object_offset += len.get() as u64;
            self.rekey(node, range.start);
        } else {
            n.range.end = overlap.start;
        }

        Ok(())
    }

    /// Applies `new_flags` to the part of the mapping `node` inside `target`, splitting off the parts
    /// outside of it. The cache policy and user bit of the mapping are kept.
    fn protect_mapping(
        &mut self,
        node: NodeRef,
        target: &Range<VirtualAddress>,
        new_flags: MmuFlags,
    ) -> crate::Result<()> {
        let n = self.get(node);
        let old_flags = n.mmu_flags().expect("only mappings are protected");
        let flags = old_flags.difference(MmuFlags::RWX) | new_flags.intersection(MmuFlags::RWX);
        if flags == old_flags {
            return Ok(());
        }

        let range = n.range.clone();
        let overlap = range.clone().intersect(target.clone());

        let mut node = node;
        if overlap.start > range.start {
            node = self.split_mapping(node, overlap.start)?;
        }
        if overlap.end < range.end {
            self.split_mapping(node, overlap.end)?;
        }

        if let Some(len) = NonZeroUsize::new(overlap.len()) {
            self.mmu.protect(overlap.start, len, flags)?;
        }
        self.get_mut(node)
            .as_mapping_mut()
            .expect("only mappings are protected")
            .mmu_flags = flags;

        log::trace!("protected {}..{} with {flags}", overlap.start, overlap.end);
        Ok(())
    }
}
