// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::num::NonZeroUsize;

use super::tree::Inner;
use crate::node::NodeRef;
use crate::{Error, Mmu, PAGE_SIZE, PageFaultFlags, VirtualAddress};

impl<M: Mmu> Inner<M> {
    pub(super) fn page_fault(
        &mut self,
        region: NodeRef,
        addr: VirtualAddress,
        flags: PageFaultFlags,
    ) -> crate::Result<()> {
        let (_, mut state) = self.alive_region(region)?;

        // descend through nested regions until we reach the mapping
        let mapping = loop {
            let child = Self::child_containing(state, &self.nodes, addr).ok_or(Error::NotFound)?;
            let n = self.get(child);
            match n.as_region() {
                Some(region) => state = region,
                None => break n,
            }
        };

        let mapping_state = mapping.as_mapping().expect("leaf nodes are mappings");
        let mmu_flags = mapping_state.mmu_flags;
        if !mmu_flags.contains(flags.required_mmu_flags()) {
            log::trace!("page fault at {addr} with {flags} denied by {mmu_flags}");
            return Err(Error::AccessDenied);
        }

        let page = addr.align_down(PAGE_SIZE);
        let delta = page.offset_from_unsigned(mapping.range.start) as u64;
        let offset = mapping_state.object_offset + delta;
        if offset >= mapping_state.object.size() {
            return Err(Error::NotFound);
        }

        let phys = mapping_state
            .object
            .commit_page(offset, flags.cause_is_write())?;

        log::trace!("page fault at {addr} ({flags}) resolved to {page} -> {phys}");
        self.mmu.map(
            page,
            phys,
            NonZeroUsize::new(PAGE_SIZE).expect("page size is non-zero"),
            mmu_flags,
        )
    }
}
