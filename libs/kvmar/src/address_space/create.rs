// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::ops::Range;

use super::tree::Inner;
use crate::address_range::AddressRangeExt;
use crate::node::{MappingState, Node, NodeRef};
use crate::spot::{ChildView, SpotFinder, SpotRequest};
use crate::{Error, Mmu, MmuFlags, PAGE_SIZE, VirtualAddress, VmObject, VmarFlags};

pub(crate) struct CreateRequest<'a> {
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) align_pow2: u8,
    pub(crate) flags: VmarFlags,
    /// `Some` for mappings, `None` for sub-regions.
    pub(crate) backing: Option<Backing>,
    pub(crate) name: &'a str,
}

pub(crate) struct Backing {
    pub(crate) object: Arc<dyn VmObject>,
    pub(crate) object_offset: u64,
    pub(crate) mmu_flags: MmuFlags,
}

impl<M: Mmu> Inner<M> {
    /// Creates a new child of `parent`. The shared path of sub-region and mapping creation.
    pub(super) fn create(
        &mut self,
        parent: NodeRef,
        mut req: CreateRequest<'_>,
    ) -> crate::Result<NodeRef> {
        let (parent_node, _) = self.alive_region(parent)?;
        let parent_range = parent_node.range.clone();
        let parent_flags = parent_node.flags;

        if req.size == 0 {
            return Err(Error::InvalidArgument);
        }

        // the child may never be granted a permission its parent lacks
        if !parent_flags.contains(req.flags & VmarFlags::CAN_MAP_RWX) {
            return Err(Error::AccessDenied);
        }
        if let Some(backing) = &req.backing
            && !backing.mmu_flags.is_allowed_by(parent_flags)
        {
            return Err(Error::AccessDenied);
        }

        let is_specific = req.flags.is_specific();
        if !is_specific && req.offset != 0 {
            return Err(Error::InvalidArgument);
        }

        if let Some(backing) = &mut req.backing
            && let Some(policy) = backing.object.mapping_cache_policy()
        {
            if backing.mmu_flags.has_cache_policy()
                && backing.mmu_flags.cache_policy() != policy
            {
                log::warn!(
                    "mapping '{}' has conflicting cache policies: object {policy} mmu flags {}",
                    req.name,
                    backing.mmu_flags.cache_policy()
                );
            }
            backing.mmu_flags = backing.mmu_flags.with_cache_policy(policy);
        }

        if is_specific && !parent_flags.contains(VmarFlags::CAN_MAP_SPECIFIC) {
            return Err(Error::AccessDenied);
        }

        let parent_size = parent_range.len();
        if req.offset >= parent_size || req.size > parent_size - req.offset {
            return Err(Error::InvalidArgument);
        }

        let spot_req = SpotRequest::new(
            req.size,
            req.align_pow2,
            req.backing.as_ref().map(|backing| backing.mmu_flags),
        )?;

        if is_specific {
            let base = parent_range.start.add(req.offset);
            if !base.is_aligned_to(PAGE_SIZE) {
                return Err(Error::InvalidArgument);
            }
            if req.align_pow2 > 0 && !base.is_aligned_to(1 << req.align_pow2) {
                return Err(Error::InvalidArgument);
            }

            let (_, region) = self.alive_region(parent)?;
            if !self.is_range_available(region, base, req.size) {
                let overwrite =
                    req.flags.contains(VmarFlags::SPECIFIC_OVERWRITE) && req.backing.is_some();
                return if overwrite {
                    self.overwrite(parent, base, req)
                } else {
                    Err(Error::NoMemory)
                };
            }

            self.build_and_activate(parent, base, req)
        } else {
            let compact = parent_flags.contains(VmarFlags::COMPACT);
            let base = self.alloc_spot(parent, spot_req, compact)?;
            self.build_and_activate(parent, base, req)
        }
    }

    fn alloc_spot(
        &mut self,
        parent: NodeRef,
        req: SpotRequest,
        compact: bool,
    ) -> crate::Result<VirtualAddress> {
        let parent = &self.nodes[parent.id];
        let region = parent
            .as_region()
            .expect("spot allocation parent must be a region");

        let children = ChildView {
            children: &region.children,
            nodes: &self.nodes,
        };

        SpotFinder::new(parent.range.clone(), &children, &self.mmu).find(
            req,
            &mut self.rand,
            compact,
        )
    }

    fn build_and_activate(
        &mut self,
        parent: NodeRef,
        base: VirtualAddress,
        req: CreateRequest<'_>,
    ) -> crate::Result<NodeRef> {
        let (node, is_system_image) = self.build(parent, base, req)?;
        self.activate(node);
        if is_system_image {
            self.system_image = Some(node);
        }
        Ok(node)
    }

    /// Replaces whatever is mapped at `base..base + size` with a new mapping.
    ///
    /// The new node is built before anything is unmapped, so running out of nodes leaves the
    /// existing mappings untouched.
    fn overwrite(
        &mut self,
        parent: NodeRef,
        base: VirtualAddress,
        req: CreateRequest<'_>,
    ) -> crate::Result<NodeRef> {
        debug_assert!(req.flags.contains(VmarFlags::SPECIFIC_OVERWRITE));
        let size = req.size;

        let (node, is_system_image) = self.build(parent, base, req)?;

        if let Err(err) = self.unmap(parent, base, size, false) {
            self.free_unactivated(node);
            return Err(err);
        }

        log::trace!("overwrote {base}..{} in {parent:?}", base.add(size));
        self.activate(node);
        if is_system_image {
            self.system_image = Some(node);
        }
        Ok(node)
    }

    /// Allocates the not-yet-ready node.
    ///
    /// Also returns whether the node is the executable mapping of the system image, which the
    /// caller records once the node is activated.
    fn build(
        &mut self,
        parent: NodeRef,
        base: VirtualAddress,
        req: CreateRequest<'_>,
    ) -> crate::Result<(NodeRef, bool)> {
        let range = Range::<VirtualAddress>::from_start_len(base, req.size);
        let generation = self.bump_generation();

        let Some(backing) = req.backing else {
            let node = self.alloc_node(Node::new_region(
                generation,
                range,
                req.flags,
                req.name,
                Some(parent),
            ))?;
            log::trace!(
                "created region '{}' {base}..{} flags {}",
                req.name,
                base.add(req.size),
                req.flags
            );
            return Ok((node, false));
        };

        let mmu_flags = backing.mmu_flags;
        let is_system_image = if mmu_flags.contains(MmuFlags::EXECUTE)
            && let Some(code_range) = backing.object.system_image_code_range()
        {
            // one executable mapping of the system image per address space, of exactly its code
            let size = u64::try_from(req.size).map_err(|_| Error::InvalidArgument)?;
            let object_range = backing.object_offset..backing.object_offset + size;
            if self.system_image.is_some() || code_range != object_range {
                return Err(Error::AccessDenied);
            }
            true
        } else {
            false
        };

        let node = self.alloc_node(Node::new_mapping(
            generation,
            range,
            req.flags,
            req.name,
            parent,
            MappingState {
                object: backing.object,
                object_offset: backing.object_offset,
                mmu_flags,
            },
        ))?;

        log::trace!(
            "created mapping '{}' {base}..{} flags {} mmu flags {mmu_flags}",
            req.name,
            base.add(req.size),
            req.flags
        );
        Ok((node, is_system_image))
    }
}
