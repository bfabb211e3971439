// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::num::NonZeroUsize;
use core::ops::{Bound, ControlFlow};

use rand_chacha::ChaCha20Rng;
use smallvec::SmallVec;
use wasmtime_slab::Slab;

use super::{AddressSpaceConfig, AddressSpaceKind};
use crate::address_range::AddressRangeExt;
use crate::node::{LifeCycleState, Node, NodeRef, RegionState};
use crate::{Error, Handle, Mmu, PAGE_SIZE, Randomizer, VirtualAddress, Visitor, VmarFlags};

/// The lock-protected state of an address space.
///
/// Every method here runs with the address space lock held, which is what makes the node arena,
/// the randomizer and the mmu safe to touch.
#[derive(Debug)]
pub(crate) struct Inner<M> {
    pub(super) nodes: Slab<Node>,
    live_nodes: usize,
    max_nodes: usize,
    next_generation: u64,
    pub(super) rand: Randomizer,
    pub(super) mmu: M,
    /// The single executable mapping of the system image, if one was created.
    pub(super) system_image: Option<NodeRef>,
}

impl<M: Mmu> Inner<M> {
    pub(super) fn new(
        mmu: M,
        config: AddressSpaceConfig,
        rng: Option<ChaCha20Rng>,
    ) -> crate::Result<(Self, NodeRef)> {
        let range = config.range;
        if range.is_empty()
            || !range.start.is_aligned_to(PAGE_SIZE)
            || !range.end.is_aligned_to(PAGE_SIZE)
            || config.max_nodes == 0
        {
            return Err(Error::InvalidArgument);
        }

        // an address space can't usefully hold anything without all permissions
        let mut flags = config.root_flags | VmarFlags::CAN_MAP_RWX;
        if config.kind == AddressSpaceKind::Kernel {
            flags |= VmarFlags::CAN_MAP_SPECIFIC;
        }

        let mut this = Self {
            nodes: Slab::new(),
            live_nodes: 0,
            max_nodes: config.max_nodes,
            next_generation: 0,
            rand: Randomizer::new(rng),
            mmu,
            system_image: None,
        };

        let generation = this.bump_generation();
        let root = this.alloc_node(Node::new_region(generation, range, flags, "root", None))?;
        // roots are born alive
        this.get_mut(root).state = LifeCycleState::Alive;

        log::trace!("created {:?} address space root {root:?} with flags {flags}", config.kind);
        Ok((this, root))
    }

    pub(super) fn is_aslr_enabled(&self) -> bool {
        self.rand.is_enabled()
    }

    pub(super) fn mmu(&self) -> &M {
        &self.mmu
    }

    pub(super) fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Resolves `node`, failing if the handle is stale.
    pub(super) fn node(&self, node: NodeRef) -> crate::Result<&Node> {
        match self.nodes.get(node.id) {
            Some(n) if n.generation == node.generation => Ok(n),
            _ => Err(Error::BadState),
        }
    }

    pub(super) fn alive(&self, node: NodeRef) -> crate::Result<&Node> {
        let n = self.node(node)?;
        if n.is_alive() { Ok(n) } else { Err(Error::BadState) }
    }

    pub(super) fn alive_region(&self, node: NodeRef) -> crate::Result<(&Node, &RegionState)> {
        let n = self.alive(node)?;
        let region = n.as_region().ok_or(Error::BadState)?;
        Ok((n, region))
    }

    /// Returns a node known to be allocated, like a child of a live region.
    pub(super) fn get(&self, node: NodeRef) -> &Node {
        let n = &self.nodes[node.id];
        debug_assert_eq!(n.generation, node.generation, "stale internal reference {node:?}");
        n
    }

    pub(super) fn get_mut(&mut self, node: NodeRef) -> &mut Node {
        let n = &mut self.nodes[node.id];
        debug_assert_eq!(n.generation, node.generation, "stale internal reference {node:?}");
        n
    }

    /// Places a not-yet-ready node into the arena.
    pub(super) fn alloc_node(&mut self, node: Node) -> crate::Result<NodeRef> {
        debug_assert_eq!(node.state, LifeCycleState::NotReady);

        if self.live_nodes >= self.max_nodes {
            log::warn!("address space node limit of {} reached", self.max_nodes);
            return Err(Error::NoMemory);
        }

        let generation = node.generation;
        let id = self.nodes.alloc(node);
        self.live_nodes += 1;

        Ok(NodeRef { id, generation })
    }

    /// Discards a node that was never activated.
    pub(super) fn free_unactivated(&mut self, node: NodeRef) {
        debug_assert_eq!(self.get(node).state, LifeCycleState::NotReady);

        let _ = self.nodes.dealloc(node.id);
        self.live_nodes -= 1;
    }

    /// Links a fully initialized node into its parent, making it visible to lookups.
    pub(super) fn activate(&mut self, node: NodeRef) {
        let n = self.get_mut(node);
        debug_assert_eq!(n.state, LifeCycleState::NotReady);
        n.state = LifeCycleState::Alive;

        let base = n.range.start;
        let parent = n.parent.expect("only child nodes are activated");

        let region = self
            .get_mut(parent)
            .as_region_mut()
            .expect("parent of a node must be a region");
        let prev = region.children.insert(base, node);
        assert!(prev.is_none(), "activated node overlaps sibling at {base}");
    }

    /// Moves a live child to a new base address in its parent's child set.
    pub(super) fn rekey(&mut self, node: NodeRef, old_base: VirtualAddress) {
        let n = self.get(node);
        let new_base = n.range.start;
        let parent = n.parent.expect("only child nodes are rekeyed");

        let region = self
            .get_mut(parent)
            .as_region_mut()
            .expect("parent of a node must be a region");
        let removed = region.children.remove(&old_base);
        debug_assert_eq!(removed, Some(node));
        region.children.insert(new_base, node);
    }

    pub(super) fn destroy(&mut self, node: NodeRef) -> crate::Result<()> {
        self.alive(node)?;

        if self.system_image == Some(node) {
            return Err(Error::AccessDenied);
        }

        self.destroy_node(node);
        Ok(())
    }

    /// Recursively destroys `node` and all of its children.
    pub(super) fn destroy_node(&mut self, node: NodeRef) {
        let children: SmallVec<[NodeRef; 8]> = self
            .get(node)
            .as_region()
            .map(|region| region.children.values().copied().collect())
            .unwrap_or_default();

        for child in children {
            self.destroy_node(child);
        }

        let n = &self.nodes[node.id];
        debug_assert!(n.as_region().is_none_or(|region| region.children.is_empty()));

        if n.as_mapping().is_some()
            && let Some(len) = NonZeroUsize::new(n.range.len())
        {
            self.mmu.unmap(n.range.start, len);
        }

        log::trace!("destroying {} '{}' {}..{}", n.kind(), n.name, n.range.start, n.range.end);

        let base = n.range.start;
        if let Some(parent) = n.parent {
            let removed = self
                .get_mut(parent)
                .as_region_mut()
                .and_then(|region| region.children.remove(&base));
            debug_assert_eq!(removed, Some(node));
        }

        if self.system_image == Some(node) {
            self.system_image = None;
        }

        self.get_mut(node).state = LifeCycleState::Dead;
        let _ = self.nodes.dealloc(node.id);
        self.live_nodes -= 1;
    }

    /// Finds the direct child of a live region that contains `addr`.
    pub(super) fn child_containing(
        region: &RegionState,
        nodes: &Slab<Node>,
        addr: VirtualAddress,
    ) -> Option<NodeRef> {
        let (_, child) = region.children.range(..=addr).next_back()?;
        nodes[child.id].range.contains(&addr).then_some(*child)
    }

    pub(super) fn find_region(
        &self,
        region: NodeRef,
        addr: VirtualAddress,
    ) -> crate::Result<(NodeRef, Handle)> {
        let (_, state) = self.alive_region(region)?;
        let child = Self::child_containing(state, &self.nodes, addr).ok_or(Error::NotFound)?;
        Ok((child, self.get(child).handle(child)))
    }

    /// Returns `true` if `base..base + size` overlaps none of the region's children.
    pub(super) fn is_range_available(
        &self,
        region: &RegionState,
        base: VirtualAddress,
        size: usize,
    ) -> bool {
        debug_assert!(size > 0);

        if let Some((_, prev)) = region.children.range(..=base).next_back() {
            // children never reach past the address width, so their end is representable
            if self.get(*prev).range.end > base {
                return false;
            }
        }

        if let Some((next_base, _)) = region
            .children
            .range((Bound::Excluded(base), Bound::Unbounded))
            .next()
        {
            let Some(last_byte) = base.checked_add(size - 1) else {
                return false;
            };
            if *next_base <= last_byte {
                return false;
            }
        }

        true
    }

    pub(super) fn allocated_pages(&self, node: NodeRef) -> usize {
        let Ok(n) = self.alive(node) else {
            return 0;
        };

        match n.as_region() {
            None => n.range.len() / PAGE_SIZE,
            Some(region) => region
                .children
                .values()
                .map(|child| self.allocated_pages(*child))
                .sum(),
        }
    }

    pub(super) fn enumerate_children(
        &self,
        region: NodeRef,
        visitor: &mut impl Visitor,
        depth: usize,
    ) -> ControlFlow<()> {
        let Some(state) = self.get(region).as_region() else {
            return ControlFlow::Continue(());
        };

        for child in state.children.values() {
            let n = self.get(*child);
            debug_assert!(n.is_alive());

            match n.handle(*child) {
                Handle::Mapping(handle) => visitor.visit_mapping(handle, &n.info(), depth)?,
                Handle::Region(handle) => {
                    visitor.visit_region(handle, &n.info(), depth)?;
                    self.enumerate_children(*child, visitor, depth + 1)?;
                }
            }
        }

        ControlFlow::Continue(())
    }
}
