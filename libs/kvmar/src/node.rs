// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ops::{ControlFlow, Range};

use crate::address_range::AddressRangeExt;
use crate::{MAX_NAME_LEN, MmuFlags, VirtualAddress, VmObject, VmarFlags};

/// Arena slot of a node plus the generation it was allocated with.
///
/// Slots are reused after a node is destroyed, the generation is not. A `NodeRef` whose generation
/// does not match the node currently stored in its slot is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeRef {
    pub(crate) id: wasmtime_slab::Id,
    pub(crate) generation: u64,
}

/// Handle to an address region, a node that can contain children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(pub(crate) NodeRef);

/// Handle to a mapping, a leaf node backed by a [`VmObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingHandle(pub(crate) NodeRef);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Region(RegionHandle),
    Mapping(MappingHandle),
}

impl Handle {
    pub fn as_region(self) -> Option<RegionHandle> {
        match self {
            Handle::Region(handle) => Some(handle),
            Handle::Mapping(_) => None,
        }
    }

    pub fn as_mapping(self) -> Option<MappingHandle> {
        match self {
            Handle::Region(_) => None,
            Handle::Mapping(handle) => Some(handle),
        }
    }

    pub fn kind(self) -> NodeKind {
        match self {
            Handle::Region(_) => NodeKind::Region,
            Handle::Mapping(_) => NodeKind::Mapping,
        }
    }

    pub(crate) fn node_ref(self) -> NodeRef {
        match self {
            Handle::Region(RegionHandle(r)) | Handle::Mapping(MappingHandle(r)) => r,
        }
    }
}

impl From<RegionHandle> for Handle {
    fn from(handle: RegionHandle) -> Self {
        Handle::Region(handle)
    }
}

impl From<MappingHandle> for Handle {
    fn from(handle: MappingHandle) -> Self {
        Handle::Mapping(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifeCycleState {
    /// Allocated but not yet linked into its parent.
    NotReady,
    /// Linked into the tree and participating in lookups.
    Alive,
    /// Destroyed. Terminal.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Region,
    Mapping,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Region => f.write_str("region"),
            NodeKind::Mapping => f.write_str("mapping"),
        }
    }
}

/// A snapshot of a node's public attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub range: Range<VirtualAddress>,
    pub flags: VmarFlags,
    pub name: String,
    pub kind: NodeKind,
    /// Current mmu flags, `None` for regions.
    pub mmu_flags: Option<MmuFlags>,
    /// Offset into the backing object, `None` for regions.
    pub object_offset: Option<u64>,
}

impl NodeInfo {
    pub fn base(&self) -> VirtualAddress {
        self.range.start
    }

    pub fn size(&self) -> usize {
        self.range.len()
    }
}

/// Callbacks for [`AddressSpace::enumerate_children`][crate::AddressSpace::enumerate_children].
///
/// Nodes are visited depth-first in address order. `depth` is zero for direct children of the
/// region the walk started at. Returning [`ControlFlow::Break`] stops the walk.
pub trait Visitor {
    fn visit_region(&mut self, handle: RegionHandle, info: &NodeInfo, depth: usize) -> ControlFlow<()> {
        let _ = (handle, info, depth);
        ControlFlow::Continue(())
    }

    fn visit_mapping(&mut self, handle: MappingHandle, info: &NodeInfo, depth: usize) -> ControlFlow<()> {
        let _ = (handle, info, depth);
        ControlFlow::Continue(())
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) generation: u64,
    pub(crate) range: Range<VirtualAddress>,
    pub(crate) flags: VmarFlags,
    pub(crate) name: String,
    pub(crate) state: LifeCycleState,
    /// Back-reference to the owning region, `None` for the root. Never an ownership edge.
    pub(crate) parent: Option<NodeRef>,
    pub(crate) payload: Payload,
}

#[derive(Debug)]
pub(crate) enum Payload {
    Region(RegionState),
    Mapping(MappingState),
}

#[derive(Debug, Default)]
pub(crate) struct RegionState {
    /// Direct children keyed by their base address. Ranges never overlap and are contained in the
    /// region's own range.
    pub(crate) children: BTreeMap<VirtualAddress, NodeRef>,
}

#[derive(Debug, Clone)]
pub(crate) struct MappingState {
    pub(crate) object: Arc<dyn VmObject>,
    pub(crate) object_offset: u64,
    pub(crate) mmu_flags: MmuFlags,
}

impl Node {
    pub(crate) fn new_region(
        generation: u64,
        range: Range<VirtualAddress>,
        flags: VmarFlags,
        name: &str,
        parent: Option<NodeRef>,
    ) -> Self {
        Self {
            generation,
            range,
            flags,
            name: truncate_name(name),
            state: LifeCycleState::NotReady,
            parent,
            payload: Payload::Region(RegionState::default()),
        }
    }

    pub(crate) fn new_mapping(
        generation: u64,
        range: Range<VirtualAddress>,
        flags: VmarFlags,
        name: &str,
        parent: NodeRef,
        mapping: MappingState,
    ) -> Self {
        Self {
            generation,
            range,
            flags,
            name: truncate_name(name),
            state: LifeCycleState::NotReady,
            parent: Some(parent),
            payload: Payload::Mapping(mapping),
        }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self.payload {
            Payload::Region(_) => NodeKind::Region,
            Payload::Mapping(_) => NodeKind::Mapping,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state == LifeCycleState::Alive
    }

    pub(crate) fn as_region(&self) -> Option<&RegionState> {
        match &self.payload {
            Payload::Region(region) => Some(region),
            Payload::Mapping(_) => None,
        }
    }

    pub(crate) fn as_region_mut(&mut self) -> Option<&mut RegionState> {
        match &mut self.payload {
            Payload::Region(region) => Some(region),
            Payload::Mapping(_) => None,
        }
    }

    pub(crate) fn as_mapping(&self) -> Option<&MappingState> {
        match &self.payload {
            Payload::Region(_) => None,
            Payload::Mapping(mapping) => Some(mapping),
        }
    }

    pub(crate) fn as_mapping_mut(&mut self) -> Option<&mut MappingState> {
        match &mut self.payload {
            Payload::Region(_) => None,
            Payload::Mapping(mapping) => Some(mapping),
        }
    }

    pub(crate) fn mmu_flags(&self) -> Option<MmuFlags> {
        self.as_mapping().map(|mapping| mapping.mmu_flags)
    }

    pub(crate) fn handle(&self, this: NodeRef) -> Handle {
        match self.payload {
            Payload::Region(_) => Handle::Region(RegionHandle(this)),
            Payload::Mapping(_) => Handle::Mapping(MappingHandle(this)),
        }
    }

    pub(crate) fn info(&self) -> NodeInfo {
        NodeInfo {
            range: self.range.clone(),
            flags: self.flags,
            name: self.name.clone(),
            kind: self.kind(),
            mmu_flags: self.mmu_flags(),
            object_offset: self.as_mapping().map(|mapping| mapping.object_offset),
        }
    }
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}
