// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod create;
mod dump;
mod fault;
mod range_ops;
mod tree;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ops::{ControlFlow, Range};

use lock_api::{Mutex, RawMutex};
use rand_chacha::ChaCha20Rng;
use tree::Inner;

use crate::{
    Error, Handle, MappingHandle, Mmu, MmuFlags, NodeInfo, PageFaultFlags, RegionHandle,
    VirtualAddress, Visitor, VmObject, VmarFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceKind {
    User,
    Kernel,
}

/// Construction parameters of an [`AddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpaceConfig {
    pub kind: AddressSpaceKind,
    /// The range spanned by the root region. Both ends must be page aligned.
    pub range: Range<VirtualAddress>,
    /// Extra flags for the root region. The root always gets `CAN_MAP_RWX`, a kernel root also gets
    /// `CAN_MAP_SPECIFIC`.
    pub root_flags: VmarFlags,
    /// Upper bound on the number of live nodes, including the root.
    pub max_nodes: usize,
}

impl AddressSpaceConfig {
    pub const DEFAULT_MAX_NODES: usize = 1 << 16;

    pub fn new(kind: AddressSpaceKind, range: Range<VirtualAddress>) -> Self {
        Self {
            kind,
            range,
            root_flags: VmarFlags::empty(),
            max_nodes: Self::DEFAULT_MAX_NODES,
        }
    }

    #[must_use]
    pub fn with_root_flags(mut self, flags: VmarFlags) -> Self {
        self.root_flags = flags;
        self
    }

    #[must_use]
    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }
}

/// A tree of virtual memory regions and mappings rooted at a single region spanning the whole
/// address space.
///
/// Every operation takes the address space's lock for its entire duration, so operations on one
/// address space are linearizable. Different address spaces share nothing and never contend.
pub struct AddressSpace<M, R: RawMutex> {
    inner: Mutex<R, Inner<M>>,
    root: RegionHandle,
    kind: AddressSpaceKind,
}

impl<M: fmt::Debug, R: RawMutex> fmt::Debug for AddressSpace<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("inner", &self.inner)
            .field("root", &self.root)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<M: Mmu, R: RawMutex> AddressSpace<M, R> {
    /// Creates a new address space and its root region.
    ///
    /// Address space layout randomization is enabled iff `rng` is `Some`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the configured range is empty or not page aligned, or
    /// if `max_nodes` is zero.
    pub fn new(mmu: M, config: AddressSpaceConfig, rng: Option<ChaCha20Rng>) -> crate::Result<Self> {
        let kind = config.kind;
        let (inner, root) = Inner::new(mmu, config, rng)?;

        Ok(Self {
            inner: Mutex::new(inner),
            root: RegionHandle(root),
            kind,
        })
    }

    /// The root region. Stays valid until the root is destroyed.
    pub fn root(&self) -> RegionHandle {
        self.root
    }

    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    pub fn is_aslr_enabled(&self) -> bool {
        self.inner.lock().is_aslr_enabled()
    }

    /// Runs `f` with shared access to the mmu while holding the address space lock.
    pub fn with_mmu<T>(&self, f: impl FnOnce(&M) -> T) -> T {
        f(self.inner.lock().mmu())
    }

    /// Creates a new sub-region of `parent`.
    ///
    /// If `flags` contains [`VmarFlags::SPECIFIC`] the region is placed at `offset` bytes into the
    /// parent, otherwise a spot is picked according to the parent's placement policy and `offset`
    /// must be zero. `align_pow2` is the log2 of the requested alignment and is raised to at least
    /// the page size.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `parent` is not alive.
    /// - [`Error::InvalidArgument`] if `size` is zero or not page aligned, `flags` contains flags
    ///   other than `SPECIFIC`, `CAN_MAP_SPECIFIC`, `COMPACT` and `CAN_MAP_*`, or the placement
    ///   falls outside the parent.
    /// - [`Error::AccessDenied`] if `flags` grant permissions the parent does not have, or a
    ///   specific placement is requested from a parent without `CAN_MAP_SPECIFIC`.
    /// - [`Error::NoMemory`] if the requested range is occupied or no spot fits.
    pub fn create_sub_region(
        &self,
        parent: RegionHandle,
        offset: usize,
        size: usize,
        align_pow2: u8,
        flags: VmarFlags,
        name: &str,
    ) -> crate::Result<RegionHandle> {
        if !size.is_multiple_of(crate::PAGE_SIZE) {
            return Err(Error::InvalidArgument);
        }
        if !VmarFlags::SUB_REGION_ALLOWED.contains(flags) {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        let node = inner.create(
            parent.0,
            create::CreateRequest {
                offset,
                size,
                align_pow2,
                flags,
                backing: None,
                name,
            },
        )?;
        Ok(RegionHandle(node))
    }

    /// Creates a new mapping of `object` in `parent`.
    ///
    /// `size` is rounded up to the page size. Every permission present in `mmu_flags` is added to
    /// the mapping's `CAN_MAP_*` flags so later [`protect`][Self::protect] calls may keep it. If the
    /// object dictates a cache policy, that policy replaces the one in `mmu_flags`. A conflicting
    /// policy in `mmu_flags` is logged, except for [`CachePolicy::Cached`][crate::CachePolicy::Cached]
    /// which reads the same as no policy and is replaced silently.
    ///
    /// With [`VmarFlags::SPECIFIC_OVERWRITE`] anything already mapped in the target range is
    /// unmapped first. Sub-regions in the target range are never destroyed this way.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `parent` is not alive.
    /// - [`Error::InvalidArgument`] if the size is zero after rounding, `object_offset` is not page
    ///   aligned or `object_offset + size` overflows, `flags` contains flags other than `SPECIFIC`,
    ///   `SPECIFIC_OVERWRITE` and `CAN_MAP_*`, the placement falls outside the parent, or an
    ///   overwrite would touch a sub-region.
    /// - [`Error::AccessDenied`] if `flags` or `mmu_flags` grant permissions the parent does not have,
    ///   a specific placement is requested from a parent without `CAN_MAP_SPECIFIC`, or the mapping
    ///   is an invalid or second executable mapping of the system image.
    /// - [`Error::NoMemory`] if the requested range is occupied (and not overwritten) or no spot fits.
    pub fn create_mapping(
        &self,
        parent: RegionHandle,
        offset: usize,
        size: usize,
        align_pow2: u8,
        flags: VmarFlags,
        object: Arc<dyn VmObject>,
        object_offset: u64,
        mmu_flags: MmuFlags,
        name: &str,
    ) -> crate::Result<MappingHandle> {
        if !VmarFlags::MAPPING_ALLOWED.contains(flags) {
            return Err(Error::InvalidArgument);
        }

        // an overflowing size rounds to zero and is rejected along with every other empty request
        let size = size.checked_next_multiple_of(crate::PAGE_SIZE).unwrap_or(0);

        let size_u64 = u64::try_from(size).map_err(|_| Error::InvalidArgument)?;
        if !object_offset.is_multiple_of(crate::PAGE_SIZE as u64)
            || object_offset.checked_add(size_u64).is_none()
        {
            return Err(Error::InvalidArgument);
        }

        let flags = flags | mmu_flags.required_vmar_flags();

        let mut inner = self.inner.lock();
        let node = inner.create(
            parent.0,
            create::CreateRequest {
                offset,
                size,
                align_pow2,
                flags,
                backing: Some(create::Backing {
                    object,
                    object_offset,
                    mmu_flags,
                }),
                name,
            },
        )?;
        Ok(MappingHandle(node))
    }

    /// Removes every mapping in `base..base + size` from `region`, narrowing mappings that are only
    /// partially covered. `size` is rounded up to the page size.
    ///
    /// Sub-regions are destroyed only when they lie completely inside the range.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `region` is not alive.
    /// - [`Error::InvalidArgument`] if `base` is not page aligned, the range is empty or outside
    ///   `region`, or a sub-region is only partially covered. Nothing is unmapped in that case.
    /// - [`Error::AccessDenied`] if the range overlaps the system image mapping.
    /// - [`Error::NoMemory`] if punching a hole into a mapping needs a node and none is available.
    pub fn unmap(&self, region: RegionHandle, base: VirtualAddress, size: usize) -> crate::Result<()> {
        let size = size.checked_next_multiple_of(crate::PAGE_SIZE).unwrap_or(0);
        if size == 0 || !base.is_aligned_to(crate::PAGE_SIZE) {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        inner.unmap(region.0, base, size, true)
    }

    /// Changes the permissions of every mapping in `base..base + size` to those of `mmu_flags`,
    /// splitting mappings that are only partially covered. `size` is rounded up to the page size.
    /// The cache policy and user bit of each mapping are kept.
    ///
    /// The whole range is validated before anything changes. Once validation passed, mappings are
    /// updated one after another and a failure part way through is returned without rolling back
    /// the mappings that were already changed.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `region` is not alive.
    /// - [`Error::InvalidArgument`] if `base` is not page aligned, the range is empty or outside
    ///   `region`, or a sub-region lies in the range.
    /// - [`Error::NotFound`] if any part of the range is not mapped.
    /// - [`Error::AccessDenied`] if a mapping in the range may not be granted the new permissions or
    ///   is the system image mapping.
    pub fn protect(
        &self,
        region: RegionHandle,
        base: VirtualAddress,
        size: usize,
        mmu_flags: MmuFlags,
    ) -> crate::Result<()> {
        let size = size.checked_next_multiple_of(crate::PAGE_SIZE).unwrap_or(0);
        if size == 0 || !base.is_aligned_to(crate::PAGE_SIZE) {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        inner.protect(region.0, base, size, mmu_flags)
    }

    /// Destroys a region and everything below it, or a single mapping.
    ///
    /// Destroying a node twice fails the second time. Destroying the root leaves an empty, unusable
    /// address space.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if the node is not alive.
    /// - [`Error::AccessDenied`] if the node is the system image mapping. It goes away together with
    ///   its enclosing region.
    pub fn destroy(&self, handle: impl Into<Handle>) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        inner.destroy(handle.into().node_ref())
    }

    /// Returns the direct child of `region` containing `addr`.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `region` is not alive.
    /// - [`Error::NotFound`] if no child contains `addr`.
    pub fn find_region(&self, region: RegionHandle, addr: VirtualAddress) -> crate::Result<Handle> {
        let inner = self.inner.lock();
        inner.find_region(region.0, addr).map(|(_, handle)| handle)
    }

    /// Resolves a page fault at `addr` starting at the root region.
    ///
    /// # Errors
    ///
    /// See [`page_fault_in`][Self::page_fault_in].
    pub fn page_fault(&self, addr: VirtualAddress, flags: PageFaultFlags) -> crate::Result<()> {
        self.page_fault_in(self.root, addr, flags)
    }

    /// Resolves a page fault at `addr` by descending from `region` to the mapping containing it.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `region` is not alive.
    /// - [`Error::InvalidArgument`] if `flags` are contradictory.
    /// - [`Error::NotFound`] if no mapping contains `addr`, or `addr` lies beyond the end of the
    ///   mapped object.
    /// - [`Error::AccessDenied`] if the mapping does not permit the access.
    /// - Any error of [`VmObject::commit_page`] or [`Mmu::map`].
    pub fn page_fault_in(
        &self,
        region: RegionHandle,
        addr: VirtualAddress,
        flags: PageFaultFlags,
    ) -> crate::Result<()> {
        if !flags.is_valid() {
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        inner.page_fault(region.0, addr, flags)
    }

    /// The number of pages covered by mappings at or below `handle`. Zero for nodes that are not
    /// alive.
    pub fn allocated_page_count(&self, handle: impl Into<Handle>) -> usize {
        let inner = self.inner.lock();
        inner.allocated_pages(handle.into().node_ref())
    }

    /// Returns `true` if `base..base + size` does not overlap any direct child of `region`.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if `region` is not alive.
    /// - [`Error::InvalidArgument`] if `size` is zero.
    pub fn is_range_available(
        &self,
        region: RegionHandle,
        base: VirtualAddress,
        size: usize,
    ) -> crate::Result<bool> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let inner = self.inner.lock();
        let (_, region) = inner.alive_region(region.0)?;
        Ok(inner.is_range_available(region, base, size))
    }

    /// Returns a snapshot of the node's attributes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadState`] if the node is not alive.
    pub fn info(&self, handle: impl Into<Handle>) -> crate::Result<NodeInfo> {
        let inner = self.inner.lock();
        Ok(inner.alive(handle.into().node_ref())?.info())
    }

    /// Visits every live node below `region` depth-first in address order.
    ///
    /// Returns [`ControlFlow::Break`] if the visitor stopped the walk early.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadState`] if `region` is not alive.
    pub fn enumerate_children(
        &self,
        region: RegionHandle,
        visitor: &mut impl Visitor,
    ) -> crate::Result<ControlFlow<()>> {
        let inner = self.inner.lock();
        inner.alive_region(region.0)?;
        Ok(inner.enumerate_children(region.0, visitor, 0))
    }

    /// Renders the subtree at `handle` into `out`, one line per node, indented by `depth` levels.
    ///
    /// # Errors
    ///
    /// - [`Error::BadState`] if the node is not alive.
    /// - [`Error::Internal`] if writing to `out` fails.
    pub fn dump_to(
        &self,
        handle: impl Into<Handle>,
        depth: usize,
        out: &mut impl fmt::Write,
    ) -> crate::Result<()> {
        let inner = self.inner.lock();
        inner.dump(handle.into().node_ref(), depth, out)
    }

    /// Logs the subtree at `handle`, one line per node.
    pub fn dump(&self, handle: impl Into<Handle>, depth: usize) {
        let mut out = String::new();
        match self.dump_to(handle, depth, &mut out) {
            Ok(()) => {
                for line in out.lines() {
                    log::info!("{line}");
                }
            }
            Err(err) => log::warn!("cannot dump address space: {err}"),
        }
    }
}
