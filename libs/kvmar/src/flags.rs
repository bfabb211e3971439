// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

bitflags::bitflags! {
    /// Flags attached to every node of the region tree.
    ///
    /// The `CAN_MAP_*` flags describe what a node's descendants may ever be granted, the remaining
    /// flags describe how the node itself was placed and how it places its children.
    #[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct VmarFlags: u32 {
        /// Descendants may be mapped readable
        const CAN_MAP_READ = 1 << 0;
        /// Descendants may be mapped writable
        const CAN_MAP_WRITE = 1 << 1;
        /// Descendants may be mapped executable
        const CAN_MAP_EXECUTE = 1 << 2;
        /// Children may request a specific placement
        const CAN_MAP_SPECIFIC = 1 << 3;
        /// Place the new node at the requested offset
        const SPECIFIC = 1 << 4;
        /// Place the new mapping at the requested offset, unmapping whatever is there
        const SPECIFIC_OVERWRITE = 1 << 5;
        /// Cluster children together using the compact randomized policy
        const COMPACT = 1 << 6;

        const CAN_MAP_RWX = Self::CAN_MAP_READ.bits() | Self::CAN_MAP_WRITE.bits() | Self::CAN_MAP_EXECUTE.bits();
    }
}

impl fmt::Display for VmarFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

impl VmarFlags {
    /// Flags a caller may pass when creating a sub-region.
    pub const SUB_REGION_ALLOWED: Self = Self::SPECIFIC
        .union(Self::CAN_MAP_SPECIFIC)
        .union(Self::COMPACT)
        .union(Self::CAN_MAP_RWX);

    /// Flags a caller may pass when creating a mapping.
    pub const MAPPING_ALLOWED: Self = Self::SPECIFIC
        .union(Self::SPECIFIC_OVERWRITE)
        .union(Self::CAN_MAP_RWX);

    pub fn is_specific(self) -> bool {
        self.intersects(Self::SPECIFIC | Self::SPECIFIC_OVERWRITE)
    }
}

bitflags::bitflags! {
    /// Architecture-level flags of a mapping.
    ///
    /// The low two bits hold the [`CachePolicy`], the remaining bits are the access permissions.
    #[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct MmuFlags: u8 {
        const CACHE_MASK = 0b11;
        /// Allow userspace to access the mapping
        const USER = 1 << 2;
        /// Allow reads from the mapping
        const READ = 1 << 3;
        /// Allow writes to the mapping
        const WRITE = 1 << 4;
        /// Allow code execution from the mapping
        const EXECUTE = 1 << 5;

        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl fmt::Display for MmuFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

impl MmuFlags {
    pub fn cache_policy(self) -> CachePolicy {
        CachePolicy::from_bits(self.bits() & Self::CACHE_MASK.bits())
    }

    /// Returns `self` with its cache policy bits replaced by `policy`.
    #[must_use]
    pub fn with_cache_policy(self, policy: CachePolicy) -> Self {
        self.difference(Self::CACHE_MASK) | Self::from_bits_retain(policy as u8)
    }

    /// Returns `true` if any cache policy bit is set.
    ///
    /// [`CachePolicy::Cached`] is encoded as all zeroes, so flags asking for cached memory cannot be
    /// told apart from flags that do not ask for a policy at all and this returns `false` for both.
    pub fn has_cache_policy(self) -> bool {
        self.intersects(Self::CACHE_MASK)
    }

    /// The `CAN_MAP_*` flags a node must carry to allow these permissions.
    pub fn required_vmar_flags(self) -> VmarFlags {
        let mut out = VmarFlags::empty();
        if self.contains(MmuFlags::READ) {
            out |= VmarFlags::CAN_MAP_READ;
        }
        if self.contains(MmuFlags::WRITE) {
            out |= VmarFlags::CAN_MAP_WRITE;
        }
        if self.contains(MmuFlags::EXECUTE) {
            out |= VmarFlags::CAN_MAP_EXECUTE;
        }
        out
    }

    /// Returns `true` if a node carrying `vmar_flags` may grant these permissions.
    pub fn is_allowed_by(self, vmar_flags: VmarFlags) -> bool {
        vmar_flags.contains(self.required_vmar_flags())
    }
}

#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum CachePolicy {
    #[default]
    Cached = 0,
    Uncached = 1,
    UncachedDevice = 2,
    WriteCombining = 3,
}

impl CachePolicy {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Cached,
            1 => Self::Uncached,
            2 => Self::UncachedDevice,
            _ => Self::WriteCombining,
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::Cached => f.write_str("cached"),
            CachePolicy::Uncached => f.write_str("uncached"),
            CachePolicy::UncachedDevice => f.write_str("uncached-device"),
            CachePolicy::WriteCombining => f.write_str("write-combining"),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct PageFaultFlags: u8 {
        /// The fault was caused by a memory load
        const LOAD = 1 << 0;
        /// The fault was caused by a memory store
        const STORE = 1 << 1;
        /// The fault was caused by an instruction fetch
        const INSTRUCTION = 1 << 3;
        /// The fault was raised by code running in user mode
        const USER = 1 << 4;
    }
}

impl fmt::Display for PageFaultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

impl PageFaultFlags {
    pub fn is_valid(self) -> bool {
        !self.contains(PageFaultFlags::LOAD | PageFaultFlags::STORE)
    }

    pub fn cause_is_write(self) -> bool {
        self.contains(PageFaultFlags::STORE)
    }

    /// The mapping permissions needed to satisfy this access.
    pub fn required_mmu_flags(self) -> MmuFlags {
        let mut out = MmuFlags::empty();
        if self.contains(PageFaultFlags::STORE) {
            out |= MmuFlags::WRITE;
        } else {
            out |= MmuFlags::READ;
        }
        if self.contains(PageFaultFlags::INSTRUCTION) {
            out |= MmuFlags::EXECUTE;
        }
        if self.contains(PageFaultFlags::USER) {
            out |= MmuFlags::USER;
        }
        out
    }
}
