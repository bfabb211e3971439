// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Virtual memory address regions (VMARs).
//!
//! An [`AddressSpace`] tracks how a flat virtual address range is carved up into a tree of nested
//! *regions* and leaf *mappings*. Regions are pure bookkeeping: they reserve a range of addresses
//! and hand out sub-ranges to their children. Mappings are backed by a [`VmObject`] and are the only
//! nodes that ever reach the MMU.
//!
//! When a caller does not ask for a specific address, the address space picks one using one of three
//! placement policies:
//! - *Linear* first-fit, used when ASLR is disabled.
//! - *Non-compact randomized*, which picks uniformly among every valid placement in the region.
//! - *Compact randomized*, which grows a cluster of children outwards with small random padding.
//!
//! All structural operations of one address space are serialized by a single lock. Handles returned
//! by this crate are plain `Copy` values; a handle to a destroyed node stays invalid forever, even if
//! the underlying arena slot is reused.

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

extern crate alloc;

mod address;
mod address_range;
mod address_space;
mod arch;
mod aslr;
mod error;
mod flags;
mod gaps;
mod node;
mod spot;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod vmo;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_range::AddressRangeExt;
pub use address_space::{AddressSpace, AddressSpaceConfig, AddressSpaceKind};
pub use arch::Mmu;
pub use aslr::Randomizer;
pub use error::Error;
pub use flags::{CachePolicy, MmuFlags, PageFaultFlags, VmarFlags};
pub use gaps::Gaps;
pub use node::{Handle, MappingHandle, NodeInfo, NodeKind, RegionHandle, Visitor};
pub use vmo::VmObject;

pub type Result<T> = core::result::Result<T, Error>;

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;

/// The smallest unit of virtual memory this crate hands out.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_SHIFT: u8 = 12;

/// Longest diagnostic name stored for a node, in bytes.
pub const MAX_NAME_LEN: usize = 32;

const _: () = assert!(1 << PAGE_SIZE_SHIFT == PAGE_SIZE);
