// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-memory [`Mmu`] and [`VmObject`] implementations for tests.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::num::NonZeroUsize;
use core::ops::Range;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::{
    AddressSpace, AddressSpaceConfig, AddressSpaceKind, CachePolicy, Error, Mmu, MmuFlags,
    PAGE_SIZE, PhysicalAddress, VirtualAddress, VmObject,
};

pub type TestAddressSpace = AddressSpace<TestMmu, parking_lot::RawMutex>;

/// Fixed seed so randomized placements are reproducible across test runs.
pub const ASLR_SEED: [u8; 32] = [
    232, 66, 52, 206, 40, 195, 141, 166, 130, 237, 114, 177, 190, 54, 88, 88, 30, 196, 41, 165, 54,
    85, 157, 181, 124, 91, 106, 9, 179, 48, 75, 245,
];

/// Creates a test address space spanning `range`, with ASLR enabled iff `aslr` is set.
///
/// # Panics
///
/// Panics if `range` is not a valid address space range.
pub fn address_space(kind: AddressSpaceKind, range: Range<usize>, aslr: bool) -> TestAddressSpace {
    let config = AddressSpaceConfig::new(
        kind,
        VirtualAddress::new(range.start)..VirtualAddress::new(range.end),
    );
    let rng = aslr.then(|| ChaCha20Rng::from_seed(ASLR_SEED));

    AddressSpace::new(TestMmu::new(), config, rng).expect("invalid test address space")
}

/// Records translations in a map instead of page tables.
#[derive(Debug, Default)]
pub struct TestMmu {
    pages: BTreeMap<VirtualAddress, (PhysicalAddress, MmuFlags)>,
    /// Bytes kept free between neighbouring mappings with different mmu flags.
    guard: usize,
    fail_map: bool,
}

impl TestMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps `guard` bytes free between a new node and any neighbouring mapping whose mmu flags
    /// differ from its own.
    #[must_use]
    pub fn with_guard(mut self, guard: usize) -> Self {
        self.guard = guard;
        self
    }

    /// Makes every call to [`Mmu::map`] fail with [`Error::NoMemory`].
    #[must_use]
    pub fn with_failing_map(mut self) -> Self {
        self.fail_map = true;
        self
    }

    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, MmuFlags)> {
        let page = virt.align_down(PAGE_SIZE);
        self.pages.get(&page).copied()
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }
}

fn pages(virt: VirtualAddress, len: NonZeroUsize) -> impl Iterator<Item = VirtualAddress> {
    debug_assert!(virt.is_aligned_to(PAGE_SIZE) && len.get() % PAGE_SIZE == 0);
    (0..len.get() / PAGE_SIZE).map(move |page| virt.add(page * PAGE_SIZE))
}

impl Mmu for TestMmu {
    fn pick_spot(
        &self,
        gap_base: VirtualAddress,
        prev_flags: Option<MmuFlags>,
        gap_last_byte: VirtualAddress,
        next_flags: Option<MmuFlags>,
        align: usize,
        size: usize,
        flags: Option<MmuFlags>,
    ) -> Option<VirtualAddress> {
        let needs_guard = |neighbour: Option<MmuFlags>| {
            self.guard > 0 && neighbour.is_some() && neighbour != flags
        };

        let mut base = gap_base;
        if needs_guard(prev_flags) {
            base = base.checked_add(self.guard)?;
        }
        let spot = base.checked_align_up(align)?;

        if needs_guard(next_flags) {
            let last = spot.checked_add(size - 1)?.checked_add(self.guard)?;
            if last > gap_last_byte {
                return None;
            }
        }

        Some(spot)
    }

    fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: NonZeroUsize,
        flags: MmuFlags,
    ) -> crate::Result<()> {
        if self.fail_map {
            return Err(Error::NoMemory);
        }

        for (i, page) in pages(virt, len).enumerate() {
            self.pages.insert(page, (phys.add(i * PAGE_SIZE), flags));
        }
        Ok(())
    }

    fn unmap(&mut self, virt: VirtualAddress, len: NonZeroUsize) {
        for page in pages(virt, len) {
            self.pages.remove(&page);
        }
    }

    fn protect(
        &mut self,
        virt: VirtualAddress,
        len: NonZeroUsize,
        flags: MmuFlags,
    ) -> crate::Result<()> {
        for page in pages(virt, len) {
            if let Some((_, page_flags)) = self.pages.get_mut(&page) {
                *page_flags = flags;
            }
        }
        Ok(())
    }
}

/// A memory object that hands out fake, linearly laid out physical pages.
#[derive(Debug)]
pub struct TestVmo {
    size: u64,
    phys_base: PhysicalAddress,
    cache_policy: Option<CachePolicy>,
    code_range: Option<Range<u64>>,
    /// Offset of every committed page and whether it was committed for writing.
    committed: Mutex<BTreeMap<u64, bool>>,
}

impl TestVmo {
    pub fn new(size: usize) -> Self {
        Self {
            size: size as u64,
            phys_base: PhysicalAddress::new(0x8000_0000),
            cache_policy: None,
            code_range: None,
            committed: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Turns this object into a system image whose code lives at `code_range`.
    #[must_use]
    pub fn with_system_image_code(mut self, code_range: Range<u64>) -> Self {
        self.code_range = Some(code_range);
        self
    }

    /// The physical address backing the page at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` does not fit the address width.
    pub fn phys_at(&self, offset: u64) -> PhysicalAddress {
        self.phys_base
            .add(usize::try_from(offset).expect("offset exceeds the address width"))
    }

    pub fn committed_pages(&self) -> Vec<(u64, bool)> {
        self.committed
            .lock()
            .iter()
            .map(|(offset, write)| (*offset, *write))
            .collect()
    }
}

impl VmObject for TestVmo {
    fn size(&self) -> u64 {
        self.size
    }

    fn mapping_cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    fn commit_page(&self, offset: u64, will_write: bool) -> crate::Result<PhysicalAddress> {
        if offset >= self.size {
            return Err(Error::NotFound);
        }

        let offset = offset - offset % PAGE_SIZE as u64;
        *self.committed.lock().entry(offset).or_default() |= will_write;
        Ok(self.phys_at(offset))
    }

    fn system_image_code_range(&self) -> Option<Range<u64>> {
        self.code_range.clone()
    }
}
