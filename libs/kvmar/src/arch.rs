// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::num::NonZeroUsize;

use crate::{MmuFlags, PhysicalAddress, VirtualAddress};

/// The architecture-specific half of an address space.
///
/// ### Alignment
///
/// All addresses and lengths passed to methods of this trait are multiples of [`PAGE_SIZE`].
///
/// [`PAGE_SIZE`]: crate::PAGE_SIZE
pub trait Mmu {
    /// Picks the start address for a new node of `size` bytes inside the gap
    /// `gap_base..=gap_last_byte`.
    ///
    /// `prev_flags` and `next_flags` are the mmu flags of the neighbouring mappings (`None` for a
    /// neighbouring sub-region or no neighbour at all) and `flags` are the flags of the new node.
    /// Architectures that need guard pages between mappings of differing attributes can move the
    /// spot away from a neighbour here. The caller checks that the returned spot still fits the gap,
    /// so returning `None` or a spot that is too close to the end of the gap simply means "no room
    /// here" and the search moves on. A spot below `gap_base` means the address wrapped around and
    /// ends the search.
    ///
    /// The default implementation returns `gap_base` rounded up to `align`.
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
        let _ = (prev_flags, gap_last_byte, next_flags, size, flags);
        gap_base.checked_align_up(align)
    }

    /// Map `len` bytes at `virt` to the physical range starting at `phys` with the given `flags`.
    ///
    /// # Errors
    ///
    /// Returning `Err` indicates the mapping cannot be established and the virtual address range
    /// remains unaltered.
    fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: NonZeroUsize,
        flags: MmuFlags,
    ) -> crate::Result<()>;

    /// Remove any translation for the `len` bytes at `virt`.
    ///
    /// Ranges that were never mapped (because they were never faulted in) are silently ignored.
    fn unmap(&mut self, virt: VirtualAddress, len: NonZeroUsize);

    /// Change the flags of every translation within the `len` bytes at `virt`.
    ///
    /// # Errors
    ///
    /// Returning `Err` indicates the flags could not be updated. Translations before the failing
    /// page may already carry the new flags.
    fn protect(&mut self, virt: VirtualAddress, len: NonZeroUsize, flags: MmuFlags)
    -> crate::Result<()>;
}
