// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use crate::VirtualAddress;

/// Lazily produces the free ranges between the children of a region.
///
/// Every reported gap starts at an address aligned to `align`: the region's base and each child's
/// end are rounded up before a gap is measured. Gap ends are left as they are, so a gap may be
/// shorter than `align`. Rounding past the end of the address width ends the enumeration.
///
/// The enumerator only holds the current position and the child iterator, so cloning it is the way
/// to walk the same gaps twice.
#[derive(Debug, Clone)]
pub struct Gaps<I> {
    children: I,
    /// End of the previous child rounded up to `align`, `None` once exhausted.
    prev_end: Option<VirtualAddress>,
    end: VirtualAddress,
    align: usize,
}

impl<I> Gaps<I>
where
    I: Iterator<Item = Range<VirtualAddress>>,
{
    /// Enumerates the gaps of `region` left by `children`, which must be sorted by address,
    /// non-overlapping and contained in `region`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn new(region: Range<VirtualAddress>, children: I, align: usize) -> Self {
        assert!(align.is_power_of_two(), "gap alignment must be a power of two");

        Self {
            children,
            prev_end: region.start.checked_align_up(align),
            end: region.end,
            align,
        }
    }
}

impl<I> Iterator for Gaps<I>
where
    I: Iterator<Item = Range<VirtualAddress>>,
{
    type Item = Range<VirtualAddress>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let prev_end = self.prev_end?;

            let Some(child) = self.children.next() else {
                // the trailing gap, or the whole region if it has no children
                self.prev_end = None;
                return (self.end > prev_end).then_some(prev_end..self.end);
            };

            self.prev_end = child.end.checked_align_up(self.align);

            if child.start > prev_end {
                return Some(prev_end..child.start);
            }
        }
    }
}
