// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Placement of new children inside a region.
//!
//! There are three policies:
//! 1. *Linear*: first fit in address order. Used when ASLR is disabled.
//! 2. *Non-compact randomized*: count every aligned start address in every gap that can hold the
//!    request, draw one index uniformly from that count and walk the gaps again to find it. Large gaps
//!    are proportionally more likely to be picked, so the result is uniform over placements rather
//!    than over gaps. Should the mmu refuse the drawn spot, the next spot above it that the mmu
//!    accepts is used instead.
//! 3. *Compact randomized*: draw one byte. Its low bit picks whether to grow the cluster of existing
//!    children downwards or upwards, the remaining bits plus one are the number of padding pages left
//!    between the new child and its neighbour. If that does not fit, the padding is halved (trying
//!    both directions each time) until it reaches zero.
//!
//! Every candidate is confirmed against its neighbours through [`Mmu::pick_spot`] so architectures
//! can keep differently-attributed mappings apart.

use core::cmp;
use core::ops::{Bound, ControlFlow, Range};

use crate::address_range::AddressRangeExt;
use crate::gaps::Gaps;
use crate::node::{Node, NodeRef};
use crate::{Error, MmuFlags, Mmu, PAGE_SIZE, PAGE_SIZE_SHIFT, Randomizer, VirtualAddress};

/// The address range and mmu flags of one child, as far as placement is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChildSpan {
    pub(crate) range: Range<VirtualAddress>,
    /// `None` for sub-regions.
    pub(crate) mmu_flags: Option<MmuFlags>,
}

/// Read access to the ordered children of the region being searched.
pub(crate) trait Children {
    fn spans(&self) -> impl Iterator<Item = ChildSpan> + Clone + '_;

    fn first(&self) -> Option<ChildSpan>;

    fn last(&self) -> Option<ChildSpan>;

    /// The last child starting at or below `addr` and the first child starting above it.
    fn around(&self, addr: VirtualAddress) -> (Option<ChildSpan>, Option<ChildSpan>);
}

/// The children of a live region, resolved through the node arena.
pub(crate) struct ChildView<'a> {
    pub(crate) children: &'a alloc::collections::BTreeMap<VirtualAddress, NodeRef>,
    pub(crate) nodes: &'a wasmtime_slab::Slab<Node>,
}

impl ChildView<'_> {
    fn span(&self, child: NodeRef) -> ChildSpan {
        let node = self
            .nodes
            .get(child.id)
            .expect("child of a live region must be allocated");

        ChildSpan {
            range: node.range.clone(),
            mmu_flags: node.mmu_flags(),
        }
    }
}

impl Children for ChildView<'_> {
    fn spans(&self) -> impl Iterator<Item = ChildSpan> + Clone + '_ {
        self.children.values().map(|child| self.span(*child))
    }

    fn first(&self) -> Option<ChildSpan> {
        self.children.values().next().map(|child| self.span(*child))
    }

    fn last(&self) -> Option<ChildSpan> {
        self.children.values().next_back().map(|child| self.span(*child))
    }

    fn around(&self, addr: VirtualAddress) -> (Option<ChildSpan>, Option<ChildSpan>) {
        let prev = self
            .children
            .range(..=addr)
            .next_back()
            .map(|(_, child)| self.span(*child));
        let next = self
            .children
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(_, child)| self.span(*child));

        (prev, next)
    }
}

impl Children for [ChildSpan] {
    fn spans(&self) -> impl Iterator<Item = ChildSpan> + Clone + '_ {
        self.iter().cloned()
    }

    fn first(&self) -> Option<ChildSpan> {
        <[ChildSpan]>::first(self).cloned()
    }

    fn last(&self) -> Option<ChildSpan> {
        <[ChildSpan]>::last(self).cloned()
    }

    fn around(&self, addr: VirtualAddress) -> (Option<ChildSpan>, Option<ChildSpan>) {
        let idx = self.partition_point(|child| child.range.start <= addr);
        let prev = idx.checked_sub(1).and_then(|idx| self.get(idx)).cloned();
        (prev, self.get(idx).cloned())
    }
}

/// Size, alignment and flags of the child to be placed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpotRequest {
    pub(crate) size: usize,
    /// Log2 of the alignment, at least [`PAGE_SIZE_SHIFT`].
    pub(crate) align_pow2: u8,
    pub(crate) mmu_flags: Option<MmuFlags>,
}

impl SpotRequest {
    pub(crate) fn new(size: usize, align_pow2: u8, mmu_flags: Option<MmuFlags>) -> crate::Result<Self> {
        debug_assert!(size > 0 && size.is_multiple_of(PAGE_SIZE));

        if u32::from(align_pow2) >= usize::BITS {
            return Err(Error::InvalidArgument);
        }

        Ok(Self {
            size,
            align_pow2: cmp::max(align_pow2, PAGE_SIZE_SHIFT),
            mmu_flags,
        })
    }

    fn align(&self) -> usize {
        1 << self.align_pow2
    }

    /// Number of aligned start addresses in a gap with an aligned base that can hold the request.
    fn spots_in(&self, gap: &Range<VirtualAddress>) -> usize {
        let len = gap.len();
        if len < self.size {
            return 0;
        }
        ((len - self.size) >> self.align_pow2) + 1
    }
}

enum GapCheck {
    Found(VirtualAddress),
    /// Nothing here, keep looking.
    Continue,
    /// Nothing here or anywhere after, stop looking.
    Stop,
}

pub(crate) struct SpotFinder<'a, M: ?Sized, C: ?Sized> {
    region: Range<VirtualAddress>,
    children: &'a C,
    mmu: &'a M,
}

impl<'a, M, C> SpotFinder<'a, M, C>
where
    M: Mmu + ?Sized,
    C: Children + ?Sized,
{
    pub(crate) fn new(region: Range<VirtualAddress>, children: &'a C, mmu: &'a M) -> Self {
        Self {
            region,
            children,
            mmu,
        }
    }

    /// Picks a spot with the policy matching the ASLR and compaction settings.
    pub(crate) fn find(
        &self,
        req: SpotRequest,
        rand: &mut Randomizer,
        compact: bool,
    ) -> crate::Result<VirtualAddress> {
        let spot = if !rand.is_enabled() {
            self.linear(req)
        } else if compact {
            self.compact_randomized(req, rand)
        } else {
            self.non_compact_randomized(req, rand)
        }?;

        log::trace!(
            "picked spot {spot} for size {:#x} align {:#x} in {}..{}",
            req.size,
            req.align(),
            self.region.start,
            self.region.end
        );
        Ok(spot)
    }

    /// Returns the lowest address whose gap can hold the request.
    pub(crate) fn linear(&self, req: SpotRequest) -> crate::Result<VirtualAddress> {
        self.first_fit_from(VirtualAddress::MIN, req)
    }

    /// Returns the lowest address at or above `search_base` that can hold the request.
    fn first_fit_from(
        &self,
        search_base: VirtualAddress,
        req: SpotRequest,
    ) -> crate::Result<VirtualAddress> {
        let mut prev: Option<ChildSpan> = None;

        for next in self.children.spans().map(Some).chain(core::iter::once(None)) {
            match self.check_gap(prev.as_ref(), next.as_ref(), search_base, req) {
                GapCheck::Found(spot) => return Ok(spot),
                GapCheck::Stop => return Err(Error::NoMemory),
                GapCheck::Continue => {}
            }
            prev = next;
        }

        Err(Error::NoMemory)
    }

    pub(crate) fn non_compact_randomized(
        &self,
        req: SpotRequest,
        rand: &mut Randomizer,
    ) -> crate::Result<VirtualAddress> {
        let mut gaps = Gaps::new(
            self.region.clone(),
            self.children.spans().map(|child| child.range),
            req.align(),
        );

        let mut candidate_spots: usize = 0;
        for gap in gaps.clone() {
            debug_assert!(gap.start.is_aligned_to(req.align()));
            candidate_spots = candidate_spots
                .checked_add(req.spots_in(&gap))
                .ok_or(Error::Internal("candidate spot count overflowed"))?;
        }

        if candidate_spots == 0 {
            return Err(Error::NoMemory);
        }

        let mut target_index = rand.next_uniform(candidate_spots).unwrap_or_default();
        debug_assert!(target_index < candidate_spots);

        let res = gaps.try_for_each(|gap| {
            let spots = req.spots_in(&gap);
            if target_index < spots {
                ControlFlow::Break(gap.start.add(target_index << req.align_pow2))
            } else {
                target_index -= spots;
                ControlFlow::Continue(())
            }
        });
        let ControlFlow::Break(chosen) = res else {
            panic!("no gap holds spot #{target_index} of {candidate_spots}, this is a bug!");
        };

        // the chosen spot has to pass the same neighbour check as every other policy
        let last_byte = chosen.add(req.size - 1);
        let (prev, next) = self.children.around(last_byte);
        if let GapCheck::Found(spot) = self.check_gap(prev.as_ref(), next.as_ref(), chosen, req) {
            return Ok(spot);
        }

        // the mmu wants more room around the chosen spot than the raw gaps account for, take the
        // next spot it accepts and wrap around to the bottom of the region if there is none
        log::trace!("mmu rejected random spot {chosen}, searching upwards");
        self.first_fit_from(chosen, req).or_else(|_| self.linear(req))
    }

    pub(crate) fn compact_randomized(
        &self,
        req: SpotRequest,
        rand: &mut Randomizer,
    ) -> crate::Result<VirtualAddress> {
        let (Some(first), Some(last)) = (self.children.first(), self.children.last()) else {
            return self.non_compact_randomized(req, rand);
        };

        let entropy = rand.next_byte().unwrap_or_default();
        let mut alloc_before = entropy & 1 == 1;
        let mut gap_pages = usize::from(entropy >> 1) + 1;

        while gap_pages > 0 {
            for _ in 0..2 {
                let padding = PAGE_SIZE * gap_pages;

                let candidate = if alloc_before {
                    first
                        .range
                        .start
                        .checked_sub(req.size)
                        .and_then(|base| base.checked_sub(padding))
                        .map(|base| (None, Some(&first), base))
                } else {
                    last.range
                        .end
                        .checked_add(padding)
                        .map(|base| (Some(&last), None, base))
                };

                if let Some((prev, next, search_base)) = candidate
                    && let GapCheck::Found(spot) = self.check_gap(prev, next, search_base, req)
                {
                    return Ok(spot);
                }

                alloc_before = !alloc_before;
            }

            gap_pages >>= 1;
        }

        Err(Error::NoMemory)
    }

    /// Checks whether the gap between `prev` and `next`, trimmed to start no lower than
    /// `search_base`, can hold the request.
    fn check_gap(
        &self,
        prev: Option<&ChildSpan>,
        next: Option<&ChildSpan>,
        search_base: VirtualAddress,
        req: SpotRequest,
    ) -> GapCheck {
        let gap_beg = prev.map_or(self.region.start, |prev| prev.range.end);

        // inclusive, so a gap reaching the top of the address width stays representable
        let gap_last_byte = match next {
            Some(next) if next.range.start == gap_beg => return GapCheck::Continue,
            Some(next) => match next.range.start.checked_sub(1) {
                Some(last) => last,
                None => return GapCheck::Stop,
            },
            None if gap_beg == self.region.end => return GapCheck::Stop,
            None => self.region.end.sub(1),
        };
        debug_assert!(gap_last_byte >= gap_beg);

        if gap_last_byte <= search_base {
            return GapCheck::Continue;
        }
        let gap_beg = cmp::max(gap_beg, search_base);

        let Some(spot) = self.mmu.pick_spot(
            gap_beg,
            prev.and_then(|prev| prev.mmu_flags),
            gap_last_byte,
            next.and_then(|next| next.mmu_flags),
            req.align(),
            req.size,
            req.mmu_flags,
        ) else {
            return GapCheck::Continue;
        };

        // wrapped around the address width
        if spot < gap_beg {
            return GapCheck::Stop;
        }

        if spot < gap_last_byte && gap_last_byte.offset_from_unsigned(spot) >= req.size - 1 {
            GapCheck::Found(spot)
        } else {
            GapCheck::Continue
        }
    }
}
