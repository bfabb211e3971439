#![allow(unused, reason = "not used by all tests")]

use std::ops::{ControlFlow, Range};
use std::sync::Arc;

use kvmar::test_utils::{TestAddressSpace, TestVmo};
use kvmar::{
    MappingHandle, MmuFlags, NodeInfo, NodeKind, RegionHandle, VirtualAddress, Visitor, VmarFlags,
};

pub const PAGE: usize = kvmar::PAGE_SIZE;

pub fn va(raw: usize) -> VirtualAddress {
    VirtualAddress::new(raw)
}

/// Maps a fresh object of `size` bytes at `offset` into `region`.
pub fn map_at(
    aspace: &TestAddressSpace,
    region: RegionHandle,
    offset: usize,
    size: usize,
    mmu_flags: MmuFlags,
) -> MappingHandle {
    aspace
        .create_mapping(
            region,
            offset,
            size,
            0,
            VmarFlags::SPECIFIC,
            Arc::new(TestVmo::new(size)),
            0,
            mmu_flags,
            "test",
        )
        .unwrap()
}

/// Collects `(depth, kind, range)` for every node below `region`.
#[derive(Default)]
pub struct Collect(pub Vec<(usize, NodeKind, Range<usize>)>);

impl Visitor for Collect {
    fn visit_region(&mut self, _: RegionHandle, info: &NodeInfo, depth: usize) -> ControlFlow<()> {
        self.0.push((depth, info.kind, raw(&info.range)));
        ControlFlow::Continue(())
    }

    fn visit_mapping(&mut self, _: MappingHandle, info: &NodeInfo, depth: usize) -> ControlFlow<()> {
        self.0.push((depth, info.kind, raw(&info.range)));
        ControlFlow::Continue(())
    }
}

pub fn tree(aspace: &TestAddressSpace, region: RegionHandle) -> Vec<(usize, NodeKind, Range<usize>)> {
    let mut collect = Collect::default();
    let flow = aspace.enumerate_children(region, &mut collect).unwrap();
    assert_eq!(flow, ControlFlow::Continue(()));
    collect.0
}

/// Ranges of the direct children of `region`.
pub fn children(aspace: &TestAddressSpace, region: RegionHandle) -> Vec<Range<usize>> {
    tree(aspace, region)
        .into_iter()
        .filter(|(depth, _, _)| *depth == 0)
        .map(|(_, _, range)| range)
        .collect()
}

pub fn raw(range: &Range<VirtualAddress>) -> Range<usize> {
    range.start.get()..range.end.get()
}
