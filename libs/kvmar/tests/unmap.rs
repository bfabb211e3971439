mod common;

use kvmar::test_utils::{TestAddressSpace, address_space};
use kvmar::{AddressSpaceKind, Error, Handle, MmuFlags, PageFaultFlags, RegionHandle, VmarFlags};

use crate::common::{PAGE, children, map_at, va};

const BASE: usize = 0x4000_0000;
const SIZE: usize = 0x10_0000;

fn setup() -> (TestAddressSpace, RegionHandle) {
    let aspace = address_space(AddressSpaceKind::Kernel, BASE..BASE + SIZE, false);
    let root = aspace.root();
    (aspace, root)
}

fn fault_in(aspace: &TestAddressSpace, range: std::ops::Range<usize>) {
    for addr in range.step_by(PAGE) {
        aspace.page_fault(va(addr), PageFaultFlags::LOAD).unwrap();
    }
}

fn object_offset(aspace: &TestAddressSpace, region: RegionHandle, addr: usize) -> u64 {
    let Handle::Mapping(mapping) = aspace.find_region(region, va(addr)).unwrap() else {
        panic!("no mapping at {addr:#x}");
    };
    aspace.info(mapping).unwrap().object_offset.unwrap()
}

#[test_log::test]
fn unmap_whole_mapping() {
    let (aspace, root) = setup();
    let mapping = map_at(&aspace, root, 0, 4 * PAGE, MmuFlags::READ);
    fault_in(&aspace, BASE..BASE + 4 * PAGE);

    aspace.unmap(root, va(BASE), 4 * PAGE).unwrap();

    assert!(children(&aspace, root).is_empty());
    assert_eq!(aspace.info(mapping).unwrap_err(), Error::BadState);
    assert_eq!(aspace.with_mmu(|mmu| mmu.mapped_pages()), 0);
}

#[test_log::test]
fn unmap_head() {
    let (aspace, root) = setup();
    let mapping = map_at(&aspace, root, 0, 4 * PAGE, MmuFlags::READ);
    fault_in(&aspace, BASE..BASE + 4 * PAGE);

    aspace.unmap(root, va(BASE), PAGE).unwrap();

    let info = aspace.info(mapping).unwrap();
    assert_eq!(info.range, va(BASE + PAGE)..va(BASE + 4 * PAGE));
    assert_eq!(info.object_offset, Some(PAGE as u64));
    assert_eq!(aspace.with_mmu(|mmu| mmu.mapped_pages()), 3);
    // the mapping is found under its new base
    assert_eq!(
        aspace.find_region(root, va(BASE + PAGE)).unwrap(),
        Handle::Mapping(mapping)
    );
}

#[test_log::test]
fn unmap_tail() {
    let (aspace, root) = setup();
    let mapping = map_at(&aspace, root, 0, 4 * PAGE, MmuFlags::READ);
    fault_in(&aspace, BASE..BASE + 4 * PAGE);

    aspace.unmap(root, va(BASE + 3 * PAGE), PAGE).unwrap();

    let info = aspace.info(mapping).unwrap();
    assert_eq!(info.range, va(BASE)..va(BASE + 3 * PAGE));
    assert_eq!(info.object_offset, Some(0));
    assert!(aspace.with_mmu(|mmu| mmu.translate(va(BASE + 3 * PAGE))).is_none());
    assert!(aspace.with_mmu(|mmu| mmu.translate(va(BASE + 2 * PAGE))).is_some());
}

#[test_log::test]
fn unmap_middle_splits() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, 4 * PAGE, MmuFlags::READ);
    fault_in(&aspace, BASE..BASE + 4 * PAGE);

    aspace.unmap(root, va(BASE + PAGE), 2 * PAGE).unwrap();

    assert_eq!(
        children(&aspace, root),
        vec![BASE..BASE + PAGE, BASE + 3 * PAGE..BASE + 4 * PAGE]
    );
    assert_eq!(object_offset(&aspace, root, BASE), 0);
    assert_eq!(object_offset(&aspace, root, BASE + 3 * PAGE), 3 * PAGE as u64);
    assert_eq!(aspace.with_mmu(|mmu| mmu.mapped_pages()), 2);
    assert_eq!(aspace.allocated_page_count(root), 2);
}

#[test_log::test]
fn unmap_across_several_mappings() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, 2 * PAGE, MmuFlags::READ);
    let middle = map_at(&aspace, root, 2 * PAGE, PAGE, MmuFlags::READ);
    map_at(&aspace, root, 4 * PAGE, 2 * PAGE, MmuFlags::READ);

    aspace.unmap(root, va(BASE + PAGE), 4 * PAGE).unwrap();

    assert_eq!(
        children(&aspace, root),
        vec![BASE..BASE + PAGE, BASE + 5 * PAGE..BASE + 6 * PAGE]
    );
    assert_eq!(aspace.info(middle).unwrap_err(), Error::BadState);
}

#[test_log::test]
fn unmap_rounds_size_up() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, 2 * PAGE, MmuFlags::READ);

    aspace.unmap(root, va(BASE), 1).unwrap();

    assert_eq!(children(&aspace, root), vec![BASE + PAGE..BASE + 2 * PAGE]);
}

#[test_log::test]
fn unmap_sub_regions() {
    let (aspace, root) = setup();
    let region = aspace
        .create_sub_region(
            root,
            2 * PAGE,
            2 * PAGE,
            0,
            VmarFlags::SPECIFIC | VmarFlags::CAN_MAP_SPECIFIC | VmarFlags::CAN_MAP_READ,
            "region",
        )
        .unwrap();
    let inner = map_at(&aspace, region, 0, PAGE, MmuFlags::READ);
    map_at(&aspace, root, 0, 2 * PAGE, MmuFlags::READ);

    // partially covered sub-regions are an error and nothing is unmapped
    assert_eq!(
        aspace.unmap(root, va(BASE), 3 * PAGE).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        children(&aspace, root),
        vec![BASE..BASE + 2 * PAGE, BASE + 2 * PAGE..BASE + 4 * PAGE]
    );

    // completely covered ones are destroyed with everything in them
    aspace.unmap(root, va(BASE + PAGE), 3 * PAGE).unwrap();
    assert_eq!(children(&aspace, root), vec![BASE..BASE + PAGE]);
    assert_eq!(aspace.info(region).unwrap_err(), Error::BadState);
    assert_eq!(aspace.info(inner).unwrap_err(), Error::BadState);
}

#[test_log::test]
fn unmap_inside_sub_region() {
    let (aspace, root) = setup();
    let region = aspace
        .create_sub_region(
            root,
            0,
            4 * PAGE,
            0,
            VmarFlags::SPECIFIC | VmarFlags::CAN_MAP_SPECIFIC | VmarFlags::CAN_MAP_READ,
            "region",
        )
        .unwrap();
    map_at(&aspace, region, 0, 4 * PAGE, MmuFlags::READ);

    // a range only partially inside the region is rejected
    assert_eq!(
        aspace.unmap(region, va(BASE + 2 * PAGE), 4 * PAGE).unwrap_err(),
        Error::InvalidArgument
    );

    aspace.unmap(region, va(BASE + 2 * PAGE), 2 * PAGE).unwrap();
    assert_eq!(children(&aspace, region), vec![BASE..BASE + 2 * PAGE]);
}

#[test_log::test]
fn unmap_argument_checks() {
    let (aspace, root) = setup();

    // nothing mapped is fine
    aspace.unmap(root, va(BASE), PAGE).unwrap();

    assert_eq!(aspace.unmap(root, va(BASE), 0).unwrap_err(), Error::InvalidArgument);
    assert_eq!(
        aspace.unmap(root, va(BASE + 0x10), PAGE).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        aspace.unmap(root, va(BASE - PAGE), 2 * PAGE).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        aspace.unmap(root, va(BASE + SIZE), PAGE).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        aspace.unmap(root, va(usize::MAX - 0xfff), 2 * PAGE).unwrap_err(),
        Error::InvalidArgument
    );

    let region = aspace
        .create_sub_region(root, 0, PAGE, 0, VmarFlags::empty(), "dead")
        .unwrap();
    aspace.destroy(region).unwrap();
    assert_eq!(aspace.unmap(region, va(BASE), PAGE).unwrap_err(), Error::BadState);
}
