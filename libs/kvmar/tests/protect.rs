mod common;

use std::sync::Arc;

use kvmar::test_utils::{TestAddressSpace, TestVmo, address_space};
use kvmar::{
    AddressSpaceKind, CachePolicy, Error, Handle, MmuFlags, PageFaultFlags, RegionHandle,
    VmarFlags,
};

use crate::common::{PAGE, children, map_at, va};

const BASE: usize = 0x4000_0000;
const SIZE: usize = 0x10_0000;
const RW: MmuFlags = MmuFlags::READ.union(MmuFlags::WRITE);

fn setup() -> (TestAddressSpace, RegionHandle) {
    let aspace = address_space(AddressSpaceKind::Kernel, BASE..BASE + SIZE, false);
    let root = aspace.root();
    (aspace, root)
}

fn mmu_flags_at(aspace: &TestAddressSpace, region: RegionHandle, addr: usize) -> MmuFlags {
    let Handle::Mapping(mapping) = aspace.find_region(region, va(addr)).unwrap() else {
        panic!("no mapping at {addr:#x}");
    };
    aspace.info(mapping).unwrap().mmu_flags.unwrap()
}

#[test_log::test]
fn protect_whole_mapping() {
    let (aspace, root) = setup();
    let mapping = map_at(&aspace, root, 0, 2 * PAGE, RW);
    aspace.page_fault(va(BASE), PageFaultFlags::STORE).unwrap();

    aspace.protect(root, va(BASE), 2 * PAGE, MmuFlags::READ).unwrap();

    assert_eq!(children(&aspace, root), vec![BASE..BASE + 2 * PAGE]);
    assert_eq!(aspace.info(mapping).unwrap().mmu_flags, Some(MmuFlags::READ));
    // existing translations follow
    let (_, flags) = aspace.with_mmu(|mmu| mmu.translate(va(BASE))).unwrap();
    assert_eq!(flags, MmuFlags::READ);
    // and so do later faults
    assert_eq!(
        aspace.page_fault(va(BASE + PAGE), PageFaultFlags::STORE).unwrap_err(),
        Error::AccessDenied
    );
}

#[test_log::test]
fn protect_middle_splits() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, 4 * PAGE, RW);

    aspace.protect(root, va(BASE + PAGE), 2 * PAGE, MmuFlags::READ).unwrap();

    assert_eq!(
        children(&aspace, root),
        vec![
            BASE..BASE + PAGE,
            BASE + PAGE..BASE + 3 * PAGE,
            BASE + 3 * PAGE..BASE + 4 * PAGE,
        ]
    );
    assert_eq!(mmu_flags_at(&aspace, root, BASE), RW);
    assert_eq!(mmu_flags_at(&aspace, root, BASE + PAGE), MmuFlags::READ);
    assert_eq!(mmu_flags_at(&aspace, root, BASE + 3 * PAGE), RW);
    assert_eq!(aspace.allocated_page_count(root), 4);
}

#[test_log::test]
fn protect_across_adjacent_mappings() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, 2 * PAGE, RW);
    map_at(&aspace, root, 2 * PAGE, 2 * PAGE, RW);

    aspace.protect(root, va(BASE + PAGE), 2 * PAGE, MmuFlags::READ).unwrap();

    assert_eq!(children(&aspace, root).len(), 4);
    assert_eq!(mmu_flags_at(&aspace, root, BASE + PAGE), MmuFlags::READ);
    assert_eq!(mmu_flags_at(&aspace, root, BASE + 2 * PAGE), MmuFlags::READ);
    assert_eq!(mmu_flags_at(&aspace, root, BASE + 3 * PAGE), RW);
}

#[test_log::test]
fn unchanged_permissions_do_not_split() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, 4 * PAGE, RW);

    aspace.protect(root, va(BASE + PAGE), PAGE, RW).unwrap();

    assert_eq!(children(&aspace, root), vec![BASE..BASE + 4 * PAGE]);
}

#[test_log::test]
fn cache_policy_and_user_bit_are_kept() {
    let (aspace, root) = setup();
    let vmo = Arc::new(TestVmo::new(PAGE).with_cache_policy(CachePolicy::WriteCombining));
    let mapping = aspace
        .create_mapping(
            root,
            0,
            PAGE,
            0,
            VmarFlags::empty(),
            vmo,
            0,
            RW | MmuFlags::USER,
            "wc",
        )
        .unwrap();

    aspace.protect(root, va(BASE), PAGE, MmuFlags::READ).unwrap();

    let flags = aspace.info(mapping).unwrap().mmu_flags.unwrap();
    assert_eq!(flags.cache_policy(), CachePolicy::WriteCombining);
    assert!(flags.contains(MmuFlags::USER | MmuFlags::READ));
    assert!(!flags.contains(MmuFlags::WRITE));
}

#[test_log::test]
fn holes_are_not_found() {
    let (aspace, root) = setup();

    // nothing mapped at all
    assert_eq!(
        aspace.protect(root, va(BASE), PAGE, MmuFlags::READ).unwrap_err(),
        Error::NotFound
    );

    map_at(&aspace, root, PAGE, PAGE, RW);
    map_at(&aspace, root, 3 * PAGE, PAGE, RW);

    // starts in a gap
    assert_eq!(
        aspace.protect(root, va(BASE), 2 * PAGE, MmuFlags::READ).unwrap_err(),
        Error::NotFound
    );
    // hole in the middle
    assert_eq!(
        aspace.protect(root, va(BASE + PAGE), 3 * PAGE, MmuFlags::READ).unwrap_err(),
        Error::NotFound
    );
    // reaches past the last mapping
    assert_eq!(
        aspace.protect(root, va(BASE + 3 * PAGE), 2 * PAGE, MmuFlags::READ).unwrap_err(),
        Error::NotFound
    );

    // validation happens before anything changes
    assert_eq!(mmu_flags_at(&aspace, root, BASE + PAGE), RW);
    assert_eq!(children(&aspace, root).len(), 2);
}

#[test_log::test]
fn sub_regions_are_rejected() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, PAGE, RW);
    aspace
        .create_sub_region(root, PAGE, PAGE, 0, VmarFlags::SPECIFIC, "region")
        .unwrap();

    assert_eq!(
        aspace.protect(root, va(BASE), 2 * PAGE, MmuFlags::READ).unwrap_err(),
        Error::InvalidArgument
    );
}

#[test_log::test]
fn permissions_are_bounded_by_the_mapping() {
    let (aspace, root) = setup();
    // a read-only mapping only carries CAN_MAP_READ
    map_at(&aspace, root, 0, PAGE, MmuFlags::READ);

    assert_eq!(
        aspace.protect(root, va(BASE), PAGE, RW).unwrap_err(),
        Error::AccessDenied
    );

    // mappings created with more permissions can drop and regain them
    map_at(&aspace, root, PAGE, PAGE, RW);
    aspace.protect(root, va(BASE + PAGE), PAGE, MmuFlags::READ).unwrap();
    aspace.protect(root, va(BASE + PAGE), PAGE, RW).unwrap();
    assert_eq!(mmu_flags_at(&aspace, root, BASE + PAGE), RW);
}

#[test_log::test]
fn protect_argument_checks() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, PAGE, RW);

    assert_eq!(
        aspace.protect(root, va(BASE), 0, MmuFlags::READ).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        aspace.protect(root, va(BASE + 0x10), PAGE, MmuFlags::READ).unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        aspace.protect(root, va(BASE + SIZE - PAGE), 2 * PAGE, MmuFlags::READ).unwrap_err(),
        Error::InvalidArgument
    );
}
