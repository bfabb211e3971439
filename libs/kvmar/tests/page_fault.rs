mod common;

use std::sync::Arc;

use kvmar::test_utils::{TestAddressSpace, TestMmu, TestVmo, address_space};
use kvmar::{
    AddressSpaceConfig, AddressSpaceKind, Error, MmuFlags, PageFaultFlags, RegionHandle,
    VmarFlags,
};

use crate::common::{PAGE, map_at, va};

const BASE: usize = 0x4000_0000;
const SIZE: usize = 0x10_0000;

fn setup() -> (TestAddressSpace, RegionHandle) {
    let aspace = address_space(AddressSpaceKind::Kernel, BASE..BASE + SIZE, false);
    let root = aspace.root();
    (aspace, root)
}

fn map_object(
    aspace: &TestAddressSpace,
    region: RegionHandle,
    offset: usize,
    size: usize,
    vmo: &Arc<TestVmo>,
    object_offset: u64,
    mmu_flags: MmuFlags,
) {
    aspace
        .create_mapping(
            region,
            offset,
            size,
            0,
            VmarFlags::SPECIFIC,
            vmo.clone(),
            object_offset,
            mmu_flags,
            "object",
        )
        .unwrap();
}

#[test_log::test]
fn fault_commits_and_maps_the_page() {
    let (aspace, root) = setup();
    let vmo = Arc::new(TestVmo::new(4 * PAGE));
    map_object(&aspace, root, 0, 4 * PAGE, &vmo, 0, MmuFlags::READ | MmuFlags::WRITE);

    aspace.page_fault(va(BASE + 2 * PAGE + 0x123), PageFaultFlags::LOAD).unwrap();
    aspace.page_fault(va(BASE + 3 * PAGE), PageFaultFlags::STORE).unwrap();

    assert_eq!(
        vmo.committed_pages(),
        vec![(2 * PAGE as u64, false), (3 * PAGE as u64, true)]
    );

    let (phys, flags) = aspace.with_mmu(|mmu| mmu.translate(va(BASE + 2 * PAGE))).unwrap();
    assert_eq!(phys, vmo.phys_at(2 * PAGE as u64));
    assert_eq!(flags, MmuFlags::READ | MmuFlags::WRITE);
    assert_eq!(aspace.with_mmu(|mmu| mmu.mapped_pages()), 2);
}

#[test_log::test]
fn fault_honours_the_object_offset() {
    let (aspace, root) = setup();
    let vmo = Arc::new(TestVmo::new(8 * PAGE));
    map_object(&aspace, root, 0, 2 * PAGE, &vmo, 4 * PAGE as u64, MmuFlags::READ);

    aspace.page_fault(va(BASE + PAGE), PageFaultFlags::LOAD).unwrap();

    assert_eq!(vmo.committed_pages(), vec![(5 * PAGE as u64, false)]);
    let (phys, _) = aspace.with_mmu(|mmu| mmu.translate(va(BASE + PAGE))).unwrap();
    assert_eq!(phys, vmo.phys_at(5 * PAGE as u64));
}

#[test_log::test]
fn fault_descends_into_sub_regions() {
    let (aspace, root) = setup();
    let outer = aspace
        .create_sub_region(
            root,
            0x10000,
            0x10000,
            0,
            VmarFlags::SPECIFIC | VmarFlags::CAN_MAP_SPECIFIC | VmarFlags::CAN_MAP_RWX,
            "outer",
        )
        .unwrap();
    let inner = aspace
        .create_sub_region(
            outer,
            0x4000,
            0x4000,
            0,
            VmarFlags::SPECIFIC | VmarFlags::CAN_MAP_SPECIFIC | VmarFlags::CAN_MAP_RWX,
            "inner",
        )
        .unwrap();
    map_at(&aspace, inner, PAGE, PAGE, MmuFlags::READ);

    let addr = va(BASE + 0x15000);
    aspace.page_fault(addr, PageFaultFlags::LOAD).unwrap();
    aspace.page_fault_in(outer, addr, PageFaultFlags::LOAD).unwrap();
    assert!(aspace.with_mmu(|mmu| mmu.translate(addr)).is_some());

    // the inner region itself is not a mapping
    assert_eq!(
        aspace.page_fault(va(BASE + 0x14000), PageFaultFlags::LOAD).unwrap_err(),
        Error::NotFound
    );
}

#[test_log::test]
fn fault_outside_any_mapping() {
    let (aspace, root) = setup();
    map_at(&aspace, root, PAGE, PAGE, MmuFlags::READ);

    assert_eq!(
        aspace.page_fault(va(BASE), PageFaultFlags::LOAD).unwrap_err(),
        Error::NotFound
    );
    assert_eq!(
        aspace.page_fault(va(BASE + 2 * PAGE), PageFaultFlags::LOAD).unwrap_err(),
        Error::NotFound
    );
    // outside of the address space entirely
    assert_eq!(
        aspace.page_fault(va(0x1000), PageFaultFlags::LOAD).unwrap_err(),
        Error::NotFound
    );
}

#[test_log::test]
fn fault_past_the_end_of_the_object() {
    let (aspace, root) = setup();
    let vmo = Arc::new(TestVmo::new(PAGE));
    map_object(&aspace, root, 0, 3 * PAGE, &vmo, 0, MmuFlags::READ);

    aspace.page_fault(va(BASE), PageFaultFlags::LOAD).unwrap();
    assert_eq!(
        aspace.page_fault(va(BASE + 2 * PAGE), PageFaultFlags::LOAD).unwrap_err(),
        Error::NotFound
    );
}

#[test_log::test]
fn fault_permission_checks() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, PAGE, MmuFlags::READ);
    map_at(&aspace, root, PAGE, PAGE, MmuFlags::READ | MmuFlags::EXECUTE);

    assert_eq!(
        aspace.page_fault(va(BASE), PageFaultFlags::STORE).unwrap_err(),
        Error::AccessDenied
    );
    assert_eq!(
        aspace.page_fault(va(BASE), PageFaultFlags::INSTRUCTION).unwrap_err(),
        Error::AccessDenied
    );
    // kernel-only mapping touched from user mode
    assert_eq!(
        aspace
            .page_fault(va(BASE), PageFaultFlags::LOAD | PageFaultFlags::USER)
            .unwrap_err(),
        Error::AccessDenied
    );

    aspace.page_fault(va(BASE + PAGE), PageFaultFlags::INSTRUCTION).unwrap();
    assert_eq!(aspace.with_mmu(|mmu| mmu.mapped_pages()), 1);
}

#[test_log::test]
fn contradictory_fault_flags() {
    let (aspace, root) = setup();
    map_at(&aspace, root, 0, PAGE, MmuFlags::READ | MmuFlags::WRITE);

    assert_eq!(
        aspace
            .page_fault(va(BASE), PageFaultFlags::LOAD | PageFaultFlags::STORE)
            .unwrap_err(),
        Error::InvalidArgument
    );
}

#[test_log::test]
fn mmu_errors_propagate() {
    let config = AddressSpaceConfig::new(AddressSpaceKind::Kernel, va(BASE)..va(BASE + SIZE));
    let aspace =
        TestAddressSpace::new(TestMmu::new().with_failing_map(), config, None).unwrap();
    map_at(&aspace, aspace.root(), 0, PAGE, MmuFlags::READ);

    assert_eq!(
        aspace.page_fault(va(BASE), PageFaultFlags::LOAD).unwrap_err(),
        Error::NoMemory
    );
}

#[test_log::test]
fn fault_in_dead_region() {
    let (aspace, root) = setup();
    let region = aspace
        .create_sub_region(root, 0, 0x10000, 0, VmarFlags::CAN_MAP_RWX, "region")
        .unwrap();
    aspace.destroy(region).unwrap();

    assert_eq!(
        aspace.page_fault_in(region, va(BASE), PageFaultFlags::LOAD).unwrap_err(),
        Error::BadState
    );
}
