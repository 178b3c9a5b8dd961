mod common;

use std::ptr::NonNull;

use common::{shape, Region};
use slab_buddy::{Config, ErrorCode};

use test_log::test;

const OBJECT_SIZE: usize = 7;

fn fill_a5(object: NonNull<u8>) {
    unsafe { object.as_ptr().write_bytes(0xA5, OBJECT_SIZE) };
}

#[test]
fn small_objects_round_trip() {
    let region = Region::new(1000);
    let kmem = region.init(Config::default());
    let after_init = shape(kmem);
    let report = kmem.buddy_report();
    assert_eq!(report.usable_blocks, 999);
    assert!(report.validity.is_valid());

    let cache = kmem
        .create_cache("seven", OBJECT_SIZE, Some(fill_a5), None)
        .unwrap();
    assert_eq!(shape(kmem), after_init);

    let objects: Vec<NonNull<u8>> = (0..500).map(|_| cache.alloc().unwrap()).collect();
    for object in &objects {
        let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr(), OBJECT_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0xA5));
    }

    let mut addresses: Vec<usize> = objects.iter().map(|p| p.as_ptr() as usize).collect();
    addresses.sort_unstable();
    for pair in addresses.windows(2) {
        assert!(pair[1] - pair[0] >= OBJECT_SIZE, "objects overlap");
    }

    let info = cache.info();
    log::info!("after 500 allocations:\n{}", info);
    assert_eq!(info.allocated, 500);
    assert_eq!(info.error, ErrorCode::Ok);
    let slabs = info.slabs();
    assert!(slabs >= 1);

    for object in objects {
        cache.free(object).unwrap();
    }
    let info = cache.info();
    assert_eq!(info.allocated, 0);
    assert_eq!(info.empty_slabs, slabs);

    assert_eq!(cache.shrink(), slabs * info.slab_blocks);
    assert_eq!(cache.info().slabs(), 0);
    assert_eq!(shape(kmem), after_init);
    assert!(kmem.buddy_report().validity.is_valid());

    assert_eq!(cache.destroy().unwrap(), 0);
    assert_eq!(shape(kmem), after_init);
}

#[test]
fn shrink_keeps_slabs_with_live_objects() {
    let region = Region::new(256);
    let kmem = region.init(Config::default());
    let cache = kmem.create_cache("pairs", 16, None, None).unwrap();
    let per_slab = cache.info().objects_per_slab;

    let objects: Vec<NonNull<u8>> = (0..3 * per_slab).map(|_| cache.alloc().unwrap()).collect();
    assert_eq!(cache.info().full_slabs, 3);

    // Empty the first slab filled, leave one object in the second.
    for &object in &objects[..2 * per_slab - 1] {
        cache.free(object).unwrap();
    }
    let info = cache.info();
    assert_eq!(
        (info.empty_slabs, info.mixed_slabs, info.full_slabs),
        (1, 1, 1)
    );

    assert_eq!(cache.shrink(), info.slab_blocks);
    let info = cache.info();
    assert_eq!(
        (info.empty_slabs, info.mixed_slabs, info.full_slabs),
        (0, 1, 1)
    );

    // Freed slots in the mixed slab are handed out again before growing.
    let again = cache.alloc().unwrap();
    assert_eq!(again, objects[per_slab]);
    assert_eq!(cache.info().slabs(), 2);
}
