//! Several threads sharing one arena: each thread makes a cache of its own
//! and also allocates from a cache shared by all of them.
//!
//! Run with `RUST_LOG=debug` to see slab growth and cache lifetimes.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use slab_buddy::{Cache, Config, Kmem, BLOCK_SIZE};

const BLOCKS: usize = 1000;
const WORKERS: usize = 5;
const ITERATIONS: usize = 1000;
const SHARED_SIZE: usize = 7;
const MASK: u8 = 0xA5;

static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

fn construct(object: NonNull<u8>) {
    CONSTRUCTED.fetch_add(1, Ordering::Relaxed);
    unsafe { object.as_ptr().write_bytes(MASK, SHARED_SIZE) };
}

fn is_masked(object: NonNull<u8>, size: usize) -> bool {
    let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr(), size) };
    bytes.iter().all(|&b| b == MASK)
}

fn work(kmem: &Kmem, shared: &Cache<'_>, id: usize) {
    let size = id + 1;
    let own = kmem
        .create_cache(&format!("thread cache {}", id), size, None, None)
        .expect("creating the thread cache");

    let mut objects = Vec::with_capacity(ITERATIONS);
    for i in 0..ITERATIONS {
        if i % 100 == 0 {
            let object = shared.alloc().expect("shared allocation");
            assert!(is_masked(object, SHARED_SIZE));
            objects.push((true, object));
        } else {
            let object = own.alloc().expect("thread allocation");
            unsafe { object.as_ptr().write_bytes(MASK, size) };
            objects.push((false, object));
        }
    }

    println!("{}", own.info());
    println!("{}", shared.info());

    for (from_shared, object) in objects {
        let (cache, len) = if from_shared {
            (shared, SHARED_SIZE)
        } else {
            (&own, size)
        };
        assert!(is_masked(object, len));
        cache.free(object).expect("freeing");
    }

    own.destroy().expect("destroying the thread cache");
}

fn main() {
    env_logger::init();

    #[cfg(feature = "use_libc")]
    let region = slab_buddy::MmapRegion::reserve(BLOCKS).expect("mmap");
    #[cfg(feature = "use_libc")]
    let space = region.ptr();

    #[cfg(not(feature = "use_libc"))]
    let layout = std::alloc::Layout::from_size_align(BLOCKS * BLOCK_SIZE, BLOCK_SIZE).unwrap();
    #[cfg(not(feature = "use_libc"))]
    let space = NonNull::new(unsafe { std::alloc::alloc(layout) }).expect("allocating the arena");

    let kmem = unsafe { Kmem::init(space, BLOCKS, Config::default()) }.expect("init");
    let shared = kmem
        .create_cache("shared object", SHARED_SIZE, Some(construct), None)
        .expect("creating the shared cache");

    thread::scope(|scope| {
        for id in 0..WORKERS {
            let shared = &shared;
            scope.spawn(move || work(kmem, shared, id));
        }
    });

    println!(
        "{} shared objects constructed, {} blocks reclaimed",
        CONSTRUCTED.load(Ordering::Relaxed),
        shared.destroy().expect("destroying the shared cache")
    );
    kmem.for_each_cache(|cache| {
        let info = cache.info();
        if info.slabs() > 0 {
            println!("{}", info);
        }
    });

    #[cfg(not(feature = "use_libc"))]
    unsafe {
        std::alloc::dealloc(space.as_ptr(), layout)
    };
}
