//! The allocator context and cache handles.
//!
//! ## Basic Types
//!
//! ### [`Kmem`](struct.Kmem.html)
//!
//! A `Kmem` owns one arena. It lives in the arena's first block and holds
//! the buddy allocator for the remaining blocks, the cache of caches, the
//! small buffer caches and the locks around all of them. Several `Kmem`s
//! over different arenas can coexist.
//!
//! ### [`Cache`](struct.Cache.html)
//!
//! A `Cache` is a handle to one object cache of a `Kmem`, as returned by
//! [`Kmem::create_cache`]. Handles are `Send` and `Sync`; a cache can be
//! shared between threads by reference.
//!
//! ### Small buffers
//!
//! [`Kmem::alloc_buffer`] serves requests of up to `1 << MAX_BUFFER_SHIFT`
//! bytes from one of `SIZE_CLASSES` power-of-two caches, and `Kmem`
//! implements [`GlobalAlloc`] on top of it.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt::Write;
use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

use log::{debug, error, warn};
use spin::Mutex;
use static_assertions::const_assert;

use crate::buddy::{Arena, BuddyAllocator, Report, Run};
use crate::config::{Config, DestroyPolicy};
use crate::error::{Error, ErrorCode, Result};
use crate::slab::{CacheInfo, CacheName, Geometry, ObjectHook, SlabCache};
use crate::BLOCK_SIZE;

/// Smallest arena `Kmem::init` accepts: the header block plus one usable
/// block.
pub const MIN_BLOCKS: usize = 2;
/// The smallest small buffer class is `1 << MIN_BUFFER_SHIFT` bytes.
pub const MIN_BUFFER_SHIFT: usize = 5;
/// The largest small buffer class is `1 << MAX_BUFFER_SHIFT` bytes.
pub const MAX_BUFFER_SHIFT: usize = 17;
pub const SIZE_CLASSES: usize = MAX_BUFFER_SHIFT - MIN_BUFFER_SHIFT + 1;
/// Alignment guaranteed for small buffers and for cache descriptors.
pub const MIN_ALIGN: usize = 8;

/// The allocator context. See the [module docs](index.html).
pub struct Kmem {
    config: Config,
    buddy: Mutex<BuddyAllocator>,
    // Guards the cache directory.
    directory: Mutex<()>,
    // Serializes small buffer frees.
    generic: Mutex<()>,
    cache_of_caches: SlabCache,
    small_buffers: [SlabCache; SIZE_CLASSES],
}

// The context must fit in the header block, and descriptors placed in slabs
// must be suitably aligned there.
const_assert!(size_of::<Kmem>() <= BLOCK_SIZE);
const_assert!(align_of::<Kmem>() <= MIN_ALIGN);
const_assert!(align_of::<SlabCache>() <= MIN_ALIGN);
const_assert!(SIZE_CLASSES == 13);

fn class_size(class: usize) -> usize {
    1 << (MIN_BUFFER_SHIFT + class)
}

/// The size class serving `size`-byte requests.
fn size_class(size: usize) -> Option<usize> {
    if size == 0 || size > 1 << MAX_BUFFER_SHIFT {
        return None;
    }
    let shift = size.next_power_of_two().trailing_zeros() as usize;
    Some(shift.max(MIN_BUFFER_SHIFT) - MIN_BUFFER_SHIFT)
}

impl Kmem {
    /// Set up an allocator over `block_count` blocks starting at `region`.
    ///
    /// The first block holds the returned context; the rest are handed to
    /// the buddy allocator. The cache of caches gets its first slab before
    /// this returns.
    ///
    /// Fails with `InvalidArgument` for fewer than [`MIN_BLOCKS`] blocks, a
    /// region that is not word-aligned, or a region size that overflows.
    /// With exactly `MIN_BLOCKS` blocks the single usable block becomes the
    /// first slab of the cache of caches, and nothing else can be allocated.
    ///
    /// # Safety
    ///
    /// `region` must point to `block_count * BLOCK_SIZE` bytes of writable
    /// memory, used by nothing else for `'a`. Every pointer handed out by the
    /// returned context points into that memory.
    pub unsafe fn init<'a>(
        region: NonNull<u8>,
        block_count: usize,
        config: Config,
    ) -> Result<&'a Kmem> {
        if block_count < MIN_BLOCKS {
            return Err(Error::InvalidArgument("arena needs at least two blocks"));
        }
        if region.as_ptr() as usize % MIN_ALIGN != 0 {
            return Err(Error::InvalidArgument("region is not word-aligned"));
        }
        if block_count.checked_mul(BLOCK_SIZE).is_none() {
            return Err(Error::InvalidArgument("region size overflows"));
        }
        let config = config.normalized();

        // Descriptor slabs are single blocks, so the smallest arena still
        // has room for the first one.
        let descriptor_geometry = Geometry::for_order(size_of::<SlabCache>(), 0)
            .ok_or(Error::InvalidArgument("cache descriptors do not fit in a block"))?;
        let cache_of_caches = SlabCache::new(
            CacheName::new("cache-of-caches"),
            size_of::<SlabCache>(),
            descriptor_geometry,
            None,
            None,
            true,
            config.colouring,
        );

        let mut geometries = [Geometry::default(); SIZE_CLASSES];
        for (class, geometry) in geometries.iter_mut().enumerate() {
            *geometry = Geometry::for_object(class_size(class), config.builtin_min_objects_per_slab)
                .ok_or(Error::InvalidArgument("no slab order fits the small buffer caches"))?;
        }
        let small_buffers = core::array::from_fn(|class| {
            let mut name = CacheName::new("size-");
            let _ = write!(name, "{}", class_size(class));
            SlabCache::new(
                name,
                class_size(class),
                geometries[class],
                None,
                None,
                true,
                config.colouring,
            )
        });

        let arena = Arena::new(
            NonNull::new_unchecked(region.as_ptr().add(BLOCK_SIZE)),
            block_count - 1,
        );

        let at: NonNull<Kmem> = region.cast();
        at.as_ptr().write(Kmem {
            config,
            buddy: Mutex::new(BuddyAllocator::new(arena)),
            directory: Mutex::new(()),
            generic: Mutex::new(()),
            cache_of_caches,
            small_buffers,
        });
        let kmem: &'a Kmem = &*at.as_ptr();

        // The directory starts with the built-in caches, in order.
        let mut tail = &kmem.cache_of_caches;
        for cache in &kmem.small_buffers {
            tail.set_next_cache(Some(NonNull::from(cache)));
            tail = cache;
        }

        kmem.cache_of_caches.bootstrap(&kmem.buddy)?;

        debug!(
            "Kmem at {:?}: {} usable blocks, cache of caches with {} descriptors per {}-block slab",
            region,
            block_count - 1,
            kmem.cache_of_caches.geometry().objects_per_slab,
            kmem.cache_of_caches.geometry().slab_blocks(),
        );
        Ok(kmem)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Make a cache of `object_size`-byte objects.
    ///
    /// `ctor` runs on every object as it is handed out, `dtor` on every
    /// object as it is freed.
    pub fn create_cache(
        &self,
        name: &str,
        object_size: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
    ) -> Result<Cache<'_>> {
        if object_size == 0 {
            return Err(Error::InvalidArgument("object size must be non-zero"));
        }
        let geometry = Geometry::for_object(object_size, self.config.min_objects_per_slab)
            .ok_or(Error::InvalidArgument("object size too large for any slab"))?;

        let _directory = self.directory.lock();
        let slot = self.cache_of_caches.allocate(&self.buddy)?;
        let desc: NonNull<SlabCache> = slot.cast();
        unsafe {
            desc.as_ptr().write(SlabCache::new(
                CacheName::new(name),
                object_size,
                geometry,
                ctor,
                dtor,
                false,
                self.config.colouring,
            ));
        }
        self.directory_tail().set_next_cache(Some(desc));

        let desc = unsafe { &*desc.as_ptr() };
        debug!(
            "Created cache `{}`: {} objects of {} bytes per {}-block slab",
            desc.name(),
            geometry.objects_per_slab,
            object_size,
            geometry.slab_blocks()
        );
        Ok(Cache { kmem: self, desc })
    }

    // Caller holds the directory lock.
    fn directory_tail(&self) -> &SlabCache {
        let mut tail = &self.cache_of_caches;
        while let Some(next) = tail.next_cache() {
            tail = unsafe { &*next.as_ptr() };
        }
        tail
    }

    fn destroy_cache<'a>(&'a self, cache: Cache<'a>) -> core::result::Result<usize, Cache<'a>> {
        let desc = cache.desc;
        let refuse = |cache: Cache<'a>, reason: &str| {
            warn!("Refusing to destroy cache `{}`: {}", desc.name(), reason);
            desc.set_error(ErrorCode::CacheCannotBeDeleted);
            Err(cache)
        };

        if desc.is_builtin() {
            return refuse(cache, "built-in cache");
        }

        let _directory = self.directory.lock();
        if self.config.destroy_policy == DestroyPolicy::RefuseWhenLive && desc.has_live_objects() {
            return refuse(cache, "live objects remain");
        }

        let target = NonNull::from(desc);
        let mut previous = &self.cache_of_caches;
        loop {
            match previous.next_cache() {
                Some(next) if next == target => {
                    previous.set_next_cache(desc.next_cache());
                    break;
                }
                Some(next) => previous = unsafe { &*next.as_ptr() },
                None => return refuse(cache, "not in the directory"),
            }
        }

        let reclaimed = desc.release_all(&self.buddy);
        debug!("Destroyed cache `{}`, reclaimed {} blocks", desc.name(), reclaimed);

        // `desc` is not used past this point.
        if let Err(err) = self.cache_of_caches.free(target.cast()) {
            error!("Could not free descriptor of destroyed cache: {}", err);
        }
        Ok(reclaimed)
    }

    /// Allocate a buffer of at least `size` bytes, aligned to [`MIN_ALIGN`].
    ///
    /// Fails with `InvalidArgument` for `size == 0` or
    /// `size > 1 << MAX_BUFFER_SHIFT`.
    pub fn alloc_buffer(&self, size: usize) -> Result<NonNull<u8>> {
        let class = size_class(size).ok_or(Error::InvalidArgument(
            "buffer size must be between 1 and 1 << MAX_BUFFER_SHIFT",
        ))?;
        self.small_buffers[class].allocate(&self.buddy)
    }

    /// Free a buffer from [`alloc_buffer`](Kmem::alloc_buffer).
    ///
    /// Every size class is searched in turn, so this is linear in the number
    /// of small buffer slabs.
    pub fn free_buffer(&self, ptr: NonNull<u8>) -> Result<()> {
        let _scan = self.generic.lock();
        for cache in &self.small_buffers {
            if cache.try_free(ptr)? {
                return Ok(());
            }
        }
        warn!("free_buffer: {:?} is not a small buffer", ptr);
        Err(Error::InvalidPointer(ptr.as_ptr() as usize))
    }

    /// The cache of caches, from which every created cache's descriptor is
    /// allocated.
    ///
    /// The handle is for inspection. Its `alloc` and `free` fail with
    /// `InvalidArgument`: descriptor slots change only through
    /// [`create_cache`](Kmem::create_cache) and [`Cache::destroy`].
    pub fn cache_of_caches(&self) -> Cache<'_> {
        Cache {
            kmem: self,
            desc: &self.cache_of_caches,
        }
    }

    /// The small buffer cache that serves `size`-byte requests.
    pub fn small_buffer_cache(&self, size: usize) -> Option<Cache<'_>> {
        size_class(size).map(|class| Cache {
            kmem: self,
            desc: &self.small_buffers[class],
        })
    }

    /// Call `f` on every cache, in directory order: the cache of caches, the
    /// small buffer caches, then created caches oldest first.
    ///
    /// Caches cannot be created or destroyed from within `f`.
    pub fn for_each_cache<F: FnMut(&SlabCache)>(&self, mut f: F) {
        let _directory = self.directory.lock();
        let mut current = Some(NonNull::from(&self.cache_of_caches));
        while let Some(cache) = current {
            let cache = unsafe { &*cache.as_ptr() };
            f(cache);
            current = cache.next_cache();
        }
    }

    /// A snapshot of the buddy allocator's counters and validity.
    pub fn buddy_report(&self) -> Report {
        self.buddy.lock().report()
    }

    /// Copy the buddy allocator's free runs, lowest order first, into `out`.
    /// Returns the total number of free runs, which may exceed `out.len()`.
    pub fn copy_free_runs(&self, out: &mut [Run]) -> usize {
        self.buddy.lock().copy_runs(out)
    }
}

/// Small buffers through the standard allocator interface. Alignments above
/// [`MIN_ALIGN`] and sizes above `1 << MAX_BUFFER_SHIFT` are not supported and
/// get a null pointer.
unsafe impl GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return null_mut();
        }
        match self.alloc_buffer(layout.size()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        if let Err(err) = self.free_buffer(ptr) {
            error!("dealloc: {}", err);
        }
    }
}

/// A handle to one cache of a [`Kmem`].
pub struct Cache<'a> {
    kmem: &'a Kmem,
    desc: &'a SlabCache,
}

impl<'a> Cache<'a> {
    fn is_cache_of_caches(&self) -> bool {
        core::ptr::eq(self.desc, &self.kmem.cache_of_caches)
    }

    fn refuse_descriptor_access(&self) -> Error {
        warn!("descriptor slots cannot be handed out or freed through a handle");
        self.desc.set_error(ErrorCode::InvalidArgument);
        Error::InvalidArgument("descriptor slots are only managed by create_cache and destroy")
    }

    /// Hand out one object, running the constructor on it.
    ///
    /// Fails with `InvalidArgument` on the cache of caches.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        if self.is_cache_of_caches() {
            return Err(self.refuse_descriptor_access());
        }
        self.desc.allocate(&self.kmem.buddy)
    }

    /// Give an object back, running the destructor on it first.
    ///
    /// Fails with `InvalidPointer` if `ptr` is not a live object of this
    /// cache, and with `InvalidArgument` on the cache of caches.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        if self.is_cache_of_caches() {
            return Err(self.refuse_descriptor_access());
        }
        self.desc.free(ptr)
    }

    /// Release every empty slab. Returns the number of blocks reclaimed.
    pub fn shrink(&self) -> usize {
        self.desc.shrink(&self.kmem.buddy)
    }

    /// Destroy the cache, returning every slab to the buddy allocator.
    /// Returns the number of blocks reclaimed.
    ///
    /// Built-in caches are never destroyed, and with
    /// [`DestroyPolicy::RefuseWhenLive`] neither is a cache with live
    /// objects: the handle is given back and the cache's error is set to
    /// `CacheCannotBeDeleted`.
    pub fn destroy(self) -> core::result::Result<usize, Cache<'a>> {
        self.kmem.destroy_cache(self)
    }

    pub fn info(&self) -> CacheInfo {
        self.desc.info()
    }

    /// The last error recorded by this cache.
    pub fn error(&self) -> ErrorCode {
        self.desc.error()
    }

    pub fn name(&self) -> &CacheName {
        self.desc.name()
    }

    pub fn object_size(&self) -> usize {
        self.desc.object_size()
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        self.desc.owns(ptr)
    }
}

impl core::fmt::Debug for Cache<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cache")
            .field("name", self.desc.name())
            .field("object_size", &self.desc.object_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::Run;
    use crate::region::TestRegion;

    use test_log::test;

    fn setup(blocks: usize, config: Config) -> (TestRegion, &'static Kmem) {
        let region = TestRegion::new(blocks);
        // The region outlives every use of the context in these tests.
        let kmem = unsafe { Kmem::init(region.ptr(), blocks, config).unwrap() };
        (region, kmem)
    }

    fn shape(kmem: &Kmem) -> Vec<Run> {
        let mut runs = vec![Run::new(0, 0); kmem.buddy_report().stats.runs];
        let total = kmem.copy_free_runs(&mut runs);
        assert_eq!(total, runs.len());
        runs.sort();
        runs
    }

    #[test]
    fn init_rejects_bad_regions() {
        let region = TestRegion::new(4);
        unsafe {
            assert!(matches!(
                Kmem::init(region.ptr(), 1, Config::default()),
                Err(Error::InvalidArgument(_))
            ));
            let misaligned = NonNull::new_unchecked(region.ptr().as_ptr().add(1));
            assert!(matches!(
                Kmem::init(misaligned, 2, Config::default()),
                Err(Error::InvalidArgument(_))
            ));
            assert!(matches!(
                Kmem::init(region.ptr(), usize::MAX, Config::default()),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn init_accepts_the_minimum_arena() {
        let (_region, kmem) = setup(MIN_BLOCKS, Config::default());
        let report = kmem.buddy_report();
        assert_eq!(report.usable_blocks, MIN_BLOCKS - 1);
        assert_eq!(report.free_blocks, 0);
        assert!(report.validity.is_valid());
        assert_eq!(kmem.cache_of_caches().info().slabs(), 1);

        let cache = kmem.create_cache("tiny", 16, None, None).unwrap();
        assert_eq!(kmem.cache_of_caches().info().allocated, 1);
        assert!(matches!(cache.alloc(), Err(Error::OutOfMemory { .. })));
        assert_eq!(cache.error(), ErrorCode::BuddyAllocationError);
        assert_eq!(cache.destroy().unwrap(), 0);
    }

    #[test]
    fn cache_of_caches_owns_a_slab_after_init() {
        let (_region, kmem) = setup(64, Config::default());
        let info = kmem.cache_of_caches().info();
        assert_eq!(info.slabs(), 1);
        assert_eq!(info.empty_slabs, 1);
        assert_eq!(info.object_size, size_of::<SlabCache>());
        assert_eq!(info.slab_blocks, 1);

        let report = kmem.buddy_report();
        assert!(report.validity.is_valid());
        assert_eq!(report.usable_blocks, 63);
        assert_eq!(report.free_blocks, 62);
    }

    #[test]
    fn cache_of_caches_handle_cannot_touch_descriptors() {
        let (_region, kmem) = setup(64, Config::default());
        let victim = kmem.create_cache("victim", 40, None, None).unwrap();

        let mut descriptors = Vec::new();
        kmem.for_each_cache(|cache| {
            if cache.name().as_str() == "victim" {
                descriptors.push(NonNull::from(cache).cast::<u8>());
            }
        });
        assert_eq!(descriptors.len(), 1);

        let cache_of_caches = kmem.cache_of_caches();
        assert!(matches!(
            cache_of_caches.free(descriptors[0]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(cache_of_caches.alloc(), Err(Error::InvalidArgument(_))));
        assert_eq!(cache_of_caches.error(), ErrorCode::InvalidArgument);

        // The slot is still taken, so the next descriptor goes elsewhere.
        let other = kmem.create_cache("other", 64, None, None).unwrap();
        assert_eq!(cache_of_caches.info().allocated, 2);
        assert_eq!(victim.name().as_str(), "victim");
        assert_eq!(victim.object_size(), 40);
        assert_eq!(other.name().as_str(), "other");
        victim.alloc().unwrap();
        assert_eq!(victim.info().allocated, 1);
    }

    #[test]
    fn buddy_observers_hold_no_lock() {
        let (_region, kmem) = setup(64, Config::default());
        let before = kmem.buddy_report();
        let buffer = kmem.alloc_buffer(100).unwrap();
        let after = kmem.buddy_report();
        assert!(after.free_blocks < before.free_blocks);
        assert_eq!(after.stats.free_blocks, after.free_blocks);

        let mut first = [Run::new(0, 0); 1];
        assert_eq!(kmem.copy_free_runs(&mut first), after.stats.runs);
        kmem.free_buffer(buffer).unwrap();
    }

    #[test]
    fn descriptors_come_from_the_cache_of_caches() {
        let (_region, kmem) = setup(64, Config::default());
        let before = shape(kmem);

        let cache = kmem.create_cache("things", 40, None, None).unwrap();
        assert!(kmem.cache_of_caches().owns(cache.desc as *const SlabCache as *const u8));
        assert_eq!(kmem.cache_of_caches().info().allocated, 1);
        assert_eq!(shape(kmem), before);
        assert_eq!(cache.name().as_str(), "things");
        assert_eq!(cache.info().slabs(), 0);
    }

    #[test]
    fn create_rejects_bad_sizes() {
        let (_region, kmem) = setup(64, Config::default());
        assert!(matches!(
            kmem.create_cache("zero", 0, None, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            kmem.create_cache("huge", usize::MAX / 2, None, None),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(kmem.cache_of_caches().info().allocated, 0);
    }

    #[test]
    fn directory_order() {
        let (_region, kmem) = setup(64, Config::default());
        let _first = kmem.create_cache("first", 8, None, None).unwrap();
        let second = kmem.create_cache("second", 16, None, None).unwrap();
        let _third = kmem.create_cache("third", 24, None, None).unwrap();
        second.destroy().unwrap();

        let mut names = Vec::new();
        kmem.for_each_cache(|cache| names.push(cache.name().to_string()));
        assert_eq!(names.len(), 1 + SIZE_CLASSES + 2);
        assert_eq!(names[0], "cache-of-caches");
        assert_eq!(names[1], "size-32");
        assert_eq!(names[SIZE_CLASSES], "size-131072");
        assert_eq!(&names[SIZE_CLASSES + 1..], ["first", "third"]);
    }

    #[test]
    fn destroy_reclaims_live_slabs_by_default() {
        let (_region, kmem) = setup(64, Config::default());
        let after_init = shape(kmem);

        let cache = kmem.create_cache("live", 100, None, None).unwrap();
        let blocks = cache.info().slab_blocks;
        let per_slab = cache.info().objects_per_slab;
        for _ in 0..per_slab + 1 {
            cache.alloc().unwrap();
        }

        assert_eq!(cache.destroy().unwrap(), 2 * blocks);
        assert_eq!(shape(kmem), after_init);
        assert_eq!(kmem.cache_of_caches().info().allocated, 0);
    }

    #[test]
    fn destroy_can_refuse_live_caches() {
        let config = Config::default().with_destroy_policy(DestroyPolicy::RefuseWhenLive);
        let (_region, kmem) = setup(64, config);

        let cache = kmem.create_cache("live", 100, None, None).unwrap();
        let object = cache.alloc().unwrap();

        let cache = cache.destroy().unwrap_err();
        assert_eq!(cache.error(), ErrorCode::CacheCannotBeDeleted);
        assert_eq!(cache.info().allocated, 1);

        cache.free(object).unwrap();
        assert_eq!(cache.destroy().unwrap(), 1);
    }

    #[test]
    fn builtin_caches_cannot_be_destroyed() {
        let (_region, kmem) = setup(64, Config::default());

        let cache = kmem.cache_of_caches().destroy().unwrap_err();
        assert_eq!(cache.error(), ErrorCode::CacheCannotBeDeleted);
        assert_eq!(cache.info().slabs(), 1);

        let small = kmem.small_buffer_cache(100).unwrap().destroy().unwrap_err();
        assert_eq!(small.object_size(), 128);
        assert_eq!(small.error(), ErrorCode::CacheCannotBeDeleted);
    }

    #[test]
    fn hooks_run_on_alloc_and_free() {
        fn fill(object: NonNull<u8>) {
            unsafe { object.as_ptr().write_bytes(0x5A, 16) };
        }
        fn scrub(object: NonNull<u8>) {
            unsafe { object.as_ptr().write_bytes(0xDE, 16) };
        }

        let (_region, kmem) = setup(64, Config::default());
        let cache = kmem.create_cache("hooked", 16, Some(fill), Some(scrub)).unwrap();

        let object = cache.alloc().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(object.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0x5A));

        cache.free(object).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(object.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0xDE));
    }

    #[test]
    fn objects_are_distinct_until_memory_runs_out() {
        let config = Config::default()
            .with_min_objects_per_slab(1)
            .with_colouring(false);
        let (_region, kmem) = setup(8, config);
        let cache = kmem.create_cache("filler", 512, None, None).unwrap();
        let per_slab = cache.info().objects_per_slab;
        let free_blocks = kmem.buddy_report().free_blocks;
        assert_eq!(cache.info().slab_blocks, 1);

        let mut objects = Vec::new();
        let err = loop {
            match cache.alloc() {
                Ok(object) => objects.push(object.as_ptr() as usize),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_eq!(cache.error(), ErrorCode::BuddyAllocationError);
        assert_eq!(objects.len(), free_blocks * per_slab);

        objects.sort_unstable();
        for pair in objects.windows(2) {
            assert!(pair[1] - pair[0] >= 512);
        }
        let info = cache.info();
        assert_eq!(info.allocated, objects.len());
        assert_eq!(info.full_slabs, info.slabs());
    }

    #[test]
    fn size_classes() {
        assert_eq!(size_class(0), None);
        assert_eq!(size_class(1), Some(0));
        assert_eq!(size_class(32), Some(0));
        assert_eq!(size_class(33), Some(1));
        assert_eq!(size_class(1 << MAX_BUFFER_SHIFT), Some(SIZE_CLASSES - 1));
        assert_eq!(size_class((1 << MAX_BUFFER_SHIFT) + 1), None);
    }

    #[test]
    fn buffers_round_trip() {
        let (_region, kmem) = setup(256, Config::default());
        let after_init = shape(kmem);

        let small = kmem.alloc_buffer(3).unwrap();
        let medium = kmem.alloc_buffer(1000).unwrap();
        assert!(kmem.small_buffer_cache(32).unwrap().owns(small.as_ptr()));
        assert!(kmem.small_buffer_cache(1024).unwrap().owns(medium.as_ptr()));
        assert_eq!(small.as_ptr() as usize % MIN_ALIGN, 0);
        assert_eq!(medium.as_ptr() as usize % MIN_ALIGN, 0);

        assert!(matches!(kmem.alloc_buffer(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            kmem.alloc_buffer((1 << MAX_BUFFER_SHIFT) + 1),
            Err(Error::InvalidArgument(_))
        ));

        kmem.free_buffer(medium).unwrap();
        kmem.free_buffer(small).unwrap();
        assert!(matches!(kmem.free_buffer(small), Err(Error::InvalidPointer(_))));
        let mut elsewhere = 0u8;
        assert!(matches!(
            kmem.free_buffer(NonNull::from(&mut elsewhere)),
            Err(Error::InvalidPointer(_))
        ));

        for size in [32, 1024] {
            kmem.small_buffer_cache(size).unwrap().shrink();
        }
        assert_eq!(shape(kmem), after_init);
    }

    #[test]
    fn global_alloc_interface() {
        let (_region, kmem) = setup(64, Config::default());
        unsafe {
            let layout = Layout::from_size_align(48, 8).unwrap();
            let ptr = GlobalAlloc::alloc(kmem, layout);
            assert!(!ptr.is_null());
            assert!(kmem.small_buffer_cache(64).unwrap().owns(ptr));

            let overaligned = Layout::from_size_align(48, 64).unwrap();
            assert!(GlobalAlloc::alloc(kmem, overaligned).is_null());

            GlobalAlloc::dealloc(kmem, ptr, layout);
            assert_eq!(kmem.small_buffer_cache(64).unwrap().info().allocated, 0);
        }
    }
}
