//! Object caches.
//!
//! A [`SlabCache`] hands out fixed-size objects from slabs: runs of blocks
//! taken from the buddy allocator, each starting with a `SlabMeta` header
//! and an occupancy bit-vector. Slabs live on one of three lists:
//!
//! - *empty*: every slot free,
//! - *mixed*: some slots free,
//! - *full*: no slot free.
//!
//! Allocation prefers mixed slabs, then empty ones, and grows the cache by
//! one slab when both lists are empty.

use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::buddy::{BuddyAllocator, Run, ORDER_COUNT};
use crate::error::{Error, ErrorCode, LastError, Result};
use crate::region::round_up;
use crate::slablist::{SlabList, SlabMeta, META_SIZE};
use crate::{BLOCK_SIZE, CACHE_LINE_SIZE};

/// Called with the address of an object right after it is allocated
/// (constructor) or right before it is freed (destructor).
pub type ObjectHook = fn(NonNull<u8>);

const NAME_CAPACITY: usize = 32;

/// A cache name, stored inline (truncated to 32 bytes).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CacheName {
    bytes: [u8; NAME_CAPACITY],
    len: u8,
}

impl CacheName {
    pub fn new(name: &str) -> CacheName {
        let mut cache_name = CacheName {
            bytes: [0; NAME_CAPACITY],
            len: 0,
        };
        // Writing into a CacheName never fails, it truncates.
        let _ = fmt::Write::write_str(&mut cache_name, name);
        cache_name
    }

    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Write for CacheName {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            let len = self.len as usize;
            let width = ch.len_utf8();
            if len + width > NAME_CAPACITY {
                break;
            }
            ch.encode_utf8(&mut self.bytes[len..len + width]);
            self.len += width as u8;
        }
        Ok(())
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// How objects of one size are packed into a slab.
///
/// A slab of `2^slab_order` blocks holds the header, `bitmap_words` words of
/// bit-vector, and `objects_per_slab` objects; `unused_bytes` are left over
/// and are used for cache colouring.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    pub slab_order: usize,
    pub objects_per_slab: usize,
    pub bitmap_words: usize,
    /// Offset of the first object from the start of the slab, before colouring.
    pub objects_offset: usize,
    pub unused_bytes: usize,
}

impl Geometry {
    /// Pack `object_size`-byte objects into a slab of `2^order` blocks.
    ///
    /// The object count is the largest `n` with
    /// `META_SIZE + ceil(n / 64) * 8 + n * object_size <= slab_bytes`.
    /// Returns `None` if not even one object fits.
    pub fn for_order(object_size: usize, order: usize) -> Option<Geometry> {
        if object_size == 0 || order >= ORDER_COUNT {
            return None;
        }
        let slab_bytes = BLOCK_SIZE.checked_mul(1usize.checked_shl(order as u32)?)?;
        let available = slab_bytes.checked_sub(META_SIZE)?;

        // Every object costs its size plus one bit; start there and step down
        // over the word rounding of the bit-vector.
        let mut objects = match available.checked_mul(8) {
            Some(bits) => bits / (object_size.checked_mul(8)? + 1),
            None => available / object_size,
        };
        let (bitmap_words, objects_offset) = loop {
            let words = round_up(objects, 64) / 64;
            let offset = META_SIZE + words * 8;
            if objects == 0 || offset + objects * object_size <= slab_bytes {
                break (words, offset);
            }
            objects -= 1;
        };
        if objects == 0 {
            return None;
        }

        Some(Geometry {
            slab_order: order,
            objects_per_slab: objects,
            bitmap_words,
            objects_offset,
            unused_bytes: slab_bytes - objects_offset - objects * object_size,
        })
    }

    /// The smallest slab holding at least `min_objects` objects.
    pub fn for_object(object_size: usize, min_objects: usize) -> Option<Geometry> {
        (0..ORDER_COUNT)
            .filter_map(|order| Geometry::for_order(object_size, order))
            .find(|geometry| geometry.objects_per_slab >= min_objects)
    }

    pub fn slab_blocks(&self) -> usize {
        1 << self.slab_order
    }

    pub fn slab_bytes(&self) -> usize {
        self.slab_blocks() * BLOCK_SIZE
    }

    /// Number of distinct non-zero colour offsets a slab can take.
    pub fn colours(&self) -> usize {
        self.unused_bytes / CACHE_LINE_SIZE
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ListKind {
    Empty,
    Mixed,
    Full,
}

/// Everything guarded by a cache's lock.
#[derive(Default)]
struct SlabLists {
    empty: SlabList,
    mixed: SlabList,
    full: SlabList,
    // Colour of the next slab to be laid out.
    colour: usize,
}

impl SlabLists {
    fn list_mut(&mut self, kind: ListKind) -> &mut SlabList {
        match kind {
            ListKind::Empty => &mut self.empty,
            ListKind::Mixed => &mut self.mixed,
            ListKind::Full => &mut self.full,
        }
    }

    // Full first: that is where most live objects are.
    fn find(&self, ptr: *const u8, slab_bytes: usize) -> Option<(NonNull<SlabMeta>, ListKind)> {
        [
            (&self.full, ListKind::Full),
            (&self.mixed, ListKind::Mixed),
            (&self.empty, ListKind::Empty),
        ]
        .iter()
        .find_map(|(list, kind)| list.find(ptr, slab_bytes).map(|slab| (slab, *kind)))
    }
}

/// A cache descriptor.
///
/// Descriptors of caches made with
/// [`Kmem::create_cache`](crate::Kmem::create_cache) are themselves objects of
/// the cache of caches; the built-in ones live in the arena's header block.
pub struct SlabCache {
    name: CacheName,
    object_size: usize,
    geometry: Geometry,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    builtin: bool,
    colouring: bool,
    // Next cache in the directory; only changed under the directory lock.
    next: AtomicPtr<SlabCache>,
    lists: Mutex<SlabLists>,
    error: LastError,
}

impl SlabCache {
    pub(crate) fn new(
        name: CacheName,
        object_size: usize,
        geometry: Geometry,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        builtin: bool,
        colouring: bool,
    ) -> SlabCache {
        SlabCache {
            name,
            object_size,
            geometry,
            ctor,
            dtor,
            builtin,
            colouring,
            next: AtomicPtr::new(ptr::null_mut()),
            lists: Mutex::new(SlabLists::default()),
            error: LastError::new(),
        }
    }

    pub fn name(&self) -> &CacheName {
        &self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Built-in caches (the cache of caches and the small buffer caches)
    /// cannot be destroyed.
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    pub fn error(&self) -> ErrorCode {
        self.error.get()
    }

    pub(crate) fn set_error(&self, code: ErrorCode) {
        self.error.set(code);
    }

    pub(crate) fn next_cache(&self) -> Option<NonNull<SlabCache>> {
        NonNull::new(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn set_next_cache(&self, next: Option<NonNull<SlabCache>>) {
        let raw = next.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.next.store(raw, Ordering::Release);
    }

    /// Hand out one object, growing the cache by a slab if needed.
    pub(crate) fn allocate(&self, buddy: &Mutex<BuddyAllocator>) -> Result<NonNull<u8>> {
        let object = {
            let mut lists = self.lists.lock();
            if lists.empty.is_empty() && lists.mixed.is_empty() {
                self.grow(&mut lists, buddy)
                    .map_err(|err| self.error.record(err))?;
            }
            self.take_object(&mut lists)
                .map_err(|err| self.error.record(err))?
        };

        if let Some(ctor) = self.ctor {
            ctor(object);
        }
        trace!("{}: allocated {:?}", self.name, object);
        Ok(object)
    }

    /// Lay out the first slab without going through `allocate`.
    pub(crate) fn bootstrap(&self, buddy: &Mutex<BuddyAllocator>) -> Result<()> {
        let mut lists = self.lists.lock();
        self.grow(&mut lists, buddy)
            .map_err(|err| self.error.record(err))
    }

    fn take_object(&self, lists: &mut SlabLists) -> Result<NonNull<u8>> {
        let kind = if lists.mixed.is_empty() {
            ListKind::Empty
        } else {
            ListKind::Mixed
        };
        let list = lists.list_mut(kind);
        let mut slab = list.first().ok_or_else(|| self.corrupted())?;
        let meta = unsafe { slab.as_mut() };

        let slot = meta
            .take_slot(&self.geometry)
            .ok_or_else(|| self.corrupted())?;
        list.pop();

        unsafe {
            if meta.free_slots() == 0 {
                lists.full.push(slab);
            } else {
                lists.mixed.push(slab);
            }
        }

        Ok(meta.object(slot, self.object_size))
    }

    fn corrupted(&self) -> Error {
        error!("{}: listed slab has no free slot", self.name);
        Error::SlabCorrupted { cache: self.name }
    }

    // Take one slab-order run from the buddy allocator and put it on the
    // empty list.
    fn grow(&self, lists: &mut SlabLists, buddy: &Mutex<BuddyAllocator>) -> Result<()> {
        let (run, at) = {
            let mut buddy = buddy.lock();
            let run = buddy.acquire(self.geometry.slab_order)?;
            (run, buddy.arena().run_ptr(run))
        };

        let colour = self.next_colour(lists);
        let slab = unsafe {
            SlabMeta::init(
                at,
                NonNull::from(self),
                &self.geometry,
                colour * CACHE_LINE_SIZE,
            )
        };
        unsafe { lists.empty.push(slab) };

        debug!(
            "{}: new slab at blocks {} (colour {}, {} objects)",
            self.name, run, colour, self.geometry.objects_per_slab
        );
        Ok(())
    }

    fn next_colour(&self, lists: &mut SlabLists) -> usize {
        let colours = self.geometry.colours();
        if !self.colouring || colours == 0 {
            return 0;
        }
        let colour = lists.colour;
        lists.colour = (colour + 1) % (colours + 1);
        colour
    }

    /// Give `ptr` back. Fails with `InvalidPointer` if it was not allocated
    /// from this cache, or was already freed.
    pub(crate) fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        if self.try_free(ptr)? {
            return Ok(());
        }
        warn!("{}: free of foreign pointer {:?}", self.name, ptr);
        Err(self.error.record(Error::InvalidPointer(ptr.as_ptr() as usize)))
    }

    /// Like `free`, but returns `Ok(false)` if no slab of this cache contains
    /// `ptr` at all.
    pub(crate) fn try_free(&self, ptr: NonNull<u8>) -> Result<bool> {
        let mut lists = self.lists.lock();
        let (mut slab, kind) = match lists.find(ptr.as_ptr(), self.geometry.slab_bytes()) {
            None => return Ok(false),
            Some(found) => found,
        };
        let meta = unsafe { slab.as_mut() };
        debug_assert!(meta.cache() == NonNull::from(self));

        let slot = meta
            .slot_of(ptr.as_ptr(), self.object_size, self.geometry.objects_per_slab)
            .filter(|&slot| meta.is_taken(&self.geometry, slot));
        let slot = match slot {
            Some(slot) => slot,
            None => {
                warn!("{}: {:?} is not a live object", self.name, ptr);
                return Err(self.error.record(Error::InvalidPointer(ptr.as_ptr() as usize)));
            }
        };

        // The slot is still ours until its bit is cleared.
        if let Some(dtor) = self.dtor {
            dtor(ptr);
        }
        meta.release_slot(&self.geometry, slot);

        lists.list_mut(kind).remove(slab);
        unsafe {
            if meta.free_slots() == self.geometry.objects_per_slab {
                lists.empty.push(slab);
            } else {
                lists.mixed.push(slab);
            }
        }

        trace!("{}: freed {:?}", self.name, ptr);
        Ok(true)
    }

    /// Whether `ptr` lies inside one of this cache's slabs.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.lists
            .lock()
            .find(ptr, self.geometry.slab_bytes())
            .is_some()
    }

    /// Whether any slab is full or mixed.
    pub(crate) fn has_live_objects(&self) -> bool {
        let lists = self.lists.lock();
        !lists.full.is_empty() || !lists.mixed.is_empty()
    }

    /// Return every empty slab to the buddy allocator. Returns the number of
    /// blocks reclaimed.
    pub(crate) fn shrink(&self, buddy: &Mutex<BuddyAllocator>) -> usize {
        let mut lists = self.lists.lock();
        let mut buddy = buddy.lock();

        let mut reclaimed = 0;
        while let Some(slab) = lists.empty.pop() {
            reclaimed += self.release_slab(&mut buddy, slab);
        }

        if reclaimed > 0 {
            debug!("{}: shrink reclaimed {} blocks", self.name, reclaimed);
        }
        reclaimed
    }

    /// Return every slab, live or not, to the buddy allocator.
    pub(crate) fn release_all(&self, buddy: &Mutex<BuddyAllocator>) -> usize {
        let mut lists = self.lists.lock();
        let mut buddy = buddy.lock();

        let mut reclaimed = 0;
        for kind in [ListKind::Full, ListKind::Mixed, ListKind::Empty] {
            while let Some(slab) = lists.list_mut(kind).pop() {
                reclaimed += self.release_slab(&mut buddy, slab);
            }
        }
        reclaimed
    }

    fn release_slab(&self, buddy: &mut BuddyAllocator, slab: NonNull<SlabMeta>) -> usize {
        let start = match buddy.arena().block_of(slab.as_ptr() as *const u8) {
            Some(start) => start,
            None => {
                error!("{}: slab {:?} is outside the arena", self.name, slab);
                return 0;
            }
        };

        let run = Run::new(start, self.geometry.slab_order);
        match buddy.release(run) {
            Ok(()) => run.blocks(),
            Err(err) => {
                error!("{}: could not release slab {}: {}", self.name, run, err);
                0
            }
        }
    }

    /// A snapshot of the cache's state.
    pub fn info(&self) -> CacheInfo {
        let lists = self.lists.lock();
        let empty_slabs = lists.empty.len();
        let mixed_slabs = lists.mixed.len();
        let full_slabs = lists.full.len();
        let free_slots =
            lists.empty.free_slots() + lists.mixed.free_slots() + lists.full.free_slots();
        let capacity = (empty_slabs + mixed_slabs + full_slabs) * self.geometry.objects_per_slab;

        CacheInfo {
            name: self.name,
            object_size: self.object_size,
            slab_blocks: self.geometry.slab_blocks(),
            objects_per_slab: self.geometry.objects_per_slab,
            empty_slabs,
            mixed_slabs,
            full_slabs,
            free_slots,
            allocated: capacity - free_slots,
            unused_bytes: self.geometry.unused_bytes,
            colours: if self.colouring {
                self.geometry.colours()
            } else {
                0
            },
            error: self.error.get(),
        }
    }
}

/// A point-in-time view of a cache, as returned by
/// [`Cache::info`](crate::Cache::info).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub name: CacheName,
    pub object_size: usize,
    /// Blocks per slab.
    pub slab_blocks: usize,
    pub objects_per_slab: usize,
    pub empty_slabs: usize,
    pub mixed_slabs: usize,
    pub full_slabs: usize,
    /// Free object slots over all slabs.
    pub free_slots: usize,
    /// Live objects over all slabs.
    pub allocated: usize,
    /// Bytes per slab left over after the header, bit-vector and objects.
    pub unused_bytes: usize,
    /// Number of non-zero colour offsets in use.
    pub colours: usize,
    pub error: ErrorCode,
}

impl CacheInfo {
    pub fn slabs(&self) -> usize {
        self.empty_slabs + self.mixed_slabs + self.full_slabs
    }

    /// Bytes available in free slots.
    pub fn free_bytes(&self) -> usize {
        self.free_slots * self.object_size
    }

    /// Percentage of slots in use, 0 for a cache without slabs.
    pub fn usage_percent(&self) -> f64 {
        let capacity = self.allocated + self.free_slots;
        if capacity == 0 {
            return 0.0;
        }
        self.allocated as f64 * 100.0 / capacity as f64
    }
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cache `{}`", self.name)?;
        writeln!(f, "  object size:      {} bytes", self.object_size)?;
        writeln!(f, "  slab size:        {} blocks", self.slab_blocks)?;
        writeln!(f, "  objects per slab: {}", self.objects_per_slab)?;
        writeln!(
            f,
            "  slabs:            {} empty, {} mixed, {} full",
            self.empty_slabs, self.mixed_slabs, self.full_slabs
        )?;
        writeln!(
            f,
            "  free slots:       {} ({} bytes)",
            self.free_slots,
            self.free_bytes()
        )?;
        writeln!(
            f,
            "  live objects:     {} ({:.1}% used)",
            self.allocated,
            self.usage_percent()
        )?;
        writeln!(
            f,
            "  unused per slab:  {} bytes, {} colours",
            self.unused_bytes, self.colours
        )?;
        write!(f, "  last error:       {:?}", self.error)
    }
}
