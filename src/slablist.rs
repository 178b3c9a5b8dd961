use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::slab::{Geometry, SlabCache};

/// The header at the start of every slab.
///
/// It is followed by the occupancy bit-vector (`bitmap_words` words, one bit
/// per slot, set = allocated) and, after the slab's colour offset, by the
/// object array.
///
/// We use C representation so the bit-vector can start right after the header
/// at a word boundary.
#[repr(C)]
pub struct SlabMeta {
    next: Option<NonNull<SlabMeta>>,
    cache: NonNull<SlabCache>,
    bitmap: NonNull<u64>,
    objects: NonNull<u8>,
    free_slots: usize,
}

pub(crate) const META_SIZE: usize = size_of::<SlabMeta>();
const_assert!(META_SIZE % size_of::<u64>() == 0);

const WORD_BITS: usize = u64::BITS as usize;

impl SlabMeta {
    /// Lay out a fresh slab over the run starting at `at`: header, zeroed
    /// bit-vector, and an object area starting `colour_offset` bytes after
    /// the bit-vector.
    ///
    /// # Safety
    ///
    /// `at` must point to `geometry.slab_bytes()` bytes of writable, unused
    /// memory, and `colour_offset` must not exceed `geometry.unused_bytes`.
    pub unsafe fn init(
        at: NonNull<u8>,
        cache: NonNull<SlabCache>,
        geometry: &Geometry,
        colour_offset: usize,
    ) -> NonNull<SlabMeta> {
        debug_assert!(colour_offset <= geometry.unused_bytes);

        let bitmap = at.as_ptr().add(META_SIZE) as *mut u64;
        core::ptr::write_bytes(bitmap, 0, geometry.bitmap_words);
        let objects = at.as_ptr().add(geometry.objects_offset + colour_offset);

        let meta: NonNull<SlabMeta> = at.cast();
        meta.as_ptr().write(SlabMeta {
            next: None,
            cache,
            bitmap: NonNull::new_unchecked(bitmap),
            objects: NonNull::new_unchecked(objects),
            free_slots: geometry.objects_per_slab,
        });
        meta
    }

    /// First byte of the slab's run.
    pub fn start(&self) -> *const u8 {
        self as *const SlabMeta as *const u8
    }

    /// Whether `ptr` lies in the slab's run of `slab_bytes` bytes.
    pub fn contains(&self, ptr: *const u8, slab_bytes: usize) -> bool {
        let start = self.start() as usize;
        let ptr = ptr as usize;
        ptr >= start && ptr - start < slab_bytes
    }

    pub fn cache(&self) -> NonNull<SlabCache> {
        self.cache
    }

    pub fn free_slots(&self) -> usize {
        self.free_slots
    }

    fn bitmap(&mut self, words: usize) -> &mut [u64] {
        unsafe { core::slice::from_raw_parts_mut(self.bitmap.as_ptr(), words) }
    }

    /// Claim the lowest-index free slot, if there is one.
    pub fn take_slot(&mut self, geometry: &Geometry) -> Option<usize> {
        let limit = geometry.objects_per_slab;
        for (i, word) in self.bitmap(geometry.bitmap_words).iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = i * WORD_BITS + bit;
            if slot >= limit {
                // Bits past the last slot are never set, so nothing is free.
                return None;
            }
            *word |= 1 << bit;
            self.free_slots -= 1;
            return Some(slot);
        }
        None
    }

    /// Clear the bit of `slot`. Returns false if it was not set.
    pub fn release_slot(&mut self, geometry: &Geometry, slot: usize) -> bool {
        let word = &mut self.bitmap(geometry.bitmap_words)[slot / WORD_BITS];
        let mask = 1 << (slot % WORD_BITS);
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.free_slots += 1;
        true
    }

    /// Whether `slot` is currently handed out.
    pub fn is_taken(&self, geometry: &Geometry, slot: usize) -> bool {
        debug_assert!(slot < geometry.objects_per_slab);
        let word = unsafe { self.bitmap.as_ptr().add(slot / WORD_BITS).read() };
        word & (1 << (slot % WORD_BITS)) != 0
    }

    /// The slot `ptr` points at, if it is exactly the start of one.
    pub fn slot_of(&self, ptr: *const u8, object_size: usize, objects_per_slab: usize) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.objects.as_ptr() as usize)?;
        if offset % object_size != 0 {
            return None;
        }
        let slot = offset / object_size;
        if slot < objects_per_slab {
            Some(slot)
        } else {
            None
        }
    }

    /// Address of `slot`.
    pub fn object(&self, slot: usize, object_size: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.objects.as_ptr().add(slot * object_size)) }
    }
}

/// A `SlabList` is an intrusive singly linked list of slabs, threaded
/// through the `next` field of each slab's header.
///
/// A slab is on at most one list at a time; the list does not own the
/// memory, the cache does.
pub struct SlabList {
    first: Option<NonNull<SlabMeta>>,
    len: usize,
}

// A SlabList is sendable: the slabs it links are only ever touched by
// whoever holds the owning cache's lock.
unsafe impl Send for SlabList {}

impl Default for SlabList {
    fn default() -> Self {
        SlabList::new()
    }
}

pub struct SlabIter<'list> {
    next: Option<NonNull<SlabMeta>>,
    _list: core::marker::PhantomData<&'list SlabList>,
}

impl<'list> Iterator for SlabIter<'list> {
    type Item = NonNull<SlabMeta>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = unsafe { current.as_ref().next };
        Some(current)
    }
}

impl<'list> IntoIterator for &'list SlabList {
    type Item = NonNull<SlabMeta>;
    type IntoIter = SlabIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl SlabList {
    pub const fn new() -> Self {
        SlabList {
            first: None,
            len: 0,
        }
    }

    pub fn iter(&self) -> SlabIter<'_> {
        SlabIter {
            next: self.first,
            _list: core::marker::PhantomData,
        }
    }

    pub fn first(&self) -> Option<NonNull<SlabMeta>> {
        self.first
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Add `slab` at the head of the list.
    ///
    /// # Safety
    ///
    /// `slab` must be a live slab header that is on no list.
    pub unsafe fn push(&mut self, mut slab: NonNull<SlabMeta>) {
        slab.as_mut().next = self.first;
        self.first = Some(slab);
        self.len += 1;
    }

    /// Unlink and return the head of the list.
    pub fn pop(&mut self) -> Option<NonNull<SlabMeta>> {
        let mut first = self.first?;
        unsafe {
            self.first = first.as_mut().next.take();
        }
        self.len -= 1;
        Some(first)
    }

    /// Unlink `slab`, wherever it is in the list. Returns false if it was not
    /// on this list.
    pub fn remove(&mut self, mut slab: NonNull<SlabMeta>) -> bool {
        if self.first == Some(slab) {
            return self.pop().is_some();
        }

        let mut previous = match self.first {
            None => return false,
            Some(p) => p,
        };

        unsafe {
            while let Some(next) = previous.as_ref().next {
                if next == slab {
                    previous.as_mut().next = slab.as_mut().next.take();
                    self.len -= 1;
                    return true;
                }
                previous = next;
            }
        }

        false
    }

    /// The slab whose run of `slab_bytes` bytes contains `ptr`.
    pub fn find(&self, ptr: *const u8, slab_bytes: usize) -> Option<NonNull<SlabMeta>> {
        self.iter()
            .find(|slab| unsafe { slab.as_ref().contains(ptr, slab_bytes) })
    }

    /// Total free slots over every slab on the list.
    pub fn free_slots(&self) -> usize {
        self.iter().map(|slab| unsafe { slab.as_ref().free_slots }).sum()
    }
}

impl fmt::Display for SlabList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlabList(")?;
        let mut start = true;
        for slab in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let free = unsafe { slab.as_ref().free_slots };
            write!(f, "Slab({:?}, {} free)", slab, free)?;
        }
        write!(f, ")")
    }
}
