//! Backing regions for an arena.
//!
//! The allocator itself never asks the host for memory: [`Kmem::init`]
//! takes a pointer and a block count. With the `use_libc` feature,
//! [`MmapRegion`] reserves such a region with an anonymous `mmap` and
//! releases it on drop.
//!
//! [`Kmem::init`]: crate::Kmem::init

#[cfg(feature = "use_libc")]
use core::ptr::{null_mut, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;

#[cfg(feature = "use_libc")]
use crate::BLOCK_SIZE;

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// A region of whole blocks reserved from the OS with `mmap`.
#[cfg(feature = "use_libc")]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
    blocks: usize,
}

#[cfg(feature = "use_libc")]
impl MmapRegion {
    /// Reserve `blocks` blocks of zeroed, private, read/write memory.
    pub fn reserve(blocks: usize) -> Result<MmapRegion, Errno> {
        let pagesize = sysconf::page::pagesize();
        let bytes = blocks
            .checked_mul(BLOCK_SIZE)
            .ok_or(Errno(libc::ENOMEM))?;
        let len = round_up(bytes, pagesize);

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                len,
                libc::PROT_WRITE | libc::PROT_READ,
                // Anonymous memory, not shared with any other process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;
        log::debug!("Reserved {} blocks ({} bytes) at {:?}", blocks, len, ptr);
        Ok(MmapRegion { ptr, len, blocks })
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }
}

#[cfg(feature = "use_libc")]
impl Drop for MmapRegion {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if result != 0 {
            log::warn!("munmap of {:?} failed: {}", self.ptr, errno::errno());
        }
    }
}

/// Block-aligned, zeroed heap memory for unit tests.
#[cfg(test)]
pub(crate) struct TestRegion {
    ptr: core::ptr::NonNull<u8>,
    layout: std::alloc::Layout,
    blocks: usize,
}

#[cfg(test)]
impl TestRegion {
    pub fn new(blocks: usize) -> TestRegion {
        let layout = std::alloc::Layout::from_size_align(blocks * crate::BLOCK_SIZE, crate::BLOCK_SIZE)
            .expect("test region layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = core::ptr::NonNull::new(ptr).expect("test region allocation failed");
        TestRegion { ptr, layout, blocks }
    }

    pub fn ptr(&self) -> core::ptr::NonNull<u8> {
        self.ptr
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }
}

#[cfg(test)]
impl Drop for TestRegion {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn mmap_region_is_writable() {
        let region = MmapRegion::reserve(4).unwrap();
        assert_eq!(region.blocks(), 4);
        unsafe {
            let last = region.ptr().as_ptr().add(4 * BLOCK_SIZE - 1);
            last.write(0xA5);
            assert_eq!(last.read(), 0xA5);
        }
    }
}
