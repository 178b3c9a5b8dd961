use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use slab_buddy::{Config, Kmem, Run, BLOCK_SIZE};

/// Block-aligned heap memory to build an arena in.
pub struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    blocks: usize,
}

impl Region {
    pub fn new(blocks: usize) -> Region {
        let layout = Layout::from_size_align(blocks * BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("region allocation failed");
        Region {
            ptr,
            layout,
            blocks,
        }
    }

    /// A fresh allocator over the whole region.
    pub fn init(&self, config: Config) -> &Kmem {
        unsafe { Kmem::init(self.ptr, self.blocks, config).unwrap() }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Every free buddy run, sorted.
#[allow(dead_code)]
pub fn shape(kmem: &Kmem) -> Vec<Run> {
    let mut runs = vec![Run::new(0, 0); kmem.buddy_report().stats.runs];
    assert_eq!(kmem.copy_free_runs(&mut runs), runs.len());
    runs.sort();
    runs
}

/// Give every empty small buffer slab back to the buddy allocator.
#[allow(dead_code)]
pub fn shrink_small_buffers(kmem: &Kmem) -> usize {
    (slab_buddy::MIN_BUFFER_SHIFT..=slab_buddy::MAX_BUFFER_SHIFT)
        .filter_map(|shift| kmem.small_buffer_cache(1 << shift))
        .map(|cache| cache.shrink())
        .sum()
}
