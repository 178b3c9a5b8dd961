//! Tunables for a [`Kmem`](crate::Kmem) instance.

/// What [`Cache::destroy`](crate::Cache::destroy) does with a cache that
/// still holds live objects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DestroyPolicy {
    /// Release every slab, live or not. Outstanding pointers into the cache
    /// become dangling.
    Reclaim,
    /// Refuse with `CacheCannotBeDeleted` while any slab is full or mixed.
    RefuseWhenLive,
}

/// Configuration, fixed at [`Kmem::init`](crate::Kmem::init) time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Occupancy target for caches made with `create_cache`: a slab is the
    /// smallest power-of-two run of blocks holding at least this many objects.
    pub min_objects_per_slab: usize,
    /// Occupancy target for the small buffer caches. Descriptor slabs of the
    /// cache of caches are always a single block.
    pub builtin_min_objects_per_slab: usize,
    pub destroy_policy: DestroyPolicy,
    /// Offset successive slabs' object areas by multiples of the L1 line size,
    /// using the slack at the end of each slab.
    pub colouring: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_objects_per_slab: 32,
            builtin_min_objects_per_slab: 64,
            destroy_policy: DestroyPolicy::Reclaim,
            colouring: true,
        }
    }
}

impl Config {
    pub fn with_min_objects_per_slab(mut self, objects: usize) -> Self {
        self.min_objects_per_slab = objects;
        self
    }

    pub fn with_builtin_min_objects_per_slab(mut self, objects: usize) -> Self {
        self.builtin_min_objects_per_slab = objects;
        self
    }

    pub fn with_destroy_policy(mut self, policy: DestroyPolicy) -> Self {
        self.destroy_policy = policy;
        self
    }

    pub fn with_colouring(mut self, colouring: bool) -> Self {
        self.colouring = colouring;
        self
    }

    /// Occupancy targets of zero make no sense; treat them as one.
    pub(crate) fn normalized(mut self) -> Self {
        self.min_objects_per_slab = self.min_objects_per_slab.max(1);
        self.builtin_min_objects_per_slab = self.builtin_min_objects_per_slab.max(1);
        self
    }
}
