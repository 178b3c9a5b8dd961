//! Error types shared by the buddy and slab layers.

use core::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Everything that can go wrong in the allocator.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buddy allocator has no run of a sufficient order left.
    ///
    /// This is recoverable: freeing objects and shrinking caches elsewhere
    /// may make a later attempt succeed.
    #[error("out of memory: no free run of order {order} or above")]
    OutOfMemory { order: usize },

    /// A slab listed as empty or mixed had no free slot in its bit-vector.
    ///
    /// This means the slab bookkeeping is corrupt. It is reported, never
    /// retried.
    #[error("slab corrupted: listed slab in cache `{cache}` has no free slot")]
    SlabCorrupted { cache: crate::slab::CacheName },

    /// The cache cannot be destroyed, either because it is one of the
    /// built-in caches or because it still holds live objects and the
    /// configured policy forbids reclaiming them.
    #[error("cache cannot be deleted")]
    CacheCannotBeDeleted,

    /// A zero-sized request, a request above the largest small-buffer class,
    /// a misaligned region, or a malformed buddy run.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The pointer was not handed out by this cache (or was already freed).
    #[error("pointer {0:#x} was not allocated here")]
    InvalidPointer(usize),
}

pub type Result<T> = core::result::Result<T, Error>;

/// The last error recorded by a cache, as reported by
/// [`Cache::error`](crate::Cache::error).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    BuddyAllocationError = 1,
    SlabSlotAllocationError = 2,
    CacheCannotBeDeleted = 3,
    InvalidArgument = 4,
    InvalidPointer = 5,
}

impl ErrorCode {
    fn from_u8(raw: u8) -> ErrorCode {
        match raw {
            1 => ErrorCode::BuddyAllocationError,
            2 => ErrorCode::SlabSlotAllocationError,
            3 => ErrorCode::CacheCannotBeDeleted,
            4 => ErrorCode::InvalidArgument,
            5 => ErrorCode::InvalidPointer,
            _ => ErrorCode::Ok,
        }
    }
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> ErrorCode {
        match err {
            Error::OutOfMemory { .. } => ErrorCode::BuddyAllocationError,
            Error::SlabCorrupted { .. } => ErrorCode::SlabSlotAllocationError,
            Error::CacheCannotBeDeleted => ErrorCode::CacheCannotBeDeleted,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::InvalidPointer(_) => ErrorCode::InvalidPointer,
        }
    }
}

/// An `ErrorCode` slot that can be updated through a shared reference.
pub(crate) struct LastError(AtomicU8);

impl LastError {
    pub const fn new() -> Self {
        LastError(AtomicU8::new(ErrorCode::Ok as u8))
    }

    pub fn get(&self) -> ErrorCode {
        ErrorCode::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, code: ErrorCode) {
        self.0.store(code as u8, Ordering::Relaxed);
    }

    /// Record `err` and hand it back, for use in `map_err`.
    pub fn record(&self, err: Error) -> Error {
        self.set(ErrorCode::from(&err));
        err
    }
}
