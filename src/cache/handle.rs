//! The opaque engine handle.
//!
//! The cache never dereferences a [`Handle`]; it only stores what the
//! embedding engine gave it (via [`crate::cache::Cache::set_handle`]) and
//! hands it back to the unlock/close hooks. A raw engine pointer, an `i32`
//! file descriptor, or an index into the engine's own table all fit by
//! casting to `u64` at the boundary.

/// An opaque reference to an open database, owned by whichever slot holds
/// it. Only the hooks registered with the cache interpret its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

impl Handle {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Handle {
    fn from(value: u64) -> Self {
        Handle(value)
    }
}
