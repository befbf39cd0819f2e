//! Engine hooks.
//!
//! The SQL engine itself is out of scope for this crate; it plugs in by
//! registering two callbacks on the cache. Both are `Arc`-wrapped rather
//! than `Box`-wrapped so the controller can clone the current hook out of
//! its locked state and invoke it after releasing the global mutex (the
//! close hook in particular must run unlocked — see `expire_base` in
//! `cache::controller`).

use std::sync::Arc;

use super::handle::Handle;

/// Called whenever a slot transitions out of `USED` into `IDLE`/`IDLE_HOT`,
/// giving the engine a chance to release its own locks or checkpoint.
pub type UnlockHook = Arc<dyn Fn(Handle) + Send + Sync>;

/// Called during eviction, with the global lock released, to actually
/// close the database. Must be idempotent only insofar as the engine
/// itself guarantees it; the cache calls it exactly once per eviction.
pub type CloseHook = Arc<dyn Fn(Handle) + Send + Sync>;
