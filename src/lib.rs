//! A shared-database handle cache with bounded slots, reentrant per-thread
//! locking, and an outbound event dispatch worker.
//!
//! The [`cache`] module is the core: a fixed pool of slots, each either
//! free, idle (cold or hot), in use, or transiently closing, moved between
//! four intrusive LRU lists under one mutex. [`dispatch`] is an
//! independent collaborator — a worker draining an outbound event queue
//! into a pluggable broker — included because its backoff/retry model is
//! non-trivial and it's a natural companion to a resource cache of this
//! shape.

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod rrd;
pub mod settings;

pub use cache::{Cache, CacheCounts, CloseFlags, Handle};
pub use error::{BrokerError, CacheError};
pub use settings::Settings;
