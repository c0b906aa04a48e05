//! Per-core cached, bus-mapped buffers for DMA, with shadow buffers for
//! devices that cannot reach caller memory directly.
//!
//! - [`magazine`]: per-core object recycler with a shared depot.
//! - [`cache`]: per-device cache of mapped units and fragments.
//! - [`shadow`]: map/unmap/sync interception backed by the cache.

extern crate libc;

pub mod cache;
pub mod config;
pub mod error;
pub mod host;
pub mod magazine;
pub mod platform;
pub mod shadow;
pub mod stats;
pub mod sync;
pub mod testing;
pub mod util;

pub use cache::encoding::{DeviceAddr, Tag};
pub use cache::{DeviceCache, DmaBuf};
pub use config::CacheConfig;
pub use error::{DmaError, HostError, IntegrityViolation};
pub use host::{Direction, ExecContext, Host};
pub use shadow::{DmaOps, Segment, ShadowLayer};
