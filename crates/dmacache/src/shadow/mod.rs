//! Shadow buffers for devices that cannot reach the caller's memory.
//!
//! Every mapping gets a buffer from the [`DeviceCache`]; the device only
//! ever sees that buffer. The table remembers which caller buffer each
//! shadow stands in for, and the data is copied across when the direction
//! of the transfer requires it:
//!
//! | operation         | to device      | from device    |
//! |-------------------|----------------|----------------|
//! | `map`             | real to shadow |                |
//! | `sync_for_device` | real to shadow |                |
//! | `sync_for_cpu`    |                | shadow to real |
//! | `unmap`           |                | shadow to real |

mod ops;
pub mod table;

pub use ops::{DmaOps, Segment};

use self::table::{Entry, ShadowTable};
use crate::cache::encoding::{DeviceAddr, Decoded};
use crate::cache::DeviceCache;
use crate::config::CacheConfig;
use crate::error::{violation, DmaError, IntegrityViolation, Result};
use crate::host::{Direction, Host};
use crate::util::{align_up, order_for};
use core::ptr::{self, NonNull};

pub struct ShadowLayer {
    cache: DeviceCache,
    table: ShadowTable,
}

impl ShadowLayer {
    pub fn new(cache: DeviceCache) -> Self {
        let table = ShadowTable::new(cache.config());
        ShadowLayer { cache, table }
    }

    pub fn register(host: Host, config: CacheConfig) -> Result<Self> {
        Ok(ShadowLayer::new(DeviceCache::register(host, config)?))
    }

    #[inline]
    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    /// Mappings currently live.
    pub fn live_mappings(&self) -> usize {
        self.table.live_entries()
    }

    /// Map `size` bytes at `real` for a transfer in `dir`. Returns the
    /// address to give the device.
    ///
    /// # Safety
    /// `real` must be valid for reads and writes of `size` bytes until the
    /// matching `unmap`.
    pub unsafe fn map(&self, real: *mut u8, size: usize, dir: Direction) -> Result<DeviceAddr> {
        let real = NonNull::new(real).ok_or(DmaError::InvalidRequest("null buffer"))?;
        if size == 0 {
            return Err(DmaError::InvalidRequest("zero-length mapping"));
        }
        let rounded = align_up(size, self.cache.config().frag_align);
        let buf = if rounded <= self.cache.config().unit_size() {
            self.cache.alloc(rounded, dir)?
        } else {
            self.cache.alloc_pages(order_for(rounded), dir)?
        };
        let addr = buf.addr();
        let d = self.decode(addr)?;
        let entry = Entry {
            shadow: buf.cpu(),
            real,
            len: size,
            dir,
        };
        if let Err(v) = self.table.claim(addr.raw(), &d, entry) {
            self.cache.free(addr)?;
            return Err(violation(v));
        }
        if dir.device_reads() {
            ptr::copy_nonoverlapping(real.as_ptr(), entry.shadow.as_ptr(), size);
        }
        log::trace!("dmacache: mapped {} bytes {:?} at {:#x}", size, dir, addr);
        Ok(addr)
    }

    /// End the mapping at `addr`.
    ///
    /// # Safety
    /// The caller buffer recorded by `map` must still be valid.
    pub unsafe fn unmap(&self, addr: DeviceAddr, size: usize, dir: Direction) -> Result<()> {
        let d = self.decode(addr)?;
        let entry = self.lookup(addr, &d, dir)?;
        if size != entry.len {
            return Err(DmaError::InvalidRequest("unmap size differs from the mapped size"));
        }
        let entry = self
            .table
            .clear(&d)
            .ok_or_else(|| violation(IntegrityViolation::NotMapped { addr: addr.raw() }))?;
        if dir.device_writes() {
            ptr::copy_nonoverlapping(entry.shadow.as_ptr(), entry.real.as_ptr(), entry.len);
        }
        log::trace!("dmacache: unmapped {:#x}", addr);
        self.cache.free(addr)
    }

    /// Make device writes to `[offset, offset + size)` visible to the CPU.
    ///
    /// # Safety
    /// The caller buffer recorded by `map` must still be valid.
    pub unsafe fn sync_for_cpu(
        &self,
        addr: DeviceAddr,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<()> {
        let d = self.decode(addr)?;
        let entry = self.lookup(addr, &d, dir)?;
        check_range(&entry, offset, size)?;
        if dir.device_writes() {
            ptr::copy_nonoverlapping(
                entry.shadow.as_ptr().add(offset),
                entry.real.as_ptr().add(offset),
                size,
            );
        } else {
            log::warn!("dmacache: sync_for_cpu on {:#x} maps to the device, nothing to copy", addr);
        }
        Ok(())
    }

    /// Make CPU writes to `[offset, offset + size)` visible to the device.
    ///
    /// # Safety
    /// The caller buffer recorded by `map` must still be valid.
    pub unsafe fn sync_for_device(
        &self,
        addr: DeviceAddr,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<()> {
        let d = self.decode(addr)?;
        let entry = self.lookup(addr, &d, dir)?;
        check_range(&entry, offset, size)?;
        if dir.device_reads() {
            ptr::copy_nonoverlapping(
                entry.real.as_ptr().add(offset),
                entry.shadow.as_ptr().add(offset),
                size,
            );
        } else {
            log::warn!("dmacache: sync_for_device on {:#x} maps from the device, nothing to copy", addr);
        }
        Ok(())
    }

    fn decode(&self, addr: DeviceAddr) -> Result<Decoded> {
        self.cache.layout().split(addr).map_err(violation)
    }

    /// The live entry for `addr`, which must have been mapped in `dir`.
    fn lookup(&self, addr: DeviceAddr, d: &Decoded, dir: Direction) -> Result<Entry> {
        let entry = self
            .table
            .get(d)
            .ok_or_else(|| violation(IntegrityViolation::NotMapped { addr: addr.raw() }))?;
        for mapped in [entry.dir, d.tag.direction()] {
            if mapped != dir {
                return Err(violation(IntegrityViolation::DirectionMismatch {
                    mapped,
                    requested: dir,
                }));
            }
        }
        Ok(entry)
    }
}

fn check_range(entry: &Entry, offset: usize, size: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= entry.len => Ok(()),
        _ => Err(DmaError::InvalidRequest("sync range outside the mapping")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimHost;

    fn layer() -> (SimHost, ShadowLayer) {
        let sim = SimHost::new(1, 1);
        let layer = ShadowLayer::register(sim.host(), CacheConfig::default()).unwrap();
        (sim, layer)
    }

    #[test]
    fn map_copies_for_device_reads() {
        let (_sim, layer) = layer();
        let mut real = *b"hello device";
        let addr = unsafe { layer.map(real.as_mut_ptr(), real.len(), Direction::ToDevice) }.unwrap();
        let shadow = layer.cache().translate(addr, real.len()).unwrap();
        let seen = unsafe { core::slice::from_raw_parts(shadow.as_ptr(), real.len()) };
        assert_eq!(seen, b"hello device");
        assert_ne!(shadow.as_ptr(), real.as_mut_ptr());
        unsafe { layer.unmap(addr, real.len(), Direction::ToDevice) }.unwrap();
        assert_eq!(layer.live_mappings(), 0);
    }

    #[test]
    fn sync_range_is_checked() {
        let (_sim, layer) = layer();
        let mut real = [0u8; 32];
        let addr = unsafe { layer.map(real.as_mut_ptr(), 32, Direction::FromDevice) }.unwrap();
        let err = unsafe { layer.sync_for_cpu(addr, 16, 17, Direction::FromDevice) }.unwrap_err();
        assert!(matches!(err, DmaError::InvalidRequest(_)));
        unsafe { layer.sync_for_cpu(addr, 16, 16, Direction::FromDevice) }.unwrap();
        unsafe { layer.unmap(addr, 32, Direction::FromDevice) }.unwrap();
    }

    #[test]
    fn large_mapping_uses_oversized_unit() {
        let (_sim, layer) = layer();
        let mut real = vec![7u8; 100_000];
        let addr = unsafe { layer.map(real.as_mut_ptr(), real.len(), Direction::ToDevice) }.unwrap();
        assert_eq!(layer.cache().layout().split(addr).unwrap().offset, 0);
        unsafe { layer.unmap(addr, real.len(), Direction::ToDevice) }.unwrap();
    }
}
