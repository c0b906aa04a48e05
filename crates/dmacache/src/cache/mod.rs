//! Per-device cache of bus-mapped units.
//!
//! Units are recycled through one [`MagAllocator`] per `{locality,
//! direction}` key. The key travels in the tag of every device address the
//! cache hands out, so `free` finds the owning allocator from the address
//! alone. Sub-unit requests are carved from per-slot fragment cursors.
//!
//! Allocation paths:
//! - `alloc`: fragment from the partial cursor of the current slot.
//! - `alloc_pages(order)`: below the unit order, a page-aligned fragment
//!   from the full-page cursor of class `order + 1`; at the unit order, a
//!   whole unit; above it, an oversized unit.
//! - `alloc_whole_unit`/`alloc_units`: bypass the cursors.
//!
//! A miss at every level ends in `register_unit`, which takes pages from the
//! host, maps them at the unit's device address and records the unit.

pub mod encoding;
pub mod frag;
pub mod unit;

use self::encoding::{DeviceAddr, Layout, Tag};
use self::frag::{CursorIndex, FragCursor, FragType, UnitRef};
use self::unit::{Unit, UnitMap, CACHED, LIVE, RELEASED};
use crate::config::CacheConfig;
use crate::error::{violation, DmaError, IntegrityViolation, Result};
use crate::host::{AllocFlags, Direction, ExecContext, Host, HostPages};
use crate::magazine::MagAllocator;
use crate::stats::{AllocStats, Event, StatsSnapshot};
use crate::sync::{ExclusiveCell, Mutex};
use crate::util::{align_up, order_for, page_size};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

/// A buffer handed out by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuf {
    addr: DeviceAddr,
    cpu: NonNull<u8>,
    len: usize,
}

unsafe impl Send for DmaBuf {}
unsafe impl Sync for DmaBuf {}

impl DmaBuf {
    /// Address the device uses.
    #[inline]
    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    /// CPU view of the same memory.
    #[inline]
    pub fn cpu(&self) -> NonNull<u8> {
        self.cpu
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct KeyedAllocator {
    tag: Tag,
    mags: MagAllocator<u64>,
    units: UnitMap,
    next_index: AtomicU64,
    /// Oversized units whose pages went back to the host.
    released: Mutex<Vec<u64>>,
    /// Reserved index ranges whose registration failed, as `(span, first)`.
    spare: Mutex<Vec<(u32, u64)>>,
}

pub struct DeviceCache {
    config: CacheConfig,
    layout: Layout,
    host: Host,
    keys: Box<[KeyedAllocator]>,
    cursor_index: CursorIndex,
    cursors: Box<[ExclusiveCell<FragCursor>]>,
    shared_cursors: Box<[Mutex<FragCursor>]>,
    stats: AllocStats,
}

impl DeviceCache {
    /// Set up the cache of one device. Nothing is allocated from the host
    /// until the first request.
    pub fn register(host: Host, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let cores = host.topology.num_cores().max(1);
        let keys: Box<[KeyedAllocator]> = (0..config.localities * 2)
            .map(|key| KeyedAllocator {
                tag: Tag::from_key(key),
                mags: MagAllocator::new(host.topology.clone()),
                units: UnitMap::new(config.max_units_per_key),
                next_index: AtomicU64::new(0),
                released: Mutex::new(Vec::new()),
                spare: Mutex::new(Vec::new()),
            })
            .collect();
        let cursor_index = CursorIndex::new(config.unit_order());
        let cursors = (0..cores * 2 * cursor_index.per_slot())
            .map(|_| ExclusiveCell::new(FragCursor::new()))
            .collect();
        let shared_cursors = (0..cursor_index.per_slot())
            .map(|_| Mutex::new(FragCursor::new()))
            .collect();
        log::debug!(
            "dmacache: registered device cache: {} byte units, {} localities, {} cores",
            config.unit_size(),
            config.localities,
            cores
        );
        Ok(DeviceCache {
            layout: Layout::new(config.unit_shift),
            config,
            host,
            keys,
            cursor_index,
            cursors,
            shared_cursors,
            stats: AllocStats::new(cores),
        })
    }

    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[inline]
    pub fn host(&self) -> &Host {
        &self.host
    }

    #[inline]
    fn current_core(&self) -> usize {
        self.host.topology.current_core() % self.host.topology.num_cores().max(1)
    }

    #[inline]
    fn current_context(&self) -> ExecContext {
        self.host.topology.current_context()
    }

    fn record(&self, order: u32, event: Event) {
        self.stats
            .record(self.current_core(), self.current_context(), order, event);
    }

    /// A fragment of at least `size` bytes, rounded up to the fragment
    /// granularity.
    pub fn alloc(&self, size: usize, dir: Direction) -> Result<DmaBuf> {
        if size == 0 || size > self.config.unit_size() {
            return Err(DmaError::InvalidRequest(
                "fragment size must be between one byte and the unit size",
            ));
        }
        let size = align_up(size, self.config.frag_align);
        let order = order_for(size);
        let buf = self.alloc_frag(FragType::partial(dir), 0, size, order, dir)?;
        self.record(order, Event::Alloc);
        Ok(buf)
    }

    pub fn alloc_page(&self, dir: Direction) -> Result<DmaBuf> {
        self.alloc_pages(0, dir)
    }

    /// `page_size << order` bytes aligned to their size.
    pub fn alloc_pages(&self, order: u32, dir: Direction) -> Result<DmaBuf> {
        let unit_order = self.config.unit_order();
        if order < unit_order {
            let class = order as usize + 1;
            let buf = self.alloc_frag(FragType::full(dir), class, page_size() << order, order, dir)?;
            self.record(order, Event::Alloc);
            Ok(buf)
        } else if order <= self.config.max_order() {
            self.alloc_units(order - unit_order, dir)
        } else {
            Err(DmaError::InvalidRequest("page order above the largest oversized unit"))
        }
    }

    pub fn alloc_whole_unit(&self, dir: Direction) -> Result<DmaBuf> {
        self.alloc_units(0, dir)
    }

    /// `1 << order` contiguous units. Order zero is a cached whole unit;
    /// larger orders are oversized units that go back to the host on free.
    pub fn alloc_units(&self, order: u32, dir: Direction) -> Result<DmaBuf> {
        if order > self.config.max_oversize_order {
            return Err(DmaError::InvalidRequest("unit order above the configured maximum"));
        }
        let (_, unit) = if order == 0 {
            self.acquire_unit(dir)?
        } else {
            self.acquire_oversized(dir, order)?
        };
        unit.claim_slot(0, unit.page_order()).map_err(violation)?;
        self.record(unit.page_order(), Event::Alloc);
        self.buf_in(unit, 0, self.config.unit_size() << order)
    }

    /// Drop the reference behind `addr`. A unit whose last reference goes
    /// returns to its allocator, chosen by the tag of `addr`.
    ///
    /// `addr` must be the start of a buffer that is still allocated; a
    /// second free of the same buffer is a `DoubleFree`.
    pub fn free(&self, addr: DeviceAddr) -> Result<()> {
        let (keyed, unit) = self.lookup(addr)?;
        let offset = (addr.raw() - unit.addr().raw()) as usize;
        if offset % self.config.frag_align != 0 {
            return Err(violation(IntegrityViolation::InvalidAddress { addr: addr.raw() }));
        }
        let order = unit
            .vacate_slot(offset / self.config.frag_align, addr)
            .map_err(violation)?;
        let last = unit.put(addr).map_err(violation)?;
        self.record(order, Event::Free);
        if last {
            self.recycle(keyed, unit)?;
        }
        Ok(())
    }

    /// CPU pointer for `len` bytes at `addr`, as the device would reach them.
    pub fn translate(&self, addr: DeviceAddr, len: usize) -> Result<NonNull<u8>> {
        let (_, unit) = self.lookup(addr)?;
        if unit.state() != LIVE {
            return Err(violation(IntegrityViolation::NotMapped { addr: addr.raw() }));
        }
        let offset = (addr.raw() - unit.addr().raw()) as usize;
        let unit_len = page_size() << unit.page_order();
        if offset.checked_add(len).map_or(true, |end| end > unit_len) {
            return Err(DmaError::InvalidRequest("range crosses the end of its unit"));
        }
        NonNull::new(unit.cpu())
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
            .ok_or_else(|| violation(IntegrityViolation::NotMapped { addr: addr.raw() }))
    }

    fn lookup(&self, addr: DeviceAddr) -> Result<(&KeyedAllocator, &Unit)> {
        let d = self.layout.split(addr).map_err(violation)?;
        let keyed = self
            .keys
            .get(d.tag.key())
            .ok_or_else(|| violation(IntegrityViolation::InvalidAddress { addr: addr.raw() }))?;
        let unit = keyed
            .units
            .get(d.index)
            .ok_or_else(|| violation(IntegrityViolation::UnknownUnit { addr: addr.raw() }))?;
        Ok((keyed, unit))
    }

    fn buf_in(&self, unit: &Unit, offset: usize, len: usize) -> Result<DmaBuf> {
        let base = NonNull::new(unit.cpu()).ok_or_else(|| {
            violation(IntegrityViolation::CorruptCache {
                what: "live unit has no pages",
            })
        })?;
        Ok(DmaBuf {
            addr: unit.addr().add(offset),
            cpu: unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) },
            len,
        })
    }

    fn alloc_frag(
        &self,
        ty: FragType,
        class: usize,
        size: usize,
        order: u32,
        dir: Direction,
    ) -> Result<DmaBuf> {
        let slot = self.current_context().slot(self.current_core());
        match self.cursors[self.cursor_index.of(slot, ty, class)].try_enter() {
            Some(mut cursor) => self.carve(&mut cursor, size, order, dir),
            // Slot already entered on this index; use the locked cursor.
            None => {
                let mut cursor = self.shared_cursors[self.cursor_index.shared(ty, class)].lock();
                self.carve(&mut cursor, size, order, dir)
            }
        }
    }

    /// Cut `size` bytes off the cursor's unit, counted as page order `order`.
    fn carve(
        &self,
        cursor: &mut FragCursor,
        size: usize,
        order: u32,
        dir: Direction,
    ) -> Result<DmaBuf> {
        let (unit, offset) = match cursor.fit(size) {
            Some(offset) => (self.cursor_unit(cursor)?, offset),
            None => {
                if let Some(old) = cursor.unit.take() {
                    cursor.remaining = 0;
                    self.put_cursor_ref(old)?;
                }
                let (keyed, unit) = self.acquire_unit(dir)?;
                cursor.unit = Some(UnitRef {
                    key: keyed.tag.key(),
                    index: unit.index(),
                });
                log::trace!("dmacache: fragment cursor moved to unit {:#x}", unit.addr());
                (unit, self.config.unit_size() - size)
            }
        };
        unit.claim_slot(offset / self.config.frag_align, order)
            .map_err(violation)?;
        unit.get();
        cursor.remaining = offset;
        self.buf_in(unit, offset, size)
    }

    fn cursor_unit(&self, cursor: &FragCursor) -> Result<&Unit> {
        cursor
            .unit
            .and_then(|r| self.keys.get(r.key)?.units.get(r.index))
            .ok_or_else(|| {
                violation(IntegrityViolation::CorruptCache {
                    what: "fragment cursor points at no unit",
                })
            })
    }

    fn put_cursor_ref(&self, r: UnitRef) -> Result<()> {
        let keyed = self.keys.get(r.key).ok_or_else(|| {
            violation(IntegrityViolation::CorruptCache {
                what: "fragment cursor key out of range",
            })
        })?;
        let unit = keyed.units.get(r.index).ok_or_else(|| {
            violation(IntegrityViolation::CorruptCache {
                what: "fragment cursor points at no unit",
            })
        })?;
        if unit.put(unit.addr()).map_err(violation)? {
            self.recycle(keyed, unit)?;
        }
        Ok(())
    }

    fn local_allocator(&self, dir: Direction) -> Result<&KeyedAllocator> {
        let locality = self.host.topology.current_locality();
        Tag::new(locality, dir)
            .and_then(|tag| self.keys.get(tag.key()))
            .ok_or(DmaError::InvalidRequest(
                "current locality is not served by this device",
            ))
    }

    /// A whole unit holding one reference, from the magazines or the host.
    fn acquire_unit(&self, dir: Direction) -> Result<(&KeyedAllocator, &Unit)> {
        let keyed = self.local_allocator(dir)?;
        if let Some(index) = keyed.mags.alloc() {
            let unit = keyed.units.get(index).ok_or_else(|| {
                violation(IntegrityViolation::UnknownUnit {
                    addr: self.layout.compose(keyed.tag, index, 0).raw(),
                })
            })?;
            unit.revive().map_err(violation)?;
            unit.set_home(self.current_core());
            return Ok((keyed, unit));
        }
        self.register_unit(keyed, 0)
    }

    fn acquire_oversized(&self, dir: Direction, span: u32) -> Result<(&KeyedAllocator, &Unit)> {
        let keyed = self.local_allocator(dir)?;
        let reuse = {
            let mut released = keyed.released.lock();
            released
                .iter()
                .position(|&i| keyed.units.get(i).is_some_and(|u| u.span() == span))
                .map(|pos| released.swap_remove(pos))
        };
        let Some(index) = reuse else {
            return self.register_unit(keyed, span);
        };
        let unit = keyed.units.get(index).ok_or_else(|| {
            violation(IntegrityViolation::CorruptCache {
                what: "released unit vanished from the registry",
            })
        })?;
        let pages = match self.populate(keyed.tag, unit.page_order(), unit.addr()) {
            Ok(pages) => pages,
            Err(e) => {
                keyed.released.lock().push(index);
                return Err(e);
            }
        };
        unit.repopulate(pages.as_ptr().as_ptr(), self.current_core())
            .map_err(violation)?;
        Ok((keyed, unit))
    }

    /// Reserve `1 << span` consecutive indexes aligned to their count.
    fn reserve_index(&self, keyed: &KeyedAllocator, span: u32) -> Result<u64> {
        {
            let mut spare = keyed.spare.lock();
            if let Some(pos) = spare.iter().position(|&(s, _)| s == span) {
                return Ok(spare.swap_remove(pos).1);
            }
        }
        let count = 1u64 << span;
        let capacity = keyed.units.capacity();
        let mut cur = keyed.next_index.load(Ordering::Relaxed);
        loop {
            let start = (cur + count - 1) & !(count - 1);
            let end = start + count;
            if end > capacity {
                log::warn!(
                    "dmacache: allocator {:?} ran out of unit indexes ({} registered)",
                    keyed.tag,
                    cur
                );
                return Err(DmaError::CapacityExceeded {
                    key: keyed.tag.key(),
                });
            }
            match keyed.next_index.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(start),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Take a fresh unit from the host and record it.
    #[cold]
    fn register_unit<'a>(
        &'a self,
        keyed: &'a KeyedAllocator,
        span: u32,
    ) -> Result<(&'a KeyedAllocator, &'a Unit)> {
        let index = self.reserve_index(keyed, span)?;
        let addr = self.layout.compose(keyed.tag, index, 0);
        debug_assert_eq!(self.layout.split(addr).map(|d| d.tag), Ok(keyed.tag));
        let order = self.config.unit_order() + span;
        let pages = match self.populate(keyed.tag, order, addr) {
            Ok(pages) => pages,
            Err(e) => {
                keyed.spare.lock().push((span, index));
                return Err(e);
            }
        };
        // Oversized units are only ever handed out whole.
        let slots = if span == 0 {
            self.config.slots_per_unit()
        } else {
            1
        };
        let unit = keyed.units.insert(Box::new(Unit::new_live(
            pages.as_ptr().as_ptr(),
            addr,
            index,
            span,
            order,
            self.current_core(),
            slots,
        )));
        log::debug!(
            "dmacache: registered unit {:#x} ({} bytes) for {:?}",
            addr,
            pages.len(),
            keyed.tag
        );
        Ok((keyed, unit))
    }

    /// Pages of `order` from the host, checked for locality and mapped at
    /// `addr`.
    fn populate(&self, tag: Tag, order: u32, addr: DeviceAddr) -> Result<HostPages> {
        let pages = self
            .host
            .pages
            .allocate(order, AllocFlags::CACHE_REFILL)
            .map_err(|e| {
                log::warn!("dmacache: host could not supply a unit for {:?}: {}", tag, e);
                DmaError::Exhausted(e)
            })?;
        if let Err(e) = self.check_locality(tag, &pages) {
            self.host.pages.free(pages);
            return Err(e);
        }
        let len = pages.len();
        match self.host.bus.map(&pages, 0, len, tag.direction(), addr.raw()) {
            Ok(got) if got == addr.raw() => Ok(pages),
            Ok(got) => {
                self.host.bus.unmap(got, len, tag.direction());
                self.host.pages.free(pages);
                Err(violation(IntegrityViolation::MappingMismatch {
                    requested: addr.raw(),
                    returned: got,
                }))
            }
            Err(e) => {
                self.host.pages.free(pages);
                log::warn!("dmacache: bus mapping failed for {:?}: {}", tag, e);
                Err(DmaError::Exhausted(e))
            }
        }
    }

    /// New pages must come from the tag's locality, and the caller must
    /// still be running there.
    fn check_locality(&self, tag: Tag, pages: &HostPages) -> Result<()> {
        let found = self.host.topology.locality_of(pages);
        if found != tag.locality() {
            return Err(violation(IntegrityViolation::LocalityMismatch {
                expected: tag.locality(),
                found,
            }));
        }
        let current = self.host.topology.current_locality();
        if current != tag.locality() {
            return Err(violation(IntegrityViolation::LocalityMismatch {
                expected: tag.locality(),
                found: current,
            }));
        }
        Ok(())
    }

    fn recycle(&self, keyed: &KeyedAllocator, unit: &Unit) -> Result<()> {
        if unit.span() == 0 {
            unit.retire().map_err(violation)?;
            keyed.mags.free(unit.index(), unit.home());
            return Ok(());
        }
        let cpu = unit.release().map_err(violation)?;
        self.host.bus.unmap(
            unit.addr().raw(),
            page_size() << unit.page_order(),
            keyed.tag.direction(),
        );
        if let Some(ptr) = NonNull::new(cpu) {
            self.host.pages.free(unsafe {
                HostPages::from_raw(ptr, unit.page_order(), keyed.tag.locality())
            });
        }
        keyed.released.lock().push(unit.index());
        log::debug!("dmacache: oversized unit {:#x} returned to the host", unit.addr());
        Ok(())
    }

    /// Units registered across every key, released oversized units included.
    pub fn unit_count(&self) -> usize {
        self.keys.iter().map(|k| k.units.iter().count()).sum()
    }

    /// Units resting in magazines. Exact only when no other thread is
    /// using the cache.
    pub fn cached_units(&self) -> usize {
        self.keys.iter().map(|k| k.mags.cached_objects()).sum()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Structural checks over every allocator and unit. Exact only when no
    /// other thread is using the cache.
    pub fn check_invariants(&self) -> core::result::Result<(), IntegrityViolation> {
        for keyed in self.keys.iter() {
            keyed.mags.check_invariants()?;
            for unit in keyed.units.iter() {
                let ok = match unit.state() {
                    CACHED => unit.refs() == 0 && unit.span() == 0 && unit.live_slots() == 0,
                    LIVE => {
                        unit.refs() > 0
                            && unit.refs() as usize >= unit.live_slots()
                            && !unit.cpu().is_null()
                    }
                    RELEASED => {
                        unit.span() > 0 && unit.cpu().is_null() && unit.live_slots() == 0
                    }
                    _ => false,
                };
                if !ok {
                    return Err(IntegrityViolation::CorruptCache {
                        what: "unit state disagrees with its references",
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for DeviceCache {
    fn drop(&mut self) {
        let mut returned = 0usize;
        for keyed in self.keys.iter() {
            let dir = keyed.tag.direction();
            for unit in keyed.units.iter() {
                let Some(ptr) = NonNull::new(unit.cpu()) else {
                    continue;
                };
                let len = page_size() << unit.page_order();
                self.host.bus.unmap(unit.addr().raw(), len, dir);
                self.host.pages.free(unsafe {
                    HostPages::from_raw(ptr, unit.page_order(), keyed.tag.locality())
                });
                returned += 1;
            }
        }
        log::debug!("dmacache: device cache torn down, {} units returned to the host", returned);
    }
}
