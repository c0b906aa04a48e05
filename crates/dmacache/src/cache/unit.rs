//! Unit metadata and the index-to-unit registry.
//!
//! Each `{locality, direction}` key numbers its units from zero. The
//! registry is a two-level table indexed by that number:
//!
//! Level 1: one slot per `L2_SIZE` indexes, sized from the key's capacity.
//! Level 2: lazily allocated block of `L2_SIZE` unit pointers.
//!
//! Units are never unregistered while the cache lives. An oversized unit
//! occupies `1 << span` consecutive indexes and is registered at each.
//!
//! Every buffer handed out of a unit claims the slot its first byte falls
//! in. A slot stores the page order of its buffer plus one, zero when free,
//! so a free that finds its slot empty is a double free.

use super::encoding::DeviceAddr;
use crate::error::IntegrityViolation;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// In a magazine or never handed out.
pub const CACHED: u8 = 0;
/// Owned by a caller or a fragment cursor.
pub const LIVE: u8 = 1;
/// Oversized unit whose pages went back to the host.
pub const RELEASED: u8 = 2;

pub struct Unit {
    cpu: AtomicPtr<u8>,
    addr: DeviceAddr,
    index: u64,
    span: u32,
    page_order: u32,
    home: AtomicUsize,
    refs: AtomicU32,
    state: AtomicU8,
    slots: Box<[AtomicU8]>,
}

impl Unit {
    /// A unit that starts out owned by its creator with one reference.
    /// `slots` is the number of buffer start positions it tracks.
    pub fn new_live(
        cpu: *mut u8,
        addr: DeviceAddr,
        index: u64,
        span: u32,
        page_order: u32,
        home: usize,
        slots: usize,
    ) -> Self {
        Unit {
            cpu: AtomicPtr::new(cpu),
            addr,
            index,
            span,
            page_order,
            home: AtomicUsize::new(home),
            refs: AtomicU32::new(1),
            state: AtomicU8::new(LIVE),
            slots: (0..slots.max(1)).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    #[inline]
    pub fn cpu(&self) -> *mut u8 {
        self.cpu.load(Ordering::Acquire)
    }

    /// Device address of the first byte.
    #[inline]
    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Extra order over a regular unit; zero for regular units.
    #[inline]
    pub fn span(&self) -> u32 {
        self.span
    }

    #[inline]
    pub fn page_order(&self) -> u32 {
        self.page_order
    }

    #[inline]
    pub fn home(&self) -> usize {
        self.home.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_home(&self, core: usize) {
        self.home.store(core, Ordering::Relaxed);
    }

    #[inline]
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take a unit out of a magazine.
    pub fn revive(&self) -> Result<(), IntegrityViolation> {
        self.state
            .compare_exchange(CACHED, LIVE, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IntegrityViolation::CorruptCache {
                what: "magazine held a unit that is not cached",
            })?;
        self.refs.store(1, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn get(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a reference taken for `addr`. `Ok(true)` when it was the last.
    pub fn put(&self, addr: DeviceAddr) -> Result<bool, IntegrityViolation> {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 || self.state() != LIVE {
                return Err(IntegrityViolation::DoubleFree { addr: addr.raw() });
            }
            match self.refs.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(cur == 1),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Record a buffer of page order `order` starting in `slot`.
    pub fn claim_slot(&self, slot: usize, order: u32) -> Result<(), IntegrityViolation> {
        let cell = self.slots.get(slot).ok_or(IntegrityViolation::CorruptCache {
            what: "buffer starts outside its unit",
        })?;
        let mark = u8::try_from(order + 1).map_err(|_| IntegrityViolation::CorruptCache {
            what: "buffer order does not fit a slot",
        })?;
        cell.compare_exchange(0, mark, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| IntegrityViolation::CorruptCache {
                what: "handed out a slot that is still live",
            })
    }

    /// Forget the buffer at `addr`, which starts in `slot`. Returns the page
    /// order it was claimed with.
    pub fn vacate_slot(&self, slot: usize, addr: DeviceAddr) -> Result<u32, IntegrityViolation> {
        let cell = self
            .slots
            .get(slot)
            .ok_or(IntegrityViolation::InvalidAddress { addr: addr.raw() })?;
        match cell.swap(0, Ordering::AcqRel) {
            0 => Err(IntegrityViolation::DoubleFree { addr: addr.raw() }),
            mark => Ok(u32::from(mark) - 1),
        }
    }

    /// Buffers currently handed out of this unit.
    pub fn live_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Mark an unreferenced unit as cached, ready for a magazine.
    pub fn retire(&self) -> Result<(), IntegrityViolation> {
        self.state
            .compare_exchange(LIVE, CACHED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| IntegrityViolation::DoubleFree {
                addr: self.addr.raw(),
            })
    }

    /// Detach the pages of an unreferenced oversized unit, keeping its
    /// registry slots. Returns the CPU pointer of the pages.
    pub fn release(&self) -> Result<*mut u8, IntegrityViolation> {
        self.state
            .compare_exchange(LIVE, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IntegrityViolation::DoubleFree {
                addr: self.addr.raw(),
            })?;
        Ok(self.cpu.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Attach fresh pages to a released oversized unit.
    pub fn repopulate(&self, cpu: *mut u8, home: usize) -> Result<(), IntegrityViolation> {
        self.cpu.store(cpu, Ordering::Release);
        self.set_home(home);
        self.refs.store(1, Ordering::Release);
        self.state
            .compare_exchange(RELEASED, LIVE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| IntegrityViolation::CorruptCache {
                what: "reused an oversized unit that was not released",
            })
    }
}

const L2_BITS: usize = 8;
const L2_SIZE: usize = 1 << L2_BITS;

struct L2Block {
    entries: [AtomicPtr<Unit>; L2_SIZE],
}

impl L2Block {
    fn new() -> Box<Self> {
        Box::new(L2Block {
            entries: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        })
    }
}

pub struct UnitMap {
    l1: Box<[AtomicPtr<L2Block>]>,
    capacity: u64,
}

impl UnitMap {
    pub fn new(capacity: usize) -> Self {
        let l1_len = capacity.div_ceil(L2_SIZE);
        UnitMap {
            l1: (0..l1_len).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            capacity: capacity as u64,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline(always)]
    fn indices(index: u64) -> (usize, usize) {
        let index = index as usize;
        (index >> L2_BITS, index & (L2_SIZE - 1))
    }

    fn get_or_alloc_l2(&self, l1_idx: usize) -> &L2Block {
        let slot = &self.l1[l1_idx];
        let l2 = slot.load(Ordering::Acquire);
        if !l2.is_null() {
            return unsafe { &*l2 };
        }
        self.alloc_l2(l1_idx)
    }

    #[cold]
    fn alloc_l2(&self, l1_idx: usize) -> &L2Block {
        let new_l2 = Box::into_raw(L2Block::new());
        let slot = &self.l1[l1_idx];
        // Lost the race: use the block already installed.
        match slot.compare_exchange(ptr::null_mut(), new_l2, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => unsafe { &*new_l2 },
            Err(existing) => {
                drop(unsafe { Box::from_raw(new_l2) });
                unsafe { &*existing }
            }
        }
    }

    /// Register `unit` at every index it spans. The caller reserved those
    /// indexes, so no other unit can be registered there.
    pub fn insert(&self, unit: Box<Unit>) -> &Unit {
        let first = unit.index();
        let count = 1u64 << unit.span();
        debug_assert!(first + count <= self.capacity);
        let raw = Box::into_raw(unit);
        for index in first..first + count {
            let (l1_idx, l2_idx) = Self::indices(index);
            let l2 = self.get_or_alloc_l2(l1_idx);
            l2.entries[l2_idx].store(raw, Ordering::Release);
        }
        unsafe { &*raw }
    }

    #[inline]
    pub fn get(&self, index: u64) -> Option<&Unit> {
        if index >= self.capacity {
            return None;
        }
        let (l1_idx, l2_idx) = Self::indices(index);
        let l2 = self.l1[l1_idx].load(Ordering::Acquire);
        if l2.is_null() {
            return None;
        }
        let l2 = unsafe { &*l2 };
        let unit = l2.entries[l2_idx].load(Ordering::Acquire);
        if unit.is_null() {
            None
        } else {
            Some(unsafe { &*unit })
        }
    }

    /// Every registered unit once, in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Unit> + '_ {
        (0..self.capacity).filter_map(move |i| self.get(i).filter(|u| u.index() == i))
    }
}

impl Drop for UnitMap {
    fn drop(&mut self) {
        for (l1_idx, slot) in self.l1.iter().enumerate() {
            let l2 = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if l2.is_null() {
                continue;
            }
            let block = unsafe { Box::from_raw(l2) };
            for (l2_idx, entry) in block.entries.iter().enumerate() {
                let unit = entry.load(Ordering::Acquire);
                let index = ((l1_idx << L2_BITS) | l2_idx) as u64;
                // An oversized unit is freed from its first index only.
                if !unit.is_null() && unsafe { &*unit }.index() == index {
                    drop(unsafe { Box::from_raw(unit) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::encoding::{Layout, Tag};
    use crate::host::Direction;

    fn unit(index: u64, span: u32) -> Box<Unit> {
        let tag = Tag::new(0, Direction::ToDevice).unwrap();
        let addr = Layout::new(16).compose(tag, index, 0);
        Box::new(Unit::new_live(ptr::null_mut(), addr, index, span, 4, 0, 16))
    }

    #[test]
    fn last_put_reports_and_second_free_is_caught() {
        let u = unit(0, 0);
        u.get();
        assert_eq!(u.put(u.addr()), Ok(false));
        assert_eq!(u.put(u.addr()), Ok(true));
        u.retire().unwrap();
        assert_eq!(
            u.put(u.addr()),
            Err(IntegrityViolation::DoubleFree { addr: u.addr().raw() })
        );
        u.revive().unwrap();
        assert_eq!(u.refs(), 1);
        assert!(u.revive().is_err());
    }

    #[test]
    fn slots_catch_a_second_release() {
        let u = unit(0, 0);
        u.claim_slot(3, 2).unwrap();
        assert!(u.claim_slot(3, 0).is_err());
        assert_eq!(u.live_slots(), 1);
        assert_eq!(u.vacate_slot(3, u.addr()), Ok(2));
        assert_eq!(
            u.vacate_slot(3, u.addr()),
            Err(IntegrityViolation::DoubleFree { addr: u.addr().raw() })
        );
        assert_eq!(
            u.vacate_slot(16, u.addr()),
            Err(IntegrityViolation::InvalidAddress { addr: u.addr().raw() })
        );
        assert_eq!(u.live_slots(), 0);
    }

    #[test]
    fn released_unit_can_be_repopulated() {
        let u = unit(0, 2);
        assert_eq!(u.put(u.addr()), Ok(true));
        assert!(u.release().unwrap().is_null());
        assert_eq!(u.state(), RELEASED);
        assert!(u.release().is_err());
        let mut page = [0u8; 8];
        u.repopulate(page.as_mut_ptr(), 3).unwrap();
        assert_eq!(u.state(), LIVE);
        assert_eq!(u.home(), 3);
    }

    #[test]
    fn registry_spans_and_iterates_once() {
        let map = UnitMap::new(1024);
        map.insert(unit(0, 0));
        map.insert(unit(300, 0));
        map.insert(unit(512, 3));
        assert_eq!(map.get(300).map(Unit::index), Some(300));
        assert_eq!(map.get(517).map(Unit::index), Some(512));
        assert!(map.get(1).is_none());
        assert!(map.get(4096).is_none());
        let seen: Vec<u64> = map.iter().map(Unit::index).collect();
        assert_eq!(seen, vec![0, 300, 512]);
    }
}
