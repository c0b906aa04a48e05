//! Sparse table of live shadow mappings.
//!
//! Outer level: one array per `{locality, direction}` key, one slot per unit
//! index the key can register. Inner level: a block per unit, created on
//! first use, with one entry per fragment slot of the unit. Both levels are
//! bounded by the cache configuration, so the table never grows past
//! `keys * max_units_per_key` blocks; units recycle, and so do their blocks.

use crate::cache::encoding::Decoded;
use crate::config::CacheConfig;
use crate::error::IntegrityViolation;
use crate::host::Direction;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

const EMPTY: u8 = 0;

/// One live mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub shadow: NonNull<u8>,
    pub real: NonNull<u8>,
    pub len: usize,
    pub dir: Direction,
}

struct Slot {
    /// `EMPTY`, or `1 + direction index` while live.
    state: AtomicU8,
    shadow: AtomicPtr<u8>,
    real: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: AtomicU8::new(EMPTY),
            shadow: AtomicPtr::new(ptr::null_mut()),
            real: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> Option<Entry> {
        let state = self.state.load(Ordering::Acquire);
        if state == EMPTY {
            return None;
        }
        Some(Entry {
            shadow: NonNull::new(self.shadow.load(Ordering::Acquire))?,
            real: NonNull::new(self.real.load(Ordering::Acquire))?,
            len: self.len.load(Ordering::Acquire),
            dir: Direction::from_index(state as usize - 1),
        })
    }
}

struct Block {
    slots: Box<[Slot]>,
}

pub struct ShadowTable {
    keys: Box<[Box<[AtomicPtr<Block>]>]>,
    slots_per_unit: usize,
    frag_shift: u32,
}

impl ShadowTable {
    pub fn new(config: &CacheConfig) -> Self {
        let keys = (0..config.localities * 2)
            .map(|_| {
                (0..config.max_units_per_key)
                    .map(|_| AtomicPtr::new(ptr::null_mut()))
                    .collect()
            })
            .collect();
        ShadowTable {
            keys,
            slots_per_unit: config.slots_per_unit(),
            frag_shift: config.frag_align.trailing_zeros(),
        }
    }

    fn block_ptr(&self, d: &Decoded) -> Option<&AtomicPtr<Block>> {
        self.keys.get(d.tag.key())?.get(d.index as usize)
    }

    fn slot(&self, d: &Decoded) -> Option<&Slot> {
        let block = self.block_ptr(d)?.load(Ordering::Acquire);
        if block.is_null() {
            return None;
        }
        let block = unsafe { &*block };
        block.slots.get(d.offset >> self.frag_shift)
    }

    #[cold]
    fn alloc_block(&self, cell: &AtomicPtr<Block>) -> *mut Block {
        let new = Box::into_raw(Box::new(Block {
            slots: (0..self.slots_per_unit).map(|_| Slot::new()).collect(),
        }));
        match cell.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => new,
            Err(existing) => {
                drop(unsafe { Box::from_raw(new) });
                existing
            }
        }
    }

    /// Record a new mapping for device address `addr`, decoded as `d`.
    pub fn claim(&self, addr: u64, d: &Decoded, entry: Entry) -> Result<(), IntegrityViolation> {
        let cell = self
            .block_ptr(d)
            .ok_or(IntegrityViolation::InvalidAddress { addr })?;
        let mut block = cell.load(Ordering::Acquire);
        if block.is_null() {
            block = self.alloc_block(cell);
        }
        let block = unsafe { &*block };
        let slot = block
            .slots
            .get(d.offset >> self.frag_shift)
            .ok_or(IntegrityViolation::InvalidAddress { addr })?;
        slot.state
            .compare_exchange(
                EMPTY,
                1 + entry.dir.index() as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| IntegrityViolation::EntryInUse { addr })?;
        slot.shadow.store(entry.shadow.as_ptr(), Ordering::Release);
        slot.real.store(entry.real.as_ptr(), Ordering::Release);
        slot.len.store(entry.len, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, d: &Decoded) -> Option<Entry> {
        self.slot(d)?.load()
    }

    /// Remove the mapping at `d`, returning it.
    pub fn clear(&self, d: &Decoded) -> Option<Entry> {
        let slot = self.slot(d)?;
        let entry = slot.load()?;
        let live = 1 + entry.dir.index() as u8;
        slot.state
            .compare_exchange(live, EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(entry)
    }

    /// Live entries across the table. Exact only when quiescent.
    pub fn live_entries(&self) -> usize {
        let mut live = 0;
        for key in self.keys.iter() {
            for cell in key.iter() {
                let block = cell.load(Ordering::Acquire);
                if block.is_null() {
                    continue;
                }
                live += unsafe { &*block }
                    .slots
                    .iter()
                    .filter(|s| s.state.load(Ordering::Acquire) != EMPTY)
                    .count();
            }
        }
        live
    }

    /// Inner blocks allocated so far.
    pub fn blocks(&self) -> usize {
        self.keys
            .iter()
            .flat_map(|k| k.iter())
            .filter(|c| !c.load(Ordering::Relaxed).is_null())
            .count()
    }
}

impl Drop for ShadowTable {
    fn drop(&mut self) {
        for key in self.keys.iter() {
            for cell in key.iter() {
                let block = cell.swap(ptr::null_mut(), Ordering::AcqRel);
                if !block.is_null() {
                    drop(unsafe { Box::from_raw(block) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::encoding::Tag;

    fn at(index: u64, offset: usize) -> Decoded {
        Decoded {
            tag: Tag::new(0, Direction::FromDevice).unwrap(),
            index,
            offset,
        }
    }

    fn entry(buf: &mut [u8; 2], dir: Direction) -> Entry {
        Entry {
            shadow: NonNull::from(&mut buf[0]),
            real: NonNull::from(&mut buf[1]),
            len: 1,
            dir,
        }
    }

    #[test]
    fn claim_get_clear() {
        let table = ShadowTable::new(&CacheConfig::default());
        let mut buf = [0u8; 2];
        let e = entry(&mut buf, Direction::FromDevice);
        assert_eq!(table.get(&at(3, 128)), None);
        table.claim(99, &at(3, 128), e).unwrap();
        assert_eq!(table.get(&at(3, 128)), Some(e));
        assert_eq!(table.get(&at(3, 192)), None);
        assert_eq!(
            table.claim(99, &at(3, 128), e),
            Err(IntegrityViolation::EntryInUse { addr: 99 })
        );
        assert_eq!(table.live_entries(), 1);
        assert_eq!(table.clear(&at(3, 128)), Some(e));
        assert_eq!(table.clear(&at(3, 128)), None);
        assert_eq!(table.blocks(), 1);
    }

    #[test]
    fn out_of_range_index_is_refused() {
        let cfg = CacheConfig {
            max_units_per_key: 16,
            ..CacheConfig::default()
        };
        let table = ShadowTable::new(&cfg);
        let mut buf = [0u8; 2];
        assert!(table
            .claim(0, &at(16, 0), entry(&mut buf, Direction::ToDevice))
            .is_err());
    }
}
