//! Per-core object recycler.
//!
//! Every `(core, context)` slot owns a [`MagPair`] reached without a lock.
//! Overflow moves whole magazines to and from a per-core [`Depot`] under a
//! short mutex. Objects freed on a core other than the one they belong to
//! go through that core's remote-return pair, never its hot slots.
//!
//! - `alloc` fast path: pop slot 0 of the local pair.
//! - `alloc` miss: swap in a full magazine from the depot, then drain the
//!   remote-return pair, then report a miss to the caller. A busy slot is
//!   served from the remote-return pair, refilled from the depot.
//! - `free` fast path: push onto the local pair.
//! - `free` spill: when both magazines fill, the older one moves to the depot.
//!
//! Lock order: remote-return pair before depot.

mod pair;

pub use pair::{Depot, MagPair, Magazine, MAG_DEPTH};

use crate::error::IntegrityViolation;
use crate::host::Topology;
use crate::sync::{ExclusiveCell, Mutex};
use std::sync::Arc;

pub struct MagAllocator<T> {
    topology: Arc<dyn Topology>,
    cores: usize,
    slots: Box<[ExclusiveCell<MagPair<T>>]>,
    depots: Box<[Mutex<Depot<T>>]>,
    remote: Box<[Mutex<MagPair<T>>]>,
}

impl<T: Send> MagAllocator<T> {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        let cores = topology.num_cores().max(1);
        MagAllocator {
            topology,
            cores,
            slots: (0..cores * 2).map(|_| ExclusiveCell::new(MagPair::new())).collect(),
            depots: (0..cores).map(|_| Mutex::new(Depot::new())).collect(),
            remote: (0..cores).map(|_| Mutex::new(MagPair::new())).collect(),
        }
    }

    #[inline]
    pub fn num_cores(&self) -> usize {
        self.cores
    }

    #[inline]
    fn current_core(&self) -> usize {
        self.topology.current_core() % self.cores
    }

    /// Take a cached object. `None` is a miss: the caller must source a new
    /// object itself.
    pub fn alloc(&self) -> Option<T> {
        let core = self.current_core();
        let slot = self.topology.current_context().slot(core);
        match self.slots[slot].try_enter() {
            Some(mut pair) => {
                if pair.is_empty() {
                    self.refill(core, &mut pair);
                }
                pair.alloc()
            }
            // Slot already entered on this index; serve from the locked pair.
            None => {
                let mut remote = self.remote[core].lock();
                if remote.is_empty() {
                    self.load_from_depot(core, &mut remote);
                }
                remote.alloc()
            }
        }
    }

    /// Return `obj`, which was allocated on `home_core`.
    pub fn free(&self, obj: T, home_core: usize) {
        let home = home_core % self.cores;
        let core = self.current_core();
        if home == core {
            let slot = self.topology.current_context().slot(core);
            if let Some(mut pair) = self.slots[slot].try_enter() {
                self.push(core, &mut pair, obj);
                return;
            }
        }
        let mut remote = self.remote[home].lock();
        self.push(home, &mut remote, obj);
    }

    fn push(&self, core: usize, pair: &mut MagPair<T>, obj: T) {
        let mut obj = obj;
        loop {
            match pair.free(obj) {
                Ok(false) => return,
                Ok(true) => {
                    self.spill(core, pair);
                    return;
                }
                Err(back) => {
                    self.spill(core, pair);
                    obj = back;
                }
            }
        }
    }

    #[cold]
    fn spill(&self, core: usize, pair: &mut MagPair<T>) {
        let mut depot = self.depots[core].lock();
        let empty = depot.take_empty();
        let full = pair.spill(empty);
        depot.push_full(full);
        log::trace!("dmacache: core {} spilled a magazine to its depot", core);
    }

    #[cold]
    fn refill(&self, core: usize, pair: &mut MagPair<T>) {
        if self.load_from_depot(core, pair) {
            return;
        }
        let mut remote = self.remote[core].lock();
        if pair.take_from(&mut remote) {
            log::trace!("dmacache: core {} drained remote returns", core);
        }
    }

    /// Swap a full depot magazine into the empty `pair`.
    fn load_from_depot(&self, core: usize, pair: &mut MagPair<T>) -> bool {
        let mut depot = self.depots[core].lock();
        match depot.pop_full() {
            Some(full) => {
                let empty = pair.load(full);
                depot.push_empty(empty);
                log::trace!("dmacache: core {} refilled from its depot", core);
                true
            }
            None => false,
        }
    }

    /// `(full, empty)` magazines held by the depot of `core`.
    pub fn depot_counts(&self, core: usize) -> (usize, usize) {
        self.depots[core % self.cores].lock().counts()
    }

    /// Objects cached anywhere in the allocator. Slots that are entered
    /// concurrently are skipped, so the figure is exact only when quiescent.
    pub fn cached_objects(&self) -> usize {
        let local: usize = self
            .slots
            .iter()
            .filter_map(|s| s.try_enter().map(|p| p.count()))
            .sum();
        let remote: usize = self.remote.iter().map(|r| r.lock().count()).sum();
        let depot: usize = self.depots.iter().map(|d| d.lock().cached_objects()).sum();
        local + remote + depot
    }

    /// Verify every pair and depot holds its structural invariants.
    pub fn check_invariants(&self) -> Result<(), IntegrityViolation> {
        for slot in self.slots.iter() {
            if let Some(pair) = slot.try_enter() {
                if !pair.is_consistent() {
                    return Err(IntegrityViolation::CorruptCache {
                        what: "local magazine pair out of balance",
                    });
                }
            }
        }
        for remote in self.remote.iter() {
            if !remote.lock().is_consistent() {
                return Err(IntegrityViolation::CorruptCache {
                    what: "remote magazine pair out of balance",
                });
            }
        }
        for depot in self.depots.iter() {
            if !depot.lock().is_consistent() {
                return Err(IntegrityViolation::CorruptCache {
                    what: "depot holds a partially filled magazine",
                });
            }
        }
        Ok(())
    }
}
