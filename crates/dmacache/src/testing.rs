//! Deterministic host collaborators for tests, fuzzing and benchmarks.
//!
//! [`SimTopology`] reports whatever `(core, context)` the calling thread
//! entered last, so one test thread can act as any core or as an interrupt.
//! [`SimPages`] and [`RecordingBus`] count their calls and can be told to
//! fail or misbehave.

use crate::error::HostError;
use crate::host::{
    AllocFlags, BusMapper, Direction, ExecContext, Host, HostPages, PageAllocator, SystemPages,
    Topology,
};
use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    static CURRENT: Cell<(usize, ExecContext)> = const { Cell::new((0, ExecContext::Thread)) };
}

/// Cores split evenly across localities, lowest cores in locality 0.
#[derive(Debug)]
pub struct SimTopology {
    cores: usize,
    localities: usize,
}

impl SimTopology {
    pub fn new(cores: usize, localities: usize) -> Self {
        SimTopology {
            cores: cores.max(1),
            localities: localities.clamp(1, cores.max(1)),
        }
    }

    /// Run as `core` in `ctx` on this thread until the scope drops.
    pub fn enter(&self, core: usize, ctx: ExecContext) -> Scope {
        let prev = CURRENT.with(|c| c.replace((core % self.cores, ctx)));
        Scope {
            prev,
            _not_send: PhantomData,
        }
    }

    pub fn locality_of_core(&self, core: usize) -> u8 {
        ((core % self.cores) * self.localities / self.cores) as u8
    }
}

/// Restores the previous `(core, context)` of the thread on drop.
pub struct Scope {
    prev: (usize, ExecContext),
    _not_send: PhantomData<*const ()>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

impl Topology for SimTopology {
    fn num_cores(&self) -> usize {
        self.cores
    }

    fn current_core(&self) -> usize {
        CURRENT.with(|c| c.get().0) % self.cores
    }

    fn current_context(&self) -> ExecContext {
        CURRENT.with(|c| c.get().1)
    }

    fn current_locality(&self) -> u8 {
        self.locality_of_core(self.current_core())
    }
}

const UNLIMITED: usize = usize::MAX;

/// Anonymous-mmap pages labelled with the caller's locality.
pub struct SimPages {
    topology: Arc<SimTopology>,
    inner: SystemPages,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    budget: AtomicUsize,
    misplace: AtomicBool,
}

impl SimPages {
    pub fn new(topology: Arc<SimTopology>) -> Self {
        SimPages {
            topology,
            inner: SystemPages,
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            budget: AtomicUsize::new(UNLIMITED),
            misplace: AtomicBool::new(false),
        }
    }

    /// Successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Blocks handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.allocations() - self.frees.load(Ordering::SeqCst)
    }

    /// Allow `n` more allocations, then fail. `None` removes the limit.
    pub fn set_budget(&self, n: Option<usize>) {
        self.budget.store(n.unwrap_or(UNLIMITED), Ordering::SeqCst);
    }

    /// Label new blocks with a locality other than the caller's.
    pub fn set_misplace(&self, on: bool) {
        self.misplace.store(on, Ordering::SeqCst);
    }

    fn take_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| match b {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                b => Some(b - 1),
            })
            .is_ok()
    }
}

impl PageAllocator for SimPages {
    fn allocate(&self, order: u32, flags: AllocFlags) -> Result<HostPages, HostError> {
        if !self.take_budget() {
            return Err(HostError::OutOfMemory { order });
        }
        let pages = self.inner.allocate(order, flags)?;
        let mut locality = self.topology.current_locality();
        if self.misplace.load(Ordering::SeqCst) {
            locality = (locality + 1) % 32;
        }
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(unsafe { HostPages::from_raw(pages.as_ptr(), pages.order(), locality) })
    }

    fn free(&self, pages: HostPages) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.inner.free(pages);
    }
}

/// Accepts every mapping at the requested address unless told otherwise.
#[derive(Debug, Default)]
pub struct RecordingBus {
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    skew: AtomicU64,
    fail: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_calls(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    pub fn live_mappings(&self) -> usize {
        self.map_calls() - self.unmaps.load(Ordering::SeqCst)
    }

    /// Place every later mapping `skew` bytes away from where it was asked.
    pub fn set_skew(&self, skew: u64) {
        self.skew.store(skew, Ordering::SeqCst);
    }

    pub fn set_fail(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }
}

impl BusMapper for RecordingBus {
    fn map(
        &self,
        _pages: &HostPages,
        _offset: usize,
        _size: usize,
        _dir: Direction,
        iova: u64,
    ) -> Result<u64, HostError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostError::MapFailed {
                iova,
                reason: "bus refused the mapping",
            });
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        Ok(iova + self.skew.load(Ordering::SeqCst))
    }

    fn unmap(&self, _iova: u64, _size: usize, _dir: Direction) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
    }
}

/// A simulated machine with handles on every collaborator.
#[derive(Clone)]
pub struct SimHost {
    pub topology: Arc<SimTopology>,
    pub pages: Arc<SimPages>,
    pub bus: Arc<RecordingBus>,
}

impl SimHost {
    pub fn new(cores: usize, localities: usize) -> Self {
        let topology = Arc::new(SimTopology::new(cores, localities));
        SimHost {
            pages: Arc::new(SimPages::new(topology.clone())),
            bus: Arc::new(RecordingBus::new()),
            topology,
        }
    }

    pub fn host(&self) -> Host {
        Host::new(self.pages.clone(), self.bus.clone(), self.topology.clone())
    }

    pub fn enter(&self, core: usize, ctx: ExecContext) -> Scope {
        self.topology.enter(core, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_restore() {
        let topo = SimTopology::new(4, 2);
        assert_eq!(topo.current_core(), 0);
        {
            let _a = topo.enter(3, ExecContext::Thread);
            assert_eq!(topo.current_locality(), 1);
            {
                let _b = topo.enter(1, ExecContext::Interrupt);
                assert_eq!(topo.current_core(), 1);
                assert_eq!(topo.current_context(), ExecContext::Interrupt);
            }
            assert_eq!(topo.current_core(), 3);
        }
        assert_eq!(topo.current_core(), 0);
    }

    #[test]
    fn budget_limits_allocations() {
        let sim = SimHost::new(1, 1);
        sim.pages.set_budget(Some(1));
        let p = sim.pages.allocate(0, AllocFlags::CACHE_REFILL).unwrap();
        assert!(sim.pages.allocate(0, AllocFlags::CACHE_REFILL).is_err());
        sim.pages.free(p);
        assert_eq!(sim.pages.outstanding(), 0);
    }
}
