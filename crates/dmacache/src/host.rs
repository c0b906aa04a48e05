//! Collaborators supplied by the host: raw pages, bus mappings and CPU
//! topology. The cache only talks to them through these traits.

use crate::error::HostError;
use crate::platform;
use crate::util::{is_aligned, page_size};
use bitflags::bitflags;
use core::cell::Cell;
use core::ptr::NonNull;
use std::sync::Arc;

/// Which way a transfer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The device reads the buffer (CPU to device).
    ToDevice,
    /// The device writes the buffer (device to CPU).
    FromDevice,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::ToDevice, Direction::FromDevice];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Direction::ToDevice => 0,
            Direction::FromDevice => 1,
        }
    }

    #[inline]
    pub const fn from_index(bit: usize) -> Direction {
        if bit & 1 == 0 {
            Direction::ToDevice
        } else {
            Direction::FromDevice
        }
    }

    /// Data must reach the device before it runs.
    #[inline]
    pub const fn device_reads(self) -> bool {
        matches!(self, Direction::ToDevice)
    }

    /// Data produced by the device must reach the CPU afterwards.
    #[inline]
    pub const fn device_writes(self) -> bool {
        matches!(self, Direction::FromDevice)
    }
}

/// Execution context on a core. Each core gets one slot per context so an
/// interrupt never touches the state of the thread it preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecContext {
    Thread,
    Interrupt,
}

impl ExecContext {
    /// Index of the `(core, context)` slot.
    #[inline]
    pub const fn slot(self, core: usize) -> usize {
        (core << 1)
            | match self {
                ExecContext::Thread => 0,
                ExecContext::Interrupt => 1,
            }
    }
}

bitflags! {
    /// Page allocation modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Caller may be in interrupt context; never sleep.
        const ATOMIC = 1 << 0;
        /// Fail instead of reclaiming or retrying.
        const NO_RETRY = 1 << 1;
        /// Do not log failures.
        const NO_WARN = 1 << 2;
        /// Return zeroed memory.
        const ZERO = 1 << 3;
        /// Hand out the block as a single compound unit.
        const COMPOUND = 1 << 4;
    }
}

impl AllocFlags {
    /// Mode used when growing the cache: no waiting, no reclaim.
    pub const CACHE_REFILL: AllocFlags = AllocFlags::ATOMIC
        .union(AllocFlags::NO_RETRY)
        .union(AllocFlags::NO_WARN)
        .union(AllocFlags::COMPOUND);
}

/// A block of `page_size << order` bytes, aligned to its own size.
#[derive(Debug)]
pub struct HostPages {
    ptr: NonNull<u8>,
    order: u32,
    locality: u8,
}

unsafe impl Send for HostPages {}

impl HostPages {
    /// # Safety
    /// `ptr` must point to `page_size << order` bytes owned by the allocator
    /// that will receive this block back, aligned to that size.
    pub unsafe fn from_raw(ptr: NonNull<u8>, order: u32, locality: u8) -> Self {
        HostPages {
            ptr,
            order,
            locality,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[inline]
    pub fn len(&self) -> usize {
        page_size() << self.order
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Locality the memory was taken from.
    #[inline]
    pub fn locality(&self) -> u8 {
        self.locality
    }
}

/// Supplies raw memory on a cache miss.
pub trait PageAllocator: Send + Sync {
    fn allocate(&self, order: u32, flags: AllocFlags) -> Result<HostPages, HostError>;

    fn free(&self, pages: HostPages);
}

/// Makes host pages visible to the device.
pub trait BusMapper: Send + Sync {
    /// Map `[offset, offset + size)` of `pages` at device address `iova`.
    /// Returns the address the device must use.
    fn map(
        &self,
        pages: &HostPages,
        offset: usize,
        size: usize,
        dir: Direction,
        iova: u64,
    ) -> Result<u64, HostError>;

    fn unmap(&self, iova: u64, size: usize, dir: Direction);
}

/// Where the caller is running.
pub trait Topology: Send + Sync {
    fn num_cores(&self) -> usize;

    fn current_core(&self) -> usize;

    fn current_context(&self) -> ExecContext;

    fn current_locality(&self) -> u8;

    fn locality_of(&self, pages: &HostPages) -> u8 {
        pages.locality()
    }
}

/// Pages from anonymous mmap, aligned to their size.
#[derive(Debug, Default)]
pub struct SystemPages;

impl PageAllocator for SystemPages {
    fn allocate(&self, order: u32, _flags: AllocFlags) -> Result<HostPages, HostError> {
        // mmap never sleeps on reclaim for anonymous memory, so every flag
        // combination is served the same way; memory is always zeroed.
        let size = page_size() << order;
        let ptr = unsafe { platform::map_aligned(size, size) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(unsafe { HostPages::from_raw(ptr, order, 0) }),
            None => Err(HostError::OutOfMemory { order }),
        }
    }

    fn free(&self, pages: HostPages) {
        unsafe { platform::unmap(pages.as_ptr().as_ptr(), pages.len()) };
    }
}

/// A bus without translation hardware: every page-aligned IOVA is accepted.
#[derive(Debug, Default)]
pub struct IdentityBusMapper;

impl BusMapper for IdentityBusMapper {
    fn map(
        &self,
        _pages: &HostPages,
        offset: usize,
        _size: usize,
        _dir: Direction,
        iova: u64,
    ) -> Result<u64, HostError> {
        for addr in [offset, iova as usize] {
            if !is_aligned(addr, page_size()) {
                return Err(HostError::Unaligned {
                    addr,
                    align: page_size(),
                });
            }
        }
        Ok(iova)
    }

    fn unmap(&self, _iova: u64, _size: usize, _dir: Direction) {}
}

thread_local! {
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` as interrupt context on the current core, e.g. from a signal
/// handler that allocates.
pub fn with_interrupt_context<R>(f: impl FnOnce() -> R) -> R {
    let prev = IN_INTERRUPT.with(|c| c.replace(true));
    let out = f();
    IN_INTERRUPT.with(|c| c.set(prev));
    out
}

/// The machine the process runs on, as a single locality.
#[derive(Debug)]
pub struct SystemTopology {
    cores: usize,
}

impl SystemTopology {
    pub fn new() -> Self {
        SystemTopology {
            cores: platform::num_cpus(),
        }
    }
}

impl Default for SystemTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology for SystemTopology {
    fn num_cores(&self) -> usize {
        self.cores
    }

    fn current_core(&self) -> usize {
        platform::current_cpu() % self.cores
    }

    fn current_context(&self) -> ExecContext {
        if IN_INTERRUPT.with(|c| c.get()) {
            ExecContext::Interrupt
        } else {
            ExecContext::Thread
        }
    }

    fn current_locality(&self) -> u8 {
        0
    }
}

/// The collaborators one device cache is built from.
#[derive(Clone)]
pub struct Host {
    pub pages: Arc<dyn PageAllocator>,
    pub bus: Arc<dyn BusMapper>,
    pub topology: Arc<dyn Topology>,
}

impl Host {
    pub fn new(
        pages: Arc<dyn PageAllocator>,
        bus: Arc<dyn BusMapper>,
        topology: Arc<dyn Topology>,
    ) -> Self {
        Host {
            pages,
            bus,
            topology,
        }
    }

    /// mmap-backed pages, no IOMMU, the real CPU topology.
    pub fn system() -> Self {
        Host::new(
            Arc::new(SystemPages),
            Arc::new(IdentityBusMapper),
            Arc::new(SystemTopology::new()),
        )
    }
}

impl core::fmt::Debug for Host {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Host")
            .field("cores", &self.topology.num_cores())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_pages_are_aligned_to_their_size() {
        let pages = SystemPages.allocate(4, AllocFlags::CACHE_REFILL).unwrap();
        let addr = pages.as_ptr().as_ptr() as usize;
        assert_eq!(addr % pages.len(), 0);
        unsafe { pages.as_ptr().as_ptr().write_bytes(0xAB, pages.len()) };
        SystemPages.free(pages);
    }

    #[test]
    fn slots_split_by_context() {
        assert_eq!(ExecContext::Thread.slot(3), 6);
        assert_eq!(ExecContext::Interrupt.slot(3), 7);
    }

    #[test]
    fn interrupt_scope_is_restored() {
        let topo = SystemTopology::new();
        assert_eq!(topo.current_context(), ExecContext::Thread);
        with_interrupt_context(|| assert_eq!(topo.current_context(), ExecContext::Interrupt));
        assert_eq!(topo.current_context(), ExecContext::Thread);
    }

    #[test]
    fn identity_bus_refuses_unaligned_iova() {
        let pages = SystemPages.allocate(0, AllocFlags::CACHE_REFILL).unwrap();
        let bus = IdentityBusMapper;
        let base = 1u64 << 40;
        assert_eq!(bus.map(&pages, 0, pages.len(), Direction::ToDevice, base), Ok(base));
        assert!(matches!(
            bus.map(&pages, 0, pages.len(), Direction::ToDevice, base + 64),
            Err(HostError::Unaligned { align, .. }) if align == page_size()
        ));
        SystemPages.free(pages);
    }
}
