//! Per-core allocation counters. Purely observational: nothing in the
//! allocator reads them.

use crate::host::ExecContext;
use crate::util::ORDER_MAX;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Alloc,
    Free,
}

#[repr(align(64))]
#[derive(Default)]
struct CoreStats {
    alloc: [[AtomicU64; 2]; ORDER_MAX],
    free: [[AtomicU64; 2]; ORDER_MAX],
}

pub struct AllocStats {
    cores: Box<[CoreStats]>,
}

impl AllocStats {
    pub fn new(cores: usize) -> Self {
        AllocStats {
            cores: (0..cores.max(1)).map(|_| CoreStats::default()).collect(),
        }
    }

    /// Count one event of page order `order`. Orders past the table share
    /// its last row.
    #[inline]
    pub fn record(&self, core: usize, ctx: ExecContext, order: u32, event: Event) {
        let stats = &self.cores[core % self.cores.len()];
        let row = (order as usize).min(ORDER_MAX - 1);
        let col = ctx.slot(0);
        let table = match event {
            Event::Alloc => &stats.alloc,
            Event::Free => &stats.free,
        };
        table[row][col].fetch_add(1, Ordering::Relaxed);
    }

    pub fn core_snapshot(&self, core: usize) -> StatsSnapshot {
        let mut snap = StatsSnapshot::default();
        snap.add(&self.cores[core % self.cores.len()]);
        snap
    }

    /// Sum over every core.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::default();
        for core in self.cores.iter() {
            snap.add(core);
        }
        snap
    }
}

/// Counts indexed `[order][context]`, context 0 thread and 1 interrupt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub alloc: [[u64; 2]; ORDER_MAX],
    pub free: [[u64; 2]; ORDER_MAX],
}

impl StatsSnapshot {
    fn add(&mut self, core: &CoreStats) {
        for order in 0..ORDER_MAX {
            for ctx in 0..2 {
                self.alloc[order][ctx] += core.alloc[order][ctx].load(Ordering::Relaxed);
                self.free[order][ctx] += core.free[order][ctx].load(Ordering::Relaxed);
            }
        }
    }

    pub fn total_allocs(&self) -> u64 {
        self.alloc.iter().flatten().sum()
    }

    pub fn total_frees(&self) -> u64 {
        self.free.iter().flatten().sum()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for order in 0..ORDER_MAX {
            let [t, i] = self.alloc[order];
            writeln!(f, "alloc order {:<2} {:>10} {:>10} : {:>11}", order, t, i, t + i)?;
            let [t, i] = self.free[order];
            writeln!(f, "free  order {:<2} {:>10} {:>10} : {:>11}", order, t, i, t + i)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_cores_and_clamps_orders() {
        let stats = AllocStats::new(2);
        stats.record(0, ExecContext::Thread, 0, Event::Alloc);
        stats.record(1, ExecContext::Interrupt, 0, Event::Alloc);
        stats.record(1, ExecContext::Thread, 40, Event::Free);
        let snap = stats.snapshot();
        assert_eq!(snap.alloc[0], [1, 1]);
        assert_eq!(snap.free[ORDER_MAX - 1], [1, 0]);
        assert_eq!(snap.total_allocs(), 2);
        assert_eq!(stats.core_snapshot(0).total_frees(), 0);
        assert!(snap.to_string().contains("alloc order 0"));
    }
}
