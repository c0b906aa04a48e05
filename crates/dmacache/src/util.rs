use core::sync::atomic::{AtomicUsize, Ordering};

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Smallest `order` such that `page_size << order >= len`.
#[inline]
pub fn order_for(len: usize) -> u32 {
    let pages = len.div_ceil(page_size()).max(1);
    pages.next_power_of_two().trailing_zeros()
}

/// Runtime page size, read from sysconf(_SC_PAGESIZE) on first use.
/// Zero means "not read yet".
static PAGE_SIZE_CACHED: AtomicUsize = AtomicUsize::new(0);

/// Get the system page size.
#[inline]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE_CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = crate::platform::page_size();
    PAGE_SIZE_CACHED.store(ps, Ordering::Relaxed);
    ps
}

/// log2(page_size).
#[inline]
pub fn page_shift() -> u32 {
    page_size().trailing_zeros()
}

/// Default unit size: 64 KiB.
pub const DEFAULT_UNIT_SHIFT: u32 = 16;

/// Smallest and largest unit sizes accepted by the configuration.
pub const MIN_UNIT_SHIFT: u32 = 12;
pub const MAX_UNIT_SHIFT: u32 = 24;

/// Default fragment granularity in bytes.
pub const DEFAULT_FRAG_ALIGN: usize = 64;

/// Upper bound on localities, fixed by the five locality bits of the address tag.
pub const MAX_LOCALITIES: usize = 32;

/// Default number of units a single `{locality, direction}` key may register.
pub const DEFAULT_MAX_UNITS_PER_KEY: usize = 16 * 1024;

/// Default largest extra order of a single oversized unit.
pub const DEFAULT_MAX_OVERSIZE_ORDER: u32 = 4;

/// Number of order buckets tracked by the allocation statistics.
pub const ORDER_MAX: usize = 7;

/// Largest `max_oversize_order` the configuration accepts.
pub const MAX_OVERSIZE_ORDER: u32 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_granularity() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(100, 64), 128);
        assert_eq!(align_up(65300, 64), 65344);
    }

    #[test]
    fn order_for_page_multiples() {
        let ps = page_size();
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(ps), 0);
        assert_eq!(order_for(ps + 1), 1);
        assert_eq!(order_for(ps * 4), 2);
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(1usize << page_shift(), page_size());
    }
}
