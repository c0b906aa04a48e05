#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

use core::ptr;

/// Map anonymous memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` (or be a page-aligned
/// sub-range of such a mapping) and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Map `size` bytes of zeroed memory aligned to `align`. Returns null on failure.
///
/// Over-maps by `align` and trims the slack on both sides, so the result can
/// be released with a plain `unmap(ptr, size)`.
///
/// # Safety
/// `size` and `align` must be non-zero multiples of the page size, `align` a
/// power of two.
pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    let page = crate::util::page_size();
    if align <= page {
        return map_anonymous(size);
    }
    let total = size + align;
    let base = map_anonymous(total);
    if base.is_null() {
        return ptr::null_mut();
    }
    let start = crate::util::align_up(base as usize, align);
    let head = start - base as usize;
    let tail = total - head - size;
    if head > 0 {
        unmap(base, head);
    }
    if tail > 0 {
        unmap((start + size) as *mut u8, tail);
    }
    start as *mut u8
}

/// System page size.
pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 {
        ps as usize
    } else {
        4096
    }
}

/// Get the number of online CPUs.
pub fn num_cpus() -> usize {
    sys::num_cpus()
}

/// CPU the calling thread is running on right now. Only a hint: the thread
/// may migrate as soon as this returns.
#[inline]
pub fn current_cpu() -> usize {
    sys::current_cpu()
}
