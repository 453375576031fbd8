//! Small system helpers shared by the buffers.

use std::sync::OnceLock;

/// Machine word size; every input frame starts at a word boundary.
pub(crate) const WORD: usize = std::mem::size_of::<usize>();

/// Rounds `n` up to the next multiple of `align`. `align` must be a power
/// of two.
#[inline]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Returns the VM page size, queried once and cached.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    4096
}

/// Hints to the OS that all pages of `buf` past the first are not needed
/// yet, so a large buffer does not commit physical memory it never touches.
#[cfg(unix)]
pub(crate) fn release_tail_pages(buf: &mut [u8]) {
    let page = page_size();
    if buf.len() <= page {
        return;
    }
    // SAFETY: the range [page, len) lies within the live allocation; the
    // pages are refilled on demand and their prior contents are never read.
    unsafe {
        libc::madvise(
            buf.as_mut_ptr().add(page).cast::<libc::c_void>(),
            buf.len() - page,
            libc::MADV_DONTNEED,
        );
    }
}

#[cfg(not(unix))]
pub(crate) fn release_tail_pages(_buf: &mut [u8]) {}
