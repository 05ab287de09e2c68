//! Scheduler and VM page shims.
//!
//! The only unsafe code in the crate: two libc calls with no memory footprint.

#[allow(unsafe_code)]
#[cfg(unix)]
pub fn lower_thread_priority() {
    // SAFETY: nice(2) takes and returns plain integers and touches no memory.
    // On Linux the adjustment applies to the calling thread only, which is
    // exactly what the per-core workers want. A return of -1 is ambiguous
    // (legal niceness or error) and deliberately ignored; running at normal
    // priority is a degradation, not a failure.
    unsafe {
        libc::nice(19);
    }
}

#[cfg(not(unix))]
pub fn lower_thread_priority() {}

/// System page size in bytes.
#[allow(unsafe_code)]
#[cfg(unix)]
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf(2) reads a constant; no pointers involved.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        usize::try_from(raw).unwrap_or(4096)
    } else {
        4096
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn page_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let page = page_size();
        assert!(page >= 512, "page size too small: {page}");
        assert!(page.is_power_of_two(), "page size not a power of two: {page}");
    }

    #[test]
    fn lowering_priority_does_not_panic() {
        lower_thread_priority();
    }
}
