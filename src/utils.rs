/// Utility functions for working with packed pidtid values.
///
/// DSO thread sets store (pid, tid) pairs packed into a u64 so they can live
/// in an ordered set:
/// - Upper 32 bits: PID (process ID)
/// - Lower 32 bits: TID (thread ID)
///
/// Sorting the packed values groups the threads of a process together, which
/// the build-id search relies on to avoid retrying the same parent process.
#[inline(always)]
pub const fn pack_pid_tid(pid: u32, tid: u32) -> u64 {
    (pid as u64) << 32 | tid as u64
}

/// Extract the PID from a packed pidtid value.
#[inline(always)]
pub const fn pid_from_packed(packed: u64) -> u32 {
    (packed >> 32) as u32
}

/// Extract the TID from a packed pidtid value.
#[inline(always)]
pub const fn tid_from_packed(packed: u64) -> u32 {
    (packed & 0xFFFFFFFF) as u32
}
