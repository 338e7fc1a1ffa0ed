//! Types shared by the platform pollers.

/// Readable readiness.
pub const EV_IN: u32 = 0x001;

/// Writable readiness.
pub const EV_OUT: u32 = 0x004;

/// Error condition on the descriptor.
pub const EV_ERR: u32 = 0x008;

/// Peer hang-up.
pub const EV_HUP: u32 = 0x010;

/// Edge-triggered registration. Honored by the Linux backend, which passes
/// masks to the kernel unchanged; BSD registrations always use `EV_CLEAR`.
pub const EV_ET: u32 = 1 << 31;

/// Maximum completion records fetched from the OS per wait call.
pub(crate) const EV_BATCH_SIZE: usize = 128;

/// Token of completions the dispatcher must silently skip (the BSD wake
/// user-event carries it).
pub(crate) const IGNORE_TOKEN: u64 = 0;

/// First token value owned by the callback table. The range below is
/// reserved for internal signalling.
pub(crate) const RESERVED_BASE: u64 = 1024;

/// Builds the kernel user-data for a table registration.
///
/// The low half addresses the slot (offset past the reserved range), the
/// high half carries the slot generation so a completion from a previous
/// registration of the same slot can be told apart after reuse.
pub(crate) fn pack_token(slot: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | (slot as u64 + RESERVED_BASE)
}

/// One completion record surfaced by a platform poller.
pub(crate) enum Completion {
    /// Readiness on a registered file descriptor.
    Io { token: u64, mask: u32, error: i32 },

    /// A kqueue timer filter firing, carrying the periodic-timer id.
    #[cfg(any(target_os = "freebsd", target_os = "macos"))]
    Timer { id: u64 },
}
