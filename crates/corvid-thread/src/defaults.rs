//! Default constants for the thread core.
//!
//! Values that generated code depends on (sizes, flag bits) live here next to
//! the tunable defaults used by [`RuntimeConfig`](crate::RuntimeConfig).

/// Size in bytes of the allocation context on 64-bit targets.
///
/// Kept at the server-GC size regardless of the collector flavour so that
/// field offsets after it never change between runtime builds.
pub const ALLOC_CONTEXT_SIZE_64: usize = 56;

/// Size in bytes of the allocation context on 32-bit targets.
pub const ALLOC_CONTEXT_SIZE_32: usize = 40;

/// Size of the allocation context for the current target.
#[cfg(target_pointer_width = "64")]
pub const ALLOC_CONTEXT_SIZE: usize = ALLOC_CONTEXT_SIZE_64;

/// Size of the allocation context for the current target.
#[cfg(target_pointer_width = "32")]
pub const ALLOC_CONTEXT_SIZE: usize = ALLOC_CONTEXT_SIZE_32;

/// High bit marking a TLS offset as belonging to a dynamically loaded type.
pub const DYNAMIC_TYPE_TLS_OFFSET_FLAG: u32 = 0x8000_0000;

/// Marker stored as the return address of the outermost frame.
pub const TOP_OF_STACK_MARKER: usize = usize::MAX;

/// Default interval the suspending thread sleeps between handshake passes (microseconds).
pub const DEFAULT_SUSPEND_POLL_INTERVAL_US: u64 = 200;

/// Default time after which a still-incomplete suspension is logged (milliseconds).
pub const DEFAULT_SUSPEND_WARN_AFTER_MS: u64 = 1000;

/// Default number of dynamic-type TLS cells allocated on first use.
pub const DEFAULT_INITIAL_TLS_CELLS: u32 = 8;

/// Default stack size assumed when the OS cannot report stack bounds (8 MB).
pub const DEFAULT_STACK_SIZE_HINT: usize = 8 * 1024 * 1024;

/// Prefix for environment-variable configuration.
pub const CONFIG_ENV_PREFIX: &str = "CORVID_";
