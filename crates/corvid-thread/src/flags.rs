//! Thread state flags
//!
//! Independent bits describing a control block's lifecycle and the
//! restrictions currently placed on it. Detached is terminal.

use bitflags::bitflags;

bitflags! {
    /// Bit set stored in the control block's `state_flags` word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ThreadStateFlags: u32 {
        /// Thread was initialized by its first attach
        const ATTACHED = 0x0000_0001;
        /// Thread was detached; never cleared
        const DETACHED = 0x0000_0002;
        /// Do not inject GC stress on this thread (loader lock, finalizer)
        const SUPPRESS_GC_STRESS = 0x0000_0008;
        /// Do not hijack this thread; also checked by allocation helpers in debug builds
        const DO_NOT_TRIGGER_GC = 0x0000_0010;
        /// Background GC worker thread
        const IS_GC_SPECIAL = 0x0000_0020;
        /// GC stress random generator has been seeded
        const IS_RAND_SEED_SET = 0x0000_0040;
    }
}

impl ThreadStateFlags {
    /// Flags of a freshly constructed control block
    pub const UNKNOWN: Self = Self::empty();
}
