//! Offset-sensitive prefix of the thread control block
//!
//! Generated code reaches into the control block by fixed offset (allocation
//! helpers bump `alloc_context`, transition stubs store `transition_frame`
//! directly). These fields live in [`ThreadBuffer`], a `#[repr(C)]` struct that
//! is always the first member of [`Thread`](crate::Thread). Its size and the
//! offsets below are checked at compile time for every supported word size.
//!
//! | field                      | 64-bit | 32-bit |
//! |----------------------------|--------|--------|
//! | `alloc_context`            | 0      | 0      |
//! | `state_flags`              | 56     | 40     |
//! | `transition_frame`         | 64     | 44     |
//! | `pinvoke_tunnel`           | 72     | 48     |
//! | `cached_transition_frame`  | 80     | 52     |
//! | `hijacked_return_location` | 88     | 56     |
//! | `hijacked_return_address`  | 96     | 60     |
//! | `ex_info_head`             | 104    | 64     |
//! | `stack_low`                | 112    | 68     |
//! | `stack_high`               | 120    | 72     |
//! | size                       | 128    | 80     |

use crate::alloc_context::AllocContext;
use crate::context::TransitionFrame;
use crate::exinfo::ExInfo;
use crate::flags::ThreadStateFlags;
use std::cell::UnsafeCell;
use std::mem::{offset_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// Fixed-layout leading portion of the control block
#[repr(C)]
pub struct ThreadBuffer {
    /// Bump-pointer allocation cache, written only by the owner
    pub(crate) alloc_context: UnsafeCell<AllocContext>,
    /// [`ThreadStateFlags`] bits
    pub(crate) state_flags: AtomicU32,
    /// Committed transition frame; null while cooperative
    pub(crate) transition_frame: AtomicPtr<TransitionFrame>,
    /// Frame staged by the most recent preemptive transition or allocation helper
    pub(crate) pinvoke_tunnel: AtomicPtr<TransitionFrame>,
    /// Frame snapshotted by the suspending thread
    pub(crate) cached_transition_frame: AtomicPtr<TransitionFrame>,
    /// Stack slot holding the patched return address while hijacked
    pub(crate) hijacked_return_location: AtomicPtr<AtomicUsize>,
    /// Original return address while a hijack is armed or in flight
    pub(crate) hijacked_return_address: AtomicUsize,
    /// Head of the exception-info chain
    pub(crate) ex_info_head: AtomicPtr<ExInfo>,
    /// Lowest stack address
    pub(crate) stack_low: AtomicUsize,
    /// One past the highest stack address
    pub(crate) stack_high: AtomicUsize,
}

impl ThreadBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            alloc_context: UnsafeCell::new(AllocContext::new()),
            state_flags: AtomicU32::new(ThreadStateFlags::UNKNOWN.bits()),
            transition_frame: AtomicPtr::new(ptr::null_mut()),
            pinvoke_tunnel: AtomicPtr::new(ptr::null_mut()),
            cached_transition_frame: AtomicPtr::new(ptr::null_mut()),
            hijacked_return_location: AtomicPtr::new(ptr::null_mut()),
            hijacked_return_address: AtomicUsize::new(0),
            ex_info_head: AtomicPtr::new(ptr::null_mut()),
            stack_low: AtomicUsize::new(0),
            stack_high: AtomicUsize::new(0),
        }
    }

    /// Current state flags
    #[inline]
    pub(crate) fn flags(&self) -> ThreadStateFlags {
        ThreadStateFlags::from_bits_retain(self.state_flags.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_flags(&self, flags: ThreadStateFlags) {
        self.state_flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flags(&self, flags: ThreadStateFlags) {
        self.state_flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// Byte offsets of the prefix fields, as consumed by generated code
pub mod offsets {
    #[cfg(target_pointer_width = "64")]
    mod imp {
        pub const STATE_FLAGS: usize = 56;
        pub const TRANSITION_FRAME: usize = 64;
        pub const PINVOKE_TUNNEL: usize = 72;
        pub const CACHED_TRANSITION_FRAME: usize = 80;
        pub const HIJACKED_RETURN_LOCATION: usize = 88;
        pub const HIJACKED_RETURN_ADDRESS: usize = 96;
        pub const EX_INFO_HEAD: usize = 104;
        pub const STACK_LOW: usize = 112;
        pub const STACK_HIGH: usize = 120;
        pub const SIZE: usize = 128;
    }

    #[cfg(target_pointer_width = "32")]
    mod imp {
        pub const STATE_FLAGS: usize = 40;
        pub const TRANSITION_FRAME: usize = 44;
        pub const PINVOKE_TUNNEL: usize = 48;
        pub const CACHED_TRANSITION_FRAME: usize = 52;
        pub const HIJACKED_RETURN_LOCATION: usize = 56;
        pub const HIJACKED_RETURN_ADDRESS: usize = 60;
        pub const EX_INFO_HEAD: usize = 64;
        pub const STACK_LOW: usize = 68;
        pub const STACK_HIGH: usize = 72;
        pub const SIZE: usize = 80;
    }

    /// Offset of the allocation context
    pub const ALLOC_CONTEXT: usize = 0;
    /// Offset of the state flags word
    pub const STATE_FLAGS: usize = imp::STATE_FLAGS;
    /// Offset of the committed transition frame pointer
    pub const TRANSITION_FRAME: usize = imp::TRANSITION_FRAME;
    /// Offset of the staged transition frame pointer
    pub const PINVOKE_TUNNEL: usize = imp::PINVOKE_TUNNEL;
    /// Offset of the suspend-time cached frame pointer
    pub const CACHED_TRANSITION_FRAME: usize = imp::CACHED_TRANSITION_FRAME;
    /// Offset of the hijacked return-address location
    pub const HIJACKED_RETURN_LOCATION: usize = imp::HIJACKED_RETURN_LOCATION;
    /// Offset of the saved original return address
    pub const HIJACKED_RETURN_ADDRESS: usize = imp::HIJACKED_RETURN_ADDRESS;
    /// Offset of the exception-info chain head
    pub const EX_INFO_HEAD: usize = imp::EX_INFO_HEAD;
    /// Offset of the low stack bound
    pub const STACK_LOW: usize = imp::STACK_LOW;
    /// Offset of the high stack bound
    pub const STACK_HIGH: usize = imp::STACK_HIGH;
    /// Total size of the prefix
    pub const SIZE: usize = imp::SIZE;
}

const _: () = assert!(size_of::<AllocContext>() == crate::defaults::ALLOC_CONTEXT_SIZE);
const _: () = assert!(size_of::<ThreadBuffer>() == offsets::SIZE);
const _: () = assert!(offset_of!(ThreadBuffer, alloc_context) == offsets::ALLOC_CONTEXT);
const _: () = assert!(offset_of!(ThreadBuffer, state_flags) == offsets::STATE_FLAGS);
const _: () = assert!(offset_of!(ThreadBuffer, transition_frame) == offsets::TRANSITION_FRAME);
const _: () = assert!(offset_of!(ThreadBuffer, pinvoke_tunnel) == offsets::PINVOKE_TUNNEL);
const _: () = assert!(
    offset_of!(ThreadBuffer, cached_transition_frame) == offsets::CACHED_TRANSITION_FRAME
);
const _: () = assert!(
    offset_of!(ThreadBuffer, hijacked_return_location) == offsets::HIJACKED_RETURN_LOCATION
);
const _: () = assert!(
    offset_of!(ThreadBuffer, hijacked_return_address) == offsets::HIJACKED_RETURN_ADDRESS
);
const _: () = assert!(offset_of!(ThreadBuffer, ex_info_head) == offsets::EX_INFO_HEAD);
const _: () = assert!(offset_of!(ThreadBuffer, stack_low) == offsets::STACK_LOW);
const _: () = assert!(offset_of!(ThreadBuffer, stack_high) == offsets::STACK_HIGH);
