//! Register snapshots, transition frames and root slots
//!
//! These are the value types exchanged between a thread, the collector and the
//! stack walker. Transition frames are `#[repr(C)]` because generated code
//! builds them in place on the stack before publishing their address.

use bitflags::bitflags;
use std::ptr::NonNull;

/// A managed object reference as stored in a stack slot or register
///
/// Null is the zero word. The thread core never dereferences object
/// references; it only reports where they live.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null reference
    pub const NULL: Self = ObjectRef(0);

    /// Wrap a raw object address
    pub const fn from_addr(addr: usize) -> Self {
        ObjectRef(addr)
    }

    /// Raw object address
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Check for the null reference
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Minimal register state needed to start a stack walk
///
/// Captured for a suspended thread by the platform layer, or at throw time
/// for an exception dispatch record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitedContext {
    /// Instruction pointer
    pub ip: usize,
    /// Stack pointer
    pub sp: usize,
    /// Frame pointer
    pub fp: usize,
}

impl LimitedContext {
    /// Create a context from raw register values
    pub const fn new(ip: usize, sp: usize, fp: usize) -> Self {
        Self { ip, sp, fp }
    }
}

bitflags! {
    /// What a transition frame saved besides the call boundary itself
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u32 {
        /// `return_value` holds the saved return register
        const SAVE_RETURN_VALUE = 0x0001;
        /// The saved return register is an object reference
        const RETURN_IS_GC_REF = 0x0002;
        /// The saved return register is an interior reference
        const RETURN_IS_BYREF = 0x0004;
        /// Frame was built by a hijack trampoline
        const HIJACK_LANDING = 0x0100;
    }
}

/// Snapshot of the last walkable call boundary of a thread outside managed code
///
/// Owned by the code that performs the transition, normally as a stack local
/// that outlives the preemptive region it describes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionFrame {
    /// Return address into the managed caller
    pub return_address: usize,
    /// Frame pointer of the managed caller
    pub frame_pointer: usize,
    /// Stack pointer at the call boundary
    pub stack_pointer: usize,
    /// Saved-state flags
    pub flags: FrameFlags,
    /// Saved return register, meaningful when `SAVE_RETURN_VALUE` is set
    pub return_value: ObjectRef,
}

impl TransitionFrame {
    /// Capture a call boundary
    pub const fn capture(return_address: usize, stack_pointer: usize, frame_pointer: usize) -> Self {
        Self {
            return_address,
            frame_pointer,
            stack_pointer,
            flags: FrameFlags::empty(),
            return_value: ObjectRef::NULL,
        }
    }

    /// Check whether the saved return register must be reported to the collector
    pub fn reports_return_value(&self) -> bool {
        self.flags.contains(FrameFlags::SAVE_RETURN_VALUE)
            && self
                .flags
                .intersects(FrameFlags::RETURN_IS_GC_REF | FrameFlags::RETURN_IS_BYREF)
    }
}

/// A committed transition frame, as observed through a control block
///
/// Only valid to read while the owning thread stays preemptive, which the
/// suspension protocol guarantees for as long as the collector holds threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedFrame(NonNull<TransitionFrame>);

impl PublishedFrame {
    pub(crate) fn new(ptr: NonNull<TransitionFrame>) -> Self {
        PublishedFrame(ptr)
    }

    /// Raw frame address
    pub fn as_ptr(self) -> *mut TransitionFrame {
        self.0.as_ptr()
    }

    /// Read the frame
    ///
    /// # Safety
    ///
    /// The owning thread must still be preemptive (or parked) with this frame
    /// committed, so that the frame's storage is alive.
    pub unsafe fn read(self) -> TransitionFrame {
        *self.0.as_ptr()
    }
}

bitflags! {
    /// How the collector must treat a reported slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RootFlags: u32 {
        /// Slot holds an interior pointer
        const INTERIOR = 0x1;
        /// Referent must not move
        const PINNED = 0x2;
    }
}

/// Location of a live reference reported during root scanning
///
/// The collector may rewrite the slot while the owning thread is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot {
    /// Address of the reference
    pub slot: NonNull<ObjectRef>,
    /// Reporting flags
    pub flags: RootFlags,
}

impl RootSlot {
    /// Report an ordinary reference slot
    pub fn new(slot: NonNull<ObjectRef>) -> Self {
        Self {
            slot,
            flags: RootFlags::empty(),
        }
    }

    /// Report a slot with explicit flags
    pub fn with_flags(slot: NonNull<ObjectRef>, flags: RootFlags) -> Self {
        Self { slot, flags }
    }

    /// Read the reference currently stored in the slot
    ///
    /// # Safety
    ///
    /// The slot must still be alive, i.e. its owner must remain parked.
    pub unsafe fn load(&self) -> ObjectRef {
        *self.slot.as_ptr()
    }
}

/// Address range of a thread's stack, `low` inclusive, `high` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackBounds {
    /// Lowest usable address
    pub low: usize,
    /// One past the highest usable address
    pub high: usize,
}

impl StackBounds {
    /// Create bounds from an explicit range
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Approximate the current thread's stack from the address of a local
    ///
    /// The platform layer normally supplies exact bounds; this estimate assumes
    /// a downward-growing stack of `size_hint` bytes with the caller near its top.
    pub fn estimate_current(size_hint: usize) -> Self {
        const PAGE: usize = 4096;
        let marker = 0u8;
        let here = std::hint::black_box(&marker) as *const u8 as usize;
        let high = (here + 16 * PAGE) & !(PAGE - 1);
        Self {
            low: high.saturating_sub(size_hint),
            high,
        }
    }

    /// Check whether an address lies on this stack
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.low && addr < self.high
    }

    /// Check whether bounds have been recorded
    pub fn is_known(&self) -> bool {
        self.high > self.low
    }
}
