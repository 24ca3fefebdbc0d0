//! Return-address hijacking
//!
//! A cooperative thread spinning in managed code has no upcoming transition
//! the collector could wait for. Hijacking manufactures one: while the thread
//! is stopped, the return address of its innermost managed frame is swapped
//! for the address of a trampoline. When the frame returns, the trampoline
//! calls [`Thread::on_hijack_return`], which parks the thread behind a
//! walkable frame and hands back the real return address.
//!
//! This is the only module that writes return-address slots.
//!
//! ## Hijack state
//!
//! - `hijacked_return_location`: slot that holds the trampoline address. Non-null
//!   only while the hijack is armed. This word is the ownership claim: a hijack
//!   installs it with a CAS from null, and both the landing and an unhijack
//!   take it back with a swap to null.
//! - `hijacked_return_address`: original return address, saved after the
//!   location is claimed and before the slot is patched. Only the landing
//!   clears it, so a landing that lost the swap to an unhijack still finds the
//!   address it has to return to.
//!
//! A thread stopped inside a trampoline has already popped its patched return
//! address. Restoring the slot at that point is meaningless, so
//! [`Thread::unhijack_with_context`] backs off with [`UnhijackOutcome::Raced`].

use crate::arch;
use crate::context::{FrameFlags, LimitedContext, StackBounds, TransitionFrame};
use crate::defaults::TOP_OF_STACK_MARKER;
use crate::scan::StackWalker;
use crate::suspend::ThreadSuspender;
use crate::thread::Thread;
use log::{error, trace};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Register class of the value a hijacked frame returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// Not a reference
    Scalar,
    /// Object reference
    Object,
    /// Interior reference
    Byref,
}

impl ReturnKind {
    fn frame_flags(self) -> FrameFlags {
        match self {
            ReturnKind::Scalar => FrameFlags::empty(),
            ReturnKind::Object => FrameFlags::SAVE_RETURN_VALUE | FrameFlags::RETURN_IS_GC_REF,
            ReturnKind::Byref => FrameFlags::SAVE_RETURN_VALUE | FrameFlags::RETURN_IS_BYREF,
        }
    }
}

/// Trampoline entry points, one per [`ReturnKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HijackTargets {
    scalar: usize,
    object: usize,
    byref: usize,
}

impl HijackTargets {
    /// Use explicit trampoline addresses
    pub const fn new(scalar: usize, object: usize, byref: usize) -> Self {
        Self {
            scalar,
            object,
            byref,
        }
    }

    /// Trampolines compiled into this crate
    ///
    /// Real trampolines are emitted with the generated code. The stand-ins are
    /// three bytes of one non-executable static: their addresses differ at every
    /// optimization level, and jumping to one faults.
    pub fn runtime_default() -> Self {
        let base = UNPATCHED_TRAMPOLINES.as_ptr() as usize;
        Self::new(base, base + 1, base + 2)
    }

    /// Trampoline for a return kind
    pub fn target_for(&self, kind: ReturnKind) -> usize {
        match kind {
            ReturnKind::Scalar => self.scalar,
            ReturnKind::Object => self.object,
            ReturnKind::Byref => self.byref,
        }
    }

    /// Return kind a trampoline address stands for
    pub fn kind_of(&self, addr: usize) -> Option<ReturnKind> {
        if addr == self.scalar {
            Some(ReturnKind::Scalar)
        } else if addr == self.object {
            Some(ReturnKind::Object)
        } else if addr == self.byref {
            Some(ReturnKind::Byref)
        } else {
            None
        }
    }

    /// Check whether `addr` is a trampoline entry point
    pub fn is_hijack_target(&self, addr: usize) -> bool {
        self.kind_of(addr).is_some()
    }
}

/// Scalar, object and byref stand-in entry points
static UNPATCHED_TRAMPOLINES: [u8; 3] = [0xcc; 3];

/// A stack word holding a return address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnSlot(NonNull<AtomicUsize>);

impl ReturnSlot {
    /// Wrap the address of a return-address slot
    ///
    /// # Safety
    ///
    /// `slot` must be word-aligned and stay valid for as long as the frame
    /// that owns it is live.
    pub unsafe fn new(slot: NonNull<usize>) -> Self {
        ReturnSlot(slot.cast())
    }

    /// Slot address
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Return address currently stored
    pub fn load(self) -> usize {
        // SAFETY: valid per the constructor contract
        unsafe { self.0.as_ref() }.load(Ordering::Acquire)
    }

    fn as_atomic(&self) -> &AtomicUsize {
        // SAFETY: valid per the constructor contract
        unsafe { self.0.as_ref() }
    }
}

/// Where a stopped thread will return to next, and what it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnAddressLocation {
    /// Slot holding the return address
    pub slot: ReturnSlot,
    /// Register class of the return value
    pub kind: ReturnKind,
}

impl ReturnAddressLocation {
    /// Locate the return address of a frame-pointer frame inside `bounds`
    ///
    /// # Safety
    ///
    /// `ctx.fp` must be the frame pointer of a live frame that keeps the
    /// standard frame record for the current architecture.
    pub unsafe fn from_frame_pointer(
        ctx: &LimitedContext,
        bounds: StackBounds,
        kind: ReturnKind,
    ) -> Option<Self> {
        let slot = arch::return_address_slot(ctx.fp)?;
        if bounds.is_known() && !bounds.contains(slot) {
            return None;
        }
        let slot = NonNull::new(slot as *mut usize)?;
        Some(Self {
            slot: ReturnSlot::new(slot),
            kind,
        })
    }
}

/// Result of a hijack attempt
///
/// Every outcome except `Hijacked` leaves the thread untouched, and all of
/// them are safe to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackOutcome {
    /// Trampoline installed
    Hijacked,
    /// A hijack is already armed or landing
    AlreadyHijacked,
    /// Thread is preemptive and needs no hijack
    NotCooperative,
    /// Thread may not be hijacked (self, detached, do-not-trigger-gc, or not stoppable)
    NotAllowed,
    /// No patchable return address at the stop point
    NoReturnAddress,
    /// Thread moved while the hijack was being installed
    Raced,
}

/// Result of a cross-thread unhijack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhijackOutcome {
    /// Original return address written back
    Restored,
    /// No hijack was armed
    NotHijacked,
    /// The thread is landing; the landing owns the hijack
    Raced,
}

impl Thread {
    /// Stop the thread, install a trampoline in its pending return, resume it
    pub fn hijack(&self, suspender: &dyn ThreadSuspender, walker: &dyn StackWalker) -> HijackOutcome {
        if self.is_current_thread() || self.is_suspending_thread() {
            return HijackOutcome::NotAllowed;
        }
        if !self.is_attached() || self.is_do_not_trigger_gc_set() {
            return HijackOutcome::NotAllowed;
        }
        if !self.is_current_thread_in_cooperative_mode() {
            return HijackOutcome::NotCooperative;
        }

        let Some(ctx) = suspender.suspend(self) else {
            return HijackOutcome::NotAllowed;
        };

        // The thread may have transitioned before it stopped
        let outcome = if !self.is_current_thread_in_cooperative_mode() {
            HijackOutcome::NotCooperative
        } else {
            self.hijack_with_context(&ctx, walker)
        };

        suspender.resume(self);
        outcome
    }

    /// Hijack the caller's own return when GC stress picks this point
    ///
    /// Called by the owning thread in cooperative mode with its current
    /// registers. When the stress generator fires, the frame described by
    /// `ctx` lands in the trampoline on return, which forces a GC-safe point
    /// there.
    pub fn hijack_for_gc_stress(&self, ctx: &LimitedContext, walker: &dyn StackWalker) -> HijackOutcome {
        debug_assert!(self.is_current_thread(), "GC stress hijack of a foreign thread");
        if !self.is_attached() || !self.should_inject_gc_stress() {
            return HijackOutcome::NotAllowed;
        }
        if !self.is_current_thread_in_cooperative_mode() {
            return HijackOutcome::NotCooperative;
        }
        self.hijack_with_context(ctx, walker)
    }

    /// Install a trampoline using a register snapshot of the stopped thread
    ///
    /// The thread must stay stopped until this returns.
    pub fn hijack_with_context(&self, ctx: &LimitedContext, walker: &dyn StackWalker) -> HijackOutcome {
        if self.is_do_not_trigger_gc_set() {
            return HijackOutcome::NotAllowed;
        }

        let targets = self.coordinator.hijack_targets();
        if targets.is_hijack_target(ctx.ip) || self.parked_at_hijack.load(Ordering::SeqCst) {
            // Stopped inside a trampoline: the previous hijack is landing
            return HijackOutcome::Raced;
        }
        if self.is_hijacked() {
            return HijackOutcome::AlreadyHijacked;
        }

        let Some(location) = walker.locate_return_address(self, ctx) else {
            return HijackOutcome::NoReturnAddress;
        };
        let original = location.slot.load();
        if targets.is_hijack_target(original) {
            return HijackOutcome::AlreadyHijacked;
        }
        if original == 0 || original == TOP_OF_STACK_MARKER {
            return HijackOutcome::NoReturnAddress;
        }

        // Claim the hijack state. The slot is patched only after the address
        // is saved, so no landing can observe a stale address.
        if self
            .buffer
            .hijacked_return_location
            .compare_exchange(
                ptr::null_mut(),
                location.slot.0.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return HijackOutcome::AlreadyHijacked;
        }
        self.buffer
            .hijacked_return_address
            .store(original, Ordering::Release);

        let target = targets.target_for(location.kind);
        if location
            .slot
            .as_atomic()
            .compare_exchange(original, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.buffer
                .hijacked_return_location
                .store(ptr::null_mut(), Ordering::Release);
            return HijackOutcome::Raced;
        }

        self.coordinator.stats.record_hijack();
        trace!(
            "thread {}: hijacked return {:#x} at {:#x} ({:?})",
            self.logging_id(),
            original,
            location.slot.addr(),
            location.kind
        );
        HijackOutcome::Hijacked
    }

    /// Put the original return address back if a hijack is still armed
    ///
    /// Returns true if a trampoline was removed. Callers other than the owning
    /// thread must have the thread parked (preemptive or at a landing); a
    /// thread that is merely stopped goes through
    /// [`unhijack_with_context`](Self::unhijack_with_context).
    pub fn unhijack(&self) -> bool {
        let location = self
            .buffer
            .hijacked_return_location
            .swap(ptr::null_mut(), Ordering::AcqRel);
        let Some(location) = NonNull::new(location) else {
            return false;
        };

        let original = self.buffer.hijacked_return_address.load(Ordering::Acquire);
        // SAFETY: an armed location is a live slot of a stopped or parked thread
        let slot = unsafe { location.as_ref() };
        let current = slot.load(Ordering::Acquire);

        if !self.coordinator.hijack_targets().is_hijack_target(current)
            || slot
                .compare_exchange(current, original, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            error!(
                "thread {}: hijacked slot {:#x} no longer holds a trampoline",
                self.logging_id(),
                location.as_ptr() as usize
            );
            debug_assert!(false, "hijacked return slot overwritten");
            return false;
        }

        trace!(
            "thread {}: unhijacked, restored {:#x}",
            self.logging_id(),
            original
        );
        true
    }

    /// Unhijack a thread stopped at `ctx`
    ///
    /// A stop point inside a trampoline means the patched return already
    /// executed; the landing owns the hijack and nothing is touched.
    pub fn unhijack_with_context(&self, ctx: &LimitedContext) -> UnhijackOutcome {
        if self.coordinator.hijack_targets().is_hijack_target(ctx.ip)
            || self.parked_at_hijack.load(Ordering::SeqCst)
        {
            trace!("thread {}: unhijack raced with landing", self.logging_id());
            return UnhijackOutcome::Raced;
        }
        if self.unhijack() {
            UnhijackOutcome::Restored
        } else {
            UnhijackOutcome::NotHijacked
        }
    }

    /// Trampoline entry: park at the landing and return the original address
    ///
    /// Called by the owning thread right after its hijacked frame returned.
    /// For reference-returning kinds the trampoline stores the return register
    /// in `frame.return_value` first; it is reported as a root while parked and
    /// may be updated by the collector.
    pub fn on_hijack_return(&self, kind: ReturnKind, frame: &mut TransitionFrame) -> usize {
        debug_assert!(self.is_current_thread(), "hijack landed on a foreign thread");
        self.parked_at_hijack.store(true, Ordering::SeqCst);

        let claimed = !self
            .buffer
            .hijacked_return_location
            .swap(ptr::null_mut(), Ordering::AcqRel)
            .is_null();
        if !claimed {
            // An unhijack took the location after the return already executed;
            // the slot it restored is dead, the saved address is still valid
            trace!("thread {}: landing after unhijack", self.logging_id());
        }
        let original = self.buffer.hijacked_return_address.swap(0, Ordering::AcqRel);
        if original == 0 {
            error!("thread {}: hijack landing without a saved return address", self.logging_id());
            panic!("hijack landing without a saved return address");
        }

        frame.return_address = original;
        frame.flags |= FrameFlags::HIJACK_LANDING | kind.frame_flags();

        self.coordinator.stats.record_landing();
        trace!("thread {}: parked at hijack landing", self.logging_id());

        self.wait_for_gc(frame as *mut TransitionFrame);

        self.parked_at_hijack.store(false, Ordering::SeqCst);
        frame.flags.remove(FrameFlags::HIJACK_LANDING);
        original
    }

    /// Check whether a hijack is armed
    pub fn is_hijacked(&self) -> bool {
        !self
            .buffer
            .hijacked_return_location
            .load(Ordering::Acquire)
            .is_null()
    }

    /// Racy hijack check for threads other than the caller
    ///
    /// The answer may be stale by the time it is used unless the thread is
    /// stopped.
    pub fn dangerous_cross_thread_is_hijacked(&self) -> bool {
        !self
            .buffer
            .hijacked_return_location
            .load(Ordering::Relaxed)
            .is_null()
    }

    /// Saved original return address while a hijack is armed
    pub fn hijacked_return_address(&self) -> Option<usize> {
        if !self.is_hijacked() {
            return None;
        }
        match self.buffer.hijacked_return_address.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Return address stored in `slot`, looking through an armed trampoline
    pub fn unhijacked_return_address(&self, slot: ReturnSlot) -> usize {
        let hijacked = self.buffer.hijacked_return_location.load(Ordering::Acquire);
        if hijacked == slot.0.as_ptr() {
            if let Some(original) = self.hijacked_return_address() {
                return original;
            }
        }
        slot.load()
    }

    /// Map a trampoline address seen by an unwinder back to the real return address
    pub fn translate_return_address(&self, addr: usize) -> usize {
        if self.coordinator.hijack_targets().is_hijack_target(addr) {
            if let Some(original) = self.hijacked_return_address() {
                return original;
            }
        }
        addr
    }
}
