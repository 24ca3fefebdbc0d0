//! Root enumeration for one thread
//!
//! The thread core does not walk stacks itself. It decides where a walk has to
//! start and hands that to a [`StackWalker`]; then it reports the roots that
//! live outside any stack frame:
//! - the saved return register of a hijack landing frame
//! - the exception object of every exception-info record
//! - the module thread-static storage objects
//!
//! Extra roots may duplicate stack roots. The collector must tolerate that.

use crate::context::{FrameFlags, LimitedContext, ObjectRef, PublishedFrame, RootFlags, RootSlot};
use crate::exinfo::ExInfo;
use crate::hijack::{ReturnAddressLocation, ReturnSlot};
use crate::mode::ExecutionMode;
use crate::thread::Thread;
use log::{error, trace};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

/// Where a stack walk starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStart {
    /// The calling thread scans itself from its live registers
    CurrentContext,
    /// From a committed transition frame
    TransitionFrame(PublishedFrame),
    /// From the landing point of an armed hijack on a stopped thread
    HijackLanding {
        /// Real return address of the hijacked frame
        return_address: usize,
        /// Slot currently holding the trampoline address
        location: ReturnSlot,
    },
}

/// Stack unwinder supplied by the runtime
pub trait StackWalker {
    /// Walk `thread`'s managed frames outward from `start`, calling `visit`
    /// once per live reference slot
    fn walk(&self, thread: &Thread, start: WalkStart, visit: &mut dyn FnMut(RootSlot));

    /// Find the return address the stopped thread will use next
    ///
    /// `ctx` is the register state captured when the thread was stopped.
    fn locate_return_address(
        &self,
        thread: &Thread,
        ctx: &LimitedContext,
    ) -> Option<ReturnAddressLocation>;
}

/// Counts of the roots reported by one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Slots reported by the stack walk, including a saved return register
    pub stack_roots: usize,
    /// Exception objects of the exception-info chain
    pub exception_roots: usize,
    /// Module thread-static storage objects
    pub static_roots: usize,
}

impl ScanSummary {
    /// All reported roots
    pub fn total(&self) -> usize {
        self.stack_roots + self.exception_roots + self.static_roots
    }
}

impl Thread {
    /// Report every root of this thread to `visit`
    ///
    /// The thread must be the caller, parked (preemptive or at a hijack
    /// landing), or stopped with a hijack armed. Threads that are not attached
    /// report nothing.
    pub fn scan_roots(&self, walker: &dyn StackWalker, visit: &mut dyn FnMut(RootSlot)) -> ScanSummary {
        let mut summary = ScanSummary::default();
        if !self.is_attached() {
            return summary;
        }

        let start = match self.mode() {
            ExecutionMode::Preemptive(frame) => {
                summary.stack_roots += report_return_value(frame, visit);
                WalkStart::TransitionFrame(frame)
            }
            ExecutionMode::Cooperative if self.is_current_thread() => WalkStart::CurrentContext,
            ExecutionMode::Cooperative => match self.armed_hijack() {
                Some(start) => start,
                None => {
                    error!(
                        "thread {}: root scan of a running cooperative thread",
                        self.logging_id()
                    );
                    debug_assert!(false, "root scan of a running cooperative thread");
                    return summary;
                }
            },
        };

        walker.walk(self, start, &mut |slot| {
            summary.stack_roots += 1;
            visit(slot);
        });

        for info in self.ex_info_records() {
            visit(RootSlot::new(ExInfo::exception_slot(info)));
            summary.exception_roots += 1;
        }

        for slot in self.module_statics.root_slots() {
            visit(RootSlot::new(slot));
            summary.static_roots += 1;
        }

        trace!(
            "thread {}: scanned {} roots ({:?})",
            self.logging_id(),
            summary.total(),
            start
        );
        summary
    }

    fn armed_hijack(&self) -> Option<WalkStart> {
        let location = NonNull::new(self.buffer.hijacked_return_location.load(Ordering::Acquire))?;
        let return_address = self.hijacked_return_address()?;
        // SAFETY: an armed location is a live, word-aligned return slot
        let location = unsafe { ReturnSlot::new(location.cast()) };
        Some(WalkStart::HijackLanding {
            return_address,
            location,
        })
    }
}

fn report_return_value(frame: PublishedFrame, visit: &mut dyn FnMut(RootSlot)) -> usize {
    // SAFETY: the frame stays committed while the thread is parked
    let saved = unsafe { frame.read() };
    if !saved.reports_return_value() {
        return 0;
    }

    let flags = if saved.flags.contains(FrameFlags::RETURN_IS_BYREF) {
        RootFlags::INTERIOR
    } else {
        RootFlags::empty()
    };
    // SAFETY: the field lies inside the committed frame
    let slot = unsafe { ptr::addr_of_mut!((*frame.as_ptr()).return_value) };
    match NonNull::<ObjectRef>::new(slot) {
        Some(slot) => {
            visit(RootSlot::with_flags(slot, flags));
            1
        }
        None => 0,
    }
}
