//! Native-to-managed entry
//!
//! Every call from native code into managed code is bracketed by a
//! [`ReversePInvokeFrame`] on the native side:
//!
//! ```text
//! let mut frame = ReversePInvokeFrame::new();
//! if !thread.inline_try_fast_reverse_pinvoke(&mut frame) {
//!     thread.reverse_pinvoke_attach_or_trap_thread(&mut frame);
//! }
//! managed_callee();
//! thread.inline_reverse_pinvoke_return(&frame);
//! ```
//!
//! The frame remembers the transition frame that was committed before the
//! call, so the return restores exactly the preemptive state the native caller
//! had. Threads that have never run managed code are attached by
//! [`ThreadStore::reverse_pinvoke_enter`](crate::ThreadStore::reverse_pinvoke_enter)
//! and start out preemptive behind an outermost frame.

use crate::context::{PublishedFrame, TransitionFrame};
use crate::thread::Thread;
use log::error;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

/// State saved across one native-to-managed call
#[repr(C)]
#[derive(Debug)]
pub struct ReversePInvokeFrame {
    saved_transition_frame: *mut TransitionFrame,
    saved_thread: *const Thread,
}

impl ReversePInvokeFrame {
    /// An empty frame, filled in by the entry path
    pub const fn new() -> Self {
        Self {
            saved_transition_frame: ptr::null_mut(),
            saved_thread: ptr::null(),
        }
    }

    /// Transition frame committed before the call
    pub fn saved_transition_frame(&self) -> Option<PublishedFrame> {
        NonNull::new(self.saved_transition_frame).map(PublishedFrame::new)
    }

    /// Check whether the frame was filled in by `thread`
    pub fn is_saved_by(&self, thread: &Thread) -> bool {
        ptr::eq(self.saved_thread, thread)
    }
}

impl Default for ReversePInvokeFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread {
    /// Non-blocking entry fast path
    ///
    /// Succeeds only for an attached thread that is currently preemptive while
    /// no suspension is active. On false nothing has changed and the caller
    /// must take [`reverse_pinvoke_attach_or_trap_thread`](Self::reverse_pinvoke_attach_or_trap_thread).
    #[inline]
    pub fn inline_try_fast_reverse_pinvoke(&self, frame: &mut ReversePInvokeFrame) -> bool {
        if !self.is_attached() {
            return false;
        }

        let saved = self.buffer.transition_frame.load(Ordering::Relaxed);
        if saved.is_null() {
            // Entered from cooperative mode; the slow path decides
            return false;
        }

        frame.saved_thread = self;
        frame.saved_transition_frame = saved;

        self.buffer
            .transition_frame
            .store(ptr::null_mut(), Ordering::SeqCst);

        if self.coordinator.is_trap_threads_requested() {
            self.buffer.transition_frame.store(saved, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Blocking entry slow path
    ///
    /// Waits out an active suspension before returning in cooperative mode.
    /// Entry from managed code is only legal with do-not-trigger-GC set (the
    /// runtime calling back into itself); anything else is fatal.
    pub fn reverse_pinvoke_attach_or_trap_thread(&self, frame: &mut ReversePInvokeFrame) {
        debug_assert!(self.is_current_thread(), "reverse entry on a foreign thread");
        debug_assert!(self.is_attached(), "reverse entry before attach");

        frame.saved_thread = self;
        let saved = self.buffer.transition_frame.load(Ordering::Relaxed);
        frame.saved_transition_frame = saved;

        if saved.is_null() {
            if self.is_do_not_trigger_gc_set() {
                return;
            }
            error!(
                "thread {}: native-to-managed entry while already in managed code",
                self.logging_id()
            );
            panic!("invalid program: native-to-managed entry from managed code");
        }

        self.disable_preemptive_mode();
    }

    /// Leave managed code, restoring the caller's transition frame
    #[inline]
    pub fn inline_reverse_pinvoke_return(&self, frame: &ReversePInvokeFrame) {
        debug_assert!(frame.is_saved_by(self), "reverse return with a foreign frame");
        debug_assert!(self.is_current_thread_in_cooperative_mode());

        self.buffer
            .transition_frame
            .store(frame.saved_transition_frame, Ordering::SeqCst);

        if self.coordinator.is_trap_threads_requested() && !frame.saved_transition_frame.is_null() {
            self.wait_for_suspend();
        }
    }

    /// Make a thread with no managed frames preemptive behind its outermost frame
    pub(crate) fn publish_top_of_stack_frame(&self) {
        debug_assert!(self.is_current_thread_in_cooperative_mode());
        self.buffer
            .transition_frame
            .store(self.top_of_stack_frame().as_ptr(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StackBounds;
    use crate::defaults::TOP_OF_STACK_MARKER;
    use crate::suspend::SuspensionCoordinator;
    use std::sync::Arc;

    fn native_thread(coord: Arc<SuspensionCoordinator>) -> Arc<Thread> {
        let thread = Arc::new(Thread::new(coord, Default::default()));
        thread.attach(StackBounds::new(0x1000, 0x10_0000)).unwrap();
        thread.publish_top_of_stack_frame();
        thread
    }

    #[test]
    fn test_fast_path_round_trip() {
        let thread = native_thread(Arc::new(SuspensionCoordinator::default()));
        let before = thread.mode().frame().unwrap();
        assert_eq!(unsafe { before.read() }.return_address, TOP_OF_STACK_MARKER);

        let mut frame = ReversePInvokeFrame::new();
        assert!(thread.inline_try_fast_reverse_pinvoke(&mut frame));
        assert!(thread.mode().is_cooperative());
        assert!(frame.is_saved_by(&thread));

        thread.inline_reverse_pinvoke_return(&frame);
        assert_eq!(thread.mode().frame(), Some(before));
    }

    #[test]
    fn test_fast_path_refuses_unattached() {
        let thread = Thread::new(Arc::new(SuspensionCoordinator::default()), Default::default());
        let mut frame = ReversePInvokeFrame::new();
        assert!(!thread.inline_try_fast_reverse_pinvoke(&mut frame));
        assert!(frame.saved_transition_frame().is_none());
    }

    #[test]
    fn test_fast_path_refuses_during_suspension() {
        let coord = Arc::new(SuspensionCoordinator::default());
        let thread = native_thread(coord.clone());
        let before = thread.mode();

        coord.request_trap_threads(u64::MAX);
        let mut frame = ReversePInvokeFrame::new();
        assert!(!thread.inline_try_fast_reverse_pinvoke(&mut frame));
        assert_eq!(thread.mode(), before);
        coord.release_trapped_threads();
    }

    #[test]
    fn test_return_to_native_waits_out_suspension() {
        use std::sync::mpsc;
        use std::time::Duration;

        let coord = Arc::new(SuspensionCoordinator::default());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        let native = {
            let coord = coord.clone();
            std::thread::spawn(move || {
                let thread = native_thread(coord);
                let mut frame = ReversePInvokeFrame::new();
                assert!(thread.inline_try_fast_reverse_pinvoke(&mut frame));
                entered_tx.send(thread.clone()).unwrap();
                go_rx.recv().unwrap();
                thread.inline_reverse_pinvoke_return(&frame);
                done_tx.send(()).unwrap();
            })
        };

        let thread = entered_rx.recv().unwrap();
        coord.request_trap_threads(u64::MAX);
        go_tx.send(()).unwrap();

        // Parked behind its restored outer frame until the suspension ends
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while thread.mode().is_cooperative() {
            assert!(std::time::Instant::now() < deadline, "native thread never parked");
            std::thread::yield_now();
        }
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

        coord.release_trapped_threads();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        native.join().unwrap();
    }

    #[test]
    fn test_nested_entry_restores_inner_frame() {
        let thread = native_thread(Arc::new(SuspensionCoordinator::default()));

        let mut outer = ReversePInvokeFrame::new();
        assert!(thread.inline_try_fast_reverse_pinvoke(&mut outer));

        // Managed code calls out to native, which calls back in
        let pinvoke = TransitionFrame::capture(0x4000, 0x8000, 0x8010);
        thread.run_preemptive(&pinvoke, || {
            let mut inner = ReversePInvokeFrame::new();
            assert!(thread.inline_try_fast_reverse_pinvoke(&mut inner));
            assert_eq!(
                inner.saved_transition_frame().map(|f| f.as_ptr() as *const TransitionFrame),
                Some(&pinvoke as *const TransitionFrame)
            );
            thread.inline_reverse_pinvoke_return(&inner);
            assert!(!thread.mode().is_cooperative());
        });

        thread.inline_reverse_pinvoke_return(&outer);
        assert!(!thread.mode().is_cooperative());
    }

    #[test]
    fn test_reentry_with_do_not_trigger_gc() {
        let thread = Thread::new(Arc::new(SuspensionCoordinator::default()), Default::default());
        thread.attach(StackBounds::new(0x1000, 0x10_0000)).unwrap();
        thread.set_do_not_trigger_gc();

        let mut frame = ReversePInvokeFrame::new();
        assert!(!thread.inline_try_fast_reverse_pinvoke(&mut frame));
        thread.reverse_pinvoke_attach_or_trap_thread(&mut frame);
        assert!(thread.mode().is_cooperative());

        thread.inline_reverse_pinvoke_return(&frame);
        assert!(thread.mode().is_cooperative());
    }

    #[test]
    #[should_panic(expected = "native-to-managed entry from managed code")]
    fn test_reentry_from_managed_code_is_fatal() {
        let thread = Thread::new(Arc::new(SuspensionCoordinator::default()), Default::default());
        thread.attach(StackBounds::new(0x1000, 0x10_0000)).unwrap();

        let mut frame = ReversePInvokeFrame::new();
        thread.reverse_pinvoke_attach_or_trap_thread(&mut frame);
    }
}
