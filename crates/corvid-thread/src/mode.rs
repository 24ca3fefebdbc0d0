//! Cooperative/preemptive mode protocol
//!
//! A thread is *cooperative* while it runs managed code: the collector may not
//! look at its stack until it has been brought to a safe point. Before calling
//! out to unmanaged code the thread publishes a [`TransitionFrame`] describing
//! its last managed call boundary and becomes *preemptive*; from then on the
//! collector may walk its stack from that frame at any time.
//!
//! Leaving preemptive mode is where suspension bites: if the collector is
//! holding threads, the returning thread re-publishes its frame and blocks
//! until it is released, so it never resumes managed code while its stack is
//! being read.
//!
//! The committed frame pointer in the control block is the only state the
//! collector trusts. [`ExecutionMode`] is the typed view of it.

use crate::context::{PublishedFrame, TransitionFrame};
use crate::thread::Thread;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

/// Execution mode of a thread, derived from its committed transition frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Running (or about to run) managed code
    Cooperative,
    /// Outside managed code; the stack is walkable from the frame
    Preemptive(PublishedFrame),
}

impl ExecutionMode {
    /// Check for cooperative mode
    pub fn is_cooperative(&self) -> bool {
        matches!(self, ExecutionMode::Cooperative)
    }

    /// Committed frame, if preemptive
    pub fn frame(&self) -> Option<PublishedFrame> {
        match self {
            ExecutionMode::Cooperative => None,
            ExecutionMode::Preemptive(frame) => Some(*frame),
        }
    }
}

/// Keeps a thread preemptive until dropped
///
/// Borrowing the frame ties its lifetime to the preemptive region.
pub struct PreemptiveGuard<'t, 'f> {
    thread: &'t Thread,
    _frame: &'f TransitionFrame,
}

impl Drop for PreemptiveGuard<'_, '_> {
    fn drop(&mut self) {
        self.thread.disable_preemptive_mode();
    }
}

impl Thread {
    /// Current mode
    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        match NonNull::new(self.buffer.transition_frame.load(Ordering::SeqCst)) {
            None => ExecutionMode::Cooperative,
            Some(frame) => ExecutionMode::Preemptive(PublishedFrame::new(frame)),
        }
    }

    /// Check whether the thread is cooperative
    #[inline]
    pub fn is_current_thread_in_cooperative_mode(&self) -> bool {
        self.buffer.transition_frame.load(Ordering::SeqCst).is_null()
    }

    /// Publish `frame` and switch to preemptive mode
    ///
    /// Call immediately before leaving managed code. An armed hijack is
    /// cancelled first, since the hijacked frame cannot return while the
    /// thread is outside managed code. Must be balanced by
    /// [`disable_preemptive_mode`](Self::disable_preemptive_mode); nesting is a
    /// caller bug.
    ///
    /// # Safety
    ///
    /// Must be called by the owning thread while cooperative. `frame` must stay
    /// alive and unmodified until the matching `disable_preemptive_mode` returns.
    pub unsafe fn enable_preemptive_mode(&self, frame: NonNull<TransitionFrame>) {
        debug_assert!(self.is_current_thread(), "mode switched by a foreign thread");
        debug_assert!(
            self.is_current_thread_in_cooperative_mode(),
            "unbalanced enable_preemptive_mode"
        );
        debug_assert!(!self.is_do_not_trigger_gc_set());

        self.unhijack();
        self.buffer.pinvoke_tunnel.store(frame.as_ptr(), Ordering::Relaxed);
        // Pairs with the suspender's trap store and frame load
        self.buffer
            .transition_frame
            .store(frame.as_ptr(), Ordering::SeqCst);
    }

    /// Return to cooperative mode, waiting out any active suspension first
    pub fn disable_preemptive_mode(&self) {
        debug_assert!(self.is_current_thread(), "mode switched by a foreign thread");
        let frame = self.buffer.transition_frame.load(Ordering::Relaxed);
        debug_assert!(!frame.is_null(), "unbalanced disable_preemptive_mode");

        self.buffer
            .transition_frame
            .store(ptr::null_mut(), Ordering::SeqCst);

        if self.coordinator.is_trap_threads_requested() && !self.is_suspending_thread() {
            self.wait_for_gc(frame);
        }
    }

    /// Run `f` in preemptive mode with `frame` published
    pub fn run_preemptive<R>(&self, frame: &TransitionFrame, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter_preemptive(frame);
        f()
    }

    /// Switch to preemptive mode until the returned guard drops
    pub fn enter_preemptive<'t, 'f>(&'t self, frame: &'f TransitionFrame) -> PreemptiveGuard<'t, 'f> {
        // SAFETY: the guard borrows `frame` for the whole preemptive region
        unsafe { self.enable_preemptive_mode(NonNull::from(frame)) };
        PreemptiveGuard {
            thread: self,
            _frame: frame,
        }
    }

    /// Park behind `frame` until the active suspension is released
    ///
    /// Loops because a new suspension may start between release and wake-up.
    pub(crate) fn wait_for_gc(&self, frame: *mut TransitionFrame) {
        debug_assert!(!self.is_do_not_trigger_gc_set(), "wait_for_gc with GC forbidden");
        debug_assert!(!frame.is_null());

        loop {
            self.buffer.transition_frame.store(frame, Ordering::SeqCst);
            self.coordinator.notify_progress();
            self.coordinator.wait_until_gc_complete();
            self.buffer
                .transition_frame
                .store(ptr::null_mut(), Ordering::SeqCst);

            if !self.coordinator.is_trap_threads_requested() {
                break;
            }
        }
    }

    /// Cooperate with an active stop-the-world request
    ///
    /// Cancels any hijack and blocks until the suspension is released. The
    /// caller must already be walkable (preemptive, or parked behind a frame it
    /// published itself).
    pub fn wait_for_suspend(&self) {
        self.unhijack();
        self.coordinator.wait_until_gc_complete();
    }

    pub(crate) fn is_suspending_thread(&self) -> bool {
        self.coordinator.suspending_thread() == Some(self.logging_id())
    }

    /// Frame a cooperative thread parks behind while it waits to suspend others
    ///
    /// The frame staged by the allocation helper that triggered the collection,
    /// or the outermost frame when nothing is staged.
    pub(crate) fn staged_gc_frame(&self) -> NonNull<TransitionFrame> {
        NonNull::new(self.buffer.pinvoke_tunnel.load(Ordering::Relaxed))
            .unwrap_or_else(|| self.top_of_stack_frame())
    }

    // ===== Staged frames =====

    /// Stage the frame built by an allocation helper that may trigger a GC
    ///
    /// # Safety
    ///
    /// Owning thread only; `frame` must outlive the helper call.
    pub unsafe fn set_pinvoke_tunnel_for_gc_alloc(&self, frame: NonNull<TransitionFrame>) {
        debug_assert!(self.is_current_thread());
        self.buffer.pinvoke_tunnel.store(frame.as_ptr(), Ordering::Relaxed);
    }

    /// Most recently staged frame, for stack traces of the current thread
    ///
    /// Only meaningful on the owning thread while cooperative.
    pub fn transition_frame_for_stack_trace(&self) -> Option<PublishedFrame> {
        debug_assert!(self.is_current_thread(), "only supported for the current thread");
        debug_assert!(self.is_current_thread_in_cooperative_mode());
        NonNull::new(self.buffer.pinvoke_tunnel.load(Ordering::Relaxed)).map(PublishedFrame::new)
    }

    /// Return address recorded by the most recently staged frame
    pub fn current_pinvoke_return_address(&self) -> Option<usize> {
        let frame = self.buffer.pinvoke_tunnel.load(Ordering::Relaxed);
        // SAFETY: the staged frame outlives the transition that staged it
        unsafe { frame.as_ref() }.map(|f| f.return_address)
    }

    /// Snapshot the committed frame for the suspending thread
    ///
    /// Returns false if the thread is cooperative.
    pub fn cache_transition_frame_for_suspend(&self) -> bool {
        let frame = self.buffer.transition_frame.load(Ordering::SeqCst);
        self.buffer
            .cached_transition_frame
            .store(frame, Ordering::Release);
        !frame.is_null()
    }

    /// Forget the suspend-time snapshot
    pub fn reset_cached_transition_frame(&self) {
        self.buffer
            .cached_transition_frame
            .store(ptr::null_mut(), Ordering::Release);
    }

    /// Frame snapshotted by the last suspend pass
    pub fn cached_transition_frame(&self) -> Option<PublishedFrame> {
        NonNull::new(self.buffer.cached_transition_frame.load(Ordering::Acquire))
            .map(PublishedFrame::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LimitedContext, RootSlot, StackBounds};
    use crate::hijack::{HijackOutcome, ReturnAddressLocation, ReturnKind, ReturnSlot};
    use crate::scan::{StackWalker, WalkStart};
    use crate::suspend::SuspensionCoordinator;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn attached_thread(coord: Arc<SuspensionCoordinator>) -> Thread {
        let thread = Thread::new(coord, Default::default());
        thread.attach(StackBounds::new(0x1000, 0x10_0000)).unwrap();
        thread
    }

    #[test]
    fn test_new_thread_is_cooperative() {
        let thread = attached_thread(Arc::new(SuspensionCoordinator::default()));
        assert_eq!(thread.mode(), ExecutionMode::Cooperative);
        assert!(thread.is_current_thread_in_cooperative_mode());
    }

    #[test]
    fn test_mode_alternates_with_frame() {
        let thread = attached_thread(Arc::new(SuspensionCoordinator::default()));

        for i in 0..4usize {
            let frame = TransitionFrame::capture(0x4000 + i, 0x8000, 0x8010);
            unsafe { thread.enable_preemptive_mode(NonNull::from(&frame)) };

            match thread.mode() {
                ExecutionMode::Preemptive(published) => {
                    assert_eq!(published.as_ptr() as *const _, &frame as *const _);
                    assert_eq!(unsafe { published.read() }.return_address, 0x4000 + i);
                }
                ExecutionMode::Cooperative => panic!("expected preemptive mode"),
            }

            thread.disable_preemptive_mode();
            assert_eq!(thread.mode(), ExecutionMode::Cooperative);
        }
    }

    #[test]
    fn test_run_preemptive_restores_mode() {
        let thread = attached_thread(Arc::new(SuspensionCoordinator::default()));
        let frame = TransitionFrame::capture(0x4000, 0x8000, 0x8010);

        let seen = thread.run_preemptive(&frame, || thread.mode());
        assert!(!seen.is_cooperative());
        assert!(thread.mode().is_cooperative());
        assert_eq!(thread.current_pinvoke_return_address(), Some(0x4000));
    }

    #[test]
    fn test_cache_transition_frame() {
        let thread = attached_thread(Arc::new(SuspensionCoordinator::default()));
        assert!(!thread.cache_transition_frame_for_suspend());
        assert!(thread.cached_transition_frame().is_none());

        let frame = TransitionFrame::capture(0x4000, 0x8000, 0x8010);
        let _guard = thread.enter_preemptive(&frame);
        assert!(thread.cache_transition_frame_for_suspend());
        assert!(thread.cached_transition_frame().is_some());

        thread.reset_cached_transition_frame();
        assert!(thread.cached_transition_frame().is_none());
    }

    struct SlotWalker(NonNull<usize>);

    impl StackWalker for SlotWalker {
        fn walk(&self, _: &Thread, _: WalkStart, _: &mut dyn FnMut(RootSlot)) {}

        fn locate_return_address(&self, _: &Thread, _: &LimitedContext) -> Option<ReturnAddressLocation> {
            Some(ReturnAddressLocation {
                slot: unsafe { ReturnSlot::new(self.0) },
                kind: ReturnKind::Scalar,
            })
        }
    }

    #[test]
    fn test_enable_cancels_armed_hijack() {
        let thread = attached_thread(Arc::new(SuspensionCoordinator::default()));
        let mut slot = 0x7000_1234usize;
        let walker = SlotWalker(NonNull::from(&mut slot));
        let ctx = LimitedContext::new(0x7000_0100, 0x8000, 0x8010);
        assert_eq!(thread.hijack_with_context(&ctx, &walker), HijackOutcome::Hijacked);

        let frame = TransitionFrame::capture(0x4000, 0x8000, 0x8010);
        thread.run_preemptive(&frame, || {
            assert!(!thread.is_hijacked());
        });
        assert_eq!(unsafe { walker.0.as_ptr().read() }, 0x7000_1234);
    }

    #[test]
    fn test_staged_frame_for_stack_trace() {
        let thread = attached_thread(Arc::new(SuspensionCoordinator::default()));
        assert!(thread.transition_frame_for_stack_trace().is_none());
        assert_eq!(thread.staged_gc_frame(), thread.top_of_stack_frame());

        let mut frame = TransitionFrame::capture(0x4444, 0x8000, 0x8010);
        unsafe { thread.set_pinvoke_tunnel_for_gc_alloc(NonNull::from(&mut frame)) };

        let staged = thread.transition_frame_for_stack_trace().unwrap();
        assert_eq!(staged.as_ptr() as *const _, &frame as *const TransitionFrame);
        assert_eq!(thread.current_pinvoke_return_address(), Some(0x4444));
        assert_eq!(thread.staged_gc_frame().as_ptr() as *const _, &frame as *const TransitionFrame);
        // Staging does not change the mode
        assert!(thread.mode().is_cooperative());
    }

    #[test]
    fn test_wait_for_suspend_blocks_until_release() {
        let coord = Arc::new(SuspensionCoordinator::default());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();

        let waiter = {
            let coord = coord.clone();
            thread::spawn(move || {
                let thread = attached_thread(coord);
                let frame = TransitionFrame::capture(0x4000, 0x8000, 0x8010);
                let _guard = thread.enter_preemptive(&frame);
                ready_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                thread.wait_for_suspend();
            })
        };

        ready_rx.recv().unwrap();
        coord.request_trap_threads(u64::MAX);
        go_tx.send(()).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished(), "wait_for_suspend returned during suspension");

        coord.release_trapped_threads();
        waiter.join().unwrap();
    }

    #[test]
    fn test_disable_blocks_while_suspended() {
        let coord = Arc::new(SuspensionCoordinator::default());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();

        // Test-only carrier: the mode is only compared after join, never dereferenced.
        struct SendMode(ExecutionMode);
        unsafe impl Send for SendMode {}

        let mutator = {
            let coord = coord.clone();
            thread::spawn(move || {
                let thread = attached_thread(coord);
                let frame = TransitionFrame::capture(0x4000, 0x8000, 0x8010);
                unsafe { thread.enable_preemptive_mode(NonNull::from(&frame)) };
                entered_tx.send(()).unwrap();
                go_rx.recv().unwrap();

                thread.disable_preemptive_mode();
                SendMode(thread.mode())
            })
        };

        entered_rx.recv().unwrap();
        coord.request_trap_threads(u64::MAX);
        go_tx.send(()).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(!mutator.is_finished(), "mutator resumed during suspension");

        coord.release_trapped_threads();
        assert_eq!(mutator.join().unwrap().0, ExecutionMode::Cooperative);
    }
}
