//! Runtime-wide suspension signal
//!
//! The [`SuspensionCoordinator`] is the single "trap threads" flag every
//! control block consults on its mode transitions, plus the blocking waits
//! built around it:
//!
//! - Threads leaving preemptive mode while a suspension is active block in
//!   `wait_until_gc_complete` until the suspending thread releases them.
//! - The suspending thread sleeps in `wait_for_progress` between handshake
//!   passes and is woken whenever a thread parks.
//!
//! ## Ordering
//!
//! A thread clears its transition frame and *then* reads the trap flag; the
//! suspender sets the trap flag and *then* reads transition frames. Both sides
//! use `SeqCst` so at least one of them observes the other.

use crate::context::LimitedContext;
use crate::hijack::HijackTargets;
use crate::mode::ExecutionMode;
use crate::scan::StackWalker;
use crate::thread::Thread;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Result of one attempt to bring a thread to a safe point
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncRequestResult {
    /// The thread is still running managed code; try again later
    TryAgain,
    /// The thread is parked outside managed code behind a transition frame
    SuccessUnmanaged,
    /// The thread is parked inside managed code at a hijack landing
    SuccessManaged,
}

impl SyncRequestResult {
    /// Check whether the thread is accounted for
    pub fn is_success(self) -> bool {
        !matches!(self, SyncRequestResult::TryAgain)
    }
}

/// Platform hook that stops an OS thread and reads its registers
pub trait ThreadSuspender {
    /// Stop `thread` and capture its register state.
    ///
    /// Returns `None` if the thread cannot be stopped right now; the handshake
    /// treats that as a retryable miss.
    fn suspend(&self, thread: &Thread) -> Option<LimitedContext>;

    /// Let a thread stopped by [`suspend`](Self::suspend) continue
    fn resume(&self, thread: &Thread);
}

/// Statistics tracking for suspensions
#[derive(Debug, Default)]
pub struct SuspendStats {
    /// Completed stop-the-world suspensions
    suspensions: AtomicUsize,
    /// Handshake passes across all suspensions
    passes: AtomicUsize,
    /// Hijacks installed
    hijacks: AtomicUsize,
    /// Threads that parked at a hijack landing
    hijack_landings: AtomicUsize,
}

impl SuspendStats {
    pub(crate) fn record_suspension(&self, passes: usize) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        self.passes.fetch_add(passes, Ordering::Relaxed);
    }

    pub(crate) fn record_hijack(&self) {
        self.hijacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_landing(&self) {
        self.hijack_landings.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed suspensions
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::Relaxed)
    }

    /// Total handshake passes
    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }

    /// Total hijacks installed
    pub fn hijacks(&self) -> usize {
        self.hijacks.load(Ordering::Relaxed)
    }

    /// Total hijack landings
    pub fn hijack_landings(&self) -> usize {
        self.hijack_landings.load(Ordering::Relaxed)
    }
}

/// Coordinates stop-the-world requests with every control block
pub struct SuspensionCoordinator {
    /// Threads must trap at their next transition
    trap_threads: AtomicBool,

    /// Logging id of the suspending thread, 0 when none
    suspending_thread: AtomicU64,

    /// Bumped on every release; waiters sleep until it changes
    epoch: Mutex<u64>,

    /// Signalled when a suspension is released
    released: Condvar,

    /// Signalled when some thread parks
    progress: Condvar,

    /// Trampoline addresses recognized as hijack targets
    hijack_targets: HijackTargets,

    /// Statistics
    pub stats: SuspendStats,
}

impl SuspensionCoordinator {
    /// Create a coordinator using the given trampoline addresses
    pub fn new(hijack_targets: HijackTargets) -> Self {
        Self {
            trap_threads: AtomicBool::new(false),
            suspending_thread: AtomicU64::new(0),
            epoch: Mutex::new(0),
            released: Condvar::new(),
            progress: Condvar::new(),
            hijack_targets,
            stats: SuspendStats::default(),
        }
    }

    /// Trampoline addresses
    pub fn hijack_targets(&self) -> &HijackTargets {
        &self.hijack_targets
    }

    /// Fast inline check - called on every mode transition
    #[inline(always)]
    pub fn is_trap_threads_requested(&self) -> bool {
        self.trap_threads.load(Ordering::SeqCst)
    }

    /// Logging id of the thread currently suspending the others
    pub fn suspending_thread(&self) -> Option<u64> {
        match self.suspending_thread.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Start trapping threads on behalf of `suspender`
    ///
    /// Suspensions are serialized: if another one is active this blocks until
    /// it is released. The caller must not be a cooperative attached thread,
    /// or the active suspension can never bring it to a safe point.
    pub fn request_trap_threads(&self, suspender: u64) {
        let mut epoch = self.epoch.lock();
        while self.trap_threads.load(Ordering::SeqCst) {
            self.released.wait(&mut epoch);
        }
        self.suspending_thread.store(suspender, Ordering::Release);
        self.trap_threads.store(true, Ordering::SeqCst);
    }

    /// Start trapping threads unless another suspension is active
    pub fn try_request_trap_threads(&self, suspender: u64) -> bool {
        let _guard = self.epoch.lock();
        if self.trap_threads.load(Ordering::SeqCst) {
            return false;
        }
        self.suspending_thread.store(suspender, Ordering::Release);
        self.trap_threads.store(true, Ordering::SeqCst);
        true
    }

    /// End the active suspension and wake every trapped thread
    pub fn release_trapped_threads(&self) {
        let mut epoch = self.epoch.lock();
        self.trap_threads.store(false, Ordering::SeqCst);
        self.suspending_thread.store(0, Ordering::Release);
        *epoch += 1;
        self.released.notify_all();
    }

    /// Block until the active suspension (if any) is released
    ///
    /// Not cancellable: a trapped thread always waits the suspension out.
    #[cold]
    pub fn wait_until_gc_complete(&self) {
        let mut epoch = self.epoch.lock();
        let entered = *epoch;
        while self.trap_threads.load(Ordering::SeqCst) && *epoch == entered {
            self.released.wait(&mut epoch);
        }
    }

    /// Wake the suspending thread because some thread reached a safe point
    pub fn notify_progress(&self) {
        let _guard = self.epoch.lock();
        self.progress.notify_all();
    }

    /// Sleep until some thread parks or `timeout` elapses
    pub fn wait_for_progress(&self, timeout: Duration) {
        let mut epoch = self.epoch.lock();
        self.progress.wait_for(&mut epoch, timeout);
    }
}

impl Default for SuspensionCoordinator {
    fn default() -> Self {
        Self::new(HijackTargets::runtime_default())
    }
}

impl Thread {
    /// One handshake step: check whether this thread is parked, hijack it if not
    ///
    /// Called by the suspending thread with a suspension active. A successful
    /// result means the thread cannot run managed code until the suspension is
    /// released.
    pub fn try_synchronize_for_suspend(
        &self,
        suspender: &dyn ThreadSuspender,
        walker: &dyn StackWalker,
    ) -> SyncRequestResult {
        debug_assert!(
            self.coordinator.is_trap_threads_requested(),
            "handshake without an active suspension"
        );
        if !self.is_attached() {
            return SyncRequestResult::SuccessUnmanaged;
        }

        match self.mode() {
            ExecutionMode::Preemptive(_) if self.parked_at_hijack.load(Ordering::SeqCst) => {
                SyncRequestResult::SuccessManaged
            }
            ExecutionMode::Preemptive(_) => {
                // Outside managed code; a hijack armed earlier is no longer needed
                self.unhijack();
                SyncRequestResult::SuccessUnmanaged
            }
            ExecutionMode::Cooperative => {
                let outcome = self.hijack(suspender, walker);
                log::trace!("thread {}: not yet parked ({:?})", self.logging_id(), outcome);
                SyncRequestResult::TryAgain
            }
        }
    }
}
