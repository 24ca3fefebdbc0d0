//! Registry of attached threads
//!
//! The store owns every control block: it creates one when an OS thread
//! attaches, drops it after the thread detaches, and drives the stop-the-world
//! handshake across all of them.

use crate::config::RuntimeConfig;
use crate::context::StackBounds;
use crate::hijack::HijackTargets;
use crate::reverse_pinvoke::ReversePInvokeFrame;
use crate::scan::StackWalker;
use crate::suspend::{SuspensionCoordinator, ThreadSuspender};
use crate::thread::Thread;
use crate::{ThreadError, ThreadResult};
use dashmap::DashMap;
use log::{debug, warn};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Suspender id used when the suspending thread is not attached to the store
const UNATTACHED_SUSPENDER: u64 = u64::MAX;

thread_local! {
    static CURRENT_THREAD: RefCell<Option<(Weak<ThreadStore>, Arc<Thread>)>> =
        const { RefCell::new(None) };
}

/// Registry of all control blocks of one runtime
pub struct ThreadStore {
    /// Store identity, recorded in every block it creates
    id: u64,

    /// Attached threads by logging id
    threads: DashMap<u64, Arc<Thread>>,

    /// Runtime-wide suspension signal
    coordinator: Arc<SuspensionCoordinator>,

    /// Configuration shared with every block
    config: Arc<RuntimeConfig>,

    /// Weak self reference for the current-thread slot
    self_ref: Weak<ThreadStore>,
}

impl ThreadStore {
    /// Create a store using the trampolines compiled into this crate
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_hijack_targets(config, HijackTargets::runtime_default())
    }

    /// Create a store using explicit trampoline addresses
    pub fn with_hijack_targets(config: RuntimeConfig, targets: HijackTargets) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            threads: DashMap::new(),
            coordinator: Arc::new(SuspensionCoordinator::new(targets)),
            config: Arc::new(config),
            self_ref: self_ref.clone(),
        })
    }

    /// Runtime-wide suspension signal
    pub fn coordinator(&self) -> &Arc<SuspensionCoordinator> {
        &self.coordinator
    }

    /// Shared configuration
    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    // ===== Attach / detach =====

    /// Attach the calling OS thread, estimating its stack bounds
    pub fn attach_current_thread(&self) -> ThreadResult<Arc<Thread>> {
        let bounds = StackBounds::estimate_current(self.config.stack_size_hint);
        self.attach_current_thread_with_bounds(bounds)
    }

    /// Attach the calling OS thread with known stack bounds
    ///
    /// The new block starts cooperative. Attaching blocks while a suspension
    /// is active.
    pub fn attach_current_thread_with_bounds(&self, bounds: StackBounds) -> ThreadResult<Arc<Thread>> {
        let thread = self.register_current_thread(bounds)?;
        // Entering managed code is a regular transition, so it traps on an
        // active suspension
        thread.disable_preemptive_mode();
        Ok(thread)
    }

    /// Create, attach and register a block for the calling OS thread
    ///
    /// The block becomes visible to suspenders only after it is preemptive
    /// behind its outermost frame, so a suspension that starts at any point
    /// either sees it parked or is seen by its first transition.
    fn register_current_thread(&self, bounds: StackBounds) -> ThreadResult<Arc<Thread>> {
        CURRENT_THREAD.with(|current| {
            let mut current = current.borrow_mut();
            if let Some((store, thread)) = current.as_ref() {
                if thread.store_id() == self.id {
                    return Err(ThreadError::AlreadyAttached(thread.logging_id()));
                }
                if store.strong_count() > 0 && !thread.is_detached() {
                    return Err(ThreadError::AttachedElsewhere(thread.logging_id()));
                }
            }

            let thread = Arc::new(Thread::with_store(
                self.coordinator.clone(),
                self.config.clone(),
                self.id,
            ));
            thread.attach(bounds)?;
            thread.publish_top_of_stack_frame();

            self.threads.insert(thread.logging_id(), thread.clone());
            *current = Some((self.self_ref.clone(), thread.clone()));

            debug!(
                "thread store {}: attached thread {} ({} threads)",
                self.id,
                thread.logging_id(),
                self.threads.len()
            );
            Ok(thread)
        })
    }

    /// Detach the calling OS thread
    ///
    /// Returns false if the thread was not attached to this store.
    pub fn detach_current_thread(&self) -> bool {
        let thread = CURRENT_THREAD.with(|current| {
            let mut current = current.borrow_mut();
            match current.as_ref() {
                Some((_, thread)) if thread.store_id() == self.id => current.take(),
                _ => None,
            }
        });

        match thread {
            Some((_, thread)) => {
                thread.detach();
                self.threads.remove(&thread.logging_id());
                debug!(
                    "thread store {}: detached thread {} ({} threads)",
                    self.id,
                    thread.logging_id(),
                    self.threads.len()
                );
                true
            }
            None => false,
        }
    }

    /// Control block of the calling OS thread, if attached to this store
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        CURRENT_THREAD.with(|current| {
            current
                .borrow()
                .as_ref()
                .filter(|(_, thread)| thread.store_id() == self.id)
                .map(|(_, thread)| thread.clone())
        })
    }

    /// Look up a thread by logging id
    pub fn get(&self, logging_id: u64) -> Option<Arc<Thread>> {
        self.threads.get(&logging_id).map(|entry| entry.clone())
    }

    /// Number of attached threads
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Snapshot of all attached threads
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.iter().map(|entry| entry.value().clone()).collect()
    }

    // ===== Stop the world =====

    /// Bring every other attached thread to a safe point
    ///
    /// Returns the number of handshake passes. The caller owns the suspension
    /// until [`resume_all_threads`](Self::resume_all_threads). Suspensions are
    /// serialized: a second caller blocks until the first one resumes. While
    /// blocked, an attached cooperative caller parks behind the frame staged
    /// with [`Thread::set_pinvoke_tunnel_for_gc_alloc`].
    pub fn suspend_all_threads(&self, suspender: &dyn ThreadSuspender, walker: &dyn StackWalker) -> usize {
        let current = self.current_thread();
        let me = current
            .as_ref()
            .map(|thread| thread.logging_id())
            .unwrap_or(UNATTACHED_SUSPENDER);
        self.begin_suspension(current.as_deref(), me);
        debug!("thread store {}: suspending {} threads", self.id, self.threads.len());

        let started = Instant::now();
        let warn_after = self.config.suspend_warn_after();
        let mut warned = false;
        let mut passes = 0;

        loop {
            passes += 1;
            let mut pending = 0;

            for thread in self.threads() {
                if thread.logging_id() == me {
                    continue;
                }
                if thread.try_synchronize_for_suspend(suspender, walker).is_success() {
                    thread.cache_transition_frame_for_suspend();
                } else {
                    pending += 1;
                }
            }

            if pending == 0 {
                break;
            }
            if !warned && started.elapsed() >= warn_after {
                warn!(
                    "thread store {}: suspension still waiting on {} threads after {:?}",
                    self.id,
                    pending,
                    started.elapsed()
                );
                warned = true;
            }
            self.coordinator
                .wait_for_progress(self.config.suspend_poll_interval());
        }

        self.coordinator.stats.record_suspension(passes);
        debug!(
            "thread store {}: all threads suspended in {} passes ({:?})",
            self.id,
            passes,
            started.elapsed()
        );
        passes
    }

    fn begin_suspension(&self, current: Option<&Thread>, me: u64) {
        if self.coordinator.try_request_trap_threads(me) {
            return;
        }
        debug!("thread store {}: waiting for the active suspension", self.id);

        match current {
            Some(thread) if thread.is_current_thread_in_cooperative_mode() => {
                let frame = thread.staged_gc_frame();
                loop {
                    // SAFETY: the staged frame outlives the helper that is
                    // running this collection
                    unsafe { thread.enable_preemptive_mode(frame) };
                    self.coordinator.wait_until_gc_complete();
                    thread.disable_preemptive_mode();
                    if self.coordinator.try_request_trap_threads(me) {
                        return;
                    }
                }
            }
            _ => self.coordinator.request_trap_threads(me),
        }
    }

    /// Release the threads held by [`suspend_all_threads`](Self::suspend_all_threads)
    pub fn resume_all_threads(&self) {
        for thread in self.threads() {
            thread.unhijack();
            thread.reset_cached_transition_frame();
        }
        self.coordinator.release_trapped_threads();
        debug!("thread store {}: resumed", self.id);
    }

    // ===== Reverse entry =====

    /// Enter managed code from native code on the calling OS thread
    ///
    /// Attaches the thread on first entry. Blocks while a suspension is active.
    /// Pair with [`Thread::inline_reverse_pinvoke_return`].
    pub fn reverse_pinvoke_enter(&self, frame: &mut ReversePInvokeFrame) -> ThreadResult<Arc<Thread>> {
        let thread = match self.current_thread() {
            Some(thread) => thread,
            None => {
                let bounds = StackBounds::estimate_current(self.config.stack_size_hint);
                self.register_current_thread(bounds)?
            }
        };

        if !thread.inline_try_fast_reverse_pinvoke(frame) {
            thread.reverse_pinvoke_attach_or_trap_thread(frame);
        }
        Ok(thread)
    }
}

impl std::fmt::Debug for ThreadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadStore")
            .field("id", &self.id)
            .field("threads", &self.threads.len())
            .field("suspending", &self.coordinator.is_trap_threads_requested())
            .finish()
    }
}
