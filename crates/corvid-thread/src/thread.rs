//! Per-thread control block
//!
//! One [`Thread`] exists per OS thread that runs managed code. The thread
//! store creates it on attach and drops it after detach; the thread itself
//! owns every field while it runs, and the collector reads them only while the
//! thread is parked (preemptive or at a hijack landing).
//!
//! The behaviour is split across modules by concern:
//! - `mode`: cooperative/preemptive transitions
//! - `hijack`: return-address hijacking
//! - `exinfo`: exception-info chain
//! - `scan`: root enumeration
//! - `reverse_pinvoke`: native-to-managed entry
//! - `tls`: thread statics

use crate::alloc_context::AllocContext;
use crate::config::RuntimeConfig;
use crate::context::{StackBounds, TransitionFrame};
use crate::defaults::TOP_OF_STACK_MARKER;
use crate::flags::ThreadStateFlags;
use crate::layout::ThreadBuffer;
use crate::suspend::SuspensionCoordinator;
use crate::tls::{DynamicTypeTls, ModuleThreadStatics, StaticTls};
use crate::{ThreadError, ThreadResult};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

static NEXT_LOGGING_ID: AtomicU64 = AtomicU64::new(1);

/// Thread control block
///
/// `#[repr(C)]` with [`ThreadBuffer`] first, so a `*const Thread` is also a
/// pointer to the offset-sensitive prefix that generated code uses.
#[repr(C)]
pub struct Thread {
    /// Offset-sensitive prefix
    pub(crate) buffer: ThreadBuffer,

    /// OS thread that owns this block
    os_thread: ThreadId,

    /// Stable id for logs
    logging_id: u64,

    /// Store that registered this block, 0 for standalone blocks
    store_id: u64,

    /// Runtime-wide suspension signal
    pub(crate) coordinator: Arc<SuspensionCoordinator>,

    /// Runtime configuration
    pub(crate) config: Arc<RuntimeConfig>,

    /// Set while the thread is parked at a hijack landing
    pub(crate) parked_at_hijack: AtomicBool,

    /// Static TLS sections of compiled modules
    pub(crate) static_tls: StaticTls,

    /// Thread statics of dynamically loaded types
    pub(crate) dynamic_tls: DynamicTypeTls,

    /// Thread statics of modules, reported as roots
    pub(crate) module_statics: ModuleThreadStatics,

    /// GC stress random generator
    gc_stress_rng: Mutex<Option<SmallRng>>,

    /// Outermost frame of a thread that entered managed code from native code
    top_of_stack_frame: TransitionFrame,
}

// SAFETY: the allocation context is the only non-atomic shared state. It is
// written by the owning thread and read by the collector only while the owner
// is parked, which the suspension protocol enforces.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Create an unattached control block owned by the calling OS thread
    pub fn new(coordinator: Arc<SuspensionCoordinator>, config: Arc<RuntimeConfig>) -> Self {
        Self::with_store(coordinator, config, 0)
    }

    pub(crate) fn with_store(
        coordinator: Arc<SuspensionCoordinator>,
        config: Arc<RuntimeConfig>,
        store_id: u64,
    ) -> Self {
        Self {
            buffer: ThreadBuffer::new(),
            os_thread: std::thread::current().id(),
            logging_id: NEXT_LOGGING_ID.fetch_add(1, Ordering::Relaxed),
            store_id,
            static_tls: StaticTls::new(),
            dynamic_tls: DynamicTypeTls::new(config.initial_tls_cells),
            module_statics: ModuleThreadStatics::new(),
            coordinator,
            config,
            parked_at_hijack: AtomicBool::new(false),
            gc_stress_rng: Mutex::new(None),
            top_of_stack_frame: TransitionFrame::capture(TOP_OF_STACK_MARKER, 0, 0),
        }
    }

    // ===== Lifecycle =====

    /// Attach hook: record stack bounds and mark the block attached
    pub fn attach(&self, bounds: StackBounds) -> ThreadResult<()> {
        let flags = self.flags();
        if flags.contains(ThreadStateFlags::DETACHED) {
            return Err(ThreadError::Detached(self.logging_id));
        }
        if flags.contains(ThreadStateFlags::ATTACHED) {
            return Err(ThreadError::AlreadyAttached(self.logging_id));
        }

        self.buffer.stack_low.store(bounds.low, Ordering::Relaxed);
        self.buffer.stack_high.store(bounds.high, Ordering::Relaxed);

        if self.config.gc_stress_level > 0 {
            let seed = self
                .config
                .gc_stress_seed
                .unwrap_or_else(rand::random::<u64>);
            self.set_random_seed(seed);
        }

        self.buffer.set_flags(ThreadStateFlags::ATTACHED);
        log::debug!(
            "thread {} attached, stack [{:#x}, {:#x})",
            self.logging_id,
            bounds.low,
            bounds.high
        );
        Ok(())
    }

    /// Detach hook: terminal, cancels any outstanding hijack
    pub fn detach(&self) {
        self.unhijack();
        self.buffer.set_flags(ThreadStateFlags::DETACHED);
        log::debug!("thread {} detached", self.logging_id);
    }

    /// Check whether the block has left its initial state
    pub fn is_initialized(&self) -> bool {
        self.flags() != ThreadStateFlags::UNKNOWN
    }

    /// Check whether the block is attached and not yet detached
    pub fn is_attached(&self) -> bool {
        let flags = self.flags();
        flags.contains(ThreadStateFlags::ATTACHED) && !flags.contains(ThreadStateFlags::DETACHED)
    }

    /// Check whether the block has been detached
    pub fn is_detached(&self) -> bool {
        self.flags().contains(ThreadStateFlags::DETACHED)
    }

    // ===== Identity =====

    /// Check whether the caller runs on the owning OS thread
    #[inline]
    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.os_thread
    }

    /// Owning OS thread
    pub fn os_thread_id(&self) -> ThreadId {
        self.os_thread
    }

    /// Stable id used in logs
    pub fn logging_id(&self) -> u64 {
        self.logging_id
    }

    pub(crate) fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Sentinel frame for a thread with no managed caller; never written
    pub(crate) fn top_of_stack_frame(&self) -> NonNull<TransitionFrame> {
        NonNull::from(&self.top_of_stack_frame)
    }

    /// Runtime-wide suspension signal this block reports to
    pub fn coordinator(&self) -> &Arc<SuspensionCoordinator> {
        &self.coordinator
    }

    // ===== Flags =====

    /// Current state flags
    pub fn flags(&self) -> ThreadStateFlags {
        self.buffer.flags()
    }

    /// Check the suppress-GC-stress flag
    pub fn is_suppress_gc_stress_set(&self) -> bool {
        self.flags().contains(ThreadStateFlags::SUPPRESS_GC_STRESS)
    }

    /// Disable GC stress on this thread
    pub fn set_suppress_gc_stress(&self) {
        self.buffer.set_flags(ThreadStateFlags::SUPPRESS_GC_STRESS);
    }

    /// Re-enable GC stress on this thread
    pub fn clear_suppress_gc_stress(&self) {
        self.buffer.clear_flags(ThreadStateFlags::SUPPRESS_GC_STRESS);
    }

    /// Check the do-not-trigger-GC flag
    pub fn is_do_not_trigger_gc_set(&self) -> bool {
        self.flags().contains(ThreadStateFlags::DO_NOT_TRIGGER_GC)
    }

    /// Forbid hijacking and GC-triggering allocation on this thread
    pub fn set_do_not_trigger_gc(&self) {
        self.buffer.set_flags(ThreadStateFlags::DO_NOT_TRIGGER_GC);
    }

    /// Lift the do-not-trigger-GC restriction
    pub fn clear_do_not_trigger_gc(&self) {
        self.buffer.clear_flags(ThreadStateFlags::DO_NOT_TRIGGER_GC);
    }

    /// Mark or unmark this thread as a background GC worker
    pub fn set_gc_special(&self, is_gc_special: bool) {
        if is_gc_special {
            self.buffer.set_flags(ThreadStateFlags::IS_GC_SPECIAL);
        } else {
            self.buffer.clear_flags(ThreadStateFlags::IS_GC_SPECIAL);
        }
    }

    /// Check whether this is a background GC worker
    pub fn is_gc_special(&self) -> bool {
        self.flags().contains(ThreadStateFlags::IS_GC_SPECIAL)
    }

    /// Ask a background GC worker whether it may yield to a foreground GC here
    ///
    /// Only GC workers poll this, and they only do so at points where yielding
    /// is always acceptable.
    pub fn catch_at_safe_point(&self) -> bool {
        debug_assert!(self.is_gc_special(), "safe-point poll from a non-GC thread");
        true
    }

    // ===== Stack bounds =====

    /// Stack range recorded at attach
    pub fn stack_bounds(&self) -> StackBounds {
        StackBounds::new(
            self.buffer.stack_low.load(Ordering::Relaxed),
            self.buffer.stack_high.load(Ordering::Relaxed),
        )
    }

    /// Check whether `addr` lies on this thread's stack
    pub fn is_within_stack_bounds(&self, addr: usize) -> bool {
        self.stack_bounds().contains(addr)
    }

    // ===== Allocation context =====

    /// Address of the allocation context, for generated allocation helpers
    pub fn alloc_context(&self) -> NonNull<AllocContext> {
        // SAFETY: UnsafeCell::get never returns null
        unsafe { NonNull::new_unchecked(self.buffer.alloc_context.get()) }
    }

    /// Mutable access to the allocation context
    ///
    /// # Safety
    ///
    /// The caller must be the owning thread, or the owning thread must be
    /// parked for the duration of the borrow. No other borrow may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn alloc_context_mut(&self) -> &mut AllocContext {
        &mut *self.buffer.alloc_context.get()
    }

    // ===== GC stress =====

    /// Seed the GC stress generator
    pub fn set_random_seed(&self, seed: u64) {
        *self.gc_stress_rng.lock() = Some(SmallRng::seed_from_u64(seed));
        self.buffer.set_flags(ThreadStateFlags::IS_RAND_SEED_SET);
    }

    /// Check whether the GC stress generator has been seeded
    pub fn is_rand_inited(&self) -> bool {
        self.flags().contains(ThreadStateFlags::IS_RAND_SEED_SET)
    }

    /// Next GC stress random number, seeding from entropy on first use
    pub fn next_rand(&self) -> u32 {
        let mut rng = self.gc_stress_rng.lock();
        if rng.is_none() {
            *rng = Some(SmallRng::from_entropy());
            self.buffer.set_flags(ThreadStateFlags::IS_RAND_SEED_SET);
        }
        rng.as_mut().map(|r| r.gen::<u32>()).unwrap_or_default()
    }

    /// Decide whether an allocation on this thread should force a collection
    pub fn should_inject_gc_stress(&self) -> bool {
        let level = self.config.gc_stress_level;
        if level == 0 || self.is_suppress_gc_stress_set() || self.is_do_not_trigger_gc_set() {
            return false;
        }
        self.next_rand() % level.max(1) == 0
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("logging_id", &self.logging_id)
            .field("flags", &self.flags())
            .field("mode", &self.mode())
            .field("hijacked", &self.is_hijacked())
            .finish()
    }
}
