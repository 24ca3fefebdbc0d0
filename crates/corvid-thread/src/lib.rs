//! Corvid Runtime Thread Core
//!
//! This crate provides the per-thread control block of the Corvid managed runtime
//! and the handshake that lets the collector suspend, inspect, and resume
//! application threads:
//! - **Control block**: allocation cache, state flags, stack bounds, exception chain (`thread`, `layout`)
//! - **Mode protocol**: cooperative/preemptive switching and transition frames (`mode`)
//! - **Hijacking**: redirecting a pending return into a safe-point trampoline (`hijack`)
//! - **Exception-info chain**: LIFO dispatch records with pop validation (`exinfo`)
//! - **Root scanning**: stack-walk driven root enumeration plus extra roots (`scan`)
//! - **Reverse entry**: native-to-managed gate with attach-on-demand (`reverse_pinvoke`)
//!
//! The collector algorithm, the stack unwinder and OS thread suspension are
//! collaborators supplied through the [`StackWalker`] and [`ThreadSuspender`] traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use corvid_thread::{RuntimeConfig, ThreadStore, TransitionFrame};
//!
//! let store = ThreadStore::new(RuntimeConfig::default());
//! let thread = store.attach_current_thread()?;
//!
//! // Leave managed code for the duration of a native call
//! let frame = TransitionFrame::capture(return_address, sp, fp);
//! thread.run_preemptive(&frame, || native_call());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

// ============================================================================
// Core Modules
// ============================================================================

pub mod alloc_context;
pub mod arch;
pub mod config;
pub mod context;
pub mod defaults;
pub mod exinfo;
pub mod flags;
pub mod hijack;
pub mod layout;
pub mod mode;
pub mod reverse_pinvoke;
pub mod scan;
pub mod store;
pub mod suspend;
pub mod thread;
pub mod tls;

// ============================================================================
// Re-exports
// ============================================================================

pub use alloc_context::AllocContext;
pub use config::{ConfigError, ConfigProvider, EnvConfigProvider, RuntimeConfig};
pub use context::{
    FrameFlags, LimitedContext, ObjectRef, PublishedFrame, RootFlags, RootSlot, StackBounds,
    TransitionFrame,
};
pub use exinfo::{ExInfo, ExInfoError, ExKind};
pub use flags::ThreadStateFlags;
pub use hijack::{
    HijackOutcome, HijackTargets, ReturnAddressLocation, ReturnKind, ReturnSlot, UnhijackOutcome,
};
pub use layout::ThreadBuffer;
pub use mode::{ExecutionMode, PreemptiveGuard};
pub use reverse_pinvoke::ReversePInvokeFrame;
pub use scan::{ScanSummary, StackWalker, WalkStart};
pub use store::ThreadStore;
pub use suspend::{SuspendStats, SuspensionCoordinator, SyncRequestResult, ThreadSuspender};
pub use thread::Thread;
pub use tls::{DynamicTypeTls, ModuleThreadStatics, StaticTls};

/// Thread core errors
///
/// Only conditions a caller can act on are reported here. Broken protocol
/// invariants (unbalanced transitions, out-of-order exception pops) are fatal
/// and never surface as a `ThreadError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    /// The OS thread already has an attached control block in this store
    #[error("Thread {0} is already attached")]
    AlreadyAttached(u64),

    /// The OS thread is attached to a different thread store
    #[error("Thread {0} is attached to another thread store")]
    AttachedElsewhere(u64),

    /// Detach is terminal; a detached control block cannot be reattached
    #[error("Thread {0} has been detached")]
    Detached(u64),

    /// Requested thread-local storage has an invalid size
    #[error("Invalid thread-local storage size: {0}")]
    InvalidTlsSize(u32),

    /// A module TLS section was already allocated smaller than requested
    #[error("Thread-local storage section {tls_index} holds only {size} bytes")]
    TlsSectionTooSmall {
        /// Module TLS index
        tls_index: u32,
        /// Size of the existing section
        size: usize,
    },

    /// The allocator could not satisfy a storage request
    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),
}

/// Thread core result
pub type ThreadResult<T> = Result<T, ThreadError>;
