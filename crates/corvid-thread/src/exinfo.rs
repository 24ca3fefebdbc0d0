//! Exception-info chain
//!
//! Every in-flight exception dispatch pass owns one [`ExInfo`] record, allocated
//! on the dispatching frame's stack and linked into the owning thread's chain.
//! The chain is strictly LIFO. Records are popped only once the unwind has
//! moved past them; popping anything else means the dispatcher is broken and
//! is treated as fatal.
//!
//! The exception object held by each record is invisible to ordinary stack
//! scanning, so [`Thread::scan_roots`](crate::Thread::scan_roots) reports it
//! explicitly.

use crate::context::{LimitedContext, ObjectRef, StackBounds};
use crate::thread::Thread;
use bitflags::bitflags;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    /// Kind of exception being dispatched
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExKind: u8 {
        /// Raised by a throw
        const THROW = 0x01;
        /// Raised by a hardware fault
        const HARDWARE_FAULT = 0x02;
        /// Mask over the base kind
        const KIND_MASK = 0x03;
        /// Dispatch is a rethrow
        const RETHROW = 0x04;
        /// Record was superseded by a nested dispatch and is dead
        const SUPERSEDED = 0x08;
        /// Fault was raised by the faulting instruction itself
        const INSTRUCTION_FAULT = 0x10;
    }
}

/// One exception dispatch record
///
/// Shared with managed dispatch code, so the layout is `#[repr(C)]`.
#[repr(C)]
#[derive(Debug)]
pub struct ExInfo {
    prev: *mut ExInfo,
    context: LimitedContext,
    exception: ObjectRef,
    kind: ExKind,
    pass_number: u8,
    clause_index: u32,
    stack_pointer: usize,
    notify_debugger_sp: AtomicUsize,
}

impl ExInfo {
    /// Create an unlinked record for a dispatch starting at `context`
    ///
    /// `stack_pointer` is the stack position of the dispatching frame.
    pub fn new(context: LimitedContext, exception: ObjectRef, kind: ExKind, stack_pointer: usize) -> Self {
        Self {
            prev: ptr::null_mut(),
            context,
            exception,
            kind,
            pass_number: 1,
            clause_index: 0,
            stack_pointer,
            notify_debugger_sp: AtomicUsize::new(0),
        }
    }

    /// Next-older record
    pub fn prev(&self) -> Option<NonNull<ExInfo>> {
        NonNull::new(self.prev)
    }

    /// Register state at the throw
    pub fn context(&self) -> &LimitedContext {
        &self.context
    }

    /// Exception object being dispatched
    pub fn exception(&self) -> ObjectRef {
        self.exception
    }

    /// Replace the exception object (rethrow of a different object)
    pub fn set_exception(&mut self, exception: ObjectRef) {
        self.exception = exception;
    }

    /// Dispatch kind
    pub fn kind(&self) -> ExKind {
        self.kind
    }

    /// Mark this record dead because a nested dispatch replaced it
    pub fn mark_superseded(&mut self) {
        self.kind |= ExKind::SUPERSEDED;
    }

    /// 1 during the search pass, 2 during the unwind pass
    pub fn pass_number(&self) -> u8 {
        self.pass_number
    }

    /// Switch to the second (unwind) pass
    pub fn begin_unwind_pass(&mut self) {
        self.pass_number = 2;
        self.clause_index = 0;
    }

    /// Clause to resume at when re-entering handler/filter/finally dispatch
    pub fn clause_index(&self) -> u32 {
        self.clause_index
    }

    /// Record the clause being executed
    pub fn set_clause_index(&mut self, index: u32) {
        self.clause_index = index;
    }

    /// Stack position of the dispatching frame
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    /// Stack pointer at which the debugger wants a notification, 0 for none
    pub fn notify_debugger_sp(&self) -> usize {
        self.notify_debugger_sp.load(Ordering::Relaxed)
    }

    /// Request a debugger notification when the unwind reaches `sp`
    pub fn set_notify_debugger_sp(&self, sp: usize) {
        self.notify_debugger_sp.store(sp, Ordering::Relaxed);
    }

    pub(crate) fn exception_slot(this: NonNull<ExInfo>) -> NonNull<ObjectRef> {
        // SAFETY: `this` is a live record on a parked thread's chain
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*this.as_ptr()).exception)) }
    }
}

/// Structural problem found while validating the chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExInfoError {
    /// The record being popped is not the chain head
    #[error("Popped record {popped:#x} is not the chain head {head:#x}")]
    NotHead {
        /// Address of the record being popped
        popped: usize,
        /// Address of the current head, 0 if empty
        head: usize,
    },

    /// The unwind has not yet moved past the record being popped
    #[error("Record at sp {entry_sp:#x} is still live above limit sp {limit_sp:#x}")]
    StillLive {
        /// Recorded frame position
        entry_sp: usize,
        /// Current unwind limit
        limit_sp: usize,
    },

    /// An older record already passed by the unwind was not superseded
    #[error("Record at sp {entry_sp:#x} below limit sp {limit_sp:#x} was not superseded")]
    NotSuperseded {
        /// Recorded frame position
        entry_sp: usize,
        /// Current unwind limit
        limit_sp: usize,
    },

    /// A younger record sits at or above an older one on the stack
    #[error("Chain out of order: record at sp {younger_sp:#x} is not below older record at sp {older_sp:#x}")]
    OutOfOrder {
        /// Younger record's frame position
        younger_sp: usize,
        /// Older record's frame position
        older_sp: usize,
    },

    /// A record lies outside the owning thread's stack
    #[error("Record at sp {entry_sp:#x} is outside the thread stack [{low:#x}, {high:#x})")]
    OutsideStack {
        /// Recorded frame position
        entry_sp: usize,
        /// Low stack bound
        low: usize,
        /// High stack bound
        high: usize,
    },
}

impl Thread {
    /// Current chain head
    pub fn cur_ex_info(&self) -> Option<NonNull<ExInfo>> {
        NonNull::new(self.buffer.ex_info_head.load(Ordering::Acquire))
    }

    /// Link `info` as the new chain head
    ///
    /// # Safety
    ///
    /// Must be called by the owning thread. `info` must stay alive and pinned
    /// until it has been popped with [`pop_ex_info`](Self::pop_ex_info).
    pub unsafe fn push_ex_info(&self, info: NonNull<ExInfo>) {
        debug_assert!(self.is_current_thread(), "exception chain mutated by a foreign thread");
        (*info.as_ptr()).prev = self.buffer.ex_info_head.load(Ordering::Relaxed);
        self.buffer.ex_info_head.store(info.as_ptr(), Ordering::Release);
    }

    /// Unlink the chain head once the unwind has reached `limit_sp`
    ///
    /// Panics if [`validate_ex_info_pop`](Self::validate_ex_info_pop) fails:
    /// the dispatcher has lost track of its records and cannot continue safely.
    pub fn pop_ex_info(&self, info: NonNull<ExInfo>, limit_sp: usize) {
        if let Err(err) = self.validate_ex_info_pop(info, limit_sp) {
            log::error!("thread {}: exception chain corrupted: {}", self.logging_id(), err);
            panic!("exception chain corrupted: {}", err);
        }
        // SAFETY: validated as the live head
        let prev = unsafe { (*info.as_ptr()).prev };
        self.buffer.ex_info_head.store(prev, Ordering::Release);
    }

    /// Check that `info` may be popped with the unwind at `limit_sp`
    ///
    /// The record must be the head and lie below `limit_sp`. Older records that
    /// the unwind has also passed must already be superseded.
    pub fn validate_ex_info_pop(&self, info: NonNull<ExInfo>, limit_sp: usize) -> Result<(), ExInfoError> {
        self.validate_ex_info_stack()?;

        let head = self.buffer.ex_info_head.load(Ordering::Acquire);
        if head != info.as_ptr() {
            return Err(ExInfoError::NotHead {
                popped: info.as_ptr() as usize,
                head: head as usize,
            });
        }

        // SAFETY: chain records stay alive until popped
        let entry = unsafe { info.as_ref() };
        if entry.stack_pointer >= limit_sp {
            return Err(ExInfoError::StillLive {
                entry_sp: entry.stack_pointer,
                limit_sp,
            });
        }

        let mut cur = entry.prev;
        while let Some(older) = unsafe { cur.as_ref() } {
            if older.stack_pointer >= limit_sp {
                break;
            }
            if !older.kind.contains(ExKind::SUPERSEDED) {
                return Err(ExInfoError::NotSuperseded {
                    entry_sp: older.stack_pointer,
                    limit_sp,
                });
            }
            cur = older.prev;
        }
        Ok(())
    }

    /// Walk the whole chain checking ordering and stack bounds
    ///
    /// An integrity check for debugging, not a steady-state operation.
    pub fn validate_ex_info_stack(&self) -> Result<(), ExInfoError> {
        let bounds = self.stack_bounds();
        let mut younger_sp: Option<usize> = None;
        let mut cur = self.buffer.ex_info_head.load(Ordering::Acquire);

        // SAFETY: chain records stay alive until popped
        while let Some(entry) = unsafe { cur.as_ref() } {
            check_within(bounds, entry.stack_pointer)?;
            if let Some(younger) = younger_sp {
                if younger >= entry.stack_pointer {
                    return Err(ExInfoError::OutOfOrder {
                        younger_sp: younger,
                        older_sp: entry.stack_pointer,
                    });
                }
            }
            younger_sp = Some(entry.stack_pointer);
            cur = entry.prev;
        }
        Ok(())
    }

    /// Number of records on the chain
    pub fn ex_info_depth(&self) -> usize {
        self.ex_info_records().count()
    }

    pub(crate) fn ex_info_records(&self) -> impl Iterator<Item = NonNull<ExInfo>> + '_ {
        let mut cur = NonNull::new(self.buffer.ex_info_head.load(Ordering::Acquire));
        std::iter::from_fn(move || {
            let entry = cur?;
            // SAFETY: chain records stay alive until popped
            cur = unsafe { entry.as_ref() }.prev();
            Some(entry)
        })
    }
}

fn check_within(bounds: StackBounds, sp: usize) -> Result<(), ExInfoError> {
    if bounds.is_known() && !bounds.contains(sp) {
        return Err(ExInfoError::OutsideStack {
            entry_sp: sp,
            low: bounds.low,
            high: bounds.high,
        });
    }
    Ok(())
}
