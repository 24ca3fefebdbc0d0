//! Per-thread allocation context
//!
//! A bump-pointer window handed to a thread by the allocator. Generated
//! allocation helpers advance `alloc_ptr` without taking any lock; when the
//! window is exhausted they fall back to the allocator slow path, which hands
//! out a new window via [`AllocContext::set_window`].
//!
//! Layout is fixed (see [`ALLOC_CONTEXT_SIZE`](crate::defaults::ALLOC_CONTEXT_SIZE))
//! because the context is the first member of the control block.

/// Bump-pointer allocation window
///
/// Layout in memory (64-bit):
/// ```text
/// ┌──────────────────────────────┐
/// │ alloc_ptr        (8 bytes)   │
/// │ alloc_limit      (8 bytes)   │
/// │ alloc_bytes      (8 bytes)   │
/// │ alloc_bytes_uoh  (8 bytes)   │
/// │ gc_reserved_1    (8 bytes)   │
/// │ gc_reserved_2    (8 bytes)   │
/// │ alloc_count + pad (8 bytes)  │
/// └──────────────────────────────┘
/// ```
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocContext {
    /// Next free byte in the current window
    alloc_ptr: usize,
    /// End of the current window
    alloc_limit: usize,
    /// Bytes handed out from small-object windows
    alloc_bytes: i64,
    /// Bytes handed out for large objects
    alloc_bytes_uoh: i64,
    /// Owned by the collector
    gc_reserved_1: usize,
    /// Owned by the collector
    gc_reserved_2: usize,
    /// Number of windows handed out
    alloc_count: i32,
}

impl AllocContext {
    /// Create an empty context (no window)
    pub const fn new() -> Self {
        Self {
            alloc_ptr: 0,
            alloc_limit: 0,
            alloc_bytes: 0,
            alloc_bytes_uoh: 0,
            gc_reserved_1: 0,
            gc_reserved_2: 0,
            alloc_count: 0,
        }
    }

    /// Install a fresh window `[start, limit)`
    ///
    /// The unused tail of the previous window is not credited back.
    pub fn set_window(&mut self, start: usize, limit: usize) {
        debug_assert!(start <= limit, "inverted allocation window");
        self.alloc_bytes += (limit - start) as i64;
        self.alloc_ptr = start;
        self.alloc_limit = limit;
        self.alloc_count += 1;
    }

    /// Bump-allocate `size` bytes aligned to `align`. Returns `None` if the window is full.
    #[inline]
    pub fn try_bump(&mut self, size: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let start = self.alloc_ptr.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(size)?;
        if end > self.alloc_limit {
            return None;
        }
        self.alloc_ptr = end;
        Some(start)
    }

    /// Record a large-object allocation made outside the window
    pub fn record_uoh_allocation(&mut self, size: usize) {
        self.alloc_bytes_uoh += size as i64;
    }

    /// Drop the current window (collector side, while the owner is parked)
    pub fn retire(&mut self) {
        let unused = self.remaining() as i64;
        self.alloc_bytes -= unused;
        self.alloc_ptr = 0;
        self.alloc_limit = 0;
    }

    /// Bytes still available in the window
    pub fn remaining(&self) -> usize {
        self.alloc_limit.saturating_sub(self.alloc_ptr)
    }

    /// Next free address
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    /// Window end
    pub fn alloc_limit(&self) -> usize {
        self.alloc_limit
    }

    /// Total bytes handed out through windows
    pub fn allocated_bytes(&self) -> i64 {
        self.alloc_bytes
    }

    /// Total large-object bytes
    pub fn allocated_uoh_bytes(&self) -> i64 {
        self.alloc_bytes_uoh
    }

    /// Number of windows installed
    pub fn window_count(&self) -> i32 {
        self.alloc_count
    }
}
