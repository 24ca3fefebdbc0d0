//! Per-thread storage for thread statics
//!
//! Three tables, all append-only [`boxcar::Vec`]s: growing them never moves
//! an existing element, so pointers handed out earlier stay valid for the life
//! of the thread.
//! - static TLS sections of compiled modules, indexed by the module TLS index
//! - storage of dynamically loaded types, indexed by their TLS offset
//! - module thread-static storage objects, reported as roots

use crate::context::ObjectRef;
use crate::defaults::DYNAMIC_TYPE_TLS_OFFSET_FLAG;
use crate::thread::Thread;
use crate::{ThreadError, ThreadResult};
use once_cell::sync::OnceCell;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

const TLS_STORAGE_ALIGN: usize = 16;

/// One zeroed allocation holding a type's thread statics
struct TlsStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the storage is a plain heap block owned by this cell
unsafe impl Send for TlsStorage {}
unsafe impl Sync for TlsStorage {}

impl TlsStorage {
    fn allocate(size: u32) -> ThreadResult<Self> {
        if size == 0 {
            return Err(ThreadError::InvalidTlsSize(size));
        }
        let layout = Layout::from_size_align(size as usize, TLS_STORAGE_ALIGN)
            .map_err(|_| ThreadError::InvalidTlsSize(size))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(ThreadError::OutOfMemory(layout.size()))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for TlsStorage {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Cell table mapping a dynamic type's TLS offset to its storage
pub struct DynamicTypeTls {
    cells: boxcar::Vec<OnceCell<TlsStorage>>,
    initial_cells: u32,
}

impl DynamicTypeTls {
    /// Create an empty table that reserves `initial_cells` on first growth
    pub fn new(initial_cells: u32) -> Self {
        Self {
            cells: boxcar::Vec::new(),
            initial_cells,
        }
    }

    fn index(offset: u32) -> usize {
        (offset & !DYNAMIC_TYPE_TLS_OFFSET_FLAG) as usize
    }

    /// Number of cells currently in the table
    pub fn cell_count(&self) -> usize {
        self.cells.count()
    }

    /// Storage for `offset`, allocating `size` zeroed bytes on first request
    ///
    /// `cells` is the number of cells the type loader expects to need; the
    /// table grows to at least that many, at least doubling each time.
    /// Repeated calls for one offset return the same pointer.
    pub fn allocate(&self, offset: u32, size: u32, cells: u32) -> ThreadResult<NonNull<u8>> {
        let index = Self::index(offset);
        let cell = loop {
            if let Some(cell) = self.cells.get(index) {
                break cell;
            }
            self.grow(index, cells);
        };
        let storage = cell.get_or_try_init(|| TlsStorage::allocate(size))?;
        Ok(storage.ptr)
    }

    fn grow(&self, index: usize, cells: u32) {
        let count = self.cells.count();
        let target = (cells.max(self.initial_cells) as usize)
            .max(count * 2)
            .max(index + 1);
        while self.cells.count() < target {
            self.cells.push(OnceCell::new());
        }
    }

    /// Storage for `offset` if it has been allocated
    pub fn get(&self, offset: u32) -> Option<NonNull<u8>> {
        self.cells
            .get(Self::index(offset))
            .and_then(OnceCell::get)
            .map(|storage| storage.ptr)
    }
}

/// Static TLS sections of compiled modules, indexed by module TLS index
///
/// Each module the runtime loads gets a TLS index and a fixed-size section;
/// its thread statics live at fixed offsets inside the section.
pub struct StaticTls {
    sections: boxcar::Vec<OnceCell<TlsStorage>>,
}

impl StaticTls {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            sections: boxcar::Vec::new(),
        }
    }

    /// Section for `tls_index`, allocating `size` zeroed bytes on first request
    ///
    /// A section keeps the size it was first allocated with; asking for more
    /// later is an error.
    pub fn allocate(&self, tls_index: u32, size: u32) -> ThreadResult<NonNull<u8>> {
        let index = tls_index as usize;
        let section = loop {
            if let Some(section) = self.sections.get(index) {
                break section;
            }
            while self.sections.count() <= index {
                self.sections.push(OnceCell::new());
            }
        };
        let storage = section.get_or_try_init(|| TlsStorage::allocate(size))?;
        if (size as usize) > storage.layout.size() {
            return Err(ThreadError::TlsSectionTooSmall {
                tls_index,
                size: storage.layout.size(),
            });
        }
        Ok(storage.ptr)
    }

    /// Address `start_offset` bytes into the section for `tls_index`
    ///
    /// `None` if the section was never allocated or the offset lies outside it.
    pub fn get(&self, tls_index: u32, start_offset: u32) -> Option<NonNull<u8>> {
        let storage = self.sections.get(tls_index as usize)?.get()?;
        if start_offset as usize >= storage.layout.size() {
            return None;
        }
        // SAFETY: the offset is inside the section allocation
        NonNull::new(unsafe { storage.ptr.as_ptr().add(start_offset as usize) })
    }
}

impl Default for StaticTls {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-module thread static storage objects, indexed by module
///
/// Every non-null entry is an object the collector must treat as a root.
pub struct ModuleThreadStatics {
    slots: boxcar::Vec<AtomicUsize>,
}

impl ModuleThreadStatics {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            slots: boxcar::Vec::new(),
        }
    }

    /// Storage object registered for `module_index`
    pub fn get(&self, module_index: u32) -> ObjectRef {
        self.slots
            .get(module_index as usize)
            .map(|slot| ObjectRef::from_addr(slot.load(Ordering::Acquire)))
            .unwrap_or(ObjectRef::NULL)
    }

    /// Register the storage object for `module_index`, growing the table as needed
    pub fn set(&self, module_index: u32, storage: ObjectRef) {
        let index = module_index as usize;
        while self.slots.count() <= index {
            self.slots.push(AtomicUsize::new(0));
        }
        if let Some(slot) = self.slots.get(index) {
            slot.store(storage.addr(), Ordering::Release);
        }
    }

    /// Non-null slots, for root reporting
    pub(crate) fn root_slots(&self) -> impl Iterator<Item = NonNull<ObjectRef>> + '_ {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.load(Ordering::Acquire) != 0)
            .map(|(_, slot)| NonNull::from(slot).cast::<ObjectRef>())
    }
}

impl Default for ModuleThreadStatics {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread {
    /// Static TLS section of a module, allocating it on first use
    pub fn allocate_thread_local_storage(&self, tls_index: u32, size: u32) -> ThreadResult<NonNull<u8>> {
        self.static_tls.allocate(tls_index, size)
    }

    /// Address of a thread static at `start_offset` in a module's TLS section
    pub fn get_thread_local_storage(&self, tls_index: u32, start_offset: u32) -> Option<NonNull<u8>> {
        self.static_tls.get(tls_index, start_offset)
    }

    /// Storage for a dynamic type's thread statics, allocating it on first use
    pub fn allocate_thread_local_storage_for_dynamic_type(
        &self,
        offset: u32,
        size: u32,
        cells: u32,
    ) -> ThreadResult<NonNull<u8>> {
        self.dynamic_tls.allocate(offset, size, cells)
    }

    /// Storage for a dynamic type's thread statics, without allocating
    pub fn get_thread_local_storage_for_dynamic_type(&self, offset: u32) -> Option<NonNull<u8>> {
        self.dynamic_tls.get(offset)
    }

    /// Thread static storage object of a module
    pub fn thread_static_storage_for_module(&self, module_index: u32) -> ObjectRef {
        self.module_statics.get(module_index)
    }

    /// Register a module's thread static storage object
    pub fn set_thread_static_storage_for_module(&self, storage: ObjectRef, module_index: u32) {
        self.module_statics.set(module_index, storage);
    }
}
