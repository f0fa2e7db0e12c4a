use crate::error::{Error, Result};

use bitvec::vec::BitVec;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use std::{
    fmt, io,
    ptr::{self, NonNull},
};

/// `int3`, written over every byte of a slot that holds no live code.
const TRAP: u8 = 0xCC;

/// Sizing of an [`ExecPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bytes reserved for a single trampoline. Must be a power of two of at least 16.
    pub slot_size: usize,
    /// Bytes mapped at once when the pool runs out of slots. Must be a multiple of the system
    /// page size.
    pub page_size: usize,
    /// Upper bound on the number of mapped pages, `None` for unbounded growth.
    pub max_pages: Option<usize>,
}

impl PoolConfig {
    /// Slot size used by [`PoolConfig::default`], large enough for the longest stack relocation
    /// sequence.
    pub const DEFAULT_SLOT_SIZE: usize = 256;

    /// Replace the slot size.
    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    /// Replace the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Cap the number of pages the pool may map.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Check that the configuration describes a usable pool.
    pub fn validate(&self) -> Result<()> {
        if !self.slot_size.is_power_of_two() || self.slot_size < 16 {
            return Err(Error::InvalidConfig(
                "slot size must be a power of two of at least 16 bytes",
            ));
        }
        if self.page_size == 0 || self.page_size % system_page_size() != 0 {
            return Err(Error::InvalidConfig(
                "page size must be a non-zero multiple of the system page size",
            ));
        }
        if self.slot_size > self.page_size {
            return Err(Error::InvalidConfig("slot size exceeds page size"));
        }
        if self.max_pages == Some(0) {
            return Err(Error::InvalidConfig("max_pages must allow at least one page"));
        }

        Ok(())
    }

    /// Number of slots carved out of every page.
    pub fn slots_per_page(&self) -> usize {
        self.page_size / self.slot_size
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slot_size: Self::DEFAULT_SLOT_SIZE,
            page_size: system_page_size(),
            max_pages: None,
        }
    }
}

/// Page size reported by the operating system.
pub fn system_page_size() -> usize {
    static PAGE_SIZE: Lazy<usize> =
        Lazy::new(|| page_size_or_fallback(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }));

    *PAGE_SIZE
}

const FALLBACK_PAGE_SIZE: usize = 4096;

fn page_size_or_fallback(reported: libc::c_long) -> usize {
    match usize::try_from(reported) {
        Ok(size) if size > 0 => size,
        _ => {
            warn!(
                reported,
                fallback = FALLBACK_PAGE_SIZE,
                "sysconf did not report a page size"
            );
            FALLBACK_PAGE_SIZE
        }
    }
}

/// Occupancy counters of an [`ExecPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Pages mapped so far.
    pub pages: usize,
    /// Slots provided by those pages.
    pub capacity: usize,
    /// Slots currently handed out.
    pub live: usize,
}

/// A pool of read/write/execute memory handed out in fixed-size [`Slot`]s.
///
/// Pages are mapped lazily, one at a time, whenever every existing slot is taken. Released slots
/// go back on a free stack and are reused before the pool grows again; pages stay mapped until
/// the pool itself is dropped. The pool is internally locked, so slots may be acquired and
/// released from several threads.
pub struct ExecPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    pages: Vec<Page>,
    /// Indices of unused slots, most recently released on top.
    free: Vec<usize>,
    live: BitVec,
}

impl ExecPool {
    /// Create a pool with the default configuration. No memory is mapped until the first
    /// [`acquire`](Self::acquire).
    pub fn new() -> Self {
        Self::from_valid(PoolConfig::default())
    }

    /// Create a pool with a custom configuration.
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    fn from_valid(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// The process-wide pool used by [`Trampoline::new`](crate::Trampoline::new).
    ///
    /// It is created on first use and never torn down.
    pub fn global() -> &'static ExecPool {
        static GLOBAL: Lazy<ExecPool> = Lazy::new(ExecPool::new);
        &GLOBAL
    }

    /// The configuration this pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take a free slot, mapping a new page if none is left.
    pub fn acquire(&self) -> Result<Slot<'_>> {
        let mut state = self.state.lock();

        let index = match state.free.pop() {
            Some(index) => index,
            None => self.grow(&mut state)?,
        };
        state.live.set(index, true);

        let ptr = self.slot_ptr(&state, index);
        trace!(index, addr = ?ptr, "acquired slot");

        Ok(Slot {
            pool: self,
            ptr,
            index,
        })
    }

    /// Return a slot to the pool. Equivalent to dropping it.
    ///
    /// # Panics
    /// If the slot was handed out by a different pool.
    pub fn release(&self, slot: Slot<'_>) {
        assert!(
            ptr::eq(slot.pool, self),
            "slot released into a pool that did not hand it out"
        );
        drop(slot);
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            pages: state.pages.len(),
            capacity: state.pages.len() * self.config.slots_per_page(),
            live: state.live.count_ones(),
        }
    }

    /// Map one more page, queue all but its first slot as free and return that first slot.
    fn grow(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(max_pages) = self.config.max_pages {
            if state.pages.len() >= max_pages {
                return Err(Error::Exhausted {
                    pages: state.pages.len(),
                });
            }
        }

        let page = Page::map(self.config.page_size)?;
        debug!(
            addr = ?page.base,
            len = page.len,
            page = state.pages.len(),
            "mapped executable page"
        );

        let per_page = self.config.slots_per_page();
        let first = state.pages.len() * per_page;
        state.pages.push(page);
        state.live.resize(first + per_page, false);
        // Lowest address ends up on top of the stack.
        state.free.extend((first + 1..first + per_page).rev());

        Ok(first)
    }

    fn slot_ptr(&self, state: &PoolState, index: usize) -> NonNull<u8> {
        let per_page = self.config.slots_per_page();
        let page = &state.pages[index / per_page];
        let offset = (index % per_page) * self.config.slot_size;
        debug_assert!(offset + self.config.slot_size <= page.len);

        unsafe { page.base.add(offset) }
    }

    fn release_index(&self, index: usize, ptr: NonNull<u8>) {
        let mut state = self.state.lock();
        assert!(state.live[index], "slot {index} released twice");

        unsafe { ptr::write_bytes(ptr.as_ptr(), TRAP, self.config.slot_size) };
        state.live.set(index, false);
        state.free.push(index);
        trace!(index, "released slot");
    }
}

impl Default for ExecPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One anonymous read/write/execute mapping.
struct Page {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is exclusively owned by the page, and its bookkeeping is only touched with the
// pool lock held.
unsafe impl Send for Page {}

impl Page {
    fn map(len: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Map {
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| Error::Map {
            size: len,
            source: io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"),
        })?;
        unsafe { ptr::write_bytes(base.as_ptr(), TRAP, len) };

        Ok(Self { base, len })
    }
}

/// # Safety
/// `[base, base + len)` must not be accessed afterwards.
unsafe fn unmap(base: NonNull<u8>, len: usize) -> io::Result<()> {
    if unsafe { libc::munmap(base.as_ptr().cast(), len) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Drop for Page {
    fn drop(&mut self) {
        match unsafe { unmap(self.base, self.len) } {
            Ok(()) => debug!(addr = ?self.base, len = self.len, "unmapped executable page"),
            Err(err) => warn!(
                addr = ?self.base,
                len = self.len,
                error = %err,
                "failed to unmap executable page"
            ),
        }
    }
}

/// Exclusive handle to one slot of an [`ExecPool`]. Dropping it returns the slot to the pool.
pub struct Slot<'p> {
    pool: &'p ExecPool,
    ptr: NonNull<u8>,
    index: usize,
}

impl Slot<'_> {
    /// Address of the first byte of the slot.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size of the slot in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.config.slot_size
    }

    /// Position of the slot across all pages of its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Copy machine code to the start of the slot and pad the remainder with `int3`.
    pub fn write(&mut self, code: &[u8]) -> Result<()> {
        let capacity = self.capacity();
        if code.len() > capacity {
            return Err(Error::CodeTooLarge {
                len: code.len(),
                capacity,
            });
        }

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
            ptr::write_bytes(
                self.ptr.as_ptr().add(code.len()),
                TRAP,
                capacity - code.len(),
            );
        }

        Ok(())
    }

    #[cfg(test)]
    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity()) }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.pool.release_index(self.index, self.ptr);
    }
}

impl fmt::Debug for Slot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("addr", &self.ptr)
            .field("capacity", &self.capacity())
            .finish()
    }
}
