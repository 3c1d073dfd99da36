//! Built-in allocator confined to a reserved address range.
//!
//! The whole range is reserved up front with `PROT_NONE` and committed in
//! steps as the bump pointer advances. Small requests are served from
//! size-class free lists, everything else from page-granular spans. Each
//! block is preceded by a [`BlockHeader`] that records how to release it.
//!
//! The heap never calls back into the process allocator, so it can serve
//! requests made from inside `malloc` itself.

use std::ptr;

use crate::backend::MIN_ALIGN;
use crate::error::{IsolationError, IsolationResult, OrAbort};
use crate::region::ReservedRegion;
use crate::size_class::{NUM_SIZE_CLASSES, bin_index, bin_size, slots_per_slab};
use crate::spin::SpinLock;

pub const PAGE_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();
const COMMIT_STEP: usize = 1 << 20;

const MAGIC_LIVE: u32 = 0x6d70_6b4c;
const MAGIC_FREE: u32 = 0x6d70_6b46;
const SPAN_BIN: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockHeader {
    magic: u32,
    bin: u32,
    capacity: usize,
    span_base: usize,
    span_len: usize,
}

#[repr(C)]
struct FreeSpan {
    next: *mut FreeSpan,
    len: usize,
}

struct HeapState {
    bump: usize,
    committed_end: usize,
    bins: [*mut u8; NUM_SIZE_CLASSES],
    spans: *mut FreeSpan,
    live_blocks: usize,
    live_bytes: usize,
}

// SAFETY: the raw pointers all point into the heap's own reservation and are
// only dereferenced while the state lock is held.
unsafe impl Send for HeapState {}

/// Point-in-time occupancy of a [`RegionHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub live_blocks: usize,
    pub live_bytes: usize,
    pub committed_bytes: usize,
    pub reserved_bytes: usize,
}

#[derive(Debug)]
pub struct RegionHeap {
    region: ReservedRegion,
    state: SpinLock<HeapState>,
}

#[inline]
const fn round_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl RegionHeap {
    /// Reserve `region` at its exact address. Fails if any part of the range
    /// is already mapped or the kernel places the mapping elsewhere.
    pub fn reserve(region: ReservedRegion) -> IsolationResult<Self> {
        let start = region.start();
        let len = region.len();
        // SAFETY: anonymous PROT_NONE reservation; MAP_FIXED_NOREPLACE never
        // clobbers an existing mapping.
        let mapped = unsafe {
            libc::mmap(
                start as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(IsolationError::RegionReservation {
                start,
                len,
                errno: last_errno(),
            });
        }
        if mapped as usize != start {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
            // SAFETY: unmapping the mapping we just created.
            unsafe { libc::munmap(mapped, len) };
            return Err(IsolationError::RegionMisplaced {
                requested: start,
                actual: mapped as usize,
            });
        }
        Ok(Self {
            region,
            state: SpinLock::new(HeapState {
                bump: start,
                committed_end: start,
                bins: [ptr::null_mut(); NUM_SIZE_CLASSES],
                spans: ptr::null_mut(),
                live_blocks: 0,
                live_bytes: 0,
            }),
        })
    }

    #[must_use]
    pub const fn region(&self) -> ReservedRegion {
        self.region
    }

    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.region.contains_ptr(ptr)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        HeapStats {
            live_blocks: state.live_blocks,
            live_bytes: state.live_bytes,
            committed_bytes: state.committed_end - self.region.start(),
            reserved_bytes: self.region.len(),
        }
    }

    /// Usable bytes behind a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this heap.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> IsolationResult<usize> {
        // SAFETY: forwarded caller contract.
        unsafe { self.live_header(ptr) }.map(|header| header.capacity)
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        match bin_index(size) {
            Some(bin) => self.allocate_small(bin),
            None => self.allocate_span(size, HEADER_SIZE),
        }
    }

    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let block = self.allocate(total);
        if !block.is_null() {
            // SAFETY: the block holds at least `total` writable bytes.
            unsafe { block.write_bytes(0, total) };
        }
        block
    }

    /// Alignments up to one page are honoured; larger ones return null.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return ptr::null_mut();
        }
        if align <= MIN_ALIGN {
            return self.allocate(size);
        }
        self.allocate_span(size, PAGE_SIZE)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.release(ptr) }.or_abort();
            return ptr::null_mut();
        }
        // SAFETY: forwarded caller contract.
        let capacity = unsafe { self.usable_size(ptr) }.or_abort();
        if size <= capacity {
            return ptr;
        }
        let grown = self.allocate(size);
        if grown.is_null() {
            return grown;
        }
        // SAFETY: both blocks are live, distinct, and hold `capacity` bytes.
        unsafe {
            ptr::copy_nonoverlapping(ptr, grown, capacity);
            self.release(ptr).or_abort();
        }
        grown
    }

    /// # Safety
    ///
    /// `ptr` must be null or a block returned by this heap.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if !ptr.is_null() {
            // SAFETY: forwarded caller contract.
            unsafe { self.release(ptr) }.or_abort();
        }
    }

    /// Return a block to the heap, reporting double frees and foreign
    /// pointers instead of corrupting the free lists.
    ///
    /// # Safety
    ///
    /// `ptr` must point into this heap's region.
    pub unsafe fn release(&self, ptr: *mut u8) -> IsolationResult<()> {
        let mut state = self.state.lock();
        // SAFETY: forwarded caller contract.
        let header = unsafe { self.checked_header(&state, ptr) }?;
        state.live_blocks -= 1;
        state.live_bytes -= header.capacity;
        if header.bin == SPAN_BIN {
            // SAFETY: span bounds were validated by `checked_header`.
            unsafe { Self::retire_span(&mut state, header.span_base, header.span_len) };
        } else {
            let bin = header.bin as usize;
            let header_ptr = ptr.wrapping_sub(HEADER_SIZE).cast::<BlockHeader>();
            // SAFETY: the header and the first word of the slot are ours.
            unsafe {
                (*header_ptr).magic = MAGIC_FREE;
                ptr.cast::<*mut u8>().write(state.bins[bin]);
            }
            state.bins[bin] = header_ptr.cast();
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `ptr` must point into this heap's region.
    unsafe fn live_header(&self, ptr: *const u8) -> IsolationResult<BlockHeader> {
        let state = self.state.lock();
        // SAFETY: forwarded caller contract.
        unsafe { self.checked_header(&state, ptr) }
    }

    /// Validate the header in front of `ptr` against the heap state.
    ///
    /// # Safety
    ///
    /// `ptr` must point into this heap's region.
    unsafe fn checked_header(
        &self,
        state: &HeapState,
        ptr: *const u8,
    ) -> IsolationResult<BlockHeader> {
        let addr = ptr as usize;
        let corrupt = IsolationError::CorruptBlock { addr };
        if addr % MIN_ALIGN != 0
            || !self.region.contains(addr)
            || addr < self.region.start() + HEADER_SIZE
            || addr > state.committed_end
        {
            return Err(corrupt);
        }
        // SAFETY: the header lies in committed memory of our own region.
        let header = unsafe { ptr.sub(HEADER_SIZE).cast::<BlockHeader>().read() };
        if header.magic != MAGIC_LIVE {
            return Err(corrupt);
        }
        let well_formed = if header.bin == SPAN_BIN {
            header.span_len % PAGE_SIZE == 0
                && header.span_base >= self.region.start()
                && header.span_base < addr
                && header
                    .span_base
                    .checked_add(header.span_len)
                    .is_some_and(|end| end <= state.committed_end && addr + header.capacity <= end)
        } else {
            (header.bin as usize) < NUM_SIZE_CLASSES
                && header.capacity == bin_size(header.bin as usize)
        };
        if well_formed { Ok(header) } else { Err(corrupt) }
    }

    fn allocate_small(&self, bin: usize) -> *mut u8 {
        let class_size = bin_size(bin);
        let mut state = self.state.lock();
        if state.bins[bin].is_null() && !self.refill_bin(&mut state, bin) {
            return ptr::null_mut();
        }
        let slot = state.bins[bin];
        let user = slot.wrapping_add(HEADER_SIZE);
        // SAFETY: free slots carry their successor in the first user word and
        // lie in committed memory.
        unsafe {
            state.bins[bin] = user.cast::<*mut u8>().read();
            slot.cast::<BlockHeader>().write(BlockHeader {
                magic: MAGIC_LIVE,
                bin: bin as u32,
                capacity: class_size,
                span_base: 0,
                span_len: 0,
            });
        }
        state.live_blocks += 1;
        state.live_bytes += class_size;
        user
    }

    fn refill_bin(&self, state: &mut HeapState, bin: usize) -> bool {
        let slot_size = HEADER_SIZE + bin_size(bin);
        let slots = slots_per_slab(slot_size);
        let Some(slab) = self.bump(state, slot_size * slots, MIN_ALIGN) else {
            return false;
        };
        for index in (0..slots).rev() {
            let slot = (slab + index * slot_size) as *mut u8;
            // SAFETY: the slab was just committed and is exclusively ours.
            unsafe {
                slot.cast::<BlockHeader>().write(BlockHeader {
                    magic: MAGIC_FREE,
                    bin: bin as u32,
                    capacity: 0,
                    span_base: 0,
                    span_len: 0,
                });
                slot.add(HEADER_SIZE).cast::<*mut u8>().write(state.bins[bin]);
            }
            state.bins[bin] = slot;
        }
        true
    }

    /// `lead` is the distance from span start to the user pointer: one
    /// header for plain spans, one page for page-aligned spans.
    fn allocate_span(&self, size: usize, lead: usize) -> *mut u8 {
        let Some(wanted) = lead.checked_add(size).and_then(|n| round_up(n, PAGE_SIZE)) else {
            return ptr::null_mut();
        };
        let mut state = self.state.lock();
        // A recycled span keeps its full length so it retires whole.
        let (span_base, span_len) = match Self::take_free_span(&mut state, wanted) {
            Some(found) => found,
            None => match self.bump(&mut state, wanted, PAGE_SIZE) {
                Some(base) => (base, wanted),
                None => return ptr::null_mut(),
            },
        };
        let user = span_base + lead;
        let capacity = span_len - lead;
        // SAFETY: the span is committed and exclusively ours.
        unsafe {
            ((user - HEADER_SIZE) as *mut BlockHeader).write(BlockHeader {
                magic: MAGIC_LIVE,
                bin: SPAN_BIN,
                capacity,
                span_base,
                span_len,
            });
        }
        state.live_blocks += 1;
        state.live_bytes += capacity;
        user as *mut u8
    }

    /// First fit among retired spans, refusing spans more than twice the
    /// requested length. Returns the span's base and its full length.
    fn take_free_span(state: &mut HeapState, len: usize) -> Option<(usize, usize)> {
        let mut link: *mut *mut FreeSpan = &mut state.spans;
        // SAFETY: every node on the list is a retired span in committed memory.
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                let node_len = (*node).len;
                if node_len >= len && node_len / 2 <= len {
                    *link = (*node).next;
                    return Some((node as usize, node_len));
                }
                link = &mut (*node).next;
            }
        }
        None
    }

    /// # Safety
    ///
    /// `[base, base + len)` must be a validated span owned by the caller.
    unsafe fn retire_span(state: &mut HeapState, base: usize, len: usize) {
        // SAFETY: the span is committed; dropping its pages keeps the mapping.
        unsafe {
            libc::madvise(base as *mut libc::c_void, len, libc::MADV_DONTNEED);
            let node = base as *mut FreeSpan;
            node.write(FreeSpan {
                next: state.spans,
                len,
            });
            state.spans = node;
        }
    }

    fn bump(&self, state: &mut HeapState, len: usize, align: usize) -> Option<usize> {
        let start = round_up(state.bump, align)?;
        let end = start.checked_add(len)?;
        if end > self.region.end() {
            return None;
        }
        if end > state.committed_end {
            let target = round_up(end.max(state.committed_end + COMMIT_STEP), PAGE_SIZE)?
                .min(self.region.end());
            // SAFETY: `[committed_end, target)` lies inside our reservation.
            let rc = unsafe {
                libc::mprotect(
                    state.committed_end as *mut libc::c_void,
                    target - state.committed_end,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                return None;
            }
            state.committed_end = target;
        }
        state.bump = end;
        Some(start)
    }
}

impl Drop for RegionHeap {
    fn drop(&mut self) {
        // SAFETY: the reservation was created by `reserve` and is unmapped once.
        unsafe {
            libc::munmap(self.region.start() as *mut libc::c_void, self.region.len());
        }
    }
}
