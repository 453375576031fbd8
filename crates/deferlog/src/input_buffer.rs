use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::event::SpscEvent;
use crate::frame::WRAPAROUND_MARKER;
use crate::invariants::{
    debug_assert_bounded_occupancy, debug_assert_cursor_monotonic, debug_assert_word_aligned,
};
use crate::util::WORD;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// One producer (the owning thread) writes frames and moves `write_seq`; one
// consumer (the worker) reads frames and moves `read_seq`. Both cursors are
// unbounded u64 sequence numbers; the byte index is `seq & mask`. Occupancy
// is `write_seq - read_seq`, so the full/empty ambiguity of wrapped indices
// never arises.
//
// **Producer (allocate path):**
// 1. Read `write_seq` unsynchronized (UnsafeCell, producer is the only writer)
// 2. Load `read_seq` with Acquire (pairs with the worker's Release advance,
//    so slots the worker has finished reading are safe to overwrite)
// 3. Write the frame bytes (plain writes, protected by the protocol)
// 4. Advance `write_seq` (unsynchronized; the worker never reads it)
//
// The frame bytes are *published* to the worker by the shared input queue:
// the commit extent's push is a Release store, the worker's pop an Acquire
// load. The worker reads only up to commit extents it received, never up to
// `write_seq` itself.
//
// **Worker (consume path):**
// 1. Load `read_seq` with Relaxed (only the worker writes it)
// 2. Read frame bytes (made visible by the queue's Acquire pop)
// 3. Store `read_seq` with Release (hands the slots back to the producer)
//
// `touched` is worker-local bookkeeping and is never shared.
//
// =============================================================================

/// How often a blocked producer re-checks whether the worker died.
const BLOCKED_PRODUCER_POLL: Duration = Duration::from_millis(50);

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocError {
    /// The frame can never fit; surfaced as a configuration error.
    TooLarge { frame_size: usize, capacity: usize },
    /// The worker latched a fatal error and will never drain this ring.
    WorkerDead,
}

/// Per-producer SPSC ring of variable-size input frames.
///
/// Frames are physically contiguous: when a frame does not fit before the
/// ring end, the producer stores a wraparound marker word at the write
/// index and continues at the base. The region `[read_seq, write_seq)`
/// holds only whole, well-formed frames plus at most one trailing marker.
pub(crate) struct ThreadInputBuffer {
    /// Ring storage, cache-line aligned.
    base: NonNull<u8>,
    /// Ring size in bytes; a power of two and a word multiple.
    size: usize,

    // === PRODUCER HOT ===
    /// Write cursor. Only the producer touches it.
    write_seq: CachePadded<UnsafeCell<u64>>,

    // === WORKER HOT ===
    /// Read cursor. Written by the worker (Release), read by the producer
    /// (Acquire) to compute free space.
    read_seq: CachePadded<AtomicU64>,
    /// Worker-local flag: this ring was consumed from since the worker's
    /// last idle round. Never shared; lives here so the worker need not
    /// keep a side table.
    touched: UnsafeCell<bool>,

    /// Signaled by the worker after draining; the producer waits on it
    /// when the ring is full.
    input_consumed_event: SpscEvent,
}

// Safety: the cursor protocol above restricts every non-atomic field to a
// single writer; cross-thread visibility of frame bytes goes through the
// shared queue's Release/Acquire pair.
unsafe impl Send for ThreadInputBuffer {}
unsafe impl Sync for ThreadInputBuffer {}

impl ThreadInputBuffer {
    /// Cache-line alignment for the ring base, so the allocation does not
    /// share a line with unrelated data.
    const BASE_ALIGN: usize = 64;

    /// Allocates a ring of `size` bytes. `size` is rounded up to a power
    /// of two of at least one cache line.
    pub(crate) fn new(size: usize) -> Result<Self, crate::error::WriteError> {
        let size = size.max(Self::BASE_ALIGN).next_power_of_two();
        let layout = Layout::from_size_align(size, Self::BASE_ALIGN)
            .map_err(|_| crate::error::WriteError::OutOfMemory)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let base = NonNull::new(raw).ok_or(crate::error::WriteError::OutOfMemory)?;

        Ok(Self {
            base,
            size,
            write_seq: CachePadded::new(UnsafeCell::new(0)),
            read_seq: CachePadded::new(AtomicU64::new(0)),
            touched: UnsafeCell::new(false),
            input_consumed_event: SpscEvent::new(),
        })
    }

    /// Ring capacity in bytes.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    fn mask(&self) -> usize {
        self.size - 1
    }

    #[inline]
    fn ptr_at(&self, seq: u64) -> *mut u8 {
        // SAFETY: the masked index is within the allocation.
        unsafe { self.base.as_ptr().add((seq as usize) & self.mask()) }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Snapshot of the write cursor, for rolling back a failed multi-step
    /// write.
    #[inline]
    pub(crate) fn allocation_marker(&self) -> u64 {
        // SAFETY: producer-only field, read on the producing thread.
        unsafe { *self.write_seq.get() }
    }

    /// Restores the write cursor to `marker`. Must be called iff the steps
    /// following [`Self::allocate_input_frame`] failed; the ring is then
    /// indistinguishable from its pre-allocation state, since nothing past
    /// the cursor was ever published.
    #[inline]
    pub(crate) fn revert_allocation(&self, marker: u64) {
        // SAFETY: producer-only field, written on the producing thread.
        unsafe { *self.write_seq.get() = marker }
    }

    /// Current write cursor, for inclusion in a commit extent.
    #[inline]
    pub(crate) fn input_end(&self) -> u64 {
        self.allocation_marker()
    }

    /// Reserves `frame_size` contiguous bytes starting at a word boundary
    /// and advances the write cursor past them (and past a wraparound
    /// marker if one was needed).
    ///
    /// Blocks while the ring is full: nudges the worker through `wake`,
    /// then waits on the input-consumed event. Fails with
    /// [`AllocError::TooLarge`] if the frame can never fit, or
    /// [`AllocError::WorkerDead`] if the worker latched a fatal error
    /// while we were waiting.
    pub(crate) fn allocate_input_frame(
        &self,
        frame_size: usize,
        wake: &SpscEvent,
        worker_dead: &AtomicBool,
    ) -> Result<*mut u8, AllocError> {
        debug_assert_word_aligned!("frame size", frame_size);
        debug_assert!(frame_size > 0);

        if frame_size > self.size - WORD {
            return Err(AllocError::TooLarge {
                frame_size,
                capacity: self.capacity(),
            });
        }

        loop {
            // SAFETY: producer-only field, read on the producing thread.
            let write = unsafe { *self.write_seq.get() };
            let read = self.read_seq.load(Ordering::Acquire);
            let used = write.wrapping_sub(read) as usize;
            debug_assert_bounded_occupancy!(used, self.size);
            let free = self.size - used;

            let idx = (write as usize) & self.mask();
            let tail = self.size - idx;

            if frame_size <= tail && frame_size <= free {
                // Fits before the ring end.
                let ptr = self.ptr_at(write);
                // SAFETY: producer-only field.
                unsafe { *self.write_seq.get() = write + frame_size as u64 };
                return Ok(ptr);
            }

            if frame_size > tail && tail + frame_size <= free {
                // Mark the tail dead and continue at the base. The marker
                // consumes the whole tail in sequence space so occupancy
                // arithmetic stays exact.
                debug_assert!(idx > 0);
                // SAFETY: the tail is unused (it is inside the free
                // region) and at least one word long, since sizes and
                // offsets are word multiples.
                unsafe {
                    self.ptr_at(write)
                        .cast::<usize>()
                        .write(WRAPAROUND_MARKER);
                    *self.write_seq.get() = write + (tail + frame_size) as u64;
                }
                return Ok(self.base.as_ptr());
            }

            if free == self.size {
                // The ring is fully drained and the frame still fits
                // neither at the tail nor after a wrap; waiting cannot
                // help. Counts as a configuration error: the frame is too
                // large for this ring at its current position.
                return Err(AllocError::TooLarge {
                    frame_size,
                    capacity: self.capacity(),
                });
            }

            // Full: nudge the worker out of its poll, then wait for it to
            // drain. The timed wait only exists to notice a dead worker;
            // during a panic flush nobody signals and we block forever,
            // which is intended.
            wake.signal();
            if worker_dead.load(Ordering::Acquire) {
                return Err(AllocError::WorkerDead);
            }
            self.input_consumed_event.wait_timeout(BLOCKED_PRODUCER_POLL);
        }
    }

    // ---------------------------------------------------------------------
    // WORKER API
    // ---------------------------------------------------------------------

    /// Current read cursor.
    #[inline]
    pub(crate) fn input_start(&self) -> u64 {
        self.read_seq.load(Ordering::Relaxed)
    }

    /// Pointer to the frame at the read cursor.
    #[inline]
    pub(crate) fn frame_ptr(&self) -> *mut u8 {
        self.ptr_at(self.input_start())
    }

    /// Reads the dispatch word of the frame at the read cursor.
    ///
    /// # Safety
    ///
    /// The caller must have observed, via a commit extent, that the read
    /// cursor is strictly before the committed end.
    #[inline]
    pub(crate) unsafe fn peek_dispatch_word(&self) -> usize {
        self.frame_ptr().cast::<usize>().read()
    }

    /// Consumes a wraparound marker at the read cursor: advances the
    /// cursor to the ring base.
    pub(crate) fn wraparound(&self) {
        let read = self.input_start();
        let idx = (read as usize) & self.mask();
        debug_assert!(idx > 0, "wraparound at ring base");
        let new_read = read + (self.size - idx) as u64;
        debug_assert_cursor_monotonic!("read", read, new_read);
        self.read_seq.store(new_read, Ordering::Release);
    }

    /// Advances the read cursor past a consumed frame, handing its bytes
    /// back to the producer.
    pub(crate) fn discard_input_frame(&self, frame_size: usize) {
        debug_assert_word_aligned!("frame size", frame_size);
        let read = self.input_start();
        let new_read = read + frame_size as u64;
        debug_assert_cursor_monotonic!("read", read, new_read);
        self.read_seq.store(new_read, Ordering::Release);
    }

    /// Wakes the producer if it is blocked on a full ring.
    #[inline]
    pub(crate) fn signal_input_consumed(&self) {
        self.input_consumed_event.signal();
    }

    /// Marks this ring as consumed-from since the worker's last idle
    /// round. Returns `true` the first time. Worker-only.
    #[inline]
    pub(crate) fn mark_touched(&self) -> bool {
        // SAFETY: worker-local bookkeeping, accessed only on the worker
        // thread.
        unsafe {
            let touched = &mut *self.touched.get();
            !std::mem::replace(touched, true)
        }
    }

    /// Clears the touched flag at the end of an idle round. Worker-only.
    #[inline]
    pub(crate) fn clear_touched(&self) {
        // SAFETY: worker-local bookkeeping, accessed only on the worker
        // thread.
        unsafe { *self.touched.get() = false }
    }
}

impl Drop for ThreadInputBuffer {
    fn drop(&mut self) {
        // Destroy the arguments of any frames that were published but
        // never consumed, so captured values are not leaked.
        let mut read = self.read_seq.load(Ordering::Relaxed);
        // SAFETY: we have exclusive access.
        let write = unsafe { *self.write_seq.get() };
        while read != write {
            let idx = (read as usize) & self.mask();
            // SAFETY: [read, write) holds whole frames plus markers.
            unsafe {
                let word = self.ptr_at(read).cast::<usize>().read();
                if word == WRAPAROUND_MARKER {
                    read += (self.size - idx) as u64;
                    continue;
                }
                let vtable = &*(word as *const crate::frame::FrameVtable);
                vtable.drop_args(self.ptr_at(read));
                read += vtable.frame_size() as u64;
            }
        }

        let layout = Layout::from_size_align(self.size, Self::BASE_ALIGN).unwrap();
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}
