use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::error::OpenError;
use crate::input_buffer::ThreadInputBuffer;

/// "Consume from this ring up to this cursor."
///
/// Published by a producer after constructing a frame; `buffer: None` is
/// the termination sentinel pushed by `close`. Carrying an `Arc` keeps the
/// ring alive until the worker has drained it, even if the producing
/// thread has already exited.
pub(crate) struct CommitExtent {
    pub(crate) buffer: Option<Arc<ThreadInputBuffer>>,
    pub(crate) commit_end: u64,
}

struct Slot {
    /// Slot state in the sequence protocol: equals the enqueue position
    /// when the slot is free, position + 1 when it holds a value.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<CommitExtent>>,
}

/// Bounded lock-free MPSC queue of commit extents.
///
/// Classic per-slot sequence-number design: producers claim an enqueue
/// position with a CAS, then publish the value by bumping the slot
/// sequence with Release; the single consumer observes it with Acquire.
/// `push` never blocks — the two-step full-queue protocol (signal the
/// worker, wait for the consumed event) lives in the log core.
pub(crate) struct SharedInputQueue {
    slots: Box<[Slot]>,
    mask: usize,
    /// Enqueue cursor, shared by all producers.
    tail: CachePadded<AtomicUsize>,
    /// Dequeue cursor, worker-only.
    head: CachePadded<AtomicUsize>,
}

// Safety: slot values are published with Release and consumed with
// Acquire; a slot is accessible to exactly one side at a time by the
// sequence protocol.
unsafe impl Send for SharedInputQueue {}
unsafe impl Sync for SharedInputQueue {}

impl SharedInputQueue {
    /// Creates a queue with at least `capacity` slots (rounded up to a
    /// power of two, minimum 2).
    pub(crate) fn new(capacity: usize) -> Result<Self, OpenError> {
        let capacity = capacity.max(2).next_power_of_two();

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| OpenError::OutOfMemory)?;
        for i in 0..capacity {
            slots.push(Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Non-blocking enqueue. Returns the extent back when the queue is
    /// full so the caller can retry after waiting.
    pub(crate) fn push(&self, extent: CommitExtent) -> Result<(), CommitExtent> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pos {
                // Slot is free at our position; try to claim it.
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this producer exclusive
                        // ownership of the slot until the seq store below.
                        unsafe { (*slot.value.get()).write(extent) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if (seq as isize).wrapping_sub(pos as isize) < 0 {
                // The slot still holds a value from the previous lap: the
                // queue is full.
                return Err(extent);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest extent. Single consumer.
    pub(crate) fn pop(&self) -> Option<CommitExtent> {
        let pos = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);

        if seq != pos.wrapping_add(1) {
            return None;
        }

        // SAFETY: the Acquire load above pairs with the producer's Release
        // store, so the value is fully written and ours to take.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        // Hand the slot back to producers one lap ahead.
        slot.seq
            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
        self.head.store(pos.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }

    /// Quiescent emptiness check, for shutdown assertions.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst) == self.tail.load(Ordering::SeqCst)
    }
}

impl Drop for SharedInputQueue {
    fn drop(&mut self) {
        // Release any extents that were never consumed.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(commit_end: u64) -> CommitExtent {
        CommitExtent {
            buffer: None,
            commit_end,
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = SharedInputQueue::new(8).unwrap();
        for i in 0..5 {
            q.push(extent(i)).map_err(|_| ()).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.pop().unwrap().commit_end, i);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_full_returns_value() {
        let q = SharedInputQueue::new(4).unwrap();
        for i in 0..4 {
            assert!(q.push(extent(i)).is_ok());
        }
        let back = q.push(extent(99)).unwrap_err();
        assert_eq!(back.commit_end, 99);

        // One pop frees one slot.
        assert_eq!(q.pop().unwrap().commit_end, 0);
        assert!(q.push(extent(99)).is_ok());
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        // A request for 5 slots yields 8.
        let q = SharedInputQueue::new(5).unwrap();
        for i in 0..8 {
            assert!(q.push(extent(i)).is_ok());
        }
        assert!(q.push(extent(8)).is_err());

        // Degenerate requests still get a usable queue.
        let q = SharedInputQueue::new(0).unwrap();
        assert!(q.push(extent(0)).is_ok());
        assert!(q.push(extent(1)).is_ok());
        assert!(q.push(extent(2)).is_err());
    }

    #[test]
    fn test_wraps_many_laps() {
        let q = SharedInputQueue::new(2).unwrap();
        for lap in 0..100u64 {
            assert!(q.push(extent(lap)).is_ok());
            assert_eq!(q.pop().unwrap().commit_end, lap);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(SharedInputQueue::new(64).unwrap());
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        let mut e = extent(p * 10_000 + i);
                        loop {
                            match q.push(e) {
                                Ok(()) => break,
                                Err(back) => {
                                    e = back;
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        let mut seen: Vec<u64> = Vec::new();
        while seen.len() < 4000 {
            if let Some(e) = q.pop() {
                seen.push(e.commit_end);
            } else {
                thread::yield_now();
            }
        }
        for t in producers {
            t.join().unwrap();
        }

        // Per-producer FIFO: each producer's values appear in order.
        for p in 0..4u64 {
            let ours: Vec<u64> = seen
                .iter()
                .copied()
                .filter(|v| v / 10_000 == p)
                .collect();
            assert_eq!(ours.len(), 1000);
            assert!(ours.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
