//! Loom-based model tests for the pipeline's synchronization protocols.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! As usual with loom, the protocols are modeled in miniature — the real
//! types wrap OS primitives (condvars, heap rings) that loom cannot
//! explore — but the atomics and orderings mirror the implementation
//! exactly: the event's Release/Acquire bit, and the cursor hand-off
//! between a producer and the worker.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

/// The event's bit protocol: Release store on signal, Acquire exchange on
/// wait. (The condvar only limits spinning; visibility comes from the
/// bit.)
struct ModelEvent {
    signaled: AtomicBool,
}

impl ModelEvent {
    fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    fn try_consume(&self) -> bool {
        self.signaled.swap(false, Ordering::Acquire)
    }
}

/// A signal set before publishing data must make the data visible to the
/// waiter that consumes it.
#[test]
fn loom_event_publishes_prior_writes() {
    loom::model(|| {
        let event = Arc::new(ModelEvent::new());
        let data = Arc::new(AtomicU64::new(0));

        let e2 = Arc::clone(&event);
        let d2 = Arc::clone(&data);
        let signaler = thread::spawn(move || {
            d2.store(42, Ordering::Relaxed);
            e2.signal();
        });

        if event.try_consume() {
            assert_eq!(data.load(Ordering::Relaxed), 42);
        }
        signaler.join().unwrap();
    });
}

/// Two signals with no wait in between collapse into one consumable bit.
#[test]
fn loom_signals_collapse() {
    loom::model(|| {
        let event = Arc::new(ModelEvent::new());

        let e2 = Arc::clone(&event);
        let signaler = thread::spawn(move || {
            e2.signal();
            e2.signal();
        });
        signaler.join().unwrap();

        assert!(event.try_consume());
        assert!(!event.try_consume());
    });
}

/// Miniature of the input ring's cursor hand-off: the producer publishes
/// a slot value with a Release cursor store, the consumer acquires it and
/// hands the slot back with its own Release store, which the producer
/// acquires before overwriting.
struct ModelRing {
    write_seq: AtomicU64,
    read_seq: AtomicU64,
    slots: UnsafeCell<[u64; 2]>,
}

unsafe impl Send for ModelRing {}
unsafe impl Sync for ModelRing {}

impl ModelRing {
    fn new() -> Self {
        Self {
            write_seq: AtomicU64::new(0),
            read_seq: AtomicU64::new(0),
            slots: UnsafeCell::new([0; 2]),
        }
    }

    fn try_push(&self, value: u64) -> bool {
        let write = self.write_seq.load(Ordering::Relaxed);
        let read = self.read_seq.load(Ordering::Acquire);
        if write - read >= 2 {
            return false;
        }
        unsafe { (*self.slots.get())[(write % 2) as usize] = value };
        self.write_seq.store(write + 1, Ordering::Release);
        true
    }

    fn try_pop(&self) -> Option<u64> {
        let read = self.read_seq.load(Ordering::Relaxed);
        let write = self.write_seq.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let value = unsafe { (*self.slots.get())[(read % 2) as usize] };
        self.read_seq.store(read + 1, Ordering::Release);
        Some(value)
    }
}

/// Values cross the ring intact and in order under every interleaving.
#[test]
fn loom_ring_cursor_handoff() {
    loom::model(|| {
        let ring = Arc::new(ModelRing::new());

        let r2 = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            for value in 1..=3u64 {
                while !r2.try_push(value) {
                    thread::yield_now();
                }
            }
        });

        let mut received = Vec::new();
        while received.len() < 3 {
            if let Some(value) = ring.try_pop() {
                received.push(value);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        assert_eq!(received, vec![1, 2, 3]);
    });
}
