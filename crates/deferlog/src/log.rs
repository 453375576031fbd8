use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::backoff::WaitBackoff;
use crate::error::{ErrorPolicy, FlushError, FrameError, OpenError, SinkError, WriteError};
use crate::event::SpscEvent;
use crate::frame::{vtable, Formatter, FrameVtable, WRAPAROUND_MARKER};
use crate::input_buffer::{AllocError, ThreadInputBuffer};
use crate::output_buffer::{ErrorControl, FlushErrorCallback, OutputBuffer};
use crate::queue::{CommitExtent, SharedInputQueue};
use crate::sink::Sink;
use crate::util::page_size;

/// Invoked on the worker thread when a formatter fails or panics: the
/// output buffer, the failure, and the name of the captured argument type.
/// A panic escaping the callback is swallowed.
pub type FormatErrorCallback = Box<dyn FnMut(&mut OutputBuffer, &FrameError, &'static str) + Send>;

/// Buffer sizing for [`Log::open`]. Zero means default.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output buffer capacity in bytes (default 8 KiB, twice the typical
    /// disk sector so misalignment effects stay hidden).
    pub output_buffer_capacity: usize,
    /// Shared input queue capacity in extents (default: one page worth).
    pub shared_queue_capacity: usize,
    /// Per-thread input buffer capacity in bytes (default 8 KiB).
    pub input_buffer_capacity: usize,
}

const DEFAULT_BUFFER_CAPACITY: usize = 8192;

impl LogConfig {
    fn output_capacity(&self) -> usize {
        match self.output_buffer_capacity {
            0 => DEFAULT_BUFFER_CAPACITY,
            n => n,
        }
    }

    fn queue_capacity(&self) -> usize {
        match self.shared_queue_capacity {
            0 => page_size() / std::mem::size_of::<CommitExtent>(),
            n => n,
        }
    }

    fn input_capacity(&self) -> usize {
        match self.input_buffer_capacity {
            0 => DEFAULT_BUFFER_CAPACITY,
            n => n,
        }
    }
}

/// How often a producer blocked on the full shared queue re-checks for a
/// dead worker.
const BLOCKED_PUBLISH_POLL: Duration = Duration::from_millis(50);

/// State shared between the log handle, producers, and the worker.
pub(crate) struct LogShared {
    /// Distinguishes this log's slot in each thread's TLS map, so multiple
    /// logs in one process stay independent.
    id: u64,
    queue: SharedInputQueue,
    control: Arc<ErrorControl>,
    /// Signaled by the worker each time it drains the queue; producers
    /// blocked on a full queue wait here.
    shared_input_consumed: SpscEvent,
    /// Latched completion of the panic flush.
    panic_flush_done: SpscEvent,
    panic_flush_complete: AtomicBool,
    /// First fatal error; written by the worker before the flag's Release
    /// store, read by producers after an Acquire load.
    fatal_error: Mutex<Option<SinkError>>,
    fatal_error_flag: AtomicBool,
    format_error_callback: Mutex<Option<FormatErrorCallback>>,
    input_buffer_capacity: usize,
    /// Live rings by owning thread, populated on first producer call.
    /// Entries are removed by the TLS destructor hook on thread exit; the
    /// rings themselves stay alive through the extents that reference
    /// them.
    registry: Mutex<HashMap<ThreadId, Arc<ThreadInputBuffer>>>,
}

impl LogShared {
    fn fatal_error_snapshot(&self) -> Option<SinkError> {
        if self.fatal_error_flag.load(Ordering::Acquire) {
            Some((*self.fatal_error.lock().unwrap()).unwrap_or_else(SinkError::permanent))
        } else {
            None
        }
    }

    fn latch_fatal_error(&self, error: SinkError) {
        *self.fatal_error.lock().unwrap() = Some(error);
        self.fatal_error_flag.store(true, Ordering::Release);
        // Unblock producers waiting on us; they re-check the flag.
        self.shared_input_consumed.signal();
        for buffer in self.registry.lock().unwrap().values() {
            buffer.signal_input_consumed();
        }
    }

    /// Publishes a commit extent, running the two-step protocol while the
    /// queue is full: nudge the worker, wait for the consumed event,
    /// retry.
    fn queue_commit_extent(&self, extent: CommitExtent) -> Result<(), SinkError> {
        let mut extent = extent;
        loop {
            if self.control.panic_flush_requested() {
                // A crash is in progress. Flushing what was logged before
                // it matters more than this record; touching the queue or
                // the heap now would only confound the crash, so suspend
                // anything that tries.
                park_forever();
            }
            if let Some(error) = self.fatal_error_snapshot() {
                return Err(error);
            }
            match self.queue.push(extent) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    extent = back;
                    self.control.worker_wake.signal();
                    self.shared_input_consumed.wait_timeout(BLOCKED_PUBLISH_POLL);
                }
            }
        }
    }
}

thread_local! {
    /// This thread's input buffers, one per live log.
    static INPUT_BUFFERS: RefCell<HashMap<u64, TlsRegistration>> =
        RefCell::new(HashMap::new());
}

/// TLS entry whose drop hook hands the ring back to the log when the
/// thread exits.
struct TlsRegistration {
    buffer: Arc<ThreadInputBuffer>,
    shared: Weak<LogShared>,
    /// Captured at registration; `thread::current` is not callable during
    /// TLS teardown.
    thread: ThreadId,
}

impl Drop for TlsRegistration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.registry.lock().unwrap().remove(&self.thread);
        }
        // Extents still queued hold their own reference to the ring, so
        // records published before the exit are drained normally.
    }
}

/// Asynchronous log: producers capture arguments and return; a dedicated
/// worker thread formats them and writes to the sink.
///
/// Any number of threads may write through a shared reference; each gets a
/// private input ring on first use. See the crate docs for the data flow.
pub struct Log {
    shared: Arc<LogShared>,
    worker: Option<JoinHandle<()>>,
}

impl Log {
    /// Starts the worker thread and opens the log over `sink`.
    pub fn open(sink: impl Sink + 'static, config: LogConfig) -> Result<Self, OpenError> {
        static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(0);

        let control = Arc::new(ErrorControl::new());
        let shared = Arc::new(LogShared {
            id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
            queue: SharedInputQueue::new(config.queue_capacity())?,
            control: Arc::clone(&control),
            shared_input_consumed: SpscEvent::new(),
            panic_flush_done: SpscEvent::new(),
            panic_flush_complete: AtomicBool::new(false),
            fatal_error: Mutex::new(None),
            fatal_error_flag: AtomicBool::new(false),
            format_error_callback: Mutex::new(None),
            input_buffer_capacity: config.input_capacity(),
            registry: Mutex::new(HashMap::new()),
        });

        let output = OutputBuffer::new(Box::new(sink), config.output_capacity(), control)?;
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("deferlog-worker".into())
            .spawn(move || worker_entry(&worker_shared, output))
            .map_err(|_| OpenError::OutOfMemory)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Captures `args` for deferred formatting by `F`.
    ///
    /// Returns as soon as the arguments are stored in this thread's input
    /// ring and the commit extent is published. Blocks only when the ring
    /// or the shared queue is full (i.e. the worker is behind), and
    /// forever once a panic flush has begun.
    pub fn write<F, A>(&self, args: A) -> Result<(), WriteError>
    where
        F: Formatter<A>,
        A: Send + 'static,
    {
        let vt = vtable::<F, A>();
        // SAFETY: the vtable was built for `A`, and the constructor writes
        // a valid `A` at the argument slot.
        unsafe {
            self.write_frame(vt, move |args_slot| {
                args_slot.cast::<A>().write(args);
            })
        }
    }

    /// Low-level frame primitive for capture layers that build their own
    /// vtables: reserves a frame, stores the dispatch word, runs
    /// `construct` on the argument slot, and publishes the commit extent.
    ///
    /// # Safety
    ///
    /// `construct` must fully initialize an argument value matching
    /// `vtable`'s layout at the pointer it is given.
    pub unsafe fn write_frame<C>(
        &self,
        vtable: &'static FrameVtable,
        construct: C,
    ) -> Result<(), WriteError>
    where
        C: FnOnce(*mut u8),
    {
        if self.shared.control.panic_flush_requested() {
            park_forever();
        }
        if let Some(error) = self.shared.fatal_error_snapshot() {
            return Err(WriteError::Writer(error));
        }

        let buffer = self.input_buffer()?;
        let marker = buffer.allocation_marker();
        let frame = match buffer.allocate_input_frame(
            vtable.frame_size(),
            &self.shared.control.worker_wake,
            &self.shared.fatal_error_flag,
        ) {
            Ok(frame) => frame,
            Err(AllocError::TooLarge {
                frame_size,
                capacity,
            }) => {
                return Err(WriteError::CapacityExhausted {
                    frame_size,
                    capacity,
                })
            }
            Err(AllocError::WorkerDead) => {
                return Err(WriteError::Writer(
                    self.shared
                        .fatal_error_snapshot()
                        .unwrap_or_else(SinkError::permanent),
                ))
            }
        };

        frame
            .cast::<usize>()
            .write(vtable as *const FrameVtable as usize);
        construct(frame.add(vtable.args_offset()));

        let extent = CommitExtent {
            buffer: Some(Arc::clone(&buffer)),
            commit_end: buffer.input_end(),
        };
        if let Err(error) = self.shared.queue_commit_extent(extent) {
            // The worker died while we were constructing. Destroy the
            // arguments and roll the ring back to its pre-allocation
            // state; nothing was published.
            vtable.drop_args(frame);
            buffer.revert_allocation(marker);
            return Err(WriteError::Writer(error));
        }
        Ok(())
    }

    /// Best-effort final drain for abnormal termination.
    ///
    /// Latches panic mode, waits until the worker has formatted and
    /// flushed everything published before the call, then returns. The log
    /// is inoperable afterwards: any thread that attempts to write blocks
    /// forever. Safe to call more than once; does not allocate.
    pub fn panic_flush(&self) {
        self.shared
            .control
            .panic_flush
            .store(true, Ordering::Release);
        self.shared.control.worker_wake.signal();
        while !self.shared.panic_flush_complete.load(Ordering::Acquire) {
            if self.shared.fatal_error_flag.load(Ordering::Acquire) {
                // The worker already died; there is nothing left to drain.
                return;
            }
            self.shared
                .panic_flush_done
                .wait_timeout(Duration::from_millis(10));
        }
    }

    /// Shuts down: drains everything published so far, stops the worker,
    /// and surfaces any fatal sink error it hit on the way out.
    pub fn close(mut self) -> Result<(), SinkError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), SinkError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if self.shared.control.panic_flush_requested() {
            // The worker is parked for good; it must not be joined.
            drop(worker);
            return Ok(());
        }

        let sentinel = CommitExtent {
            buffer: None,
            commit_end: 0,
        };
        match self.shared.queue_commit_extent(sentinel) {
            Ok(()) => {
                self.shared.control.worker_wake.signal();
                let _ = worker.join();
                match self.shared.fatal_error_snapshot() {
                    Some(error) => Err(error),
                    None => {
                        debug_assert!(self.shared.queue.is_empty());
                        Ok(())
                    }
                }
            }
            Err(error) => {
                // The worker already exited on a fatal error.
                let _ = worker.join();
                Err(error)
            }
        }
    }

    /// Installs the callback invoked when a formatter fails or panics.
    pub fn set_format_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut OutputBuffer, &FrameError, &'static str) + Send + 'static,
    {
        *self.shared.format_error_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Installs the callback invoked once per loss episode when the sink
    /// recovers. It runs on the worker thread and must not log.
    pub fn set_flush_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&mut OutputBuffer, SinkError, usize) + Send + 'static,
    {
        *self.shared.control.flush_error_callback.lock().unwrap() =
            Some(Box::new(callback) as FlushErrorCallback);
    }

    /// Sets the policy applied when the sink fails temporarily.
    pub fn set_temporary_error_policy(&self, policy: ErrorPolicy) {
        self.shared.control.temporary_policy.store(policy);
    }

    /// Current temporary-failure policy.
    pub fn temporary_error_policy(&self) -> ErrorPolicy {
        self.shared.control.temporary_policy.load()
    }

    /// Sets the policy applied when the sink fails permanently.
    pub fn set_permanent_error_policy(&self, policy: ErrorPolicy) {
        self.shared.control.permanent_policy.store(policy);
    }

    /// Current permanent-failure policy.
    pub fn permanent_error_policy(&self) -> ErrorPolicy {
        self.shared.control.permanent_policy.load()
    }

    /// This thread's ring for this log, created and registered on first
    /// use.
    fn input_buffer(&self) -> Result<Arc<ThreadInputBuffer>, WriteError> {
        INPUT_BUFFERS.with(|map| {
            let mut map = map.borrow_mut();
            if let Some(registration) = map.get(&self.shared.id) {
                return Ok(Arc::clone(&registration.buffer));
            }

            let buffer = Arc::new(ThreadInputBuffer::new(self.shared.input_buffer_capacity)?);
            let thread = thread::current().id();
            self.shared
                .registry
                .lock()
                .unwrap()
                .insert(thread, Arc::clone(&buffer));
            map.insert(
                self.shared.id,
                TlsRegistration {
                    buffer: Arc::clone(&buffer),
                    shared: Arc::downgrade(&self.shared),
                    thread,
                },
            );
            Ok(buffer)
        })
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

enum WorkerExit {
    Normal,
    Fatal(SinkError),
}

fn worker_entry(shared: &Arc<LogShared>, mut output: OutputBuffer) {
    match worker_loop(shared, &mut output) {
        WorkerExit::Normal => {}
        WorkerExit::Fatal(error) => {
            shared.latch_fatal_error(error);
            if shared.control.panic_flush_requested() {
                finish_panic_flush(shared, &mut output);
            }
        }
    }
}

/// The worker: drains the shared queue, formats frames into the output
/// buffer, flushes when idle.
fn worker_loop(shared: &Arc<LogShared>, output: &mut OutputBuffer) -> WorkerExit {
    let parallelism = thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
    let mut touched: Vec<Arc<ThreadInputBuffer>> = Vec::with_capacity((2 * parallelism).max(8));

    loop {
        let extent = match shared.queue.pop() {
            Some(extent) => extent,
            None => {
                if shared.control.panic_flush_requested() {
                    // Panic mode with an empty queue: everything published
                    // before the crash has been processed.
                    finish_panic_flush(shared, output);
                }

                // Tell the producers we processed during this round that
                // their rings have room again, then get the output moving.
                shared.shared_input_consumed.signal();
                for buffer in &touched {
                    buffer.signal_input_consumed();
                }
                for buffer in &touched {
                    buffer.clear_touched();
                }
                touched.clear();

                if output.has_complete_frame() {
                    match output.flush() {
                        Ok(()) | Err(FlushError::Sink(_)) => {}
                        Err(FlushError::ExcessiveFrame { .. }) => {}
                        Err(FlushError::Fatal(error)) => return WorkerExit::Fatal(error),
                    }
                }

                // Producers do not normally signal anything, so poll the
                // queue, backing off exponentially up to one second.
                let mut backoff = WaitBackoff::new();
                loop {
                    if let Some(extent) = shared.queue.pop() {
                        break extent;
                    }
                    if shared.control.panic_flush_requested() {
                        finish_panic_flush(shared, output);
                    }
                    shared.control.worker_wake.wait_timeout(backoff.next());
                }
            }
        };

        let Some(buffer) = extent.buffer else {
            // Termination sentinel: finish up and exit.
            if shared.control.panic_flush_requested() {
                finish_panic_flush(shared, output);
            }
            return match output.flush() {
                Ok(()) | Err(FlushError::Sink(_)) | Err(FlushError::ExcessiveFrame { .. }) => {
                    WorkerExit::Normal
                }
                Err(FlushError::Fatal(error)) => WorkerExit::Fatal(error),
            };
        };

        // Run every frame in this ring up to the committed end through its
        // formatter.
        while buffer.input_start() != extent.commit_end {
            // SAFETY: the extent's Release/Acquire hand-off published
            // every byte up to commit_end.
            let word = unsafe { buffer.peek_dispatch_word() };
            if word == WRAPAROUND_MARKER {
                buffer.wraparound();
                continue;
            }
            let vt = unsafe { &*(word as *const FrameVtable) };
            let frame = buffer.frame_ptr();

            // SAFETY: the frame was built for `vt` by the producer.
            let result = catch_unwind(AssertUnwindSafe(|| unsafe { vt.format(output, frame) }));
            match result {
                Ok(Ok(())) => output.mark_frame_complete(),
                Ok(Err(FrameError::Flush(FlushError::Fatal(error)))) => {
                    output.revert_frame();
                    // The frame stays in the ring; its arguments are
                    // destroyed when the ring is dropped.
                    return WorkerExit::Fatal(error);
                }
                Ok(Err(FrameError::Flush(FlushError::Sink(error)))) => {
                    // No room for this record's output; skip it under the
                    // active drop policy.
                    output.revert_frame();
                    output.record_dropped_frame(error);
                }
                Ok(Err(error)) => {
                    // Formatter failure, or a record too large for the
                    // output buffer: report it and move on.
                    output.revert_frame();
                    invoke_format_error_callback(shared, output, &error, vt.type_name());
                }
                Err(payload) => {
                    output.revert_frame();
                    let error = FrameError::Panic(panic_message(&payload));
                    invoke_format_error_callback(shared, output, &error, vt.type_name());
                }
            }

            // Arguments are destroyed for every consumed frame, success or
            // failure, so captured values never leak.
            unsafe { vt.drop_args(frame) };
            buffer.discard_input_frame(vt.frame_size());

            // Remember the ring so the idle round can wake its producer.
            // Skipped in panic mode, where growing the set could touch the
            // heap.
            if !shared.control.panic_flush_requested() && buffer.mark_touched() {
                touched.push(Arc::clone(&buffer));
            }
        }
    }
}

fn finish_panic_flush(shared: &LogShared, output: &mut OutputBuffer) -> ! {
    // One chance to flush what remains; if it fails now, so be it.
    if output.has_complete_frame() {
        let _ = output.flush();
    }
    shared.panic_flush_complete.store(true, Ordering::Release);
    shared.panic_flush_done.signal();
    // The process is expected to die shortly; wait for it.
    park_forever();
}

fn invoke_format_error_callback(
    shared: &LogShared,
    output: &mut OutputBuffer,
    error: &FrameError,
    type_name: &'static str,
) {
    let mut guard = shared.format_error_callback.lock().unwrap();
    if let Some(callback) = guard.as_mut() {
        let _ = catch_unwind(AssertUnwindSafe(|| callback(output, error, type_name)));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
