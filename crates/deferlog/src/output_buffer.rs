use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::atomic::AtomicCell;

use crate::backoff::WaitBackoff;
use crate::error::{ErrorPolicy, FlushError, OpenError, SinkError, SinkErrorKind};
use crate::event::SpscEvent;
use crate::invariants::debug_assert_output_regions;
use crate::sink::Sink;

/// Invoked once when the sink recovers after records were dropped: the
/// first error of the episode and the number of records lost. Runs on the
/// worker thread and may write into the buffer, but must not log through
/// the front door.
pub type FlushErrorCallback = Box<dyn FnMut(&mut OutputBuffer, SinkError, usize) + Send>;

/// Shared control state between the log handle, the producers and the
/// worker-owned output buffer: error policies, the panic-flush latch, the
/// worker wake event and the flush-error callback slot.
pub(crate) struct ErrorControl {
    pub(crate) temporary_policy: AtomicCell<ErrorPolicy>,
    pub(crate) permanent_policy: AtomicCell<ErrorPolicy>,
    pub(crate) panic_flush: AtomicBool,
    /// Wakes the worker out of its idle poll. Producers signal it when the
    /// shared queue fills up, `close` and `panic_flush` signal it to hurry
    /// the worker along, and the `Block` policy paces its retries on it.
    pub(crate) worker_wake: SpscEvent,
    pub(crate) flush_error_callback: Mutex<Option<FlushErrorCallback>>,
}

impl ErrorControl {
    pub(crate) fn new() -> Self {
        Self {
            temporary_policy: AtomicCell::new(ErrorPolicy::NotifyOnRecovery),
            permanent_policy: AtomicCell::new(ErrorPolicy::FailImmediately),
            panic_flush: AtomicBool::new(false),
            worker_wake: SpscEvent::new(),
            flush_error_callback: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn policy_for(&self, kind: SinkErrorKind) -> ErrorPolicy {
        match kind {
            SinkErrorKind::Temporary => self.temporary_policy.load(),
            SinkErrorKind::Permanent => self.permanent_policy.load(),
        }
    }

    #[inline]
    pub(crate) fn panic_flush_requested(&self) -> bool {
        self.panic_flush.load(Ordering::Acquire)
    }
}

/// Worker-side byte buffer in front of the sink.
///
/// Formatters append through [`reserve`](Self::reserve)/
/// [`commit`](Self::commit) or the `write` conveniences; the worker seals
/// each successful record with a frame boundary. Flushes hand the sink
/// only whole records, so a failing sink never tears a record at a flush
/// boundary. Layout invariant: `frame_end <= commit_end <= capacity`,
/// where `[0, frame_end)` is complete records and `[frame_end,
/// commit_end)` is the record currently being formatted.
pub struct OutputBuffer {
    sink: Box<dyn Sink>,
    buf: Box<[u8]>,
    /// End of the last complete record; flushes stop here.
    frame_end: usize,
    /// Formatter write cursor.
    commit_end: usize,
    /// Complete records accumulated since the last successful flush.
    frames_in_buffer: usize,
    /// Records dropped since the sink started failing, pending
    /// notification.
    lost_frames: usize,
    /// First error of the current episode, reported on recovery.
    initial_error: Option<SinkError>,
    /// Failure class of the current episode, if any.
    error_state: Option<SinkErrorKind>,
    control: Arc<ErrorControl>,
}

impl OutputBuffer {
    pub(crate) fn new(
        sink: Box<dyn Sink>,
        capacity: usize,
        control: Arc<ErrorControl>,
    ) -> Result<Self, OpenError> {
        let capacity = capacity.max(crate::util::WORD);
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| OpenError::OutOfMemory)?;
        storage.resize(capacity, 0);
        let mut buf = storage.into_boxed_slice();
        // Untouched pages should not stay committed just because the
        // buffer was sized generously.
        crate::util::release_tail_pages(&mut buf);

        Ok(Self {
            sink,
            buf,
            frame_end: 0,
            commit_end: 0,
            frames_in_buffer: 0,
            lost_frames: 0,
            initial_error: None,
            error_state: None,
            control,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(sink: Box<dyn Sink>, capacity: usize) -> Self {
        Self::new(sink, capacity, Arc::new(ErrorControl::new())).unwrap()
    }

    /// Buffer capacity in bytes; the hard ceiling for a single record's
    /// formatted output.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    // ---------------------------------------------------------------------
    // FORMATTER API
    // ---------------------------------------------------------------------

    /// Returns `n` contiguous writable bytes, flushing completed records
    /// out of the way if the tail is short.
    ///
    /// Fails with [`FlushError::ExcessiveFrame`] if the current record
    /// plus `n` can never fit, or propagates the flush failure. A
    /// temporary sink failure whose policy dropped the buffered records is
    /// tolerated as long as it freed enough space.
    pub fn reserve(&mut self, n: usize) -> Result<&mut [u8], FlushError> {
        if self.buf.len() - self.commit_end >= n {
            return Ok(&mut self.buf[self.commit_end..self.commit_end + n]);
        }
        self.reserve_slow_path(n)
    }

    #[cold]
    fn reserve_slow_path(&mut self, n: usize) -> Result<&mut [u8], FlushError> {
        let frame_bytes = self.commit_end - self.frame_end;
        if frame_bytes + n > self.buf.len() {
            return Err(FlushError::ExcessiveFrame {
                needed: frame_bytes + n,
                capacity: self.buf.len(),
            });
        }

        match self.flush() {
            Ok(()) => {}
            // The drop policies cleared the completed records out of the
            // buffer; a temporary failure therefore still freed the space
            // we need, and preserving the record in progress loses less
            // data than aborting it.
            Err(FlushError::Sink(e)) if e.kind == SinkErrorKind::Temporary => {}
            Err(e) => return Err(e),
        }

        debug_assert!(self.buf.len() - self.commit_end >= n);
        Ok(&mut self.buf[self.commit_end..self.commit_end + n])
    }

    /// Advances the write cursor over `n` bytes obtained from a preceding
    /// [`reserve`](Self::reserve).
    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.commit_end += n;
        debug_assert_output_regions!(self.frame_end, self.commit_end, self.buf.len());
    }

    /// Appends `bytes`, flushing as needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), FlushError> {
        let dst = self.reserve(bytes.len())?;
        dst.copy_from_slice(bytes);
        self.commit(bytes.len());
        Ok(())
    }

    /// Appends a string slice.
    pub fn write_str(&mut self, s: &str) -> Result<(), FlushError> {
        self.write(s.as_bytes())
    }

    /// Appends a single character, UTF-8 encoded.
    pub fn write_char(&mut self, c: char) -> Result<(), FlushError> {
        let mut utf8 = [0u8; 4];
        self.write(c.encode_utf8(&mut utf8).as_bytes())
    }

    // ---------------------------------------------------------------------
    // WORKER API
    // ---------------------------------------------------------------------

    /// Seals the record being formatted: its bytes become eligible for the
    /// next flush.
    pub(crate) fn mark_frame_complete(&mut self) {
        self.frame_end = self.commit_end;
        self.frames_in_buffer += 1;
    }

    /// Discards everything written for the record currently being
    /// formatted.
    pub(crate) fn revert_frame(&mut self) {
        self.commit_end = self.frame_end;
    }

    /// `true` if at least one complete record awaits flushing.
    pub(crate) fn has_complete_frame(&self) -> bool {
        self.frame_end != 0
    }

    /// Accounts for a record the worker skipped because the buffer could
    /// not accept its output.
    pub(crate) fn record_dropped_frame(&mut self, error: SinkError) {
        if self.control.policy_for(error.kind) == ErrorPolicy::NotifyOnRecovery {
            if self.lost_frames == 0 {
                self.initial_error = Some(error);
            }
            self.lost_frames += 1;
        }
    }

    /// Writes all complete records to the sink.
    ///
    /// On success, ends any error episode and fires the recovery
    /// notification. On failure, applies the policy configured for the
    /// error class; `Block` retries in place with exponential backoff
    /// until the sink recovers or a panic flush begins. A panicking sink
    /// is promoted to a fatal permanent failure, since there is no telling
    /// how much it wrote.
    pub(crate) fn flush(&mut self) -> Result<(), FlushError> {
        let mut backoff = WaitBackoff::new();
        loop {
            debug_assert_output_regions!(self.frame_end, self.commit_end, self.buf.len());
            let complete = self.frame_end;

            let sink = &mut self.sink;
            let buf = &self.buf[..complete];
            let outcome = catch_unwind(AssertUnwindSafe(|| sink.write(buf)));

            let (written, failure) = match outcome {
                Ok(Ok(n)) => {
                    debug_assert_eq!(n, complete, "a successful sink must write all data");
                    (n.min(complete), None)
                }
                Ok(Err(e)) => {
                    debug_assert!(e.written <= complete);
                    (e.written.min(complete), Some((e, false)))
                }
                // The sink panicked; errors must come back through the
                // error code, because now there is no way to know how much
                // reached the target.
                Err(_) => (0, Some((SinkError::permanent(), true))),
            };

            // Discard what was written, keep what remains (including the
            // record in progress past `frame_end`).
            if written > 0 {
                self.buf.copy_within(written..self.commit_end, 0);
                self.frame_end -= written;
                self.commit_end -= written;
            }
            let frames = mem::take(&mut self.frames_in_buffer);

            let (error, from_panic) = match failure {
                None => {
                    if self.error_state.take().is_some() && self.lost_frames > 0 {
                        self.notify_recovery();
                    }
                    return Ok(());
                }
                Some(f) => f,
            };

            self.error_state = Some(error.kind);
            if from_panic {
                return Err(FlushError::Fatal(error));
            }

            match self.control.policy_for(error.kind) {
                ErrorPolicy::Ignore => {
                    self.discard_complete_frames();
                    return Err(FlushError::Sink(error));
                }
                ErrorPolicy::NotifyOnRecovery => {
                    if self.lost_frames == 0 {
                        self.initial_error = Some(error);
                    }
                    self.lost_frames += frames;
                    self.discard_complete_frames();
                    return Err(FlushError::Sink(error));
                }
                ErrorPolicy::Block => {
                    // Poll the sink until it recovers. Producers block
                    // naturally once the queues fill up behind us. A crash
                    // in progress takes priority: give up so the panic
                    // flush can finish and the process can die.
                    self.frames_in_buffer = frames;
                    self.control.worker_wake.wait_timeout(backoff.next());
                    if self.control.panic_flush_requested() {
                        return Err(FlushError::Fatal(error));
                    }
                }
                ErrorPolicy::FailImmediately => {
                    return Err(FlushError::Fatal(error));
                }
            }
        }
    }

    /// Drops the buffered complete records, keeping the record in
    /// progress. The lost bytes were already accounted by the caller.
    fn discard_complete_frames(&mut self) {
        self.buf.copy_within(self.frame_end..self.commit_end, 0);
        self.commit_end -= self.frame_end;
        self.frame_end = 0;
    }

    /// Ends a loss episode: reports the first error and the aggregate
    /// count, then clears the counters. The callback is taken out of its
    /// slot for the duration of the call, so a callback that writes into
    /// the buffer cannot re-enter itself.
    fn notify_recovery(&mut self) {
        let taken = self.control.flush_error_callback.lock().unwrap().take();
        let error = self
            .initial_error
            .take()
            .unwrap_or_else(SinkError::temporary);
        let lost = mem::take(&mut self.lost_frames);

        if let Some(mut callback) = taken {
            callback(self, error, lost);
            // Anything the callback wrote forms a record of its own, so
            // the notification reaches the sink even if the log goes
            // quiet.
            if self.commit_end > self.frame_end {
                self.mark_frame_complete();
            }
            let mut slot = self.control.flush_error_callback.lock().unwrap();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}
