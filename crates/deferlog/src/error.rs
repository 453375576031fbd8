//! Error taxonomy for the logging pipeline.
//!
//! Failures fall into three families: producer-side errors surfaced from
//! [`Log::write`](crate::Log::write) ([`WriteError`]), sink failures
//! classified by recoverability ([`SinkError`]), and worker-side flush
//! outcomes ([`FlushError`]) that drive the error-policy state machine.

use std::fmt;
use thiserror::Error;

/// What the worker does when a flush fails.
///
/// Configured independently for temporary and permanent sink failures via
/// [`Log::set_temporary_error_policy`](crate::Log::set_temporary_error_policy)
/// and
/// [`Log::set_permanent_error_policy`](crate::Log::set_permanent_error_policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Drop the buffered records silently and carry on.
    Ignore,
    /// Drop the buffered records, but count them; when the sink recovers,
    /// invoke the flush-error callback once with the first error observed
    /// and the total number of lost records.
    NotifyOnRecovery,
    /// Keep the records and retry the flush with exponential backoff (up
    /// to one second between attempts). Producers block once the queues
    /// fill up. A panic flush abandons the retry.
    Block,
    /// Latch a fatal error and terminate the worker; the next producer
    /// call fails with [`WriteError::Writer`].
    FailImmediately,
}

/// Recoverability class of a sink failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkErrorKind {
    /// The sink may start working again (disk full, would-block).
    #[error("temporary sink failure")]
    Temporary,
    /// The sink will not recover (bad descriptor, broken pipe).
    #[error("permanent sink failure")]
    Permanent,
}

/// A failed [`Sink::write`](crate::Sink::write).
///
/// `written` reflects partial progress truthfully: the sink consumed that
/// many bytes of the buffer before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkError {
    /// Recoverability class.
    pub kind: SinkErrorKind,
    /// Bytes the sink accepted before the failure.
    pub written: usize,
    /// Underlying OS error code, if any.
    pub code: Option<i32>,
}

impl SinkError {
    /// A temporary failure that consumed no bytes.
    pub fn temporary() -> Self {
        Self {
            kind: SinkErrorKind::Temporary,
            written: 0,
            code: None,
        }
    }

    /// A permanent failure that consumed no bytes.
    pub fn permanent() -> Self {
        Self {
            kind: SinkErrorKind::Permanent,
            written: 0,
            code: None,
        }
    }

    /// Records partial progress made before the failure.
    pub fn with_written(mut self, written: usize) -> Self {
        self.written = written;
        self
    }

    /// Attaches the underlying OS error code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Classifies an I/O error by the file-sink equivalence rule: out of
    /// space is temporary (the disk may be cleaned up), everything else is
    /// permanent.
    pub fn from_io(err: &std::io::Error, written: usize) -> Self {
        let code = err.raw_os_error();
        let kind = match code {
            #[cfg(unix)]
            Some(libc::ENOSPC) => SinkErrorKind::Temporary,
            _ => SinkErrorKind::Permanent,
        };
        Self {
            kind,
            written,
            code,
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(code) = self.code {
            write!(f, " (os error {code})")?;
        }
        if self.written > 0 {
            write!(f, " after {} bytes", self.written)?;
        }
        Ok(())
    }
}

impl std::error::Error for SinkError {}

/// Outcome of a failed output-buffer operation, seen by formatters through
/// [`OutputBuffer::reserve`](crate::OutputBuffer::reserve) and by the
/// worker from `flush`.
#[derive(Debug, Clone, Error)]
pub enum FlushError {
    /// A single record produced more output than the whole output buffer
    /// can hold. Enlarge the buffer or produce less data per record.
    #[error("record output of {needed} bytes exceeds output buffer capacity {capacity}")]
    ExcessiveFrame { needed: usize, capacity: usize },
    /// The sink failed and the active policy dropped the buffered records.
    /// The worker unwinds the current record and continues.
    #[error("sink failed, records dropped: {0}")]
    Sink(SinkError),
    /// The sink failed under `FailImmediately`, panicked, or a `Block`
    /// retry was abandoned by a panic flush. The worker terminates.
    #[error("fatal sink failure: {0}")]
    Fatal(SinkError),
}

impl FlushError {
    /// `true` if the worker must latch the error and exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Why a formatter invocation produced no record.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The output buffer could not make room; see [`FlushError`].
    #[error(transparent)]
    Flush(#[from] FlushError),
    /// The formatter itself failed.
    #[error("formatter error: {0}")]
    Format(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The formatter panicked; the payload is rendered as text.
    #[error("formatter panicked: {0}")]
    Panic(String),
}

impl FrameError {
    /// Wraps an arbitrary formatter failure.
    pub fn format<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Format(Box::new(err))
    }

    /// A formatter failure described by a message.
    pub fn message(msg: impl Into<String>) -> Self {
        let text: String = msg.into();
        Self::Format(text.into())
    }
}

/// Producer-side failure of [`Log::write`](crate::Log::write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The record's capture frame can never fit in a thread input buffer
    /// of the configured size. This is a configuration error.
    #[error("frame of {frame_size} bytes exceeds input buffer capacity {capacity}")]
    CapacityExhausted { frame_size: usize, capacity: usize },
    /// The worker terminated on a fatal sink error; the cause is latched
    /// and returned to every subsequent write.
    #[error("log worker terminated: {0}")]
    Writer(SinkError),
    /// Allocating the thread input buffer failed.
    #[error("out of memory allocating thread input buffer")]
    OutOfMemory,
}

/// Failure of [`Log::open`](crate::Log::open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpenError {
    /// Allocating the output buffer or shared queue failed.
    #[error("out of memory allocating log buffers")]
    OutOfMemory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_display() {
        let e = SinkError::temporary().with_code(28).with_written(12);
        let s = e.to_string();
        assert!(s.contains("temporary"));
        assert!(s.contains("28"));
        assert!(s.contains("12 bytes"));
    }

    #[cfg(unix)]
    #[test]
    fn test_io_classification() {
        let enospc = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(
            SinkError::from_io(&enospc, 0).kind,
            SinkErrorKind::Temporary
        );

        let ebadf = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(SinkError::from_io(&ebadf, 0).kind, SinkErrorKind::Permanent);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(FlushError::Fatal(SinkError::permanent()).is_fatal());
        assert!(!FlushError::Sink(SinkError::temporary()).is_fatal());
    }
}
