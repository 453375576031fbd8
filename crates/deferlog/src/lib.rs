//! deferlog - Asynchronous Low-Latency Logging
//!
//! A producing thread records a log event by *capturing* its arguments, not
//! formatting them, and returns as quickly as possible; all formatting and
//! I/O happen on a dedicated worker thread. Each producer gets a private
//! SPSC ring for its captured frames, so producers never contend with each
//! other; a bounded lock-free queue of commit extents tells the worker
//! where to read.
//!
//! # Key features
//!
//! - Lock-free hand-off: per-thread input rings + MPSC extent queue
//! - Deferred formatting through per-type dispatch vtables
//! - Record-atomic output: the sink never sees a torn record
//! - Configurable recovery from sink failures (ignore / notify / block /
//!   fail), with loss accounting and a recovery notification
//! - Panic flush: a best-effort final drain for crashing processes
//!
//! # Example
//!
//! ```
//! use deferlog::{FrameError, Formatter, Log, LogConfig, MemorySink, OutputBuffer};
//!
//! struct Plain;
//!
//! impl Formatter<(&'static str, u32)> for Plain {
//!     fn format(out: &mut OutputBuffer, args: &(&'static str, u32)) -> Result<(), FrameError> {
//!         out.write_str(args.0)?;
//!         out.write_str(&args.1.to_string())?;
//!         out.write_char('\n')?;
//!         Ok(())
//!     }
//! }
//!
//! let sink = MemorySink::new();
//! let contents = sink.contents();
//! let log = Log::open(sink, LogConfig::default()).unwrap();
//!
//! log.write::<Plain, _>(("answer: ", 42)).unwrap();
//!
//! log.close().unwrap();
//! assert_eq!(&*contents.lock().unwrap(), b"answer: 42\n");
//! ```

mod backoff;
mod error;
mod event;
mod frame;
mod input_buffer;
mod invariants;
mod log;
mod output_buffer;
mod queue;
mod sink;
mod util;

pub use backoff::WaitBackoff;
pub use error::{
    ErrorPolicy, FlushError, FrameError, OpenError, SinkError, SinkErrorKind, WriteError,
};
pub use event::SpscEvent;
pub use frame::{vtable, Formatter, FrameVtable};
pub use log::{FormatErrorCallback, Log, LogConfig};
pub use output_buffer::{FlushErrorCallback, OutputBuffer};
pub use sink::{FileSink, MemorySink, NullSink, Sink};
