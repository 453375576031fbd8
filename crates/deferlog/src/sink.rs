use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{SinkError, SinkErrorKind};

/// Pluggable byte destination behind the output buffer.
///
/// The worker hands a sink only whole records per call. A successful write
/// consumes the entire buffer (`Ok(buf.len())`); a failing write reports
/// how many bytes it accepted before failing, truthfully, via
/// [`SinkError::written`](crate::SinkError). Sinks classify their own
/// failures as temporary or permanent; see [`SinkError::from_io`] for the
/// errno equivalence rule used by [`FileSink`].
///
/// A sink must not panic: a panic escaping `write` is treated as a fatal
/// permanent failure because the amount of data written is unknowable.
pub trait Sink: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError>;
}

/// Appends records to a file.
///
/// Classifies `ENOSPC` as temporary (the log resumes when the disk is
/// cleaned up) and every other I/O error as permanent.
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Opens `path` for appending, creating it if needed.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl Sink for FileSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
        let mut written = 0;
        while written < buf.len() {
            match self.file.write(&buf[written..]) {
                Ok(0) => {
                    return Err(SinkError {
                        kind: SinkErrorKind::Permanent,
                        written,
                        code: None,
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SinkError::from_io(&e, written)),
            }
        }
        Ok(written)
    }
}

/// Collects records in memory behind a shared handle.
///
/// Intended for tests and examples: clone the handle from
/// [`contents`](Self::contents) before moving the sink into the log, then
/// inspect the bytes after `close`.
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected bytes.
    pub fn contents(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.data)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Discards everything. For benchmarks.
pub struct NullSink;

impl Sink for NullSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects() {
        let mut sink = MemorySink::new();
        let contents = sink.contents();

        assert_eq!(sink.write(b"abc").unwrap(), 3);
        assert_eq!(sink.write(b"def").unwrap(), 3);
        assert_eq!(&*contents.lock().unwrap(), b"abcdef");
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let mut sink = NullSink;
        assert_eq!(sink.write(&[0u8; 4096]).unwrap(), 4096);
    }

    #[test]
    fn test_file_sink_appends() {
        let path = std::env::temp_dir().join(format!(
            "deferlog-file-sink-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        let mut sink = FileSink::new(&path).unwrap();
        sink.write(b"hello ").unwrap();
        sink.write(b"file").unwrap();
        drop(sink);

        // Reopening appends rather than truncating.
        let mut sink = FileSink::new(&path).unwrap();
        sink.write(b"!").unwrap();
        drop(sink);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, b"hello file!");
        let _ = std::fs::remove_file(&path);
    }
}
