//! Writes a burst of records from several threads to a log file.
//!
//! Usage: `cargo run --bin file_demo [path]` (default: demo.log)

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use deferlog::{FileSink, Formatter, FrameError, Log, LogConfig, OutputBuffer};

struct LineFormatter;

impl Formatter<(usize, u64, &'static str)> for LineFormatter {
    fn format(
        out: &mut OutputBuffer,
        args: &(usize, u64, &'static str),
    ) -> Result<(), FrameError> {
        let (thread_id, seq, message) = *args;
        out.write_str(&format!("[t{thread_id}] #{seq} {message}\n"))?;
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demo.log".to_string());
    const THREADS: usize = 4;
    const RECORDS: u64 = 25_000;

    let sink = FileSink::new(&path)?;
    let log = Arc::new(Log::open(sink, LogConfig::default())?);

    let start = Instant::now();
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for seq in 0..RECORDS {
                    log.write::<LineFormatter, _>((t, seq, "the quick brown fox"))
                        .expect("write failed");
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    let produced = start.elapsed();

    let log = Arc::try_unwrap(log).unwrap_or_else(|_| unreachable!());
    log.close()?;
    let drained = start.elapsed();

    println!(
        "{} records captured in {produced:?}, drained to {path} in {drained:?}",
        THREADS as u64 * RECORDS
    );
    Ok(())
}
