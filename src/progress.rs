//! Transfer progress and cancellation
//!
//! [`TransferProgress`] keeps cumulative counters behind a lock so that
//! transfer clients may report from any thread. Callbacks fire at most once
//! per [`REPORT_INTERVAL`] bytes and always outside the lock.
//!
//! [`CancelFlag`] is the cooperative cancellation signal checked by scans,
//! backups and restores between files and between chunks.

use crate::error::{FilesonError, Result};
use crate::types::{ProgressCallback, ProgressInfo};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bytes between two progress callbacks
pub const REPORT_INTERVAL: u64 = 1024 * 1024;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return [`FilesonError::Cancelled`] if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FilesonError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    current_item: Option<String>,
    files_done: usize,
    bytes: u64,
    last_report: u64,
}

/// Cumulative byte and file counters for one run
#[derive(Clone)]
pub struct TransferProgress {
    operation: Arc<str>,
    total_files: Option<usize>,
    total_bytes: Option<u64>,
    state: Arc<Mutex<ProgressState>>,
    callback: Option<ProgressCallback>,
    interval: u64,
    started: Instant,
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProgress")
            .field("operation", &self.operation)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl TransferProgress {
    /// Create counters for an operation with optional known totals
    pub fn new(operation: &str, total_files: Option<usize>, total_bytes: Option<u64>) -> Self {
        Self {
            operation: Arc::from(operation),
            total_files,
            total_bytes,
            state: Arc::new(Mutex::new(ProgressState {
                current_item: None,
                files_done: 0,
                bytes: 0,
                last_report: 0,
            })),
            callback: None,
            interval: REPORT_INTERVAL,
            started: Instant::now(),
        }
    }

    /// Attach a callback
    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Change the reporting interval in bytes
    pub fn with_interval(mut self, bytes: u64) -> Self {
        self.interval = bytes.max(1);
        self
    }

    /// Mark the start of a new item
    pub fn start_item(&self, name: &str) {
        let info = {
            let mut state = self.state.lock();
            state.current_item = Some(name.to_string());
            self.snapshot(&state)
        };
        self.emit(info);
    }

    /// Add transferred bytes, reporting when the interval is crossed
    pub fn advance(&self, bytes: u64) {
        let info = {
            let mut state = self.state.lock();
            state.bytes += bytes;
            if state.bytes - state.last_report < self.interval {
                return;
            }
            state.last_report = state.bytes;
            self.snapshot(&state)
        };
        self.emit(info);
    }

    /// Mark the current item done
    pub fn finish_item(&self) {
        let info = {
            let mut state = self.state.lock();
            state.files_done += 1;
            state.current_item = None;
            self.snapshot(&state)
        };
        self.emit(info);
    }

    /// Bytes transferred so far
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// Items finished so far
    pub fn files(&self) -> usize {
        self.state.lock().files_done
    }

    /// Time since the counters were created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average throughput in MiB/s
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes() as f64 / (1024.0 * 1024.0) / secs
    }

    fn snapshot(&self, state: &ProgressState) -> ProgressInfo {
        ProgressInfo {
            operation: self.operation.to_string(),
            current_item: state.current_item.clone(),
            processed: state.files_done,
            total: self.total_files,
            bytes_processed: state.bytes,
            total_bytes: self.total_bytes,
        }
    }

    fn emit(&self, info: ProgressInfo) {
        if let Some(callback) = &self.callback {
            callback(info);
        }
    }
}

fn cancelled() -> io::Error {
    io::Error::other("operation cancelled")
}

/// Reader adapter that counts bytes and honors cancellation
pub struct ProgressReader<R> {
    inner: R,
    progress: TransferProgress,
    cancel: CancelFlag,
}

impl<R: Read> ProgressReader<R> {
    /// Wrap a reader
    pub fn new(inner: R, progress: TransferProgress, cancel: CancelFlag) -> Self {
        Self { inner, progress, cancel }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = self.inner.read(buf)?;
        self.progress.advance(n as u64);
        Ok(n)
    }
}

/// Writer adapter that counts bytes and honors cancellation
pub struct ProgressWriter<W> {
    inner: W,
    progress: TransferProgress,
    cancel: CancelFlag,
}

impl<W: Write> ProgressWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W, progress: TransferProgress, cancel: CancelFlag) -> Self {
        Self { inner, progress, cancel }
    }

    /// Unwrap the inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = self.inner.write(buf)?;
        self.progress.advance(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
