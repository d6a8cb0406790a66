//! Log Stream Pipeline
//!
//! A job's computation writes plain output into an append-only scratch file
//! (`OutputBuffer`). A watcher thread polls that file on a fixed interval and
//! commits complete new lines to the Job Store. Structured diagnostics bypass
//! the poll cycle: they go through a channel whose drain task appends them
//! immediately.
//!
//! When the computation ends, [`LogStream::finish`] stops the watcher, flushes
//! pending diagnostics, and runs a final sweep over the whole scratch file.
//! The sweep appends every line not already committed (matched by exact content,
//! counting repeats), so nothing is lost when the watcher was slow, crashed, or
//! never started.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vacal_common::{Error, Result};

use crate::db::logs;
use crate::models::LogEntry;

/// Prefix marking diagnostic entries in the job log
pub const WARNING_PREFIX: &str = "WARNING: ";

/// Append-only scratch file receiving a job's plain output
#[derive(Debug)]
pub struct OutputBuffer {
    path: PathBuf,
    file: Mutex<File>,
}

impl OutputBuffer {
    /// Create (or reopen for append) the scratch file, creating parent folders
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line of output
    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::Internal("output buffer lock poisoned".to_string()))?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    /// Append one line of output; a write failure is logged, not returned
    pub fn line(&self, line: &str) {
        if let Err(e) = self.write_line(line) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write job output");
        }
    }

    /// Handle usable as a child process's stdout or stderr
    pub fn child_stdio(&self) -> Result<Stdio> {
        let file = self
            .file
            .lock()
            .map_err(|_| Error::Internal("output buffer lock poisoned".to_string()))?;
        Ok(Stdio::from(file.try_clone()?))
    }
}

/// Sink for structured diagnostic conditions.
///
/// Raising a diagnostic never fails: when the channel is gone the message
/// still reaches tracing.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    job_id: Uuid,
    tx: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl Diagnostics {
    /// Diagnostics that only reach tracing
    pub fn detached(job_id: Uuid) -> Self {
        Self { job_id, tx: None }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(job_id = %self.job_id, "{}", message);
        self.send(message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(job_id = %self.job_id, "{}", message);
        self.send(format!("{}{}", WARNING_PREFIX, message));
    }

    fn send(&self, text: String) {
        if let Some(tx) = &self.tx {
            if tx.send(LogEntry::now(text)).is_err() {
                tracing::debug!(job_id = %self.job_id, "Diagnostic channel closed; entry kept in tracing only");
            }
        }
    }
}

/// Running pipeline for one job
pub struct LogStream {
    job_id: Uuid,
    pool: SqlitePool,
    buffer: Arc<OutputBuffer>,
    diagnostics: Diagnostics,
    stop_tx: Option<std_mpsc::Sender<()>>,
    watcher: Option<thread::JoinHandle<()>>,
    drain_shutdown: Option<oneshot::Sender<()>>,
    drain: Option<JoinHandle<()>>,
}

impl LogStream {
    /// Start the pipeline with a watcher polling every `poll_interval`.
    ///
    /// Must be called inside a tokio runtime. A watcher that cannot be started
    /// is logged and the pipeline continues sweep-only.
    pub fn start(pool: SqlitePool, job_id: Uuid, scratch_path: &Path, poll_interval: Duration) -> Result<Self> {
        Self::start_inner(pool, job_id, scratch_path, Some(poll_interval))
    }

    /// Start the pipeline without a watcher; output appears at the final sweep
    pub fn start_sweep_only(pool: SqlitePool, job_id: Uuid, scratch_path: &Path) -> Result<Self> {
        Self::start_inner(pool, job_id, scratch_path, None)
    }

    fn start_inner(
        pool: SqlitePool,
        job_id: Uuid,
        scratch_path: &Path,
        poll_interval: Option<Duration>,
    ) -> Result<Self> {
        let buffer = Arc::new(OutputBuffer::create(scratch_path)?);

        let (tx, rx) = mpsc::unbounded_channel();
        let (drain_shutdown, shutdown_rx) = oneshot::channel();
        let drain = tokio::spawn(drain_diagnostics(pool.clone(), job_id, rx, shutdown_rx));
        let diagnostics = Diagnostics { job_id, tx: Some(tx) };

        let mut stream = Self {
            job_id,
            pool,
            buffer,
            diagnostics,
            stop_tx: None,
            watcher: None,
            drain_shutdown: Some(drain_shutdown),
            drain: Some(drain),
        };

        if let Some(interval) = poll_interval {
            stream.spawn_watcher(interval);
        }

        Ok(stream)
    }

    fn spawn_watcher(&mut self, interval: Duration) {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let watcher = Watcher {
            job_id: self.job_id,
            pool: self.pool.clone(),
            path: self.buffer.path().to_path_buf(),
            offset: 0,
            runtime: tokio::runtime::Handle::current(),
        };

        let spawned = thread::Builder::new()
            .name(format!("log-watcher-{}", self.job_id))
            .spawn(move || watcher.run(interval, stop_rx));

        match spawned {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.watcher = Some(handle);
            }
            Err(e) => {
                self.diagnostics.warn(format!(
                    "Log watcher could not start ({}); output will appear when the job finishes",
                    e
                ));
            }
        }
    }

    pub fn buffer(&self) -> Arc<OutputBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.clone()
    }

    pub fn has_watcher(&self) -> bool {
        self.watcher.is_some()
    }

    /// Stop the watcher, flush diagnostics and run the final sweep.
    ///
    /// Returns the number of lines the sweep appended.
    pub async fn finish(mut self) -> Result<usize> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // A send error means the watcher already exited
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.watcher.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!(job_id = %self.job_id, "Log watcher ended abnormally; relying on final sweep");
            }
        }

        if let Some(shutdown) = self.drain_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(drain) = self.drain.take() {
            if let Err(e) = drain.await {
                tracing::warn!(job_id = %self.job_id, error = %e, "Diagnostic drain task failed");
            }
        }

        final_sweep(&self.pool, self.job_id, self.buffer.path()).await
    }
}

async fn drain_diagnostics(
    pool: SqlitePool,
    job_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => commit_diagnostic(&pool, job_id, &entry).await,
                None => return,
            },
            _ = &mut shutdown => break,
        }
    }

    // Refuse new entries, commit what is queued
    rx.close();
    while let Some(entry) = rx.recv().await {
        commit_diagnostic(&pool, job_id, &entry).await;
    }
}

async fn commit_diagnostic(pool: &SqlitePool, job_id: Uuid, entry: &LogEntry) {
    if let Err(e) = logs::append_log(pool, job_id, entry).await {
        tracing::error!(job_id = %job_id, error = %e, text = %entry.text, "Failed to commit diagnostic");
    }
}

struct Watcher {
    job_id: Uuid,
    pool: SqlitePool,
    path: PathBuf,
    offset: u64,
    runtime: tokio::runtime::Handle,
}

impl Watcher {
    fn run(mut self, interval: Duration, stop_rx: std_mpsc::Receiver<()>) {
        tracing::debug!(job_id = %self.job_id, interval_ms = interval.as_millis() as u64, "Log watcher started");
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(std_mpsc::RecvTimeoutError::Timeout) => self.poll(),
                Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(job_id = %self.job_id, offset = self.offset, "Log watcher stopped");
    }

    fn poll(&mut self) {
        let (lines, consumed) = match read_complete_lines(&self.path, self.offset) {
            Ok(read) => read,
            Err(e) => {
                tracing::debug!(job_id = %self.job_id, error = %e, "Scratch buffer not readable yet");
                return;
            }
        };
        if lines.is_empty() {
            return;
        }

        let entries: Vec<LogEntry> = lines.into_iter().map(LogEntry::now).collect();
        match self
            .runtime
            .block_on(logs::append_logs(&self.pool, self.job_id, &entries))
        {
            // Offset only advances once the lines are durable
            Ok(()) => self.offset += consumed,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Log commit failed; will retry next poll")
            }
        }
    }
}

/// Complete lines appended after `offset`, with the number of bytes they span.
/// A trailing partial line is left for a later read.
fn read_complete_lines(path: &Path, offset: u64) -> std::io::Result<(Vec<String>, u64)> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let Some(last_newline) = bytes.iter().rposition(|&b| b == b'\n') else {
        return Ok((Vec::new(), 0));
    };
    let complete = &bytes[..=last_newline];
    let lines = String::from_utf8_lossy(complete)
        .lines()
        .map(str::to_string)
        .collect();
    Ok((lines, complete.len() as u64))
}

/// Append every scratch line not already in the job log, counting repeats.
///
/// Returns the number of lines appended.
pub async fn final_sweep(pool: &SqlitePool, job_id: Uuid, scratch_path: &Path) -> Result<usize> {
    let content = match tokio::fs::read(scratch_path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut committed: HashMap<String, usize> = HashMap::new();
    for text in logs::load_log_texts(pool, job_id).await? {
        *committed.entry(text).or_default() += 1;
    }

    let mut missing = Vec::new();
    for line in content.lines() {
        match committed.get_mut(line) {
            Some(count) if *count > 0 => *count -= 1,
            _ => missing.push(LogEntry::now(line)),
        }
    }

    logs::append_logs(pool, job_id, &missing).await?;
    tracing::debug!(job_id = %job_id, appended = missing.len(), "Final log sweep complete");
    Ok(missing.len())
}
