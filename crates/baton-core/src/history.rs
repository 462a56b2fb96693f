//! Append-only audit ledger (`history.jsonl`).
//!
//! One JSON object per line. Appenders never lock: each event is written with
//! a single `write` on an append-mode handle, which keeps lines whole even
//! with several processes appending at once. Line order across processes is
//! best effort; the event's own `timestamp` is authoritative.

use crate::error::{BatonError, Result};
use crate::types::{EventStatus, TddPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lines above this size are no longer a single small write; the `error`
/// field is trimmed to stay under it.
pub const MAX_LINE_BYTES: usize = 4096;

const TRUNCATION_MARK: &str = "…[truncated]";

/// Command names the core writes into the ledger. Routed sub-operations use
/// [`TddPhase::command`].
pub mod command {
    pub const INIT: &str = "init";
    pub const STATE_SET: &str = "state-set";
    pub const ASK: &str = "ask";
    pub const TASK_START: &str = "task-start";
    pub const TASK_COMPLETE: &str = "task-complete";
    pub const TASK_BLOCK: &str = "task-block";
    pub const TASK_FAIL: &str = "task-fail";
    pub const RECONSTRUCT: &str = "reconstruct";
}

// ---------------------------------------------------------------------------
// HistoryEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub status: EventStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TddPhase>,
}

impl HistoryEvent {
    pub fn success(command: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            command: command.into(),
            arguments: Vec::new(),
            model: None,
            status: EventStatus::Success,
            duration_ms: 0,
            error: None,
            task_id: None,
            phase: None,
        }
    }

    pub fn failure(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Failure,
            error: Some(error.into()),
            ..Self::success(command)
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_phase(mut self, phase: TddPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == EventStatus::Success
    }

    /// Serialize to one line, trimming `error` if the line would exceed
    /// [`MAX_LINE_BYTES`].
    fn to_line(&self) -> Result<String> {
        let line = serde_json::to_string(self)?;
        if line.len() <= MAX_LINE_BYTES {
            return Ok(line);
        }
        let Some(err) = self.error.as_deref() else {
            warn!(bytes = line.len(), command = %self.command, "oversize history line");
            return Ok(line);
        };
        let overflow = line.len() - MAX_LINE_BYTES;
        let keep = err
            .len()
            .saturating_sub(overflow + TRUNCATION_MARK.len() + 16);
        let mut cut = keep;
        while !err.is_char_boundary(cut) {
            cut -= 1;
        }
        warn!(
            bytes = line.len(),
            command = %self.command,
            "truncating error text in history line"
        );
        let trimmed = HistoryEvent {
            error: Some(format!("{}{TRUNCATION_MARK}", &err[..cut])),
            ..self.clone()
        };
        Ok(serde_json::to_string(&trimmed)?)
    }
}

// ---------------------------------------------------------------------------
// CancelFlag
// ---------------------------------------------------------------------------

/// Cloneable cancellation handle for [`HistoryLedger::follow`].
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// HistoryLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HistoryLedger {
    path: PathBuf,
}

impl HistoryLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single newline-terminated line.
    ///
    /// The ledger's directory must already exist; the ledger never creates a
    /// feature directory on its own.
    pub fn append(&self, event: &HistoryEvent) -> Result<()> {
        let line = event.to_line()?;
        crate::io::append_line(&self.path, &line)?;
        debug!(
            ledger = %self.path.display(),
            command = %event.command,
            status = %event.status,
            "history event appended"
        );
        Ok(())
    }

    /// Lazy reader over every event currently in the ledger.
    pub fn read(&self) -> Result<HistoryReader> {
        self.read_from(0)
    }

    /// Lazy reader starting at a byte offset previously returned by
    /// [`HistoryReader::offset`].
    pub fn read_from(&self, offset: u64) -> Result<HistoryReader> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(HistoryReader {
            reader: BufReader::new(file),
            path: self.path.clone(),
            offset,
            buf: Vec::new(),
        })
    }

    /// The last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<HistoryEvent>> {
        let mut last = VecDeque::with_capacity(n);
        for event in self.read()? {
            let event = event?;
            if n == 0 {
                continue;
            }
            if last.len() == n {
                last.pop_front();
            }
            last.push_back(event);
        }
        Ok(last.into())
    }

    /// Every event recorded for `task_id`, in file order.
    pub fn events_for_task(&self, task_id: &str) -> Result<Vec<HistoryEvent>> {
        self.read()?
            .filter(|e| match e {
                Ok(ev) => ev.task_id.as_deref() == Some(task_id),
                Err(_) => true,
            })
            .collect()
    }

    /// Unbounded stream of events from `offset`, polling for new lines every
    /// `poll` until `cancel` fires.
    pub fn follow(&self, offset: u64, cancel: CancelFlag, poll: Duration) -> Result<Follow> {
        Ok(Follow {
            reader: self.read_from(offset)?,
            cancel,
            poll,
        })
    }
}

// ---------------------------------------------------------------------------
// HistoryReader
// ---------------------------------------------------------------------------

/// Finite, restartable iterator over ledger events.
///
/// A trailing line without its newline belongs to a writer that has not
/// finished; it is left unconsumed so a later read picks it up whole.
pub struct HistoryReader {
    reader: BufReader<File>,
    path: PathBuf,
    offset: u64,
    buf: Vec<u8>,
}

impl HistoryReader {
    /// Byte offset just past the last event yielded.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') {
                self.reader.seek(SeekFrom::Start(self.offset))?;
                return Ok(None);
            }
            self.offset += n as u64;
            let line = &self.buf[..n - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line.to_vec()));
        }
    }
}

impl Iterator for HistoryReader {
    type Item = Result<HistoryEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.offset;
        match self.read_line() {
            Ok(None) => None,
            Ok(Some(line)) => Some(serde_json::from_slice(&line).map_err(|e| {
                BatonError::corrupt(&self.path, format!("bad record at byte {start}: {e}"))
            })),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Unbounded companion of [`HistoryReader`]; ends only on cancellation.
pub struct Follow {
    reader: HistoryReader,
    cancel: CancelFlag,
    poll: Duration,
}

impl Follow {
    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }
}

impl Iterator for Follow {
    type Item = Result<HistoryEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.reader.next() {
                return Some(item);
            }
            std::thread::sleep(self.poll);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
