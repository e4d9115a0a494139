//! Console recording.
//!
//! Mirrors every appended entry to `<dir>/<process_id>.jsonl` so that console
//! history and sequence numbers survive a panel restart. Format is
//! newline-delimited JSON, one entry per line, plus occasional mark lines
//! `{"high_water": N, "closed": bool}` that carry the numbering forward when
//! entries could not be written.
//!
//! Recording is best-effort: a full queue drops the entry, never the append.
//! A dropped entry still raises the persisted high-water mark, so a restart
//! never hands out a sequence number a viewer has already seen.

use panel_core::{file_stem, LogEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Queue depth between appenders and the writer task.
pub const RECORD_QUEUE: usize = 4096;

/// Commands handled per write cycle before marks are written and buffers
/// flushed.
const MAX_BATCH: usize = 512;

/// A single recorded console entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEntry {
    pub seq: u64,
    pub line: String,
    /// Milliseconds since the Unix epoch when the entry was appended.
    pub timestamp_ms: u64,
}

/// Highest sequence number issued so far, whether or not it was written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SeqMark {
    high_water: u64,
    /// Written on orderly shutdown only.
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordLine {
    Entry(RecordedEntry),
    Mark(SeqMark),
}

/// A recording loaded back from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recording {
    /// The retained tail, in sequence order.
    pub entries: Vec<LogEntry>,
    /// Numbering must continue after this.
    pub high_water: u64,
}

impl Recording {
    /// Whether every issued number up to `high_water` is in `entries`' range,
    /// so the tail can be served without a gap before the next append.
    pub fn is_contiguous(&self) -> bool {
        self.entries.last().map(|e| e.seq).unwrap_or(0) == self.high_water
    }
}

enum Command {
    Record(String, RecordedEntry),
    Flush {
        closed: bool,
        done: oneshot::Sender<()>,
    },
}

/// Hands entries to a background writer.
#[derive(Clone)]
pub struct ConsoleRecorder {
    tx: mpsc::Sender<Command>,
    /// Highest dropped seq per process, not yet covered by a mark.
    dropped: Arc<Mutex<HashMap<String, u64>>>,
}

impl ConsoleRecorder {
    /// Spawn the writer task. Files are compacted back to the last `keep`
    /// entries once they grow past twice that. Must be called from within a
    /// tokio runtime.
    pub fn spawn(dir: PathBuf, keep: usize) -> Self {
        let (tx, rx) = mpsc::channel(RECORD_QUEUE);
        let dropped = Arc::new(Mutex::new(HashMap::new()));
        let writer = Writer {
            dir,
            keep: keep.max(1),
            dropped: dropped.clone(),
            files: HashMap::new(),
        };
        tokio::spawn(writer.run(rx));
        Self { tx, dropped }
    }

    /// Queue an entry for writing.
    pub fn record(&self, process_id: &str, entry: &LogEntry) {
        let recorded = RecordedEntry {
            seq: entry.seq,
            line: entry.line.clone(),
            timestamp_ms: now_ms(),
        };
        let reason = match self.tx.try_send(Command::Record(process_id.to_string(), recorded)) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => "recorder queue full, entry not recorded",
            Err(TrySendError::Closed(_)) => "recorder stopped, entry not recorded",
        };
        warn!(process_id, seq = entry.seq, "{reason}");

        let mut dropped = self.dropped.lock().unwrap_or_else(PoisonError::into_inner);
        let high = dropped.entry(process_id.to_string()).or_insert(0);
        *high = (*high).max(entry.seq);
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) {
        self.send_flush(false).await;
    }

    /// Flush and mark every recording as cleanly closed.
    pub async fn close(&self) {
        self.send_flush(true).await;
    }

    async fn send_flush(&self, closed: bool) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush { closed, done }).await.is_err() {
            return;
        }
        let _ = wait.await;
    }
}

/// File a process's recording lives in.
pub fn recording_path(dir: &Path, process_id: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", file_stem(process_id)))
}

/// Load the last `keep` entries of a recording and its high-water mark.
///
/// A missing file yields an empty recording. Malformed and out-of-order
/// lines are skipped. A recording that was not closed cleanly may have lost
/// queued entries, so its high-water mark is pushed past anything that
/// could have been in flight.
pub async fn load_recording(path: &Path, keep: usize) -> std::io::Result<Recording> {
    let (mut recording, closed) = read_recording(path, keep).await?;
    if !closed {
        let skipped = recording.high_water + RECORD_QUEUE as u64;
        warn!(
            path = %path.display(),
            high_water = recording.high_water,
            resume_after = skipped,
            "recording was not closed cleanly"
        );
        recording.high_water = skipped;
    }
    Ok(recording)
}

/// The raw tail and mark of a recording, plus whether its last line is a
/// closing mark. Missing and empty files count as closed.
async fn read_recording(path: &Path, keep: usize) -> std::io::Result<(Recording, bool)> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Recording::default(), true))
        }
        Err(e) => return Err(e),
    };

    let mut lines = BufReader::new(file).lines();
    let mut tail: VecDeque<LogEntry> = VecDeque::with_capacity(keep.min(4096));
    let mut last_seq = 0u64;
    let mut high_water = 0u64;
    let mut closed = true;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordLine>(&line) {
            Ok(RecordLine::Entry(entry)) if entry.seq > last_seq => {
                last_seq = entry.seq;
                high_water = high_water.max(entry.seq);
                closed = false;
                tail.push_back(LogEntry::new(entry.seq, entry.line));
                if tail.len() > keep {
                    tail.pop_front();
                }
            }
            Ok(RecordLine::Entry(entry)) => {
                warn!(seq = entry.seq, "skipping out-of-order recording line");
            }
            Ok(RecordLine::Mark(mark)) => {
                high_water = high_water.max(mark.high_water);
                closed = mark.closed;
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed recording line");
            }
        }
    }

    let recording = Recording {
        entries: tail.into(),
        high_water,
    };
    Ok((recording, closed))
}

struct OpenRecording {
    path: PathBuf,
    out: BufWriter<File>,
    /// Highest seq covered by an entry or mark in the file.
    written: u64,
    /// Lines appended since the file was opened or compacted.
    lines: usize,
}

struct Writer {
    dir: PathBuf,
    keep: usize,
    dropped: Arc<Mutex<HashMap<String, u64>>>,
    files: HashMap<String, OpenRecording>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(command) => batch.push(command),
                    Err(_) => break,
                }
            }

            let mut waiting = Vec::new();
            let mut close = false;
            for command in batch {
                match command {
                    Command::Record(process_id, entry) => self.write_entry(&process_id, &entry).await,
                    Command::Flush { closed, done } => {
                        close |= closed;
                        waiting.push(done);
                    }
                }
            }

            self.end_cycle(close).await;
            for done in waiting {
                let _ = done.send(());
            }
        }
        self.end_cycle(false).await;
        debug!("console recorder stopped");
    }

    async fn write_entry(&mut self, process_id: &str, entry: &RecordedEntry) {
        match serde_json::to_string(entry) {
            Ok(line) => self.write_line(process_id, line, entry.seq).await,
            Err(e) => error!(error = %e, "failed to serialize recorded entry"),
        }
    }

    async fn write_mark(&mut self, process_id: &str, mark: SeqMark) {
        match serde_json::to_string(&mark) {
            Ok(line) => self.write_line(process_id, line, mark.high_water).await,
            Err(e) => error!(error = %e, "failed to serialize recording mark"),
        }
    }

    async fn write_line(&mut self, process_id: &str, mut line: String, seq: u64) {
        line.push('\n');
        let file = match self.open(process_id).await {
            Ok(file) => file,
            Err(e) => {
                error!(process_id, error = %e, "failed to open recording");
                return;
            }
        };
        match file.out.write_all(line.as_bytes()).await {
            Ok(()) => {
                file.written = file.written.max(seq);
                file.lines += 1;
            }
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "failed to write recording");
                self.files.remove(process_id);
            }
        }
    }

    async fn open(&mut self, process_id: &str) -> std::io::Result<&mut OpenRecording> {
        if !self.files.contains_key(process_id) {
            let path = recording_path(&self.dir, process_id);
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;
            self.files.insert(
                process_id.to_string(),
                OpenRecording {
                    path,
                    out: BufWriter::new(file),
                    written: 0,
                    lines: 0,
                },
            );
        }
        self.files
            .get_mut(process_id)
            .ok_or_else(|| std::io::Error::other("recording vanished"))
    }

    /// Cover dropped entries with marks, flush, and compact oversized files.
    async fn end_cycle(&mut self, close: bool) {
        let dropped: Vec<(String, u64)> = self
            .dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (process_id, high_water) in dropped {
            let written = self.files.get(&process_id).map(|f| f.written).unwrap_or(0);
            if high_water > written {
                self.write_mark(
                    &process_id,
                    SeqMark {
                        high_water,
                        closed: false,
                    },
                )
                .await;
            }
        }

        if close {
            let open: Vec<(String, u64)> = self
                .files
                .iter()
                .map(|(id, f)| (id.clone(), f.written))
                .collect();
            for (process_id, high_water) in open {
                self.write_mark(
                    &process_id,
                    SeqMark {
                        high_water,
                        closed: true,
                    },
                )
                .await;
            }
        }

        let mut failed = Vec::new();
        for (process_id, file) in self.files.iter_mut() {
            if let Err(e) = file.out.flush().await {
                error!(path = %file.path.display(), error = %e, "failed to flush recording");
                failed.push(process_id.clone());
            }
        }
        for process_id in failed {
            self.files.remove(&process_id);
        }

        let oversized: Vec<String> = self
            .files
            .iter()
            .filter(|(_, f)| f.lines >= self.keep.saturating_mul(2))
            .map(|(id, _)| id.clone())
            .collect();
        for process_id in oversized {
            if let Err(e) = self.compact(&process_id, close).await {
                error!(process_id = %process_id, error = %e, "failed to compact recording");
            }
        }
    }

    /// Rewrite a recording as its last `keep` entries plus a mark.
    async fn compact(&mut self, process_id: &str, closed: bool) -> std::io::Result<()> {
        let Some(file) = self.files.remove(process_id) else {
            return Ok(());
        };
        let OpenRecording { path, written, .. } = file;

        let (recording, _) = read_recording(&path, self.keep).await?;
        let tmp = path.with_extension("jsonl.tmp");
        let mut out = BufWriter::new(File::create(&tmp).await?);
        for entry in &recording.entries {
            let recorded = RecordedEntry {
                seq: entry.seq,
                line: entry.line.clone(),
                timestamp_ms: now_ms(),
            };
            out.write_all(serde_json::to_string(&recorded)?.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        // The rewrite is only ever clean if the cycle that triggered it closed.
        let high_water = written.max(recording.entries.last().map(|e| e.seq).unwrap_or(0));
        let mark = SeqMark { high_water, closed };
        out.write_all(serde_json::to_string(&mark)?.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&tmp, &path).await?;

        info!(
            process_id,
            kept = recording.entries.len(),
            high_water,
            "recording compacted"
        );
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        self.files.insert(
            process_id.to_string(),
            OpenRecording {
                path,
                out: BufWriter::new(file),
                written: high_water,
                lines: recording.entries.len() + 1,
            },
        );
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
