//! Per-stream sequenced operational journal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use memory_kernel_provenance_core::{
    canonical, now_utc, DurabilityTier, JournalEntry, JournalKind, JournalPolicy, ProvenanceError,
    RunId, SCHEMA_VERSION,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::fsutil::{io_write_error, read_complete_lines, LogFile};

/// Stream that declares sequence gaps found while reopening the journal.
pub const JOURNAL_RECOVERY_STREAM: &str = "journal.recovery";

struct JournalState {
    log: LogFile,
    next_sequence: HashMap<String, u64>,
    unsynced: u32,
    last_sync: Instant,
}

impl JournalState {
    fn sync(&mut self) -> Result<(), ProvenanceError> {
        self.log.sync()?;
        self.unsynced = 0;
        self.last_sync = Instant::now();
        Ok(())
    }
}

/// Single writer for `journal.jsonl`. Appends from every producer serialize
/// through one lock, so the file order is the global append order.
pub struct JournalWriter {
    path: PathBuf,
    run_id: RunId,
    policy: JournalPolicy,
    state: Mutex<JournalState>,
}

impl JournalWriter {
    /// Opens the journal and recovers the last sequence of every stream.
    ///
    /// A complete but unreadable line may have held any stream's last
    /// sequence. When its stream cannot be recovered, every known stream skips
    /// one sequence number so none is reused, and the gap is declared on
    /// [`JOURNAL_RECOVERY_STREAM`].
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the file cannot be opened, a
    /// torn tail cannot be repaired, or the gap cannot be declared.
    pub fn open(path: &Path, run_id: RunId, policy: JournalPolicy) -> Result<Self, ProvenanceError> {
        let (log, lines) = LogFile::open(path)?;

        let mut next_sequence: HashMap<String, u64> = HashMap::new();
        let mut unreadable = Vec::new();
        let mut unplaced = false;
        for (index, line) in lines.iter().enumerate() {
            let position = match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => Some((entry.stream_id, entry.sequence)),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %err,
                        "unreadable journal line"
                    );
                    unreadable.push(index + 1);
                    let position = stream_position(line);
                    unplaced |= position.is_none();
                    position
                }
            };
            if let Some((stream_id, sequence)) = position {
                let next = next_sequence.entry(stream_id).or_insert(1);
                *next = (*next).max(sequence.saturating_add(1));
            }
        }
        if unplaced {
            for next in next_sequence.values_mut() {
                *next += 1;
            }
        }

        let writer = Self {
            path: path.to_path_buf(),
            run_id,
            policy,
            state: Mutex::new(JournalState {
                log,
                next_sequence,
                unsynced: 0,
                last_sync: Instant::now(),
            }),
        };
        if !unreadable.is_empty() {
            writer.append(
                JOURNAL_RECOVERY_STREAM,
                JournalKind::Diagnostic,
                json!({
                    "unreadable_lines": unreadable,
                    "sequences_skipped": unplaced,
                }),
            )?;
            writer.flush()?;
        }
        Ok(writer)
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry with the next sequence number of `stream_id`.
    ///
    /// The payload is canonicalized before anything is written, so an
    /// [`ProvenanceError::Encoding`] never consumes a sequence number.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for a blank stream id,
    /// [`ProvenanceError::Encoding`] for a non-canonical payload, and
    /// [`ProvenanceError::Write`] when the append or its flush fails.
    pub fn append(
        &self,
        stream_id: &str,
        kind: JournalKind,
        payload: Value,
    ) -> Result<JournalEntry, ProvenanceError> {
        if stream_id.trim().is_empty() || stream_id.trim() != stream_id {
            return Err(ProvenanceError::Validation(
                "stream_id MUST be a non-blank name without surrounding whitespace".to_string(),
            ));
        }
        let tier = self.policy.tier_for(stream_id);

        let mut state = self.state.lock();
        let sequence = state.next_sequence.get(stream_id).copied().unwrap_or(1);
        let entry = JournalEntry {
            stream_id: stream_id.to_string(),
            sequence,
            ts_utc: now_utc(),
            kind,
            payload,
            run_id: self.run_id,
            schema_version: SCHEMA_VERSION,
        };
        let line = canonical::encode_to_string(&canonical::to_value(&entry)?)?;

        state
            .log
            .append_line(&line, tier == DurabilityTier::Critical)?;
        state.next_sequence.insert(entry.stream_id.clone(), sequence + 1);

        match tier {
            DurabilityTier::Critical => {
                state.unsynced = 0;
                state.last_sync = Instant::now();
            }
            DurabilityTier::Bulk => {
                state.unsynced += 1;
                if state.unsynced >= self.policy.bulk_fsync_max_entries
                    || state.last_sync.elapsed() >= self.policy.bulk_interval()
                {
                    state.sync()?;
                }
            }
        }

        Ok(entry)
    }

    /// Forces pending bulk entries to disk.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when `sync_data` fails.
    pub fn flush(&self) -> Result<(), ProvenanceError> {
        let mut state = self.state.lock();
        if state.unsynced == 0 {
            return Ok(());
        }
        state.sync()
    }

    /// Syncs when the bulk interval has elapsed. Meant for a host timer so a
    /// quiet bulk stream does not sit unsynced until the next append.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when `sync_data` fails.
    pub fn flush_if_due(&self) -> Result<bool, ProvenanceError> {
        let mut state = self.state.lock();
        if state.unsynced == 0 || state.last_sync.elapsed() < self.policy.bulk_interval() {
            return Ok(false);
        }
        state.sync()?;
        Ok(true)
    }

    #[must_use]
    pub fn unsynced_entries(&self) -> u32 {
        self.state.lock().unsynced
    }

    /// Next sequence number `stream_id` would receive.
    #[must_use]
    pub fn next_sequence(&self, stream_id: &str) -> u64 {
        self.state
            .lock()
            .next_sequence
            .get(stream_id)
            .copied()
            .unwrap_or(1)
    }

    /// All readable entries in file order.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the file cannot be read.
    pub fn read_entries(&self) -> Result<Vec<JournalEntry>, ProvenanceError> {
        let _guard = self.state.lock();
        read_journal(&self.path)
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(path = %self.path.display(), error = %err, "journal flush on drop failed");
        }
    }
}

/// Stream and sequence of a line that is JSON but not a valid entry.
fn stream_position(line: &str) -> Option<(String, u64)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let stream_id = value.get("stream_id")?.as_str()?;
    let sequence = value.get("sequence")?.as_u64()?;
    Some((stream_id.to_string(), sequence))
}

/// Reads a journal file without opening it for writing.
///
/// # Errors
/// Returns [`ProvenanceError::Write`] when the file cannot be read.
pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, ProvenanceError> {
    let lines = read_complete_lines(path).map_err(|err| io_write_error(path, &err))?;
    let mut entries = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping unreadable journal line"
            ),
        }
    }
    Ok(entries)
}
