//! The hash-chained ledger.
//!
//! Every line of `ledger.jsonl` is the canonical encoding of one
//! [`LedgerEntry`]. `entry_hash` is `SHA-256(canonical(entry minus entry_hash)
//! ++ prev_hash)`, where `prev_hash` contributes its ASCII hex text.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memory_kernel_provenance_core::{
    canonical, now_utc, LedgerEntry, LedgerHead, LedgerStage, ProvenanceError, RunId,
    GENESIS_HASH, SCHEMA_VERSION,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::fsutil::{io_write_error, read_complete_lines, LogFile};

/// Everything a caller supplies for one ledger append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub stage: LedgerStage,
    pub input_hashes: Vec<String>,
    pub output_hashes: Vec<String>,
    pub annotations: BTreeMap<String, String>,
}

impl Transition {
    #[must_use]
    pub fn new(stage: LedgerStage) -> Self {
        Self {
            stage,
            input_hashes: Vec::new(),
            output_hashes: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn input(mut self, hash: impl Into<String>) -> Self {
        self.input_hashes.push(hash.into());
        self
    }

    #[must_use]
    pub fn output(mut self, hash: impl Into<String>) -> Self {
        self.output_hashes.push(hash.into());
        self
    }

    #[must_use]
    pub fn annotate(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    fn validate(&self) -> Result<(), ProvenanceError> {
        for hash in self.input_hashes.iter().chain(&self.output_hashes) {
            if !canonical::is_digest(hash) {
                return Err(ProvenanceError::Validation(format!(
                    "ledger hashes MUST be lowercase hex SHA-256 digests, got `{hash}`"
                )));
            }
        }
        Ok(())
    }
}

/// Result of [`LedgerReader::verify_chain`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub contract_version: String,
    pub ok: bool,
    pub first_bad_entry: Option<u64>,
    pub checked: u64,
    pub details: Option<String>,
    pub head: Option<LedgerHead>,
}

impl ChainReport {
    /// Converts a failed report into [`ProvenanceError::ChainBreak`].
    ///
    /// # Errors
    /// Returns the chain break when `ok` is false.
    pub fn into_result(self) -> Result<Self, ProvenanceError> {
        match self.first_bad_entry {
            Some(entry_id) if !self.ok => Err(ProvenanceError::ChainBreak {
                entry_id,
                details: self.details.unwrap_or_default(),
            }),
            _ => Ok(self),
        }
    }
}

/// Recomputes `entry_hash` from the stored fields.
///
/// # Errors
/// Returns [`ProvenanceError::Encoding`] if the entry is not canonicalizable.
pub fn compute_entry_hash(entry: &LedgerEntry) -> Result<String, ProvenanceError> {
    let mut value = canonical::to_value(entry)?;
    if let Value::Object(map) = &mut value {
        map.remove("entry_hash");
    }
    let mut bytes = canonical::encode(&value)?;
    bytes.extend_from_slice(entry.prev_hash.as_bytes());
    Ok(canonical::hash_bytes(&bytes))
}

/// Leading lines already proven to chain from genesis. Reused only while the
/// same lines still hash to `digest`.
#[derive(Debug, Default)]
struct VerifiedPrefix {
    lines: usize,
    digest: String,
    head: Option<LedgerHead>,
    hashes: HashSet<String>,
}

/// Read-only view of a ledger file. Safe to use next to a live writer: only
/// newline-terminated lines are read. Clones share the verified prefix.
#[derive(Debug, Clone)]
pub struct LedgerReader {
    path: PathBuf,
    verified: Arc<Mutex<VerifiedPrefix>>,
}

impl LedgerReader {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            verified: Arc::new(Mutex::new(VerifiedPrefix::default())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lines(&self) -> Result<Vec<String>, ProvenanceError> {
        read_complete_lines(&self.path).map_err(|err| io_write_error(&self.path, &err))
    }

    /// Parses every entry. An unreadable line is a chain break.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::ChainBreak`] for an unparseable line and
    /// [`ProvenanceError::Write`] when the file cannot be read.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, ProvenanceError> {
        self.lines()?
            .iter()
            .enumerate()
            .map(|(index, line)| parse_line(position(index), line))
            .collect()
    }

    /// # Errors
    /// Same as [`LedgerReader::entries`], limited to the requested line.
    pub fn entry(&self, entry_id: u64) -> Result<Option<LedgerEntry>, ProvenanceError> {
        let Some(index) = entry_id.checked_sub(1).and_then(|value| usize::try_from(value).ok())
        else {
            return Ok(None);
        };
        let lines = self.lines()?;
        lines
            .get(index)
            .map(|line| parse_line(entry_id, line))
            .transpose()
    }

    /// # Errors
    /// Returns [`ProvenanceError::ChainBreak`] if the last line is unreadable.
    pub fn last_entry(&self) -> Result<Option<LedgerEntry>, ProvenanceError> {
        let lines = self.lines()?;
        match lines.last() {
            Some(line) => parse_line(position(lines.len() - 1), line).map(Some),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns [`ProvenanceError::ChainBreak`] if the last line is unreadable.
    pub fn head(&self) -> Result<Option<LedgerHead>, ProvenanceError> {
        Ok(self.last_entry()?.map(|entry| LedgerHead {
            entry_id: entry.entry_id,
            entry_hash: entry.entry_hash,
        }))
    }

    /// Recomputes hashes and `prev_hash` links over `range` and reports the
    /// first entry whose stored values disagree.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] only when the file cannot be read;
    /// integrity failures are reported in the [`ChainReport`].
    pub fn verify_chain(&self, range: impl RangeBounds<u64>) -> Result<ChainReport, ProvenanceError> {
        let lines = self.lines()?;
        Ok(verify_lines(&lines, &range, None))
    }

    /// `verify_chain(1..=head)` that only re-hashes entries appended since the
    /// last successful call. The earlier lines are compared byte-for-byte
    /// through a digest, so an edit anywhere still fails the check.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the file cannot be read.
    pub fn verify_to_head(&self) -> Result<ChainReport, ProvenanceError> {
        let lines = self.lines()?;
        let mut verified = self.verified.lock();
        let reusable = verified.lines > 0
            && verified.lines <= lines.len()
            && prefix_digest(&lines[..verified.lines]) == verified.digest;
        if !reusable {
            *verified = VerifiedPrefix::default();
        }

        let report = verify_lines(&lines, &(1_u64..), verified.head.as_ref());
        if report.ok && lines.len() > verified.lines {
            for (index, line) in lines.iter().enumerate().skip(verified.lines) {
                let entry = parse_line(position(index), line)?;
                verified.hashes.insert(entry.entry_hash);
            }
            verified.lines = lines.len();
            verified.digest = prefix_digest(&lines);
            verified.head.clone_from(&report.head);
        }
        Ok(report)
    }

    /// True when `hash` is reachable by walking `prev_hash` links back from
    /// the current head.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the file cannot be read.
    pub fn is_ancestor(&self, hash: &str) -> Result<bool, ProvenanceError> {
        // On an intact chain every stored entry is an ancestor of the head.
        if self.verify_to_head()?.ok {
            return Ok(self.verified.lock().hashes.contains(hash));
        }

        let lines = self.lines()?;
        let mut links: HashMap<String, String> = HashMap::with_capacity(lines.len());
        let mut head_hash = None;
        for (index, line) in lines.iter().enumerate() {
            if let Ok(entry) = parse_line(position(index), line) {
                head_hash = Some(entry.entry_hash.clone());
                links.insert(entry.entry_hash, entry.prev_hash);
            } else {
                head_hash = None;
            }
        }

        let mut cursor = head_hash;
        let mut steps = 0_usize;
        while let Some(current) = cursor {
            if current == hash {
                return Ok(true);
            }
            if steps > lines.len() {
                break;
            }
            steps += 1;
            cursor = links.get(&current).cloned();
        }
        Ok(false)
    }
}

impl LedgerReader {
    /// Most recent readable entry with `stage`. Unreadable lines are skipped.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the file cannot be read.
    pub fn last_of_stage(&self, stage: LedgerStage) -> Result<Option<LedgerEntry>, ProvenanceError> {
        let lines = self.lines()?;
        Ok(lines
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(index, line)| parse_line(position(index), line).ok())
            .find(|entry| entry.stage == stage))
    }
}

fn prefix_digest(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn position(index: usize) -> u64 {
    u64::try_from(index).map_or(u64::MAX, |value| value + 1)
}

fn parse_line(entry_id: u64, line: &str) -> Result<LedgerEntry, ProvenanceError> {
    serde_json::from_str::<LedgerEntry>(line).map_err(|err| ProvenanceError::ChainBreak {
        entry_id,
        details: format!("unreadable ledger entry: {err}"),
    })
}

/// `resume` is the head of a prefix already known to be intact; lines up to it
/// count as checked without being re-hashed.
fn verify_lines(
    lines: &[String],
    range: &impl RangeBounds<u64>,
    resume: Option<&LedgerHead>,
) -> ChainReport {
    let start = match range.start_bound() {
        Bound::Included(value) => (*value).max(1),
        Bound::Excluded(value) => value.saturating_add(1).max(1),
        Bound::Unbounded => 1,
    };
    let end = match range.end_bound() {
        Bound::Included(value) => *value,
        Bound::Excluded(value) => value.saturating_sub(1),
        Bound::Unbounded => u64::MAX,
    };

    let mut checked = 0_u64;
    let mut prev_stored: Option<String> = resume.map(|head| head.entry_hash.clone());
    let mut head = resume.cloned();
    let mut failure: Option<(u64, String)> = None;
    let skip = resume.map_or(0, |head| head.entry_id);

    for (index, line) in lines.iter().enumerate() {
        let entry_id = position(index);
        if entry_id > end {
            break;
        }
        if entry_id <= skip {
            if entry_id >= start {
                checked += 1;
            }
            continue;
        }
        let parsed = parse_line(entry_id, line);

        if entry_id >= start {
            checked += 1;
            if let Some(reason) = check_entry(entry_id, parsed.as_ref(), prev_stored.as_deref()) {
                failure = Some((entry_id, reason));
                break;
            }
        }

        match parsed {
            Ok(entry) => {
                head = Some(LedgerHead {
                    entry_id: entry.entry_id,
                    entry_hash: entry.entry_hash.clone(),
                });
                prev_stored = Some(entry.entry_hash);
            }
            Err(_) => prev_stored = None,
        }
    }

    if let Some((entry_id, reason)) = &failure {
        tracing::error!(entry_id, reason = %reason, "ledger chain verification failed");
    }

    ChainReport {
        contract_version: "chain_report.v1".to_string(),
        ok: failure.is_none(),
        first_bad_entry: failure.as_ref().map(|(entry_id, _)| *entry_id),
        checked,
        details: failure.map(|(_, reason)| reason),
        head,
    }
}

fn check_entry(
    entry_id: u64,
    parsed: Result<&LedgerEntry, &ProvenanceError>,
    prev_stored: Option<&str>,
) -> Option<String> {
    let entry = match parsed {
        Ok(entry) => entry,
        Err(err) => return Some(err.to_string()),
    };

    if entry.entry_id != entry_id {
        return Some(format!(
            "entry_id {} stored at position {entry_id}",
            entry.entry_id
        ));
    }

    let expected_prev = if entry_id == 1 {
        GENESIS_HASH
    } else {
        match prev_stored {
            Some(value) => value,
            None => return Some("previous entry is unreadable".to_string()),
        }
    };
    if entry.prev_hash != expected_prev {
        return Some("prev_hash does not link to the previous entry".to_string());
    }

    match compute_entry_hash(entry) {
        Ok(recomputed) if recomputed == entry.entry_hash => None,
        Ok(_) => Some("entry_hash does not match recomputed hash".to_string()),
        Err(err) => Some(format!("entry cannot be re-encoded: {err}")),
    }
}

struct LedgerState {
    log: LogFile,
    head: Option<LedgerHead>,
}

/// Sole writer of the ledger. One global lock orders every append, so the
/// chain never branches.
pub struct LedgerWriter {
    run_id: RunId,
    policy_hash: String,
    reader: LedgerReader,
    state: Mutex<LedgerState>,
}

impl LedgerWriter {
    /// Opens the ledger and recovers the head from the last complete line.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::ChainBreak`] when the last line is
    /// unreadable, [`ProvenanceError::Validation`] for a malformed
    /// `policy_hash`, and [`ProvenanceError::Write`] on I/O failure.
    pub fn open(path: &Path, run_id: RunId, policy_hash: &str) -> Result<Self, ProvenanceError> {
        if !canonical::is_digest(policy_hash) {
            return Err(ProvenanceError::Validation(
                "policy_hash MUST be a lowercase hex SHA-256 digest".to_string(),
            ));
        }

        let (log, lines) = LogFile::open(path)?;
        let head = match lines.last() {
            Some(line) => {
                let entry = parse_line(position(lines.len() - 1), line)?;
                Some(LedgerHead {
                    entry_id: entry.entry_id,
                    entry_hash: entry.entry_hash,
                })
            }
            None => None,
        };

        Ok(Self {
            run_id,
            policy_hash: policy_hash.to_string(),
            reader: LedgerReader::new(path),
            state: Mutex::new(LedgerState { log, head }),
        })
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    #[must_use]
    pub fn reader(&self) -> &LedgerReader {
        &self.reader
    }

    /// Head as confirmed on disk by this writer.
    #[must_use]
    pub fn head(&self) -> Option<LedgerHead> {
        self.state.lock().head.clone()
    }

    /// Appends one chained entry and returns after it is synced. The
    /// in-memory head moves only after the sync succeeds.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for malformed hashes and
    /// [`ProvenanceError::Write`] when the durable write fails; the head is
    /// unchanged in both cases.
    pub fn append(&self, transition: Transition) -> Result<LedgerEntry, ProvenanceError> {
        transition.validate()?;

        let mut state = self.state.lock();
        let (entry_id, prev_hash) = match &state.head {
            Some(head) => (head.entry_id + 1, head.entry_hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };

        let mut entry = LedgerEntry {
            entry_id,
            run_id: self.run_id,
            ts_utc: now_utc(),
            stage: transition.stage,
            input_hashes: transition.input_hashes,
            output_hashes: transition.output_hashes,
            policy_hash: self.policy_hash.clone(),
            annotations: transition.annotations,
            prev_hash,
            entry_hash: String::new(),
            schema_version: SCHEMA_VERSION,
        };
        entry.entry_hash = compute_entry_hash(&entry)?;
        let line = canonical::encode_to_string(&canonical::to_value(&entry)?)?;

        state.log.append_line(&line, true)?;
        state.head = Some(LedgerHead {
            entry_id,
            entry_hash: entry.entry_hash.clone(),
        });

        tracing::debug!(
            entry_id,
            stage = entry.stage.as_str(),
            path = %state.log.path().display(),
            "ledger entry appended"
        );
        Ok(entry)
    }

    /// # Errors
    /// See [`LedgerReader::verify_chain`].
    pub fn verify_chain(&self, range: impl RangeBounds<u64>) -> Result<ChainReport, ProvenanceError> {
        self.reader.verify_chain(range)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn policy_hash() -> String {
        canonical::hash_bytes(b"policy")
    }

    fn open_writer(path: &Path) -> LedgerWriter {
        must_ok(LedgerWriter::open(path, RunId::new(), &policy_hash()))
    }

    fn capture(n: u64) -> Transition {
        Transition::new(LedgerStage::CaptureCommitted)
            .input(canonical::hash_bytes(&n.to_le_bytes()))
            .output(canonical::hash_bytes(format!("record-{n}").as_bytes()))
            .annotate("record_id", format!("ev-{n}"))
    }

    #[test]
    fn first_entry_links_to_genesis_and_later_entries_chain() {
        let dir = must_ok(tempfile::tempdir());
        let ledger = open_writer(&dir.path().join("ledger.jsonl"));

        let first = must_ok(ledger.append(capture(1)));
        let second = must_ok(ledger.append(capture(2)));

        assert_eq!(first.entry_id, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.entry_hash);
        assert_eq!(must_ok(compute_entry_hash(&second)), second.entry_hash);
        assert_eq!(
            ledger.head(),
            Some(LedgerHead {
                entry_id: 2,
                entry_hash: second.entry_hash.clone()
            })
        );
        assert_eq!(must_ok(ledger.reader().head()), ledger.head());
    }

    #[test]
    fn head_and_chain_continue_across_reopen() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("ledger.jsonl");
        let last = {
            let ledger = open_writer(&path);
            must_ok(ledger.append(capture(1)));
            must_ok(ledger.append(capture(2)))
        };

        let reopened = open_writer(&path);
        let next = must_ok(reopened.append(capture(3)));
        assert_eq!(next.entry_id, 3);
        assert_eq!(next.prev_hash, last.entry_hash);
        assert_ne!(next.run_id, last.run_id);
        assert!(must_ok(reopened.verify_chain(..)).ok);
    }

    #[test]
    fn malformed_hashes_are_rejected_without_moving_head() {
        let dir = must_ok(tempfile::tempdir());
        let ledger = open_writer(&dir.path().join("ledger.jsonl"));
        let result = ledger.append(Transition::new(LedgerStage::QueryExecuted).output("nope"));
        assert!(matches!(result, Err(ProvenanceError::Validation(_))));
        assert!(ledger.head().is_none());
    }

    #[test]
    fn tampered_payload_is_first_bad_entry() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("ledger.jsonl");
        let ledger = open_writer(&path);
        for n in 1..=5 {
            must_ok(ledger.append(capture(n)));
        }

        let raw = must_ok(std::fs::read_to_string(&path));
        let tampered = raw.replacen("\"record_id\":\"ev-2\"", "\"record_id\":\"ev-X\"", 1);
        assert_ne!(raw, tampered);
        must_ok(std::fs::write(&path, tampered));

        let report = must_ok(ledger.verify_chain(..));
        assert!(!report.ok);
        assert_eq!(report.first_bad_entry, Some(2));
        assert_eq!(report.checked, 2);
        assert!(matches!(
            report.into_result(),
            Err(ProvenanceError::ChainBreak { entry_id: 2, .. })
        ));

        let tail = must_ok(ledger.verify_chain(3..=5));
        assert!(tail.ok);
    }

    #[test]
    fn rewritten_hash_breaks_the_next_link() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("ledger.jsonl");
        let ledger = open_writer(&path);
        for n in 1..=3 {
            must_ok(ledger.append(capture(n)));
        }

        let mut entries = must_ok(ledger.reader().entries());
        entries[0].annotations.insert("record_id".to_string(), "forged".to_string());
        entries[0].entry_hash = must_ok(compute_entry_hash(&entries[0]));
        let rewritten: Vec<String> = entries
            .iter()
            .map(|entry| must_ok(canonical::encode_to_string(&must_ok(canonical::to_value(entry)))))
            .collect();
        must_ok(std::fs::write(&path, format!("{}\n", rewritten.join("\n"))));

        let report = must_ok(ledger.verify_chain(..));
        assert_eq!(report.first_bad_entry, Some(2));
        let old_head = must_some(ledger.head());
        assert!(must_ok(ledger.reader().is_ancestor(&old_head.entry_hash)));
        assert!(!must_ok(ledger.reader().is_ancestor(&canonical::hash_bytes(b"elsewhere"))));
    }

    #[test]
    fn ancestry_follows_prev_links() {
        let dir = must_ok(tempfile::tempdir());
        let ledger = open_writer(&dir.path().join("ledger.jsonl"));
        let first = must_ok(ledger.append(capture(1)));
        must_ok(ledger.append(capture(2)));
        assert!(must_ok(ledger.reader().is_ancestor(&first.entry_hash)));
        assert_eq!(
            must_some(must_ok(ledger.reader().entry(1))).entry_hash,
            first.entry_hash
        );
        assert!(must_ok(ledger.reader().entry(0)).is_none());
        assert!(must_ok(ledger.reader().entry(9)).is_none());
    }

    #[test]
    fn verify_to_head_extends_the_prefix_and_still_sees_edits() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("ledger.jsonl");
        let ledger = open_writer(&path);
        for n in 1..=3 {
            must_ok(ledger.append(capture(n)));
        }
        let first = must_ok(ledger.reader().verify_to_head());
        assert!(first.ok);
        assert_eq!(first.checked, 3);

        let fourth = must_ok(ledger.append(capture(4)));
        let extended = must_ok(ledger.reader().verify_to_head());
        assert_eq!(extended.checked, 4);
        assert_eq!(extended.head.map(|head| head.entry_hash), Some(fourth.entry_hash.clone()));
        assert!(must_ok(ledger.reader().is_ancestor(&fourth.entry_hash)));

        let raw = must_ok(std::fs::read_to_string(&path));
        must_ok(std::fs::write(
            &path,
            raw.replacen("\"record_id\":\"ev-1\"", "\"record_id\":\"ev-X\"", 1),
        ));
        let report = must_ok(ledger.reader().verify_to_head());
        assert!(!report.ok);
        assert_eq!(report.first_bad_entry, Some(1));
        assert_eq!(report, must_ok(ledger.verify_chain(..)));
    }

    #[test]
    fn last_of_stage_finds_the_newest_match() {
        let dir = must_ok(tempfile::tempdir());
        let ledger = open_writer(&dir.path().join("ledger.jsonl"));
        must_ok(ledger.append(Transition::new(LedgerStage::SystemStart).annotate("n", "1")));
        must_ok(ledger.append(capture(1)));
        let second = must_ok(ledger.append(Transition::new(LedgerStage::SystemStart).annotate("n", "2")));
        must_ok(ledger.append(capture(2)));

        let found = must_some(must_ok(ledger.reader().last_of_stage(LedgerStage::SystemStart)));
        assert_eq!(found, second);
        assert!(must_ok(ledger.reader().last_of_stage(LedgerStage::SystemStop)).is_none());
    }

    #[test]
    fn unreadable_last_line_blocks_open() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = open_writer(&path);
            must_ok(ledger.append(capture(1)));
        }
        let mut raw = must_ok(std::fs::read_to_string(&path));
        raw.push_str("garbage\n");
        must_ok(std::fs::write(&path, raw));

        assert!(matches!(
            LedgerWriter::open(&path, RunId::new(), &policy_hash()),
            Err(ProvenanceError::ChainBreak { entry_id: 2, .. })
        ));
    }

    #[test]
    fn concurrent_appends_form_one_chain() {
        let dir = must_ok(tempfile::tempdir());
        let ledger = Arc::new(open_writer(&dir.path().join("ledger.jsonl")));
        let handles: Vec<_> = (0..4_u64)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for n in 0..10 {
                        must_ok(ledger.append(capture(worker * 100 + n)));
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                panic!("appender thread panicked");
            }
        }

        let report = must_ok(ledger.verify_chain(..));
        assert!(report.ok);
        assert_eq!(report.checked, 40);
        assert_eq!(must_some(report.head).entry_id, 40);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn any_single_tamper_is_located(count in 1_u64..12, victim_seed in any::<u64>()) {
            let dir = must_ok(tempfile::tempdir());
            let path = dir.path().join("ledger.jsonl");
            let ledger = open_writer(&path);
            for n in 1..=count {
                must_ok(ledger.append(capture(n)));
            }
            prop_assert!(must_ok(ledger.verify_chain(..)).ok);

            let victim = victim_seed % count + 1;
            let raw = must_ok(std::fs::read_to_string(&path));
            let needle = format!("\"record_id\":\"ev-{victim}\"");
            let tampered = raw.replacen(&needle, "\"record_id\":\"ev-tampered\"", 1);
            must_ok(std::fs::write(&path, tampered));

            let report = must_ok(ledger.verify_chain(..));
            prop_assert!(!report.ok);
            prop_assert_eq!(report.first_bad_entry, Some(victim));
        }
    }
}
