//! Immutable evidence and derived-artifact store.
//!
//! Metadata and the derivation graph live in SQLite; raw payloads live in a
//! content-addressed media area next to it. A record becomes visible only
//! after its ledger entry is durable, and every write is bracketed by seal
//! markers on the [`SEAL_STREAM`] journal stream so an interrupted write can
//! be reconciled at the next start.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memory_kernel_provenance_core::{
    canonical, format_rfc3339, now_utc, parse_rfc3339_utc, utc_timestamp, DerivationEdge,
    DerivedRecord, EvidenceRecord, EvidenceType, JournalEntry, JournalKind, LedgerEntry,
    LedgerStage, ProvenanceError, QuarantineReason, RecordReceipt, RelationType, RunId, SpanRef,
    StagedRecord, SEAL_STREAM,
};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::fsutil::{io_write_error, write_atomic, StorageContext};
use crate::journal::JournalWriter;
use crate::ledger::{LedgerWriter, Transition};

const EVIDENCE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_EVIDENCE_V1: &str = r"
CREATE TABLE IF NOT EXISTS evidence_records (
  evidence_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  evidence_type TEXT NOT NULL,
  ts_start_utc TEXT NOT NULL,
  ts_end_utc TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  locator TEXT NOT NULL,
  schema_version INTEGER NOT NULL,
  record_hash TEXT NOT NULL,
  payload_len INTEGER NOT NULL,
  ledger_entry_id INTEGER NOT NULL,
  committed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS derived_records (
  derived_id TEXT PRIMARY KEY,
  parent_evidence_id TEXT NOT NULL,
  span_ref_json TEXT NOT NULL,
  method TEXT NOT NULL,
  producer_identity TEXT NOT NULL,
  parameters_json TEXT NOT NULL,
  content_hash TEXT NOT NULL,
  schema_version INTEGER NOT NULL,
  record_hash TEXT NOT NULL,
  payload_len INTEGER NOT NULL,
  ledger_entry_id INTEGER NOT NULL,
  committed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS derivation_edges (
  edge_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id TEXT NOT NULL,
  child_id TEXT NOT NULL REFERENCES derived_records(derived_id),
  relation_type TEXT NOT NULL,
  span_ref_json TEXT NOT NULL,
  ledger_entry_id INTEGER NOT NULL,
  UNIQUE(parent_id, child_id, relation_type)
);

CREATE TABLE IF NOT EXISTS quarantined_records (
  quarantine_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL,
  record_kind TEXT NOT NULL,
  record_hash TEXT NOT NULL,
  reason TEXT NOT NULL,
  staged_json TEXT NOT NULL,
  ledger_entry_id INTEGER NOT NULL,
  quarantined_at TEXT NOT NULL,
  UNIQUE(record_id, record_hash)
);

CREATE TABLE IF NOT EXISTS replaceable_entries (
  namespace TEXT NOT NULL,
  entry_key TEXT NOT NULL,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY(namespace, entry_key)
);

CREATE TRIGGER IF NOT EXISTS trg_evidence_records_no_update
BEFORE UPDATE ON evidence_records
BEGIN
  SELECT RAISE(FAIL, 'evidence_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_evidence_records_no_delete
BEFORE DELETE ON evidence_records
BEGIN
  SELECT RAISE(FAIL, 'evidence_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_derived_records_no_update
BEFORE UPDATE ON derived_records
BEGIN
  SELECT RAISE(FAIL, 'derived_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_derived_records_no_delete
BEFORE DELETE ON derived_records
BEGIN
  SELECT RAISE(FAIL, 'derived_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_derivation_edges_no_update
BEFORE UPDATE ON derivation_edges
BEGIN
  SELECT RAISE(FAIL, 'derivation_edges is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_derivation_edges_no_delete
BEFORE DELETE ON derivation_edges
BEGIN
  SELECT RAISE(FAIL, 'derivation_edges is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_quarantined_records_no_update
BEFORE UPDATE ON quarantined_records
BEGIN
  SELECT RAISE(FAIL, 'quarantined_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_quarantined_records_no_delete
BEFORE DELETE ON quarantined_records
BEGIN
  SELECT RAISE(FAIL, 'quarantined_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_derivation_edges_parent
  ON derivation_edges(parent_id);
CREATE INDEX IF NOT EXISTS idx_derivation_edges_child
  ON derivation_edges(child_id);
CREATE INDEX IF NOT EXISTS idx_quarantined_records_id
  ON quarantined_records(record_id);
";

const EVIDENCE_COLUMNS: &str = "evidence_id, run_id, evidence_type, ts_start_utc, ts_end_utc, \
     content_hash, locator, schema_version, record_hash, payload_len, ledger_entry_id, committed_at";

const DERIVED_COLUMNS: &str = "derived_id, parent_evidence_id, span_ref_json, method, \
     producer_identity, parameters_json, content_hash, schema_version, record_hash, payload_len, \
     ledger_entry_id, committed_at";

const QUARANTINE_COLUMNS: &str =
    "record_id, record_kind, record_hash, reason, ledger_entry_id, quarantined_at";

/// A committed record of either kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "record_kind", rename_all = "snake_case")]
pub enum RecordBody {
    Evidence(EvidenceRecord),
    Derived(DerivedRecord),
}

impl RecordBody {
    #[must_use]
    pub fn record_id(&self) -> &str {
        match self {
            Self::Evidence(record) => &record.evidence_id,
            Self::Derived(record) => &record.derived_id,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        match self {
            Self::Evidence(record) => &record.content_hash,
            Self::Derived(record) => &record.content_hash,
        }
    }

    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the record is not canonicalizable.
    pub fn record_hash(&self) -> Result<String, ProvenanceError> {
        match self {
            Self::Evidence(record) => record.record_hash(),
            Self::Derived(record) => record.record_hash(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: RecordBody,
    pub record_hash: String,
    pub payload_len: u64,
    pub ledger_entry_id: u64,
    #[serde(with = "utc_timestamp")]
    pub committed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuarantinedRecord {
    pub record_id: String,
    pub record_kind: String,
    pub record_hash: String,
    pub reason: QuarantineReason,
    pub ledger_entry_id: u64,
    #[serde(with = "utc_timestamp")]
    pub quarantined_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub evidence: u64,
    pub derived: u64,
    pub edges: u64,
    pub quarantined: u64,
}

/// Payload of every marker on the seal stream. Which optional fields are
/// present depends on the marker kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealMarker {
    pub record_id: String,
    pub record_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_entry_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SealMarker {
    #[must_use]
    pub fn new(record_id: &str, record_hash: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
            record_hash: record_hash.to_string(),
            staged: None,
            content_hash: None,
            payload_len: None,
            ledger_entry_id: None,
            reason: None,
        }
    }

    /// Marker announcing a staged record, carrying the full record so
    /// recovery can replay it.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the record is not canonicalizable.
    pub fn staged(staged: &StagedRecord, record_hash: &str) -> Result<Self, ProvenanceError> {
        let mut marker = Self::new(staged.record_id(), record_hash);
        marker.staged = Some(canonical::to_value(staged)?);
        Ok(marker)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Validation`] when the journal payload is not a
    /// seal marker.
    pub fn from_entry(entry: &JournalEntry) -> Result<Self, ProvenanceError> {
        serde_json::from_value(entry.payload.clone()).map_err(|err| {
            ProvenanceError::Validation(format!(
                "journal entry {}#{} is not a seal marker: {err}",
                entry.stream_id, entry.sequence
            ))
        })
    }

    /// # Errors
    /// Returns [`ProvenanceError::Validation`] when the marker carries no
    /// readable record.
    pub fn staged_record(&self) -> Result<StagedRecord, ProvenanceError> {
        let value = self.staged.clone().ok_or_else(|| {
            ProvenanceError::Validation(format!("marker for {} carries no record", self.record_id))
        })?;
        serde_json::from_value(value).map_err(|err| {
            ProvenanceError::Validation(format!(
                "staged record {} is unreadable: {err}",
                self.record_id
            ))
        })
    }

    /// `record_kind` of the carried record, read without parsing the rest.
    #[must_use]
    pub fn record_kind(&self) -> &str {
        self.staged
            .as_ref()
            .and_then(|value| value.get("record_kind"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    fn with_content(mut self, content_hash: &str, payload_len: u64) -> Self {
        self.content_hash = Some(content_hash.to_string());
        self.payload_len = Some(payload_len);
        self
    }

    pub(crate) fn with_ledger_entry(mut self, ledger_entry_id: u64) -> Self {
        self.ledger_entry_id = Some(ledger_entry_id);
        self
    }

    pub(crate) fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Read access shared by the live store and the read-only catalog.
pub trait RecordSource {
    /// Committed record by id. Quarantined records are never returned.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    fn lookup(&self, record_id: &str) -> Result<Option<StoredRecord>, ProvenanceError>;

    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for a malformed hash and
    /// [`ProvenanceError::Write`] when the media file cannot be read.
    fn load_payload(&self, content_hash: &str) -> Result<Option<Vec<u8>>, ProvenanceError>;
}

pub(crate) struct CommitFailure {
    pub(crate) error: ProvenanceError,
    pub(crate) ledger_appended: bool,
}

pub struct EvidenceStore {
    conn: Mutex<Connection>,
    media_dir: PathBuf,
    journal: Arc<JournalWriter>,
    ledger: Arc<LedgerWriter>,
}

impl EvidenceStore {
    /// Opens the metadata database, applies the schema, and binds the store to
    /// the journal and ledger writers it commits through.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] when SQLite cannot be opened or
    /// migrated and [`ProvenanceError::Write`] when directories cannot be created.
    pub fn open(
        db_path: &Path,
        media_dir: &Path,
        journal: Arc<JournalWriter>,
        ledger: Arc<LedgerWriter>,
    ) -> Result<Self, ProvenanceError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_write_error(parent, &err))?;
        }
        fs::create_dir_all(media_dir).map_err(|err| io_write_error(media_dir, &err))?;

        let conn = Connection::open(db_path).storage(&format!(
            "failed to open sqlite database at {}",
            db_path.display()
        ))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .storage("failed to configure sqlite pragmas")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            media_dir: media_dir.to_path_buf(),
            journal,
            ledger,
        })
    }

    /// Admits one evidence record and its payload.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for malformed records or a
    /// payload that does not hash to `content_hash`,
    /// [`ProvenanceError::ImmutabilityViolation`] for a known id, and
    /// [`ProvenanceError::Write`] or [`ProvenanceError::Storage`] when a
    /// durable step fails.
    pub fn put_evidence(
        &self,
        record: &EvidenceRecord,
        payload: &[u8],
    ) -> Result<RecordReceipt, ProvenanceError> {
        record.validate()?;
        self.put_staged(
            &StagedRecord::Evidence {
                record: record.clone(),
            },
            payload,
        )
    }

    /// Admits a derived record with its lineage edges. Without an explicit
    /// edge from `parent_evidence_id`, the implied `derived_from` edge is added.
    ///
    /// # Errors
    /// As [`EvidenceStore::put_evidence`], plus
    /// [`ProvenanceError::DanglingParent`] and [`ProvenanceError::CycleDetected`].
    pub fn put_derived(
        &self,
        record: &DerivedRecord,
        edges: &[DerivationEdge],
        payload: &[u8],
    ) -> Result<RecordReceipt, ProvenanceError> {
        record.validate()?;
        let edges = normalize_edges(record, edges)?;
        self.put_staged(
            &StagedRecord::Derived {
                record: record.clone(),
                edges,
            },
            payload,
        )
    }

    fn put_staged(
        &self,
        staged: &StagedRecord,
        payload: &[u8],
    ) -> Result<RecordReceipt, ProvenanceError> {
        let content_hash = canonical::hash_bytes(payload);
        if content_hash != staged.content_hash() {
            return Err(ProvenanceError::Validation(format!(
                "content_hash MUST equal the SHA-256 of the payload (computed {content_hash})"
            )));
        }
        let record_hash = staged.record_hash()?;
        let payload_len = u64::try_from(payload.len())
            .map_err(|_| ProvenanceError::Validation("payload too large".to_string()))?;

        {
            let conn = self.conn.lock();
            check_admission(&conn, staged)?;
        }

        self.mark(
            JournalKind::RecordStaged,
            &SealMarker::staged(staged, &record_hash)?,
        )?;

        let media = self.write_media(&content_hash, payload).and_then(|_| {
            self.mark(
                JournalKind::MediaStaged,
                &SealMarker::new(staged.record_id(), &record_hash)
                    .with_content(&content_hash, payload_len),
            )
        });
        if let Err(err) = media {
            self.abort(staged.record_id(), &record_hash, &err);
            return Err(err);
        }

        let stage = match staged {
            StagedRecord::Evidence { .. } => LedgerStage::CaptureCommitted,
            StagedRecord::Derived { .. } => LedgerStage::ArtifactDerived,
        };
        let entry = match self.commit_staged(staged, &record_hash, payload_len, stage) {
            Ok(entry) => entry,
            Err(failure) => {
                if failure.ledger_appended {
                    tracing::warn!(
                        record_id = %staged.record_id(),
                        error = %failure.error,
                        "ledger entry written but row insert failed; left staged for recovery"
                    );
                } else {
                    self.abort(staged.record_id(), &record_hash, &failure.error);
                }
                return Err(failure.error);
            }
        };

        let committed =
            SealMarker::new(staged.record_id(), &record_hash).with_ledger_entry(entry.entry_id);
        if let Err(err) = self.mark(JournalKind::RecordCommitted, &committed) {
            tracing::warn!(
                record_id = %staged.record_id(),
                error = %err,
                "commit marker not written; recovery will heal it"
            );
        }

        Ok(RecordReceipt {
            record_id: staged.record_id().to_string(),
            content_hash,
            record_hash,
            ledger_entry_id: entry.entry_id,
        })
    }

    /// Re-checks admission, then appends the ledger entry and inserts the rows
    /// in one transaction. The transaction is rolled back on any failure.
    pub(crate) fn commit_staged(
        &self,
        staged: &StagedRecord,
        record_hash: &str,
        payload_len: u64,
        stage: LedgerStage,
    ) -> Result<LedgerEntry, CommitFailure> {
        let before = |error| CommitFailure {
            error,
            ledger_appended: false,
        };
        let after = |error| CommitFailure {
            error,
            ledger_appended: true,
        };

        let mut conn = self.conn.lock();
        check_admission(&conn, staged).map_err(before)?;
        let transition = transition_for(&conn, staged, record_hash, stage).map_err(before)?;

        let tx = conn
            .transaction()
            .storage("failed to begin commit transaction")
            .map_err(before)?;
        let entry = self.ledger.append(transition).map_err(before)?;
        insert_staged(&tx, staged, record_hash, payload_len, entry.entry_id).map_err(after)?;
        tx.commit().storage("failed to commit record").map_err(after)?;

        tracing::debug!(
            record_id = %staged.record_id(),
            entry_id = entry.entry_id,
            stage = entry.stage.as_str(),
            "record committed"
        );
        Ok(entry)
    }

    /// Moves a staged record into quarantine with its ledger entry.
    pub(crate) fn quarantine(
        &self,
        marker: &SealMarker,
        reason: QuarantineReason,
    ) -> Result<LedgerEntry, ProvenanceError> {
        let mut transition = Transition::new(LedgerStage::RecoveryQuarantined)
            .annotate("record_id", marker.record_id.clone())
            .annotate("record_kind", marker.record_kind())
            .annotate("reason", reason.as_str());
        if canonical::is_digest(&marker.record_hash) {
            transition = transition.input(marker.record_hash.clone());
        }
        let staged_json = match &marker.staged {
            Some(value) => serde_json::to_string(value)
                .map_err(|err| ProvenanceError::Validation(err.to_string()))?,
            None => "null".to_string(),
        };

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .storage("failed to begin quarantine transaction")?;
        let entry = self.ledger.append(transition)?;
        tx.execute(
            "INSERT INTO quarantined_records(
                record_id, record_kind, record_hash, reason, staged_json, ledger_entry_id, quarantined_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                marker.record_id,
                marker.record_kind(),
                marker.record_hash,
                reason.as_str(),
                staged_json,
                sql_int(entry.entry_id)?,
                format_rfc3339(now_utc())?,
            ],
        )
        .storage("failed to insert quarantined record")?;
        tx.commit().storage("failed to commit quarantine")?;

        tracing::warn!(
            record_id = %marker.record_id,
            reason = reason.as_str(),
            entry_id = entry.entry_id,
            "record quarantined"
        );
        Ok(entry)
    }

    /// Journals a marker on the seal stream.
    pub(crate) fn mark(
        &self,
        kind: JournalKind,
        marker: &SealMarker,
    ) -> Result<JournalEntry, ProvenanceError> {
        self.journal
            .append(SEAL_STREAM, kind, canonical::to_value(marker)?)
    }

    fn abort(&self, record_id: &str, record_hash: &str, cause: &ProvenanceError) {
        let marker = SealMarker::new(record_id, record_hash).with_reason(&cause.to_string());
        if let Err(err) = self.mark(JournalKind::RecordAborted, &marker) {
            tracing::warn!(record_id = %record_id, error = %err, "abort marker not written");
        }
    }

    fn write_media(&self, content_hash: &str, payload: &[u8]) -> Result<PathBuf, ProvenanceError> {
        let path = media_path(&self.media_dir, content_hash)?;
        if let Ok(existing) = fs::read(&path) {
            if canonical::hash_bytes(&existing) == content_hash {
                return Ok(path);
            }
        }
        write_atomic(&path, payload).map_err(|err| io_write_error(&path, &err))?;
        Ok(path)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for a malformed hash.
    pub fn media_path(&self, content_hash: &str) -> Result<PathBuf, ProvenanceError> {
        media_path(&self.media_dir, content_hash)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn get_evidence(&self, evidence_id: &str) -> Result<Option<EvidenceRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        Ok(select_evidence(&conn, evidence_id)?.and_then(|stored| match stored.record {
            RecordBody::Evidence(record) => Some(record),
            RecordBody::Derived(_) => None,
        }))
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn get_derived(&self, derived_id: &str) -> Result<Option<DerivedRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        Ok(select_derived(&conn, derived_id)?.and_then(|stored| match stored.record {
            RecordBody::Derived(record) => Some(record),
            RecordBody::Evidence(_) => None,
        }))
    }

    /// Edges whose parent is `record_id`.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn children_of(&self, record_id: &str) -> Result<Vec<DerivationEdge>, ProvenanceError> {
        let conn = self.conn.lock();
        select_edges(&conn, "parent_id", record_id)
    }

    /// Edges whose child is `record_id`.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn parents_of(&self, record_id: &str) -> Result<Vec<DerivationEdge>, ProvenanceError> {
        let conn = self.conn.lock();
        select_edges(&conn, "child_id", record_id)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn is_quarantined(&self, record_id: &str) -> Result<bool, ProvenanceError> {
        let conn = self.conn.lock();
        exists(
            &conn,
            "SELECT 1 FROM quarantined_records WHERE record_id = ?1",
            record_id,
        )
    }

    /// Quarantine row for exactly this id and hash.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn quarantine_entry(
        &self,
        record_id: &str,
        record_hash: &str,
    ) -> Result<Option<QuarantinedRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {QUARANTINE_COLUMNS} FROM quarantined_records
                 WHERE record_id = ?1 AND record_hash = ?2"
            ),
            params![record_id, record_hash],
            parse_quarantine_row,
        )
        .optional()
        .storage("failed to read quarantined record")
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn list_quarantined(&self) -> Result<Vec<QuarantinedRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        select_quarantined(&conn)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn counts(&self) -> Result<StoreCounts, ProvenanceError> {
        let conn = self.conn.lock();
        select_counts(&conn)
    }

    /// Writes a mutable cache entry. Never used for evidence or derived data.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for blank names and
    /// [`ProvenanceError::Storage`] on SQLite failures.
    pub fn put_replaceable(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), ProvenanceError> {
        validate_replaceable_key(namespace, key)?;
        let value_json = serde_json::to_string(value)
            .map_err(|err| ProvenanceError::Validation(format!("invalid value JSON: {err}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO replaceable_entries(namespace, entry_key, value_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, entry_key) DO UPDATE SET
               value_json = excluded.value_json,
               updated_at = excluded.updated_at",
            params![namespace, key, value_json, format_rfc3339(now_utc())?],
        )
        .storage("failed to upsert replaceable entry")?;
        Ok(())
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures or unreadable JSON.
    pub fn get_replaceable(&self, namespace: &str, key: &str) -> Result<Option<Value>, ProvenanceError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM replaceable_entries WHERE namespace = ?1 AND entry_key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()
            .storage("failed to read replaceable entry")?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|err| {
                ProvenanceError::Storage(format!("invalid stored replaceable JSON: {err}"))
            })
        })
        .transpose()
    }

    /// Returns whether an entry was removed.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn delete_replaceable(&self, namespace: &str, key: &str) -> Result<bool, ProvenanceError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM replaceable_entries WHERE namespace = ?1 AND entry_key = ?2",
                params![namespace, key],
            )
            .storage("failed to delete replaceable entry")?;
        Ok(removed > 0)
    }

    #[cfg(test)]
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.conn.lock();
        f(&*conn)
    }
}

impl RecordSource for EvidenceStore {
    fn lookup(&self, record_id: &str) -> Result<Option<StoredRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        lookup_record(&conn, record_id)
    }

    fn load_payload(&self, content_hash: &str) -> Result<Option<Vec<u8>>, ProvenanceError> {
        read_media(&self.media_dir, content_hash)
    }
}

/// Read-only view of an evidence database, for diagnostics that must not
/// take the writer role.
pub struct EvidenceCatalog {
    conn: Mutex<Connection>,
    media_dir: PathBuf,
}

impl EvidenceCatalog {
    /// # Errors
    /// Returns [`ProvenanceError::Storage`] when the database is missing or
    /// cannot be opened read-only.
    pub fn open(db_path: &Path, media_dir: &Path) -> Result<Self, ProvenanceError> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .storage(&format!(
            "failed to open sqlite database read-only at {}",
            db_path.display()
        ))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .storage("failed to configure sqlite pragmas")?;
        Ok(Self {
            conn: Mutex::new(conn),
            media_dir: media_dir.to_path_buf(),
        })
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn list_quarantined(&self) -> Result<Vec<QuarantinedRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        select_quarantined(&conn)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Storage`] on SQLite failures.
    pub fn counts(&self) -> Result<StoreCounts, ProvenanceError> {
        let conn = self.conn.lock();
        select_counts(&conn)
    }
}

impl RecordSource for EvidenceCatalog {
    fn lookup(&self, record_id: &str) -> Result<Option<StoredRecord>, ProvenanceError> {
        let conn = self.conn.lock();
        lookup_record(&conn, record_id)
    }

    fn load_payload(&self, content_hash: &str) -> Result<Option<Vec<u8>>, ProvenanceError> {
        read_media(&self.media_dir, content_hash)
    }
}

fn migrate(conn: &Connection) -> Result<(), ProvenanceError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .storage("failed to ensure schema_migrations exists")?;
    conn.execute_batch(SCHEMA_EVIDENCE_V1)
        .storage("failed to apply evidence schema")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![EVIDENCE_MIGRATION_VERSION, format_rfc3339(now_utc())?],
    )
    .storage("failed to register evidence schema migration")?;
    Ok(())
}

fn normalize_edges(
    record: &DerivedRecord,
    edges: &[DerivationEdge],
) -> Result<Vec<DerivationEdge>, ProvenanceError> {
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::with_capacity(edges.len() + 1);
    for edge in edges {
        edge.validate()?;
        if edge.parent_id != record.derived_id && edge.child_id != record.derived_id {
            return Err(ProvenanceError::Validation(format!(
                "edge {} -> {} MUST touch the submitted record {}",
                edge.parent_id, edge.child_id, record.derived_id
            )));
        }
        if seen.insert((edge.parent_id.clone(), edge.child_id.clone(), edge.relation_type)) {
            normalized.push(edge.clone());
        }
    }

    let has_parent_edge = normalized.iter().any(|edge| {
        edge.parent_id == record.parent_evidence_id && edge.child_id == record.derived_id
    });
    if !has_parent_edge {
        normalized.insert(0, record.implied_edge());
    }
    Ok(normalized)
}

/// Id freshness, parent existence, and acyclicity for a staged record.
fn check_admission(conn: &Connection, staged: &StagedRecord) -> Result<(), ProvenanceError> {
    let record_id = staged.record_id();
    if record_known(conn, record_id)? {
        return Err(ProvenanceError::ImmutabilityViolation {
            record_id: record_id.to_string(),
        });
    }

    let StagedRecord::Derived { record, edges } = staged else {
        return Ok(());
    };

    if !record_committed(conn, &record.parent_evidence_id)? {
        return Err(ProvenanceError::DanglingParent {
            parent_id: record.parent_evidence_id.clone(),
        });
    }
    for edge in edges {
        if edge.parent_id != record_id && !record_committed(conn, &edge.parent_id)? {
            return Err(ProvenanceError::DanglingParent {
                parent_id: edge.parent_id.clone(),
            });
        }
        if edge.child_id != record_id
            && !exists(
                conn,
                "SELECT 1 FROM derived_records WHERE derived_id = ?1",
                &edge.child_id,
            )?
        {
            return Err(ProvenanceError::Validation(format!(
                "edge child {} MUST be the new record or an existing derived record",
                edge.child_id
            )));
        }
    }

    check_acyclic(conn, edges)
}

/// Walks descendants of each new edge's child; reaching its parent means the
/// edge closes a loop. Earlier edges of the same batch count as existing.
fn check_acyclic(conn: &Connection, edges: &[DerivationEdge]) -> Result<(), ProvenanceError> {
    let mut stmt = conn
        .prepare("SELECT child_id FROM derivation_edges WHERE parent_id = ?1")
        .storage("failed to prepare edge walk")?;
    let mut pending: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in edges {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([edge.child_id.clone()]);
        while let Some(node) = queue.pop_front() {
            if node == edge.parent_id {
                return Err(ProvenanceError::CycleDetected {
                    parent_id: edge.parent_id.clone(),
                    child_id: edge.child_id.clone(),
                });
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            let children = stmt
                .query_map(params![node], |row| row.get::<_, String>(0))
                .storage("failed to walk derivation edges")?;
            for child in children {
                queue.push_back(child.storage("failed to read derivation edge")?);
            }
            if let Some(children) = pending.get(node.as_str()) {
                queue.extend(children.iter().map(|child| (*child).to_string()));
            }
        }
        pending
            .entry(edge.parent_id.as_str())
            .or_default()
            .push(edge.child_id.as_str());
    }
    Ok(())
}

fn transition_for(
    conn: &Connection,
    staged: &StagedRecord,
    record_hash: &str,
    stage: LedgerStage,
) -> Result<Transition, ProvenanceError> {
    let mut transition = Transition::new(stage)
        .annotate("record_id", staged.record_id())
        .annotate("record_kind", staged.kind_str());

    match staged {
        StagedRecord::Evidence { record } => {
            transition = transition.input(record.content_hash.clone());
        }
        StagedRecord::Derived { record, edges } => {
            let mut parent_hashes = BTreeSet::new();
            for edge in edges.iter().filter(|edge| edge.parent_id != record.derived_id) {
                if let Some(stored) = lookup_record(conn, &edge.parent_id)? {
                    parent_hashes.insert(stored.record_hash);
                }
            }
            for hash in parent_hashes {
                transition = transition.input(hash);
            }
            transition = transition
                .annotate("method", record.method.clone())
                .annotate("producer_identity", record.producer_identity.clone());
        }
    }
    if stage == LedgerStage::RecoveryCompleted {
        transition = transition.annotate("recovery", "replay_commit");
    }

    Ok(transition
        .output(record_hash)
        .output(staged.content_hash()))
}

fn insert_staged(
    conn: &Connection,
    staged: &StagedRecord,
    record_hash: &str,
    payload_len: u64,
    ledger_entry_id: u64,
) -> Result<(), ProvenanceError> {
    let committed_at = format_rfc3339(now_utc())?;
    let payload_len = sql_int(payload_len)?;
    let ledger_entry_id = sql_int(ledger_entry_id)?;

    match staged {
        StagedRecord::Evidence { record } => {
            conn.execute(
                &format!(
                    "INSERT INTO evidence_records({EVIDENCE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.evidence_id,
                    record.run_id.to_string(),
                    record.evidence_type.as_str(),
                    format_rfc3339(record.ts_start_utc)?,
                    format_rfc3339(record.ts_end_utc)?,
                    record.content_hash,
                    record.locator,
                    i64::from(record.schema_version),
                    record_hash,
                    payload_len,
                    ledger_entry_id,
                    committed_at,
                ],
            )
            .storage("failed to insert evidence record")?;
        }
        StagedRecord::Derived { record, edges } => {
            conn.execute(
                &format!(
                    "INSERT INTO derived_records({DERIVED_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    record.derived_id,
                    record.parent_evidence_id,
                    to_json(&record.span_ref)?,
                    record.method,
                    record.producer_identity,
                    canonical::encode_to_string(&record.parameters)?,
                    record.content_hash,
                    i64::from(record.schema_version),
                    record_hash,
                    payload_len,
                    ledger_entry_id,
                    committed_at,
                ],
            )
            .storage("failed to insert derived record")?;

            for edge in edges {
                conn.execute(
                    "INSERT INTO derivation_edges(
                        parent_id, child_id, relation_type, span_ref_json, ledger_entry_id
                     ) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        edge.parent_id,
                        edge.child_id,
                        edge.relation_type.as_str(),
                        to_json(&edge.span_ref)?,
                        ledger_entry_id,
                    ],
                )
                .storage("failed to insert derivation edge")?;
            }
        }
    }
    Ok(())
}

fn lookup_record(conn: &Connection, record_id: &str) -> Result<Option<StoredRecord>, ProvenanceError> {
    if let Some(stored) = select_evidence(conn, record_id)? {
        return Ok(Some(stored));
    }
    select_derived(conn, record_id)
}

fn select_evidence(conn: &Connection, evidence_id: &str) -> Result<Option<StoredRecord>, ProvenanceError> {
    conn.query_row(
        &format!("SELECT {EVIDENCE_COLUMNS} FROM evidence_records WHERE evidence_id = ?1"),
        params![evidence_id],
        parse_evidence_row,
    )
    .optional()
    .storage("failed to read evidence record")
}

fn select_derived(conn: &Connection, derived_id: &str) -> Result<Option<StoredRecord>, ProvenanceError> {
    conn.query_row(
        &format!("SELECT {DERIVED_COLUMNS} FROM derived_records WHERE derived_id = ?1"),
        params![derived_id],
        parse_derived_row,
    )
    .optional()
    .storage("failed to read derived record")
}

fn select_edges(
    conn: &Connection,
    column: &str,
    record_id: &str,
) -> Result<Vec<DerivationEdge>, ProvenanceError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT parent_id, child_id, relation_type, span_ref_json
             FROM derivation_edges WHERE {column} = ?1 ORDER BY edge_seq ASC"
        ))
        .storage("failed to prepare edge query")?;
    let rows = stmt
        .query_map(params![record_id], parse_edge_row)
        .storage("failed to query derivation edges")?;
    let mut edges = Vec::new();
    for row in rows {
        edges.push(row.storage("failed to read derivation edge")?);
    }
    Ok(edges)
}

fn select_quarantined(conn: &Connection) -> Result<Vec<QuarantinedRecord>, ProvenanceError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM quarantined_records ORDER BY quarantine_seq ASC"
        ))
        .storage("failed to prepare quarantine query")?;
    let rows = stmt
        .query_map([], parse_quarantine_row)
        .storage("failed to query quarantined records")?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row.storage("failed to read quarantined record")?);
    }
    Ok(records)
}

fn select_counts(conn: &Connection) -> Result<StoreCounts, ProvenanceError> {
    let count = |table: &str| -> Result<u64, ProvenanceError> {
        let raw: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .storage(&format!("failed to count {table}"))?;
        Ok(u64::try_from(raw).unwrap_or(0))
    };
    Ok(StoreCounts {
        evidence: count("evidence_records")?,
        derived: count("derived_records")?,
        edges: count("derivation_edges")?,
        quarantined: count("quarantined_records")?,
    })
}

fn record_committed(conn: &Connection, record_id: &str) -> Result<bool, ProvenanceError> {
    Ok(exists(
        conn,
        "SELECT 1 FROM evidence_records WHERE evidence_id = ?1",
        record_id,
    )? || exists(
        conn,
        "SELECT 1 FROM derived_records WHERE derived_id = ?1",
        record_id,
    )?)
}

fn record_known(conn: &Connection, record_id: &str) -> Result<bool, ProvenanceError> {
    Ok(record_committed(conn, record_id)?
        || exists(
            conn,
            "SELECT 1 FROM quarantined_records WHERE record_id = ?1",
            record_id,
        )?)
}

fn exists(conn: &Connection, sql: &str, value: &str) -> Result<bool, ProvenanceError> {
    conn.query_row(sql, params![value], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .storage("failed to check record existence")
}

fn media_path(media_dir: &Path, content_hash: &str) -> Result<PathBuf, ProvenanceError> {
    if !canonical::is_digest(content_hash) {
        return Err(ProvenanceError::Validation(
            "content_hash MUST be a lowercase hex SHA-256 digest".to_string(),
        ));
    }
    Ok(media_dir.join(&content_hash[..2]).join(content_hash))
}

fn read_media(media_dir: &Path, content_hash: &str) -> Result<Option<Vec<u8>>, ProvenanceError> {
    let path = media_path(media_dir, content_hash)?;
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_write_error(&path, &err)),
    }
}

fn validate_replaceable_key(namespace: &str, key: &str) -> Result<(), ProvenanceError> {
    if namespace.trim().is_empty() || key.trim().is_empty() {
        return Err(ProvenanceError::Validation(
            "replaceable namespace and key MUST be non-blank".to_string(),
        ));
    }
    Ok(())
}

fn sql_int(value: u64) -> Result<i64, ProvenanceError> {
    i64::try_from(value)
        .map_err(|_| ProvenanceError::Storage(format!("value {value} exceeds the sqlite integer range")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ProvenanceError> {
    Ok(canonical::encode_to_string(&canonical::to_value(value)?)?)
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn column_u64(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw).map_err(|_| invalid_column(index, Type::Integer, format!("negative value: {raw}")))
}

fn column_u32(row: &Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(index)?;
    u32::try_from(raw).map_err(|_| invalid_column(index, Type::Integer, format!("invalid u32: {raw}")))
}

fn column_time(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn column_json<T: DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn parse_evidence_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let run_id_raw: String = row.get(1)?;
    let run_id = RunId::parse(&run_id_raw)
        .map_err(|err| invalid_column(1, Type::Text, err.to_string()))?;
    let type_raw: String = row.get(2)?;
    let evidence_type = EvidenceType::parse(&type_raw)
        .ok_or_else(|| invalid_column(2, Type::Text, format!("invalid evidence_type: {type_raw}")))?;

    let record = EvidenceRecord {
        evidence_id: row.get(0)?,
        run_id,
        evidence_type,
        ts_start_utc: column_time(row, 3)?,
        ts_end_utc: column_time(row, 4)?,
        content_hash: row.get(5)?,
        locator: row.get(6)?,
        schema_version: column_u32(row, 7)?,
    };
    Ok(StoredRecord {
        record: RecordBody::Evidence(record),
        record_hash: row.get(8)?,
        payload_len: column_u64(row, 9)?,
        ledger_entry_id: column_u64(row, 10)?,
        committed_at: column_time(row, 11)?,
    })
}

fn parse_derived_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let record = DerivedRecord {
        derived_id: row.get(0)?,
        parent_evidence_id: row.get(1)?,
        span_ref: column_json::<SpanRef>(row, 2)?,
        method: row.get(3)?,
        producer_identity: row.get(4)?,
        parameters: column_json::<Value>(row, 5)?,
        content_hash: row.get(6)?,
        schema_version: column_u32(row, 7)?,
    };
    Ok(StoredRecord {
        record: RecordBody::Derived(record),
        record_hash: row.get(8)?,
        payload_len: column_u64(row, 9)?,
        ledger_entry_id: column_u64(row, 10)?,
        committed_at: column_time(row, 11)?,
    })
}

fn parse_edge_row(row: &Row<'_>) -> rusqlite::Result<DerivationEdge> {
    let relation_raw: String = row.get(2)?;
    let relation_type = RelationType::parse(&relation_raw).ok_or_else(|| {
        invalid_column(2, Type::Text, format!("invalid relation_type: {relation_raw}"))
    })?;
    Ok(DerivationEdge {
        parent_id: row.get(0)?,
        child_id: row.get(1)?,
        relation_type,
        span_ref: column_json::<SpanRef>(row, 3)?,
    })
}

fn parse_quarantine_row(row: &Row<'_>) -> rusqlite::Result<QuarantinedRecord> {
    let reason_raw: String = row.get(3)?;
    let reason = QuarantineReason::parse(&reason_raw)
        .ok_or_else(|| invalid_column(3, Type::Text, format!("invalid reason: {reason_raw}")))?;
    Ok(QuarantinedRecord {
        record_id: row.get(0)?,
        record_kind: row.get(1)?,
        record_hash: row.get(2)?,
        reason,
        ledger_entry_id: column_u64(row, 4)?,
        quarantined_at: column_time(row, 5)?,
    })
}
