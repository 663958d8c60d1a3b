//! Domain records, identifiers, and the error taxonomy of the evidence and
//! provenance engine. Nothing in this crate performs I/O.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod canonical;
pub mod config;

pub use canonical::EncodingError;
pub use config::{
    AnchorPolicy, DurabilityTier, EngineConfig, HealthConfig, JournalPolicy, PolicyConfig,
    SEAL_STREAM,
};

/// Current on-disk version for every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

/// `prev_hash` of the first ledger entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const MAX_IDENTIFIER_LEN: usize = 256;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProvenanceError {
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("immutability violation: record {record_id} already exists and cannot be replaced or removed")]
    ImmutabilityViolation { record_id: String },
    #[error("derivation cycle detected: edge {parent_id} -> {child_id} closes a loop")]
    CycleDetected { parent_id: String, child_id: String },
    #[error("dangling parent: {parent_id} does not exist")]
    DanglingParent { parent_id: String },
    #[error("write error on {target}: {message}")]
    Write { target: String, message: String },
    #[error("chain break at ledger entry {entry_id}: {details}")]
    ChainBreak { entry_id: u64, details: String },
    #[error("anchor {anchor_seq} failed verification: {details}")]
    AnchorMismatch { anchor_seq: u64, details: String },
    #[error("anchor domain unavailable: {0}")]
    AnchorUnavailable(String),
    #[error("record {record_id} quarantined: {reason}")]
    ReconciliationQuarantine { record_id: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl ProvenanceError {
    /// Durability failures feed the engine health counter.
    #[must_use]
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Storage(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID string.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ProvenanceError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ProvenanceError::Validation(format!("invalid run_id `{value}`: {err}")))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    ScreenFrame,
    AudioSegment,
    InputEvent,
    WindowContext,
    Document,
}

impl EvidenceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScreenFrame => "screen_frame",
            Self::AudioSegment => "audio_segment",
            Self::InputEvent => "input_event",
            Self::WindowContext => "window_context",
            Self::Document => "document",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "screen_frame" => Some(Self::ScreenFrame),
            "audio_segment" => Some(Self::AudioSegment),
            "input_event" => Some(Self::InputEvent),
            "window_context" => Some(Self::WindowContext),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    DerivedFrom,
    Summarizes,
    References,
}

impl RelationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DerivedFrom => "derived_from",
            Self::Summarizes => "summarizes",
            Self::References => "references",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "derived_from" => Some(Self::DerivedFrom),
            "summarizes" => Some(Self::Summarizes),
            "references" => Some(Self::References),
            _ => None,
        }
    }
}

/// Closed set of journal entry kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    CaptureEvent,
    ExtractionEvent,
    QueryEvent,
    EgressEvent,
    Diagnostic,
    RecordStaged,
    MediaStaged,
    RecordCommitted,
    RecordQuarantined,
    RecordAborted,
    RunStarted,
    RunStopped,
}

impl JournalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaptureEvent => "capture_event",
            Self::ExtractionEvent => "extraction_event",
            Self::QueryEvent => "query_event",
            Self::EgressEvent => "egress_event",
            Self::Diagnostic => "diagnostic",
            Self::RecordStaged => "record_staged",
            Self::MediaStaged => "media_staged",
            Self::RecordCommitted => "record_committed",
            Self::RecordQuarantined => "record_quarantined",
            Self::RecordAborted => "record_aborted",
            Self::RunStarted => "run_started",
            Self::RunStopped => "run_stopped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "capture_event" => Some(Self::CaptureEvent),
            "extraction_event" => Some(Self::ExtractionEvent),
            "query_event" => Some(Self::QueryEvent),
            "egress_event" => Some(Self::EgressEvent),
            "diagnostic" => Some(Self::Diagnostic),
            "record_staged" => Some(Self::RecordStaged),
            "media_staged" => Some(Self::MediaStaged),
            "record_committed" => Some(Self::RecordCommitted),
            "record_quarantined" => Some(Self::RecordQuarantined),
            "record_aborted" => Some(Self::RecordAborted),
            "run_started" => Some(Self::RunStarted),
            "run_stopped" => Some(Self::RunStopped),
            _ => None,
        }
    }

    /// Markers that close a staged write.
    #[must_use]
    pub fn is_terminal_marker(self) -> bool {
        matches!(
            self,
            Self::RecordCommitted | Self::RecordQuarantined | Self::RecordAborted
        )
    }
}

/// State transitions recorded in the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LedgerStage {
    #[serde(rename = "capture.committed")]
    CaptureCommitted,
    #[serde(rename = "artifact.derived")]
    ArtifactDerived,
    #[serde(rename = "query.executed")]
    QueryExecuted,
    #[serde(rename = "egress.sent")]
    EgressSent,
    #[serde(rename = "key.rotated")]
    KeyRotated,
    #[serde(rename = "system.start")]
    SystemStart,
    #[serde(rename = "system.stop")]
    SystemStop,
    #[serde(rename = "system.crash_detected")]
    SystemCrashDetected,
    #[serde(rename = "recovery.completed")]
    RecoveryCompleted,
    #[serde(rename = "recovery.quarantined")]
    RecoveryQuarantined,
}

impl LedgerStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaptureCommitted => "capture.committed",
            Self::ArtifactDerived => "artifact.derived",
            Self::QueryExecuted => "query.executed",
            Self::EgressSent => "egress.sent",
            Self::KeyRotated => "key.rotated",
            Self::SystemStart => "system.start",
            Self::SystemStop => "system.stop",
            Self::SystemCrashDetected => "system.crash_detected",
            Self::RecoveryCompleted => "recovery.completed",
            Self::RecoveryQuarantined => "recovery.quarantined",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "capture.committed" => Some(Self::CaptureCommitted),
            "artifact.derived" => Some(Self::ArtifactDerived),
            "query.executed" => Some(Self::QueryExecuted),
            "egress.sent" => Some(Self::EgressSent),
            "key.rotated" => Some(Self::KeyRotated),
            "system.start" => Some(Self::SystemStart),
            "system.stop" => Some(Self::SystemStop),
            "system.crash_detected" => Some(Self::SystemCrashDetected),
            "recovery.completed" => Some(Self::RecoveryCompleted),
            "recovery.quarantined" => Some(Self::RecoveryQuarantined),
            _ => None,
        }
    }

    /// Stages that producers outside the engine may record directly.
    #[must_use]
    pub fn is_external(self) -> bool {
        matches!(self, Self::QueryExecuted | Self::EgressSent | Self::KeyRotated)
    }
}

/// Addressable range inside a record.
///
/// `Bytes` is a half-open range over payload bytes. `TimeMs` is a half-open
/// range of millisecond offsets from the root evidence's start time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpanRef {
    Whole,
    Bytes { start: u64, end: u64 },
    TimeMs { start_ms: u64, end_ms: u64 },
}

impl SpanRef {
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] when `start > end`.
    pub fn validate(&self) -> Result<(), ProvenanceError> {
        match *self {
            Self::Whole => Ok(()),
            Self::Bytes { start, end } | Self::TimeMs { start_ms: start, end_ms: end } => {
                if start > end {
                    return Err(ProvenanceError::Validation(format!(
                        "span start {start} MUST NOT exceed end {end}"
                    )));
                }
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn fits(&self, payload_len: u64, duration_ms: u64) -> bool {
        match *self {
            Self::Whole => true,
            Self::Bytes { start, end } => start <= end && end <= payload_len,
            Self::TimeMs { start_ms, end_ms } => start_ms <= end_ms && end_ms <= duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub run_id: RunId,
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    #[serde(with = "utc_timestamp")]
    pub ts_start_utc: OffsetDateTime,
    #[serde(with = "utc_timestamp")]
    pub ts_end_utc: OffsetDateTime,
    pub content_hash: String,
    pub locator: String,
    pub schema_version: u32,
}

impl EvidenceRecord {
    /// Validates required fields before admission.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for the first missing or
    /// malformed field.
    pub fn validate(&self) -> Result<(), ProvenanceError> {
        validate_identifier("evidence_id", &self.evidence_id)?;
        validate_digest("content_hash", &self.content_hash)?;
        validate_schema_version(self.schema_version)?;
        if self.locator.trim().is_empty() {
            return Err(ProvenanceError::Validation(
                "locator MUST be provided for every evidence record".to_string(),
            ));
        }
        if self.ts_end_utc < self.ts_start_utc {
            return Err(ProvenanceError::Validation(
                "ts_end_utc MUST NOT precede ts_start_utc".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical hash of the metadata, distinct from `content_hash`.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the record is not canonicalizable.
    pub fn record_hash(&self) -> Result<String, ProvenanceError> {
        Ok(canonical::hash_serializable(self)?)
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let millis = (self.ts_end_utc - self.ts_start_utc).whole_milliseconds();
        u64::try_from(millis).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DerivedRecord {
    pub derived_id: String,
    pub parent_evidence_id: String,
    pub span_ref: SpanRef,
    pub method: String,
    pub producer_identity: String,
    pub parameters: Value,
    pub content_hash: String,
    pub schema_version: u32,
}

impl DerivedRecord {
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for missing fields and
    /// [`ProvenanceError::CycleDetected`] when the record names itself as parent.
    pub fn validate(&self) -> Result<(), ProvenanceError> {
        validate_identifier("derived_id", &self.derived_id)?;
        validate_identifier("parent_evidence_id", &self.parent_evidence_id)?;
        validate_digest("content_hash", &self.content_hash)?;
        validate_schema_version(self.schema_version)?;
        self.span_ref.validate()?;
        if self.method.trim().is_empty() {
            return Err(ProvenanceError::Validation(
                "method MUST be provided for every derived record".to_string(),
            ));
        }
        if self.producer_identity.trim().is_empty() {
            return Err(ProvenanceError::Validation(
                "producer_identity MUST be provided for every derived record".to_string(),
            ));
        }
        if !self.parameters.is_object() {
            return Err(ProvenanceError::Validation(
                "parameters MUST be a JSON object".to_string(),
            ));
        }
        if self.parent_evidence_id == self.derived_id {
            return Err(ProvenanceError::CycleDetected {
                parent_id: self.parent_evidence_id.clone(),
                child_id: self.derived_id.clone(),
            });
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when `parameters` is not canonicalizable.
    pub fn record_hash(&self) -> Result<String, ProvenanceError> {
        Ok(canonical::hash_serializable(self)?)
    }

    /// Edge implied by `parent_evidence_id` when a caller supplies none.
    #[must_use]
    pub fn implied_edge(&self) -> DerivationEdge {
        DerivationEdge {
            parent_id: self.parent_evidence_id.clone(),
            child_id: self.derived_id.clone(),
            relation_type: RelationType::DerivedFrom,
            span_ref: self.span_ref,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DerivationEdge {
    pub parent_id: String,
    pub child_id: String,
    pub relation_type: RelationType,
    pub span_ref: SpanRef,
}

impl DerivationEdge {
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for malformed ids or spans and
    /// [`ProvenanceError::CycleDetected`] for a self-loop.
    pub fn validate(&self) -> Result<(), ProvenanceError> {
        validate_identifier("parent_id", &self.parent_id)?;
        validate_identifier("child_id", &self.child_id)?;
        self.span_ref.validate()?;
        if self.parent_id == self.child_id {
            return Err(ProvenanceError::CycleDetected {
                parent_id: self.parent_id.clone(),
                child_id: self.child_id.clone(),
            });
        }
        Ok(())
    }
}

/// A record as it travels through staging markers and replay.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "record_kind", rename_all = "snake_case")]
pub enum StagedRecord {
    Evidence {
        record: EvidenceRecord,
    },
    Derived {
        record: DerivedRecord,
        edges: Vec<DerivationEdge>,
    },
}

impl StagedRecord {
    #[must_use]
    pub fn record_id(&self) -> &str {
        match self {
            Self::Evidence { record } => &record.evidence_id,
            Self::Derived { record, .. } => &record.derived_id,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        match self {
            Self::Evidence { record } => &record.content_hash,
            Self::Derived { record, .. } => &record.content_hash,
        }
    }

    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Evidence { .. } => "evidence",
            Self::Derived { .. } => "derived",
        }
    }

    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when the record is not canonicalizable.
    pub fn record_hash(&self) -> Result<String, ProvenanceError> {
        match self {
            Self::Evidence { record } => record.record_hash(),
            Self::Derived { record, .. } => record.record_hash(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JournalEntry {
    pub stream_id: String,
    pub sequence: u64,
    #[serde(with = "utc_timestamp")]
    pub ts_utc: OffsetDateTime,
    pub kind: JournalKind,
    pub payload: Value,
    pub run_id: RunId,
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerEntry {
    pub entry_id: u64,
    pub run_id: RunId,
    #[serde(with = "utc_timestamp")]
    pub ts_utc: OffsetDateTime,
    pub stage: LedgerStage,
    pub input_hashes: Vec<String>,
    pub output_hashes: Vec<String>,
    pub policy_hash: String,
    pub annotations: BTreeMap<String, String>,
    pub prev_hash: String,
    pub entry_hash: String,
    pub schema_version: u32,
}

impl LedgerEntry {
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn references(&self, hash: &str) -> bool {
        self.output_hashes.iter().any(|value| value == hash)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerHead {
    pub entry_id: u64,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnchorRecord {
    pub anchor_seq: u64,
    #[serde(with = "utc_timestamp")]
    pub ts_utc: OffsetDateTime,
    pub ledger_head_entry_id: u64,
    pub ledger_head_hash: String,
    pub key_id: String,
    pub signature: String,
    pub schema_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Citation {
    pub evidence_id: String,
    pub evidence_hash: String,
    pub span_ref: SpanRef,
    pub ledger_entry_ref: u64,
    #[serde(default)]
    pub anchor_ref: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionDetail {
    Verified,
    HashMismatch,
    SpanOutOfRange,
    ChainBreak,
    AnchorUncovered,
    NotFound,
}

impl ResolutionDetail {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::HashMismatch => "hash_mismatch",
            Self::SpanOutOfRange => "span_out_of_range",
            Self::ChainBreak => "chain_break",
            Self::AnchorUncovered => "anchor_uncovered",
            Self::NotFound => "not_found",
        }
    }
}

/// Why recovery refused to replay a staged record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    MetadataHashMismatch,
    MediaMissing,
    MediaHashMismatch,
    IdConflict,
    DanglingParent,
    CycleDetected,
    InvalidRecord,
}

impl QuarantineReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetadataHashMismatch => "metadata_hash_mismatch",
            Self::MediaMissing => "media_missing",
            Self::MediaHashMismatch => "media_hash_mismatch",
            Self::IdConflict => "id_conflict",
            Self::DanglingParent => "dangling_parent",
            Self::CycleDetected => "cycle_detected",
            Self::InvalidRecord => "invalid_record",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "metadata_hash_mismatch" => Some(Self::MetadataHashMismatch),
            "media_missing" => Some(Self::MediaMissing),
            "media_hash_mismatch" => Some(Self::MediaHashMismatch),
            "id_conflict" => Some(Self::IdConflict),
            "dangling_parent" => Some(Self::DanglingParent),
            "cycle_detected" => Some(Self::CycleDetected),
            "invalid_record" => Some(Self::InvalidRecord),
            _ => None,
        }
    }

    /// Maps an admission failure during replay onto a quarantine reason.
    #[must_use]
    pub fn from_admission_error(err: &ProvenanceError) -> Self {
        match err {
            ProvenanceError::ImmutabilityViolation { .. } => Self::IdConflict,
            ProvenanceError::DanglingParent { .. } => Self::DanglingParent,
            ProvenanceError::CycleDetected { .. } => Self::CycleDetected,
            _ => Self::InvalidRecord,
        }
    }
}

/// Outcome of re-verifying a citation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub ok: bool,
    pub detail: ResolutionDetail,
    pub reason: Option<String>,
}

impl Resolution {
    #[must_use]
    pub fn verified() -> Self {
        Self {
            ok: true,
            detail: ResolutionDetail::Verified,
            reason: None,
        }
    }

    #[must_use]
    pub fn failed(detail: ResolutionDetail, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordReceipt {
    pub record_id: String,
    pub content_hash: String,
    pub record_hash: String,
    pub ledger_entry_id: u64,
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`ProvenanceError::Validation`] when parsing fails or the offset is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProvenanceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProvenanceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProvenanceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC and truncating to
/// microseconds.
///
/// # Errors
/// Returns [`ProvenanceError::Validation`] if formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProvenanceError> {
    normalize_timestamp(value)?
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProvenanceError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// # Errors
/// Returns [`ProvenanceError::Validation`] if the truncated value is out of range.
pub fn normalize_timestamp(value: OffsetDateTime) -> Result<OffsetDateTime, ProvenanceError> {
    let utc = value.to_offset(UtcOffset::UTC);
    utc.replace_nanosecond(utc.nanosecond() / 1_000 * 1_000)
        .map_err(|err| ProvenanceError::Validation(format!("invalid timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    normalize_timestamp(now).unwrap_or(now)
}

/// Serde adapter writing timestamps in the normalized RFC3339 form.
pub mod utc_timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Fails when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted =
            super::format_rfc3339(*value).map_err(<S::Error as serde::ser::Error>::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails when the string is not an RFC3339 UTC timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let parsed =
            super::parse_rfc3339_utc(&raw).map_err(<D::Error as serde::de::Error>::custom)?;
        super::normalize_timestamp(parsed).map_err(<D::Error as serde::de::Error>::custom)
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ProvenanceError> {
    if value.trim().is_empty() {
        return Err(ProvenanceError::Validation(format!(
            "{field} MUST be provided"
        )));
    }
    if value.len() > MAX_IDENTIFIER_LEN
        || value.trim() != value
        || value.chars().any(char::is_control)
    {
        return Err(ProvenanceError::Validation(format!(
            "{field} MUST be at most {MAX_IDENTIFIER_LEN} bytes without surrounding whitespace or control characters"
        )));
    }
    Ok(())
}

fn validate_digest(field: &str, value: &str) -> Result<(), ProvenanceError> {
    if !canonical::is_digest(value) {
        return Err(ProvenanceError::Validation(format!(
            "{field} MUST be a lowercase hex SHA-256 digest"
        )));
    }
    Ok(())
}

fn validate_schema_version(version: u32) -> Result<(), ProvenanceError> {
    if version == 0 || version > SCHEMA_VERSION {
        return Err(ProvenanceError::Validation(format!(
            "unsupported schema_version {version}; this build reads 1..={SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_run_id() -> RunId {
        must_ok(RunId::parse("01J0SQQP7M70P6Y3R4T8D8G8M2"))
    }

    fn fixture_evidence() -> EvidenceRecord {
        EvidenceRecord {
            evidence_id: "ev-1".to_string(),
            run_id: fixture_run_id(),
            evidence_type: EvidenceType::ScreenFrame,
            ts_start_utc: must_utc("2026-02-07T12:00:00Z"),
            ts_end_utc: must_utc("2026-02-07T12:00:02Z"),
            content_hash: canonical::hash_bytes(b"frame"),
            locator: "screen://display-1/frame/1".to_string(),
            schema_version: SCHEMA_VERSION,
        }
    }

    fn fixture_derived() -> DerivedRecord {
        DerivedRecord {
            derived_id: "ocr-1".to_string(),
            parent_evidence_id: "ev-1".to_string(),
            span_ref: SpanRef::Bytes { start: 0, end: 5 },
            method: "ocr".to_string(),
            producer_identity: "ocr-engine@1".to_string(),
            parameters: json!({"lang": "en"}),
            content_hash: canonical::hash_bytes(b"text"),
            schema_version: SCHEMA_VERSION,
        }
    }

    #[test]
    fn evidence_validation_accepts_fixture() {
        must_ok(fixture_evidence().validate());
    }

    #[test]
    fn evidence_validation_rejects_missing_fields() {
        let mut record = fixture_evidence();
        record.evidence_id = "  ".to_string();
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));

        let mut record = fixture_evidence();
        record.locator = String::new();
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));

        let mut record = fixture_evidence();
        record.content_hash = "not-a-digest".to_string();
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));

        let mut record = fixture_evidence();
        record.ts_end_utc = must_utc("2026-02-07T11:59:59Z");
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));

        let mut record = fixture_evidence();
        record.schema_version = SCHEMA_VERSION + 1;
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));
    }

    #[test]
    fn record_hash_is_stable_across_serde_round_trip() {
        let record = fixture_evidence();
        let encoded = must_ok(serde_json::to_string(&record));
        let decoded: EvidenceRecord = must_ok(serde_json::from_str(&encoded));
        assert_eq!(decoded, record);
        assert_eq!(must_ok(decoded.record_hash()), must_ok(record.record_hash()));
        assert_ne!(must_ok(record.record_hash()), record.content_hash);
    }

    #[test]
    fn evidence_serializes_type_field_and_utc_timestamps() {
        let value = must_ok(serde_json::to_value(fixture_evidence()));
        assert_eq!(value["type"], json!("screen_frame"));
        assert_eq!(value["ts_start_utc"], json!("2026-02-07T12:00:00Z"));
    }

    #[test]
    fn timestamps_are_normalized_to_utc_micros() {
        let offset = must_ok(OffsetDateTime::parse(
            "2026-02-07T14:00:00.123456789+02:00",
            &time::format_description::well_known::Rfc3339,
        ));
        let formatted = must_ok(format_rfc3339(offset));
        assert_eq!(formatted, "2026-02-07T12:00:00.123456Z");
        assert!(parse_rfc3339_utc("2026-02-07T14:00:00+02:00").is_err());
    }

    #[test]
    fn derived_validation_rejects_self_parent_and_bad_parameters() {
        let mut record = fixture_derived();
        record.parent_evidence_id = record.derived_id.clone();
        assert!(matches!(
            record.validate(),
            Err(ProvenanceError::CycleDetected { .. })
        ));

        let mut record = fixture_derived();
        record.parameters = json!([1, 2]);
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));

        let mut record = fixture_derived();
        record.span_ref = SpanRef::Bytes { start: 9, end: 2 };
        assert!(matches!(record.validate(), Err(ProvenanceError::Validation(_))));
    }

    #[test]
    fn derived_parameters_with_floats_cannot_be_hashed() {
        let mut record = fixture_derived();
        record.parameters = json!({"threshold": 0.75});
        assert!(matches!(
            record.record_hash(),
            Err(ProvenanceError::Encoding(EncodingError::FloatNotAllowed { .. }))
        ));
    }

    #[test]
    fn implied_edge_points_from_parent_evidence() {
        let edge = fixture_derived().implied_edge();
        assert_eq!(edge.parent_id, "ev-1");
        assert_eq!(edge.child_id, "ocr-1");
        assert_eq!(edge.relation_type, RelationType::DerivedFrom);
        must_ok(edge.validate());
    }

    #[test]
    fn span_fit_checks_bounds() {
        assert!(SpanRef::Whole.fits(0, 0));
        assert!(SpanRef::Bytes { start: 0, end: 5 }.fits(5, 0));
        assert!(!SpanRef::Bytes { start: 0, end: 6 }.fits(5, 0));
        assert!(SpanRef::TimeMs { start_ms: 500, end_ms: 2_000 }.fits(0, 2_000));
        assert!(!SpanRef::TimeMs { start_ms: 0, end_ms: 2_001 }.fits(0, 2_000));
        assert_eq!(fixture_evidence().duration_ms(), 2_000);
    }

    #[test]
    fn staged_record_is_tagged_by_kind() {
        let staged = StagedRecord::Derived {
            record: fixture_derived(),
            edges: vec![fixture_derived().implied_edge()],
        };
        let value = must_ok(serde_json::to_value(&staged));
        assert_eq!(value["record_kind"], json!("derived"));
        let decoded: StagedRecord = must_ok(serde_json::from_value(value));
        assert_eq!(decoded.record_id(), "ocr-1");
        assert_eq!(must_ok(decoded.record_hash()), must_ok(fixture_derived().record_hash()));
    }

    #[test]
    fn ledger_stage_wire_names_round_trip() {
        for stage in [
            LedgerStage::CaptureCommitted,
            LedgerStage::ArtifactDerived,
            LedgerStage::QueryExecuted,
            LedgerStage::EgressSent,
            LedgerStage::KeyRotated,
            LedgerStage::SystemStart,
            LedgerStage::SystemStop,
            LedgerStage::SystemCrashDetected,
            LedgerStage::RecoveryCompleted,
            LedgerStage::RecoveryQuarantined,
        ] {
            let value = must_ok(serde_json::to_value(stage));
            assert_eq!(value, json!(stage.as_str()));
            assert_eq!(LedgerStage::parse(stage.as_str()), Some(stage));
        }
        assert!(LedgerStage::QueryExecuted.is_external());
        assert!(!LedgerStage::SystemStop.is_external());
    }

    #[test]
    fn quarantine_reasons_follow_admission_errors() {
        assert_eq!(
            QuarantineReason::from_admission_error(&ProvenanceError::DanglingParent {
                parent_id: "ev-9".to_string()
            }),
            QuarantineReason::DanglingParent
        );
        assert_eq!(
            QuarantineReason::from_admission_error(&ProvenanceError::Validation(String::new())),
            QuarantineReason::InvalidRecord
        );
        assert_eq!(
            QuarantineReason::parse(QuarantineReason::MediaHashMismatch.as_str()),
            Some(QuarantineReason::MediaHashMismatch)
        );
        assert_eq!(
            must_ok(serde_json::to_value(QuarantineReason::IdConflict)),
            json!("id_conflict")
        );
    }

    #[test]
    fn journal_kind_terminal_markers() {
        assert!(JournalKind::RecordCommitted.is_terminal_marker());
        assert!(JournalKind::RecordAborted.is_terminal_marker());
        assert!(!JournalKind::MediaStaged.is_terminal_marker());
        assert_eq!(JournalKind::parse("media_staged"), Some(JournalKind::MediaStaged));
    }
}
